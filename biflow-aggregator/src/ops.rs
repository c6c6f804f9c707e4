//! Per-field aggregation operators and their state.
//!
//! Every configured output field carries one operator. At binding time the
//! operator and the field's element type are captured in an [`Aggregator`],
//! which knows how to create a fresh [`FieldState`], fold one record's value
//! into it, and turn the accumulated state into an output value. A flow's
//! state block is simply a vector of `FieldState` in configuration order, so
//! dispatch is a match on the state variant rather than a function pointer
//! into an untyped byte region.
//!
//! The operator/type matrix collapses into [`Scalar`] arithmetic: the binding
//! layer guarantees that combine always sees the kind the state was
//! initialised with, so no arm here needs a conversion rule.

use crate::types::{ElemKind, FieldKind, Scalar};

/// Sort direction for the sorted-merge operators.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Smallest sort key first.
    #[default]
    Ascending,
    /// Largest sort key first.
    Descending,
}

impl SortOrder {
    /// Parses the configuration spelling.
    pub fn parse(name: &str) -> Option<SortOrder> {
        match name {
            "ASCENDING" => Some(SortOrder::Ascending),
            "DESCENDING" => Some(SortOrder::Descending),
            _ => None,
        }
    }
}

/// The aggregation operator of one configured field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldOp {
    /// The field is part of the flow key.
    Key,
    /// Accumulating sum; integers wrap.
    Sum,
    /// Sum and count; the output divides in the element's own type, so
    /// integer averages truncate.
    Avg,
    /// Smallest value seen; the state starts at the type's maximum.
    Min,
    /// Largest value seen; the state starts at the type's zero, so a run of
    /// exclusively negative values reports zero.
    Max,
    /// Bitwise AND; the first write initialises.
    BitAnd,
    /// Bitwise OR from zero.
    BitOr,
    /// First value seen.
    First,
    /// First value whose scalar is non-zero, or string non-empty.
    FirstNonEmpty,
    /// Last value seen.
    Last,
    /// Last value whose scalar is non-zero, or string non-empty.
    LastNonEmpty,
    /// Element-wise append, bounded by the configured limit.
    Append,
    /// Collect `(value, sort key)` pairs; the output is sorted and bounded.
    SortedMerge,
    /// As `SortedMerge`, with values negated when their record arrived
    /// against the canonical direction. Signed element types only.
    SortedMergeDir,
}

impl FieldOp {
    /// Parses the configuration spelling of an operator.
    pub fn parse(name: &str) -> Option<FieldOp> {
        Some(match name {
            "KEY" => FieldOp::Key,
            "SUM" => FieldOp::Sum,
            "AVG" => FieldOp::Avg,
            "MIN" => FieldOp::Min,
            "MAX" => FieldOp::Max,
            "BITAND" => FieldOp::BitAnd,
            "BITOR" => FieldOp::BitOr,
            "FIRST" => FieldOp::First,
            "FIRST_NON_EMPTY" => FieldOp::FirstNonEmpty,
            "LAST" => FieldOp::Last,
            "LAST_NON_EMPTY" => FieldOp::LastNonEmpty,
            "APPEND" => FieldOp::Append,
            "SORTED_MERGE" => FieldOp::SortedMerge,
            "SORTED_MERGE_DIR" => FieldOp::SortedMergeDir,
            _ => return None,
        })
    }

    /// The configuration spelling of this operator.
    pub fn name(self) -> &'static str {
        match self {
            FieldOp::Key => "KEY",
            FieldOp::Sum => "SUM",
            FieldOp::Avg => "AVG",
            FieldOp::Min => "MIN",
            FieldOp::Max => "MAX",
            FieldOp::BitAnd => "BITAND",
            FieldOp::BitOr => "BITOR",
            FieldOp::First => "FIRST",
            FieldOp::FirstNonEmpty => "FIRST_NON_EMPTY",
            FieldOp::Last => "LAST",
            FieldOp::LastNonEmpty => "LAST_NON_EMPTY",
            FieldOp::Append => "APPEND",
            FieldOp::SortedMerge => "SORTED_MERGE",
            FieldOp::SortedMergeDir => "SORTED_MERGE_DIR",
        }
    }

    /// True when this operator needs a sort key.
    #[inline]
    pub fn is_sorted_merge(self) -> bool {
        matches!(self, FieldOp::SortedMerge | FieldOp::SortedMergeDir)
    }

    /// Whether this operator accepts a value field of the given shape.
    pub fn accepts_value(self, kind: FieldKind) -> bool {
        match self {
            FieldOp::Key => matches!(kind, FieldKind::Scalar(_) | FieldKind::String),
            FieldOp::Sum | FieldOp::Avg => {
                matches!(kind, FieldKind::Scalar(elem) if elem.is_numeric())
            }
            FieldOp::Min | FieldOp::Max => matches!(
                kind,
                FieldKind::Scalar(elem)
                    if elem.is_numeric() || matches!(elem, ElemKind::Time | ElemKind::Ip | ElemKind::Mac)
            ),
            FieldOp::First | FieldOp::FirstNonEmpty | FieldOp::Last | FieldOp::LastNonEmpty => {
                matches!(kind, FieldKind::Scalar(_) | FieldKind::String)
            }
            FieldOp::BitAnd | FieldOp::BitOr => {
                matches!(kind, FieldKind::Scalar(elem) if elem.is_integer())
            }
            FieldOp::Append => {
                kind == FieldKind::String
                    || matches!(kind, FieldKind::Array(elem) if elem != ElemKind::Char)
            }
            FieldOp::SortedMerge => matches!(kind, FieldKind::Array(elem) if elem != ElemKind::Char),
            FieldOp::SortedMergeDir => {
                matches!(kind, FieldKind::Array(elem) if elem.is_signed())
            }
        }
    }

    /// Whether this operator accepts a sort-key field of the given shape.
    pub fn accepts_sort_key(self, kind: FieldKind) -> bool {
        self.is_sorted_merge() && matches!(kind, FieldKind::Array(elem) if elem != ElemKind::Char)
    }
}

/// The accumulated state of one aggregation field within one flow.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldState {
    /// A single running value: SUM, MIN, MAX, LAST, LAST_NON_EMPTY, BITOR.
    Basic(Scalar),
    /// A value plus a written-yet flag: FIRST, FIRST_NON_EMPTY, BITAND.
    Flagged {
        /// The stored value.
        value: Scalar,
        /// Whether the value has been written.
        set: bool,
    },
    /// Accumulator and contribution count for AVG.
    Average {
        /// The running sum.
        sum: Scalar,
        /// Number of contributions.
        count: u32,
    },
    /// An owned byte string plus a written-yet flag, for the FIRST/LAST
    /// family over strings.
    Text {
        /// The stored bytes.
        data: Vec<u8>,
        /// Whether the bytes have been written.
        set: bool,
    },
    /// A bounded element sequence for APPEND over arrays.
    Append(Vec<Scalar>),
    /// A bounded, delimited byte sequence for APPEND over strings.
    TextAppend(Vec<u8>),
    /// Pending `(value, sort key)` pairs plus the finalised result buffer for
    /// the sorted-merge operators.
    Merge {
        /// Pairs in ingestion order.
        pairs: Vec<(Scalar, Scalar)>,
        /// Sorted, truncated values; filled by finalize.
        result: Vec<Scalar>,
    },
}

/// One record's contribution to a single field.
pub enum FieldSource<'a> {
    /// A scalar value.
    Scalar(Scalar),
    /// A string field's bytes.
    Text(&'a [u8]),
    /// An array field's elements.
    Elems(&'a [Scalar]),
    /// `(value, sort key)` pairs for the sorted-merge operators, plus whether
    /// the contributing record ran against the canonical direction.
    Pairs(&'a [(Scalar, Scalar)], bool),
}

/// The finalised output of one field.
pub enum FieldOutput<'a> {
    /// A scalar output.
    Scalar(Scalar),
    /// A string output.
    Bytes(&'a [u8]),
    /// An array output.
    Array(&'a [Scalar]),
}

/// Upper bound on the capacity reserved eagerly for sequence states.
const RESERVE_CAP: usize = 1024;

/// A bound aggregation operator: the op plus everything type- and
/// configuration-specific needed to run its state.
#[derive(Clone, Debug)]
pub struct Aggregator {
    op: FieldOp,
    kind: FieldKind,
    limit: usize,
    delimiter: u8,
    order: SortOrder,
}

impl Aggregator {
    /// Binds an operator to a value shape and its sequence configuration.
    ///
    /// The caller has already checked `op.accepts_value(kind)`.
    pub fn new(op: FieldOp, kind: FieldKind, limit: usize, delimiter: u8, order: SortOrder) -> Aggregator {
        debug_assert!(op.accepts_value(kind), "{} bound to incompatible {}", op.name(), kind);
        Aggregator { op, kind, limit, delimiter, order }
    }

    /// The operator.
    #[inline]
    pub fn op(&self) -> FieldOp {
        self.op
    }

    /// The value shape the operator was bound to.
    #[inline]
    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// A fresh state for one flow.
    pub fn new_state(&self) -> FieldState {
        match (self.op, self.kind) {
            (FieldOp::Min, FieldKind::Scalar(elem)) => FieldState::Basic(Scalar::max_value(elem)),
            (
                FieldOp::Sum | FieldOp::Max | FieldOp::BitOr | FieldOp::Last | FieldOp::LastNonEmpty,
                FieldKind::Scalar(elem),
            ) => FieldState::Basic(Scalar::zero(elem)),
            (FieldOp::Avg, FieldKind::Scalar(elem)) => {
                FieldState::Average { sum: Scalar::zero(elem), count: 0 }
            }
            (FieldOp::BitAnd | FieldOp::First | FieldOp::FirstNonEmpty, FieldKind::Scalar(elem)) => {
                FieldState::Flagged { value: Scalar::zero(elem), set: false }
            }
            (
                FieldOp::First | FieldOp::FirstNonEmpty | FieldOp::Last | FieldOp::LastNonEmpty,
                FieldKind::String,
            ) => FieldState::Text { data: Vec::new(), set: false },
            (FieldOp::Append, FieldKind::String) => {
                FieldState::TextAppend(Vec::with_capacity(self.limit.min(RESERVE_CAP)))
            }
            (FieldOp::Append, FieldKind::Array(_)) => {
                FieldState::Append(Vec::with_capacity(self.limit.min(RESERVE_CAP)))
            }
            (FieldOp::SortedMerge | FieldOp::SortedMergeDir, FieldKind::Array(_)) => FieldState::Merge {
                pairs: Vec::new(),
                result: Vec::with_capacity(self.limit.min(RESERVE_CAP)),
            },
            (op, kind) => panic!("no state for {} over {}", op.name(), kind),
        }
    }

    /// Resets a state in place for reuse by the next flow, keeping any buffer
    /// capacity it has grown.
    pub fn reset(&self, state: &mut FieldState) {
        match state {
            FieldState::Basic(value) => {
                *value = match (self.op, self.kind) {
                    (FieldOp::Min, FieldKind::Scalar(elem)) => Scalar::max_value(elem),
                    (_, FieldKind::Scalar(elem)) => Scalar::zero(elem),
                    (op, kind) => panic!("no reset for {} over {}", op.name(), kind),
                };
            }
            FieldState::Flagged { value, set } => {
                if let FieldKind::Scalar(elem) = self.kind {
                    *value = Scalar::zero(elem);
                }
                *set = false;
            }
            FieldState::Average { sum, count } => {
                if let FieldKind::Scalar(elem) = self.kind {
                    *sum = Scalar::zero(elem);
                }
                *count = 0;
            }
            FieldState::Text { data, set } => {
                data.clear();
                *set = false;
            }
            FieldState::Append(data) => data.clear(),
            FieldState::TextAppend(data) => data.clear(),
            FieldState::Merge { pairs, result } => {
                pairs.clear();
                result.clear();
            }
        }
    }

    /// Folds one record's contribution into the state.
    pub fn combine(&self, state: &mut FieldState, src: FieldSource<'_>) {
        match (self.op, state, src) {
            (FieldOp::Sum, FieldState::Basic(acc), FieldSource::Scalar(value)) => {
                acc.accumulate(&value);
            }
            (FieldOp::Avg, FieldState::Average { sum, count }, FieldSource::Scalar(value)) => {
                sum.accumulate(&value);
                *count += 1;
            }
            (FieldOp::Min, FieldState::Basic(acc), FieldSource::Scalar(value)) => {
                if value.total_cmp(acc).is_lt() {
                    *acc = value;
                }
            }
            (FieldOp::Max, FieldState::Basic(acc), FieldSource::Scalar(value)) => {
                if value.total_cmp(acc).is_gt() {
                    *acc = value;
                }
            }
            (FieldOp::BitAnd, FieldState::Flagged { value, set }, FieldSource::Scalar(src)) => {
                if *set {
                    value.bit_and(&src);
                } else {
                    *value = src;
                    *set = true;
                }
            }
            (FieldOp::BitOr, FieldState::Basic(acc), FieldSource::Scalar(value)) => {
                acc.bit_or(&value);
            }
            (FieldOp::First, FieldState::Flagged { value, set }, FieldSource::Scalar(src)) => {
                if !*set {
                    *value = src;
                    *set = true;
                }
            }
            (FieldOp::FirstNonEmpty, FieldState::Flagged { value, set }, FieldSource::Scalar(src)) => {
                if !*set && !src.is_zero() {
                    *value = src;
                    *set = true;
                }
            }
            (FieldOp::Last, FieldState::Basic(acc), FieldSource::Scalar(value)) => {
                *acc = value;
            }
            (FieldOp::LastNonEmpty, FieldState::Basic(acc), FieldSource::Scalar(value)) => {
                if !value.is_zero() {
                    *acc = value;
                }
            }
            (FieldOp::First, FieldState::Text { data, set }, FieldSource::Text(src)) => {
                if !*set {
                    data.extend_from_slice(src);
                    *set = true;
                }
            }
            (FieldOp::FirstNonEmpty, FieldState::Text { data, set }, FieldSource::Text(src)) => {
                if !*set && !src.is_empty() {
                    data.extend_from_slice(src);
                    *set = true;
                }
            }
            (FieldOp::Last, FieldState::Text { data, .. }, FieldSource::Text(src)) => {
                data.clear();
                data.extend_from_slice(src);
            }
            (FieldOp::LastNonEmpty, FieldState::Text { data, .. }, FieldSource::Text(src)) => {
                if !src.is_empty() {
                    data.clear();
                    data.extend_from_slice(src);
                }
            }
            (FieldOp::Append, FieldState::TextAppend(data), FieldSource::Text(src)) => {
                // All or nothing: a string that would push the buffer past the
                // limit (delimiter included) is refused outright.
                if data.len() == self.limit {
                    return;
                }
                if data.len() + src.len() + 1 > self.limit {
                    return;
                }
                data.extend_from_slice(src);
                data.push(self.delimiter);
            }
            (FieldOp::Append, FieldState::Append(data), FieldSource::Elems(elems)) => {
                if data.len() >= self.limit {
                    return;
                }
                let room = self.limit - data.len();
                data.extend_from_slice(&elems[..elems.len().min(room)]);
            }
            (
                FieldOp::SortedMerge | FieldOp::SortedMergeDir,
                FieldState::Merge { pairs, .. },
                FieldSource::Pairs(src, reversed),
            ) => {
                let negate = self.op == FieldOp::SortedMergeDir && reversed;
                for &(value, sort_key) in src {
                    let mut value = value;
                    if negate {
                        value.negate();
                    }
                    pairs.push((value, sort_key));
                }
            }
            (op, state, _) => {
                panic!("combine mismatch: {} against state {:?}", op.name(), state)
            }
        }
    }

    /// Turns the accumulated state into the output value.
    ///
    /// For the sorted-merge operators this is the only place the pending
    /// pairs are sorted (stably, so ingestion order breaks ties) and
    /// truncated into the result buffer.
    pub fn finalize<'a>(&self, state: &'a mut FieldState) -> FieldOutput<'a> {
        match state {
            FieldState::Basic(value) => FieldOutput::Scalar(*value),
            FieldState::Flagged { value, .. } => FieldOutput::Scalar(*value),
            FieldState::Average { sum, count } => {
                let mut value = *sum;
                if *count > 0 {
                    value.div_count(*count);
                }
                FieldOutput::Scalar(value)
            }
            FieldState::Text { data, .. } => FieldOutput::Bytes(data),
            FieldState::Append(data) => FieldOutput::Array(data),
            FieldState::TextAppend(data) => FieldOutput::Bytes(data),
            FieldState::Merge { pairs, result } => {
                pairs.sort_by(|a, b| a.1.total_cmp(&b.1));
                if self.order == SortOrder::Descending {
                    // A stable ascending sort then a reverse puts equal keys
                    // earliest-last, the required tie-break for descending.
                    pairs.reverse();
                }
                result.clear();
                result.extend(pairs.iter().take(self.limit).map(|&(value, _)| value));
                FieldOutput::Array(result)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;

    fn scalar_agg(op: FieldOp, elem: ElemKind) -> Aggregator {
        Aggregator::new(op, FieldKind::Scalar(elem), 0, 0, SortOrder::Ascending)
    }

    fn run_scalars(agg: &Aggregator, values: &[Scalar]) -> FieldState {
        let mut state = agg.new_state();
        for &value in values {
            agg.combine(&mut state, FieldSource::Scalar(value));
        }
        state
    }

    fn finalized_scalar(agg: &Aggregator, state: &mut FieldState) -> Scalar {
        match agg.finalize(state) {
            FieldOutput::Scalar(value) => value,
            _ => panic!("expected scalar output"),
        }
    }

    #[test]
    fn sum_and_avg() {
        let agg = scalar_agg(FieldOp::Sum, ElemKind::U32);
        let mut state = run_scalars(&agg, &[Scalar::U32(100), Scalar::U32(250), Scalar::U32(50)]);
        assert_eq!(finalized_scalar(&agg, &mut state), Scalar::U32(400));

        // Integer averages truncate in the element's own type.
        let agg = scalar_agg(FieldOp::Avg, ElemKind::U32);
        let mut state = run_scalars(&agg, &[Scalar::U32(5), Scalar::U32(4)]);
        assert_eq!(finalized_scalar(&agg, &mut state), Scalar::U32(4));
    }

    #[test]
    fn min_starts_at_type_max() {
        let agg = scalar_agg(FieldOp::Min, ElemKind::U16);
        let mut state = run_scalars(&agg, &[Scalar::U16(7000), Scalar::U16(40), Scalar::U16(900)]);
        assert_eq!(finalized_scalar(&agg, &mut state), Scalar::U16(40));

        let agg = scalar_agg(FieldOp::Max, ElemKind::U16);
        let mut state = run_scalars(&agg, &[Scalar::U16(7000), Scalar::U16(40), Scalar::U16(900)]);
        assert_eq!(finalized_scalar(&agg, &mut state), Scalar::U16(7000));
    }

    #[test]
    fn min_max_on_times() {
        let agg = scalar_agg(FieldOp::Min, ElemKind::Time);
        let times = [
            Scalar::Time(Timestamp::from_secs(50)),
            Scalar::Time(Timestamp::from_secs(20)),
        ];
        let mut state = run_scalars(&agg, &times);
        assert_eq!(finalized_scalar(&agg, &mut state), Scalar::Time(Timestamp::from_secs(20)));
    }

    #[test]
    fn bitand_first_write_initialises() {
        let agg = scalar_agg(FieldOp::BitAnd, ElemKind::U8);
        let mut state = run_scalars(&agg, &[Scalar::U8(0b1100), Scalar::U8(0b0110)]);
        assert_eq!(finalized_scalar(&agg, &mut state), Scalar::U8(0b0100));

        let agg = scalar_agg(FieldOp::BitOr, ElemKind::U8);
        let mut state = run_scalars(&agg, &[Scalar::U8(0b1000), Scalar::U8(0b0011)]);
        assert_eq!(finalized_scalar(&agg, &mut state), Scalar::U8(0b1011));
    }

    #[test]
    fn first_and_last_variants() {
        let values = [Scalar::U32(0), Scalar::U32(5), Scalar::U32(9), Scalar::U32(0)];

        let agg = scalar_agg(FieldOp::First, ElemKind::U32);
        let mut state = run_scalars(&agg, &values);
        assert_eq!(finalized_scalar(&agg, &mut state), Scalar::U32(0));

        let agg = scalar_agg(FieldOp::FirstNonEmpty, ElemKind::U32);
        let mut state = run_scalars(&agg, &values);
        assert_eq!(finalized_scalar(&agg, &mut state), Scalar::U32(5));

        let agg = scalar_agg(FieldOp::Last, ElemKind::U32);
        let mut state = run_scalars(&agg, &values);
        assert_eq!(finalized_scalar(&agg, &mut state), Scalar::U32(0));

        let agg = scalar_agg(FieldOp::LastNonEmpty, ElemKind::U32);
        let mut state = run_scalars(&agg, &values);
        assert_eq!(finalized_scalar(&agg, &mut state), Scalar::U32(9));
    }

    #[test]
    fn string_first_last() {
        let agg = Aggregator::new(FieldOp::FirstNonEmpty, FieldKind::String, 0, 0, SortOrder::Ascending);
        let mut state = agg.new_state();
        agg.combine(&mut state, FieldSource::Text(b""));
        agg.combine(&mut state, FieldSource::Text(b"alpha"));
        agg.combine(&mut state, FieldSource::Text(b"beta"));
        match agg.finalize(&mut state) {
            FieldOutput::Bytes(bytes) => assert_eq!(bytes, b"alpha"),
            _ => panic!("expected bytes"),
        }
    }

    #[test]
    fn string_append_is_all_or_nothing() {
        let agg = Aggregator::new(FieldOp::Append, FieldKind::String, 10, b';', SortOrder::Ascending);
        let mut state = agg.new_state();
        agg.combine(&mut state, FieldSource::Text(b"abc"));
        // 4 bytes used; "defgh" plus delimiter would need 10 total, fits.
        agg.combine(&mut state, FieldSource::Text(b"defgh"));
        // Full to the limit now; anything more is refused outright.
        agg.combine(&mut state, FieldSource::Text(b"x"));
        match agg.finalize(&mut state) {
            FieldOutput::Bytes(bytes) => assert_eq!(bytes, b"abc;defgh;"),
            _ => panic!("expected bytes"),
        }
    }

    #[test]
    fn numeric_append_truncates_at_limit() {
        let agg = Aggregator::new(FieldOp::Append, FieldKind::Array(ElemKind::U32), 4, 0, SortOrder::Ascending);
        let mut state = agg.new_state();
        agg.combine(&mut state, FieldSource::Elems(&[Scalar::U32(1), Scalar::U32(2), Scalar::U32(3)]));
        agg.combine(&mut state, FieldSource::Elems(&[Scalar::U32(4), Scalar::U32(5)]));
        agg.combine(&mut state, FieldSource::Elems(&[Scalar::U32(6)]));
        match agg.finalize(&mut state) {
            FieldOutput::Array(values) => {
                assert_eq!(values, &[Scalar::U32(1), Scalar::U32(2), Scalar::U32(3), Scalar::U32(4)]);
            }
            _ => panic!("expected array"),
        }
    }

    #[test]
    fn sorted_merge_orders_and_truncates() {
        let agg = Aggregator::new(
            FieldOp::SortedMerge,
            FieldKind::Array(ElemKind::I16),
            4,
            0,
            SortOrder::Ascending,
        );
        let mut state = agg.new_state();
        let first = [
            (Scalar::I16(1), Scalar::U64(100)),
            (Scalar::I16(2), Scalar::U64(200)),
            (Scalar::I16(3), Scalar::U64(300)),
        ];
        let second = [(Scalar::I16(10), Scalar::U64(150)), (Scalar::I16(20), Scalar::U64(250))];
        agg.combine(&mut state, FieldSource::Pairs(&first, false));
        agg.combine(&mut state, FieldSource::Pairs(&second, false));
        match agg.finalize(&mut state) {
            FieldOutput::Array(values) => {
                assert_eq!(values, &[Scalar::I16(1), Scalar::I16(10), Scalar::I16(2), Scalar::I16(20)]);
            }
            _ => panic!("expected array"),
        }
    }

    #[test]
    fn sorted_merge_ties_follow_ingestion_order() {
        let pairs = [
            (Scalar::I32(1), Scalar::U32(5)),
            (Scalar::I32(2), Scalar::U32(5)),
            (Scalar::I32(3), Scalar::U32(1)),
        ];

        let agg = Aggregator::new(
            FieldOp::SortedMerge,
            FieldKind::Array(ElemKind::I32),
            10,
            0,
            SortOrder::Ascending,
        );
        let mut state = agg.new_state();
        agg.combine(&mut state, FieldSource::Pairs(&pairs, false));
        match agg.finalize(&mut state) {
            FieldOutput::Array(values) => {
                assert_eq!(values, &[Scalar::I32(3), Scalar::I32(1), Scalar::I32(2)]);
            }
            _ => panic!("expected array"),
        }

        // Descending: equal keys emerge earliest-last.
        let agg = Aggregator::new(
            FieldOp::SortedMerge,
            FieldKind::Array(ElemKind::I32),
            10,
            0,
            SortOrder::Descending,
        );
        let mut state = agg.new_state();
        agg.combine(&mut state, FieldSource::Pairs(&pairs, false));
        match agg.finalize(&mut state) {
            FieldOutput::Array(values) => {
                assert_eq!(values, &[Scalar::I32(2), Scalar::I32(1), Scalar::I32(3)]);
            }
            _ => panic!("expected array"),
        }
    }

    #[test]
    fn sorted_merge_dir_negates_reversed_contributions() {
        let agg = Aggregator::new(
            FieldOp::SortedMergeDir,
            FieldKind::Array(ElemKind::I16),
            4,
            0,
            SortOrder::Ascending,
        );
        let mut state = agg.new_state();
        let forward = [
            (Scalar::I16(1), Scalar::U64(100)),
            (Scalar::I16(2), Scalar::U64(200)),
            (Scalar::I16(3), Scalar::U64(300)),
        ];
        let reverse = [(Scalar::I16(10), Scalar::U64(150)), (Scalar::I16(20), Scalar::U64(250))];
        agg.combine(&mut state, FieldSource::Pairs(&forward, false));
        agg.combine(&mut state, FieldSource::Pairs(&reverse, true));
        match agg.finalize(&mut state) {
            FieldOutput::Array(values) => {
                assert_eq!(values, &[Scalar::I16(1), Scalar::I16(-10), Scalar::I16(2), Scalar::I16(-20)]);
            }
            _ => panic!("expected array"),
        }
    }

    #[test]
    fn reset_keeps_capacity_and_clears_content() {
        let agg = Aggregator::new(FieldOp::Append, FieldKind::Array(ElemKind::U32), 8, 0, SortOrder::Ascending);
        let mut state = agg.new_state();
        agg.combine(&mut state, FieldSource::Elems(&[Scalar::U32(1), Scalar::U32(2)]));
        agg.reset(&mut state);
        match &state {
            FieldState::Append(data) => {
                assert!(data.is_empty());
                assert!(data.capacity() >= 8);
            }
            _ => panic!("expected append state"),
        }

        let agg = scalar_agg(FieldOp::Min, ElemKind::U8);
        let mut state = run_scalars(&agg, &[Scalar::U8(3)]);
        agg.reset(&mut state);
        assert_eq!(finalized_scalar(&agg, &mut state), Scalar::U8(u8::MAX));
    }

    #[test]
    fn compatibility_matrix() {
        use ElemKind::*;
        use FieldKind::*;

        assert!(FieldOp::Sum.accepts_value(Scalar(U32)));
        assert!(FieldOp::Sum.accepts_value(Scalar(F64)));
        assert!(!FieldOp::Sum.accepts_value(Scalar(Ip)));
        assert!(!FieldOp::Sum.accepts_value(String));

        assert!(FieldOp::Min.accepts_value(Scalar(Ip)));
        assert!(FieldOp::Max.accepts_value(Scalar(Mac)));
        assert!(FieldOp::Max.accepts_value(Scalar(Time)));

        assert!(FieldOp::First.accepts_value(String));
        assert!(FieldOp::LastNonEmpty.accepts_value(Scalar(Mac)));

        assert!(FieldOp::BitAnd.accepts_value(Scalar(Char)));
        assert!(!FieldOp::BitAnd.accepts_value(Scalar(F32)));

        assert!(FieldOp::Append.accepts_value(Array(Time)));
        assert!(FieldOp::Append.accepts_value(String));
        assert!(!FieldOp::Append.accepts_value(Bytes));

        assert!(FieldOp::SortedMerge.accepts_value(Array(U16)));
        assert!(FieldOp::SortedMergeDir.accepts_value(Array(I16)));
        assert!(!FieldOp::SortedMergeDir.accepts_value(Array(U16)));
        assert!(FieldOp::SortedMerge.accepts_sort_key(Array(Time)));
        assert!(!FieldOp::SortedMerge.accepts_sort_key(String));
    }
}
