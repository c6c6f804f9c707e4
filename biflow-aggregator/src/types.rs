//! Scalar values and the small fixed-width types that appear in flow records.
//!
//! Records move through the aggregator as byte buffers described by a schema;
//! whenever a single field value must be held, compared, or accumulated, it is
//! lifted into a [`Scalar`]. The binding layer guarantees that the two sides of
//! every operation carry the same [`ElemKind`], which keeps the arithmetic here
//! free of conversion rules: a mismatched pair is a programming error and
//! aborts.

use std::cmp::Ordering;
use std::fmt;

/// The element types a record field can carry.
///
/// `Char` is kept distinct from `U8` because the operator compatibility rules
/// treat characters as text-ish integers: they sum and mask, but a `char`
/// array is a string with its own operator family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElemKind {
    /// A single character, stored as one byte.
    Char,
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 8-bit integer.
    I8,
    /// Unsigned 16-bit integer.
    U16,
    /// Signed 16-bit integer.
    I16,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 32-bit integer.
    I32,
    /// Unsigned 64-bit integer.
    U64,
    /// Signed 64-bit integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// Packed 64-bit timestamp, seconds in the high half.
    Time,
    /// 128-bit IP address, compared as an unsigned big-endian integer.
    Ip,
    /// 48-bit MAC address.
    Mac,
}

impl ElemKind {
    /// Width of one element of this kind in serialised form, in bytes.
    #[inline]
    pub fn size(self) -> usize {
        match self {
            ElemKind::Char | ElemKind::U8 | ElemKind::I8 => 1,
            ElemKind::U16 | ElemKind::I16 => 2,
            ElemKind::U32 | ElemKind::I32 | ElemKind::F32 => 4,
            ElemKind::U64 | ElemKind::I64 | ElemKind::F64 | ElemKind::Time => 8,
            ElemKind::Ip => 16,
            ElemKind::Mac => 6,
        }
    }

    /// True for `Char` and the fixed-width integer kinds.
    #[inline]
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ElemKind::Char
                | ElemKind::U8
                | ElemKind::I8
                | ElemKind::U16
                | ElemKind::I16
                | ElemKind::U32
                | ElemKind::I32
                | ElemKind::U64
                | ElemKind::I64
        )
    }

    /// True for kinds that participate in arithmetic (sums and averages).
    #[inline]
    pub fn is_numeric(self) -> bool {
        self.is_integer() || matches!(self, ElemKind::F32 | ElemKind::F64)
    }

    /// True for kinds whose values can be negated without changing kind.
    #[inline]
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ElemKind::I8 | ElemKind::I16 | ElemKind::I32 | ElemKind::I64 | ElemKind::F32 | ElemKind::F64
        )
    }

    /// The schema name of this kind.
    pub fn name(self) -> &'static str {
        match self {
            ElemKind::Char => "char",
            ElemKind::U8 => "uint8",
            ElemKind::I8 => "int8",
            ElemKind::U16 => "uint16",
            ElemKind::I16 => "int16",
            ElemKind::U32 => "uint32",
            ElemKind::I32 => "int32",
            ElemKind::U64 => "uint64",
            ElemKind::I64 => "int64",
            ElemKind::F32 => "float",
            ElemKind::F64 => "double",
            ElemKind::Time => "time",
            ElemKind::Ip => "ipaddr",
            ElemKind::Mac => "macaddr",
        }
    }

    /// Parses a schema name back into a kind.
    pub fn parse(name: &str) -> Option<ElemKind> {
        Some(match name {
            "char" => ElemKind::Char,
            "uint8" => ElemKind::U8,
            "int8" => ElemKind::I8,
            "uint16" => ElemKind::U16,
            "int16" => ElemKind::I16,
            "uint32" => ElemKind::U32,
            "int32" => ElemKind::I32,
            "uint64" => ElemKind::U64,
            "int64" => ElemKind::I64,
            "float" => ElemKind::F32,
            "double" => ElemKind::F64,
            "time" => ElemKind::Time,
            "ipaddr" => ElemKind::Ip,
            "macaddr" => ElemKind::Mac,
            _ => return None,
        })
    }
}

/// The shape of a record field: a single element, an element array, or one of
/// the two variable-length byte shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// One element of the given kind, stored in the fixed part of the record.
    Scalar(ElemKind),
    /// A variable-length run of elements of the given kind.
    Array(ElemKind),
    /// A variable-length UTF-8-ish byte string.
    String,
    /// An opaque variable-length byte sequence.
    Bytes,
}

impl FieldKind {
    /// True when the field lives in the variable part of the record.
    #[inline]
    pub fn is_variable(self) -> bool {
        !matches!(self, FieldKind::Scalar(_))
    }

    /// Parses a schema type name, with a trailing `*` marking an array.
    pub fn parse(name: &str) -> Option<FieldKind> {
        if name == "string" {
            return Some(FieldKind::String);
        }
        if name == "bytes" {
            return Some(FieldKind::Bytes);
        }
        if let Some(elem) = name.strip_suffix('*') {
            return ElemKind::parse(elem).map(FieldKind::Array);
        }
        ElemKind::parse(name).map(FieldKind::Scalar)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FieldKind::Scalar(kind) => f.write_str(kind.name()),
            FieldKind::Array(kind) => write!(f, "{}*", kind.name()),
            FieldKind::String => f.write_str("string"),
            FieldKind::Bytes => f.write_str("bytes"),
        }
    }
}

/// A packed 64-bit timestamp with whole seconds in the high 32 bits and a
/// binary fraction in the low 32 bits. Ordering on the packed value orders
/// chronologically.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// A timestamp from whole seconds.
    #[inline]
    pub fn from_secs(secs: u64) -> Timestamp {
        Timestamp(secs << 32)
    }

    /// A timestamp from whole seconds plus a 32-bit binary fraction.
    #[inline]
    pub fn from_parts(secs: u64, frac: u32) -> Timestamp {
        Timestamp((secs << 32) | u64::from(frac))
    }

    /// The whole-seconds half.
    #[inline]
    pub fn secs(self) -> u64 {
        self.0 >> 32
    }

    /// The fractional half.
    #[inline]
    pub fn frac(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:010}", self.secs(), self.frac())
    }
}

/// A 128-bit IP address held as the unsigned big-endian integer value of its
/// 16 serialised bytes. IPv4 addresses occupy the low 32 bits.
///
/// Biflow canonicalisation compares these values directly, which makes the
/// direction decision identical on every platform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ip(pub u128);

impl Ip {
    /// An address from its 16-byte big-endian serialised form.
    #[inline]
    pub fn from_bytes(bytes: [u8; 16]) -> Ip {
        Ip(u128::from_be_bytes(bytes))
    }

    /// An address from four IPv4 octets.
    #[inline]
    pub fn from_v4(octets: [u8; 4]) -> Ip {
        Ip(u128::from(u32::from_be_bytes(octets)))
    }

    /// The 16-byte big-endian serialised form.
    #[inline]
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }
}

/// A 48-bit MAC address, ordered lexicographically by octet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mac(pub [u8; 6]);

/// One field value lifted out of a record, tagged with its kind.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scalar {
    /// A character.
    Char(u8),
    /// An unsigned 8-bit integer.
    U8(u8),
    /// A signed 8-bit integer.
    I8(i8),
    /// An unsigned 16-bit integer.
    U16(u16),
    /// A signed 16-bit integer.
    I16(i16),
    /// An unsigned 32-bit integer.
    U32(u32),
    /// A signed 32-bit integer.
    I32(i32),
    /// An unsigned 64-bit integer.
    U64(u64),
    /// A signed 64-bit integer.
    I64(i64),
    /// A 32-bit float.
    F32(f32),
    /// A 64-bit float.
    F64(f64),
    /// A packed timestamp.
    Time(Timestamp),
    /// An IP address.
    Ip(Ip),
    /// A MAC address.
    Mac(Mac),
}

macro_rules! scalar_int_binop {
    ($lhs:expr, $rhs:expr, $op:ident, $name:expr) => {
        match ($lhs, $rhs) {
            (Scalar::Char(a), Scalar::Char(b)) => *a = a.$op(*b),
            (Scalar::U8(a), Scalar::U8(b)) => *a = a.$op(*b),
            (Scalar::I8(a), Scalar::I8(b)) => *a = a.$op(*b),
            (Scalar::U16(a), Scalar::U16(b)) => *a = a.$op(*b),
            (Scalar::I16(a), Scalar::I16(b)) => *a = a.$op(*b),
            (Scalar::U32(a), Scalar::U32(b)) => *a = a.$op(*b),
            (Scalar::I32(a), Scalar::I32(b)) => *a = a.$op(*b),
            (Scalar::U64(a), Scalar::U64(b)) => *a = a.$op(*b),
            (Scalar::I64(a), Scalar::I64(b)) => *a = a.$op(*b),
            (a, b) => panic!(concat!($name, " on incompatible scalars {:?} and {:?}"), a, b),
        }
    };
}

impl Scalar {
    /// The kind of this value.
    pub fn kind(&self) -> ElemKind {
        match *self {
            Scalar::Char(_) => ElemKind::Char,
            Scalar::U8(_) => ElemKind::U8,
            Scalar::I8(_) => ElemKind::I8,
            Scalar::U16(_) => ElemKind::U16,
            Scalar::I16(_) => ElemKind::I16,
            Scalar::U32(_) => ElemKind::U32,
            Scalar::I32(_) => ElemKind::I32,
            Scalar::U64(_) => ElemKind::U64,
            Scalar::I64(_) => ElemKind::I64,
            Scalar::F32(_) => ElemKind::F32,
            Scalar::F64(_) => ElemKind::F64,
            Scalar::Time(_) => ElemKind::Time,
            Scalar::Ip(_) => ElemKind::Ip,
            Scalar::Mac(_) => ElemKind::Mac,
        }
    }

    /// The zero value of the given kind.
    pub fn zero(kind: ElemKind) -> Scalar {
        match kind {
            ElemKind::Char => Scalar::Char(0),
            ElemKind::U8 => Scalar::U8(0),
            ElemKind::I8 => Scalar::I8(0),
            ElemKind::U16 => Scalar::U16(0),
            ElemKind::I16 => Scalar::I16(0),
            ElemKind::U32 => Scalar::U32(0),
            ElemKind::I32 => Scalar::I32(0),
            ElemKind::U64 => Scalar::U64(0),
            ElemKind::I64 => Scalar::I64(0),
            ElemKind::F32 => Scalar::F32(0.0),
            ElemKind::F64 => Scalar::F64(0.0),
            ElemKind::Time => Scalar::Time(Timestamp(0)),
            ElemKind::Ip => Scalar::Ip(Ip(0)),
            ElemKind::Mac => Scalar::Mac(Mac([0; 6])),
        }
    }

    /// The largest value of the given kind; the starting state for `MIN`.
    pub fn max_value(kind: ElemKind) -> Scalar {
        match kind {
            ElemKind::Char => Scalar::Char(u8::MAX),
            ElemKind::U8 => Scalar::U8(u8::MAX),
            ElemKind::I8 => Scalar::I8(i8::MAX),
            ElemKind::U16 => Scalar::U16(u16::MAX),
            ElemKind::I16 => Scalar::I16(i16::MAX),
            ElemKind::U32 => Scalar::U32(u32::MAX),
            ElemKind::I32 => Scalar::I32(i32::MAX),
            ElemKind::U64 => Scalar::U64(u64::MAX),
            ElemKind::I64 => Scalar::I64(i64::MAX),
            ElemKind::F32 => Scalar::F32(f32::MAX),
            ElemKind::F64 => Scalar::F64(f64::MAX),
            ElemKind::Time => Scalar::Time(Timestamp(u64::MAX)),
            ElemKind::Ip => Scalar::Ip(Ip(u128::MAX)),
            ElemKind::Mac => Scalar::Mac(Mac([u8::MAX; 6])),
        }
    }

    /// Reads one element of `kind` from the front of `bytes`.
    ///
    /// The caller must have validated that `bytes` holds at least
    /// [`ElemKind::size`] bytes.
    pub fn read(kind: ElemKind, bytes: &[u8]) -> Scalar {
        match kind {
            ElemKind::Char => Scalar::Char(bytes[0]),
            ElemKind::U8 => Scalar::U8(bytes[0]),
            ElemKind::I8 => Scalar::I8(bytes[0] as i8),
            ElemKind::U16 => Scalar::U16(u16::from_le_bytes([bytes[0], bytes[1]])),
            ElemKind::I16 => Scalar::I16(i16::from_le_bytes([bytes[0], bytes[1]])),
            ElemKind::U32 => Scalar::U32(u32::from_le_bytes(bytes[..4].try_into().unwrap())),
            ElemKind::I32 => Scalar::I32(i32::from_le_bytes(bytes[..4].try_into().unwrap())),
            ElemKind::U64 => Scalar::U64(u64::from_le_bytes(bytes[..8].try_into().unwrap())),
            ElemKind::I64 => Scalar::I64(i64::from_le_bytes(bytes[..8].try_into().unwrap())),
            ElemKind::F32 => Scalar::F32(f32::from_le_bytes(bytes[..4].try_into().unwrap())),
            ElemKind::F64 => Scalar::F64(f64::from_le_bytes(bytes[..8].try_into().unwrap())),
            ElemKind::Time => Scalar::Time(Timestamp(u64::from_le_bytes(bytes[..8].try_into().unwrap()))),
            ElemKind::Ip => Scalar::Ip(Ip::from_bytes(bytes[..16].try_into().unwrap())),
            ElemKind::Mac => Scalar::Mac(Mac(bytes[..6].try_into().unwrap())),
        }
    }

    /// Appends the serialised form of this value to `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        match *self {
            Scalar::Char(v) | Scalar::U8(v) => out.push(v),
            Scalar::I8(v) => out.push(v as u8),
            Scalar::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Scalar::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Scalar::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Scalar::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Scalar::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Scalar::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Scalar::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Scalar::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Scalar::Time(v) => out.extend_from_slice(&v.0.to_le_bytes()),
            Scalar::Ip(v) => out.extend_from_slice(&v.to_bytes()),
            Scalar::Mac(v) => out.extend_from_slice(&v.0),
        }
    }

    /// True when this value is the zero of its kind; the "empty" test of the
    /// `*_NON_EMPTY` operators.
    pub fn is_zero(&self) -> bool {
        match *self {
            Scalar::Char(v) | Scalar::U8(v) => v == 0,
            Scalar::I8(v) => v == 0,
            Scalar::U16(v) => v == 0,
            Scalar::I16(v) => v == 0,
            Scalar::U32(v) => v == 0,
            Scalar::I32(v) => v == 0,
            Scalar::U64(v) => v == 0,
            Scalar::I64(v) => v == 0,
            Scalar::F32(v) => v == 0.0,
            Scalar::F64(v) => v == 0.0,
            Scalar::Time(v) => v.0 == 0,
            Scalar::Ip(v) => v.0 == 0,
            Scalar::Mac(v) => v.0 == [0; 6],
        }
    }

    /// Adds `other` into this value. Integers wrap, floats add.
    pub fn accumulate(&mut self, other: &Scalar) {
        match (&mut *self, other) {
            (Scalar::F32(a), Scalar::F32(b)) => *a += b,
            (Scalar::F64(a), Scalar::F64(b)) => *a += b,
            (a, b) => scalar_int_binop!(a, b, wrapping_add, "accumulate"),
        }
    }

    /// Divides this value by a count, in the value's own type.
    ///
    /// Integer kinds truncate: the average of integers is an integer.
    pub fn div_count(&mut self, count: u32) {
        match self {
            Scalar::Char(v) | Scalar::U8(v) => *v = (u32::from(*v) / count) as u8,
            Scalar::I8(v) => *v = (i32::from(*v) / count as i32) as i8,
            Scalar::U16(v) => *v = (u32::from(*v) / count) as u16,
            Scalar::I16(v) => *v = (i32::from(*v) / count as i32) as i16,
            Scalar::U32(v) => *v /= count,
            Scalar::I32(v) => *v = (i64::from(*v) / i64::from(count)) as i32,
            Scalar::U64(v) => *v /= u64::from(count),
            Scalar::I64(v) => *v /= i64::from(count),
            Scalar::F32(v) => *v /= count as f32,
            Scalar::F64(v) => *v /= f64::from(count),
            other => panic!("div_count on non-numeric scalar {:?}", other),
        }
    }

    /// Bitwise-ands `other` into this value.
    pub fn bit_and(&mut self, other: &Scalar) {
        scalar_int_binop!(self, other, bitand_value, "bit_and");
    }

    /// Bitwise-ors `other` into this value.
    pub fn bit_or(&mut self, other: &Scalar) {
        scalar_int_binop!(self, other, bitor_value, "bit_or");
    }

    /// Total order over same-kind values; float `NaN` compares equal to
    /// everything rather than poisoning min/max tracking.
    pub fn total_cmp(&self, other: &Scalar) -> Ordering {
        match (self, other) {
            (Scalar::Char(a), Scalar::Char(b)) => a.cmp(b),
            (Scalar::U8(a), Scalar::U8(b)) => a.cmp(b),
            (Scalar::I8(a), Scalar::I8(b)) => a.cmp(b),
            (Scalar::U16(a), Scalar::U16(b)) => a.cmp(b),
            (Scalar::I16(a), Scalar::I16(b)) => a.cmp(b),
            (Scalar::U32(a), Scalar::U32(b)) => a.cmp(b),
            (Scalar::I32(a), Scalar::I32(b)) => a.cmp(b),
            (Scalar::U64(a), Scalar::U64(b)) => a.cmp(b),
            (Scalar::I64(a), Scalar::I64(b)) => a.cmp(b),
            (Scalar::F32(a), Scalar::F32(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Scalar::F64(a), Scalar::F64(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Scalar::Time(a), Scalar::Time(b)) => a.cmp(b),
            (Scalar::Ip(a), Scalar::Ip(b)) => a.cmp(b),
            (Scalar::Mac(a), Scalar::Mac(b)) => a.cmp(b),
            (a, b) => panic!("total_cmp on incompatible scalars {:?} and {:?}", a, b),
        }
    }

    /// Negates this value in place. Defined for signed kinds only.
    pub fn negate(&mut self) {
        match self {
            Scalar::I8(v) => *v = v.wrapping_neg(),
            Scalar::I16(v) => *v = v.wrapping_neg(),
            Scalar::I32(v) => *v = v.wrapping_neg(),
            Scalar::I64(v) => *v = v.wrapping_neg(),
            Scalar::F32(v) => *v = -*v,
            Scalar::F64(v) => *v = -*v,
            other => panic!("negate on unsigned scalar {:?}", other),
        }
    }
}

/// Helper traits so the integer binop macro has uniform method names.
trait BitValue: Copy {
    fn bitand_value(self, other: Self) -> Self;
    fn bitor_value(self, other: Self) -> Self;
}

macro_rules! bit_value {
    ($($t:ty)*) => {$(
        impl BitValue for $t {
            #[inline] fn bitand_value(self, other: Self) -> Self { self & other }
            #[inline] fn bitor_value(self, other: Self) -> Self { self | other }
        }
    )*};
}

bit_value! { u8 i8 u16 i16 u32 i32 u64 i64 }
