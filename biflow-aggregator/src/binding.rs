//! Binding the configured fields against the live input schema.
//!
//! Binding happens once per schema announcement. Every configured name is
//! resolved to an input field id (and its reverse partner to another), the
//! operator compatibility matrix is enforced, the biflow address pair is
//! located, and the output schema is laid down: the mandatory
//! `TIME_FIRST`, `TIME_LAST`, `COUNT` header, the key fields, then the
//! aggregated fields in configuration order. A binding failure names the
//! offending field and stops the run; the engine only ever sees a binding
//! that is internally consistent.

use thiserror::Error;

use crate::config::Rules;
use crate::key::{KeyTemplate, STRING_KEY_WIDTH};
use crate::ops::{Aggregator, FieldOp};
use crate::record::{FieldDef, Schema};
use crate::types::{ElemKind, FieldKind};

/// Name of the mandatory flow-start timestamp field.
pub const TIME_FIRST: &str = "TIME_FIRST";
/// Name of the mandatory flow-end timestamp field.
pub const TIME_LAST: &str = "TIME_LAST";
/// Name of the optional record-count field.
pub const COUNT: &str = "COUNT";

/// Output field id of `TIME_FIRST`.
pub const OUT_TIME_FIRST: usize = 0;
/// Output field id of `TIME_LAST`.
pub const OUT_TIME_LAST: usize = 1;
/// Output field id of `COUNT`.
pub const OUT_COUNT: usize = 2;

/// Errors raised while binding configuration to a schema.
#[derive(Debug, Error)]
pub enum BindError {
    /// A configured name is absent from the input schema.
    #[error("requested field {0:?} is not in input records, cannot continue")]
    MissingField(String),
    /// The input schema lacks a mandatory timestamp field.
    #[error("input records carry no {0} field")]
    MissingTime(&'static str),
    /// A mandatory timestamp field is not a time.
    #[error("input field {0} must be a time")]
    BadTimeKind(&'static str),
    /// The optional count field is not a 32-bit unsigned integer.
    #[error("input COUNT field must be uint32, found {0}")]
    BadCountKind(FieldKind),
    /// A field and its reverse partner have different types.
    #[error("field {name:?} and reverse {reverse:?} have different types, cannot continue")]
    ReverseKindMismatch {
        /// The configured field.
        name: String,
        /// Its declared partner.
        reverse: String,
    },
    /// The operator cannot aggregate the field's type.
    #[error("operator {op} cannot aggregate field {name:?} of type {kind}")]
    Incompatible {
        /// The configured field.
        name: String,
        /// The operator's configuration spelling.
        op: &'static str,
        /// The field's shape.
        kind: FieldKind,
    },
    /// A sorted merge's sort key has an unusable type.
    #[error("sort key {key:?} of field {name:?} has unusable type {kind}")]
    SortKeyIncompatible {
        /// The configured field.
        name: String,
        /// The sort key's name.
        key: String,
        /// The sort key's shape.
        kind: FieldKind,
    },
    /// A biflow address field is not an IP address.
    #[error("biflow key field {name:?} must be an ipaddr, found {kind}")]
    BiflowAddressKind {
        /// The address field.
        name: String,
        /// The shape found.
        kind: FieldKind,
    },
}

/// One bound key field.
#[derive(Clone, Debug)]
pub struct BoundKey {
    /// Configured name.
    pub name: String,
    /// Input field id.
    pub id: usize,
    /// Reverse partner's input field id; equals `id` without a partner.
    pub rev_id: usize,
    /// Field shape.
    pub kind: FieldKind,
    /// Serialised width within the key.
    pub width: usize,
    /// Output column id.
    pub out_id: usize,
    /// Output column id written when the flow is reversed.
    pub out_rev_id: usize,
}

/// One bound aggregation field.
#[derive(Clone, Debug)]
pub struct BoundAgg {
    /// Configured name.
    pub name: String,
    /// Input field id.
    pub id: usize,
    /// Reverse partner's input field id; equals `id` without a partner.
    pub rev_id: usize,
    /// Input field id of the sort key, for the sorted merges.
    pub sort_id: Option<usize>,
    /// The bound operator.
    pub agg: Aggregator,
    /// Whether the field appears as an output column.
    pub to_output: bool,
    /// Output column id, when `to_output`.
    pub out_id: Option<usize>,
    /// Output column id written when the flow is reversed.
    pub out_rev_id: Option<usize>,
}

/// A complete binding: resolved key and aggregation fields, the key template,
/// the mandatory input ids, and the output schema.
#[derive(Clone, Debug)]
pub struct Binding {
    /// Bound key fields, in configuration order.
    pub keys: Vec<BoundKey>,
    /// Bound aggregation fields, in configuration order.
    pub aggs: Vec<BoundAgg>,
    /// The key serialisation template.
    pub key_template: KeyTemplate,
    /// Whether keys canonicalise across direction.
    pub biflow: bool,
    /// Input id of `TIME_FIRST`.
    pub time_first_id: usize,
    /// Input id of `TIME_LAST`.
    pub time_last_id: usize,
    /// Input id of `COUNT`, when present.
    pub count_id: Option<usize>,
    /// The output record schema.
    pub out_schema: Schema,
}

/// Resolves `rules` against `schema`.
pub fn bind(rules: &Rules, schema: &Schema) -> Result<Binding, BindError> {
    let time_first_id = resolve_time(schema, TIME_FIRST)?;
    let time_last_id = resolve_time(schema, TIME_LAST)?;
    let count_id = match schema.id_of(COUNT) {
        Some(id) => match schema.field(id).kind {
            FieldKind::Scalar(ElemKind::U32) => Some(id),
            other => return Err(BindError::BadCountKind(other)),
        },
        None => None,
    };

    let mut keys = Vec::new();
    let mut aggs = Vec::new();
    for field in &rules.fields {
        let id = schema
            .id_of(&field.name)
            .ok_or_else(|| BindError::MissingField(field.name.clone()))?;
        let kind = schema.field(id).kind;

        let rev_id = match &field.reverse_name {
            Some(reverse) => {
                let rev_id = schema
                    .id_of(reverse)
                    .ok_or_else(|| BindError::MissingField(reverse.clone()))?;
                if schema.field(rev_id).kind != kind {
                    return Err(BindError::ReverseKindMismatch {
                        name: field.name.clone(),
                        reverse: reverse.clone(),
                    });
                }
                rev_id
            }
            None => id,
        };

        if !field.op.accepts_value(kind) {
            return Err(BindError::Incompatible {
                name: field.name.clone(),
                op: field.op.name(),
                kind,
            });
        }

        if field.op == FieldOp::Key {
            let width = match kind {
                FieldKind::String => STRING_KEY_WIDTH,
                FieldKind::Scalar(elem) => elem.size(),
                _ => unreachable!("KEY accepts scalars and strings only"),
            };
            keys.push(BoundKey { name: field.name.clone(), id, rev_id, kind, width, out_id: 0, out_rev_id: 0 });
            continue;
        }

        let sort_id = match &field.sort_key {
            Some(sort_key) if field.op.is_sorted_merge() => {
                let sort_id = schema
                    .id_of(sort_key)
                    .ok_or_else(|| BindError::MissingField(sort_key.clone()))?;
                let sort_kind = schema.field(sort_id).kind;
                if !field.op.accepts_sort_key(sort_kind) {
                    return Err(BindError::SortKeyIncompatible {
                        name: field.name.clone(),
                        key: sort_key.clone(),
                        kind: sort_kind,
                    });
                }
                Some(sort_id)
            }
            _ => None,
        };

        aggs.push(BoundAgg {
            name: field.name.clone(),
            id,
            rev_id,
            sort_id,
            agg: Aggregator::new(field.op, kind, field.limit, field.delimiter, field.sort_order),
            to_output: field.to_output,
            out_id: None,
            out_rev_id: None,
        });
    }

    let key_template = build_key_template(schema, &keys, rules.biflow)?;
    let out_schema = build_out_schema(&keys, &aggs);

    let mut binding = Binding {
        keys,
        aggs,
        key_template,
        biflow: rules.biflow,
        time_first_id,
        time_last_id,
        count_id,
        out_schema,
    };
    resolve_out_ids(schema, &mut binding);
    Ok(binding)
}

fn resolve_time(schema: &Schema, name: &'static str) -> Result<usize, BindError> {
    let id = schema.id_of(name).ok_or(BindError::MissingTime(name))?;
    match schema.field(id).kind {
        FieldKind::Scalar(ElemKind::Time) => Ok(id),
        _ => Err(BindError::BadTimeKind(name)),
    }
}

fn build_key_template(schema: &Schema, keys: &[BoundKey], biflow: bool) -> Result<KeyTemplate, BindError> {
    let addresses = if biflow {
        let mut pair = (0, 0);
        for (name, slot) in [("SRC_IP", 0), ("DST_IP", 1)] {
            let key = keys
                .iter()
                .find(|key| key.name == name)
                .unwrap_or_else(|| unreachable!("biflow rules always carry {}", name));
            if key.kind != FieldKind::Scalar(ElemKind::Ip) {
                return Err(BindError::BiflowAddressKind { name: key.name.clone(), kind: key.kind });
            }
            if slot == 0 {
                pair.0 = key.id;
            } else {
                pair.1 = key.id;
            }
        }
        Some(pair)
    } else {
        None
    };

    let mut template = KeyTemplate::new(addresses);
    for key in keys {
        template.add(key.id, key.rev_id, key.kind);
    }
    debug_assert!(schema.len() >= keys.len());
    Ok(template)
}

/// The output schema: the mandatory header, the key columns, then the
/// aggregated columns in configuration order. A configured name that clashes
/// with an earlier column folds into it, as a template set would.
fn build_out_schema(keys: &[BoundKey], aggs: &[BoundAgg]) -> Schema {
    let mut fields = vec![
        FieldDef { name: TIME_FIRST.to_string(), kind: FieldKind::Scalar(ElemKind::Time) },
        FieldDef { name: TIME_LAST.to_string(), kind: FieldKind::Scalar(ElemKind::Time) },
        FieldDef { name: COUNT.to_string(), kind: FieldKind::Scalar(ElemKind::U32) },
    ];
    let mut push = |fields: &mut Vec<FieldDef>, name: &str, kind: FieldKind| {
        if !fields.iter().any(|field| field.name == name) {
            fields.push(FieldDef { name: name.to_string(), kind });
        }
    };
    for key in keys {
        push(&mut fields, &key.name, key.kind);
    }
    for agg in aggs.iter().filter(|agg| agg.to_output) {
        push(&mut fields, &agg.name, agg.agg.kind());
    }
    Schema::new(fields).unwrap_or_else(|_| unreachable!("columns are deduplicated"))
}

fn resolve_out_ids(schema: &Schema, binding: &mut Binding) {
    let out = &binding.out_schema;
    for key in &mut binding.keys {
        key.out_id = out.id_of(&key.name).unwrap_or_else(|| unreachable!("key column exists"));
        let reverse = &schema.field(key.rev_id).name;
        key.out_rev_id = out.id_of(reverse).unwrap_or(key.out_id);
    }
    for agg in &mut binding.aggs {
        if !agg.to_output {
            continue;
        }
        let out_id = out.id_of(&agg.name).unwrap_or_else(|| unreachable!("agg column exists"));
        agg.out_id = Some(out_id);
        let reverse = &schema.field(agg.rev_id).name;
        agg.out_rev_id = Some(out.id_of(reverse).unwrap_or(out_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_rules;

    const BIFLOW_RULES: &str = r#"
        <aggregator>
          <id name="main">
            <field><name>SRC_IP</name><type>KEY</type><reverse_name>DST_IP</reverse_name></field>
            <field><name>DST_IP</name><type>KEY</type><reverse_name>SRC_IP</reverse_name></field>
            <field><name>SRC_PORT</name><type>KEY</type><reverse_name>DST_PORT</reverse_name></field>
            <field><name>DST_PORT</name><type>KEY</type><reverse_name>SRC_PORT</reverse_name></field>
            <field><name>PROTOCOL</name><type>KEY</type></field>
            <field><name>PACKETS</name><type>SUM</type><reverse_name>PACKETS_REV</reverse_name></field>
          </id>
        </aggregator>"#;

    fn biflow_schema() -> Schema {
        Schema::parse(
            "time TIME_FIRST,time TIME_LAST,uint32 COUNT,ipaddr SRC_IP,ipaddr DST_IP,\
             uint16 SRC_PORT,uint16 DST_PORT,uint8 PROTOCOL,uint32 PACKETS,uint32 PACKETS_REV",
        )
        .unwrap()
    }

    #[test]
    fn binds_biflow_rules() {
        let rules = parse_rules(BIFLOW_RULES, "main").unwrap();
        let schema = biflow_schema();
        let binding = bind(&rules, &schema).unwrap();

        assert!(binding.biflow);
        assert_eq!(binding.keys.len(), 5);
        assert_eq!(binding.aggs.len(), 2); // PACKETS plus its mirror
        assert_eq!(binding.time_first_id, 0);
        assert_eq!(binding.count_id, Some(2));
        assert_eq!(binding.key_template.key_size(), 16 + 16 + 2 + 2 + 1);

        // SRC_IP swaps with DST_IP on reversed emission.
        let src = &binding.keys[0];
        assert_eq!(src.out_id, binding.out_schema.id_of("SRC_IP").unwrap());
        assert_eq!(src.out_rev_id, binding.out_schema.id_of("DST_IP").unwrap());

        // PACKETS swaps with its materialised mirror.
        let packets = &binding.aggs[0];
        assert_eq!(packets.out_id, binding.out_schema.id_of("PACKETS"));
        assert_eq!(packets.out_rev_id, binding.out_schema.id_of("PACKETS_REV"));

        // Output header comes first.
        assert_eq!(binding.out_schema.id_of("TIME_FIRST"), Some(OUT_TIME_FIRST));
        assert_eq!(binding.out_schema.id_of("TIME_LAST"), Some(OUT_TIME_LAST));
        assert_eq!(binding.out_schema.id_of("COUNT"), Some(OUT_COUNT));
    }

    #[test]
    fn missing_fields_are_named() {
        let rules = parse_rules(BIFLOW_RULES, "main").unwrap();
        let schema = Schema::parse("time TIME_FIRST,time TIME_LAST,ipaddr SRC_IP").unwrap();
        match bind(&rules, &schema) {
            Err(BindError::MissingField(name)) => assert_eq!(name, "DST_IP"),
            other => panic!("expected MissingField, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn mandatory_times_are_required() {
        let rules = parse_rules(
            r#"<aggregator><id name="x"><field><name>A</name><type>SUM</type></field></id></aggregator>"#,
            "x",
        )
        .unwrap();
        let schema = Schema::parse("uint32 A,time TIME_LAST").unwrap();
        assert!(matches!(bind(&rules, &schema), Err(BindError::MissingTime(TIME_FIRST))));
    }

    #[test]
    fn op_type_matrix_is_enforced() {
        let rules = parse_rules(
            r#"<aggregator><id name="x"><field><name>ADDR</name><type>SUM</type></field></id></aggregator>"#,
            "x",
        )
        .unwrap();
        let schema = Schema::parse("time TIME_FIRST,time TIME_LAST,ipaddr ADDR").unwrap();
        assert!(matches!(
            bind(&rules, &schema),
            Err(BindError::Incompatible { op: "SUM", .. })
        ));
    }

    #[test]
    fn sorted_merge_dir_rejects_unsigned_elements() {
        let rules = parse_rules(
            r#"<aggregator><id name="x">
                <field><name>K</name><type>KEY</type></field>
                <field><name>V</name><type>SORTED_MERGE_DIR</type><sort_key>T</sort_key><sort_type>ASCENDING</sort_type></field>
            </id></aggregator>"#,
            "x",
        )
        .unwrap();
        let schema = Schema::parse("time TIME_FIRST,time TIME_LAST,uint32 K,uint16* V,time* T").unwrap();
        assert!(matches!(bind(&rules, &schema), Err(BindError::Incompatible { op: "SORTED_MERGE_DIR", .. })));
    }

    #[test]
    fn sort_key_must_be_an_array() {
        let rules = parse_rules(
            r#"<aggregator><id name="x">
                <field><name>K</name><type>KEY</type></field>
                <field><name>V</name><type>SORTED_MERGE</type><sort_key>T</sort_key><sort_type>ASCENDING</sort_type></field>
            </id></aggregator>"#,
            "x",
        )
        .unwrap();
        let schema = Schema::parse("time TIME_FIRST,time TIME_LAST,uint32 K,int16* V,time T").unwrap();
        assert!(matches!(bind(&rules, &schema), Err(BindError::SortKeyIncompatible { .. })));
    }

    #[test]
    fn reverse_partner_kinds_must_match() {
        let rules = parse_rules(
            r#"<aggregator><id name="x">
                <field><name>A</name><type>SUM</type><reverse_name>B</reverse_name></field>
            </id></aggregator>"#,
            "x",
        )
        .unwrap();
        let schema = Schema::parse("time TIME_FIRST,time TIME_LAST,uint32 A,uint64 B").unwrap();
        assert!(matches!(bind(&rules, &schema), Err(BindError::ReverseKindMismatch { .. })));
    }
}
