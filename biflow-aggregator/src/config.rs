//! The rule file and the runtime settings.
//!
//! A rule file is an XML tree: an `aggregator` root holding one or more `id`
//! rule-sets, each identified by a `name` attribute and holding `field`
//! entries. One rule-set is selected at startup. Every field entry names an
//! input field and the operator applied to it, plus the optional reverse
//! partner, sort key, delimiter, and size bound.
//!
//! Once a rule-set parses, the canonical 5-tuple check runs: if the key set
//! contains `SRC_IP`, `DST_IP`, `SRC_PORT`, `DST_PORT` and `PROTOCOL` with
//! consistent reverse pairings, the rule-set is a biflow key, and every
//! aggregation field with a declared reverse partner grows a mirrored
//! output-only partner field so emission can swap direction.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::ops::{FieldOp, SortOrder};

/// The names making up the canonical 5-tuple.
const BIFLOW_KEYS: [&str; 5] = ["SRC_IP", "DST_IP", "SRC_PORT", "DST_PORT", "PROTOCOL"];

/// The reverse pairings the 5-tuple must declare.
const BIFLOW_PAIRS: [(&str, &str); 4] = [
    ("SRC_IP", "DST_IP"),
    ("DST_IP", "SRC_IP"),
    ("SRC_PORT", "DST_PORT"),
    ("DST_PORT", "SRC_PORT"),
];

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The rule file could not be read.
    #[error("cannot read rule file: {0}")]
    Io(#[from] std::io::Error),
    /// The XML does not match the expected tree.
    #[error("invalid rule file: {0}")]
    Xml(#[from] quick_xml::DeError),
    /// The root element is not `aggregator`.
    #[error("invalid rule file: expected root element 'aggregator', found {0:?}")]
    BadRoot(String),
    /// No rule-set carries the requested name.
    #[error("no rule-set named {0:?} in the rule file")]
    RuleSetNotFound(String),
    /// A field entry has no name.
    #[error("field entry without a name")]
    MissingName,
    /// A field entry has no operator.
    #[error("field {0:?} has no type")]
    MissingOp(String),
    /// A field entry names an unknown operator.
    #[error("field {field:?} has invalid type {op:?}, expected KEY|SUM|MIN|MAX|AVG|FIRST|FIRST_NON_EMPTY|LAST|LAST_NON_EMPTY|BITAND|BITOR|APPEND|SORTED_MERGE|SORTED_MERGE_DIR")]
    UnknownOp {
        /// Field name.
        field: String,
        /// The unrecognised operator.
        op: String,
    },
    /// A sorted merge without a sort key.
    #[error("field {0:?} is a sorted merge but has no sort_key")]
    MissingSortKey(String),
    /// A sorted merge without a sort order.
    #[error("field {0:?} is a sorted merge but has no sort_type")]
    MissingSortOrder(String),
    /// A sort order other than ASCENDING or DESCENDING.
    #[error("field {field:?} has invalid sort_type {value:?}, expected ASCENDING|DESCENDING")]
    UnknownSortOrder {
        /// Field name.
        field: String,
        /// The unrecognised order.
        value: String,
    },
    /// A delimiter that is not exactly one byte.
    #[error("field {field:?} has a delimiter of {len} bytes, expected 1")]
    BadDelimiter {
        /// Field name.
        field: String,
        /// Length found.
        len: usize,
    },
    /// A size that is not a positive integer.
    #[error("field {field:?} has invalid size {value:?}, expected a positive number")]
    BadSize {
        /// Field name.
        field: String,
        /// The unparsable size.
        value: String,
    },
    /// Two field entries share a name.
    #[error("duplicate field name {0:?}")]
    DuplicateField(String),
    /// The canonical 5-tuple is present but mispaired.
    #[error("invalid combination of name/reverse_name, expected {name}/{expected}")]
    BiflowPairing {
        /// The mispaired field.
        name: String,
        /// The partner it must declare.
        expected: String,
    },
    /// The passive timeout exceeds the active timeout.
    #[error("passive timeout ({passive}s) cannot exceed active timeout ({active}s)")]
    PassiveExceedsActive {
        /// Configured passive timeout.
        passive: u64,
        /// Configured active timeout.
        active: u64,
    },
    /// A global-flush specification that does not parse.
    #[error("invalid flush timeout {0:?}, expected <interval>[a|absolute|r|relative]")]
    BadFlushSpec(String),
}

/// One validated field entry.
#[derive(Clone, Debug)]
pub struct FieldConfig {
    /// Input field name.
    pub name: String,
    /// Reverse partner name, when declared.
    pub reverse_name: Option<String>,
    /// The operator.
    pub op: FieldOp,
    /// Sort key field name, for the sorted merges.
    pub sort_key: Option<String>,
    /// Sort order, for the sorted merges.
    pub sort_order: SortOrder,
    /// Delimiter byte for string appends.
    pub delimiter: u8,
    /// Element or byte bound for the sequence operators.
    pub limit: usize,
    /// Whether the field appears in the output record.
    pub to_output: bool,
}

/// A validated rule-set: the field list plus the biflow flag.
#[derive(Clone, Debug)]
pub struct Rules {
    /// Field entries, configured ones first, then materialised mirrors.
    pub fields: Vec<FieldConfig>,
    /// Whether the key set is the canonical biflow 5-tuple.
    pub biflow: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct XmlField {
    name: Option<String>,
    #[serde(rename = "type")]
    op: Option<String>,
    reverse_name: Option<String>,
    sort_key: Option<String>,
    sort_type: Option<String>,
    delimiter: Option<String>,
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlRuleSet {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "field", default)]
    fields: Vec<XmlField>,
}

#[derive(Debug, Deserialize)]
struct XmlRules {
    #[serde(rename = "id", default)]
    sets: Vec<XmlRuleSet>,
}

/// Loads and validates the rule-set `identifier` from the file at `path`.
pub fn load_rules(path: &Path, identifier: &str) -> Result<Rules, ConfigError> {
    parse_rules(&fs::read_to_string(path)?, identifier)
}

/// Parses and validates the rule-set `identifier` from XML text.
pub fn parse_rules(xml: &str, identifier: &str) -> Result<Rules, ConfigError> {
    check_root(xml)?;
    let doc: XmlRules = quick_xml::de::from_str(xml)?;
    let set = doc
        .sets
        .into_iter()
        .find(|set| set.name == identifier)
        .ok_or_else(|| ConfigError::RuleSetNotFound(identifier.to_string()))?;

    let mut fields = Vec::with_capacity(set.fields.len());
    for entry in set.fields {
        let field = validate_field(entry)?;
        if fields.iter().any(|prior: &FieldConfig| prior.name == field.name) {
            return Err(ConfigError::DuplicateField(field.name));
        }
        fields.push(field);
    }

    let biflow = check_biflow(&mut fields)?;
    Ok(Rules { fields, biflow })
}

/// The root element must be `aggregator`; serde does not check it.
fn check_root(xml: &str) -> Result<(), ConfigError> {
    use quick_xml::events::Event;
    let mut reader = quick_xml::Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                if name == "aggregator" {
                    return Ok(());
                }
                return Err(ConfigError::BadRoot(name));
            }
            Ok(Event::Eof) => return Err(ConfigError::BadRoot(String::new())),
            Ok(_) => continue,
            // Leave malformed XML for the deserializer, which reports it with
            // position information.
            Err(_) => return Ok(()),
        }
    }
}

fn validate_field(entry: XmlField) -> Result<FieldConfig, ConfigError> {
    let name = entry.name.filter(|name| !name.is_empty()).ok_or(ConfigError::MissingName)?;
    let op_name = entry.op.ok_or_else(|| ConfigError::MissingOp(name.clone()))?;
    let op = FieldOp::parse(&op_name)
        .ok_or_else(|| ConfigError::UnknownOp { field: name.clone(), op: op_name })?;

    let sort_order = match &entry.sort_type {
        Some(value) => SortOrder::parse(value).ok_or_else(|| ConfigError::UnknownSortOrder {
            field: name.clone(),
            value: value.clone(),
        })?,
        None => SortOrder::Ascending,
    };
    if op.is_sorted_merge() {
        if entry.sort_key.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::MissingSortKey(name));
        }
        if entry.sort_type.is_none() {
            return Err(ConfigError::MissingSortOrder(name));
        }
    }

    let delimiter = match &entry.delimiter {
        Some(text) if text.len() == 1 => text.as_bytes()[0],
        Some(text) => {
            return Err(ConfigError::BadDelimiter { field: name, len: text.len() });
        }
        None => 0,
    };

    let limit = match &entry.size {
        Some(text) => match text.parse::<usize>() {
            Ok(size) if size > 0 => size,
            _ => return Err(ConfigError::BadSize { field: name, value: text.clone() }),
        },
        None => usize::MAX,
    };

    Ok(FieldConfig {
        name,
        reverse_name: entry.reverse_name.filter(|reverse| !reverse.is_empty()),
        op,
        sort_key: entry.sort_key,
        sort_order,
        delimiter,
        limit,
        to_output: true,
    })
}

/// Detects the canonical biflow key and materialises mirror fields.
///
/// Mirrors are appended after the configured fields, in configuration order,
/// and only for aggregation fields whose reverse partner is not itself
/// configured. They are output-visible: the partner column must exist for
/// emission to swap direction into it.
fn check_biflow(fields: &mut Vec<FieldConfig>) -> Result<bool, ConfigError> {
    let is_key =
        |fields: &[FieldConfig], name: &str| fields.iter().any(|field| field.op == FieldOp::Key && field.name == name);

    if BIFLOW_KEYS.iter().any(|name| !is_key(fields, name)) {
        return Ok(false);
    }

    for (name, expected) in BIFLOW_PAIRS {
        let field = fields.iter().find(|field| field.name == name);
        let paired = field
            .and_then(|field| field.reverse_name.as_deref())
            .is_some_and(|reverse| reverse == expected);
        if !paired {
            return Err(ConfigError::BiflowPairing { name: name.to_string(), expected: expected.to_string() });
        }
    }

    let mirrors: Vec<FieldConfig> = fields
        .iter()
        .filter(|field| field.op != FieldOp::Key)
        .filter_map(|field| {
            let reverse = field.reverse_name.as_deref()?;
            if fields.iter().any(|other| other.name == reverse) {
                return None;
            }
            Some(FieldConfig {
                name: reverse.to_string(),
                reverse_name: Some(field.name.clone()),
                op: field.op,
                sort_key: field.sort_key.clone(),
                sort_order: field.sort_order,
                delimiter: field.delimiter,
                limit: field.limit,
                to_output: true,
            })
        })
        .collect();
    fields.extend(mirrors);

    Ok(true)
}

/// When the global flush resets its reference point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    /// `last_flush` becomes the watermark at which the flush fired.
    Relative,
    /// `last_flush` aligns down to the interval grid.
    Absolute,
}

/// The global-flush schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlushSchedule {
    /// Seconds between flushes.
    pub interval: u64,
    /// Reference-point mode.
    pub mode: FlushMode,
}

impl FlushSchedule {
    /// Parses `<interval>[a|absolute|r|relative]`; a bare interval is
    /// relative.
    pub fn parse(spec: &str) -> Result<FlushSchedule, ConfigError> {
        let split = spec.find(|ch: char| !ch.is_ascii_digit()).unwrap_or(spec.len());
        let (digits, suffix) = spec.split_at(split);
        let interval: u64 = digits
            .parse()
            .ok()
            .filter(|&interval| interval > 0)
            .ok_or_else(|| ConfigError::BadFlushSpec(spec.to_string()))?;
        let mode = match suffix {
            "a" | "absolute" => FlushMode::Absolute,
            "" | "r" | "relative" => FlushMode::Relative,
            _ => return Err(ConfigError::BadFlushSpec(spec.to_string())),
        };
        Ok(FlushSchedule { interval, mode })
    }
}

/// Runtime settings from the command surface.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Flow cache capacity; a power of two, at least 4.
    pub capacity: usize,
    /// Passive timeout in seconds.
    pub passive_secs: u64,
    /// Active timeout in seconds.
    pub active_secs: u64,
    /// Global-flush schedule, when configured.
    pub flush: Option<FlushSchedule>,
    /// Whether an end-of-stream frame terminates the run.
    pub eof_terminates: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            capacity: 1 << 16,
            passive_secs: 20,
            active_secs: 40,
            flush: None,
            eof_terminates: false,
        }
    }
}

impl Settings {
    /// Sets the cache capacity from a bit width: `2^bits` slots, floor 4.
    pub fn set_cache_bits(&mut self, bits: u32) {
        self.capacity = 1usize.checked_shl(bits).unwrap_or(0).max(4);
    }

    /// Rejects timeout combinations the expiry logic cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.passive_secs > self.active_secs {
            return Err(ConfigError::PassiveExceedsActive {
                passive: self.passive_secs,
                active: self.active_secs,
            });
        }
        Ok(())
    }
}
