//! Flow-key serialisation and interning.
//!
//! The key template captures the bound key fields in configuration order.
//! Serialising a record's key concatenates the fields' raw bytes into a
//! fixed-width buffer; a string key field contributes the 64-bit hash of its
//! bytes instead, and the intern table keeps the original bytes alive,
//! refcounted, until every flow that references them has been emitted.
//!
//! For a biflow key the two addresses pick the direction: when the source
//! address exceeds the destination address as an unsigned big-endian integer,
//! every key field is written from its reverse partner's slot and the record
//! is flagged as reversed.

use std::hash::Hasher;

use fnv::{FnvHashMap, FnvHasher};
use smallvec::SmallVec;

use crate::record::RecordView;
use crate::types::FieldKind;

/// Serialised width of a string key field: the width of its 64-bit hash.
pub const STRING_KEY_WIDTH: usize = 8;

/// A well-distributed 64-bit value derived from a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

/// One bound key field.
#[derive(Clone, Copy, Debug)]
pub struct KeyField {
    /// Input field id.
    pub id: usize,
    /// Reverse partner's input field id; equals `id` without a partner.
    pub rev_id: usize,
    /// Field shape.
    pub kind: FieldKind,
    /// Serialised width within the key.
    pub width: usize,
}

/// The bound key fields, their total width, and the biflow address pair.
#[derive(Clone, Debug, Default)]
pub struct KeyTemplate {
    fields: SmallVec<[KeyField; 8]>,
    key_size: usize,
    biflow: Option<(usize, usize)>,
}

impl KeyTemplate {
    /// An empty template; biflow templates name the (source, destination)
    /// address field ids used for canonicalisation.
    pub fn new(biflow: Option<(usize, usize)>) -> KeyTemplate {
        KeyTemplate { fields: SmallVec::new(), key_size: 0, biflow }
    }

    /// Appends a key field. Strings serialise as their hash.
    pub fn add(&mut self, id: usize, rev_id: usize, kind: FieldKind) {
        let width = match kind {
            FieldKind::String => STRING_KEY_WIDTH,
            FieldKind::Scalar(elem) => elem.size(),
            other => panic!("{} cannot be a key field", other),
        };
        self.fields.push(KeyField { id, rev_id, kind, width });
        self.key_size += width;
    }

    /// Total serialised key width in bytes.
    #[inline]
    pub fn key_size(&self) -> usize {
        self.key_size
    }

    /// The bound key fields in order.
    #[inline]
    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    /// True when the template is canonicalised across direction.
    #[inline]
    pub fn is_biflow(&self) -> bool {
        self.biflow.is_some()
    }

    /// True when any key field is a string.
    pub fn has_strings(&self) -> bool {
        self.fields.iter().any(|field| field.kind == FieldKind::String)
    }

    /// Serialises the record's key into `out` and reports whether the record
    /// ran against the canonical direction.
    pub fn build(&self, view: &RecordView<'_>, out: &mut Vec<u8>) -> bool {
        out.clear();
        let reversed = match self.biflow {
            Some((src, dst)) => view.scalar(src).total_cmp(&view.scalar(dst)).is_gt(),
            None => false,
        };
        for field in &self.fields {
            let id = if reversed { field.rev_id } else { field.id };
            match field.kind {
                FieldKind::String => {
                    out.extend_from_slice(&hash_bytes(view.var_bytes(id)).to_le_bytes());
                }
                _ => out.extend_from_slice(view.raw(id)),
            }
        }
        reversed
    }

    /// Interns the record's string key fields, bumping refcounts. Called once
    /// per admitted flow, mirrored by one release per string at emit.
    pub fn intern_strings(&self, view: &RecordView<'_>, reversed: bool, interner: &mut InternTable) {
        for field in &self.fields {
            if field.kind != FieldKind::String {
                continue;
            }
            let id = if reversed { field.rev_id } else { field.id };
            interner.insert(view.var_bytes(id));
        }
    }
}

/// Refcounted storage for the string payloads behind hashed key fields.
#[derive(Debug, Default)]
pub struct InternTable {
    entries: FnvHashMap<u64, (Vec<u8>, usize)>,
}

impl InternTable {
    /// An empty table.
    pub fn new() -> InternTable {
        InternTable::default()
    }

    /// Stores `bytes` under their hash, or bumps the refcount of the entry
    /// already there.
    pub fn insert(&mut self, bytes: &[u8]) -> u64 {
        let hash = hash_bytes(bytes);
        let entry = self.entries.entry(hash).or_insert_with(|| (bytes.to_vec(), 0));
        entry.1 += 1;
        hash
    }

    /// The interned bytes for a hash.
    pub fn get(&self, hash: u64) -> Option<&[u8]> {
        self.entries.get(&hash).map(|(bytes, _)| bytes.as_slice())
    }

    /// Drops one reference, removing the entry when none remain.
    pub fn release(&mut self, hash: u64) {
        match self.entries.get_mut(&hash) {
            Some((_, refs)) if *refs > 1 => *refs -= 1,
            Some(_) => {
                self.entries.remove(&hash);
            }
            None => panic!("release of a string hash that was never interned"),
        }
    }

    /// Number of distinct interned strings.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is interned.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forgets everything; used when the whole cache is torn down.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
