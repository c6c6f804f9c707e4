//! A biflow-aware aggregator for streams of unidirectional flow records.
//!
//! Records arrive over a message bus, each describing one direction of
//! network traffic over a short window. The aggregator groups them by a
//! configured key — optionally canonicalised across direction, so that the
//! two sides of a conversation share one state — applies a per-field
//! aggregation function to every configured field, and emits a single merged
//! record per key once the flow's passive or active timeout expires, a global
//! flush fires, or the bounded flow cache must make room.
//!
//! The moving parts, bottom up:
//!
//! - [`types`] and [`record`]: scalar values, dynamic schemas, and the
//!   byte-level record layout shared with the bus.
//! - [`config`] and [`binding`]: the XML rule file, and its resolution
//!   against the live input schema with the operator/type matrix enforced.
//! - [`ops`]: per-field aggregation state and its init/combine/finalize
//!   plane.
//! - [`key`], [`arena`], [`expiry`], [`cache`]: the flow-key codec with
//!   string interning, the slab pools all per-flow state lives in, the
//!   deadline-ordered expiry list threaded through those slabs, and the
//!   bounded open-addressed flow table.
//! - [`engine`]: the single-threaded loop that ties the above together.
//! - [`transport`]: the framed message-bus boundary.
//!
//! The engine is deterministic over its input: expiry is driven by the
//! watermark of observed record times, never by a wall clock.

#![forbid(missing_docs)]

pub mod arena;
pub mod binding;
pub mod cache;
pub mod config;
pub mod engine;
pub mod expiry;
pub mod key;
pub mod ops;
pub mod record;
pub mod transport;
pub mod types;

pub use engine::{Engine, EngineError, EngineStats};
pub use record::Schema;
