//! The aggregator engine: the only mutator of flow state.
//!
//! One engine drives the whole pipeline: receive a record, advance the
//! watermark, retire expired flows, serialise the key, insert or update in
//! the cache, fold the record into per-field state, and emit merged records
//! whenever a flow dies — by passive or active timeout, by global flush, by
//! displacement, by eviction, by schema change, or at shutdown. Every one of
//! those paths funnels through the same finalize-and-emit routine, so a flow
//! that entered the cache leaves it exactly once.
//!
//! Time is the watermark: the largest `TIME_LAST` seen. Nothing here reads a
//! clock, so a run over a captured stream reproduces its emissions.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::arena::{KeyHandle, KeyPool, SlotHandle, SlotPool, NIL};
use crate::binding::{bind, BindError, Binding, OUT_COUNT, OUT_TIME_FIRST, OUT_TIME_LAST};
use crate::cache::{FlowCache, Insert};
use crate::config::{FlushMode, Rules, Settings};
use crate::expiry::ExpiryList;
use crate::key::InternTable;
use crate::ops::{FieldOutput, FieldSource};
use crate::record::{RecordBuilder, RecordView, Schema, Template};
use crate::transport::{Event, Input, Output, SendError, TransportError};
use crate::types::{FieldKind, Scalar, Timestamp};

/// Send attempts per record before it is dropped.
const MAX_SEND_TRIES: usize = 3;

/// Errors that stop the run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A record arrived before any schema announcement.
    #[error("record received before any schema announcement")]
    NoSchema,
    /// The configuration does not bind against the announced schema.
    #[error(transparent)]
    Bind(#[from] BindError),
    /// The receive side failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Running counters, exposed for logging and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct EngineStats {
    /// Records received.
    pub received: u64,
    /// Records emitted downstream.
    pub emitted: u64,
    /// Emissions dropped after exhausting send retries.
    pub dropped: u64,
    /// Records skipped as malformed or inconsistent.
    pub skipped: u64,
    /// Flows retired by passive or active timeout.
    pub expired: u64,
    /// Flows retired to make room when the cache was full.
    pub evicted: u64,
    /// Flows displaced by a saturated probe window.
    pub swapped: u64,
    /// Global flushes fired.
    pub flushes: u64,
    /// Schema rebinds performed.
    pub rebinds: u64,
}

/// Everything fixed by one binding.
struct Plan {
    binding: Binding,
    in_template: Template,
    out_template: Template,
}

/// Everything the binding's run mutates.
struct RunState {
    keys: KeyPool,
    slots: SlotPool,
    cache: FlowCache,
    expiry: ExpiryList,
    interner: InternTable,
    builder: RecordBuilder,
    key_buf: Vec<u8>,
    elems: Vec<Scalar>,
    pairs: Vec<(Scalar, Scalar)>,
    flush_scratch: Vec<(KeyHandle, SlotHandle)>,
}

struct Bound {
    plan: Plan,
    state: RunState,
}

/// The aggregator. Owns the rule configuration, the current binding with its
/// arenas and cache, and the watermark.
pub struct Engine {
    rules: Rules,
    settings: Settings,
    stats: EngineStats,
    bound: Option<Bound>,
    watermark: Timestamp,
    last_flush: u64,
}

impl Engine {
    /// An engine for one validated rule-set.
    pub fn new(rules: Rules, settings: Settings) -> Engine {
        Engine {
            rules,
            settings,
            stats: EngineStats::default(),
            bound: None,
            watermark: Timestamp(0),
            last_flush: 0,
        }
    }

    /// The running counters.
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Number of currently live flows.
    pub fn live_flows(&self) -> usize {
        self.bound.as_ref().map_or(0, |bound| bound.state.cache.len())
    }

    /// Outstanding (key, slot) arena allocations; both zero once every flow
    /// has been emitted.
    pub fn pools_outstanding(&self) -> (usize, usize) {
        self.bound
            .as_ref()
            .map_or((0, 0), |bound| (bound.state.keys.outstanding(), bound.state.slots.outstanding()))
    }

    /// The engine's notion of current time.
    pub fn watermark(&self) -> Timestamp {
        self.watermark
    }

    /// The reference point of the last global flush, in seconds.
    pub fn last_flush(&self) -> u64 {
        self.last_flush
    }

    /// Rebinds to a newly-announced input schema.
    ///
    /// Every live flow is finalized and emitted first, then both arenas, the
    /// cache, and the expiry list are rebuilt for the new binding, and the
    /// new output schema is announced downstream.
    pub fn on_schema<O: Output>(&mut self, schema: &Schema, out: &mut O) -> Result<(), EngineError> {
        if let Some(bound) = self.bound.as_mut() {
            flush_all(&bound.plan, &mut bound.state, &mut self.stats, out);
            if let Err(err) = out.flush() {
                warn!(error = %err, "cannot flush on schema change");
            }
        }

        let binding = bind(&self.rules, schema)?;
        let in_template = Template::new(schema);
        let out_template = Template::new(&binding.out_schema);
        if let Err(err) = out.announce(&binding.out_schema) {
            warn!(error = %err, "cannot announce output schema");
        }

        let capacity = self.settings.capacity.next_power_of_two().max(4);
        let keys = KeyPool::new(capacity + 1, binding.key_template.key_size());
        let slots = SlotPool::new(capacity + 1, || {
            binding.aggs.iter().map(|agg| agg.agg.new_state()).collect()
        });
        let builder = RecordBuilder::new(&out_template);

        info!(input = %schema, output = %binding.out_schema, biflow = binding.biflow, "bound input schema");
        self.stats.rebinds += 1;
        self.bound = Some(Bound {
            plan: Plan { binding, in_template, out_template },
            state: RunState {
                keys,
                slots,
                cache: FlowCache::with_capacity(capacity),
                expiry: ExpiryList::new(),
                interner: InternTable::new(),
                builder,
                key_buf: Vec::new(),
                elems: Vec::new(),
                pairs: Vec::new(),
                flush_scratch: Vec::new(),
            },
        });
        Ok(())
    }

    /// Processes one received record.
    pub fn on_record<O: Output>(&mut self, bytes: &[u8], out: &mut O) -> Result<(), EngineError> {
        let Some(bound) = self.bound.as_mut() else {
            return Err(EngineError::NoSchema);
        };
        let plan = &bound.plan;
        let state = &mut bound.state;
        self.stats.received += 1;

        let view = match RecordView::new(bytes, &plan.in_template) {
            Ok(view) => view,
            Err(err) => {
                self.stats.skipped += 1;
                debug!(error = %err, "skipping malformed record");
                return Ok(());
            }
        };

        let time_first = view.time(plan.binding.time_first_id);
        let time_last = view.time(plan.binding.time_last_id);
        if time_last > self.watermark {
            self.watermark = time_last;
        }
        let watermark = self.watermark.secs();

        drain_expired(plan, state, &mut self.stats, out, watermark);

        if let Some(schedule) = self.settings.flush {
            if watermark - self.last_flush >= schedule.interval {
                flush_all(plan, state, &mut self.stats, out);
                if let Err(err) = out.flush() {
                    warn!(error = %err, "cannot flush after global flush");
                }
                self.stats.flushes += 1;
                self.last_flush = match schedule.mode {
                    FlushMode::Relative => watermark,
                    FlushMode::Absolute => watermark / schedule.interval * schedule.interval,
                };
            }
        }

        // A sorted merge needs one sort key per value; a record that breaks
        // that is skipped before it can touch any state.
        for agg in &plan.binding.aggs {
            if let Some(sort_id) = agg.sort_id {
                if view.elem_count(agg.id) != view.elem_count(sort_id) {
                    self.stats.skipped += 1;
                    debug!(field = %agg.name, "value and sort key lengths disagree, skipping record");
                    return Ok(());
                }
            }
        }

        let reversed = plan.binding.key_template.build(&view, &mut state.key_buf);
        let count = match plan.binding.count_id {
            Some(id) => match view.scalar(id) {
                Scalar::U32(count) => count,
                _ => 1,
            },
            None => 1,
        };

        let hash = FlowCache::hash(&state.key_buf);
        let mut attempt = state.cache.insert(&state.key_buf, hash, &state.keys);
        loop {
            match attempt {
                Insert::Duplicated(slot) => {
                    let (_, flow) = state.cache.entry(slot);
                    update_flow(
                        plan,
                        state,
                        flow,
                        view,
                        time_first,
                        time_last,
                        count,
                        reversed,
                        &self.settings,
                    );
                    break;
                }
                Insert::Inserted(slot) => {
                    admit(
                        plan,
                        state,
                        slot,
                        hash,
                        view,
                        time_first,
                        time_last,
                        count,
                        reversed,
                        &self.settings,
                    );
                    break;
                }
                Insert::Swapped { slot, key, flow } => {
                    self.stats.swapped += 1;
                    retire_flow(plan, state, &mut self.stats, out, key, flow);
                    admit(
                        plan,
                        state,
                        slot,
                        hash,
                        view,
                        time_first,
                        time_last,
                        count,
                        reversed,
                        &self.settings,
                    );
                    break;
                }
                Insert::Full => {
                    // Evict the flow closest to expiry, then retry; with a
                    // slot free the retry cannot report Full again.
                    let victim = match state.expiry.head() {
                        Some(victim) => victim,
                        None => panic!("cache full with an empty expiry list"),
                    };
                    let victim_key = state.slots.get(victim).key;
                    let victim_hash = FlowCache::hash(state.keys.get(victim_key));
                    let removed = state.cache.remove(state.keys.get(victim_key), victim_hash, &state.keys);
                    match removed {
                        Some((key, flow)) => debug_assert!(key == victim_key && flow == victim),
                        None => panic!("expiry head missing from the cache"),
                    }
                    self.stats.evicted += 1;
                    retire_flow(plan, state, &mut self.stats, out, victim_key, victim);
                    attempt = state.cache.insert(&state.key_buf, hash, &state.keys);
                }
            }
        }

        Ok(())
    }

    /// Finalizes and emits every live flow, announces end-of-stream, and
    /// flushes the sink. The terminal step of every run.
    pub fn finish<O: Output>(&mut self, out: &mut O) {
        if let Some(bound) = self.bound.as_mut() {
            flush_all(&bound.plan, &mut bound.state, &mut self.stats, out);
        }
        if let Err(err) = out.eof() {
            warn!(error = %err, "cannot announce end of stream");
        }
        if let Err(err) = out.flush() {
            warn!(error = %err, "cannot flush at shutdown");
        }
        info!(
            received = self.stats.received,
            emitted = self.stats.emitted,
            dropped = self.stats.dropped,
            skipped = self.stats.skipped,
            "aggregator finished"
        );
    }

    /// Drives the engine from a transport until `stop` is raised, the stream
    /// closes, or (with the EOF flag) the stream ends.
    pub fn run<I: Input, O: Output>(
        &mut self,
        input: &mut I,
        out: &mut O,
        stop: &AtomicBool,
    ) -> Result<(), EngineError> {
        let mut buf = Vec::new();
        while !stop.load(Ordering::Relaxed) {
            match input.recv(&mut buf) {
                Ok(Event::Record) => self.on_record(&buf, out)?,
                Ok(Event::Schema(schema)) => self.on_schema(&schema, out)?,
                Ok(Event::Eof) => {
                    if self.settings.eof_terminates {
                        break;
                    }
                }
                Ok(Event::Idle) => continue,
                Err(TransportError::Closed) => break,
                Err(err) => {
                    self.finish(out);
                    return Err(err.into());
                }
            }
        }
        self.finish(out);
        Ok(())
    }
}

/// Creates the flow for a never-before-seen key in the claimed cache slot.
#[allow(clippy::too_many_arguments)]
fn admit(
    plan: &Plan,
    state: &mut RunState,
    cache_slot: usize,
    hash: u64,
    view: RecordView<'_>,
    time_first: Timestamp,
    time_last: Timestamp,
    count: u32,
    reversed: bool,
    settings: &Settings,
) {
    let key = state.keys.acquire();
    state.keys.write(key, &state.key_buf);
    let flow = state.slots.acquire();

    {
        let slot = state.slots.get_mut(flow);
        slot.prev = NIL;
        slot.next = NIL;
        slot.key = key;
        slot.count = 0;
        slot.time_first = Timestamp(u64::MAX);
        slot.time_last = Timestamp(0);
        slot.reversed = false;
        slot.passive_deadline = time_last.secs() + settings.passive_secs;
        slot.active_deadline = time_first.secs() + settings.active_secs;
        for (agg, field_state) in plan.binding.aggs.iter().zip(slot.states.iter_mut()) {
            agg.agg.reset(field_state);
        }
        slot.update(time_first, time_last, count, reversed);
    }

    state.expiry.insert(state.slots.as_mut_slice(), flow);
    if plan.binding.key_template.has_strings() {
        plan.binding.key_template.intern_strings(&view, reversed, &mut state.interner);
    }
    state.cache.occupy(cache_slot, hash, key, flow);
    combine_record(plan, state, flow, view, reversed);
}

/// Folds a record into an existing flow and repositions its timeout.
#[allow(clippy::too_many_arguments)]
fn update_flow(
    plan: &Plan,
    state: &mut RunState,
    flow: SlotHandle,
    view: RecordView<'_>,
    time_first: Timestamp,
    time_last: Timestamp,
    count: u32,
    reversed: bool,
    settings: &Settings,
) {
    let slot = state.slots.get_mut(flow);
    slot.update(time_first, time_last, count, reversed);

    let old_passive = slot.passive_deadline;
    let active_candidate = time_first.secs() + settings.active_secs;
    if active_candidate < slot.active_deadline {
        slot.active_deadline = active_candidate;
    }
    slot.passive_deadline = (time_last.secs() + settings.passive_secs).min(slot.active_deadline);
    if slot.passive_deadline != old_passive {
        state.expiry.reposition(state.slots.as_mut_slice(), flow);
    }

    combine_record(plan, state, flow, view, reversed);
}

/// Runs every bound field's combiner against one record.
fn combine_record(plan: &Plan, state: &mut RunState, flow: SlotHandle, view: RecordView<'_>, reversed: bool) {
    let slot = state.slots.get_mut(flow);
    for (agg, field_state) in plan.binding.aggs.iter().zip(slot.states.iter_mut()) {
        match agg.agg.kind() {
            FieldKind::Scalar(_) => {
                let id = if reversed { agg.rev_id } else { agg.id };
                agg.agg.combine(field_state, FieldSource::Scalar(view.scalar(id)));
            }
            FieldKind::String => {
                agg.agg.combine(field_state, FieldSource::Text(view.var_bytes(agg.id)));
            }
            FieldKind::Array(_) => match agg.sort_id {
                Some(sort_id) => {
                    state.pairs.clear();
                    state.pairs.extend(view.array(agg.id).zip(view.array(sort_id)));
                    agg.agg.combine(field_state, FieldSource::Pairs(&state.pairs, reversed));
                }
                None => {
                    state.elems.clear();
                    state.elems.extend(view.array(agg.id));
                    agg.agg.combine(field_state, FieldSource::Elems(&state.elems));
                }
            },
            FieldKind::Bytes => unreachable!("no operator binds a bytes field"),
        }
    }
}

/// Finalize-and-emit, then unlink and recycle the flow's arena blocks.
/// Cache membership is the caller's business.
fn retire_flow<O: Output>(
    plan: &Plan,
    state: &mut RunState,
    stats: &mut EngineStats,
    out: &mut O,
    key: KeyHandle,
    flow: SlotHandle,
) {
    emit_flow(plan, state, stats, out, key, flow);
    state.expiry.unlink(state.slots.as_mut_slice(), flow);
    state.keys.release(key);
    state.slots.release(flow);
}

/// The single emit routine behind every flow destruction path.
fn emit_flow<O: Output>(
    plan: &Plan,
    state: &mut RunState,
    stats: &mut EngineStats,
    out: &mut O,
    key: KeyHandle,
    flow: SlotHandle,
) {
    let out_template = &plan.out_template;
    state.builder.clear(out_template);

    let (reversed, time_first, time_last, count) = {
        let slot = state.slots.get(flow);
        (slot.reversed, slot.time_first, slot.time_last, slot.count)
    };
    state.builder.set_scalar(out_template, OUT_TIME_FIRST, &Scalar::Time(time_first));
    state.builder.set_scalar(out_template, OUT_TIME_LAST, &Scalar::Time(time_last));
    state.builder.set_scalar(out_template, OUT_COUNT, &Scalar::U32(count));

    // Key fields, from the serialised key; a reversed flow writes each field
    // into its partner's column.
    let mut offset = 0;
    for key_field in &plan.binding.keys {
        let out_id = if reversed { key_field.out_rev_id } else { key_field.out_id };
        let bytes = &state.keys.get(key)[offset..offset + key_field.width];
        match key_field.kind {
            FieldKind::String => {
                let hash = u64::from_le_bytes(bytes.try_into().unwrap_or_else(|_| unreachable!("hash width")));
                match state.interner.get(hash) {
                    Some(text) => state.builder.set_var(out_id, text),
                    None => panic!("interned key string missing at emit"),
                }
                state.interner.release(hash);
            }
            _ => state.builder.set_raw(out_template, out_id, bytes),
        }
        offset += key_field.width;
    }

    // Aggregated fields; scalars follow the reversed flag, sequence outputs
    // always land in their own column.
    {
        let slot = state.slots.get_mut(flow);
        for (agg, field_state) in plan.binding.aggs.iter().zip(slot.states.iter_mut()) {
            let Some(out_id) = agg.out_id else { continue };
            match agg.agg.finalize(field_state) {
                FieldOutput::Scalar(value) => {
                    let target = if reversed { agg.out_rev_id.unwrap_or(out_id) } else { out_id };
                    state.builder.set_scalar(out_template, target, &value);
                }
                FieldOutput::Bytes(bytes) => state.builder.set_var(out_id, bytes),
                FieldOutput::Array(values) => state.builder.set_array(out_id, values),
            }
        }
    }

    let record = match state.builder.finish(out_template) {
        Ok(record) => record,
        Err(err) => {
            warn!(error = %err, "cannot assemble output record, dropping");
            stats.dropped += 1;
            return;
        }
    };

    for attempt in 1..=MAX_SEND_TRIES {
        match out.send(record) {
            Ok(()) => {
                stats.emitted += 1;
                return;
            }
            Err(SendError::Transient) => {
                debug!(attempt, "transient send failure, retrying");
            }
            Err(SendError::Fatal(err)) => {
                warn!(error = %err, "send failed");
                break;
            }
        }
    }
    warn!("cannot send record due to error or timeout, dropping");
    stats.dropped += 1;
}

/// Retires every flow whose passive (or active) deadline is due.
fn drain_expired<O: Output>(
    plan: &Plan,
    state: &mut RunState,
    stats: &mut EngineStats,
    out: &mut O,
    watermark: u64,
) {
    let mut emitted = false;
    while let Some(head) = state.expiry.head() {
        let (passive, active, key) = {
            let slot = state.slots.get(head);
            (slot.passive_deadline, slot.active_deadline, slot.key)
        };
        if passive > watermark && active > watermark {
            break;
        }
        let hash = FlowCache::hash(state.keys.get(key));
        match state.cache.remove(state.keys.get(key), hash, &state.keys) {
            Some((removed_key, removed_flow)) => {
                debug_assert!(removed_key == key && removed_flow == head);
            }
            None => panic!("expired flow missing from the cache"),
        }
        stats.expired += 1;
        retire_flow(plan, state, stats, out, key, head);
        emitted = true;
    }
    if emitted {
        if let Err(err) = out.flush() {
            warn!(error = %err, "cannot flush after expiry");
        }
    }
}

/// Finalizes and emits every live flow and resets the cache, the expiry list,
/// and both arenas. Used by the global flush, schema changes, and shutdown.
fn flush_all<O: Output>(plan: &Plan, state: &mut RunState, stats: &mut EngineStats, out: &mut O) {
    let mut pending = std::mem::take(&mut state.flush_scratch);
    pending.clear();
    pending.extend(state.cache.iter());
    for &(key, flow) in &pending {
        emit_flow(plan, state, stats, out, key, flow);
        state.keys.release(key);
        state.slots.release(flow);
    }
    pending.clear();
    state.flush_scratch = pending;
    state.cache.clear();
    state.expiry.clear();
    debug_assert!(state.interner.is_empty(), "intern refcounts leaked across a flush");
}
