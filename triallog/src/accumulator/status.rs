//! The trial ring: a fixed set of trial slots rotated under one status.

use metrics::counter;
use tracing::{debug, info, warn};

use triallog_wire::GroupPacket;

use super::{buffers::AllocError, group::GroupInfo, trie::GroupTrie, TRIAL_RING_SLOTS};

/// Metadata naming where a trial's artifacts belong. Each field carries a
/// `specified` bit: false means the default is still in place.
#[derive(Debug, Clone)]
pub struct TrialMeta {
    /// Data store name, the artifact tree root segment.
    pub data_store: MetaField<String>,
    /// Subject identifier.
    pub subject: MetaField<String>,
    /// Protocol name.
    pub protocol: MetaField<String>,
    /// Protocol version.
    pub protocol_version: MetaField<u32>,
    /// Save tag grouping related trials.
    pub save_tag: MetaField<u32>,
}

/// One metadata value plus whether a sender ever specified it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaField<T> {
    /// Current value, default until specified.
    pub value: T,
    /// True once a control command set the value.
    pub specified: bool,
}

impl<T> MetaField<T> {
    fn new(default: T) -> Self {
        Self {
            value: default,
            specified: false,
        }
    }

    /// Install a specified value.
    pub fn set(&mut self, value: T) {
        self.value = value;
        self.specified = true;
    }
}

impl Default for TrialMeta {
    fn default() -> Self {
        Self {
            data_store: MetaField::new("data".to_owned()),
            subject: MetaField::new("unknown".to_owned()),
            protocol: MetaField::new("unknown".to_owned()),
            protocol_version: MetaField::new(0),
            save_tag: MetaField::new(0),
        }
    }
}

/// State of one slot in the trial ring.
#[derive(Debug, Clone)]
pub struct TrialSlot {
    /// Slot is the current target of incoming samples.
    pub active_logging: bool,
    /// Writer currently holds this slot's data.
    pub active_writing: bool,
    /// At least one sample has landed in this slot.
    pub utilized: bool,
    /// Trial has ended; the slot is waiting to be written.
    pub completed: bool,
    /// Trial identifier, assigned explicitly or automatically.
    pub trial_id: u32,
    /// True until a concrete id is resolved at first utilization.
    pub auto_trial_id: bool,
    /// Portion counter for trials split across slots or statuses.
    pub trial_portion: u32,
    /// Local wallclock seconds when the slot was first utilized.
    pub wallclock_start: f64,
    /// Local wallclock seconds of the last update.
    pub wallclock_end: f64,
    /// Source timestamp (ms) of the first sample.
    pub timestamp_start: f64,
    /// Source timestamp (ms) of the most recent sample.
    pub timestamp_end: f64,
}

impl Default for TrialSlot {
    fn default() -> Self {
        Self {
            active_logging: false,
            active_writing: false,
            utilized: false,
            completed: false,
            trial_id: 0,
            auto_trial_id: true,
            trial_portion: 0,
            wallclock_start: 0.0,
            wallclock_end: 0.0,
            timestamp_start: 0.0,
            timestamp_end: 0.0,
        }
    }
}

impl TrialSlot {
    /// True when the slot holds no trial, pending or otherwise.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        !self.utilized && !self.completed && !self.active_writing
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    /// Seed the identity the slot will take on first utilization.
    fn seed(&mut self, trial_id: u32, auto: bool, portion: u32) {
        self.trial_id = trial_id;
        self.auto_trial_id = auto;
        self.trial_portion = portion;
    }
}

/// Outcome of a trial advance or split.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdvanceOutcome {
    /// Slot index that was completed, if any.
    pub completed: Option<usize>,
    /// A not-yet-written slot had to be dropped to make room.
    pub dropped_slot: bool,
}

/// The per-trial accumulator: ring of slots, metadata, and the group trie.
#[derive(Debug)]
pub struct DataLoggerStatus {
    /// Monotonic identity of this status, for writer tickets.
    pub serial: u64,
    /// Drop data until the first trial-advance command arrives.
    pub pending_next_trial: bool,
    /// No longer written into; waiting for the writer to drain it.
    pub retired: bool,
    /// Artifact-tree metadata.
    pub meta: TrialMeta,
    current_trial: usize,
    next_auto_trial_id: u32,
    by_trial: [TrialSlot; TRIAL_RING_SLOTS],
    gtrie: GroupTrie,
}

impl DataLoggerStatus {
    /// A fresh status that waits for the first trial-advance command.
    #[must_use]
    pub fn new(serial: u64) -> Self {
        Self {
            serial,
            pending_next_trial: true,
            retired: false,
            meta: TrialMeta::default(),
            current_trial: 0,
            next_auto_trial_id: 1,
            by_trial: Default::default(),
            gtrie: GroupTrie::new(),
        }
    }

    /// The status installed when `prev` retires: same metadata, same
    /// pending state, and continuation of any open trial as its next
    /// portion.
    #[must_use]
    pub fn successor(prev: &Self, serial: u64) -> Self {
        let mut fresh = Self::new(serial);
        fresh.meta = prev.meta.clone();
        fresh.pending_next_trial = prev.pending_next_trial;
        fresh.next_auto_trial_id = prev.next_auto_trial_id;
        let open = prev.current_slot();
        if open.utilized {
            fresh.by_trial[0].seed(open.trial_id, false, open.trial_portion + 1);
        } else {
            fresh.by_trial[0].seed(open.trial_id, open.auto_trial_id, open.trial_portion);
        }
        fresh
    }

    /// Index of the slot currently receiving samples.
    #[must_use]
    pub fn current_trial_index(&self) -> usize {
        self.current_trial
    }

    /// The slot currently receiving samples.
    #[must_use]
    pub fn current_slot(&self) -> &TrialSlot {
        &self.by_trial[self.current_trial]
    }

    /// A slot by ring index.
    #[must_use]
    pub fn slot(&self, idx: usize) -> &TrialSlot {
        &self.by_trial[idx]
    }

    /// The group trie owned by this status.
    #[must_use]
    pub fn groups(&self) -> &GroupTrie {
        &self.gtrie
    }

    fn mark_current_utilized(&mut self, wallclock: f64, timestamp: f64) {
        let slot = &mut self.by_trial[self.current_trial];
        if slot.utilized {
            return;
        }
        slot.utilized = true;
        slot.active_logging = true;
        slot.wallclock_start = wallclock;
        slot.wallclock_end = wallclock;
        slot.timestamp_start = timestamp;
        slot.timestamp_end = timestamp;
        if slot.auto_trial_id {
            slot.trial_id = self.next_auto_trial_id;
        }
        self.next_auto_trial_id = self.next_auto_trial_id.max(slot.trial_id + 1);
        debug!(
            trial_id = slot.trial_id,
            portion = slot.trial_portion,
            slot = self.current_trial,
            "trial slot utilized"
        );
    }

    /// Ingest one data packet into the current slot.
    ///
    /// Fails with [`IngestError::ConfigDrift`] when the named group exists
    /// under a different configuration hash; the caller retires this status
    /// and retries against a fresh one.
    pub fn ingest_data(&mut self, packet: &GroupPacket, wallclock: f64) -> Result<(), IngestError> {
        let header = &packet.header;
        let id = match self.gtrie.find(&header.name) {
            Some(id) => {
                let group = self.gtrie.get(id);
                if group.config_hash() != header.config_hash {
                    return Err(IngestError::ConfigDrift {
                        group: header.name.clone(),
                        was: group.config_hash(),
                        now: header.config_hash,
                    });
                }
                id
            }
            None => self
                .gtrie
                .insert(&header.name, GroupInfo::from_header(header)),
        };

        let slot = self.current_trial;
        let appended = self.gtrie.get_mut(id).ingest(id, slot, packet)?;
        if let Some(timestamp) = appended {
            self.mark_current_utilized(wallclock, timestamp);
            let slot = &mut self.by_trial[self.current_trial];
            slot.wallclock_end = wallclock;
            slot.timestamp_end = timestamp;
        }
        Ok(())
    }

    fn complete_slot(&mut self, idx: usize, wallclock: f64) {
        let slot = &mut self.by_trial[idx];
        slot.completed = true;
        slot.active_logging = false;
        slot.wallclock_end = wallclock;
        info!(
            trial_id = slot.trial_id,
            portion = slot.trial_portion,
            slot = idx,
            "trial complete"
        );
    }

    /// Rotate `current_trial` forward, clearing the incoming slot if the
    /// writer has not drained it yet.
    fn rotate(&mut self) -> bool {
        let next = (self.current_trial + 1) % TRIAL_RING_SLOTS;
        let mut dropped = false;
        if !self.by_trial[next].is_clear() {
            warn!(
                slot = next,
                trial_id = self.by_trial[next].trial_id,
                "trial ring full; dropping unwritten slot"
            );
            counter!("trials_dropped", "reason" => "ring_full").increment(1);
            self.clear_trial_data(next);
            dropped = true;
        }
        self.current_trial = next;
        dropped
    }

    /// Advance to the next trial, optionally with an explicit id.
    pub fn advance_to_next_trial(&mut self, id: Option<u32>, wallclock: f64) -> AdvanceOutcome {
        let mut outcome = AdvanceOutcome::default();
        if self.current_slot().utilized {
            let finished = self.current_trial;
            self.complete_slot(finished, wallclock);
            outcome.completed = Some(finished);
            outcome.dropped_slot = self.rotate();
        }
        let seed_id = id.unwrap_or(self.next_auto_trial_id);
        self.by_trial[self.current_trial].seed(seed_id, id.is_none(), 0);
        outcome
    }

    /// Force the current trial to complete without a trial advance,
    /// continuing it in the next slot as another portion. No-op when the
    /// current slot has no data.
    pub fn manual_split_current_trial(&mut self, wallclock: f64) -> AdvanceOutcome {
        let mut outcome = AdvanceOutcome::default();
        if !self.current_slot().utilized {
            return outcome;
        }
        let finished = self.current_trial;
        let (trial_id, portion) = {
            let slot = &self.by_trial[finished];
            (slot.trial_id, slot.trial_portion)
        };
        self.complete_slot(finished, wallclock);
        outcome.completed = Some(finished);
        outcome.dropped_slot = self.rotate();
        self.by_trial[self.current_trial].seed(trial_id, false, portion + 1);
        outcome
    }

    /// Split the current trial when it has been open longer than
    /// `max_age_secs` of wallclock time.
    pub fn split_current_trial_if_older_than(
        &mut self,
        max_age_secs: f64,
        wallclock: f64,
    ) -> AdvanceOutcome {
        let slot = self.current_slot();
        if slot.utilized && wallclock - slot.wallclock_start > max_age_secs {
            debug!(
                trial_id = slot.trial_id,
                age = wallclock - slot.wallclock_start,
                "splitting long-running trial"
            );
            self.manual_split_current_trial(wallclock)
        } else {
            AdvanceOutcome::default()
        }
    }

    /// Clear any non-current slot whose last update is older than
    /// `max_age_secs`, regardless of write state. Returns cleared count.
    pub fn flush_trials_older_than(&mut self, max_age_secs: f64, wallclock: f64) -> usize {
        let mut cleared = 0;
        for idx in 0..TRIAL_RING_SLOTS {
            if idx == self.current_trial {
                continue;
            }
            let slot = &self.by_trial[idx];
            if slot.utilized && wallclock - slot.wallclock_end > max_age_secs {
                warn!(
                    trial_id = slot.trial_id,
                    slot = idx,
                    "flushing stale unwritten trial"
                );
                counter!("trials_dropped", "reason" => "stale").increment(1);
                self.clear_trial_data(idx);
                cleared += 1;
            }
        }
        cleared
    }

    /// Force a slot to complete, as commanded by a sender.
    pub fn mark_trial_complete(&mut self, idx: usize, wallclock: f64) -> bool {
        if idx >= TRIAL_RING_SLOTS {
            warn!(slot = idx, "mark-complete for a slot outside the ring");
            return false;
        }
        if !self.by_trial[idx].utilized || self.by_trial[idx].completed {
            return false;
        }
        self.complete_slot(idx, wallclock);
        true
    }

    /// The next completed slot awaiting the writer, oldest first.
    #[must_use]
    pub fn next_complete_trial_to_write(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for idx in 0..TRIAL_RING_SLOTS {
            let slot = &self.by_trial[idx];
            if !(slot.utilized && slot.completed && !slot.active_writing) {
                continue;
            }
            match best {
                Some(b) if self.by_trial[b].wallclock_end <= slot.wallclock_end => {}
                _ => best = Some(idx),
            }
        }
        best
    }

    /// Hand a slot to the writer.
    pub fn mark_trial_writing(&mut self, idx: usize) {
        self.by_trial[idx].active_writing = true;
    }

    /// The writer finished (or abandoned) a slot; release it for reuse.
    ///
    /// A no-op when the slot was already force-cleared (ring pressure or a
    /// flush) while the writer held its copy: the slot may hold a new
    /// trial by now.
    pub fn mark_trial_written(&mut self, idx: usize) {
        if !self.by_trial[idx].active_writing {
            return;
        }
        self.clear_trial_data(idx);
    }

    /// Clear a slot's data across every group, retaining capacity.
    pub fn clear_trial_data(&mut self, idx: usize) {
        self.gtrie.for_each_mut(|_, group| group.clear_slot(idx));
        self.by_trial[idx].reset();
    }

    /// Complete any open trial and freeze this status for draining.
    pub fn retire(&mut self, wallclock: f64) -> Option<usize> {
        self.retired = true;
        if self.current_slot().utilized && !self.current_slot().completed {
            let idx = self.current_trial;
            self.complete_slot(idx, wallclock);
            return Some(idx);
        }
        None
    }

    /// True once nothing in this status still awaits the writer.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.by_trial.iter().all(TrialSlot::is_clear)
    }
}

/// Errors from pushing a packet into a status.
#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    /// A live group reappeared under a different configuration hash.
    #[error("group {group} config hash changed from {was:#010x} to {now:#010x}")]
    ConfigDrift {
        /// Group name.
        group: String,
        /// Hash the group was created under.
        was: u32,
        /// Hash on the incoming packet.
        now: u32,
    },
    /// A buffer could not grow; the datagram is dropped.
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use triallog_wire::{ElementType, GroupHeader, GroupKind, SignalKind, SignalSample};

    fn data_packet(group: &str, hash: u32, timestamp: f64) -> GroupPacket {
        GroupPacket {
            header: GroupHeader {
                version: 1,
                name: group.to_owned(),
                kind: GroupKind::Analog,
                config_hash: hash,
                n_signals: 1,
            },
            signals: vec![SignalSample {
                is_variable: false,
                concat_last_dim: false,
                kind: SignalKind::Analog,
                concat_dimension: 0,
                name: "x".to_owned(),
                units: "mV".to_owned(),
                element_type: ElementType::F32,
                dims: vec![2],
                timestamp,
                data: vec![0u8; 8],
            }],
        }
    }

    fn started(serial: u64) -> DataLoggerStatus {
        let mut status = DataLoggerStatus::new(serial);
        status.pending_next_trial = false;
        status.advance_to_next_trial(Some(1), 0.0);
        status
    }

    #[test]
    fn first_sample_utilizes_the_slot() {
        let mut status = started(0);
        assert!(!status.current_slot().utilized);
        status.ingest_data(&data_packet("g", 0xaa, 5.0), 100.0).unwrap();
        let slot = status.current_slot();
        assert!(slot.utilized && slot.active_logging);
        assert_eq!(slot.trial_id, 1);
        assert_eq!(slot.timestamp_start, 5.0);
        assert_eq!(slot.wallclock_start, 100.0);
    }

    #[test]
    fn advance_completes_and_rotates() {
        let mut status = started(0);
        status.ingest_data(&data_packet("g", 0xaa, 0.0), 100.0).unwrap();
        let outcome = status.advance_to_next_trial(Some(2), 101.0);
        assert_eq!(outcome.completed, Some(0));
        assert!(!outcome.dropped_slot);
        assert!(status.slot(0).completed);
        assert_eq!(status.current_trial_index(), 1);
        assert_eq!(status.current_slot().trial_id, 2);
    }

    #[test]
    fn advance_on_an_empty_slot_only_reseeds() {
        let mut status = started(0);
        // No data has arrived; a second advance renames the pending trial.
        let outcome = status.advance_to_next_trial(Some(7), 1.0);
        assert_eq!(outcome.completed, None);
        assert_eq!(status.current_trial_index(), 0);
        assert_eq!(status.current_slot().trial_id, 7);
    }

    #[test]
    fn auto_trial_ids_continue_from_the_largest_seen() {
        let mut status = started(0);
        status.ingest_data(&data_packet("g", 0xaa, 0.0), 1.0).unwrap();
        status.advance_to_next_trial(Some(41), 2.0);
        status.ingest_data(&data_packet("g", 0xaa, 1.0), 3.0).unwrap();
        status.advance_to_next_trial(None, 4.0);
        status.ingest_data(&data_packet("g", 0xaa, 2.0), 5.0).unwrap();
        assert_eq!(status.current_slot().trial_id, 42);
    }

    #[test]
    fn ring_pressure_drops_the_oldest_unwritten_slot() {
        let mut status = started(0);
        for trial in 1..=4u32 {
            status
                .ingest_data(&data_packet("g", 0xaa, f64::from(trial)), f64::from(trial))
                .unwrap();
            status.advance_to_next_trial(Some(trial + 1), f64::from(trial));
        }
        // Three completions fit the ring; the fourth advance had to reuse
        // the slot trial 1 completed into.
        let completed: Vec<u32> = (0..TRIAL_RING_SLOTS)
            .filter(|idx| status.slot(*idx).completed)
            .map(|idx| status.slot(idx).trial_id)
            .collect();
        assert_eq!(completed.len(), 2);
        assert!(!completed.contains(&1));
    }

    #[test]
    fn config_drift_is_surfaced_not_stored() {
        let mut status = started(0);
        status.ingest_data(&data_packet("g", 0xaa, 0.0), 1.0).unwrap();
        let err = status
            .ingest_data(&data_packet("g", 0xbb, 1.0), 2.0)
            .unwrap_err();
        assert!(matches!(err, IngestError::ConfigDrift { .. }));
        // The drifting packet left no trace.
        let id = status.groups().find("g").expect("group exists");
        assert_eq!(status.groups().get(id).config_hash(), 0xaa);
        assert_eq!(status.groups().get(id).timestamps(0).len(), 1);
    }

    #[test]
    fn split_reuses_the_trial_id_and_bumps_the_portion() {
        let mut status = started(0);
        status.ingest_data(&data_packet("g", 0xaa, 0.0), 1.0).unwrap();
        let outcome = status.manual_split_current_trial(2.0);
        assert_eq!(outcome.completed, Some(0));
        let slot = status.current_slot();
        assert_eq!(slot.trial_id, 1);
        assert_eq!(slot.trial_portion, 1);
        assert!(!slot.utilized);
    }

    #[test]
    fn split_of_an_empty_slot_is_a_no_op() {
        let mut status = started(0);
        let before = status.current_trial_index();
        assert_eq!(status.manual_split_current_trial(1.0), AdvanceOutcome::default());
        assert_eq!(status.manual_split_current_trial(2.0), AdvanceOutcome::default());
        assert_eq!(status.current_trial_index(), before);
    }

    #[test]
    fn age_based_split_waits_for_the_threshold() {
        let mut status = started(0);
        status.ingest_data(&data_packet("g", 0xaa, 0.0), 100.0).unwrap();
        assert_eq!(
            status.split_current_trial_if_older_than(10.0, 105.0),
            AdvanceOutcome::default()
        );
        let outcome = status.split_current_trial_if_older_than(10.0, 111.0);
        assert_eq!(outcome.completed, Some(0));
    }

    #[test]
    fn flush_clears_stale_non_current_slots_only() {
        let mut status = started(0);
        status.ingest_data(&data_packet("g", 0xaa, 0.0), 100.0).unwrap();
        status.advance_to_next_trial(Some(2), 101.0);
        status.ingest_data(&data_packet("g", 0xaa, 5.0), 102.0).unwrap();

        // Not stale yet.
        assert_eq!(status.flush_trials_older_than(20.0, 110.0), 0);
        // Slot 0 (ended at 101.0) is stale at 130; current slot survives.
        assert_eq!(status.flush_trials_older_than(20.0, 130.0), 1);
        assert!(status.slot(0).is_clear());
        assert!(status.current_slot().utilized);
    }

    #[test]
    fn writer_handoff_walks_oldest_first() {
        let mut status = started(0);
        status.ingest_data(&data_packet("g", 0xaa, 0.0), 1.0).unwrap();
        status.advance_to_next_trial(Some(2), 2.0);
        status.ingest_data(&data_packet("g", 0xaa, 1.0), 3.0).unwrap();
        status.advance_to_next_trial(Some(3), 4.0);

        let first = status.next_complete_trial_to_write().expect("one complete");
        assert_eq!(status.slot(first).trial_id, 1);
        status.mark_trial_writing(first);
        let second = status.next_complete_trial_to_write().expect("another");
        assert_eq!(status.slot(second).trial_id, 2);
        status.mark_trial_writing(second);

        status.mark_trial_written(first);
        status.mark_trial_written(second);
        assert!(status.next_complete_trial_to_write().is_none());
        assert!(status.slot(first).is_clear());
    }

    #[test]
    fn clear_then_reingest_reproduces_the_buffers() {
        let mut status = started(0);
        let packets = [
            data_packet("g", 0xaa, 0.0),
            data_packet("g", 0xaa, 1.0),
            data_packet("h", 0x11, 1.5),
        ];
        for p in &packets {
            status.ingest_data(p, 1.0).unwrap();
        }
        let id = status.groups().find("g").expect("exists");
        let before: Vec<f64> = status.groups().get(id).timestamps(0).as_slice().to_vec();

        status.clear_trial_data(0);
        for p in &packets {
            status.ingest_data(p, 1.0).unwrap();
        }
        let id = status.groups().find("g").expect("exists");
        assert_eq!(status.groups().get(id).timestamps(0).as_slice(), &before[..]);
    }

    #[test]
    fn successor_continues_an_open_trial_as_the_next_portion() {
        let mut status = started(0);
        status.ingest_data(&data_packet("g", 0xaa, 0.0), 1.0).unwrap();
        status.retire(2.0);
        let fresh = DataLoggerStatus::successor(&status, 1);
        assert!(!fresh.pending_next_trial);
        assert_eq!(fresh.current_slot().trial_id, 1);
        assert_eq!(fresh.current_slot().trial_portion, 1);
        assert!(!fresh.current_slot().auto_trial_id);
        assert!(status.slot(0).completed);
    }
}
