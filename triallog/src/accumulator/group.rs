//! A named bundle of signals sharing one timestamp stream per trial.

use rustc_hash::FxHashMap;
use tracing::warn;

use triallog_wire::{GroupKind, GroupPacket, SignalKind, MAX_GROUP_SIGNALS};

use super::{
    buffers::{AllocError, SignalDataBuffer, TimestampBuffer},
    trie::GroupId,
    TRIAL_RING_SLOTS,
};

/// Aggregate state for one group across the whole trial ring.
#[derive(Debug)]
pub struct GroupInfo {
    version: u16,
    name: String,
    kind: GroupKind,
    config_hash: u32,
    last_timestamp: f64,
    signals: Vec<SignalDataBuffer>,
    signal_index: FxHashMap<String, usize>,
    ts_buffers: [TimestampBuffer; TRIAL_RING_SLOTS],
    /// Set once any sample of this group has ever been dropped; relaxes the
    /// per-signal count assertion from equality to an upper bound.
    had_signal_drops: bool,
}

impl GroupInfo {
    /// Build an empty group from a decoded header.
    #[must_use]
    pub fn from_header(header: &triallog_wire::GroupHeader) -> Self {
        Self {
            version: header.version,
            name: header.name.clone(),
            kind: header.kind,
            config_hash: header.config_hash,
            last_timestamp: 0.0,
            signals: Vec::new(),
            signal_index: FxHashMap::default(),
            ts_buffers: Default::default(),
            had_signal_drops: false,
        }
    }

    /// Group name, the trie key.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Group kind from the first header seen.
    #[must_use]
    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    /// Serializer block version from the first header seen.
    #[must_use]
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Configuration fingerprint this group was created under.
    #[must_use]
    pub fn config_hash(&self) -> u32 {
        self.config_hash
    }

    /// Most recent effective timestamp pushed to any slot.
    #[must_use]
    pub fn last_timestamp(&self) -> f64 {
        self.last_timestamp
    }

    /// The signal table, in creation order.
    #[must_use]
    pub fn signals(&self) -> &[SignalDataBuffer] {
        &self.signals
    }

    /// The slot's timestamp stream.
    #[must_use]
    pub fn timestamps(&self, slot: usize) -> &TimestampBuffer {
        &self.ts_buffers[slot]
    }

    /// Clear one slot across the timestamp stream and every signal,
    /// retaining capacity.
    pub fn clear_slot(&mut self, slot: usize) {
        self.ts_buffers[slot].clear();
        for signal in &mut self.signals {
            signal.clear_slot(slot);
        }
    }

    /// The effective timestamp for a packet: the value of its first
    /// timestamp-kind sample when one is present (offset kinds add to the
    /// packet timestamp), otherwise the packet timestamp itself.
    fn resolve_timestamp(&self, packet: &GroupPacket) -> f64 {
        let packet_ts = packet.signals.first().map_or(0.0, |s| s.timestamp);
        let mut found = None;
        for sample in &packet.signals {
            if !sample.kind.is_timestamp() {
                continue;
            }
            if found.is_some() {
                warn!(group = %self.name, "multiple timestamp signals in one packet; using the first");
                break;
            }
            let scalar = sample.scalar_f64();
            found = match (sample.kind, scalar) {
                (SignalKind::Timestamp, Some(v)) => Some(v),
                (SignalKind::TimestampOffset, Some(v)) => Some(packet_ts + v),
                _ => {
                    warn!(group = %self.name, signal = %sample.name, "empty timestamp sample");
                    Some(packet_ts)
                }
            };
        }
        found.unwrap_or(packet_ts)
    }

    /// Append one packet's samples into a trial slot.
    ///
    /// Returns the effective timestamp appended, or `None` when the packet
    /// carried nothing to store (every sample was timestamp-kind, dropped,
    /// or absent). Capacity for the timestamp stream and every surviving
    /// sample is reserved before any append, so an allocation failure drops
    /// the whole packet and leaves the slot consistent.
    pub fn ingest(
        &mut self,
        id: GroupId,
        slot: usize,
        packet: &GroupPacket,
    ) -> Result<Option<f64>, AllocError> {
        let ts = self.resolve_timestamp(packet);

        // Resolve or create a buffer for every storable sample first.
        let mut accepted: Vec<(usize, &triallog_wire::SignalSample)> = Vec::new();
        for sample in &packet.signals {
            if sample.kind.is_timestamp() {
                continue;
            }
            let idx = match self.signal_index.get(sample.name.as_str()) {
                Some(idx) => *idx,
                None => {
                    if self.signals.len() >= usize::from(MAX_GROUP_SIGNALS) {
                        warn!(
                            group = %self.name,
                            signal = %sample.name,
                            "signal table full; dropping sample"
                        );
                        self.had_signal_drops = true;
                        continue;
                    }
                    let idx = self.signals.len();
                    self.signals.push(SignalDataBuffer::from_sample(id, sample));
                    self.signal_index.insert(sample.name.clone(), idx);
                    idx
                }
            };
            if let Err(mismatch) = self.signals[idx].check_matches(slot, sample) {
                warn!(
                    group = %self.name,
                    signal = %sample.name,
                    %mismatch,
                    "sample does not match its signal; dropping sample"
                );
                self.had_signal_drops = true;
                continue;
            }
            accepted.push((idx, sample));
        }

        if accepted.is_empty() {
            return Ok(None);
        }

        // Reserve everything, then append everything.
        self.ts_buffers[slot].reserve(1)?;
        for (idx, sample) in &accepted {
            self.signals[*idx].buffer_mut(slot).reserve(sample.data.len())?;
        }

        if self.kind == GroupKind::Param {
            self.ts_buffers[slot].replace(ts);
        } else {
            self.ts_buffers[slot].push(ts);
        }
        // Param semantics replace rather than append, for a whole
        // param-kind group and for individual param-kind signals alike, so
        // sample counts stay in step with the timestamp stream.
        let group_replaces = self.kind == GroupKind::Param;
        for (idx, sample) in &accepted {
            let signal = &mut self.signals[*idx];
            if group_replaces || signal.kind() == SignalKind::Param {
                signal.buffer_mut(slot).replace(&sample.data);
            } else {
                signal.buffer_mut(slot).push(&sample.data);
            }
        }
        self.last_timestamp = ts;

        #[cfg(debug_assertions)]
        self.assert_slot_counts(slot, &accepted);

        Ok(Some(ts))
    }

    #[cfg(debug_assertions)]
    fn assert_slot_counts(&self, slot: usize, accepted: &[(usize, &triallog_wire::SignalSample)]) {
        let ts_len = self.ts_buffers[slot].len();
        for (idx, _) in accepted {
            let signal = &self.signals[*idx];
            if signal.kind() == SignalKind::Param {
                continue;
            }
            let n = signal.buffer(slot).n_samples();
            if self.had_signal_drops {
                debug_assert!(n <= ts_len, "signal {} overfilled", signal.name());
            } else {
                debug_assert_eq!(
                    n,
                    ts_len,
                    "signal {} out of step with group timestamps",
                    signal.name()
                );
            }
        }
    }
}
