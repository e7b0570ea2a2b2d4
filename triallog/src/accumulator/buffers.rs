//! Grow-able typed accumulators backing each signal and timestamp stream.
//!
//! Growth is fallible on purpose: an allocation failure surfaces as an
//! [`AllocError`] and costs one datagram, never the process. Callers reserve
//! capacity for everything a packet will append before appending any of it,
//! so a failed reservation leaves the buffers exactly as they were.

use tracing::warn;

use triallog_wire::{ElementType, SignalKind, SignalSample, MAX_SIGNAL_NDIMS};

use super::{trie::GroupId, TRIAL_RING_SLOTS};

/// A buffer could not grow to fit the incoming data.
#[derive(thiserror::Error, Debug)]
#[error("buffer growth failed: {0}")]
pub struct AllocError(#[from] std::collections::TryReserveError);

/// Reserve room for `additional` more elements, growing by at least 1.5x.
fn reserve_half_again<T>(vec: &mut Vec<T>, additional: usize) -> Result<(), AllocError> {
    let needed = vec.len() + additional;
    if needed <= vec.capacity() {
        return Ok(());
    }
    let target = needed.max(vec.capacity() + vec.capacity() / 2).max(8);
    vec.try_reserve_exact(target - vec.len())?;
    Ok(())
}

/// Grow-able store of `f64` timestamps for one group and trial slot.
#[derive(Debug, Default)]
pub struct TimestampBuffer {
    timestamps: Vec<f64>,
}

impl TimestampBuffer {
    /// Reserve room for `additional` timestamps without appending.
    pub fn reserve(&mut self, additional: usize) -> Result<(), AllocError> {
        reserve_half_again(&mut self.timestamps, additional)
    }

    /// Append one timestamp. Reserve first; see [`TimestampBuffer::reserve`].
    pub fn push(&mut self, timestamp: f64) {
        self.timestamps.push(timestamp);
    }

    /// Drop everything buffered and append one timestamp.
    pub fn replace(&mut self, timestamp: f64) {
        self.timestamps.clear();
        self.timestamps.push(timestamp);
    }

    /// Zero the counters, keeping capacity for the next trial.
    pub fn clear(&mut self) {
        self.timestamps.clear();
    }

    /// Timestamps buffered so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// True when nothing has been buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// The buffered timestamps, oldest first.
    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.timestamps
    }
}

/// Contiguous byte store for one signal and trial slot.
///
/// A sample here is the chunk of data one packet carried for the signal;
/// per-sample byte lengths are kept alongside so variable-shape signals can
/// be split back apart at write time.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    data: Vec<u8>,
    bytes_each_sample: Vec<u32>,
    samples_different_sizes: bool,
}

impl SampleBuffer {
    /// Reserve room for one more sample of `bytes` bytes without appending.
    pub fn reserve(&mut self, bytes: usize) -> Result<(), AllocError> {
        reserve_half_again(&mut self.data, bytes)?;
        reserve_half_again(&mut self.bytes_each_sample, 1)
    }

    /// Append one sample. Reserve first; see [`SampleBuffer::reserve`].
    pub fn push(&mut self, bytes: &[u8]) {
        if let Some(first) = self.bytes_each_sample.first() {
            if *first as usize != bytes.len() {
                self.samples_different_sizes = true;
            }
        }
        self.data.extend_from_slice(bytes);
        self.bytes_each_sample.push(bytes.len() as u32);
    }

    /// Drop everything buffered and append one sample.
    pub fn replace(&mut self, bytes: &[u8]) {
        self.data.clear();
        self.bytes_each_sample.clear();
        self.samples_different_sizes = false;
        self.data.extend_from_slice(bytes);
        self.bytes_each_sample.push(bytes.len() as u32);
    }

    /// Zero the counters, keeping capacity for the next trial.
    pub fn clear(&mut self) {
        self.data.clear();
        self.bytes_each_sample.clear();
        self.samples_different_sizes = false;
    }

    /// Samples buffered so far.
    #[must_use]
    pub fn n_samples(&self) -> usize {
        self.bytes_each_sample.len()
    }

    /// Total payload bytes buffered so far.
    #[must_use]
    pub fn n_data_bytes(&self) -> usize {
        self.data.len()
    }

    /// True when at least two buffered samples differ in byte length.
    #[must_use]
    pub fn samples_different_sizes(&self) -> bool {
        self.samples_different_sizes
    }

    /// The concatenated payload bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Walk the buffered samples as individual byte slices.
    pub fn samples(&self) -> impl Iterator<Item = &[u8]> {
        let mut offset = 0usize;
        self.bytes_each_sample.iter().map(move |len| {
            let len = *len as usize;
            let s = &self.data[offset..offset + len];
            offset += len;
            s
        })
    }
}

/// Why an incoming sample cannot be stored in a signal's buffer.
///
/// Any of these is fatal for the signal within the current packet: the
/// sample is dropped, the rest of the group continues.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SignalMismatch {
    /// Unit string changed since the first sample.
    #[error("units changed from {was:?} to {now:?}")]
    Units {
        /// Units recorded from the first sample.
        was: String,
        /// Units on the incoming sample.
        now: String,
    },
    /// Element type changed since the first sample.
    #[error("element type changed from {was:?} to {now:?}")]
    ElementType {
        /// Element type recorded from the first sample.
        was: ElementType,
        /// Element type on the incoming sample.
        now: ElementType,
    },
    /// Dimension count changed since the first sample.
    #[error("dimension count changed from {was} to {now}")]
    DimCount {
        /// Dimension count recorded from the first sample.
        was: usize,
        /// Dimension count on the incoming sample.
        now: usize,
    },
}

/// Per-signal accumulator inside a group: static metadata from the signal's
/// first sample plus one [`SampleBuffer`] per trial slot.
#[derive(Debug)]
pub struct SignalDataBuffer {
    name: String,
    units: String,
    kind: SignalKind,
    element_type: ElementType,
    is_variable: bool,
    concat_last_dim: bool,
    concat_dimension: u8,
    /// Dimensions of the first sample ever seen, the reference shape.
    dims: Vec<u16>,
    /// The owning group, as an arena id rather than a pointer.
    group: GroupId,
    buffers: [SampleBuffer; TRIAL_RING_SLOTS],
    /// Per slot, per dimension: did any sample differ from the reference
    /// shape along this dimension during this trial?
    dim_changes_size: [[bool; MAX_SIGNAL_NDIMS]; TRIAL_RING_SLOTS],
}

impl SignalDataBuffer {
    /// Build a fresh buffer from a signal's first sample.
    #[must_use]
    pub fn from_sample(group: GroupId, sample: &SignalSample) -> Self {
        Self {
            name: sample.name.clone(),
            units: sample.units.clone(),
            kind: sample.kind,
            element_type: sample.element_type,
            is_variable: sample.is_variable,
            concat_last_dim: sample.concat_last_dim,
            concat_dimension: sample.concat_dimension,
            dims: sample.dims.clone(),
            group,
            buffers: Default::default(),
            dim_changes_size: [[false; MAX_SIGNAL_NDIMS]; TRIAL_RING_SLOTS],
        }
    }

    /// Validate an incoming sample against the signal's fixed metadata and
    /// record any dimension drift for the slot.
    pub fn check_matches(
        &mut self,
        slot: usize,
        sample: &SignalSample,
    ) -> Result<(), SignalMismatch> {
        if sample.units != self.units {
            return Err(SignalMismatch::Units {
                was: self.units.clone(),
                now: sample.units.clone(),
            });
        }
        if sample.element_type != self.element_type {
            return Err(SignalMismatch::ElementType {
                was: self.element_type,
                now: sample.element_type,
            });
        }
        if sample.dims.len() != self.dims.len() {
            return Err(SignalMismatch::DimCount {
                was: self.dims.len(),
                now: sample.dims.len(),
            });
        }
        for (d, (reference, incoming)) in self.dims.iter().zip(sample.dims.iter()).enumerate() {
            if reference != incoming {
                if !self.is_variable {
                    warn!(
                        signal = %self.name,
                        dimension = d,
                        "fixed-shape signal changed size; storing heterogeneously"
                    );
                }
                self.dim_changes_size[slot][d] = true;
            }
        }
        Ok(())
    }

    /// The slot's sample buffer.
    #[must_use]
    pub fn buffer(&self, slot: usize) -> &SampleBuffer {
        &self.buffers[slot]
    }

    /// The slot's sample buffer, mutably.
    pub fn buffer_mut(&mut self, slot: usize) -> &mut SampleBuffer {
        &mut self.buffers[slot]
    }

    /// Clear the slot's samples and dimension-drift flags, keeping capacity.
    pub fn clear_slot(&mut self, slot: usize) {
        self.buffers[slot].clear();
        self.dim_changes_size[slot] = [false; MAX_SIGNAL_NDIMS];
    }

    /// True when the slot's samples cannot be concatenated into one array.
    #[must_use]
    pub fn heterogeneous(&self, slot: usize) -> bool {
        self.buffers[slot].samples_different_sizes()
            || self.dim_changes_size[slot][..self.dims.len()]
                .iter()
                .any(|changed| *changed)
    }

    /// Signal name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unit string from the first sample.
    #[must_use]
    pub fn units(&self) -> &str {
        &self.units
    }

    /// Signal kind from the first sample.
    #[must_use]
    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    /// Element type from the first sample.
    #[must_use]
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Reference dimensions, from the first sample ever seen.
    #[must_use]
    pub fn dims(&self) -> &[u16] {
        &self.dims
    }

    /// Concatenate along [`Self::concat_dimension`] rather than stacking.
    #[must_use]
    pub fn concat_last_dim(&self) -> bool {
        self.concat_last_dim
    }

    /// Dimension to concatenate along.
    #[must_use]
    pub fn concat_dimension(&self) -> u8 {
        self.concat_dimension
    }

    /// The owning group's arena id.
    #[must_use]
    pub fn group(&self) -> GroupId {
        self.group
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(dims: &[u16], units: &str) -> SignalSample {
        let elements: usize = dims.iter().map(|d| usize::from(*d)).product();
        SignalSample {
            is_variable: true,
            concat_last_dim: false,
            kind: SignalKind::Analog,
            concat_dimension: 0,
            name: "chan".to_owned(),
            units: units.to_owned(),
            element_type: ElementType::F32,
            dims: dims.to_vec(),
            timestamp: 1.0,
            data: vec![0u8; elements * 4],
        }
    }

    #[test]
    fn timestamp_buffer_clear_keeps_capacity() {
        let mut buf = TimestampBuffer::default();
        for i in 0..100 {
            buf.reserve(1).unwrap();
            buf.push(f64::from(i));
        }
        let cap_before = buf.timestamps.capacity();
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.timestamps.capacity(), cap_before);
    }

    #[test]
    fn timestamp_replace_leaves_one_value() {
        let mut buf = TimestampBuffer::default();
        buf.reserve(2).unwrap();
        buf.push(1.0);
        buf.push(2.0);
        buf.replace(9.0);
        assert_eq!(buf.as_slice(), &[9.0]);
    }

    #[test]
    fn sample_buffer_tracks_heterogeneity() {
        let mut buf = SampleBuffer::default();
        buf.reserve(3).unwrap();
        buf.push(&[1, 2, 3]);
        assert!(!buf.samples_different_sizes());
        buf.reserve(3).unwrap();
        buf.push(&[4, 5, 6]);
        assert!(!buf.samples_different_sizes());
        buf.reserve(5).unwrap();
        buf.push(&[7, 8, 9, 10, 11]);
        assert!(buf.samples_different_sizes());
        assert_eq!(buf.n_samples(), 3);
        assert_eq!(buf.n_data_bytes(), 11);
        let lens: Vec<usize> = buf.samples().map(<[u8]>::len).collect();
        assert_eq!(lens, vec![3, 3, 5]);
    }

    #[test]
    fn sample_replace_resets_the_size_flag() {
        let mut buf = SampleBuffer::default();
        buf.reserve(2).unwrap();
        buf.push(&[1, 2]);
        buf.reserve(1).unwrap();
        buf.push(&[3]);
        assert!(buf.samples_different_sizes());
        buf.replace(&[4, 5, 6]);
        assert!(!buf.samples_different_sizes());
        assert_eq!(buf.n_samples(), 1);
        assert_eq!(buf.data(), &[4, 5, 6]);
    }

    #[test]
    fn metadata_drift_is_fatal_per_signal() {
        let group = GroupId::new(0);
        let first = sample(&[4], "mV");
        let mut sdb = SignalDataBuffer::from_sample(group, &first);
        assert!(sdb.check_matches(0, &first).is_ok());

        let bad_units = sample(&[4], "uV");
        assert!(matches!(
            sdb.check_matches(0, &bad_units),
            Err(SignalMismatch::Units { .. })
        ));

        let mut bad_type = sample(&[4], "mV");
        bad_type.element_type = ElementType::I16;
        assert!(matches!(
            sdb.check_matches(0, &bad_type),
            Err(SignalMismatch::ElementType { .. })
        ));
    }

    #[test]
    fn dimension_drift_marks_the_slot_heterogeneous() {
        let group = GroupId::new(0);
        let mut sdb = SignalDataBuffer::from_sample(group, &sample(&[3], "mV"));
        assert!(sdb.check_matches(1, &sample(&[5], "mV")).is_ok());
        assert!(sdb.heterogeneous(1));
        assert!(!sdb.heterogeneous(0));
        sdb.clear_slot(1);
        assert!(!sdb.heterogeneous(1));
    }
}
