//! Per-trial accumulation of decoded signal data.
//!
//! Decoded packets land here: a trie of named groups, each holding typed
//! per-signal sample buffers and a timestamp stream per trial slot, rotated
//! across a small ring of slots so the writer can drain one trial while the
//! receiver fills the next.

pub mod buffers;
pub mod group;
pub mod status;
pub mod trie;

pub use buffers::{AllocError, SampleBuffer, SignalDataBuffer, TimestampBuffer};
pub use group::GroupInfo;
pub use status::{DataLoggerStatus, TrialSlot};
pub use trie::{GroupId, GroupTrie};

/// Trial slots held live at once: one being filled, one draining, one spare.
pub const TRIAL_RING_SLOTS: usize = 3;
