//! Trial artifact writer.
//!
//! A separate task drains completed trial slots from the [`Logger`],
//! converts each into a portable [`TrialRecord`], and persists it as a JSON
//! document under the data root at
//! `data_store/subject/protocol/saveTagNNN/trialNNNNNN_pNN.json`.
//!
//! The record is copied out of the ring under the logger's lock; all
//! decoding and file I/O happens outside it. A write failure costs that
//! trial, never the ring: the slot is released either way.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use tokio::pin;
use tracing::{error, info};

use triallog_wire::{ElementType, GroupKind, SignalKind};

use crate::accumulator::{DataLoggerStatus, SignalDataBuffer};
use crate::control::Logger;
use crate::signals::Watcher;

/// How long the writer sleeps between wake checks while idle.
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Errors produced by [`Writer`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Artifact could not be written.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Record could not be serialized.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Typed element values decoded from a signal's payload bytes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ElementValues {
    /// `f64` elements.
    F64(Vec<f64>),
    /// `f32` elements.
    F32(Vec<f32>),
    /// `i8` elements.
    I8(Vec<i8>),
    /// `u8` elements.
    U8(Vec<u8>),
    /// `i16` elements.
    I16(Vec<i16>),
    /// `u16` elements.
    U16(Vec<u16>),
    /// `i32` elements.
    I32(Vec<i32>),
    /// `u32` elements.
    U32(Vec<u32>),
    /// Character data, emitted as text.
    Text(String),
    /// Boolean elements.
    Bool(Vec<bool>),
}

fn decode_values(element_type: ElementType, bytes: &[u8]) -> ElementValues {
    match element_type {
        ElementType::F64 => ElementValues::F64(
            bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ),
        ElementType::F32 => ElementValues::F32(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        ElementType::I8 => ElementValues::I8(bytes.iter().map(|b| *b as i8).collect()),
        ElementType::U8 => ElementValues::U8(bytes.to_vec()),
        ElementType::I16 => ElementValues::I16(
            bytes
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect(),
        ),
        ElementType::U16 => ElementValues::U16(
            bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
        ),
        ElementType::I32 => ElementValues::I32(
            bytes
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        ElementType::U32 => ElementValues::U32(
            bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        ElementType::Char => ElementValues::Text(String::from_utf8_lossy(bytes).into_owned()),
        ElementType::Bool => ElementValues::Bool(bytes.iter().map(|b| *b != 0).collect()),
    }
}

/// How a signal's accumulated samples are laid out in the artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum SignalPayload {
    /// Every sample shared one shape: a single array plus its shape vector.
    Homogeneous {
        /// Concatenated shape of the whole trial's data.
        shape: Vec<u32>,
        /// All elements, in arrival order.
        values: ElementValues,
    },
    /// Samples varied in shape: one element vector per sample.
    Heterogeneous {
        /// Per-sample element vectors, in arrival order.
        samples: Vec<ElementValues>,
    },
}

/// One signal's contribution to a trial artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalRecord {
    /// Signal name.
    pub name: String,
    /// Unit string from the first sample.
    pub units: String,
    /// Signal kind.
    pub kind: SignalKind,
    /// Element type of the values.
    pub element_type: ElementType,
    /// The values and their layout.
    #[serde(flatten)]
    pub payload: SignalPayload,
}

/// One group's contribution to a trial artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupRecord {
    /// Group name.
    pub name: String,
    /// Group kind.
    pub kind: GroupKind,
    /// Serializer block version.
    pub version: u16,
    /// Configuration fingerprint the data arrived under.
    pub config_hash: u32,
    /// The group's timestamp stream for this trial, milliseconds.
    pub timestamps: Vec<f64>,
    /// Signals with data this trial, in creation order.
    pub signals: Vec<SignalRecord>,
}

/// Metadata snapshot naming where the artifact belongs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetaRecord {
    /// Data store name.
    pub data_store: String,
    /// Subject identifier.
    pub subject: String,
    /// Protocol name.
    pub protocol: String,
    /// Protocol version.
    pub protocol_version: u32,
    /// Save tag.
    pub save_tag: u32,
}

/// A finalized trial in portable form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialRecord {
    /// Trial identifier.
    pub trial_id: u32,
    /// Portion counter for split trials.
    pub trial_portion: u32,
    /// Wallclock seconds when the trial started.
    pub wallclock_start: f64,
    /// Wallclock seconds when the trial ended.
    pub wallclock_end: f64,
    /// Source timestamp (ms) of the first sample.
    pub timestamp_start: f64,
    /// Source timestamp (ms) of the last sample.
    pub timestamp_end: f64,
    /// Metadata in force when the trial completed.
    pub meta: MetaRecord,
    /// Groups that received data this trial, in name order.
    pub groups: Vec<GroupRecord>,
}

fn homogeneous_shape(signal: &SignalDataBuffer, n_samples: usize) -> Vec<u32> {
    let dims: Vec<u32> = signal.dims().iter().map(|d| u32::from(*d)).collect();
    if signal.concat_last_dim() {
        let cd = usize::from(signal.concat_dimension());
        if cd < dims.len() {
            let mut shape = dims;
            shape[cd] *= n_samples as u32;
            return shape;
        }
    }
    let mut shape = Vec::with_capacity(dims.len() + 1);
    shape.push(n_samples as u32);
    shape.extend(dims);
    shape
}

impl TrialRecord {
    /// Copy one completed slot out of a status.
    ///
    /// Called under the logger's lock; does nothing but memcpy-scale moves
    /// so the receiver is never stalled behind serialization.
    #[must_use]
    pub fn extract(status: &DataLoggerStatus, slot: usize) -> Self {
        let state = status.slot(slot);
        let mut groups = Vec::with_capacity(status.groups().len());
        status.groups().for_each(|_, group| {
            let timestamps = group.timestamps(slot).as_slice().to_vec();
            let mut signals = Vec::new();
            for signal in group.signals() {
                let buffer = signal.buffer(slot);
                if buffer.n_samples() == 0 {
                    continue;
                }
                let payload = if signal.heterogeneous(slot) {
                    SignalPayload::Heterogeneous {
                        samples: buffer
                            .samples()
                            .map(|bytes| decode_values(signal.element_type(), bytes))
                            .collect(),
                    }
                } else {
                    SignalPayload::Homogeneous {
                        shape: homogeneous_shape(signal, buffer.n_samples()),
                        values: decode_values(signal.element_type(), buffer.data()),
                    }
                };
                signals.push(SignalRecord {
                    name: signal.name().to_owned(),
                    units: signal.units().to_owned(),
                    kind: signal.kind(),
                    element_type: signal.element_type(),
                    payload,
                });
            }
            if timestamps.is_empty() && signals.is_empty() {
                // Group saw no data this trial.
                return;
            }
            groups.push(GroupRecord {
                name: group.name().to_owned(),
                kind: group.kind(),
                version: group.version(),
                config_hash: group.config_hash(),
                timestamps,
                signals,
            });
        });

        Self {
            trial_id: state.trial_id,
            trial_portion: state.trial_portion,
            wallclock_start: state.wallclock_start,
            wallclock_end: state.wallclock_end,
            timestamp_start: state.timestamp_start,
            timestamp_end: state.timestamp_end,
            meta: MetaRecord {
                data_store: status.meta.data_store.value.clone(),
                subject: status.meta.subject.value.clone(),
                protocol: status.meta.protocol.value.clone(),
                protocol_version: status.meta.protocol_version.value,
                save_tag: status.meta.save_tag.value,
            },
            groups,
        }
    }

    /// Path of this trial's artifact under a data root.
    #[must_use]
    pub fn artifact_path(&self, dataroot: &Path) -> PathBuf {
        dataroot
            .join(&self.meta.data_store)
            .join(&self.meta.subject)
            .join(&self.meta.protocol)
            .join(format!("saveTag{:03}", self.meta.save_tag))
            .join(format!(
                "trial{:06}_p{:02}.json",
                self.trial_id, self.trial_portion
            ))
    }
}

async fn emit(dataroot: &Path, record: &TrialRecord) -> Result<PathBuf, Error> {
    let path = record.artifact_path(dataroot);
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let bytes = serde_json::to_vec_pretty(record)?;
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}

async fn drain(dataroot: &Path, logger: &Logger) {
    while let Some(pending) = logger.next_trial_to_write() {
        match emit(dataroot, &pending.record).await {
            Ok(path) => {
                info!(
                    trial_id = pending.record.trial_id,
                    portion = pending.record.trial_portion,
                    path = %path.display(),
                    "trial written"
                );
            }
            Err(err) => {
                error!(
                    trial_id = pending.record.trial_id,
                    %err,
                    "failed to write trial artifact; dropping it"
                );
                counter!("trial_write_failures").increment(1);
            }
        }
        logger.mark_trial_written(pending.ticket);
    }
}

/// The writer task.
#[derive(Debug)]
pub struct Writer {
    dataroot: PathBuf,
    logger: Arc<Logger>,
    shutdown: Watcher,
}

impl Writer {
    /// Create a new [`Writer`] draining `logger` into `dataroot`.
    #[must_use]
    pub fn new(dataroot: PathBuf, logger: Arc<Logger>, shutdown: Watcher) -> Self {
        Self {
            dataroot,
            logger,
            shutdown,
        }
    }

    /// Run the writer until shutdown, finishing with a final drain.
    ///
    /// The idle wait is bounded so shutdown is observed promptly even when
    /// no completion signal ever arrives.
    pub async fn spin(self) -> Result<(), Error> {
        let Self {
            dataroot,
            logger,
            mut shutdown,
        } = self;
        loop {
            drain(&dataroot, &logger).await;

            let stop = shutdown.recv();
            pin!(stop);
            tokio::select! {
                () = &mut stop => {
                    drain(&dataroot, &logger).await;
                    info!("shutdown signal received");
                    return Ok(());
                }
                () = logger.wait_completion() => {}
                () = tokio::time::sleep(IDLE_WAIT) => {}
            }
        }
    }
}
