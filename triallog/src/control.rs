//! The control-signal sublanguage and the shared logger it drives.
//!
//! Control-kind group packets carry commands, one per signal, dispatched by
//! signal name. Everything else lands in the active
//! [`DataLoggerStatus`](crate::accumulator::DataLoggerStatus) as trial
//! data. [`Logger`] is the single piece of state shared between the
//! receiver, writer, and housekeeping tasks; it holds one non-recursive
//! mutex and wakes the writer at most once per completed trial.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use metrics::counter;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use triallog_wire::{ElementType, GroupKind, GroupPacket, SignalSample};

use crate::accumulator::status::IngestError;
use crate::accumulator::DataLoggerStatus;
use crate::common::wallclock_now;
use crate::receiver::PacketSink;
use crate::writer::TrialRecord;

/// A control signal that did not parse into a command.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ControlError {
    /// Signal name is not a recognized command.
    #[error("unrecognized control signal {0:?}")]
    UnknownCommand(String),
    /// A string-valued command carried non-character data.
    #[error("command {0:?} expects character data")]
    ExpectedText(String),
    /// A numeric command carried no decodable scalar.
    #[error("command {0:?} expects a numeric scalar")]
    ExpectedScalar(String),
}

/// A metadata update carried by a `SetMeta`-family control signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaUpdate {
    /// New data store name.
    DataStore(String),
    /// New subject identifier.
    Subject(String),
    /// New protocol name.
    Protocol(String),
    /// New protocol version.
    ProtocolVersion(u32),
    /// New save tag.
    SaveTag(u32),
}

impl MetaUpdate {
    /// True when applying this update would change the current metadata.
    #[must_use]
    pub fn differs(&self, meta: &crate::accumulator::status::TrialMeta) -> bool {
        match self {
            Self::DataStore(v) => *v != meta.data_store.value,
            Self::Subject(v) => *v != meta.subject.value,
            Self::Protocol(v) => *v != meta.protocol.value,
            Self::ProtocolVersion(v) => *v != meta.protocol_version.value,
            Self::SaveTag(v) => *v != meta.save_tag.value,
        }
    }

    /// Install this update, marking the field specified.
    pub fn apply(self, meta: &mut crate::accumulator::status::TrialMeta) {
        match self {
            Self::DataStore(v) => meta.data_store.set(v),
            Self::Subject(v) => meta.subject.set(v),
            Self::Protocol(v) => meta.protocol.set(v),
            Self::ProtocolVersion(v) => meta.protocol_version.set(v),
            Self::SaveTag(v) => meta.save_tag.set(v),
        }
    }
}

/// One decoded control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Advance to the next trial; `None` requests an automatic id.
    NextTrial(Option<u32>),
    /// Change one metadata field, retiring the status when it differs.
    SetMeta(MetaUpdate),
    /// Force a ring slot to complete.
    MarkComplete(u32),
    /// Split the current trial into another portion immediately.
    SplitNow,
}

fn text_payload(sample: &SignalSample) -> Result<String, ControlError> {
    match sample.element_type {
        ElementType::Char | ElementType::U8 => {
            Ok(String::from_utf8_lossy(&sample.data).into_owned())
        }
        _ => Err(ControlError::ExpectedText(sample.name.clone())),
    }
}

fn scalar_payload(sample: &SignalSample) -> Result<u32, ControlError> {
    sample
        .scalar_f64()
        .map(|v| v as u32)
        .ok_or_else(|| ControlError::ExpectedScalar(sample.name.clone()))
}

impl ControlCommand {
    /// Decode a control-group signal into a command.
    pub fn from_sample(sample: &SignalSample) -> Result<Self, ControlError> {
        Ok(match sample.name.as_str() {
            "next_trial" => {
                if sample.data.is_empty() {
                    Self::NextTrial(None)
                } else {
                    Self::NextTrial(Some(scalar_payload(sample)?))
                }
            }
            "data_store" => Self::SetMeta(MetaUpdate::DataStore(text_payload(sample)?)),
            "subject" => Self::SetMeta(MetaUpdate::Subject(text_payload(sample)?)),
            "protocol" => Self::SetMeta(MetaUpdate::Protocol(text_payload(sample)?)),
            "protocol_version" => {
                Self::SetMeta(MetaUpdate::ProtocolVersion(scalar_payload(sample)?))
            }
            "save_tag" => Self::SetMeta(MetaUpdate::SaveTag(scalar_payload(sample)?)),
            "mark_complete" => Self::MarkComplete(scalar_payload(sample)?),
            "split_now" => Self::SplitNow,
            _ => return Err(ControlError::UnknownCommand(sample.name.clone())),
        })
    }
}

/// Ticket identifying a trial slot handed to the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTicket {
    serial: u64,
    slot: usize,
}

/// A completed trial handed to the writer: its ticket and the record
/// copied out under the lock.
#[derive(Debug)]
pub struct PendingTrial {
    /// Returned through [`Logger::mark_trial_written`] when done.
    pub ticket: WriteTicket,
    /// The portable trial contents.
    pub record: TrialRecord,
}

/// Point-in-time view of the logger, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggerSnapshot {
    /// Serial of the active status.
    pub active_serial: u64,
    /// Data is being dropped until the first trial advance.
    pub pending_next_trial: bool,
    /// Trial id seeded or assigned in the current slot.
    pub current_trial_id: u32,
    /// Ring index of the current slot.
    pub current_trial_index: usize,
    /// Groups known to the active status.
    pub group_count: usize,
    /// Retired statuses still awaiting the writer.
    pub retired_count: usize,
}

#[derive(Debug)]
struct LoggerState {
    active: DataLoggerStatus,
    retired: VecDeque<DataLoggerStatus>,
    next_serial: u64,
}

impl LoggerState {
    fn retire_active(&mut self, wallclock: f64) -> bool {
        let serial = self.next_serial;
        self.next_serial += 1;
        let fresh = DataLoggerStatus::successor(&self.active, serial);
        let mut old = std::mem::replace(&mut self.active, fresh);
        let completed = old.retire(wallclock).is_some();
        if old.is_drained() {
            debug!(serial = old.serial, "retiring status with nothing to drain");
        } else {
            info!(serial = old.serial, "status retired; awaiting writer");
            self.retired.push_back(old);
        }
        completed
    }
}

/// The shared trial accumulator: the active status plus the retired list,
/// guarded by one mutex.
#[derive(Debug)]
pub struct Logger {
    state: Mutex<LoggerState>,
    completed: Notify,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    /// A logger in its initial state: pending until the first `next_trial`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoggerState {
                active: DataLoggerStatus::new(0),
                retired: VecDeque::new(),
                next_serial: 1,
            }),
            completed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoggerState> {
        // Both profiles abort on panic, so a poisoned mutex cannot be
        // observed here.
        self.state.lock().expect("logger mutex poisoned")
    }

    /// Ingest one decoded packet, stamped with the current wallclock.
    pub fn ingest(&self, packet: &GroupPacket) {
        self.ingest_at(packet, wallclock_now());
    }

    /// Ingest one decoded packet at an explicit wallclock, for tests and
    /// replay tools.
    pub fn ingest_at(&self, packet: &GroupPacket, wallclock: f64) {
        let completed = {
            let mut state = self.lock();
            if packet.header.kind == GroupKind::Control {
                apply_control(&mut state, packet, wallclock)
            } else {
                ingest_data(&mut state, packet, wallclock)
            }
        };
        if completed {
            counter!("trials_completed").increment(1);
            self.completed.notify_one();
        }
    }

    /// Wait until at least one trial has completed since the last wait.
    pub async fn wait_completion(&self) {
        self.completed.notified().await;
    }

    /// Hand the writer the next completed trial, retired statuses first.
    #[must_use]
    pub fn next_trial_to_write(&self) -> Option<PendingTrial> {
        let mut state = self.lock();
        for status in &mut state.retired {
            if let Some(slot) = status.next_complete_trial_to_write() {
                status.mark_trial_writing(slot);
                return Some(PendingTrial {
                    ticket: WriteTicket {
                        serial: status.serial,
                        slot,
                    },
                    record: TrialRecord::extract(status, slot),
                });
            }
        }
        if let Some(slot) = state.active.next_complete_trial_to_write() {
            state.active.mark_trial_writing(slot);
            return Some(PendingTrial {
                ticket: WriteTicket {
                    serial: state.active.serial,
                    slot,
                },
                record: TrialRecord::extract(&state.active, slot),
            });
        }
        None
    }

    /// Release a slot the writer has finished with; frees a retired status
    /// once its last slot drains.
    pub fn mark_trial_written(&self, ticket: WriteTicket) {
        let mut state = self.lock();
        counter!("trials_written").increment(1);
        if state.active.serial == ticket.serial {
            state.active.mark_trial_written(ticket.slot);
            return;
        }
        if let Some(pos) = state
            .retired
            .iter()
            .position(|s| s.serial == ticket.serial)
        {
            state.retired[pos].mark_trial_written(ticket.slot);
            if state.retired[pos].is_drained() {
                info!(serial = ticket.serial, "retired status drained; freeing");
                let _ = state.retired.remove(pos);
            }
        }
        // A ticket for a status flushed in the meantime needs no action.
    }

    /// Split the current trial when it has been open too long.
    pub fn split_current_trial_if_older_than(&self, max_age_secs: f64) {
        let completed = {
            let mut state = self.lock();
            let wallclock = wallclock_now();
            state
                .active
                .split_current_trial_if_older_than(max_age_secs, wallclock)
                .completed
                .is_some()
        };
        if completed {
            counter!("trials_completed").increment(1);
            self.completed.notify_one();
        }
    }

    /// Flush stale slots in the active status and every retired status,
    /// freeing retired statuses that drain as a result.
    pub fn flush_trials_older_than(&self, max_age_secs: f64) {
        let mut state = self.lock();
        let wallclock = wallclock_now();
        state.active.flush_trials_older_than(max_age_secs, wallclock);
        for status in &mut state.retired {
            status.flush_trials_older_than(max_age_secs, wallclock);
        }
        state.retired.retain(|status| {
            if status.is_drained() {
                info!(serial = status.serial, "retired status drained by flush; freeing");
                false
            } else {
                true
            }
        });
    }

    /// Current state, for diagnostics and tests.
    #[must_use]
    pub fn snapshot(&self) -> LoggerSnapshot {
        let state = self.lock();
        LoggerSnapshot {
            active_serial: state.active.serial,
            pending_next_trial: state.active.pending_next_trial,
            current_trial_id: state.active.current_slot().trial_id,
            current_trial_index: state.active.current_trial_index(),
            group_count: state.active.groups().len(),
            retired_count: state.retired.len(),
        }
    }
}

impl PacketSink for Logger {
    fn deliver(&self, packet: GroupPacket) {
        self.ingest(&packet);
    }
}

fn ingest_data(state: &mut LoggerState, packet: &GroupPacket, wallclock: f64) -> bool {
    if state.active.pending_next_trial {
        debug!(group = %packet.header.name, "dropping data while awaiting the first trial advance");
        counter!("packets_dropped", "reason" => "pending_next_trial").increment(1);
        return false;
    }
    match state.active.ingest_data(packet, wallclock) {
        Ok(()) => false,
        Err(IngestError::ConfigDrift { group, was, now }) => {
            warn!(
                %group,
                was = format_args!("{was:#010x}"),
                now = format_args!("{now:#010x}"),
                "group configuration changed; retiring status"
            );
            counter!("status_retirements", "reason" => "config_drift").increment(1);
            let completed = state.retire_active(wallclock);
            if let Err(err) = state.active.ingest_data(packet, wallclock) {
                warn!(%err, "dropping packet that survived retirement");
                counter!("packets_dropped", "reason" => "post_retirement").increment(1);
            }
            completed
        }
        Err(IngestError::Alloc(err)) => {
            warn!(%err, group = %packet.header.name, "dropping packet on allocation failure");
            counter!("packets_dropped", "reason" => "alloc").increment(1);
            false
        }
    }
}

fn apply_control(state: &mut LoggerState, packet: &GroupPacket, wallclock: f64) -> bool {
    let mut completed = false;
    for sample in &packet.signals {
        match ControlCommand::from_sample(sample) {
            Ok(cmd) => completed |= apply_command(state, cmd, wallclock),
            Err(err) => {
                warn!(group = %packet.header.name, %err, "skipping control signal");
                counter!("packets_dropped", "reason" => "bad_control").increment(1);
            }
        }
    }
    completed
}

fn apply_command(state: &mut LoggerState, cmd: ControlCommand, wallclock: f64) -> bool {
    match cmd {
        ControlCommand::NextTrial(id) => {
            let status = &mut state.active;
            if status.pending_next_trial {
                info!("first trial advance received; logging enabled");
                status.pending_next_trial = false;
            }
            let outcome = status.advance_to_next_trial(id, wallclock);
            outcome.completed.is_some()
        }
        ControlCommand::SetMeta(update) => {
            if update.differs(&state.active.meta) {
                info!(?update, "metadata changed; retiring status");
                counter!("status_retirements", "reason" => "meta_change").increment(1);
                let completed = state.retire_active(wallclock);
                update.apply(&mut state.active.meta);
                completed
            } else {
                // Same value: just record that a sender specified it.
                update.apply(&mut state.active.meta);
                false
            }
        }
        ControlCommand::MarkComplete(idx) => state
            .active
            .mark_trial_complete(idx as usize, wallclock),
        ControlCommand::SplitNow => state
            .active
            .manual_split_current_trial(wallclock)
            .completed
            .is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triallog_wire::SignalKind;

    fn control_sample(name: &str, data: Vec<u8>, element_type: ElementType) -> SignalSample {
        SignalSample {
            is_variable: false,
            concat_last_dim: false,
            kind: SignalKind::Param,
            concat_dimension: 0,
            name: name.to_owned(),
            units: String::new(),
            element_type,
            dims: vec![data.len() as u16 / element_type.width() as u16],
            timestamp: 0.0,
            data,
        }
    }

    #[test]
    fn next_trial_with_and_without_an_id() {
        let with = control_sample("next_trial", 3u32.to_le_bytes().to_vec(), ElementType::U32);
        assert_eq!(
            ControlCommand::from_sample(&with),
            Ok(ControlCommand::NextTrial(Some(3)))
        );

        let without = control_sample("next_trial", vec![], ElementType::U32);
        assert_eq!(
            ControlCommand::from_sample(&without),
            Ok(ControlCommand::NextTrial(None))
        );
    }

    #[test]
    fn meta_commands_decode_text_and_scalars() {
        let subject = control_sample("subject", b"alpha".to_vec(), ElementType::Char);
        assert_eq!(
            ControlCommand::from_sample(&subject),
            Ok(ControlCommand::SetMeta(MetaUpdate::Subject(
                "alpha".to_owned()
            )))
        );

        let tag = control_sample("save_tag", 7u32.to_le_bytes().to_vec(), ElementType::U32);
        assert_eq!(
            ControlCommand::from_sample(&tag),
            Ok(ControlCommand::SetMeta(MetaUpdate::SaveTag(7)))
        );

        let wrong = control_sample("subject", 7u32.to_le_bytes().to_vec(), ElementType::U32);
        assert_eq!(
            ControlCommand::from_sample(&wrong),
            Err(ControlError::ExpectedText("subject".to_owned()))
        );
    }

    #[test]
    fn unknown_commands_are_rejected() {
        let bogus = control_sample("self_destruct", vec![], ElementType::U8);
        assert_eq!(
            ControlCommand::from_sample(&bogus),
            Err(ControlError::UnknownCommand("self_destruct".to_owned()))
        );
    }
}
