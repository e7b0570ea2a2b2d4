//! Wire format shared by the triallog daemon and anything that speaks to it.
//!
//! A datagram is a 4 byte envelope (little-endian `u16` payload length,
//! then a little-endian `u16` checksum) followed by the payload: one group
//! header and the signal samples it announces. Everything on the wire is
//! little-endian and unaligned.
//!
//! This crate only moves bytes. It never allocates into a trial and has no
//! opinion about what a signal means; that is the daemon's business.

use serde::{Deserialize, Serialize};

pub mod cursor;
pub mod frame;
pub mod packet;

pub use cursor::Cursor;
pub use packet::{GroupHeader, GroupPacket, SignalSample};

/// Largest datagram we will read off the socket.
pub const MAX_PACKET_BYTES: usize = 65_535;
/// Bytes taken by the length/checksum envelope.
pub const ENVELOPE_BYTES: usize = 4;
/// Largest payload that still fits a maximum datagram behind the envelope.
pub const MAX_PAYLOAD_BYTES: usize = MAX_PACKET_BYTES - ENVELOPE_BYTES;

/// Group names are short; anything longer is a malformed packet.
pub const MAX_GROUP_NAME: usize = 200;
/// Signal names and unit strings share one limit.
pub const MAX_SIGNAL_NAME: usize = 300;
/// A signal sample carries at most this many dimensions.
pub const MAX_SIGNAL_NDIMS: usize = 10;
/// Upper bound on any single dimension of a sample.
pub const MAX_SIGNAL_DIM: u16 = 10_000;
/// A group announces at most this many signals per packet.
pub const MAX_GROUP_SIGNALS: u16 = 500;

/// Errors produced while framing or decoding datagrams.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Datagram too small to hold the envelope plus anything useful.
    #[error("datagram of {got} bytes is below the 8 byte minimum")]
    DatagramTooShort {
        /// Bytes actually read off the socket.
        got: usize,
    },
    /// Envelope length field points past the end of the datagram.
    #[error("declared payload of {declared} bytes but only {available} present")]
    LengthMismatch {
        /// Length field from the envelope.
        declared: usize,
        /// Bytes present after the envelope.
        available: usize,
    },
    /// Payload byte sum does not match the envelope checksum.
    #[error("checksum mismatch: declared {declared:#06x}, computed {computed:#06x}")]
    ChecksumMismatch {
        /// Checksum field from the envelope.
        declared: u16,
        /// Checksum computed over the payload.
        computed: u16,
    },
    /// Payload too large to frame into a single datagram.
    #[error("payload of {got} bytes exceeds the {MAX_PAYLOAD_BYTES} byte maximum")]
    PayloadTooLarge {
        /// Bytes offered for framing.
        got: usize,
    },
    /// A pull ran off the end of the payload.
    #[error("payload exhausted: needed {needed} more bytes, {remaining} remain")]
    Exhausted {
        /// Bytes the pull required.
        needed: usize,
        /// Bytes left in the payload.
        remaining: usize,
    },
    /// Group type byte outside the closed set.
    #[error("unknown group kind id {0}")]
    UnknownGroupKind(u8),
    /// Signal type byte outside the closed set.
    #[error("unknown signal kind id {0}")]
    UnknownSignalKind(u8),
    /// Element type byte outside the closed set.
    #[error("unknown element type id {0}")]
    UnknownElementType(u8),
    /// A length-prefixed string exceeded its limit.
    #[error("name of {got} bytes exceeds the {max} byte limit")]
    NameTooLong {
        /// Bytes in the offending string.
        got: usize,
        /// Limit for this field.
        max: usize,
    },
    /// More dimensions than a sample may carry.
    #[error("sample declares {0} dimensions, limit is {MAX_SIGNAL_NDIMS}")]
    TooManyDims(u8),
    /// A single dimension over the per-dimension cap.
    #[error("dimension of {0} exceeds the {MAX_SIGNAL_DIM} element limit")]
    DimTooLarge(u16),
    /// Group header announces more signals than allowed.
    #[error("group declares {0} signals, limit is {MAX_GROUP_SIGNALS}")]
    TooManySignals(u16),
}

/// Element types a signal sample may carry, with fixed byte widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    /// 64-bit float, id 0.
    F64,
    /// 32-bit float, id 1.
    F32,
    /// Signed byte, id 2.
    I8,
    /// Unsigned byte, id 3.
    U8,
    /// Signed 16-bit, id 4.
    I16,
    /// Unsigned 16-bit, id 5.
    U16,
    /// Signed 32-bit, id 6.
    I32,
    /// Unsigned 32-bit, id 7.
    U32,
    /// Single-byte character, id 8.
    Char,
    /// Boolean byte, id 9.
    Bool,
}

impl ElementType {
    /// Map a wire id to an element type.
    pub fn from_id(id: u8) -> Result<Self, Error> {
        Ok(match id {
            0 => Self::F64,
            1 => Self::F32,
            2 => Self::I8,
            3 => Self::U8,
            4 => Self::I16,
            5 => Self::U16,
            6 => Self::I32,
            7 => Self::U32,
            8 => Self::Char,
            9 => Self::Bool,
            other => return Err(Error::UnknownElementType(other)),
        })
    }

    /// The wire id of this element type.
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::F64 => 0,
            Self::F32 => 1,
            Self::I8 => 2,
            Self::U8 => 3,
            Self::I16 => 4,
            Self::U16 => 5,
            Self::I32 => 6,
            Self::U32 => 7,
            Self::Char => 8,
            Self::Bool => 9,
        }
    }

    /// Bytes one element of this type occupies on the wire.
    #[must_use]
    pub fn width(self) -> usize {
        match self {
            Self::F64 => 8,
            Self::F32 | Self::I32 | Self::U32 => 4,
            Self::I16 | Self::U16 => 2,
            Self::I8 | Self::U8 | Self::Char | Self::Bool => 1,
        }
    }
}

/// What a signal sample is for, beyond its raw payload.
///
/// `Timestamp` and `TimestampOffset` are reserved: the accumulator consumes
/// them into the group's timestamp stream rather than storing them as data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Plain data, id 0.
    Normal,
    /// Supplies the group timestamp outright, id 1.
    Timestamp,
    /// Supplies an offset added to the packet timestamp, id 2.
    TimestampOffset,
    /// Pulse marker, id 3.
    Pulse,
    /// Parameter whose latest value supersedes prior ones, id 4.
    Param,
    /// Analog channel, id 5.
    Analog,
    /// Event name text, id 6.
    EventName,
    /// Event tag, id 7.
    EventTag,
    /// Spike time, id 8.
    Spike,
    /// Spike waveform snippet, id 9.
    SpikeWaveform,
}

impl SignalKind {
    /// Map a wire id to a signal kind.
    pub fn from_id(id: u8) -> Result<Self, Error> {
        Ok(match id {
            0 => Self::Normal,
            1 => Self::Timestamp,
            2 => Self::TimestampOffset,
            3 => Self::Pulse,
            4 => Self::Param,
            5 => Self::Analog,
            6 => Self::EventName,
            7 => Self::EventTag,
            8 => Self::Spike,
            9 => Self::SpikeWaveform,
            other => return Err(Error::UnknownSignalKind(other)),
        })
    }

    /// The wire id of this signal kind.
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Timestamp => 1,
            Self::TimestampOffset => 2,
            Self::Pulse => 3,
            Self::Param => 4,
            Self::Analog => 5,
            Self::EventName => 6,
            Self::EventTag => 7,
            Self::Spike => 8,
            Self::SpikeWaveform => 9,
        }
    }

    /// True for the reserved kinds that feed the group timestamp stream.
    #[must_use]
    pub fn is_timestamp(self) -> bool {
        matches!(self, Self::Timestamp | Self::TimestampOffset)
    }
}

/// The six group types, wire ids 1 through 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    /// Carries control commands, never trial data.
    Control,
    /// Parameters; the latest packet supersedes earlier ones.
    Param,
    /// Analog channels.
    Analog,
    /// Discrete events.
    Event,
    /// Spike times.
    Spike,
    /// Continuous field data.
    Field,
}

impl GroupKind {
    /// Map a wire id to a group kind.
    pub fn from_id(id: u8) -> Result<Self, Error> {
        Ok(match id {
            1 => Self::Control,
            2 => Self::Param,
            3 => Self::Analog,
            4 => Self::Event,
            5 => Self::Spike,
            6 => Self::Field,
            other => return Err(Error::UnknownGroupKind(other)),
        })
    }

    /// The wire id of this group kind.
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::Control => 1,
            Self::Param => 2,
            Self::Analog => 3,
            Self::Event => 4,
            Self::Spike => 5,
            Self::Field => 6,
        }
    }
}
