//! Group header and signal sample codec.
//!
//! A payload is exactly one group header followed by the `n_signals`
//! samples the header announces. Decoding never touches a trial; it hands
//! back an owned [`GroupPacket`] and leaves accumulation to the caller.

use crate::{
    Cursor, ElementType, Error, GroupKind, SignalKind, MAX_GROUP_NAME, MAX_GROUP_SIGNALS,
    MAX_SIGNAL_DIM, MAX_SIGNAL_NAME, MAX_SIGNAL_NDIMS,
};

const FLAG_IS_VARIABLE: u8 = 0b0000_0001;
const FLAG_CONCAT_LAST_DIM: u8 = 0b0000_0010;

/// Decoded group header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupHeader {
    /// Serializer block version announced by the sender.
    pub version: u16,
    /// Group name, the accumulator's lookup key.
    pub name: String,
    /// One of the six group kinds.
    pub kind: GroupKind,
    /// Fingerprint of the sender-side group configuration.
    pub config_hash: u32,
    /// Number of signal samples that follow the header.
    pub n_signals: u16,
}

/// One decoded signal sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSample {
    /// Samples of this signal may change shape between packets.
    pub is_variable: bool,
    /// Concatenate along `concat_dimension` rather than a new leading axis.
    pub concat_last_dim: bool,
    /// What the sample is for.
    pub kind: SignalKind,
    /// Dimension to concatenate along when `concat_last_dim` is set.
    pub concat_dimension: u8,
    /// Signal name.
    pub name: String,
    /// Unit string, possibly empty.
    pub units: String,
    /// Element type of `data`.
    pub element_type: ElementType,
    /// Dimensions of this sample; empty means scalar.
    pub dims: Vec<u16>,
    /// Timestamp in milliseconds, monotonic within a source.
    pub timestamp: f64,
    /// Raw little-endian payload, `element_type.width() * product(dims)` bytes.
    pub data: Vec<u8>,
}

impl SignalSample {
    /// Elements in one sample: the product of its dimensions.
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.dims.iter().map(|d| usize::from(*d)).product()
    }

    /// Bytes one sample of this shape occupies.
    #[must_use]
    pub fn data_bytes(&self) -> usize {
        self.element_type.width() * self.element_count()
    }

    /// Read the sample's first element as an `f64`, if there is one.
    ///
    /// Used for the reserved timestamp kinds, which carry a single scalar.
    #[must_use]
    pub fn scalar_f64(&self) -> Option<f64> {
        let mut c = Cursor::new(&self.data);
        match self.element_type {
            ElementType::F64 => c.f64().ok(),
            ElementType::F32 => c.f32().ok().map(f64::from),
            ElementType::I8 => c.i8().ok().map(f64::from),
            ElementType::U8 | ElementType::Char | ElementType::Bool => {
                c.u8().ok().map(f64::from)
            }
            ElementType::I16 => c.i16().ok().map(f64::from),
            ElementType::U16 => c.u16().ok().map(f64::from),
            ElementType::I32 => c.i32().ok().map(f64::from),
            ElementType::U32 => c.u32().ok().map(f64::from),
        }
    }
}

/// Everything one valid payload carries.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupPacket {
    /// The group header.
    pub header: GroupHeader,
    /// The samples announced by the header, in wire order.
    pub signals: Vec<SignalSample>,
}

fn pull_string(c: &mut Cursor, max: usize) -> Result<String, Error> {
    let len = usize::from(c.u8()?);
    if len > max {
        return Err(Error::NameTooLong { got: len, max });
    }
    let raw = c.bytes(len)?;
    // Names are length-prefixed bytes on the wire, not guaranteed UTF-8;
    // lossy conversion keeps a hostile byte from rejecting the packet.
    Ok(String::from_utf8_lossy(raw).into_owned())
}

fn push_string(out: &mut Vec<u8>, s: &str, max: usize) -> Result<(), Error> {
    let raw = s.as_bytes();
    if raw.len() > max.min(255) {
        return Err(Error::NameTooLong {
            got: raw.len(),
            max: max.min(255),
        });
    }
    out.push(raw.len() as u8);
    out.extend_from_slice(raw);
    Ok(())
}

fn decode_header(c: &mut Cursor) -> Result<GroupHeader, Error> {
    let version = c.u16()?;
    let name = pull_string(c, MAX_GROUP_NAME)?;
    let kind = GroupKind::from_id(c.u8()?)?;
    let config_hash = c.u32()?;
    let n_signals = c.u16()?;
    if n_signals > MAX_GROUP_SIGNALS {
        return Err(Error::TooManySignals(n_signals));
    }
    Ok(GroupHeader {
        version,
        name,
        kind,
        config_hash,
        n_signals,
    })
}

fn decode_signal(c: &mut Cursor) -> Result<SignalSample, Error> {
    let flags = c.u8()?;
    let kind = SignalKind::from_id(c.u8()?)?;
    let concat_dimension = c.u8()?;
    let name = pull_string(c, MAX_SIGNAL_NAME)?;
    let units = pull_string(c, MAX_SIGNAL_NAME)?;
    let element_type = ElementType::from_id(c.u8()?)?;

    let n_dims = c.u8()?;
    if usize::from(n_dims) > MAX_SIGNAL_NDIMS {
        return Err(Error::TooManyDims(n_dims));
    }
    let dims = c.u16_array(usize::from(n_dims))?;
    if let Some(d) = dims.iter().find(|d| **d > MAX_SIGNAL_DIM) {
        return Err(Error::DimTooLarge(*d));
    }

    let timestamp = c.f64()?;

    let n_bytes = element_type.width() * dims.iter().map(|d| usize::from(*d)).product::<usize>();
    let data = c.bytes(n_bytes)?.to_vec();

    Ok(SignalSample {
        is_variable: flags & FLAG_IS_VARIABLE != 0,
        concat_last_dim: flags & FLAG_CONCAT_LAST_DIM != 0,
        kind,
        concat_dimension,
        name,
        units,
        element_type,
        dims,
        timestamp,
        data,
    })
}

/// Decode one payload into a [`GroupPacket`].
///
/// Trailing bytes beyond the announced signals reject the packet; a sender
/// that padded its payload is a sender whose lengths cannot be trusted.
pub fn decode(payload: &[u8]) -> Result<GroupPacket, Error> {
    let mut c = Cursor::new(payload);
    let header = decode_header(&mut c)?;
    let mut signals = Vec::with_capacity(usize::from(header.n_signals));
    for _ in 0..header.n_signals {
        signals.push(decode_signal(&mut c)?);
    }
    if !c.is_empty() {
        return Err(Error::LengthMismatch {
            declared: payload.len(),
            available: payload.len() - c.remaining(),
        });
    }
    Ok(GroupPacket { header, signals })
}

impl GroupPacket {
    /// Encode this packet back into payload bytes, the exact inverse of
    /// [`decode`].
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.header.version.to_le_bytes());
        push_string(&mut out, &self.header.name, MAX_GROUP_NAME)?;
        out.push(self.header.kind.id());
        out.extend_from_slice(&self.header.config_hash.to_le_bytes());
        let n_signals = self.signals.len() as u16;
        if n_signals > MAX_GROUP_SIGNALS {
            return Err(Error::TooManySignals(n_signals));
        }
        out.extend_from_slice(&n_signals.to_le_bytes());

        for s in &self.signals {
            let mut flags = 0u8;
            if s.is_variable {
                flags |= FLAG_IS_VARIABLE;
            }
            if s.concat_last_dim {
                flags |= FLAG_CONCAT_LAST_DIM;
            }
            out.push(flags);
            out.push(s.kind.id());
            out.push(s.concat_dimension);
            push_string(&mut out, &s.name, MAX_SIGNAL_NAME)?;
            push_string(&mut out, &s.units, MAX_SIGNAL_NAME)?;
            out.push(s.element_type.id());
            if s.dims.len() > MAX_SIGNAL_NDIMS {
                return Err(Error::TooManyDims(s.dims.len() as u8));
            }
            out.push(s.dims.len() as u8);
            for d in &s.dims {
                if *d > MAX_SIGNAL_DIM {
                    return Err(Error::DimTooLarge(*d));
                }
                out.extend_from_slice(&d.to_le_bytes());
            }
            out.extend_from_slice(&s.timestamp.to_le_bytes());
            debug_assert_eq!(s.data.len(), s.data_bytes());
            out.extend_from_slice(&s.data);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;

    fn analog_sample(name: &str, values: &[f32], timestamp: f64) -> SignalSample {
        SignalSample {
            is_variable: false,
            concat_last_dim: false,
            kind: SignalKind::Analog,
            concat_dimension: 0,
            name: name.to_owned(),
            units: "mV".to_owned(),
            element_type: ElementType::F32,
            dims: vec![values.len() as u16],
            timestamp,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn analog_packet() -> GroupPacket {
        GroupPacket {
            header: GroupHeader {
                version: 3,
                name: "hand_position".to_owned(),
                kind: GroupKind::Analog,
                config_hash: 0xdead_beef,
                n_signals: 1,
            },
            signals: vec![analog_sample("x", &[0.5, -1.5, 2.0, 8.25], 12.0)],
        }
    }

    #[test]
    fn encode_decode_round_trips() {
        let packet = analog_packet();
        let bytes = packet.encode().unwrap();
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn scalar_sample_still_carries_one_element() {
        let mut packet = analog_packet();
        packet.signals[0].dims.clear();
        packet.signals[0].data = 7.0f32.to_le_bytes().to_vec();
        let bytes = packet.encode().unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.signals[0].element_count(), 1);
        assert_eq!(decoded.signals[0].data_bytes(), 4);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn zero_signals_is_a_valid_packet() {
        let packet = GroupPacket {
            header: GroupHeader {
                version: 1,
                name: "quiet".to_owned(),
                kind: GroupKind::Control,
                config_hash: 0,
                n_signals: 0,
            },
            signals: vec![],
        };
        let bytes = packet.encode().unwrap();
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn unknown_group_kind_rejects_the_packet() {
        let mut bytes = analog_packet().encode().unwrap();
        // kind byte sits after version (2) + name length prefix (1) + name.
        let kind_at = 2 + 1 + "hand_position".len();
        bytes[kind_at] = 9;
        assert_eq!(decode(&bytes), Err(Error::UnknownGroupKind(9)));
    }

    #[test]
    fn truncated_sample_data_rejects_the_packet() {
        let mut bytes = analog_packet().encode().unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(decode(&bytes), Err(Error::Exhausted { .. })));
    }

    #[test]
    fn trailing_garbage_rejects_the_packet() {
        let mut bytes = analog_packet().encode().unwrap();
        bytes.push(0x00);
        assert!(matches!(decode(&bytes), Err(Error::LengthMismatch { .. })));
    }

    #[test]
    fn oversized_dimension_rejects_the_packet() {
        let sample = SignalSample {
            dims: vec![10_001],
            data: vec![],
            ..analog_sample("too_wide", &[], 0.0)
        };
        let packet = GroupPacket {
            header: GroupHeader {
                version: 1,
                name: "g".to_owned(),
                kind: GroupKind::Analog,
                config_hash: 0,
                n_signals: 1,
            },
            signals: vec![sample],
        };
        assert_eq!(packet.encode(), Err(Error::DimTooLarge(10_001)));
    }

    #[test]
    fn too_many_dimensions_reject_the_packet() {
        // Hand-built payload: a one-signal group whose sample declares
        // eleven dimensions.
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u16.to_le_bytes()); // version
        payload.push(1);
        payload.push(b'g'); // name
        payload.push(3); // analog group
        payload.extend_from_slice(&0u32.to_le_bytes()); // config hash
        payload.extend_from_slice(&1u16.to_le_bytes()); // one signal
        payload.push(0); // flags
        payload.push(0); // normal signal
        payload.push(0); // concat dimension
        payload.push(1);
        payload.push(b'x'); // name
        payload.push(0); // empty units
        payload.push(3); // u8 elements
        payload.push(11); // one dimension too many
        assert_eq!(decode(&payload), Err(Error::TooManyDims(11)));
    }

    #[test]
    fn framed_packet_survives_the_envelope() {
        let packet = analog_packet();
        let datagram = frame::frame(&packet.encode().unwrap()).unwrap();
        let payload = frame::unframe(&datagram).unwrap();
        assert_eq!(decode(payload).unwrap(), packet);
    }

    #[test]
    fn timestamp_scalar_reads_through_every_width() {
        let mut s = analog_sample("ts", &[], 0.0);
        s.kind = SignalKind::Timestamp;
        s.element_type = ElementType::U16;
        s.dims = vec![1];
        s.data = 777u16.to_le_bytes().to_vec();
        assert_eq!(s.scalar_f64(), Some(777.0));

        s.element_type = ElementType::F64;
        s.data = 55.5f64.to_le_bytes().to_vec();
        assert_eq!(s.scalar_f64(), Some(55.5));

        s.data.clear();
        assert_eq!(s.scalar_f64(), None);
    }
}
