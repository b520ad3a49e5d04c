//! Encode/Decode for telemetry frames.
//!
//! A frame is a sequence of up to five parts:
//!
//! 1. `scheme` - the ascii literal `telemetry`
//! 2. `version` - a single byte, currently `1`
//! 3. `window` - optional, a single byte
//! 4. `topic` - optional, ascii (`key` or `error`)
//! 5. `payload` - opaque bytes, decoded according to the topic
//!
//! The middle parts are disambiguated by length: a window part is exactly one
//! byte, a topic part is longer. Strings inside payloads are u32 big-endian
//! length-prefixed UTF-8; maps are a u32 count followed by prefixed pairs;
//! enums are a single index byte in declaration order.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use data_types::{BaseUnit, Key, Names, Reportable, TimeUnit, Units};
use snafu::{ResultExt, Snafu};
use std::collections::BTreeMap;

/// The scheme part every frame leads with.
pub const SCHEME: &[u8] = b"telemetry";

/// The only wire version this codec speaks.
pub const VERSION: u8 = 1;

/// Topic naming newly discovered metric keys.
pub const TOPIC_KEY: &str = "key";

/// Topic naming liveness errors.
pub const TOPIC_ERROR: &str = "error";

/// Decoding errors. Every variant is recoverable: the frame is dropped and
/// the stream continues.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DecodeError {
    /// Fewer parts than scheme + version + payload.
    #[snafu(display("frame has {} parts, need at least 3", parts))]
    TooFewParts {
        /// Observed part count.
        parts: usize,
    },

    /// More parts than the five the protocol defines.
    #[snafu(display("frame has {} parts, at most 5 allowed", parts))]
    TooManyParts {
        /// Observed part count.
        parts: usize,
    },

    /// The scheme part is not `telemetry`.
    #[snafu(display("unknown scheme {:?}", scheme))]
    UnknownScheme {
        /// The offending scheme, lossily decoded.
        scheme: String,
    },

    /// The version part is not a supported version byte.
    #[snafu(display("unsupported telemetry version {}", version))]
    UnsupportedVersion {
        /// The offending version.
        version: u8,
    },

    /// The version part is not exactly one byte.
    #[snafu(display("malformed version part of {} bytes", len))]
    MalformedVersion {
        /// Observed length.
        len: usize,
    },

    /// A payload ended before a declared length was satisfied.
    #[snafu(display("payload truncated: wanted {} more bytes", wanted))]
    Truncated {
        /// How many bytes were missing.
        wanted: usize,
    },

    /// A length-prefixed string was not valid UTF-8.
    #[snafu(display("invalid utf-8 in payload: {}", source))]
    InvalidUtf8 {
        /// The underlying error.
        source: std::string::FromUtf8Error,
    },

    /// An enum index byte out of range.
    #[snafu(display("unknown {} index {}", what, value))]
    UnknownIndex {
        /// Which enum the index was for.
        what: &'static str,
        /// The offending byte.
        value: u8,
    },
}

/// A decoded telemetry frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Optional reporting window marker.
    pub window: Option<u8>,
    /// Optional topic; frames without one carry no routable payload.
    pub topic: Option<String>,
    /// The raw payload.
    pub payload: Bytes,
}

impl Frame {
    /// A `key`-topic frame carrying `key`.
    pub fn key(key: &Key) -> Self {
        Self {
            window: None,
            topic: Some(TOPIC_KEY.to_string()),
            payload: encode_key(key),
        }
    }

    /// An `error`-topic frame carrying `names`.
    pub fn error(names: &Names) -> Self {
        Self {
            window: None,
            topic: Some(TOPIC_ERROR.to_string()),
            payload: encode_names(names),
        }
    }
}

/// Encode a frame into its wire parts.
pub fn encode_frame(frame: &Frame) -> Vec<Bytes> {
    let mut parts = Vec::with_capacity(5);
    parts.push(Bytes::from_static(SCHEME));
    parts.push(Bytes::copy_from_slice(&[VERSION]));
    if let Some(window) = frame.window {
        parts.push(Bytes::copy_from_slice(&[window]));
    }
    if let Some(topic) = &frame.topic {
        parts.push(Bytes::copy_from_slice(topic.as_bytes()));
    }
    parts.push(frame.payload.clone());
    parts
}

/// Decode wire parts into a frame.
pub fn decode_frame(parts: &[Bytes]) -> Result<Frame, DecodeError> {
    if parts.len() < 3 {
        return TooFewPartsSnafu { parts: parts.len() }.fail();
    }
    if parts.len() > 5 {
        return TooManyPartsSnafu { parts: parts.len() }.fail();
    }

    if parts[0] != SCHEME {
        return UnknownSchemeSnafu {
            scheme: String::from_utf8_lossy(&parts[0]).into_owned(),
        }
        .fail();
    }

    if parts[1].len() != 1 {
        return MalformedVersionSnafu {
            len: parts[1].len(),
        }
        .fail();
    }
    if parts[1][0] != VERSION {
        return UnsupportedVersionSnafu {
            version: parts[1][0],
        }
        .fail();
    }

    let mut window = None;
    let mut topic = None;
    for part in &parts[2..parts.len() - 1] {
        // A one-byte middle part is the window marker; anything longer is the
        // topic. The window always precedes the topic on the wire.
        if part.len() == 1 && window.is_none() && topic.is_none() {
            window = Some(part[0]);
        } else if topic.is_none() {
            topic = Some(String::from_utf8(part.to_vec()).context(InvalidUtf8Snafu)?);
        } else {
            return TooManyPartsSnafu { parts: parts.len() }.fail();
        }
    }

    Ok(Frame {
        window,
        topic,
        payload: parts[parts.len() - 1].clone(),
    })
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn take_string(buf: &mut Bytes) -> Result<String, DecodeError> {
    if buf.remaining() < 4 {
        return TruncatedSnafu {
            wanted: 4 - buf.remaining(),
        }
        .fail();
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return TruncatedSnafu {
            wanted: len - buf.remaining(),
        }
        .fail();
    }
    String::from_utf8(buf.split_to(len).to_vec()).context(InvalidUtf8Snafu)
}

fn take_u8(buf: &mut Bytes) -> Result<u8, DecodeError> {
    if !buf.has_remaining() {
        return TruncatedSnafu { wanted: 1_usize }.fail();
    }
    Ok(buf.get_u8())
}

fn reportable_index(reportable: Reportable) -> u8 {
    match reportable {
        Reportable::B => 0,
        Reportable::D => 1,
        Reportable::S => 2,
        Reportable::Stats => 3,
    }
}

fn reportable_from(value: u8) -> Result<Reportable, DecodeError> {
    match value {
        0 => Ok(Reportable::B),
        1 => Ok(Reportable::D),
        2 => Ok(Reportable::S),
        3 => Ok(Reportable::Stats),
        value => UnknownIndexSnafu {
            what: "reportable",
            value,
        }
        .fail(),
    }
}

fn base_index(base: BaseUnit) -> u8 {
    match base {
        BaseUnit::Zero => 0,
        BaseUnit::Kilo => 1,
        BaseUnit::Mega => 2,
        BaseUnit::Giga => 3,
    }
}

fn base_from(value: u8) -> Result<BaseUnit, DecodeError> {
    match value {
        0 => Ok(BaseUnit::Zero),
        1 => Ok(BaseUnit::Kilo),
        2 => Ok(BaseUnit::Mega),
        3 => Ok(BaseUnit::Giga),
        value => UnknownIndexSnafu {
            what: "base unit",
            value,
        }
        .fail(),
    }
}

fn time_unit_index(unit: TimeUnit) -> u8 {
    match unit {
        TimeUnit::Days => 0,
        TimeUnit::Hours => 1,
        TimeUnit::Micro => 2,
        TimeUnit::Milli => 3,
        TimeUnit::Min => 4,
        TimeUnit::Nano => 5,
        TimeUnit::Sec => 6,
    }
}

fn time_unit_from(value: u8) -> Result<TimeUnit, DecodeError> {
    match value {
        0 => Ok(TimeUnit::Days),
        1 => Ok(TimeUnit::Hours),
        2 => Ok(TimeUnit::Micro),
        3 => Ok(TimeUnit::Milli),
        4 => Ok(TimeUnit::Min),
        5 => Ok(TimeUnit::Nano),
        6 => Ok(TimeUnit::Sec),
        value => UnknownIndexSnafu {
            what: "time unit",
            value,
        }
        .fail(),
    }
}

fn put_units(buf: &mut BytesMut, units: Units) {
    match units {
        Units::Duration { base, unit } => {
            buf.put_u8(0);
            buf.put_u8(base_index(base));
            buf.put_u8(time_unit_index(unit));
        }
        Units::Bytes { base } => {
            buf.put_u8(1);
            buf.put_u8(base_index(base));
        }
        Units::Count => buf.put_u8(2),
        Units::Ratio => buf.put_u8(3),
        Units::TrafficLight => buf.put_u8(4),
        Units::Healthy => buf.put_u8(5),
        Units::Load => buf.put_u8(6),
        Units::None => buf.put_u8(7),
    }
}

fn take_units(buf: &mut Bytes) -> Result<Units, DecodeError> {
    match take_u8(buf)? {
        0 => Ok(Units::Duration {
            base: base_from(take_u8(buf)?)?,
            unit: time_unit_from(take_u8(buf)?)?,
        }),
        1 => Ok(Units::Bytes {
            base: base_from(take_u8(buf)?)?,
        }),
        2 => Ok(Units::Count),
        3 => Ok(Units::Ratio),
        4 => Ok(Units::TrafficLight),
        5 => Ok(Units::Healthy),
        6 => Ok(Units::Load),
        7 => Ok(Units::None),
        value => UnknownIndexSnafu {
            what: "units",
            value,
        }
        .fail(),
    }
}

/// Encode a `key` payload.
pub fn encode_key(key: &Key) -> Bytes {
    let mut buf = BytesMut::new();
    put_string(&mut buf, &key.name);
    buf.put_u8(reportable_index(key.reportable));
    put_units(&mut buf, key.units);
    put_string(&mut buf, &key.description);
    buf.put_u32(key.attributes.len() as u32);
    for (k, v) in &key.attributes {
        put_string(&mut buf, k);
        put_string(&mut buf, v);
    }
    buf.freeze()
}

/// Decode a `key` payload.
pub fn decode_key(payload: &Bytes) -> Result<Key, DecodeError> {
    let mut buf = payload.clone();
    let name = take_string(&mut buf)?;
    let reportable = reportable_from(take_u8(&mut buf)?)?;
    let units = take_units(&mut buf)?;
    let description = take_string(&mut buf)?;

    let count = {
        if buf.remaining() < 4 {
            return TruncatedSnafu {
                wanted: 4 - buf.remaining(),
            }
            .fail();
        }
        buf.get_u32() as usize
    };
    let mut attributes = BTreeMap::new();
    for _ in 0..count {
        let k = take_string(&mut buf)?;
        let v = take_string(&mut buf)?;
        attributes.insert(k, v);
    }

    Ok(Key {
        name,
        reportable,
        units,
        description,
        attributes,
    })
}

/// Encode an `error` payload.
pub fn encode_names(names: &Names) -> Bytes {
    let mut buf = BytesMut::new();
    put_string(&mut buf, &names.mine);
    put_string(&mut buf, &names.kind);
    put_string(&mut buf, &names.theirs);
    buf.freeze()
}

/// Decode an `error` payload.
pub fn decode_names(payload: &Bytes) -> Result<Names, DecodeError> {
    let mut buf = payload.clone();
    Ok(Names {
        mine: take_string(&mut buf)?,
        kind: take_string(&mut buf)?,
        theirs: take_string(&mut buf)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn jvm_memory() -> Key {
        Key {
            name: "jvm.memory".into(),
            reportable: Reportable::D,
            units: Units::Bytes {
                base: BaseUnit::Mega,
            },
            description: "heap in use".into(),
            attributes: [("source".to_string(), "jvm".to_string())].into(),
        }
    }

    #[test]
    fn key_frame_roundtrip() {
        let key = jvm_memory();
        let parts = encode_frame(&Frame::key(&key));

        let frame = decode_frame(&parts).unwrap();
        assert_eq!(frame.topic.as_deref(), Some(TOPIC_KEY));
        assert_eq!(frame.window, None);
        assert_eq!(decode_key(&frame.payload).unwrap(), key);
    }

    #[test]
    fn error_frame_roundtrip() {
        let names = Names {
            mine: "i-flask01".into(),
            kind: "http".into(),
            theirs: "i-target01".into(),
        };
        let parts = encode_frame(&Frame::error(&names));

        let frame = decode_frame(&parts).unwrap();
        assert_eq!(frame.topic.as_deref(), Some(TOPIC_ERROR));
        assert_eq!(decode_names(&frame.payload).unwrap(), names);
    }

    #[test]
    fn window_and_topic_disambiguate_by_length() {
        let key = jvm_memory();
        let frame = Frame {
            window: Some(3),
            topic: Some(TOPIC_KEY.to_string()),
            payload: encode_key(&key),
        };

        let parts = encode_frame(&frame);
        assert_eq!(parts.len(), 5);
        let decoded = decode_frame(&parts).unwrap();
        assert_eq!(decoded.window, Some(3));
        assert_eq!(decoded.topic.as_deref(), Some(TOPIC_KEY));
    }

    #[test]
    fn duration_units_carry_base_and_granularity() {
        let key = Key {
            name: "request.latency".into(),
            reportable: Reportable::Stats,
            units: Units::Duration {
                base: BaseUnit::Zero,
                unit: TimeUnit::Milli,
            },
            description: String::new(),
            attributes: Default::default(),
        };

        let decoded = decode_key(&encode_key(&key)).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn rejects_unknown_scheme() {
        let mut parts = encode_frame(&Frame::key(&jvm_memory()));
        parts[0] = Bytes::from_static(b"gossip");

        assert_matches!(decode_frame(&parts), Err(DecodeError::UnknownScheme { .. }));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut parts = encode_frame(&Frame::key(&jvm_memory()));
        parts[1] = Bytes::copy_from_slice(&[9]);

        assert_matches!(
            decode_frame(&parts),
            Err(DecodeError::UnsupportedVersion { version: 9 })
        );
    }

    #[test]
    fn rejects_short_frames() {
        let parts = vec![Bytes::from_static(SCHEME), Bytes::copy_from_slice(&[1])];
        assert_matches!(decode_frame(&parts), Err(DecodeError::TooFewParts { .. }));
    }

    #[test]
    fn rejects_truncated_payloads() {
        let payload = encode_key(&jvm_memory());
        let truncated = payload.slice(0..payload.len() - 3);

        assert_matches!(decode_key(&truncated), Err(DecodeError::Truncated { .. }));
    }

    #[test]
    fn rejects_unknown_reportable() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "x");
        buf.put_u8(17);
        let payload = buf.freeze();

        assert_matches!(
            decode_key(&payload),
            Err(DecodeError::UnknownIndex {
                what: "reportable",
                value: 17
            })
        );
    }
}
