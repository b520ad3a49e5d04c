//! Parsing of cloud queue message bodies.
//!
//! Messages are JSON. Unknown fields are ignored; a missing required field or
//! an unparseable timestamp is a [`MessageParseError`]. Event kinds other
//! than launch/terminate parse successfully and interpret to no-ops, so a
//! provider adding notification types cannot poison the queue.

use chemist_time::Time;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

/// A message body that could not be understood.
///
/// Such messages are logged and deleted from the queue without any repository
/// mutation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MessageParseError {
    /// The body is not the expected JSON shape.
    #[snafu(display("malformed event message: {}", source))]
    Malformed {
        /// The underlying serde error.
        source: serde_json::Error,
    },

    /// The timestamp is not ISO-8601.
    #[snafu(display("bad event timestamp {:?}: {}", value, source))]
    BadTimestamp {
        /// The offending timestamp text.
        value: String,
        /// The underlying parse error.
        source: chemist_time::ParseError,
    },
}

/// What a message says happened. Unlike [`data_types::EventKind`] this keeps
/// unrecognized kinds around so they can be acknowledged as no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// An instance came up.
    Launch,
    /// An instance went away.
    Terminate,
    /// Any other notification type.
    Other,
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // unrecognized kinds must parse, so they can be acked as no-ops
        let kind = String::deserialize(deserializer)?;
        Ok(match kind.as_str() {
            "Launch" => Self::Launch,
            "Terminate" => Self::Terminate,
            _ => Self::Other,
        })
    }
}

/// A parsed cloud event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudEvent {
    /// What happened.
    pub kind: MessageKind,
    /// The auto-scaling group reporting it.
    pub asg: String,
    /// The subject instance.
    pub instance_id: String,
    /// When the cloud says it happened.
    pub time: Time,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    kind: MessageKind,
    #[serde(rename = "asgName")]
    asg_name: String,
    #[serde(rename = "instanceId")]
    instance_id: String,
    time: String,
}

/// Parse one message body.
pub fn parse(body: &str) -> Result<CloudEvent, MessageParseError> {
    let wire: WireEvent = serde_json::from_str(body).context(MalformedSnafu)?;
    let time = Time::from_rfc3339(&wire.time).context(BadTimestampSnafu {
        value: wire.time.clone(),
    })?;
    Ok(CloudEvent {
        kind: wire.kind,
        asg: wire.asg_name,
        instance_id: wire.instance_id,
        time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parses_a_launch() {
        let event = parse(
            r#"{"kind":"Launch","asgName":"accounts-blue","instanceId":"i-target01","time":"2020-04-07T11:36:04+00:00"}"#,
        )
        .unwrap();

        assert_eq!(event.kind, MessageKind::Launch);
        assert_eq!(event.asg, "accounts-blue");
        assert_eq!(event.instance_id, "i-target01");
        assert_eq!(
            event.time,
            Time::from_rfc3339("2020-04-07T11:36:04Z").unwrap()
        );
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let event = parse(
            r#"{"kind":"Terminate","asgName":"a","instanceId":"i","time":"2020-04-07T11:36:04Z","cause":"scale-in"}"#,
        )
        .unwrap();
        assert_eq!(event.kind, MessageKind::Terminate);
    }

    #[test]
    fn unknown_kinds_parse_as_other() {
        let event = parse(
            r#"{"kind":"TestNotification","asgName":"a","instanceId":"i","time":"2020-04-07T11:36:04Z"}"#,
        )
        .unwrap();
        assert_eq!(event.kind, MessageKind::Other);
    }

    #[test]
    fn missing_fields_are_parse_errors() {
        assert_matches!(
            parse(r#"{"kind":"Launch","time":"2020-04-07T11:36:04Z"}"#),
            Err(MessageParseError::Malformed { .. })
        );
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert_matches!(parse("not json"), Err(MessageParseError::Malformed { .. }));
    }

    #[test]
    fn bad_timestamps_are_parse_errors() {
        assert_matches!(
            parse(r#"{"kind":"Launch","asgName":"a","instanceId":"i","time":"yesterday"}"#),
            Err(MessageParseError::BadTimestamp { .. })
        );
    }
}
