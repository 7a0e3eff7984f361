//! NIP-01 / NIP-42 frames exchanged with relays.

use serde_json::{json, Value};

use crate::event::JsonEvent;
use crate::filter::{Filter, SubscriptionId};
use crate::Error;

/// A frame received from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", subscription_id, event]`
    Event {
        subscription_id: SubscriptionId,
        event: JsonEvent,
    },
    /// `["EOSE", subscription_id]`
    Eose { subscription_id: SubscriptionId },
    /// `["OK", event_id, success, message]`
    Ok {
        event_id: String,
        success: bool,
        message: String,
    },
    /// `["NOTICE", message]`
    Notice { message: String },
    /// `["CLOSED", subscription_id, message]`
    Closed {
        subscription_id: SubscriptionId,
        message: String,
    },
    /// `["AUTH", challenge]`
    Auth { challenge: String },
}

impl RelayMessage {
    pub fn from_json(text: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(text)?;
        let frame = value
            .as_array()
            .ok_or_else(|| Error::MalformedFrame("frame is not an array".to_string()))?;
        let frame_type = frame
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedFrame("missing frame type".to_string()))?;

        match frame_type {
            "EVENT" => {
                let subscription_id = string_at(frame, 1)?;
                let event = frame
                    .get(2)
                    .cloned()
                    .ok_or_else(|| Error::MalformedFrame("EVENT without event".to_string()))?;
                Ok(Self::Event {
                    subscription_id,
                    event: JsonEvent::from_value(event)?,
                })
            }
            "EOSE" => Ok(Self::Eose {
                subscription_id: string_at(frame, 1)?,
            }),
            "OK" => {
                let event_id = string_at(frame, 1)?;
                let success = frame
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| Error::MalformedFrame("OK without status".to_string()))?;
                let message = frame
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(Self::Ok {
                    event_id,
                    success,
                    message,
                })
            }
            "NOTICE" => Ok(Self::Notice {
                message: string_at(frame, 1)?,
            }),
            "CLOSED" => Ok(Self::Closed {
                subscription_id: string_at(frame, 1)?,
                message: frame
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "AUTH" => Ok(Self::Auth {
                challenge: string_at(frame, 1)?,
            }),
            other => Err(Error::UnknownFrame(other.to_string())),
        }
    }
}

fn string_at(frame: &[Value], index: usize) -> Result<String, Error> {
    frame
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::MalformedFrame(format!("expected string at position {index}")))
}

/// A frame sent to a relay.
#[derive(Debug, Clone)]
pub enum ClientMessage<'a> {
    Req {
        subscription_id: &'a str,
        filter: &'a Filter,
    },
    Close { subscription_id: &'a str },
    Event { event: &'a JsonEvent },
    Auth { event: &'a JsonEvent },
}

impl ClientMessage<'_> {
    pub fn to_json(&self) -> Result<String, Error> {
        let frame = match self {
            Self::Req {
                subscription_id,
                filter,
            } => json!(["REQ", subscription_id, filter.to_json()]),
            Self::Close { subscription_id } => json!(["CLOSE", subscription_id]),
            Self::Event { event } => json!(["EVENT", event]),
            Self::Auth { event } => json!(["AUTH", event]),
        };
        Ok(serde_json::to_string(&frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    const EVENT_JSON: &str = r#"{"id":"e1","pubkey":"abc","created_at":10,"kind":1,"tags":[["p","def"]],"content":"hi","sig":"s"}"#;

    #[test]
    fn test_parse_event_frame() {
        let text = format!(r#"["EVENT","sub-1",{EVENT_JSON}]"#);
        let message = RelayMessage::from_json(&text).unwrap();
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                assert_eq!(subscription_id, "sub-1");
                assert_eq!(event.id, "e1");
                assert_eq!(event.tags, vec![vec!["p".to_string(), "def".to_string()]]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_control_frames() {
        assert_eq!(
            RelayMessage::from_json(r#"["EOSE","sub-1"]"#).unwrap(),
            RelayMessage::Eose {
                subscription_id: "sub-1".to_string()
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["OK","e1",false,"duplicate: already have this event"]"#)
                .unwrap(),
            RelayMessage::Ok {
                event_id: "e1".to_string(),
                success: false,
                message: "duplicate: already have this event".to_string(),
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["NOTICE","rate limited"]"#).unwrap(),
            RelayMessage::Notice {
                message: "rate limited".to_string()
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["CLOSED","sub-1","auth-required: sign in"]"#).unwrap(),
            RelayMessage::Closed {
                subscription_id: "sub-1".to_string(),
                message: "auth-required: sign in".to_string(),
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["AUTH","challenge-1"]"#).unwrap(),
            RelayMessage::Auth {
                challenge: "challenge-1".to_string()
            }
        );
    }

    #[test]
    fn test_bad_frames_are_errors() {
        assert!(matches!(
            RelayMessage::from_json(r#"["COUNT","sub",{"count":1}]"#),
            Err(Error::UnknownFrame(kind)) if kind == "COUNT"
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"{"EVENT":1}"#),
            Err(Error::MalformedFrame(_))
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["OK","e1"]"#),
            Err(Error::MalformedFrame(_))
        ));
        assert!(matches!(
            RelayMessage::from_json("not json"),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_client_frames() {
        let filter = Filter::new().kinds([EventKind::Text]).limit(1);
        let id = filter.id();
        let req = ClientMessage::Req {
            subscription_id: &id,
            filter: &filter,
        }
        .to_json()
        .unwrap();
        let value: Value = serde_json::from_str(&req).unwrap();
        assert_eq!(value[0], "REQ");
        assert_eq!(value[1], id.as_str());
        assert_eq!(value[2]["kinds"], json!([1]));

        let close = ClientMessage::Close {
            subscription_id: "sub-1",
        }
        .to_json()
        .unwrap();
        assert_eq!(close, r#"["CLOSE","sub-1"]"#);

        let event = JsonEvent::from_json(EVENT_JSON).unwrap();
        let publish = ClientMessage::Event { event: &event }.to_json().unwrap();
        let value: Value = serde_json::from_str(&publish).unwrap();
        assert_eq!(value[0], "EVENT");
        assert_eq!(value[1]["id"], "e1");
    }
}
