//! Wire protocol
//!
//! Typed envelopes carried as opaque plaintext inside ratchet frames,
//! with a deterministic length-delimited encoding. Unknown envelope tags
//! fail the decode; every envelope is cryptographically meaningful, so
//! nothing is skipped silently.

mod actions;
mod codec;
mod types;

pub use actions::*;
pub use types::{
    Algorithm, CryptoHandle, HandleKind, KeyDescriptor, KeyFormat, KeyUsage, ProviderCryptoInfo,
};

use thiserror::Error;

use codec::{Reader, Writer};

/// Protocol decode/encode errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// Frame ended before the structure was complete
    #[error("Frame truncated")]
    Truncated,

    /// Frame carried bytes past the end of the structure
    #[error("Frame has {0} trailing bytes")]
    Trailing(usize),

    /// An enum byte or string field held an unexpected value
    #[error("Invalid wire value: {0}")]
    InvalidValue(String),

    /// The envelope type tag is not part of the protocol
    #[error("Unknown envelope tag {0:#x}")]
    UnknownTag(u8),
}

/// Result type for protocol operations
pub type ProtoResult<T> = Result<T, ProtoError>;

const TAG_ACTION: u8 = 0x01;
const TAG_RESULT: u8 = 0x02;
const TAG_EVENT: u8 = 0x03;

/// A request: what to do, a correlation id, and an opaque payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionEnvelope {
    /// Stable action tag (see [`tags`])
    pub action: String,
    /// Correlation key, unique per client connection
    pub action_id: String,
    /// Action-specific payload
    pub payload: Vec<u8>,
}

/// The reply to one action: correlated by id, exactly data or error
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultEnvelope {
    /// Correlation key copied from the action
    pub action_id: String,
    /// Action tag copied from the action
    pub action: String,
    /// Result bytes or in-band error message
    pub outcome: Outcome,
}

/// Exactly one of data or error
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Successful result payload
    Data(Vec<u8>),
    /// In-band error message
    Error(String),
}

/// An unsolicited server-to-client notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Event name (see [`events`])
    pub event: String,
    /// Event-specific payload
    pub payload: Vec<u8>,
}

/// Everything that can ride inside one ratchet frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Envelope {
    /// Client request
    Action(ActionEnvelope),
    /// Server reply
    Result(ResultEnvelope),
    /// Unsolicited server event
    Event(EventEnvelope),
}

impl Envelope {
    /// Serialize to frame plaintext
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Envelope::Action(action) => {
                let mut w = Writer::new(TAG_ACTION);
                w.put_str(&action.action);
                w.put_str(&action.action_id);
                w.put_bytes(&action.payload);
                w.into_bytes()
            }
            Envelope::Result(result) => {
                let mut w = Writer::new(TAG_RESULT);
                w.put_str(&result.action_id);
                w.put_str(&result.action);
                match &result.outcome {
                    Outcome::Data(data) => {
                        w.put_u8(0);
                        w.put_bytes(data);
                    }
                    Outcome::Error(message) => {
                        w.put_u8(1);
                        w.put_str(message);
                    }
                }
                w.into_bytes()
            }
            Envelope::Event(event) => {
                let mut w = Writer::new(TAG_EVENT);
                w.put_str(&event.event);
                w.put_bytes(&event.payload);
                w.into_bytes()
            }
        }
    }

    /// Parse from frame plaintext
    pub fn from_bytes(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let envelope = match r.take_u8()? {
            TAG_ACTION => Envelope::Action(ActionEnvelope {
                action: r.take_str()?,
                action_id: r.take_str()?,
                payload: r.take_bytes()?,
            }),
            TAG_RESULT => {
                let action_id = r.take_str()?;
                let action = r.take_str()?;
                let outcome = match r.take_u8()? {
                    0 => Outcome::Data(r.take_bytes()?),
                    1 => Outcome::Error(r.take_str()?),
                    other => {
                        return Err(ProtoError::InvalidValue(format!(
                            "outcome byte {:#x}",
                            other
                        )))
                    }
                };
                Envelope::Result(ResultEnvelope {
                    action_id,
                    action,
                    outcome,
                })
            }
            TAG_EVENT => Envelope::Event(EventEnvelope {
                event: r.take_str()?,
                payload: r.take_bytes()?,
            }),
            other => return Err(ProtoError::UnknownTag(other)),
        };
        r.finish()?;
        Ok(envelope)
    }
}

/// Unsolicited event names
pub mod events {
    /// Session promoted after a successful login
    pub const AUTHORIZED: &str = "authorized";
    /// Provider hotplug notification
    pub const TOKEN: &str = "token";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_round_trip() {
        let envelope = Envelope::Action(ActionEnvelope {
            action: "Digest".to_string(),
            action_id: "17".to_string(),
            payload: vec![1, 2, 3, 4],
        });

        let restored = Envelope::from_bytes(&envelope.to_bytes()).unwrap();
        assert_eq!(restored, envelope);
    }

    #[test]
    fn test_result_data_round_trip() {
        let envelope = Envelope::Result(ResultEnvelope {
            action_id: "17".to_string(),
            action: "Digest".to_string(),
            outcome: Outcome::Data(vec![9; 32]),
        });

        let restored = Envelope::from_bytes(&envelope.to_bytes()).unwrap();
        assert_eq!(restored, envelope);
    }

    #[test]
    fn test_result_error_round_trip() {
        let envelope = Envelope::Result(ResultEnvelope {
            action_id: "3".to_string(),
            action: "Nope".to_string(),
            outcome: Outcome::Error("Unknown action 'Nope'".to_string()),
        });

        let restored = Envelope::from_bytes(&envelope.to_bytes()).unwrap();
        assert_eq!(restored, envelope);
    }

    #[test]
    fn test_event_round_trip() {
        let envelope = Envelope::Event(EventEnvelope {
            event: events::AUTHORIZED.to_string(),
            payload: Vec::new(),
        });

        let restored = Envelope::from_bytes(&envelope.to_bytes()).unwrap();
        assert_eq!(restored, envelope);
    }

    #[test]
    fn test_unknown_tag_fails() {
        let err = Envelope::from_bytes(&[0x7F, 0, 0]).unwrap_err();
        assert_eq!(err, ProtoError::UnknownTag(0x7F));
    }

    #[test]
    fn test_empty_frame_fails() {
        assert_eq!(Envelope::from_bytes(&[]), Err(ProtoError::Truncated));
    }

    #[test]
    fn test_trailing_bytes_fail() {
        let envelope = Envelope::Event(EventEnvelope {
            event: "authorized".to_string(),
            payload: Vec::new(),
        });
        let mut bytes = envelope.to_bytes();
        bytes.push(0);

        assert!(matches!(
            Envelope::from_bytes(&bytes),
            Err(ProtoError::Trailing(1))
        ));
    }
}
