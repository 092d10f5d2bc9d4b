//! Realtime socket events
//!
//! JSON events exchanged with an OpenAI-style realtime audio session,
//! tagged by their `type` field. Only the events the relay acts on are
//! modelled; everything else decodes to `ServerEvent::Other`.

use crate::agent::EncodedAudio;
use crate::error::BridgeError;
use serde::{Deserialize, Serialize};

/// Event sent to the backend
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Configure the session
    #[serde(rename = "session.update")]
    SessionUpdate {
        /// Session settings
        session: SessionSettings,
    },
    /// Ask the model to produce a response now
    #[serde(rename = "response.create")]
    ResponseCreate,
    /// Append captured user audio to the input buffer
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend {
        /// Encoded audio frame, verbatim
        audio: EncodedAudio,
    },
}

impl ClientEvent {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::ResponseCreate => "response.create",
            ClientEvent::InputAudioAppend { .. } => "input_audio_buffer.append",
        }
    }
}

/// Settings carried by `session.update`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSettings {
    /// System instructions for the voice model
    pub instructions: String,
}

/// Event received from the backend
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// The session is ready
    #[serde(rename = "session.created")]
    SessionCreated,
    /// The model started a response
    #[serde(rename = "response.created")]
    ResponseCreated,
    /// A chunk of response audio
    #[serde(rename = "response.audio.delta", alias = "response.output_audio.delta")]
    AudioDelta {
        /// Encoded audio chunk
        delta: EncodedAudio,
    },
    /// The response audio is complete
    #[serde(rename = "response.audio.done", alias = "response.output_audio.done")]
    AudioDone,
    /// The backend reported an error
    #[serde(rename = "error")]
    Error {
        /// Error details as sent
        #[serde(default)]
        error: serde_json::Value,
    },
    /// Any other event
    #[serde(other)]
    Other,
}

impl ServerEvent {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::SessionCreated => "session.created",
            ServerEvent::ResponseCreated => "response.created",
            ServerEvent::AudioDelta { .. } => "response.audio.delta",
            ServerEvent::AudioDone => "response.audio.done",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Other => "other",
        }
    }
}

/// Decode one text frame
///
/// # Errors
/// * `BridgeError::Protocol` - If the frame is not a typed JSON event
pub fn decode_server_event(text: &str) -> Result<ServerEvent, BridgeError> {
    serde_json::from_str(text).map_err(|e| {
        let preview: String = text.chars().take(120).collect();
        BridgeError::Protocol(format!("undecodable realtime event ({}): {}", e, preview))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_events_serialize() {
        let update = ClientEvent::SessionUpdate {
            session: SessionSettings {
                instructions: "Be nice.".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            json!({"type": "session.update", "session": {"instructions": "Be nice."}})
        );
        assert_eq!(
            serde_json::to_value(&ClientEvent::ResponseCreate).unwrap(),
            json!({"type": "response.create"})
        );
        assert_eq!(
            serde_json::to_value(&ClientEvent::InputAudioAppend {
                audio: EncodedAudio::new("AAEC")
            })
            .unwrap(),
            json!({"type": "input_audio_buffer.append", "audio": "AAEC"})
        );
    }

    #[test]
    fn test_server_events_decode() {
        assert_eq!(
            decode_server_event(r#"{"type":"session.created","event_id":"e1","session":{}}"#)
                .unwrap(),
            ServerEvent::SessionCreated
        );
        assert_eq!(
            decode_server_event(r#"{"type":"response.audio.delta","delta":"UklG","item_id":"i"}"#)
                .unwrap(),
            ServerEvent::AudioDelta {
                delta: EncodedAudio::new("UklG")
            }
        );
        assert_eq!(
            decode_server_event(r#"{"type":"response.output_audio.done"}"#).unwrap(),
            ServerEvent::AudioDone
        );
        assert_eq!(
            decode_server_event(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap(),
            ServerEvent::Other
        );
        match decode_server_event(r#"{"type":"error","error":{"message":"bad"}}"#).unwrap() {
            ServerEvent::Error { error } => assert_eq!(error["message"], "bad"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_undecodable_frame_is_protocol_error() {
        assert!(matches!(
            decode_server_event("not json"),
            Err(BridgeError::Protocol(_))
        ));
        assert!(matches!(
            decode_server_event(r#"{"delta":"no type"}"#),
            Err(BridgeError::Protocol(_))
        ));
    }
}
