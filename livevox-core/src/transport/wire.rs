//! JSON messages exchanged with the live model endpoint.
//!
//! Outbound:
//! ```text
//! {"setup": {"model": "models/…", "generationConfig": {...}, "systemInstruction": {...}}}
//! {"realtimeInput": {"media": {"data": "<b64 pcm16>", "mimeType": "audio/pcm;rate=16000"}}}
//! ```
//! Inbound messages are parsed leniently: every field is optional and unknown
//! fields are ignored.

use serde::{Deserialize, Serialize};

use crate::codec::TransportFrame;
use crate::error::{LiveVoxError, Result};

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

impl SetupMessage {
    /// Audio-only setup for `model` speaking with the prebuilt `voice`.
    pub fn new(model: &str, voice: &str, system_instruction: Option<&str>) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        };
        Self {
            setup: Setup {
                model,
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: voice.to_string(),
                            },
                        },
                    },
                },
                system_instruction: system_instruction
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|text| Content {
                        parts: vec![TextPart {
                            text: text.to_string(),
                        }],
                    }),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeInput {
    pub media: TransportFrame,
}

impl From<TransportFrame> for RealtimeInputMessage {
    fn from(media: TransportFrame) -> Self {
        Self {
            realtime_input: RealtimeInput { media },
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub error: Option<ServerError>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub interrupted: bool,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelTurn {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Part {
    pub inline_data: Option<InlineData>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InlineData {
    pub data: String,
    pub mime_type: Option<String>,
}

impl InlineData {
    /// The `rate=` parameter of the MIME type, if present.
    pub fn sample_rate(&self) -> Option<u32> {
        self.mime_type
            .as_deref()?
            .split(';')
            .filter_map(|p| p.trim().strip_prefix("rate="))
            .find_map(|r| r.trim().parse().ok())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerError {
    pub code: Option<i64>,
    pub message: String,
}

impl ServerMessage {
    /// Parse one message from a text or binary frame payload.
    ///
    /// # Errors
    /// `LiveVoxError::TransportDecode` if the payload is not a JSON object.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| LiveVoxError::TransportDecode(format!("server message: {e}")))
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Audio of the first model-turn part, if it carries inline data.
    pub fn audio(&self) -> Option<&InlineData> {
        self.server_content
            .as_ref()?
            .model_turn
            .as_ref()?
            .parts
            .first()?
            .inline_data
            .as_ref()
    }

    pub fn is_interrupted(&self) -> bool {
        self.server_content.as_ref().is_some_and(|c| c.interrupted)
    }

    pub fn is_turn_complete(&self) -> bool {
        self.server_content.as_ref().is_some_and(|c| c.turn_complete)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn realtime_input_shape() {
        let msg = RealtimeInputMessage::from(TransportFrame {
            data: "AAA=".into(),
            mime_type: "audio/pcm;rate=16000".into(),
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"realtimeInput": {"media": {"data": "AAA=", "mimeType": "audio/pcm;rate=16000"}}})
        );
    }

    #[test]
    fn setup_shape_with_instruction() {
        let msg = SetupMessage::new("gemini-live", "Zephyr", Some("Be brief."));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["setup"]["model"], "models/gemini-live");
        assert_eq!(
            value["setup"]["generationConfig"]["responseModalities"],
            json!(["AUDIO"])
        );
        assert_eq!(
            value["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Zephyr"
        );
        assert_eq!(
            value["setup"]["systemInstruction"]["parts"][0]["text"],
            "Be brief."
        );
    }

    #[test]
    fn blank_instruction_is_omitted() {
        let msg = SetupMessage::new("models/x", "Zephyr", Some("   "));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["setup"]["model"], "models/x");
        assert!(value["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn parses_audio_and_interrupt() {
        let raw = br#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAA="}}]},"interrupted":true}}"#;
        let msg = ServerMessage::parse(raw).unwrap();
        let audio = msg.audio().unwrap();
        assert_eq!(audio.data, "AAA=");
        assert_eq!(audio.sample_rate(), Some(24_000));
        assert!(msg.is_interrupted());
        assert!(!msg.is_turn_complete());
    }

    #[test]
    fn parses_setup_complete_and_unknown_fields() {
        let msg = ServerMessage::parse(br#"{"setupComplete":{},"usageMetadata":{"x":1}}"#).unwrap();
        assert!(msg.is_setup_complete());
        assert!(msg.audio().is_none());
    }

    #[test]
    fn text_only_part_has_no_audio() {
        let raw = br#"{"serverContent":{"modelTurn":{"parts":[{"text":"hi"}]},"turnComplete":true}}"#;
        let msg = ServerMessage::parse(raw).unwrap();
        assert!(msg.audio().is_none());
        assert!(msg.is_turn_complete());
    }

    #[test]
    fn rejects_non_json() {
        assert!(matches!(
            ServerMessage::parse(b"not json"),
            Err(LiveVoxError::TransportDecode(_))
        ));
    }

    #[test]
    fn mime_without_rate() {
        let data = InlineData {
            data: String::new(),
            mime_type: Some("audio/pcm".into()),
        };
        assert_eq!(data.sample_rate(), None);
    }
}
