//! Wire types for the BidiGenerateContent live protocol.
//!
//! Only the subset the conversation pipeline speaks is modeled: session setup,
//! realtime audio input, client content turns, and the server messages that
//! carry audio fragments and lifecycle signals.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    System,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    Text,
    Audio,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_config: Option<VoiceConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_modalities: Option<Vec<ResponseModality>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentClientContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turns: Option<Vec<Content>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_complete: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentRealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Messages the client sends over the socket. Serializes externally tagged,
/// e.g. `{"realtimeInput": {...}}`.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessagePayload {
    Setup(BidiGenerateContentSetup),
    ClientContent(BidiGenerateContentClientContent),
    RealtimeInput(BidiGenerateContentRealtimeInput),
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub generation_complete: bool,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SetupComplete {}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerError {
    #[serde(default)]
    pub message: Option<String>,
}

/// A message received from the server. Fields are independent; a single
/// message may carry several of them.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<SetupComplete>,
    #[serde(default)]
    pub server_content: Option<BidiGenerateContentServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
    #[serde(default)]
    pub usage_metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<ServerError>,
}

impl ServerMessage {
    /// Inline audio blobs carried by the model turn, in part order.
    pub fn audio_blobs(&self) -> impl Iterator<Item = &Blob> {
        self.server_content
            .iter()
            .filter_map(|content| content.model_turn.as_ref())
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.inline_data.as_ref())
            .filter(|blob| blob.mime_type.starts_with("audio/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_input_serializes_camel_case_and_tagged() {
        let payload = ClientMessagePayload::RealtimeInput(BidiGenerateContentRealtimeInput {
            audio: Some(Blob {
                mime_type: "audio/pcm;rate=16000".to_string(),
                data: "AAA=".to_string(),
            }),
            ..Default::default()
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "realtimeInput": {"audio": {"mimeType": "audio/pcm;rate=16000", "data": "AAA="}}
            })
        );
    }

    #[test]
    fn setup_requests_audio_modality() {
        let payload = ClientMessagePayload::Setup(BidiGenerateContentSetup {
            model: "models/test".to_string(),
            generation_config: Some(GenerationConfig {
                response_modalities: Some(vec![ResponseModality::Audio]),
                ..Default::default()
            }),
            system_instruction: None,
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["setup"]["model"], "models/test");
        assert_eq!(
            json["setup"]["generationConfig"]["responseModalities"],
            serde_json::json!(["AUDIO"])
        );
        assert!(json["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn client_content_turn_has_user_role() {
        let payload = ClientMessagePayload::ClientContent(BidiGenerateContentClientContent {
            turns: Some(vec![Content {
                parts: vec![Part {
                    text: Some("hello".to_string()),
                    ..Default::default()
                }],
                role: Some(Role::User),
            }]),
            turn_complete: Some(true),
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["clientContent"]["turns"][0]["role"], "user");
        assert_eq!(json["clientContent"]["turns"][0]["parts"][0]["text"], "hello");
        assert_eq!(json["clientContent"]["turnComplete"], true);
    }

    #[test]
    fn server_message_exposes_audio_blobs_in_order() {
        let raw = r#"{
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AQA="}},
                    {"text": "hi"},
                    {"inlineData": {"mimeType": "image/png", "data": "xx"}},
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AgA="}}
                ]},
                "turnComplete": true
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        let data: Vec<&str> = msg.audio_blobs().map(|b| b.data.as_str()).collect();
        assert_eq!(data, vec!["AQA=", "AgA="]);
        assert!(msg.server_content.as_ref().unwrap().turn_complete);
    }

    #[test]
    fn setup_complete_and_go_away_parse() {
        let msg: ServerMessage = serde_json::from_str(r#"{"setupComplete": {}}"#).unwrap();
        assert!(msg.setup_complete.is_some());
        let msg: ServerMessage =
            serde_json::from_str(r#"{"goAway": {"timeLeft": "10s"}}"#).unwrap();
        assert_eq!(msg.go_away.unwrap().time_left.as_deref(), Some("10s"));
    }
}
