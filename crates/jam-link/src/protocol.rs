//! JSON frames carried on the data channel, one object per message.
//!
//! Control frames carry a `type` discriminator. MIDI events are the bare
//! `{data, timestamp?}` shape, and anything whose `type` is missing or
//! unknown is read as a MIDI event.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::LinkError;
use crate::midi::SharedSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiEvent {
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl MidiEvent {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            timestamp: None,
        }
    }
}

/// Body of a ping or pong. Fields that are absent or not numbers decode as
/// `None` so the latency estimator can reject the frame itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    #[serde(
        default,
        deserialize_with = "lenient_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub ping_id: Option<u32>,
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(Value::deserialize(deserializer)?.as_f64())
}

fn lenient_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    Ok(Value::deserialize(deserializer)?
        .as_u64()
        .and_then(|id| u32::try_from(id).ok()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppMessage {
    Midi(MidiEvent),
    Ping(Probe),
    Pong(Probe),
    TestNote(Vec<u8>),
    SettingsSync(SharedSettings),
    Chat(String),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlFrame {
    Ping(Probe),
    Pong(Probe),
    TestNote { data: Vec<u8> },
    SettingsSync { data: SharedSettings },
    Chat { data: String },
}

const CONTROL_TYPES: &[&str] = &["ping", "pong", "test_note", "settings_sync", "chat"];

pub fn encode(message: &AppMessage) -> Result<String, LinkError> {
    let frame = match message {
        AppMessage::Midi(event) => return Ok(serde_json::to_string(event)?),
        AppMessage::Ping(probe) => ControlFrame::Ping(*probe),
        AppMessage::Pong(probe) => ControlFrame::Pong(*probe),
        AppMessage::TestNote(data) => ControlFrame::TestNote { data: data.clone() },
        AppMessage::SettingsSync(settings) => ControlFrame::SettingsSync {
            data: settings.clone(),
        },
        AppMessage::Chat(text) => ControlFrame::Chat { data: text.clone() },
    };
    Ok(serde_json::to_string(&frame)?)
}

pub fn decode(text: &str) -> Result<AppMessage, LinkError> {
    let value: Value = serde_json::from_str(text)?;
    let is_control = value
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|kind| CONTROL_TYPES.contains(&kind));
    if !is_control {
        return Ok(AppMessage::Midi(serde_json::from_value(value)?));
    }
    Ok(match serde_json::from_value::<ControlFrame>(value)? {
        ControlFrame::Ping(probe) => AppMessage::Ping(probe),
        ControlFrame::Pong(probe) => AppMessage::Pong(probe),
        ControlFrame::TestNote { data } => AppMessage::TestNote(data),
        ControlFrame::SettingsSync { data } => AppMessage::SettingsSync(data),
        ControlFrame::Chat { data } => AppMessage::Chat(data),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn midi_events_have_no_type_field() {
        let text = encode(&AppMessage::Midi(MidiEvent::new([0x90, 60, 100]))).unwrap();
        assert_eq!(text, r#"{"data":[144,60,100]}"#);
    }

    #[test_timeout::timeout]
    fn control_frames_are_tagged() {
        let ping = AppMessage::Ping(Probe {
            timestamp: Some(12.5),
            ping_id: Some(3),
        });
        let value: Value = serde_json::from_str(&encode(&ping).unwrap()).unwrap();
        assert_eq!(value, json!({"type": "ping", "timestamp": 12.5, "pingId": 3}));

        let chat: Value =
            serde_json::from_str(&encode(&AppMessage::Chat("hi".into())).unwrap()).unwrap();
        assert_eq!(chat, json!({"type": "chat", "data": "hi"}));
    }

    #[test_timeout::timeout]
    fn unknown_type_falls_back_to_midi() {
        let decoded = decode(r#"{"type":"aftertouch","data":[160,60,20],"timestamp":4.0}"#).unwrap();
        assert_eq!(
            decoded,
            AppMessage::Midi(MidiEvent {
                data: vec![160, 60, 20],
                timestamp: Some(4.0),
            })
        );
    }

    #[test_timeout::timeout]
    fn pong_with_bad_fields_still_decodes() {
        let decoded = decode(r#"{"type":"pong","timestamp":"soon"}"#).unwrap();
        assert_eq!(decoded, AppMessage::Pong(Probe::default()));
    }

    #[test_timeout::timeout]
    fn garbage_is_malformed() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"hello":1}"#).is_err());
        assert!(decode(r#"{"data":[300]}"#).is_err());
    }

    #[test_timeout::timeout]
    fn settings_sync_decodes_partial_settings() {
        let decoded = decode(r#"{"type":"settings_sync","data":{"midiEchoEnabled":true}}"#).unwrap();
        assert_eq!(
            decoded,
            AppMessage::SettingsSync(SharedSettings {
                midi_echo_enabled: Some(true),
                ..SharedSettings::default()
            })
        );
    }
}
