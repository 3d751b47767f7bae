use serde::{Deserialize, Serialize};

pub const NOTE_ON: u8 = 0x90;
pub const NOTE_OFF: u8 = 0x80;
pub const CONTROL_CHANGE: u8 = 0xB0;
pub const PROGRAM_CHANGE: u8 = 0xC0;
pub const SYSEX_START: u8 = 0xF0;

/// Middle C at velocity 100 and its release.
pub const TEST_NOTE_ON: [u8; 3] = [NOTE_ON, 60, 100];
pub const TEST_NOTE_OFF: [u8; 3] = [NOTE_OFF, 60, 0];

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Scientific pitch name, with note 60 as `C4`.
pub fn note_name(note: u8) -> String {
    let octave = i32::from(note / 12) - 1;
    format!("{}{}", NOTE_NAMES[usize::from(note % 12)], octave)
}

/// Short spoken description of a channel message, or `None` for anything
/// not worth announcing.
pub fn describe(data: &[u8]) -> Option<String> {
    let status = data.first()? & 0xF0;
    match (status, data.get(1), data.get(2)) {
        (NOTE_ON, Some(&note), Some(&velocity)) if velocity > 0 => {
            Some(format!("{} on", note_name(note)))
        }
        (NOTE_ON, Some(&note), Some(_)) | (NOTE_OFF, Some(&note), _) => {
            Some(format!("{} off", note_name(note)))
        }
        (CONTROL_CHANGE, Some(&controller), _) => Some(format!("CC {controller}")),
        (PROGRAM_CHANGE, Some(&program), _) => Some(format!("Program {program}")),
        _ => None,
    }
}

pub fn to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MidiFilter {
    pub sysex_enabled: bool,
}

impl MidiFilter {
    pub fn allows(&self, data: &[u8]) -> bool {
        match data.first() {
            Some(&SYSEX_START) => self.sysex_enabled,
            Some(_) => true,
            None => false,
        }
    }
}

/// Payload of a `settings_sync` message. Absent keys leave the receiver's
/// setting untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sysex_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub midi_echo_enabled: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn names_notes_across_octaves() {
        assert_eq!(note_name(60), "C4");
        assert_eq!(note_name(61), "C#4");
        assert_eq!(note_name(0), "C-1");
        assert_eq!(note_name(127), "G9");
    }

    #[test_timeout::timeout]
    fn describes_channel_messages() {
        assert_eq!(describe(&TEST_NOTE_ON).as_deref(), Some("C4 on"));
        assert_eq!(describe(&TEST_NOTE_OFF).as_deref(), Some("C4 off"));
        assert_eq!(describe(&[0x91, 64, 0]).as_deref(), Some("E4 off"));
        assert_eq!(describe(&[0xB0, 7, 100]).as_deref(), Some("CC 7"));
        assert_eq!(describe(&[0xC3, 5]).as_deref(), Some("Program 5"));
        assert_eq!(describe(&[0xF8]), None);
        assert_eq!(describe(&[]), None);
    }

    #[test_timeout::timeout]
    fn filter_drops_sysex_unless_enabled() {
        let sysex = [SYSEX_START, 0x7E, 0x7F, 0xF7];
        assert!(!MidiFilter::default().allows(&sysex));
        assert!(MidiFilter { sysex_enabled: true }.allows(&sysex));
        assert!(MidiFilter::default().allows(&TEST_NOTE_ON));
    }

    #[test_timeout::timeout]
    fn settings_ignore_unknown_keys() {
        let settings: SharedSettings =
            serde_json::from_str(r#"{"sysexEnabled":true,"theme":"dark"}"#).unwrap();
        assert_eq!(settings.sysex_enabled, Some(true));
        assert_eq!(settings.midi_echo_enabled, None);
    }
}
