//! MIDI byte-stream framing and message classification.
//!
//! `parse_one` handles the common case: a single already-framed message as
//! delivered by a `midir` input callback. `parse_stream` additionally
//! implements the general framing rules so the SysEx programming driver can
//! split a composed byte buffer (built from templates) into discrete
//! messages before sending them one at a time under ACK flow control.

use crate::error::BridgeError;

#[derive(Debug, Clone, PartialEq)]
pub enum MidiEvent {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8, velocity: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    /// A complete SysEx message, `0xF0 ..= 0xF7` inclusive.
    SysEx(Vec<u8>),
    /// Any other channel or system message, passed through unchanged.
    Other(Vec<u8>),
}

impl MidiEvent {
    /// Parses a single already-framed message, as delivered whole by a
    /// `midir` callback.
    pub fn parse_one(bytes: &[u8]) -> Result<MidiEvent, BridgeError> {
        let status = *bytes.first().ok_or(BridgeError::InvalidMidiByte(0))?;
        if status == 0xF0 {
            return Ok(MidiEvent::SysEx(bytes.to_vec()));
        }
        if (0x80..=0xEF).contains(&status) {
            return Ok(Self::from_channel_bytes(bytes));
        }
        if system_message_len(status).is_some() {
            return Ok(MidiEvent::Other(bytes.to_vec()));
        }
        Err(BridgeError::InvalidMidiByte(status))
    }

    fn from_channel_bytes(bytes: &[u8]) -> MidiEvent {
        let status = bytes[0];
        let channel = status & 0x0F;
        match status & 0xF0 {
            0x80 => MidiEvent::NoteOff {
                channel,
                note: bytes.get(1).copied().unwrap_or(0),
                velocity: bytes.get(2).copied().unwrap_or(0),
            },
            0x90 => MidiEvent::NoteOn {
                channel,
                note: bytes.get(1).copied().unwrap_or(0),
                velocity: bytes.get(2).copied().unwrap_or(0),
            },
            0xB0 => MidiEvent::ControlChange {
                channel,
                controller: bytes.get(1).copied().unwrap_or(0),
                value: bytes.get(2).copied().unwrap_or(0),
            },
            _ => MidiEvent::Other(bytes.to_vec()),
        }
    }

    /// Serializes back to raw MIDI bytes, preserving status/channel bits.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            MidiEvent::NoteOn { channel, note, velocity } => {
                vec![0x90 | (channel & 0x0F), *note, *velocity]
            }
            MidiEvent::NoteOff { channel, note, velocity } => {
                vec![0x80 | (channel & 0x0F), *note, *velocity]
            }
            MidiEvent::ControlChange { channel, controller, value } => {
                vec![0xB0 | (channel & 0x0F), *controller, *value]
            }
            MidiEvent::SysEx(bytes) | MidiEvent::Other(bytes) => bytes.clone(),
        }
    }

    /// Treats Note-On with velocity 0 the way the remap engine must: as a
    /// release, not a sounding note.
    pub fn is_effective_note_off(&self) -> bool {
        matches!(self, MidiEvent::NoteOff { .. })
            || matches!(self, MidiEvent::NoteOn { velocity: 0, .. })
    }
}

/// Length, in bytes, of a channel-voice message given its status byte.
/// Program Change and Channel Pressure are 2 bytes; everything else in the
/// channel-message range is 3.
fn channel_message_len(status: u8) -> usize {
    match status & 0xF0 {
        0xC0 | 0xD0 => 2,
        _ => 3,
    }
}

/// Length of a system common/realtime message, or `None` if `status` isn't
/// one (including `0xF0`/`0xF7`, handled separately as SysEx framing).
fn system_message_len(status: u8) -> Option<usize> {
    match status {
        0xF1 | 0xF3 => Some(2),
        0xF2 => Some(3),
        0xF4..=0xF6 => Some(1),
        0xF8..=0xFF => Some(1),
        _ => None,
    }
}

/// Splits a concatenated byte buffer into discrete framed messages.
/// Unknown status bytes are skipped with a warning, as are truncated
/// trailing messages (not enough bytes remain to complete the frame).
pub fn parse_stream(bytes: &[u8]) -> Vec<MidiEvent> {
    let mut events = Vec::new();
    let mut idx = 0;
    while idx < bytes.len() {
        let status = bytes[idx];
        if status == 0xF0 {
            match bytes[idx..].iter().position(|&b| b == 0xF7) {
                Some(rel_end) => {
                    let end = idx + rel_end;
                    events.push(MidiEvent::SysEx(bytes[idx..=end].to_vec()));
                    idx = end + 1;
                }
                None => {
                    log::warn!("unterminated SysEx message, discarding remainder");
                    break;
                }
            }
        } else if (0x80..=0xEF).contains(&status) {
            let len = channel_message_len(status);
            if idx + len > bytes.len() {
                log::warn!("truncated channel message at byte {}", idx);
                break;
            }
            events.push(MidiEvent::from_channel_bytes(&bytes[idx..idx + len]));
            idx += len;
        } else if let Some(len) = system_message_len(status) {
            if idx + len > bytes.len() {
                log::warn!("truncated system message at byte {}", idx);
                break;
            }
            events.push(MidiEvent::Other(bytes[idx..idx + len].to_vec()));
            idx += len;
        } else {
            log::warn!("skipping invalid MIDI status byte {:#04x}", status);
            idx += 1;
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_note_on() {
        let event = MidiEvent::parse_one(&[0x93, 35, 100]).unwrap();
        assert_eq!(
            event,
            MidiEvent::NoteOn { channel: 3, note: 35, velocity: 100 }
        );
    }

    #[test]
    fn note_on_velocity_zero_is_effective_note_off() {
        let event = MidiEvent::NoteOn { channel: 0, note: 10, velocity: 0 };
        assert!(event.is_effective_note_off());
    }

    #[test]
    fn roundtrip_stream_byte_identical() {
        let mut input = Vec::new();
        input.extend_from_slice(&[0x90, 60, 100]); // note on
        input.extend_from_slice(&[0x80, 60, 0]); // note off
        input.extend_from_slice(&[0xB0, 1, 64]); // CC
        input.extend_from_slice(&[0xF0, 0x7E, 0x00, 0xF7]); // sysex
        input.extend_from_slice(&[0xC2, 5]); // program change

        let events = parse_stream(&input);
        let output: Vec<u8> = events.iter().flat_map(|e| e.to_bytes()).collect();
        assert_eq!(output, input);
    }

    #[test]
    fn skips_stray_data_byte() {
        // 0x45 is a data byte (< 0x80), invalid wherever a status byte is
        // expected; the framer should skip it and resynchronize.
        let input = [0x90, 60, 100, 0x45, 0x80, 60, 0];
        let events = parse_stream(&input);
        assert_eq!(
            events,
            vec![
                MidiEvent::NoteOn { channel: 0, note: 60, velocity: 100 },
                MidiEvent::NoteOff { channel: 0, note: 60, velocity: 0 },
            ]
        );
    }

    #[test]
    fn unterminated_sysex_is_discarded() {
        let input = [0x90, 60, 100, 0xF0, 0x7E, 0x00];
        let events = parse_stream(&input);
        assert_eq!(events.len(), 1);
    }
}
