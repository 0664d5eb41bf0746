//! SysEx programming templates and the ACK-gated programming driver (C5).
//!
//! Controller descriptors express per-pad note/channel/color programming as
//! byte-level templates: a sequence of tokens that are either a literal byte
//! (or run of bytes, e.g. a 3-byte manufacturer ID) or a named placeholder
//! (`NOTE`, `CHANNEL`, `COLOR`, `STATUS`, ...) bound at send time. Devices
//! that require a status response before the next message is sent (the
//! Lumatone-style ACK protocol) additionally carry a response template and
//! an action table keyed by the response's status byte.

use crate::config::{AckAction, AckConfig, SysexTemplates};
use crate::error::BridgeError;
use crate::generation::Generation;
use crate::midi::event::MidiEvent;
use midir::MidiOutputConnection;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MAX_BUSY_RETRIES: u32 = 10;
const DEFAULT_STATUS_POSITION: usize = 5;

/// A single element of a parsed byte template.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// One or more literal bytes, e.g. a manufacturer ID contributes a
    /// 3-byte run to the template's total width.
    Literal(Vec<u8>),
    /// A named slot bound at render time (`NOTE`, `CHANNEL`, `COLOR`, ...).
    Placeholder(String),
}

/// Parses a template's token strings. A token is a literal if it looks like
/// one or more whitespace-separated hex bytes (`"0xF0"`, `"0x00 0x20 0x29"`);
/// anything else is a named placeholder.
pub fn parse_template(tokens: &[String]) -> Result<Vec<Token>, String> {
    tokens.iter().map(|t| parse_token(t)).collect()
}

fn parse_token(raw: &str) -> Result<Token, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty template token".to_string());
    }
    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    let looks_hex = parts
        .iter()
        .all(|p| p.len() > 2 && p[..2].eq_ignore_ascii_case("0x"));
    if looks_hex {
        let bytes = parts
            .iter()
            .map(|p| {
                u8::from_str_radix(&p[2..], 16).map_err(|e| format!("bad hex byte {p:?}: {e}"))
            })
            .collect::<Result<Vec<u8>, String>>()?;
        Ok(Token::Literal(bytes))
    } else {
        Ok(Token::Placeholder(trimmed.to_string()))
    }
}

/// Renders a parsed template against a set of bound placeholder values.
pub fn render(tokens: &[Token], bindings: &HashMap<&str, u8>) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    for token in tokens {
        match token {
            Token::Literal(bytes) => out.extend_from_slice(bytes),
            Token::Placeholder(name) => {
                let value = bindings
                    .get(name.as_str())
                    .copied()
                    .ok_or_else(|| format!("unbound template placeholder {name:?}"))?;
                out.push(value);
            }
        }
    }
    Ok(out)
}

/// Scans a response template for the `STATUS` placeholder, counting the
/// widths of the tokens that precede it (literal runs contribute their byte
/// count, other placeholders contribute one byte). Returns `None` if the
/// template has no `STATUS` slot.
pub fn derive_status_position(tokens: &[Token]) -> Option<usize> {
    let mut idx = 0;
    for token in tokens {
        match token {
            Token::Literal(bytes) => idx += bytes.len(),
            Token::Placeholder(name) if name.eq_ignore_ascii_case("STATUS") => return Some(idx),
            Token::Placeholder(_) => idx += 1,
        }
    }
    None
}

/// ACK protocol parameters resolved from the descriptor's `ack_config` plus
/// whatever could be derived from its response templates.
#[derive(Debug, Clone)]
pub struct ResolvedAck {
    pub timeout_ms: u64,
    pub status_byte_position: usize,
    pub response_table: HashMap<u8, AckAction>,
}

/// A descriptor's SysEx programming templates, parsed and validated at
/// load time.
#[derive(Debug, Clone, Default)]
pub struct CompiledSysex {
    pub set_pad_note_and_channel: Option<Vec<Token>>,
    pub set_pad_note_and_channel_response: Option<Vec<Token>>,
    pub set_pad_color: Option<Vec<Token>>,
    pub set_pad_color_response: Option<Vec<Token>>,
    pub set_pad_notes_bulk: Option<Vec<Token>>,
    pub set_pad_colors_bulk: Option<Vec<Token>>,
    pub ack: Option<ResolvedAck>,
}

/// Parses and validates a descriptor's SysEx section. Returns `Ok(None)` if
/// the descriptor carries no SysEx templates at all.
pub fn compile_sysex(
    templates: Option<&SysexTemplates>,
    ack_config: Option<&AckConfig>,
) -> Result<Option<CompiledSysex>, String> {
    let Some(templates) = templates else {
        return Ok(None);
    };

    let parse_opt = |field: &Option<Vec<String>>| -> Result<Option<Vec<Token>>, String> {
        field.as_ref().map(|toks| parse_template(toks)).transpose()
    };

    let set_pad_note_and_channel = parse_opt(&templates.set_pad_note_and_channel)?;
    let set_pad_note_and_channel_response = parse_opt(&templates.set_pad_note_and_channel_response)?;
    let set_pad_color = parse_opt(&templates.set_pad_color)?;
    let set_pad_color_response = parse_opt(&templates.set_pad_color_response)?;
    let set_pad_notes_bulk = parse_opt(&templates.set_pad_notes_bulk)?;
    let set_pad_colors_bulk = parse_opt(&templates.set_pad_colors_bulk)?;

    let ack = ack_config.map(|cfg| {
        let derived = set_pad_note_and_channel_response
            .as_deref()
            .and_then(derive_status_position)
            .or_else(|| set_pad_color_response.as_deref().and_then(derive_status_position));
        let status_byte_position = cfg
            .response_position
            .or(derived)
            .unwrap_or(DEFAULT_STATUS_POSITION);
        let response_table = cfg.response_types.iter().map(|e| (e.value, e.action)).collect();
        ResolvedAck {
            timeout_ms: cfg.timeout_ms,
            status_byte_position,
            response_table,
        }
    });

    Ok(Some(CompiledSysex {
        set_pad_note_and_channel,
        set_pad_note_and_channel_response,
        set_pad_color,
        set_pad_color_response,
        set_pad_notes_bulk,
        set_pad_colors_bulk,
        ack,
    }))
}

/// Outcome of a completed (or abandoned) programming stream.
#[derive(Debug)]
pub enum StreamOutcome {
    /// Every message was sent; `retries` counts ACK `DELAY` retries absorbed
    /// along the way.
    Completed { retries: u32 },
    /// The generation counter advanced underneath the stream. Not an error.
    Cancelled,
    /// The ACK protocol failed outright (e.g. on the very first message)
    /// with no further messages attempted.
    Failed(BridgeError),
}

enum AckResult {
    Ok,
    Retried(u32),
    Cancelled,
    Failed(BridgeError),
}

/// Drives a device-programming byte stream to completion, honoring the
/// ACK protocol when the descriptor declares one, and the shared generation
/// counter for cancellation.
pub struct ProgrammingDriver {
    ack_rx: flume::Receiver<Vec<u8>>,
    ack_waiting: Arc<AtomicBool>,
}

impl ProgrammingDriver {
    pub fn new(ack_rx: flume::Receiver<Vec<u8>>, ack_waiting: Arc<AtomicBool>) -> Self {
        ProgrammingDriver { ack_rx, ack_waiting }
    }

    /// Sends `messages` in order under `stream_generation`. Checks
    /// `generation` before every send; a mismatch returns `Cancelled`
    /// immediately, within one inter-message interval as required.
    pub fn send_stream(
        &self,
        output: &Mutex<MidiOutputConnection>,
        messages: &[MidiEvent],
        ack: Option<&ResolvedAck>,
        inter_message_delay: Duration,
        generation: &Generation,
        stream_generation: u64,
    ) -> StreamOutcome {
        let mut total_retries = 0u32;
        let mut fallen_back = false;

        for (index, message) in messages.iter().enumerate() {
            if !generation.matches(stream_generation) {
                log::debug!("programming stream cancelled before message {index}");
                return StreamOutcome::Cancelled;
            }

            let is_sysex = matches!(message, MidiEvent::SysEx(_));
            if is_sysex && !fallen_back {
                if let Some(ack_cfg) = ack {
                    match self.send_with_ack(output, message, ack_cfg, generation, stream_generation, index) {
                        AckResult::Ok => {}
                        AckResult::Retried(n) => total_retries += n,
                        AckResult::Cancelled => return StreamOutcome::Cancelled,
                        AckResult::Failed(e) => {
                            log::warn!(
                                "ACK protocol failed on message {index} ({e}); falling back to \
                                 delay-based sending for the remainder of the stream"
                            );
                            fallen_back = true;
                            self.send_plain(output, message);
                        }
                    }
                    std::thread::sleep(inter_message_delay);
                    continue;
                }
            }

            self.send_plain(output, message);
            std::thread::sleep(inter_message_delay);
        }

        StreamOutcome::Completed { retries: total_retries }
    }

    fn send_plain(&self, output: &Mutex<MidiOutputConnection>, message: &MidiEvent) {
        let mut out = output.lock().unwrap();
        if let Err(e) = out.send(&message.to_bytes()) {
            log::warn!("failed to send programming message: {e}");
        }
    }

    fn send_with_ack(
        &self,
        output: &Mutex<MidiOutputConnection>,
        message: &MidiEvent,
        ack: &ResolvedAck,
        generation: &Generation,
        stream_generation: u64,
        index: usize,
    ) -> AckResult {
        let bytes = message.to_bytes();
        let mut retries = 0u32;

        loop {
            if !generation.matches(stream_generation) {
                return AckResult::Cancelled;
            }

            while self.ack_rx.try_recv().is_ok() {}
            self.ack_waiting.store(true, Ordering::SeqCst);

            let send_result = {
                let mut out = output.lock().unwrap();
                out.send(&bytes)
            };
            if let Err(e) = send_result {
                self.ack_waiting.store(false, Ordering::SeqCst);
                return AckResult::Failed(BridgeError::PortUnavailable(
                    crate::connection::MidiConnectionError::ConnectionError(e.to_string()),
                ));
            }

            let response = self.ack_rx.recv_timeout(Duration::from_millis(ack.timeout_ms));
            self.ack_waiting.store(false, Ordering::SeqCst);

            if !generation.matches(stream_generation) {
                return AckResult::Cancelled;
            }

            let response = match response {
                Ok(bytes) => bytes,
                Err(_) => return AckResult::Failed(BridgeError::AckTimeout { index }),
            };

            let Some(&status) = response.get(ack.status_byte_position) else {
                return AckResult::Failed(BridgeError::AckUnknownStatus { index, status: 0 });
            };

            match ack.response_table.get(&status) {
                Some(AckAction::Next) => {
                    return if retries == 0 {
                        AckResult::Ok
                    } else {
                        AckResult::Retried(retries)
                    };
                }
                Some(AckAction::Abort) => return AckResult::Failed(BridgeError::AckAbort { index }),
                Some(AckAction::Delay { ms }) => {
                    retries += 1;
                    if retries > MAX_BUSY_RETRIES {
                        return AckResult::Failed(BridgeError::AckTimeout { index });
                    }
                    std::thread::sleep(Duration::from_millis(*ms));
                    continue;
                }
                None => return AckResult::Failed(BridgeError::AckUnknownStatus { index, status }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResponseTypeEntry;

    #[test]
    fn parses_literal_and_placeholder_tokens() {
        let tokens = parse_template(&[
            "0xF0".to_string(),
            "0x00 0x20 0x29".to_string(),
            "CHANNEL".to_string(),
            "NOTE".to_string(),
            "0xF7".to_string(),
        ])
        .unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Literal(vec![0xF0]),
                Token::Literal(vec![0x00, 0x20, 0x29]),
                Token::Placeholder("CHANNEL".to_string()),
                Token::Placeholder("NOTE".to_string()),
                Token::Literal(vec![0xF7]),
            ]
        );
    }

    #[test]
    fn renders_bound_placeholders() {
        let tokens = parse_template(&[
            "0xF0".to_string(),
            "CHANNEL".to_string(),
            "NOTE".to_string(),
            "0xF7".to_string(),
        ])
        .unwrap();
        let mut bindings = HashMap::new();
        bindings.insert("CHANNEL", 3u8);
        bindings.insert("NOTE", 57u8);
        assert_eq!(render(&tokens, &bindings).unwrap(), vec![0xF0, 3, 57, 0xF7]);
    }

    #[test]
    fn render_fails_on_unbound_placeholder() {
        let tokens = parse_template(&["NOTE".to_string()]).unwrap();
        assert!(render(&tokens, &HashMap::new()).is_err());
    }

    #[test]
    fn derives_status_position_after_manufacturer_id() {
        // 0xF0, 3-byte mfr id, DEVICE_ID, STATUS -> STATUS at index 5.
        let tokens = parse_template(&[
            "0xF0".to_string(),
            "0x00 0x20 0x29".to_string(),
            "DEVICE_ID".to_string(),
            "STATUS".to_string(),
        ])
        .unwrap();
        assert_eq!(derive_status_position(&tokens), Some(5));
    }

    #[test]
    fn no_status_placeholder_yields_none() {
        let tokens = parse_template(&["0xF0".to_string(), "0xF7".to_string()]).unwrap();
        assert_eq!(derive_status_position(&tokens), None);
    }

    #[test]
    fn compile_sysex_resolves_override_before_derived_before_default() {
        let templates = SysexTemplates {
            set_pad_note_and_channel_response: Some(vec![
                "0xF0".to_string(),
                "STATUS".to_string(),
            ]),
            ..Default::default()
        };
        let ack_cfg = AckConfig {
            timeout_ms: 500,
            response_position: None,
            response_types: vec![ResponseTypeEntry {
                name: "next".to_string(),
                value: 1,
                action: AckAction::Next,
            }],
        };
        let compiled = compile_sysex(Some(&templates), Some(&ack_cfg)).unwrap().unwrap();
        assert_eq!(compiled.ack.unwrap().status_byte_position, 1);
    }

    #[test]
    fn compile_sysex_falls_back_to_default_position() {
        let ack_cfg = AckConfig {
            timeout_ms: 500,
            response_position: None,
            response_types: vec![],
        };
        let compiled = compile_sysex(None, None).unwrap();
        assert!(compiled.is_none());
        let compiled = compile_sysex(Some(&SysexTemplates::default()), Some(&ack_cfg))
            .unwrap()
            .unwrap();
        assert_eq!(compiled.ack.unwrap().status_byte_position, DEFAULT_STATUS_POSITION);
    }
}
