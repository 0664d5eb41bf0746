//! MIDI protocol backend: byte-stream framing and the hot remap engine.
//!
//! Uses midir for cross-platform MIDI I/O. This module owns everything that
//! touches the realtime input callback and the hot output thread; SysEx
//! device programming lives one level up in `crate::sysex`, which consumes
//! the `AckChannel` this module publishes.

pub mod engine;
pub mod event;

pub use engine::{AckChannel, InboundSender, RemapEngine};
pub use event::MidiEvent;
