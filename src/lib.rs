//! Real-time MIDI retuning bridge for isomorphic controllers.
//!
//! Sits between a physical grid controller (LinnStrument, Lumatone,
//! computer-keyboard emulations) and a downstream synthesizer: it rewrites
//! each incoming note to the MIDI note implied by the controller's geometry
//! and the currently-loaded microtonal scale, forwarding the rewritten
//! stream through a virtual MIDI port. A tuning editor drives scale changes
//! live over OSC; for controllers with programmable pad lights, an
//! ACK-gated SysEx driver pushes per-pad note/color assignments.
//!
//! # Architecture
//!
//! ```text
//! Controller  --midir callback-->  inbound queue  --hot thread-->  virtual output
//!                                        ^                  |
//!                                        |                  v
//!                              OSC tuning frame      playing-notes registry
//!                                        |                  ^
//!                                        v                  |
//!                                   Coordinator  ----> layout rebuild + table swap
//!                                        |
//!                                        v
//!                          SysEx programming thread (ACK-gated, cancellable)
//! ```

pub mod color;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod expr;
pub mod generation;
pub mod layout;
pub mod midi;
pub mod mos;
pub mod osc;
pub mod sysex;

pub use color::{ColorScheme, DegreeWheel};
pub use config::{CompiledDescriptor, ControllerDescriptor};
pub use connection::MidiConnectionError;
pub use coordinator::{Coordinator, DescriptorAvailability, PadStatus, StatusSnapshot, TuningSummary, VirtualPortStatus};
pub use error::BridgeError;
pub use generation::Generation;
pub use layout::{ForwardTable, LayoutConfig, ReverseTable, TransformKind};
pub use midi::{AckChannel, InboundSender, MidiEvent, RemapEngine};
pub use mos::Mos;
pub use osc::{OscSession, Presence, TuningFrame};
pub use sysex::{CompiledSysex, ProgrammingDriver, StreamOutcome};
