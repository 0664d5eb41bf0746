//! Coordinator (C7): single owner of the current controller, layout, and
//! tuning state. Orchestrates table rebuilds and, when a connected
//! controller offers programmable pad lights, device-programming streams.

use crate::color;
use crate::config::CompiledDescriptor;
use crate::connection;
use crate::error::BridgeError;
use crate::generation::Generation;
use crate::layout::{self, LayoutConfig, TransformKind};
use crate::midi::event::MidiEvent;
use crate::midi::engine::{AckChannel, RemapEngine};
use crate::mos::Mos;
use crate::osc::{OscSession, Presence, TuningFrame};
use crate::sysex::{ProgrammingDriver, StreamOutcome};
use midir::{MidiInputConnection, MidiOutputConnection};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

const DEFAULT_ROOT_NOTE: u8 = 60;
const DEFAULT_INTER_MESSAGE_DELAY: Duration = Duration::from_micros(1500);

/// Virtual-port lifecycle state, for the status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualPortStatus {
    NotOpened,
    Open,
    Unavailable,
}

/// A descriptor name paired with whether a matching input port is currently
/// plugged in.
#[derive(Debug, Clone)]
pub struct DescriptorAvailability {
    pub device_name: String,
    pub input_port_live: bool,
}

#[derive(Debug, Clone)]
pub struct PadStatus {
    pub lx: i32,
    pub ly: i32,
    pub phys_x: f64,
    pub phys_y: f64,
    /// Always `None`: pad-polygon tessellation is the UI layer's job.
    pub shape_vertices: Option<Vec<(f64, f64)>>,
    pub output_note: Option<u8>,
    pub color: Option<String>,
    pub natural_coord: Option<(i32, i32)>,
    /// Overrides the tuning-derived label for pads the descriptor pins to a
    /// fixed display label (e.g. function keys), from `fixed_labels`.
    pub label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TuningSummary {
    pub depth: u32,
    pub mode: i32,
    pub root_freq: f64,
    pub stretch: f64,
    pub skew: f64,
    pub mode_offset: i32,
    pub steps: i32,
    pub scale_system_label: String,
    pub enharmonic_vector: Option<(i32, i32)>,
}

#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub connected_controller: Option<String>,
    pub layout_type: &'static str,
    pub virtual_port_status: VirtualPortStatus,
    pub known_descriptors: Vec<String>,
    pub discoverable: Vec<DescriptorAvailability>,
    pub pads: Vec<PadStatus>,
    pub osc_connected: bool,
    pub tuning: TuningSummary,
}

/// Live tuning state, replaced wholesale on each OSC tuning frame.
#[derive(Debug, Clone)]
struct TuningState {
    mos: Mos,
    last_frame: Option<TuningFrame>,
}

impl Default for TuningState {
    fn default() -> Self {
        TuningState { mos: Mos::from_params(12, 7, 0, 1200.0, 700.0, 1), last_frame: None }
    }
}

impl TuningState {
    fn summary(&self) -> TuningSummary {
        let frame = self.last_frame;
        let enharmonic_vector = frame
            .and_then(|f| self.mos.enharmonic_vector(f.depth, f.steps))
            .map(|v| (v.x, v.y));
        TuningSummary {
            depth: frame.map(|f| f.depth).unwrap_or(1),
            mode: self.mos.mode,
            root_freq: frame.map(|f| f.root_freq).unwrap_or(440.0),
            stretch: frame.map(|f| f.stretch).unwrap_or(self.mos.equave_cents),
            skew: frame.map(|f| f.skew).unwrap_or(self.mos.generator_cents),
            mode_offset: frame.map(|f| f.mode_offset).unwrap_or(0),
            steps: frame.map(|f| f.steps).unwrap_or(self.mos.n),
            scale_system_label: format!("{}L {}s", self.mos.n_large, self.mos.n_small),
            enharmonic_vector,
        }
    }
}

struct ConnectedController {
    descriptor: Arc<CompiledDescriptor>,
    engine: RemapEngine,
    input_port_name: String,
    /// Held only to close the port on disconnect; never read directly,
    /// the hot thread receives messages via `InboundSender` instead.
    _input_connection: Option<MidiInputConnection<()>>,
    programming_output: Option<Arc<Mutex<MidiOutputConnection>>>,
    ack: Option<AckChannel>,
    virtual_port_status: VirtualPortStatus,
}

struct CoordinatorState {
    connected: Option<ConnectedController>,
    layout: LayoutConfig,
    tuning: TuningState,
    osc: Option<OscSession>,
    osc_presence: Presence,
}

/// Single-writer owner of `{current_controller, current_layout, tuning_state}`.
/// All mutation happens through `&self` methods backed by an internal mutex;
/// there is exactly one coordinator instance per process, owned by `main`.
pub struct Coordinator {
    descriptors: Mutex<HashMap<String, Arc<CompiledDescriptor>>>,
    state: Mutex<CoordinatorState>,
    generation: Generation,
    virtual_port_name: String,
}

impl Coordinator {
    pub fn new(descriptor_dir: PathBuf, virtual_port_name: String) -> Arc<Coordinator> {
        let descriptors = crate::config::load_descriptors(&descriptor_dir)
            .into_iter()
            .map(|d| (d.device_name().to_string(), Arc::new(d)))
            .collect();

        Arc::new(Coordinator {
            descriptors: Mutex::new(descriptors),
            state: Mutex::new(CoordinatorState {
                connected: None,
                layout: LayoutConfig { root_note: DEFAULT_ROOT_NOTE, ..LayoutConfig::default() },
                tuning: TuningState::default(),
                osc: None,
                osc_presence: Presence::Disconnected,
            }),
            generation: Generation::new(),
            virtual_port_name,
        })
    }

    /// Starts the OSC tuning session. `self` must already be held in an
    /// `Arc`; the session's callbacks hold only a `Weak` reference back so
    /// dropping the coordinator tears the session down rather than leaking
    /// a reference cycle.
    pub fn start_osc(self: &Arc<Self>, listen_port: u16, peer_port: u16) {
        let weak: Weak<Coordinator> = Arc::downgrade(self);
        let tuning_weak = weak.clone();
        let presence_weak = weak;

        let session = OscSession::start(
            listen_port,
            peer_port,
            move |frame| {
                if let Some(coordinator) = tuning_weak.upgrade() {
                    coordinator.apply_tuning_frame(frame);
                }
            },
            move |presence| {
                if let Some(coordinator) = presence_weak.upgrade() {
                    coordinator.state.lock().unwrap().osc_presence = presence;
                }
            },
        );

        match session {
            Ok(session) => self.state.lock().unwrap().osc = Some(session),
            Err(e) => log::warn!("failed to start OSC session: {e}"),
        }
    }

    fn apply_tuning_frame(&self, frame: TuningFrame) {
        let mos = Mos::from_g(frame.depth, frame.mode, frame.skew, frame.stretch, 1);
        {
            let mut state = self.state.lock().unwrap();
            state.tuning = TuningState { mos, last_frame: Some(frame) };
        }
        self.rebuild_tables();
    }

    /// Looks up `device_name`, opens its MIDI ports, rebuilds tables, and —
    /// if the descriptor offers programmable pad lights — issues a freshly
    /// generationed programming stream.
    pub fn connect(&self, device_name: &str) -> Result<(), BridgeError> {
        let descriptor = self
            .descriptors
            .lock()
            .unwrap()
            .get(device_name)
            .cloned()
            .ok_or_else(|| BridgeError::DescriptorInvalid {
                path: device_name.to_string(),
                reason: "no loaded descriptor with that name".to_string(),
            })?;

        self.disconnect();

        let virtual_name = if descriptor.virtual_port_name() == "PitchGrid Mapper" {
            self.virtual_port_name.clone()
        } else {
            descriptor.virtual_port_name().to_string()
        };
        let output = connection::open_virtual_output(&virtual_name)?;

        let (forward, reverse) = {
            let state = self.state.lock().unwrap();
            layout::build_tables(&descriptor, &state.tuning.mos, &state.layout)
        };

        let (engine, inbound, ack) = RemapEngine::start(output, forward, reverse, !descriptor.raw.is_mpe);

        let (input_port_name, input_connection) = {
            let input_substring = descriptor.input_port_substring().unwrap_or(descriptor.device_name());
            let inbound = inbound.clone();
            match connection::connect_controller_input(input_substring, "pitchgrid-bridge", move |_ts, bytes, _| {
                inbound.push(bytes);
            }) {
                Ok((conn, name)) => (name, Some(conn)),
                Err(e) => {
                    log::warn!("controller input unavailable for {device_name}: {e}");
                    (String::new(), None)
                }
            }
        };

        let programming_output = descriptor
            .output_port_substring()
            .or_else(|| descriptor.input_port_substring())
            .and_then(|substring| connection::connect_programming_output(substring).ok())
            .map(|conn| Arc::new(Mutex::new(conn)));

        {
            let mut state = self.state.lock().unwrap();
            state.connected = Some(ConnectedController {
                descriptor: Arc::clone(&descriptor),
                engine,
                input_port_name,
                _input_connection: input_connection,
                programming_output,
                ack: Some(ack),
                virtual_port_status: VirtualPortStatus::Open,
            });
        }

        self.program_device();
        Ok(())
    }

    /// Stops all playing notes, then closes the controller input, virtual
    /// output, and programming output ports by dropping their handles.
    pub fn disconnect(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(connected) = state.connected.take() {
            connected.engine.stop_all_notes();
            // `connected` drops here: the input connection, the engine's
            // hot thread (and with it the virtual output), and the
            // programming output all close with it.
        }
    }

    /// Rebuilds tables and diffs playing notes against the new mapping.
    pub fn update_layout(&self, config: LayoutConfig) {
        {
            let mut state = self.state.lock().unwrap();
            state.layout = config;
        }
        self.rebuild_tables();
    }

    /// Mutates the current `LayoutConfig` by a cumulative delta, then
    /// rebuilds.
    pub fn apply_transformation(&self, kind: TransformKind) {
        {
            let mut state = self.state.lock().unwrap();
            state.layout.apply(kind);
        }
        self.rebuild_tables();
    }

    fn rebuild_tables(&self) {
        let state = self.state.lock().unwrap();
        let Some(connected) = state.connected.as_ref() else { return };
        let (forward, reverse) = layout::build_tables(&connected.descriptor, &state.tuning.mos, &state.layout);
        connected.engine.swap_tables(forward, reverse);
        drop(state);
        self.program_device();
    }

    /// Spawns the short-lived programming thread (T6) when the connected
    /// descriptor has pad-note/color templates to push. A fresh generation
    /// is bumped first, so any programming stream still in flight aborts at
    /// its next check.
    fn program_device(&self) {
        let stream_generation = self.generation.bump();
        let state = self.state.lock().unwrap();
        let Some(connected) = state.connected.as_ref() else { return };
        let Some(sysex) = connected.descriptor.sysex.as_ref() else { return };
        let Some(template) = sysex.set_pad_note_and_channel.as_ref() else { return };
        let Some(output) = connected.programming_output.as_ref() else { return };
        let output = Arc::clone(output);
        let Some(ack) = connected.ack.as_ref() else { return };

        let descriptor = Arc::clone(&connected.descriptor);
        let delay_ms = descriptor.raw.message_delay_ms;
        let template = template.clone();
        let ack_config = sysex.ack.clone();
        let driver = ProgrammingDriver::new(ack.receiver.clone(), Arc::clone(&ack.waiting));
        let generation = self.generation.clone();

        drop(state);

        let messages: Vec<MidiEvent> = descriptor
            .pads
            .iter()
            .filter_map(|&(lx, ly, _px, _py)| {
                let mut vars = HashMap::with_capacity(2);
                vars.insert("x".to_string(), lx as i64);
                vars.insert("y".to_string(), ly as i64);
                let note = descriptor
                    .note_assign
                    .as_ref()
                    .and_then(|e| crate::expr::eval(e, &vars, &descriptor.helpers).ok())?;
                let channel = descriptor
                    .channel_assign
                    .as_ref()
                    .and_then(|e| crate::expr::eval(e, &vars, &descriptor.helpers).ok())
                    .unwrap_or(0);
                let mut bindings = HashMap::new();
                bindings.insert("NOTE", note as u8);
                bindings.insert("CHANNEL", channel as u8);
                crate::sysex::render(&template, &bindings).ok().map(MidiEvent::SysEx)
            })
            .collect();

        if messages.is_empty() {
            return;
        }

        let delay = delay_ms.map(Duration::from_millis).unwrap_or(DEFAULT_INTER_MESSAGE_DELAY);

        std::thread::Builder::new()
            .name("pitchgrid-programming".into())
            .spawn(move || {
                let outcome = driver.send_stream(&output, &messages, ack_config.as_ref(), delay, &generation, stream_generation);
                match outcome {
                    StreamOutcome::Completed { retries } => {
                        log::info!("pad programming stream completed, {retries} ACK retries")
                    }
                    StreamOutcome::Cancelled => log::debug!("pad programming stream superseded"),
                    StreamOutcome::Failed(e) => log::warn!("pad programming stream failed: {e}"),
                }
            })
            .expect("failed to spawn programming thread");
    }

    /// Known descriptor names paired with live-port discovery, for the UI.
    pub fn discover(&self) -> Vec<DescriptorAvailability> {
        self.descriptors
            .lock()
            .unwrap()
            .values()
            .map(|d| DescriptorAvailability {
                device_name: d.device_name().to_string(),
                input_port_live: d.input_port_substring().is_some_and(connection::input_port_available),
            })
            .collect()
    }

    pub fn status(&self) -> StatusSnapshot {
        let descriptors = self.descriptors.lock().unwrap();
        let state = self.state.lock().unwrap();

        let known_descriptors: Vec<String> = descriptors.keys().cloned().collect();
        let discoverable = descriptors
            .values()
            .map(|d| DescriptorAvailability {
                device_name: d.device_name().to_string(),
                input_port_live: d.input_port_substring().is_some_and(connection::input_port_available),
            })
            .collect();

        let (connected_controller, virtual_port_status, pads) = match state.connected.as_ref() {
            Some(connected) => {
                let scheme = color::scheme_for(
                    connected.descriptor.raw.params.get("color").and_then(|v| v.as_str()),
                );
                let pads = connected
                    .descriptor
                    .pads
                    .iter()
                    .map(|&(lx, ly, phys_x, phys_y)| {
                        let natural = state.layout.natural_coordinate(&connected.descriptor, lx, ly);
                        let degree = state.tuning.mos.degree_offset(natural.0, natural.1);
                        let output_note = {
                            let raw_note = state.layout.root_note as i32 + degree;
                            (0..=127).contains(&raw_note).then_some(raw_note as u8)
                        };
                        let label = connected
                            .descriptor
                            .raw
                            .fixed_labels
                            .get(&format!("{lx},{ly}"))
                            .cloned();
                        PadStatus {
                            lx,
                            ly,
                            phys_x,
                            phys_y,
                            shape_vertices: None,
                            output_note,
                            color: output_note.map(|_| scheme.compute_color(degree, &state.tuning.mos)),
                            natural_coord: Some(natural),
                            label,
                        }
                    })
                    .collect();
                (
                    Some(connected.descriptor.device_name().to_string()),
                    connected.virtual_port_status,
                    pads,
                )
            }
            None => (None, VirtualPortStatus::NotOpened, Vec::new()),
        };

        StatusSnapshot {
            connected_controller,
            layout_type: "isomorphic",
            virtual_port_status,
            known_descriptors,
            discoverable,
            pads,
            osc_connected: state.osc.as_ref().is_some_and(|s| s.is_connected()) || state.osc_presence == Presence::Connected,
            tuning: state.tuning.summary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tuning_is_12edo_chromatic() {
        let tuning = TuningState::default();
        assert_eq!(tuning.mos.a, 12);
        assert_eq!(tuning.mos.b, 7);
    }

    #[test]
    fn status_with_no_connection_reports_not_opened() {
        let dir = std::env::temp_dir().join(format!("pitchgrid-coord-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let coordinator = Coordinator::new(dir.clone(), "PitchGrid Mapper".to_string());
        let status = coordinator.status();
        assert_eq!(status.connected_controller, None);
        assert_eq!(status.virtual_port_status, VirtualPortStatus::NotOpened);
        std::fs::remove_dir_all(&dir).ok();
    }
}
