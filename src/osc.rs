//! OSC tuning session (C6): heartbeat-driven presence detection and live
//! scale updates from an external tuning editor.
//!
//! Wire format and heartbeat cadence follow the PitchGrid plugin's OSC
//! protocol: a `/pitchgrid/plugin/tuning` message carries seven numeric
//! arguments `(depth, mode, root_freq, stretch, skew, mode_offset, steps)`;
//! `stretch`/`skew` are the equave/generator ratio fed straight into
//! `Mos::from_g` (not cents, despite the field names there — see
//! `Mos::from_g`'s doc comment), matching the upstream tuning handler's
//! `MOS.fromG(depth, mode, skew, stretch, 1)` construction.

use rosc::{OscMessage, OscPacket, OscType};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const DEFAULT_LISTEN_PORT: u16 = 34561;
pub const DEFAULT_PEER_PORT: u16 = 34562;

const TUNING_ADDR: &str = "/pitchgrid/plugin/tuning";
const HEARTBEAT_ADDR: &str = "/pitchgrid/heartbeat";
const HEARTBEAT_ACK_ADDR: &str = "/pitchgrid/heartbeat/ack";
const AUX_ADDRS: [&str; 3] = ["/pitchgrid/scale", "/pitchgrid/notes", "/pitchgrid/playing"];

const PRESENCE_WINDOW: Duration = Duration::from_secs(2);
const MONITOR_INTERVAL: Duration = Duration::from_millis(500);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// A decoded `/pitchgrid/plugin/tuning` frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuningFrame {
    pub depth: u32,
    pub mode: i32,
    pub root_freq: f64,
    pub stretch: f64,
    pub skew: f64,
    pub mode_offset: i32,
    pub steps: i32,
}

impl TuningFrame {
    fn from_args(args: &[OscType]) -> Option<Self> {
        if args.len() < 7 {
            return None;
        }
        Some(TuningFrame {
            depth: as_i32(&args[0])?.max(1) as u32,
            mode: as_i32(&args[1])?,
            root_freq: as_f64(&args[2])?,
            stretch: as_f64(&args[3])?,
            skew: as_f64(&args[4])?,
            mode_offset: as_i32(&args[5])?,
            steps: as_i32(&args[6])?.max(1),
        })
    }
}

fn as_i32(v: &OscType) -> Option<i32> {
    match v {
        OscType::Int(i) => Some(*i),
        OscType::Float(f) => Some(*f as i32),
        OscType::Double(d) => Some(*d as i32),
        OscType::Long(l) => Some(*l as i32),
        _ => None,
    }
}

fn as_f64(v: &OscType) -> Option<f64> {
    match v {
        OscType::Float(f) => Some(*f as f64),
        OscType::Double(d) => Some(*d),
        OscType::Int(i) => Some(*i as f64),
        OscType::Long(l) => Some(*l as f64),
        _ => None,
    }
}

/// Peer-presence state, derived from ACK recency rather than a connection
/// handshake (UDP has none).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Disconnected,
    Connected,
}

struct PresenceTracker {
    last_ack: Mutex<Option<Instant>>,
    state: Mutex<Presence>,
}

fn refresh_presence(presence: &PresenceTracker) {
    *presence.last_ack.lock().unwrap() = Some(Instant::now());
}

/// Owns the three OSC threads (server, heartbeat, monitor) and their shared
/// shutdown flag. Dropping a session joins all three.
pub struct OscSession {
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    presence: Arc<PresenceTracker>,
}

impl OscSession {
    /// Binds `listen_port`, starts sending heartbeats to `127.0.0.1:peer_port`,
    /// and spawns the server/heartbeat/monitor threads. `on_tuning` is
    /// invoked from the server thread for every valid tuning frame;
    /// `on_presence` from the monitor thread on every state transition.
    pub fn start(
        listen_port: u16,
        peer_port: u16,
        on_tuning: impl Fn(TuningFrame) + Send + Sync + 'static,
        on_presence: impl Fn(Presence) + Send + Sync + 'static,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("127.0.0.1", listen_port))?;
        socket.set_read_timeout(Some(SOCKET_READ_TIMEOUT))?;
        let heartbeat_socket = socket.try_clone()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let presence = Arc::new(PresenceTracker {
            last_ack: Mutex::new(None),
            state: Mutex::new(Presence::Disconnected),
        });
        let on_tuning: Arc<dyn Fn(TuningFrame) + Send + Sync> = Arc::new(on_tuning);
        let on_presence: Arc<dyn Fn(Presence) + Send + Sync> = Arc::new(on_presence);

        let server = {
            let shutdown = Arc::clone(&shutdown);
            let presence = Arc::clone(&presence);
            std::thread::Builder::new()
                .name("pitchgrid-osc-server".into())
                .spawn(move || server_loop(socket, shutdown, presence, on_tuning))
                .expect("failed to spawn OSC server thread")
        };

        let heartbeat = {
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name("pitchgrid-osc-heartbeat".into())
                .spawn(move || heartbeat_loop(heartbeat_socket, peer_port, shutdown))
                .expect("failed to spawn OSC heartbeat thread")
        };

        let monitor = {
            let shutdown = Arc::clone(&shutdown);
            let presence = Arc::clone(&presence);
            std::thread::Builder::new()
                .name("pitchgrid-osc-monitor".into())
                .spawn(move || monitor_loop(presence, on_presence, shutdown))
                .expect("failed to spawn OSC monitor thread")
        };

        Ok(OscSession { shutdown, threads: vec![server, heartbeat, monitor], presence })
    }

    pub fn is_connected(&self) -> bool {
        *self.presence.state.lock().unwrap() == Presence::Connected
    }
}

impl Drop for OscSession {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn server_loop(
    socket: UdpSocket,
    shutdown: Arc<AtomicBool>,
    presence: Arc<PresenceTracker>,
    on_tuning: Arc<dyn Fn(TuningFrame) + Send + Sync>,
) {
    let mut buf = [0u8; 4096];
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        match socket.recv_from(&mut buf) {
            Ok((size, _addr)) => match rosc::decoder::decode_udp(&buf[..size]) {
                Ok((_, packet)) => handle_packet(packet, &presence, &on_tuning),
                Err(e) => log::warn!("OSC decode error: {e}"),
            },
            Err(ref e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
            Err(e) => log::warn!("OSC socket error: {e}"),
        }
    }
}

fn handle_packet(packet: OscPacket, presence: &PresenceTracker, on_tuning: &Arc<dyn Fn(TuningFrame) + Send + Sync>) {
    match packet {
        OscPacket::Message(msg) => handle_message(msg, presence, on_tuning),
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                handle_packet(inner, presence, on_tuning);
            }
        }
    }
}

fn handle_message(msg: OscMessage, presence: &PresenceTracker, on_tuning: &Arc<dyn Fn(TuningFrame) + Send + Sync>) {
    match msg.addr.as_str() {
        TUNING_ADDR => {
            refresh_presence(presence);
            match TuningFrame::from_args(&msg.args) {
                Some(frame) => on_tuning(frame),
                None => log::warn!("malformed tuning frame: {:?}", msg.args),
            }
        }
        HEARTBEAT_ACK_ADDR => refresh_presence(presence),
        addr if AUX_ADDRS.contains(&addr) => refresh_presence(presence),
        addr => log::trace!("unhandled OSC address {addr}"),
    }
}

fn heartbeat_loop(socket: UdpSocket, peer_port: u16, shutdown: Arc<AtomicBool>) {
    let peer = format!("127.0.0.1:{peer_port}");
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let msg = OscMessage { addr: HEARTBEAT_ADDR.to_string(), args: vec![OscType::Int(1)] };
        match rosc::encoder::encode(&OscPacket::Message(msg)) {
            Ok(packet) => {
                if let Err(e) = socket.send_to(&packet, &peer) {
                    log::debug!("heartbeat send failed: {e}");
                }
            }
            Err(e) => log::warn!("failed to encode heartbeat: {e}"),
        }
        std::thread::sleep(HEARTBEAT_INTERVAL);
    }
}

fn monitor_loop(
    presence: Arc<PresenceTracker>,
    on_presence: Arc<dyn Fn(Presence) + Send + Sync>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        std::thread::sleep(MONITOR_INTERVAL);

        let connected = presence
            .last_ack
            .lock()
            .unwrap()
            .is_some_and(|t| t.elapsed() <= PRESENCE_WINDOW);
        let next = if connected { Presence::Connected } else { Presence::Disconnected };

        let mut state = presence.state.lock().unwrap();
        if *state != next {
            *state = next;
            drop(state);
            on_presence(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seven_arg_tuning_frame() {
        let args = vec![
            OscType::Int(1),
            OscType::Int(0),
            OscType::Float(440.0),
            OscType::Float(1200.0),
            OscType::Float(700.0),
            OscType::Int(0),
            OscType::Int(12),
        ];
        let frame = TuningFrame::from_args(&args).unwrap();
        assert_eq!(frame.depth, 1);
        assert_eq!(frame.steps, 12);
        assert_eq!(frame.stretch, 1200.0);
        assert_eq!(frame.skew, 700.0);
    }

    #[test]
    fn rejects_short_arg_list() {
        let args = vec![OscType::Int(1), OscType::Int(0)];
        assert!(TuningFrame::from_args(&args).is_none());
    }

    #[test]
    fn depth_floor_is_one() {
        let mut args = vec![
            OscType::Int(0),
            OscType::Int(0),
            OscType::Float(440.0),
            OscType::Float(1200.0),
            OscType::Float(700.0),
            OscType::Int(0),
            OscType::Int(12),
        ];
        let frame = TuningFrame::from_args(&args).unwrap();
        assert_eq!(frame.depth, 1);
        args[0] = OscType::Int(5);
        let frame = TuningFrame::from_args(&args).unwrap();
        assert_eq!(frame.depth, 5);
    }

    #[test]
    fn presence_transitions_from_disconnected_to_connected_on_ack() {
        let presence = PresenceTracker { last_ack: Mutex::new(None), state: Mutex::new(Presence::Disconnected) };
        assert_eq!(*presence.state.lock().unwrap(), Presence::Disconnected);
        refresh_presence(&presence);
        let connected = presence.last_ack.lock().unwrap().is_some_and(|t| t.elapsed() <= PRESENCE_WINDOW);
        assert!(connected);
    }
}
