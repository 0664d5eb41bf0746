//! Remap engine: the hot MIDI thread, its inbound queue, the playing-notes
//! registry, and the layout-swap protocol that keeps them consistent.

use crate::layout::{ForwardTable, ReverseTable};
use crate::midi::event::MidiEvent;
use midir::MidiOutputConnection;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

const QUEUE_CAPACITY: usize = 1024;
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

type Tables = (ForwardTable, ReverseTable);
/// `(lx, ly, channel) -> currently-sounding output note`.
type PlayingNotes = HashMap<(i32, i32, u8), u8>;

/// Sending half handed to the MIDI input callback; `try_send` never blocks
/// the realtime MIDI driver thread that invokes the callback.
#[derive(Clone)]
pub struct InboundSender {
    tx: flume::Sender<Vec<u8>>,
}

impl InboundSender {
    pub fn push(&self, bytes: &[u8]) {
        if self.tx.try_send(bytes.to_vec()).is_err() {
            log::warn!("remap queue overflowed, dropping message");
        }
    }
}

/// Receiving half of the ACK side-channel, handed to the programming
/// driver so it can wait for SysEx responses without racing the hot loop.
pub struct AckChannel {
    pub receiver: flume::Receiver<Vec<u8>>,
    pub waiting: Arc<AtomicBool>,
}

/// Owns the hot thread and the state it shares with the coordinator:
/// the current forward/reverse tables and the playing-notes registry.
pub struct RemapEngine {
    tables: Arc<RwLock<Arc<Tables>>>,
    playing: Arc<Mutex<PlayingNotes>>,
    output: Arc<Mutex<MidiOutputConnection>>,
    shutdown: Arc<AtomicBool>,
    use_channel_lookup: bool,
    inbound_tx: flume::Sender<Vec<u8>>,
    ack_waiting: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RemapEngine {
    /// Spawns the hot thread. `use_channel_lookup` should be `false` for MPE
    /// controllers, where the reverse table is keyed on channel 0 uniformly.
    pub fn start(
        output: MidiOutputConnection,
        initial_forward: ForwardTable,
        initial_reverse: ReverseTable,
        use_channel_lookup: bool,
    ) -> (Self, InboundSender, AckChannel) {
        let (tx, rx) = flume::bounded::<Vec<u8>>(QUEUE_CAPACITY);
        let (ack_tx, ack_rx) = flume::bounded::<Vec<u8>>(8);
        let tables = Arc::new(RwLock::new(Arc::new((initial_forward, initial_reverse))));
        let playing: Arc<Mutex<PlayingNotes>> = Arc::new(Mutex::new(HashMap::new()));
        let output = Arc::new(Mutex::new(output));
        let shutdown = Arc::new(AtomicBool::new(false));
        let ack_waiting = Arc::new(AtomicBool::new(false));

        let thread = {
            let tables = Arc::clone(&tables);
            let playing = Arc::clone(&playing);
            let output = Arc::clone(&output);
            let shutdown = Arc::clone(&shutdown);
            let ack_waiting = Arc::clone(&ack_waiting);
            std::thread::Builder::new()
                .name("pitchgrid-remap".into())
                .spawn(move || {
                    hot_loop(rx, tables, playing, output, shutdown, use_channel_lookup, ack_tx, ack_waiting)
                })
                .expect("failed to spawn remap engine thread")
        };

        let engine = RemapEngine {
            tables,
            playing,
            output,
            shutdown,
            use_channel_lookup,
            inbound_tx: tx.clone(),
            ack_waiting: Arc::clone(&ack_waiting),
            thread: Some(thread),
        };
        (engine, InboundSender { tx }, AckChannel { receiver: ack_rx, waiting: ack_waiting })
    }

    /// Shared flag the programming driver sets while it is awaiting a SysEx
    /// ACK, so the hot loop knows to route responses instead of discarding
    /// them.
    pub fn ack_waiting_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ack_waiting)
    }

    /// Installs a new `(forward, reverse)` pair. Before the hot thread ever
    /// sees the new tables, any currently-playing note whose pad no longer
    /// maps to the same output note is explicitly released on its
    /// originating channel — this is what keeps layout changes click- and
    /// stuck-note-free.
    pub fn swap_tables(&self, new_forward: ForwardTable, new_reverse: ReverseTable) {
        let mut playing = self.playing.lock().unwrap();
        let mut output = self.output.lock().unwrap();

        let stale: Vec<((i32, i32, u8), u8)> = playing
            .iter()
            .filter(|(&(lx, ly, _channel), &out_note)| new_forward.get(&(lx, ly)) != Some(&out_note))
            .map(|(&k, &v)| (k, v))
            .collect();

        for ((_lx, _ly, channel), out_note) in &stale {
            send_note_off(&mut output, *channel, *out_note);
        }
        for (key, _) in &stale {
            playing.remove(key);
        }

        let mut tables = self.tables.write().unwrap();
        *tables = Arc::new((new_forward, new_reverse));
    }

    /// Releases every note this bridge currently believes is sounding, e.g.
    /// before a controller disconnect.
    pub fn stop_all_notes(&self) {
        let mut playing = self.playing.lock().unwrap();
        let mut output = self.output.lock().unwrap();
        for (&(_lx, _ly, channel), &out_note) in playing.iter() {
            send_note_off(&mut output, channel, out_note);
        }
        playing.clear();
    }

    pub fn playing_count(&self) -> usize {
        self.playing.lock().unwrap().len()
    }

    pub fn use_channel_lookup(&self) -> bool {
        self.use_channel_lookup
    }

    /// Number of messages currently queued but not yet drained by the hot
    /// thread — exposed for the status snapshot.
    pub fn queue_len(&self) -> usize {
        self.inbound_tx.len()
    }
}

impl Drop for RemapEngine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn send_note_off(output: &mut MidiOutputConnection, channel: u8, note: u8) {
    let bytes = MidiEvent::NoteOff { channel, note, velocity: 0 }.to_bytes();
    if let Err(e) = output.send(&bytes) {
        log::warn!("failed to send cleanup Note-Off: {}", e);
    }
}

#[allow(clippy::too_many_arguments)]
fn hot_loop(
    rx: flume::Receiver<Vec<u8>>,
    tables: Arc<RwLock<Arc<Tables>>>,
    playing: Arc<Mutex<PlayingNotes>>,
    output: Arc<Mutex<MidiOutputConnection>>,
    shutdown: Arc<AtomicBool>,
    use_channel_lookup: bool,
    ack_tx: flume::Sender<Vec<u8>>,
    ack_waiting: Arc<AtomicBool>,
) {
    loop {
        match rx.recv_timeout(RECV_POLL_INTERVAL) {
            Ok(bytes) => {
                process_message(&bytes, &tables, &playing, &output, use_channel_lookup, &ack_tx, &ack_waiting);
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
            }
            Err(flume::RecvTimeoutError::Disconnected) => return,
        }
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn process_message(
    bytes: &[u8],
    tables: &RwLock<Arc<Tables>>,
    playing: &Mutex<PlayingNotes>,
    output: &Mutex<MidiOutputConnection>,
    use_channel_lookup: bool,
    ack_tx: &flume::Sender<Vec<u8>>,
    ack_waiting: &AtomicBool,
) {
    let event = match MidiEvent::parse_one(bytes) {
        Ok(event) => event,
        Err(e) => {
            log::trace!("dropping unparseable MIDI bytes: {}", e);
            return;
        }
    };

    let current = tables.read().unwrap().clone();
    let (forward, reverse) = (&current.0, &current.1);

    match event {
        MidiEvent::NoteOn { channel, note, velocity } if velocity > 0 => {
            let lookup_channel = if use_channel_lookup { channel } else { 0 };
            let Some(&(lx, ly)) = reverse.get(&(lookup_channel, note)) else {
                log::trace!("note {} on channel {} has no mapped pad, dropping", note, channel);
                return;
            };
            let Some(&out_note) = forward.get(&(lx, ly)) else {
                log::trace!("pad ({}, {}) has no mapped note in current tuning, dropping", lx, ly);
                return;
            };
            let mut out = output.lock().unwrap();
            let bytes = MidiEvent::NoteOn { channel, note: out_note, velocity }.to_bytes();
            if let Err(e) = out.send(&bytes) {
                log::warn!("failed to forward Note-On: {}", e);
                return;
            }
            drop(out);
            playing.lock().unwrap().insert((lx, ly, channel), out_note);
        }
        MidiEvent::NoteOn { channel, note, .. } | MidiEvent::NoteOff { channel, note, .. } => {
            // Effective note-off (includes Note-On velocity 0).
            let lookup_channel = if use_channel_lookup { channel } else { 0 };
            let Some(&(lx, ly)) = reverse.get(&(lookup_channel, note)) else {
                return;
            };
            let mut playing = playing.lock().unwrap();
            let Some(out_note) = playing.remove(&(lx, ly, channel)) else {
                // Already released (e.g. by a layout swap's cleanup pass).
                return;
            };
            drop(playing);
            let mut out = output.lock().unwrap();
            send_note_off(&mut out, channel, out_note);
        }
        MidiEvent::ControlChange { .. } | MidiEvent::Other(_) => {
            let mut out = output.lock().unwrap();
            if let Err(e) = out.send(&event.to_bytes()) {
                log::warn!("failed to forward message: {}", e);
            }
        }
        MidiEvent::SysEx(bytes) => {
            if ack_waiting.load(Ordering::SeqCst) {
                if ack_tx.try_send(bytes).is_err() {
                    log::warn!("ACK queue overflowed, dropping SysEx response");
                }
            } else {
                log::trace!("discarding unsolicited SysEx from controller input ({} bytes)", bytes.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The hot loop needs a live MidiOutputConnection, which requires a real
    // backend port; these tests exercise the pure bookkeeping instead,
    // against the same data structures `swap_tables`/`process_message` use.

    #[test]
    fn stale_entries_detected_by_forward_mismatch() {
        let mut playing: PlayingNotes = HashMap::new();
        playing.insert((3, 2, 0), 57);

        let mut new_forward: ForwardTable = HashMap::new();
        new_forward.insert((3, 2), 58);

        let stale: Vec<_> = playing
            .iter()
            .filter(|(&(lx, ly, _), &out_note)| new_forward.get(&(lx, ly)) != Some(&out_note))
            .collect();
        assert_eq!(stale.len(), 1);
    }

    #[test]
    fn preserved_mapping_is_not_stale() {
        let mut playing: PlayingNotes = HashMap::new();
        playing.insert((3, 2, 0), 57);

        let mut new_forward: ForwardTable = HashMap::new();
        new_forward.insert((3, 2), 57);

        let stale: Vec<_> = playing
            .iter()
            .filter(|(&(lx, ly, _), &out_note)| new_forward.get(&(lx, ly)) != Some(&out_note))
            .collect();
        assert!(stale.is_empty());
    }
}
