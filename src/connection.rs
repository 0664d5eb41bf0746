//! MIDI port discovery and connection.
//!
//! Uses midir for cross-platform MIDI I/O (ALSA on Linux, CoreMIDI on macOS,
//! WinMM on Windows). The bridge needs up to three ports: the controller's
//! input, the virtual output fed to the downstream synth, and an optional
//! controller programming output for SysEx (LED/pad-note assignment).

use midir::{MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};

/// Error type for MIDI connection operations.
#[derive(Debug, thiserror::Error)]
pub enum MidiConnectionError {
    #[error("failed to initialize MIDI input: {0}")]
    InputInitError(String),

    #[error("failed to initialize MIDI output: {0}")]
    OutputInitError(String),

    #[error("no MIDI input ports available")]
    NoInputPorts,

    #[error("no MIDI port found matching pattern: {0}")]
    PortNotFound(String),

    #[error("failed to connect to MIDI port: {0}")]
    ConnectionError(String),

    #[error("failed to get port info: {0}")]
    PortInfoError(String),

    #[error("failed to create virtual port {0:?}: {1}")]
    VirtualPortError(String, String),
}

/// Finds and opens the controller's MIDI input port.
///
/// The pattern is matched case-insensitively as a substring of port names;
/// when several ports match, the one with the shortest name wins (it is
/// assumed to be the more specific/canonical match).
pub fn connect_controller_input<F>(
    port_substring: &str,
    client_name: &str,
    callback: F,
) -> Result<(MidiInputConnection<()>, String), MidiConnectionError>
where
    F: FnMut(u64, &[u8], &mut ()) + Send + 'static,
{
    let pattern = port_substring.to_lowercase();
    let midi_in = MidiInput::new(client_name)
        .map_err(|e| MidiConnectionError::InputInitError(e.to_string()))?;

    let in_ports = midi_in.ports();
    if in_ports.is_empty() {
        return Err(MidiConnectionError::NoInputPorts);
    }

    let mut candidates: Vec<_> = in_ports
        .into_iter()
        .filter_map(|port| {
            let name = midi_in.port_name(&port).ok()?;
            name.to_lowercase()
                .contains(&pattern)
                .then_some((name, port))
        })
        .collect();
    candidates.sort_by_key(|(name, _)| name.len());

    let (port_name, port) = candidates
        .into_iter()
        .next()
        .ok_or_else(|| MidiConnectionError::PortNotFound(port_substring.to_string()))?;

    log::info!("controller input port matched: {}", port_name);

    let conn = midi_in
        .connect(&port, "pitchgrid-bridge-in", callback, ())
        .map_err(|e| MidiConnectionError::ConnectionError(e.to_string()))?;

    Ok((conn, port_name))
}

/// Opens the virtual output port the rewritten note stream is forwarded
/// through. On platforms without virtual-port creation support (Windows),
/// falls back to discovering a pre-existing output port of that exact name
/// (a loopback driver the user has set up ahead of time); if neither is
/// possible, returns `VirtualPortError` for the caller to surface as
/// `PortUnavailable`.
pub fn open_virtual_output(name: &str) -> Result<MidiOutputConnection, MidiConnectionError> {
    #[cfg(not(target_os = "windows"))]
    {
        use midir::os::unix::VirtualOutput;

        let midi_out = MidiOutput::new("pitchgrid-bridge")
            .map_err(|e| MidiConnectionError::OutputInitError(e.to_string()))?;

        match midi_out.create_virtual(name) {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                log::warn!("virtual port creation failed for {:?}, falling back to exact-name discovery: {}", name, e);
            }
        }
    }

    match connect_existing_output_by_exact_name(name) {
        Some(result) => result,
        None => Err(MidiConnectionError::VirtualPortError(
            name.to_string(),
            "no virtual port support and no pre-existing port of that name".to_string(),
        )),
    }
}

/// Connects to an existing output port whose name matches `name` exactly
/// (not a substring match), for platforms where a virtual loopback port
/// must be pre-created outside this process.
fn connect_existing_output_by_exact_name(
    name: &str,
) -> Option<Result<MidiOutputConnection, MidiConnectionError>> {
    let midi_out = MidiOutput::new("pitchgrid-bridge").ok()?;
    let port = midi_out
        .ports()
        .into_iter()
        .find(|p| midi_out.port_name(p).is_ok_and(|n| n == name))?;

    log::info!("found pre-existing virtual output port {:?}, connecting", name);
    Some(
        midi_out
            .connect(&port, "pitchgrid-bridge-out")
            .map_err(|e| MidiConnectionError::VirtualPortError(name.to_string(), e.to_string())),
    )
}

/// Finds and opens an output port by substring match, for controllers that
/// accept SysEx programming on a separate port than their note input.
pub fn connect_programming_output(
    port_substring: &str,
) -> Result<MidiOutputConnection, MidiConnectionError> {
    let pattern = port_substring.to_lowercase();
    let midi_out = MidiOutput::new("pitchgrid-bridge-program")
        .map_err(|e| MidiConnectionError::OutputInitError(e.to_string()))?;

    let out_ports = midi_out.ports();
    let mut candidates: Vec<_> = out_ports
        .into_iter()
        .filter_map(|port| {
            let name = midi_out.port_name(&port).ok()?;
            name.to_lowercase()
                .contains(&pattern)
                .then_some((name, port))
        })
        .collect();
    candidates.sort_by_key(|(name, _)| name.len());

    let (port_name, port) = candidates
        .into_iter()
        .next()
        .ok_or_else(|| MidiConnectionError::PortNotFound(port_substring.to_string()))?;

    log::info!("controller programming output port matched: {}", port_name);

    midi_out
        .connect(&port, "pitchgrid-bridge-program-out")
        .map_err(|e| MidiConnectionError::ConnectionError(e.to_string()))
}

/// Lists all available MIDI input ports, for the UI-facing discovery operation.
pub fn list_input_ports() -> Result<Vec<String>, MidiConnectionError> {
    let midi_in = MidiInput::new("pitchgrid-bridge-list")
        .map_err(|e| MidiConnectionError::InputInitError(e.to_string()))?;

    Ok(midi_in
        .ports()
        .iter()
        .filter_map(|port| midi_in.port_name(port).ok())
        .collect())
}

/// Lists all available MIDI output ports.
pub fn list_output_ports() -> Result<Vec<String>, MidiConnectionError> {
    let midi_out = MidiOutput::new("pitchgrid-bridge-list")
        .map_err(|e| MidiConnectionError::OutputInitError(e.to_string()))?;

    Ok(midi_out
        .ports()
        .iter()
        .filter_map(|port| midi_out.port_name(port).ok())
        .collect())
}

/// True if some live input port's name contains `port_substring` (case
/// insensitive). Used by the discovery operation to report which known
/// descriptors currently have a connectable controller plugged in.
pub fn input_port_available(port_substring: &str) -> bool {
    let pattern = port_substring.to_lowercase();
    list_input_ports()
        .map(|ports| {
            ports
                .iter()
                .any(|name| name.to_lowercase().contains(&pattern))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_ports_does_not_panic() {
        let _ = list_input_ports();
        let _ = list_output_ports();
    }

    #[test]
    fn input_port_available_false_for_nonsense_pattern() {
        assert!(!input_port_available("definitely-not-a-real-midi-device-xyz"));
    }

    #[test]
    fn exact_name_fallback_none_when_no_matching_port_exists() {
        assert!(connect_existing_output_by_exact_name("definitely-not-a-real-midi-device-xyz").is_none());
    }
}
