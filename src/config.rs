//! Controller descriptor schema and loader.
//!
//! A descriptor is a YAML file describing one physical (or virtual,
//! keyboard-emulated) controller: its pad grid geometry, how MIDI note
//! numbers map onto logical coordinates, and — for controllers with
//! programmable pad lights — the SysEx templates and ACK protocol used to
//! drive them. Descriptors are loaded from a directory; a malformed file is
//! skipped with a warning rather than aborting the whole scan.

use crate::error::BridgeError;
use crate::expr::{self, Expr, HelperDef};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One user-defined helper function available to the arithmetic fields,
/// e.g. `boardIndex: { params: [n], expr: "n / 16" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperSpec {
    pub params: Vec<String>,
    pub expr: String,
}

/// Raw ACK response table entry: a status byte value mapped to an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseTypeEntry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: u8,
    #[serde(rename = "Action")]
    pub action: AckAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum AckAction {
    Next,
    Abort,
    Delay { ms: u64 },
}

/// Flow-control configuration for devices that gate SysEx programming
/// behind an ACK response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AckConfig {
    #[serde(rename = "Timeout")]
    pub timeout_ms: u64,
    /// Manual override for the status byte's index in the response SysEx.
    /// When absent, the driver derives it from the response template.
    #[serde(rename = "ResponsePosition")]
    pub response_position: Option<usize>,
    #[serde(rename = "ResponseTypes")]
    pub response_types: Vec<ResponseTypeEntry>,
}

impl Default for AckConfig {
    fn default() -> Self {
        AckConfig {
            timeout_ms: 2000,
            response_position: None,
            response_types: Vec::new(),
        }
    }
}

/// Byte-level templates used to program a controller's pad notes/colors
/// over SysEx. Each template is a list of tokens: either a literal byte
/// (`"0xF0"`) or a named placeholder (`"NOTE"`, `"CHANNEL"`, `"COLOR"`,
/// `"STATUS"`, ...) substituted at send time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SysexTemplates {
    #[serde(rename = "SetPadNoteAndChannel")]
    pub set_pad_note_and_channel: Option<Vec<String>>,
    #[serde(rename = "SetPadNoteAndChannelResponse")]
    pub set_pad_note_and_channel_response: Option<Vec<String>>,
    #[serde(rename = "SetPadColor")]
    pub set_pad_color: Option<Vec<String>>,
    #[serde(rename = "SetPadColorResponse")]
    pub set_pad_color_response: Option<Vec<String>>,
    #[serde(rename = "SetPadNotesBulk")]
    pub set_pad_notes_bulk: Option<Vec<String>>,
    #[serde(rename = "SetPadColorsBulk")]
    pub set_pad_colors_bulk: Option<Vec<String>>,
}

impl SysexTemplates {
    /// True when the descriptor declared none of these fields at all
    /// (as opposed to a descriptor that sets, say, only `SetPadColor`).
    fn is_empty(&self) -> bool {
        self.set_pad_note_and_channel.is_none()
            && self.set_pad_note_and_channel_response.is_none()
            && self.set_pad_color.is_none()
            && self.set_pad_color_response.is_none()
            && self.set_pad_notes_bulk.is_none()
            && self.set_pad_colors_bulk.is_none()
    }
}

/// Raw, as-deserialized controller descriptor. See `CompiledDescriptor` for
/// the validated form the rest of the crate actually consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerDescriptor {
    #[serde(rename = "DeviceName")]
    pub device_name: String,

    #[serde(rename = "NumRows")]
    pub num_rows: u32,
    #[serde(rename = "FirstRowIdx")]
    pub first_row_idx: i32,
    #[serde(rename = "RowLengths")]
    pub row_lengths: Vec<u32>,
    #[serde(default, rename = "RowOffsets")]
    pub row_offsets: Vec<f64>,

    #[serde(rename = "HorizonToRowAngle")]
    pub horizon_to_row_angle: f64,
    #[serde(rename = "RowToColAngle")]
    pub row_to_col_angle: f64,
    #[serde(rename = "xSpacing")]
    pub x_spacing: f64,
    #[serde(rename = "ySpacing")]
    pub y_spacing: f64,

    #[serde(default, rename = "isMPE")]
    pub is_mpe: bool,
    #[serde(default, rename = "hasGlobalPitchBend")]
    pub has_global_pitch_bend: bool,

    #[serde(default, skip_serializing_if = "Option::is_none", rename = "ControllerMIDIOutput")]
    pub controller_midi_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "ControllerMIDIInput")]
    pub controller_midi_input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "virtualMIDIDeviceName")]
    pub virtual_midi_device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "defaultIsoRootCoordinate")]
    pub default_iso_root_coordinate: Option<(i32, i32)>,

    /// `x` coordinate as a function of raw controller note number `n`.
    #[serde(rename = "noteToCoordX")]
    pub note_to_coord_x: String,
    /// `y` coordinate as a function of raw controller note number `n`.
    #[serde(rename = "noteToCoordY")]
    pub note_to_coord_y: String,
    /// Controller-native note number as a function of `(x, y)`. When
    /// absent, the coordinator's fallback `x + 16*y` is used instead.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "noteAssign")]
    pub note_assign: Option<String>,
    /// Controller-native channel as a function of `(x, y)`.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "channelAssign")]
    pub channel_assign: Option<String>,
    #[serde(default)]
    pub helpers: HashMap<String, HelperSpec>,

    #[serde(flatten)]
    pub sysex_templates: SysexTemplates,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "ACKBasedMIDIMessaging")]
    pub ack_based_midi_messaging: Option<AckConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "MessageDelayMs")]
    pub message_delay_ms: Option<u64>,

    /// Pads whose display label is fixed rather than computed from tuning
    /// (e.g. permanently-labeled function keys), keyed by `"lx,ly"`.
    #[serde(default, rename = "fixedLabels")]
    pub fixed_labels: HashMap<String, String>,

    #[serde(default)]
    pub params: HashMap<String, serde_yaml::Value>,
}

/// Input port substring that means "this controller has no MIDI port"
/// (e.g. a computer-keyboard emulated controller).
fn is_none_sentinel(s: &str) -> bool {
    s.eq_ignore_ascii_case("none")
}

/// A descriptor after its arithmetic fields have been parsed and
/// validated, and its pad grid expanded to concrete logical/physical
/// coordinates.
#[derive(Debug, Clone)]
pub struct CompiledDescriptor {
    pub raw: ControllerDescriptor,
    pub note_to_coord_x: Expr,
    pub note_to_coord_y: Expr,
    pub note_assign: Option<Expr>,
    pub channel_assign: Option<Expr>,
    pub helpers: HashMap<String, HelperDef>,
    /// `(lx, ly, phys_x, phys_y)` for every pad in the grid.
    pub pads: Vec<(i32, i32, f64, f64)>,
    /// Parsed SysEx programming templates and ACK protocol, if the
    /// descriptor declares any.
    pub sysex: Option<crate::sysex::CompiledSysex>,
}

impl CompiledDescriptor {
    pub fn compile(raw: ControllerDescriptor, source: &str) -> Result<Self, BridgeError> {
        let invalid = |reason: String| BridgeError::DescriptorInvalid {
            path: source.to_string(),
            reason,
        };

        let note_to_coord_x = expr::parse(&raw.note_to_coord_x).map_err(|e| invalid(e.to_string()))?;
        let note_to_coord_y = expr::parse(&raw.note_to_coord_y).map_err(|e| invalid(e.to_string()))?;
        let note_assign = raw
            .note_assign
            .as_deref()
            .map(expr::parse)
            .transpose()
            .map_err(|e| invalid(e.to_string()))?;
        let channel_assign = raw
            .channel_assign
            .as_deref()
            .map(expr::parse)
            .transpose()
            .map_err(|e| invalid(e.to_string()))?;

        let mut helpers = HashMap::with_capacity(raw.helpers.len());
        for (name, spec) in &raw.helpers {
            let body = expr::parse(&spec.expr).map_err(|e| invalid(e.to_string()))?;
            helpers.insert(
                name.clone(),
                HelperDef {
                    params: spec.params.clone(),
                    body,
                },
            );
        }
        expr::validate_helpers(&helpers).map_err(|e| invalid(e.to_string()))?;

        let pads = expand_grid(&raw);
        if pads.is_empty() {
            return Err(invalid("descriptor defines zero pads".to_string()));
        }

        let sysex_templates = if raw.sysex_templates.is_empty() {
            None
        } else {
            Some(&raw.sysex_templates)
        };
        let sysex = crate::sysex::compile_sysex(sysex_templates, raw.ack_based_midi_messaging.as_ref())
            .map_err(invalid)?;

        Ok(CompiledDescriptor {
            raw,
            note_to_coord_x,
            note_to_coord_y,
            note_assign,
            channel_assign,
            helpers,
            pads,
            sysex,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.raw.device_name
    }

    pub fn input_port_substring(&self) -> Option<&str> {
        self.raw
            .controller_midi_input
            .as_deref()
            .filter(|s| !is_none_sentinel(s))
    }

    pub fn output_port_substring(&self) -> Option<&str> {
        self.raw
            .controller_midi_output
            .as_deref()
            .filter(|s| !is_none_sentinel(s))
    }

    pub fn virtual_port_name(&self) -> &str {
        self.raw
            .virtual_midi_device_name
            .as_deref()
            .unwrap_or("PitchGrid Mapper")
    }
}

/// Expands the descriptor's row-based grid declaration into concrete logical
/// (lx, ly) and physical (phys_x, phys_y) coordinates for every pad. Rows
/// are tilted relative to the horizon by `horizon_to_row_angle`; columns
/// within a row are tilted relative to the row by `row_to_col_angle`.
fn expand_grid(raw: &ControllerDescriptor) -> Vec<(i32, i32, f64, f64)> {
    let mut pads = Vec::new();
    let row_angle = raw.horizon_to_row_angle.to_radians();
    let col_angle = raw.row_to_col_angle.to_radians();

    for row in 0..raw.num_rows {
        let ly = raw.first_row_idx + row as i32;
        let length = raw
            .row_lengths
            .get(row as usize)
            .copied()
            .unwrap_or_else(|| raw.row_lengths.last().copied().unwrap_or(0));
        let offset = raw.row_offsets.get(row as usize).copied().unwrap_or(0.0);

        let row_base_x = row as f64 * raw.y_spacing * row_angle.cos();
        let row_base_y = row as f64 * raw.y_spacing * row_angle.sin();

        for col in 0..length {
            let lx = col as i32;
            let phys_x = row_base_x + offset + col as f64 * raw.x_spacing * col_angle.cos();
            let phys_y = row_base_y + col as f64 * raw.x_spacing * col_angle.sin();
            pads.push((lx, ly, phys_x, phys_y));
        }
    }
    pads
}

/// Resolves the directory descriptors are loaded from: an explicit override
/// (CLI flag or `PITCHGRID_DESCRIPTORS`) takes precedence over the platform
/// config directory.
pub fn default_descriptor_dir() -> PathBuf {
    if let Ok(path) = std::env::var("PITCHGRID_DESCRIPTORS") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pitchgrid-bridge")
        .join("controllers")
}

/// Loads every `*.yaml`/`*.yml` descriptor in `dir`. Malformed files are
/// logged and skipped; a missing directory yields an empty list rather than
/// an error (first run, nothing configured yet).
pub fn load_descriptors(dir: &Path) -> Vec<CompiledDescriptor> {
    log::info!("loading controller descriptors from {:?}", dir);

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("descriptor directory {:?} not readable: {}", dir, e);
            return Vec::new();
        }
    };

    let mut descriptors = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
        if !is_yaml {
            continue;
        }

        match load_one(&path) {
            Ok(descriptor) => {
                log::info!(
                    "loaded descriptor '{}' ({} pads) from {:?}",
                    descriptor.device_name(),
                    descriptor.pads.len(),
                    path
                );
                descriptors.push(descriptor);
            }
            Err(e) => log::warn!("skipping descriptor {:?}: {}", path, e),
        }
    }
    descriptors
}

fn load_one(path: &Path) -> Result<CompiledDescriptor, BridgeError> {
    let path_str = path.to_string_lossy().to_string();
    let invalid = |reason: String| BridgeError::DescriptorInvalid {
        path: path_str.clone(),
        reason,
    };

    let contents = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
    let raw: ControllerDescriptor =
        serde_yaml::from_str(&contents).map_err(|e| invalid(e.to_string()))?;
    CompiledDescriptor::compile(raw, &path_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
DeviceName: "Test Grid"
NumRows: 2
FirstRowIdx: 0
RowLengths: [4, 4]
RowOffsets: [0.0, 0.5]
HorizonToRowAngle: 90.0
RowToColAngle: 0.0
xSpacing: 1.0
ySpacing: 1.0
isMPE: false
hasGlobalPitchBend: false
noteToCoordX: "n % 16"
noteToCoordY: "n / 16"
noteAssign: "x + y*16"
channelAssign: "0"
"#
    }

    #[test]
    fn compiles_minimal_descriptor() {
        let raw: ControllerDescriptor = serde_yaml::from_str(sample_yaml()).unwrap();
        let compiled = CompiledDescriptor::compile(raw, "test").unwrap();
        assert_eq!(compiled.device_name(), "Test Grid");
        assert_eq!(compiled.pads.len(), 8);
        assert_eq!(compiled.virtual_port_name(), "PitchGrid Mapper");
    }

    #[test]
    fn rejects_bad_expression() {
        let mut raw: ControllerDescriptor = serde_yaml::from_str(sample_yaml()).unwrap();
        raw.note_to_coord_x = "x +".to_string();
        assert!(CompiledDescriptor::compile(raw, "test").is_err());
    }

    #[test]
    fn none_sentinel_treated_as_absent_port() {
        let mut raw: ControllerDescriptor = serde_yaml::from_str(sample_yaml()).unwrap();
        raw.controller_midi_input = Some("none".to_string());
        let compiled = CompiledDescriptor::compile(raw, "test").unwrap();
        assert_eq!(compiled.input_port_substring(), None);
    }

    #[test]
    fn load_descriptors_skips_malformed_and_continues(
    ) {
        let tmp = std::env::temp_dir().join(format!(
            "pitchgrid-test-descriptors-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(tmp.join("good.yaml"), sample_yaml()).unwrap();
        std::fs::write(tmp.join("bad.yaml"), "not: [valid, descriptor").unwrap();

        let descriptors = load_descriptors(&tmp);
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].device_name(), "Test Grid");

        std::fs::remove_dir_all(&tmp).ok();
    }
}
