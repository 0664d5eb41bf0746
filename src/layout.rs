//! Layout calculator: combines a controller descriptor and the current MOS
//! scale into the forward/reverse remap tables the hot MIDI thread reads.

use crate::config::CompiledDescriptor;
use crate::expr;
use crate::mos::Mos;
use std::collections::HashMap;

/// Forward table: logical coordinate -> output MIDI note.
pub type ForwardTable = HashMap<(i32, i32), u8>;
/// Reverse table: (channel, controller-native note) -> logical coordinate.
pub type ReverseTable = HashMap<(u8, u8), (i32, i32)>;

/// User-adjustable parameters layered on top of a descriptor's raw grid.
/// Transformations are cumulative: each `apply` advances these fields by a
/// delta rather than replacing them outright.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutConfig {
    /// Explicit root override. `None` falls back to the descriptor's
    /// `default_iso_root_coordinate`, then to `(0, 0)`.
    pub root: Option<(i32, i32)>,
    pub skew: i32,
    pub rotation_steps: i32,
    pub translation: (i32, i32),
    pub root_note: u8,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        LayoutConfig {
            root: None,
            skew: 0,
            rotation_steps: 0,
            translation: (0, 0),
            root_note: 60,
        }
    }
}

/// A single cumulative adjustment to a `LayoutConfig`.
#[derive(Debug, Clone, Copy)]
pub enum TransformKind {
    Translate(i32, i32),
    Rotate90,
    Skew(i32),
    SetRoot(i32, i32),
    Reset,
}

impl LayoutConfig {
    pub fn apply(&mut self, kind: TransformKind) {
        match kind {
            TransformKind::Translate(dx, dy) => {
                self.translation.0 += dx;
                self.translation.1 += dy;
            }
            TransformKind::Rotate90 => self.rotation_steps += 1,
            TransformKind::Skew(k) => self.skew += k,
            TransformKind::SetRoot(x, y) => self.root = Some((x, y)),
            TransformKind::Reset => *self = LayoutConfig::default(),
        }
    }

    /// Applies skew, then 90-degree-step rotation, then translation to a
    /// root-relative offset, producing a natural lattice coordinate. All
    /// operations are integer-exact so the lattice never develops rounding
    /// drift across repeated transformations.
    fn transform(&self, dx: i32, dy: i32) -> (i32, i32) {
        let (sx, sy) = (dx + self.skew * dy, dy);
        let (mut x, mut y) = (sx, sy);
        for _ in 0..self.rotation_steps.rem_euclid(4) {
            let (nx, ny) = (-y, x);
            x = nx;
            y = ny;
        }
        (x + self.translation.0, y + self.translation.1)
    }

    fn resolved_root(&self, descriptor: &CompiledDescriptor) -> (i32, i32) {
        self.root
            .or(descriptor.raw.default_iso_root_coordinate)
            .unwrap_or((0, 0))
    }

    /// Natural lattice coordinate for a logical pad, for status reporting.
    /// Shares the exact transform `build_tables` uses so a snapshot's
    /// reported coordinates never drift from what the tables encode.
    pub fn natural_coordinate(&self, descriptor: &CompiledDescriptor, lx: i32, ly: i32) -> (i32, i32) {
        let root = self.resolved_root(descriptor);
        self.transform(lx - root.0, ly - root.1)
    }
}

/// Builds the forward and reverse tables for the current
/// `(descriptor, mos, layout)` triple. Pads that fall outside the MIDI note
/// range on either side are simply omitted from the corresponding table.
pub fn build_tables(
    descriptor: &CompiledDescriptor,
    mos: &Mos,
    layout: &LayoutConfig,
) -> (ForwardTable, ReverseTable) {
    let root = layout.resolved_root(descriptor);
    let mut forward = ForwardTable::with_capacity(descriptor.pads.len());
    let mut reverse = ReverseTable::with_capacity(descriptor.pads.len());

    for &(lx, ly, _phys_x, _phys_y) in &descriptor.pads {
        let (nx, ny) = layout.transform(lx - root.0, ly - root.1);
        let degree = mos.degree_offset(nx, ny);
        let raw_note = layout.root_note as i32 + degree;
        if (0..=127).contains(&raw_note) {
            forward.insert((lx, ly), raw_note as u8);
        }

        let mut vars = HashMap::with_capacity(2);
        vars.insert("x".to_string(), lx as i64);
        vars.insert("y".to_string(), ly as i64);

        let ctl_note = match &descriptor.note_assign {
            Some(expr) => expr::eval(expr, &vars, &descriptor.helpers).ok(),
            // Coordinator fallback, per the descriptor-absence precedence
            // decision: note = lx + 16*ly.
            None => Some((lx + 16 * ly) as i64),
        };
        let channel = match &descriptor.channel_assign {
            Some(expr) => expr::eval(expr, &vars, &descriptor.helpers).ok(),
            None => Some(0),
        };

        if let (Some(note), Some(channel)) = (ctl_note, channel) {
            if (0..=127).contains(&note) && (0..=15).contains(&channel) {
                reverse.insert((channel as u8, note as u8), (lx, ly));
            }
        }
    }

    (forward, reverse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerDescriptor;

    fn linnstrument_like() -> CompiledDescriptor {
        let yaml = r#"
DeviceName: "LinnStrument-like"
NumRows: 8
FirstRowIdx: 0
RowLengths: [16, 16, 16, 16, 16, 16, 16, 16]
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
"#;
        let raw: ControllerDescriptor = serde_yaml::from_str(yaml).unwrap();
        CompiledDescriptor::compile(raw, "test").unwrap()
    }

    // Scenario S1: 12-EDO chromatic MOS, root=(0,0), root_note=60.
    // d = nx*b - ny*a + mode with (a,b) = (12,7), mode=0.
    #[test]
    fn scenario_s1_forward_table() {
        let descriptor = linnstrument_like();
        let mos = Mos::from_params(12, 7, 0, 1200.0, 700.0, 1);
        let layout = LayoutConfig::default();
        let (forward, _reverse) = build_tables(&descriptor, &mos, &layout);
        assert_eq!(forward[&(3, 2)], 57);
    }

    #[test]
    fn reverse_table_round_trips_note_assign() {
        let descriptor = linnstrument_like();
        let mos = Mos::from_params(12, 7, 0, 1200.0, 700.0, 1);
        let layout = LayoutConfig::default();
        let (_forward, reverse) = build_tables(&descriptor, &mos, &layout);
        // note_assign(3,2) = 3 + 2*16 = 35, channel_assign = 0
        assert_eq!(reverse[&(0, 35)], (3, 2));
    }

    #[test]
    fn translate_transform_shifts_degree_by_generator() {
        let descriptor = linnstrument_like();
        let mos = Mos::from_params(12, 7, 0, 1200.0, 700.0, 1);
        let mut layout = LayoutConfig::default();
        layout.apply(TransformKind::Translate(1, 0));
        let (forward, _reverse) = build_tables(&descriptor, &mos, &layout);
        // Translating by (1,0) in natural coordinates adds mos.b (7) to the
        // note at any given logical coordinate relative to the untranslated
        // table, since translation is applied after the root-relative
        // linear transform.
        assert_eq!(forward[&(3, 2)], 57 + 7);
    }

    #[test]
    fn reset_restores_default_layout() {
        let mut layout = LayoutConfig::default();
        layout.apply(TransformKind::Translate(5, 5));
        layout.apply(TransformKind::Rotate90);
        layout.apply(TransformKind::Reset);
        assert_eq!(layout, LayoutConfig::default());
    }

    #[test]
    fn pads_outside_midi_range_are_omitted() {
        let descriptor = linnstrument_like();
        let mos = Mos::from_params(12, 7, 0, 1200.0, 700.0, 1);
        let mut layout = LayoutConfig::default();
        layout.root_note = 0;
        layout.apply(TransformKind::Translate(-100, 0));
        let (forward, _reverse) = build_tables(&descriptor, &mos, &layout);
        assert!(forward.len() < descriptor.pads.len());
    }
}
