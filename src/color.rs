//! Pad coloring schemes.
//!
//! The original implementation models coloring schemes and layout
//! strategies as a common inheritance hierarchy; here that becomes a small
//! tagged-variant trait, matched the way `layout::LayoutConfig` is matched
//! rather than a class hierarchy. This core ships one scheme; descriptors
//! naming a different `params.color` scheme fall back to it, since choosing
//! additional schemes is presentation policy for the UI layer, not the
//! remap core.

use crate::mos::Mos;

pub trait ColorScheme {
    fn compute_color(&self, degree: i32, mos: &Mos) -> String;
}

/// Colors a pad by its scale-degree offset from root, cycling an HSL hue
/// wheel with one step per scale degree.
pub struct DegreeWheel;

impl ColorScheme for DegreeWheel {
    fn compute_color(&self, degree: i32, mos: &Mos) -> String {
        if mos.n <= 0 {
            return "hsl(0, 0%, 50%)".to_string();
        }
        let hue = (degree.rem_euclid(mos.n) as f64 / mos.n as f64) * 360.0;
        format!("hsl({:.0}, 70%, 50%)", hue)
    }
}

/// Resolves a descriptor's `params.color` scheme name to a `ColorScheme`.
/// Unrecognized or absent names fall back to `DegreeWheel`.
pub fn scheme_for(_name: Option<&str>) -> Box<dyn ColorScheme + Send + Sync> {
    Box::new(DegreeWheel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_degree_is_hue_zero() {
        let mos = Mos::from_params(12, 7, 0, 1200.0, 700.0, 1);
        let scheme = scheme_for(None);
        assert_eq!(scheme.compute_color(0, &mos), "hsl(0, 70%, 50%)");
    }

    #[test]
    fn negative_degree_wraps_into_range() {
        let mos = Mos::from_params(12, 7, 0, 1200.0, 700.0, 1);
        let scheme = scheme_for(None);
        let color = scheme.compute_color(-1, &mos);
        assert!(color.starts_with("hsl("));
    }
}
