//! Moment-of-Symmetry (MOS) scale state.
//!
//! A MOS scale is generated by repeatedly stacking a generator interval
//! within a period (the equave) until the resulting scale has exactly two
//! step sizes, large (`L`) and small (`S`). This module tracks the current
//! scale's structural parameters and derives the integer period/generator
//! components consumed by the layout calculator.
//!
//! Naming follows the conventions of the MOS libraries this module is
//! modeled on: `a`/`b` are the period and generator expressed in minimal
//! steps, `n_large`/`n_small` are how many large/small steps the scale has,
//! `v_gen` is the generator's coordinate vector in the large/small step
//! alphabet.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vec2i {
    pub x: i32,
    pub y: i32,
}

impl Vec2i {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl std::ops::Sub for Vec2i {
    type Output = Vec2i;
    fn sub(self, rhs: Vec2i) -> Vec2i {
        Vec2i::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl std::ops::Mul<i32> for Vec2i {
    type Output = Vec2i;
    fn mul(self, rhs: i32) -> Vec2i {
        Vec2i::new(self.x * rhs, self.y * rhs)
    }
}

/// A single moment-of-symmetry scale instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Mos {
    /// Period expressed in minimal steps (e.g. 12 for an octave in 12-EDO).
    pub a: i32,
    /// Generator expressed in minimal steps (e.g. 7 for a fifth in 12-EDO).
    pub b: i32,
    /// Brightness-mode offset; shifts which scale degree is treated as root.
    pub mode: i32,
    /// Total scale degrees per period.
    pub n: i32,
    pub n_large: i32,
    pub n_small: i32,
    /// The generator's coordinate in the (large, small) step alphabet.
    pub v_gen: Vec2i,
    pub generator_cents: f64,
    pub equave_cents: f64,
    pub repetitions: u32,
}

impl Mos {
    /// Builds a MOS directly from its already-known structural parameters.
    /// Used by tests and by configuration that names an exact EDO/MOS pair
    /// rather than deriving one from a continued-fraction search.
    #[allow(clippy::too_many_arguments)]
    pub fn from_params(
        a: i32,
        b: i32,
        mode: i32,
        equave_cents: f64,
        generator_cents: f64,
        repetitions: u32,
    ) -> Self {
        let (n_large, n_small, v_gen) = decompose(a, b);
        Mos {
            a,
            b,
            mode,
            n: n_large + n_small,
            n_large,
            n_small,
            v_gen,
            generator_cents,
            equave_cents,
            repetitions,
        }
    }

    /// Derives a MOS by walking the Stern-Brocot tree that brackets
    /// `generator_cents / equave_cents` to `depth` mediant steps. Each step
    /// descends toward the true generator ratio; the resulting left/right
    /// neighbors give the period/generator pair in minimal steps for a MOS
    /// of that depth. Mirrors the original `sx.MOS.fromG` construction.
    pub fn from_g(
        depth: u32,
        mode: i32,
        generator_cents: f64,
        equave_cents: f64,
        repetitions: u32,
    ) -> Self {
        let ratio = (generator_cents / equave_cents).rem_euclid(1.0);
        let (a, b) = stern_brocot_bracket(ratio, depth);
        Self::from_params(a, b, mode, equave_cents, generator_cents, repetitions)
    }

    /// Searches increasing depths (up to `self_depth + 20`) for an
    /// EDO-compatible MOS whose note count matches `steps`, and returns the
    /// resulting enharmonic vector. Mirrors the original tuning module's
    /// EDO-compatibility search.
    pub fn enharmonic_vector(&self, self_depth: u32, steps: i32) -> Option<Vec2i> {
        for search_depth in self_depth..=(self_depth + 20) {
            let edo_mos = Mos::from_g(
                search_depth,
                self.mode,
                self.generator_cents,
                self.equave_cents,
                1,
            );
            if edo_mos.n > steps {
                break;
            }
            let edo_gen_steps = edo_mos.v_gen.x + edo_mos.v_gen.y;
            if edo_mos.n == steps {
                let vector =
                    self.v_gen * edo_mos.n - Vec2i::new(self.a, self.b) * edo_gen_steps;
                return Some(vector);
            }
        }
        None
    }

    /// Natural-lattice coordinate to scale-degree index, for descriptors
    /// whose pads sit directly on scale degrees rather than being routed
    /// through a separate note-assignment expression.
    pub fn coord_to_index(&self, coords: &[(i32, i32)]) -> HashMap<(i32, i32), usize> {
        let mut map = HashMap::with_capacity(coords.len());
        for (idx, coord) in coords.iter().enumerate() {
            map.entry(*coord).or_insert(idx);
        }
        map
    }

    /// MIDI step offset of natural coordinate `(nx, ny)` from the root,
    /// per the isomorphic layout formula.
    pub fn degree_offset(&self, nx: i32, ny: i32) -> i32 {
        nx * self.b - ny * self.a + self.mode
    }
}

/// Decomposes a period/generator pair `(a, b)` (assumed coprime) into large
/// and small step counts via their continued-fraction convergents, and a
/// generator vector expressed in that (large, small) alphabet.
fn decompose(a: i32, b: i32) -> (i32, i32, Vec2i) {
    if a <= 0 || b <= 0 {
        return (a.max(0), 0, Vec2i::new(b, 0));
    }
    let convergents = continued_fraction_convergents(b as i64, a as i64, 32);
    let (n_large, n_small) = match convergents.len() {
        0 => (a, 0),
        1 => (convergents[0].1 as i32, a),
        _ => {
            let last = convergents[convergents.len() - 1];
            let prev = convergents[convergents.len() - 2];
            (last.1 as i32, prev.1 as i32)
        }
    };
    (n_large, n_small, Vec2i::new(n_large, n_small))
}

/// Standard continued-fraction convergents `p_k/q_k` of `num/den` (den != 0),
/// up to `max_terms` terms.
fn continued_fraction_convergents(num: i64, den: i64, max_terms: usize) -> Vec<(i64, i64)> {
    let mut terms = Vec::new();
    let (mut p_prev, mut p_cur) = (1i64, 0i64);
    let (mut q_prev, mut q_cur) = (0i64, 1i64);
    let (mut n, mut d) = (num, den);
    for _ in 0..max_terms {
        if d == 0 {
            break;
        }
        let quotient = n / d;
        let p_next = quotient * p_cur + p_prev;
        let q_next = quotient * q_cur + q_prev;
        terms.push((p_next, q_next));
        p_prev = p_cur;
        p_cur = p_next;
        q_prev = q_cur;
        q_cur = q_next;
        let remainder = n % d;
        n = d;
        d = remainder;
    }
    terms
}

/// Brackets `ratio` (in `[0, 1)`) between Stern-Brocot neighbors after
/// `depth` mediant steps, and returns `(period, generator)` as the sum and
/// numerator-sum of the final left/right fractions.
fn stern_brocot_bracket(ratio: f64, depth: u32) -> (i32, i32) {
    let (mut lp, mut lq) = (0i64, 1i64);
    let (mut rp, mut rq) = (1i64, 1i64);
    for _ in 0..depth.max(1) {
        let mp = lp + rp;
        let mq = lq + rq;
        let mediant = mp as f64 / mq as f64;
        if ratio < mediant {
            rp = mp;
            rq = mq;
        } else {
            lp = mp;
            lq = mq;
        }
    }
    let period = (lq + rq) as i32;
    let generator = (lp + rp) as i32;
    (period.max(1), generator.max(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_params_chromatic_12edo() {
        let mos = Mos::from_params(12, 7, 0, 1200.0, 700.0, 1);
        assert_eq!(mos.a, 12);
        assert_eq!(mos.b, 7);
        assert_eq!(mos.n, mos.n_large + mos.n_small);
        assert_eq!(mos.degree_offset(3, 2), 3 * 7 - 2 * 12);
    }

    #[test]
    fn from_g_produces_consistent_note_count() {
        let mos = Mos::from_g(5, 0, 700.0, 1200.0, 1);
        assert_eq!(mos.n, mos.n_large + mos.n_small);
        assert!(mos.a > 0);
    }

    #[test]
    fn from_g_depth_increases_note_count_monotonically_eventually() {
        let shallow = Mos::from_g(2, 0, 696.6, 1200.0, 1);
        let deep = Mos::from_g(8, 0, 696.6, 1200.0, 1);
        assert!(deep.a >= shallow.a);
    }

    #[test]
    fn enharmonic_vector_none_when_never_compatible() {
        let mos = Mos::from_params(5, 3, 0, 1200.0, 700.0, 1);
        // An absurdly small target step count will never be matched.
        assert_eq!(mos.enharmonic_vector(1, 1), None);
    }

    #[test]
    fn coord_to_index_first_occurrence_wins() {
        let mos = Mos::from_params(12, 7, 0, 1200.0, 700.0, 1);
        let coords = [(0, 0), (1, 0), (0, 0)];
        let map = mos.coord_to_index(&coords);
        assert_eq!(map[&(0, 0)], 0);
        assert_eq!(map[&(1, 0)], 1);
    }
}
