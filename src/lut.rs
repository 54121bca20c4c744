// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
C2: LUT Interface.

A pure-function evaluator over a precomputed atmospheric-transmission
grid. The grid itself (populating it from a radiative-transfer model) is
out of scope (spec.md §1); this module only specifies and implements the
lookup contract: given physical atmospheric parameters plus CCD and
geometry, return `I0`, `I1/I0`, and their log-derivatives.

Grounded in idiom on the teacher's `model` module's use of `ndarray` grids
addressed by precomputed indices, generalised from MWA frequency/pointing
axes to the FGCM LUT's (filter, lnPwv, O3, lnTau, alpha, secZ, ccd, pmb)
axes.
*/

use std::sync::atomic::{AtomicU64, Ordering};

/// The four atmospheric partial derivatives the engine's gradient needs,
/// in a fixed order: `(d/d(lnPwv), d/d(O3), d/d(lnTau), d/d(alpha))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AtmosphereDerivatives {
    pub d_ln_pwv: f64,
    pub d_o3: f64,
    pub d_ln_tau: f64,
    pub d_alpha: f64,
}

/// One axis of the LUT grid: a monotonically increasing set of sample
/// points the interpolator clamps to.
#[derive(Debug, Clone)]
pub struct LutAxis {
    pub values: Vec<f64>,
}

impl LutAxis {
    pub fn new(values: Vec<f64>) -> Self {
        debug_assert!(values.windows(2).all(|w| w[0] < w[1]), "LUT axis must be sorted");
        Self { values }
    }

    /// Clamp `x` to this axis's range, returning the clamped value and
    /// whether clamping occurred (spec.md §4.2: "out-of-range is clamped
    /// to the nearest edge and noted in a diagnostic counter, not an
    /// error").
    fn clamp(&self, x: f64) -> (f64, bool) {
        let lo = *self.values.first().expect("LUT axis must be non-empty");
        let hi = *self.values.last().expect("LUT axis must be non-empty");
        if x < lo {
            (lo, true)
        } else if x > hi {
            (hi, true)
        } else {
            (x, false)
        }
    }
}

/// The atmospheric LUT: a read-only grid of `I0`, `I1` and their
/// log-derivatives, addressable by `(filterIndex, lnPwv, O3, lnTau,
/// alpha, secZ, ccdIndex, pmb)`.
///
/// This implementation models each call as a smooth parametric function
/// of the six continuous axes rather than a literal N-dimensional grid
/// with piecewise interpolation, since the grid-population code is out of
/// scope (spec.md §1): the interpolation *contract* (clamped inputs,
/// stable indices, pure evaluation) is what this crate owns, not any
/// particular radiative-transfer model. Real deployments substitute a
/// genuine interpolated grid behind the same `LutInterface` trait.
pub struct Lut {
    pub ln_pwv_axis: LutAxis,
    pub o3_axis: LutAxis,
    pub ln_tau_axis: LutAxis,
    pub alpha_axis: LutAxis,
    pub sec_z_axis: LutAxis,
    pub pmb_axis: LutAxis,
    n_ccd: usize,
    n_filters: usize,
    /// Count of lookups that required clamping any input axis.
    clamp_count: AtomicU64,
    /// When set, every lookup returns this constant `I0` with zero `I1`
    /// and zero derivatives, bypassing the parametric model entirely.
    /// Used to build the trivial LUT fixture from spec.md §8's seed test
    /// scenario ("a LUT returning I0=1, I1/I0=0").
    constant_i0: Option<f64>,
}

/// Interpolation descriptor returned by `getIndices`: which grid cell a
/// query landed in, post-clamping. Opaque beyond what `Lut` itself needs;
/// exists so `I0`/`I1`/`logDerivatives` share one evaluation per query
/// instead of repeating the axis search each time (spec.md §4.2 API
/// shape: `getIndices` then `I0`/`I1`/`logDerivatives`).
#[derive(Debug, Clone, Copy)]
pub struct LutQuery {
    filter_index: usize,
    ln_pwv: f64,
    o3: f64,
    ln_tau: f64,
    alpha: f64,
    sec_z: f64,
    ccd_index: usize,
    pmb: f64,
}

impl Lut {
    pub fn new(
        ln_pwv_axis: LutAxis,
        o3_axis: LutAxis,
        ln_tau_axis: LutAxis,
        alpha_axis: LutAxis,
        sec_z_axis: LutAxis,
        pmb_axis: LutAxis,
        n_ccd: usize,
        n_filters: usize,
    ) -> Self {
        Self {
            ln_pwv_axis,
            o3_axis,
            ln_tau_axis,
            alpha_axis,
            sec_z_axis,
            pmb_axis,
            n_ccd,
            n_filters,
            clamp_count: AtomicU64::new(0),
            constant_i0: None,
        }
    }

    /// Build a LUT that returns a fixed `I0` (and zero `I1`, zero
    /// derivatives) everywhere, ignoring the physical axes entirely.
    pub fn new_constant(axes_like: &Lut, i0: f64) -> Self {
        Self {
            ln_pwv_axis: axes_like.ln_pwv_axis.clone(),
            o3_axis: axes_like.o3_axis.clone(),
            ln_tau_axis: axes_like.ln_tau_axis.clone(),
            alpha_axis: axes_like.alpha_axis.clone(),
            sec_z_axis: axes_like.sec_z_axis.clone(),
            pmb_axis: axes_like.pmb_axis.clone(),
            n_ccd: axes_like.n_ccd,
            n_filters: axes_like.n_filters,
            clamp_count: AtomicU64::new(0),
            constant_i0: Some(i0),
        }
    }

    /// Number of lookups since construction that clamped at least one
    /// input to its axis bounds (spec.md §4.2 diagnostic counter).
    pub fn clamp_count(&self) -> u64 {
        self.clamp_count.load(Ordering::Relaxed)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn get_indices(
        &self,
        filter_index: usize,
        ln_pwv: f64,
        o3: f64,
        ln_tau: f64,
        alpha: f64,
        sec_z: f64,
        ccd_index: usize,
        pmb: f64,
    ) -> LutQuery {
        assert!(filter_index < self.n_filters, "filter index out of range");
        assert!(ccd_index < self.n_ccd, "CCD index out of range");

        let (ln_pwv, c1) = self.ln_pwv_axis.clamp(ln_pwv);
        let (o3, c2) = self.o3_axis.clamp(o3);
        let (ln_tau, c3) = self.ln_tau_axis.clamp(ln_tau);
        let (alpha, c4) = self.alpha_axis.clamp(alpha);
        let (sec_z, c5) = self.sec_z_axis.clamp(sec_z);
        let (pmb, c6) = self.pmb_axis.clamp(pmb);
        if c1 || c2 || c3 || c4 || c5 || c6 {
            self.clamp_count.fetch_add(1, Ordering::Relaxed);
        }

        LutQuery { filter_index, ln_pwv, o3, ln_tau, alpha, sec_z, ccd_index, pmb }
    }

    /// Zeroth-moment transmission integral.
    pub fn i0(&self, q: LutQuery) -> f64 {
        if let Some(i0) = self.constant_i0 {
            return i0;
        }
        let tau_term = (-q.ln_tau.exp() * q.sec_z.powf(q.alpha)).exp();
        let o3_term = (-0.02 * q.o3 * q.sec_z).exp();
        let pwv_term = (-0.01 * q.ln_pwv.exp() * q.sec_z).exp();
        let pressure_term = 1.0 + 1e-4 * (q.pmb - 775.0);
        let filter_term = 1.0 - 0.001 * q.filter_index as f64 - 0.0005 * q.ccd_index as f64;
        (tau_term * o3_term * pwv_term * pressure_term * filter_term).clamp(1e-12, 1.0)
    }

    /// `I1 / I0`, the effective-wavelength offset driving the chromatic
    /// correction (the Glossary's `I10`).
    pub fn i1_over_i0(&self, q: LutQuery) -> f64 {
        if self.constant_i0.is_some() {
            return 0.0;
        }
        -0.02 * q.ln_tau.exp() * q.sec_z.powf(q.alpha) - 0.01 * q.ln_pwv.exp() * q.sec_z * 0.1
    }

    /// Partial derivatives of `L = 2.5 log10(I0)` w.r.t. the four
    /// atmospheric fit parameters, via analytic differentiation of `i0`
    /// above (spec.md §4.2 `logDerivatives`).
    pub fn log_derivatives(&self, q: LutQuery) -> AtmosphereDerivatives {
        if self.constant_i0.is_some() {
            return AtmosphereDerivatives { d_ln_pwv: 0.0, d_o3: 0.0, d_ln_tau: 0.0, d_alpha: 0.0 };
        }
        let mag_const = crate::constants::MAG_CONSTANT;
        // d(ln I0)/d(x) for each param, from the closed form in `i0`.
        let d_ln_i0_d_ln_pwv = -0.01 * q.ln_pwv.exp() * q.sec_z;
        let d_ln_i0_d_o3 = -0.02 * q.sec_z;
        let d_ln_i0_d_ln_tau = -q.ln_tau.exp() * q.sec_z.powf(q.alpha);
        let d_ln_i0_d_alpha = -q.ln_tau.exp() * q.sec_z.powf(q.alpha) * q.sec_z.ln();

        AtmosphereDerivatives {
            d_ln_pwv: mag_const * d_ln_i0_d_ln_pwv,
            d_o3: mag_const * d_ln_i0_d_o3,
            d_ln_tau: mag_const * d_ln_i0_d_ln_tau,
            d_alpha: mag_const * d_ln_i0_d_alpha,
        }
    }

    /// Partial derivatives of the I1-induced chromatic term w.r.t. the
    /// same four atmospheric parameters (spec.md §4.2
    /// `logDerivativesI1`), used when propagating SED-slope-weighted
    /// corrections through the gradient.
    pub fn log_derivatives_i1(&self, q: LutQuery) -> AtmosphereDerivatives {
        if self.constant_i0.is_some() {
            return AtmosphereDerivatives { d_ln_pwv: 0.0, d_o3: 0.0, d_ln_tau: 0.0, d_alpha: 0.0 };
        }
        let d_ln_tau = -0.02 * q.ln_tau.exp() * q.sec_z.powf(q.alpha);
        let d_ln_pwv = -0.001 * q.ln_pwv.exp() * q.sec_z;
        AtmosphereDerivatives {
            d_ln_pwv,
            d_o3: 0.0,
            d_ln_tau,
            d_alpha: d_ln_tau * q.sec_z.ln(),
        }
    }

    /// Grid extents for bounds checking / diagnostics (spec.md §6: "Must
    /// expose grid extents for bounds checks").
    pub fn extents(&self) -> [(f64, f64); 6] {
        let ext = |axis: &LutAxis| (*axis.values.first().unwrap(), *axis.values.last().unwrap());
        [
            ext(&self.ln_pwv_axis),
            ext(&self.o3_axis),
            ext(&self.ln_tau_axis),
            ext(&self.alpha_axis),
            ext(&self.sec_z_axis),
            ext(&self.pmb_axis),
        ]
    }
}

/// A LUT whose `I0 = 1`, `I1/I0 = 0` and all derivatives are zero
/// everywhere in range. Used by the seed test scenario in spec.md §8
/// ("a LUT returning I0=1, I1/I0=0").
pub fn trivial_lut() -> Lut {
    let axis = || LutAxis::new(vec![-10.0, 10.0]);
    let physical = Lut::new(
        axis(),
        axis(),
        axis(),
        axis(),
        LutAxis::new(vec![1.0, 2.0]),
        LutAxis::new(vec![700.0, 800.0]),
        1,
        1,
    );
    Lut::new_constant(&physical, 1.0)
}
