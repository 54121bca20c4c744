// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
C6: Chi-Squared Engine.

The core fitting kernel (spec.md §4.6), in two phases:

1. **Mag phase** (`compute_mag_std`): for each good observation, look up the
   atmosphere/instrument model from the LUT, apply the chromatic (SED-slope)
   correction, and commit `magStd` plus the inverse-variance-weighted
   per-(star,band) mean `magStdMean`/`magStdMeanNoChrom`/`magStdMeanErr`.
2. **Chi-squared/gradient phase** (`run`): accumulate chi-squared and, when
   requested, the analytic gradient, over disjoint `rayon` worker
   partitions of the good-observation list, folded back together in
   ascending partition order for deterministic, bit-reproducible results
   (SPEC_FULL.md §5, grounded in idiom on the teacher's
   `di_calibrate::calibrate_timeblocks` reduce pattern).

Grounded on `fgcmChisq.py`'s `FgcmChisq.__call__`/`_magWorker`/`_chisqWorker`.
The gradient itself is organised around the `GradientGroup` trait
(SPEC_FULL.md §4.6 "Polymorphism over gradient sub-ranges") rather than the
source's textually duplicated ordinary/reference accumulation blocks: one
`scatter` routine walks the observation list once per enabled group, the
only difference between the ordinary and reference passes being a
mean-correction factor (`errSummand`, 1 for reference) and which output
buffer it writes into.

This resolves the Open Question in SPEC_FULL.md §9.3: the source packs
ordinary gradient, ordinary touched-flags, reference gradient and reference
touched-flags into one `4*nFitPars` array addressed by a hand-added base
offset (`0`, `nFitPars`, `2*nFitPars`, `3*nFitPars`), and one call site
(the no-external-PWV PWV-intercept branch) forgets the `2*nFitPars` base
and aliases into the ordinary range. Here the four are simply four separate
arrays (`ChisqOutput::gradient`/`gradient_ref`/`touched`/`touched_ref`), so
there is no shared index space left for a forgotten offset to alias into.
*/

use std::cell::RefCell;

use ndarray::Array1;
use thiserror::Error;

use crate::config::FitConfig;
use crate::constants::{MAG_CONSTANT, SENTINEL_MAG, SENTINEL_THRESHOLD};
use crate::error::ConfigError;
use crate::flags::obj_flag;
use crate::gray::FgcmGrayInput;
use crate::lut::{AtmosphereDerivatives, Lut};
use crate::params::{FgcmParameters, ParRange};
use crate::sed;
use crate::store::{ObservationTable, StarCatalog};

#[derive(Error, Debug)]
pub enum ChisqError {
    #[error("no good observations survived selection for this call")]
    NoGoodObservations,

    #[error("degrees of freedom is not positive: nObsFit={n_obs_fit} + nObsRefFit={n_obs_ref_fit} - nActualFitPars={n_actual_fit_pars}")]
    SingularFit { n_obs_fit: usize, n_obs_ref_fit: usize, n_actual_fit_pars: usize },

    #[error("chi-squared fit did not converge within {max_iterations} iterations")]
    MaxIterations { max_iterations: usize, chisq_history: Vec<f64> },

    #[error("invalid chi-squared engine configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Per-observation context handed to a [`GradientGroup`]: everything it
/// might need to decide its fit-vector slot and its `d(magStd)/d(theta)`
/// contribution, without reaching back into `FgcmParameters` itself.
pub struct ObsContext {
    pub night: usize,
    pub wash: usize,
    pub filter: usize,
    pub delta_ut: f64,
    pub mjd: f64,
    pub wash_mjd: f64,
    pub deriv: AtmosphereDerivatives,
    /// Whether this observation's filter is fit (spec.md §4.6 group 5:
    /// "multiplied by a boolean fit-flag mask; non-fit filters zero the
    /// gradient contribution").
    pub fit_filter: bool,
}

/// One contiguous sub-range of the fit vector and the rule for how an
/// observation maps onto a slot within it (SPEC_FULL.md §4.6).
pub trait GradientGroup: Sync {
    fn range(&self) -> ParRange;
    fn slot(&self, ctx: &ObsContext) -> Option<usize>;
    fn d_mag_d_theta(&self, ctx: &ObsContext) -> f64;
}

struct NightGroup {
    range: ParRange,
    deriv: fn(&AtmosphereDerivatives) -> f64,
    scale: fn(&ObsContext) -> f64,
}

impl GradientGroup for NightGroup {
    fn range(&self) -> ParRange {
        self.range
    }
    fn slot(&self, ctx: &ObsContext) -> Option<usize> {
        (self.range.len > 0 && ctx.night < self.range.len).then_some(ctx.night)
    }
    fn d_mag_d_theta(&self, ctx: &ObsContext) -> f64 {
        (self.deriv)(&ctx.deriv) * (self.scale)(ctx)
    }
}

/// A single campaign-wide scalar slot (external/retrieved PWV or tau
/// "scale" parameters), contributed to by every observation regardless of
/// night.
struct GlobalGroup {
    range: ParRange,
    deriv: fn(&AtmosphereDerivatives) -> f64,
}

impl GradientGroup for GlobalGroup {
    fn range(&self) -> ParRange {
        self.range
    }
    fn slot(&self, _ctx: &ObsContext) -> Option<usize> {
        (self.range.len > 0).then_some(0)
    }
    fn d_mag_d_theta(&self, ctx: &ObsContext) -> f64 {
        (self.deriv)(&ctx.deriv)
    }
}

struct WashGroup {
    range: ParRange,
    scale: fn(&ObsContext) -> f64,
}

impl GradientGroup for WashGroup {
    fn range(&self) -> ParRange {
        self.range
    }
    fn slot(&self, ctx: &ObsContext) -> Option<usize> {
        (self.range.len > 0 && ctx.wash < self.range.len).then_some(ctx.wash)
    }
    fn d_mag_d_theta(&self, ctx: &ObsContext) -> f64 {
        (self.scale)(ctx)
    }
}

struct FilterGroup {
    range: ParRange,
}

impl GradientGroup for FilterGroup {
    fn range(&self) -> ParRange {
        self.range
    }
    fn slot(&self, ctx: &ObsContext) -> Option<usize> {
        // A non-fit filter's offset is frozen, not merely scaled to zero: it
        // must not be marked `touched` either, or nActualFitPars would count
        // a parameter the fit never actually constrains (spec.md §4.6 group
        // 5, "non-fit filters zero the gradient contribution").
        (self.range.len > 0 && ctx.filter < self.range.len && ctx.fit_filter).then_some(ctx.filter)
    }
    fn d_mag_d_theta(&self, _ctx: &ObsContext) -> f64 {
        1.0
    }
}

/// Build the enabled gradient groups for a layout/config pair, following
/// the same PWV/tau source-selection branching as
/// `FgcmParameters::compute_ln_pwv` (spec.md §4.3): a group whose range is
/// empty contributes nothing (`slot` always returns `None`), so disabled
/// sub-ranges are naturally inert rather than needing a separate "is this
/// enabled" check at every call site.
fn build_groups(layout: &crate::params::ParamLayout, config: &FitConfig) -> Vec<Box<dyn GradientGroup>> {
    let mut groups: Vec<Box<dyn GradientGroup>> = Vec::new();

    if !config.freeze_std_atmosphere {
        groups.push(Box::new(NightGroup { range: layout.o3, deriv: |d| d.d_o3, scale: |_| 1.0 }));
        groups.push(Box::new(NightGroup { range: layout.alpha, deriv: |d| d.d_alpha, scale: |_| 1.0 }));

        if config.use_retrieved_pwv {
            groups.push(Box::new(GlobalGroup { range: layout.ln_pwv_retrieved_scale, deriv: |d| d.d_ln_pwv }));
            if config.use_nightly_retrieved_pwv {
                groups.push(Box::new(NightGroup {
                    range: layout.ln_pwv_retrieved_offset,
                    deriv: |d| d.d_ln_pwv,
                    scale: |_| 1.0,
                }));
            } else {
                groups.push(Box::new(GlobalGroup { range: layout.ln_pwv_retrieved_offset, deriv: |d| d.d_ln_pwv }));
            }
        } else if config.has_external_pwv {
            groups.push(Box::new(NightGroup {
                range: layout.ln_pwv_external_offset,
                deriv: |d| d.d_ln_pwv,
                scale: |_| 1.0,
            }));
            groups.push(Box::new(GlobalGroup { range: layout.ln_pwv_external_scale, deriv: |d| d.d_ln_pwv }));
        } else {
            groups.push(Box::new(NightGroup { range: layout.ln_pwv_intercept, deriv: |d| d.d_ln_pwv, scale: |_| 1.0 }));
            groups.push(Box::new(NightGroup {
                range: layout.ln_pwv_slope,
                deriv: |d| d.d_ln_pwv,
                scale: |ctx| ctx.delta_ut,
            }));
            if config.use_quadratic_pwv {
                groups.push(Box::new(NightGroup {
                    range: layout.ln_pwv_quadratic,
                    deriv: |d| d.d_ln_pwv,
                    scale: |ctx| ctx.delta_ut.powi(2),
                }));
            }
        }

        if config.has_external_tau {
            groups.push(Box::new(NightGroup {
                range: layout.ln_tau_external_offset,
                deriv: |d| d.d_ln_tau,
                scale: |_| 1.0,
            }));
            groups.push(Box::new(GlobalGroup { range: layout.ln_tau_external_scale, deriv: |d| d.d_ln_tau }));
        } else {
            groups.push(Box::new(NightGroup { range: layout.ln_tau_intercept, deriv: |d| d.d_ln_tau, scale: |_| 1.0 }));
            groups.push(Box::new(NightGroup {
                range: layout.ln_tau_slope,
                deriv: |d| d.d_ln_tau,
                scale: |ctx| ctx.delta_ut,
            }));
        }
    }

    groups.push(Box::new(WashGroup { range: layout.qe_intercept, scale: |_| 1.0 }));
    groups.push(Box::new(WashGroup { range: layout.qe_slope, scale: |ctx| ctx.mjd - ctx.wash_mjd }));
    groups.push(Box::new(FilterGroup { range: layout.filter_offset }));

    groups
}

/// The slice of caller-supplied configuration a single `run`/`compute_mag_std`
/// call needs (spec.md §4.6's `__call__` flags), gathered into one struct
/// rather than threaded as half a dozen bool parameters.
pub struct ChisqInputs<'a> {
    pub config: &'a FitConfig,
    pub lut: &'a Lut,
    pub params: &'a FgcmParameters,
    /// Standard per-band `I1/I0`, the chromatic correction's reference
    /// point (glossary `I10StdBand`).
    pub i10_std_band: &'a [f64],
    pub compute_derivatives: bool,
    pub fitter_units: bool,
    pub ignore_ref: bool,
    /// Evaluate `magStd` for every exposure (including non-fit-band,
    /// non-photometric ones) rather than only the good-observation subset
    /// driving the fit; mutually exclusive with `compute_derivatives`
    /// (spec.md §7 `ConfigError`: gradients are only meaningful for the
    /// fit-band subset that actually has a well-defined mean to compare
    /// against).
    pub all_exposures: bool,
    /// Recompute each touched star's SED slope from this call's
    /// pre-chromatic mean before applying the chromatic correction
    /// (spec.md §4.6 Phase A: "If computeSEDSlopes, compute per-(star,band)
    /// inverse-variance mean of magRaw and invoke C5"). `false` leaves
    /// whatever slope `StarCatalog` already holds (zero, the first time
    /// through) in place.
    pub compute_sed_slopes: bool,
    /// Derive a per-band absolute-throughput offset against the reference
    /// catalog after the chromatic pass and fold it into `magStd`/
    /// `magStdMean` (spec.md §4.6 "computeAbsThroughput", delegated to C4's
    /// `compute_abs_offset`). The caller is responsible for applying the
    /// returned `MagPhaseOutput::abs_throughput_delta` to
    /// `FgcmParameters::comp_abs_throughput` via
    /// `FgcmParameters::apply_abs_throughput_offset`.
    pub compute_abs_throughput: bool,
    /// C7's gray feedback into this chi-squared pass (spec.md §1/§2): a
    /// flat per-(exposure,CCD) offset or a per-CCD sub-CCD field, added to
    /// `magRaw` before the chromatic correction. `None` on the first pass
    /// of a campaign, before any gray has been aggregated.
    pub fgcm_gray: Option<FgcmGrayInput<'a>>,
}

/// Result of one `compute_mag_std` call: the per-row `magStd` array plus
/// whatever absolute-throughput offset was derived this call (spec.md
/// §4.6 "computeAbsThroughput"), for the caller to fold into
/// `FgcmParameters::comp_abs_throughput` via
/// `FgcmParameters::apply_abs_throughput_offset`.
pub struct MagPhaseOutput {
    pub mag_std: Array1<f64>,
    /// Per-band offset `Delta[b]`; `0.0` for a band with no reference
    /// coverage this call, or when `compute_abs_throughput` was `false`.
    pub abs_throughput_delta: Vec<f64>,
}

/// Accumulated chi-squared and (optionally) gradient for one `run` call.
pub struct ChisqOutput {
    pub chisq: f64,
    pub chisq_ref: f64,
    pub n_obs_fit: usize,
    pub n_obs_ref_fit: usize,
    pub dof: i64,
    pub gradient: Option<Array1<f64>>,
    pub gradient_ref: Option<Array1<f64>>,
    pub touched: Option<Array1<bool>>,
    pub touched_ref: Option<Array1<bool>>,
}

pub struct ChisqEngine {
    groups: Vec<Box<dyn GradientGroup>>,
    n_fit_pars: usize,
    max_iterations: usize,
    /// Reduced chi-squared from every `run` call so far, for convergence
    /// monitoring (spec.md §4.6 "χ² history is appended for convergence
    /// monitoring"). `RefCell` rather than a `&mut self` method signature:
    /// the outer minimiser calls `run` many times back-to-back and gains
    /// nothing from the borrow-checker enforcing exclusivity an immutable
    /// evaluator already guarantees by construction.
    chisq_history: RefCell<Vec<f64>>,
}

impl ChisqEngine {
    pub fn new(layout: &crate::params::ParamLayout, config: &FitConfig) -> Self {
        Self {
            groups: build_groups(layout, config),
            n_fit_pars: layout.n_fit_pars,
            max_iterations: config.max_iterations,
            chisq_history: RefCell::new(Vec::new()),
        }
    }

    /// Reduced chi-squared (`chisq/dof`) from every completed `run` call,
    /// oldest first.
    pub fn chisq_history(&self) -> Vec<f64> {
        self.chisq_history.borrow().clone()
    }

    /// Clear the accumulated history, e.g. when the outer minimiser starts
    /// a fresh fit campaign reusing the same engine.
    pub fn reset_history(&self) {
        self.chisq_history.borrow_mut().clear();
    }

    fn obs_context(&self, params: &FgcmParameters, exp: usize, obs: &ObservationTable, row: usize, deriv: AtmosphereDerivatives) -> ObsContext {
        let wash = params.exp_wash_index[exp];
        let filter = obs.filter_index[row];
        ObsContext {
            night: params.exp_night_index[exp],
            wash,
            filter,
            delta_ut: params.exp_delta_ut[exp],
            mjd: params.exp_mjd[exp],
            wash_mjd: params.wash_mjd[wash],
            deriv,
            fit_filter: params.fit_band_filter_flag.get(filter).copied().unwrap_or(false),
        }
    }

    /// Phase A: recompute `magStd` for every row in `good_obs`, commit the
    /// inverse-variance-weighted `magStdMean`/`magStdMeanNoChrom`/
    /// `magStdMeanErr` for every star touched, and return the per-row
    /// `magStd` array (indexed by the same row numbers as `good_obs`'s
    /// source `ObservationTable`, sentinel everywhere a row wasn't
    /// touched). Grounded on `_magWorker`.
    ///
    /// Runs in three passes, each gated on its own `ChisqInputs` flag:
    ///
    /// 1. The pre-chromatic `magRaw` (LUT `I0` plus `qeSys`/`filterOffset`,
    ///    plus the optional `fgcm_gray` CCD correction) and its
    ///    inverse-variance per-(star,band) mean, always computed since the
    ///    chromatic pass and `magStdMeanNoChrom` both need it.
    /// 2. If `compute_sed_slopes`, `sed::compute_sed_slope` is invoked per
    ///    touched star from that pre-chromatic mean and the result is
    ///    committed via `StarCatalog::set_sed_slope` before the chromatic
    ///    correction below reads it back.
    /// 3. The chromatic `magStd` (`magRaw` plus the SED-slope-weighted
    ///    `I1/I0` correction) and its per-(star,band) mean, then, if
    ///    `compute_abs_throughput`, a per-band reference-catalog offset
    ///    (`StarCatalog::compute_abs_offset`) subtracted from both.
    pub fn compute_mag_std(
        &self,
        inputs: &ChisqInputs,
        stars: &StarCatalog,
        obs: &ObservationTable,
        good_stars: &[usize],
        good_obs: &[usize],
    ) -> MagPhaseOutput {
        let mut mag_raw = Array1::from_elem(obs.n_obs(), SENTINEL_MAG);
        let mut i10_by_row = vec![0.0; obs.n_obs()];

        let mut wt_sum = std::collections::HashMap::<(usize, usize), f64>::new();
        let mut raw_mean_sum = std::collections::HashMap::<(usize, usize), f64>::new();

        for &row in good_obs {
            let exp = obs.exp_index[row];
            let q = inputs.lut.get_indices(
                obs.filter_index[row],
                inputs.params.exp_ln_pwv[exp],
                inputs.params.exp_o3[exp],
                inputs.params.exp_ln_tau[exp],
                inputs.params.exp_alpha[exp],
                obs.sec_zenith[row],
                obs.ccd_index[row],
                inputs.params.exp_pmb[exp],
            );
            let i0 = inputs.lut.i0(q);
            i10_by_row[row] = inputs.lut.i1_over_i0(q);

            let star = obs.obj_index[row];
            let band = obs.band_index[row];

            let mut obs_mag = obs.mag_adu[row]
                + MAG_CONSTANT * i0.ln()
                + inputs.params.exp_qe_sys[exp]
                + inputs.params.exp_filter_offset[exp];
            if let Some(gray) = &inputs.fgcm_gray {
                obs_mag += gray.correction(exp, obs.ccd_index[row], obs.x[row], obs.y[row]);
            }
            mag_raw[row] = obs_mag;

            let err2 = obs.mag_adu_model_err[row].powi(2);
            let w = 1.0 / err2;
            *wt_sum.entry((star, band)).or_insert(0.0) += w;
            *raw_mean_sum.entry((star, band)).or_insert(0.0) += obs_mag * w;
        }

        if inputs.compute_sed_slopes {
            let n_bands = stars.n_bands();
            let mut raw_means_by_star = std::collections::HashMap::<usize, Vec<f64>>::new();
            for (&(star, band), &wt) in &wt_sum {
                if wt <= 0.0 {
                    continue;
                }
                let means = raw_means_by_star.entry(star).or_insert_with(|| vec![SENTINEL_MAG; n_bands]);
                means[band] = raw_mean_sum[&(star, band)] / wt;
            }
            let fudge = (
                inputs.config.sed_fit_band_fudge_factors.first().copied().unwrap_or(1.0),
                inputs.config.sed_fit_band_fudge_factors.get(1).copied().unwrap_or(1.0),
            );
            for (&star, means) in &raw_means_by_star {
                let slope = sed::compute_sed_slope(
                    means,
                    &stars.band_config.band_required_index,
                    &stars.band_config.band_extra_index,
                    &stars.band_config.lambda_std,
                    fudge,
                    &inputs.config.sed_extra_band_fudge_factors,
                );
                for (band, &s) in slope.iter().enumerate() {
                    stars.set_sed_slope(star, band, s);
                }
            }
        }

        let mut mag_std = Array1::from_elem(obs.n_obs(), SENTINEL_MAG);
        let mut chrom_mean_sum = std::collections::HashMap::<(usize, usize), f64>::new();

        for &row in good_obs {
            let star = obs.obj_index[row];
            let band = obs.band_index[row];

            let sed_slope = stars.sed_slope(star, band);
            let i10 = i10_by_row[row];
            let i10_std = inputs.i10_std_band.get(band).copied().unwrap_or(0.0);
            let delta_std = MAG_CONSTANT * ((1.0 + sed_slope * i10) / (1.0 + sed_slope * i10_std)).ln();

            let m = mag_raw[row] + delta_std;
            mag_std[row] = m;

            let err2 = obs.mag_adu_model_err[row].powi(2);
            let w = 1.0 / err2;
            *chrom_mean_sum.entry((star, band)).or_insert(0.0) += m * w;
        }

        for (&(star, band), &wt) in &wt_sum {
            if wt <= 0.0 {
                continue;
            }
            stars.set_mag_std_mean(star, band, chrom_mean_sum[&(star, band)] / wt);
            stars.set_mag_std_mean_no_chrom(star, band, raw_mean_sum[&(star, band)] / wt);
            stars.set_mag_std_mean_err(star, band, (1.0 / wt).sqrt());
        }

        let mut abs_throughput_delta = vec![0.0; stars.n_bands()];
        if inputs.compute_abs_throughput {
            for band in 0..stars.n_bands() {
                if let Some(delta) = stars.compute_abs_offset(good_stars, band) {
                    abs_throughput_delta[band] = delta;
                }
            }
            for &row in good_obs {
                let band = obs.band_index[row];
                let delta = abs_throughput_delta[band];
                if delta != 0.0 && mag_std[row] < SENTINEL_THRESHOLD {
                    mag_std[row] -= delta;
                }
            }
            for (&(star, band), &wt) in &wt_sum {
                let delta = abs_throughput_delta[band];
                if wt <= 0.0 || delta == 0.0 {
                    continue;
                }
                stars.set_mag_std_mean(star, band, stars.mag_std_mean(star, band) - delta);
            }
        }

        MagPhaseOutput { mag_std, abs_throughput_delta }
    }

    /// Phase B: chi-squared and, if `inputs.compute_derivatives`, the
    /// analytic gradient, over `good_stars`/`good_obs` restricted to fit
    /// bands. Splits `good_obs` into `config.n_core` contiguous chunks,
    /// computes each chunk's partial sums with `rayon`, then folds the
    /// partials together in ascending chunk order so the result does not
    /// depend on thread scheduling (SPEC_FULL.md §5).
    pub fn run(
        &self,
        inputs: &ChisqInputs,
        stars: &StarCatalog,
        obs: &ObservationTable,
        mag_std: &Array1<f64>,
        good_stars: &[usize],
        good_obs: &[usize],
        bands_in_fit: &[usize],
    ) -> Result<ChisqOutput, ChisqError> {
        if good_obs.is_empty() {
            return Err(ChisqError::NoGoodObservations);
        }
        if inputs.all_exposures && inputs.compute_derivatives {
            return Err(ConfigError::AllExposuresWithDerivatives.into());
        }

        let has_refstars = !inputs.ignore_ref && good_stars.iter().any(|&s| stars.ref_index[s] >= 0);

        let n_core = inputs.config.n_core.max(1);
        let chunk_len = good_obs.len().div_ceil(n_core).max(1);
        let chunks: Vec<&[usize]> = good_obs.chunks(chunk_len).collect();

        use rayon::prelude::*;
        let partials: Vec<ChisqPartial> = if inputs.config.show_progress {
            use indicatif::ParallelProgressIterator;
            let pb = crate::logging::make_chisq_progress_bar(chunks.len() as u64);
            chunks
                .par_iter()
                .progress_with(pb)
                .map(|chunk| self.process_chunk(inputs, stars, obs, mag_std, chunk, bands_in_fit, has_refstars))
                .collect()
        } else {
            chunks
                .par_iter()
                .map(|chunk| self.process_chunk(inputs, stars, obs, mag_std, chunk, bands_in_fit, has_refstars))
                .collect()
        };

        let mut chisq = 0.0;
        let mut chisq_ref = 0.0;
        let mut n_obs_fit = 0usize;
        let mut n_obs_ref_fit = 0usize;
        let width = if inputs.compute_derivatives { self.n_fit_pars } else { 0 };
        let mut gradient = Array1::zeros(width);
        let mut gradient_ref = Array1::zeros(width);
        let mut touched = Array1::from_elem(width, false);
        let mut touched_ref = Array1::from_elem(width, false);

        for p in partials {
            chisq += p.chisq;
            chisq_ref += p.chisq_ref;
            n_obs_fit += p.n_obs_fit;
            n_obs_ref_fit += p.n_obs_ref_fit;
            if inputs.compute_derivatives {
                gradient += &p.gradient;
                gradient_ref += &p.gradient_ref;
                for i in 0..width {
                    touched[i] = touched[i] || p.touched[i];
                    touched_ref[i] = touched_ref[i] || p.touched_ref[i];
                }
            }
        }

        let n_actual_fit_pars = touched.iter().filter(|&&t| t).count();
        let dof = n_obs_fit as i64 + n_obs_ref_fit as i64 - n_actual_fit_pars as i64;
        if inputs.compute_derivatives && dof <= 0 {
            return Err(ChisqError::SingularFit { n_obs_fit, n_obs_ref_fit, n_actual_fit_pars });
        }

        {
            let mut history = self.chisq_history.borrow_mut();
            history.push(if dof > 0 { (chisq + chisq_ref) / dof as f64 } else { chisq + chisq_ref });
            if self.max_iterations > 0 && history.len() > self.max_iterations {
                return Err(ChisqError::MaxIterations { max_iterations: self.max_iterations, chisq_history: history.clone() });
            }
        }

        Ok(ChisqOutput {
            chisq,
            chisq_ref,
            n_obs_fit,
            n_obs_ref_fit,
            dof,
            gradient: inputs.compute_derivatives.then_some(gradient),
            gradient_ref: inputs.compute_derivatives.then_some(gradient_ref),
            touched: inputs.compute_derivatives.then_some(touched),
            touched_ref: inputs.compute_derivatives.then_some(touched_ref),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn process_chunk(
        &self,
        inputs: &ChisqInputs,
        stars: &StarCatalog,
        obs: &ObservationTable,
        mag_std: &Array1<f64>,
        rows: &[usize],
        bands_in_fit: &[usize],
        has_refstars: bool,
    ) -> ChisqPartial {
        let width = if inputs.compute_derivatives { self.n_fit_pars } else { 0 };
        let mut partial = ChisqPartial {
            chisq: 0.0,
            chisq_ref: 0.0,
            n_obs_fit: 0,
            n_obs_ref_fit: 0,
            gradient: Array1::zeros(width),
            gradient_ref: Array1::zeros(width),
            touched: vec![false; width],
            touched_ref: vec![false; width],
        };

        for &row in rows {
            let band = obs.band_index[row];
            if !bands_in_fit.contains(&band) {
                continue;
            }
            let star = obs.obj_index[row];
            let mean = stars.mag_std_mean(star, band);
            if mean >= crate::constants::SENTINEL_THRESHOLD {
                continue;
            }
            let mean_err2 = stars.mag_std_mean_err(star, band).powi(2);
            let obs_err2 = obs.mag_adu_model_err[row].powi(2);

            let is_ref = has_refstars
                && stars.ref_index[star] >= 0
                && (stars.flag[star] & obj_flag::REFSTAR_OUTLIER) == 0
                && stars.ref_mag[[star, band]] < crate::constants::SENTINEL_THRESHOLD;

            let exp = obs.exp_index[row];
            let deriv = {
                let q = inputs.lut.get_indices(
                    obs.filter_index[row],
                    inputs.params.exp_ln_pwv[exp],
                    inputs.params.exp_o3[exp],
                    inputs.params.exp_ln_tau[exp],
                    inputs.params.exp_alpha[exp],
                    obs.sec_zenith[row],
                    obs.ccd_index[row],
                    inputs.params.exp_pmb[exp],
                );
                let mut d = inputs.lut.log_derivatives(q);
                let sed_slope = stars.sed_slope(star, band);
                if sed_slope != 0.0 {
                    let d1 = inputs.lut.log_derivatives_i1(q);
                    d.d_ln_pwv += d1.d_ln_pwv * sed_slope;
                    d.d_o3 += d1.d_o3 * sed_slope;
                    d.d_ln_tau += d1.d_ln_tau * sed_slope;
                    d.d_alpha += d1.d_alpha * sed_slope;
                }
                d
            };

            if is_ref {
                let delta = mag_std[row] - stars.ref_mag[[star, band]];
                let weight = 1.0 / (obs_err2 + stars.ref_mag_err[[star, band]].powi(2));
                partial.chisq_ref += delta * delta * weight;
                partial.n_obs_ref_fit += 1;

                if inputs.compute_derivatives {
                    let ctx = self.obs_context(inputs.params, exp, obs, row, deriv);
                    self.scatter(inputs, &ctx, 2.0 * delta * weight, &mut partial.gradient_ref, &mut partial.touched_ref);
                }
            } else {
                let delta = mag_std[row] - mean;
                let weight = 1.0 / obs_err2;
                partial.chisq += delta * delta * weight;
                partial.n_obs_fit += 1;

                if inputs.compute_derivatives {
                    let err_summand = 1.0 - (1.0 / obs_err2) / (1.0 / mean_err2);
                    let ctx = self.obs_context(inputs.params, exp, obs, row, deriv);
                    self.scatter(inputs, &ctx, 2.0 * delta * weight * err_summand, &mut partial.gradient, &mut partial.touched);
                }
            }
        }

        partial
    }

    /// Scatter one observation's contribution into every enabled group's
    /// slot. The ordinary and reference passes write into wholly separate
    /// `gradient`/`touched` buffers (`ChisqOutput::gradient` vs
    /// `gradient_ref`) rather than sharing one `4*nFitPars` array indexed
    /// by a `2*nFitPars`/`3*nFitPars` base offset the way the source does
    /// — which is also how the source's reference-gradient offset bug
    /// (SPEC_FULL.md §9.3) became possible in the first place: a
    /// hand-computed base added to a sub-range's own `loc` is exactly the
    /// kind of arithmetic that silently aliases when one call site forgets
    /// the base term. Keeping the two passes as distinct arrays makes that
    /// mistake structurally impossible instead of merely fixing the one
    /// miscalculated line.
    fn scatter(&self, inputs: &ChisqInputs, ctx: &ObsContext, weighted_delta: f64, gradient: &mut Array1<f64>, touched: &mut [bool]) {
        for group in &self.groups {
            let range = group.range();
            if range.len == 0 {
                continue;
            }
            let Some(local) = group.slot(ctx) else { continue };
            let idx = range.loc + local;
            let unit = if inputs.fitter_units { inputs.params.unit_dict.get(idx).copied().unwrap_or(1.0) } else { 1.0 };
            gradient[idx] += weighted_delta * group.d_mag_d_theta(ctx) / unit;
            touched[idx] = true;
        }
    }
}

struct ChisqPartial {
    chisq: f64,
    chisq_ref: f64,
    n_obs_fit: usize,
    n_obs_ref_fit: usize,
    gradient: Array1<f64>,
    gradient_ref: Array1<f64>,
    touched: Vec<bool>,
    touched_ref: Vec<bool>,
}
