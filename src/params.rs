// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
C3: Parameter Model.

Holds the fit vector, its mapping to per-exposure physical quantities, unit
scalings, and per-exposure/per-night metadata (spec.md §4.3).

Sub-range layout is computed once at construction into a `ParamLayout`
(location + length pairs), rather than recomputed per access, matching the
teacher's preference for pre-sized index arithmetic over repeated lookups
in `di_calibrate`'s hot loops.
*/

use ndarray::Array1;
use thiserror::Error;

use crate::config::FitConfig;

#[derive(Error, Debug)]
pub enum ParamError {
    #[error("sub-ranges do not exactly partition [0, nFitPars): got total length {got}, expected {expected}")]
    LayoutMismatch { got: usize, expected: usize },

    #[error("unit factor for sub-range {name} must be strictly positive, got {got}")]
    NonPositiveUnit { name: &'static str, got: f64 },

    #[error("useRetrievedPwv and hasExternalPwv are mutually exclusive PWV sources")]
    ConflictingPwvSource,
}

/// A disjoint contiguous sub-range of the fit vector: `[loc, loc+len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParRange {
    pub loc: usize,
    pub len: usize,
}

impl ParRange {
    pub fn end(&self) -> usize {
        self.loc + self.len
    }
}

/// All sub-range locations the gradient (C6) needs to place contributions
/// into the right fit-vector slots (spec.md §4.3, §4.6).
#[derive(Debug, Clone)]
pub struct ParamLayout {
    pub o3: ParRange,
    pub alpha: ParRange,
    pub ln_pwv_intercept: ParRange,
    pub ln_pwv_slope: ParRange,
    pub ln_pwv_quadratic: ParRange,
    pub ln_pwv_external_offset: ParRange,
    pub ln_pwv_external_scale: ParRange,
    pub ln_pwv_retrieved_scale: ParRange,
    pub ln_pwv_retrieved_offset: ParRange,
    pub ln_tau_intercept: ParRange,
    pub ln_tau_slope: ParRange,
    pub ln_tau_external_offset: ParRange,
    pub ln_tau_external_scale: ParRange,
    pub qe_intercept: ParRange,
    pub qe_slope: ParRange,
    pub filter_offset: ParRange,
    pub n_fit_pars: usize,
}

impl ParamLayout {
    /// Lay out sub-ranges back-to-back in the fixed order documented in
    /// spec.md §4.3/§4.6, sizing the optional blocks (external/retrieved
    /// PWV and tau, quadratic PWV) to zero when the corresponding config
    /// flag is off. Verifies the partition invariant before returning.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        n_nights: usize,
        n_wash: usize,
        n_filters: usize,
        config: &FitConfig,
    ) -> Result<Self, ParamError> {
        let mut loc = 0usize;
        let mut next = |len: usize| {
            let r = ParRange { loc, len };
            loc += len;
            r
        };

        let o3 = next(n_nights);
        let alpha = next(n_nights);
        let ln_pwv_intercept = next(n_nights);
        let ln_pwv_slope = next(n_nights);
        let ln_pwv_quadratic = next(if config.use_quadratic_pwv { n_nights } else { 0 });
        let ln_pwv_external_offset =
            next(if config.has_external_pwv && !config.use_retrieved_pwv { n_nights } else { 0 });
        let ln_pwv_external_scale =
            next(if config.has_external_pwv && !config.use_retrieved_pwv { 1 } else { 0 });
        let ln_pwv_retrieved_scale = next(if config.use_retrieved_pwv { 1 } else { 0 });
        let ln_pwv_retrieved_offset = next(if config.use_retrieved_pwv {
            if config.use_nightly_retrieved_pwv {
                n_nights
            } else {
                1
            }
        } else {
            0
        });
        let ln_tau_intercept = next(n_nights);
        let ln_tau_slope = next(n_nights);
        let ln_tau_external_offset = next(if config.has_external_tau { n_nights } else { 0 });
        let ln_tau_external_scale = next(if config.has_external_tau { 1 } else { 0 });
        let qe_intercept = next(n_wash);
        let qe_slope = next(n_wash);
        let filter_offset = next(n_filters);

        let n_fit_pars = loc;

        if config.has_external_pwv && config.use_retrieved_pwv {
            return Err(ParamError::ConflictingPwvSource);
        }

        let layout = Self {
            o3,
            alpha,
            ln_pwv_intercept,
            ln_pwv_slope,
            ln_pwv_quadratic,
            ln_pwv_external_offset,
            ln_pwv_external_scale,
            ln_pwv_retrieved_scale,
            ln_pwv_retrieved_offset,
            ln_tau_intercept,
            ln_tau_slope,
            ln_tau_external_offset,
            ln_tau_external_scale,
            qe_intercept,
            qe_slope,
            filter_offset,
            n_fit_pars,
        };
        layout.verify_partition()?;
        Ok(layout)
    }

    fn all_ranges(&self) -> Vec<ParRange> {
        self.named_ranges().into_iter().map(|(_, r)| r).collect()
    }

    /// Every sub-range paired with its `unit_dict`/diagnostic name, in
    /// layout order. Used by `get_unit_dict` and by `verify_partition`.
    pub fn named_ranges(&self) -> Vec<(&'static str, ParRange)> {
        vec![
            ("o3", self.o3),
            ("alpha", self.alpha),
            ("lnPwvIntercept", self.ln_pwv_intercept),
            ("lnPwvSlope", self.ln_pwv_slope),
            ("lnPwvQuadratic", self.ln_pwv_quadratic),
            ("lnPwvExternalOffset", self.ln_pwv_external_offset),
            ("lnPwvExternalScale", self.ln_pwv_external_scale),
            ("lnPwvRetrievedScale", self.ln_pwv_retrieved_scale),
            ("lnPwvRetrievedOffset", self.ln_pwv_retrieved_offset),
            ("lnTauIntercept", self.ln_tau_intercept),
            ("lnTauSlope", self.ln_tau_slope),
            ("lnTauExternalOffset", self.ln_tau_external_offset),
            ("lnTauExternalScale", self.ln_tau_external_scale),
            ("qeIntercept", self.qe_intercept),
            ("qeSlope", self.qe_slope),
            ("filterOffset", self.filter_offset),
        ]
    }

    fn verify_partition(&self) -> Result<(), ParamError> {
        let mut ranges = self.all_ranges();
        ranges.retain(|r| r.len > 0);
        ranges.sort_by_key(|r| r.loc);
        let mut expected_loc = 0usize;
        for r in &ranges {
            if r.loc != expected_loc {
                return Err(ParamError::LayoutMismatch { got: r.loc, expected: expected_loc });
            }
            expected_loc = r.end();
        }
        if expected_loc != self.n_fit_pars {
            return Err(ParamError::LayoutMismatch { got: expected_loc, expected: self.n_fit_pars });
        }
        Ok(())
    }
}

/// Per-exposure derived atmospheric/instrumental quantities plus the
/// night/wash/filter/band metadata the gradient needs to place
/// contributions (spec.md §3 Exposure entity, §4.3).
pub struct FgcmParameters {
    pub layout: ParamLayout,
    pub unit_dict: Vec<f64>,

    pub n_nights: usize,
    pub n_wash: usize,
    pub n_filters: usize,
    pub n_bands: usize,

    pub exp_night_index: Array1<usize>,
    pub exp_wash_index: Array1<usize>,
    pub exp_band_index: Array1<usize>,
    pub exp_filter_index: Array1<usize>,
    pub exp_mjd: Array1<f64>,
    pub exp_delta_ut: Array1<f64>,
    pub exp_pmb: Array1<f64>,
    pub exp_flag: Array1<u32>,
    pub exp_extra_band_flag: Array1<bool>,
    pub wash_mjd: Array1<f64>,

    pub exp_ln_pwv: Array1<f64>,
    pub exp_o3: Array1<f64>,
    pub exp_ln_tau: Array1<f64>,
    pub exp_alpha: Array1<f64>,
    pub exp_qe_sys: Array1<f64>,
    pub exp_filter_offset: Array1<f64>,

    pub comp_exp_gray: Array1<f64>,
    pub comp_var_gray: Array1<f64>,
    pub comp_n_good_star_per_exp: Array1<usize>,
    pub comp_exp_gray_smooth: Array1<f64>,
    pub comp_abs_throughput: Array1<f64>,
    pub comp_ref_offset: Array1<f64>,
    pub comp_ref_sigma: Array1<f64>,

    /// Corrected naming for the Open Question in spec.md §9
    /// (`compRetrievedLnPwvFlag` vs `computeRetrievedLnPwvFlag`): one
    /// canonical field following the `comp*` convention used by every
    /// other *computed* per-exposure field above.
    pub comp_retrieved_ln_pwv_flag: Array1<bool>,
    /// Corrected spelling for the Open Question in spec.md §9
    /// (`hasRetreivedPwvGOF` vs `hasRetrievedPwvGOF`).
    pub has_retrieved_pwv_gof: bool,

    pub fit_band_filter_flag: Array1<bool>,

    /// The physical-units fit vector, the single source of truth `get_par_array`
    /// reads from and `reload_par_array` writes to; `pars_to_exposures` fans it
    /// out to the per-exposure fields above. Mirrors the source's stateful
    /// `reloadParArray` -> `parsToExposures` sequencing, but unlike the
    /// source's `self.parArray`, this is never reconstructed by inverting
    /// per-exposure fields (most sub-ranges, e.g. an external-PWV offset
    /// plus a separately-fit global scale, aren't invertible from their
    /// combined per-exposure `exp_ln_pwv` alone).
    par_vector: Array1<f64>,
}

impl FgcmParameters {
    /// Build a parameter set from its layout and per-exposure metadata,
    /// with every derived/computed field (`exp_ln_pwv`, `comp_exp_gray`,
    /// ...) zeroed until the first `reload_par_array`/`pars_to_exposures`
    /// and gray-aggregation passes fill them in. Mirrors the source's
    /// `FgcmParameters.__init__`, which likewise builds every array up
    /// front from the exposure table before any fit iteration runs.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layout: ParamLayout,
        unit_dict: Vec<f64>,
        n_nights: usize,
        n_wash: usize,
        n_filters: usize,
        n_bands: usize,
        exp_night_index: Array1<usize>,
        exp_wash_index: Array1<usize>,
        exp_band_index: Array1<usize>,
        exp_filter_index: Array1<usize>,
        exp_mjd: Array1<f64>,
        exp_delta_ut: Array1<f64>,
        exp_pmb: Array1<f64>,
        exp_extra_band_flag: Array1<bool>,
        wash_mjd: Array1<f64>,
        fit_band_filter_flag: Array1<bool>,
    ) -> Self {
        let n_exp = exp_night_index.len();
        let par_vector = Array1::zeros(layout.n_fit_pars);
        Self {
            layout,
            unit_dict,
            n_nights,
            n_wash,
            n_filters,
            n_bands,
            exp_flag: Array1::zeros(n_exp),
            exp_ln_pwv: Array1::zeros(n_exp),
            exp_o3: Array1::zeros(n_exp),
            exp_ln_tau: Array1::zeros(n_exp),
            exp_alpha: Array1::zeros(n_exp),
            exp_qe_sys: Array1::zeros(n_exp),
            exp_filter_offset: Array1::zeros(n_exp),
            comp_exp_gray: Array1::zeros(n_exp),
            comp_var_gray: Array1::zeros(n_exp),
            comp_n_good_star_per_exp: Array1::zeros(n_exp),
            comp_exp_gray_smooth: Array1::zeros(n_exp),
            comp_abs_throughput: Array1::zeros(n_exp),
            comp_ref_offset: Array1::zeros(n_bands),
            comp_ref_sigma: Array1::zeros(n_bands),
            comp_retrieved_ln_pwv_flag: Array1::from_elem(n_exp, false),
            has_retrieved_pwv_gof: false,
            fit_band_filter_flag,
            exp_night_index,
            exp_wash_index,
            exp_band_index,
            exp_filter_index,
            exp_mjd,
            exp_delta_ut,
            exp_pmb,
            exp_extra_band_flag,
            wash_mjd,
            par_vector,
        }
    }

    pub fn n_exp(&self) -> usize {
        self.exp_night_index.len()
    }

    /// Pack the physical-units fit vector into the contiguous fit vector,
    /// optionally scaled into fitter units by `unit_dict` (spec.md §4.3
    /// `getParArray`). `par_vector` is always kept in physical units, so
    /// this is a plain copy-and-scale, the exact inverse of
    /// `reload_par_array`.
    pub fn get_par_array(&self, fitter_units: bool) -> Array1<f64> {
        let mut v = self.par_vector.clone();
        if fitter_units {
            for (i, x) in v.iter_mut().enumerate() {
                *x /= self.unit_dict[i];
            }
        }
        v
    }

    /// The inverse of `get_par_array`: unscale `v` (if in fitter units)
    /// back to physical units and store it as `par_vector`. Subsequently
    /// `pars_to_exposures()` must be called to fan it out to per-exposure
    /// fields (spec.md §4.3).
    pub fn reload_par_array(&mut self, v: &Array1<f64>, fitter_units: bool) {
        let mut physical = v.clone();
        if fitter_units {
            for (i, x) in physical.iter_mut().enumerate() {
                *x *= self.unit_dict[i];
            }
        }
        self.par_vector = physical;
    }

    /// Scale factors per sub-range (spec.md §4.3 `getUnitDict`): `1.0`
    /// everywhere when `fitter_units` is `false`, else each sub-range's
    /// (uniform, per the invariant in spec.md §4.3) entry from
    /// `unit_dict`. Empty sub-ranges are omitted.
    pub fn get_unit_dict(&self, fitter_units: bool) -> std::collections::HashMap<&'static str, f64> {
        let mut out = std::collections::HashMap::new();
        for (name, range) in self.layout.named_ranges() {
            if range.len == 0 {
                continue;
            }
            let scale = if fitter_units { self.unit_dict[range.loc] } else { 1.0 };
            out.insert(name, scale);
        }
        out
    }

    /// Fan the currently-loaded fit vector out to per-exposure fields
    /// (spec.md §4.3: "subsequently parsToExposures() must fan parameters
    /// out to per-exposure fields").
    pub fn pars_to_exposures(&mut self) {
        let v = self.par_vector.clone();
        for e in 0..self.exp_night_index.len() {
            let night = self.exp_night_index[e];
            self.exp_o3[e] = v[self.layout.o3.loc + night];
            self.exp_alpha[e] = v[self.layout.alpha.loc + night];
            self.exp_ln_tau[e] = v[self.layout.ln_tau_intercept.loc + night]
                + v[self.layout.ln_tau_slope.loc + night] * self.exp_delta_ut[e];
            self.exp_ln_pwv[e] = self.compute_ln_pwv(e, &v);
            let wash = self.exp_wash_index[e];
            self.exp_qe_sys[e] = v[self.layout.qe_intercept.loc + wash]
                + v[self.layout.qe_slope.loc + wash]
                    * (self.exp_mjd[e] - self.wash_mjd[wash]);
            let filt = self.exp_filter_index[e];
            self.exp_filter_offset[e] = v[self.layout.filter_offset.loc + filt];
        }
    }

    /// Apply C6 Phase A's optional absolute-throughput correction (spec.md
    /// §4.6 "computeAbsThroughput"): `delta[b]` is the per-band offset
    /// `StarCatalog::compute_abs_offset` derived against the reference
    /// catalog this call; `compAbsThroughput[e] *= 10^(-delta[b]/2.5)` for
    /// every exposure `e` in that band. A zero entry in `delta` (no
    /// reference coverage for that band this call) leaves the
    /// corresponding exposures untouched rather than multiplying by 1.0,
    /// so repeated no-op calls can't accumulate floating-point drift.
    pub fn apply_abs_throughput_offset(&mut self, delta: &[f64]) {
        for e in 0..self.n_exp() {
            let band = self.exp_band_index[e];
            let d = delta.get(band).copied().unwrap_or(0.0);
            if d != 0.0 {
                self.comp_abs_throughput[e] *= 10f64.powf(-d / 2.5);
            }
        }
    }

    fn compute_ln_pwv(&self, e: usize, v: &Array1<f64>) -> f64 {
        let night = self.exp_night_index[e];
        if self.comp_retrieved_ln_pwv_flag[e] {
            let scale = v[self.layout.ln_pwv_retrieved_scale.loc];
            let offset = if self.layout.ln_pwv_retrieved_offset.len > 1 {
                v[self.layout.ln_pwv_retrieved_offset.loc + night]
            } else {
                v[self.layout.ln_pwv_retrieved_offset.loc]
            };
            scale + offset
        } else if self.layout.ln_pwv_external_offset.len > 0 {
            v[self.layout.ln_pwv_external_offset.loc + night]
                + v[self.layout.ln_pwv_external_scale.loc]
        } else {
            let intercept = v[self.layout.ln_pwv_intercept.loc + night];
            let slope = v[self.layout.ln_pwv_slope.loc + night] * self.exp_delta_ut[e];
            let quad = if self.layout.ln_pwv_quadratic.len > 0 {
                v[self.layout.ln_pwv_quadratic.loc + night] * self.exp_delta_ut[e].powi(2)
            } else {
                0.0
            };
            intercept + slope + quad
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> FitConfig {
        FitConfig::default()
    }

    #[test]
    fn layout_partitions_fit_vector_exactly() {
        let layout = ParamLayout::new(3, 2, 4, &cfg()).unwrap();
        assert_eq!(layout.o3, ParRange { loc: 0, len: 3 });
        assert_eq!(layout.alpha, ParRange { loc: 3, len: 3 });
        // Quadratic PWV disabled by default config => zero length, not
        // present in the partition.
        assert_eq!(layout.ln_pwv_quadratic.len, 0);
        assert!(layout.n_fit_pars > 0);
    }

    #[test]
    fn conflicting_pwv_sources_rejected() {
        let mut c = cfg();
        c.has_external_pwv = true;
        c.use_retrieved_pwv = true;
        let err = ParamLayout::new(2, 1, 2, &c).unwrap_err();
        assert!(matches!(err, ParamError::ConflictingPwvSource));
    }

    fn trivial_params(layout: ParamLayout, unit_dict: Vec<f64>) -> FgcmParameters {
        let n_filters = 1;
        FgcmParameters::new(
            layout,
            unit_dict,
            1,
            1,
            n_filters,
            1,
            Array1::zeros(1),
            Array1::zeros(1),
            Array1::zeros(1),
            Array1::zeros(1),
            Array1::zeros(1),
            Array1::from_elem(1, 0.5),
            Array1::from_elem(1, 775.0),
            Array1::from_elem(1, false),
            Array1::zeros(1),
            Array1::from_elem(n_filters, true),
        )
    }

    /// `get_par_array`/`reload_par_array` must round-trip every sub-range,
    /// not just the two atmospheric groups `chisq` exercises directly:
    /// write a distinct value into every slot, reload it, and check
    /// `pars_to_exposures` fans each one out to the right per-exposure
    /// field.
    #[test]
    fn par_array_round_trips_every_sub_range() {
        let mut c = cfg();
        c.use_quadratic_pwv = true;
        let layout = ParamLayout::new(1, 1, 1, &c).unwrap();
        let n_fit_pars = layout.n_fit_pars;
        let mut params = trivial_params(layout, vec![1.0; n_fit_pars]);

        let v = Array1::from_iter((0..n_fit_pars).map(|i| (i + 1) as f64));
        params.reload_par_array(&v, false);
        let round_tripped = params.get_par_array(false);
        assert_eq!(round_tripped, v);

        params.pars_to_exposures();
        assert_eq!(params.exp_o3[0], v[params.layout.o3.loc]);
        assert_eq!(params.exp_alpha[0], v[params.layout.alpha.loc]);
        assert_eq!(params.exp_qe_sys[0], v[params.layout.qe_intercept.loc]);
        assert_eq!(params.exp_filter_offset[0], v[params.layout.filter_offset.loc]);
        let expected_ln_pwv = v[params.layout.ln_pwv_intercept.loc]
            + v[params.layout.ln_pwv_slope.loc] * 0.5
            + v[params.layout.ln_pwv_quadratic.loc] * 0.25;
        assert_eq!(params.exp_ln_pwv[0], expected_ln_pwv);
    }

    #[test]
    fn get_par_array_scales_by_unit_dict_in_fitter_units() {
        let layout = ParamLayout::new(1, 1, 1, &cfg()).unwrap();
        let n_fit_pars = layout.n_fit_pars;
        let unit_dict = vec![2.0; n_fit_pars];
        let mut params = trivial_params(layout, unit_dict);
        let physical = Array1::from_elem(n_fit_pars, 4.0);
        params.reload_par_array(&physical, false);
        let fitter = params.get_par_array(true);
        assert!(fitter.iter().all(|&x| x == 2.0));
    }

    #[test]
    fn abs_throughput_offset_scales_only_exposures_in_that_band() {
        let layout = ParamLayout::new(1, 1, 1, &cfg()).unwrap();
        let n_fit_pars = layout.n_fit_pars;
        let mut params = trivial_params(layout, vec![1.0; n_fit_pars]);
        params.comp_abs_throughput = Array1::from_elem(1, 1.0);
        params.exp_band_index = Array1::from_elem(1, 0);

        params.apply_abs_throughput_offset(&[0.1]);
        assert_eq!(params.comp_abs_throughput[0], 10f64.powf(-0.1 / 2.5));

        // A zero delta for a band must not perturb its exposures at all.
        let unchanged = params.comp_abs_throughput[0];
        params.apply_abs_throughput_offset(&[0.0]);
        assert_eq!(params.comp_abs_throughput[0], unchanged);
    }

    #[test]
    fn unit_dict_omits_disabled_sub_ranges() {
        let layout = ParamLayout::new(2, 1, 1, &cfg()).unwrap();
        let n_fit_pars = layout.n_fit_pars;
        let params = trivial_params(layout, vec![3.0; n_fit_pars]);
        let dict = params.get_unit_dict(true);
        assert_eq!(dict.get("o3"), Some(&3.0));
        // Quadratic PWV is disabled by the default config, so it has no
        // fit-vector slot and must not appear.
        assert_eq!(dict.get("lnPwvQuadratic"), None);
    }
}
