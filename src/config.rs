// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
The in-process configuration surface for the fitting engine.

Ingestion and on-disk config parsing are out of scope for this crate
(spec.md §1 Non-goals), but `FitConfig` still derives `serde`'s traits so a
driver program can load one from TOML/JSON/YAML with the same `serde` +
`toml`/`serde_json`/`serde_yaml` stack the rest of the ecosystem uses for
this; this crate itself only ever receives an already-built `FitConfig`.
*/

use serde::{Deserialize, Serialize};

/// Tunable thresholds and worker-sizing knobs used across C3, C6, C7, C8
/// and the reference-sigma/exposure-selector modules. Field names track
/// the original Python config keys (minus the `fgcmConfig.` prefix) so
/// that anyone cross-referencing `original_source/` can find them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FitConfig {
    /// Number of parallel worker tasks the chi-squared engine splits
    /// `goodStars` across (spec.md §5 "Task count equals configured nCore").
    pub n_core: usize,
    /// Target number of stars handed to each worker before the
    /// `ceil(nStars / nStarPerRun) + 1`-way split (spec.md §4.6).
    pub n_star_per_run: usize,

    /// Minimum good stars required to trust an (exposure, CCD) gray bin.
    pub min_star_per_ccd: usize,
    /// Reject a CCD gray bin whose error exceeds this.
    pub max_ccd_gray_err: f64,
    /// Reject an observation from the gray computation if its implied
    /// per-observation gray error exceeds this (spec.md §4.7).
    pub ccd_gray_max_star_err: f64,

    /// Magnitude window (relative to the brightest observation) used by
    /// the bright-observation selector (spec.md §4.8).
    pub bright_obs_gray_max: f64,

    /// Minimum good stars for an exposure not to be flagged `NO_STARS`/
    /// `TOO_FEW_STARS` (spec.md §4.7, `fgcmExposureSelector.py`).
    pub min_star_per_exp: usize,
    /// Minimum surviving photometric exposures per night.
    pub min_exp_per_night: usize,
    /// Per-band exposure-gray low cut (`EXP_GRAY_TOO_NEGATIVE`).
    pub exp_gray_photometric_cut: Vec<f64>,
    /// Per-band exposure-gray high cut (`EXP_GRAY_TOO_POSITIVE`).
    pub exp_gray_high_cut: Vec<f64>,
    /// Variance-of-gray cut (`VAR_GRAY_TOO_LARGE`).
    pub exp_var_gray_photometric_cut: f64,
    /// Looser cut used only for the very first "is this even plausibly
    /// photometric" pass, before CCD gray has been computed.
    pub exp_gray_initial_cut: f64,

    /// Minimum same-night neighbouring exposures required before the
    /// exposure-gray smoothing pass replaces a raw value with the
    /// neighbourhood median (`fgcmGray.py::computeExpGraySmooth`).
    pub min_exps_to_smooth: usize,
    /// Time window (days) defining "neighbouring" for the smoothing pass.
    pub exp_gray_smooth_delta_t: f64,

    /// Extrapolation fudge factors for the first and last *required*
    /// bands in the SED slope estimator (spec.md §4.5).
    pub sed_fit_band_fudge_factors: Vec<f64>,
    /// Extrapolation fudge factors for each *extra* (redward) band.
    pub sed_extra_band_fudge_factors: Vec<f64>,

    /// Outlier threshold, in sigma, for flagging `REFSTAR_OUTLIER`
    /// (`fgcmSigmaRef.py`).
    pub ref_star_outlier_n_sig: f64,
    /// Indices of the two bands used to split reference stars into
    /// blue/middle/red color bins in the large-number sigma-ref branch.
    pub color_split_indices: (usize, usize),

    /// Iterations of `ChisqEngine::run` after which a distinguished
    /// max-iterations condition unwinds the outer minimiser rather than
    /// the fit spinning forever (spec.md §4.6/§7 `MaxIterations`). `0`
    /// disables the check.
    pub max_iterations: usize,

    /// Parameter-model toggles (spec.md §4.3).
    pub use_quadratic_pwv: bool,
    pub has_external_pwv: bool,
    pub has_external_tau: bool,
    pub use_retrieved_pwv: bool,
    pub use_nightly_retrieved_pwv: bool,
    pub freeze_std_atmosphere: bool,

    /// Draw a terminal progress bar over `ChisqEngine::run`'s per-chunk
    /// reduction. Off by default: a library embedded in another driver
    /// should not write to stderr unless asked.
    #[serde(default)]
    pub show_progress: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            n_core: 1,
            n_star_per_run: 1000,
            min_star_per_ccd: 3,
            max_ccd_gray_err: 0.05,
            ccd_gray_max_star_err: 0.05 * 0.05,
            bright_obs_gray_max: 0.1,
            min_star_per_exp: 3,
            min_exp_per_night: 3,
            exp_gray_photometric_cut: vec![-0.05],
            exp_gray_high_cut: vec![0.05],
            exp_var_gray_photometric_cut: 0.05 * 0.05,
            exp_gray_initial_cut: -0.2,
            max_iterations: 50,
            min_exps_to_smooth: 5,
            exp_gray_smooth_delta_t: 0.1,
            sed_fit_band_fudge_factors: vec![1.0],
            sed_extra_band_fudge_factors: vec![1.0],
            ref_star_outlier_n_sig: 4.0,
            color_split_indices: (0, 2),
            use_quadratic_pwv: false,
            has_external_pwv: false,
            has_external_tau: false,
            use_retrieved_pwv: false,
            use_nightly_retrieved_pwv: false,
            freeze_std_atmosphere: false,
            show_progress: false,
        }
    }
}

/// A sparse override for `FitConfig`, e.g. parsed from a user-supplied
/// file; `None` fields fall back to the base config's value. Mirrors the
/// teacher's `CalibrateUserArgs::merge` pattern (CLI/file args layered
/// over defaults), generalised to an explicit merge method rather than a
/// CLI-args struct since CLI parsing is outside this crate's scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FitConfigOverride {
    pub n_core: Option<usize>,
    pub n_star_per_run: Option<usize>,
    pub bright_obs_gray_max: Option<f64>,
    pub ref_star_outlier_n_sig: Option<f64>,
}

impl FitConfig {
    /// Layer `other` on top of `self`, preferring `other`'s fields
    /// wherever they're set.
    pub fn merge(&self, other: &FitConfigOverride) -> Self {
        let mut out = self.clone();
        if let Some(v) = other.n_core {
            out.n_core = v;
        }
        if let Some(v) = other.n_star_per_run {
            out.n_star_per_run = v;
        }
        if let Some(v) = other.bright_obs_gray_max {
            out.bright_obs_gray_max = v;
        }
        if let Some(v) = other.ref_star_outlier_n_sig {
            out.ref_star_outlier_n_sig = v;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn round_trips_through_json() {
        let config = FitConfig::default();
        let text = serde_json::to_string_pretty(&config).expect("serialize to json");
        let parsed: FitConfig = serde_json::from_str(&text).expect("parse json");
        assert_eq!(parsed.max_ccd_gray_err, config.max_ccd_gray_err);
    }

    #[test]
    fn round_trips_through_a_toml_file() {
        let config = FitConfig::default();
        let text = toml::to_string(&config).expect("serialize to toml");

        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        file.write_all(text.as_bytes()).expect("write temp file");

        let read_back = std::fs::read_to_string(file.path()).expect("read temp file");
        let parsed: FitConfig = toml::from_str(&read_back).expect("parse toml");
        assert_eq!(parsed.n_core, config.n_core);
        assert_eq!(parsed.max_iterations, config.max_iterations);
    }

    #[test]
    fn round_trips_through_a_yaml_file() {
        let config = FitConfig::default();
        let text = serde_yaml::to_string(&config).expect("serialize to yaml");

        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        file.write_all(text.as_bytes()).expect("write temp file");

        let read_back = std::fs::read_to_string(file.path()).expect("read temp file");
        let parsed: FitConfig = serde_yaml::from_str(&read_back).expect("parse yaml");
        assert_eq!(parsed.bright_obs_gray_max, config.bright_obs_gray_max);
    }

    #[test]
    fn override_merges_only_the_fields_a_user_actually_set() {
        let base = FitConfig::default();
        let text = indoc::indoc! {r#"
            nCore = 8
            refStarOutlierNSig = 5.0
        "#};
        let over: FitConfigOverride = toml::from_str(text).expect("parse override toml");
        let merged = base.merge(&over);

        assert_eq!(merged.n_core, 8);
        assert_eq!(merged.ref_star_outlier_n_sig, 5.0);
        assert_eq!(merged.n_star_per_run, base.n_star_per_run);
    }
}
