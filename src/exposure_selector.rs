// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Exposure Selector (SPEC_FULL.md §2.1 supplemented component).

Turns C7's per-exposure gray statistics into `expFlag` bits, plus an
"initial selection" pass usable before CCD gray has been computed at all.
Grounded on `fgcmExposureSelector.py`'s `FgcmExposureSelector`.
*/

use ndarray::Array1;

use crate::config::FitConfig;
use crate::constants::ILLEGAL_VALUE;
use crate::flags::exp_flag;

/// Reset `exp_flag` and set `NO_STARS` / `TOO_FEW_STARS` / `EXP_GRAY_TOO_NEGATIVE` /
/// `EXP_GRAY_TOO_POSITIVE` / `VAR_GRAY_TOO_LARGE` from C7's final gray
/// statistics (`fgcmExposureSelector.py::selectGoodExposures`).
pub fn select_good_exposures(
    config: &FitConfig,
    exp_band_index: &Array1<usize>,
    comp_n_good_star_per_exp: &Array1<usize>,
    comp_exp_gray: &Array1<f64>,
    comp_var_gray: &Array1<f64>,
    exp_flag_out: &mut Array1<u32>,
) {
    exp_flag_out.fill(0);
    let n_exp = exp_band_index.len();
    for e in 0..n_exp {
        let n_stars = comp_n_good_star_per_exp[e];
        if n_stars == 0 {
            exp_flag_out[e] |= exp_flag::NO_STARS;
            continue;
        }
        if n_stars < config.min_star_per_exp {
            exp_flag_out[e] |= exp_flag::TOO_FEW_STARS;
        }
        let band = exp_band_index[e];
        let low_cut = config
            .exp_gray_photometric_cut
            .get(band)
            .copied()
            .unwrap_or_else(|| *config.exp_gray_photometric_cut.last().unwrap());
        let high_cut = config
            .exp_gray_high_cut
            .get(band)
            .copied()
            .unwrap_or_else(|| *config.exp_gray_high_cut.last().unwrap());
        if comp_exp_gray[e] < low_cut {
            exp_flag_out[e] |= exp_flag::EXP_GRAY_TOO_NEGATIVE;
        }
        if comp_exp_gray[e] > high_cut {
            exp_flag_out[e] |= exp_flag::EXP_GRAY_TOO_POSITIVE;
        }
        if comp_var_gray[e] > config.exp_var_gray_photometric_cut {
            exp_flag_out[e] |= exp_flag::VAR_GRAY_TOO_LARGE;
        }
    }
}

/// The looser pre-CCD-gray pass, run once before the very first chi-squared
/// iteration so `FgcmBrightObs`/C6 have *some* notion of "plausibly
/// photometric" exposures to select stars from
/// (`fgcmExposureSelector.py::selectGoodExposuresInitialSelection`).
pub fn select_good_exposures_initial(
    config: &FitConfig,
    exp_gray_for_initial_selection: &Array1<f64>,
    exp_n_good_star_for_initial_selection: &Array1<usize>,
    exp_flag_out: &mut Array1<u32>,
) {
    exp_flag_out.fill(0);
    for e in 0..exp_flag_out.len() {
        if exp_n_good_star_for_initial_selection[e] < config.min_star_per_exp {
            exp_flag_out[e] |= exp_flag::TOO_FEW_STARS;
        }
        if exp_gray_for_initial_selection[e] != ILLEGAL_VALUE
            && exp_gray_for_initial_selection[e] < config.exp_gray_initial_cut
        {
            exp_flag_out[e] |= exp_flag::EXP_GRAY_TOO_NEGATIVE;
        }
    }
}

/// Flag every exposure on a night with too few surviving photometric,
/// non-extra-band exposures (`selectCalibratableNights`).
pub fn flag_bad_nights(
    config: &FitConfig,
    exp_night_index: &Array1<usize>,
    exp_extra_band_flag: &Array1<bool>,
    n_nights: usize,
    exp_flag_inout: &mut Array1<u32>,
) {
    let mut n_good_per_night = vec![0usize; n_nights];
    for e in 0..exp_night_index.len() {
        if exp_flag_inout[e] == 0 && !exp_extra_band_flag[e] {
            n_good_per_night[exp_night_index[e]] += 1;
        }
    }
    for e in 0..exp_night_index.len() {
        if n_good_per_night[exp_night_index[e]] < config.min_exp_per_night {
            exp_flag_inout[e] |= exp_flag::TOO_FEW_EXP_ON_NIGHT;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_stars_takes_priority_over_other_cuts() {
        let config = FitConfig::default();
        let exp_band_index = Array1::from_vec(vec![0, 0]);
        let n_good = Array1::from_vec(vec![0, 10]);
        let gray = Array1::from_vec(vec![0.0, 0.0]);
        let var = Array1::from_vec(vec![0.0, 0.0]);
        let mut out = Array1::zeros(2);
        select_good_exposures(&config, &exp_band_index, &n_good, &gray, &var, &mut out);
        assert_eq!(out[0], exp_flag::NO_STARS);
        assert_eq!(out[1], 0);
    }

    #[test]
    fn negative_exp_gray_is_flagged() {
        let config = FitConfig::default();
        let exp_band_index = Array1::from_vec(vec![0]);
        let n_good = Array1::from_vec(vec![10]);
        let gray = Array1::from_vec(vec![-1.0]);
        let var = Array1::from_vec(vec![0.0]);
        let mut out = Array1::zeros(1);
        select_good_exposures(&config, &exp_band_index, &n_good, &gray, &var, &mut out);
        assert_eq!(out[0] & exp_flag::EXP_GRAY_TOO_NEGATIVE, exp_flag::EXP_GRAY_TOO_NEGATIVE);
    }
}
