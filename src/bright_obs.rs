// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
C8: Bright-Observation Selector.

Seeds `magStdMean`/`nGoodObs` for every star from its brightest, mutually
consistent observations per band, ahead of the first chi-squared pass
(spec.md §4.8), grounded on `fgcmBrightObs.py::FgcmBrightObs._worker`.

The source's `_worker` is a module-level method dispatched through a
`multiprocessing.Pool`, but references `i` and `fgcmPars` without either
being a parameter, a `self` attribute, or a module global — it happens to
run at all only because, in the `debug` branch, `xrange(self.fgcmStars.nStars)`
binds a loop variable named `i` in the *caller's* frame and Python's
enclosing-scope lookup then finds it there by accident, and `fgcmPars`
resolves the same way purely because some script at the call site happens
to define a global of that name. Neither is an intentional API; under the
`Pool.map` branch actually exercised in production there is no such
binding and the worker would raise `NameError`. [`per_star_selection`]
below is the same per-band bright-observation cut made an honest pure
function: the star index and the per-exposure flag table are explicit
parameters rather than names the callee hopes are lying around in an
enclosing scope.
*/

use ndarray::Array1;

use crate::constants::SENTINEL_MAG;
use crate::store::{ObservationTable, StarCatalog};

/// One star's result: per band, the number of bright observations found
/// and their unweighted mean magnitude (`None` when the band had no
/// surviving observations at all, which maps to sentinel at apply time).
pub struct StarSelection {
    pub star: usize,
    pub per_band: Vec<Option<(usize, f64)>>,
}

/// Compute [`StarSelection`] for one star: find the brightest observation
/// in each band among its good-exposure observations, then average every
/// observation within `bright_obs_gray_max` of it. Reads only through its
/// arguments, so independent stars can be computed concurrently.
pub fn per_star_selection(
    star: usize,
    stars: &StarCatalog,
    obs: &ObservationTable,
    mag_std: &Array1<f64>,
    exp_flag: &Array1<u32>,
    bright_obs_gray_max: f64,
) -> StarSelection {
    let n_bands = stars.n_bands();
    let rows: Vec<usize> = stars
        .obs_rows_for_star(star)
        .filter(|&row| exp_flag[obs.exp_index[row]] == 0)
        .collect();

    let mut per_band = Vec::with_capacity(n_bands);
    for band in 0..n_bands {
        let band_rows: Vec<usize> = rows.iter().copied().filter(|&row| obs.band_index[row] == band).collect();
        if band_rows.is_empty() {
            per_band.push(None);
            continue;
        }

        let min_mag = band_rows
            .iter()
            .map(|&row| mag_std[row])
            .fold(f64::INFINITY, f64::min);
        let bright: Vec<usize> = band_rows
            .iter()
            .copied()
            .filter(|&row| mag_std[row] - min_mag <= bright_obs_gray_max)
            .collect();
        let mean = bright.iter().map(|&row| mag_std[row]).sum::<f64>() / bright.len() as f64;
        per_band.push(Some((bright.len(), mean)));
    }

    StarSelection { star, per_band }
}

/// Compute every good star's [`StarSelection`] in parallel, then commit
/// the results to `stars` (`FgcmBrightObs.selectGoodStars`). The commit
/// pass is sequential: `n_good_obs` is a plain `Array2`, not pool-backed
/// like the mean-magnitude arrays, since nothing else writes it
/// concurrently once this runs.
pub fn select_good_stars(
    stars: &mut StarCatalog,
    obs: &ObservationTable,
    mag_std: &Array1<f64>,
    exp_flag: &Array1<u32>,
    good_stars: &[usize],
    bright_obs_gray_max: f64,
) {
    use rayon::prelude::*;

    for &star in good_stars {
        for band in 0..stars.n_bands() {
            stars.set_mag_std_mean_err(star, band, SENTINEL_MAG);
        }
    }

    let stars_ref: &StarCatalog = stars;
    let selections: Vec<StarSelection> = good_stars
        .par_iter()
        .map(|&star| per_star_selection(star, stars_ref, obs, mag_std, exp_flag, bright_obs_gray_max))
        .collect();

    for selection in selections {
        for (band, result) in selection.per_band.into_iter().enumerate() {
            match result {
                Some((n, mean)) => {
                    stars.n_good_obs[[selection.star, band]] = n;
                    stars.set_mag_std_mean(selection.star, band, mean);
                }
                None => {
                    stars.n_good_obs[[selection.star, band]] = 0;
                    stars.set_mag_std_mean(selection.star, band, SENTINEL_MAG);
                }
            }
        }
    }
}
