// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
C4: Star & Observation Store.

Owns star positions, per-observation foreign keys, per-star mean
magnitudes, SED slopes, reference-catalog magnitudes and flags, and
provides the "good star / good observation" selection that C6 partitions
work around (spec.md §4.4).

Grounded on `fgcmStars.py`'s `FgcmStars` (field layout: `objObsIndex`/
`objNobs`/`obsIndex` contiguous-grouping scheme, `selectStarsMinObs`) and
`getGoodStarIndices`/`getGoodObsIndices` as named in spec.md §4.4. The
mean-magnitude arrays that C6 writes concurrently (`objMagStdMean`,
`objMagStdMeanErr`, `objMagStdMeanNoChrom`, `objSEDSlope`) live in the
`SharedArrayPool` (C1) rather than as plain fields, so the mutex discipline
described in spec.md §4.6/§5 is real rather than assumed.
*/

use ndarray::{Array1, Array2};
use thiserror::Error;

use crate::array_pool::{ArrayHandle1, SharedArrayPool};
use crate::constants::SENTINEL_MAG;
use crate::flags::obj_flag;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("observation table columns have mismatched lengths")]
    RaggedObservationTable,

    #[error("position index table violates the OBSARRINDEX contiguity contract at star {star}: expected next start {expected}, got {got}")]
    BrokenPositionIndex { star: usize, expected: usize, got: usize },

    #[error("no good stars found (includeReserve={include_reserve}, checkMinObs={check_min_obs})")]
    NoGoodStars { include_reserve: bool, check_min_obs: bool },

    #[error("no good observations in band {band}")]
    NoGoodObservationsInBand { band: usize },
}

/// Static per-band bookkeeping: which bands are required for a star to be
/// usable in the fit, which are "extra" (redward of the required set, used
/// only when present), and the standard wavelength of each band used by
/// the SED slope estimator (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct BandConfig {
    pub n_bands: usize,
    pub band_required_index: Vec<usize>,
    pub band_extra_index: Vec<usize>,
    pub min_obs_per_band: usize,
    pub lambda_std: Vec<f64>,
}

/// Per-observation foreign keys and scalars (spec.md §3 Observation
/// entity). `mag_std` is the only mutable field (rewritten every fit
/// iteration by C6 Phase A) and is therefore owned by the `StarCatalog`'s
/// `SharedArrayPool`, not stored here.
#[derive(Debug, Clone)]
pub struct ObservationTable {
    pub exp_index: Array1<usize>,
    pub band_index: Array1<usize>,
    pub filter_index: Array1<usize>,
    pub ccd_index: Array1<usize>,
    pub obj_index: Array1<usize>,
    pub mag_adu: Array1<f64>,
    pub mag_adu_model_err: Array1<f64>,
    pub sec_zenith: Array1<f64>,
    pub x: Array1<f64>,
    pub y: Array1<f64>,
    pub flag: Array1<u32>,
}

impl ObservationTable {
    pub fn n_obs(&self) -> usize {
        self.exp_index.len()
    }

    fn validate(&self) -> Result<(), StoreError> {
        let n = self.n_obs();
        let ok = self.band_index.len() == n
            && self.filter_index.len() == n
            && self.ccd_index.len() == n
            && self.obj_index.len() == n
            && self.mag_adu.len() == n
            && self.mag_adu_model_err.len() == n
            && self.sec_zenith.len() == n
            && self.x.len() == n
            && self.y.len() == n
            && self.flag.len() == n;
        if !ok {
            return Err(StoreError::RaggedObservationTable);
        }
        Ok(())
    }
}

/// Star/object store (C4). `obs_arr_index`/`n_obs`/`obs_index` reproduce
/// the external position-index and observation-index tables (spec.md §6):
/// star `k`'s observations are the rows
/// `obs_index[obs_arr_index[k]..obs_arr_index[k]+n_obs[k]]` of an
/// `ObservationTable`.
pub struct StarCatalog {
    pool: SharedArrayPool,

    pub id: Array1<i64>,
    pub ra: Array1<f64>,
    pub dec: Array1<f64>,
    pub obs_arr_index: Array1<usize>,
    pub n_obs: Array1<usize>,
    pub obs_index: Array1<usize>,
    pub flag: Array1<u32>,
    /// Stars held out of the fit for cross-validation; `includeReserve`
    /// toggles whether `good_star_indices` admits them (spec.md §4.4).
    pub is_reserve: Array1<bool>,
    pub ref_index: Array1<i64>,
    pub ref_mag: Array2<f64>,
    pub ref_mag_err: Array2<f64>,
    pub n_good_obs: Array2<usize>,

    mag_std_mean: ArrayHandle1,
    mag_std_mean_err: ArrayHandle1,
    mag_std_mean_no_chrom: ArrayHandle1,
    sed_slope: ArrayHandle1,

    pub band_config: BandConfig,
}

impl StarCatalog {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Array1<i64>,
        ra: Array1<f64>,
        dec: Array1<f64>,
        obs_arr_index: Array1<usize>,
        n_obs: Array1<usize>,
        obs_index: Array1<usize>,
        band_config: BandConfig,
    ) -> Result<Self, StoreError> {
        let n_stars = id.len();
        for k in 0..n_stars.saturating_sub(1) {
            let expected = obs_arr_index[k] + n_obs[k];
            if obs_arr_index[k + 1] != expected {
                return Err(StoreError::BrokenPositionIndex { star: k, expected, got: obs_arr_index[k + 1] });
            }
        }

        let n_bands = band_config.n_bands;
        let mut pool = SharedArrayPool::new();
        let mag_std_mean = pool.create_1d(n_stars * n_bands, SENTINEL_MAG);
        let mag_std_mean_err = pool.create_1d(n_stars * n_bands, SENTINEL_MAG);
        let mag_std_mean_no_chrom = pool.create_1d(n_stars * n_bands, SENTINEL_MAG);
        let sed_slope = pool.create_1d(n_stars * n_bands, 0.0);

        Ok(Self {
            pool,
            flag: Array1::zeros(n_stars),
            is_reserve: Array1::from_elem(n_stars, false),
            ref_index: Array1::from_elem(n_stars, -1),
            ref_mag: Array2::from_elem((n_stars, n_bands), SENTINEL_MAG),
            ref_mag_err: Array2::from_elem((n_stars, n_bands), SENTINEL_MAG),
            n_good_obs: Array2::zeros((n_stars, n_bands)),
            id,
            ra,
            dec,
            obs_arr_index,
            n_obs,
            obs_index,
            mag_std_mean,
            mag_std_mean_err,
            mag_std_mean_no_chrom,
            sed_slope,
            band_config,
        })
    }

    pub fn n_stars(&self) -> usize {
        self.id.len()
    }

    pub fn n_bands(&self) -> usize {
        self.band_config.n_bands
    }

    fn flat(&self, star: usize, band: usize) -> usize {
        star * self.n_bands() + band
    }

    pub fn mag_std_mean(&self, star: usize, band: usize) -> f64 {
        self.pool.lock_1d(self.mag_std_mean)[self.flat(star, band)]
    }

    pub fn set_mag_std_mean(&self, star: usize, band: usize, v: f64) {
        self.pool.lock_1d(self.mag_std_mean)[self.flat(star, band)] = v;
    }

    pub fn mag_std_mean_err(&self, star: usize, band: usize) -> f64 {
        self.pool.lock_1d(self.mag_std_mean_err)[self.flat(star, band)]
    }

    pub fn set_mag_std_mean_err(&self, star: usize, band: usize, v: f64) {
        self.pool.lock_1d(self.mag_std_mean_err)[self.flat(star, band)] = v;
    }

    pub fn mag_std_mean_no_chrom(&self, star: usize, band: usize) -> f64 {
        self.pool.lock_1d(self.mag_std_mean_no_chrom)[self.flat(star, band)]
    }

    pub fn set_mag_std_mean_no_chrom(&self, star: usize, band: usize, v: f64) {
        self.pool.lock_1d(self.mag_std_mean_no_chrom)[self.flat(star, band)] = v;
    }

    pub fn sed_slope(&self, star: usize, band: usize) -> f64 {
        self.pool.lock_1d(self.sed_slope)[self.flat(star, band)]
    }

    pub fn set_sed_slope(&self, star: usize, band: usize, v: f64) {
        self.pool.lock_1d(self.sed_slope)[self.flat(star, band)] = v;
    }

    /// All `ObservationTable` rows belonging to `star`, in stored order.
    pub fn obs_rows_for_star<'a>(&'a self, star: usize) -> impl Iterator<Item = usize> + 'a {
        let start = self.obs_arr_index[star];
        let n = self.n_obs[star];
        (start..start + n).map(move |i| self.obs_index[i])
    }

    /// Stars passing the required-band minimum-observation criterion and
    /// not carrying disqualifying flags (spec.md §4.4).
    pub fn good_star_indices(&self, include_reserve: bool, check_min_obs: bool) -> Vec<usize> {
        (0..self.n_stars())
            .filter(|&s| {
                if self.flag[s] != 0 {
                    return false;
                }
                if !include_reserve && self.is_reserve[s] {
                    return false;
                }
                if check_min_obs {
                    self.band_config
                        .band_required_index
                        .iter()
                        .all(|&b| self.n_good_obs[[s, b]] >= self.band_config.min_obs_per_band)
                } else {
                    true
                }
            })
            .collect()
    }

    /// For each good star (in the order given), the subset of its
    /// observation rows whose exposure is not flagged and whose own flag
    /// is clean. Returns `(goodStarsSub, goodObs)` where `goodStarsSub[i]`
    /// is the index into `good_stars` owning `good_obs[i]` — the
    /// load-bearing grouping property from spec.md §4.4: a star's
    /// observations are always contiguous in the returned `good_obs`.
    pub fn good_obs_indices(
        &self,
        good_stars: &[usize],
        obs: &ObservationTable,
        exp_flag: &Array1<u32>,
    ) -> Result<(Vec<usize>, Vec<usize>), StoreError> {
        obs.validate()?;
        let mut good_stars_sub = Vec::new();
        let mut good_obs = Vec::new();
        for (k, &star) in good_stars.iter().enumerate() {
            for row in self.obs_rows_for_star(star) {
                if obs.flag[row] != 0 {
                    continue;
                }
                if exp_flag[obs.exp_index[row]] != 0 {
                    continue;
                }
                good_stars_sub.push(k);
                good_obs.push(row);
            }
        }
        Ok((good_stars_sub, good_obs))
    }

    /// Reference stars eligible to anchor the absolute throughput / sigma
    /// calculations: a good star, carrying a reference magnitude in
    /// `band`, not flagged `REFSTAR_OUTLIER`.
    pub fn good_ref_star_indices(&self, good_stars: &[usize], band: usize) -> Vec<usize> {
        good_stars
            .iter()
            .copied()
            .filter(|&s| {
                self.ref_index[s] >= 0
                    && (self.flag[s] & obj_flag::REFSTAR_OUTLIER) == 0
                    && self.ref_mag[[s, band]] < crate::constants::SENTINEL_THRESHOLD
                    && self.mag_std_mean(s, band) < crate::constants::SENTINEL_THRESHOLD
            })
            .collect()
    }

    /// Per-band inverse-variance-weighted offset between `magStdMean` and
    /// the reference catalog, used by C6's optional absolute-throughput
    /// correction (spec.md §4.6 "computeAbsOffset", delegated to C4).
    /// Unlike `sigma_ref`'s robust offset/scatter, this is a plain
    /// weighted mean: the abs-throughput pass runs every chi-squared
    /// iteration and needs to be cheap, not robust against outliers.
    pub fn compute_abs_offset(&self, good_stars: &[usize], band: usize) -> Option<f64> {
        let refs = self.good_ref_star_indices(good_stars, band);
        if refs.is_empty() {
            return None;
        }
        let (mut num, mut den) = (0.0, 0.0);
        for s in refs {
            let err2 = self.ref_mag_err[[s, band]].powi(2).max(1e-6);
            let w = 1.0 / err2;
            num += w * (self.mag_std_mean(s, band) - self.ref_mag[[s, band]]);
            den += w;
        }
        Some(num / den)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band_config() -> BandConfig {
        BandConfig {
            n_bands: 2,
            band_required_index: vec![0, 1],
            band_extra_index: vec![],
            min_obs_per_band: 1,
            lambda_std: vec![4800.0, 6200.0],
        }
    }

    fn trivial_catalog(n_stars: usize) -> StarCatalog {
        let mut cat = StarCatalog::new(
            Array1::from_iter((0..n_stars as i64).map(|i| i)),
            Array1::zeros(n_stars),
            Array1::zeros(n_stars),
            Array1::from_iter((0..n_stars).map(|i| i * 2)),
            Array1::from_elem(n_stars, 2),
            Array1::from_iter(0..n_stars * 2),
            band_config(),
        )
        .unwrap();
        for s in 0..n_stars {
            cat.n_good_obs[[s, 0]] = 2;
            cat.n_good_obs[[s, 1]] = 2;
        }
        cat
    }

    #[test]
    fn position_index_contiguity_is_checked() {
        let err = StarCatalog::new(
            Array1::from_vec(vec![0, 1]),
            Array1::zeros(2),
            Array1::zeros(2),
            Array1::from_vec(vec![0, 2]),
            Array1::from_vec(vec![2, 1]),
            Array1::from_vec(vec![0, 1, 2]),
            band_config(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::BrokenPositionIndex { .. }));
    }

    #[test]
    fn partitioning_invariant_holds() {
        let cat = trivial_catalog(5);
        let obs = ObservationTable {
            exp_index: Array1::zeros(10),
            band_index: Array1::from_iter((0..10).map(|i| i % 2)),
            filter_index: Array1::zeros(10),
            ccd_index: Array1::zeros(10),
            obj_index: Array1::from_iter((0..10).map(|i| i / 2)),
            mag_adu: Array1::from_elem(10, 20.0),
            mag_adu_model_err: Array1::from_elem(10, 0.01),
            sec_zenith: Array1::from_elem(10, 1.1),
            x: Array1::zeros(10),
            y: Array1::zeros(10),
            flag: Array1::zeros(10),
        };
        let good_stars = cat.good_star_indices(false, true);
        assert_eq!(good_stars.len(), 5);
        let exp_flag = Array1::zeros(1);
        let (good_stars_sub, good_obs) = cat.good_obs_indices(&good_stars, &obs, &exp_flag).unwrap();
        assert_eq!(good_obs.len(), 10);
        // star(good_obs[i]) must be monotonically non-decreasing in i.
        let star_of = |row: usize| obs.obj_index[row];
        let mut last = star_of(good_obs[0]);
        for &row in &good_obs[1..] {
            let s = star_of(row);
            assert!(s >= last);
            last = s;
        }
        // goodStarsSub indexes back into good_stars consistently.
        for (i, &row) in good_obs.iter().enumerate() {
            assert_eq!(good_stars[good_stars_sub[i]], star_of(row));
        }
    }

    #[test]
    fn mean_magnitude_round_trips_through_the_array_pool() {
        let cat = trivial_catalog(2);
        assert_eq!(cat.mag_std_mean(0, 0), SENTINEL_MAG);
        cat.set_mag_std_mean(0, 0, 18.5);
        assert_eq!(cat.mag_std_mean(0, 0), 18.5);
        assert_eq!(cat.mag_std_mean(1, 0), SENTINEL_MAG);
    }
}
