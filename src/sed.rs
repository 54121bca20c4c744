// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
C5: SED Slope Estimator.

A pure per-star computation over band-mean magnitudes (spec.md §4.5),
grounded directly on `computeObjectSEDSlope` in `fgcmStars.py`. Modelled as
a free function rather than a struct, as in the source: it has no state of
its own beyond the per-band standard wavelengths and fudge factors already
held by `store::BandConfig`/`FitConfig`.
*/

use itertools::Itertools;

use crate::constants::{MAG_CONSTANT, SENTINEL_THRESHOLD};

/// Compute the SED slope for one star across all bands.
///
/// `band_means` is the star's current `magStdMean` per band (pre- or
/// post-chromatic; the source calls this on the pre-chromatic pass).
/// `lambda_std` is the standard wavelength of each band. `fit_band_fudge`
/// are the two extrapolation fudge factors for the first and last
/// *required* band; `extra_band_fudge[i]` is the factor for the `i`-th
/// extra (redward) band in `band_extra_index`.
///
/// Returns a slope per band, zeroed everywhere if any required-band mean
/// is at or beyond the sentinel threshold (spec.md §4.5: "If any
/// required-band mean is the sentinel, slopes for the star are set to 0").
pub fn compute_sed_slope(
    band_means: &[f64],
    band_required_index: &[usize],
    band_extra_index: &[usize],
    lambda_std: &[f64],
    fit_band_fudge: (f64, f64),
    extra_band_fudge: &[f64],
) -> Vec<f64> {
    let n_bands = band_means.len();
    let mut slope = vec![0.0; n_bands];

    if band_required_index
        .iter()
        .any(|&b| band_means[b] >= SENTINEL_THRESHOLD)
    {
        return slope;
    }

    // Band-adjacent flux-like color differences (spec.md §4.5: "S[i] =
    // -(1/k) * (mean[i+1] - mean[i]) / (lambda_std[i+1] - lambda_std[i])").
    let k = MAG_CONSTANT;
    let s: Vec<f64> = band_means
        .iter()
        .zip(lambda_std.iter())
        .tuple_windows()
        .map(|((mean_lo, lambda_lo), (mean_hi, lambda_hi))| {
            -(1.0 / k) * (mean_hi - mean_lo) / (lambda_hi - lambda_lo)
        })
        .collect();
    debug_assert_eq!(s.len(), n_bands - 1);

    let first = band_required_index[0];
    let last = *band_required_index.last().unwrap();

    if band_required_index.len() == 1 {
        // A single required band has no adjacent color to average or
        // extrapolate from; leave its slope at zero, same as the
        // "cannot compute" branch.
        return slope;
    }

    // First required band: extrapolate using the second-order term built
    // from the first two color differences.
    slope[first] = s[first]
        + fit_band_fudge.0 * ((lambda_std[first + 1] - lambda_std[first]) / (lambda_std[first + 2] - lambda_std[first]))
            * (s[first + 1] - s[first]);

    // Interior required bands: a straight average of neighbouring colors.
    for &b in &band_required_index[1..band_required_index.len() - 1] {
        slope[b] = (s[b - 1] + s[b]) / 2.0;
    }

    // Last required band: extrapolate from the reddest two colors.
    slope[last] = s[last - 1]
        + fit_band_fudge.1 * ((lambda_std[last] - lambda_std[last - 1]) / (lambda_std[last] - lambda_std[last - 2]))
            * (s[last - 1] - s[last - 2]);

    // Extra (redward) bands reuse the reddest extrapolation, each with its
    // own fudge factor, and only when that band's own mean is present.
    for (i, &b) in band_extra_index.iter().enumerate() {
        if band_means[b] >= SENTINEL_THRESHOLD {
            continue;
        }
        let fudge = extra_band_fudge.get(i).copied().unwrap_or(1.0);
        slope[b] = s[last - 1]
            + fudge * ((lambda_std[last] - lambda_std[last - 1]) / (lambda_std[last] - lambda_std[last - 2]))
                * (s[last - 1] - s[last - 2]);
    }

    slope
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn linearly_rising_sed_gives_constant_slope_across_required_bands() {
        // Magnitudes falling linearly with wavelength => constant color
        // difference => constant slope after averaging (spec.md §8
        // Testable Property 5).
        let lambda_std = vec![4000.0, 5000.0, 6000.0, 7000.0];
        let band_means = vec![20.0, 19.0, 18.0, 17.0];
        let required = vec![0, 1, 2, 3];
        let slope = compute_sed_slope(&band_means, &required, &[], &lambda_std, (1.0, 1.0), &[]);
        for w in slope.windows(2) {
            assert_abs_diff_eq!(w[0], w[1], epsilon = 1e-9);
        }
    }

    #[test]
    fn sentinel_in_required_band_zeroes_all_slopes() {
        let lambda_std = vec![4000.0, 5000.0, 6000.0];
        let band_means = vec![20.0, 99.0, 18.0];
        let required = vec![0, 1, 2];
        let slope = compute_sed_slope(&band_means, &required, &[], &lambda_std, (1.0, 1.0), &[]);
        assert!(slope.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn extra_band_reuses_reddest_extrapolation() {
        let lambda_std = vec![4000.0, 5000.0, 6000.0, 8000.0];
        let band_means = vec![20.0, 19.0, 18.0, 17.5];
        let required = vec![0, 1, 2];
        let extra = vec![3];
        let slope = compute_sed_slope(&band_means, &required, &extra, &lambda_std, (1.0, 1.0), &[1.0]);
        assert!(slope[3] != 0.0);
    }
}
