// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Useful constants.

All constants *must* be double precision; this crate does as much of its
arithmetic as possible in double precision before narrowing, if narrowing
is ever required.
 */

pub use std::f64::consts::{FRAC_PI_2, PI, TAU};

/// `2.5 / ln(10)`, the constant relating flux ratios to magnitude
/// differences. Used throughout the SED slope estimator and the
/// chromatic-correction term in the chi-squared engine.
pub const MAG_CONSTANT: f64 = 2.5 / std::f64::consts::LN_10;

/// Sentinel magnitude value meaning "not computed" on any per-star or
/// per-observation magnitude-like field. Retained only at the boundary of
/// types that mirror on-disk columns; see `Design Notes` in SPEC_FULL.md.
pub const SENTINEL_MAG: f64 = 99.0;

/// Anything at or above this value is treated as "sentinel or worse" by
/// code that only has a `>=` check available (matches the source's
/// common `< 90.0` / `>= 90.0` idiom, which is deliberately looser than
/// the exact sentinel so that values corrupted upstream are still caught).
pub const SENTINEL_THRESHOLD: f64 = 90.0;

/// Value used to mark a gray/RMS/error computation that failed a
/// minimum-sample-size or positivity check. Distinct from `SENTINEL_MAG`
/// because it marks a failed *computation*, not an absent *input*.
pub const ILLEGAL_VALUE: f64 = -9999.0;

/// Minimum number of good stars required before a (exposure, CCD) gray
/// bin is considered well-determined; below this the computation is
/// numerically unstable (matches `fgcmGray.py`'s hard-coded `> 2`).
pub const MIN_STARS_FOR_GRAY: usize = 2;

/// Minimum number of good CCDs required before an exposure gray is
/// considered well-determined (matches `fgcmGray.py`'s hard-coded `> 2`).
pub const MIN_CCDS_FOR_EXPGRAY: usize = 2;

/// Threshold below which the number of reference stars is treated with
/// "small-number" (median/MAD) statistics rather than a Gaussian moment
/// fit, per `fgcmSigmaRef.py`.
pub const SMALL_NUMBER_REFSTAR_CUTOFF: usize = 100;

/// Scale factor turning a median absolute deviation into a Gaussian-
/// equivalent sigma (`1 / Phi^-1(3/4)`), as used by `fgcmSigmaRef.py`.
pub const MAD_TO_SIGMA: f64 = 1.4826;
