// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Stable numeric flag bitsets shared across outputs (spec.md §6).

Kept as plain `u32` bit constants rather than an enum, mirroring the
source's `objFlagDict`/`expFlagDict` dictionaries: callers persist these
bits to disk, so their numeric values must never change between releases.
*/

/// Bits for `Star::flag` (spec.md §3, §6).
pub mod obj_flag {
    /// Fewer than `minPerBand` good observations in a required band.
    pub const TOO_FEW_OBS: u32 = 1 << 0;
    /// Failed a configured band-difference color cut.
    pub const BAD_COLOR: u32 = 1 << 1;
    /// Flagged as photometrically variable.
    pub const VARIABLE: u32 = 1 << 2;
    /// Excluded as an outlier against the reference catalog.
    pub const REFSTAR_OUTLIER: u32 = 1 << 3;
}

/// Bits for `Exposure::flag` (spec.md §3, §6).
pub mod exp_flag {
    /// No good stars observed at all in this exposure.
    pub const NO_STARS: u32 = 1 << 0;
    /// Fewer than `minStarPerExp` good stars.
    pub const TOO_FEW_STARS: u32 = 1 << 1;
    /// Exposure gray fell below the photometric-negative cut.
    pub const EXP_GRAY_TOO_NEGATIVE: u32 = 1 << 2;
    /// Exposure gray rose above the photometric-positive cut.
    pub const EXP_GRAY_TOO_POSITIVE: u32 = 1 << 3;
    /// Exposure gray variance exceeded the photometric cut.
    pub const VAR_GRAY_TOO_LARGE: u32 = 1 << 4;
    /// This exposure's night has too few surviving photometric exposures.
    pub const TOO_FEW_EXP_ON_NIGHT: u32 = 1 << 5;
    /// This exposure was retrieved (PWV-retrieved night), informational.
    pub const EXPOSURE_RETRIEVED: u32 = 1 << 6;
}

lazy_static::lazy_static! {
    /// Stable bit-to-name table for `obj_flag`, in declaration order.
    /// Useful for help texts / diagnostics, e.g. a driver program printing
    /// why a star was excluded from the fit.
    static ref OBJ_FLAG_NAMES: Vec<(u32, &'static str)> = vec![
        (obj_flag::TOO_FEW_OBS, "TOO_FEW_OBS"),
        (obj_flag::BAD_COLOR, "BAD_COLOR"),
        (obj_flag::VARIABLE, "VARIABLE"),
        (obj_flag::REFSTAR_OUTLIER, "REFSTAR_OUTLIER"),
    ];

    /// Stable bit-to-name table for `exp_flag`.
    static ref EXP_FLAG_NAMES: Vec<(u32, &'static str)> = vec![
        (exp_flag::NO_STARS, "NO_STARS"),
        (exp_flag::TOO_FEW_STARS, "TOO_FEW_STARS"),
        (exp_flag::EXP_GRAY_TOO_NEGATIVE, "EXP_GRAY_TOO_NEGATIVE"),
        (exp_flag::EXP_GRAY_TOO_POSITIVE, "EXP_GRAY_TOO_POSITIVE"),
        (exp_flag::VAR_GRAY_TOO_LARGE, "VAR_GRAY_TOO_LARGE"),
        (exp_flag::TOO_FEW_EXP_ON_NIGHT, "TOO_FEW_EXP_ON_NIGHT"),
        (exp_flag::EXPOSURE_RETRIEVED, "EXPOSURE_RETRIEVED"),
    ];
}

/// Returns `true` if none of `flag`'s bits are set, i.e. the entity is
/// usable without qualification.
#[inline]
pub fn is_clean(flag: u32) -> bool {
    flag == 0
}

/// Every set bit of `flag`, named per `OBJ_FLAG_NAMES`, in declaration order.
pub fn describe_obj_flag(flag: u32) -> Vec<&'static str> {
    OBJ_FLAG_NAMES.iter().filter(|&&(bit, _)| flag & bit != 0).map(|&(_, name)| name).collect()
}

/// Every set bit of `flag`, named per `EXP_FLAG_NAMES`, in declaration order.
pub fn describe_exp_flag(flag: u32) -> Vec<&'static str> {
    EXP_FLAG_NAMES.iter().filter(|&&(bit, _)| flag & bit != 0).map(|&(_, name)| name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_obj_flag_lists_every_set_bit_in_order() {
        let flag = obj_flag::VARIABLE | obj_flag::TOO_FEW_OBS;
        assert_eq!(describe_obj_flag(flag), vec!["TOO_FEW_OBS", "VARIABLE"]);
    }

    #[test]
    fn describe_exp_flag_is_empty_for_a_clean_exposure() {
        assert!(describe_exp_flag(0).is_empty());
        assert!(is_clean(0));
    }
}
