// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Top-level error type, rolling up every subsystem error into one enum that
callers can match on without reaching into each module. Mirrors the
teacher's `HyperdriveError` pattern: one `From` impl per subsystem,
subsystem variants kept alongside for anyone who wants the narrower type.
 */

use thiserror::Error;

use crate::chisq::ChisqError;
use crate::gray::GrayError;
use crate::params::ParamError;
use crate::sigma_ref::SigmaRefError;
use crate::store::StoreError;

/// Any error that can come out of the FGCM fitting engine.
#[derive(Error, Debug)]
pub enum FgcmError {
    #[error("parameter model error: {0}")]
    Param(#[from] ParamError),

    #[error("star/observation store error: {0}")]
    Store(#[from] StoreError),

    #[error("chi-squared engine error: {0}")]
    Chisq(#[from] ChisqError),

    #[error("gray aggregator error: {0}")]
    Gray(#[from] GrayError),

    #[error("reference-sigma error: {0}")]
    SigmaRef(#[from] SigmaRefError),
}

/// Errors associated with inconsistent or contradictory fit configuration
/// (spec.md §7 `ConfigError`).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("allExposures and computeDerivatives cannot both be set: gradients are only meaningful for the fit-band subset")]
    AllExposuresWithDerivatives,

    #[error("useRetrievedPwv and hasExternalPwv are mutually exclusive PWV sources")]
    ConflictingPwvSource,
}
