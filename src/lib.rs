// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A Forward Global Calibration Model (FGCM) fitting engine for wide-field
//! photometric surveys.
//!
//! This crate implements the parallel chi-squared/gradient fit kernel and
//! its supporting per-exposure quality layer: given a corpus of raw
//! per-observation instrumental magnitudes, it fits a forward atmosphere +
//! instrument model so every observation can be standardised and every
//! star given a self-consistent mean magnitude. FITS I/O, star matching,
//! the atmospheric radiative-transfer code that populates the LUT, config
//! parsing, plotting and the outer bound-constrained minimiser are out of
//! scope; this crate exposes the interfaces those collaborators drive.

pub mod array_pool;
pub mod bright_obs;
pub mod chisq;
pub mod config;
pub(crate) mod constants;
pub mod error;
pub mod exposure_selector;
pub mod flags;
pub mod gray;
pub mod logging;
pub mod lut;
pub mod params;
pub mod sed;
pub mod sigma_ref;
pub mod store;

pub use chisq::{ChisqEngine, ChisqError, ChisqInputs, ChisqOutput};
pub use config::{FitConfig, FitConfigOverride};
pub use error::FgcmError;
pub use gray::{GrayAggregator, GrayError};
pub use lut::Lut;
pub use params::{FgcmParameters, ParamLayout};
pub use store::{ObservationTable, StarCatalog, StoreError};
