// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Logging setup, grounded on the teacher's `fern` + `chrono` + `colored`
dependency stack (`Cargo.toml`: `fern = { version = "0.6.0", features =
["chrono", "colored"] }`). This crate is a library, not a binary, so unlike
the teacher's CLI entry points it does not call this itself; a driver
program embedding the fitting engine is expected to call `init_logging`
once at startup. Kept here so the ambient stack is real and testable
rather than assumed.
*/

use log::LevelFilter;

/// Build a terminal progress bar over `n` units of work, styled the way the
/// teacher's `di_calibrate::make_calibration_progress_bar` does: a bar,
/// position/length, and an ETA. Used by `ChisqEngine::run` to report
/// progress over its per-chunk reduction when `FitConfig::show_progress`
/// is set; callers that don't want terminal output never call this.
pub fn make_chisq_progress_bar(n: u64) -> indicatif::ProgressBar {
    let pb = indicatif::ProgressBar::new(n);
    pb.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_secs}s] [{bar:40.cyan/blue}] {pos}/{len} chunks ({eta})")
            .expect("valid progress bar template")
            .progress_chars("#>-"),
    );
    pb
}

/// Install a `fern`-based global logger at the given level. Safe to call
/// more than once in tests via `let _ = init_logging(..)`, since a second
/// `fern::Dispatch::apply` call simply errors (already-set loggers are
/// left in place).
pub fn init_logging(level: LevelFilter) -> Result<(), fern::InitError> {
    let colors = fern::colors::ColoredLevelConfig::new()
        .info(fern::colors::Color::Green)
        .warn(fern::colors::Color::Yellow)
        .error(fern::colors::Color::Red)
        .debug(fern::colors::Color::Blue)
        .trace(fern::colors::Color::Magenta);

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    // `fern::Dispatch::apply` installs a process-wide global logger, so
    // tests that call `init_logging` must not run concurrently with each
    // other (or with any other test that installs a logger).
    #[test]
    #[serial]
    fn init_logging_succeeds_on_first_install() {
        let _ = init_logging(LevelFilter::Debug);
        log::info!("logging initialised for test");
    }
}
