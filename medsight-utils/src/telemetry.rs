//! Stage timing for the analysis pipeline.
//!
//! A [`TimingGuard`] measures one scoped stage (decode, inference, compositing...) and reports
//! the duration under the `medsight::telemetry` log target when it is dropped. Reporting is
//! opt-in through [`configure`]; the guard still measures when reporting is off, so callers can
//! use [`TimingGuard::finish`] to obtain a wall-clock figure for responses.

use std::{
    borrow::Cow,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use log::{Level, LevelFilter, log, log_enabled};

use crate::config::TelemetrySettings;

/// Log target used for every timing record.
pub const TELEMETRY_TARGET: &str = "medsight::telemetry";

static TELEMETRY_ENABLED: AtomicBool = AtomicBool::new(false);
static TELEMETRY_LEVEL: AtomicUsize = AtomicUsize::new(0);

/// Scoped stopwatch that optionally logs its elapsed time on drop.
pub struct TimingGuard {
    label: Cow<'static, str>,
    level: Level,
    start: Instant,
    report: bool,
}

impl TimingGuard {
    /// Returns `true` when the guard will emit a log entry on drop.
    pub fn is_reporting(&self) -> bool {
        self.report
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the clock and return the elapsed time, logging it if reporting is active.
    pub fn finish(self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        if self.report {
            log!(
                target: TELEMETRY_TARGET,
                self.level,
                "{} took {:.2?}",
                self.label,
                self.start.elapsed()
            );
        }
    }
}

/// Start timing a stage. The record is emitted only when telemetry is enabled, `level` is within
/// the configured threshold, and the logger accepts `level` for the telemetry target.
pub fn timing_guard(label: impl Into<Cow<'static, str>>, level: Level) -> TimingGuard {
    let report = telemetry_allows(level) && log_enabled!(target: TELEMETRY_TARGET, level);
    TimingGuard {
        label: label.into(),
        level,
        start: Instant::now(),
        report,
    }
}

/// Apply telemetry preferences from settings.
pub fn configure(settings: &TelemetrySettings) {
    configure_with(settings.enabled, settings.level_filter());
}

pub fn configure_with(enabled: bool, level: LevelFilter) {
    TELEMETRY_ENABLED.store(enabled, Ordering::Relaxed);
    TELEMETRY_LEVEL.store(level as usize, Ordering::Relaxed);
}

pub fn telemetry_enabled() -> bool {
    TELEMETRY_ENABLED.load(Ordering::Relaxed)
}

/// Returns `true` when telemetry is enabled and `level` is within the configured threshold.
pub fn telemetry_allows(level: Level) -> bool {
    telemetry_enabled() && (level as usize) <= TELEMETRY_LEVEL.load(Ordering::Relaxed)
}
