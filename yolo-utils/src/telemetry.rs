//! Lightweight timing utilities for optional performance tracing.
//!
//! A [`TimingGuard`] records how long a scope took and logs it on drop under
//! the `yolo::telemetry` target. Guards only become active when telemetry has
//! been switched on through [`configure`] *and* the logger accepts the level,
//! so an inactive guard costs one `Instant::now()`.

use std::{
    borrow::Cow,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
    time::{Duration, Instant},
};

use log::{Level, LevelFilter, log, log_enabled};

use crate::TELEMETRY_LOG_TARGET;

static TELEMETRY_ENABLED: AtomicBool = AtomicBool::new(false);
static TELEMETRY_LEVEL: AtomicU8 = AtomicU8::new(0);

/// RAII helper that logs how long an operation took when dropped.
pub struct TimingGuard {
    label: Cow<'static, str>,
    level: Level,
    start: Instant,
    active: bool,
}

impl TimingGuard {
    fn new(label: Cow<'static, str>, level: Level, active: bool) -> Self {
        Self {
            label,
            level,
            start: Instant::now(),
            active,
        }
    }

    /// Returns `true` when the guard will emit a log entry on drop.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Label reported alongside the duration.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Elapsed time since the guard was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Consume the guard without logging and return the elapsed duration.
    pub fn finish(mut self) -> Duration {
        self.active = false;
        self.start.elapsed()
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let duration = self.start.elapsed();
        log!(
            target: TELEMETRY_LOG_TARGET,
            self.level,
            "{} completed in {:.2?}",
            self.label,
            duration
        );
    }
}

/// Create a timing guard that activates when telemetry allows `level`.
pub fn timing_guard(label: impl Into<Cow<'static, str>>, level: Level) -> TimingGuard {
    timing_guard_if(label, level, true)
}

/// Create a timing guard that additionally respects a caller-provided flag.
pub fn timing_guard_if(
    label: impl Into<Cow<'static, str>>,
    level: Level,
    enabled: bool,
) -> TimingGuard {
    let active =
        enabled && telemetry_allows(level) && log_enabled!(target: TELEMETRY_LOG_TARGET, level);
    TimingGuard::new(label.into(), level, active)
}

/// Configure the global telemetry state.
pub fn configure(enabled: bool, level: LevelFilter) {
    TELEMETRY_ENABLED.store(enabled, Ordering::Relaxed);
    TELEMETRY_LEVEL.store(level as usize as u8, Ordering::Relaxed);
}

/// Returns whether telemetry logging is currently enabled.
pub fn telemetry_enabled() -> bool {
    TELEMETRY_ENABLED.load(Ordering::Relaxed)
}

/// Returns the maximum telemetry logging level.
pub fn telemetry_level() -> LevelFilter {
    LevelFilter::iter()
        .nth(TELEMETRY_LEVEL.load(Ordering::Relaxed) as usize)
        .unwrap_or(LevelFilter::Off)
}

/// Returns `true` when telemetry is enabled and `level` is within the threshold.
pub fn telemetry_allows(level: Level) -> bool {
    telemetry_enabled() && level <= telemetry_level()
}
