use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::US::Central;
use tracing::{info, warn};

use crate::errors::ConfigError;
use crate::pipeline::{PipelineState, run_iteration};

/// Sleep between iterations during the business-hours window.
const PEAK_SLEEP: Duration = Duration::from_secs(10 * 60);
/// Sleep between iterations outside the business-hours window.
const OFF_PEAK_SLEEP: Duration = Duration::from_secs(60 * 60);
/// First hour (inclusive) of the peak window, US Central local time.
const PEAK_START_HOUR: u32 = 6;
/// Last hour (inclusive) of the peak window, US Central local time.
const PEAK_END_HOUR: u32 = 21;

/// How a completed run loop ended.
#[derive(Debug, PartialEq, Eq)]
pub enum RunEnd {
    /// Single-shot execution finished normally.
    Completed,
    /// A termination signal stopped the loop; exit with this signal number.
    Signaled(i32),
}

/// Cooperative shutdown flag set asynchronously by SIGINT/SIGTERM.
pub struct ShutdownFlag {
    signal: Arc<AtomicUsize>,
}

impl ShutdownFlag {
    /// Install handlers for the interrupt and termination signals.
    pub fn install() -> Result<Self, ConfigError> {
        let signal = Arc::new(AtomicUsize::new(0));
        for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::flag::register_usize(sig, Arc::clone(&signal), sig as usize)?;
        }
        Ok(Self { signal })
    }

    /// Signal number received so far, if any.
    pub fn received(&self) -> Option<i32> {
        match self.signal.load(Ordering::Relaxed) {
            0 => None,
            sig => Some(sig as i32),
        }
    }
}

/// Conventional name for the signals the loop listens for.
pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        signal_hook::consts::SIGINT => "SIGINT",
        signal_hook::consts::SIGTERM => "SIGTERM",
        _ => "signal",
    }
}

/// Sleep interval for the moment `now`: short while US Central local time is
/// inside the business-hours window, long otherwise.
pub fn sleep_interval(now: DateTime<Utc>) -> Duration {
    let hour = now.with_timezone(&Central).hour();
    if (PEAK_START_HOUR..=PEAK_END_HOUR).contains(&hour) {
        PEAK_SLEEP
    } else {
        OFF_PEAK_SLEEP
    }
}

/// Drive the pipeline until single-shot completion or a termination signal.
/// Fatal source/config failures propagate immediately.
pub fn run_loop(
    state: &mut PipelineState,
    once: bool,
    shutdown: &ShutdownFlag,
) -> Result<RunEnd, ConfigError> {
    loop {
        let iteration_start = Instant::now();
        let outcomes = run_iteration(state)?;
        info!(
            "Iteration duration={:.3}/seconds",
            iteration_start.elapsed().as_secs_f64()
        );
        let failed = outcomes.iter().filter(|outcome| !outcome.success).count();
        if failed > 0 {
            warn!(
                "[schedule] {failed} of {} steps failed this iteration",
                outcomes.len()
            );
        }

        if let Some(signal) = shutdown.received() {
            return Ok(RunEnd::Signaled(signal));
        }
        if once {
            return Ok(RunEnd::Completed);
        }

        let interval = sleep_interval(Utc::now());
        info!("[schedule] sleeping {}/seconds", interval.as_secs());
        if let Some(signal) = sleep_interruptibly(interval, shutdown) {
            return Ok(RunEnd::Signaled(signal));
        }
    }
}

/// Sleep in sub-second slices so a termination signal interrupts promptly.
fn sleep_interruptibly(total: Duration, shutdown: &ShutdownFlag) -> Option<i32> {
    let slice = Duration::from_millis(250);
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if let Some(signal) = shutdown.received() {
            return Some(signal);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        thread::sleep(remaining.min(slice));
    }
    shutdown.received()
}
