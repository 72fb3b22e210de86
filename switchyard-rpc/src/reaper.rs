use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::in_flight::InFlightRequests;

/// A handle to the background task which fails stale in-flight requests.
///
/// The task stops when the handle is dropped.
pub struct ReaperHandle {
    kill_switch: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stops the reaper.
    pub fn stop(&self) {
        self.kill_switch.store(true, Ordering::Relaxed);
        self.handle.abort();
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The shortest interval the reaper sweeps at.
pub const MIN_CLEANUP_FREQUENCY: Duration = Duration::from_millis(1);

/// Starts the stale request reaper.
///
/// Every `cleanup_frequency` the in-flight table is swept and any request
/// which has passed its deadline, or has been in flight for longer than
/// `max_age`, is failed with a timeout status.
///
/// A frequency below [MIN_CLEANUP_FREQUENCY] is raised to it. A zero
/// `max_age` disables the age limit, leaving only request deadlines.
pub fn spawn_reaper(
    in_flight: InFlightRequests,
    cleanup_frequency: Duration,
    max_age: Duration,
) -> ReaperHandle {
    let cleanup_frequency = if cleanup_frequency < MIN_CLEANUP_FREQUENCY {
        warn!(
            requested = ?cleanup_frequency,
            using = ?MIN_CLEANUP_FREQUENCY,
            "Stale request cleanup frequency is too small, using the minimum."
        );
        MIN_CLEANUP_FREQUENCY
    } else {
        cleanup_frequency
    };
    let max_age = if max_age.is_zero() {
        warn!("Stale request timeout is zero, only request deadlines will be enforced.");
        Duration::MAX
    } else {
        max_age
    };

    let kill_switch = Arc::new(AtomicBool::new(false));
    let handle = tokio::spawn(run_reaper(
        in_flight,
        cleanup_frequency,
        max_age,
        kill_switch.clone(),
    ));

    ReaperHandle {
        kill_switch,
        handle,
    }
}

async fn run_reaper(
    in_flight: InFlightRequests,
    cleanup_frequency: Duration,
    max_age: Duration,
    kill_switch: Arc<AtomicBool>,
) {
    let mut interval = interval(cleanup_frequency);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        if kill_switch.load(Ordering::Relaxed) {
            break;
        }

        let num_expired = in_flight.expire(Instant::now(), max_age);
        if num_expired > 0 {
            warn!(
                num_expired = num_expired,
                num_in_flight = in_flight.len(),
                "Failed stale requests which exceeded their deadline."
            );
        }
    }
}
