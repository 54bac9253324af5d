use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use error_stack::{IntoReport, ResultExt};
use parking_lot::{Condvar, Mutex};

use crate::Error;

/// A background thread running a task periodically, at a fixed rate.
///
/// Passes never overlap. If a pass runs longer than the period, the next
/// pass starts as soon as it completes.
///
/// If a pass fails, the error is logged, the thread exits and `on_error` is
/// invoked (unless the task was already stopped). The task is not restarted.
pub(crate) struct MaintenanceTask {
    control: Arc<Control>,
}

#[derive(Default)]
struct Control {
    /// Set when the task is stopped. Guarded by a mutex for use with `wake`.
    cancelled: Mutex<bool>,
    wake: Condvar,
    /// Whether the thread is still executing passes.
    running: AtomicBool,
}

impl Control {
    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    /// Wait until the deadline, returning false if the task was cancelled.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut cancelled = self.cancelled.lock();
        while !*cancelled {
            if self.wake.wait_until(&mut cancelled, deadline).timed_out() {
                return !*cancelled;
            }
        }
        false
    }
}

const THREAD_NAME: &str = "state-store-maintenance";

impl MaintenanceTask {
    pub fn start<T, E>(
        period: Duration,
        mut task: T,
        on_error: E,
    ) -> error_stack::Result<Self, Error>
    where
        T: FnMut() -> error_stack::Result<(), Error> + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let control = Arc::new(Control::default());
        control.running.store(true, Ordering::Release);

        let span = tracing::info_span!("maintenance", period_ms = period.as_millis() as u64);
        let thread_control = control.clone();
        std::thread::Builder::new()
            .name(THREAD_NAME.to_owned())
            .spawn(move || {
                let _enter = span.enter();
                let control = thread_control;

                let mut next = Instant::now() + period;
                while control.wait_until(next) {
                    if let Err(e) = task() {
                        tracing::error!("Maintenance failed; stopping maintenance: {e:?}");
                        // Still reported as running while handling the error,
                        // so a replacement task isn't started before it is
                        // handled.
                        if !control.is_cancelled() {
                            on_error();
                        }
                        control.running.store(false, Ordering::Release);
                        return;
                    }

                    next += period;
                    let now = Instant::now();
                    if next < now {
                        tracing::warn!("Maintenance pass overran the period of {period:?}");
                        next = now;
                    }
                }

                control.running.store(false, Ordering::Release);
                tracing::info!("Stopped maintenance");
            })
            .into_report()
            .change_context(Error::SpawnMaintenance)?;

        tracing::info!("Started maintenance with period {period:?}");
        Ok(Self { control })
    }

    /// Signal the task to stop.
    ///
    /// Does not wait for an in-progress pass to complete.
    pub fn stop(&self) {
        *self.control.cancelled.lock() = true;
        self.control.wake.notify_all();
    }

    /// Whether the task is running (not stopped and not failed).
    pub fn is_running(&self) -> bool {
        self.control.running.load(Ordering::Acquire) && !self.control.is_cancelled()
    }
}

impl Drop for MaintenanceTask {
    fn drop(&mut self) {
        self.stop()
    }
}
