//! Periodic jobs, run cooperatively inside the kernel step. Each job
//! remembers when it last fired; a wall-clock jump shifts those stamps so
//! a time-sync correction does not fire everything at once.

use std::time::Duration;

use mycel_core::Timestamp;

use crate::kernel::KernelCore;

pub type PeriodicFn = Box<dyn FnMut(&mut KernelCore) + Send>;

struct PeriodicJob {
    name: String,
    period: Duration,
    last_fired: Timestamp,
    hook: PeriodicFn,
}

#[derive(Default)]
pub struct PeriodicScheduler {
    jobs: Vec<PeriodicJob>,
}

impl PeriodicScheduler {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    /// Registers a named job. A fresh job fires on the next step and then
    /// settles into its period.
    pub fn register(&mut self, name: &str, period: Duration, hook: PeriodicFn) {
        log::debug!("periodic: registered {} every {:?}", name, period);
        self.jobs.push(PeriodicJob {
            name: name.to_string(),
            period,
            last_fired: Timestamp::ZERO,
            hook,
        });
    }

    pub fn run_due(&mut self, core: &mut KernelCore) {
        let now = core.clock.now();
        for job in &mut self.jobs {
            let due = job.last_fired == Timestamp::ZERO
                || (now - job.last_fired) >= job.period.as_micros() as i64;
            if due {
                log::trace!("periodic: {}", job.name);
                job.last_fired = now;
                (job.hook)(core);
            }
        }
    }

    /// Time until the nearest job is due, for sizing the idle sleep.
    pub fn next_due_in(&self, now: Timestamp) -> Option<Duration> {
        self.jobs
            .iter()
            .map(|job| {
                let elapsed = now - job.last_fired;
                let period = job.period.as_micros() as i64;
                Duration::from_micros(period.saturating_sub(elapsed).max(0) as u64)
            })
            .min()
    }

    /// Rewrites every last-fired stamp after a wall-clock jump.
    pub fn shift_time(&mut self, delta_micros: i64) {
        for job in &mut self.jobs {
            if job.last_fired != Timestamp::ZERO {
                job.last_fired = job.last_fired.shift_micros(delta_micros);
            }
        }
    }
}
