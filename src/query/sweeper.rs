//! Background thread that runs deferred and periodic sweeps for one query.

use super::state::SweepTrigger;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Schedule {
    deferred: Option<Instant>,
    shutdown: bool,
}

#[derive(Default)]
struct Signal {
    schedule: Mutex<Schedule>,
    wakeup: Condvar,
}

pub(crate) struct Sweeper {
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Starts the thread. `sweep` returns false once its query is gone, which
    /// ends the thread.
    pub fn spawn<F>(name: String, interval: Option<Duration>, sweep: F) -> io::Result<Self>
    where
        F: Fn(SweepTrigger) -> bool + Send + 'static,
    {
        let signal = Arc::new(Signal::default());
        let thread_signal = signal.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(thread_signal, interval, sweep))?;
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Requests a deferred sweep `delay` from now. An earlier pending request
    /// is kept.
    pub fn schedule(&self, delay: Duration) {
        // too far out to represent, so it never comes due
        let Some(due) = deadline(delay) else {
            return;
        };
        let mut schedule = self.signal.schedule.lock();
        schedule.deferred = Some(schedule.deferred.map_or(due, |current| current.min(due)));
        self.signal.wakeup.notify_one();
    }

    pub fn stop(&mut self) {
        self.signal.schedule.lock().shutdown = true;
        self.signal.wakeup.notify_all();

        if let Some(handle) = self.handle.take() {
            // the last query handle can be dropped from inside a sweep
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("sweeper thread panicked");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn deadline(after: Duration) -> Option<Instant> {
    Instant::now().checked_add(after)
}

fn run<F>(signal: Arc<Signal>, interval: Option<Duration>, sweep: F)
where
    F: Fn(SweepTrigger) -> bool,
{
    let mut next_periodic = interval.and_then(deadline);
    loop {
        let trigger = {
            let mut schedule = signal.schedule.lock();
            loop {
                if schedule.shutdown {
                    return;
                }
                let now = Instant::now();
                if schedule.deferred.is_some_and(|due| due <= now) {
                    schedule.deferred = None;
                    break SweepTrigger::Deferred;
                }
                if next_periodic.is_some_and(|due| due <= now) {
                    break SweepTrigger::Periodic;
                }
                match [schedule.deferred, next_periodic].into_iter().flatten().min() {
                    Some(due) => {
                        signal.wakeup.wait_until(&mut schedule, due);
                    }
                    None => signal.wakeup.wait(&mut schedule),
                }
            }
        };

        if trigger == SweepTrigger::Periodic {
            next_periodic = interval.and_then(deadline);
        }
        if !sweep(trigger) {
            return;
        }
    }
}
