//! The status poll timer.
//!
//! A deadline-based timer on a dedicated thread. The session reschedules
//! it after every poll, pulls the deadline forward with [`DeadlineTimer::pulse`]
//! after optimistic state writes, and parks it entirely while the
//! renderer is stopped (an event wakes it back up).

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

struct TimerState {
    deadline: Option<Instant>,
    disposed: bool,
}

pub struct DeadlineTimer {
    state: Mutex<TimerState>,
    signal: Condvar,
}

impl Default for DeadlineTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl DeadlineTimer {
    pub fn new() -> Self {
        DeadlineTimer {
            state: Mutex::new(TimerState {
                deadline: None,
                disposed: false,
            }),
            signal: Condvar::new(),
        }
    }

    /// Spawn the timer thread. `tick` runs once per expired deadline; it
    /// is responsible for rescheduling.
    pub fn start<F>(self: &Arc<Self>, name: &str, tick: F)
    where
        F: Fn() + Send + 'static,
    {
        let timer = Arc::clone(self);
        let spawn = std::thread::Builder::new()
            .name(format!("poll-{name}"))
            .spawn(move || loop {
                let mut state = timer.state.lock().unwrap();
                loop {
                    if state.disposed {
                        return;
                    }
                    match state.deadline {
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                state.deadline = None;
                                break;
                            }
                            let (next, _) = timer
                                .signal
                                .wait_timeout(state, deadline - now)
                                .unwrap();
                            state = next;
                        }
                        None => {
                            state = timer.signal.wait(state).unwrap();
                        }
                    }
                }
                drop(state);
                tick();
            });
        if let Err(e) = spawn {
            warn!(error = %e, "cannot spawn poll timer thread");
        }
    }

    /// Fire after `delay`, replacing any pending deadline.
    pub fn schedule(&self, delay: Duration) {
        let mut state = self.state.lock().unwrap();
        if state.disposed {
            return;
        }
        state.deadline = Some(Instant::now() + delay);
        drop(state);
        self.signal.notify_all();
    }

    /// Pull the deadline forward to at most `delay` from now. Never
    /// pushes an earlier deadline back.
    pub fn pulse(&self, delay: Duration) {
        let mut state = self.state.lock().unwrap();
        if state.disposed {
            return;
        }
        let candidate = Instant::now() + delay;
        state.deadline = Some(match state.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
        drop(state);
        self.signal.notify_all();
    }

    /// Suspend until the next `schedule`/`pulse`.
    pub fn park(&self) {
        let mut state = self.state.lock().unwrap();
        state.deadline = None;
        drop(state);
        self.signal.notify_all();
    }

    pub fn dispose(&self) {
        let mut state = self.state.lock().unwrap();
        state.disposed = true;
        state.deadline = None;
        drop(state);
        self.signal.notify_all();
    }
}
