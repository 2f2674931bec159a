//! "Fire at t+Δ, deliver a token" primitive for the timed sequencers.
//!
//! Each armed deadline carries the epoch the sequencer was in when it was
//! armed. A stop bumps the epoch, so a fire that raced the stop is handed
//! back with a stale token and discarded by the stage handler. This keeps
//! the state machines free of any concrete timer API.

use core::cell::Cell;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Instant, Timer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduled {
    pub deadline: Instant,
    pub epoch: u64,
}

pub struct StageTimer {
    pending: Mutex<CriticalSectionRawMutex, Cell<Option<Scheduled>>>,
    rearm: Signal<CriticalSectionRawMutex, ()>,
}

impl StageTimer {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Cell::new(None)),
            rearm: Signal::new(),
        }
    }

    pub fn arm(&self, scheduled: Scheduled) {
        self.pending.lock(|pending| pending.set(Some(scheduled)));
        self.rearm.signal(());
    }

    pub fn cancel(&self) {
        self.pending.lock(|pending| pending.set(None));
        self.rearm.signal(());
    }

    pub fn current(&self) -> Option<Scheduled> {
        self.pending.lock(|pending| pending.get())
    }

    /// Wait until an armed deadline expires and return its token. Re-arms
    /// and cancellations interrupt the wait and are picked up immediately.
    pub async fn expired(&self) -> Scheduled {
        loop {
            match self.current() {
                Some(scheduled) => {
                    match select(self.rearm.wait(), Timer::at(scheduled.deadline)).await {
                        Either::First(()) => continue,
                        Either::Second(()) => {
                            // consume the deadline; a stale token is still
                            // delivered and rejected by the epoch check
                            self.pending.lock(|pending| {
                                if pending.get() == Some(scheduled) {
                                    pending.set(None);
                                }
                            });
                            return scheduled;
                        }
                    }
                }
                None => self.rearm.wait().await,
            }
        }
    }
}

impl Default for StageTimer {
    fn default() -> Self {
        Self::new()
    }
}
