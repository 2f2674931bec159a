//! Timed multi-stage shot sequencer.
//!
//! INIT_FILL runs the pump at 100 % to fill the brew head, RAMP steps the
//! pump up in 10 % increments, an optional PAUSE rests the puck, FULL
//! pours at 100 % until stopped. Stage advances are delivered by a
//! `StageTimer` token carrying the epoch the stage was armed in; `stop()`
//! bumps the epoch so a racing fire is discarded. State is mutated under
//! a short critical section and actuators are driven after it is
//! released.

use crate::config::ShotParams;
use crate::pid::PidController;
use crate::pwm::{PhaseOutput, PumpPwm};
use crate::scheduler::{Scheduled, StageTimer};
use crate::types::ShotStage;
use core::cell::RefCell;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Instant};
use log::{error, info, warn};
use std::sync::Arc;

struct ShotState {
    stage: ShotStage,
    epoch: u64,
    params: ShotParams,
    current_pct: u8,
    /// Set when full flow starts; None during pre-infusion.
    start_time: Option<Instant>,
    /// Set by stop(); None while the pour is still running.
    stop_time: Option<Instant>,
}

enum Actuate {
    None,
    Pump(u8),
    PumpAndBoost(u8),
}

pub struct ShotSequencer {
    pump: Arc<PumpPwm>,
    valve: Arc<PhaseOutput>,
    pid: Arc<PidController>,
    timer: StageTimer,
    boost_output: f32,
    boost_cycles: u8,
    state: Mutex<CriticalSectionRawMutex, RefCell<ShotState>>,
}

impl ShotSequencer {
    pub fn new(
        pump: Arc<PumpPwm>,
        valve: Arc<PhaseOutput>,
        pid: Arc<PidController>,
        boost_output: f32,
        boost_cycles: u8,
    ) -> Self {
        Self {
            pump,
            valve,
            pid,
            timer: StageTimer::new(),
            boost_output,
            boost_cycles,
            state: Mutex::new(RefCell::new(ShotState {
                stage: ShotStage::Idle,
                epoch: 0,
                params: ShotParams::default(),
                current_pct: 0,
                start_time: None,
                stop_time: None,
            })),
        }
    }

    fn params_valid(params: &ShotParams) -> bool {
        params.init_fill_ms > 0
            && params.init_fill_ms <= 5000
            && params.ramp_ms <= 10000
            && params.pause_ms <= 10000
            && params.start_pct <= params.stop_pct
            && params.stop_pct <= 100
    }

    fn ramp_interval(params: &ShotParams) -> Duration {
        let steps = u32::from((params.stop_pct - params.start_pct) / 10).max(1);
        Duration::from_millis(u64::from(params.ramp_ms / steps))
    }

    /// Begin a shot. Rejected with a log line if out of bounds or already
    /// running; state is left unchanged.
    pub fn start(&self, params: ShotParams) {
        if !Self::params_valid(&params) {
            warn!("shot: start rejected, parameters out of bounds: {:?}", params);
            return;
        }
        let scheduled = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.stage != ShotStage::Idle {
                warn!("shot: start rejected, already running");
                return None;
            }
            state.epoch += 1;
            state.stage = ShotStage::InitFill;
            state.params = params;
            state.current_pct = 0;
            state.start_time = None;
            state.stop_time = None;
            Some(Scheduled {
                deadline: Instant::now() + Duration::from_millis(u64::from(params.init_fill_ms)),
                epoch: state.epoch,
            })
        });
        let Some(scheduled) = scheduled else { return };
        info!("shot: starting ({:?})", params);
        self.valve.on();
        self.pump.set_level(100);
        self.timer.arm(scheduled);
    }

    /// Stop the shot and leave the pump/valve in the requested resting
    /// state. No-op when idle.
    pub fn stop(&self, pump_percent: u8, valve_open: bool) {
        let was_active = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.stage == ShotStage::Idle {
                return false;
            }
            state.epoch += 1;
            state.stage = ShotStage::Idle;
            state.stop_time = Some(Instant::now());
            true
        });
        if !was_active {
            return;
        }
        info!("shot: stopping");
        self.timer.cancel();
        if valve_open {
            self.valve.on();
        } else {
            self.valve.off();
        }
        self.pump.set_level(pump_percent);
    }

    pub fn stage(&self) -> ShotStage {
        self.state.lock(|state| state.borrow().stage)
    }

    pub fn is_active(&self) -> bool {
        self.stage() != ShotStage::Idle
    }

    /// Elapsed pour time: 0 before full flow, running while pouring,
    /// frozen after stop.
    pub fn shot_time(&self) -> Duration {
        self.state.lock(|state| {
            let state = state.borrow();
            let Some(start) = state.start_time else {
                return Duration::from_ticks(0);
            };
            match state.stop_time {
                None => Instant::now() - start,
                Some(stop) if stop < start => {
                    error!("shot: stop time precedes start time");
                    Duration::from_ticks(0)
                }
                Some(stop) => stop - start,
            }
        })
    }

    /// Stage advance from an expired timer token. A stale epoch means a
    /// stop (or stop+start) raced the fire; the advance is discarded.
    pub fn advance(&self, token: Scheduled) {
        let (actuate, next) = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if token.epoch != state.epoch || state.stage == ShotStage::Idle {
                return (Actuate::None, None);
            }
            let params = state.params;
            match state.stage {
                ShotStage::InitFill => {
                    state.stage = ShotStage::Ramp;
                    state.current_pct = params.start_pct;
                    let next = Scheduled {
                        deadline: Instant::now() + Self::ramp_interval(&params),
                        epoch: state.epoch,
                    };
                    (Actuate::Pump(state.current_pct), Some(next))
                }
                ShotStage::Ramp => {
                    let next_pct = state.current_pct.saturating_add(10);
                    if next_pct > params.stop_pct || next_pct >= 100 {
                        state.current_pct = 0;
                        if params.pause_ms > 0 {
                            state.stage = ShotStage::Pause;
                            let next = Scheduled {
                                deadline: Instant::now()
                                    + Duration::from_millis(u64::from(params.pause_ms)),
                                epoch: state.epoch,
                            };
                            (Actuate::Pump(0), Some(next))
                        } else {
                            Self::enter_full(&mut state)
                        }
                    } else {
                        state.current_pct = next_pct;
                        let next = Scheduled {
                            deadline: Instant::now() + Self::ramp_interval(&params),
                            epoch: state.epoch,
                        };
                        (Actuate::PumpAndBoost(next_pct), Some(next))
                    }
                }
                ShotStage::Pause => Self::enter_full(&mut state),
                ShotStage::Full => (Actuate::None, None),
                ShotStage::Idle => unreachable!(),
            }
        });

        match actuate {
            Actuate::None => {}
            Actuate::Pump(pct) => self.pump.set_level(pct),
            Actuate::PumpAndBoost(pct) => {
                self.pump.set_level(pct);
                self.pid.override_output(self.boost_output, self.boost_cycles);
            }
        }
        if let Some(next) = next {
            self.timer.arm(next);
        }
    }

    fn enter_full(state: &mut ShotState) -> (Actuate, Option<Scheduled>) {
        state.stage = ShotStage::Full;
        state.start_time = Some(Instant::now());
        state.stop_time = None;
        (Actuate::PumpAndBoost(100), None)
    }

    /// Sequencer task body: deliver expired stage timers.
    pub async fn run(&self) -> ! {
        loop {
            let token = self.timer.expired().await;
            self.advance(token);
        }
    }

    #[cfg(test)]
    fn pending(&self) -> Option<Scheduled> {
        self.timer.current()
    }
}
