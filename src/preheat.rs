//! Cyclic brew-head preheat sequencer.
//!
//! Pushes hot water through the head in short bursts: pump at 100 % with
//! the valve open, then valve closed with the pump still on to build
//! pressure, then everything off for a long pause, repeating until
//! stopped. Same epoch-tokened stage timer as the shot sequencer.

use crate::config::PreheatParams;
use crate::pwm::{PhaseOutput, PumpPwm};
use crate::scheduler::{Scheduled, StageTimer};
use crate::types::PreheatStage;
use core::cell::RefCell;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Instant};
use log::{info, warn};
use std::sync::Arc;

struct PreheatState {
    stage: PreheatStage,
    epoch: u64,
    params: PreheatParams,
}

struct StageActions {
    pump: Option<u8>,
    valve: Option<bool>,
}

pub struct PreheatSequencer {
    pump: Arc<PumpPwm>,
    valve: Arc<PhaseOutput>,
    timer: StageTimer,
    state: Mutex<CriticalSectionRawMutex, RefCell<PreheatState>>,
}

impl PreheatSequencer {
    pub fn new(pump: Arc<PumpPwm>, valve: Arc<PhaseOutput>) -> Self {
        Self {
            pump,
            valve,
            timer: StageTimer::new(),
            state: Mutex::new(RefCell::new(PreheatState {
                stage: PreheatStage::Off,
                epoch: 0,
                params: PreheatParams::default(),
            })),
        }
    }

    fn params_valid(params: &PreheatParams) -> bool {
        params.pump_ms >= 100
            && params.pump_ms <= 5000
            && params.hold_ms <= 2000
            && params.pause_ms >= 4000
            && params.pause_ms <= 50000
    }

    /// Begin cycling. The first stage is entered synchronously so the
    /// loop starts pumping immediately.
    pub fn start(&self, params: PreheatParams) {
        if !Self::params_valid(&params) {
            warn!("preheat: start rejected, parameters out of bounds: {:?}", params);
            return;
        }
        let scheduled = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.stage != PreheatStage::Off {
                warn!("preheat: start rejected, already running");
                return None;
            }
            state.epoch += 1;
            state.stage = PreheatStage::PumpOn;
            state.params = params;
            Some(Scheduled {
                deadline: Instant::now() + Duration::from_millis(u64::from(params.pump_ms)),
                epoch: state.epoch,
            })
        });
        let Some(scheduled) = scheduled else { return };
        info!("preheat: starting ({:?})", params);
        self.valve.on();
        self.pump.set_level(100);
        self.timer.arm(scheduled);
    }

    /// Force the cycle off and leave pump/valve in the requested resting
    /// state. No-op when already off.
    pub fn stop(&self, pump_percent: u8, valve_open: bool) {
        let was_active = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.stage == PreheatStage::Off {
                return false;
            }
            state.epoch += 1;
            state.stage = PreheatStage::Off;
            true
        });
        if !was_active {
            return;
        }
        info!("preheat: stopping");
        self.timer.cancel();
        if valve_open {
            self.valve.on();
        } else {
            self.valve.off();
        }
        self.pump.set_level(pump_percent);
    }

    pub fn stage(&self) -> PreheatStage {
        self.state.lock(|state| state.borrow().stage)
    }

    pub fn is_active(&self) -> bool {
        self.stage() != PreheatStage::Off
    }

    pub fn advance(&self, token: Scheduled) {
        let (actions, next) = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if token.epoch != state.epoch || state.stage == PreheatStage::Off {
                return (
                    StageActions {
                        pump: None,
                        valve: None,
                    },
                    None,
                );
            }
            let params = state.params;
            let (stage, actions, delay_ms) = match state.stage {
                PreheatStage::PumpOn => (
                    PreheatStage::PressureHold,
                    StageActions {
                        pump: None,
                        valve: Some(false),
                    },
                    params.hold_ms,
                ),
                PreheatStage::PressureHold => (
                    PreheatStage::Pause,
                    StageActions {
                        pump: Some(0),
                        valve: Some(false),
                    },
                    params.pause_ms,
                ),
                PreheatStage::Pause => (
                    PreheatStage::PumpOn,
                    StageActions {
                        pump: Some(100),
                        valve: Some(true),
                    },
                    params.pump_ms,
                ),
                PreheatStage::Off => unreachable!(),
            };
            state.stage = stage;
            let next = Scheduled {
                deadline: Instant::now() + Duration::from_millis(u64::from(delay_ms)),
                epoch: state.epoch,
            };
            (actions, Some(next))
        });

        if let Some(open) = actions.valve {
            if open {
                self.valve.on();
            } else {
                self.valve.off();
            }
        }
        if let Some(pct) = actions.pump {
            self.pump.set_level(pct);
        }
        if let Some(next) = next {
            self.timer.arm(next);
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SoftSwitch;

    struct Rig {
        pump: Arc<PumpPwm>,
        valve_switch: Arc<SoftSwitch>,
        preheat: PreheatSequencer,
    }

    fn rig() -> Rig {
        let pump = Arc::new(PumpPwm::new(Arc::new(SoftSwitch::new("pump"))));
        pump.enable();
        let valve_switch = Arc::new(SoftSwitch::new("valve"));
        let valve = Arc::new(PhaseOutput::new(valve_switch.clone()));
        valve.enable();
        let preheat = PreheatSequencer::new(pump.clone(), valve);
        Rig {
            pump,
            valve_switch,
            preheat,
        }
    }

    fn advance_pending(preheat: &PreheatSequencer) {
        let token = preheat.pending().expect("a stage timer must be armed");
        preheat.advance(token);
    }

    fn params(pump_ms: u32, hold_ms: u32, pause_ms: u32) -> PreheatParams {
        PreheatParams {
            pump_ms,
            hold_ms,
            pause_ms,
        }
    }

    #[test]
    fn cycle_repeats_pump_hold_pause() {
        let rig = rig();
        rig.preheat.start(params(1000, 300, 10000));
        for _ in 0..3 {
            assert_eq!(rig.preheat.stage(), PreheatStage::PumpOn);
            assert_eq!(rig.pump.level(), 100);
            assert!(rig.valve_switch.is_on());

            advance_pending(&rig.preheat);
            assert_eq!(rig.preheat.stage(), PreheatStage::PressureHold);
            assert_eq!(rig.pump.level(), 100);
            assert!(!rig.valve_switch.is_on());

            advance_pending(&rig.preheat);
            assert_eq!(rig.preheat.stage(), PreheatStage::Pause);
            assert_eq!(rig.pump.level(), 0);
            assert!(!rig.valve_switch.is_on());

            advance_pending(&rig.preheat);
        }
    }

    #[test]
    fn stage_delays_follow_parameters() {
        let rig = rig();
        let before = Instant::now();
        rig.preheat.start(params(1000, 300, 10000));
        let armed = rig.preheat.pending().unwrap();
        assert!(armed.deadline >= before + Duration::from_millis(1000));
        advance_pending(&rig.preheat);
        let hold = rig.preheat.pending().unwrap();
        assert!(hold.deadline - Instant::now() <= Duration::from_millis(300));
    }

    #[test]
    fn out_of_bounds_parameters_are_rejected() {
        let rig = rig();
        for bad in [
            params(50, 300, 10000),
            params(6000, 300, 10000),
            params(1000, 3000, 10000),
            params(1000, 300, 2000),
            params(1000, 300, 60000),
        ] {
            rig.preheat.start(bad);
            assert_eq!(rig.preheat.stage(), PreheatStage::Off);
        }
    }

    #[test]
    fn second_start_is_a_no_op() {
        let rig = rig();
        rig.preheat.start(params(1000, 300, 10000));
        let armed = rig.preheat.pending();
        rig.preheat.start(params(200, 0, 5000));
        assert_eq!(rig.preheat.pending(), armed);
    }

    #[test]
    fn stop_is_unconditional_and_discards_stale_fires() {
        let rig = rig();
        rig.preheat.start(params(1000, 300, 10000));
        let token = rig.preheat.pending().unwrap();
        rig.preheat.stop(0, false);
        assert_eq!(rig.preheat.stage(), PreheatStage::Off);
        assert_eq!(rig.pump.level(), 0);
        assert!(!rig.valve_switch.is_on());
        assert!(rig.preheat.pending().is_none());

        rig.preheat.advance(token);
        assert_eq!(rig.preheat.stage(), PreheatStage::Off);
        assert_eq!(rig.pump.level(), 0);
    }
}
