//! Machine-level orchestrator.
//!
//! Owns the pump, the valve and the PID loop, and arbitrates between the
//! shot and preheat sequencers: starting one stops the other first with
//! flow-preserving parameters, so switching modes mid-pour never cuts
//! the water. The pump override (anti-clog purge) outranks the pump
//! percent of any `stop()` issued while it is live.

use crate::config::MachineConfig;
use crate::pid::PidController;
use crate::preheat::PreheatSequencer;
use crate::pwm::{PhaseOutput, PumpPwm};
use crate::shot::ShotSequencer;
use crate::types::{PidMode, WaterMode};
use core::cell::RefCell;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Instant};
use log::info;
use std::sync::Arc;

struct PumpOverride {
    percent: u8,
    total: Duration,
    since: Instant,
}

impl PumpOverride {
    fn is_live(&self) -> bool {
        Instant::now() - self.since < self.total
    }
}

struct ControlState {
    mode: WaterMode,
    pump_override: Option<PumpOverride>,
}

pub struct WaterControl {
    pump: Arc<PumpPwm>,
    valve: Arc<PhaseOutput>,
    pid: Arc<PidController>,
    shot: Arc<ShotSequencer>,
    preheat: Arc<PreheatSequencer>,
    config: MachineConfig,
    state: Mutex<CriticalSectionRawMutex, RefCell<ControlState>>,
}

impl WaterControl {
    pub fn new(
        pump: Arc<PumpPwm>,
        valve: Arc<PhaseOutput>,
        pid: Arc<PidController>,
        shot: Arc<ShotSequencer>,
        preheat: Arc<PreheatSequencer>,
        config: MachineConfig,
    ) -> Self {
        Self {
            pump,
            valve,
            pid,
            shot,
            preheat,
            config,
            state: Mutex::new(RefCell::new(ControlState {
                mode: WaterMode::Off,
                pump_override: None,
            })),
        }
    }

    pub fn mode(&self) -> WaterMode {
        self.state.lock(|state| state.borrow().mode)
    }

    /// Power the water side up: drivers enabled, PID regulating at the
    /// brew temperature, everything at rest.
    pub fn enable(&self) {
        info!("water control: enabling");
        self.pump.enable();
        self.valve.enable();
        self.pid.set_target(self.config.brew_temp_c, PidMode::Water);
        self.pid.start();
        self.stop(0, false, WaterMode::Off);
    }

    /// Power the water side down: everything stopped, drivers disabled,
    /// PID off.
    pub fn disable(&self) {
        info!("water control: disabling");
        self.stop(0, false, WaterMode::Off);
        self.state.lock(|state| state.borrow_mut().pump_override = None);
        self.pid.stop();
        self.pump.disable();
        self.valve.disable();
    }

    /// Plain pumping at a fixed percent, with or without the valve.
    pub fn start_pump(&self, percent: u8, valve_open: bool) {
        let mode = if valve_open {
            WaterMode::WaterValve
        } else {
            WaterMode::Water
        };
        self.stop(percent, valve_open, mode);
    }

    /// Begin the configured shot program. Already pouring a shot: no-op.
    pub fn start_shot(&self) {
        if self.mode() == WaterMode::Shot {
            return;
        }
        // hand off without interrupting flow; the sequencer takes over
        self.stop(100, true, WaterMode::Shot);
        self.shot.start(self.config.shot);
    }

    /// Begin the preheat cycle. Already preheating: no-op.
    pub fn start_preheat(&self) {
        if self.mode() == WaterMode::Preheat {
            return;
        }
        self.stop(100, true, WaterMode::Preheat);
        self.preheat.start(self.config.preheat);
    }

    /// Switch the boiler to steam regulation. Pump/valve follow the
    /// caller (usually 0/closed; some machines purge while steaming).
    pub fn start_steam(&self, pump_percent: u8, valve_open: bool) {
        if self.mode() == WaterMode::Steam {
            return;
        }
        self.stop(pump_percent, valve_open, WaterMode::Steam);
        self.pid.set_target(self.config.steam_temp_c, PidMode::Steam);
    }

    /// Force the pump to `percent` for `duration`. While the override is
    /// live its percent outranks the pump percent of any `stop()`.
    pub fn override_pump(&self, percent: u8, duration: Duration) {
        info!("water control: pump override {}% for {:?}", percent, duration);
        self.state.lock(|state| {
            state.borrow_mut().pump_override = Some(PumpOverride {
                percent,
                total: duration,
                since: Instant::now(),
            });
        });
        self.pump.set_level(percent);
    }

    /// Stop whatever is running and settle into `new_mode` with the
    /// requested pump/valve resting state. The PID always drops back to
    /// water regulation at the brew temperature; `start_steam` retargets
    /// it again after this returns.
    pub fn stop(&self, pump_percent: u8, valve_open: bool, new_mode: WaterMode) {
        self.pid.set_target(self.config.brew_temp_c, PidMode::Water);

        let effective_pct = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.mode = new_mode;
            match &state.pump_override {
                Some(over) if over.is_live() => over.percent,
                Some(_) => {
                    state.pump_override = None;
                    pump_percent
                }
                None => pump_percent,
            }
        });

        self.shot.stop(effective_pct, valve_open);
        self.preheat.stop(effective_pct, valve_open);
        if valve_open {
            self.valve.on();
        } else {
            self.valve.off();
        }
        self.pump.set_level(effective_pct);
    }

    /// Elapsed pour time of the current/last shot.
    pub fn shot_time(&self) -> Duration {
        self.shot.shot_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PidSettings;
    use crate::hardware::SoftSwitch;
    use crate::pwm::HeaterPwm;
    use crate::sensors::{FixedProbe, TemperatureProbe};
    use crate::telemetry::TelemetrySink;
    use crate::types::{PreheatStage, ShotStage};

    struct Rig {
        pump: Arc<PumpPwm>,
        valve_switch: Arc<SoftSwitch>,
        pid: Arc<PidController>,
        shot: Arc<ShotSequencer>,
        preheat: Arc<PreheatSequencer>,
        control: WaterControl,
    }

    fn rig() -> Rig {
        let config = MachineConfig::default();
        let pump = Arc::new(PumpPwm::new(Arc::new(SoftSwitch::new("pump"))));
        let valve_switch = Arc::new(SoftSwitch::new("valve"));
        let valve = Arc::new(PhaseOutput::new(valve_switch.clone()));
        let heater = Arc::new(HeaterPwm::new(Arc::new(SoftSwitch::new("heater"))));
        let probe = Arc::new(FixedProbe::new(96.0));
        let pid = Arc::new(PidController::new(
            heater,
            pump.clone(),
            probe as Arc<dyn TemperatureProbe>,
            Arc::new(TelemetrySink::new()),
            PidSettings::default(),
        ));
        let shot = Arc::new(ShotSequencer::new(
            pump.clone(),
            valve.clone(),
            pid.clone(),
            config.pid.boost_output,
            config.pid.boost_cycles,
        ));
        let preheat = Arc::new(PreheatSequencer::new(pump.clone(), valve.clone()));
        let control = WaterControl::new(
            pump.clone(),
            valve,
            pid.clone(),
            shot.clone(),
            preheat.clone(),
            config,
        );
        Rig {
            pump,
            valve_switch,
            pid,
            shot,
            preheat,
            control,
        }
    }

    #[test]
    fn enable_starts_pid_at_brew_temperature() {
        let rig = rig();
        rig.control.enable();
        assert!(rig.pid.is_enabled());
        assert_eq!(rig.pid.target(), 96.0);
        assert_eq!(rig.pid.mode(), PidMode::Water);
        assert_eq!(rig.control.mode(), WaterMode::Off);
        assert_eq!(rig.pump.level(), 0);
    }

    #[test]
    fn disable_stops_everything() {
        let rig = rig();
        rig.control.enable();
        rig.control.start_shot();
        rig.control.disable();
        assert!(!rig.pid.is_enabled());
        assert!(!rig.pump.is_enabled());
        assert_eq!(rig.shot.stage(), ShotStage::Idle);
        assert!(!rig.valve_switch.is_on());
    }

    #[test]
    fn start_pump_sets_mode_and_actuators() {
        let rig = rig();
        rig.control.enable();
        rig.control.start_pump(60, true);
        assert_eq!(rig.control.mode(), WaterMode::WaterValve);
        assert_eq!(rig.pump.level(), 60);
        assert!(rig.valve_switch.is_on());

        rig.control.start_pump(40, false);
        assert_eq!(rig.control.mode(), WaterMode::Water);
        assert_eq!(rig.pump.level(), 40);
        assert!(!rig.valve_switch.is_on());
    }

    #[test]
    fn start_shot_is_idempotent() {
        let rig = rig();
        rig.control.enable();
        rig.control.start_shot();
        assert_eq!(rig.control.mode(), WaterMode::Shot);
        assert_eq!(rig.shot.stage(), ShotStage::InitFill);
        // second call must not restart the sequence
        rig.control.start_shot();
        assert_eq!(rig.shot.stage(), ShotStage::InitFill);
    }

    #[test]
    fn starting_preheat_stops_a_running_shot() {
        let rig = rig();
        rig.control.enable();
        rig.control.start_shot();
        rig.control.start_preheat();
        assert_eq!(rig.control.mode(), WaterMode::Preheat);
        assert_eq!(rig.shot.stage(), ShotStage::Idle);
        assert_eq!(rig.preheat.stage(), PreheatStage::PumpOn);
        assert_eq!(rig.pump.level(), 100);
        assert!(rig.valve_switch.is_on());
    }

    #[test]
    fn steam_retargets_the_pid() {
        let rig = rig();
        rig.control.enable();
        rig.control.start_steam(0, false);
        assert_eq!(rig.control.mode(), WaterMode::Steam);
        assert_eq!(rig.pid.target(), 115.0);
        assert_eq!(rig.pid.mode(), PidMode::Steam);
        assert_eq!(rig.pump.level(), 0);
    }

    #[test]
    fn stop_returns_pid_to_brew_regulation() {
        let rig = rig();
        rig.control.enable();
        rig.control.start_steam(0, false);
        rig.control.stop(0, false, WaterMode::Off);
        assert_eq!(rig.pid.target(), 96.0);
        assert_eq!(rig.pid.mode(), PidMode::Water);
        assert_eq!(rig.control.mode(), WaterMode::Off);
    }

    #[test]
    fn live_override_outranks_stop_pump_percent() {
        let rig = rig();
        rig.control.enable();
        rig.control.override_pump(80, Duration::from_secs(2));
        assert_eq!(rig.pump.level(), 80);
        rig.control.stop(0, false, WaterMode::Off);
        // override still live: its percent wins, valve follows the request
        assert_eq!(rig.pump.level(), 80);
        assert!(!rig.valve_switch.is_on());
    }

    #[test]
    fn expired_override_yields_to_stop() {
        let rig = rig();
        rig.control.enable();
        rig.control.override_pump(80, Duration::from_millis(5));
        std::thread::sleep(std::time::Duration::from_millis(10));
        rig.control.stop(30, false, WaterMode::Off);
        assert_eq!(rig.pump.level(), 30);
    }

    #[test]
    fn stop_with_live_override_still_stops_sequencers() {
        let rig = rig();
        rig.control.enable();
        rig.control.start_shot();
        rig.control.override_pump(80, Duration::from_secs(2));
        rig.control.stop(0, false, WaterMode::Off);
        assert_eq!(rig.shot.stage(), ShotStage::Idle);
        assert_eq!(rig.pump.level(), 80);
    }
}
