//! Incremental (velocity-form) PID boiler controller.
//!
//! Each cycle adds a correction to the previous output instead of
//! recomputing an absolute output, so clamping the result doubles as
//! anti-windup. The proportional gain is asymmetric and selects on the
//! direction of temperature change, not the sign of the error: the
//! boiler reacts much faster to a temperature drop (water drawn) than to
//! an overshoot, and the tuning reflects that.

use crate::config::PidSettings;
use crate::pwm::{HeaterPwm, PumpPwm};
use crate::sensors::{TemperatureProbe, SENSOR_FAULT_C};
use crate::telemetry::TelemetrySink;
use crate::types::{PidMode, TelemetrySample};
use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Ticker};
use log::{error, info, warn};
use std::sync::Arc;

/// Targets below this are invalid; out-of-range requests reset here.
pub const PID_MIN_TEMP_C: f32 = 10.0;
pub const PID_MAX_TEMP_C: f32 = 139.0;
/// Outputs in (0, MIN] are raised to MIN; the heater cannot respond to
/// a duty smaller than this.
pub const PID_MIN_OUTPUT: f32 = 10.0;
/// Force full output when the boiler is this far below target.
const FAST_HEAT_ERROR_C: f32 = 10.0;
/// With the pump off, clamp the heater once the boiler sits this far
/// above target (no flow to carry the heat away).
const IDLE_OVERTEMP_MARGIN_C: f32 = 0.5;
const IDLE_MAX_OUTPUT: f32 = 5.0;

const OVERRIDE_NONE: f32 = -1.0;

#[derive(Default)]
struct PidHistory {
    u: f32,
    u1: f32,
    pv1: f32,
    pv2: f32,
    p_share: f32,
    i_share: f32,
    d_share: f32,
}

pub struct PidController {
    heater: Arc<HeaterPwm>,
    pump: Arc<PumpPwm>,
    probe: Arc<dyn TemperatureProbe>,
    telemetry: Arc<TelemetrySink>,
    settings: PidSettings,
    enabled: AtomicBool,
    target_bits: AtomicU32,
    mode: AtomicU8,
    override_bits: AtomicU32,
    override_cycles: AtomicU8,
    history: Mutex<CriticalSectionRawMutex, RefCell<PidHistory>>,
}

impl PidController {
    pub fn new(
        heater: Arc<HeaterPwm>,
        pump: Arc<PumpPwm>,
        probe: Arc<dyn TemperatureProbe>,
        telemetry: Arc<TelemetrySink>,
        settings: PidSettings,
    ) -> Self {
        Self {
            heater,
            pump,
            probe,
            telemetry,
            settings,
            enabled: AtomicBool::new(false),
            target_bits: AtomicU32::new(PID_MIN_TEMP_C.to_bits()),
            mode: AtomicU8::new(0),
            override_bits: AtomicU32::new(OVERRIDE_NONE.to_bits()),
            override_cycles: AtomicU8::new(0),
            history: Mutex::new(RefCell::new(PidHistory::default())),
        }
    }

    /// Reset the history to the current reading and enable the loop.
    pub fn start(&self) {
        let pv = self.read_pv(self.mode());
        self.history.lock(|history| {
            let mut history = history.borrow_mut();
            history.pv1 = pv;
            history.pv2 = pv;
            history.u1 = 0.0;
        });
        self.heater.sync();
        self.enabled.store(true, Ordering::Release);
        self.heater.enable();
        info!(
            "PID on: P+ {} P- {} I {} D {}",
            self.settings.p_pos, self.settings.p_neg, self.settings.i, self.settings.d
        );
    }

    /// Disable the loop and force the heater off. History is kept.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
        self.heater.set_duty(0);
        self.heater.disable();
        info!("PID off");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Validated target. Anything outside (PID_MIN_TEMP_C, PID_MAX_TEMP_C)
    /// resets to the minimum.
    pub fn set_target(&self, temp_c: f32, mode: PidMode) {
        let target = if temp_c > PID_MIN_TEMP_C && temp_c < PID_MAX_TEMP_C {
            temp_c
        } else {
            warn!("PID target {:.1}°C out of range, resetting to minimum", temp_c);
            PID_MIN_TEMP_C
        };
        self.target_bits.store(target.to_bits(), Ordering::Release);
        self.mode
            .store(if mode == PidMode::Steam { 1 } else { 0 }, Ordering::Release);
    }

    pub fn target(&self) -> f32 {
        f32::from_bits(self.target_bits.load(Ordering::Acquire))
    }

    pub fn mode(&self) -> PidMode {
        if self.mode.load(Ordering::Acquire) == 1 {
            PidMode::Steam
        } else {
            PidMode::Water
        }
    }

    /// Force the next `cycles` control outputs to `value`. Used by the
    /// shot sequencer to pre-load the boiler against the heat drawn at
    /// the onset of flow.
    pub fn override_output(&self, value: f32, cycles: u8) {
        self.override_bits.store(value.to_bits(), Ordering::Release);
        self.override_cycles.store(cycles, Ordering::Release);
    }

    pub fn p_share(&self) -> f32 {
        self.history.lock(|history| history.borrow().p_share)
    }

    pub fn i_share(&self) -> f32 {
        self.history.lock(|history| history.borrow().i_share)
    }

    pub fn d_share(&self) -> f32 {
        self.history.lock(|history| history.borrow().d_share)
    }

    /// Raw pre-clamp output of the last cycle.
    pub fn raw_output(&self) -> f32 {
        self.history.lock(|history| history.borrow().u)
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(u64::from(self.settings.sample_period_ms))
    }

    fn read_pv(&self, mode: PidMode) -> f32 {
        match mode {
            PidMode::Water => self.probe.boiler_avg_c(),
            PidMode::Steam => self.probe.boiler_max_c(),
        }
    }

    /// One control cycle. Called once per sample period by the PID task;
    /// state is mutated under a short critical section and the heater is
    /// written after the lock is released.
    pub fn run_cycle(&self) {
        let mode = self.mode();
        let target = self.target();
        let pv = self.read_pv(mode);

        if !self.is_enabled() {
            self.history.lock(|history| {
                let mut history = history.borrow_mut();
                history.p_share = 0.0;
                history.i_share = 0.0;
                history.d_share = 0.0;
                history.u = 0.0;
            });
            self.publish(target, pv);
            return;
        }

        if pv >= SENSOR_FAULT_C {
            // probe fault: do not let the sentinel feed the math
            error!("PID: sensor fault ({}°C), forcing heater off", pv);
            self.heater.set_duty(0);
            self.publish(target, pv);
            return;
        }

        let e = target - pv;
        let ts_s = self.settings.sample_period_ms as f32 / 1000.0;

        let duty = self.history.lock(|history| {
            let mut history = history.borrow_mut();
            let dpv = history.pv1 - pv;
            let falling = dpv > 0.0;
            let p_gain = if falling || mode == PidMode::Steam {
                self.settings.p_pos
            } else {
                self.settings.p_neg
            };
            history.p_share = p_gain * dpv;
            history.i_share = self.settings.i * ts_s * e;
            history.d_share = self.settings.d * (2.0 * history.pv1 - pv - history.pv2) / ts_s;
            history.u = history.u1 + history.p_share + history.i_share + history.d_share;

            let mut limited = history.u;

            // behavioral overrides, in priority order
            if e > FAST_HEAT_ERROR_C {
                limited = 100.0;
            }
            let mut idle_clamped = false;
            if self.pump.level() == 0
                && pv >= target + IDLE_OVERTEMP_MARGIN_C
                && limited > IDLE_MAX_OUTPUT
            {
                limited = IDLE_MAX_OUTPUT;
                idle_clamped = true;
            }
            let override_value = f32::from_bits(self.override_bits.load(Ordering::Acquire));
            if override_value >= 0.0 {
                let cycles = self.override_cycles.load(Ordering::Acquire);
                if cycles > 0 {
                    limited = override_value;
                    idle_clamped = false;
                    self.override_cycles.store(cycles - 1, Ordering::Release);
                }
            }

            limited = limited.clamp(0.0, 100.0);
            // the idle clamp sits below the minimum useful duty on purpose
            if !idle_clamped && limited > 0.0 && limited <= PID_MIN_OUTPUT {
                limited = PID_MIN_OUTPUT;
            }

            history.pv2 = history.pv1;
            history.pv1 = pv;
            history.u1 = limited;
            limited.round() as u8
        });

        // re-check: a concurrent stop() must win over this cycle's output
        if self.is_enabled() {
            self.heater.set_duty(duty);
        }
        self.publish(target, pv);
    }

    fn publish(&self, target: f32, pv: f32) {
        let (p_share, i_share, d_share, raw) = self.history.lock(|history| {
            let history = history.borrow();
            (history.p_share, history.i_share, history.d_share, history.u)
        });
        self.telemetry.publish(TelemetrySample {
            target_c: target,
            boiler_c: pv,
            p_share,
            i_share,
            d_share,
            raw_output: raw,
            heater_duty: self.heater.duty(),
            pump_level: self.pump.level(),
        });
    }

    /// Periodic control task body.
    pub async fn run(&self) -> ! {
        let mut ticker = Ticker::every(self.sample_period());
        loop {
            ticker.next().await;
            self.run_cycle();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SoftSwitch;
    use crate::sensors::FixedProbe;

    struct Rig {
        heater_switch: Arc<SoftSwitch>,
        heater: Arc<HeaterPwm>,
        pump: Arc<PumpPwm>,
        probe: Arc<FixedProbe>,
        pid: PidController,
    }

    fn rig(settings: PidSettings) -> Rig {
        let heater_switch = Arc::new(SoftSwitch::new("heater"));
        let heater = Arc::new(HeaterPwm::new(heater_switch.clone()));
        let pump = Arc::new(PumpPwm::new(Arc::new(SoftSwitch::new("pump"))));
        pump.enable();
        let probe = Arc::new(FixedProbe::new(90.0));
        let telemetry = Arc::new(TelemetrySink::new());
        let pid = PidController::new(
            heater.clone(),
            pump.clone(),
            probe.clone() as Arc<dyn TemperatureProbe>,
            telemetry,
            settings,
        );
        Rig {
            heater_switch,
            heater,
            pump,
            probe,
            pid,
        }
    }

    fn zero_gains() -> PidSettings {
        PidSettings {
            p_pos: 0.0,
            p_neg: 0.0,
            i: 0.0,
            d: 0.0,
            ..PidSettings::default()
        }
    }

    #[test]
    fn target_is_clamped_to_valid_range() {
        let rig = rig(PidSettings::default());
        rig.pid.set_target(96.0, PidMode::Water);
        assert_eq!(rig.pid.target(), 96.0);
        rig.pid.set_target(150.0, PidMode::Water);
        assert_eq!(rig.pid.target(), PID_MIN_TEMP_C);
        rig.pid.set_target(5.0, PidMode::Steam);
        assert_eq!(rig.pid.target(), PID_MIN_TEMP_C);
        assert_eq!(rig.pid.mode(), PidMode::Steam);
    }

    #[test]
    fn start_resets_history() {
        let rig = rig(PidSettings::default());
        rig.pid.set_target(96.0, PidMode::Water);
        rig.pid.start();
        // build up some history away from target
        rig.probe.set(80.0);
        rig.pid.run_cycle();
        rig.probe.set(85.0);
        rig.pid.run_cycle();

        // restart at target: all shares and the raw output must be zero
        rig.probe.set(96.0);
        rig.pid.start();
        rig.pid.run_cycle();
        assert_eq!(rig.pid.p_share(), 0.0);
        assert_eq!(rig.pid.i_share(), 0.0);
        assert_eq!(rig.pid.d_share(), 0.0);
        assert_eq!(rig.pid.raw_output(), 0.0);
        assert_eq!(rig.heater.duty(), 0);
    }

    #[test]
    fn fast_heat_up_forces_full_output() {
        let rig = rig(PidSettings::default());
        rig.pid.set_target(96.0, PidMode::Water);
        rig.probe.set(40.0);
        rig.pid.start();
        rig.pid.run_cycle();
        assert_eq!(rig.heater.duty(), 100);
    }

    #[test]
    fn override_wins_for_exactly_n_cycles() {
        let rig = rig(zero_gains());
        rig.pid.set_target(96.0, PidMode::Water);
        rig.probe.set(96.0);
        rig.pid.start();
        rig.pid.override_output(42.0, 2);
        rig.pid.run_cycle();
        assert_eq!(rig.heater.duty(), 42);
        rig.pid.run_cycle();
        assert_eq!(rig.heater.duty(), 42);
        // third cycle reverts to the computed output: u1 decays via the
        // incremental form only through new shares, which are zero here,
        // so the output holds at the last override value
        rig.pid.run_cycle();
        assert_eq!(rig.heater.duty(), 42);
        assert_eq!(rig.pid.raw_output(), 42.0);
    }

    #[test]
    fn small_override_is_raised_to_min_output() {
        let rig = rig(zero_gains());
        rig.pid.set_target(96.0, PidMode::Water);
        rig.probe.set(96.0);
        rig.pid.start();
        rig.pid.override_output(3.0, 1);
        rig.pid.run_cycle();
        assert_eq!(rig.heater.duty(), PID_MIN_OUTPUT as u8);
    }

    #[test]
    fn idle_overtemp_clamps_to_five_percent() {
        let rig = rig(zero_gains());
        rig.pid.set_target(96.0, PidMode::Water);
        rig.probe.set(96.0);
        rig.pid.start();
        // load a high previous output, then sit above target with the pump off
        rig.pid.override_output(80.0, 1);
        rig.pid.run_cycle();
        assert_eq!(rig.heater.duty(), 80);
        rig.probe.set(97.0);
        assert_eq!(rig.pump.level(), 0);
        rig.pid.run_cycle();
        assert_eq!(rig.heater.duty(), IDLE_MAX_OUTPUT as u8);
    }

    #[test]
    fn idle_clamp_does_not_apply_while_pump_runs() {
        let rig = rig(zero_gains());
        rig.pid.set_target(96.0, PidMode::Water);
        rig.probe.set(96.0);
        rig.pid.start();
        rig.pid.override_output(80.0, 1);
        rig.pid.run_cycle();
        rig.pump.set_level(50);
        rig.probe.set(97.0);
        rig.pid.run_cycle();
        assert_eq!(rig.heater.duty(), 80);
    }

    #[test]
    fn sensor_fault_forces_heater_off() {
        let rig = rig(PidSettings::default());
        rig.pid.set_target(96.0, PidMode::Water);
        rig.probe.set(40.0);
        rig.pid.start();
        rig.pid.run_cycle();
        assert_eq!(rig.heater.duty(), 100);
        rig.probe.set(999.0);
        rig.pid.run_cycle();
        assert_eq!(rig.heater.duty(), 0);
    }

    #[test]
    fn steam_mode_reads_hottest_probe() {
        let rig = rig(zero_gains());
        rig.pid.set_target(115.0, PidMode::Steam);
        rig.probe.set_split(110.0, 100.0);
        rig.pid.start();
        rig.pid.run_cycle();
        // fast heat-up triggers off the max reading: 115 - 110 = 5 < 10,
        // so output stays at the (zero-gain) computed value, not 100
        assert_eq!(rig.heater.duty(), 0);
        rig.pid.set_target(125.0, PidMode::Steam);
        rig.pid.run_cycle();
        assert_eq!(rig.heater.duty(), 100);
    }

    #[test]
    fn stop_forces_duty_zero_and_disables() {
        let rig = rig(PidSettings::default());
        rig.pid.set_target(96.0, PidMode::Water);
        rig.probe.set(40.0);
        rig.pid.start();
        rig.pid.run_cycle();
        assert_eq!(rig.heater.duty(), 100);
        rig.pid.stop();
        assert_eq!(rig.heater.duty(), 0);
        assert!(!rig.heater.is_enabled());
        rig.heater.tick();
        assert!(!rig.heater_switch.is_on());
    }

    #[test]
    fn disabled_loop_zeroes_diagnostics() {
        let rig = rig(PidSettings::default());
        rig.pid.set_target(96.0, PidMode::Water);
        rig.probe.set(40.0);
        rig.pid.start();
        rig.pid.run_cycle();
        rig.pid.stop();
        rig.pid.run_cycle();
        assert_eq!(rig.pid.raw_output(), 0.0);
        assert_eq!(rig.pid.p_share(), 0.0);
    }
}
