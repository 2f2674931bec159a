//! Software phase-control PWM for the AC loads.
//!
//! Both drivers store only atomics; the tick is the single place that
//! touches the physical switch and is safe to call from an interrupt-rate
//! context. Setters store state and never perform I/O.

use crate::hardware::OutputSwitch;
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::Instant;
use log::error;
use std::sync::Arc;

/// Enable-gated binary actuator. `on()` is a no-op unless enabled,
/// `off()` always reaches the switch.
pub struct PhaseOutput {
    switch: Arc<dyn OutputSwitch>,
    enabled: AtomicBool,
}

impl PhaseOutput {
    pub fn new(switch: Arc<dyn OutputSwitch>) -> Self {
        let output = Self {
            switch,
            enabled: AtomicBool::new(false),
        };
        output.off();
        output
    }

    pub fn enable(&self) {
        self.off();
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        self.off();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn on(&self) {
        if self.is_enabled() {
            self.switch.set_active(true);
        }
    }

    pub fn off(&self) {
        self.switch.set_active(false);
    }
}

/// Round a requested percentage down into one of the 11 discrete pump
/// levels. Anything below 5 is off, 95..=100 is full; requests above 100
/// are invalid and map to 0.
pub fn bucket(percent: u8) -> u8 {
    match percent {
        0..=4 => 0,
        5..=14 => 10,
        15..=24 => 20,
        25..=34 => 30,
        35..=44 => 40,
        45..=54 => 50,
        55..=64 => 60,
        65..=74 => 70,
        75..=84 => 80,
        85..=94 => 90,
        95..=100 => 100,
        _ => 0,
    }
}

fn pump_period(level: u8) -> u32 {
    match level {
        0 | 100 => 1,
        30 => 3,
        20 | 40 | 60 | 80 => 5,
        50 => 2,
        _ => 10,
    }
}

/// Fixed on/off pattern per level, chosen to spread the on pulses across
/// the period instead of bunching them.
fn pump_slot_on(level: u8, slot: u32) -> bool {
    match level {
        0 => false,
        10 | 20 | 30 | 50 => slot == 0,
        40 => slot == 0 || slot == 2,
        60 => slot <= 1 || slot == 3,
        70 => !(slot == 3 || slot == 6 || slot == 9),
        80 => slot < 4,
        90 => slot < 9,
        100 => true,
        _ => false,
    }
}

/// 11-level pump driver ticked once per full mains period (20 ms).
pub struct PumpPwm {
    output: PhaseOutput,
    level: AtomicU8,
    position: AtomicU32,
    last_on: Mutex<CriticalSectionRawMutex, Cell<Option<Instant>>>,
}

impl PumpPwm {
    pub fn new(switch: Arc<dyn OutputSwitch>) -> Self {
        Self {
            output: PhaseOutput::new(switch),
            level: AtomicU8::new(0),
            position: AtomicU32::new(0),
            last_on: Mutex::new(Cell::new(None)),
        }
    }

    pub fn enable(&self) {
        self.output.enable();
    }

    pub fn disable(&self) {
        self.output.disable();
    }

    pub fn is_enabled(&self) -> bool {
        self.output.is_enabled()
    }

    /// Store the bucketed level. Safe from any context; the tick picks up
    /// the new pattern within one period. No-op while disabled.
    pub fn set_level(&self, percent: u8) {
        if !self.output.is_enabled() {
            return;
        }
        if percent > 100 {
            error!("pump: requested level {}% is not valid", percent);
            self.level.store(0, Ordering::Release);
            return;
        }
        let level = bucket(percent);
        if level != 0 && self.level.load(Ordering::Acquire) == 0 {
            self.last_on.lock(|cell| cell.set(Some(Instant::now())));
        }
        self.level.store(level, Ordering::Release);
    }

    pub fn level(&self) -> u8 {
        self.level.load(Ordering::Acquire)
    }

    /// When the pump last left 0 %.
    pub fn last_on(&self) -> Option<Instant> {
        self.last_on.lock(|cell| cell.get())
    }

    /// Interrupt-rate tick: emit the pattern slot for the current level.
    /// The position counter keeps running across level changes and wraps
    /// modulo the new period.
    pub fn tick(&self) {
        if !self.output.is_enabled() {
            self.position.store(0, Ordering::Relaxed);
            self.output.off();
            return;
        }
        let level = self.level.load(Ordering::Acquire);
        let period = pump_period(level);
        let slot = self.position.load(Ordering::Relaxed) % period;
        if pump_slot_on(level, slot) {
            self.output.on();
        } else {
            self.output.off();
        }
        self.position.store((slot + 1) % period, Ordering::Relaxed);
    }
}

/// 101-level heater driver ticked once per half mains period (10 ms),
/// giving a 1 s full cycle over 100 slots.
pub struct HeaterPwm {
    output: PhaseOutput,
    duty: AtomicU8,
    position: AtomicU8,
}

impl HeaterPwm {
    pub fn new(switch: Arc<dyn OutputSwitch>) -> Self {
        Self {
            output: PhaseOutput::new(switch),
            duty: AtomicU8::new(0),
            position: AtomicU8::new(0),
        }
    }

    pub fn enable(&self) {
        self.output.enable();
    }

    pub fn disable(&self) {
        self.output.disable();
    }

    pub fn is_enabled(&self) -> bool {
        self.output.is_enabled()
    }

    /// Restart the PWM cycle so it lines up with the control period.
    pub fn sync(&self) {
        self.position.store(0, Ordering::Relaxed);
    }

    pub fn set_duty(&self, percent: u8) {
        if !self.output.is_enabled() {
            return;
        }
        if percent > 100 {
            error!("heater: duty {}% is not valid", percent);
            self.duty.store(0, Ordering::Release);
            return;
        }
        self.duty.store(percent, Ordering::Release);
    }

    pub fn duty(&self) -> u8 {
        self.duty.load(Ordering::Acquire)
    }

    /// Interrupt-rate tick: on while the slot index is below the duty.
    pub fn tick(&self) {
        if !self.output.is_enabled() {
            self.position.store(0, Ordering::Relaxed);
            self.output.off();
            return;
        }
        let position = self.position.load(Ordering::Relaxed);
        if self.duty.load(Ordering::Acquire) > position {
            self.output.on();
        } else {
            self.output.off();
        }
        self.position
            .store((position + 1) % 100, Ordering::Relaxed);
    }
}
