//! Temperature source seam.
//!
//! ADC sampling and the sensor curve live outside the core; the control
//! loop only sees two boiler probe readings in °C. A failed probe reports
//! the 999.0 sentinel instead of an error.

use core::cell::RefCell;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

/// Out-of-range sentinel reported when a probe is unavailable.
pub const SENSOR_FAULT_C: f32 = 999.0;

pub trait TemperatureProbe: Send + Sync {
    /// Probe at the top of the boiler.
    fn boiler_top_c(&self) -> f32;
    /// Probe at the side of the boiler.
    fn boiler_side_c(&self) -> f32;

    fn boiler_avg_c(&self) -> f32 {
        (self.boiler_top_c() + self.boiler_side_c()) / 2.0
    }

    fn boiler_max_c(&self) -> f32 {
        self.boiler_top_c().max(self.boiler_side_c())
    }
}

/// Probe with manually set readings. Stands in for the real sensor head
/// on a bench rig and in unit tests.
pub struct FixedProbe {
    top: Mutex<CriticalSectionRawMutex, RefCell<f32>>,
    side: Mutex<CriticalSectionRawMutex, RefCell<f32>>,
}

impl FixedProbe {
    pub fn new(temp_c: f32) -> Self {
        Self {
            top: Mutex::new(RefCell::new(temp_c)),
            side: Mutex::new(RefCell::new(temp_c)),
        }
    }

    pub fn set(&self, temp_c: f32) {
        self.top.lock(|t| *t.borrow_mut() = temp_c);
        self.side.lock(|s| *s.borrow_mut() = temp_c);
    }

    pub fn set_split(&self, top_c: f32, side_c: f32) {
        self.top.lock(|t| *t.borrow_mut() = top_c);
        self.side.lock(|s| *s.borrow_mut() = side_c);
    }
}

impl TemperatureProbe for FixedProbe {
    fn boiler_top_c(&self) -> f32 {
        self.top.lock(|t| *t.borrow())
    }

    fn boiler_side_c(&self) -> f32 {
        self.side.lock(|s| *s.borrow())
    }
}

struct BoilerModel {
    temp_c: f32,
}

/// First-order thermal model of the boiler, matching the simulation the
/// PID gains were tuned against: heater power in, Newtonian loss out.
/// Stepped from the actual heater switch state so the phase PWM closes
/// the loop end to end.
pub struct SimulatedBoiler {
    state: Mutex<CriticalSectionRawMutex, RefCell<BoilerModel>>,
    ambient_c: f32,
    heater_power_w: f32,
    /// Heat capacity of the water volume, J/°C.
    capacity_j_per_c: f32,
    /// Newtonian loss constant, W/°C.
    loss_w_per_c: f32,
}

impl SimulatedBoiler {
    pub fn new(initial_c: f32) -> Self {
        Self {
            state: Mutex::new(RefCell::new(BoilerModel { temp_c: initial_c })),
            ambient_c: 20.0,
            heater_power_w: 1100.0,
            capacity_j_per_c: 4182.0 * 0.3,
            loss_w_per_c: 1.2,
        }
    }

    /// Advance the model by `dt_s` with the heater switch on or off.
    pub fn step(&self, dt_s: f32, heater_on: bool) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let power_in = if heater_on { self.heater_power_w } else { 0.0 };
            let loss = self.loss_w_per_c * (state.temp_c - self.ambient_c);
            state.temp_c += (power_in - loss) * dt_s / self.capacity_j_per_c;
        });
    }

    pub fn temp_c(&self) -> f32 {
        self.state.lock(|state| state.borrow().temp_c)
    }
}

impl TemperatureProbe for SimulatedBoiler {
    fn boiler_top_c(&self) -> f32 {
        self.temp_c()
    }

    fn boiler_side_c(&self) -> f32 {
        // the side probe sits lower on the boiler and reads slightly cold
        self.temp_c() - 0.4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heating_raises_and_idling_cools() {
        let boiler = SimulatedBoiler::new(20.0);
        for _ in 0..100 {
            boiler.step(1.0, true);
        }
        let heated = boiler.temp_c();
        assert!(heated > 20.0);
        for _ in 0..100 {
            boiler.step(1.0, false);
        }
        assert!(boiler.temp_c() < heated);
    }

    #[test]
    fn aggregates_combine_both_probes() {
        let boiler = SimulatedBoiler::new(100.0);
        assert!(boiler.boiler_max_c() > boiler.boiler_avg_c());
        assert!(boiler.boiler_avg_c() < boiler.boiler_top_c());
    }
}
