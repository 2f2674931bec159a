//! Named timing and gain constants supplied at startup.
//!
//! Values are the hand-tuned numbers from the machine this controller was
//! developed on. No runtime persistence; the config is read once during
//! wiring and handed to the components that need it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PidSettings {
    /// Proportional gain applied while the temperature is falling.
    pub p_pos: f32,
    /// Proportional gain applied while the temperature is rising.
    pub p_neg: f32,
    pub i: f32,
    pub d: f32,
    /// Control period in milliseconds.
    pub sample_period_ms: u32,
    /// Forced heater output issued when a shot reaches full flow.
    pub boost_output: f32,
    /// How many control cycles the shot boost stays in place.
    pub boost_cycles: u8,
}

impl Default for PidSettings {
    fn default() -> Self {
        Self {
            p_pos: 32.0,
            p_neg: 90.0,
            i: 1.2,
            d: -20.0,
            sample_period_ms: 1000,
            boost_output: 100.0,
            boost_cycles: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShotParams {
    /// Initial 100 % pump duration to fill the brew head.
    pub init_fill_ms: u32,
    /// Ramp duration from `start_pct` to `stop_pct`.
    pub ramp_ms: u32,
    /// Optional 0 % pump pause after the ramp; 0 skips the pause.
    pub pause_ms: u32,
    pub start_pct: u8,
    pub stop_pct: u8,
}

impl Default for ShotParams {
    fn default() -> Self {
        Self {
            init_fill_ms: 300,
            ramp_ms: 3000,
            pause_ms: 4000,
            start_pct: 10,
            stop_pct: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PreheatParams {
    /// 100 % pump with the valve open.
    pub pump_ms: u32,
    /// Valve closed, pump still on: builds brew-head pressure.
    pub hold_ms: u32,
    /// Everything off between cycles.
    pub pause_ms: u32,
}

impl Default for PreheatParams {
    fn default() -> Self {
        Self {
            pump_ms: 1000,
            hold_ms: 800,
            pause_ms: 10000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub brew_temp_c: f32,
    pub steam_temp_c: f32,
    pub pid: PidSettings,
    pub shot: ShotParams,
    pub preheat: PreheatParams,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            brew_temp_c: 96.0,
            steam_temp_c: 115.0,
            pid: PidSettings::default(),
            shot: ShotParams::default(),
            preheat: PreheatParams::default(),
        }
    }
}
