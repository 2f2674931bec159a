use serde::{Deserialize, Serialize};

/// Boiler regulation mode. Water mode regulates on the averaged boiler
/// temperature, steam mode on the hottest probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PidMode {
    Water,
    Steam,
}

/// Machine-level mode owned by `WaterControl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaterMode {
    Off,
    Water,
    WaterValve,
    Shot,
    Preheat,
    Steam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShotStage {
    Idle,
    InitFill,
    Ramp,
    Pause,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreheatStage {
    Off,
    PumpOn,
    PressureHold,
    Pause,
}

/// One control-cycle snapshot published by the PID loop.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TelemetrySample {
    pub target_c: f32,
    pub boiler_c: f32,
    pub p_share: f32,
    pub i_share: f32,
    pub d_share: f32,
    pub raw_output: f32,
    pub heater_duty: u8,
    pub pump_level: u8,
}

/// Commands accepted by the machine controller. Buttons and the web
/// front end are expected to funnel everything through this enum; no
/// internal component calls `WaterControl` directly.
#[derive(Debug, Clone, Copy)]
pub enum MachineCommand {
    Enable,
    Disable,
    StartPump { percent: u8, valve: bool },
    StartShot,
    StartPreheat,
    StartSteam { pump_percent: u8, valve: bool },
    OverridePump { percent: u8, duration_ms: u32 },
    Stop { pump_percent: u8, valve: bool },
}

/// Pump tick interval: one full 50 Hz mains period.
pub const PUMP_TICK_MS: u64 = 20;
/// Heater tick interval: one half mains period; 100 slots make a 1 s cycle.
pub const HEATER_TICK_MS: u64 = 10;
