pub mod config;
pub mod controller;
pub mod hardware;
pub mod pid;
pub mod preheat;
pub mod pwm;
pub mod scheduler;
pub mod sensors;
pub mod shot;
pub mod telemetry;
pub mod types;
pub mod water_control;

pub use controller::*;
pub use types::*;
pub use water_control::WaterControl;
