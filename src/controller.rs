//! Command front end for the control core.
//!
//! Buttons and any remote interface funnel everything through a single
//! command channel; the controller loop is the only caller of
//! `WaterControl`, which keeps sequencer arbitration in one place. The
//! embassy task functions that tick the drivers and run the loops live
//! at the bottom.

use crate::pid::PidController;
use crate::preheat::PreheatSequencer;
use crate::pwm::{HeaterPwm, PumpPwm};
use crate::shot::ShotSequencer;
use crate::types::{MachineCommand, HEATER_TICK_MS, PUMP_TICK_MS};
use crate::water_control::WaterControl;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Ticker};
use log::{debug, info};
use std::sync::Arc;

pub type CommandChannel = Channel<CriticalSectionRawMutex, MachineCommand, 8>;

pub struct MachineController {
    water: Arc<WaterControl>,
    commands: Arc<CommandChannel>,
}

impl MachineController {
    pub fn new(water: Arc<WaterControl>, commands: Arc<CommandChannel>) -> Self {
        Self { water, commands }
    }

    pub fn dispatch(&self, command: MachineCommand) {
        debug!("command: {:?}", command);
        match command {
            MachineCommand::Enable => self.water.enable(),
            MachineCommand::Disable => self.water.disable(),
            MachineCommand::StartPump { percent, valve } => {
                self.water.start_pump(percent, valve)
            }
            MachineCommand::StartShot => self.water.start_shot(),
            MachineCommand::StartPreheat => self.water.start_preheat(),
            MachineCommand::StartSteam { pump_percent, valve } => {
                self.water.start_steam(pump_percent, valve)
            }
            MachineCommand::OverridePump { percent, duration_ms } => self
                .water
                .override_pump(percent, Duration::from_millis(u64::from(duration_ms))),
            MachineCommand::Stop { pump_percent, valve } => {
                self.water
                    .stop(pump_percent, valve, crate::types::WaterMode::Off)
            }
        }
    }

    pub async fn run(&self) -> ! {
        info!("machine controller started");
        loop {
            let command = self.commands.receive().await;
            self.dispatch(command);
        }
    }
}

#[embassy_executor::task]
pub async fn controller_task(controller: MachineController) {
    controller.run().await
}

#[embassy_executor::task]
pub async fn pid_task(pid: Arc<PidController>) {
    info!("PID task started");
    pid.run().await
}

#[embassy_executor::task]
pub async fn shot_task(shot: Arc<ShotSequencer>) {
    shot.run().await
}

#[embassy_executor::task]
pub async fn preheat_task(preheat: Arc<PreheatSequencer>) {
    preheat.run().await
}

/// Stands in for the mains zero-cross interrupt on the pump phase.
#[embassy_executor::task]
pub async fn pump_tick_task(pump: Arc<PumpPwm>) {
    let mut ticker = Ticker::every(Duration::from_millis(PUMP_TICK_MS));
    loop {
        ticker.next().await;
        pump.tick();
    }
}

/// Stands in for the half-period zero-cross interrupt on the heater phase.
#[embassy_executor::task]
pub async fn heater_tick_task(heater: Arc<HeaterPwm>) {
    let mut ticker = Ticker::every(Duration::from_millis(HEATER_TICK_MS));
    loop {
        ticker.next().await;
        heater.tick();
    }
}
