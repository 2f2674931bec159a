//! Bench harness: runs the control core against the simulated boiler.
//!
//! Wires soft switches in place of the SSR pins, spawns the driver tick
//! and control tasks, then walks through a warm-up and a shot while
//! printing telemetry as JSON lines. A config file path may be given as
//! the first argument; anything not set there falls back to the tuned
//! defaults.

use anyhow::Context;
use embassy_executor::Spawner;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Ticker, Timer};
use log::info;
use silvia_rs::config::MachineConfig;
use silvia_rs::controller::{
    controller_task, heater_tick_task, pid_task, preheat_task, pump_tick_task, shot_task,
    CommandChannel, MachineController,
};
use silvia_rs::hardware::SoftSwitch;
use silvia_rs::pid::PidController;
use silvia_rs::preheat::PreheatSequencer;
use silvia_rs::pwm::{HeaterPwm, PhaseOutput, PumpPwm};
use silvia_rs::sensors::{SimulatedBoiler, TemperatureProbe};
use silvia_rs::shot::ShotSequencer;
use silvia_rs::telemetry::TelemetrySink;
use silvia_rs::types::MachineCommand;
use silvia_rs::water_control::WaterControl;
use std::sync::Arc;

fn load_config() -> anyhow::Result<MachineConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path))
        }
        None => Ok(MachineConfig::default()),
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("config: {:#}", e);
            return;
        }
    };
    info!("starting control core: {:?}", config);

    let heater_switch = Arc::new(SoftSwitch::new("heater"));
    let pump = Arc::new(PumpPwm::new(Arc::new(SoftSwitch::new("pump"))));
    let valve = Arc::new(PhaseOutput::new(Arc::new(SoftSwitch::new("valve"))));
    let heater = Arc::new(HeaterPwm::new(heater_switch.clone()));

    let boiler = Arc::new(SimulatedBoiler::new(20.0));
    let telemetry = Arc::new(TelemetrySink::new());

    let pid = Arc::new(PidController::new(
        heater.clone(),
        pump.clone(),
        boiler.clone() as Arc<dyn TemperatureProbe>,
        telemetry.clone(),
        config.pid,
    ));
    let shot = Arc::new(ShotSequencer::new(
        pump.clone(),
        valve.clone(),
        pid.clone(),
        config.pid.boost_output,
        config.pid.boost_cycles,
    ));
    let preheat = Arc::new(PreheatSequencer::new(pump.clone(), valve.clone()));
    let water = Arc::new(WaterControl::new(
        pump.clone(),
        valve,
        pid.clone(),
        shot.clone(),
        preheat.clone(),
        config,
    ));

    let commands: Arc<CommandChannel> = Arc::new(Channel::new());
    let controller = MachineController::new(water, commands.clone());

    spawner.must_spawn(pump_tick_task(pump));
    spawner.must_spawn(heater_tick_task(heater));
    spawner.must_spawn(pid_task(pid));
    spawner.must_spawn(shot_task(shot));
    spawner.must_spawn(preheat_task(preheat));
    spawner.must_spawn(controller_task(controller));
    spawner.must_spawn(boiler_task(boiler, heater_switch));
    spawner.must_spawn(telemetry_task(telemetry));
    spawner.must_spawn(demo_task(commands));
}

/// Steps the thermal model from the actual heater switch state, closing
/// the loop behind the phase PWM.
#[embassy_executor::task]
async fn boiler_task(boiler: Arc<SimulatedBoiler>, heater_switch: Arc<SoftSwitch>) {
    let mut ticker = Ticker::every(Duration::from_millis(100));
    loop {
        ticker.next().await;
        boiler.step(0.1, heater_switch.is_on());
    }
}

#[embassy_executor::task]
async fn telemetry_task(telemetry: Arc<TelemetrySink>) {
    loop {
        let sample = telemetry.receive().await;
        match serde_json::to_string(&sample) {
            Ok(line) => println!("{}", line),
            Err(e) => log::error!("telemetry: {}", e),
        }
    }
}

/// Scripted session: power on, wait for warm-up, pull a shot, stop.
#[embassy_executor::task]
async fn demo_task(commands: Arc<CommandChannel>) {
    commands.send(MachineCommand::Enable).await;
    Timer::after(Duration::from_secs(60)).await;
    commands.send(MachineCommand::StartShot).await;
    Timer::after(Duration::from_secs(30)).await;
    commands
        .send(MachineCommand::Stop {
            pump_percent: 0,
            valve: false,
        })
        .await;
    Timer::after(Duration::from_secs(5)).await;
    commands.send(MachineCommand::Disable).await;
    info!("demo session complete");
}
