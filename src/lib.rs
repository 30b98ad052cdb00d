//! Background polling of CO2/temperature/humidity sensors sharing one
//! half-duplex bus.
//!
//! A [`SensorPoller`] reads every configured sensor once per polling
//! interval on its own worker thread, serializing bus access through a shared
//! [`BusManager`], retrying failed reads per sensor, and pushing one
//! [`Message`] per sensor per cycle into a [`DataSink`].

use {
    anyhow::{Context, Result},
    linux_embedded_hal::Serial,
    log::info,
    serial_core::{
        BaudRate, CharSize, FlowControl, Parity, SerialPort, SerialPortSettings, StopBits,
    },
    std::{path::Path, sync::Arc, time::Duration},
    tokio::task,
};

pub mod bus;
pub mod config;
pub mod cycle;
pub mod error;
pub mod message;
pub mod modbus;
pub mod poller;
pub mod retry;
pub mod sensors;
pub mod signal;

pub use {
    bus::{BusGuard, BusManager},
    config::{PollerConfig, SensorMode, Settings},
    cycle::{Jitter, PollCycle},
    error::Error,
    message::{DataSink, Message},
    poller::{PollerState, SensorPoller},
    retry::{RetryPolicy, RetryingReader},
    sensors::{Measurement, PolledSensor, Reading, Sensor, SensorDevice},
};

use sensors::{simulated::SimulatedDevice, tongdy::TongdyDevice};

/// How long a single serial read blocks before reporting no data.
const SERIAL_POLL: Duration = Duration::from_millis(5);

/// Runs the poller configured from the environment, printing every message as
/// a JSON line until interrupted.
pub async fn run() -> Result<()> {
    pretty_env_logger::init();
    color_backtrace::install();

    let settings = Settings::from_env()?;
    info!("Polling {} sensors in {:?} mode", settings.sensors.len(), settings.mode);

    match settings.mode {
        SensorMode::Hardware => {
            info!("MODBUS opening {} at {} baud", settings.port, settings.baud);
            let port = open_serial(&settings.port, settings.baud)?;
            let bus = Arc::new(BusManager::with_turnaround(
                settings.port.clone(),
                port,
                config::RS485_TURNAROUND,
            ));
            let sensors = settings
                .sensors
                .iter()
                .map(|sensor| PolledSensor::new(*sensor, Arc::clone(&bus), TongdyDevice::new()))
                .collect();
            serve(settings.poller, sensors).await
        }
        SensorMode::Simulated(profile) => {
            let bus = Arc::new(BusManager::new("simulated", ()));
            let sensors = settings
                .sensors
                .iter()
                .map(|sensor| {
                    PolledSensor::new(
                        *sensor,
                        Arc::clone(&bus),
                        SimulatedDevice::new(profile, sensor.voc),
                    )
                })
                .collect();
            serve(settings.poller, sensors).await
        }
    }
}

fn open_serial(path: &str, baud: u32) -> Result<Serial> {
    let mut serial =
        Serial::open(Path::new(path)).with_context(|| format!("Failed to open {}", path))?;

    serial
        .0
        .reconfigure(&|settings| {
            settings.set_baud_rate(BaudRate::from_speed(baud as usize))?;
            settings.set_char_size(CharSize::Bits8);
            settings.set_parity(Parity::ParityNone);
            settings.set_stop_bits(StopBits::Stop1);
            settings.set_flow_control(FlowControl::FlowNone);
            Ok(())
        })
        .with_context(|| format!("Failed to configure {}", path))?;
    serial.0.set_timeout(SERIAL_POLL)?;

    Ok(serial)
}

async fn serve<B: Send + 'static>(
    config: PollerConfig,
    sensors: Vec<PolledSensor<B>>,
) -> Result<()> {
    let mut poller = SensorPoller::new(config, sensors)?;
    let messages = poller.sink().receiver();

    poller.start()?;
    info!("Initialization complete");

    loop {
        tokio::select! {
            message = messages.recv() => {
                println!("{}", serde_json::to_string(&message?)?);
            }
            interrupted = tokio::signal::ctrl_c() => {
                interrupted?;
                info!("Interrupted, stopping poller");
                break;
            }
        }
    }

    task::spawn_blocking(move || poller.stop()).await??;
    Ok(())
}
