//! Host build of the node. Sensors, radio and broker are simulated, deep
//! sleep is a thread sleep, and a halt ends the process with
//! [`FAIL_STOP_EXIT_CODE`] so a supervisor can tell it apart from a crash.
//!
//! Behaviour is steered through environment variables:
//!
//! | variable                          | effect                                   |
//! |-----------------------------------|------------------------------------------|
//! | `CLIMATE_NODE_SIM_CONFIG`         | JSON configuration document to load/save |
//! | `CLIMATE_NODE_SIM_CYCLES`         | stop after this many cycles              |
//! | `CLIMATE_NODE_SIM_SPEEDUP`        | divide every wait and sleep by this      |
//! | `CLIMATE_NODE_SIM_NO_AP`          | access point never answers               |
//! | `CLIMATE_NODE_SIM_BROKER_DOWN`    | broker refuses every connect             |
//! | `CLIMATE_NODE_SIM_SENSOR2_FAULT`  | second sensor never answers              |
//! | `CLIMATE_NODE_SIM_OVERRIDE_READS` | override switch reads held this often    |

use crate::configuration::{ConfigStore, Configuration, MemoryConfigStore};
use crate::connectivity::Radio;
use crate::controller::{Board, CycleEnd, DutyCycleController};
use crate::global_settings::FAIL_STOP_EXIT_CODE;
use crate::power::PowerControl;
use crate::provisioning::NoProvisioning;
use crate::reading::Sensor;
use crate::telemetry::{BrokerClient, ConnectStatus};
use anyhow::Context;
use core::convert::Infallible;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType, InputPin};
use log::*;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs, process, thread};

pub struct SimulatedSensor {
    base_temperature: f32,
    base_humidity: f32,
    faulty: bool,
    samples: u32,
}

impl SimulatedSensor {
    pub fn new(base_temperature: f32, base_humidity: f32, faulty: bool) -> Self {
        SimulatedSensor {
            base_temperature,
            base_humidity,
            faulty,
            samples: 0,
        }
    }
}

impl Sensor for SimulatedSensor {
    fn init(&mut self) {
        self.samples += 1;
    }

    fn read_humidity(&mut self) -> f32 {
        if self.faulty {
            return f32::NAN;
        }
        self.base_humidity - (self.samples % 4) as f32 * 0.5
    }

    fn read_temperature(&mut self) -> f32 {
        if self.faulty {
            return f32::NAN;
        }
        self.base_temperature + (self.samples % 5) as f32 * 0.1
    }
}

pub struct SimulatedRadio {
    reachable: bool,
    polls: u32,
}

impl SimulatedRadio {
    pub fn new(reachable: bool) -> Self {
        SimulatedRadio {
            reachable,
            polls: 0,
        }
    }
}

impl Radio for SimulatedRadio {
    type Error = Infallible;

    fn set_persistent(&mut self, _persistent: bool) -> Result<(), Self::Error> {
        Ok(())
    }

    fn wake(&mut self) -> Result<(), Self::Error> {
        debug!("radio: wake");
        Ok(())
    }

    fn set_station_mode(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn begin(&mut self, ssid: &str, _password: &str) -> Result<(), Self::Error> {
        debug!("radio: associating with {ssid}");
        self.polls = 0;
        Ok(())
    }

    // associates on the third poll
    fn is_connected(&mut self) -> bool {
        self.polls += 1;
        self.reachable && self.polls > 2
    }

    fn local_ip(&mut self) -> Option<Ipv4Addr> {
        Some(Ipv4Addr::new(192, 168, 4, 20))
    }

    fn disconnect(&mut self) -> Result<(), Self::Error> {
        debug!("radio: leaving access point");
        Ok(())
    }

    fn power_off(&mut self) -> Result<(), Self::Error> {
        debug!("radio: off");
        Ok(())
    }

    fn force_sleep(&mut self) -> Result<(), Self::Error> {
        debug!("radio: forced sleep");
        Ok(())
    }
}

pub struct SimulatedBroker {
    available: bool,
    url: String,
    connected: bool,
}

impl SimulatedBroker {
    pub fn new(available: bool) -> Self {
        SimulatedBroker {
            available,
            url: String::new(),
            connected: false,
        }
    }
}

impl BrokerClient for SimulatedBroker {
    fn configure(&mut self, config: &Configuration) {
        self.url = config.broker_url();
    }

    fn connect(&mut self) -> ConnectStatus {
        debug!("broker: connecting to {}", self.url);
        self.connected = self.available;
        if self.available {
            ConnectStatus::Accepted
        } else {
            ConnectStatus::ServerUnavailable
        }
    }

    fn connected(&mut self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn publish(&mut self, topic: &str, payload: &str) -> bool {
        if !self.connected {
            return false;
        }
        info!("broker: {topic} <- {payload}");
        true
    }
}

pub struct SimulatedSwitch {
    asserted_reads: u32,
}

impl ErrorType for SimulatedSwitch {
    type Error = Infallible;
}

impl InputPin for SimulatedSwitch {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        self.is_low().map(|low| !low)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        let asserted = self.asserted_reads > 0;
        self.asserted_reads = self.asserted_reads.saturating_sub(1);
        Ok(asserted)
    }
}

/// Wall-clock delay, optionally sped up.
pub struct StdDelay {
    speedup: u32,
}

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        thread::sleep(Duration::from_nanos(u64::from(ns / self.speedup)));
    }
}

pub struct ProcessPower {
    speedup: u32,
}

impl PowerControl for ProcessPower {
    fn arm_watchdog(&mut self) {}

    fn feed_watchdog(&mut self) {}

    fn settle(&mut self) {
        thread::yield_now();
    }

    fn enter_deep_sleep(&mut self, duration: Duration) {
        thread::sleep(duration / self.speedup);
    }

    // no watchdog on a host, the supervisor restarts us
    fn halt(&mut self) {
        process::exit(FAIL_STOP_EXIT_CODE);
    }
}

/// Configuration document kept in a file.
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileConfigStore { path: path.into() }
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&mut self) -> anyhow::Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let document = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        Ok(Some(document))
    }

    fn save(&mut self, document: &str) -> anyhow::Result<()> {
        fs::write(&self.path, document).with_context(|| format!("writing {}", self.path.display()))
    }
}

fn flag(name: &str) -> bool {
    env::var_os(name).is_some()
}

fn number(name: &str) -> anyhow::Result<Option<u32>> {
    env::var(name)
        .ok()
        .map(|value| {
            value
                .parse::<u32>()
                .with_context(|| format!("{name}={value} is not a number"))
        })
        .transpose()
}

pub fn run() -> anyhow::Result<()> {
    let speedup = number("CLIMATE_NODE_SIM_SPEEDUP")?.unwrap_or(1).max(1);
    let cycles = number("CLIMATE_NODE_SIM_CYCLES")?;

    let mut store: Box<dyn ConfigStore> = match env::var_os("CLIMATE_NODE_SIM_CONFIG") {
        Some(path) => Box::new(FileConfigStore::new(path)),
        None => Box::new(MemoryConfigStore::default()),
    };
    let config = Configuration::load(store.as_mut());

    let board = Board {
        sensors: [
            SimulatedSensor::new(22.5, 48.0, false),
            SimulatedSensor::new(21.0, 50.2, flag("CLIMATE_NODE_SIM_SENSOR2_FAULT")),
        ],
        radio: SimulatedRadio::new(!flag("CLIMATE_NODE_SIM_NO_AP")),
        broker: SimulatedBroker::new(!flag("CLIMATE_NODE_SIM_BROKER_DOWN")),
        override_switch: SimulatedSwitch {
            asserted_reads: number("CLIMATE_NODE_SIM_OVERRIDE_READS")?.unwrap_or(0),
        },
        delay: StdDelay { speedup },
        power: ProcessPower { speedup },
    };

    let mut controller =
        DutyCycleController::new(config, board, store, Box::new(NoProvisioning))?;

    let mut completed = 0;
    while cycles.map_or(true, |limit| completed < limit) {
        let report = controller.run_cycle();
        completed += 1;
        info!(
            "Cycle {completed}: {} of 4 values published",
            report.outcome.published()
        );
        if let CycleEnd::Halted(reason) = report.end {
            anyhow::bail!("{reason}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::sample;

    #[test]
    fn faulty_sensor_samples_invalid() {
        assert!(!sample(&mut SimulatedSensor::new(21.0, 50.2, true)).is_valid());
        assert!(sample(&mut SimulatedSensor::new(21.0, 50.2, false)).is_valid());
    }

    #[test]
    fn file_store_keeps_document() {
        let path = env::temp_dir().join(format!("climate-node-{}.json", process::id()));
        let mut store = FileConfigStore::new(&path);

        assert_eq!(store.load().unwrap(), None);
        store.save(r#"{"deepsleep_duration":"15"}"#).unwrap();
        let config = Configuration::load(&mut store);
        fs::remove_file(&path).unwrap();

        assert_eq!(config.sleep_duration_minutes, 15);
    }

    #[test]
    fn unreachable_access_point_never_associates() {
        let mut radio = SimulatedRadio::new(false);
        radio.begin("ssid", "pw").unwrap();
        assert!((0..10).all(|_| !radio.is_connected()));
    }
}
