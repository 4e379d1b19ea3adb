//! Recording doubles for driving whole duty cycles in tests.

use crate::configuration::{ConfigStore, Configuration, MemoryConfigStore, PersistedConfig};
use crate::connectivity::Radio;
use crate::controller::{Board, DutyCycleController};
use crate::power::PowerControl;
use crate::provisioning::Provisioner;
use crate::reading::Sensor;
use crate::telemetry::{BrokerClient, ConnectStatus};
use core::convert::Infallible;
use core::time::Duration;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType, InputPin};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::rc::Rc;

#[derive(Clone, PartialEq, Debug)]
pub enum Event {
    SensorInit(u8),
    RadioVolatile,
    RadioWake,
    RadioStation,
    RadioBegin(String),
    RadioLeave,
    RadioOff,
    RadioSleep,
    BrokerConfigured(String),
    BrokerConnect,
    BrokerDisconnect,
    Publish(String, String),
    SwitchRead,
    Delay(u32),
    WatchdogArmed,
    Settle,
    DeepSleep(Duration),
    Halt,
    Provision,
}

pub type Log = Rc<RefCell<Vec<Event>>>;

pub struct MockSensor {
    id: u8,
    temperature: f32,
    humidity: f32,
    log: Log,
}

impl Sensor for MockSensor {
    fn init(&mut self) {
        self.log.borrow_mut().push(Event::SensorInit(self.id));
    }

    fn read_humidity(&mut self) -> f32 {
        self.humidity
    }

    fn read_temperature(&mut self) -> f32 {
        self.temperature
    }
}

pub struct MockRadio {
    connected_after: Option<usize>,
    polls: usize,
    driver_fails: bool,
    log: Log,
}

impl Radio for MockRadio {
    type Error = &'static str;

    fn set_persistent(&mut self, persistent: bool) -> Result<(), Self::Error> {
        if !persistent {
            self.log.borrow_mut().push(Event::RadioVolatile);
        }
        Ok(())
    }

    fn wake(&mut self) -> Result<(), Self::Error> {
        self.log.borrow_mut().push(Event::RadioWake);
        Ok(())
    }

    fn set_station_mode(&mut self) -> Result<(), Self::Error> {
        self.log.borrow_mut().push(Event::RadioStation);
        Ok(())
    }

    fn begin(&mut self, ssid: &str, _password: &str) -> Result<(), Self::Error> {
        self.polls = 0;
        self.log.borrow_mut().push(Event::RadioBegin(ssid.to_string()));
        if self.driver_fails {
            return Err("driver refused to start");
        }
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.polls += 1;
        self.connected_after.is_some_and(|n| self.polls > n)
    }

    fn local_ip(&mut self) -> Option<Ipv4Addr> {
        Some(Ipv4Addr::new(10, 0, 0, 7))
    }

    fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.log.borrow_mut().push(Event::RadioLeave);
        Ok(())
    }

    fn power_off(&mut self) -> Result<(), Self::Error> {
        self.log.borrow_mut().push(Event::RadioOff);
        Ok(())
    }

    fn force_sleep(&mut self) -> Result<(), Self::Error> {
        self.log.borrow_mut().push(Event::RadioSleep);
        Ok(())
    }
}

pub struct MockBroker {
    statuses: VecDeque<ConnectStatus>,
    publish_ok: bool,
    connected: bool,
    log: Log,
}

impl BrokerClient for MockBroker {
    fn configure(&mut self, config: &Configuration) {
        self.log
            .borrow_mut()
            .push(Event::BrokerConfigured(config.broker_url()));
    }

    fn connect(&mut self) -> ConnectStatus {
        self.log.borrow_mut().push(Event::BrokerConnect);
        let status = self.statuses.pop_front().unwrap_or(ConnectStatus::Accepted);
        self.connected = status.is_accepted();
        status
    }

    fn connected(&mut self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.log.borrow_mut().push(Event::BrokerDisconnect);
    }

    fn publish(&mut self, topic: &str, payload: &str) -> bool {
        self.log
            .borrow_mut()
            .push(Event::Publish(topic.to_string(), payload.to_string()));
        self.publish_ok
    }
}

/// Reads as asserted (low) for the first `asserted_reads` reads.
pub struct MockSwitch {
    asserted_reads: usize,
    log: Log,
}

impl ErrorType for MockSwitch {
    type Error = Infallible;
}

impl InputPin for MockSwitch {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        self.is_low().map(|low| !low)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        self.log.borrow_mut().push(Event::SwitchRead);
        if self.asserted_reads > 0 {
            self.asserted_reads -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

pub struct MockDelay {
    log: Log,
}

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.log.borrow_mut().push(Event::Delay(ns / 1_000_000));
    }

    fn delay_us(&mut self, us: u32) {
        self.log.borrow_mut().push(Event::Delay(us / 1_000));
    }

    fn delay_ms(&mut self, ms: u32) {
        self.log.borrow_mut().push(Event::Delay(ms));
    }
}

pub struct MockPower {
    feeds: Rc<Cell<usize>>,
    log: Log,
}

impl PowerControl for MockPower {
    fn arm_watchdog(&mut self) {
        self.log.borrow_mut().push(Event::WatchdogArmed);
    }

    fn feed_watchdog(&mut self) {
        self.feeds.set(self.feeds.get() + 1);
    }

    fn settle(&mut self) {
        self.log.borrow_mut().push(Event::Settle);
    }

    fn enter_deep_sleep(&mut self, duration: Duration) {
        self.log.borrow_mut().push(Event::DeepSleep(duration));
    }

    fn halt(&mut self) {
        self.log.borrow_mut().push(Event::Halt);
    }
}

pub struct MockProvisioner {
    doc: Option<PersistedConfig>,
    log: Log,
}

impl Provisioner for MockProvisioner {
    fn provision(
        &mut self,
        _current: &Configuration,
        _delay: &mut dyn DelayNs,
    ) -> anyhow::Result<Option<PersistedConfig>> {
        self.log.borrow_mut().push(Event::Provision);
        Ok(self.doc.clone())
    }
}

pub struct SharedStore(pub Rc<RefCell<MemoryConfigStore>>);

impl ConfigStore for SharedStore {
    fn load(&mut self) -> anyhow::Result<Option<String>> {
        self.0.borrow_mut().load()
    }

    fn save(&mut self, document: &str) -> anyhow::Result<()> {
        self.0.borrow_mut().save(document)
    }
}

pub type MockController =
    DutyCycleController<MockSensor, MockRadio, MockBroker, MockSwitch, MockDelay, MockPower>;

pub struct Rig {
    config: Configuration,
    sensors: [(f32, f32); 2],
    statuses: Vec<ConnectStatus>,
    publish_ok: bool,
    connected_after: Option<usize>,
    radio_fails: bool,
    asserted_reads: usize,
    provisioned: Option<PersistedConfig>,
    store: Rc<RefCell<MemoryConfigStore>>,
    feeds: Rc<Cell<usize>>,
}

impl Rig {
    pub fn new(config: Configuration) -> Self {
        Rig {
            config,
            sensors: [(f32::NAN, f32::NAN); 2],
            statuses: Vec::new(),
            publish_ok: true,
            connected_after: Some(0),
            radio_fails: false,
            asserted_reads: 0,
            provisioned: None,
            store: Rc::new(RefCell::new(MemoryConfigStore::default())),
            feeds: Rc::new(Cell::new(0)),
        }
    }

    /// `(temperature, humidity)` per sensor, NaN for a failed read.
    pub fn sensors(mut self, sensors: [(f32, f32); 2]) -> Self {
        self.sensors = sensors;
        self
    }

    pub fn broker_statuses(mut self, statuses: Vec<ConnectStatus>) -> Self {
        self.statuses = statuses;
        self
    }

    pub fn publish_fails(mut self) -> Self {
        self.publish_ok = false;
        self
    }

    pub fn radio_never_connects(mut self) -> Self {
        self.connected_after = None;
        self
    }

    /// The radio driver rejects the association request.
    pub fn radio_fails(mut self) -> Self {
        self.radio_fails = true;
        self
    }

    pub fn override_held_for(mut self, reads: usize) -> Self {
        self.asserted_reads = reads;
        self
    }

    pub fn provisioned(mut self, doc: PersistedConfig) -> Self {
        self.provisioned = Some(doc);
        self
    }

    pub fn store(&self) -> Rc<RefCell<MemoryConfigStore>> {
        self.store.clone()
    }

    pub fn feeds(&self) -> Rc<Cell<usize>> {
        self.feeds.clone()
    }

    pub fn build(self) -> (MockController, Log) {
        let log = Log::default();
        let [(t1, h1), (t2, h2)] = self.sensors;

        let board = Board {
            sensors: [
                MockSensor {
                    id: 1,
                    temperature: t1,
                    humidity: h1,
                    log: log.clone(),
                },
                MockSensor {
                    id: 2,
                    temperature: t2,
                    humidity: h2,
                    log: log.clone(),
                },
            ],
            radio: MockRadio {
                connected_after: self.connected_after,
                polls: 0,
                driver_fails: self.radio_fails,
                log: log.clone(),
            },
            broker: MockBroker {
                statuses: self.statuses.into(),
                publish_ok: self.publish_ok,
                connected: false,
                log: log.clone(),
            },
            override_switch: MockSwitch {
                asserted_reads: self.asserted_reads,
                log: log.clone(),
            },
            delay: MockDelay { log: log.clone() },
            power: MockPower {
                feeds: self.feeds,
                log: log.clone(),
            },
        };

        let controller = DutyCycleController::new(
            self.config,
            board,
            Box::new(SharedStore(self.store)),
            Box::new(MockProvisioner {
                doc: self.provisioned,
                log: log.clone(),
            }),
        )
        .expect("test configuration is valid");

        (controller, log)
    }
}

pub fn publishes(events: &[Event]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Publish(topic, payload) => Some((topic.clone(), payload.clone())),
            _ => None,
        })
        .collect()
}

pub fn count(events: &[Event], f: impl Fn(&Event) -> bool) -> usize {
    events.iter().filter(|e| f(e)).count()
}

pub fn position(events: &[Event], f: impl Fn(&Event) -> bool) -> Option<usize> {
    events.iter().position(f)
}

pub fn rposition(events: &[Event], f: impl Fn(&Event) -> bool) -> Option<usize> {
    events.iter().rposition(f)
}
