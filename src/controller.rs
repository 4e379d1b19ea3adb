/*
 * ESP32 Climate Node
 *
 * MIT license
 *
 * Copyright (c) 2021-2023 Michael Zill
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 *
 * Apache license, Version 2.0
 *
 * Copyright (c) 2021-2023 Michael Zill
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
use crate::configuration::{ConfigStore, Configuration, OverrideMode, TimeoutAction};
use crate::connectivity::{ConnectivityManager, Radio};
use crate::errors::{ConfigError, ConnectError};
use crate::global_settings::OVERRIDE_POLL_INTERVAL_MS;
use crate::power::{FeedingDelay, PowerControl};
use crate::provisioning::Provisioner;
use crate::reading::{Reading, Sensor, SensorChannel};
use crate::telemetry::{BrokerClient, TelemetryChannel};
use core::fmt;
use core::time::Duration;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::InputPin;
use log::*;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CycleState {
    Boot,
    CheckOverride,
    Connecting,
    Sampling,
    Publishing,
    PoweringDown,
    Sleeping,
    Halted,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum HaltReason {
    AccessPointUnreachable,
    BrokerUnreachable,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccessPointUnreachable => write!(f, "Access point unreachable"),
            Self::BrokerUnreachable => write!(f, "Broker unreachable"),
        }
    }
}

/// What happened during one cycle. Published metrics are ordered
/// T1, HR1, T2, HR2; `None` marks a metric that was not attempted.
#[derive(Copy, Clone, Default, Debug)]
pub struct CycleOutcome {
    pub connected: bool,
    pub readings: [Reading; 2],
    pub publish_results: [Option<bool>; 4],
}

impl CycleOutcome {
    pub fn published(&self) -> usize {
        self.publish_results
            .iter()
            .filter(|result| **result == Some(true))
            .count()
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CycleEnd {
    Slept(Duration),
    Halted(HaltReason),
}

#[derive(Copy, Clone, Debug)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub end: CycleEnd,
}

/// Hardware the controller drives, constructed once at boot.
pub struct Board<S, R, B, P, D, W> {
    pub sensors: [S; 2],
    pub radio: R,
    pub broker: B,
    pub override_switch: P,
    pub delay: D,
    pub power: W,
}

pub struct DutyCycleController<S, R, B, P, D, W> {
    config: Configuration,
    store: Box<dyn ConfigStore>,
    provisioner: Box<dyn Provisioner>,
    channels: [SensorChannel<S>; 2],
    connectivity: ConnectivityManager<R>,
    telemetry: TelemetryChannel<B>,
    override_switch: P,
    delay: D,
    power: W,
    state: CycleState,
}

impl<S, R, B, P, D, W> DutyCycleController<S, R, B, P, D, W>
where
    S: Sensor,
    R: Radio,
    B: BrokerClient,
    P: InputPin,
    D: DelayNs,
    W: PowerControl,
{
    pub fn new(
        config: Configuration,
        board: Board<S, R, B, P, D, W>,
        store: Box<dyn ConfigStore>,
        provisioner: Box<dyn Provisioner>,
    ) -> Result<Self, ConfigError> {
        let [first, second] = board.sensors;

        let mut controller = DutyCycleController {
            config,
            store,
            provisioner,
            channels: [SensorChannel::new(1, first), SensorChannel::new(2, second)],
            connectivity: ConnectivityManager::new(board.radio),
            telemetry: TelemetryChannel::new(board.broker),
            override_switch: board.override_switch,
            delay: board.delay,
            power: board.power,
            state: CycleState::Boot,
        };
        controller.assign_topics()?;

        Ok(controller)
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Runs cycles until one halts. On hardware the first deep sleep ends
    /// the program, so this only loops where sleeping returns.
    pub fn run(&mut self) -> HaltReason {
        loop {
            if let CycleEnd::Halted(reason) = self.run_cycle().end {
                return reason;
            }
        }
    }

    pub fn run_cycle(&mut self) -> CycleReport {
        let mut outcome = CycleOutcome::default();

        self.transition(CycleState::Boot);
        self.power.arm_watchdog();
        announce();

        self.transition(CycleState::CheckOverride);
        self.check_override();
        self.telemetry.client_mut().configure(&self.config);

        self.transition(CycleState::Connecting);
        let connected = self.connectivity.connect(
            &self.config,
            &mut FeedingDelay::new(&mut self.delay, &mut self.power),
        );
        if let Err(err) = connected {
            error!("{err}");
            // driver errors are not an unreachable access point
            if matches!(err, ConnectError::AssociationTimeout(_))
                && self.config.association.on_timeout == TimeoutAction::FailStop
            {
                return self.halt(outcome, HaltReason::AccessPointUnreachable);
            }
            warn!("Skipping measurement, trying again next cycle");
            return self.power_down(outcome);
        }
        outcome.connected = true;

        self.transition(CycleState::Sampling);
        for (reading, channel) in outcome.readings.iter_mut().zip(self.channels.iter_mut()) {
            *reading = channel.sample();
        }

        self.transition(CycleState::Publishing);
        if let Err(err) = self
            .telemetry
            .ensure_connected(&mut FeedingDelay::new(&mut self.delay, &mut self.power))
        {
            error!("{err}");
            return self.halt(outcome, HaltReason::BrokerUnreachable);
        }

        for (results, channel) in outcome
            .publish_results
            .chunks_exact_mut(2)
            .zip(self.channels.iter())
        {
            let reading = channel.reading();
            let (Some(temperature), Some(humidity)) =
                (reading.temperature_c(), reading.humidity_pct())
            else {
                warn!("Sensor {}: no valid reading, nothing to publish", channel.id());
                continue;
            };

            results[0] = Some(self.telemetry.publish(
                &format!("T{}", channel.id()),
                channel.topic_temperature(),
                temperature,
            ));
            results[1] = Some(self.telemetry.publish(
                &format!("HR{}", channel.id()),
                channel.topic_humidity(),
                humidity,
            ));
        }

        self.power_down(outcome)
    }

    fn transition(&mut self, next: CycleState) {
        debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn check_override(&mut self) {
        let skip_provisioning = match self.config.override_mode {
            OverrideMode::Disabled => false,
            OverrideMode::HoldAwake => {
                while self.override_asserted() {
                    info!("Override switch held, staying awake");
                    FeedingDelay::new(&mut self.delay, &mut self.power)
                        .delay_ms(OVERRIDE_POLL_INTERVAL_MS);
                }
                false
            }
            OverrideMode::SkipProvisioning => {
                let asserted = self.override_asserted();
                if asserted {
                    info!("Override switch held, skipping provisioning for this cycle");
                }
                asserted
            }
        };

        if self.config.provisioning_enabled && !skip_provisioning {
            self.provision();
        }
    }

    // switch pulls the input low when closed
    fn override_asserted(&mut self) -> bool {
        match self.override_switch.is_low() {
            Ok(asserted) => asserted,
            Err(err) => {
                warn!("Reading the override switch failed: {err:?}");
                false
            }
        }
    }

    fn provision(&mut self) {
        let submitted = self.provisioner.provision(
            &self.config,
            &mut FeedingDelay::new(&mut self.delay, &mut self.power),
        );

        let doc = match submitted {
            Ok(Some(doc)) => doc,
            Ok(None) => return,
            Err(err) => {
                warn!("Provisioning failed: {err:#}");
                return;
            }
        };

        let config = match self.config.merged(&doc) {
            Ok(config) => config,
            Err(err) => {
                warn!("Rejected provisioned configuration: {err}");
                return;
            }
        };

        match config.to_persisted().to_json() {
            Ok(document) => match self.store.save(&document) {
                Ok(()) => info!("Saved provisioned configuration"),
                Err(err) => warn!("Saving provisioned configuration failed: {err:#}"),
            },
            Err(err) => warn!("{err}"),
        }

        let previous = core::mem::replace(&mut self.config, config);
        if let Err(err) = self.assign_topics() {
            warn!("{err}, keeping the previous configuration");
            self.config = previous;
        }
    }

    fn assign_topics(&mut self) -> Result<(), ConfigError> {
        for channel in self.channels.iter_mut() {
            let (temperature, humidity) = self.config.channel_topics(channel.id())?;
            channel.set_topics(temperature, humidity);
        }
        Ok(())
    }

    // Teardown runs on every path that ends in sleep.
    fn power_down(&mut self, outcome: CycleOutcome) -> CycleReport {
        self.transition(CycleState::PoweringDown);
        self.telemetry.disconnect();
        self.connectivity.disconnect();

        self.transition(CycleState::Sleeping);
        let duration = self.config.sleep_duration();
        info!(
            "Going into deep sleep for {} minutes",
            duration.as_secs() / 60
        );
        self.power.settle();
        self.power.enter_deep_sleep(duration);

        CycleReport {
            outcome,
            end: CycleEnd::Slept(duration),
        }
    }

    fn halt(&mut self, outcome: CycleOutcome, reason: HaltReason) -> CycleReport {
        error!("{reason}, halting until the watchdog resets the node");
        self.transition(CycleState::Halted);
        self.power.halt();

        CycleReport {
            outcome,
            end: CycleEnd::Halted(reason),
        }
    }
}

fn announce() {
    info!("==============================================");
    info!("//////////////////////////////////////////////");
    info!("========  Measurement with DeepSleep =========");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::{AssociationPolicy, PersistedConfig};
    use crate::telemetry::ConnectStatus;
    use crate::test_support::*;

    fn config() -> Configuration {
        Configuration {
            wifi_ssid: "ssid".to_string(),
            wifi_password: "secret".to_string(),
            broker_host: "io.adafruit.com".to_string(),
            broker_port: 1883,
            broker_user: "alice".to_string(),
            broker_key: "key".to_string(),
            feed_prefix: "box1".to_string(),
            sleep_duration_minutes: 6,
            override_mode: OverrideMode::HoldAwake,
            provisioning_enabled: false,
            association: AssociationPolicy {
                timeout: Some(Duration::from_secs(5)),
                on_timeout: TimeoutAction::SkipCycle,
            },
        }
    }

    fn teardown_before_sleep(events: &[Event]) {
        let sleep = position(events, |e| matches!(e, Event::DeepSleep(_)))
            .expect("node never went to sleep");
        let broker = rposition(events, |e| *e == Event::BrokerDisconnect).unwrap();
        let radio_leave = rposition(events, |e| *e == Event::RadioLeave).unwrap();
        let radio_off = rposition(events, |e| *e == Event::RadioOff).unwrap();
        let radio_sleep = rposition(events, |e| *e == Event::RadioSleep).unwrap();

        assert!(broker < radio_leave);
        assert!(radio_leave < radio_off);
        assert!(radio_off < radio_sleep);
        assert!(radio_sleep < sleep);
        assert_eq!(sleep, events.len() - 1);
    }

    #[test]
    fn both_sensors_valid_publishes_four_metrics() {
        let rig = Rig::new(config()).sensors([(22.5, 48.0), (21.0, 50.2)]);
        let (mut controller, log) = rig.build();

        let report = controller.run_cycle();
        let events = log.borrow();

        assert_eq!(
            publishes(&events),
            [
                ("alice/feeds/box1-t1".to_string(), "22.50".to_string()),
                ("alice/feeds/box1-hr1".to_string(), "48.00".to_string()),
                ("alice/feeds/box1-t2".to_string(), "21.00".to_string()),
                ("alice/feeds/box1-hr2".to_string(), "50.20".to_string()),
            ]
        );
        assert_eq!(report.outcome.published(), 4);
        assert!(report.outcome.connected);
        assert_eq!(report.end, CycleEnd::Slept(Duration::from_secs(360)));
        assert!(events.contains(&Event::DeepSleep(Duration::from_secs(360))));
        teardown_before_sleep(&events);
        assert_eq!(controller.state(), CycleState::Sleeping);
    }

    #[test]
    fn invalid_sensor_is_not_published() {
        let rig = Rig::new(config()).sensors([(22.5, 48.0), (f32::NAN, 50.2)]);
        let (mut controller, log) = rig.build();

        let report = controller.run_cycle();
        let events = log.borrow();

        let topics: Vec<String> = publishes(&events).into_iter().map(|(t, _)| t).collect();
        assert_eq!(topics, ["alice/feeds/box1-t1", "alice/feeds/box1-hr1"]);
        assert_eq!(
            report.outcome.publish_results,
            [Some(true), Some(true), None, None]
        );
        assert!(!report.outcome.readings[1].is_valid());
        assert!(matches!(report.end, CycleEnd::Slept(_)));
        teardown_before_sleep(&events);
    }

    #[test]
    fn unrepresentable_values_are_not_published() {
        let rig = Rig::new(config()).sensors([(f32::INFINITY, 48.0), (1e20, 50.2)]);
        let (mut controller, log) = rig.build();

        let report = controller.run_cycle();
        let events = log.borrow();

        assert_eq!(
            publishes(&events),
            [("alice/feeds/box1-hr2".to_string(), "50.20".to_string())]
        );
        assert!(!report.outcome.readings[0].is_valid());
        assert!(report.outcome.readings[1].is_valid());
        assert_eq!(
            report.outcome.publish_results,
            [None, None, Some(false), Some(true)]
        );
        assert_eq!(report.outcome.published(), 1);
        assert!(matches!(report.end, CycleEnd::Slept(_)));
        teardown_before_sleep(&events);
    }

    #[test]
    fn no_valid_reading_still_sleeps() {
        let rig = Rig::new(config()).sensors([(f32::NAN, f32::NAN), (f32::NAN, 12.0)]);
        let (mut controller, log) = rig.build();

        let report = controller.run_cycle();
        let events = log.borrow();

        assert!(publishes(&events).is_empty());
        assert_eq!(report.outcome.published(), 0);
        teardown_before_sleep(&events);
    }

    #[test]
    fn broker_failures_halt_after_three_attempts() {
        let rig = Rig::new(config())
            .sensors([(22.5, 48.0), (21.0, 50.2)])
            .broker_statuses(vec![ConnectStatus::ServerUnavailable; 10]);
        let (mut controller, log) = rig.build();

        let report = controller.run_cycle();
        let events = log.borrow();

        assert_eq!(count(&events, |e| *e == Event::BrokerConnect), 3);
        assert_eq!(
            count(&events, |e| *e == Event::Delay(5000)),
            2,
            "waits only between attempts"
        );
        assert_eq!(report.end, CycleEnd::Halted(HaltReason::BrokerUnreachable));
        assert_eq!(events.last(), Some(&Event::Halt));
        assert!(!events.iter().any(|e| matches!(e, Event::DeepSleep(_))));
        assert!(!events.contains(&Event::RadioOff));
        assert!(publishes(&events).is_empty());
        assert_eq!(controller.state(), CycleState::Halted);
    }

    #[test]
    fn broker_recovering_within_budget_publishes() {
        let rig = Rig::new(config())
            .sensors([(22.5, 48.0), (21.0, 50.2)])
            .broker_statuses(vec![
                ConnectStatus::Timeout,
                ConnectStatus::Timeout,
                ConnectStatus::Accepted,
            ]);
        let (mut controller, log) = rig.build();

        let report = controller.run_cycle();

        assert_eq!(report.outcome.published(), 4);
        assert_eq!(count(&log.borrow(), |e| *e == Event::BrokerConnect), 3);
    }

    #[test]
    fn held_override_keeps_node_awake() {
        let rig = Rig::new(config())
            .sensors([(22.5, 48.0), (21.0, 50.2)])
            .override_held_for(40);
        let feeds = rig.feeds();
        let (mut controller, log) = rig.build();

        controller.run_cycle();
        let events = log.borrow();

        let radio_start = position(&events, |e| *e == Event::RadioVolatile).unwrap();
        let before_radio = &events[..radio_start];
        assert_eq!(count(before_radio, |e| *e == Event::Delay(1500)), 40);
        assert_eq!(count(before_radio, |e| *e == Event::SwitchRead), 41);
        assert!(before_radio.iter().all(|e| matches!(
            e,
            Event::WatchdogArmed | Event::SwitchRead | Event::Delay(1500) | Event::BrokerConfigured(_)
        )));
        assert!(feeds.get() >= 40);
    }

    #[test]
    fn association_timeout_skips_to_sleep() {
        let rig = Rig::new(config())
            .sensors([(22.5, 48.0), (21.0, 50.2)])
            .radio_never_connects();
        let (mut controller, log) = rig.build();

        let report = controller.run_cycle();
        let events = log.borrow();

        assert!(!report.outcome.connected);
        assert!(!events.iter().any(|e| matches!(e, Event::SensorInit(_))));
        assert!(!events.contains(&Event::BrokerConnect));
        assert_eq!(count(&events, |e| *e == Event::Delay(500)), 10);
        assert_eq!(report.end, CycleEnd::Slept(Duration::from_secs(360)));
        teardown_before_sleep(&events);
    }

    #[test]
    fn association_timeout_can_fail_stop() {
        let mut config = config();
        config.association.on_timeout = TimeoutAction::FailStop;
        let rig = Rig::new(config)
            .sensors([(22.5, 48.0), (21.0, 50.2)])
            .radio_never_connects();
        let (mut controller, log) = rig.build();

        let report = controller.run_cycle();
        let events = log.borrow();

        assert_eq!(
            report.end,
            CycleEnd::Halted(HaltReason::AccessPointUnreachable)
        );
        assert_eq!(events.last(), Some(&Event::Halt));
        assert!(!events.iter().any(|e| matches!(e, Event::DeepSleep(_))));
    }

    #[test]
    fn radio_driver_error_skips_cycle_even_when_fail_stop() {
        let mut config = config();
        config.association.on_timeout = TimeoutAction::FailStop;
        let rig = Rig::new(config)
            .sensors([(22.5, 48.0), (21.0, 50.2)])
            .radio_fails();
        let (mut controller, log) = rig.build();

        let report = controller.run_cycle();
        let events = log.borrow();

        assert!(!report.outcome.connected);
        assert_eq!(report.end, CycleEnd::Slept(Duration::from_secs(360)));
        assert!(!events.contains(&Event::Halt));
        assert!(!events.iter().any(|e| matches!(e, Event::SensorInit(_))));
        teardown_before_sleep(&events);
        assert_eq!(controller.state(), CycleState::Sleeping);
    }

    #[test]
    fn failed_publish_is_not_retried() {
        let rig = Rig::new(config())
            .sensors([(22.5, 48.0), (21.0, 50.2)])
            .publish_fails();
        let (mut controller, log) = rig.build();

        let report = controller.run_cycle();
        let events = log.borrow();

        assert_eq!(publishes(&events).len(), 4);
        assert_eq!(report.outcome.publish_results, [Some(false); 4]);
        teardown_before_sleep(&events);
    }

    #[test]
    fn zero_sleep_duration_is_clamped() {
        let mut config = config();
        config.sleep_duration_minutes = 0;
        let (mut controller, log) = Rig::new(config).sensors([(22.5, 48.0), (21.0, 50.2)]).build();

        let report = controller.run_cycle();

        assert_eq!(report.end, CycleEnd::Slept(Duration::from_secs(60)));
        assert!(log
            .borrow()
            .contains(&Event::DeepSleep(Duration::from_secs(60))));
    }

    #[test]
    fn held_switch_skips_provisioning() {
        let mut config = config();
        config.override_mode = OverrideMode::SkipProvisioning;
        config.provisioning_enabled = true;
        let rig = Rig::new(config)
            .sensors([(22.5, 48.0), (21.0, 50.2)])
            .override_held_for(1)
            .provisioned(PersistedConfig {
                deepsleep_duration: Some("15".to_string()),
                ..Default::default()
            });
        let (mut controller, log) = rig.build();

        let report = controller.run_cycle();
        let events = log.borrow();

        assert!(!events.contains(&Event::Provision));
        assert_eq!(count(&events, |e| *e == Event::SwitchRead), 1);
        assert_eq!(report.end, CycleEnd::Slept(Duration::from_secs(360)));
    }

    #[test]
    fn provisioned_configuration_is_used_and_saved() {
        let mut config = config();
        config.override_mode = OverrideMode::SkipProvisioning;
        config.provisioning_enabled = true;
        let rig = Rig::new(config)
            .sensors([(22.5, 48.0), (21.0, 50.2)])
            .provisioned(PersistedConfig {
                mqtt_user: Some("bob".to_string()),
                deepsleep_duration: Some("15".to_string()),
                ..Default::default()
            });
        let store = rig.store();
        let (mut controller, log) = rig.build();

        let report = controller.run_cycle();
        let events = log.borrow();

        assert!(events.contains(&Event::Provision));
        assert_eq!(publishes(&events)[0].0, "bob/feeds/box1-t1");
        assert_eq!(report.end, CycleEnd::Slept(Duration::from_secs(15 * 60)));
        assert_eq!(controller.config().sleep_duration_minutes, 15);

        let saved = store.borrow().document().map(str::to_owned).unwrap();
        let saved = PersistedConfig::from_json(&saved).unwrap();
        assert_eq!(saved.deepsleep_duration.as_deref(), Some("15"));
        assert_eq!(saved.mqtt_user.as_deref(), Some("bob"));
    }

    #[test]
    fn rejected_provisioning_keeps_configuration() {
        let mut config = config();
        config.override_mode = OverrideMode::Disabled;
        config.provisioning_enabled = true;
        let rig = Rig::new(config.clone())
            .sensors([(22.5, 48.0), (21.0, 50.2)])
            .provisioned(PersistedConfig {
                mqtt_port: Some("not-a-port".to_string()),
                ..Default::default()
            });
        let store = rig.store();
        let (mut controller, _log) = rig.build();

        controller.run_cycle();

        assert_eq!(controller.config(), &config);
        assert!(store.borrow().document().is_none());
    }

    #[test]
    fn broker_is_configured_every_cycle() {
        let (mut controller, log) = Rig::new(config())
            .sensors([(22.5, 48.0), (21.0, 50.2)])
            .build();

        controller.run_cycle();
        controller.run_cycle();

        assert_eq!(
            count(&log.borrow(), |e| *e
                == Event::BrokerConfigured("mqtt://io.adafruit.com:1883".to_string())),
            2
        );
    }
}
