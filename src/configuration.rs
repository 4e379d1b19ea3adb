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
use crate::errors::ConfigError;
use crate::global_settings::*;
use crate::telemetry::{feed_topic, Topic, FEED_POSTFIX_HUMIDITY, FEED_POSTFIX_TEMPERATURE};
use core::str::FromStr;
use core::time::Duration;
use log::*;
use serde::{Deserialize, Serialize};

// Compiled-in defaults, taken from cfg.toml at build time
#[toml_cfg::toml_config]
pub struct Config {
    #[default("")]
    wifi_ssid: &'static str,
    #[default("")]
    wifi_psk: &'static str,
    #[default("io.adafruit.com")]
    mqtt_host: &'static str,
    #[default(1883)]
    mqtt_port: u16,
    #[default("")]
    mqtt_user: &'static str,
    #[default("")]
    mqtt_key: &'static str,
    #[default("box1")]
    feed_prefix: &'static str,
    #[default(6)]
    sleep_minutes: u32,
    #[default("hold-awake")]
    override_mode: &'static str,
    #[default(false)]
    provisioning: bool,
    #[default(30)]
    wifi_timeout_secs: u64,
    #[default("skip-cycle")]
    wifi_timeout_action: &'static str,
}

/// What the override switch means for this build.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum OverrideMode {
    Disabled,
    /// Held switch keeps the node awake and polling.
    HoldAwake,
    /// Held switch skips the provisioning step for one cycle.
    SkipProvisioning,
}

impl FromStr for OverrideMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "hold-awake" => Ok(Self::HoldAwake),
            "skip-provisioning" => Ok(Self::SkipProvisioning),
            _ => Err(ConfigError::InvalidOverrideMode(s.to_string())),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TimeoutAction {
    /// Tear the radio down and sleep until the next cycle.
    SkipCycle,
    /// Halt and wait for the watchdog.
    FailStop,
}

impl FromStr for TimeoutAction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip-cycle" => Ok(Self::SkipCycle),
            "fail-stop" => Ok(Self::FailStop),
            _ => Err(ConfigError::InvalidTimeoutAction(s.to_string())),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct AssociationPolicy {
    /// `None` waits for the access point forever.
    pub timeout: Option<Duration>,
    pub on_timeout: TimeoutAction,
}

impl Default for AssociationPolicy {
    fn default() -> Self {
        AssociationPolicy {
            timeout: Some(Duration::from_secs(WIFI_ASSOCIATION_TIMEOUT_SECS)),
            on_timeout: TimeoutAction::SkipCycle,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Configuration {
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub broker_host: String,
    pub broker_port: u16,
    pub broker_user: String,
    pub broker_key: String,
    pub feed_prefix: String,
    pub sleep_duration_minutes: u32,
    pub override_mode: OverrideMode,
    pub provisioning_enabled: bool,
    pub association: AssociationPolicy,
}

impl Configuration {
    pub fn compiled_defaults() -> Self {
        let override_mode = CONFIG.override_mode.parse().unwrap_or_else(|err| {
            warn!("{err}, falling back to hold-awake");
            OverrideMode::HoldAwake
        });
        let on_timeout = CONFIG.wifi_timeout_action.parse().unwrap_or_else(|err| {
            warn!("{err}, falling back to skip-cycle");
            TimeoutAction::SkipCycle
        });

        Configuration {
            wifi_ssid: CONFIG.wifi_ssid.to_string(),
            wifi_password: CONFIG.wifi_psk.to_string(),
            broker_host: CONFIG.mqtt_host.to_string(),
            broker_port: CONFIG.mqtt_port,
            broker_user: CONFIG.mqtt_user.to_string(),
            broker_key: CONFIG.mqtt_key.to_string(),
            feed_prefix: CONFIG.feed_prefix.to_string(),
            sleep_duration_minutes: clamp_sleep_minutes(CONFIG.sleep_minutes),
            override_mode,
            provisioning_enabled: CONFIG.provisioning,
            association: AssociationPolicy {
                timeout: match CONFIG.wifi_timeout_secs {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
                on_timeout,
            },
        }
    }

    /// Compiled defaults overlaid with the stored document. Never fails: a
    /// missing or unusable document leaves the compiled defaults in place.
    pub fn load(store: &mut dyn ConfigStore) -> Self {
        let mut config = Self::compiled_defaults();

        let document = match store.load() {
            Ok(Some(document)) => document,
            Ok(None) => {
                info!("No stored configuration, using compiled defaults");
                return config;
            }
            Err(err) => {
                warn!("Reading stored configuration failed: {err:#}, using compiled defaults");
                return config;
            }
        };

        match PersistedConfig::from_json(&document).and_then(|doc| config.merged(&doc)) {
            Ok(merged) => {
                info!("Loaded stored configuration");
                config = merged;
            }
            Err(err) => warn!("{err}, using compiled defaults"),
        }

        config
    }

    /// Returns a copy with every field present in `doc` applied. The
    /// document is validated as a whole; one bad field rejects all of it.
    pub fn merged(&self, doc: &PersistedConfig) -> Result<Self, ConfigError> {
        let mut config = self.clone();

        if let Some(host) = present(&doc.mqtt_server) {
            config.broker_host = host.to_string();
        }
        if let Some(port) = present(&doc.mqtt_port) {
            config.broker_port = match port.trim().parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => return Err(ConfigError::InvalidPort(port.to_string())),
            };
        }
        if let Some(user) = present(&doc.mqtt_user) {
            config.broker_user = user.to_string();
        }
        if let Some(key) = present(&doc.blynk_token) {
            config.broker_key = key.to_string();
        }
        if let Some(minutes) = present(&doc.deepsleep_duration) {
            let minutes = minutes
                .trim()
                .parse::<u32>()
                .map_err(|_| ConfigError::InvalidSleepDuration(minutes.to_string()))?;
            config.sleep_duration_minutes = clamp_sleep_minutes(minutes);
        }
        if let Some(ssid) = present(&doc.wifi_ssid) {
            config.wifi_ssid = ssid.to_string();
        }
        if let Some(password) = present(&doc.wifi_password) {
            config.wifi_password = password.to_string();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for id in 1..=2 {
            self.channel_topics(id)?;
        }
        Ok(())
    }

    /// Temperature and humidity feed of sensor channel `id`.
    pub fn channel_topics(&self, id: u8) -> Result<(Topic, Topic), ConfigError> {
        let temperature = format!("{FEED_POSTFIX_TEMPERATURE}{id}");
        let humidity = format!("{FEED_POSTFIX_HUMIDITY}{id}");

        Ok((
            feed_topic(&self.broker_user, &self.feed_prefix, &temperature)?,
            feed_topic(&self.broker_user, &self.feed_prefix, &humidity)?,
        ))
    }

    pub fn to_persisted(&self) -> PersistedConfig {
        PersistedConfig {
            mqtt_server: Some(self.broker_host.clone()),
            mqtt_port: Some(self.broker_port.to_string()),
            blynk_token: Some(self.broker_key.clone()),
            deepsleep_duration: Some(self.sleep_duration_minutes.to_string()),
            mqtt_user: Some(self.broker_user.clone()),
            wifi_ssid: Some(self.wifi_ssid.clone()),
            wifi_password: Some(self.wifi_password.clone()),
        }
    }

    pub fn broker_url(&self) -> String {
        format!("mqtt://{}:{}", self.broker_host, self.broker_port)
    }

    pub fn sleep_duration(&self) -> Duration {
        crate::power::sleep_duration(self.sleep_duration_minutes)
    }
}

/// The key/value document kept in the configuration store. All values are
/// strings, an empty string counts as "not set".
#[derive(Clone, Default, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct PersistedConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blynk_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deepsleep_duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_ssid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_password: Option<String>,
}

impl PersistedConfig {
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(document)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Persistent home of the configuration document.
pub trait ConfigStore {
    fn load(&mut self) -> anyhow::Result<Option<String>>;

    fn save(&mut self, document: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryConfigStore {
    document: Option<String>,
}

impl MemoryConfigStore {
    pub fn new(document: Option<String>) -> Self {
        MemoryConfigStore { document }
    }

    pub fn document(&self) -> Option<&str> {
        self.document.as_deref()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&mut self) -> anyhow::Result<Option<String>> {
        Ok(self.document.clone())
    }

    fn save(&mut self, document: &str) -> anyhow::Result<()> {
        self.document = Some(document.to_string());
        Ok(())
    }
}

pub fn clamp_sleep_minutes(minutes: u32) -> u32 {
    let clamped = minutes.clamp(SLEEP_MINUTES_MIN, SLEEP_MINUTES_MAX);
    if clamped != minutes {
        warn!("Deep sleep duration of {minutes} min out of range, using {clamped} min");
    }
    clamped
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}
