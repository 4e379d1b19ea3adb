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
pub mod wifi {
    use crate::connectivity::Radio;
    use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
    use esp_idf_svc::wifi::EspWifi;
    use esp_idf_sys::*;
    use std::cell::RefCell;
    use std::net::Ipv4Addr;
    use std::rc::Rc;

    /// Station side of the shared wifi driver.
    pub struct EspRadio {
        wifi: Rc<RefCell<EspWifi<'static>>>,
    }

    impl EspRadio {
        pub fn new(wifi: Rc<RefCell<EspWifi<'static>>>) -> Self {
            EspRadio { wifi }
        }
    }

    impl Radio for EspRadio {
        type Error = anyhow::Error;

        fn set_persistent(&mut self, persistent: bool) -> Result<(), Self::Error> {
            let storage = if persistent {
                wifi_storage_t_WIFI_STORAGE_FLASH
            } else {
                wifi_storage_t_WIFI_STORAGE_RAM
            };
            esp!(unsafe { esp_wifi_set_storage(storage) })?;
            Ok(())
        }

        fn wake(&mut self) -> Result<(), Self::Error> {
            esp!(unsafe { esp_wifi_set_ps(wifi_ps_type_t_WIFI_PS_NONE) })?;
            Ok(())
        }

        fn set_station_mode(&mut self) -> Result<(), Self::Error> {
            self.wifi
                .borrow_mut()
                .set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
            Ok(())
        }

        fn begin(&mut self, ssid: &str, password: &str) -> Result<(), Self::Error> {
            let mut wifi = self.wifi.borrow_mut();

            wifi.set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("SSID {ssid} too long"))?,
                password: password
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("WiFi password too long"))?,
                auth_method: if password.is_empty() {
                    AuthMethod::None
                } else {
                    AuthMethod::WPA2Personal
                },
                ..Default::default()
            }))?;

            wifi.start()?;
            wifi.connect()?;
            Ok(())
        }

        fn is_connected(&mut self) -> bool {
            self.wifi.borrow().is_up().unwrap_or(false)
        }

        fn local_ip(&mut self) -> Option<Ipv4Addr> {
            self.wifi
                .borrow()
                .sta_netif()
                .get_ip_info()
                .ok()
                .map(|info| info.ip)
        }

        fn disconnect(&mut self) -> Result<(), Self::Error> {
            let mut wifi = self.wifi.borrow_mut();
            if wifi.is_connected()? {
                wifi.disconnect()?;
            }
            Ok(())
        }

        fn power_off(&mut self) -> Result<(), Self::Error> {
            self.wifi.borrow_mut().stop()?;
            Ok(())
        }

        fn force_sleep(&mut self) -> Result<(), Self::Error> {
            esp!(unsafe { esp_wifi_set_ps(wifi_ps_type_t_WIFI_PS_MAX_MODEM) })?;
            Ok(())
        }
    }
}

pub mod mqtt {
    use crate::configuration::Configuration;
    use crate::global_settings::MQTT_CONNECT_TIMEOUT_MS;
    use crate::telemetry::{BrokerClient, ConnectStatus};
    use embedded_svc::mqtt::client::QoS;
    use esp_idf_hal::delay::FreeRtos;
    use esp_idf_svc::mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration};
    use log::*;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;

    const LINK_PENDING: u8 = 0;
    const LINK_UP: u8 = 1;
    const LINK_DOWN: u8 = 2;

    const CONNECT_POLL_MS: u32 = 100;

    /// Blocking facade over the event driven ESP-IDF client.
    pub struct EspBroker {
        url: String,
        client_id: String,
        user: String,
        key: String,
        link: Arc<AtomicU8>,
        client: Option<EspMqttClient<'static>>,
    }

    impl EspBroker {
        pub fn new() -> Self {
            EspBroker {
                url: String::new(),
                client_id: String::new(),
                user: String::new(),
                key: String::new(),
                link: Arc::new(AtomicU8::new(LINK_DOWN)),
                client: None,
            }
        }
    }

    impl Default for EspBroker {
        fn default() -> Self {
            Self::new()
        }
    }

    impl BrokerClient for EspBroker {
        fn configure(&mut self, config: &Configuration) {
            self.url = config.broker_url();
            self.client_id = format!("climate-node-{}", config.feed_prefix);
            self.user = config.broker_user.clone();
            self.key = config.broker_key.clone();
        }

        fn connect(&mut self) -> ConnectStatus {
            info!("url = {}", self.url);
            self.link.store(LINK_PENDING, Ordering::SeqCst);

            let link = self.link.clone();
            let client = EspMqttClient::new_cb(
                &self.url,
                &MqttClientConfiguration {
                    client_id: Some(&self.client_id),
                    username: (!self.user.is_empty()).then_some(self.user.as_str()),
                    password: (!self.key.is_empty()).then_some(self.key.as_str()),
                    ..Default::default()
                },
                move |event| match event.payload() {
                    EventPayload::Connected(_) => link.store(LINK_UP, Ordering::SeqCst),
                    EventPayload::Disconnected => link.store(LINK_DOWN, Ordering::SeqCst),
                    EventPayload::Error(err) => {
                        warn!("MQTT error: {err:?}");
                        link.store(LINK_DOWN, Ordering::SeqCst);
                    }
                    _ => {}
                },
            );

            match client {
                Ok(client) => self.client = Some(client),
                Err(err) => {
                    error!("Creating MQTT client failed: {err}");
                    return ConnectStatus::TransportFailed;
                }
            }

            let mut waited = 0;
            while waited < MQTT_CONNECT_TIMEOUT_MS {
                match self.link.load(Ordering::SeqCst) {
                    LINK_UP => return ConnectStatus::Accepted,
                    LINK_DOWN => return ConnectStatus::TransportFailed,
                    _ => {}
                }
                FreeRtos::delay_ms(CONNECT_POLL_MS);
                waited += CONNECT_POLL_MS;
            }

            ConnectStatus::Timeout
        }

        fn connected(&mut self) -> bool {
            self.client.is_some() && self.link.load(Ordering::SeqCst) == LINK_UP
        }

        // dropping the client stops its task and closes the socket
        fn disconnect(&mut self) {
            self.client = None;
            self.link.store(LINK_DOWN, Ordering::SeqCst);
        }

        fn publish(&mut self, topic: &str, payload: &str) -> bool {
            let Some(client) = self.client.as_mut() else {
                return false;
            };

            match client.publish(topic, QoS::AtMostOnce, false, payload.as_bytes()) {
                Ok(_) => true,
                Err(err) => {
                    warn!("Publishing to {topic} failed: {err}");
                    false
                }
            }
        }
    }
}

pub mod power {
    use crate::global_settings::WATCHDOG_TIMEOUT_SECS;
    use crate::power::PowerControl;
    use core::time::Duration;
    use esp_idf_hal::delay::FreeRtos;
    use esp_idf_sys::*;
    use log::*;

    pub struct EspPower {
        watchdog_armed: bool,
    }

    impl EspPower {
        pub fn new() -> Self {
            EspPower {
                watchdog_armed: false,
            }
        }
    }

    impl Default for EspPower {
        fn default() -> Self {
            Self::new()
        }
    }

    impl PowerControl for EspPower {
        fn arm_watchdog(&mut self) {
            if self.watchdog_armed {
                return;
            }

            let config = esp_task_wdt_config_t {
                timeout_ms: WATCHDOG_TIMEOUT_SECS * 1000,
                idle_core_mask: 0,
                trigger_panic: true,
            };

            // the IDF may already have started the watchdog from sdkconfig
            let rc = match unsafe { esp_task_wdt_init(&config) } {
                ESP_ERR_INVALID_STATE => unsafe { esp_task_wdt_reconfigure(&config) },
                rc => rc,
            };
            if let Err(err) = esp!(rc) {
                error!("Watchdog setup failed: {err}");
                return;
            }

            match unsafe { esp_task_wdt_add(core::ptr::null_mut()) } {
                ESP_OK | ESP_ERR_INVALID_ARG => self.watchdog_armed = true,
                rc => error!("Subscribing to the watchdog failed: {rc}"),
            }
        }

        fn feed_watchdog(&mut self) {
            if self.watchdog_armed {
                unsafe { esp_task_wdt_reset() };
            }
        }

        fn settle(&mut self) {
            FreeRtos::delay_ms(1);
        }

        fn enter_deep_sleep(&mut self, duration: Duration) {
            let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
            unsafe { esp_deep_sleep(us) };
        }

        // Never feeds, the task watchdog resets the chip.
        fn halt(&mut self) {
            loop {
                FreeRtos::delay_ms(1000);
            }
        }
    }
}

pub mod nvs {
    use crate::configuration::ConfigStore;
    use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};

    const NVS_NAMESPACE: &str = "climate";
    const NVS_CONFIG_KEY: &str = "config";
    const MAX_DOCUMENT_LEN: usize = 1024;

    pub struct NvsConfigStore {
        nvs: EspNvs<NvsDefault>,
    }

    impl NvsConfigStore {
        pub fn new(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
            Ok(NvsConfigStore {
                nvs: EspNvs::new(partition, NVS_NAMESPACE, true)?,
            })
        }
    }

    impl ConfigStore for NvsConfigStore {
        fn load(&mut self) -> anyhow::Result<Option<String>> {
            let mut buffer = vec![0_u8; MAX_DOCUMENT_LEN];
            Ok(self
                .nvs
                .get_str(NVS_CONFIG_KEY, &mut buffer)?
                .map(str::to_owned))
        }

        fn save(&mut self, document: &str) -> anyhow::Result<()> {
            if document.len() >= MAX_DOCUMENT_LEN {
                anyhow::bail!("configuration document of {} bytes too large", document.len());
            }
            self.nvs.set_str(NVS_CONFIG_KEY, document)?;
            Ok(())
        }
    }
}

pub mod httpd {
    use crate::configuration::{Configuration as NodeConfiguration, PersistedConfig};
    use crate::global_settings::PROVISIONING_WINDOW_SECS;
    use crate::provisioning::{review_submission, Provisioner};
    use embedded_hal::delay::DelayNs;
    use embedded_svc::http::Method;
    use embedded_svc::io::{Read, Write};
    use embedded_svc::wifi::{AccessPointConfiguration, AuthMethod, Configuration};
    use esp_idf_svc::http::server::{Configuration as HttpConfiguration, EspHttpServer};
    use esp_idf_svc::wifi::EspWifi;
    use log::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};

    const PORTAL_SSID: &str = "climate-node-setup";
    const MAX_BODY_LEN: usize = 1024;
    const POLL_MS: u32 = 1000;

    const PORTAL_HTML: &str = r#"<!DOCTYPE html>
<html><head><meta name="viewport" content="width=device-width">
<title>Climate node setup</title></head><body>
<h1>Climate node setup</h1>
<form id="f">
<p>WiFi SSID <input name="wifi_ssid"></p>
<p>WiFi password <input name="wifi_password" type="password"></p>
<p>MQTT server <input name="mqtt_server"></p>
<p>MQTT port <input name="mqtt_port" value="1883"></p>
<p>MQTT user <input name="mqtt_user"></p>
<p>MQTT key <input name="blynk_token"></p>
<p>Deep sleep (minutes) <input name="deepsleep_duration" value="6"></p>
<button>Save</button>
</form>
<script>
document.getElementById('f').onsubmit = async (e) => {
  e.preventDefault();
  const doc = Object.fromEntries(new FormData(e.target));
  const r = await fetch('/config', {method: 'POST', body: JSON.stringify(doc)});
  document.body.innerText = await r.text();
};
</script></body></html>"#;

    /// Captive setup portal, offered only while nothing is stored yet.
    pub struct PortalProvisioner {
        wifi: Rc<RefCell<EspWifi<'static>>>,
        first_run: bool,
    }

    impl PortalProvisioner {
        pub fn new(wifi: Rc<RefCell<EspWifi<'static>>>, first_run: bool) -> Self {
            PortalProvisioner { wifi, first_run }
        }

        fn serve(
            &self,
            current: &NodeConfiguration,
            delay: &mut dyn DelayNs,
        ) -> anyhow::Result<Option<PersistedConfig>> {
            {
                let mut wifi = self.wifi.borrow_mut();
                wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                    ssid: PORTAL_SSID
                        .try_into()
                        .map_err(|_| anyhow::anyhow!("portal SSID too long"))?,
                    auth_method: AuthMethod::None,
                    ..Default::default()
                }))?;
                wifi.start()?;
            }
            info!("Setup portal open on {PORTAL_SSID} for {PROVISIONING_WINDOW_SECS} s");

            let submitted = Arc::new(Mutex::new(None));
            let mut server = EspHttpServer::new(&HttpConfiguration::default())?;

            server.fn_handler::<anyhow::Error, _>("/", Method::Get, |req| {
                req.into_ok_response()?.write_all(PORTAL_HTML.as_bytes())?;
                Ok(())
            })?;

            {
                let submitted = submitted.clone();
                let current = current.clone();
                server.fn_handler::<anyhow::Error, _>("/config", Method::Post, move |mut req| {
                    let mut body = vec![0_u8; MAX_BODY_LEN];
                    let mut len = 0;
                    while len < body.len() {
                        let read = req.read(&mut body[len..])?;
                        if read == 0 {
                            break;
                        }
                        len += read;
                    }

                    let doc = match review_submission(&current, &body[..len]) {
                        Ok(doc) => doc,
                        Err(err) => {
                            warn!("Rejected portal submission: {err}");
                            req.into_response(400, Some("Bad Request"), &[])?
                                .write_all(format!("Not saved: {err}").as_bytes())?;
                            return Ok(());
                        }
                    };
                    if let Ok(mut submitted) = submitted.lock() {
                        *submitted = Some(doc);
                    }

                    req.into_ok_response()?
                        .write_all(b"Saved, the node continues its cycle.")?;
                    Ok(())
                })?;
            }

            let mut waited = 0;
            let doc = loop {
                if let Some(doc) = submitted.lock().ok().and_then(|mut s| s.take()) {
                    break Some(doc);
                }
                if waited >= PROVISIONING_WINDOW_SECS * 1000 {
                    info!("Setup portal timed out");
                    break None;
                }
                delay.delay_ms(POLL_MS);
                waited += POLL_MS;
            };

            drop(server);
            self.wifi.borrow_mut().stop()?;

            Ok(doc)
        }
    }

    impl Provisioner for PortalProvisioner {
        fn provision(
            &mut self,
            current: &NodeConfiguration,
            delay: &mut dyn DelayNs,
        ) -> anyhow::Result<Option<PersistedConfig>> {
            if !self.first_run {
                return Ok(None);
            }
            self.first_run = false;
            self.serve(current, delay)
        }
    }
}
