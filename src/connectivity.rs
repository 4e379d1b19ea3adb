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
use crate::configuration::Configuration;
use crate::errors::ConnectError;
use crate::global_settings::WIFI_POLL_INTERVAL_MS;
use core::fmt::Debug;
use core::time::Duration;
use embedded_hal::delay::DelayNs;
use log::*;
use std::net::Ipv4Addr;

/// Wireless station interface.
pub trait Radio {
    type Error: Debug;

    /// Whether the driver may write credentials to flash.
    fn set_persistent(&mut self, persistent: bool) -> Result<(), Self::Error>;

    /// Leaves any low-power state left over from the previous teardown.
    fn wake(&mut self) -> Result<(), Self::Error>;

    fn set_station_mode(&mut self) -> Result<(), Self::Error>;

    /// Starts association, returns without waiting for it.
    fn begin(&mut self, ssid: &str, password: &str) -> Result<(), Self::Error>;

    fn is_connected(&mut self) -> bool;

    fn local_ip(&mut self) -> Option<Ipv4Addr>;

    /// Leaves the access point, if associated.
    fn disconnect(&mut self) -> Result<(), Self::Error>;

    fn power_off(&mut self) -> Result<(), Self::Error>;

    /// Lowest-power idle mode of the radio.
    fn force_sleep(&mut self) -> Result<(), Self::Error>;
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Session {
    pub ip: Option<Ipv4Addr>,
    pub waited: Duration,
}

pub struct ConnectivityManager<R> {
    radio: R,
}

impl<R: Radio> ConnectivityManager<R> {
    pub fn new(radio: R) -> Self {
        ConnectivityManager { radio }
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn connect<D: DelayNs>(
        &mut self,
        config: &Configuration,
        delay: &mut D,
    ) -> Result<Session, ConnectError<R::Error>> {
        info!("Connecting to {}", config.wifi_ssid);

        // keep credentials out of flash, every wake would rewrite them
        self.radio.set_persistent(false).map_err(ConnectError::Radio)?;
        self.radio.wake().map_err(ConnectError::Radio)?;
        self.radio.set_station_mode().map_err(ConnectError::Radio)?;
        self.radio
            .begin(&config.wifi_ssid, &config.wifi_password)
            .map_err(ConnectError::Radio)?;

        let poll_interval = Duration::from_millis(u64::from(WIFI_POLL_INTERVAL_MS));
        let mut waited = Duration::ZERO;

        while !self.radio.is_connected() {
            if let Some(timeout) = config.association.timeout {
                if waited >= timeout {
                    return Err(ConnectError::AssociationTimeout(waited));
                }
            }
            delay.delay_ms(WIFI_POLL_INTERVAL_MS);
            waited += poll_interval;
            debug!("Waiting for association ({} ms)", waited.as_millis());
        }

        let ip = self.radio.local_ip();
        match ip {
            Some(ip) => info!("WiFi connected - IP address: {ip}"),
            None => info!("WiFi connected - no IP address assigned yet"),
        }

        Ok(Session { ip, waited })
    }

    /// Leave the access point, radio off, then lowest-power idle. Each step
    /// runs even when an earlier one failed; errors are only logged.
    pub fn disconnect(&mut self) {
        if let Err(err) = self.radio.disconnect() {
            warn!("Leaving the access point failed: {err:?}");
        }
        if let Err(err) = self.radio.power_off() {
            warn!("Switching the radio off failed: {err:?}");
        }
        if let Err(err) = self.radio.force_sleep() {
            warn!("Forcing the radio to sleep failed: {err:?}");
        }
    }
}
