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
use crate::errors::{ConfigError, TelemetryError};
use crate::global_settings::{MQTT_CONNECT_ATTEMPTS, MQTT_MAX_TOPIC_LEN, MQTT_RETRY_DELAY_MS};
use core::fmt::{self, Write};
use embedded_hal::delay::DelayNs;
use log::*;

pub type Topic = heapless::String<MQTT_MAX_TOPIC_LEN>;
pub type Payload = heapless::String<16>;

pub const FEED_POSTFIX_TEMPERATURE: &str = "t";
pub const FEED_POSTFIX_HUMIDITY: &str = "hr";

/// Outcome of a broker connect, modelled on the MQTT CONNACK return codes
/// plus the two ways a connect can fail before a CONNACK arrives.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectStatus {
    Accepted,
    UnacceptableProtocol,
    IdentifierRejected,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
    TransportFailed,
    Timeout,
}

impl ConnectStatus {
    pub fn code(&self) -> i8 {
        match self {
            Self::Accepted => 0,
            Self::UnacceptableProtocol => 1,
            Self::IdentifierRejected => 2,
            Self::ServerUnavailable => 3,
            Self::BadCredentials => 4,
            Self::NotAuthorized => 5,
            Self::TransportFailed => -1,
            Self::Timeout => -2,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

impl fmt::Display for ConnectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "Connected"),
            Self::UnacceptableProtocol => write!(f, "The Server does not support the level of the MQTT protocol requested"),
            Self::IdentifierRejected => write!(f, "The Client identifier is correct UTF-8 but not allowed by the Server"),
            Self::ServerUnavailable => write!(f, "The MQTT service is unavailable"),
            Self::BadCredentials => write!(f, "The data in the user name or password is malformed"),
            Self::NotAuthorized => write!(f, "Not authorized to connect"),
            Self::TransportFailed => write!(f, "Connection failed"),
            Self::Timeout => write!(f, "Connection timed out"),
        }
    }
}

/// Pub/sub client as seen by the duty cycle. Every call blocks until the
/// client library reports a result.
pub trait BrokerClient {
    /// Picks up endpoint and credentials before the next connect.
    fn configure(&mut self, _config: &Configuration) {}

    fn connect(&mut self) -> ConnectStatus;

    fn connected(&mut self) -> bool;

    fn disconnect(&mut self);

    /// Sends an already formatted payload.
    fn publish(&mut self, topic: &str, payload: &str) -> bool;
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Broker session with a bounded connect retry and single-shot publishes.
pub struct TelemetryChannel<B> {
    client: B,
    state: SessionState,
}

impl<B: BrokerClient> TelemetryChannel<B> {
    pub fn new(client: B) -> Self {
        TelemetryChannel {
            client,
            state: SessionState::Disconnected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client(&self) -> &B {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut B {
        &mut self.client
    }

    // The caller decides what an exhausted budget means; the duty cycle
    // treats it as fail-stop.
    pub fn ensure_connected<D: DelayNs>(&mut self, delay: &mut D) -> Result<(), TelemetryError> {
        if self.state == SessionState::Connected && self.client.connected() {
            return Ok(());
        }

        info!("Connecting to MQTT...");
        self.state = SessionState::Connecting;

        let mut attempt = 0;
        loop {
            attempt += 1;

            let status = self.client.connect();
            if status.is_accepted() {
                info!("MQTT Connected!");
                self.state = SessionState::Connected;
                return Ok(());
            }

            warn!(
                "MQTT connect attempt {}/{} failed: {} ({})",
                attempt,
                MQTT_CONNECT_ATTEMPTS,
                status,
                status.code()
            );
            self.client.disconnect();

            if attempt >= MQTT_CONNECT_ATTEMPTS {
                self.state = SessionState::Disconnected;
                return Err(TelemetryError::RetriesExhausted {
                    attempts: attempt,
                    last: status,
                });
            }

            info!(
                "Retrying MQTT connection in {} seconds...",
                MQTT_RETRY_DELAY_MS / 1000
            );
            delay.delay_ms(MQTT_RETRY_DELAY_MS);
        }
    }

    /// One publish attempt; a failure is logged and not retried.
    pub fn publish(&mut self, label: &str, topic: &str, value: f32) -> bool {
        if self.state != SessionState::Connected {
            warn!("Client not connected, skipping publish of {label} to {topic}");
            return false;
        }

        let Some(payload) = payload(value) else {
            warn!("Failed to publish {label}: {value} does not fit a feed payload");
            return false;
        };

        let published = self.client.publish(topic, &payload);
        if published {
            info!("{label} published!");
        } else {
            warn!("Failed to publish {label}");
        }
        published
    }

    pub fn disconnect(&mut self) {
        self.client.disconnect();
        self.state = SessionState::Disconnected;
    }
}

pub fn feed_topic(user: &str, prefix: &str, postfix: &str) -> Result<Topic, ConfigError> {
    let mut topic = Topic::new();
    write!(topic, "{user}/feeds/{prefix}-{postfix}")
        .map_err(|_| ConfigError::TopicTooLong(format!("{user}/feeds/{prefix}-{postfix}")))?;
    Ok(topic)
}

/// Scalar payload with two decimals, the format the feeds expect. `None`
/// for values that are not finite or do not fit the payload buffer.
pub fn payload(value: f32) -> Option<Payload> {
    if !value.is_finite() {
        return None;
    }
    let mut s = Payload::new();
    write!(s, "{value:.2}").ok()?;
    Some(s)
}
