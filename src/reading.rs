use crate::telemetry::Topic;
use core::fmt;
use log::*;

/// Temperature/humidity sensor as seen by the duty cycle.
///
/// Both reads report a failed measurement (timeout, checksum, wiring) as
/// `f32::NAN` rather than as an error; [`sample`] turns that, or any other
/// non-finite value, into an invalid [`Reading`].
pub trait Sensor {
    fn init(&mut self);

    fn read_humidity(&mut self) -> f32;

    fn read_temperature(&mut self) -> f32;
}

/// One sensor sample.
///
/// An invalid reading never hands out its values, so NaN cannot travel
/// further than this type.
#[derive(Copy, Clone, Debug)]
pub struct Reading {
    temperature_c: f32,
    humidity_pct: f32,
    valid: bool,
}

impl Reading {
    pub fn new(temperature_c: f32, humidity_pct: f32) -> Self {
        Reading {
            temperature_c,
            humidity_pct,
            valid: temperature_c.is_finite() && humidity_pct.is_finite(),
        }
    }

    pub fn invalid() -> Self {
        Self::new(f32::NAN, f32::NAN)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn temperature_c(&self) -> Option<f32> {
        self.valid.then_some(self.temperature_c)
    }

    pub fn humidity_pct(&self) -> Option<f32> {
        self.valid.then_some(self.humidity_pct)
    }
}

impl Default for Reading {
    fn default() -> Self {
        Self::invalid()
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid {
            write!(
                f,
                "Humidity: {:.2}%  Temperature: {:.2}°C",
                self.humidity_pct, self.temperature_c
            )
        } else {
            write!(
                f,
                "no valid reading (humidity {}, temperature {})",
                self.humidity_pct, self.temperature_c
            )
        }
    }
}

/// Takes exactly one humidity and one temperature measurement.
pub fn sample<S: Sensor>(sensor: &mut S) -> Reading {
    sensor.init();
    let humidity = sensor.read_humidity();
    let temperature = sensor.read_temperature();

    Reading::new(temperature, humidity)
}

/// A sensor together with the two feeds its values are published to.
pub struct SensorChannel<S> {
    id: u8,
    sensor: S,
    reading: Reading,
    topic_temperature: Topic,
    topic_humidity: Topic,
}

impl<S: Sensor> SensorChannel<S> {
    pub fn new(id: u8, sensor: S) -> Self {
        SensorChannel {
            id,
            sensor,
            reading: Reading::invalid(),
            topic_temperature: Topic::new(),
            topic_humidity: Topic::new(),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn reading(&self) -> Reading {
        self.reading
    }

    pub fn topic_temperature(&self) -> &str {
        &self.topic_temperature
    }

    pub fn topic_humidity(&self) -> &str {
        &self.topic_humidity
    }

    pub fn set_topics(&mut self, temperature: Topic, humidity: Topic) {
        self.topic_temperature = temperature;
        self.topic_humidity = humidity;
    }

    pub fn sample(&mut self) -> Reading {
        self.reading = sample(&mut self.sensor);
        if self.reading.is_valid() {
            info!("Sensor {}: {}", self.id, self.reading);
        } else {
            warn!("Sensor {}: {}", self.id, self.reading);
        }
        self.reading
    }
}
