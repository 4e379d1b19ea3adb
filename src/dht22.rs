//! Single-wire driver for the DHT22 (AM2302) temperature/humidity sensor.
//!
//! The data line is open drain with an external pull-up. The host pulls it
//! low to request a measurement, then the sensor answers with an 80 µs
//! low/high preamble followed by 40 bits. A bit is a ~50 µs low followed by
//! a high phase of ~26 µs for `0` or ~70 µs for `1`.

use crate::reading::Sensor;
use core::fmt;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{Error as _, ErrorKind, InputPin, OutputPin};
use log::*;

const FRAME_LEN: usize = 5;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DhtError {
    Timeout,
    Checksum,
    Pin(ErrorKind),
}

impl fmt::Display for DhtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "Sensor did not answer in time"),
            Self::Checksum => write!(f, "Checksum mismatch"),
            Self::Pin(kind) => write!(f, "Data pin error: {kind:?}"),
        }
    }
}

impl std::error::Error for DhtError {}

/// `(temperature °C, relative humidity %)` from a received frame.
pub fn decode_frame(frame: [u8; FRAME_LEN]) -> Result<(f32, f32), DhtError> {
    let sum = frame[..4].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != frame[4] {
        return Err(DhtError::Checksum);
    }

    let humidity = f32::from(u16::from_be_bytes([frame[0], frame[1]])) / 10.0;

    // sign-magnitude, not two's complement
    let mut temperature = f32::from(u16::from_be_bytes([frame[2] & 0x7F, frame[3]])) / 10.0;
    if frame[2] & 0x80 != 0 {
        temperature = -temperature;
    }

    Ok((temperature, humidity))
}

pub struct Dht22<P, D> {
    pin: P,
    delay: D,
    temperature: Option<f32>,
}

impl<P, D> Dht22<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    pub fn new(pin: P, delay: D) -> Self {
        Dht22 {
            pin,
            delay,
            temperature: None,
        }
    }

    pub fn read(&mut self) -> Result<(f32, f32), DhtError> {
        let frame = self.receive_frame()?;
        decode_frame(frame)
    }

    fn receive_frame(&mut self) -> Result<[u8; FRAME_LEN], DhtError> {
        let mut frame = [0u8; FRAME_LEN];

        // start signal
        self.pin.set_low().map_err(pin_error)?;
        self.delay.delay_us(3000);
        self.pin.set_high().map_err(pin_error)?;
        self.delay.delay_us(25);

        self.wait_while(true, 40)?;
        self.wait_while(false, 85)?;
        self.wait_while(true, 85)?;

        for bit in 0..FRAME_LEN * 8 {
            self.wait_while(false, 56)?;
            if self.wait_while(true, 75)? > 40 {
                frame[bit / 8] |= 0x80 >> (bit % 8);
            }
        }

        Ok(frame)
    }

    /// Microseconds the line stayed at `high`.
    fn wait_while(&mut self, high: bool, max_us: u32) -> Result<u32, DhtError> {
        let mut elapsed = 0;
        while self.pin.is_high().map_err(pin_error)? == high {
            if elapsed > max_us {
                return Err(DhtError::Timeout);
            }
            self.delay.delay_us(1);
            elapsed += 1;
        }
        Ok(elapsed)
    }
}

impl<P, D> Sensor for Dht22<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    fn init(&mut self) {
        self.temperature = None;
        // idle level, released to the pull-up
        if let Err(err) = self.pin.set_high() {
            warn!("DHT22: {}", pin_error(err));
        }
    }

    // One transaction yields both values; temperature is kept for the
    // read that follows.
    fn read_humidity(&mut self) -> f32 {
        match self.read() {
            Ok((temperature, humidity)) => {
                self.temperature = Some(temperature);
                humidity
            }
            Err(err) => {
                warn!("DHT22: {err}");
                self.temperature = None;
                f32::NAN
            }
        }
    }

    fn read_temperature(&mut self) -> f32 {
        self.temperature.take().unwrap_or(f32::NAN)
    }
}

fn pin_error<E: embedded_hal::digital::Error>(err: E) -> DhtError {
    DhtError::Pin(err.kind())
}
