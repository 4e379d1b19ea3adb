use crate::global_settings::{SLEEP_MINUTES_MAX, SLEEP_MINUTES_MIN};
use core::time::Duration;
use embedded_hal::delay::DelayNs;

const MICROS_PER_MINUTE: u64 = 60_000_000;

/// Sleep/wake transitions and the watchdog safety net.
pub trait PowerControl {
    /// Subscribes the control loop to the watchdog. From here on every
    /// blocking wait has to feed it.
    fn arm_watchdog(&mut self);

    fn feed_watchdog(&mut self);

    /// Single yield point to let platform housekeeping run before power-down.
    fn settle(&mut self);

    /// Terminal action of a cycle. On hardware this does not return, the
    /// next cycle starts from reset.
    fn enter_deep_sleep(&mut self, duration: Duration);

    /// Fail-stop: no further work, recovery is up to the watchdog or the
    /// supervising process.
    fn halt(&mut self);
}

pub fn sleep_duration_us(minutes: u32) -> u64 {
    u64::from(minutes.clamp(SLEEP_MINUTES_MIN, SLEEP_MINUTES_MAX)) * MICROS_PER_MINUTE
}

pub fn sleep_duration(minutes: u32) -> Duration {
    Duration::from_micros(sleep_duration_us(minutes))
}

/// Delay that feeds the watchdog before every wait, so a loop that keeps
/// waiting keeps the node alive while a loop that stops waiting does not.
pub struct FeedingDelay<'a, D, P> {
    delay: &'a mut D,
    power: &'a mut P,
}

impl<'a, D: DelayNs, P: PowerControl> FeedingDelay<'a, D, P> {
    pub fn new(delay: &'a mut D, power: &'a mut P) -> Self {
        FeedingDelay { delay, power }
    }
}

impl<D: DelayNs, P: PowerControl> DelayNs for FeedingDelay<'_, D, P> {
    fn delay_ns(&mut self, ns: u32) {
        self.power.feed_watchdog();
        self.delay.delay_ns(ns);
    }

    fn delay_us(&mut self, us: u32) {
        self.power.feed_watchdog();
        self.delay.delay_us(us);
    }

    fn delay_ms(&mut self, ms: u32) {
        self.power.feed_watchdog();
        self.delay.delay_ms(ms);
    }
}
