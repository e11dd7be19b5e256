//! Ultrasonic presence sensing.
//!
//! Each sensor is pinged once per tick. The echo width is turned into a
//! presence flag: a width below the threshold means somebody is on the
//! stairs, a zero width or a missing echo means nobody is.

use embedded_hal::{
    delay::DelayNs,
    digital::{InputPin, OutputPin},
};
use log::warn;
use serde::Serialize;

/// Round-trip time of sound per centimetre of range, in microseconds.
pub const US_PER_CM: u32 = 58;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ping {
    /// Echo pulse width in microseconds.
    Echo(u32),
    /// No echo before the deadline.
    Timeout,
}

impl Ping {
    pub fn distance_cm(self) -> Option<u32> {
        match self {
            Self::Echo(width) if width > 0 => Some(width / US_PER_CM),
            _ => None,
        }
    }
}

pub trait RangingSensor {
    /// Fires one trigger pulse and measures the echo, waiting at most
    /// `timeout_us` for each edge.
    fn ping(&mut self, timeout_us: u32) -> Ping;
}

/// Free-running microsecond counter used to time echo edges.
pub trait MicrosClock {
    fn now_us(&mut self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SensorReading {
    #[serde(rename = "lowerDetected")]
    pub lower_detected: bool,
    #[serde(rename = "upperDetected")]
    pub upper_detected: bool,
}

impl SensorReading {
    pub fn any(self) -> bool {
        self.lower_detected || self.upper_detected
    }
}

/// HC-SR04 style trigger/echo driver.
pub struct Ultrasonic<T, E, D, C> {
    trigger: T,
    echo: E,
    delay: D,
    clock: C,
}

impl<T, E, D, C> Ultrasonic<T, E, D, C>
where
    T: OutputPin,
    E: InputPin,
    D: DelayNs,
    C: MicrosClock,
{
    pub fn new(trigger: T, echo: E, delay: D, clock: C) -> Self {
        Self {
            trigger,
            echo,
            delay,
            clock,
        }
    }

    fn pulse_trigger(&mut self) -> bool {
        if self.trigger.set_low().is_err() {
            return false;
        }
        self.delay.delay_us(2);
        if self.trigger.set_high().is_err() {
            return false;
        }
        self.delay.delay_us(10);
        self.trigger.set_low().is_ok()
    }

    /// Spins until the echo line reads `level` or the deadline passes.
    /// Returns the timestamp of the edge.
    fn wait_for(&mut self, level: bool, deadline_us: u64) -> Option<u64> {
        loop {
            let now = self.clock.now_us();
            match self.echo.is_high() {
                Ok(high) if high == level => return Some(now),
                Ok(_) => {}
                Err(_) => return None,
            }
            if now >= deadline_us {
                return None;
            }
        }
    }
}

impl<T, E, D, C> RangingSensor for Ultrasonic<T, E, D, C>
where
    T: OutputPin,
    E: InputPin,
    D: DelayNs,
    C: MicrosClock,
{
    fn ping(&mut self, timeout_us: u32) -> Ping {
        if !self.pulse_trigger() {
            warn!("ultrasonic trigger pin write failed");
            return Ping::Timeout;
        }

        let armed = self.clock.now_us();
        let Some(rise) = self.wait_for(true, armed + u64::from(timeout_us)) else {
            return Ping::Timeout;
        };
        let Some(fall) = self.wait_for(false, rise + u64::from(timeout_us)) else {
            return Ping::Timeout;
        };

        Ping::Echo(u32::try_from(fall - rise).unwrap_or(u32::MAX))
    }
}

pub struct RangeSampler<L, U> {
    lower: L,
    upper: U,
    threshold_us: u32,
    timeout_us: u32,
}

impl<L: RangingSensor, U: RangingSensor> RangeSampler<L, U> {
    pub fn new(lower: L, upper: U, threshold_us: u32, timeout_ms: u32) -> Self {
        Self {
            lower,
            upper,
            threshold_us,
            timeout_us: timeout_ms.saturating_mul(1_000),
        }
    }

    pub fn sample(&mut self) -> SensorReading {
        let lower = self.lower.ping(self.timeout_us);
        let upper = self.upper.ping(self.timeout_us);
        SensorReading {
            lower_detected: is_present(lower, self.threshold_us),
            upper_detected: is_present(upper, self.threshold_us),
        }
    }
}

/// A zero width is an ambiguous reading and never counts as presence.
pub fn is_present(ping: Ping, threshold_us: u32) -> bool {
    matches!(ping, Ping::Echo(width) if width > 0 && width < threshold_us)
}
