use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    /// Longest echo, in microseconds, still counted as a body on the stairs.
    pub detect_threshold_us: u32,
    pub echo_timeout_ms: u32,
    pub light_hold_ms: u32,
    pub wifi_retry_ms: u32,
    pub wifi_retry_max_ms: u32,
    pub wifi_connect_timeout_ms: u32,
    pub kasa_retry_ms: u32,
    pub kasa_retry_max_ms: u32,
    pub kasa_connect_timeout_ms: u32,
    pub kasa_io_timeout_ms: u32,
    /// Bound on one host name lookup; results are cached until a connect
    /// fails.
    pub dns_timeout_ms: u32,
    pub porch_debounce_min_ms: u32,
    pub porch_debounce_max_ms: u32,
    pub porch_auto_off_ms: u32,
    pub porch_off_retry_ms: u32,
    pub keepalive_interval_ms: u32,
    pub telemetry_connect_timeout_ms: u32,
    pub telemetry_io_timeout_ms: u32,
    pub telemetry_retry_ms: u32,
    pub telemetry_retry_max_ms: u32,
    pub log_quiet_ms: u32,
    pub switch_heartbeat_ms: u32,
    pub solar_refresh_ms: u32,
    pub tick_interval_ms: u32,
    pub watchdog_timeout_ms: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            detect_threshold_us: 5_800,
            echo_timeout_ms: 25,
            light_hold_ms: 60_000,
            wifi_retry_ms: 30_000,
            wifi_retry_max_ms: 240_000,
            wifi_connect_timeout_ms: 8_000,
            kasa_retry_ms: 60_000,
            kasa_retry_max_ms: 480_000,
            kasa_connect_timeout_ms: 1_500,
            kasa_io_timeout_ms: 1_000,
            dns_timeout_ms: 2_000,
            porch_debounce_min_ms: 4_000,
            porch_debounce_max_ms: 40_000,
            porch_auto_off_ms: 300_000,
            porch_off_retry_ms: 30_000,
            keepalive_interval_ms: 30_000,
            telemetry_connect_timeout_ms: 5_000,
            telemetry_io_timeout_ms: 3_000,
            telemetry_retry_ms: 30_000,
            telemetry_retry_max_ms: 300_000,
            log_quiet_ms: 5_000,
            switch_heartbeat_ms: 300_000,
            solar_refresh_ms: 3_600_000,
            tick_interval_ms: 100,
            watchdog_timeout_ms: 30_000,
        }
    }
}

impl TimingConfig {
    /// One switch exchange: a lookup, connect, then write and read for the
    /// state query and again for the relay command.
    pub fn kasa_exchange_ms(&self) -> u32 {
        self.dns_timeout_ms
            .saturating_add(self.kasa_connect_timeout_ms)
            .saturating_add(self.kasa_io_timeout_ms.saturating_mul(4))
    }

    /// One telemetry request: a lookup, then connect and TLS handshake under
    /// the connect timeout, then sending and receiving under the I/O timeout
    /// each.
    pub fn telemetry_exchange_ms(&self) -> u32 {
        self.dns_timeout_ms
            .saturating_add(self.telemetry_connect_timeout_ms)
            .saturating_add(self.telemetry_io_timeout_ms.saturating_mul(2))
    }

    /// Upper bound of one tick when every bounded wait runs to its timeout:
    /// both echo windows, one association attempt, one porch command, then
    /// either a telemetry exchange or a switch heartbeat.
    pub fn worst_case_tick_ms(&self) -> u32 {
        self.echo_timeout_ms
            .saturating_mul(2)
            .saturating_add(self.wifi_connect_timeout_ms)
            .saturating_add(self.kasa_exchange_ms())
            .saturating_add(self.telemetry_exchange_ms().max(self.kasa_exchange_ms()))
            .saturating_add(self.tick_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("echo_timeout_ms", self.echo_timeout_ms),
            ("light_hold_ms", self.light_hold_ms),
            ("tick_interval_ms", self.tick_interval_ms),
            ("watchdog_timeout_ms", self.watchdog_timeout_ms),
            ("wifi_retry_ms", self.wifi_retry_ms),
            ("kasa_retry_ms", self.kasa_retry_ms),
            ("telemetry_retry_ms", self.telemetry_retry_ms),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { name });
        }

        if self.porch_debounce_min_ms > self.porch_debounce_max_ms {
            return Err(ConfigError::DebounceWindow {
                min_ms: self.porch_debounce_min_ms,
                max_ms: self.porch_debounce_max_ms,
            });
        }

        let worst_case_ms = self.worst_case_tick_ms();
        if worst_case_ms >= self.watchdog_timeout_ms {
            return Err(ConfigError::WatchdogBudget {
                worst_case_ms,
                watchdog_ms: self.watchdog_timeout_ms,
            });
        }

        Ok(())
    }

    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        self.echo_timeout_ms = self.echo_timeout_ms.clamp(5, 60);
        self.tick_interval_ms = self.tick_interval_ms.clamp(10, 1_000);
        self.watchdog_timeout_ms = self.watchdog_timeout_ms.max(5_000);
        self.wifi_connect_timeout_ms = self.wifi_connect_timeout_ms.clamp(1_000, 15_000);
        self.kasa_connect_timeout_ms = self.kasa_connect_timeout_ms.clamp(200, 3_000);
        self.kasa_io_timeout_ms = self.kasa_io_timeout_ms.clamp(100, 2_000);
        self.dns_timeout_ms = self.dns_timeout_ms.clamp(500, 5_000);
        self.telemetry_connect_timeout_ms = self.telemetry_connect_timeout_ms.clamp(500, 8_000);
        self.telemetry_io_timeout_ms = self.telemetry_io_timeout_ms.clamp(200, 5_000);

        if self.light_hold_ms == 0 {
            self.light_hold_ms = defaults.light_hold_ms;
        }
        if self.wifi_retry_ms == 0 {
            self.wifi_retry_ms = defaults.wifi_retry_ms;
        }
        if self.kasa_retry_ms == 0 {
            self.kasa_retry_ms = defaults.kasa_retry_ms;
        }
        if self.telemetry_retry_ms == 0 {
            self.telemetry_retry_ms = defaults.telemetry_retry_ms;
        }
        self.wifi_retry_max_ms = self.wifi_retry_max_ms.max(self.wifi_retry_ms);
        self.kasa_retry_max_ms = self.kasa_retry_max_ms.max(self.kasa_retry_ms);
        self.telemetry_retry_max_ms = self.telemetry_retry_max_ms.max(self.telemetry_retry_ms);

        if self.porch_debounce_min_ms > self.porch_debounce_max_ms {
            core::mem::swap(
                &mut self.porch_debounce_min_ms,
                &mut self.porch_debounce_max_ms,
            );
        }

        // Shrink the longest waits first until one tick fits the watchdog,
        // keeping a tick interval of headroom.
        let budget = self
            .watchdog_timeout_ms
            .saturating_sub(self.tick_interval_ms);
        let shrinkable: [(fn(&mut Self) -> &mut u32, u32); 6] = [
            (|c| &mut c.wifi_connect_timeout_ms, 1_000),
            (|c| &mut c.telemetry_connect_timeout_ms, 500),
            (|c| &mut c.telemetry_io_timeout_ms, 200),
            (|c| &mut c.kasa_connect_timeout_ms, 200),
            (|c| &mut c.kasa_io_timeout_ms, 100),
            (|c| &mut c.dns_timeout_ms, 500),
        ];
        for (field, floor) in shrinkable {
            let overshoot = self.worst_case_tick_ms().saturating_sub(budget);
            if overshoot == 0 {
                break;
            }
            let value = field(self);
            *value = value.saturating_sub(overshoot).max(floor);
        }

        // Every wait is at its floor and the tick still does not fit: the
        // watchdog has to give.
        let worst_case_ms = self.worst_case_tick_ms();
        if worst_case_ms >= self.watchdog_timeout_ms {
            self.watchdog_timeout_ms = worst_case_ms.saturating_add(self.tick_interval_ms);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SiteConfig {
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: String,
    /// Minutes of twilight after sunrise and before sunset still treated as dark.
    pub dark_margin_min: u16,
    /// Fallback night window used until the wall clock is trustworthy.
    pub night_start_minute: u16,
    pub night_end_minute: u16,
    /// Earliest epoch second accepted as a synchronised clock.
    pub min_valid_epoch: i64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            latitude: 47.6062,
            longitude: -122.3321,
            timezone: "America/Los_Angeles".to_string(),
            dark_margin_min: 15,
            night_start_minute: 18 * 60,
            night_end_minute: 8 * 60,
            min_valid_epoch: 1_700_000_000,
        }
    }
}

impl SiteConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-90.0..=90.0).contains(&self.latitude) || !self.latitude.is_finite() {
            return Err(ConfigError::Latitude(self.latitude.to_string()));
        }
        Ok(())
    }

    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if !self.latitude.is_finite() {
            self.latitude = defaults.latitude;
        }
        if !self.longitude.is_finite() {
            self.longitude = defaults.longitude;
        }
        self.latitude = self.latitude.clamp(-90.0, 90.0);
        self.longitude = self.longitude.clamp(-180.0, 180.0);
        self.dark_margin_min = self.dark_margin_min.min(120);
        self.night_start_minute %= 24 * 60;
        self.night_end_minute %= 24 * 60;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub kasa_host: String,
    pub kasa_port: u16,
    pub telemetry_host: String,
    pub telemetry_port: u16,
    pub telemetry_tls: bool,
    pub form_id: String,
    pub field_id: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            kasa_host: "192.168.1.60".to_string(),
            kasa_port: 9999,
            telemetry_host: "docs.google.com".to_string(),
            telemetry_port: 443,
            telemetry_tls: true,
            form_id: String::new(),
            field_id: String::new(),
        }
    }
}

impl NetworkConfig {
    pub fn telemetry_path(&self) -> String {
        format!("/forms/d/e/{}/formResponse", self.form_id)
    }

    pub fn telemetry_field(&self) -> String {
        format!("entry.{}", self.field_id)
    }

    pub fn telemetry_enabled(&self) -> bool {
        !self.form_id.is_empty() && !self.field_id.is_empty()
    }
}

/// GPIO numbers for the board. Negative means "not fitted".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HardwareConfig {
    pub lower_trigger_pin: i32,
    pub lower_echo_pin: i32,
    pub upper_trigger_pin: i32,
    pub upper_echo_pin: i32,
    pub relay_pin: i32,
    pub relay_active_high: bool,
    pub wifi_led_pin: i32,
    pub porch_led_pin: i32,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            lower_trigger_pin: 25,
            lower_echo_pin: 26,
            upper_trigger_pin: 32,
            upper_echo_pin: 33,
            relay_pin: 27,
            relay_active_high: true,
            wifi_led_pin: 2,
            porch_led_pin: -1,
        }
    }
}

impl HardwareConfig {
    pub fn sensor_pins(&self) -> [i32; 4] {
        [
            self.lower_trigger_pin,
            self.lower_echo_pin,
            self.upper_trigger_pin,
            self.upper_echo_pin,
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut used: Vec<i32> = self.sensor_pins().to_vec();
        used.push(self.relay_pin);
        if let Some(pin) = used.iter().copied().find(|pin| *pin < 0) {
            return Err(ConfigError::Pin(pin));
        }
        used.extend([self.wifi_led_pin, self.porch_led_pin].into_iter().filter(|pin| *pin >= 0));
        used.sort_unstable();
        if let Some(pair) = used.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ConfigError::Pin(pair[0]));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub timing: TimingConfig,
    pub site: SiteConfig,
    pub network: NetworkConfig,
    pub hardware: HardwareConfig,
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timing.validate()?;
        self.site.validate()?;
        self.hardware.validate()
    }

    pub fn sanitize(&mut self) {
        self.timing.sanitize();
        self.site.sanitize();
    }

    /// Boot-time repair of a loaded config. Whatever still fails after
    /// sanitizing falls back to its defaults, so the result always validates.
    pub fn repair(&mut self) {
        let Err(err) = self.validate() else {
            return;
        };
        warn!("runtime config rejected ({err}); sanitizing");
        self.sanitize();

        if let Err(err) = self.timing.validate() {
            warn!("timing still invalid after sanitizing ({err}); using defaults");
            self.timing = TimingConfig::default();
        }
        if let Err(err) = self.site.validate() {
            warn!("site still invalid after sanitizing ({err}); using defaults");
            self.site = SiteConfig::default();
        }
        if let Err(err) = self.hardware.validate() {
            warn!("pin map rejected ({err}); using the default board layout");
            self.hardware = HardwareConfig::default();
        }
    }
}
