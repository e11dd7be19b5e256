//! Network resilience.
//!
//! Three links share the tick: Wi-Fi association, the porch switch and the
//! telemetry session. Each call here does at most one bounded exchange and
//! reports what happened; failures start a per-link [`Backoff`] instead of
//! propagating.

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    clock::Millis,
    config::TimingConfig,
    error::LinkError,
    types::{CommandOutcome, SwitchCommand},
};

pub trait WifiLink {
    fn is_connected(&mut self) -> bool;

    /// Starts association and waits for an address, giving up after
    /// `timeout_ms`.
    fn connect(&mut self, timeout_ms: u32) -> Result<(), LinkError>;
}

pub trait SwitchLink {
    fn query_relay(&mut self) -> Result<bool, LinkError>;

    /// Runs one command on a fresh connection. `Ok` is either
    /// [`CommandOutcome::Sent`] or [`CommandOutcome::AlreadySet`].
    fn execute(&mut self, command: SwitchCommand) -> Result<CommandOutcome, LinkError>;
}

pub trait TelemetryLink {
    fn is_open(&self) -> bool;

    fn open(&mut self) -> Result<(), LinkError>;

    /// Submits one log line and returns the HTTP status.
    fn submit(&mut self, message: &str) -> Result<u16, LinkError>;

    /// Sends a body-less request to keep the session warm.
    fn keep_alive(&mut self) -> Result<u16, LinkError>;

    fn close(&mut self);
}

/// Doubling retry delay: starts at `base_ms` after the first failure, never
/// exceeds `cap_ms`, and resets on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u32,
    cap_ms: u32,
    failures: u32,
    last_failure: Option<Millis>,
}

impl Backoff {
    pub fn new(base_ms: u32, cap_ms: u32) -> Self {
        Self {
            base_ms,
            cap_ms: cap_ms.max(base_ms),
            failures: 0,
            last_failure: None,
        }
    }

    pub fn delay_ms(&self) -> u32 {
        if self.failures == 0 {
            return 0;
        }
        let doublings = (self.failures - 1).min(16);
        self.base_ms
            .saturating_mul(1 << doublings)
            .min(self.cap_ms)
    }

    pub fn ready(&self, now: Millis) -> bool {
        match self.last_failure {
            Some(at) => now.has_elapsed(at, self.delay_ms()),
            None => true,
        }
    }

    pub fn remaining_ms(&self, now: Millis) -> u32 {
        match self.last_failure {
            Some(at) => self.delay_ms().saturating_sub(now.elapsed_since(at)),
            None => 0,
        }
    }

    pub fn record_failure(&mut self, now: Millis) {
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(now);
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.last_failure = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiCheck {
    Up,
    /// The link came up during this tick (or was found up after being down).
    Reconnected,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStatus {
    #[serde(rename = "wifiConnected")]
    pub wifi_connected: bool,
    #[serde(rename = "wifiAttempts")]
    pub wifi_attempts: u32,
    #[serde(rename = "wifiRetryInMs")]
    pub wifi_retry_in_ms: u32,
    #[serde(rename = "switchCooldownMs")]
    pub switch_cooldown_ms: u32,
    #[serde(rename = "switchFailures")]
    pub switch_failures: u32,
    #[serde(rename = "porchRelayOn")]
    pub porch_relay_on: Option<bool>,
    #[serde(rename = "telemetryOpen")]
    pub telemetry_open: bool,
    #[serde(rename = "telemetryRetryInMs")]
    pub telemetry_retry_in_ms: u32,
    #[serde(rename = "messagesSent")]
    pub messages_sent: u32,
}

#[derive(Debug, Clone)]
pub struct NetworkState {
    timing: TimingConfig,
    telemetry_enabled: bool,

    wifi_connected: bool,
    wifi_last_attempt: Option<Millis>,
    wifi_backoff: Backoff,
    wifi_attempts: u32,

    switch_backoff: Backoff,
    switch_failures: u32,
    porch_relay: Option<bool>,
    last_heartbeat: Option<Millis>,

    telemetry_open: bool,
    /// Set when Wi-Fi dropped under an open session; its socket is dead.
    telemetry_stale: bool,
    telemetry_backoff: Backoff,
    telemetry_last_activity: Option<Millis>,
    messages_sent: u32,
}

impl NetworkState {
    pub fn new(timing: TimingConfig, telemetry_enabled: bool) -> Self {
        Self {
            wifi_backoff: Backoff::new(timing.wifi_retry_ms, timing.wifi_retry_max_ms),
            switch_backoff: Backoff::new(timing.kasa_retry_ms, timing.kasa_retry_max_ms),
            telemetry_backoff: Backoff::new(timing.telemetry_retry_ms, timing.telemetry_retry_max_ms),
            timing,
            telemetry_enabled,
            wifi_connected: false,
            wifi_last_attempt: None,
            wifi_attempts: 0,
            switch_failures: 0,
            porch_relay: None,
            last_heartbeat: None,
            telemetry_open: false,
            telemetry_stale: false,
            telemetry_last_activity: None,
            messages_sent: 0,
        }
    }

    pub fn wifi_connected(&self) -> bool {
        self.wifi_connected
    }

    pub fn telemetry_open(&self) -> bool {
        self.telemetry_open
    }

    pub fn porch_relay(&self) -> Option<bool> {
        self.porch_relay
    }

    /// Attempts spaced at least the retry interval apart, longer while the
    /// backoff grows.
    fn wifi_attempt_due(&self, now: Millis) -> bool {
        match self.wifi_last_attempt {
            Some(at) => now.has_elapsed(
                at,
                self.timing.wifi_retry_ms.max(self.wifi_backoff.delay_ms()),
            ),
            None => true,
        }
    }

    pub fn refresh_wifi<W: WifiLink>(&mut self, wifi: &mut W, now: Millis) -> WifiCheck {
        if wifi.is_connected() {
            if self.wifi_connected {
                return WifiCheck::Up;
            }
            self.wifi_connected = true;
            self.wifi_backoff.record_success();
            info!("wifi up");
            return WifiCheck::Reconnected;
        }

        if self.wifi_connected {
            warn!("wifi link lost");
            self.wifi_connected = false;
            self.telemetry_open = false;
            self.telemetry_stale = true;
        }

        if !self.wifi_attempt_due(now) {
            return WifiCheck::Down;
        }

        self.wifi_last_attempt = Some(now);
        self.wifi_attempts = self.wifi_attempts.saturating_add(1);
        match wifi.connect(self.timing.wifi_connect_timeout_ms) {
            Ok(()) => {
                self.wifi_connected = true;
                self.wifi_backoff.record_success();
                info!("wifi associated after {} attempt(s)", self.wifi_attempts);
                WifiCheck::Reconnected
            }
            Err(err) => {
                self.wifi_backoff.record_failure(now);
                warn!(
                    "wifi connect failed: {err}; next attempt in {} ms",
                    self.timing.wifi_retry_ms.max(self.wifi_backoff.delay_ms())
                );
                WifiCheck::Down
            }
        }
    }

    pub fn send_switch_command<S: SwitchLink>(
        &mut self,
        switch: &mut S,
        command: SwitchCommand,
        now: Millis,
    ) -> CommandOutcome {
        if !self.wifi_connected || !self.switch_backoff.ready(now) {
            return CommandOutcome::Deferred;
        }

        match switch.execute(command) {
            Ok(outcome) => {
                self.switch_backoff.record_success();
                self.porch_relay = Some(command == SwitchCommand::On);
                self.last_heartbeat = Some(now);
                info!("porch switch {}: {outcome:?}", command.as_str());
                outcome
            }
            Err(err) => {
                self.switch_backoff.record_failure(now);
                self.switch_failures = self.switch_failures.saturating_add(1);
                warn!(
                    "porch switch {} failed: {err}; cooling down {} ms",
                    command.as_str(),
                    self.switch_backoff.delay_ms()
                );
                CommandOutcome::Failed
            }
        }
    }

    pub fn heartbeat_due(&self, now: Millis) -> bool {
        self.wifi_connected
            && self.switch_backoff.ready(now)
            && self
                .last_heartbeat
                .map_or(true, |at| now.has_elapsed(at, self.timing.switch_heartbeat_ms))
    }

    /// Refreshes the known porch relay state. Returns false when nothing was
    /// attempted.
    pub fn switch_heartbeat<S: SwitchLink>(&mut self, switch: &mut S, now: Millis) -> bool {
        if !self.heartbeat_due(now) {
            return false;
        }
        self.last_heartbeat = Some(now);

        match switch.query_relay() {
            Ok(on) => {
                self.switch_backoff.record_success();
                self.porch_relay = Some(on);
            }
            Err(err) => {
                self.switch_backoff.record_failure(now);
                self.switch_failures = self.switch_failures.saturating_add(1);
                self.porch_relay = None;
                warn!("porch switch heartbeat failed: {err}");
            }
        }
        true
    }

    /// Closes a session that outlived a Wi-Fi drop before anything is sent
    /// on it.
    fn discard_stale<T: TelemetryLink>(&mut self, telemetry: &mut T) {
        if std::mem::take(&mut self.telemetry_stale) && telemetry.is_open() {
            debug!("closing telemetry session left over from the lost link");
            telemetry.close();
        }
    }

    fn ensure_telemetry<T: TelemetryLink>(&mut self, telemetry: &mut T, now: Millis) -> CommandOutcome {
        if telemetry.is_open() {
            self.telemetry_open = true;
            return CommandOutcome::Sent;
        }
        self.telemetry_open = false;
        if !self.telemetry_backoff.ready(now) {
            return CommandOutcome::Deferred;
        }

        match telemetry.open() {
            Ok(()) => {
                self.telemetry_open = true;
                self.telemetry_last_activity = Some(now);
                CommandOutcome::Sent
            }
            Err(err) => {
                self.telemetry_backoff.record_failure(now);
                warn!(
                    "telemetry connect failed: {err}; retry in {} ms",
                    self.telemetry_backoff.delay_ms()
                );
                CommandOutcome::Failed
            }
        }
    }

    fn telemetry_failed<T: TelemetryLink>(&mut self, telemetry: &mut T, now: Millis, err: &LinkError) {
        telemetry.close();
        self.telemetry_open = false;
        self.telemetry_backoff.record_failure(now);
        warn!("telemetry session dropped: {err}");
    }

    /// Sends one log line. [`CommandOutcome::Sent`] means the collector
    /// confirmed it.
    pub fn deliver_log<T: TelemetryLink>(
        &mut self,
        telemetry: &mut T,
        message: &str,
        now: Millis,
    ) -> CommandOutcome {
        if !self.telemetry_enabled {
            info!("event: {message}");
            return CommandOutcome::Sent;
        }
        if !self.wifi_connected {
            return CommandOutcome::Deferred;
        }
        self.discard_stale(telemetry);
        match self.ensure_telemetry(telemetry, now) {
            CommandOutcome::Sent => {}
            other => return other,
        }

        match telemetry.submit(message) {
            Ok(status) if (200..400).contains(&status) => {
                self.telemetry_backoff.record_success();
                self.telemetry_last_activity = Some(now);
                self.messages_sent = self.messages_sent.saturating_add(1);
                self.telemetry_open = telemetry.is_open();
                CommandOutcome::Sent
            }
            Ok(status) => {
                self.telemetry_backoff.record_failure(now);
                self.telemetry_last_activity = Some(now);
                self.telemetry_open = telemetry.is_open();
                warn!("telemetry rejected log line with HTTP {status}");
                CommandOutcome::Failed
            }
            Err(err) => {
                self.telemetry_failed(telemetry, now, &err);
                CommandOutcome::Failed
            }
        }
    }

    /// Keeps the telemetry session warm: reopens a closed session once its
    /// backoff allows, or pings an open one that has been idle too long.
    /// Returns false when the tick's network budget was left unused.
    pub fn keep_alive<T: TelemetryLink>(&mut self, telemetry: &mut T, now: Millis) -> bool {
        if !self.telemetry_enabled || !self.wifi_connected {
            return false;
        }
        self.discard_stale(telemetry);

        if !telemetry.is_open() {
            self.telemetry_open = false;
            if !self.telemetry_backoff.ready(now) {
                return false;
            }
            self.ensure_telemetry(telemetry, now);
            return true;
        }

        let idle = self
            .telemetry_last_activity
            .map_or(true, |at| now.has_elapsed(at, self.timing.keepalive_interval_ms));
        if !idle {
            return false;
        }

        match telemetry.keep_alive() {
            Ok(_) => {
                self.telemetry_last_activity = Some(now);
                self.telemetry_open = telemetry.is_open();
            }
            Err(err) => self.telemetry_failed(telemetry, now, &err),
        }
        true
    }

    pub fn status(&self, now: Millis) -> NetworkStatus {
        let wifi_retry_in_ms = match (self.wifi_connected, self.wifi_last_attempt) {
            (false, Some(at)) => self
                .timing
                .wifi_retry_ms
                .max(self.wifi_backoff.delay_ms())
                .saturating_sub(now.elapsed_since(at)),
            _ => 0,
        };
        NetworkStatus {
            wifi_connected: self.wifi_connected,
            wifi_attempts: self.wifi_attempts,
            wifi_retry_in_ms,
            switch_cooldown_ms: self.switch_backoff.remaining_ms(now),
            switch_failures: self.switch_failures,
            porch_relay_on: self.porch_relay,
            telemetry_open: self.telemetry_open,
            telemetry_retry_in_ms: self.telemetry_backoff.remaining_ms(now),
            messages_sent: self.messages_sent,
        }
    }
}
