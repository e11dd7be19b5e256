//! The per-tick control loop shared by every back-end.
//!
//! [`ControllerState::tick`] runs the stages in a fixed order: network
//! refresh, sensing, daylight, light state, one porch command, then one
//! unit of background network work (log drain, keep-alive or heartbeat).
//! Every stage is bounded, so the whole tick is bounded by
//! [`TimingConfig::worst_case_tick_ms`](crate::config::TimingConfig::worst_case_tick_ms).

use chrono::{DateTime, FixedOffset};
use log::{debug, info};
use serde::Serialize;

use crate::{
    clock::Millis,
    config::RuntimeConfig,
    daylight::{Daylight, DaylightOracle, SolarDay},
    event_log::{EventKind, EventLog},
    light::{LightAction, LightController, LightStatus},
    network::{NetworkState, NetworkStatus, SwitchLink, TelemetryLink, WifiCheck, WifiLink},
    ranging::SensorReading,
    types::{CommandOutcome, SwitchCommand},
};

/// Local I/O the loop drives directly.
pub trait StairHardware {
    fn sample(&mut self) -> SensorReading;

    fn set_stair_light(&mut self, on: bool);

    fn show_status(&mut self, _indicators: Indicators) {}
}

/// The three network links, owned by the back-end and lent to each tick.
pub struct NetworkLinks<W, S, T> {
    pub wifi: W,
    pub switch: S,
    pub telemetry: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Indicators {
    #[serde(rename = "wifiConnected")]
    pub wifi_connected: bool,
    #[serde(rename = "telemetryOpen")]
    pub telemetry_open: bool,
    #[serde(rename = "lightOn")]
    pub light_on: bool,
    /// The porch is lit by us and waiting for its auto-off.
    #[serde(rename = "porchArmed")]
    pub porch_armed: bool,
}

/// The single background network job a tick spent its budget on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundWork {
    None,
    Log(EventKind, CommandOutcome),
    KeepAlive,
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub wifi: WifiCheck,
    pub reading: SensorReading,
    pub dark: bool,
    pub actions: Vec<LightAction>,
    pub porch: Option<(SwitchCommand, CommandOutcome)>,
    pub background: BackgroundWork,
}

#[derive(Debug, Clone, Serialize)]
pub struct StairStatus {
    #[serde(rename = "uptimeSecs")]
    pub uptime_secs: u32,
    pub ticks: u64,
    pub light: LightStatus,
    pub dark: bool,
    pub daylight: Option<Daylight>,
    pub almanac: Option<SolarDay>,
    pub sensors: SensorReading,
    pub network: NetworkStatus,
    #[serde(rename = "pendingEvents")]
    pub pending_events: Vec<EventKind>,
    pub indicators: Indicators,
}

#[derive(Debug, Clone)]
pub struct ControllerState {
    config: RuntimeConfig,
    light: LightController,
    daylight: DaylightOracle,
    events: EventLog,
    network: NetworkState,
    booted_at: Millis,
    last_activity: Option<Millis>,
    last_reading: SensorReading,
    last_daylight: Option<Daylight>,
    ticks: u64,
}

impl ControllerState {
    /// Fresh state: nothing detected, everything off, never connected. The
    /// boot itself is queued for the remote log.
    pub fn new(config: RuntimeConfig, now: Millis) -> Self {
        let mut events = EventLog::new();
        events.record(EventKind::Boot, now);
        Self {
            light: LightController::new(config.timing.clone()),
            daylight: DaylightOracle::new(config.site.clone(), config.timing.solar_refresh_ms),
            network: NetworkState::new(config.timing.clone(), config.network.telemetry_enabled()),
            events,
            config,
            booted_at: now,
            last_activity: None,
            last_reading: SensorReading::default(),
            last_daylight: None,
            ticks: 0,
        }
    }

    pub fn light(&self) -> &LightController {
        &self.light
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn tick<H, W, S, T>(
        &mut self,
        hardware: &mut H,
        links: &mut NetworkLinks<W, S, T>,
        now: Millis,
        wall: DateTime<FixedOffset>,
    ) -> TickReport
    where
        H: StairHardware,
        W: WifiLink,
        S: SwitchLink,
        T: TelemetryLink,
    {
        self.ticks = self.ticks.wrapping_add(1);

        let wifi = self.network.refresh_wifi(&mut links.wifi, now);
        if wifi == WifiCheck::Reconnected {
            self.events.record(EventKind::WifiReconnect, now);
        }

        let reading = hardware.sample();
        if reading.any() {
            self.last_activity = Some(now);
        }
        self.last_reading = reading;

        let daylight = self.daylight.assess(now, wall);
        self.last_daylight = Some(daylight);

        let actions = self.light.tick(now, reading, daylight.dark);
        let mut porch = None;
        for action in &actions {
            match action {
                LightAction::StairsOn(source) => {
                    info!("stairway light on ({})", source.as_str());
                    hardware.set_stair_light(true);
                    self.events.record(EventKind::LightOn, now);
                }
                LightAction::StairsOff => {
                    info!("stairway light off");
                    hardware.set_stair_light(false);
                    self.events.record(EventKind::LightOff, now);
                }
                LightAction::PorchOn | LightAction::PorchOff => {
                    if let Some(command) = action.switch_command() {
                        porch = Some((command, self.run_porch_command(links, command, now)));
                    }
                }
            }
        }

        let network_busy = matches!(porch, Some((_, outcome)) if outcome != CommandOutcome::Deferred);
        let background = if network_busy {
            BackgroundWork::None
        } else {
            self.background_work(links, now)
        };

        hardware.show_status(self.indicators());

        TickReport {
            wifi,
            reading,
            dark: daylight.dark,
            actions,
            porch,
            background,
        }
    }

    fn run_porch_command<W, S, T>(
        &mut self,
        links: &mut NetworkLinks<W, S, T>,
        command: SwitchCommand,
        now: Millis,
    ) -> CommandOutcome
    where
        S: SwitchLink,
    {
        let outcome = self.network.send_switch_command(&mut links.switch, command, now);
        self.light.porch_command_result(command, outcome, now);
        match (command, outcome) {
            (SwitchCommand::On, CommandOutcome::Sent) => self.events.record(EventKind::PorchOn, now),
            (SwitchCommand::Off, CommandOutcome::Sent) => {
                self.events.record(EventKind::PorchOff, now)
            }
            (_, CommandOutcome::Failed) => self.events.record(EventKind::SwitchFailure, now),
            _ => {}
        }
        outcome
    }

    fn quiet(&self, now: Millis) -> bool {
        self.last_activity
            .map_or(true, |at| now.has_elapsed(at, self.config.timing.log_quiet_ms))
    }

    fn background_work<W, S, T>(&mut self, links: &mut NetworkLinks<W, S, T>, now: Millis) -> BackgroundWork
    where
        S: SwitchLink,
        T: TelemetryLink,
    {
        if !self.quiet(now) {
            return BackgroundWork::None;
        }

        if let Some(event) = self.events.next_due(now) {
            let message = event.format(now);
            let outcome = self.network.deliver_log(&mut links.telemetry, &message, now);
            if outcome == CommandOutcome::Sent {
                self.events.confirm(event);
            }
            if outcome != CommandOutcome::Deferred {
                return BackgroundWork::Log(event.kind, outcome);
            }
            debug!("log line deferred: {message}");
        }

        if self.network.keep_alive(&mut links.telemetry, now) {
            return BackgroundWork::KeepAlive;
        }
        if self.network.switch_heartbeat(&mut links.switch, now) {
            return BackgroundWork::Heartbeat;
        }
        BackgroundWork::None
    }

    pub fn indicators(&self) -> Indicators {
        Indicators {
            wifi_connected: self.network.wifi_connected(),
            telemetry_open: self.network.telemetry_open(),
            light_on: self.light.is_light_on(),
            porch_armed: self.light.porch_deadline().is_some(),
        }
    }

    pub fn status(&self, now: Millis) -> StairStatus {
        StairStatus {
            uptime_secs: now.secs_since(self.booted_at),
            ticks: self.ticks,
            light: self.light.status(now),
            dark: self.last_daylight.map_or(false, |daylight| daylight.dark),
            daylight: self.last_daylight,
            almanac: self.daylight.cached(),
            sensors: self.last_reading,
            network: self.network.status(now),
            pending_events: self.events.pending_kinds(),
            indicators: self.indicators(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::error::LinkError;

    struct Board {
        reading: SensorReading,
        light_on: bool,
    }

    impl StairHardware for Board {
        fn sample(&mut self) -> SensorReading {
            self.reading
        }

        fn set_stair_light(&mut self, on: bool) {
            self.light_on = on;
        }
    }

    struct Wifi;

    impl WifiLink for Wifi {
        fn is_connected(&mut self) -> bool {
            true
        }

        fn connect(&mut self, _timeout_ms: u32) -> Result<(), LinkError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Switch {
        commands: Vec<SwitchCommand>,
    }

    impl SwitchLink for Switch {
        fn query_relay(&mut self) -> Result<bool, LinkError> {
            Ok(false)
        }

        fn execute(&mut self, command: SwitchCommand) -> Result<CommandOutcome, LinkError> {
            self.commands.push(command);
            Ok(CommandOutcome::Sent)
        }
    }

    #[derive(Default)]
    struct Collector {
        open: bool,
        lines: Vec<String>,
    }

    impl TelemetryLink for Collector {
        fn is_open(&self) -> bool {
            self.open
        }

        fn open(&mut self) -> Result<(), LinkError> {
            self.open = true;
            Ok(())
        }

        fn submit(&mut self, message: &str) -> Result<u16, LinkError> {
            self.lines.push(message.to_string());
            Ok(200)
        }

        fn keep_alive(&mut self) -> Result<u16, LinkError> {
            Ok(200)
        }

        fn close(&mut self) {
            self.open = false;
        }
    }

    fn night() -> DateTime<FixedOffset> {
        FixedOffset::west_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 12, 21, 22, 0, 0)
            .unwrap()
    }

    fn config() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.network.form_id = "form".to_string();
        config.network.field_id = "1".to_string();
        config
    }

    #[test]
    fn logging_waits_for_the_quiet_period() {
        let mut state = ControllerState::new(config(), Millis::from_raw(0));
        let mut board = Board {
            reading: SensorReading {
                lower_detected: true,
                upper_detected: false,
            },
            light_on: false,
        };
        let mut links = NetworkLinks {
            wifi: Wifi,
            switch: Switch::default(),
            telemetry: Collector::default(),
        };

        let report = state.tick(&mut board, &mut links, Millis::from_raw(0), night());
        assert_eq!(report.background, BackgroundWork::None);
        assert!(board.light_on);
        assert!(links.telemetry.lines.is_empty());

        board.reading = SensorReading::default();
        let report = state.tick(&mut board, &mut links, Millis::from_raw(4_900), night());
        assert_eq!(report.background, BackgroundWork::None);

        let report = state.tick(&mut board, &mut links, Millis::from_raw(5_000), night());
        assert_eq!(
            report.background,
            BackgroundWork::Log(EventKind::Boot, CommandOutcome::Sent)
        );
        assert_eq!(links.telemetry.lines, vec!["controller booted (5s ago)"]);
    }

    #[test]
    fn status_reflects_the_last_tick() {
        let mut state = ControllerState::new(config(), Millis::from_raw(0));
        let mut board = Board {
            reading: SensorReading {
                lower_detected: false,
                upper_detected: true,
            },
            light_on: false,
        };
        let mut links = NetworkLinks {
            wifi: Wifi,
            switch: Switch::default(),
            telemetry: Collector::default(),
        };

        state.tick(&mut board, &mut links, Millis::from_raw(1_000), night());
        let status = state.status(Millis::from_raw(3_000));

        assert_eq!(status.uptime_secs, 3);
        assert!(status.light.light_on);
        assert!(status.dark);
        assert!(status.indicators.wifi_connected);
        assert!(status.pending_events.contains(&EventKind::LightOn));

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["light"]["triggerSource"], "UPPER");
        assert_eq!(json["network"]["wifiConnected"], true);
    }
}
