use std::{collections::VecDeque, ops::Range};

use chrono::{DateTime, Duration, FixedOffset, TimeZone};
use pretty_assertions::assert_eq;
use stairlight_common::{
    BackgroundWork, CommandOutcome, ControllerState, EventKind, LightAction, LinkError, Millis,
    NetworkLinks, RuntimeConfig, SensorReading, StairHardware, SwitchCommand, SwitchLink,
    TelemetryLink, TickReport, TriggerSource, WifiLink,
};

#[derive(Default)]
struct Stairs {
    now: u32,
    lower: Vec<Range<u32>>,
    upper: Vec<Range<u32>>,
    light_on: bool,
}

impl StairHardware for Stairs {
    fn sample(&mut self) -> SensorReading {
        let hit = |ranges: &[Range<u32>]| ranges.iter().any(|range| range.contains(&self.now));
        SensorReading {
            lower_detected: hit(&self.lower),
            upper_detected: hit(&self.upper),
        }
    }

    fn set_stair_light(&mut self, on: bool) {
        self.light_on = on;
    }
}

struct Wifi {
    up: bool,
    accept: bool,
    now: u32,
    attempts: Vec<u32>,
}

impl WifiLink for Wifi {
    fn is_connected(&mut self) -> bool {
        self.up
    }

    fn connect(&mut self, _timeout_ms: u32) -> Result<(), LinkError> {
        self.attempts.push(self.now);
        self.up = self.accept;
        if self.accept {
            Ok(())
        } else {
            Err(LinkError::Timeout(8_000))
        }
    }
}

#[derive(Default)]
struct Plug {
    relay_on: bool,
    failures: VecDeque<bool>,
    now: u32,
    commands: Vec<(u32, SwitchCommand)>,
    queries: u32,
}

impl SwitchLink for Plug {
    fn query_relay(&mut self) -> Result<bool, LinkError> {
        self.queries += 1;
        Ok(self.relay_on)
    }

    fn execute(&mut self, command: SwitchCommand) -> Result<CommandOutcome, LinkError> {
        self.commands.push((self.now, command));
        if self.failures.pop_front().unwrap_or(false) {
            return Err(LinkError::Timeout(1_500));
        }
        if command == SwitchCommand::On && self.relay_on {
            return Ok(CommandOutcome::AlreadySet);
        }
        self.relay_on = command == SwitchCommand::On;
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
        Ok(204)
    }

    fn close(&mut self) {
        self.open = false;
    }
}

struct Rig {
    state: ControllerState,
    stairs: Stairs,
    links: NetworkLinks<Wifi, Plug, Collector>,
    wall_at_boot: DateTime<FixedOffset>,
}

impl Rig {
    fn new(wall_at_boot: DateTime<FixedOffset>) -> Self {
        let mut config = RuntimeConfig::default();
        config.network.form_id = "form".to_string();
        config.network.field_id = "7".to_string();
        Self {
            state: ControllerState::new(config, Millis::from_raw(0)),
            stairs: Stairs::default(),
            links: NetworkLinks {
                wifi: Wifi {
                    up: true,
                    accept: true,
                    now: 0,
                    attempts: Vec::new(),
                },
                switch: Plug::default(),
                telemetry: Collector::default(),
            },
            wall_at_boot,
        }
    }

    fn at_night() -> Self {
        Self::new(pacific(2024, 12, 21, 22))
    }

    fn tick(&mut self, now: u32) -> TickReport {
        self.stairs.now = now;
        self.links.wifi.now = now;
        self.links.switch.now = now;
        let wall = self.wall_at_boot + Duration::milliseconds(i64::from(now));
        self.state
            .tick(&mut self.stairs, &mut self.links, Millis::from_raw(now), wall)
    }

    /// Ticks every 100 ms over `span`, returning the reports that carried
    /// light actions.
    fn run(&mut self, span: Range<u32>) -> Vec<(u32, Vec<LightAction>)> {
        span.step_by(100)
            .filter_map(|now| {
                let report = self.tick(now);
                (!report.actions.is_empty()).then_some((now, report.actions))
            })
            .collect()
    }
}

fn pacific(y: i32, m: u32, d: u32, hour: u32) -> DateTime<FixedOffset> {
    FixedOffset::west_opt(8 * 3600)
        .unwrap()
        .with_ymd_and_hms(y, m, d, hour, 0, 0)
        .unwrap()
}

#[test]
fn walking_upstairs_lights_the_porch_once() {
    let mut rig = Rig::at_night();
    rig.stairs.lower = vec![0..100];
    rig.stairs.upper = vec![10_000..10_100, 12_000..12_100];

    let actions = rig.run(0..20_000);

    assert_eq!(
        actions,
        vec![
            (0, vec![LightAction::StairsOn(TriggerSource::Lower)]),
            (10_000, vec![LightAction::PorchOn]),
        ]
    );
    assert_eq!(rig.links.switch.commands, vec![(10_000, SwitchCommand::On)]);
    // The idle tick after the backlog drained refreshed the relay state once.
    assert_eq!(rig.links.switch.queries, 1);
    assert_eq!(rig.state.light().porch_deadline(), Some(Millis::from_raw(310_000)));
    assert!(rig.stairs.light_on);
}

#[test]
fn light_goes_off_exactly_when_the_hold_expires() {
    let mut rig = Rig::at_night();
    rig.stairs.lower = vec![0..100];

    let actions = rig.run(0..70_000);

    assert_eq!(
        actions,
        vec![
            (0, vec![LightAction::StairsOn(TriggerSource::Lower)]),
            (60_000, vec![LightAction::StairsOff]),
        ]
    );
    assert!(!rig.stairs.light_on);
    assert!(rig.links.switch.commands.is_empty());
}

#[test]
fn porch_switches_itself_off_after_the_auto_off_delay() {
    let mut rig = Rig::at_night();
    rig.stairs.lower = vec![0..100];
    rig.stairs.upper = vec![5_000..5_100];

    rig.run(0..306_000);

    assert_eq!(
        rig.links.switch.commands,
        vec![(5_000, SwitchCommand::On), (305_000, SwitchCommand::Off)]
    );
    assert_eq!(rig.state.light().porch_deadline(), None);
    assert!(!rig.links.switch.relay_on);

    let logged: Vec<&str> = rig.links.telemetry.lines.iter().map(String::as_str).collect();
    assert!(logged.iter().any(|line| line.starts_with("porch light on")));
    assert!(logged.iter().any(|line| line.starts_with("porch light off")));
}

#[test]
fn gap_outside_the_debounce_window_is_ignored() {
    let mut rig = Rig::at_night();
    rig.stairs.lower = vec![0..100];
    rig.stairs.upper = vec![2_000..2_100, 50_000..50_100];

    rig.run(0..60_000);

    assert!(rig.links.switch.commands.is_empty());
}

#[test]
fn daylight_keeps_the_stairs_dark() {
    let mut rig = Rig::new(pacific(2024, 6, 21, 13));
    rig.stairs.lower = vec![0..100];
    rig.stairs.upper = vec![10_000..10_100];

    assert!(rig.run(0..20_000).is_empty());
    assert!(!rig.stairs.light_on);
}

#[test]
fn failed_porch_off_is_retried_after_the_retry_delay() {
    let mut rig = Rig::at_night();
    rig.stairs.lower = vec![0..100];
    rig.stairs.upper = vec![5_000..5_100];
    rig.links.switch.failures = VecDeque::from([false, true]);

    rig.run(0..400_000);

    // Off fails at the deadline; the switch cooldown (60 s) outlasts the
    // porch retry (30 s), so the 335 s attempt is deferred and the next one
    // goes out once both have elapsed.
    assert_eq!(
        rig.links.switch.commands,
        vec![
            (5_000, SwitchCommand::On),
            (305_000, SwitchCommand::Off),
            (365_000, SwitchCommand::Off),
        ]
    );
    assert_eq!(rig.state.light().porch_deadline(), None);
    assert!(rig
        .links
        .telemetry
        .lines
        .contains(&"porch switch command failed (0s ago)".to_string()));
}

#[test]
fn wifi_outage_defers_network_work_and_spaces_attempts() {
    let mut rig = Rig::at_night();
    rig.links.wifi.up = false;
    rig.links.wifi.accept = false;
    rig.stairs.lower = vec![0..100];
    rig.stairs.upper = vec![5_000..5_100];

    let mut porch = Vec::new();
    for now in (0..120_000).step_by(100) {
        if let Some(result) = rig.tick(now).porch {
            porch.push(result);
        }
    }

    assert_eq!(porch, vec![(SwitchCommand::On, CommandOutcome::Deferred)]);
    assert!(rig.links.switch.commands.is_empty());
    assert!(rig.links.telemetry.lines.is_empty());
    assert_eq!(rig.links.wifi.attempts, vec![0, 30_000, 90_000]);
    // Nobody switched the porch on, so nothing is armed to switch off.
    assert_eq!(rig.state.light().porch_deadline(), None);
}

#[test]
fn reconnect_is_logged_and_events_drain_one_per_tick() {
    let mut rig = Rig::at_night();
    rig.links.wifi.up = false;
    rig.stairs.lower = vec![0..100];

    let first = rig.tick(0);
    assert_eq!(first.background, BackgroundWork::None);

    let mut drained = Vec::new();
    for now in (5_000..6_000).step_by(100) {
        if let BackgroundWork::Log(kind, CommandOutcome::Sent) = rig.tick(now).background {
            drained.push((now, kind));
        }
    }

    assert_eq!(
        drained,
        vec![
            (5_000, EventKind::Boot),
            (5_100, EventKind::WifiReconnect),
            (5_200, EventKind::LightOn),
        ]
    );
    assert_eq!(rig.links.telemetry.lines[0], "controller booted (5s ago)");
    assert_eq!(rig.state.events().pending(), 0);
}
