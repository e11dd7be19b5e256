use serde::Serialize;

use crate::{
    clock::Millis,
    config::TimingConfig,
    ranging::SensorReading,
    types::{CommandOutcome, SwitchCommand, TriggerSource},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightAction {
    StairsOn(TriggerSource),
    StairsOff,
    PorchOn,
    PorchOff,
}

impl LightAction {
    pub fn switch_command(self) -> Option<SwitchCommand> {
        match self {
            Self::PorchOn => Some(SwitchCommand::On),
            Self::PorchOff => Some(SwitchCommand::Off),
            _ => None,
        }
    }
}

/// One lit period of the stairway, from the first detection until the hold
/// runs out.
#[derive(Debug, Clone, Copy)]
struct Transit {
    source: TriggerSource,
    since: Millis,
    last_trigger: Millis,
    porch_requested: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LightStatus {
    #[serde(rename = "lightOn")]
    pub light_on: bool,
    #[serde(rename = "triggerSource")]
    pub trigger_source: Option<TriggerSource>,
    #[serde(rename = "lightRemainingMs")]
    pub light_remaining_ms: u32,
    #[serde(rename = "porchArmed")]
    pub porch_armed: bool,
    #[serde(rename = "porchRemainingMs")]
    pub porch_remaining_ms: u32,
}

#[derive(Debug, Clone)]
pub struct LightController {
    config: TimingConfig,
    transit: Option<Transit>,
    porch_deadline: Option<Millis>,
}

impl LightController {
    pub fn new(config: TimingConfig) -> Self {
        Self {
            config,
            transit: None,
            porch_deadline: None,
        }
    }

    pub fn is_light_on(&self) -> bool {
        self.transit.is_some()
    }

    pub fn trigger_source(&self) -> Option<TriggerSource> {
        self.transit.map(|transit| transit.source)
    }

    pub fn porch_deadline(&self) -> Option<Millis> {
        self.porch_deadline
    }

    pub fn light_remaining_ms(&self, now: Millis) -> u32 {
        match self.transit {
            Some(transit) => self
                .config
                .light_hold_ms
                .saturating_sub(now.elapsed_since(transit.last_trigger)),
            None => 0,
        }
    }

    pub fn porch_remaining_ms(&self, now: Millis) -> u32 {
        match self.porch_deadline {
            Some(deadline) if !now.reached(deadline) => deadline.elapsed_since(now),
            _ => 0,
        }
    }

    /// Advances the state machine by one tick. At most one porch action is
    /// returned per call.
    pub fn tick(&mut self, now: Millis, reading: SensorReading, dark: bool) -> Vec<LightAction> {
        let mut actions = Vec::new();
        let mut porch_requested = false;

        match self.transit.as_mut() {
            Some(transit) if reading.any() => {
                if transit.source == TriggerSource::Lower
                    && !transit.porch_requested
                    && reading.upper_detected
                {
                    let gap = now.elapsed_since(transit.since);
                    if (self.config.porch_debounce_min_ms..=self.config.porch_debounce_max_ms)
                        .contains(&gap)
                    {
                        transit.porch_requested = true;
                        porch_requested = true;
                    }
                }
                transit.last_trigger = now;
            }
            Some(transit) => {
                if now.has_elapsed(transit.last_trigger, self.config.light_hold_ms) {
                    self.transit = None;
                    actions.push(LightAction::StairsOff);
                }
            }
            None => {
                let source =
                    TriggerSource::from_detection(reading.lower_detected, reading.upper_detected);
                if let (Some(source), true) = (source, dark) {
                    self.transit = Some(Transit {
                        source,
                        since: now,
                        last_trigger: now,
                        porch_requested: false,
                    });
                    actions.push(LightAction::StairsOn(source));
                }
            }
        }

        if porch_requested {
            if self.porch_deadline.is_some() {
                // Porch is already lit by us; just keep it on longer.
                self.porch_deadline = Some(now.offset(self.config.porch_auto_off_ms));
            } else {
                actions.push(LightAction::PorchOn);
            }
        } else if let Some(deadline) = self.porch_deadline {
            if now.reached(deadline) {
                actions.push(LightAction::PorchOff);
            }
        }

        actions
    }

    /// Feeds back how a porch command issued by [`tick`](Self::tick) ended.
    pub fn porch_command_result(
        &mut self,
        command: SwitchCommand,
        outcome: CommandOutcome,
        now: Millis,
    ) {
        match (command, outcome) {
            (SwitchCommand::On, CommandOutcome::Sent) => {
                self.porch_deadline = Some(now.offset(self.config.porch_auto_off_ms));
            }
            // Somebody else lit the porch; leave it to them.
            (SwitchCommand::On, _) => {}
            (SwitchCommand::Off, outcome) if outcome.settled() => {
                self.porch_deadline = None;
            }
            (SwitchCommand::Off, _) => {
                self.porch_deadline = Some(now.offset(self.config.porch_off_retry_ms));
            }
        }
    }

    pub fn status(&self, now: Millis) -> LightStatus {
        LightStatus {
            light_on: self.is_light_on(),
            trigger_source: self.trigger_source(),
            light_remaining_ms: self.light_remaining_ms(now),
            porch_armed: self.porch_deadline.is_some(),
            porch_remaining_ms: self.porch_remaining_ms(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const LOWER: SensorReading = SensorReading {
        lower_detected: true,
        upper_detected: false,
    };
    const UPPER: SensorReading = SensorReading {
        lower_detected: false,
        upper_detected: true,
    };
    const NOBODY: SensorReading = SensorReading {
        lower_detected: false,
        upper_detected: false,
    };

    fn at(ms: u32) -> Millis {
        Millis::from_raw(ms)
    }

    fn controller() -> LightController {
        LightController::new(TimingConfig::default())
    }

    fn porch_ons(actions: &[LightAction]) -> usize {
        actions
            .iter()
            .filter(|action| **action == LightAction::PorchOn)
            .count()
    }

    #[test]
    fn turns_on_only_in_the_dark() {
        let mut light = controller();

        assert!(light.tick(at(0), LOWER, false).is_empty());
        assert!(!light.is_light_on());

        assert_eq!(
            light.tick(at(100), LOWER, true),
            vec![LightAction::StairsOn(TriggerSource::Lower)]
        );
        assert_eq!(light.trigger_source(), Some(TriggerSource::Lower));
    }

    #[test]
    fn both_sensors_at_once_are_recorded_as_both() {
        let mut light = controller();
        let both = SensorReading {
            lower_detected: true,
            upper_detected: true,
        };

        assert_eq!(
            light.tick(at(0), both, true),
            vec![LightAction::StairsOn(TriggerSource::Both)]
        );
    }

    #[test]
    fn light_turns_off_exactly_at_hold_expiry() {
        let mut light = controller();
        light.tick(at(0), LOWER, true);

        for t in (100..60_000).step_by(100) {
            assert!(light.tick(at(t), NOBODY, true).is_empty(), "off early at {t}");
            assert!(light.is_light_on());
        }
        assert!(light.tick(at(59_999), NOBODY, true).is_empty());
        assert_eq!(light.tick(at(60_000), NOBODY, true), vec![LightAction::StairsOff]);
        assert!(!light.is_light_on());
    }

    #[test]
    fn detection_extends_the_hold() {
        let mut light = controller();
        light.tick(at(0), LOWER, true);
        light.tick(at(50_000), LOWER, true);

        assert!(light.tick(at(60_000), NOBODY, true).is_empty());
        assert_eq!(light.light_remaining_ms(at(60_000)), 50_000);
        assert_eq!(light.tick(at(110_000), NOBODY, true), vec![LightAction::StairsOff]);
    }

    #[test]
    fn walking_upstairs_requests_the_porch_once() {
        let mut light = controller();
        light.tick(at(0), LOWER, true);

        assert_eq!(light.tick(at(10_000), UPPER, true), vec![LightAction::PorchOn]);
        light.porch_command_result(SwitchCommand::On, CommandOutcome::Sent, at(10_000));

        let mut later = Vec::new();
        for t in [12_000, 15_000, 20_000, 39_000] {
            later.extend(light.tick(at(t), UPPER, true));
        }
        assert_eq!(porch_ons(&later), 0);
    }

    #[test]
    fn porch_window_is_inclusive_at_both_ends() {
        for (gap, expected) in [
            (3_999, 0),
            (4_000, 1),
            (10_000, 1),
            (40_000, 1),
            (40_001, 0),
        ] {
            let mut light = controller();
            light.tick(at(0), LOWER, true);
            let actions = light.tick(at(gap), UPPER, true);
            assert_eq!(porch_ons(&actions), expected, "gap {gap}");
        }
    }

    #[test]
    fn too_early_upper_hit_does_not_block_a_later_one() {
        let mut light = controller();
        light.tick(at(0), LOWER, true);

        assert!(light.tick(at(1_000), UPPER, true).is_empty());
        assert_eq!(light.tick(at(6_000), UPPER, true), vec![LightAction::PorchOn]);
    }

    #[test]
    fn walking_downstairs_never_lights_the_porch() {
        let mut light = controller();
        light.tick(at(0), UPPER, true);

        assert!(light.tick(at(10_000), LOWER, true).is_empty());
        assert!(light.tick(at(12_000), UPPER, true).is_empty());
    }

    #[test]
    fn porch_auto_off_after_deadline() {
        let mut light = controller();
        light.tick(at(0), LOWER, true);
        light.tick(at(10_000), UPPER, true);
        light.porch_command_result(SwitchCommand::On, CommandOutcome::Sent, at(10_000));
        assert_eq!(light.porch_deadline(), Some(at(310_000)));

        assert!(!light.tick(at(309_999), NOBODY, true).contains(&LightAction::PorchOff));
        assert_eq!(light.tick(at(310_000), NOBODY, true), vec![LightAction::PorchOff]);

        light.porch_command_result(SwitchCommand::Off, CommandOutcome::Sent, at(310_000));
        assert_eq!(light.porch_deadline(), None);
        assert!(light.tick(at(400_000), NOBODY, true).is_empty());
    }

    #[test]
    fn failed_porch_off_is_retried_later() {
        let mut light = controller();
        light.tick(at(0), LOWER, true);
        light.tick(at(10_000), UPPER, true);
        light.porch_command_result(SwitchCommand::On, CommandOutcome::Sent, at(10_000));

        light.tick(at(310_000), NOBODY, true);
        light.porch_command_result(SwitchCommand::Off, CommandOutcome::Failed, at(310_000));
        assert_eq!(light.porch_deadline(), Some(at(340_000)));

        assert!(light.tick(at(339_999), NOBODY, true).is_empty());
        assert_eq!(light.tick(at(340_000), NOBODY, true), vec![LightAction::PorchOff]);
    }

    #[test]
    fn porch_lit_by_someone_else_is_left_alone() {
        let mut light = controller();
        light.tick(at(0), LOWER, true);
        light.tick(at(10_000), UPPER, true);
        light.porch_command_result(SwitchCommand::On, CommandOutcome::AlreadySet, at(10_000));

        assert_eq!(light.porch_deadline(), None);
        assert!(light.tick(at(900_000), NOBODY, true).iter().all(|a| *a != LightAction::PorchOff));
    }

    #[test]
    fn second_ascent_rearms_our_porch_without_a_command() {
        let mut light = controller();
        light.tick(at(0), LOWER, true);
        light.tick(at(10_000), UPPER, true);
        light.porch_command_result(SwitchCommand::On, CommandOutcome::Sent, at(10_000));
        light.tick(at(80_000), NOBODY, true);
        assert!(!light.is_light_on());

        light.tick(at(100_000), LOWER, true);
        assert!(light.tick(at(108_000), UPPER, true).is_empty());
        assert_eq!(light.porch_deadline(), Some(at(408_000)));
    }

    #[test]
    fn hold_survives_counter_wrap() {
        let mut light = controller();
        let start = u32::MAX - 20_000;
        light.tick(at(start), LOWER, true);

        assert!(light.tick(at(start.wrapping_add(59_999)), NOBODY, true).is_empty());
        assert_eq!(
            light.tick(at(start.wrapping_add(60_000)), NOBODY, true),
            vec![LightAction::StairsOff]
        );
    }
}
