use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerSource {
    Lower,
    Upper,
    Both,
}

impl TriggerSource {
    pub fn from_detection(lower: bool, upper: bool) -> Option<Self> {
        match (lower, upper) {
            (true, true) => Some(Self::Both),
            (true, false) => Some(Self::Lower),
            (false, true) => Some(Self::Upper),
            (false, false) => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lower => "LOWER",
            Self::Upper => "UPPER",
            Self::Both => "BOTH",
        }
    }
}

/// Relay command for the remote porch switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SwitchCommand {
    On,
    Off,
}

impl SwitchCommand {
    pub fn relay_state(self) -> u8 {
        match self {
            Self::On => 1,
            Self::Off => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

/// What became of a request that needed the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandOutcome {
    /// The command went out on the wire.
    Sent,
    /// The device already reported the requested state; nothing was sent.
    AlreadySet,
    /// Not attempted: the link is down or cooling off after a failure.
    Deferred,
    /// Attempted and failed; a cooldown is now running.
    Failed,
}

impl CommandOutcome {
    pub fn settled(self) -> bool {
        matches!(self, Self::Sent | Self::AlreadySet)
    }
}
