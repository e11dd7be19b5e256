use serde::Serialize;

use crate::clock::Millis;

/// Things worth reporting to the remote log. Declaration order is the
/// tie-break priority when two events share a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Boot,
    WifiReconnect,
    SwitchFailure,
    PorchOn,
    PorchOff,
    LightOn,
    LightOff,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Boot,
        EventKind::WifiReconnect,
        EventKind::SwitchFailure,
        EventKind::PorchOn,
        EventKind::PorchOff,
        EventKind::LightOn,
        EventKind::LightOff,
    ];

    pub fn message(self) -> &'static str {
        match self {
            Self::Boot => "controller booted",
            Self::WifiReconnect => "wifi reconnected",
            Self::SwitchFailure => "porch switch command failed",
            Self::PorchOn => "porch light on",
            Self::PorchOff => "porch light off",
            Self::LightOn => "stairway light on",
            Self::LightOff => "stairway light off",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEvent {
    pub kind: EventKind,
    pub occurred_at: Millis,
}

impl PendingEvent {
    pub fn format(&self, now: Millis) -> String {
        format!("{} ({}s ago)", self.kind.message(), now.secs_since(self.occurred_at))
    }
}

/// One slot per [`EventKind`]. Recording a kind that is already pending
/// moves its timestamp forward; only the latest occurrence is reported.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    slots: [Option<Millis>; EventKind::ALL.len()],
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EventKind, now: Millis) {
        self.slots[kind.slot()] = Some(now);
    }

    pub fn is_pending(&self, kind: EventKind) -> bool {
        self.slots[kind.slot()].is_some()
    }

    pub fn pending(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn pending_kinds(&self) -> Vec<EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(|kind| self.is_pending(*kind))
            .collect()
    }

    /// The oldest pending event. Ages are measured from `now` so the order
    /// survives a counter wrap.
    pub fn next_due(&self, now: Millis) -> Option<PendingEvent> {
        let mut best: Option<(u32, PendingEvent)> = None;
        for kind in EventKind::ALL {
            let Some(occurred_at) = self.slots[kind.slot()] else {
                continue;
            };
            let age = now.elapsed_since(occurred_at);
            if best.map_or(true, |(best_age, _)| age > best_age) {
                best = Some((age, PendingEvent { kind, occurred_at }));
            }
        }
        best.map(|(_, event)| event)
    }

    /// Clears the slot if it still holds `event`; a newer occurrence recorded
    /// since stays pending.
    pub fn confirm(&mut self, event: PendingEvent) {
        let slot = &mut self.slots[event.kind.slot()];
        if *slot == Some(event.occurred_at) {
            *slot = None;
        }
    }
}
