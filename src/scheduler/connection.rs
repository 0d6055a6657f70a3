//! Connection state tracking across monitoring ticks.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// A change in reachability observed between two samples.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Disconnected { at: DateTime<Utc> },
    Reconnected { at: DateTime<Utc>, outage: Duration },
}

/// Remembers when the current outage started.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    disconnected_since: Option<DateTime<Utc>>,
}

impl ConnectionTracker {
    pub fn is_connected(&self) -> bool {
        self.disconnected_since.is_none()
    }

    /// Feed one sample; returns the transition it caused, if any.
    ///
    /// The outage runs from the first unreachable sample to the first
    /// reachable one after it.
    pub fn observe(&mut self, at: DateTime<Utc>, unreachable: bool) -> Option<Transition> {
        match (self.disconnected_since, unreachable) {
            (None, true) => {
                self.disconnected_since = Some(at);
                Some(Transition::Disconnected { at })
            }
            (Some(since), false) => {
                self.disconnected_since = None;
                let outage = (at - since).to_std().unwrap_or_default();
                Some(Transition::Reconnected { at, outage })
            }
            _ => None,
        }
    }
}
