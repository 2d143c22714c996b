use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::registers::{Cadence, RegisterMap};

/// Cycles spent in fast mode after a write before falling back to normal polling.
/// The mode flips back once the counter exceeds this value.
pub const FAST_POLL_CYCLES: u32 = 5;

/// Default minimum age of the setpoints before they are read again.
pub const SETPOINT_REFRESH: Duration = Duration::from_secs(3 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    Normal,
    Fast,
}

/// Decides which groups each refresh cycle reads and how long to wait for the next one.
#[derive(Debug, Clone)]
pub struct PollScheduler {
    normal_interval: Duration,
    fast_interval: Duration,
    setpoint_refresh: Duration,
    mode: PollMode,
    fast_ticks: u32,
    last_setpoint_read: Option<Instant>,
}

impl PollScheduler {
    pub fn new(normal_interval: Duration, fast_interval: Duration) -> Self {
        Self {
            normal_interval,
            fast_interval,
            setpoint_refresh: SETPOINT_REFRESH,
            mode: PollMode::Normal,
            fast_ticks: 0,
            last_setpoint_read: None,
        }
    }

    pub fn with_setpoint_refresh(mut self, setpoint_refresh: Duration) -> Self {
        self.setpoint_refresh = setpoint_refresh;
        self
    }

    pub fn mode(&self) -> PollMode {
        self.mode
    }

    pub fn fast_ticks(&self) -> u32 {
        self.fast_ticks
    }

    /// Delay until the next refresh cycle.
    pub fn interval(&self) -> Duration {
        match self.mode {
            PollMode::Normal => self.normal_interval,
            PollMode::Fast => self.fast_interval,
        }
    }

    pub fn last_setpoint_read(&self) -> Option<Instant> {
        self.last_setpoint_read
    }

    /// Groups to read in the cycle starting at `now`, in map order.
    ///
    /// `identified` tells whether the unit already reported a non-zero firmware major.
    /// Including the periodic groups restarts their refresh timer.
    pub fn plan(&mut self, map: &RegisterMap, now: Instant, identified: bool) -> Vec<&'static str> {
        let setpoints_due = self
            .last_setpoint_read
            .map_or(true, |last| now.saturating_duration_since(last) > self.setpoint_refresh);

        let groups = map
            .groups()
            .iter()
            .filter(|group| match group.cadence {
                Cadence::Always => true,
                Cadence::UntilIdentified => !identified,
                Cadence::Periodic => setpoints_due,
                Cadence::OnDemand => false,
            })
            .map(|group| group.name)
            .collect::<Vec<_>>();

        if setpoints_due {
            self.last_setpoint_read = Some(now);
        }
        debug!(?groups, mode = ?self.mode, "planned refresh cycle");

        groups
    }

    /// Switch to fast polling after a write. Restarts the fast period when already fast.
    pub fn request_fast(&mut self) {
        if self.mode == PollMode::Normal {
            info!(interval = ?self.fast_interval, "switching to fast polling");
        }
        self.mode = PollMode::Fast;
        self.fast_ticks = 0;
    }

    /// Account for a finished refresh cycle.
    pub fn complete_cycle(&mut self) {
        if self.mode != PollMode::Fast {
            return;
        }

        self.fast_ticks += 1;
        if self.fast_ticks > FAST_POLL_CYCLES {
            info!(interval = ?self.normal_interval, "back to normal polling");
            self.mode = PollMode::Normal;
            self.fast_ticks = 0;
        }
    }
}
