//! Round watchdog.
//!
//! No live timers: each managed round keeps the instant its current phase
//! started, and "time left" is recomputed on demand against the phase
//! timeout. A periodic tick asks [`MixLimits::expired`] which rounds are
//! overdue and the coordinator fires their timeout handlers.

use crate::config::ServerConfig;
use crate::core::types::{MixId, MixStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseTimeouts {
    /// CONFIRM_INPUT has no deadline; this is the invitation period.
    pub confirm_input: Duration,
    pub register_output: Duration,
    pub signing: Duration,
    pub reveal_output: Duration,
}

impl PhaseTimeouts {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            confirm_input: config.confirm_interval(),
            register_output: Duration::from_secs(config.register_output.timeout_secs),
            signing: Duration::from_secs(config.signing.timeout_secs),
            reveal_output: Duration::from_secs(config.reveal_output.timeout_secs),
        }
    }

    pub fn for_status(&self, status: MixStatus) -> Option<Duration> {
        match status {
            MixStatus::ConfirmInput => Some(self.confirm_input),
            MixStatus::RegisterOutput => Some(self.register_output),
            MixStatus::Signing => Some(self.signing),
            MixStatus::RevealOutput => Some(self.reveal_output),
            MixStatus::Success | MixStatus::Fail => None,
        }
    }
}

#[derive(Clone, Debug)]
struct PhaseClock {
    status: MixStatus,
    started: Instant,
    simulated: Duration,
}

impl PhaseClock {
    fn new(status: MixStatus) -> Self {
        Self { status, started: Instant::now(), simulated: Duration::ZERO }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed() + self.simulated
    }
}

/// One phase clock per active round.
pub struct MixLimits {
    timeouts: PhaseTimeouts,
    clocks: Mutex<HashMap<MixId, PhaseClock>>,
}

impl MixLimits {
    pub fn new(timeouts: PhaseTimeouts) -> Self {
        Self { timeouts, clocks: Mutex::new(HashMap::new()) }
    }

    pub fn timeouts(&self) -> &PhaseTimeouts {
        &self.timeouts
    }

    /// Start watching a round (or restart its clock in `status`).
    pub fn manage(&self, mix_id: &str, status: MixStatus) {
        self.clocks.lock().insert(mix_id.to_string(), PhaseClock::new(status));
    }

    pub fn unmanage(&self, mix_id: &str) {
        self.clocks.lock().remove(mix_id);
    }

    pub fn is_managed(&self, mix_id: &str) -> bool {
        self.clocks.lock().contains_key(mix_id)
    }

    /// Restart the clock of a managed round, keeping its phase.
    pub fn reset(&self, mix_id: &str) {
        if let Some(clock) = self.clocks.lock().get_mut(mix_id) {
            *clock = PhaseClock::new(clock.status);
        }
    }

    pub fn elapsed(&self, mix_id: &str) -> Option<Duration> {
        self.clocks.lock().get(mix_id).map(PhaseClock::elapsed)
    }

    /// Time before the current phase of `mix_id` times out. `None` for an
    /// unmanaged round or a phase without deadline.
    pub fn time_left(&self, mix_id: &str) -> Option<Duration> {
        let clocks = self.clocks.lock();
        let clock = clocks.get(mix_id)?;
        let timeout = self.timeouts.for_status(clock.status)?;
        Some(timeout.saturating_sub(clock.elapsed()))
    }

    /// Pretend `by` has passed in the current phase of `mix_id`.
    pub fn simulate_elapsed(&self, mix_id: &str, by: Duration) {
        if let Some(clock) = self.clocks.lock().get_mut(mix_id) {
            clock.simulated += by;
        }
    }

    /// Rounds whose current phase deadline has passed, with that phase.
    pub fn expired(&self) -> Vec<(MixId, MixStatus)> {
        self.clocks
            .lock()
            .iter()
            .filter(|(_, clock)| {
                self.timeouts
                    .for_status(clock.status)
                    .map_or(false, |timeout| clock.elapsed() >= timeout)
            })
            .map(|(id, clock)| (id.clone(), clock.status))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> MixLimits {
        MixLimits::new(PhaseTimeouts {
            confirm_input: Duration::from_secs(10),
            register_output: Duration::from_secs(60),
            signing: Duration::from_secs(30),
            reveal_output: Duration::from_secs(20),
        })
    }

    #[test]
    fn time_left_counts_down_with_simulated_time() {
        let l = limits();
        l.manage("m1", MixStatus::Signing);
        let left = l.time_left("m1").unwrap();
        assert!(left <= Duration::from_secs(30) && left > Duration::from_secs(29));

        l.simulate_elapsed("m1", Duration::from_secs(25));
        assert!(l.time_left("m1").unwrap() <= Duration::from_secs(5));
        assert!(l.expired().is_empty());

        l.simulate_elapsed("m1", Duration::from_secs(5));
        assert_eq!(l.time_left("m1"), Some(Duration::ZERO));
        assert_eq!(l.expired(), vec![("m1".to_string(), MixStatus::Signing)]);
    }

    #[test]
    fn status_change_restarts_clock() {
        let l = limits();
        l.manage("m1", MixStatus::RegisterOutput);
        l.simulate_elapsed("m1", Duration::from_secs(61));
        assert_eq!(l.expired().len(), 1);

        l.manage("m1", MixStatus::RevealOutput);
        assert!(l.expired().is_empty());
        assert!(l.time_left("m1").unwrap() > Duration::from_secs(19));
    }

    #[test]
    fn reset_keeps_phase() {
        let l = limits();
        l.manage("m1", MixStatus::ConfirmInput);
        l.simulate_elapsed("m1", Duration::from_secs(11));
        assert_eq!(l.expired(), vec![("m1".to_string(), MixStatus::ConfirmInput)]);
        l.reset("m1");
        assert!(l.expired().is_empty());
        assert!(l.elapsed("m1").unwrap() < Duration::from_secs(1));
    }

    #[test]
    fn unmanaged_rounds_never_expire() {
        let l = limits();
        l.manage("m1", MixStatus::Signing);
        l.unmanage("m1");
        l.simulate_elapsed("m1", Duration::from_secs(1_000));
        assert!(l.expired().is_empty());
        assert!(l.time_left("m1").is_none());
        assert!(!l.is_managed("m1"));
    }

    #[test]
    fn terminal_phases_have_no_deadline() {
        let l = limits();
        l.manage("m1", MixStatus::Success);
        l.simulate_elapsed("m1", Duration::from_secs(1_000));
        assert!(l.expired().is_empty());
        assert!(l.time_left("m1").is_none());
    }
}
