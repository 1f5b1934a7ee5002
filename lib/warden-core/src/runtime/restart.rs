use std::{collections::VecDeque, sync::Arc, time::Duration};

use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;
use warden_config::{ConfigurationError, GenericConfiguration};

use super::link::ExitReason;

const fn default_max_retries() -> usize {
    1
}

const fn default_within_time_window_ms() -> u64 {
    5000
}

/// Which children are restarted when one of them fails.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestartScheme {
    /// Restarts the failed child only.
    #[default]
    OneForOne,

    /// Restarts every child, in configuration order, including those that did not fail.
    AllForOne,
}

/// Restart strategy for a supervisor.
///
/// Defaults to one-for-one, with at most 1 restart within a window of 5 seconds.
///
/// # Retry budget
///
/// A supervisor allows up to `max_retries` restarts, counted across all of its children, within any sliding window of
/// `within_time_window`. The failure that would exceed the budget is not restarted: the supervisor tears down its
/// children and fails itself instead, which its parent observes as an ordinary child failure. A root supervisor that
/// exhausts its budget stops for good.
///
/// # Configuration
///
/// ```yaml
/// scheme: all_for_one
/// max_retries: 3
/// within_time_window_ms: 100
/// ```
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct RestartStrategy {
    #[serde(default)]
    scheme: RestartScheme,

    #[serde(default = "default_max_retries")]
    max_retries: usize,

    #[serde(default = "default_within_time_window_ms")]
    within_time_window_ms: u64,
}

impl RestartStrategy {
    /// Creates a new `RestartStrategy`.
    pub fn new(scheme: RestartScheme, max_retries: usize, within_time_window: Duration) -> Self {
        Self {
            scheme,
            max_retries,
            within_time_window_ms: u64::try_from(within_time_window.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates a one-for-one `RestartStrategy` with the given budget.
    pub fn one_for_one(max_retries: usize, within_time_window: Duration) -> Self {
        Self::new(RestartScheme::OneForOne, max_retries, within_time_window)
    }

    /// Creates an all-for-one `RestartStrategy` with the given budget.
    pub fn all_for_one(max_retries: usize, within_time_window: Duration) -> Self {
        Self::new(RestartScheme::AllForOne, max_retries, within_time_window)
    }

    /// Loads a `RestartStrategy` from the given configuration key, using the defaults if the key is absent.
    ///
    /// # Errors
    ///
    /// If the key exists but cannot be deserialized, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration, key: &str) -> Result<Self, ConfigurationError> {
        Ok(config.try_get_typed(key)?.unwrap_or_default())
    }

    /// Returns the restart scheme.
    pub fn scheme(&self) -> RestartScheme {
        self.scheme
    }

    /// Returns the maximum number of restarts allowed within the window.
    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Returns the width of the sliding window.
    pub fn within_time_window(&self) -> Duration {
        Duration::from_millis(self.within_time_window_ms)
    }
}

impl Default for RestartStrategy {
    fn default() -> Self {
        Self {
            scheme: RestartScheme::OneForOne,
            max_retries: default_max_retries(),
            within_time_window_ms: default_within_time_window_ms(),
        }
    }
}

/// Summary of a completed restart, handed to the post-restart hook.
#[derive(Clone, Debug)]
pub struct RestartReport {
    /// Supervisor that performed the restart.
    pub supervisor_id: String,

    /// Scheme that was applied.
    pub scheme: RestartScheme,

    /// Child whose failure triggered the restart.
    pub failed_child: String,

    /// Why the child failed.
    pub reason: ExitReason,

    /// Children that were restarted, in the order they were restarted.
    pub restarted: Vec<String>,
}

/// Hook invoked once per restart action, after every affected child has been restarted.
pub type PostRestartHook = Arc<dyn Fn(&RestartReport) + Send + Sync>;

pub(super) enum RestartAction {
    /// Restart according to the given scheme.
    Restart(RestartScheme),

    /// The retry budget is exhausted: the supervisor must fail.
    Escalate,
}

/// Sliding-window failure bookkeeping, owned by a single supervisor.
pub(super) struct RestartState {
    strategy: RestartStrategy,
    restart_history: VecDeque<Instant>,
}

impl RestartState {
    pub fn new(strategy: RestartStrategy) -> Self {
        Self {
            strategy,
            restart_history: VecDeque::with_capacity(strategy.max_retries),
        }
    }

    /// Decides how to respond to a child failure happening now.
    pub fn evaluate_restart(&mut self) -> RestartAction {
        self.evaluate_restart_at(Instant::now())
    }

    fn evaluate_restart_at(&mut self, now: Instant) -> RestartAction {
        let window = self.strategy.within_time_window();
        while let Some(oldest) = self.restart_history.front() {
            if now.saturating_duration_since(*oldest) < window {
                break;
            }
            self.restart_history.pop_front();
        }

        if self.restart_history.len() >= self.strategy.max_retries {
            debug!(
                "Restart limit exceeded ({} in {:?}), escalating.",
                self.strategy.max_retries, window
            );
            return RestartAction::Escalate;
        }

        self.restart_history.push_back(now);
        debug!(
            restarts_in_window = self.restart_history.len(),
            "Restart limit not exceeded, restarting."
        );
        RestartAction::Restart(self.strategy.scheme)
    }
}

#[cfg(test)]
mod tests {
    use warden_config::ConfigurationLoader;

    use super::*;

    fn is_restart(action: RestartAction) -> bool {
        matches!(action, RestartAction::Restart(_))
    }

    #[test]
    fn nth_failure_restarts_and_next_escalates() {
        for max_retries in [1, 2, 3, 5] {
            let mut state = RestartState::new(RestartStrategy::one_for_one(max_retries, Duration::from_millis(100)));
            let start = Instant::now();

            for i in 0..max_retries {
                let now = start + Duration::from_millis(i as u64);
                assert!(is_restart(state.evaluate_restart_at(now)), "failure #{} must restart", i + 1);
            }

            let now = start + Duration::from_millis(max_retries as u64);
            assert!(
                matches!(state.evaluate_restart_at(now), RestartAction::Escalate),
                "failure #{} must escalate",
                max_retries + 1
            );
        }
    }

    #[test]
    fn zero_retries_escalates_immediately() {
        let mut state = RestartState::new(RestartStrategy::all_for_one(0, Duration::from_secs(5)));
        assert!(matches!(state.evaluate_restart(), RestartAction::Escalate));
    }

    #[test]
    fn failures_outside_window_are_forgotten() {
        let mut state = RestartState::new(RestartStrategy::one_for_one(2, Duration::from_millis(100)));
        let start = Instant::now();

        assert!(is_restart(state.evaluate_restart_at(start)));
        assert!(is_restart(state.evaluate_restart_at(start + Duration::from_millis(50))));

        // The first failure has aged out, leaving room for one more.
        assert!(is_restart(state.evaluate_restart_at(start + Duration::from_millis(120))));
        assert!(matches!(
            state.evaluate_restart_at(start + Duration::from_millis(130)),
            RestartAction::Escalate
        ));

        // Much later, the whole history has aged out.
        assert!(is_restart(state.evaluate_restart_at(start + Duration::from_secs(10))));
    }

    #[test]
    fn escalation_does_not_consume_budget() {
        let mut state = RestartState::new(RestartStrategy::one_for_one(1, Duration::from_millis(100)));
        let start = Instant::now();

        assert!(is_restart(state.evaluate_restart_at(start)));
        assert!(matches!(
            state.evaluate_restart_at(start + Duration::from_millis(10)),
            RestartAction::Escalate
        ));
        assert!(is_restart(state.evaluate_restart_at(start + Duration::from_millis(100))));
    }

    #[test]
    fn scheme_is_carried_into_action() {
        let mut state = RestartState::new(RestartStrategy::all_for_one(3, Duration::from_secs(1)));
        assert!(matches!(
            state.evaluate_restart(),
            RestartAction::Restart(RestartScheme::AllForOne)
        ));
    }

    #[test]
    fn strategy_from_configuration() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        std::io::Write::write_all(
            &mut file,
            b"root:\n  restart:\n    scheme: all_for_one\n    max_retries: 3\n    within_time_window_ms: 100\n",
        )
        .unwrap();

        let config = ConfigurationLoader::default().from_yaml(file.path()).unwrap().into_generic();

        let strategy = RestartStrategy::from_configuration(&config, "root.restart").unwrap();
        assert_eq!(strategy, RestartStrategy::all_for_one(3, Duration::from_millis(100)));

        let defaulted = RestartStrategy::from_configuration(&config, "other.restart").unwrap();
        assert_eq!(defaulted, RestartStrategy::default());
    }
}
