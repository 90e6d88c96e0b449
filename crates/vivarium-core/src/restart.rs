//! Restart policies and backoff schedules for supervised agents.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// When a dead agent should be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart.
    #[default]
    Never,
    /// Restart regardless of exit code.
    Always,
    /// Restart only on a non-zero exit code.
    OnFailure,
}

impl RestartPolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Always => "always",
            Self::OnFailure => "on-failure",
        }
    }

    /// Should an exit with this code trigger a restart?
    #[must_use]
    pub const fn applies_to(self, exit_code: i32) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::OnFailure => exit_code != 0,
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "on-failure" | "on_failure" => Ok(Self::OnFailure),
            "never" => Ok(Self::Never),
            _ => Err(()),
        }
    }
}

/// Restart schedule for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub policy: RestartPolicy,
    /// Maximum restarts inside one window before escalation.
    pub max_restarts: u32,
    /// Window for counting restarts, in seconds.
    pub window_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            policy: RestartPolicy::Never,
            max_restarts: 5,
            window_secs: 300,
            backoff_initial_ms: 1000,
            backoff_max_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RestartConfig {
    /// Delay before the restart following `consecutive_failures`
    /// previous failures: `min(initial × multiplier^failures, max)`.
    ///
    /// The first restart (zero prior failures) waits exactly the
    /// initial delay.
    #[must_use]
    pub fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        let initial = self.backoff_initial_ms as f64;
        #[allow(clippy::cast_possible_wrap)] // failure counts stay small
        let delay_ms = initial * self.backoff_multiplier.powi(consecutive_failures as i32);
        let capped = delay_ms.min(self.backoff_max_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_strings_round_trip() {
        for policy in [
            RestartPolicy::Never,
            RestartPolicy::Always,
            RestartPolicy::OnFailure,
        ] {
            assert_eq!(policy.as_str().parse::<RestartPolicy>().unwrap(), policy);
        }
        assert_eq!("on_failure".parse::<RestartPolicy>().unwrap(), RestartPolicy::OnFailure);
        assert!("sometimes".parse::<RestartPolicy>().is_err());
    }

    #[test]
    fn policy_applies_to_exit_codes() {
        assert!(!RestartPolicy::Never.applies_to(1));
        assert!(RestartPolicy::Always.applies_to(0));
        assert!(RestartPolicy::OnFailure.applies_to(1));
        assert!(!RestartPolicy::OnFailure.applies_to(0));
    }

    #[test]
    fn exponential_backoff_with_cap() {
        let config = RestartConfig {
            backoff_initial_ms: 100,
            backoff_max_ms: 1000,
            backoff_multiplier: 2.0,
            ..RestartConfig::default()
        };

        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(800));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(1000));
        assert_eq!(config.backoff_delay(10), Duration::from_millis(1000));
    }

    #[test]
    fn serde_accepts_kebab_case_policy() {
        let config: RestartConfig =
            serde_json::from_str(r#"{"policy": "on-failure", "max_restarts": 3}"#).unwrap();
        assert_eq!(config.policy, RestartPolicy::OnFailure);
        assert_eq!(config.max_restarts, 3);
        assert_eq!(config.window_secs, 300);
    }
}
