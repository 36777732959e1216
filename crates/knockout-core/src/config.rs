//! Game tuning knobs, loadable from TOML and overridden by the CLI layer.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::Capacity;

fn default_min_players() -> u32 {
    2
}
fn default_max_players() -> u32 {
    100
}
fn default_question_time_ms() -> u64 {
    5_000
}
fn default_start_delay_ms() -> u64 {
    15_000
}
fn default_between_rounds_delay_ms() -> u64 {
    5_000
}
fn default_first_round_delay_ms() -> u64 {
    300
}
fn default_recent_question_window() -> usize {
    5
}
fn default_join_code_length() -> usize {
    6
}
fn default_persistence_retries() -> u32 {
    3
}
fn default_recovery_delay_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GameConfig {
    /// Quorum needed to start a countdown.
    #[serde(default = "default_min_players")]
    pub min_players: u32,
    /// Waiting-room capacity.
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    /// Per-round answer window.
    #[serde(default = "default_question_time_ms")]
    pub question_time_ms: u64,
    /// Countdown between quorum and session start.
    #[serde(default = "default_start_delay_ms")]
    pub start_delay_ms: u64,
    #[serde(default = "default_between_rounds_delay_ms")]
    pub between_rounds_delay_ms: u64,
    /// Pause between the session-started broadcast and the first question.
    #[serde(default = "default_first_round_delay_ms")]
    pub first_round_delay_ms: u64,
    /// Number of most recent questions excluded from selection (K).
    #[serde(default = "default_recent_question_window")]
    pub recent_question_window: usize,
    #[serde(default = "default_join_code_length")]
    pub join_code_length: usize,
    /// Attempts per store write before the session is suspended.
    #[serde(default = "default_persistence_retries")]
    pub persistence_retries: u32,
    /// Delay before a suspended session rehydrates from the store.
    #[serde(default = "default_recovery_delay_ms")]
    pub recovery_delay_ms: u64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            min_players: default_min_players(),
            max_players: default_max_players(),
            question_time_ms: default_question_time_ms(),
            start_delay_ms: default_start_delay_ms(),
            between_rounds_delay_ms: default_between_rounds_delay_ms(),
            first_round_delay_ms: default_first_round_delay_ms(),
            recent_question_window: default_recent_question_window(),
            join_code_length: default_join_code_length(),
            persistence_retries: default_persistence_retries(),
            recovery_delay_ms: default_recovery_delay_ms(),
        }
    }
}

impl GameConfig {
    /// Parse without validating, for callers that layer overrides on top.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read and parse a TOML file without validating.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        Self::parse(&text).map_err(|e| match e {
            ConfigError::Parse(msg) => ConfigError::Parse(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config = Self::parse(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_players < 2 {
            return Err(ConfigError::Invalid(format!(
                "min_players must be at least 2, got {}",
                self.min_players
            )));
        }
        if self.max_players < self.min_players {
            return Err(ConfigError::Invalid(format!(
                "max_players ({}) is below min_players ({})",
                self.max_players, self.min_players
            )));
        }
        if self.question_time_ms == 0 {
            return Err(ConfigError::Invalid("question_time_ms must be positive".into()));
        }
        if self.join_code_length == 0 {
            return Err(ConfigError::Invalid("join_code_length must be positive".into()));
        }
        if self.persistence_retries == 0 {
            return Err(ConfigError::Invalid("persistence_retries must be positive".into()));
        }
        Ok(())
    }

    pub fn capacity(&self) -> Capacity {
        Capacity {
            min: self.min_players,
            max: self.max_players,
        }
    }

    pub fn question_time(&self) -> Duration {
        Duration::from_millis(self.question_time_ms)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn between_rounds_delay(&self) -> Duration {
        Duration::from_millis(self.between_rounds_delay_ms)
    }

    pub fn first_round_delay(&self) -> Duration {
        Duration::from_millis(self.first_round_delay_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = GameConfig::default();
        c.validate().unwrap();
        assert_eq!(c.min_players, 2);
        assert_eq!(c.question_time(), Duration::from_secs(5));
        assert_eq!(c.start_delay(), Duration::from_secs(15));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = GameConfig::from_toml("min_players = 3\nquestion_time_ms = 8000\n").unwrap();
        assert_eq!(c.min_players, 3);
        assert_eq!(c.question_time_ms, 8000);
        assert_eq!(c.max_players, 100);
        assert_eq!(c.recent_question_window, 5);
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = GameConfig::from_toml("min_playerz = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn parse_leaves_validation_to_the_caller() {
        let c = GameConfig::parse("min_players = 5\nmax_players = 3\n").unwrap();
        assert_eq!((c.min_players, c.max_players), (5, 3));
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let err = GameConfig::from_toml("min_players = 5\nmax_players = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_single_player_quorum() {
        let c = GameConfig {
            min_players: 1,
            ..GameConfig::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_zero_budget() {
        let c = GameConfig {
            question_time_ms: 0,
            ..GameConfig::default()
        };
        assert!(c.validate().is_err());
    }
}
