//! Config layering: defaults < TOML file < flags / environment.

use std::path::Path;

use knockout_core::{ConfigError, GameConfig};

/// Game knobs settable from the command line or environment. Unset fields
/// leave the file (or default) value alone.
#[derive(Debug, Default, Clone, clap::Args)]
pub struct GameOverrides {
    /// Players needed to start the countdown
    #[arg(long, env = "KNOCKOUT_MIN_PLAYERS")]
    pub min_players: Option<u32>,

    /// Waiting-room capacity
    #[arg(long, env = "KNOCKOUT_MAX_PLAYERS")]
    pub max_players: Option<u32>,

    /// Answer window per round, in milliseconds
    #[arg(long, env = "KNOCKOUT_QUESTION_TIME_MS")]
    pub question_time_ms: Option<u64>,

    /// Countdown between quorum and start, in milliseconds
    #[arg(long, env = "KNOCKOUT_START_DELAY_MS")]
    pub start_delay_ms: Option<u64>,

    /// Pause between rounds, in milliseconds
    #[arg(long, env = "KNOCKOUT_BETWEEN_ROUNDS_DELAY_MS")]
    pub between_rounds_delay_ms: Option<u64>,

    /// Number of recent questions excluded from selection
    #[arg(long, env = "KNOCKOUT_RECENT_QUESTION_WINDOW")]
    pub recent_question_window: Option<usize>,
}

impl GameOverrides {
    fn apply(&self, config: &mut GameConfig) {
        if let Some(v) = self.min_players {
            config.min_players = v;
        }
        if let Some(v) = self.max_players {
            config.max_players = v;
        }
        if let Some(v) = self.question_time_ms {
            config.question_time_ms = v;
        }
        if let Some(v) = self.start_delay_ms {
            config.start_delay_ms = v;
        }
        if let Some(v) = self.between_rounds_delay_ms {
            config.between_rounds_delay_ms = v;
        }
        if let Some(v) = self.recent_question_window {
            config.recent_question_window = v;
        }
    }
}

/// Build the effective game config. The result is validated after the
/// overrides are applied, so a flag can fix an invalid file value.
pub fn resolve(path: Option<&Path>, overrides: &GameOverrides) -> Result<GameConfig, ConfigError> {
    let mut config = match path {
        Some(path) => GameConfig::read(path)?,
        None => GameConfig::default(),
    };
    overrides.apply(&mut config);
    config.validate()?;
    tracing::debug!(?config, "game config resolved");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file_or_flags() {
        let c = resolve(None, &GameOverrides::default()).unwrap();
        assert_eq!(c, GameConfig::default());
    }

    #[test]
    fn flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "min_players = 3\nquestion_time_ms = 9000").unwrap();
        let overrides = GameOverrides {
            question_time_ms: Some(4000),
            ..GameOverrides::default()
        };
        let c = resolve(Some(file.path()), &overrides).unwrap();
        assert_eq!(c.min_players, 3);
        assert_eq!(c.question_time_ms, 4000);
        assert_eq!(c.max_players, 100);
    }

    #[test]
    fn override_can_repair_file_value() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "min_players = 5\nmax_players = 3").unwrap();
        assert!(resolve(Some(file.path()), &GameOverrides::default()).is_err());
        let overrides = GameOverrides {
            max_players: Some(10),
            ..GameOverrides::default()
        };
        assert_eq!(resolve(Some(file.path()), &overrides).unwrap().max_players, 10);
    }

    #[test]
    fn invalid_override_rejected() {
        let overrides = GameOverrides {
            min_players: Some(1),
            ..GameOverrides::default()
        };
        assert!(matches!(
            resolve(None, &overrides),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn missing_file_is_a_parse_error() {
        let err = resolve(Some(Path::new("/nonexistent/knockout.toml")), &GameOverrides::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
