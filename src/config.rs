use log::info;
use serde::Deserialize;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

use crate::delivery::MessageId;
use crate::error::Error;
use crate::fetch::RetryPolicy;
use crate::stats::ApiEndpoints;

const APP_DIR: &str = "statsbot";
const MAX_INTERVAL_CEILING_SECS: u64 = 86_400;

/// Place identifier as it appears in a game URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaceId(pub u64);

impl fmt::Display for PlaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PlaceId {
    /// Accepts a bare numeric id or a game URL such as
    /// `https://www.roblox.com/games/920587237/Adopt-Me`.
    ///
    /// # Errors
    ///
    /// Returns an error if no non-zero place id can be extracted.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let input = input.trim();
        if let Ok(id) = input.parse::<u64>() {
            return Self::non_zero(id, input);
        }

        let url = Url::parse(input)?;
        let id = url
            .path_segments()
            .and_then(|mut segments| {
                segments.find(|s| *s == "games")?;
                segments.next()
            })
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| Error::Config(format!("no place id in game URL {input:?}")))?;
        Self::non_zero(id, input)
    }

    fn non_zero(id: u64, input: &str) -> Result<Self, Error> {
        if id == 0 {
            return Err(Error::Config(format!("invalid place id {input:?}")));
        }
        Ok(Self(id))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub config: ConfigOptions,
    #[serde(default)]
    pub game: GameOptions,
    #[serde(default)]
    pub api: ApiOptions,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ConfigOptions {
    pub timeout_secs: u64,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub initial_interval_secs: Option<u64>,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub webhook_url: Option<String>,
    pub message_id: Option<String>,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            min_interval_secs: 5,
            max_interval_secs: 300,
            initial_interval_secs: None,
            retry_max_attempts: 5,
            retry_base_delay_ms: 1000,
            webhook_url: None,
            message_id: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct GameOptions {
    pub place: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ApiOptions {
    pub universes_url: String,
    pub games_url: String,
    pub thumbnails_url: String,
}

impl Default for ApiOptions {
    fn default() -> Self {
        Self {
            universes_url: "https://apis.roproxy.com/".to_string(),
            games_url: "https://games.roproxy.com/".to_string(),
            thumbnails_url: "https://thumbnails.roproxy.com/".to_string(),
        }
    }
}

/// Validated startup configuration. Immutable once built.
#[derive(Debug, Clone)]
pub struct Settings {
    pub place_id: PlaceId,
    pub webhook_url: Url,
    pub message_id: Option<MessageId>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub initial_interval: Duration,
    pub endpoints: ApiEndpoints,
}

impl Config {
    /// Loads the config file from `STATSBOT_CONFIG` or the user config
    /// directory. A missing file falls back to defaults and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an
    /// environment variable cannot be read.
    pub fn load() -> Result<Config, Error> {
        let path = match env_var("STATSBOT_CONFIG")? {
            Some(path) => PathBuf::from(path),
            None => default_path()?,
        };
        if path.exists() {
            Self::load_from(&path)
        } else {
            info!(
                "No config file at {}, using defaults and environment",
                path.display()
            );
            let mut config = Config::default();
            config.apply_env()?;
            Ok(config)
        }
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an
    /// environment variable cannot be read.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Config, Error> {
        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env()?;
        Ok(config)
    }

    // Environment only fills fields the file leaves unset.
    fn apply_env(&mut self) -> Result<(), Error> {
        if self.config.webhook_url.is_none() {
            self.config.webhook_url = env_var("WEBHOOK_URL")?;
        }
        if self.config.message_id.is_none() {
            self.config.message_id = env_var("MESSAGE_ID")?;
        }
        if self.game.place.is_none() {
            self.game.place = env_var("GAME_PLACE")?;
        }
        Ok(())
    }

    /// Checks every value and produces the settings the bot runs with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] or [`Error::UrlParse`] for a missing or
    /// invalid value.
    pub fn into_settings(self) -> Result<Settings, Error> {
        let ConfigOptions {
            timeout_secs,
            min_interval_secs,
            max_interval_secs,
            initial_interval_secs,
            retry_max_attempts,
            retry_base_delay_ms,
            webhook_url,
            message_id,
        } = self.config;

        let place = self
            .game
            .place
            .ok_or_else(|| Error::Config("game place is not set (GAME_PLACE)".to_string()))?;
        let place_id = PlaceId::parse(&place)?;

        let webhook_url = webhook_url
            .ok_or_else(|| Error::Config("webhook URL is not set (WEBHOOK_URL)".to_string()))?;
        let webhook_url = Url::parse(webhook_url.trim())?;
        if !matches!(webhook_url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "webhook URL must be http(s): {webhook_url}"
            )));
        }

        let message_id = message_id
            .filter(|id| !id.trim().is_empty())
            .map(|id| id.parse::<MessageId>())
            .transpose()?;

        if timeout_secs == 0 {
            return Err(Error::Config("timeout_secs must be at least 1".to_string()));
        }
        if min_interval_secs == 0 {
            return Err(Error::Config(
                "min_interval_secs must be at least 1".to_string(),
            ));
        }
        if max_interval_secs < min_interval_secs
            || max_interval_secs > MAX_INTERVAL_CEILING_SECS
        {
            return Err(Error::Config(format!(
                "max_interval_secs must be in [{min_interval_secs}, {MAX_INTERVAL_CEILING_SECS}]"
            )));
        }

        let retry = RetryPolicy::new(
            retry_max_attempts,
            Duration::from_millis(retry_base_delay_ms),
        )?;

        let endpoints = ApiEndpoints {
            universes: base_url(&self.api.universes_url)?,
            games: base_url(&self.api.games_url)?,
            thumbnails: base_url(&self.api.thumbnails_url)?,
        };

        let min_interval = Duration::from_secs(min_interval_secs);
        let max_interval = Duration::from_secs(max_interval_secs);
        let initial = Duration::from_secs(initial_interval_secs.unwrap_or(min_interval_secs));
        let initial_interval = initial.clamp(min_interval, max_interval);

        Ok(Settings {
            place_id,
            webhook_url,
            message_id,
            timeout: Duration::from_secs(timeout_secs),
            retry,
            min_interval,
            max_interval,
            initial_interval,
            endpoints,
        })
    }
}

fn default_path() -> Result<PathBuf, Error> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR).join("config.toml"))
        .ok_or_else(|| Error::Config("could not determine the config directory".to_string()))
}

fn env_var(key: &str) -> Result<Option<String>, Error> {
    match dotenvy::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(dotenvy::Error::EnvVar(std::env::VarError::NotPresent)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// Relative joins drop the last path segment unless the base ends with '/'.
fn base_url(raw: &str) -> Result<Url, Error> {
    let raw = raw.trim();
    if raw.ends_with('/') {
        Ok(Url::parse(raw)?)
    } else {
        Ok(Url::parse(&format!("{raw}/"))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().expect("Failed to create temp file");
        write!(temp_file, "{content}").expect("Failed to write to temp file");
        temp_file
    }

    #[test]
    fn test_load_config_from_toml() {
        let temp_file = write_config(
            r#"
            [config]
            timeout_secs = 10
            min_interval_secs = 5
            max_interval_secs = 120
            initial_interval_secs = 30
            retry_max_attempts = 3
            retry_base_delay_ms = 500
            webhook_url = "https://discord.com/api/webhooks/1234567890/abcdefg"
            message_id = "https://discord.com/channels/1/2/987654321"

            [game]
            place = "https://www.roblox.com/games/920587237/Adopt-Me"

            [api]
            games_url = "http://localhost:8080/games"
        "#,
        );

        let settings = Config::load_from(temp_file.path())
            .and_then(Config::into_settings)
            .expect("Failed to parse config");

        assert_eq!(settings.place_id, PlaceId(920_587_237));
        assert_eq!(
            settings.webhook_url.as_str(),
            "https://discord.com/api/webhooks/1234567890/abcdefg"
        );
        assert_eq!(
            settings.message_id.as_ref().map(MessageId::as_str),
            Some("987654321")
        );
        assert_eq!(settings.timeout, Duration::from_secs(10));
        assert_eq!(settings.min_interval, Duration::from_secs(5));
        assert_eq!(settings.max_interval, Duration::from_secs(120));
        assert_eq!(settings.initial_interval, Duration::from_secs(30));
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.base_delay, Duration::from_millis(500));
        assert_eq!(
            settings.endpoints.games.as_str(),
            "http://localhost:8080/games/"
        );
        assert_eq!(
            settings.endpoints.universes.as_str(),
            "https://apis.roproxy.com/"
        );
    }

    #[test]
    fn defaults_fill_missing_options() {
        let temp_file = write_config(
            r#"
            [config]
            webhook_url = "https://discord.com/api/webhooks/1/a"
            message_id = ""

            [game]
            place = "42"
        "#,
        );

        let settings = Config::load_from(temp_file.path())
            .and_then(Config::into_settings)
            .unwrap();

        assert_eq!(settings.place_id, PlaceId(42));
        assert!(settings.message_id.is_none());
        assert_eq!(settings.initial_interval, settings.min_interval);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.timeout, Duration::from_secs(15));
    }

    fn settings_with(options: ConfigOptions, place: &str) -> Result<Settings, Error> {
        Config {
            config: options,
            game: GameOptions {
                place: Some(place.to_string()),
            },
            api: ApiOptions::default(),
        }
        .into_settings()
    }

    fn valid_options() -> ConfigOptions {
        ConfigOptions {
            webhook_url: Some("https://discord.com/api/webhooks/1/a".to_string()),
            message_id: Some(String::new()),
            ..ConfigOptions::default()
        }
    }

    #[test]
    fn rejects_inverted_interval_bounds() {
        let options = ConfigOptions {
            min_interval_secs: 60,
            max_interval_secs: 10,
            ..valid_options()
        };
        assert!(matches!(settings_with(options, "1"), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_zero_base_delay() {
        let options = ConfigOptions {
            retry_base_delay_ms: 0,
            ..valid_options()
        };
        assert!(matches!(settings_with(options, "1"), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_non_http_webhook() {
        let options = ConfigOptions {
            webhook_url: Some("ftp://example.com/hook".to_string()),
            ..valid_options()
        };
        assert!(matches!(settings_with(options, "1"), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_malformed_place() {
        let catalog = settings_with(valid_options(), "https://www.roblox.com/catalog/1");
        assert!(catalog.is_err());
        assert!(settings_with(valid_options(), "0").is_err());
        assert!(settings_with(valid_options(), "not a url").is_err());
    }

    #[test]
    fn place_id_from_url_or_number() {
        assert_eq!(PlaceId::parse("123").unwrap(), PlaceId(123));
        assert_eq!(
            PlaceId::parse("https://www.roblox.com/games/606849621/Jailbreak").unwrap(),
            PlaceId(606_849_621)
        );
        assert_eq!(
            PlaceId::parse("https://www.roblox.com/games/606849621").unwrap(),
            PlaceId(606_849_621)
        );
    }
}
