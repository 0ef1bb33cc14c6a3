use std::{env, fs::read_to_string, net::IpAddr, path::Path};

use serde::Deserialize;

pub const DEFAULT_PATH: &str = "aegis.toml";

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub discord: DiscordConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
    pub leveling: LevelingConfig,
    pub antinuke: AntinukeConfig,
    pub automod: AutomodConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct DiscordConfig {
    pub token: String,
    pub default_prefix: String,
    /// Fixed shard count; autosharded when unset.
    pub shards: Option<u32>,
    pub owners: Vec<u64>,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            default_prefix: ",".to_string(),
            shards: None,
            owners: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:aegis.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub address: IpAddr,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: IpAddr::from([127, 0, 0, 1]),
            port: 3000,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct LevelingConfig {
    pub xp_min: u32,
    pub xp_max: u32,
    pub cooldown_secs: u64,
}

impl Default for LevelingConfig {
    fn default() -> Self {
        Self {
            xp_min: 15,
            xp_max: 25,
            cooldown_secs: 60,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct AntinukeConfig {
    pub window_secs: u64,
    /// Audit log entries older than this are not attributed to an event.
    pub audit_max_age_secs: i64,
}

impl Default for AntinukeConfig {
    fn default() -> Self {
        Self {
            window_secs: 10,
            audit_max_age_secs: 10,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct AutomodConfig {
    pub spam_window_secs: u64,
    pub spam_count: usize,
    pub raid_window_secs: u64,
}

impl Default for AutomodConfig {
    fn default() -> Self {
        Self {
            spam_window_secs: 5,
            spam_count: 5,
            raid_window_secs: 10,
        }
    }
}

impl Config {
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, Error> {
        Ok(toml::from_str::<Self>(content)?)
    }

    /// Reads the file named by `AEGIS_CONFIG` (or `aegis.toml` when present),
    /// then applies `DISCORD_TOKEN` and `DATABASE_URL` from the environment.
    pub fn load() -> Result<Self, Error> {
        let path = env::var("AEGIS_CONFIG").unwrap_or_else(|_| DEFAULT_PATH.to_string());
        let mut config = if Path::new(&path).exists() {
            Self::read_from_file(&path)?
        } else {
            Self::default()
        };

        if let Ok(token) = env::var("DISCORD_TOKEN") {
            config.discord.token = token;
        }
        if let Ok(url) = env::var("DATABASE_URL") {
            config.database.url = url;
        }

        if config.discord.token.is_empty() {
            return Err(Error::MissingToken);
        }
        Ok(config)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read configuration file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("no Discord token configured (set DISCORD_TOKEN or discord.token)")]
    MissingToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.discord.default_prefix, ",");
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.leveling.xp_min, 15);
        assert_eq!(config.antinuke.window_secs, 10);
        assert!(config.api.enabled);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [discord]
            default_prefix = "!"
            owners = [1, 2]

            [api]
            port = 8080
            "#,
        )
        .unwrap();
        assert_eq!(config.discord.default_prefix, "!");
        assert_eq!(config.discord.owners, vec![1, 2]);
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.api.address, IpAddr::from([127, 0, 0, 1]));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Config::from_toml("[discord]\nprefix = \"!\"").unwrap_err();
        assert!(matches!(err, Error::Toml(_)));
    }
}
