//! Environment-driven settings.

use std::str::FromStr;

use crate::{
    agent::LoopConfig,
    client::Config,
    database::DatabaseConfig,
    errors::{Error, Result},
    DEFAULT_BASE_URL, DEFAULT_MODEL,
};

/// Default database when `DATABASE_URL` is unset.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://postgres@localhost:5433/nl_to_sql_db";

/// Settings read from the environment (or a `.env` file loaded beforehand).
///
/// Loop knobs left unset fall back to [`LoopConfig::default`].
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub database_url: String,
    pub max_turns: Option<usize>,
    pub parse_retry_limit: Option<usize>,
    pub row_limit: Option<usize>,
    pub read_only: Option<bool>,
    pub temperature: Option<f32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_turns: None,
            parse_retry_limit: None,
            row_limit: None,
            read_only: None,
            temperature: None,
        }
    }
}

impl Settings {
    /// Reads the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();
        Ok(Self {
            api_key: get("OPENAI_API_KEY"),
            model: get("OPENAI_MODEL").unwrap_or(defaults.model),
            base_url: get("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            max_turns: parse_opt("NL2SQL_MAX_TURNS", get("NL2SQL_MAX_TURNS"))?,
            parse_retry_limit: parse_opt(
                "NL2SQL_PARSE_RETRY_LIMIT",
                get("NL2SQL_PARSE_RETRY_LIMIT"),
            )?,
            row_limit: parse_opt("NL2SQL_ROW_LIMIT", get("NL2SQL_ROW_LIMIT"))?,
            read_only: get("NL2SQL_READ_ONLY")
                .map(|v| parse_bool("NL2SQL_READ_ONLY", &v))
                .transpose()?,
            temperature: parse_opt("NL2SQL_TEMPERATURE", get("NL2SQL_TEMPERATURE"))?,
        })
    }

    pub fn client_config(&self) -> Config {
        Config {
            api_key: self.api_key.clone(),
            model: Some(self.model.clone()),
            base_url: Some(self.base_url.clone()),
            ..Default::default()
        }
    }

    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig::new(self.database_url.clone())
    }

    pub fn loop_config(&self) -> LoopConfig {
        let mut cfg = LoopConfig::default();
        if let Some(max_turns) = self.max_turns {
            cfg = cfg.with_max_turns(max_turns);
        }
        if let Some(limit) = self.parse_retry_limit {
            cfg = cfg.with_parse_retry_limit(limit);
        }
        if let Some(row_limit) = self.row_limit {
            cfg = cfg.with_row_limit(row_limit);
        }
        if let Some(read_only) = self.read_only {
            cfg = cfg.with_read_only(read_only);
        }
        if let Some(temperature) = self.temperature {
            cfg = cfg.with_temperature(temperature);
        }
        cfg
    }
}

fn parse_opt<T>(key: &str, value: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|v| {
            v.parse::<T>()
                .map_err(|err| Error::Config(format!("{key}: invalid value '{v}': {err}")))
        })
        .transpose()
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!(
            "{key}: expected a boolean, got '{value}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(settings.model, "gpt-3.5-turbo");
        let cfg = settings.loop_config();
        assert_eq!(cfg.max_turns, crate::DEFAULT_MAX_TURNS);
        assert!(!cfg.read_only);
    }

    #[test]
    fn reads_overrides() {
        let settings = Settings::from_lookup(lookup(&[
            ("OPENAI_API_KEY", " sk-test "),
            ("OPENAI_MODEL", "gpt-4o-mini"),
            ("DATABASE_URL", "sqlite::memory:"),
            ("NL2SQL_MAX_TURNS", "6"),
            ("NL2SQL_ROW_LIMIT", "10"),
            ("NL2SQL_READ_ONLY", "yes"),
            ("NL2SQL_TEMPERATURE", "0.2"),
            ("NL2SQL_PARSE_RETRY_LIMIT", ""),
        ]))
        .unwrap();
        assert_eq!(settings.api_key.as_deref(), Some("sk-test"));
        assert_eq!(settings.parse_retry_limit, None);

        let cfg = settings.loop_config();
        assert_eq!(cfg.max_turns, 6);
        assert_eq!(cfg.row_limit, 10);
        assert!(cfg.read_only);
        assert!((cfg.model_temperature - 0.2).abs() < f32::EPSILON);

        let client = settings.client_config();
        assert_eq!(client.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(settings.database_config().url, "sqlite::memory:");
    }

    #[test]
    fn rejects_malformed_numbers_and_flags() {
        let err = Settings::from_lookup(lookup(&[("NL2SQL_MAX_TURNS", "lots")])).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("NL2SQL_MAX_TURNS")));
        let err = Settings::from_lookup(lookup(&[("NL2SQL_READ_ONLY", "maybe")])).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("boolean")));
    }
}
