use crate::constants::DEFAULT_CONFIG_PATH;
use crate::error::{PredictError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub questions: QuestionLimits,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = PredictError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" => Ok(StorageBackend::Sqlite),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(PredictError::Config(format!(
                "unknown storage backend '{other}' (expected 'sqlite' or 'memory')"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: StorageBackend,
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            path: PathBuf::from("prediction_questions.db"),
        }
    }
}

/// Bounds on how many fresh questions one request may ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QuestionLimits {
    pub default_count: u32,
    pub min_count: u32,
    pub max_count: u32,
}

impl Default for QuestionLimits {
    fn default() -> Self {
        Self {
            default_count: 10,
            min_count: 1,
            max_count: 10,
        }
    }
}

impl QuestionLimits {
    pub fn validate(&self) -> Result<()> {
        if self.min_count == 0 {
            return Err(PredictError::Config("questions.min_count must be at least 1".to_string()));
        }
        if !(self.min_count <= self.default_count && self.default_count <= self.max_count) {
            return Err(PredictError::Config(format!(
                "question counts must satisfy min <= default <= max (got {} / {} / {})",
                self.min_count, self.default_count, self.max_count
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    pub file_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            file_name: "prediction_questions.log".to_string(),
        }
    }
}

fn env_override<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<()> {
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| PredictError::Config(format!("invalid value '{raw}' for {key}")))?;
    }
    Ok(())
}

impl Config {
    /// Load configuration: defaults, then the TOML file, then environment variables.
    ///
    /// An explicit `path` must exist; otherwise `config.toml` is read only when present.
    /// `.env` is loaded into the process environment first.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };

        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.questions.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PredictError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        env_override(&lookup, "SERVER_HOST", &mut self.server.host)?;
        env_override(&lookup, "PORT", &mut self.server.port)?;
        env_override(&lookup, "DATABASE_BACKEND", &mut self.database.backend)?;
        env_override(&lookup, "DATABASE_PATH", &mut self.database.path)?;
        env_override(&lookup, "DEFAULT_QUESTION_COUNT", &mut self.questions.default_count)?;
        env_override(&lookup, "MIN_QUESTION_COUNT", &mut self.questions.min_count)?;
        env_override(&lookup, "MAX_QUESTION_COUNT", &mut self.questions.max_count)?;
        env_override(&lookup, "LOG_DIR", &mut self.logging.directory)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.database.backend, StorageBackend::Sqlite);
        assert_eq!(config.questions, QuestionLimits::default());
        assert!(config.questions.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nport = 9100\n\n[database]\nbackend = \"memory\"\n\n[questions]\nmax_count = 25"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.database.backend, StorageBackend::Memory);
        assert_eq!(config.questions.max_count, 25);
        assert_eq!(config.questions.default_count, 10);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PORT", "9000"),
            ("DATABASE_BACKEND", "Memory"),
            ("DEFAULT_QUESTION_COUNT", "3"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env_with(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.database.backend, StorageBackend::Memory);
        assert_eq!(config.questions.default_count, 3);
    }

    #[test]
    fn test_invalid_env_value_is_config_error() {
        let mut config = Config::default();
        let err = config
            .apply_env_with(|k| (k == "PORT").then(|| "not-a-port".to_string()))
            .unwrap_err();
        assert!(matches!(err, PredictError::Config(msg) if msg.contains("PORT")));
    }

    #[test]
    fn test_limits_validation() {
        let bad = QuestionLimits {
            default_count: 20,
            min_count: 1,
            max_count: 10,
        };
        assert!(bad.validate().is_err());

        let zero = QuestionLimits {
            default_count: 1,
            min_count: 0,
            max_count: 1,
        };
        assert!(zero.validate().is_err());
    }
}
