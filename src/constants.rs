/// Header carrying the caller's identity on user-scoped endpoints
pub const USERNAME_HEADER: &str = "username";

/// Name reported by the health endpoint and used as the default log target
pub const SERVICE_NAME: &str = "prediction_questions";

/// Configuration file read from the working directory when present
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
