//! Configuration file loading for rcage
//!
//! Handles loading and parsing configuration files using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};

use crate::config::{Config, ConfigError, ENV_PREFIX, EXAMPLE_CONFIG};

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::ReadFile {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file does not exist"),
            });
        }

        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load the layered configuration used by the CLI.
    ///
    /// Layers, lowest precedence first: embedded example, optional file,
    /// `RCAGE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            ConfigBuilder::builder().add_source(File::from_str(EXAMPLE_CONFIG, FileFormat::Toml));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::ReadFile {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "file does not exist",
                    ),
                });
            }
            builder = builder.add_source(File::from(path));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.interpreter.path.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "interpreter path must not be empty".to_owned(),
            ));
        }
        if self.interpreter.start_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "interpreter start_timeout_ms must be positive".to_owned(),
            ));
        }
        if self.pool.max_sessions == 0 {
            return Err(ConfigError::Invalid(
                "pool max_sessions must be at least 1".to_owned(),
            ));
        }
        if self.pool.reap_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "pool reap_interval_secs must be positive".to_owned(),
            ));
        }
        if self.session.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "session default_timeout_ms must be positive".to_owned(),
            ));
        }
        if self.validator.max_code_length == 0 {
            return Err(ConfigError::Invalid(
                "validator max_code_length must be positive".to_owned(),
            ));
        }
        if let Some(name) = self
            .validator
            .extra_denied_functions
            .iter()
            .find(|name| name.trim().is_empty())
        {
            return Err(ConfigError::Invalid(format!(
                "validator extra_denied_functions contains an empty name: {name:?}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = Config::parse_toml("").unwrap();
        assert_eq!(config.interpreter.path, "R");
        assert_eq!(config.pool.max_sessions, 5);
        assert_eq!(config.session.default_timeout_ms, 30_000);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[interpreter]
path = "/opt/R/bin/R"
args = ["--vanilla", "--no-echo"]
memory_limit = "1G"
start_timeout_ms = 2500

[interpreter.env]
LANG = "C.UTF-8"

[pool]
max_sessions = 12
idle_timeout_secs = 60
reap_interval_secs = 10

[session]
default_timeout_ms = 5000

[validator]
max_code_length = 2000
extra_allowed_packages = ["data.table"]
extra_denied_functions = ["Sys.time"]
"#;

        let config = Config::parse_toml(toml).unwrap();
        assert_eq!(config.interpreter.path, "/opt/R/bin/R");
        assert_eq!(config.interpreter.args, vec!["--vanilla", "--no-echo"]);
        assert_eq!(config.interpreter.memory_limit.to_string(), "1G");
        assert_eq!(config.interpreter.env["LANG"], "C.UTF-8");
        assert_eq!(config.pool.max_sessions, 12);
        assert_eq!(config.pool.idle_timeout_secs, 60);
        assert_eq!(config.pool.reap_interval_secs, 10);
        assert_eq!(config.session.default_timeout_ms, 5000);
        assert_eq!(config.validator.max_code_length, 2000);
        assert_eq!(config.validator.extra_allowed_packages, vec!["data.table"]);
        assert_eq!(config.validator.extra_denied_functions, vec!["Sys.time"]);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let toml = r#"
[pool]
max_sessions = 2
"#;
        let config = Config::parse_toml(toml).unwrap();
        assert_eq!(config.pool.max_sessions, 2);
        assert_eq!(config.pool.idle_timeout_secs, 300);
        assert_eq!(config.pool.reap_interval_secs, 60);
    }

    #[test]
    fn test_invalid_zero_sessions() {
        let toml = r#"
[pool]
max_sessions = 0
"#;
        assert!(matches!(
            Config::parse_toml(toml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_invalid_memory_limit() {
        let toml = r#"
[interpreter]
memory_limit = "lots"
"#;
        assert!(Config::parse_toml(toml).is_err());
    }

    #[test]
    fn test_invalid_empty_interpreter() {
        let toml = r#"
[interpreter]
path = "  "
"#;
        assert!(Config::parse_toml(toml).is_err());
    }

    #[test]
    fn test_invalid_zero_timeout() {
        let toml = r#"
[session]
default_timeout_ms = 0
"#;
        assert!(Config::parse_toml(toml).is_err());
    }

    #[test]
    fn test_from_file_missing() {
        let result = Config::from_file("/nonexistent/rcage.toml");
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }

    #[test]
    fn test_load_without_file_matches_example() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.pool.max_sessions, Config::default().pool.max_sessions);
    }
}
