//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::RelayConfig;
use crate::config::validation::{validate_config, ValidationError};
use crate::transform::ModuleRegistry;

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parse a configuration from TOML text without validating it.
pub fn parse_config(content: &str) -> Result<RelayConfig, ConfigError> {
    toml::from_str(content).map_err(ConfigError::Parse)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path, registry: &ModuleRegistry) -> Result<RelayConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    let config = parse_config(&content)?;

    validate_config(&config, registry).map_err(ConfigError::Validation)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_valid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [endpoint]
            bind_port = 0
            remote_address = "127.0.0.1"
            remote_port = 9000

            [[pipeline.client]]
            module = "uppercase"
            "#
        )
        .unwrap();

        let config = load_config(file.path(), &ModuleRegistry::with_builtins()).unwrap();
        assert_eq!(config.endpoint.remote_port, 9000);
        assert_eq!(config.pipeline.client[0].module, "uppercase");
    }

    #[test]
    fn reports_validation_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[endpoint]\nremote_port = 0\n").unwrap();

        let err = load_config(file.path(), &ModuleRegistry::with_builtins()).unwrap_err();
        match err {
            ConfigError::Validation(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn reports_parse_errors() {
        let err = parse_config("[endpoint\nbind_port = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn reports_missing_file() {
        let err = load_config(
            Path::new("/definitely/not/here.toml"),
            &ModuleRegistry::with_builtins(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
