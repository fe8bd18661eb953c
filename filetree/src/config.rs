//! Engine configuration for the demo driver.
//!
//! # Environment Variables
//!
//! - `FILETREE_DEGREE`: B-tree degree (default: `4`, minimum: `2`)
//! - `FILETREE_STORAGE_CAPACITY`: storage capacity in bytes
//!   (default: `1048576`)
//! - `FILETREE_SIM_SEED`: seed for the demo simulation run (default: `42`)

/// Configuration for the demo driver and simulation defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// B-tree degree used for the demo file.
    pub degree: usize,
    /// Capacity of the in-memory storage in bytes.
    pub storage_capacity: u64,
    /// Seed for the demo simulation run.
    pub sim_seed: u64,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl EngineConfig {
    /// Default B-tree degree.
    pub const DEFAULT_DEGREE: usize = 4;
    /// Default storage capacity (1 MiB).
    pub const DEFAULT_STORAGE_CAPACITY: u64 = 1 << 20;
    /// Default simulation seed.
    pub const DEFAULT_SIM_SEED: u64 = 42;

    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but does not parse, or if the
    /// degree is below 2.
    pub fn from_env() -> Result<Self, ConfigError> {
        let degree = parse_var(
            "FILETREE_DEGREE",
            std::env::var("FILETREE_DEGREE").ok().as_deref(),
            Self::DEFAULT_DEGREE,
        )?;
        if degree < 2 {
            return Err(ConfigError::InvalidValue {
                name: "FILETREE_DEGREE".to_string(),
                message: format!("degree {degree} is below the minimum of 2"),
            });
        }
        let storage_capacity = parse_var(
            "FILETREE_STORAGE_CAPACITY",
            std::env::var("FILETREE_STORAGE_CAPACITY").ok().as_deref(),
            Self::DEFAULT_STORAGE_CAPACITY,
        )?;
        let sim_seed = parse_var(
            "FILETREE_SIM_SEED",
            std::env::var("FILETREE_SIM_SEED").ok().as_deref(),
            Self::DEFAULT_SIM_SEED,
        )?;

        Ok(Self {
            degree,
            storage_capacity,
            sim_seed,
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            degree: Self::DEFAULT_DEGREE,
            storage_capacity: Self::DEFAULT_STORAGE_CAPACITY,
            sim_seed: Self::DEFAULT_SIM_SEED,
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    name: &str,
    raw: Option<&str>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("could not parse '{value}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_uses_default_when_unset() {
        assert_eq!(parse_var("X", None, 7_usize).unwrap(), 7);
    }

    #[test]
    fn test_parse_var_parses_set_values() {
        assert_eq!(parse_var("X", Some("12"), 7_usize).unwrap(), 12);
        assert_eq!(parse_var("X", Some(" 12 "), 7_usize).unwrap(), 12);
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        let result = parse_var("X", Some("twelve"), 7_usize);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.degree >= 2);
        assert!(config.storage_capacity > 0);
    }
}
