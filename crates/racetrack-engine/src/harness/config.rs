//! Harness configuration (TOML)

use crate::error::HarnessError;
use crate::event_loop::EventLoopOptions;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Number of concurrent worker threads
pub const DEFAULT_THREADS: usize = 2;
/// Operations per worker
pub const DEFAULT_ROUNDS: usize = 2;

/// Harness settings; every field is optional in the file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Worker threads sharing the loop
    pub threads: usize,
    /// Rounds per worker
    pub rounds: usize,
    /// Seed for random choices; entropy when absent
    pub seed: Option<u64>,
    /// Independent runs (each with a fresh loop) for random mode
    pub iterations: usize,
    /// Write a byte to the peer descriptor after subscribing
    pub poke: bool,
    /// Readiness events fetched per poll
    pub event_capacity: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            rounds: DEFAULT_ROUNDS,
            seed: None,
            iterations: 1,
            poke: true,
            event_capacity: 1024,
        }
    }
}

impl HarnessConfig {
    /// Parse from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, HarnessError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML file
    pub fn load(path: &Path) -> Result<Self, HarnessError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Event loop options derived from this config
    pub fn loop_options(&self) -> EventLoopOptions {
        EventLoopOptions {
            event_capacity: self.event_capacity,
            ..EventLoopOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(HarnessConfig::from_toml_str("").unwrap(), HarnessConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config = HarnessConfig::from_toml_str("threads = 8\nseed = 99\npoke = false").unwrap();
        assert_eq!(config.threads, 8);
        assert_eq!(config.rounds, DEFAULT_ROUNDS);
        assert_eq!(config.seed, Some(99));
        assert!(!config.poke);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = HarnessConfig::from_toml_str("thread = 3").unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "rounds = 6\niterations = 10").unwrap();
        let config = HarnessConfig::load(file.path()).unwrap();
        assert_eq!(config.rounds, 6);
        assert_eq!(config.iterations, 10);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = HarnessConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, HarnessError::Io(_)));
    }
}
