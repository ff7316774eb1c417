use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Error type for loading, saving and validating run settings.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read or write settings file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML settings file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize settings to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid setting '{field}': {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

/// Tunables of one LD computation run. Every field has a default, so a settings file
/// only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LdSettings {
    /// Largest distance in base pairs between two variants whose LD is computed.
    pub max_distance: u32,
    /// Smallest r² written to the matrix.
    pub min_r2: f64,
    /// How far beyond the required span the genotype window refills and evicts.
    pub loading_factor: f64,
    /// Number of worker threads.
    pub threads: usize,
    /// Wall-clock budget of a run.
    pub timeout_days: u64,
    /// Records pulled from the stream per refill batch.
    pub batch_size: usize,
    /// Variants below this minor allele frequency are skipped.
    pub min_allele_frequency: f64,
    /// Capacity of the queue between the workers and the writer thread.
    pub channel_bound: usize,
}

impl Default for LdSettings {
    fn default() -> Self {
        Self {
            max_distance: 500_000,
            min_r2: 0.05,
            loading_factor: 2.0,
            threads: num_cpus::get(),
            timeout_days: 365,
            batch_size: 1024,
            min_allele_frequency: 0.0,
            channel_bound: 8192,
        }
    }
}

impl LdSettings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let text = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_days.saturating_mul(SECONDS_PER_DAY))
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |field, message: &str| {
            Err(SettingsError::Invalid {
                field,
                message: message.to_string(),
            })
        };
        if self.max_distance == 0 {
            return invalid("max_distance", "must be positive");
        }
        if !(0.0..=1.0).contains(&self.min_r2) {
            return invalid("min_r2", "must lie in [0, 1]");
        }
        if !(self.loading_factor >= 1.0 && self.loading_factor.is_finite()) {
            return invalid("loading_factor", "must be a finite value of at least 1");
        }
        if self.threads == 0 {
            return invalid("threads", "must be at least 1");
        }
        if self.timeout_days == 0 {
            return invalid("timeout_days", "must be at least 1");
        }
        if self.batch_size == 0 {
            return invalid("batch_size", "must be at least 1");
        }
        if !(0.0..=0.5).contains(&self.min_allele_frequency) {
            return invalid("min_allele_frequency", "must lie in [0, 0.5]");
        }
        if self.channel_bound == 0 {
            return invalid("channel_bound", "must be at least 1");
        }
        Ok(())
    }
}
