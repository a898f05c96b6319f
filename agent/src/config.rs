//! Configuration types for the profiling engine

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ProfilerError, Result};

/// Maximum number of profiles that may be recorded at the same time.
pub const DEFAULT_MAX_SIMULTANEOUS_PROFILES: usize = 100;

/// Queue depth at which the events processor starts warning about backlog.
pub const DEFAULT_PROCESSOR_QUEUE_WARN: usize = 10_000;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Upper bound on concurrently active profiling sessions
    pub max_simultaneous_profiles: usize,

    /// Attribute samples with no symbolized frame to a VM-state bucket
    /// such as "(program)" or "(garbage collector)" instead of the root
    pub attribute_vm_state: bool,

    /// Whether sessions record the sample timeline unless told otherwise
    pub record_samples: bool,

    /// Backlog size above which the events processor logs a warning
    pub processor_queue_warn: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            max_simultaneous_profiles: DEFAULT_MAX_SIMULTANEOUS_PROFILES,
            attribute_vm_state: true,
            record_samples: false,
            processor_queue_warn: DEFAULT_PROCESSOR_QUEUE_WARN,
        }
    }
}

impl ProfilerConfig {
    /// Load configuration from defaults, an optional file and `APERTURE_*`
    /// environment variables, in increasing order of precedence.
    ///
    /// Without an explicit path, `aperture.toml` (or any other format the
    /// `config` crate understands under that stem) is read if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Self::default();
        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name("aperture").required(false),
        };

        let settings = config::Config::builder()
            .set_default(
                "max_simultaneous_profiles",
                defaults.max_simultaneous_profiles as i64,
            )?
            .set_default("attribute_vm_state", defaults.attribute_vm_state)?
            .set_default("record_samples", defaults.record_samples)?
            .set_default("processor_queue_warn", defaults.processor_queue_warn as i64)?
            .add_source(file)
            .add_source(config::Environment::with_prefix("APERTURE").try_parsing(true))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_simultaneous_profiles == 0 {
            return Err(ProfilerError::InvalidConfig(
                "max_simultaneous_profiles must be greater than 0".to_string(),
            ));
        }

        if self.processor_queue_warn == 0 {
            return Err(ProfilerError::InvalidConfig(
                "processor_queue_warn must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
