use thiserror::Error;

/// Default number of elements in one allocation unit.
pub const DEFAULT_ALLOCATION_UNIT: usize = 256;

/// Default host column alignment in elements (32 bytes of `f32`).
pub const DEFAULT_HOST_COLUMN_ALIGNMENT: usize = 8;

/// An error type for pool configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// A size parameter was zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// An environment variable could not be parsed.
    #[error("Invalid value {value:?} for {key}")]
    InvalidEnv {
        /// Environment variable name
        key: &'static str,
        /// The rejected value
        value: String,
    },
}

/// Configuration of a [`crate::MemoryManager`].
///
/// # Fields
///
/// * `allocation_unit` - Size classes are multiples of this many elements.
/// * `host_column_alignment` - Host rows are padded to a multiple of this many elements.
/// * `accelerator_devices` - Number of devices served by the default accelerator backend.
/// * `accelerator_capacity_bytes` - Optional per-device memory limit of the simulated accelerator.
/// * `zero_reused_chunks` - Zero a chunk's contents when it is handed out again from the free pool.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Size classes are multiples of this many elements.
    pub allocation_unit: usize,
    /// Host rows are padded to a multiple of this many elements.
    pub host_column_alignment: usize,
    /// Number of devices served by the default accelerator backend.
    pub accelerator_devices: usize,
    /// Optional per-device memory limit of the simulated accelerator.
    pub accelerator_capacity_bytes: Option<usize>,
    /// Zero a chunk's contents when it is reused from the free pool.
    pub zero_reused_chunks: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            allocation_unit: DEFAULT_ALLOCATION_UNIT,
            host_column_alignment: DEFAULT_HOST_COLUMN_ALIGNMENT,
            accelerator_devices: 1,
            accelerator_capacity_bytes: None,
            zero_reused_chunks: false,
        }
    }
}

impl PoolConfig {
    /// Builds a configuration from the defaults overridden by `STRATA_*`
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed, or if the
    /// resulting configuration is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`PoolConfig::from_env`] with a custom variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, "STRATA_ALLOCATION_UNIT")? {
            config.allocation_unit = v;
        }
        if let Some(v) = parse_var(&lookup, "STRATA_HOST_COLUMN_ALIGNMENT")? {
            config.host_column_alignment = v;
        }
        if let Some(v) = parse_var(&lookup, "STRATA_ACCELERATOR_DEVICES")? {
            config.accelerator_devices = v;
        }
        if let Some(v) = parse_var(&lookup, "STRATA_ACCELERATOR_CAPACITY_BYTES")? {
            config.accelerator_capacity_bytes = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "STRATA_ZERO_REUSED_CHUNKS")? {
            config.zero_reused_chunks = v;
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks that every size parameter is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allocation_unit == 0 {
            return Err(ConfigError::Zero("allocation_unit"));
        }
        if self.host_column_alignment == 0 {
            return Err(ConfigError::Zero("host_column_alignment"));
        }
        Ok(())
    }

    /// Rounds `len` up to its size class. A zero request takes one unit.
    ///
    /// Returns `None` if the class does not fit in `usize` or the unit is zero.
    pub fn size_class(&self, len: usize) -> Option<usize> {
        len.max(1).checked_next_multiple_of(self.allocation_unit)
    }

    /// Rounds a column count up to the host row stride.
    ///
    /// Returns `None` if the stride does not fit in `usize` or the alignment
    /// is zero.
    pub fn padded_cols(&self, cols: usize) -> Option<usize> {
        cols.checked_next_multiple_of(self.host_column_alignment)
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value }),
    }
}
