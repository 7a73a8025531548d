//! Runtime options.
//!
//! Options come from the `SHADOWHEAP_OPTIONS` environment variable as
//! `key=value` pairs separated by `:`, `,` or whitespace, for example
//! `SHADOWHEAP_OPTIONS=redzone=64:quarantine_size=0x100000:halt_on_free_error=0`.
//! Integers are decimal or `0x` hex; booleans are `0/1/true/false/yes/no`.

use thiserror::Error;

use crate::fake_stack::{MAX_STACK_SIZE_LOG, MIN_STACK_SIZE_LOG};
use crate::redzone::RedzoneOptions;
use crate::report::OPTIONS_ENV;
use crate::size_class::SizeClassMap;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown option '{0}'")]
    UnknownOption(String),
    #[error("option '{key}' has invalid value '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("malformed option '{0}' (expected key=value)")]
    Malformed(String),
    #[error("redzone {0} must be a power of two in 32..=2048")]
    InvalidRedzone(usize),
    #[error("option '{key}' = {value} outside {min}..={max}")]
    OutOfRange {
        key: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

/// Frames the stack collaborator may be asked for.
pub const MAX_MALLOC_CONTEXT_SIZE: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub redzone: usize,
    pub quarantine_size: usize,
    pub thread_quarantine_size: usize,
    pub max_malloc_fill_size: usize,
    pub malloc_fill_byte: u8,
    pub alloc_dealloc_mismatch: bool,
    pub allow_user_poisoning: bool,
    pub halt_on_free_error: bool,
    pub exitcode: i32,
    pub use_fake_stack: bool,
    pub fake_stack_size_log: u32,
    pub malloc_context_size: usize,
    pub verbosity: u32,
    pub region_size_log: u32,
    pub secondary_space_log: u32,
    /// Use the 32-class map (sizes up to 32 KiB) instead of the default one.
    pub compact_size_classes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redzone: 128,
            quarantine_size: 1 << 28,
            thread_quarantine_size: 1 << 20,
            max_malloc_fill_size: 0,
            malloc_fill_byte: 0xbe,
            alloc_dealloc_mismatch: true,
            allow_user_poisoning: true,
            halt_on_free_error: true,
            exitcode: 1,
            use_fake_stack: true,
            fake_stack_size_log: 18,
            malloc_context_size: MAX_MALLOC_CONTEXT_SIZE,
            verbosity: 0,
            region_size_log: 32,
            secondary_space_log: 36,
            compact_size_classes: false,
        }
    }
}

fn parse_uint(key: &str, value: &str) -> Result<u64, ConfigError> {
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn narrow<T: TryFrom<u64>>(key: &str, value: &str, raw: u64) -> Result<T, ConfigError> {
    T::try_from(raw).map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn check_range(key: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            key,
            value,
            min,
            max,
        })
    }
}

impl Config {
    /// Defaults overridden by `options`, validated.
    pub fn parse(options: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_options(options)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `SHADOWHEAP_OPTIONS`, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::parse(&std::env::var(OPTIONS_ENV).unwrap_or_default())
    }

    /// Applies every `key=value` pair in `options` without validating.
    pub fn apply_options(&mut self, options: &str) -> Result<(), ConfigError> {
        for pair in options
            .split(|c: char| c == ':' || c == ',' || c.is_whitespace())
            .filter(|pair| !pair.is_empty())
        {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::Malformed(pair.to_string()))?;
            self.set(key.trim(), value.trim())?;
        }
        Ok(())
    }

    /// Sets one option from its textual value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "redzone" => self.redzone = narrow(key, value, parse_uint(key, value)?)?,
            "quarantine_size" => self.quarantine_size = narrow(key, value, parse_uint(key, value)?)?,
            "thread_quarantine_size" => {
                self.thread_quarantine_size = narrow(key, value, parse_uint(key, value)?)?;
            }
            "max_malloc_fill_size" => {
                self.max_malloc_fill_size = narrow(key, value, parse_uint(key, value)?)?;
            }
            "malloc_fill_byte" => self.malloc_fill_byte = narrow(key, value, parse_uint(key, value)?)?,
            "alloc_dealloc_mismatch" => self.alloc_dealloc_mismatch = parse_bool(key, value)?,
            "allow_user_poisoning" => self.allow_user_poisoning = parse_bool(key, value)?,
            "halt_on_free_error" => self.halt_on_free_error = parse_bool(key, value)?,
            "exitcode" => {
                self.exitcode = value.parse().map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "use_fake_stack" => self.use_fake_stack = parse_bool(key, value)?,
            "fake_stack_size_log" => {
                self.fake_stack_size_log = narrow(key, value, parse_uint(key, value)?)?;
            }
            "malloc_context_size" => {
                self.malloc_context_size = narrow(key, value, parse_uint(key, value)?)?;
            }
            "verbosity" => self.verbosity = narrow(key, value, parse_uint(key, value)?)?,
            "region_size_log" => self.region_size_log = narrow(key, value, parse_uint(key, value)?)?,
            "secondary_space_log" => {
                self.secondary_space_log = narrow(key, value, parse_uint(key, value)?)?;
            }
            "compact_size_classes" => self.compact_size_classes = parse_bool(key, value)?,
            _ => return Err(ConfigError::UnknownOption(key.to_string())),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.redzone.is_power_of_two() || !(32..=2048).contains(&self.redzone) {
            return Err(ConfigError::InvalidRedzone(self.redzone));
        }
        check_range(
            "fake_stack_size_log",
            self.fake_stack_size_log.into(),
            MIN_STACK_SIZE_LOG.into(),
            MAX_STACK_SIZE_LOG.into(),
        )?;
        check_range(
            "malloc_context_size",
            self.malloc_context_size as u64,
            0,
            MAX_MALLOC_CONTEXT_SIZE as u64,
        )?;
        check_range("region_size_log", self.region_size_log.into(), 20, 36)?;
        check_range("secondary_space_log", self.secondary_space_log.into(), 24, 40)?;
        Ok(())
    }

    #[must_use]
    pub fn size_class_map(&self) -> SizeClassMap {
        if self.compact_size_classes {
            SizeClassMap::compact()
        } else {
            SizeClassMap::default_map()
        }
    }

    #[must_use]
    pub const fn redzone_options(&self) -> RedzoneOptions {
        RedzoneOptions {
            redzone: self.redzone,
            max_malloc_fill_size: self.max_malloc_fill_size,
            malloc_fill_byte: self.malloc_fill_byte,
            alloc_dealloc_mismatch: self.alloc_dealloc_mismatch,
            halt_on_free_error: self.halt_on_free_error,
        }
    }
}
