//! Bus Configuration
//!
//! Tunables for the bus manager, with a parser for `key = value` text in
//! the same format as the boot configuration.

use crate::executor::CMD_RETRIES;
use crate::timing::IDENTIFY_FREQUENCY;
use core::fmt;

// =============================================================================
// CONFIGURATION STRUCTURES
// =============================================================================

/// Bus manager configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    /// Request tracing level (0-3)
    pub debug: u8,
    /// Promote per-card summaries and probe results to `info`
    pub verbose: bool,
    /// Retries for ordinary commands
    pub retries: u32,
    /// Card identification clock (Hz)
    pub identify_frequency: u32,
    /// (A)CMD41 / CMD1 polls before giving up on power-up
    pub op_cond_attempts: u32,
    /// Delay between op-cond polls (ms)
    pub op_cond_delay_ms: u32,
    /// CRC errors tolerated while polling for switch completion
    pub switch_crc_retries: u32,
    /// CMD6 timeout when EXT_CSD does not give one (us)
    pub default_cmd6_timeout_us: u32,
}

impl BusConfig {
    /// Create default configuration
    pub const fn new() -> Self {
        Self {
            debug: 0,
            verbose: false,
            retries: CMD_RETRIES,
            identify_frequency: IDENTIFY_FREQUENCY,
            op_cond_attempts: 1000,
            op_cond_delay_ms: 10,
            switch_crc_retries: 5,
            default_cmd6_timeout_us: 500 * 1000,
        }
    }

    /// Parse from string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::new();
        let mut section: Option<&str> = None;

        for line in content.lines() {
            let line = line.trim();

            // Skip comments and empty lines
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                if !line.ends_with(']') {
                    return Err(ConfigError::InvalidSyntax);
                }
                section = Some(line.trim_matches(|c| c == '[' || c == ']').trim());
                continue;
            }

            let (key, value) = parse_key_value(line).ok_or(ConfigError::InvalidSyntax)?;
            config.apply_setting(section, key, value)?;
        }

        Ok(config)
    }

    fn apply_setting(
        &mut self,
        section: Option<&str>,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        match section {
            None | Some("mmc") => match key {
                "debug" => {
                    self.debug = parse_u32(value)?.try_into().map_err(|_| ConfigError::InvalidValue)?;
                    if self.debug > 3 {
                        return Err(ConfigError::InvalidValue);
                    }
                }
                "verbose" => self.verbose = parse_bool(value)?,
                "retries" => self.retries = parse_u32(value)?,
                "identify_frequency" => {
                    self.identify_frequency = parse_u32(value)?;
                    if self.identify_frequency == 0 {
                        return Err(ConfigError::InvalidValue);
                    }
                }
                "op_cond_attempts" => self.op_cond_attempts = parse_u32(value)?,
                "op_cond_delay_ms" => self.op_cond_delay_ms = parse_u32(value)?,
                "switch_crc_retries" => self.switch_crc_retries = parse_u32(value)?,
                "default_cmd6_timeout_us" => self.default_cmd6_timeout_us = parse_u32(value)?,
                _ => return Err(ConfigError::UnknownKey),
            },
            Some(_) => return Err(ConfigError::UnknownSection),
        }
        Ok(())
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// PARSER
// =============================================================================

/// Parse key-value pair
fn parse_key_value(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.splitn(2, '=');
    let key = parts.next()?.trim();
    let value = parts.next()?.trim();
    if key.is_empty() {
        return None;
    }

    // Remove quotes
    let value = value.trim_matches('"').trim_matches('\'');

    Some((key, value))
}

/// Parse u32, decimal or `0x` hex
fn parse_u32(s: &str) -> Result<u32, ConfigError> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| ConfigError::InvalidValue)
}

/// Parse bool
fn parse_bool(s: &str) -> Result<bool, ConfigError> {
    const TRUE: [&str; 5] = ["true", "yes", "1", "on", "enabled"];
    const FALSE: [&str; 5] = ["false", "no", "0", "off", "disabled"];
    if TRUE.iter().any(|t| t.eq_ignore_ascii_case(s)) {
        Ok(true)
    } else if FALSE.iter().any(|f| f.eq_ignore_ascii_case(s)) {
        Ok(false)
    } else {
        Err(ConfigError::InvalidValue)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Configuration error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid syntax
    InvalidSyntax,
    /// Invalid value
    InvalidValue,
    /// Unknown key
    UnknownKey,
    /// Unknown section
    UnknownSection,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidSyntax => write!(f, "invalid syntax"),
            ConfigError::InvalidValue => write!(f, "invalid value"),
            ConfigError::UnknownKey => write!(f, "unknown key"),
            ConfigError::UnknownSection => write!(f, "unknown section"),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
