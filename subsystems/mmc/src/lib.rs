//! # Helix MMC Subsystem
//!
//! The MMC/SD bus manager:
//! - Power-up and SD/MMC mode probing
//! - Card discovery and relative address assignment
//! - Register fetch and decode (CID, CSD, SCR, SD_STATUS, EXT_CSD)
//! - Bus width, timing, VCCQ and power class negotiation
//! - Bus ownership and card selection
//!
//! ## Layering
//!
//! ```text
//! MmcBus (bus, negotiate)
//!   ├── CardRegistry (registry) ── Card (card)
//!   ├── command wrappers (ops)
//!   │     └── Executor (executor) ── MmcBridge (helix-mmc-hal)
//!   └── pure decoders (regs, timing)
//! ```
//!
//! The host controller itself is behind [`helix_mmc_hal::MmcBridge`] and is
//! never touched directly.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod bus;
pub mod card;
pub mod config;
pub mod executor;
pub mod ops;
pub mod registry;
pub mod regs;
pub mod timing;

#[cfg(test)]
mod testing;


pub use bus::{BusMode, BusOwner, BusState, CardInfo, MmcBus};
pub use card::{Card, CardHandle, CardKind, Quirks};
pub use config::{BusConfig, ConfigError};
pub use executor::CMD_RETRIES;

use core::fmt;
use helix_mmc_hal::{BridgeError, CommandError};

/// Bus manager result type
pub type MmcResult<T> = Result<T, MmcError>;

/// Bus manager errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmcError {
    /// A command failed after its retries
    Command(CommandError),
    /// The bridge refused a settings change
    Bridge(BridgeError),
    /// The card is password protected
    CardLocked,
    /// The card or host lacks a required capability
    Unsupported,
    /// The card published an unusable relative address
    InvalidRca,
    /// No card answered with a compatible voltage window
    NoCompatibleCards,
    /// No card with that address
    CardNotFound,
    /// The handle refers to a card that has since been replaced
    StaleHandle,
}

impl fmt::Display for MmcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmcError::Command(err) => write!(f, "command failed: {}", err),
            MmcError::Bridge(err) => write!(f, "bridge error: {}", err),
            MmcError::CardLocked => write!(f, "card is locked"),
            MmcError::Unsupported => write!(f, "unsupported"),
            MmcError::InvalidRca => write!(f, "invalid relative card address"),
            MmcError::NoCompatibleCards => write!(f, "no compatible cards found"),
            MmcError::CardNotFound => write!(f, "card not found"),
            MmcError::StaleHandle => write!(f, "stale card handle"),
        }
    }
}

impl From<CommandError> for MmcError {
    fn from(err: CommandError) -> Self {
        MmcError::Command(err)
    }
}

impl From<BridgeError> for MmcError {
    fn from(err: BridgeError) -> Self {
        MmcError::Bridge(err)
    }
}

impl MmcError {
    /// Whether the failure was a command timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, MmcError::Command(CommandError::Timeout))
    }
}
