//! # Helix MMC HAL - Host Bridge Abstraction
//!
//! This crate defines the contract between the MMC/SD bus manager and the
//! host controller ("bridge") that actually drives the CMD/DAT lines.
//!
//! ## Design Philosophy
//!
//! The bridge is deliberately dumb:
//! - **Commands**: it runs one [`Request`] at a time and signals its
//!   [`Completion`] exactly once
//! - **Settings**: electrical and timing parameters are staged in an [`Ios`]
//!   block and pushed in one batch through [`MmcBridge::update_ios`]
//! - **Capabilities**: host limits are read-only queries
//!
//! Everything protocol-related (discovery, negotiation, card selection) lives
//! in the bus manager, never in a bridge.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod caps;
pub mod ios;
pub mod request;

pub use caps::{HostCaps, ocr};
pub use ios::{BusTiming, BusWidth, ChipSelect, Ios, PowerMode, SignalMode, Vccq};
pub use request::{
    Command, CommandClass, CommandError, CommandResult, Completion, DataBuffer, Request,
    Response, ResponseKind,
};

use core::fmt;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors reported by a host bridge outside of command completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeError {
    /// The operation is not supported by this controller
    NotSupported,
    /// A setting or request field is out of range for the controller
    InvalidParameter,
    /// The controller reported a hardware fault
    HardwareError,
    /// The controller is busy with another request
    ResourceBusy,
    /// The controller did not finish the operation in time
    Timeout,
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::NotSupported => write!(f, "operation not supported"),
            BridgeError::InvalidParameter => write!(f, "invalid parameter"),
            BridgeError::HardwareError => write!(f, "hardware error"),
            BridgeError::ResourceBusy => write!(f, "bridge busy"),
            BridgeError::Timeout => write!(f, "bridge timeout"),
        }
    }
}

/// The host bridge contract consumed by the bus manager
///
/// Implementations must be shareable between the context running discovery
/// and the block layer issuing transfers, hence `Send + Sync`.
pub trait MmcBridge: Send + Sync {
    /// Start `req`.
    ///
    /// The bridge fills `req.cmd.resp` (and the read buffer, if any) and then
    /// signals `done` exactly once with the command outcome. Synchronous
    /// bridges may signal before returning; others do so from
    /// [`MmcBridge::service`]. An `Err` here means the request was never
    /// started and `done` will not fire.
    fn request(&self, req: &mut Request<'_>, done: &Completion) -> BridgeResult<()>;

    /// Make progress on a started request while the issuer waits for `done`.
    ///
    /// Interrupt-driven bridges sleep here until their completion path runs.
    fn service(&self, req: &mut Request<'_>, done: &Completion) {
        let _ = (req, done);
        core::hint::spin_loop();
    }

    /// Apply a complete set of bus settings
    fn update_ios(&self, ios: &Ios) -> BridgeResult<()>;

    /// Switch the I/O signalling voltage to `ios.vccq`
    fn switch_vccq(&self, ios: &Ios) -> BridgeResult<()>;

    /// Run initial sampling-point tuning at the current settings
    fn tune(&self, hs400: bool) -> BridgeResult<()> {
        let _ = hs400;
        Ok(())
    }

    /// Block until the host controller is available to this bus.
    ///
    /// This is the serialization point between competing bus owners; it must
    /// put the caller to sleep rather than spin.
    fn acquire_host(&self) -> BridgeResult<()>;

    /// Give the host controller back, waking one blocked acquirer
    fn release_host(&self) -> BridgeResult<()>;

    /// Card-detect pin (true when a card is inserted)
    fn card_detect(&self) -> bool {
        true
    }

    /// Write-protect switch (true when the card is read-only)
    fn write_protect(&self) -> bool;

    /// Host capability bitmap
    fn caps(&self) -> HostCaps;

    /// Voltage window supported by the host, in OCR bit layout
    fn host_ocr(&self) -> u32;

    /// Lowest clock the host can generate (Hz)
    fn f_min(&self) -> u32;

    /// Highest clock the host can generate (Hz)
    fn f_max(&self) -> u32;

    /// Largest single transfer, in 512-byte sectors
    fn max_data(&self) -> u32;

    /// Longest busy period the host can wait for in hardware (us), 0 if unknown
    fn max_busy_timeout(&self) -> u32 {
        0
    }

    /// Busy-wait or sleep for `us` microseconds
    fn delay_us(&self, us: u32);
}
