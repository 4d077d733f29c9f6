//! # Commands and Requests
//!
//! A [`Request`] is one command, optionally with a data phase. The bridge
//! reports the outcome through a [`Completion`], which fires exactly once.

use core::fmt;
use spin::Once;

// =============================================================================
// Command
// =============================================================================

/// Expected response format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    /// No response
    None,
    /// Normal response (card status)
    R1,
    /// R1 followed by busy signalling on DAT0
    R1b,
    /// 136-bit CID/CSD
    R2,
    /// OCR, no CRC
    R3,
    /// Fast I/O
    R4,
    /// Interrupt request
    R5,
    /// Published RCA (SD)
    R6,
    /// Interface condition (SD)
    R7,
}

impl ResponseKind {
    /// Whether the response is 136 bits long
    pub const fn is_long(self) -> bool {
        matches!(self, ResponseKind::R2)
    }

    /// Whether the response carries a CRC the host should check
    pub const fn has_crc(self) -> bool {
        !matches!(self, ResponseKind::None | ResponseKind::R3 | ResponseKind::R4)
    }

    /// Whether the card signals busy after the response
    pub const fn is_busy(self) -> bool {
        matches!(self, ResponseKind::R1b)
    }
}

/// Command addressing class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandClass {
    /// Broadcast, no response
    Bc,
    /// Broadcast with response
    Bcr,
    /// Addressed, no data
    Ac,
    /// Addressed with data transfer
    Adtc,
}

/// A single bus command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// Command index (0-63)
    pub opcode: u8,
    /// 32-bit argument
    pub arg: u32,
    /// Response format
    pub response: ResponseKind,
    /// Addressing class
    pub class: CommandClass,
    /// Raw response words, most significant first. Short responses use `resp[0]`.
    pub resp: [u32; 4],
}

impl Command {
    /// A command with an empty response buffer
    pub const fn new(opcode: u8, arg: u32, response: ResponseKind, class: CommandClass) -> Self {
        Self { opcode, arg, response, class, resp: [0; 4] }
    }

    /// Response view
    pub const fn response(&self) -> Response {
        Response(self.resp)
    }
}

/// Raw response words with typed accessors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response(pub [u32; 4]);

impl Response {
    /// R1 card status word
    pub const fn status(&self) -> u32 {
        self.0[0]
    }

    /// R3 OCR
    pub const fn ocr(&self) -> u32 {
        self.0[0]
    }

    /// R6 published relative card address
    pub const fn rca(&self) -> u16 {
        (self.0[0] >> 16) as u16
    }

    /// R2 long response
    pub const fn long(&self) -> [u32; 4] {
        self.0
    }
}

// =============================================================================
// Data Phase
// =============================================================================

/// Buffer for the data phase of an ADTC command
#[derive(Debug)]
pub enum DataBuffer<'a> {
    /// Card to host
    Read(&'a mut [u8]),
    /// Host to card
    Write(&'a [u8]),
}

impl DataBuffer<'_> {
    /// Transfer length in bytes
    pub fn len(&self) -> usize {
        match self {
            DataBuffer::Read(buf) => buf.len(),
            DataBuffer::Write(buf) => buf.len(),
        }
    }

    /// Whether the transfer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A command plus optional data phase
#[derive(Debug)]
pub struct Request<'a> {
    /// The command
    pub cmd: Command,
    /// Data phase
    pub data: Option<DataBuffer<'a>>,
}

impl<'a> Request<'a> {
    /// Command-only request
    pub const fn new(cmd: Command) -> Self {
        Self { cmd, data: None }
    }

    /// Request with a data phase
    pub fn with_data(cmd: Command, data: DataBuffer<'a>) -> Self {
        Self { cmd, data: Some(data) }
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// Result type for command execution
pub type CommandResult<T = ()> = Result<T, CommandError>;

/// Command failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandError {
    /// No response within the command timeout
    Timeout,
    /// Response or data CRC mismatch
    BadCrc,
    /// FIFO overrun or underrun
    Fifo,
    /// Generic failure
    Failed,
    /// The request was malformed
    Invalid,
    /// Out of resources
    NoMemory,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Timeout => write!(f, "timeout"),
            CommandError::BadCrc => write!(f, "bad CRC"),
            CommandError::Fifo => write!(f, "FIFO error"),
            CommandError::Failed => write!(f, "failed"),
            CommandError::Invalid => write!(f, "invalid request"),
            CommandError::NoMemory => write!(f, "out of memory"),
        }
    }
}

/// One-shot completion signal for a request
pub struct Completion {
    outcome: Once<CommandResult>,
}

impl Completion {
    /// Unsignalled completion
    pub const fn new() -> Self {
        Self { outcome: Once::new() }
    }

    /// Signal the outcome. Returns `false` if it was already signalled.
    pub fn complete(&self, outcome: CommandResult) -> bool {
        let mut first = false;
        self.outcome.call_once(|| {
            first = true;
            outcome
        });
        if !first {
            log::error!("mmc: request completed twice");
            debug_assert!(first, "request completed twice");
        }
        first
    }

    /// Whether the outcome is available
    pub fn is_complete(&self) -> bool {
        self.outcome.is_completed()
    }

    /// The signalled outcome, if any
    pub fn outcome(&self) -> Option<CommandResult> {
        self.outcome.get().copied()
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("outcome", &self.outcome()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_once() {
        let done = Completion::new();
        assert!(!done.is_complete());
        assert_eq!(done.outcome(), None);
        assert!(done.complete(Err(CommandError::BadCrc)));
        assert!(done.is_complete());
        assert_eq!(done.outcome(), Some(Err(CommandError::BadCrc)));
    }

    #[test]
    fn test_response_fields() {
        let resp = Response([0x0004_0500, 0, 0, 0]);
        assert_eq!(resp.rca(), 4);
        assert_eq!(resp.status(), 0x0004_0500);
        assert!(ResponseKind::R2.is_long());
        assert!(!ResponseKind::R3.has_crc());
        assert!(ResponseKind::R1b.is_busy());
    }
}
