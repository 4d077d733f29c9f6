//! # Command Executor
//!
//! Blocking request/response on top of the bridge's submit-and-complete
//! model. Retries live here and nowhere else.
//!
//! Probes that expect failures wrap their calls in a [`Squelch`] so the
//! executor stops reporting them; the retries themselves still run.

use crate::config::BusConfig;
use crate::regs::CardStatus;
use core::sync::atomic::{AtomicU32, Ordering};
use helix_mmc_hal::{
    Command, CommandClass, CommandError, CommandResult, Completion, MmcBridge, Request, Response,
    ResponseKind,
};

/// Retries for ordinary commands
pub const CMD_RETRIES: u32 = 3;

/// `APP_CMD` (CMD55)
pub const MMC_APP_CMD: u8 = 55;

/// Blocking command execution against one bridge
pub struct Executor<'a, B: MmcBridge> {
    bridge: &'a B,
    config: &'a BusConfig,
    squelched: &'a AtomicU32,
}

impl<B: MmcBridge> core::fmt::Debug for Executor<'_, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Executor")
            .field("squelched", &self.is_squelched())
            .finish_non_exhaustive()
    }
}

/// Suppresses failure reporting while alive
#[derive(Debug)]
#[must_use = "errors are only squelched while the guard is alive"]
pub struct Squelch<'a> {
    counter: &'a AtomicU32,
}

impl Drop for Squelch<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<'a, B: MmcBridge> Executor<'a, B> {
    /// Executor over `bridge`, reporting through the shared squelch counter
    pub fn new(bridge: &'a B, config: &'a BusConfig, squelched: &'a AtomicU32) -> Self {
        Self { bridge, config, squelched }
    }

    /// The bridge commands go to
    pub fn bridge(&self) -> &'a B {
        self.bridge
    }

    /// Active configuration
    pub fn config(&self) -> &'a BusConfig {
        self.config
    }

    /// Squelch failure reporting until the guard drops
    pub fn squelch(&self) -> Squelch<'a> {
        self.squelched.fetch_add(1, Ordering::AcqRel);
        Squelch { counter: self.squelched }
    }

    /// Whether failures are currently reported
    pub fn is_squelched(&self) -> bool {
        self.squelched.load(Ordering::Acquire) != 0
    }

    /// Submit `req` once and block until the bridge completes it
    pub fn wait_for_request(&self, req: &mut Request<'_>) -> CommandResult {
        let debug = self.config.debug;
        if debug > 1 {
            log::trace!(
                "mmc: CMD{} arg {:#010x} resp {:?} data {}",
                req.cmd.opcode,
                req.cmd.arg,
                req.cmd.response,
                req.data.as_ref().map_or(0, |d| d.len())
            );
        }

        req.cmd.resp = [0; 4];
        let done = Completion::new();
        let outcome = match self.bridge.request(req, &done) {
            Ok(()) => {
                while !done.is_complete() {
                    self.bridge.service(req, &done);
                }
                done.outcome().unwrap_or(Err(CommandError::Failed))
            }
            Err(err) => {
                log::debug!("mmc: bridge refused CMD{}: {}", req.cmd.opcode, err);
                Err(CommandError::Failed)
            }
        };

        if debug > 2 || (debug > 0 && outcome.is_err()) {
            log::trace!(
                "mmc: CMD{} done: {:?} resp {:08x} {:08x} {:08x} {:08x}",
                req.cmd.opcode,
                outcome,
                req.cmd.resp[0],
                req.cmd.resp[1],
                req.cmd.resp[2],
                req.cmd.resp[3]
            );
        }
        outcome
    }

    fn report(&self, prefix: &str, opcode: u8, err: CommandError) {
        if !self.is_squelched() {
            log::warn!("mmc: {}{} failed, RESULT: {}", prefix, opcode, err);
        }
    }

    /// Run `req`, retrying up to `retries` times after the first attempt
    pub fn execute_request(&self, req: &mut Request<'_>, retries: u32) -> CommandResult<Response> {
        let mut left = retries;
        loop {
            match self.wait_for_request(req) {
                Ok(()) => return Ok(req.cmd.response()),
                Err(err) if left == 0 => {
                    self.report("CMD", req.cmd.opcode, err);
                    return Err(err);
                }
                Err(_) => left -= 1,
            }
        }
    }

    /// Run a command without a data phase
    pub fn execute(
        &self,
        opcode: u8,
        arg: u32,
        response: ResponseKind,
        class: CommandClass,
        retries: u32,
    ) -> CommandResult<Response> {
        let mut req = Request::new(Command::new(opcode, arg, response, class));
        self.execute_request(&mut req, retries)
    }

    /// Run an application command addressed to `rca`.
    ///
    /// Each attempt sends `APP_CMD` first. A failed prefix fails the attempt
    /// with the prefix's own error; a card that did not acknowledge it fails
    /// the attempt with `Failed`.
    pub fn execute_app_request(
        &self,
        rca: u16,
        req: &mut Request<'_>,
        retries: u32,
    ) -> CommandResult<Response> {
        let mut left = retries;
        let outcome = {
            let _quiet = self.squelch();
            loop {
                let attempt = self.app_prefix(rca).and_then(|()| self.wait_for_request(req));
                match attempt {
                    Ok(()) => break Ok(req.cmd.response()),
                    Err(err) if left == 0 => break Err(err),
                    Err(_) => left -= 1,
                }
            }
        };
        if let Err(err) = outcome {
            self.report("ACMD", req.cmd.opcode, err);
        }
        outcome
    }

    /// Application command without a data phase
    pub fn execute_app_command(
        &self,
        rca: u16,
        opcode: u8,
        arg: u32,
        response: ResponseKind,
        class: CommandClass,
        retries: u32,
    ) -> CommandResult<Response> {
        let mut req = Request::new(Command::new(opcode, arg, response, class));
        self.execute_app_request(rca, &mut req, retries)
    }

    fn app_prefix(&self, rca: u16) -> CommandResult {
        let mut req = Request::new(Command::new(
            MMC_APP_CMD,
            u32::from(rca) << 16,
            ResponseKind::R1,
            CommandClass::Ac,
        ));
        self.wait_for_request(&mut req)?;
        if CardStatus(req.cmd.response().status()).app_cmd() {
            Ok(())
        } else {
            Err(CommandError::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SimBridge, SimCard};

    fn config() -> BusConfig {
        BusConfig::new()
    }

    #[test]
    fn test_retries_are_bounded() {
        let sim = SimBridge::new();
        let cfg = config();
        let squelch = AtomicU32::new(0);
        let exec = Executor::new(&sim, &cfg, &squelch);

        // No card: CMD2 times out on every attempt
        let err = exec.execute(2, 0, ResponseKind::R2, CommandClass::Bcr, CMD_RETRIES);
        assert_eq!(err, Err(CommandError::Timeout));
        assert_eq!(sim.opcode_count(2), CMD_RETRIES as usize + 1);
    }

    #[test]
    fn test_squelch_guard_nests() {
        let sim = SimBridge::new();
        let cfg = config();
        let squelch = AtomicU32::new(0);
        let exec = Executor::new(&sim, &cfg, &squelch);
        {
            let _a = exec.squelch();
            let _b = exec.squelch();
            assert!(exec.is_squelched());
        }
        assert!(!exec.is_squelched());
    }

    #[test]
    fn test_app_cmd_prefix_failure() {
        let sim = SimBridge::new();
        let cfg = config();
        let squelch = AtomicU32::new(0);
        let exec = Executor::new(&sim, &cfg, &squelch);

        let res = exec.execute_app_command(0, 41, 0, ResponseKind::R3, CommandClass::Bcr, 1);
        assert_eq!(res, Err(CommandError::Timeout));
        // The prefix failed twice, the command itself never went out
        assert_eq!(sim.opcode_count(MMC_APP_CMD), 2);
        assert_eq!(sim.opcode_count(41), 0);
        assert!(!exec.is_squelched());
    }

    #[test]
    fn test_app_cmd_success() {
        let sim = SimBridge::with_cards([SimCard::sd(0x0004)]);
        let cfg = config();
        let squelch = AtomicU32::new(0);
        let exec = Executor::new(&sim, &cfg, &squelch);

        let resp = exec
            .execute_app_command(0, 41, 0, ResponseKind::R3, CommandClass::Bcr, CMD_RETRIES)
            .unwrap();
        assert_ne!(resp.ocr(), 0);
        assert_eq!(sim.opcode_count(MMC_APP_CMD), 1);
    }
}
