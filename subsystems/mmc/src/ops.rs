//! # Standard Commands
//!
//! Typed wrappers for the SD and MMC commands the bus manager issues.

use crate::executor::Executor;
use crate::regs::{
    self, CardState, CardStatus, ExtCsd, SwitchStatus, EXT_CSD_LEN, SWITCH_STATUS_LEN,
};
use helix_mmc_hal::{
    ocr, Command, CommandClass, CommandError, CommandResult, DataBuffer, HostCaps, MmcBridge,
    Request, ResponseKind,
};

// =============================================================================
// Opcodes
// =============================================================================

/// Opcodes used during identification and negotiation
pub mod opcode {
    /// Reset all cards to idle
    pub const GO_IDLE_STATE: u8 = 0;
    /// MMC: start power-up
    pub const SEND_OP_COND: u8 = 1;
    /// Broadcast CID request
    pub const ALL_SEND_CID: u8 = 2;
    /// SD: publish RCA; MMC: assign RCA
    pub const SET_RELATIVE_ADDR: u8 = 3;
    /// SD: switch function
    pub const SWITCH_FUNC: u8 = 6;
    /// Select/deselect
    pub const SELECT_CARD: u8 = 7;
    /// SD: interface condition; MMC: read EXT_CSD (same index)
    pub const SEND_IF_COND: u8 = 8;
    /// MMC: read EXT_CSD
    pub const SEND_EXT_CSD: u8 = 8;
    /// Read CSD
    pub const SEND_CSD: u8 = 9;
    /// MMC: bus test read
    pub const BUSTEST_R: u8 = 14;
    /// Card status
    pub const SEND_STATUS: u8 = 13;
    /// Set block length
    pub const SET_BLOCKLEN: u8 = 16;
    /// MMC: bus test write
    pub const BUSTEST_W: u8 = 19;
    /// Application command prefix
    pub const APP_CMD: u8 = 55;

    /// ACMD: set bus width
    pub const ACMD_SET_BUS_WIDTH: u8 = 6;
    /// ACMD: SD status
    pub const ACMD_SD_STATUS: u8 = 13;
    /// ACMD: send operating conditions
    pub const ACMD_SD_SEND_OP_COND: u8 = 41;
    /// ACMD: connect/disconnect the DAT3 pull-up
    pub const ACMD_SET_CLR_CARD_DETECT: u8 = 42;
    /// ACMD: read SCR
    pub const ACMD_SEND_SCR: u8 = 51;
}

/// CMD8 check pattern
pub const IF_COND_PATTERN: u32 = 0xAA;

/// ACMD6 argument for a 1-bit bus
pub const SD_BUS_WIDTH_1: u32 = 0;
/// ACMD6 argument for a 4-bit bus
pub const SD_BUS_WIDTH_4: u32 = 2;

/// Switch status polling interval (us)
const SWITCH_POLL_US: u32 = 1000;

// =============================================================================
// Command Wrappers
// =============================================================================

impl<B: MmcBridge> Executor<'_, B> {
    fn retries(&self) -> u32 {
        self.config().retries
    }

    /// CMD0, broadcast
    pub fn go_idle_state(&self) -> CommandResult {
        self.execute(opcode::GO_IDLE_STATE, 0, ResponseKind::None, CommandClass::Bc, self.retries())
            .map(|_| ())
    }

    /// SD CMD8 with voltage supplied `vhs`
    pub fn send_if_cond(&self, vhs: u8) -> CommandResult<u32> {
        let arg = (u32::from(vhs) << 8) | IF_COND_PATTERN;
        self.execute(opcode::SEND_IF_COND, arg, ResponseKind::R7, CommandClass::Bcr, self.retries())
            .map(|resp| resp.status())
    }

    /// Poll an op-cond command until power-up completes.
    ///
    /// A zero voltage window is an inquiry and returns after one answer.
    fn poll_op_cond<F>(&self, ocr_arg: u32, mut send: F) -> CommandResult<u32>
    where
        F: FnMut(u32) -> CommandResult<u32>,
    {
        let mut outcome = Err(CommandError::Timeout);
        for _ in 0..self.config().op_cond_attempts {
            let resp = send(ocr_arg)?;
            if resp & ocr::CARD_BUSY != 0 || ocr_arg & ocr::VOLTAGE == 0 {
                outcome = Ok(resp);
                break;
            }
            outcome = Err(CommandError::Timeout);
            self.bridge().delay_us(self.config().op_cond_delay_ms * 1000);
        }
        outcome
    }

    /// SD ACMD41, returns the card OCR
    pub fn send_app_op_cond(&self, ocr_arg: u32) -> CommandResult<u32> {
        let retries = self.retries();
        self.poll_op_cond(ocr_arg, |arg| {
            self.execute_app_command(
                0,
                opcode::ACMD_SD_SEND_OP_COND,
                arg,
                ResponseKind::R3,
                CommandClass::Bcr,
                retries,
            )
            .map(|resp| resp.ocr())
        })
    }

    /// MMC CMD1, returns the card OCR
    pub fn send_op_cond(&self, ocr_arg: u32) -> CommandResult<u32> {
        let retries = self.retries();
        self.poll_op_cond(ocr_arg, |arg| {
            self.execute(opcode::SEND_OP_COND, arg, ResponseKind::R3, CommandClass::Bcr, retries)
                .map(|resp| resp.ocr())
        })
    }

    /// CMD2, broadcast
    pub fn all_send_cid(&self) -> CommandResult<[u32; 4]> {
        self.execute(opcode::ALL_SEND_CID, 0, ResponseKind::R2, CommandClass::Bcr, self.retries())
            .map(|resp| resp.long())
    }

    /// SD CMD3, returns the card-chosen RCA
    pub fn send_relative_addr(&self) -> CommandResult<u16> {
        self.execute(opcode::SET_RELATIVE_ADDR, 0, ResponseKind::R6, CommandClass::Bcr, self.retries())
            .map(|resp| resp.rca())
    }

    /// MMC CMD3, assigns `rca`
    pub fn set_relative_addr(&self, rca: u16) -> CommandResult {
        self.execute(
            opcode::SET_RELATIVE_ADDR,
            u32::from(rca) << 16,
            ResponseKind::R1,
            CommandClass::Ac,
            self.retries(),
        )
        .map(|_| ())
    }

    /// CMD9
    pub fn send_csd(&self, rca: u16) -> CommandResult<[u32; 4]> {
        self.execute(opcode::SEND_CSD, u32::from(rca) << 16, ResponseKind::R2, CommandClass::Ac, self.retries())
            .map(|resp| resp.long())
    }

    /// CMD13
    pub fn send_status(&self, rca: u16) -> CommandResult<CardStatus> {
        self.execute(opcode::SEND_STATUS, u32::from(rca) << 16, ResponseKind::R1, CommandClass::Ac, self.retries())
            .map(|resp| CardStatus(resp.status()))
    }

    /// CMD7; RCA 0 deselects every card and expects no response
    pub fn select_card(&self, rca: u16) -> CommandResult {
        let response = if rca != 0 { ResponseKind::R1b } else { ResponseKind::None };
        self.execute(opcode::SELECT_CARD, u32::from(rca) << 16, response, CommandClass::Ac, self.retries())
            .map(|_| ())
    }

    /// CMD16
    pub fn set_blocklen(&self, len: u32) -> CommandResult {
        self.execute(opcode::SET_BLOCKLEN, len, ResponseKind::R1, CommandClass::Ac, self.retries())
            .map(|_| ())
    }

    fn app_read(&self, rca: u16, op: u8, buf: &mut [u8]) -> CommandResult {
        let cmd = Command::new(op, 0, ResponseKind::R1, CommandClass::Adtc);
        let mut req = Request::with_data(cmd, DataBuffer::Read(buf));
        self.execute_app_request(rca, &mut req, self.retries()).map(|_| ())
    }

    /// SD ACMD51, card must be selected
    pub fn app_send_scr(&self, rca: u16) -> CommandResult<[u32; 2]> {
        let mut buf = [0u8; 8];
        self.app_read(rca, opcode::ACMD_SEND_SCR, &mut buf)?;
        Ok(regs::be_words(&buf))
    }

    /// SD ACMD13, card must be selected
    pub fn app_sd_status(&self, rca: u16) -> CommandResult<[u32; 16]> {
        let mut buf = [0u8; 64];
        self.app_read(rca, opcode::ACMD_SD_STATUS, &mut buf)?;
        Ok(regs::be_words(&buf))
    }

    /// MMC CMD8, card must be selected
    pub fn send_ext_csd(&self) -> CommandResult<ExtCsd> {
        let mut ext = ExtCsd::zeroed();
        let cmd = Command::new(opcode::SEND_EXT_CSD, 0, ResponseKind::R1, CommandClass::Adtc);
        let mut req = Request::with_data(cmd, DataBuffer::Read(&mut ext.0[..EXT_CSD_LEN]));
        self.execute_request(&mut req, self.retries())?;
        Ok(ext)
    }

    /// SD CMD6 on `group`, card must be selected
    pub fn sd_switch(&self, mode: u32, group: u32, value: u8) -> CommandResult<SwitchStatus> {
        let shift = group * 4;
        let mut arg = (mode << 31) | 0x00FF_FFFF;
        arg &= !(0xF << shift);
        arg |= u32::from(value) << shift;

        let mut status = SwitchStatus([0; SWITCH_STATUS_LEN]);
        let cmd = Command::new(opcode::SWITCH_FUNC, arg, ResponseKind::R1, CommandClass::Adtc);
        let mut req = Request::with_data(cmd, DataBuffer::Read(&mut status.0));
        self.execute_request(&mut req, self.retries())?;
        Ok(status)
    }

    /// SD ACMD42 then ACMD6
    pub fn app_set_bus_width(&self, rca: u16, width_arg: u32) -> CommandResult {
        let retries = self.retries();
        self.execute_app_command(
            rca,
            opcode::ACMD_SET_CLR_CARD_DETECT,
            0,
            ResponseKind::R1,
            CommandClass::Ac,
            retries,
        )?;
        self.execute_app_command(
            rca,
            opcode::ACMD_SET_BUS_WIDTH,
            width_arg,
            ResponseKind::R1,
            CommandClass::Ac,
            retries,
        )
        .map(|_| ())
    }

    /// MMC CMD6 write-byte to EXT_CSD `index`.
    ///
    /// Hosts that detect busy in hardware get an R1 instead of R1b when the
    /// switch may outlast their busy timer. With `status`, waits for the
    /// card to return to `TRAN`.
    pub fn mmc_switch(
        &self,
        rca: u16,
        set: u8,
        index: u8,
        value: u8,
        timeout_us: u32,
        status: bool,
    ) -> CommandResult {
        let arg = (regs::ext_csd::ACCESS_WRITE_BYTE << 24)
            | (u32::from(index) << 16)
            | (u32::from(value) << 8)
            | u32::from(set);
        let bridge = self.bridge();
        let response = if bridge.caps().contains(HostCaps::WAIT_WHILE_BUSY)
            && timeout_us > bridge.max_busy_timeout()
        {
            ResponseKind::R1
        } else {
            ResponseKind::R1b
        };
        self.execute(opcode::SWITCH_FUNC, arg, response, CommandClass::Ac, 0)?;
        if status {
            self.switch_status(rca, timeout_us)
        } else {
            Ok(())
        }
    }

    /// Poll CMD13 until the card is back in `TRAN`.
    ///
    /// CRC errors mean the status request itself was lost and are retried
    /// a bounded number of times. `SWITCH_ERROR` maps to `Failed`.
    pub fn switch_status(&self, rca: u16, timeout_us: u32) -> CommandResult {
        let mut crc_errors = 0;
        let mut waited = 0u32;
        loop {
            let status = match self.send_status(rca) {
                Ok(status) => status,
                Err(CommandError::BadCrc) => {
                    crc_errors += 1;
                    if crc_errors > self.config().switch_crc_retries {
                        return Err(CommandError::BadCrc);
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };
            if status.current_state() == CardState::Tran {
                return if status.switch_error() { Err(CommandError::Failed) } else { Ok(()) };
            }
            if waited >= timeout_us {
                return Err(CommandError::Timeout);
            }
            self.bridge().delay_us(SWITCH_POLL_US);
            waited = waited.saturating_add(SWITCH_POLL_US);
        }
    }

    /// MMC bus test: write `pattern`, read back into `readback`.
    ///
    /// Only the read result is reported; the write may fail on widths the
    /// card does not wire up.
    pub fn bus_test(&self, pattern: &[u8], readback: &mut [u8]) -> CommandResult {
        let cmd = Command::new(opcode::BUSTEST_W, 0, ResponseKind::R1, CommandClass::Adtc);
        let mut req = Request::with_data(cmd, DataBuffer::Write(pattern));
        let _ = self.execute_request(&mut req, 0);

        let cmd = Command::new(opcode::BUSTEST_R, 0, ResponseKind::R1, CommandClass::Adtc);
        let mut req = Request::with_data(cmd, DataBuffer::Read(readback));
        self.execute_request(&mut req, 0).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::testing::{SimBridge, SimCard};
    use core::sync::atomic::AtomicU32;

    #[test]
    fn test_sd_switch_argument() {
        let sim = SimBridge::with_cards([SimCard::sd(0x0004)]);
        let cfg = BusConfig::new();
        let squelch = AtomicU32::new(0);
        let exec = Executor::new(&sim, &cfg, &squelch);

        let _ = exec.sd_switch(regs::SD_SWITCH_MODE_SET, regs::SD_SWITCH_GROUP1, regs::SD_SWITCH_HS_MODE);
        assert_eq!(sim.last_arg(opcode::SWITCH_FUNC), Some(0x80FF_FFF1));
        let _ = exec.sd_switch(regs::SD_SWITCH_MODE_CHECK, regs::SD_SWITCH_GROUP1, regs::SD_SWITCH_NOCHANGE);
        assert_eq!(sim.last_arg(opcode::SWITCH_FUNC), Some(0x00FF_FFFF));
    }

    #[test]
    fn test_op_cond_gives_up() {
        let sim = SimBridge::new();
        let cfg = BusConfig { op_cond_attempts: 4, ..BusConfig::new() };
        let squelch = AtomicU32::new(0);
        let exec = Executor::new(&sim, &cfg, &squelch);
        let _quiet = exec.squelch();

        assert_eq!(exec.send_op_cond(0), Err(CommandError::Timeout));
        // One poll, which itself was retried
        assert_eq!(sim.opcode_count(opcode::SEND_OP_COND), cfg.retries as usize + 1);
    }

    #[test]
    fn test_mmc_switch_argument() {
        let sim = SimBridge::with_cards([SimCard::mmc()]);
        let cfg = BusConfig::new();
        let squelch = AtomicU32::new(0);
        let exec = Executor::new(&sim, &cfg, &squelch);

        let _ = exec.mmc_switch(2, regs::ext_csd::CMD_SET_NORMAL, regs::ext_csd::HS_TIMING, 1, 500_000, false);
        assert_eq!(sim.last_arg(opcode::SWITCH_FUNC), Some(0x03B9_0101));
    }
}
