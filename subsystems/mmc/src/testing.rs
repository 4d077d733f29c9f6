//! Simulated host bridge for tests.
//!
//! Cards follow the SD/MMC state machines closely enough for discovery and
//! negotiation; anything a card would not answer times out. Every command
//! is logged, including the ones that time out.

use crate::card::CardKind;
use crate::regs::{insert_bits, CardState, CardStatus, EXT_CSD_LEN, SWITCH_STATUS_LEN};
use helix_mmc_hal::{
    ocr, BridgeError, BridgeResult, CommandClass, CommandError, CommandResult, Completion, DataBuffer,
    HostCaps, Ios, MmcBridge, PowerMode, Request,
};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::vec;
use std::vec::Vec;

/// Card voltage window: 2.7 V - 3.6 V
const CARD_OCR: u32 = 0x00FF_8000;

/// EXT_CSD offsets the simulator fills in
const EXT_REV: usize = 192;
const EXT_CARD_TYPE: usize = 196;
const EXT_SEC_CNT: usize = 212;
const EXT_ERASE_GRP_SIZE: usize = 224;

/// A scripted card
#[derive(Debug, Clone)]
pub struct SimCard {
    pub kind: CardKind,
    pub cid: [u32; 4],
    pub csd: [u32; 4],
    pub ocr: u32,
    /// RCA an SD card publishes from CMD3
    pub sd_rca: u16,
    pub locked: bool,
    pub present: bool,
    /// SD: high speed in switch function group 1
    pub high_speed: bool,
    pub scr: [u8; 8],
    pub sd_status: [u8; 64],
    pub ext_csd: Vec<u8>,
    /// Data lines actually wired
    pub max_width: u8,

    state: CardState,
    rca: u16,
    app_cmd: bool,
    bustest: Vec<u8>,
    /// MMC CMD6 writes as (index, value)
    pub switches: Vec<(u8, u8)>,
}

impl SimCard {
    fn blank(kind: CardKind) -> Self {
        Self {
            kind,
            cid: [0; 4],
            csd: [0; 4],
            ocr: CARD_OCR,
            sd_rca: 0,
            locked: false,
            present: true,
            high_speed: false,
            scr: [0; 8],
            sd_status: [0; 64],
            ext_csd: vec![0; EXT_CSD_LEN],
            max_width: 1,
            state: CardState::Idle,
            rca: 0,
            app_cmd: false,
            bustest: Vec::new(),
            switches: Vec::new(),
        }
    }

    /// SDHC card publishing `rca`, high speed capable, 4-bit
    pub fn sd(rca: u16) -> Self {
        let mut card = Self::blank(CardKind::Sd);
        card.ocr = CARD_OCR | ocr::CCS;
        card.sd_rca = rca;
        card.high_speed = true;
        card.max_width = 4;

        let cid = &mut card.cid;
        insert_bits(cid, 128, 120, 8, 0x03);
        insert_bits(cid, 128, 104, 16, u32::from(u16::from_be_bytes(*b"SD")));
        for (i, b) in b"SIM08".iter().enumerate() {
            insert_bits(cid, 128, 96 - i * 8, 8, u32::from(*b));
        }
        insert_bits(cid, 128, 56, 8, 0x10);
        insert_bits(cid, 128, 24, 32, 0x1000 + u32::from(rca));
        insert_bits(cid, 128, 12, 8, 20);
        insert_bits(cid, 128, 8, 4, 6);

        let csd = &mut card.csd;
        insert_bits(csd, 128, 126, 2, 1);
        insert_bits(csd, 128, 96, 8, 0x32);
        insert_bits(csd, 128, 84, 12, 0x5B5);
        insert_bits(csd, 128, 80, 4, 9);
        insert_bits(csd, 128, 48, 22, 0x3B37);
        insert_bits(csd, 128, 39, 7, 0x7F);
        insert_bits(csd, 128, 22, 4, 9);

        // SD 2.0, 1 and 4 bit
        card.scr[0] = 0x02;
        card.scr[1] = 0x05;
        // 4 MiB allocation unit
        card.sd_status[10] = 9 << 4;
        card
    }

    /// eMMC v4.41+ part: high speed at 52 MHz, 8 lines, 7.4 GB
    pub fn mmc() -> Self {
        let mut card = Self::blank(CardKind::Mmc);
        card.ocr = CARD_OCR | ocr::LOW_VOLTAGE | (1 << 30);
        card.max_width = 8;

        let cid = &mut card.cid;
        insert_bits(cid, 128, 120, 8, 0x15);
        insert_bits(cid, 128, 104, 16, 0x0100);
        for (i, b) in b"SIMMC8".iter().enumerate() {
            insert_bits(cid, 128, 96 - i * 8, 8, u32::from(*b));
        }
        insert_bits(cid, 128, 48, 8, 0x12);
        insert_bits(cid, 128, 16, 32, 0xA000_0001);
        insert_bits(cid, 128, 8, 8, 0x3D);

        let csd = &mut card.csd;
        insert_bits(csd, 128, 126, 2, 3);
        insert_bits(csd, 128, 122, 4, 4);
        insert_bits(csd, 128, 96, 8, 0x32);
        insert_bits(csd, 128, 84, 12, 0x8F5);
        insert_bits(csd, 128, 80, 4, 9);
        insert_bits(csd, 128, 62, 12, 0xFFF);
        insert_bits(csd, 128, 47, 3, 7);
        insert_bits(csd, 128, 22, 4, 9);

        card.ext_csd[EXT_REV] = 5;
        card.ext_csd[EXT_CARD_TYPE] = 0x03;
        card.ext_csd[EXT_SEC_CNT..EXT_SEC_CNT + 4].copy_from_slice(&0x00E9_0000u32.to_le_bytes());
        card.ext_csd[EXT_ERASE_GRP_SIZE] = 1;
        card
    }

    /// Distinct product serial number
    pub fn serial(mut self, psn: u32) -> Self {
        match self.kind {
            CardKind::Sd => insert_bits(&mut self.cid, 128, 24, 32, psn),
            CardKind::Mmc => insert_bits(&mut self.cid, 128, 16, 32, psn),
        }
        self
    }

    /// Password locked
    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    /// Default speed only
    pub fn normal_speed(mut self) -> Self {
        self.high_speed = false;
        self.ext_csd[EXT_CARD_TYPE] = 0;
        self
    }

    /// EXT_CSD device type byte
    pub fn card_type(mut self, card_type: u8) -> Self {
        self.ext_csd[EXT_CARD_TYPE] = card_type;
        self
    }

    /// Number of data lines wired
    pub fn wired(mut self, lines: u8) -> Self {
        self.max_width = lines;
        self
    }

    fn status(&self) -> u32 {
        let mut status = (self.state as u32) << 9 | CardStatus::READY_FOR_DATA;
        if self.locked {
            status |= CardStatus::CARD_IS_LOCKED;
        }
        status
    }

    fn responds(&self) -> bool {
        self.present && self.state != CardState::Dis
    }
}

struct Sim {
    cards: Vec<SimCard>,
    commands: Vec<(u8, u32)>,
    ios: Ios,
    ios_log: Vec<Ios>,
    tunes: Vec<bool>,
    write_protect: bool,
    card_detect: bool,
    power_fault: bool,
}

/// Simulated bridge
pub struct SimBridge {
    sim: Mutex<Sim>,
    host_busy: Mutex<bool>,
    host_free: Condvar,
    serialize: bool,
    caps: HostCaps,
    host_ocr: u32,
    f_max: u32,
}

impl SimBridge {
    /// Empty bus
    pub fn new() -> Self {
        Self::with_cards([])
    }

    /// Bus with `cards` inserted
    pub fn with_cards(cards: impl IntoIterator<Item = SimCard>) -> Self {
        Self {
            sim: Mutex::new(Sim {
                cards: cards.into_iter().collect(),
                commands: Vec::new(),
                ios: Ios::new(),
                ios_log: Vec::new(),
                tunes: Vec::new(),
                write_protect: false,
                card_detect: true,
                power_fault: false,
            }),
            host_busy: Mutex::new(false),
            host_free: Condvar::new(),
            serialize: true,
            caps: HostCaps::BUS_WIDTH_4
                | HostCaps::BUS_WIDTH_8
                | HostCaps::HIGH_SPEED
                | HostCaps::SIGNALING_330,
            host_ocr: ocr::V320_330 | ocr::V330_340,
            f_max: 52_000_000,
        }
    }

    /// Replace the host capabilities
    pub fn with_caps(mut self, caps: HostCaps) -> Self {
        self.caps = caps;
        self
    }

    /// Replace the host voltage window
    pub fn with_host_ocr(mut self, host_ocr: u32) -> Self {
        self.host_ocr = host_ocr;
        self
    }

    /// Reject every attempt to ramp the supply
    pub fn power_fault(self) -> Self {
        self.lock().power_fault = true;
        self
    }

    /// Hand out the host without blocking
    pub fn unserialized(mut self) -> Self {
        self.serialize = false;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Sim> {
        self.sim.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// How many times `opcode` was issued
    pub fn opcode_count(&self, opcode: u8) -> usize {
        self.lock().commands.iter().filter(|(op, _)| *op == opcode).count()
    }

    /// Argument of the last `opcode` issued
    pub fn last_arg(&self, opcode: u8) -> Option<u32> {
        self.lock().commands.iter().rev().find(|(op, _)| *op == opcode).map(|&(_, arg)| arg)
    }

    /// Every command issued, in order
    pub fn commands(&self) -> Vec<(u8, u32)> {
        self.lock().commands.clone()
    }

    /// Forget the command log
    pub fn clear_log(&self) {
        self.lock().commands.clear();
    }

    /// Settings last applied
    pub fn current_ios(&self) -> Ios {
        self.lock().ios
    }

    /// Every settings update, in order
    pub fn ios_log(&self) -> Vec<Ios> {
        self.lock().ios_log.clone()
    }

    /// Tuning runs, with their HS400 flag
    pub fn tunes(&self) -> Vec<bool> {
        self.lock().tunes.clone()
    }

    /// MMC CMD6 writes received by card `index`
    pub fn switches(&self, index: usize) -> Vec<(u8, u8)> {
        self.lock().cards[index].switches.clone()
    }

    /// Pull card `index` off the bus
    pub fn remove_card(&self, index: usize) {
        self.lock().cards[index].present = false;
    }

    /// Set the card-detect pin
    pub fn set_card_detect(&self, inserted: bool) {
        self.lock().card_detect = inserted;
    }

    /// Set the write-protect switch
    pub fn set_write_protect(&self, read_only: bool) {
        self.lock().write_protect = read_only;
    }
}

impl Default for SimBridge {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Command Handling
// =============================================================================

fn read_into(data: &mut Option<DataBuffer<'_>>, src: &[u8]) -> CommandResult {
    match data {
        Some(DataBuffer::Read(buf)) => {
            let n = buf.len().min(src.len());
            buf[..n].copy_from_slice(&src[..n]);
            buf[n..].fill(0);
            Ok(())
        }
        _ => Err(CommandError::Invalid),
    }
}

impl Sim {
    fn selected(&mut self) -> Option<&mut SimCard> {
        self.cards.iter_mut().find(|c| c.responds() && c.state == CardState::Tran)
    }

    fn addressed(&mut self, rca: u16) -> Option<&mut SimCard> {
        self.cards
            .iter_mut()
            .find(|c| c.responds() && c.rca == rca && rca != 0 && c.state != CardState::Idle)
    }

    fn op_cond(&mut self, kind: CardKind, arg: u32) -> CommandResult<u32> {
        let mut answer = None;
        for card in self.cards.iter_mut().filter(|c| c.responds() && c.kind == kind) {
            if !matches!(card.state, CardState::Idle | CardState::Ready) {
                continue;
            }
            let mut reply = card.ocr;
            if arg & ocr::VOLTAGE != 0 {
                if arg & card.ocr & ocr::VOLTAGE == 0 {
                    card.state = CardState::Dis;
                    continue;
                }
                card.state = CardState::Ready;
                reply |= ocr::CARD_BUSY;
                if kind == CardKind::Sd && arg & ocr::CCS == 0 {
                    reply &= !ocr::CCS;
                }
            }
            answer.get_or_insert(reply);
        }
        answer.ok_or(CommandError::Timeout)
    }

    fn execute(&mut self, req: &mut Request<'_>) -> CommandResult {
        let op = req.cmd.opcode;
        let arg = req.cmd.arg;
        let rca = (arg >> 16) as u16;
        self.commands.push((op, arg));

        let app = self.cards.iter().any(|c| c.app_cmd);
        let app_cards: Vec<bool> = self.cards.iter().map(|c| c.app_cmd).collect();
        for card in &mut self.cards {
            card.app_cmd = false;
        }
        if app && op != 55 {
            return self.execute_app(req, &app_cards);
        }

        match op {
            0 => {
                for card in self.cards.iter_mut().filter(|c| c.present) {
                    card.state = CardState::Idle;
                    card.rca = 0;
                }
                Ok(())
            }
            1 => {
                req.cmd.resp[0] = self.op_cond(CardKind::Mmc, arg)?;
                Ok(())
            }
            2 => {
                let card = self
                    .cards
                    .iter_mut()
                    .find(|c| c.responds() && c.state == CardState::Ready)
                    .ok_or(CommandError::Timeout)?;
                card.state = CardState::Ident;
                req.cmd.resp = card.cid;
                Ok(())
            }
            3 => {
                let card = self
                    .cards
                    .iter_mut()
                    .find(|c| c.responds() && c.state == CardState::Ident)
                    .ok_or(CommandError::Timeout)?;
                card.state = CardState::Stby;
                match card.kind {
                    CardKind::Sd => {
                        card.rca = card.sd_rca;
                        req.cmd.resp[0] = u32::from(card.rca) << 16;
                    }
                    CardKind::Mmc => {
                        card.rca = rca;
                        req.cmd.resp[0] = card.status();
                    }
                }
                Ok(())
            }
            6 if req.cmd.class == CommandClass::Adtc => {
                let card = self.selected().filter(|c| c.kind == CardKind::Sd).ok_or(CommandError::Timeout)?;
                let mut status = [0u8; SWITCH_STATUS_LEN];
                if card.high_speed {
                    status[13] = 0x02;
                }
                let function = (arg & 0xF) as u8;
                status[16] = match function {
                    0xF => 0,
                    0 => 0,
                    1 if card.high_speed => 1,
                    _ => 0xF,
                };
                read_into(&mut req.data, &status)
            }
            6 => {
                let card = self.selected().filter(|c| c.kind == CardKind::Mmc).ok_or(CommandError::Timeout)?;
                card.switches.push((((arg >> 16) & 0xFF) as u8, ((arg >> 8) & 0xFF) as u8));
                req.cmd.resp[0] = card.status();
                Ok(())
            }
            7 => {
                if rca == 0 {
                    for card in self.cards.iter_mut().filter(|c| c.state == CardState::Tran) {
                        card.state = CardState::Stby;
                    }
                    return Ok(());
                }
                let idx = self
                    .cards
                    .iter()
                    .position(|c| {
                        c.responds()
                            && c.rca == rca
                            && matches!(c.state, CardState::Stby | CardState::Tran)
                    })
                    .ok_or(CommandError::Timeout)?;
                for (i, card) in self.cards.iter_mut().enumerate() {
                    if i == idx {
                        card.state = CardState::Tran;
                        req.cmd.resp[0] = card.status();
                    } else if card.state == CardState::Tran {
                        card.state = CardState::Stby;
                    }
                }
                Ok(())
            }
            8 if req.cmd.class == CommandClass::Adtc => {
                let card = self.selected().filter(|c| c.kind == CardKind::Mmc).ok_or(CommandError::Timeout)?;
                let ext = card.ext_csd.clone();
                read_into(&mut req.data, &ext)
            }
            8 => {
                self.cards
                    .iter()
                    .find(|c| c.responds() && c.kind == CardKind::Sd && c.state == CardState::Idle)
                    .ok_or(CommandError::Timeout)?;
                req.cmd.resp[0] = arg & 0xFFF;
                Ok(())
            }
            9 => {
                let card = self
                    .addressed(rca)
                    .filter(|c| c.state == CardState::Stby)
                    .ok_or(CommandError::Timeout)?;
                req.cmd.resp = card.csd;
                Ok(())
            }
            13 => {
                let card = self.addressed(rca).ok_or(CommandError::Timeout)?;
                req.cmd.resp[0] = card.status();
                Ok(())
            }
            16 => {
                let card = self.selected().ok_or(CommandError::Timeout)?;
                req.cmd.resp[0] = card.status();
                Ok(())
            }
            19 => {
                let card = self.selected().filter(|c| c.kind == CardKind::Mmc).ok_or(CommandError::Timeout)?;
                match &req.data {
                    Some(DataBuffer::Write(pattern)) => card.bustest = pattern.to_vec(),
                    _ => return Err(CommandError::Invalid),
                }
                Ok(())
            }
            14 => {
                let lines = self.ios.bus_width.lines();
                let card = self.selected().filter(|c| c.kind == CardKind::Mmc).ok_or(CommandError::Timeout)?;
                let mut reply = vec![0u8; card.bustest.len()];
                if lines <= u32::from(card.max_width) {
                    let inverted = (lines / 4).max(1) as usize;
                    for (out, b) in reply.iter_mut().zip(&card.bustest).take(inverted) {
                        *out = !*b;
                    }
                }
                read_into(&mut req.data, &reply)
            }
            55 => {
                let mut acked = false;
                for card in self.cards.iter_mut().filter(|c| c.responds() && c.kind == CardKind::Sd) {
                    let hit = if rca == 0 {
                        matches!(card.state, CardState::Idle | CardState::Ready)
                    } else {
                        card.rca == rca && matches!(card.state, CardState::Stby | CardState::Tran)
                    };
                    if hit {
                        card.app_cmd = true;
                        if !acked {
                            req.cmd.resp[0] = card.status() | CardStatus::APP_CMD;
                        }
                        acked = true;
                    }
                }
                if acked { Ok(()) } else { Err(CommandError::Timeout) }
            }
            _ => Err(CommandError::Timeout),
        }
    }

    fn execute_app(&mut self, req: &mut Request<'_>, app_cards: &[bool]) -> CommandResult {
        let arg = req.cmd.arg;
        if req.cmd.opcode == 41 {
            req.cmd.resp[0] = self.op_cond(CardKind::Sd, arg)?;
            return Ok(());
        }

        let card = self
            .cards
            .iter_mut()
            .zip(app_cards)
            .find(|(c, &app)| app && c.responds() && c.state == CardState::Tran)
            .map(|(c, _)| c)
            .ok_or(CommandError::Timeout)?;
        match req.cmd.opcode {
            6 | 42 => {
                req.cmd.resp[0] = card.status();
                Ok(())
            }
            51 => {
                let scr = card.scr;
                read_into(&mut req.data, &scr)
            }
            13 => {
                let status = card.sd_status;
                read_into(&mut req.data, &status)
            }
            _ => Err(CommandError::Timeout),
        }
    }
}

impl MmcBridge for SimBridge {
    fn request(&self, req: &mut Request<'_>, done: &Completion) -> BridgeResult<()> {
        let outcome = self.lock().execute(req);
        done.complete(outcome);
        Ok(())
    }

    fn update_ios(&self, ios: &Ios) -> BridgeResult<()> {
        let mut sim = self.lock();
        if sim.power_fault && ios.power_mode != PowerMode::Off {
            return Err(BridgeError::HardwareError);
        }
        if ios.power_mode == PowerMode::Off && sim.ios.power_mode != PowerMode::Off {
            for card in &mut sim.cards {
                card.state = CardState::Idle;
                card.rca = 0;
                card.app_cmd = false;
            }
        }
        sim.ios = *ios;
        sim.ios_log.push(*ios);
        Ok(())
    }

    fn switch_vccq(&self, ios: &Ios) -> BridgeResult<()> {
        self.lock().ios.vccq = ios.vccq;
        Ok(())
    }

    fn tune(&self, hs400: bool) -> BridgeResult<()> {
        self.lock().tunes.push(hs400);
        Ok(())
    }

    fn acquire_host(&self) -> BridgeResult<()> {
        if !self.serialize {
            return Ok(());
        }
        let mut busy = self.host_busy.lock().unwrap_or_else(|e| e.into_inner());
        while *busy {
            busy = self.host_free.wait(busy).unwrap_or_else(|e| e.into_inner());
        }
        *busy = true;
        Ok(())
    }

    fn release_host(&self) -> BridgeResult<()> {
        if self.serialize {
            *self.host_busy.lock().unwrap_or_else(|e| e.into_inner()) = false;
            self.host_free.notify_one();
        }
        Ok(())
    }

    fn card_detect(&self) -> bool {
        self.lock().card_detect
    }

    fn write_protect(&self) -> bool {
        self.lock().write_protect
    }

    fn caps(&self) -> HostCaps {
        self.caps
    }

    fn host_ocr(&self) -> u32 {
        self.host_ocr
    }

    fn f_min(&self) -> u32 {
        400_000
    }

    fn f_max(&self) -> u32 {
        self.f_max
    }

    fn max_data(&self) -> u32 {
        128
    }

    fn delay_us(&self, _us: u32) {}
}
