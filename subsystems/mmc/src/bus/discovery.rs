//! Card identification.
//!
//! Runs once cards are out of idle and agreed on a voltage window. Each
//! pass of the loop pulls one CID off the bus, walks that card through
//! addressing and register reads, then deselects it.

use super::{BusMode, MmcBus};
use crate::card::{lookup_quirks, Card, CardKind, SECTOR_SIZE};
use crate::executor::Executor;
use crate::regs::{
    self, decode_cid_mmc, decode_cid_sd, decode_csd_mmc, decode_csd_sd, decode_scr,
    decode_sd_status, ext_csd, ExtCsd,
};
use crate::timing::{Timings, TimingCaps, MMC_HS_26_MAX, MMC_HS_52_MAX, SD_HS_MAX};
use crate::{MmcError, MmcResult};
use alloc::boxed::Box;
use helix_mmc_hal::{BusWidth, CommandError, CommandResult, HostCaps, MmcBridge};

/// First RCA handed to an MMC card
const MMC_FIRST_RCA: u16 = 2;

/// SD command class 10 (switch)
const CCC_SWITCH: u16 = 1 << 10;

const BUSTEST_8: [u8; 8] = [0x55, 0xAA, 0, 0, 0, 0, 0, 0];
const BUSTEST_8_OK: [u8; 8] = [0xAA, 0x55, 0, 0, 0, 0, 0, 0];
const BUSTEST_4: [u8; 4] = [0x5A, 0, 0, 0];
const BUSTEST_4_OK: [u8; 4] = [0xA5, 0, 0, 0];

/// Log a failed identification step against `rca`
fn step<T>(rca: u16, what: &str, result: CommandResult<T>) -> MmcResult<T> {
    result.map_err(|err| {
        log::warn!("mmc: card at relative address {}: error {}: {}", rca, what, err);
        MmcError::Command(err)
    })
}

/// Timing capabilities an MMC card advertises in EXT_CSD, limited to what
/// the host and the negotiated bus width allow
pub(crate) fn mmc_timing_caps(
    ext: &ExtCsd,
    host: HostCaps,
    width: BusWidth,
    tran_speed: u32,
) -> TimingCaps {
    let mut caps = TimingCaps::normal(tran_speed);
    let card_type = ext.card_type();

    if card_type & ext_csd::CARD_TYPE_HS_52 != 0 {
        caps.timings |= Timings::HIGH_SPEED;
        caps.hs_tran_speed = MMC_HS_52_MAX;
    } else if card_type & ext_csd::CARD_TYPE_HS_26 != 0 {
        caps.timings |= Timings::HIGH_SPEED;
        caps.hs_tran_speed = MMC_HS_26_MAX;
    }

    let eight = width == BusWidth::Eight;
    let table = [
        (ext_csd::CARD_TYPE_DDR_52_1_2V, ext_csd::CARD_TYPE_DDR_52_1_8V, Timings::MMC_DDR52, true),
        (ext_csd::CARD_TYPE_HS200_1_2V, ext_csd::CARD_TYPE_HS200_1_8V, Timings::MMC_HS200, true),
        (ext_csd::CARD_TYPE_HS400_1_2V, ext_csd::CARD_TYPE_HS400_1_8V, Timings::MMC_HS400, eight),
    ];
    for (bit_120, bit_180, timing, allowed) in table {
        if !allowed {
            continue;
        }
        if card_type & bit_120 != 0 && host.contains(HostCaps::SIGNALING_120) {
            caps.timings |= timing;
            caps.vccq_120 |= timing;
        }
        if card_type & bit_180 != 0 && host.contains(HostCaps::SIGNALING_180) {
            caps.timings |= timing;
            caps.vccq_180 |= timing;
        }
    }

    if eight && ext.strobe_support() && host.contains(HostCaps::MMC_ENH_STROBE) {
        if card_type & ext_csd::CARD_TYPE_HS400_1_2V != 0 && host.contains(HostCaps::SIGNALING_120) {
            caps.timings |= Timings::MMC_HS400ES;
            caps.vccq_120 |= Timings::MMC_HS400ES;
        }
        if card_type & ext_csd::CARD_TYPE_HS400_1_8V != 0 && host.contains(HostCaps::SIGNALING_180) {
            caps.timings |= Timings::MMC_HS400ES;
            caps.vccq_180 |= Timings::MMC_HS400ES;
        }
    }
    caps
}

impl<B: MmcBridge> MmcBus<B> {
    /// Identify every card answering ALL_SEND_CID.
    ///
    /// SD buses stop after one card. On MMC buses the loop ends when no
    /// card answers, or when a card cannot be given an RCA and so stays in
    /// the identification state. A card that fails any later step is
    /// skipped and the loop moves on to the next one.
    pub(super) fn discover_cards(&self) {
        let exec = self.exec();
        let mode = self.mode();
        let host = self.bridge.caps();
        let mut next_rca = MMC_FIRST_RCA;

        log::log!(self.verbose(), "mmc: probing cards");
        loop {
            let raw_cid = {
                let _quiet = exec.squelch();
                exec.all_send_cid()
            };
            let raw_cid = match raw_cid {
                Ok(raw) => raw,
                Err(CommandError::Timeout) => break,
                Err(err) => {
                    log::warn!("mmc: error reading CID: {}", err);
                    break;
                }
            };

            let known = self.registry.find_by_cid(&raw_cid);
            log::log!(
                self.verbose(),
                "mmc: {} detected (CID {:08x}{:08x}{:08x}{:08x})",
                if known.is_some() { "known card" } else { "new card" },
                raw_cid[0],
                raw_cid[1],
                raw_cid[2],
                raw_cid[3]
            );

            let identified = match mode {
                BusMode::Sd => self.identify_sd(&exec, raw_cid, host),
                BusMode::Mmc => {
                    let rca = next_rca;
                    next_rca = next_rca.wrapping_add(1);
                    // Without an RCA the card is still in Ident and would
                    // answer the next ALL_SEND_CID again
                    if step(rca, "setting RCA", exec.set_relative_addr(rca)).is_err() {
                        let _ = exec.select_card(0);
                        return;
                    }
                    self.identify_mmc(&exec, raw_cid, rca, host)
                }
            };

            match identified {
                Ok(mut card) => {
                    self.finish_card(&exec, &mut card);
                    self.register(known, card);
                }
                Err(err) => log::warn!("mmc: skipping card: {}", err),
            }
            let _ = exec.select_card(0);

            if mode == BusMode::Sd || next_rca == 0 {
                return;
            }
        }
    }

    fn register(&self, known: Option<u16>, card: Card) {
        let timing = self.ios().timing;
        match known {
            Some(old_rca) => {
                card.log_summary(false, timing, self.config.verbose);
                if self.registry.refresh(old_rca, &card).is_none() {
                    self.registry.insert(card);
                }
            }
            None => {
                card.log_summary(true, timing, self.config.verbose);
                self.registry.insert(card);
            }
        }
    }

    fn identify_sd(&self, exec: &Executor<'_, B>, raw_cid: [u32; 4], host: HostCaps) -> MmcResult<Card> {
        let rca = step(0, "getting RCA", exec.send_relative_addr())?;
        if rca == 0 {
            log::warn!("mmc: card published RCA 0");
            return Err(MmcError::InvalidRca);
        }

        let raw_csd = step(rca, "getting CSD", exec.send_csd(rca))?;
        let csd = decode_csd_sd(&raw_csd)?;
        let mut card = Card::new(CardKind::Sd, raw_cid, decode_cid_sd(&raw_cid), csd);
        card.rca = rca;
        card.raw_csd = raw_csd;
        card.read_only = self.bridge.write_protect();

        let status = step(rca, "reading status", exec.send_status(rca))?;
        if status.is_locked() {
            log::warn!("mmc: card at relative address {} is password protected, skipping", rca);
            return Err(MmcError::CardLocked);
        }

        step(rca, "selecting card", exec.select_card(rca))?;
        card.raw_scr = step(rca, "reading SCR", exec.app_send_scr(rca))?;
        card.scr = decode_scr(&card.raw_scr);

        if card.scr.sda_vsn >= 1 && csd.ccc & CCC_SWITCH != 0 {
            let probe = exec.sd_switch(
                regs::SD_SWITCH_MODE_CHECK,
                regs::SD_SWITCH_GROUP1,
                regs::SD_SWITCH_NOCHANGE,
            );
            if let Ok(switch) = probe {
                if switch.supports_high_speed() {
                    card.caps.timings |= Timings::HIGH_SPEED;
                    card.caps.hs_tran_speed = SD_HS_MAX;
                }
            }
        }

        // SD status reads need a fresh select after CMD6
        let _ = exec.select_card(0);
        step(rca, "reselecting card", exec.select_card(rca))?;
        match exec.app_sd_status(rca) {
            Ok(raw) => {
                card.raw_sd_status = raw;
                card.sd_status = decode_sd_status(&raw);
                if card.sd_status.au_size != 0 {
                    card.erase_sector = 16 << card.sd_status.au_size;
                }
            }
            Err(err) => log::debug!("mmc: card at relative address {}: no SD status: {}", rca, err),
        }

        if host.contains(HostCaps::BUS_WIDTH_4) && card.scr.supports_4bit() {
            card.bus_width = BusWidth::Four;
        }
        Ok(card)
    }

    fn identify_mmc(
        &self,
        exec: &Executor<'_, B>,
        raw_cid: [u32; 4],
        rca: u16,
        host: HostCaps,
    ) -> MmcResult<Card> {
        let raw_csd = step(rca, "getting CSD", exec.send_csd(rca))?;
        let csd = decode_csd_mmc(&raw_csd);
        let mut card = Card::new(CardKind::Mmc, raw_cid, decode_cid_mmc(&raw_cid, false), csd);
        card.rca = rca;
        card.raw_csd = raw_csd;
        card.read_only = self.bridge.write_protect();
        card.cmd6_time = self.config.default_cmd6_timeout_us;

        let status = step(rca, "reading status", exec.send_status(rca))?;
        if status.is_locked() {
            log::warn!("mmc: card at relative address {} is password protected, skipping", rca);
            return Err(MmcError::CardLocked);
        }
        step(rca, "selecting card", exec.select_card(rca))?;

        let mut rev = 0;
        if csd.spec_vers >= 4 {
            let ext = step(rca, "reading EXT_CSD", exec.send_ext_csd())?;
            rev = ext.rev();

            let sectors = ext.sec_count();
            if sectors != 0 {
                card.sec_count = u64::from(sectors);
                card.high_cap = true;
            }

            card.bus_width = self.test_bus_width(exec);
            card.caps = mmc_timing_caps(&ext, host, card.bus_width, csd.tran_speed);

            if rev >= 6 && ext.gen_cmd6_time() != 0 {
                card.cmd6_time = u32::from(ext.gen_cmd6_time()) * 10_000;
            }

            let group = ext.erase_grp_size();
            if group != 0 {
                card.erase_sector = u32::from(group) * 1024;
                step(
                    rca,
                    "enabling high-capacity erase groups",
                    exec.mmc_switch(
                        rca,
                        ext_csd::CMD_SET_NORMAL,
                        ext_csd::ERASE_GRP_DEF,
                        1,
                        card.cmd6_time,
                        true,
                    ),
                )?;
            }
            card.raw_ext_csd = Some(Box::new(ext));
        }

        card.cid = decode_cid_mmc(&raw_cid, rev >= 5);
        Ok(card)
    }

    /// Common tail of identification
    fn finish_card(&self, exec: &Executor<'_, B>, card: &mut Card) {
        card.quirks = lookup_quirks(&card.cid);
        if card.csd.read_bl_len != SECTOR_SIZE || card.csd.write_bl_len != SECTOR_SIZE {
            if let Err(err) = exec.set_blocklen(SECTOR_SIZE) {
                log::warn!("mmc: card at relative address {}: error setting block length: {}", card.rca, err);
            }
        }
        card.format_id_strings();
    }

    /// Widest bus the selected MMC card passes the bus test on
    pub(super) fn test_bus_width(&self, exec: &Executor<'_, B>) -> BusWidth {
        let host = self.bridge.caps();
        let _quiet = exec.squelch();

        if host.contains(HostCaps::BUS_WIDTH_8) && self.bus_test(exec, BusWidth::Eight, &BUSTEST_8, &BUSTEST_8_OK) {
            return BusWidth::Eight;
        }
        if host.contains(HostCaps::BUS_WIDTH_4) && self.bus_test(exec, BusWidth::Four, &BUSTEST_4, &BUSTEST_4_OK) {
            return BusWidth::Four;
        }
        BusWidth::One
    }

    fn bus_test(&self, exec: &Executor<'_, B>, width: BusWidth, pattern: &[u8], expect: &[u8]) -> bool {
        let mut readback = [0u8; 8];
        let readback = &mut readback[..expect.len()];

        self.set_ios(|ios| ios.bus_width = width);
        let passed = self.apply_ios().is_ok()
            && exec.bus_test(pattern, readback).is_ok()
            && readback == expect;
        self.set_ios(|ios| ios.bus_width = BusWidth::One);
        let _ = self.apply_ios();
        passed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext_with(card_type: u8, strobe: bool) -> ExtCsd {
        let mut ext = ExtCsd::zeroed();
        ext.0[usize::from(ext_csd::CARD_TYPE)] = card_type;
        if strobe {
            ext.0[usize::from(ext_csd::STROBE_SUPPORT)] = ext_csd::STROBE_SUPPORT_EN;
        }
        ext
    }

    #[test]
    fn test_hs_52_preferred_over_26() {
        let ext = ext_with(ext_csd::CARD_TYPE_HS_26 | ext_csd::CARD_TYPE_HS_52, false);
        let caps = mmc_timing_caps(&ext, HostCaps::empty(), BusWidth::One, 25_000_000);
        assert_eq!(caps.timings, Timings::NORMAL | Timings::HIGH_SPEED);
        assert_eq!(caps.hs_tran_speed, MMC_HS_52_MAX);
    }

    #[test]
    fn test_fast_modes_need_signaling() {
        let all = 0xFF;
        let ext = ext_with(all, true);

        let none = mmc_timing_caps(&ext, HostCaps::BUS_WIDTH_8, BusWidth::Eight, 25_000_000);
        assert_eq!(none.timings, Timings::NORMAL | Timings::HIGH_SPEED);

        let host = HostCaps::BUS_WIDTH_8 | HostCaps::SIGNALING_180 | HostCaps::MMC_ENH_STROBE;
        let caps = mmc_timing_caps(&ext, host, BusWidth::Eight, 25_000_000);
        assert!(caps.timings.contains(Timings::MMC_DDR52 | Timings::MMC_HS200 | Timings::MMC_HS400));
        assert!(caps.timings.contains(Timings::MMC_HS400ES));
        assert_eq!(caps.vccq_180, caps.timings.difference(Timings::NORMAL | Timings::HIGH_SPEED));
        assert!(caps.vccq_120.is_empty());
    }

    #[test]
    fn test_hs400_needs_eight_bits() {
        let ext = ext_with(ext_csd::CARD_TYPE_HS400_1_8V | ext_csd::CARD_TYPE_HS200_1_8V, true);
        let host = HostCaps::SIGNALING_180 | HostCaps::MMC_ENH_STROBE;
        let caps = mmc_timing_caps(&ext, host, BusWidth::Four, 25_000_000);
        assert!(caps.timings.contains(Timings::MMC_HS200));
        assert!(!caps.timings.intersects(Timings::MMC_HS400 | Timings::MMC_HS400ES));
    }
}
