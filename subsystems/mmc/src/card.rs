//! # Card
//!
//! One entry per card that answered discovery. Register contents are fixed
//! once fetched; only the negotiated state changes afterwards.

use crate::regs::{Cid, Csd, ExtCsd, Scr, SdStatus};
use crate::timing::{timing_mode_label, timing_to_max_clock_hz, TimingCaps};
use alloc::boxed::Box;
use bitflags::bitflags;
use core::fmt::Write;
use heapless::String;
use helix_mmc_hal::{BusTiming, BusWidth};

/// Sector size exposed to consumers
pub const SECTOR_SIZE: u32 = 512;

/// Card id string capacity
pub const ID_STRING_LEN: usize = 64;

/// Serial string capacity
pub const SN_STRING_LEN: usize = 16;

/// Command set family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CardKind {
    /// SD memory card
    Sd,
    /// MMC or eMMC
    Mmc,
}

impl CardKind {
    /// Short name used in id strings
    pub const fn as_str(self) -> &'static str {
        match self {
            CardKind::Sd => "SD",
            CardKind::Mmc => "MMC",
        }
    }
}

bitflags! {
    /// Per-device workarounds
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Quirks: u32 {
        /// iNAND: CMD38 takes a non-standard argument for secure erase
        const INAND_CMD38 = 0x0001;
        /// TRIM corrupts data
        const BROKEN_TRIM = 0x0002;
    }
}

/// Validity-checked reference to a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CardHandle {
    rca: u16,
    generation: u32,
}

impl CardHandle {
    pub(crate) const fn new(rca: u16, generation: u32) -> Self {
        Self { rca, generation }
    }

    /// Relative card address
    pub const fn rca(&self) -> u16 {
        self.rca
    }

    /// Registry generation the handle was issued for
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

// =============================================================================
// Quirks
// =============================================================================

struct QuirkEntry {
    mid: Option<u8>,
    oid: Option<u16>,
    pnm: &'static str,
    quirks: Quirks,
}

const QUIRKS: &[QuirkEntry] = &[
    QuirkEntry { mid: Some(0x02), oid: Some(0x0100), pnm: "SEM02G", quirks: Quirks::INAND_CMD38 },
    QuirkEntry { mid: Some(0x02), oid: Some(0x0100), pnm: "SEM04G", quirks: Quirks::INAND_CMD38 },
    QuirkEntry { mid: Some(0x02), oid: Some(0x0100), pnm: "SEM08G", quirks: Quirks::INAND_CMD38 },
    QuirkEntry { mid: Some(0x02), oid: Some(0x0100), pnm: "SEM16G", quirks: Quirks::INAND_CMD38 },
    QuirkEntry { mid: Some(0x02), oid: Some(0x0100), pnm: "SEM32G", quirks: Quirks::INAND_CMD38 },
    QuirkEntry { mid: Some(0x70), oid: None, pnm: "V10008", quirks: Quirks::BROKEN_TRIM },
    QuirkEntry { mid: Some(0x70), oid: None, pnm: "V10016", quirks: Quirks::BROKEN_TRIM },
];

/// Workarounds for the device identified by `cid`
pub fn lookup_quirks(cid: &Cid) -> Quirks {
    QUIRKS
        .iter()
        .find(|q| {
            q.mid.map_or(true, |mid| mid == cid.mid)
                && q.oid.map_or(true, |oid| oid == cid.oid)
                && q.pnm == cid.pnm.as_str()
        })
        .map_or(Quirks::empty(), |q| q.quirks)
}

// =============================================================================
// Card
// =============================================================================

/// A card known to the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Card {
    pub(crate) kind: CardKind,
    pub(crate) rca: u16,

    pub(crate) raw_cid: [u32; 4],
    pub(crate) raw_csd: [u32; 4],
    pub(crate) raw_scr: [u32; 2],
    pub(crate) raw_sd_status: [u32; 16],
    pub(crate) raw_ext_csd: Option<Box<ExtCsd>>,

    pub(crate) cid: Cid,
    pub(crate) csd: Csd,
    pub(crate) scr: Scr,
    pub(crate) sd_status: SdStatus,

    pub(crate) sec_count: u64,
    pub(crate) erase_sector: u32,
    pub(crate) high_cap: bool,
    pub(crate) cmd6_time: u32,
    pub(crate) quirks: Quirks,

    // Negotiated
    pub(crate) read_only: bool,
    pub(crate) bus_width: BusWidth,
    pub(crate) caps: TimingCaps,

    pub(crate) id_string: String<ID_STRING_LEN>,
    pub(crate) sn_string: String<SN_STRING_LEN>,
}

impl Card {
    pub(crate) fn new(kind: CardKind, raw_cid: [u32; 4], cid: Cid, csd: Csd) -> Self {
        Self {
            kind,
            rca: 0,
            raw_cid,
            raw_csd: [0; 4],
            raw_scr: [0; 2],
            raw_sd_status: [0; 16],
            raw_ext_csd: None,
            cid,
            sec_count: csd.capacity / u64::from(SECTOR_SIZE),
            erase_sector: csd.erase_sector * csd.write_bl_len / SECTOR_SIZE,
            high_cap: csd.is_high_capacity(),
            csd,
            scr: Scr::default(),
            sd_status: SdStatus::default(),
            cmd6_time: 0,
            quirks: Quirks::empty(),
            read_only: false,
            bus_width: BusWidth::One,
            caps: TimingCaps::normal(csd.tran_speed),
            id_string: String::new(),
            sn_string: String::new(),
        }
    }

    /// Command set family
    pub fn kind(&self) -> CardKind {
        self.kind
    }

    /// Relative card address
    pub fn rca(&self) -> u16 {
        self.rca
    }

    /// Raw CID as fetched
    pub fn raw_cid(&self) -> &[u32; 4] {
        &self.raw_cid
    }

    /// Raw CSD as fetched
    pub fn raw_csd(&self) -> &[u32; 4] {
        &self.raw_csd
    }

    /// Raw SCR (SD only)
    pub fn raw_scr(&self) -> &[u32; 2] {
        &self.raw_scr
    }

    /// Raw SD status block (SD only)
    pub fn raw_sd_status(&self) -> &[u32; 16] {
        &self.raw_sd_status
    }

    /// Raw EXT_CSD (MMC v4 and later)
    pub fn raw_ext_csd(&self) -> Option<&ExtCsd> {
        self.raw_ext_csd.as_deref()
    }

    /// Decoded CID
    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    /// Decoded CSD
    pub fn csd(&self) -> &Csd {
        &self.csd
    }

    /// Decoded SCR
    pub fn scr(&self) -> &Scr {
        &self.scr
    }

    /// Decoded SD status
    pub fn sd_status(&self) -> &SdStatus {
        &self.sd_status
    }

    /// Capacity in [`SECTOR_SIZE`] sectors
    pub fn sectors(&self) -> u64 {
        self.sec_count
    }

    /// Erase sector size in sectors
    pub fn erase_sector(&self) -> u32 {
        self.erase_sector
    }

    /// Block addressed
    pub fn is_high_capacity(&self) -> bool {
        self.high_cap
    }

    /// Write protected
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Negotiated bus width
    pub fn bus_width(&self) -> BusWidth {
        self.bus_width
    }

    /// Supported timings and clock limits
    pub fn timing_caps(&self) -> &TimingCaps {
        &self.caps
    }

    /// Generic CMD6 timeout (us)
    pub fn cmd6_time(&self) -> u32 {
        self.cmd6_time
    }

    /// Device workarounds
    pub fn quirks(&self) -> Quirks {
        self.quirks
    }

    /// Identification string
    pub fn id_string(&self) -> &str {
        &self.id_string
    }

    /// Serial number string
    pub fn sn_string(&self) -> &str {
        &self.sn_string
    }

    /// Take the state that is renegotiated on every discovery pass
    pub(crate) fn adopt(&mut self, fresh: &Card) {
        self.rca = fresh.rca;
        self.read_only = fresh.read_only;
        self.bus_width = fresh.bus_width;
        self.caps = fresh.caps;
        self.cmd6_time = fresh.cmd6_time;
    }

    /// Build the id and serial strings.
    ///
    /// `SD SD01G 8.0 SN 0028FFB9 MFG 08/2008 by 3 TN` fits in 55 bytes with
    /// every field at its widest, so neither string can overflow.
    pub(crate) fn format_id_strings(&mut self) {
        let cid = &self.cid;
        let c1 = (cid.oid >> 8) as u8;
        let c2 = cid.oid as u8;
        let printable = |c: u8| (0x20..0x7f).contains(&c);

        let mut oid: String<8> = String::new();
        let _ = if printable(c1) && printable(c2) {
            write!(oid, "{}{}", c1 as char, c2 as char)
        } else {
            write!(oid, "0x{:04x}", cid.oid)
        };

        self.sn_string.clear();
        let _ = write!(self.sn_string, "{:08X}", cid.psn);

        self.id_string.clear();
        let _ = write!(
            self.id_string,
            "{}{} {} {}.{} SN {:08X} MFG {:02}/{:04} by {} {}",
            self.kind.as_str(),
            if self.high_cap { "HC" } else { "" },
            cid.pnm,
            cid.prv_major(),
            cid.prv_minor(),
            cid.psn,
            cid.mdt_month,
            cid.mdt_year,
            cid.mid,
            oid
        );
    }

    /// Per-card summary
    pub(crate) fn log_summary(&self, added: bool, timing: BusTiming, verbose: bool) {
        let level = if verbose { log::Level::Info } else { log::Level::Debug };
        log::log!(
            level,
            "mmc: card at relative address {:#06x}{}: {}",
            self.rca,
            if added { " added" } else { "" },
            self.id_string
        );
        if !self.quirks.is_empty() {
            log::log!(level, "mmc:  quirks: {:?}", self.quirks);
        }
        log::log!(
            level,
            "mmc:  bus: {}bit, {}MHz ({} timing)",
            self.bus_width.lines(),
            timing_to_max_clock_hz(timing, &self.caps) / 1_000_000,
            timing_mode_label(timing)
        );
        log::log!(
            level,
            "mmc:  memory: {} blocks, erase sector {} blocks{}",
            self.sec_count,
            self.erase_sector,
            if self.read_only { ", read-only" } else { "" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::{decode_cid_sd, decode_csd_sd, insert_bits};

    fn sd_card(oid: u16, pnm: &[u8; 5], hc: bool) -> Card {
        let mut raw = [0u32; 4];
        insert_bits(&mut raw, 128, 120, 8, 3);
        insert_bits(&mut raw, 128, 104, 16, u32::from(oid));
        for (i, b) in pnm.iter().enumerate() {
            insert_bits(&mut raw, 128, 96 - i * 8, 8, u32::from(*b));
        }
        insert_bits(&mut raw, 128, 56, 8, 0x80);
        insert_bits(&mut raw, 128, 24, 32, 0x0028_FFB9);
        insert_bits(&mut raw, 128, 12, 8, 8);
        insert_bits(&mut raw, 128, 8, 4, 8);

        let mut csd_raw = [0u32; 4];
        insert_bits(&mut csd_raw, 128, 126, 2, u32::from(hc));
        insert_bits(&mut csd_raw, 128, 80, 4, 9);
        insert_bits(&mut csd_raw, 128, 22, 4, 9);
        let csd = decode_csd_sd(&csd_raw).unwrap();
        Card::new(CardKind::Sd, raw, decode_cid_sd(&raw), csd)
    }

    #[test]
    fn test_id_string() {
        let mut card = sd_card(u16::from_be_bytes(*b"TN"), b"SD01G", false);
        card.format_id_strings();
        assert_eq!(card.id_string(), "SD SD01G 8.0 SN 0028FFB9 MFG 08/2008 by 3 TN");
        assert_eq!(card.sn_string(), "0028FFB9");
    }

    #[test]
    fn test_id_string_binary_oid() {
        let mut card = sd_card(0x0100, b"SU08G", true);
        card.format_id_strings();
        assert!(card.id_string().starts_with("SDHC SU08G"));
        assert!(card.id_string().ends_with("by 3 0x0100"));
    }

    #[test]
    fn test_quirk_lookup() {
        let mut cid = sd_card(0x0100, b"SEM04", false).cid;
        cid.mid = 0x02;
        cid.pnm = String::new();
        let _ = cid.pnm.push_str("SEM08G");
        assert_eq!(lookup_quirks(&cid), Quirks::INAND_CMD38);

        cid.oid = 0x0200;
        assert_eq!(lookup_quirks(&cid), Quirks::empty());

        cid.mid = 0x70;
        cid.pnm.clear();
        let _ = cid.pnm.push_str("V10016");
        assert_eq!(lookup_quirks(&cid), Quirks::BROKEN_TRIM);
    }

    #[test]
    fn test_adopt_keeps_registers() {
        let mut known = sd_card(0x0100, b"SU08G", false);
        known.raw_csd = [1, 2, 3, 4];
        let mut fresh = known.clone();
        fresh.raw_csd = [9, 9, 9, 9];
        fresh.rca = 7;
        fresh.bus_width = BusWidth::Four;

        known.adopt(&fresh);
        assert_eq!(known.rca(), 7);
        assert_eq!(known.bus_width(), BusWidth::Four);
        assert_eq!(known.raw_csd(), &[1, 2, 3, 4]);
    }
}
