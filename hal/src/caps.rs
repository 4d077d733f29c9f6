//! # Host Capabilities
//!
//! Capability bits a bridge advertises, and the OCR register layout shared
//! by the host's voltage window and the cards' operating conditions.

use crate::ios::BusTiming;
use bitflags::bitflags;

bitflags! {
    /// Host controller capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HostCaps: u32 {
        /// 4-bit data bus
        const BUS_WIDTH_4 = 1 << 0;
        /// 8-bit data bus
        const BUS_WIDTH_8 = 1 << 1;
        /// High speed timing (SD 50 MHz / MMC 52 MHz)
        const HIGH_SPEED = 1 << 2;
        /// Host cannot access the boot partition without a reset
        const BOOT_NOACC = 1 << 4;
        /// Host detects the end of busy signalling in hardware
        const WAIT_WHILE_BUSY = 1 << 5;
        /// UHS-I SDR12
        const UHS_SDR12 = 1 << 6;
        /// UHS-I SDR25
        const UHS_SDR25 = 1 << 7;
        /// UHS-I SDR50
        const UHS_SDR50 = 1 << 8;
        /// UHS-I SDR104
        const UHS_SDR104 = 1 << 9;
        /// UHS-I DDR50
        const UHS_DDR50 = 1 << 10;
        /// eMMC DDR52 at 1.2 V
        const MMC_DDR52_120 = 1 << 11;
        /// eMMC DDR52 at 1.8 V
        const MMC_DDR52_180 = 1 << 12;
        /// eMMC HS200 at 1.2 V
        const MMC_HS200_120 = 1 << 13;
        /// eMMC HS200 at 1.8 V
        const MMC_HS200_180 = 1 << 14;
        /// eMMC HS400 at 1.2 V
        const MMC_HS400_120 = 1 << 15;
        /// eMMC HS400 at 1.8 V
        const MMC_HS400_180 = 1 << 16;
        /// eMMC enhanced strobe
        const MMC_ENH_STROBE = 1 << 18;
        /// 1.2 V I/O signalling
        const SIGNALING_120 = 1 << 23;
        /// 1.8 V I/O signalling
        const SIGNALING_180 = 1 << 24;
        /// 3.3 V I/O signalling
        const SIGNALING_330 = 1 << 25;

        /// Any DDR52 voltage
        const MMC_DDR52 = Self::MMC_DDR52_120.bits() | Self::MMC_DDR52_180.bits();
        /// Any HS200 voltage
        const MMC_HS200 = Self::MMC_HS200_120.bits() | Self::MMC_HS200_180.bits();
        /// Any HS400 voltage
        const MMC_HS400 = Self::MMC_HS400_120.bits() | Self::MMC_HS400_180.bits();
    }
}

impl HostCaps {
    /// Whether the host can drive the bus with `timing`
    pub fn supports_timing(self, timing: BusTiming) -> bool {
        match timing {
            BusTiming::Normal => true,
            BusTiming::HighSpeed => self.contains(Self::HIGH_SPEED),
            BusTiming::UhsSdr12 => self.contains(Self::UHS_SDR12),
            BusTiming::UhsSdr25 => self.contains(Self::UHS_SDR25),
            BusTiming::UhsSdr50 => self.contains(Self::UHS_SDR50),
            BusTiming::UhsDdr50 => self.contains(Self::UHS_DDR50),
            BusTiming::UhsSdr104 => self.contains(Self::UHS_SDR104),
            BusTiming::MmcDdr52 => self.intersects(Self::MMC_DDR52),
            BusTiming::MmcHs200 => self.intersects(Self::MMC_HS200),
            BusTiming::MmcHs400 => self.intersects(Self::MMC_HS400),
            BusTiming::MmcHs400Es => {
                self.intersects(Self::MMC_HS400) && self.contains(Self::MMC_ENH_STROBE)
            }
        }
    }
}

/// OCR (operating conditions register) bits
pub mod ocr {
    /// 1.70 V - 1.95 V window (MMC dual-voltage)
    pub const LOW_VOLTAGE: u32 = 1 << 7;
    /// Lowest VDD bit index
    pub const MIN_VOLTAGE_SHIFT: u32 = 7;
    /// 2.7 V - 2.8 V
    pub const V270_280: u32 = 1 << 15;
    /// 2.8 V - 2.9 V
    pub const V280_290: u32 = 1 << 16;
    /// 2.9 V - 3.0 V
    pub const V290_300: u32 = 1 << 17;
    /// 3.0 V - 3.1 V
    pub const V300_310: u32 = 1 << 18;
    /// 3.1 V - 3.2 V
    pub const V310_320: u32 = 1 << 19;
    /// 3.2 V - 3.3 V
    pub const V320_330: u32 = 1 << 20;
    /// 3.3 V - 3.4 V
    pub const V330_340: u32 = 1 << 21;
    /// 3.4 V - 3.5 V
    pub const V340_350: u32 = 1 << 22;
    /// 3.5 V - 3.6 V
    pub const V350_360: u32 = 1 << 23;
    /// Highest VDD bit index
    pub const MAX_VOLTAGE_SHIFT: u32 = 23;
    /// Card requests 1.8 V signalling
    pub const S18R: u32 = 1 << 24;
    /// Card capacity status (SDHC/SDXC, sector-addressed MMC)
    pub const CCS: u32 = 1 << 30;
    /// Card power-up complete (active low busy)
    pub const CARD_BUSY: u32 = 1 << 31;
    /// All VDD window bits
    pub const VOLTAGE: u32 = 0x3FFF_FFFF;

    /// Index of the highest voltage bit set in `ocr`, if any
    pub fn highest_voltage(ocr: u32) -> Option<u8> {
        (MIN_VOLTAGE_SHIFT..=MAX_VOLTAGE_SHIFT)
            .rev()
            .find(|&bit| ocr & (1 << bit) != 0)
            .map(|bit| bit as u8)
    }
}
