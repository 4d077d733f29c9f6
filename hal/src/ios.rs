//! # Bus Settings
//!
//! The electrical and timing state of the bus. The bus manager edits a
//! shadow copy and pushes it to the bridge in one batch.

use static_assertions::const_assert;

/// Bus timing modes, ordered from slowest to fastest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum BusTiming {
    /// Default speed
    Normal = 0,
    /// SD high speed / MMC high speed
    HighSpeed = 1,
    /// UHS-I SDR12
    UhsSdr12 = 2,
    /// UHS-I SDR25
    UhsSdr25 = 3,
    /// UHS-I SDR50
    UhsSdr50 = 4,
    /// UHS-I DDR50
    UhsDdr50 = 5,
    /// UHS-I SDR104
    UhsSdr104 = 6,
    /// eMMC dual data rate at 52 MHz
    MmcDdr52 = 7,
    /// eMMC HS200
    MmcHs200 = 8,
    /// eMMC HS400
    MmcHs400 = 9,
    /// eMMC HS400 with enhanced strobe
    MmcHs400Es = 10,
}

const_assert!((BusTiming::MAX as u32) < u32::BITS);

impl BusTiming {
    /// Fastest timing
    pub const MAX: BusTiming = BusTiming::MmcHs400Es;

    /// All timings, slowest first
    pub const ALL: [BusTiming; 11] = [
        BusTiming::Normal,
        BusTiming::HighSpeed,
        BusTiming::UhsSdr12,
        BusTiming::UhsSdr25,
        BusTiming::UhsSdr50,
        BusTiming::UhsDdr50,
        BusTiming::UhsSdr104,
        BusTiming::MmcDdr52,
        BusTiming::MmcHs200,
        BusTiming::MmcHs400,
        BusTiming::MmcHs400Es,
    ];

    /// The next slower timing, `None` below `Normal`
    pub fn slower(self) -> Option<BusTiming> {
        let idx = self as usize;
        if idx == 0 { None } else { Some(Self::ALL[idx - 1]) }
    }

    /// Whether data is clocked on both edges
    pub const fn is_ddr(self) -> bool {
        matches!(
            self,
            BusTiming::UhsDdr50 | BusTiming::MmcDdr52 | BusTiming::MmcHs400 | BusTiming::MmcHs400Es
        )
    }
}

/// Data bus width
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BusWidth {
    /// DAT0 only
    One,
    /// DAT0-DAT3
    Four,
    /// DAT0-DAT7
    Eight,
}

impl BusWidth {
    /// Number of data lines
    pub const fn lines(self) -> u32 {
        match self {
            BusWidth::One => 1,
            BusWidth::Four => 4,
            BusWidth::Eight => 8,
        }
    }
}

/// I/O signalling voltage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vccq {
    /// 1.2 V
    V120,
    /// 1.8 V
    V180,
    /// 3.3 V
    V330,
}

/// CMD line drive mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalMode {
    /// Identification phase
    OpenDrain,
    /// Data transfer phase
    PushPull,
}

/// Chip select line (SPI compatibility)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipSelect {
    /// Leave the line alone
    DontCare,
    /// Drive high
    High,
    /// Drive low
    Low,
}

/// Card power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerMode {
    /// Supply off
    Off,
    /// Supply ramping, clock stopped
    Up,
    /// Supply stable, clock running
    On,
}

/// Complete bus settings pushed through [`crate::MmcBridge::update_ios`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ios {
    /// Card clock in Hz, 0 to gate it
    pub clock: u32,
    /// VDD as an OCR bit index, `None` when unpowered
    pub vdd: Option<u8>,
    /// Signalling voltage
    pub vccq: Vccq,
    /// CMD drive mode
    pub signal_mode: SignalMode,
    /// Chip select
    pub chip_select: ChipSelect,
    /// Data width
    pub bus_width: BusWidth,
    /// Power state
    pub power_mode: PowerMode,
    /// Timing mode
    pub timing: BusTiming,
}

impl Ios {
    /// Powered-off, 1-bit, 3.3 V settings
    pub const fn new() -> Self {
        Self {
            clock: 0,
            vdd: None,
            vccq: Vccq::V330,
            signal_mode: SignalMode::OpenDrain,
            chip_select: ChipSelect::DontCare,
            bus_width: BusWidth::One,
            power_mode: PowerMode::Off,
            timing: BusTiming::Normal,
        }
    }
}

impl Default for Ios {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_order() {
        assert!(BusTiming::Normal < BusTiming::HighSpeed);
        assert!(BusTiming::MmcHs200 < BusTiming::MmcHs400);
        assert_eq!(BusTiming::MAX, *BusTiming::ALL.last().unwrap());
        assert_eq!(BusTiming::HighSpeed.slower(), Some(BusTiming::Normal));
        assert_eq!(BusTiming::Normal.slower(), None);
        for (i, t) in BusTiming::ALL.iter().enumerate() {
            assert_eq!(*t as usize, i);
        }
    }

    #[test]
    fn test_ddr() {
        assert!(BusTiming::MmcDdr52.is_ddr());
        assert!(!BusTiming::MmcHs200.is_ddr());
    }
}
