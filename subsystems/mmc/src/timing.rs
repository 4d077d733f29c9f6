//! # Bus Timing
//!
//! Per-timing clock limits, diagnostic labels and the clock negotiation
//! shared by every card on the bus.

use bitflags::bitflags;
use helix_mmc_hal::{BusTiming, HostCaps};
use static_assertions::const_assert;

// =============================================================================
// Clock Limits
// =============================================================================

/// Card identification clock (Hz)
pub const IDENTIFY_FREQUENCY: u32 = 400_000;

/// SD high speed
pub const SD_HS_MAX: u32 = 50_000_000;
/// UHS-I SDR12
pub const SD_SDR12_MAX: u32 = 25_000_000;
/// UHS-I SDR25
pub const SD_SDR25_MAX: u32 = 50_000_000;
/// UHS-I DDR50
pub const SD_DDR50_MAX: u32 = 50_000_000;
/// UHS-I SDR50
pub const SD_SDR50_MAX: u32 = 100_000_000;
/// UHS-I SDR104
pub const SD_SDR104_MAX: u32 = 208_000_000;

/// MMC high speed, 26 MHz devices
pub const MMC_HS_26_MAX: u32 = 26_000_000;
/// MMC high speed, 52 MHz devices
pub const MMC_HS_52_MAX: u32 = 52_000_000;
/// MMC DDR52
pub const MMC_DDR52_MAX: u32 = 52_000_000;
/// MMC HS200, HS400 and HS400ES
pub const MMC_HS200_HS400ES_MAX: u32 = 200_000_000;

bitflags! {
    /// Set of timings, one bit per [`BusTiming`] discriminant
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Timings: u32 {
        /// Default speed
        const NORMAL = 1 << BusTiming::Normal as u32;
        /// High speed
        const HIGH_SPEED = 1 << BusTiming::HighSpeed as u32;
        /// UHS-I SDR12
        const UHS_SDR12 = 1 << BusTiming::UhsSdr12 as u32;
        /// UHS-I SDR25
        const UHS_SDR25 = 1 << BusTiming::UhsSdr25 as u32;
        /// UHS-I SDR50
        const UHS_SDR50 = 1 << BusTiming::UhsSdr50 as u32;
        /// UHS-I DDR50
        const UHS_DDR50 = 1 << BusTiming::UhsDdr50 as u32;
        /// UHS-I SDR104
        const UHS_SDR104 = 1 << BusTiming::UhsSdr104 as u32;
        /// MMC DDR52
        const MMC_DDR52 = 1 << BusTiming::MmcDdr52 as u32;
        /// MMC HS200
        const MMC_HS200 = 1 << BusTiming::MmcHs200 as u32;
        /// MMC HS400
        const MMC_HS400 = 1 << BusTiming::MmcHs400 as u32;
        /// MMC HS400 with enhanced strobe
        const MMC_HS400ES = 1 << BusTiming::MmcHs400Es as u32;
    }
}

const_assert!((BusTiming::MmcHs400Es as u32) < 32);

impl Timings {
    /// Single-timing set
    pub const fn of(timing: BusTiming) -> Self {
        Self::from_bits_retain(1 << timing as u32)
    }

    /// Whether `timing` is in the set
    pub const fn has(self, timing: BusTiming) -> bool {
        self.bits() & (1 << timing as u32) != 0
    }

    /// Whether the set holds anything beyond normal speed
    pub fn beyond_normal(self) -> bool {
        !self.difference(Timings::NORMAL).is_empty()
    }
}

/// What a card can do, as far as clock negotiation is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingCaps {
    /// Supported timings; normal is always present
    pub timings: Timings,
    /// Timings the card runs at 1.2 V VCCQ
    pub vccq_120: Timings,
    /// Timings the card runs at 1.8 V VCCQ
    pub vccq_180: Timings,
    /// Maximum clock at normal speed (Hz)
    pub tran_speed: u32,
    /// Maximum clock at high speed (Hz)
    pub hs_tran_speed: u32,
}

impl TimingCaps {
    /// Normal speed only, at `tran_speed`
    pub const fn normal(tran_speed: u32) -> Self {
        Self {
            timings: Timings::NORMAL,
            vccq_120: Timings::empty(),
            vccq_180: Timings::empty(),
            tran_speed,
            hs_tran_speed: 0,
        }
    }
}

/// Highest clock a card accepts at `timing`
pub fn timing_to_max_clock_hz(timing: BusTiming, caps: &TimingCaps) -> u32 {
    match timing {
        BusTiming::Normal => caps.tran_speed,
        BusTiming::HighSpeed => caps.hs_tran_speed,
        BusTiming::UhsSdr12 => SD_SDR12_MAX,
        BusTiming::UhsSdr25 => SD_SDR25_MAX,
        BusTiming::UhsDdr50 => SD_DDR50_MAX,
        BusTiming::UhsSdr50 => SD_SDR50_MAX,
        BusTiming::UhsSdr104 => SD_SDR104_MAX,
        BusTiming::MmcDdr52 => MMC_DDR52_MAX,
        BusTiming::MmcHs200 | BusTiming::MmcHs400 | BusTiming::MmcHs400Es => {
            MMC_HS200_HS400ES_MAX
        }
    }
}

/// Human-readable timing name
pub fn timing_mode_label(timing: BusTiming) -> &'static str {
    match timing {
        BusTiming::Normal => "normal speed",
        BusTiming::HighSpeed => "high speed",
        BusTiming::UhsSdr12 | BusTiming::UhsSdr25 | BusTiming::UhsSdr50 | BusTiming::UhsSdr104 => {
            "single data rate"
        }
        BusTiming::UhsDdr50 | BusTiming::MmcDdr52 => "dual data rate",
        BusTiming::MmcHs200 => "HS200",
        BusTiming::MmcHs400 => "HS400",
        BusTiming::MmcHs400Es => "HS400 with enhanced strobe",
    }
}

// =============================================================================
// Negotiation
// =============================================================================

/// Outcome of clock negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockPlan {
    /// Bus clock (Hz)
    pub clock: u32,
    /// Bus timing
    pub timing: BusTiming,
    /// Passes over the card set until nothing changed
    pub iterations: u32,
}

fn supported(host: HostCaps, card: &TimingCaps, timing: BusTiming) -> bool {
    timing == BusTiming::Normal || (card.timings.has(timing) && host.supports_timing(timing))
}

/// Compute the fastest clock and timing every card can run at.
///
/// Starts from the host's fastest timing and `f_max`. Each pass walks the
/// cards, lowering the timing to the next one both the card and the host
/// support, and lowering the clock to the card's limit at that timing. The
/// pass repeats until neither value moves. Both only decrease, so the loop
/// ends after at most one pass per timing level plus a settling pass.
pub fn negotiate_clock(f_max: u32, host: HostCaps, cards: &[TimingCaps]) -> ClockPlan {
    let mut timing = BusTiming::MAX;
    while !host.supports_timing(timing) {
        match timing.slower() {
            Some(t) => timing = t,
            None => break,
        }
    }

    let mut clock = f_max;
    let mut iterations = 0;
    loop {
        iterations += 1;
        let mut changed = false;
        for card in cards {
            while !supported(host, card, timing) {
                match timing.slower() {
                    Some(t) => {
                        timing = t;
                        changed = true;
                    }
                    None => break,
                }
            }
            let limit = timing_to_max_clock_hz(timing, card);
            if limit < clock {
                clock = limit;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    ClockPlan { clock, timing, iterations }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card_hs(tran: u32, hs: u32) -> TimingCaps {
        TimingCaps {
            timings: Timings::NORMAL | Timings::HIGH_SPEED,
            hs_tran_speed: hs,
            ..TimingCaps::normal(tran)
        }
    }

    #[test]
    fn test_labels_and_limits_total() {
        let caps = card_hs(25_000_000, 50_000_000);
        for timing in BusTiming::ALL {
            assert!(!timing_mode_label(timing).is_empty());
            assert!(timing_to_max_clock_hz(timing, &caps) > 0);
        }
        assert_eq!(timing_mode_label(BusTiming::MmcHs400Es), "HS400 with enhanced strobe");
        assert_eq!(timing_to_max_clock_hz(BusTiming::UhsSdr104, &caps), 208_000_000);
        assert_eq!(timing_to_max_clock_hz(BusTiming::HighSpeed, &caps), 50_000_000);
    }

    #[test]
    fn test_timings_set() {
        let set = Timings::NORMAL | Timings::of(BusTiming::MmcHs200);
        assert!(set.has(BusTiming::MmcHs200));
        assert!(!set.has(BusTiming::MmcHs400));
        assert!(set.beyond_normal());
        assert!(!Timings::NORMAL.beyond_normal());
    }

    #[test]
    fn test_converges_to_slowest_card() {
        let host = HostCaps::BUS_WIDTH_4 | HostCaps::HIGH_SPEED;
        let fast = card_hs(MMC_HS_26_MAX, MMC_HS_52_MAX);
        let slow = TimingCaps::normal(MMC_HS_26_MAX);

        let plan = negotiate_clock(52_000_000, host, &[fast, slow]);
        assert!(plan.clock <= 26_000_000);
        assert_eq!(plan.timing, BusTiming::Normal);
        assert_eq!(timing_mode_label(plan.timing), "normal speed");
        assert!(plan.iterations as usize <= BusTiming::ALL.len() + 1);

        // Card order must not matter
        let plan2 = negotiate_clock(52_000_000, host, &[slow, fast]);
        assert_eq!((plan2.clock, plan2.timing), (plan.clock, plan.timing));
    }

    #[test]
    fn test_host_limits_apply() {
        let card = TimingCaps {
            timings: Timings::NORMAL | Timings::HIGH_SPEED | Timings::MMC_HS200,
            vccq_180: Timings::MMC_HS200,
            ..card_hs(MMC_HS_26_MAX, MMC_HS_52_MAX)
        };

        let plan = negotiate_clock(200_000_000, HostCaps::HIGH_SPEED, &[card]);
        assert_eq!(plan.timing, BusTiming::HighSpeed);
        assert_eq!(plan.clock, MMC_HS_52_MAX);

        let plan = negotiate_clock(150_000_000, HostCaps::HIGH_SPEED | HostCaps::MMC_HS200_180, &[card]);
        assert_eq!(plan.timing, BusTiming::MmcHs200);
        assert_eq!(plan.clock, 150_000_000);
    }

    #[test]
    fn test_no_cards_uses_host_maximum() {
        let plan = negotiate_clock(50_000_000, HostCaps::HIGH_SPEED, &[]);
        assert_eq!(plan.timing, BusTiming::HighSpeed);
        assert_eq!(plan.clock, 50_000_000);
        assert_eq!(plan.iterations, 1);
    }

    #[test]
    fn test_iteration_bound_many_cards() {
        let host = HostCaps::all();
        let mut cards = [TimingCaps::normal(20_000_000); 16];
        cards[0] = TimingCaps { timings: Timings::all(), ..card_hs(26_000_000, 52_000_000) };
        let plan = negotiate_clock(208_000_000, host, &cards);
        assert_eq!(plan.timing, BusTiming::Normal);
        assert_eq!(plan.clock, 20_000_000);
        assert!(plan.iterations as usize <= BusTiming::ALL.len() + 1);
    }
}
