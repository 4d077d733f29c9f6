//! Operating-point negotiation.
//!
//! [`negotiate_clock`] picks one clock and timing for the whole bus; the
//! steps here program every card for it. A card that fails a step is left
//! where it is and the next card is tried.

use super::MmcBus;
use crate::card::{Card, CardKind};
use crate::executor::Executor;
use crate::regs::{self, ext_csd};
use crate::timing::{negotiate_clock, MMC_HS200_HS400ES_MAX, MMC_HS_26_MAX, MMC_HS_52_MAX};
use crate::{MmcError, MmcResult};
use helix_mmc_hal::{ocr, BusTiming, BusWidth, CommandError, MmcBridge, Vccq};

const INVALID: MmcError = MmcError::Command(CommandError::Invalid);

/// Log a failed negotiation step against `rca`
fn step<T>(rca: u16, what: &str, result: MmcResult<T>) -> MmcResult<T> {
    result.map_err(|err| {
        log::warn!("mmc: card at relative address {} failed to {}: {}", rca, what, err);
        err
    })
}

impl<B: MmcBridge> MmcBus<B> {
    /// Negotiate and program the bus operating point, returning the clock
    pub(super) fn calculate_clock(&self) -> u32 {
        let host = self.bridge.caps();
        let plan = negotiate_clock(self.bridge.f_max(), host, &self.registry.timing_caps());
        log::debug!(
            "mmc: negotiated {} Hz {:?} after {} pass(es)",
            plan.clock,
            plan.timing,
            plan.iterations
        );

        let rcas = self.registry.rcas();
        if rcas.is_empty() {
            self.session.lock().clock = 0;
            return 0;
        }

        let max_timing = plan.timing;
        let hs400 = max_timing == BusTiming::MmcHs400;
        // HS400 is entered through HS200 tuning
        let timing = if hs400 { BusTiming::MmcHs200 } else { max_timing };

        let exec = self.exec();
        for rca in rcas {
            let Some(card) = self.registry.with_rca(rca, Card::clone) else {
                continue;
            };
            let _ = self.program_card(&exec, &card, timing, max_timing, plan.clock, hs400);
        }
        let _ = exec.select_card(0);

        self.session.lock().clock = plan.clock;
        self.log_negotiated(plan.clock, max_timing);
        plan.clock
    }

    fn program_card(
        &self,
        exec: &Executor<'_, B>,
        card: &Card,
        timing: BusTiming,
        max_timing: BusTiming,
        clock: u32,
        hs400: bool,
    ) -> MmcResult<()> {
        let rca = card.rca();
        if card.timing_caps().timings.beyond_normal() {
            step(rca, "select", exec.select_card(rca).map_err(MmcError::from))?;

            if matches!(timing, BusTiming::MmcHs200 | BusTiming::MmcHs400Es) {
                step(rca, "set VCCQ", self.set_vccq(card, timing))?;
            }

            if timing == BusTiming::MmcHs200 {
                step(rca, "set bus width", self.set_card_bus_width(exec, card, timing))?;
                self.set_ios(|ios| ios.bus_width = card.bus_width());
                self.apply_ios()?;
            } else if timing == BusTiming::MmcHs400Es {
                step(rca, "switch to HS400ES", self.switch_to_hs400(exec, card, clock, timing))?;
                return step(rca, "set power class", self.set_power_class(exec, card));
            }

            step(rca, "set timing", self.set_timing(exec, card, timing))?;

            if timing == BusTiming::MmcDdr52 {
                step(rca, "set bus width", self.set_card_bus_width(exec, card, timing))?;
                self.set_ios(|ios| ios.bus_width = card.bus_width());
                self.apply_ios()?;
                step(rca, "set VCCQ", self.set_vccq(card, timing))?;
            }
        }

        // Clock goes in before tuning
        self.set_ios(|ios| ios.clock = clock);
        self.apply_ios()?;
        step(rca, "execute initial tuning", self.bridge.tune(hs400).map_err(MmcError::from))?;

        if hs400 {
            step(rca, "switch to HS400", self.switch_to_hs400(exec, card, clock, max_timing))?;
        }
        step(rca, "set power class", self.set_power_class(exec, card))
    }

    /// Program the card's bus width for `timing`
    pub(super) fn set_card_bus_width(
        &self,
        exec: &Executor<'_, B>,
        card: &Card,
        timing: BusTiming,
    ) -> MmcResult<()> {
        let rca = card.rca();
        match card.kind() {
            CardKind::Sd => {
                let arg = match card.bus_width() {
                    BusWidth::One => crate::ops::SD_BUS_WIDTH_1,
                    BusWidth::Four => crate::ops::SD_BUS_WIDTH_4,
                    BusWidth::Eight => return Err(INVALID),
                };
                exec.app_set_bus_width(rca, arg)?;
            }
            CardKind::Mmc => {
                // Pre-v4 cards have no EXT_CSD and only run a 1-bit bus
                if card.csd().spec_vers < 4 {
                    return Ok(());
                }
                let hs400 = matches!(timing, BusTiming::MmcHs400 | BusTiming::MmcHs400Es);
                let value = match card.bus_width() {
                    BusWidth::One if hs400 => return Err(INVALID),
                    BusWidth::One => ext_csd::BUS_WIDTH_1,
                    BusWidth::Four if hs400 => return Err(INVALID),
                    BusWidth::Four if timing == BusTiming::MmcDdr52 => ext_csd::BUS_WIDTH_4_DDR,
                    BusWidth::Four => ext_csd::BUS_WIDTH_4,
                    BusWidth::Eight => match timing {
                        BusTiming::MmcHs400Es => ext_csd::BUS_WIDTH_ES | ext_csd::BUS_WIDTH_8_DDR,
                        BusTiming::MmcDdr52 | BusTiming::MmcHs400 => ext_csd::BUS_WIDTH_8_DDR,
                        _ => ext_csd::BUS_WIDTH_8,
                    },
                };
                exec.mmc_switch(
                    rca,
                    ext_csd::CMD_SET_NORMAL,
                    ext_csd::BUS_WIDTH,
                    value,
                    card.cmd6_time(),
                    true,
                )?;
            }
        }
        Ok(())
    }

    /// Move the bus to the VCCQ the card needs at `timing`
    pub(super) fn set_vccq(&self, card: &Card, timing: BusTiming) -> MmcResult<()> {
        let caps = card.timing_caps();
        let vccq = if caps.vccq_120.has(timing) {
            Vccq::V120
        } else if caps.vccq_180.has(timing) {
            Vccq::V180
        } else {
            Vccq::V330
        };
        if self.ios().vccq == vccq {
            return Ok(());
        }
        self.set_ios(|ios| ios.vccq = vccq);
        self.bridge.switch_vccq(&self.ios()).map_err(|err| {
            log::debug!("mmc: VCCQ switch to {:?} failed: {}", vccq, err);
            INVALID
        })
    }

    /// Switch the selected card, then the bus, to `timing`
    pub(super) fn set_timing(&self, exec: &Executor<'_, B>, card: &Card, timing: BusTiming) -> MmcResult<()> {
        match card.kind() {
            CardKind::Sd => {
                let value = match timing {
                    BusTiming::Normal => regs::SD_SWITCH_NORMAL_MODE,
                    BusTiming::HighSpeed => regs::SD_SWITCH_HS_MODE,
                    _ => return Err(INVALID),
                };
                let switch = exec.sd_switch(regs::SD_SWITCH_MODE_SET, regs::SD_SWITCH_GROUP1, value)?;
                if switch.group1_selection() != value {
                    return Err(MmcError::Command(CommandError::Failed));
                }
                self.set_ios(|ios| ios.timing = timing);
                self.apply_ios()
            }
            CardKind::Mmc => {
                let value = match timing {
                    BusTiming::Normal => ext_csd::HS_TIMING_BC,
                    BusTiming::HighSpeed | BusTiming::MmcDdr52 => ext_csd::HS_TIMING_HS,
                    BusTiming::MmcHs200 => ext_csd::HS_TIMING_HS200,
                    BusTiming::MmcHs400 | BusTiming::MmcHs400Es => ext_csd::HS_TIMING_HS400,
                    _ => return Err(INVALID),
                };
                let rca = card.rca();
                exec.mmc_switch(
                    rca,
                    ext_csd::CMD_SET_NORMAL,
                    ext_csd::HS_TIMING,
                    value,
                    card.cmd6_time(),
                    false,
                )?;
                self.set_ios(|ios| ios.timing = timing);
                self.apply_ios()?;
                exec.switch_status(rca, card.cmd6_time())?;
                Ok(())
            }
        }
    }

    /// Reach HS400 or HS400ES by way of high speed at the HS clock
    fn switch_to_hs400(
        &self,
        exec: &Executor<'_, B>,
        card: &Card,
        clock: u32,
        max_timing: BusTiming,
    ) -> MmcResult<()> {
        let rca = card.rca();
        exec.mmc_switch(
            rca,
            ext_csd::CMD_SET_NORMAL,
            ext_csd::HS_TIMING,
            ext_csd::HS_TIMING_HS,
            card.cmd6_time(),
            false,
        )?;
        let hs_clock = card.timing_caps().hs_tran_speed;
        self.set_ios(|ios| {
            ios.timing = BusTiming::HighSpeed;
            ios.clock = hs_clock;
        });
        self.apply_ios()?;
        exec.switch_status(rca, card.cmd6_time())?;

        self.set_card_bus_width(exec, card, max_timing)?;
        self.set_ios(|ios| ios.bus_width = card.bus_width());
        self.set_timing(exec, card, max_timing)?;

        self.set_ios(|ios| ios.clock = clock);
        self.apply_ios()
    }

    /// Raise the selected MMC card's power class for the current bus settings
    pub(super) fn set_power_class(&self, exec: &Executor<'_, B>, card: &Card) -> MmcResult<()> {
        let ios = self.ios();
        let width = card.bus_width();
        if card.kind() != CardKind::Mmc
            || card.csd().spec_vers < 4
            || ios.timing == BusTiming::Normal
            || width == BusWidth::One
        {
            return Ok(());
        }
        let Some(ext) = card.raw_ext_csd() else {
            return Ok(());
        };

        let clock = ios.clock;
        let ddr = ios.timing == BusTiming::MmcDdr52;
        let vdd = ios.vdd.map_or(0, |bit| 1u32 << bit);
        let offset = match vdd {
            ocr::LOW_VOLTAGE => {
                if clock <= MMC_HS_26_MAX {
                    Some(ext_csd::PWR_CL_26_195)
                } else if clock <= MMC_HS_52_MAX {
                    Some(if ddr { ext_csd::PWR_CL_52_195_DDR } else { ext_csd::PWR_CL_52_195 })
                } else if clock <= MMC_HS200_HS400ES_MAX {
                    Some(ext_csd::PWR_CL_200_195)
                } else {
                    None
                }
            }
            v if (ocr::V270_280..=ocr::V350_360).contains(&v) => {
                if clock <= MMC_HS_26_MAX {
                    Some(ext_csd::PWR_CL_26_360)
                } else if clock <= MMC_HS_52_MAX {
                    Some(if ddr { ext_csd::PWR_CL_52_360_DDR } else { ext_csd::PWR_CL_52_360 })
                } else if clock <= MMC_HS200_HS400ES_MAX {
                    Some(if width == BusWidth::Eight {
                        ext_csd::PWR_CL_200_360_DDR
                    } else {
                        ext_csd::PWR_CL_200_360
                    })
                } else {
                    None
                }
            }
            _ => {
                log::warn!("mmc: no power class support for VDD {:#x}", vdd);
                return Err(INVALID);
            }
        };

        let raw = offset.map_or(0, |offset| ext.byte(offset));
        let value = if width == BusWidth::Eight {
            (raw & ext_csd::POWER_CLASS_8BIT_MASK) >> ext_csd::POWER_CLASS_8BIT_SHIFT
        } else {
            raw & ext_csd::POWER_CLASS_4BIT_MASK
        };
        if value == 0 {
            return Ok(());
        }
        exec.mmc_switch(
            card.rca(),
            ext_csd::CMD_SET_NORMAL,
            ext_csd::POWER_CLASS,
            value,
            card.cmd6_time(),
            true,
        )?;
        Ok(())
    }
}
