//! # Bus Manager
//!
//! Owns one bus: powers it, probes the command set, discovers and
//! identifies cards, negotiates their operating point and arbitrates
//! ownership between the bus itself and card consumers.
//!
//! ## State Machine
//!
//! ```text
//! PoweredOff ──power_up──► IdentifyMode ──SD probe ok──► SdAcquire ──┐
//!      ▲                        │                                    │
//!      │                        ├──MMC probe ok──► MmcAcquire ───────┤
//!      │                        │                                    │ discover
//!      └──no compatible cards───┘                                    ▼
//!      ▲                                                         Negotiate
//!      │ power_down / detach                                         │
//!      └──────────────────────────── Ready ◄──── calculate_clock ────┘
//! ```
//!
//! ## Locking
//!
//! Session state sits behind a spin lock that is never held across a
//! bridge call. Blocking between competing owners happens in
//! [`MmcBridge::acquire_host`].

mod discovery;
mod negotiate;

use crate::card::{CardHandle, CardKind, Quirks, SECTOR_SIZE};
use crate::config::BusConfig;
use crate::executor::Executor;
use crate::registry::CardRegistry;
use crate::timing::timing_mode_label;
use crate::{MmcError, MmcResult};
use alloc::vec::Vec;
use core::sync::atomic::AtomicU32;
use heapless::String;
use helix_mmc_hal::{
    ocr, BusTiming, BusWidth, ChipSelect, Ios, MmcBridge, PowerMode, SignalMode, Vccq,
};
use spin::Mutex;

// =============================================================================
// Bus Types
// =============================================================================

/// Command set in use for the whole bus until the next full discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusMode {
    /// SD command set
    Sd,
    /// MMC command set
    Mmc,
}

/// Bus manager state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusState {
    /// No power
    PoweredOff,
    /// Probing which command set the cards speak
    IdentifyMode,
    /// Identifying SD cards
    SdAcquire,
    /// Identifying MMC cards
    MmcAcquire,
    /// Negotiating width, timing and clock
    Negotiate,
    /// Cards usable
    Ready,
}

/// Who holds the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusOwner {
    /// The bus manager itself, with every card deselected
    Bus,
    /// A consumer of the card at this RCA
    Card(u16),
}

impl BusOwner {
    /// Owner for `rca`; 0 addresses the bus itself
    pub const fn from_rca(rca: u16) -> Self {
        if rca == 0 { BusOwner::Bus } else { BusOwner::Card(rca) }
    }
}

/// Read-only card attributes for consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfo {
    /// Handle the attributes were read through
    pub handle: CardHandle,
    /// Command set family
    pub kind: CardKind,
    /// Capacity in sectors
    pub sectors: u64,
    /// Sector size (bytes)
    pub sector_size: u32,
    /// Erase sector size in sectors
    pub erase_sector: u32,
    /// Write protected
    pub read_only: bool,
    /// Block addressed
    pub high_cap: bool,
    /// Bus width in use
    pub bus_width: BusWidth,
    /// Negotiated bus clock (Hz)
    pub clock: u32,
    /// Negotiated bus timing
    pub timing: BusTiming,
    /// Identification string
    pub id_string: String<64>,
    /// Serial number string
    pub sn_string: String<16>,
    /// Largest single transfer (sectors)
    pub max_data: u32,
    /// Device workarounds
    pub quirks: Quirks,
    /// Generic CMD6 timeout (us)
    pub cmd6_timeout_us: u32,
    /// MMC system specification version, 0 for SD
    pub spec_vers: u8,
}

/// Mutable per-bus state
#[derive(Debug, Clone, Copy)]
struct Session {
    mode: BusMode,
    state: BusState,
    ios: Ios,
    /// Voltage window shared by host and cards
    ocr: u32,
    /// Card left selected by the last consumer acquire
    last_rca: u16,
    /// Negotiated clock
    clock: u32,
}

// =============================================================================
// Bus Manager
// =============================================================================

/// MMC/SD bus manager
pub struct MmcBus<B: MmcBridge> {
    bridge: B,
    config: BusConfig,
    registry: CardRegistry,
    session: Mutex<Session>,
    owner: Mutex<Option<BusOwner>>,
    squelched: AtomicU32,
}

impl<B: MmcBridge> MmcBus<B> {
    /// Create a bus manager over `bridge`. Nothing is sent until [`Self::scan`].
    pub fn new(bridge: B, config: BusConfig) -> Self {
        Self {
            bridge,
            config,
            registry: CardRegistry::new(),
            session: Mutex::new(Session {
                mode: BusMode::Sd,
                state: BusState::PoweredOff,
                ios: Ios::new(),
                ocr: 0,
                last_rca: 0,
                clock: 0,
            }),
            owner: Mutex::new(None),
            squelched: AtomicU32::new(0),
        }
    }

    /// The host bridge
    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    /// Active configuration
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Known cards
    pub fn registry(&self) -> &CardRegistry {
        &self.registry
    }

    /// State machine position
    pub fn state(&self) -> BusState {
        self.session.lock().state
    }

    /// Command set chosen by the last probe
    pub fn mode(&self) -> BusMode {
        self.session.lock().mode
    }

    /// Current bus settings
    pub fn ios(&self) -> Ios {
        self.session.lock().ios
    }

    /// Negotiated clock (Hz), 0 before negotiation
    pub fn clock(&self) -> u32 {
        self.session.lock().clock
    }

    /// Current holder of the bus
    pub fn owner(&self) -> Option<BusOwner> {
        *self.owner.lock()
    }

    /// Handles for every known card, in RCA order
    pub fn cards(&self) -> Vec<CardHandle> {
        self.registry.handles()
    }

    /// Attributes of the card behind `handle`
    pub fn card_info(&self, handle: CardHandle) -> MmcResult<CardInfo> {
        let (clock, timing) = {
            let session = self.session.lock();
            (session.clock, session.ios.timing)
        };
        let max_data = self.bridge.max_data();
        self.registry.with_card(handle, |card| CardInfo {
            handle,
            kind: card.kind(),
            sectors: card.sectors(),
            sector_size: SECTOR_SIZE,
            erase_sector: card.erase_sector(),
            read_only: card.is_read_only(),
            high_cap: card.is_high_capacity(),
            bus_width: card.bus_width(),
            clock,
            timing,
            id_string: card.id_string.clone(),
            sn_string: card.sn_string.clone(),
            max_data,
            quirks: card.quirks(),
            cmd6_timeout_us: card.cmd6_time(),
            spec_vers: card.csd().spec_vers,
        })
    }

    pub(crate) fn exec(&self) -> Executor<'_, B> {
        Executor::new(&self.bridge, &self.config, &self.squelched)
    }

    fn set_state(&self, state: BusState) {
        let mut session = self.session.lock();
        if session.state != state {
            log::trace!("mmc: bus {:?} -> {:?}", session.state, state);
            session.state = state;
        }
    }

    fn set_mode(&self, mode: BusMode) {
        self.session.lock().mode = mode;
    }

    fn set_ios(&self, f: impl FnOnce(&mut Ios)) {
        f(&mut self.session.lock().ios);
    }

    /// Push the shadow settings to the bridge
    fn apply_ios(&self) -> MmcResult<()> {
        let ios = self.ios();
        self.bridge.update_ios(&ios).map_err(|err| {
            log::warn!("mmc: bus settings rejected: {}", err);
            MmcError::from(err)
        })
    }

    fn delay_ms(&self, ms: u32) {
        self.bridge.delay_us(ms * 1000);
    }

    /// Log at `info` when verbose, `debug` otherwise
    fn verbose(&self) -> log::Level {
        if self.config.verbose { log::Level::Info } else { log::Level::Debug }
    }

    // =========================================================================
    // Power
    // =========================================================================

    /// Ramp the supply at the host's highest voltage and start the
    /// identification clock. VCCQ falls back from 3.3 V until the bridge
    /// accepts one.
    fn power_up(&self) -> MmcResult<()> {
        let vdd = ocr::highest_voltage(self.bridge.host_ocr());
        self.set_ios(|ios| {
            ios.vdd = vdd;
            ios.signal_mode = SignalMode::OpenDrain;
            ios.chip_select = ChipSelect::DontCare;
            ios.bus_width = BusWidth::One;
            ios.power_mode = PowerMode::Up;
            ios.clock = 0;
        });
        self.apply_ios()?;

        for vccq in [Vccq::V330, Vccq::V180, Vccq::V120] {
            self.set_ios(|ios| ios.vccq = vccq);
            if self.bridge.switch_vccq(&self.ios()).is_ok() || vccq == Vccq::V120 {
                break;
            }
        }
        self.delay_ms(1);

        let clock = self.config.identify_frequency;
        self.set_ios(|ios| {
            ios.clock = clock;
            ios.timing = BusTiming::Normal;
            ios.power_mode = PowerMode::On;
        });
        self.apply_ios()?;
        self.delay_ms(2);
        Ok(())
    }

    fn power_down(&self) {
        self.set_ios(|ios| {
            ios.signal_mode = SignalMode::OpenDrain;
            ios.chip_select = ChipSelect::DontCare;
            ios.bus_width = BusWidth::One;
            ios.power_mode = PowerMode::Off;
            ios.clock = 0;
            ios.timing = BusTiming::Normal;
        });
        let _ = self.apply_ios();
        let mut session = self.session.lock();
        session.state = BusState::PoweredOff;
        session.ocr = 0;
        session.last_rca = 0;
        session.clock = 0;
    }

    /// Broadcast GO_IDLE_STATE with chip select held high
    fn idle_cards(&self) {
        self.set_ios(|ios| ios.chip_select = ChipSelect::High);
        let _ = self.apply_ios();
        self.delay_ms(1);

        if let Err(err) = self.exec().go_idle_state() {
            log::debug!("mmc: GO_IDLE_STATE failed: {}", err);
        }
        self.delay_ms(1);

        self.set_ios(|ios| ios.chip_select = ChipSelect::DontCare);
        let _ = self.apply_ios();
        self.delay_ms(1);
    }

    fn delete_cards(&self) {
        let count = self.registry.clear();
        if count > 0 {
            log::debug!("mmc: dropped {} card(s)", count);
        }
    }

    // =========================================================================
    // Discovery Entry Point
    // =========================================================================

    /// Bring every card on the bus to a negotiated state.
    ///
    /// Probes SD then MMC when the bus is unpowered. Fails with
    /// [`MmcError::NoCompatibleCards`] when nothing answers within the
    /// host's voltage window, leaving the bus powered down and the
    /// registry empty. A bridge that rejects the power-up settings fails
    /// the same way with [`MmcError::Bridge`]. The caller must hold
    /// [`BusOwner::Bus`].
    pub fn go_discovery(&self) -> MmcResult<()> {
        debug_assert_eq!(self.owner(), Some(BusOwner::Bus));
        let exec = self.exec();
        let level = self.verbose();

        if self.ios().power_mode != PowerMode::On {
            let card_ocr = {
                let _quiet = exec.squelch();
                self.set_mode(BusMode::Sd);
                self.set_state(BusState::IdentifyMode);
                if let Err(err) = self.power_up() {
                    self.delete_cards();
                    self.power_down();
                    return Err(err);
                }
                self.set_ios(|ios| ios.signal_mode = SignalMode::PushPull);
                log::log!(level, "mmc: probing bus");
                self.idle_cards();

                if exec.send_if_cond(1).is_ok() {
                    log::log!(level, "mmc: SD 2.0 interface conditions: OK");
                }
                match exec.send_app_op_cond(0) {
                    Ok(card_ocr) => {
                        log::log!(level, "mmc: SD probe: OK (OCR: {:#010x})", card_ocr);
                        card_ocr
                    }
                    Err(_) => {
                        log::log!(level, "mmc: SD probe: failed");
                        self.set_mode(BusMode::Mmc);
                        match exec.send_op_cond(0) {
                            Ok(card_ocr) => {
                                log::log!(level, "mmc: MMC probe: OK (OCR: {:#010x})", card_ocr);
                                card_ocr
                            }
                            Err(_) => {
                                log::log!(level, "mmc: MMC probe: failed");
                                0
                            }
                        }
                    }
                }
            };

            let selected = card_ocr & self.bridge.host_ocr() & ocr::VOLTAGE;
            {
                let mut session = self.session.lock();
                session.ocr = selected;
                if selected != 0 {
                    session.ios.vdd = ocr::highest_voltage(selected);
                }
            }
            if selected != 0 {
                self.idle_cards();
            }
        } else {
            let clock = self.config.identify_frequency;
            self.set_ios(|ios| {
                ios.signal_mode = SignalMode::OpenDrain;
                ios.clock = clock;
            });
            self.apply_ios()?;
        }

        let (selected, mode) = {
            let session = self.session.lock();
            (session.ocr, session.mode)
        };
        if selected == 0 {
            log::info!("mmc: No compatible cards found on bus");
            self.delete_cards();
            self.power_down();
            return Err(MmcError::NoCompatibleCards);
        }

        // Cards were idled above; bring them back with our voltage window
        match mode {
            BusMode::Sd => {
                self.set_state(BusState::SdAcquire);
                let ccs = if exec.send_if_cond(1).is_ok() { ocr::CCS } else { 0 };
                if let Err(err) = exec.send_app_op_cond(ccs | selected) {
                    log::debug!("mmc: SD power-up failed: {}", err);
                }
            }
            BusMode::Mmc => {
                self.set_state(BusState::MmcAcquire);
                if let Err(err) = exec.send_op_cond(ocr::CCS | selected) {
                    log::debug!("mmc: MMC power-up failed: {}", err);
                }
            }
        }

        self.discover_cards();
        self.rescan_cards();

        self.set_state(BusState::Negotiate);
        self.set_ios(|ios| ios.signal_mode = SignalMode::PushPull);
        let _ = self.apply_ios();
        self.calculate_clock();

        self.set_state(BusState::Ready);
        Ok(())
    }

    /// Reselect every known card, dropping the ones that no longer answer.
    ///
    /// The caller must hold [`BusOwner::Bus`].
    pub fn rescan_cards(&self) {
        let exec = self.exec();
        for rca in self.registry.rcas().into_iter().rev() {
            let selected = {
                let _quiet = exec.squelch();
                exec.select_card(rca)
            };
            if selected.is_err() {
                log::log!(self.verbose(), "mmc: card at relative address {} lost", rca);
                self.registry.remove(rca);
            }
        }
        let _ = exec.select_card(0);
    }

    // =========================================================================
    // Ownership
    // =========================================================================

    /// Take the bus for `owner`, blocking while someone else holds it.
    ///
    /// A card owner gets its card selected. When several cards share the
    /// bus, or the bus is not in an eMMC high-speed mode, the card's bus
    /// width, VCCQ and power class are re-applied on selection. The bus
    /// owner gets every card deselected.
    ///
    /// # Panics
    ///
    /// If the bus is already owned after the bridge granted the host,
    /// which means the bridge failed to serialize acquirers.
    pub fn acquire(&self, owner: BusOwner) -> MmcResult<()> {
        self.bridge.acquire_host()?;
        {
            let mut current = self.owner.lock();
            if current.is_some() {
                panic!("mmc: host bridge didn't serialize us");
            }
            *current = Some(owner);
        }

        let prepared = match owner {
            BusOwner::Card(rca) => self.select_for_owner(rca),
            BusOwner::Bus => self.stand_down(),
        };
        if let Err(err) = prepared {
            self.release(owner);
            return Err(err);
        }
        Ok(())
    }

    /// Give the bus back
    ///
    /// # Panics
    ///
    /// If the bus is not owned, or is owned by someone other than `owner`.
    pub fn release(&self, owner: BusOwner) {
        {
            let mut current = self.owner.lock();
            match *current {
                None => panic!("mmc: releasing unowned bus"),
                Some(held) if held != owner => panic!("mmc: you don't own the bus. game over."),
                Some(_) => *current = None,
            }
        }
        if let Err(err) = self.bridge.release_host() {
            log::error!("mmc: bridge failed to release host: {}", err);
        }
    }

    fn stand_down(&self) -> MmcResult<()> {
        if self.session.lock().last_rca != 0 {
            self.exec().select_card(0)?;
            self.session.lock().last_rca = 0;
        }
        Ok(())
    }

    fn select_for_owner(&self, rca: u16) -> MmcResult<()> {
        if self.session.lock().last_rca == rca {
            return Ok(());
        }
        let card = self.registry.with_rca(rca, |card| card.clone()).ok_or(MmcError::CardNotFound)?;
        let exec = self.exec();
        if let Err(err) = exec.select_card(rca) {
            log::warn!("mmc: card at relative address {} failed to select", rca);
            return Err(err.into());
        }

        let timing = {
            let mut session = self.session.lock();
            session.last_rca = rca;
            session.ios.timing
        };
        let emmc_fast = matches!(
            timing,
            BusTiming::MmcDdr52 | BusTiming::MmcHs200 | BusTiming::MmcHs400 | BusTiming::MmcHs400Es
        );
        if self.registry.len() > 1 || !emmc_fast {
            self.set_card_bus_width(&exec, &card, timing).map_err(|err| {
                log::warn!("mmc: card at relative address {} failed to set bus width", rca);
                err
            })?;
            self.set_ios(|ios| ios.bus_width = card.bus_width());
            self.apply_ios()?;
            self.set_vccq(&card, timing).map_err(|err| {
                log::warn!("mmc: failed to set VCCQ for card at relative address {}", rca);
                err
            })?;
            self.set_power_class(&exec, &card).map_err(|err| {
                log::warn!("mmc: card at relative address {} failed to set power class", rca);
                err
            })?;
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Run discovery under bus ownership, returning the number of cards
    pub fn scan(&self) -> MmcResult<usize> {
        self.acquire(BusOwner::Bus)?;
        let result = self.go_discovery();
        self.release(BusOwner::Bus);
        result?;
        Ok(self.registry.len())
    }

    /// Power the bus down, keeping the registry for [`Self::resume`]
    pub fn suspend(&self) -> MmcResult<()> {
        self.acquire(BusOwner::Bus)?;
        self.power_down();
        self.release(BusOwner::Bus);
        Ok(())
    }

    /// Rediscover after [`Self::suspend`]; known cards keep their handles
    pub fn resume(&self) -> MmcResult<usize> {
        self.scan()
    }

    /// React to the card-detect pin changing
    pub fn card_detect_changed(&self) -> MmcResult<usize> {
        if self.bridge.card_detect() {
            self.scan()
        } else {
            self.detach()?;
            Ok(0)
        }
    }

    /// Drop every card and power down
    pub fn detach(&self) -> MmcResult<()> {
        self.acquire(BusOwner::Bus)?;
        self.delete_cards();
        self.power_down();
        self.release(BusOwner::Bus);
        Ok(())
    }

    /// One-line bus summary
    pub(crate) fn log_negotiated(&self, clock: u32, timing: BusTiming) {
        log::log!(
            self.verbose(),
            "mmc: setting transfer rate to {}.{:03}MHz ({} timing)",
            clock / 1_000_000,
            (clock / 1000) % 1000,
            timing_mode_label(timing)
        );
    }
}

impl<B: MmcBridge> core::fmt::Debug for MmcBus<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmcBus")
            .field("state", &self.state())
            .field("mode", &self.mode())
            .field("cards", &self.registry.len())
            .field("owner", &self.owner())
            .finish()
    }
}
