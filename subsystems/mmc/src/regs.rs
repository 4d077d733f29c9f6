//! # Card Registers
//!
//! Pure decoders for the registers a card exposes during identification.
//! Raw registers arrive as big-endian ordered 32-bit words (most significant
//! word first); bit 0 is the least significant bit of the whole register.
//!
//! | Register  | Width     | Layout        |
//! |-----------|-----------|---------------|
//! | CID       | 128 bits  | bit-packed    |
//! | CSD       | 128 bits  | bit-packed    |
//! | SCR       | 64 bits   | bit-packed    |
//! | SD_STATUS | 512 bits  | bit-packed    |
//! | EXT_CSD   | 512 bytes | byte-indexed  |

use crate::{MmcError, MmcResult};
use heapless::String;

// =============================================================================
// Bit Extraction
// =============================================================================

/// Extract the `size`-bit field starting at `start` from a `bit_len`-bit register.
///
/// `words` holds the register most significant word first. Fields may
/// straddle a word boundary.
///
/// # Preconditions
///
/// `start + size <= bit_len`, `size <= 32`, `bit_len` a multiple of 32 and
/// `words.len() == bit_len / 32`. Register layouts are fixed, so callers
/// uphold this statically; it is only checked in debug builds.
pub fn extract_bits(words: &[u32], bit_len: usize, start: usize, size: usize) -> u32 {
    debug_assert!(size > 0 && size <= 32);
    debug_assert!(start + size <= bit_len);
    debug_assert_eq!(words.len() * 32, bit_len);

    let i = bit_len / 32 - start / 32 - 1;
    let shift = start & 31;
    let mut val = words[i] >> shift;
    if size + shift > 32 {
        val |= words[i - 1] << (32 - shift);
    }
    (u64::from(val) & ((1u64 << size) - 1)) as u32
}

const EXP: [u32; 8] = [1, 10, 100, 1_000, 10_000, 100_000, 1_000_000, 10_000_000];

const MANT: [u32; 16] = [0, 10, 12, 13, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 70, 80];

const CUR_MIN: [u32; 8] = [500, 1_000, 5_000, 10_000, 25_000, 35_000, 60_000, 100_000];

const CUR_MAX: [u32; 8] = [1_000, 5_000, 10_000, 25_000, 35_000, 45_000, 800_000, 200_000];

fn bits128(raw: &[u32; 4], start: usize, size: usize) -> u32 {
    extract_bits(raw, 128, start, size)
}

fn flag128(raw: &[u32; 4], bit: usize) -> bool {
    bits128(raw, bit, 1) != 0
}

// =============================================================================
// CID
// =============================================================================

/// Which CID layout a card uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CidFormat {
    /// SD layout: 16-bit OEM id, 5-character name, 2000-based year
    Sd,
    /// MMC layout: 8-bit OEM id, 6-character name, 4-bit year
    Mmc {
        /// EXT_CSD revision 5 (v4.41) or later moves the year epoch to 2013
        v4_41: bool,
    },
}

/// Decoded card identification register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cid {
    /// Manufacturer id
    pub mid: u8,
    /// OEM/application id
    pub oid: u16,
    /// Product name
    pub pnm: String<6>,
    /// Product revision, major nibble high
    pub prv: u8,
    /// Product serial number
    pub psn: u32,
    /// Manufacture year
    pub mdt_year: u16,
    /// Manufacture month
    pub mdt_month: u8,
}

impl Cid {
    /// Decode with the given layout
    pub fn decode(raw: &[u32; 4], format: CidFormat) -> Cid {
        match format {
            CidFormat::Sd => decode_cid_sd(raw),
            CidFormat::Mmc { v4_41 } => decode_cid_mmc(raw, v4_41),
        }
    }

    /// Major product revision
    pub const fn prv_major(&self) -> u8 {
        self.prv >> 4
    }

    /// Minor product revision
    pub const fn prv_minor(&self) -> u8 {
        self.prv & 0x0F
    }
}

fn product_name(raw: &[u32; 4], len: usize) -> String<6> {
    let mut pnm = String::new();
    for i in 0..len {
        let byte = bits128(raw, 96 - i * 8, 8) as u8;
        if byte == 0 {
            break;
        }
        let ch = if byte.is_ascii_graphic() || byte == b' ' { byte as char } else { '?' };
        // Capacity is 6, len is at most 6
        let _ = pnm.push(ch);
    }
    pnm
}

/// Decode an SD CID
pub fn decode_cid_sd(raw: &[u32; 4]) -> Cid {
    Cid {
        mid: bits128(raw, 120, 8) as u8,
        oid: bits128(raw, 104, 16) as u16,
        pnm: product_name(raw, 5),
        prv: bits128(raw, 56, 8) as u8,
        psn: bits128(raw, 24, 32),
        mdt_year: bits128(raw, 12, 8) as u16 + 2000,
        mdt_month: bits128(raw, 8, 4) as u8,
    }
}

/// Decode an MMC CID
///
/// The 4-bit year counts from 1997. From v4.41 on, codes 0..=12 wrap to
/// 2013..=2025 while 13..=15 still mean 2010..=2012.
pub fn decode_cid_mmc(raw: &[u32; 4], v4_41: bool) -> Cid {
    let mut year = bits128(raw, 8, 4) as u16 + 1997;
    if v4_41 && year < 2010 {
        year += 16;
    }
    Cid {
        mid: bits128(raw, 120, 8) as u8,
        oid: bits128(raw, 104, 8) as u16,
        pnm: product_name(raw, 6),
        prv: bits128(raw, 48, 8) as u8,
        psn: bits128(raw, 16, 32),
        mdt_year: year,
        mdt_month: bits128(raw, 12, 4) as u8,
    }
}

// =============================================================================
// CSD
// =============================================================================

/// CSD layout variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CsdStructure {
    /// SD standard capacity (byte addressed)
    SdV0,
    /// SD high/extended capacity (block addressed)
    SdV1,
    /// MMC, any structure version
    Mmc,
}

/// Decoded card-specific data register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Csd {
    /// Layout the fields were decoded with
    pub structure: CsdStructure,
    /// MMC system specification version, 0 for SD
    pub spec_vers: u8,
    /// Card command classes
    pub ccc: u16,
    /// Asynchronous access time (ns)
    pub tacc: u32,
    /// Clock-dependent access time (clock cycles)
    pub nsac: u32,
    /// Write speed factor
    pub r2w_factor: u32,
    /// Maximum transfer rate (Hz)
    pub tran_speed: u32,
    /// Read block length (bytes)
    pub read_bl_len: u32,
    /// Write block length (bytes)
    pub write_bl_len: u32,
    /// Partial read blocks allowed
    pub read_bl_partial: bool,
    /// Reads may cross block boundaries
    pub read_blk_misalign: bool,
    /// Partial write blocks allowed
    pub write_bl_partial: bool,
    /// Writes may cross block boundaries
    pub write_blk_misalign: bool,
    /// DSR implemented
    pub dsr_imp: bool,
    /// Min read current at VDD min (uA)
    pub vdd_r_curr_min: u32,
    /// Max read current at VDD max (uA)
    pub vdd_r_curr_max: u32,
    /// Min write current at VDD min (uA)
    pub vdd_w_curr_min: u32,
    /// Max write current at VDD max (uA)
    pub vdd_w_curr_max: u32,
    /// Single-block erase enabled
    pub erase_blk_en: bool,
    /// Erase sector size (write blocks)
    pub erase_sector: u32,
    /// Write protect group size (erase sectors, minus one)
    pub wp_grp_size: u32,
    /// Group write protection possible
    pub wp_grp_enable: bool,
    /// Capacity in bytes
    pub capacity: u64,
}

impl Csd {
    /// Whether the card is block addressed
    pub fn is_high_capacity(&self) -> bool {
        self.structure == CsdStructure::SdV1
    }
}

fn tran_speed(raw: &[u32; 4]) -> u32 {
    let m = bits128(raw, 99, 4) as usize;
    let e = bits128(raw, 96, 3) as usize;
    let hz = u64::from(EXP[e]) * 10_000 * u64::from(MANT[m]);
    u32::try_from(hz).unwrap_or(u32::MAX)
}

fn legacy_capacity(raw: &[u32; 4], read_bl_len: u32) -> u64 {
    let c_size = u64::from(bits128(raw, 62, 12));
    let mult = bits128(raw, 47, 3);
    ((1 + c_size) << (mult + 2)) * u64::from(read_bl_len)
}

/// Decode an SD CSD, selecting the layout from `CSD_STRUCTURE`.
///
/// Versions other than 0 and 1 return [`MmcError::Unsupported`].
pub fn decode_csd_sd(raw: &[u32; 4]) -> MmcResult<Csd> {
    let structure = match bits128(raw, 126, 2) {
        0 => CsdStructure::SdV0,
        1 => CsdStructure::SdV1,
        v => {
            log::warn!("mmc: unknown SD CSD structure version {}", v);
            return Err(MmcError::Unsupported);
        }
    };

    let m = bits128(raw, 115, 4) as usize;
    let e = bits128(raw, 112, 3) as usize;
    let read_bl_len = 1 << bits128(raw, 80, 4);

    let (capacity, curr) = match structure {
        CsdStructure::SdV0 => (
            legacy_capacity(raw, read_bl_len),
            [
                CUR_MIN[bits128(raw, 59, 3) as usize],
                CUR_MAX[bits128(raw, 56, 3) as usize],
                CUR_MIN[bits128(raw, 53, 3) as usize],
                CUR_MAX[bits128(raw, 50, 3) as usize],
            ],
        ),
        // 22-bit C_SIZE in 512 KiB units; no current fields
        _ => ((u64::from(bits128(raw, 48, 22)) + 1) * 512 * 1024, [0; 4]),
    };

    Ok(Csd {
        structure,
        spec_vers: 0,
        ccc: bits128(raw, 84, 12) as u16,
        tacc: (EXP[e] * MANT[m] + 9) / 10,
        nsac: bits128(raw, 104, 8) * 100,
        r2w_factor: 1 << bits128(raw, 26, 3),
        tran_speed: tran_speed(raw),
        read_bl_len,
        write_bl_len: 1 << bits128(raw, 22, 4),
        read_bl_partial: flag128(raw, 79),
        write_blk_misalign: flag128(raw, 78),
        read_blk_misalign: flag128(raw, 77),
        write_bl_partial: flag128(raw, 21),
        dsr_imp: flag128(raw, 76),
        vdd_r_curr_min: curr[0],
        vdd_r_curr_max: curr[1],
        vdd_w_curr_min: curr[2],
        vdd_w_curr_max: curr[3],
        erase_blk_en: flag128(raw, 46),
        erase_sector: bits128(raw, 39, 7) + 1,
        wp_grp_size: bits128(raw, 32, 7),
        wp_grp_enable: flag128(raw, 31),
        capacity,
    })
}

/// Decode an MMC CSD.
///
/// Unlike SD, `tacc` is `exp * mant + 9 / 10`: the integer division binds
/// to the constant only, so the value is never rounded. Reported access
/// times depend on this.
pub fn decode_csd_mmc(raw: &[u32; 4]) -> Csd {
    let m = bits128(raw, 115, 4) as usize;
    let e = bits128(raw, 112, 3) as usize;
    let read_bl_len = 1 << bits128(raw, 80, 4);
    #[allow(clippy::identity_op)]
    let tacc = EXP[e] * MANT[m] + 9 / 10;

    Csd {
        structure: CsdStructure::Mmc,
        spec_vers: bits128(raw, 122, 4) as u8,
        ccc: bits128(raw, 84, 12) as u16,
        tacc,
        nsac: bits128(raw, 104, 8) * 100,
        r2w_factor: 1 << bits128(raw, 26, 3),
        tran_speed: tran_speed(raw),
        read_bl_len,
        write_bl_len: 1 << bits128(raw, 22, 4),
        read_bl_partial: flag128(raw, 79),
        write_blk_misalign: flag128(raw, 78),
        read_blk_misalign: flag128(raw, 77),
        write_bl_partial: flag128(raw, 21),
        dsr_imp: flag128(raw, 76),
        vdd_r_curr_min: CUR_MIN[bits128(raw, 59, 3) as usize],
        vdd_r_curr_max: CUR_MAX[bits128(raw, 56, 3) as usize],
        vdd_w_curr_min: CUR_MIN[bits128(raw, 53, 3) as usize],
        vdd_w_curr_max: CUR_MAX[bits128(raw, 50, 3) as usize],
        erase_blk_en: false,
        erase_sector: (bits128(raw, 42, 5) + 1) * (bits128(raw, 37, 5) + 1),
        wp_grp_size: bits128(raw, 32, 5),
        wp_grp_enable: flag128(raw, 31),
        capacity: legacy_capacity(raw, read_bl_len),
    }
}

// =============================================================================
// SCR
// =============================================================================

/// SCR bus width bit for 4-bit support
pub const SCR_BUS_WIDTH_4: u8 = 1 << 2;

/// SCR bus width bit for 1-bit support
pub const SCR_BUS_WIDTH_1: u8 = 1 << 0;

/// Decoded SD configuration register
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scr {
    /// SD physical layer specification version
    pub sda_vsn: u8,
    /// Supported bus widths (`SCR_BUS_WIDTH_*`)
    pub bus_widths: u8,
}

impl Scr {
    /// Whether the card can run a 4-bit bus
    pub const fn supports_4bit(&self) -> bool {
        self.bus_widths & SCR_BUS_WIDTH_4 != 0
    }
}

/// Decode an SCR. Unknown structure versions decode to all-zero.
pub fn decode_scr(raw: &[u32; 2]) -> Scr {
    let structure = extract_bits(raw, 64, 60, 4);
    if structure != 0 {
        log::warn!("mmc: unrecognised SCR structure version {}", structure);
        return Scr::default();
    }
    Scr {
        sda_vsn: extract_bits(raw, 64, 56, 4) as u8,
        bus_widths: extract_bits(raw, 64, 48, 4) as u8,
    }
}

// =============================================================================
// SD_STATUS
// =============================================================================

/// Decoded SD status block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SdStatus {
    /// Current bus width
    pub bus_width: u8,
    /// Secured mode active
    pub secured_mode: bool,
    /// Card type
    pub card_type: u16,
    /// Size of the protected area
    pub prot_area: u16,
    /// Speed class
    pub speed_class: u8,
    /// Move performance (MB/s)
    pub perf_move: u8,
    /// Allocation unit size code
    pub au_size: u8,
    /// AUs erased per operation
    pub erase_size: u16,
    /// Erase timeout (s)
    pub erase_timeout: u8,
    /// Erase timeout offset (s)
    pub erase_offset: u8,
}

/// Decode a 512-bit SD status block
pub fn decode_sd_status(raw: &[u32; 16]) -> SdStatus {
    let bits = |start, size| extract_bits(raw, 512, start, size);
    SdStatus {
        bus_width: bits(510, 2) as u8,
        secured_mode: bits(509, 1) != 0,
        card_type: bits(480, 16) as u16,
        prot_area: bits(448, 12) as u16,
        speed_class: bits(440, 8) as u8,
        perf_move: bits(432, 8) as u8,
        au_size: bits(428, 4) as u8,
        erase_size: bits(408, 16) as u16,
        erase_timeout: bits(402, 6) as u8,
        erase_offset: bits(400, 2) as u8,
    }
}

/// Pack big-endian bytes into big-endian ordered words
pub fn be_words<const N: usize>(bytes: &[u8]) -> [u32; N] {
    let mut words = [0u32; N];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
}

// =============================================================================
// SD Switch Function Status
// =============================================================================

/// Size of the CMD6 status block
pub const SWITCH_STATUS_LEN: usize = 64;

/// CMD6 mode: check only
pub const SD_SWITCH_MODE_CHECK: u32 = 0;
/// CMD6 mode: set function
pub const SD_SWITCH_MODE_SET: u32 = 1;
/// Access mode function group
pub const SD_SWITCH_GROUP1: u32 = 0;
/// Default speed function
pub const SD_SWITCH_NORMAL_MODE: u8 = 0;
/// High speed function
pub const SD_SWITCH_HS_MODE: u8 = 1;
/// Leave the group unchanged
pub const SD_SWITCH_NOCHANGE: u8 = 0xF;

/// SD CMD6 switch function status (512 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchStatus(pub [u8; SWITCH_STATUS_LEN]);

impl SwitchStatus {
    /// Group 1 function 1 (high speed) supported
    pub const fn supports_high_speed(&self) -> bool {
        self.0[13] & (1 << SD_SWITCH_HS_MODE) != 0
    }

    /// Function selected in group 1
    pub const fn group1_selection(&self) -> u8 {
        self.0[16] & 0x0F
    }
}

// =============================================================================
// EXT_CSD
// =============================================================================

/// Size of the EXT_CSD register
pub const EXT_CSD_LEN: usize = 512;

/// EXT_CSD byte offsets and field values
pub mod ext_csd {
    /// High-capacity erase group definition
    pub const ERASE_GRP_DEF: u8 = 175;
    /// Bus width mode
    pub const BUS_WIDTH: u8 = 183;
    /// Enhanced strobe support
    pub const STROBE_SUPPORT: u8 = 184;
    /// High speed interface timing
    pub const HS_TIMING: u8 = 185;
    /// Power class
    pub const POWER_CLASS: u8 = 187;
    /// Extended CSD revision
    pub const REV: u8 = 192;
    /// Supported device types
    pub const CARD_TYPE: u8 = 196;
    /// Power class for 52 MHz at 1.95 V
    pub const PWR_CL_52_195: u8 = 200;
    /// Power class for 26 MHz at 1.95 V
    pub const PWR_CL_26_195: u8 = 201;
    /// Power class for 52 MHz at 3.6 V
    pub const PWR_CL_52_360: u8 = 202;
    /// Power class for 26 MHz at 3.6 V
    pub const PWR_CL_26_360: u8 = 203;
    /// Sector count (4 bytes, little endian)
    pub const SEC_CNT: usize = 212;
    /// High-capacity erase unit size (512 KiB units)
    pub const ERASE_GRP_SIZE: usize = 224;
    /// Power class for 200 MHz at 1.95 V
    pub const PWR_CL_200_195: u8 = 236;
    /// Power class for 200 MHz at 3.6 V
    pub const PWR_CL_200_360: u8 = 237;
    /// Power class for 52 MHz DDR at 1.95 V
    pub const PWR_CL_52_195_DDR: u8 = 238;
    /// Power class for 52 MHz DDR at 3.6 V
    pub const PWR_CL_52_360_DDR: u8 = 239;
    /// Generic CMD6 timeout (10 ms units)
    pub const GEN_CMD6_TIME: usize = 248;
    /// Power class for 200 MHz DDR at 3.6 V
    pub const PWR_CL_200_360_DDR: u8 = 253;

    /// CMD6 access: write byte
    pub const CMD_SET_NORMAL: u8 = 1;
    /// CMD6 access mode: write byte
    pub const ACCESS_WRITE_BYTE: u32 = 3;

    /// CARD_TYPE: 26 MHz high speed
    pub const CARD_TYPE_HS_26: u8 = 0x01;
    /// CARD_TYPE: 52 MHz high speed
    pub const CARD_TYPE_HS_52: u8 = 0x02;
    /// CARD_TYPE: DDR52 at 1.8 V or 3 V
    pub const CARD_TYPE_DDR_52_1_8V: u8 = 0x04;
    /// CARD_TYPE: DDR52 at 1.2 V
    pub const CARD_TYPE_DDR_52_1_2V: u8 = 0x08;
    /// CARD_TYPE: HS200 at 1.8 V
    pub const CARD_TYPE_HS200_1_8V: u8 = 0x10;
    /// CARD_TYPE: HS200 at 1.2 V
    pub const CARD_TYPE_HS200_1_2V: u8 = 0x20;
    /// CARD_TYPE: HS400 at 1.8 V
    pub const CARD_TYPE_HS400_1_8V: u8 = 0x40;
    /// CARD_TYPE: HS400 at 1.2 V
    pub const CARD_TYPE_HS400_1_2V: u8 = 0x80;

    /// STROBE_SUPPORT: enhanced strobe available
    pub const STROBE_SUPPORT_EN: u8 = 0x01;

    /// HS_TIMING: backwards compatible
    pub const HS_TIMING_BC: u8 = 0;
    /// HS_TIMING: high speed
    pub const HS_TIMING_HS: u8 = 1;
    /// HS_TIMING: HS200
    pub const HS_TIMING_HS200: u8 = 2;
    /// HS_TIMING: HS400
    pub const HS_TIMING_HS400: u8 = 3;

    /// BUS_WIDTH: 1 bit
    pub const BUS_WIDTH_1: u8 = 0;
    /// BUS_WIDTH: 4 bit
    pub const BUS_WIDTH_4: u8 = 1;
    /// BUS_WIDTH: 8 bit
    pub const BUS_WIDTH_8: u8 = 2;
    /// BUS_WIDTH: 4 bit DDR
    pub const BUS_WIDTH_4_DDR: u8 = 5;
    /// BUS_WIDTH: 8 bit DDR
    pub const BUS_WIDTH_8_DDR: u8 = 6;
    /// BUS_WIDTH: enhanced strobe flag
    pub const BUS_WIDTH_ES: u8 = 0x80;

    /// Power class nibble for 8-bit buses
    pub const POWER_CLASS_8BIT_MASK: u8 = 0xF0;
    /// Shift of the 8-bit power class nibble
    pub const POWER_CLASS_8BIT_SHIFT: u8 = 4;
    /// Power class nibble for 4-bit buses
    pub const POWER_CLASS_4BIT_MASK: u8 = 0x0F;
}

/// Raw EXT_CSD register
#[derive(Clone, PartialEq, Eq)]
pub struct ExtCsd(pub [u8; EXT_CSD_LEN]);

impl ExtCsd {
    /// All-zero register
    pub const fn zeroed() -> Self {
        Self([0; EXT_CSD_LEN])
    }

    /// Byte at `offset`
    pub fn byte(&self, offset: u8) -> u8 {
        self.0[usize::from(offset)]
    }

    /// Extended CSD revision
    pub fn rev(&self) -> u8 {
        self.byte(ext_csd::REV)
    }

    /// Supported device types
    pub fn card_type(&self) -> u8 {
        self.byte(ext_csd::CARD_TYPE)
    }

    /// Whether enhanced strobe is supported
    pub fn strobe_support(&self) -> bool {
        self.byte(ext_csd::STROBE_SUPPORT) & ext_csd::STROBE_SUPPORT_EN != 0
    }

    /// Sector count, non-zero for high-capacity devices
    pub fn sec_count(&self) -> u32 {
        let o = ext_csd::SEC_CNT;
        u32::from_le_bytes([self.0[o], self.0[o + 1], self.0[o + 2], self.0[o + 3]])
    }

    /// High-capacity erase unit size (512 KiB units)
    pub fn erase_grp_size(&self) -> u8 {
        self.0[ext_csd::ERASE_GRP_SIZE]
    }

    /// Generic CMD6 timeout (10 ms units)
    pub fn gen_cmd6_time(&self) -> u8 {
        self.0[ext_csd::GEN_CMD6_TIME]
    }
}

impl core::fmt::Debug for ExtCsd {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExtCsd")
            .field("rev", &self.rev())
            .field("card_type", &self.card_type())
            .field("sec_count", &self.sec_count())
            .finish()
    }
}

// =============================================================================
// Card Status (R1)
// =============================================================================

/// R1 card status word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardStatus(pub u32);

impl CardStatus {
    /// Next command is interpreted as an application command
    pub const APP_CMD: u32 = 1 << 5;
    /// CMD6 switch failed
    pub const SWITCH_ERROR: u32 = 1 << 7;
    /// Ready for data
    pub const READY_FOR_DATA: u32 = 1 << 8;
    /// Last command had a CRC error
    pub const COM_CRC_ERROR: u32 = 1 << 23;
    /// Illegal command
    pub const ILLEGAL_COMMAND: u32 = 1 << 22;
    /// Card is password locked
    pub const CARD_IS_LOCKED: u32 = 1 << 25;

    /// App command accepted
    pub const fn app_cmd(&self) -> bool {
        self.0 & Self::APP_CMD != 0
    }

    /// Switch error
    pub const fn switch_error(&self) -> bool {
        self.0 & Self::SWITCH_ERROR != 0
    }

    /// Card locked
    pub const fn is_locked(&self) -> bool {
        self.0 & Self::CARD_IS_LOCKED != 0
    }

    /// Current state
    pub const fn current_state(&self) -> CardState {
        CardState::from_u8(((self.0 >> 9) & 0xF) as u8)
    }
}

/// Card state machine position reported in R1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CardState {
    /// Idle
    Idle = 0,
    /// Ready
    Ready = 1,
    /// Identification
    Ident = 2,
    /// Stand-by
    Stby = 3,
    /// Transfer
    Tran = 4,
    /// Sending data
    Data = 5,
    /// Receiving data
    Rcv = 6,
    /// Programming
    Prg = 7,
    /// Disconnected
    Dis = 8,
    /// Bus test
    Btst = 9,
    /// Sleep
    Slp = 10,
    /// Reserved encoding
    Unknown = 15,
}

impl CardState {
    /// Decode the 4-bit state field
    pub const fn from_u8(val: u8) -> Self {
        match val {
            0 => CardState::Idle,
            1 => CardState::Ready,
            2 => CardState::Ident,
            3 => CardState::Stby,
            4 => CardState::Tran,
            5 => CardState::Data,
            6 => CardState::Rcv,
            7 => CardState::Prg,
            8 => CardState::Dis,
            9 => CardState::Btst,
            10 => CardState::Slp,
            _ => CardState::Unknown,
        }
    }
}

#[cfg(test)]
pub(crate) fn insert_bits(words: &mut [u32], bit_len: usize, start: usize, size: usize, value: u32) {
    for bit in 0..size {
        let pos = start + bit;
        let i = bit_len / 32 - pos / 32 - 1;
        let mask = 1u32 << (pos & 31);
        if (value >> bit) & 1 != 0 {
            words[i] |= mask;
        } else {
            words[i] &= !mask;
        }
    }
}
