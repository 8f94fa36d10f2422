//! Block Allocation Table entries.

/// Bits [0:3) hold the state.
const STATE_MASK: u64 = 0x7;
/// Bits [20:64) hold the file offset in MiB.
const OFFSET_SHIFT: u32 = 20;
const OFFSET_MASK: u64 = 0xFFF_FFFF_FFFF;

/// Size of one BAT entry in bytes.
pub const BAT_ENTRY_SIZE: usize = 8;

/// State of a payload block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadBlockStatus {
    /// Contents come from the parent (or read as zeros without one).
    NotPresent,
    Undefined,
    Zero,
    Unmapped,
    /// All sectors of the block are stored in this file.
    FullyPresent,
    /// Some sectors are stored here; the sector bitmap says which.
    PartiallyPresent,
    /// Codes 4 and 5, kept verbatim.
    Reserved(u8),
}

impl PayloadBlockStatus {
    pub fn from_bits(bits: u8) -> Self {
        match bits & STATE_MASK as u8 {
            0 => Self::NotPresent,
            1 => Self::Undefined,
            2 => Self::Zero,
            3 => Self::Unmapped,
            6 => Self::FullyPresent,
            7 => Self::PartiallyPresent,
            other => Self::Reserved(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::NotPresent => 0,
            Self::Undefined => 1,
            Self::Zero => 2,
            Self::Unmapped => 3,
            Self::FullyPresent => 6,
            Self::PartiallyPresent => 7,
            Self::Reserved(bits) => bits & STATE_MASK as u8,
        }
    }

    /// True when some of the block's data lives in this file.
    pub fn is_stored(self) -> bool {
        matches!(self, Self::FullyPresent | Self::PartiallyPresent)
    }
}

/// State of a sector bitmap block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectorBitmapStatus {
    NotPresent,
    Present,
    Other(u8),
}

impl SectorBitmapStatus {
    pub fn from_bits(bits: u8) -> Self {
        match bits & STATE_MASK as u8 {
            0 => Self::NotPresent,
            6 => Self::Present,
            other => Self::Other(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::NotPresent => 0,
            Self::Present => 6,
            Self::Other(bits) => bits & STATE_MASK as u8,
        }
    }
}

/// A packed 8-byte BAT entry.
///
/// The same encoding serves payload entries and sector bitmap entries;
/// only the interpretation of the 3-bit state differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BatEntry(pub u64);

impl BatEntry {
    pub fn new(state: u8, file_offset_mb: u64) -> Self {
        let mut entry = Self(0);
        entry.set_state(state);
        entry.set_file_offset_mb(file_offset_mb);
        entry
    }

    pub fn read_from(data: &[u8], offset: usize) -> Self {
        let mut b = [0u8; BAT_ENTRY_SIZE];
        b.copy_from_slice(&data[offset..offset + BAT_ENTRY_SIZE]);
        Self(u64::from_le_bytes(b))
    }

    pub fn write_to(&self, data: &mut [u8], offset: usize) {
        data[offset..offset + BAT_ENTRY_SIZE].copy_from_slice(&self.0.to_le_bytes());
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn state(&self) -> u8 {
        (self.0 & STATE_MASK) as u8
    }

    pub fn set_state(&mut self, state: u8) {
        self.0 = (self.0 & !STATE_MASK) | (state as u64 & STATE_MASK);
    }

    pub fn payload_status(&self) -> PayloadBlockStatus {
        PayloadBlockStatus::from_bits(self.state())
    }

    pub fn set_payload_status(&mut self, status: PayloadBlockStatus) {
        self.set_state(status.bits());
    }

    pub fn bitmap_status(&self) -> SectorBitmapStatus {
        SectorBitmapStatus::from_bits(self.state())
    }

    pub fn bitmap_block_present(&self) -> bool {
        self.bitmap_status() == SectorBitmapStatus::Present
    }

    pub fn set_bitmap_block_present(&mut self, present: bool) {
        let status = if present {
            SectorBitmapStatus::Present
        } else {
            SectorBitmapStatus::NotPresent
        };
        self.set_state(status.bits());
    }

    pub fn file_offset_mb(&self) -> u64 {
        (self.0 >> OFFSET_SHIFT) & OFFSET_MASK
    }

    pub fn set_file_offset_mb(&mut self, offset_mb: u64) {
        let cleared = self.0 & !(OFFSET_MASK << OFFSET_SHIFT);
        self.0 = cleared | ((offset_mb & OFFSET_MASK) << OFFSET_SHIFT);
    }

    /// File offset in bytes.
    pub fn file_offset(&self) -> u64 {
        self.file_offset_mb() * super::MIB
    }
}
