//! File identifier and the two VHDX headers.

use uuid::Uuid;

use super::{checksum_with_zeroed_field, le_guid, le_u16, le_u32, le_u64, put_guid, KIB};
use crate::error::{Error, Result};

/// "vhdxfile" as a little-endian u64.
pub const FILE_SIGNATURE: u64 = 0x656C_6966_7864_6876;

/// "head" as a little-endian u32.
pub const HEADER_SIGNATURE: u32 = 0x6461_6568;

/// Size of the file identifier structure.
pub const FILE_IDENTIFIER_SIZE: usize = 64 * KIB as usize;

/// Size of a header structure (the checksum covers all of it).
pub const HEADER_SIZE: usize = 4 * KIB as usize;

const CREATOR_OFFSET: usize = 8;
const CREATOR_SIZE: usize = 512;

/// The file identifier at offset 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentifier {
    pub signature: u64,
    pub creator: String,
}

impl FileIdentifier {
    pub fn new(creator: impl Into<String>) -> Self {
        Self {
            signature: FILE_SIGNATURE,
            creator: creator.into(),
        }
    }

    /// Parse the identifier; only the signature is validated.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < CREATOR_OFFSET + CREATOR_SIZE {
            return Err(Error::format("file identifier too short"));
        }

        let signature = le_u64(data, 0);
        if signature != FILE_SIGNATURE {
            return Err(Error::format(format!(
                "invalid VHDX file signature: expected 0x{:016X}, got 0x{:016X}",
                FILE_SIGNATURE, signature
            )));
        }

        let units: Vec<u16> = data[CREATOR_OFFSET..CREATOR_OFFSET + CREATOR_SIZE]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();

        Ok(Self {
            signature,
            creator: String::from_utf16_lossy(&units),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; FILE_IDENTIFIER_SIZE];
        buf[0..8].copy_from_slice(&self.signature.to_le_bytes());

        // Creator is UTF-16LE, truncated to leave room for a terminator.
        let mut pos = CREATOR_OFFSET;
        for unit in self.creator.encode_utf16() {
            if pos + 2 >= CREATOR_OFFSET + CREATOR_SIZE {
                break;
            }
            buf[pos..pos + 2].copy_from_slice(&unit.to_le_bytes());
            pos += 2;
        }
        buf
    }
}

/// One of the two VHDX headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdxHeader {
    pub signature: u32,
    pub checksum: u32,
    pub sequence_number: u64,
    pub file_write_guid: Uuid,
    pub data_write_guid: Uuid,
    /// Nil when the log is empty.
    pub log_guid: Uuid,
    pub log_version: u16,
    pub version: u16,
    pub log_length: u32,
    pub log_offset: u64,
}

impl VhdxHeader {
    /// A fresh header with new write GUIDs and an empty log.
    pub fn new(log_offset: u64, log_length: u32) -> Self {
        let mut header = Self {
            signature: HEADER_SIGNATURE,
            checksum: 0,
            sequence_number: 0,
            file_write_guid: Uuid::new_v4(),
            data_write_guid: Uuid::new_v4(),
            log_guid: Uuid::nil(),
            log_version: 0,
            version: 1,
            log_length,
            log_offset,
        };
        header.update_checksum();
        header
    }

    /// Decodes a header without validating it; see [`VhdxHeader::is_valid`].
    ///
    /// Layout:
    /// - 0: signature "head" (4)
    /// - 4: checksum (4)
    /// - 8: sequence number (8)
    /// - 16: file write GUID (16)
    /// - 32: data write GUID (16)
    /// - 48: log GUID (16)
    /// - 64: log version (2)
    /// - 66: version (2)
    /// - 68: log length (4)
    /// - 72: log offset (8)
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::format("VHDX header too short"));
        }

        Ok(Self {
            signature: le_u32(data, 0),
            checksum: le_u32(data, 4),
            sequence_number: le_u64(data, 8),
            file_write_guid: le_guid(data, 16),
            data_write_guid: le_guid(data, 32),
            log_guid: le_guid(data, 48),
            log_version: le_u16(data, 64),
            version: le_u16(data, 66),
            log_length: le_u32(data, 68),
            log_offset: le_u64(data, 72),
        })
    }

    /// Decodes a header and returns it only if it is valid.
    pub fn parse_valid(data: &[u8]) -> Option<Self> {
        let header = Self::parse(data).ok()?;
        let checksum = checksum_with_zeroed_field(&data[..HEADER_SIZE], 4);
        if header.is_well_formed() && header.checksum == checksum {
            Some(header)
        } else {
            None
        }
    }

    fn is_well_formed(&self) -> bool {
        self.signature == HEADER_SIGNATURE && self.version == 1 && self.log_version == 0
    }

    /// Checks signature, versions and that the stored checksum matches the encoding.
    pub fn is_valid(&self) -> bool {
        self.is_well_formed() && self.checksum == self.compute_checksum()
    }

    pub fn compute_checksum(&self) -> u32 {
        let bytes = self.encode();
        checksum_with_zeroed_field(&bytes, 4)
    }

    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// True when the log holds entries that may need replay.
    pub fn has_log(&self) -> bool {
        !self.log_guid.is_nil()
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.signature.to_le_bytes());
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8..16].copy_from_slice(&self.sequence_number.to_le_bytes());
        put_guid(&mut buf, 16, &self.file_write_guid);
        put_guid(&mut buf, 32, &self.data_write_guid);
        put_guid(&mut buf, 48, &self.log_guid);
        buf[64..66].copy_from_slice(&self.log_version.to_le_bytes());
        buf[66..68].copy_from_slice(&self.version.to_le_bytes());
        buf[68..72].copy_from_slice(&self.log_length.to_le_bytes());
        buf[72..80].copy_from_slice(&self.log_offset.to_le_bytes());
        buf
    }

    /// Serializes the header to exactly 4 KiB.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_signature_spells_vhdxfile() {
        assert_eq!(&FILE_SIGNATURE.to_le_bytes(), b"vhdxfile");
        assert_eq!(&HEADER_SIGNATURE.to_le_bytes(), b"head");
    }

    #[test]
    fn test_file_identifier_creator() {
        let ident = FileIdentifier::new("vhdxtool");
        let bytes = ident.to_bytes();
        assert_eq!(bytes.len(), FILE_IDENTIFIER_SIZE);
        assert_eq!(&bytes[..8], b"vhdxfile");

        let parsed = FileIdentifier::parse(&bytes).unwrap();
        assert_eq!(parsed.creator, "vhdxtool");
    }

    #[test]
    fn test_file_identifier_bad_signature() {
        let bytes = vec![0u8; FILE_IDENTIFIER_SIZE];
        assert!(matches!(
            FileIdentifier::parse(&bytes),
            Err(Error::Format { .. })
        ));
    }

    #[test]
    fn test_header_checksum_validates() {
        let mut header = VhdxHeader::new(1024 * 1024, 1024 * 1024);
        header.sequence_number = 7;
        header.update_checksum();
        assert!(header.is_valid());

        let bytes = header.to_bytes();
        let parsed = VhdxHeader::parse_valid(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_corruption_detected() {
        let header = VhdxHeader::new(1024 * 1024, 1024 * 1024);
        let mut bytes = header.to_bytes();
        bytes[100] ^= 0xFF;
        assert!(VhdxHeader::parse_valid(&bytes).is_none());
    }

    #[test]
    fn test_header_field_offsets() {
        let mut header = VhdxHeader::new(0x0030_0000, 0x0010_0000);
        header.sequence_number = 0x0102_0304_0506_0708;
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"head");
        assert_eq!(le_u64(&bytes, 8), 0x0102_0304_0506_0708);
        assert_eq!(le_u16(&bytes, 66), 1);
        assert_eq!(le_u32(&bytes, 68), 0x0010_0000);
        assert_eq!(le_u64(&bytes, 72), 0x0030_0000);
    }
}
