//! Log entries: header, descriptors and data sectors.

use std::io;

use uuid::Uuid;

use super::{LogRegion, LOG_SECTOR_SIZE};
use crate::error::{Error, Result};
use crate::extent::Extent;
use crate::format::{checksum_with_zeroed_field, le_guid, le_u32, le_u64, put_guid, round_up};
use crate::store::BackingStore;

/// "logE" as a little-endian u32.
pub const LOG_ENTRY_SIGNATURE: u32 = 0x6567_6F6C;
/// "zero" as a little-endian u32.
pub const ZERO_DESCRIPTOR_SIGNATURE: u32 = 0x6F72_657A;
/// "desc" as a little-endian u32.
pub const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x6373_6564;
/// "data" as a little-endian u32.
pub const DATA_SECTOR_SIGNATURE: u32 = 0x6174_6164;

pub const LOG_ENTRY_HEADER_SIZE: usize = 64;
pub const DESCRIPTOR_SIZE: usize = 32;

/// Bytes of a 4 KiB sector carried inside a data sector.
const DATA_PAYLOAD_SIZE: usize = 4084;
const LEADING_SIZE: usize = 8;
const TRAILING_SIZE: usize = 4;

/// The 64-byte header at the start of every log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntryHeader {
    /// "loge".
    pub signature: u32,
    /// CRC-32C over the whole entry with this field zeroed.
    pub checksum: u32,
    /// Entry length in bytes; a multiple of 4 KiB.
    pub entry_length: u32,
    /// Log position of the oldest entry still needed.
    pub tail: u32,
    pub sequence_number: u64,
    pub descriptor_count: u32,
    /// Must match the header's log GUID.
    pub log_guid: Uuid,
    /// File size known to be durable when the entry was written.
    pub flushed_file_offset: u64,
    /// File size the entry's writes extend to.
    pub last_file_offset: u64,
}

impl LogEntryHeader {
    /// Decode the header.
    ///
    /// Layout:
    /// - 0: signature "logE" (4)
    /// - 4: checksum (4)
    /// - 8: entry length (4)
    /// - 12: tail (4)
    /// - 16: sequence number (8)
    /// - 24: descriptor count (4)
    /// - 28: reserved (4)
    /// - 32: log GUID (16)
    /// - 48: flushed file offset (8)
    /// - 56: last file offset (8)
    pub fn parse(data: &[u8]) -> Self {
        Self {
            signature: le_u32(data, 0),
            checksum: le_u32(data, 4),
            entry_length: le_u32(data, 8),
            tail: le_u32(data, 12),
            sequence_number: le_u64(data, 16),
            descriptor_count: le_u32(data, 24),
            log_guid: le_guid(data, 32),
            flushed_file_offset: le_u64(data, 48),
            last_file_offset: le_u64(data, 56),
        }
    }

    pub fn write_to(&self, data: &mut [u8]) {
        data[0..4].copy_from_slice(&self.signature.to_le_bytes());
        data[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        data[8..12].copy_from_slice(&self.entry_length.to_le_bytes());
        data[12..16].copy_from_slice(&self.tail.to_le_bytes());
        data[16..24].copy_from_slice(&self.sequence_number.to_le_bytes());
        data[24..28].copy_from_slice(&self.descriptor_count.to_le_bytes());
        data[28..32].fill(0);
        put_guid(data, 32, &self.log_guid);
        data[48..56].copy_from_slice(&self.flushed_file_offset.to_le_bytes());
        data[56..64].copy_from_slice(&self.last_file_offset.to_le_bytes());
    }

    /// Offset of the first data sector within the entry.
    pub fn data_sectors_offset(&self) -> u64 {
        round_up(
            self.descriptor_count as u64 * DESCRIPTOR_SIZE as u64 + LOG_ENTRY_HEADER_SIZE as u64,
            LOG_SECTOR_SIZE,
        )
    }

    /// Structural checks that do not need the rest of the entry.
    pub fn is_valid(&self) -> bool {
        let length = self.entry_length as u64;
        self.signature == LOG_ENTRY_SIGNATURE
            && length != 0
            && length % LOG_SECTOR_SIZE == 0
            && self.data_sectors_offset() <= length
    }
}

/// A replayable update recorded in a log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    /// Zero `length` bytes at `file_offset`.
    Zero {
        file_offset: u64,
        length: u64,
        sequence_number: u64,
    },
    /// Write one 4 KiB sector at `file_offset`.
    Data {
        file_offset: u64,
        sequence_number: u64,
        sector: Box<[u8]>,
    },
}

impl Descriptor {
    pub fn file_offset(&self) -> u64 {
        match self {
            Self::Zero { file_offset, .. } | Self::Data { file_offset, .. } => *file_offset,
        }
    }

    pub fn file_length(&self) -> u64 {
        match self {
            Self::Zero { length, .. } => *length,
            Self::Data { .. } => LOG_SECTOR_SIZE,
        }
    }

    pub fn sequence_number(&self) -> u64 {
        match self {
            Self::Zero {
                sequence_number, ..
            }
            | Self::Data {
                sequence_number, ..
            } => *sequence_number,
        }
    }

    /// Applies the update to `target`.
    pub fn apply<S: BackingStore + ?Sized>(&self, target: &mut S) -> io::Result<()> {
        match self {
            Self::Zero {
                file_offset,
                length,
                ..
            } => {
                const ZERO_CHUNK: usize = 4096;
                let zeros = [0u8; ZERO_CHUNK];
                let mut done = 0u64;
                while done < *length {
                    let n = std::cmp::min(*length - done, ZERO_CHUNK as u64) as usize;
                    target.write_all_at(file_offset + done, &zeros[..n])?;
                    done += n as u64;
                }
                Ok(())
            }
            Self::Data {
                file_offset,
                sector,
                ..
            } => target.write_all_at(*file_offset, sector),
        }
    }
}

/// A validated log entry found at `position` within the log region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    position: u64,
    header: LogEntryHeader,
    descriptors: Vec<Descriptor>,
}

impl LogEntry {
    /// Reads the entry at `position` within the log.
    ///
    /// Returns `Ok(None)` when the bytes there are not a valid entry: bad
    /// signature, implausible length, checksum mismatch or a descriptor that
    /// fails its cross-checks.
    pub fn try_read<S: BackingStore + ?Sized>(
        store: &mut S,
        log: LogRegion,
        position: u64,
    ) -> Result<Option<Self>> {
        let mut first = vec![0u8; LOG_SECTOR_SIZE as usize];
        if !read_or_eof(store, log, position, &mut first)? {
            return Ok(None);
        }

        let header = LogEntryHeader::parse(&first);
        if !header.is_valid() || header.entry_length as u64 > log.length {
            return Ok(None);
        }

        let mut buf = vec![0u8; header.entry_length as usize];
        buf[..first.len()].copy_from_slice(&first);
        let rest_start = first.len();
        if rest_start < buf.len()
            && !read_or_eof(
                store,
                log,
                position + LOG_SECTOR_SIZE,
                &mut buf[rest_start..],
            )?
        {
            return Ok(None);
        }

        if header.checksum != checksum_with_zeroed_field(&buf, 4) {
            return Ok(None);
        }

        match parse_descriptors(&header, &buf) {
            Some(descriptors) => Ok(Some(Self {
                position: position % log.length,
                header,
                descriptors,
            })),
            None => Ok(None),
        }
    }

    /// Offset of the entry within the log region.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn header(&self) -> &LogEntryHeader {
        &self.header
    }

    pub fn sequence_number(&self) -> u64 {
        self.header.sequence_number
    }

    pub fn tail(&self) -> u64 {
        self.header.tail as u64
    }

    pub fn log_guid(&self) -> Uuid {
        self.header.log_guid
    }

    pub fn entry_length(&self) -> u64 {
        self.header.entry_length as u64
    }

    pub fn flushed_file_offset(&self) -> u64 {
        self.header.flushed_file_offset
    }

    pub fn last_file_offset(&self) -> u64 {
        self.header.last_file_offset
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// File ranges this entry rewrites.
    pub fn modified_extents(&self) -> Vec<Extent> {
        self.descriptors
            .iter()
            .map(|d| Extent::new(d.file_offset(), d.file_length()))
            .collect()
    }

    /// Applies every descriptor to `target`, in order.
    pub fn replay<S: BackingStore + ?Sized>(&self, target: &mut S) -> Result<()> {
        for descriptor in &self.descriptors {
            descriptor.apply(target)?;
        }
        Ok(())
    }
}

/// Circular read that reports running off the end of the store as `false`.
fn read_or_eof<S: BackingStore + ?Sized>(
    store: &mut S,
    log: LogRegion,
    position: u64,
    buf: &mut [u8],
) -> Result<bool> {
    match log.read(store, position, buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(Error::io_simple(e)),
    }
}

fn parse_descriptors(header: &LogEntryHeader, entry: &[u8]) -> Option<Vec<Descriptor>> {
    let sequence_number = header.sequence_number;
    let mut data_pos = header.data_sectors_offset() as usize;
    let mut descriptors = Vec::with_capacity(header.descriptor_count as usize);

    for i in 0..header.descriptor_count as usize {
        let off = LOG_ENTRY_HEADER_SIZE + i * DESCRIPTOR_SIZE;
        let d = &entry[off..off + DESCRIPTOR_SIZE];
        let descriptor_sequence = le_u64(d, 24);
        if descriptor_sequence != sequence_number {
            return None;
        }

        let descriptor = match le_u32(d, 0) {
            ZERO_DESCRIPTOR_SIGNATURE => Descriptor::Zero {
                length: le_u64(d, 8),
                file_offset: le_u64(d, 16),
                sequence_number: descriptor_sequence,
            },
            DATA_DESCRIPTOR_SIGNATURE => {
                let sector_end = data_pos + LOG_SECTOR_SIZE as usize;
                if sector_end > entry.len() {
                    return None;
                }
                let data = &entry[data_pos..sector_end];
                let echoes_sequence = le_u32(data, 4) == (sequence_number >> 32) as u32
                    && le_u32(data, LOG_SECTOR_SIZE as usize - TRAILING_SIZE)
                        == sequence_number as u32;
                if le_u32(data, 0) != DATA_SECTOR_SIGNATURE || !echoes_sequence {
                    return None;
                }

                let mut sector = vec![0u8; LOG_SECTOR_SIZE as usize].into_boxed_slice();
                sector[..LEADING_SIZE].copy_from_slice(&d[8..16]);
                sector[LEADING_SIZE..LEADING_SIZE + DATA_PAYLOAD_SIZE]
                    .copy_from_slice(&data[LEADING_SIZE..LEADING_SIZE + DATA_PAYLOAD_SIZE]);
                sector[LEADING_SIZE + DATA_PAYLOAD_SIZE..].copy_from_slice(&d[4..8]);
                data_pos = sector_end;

                Descriptor::Data {
                    file_offset: le_u64(d, 16),
                    sequence_number: descriptor_sequence,
                    sector,
                }
            }
            _ => return None,
        };
        descriptors.push(descriptor);
    }
    Some(descriptors)
}

/// Encodes log entries.
///
/// Useful for producing logs to exercise recovery; the engine itself never
/// writes to the log.
#[derive(Debug, Clone)]
pub struct LogEntryBuilder {
    log_guid: Uuid,
    sequence_number: u64,
    tail: u32,
    flushed_file_offset: u64,
    last_file_offset: u64,
    descriptors: Vec<Descriptor>,
}

impl LogEntryBuilder {
    pub fn new(log_guid: Uuid, sequence_number: u64) -> Self {
        Self {
            log_guid,
            sequence_number,
            tail: 0,
            flushed_file_offset: 0,
            last_file_offset: 0,
            descriptors: Vec::new(),
        }
    }

    pub fn tail(mut self, tail: u32) -> Self {
        self.tail = tail;
        self
    }

    pub fn flushed_file_offset(mut self, offset: u64) -> Self {
        self.flushed_file_offset = offset;
        self
    }

    pub fn last_file_offset(mut self, offset: u64) -> Self {
        self.last_file_offset = offset;
        self
    }

    pub fn zero(mut self, file_offset: u64, length: u64) -> Self {
        self.descriptors.push(Descriptor::Zero {
            file_offset,
            length,
            sequence_number: self.sequence_number,
        });
        self
    }

    /// Adds a full 4 KiB sector; `sector` shorter than 4 KiB is zero-padded.
    pub fn data(mut self, file_offset: u64, sector: &[u8]) -> Self {
        let mut full = vec![0u8; LOG_SECTOR_SIZE as usize].into_boxed_slice();
        let n = sector.len().min(full.len());
        full[..n].copy_from_slice(&sector[..n]);
        self.descriptors.push(Descriptor::Data {
            file_offset,
            sequence_number: self.sequence_number,
            sector: full,
        });
        self
    }

    /// Serializes the entry with a valid checksum.
    pub fn build(&self) -> Vec<u8> {
        let data_count = self
            .descriptors
            .iter()
            .filter(|d| matches!(d, Descriptor::Data { .. }))
            .count() as u64;

        let mut header = LogEntryHeader {
            signature: LOG_ENTRY_SIGNATURE,
            checksum: 0,
            entry_length: 0,
            tail: self.tail,
            sequence_number: self.sequence_number,
            descriptor_count: self.descriptors.len() as u32,
            log_guid: self.log_guid,
            flushed_file_offset: self.flushed_file_offset,
            last_file_offset: self.last_file_offset,
        };
        let data_start = header.data_sectors_offset();
        header.entry_length = (data_start + data_count * LOG_SECTOR_SIZE) as u32;

        let mut buf = vec![0u8; header.entry_length as usize];
        let seq = self.sequence_number;
        let mut data_pos = data_start as usize;

        for (i, descriptor) in self.descriptors.iter().enumerate() {
            let off = LOG_ENTRY_HEADER_SIZE + i * DESCRIPTOR_SIZE;
            match descriptor {
                Descriptor::Zero {
                    file_offset,
                    length,
                    ..
                } => {
                    buf[off..off + 4].copy_from_slice(&ZERO_DESCRIPTOR_SIGNATURE.to_le_bytes());
                    buf[off + 8..off + 16].copy_from_slice(&length.to_le_bytes());
                    buf[off + 16..off + 24].copy_from_slice(&file_offset.to_le_bytes());
                }
                Descriptor::Data {
                    file_offset,
                    sector,
                    ..
                } => {
                    let trailing = &sector[LEADING_SIZE + DATA_PAYLOAD_SIZE..];
                    buf[off..off + 4].copy_from_slice(&DATA_DESCRIPTOR_SIGNATURE.to_le_bytes());
                    buf[off + 4..off + 8].copy_from_slice(trailing);
                    buf[off + 8..off + 16].copy_from_slice(&sector[..LEADING_SIZE]);
                    buf[off + 16..off + 24].copy_from_slice(&file_offset.to_le_bytes());

                    let data = &mut buf[data_pos..data_pos + LOG_SECTOR_SIZE as usize];
                    data[0..4].copy_from_slice(&DATA_SECTOR_SIGNATURE.to_le_bytes());
                    data[4..8].copy_from_slice(&((seq >> 32) as u32).to_le_bytes());
                    data[LEADING_SIZE..LEADING_SIZE + DATA_PAYLOAD_SIZE]
                        .copy_from_slice(&sector[LEADING_SIZE..LEADING_SIZE + DATA_PAYLOAD_SIZE]);
                    data[4092..4096].copy_from_slice(&(seq as u32).to_le_bytes());
                    data_pos += LOG_SECTOR_SIZE as usize;
                }
            }
            buf[off + 24..off + 32].copy_from_slice(&seq.to_le_bytes());
        }

        header.write_to(&mut buf[..LOG_ENTRY_HEADER_SIZE]);
        let checksum = checksum_with_zeroed_field(&buf, 4);
        buf[4..8].copy_from_slice(&checksum.to_le_bytes());
        buf
    }
}
