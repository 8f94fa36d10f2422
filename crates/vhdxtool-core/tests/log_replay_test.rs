//! Integration tests for log discovery and replay at open.

use std::io::Cursor;

use uuid::Uuid;
use vhdxtool_core::format::header::HEADER_SIZE;
use vhdxtool_core::format::{
    BatEntry, PayloadBlockStatus, VhdxHeader, HEADER1_OFFSET, HEADER2_OFFSET, MIB,
};
use vhdxtool_core::log::{find_active_sequence, LogEntryBuilder, LogRegion};
use vhdxtool_core::{BackingStore, CreateOptions, DiskImageFile, Error, OpenOptions, VirtualDisk};

const LOG: LogRegion = LogRegion {
    offset: MIB,
    length: MIB,
};
const BAT_OFFSET: u64 = 3 * MIB;
const BLOCK_OFFSET: u64 = 4 * MIB;

/// A fresh 64 MiB image with 1 MiB blocks.
fn fresh_image() -> Cursor<Vec<u8>> {
    let options = CreateOptions::new(64 * MIB).with_block_size(MIB);
    DiskImageFile::create_dynamic(Cursor::new(Vec::new()), options)
        .unwrap()
        .into_store()
}

fn set_log_guid(store: &mut Cursor<Vec<u8>>, guid: Uuid) {
    for offset in [HEADER1_OFFSET, HEADER2_OFFSET] {
        let mut data = vec![0u8; HEADER_SIZE];
        store.read_exact_at(offset, &mut data).unwrap();
        let mut header = VhdxHeader::parse_valid(&data).unwrap();
        header.log_guid = guid;
        header.update_checksum();
        store.write_all_at(offset, &header.to_bytes()).unwrap();
    }
}

/// Writes `entries` back to back from the start of the log.
fn write_log(store: &mut Cursor<Vec<u8>>, entries: &[LogEntryBuilder]) {
    let mut position = 0;
    for entry in entries {
        let bytes = entry.build();
        LOG.write(store, position, &bytes).unwrap();
        position += bytes.len() as u64;
    }
}

/// The first BAT sector with block 0 mapped fully present at 4 MiB.
fn bat_sector() -> Vec<u8> {
    let mut sector = vec![0u8; 4096];
    BatEntry::new(PayloadBlockStatus::FullyPresent.bits(), BLOCK_OFFSET / MIB).write_to(&mut sector, 0);
    sector
}

/// An image whose log maps block 0 and fills its first sector with 0x5A.
fn image_with_pending_write() -> Cursor<Vec<u8>> {
    let guid = Uuid::new_v4();
    let mut store = fresh_image();
    set_log_guid(&mut store, guid);
    write_log(
        &mut store,
        &[LogEntryBuilder::new(guid, 1)
            .tail(0)
            .flushed_file_offset(4 * MIB)
            .last_file_offset(5 * MIB)
            .data(BAT_OFFSET, &bat_sector())
            .data(BLOCK_OFFSET, &[0x5A; 4096])],
    );
    store
}

fn first_sector(image: DiskImageFile<Cursor<Vec<u8>>>) -> Vec<u8> {
    let mut disk = image.open_content(None);
    let mut buf = vec![0u8; 4096];
    disk.read_at(0, &mut buf).unwrap();
    buf
}

#[test]
fn test_writable_open_replays_and_clears_log() {
    let image = DiskImageFile::open(image_with_pending_write(), OpenOptions::read_write()).unwrap();
    assert_eq!(image.log_sequence().len(), 1);
    assert!(image.header().log_guid.is_nil());
    assert!(!image.is_replayed_in_memory());

    let mut store = image.into_store();
    assert_eq!(store.len().unwrap(), 5 * MIB);

    let image = DiskImageFile::open(store, OpenOptions::read_only()).unwrap();
    assert!(image.log_sequence().is_empty());
    assert_eq!(first_sector(image), vec![0x5A; 4096]);
}

#[test]
fn test_read_only_open_replays_in_memory() {
    let store = image_with_pending_write();
    let before = store.get_ref().clone();

    let image = DiskImageFile::open(store, OpenOptions::read_only()).unwrap();
    assert!(image.is_replayed_in_memory());
    assert!(!image.header().log_guid.is_nil());

    let mut disk = image.open_content(None);
    let mut buf = vec![0u8; 4096];
    disk.read_at(0, &mut buf).unwrap();
    assert_eq!(buf, vec![0x5A; 4096]);
    disk.read_at(4096, &mut buf).unwrap();
    assert_eq!(buf, vec![0u8; 4096]);

    assert_eq!(disk.into_store().into_inner().into_inner(), before);
}

#[test]
fn test_replay_is_idempotent() {
    let store = image_with_pending_write();
    let header = &store.get_ref()[HEADER2_OFFSET as usize..][..HEADER_SIZE];
    let guid = VhdxHeader::parse_valid(header).unwrap().log_guid;

    let replay = |bytes: &Vec<u8>, times: usize| {
        let mut copy = Cursor::new(bytes.clone());
        let sequence = find_active_sequence(&mut copy, LOG, guid).unwrap();
        assert_eq!(sequence.len(), 1);
        for _ in 0..times {
            for entry in &sequence {
                entry.replay(&mut copy).unwrap();
            }
        }
        copy.into_inner()
    };

    let once = replay(store.get_ref(), 1);
    let twice = replay(store.get_ref(), 2);
    assert_eq!(once, twice);
    assert_ne!(&once, store.get_ref());
}

#[test]
fn test_later_entries_replay_after_earlier_ones() {
    let guid = Uuid::new_v4();
    let mut store = fresh_image();
    set_log_guid(&mut store, guid);

    let first = LogEntryBuilder::new(guid, 5)
        .tail(0)
        .flushed_file_offset(4 * MIB)
        .last_file_offset(5 * MIB)
        .data(BAT_OFFSET, &bat_sector())
        .data(BLOCK_OFFSET, &[0x5A; 4096])
        .data(BLOCK_OFFSET + 4096, &[0x6B; 4096]);
    let second = LogEntryBuilder::new(guid, 6)
        .tail(0)
        .flushed_file_offset(4 * MIB)
        .last_file_offset(5 * MIB)
        .zero(BLOCK_OFFSET, 4096);
    write_log(&mut store, &[first, second]);

    let image = DiskImageFile::open(store, OpenOptions::read_only()).unwrap();
    let numbers: Vec<u64> = image
        .log_sequence()
        .iter()
        .map(|e| e.sequence_number())
        .collect();
    assert_eq!(numbers, vec![5, 6]);

    let mut disk = image.open_content(None);
    let mut buf = vec![0u8; 8192];
    disk.read_at(0, &mut buf).unwrap();
    assert!(buf[..4096].iter().all(|&b| b == 0));
    assert!(buf[4096..].iter().all(|&b| b == 0x6B));
}

#[test]
fn test_truncated_file_is_corrupt() {
    let guid = Uuid::new_v4();
    let mut store = fresh_image();
    set_log_guid(&mut store, guid);
    write_log(
        &mut store,
        &[LogEntryBuilder::new(guid, 1)
            .tail(0)
            .flushed_file_offset(100 * MIB)
            .last_file_offset(100 * MIB)
            .zero(BLOCK_OFFSET, 4096)],
    );

    let err = DiskImageFile::open(store, OpenOptions::read_only()).unwrap_err();
    assert!(matches!(err, Error::Corrupt { .. }), "{err}");
}

#[test]
fn test_log_without_valid_sequence_is_corrupt() {
    let mut store = fresh_image();
    set_log_guid(&mut store, Uuid::new_v4());
    // Entries tagged with some other log never match.
    write_log(
        &mut store,
        &[LogEntryBuilder::new(Uuid::new_v4(), 1).tail(0)],
    );

    let err = DiskImageFile::open(store, OpenOptions::read_only()).unwrap_err();
    assert!(matches!(err, Error::Corrupt { .. }), "{err}");
}

#[test]
fn test_empty_entry_opens_without_replay() {
    let guid = Uuid::new_v4();
    let mut store = fresh_image();
    set_log_guid(&mut store, guid);
    write_log(
        &mut store,
        &[LogEntryBuilder::new(guid, 9)
            .tail(0)
            .flushed_file_offset(4 * MIB)
            .last_file_offset(4 * MIB)],
    );
    let before = store.get_ref().clone();

    let mut image = DiskImageFile::open(store, OpenOptions::read_only()).unwrap();
    assert!(!image.is_replayed_in_memory());
    let info = image.info().unwrap();
    assert_eq!(info.log_entries.len(), 1);
    assert_eq!(info.log_entries[0].sequence_number, 9);
    assert!(info.log_entries[0].modified_extents.is_empty());
    assert_eq!(image.into_store().into_inner(), before);
}

#[test]
fn test_info_reports_log_entries() {
    let mut image =
        DiskImageFile::open(image_with_pending_write(), OpenOptions::read_only()).unwrap();
    let info = image.info().unwrap();

    assert_eq!(info.creator, "vhdxtool");
    assert_eq!(info.active_header, 2);
    assert_eq!(info.log_entries.len(), 1);
    let entry = &info.log_entries[0];
    assert_eq!(entry.position, 0);
    assert_eq!(entry.last_file_offset, 5 * MIB);
    assert_eq!(entry.modified_extents.len(), 2);
    assert_eq!(entry.modified_extents[0].start, BAT_OFFSET);
}
