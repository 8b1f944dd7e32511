#![cfg(not(target_arch = "wasm32"))]

mod common;

use std::path::Path;

use aero_ram_snapshot::{
    list_saves, save_file_status, HostSystem, LoadOptions, MemHostSystem, OsHostSystem, PageFlag,
    RamBlock, RamBlockFlags, RamLoader, RamSaver, RamSnapshotError, SaveFileStatus, SaveFlags,
    SaveOptions, RAM_INDEX_VERSION_V2, RAM_INDEX_VERSION_V3,
};
use proptest::prelude::*;

use common::{all_flag_modes, block, init_tracing, load_into, mixed_ram, save_full, PAGE};

#[test]
fn full_save_roundtrips_in_every_mode() {
    init_tracing();
    let ram = mixed_ram(32, 1);
    for flags in all_flag_modes() {
        let host = MemHostSystem::new();
        let stats = save_full(&host, "/ram.bin", &ram, flags);
        assert_eq!(stats.total_pages, 32);
        assert_eq!(stats.zero_pages, 8);
        assert_eq!(stats.changed_pages, 24);

        let mut restored = vec![0xAAu8; ram.len()];
        load_into(&host, "/ram.bin", "ram", &mut restored);
        assert_eq!(restored, ram, "flags {flags:?}");
    }
}

#[test]
fn compression_only_keeps_smaller_pages() {
    let ram = mixed_ram(8, 2);
    let host = MemHostSystem::new();
    let stats = save_full(&host, "/ram.bin", &ram, SaveFlags::COMPRESS);
    // Noisy pages stay raw, the repeating ones compress.
    assert_eq!(stats.raw_pages, 2);
    assert_eq!(stats.compressed_pages, 4);

    let loader = RamLoader::open(&host, "/ram.bin", LoadOptions::default()).unwrap();
    assert!(loader.is_compressed());
    assert!(!loader.is_incremental());
    assert_eq!(loader.version(), RAM_INDEX_VERSION_V2);
    for record in loader.page_records("ram").unwrap() {
        match record.flag {
            PageFlag::Compressed => assert!(record.size_on_disk < PAGE as u32),
            PageFlag::Raw => assert_eq!(record.size_on_disk, PAGE as u32),
            PageFlag::Zero => assert_eq!(record.size_on_disk, 0),
            PageFlag::Unchanged => panic!("unchanged page in a full save"),
        }
    }
}

#[test]
fn uncompressed_save_stores_whole_pages() {
    let ram = mixed_ram(8, 3);
    let host = MemHostSystem::new();
    let stats = save_full(&host, "/ram.bin", &ram, SaveFlags::empty());
    assert_eq!(stats.compressed_pages, 0);
    assert_eq!(stats.payload_bytes, 6 * PAGE as u64);
    assert_eq!(
        host.path_file_size(Path::new("/ram.bin")),
        Some(stats.disk_size)
    );
}

#[test]
fn small_batches_roundtrip_on_background_writer() {
    let ram = mixed_ram(64, 4);
    let host = MemHostSystem::new();
    let options = SaveOptions {
        flags: SaveFlags::COMPRESS | SaveFlags::BACKGROUND,
        batch_pages: 3,
        base: None,
    };
    let mut saver = RamSaver::create(&host, "/ram.bin", options).unwrap();
    saver.register_block(block("ram", &ram), &ram);
    // Scattered, out-of-order submission.
    for page in (0..64u64).rev().step_by(3) {
        saver.save_page("ram", page * PAGE as u64, PAGE as u64).unwrap();
    }
    saver.save_page("ram", 0, 8 * PAGE as u64).unwrap();
    let stats = saver.join().unwrap();
    assert_eq!(stats.total_pages, 64);

    let mut restored = vec![0u8; ram.len()];
    load_into(&host, "/ram.bin", "ram", &mut restored);
    assert_eq!(restored, ram);
}

#[test]
fn multiple_blocks_keep_registration_order() {
    let low = mixed_ram(4, 5);
    let high = mixed_ram(6, 6);
    let host = MemHostSystem::new();
    let mut saver =
        RamSaver::create(&host, "/ram.bin", SaveOptions::full(SaveFlags::COMPRESS)).unwrap();
    saver.register_block(block("pc.ram", &low).with_start_offset(0), &low);
    saver.register_block(
        block("pc.ram.high", &high).with_start_offset(0x1_0000_0000),
        &high,
    );
    saver.save_block("pc.ram.high").unwrap();
    saver.save_block("pc.ram").unwrap();
    saver.join().unwrap();

    let mut loader = RamLoader::open(&host, "/ram.bin", LoadOptions::default()).unwrap();
    let names: Vec<_> = loader
        .block_structure()
        .iter()
        .map(|b| (b.name.clone(), b.page_count, b.total_size()))
        .collect();
    assert_eq!(
        names,
        vec![
            ("pc.ram".to_string(), 4, 4 * PAGE as u64),
            ("pc.ram.high".to_string(), 6, 6 * PAGE as u64),
        ]
    );
    assert_eq!(loader.total_pages(), 10);

    let mut restored_low = vec![0u8; low.len()];
    let mut restored_high = vec![0u8; high.len()];
    loader
        .load_all(&mut [
            ("pc.ram.high", &mut restored_high[..]),
            ("pc.ram", &mut restored_low[..]),
        ])
        .unwrap();
    assert_eq!(restored_low, low);
    assert_eq!(restored_high, high);
}

#[test]
fn readonly_block_is_described_but_not_stored() {
    let rom = vec![0x5Au8; 4 * PAGE];
    let ram = mixed_ram(4, 7);
    let host = MemHostSystem::new();
    let mut saver =
        RamSaver::create(&host, "/ram.bin", SaveOptions::full(SaveFlags::empty())).unwrap();
    saver.register_block(
        block("bios", &rom)
            .with_flags(RamBlockFlags::READONLY)
            .with_path("/firmware/bios.bin"),
        &rom,
    );
    saver.register_block(block("ram", &ram), &ram);
    saver.save_block("bios").unwrap();
    saver.save_block("ram").unwrap();
    let stats = saver.join().unwrap();
    assert_eq!(stats.skipped_pages, 4);
    assert_eq!(stats.total_pages, 4);

    let mut loader = RamLoader::open(&host, "/ram.bin", LoadOptions::default()).unwrap();
    let bios = loader.find_block("bios").unwrap().clone();
    assert_eq!(bios.page_count, 4);
    assert_eq!(bios.flags, RamBlockFlags::READONLY);
    assert_eq!(bios.path, "/firmware/bios.bin");
    assert!(bios.pages().is_empty());

    let mut untouched = vec![0x11u8; rom.len()];
    loader.load_block("bios", &mut untouched).unwrap();
    assert!(untouched.iter().all(|&b| b == 0x11));
}

#[test]
fn restore_block_checks_registered_layout() {
    let ram = mixed_ram(8, 10);
    let host = MemHostSystem::new();
    save_full(&host, "/ram.bin", &ram, SaveFlags::COMPRESS);
    let mut loader = RamLoader::open(&host, "/ram.bin", LoadOptions::default()).unwrap();

    let mut restored = vec![0u8; ram.len()];
    loader.restore_block(&block("ram", &ram), &mut restored).unwrap();
    assert_eq!(restored, ram);

    let regrouped = RamBlock::new("ram", ram.len() as u64, 2 * PAGE as u32);
    assert!(matches!(
        loader.restore_block(&regrouped, &mut restored),
        Err(RamSnapshotError::PageSizeMismatch {
            expected: 8192,
            found: 4096,
            ..
        })
    ));
    let shorter = RamBlock::new("ram", 4 * PAGE as u64, PAGE as u32);
    assert!(matches!(
        loader.restore_block(&shorter, &mut restored[..4 * PAGE]),
        Err(RamSnapshotError::BlockSizeMismatch { .. })
    ));
    let missing = RamBlock::new("vram", 4 * PAGE as u64, PAGE as u32);
    assert!(matches!(
        loader.restore_block(&missing, &mut restored[..4 * PAGE]),
        Err(RamSnapshotError::BlockNotFound(_))
    ));
}

#[test]
fn mixed_page_sizes_use_tagged_index_when_uncompressed() {
    let small = mixed_ram(4, 8);
    let large = vec![3u8; 2 * 8192];
    for (flags, version) in [
        (SaveFlags::empty(), RAM_INDEX_VERSION_V3),
        (SaveFlags::COMPRESS, RAM_INDEX_VERSION_V2),
    ] {
        let host = MemHostSystem::new();
        let mut saver = RamSaver::create(&host, "/ram.bin", SaveOptions::full(flags)).unwrap();
        saver.register_block(block("small", &small), &small);
        saver.register_block(RamBlock::new("large", large.len() as u64, 8192), &large);
        let stats = saver.join().unwrap();
        assert_eq!(stats.total_pages, 6);

        let mut loader = RamLoader::open(&host, "/ram.bin", LoadOptions::default()).unwrap();
        assert_eq!(loader.version(), version);
        assert!(!loader.is_incremental());
        let mut restored_small = vec![0u8; small.len()];
        let mut restored_large = vec![0u8; large.len()];
        loader.load_block("small", &mut restored_small).unwrap();
        loader.load_block("large", &mut restored_large).unwrap();
        assert_eq!(restored_small, small);
        assert_eq!(restored_large, large);
    }
}

#[test]
fn os_host_saves_and_lists_files() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let host = OsHostSystem;
    let ram = mixed_ram(16, 9);
    let path = dir.path().join("snap1.ram");

    let mut saver = RamSaver::create(
        &host,
        &path,
        SaveOptions::full(SaveFlags::COMPRESS | SaveFlags::BACKGROUND),
    )
    .unwrap();
    saver.register_block(block("ram", &ram), &ram);
    saver.save_block("ram").unwrap();
    let stats = saver.join().unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), stats.disk_size);

    std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
    assert_eq!(list_saves(&host, dir.path(), "ram"), vec![path.clone()]);
    assert_eq!(
        save_file_status(&host, &path).unwrap(),
        SaveFileStatus::Complete
    );
    assert_eq!(
        save_file_status(&host, dir.path().join("missing.ram")).unwrap(),
        SaveFileStatus::Missing
    );

    let mut loader = RamLoader::open(&host, &path, LoadOptions::default()).unwrap();
    assert_eq!(loader.disk_size(), stats.disk_size);
    let mut restored = vec![0u8; ram.len()];
    loader.load_block("ram", &mut restored).unwrap();
    assert_eq!(restored, ram);

    assert!(host.delete_file(&path));
    assert!(list_saves(&host, dir.path(), "ram").is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn arbitrary_ram_roundtrips(
        pages in proptest::collection::vec(
            prop_oneof![
                Just(None),
                any::<u8>().prop_map(|b| Some(vec![b; PAGE])),
                proptest::collection::vec(any::<u8>(), PAGE).prop_map(Some),
            ],
            1..12,
        ),
        mode in 0usize..4,
    ) {
        let mut ram = Vec::with_capacity(pages.len() * PAGE);
        for page in &pages {
            match page {
                None => ram.extend_from_slice(&[0u8; PAGE]),
                Some(bytes) => ram.extend_from_slice(bytes),
            }
        }
        let host = MemHostSystem::new();
        save_full(&host, "/ram.bin", &ram, all_flag_modes()[mode]);

        let mut restored = vec![0xEEu8; ram.len()];
        load_into(&host, "/ram.bin", "ram", &mut restored);
        prop_assert_eq!(restored, ram);
    }
}
