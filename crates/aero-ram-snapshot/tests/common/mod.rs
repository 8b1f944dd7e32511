#![allow(dead_code)]

use aero_ram_snapshot::{
    HostSystem, LoadOptions, MemHostSystem, RamBlock, RamLoader, RamSaver, SaveFlags, SaveOptions,
    SaveStats,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const PAGE: usize = 4096;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn all_flag_modes() -> [SaveFlags; 4] {
    [
        SaveFlags::empty(),
        SaveFlags::COMPRESS,
        SaveFlags::BACKGROUND,
        SaveFlags::COMPRESS | SaveFlags::BACKGROUND,
    ]
}

/// Guest RAM with a mix of zero, compressible and noisy pages.
pub fn mixed_ram(pages: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ram = vec![0u8; pages * PAGE];
    for (i, page) in ram.chunks_exact_mut(PAGE).enumerate() {
        match i % 4 {
            0 => {}
            1 => page.fill(i as u8 | 1),
            2 => rng.fill(page),
            _ => {
                for (j, b) in page.iter_mut().enumerate() {
                    *b = (j % 13) as u8;
                }
            }
        }
    }
    ram
}

pub fn block(name: &str, ram: &[u8]) -> RamBlock {
    RamBlock::new(name, ram.len() as u64, PAGE as u32)
}

/// Full save of one block named `ram`.
pub fn save_full(host: &MemHostSystem, path: &str, ram: &[u8], flags: SaveFlags) -> SaveStats {
    let mut saver = RamSaver::create(host, path, SaveOptions::full(flags)).unwrap();
    saver.register_block(block("ram", ram), ram);
    saver.save_block("ram").unwrap();
    saver.join().unwrap()
}

pub fn load_into<H: HostSystem>(host: &H, path: &str, name: &str, buf: &mut [u8]) {
    let mut loader = RamLoader::open(host, path, LoadOptions::default()).unwrap();
    loader.load_block(name, buf).unwrap();
}
