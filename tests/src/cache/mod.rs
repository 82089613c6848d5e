//! Block cache bookkeeping tests: registration, lookup, write maps and
//! self-modification handling. These drive the translator for real but
//! never execute the generated code, so they run on any host.

use drc_backend::HostGen;
use drc_cache::BlockCache;
use drc_core::state::{CS, SMC_CURRENT_BLOCK};
use drc_core::{CoreConfig, CpuState, EXCEPTION_NONE};
use drc_decoder::create_block;

fn test_config() -> CoreConfig {
    CoreConfig {
        cache_total: 256 * 1024,
        block_count: 1024,
        page_count: 8,
        ..CoreConfig::default()
    }
}

fn setup(ram: &mut Vec<u8>) -> (Box<CpuState>, BlockCache, HostGen) {
    let mut gen = HostGen::new();
    let cache = BlockCache::new(test_config(), &mut gen).unwrap();
    let mut env = Box::new(CpuState::new(ram.as_mut_ptr(), ram.len() as u32));
    env.cycles = 1000;
    (env, cache, gen)
}

/// mov ax,5 / hlt at phys 0x1000.
fn simple_program(ram: &mut [u8]) {
    ram[0x1000..0x1004].copy_from_slice(&[0xb8, 0x05, 0x00, 0xf4]);
}

#[test]
fn translated_block_is_registered() {
    let mut ram = vec![0u8; 0x10000];
    simple_program(&mut ram);
    let (mut env, mut cache, mut gen) = setup(&mut ram);
    env.set_seg(CS, 0x100);

    let b = create_block(&mut env, &mut cache, &mut gen).unwrap();
    assert_eq!(cache.lookup(0x1000), Some(b));
    let blk = cache.block(b);
    assert_eq!(blk.page_start, 0);
    assert!(blk.page_end >= 3);
}

#[test]
fn write_into_covered_code_invalidates() {
    let mut ram = vec![0u8; 0x10000];
    simple_program(&mut ram);
    let (mut env, mut cache, mut gen) = setup(&mut ram);
    env.set_seg(CS, 0x100);

    create_block(&mut env, &mut cache, &mut gen).unwrap();
    env.eip = 0x500; // step away so the write is not self-modification
    assert_eq!(cache.guest_write(&mut env, 0x1000, 0x90, 1), 0);
    assert_eq!(ram[0x1000], 0x90);
    assert_eq!(cache.lookup(0x1000), None);
}

#[test]
fn same_value_write_keeps_the_block() {
    let mut ram = vec![0u8; 0x10000];
    simple_program(&mut ram);
    let (mut env, mut cache, mut gen) = setup(&mut ram);
    env.set_seg(CS, 0x100);

    let b = create_block(&mut env, &mut cache, &mut gen).unwrap();
    env.eip = 0x500;
    assert_eq!(cache.guest_write(&mut env, 0x1000, 0xb8, 1), 0);
    assert_eq!(cache.lookup(0x1000), Some(b));
}

#[test]
fn self_modification_of_running_block_faults() {
    let mut ram = vec![0u8; 0x10000];
    simple_program(&mut ram);
    let (mut env, mut cache, mut gen) = setup(&mut ram);
    env.set_seg(CS, 0x100);

    create_block(&mut env, &mut cache, &mut gen).unwrap();
    // EIP still points into the block: the store must be refused.
    assert_eq!(cache.guest_write(&mut env, 0x1003, 0x07, 1), 1);
    assert_eq!(env.exception, SMC_CURRENT_BLOCK);
    assert_eq!(ram[0x1003], 0xf4);
}

#[test]
fn captured_immediate_bytes_carry_no_coverage() {
    let mut ram = vec![0u8; 0x10000];
    simple_program(&mut ram);
    let (mut env, mut cache, mut gen) = setup(&mut ram);
    env.set_seg(CS, 0x100);

    let b = create_block(&mut env, &mut cache, &mut gen).unwrap();
    // The mov immediate was captured by pointer, so rewriting it must
    // not drop the block; generated code reads it from RAM anyway.
    env.eip = 0x500;
    env.exception = EXCEPTION_NONE;
    assert_eq!(cache.guest_write(&mut env, 0x1001, 0x2a, 1), 0);
    assert_eq!(cache.lookup(0x1000), Some(b));
    assert_eq!(ram[0x1001], 0x2a);
}

#[test]
fn hot_byte_defers_translation() {
    let mut ram = vec![0u8; 0x10000];
    let (mut env, mut cache, mut gen) = setup(&mut ram);
    env.set_seg(CS, 0x100);

    // inc ax / dec ax, alternated so every store really changes RAM.
    let variants = [0x40u8, 0x48, 0x40, 0x48];
    ram[0x1000] = 0x40;
    ram[0x1001] = 0xf4;
    for (i, &op) in variants.iter().enumerate() {
        env.eip = 0;
        create_block(&mut env, &mut cache, &mut gen).unwrap();
        env.eip = 0x500;
        let next = if i + 1 < variants.len() {
            variants[i + 1]
        } else {
            op ^ 8
        };
        assert_eq!(cache.guest_write(&mut env, 0x1000, next as u32, 1), 0);
    }

    // Four invalidations of the same byte: translation now refuses to
    // decode it and the block defers straight to the interpreter.
    env.eip = 0;
    let b = create_block(&mut env, &mut cache, &mut gen).unwrap();
    let blk = cache.block(b);
    assert_eq!(blk.page_start, blk.page_end);
    let page = cache.page_index(1).unwrap();
    assert_eq!(cache.page(page).write_map[0], 0);
}

#[test]
fn cross_page_block_invalidated_from_second_page() {
    let mut ram = vec![0u8; 0x10000];
    ram[0x1fff] = 0x40; // inc ax, last byte of the page
    ram[0x2000] = 0xf4; // hlt on the next page
    let (mut env, mut cache, mut gen) = setup(&mut ram);
    env.set_seg(CS, 0x1ff);
    env.eip = 0xf;

    let b = create_block(&mut env, &mut cache, &mut gen).unwrap();
    assert_eq!(cache.lookup(0x1fff), Some(b));

    env.eip = 0x500;
    assert_eq!(cache.guest_write(&mut env, 0x2000, 0x90, 1), 0);
    assert_eq!(cache.lookup(0x1fff), None);
}

#[test]
fn reset_drops_all_blocks_and_pages() {
    let mut ram = vec![0u8; 0x10000];
    simple_program(&mut ram);
    let (mut env, mut cache, mut gen) = setup(&mut ram);
    env.set_seg(CS, 0x100);

    create_block(&mut env, &mut cache, &mut gen).unwrap();
    cache.reset().unwrap();
    assert_eq!(cache.lookup(0x1000), None);
    assert_eq!(cache.page_index(1), None);
}
