//! End-to-end coverage of the public free-function API surface (`init`,
//! `arena_create`/`arena_create_shared_at`, `arena_alloc`, `free`,
//! `lookup`, `arena_set_device`). `sicm::init()` is a process-wide
//! singleton, so every test in this binary shares one `Runtime` — each
//! test creates its own arena rather than assuming a clean slate.

use std::io::Read;

#[test]
fn arena_create_alloc_lookup_free_round_trip() {
    let rt = sicm::init().unwrap();
    let arena_id = rt
        .arena_create(0, sicm::ArenaFlags::empty(), &[0])
        .unwrap();

    let ptr = rt.arena_alloc(arena_id, 4096).unwrap();
    assert_eq!(rt.lookup(ptr), Some(arena_id));

    rt.free(ptr).unwrap();
    assert_eq!(rt.lookup(ptr), None);
}

/// Scenario 4 at the public-API layer: two `Runtime`s over the same
/// tempfile path, simulating two processes sharing a `SHARED` arena.
#[test]
fn shared_arena_round_trips_through_the_runtime_api() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sicm-runtime-shared");

    let rt = sicm::init().unwrap();
    let arena_a = rt
        .arena_create_shared_at(&path, 0, &[0])
        .unwrap();
    let ptr_a = rt.arena_alloc(arena_a, 8192).unwrap();
    unsafe {
        std::ptr::write_bytes(ptr_a as *mut u8, 0x5a, 8192);
    }

    let arena_b = rt
        .arena_create_shared_at(&path, 0, &[0])
        .unwrap();
    let ptr_b = rt.arena_alloc(arena_b, 8192).unwrap();
    let observed = unsafe { std::slice::from_raw_parts(ptr_b as *const u8, 8192) };
    assert_eq!(observed, [0x5au8; 8192].as_slice());

    let mut file = std::fs::File::open(&path).unwrap();
    let mut from_disk = vec![0u8; 8192];
    file.read_exact(&mut from_disk).unwrap();
    assert_eq!(from_disk, vec![0x5au8; 8192]);

    rt.free(ptr_a).unwrap();
    rt.free(ptr_b).unwrap();
}

#[test]
fn migrate_arena_preserves_lookup_and_bytes() {
    let rt = sicm::init().unwrap();
    let devices = rt.device_table().len();
    if devices < 2 {
        // Single-device test environment: the rebind path still has to
        // not error, even though there's nowhere else to move to.
        let arena_id = rt.arena_create(0, sicm::ArenaFlags::empty(), &[0]).unwrap();
        let ptr = rt.arena_alloc(arena_id, 4096).unwrap();
        rt.arena_set_device(arena_id, 0).unwrap();
        assert_eq!(rt.lookup(ptr), Some(arena_id));
        rt.free(ptr).unwrap();
        return;
    }

    let arena_id = rt.arena_create(0, sicm::ArenaFlags::empty(), &[0]).unwrap();
    let ptr = rt.arena_alloc(arena_id, 4096).unwrap();
    unsafe {
        std::ptr::write_bytes(ptr as *mut u8, 0x7e, 4096);
    }

    rt.arena_set_device(arena_id, 1).unwrap();
    assert_eq!(rt.lookup(ptr), Some(arena_id));
    let byte = unsafe { *(ptr as *const u8) };
    assert_eq!(byte, 0x7e);

    rt.free(ptr).unwrap();
}

#[test]
fn free_function_api_matches_the_runtime_handle() {
    let rt = sicm::init().unwrap();
    let arena_id = rt.default_arena_id();

    let ptr = sicm::arena_alloc(arena_id, 512);
    assert!(!ptr.is_null());
    assert_eq!(sicm::lookup(ptr as *const u8), Some(arena_id));
    sicm::free(ptr);
    assert_eq!(sicm::lookup(ptr as *const u8), None);
}
