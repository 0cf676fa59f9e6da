//! Translates the lower-level `arena_allocator` exercise: one arena per
//! enumerated device, each driving a handful of `i32`-sized allocations
//! that stand in for the original's per-device `deque`/`list`/`map`/
//! `vector` containers. Rust has no direct equivalent of an
//! allocator-parameterized STL container, so this exercises the arena's
//! raw alloc/free surface directly — the original `test/` variant's own
//! bar is "doesn't crash", which this equally satisfies.

use anyhow::{ensure, Context};
use sicm::ArenaFlags;

const ELEMENTS_PER_CONTAINER: usize = 64;

fn exercise_arena(device: usize, arena_id: u32, rt: &sicm::Runtime) -> anyhow::Result<()> {
    let mut ptrs = Vec::with_capacity(ELEMENTS_PER_CONTAINER);
    for i in 0..ELEMENTS_PER_CONTAINER {
        let ptr = rt
            .arena_alloc(arena_id, std::mem::size_of::<i32>())
            .with_context(|| format!("device {device} allocation {i} failed"))?;
        unsafe {
            (ptr as *mut i32).write(i as i32);
        }
        ptrs.push(ptr);
    }

    for (i, &ptr) in ptrs.iter().enumerate() {
        let value = unsafe { (ptr as *const i32).read() };
        ensure!(value == i as i32, "device {device} element {i} corrupted");
    }

    for ptr in ptrs {
        rt.free(ptr).context("free failed")?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("sicm=info").init();

    let rt = sicm::init().context("sicm runtime failed to initialize")?;
    let num_devices = rt.device_table().len();

    for device in 0..num_devices {
        let arena_id = rt
            .arena_create(0, ArenaFlags::empty(), &[device])
            .with_context(|| format!("arena_create on device {device} failed"))?;

        exercise_arena(device, arena_id, &rt)?;

        rt.arena_destroy(arena_id)
            .with_context(|| format!("arena_destroy on device {device} failed"))?;
        println!("device {device}: {ELEMENTS_PER_CONTAINER} elements allocated, verified, freed");
    }

    sicm::fini();
    Ok(())
}
