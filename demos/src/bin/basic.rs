//! Device enumeration plus a single allocate/write/read/free pass on the
//! default device, the same shape as the original low-level `basic.c`
//! smoke test: list what `sicm_init` found, then prove the default arena
//! can actually hold and give back bytes.

use anyhow::{ensure, Context};
use sicm::ArenaFlags;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("sicm=info").init();

    let rt = sicm::init().context("sicm runtime failed to initialize")?;

    let devices = rt.device_table().devices();
    println!("discovered {} device(s):", devices.len());
    for (i, d) in devices.iter().enumerate() {
        println!(
            "  [{i}] tag={:<16} numa_node={:<3} page_size={:<6} capacity_bytes={}",
            d.tag.as_str(),
            d.numa_node,
            d.page_size(),
            d.tier_data.capacity_bytes,
        );
    }

    let arena_id = rt
        .arena_create(0, ArenaFlags::empty(), &[0])
        .context("failed to create demo arena")?;
    println!("created arena {arena_id} bound to device 0");

    const LEN: usize = 4096;
    let ptr = rt
        .arena_alloc(arena_id, LEN)
        .context("allocation failed")?;
    let slice = unsafe { std::slice::from_raw_parts_mut(ptr as *mut u8, LEN) };
    for (i, byte) in slice.iter_mut().enumerate() {
        *byte = (i % 256) as u8;
    }
    for (i, byte) in slice.iter().enumerate() {
        ensure!(*byte == (i % 256) as u8, "byte {i} didn't round-trip");
    }
    println!("wrote and verified {LEN} bytes through arena {arena_id}");

    rt.free(ptr).context("free failed")?;
    rt.arena_destroy(arena_id).context("arena_destroy failed")?;
    println!("freed allocation and destroyed arena {arena_id}");

    sicm::fini();
    Ok(())
}
