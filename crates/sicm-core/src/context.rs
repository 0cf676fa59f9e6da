use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::arena::{Arena, ArenaFlags};
use crate::config::Config;
use crate::device::DeviceTable;
use crate::error::{Result, SicmError};
use crate::registry::ExtentRegistry;

/// Process-wide handle returned by `init`. Owns the device table, the
/// extent registry, and the arena registry; every other API takes this
/// handle (or a value derived from it) rather than reaching for global
/// state, so more than one instance can coexist in a test process.
pub struct Context {
    device_table: Arc<DeviceTable>,
    registry: Arc<ExtentRegistry>,
    arenas: DashMap<u32, Arc<Arena>>,
    next_arena_id: AtomicU32,
    config: Config,
    default_arena_id: AtomicU32,
}

impl Context {
    /// Enumerate devices (falling back to one DRAM-tagged device per NUMA
    /// node when no layout file collaborator has supplied a table), read
    /// the `SH_*` environment, and create the default arena.
    pub fn init() -> Result<Arc<Self>> {
        Self::init_with_devices(DeviceTable::from_numa_nodes()?)
    }

    /// Like [`Self::init`], but takes an externally supplied device table
    /// (the primary path: a topology collaborator parsing
    /// `SICM_LAYOUT_FILE`/`SH_GRAPH_FILE`).
    pub fn init_with_devices(device_table: DeviceTable) -> Result<Arc<Self>> {
        let config = Config::from_env()?;
        device_table.get(config.default_device)?;

        let ctx = Arc::new(Self {
            device_table: Arc::new(device_table),
            registry: Arc::new(ExtentRegistry::new()),
            arenas: DashMap::new(),
            next_arena_id: AtomicU32::new(0),
            config,
            default_arena_id: AtomicU32::new(0),
        });

        let default_device = ctx.config.default_device;
        let default_arena = ctx.arena_create(0, ArenaFlags::empty(), &[default_device])?;
        ctx.default_arena_id.store(default_arena, Ordering::SeqCst);

        tracing::info!(
            devices = ctx.device_table.len(),
            default_arena,
            "sicm context initialized"
        );
        Ok(ctx)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device_table(&self) -> &Arc<DeviceTable> {
        &self.device_table
    }

    pub fn registry(&self) -> &Arc<ExtentRegistry> {
        &self.registry
    }

    pub fn default_arena_id(&self) -> u32 {
        self.default_arena_id.load(Ordering::SeqCst)
    }

    pub fn arena_create(
        &self,
        max_size: usize,
        flags: ArenaFlags,
        devices: &[usize],
    ) -> Result<u32> {
        self.arena_create_with_shared_fd(max_size, flags, devices, None)
    }

    /// Like [`Self::arena_create`], but a `SHARED` arena attaches to the
    /// file at `path` (opened, or created if it doesn't exist yet)
    /// instead of a fresh anonymous mapping. A second `Context` pointed
    /// at the same `path` — in this process or another — observes the
    /// same bytes at the same offsets, per spec §6's "Persisted state".
    pub fn arena_create_shared_at(
        &self,
        path: &std::path::Path,
        max_size: usize,
        devices: &[usize],
    ) -> Result<u32> {
        let fd = crate::shared_mapping::open_at(path).map_err(SicmError::OsMappingFailed)?;
        self.arena_create_with_shared_fd(max_size, ArenaFlags::SHARED, devices, Some(fd))
    }

    fn arena_create_with_shared_fd(
        &self,
        max_size: usize,
        flags: ArenaFlags,
        devices: &[usize],
        shared_fd: Option<std::os::unix::io::RawFd>,
    ) -> Result<u32> {
        let initial_device = *devices
            .first()
            .ok_or_else(|| SicmError::InvalidConfig("arena_create requires at least one device".into()))?;
        let id = self.next_arena_id.fetch_add(1, Ordering::SeqCst);
        let arena = Arc::new(Arena::with_shared_fd(
            id,
            self.device_table.clone(),
            self.registry.clone(),
            initial_device,
            max_size,
            flags,
            shared_fd,
        )?);
        if devices.len() > 1 {
            arena.set_devices(devices)?;
        }
        self.arenas.insert(id, arena);
        Ok(id)
    }

    pub fn arena(&self, id: u32) -> Result<Arc<Arena>> {
        self.arenas
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(SicmError::InvalidDevice(id as usize))
    }

    /// Release every range owned by the arena and drop it from the
    /// registry of live arenas. Ranges already torn down (e.g. by an
    /// explicit `free` of every allocation) leave nothing further to do.
    pub fn arena_destroy(&self, id: u32) -> Result<()> {
        let arena = self.arena(id)?;
        arena.destroy()?;
        self.arenas.remove(&id);
        Ok(())
    }

    pub fn lookup(&self, addr: usize) -> Option<u32> {
        self.registry.find_containing(addr)
    }

    pub fn arena_ids(&self) -> Vec<u32> {
        self.arenas.iter().map(|e| *e.key()).collect()
    }

    pub fn fini(&self) {
        tracing::info!("sicm context shutting down");
    }
}
