//! `perf_event_open`-backed ring buffer reading. The `perf_event_attr` and
//! `perf_event_mmap_page` layouts are fixed kernel ABI (size-versioned, not
//! subject to library recompilation), so hand-binding them is safe in a
//! way that binding an allocator's own extent-hook ABI would not be.

use std::io;

/// One observed memory reference, as decoded from a `PERF_RECORD_SAMPLE`
/// entry carrying `PERF_SAMPLE_TID | PERF_SAMPLE_ADDR`.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub tid: u32,
    pub addr: usize,
}

const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_TYPE_RAW: u32 = 4;
const PERF_SAMPLE_TID: u64 = 1 << 1;
const PERF_SAMPLE_ADDR: u64 = 1 << 3;
const PERF_RECORD_SAMPLE: u32 = 9;

/// Mirrors `struct perf_event_attr` from `linux/perf_event.h` far enough
/// to describe a precise-IP PEBS-style sampling event. Trailing kernel
/// fields beyond `sample_id_all`/`exclude_*` are left zeroed, which the
/// kernel accepts given a correctly reported `size`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub config1_or_bp_addr: u64,
    pub config2_or_bp_len: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
}

impl Default for PerfEventAttr {
    fn default() -> Self {
        // Safety: an all-zero perf_event_attr is a well-defined, inert value.
        unsafe { std::mem::zeroed() }
    }
}

/// flags bit for `disabled`; kept as a named constant rather than a magic
/// shift at the call site.
const FLAG_DISABLED: u64 = 1 << 0;
const FLAG_EXCLUDE_KERNEL: u64 = 1 << 8;
const FLAG_EXCLUDE_HV: u64 = 1 << 9;
const FLAG_PRECISE_IP_SHIFT: u64 = 15;
const FLAG_TASK: u64 = 1 << 4;
const FLAG_MMAP: u64 = 1 << 10;

impl PerfEventAttr {
    /// Build an attr requesting `{tid, addr}` samples every `period`
    /// occurrences of a raw or hardware-generic `config` event.
    pub fn sampling(config: u64, raw: bool, period: u64) -> Self {
        let mut attr = Self {
            type_: if raw { PERF_TYPE_RAW } else { PERF_TYPE_HARDWARE },
            size: std::mem::size_of::<Self>() as u32,
            config,
            sample_period_or_freq: period,
            sample_type: PERF_SAMPLE_TID | PERF_SAMPLE_ADDR,
            ..Self::default()
        };
        attr.flags = FLAG_DISABLED
            | FLAG_EXCLUDE_KERNEL
            | FLAG_EXCLUDE_HV
            | FLAG_TASK
            | (2u64 << FLAG_PRECISE_IP_SHIFT);
        attr.flags &= !FLAG_MMAP;
        attr
    }
}

/// Mirrors the fixed header of `struct perf_event_mmap_page`: the fields
/// needed to locate and bound the ring buffer's data region.
#[repr(C)]
struct MmapPageHeader {
    version: u32,
    compat_version: u32,
    lock: u32,
    index: u32,
    offset: i64,
    time_enabled: u64,
    time_running: u64,
    __reserved: [u64; 13],
    data_head: u64,
    data_tail: u64,
    data_offset: u64,
    data_size: u64,
}

#[repr(C)]
struct PerfEventHeader {
    type_: u32,
    misc: u16,
    size: u16,
}

/// An opened perf-event counter with its mmap'd ring buffer. Exactly one
/// of these exists per `(cpu, event)` pair the sampler is configured for.
pub struct PerfRing {
    fd: i32,
    base: *mut u8,
    mmap_len: usize,
    page_size: usize,
}

unsafe impl Send for PerfRing {}

impl PerfRing {
    #[cfg(target_os = "linux")]
    pub fn open(attr: &PerfEventAttr, pid: i32, cpu: i32, max_sample_pages: u32) -> io::Result<Self> {
        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                attr as *const PerfEventAttr,
                pid as libc::pid_t,
                cpu as libc::c_int,
                -1i32,
                0u64,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = fd as i32;

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let mmap_len = page_size + page_size * max_sample_pages as usize;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            unsafe { libc::close(fd) };
            return Err(io::Error::last_os_error());
        }

        unsafe {
            libc::ioctl(fd, request_reset() as libc::c_ulong);
            libc::ioctl(fd, request_enable() as libc::c_ulong);
        }

        Ok(Self {
            fd,
            base: base as *mut u8,
            mmap_len,
            page_size,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open(_attr: &PerfEventAttr, _pid: i32, _cpu: i32, _max_sample_pages: u32) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "perf_event sampling is only implemented on Linux",
        ))
    }

    fn header(&self) -> &MmapPageHeader {
        unsafe { &*(self.base as *const MmapPageHeader) }
    }

    pub fn data_head(&self) -> u64 {
        self.header().data_head
    }

    /// Decode every complete `PERF_RECORD_SAMPLE` record between the last
    /// consumed tail and the current head, calling `f` for each one, then
    /// advance the kernel-visible tail. Unknown record types are skipped.
    pub fn drain(&self, prev_tail: u64, mut f: impl FnMut(Sample)) -> u64 {
        let header = self.header();
        let head = header.data_head;
        let data_base = unsafe { self.base.add(header.data_offset as usize) };
        let data_size = header.data_size;
        if data_size == 0 {
            return head;
        }

        let mut pos = prev_tail;
        while pos < head {
            let offset = (pos % data_size) as usize;
            let rec_header = unsafe { &*(data_base.add(offset) as *const PerfEventHeader) };
            let rec_size = rec_header.size as u64;
            if rec_size == 0 {
                break;
            }
            if rec_header.type_ == PERF_RECORD_SAMPLE {
                // Body layout after the header, given PERF_SAMPLE_TID |
                // PERF_SAMPLE_ADDR: { pid: u32, tid: u32, addr: u64 }.
                let body_off = offset + std::mem::size_of::<PerfEventHeader>();
                let tid_ptr = unsafe { data_base.add((body_off + 4) % data_size as usize) as *const u32 };
                let addr_ptr = unsafe { data_base.add((body_off + 8) % data_size as usize) as *const u64 };
                let tid = unsafe { tid_ptr.read_unaligned() };
                let addr = unsafe { addr_ptr.read_unaligned() };
                f(Sample { tid, addr: addr as usize });
            }
            pos += rec_size;
        }

        unsafe {
            let header_mut = &mut *(self.base as *mut MmapPageHeader);
            std::ptr::write_volatile(&mut header_mut.data_tail, head);
        }
        head
    }
}

impl Drop for PerfRing {
    fn drop(&mut self) {
        unsafe {
            libc::ioctl(self.fd, request_disable() as libc::c_ulong);
            libc::munmap(self.base as *mut libc::c_void, self.mmap_len);
            libc::close(self.fd);
        }
    }
}

#[cfg(target_os = "linux")]
fn request_enable() -> u64 {
    // PERF_EVENT_IOC_ENABLE, encoded the same way perf_event.h's _IO(...) macro does.
    const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
    PERF_EVENT_IOC_ENABLE
}
#[cfg(target_os = "linux")]
fn request_disable() -> u64 {
    const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;
    PERF_EVENT_IOC_DISABLE
}
#[cfg(target_os = "linux")]
fn request_reset() -> u64 {
    const PERF_EVENT_IOC_RESET: u64 = 0x2403;
    PERF_EVENT_IOC_RESET
}
