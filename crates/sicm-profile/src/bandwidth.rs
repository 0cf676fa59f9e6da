//! Per-socket memory-controller bandwidth estimation, and distribution of
//! that socket-level estimate across arenas by each arena's share of this
//! interval's access samples.

use std::collections::HashMap;
use std::time::Instant;

use crate::sample::{PerfEventAttr, PerfRing};

/// One open IMC (integrated memory controller) counter. Bandwidth
/// counters are read-only free-running counters, not sampling events, so
/// unlike [`crate::sample::PerfRing`] this doesn't mmap a ring buffer.
pub struct BandwidthCounter {
    fd: i32,
}

impl BandwidthCounter {
    /// `raw` selects `PERF_TYPE_RAW` for a PMU-specific IMC event code;
    /// pass `false` only if `config` is one of the portable
    /// `PERF_COUNT_HW_*` generic counters, which IMC/uncore events never
    /// are in practice — callers resolving event names should pick
    /// whichever `resolve_one_event` in `sicm::runtime` reports.
    #[cfg(target_os = "linux")]
    pub fn open(config: u64, raw: bool, cpu: i32) -> std::io::Result<Self> {
        let attr = PerfEventAttr::sampling(config, raw, 0);
        // Bandwidth counters are read, not sampled: period 0 disables
        // overflow sampling while still letting us `read()` the count.
        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &attr as *const PerfEventAttr,
                -1i32,
                cpu as libc::c_int,
                -1i32,
                0u64,
            )
        };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { fd: fd as i32 })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open(_config: u64, _raw: bool, _cpu: i32) -> std::io::Result<Self> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "bandwidth counters are only implemented on Linux",
        ))
    }

    pub fn read_count(&self) -> std::io::Result<u64> {
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
        if n != 8 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(u64::from_ne_bytes(buf))
    }
}

impl Drop for BandwidthCounter {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Tracks the previous reading of every `(socket, imc)` counter so each
/// interval's delta can be turned into a rate.
pub struct BandwidthEstimator {
    counters: Vec<(u32, BandwidthCounter)>,
    prev_reading: HashMap<usize, u64>,
    prev_time: Instant,
    bytes_per_cacheline: u64,
}

impl BandwidthEstimator {
    pub fn new(counters: Vec<(u32, BandwidthCounter)>, bytes_per_cacheline: u64) -> Self {
        Self {
            counters,
            prev_reading: HashMap::new(),
            prev_time: Instant::now(),
            bytes_per_cacheline,
        }
    }

    /// Per-socket bytes-per-second for this interval, keyed by socket id.
    pub fn sample_interval(&mut self) -> HashMap<u32, f64> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.prev_time).as_secs_f64().max(1e-6);
        self.prev_time = now;

        let mut per_socket_lines: HashMap<u32, u64> = HashMap::new();
        for (idx, (socket, counter)) in self.counters.iter().enumerate() {
            let reading = counter.read_count().unwrap_or(0);
            let prev = *self.prev_reading.get(&idx).unwrap_or(&reading);
            let delta = reading.saturating_sub(prev);
            self.prev_reading.insert(idx, reading);
            *per_socket_lines.entry(*socket).or_insert(0) += delta;
        }

        per_socket_lines
            .into_iter()
            .map(|(socket, lines)| {
                let bytes = lines * self.bytes_per_cacheline;
                (socket, bytes as f64 / elapsed)
            })
            .collect()
    }
}

/// Spread a socket's aggregate bytes-per-second across arenas in
/// proportion to each arena's share of this interval's total access
/// samples (summed across events), per arena id.
pub fn distribute_bandwidth(
    socket_bandwidth: f64,
    arena_accesses: &HashMap<u32, Vec<u64>>,
) -> HashMap<u32, f64> {
    let total: u64 = arena_accesses.values().map(|v| v.iter().sum::<u64>()).sum();
    if total == 0 {
        return HashMap::new();
    }
    arena_accesses
        .iter()
        .map(|(&id, counts)| {
            let share = counts.iter().sum::<u64>() as f64 / total as f64;
            (id, socket_bandwidth * share)
        })
        .collect()
}

