use std::fs;

use crate::error::{Result, SicmError};

/// A memory tier's class, used for tier labelling and the `SH_*_DEVICE`
/// index resolution. Mirrors `sicm_device_tag` in the original low-level
/// interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Dram,
    Hbm,
    KnlHbm,
    PersistentNvm,
    DeviceAttached,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Dram => "DRAM",
            Tier::Hbm => "HBM",
            Tier::KnlHbm => "KNL_HBM",
            Tier::PersistentNvm => "PERSISTENT_NVM",
            Tier::DeviceAttached => "DEVICE_ATTACHED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DRAM" => Some(Tier::Dram),
            "HBM" => Some(Tier::Hbm),
            "KNL_HBM" => Some(Tier::KnlHbm),
            "PERSISTENT_NVM" | "NVM" | "AEP" => Some(Tier::PersistentNvm),
            "DEVICE_ATTACHED" => Some(Tier::DeviceAttached),
            _ => None,
        }
    }
}

/// Tier-specific data the core otherwise treats as opaque. The only field
/// implementations care about today is capacity, used by the placement
/// engine's hotset budget.
#[derive(Debug, Clone, Default)]
pub struct TierData {
    /// Advertised capacity in bytes, 0 if unknown/unconstrained.
    pub capacity_bytes: u64,
}

/// Immutable-after-enumeration description of one memory tier.
#[derive(Debug, Clone)]
pub struct Device {
    pub tag: Tier,
    /// NUMA node, or -1 if the tier has no single node (e.g. interleaved).
    pub numa_node: i32,
    pub page_size_kib: u32,
    pub tier_data: TierData,
}

impl Device {
    pub fn page_size(&self) -> usize {
        self.page_size_kib as usize * 1024
    }
}

/// Process-wide, immutable-after-`init` enumeration of tiers.
///
/// Ordinarily populated by the external topology collaborator (the
/// graph/YAML layout parser reading `SICM_LAYOUT_FILE`/`SH_GRAPH_FILE`) and
/// handed to [`crate::Context::init`]. [`DeviceTable::from_numa_nodes`] is a
/// fallback for when no layout file is configured.
#[derive(Debug, Clone)]
pub struct DeviceTable {
    devices: Vec<Device>,
}

impl DeviceTable {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    /// Single-tier fallback: treat every NUMA node reported under
    /// `/sys/devices/system/node` as a DRAM-tagged device. Good enough to
    /// boot on a machine with no layout file configured; real tier
    /// labelling (HBM/NVM/device-attached) is the external collaborator's
    /// job.
    pub fn from_numa_nodes() -> Result<Self> {
        let mut devices = Vec::new();
        let entries = match fs::read_dir("/sys/devices/system/node") {
            Ok(e) => e,
            Err(_) => {
                // No NUMA sysfs (non-Linux, or sandboxed): present a single
                // default-policy device so callers still have something to bind to.
                return Ok(Self {
                    devices: vec![Device {
                        tag: Tier::Dram,
                        numa_node: -1,
                        page_size_kib: 4,
                        tier_data: TierData::default(),
                    }],
                });
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("node") {
                if let Ok(node) = rest.parse::<i32>() {
                    devices.push(Device {
                        tag: Tier::Dram,
                        numa_node: node,
                        page_size_kib: 4,
                        tier_data: TierData::default(),
                    });
                }
            }
        }
        devices.sort_by_key(|d| d.numa_node);
        if devices.is_empty() {
            return Err(SicmError::InvalidConfig(
                "no NUMA nodes discovered under /sys/devices/system/node".into(),
            ));
        }
        Ok(Self { devices })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn get(&self, index: usize) -> Result<&Device> {
        self.devices.get(index).ok_or(SicmError::InvalidDevice(index))
    }

    pub fn page_size(&self, index: usize) -> Result<usize> {
        self.get(index).map(|d| d.page_size())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
