//! The system introspection object, registered at `$devices/system`.
//!
//! Serves the handle-wide `object_get_info` topics that are not tied to a
//! particular process or thread: kernel memory statistics, time, and the
//! system description.

use alloc::sync::Arc;
use core::any::Any;

use delta_syscall::{Error, InfoTopic, KmemStats, SystemStats, TimeStats, copy_name};

use super::{KernelObject, ObjectType, write_info_struct};
use crate::mm::{heap, pmm};
use crate::time;

/// Name reported in `SYSTEM_STATS`.
const OS_NAME: &str = "DeltaOS";

/// Version reported in `SYSTEM_STATS`.
const OS_VERSION: &str = "0.1.0";

/// The `$devices/system` object.
pub struct SystemObject;

impl SystemObject {
    /// Creates the object; the boot path registers it in the namespace.
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }

    fn kmem_stats() -> KmemStats {
        let (total, free) = pmm::with_pmm(|pmm| (pmm.total_frames(), pmm.free_frames()));
        let heap = heap::stats();
        KmemStats {
            total_ram: total as u64 * 4096,
            free_ram: free as u64 * 4096,
            used_ram: (total - free) as u64 * 4096,
            heap_used: heap.slab_used + heap.large_used,
            heap_free: heap.slab_capacity.saturating_sub(heap.slab_used),
        }
    }

    fn time_stats() -> TimeStats {
        TimeStats {
            uptime_ns: time::boot_nanos(),
            ticks: time::ticks(),
            wall_time: time::wall_time(),
            _pad: 0,
        }
    }

    fn system_stats() -> SystemStats {
        let mut stats = SystemStats {
            cpu_count: crate::percpu::cpu_count(),
            ..SystemStats::default()
        };
        copy_name(&mut stats.os_name, OS_NAME);
        copy_name(&mut stats.os_version, OS_VERSION);
        copy_name(&mut stats.arch, "x86_64");
        fill_cpu_identity(&mut stats);
        stats
    }
}

impl KernelObject for SystemObject {
    fn obj_type(&self) -> ObjectType {
        ObjectType::System
    }

    fn get_info(&self, topic: InfoTopic, buf: &mut [u8]) -> Result<usize, Error> {
        match topic {
            InfoTopic::KmemStats => write_info_struct(buf, &Self::kmem_stats()),
            InfoTopic::TimeStats => write_info_struct(buf, &Self::time_stats()),
            InfoTopic::SystemStats => write_info_struct(buf, &Self::system_stats()),
            _ => Err(Error::Unsupported),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(target_arch = "x86_64")]
fn fill_cpu_identity(stats: &mut SystemStats) {
    let cpuid = raw_cpuid::CpuId::new();
    if let Some(vendor) = cpuid.get_vendor_info() {
        copy_name(&mut stats.cpu_vendor, vendor.as_str());
    }
    if let Some(brand) = cpuid.get_processor_brand_string() {
        copy_name(&mut stats.cpu_brand, brand.as_str());
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn fill_cpu_identity(_stats: &mut SystemStats) {}
