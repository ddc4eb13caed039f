//! Object introspection topics and their `#[repr(C)]` result structures.

/// Topic selector for `object_get_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InfoTopic {
    /// No topic; always fails.
    None = 0,
    /// Basic process information ([`ProcessBasicInfo`]).
    ProcessBasic = 1,
    /// Thread statistics ([`ThreadStats`]).
    ThreadStats = 2,
    /// Kernel memory statistics ([`KmemStats`]), system handle required.
    KmemStats = 3,
    /// Time statistics ([`TimeStats`]), system handle required.
    TimeStats = 4,
    /// System statistics ([`SystemStats`]), system handle required.
    SystemStats = 5,
}

impl InfoTopic {
    /// Decodes a raw topic value from the syscall ABI.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::ProcessBasic,
            2 => Self::ThreadStats,
            3 => Self::KmemStats,
            4 => Self::TimeStats,
            5 => Self::SystemStats,
            _ => return None,
        })
    }
}

/// Result of the `ProcessBasic` topic.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ProcessBasicInfo {
    /// Process id.
    pub pid: u32,
    /// Parent process id.
    pub parent_pid: u32,
    /// NUL-terminated process name.
    pub name: [u8; 32],
    /// Process state discriminant.
    pub status: u32,
    /// Padding for alignment.
    pub _pad: u32,
    /// Resident memory in bytes.
    pub memory_usage: u64,
}

/// Result of the `ThreadStats` topic.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ThreadStats {
    /// Thread id.
    pub tid: u32,
    /// Thread state discriminant.
    pub state: u32,
    /// Accumulated CPU time in nanoseconds.
    pub cpu_time_ns: u64,
    /// Scheduling priority.
    pub priority: u32,
    /// Padding for alignment.
    pub _pad: u32,
}

/// Result of the `KmemStats` topic.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct KmemStats {
    /// Total physical memory in bytes.
    pub total_ram: u64,
    /// Free physical memory in bytes.
    pub free_ram: u64,
    /// Used physical memory in bytes.
    pub used_ram: u64,
    /// Bytes currently handed out by the kernel heap.
    pub heap_used: u64,
    /// Bytes of heap capacity not currently handed out.
    pub heap_free: u64,
}

/// Result of the `TimeStats` topic.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TimeStats {
    /// Nanoseconds since boot.
    pub uptime_ns: u64,
    /// Timer ticks since boot.
    pub ticks: u64,
    /// Wall-clock seconds since 2000-01-01.
    pub wall_time: u32,
    /// Padding for alignment.
    pub _pad: u32,
}

/// Result of the `SystemStats` topic.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SystemStats {
    /// Number of online CPUs.
    pub cpu_count: u32,
    /// Padding for alignment.
    pub _pad: u32,
    /// NUL-terminated OS name.
    pub os_name: [u8; 32],
    /// NUL-terminated OS version.
    pub os_version: [u8; 16],
    /// NUL-terminated architecture name.
    pub arch: [u8; 16],
    /// NUL-terminated CPU vendor string.
    pub cpu_vendor: [u8; 16],
    /// NUL-terminated CPU brand string.
    pub cpu_brand: [u8; 48],
}

impl Default for SystemStats {
    fn default() -> Self {
        Self {
            cpu_count: 0,
            _pad: 0,
            os_name: [0; 32],
            os_version: [0; 16],
            arch: [0; 16],
            cpu_vendor: [0; 16],
            cpu_brand: [0; 48],
        }
    }
}

/// Out-parameter of `channel_recv_with_handles`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ChannelRecvResult {
    /// Bytes of message data received.
    pub data_len: u64,
    /// Number of handles granted to the receiver.
    pub handle_count: u32,
    /// Pid of the sending process (0 for the kernel).
    pub sender_pid: u32,
}

/// Copies a string into a fixed NUL-terminated byte field.
pub fn copy_name(dst: &mut [u8], src: &str) {
    let n = src.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
    dst[n] = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_round_trip() {
        for raw in 0..=5 {
            let topic = InfoTopic::from_raw(raw).unwrap();
            assert_eq!(topic as u32, raw);
        }
        assert!(InfoTopic::from_raw(6).is_none());
    }

    #[test]
    fn copy_name_terminates() {
        let mut buf = [0xFFu8; 8];
        copy_name(&mut buf, "DeltaOS!!!");
        assert_eq!(&buf[..7], b"DeltaOS");
        assert_eq!(buf[7], 0);
    }
}
