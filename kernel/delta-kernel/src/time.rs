//! Tick counting and boot-relative time.
//!
//! The timer interrupt calls [`on_tick`] once per tick on the BSP. Uptime is
//! derived from the tick count and the configured tick rate; wall time adds
//! the boot-time seconds reported by the bootloader.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Timer tick rate in Hz.
pub const TICK_HZ: u64 = 1000;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Wall-clock seconds since 2000-01-01 at boot, from the boot-info blob.
static BOOT_TIME: AtomicU32 = AtomicU32::new(0);

/// Records one timer tick. Called from the BSP timer interrupt.
#[inline]
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Timer ticks since boot.
#[inline]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Nanoseconds since boot, derived from the tick count.
#[inline]
pub fn boot_nanos() -> u64 {
    ticks() * (1_000_000_000 / TICK_HZ)
}

/// Stores the bootloader-reported wall-clock time.
pub fn set_boot_time(secs_since_2000: u32) {
    BOOT_TIME.store(secs_since_2000, Ordering::Relaxed);
}

/// Wall-clock seconds since 2000-01-01.
pub fn wall_time() -> u32 {
    BOOT_TIME.load(Ordering::Relaxed) + (ticks() / TICK_HZ) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nanos_follow_ticks() {
        let before = ticks();
        let nanos_before = boot_nanos();
        on_tick();
        on_tick();
        assert!(ticks() >= before + 2);
        assert!(boot_nanos() >= nanos_before + 2_000_000);
    }
}
