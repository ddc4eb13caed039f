//! Kernel panic path.
//!
//! A panic dumps to the serial console and the ring log, halts every other
//! CPU with a broadcast NMI, paints the primary display red, and parks the
//! CPU with interrupts off. Invariant violations elsewhere in the kernel
//! funnel here via `panic!`.

use core::sync::atomic::{AtomicBool, Ordering};

use delta_core::sync::SpinLock;
use deltaboot::FramebufferInfo;

use crate::arch::x86_64::{apic, instructions};
use crate::mm::hhdm;

/// Set by the first panicking CPU; the NMI handler checks it to halt.
static PANIC_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

/// Framebuffer recorded at boot for the diagnostic screen.
static FRAMEBUFFER: SpinLock<Option<FramebufferInfo>> = SpinLock::new(None);

/// Records the boot framebuffer for the panic screen.
pub fn set_framebuffer(fb: FramebufferInfo) {
    *FRAMEBUFFER.lock() = Some(fb);
}

/// Whether a panic is in progress (checked from the NMI handler).
pub fn panic_in_progress() -> bool {
    PANIC_IN_PROGRESS.load(Ordering::SeqCst)
}

/// Paints the recorded framebuffer solid red.
fn red_screen() {
    let Some(fb) = FRAMEBUFFER.try_lock().and_then(|guard| *guard) else {
        return;
    };
    let red: u32 = 0xFFu32 << fb.red_shift;
    let base = hhdm::phys_to_virt(fb.address).as_mut_ptr::<u8>();
    for row in 0..fb.height {
        // SAFETY: The framebuffer was mapped by the bootloader and the
        // pitch bounds every row.
        unsafe {
            let line = base.add((row * fb.pitch) as usize) as *mut u32;
            for col in 0..fb.width {
                line.add(col as usize).write_volatile(red);
            }
        }
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    instructions::disable_interrupts();

    if PANIC_IN_PROGRESS.swap(true, Ordering::SeqCst) {
        // Another CPU got here first; just stop.
        instructions::halt_forever();
    }

    // Serial first (lock-free), then the ring log for post-mortem reads.
    crate::log::panic_serial(info);
    crate::obj::klog::KLOG.write_bytes(b"\n!!! KERNEL PANIC !!!\n");

    // Stop the other CPUs before touching shared state any further.
    apic::broadcast_nmi();

    red_screen();

    instructions::halt_forever();
}
