//! Kernel initialization.
//!
//! The boot stub hands over one physical address: the boot-info blob. From
//! there the order is fixed: CPU state, boot-info parse, PMM, VMM, heap,
//! full logger, objects and namespace, processes, scheduler, the LAPIC
//! timer, the other CPUs, and finally the first user process.

use delta_core::addr::PhysAddr;
use delta_core::{kerr, kinfo};
use deltaboot::BootInfo;

use crate::mm::{heap, hhdm, pmm, vmm};
use crate::obj::ns;

/// Fixed higher-half direct-map offset set up by the bootloader.
pub const HHDM_OFFSET: u64 = 0xFFFF_8000_0000_0000;

/// Largest boot-info blob the kernel will accept.
const BOOT_INFO_MAX: usize = 64 * 1024;

/// Kernel entry point, called by the boot stub with the physical address
/// of the boot-info blob.
///
/// # Safety
///
/// Must be the first kernel code to run: paging from the bootloader active
/// with the HHDM at [`HHDM_OFFSET`], interrupts disabled, `blob_phys`
/// pointing at a valid boot-info blob.
pub unsafe fn kernel_init(blob_phys: u64) -> ! {
    // 1. CPU tables, per-CPU data, syscall MSRs (interrupts stay off).
    crate::arch::cpu_init();

    // 2. Early serial logging.
    crate::log::init_early_serial();
    kinfo!("DeltaOS kernel booting");

    // 3. HHDM conversions.
    hhdm::init(HHDM_OFFSET);

    // 4. Decode the boot-info blob through the direct map.
    let blob_phys = PhysAddr::new(blob_phys);
    // SAFETY: The boot stub guarantees the blob; its size field is
    // validated against a sane cap by the parser bounds checks.
    let blob = unsafe {
        core::slice::from_raw_parts(hhdm::phys_to_virt(blob_phys).as_ptr::<u8>(), BOOT_INFO_MAX)
    };
    let boot_info = match BootInfo::parse(blob, blob_phys) {
        Ok(info) => info,
        Err(e) => panic!("boot-info blob rejected: {e:?}"),
    };
    if let Some(cmdline) = boot_info.cmdline() {
        kinfo!("cmdline: {}", cmdline);
    }
    if let Some(time) = boot_info.boot_time {
        crate::time::set_boot_time(time);
    }
    if let Some(fb) = boot_info.framebuffer {
        crate::panic::set_framebuffer(fb);
    }

    // 5. Physical memory. Reserve the kernel image, the blob, and the
    //    initrd on top of the map. No heap yet, so both lists live on the
    //    stack.
    let mut regions = [pmm::PhysRegion {
        base: PhysAddr::zero(),
        length: 0,
        usable: false,
    }; deltaboot::MAX_MEMORY_REGIONS];
    let mut region_count = 0;
    for r in boot_info.memory_map.iter() {
        regions[region_count] = pmm::PhysRegion {
            base: r.base,
            length: r.length,
            usable: r.kind == deltaboot::MemoryRegionKind::Usable,
        };
        region_count += 1;
    }

    let mut reserved = [(PhysAddr::zero(), 0u64); 4];
    let mut reserved_count = 0;
    // Low memory stays reserved: the SMP trampoline page lives there.
    reserved[reserved_count] = (PhysAddr::zero(), 0x10_0000);
    reserved_count += 1;
    reserved[reserved_count] = (blob_phys, boot_info.total_size as u64);
    reserved_count += 1;
    if let Some(kernel) = boot_info.kernel_phys {
        reserved[reserved_count] = (kernel.base, kernel.length);
        reserved_count += 1;
    }
    if let Some(initrd) = boot_info.initrd {
        reserved[reserved_count] = (initrd.start, initrd.length);
        reserved_count += 1;
    }

    // SAFETY: The memory map comes from the bootloader and the HHDM covers
    // all of physical memory.
    let bitmap = unsafe {
        pmm::FrameBitmap::new(
            &regions[..region_count],
            &reserved[..reserved_count],
            HHDM_OFFSET,
        )
    }
    .expect("PMM: no usable memory");
    kinfo!(
        "PMM: {} MiB free / {} MiB total",
        bitmap.free_frames() * 4 / 1024,
        bitmap.total_frames() * 4 / 1024
    );
    pmm::init(bitmap);

    // 6. Kernel pagemap wrapper over the boot page tables.
    vmm::init(
        PhysAddr::new(crate::arch::x86_64::instructions::read_cr3()),
        HHDM_OFFSET,
    );

    // 7. Heap over the VMM-backed window.
    heap::init_kernel_heap();
    kinfo!("heap: slab allocator online");

    // 8. Full logger (serial + ring log).
    crate::log::init_logger();

    // 9. Objects and namespace.
    ns::init();
    ns::register("$kernel", ns::NsDir::new("$kernel/")).expect("namespace root");
    ns::register("$devices", ns::NsDir::new("$devices/")).expect("namespace root");
    ns::register("$gui", ns::NsDir::new("$gui/")).expect("namespace root");
    ns::register("$kernel/log", crate::obj::klog::KlogObject::new()).expect("klog object");
    ns::register("$devices/system", crate::obj::info::SystemObject::new())
        .expect("system object");

    // 10. Kernel process and this CPU's scheduler.
    crate::proc::init();
    crate::sched::init_cpu();

    // 11. Local APIC + timer, then the other CPUs.
    crate::arch::x86_64::apic::init();
    crate::arch::x86_64::apic::start_timer();
    crate::arch::x86_64::smp::boot_aps(&boot_info);

    // 12. First kernel thread: hands off to userspace once the filesystem
    //     service has registered $files.
    let kernel = crate::proc::kernel_process();
    let init_thread = crate::proc::thread::Thread::create(&kernel, spawn_init, 0);
    crate::sched::add(init_thread);

    kinfo!("entering scheduler");
    crate::sched::start()
}

/// First scheduled thread: launch `/bin/init` and reap it forever.
fn spawn_init(_arg: usize) {
    match crate::proc::exec::spawn("/bin/init", &["/bin/init"]) {
        Ok(pid) => {
            kinfo!("spawned init (pid {})", pid);
            match crate::proc::exec::wait(pid) {
                Ok(code) => kerr!("init exited with status {}", code),
                Err(e) => kerr!("waiting for init failed: {:?}", e),
            }
        }
        Err(e) => {
            kerr!("failed to spawn /bin/init: {:?}", e);
        }
    }
    // Nothing left to hand off to; keep the CPU available.
    loop {
        crate::sched::yield_now();
    }
}
