//! ELF loading and initial userspace handoff.
//!
//! `spawn` opens an executable through the namespace, validates it as
//! ELF64, builds a suspended user process, maps the LOAD segments (and the
//! dynamic interpreter when one is requested), lays out the initial stack
//! with argc/argv and the aux vector, and schedules the first user thread.
//! The stack bytes are written through the direct map while the user
//! pagemap is not yet active.

use alloc::vec;
use alloc::vec::Vec;

use delta_core::addr::PAGE_SIZE;
use delta_syscall::{
    AT_BASE, AT_ENTRY, AT_NULL, AT_PAGESZ, AT_PHDR, AT_PHENT, AT_PHNUM, AT_RANDOM, AuxvEntry,
};

#[cfg(target_os = "none")]
use alloc::sync::Arc;
#[cfg(target_os = "none")]
use delta_core::addr::VirtAddr;
#[cfg(target_os = "none")]
use delta_syscall::{Error, Rights, SPAWN_MAX_FILE_SIZE};

#[cfg(target_os = "none")]
use crate::obj::ns;
#[cfg(target_os = "none")]
use crate::proc::Process;

/// Top of the initial user stack, just below the non-canonical hole.
pub const USER_STACK_TOP: u64 = 0x7FFF_FFFF_F000;

/// Initial user stack size: two pages.
pub const USER_STACK_PAGES: usize = 2;

/// Load base for position-independent executables.
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
const PIE_LOAD_BASE: u64 = 0x5555_0000_0000;

/// Load base for the dynamic interpreter.
const INTERP_LOAD_BASE: u64 = 0x7000_0000_0000;

/// Maximum argv entries copied to the child.
const ARGV_MAX: usize = 64;

/// Aux vector inputs for the stack builder.
pub struct AuxInfo {
    /// User virtual address of the program headers.
    pub phdr_addr: u64,
    /// Size of one program header entry.
    pub phent: u64,
    /// Number of program headers.
    pub phnum: u64,
    /// Program entry point (the executable's own, even when an interpreter
    /// runs first).
    pub entry: u64,
    /// Interpreter load base, when the executable requested one.
    pub interp_base: Option<u64>,
}

/// Builds the initial user stack image.
///
/// `window` is the kernel-visible backing of the stack's top pages;
/// `stack_top` is the user virtual address one past the highest byte of
/// `window`. Writes argv strings, a 16-byte random seed, the aux vector,
/// the envp and argv pointer arrays, and argc. Returns the initial user
/// stack pointer.
pub fn build_user_stack(
    window: &mut [u8],
    stack_top: u64,
    argv: &[&str],
    aux: &AuxInfo,
) -> u64 {
    let window_base = stack_top - window.len() as u64;
    let mut sp = stack_top;

    let mut write_bytes = |sp: u64, bytes: &[u8]| {
        let off = (sp - window_base) as usize;
        window[off..off + bytes.len()].copy_from_slice(bytes);
    };

    // Argv strings at the very top, highest index first.
    let argc = argv.len().min(ARGV_MAX);
    let mut argv_addrs = [0u64; ARGV_MAX];
    for i in (0..argc).rev() {
        let bytes = argv[i].as_bytes();
        sp -= bytes.len() as u64 + 1;
        sp &= !7;
        argv_addrs[i] = sp;
        write_bytes(sp, bytes);
        write_bytes(sp + bytes.len() as u64, &[0]);
    }

    // 16 random bytes for AT_RANDOM.
    sp -= 16;
    sp &= !15;
    let random_addr = sp;
    write_bytes(sp, &random_seed(stack_top, aux.entry));

    // Aux vector; pushed in reverse so AT_NULL lands at the highest
    // address.
    let mut auxv: Vec<AuxvEntry> = vec![
        AuxvEntry {
            a_type: AT_PAGESZ,
            a_val: PAGE_SIZE as u64,
        },
        AuxvEntry {
            a_type: AT_PHDR,
            a_val: aux.phdr_addr,
        },
        AuxvEntry {
            a_type: AT_PHENT,
            a_val: aux.phent,
        },
        AuxvEntry {
            a_type: AT_PHNUM,
            a_val: aux.phnum,
        },
        AuxvEntry {
            a_type: AT_ENTRY,
            a_val: aux.entry,
        },
        AuxvEntry {
            a_type: AT_RANDOM,
            a_val: random_addr,
        },
    ];
    if let Some(base) = aux.interp_base {
        auxv.push(AuxvEntry {
            a_type: AT_BASE,
            a_val: base,
        });
    }
    auxv.push(AuxvEntry {
        a_type: AT_NULL,
        a_val: 0,
    });

    for entry in auxv.iter().rev() {
        sp -= 16;
        write_bytes(sp, &entry.a_type.to_le_bytes());
        write_bytes(sp + 8, &entry.a_val.to_le_bytes());
    }

    // Empty environment: a single NULL.
    sp -= 8;
    write_bytes(sp, &0u64.to_le_bytes());

    // Argv pointer array, NULL-terminated.
    sp -= 8;
    write_bytes(sp, &0u64.to_le_bytes());
    for i in (0..argc).rev() {
        sp -= 8;
        write_bytes(sp, &argv_addrs[i].to_le_bytes());
    }

    // Argc at the final stack pointer.
    sp -= 8;
    write_bytes(sp, &(argc as u64).to_le_bytes());

    sp
}

/// A small deterministic seed mixer; real entropy is a bootloader concern.
fn random_seed(a: u64, b: u64) -> [u8; 16] {
    let mut x = a ^ b.rotate_left(31) ^ 0x9E37_79B9_7F4A_7C15;
    let mut out = [0u8; 16];
    for chunk in out.chunks_mut(8) {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        chunk.copy_from_slice(&x.to_le_bytes());
    }
    out
}

// ---------------------------------------------------------------------------
// Spawn (kernel target)
// ---------------------------------------------------------------------------

/// Reads a whole object through its read op, bounded by the spawn limit.
#[cfg(target_os = "none")]
fn read_object(obj: &crate::obj::ObjectRef) -> Result<Vec<u8>, Error> {
    let size = obj.stat().map(|s| s.size as usize).unwrap_or(0);
    if size == 0 || size > SPAWN_MAX_FILE_SIZE {
        return Err(Error::InvalidArgument);
    }
    let mut data = vec![0u8; size];
    let mut done = 0;
    while done < size {
        let n = obj.read(&mut data[done..], done as u64)?;
        if n == 0 {
            break;
        }
        done += n;
    }
    data.truncate(done);
    Ok(data)
}

/// Loads `path` and starts it as a child of the calling process.
///
/// Returns the child pid.
#[cfg(target_os = "none")]
pub fn spawn(path: &str, argv: &[&str]) -> Result<u64, Error> {
    use crate::proc::thread::Thread;

    let parent = crate::proc::current();

    // Open through the handle layer so the READ right is what authorizes
    // the file access.
    let data = {
        let obj = ns::open_path(path, &parent.cwd())?;
        let handle = parent.with_handles(|t| t.grant(obj, Rights::READ))?;
        parent.with_handles(|t| t.check_rights(handle, Rights::READ))?;
        let obj = parent.with_handles(|t| t.object(handle))?;
        let data = read_object(&obj);
        let _ = parent.with_handles(|t| t.close(handle));
        data?
    };

    let elf = delta_elf::Elf64::parse(&data).map_err(|_| Error::InvalidArgument)?;

    let name = path.rsplit('/').next().unwrap_or(path);
    let child = Process::create_user(name, parent.pid)?;

    let image = match load_image(&child, &elf) {
        Ok(image) => image,
        Err(e) => {
            crate::proc::destroy(&child);
            return Err(e);
        }
    };

    // Resolve the interpreter, when one is requested.
    let (entry, interp_base) = match elf.interpreter() {
        Some(interp_path) => {
            let interp_data = {
                let obj = ns::open_path(interp_path, "/")?;
                read_object(&obj)?
            };
            let interp_elf =
                delta_elf::Elf64::parse(&interp_data).map_err(|_| Error::InvalidArgument)?;
            let interp = load_at(&child, &interp_elf, INTERP_LOAD_BASE)?;
            (interp.entry, Some(INTERP_LOAD_BASE))
        }
        None => (image.entry, None),
    };

    let sp = setup_stack(&child, argv, &image, interp_base)?;

    let thread = Thread::create_user(&child, VirtAddr::new(entry), VirtAddr::new(sp));
    crate::sched::add(thread);

    Ok(child.pid)
}

/// Where an image landed.
#[cfg(target_os = "none")]
struct LoadedImage {
    entry: u64,
    phdr_addr: u64,
    phent: u64,
    phnum: u64,
}

/// Loads the main executable, biasing PIE images to their load base.
#[cfg(target_os = "none")]
fn load_image(child: &Arc<Process>, elf: &delta_elf::Elf64<'_>) -> Result<LoadedImage, Error> {
    let bias = if elf.is_pie() { PIE_LOAD_BASE } else { 0 };
    load_at(child, elf, bias)
}

/// Maps every LOAD segment of `elf` into `child` at `bias`, allocating PMM
/// frames, zeroing them, and copying the file bytes through the direct map.
#[cfg(target_os = "none")]
fn load_at(
    child: &Arc<Process>,
    elf: &delta_elf::Elf64<'_>,
    bias: u64,
) -> Result<LoadedImage, Error> {
    use crate::mm::mapper::MapFlags;
    use crate::mm::{hhdm, pmm, vmm};

    let root = child.pagemap_root().ok_or(Error::BadState)?;
    let page_mask = PAGE_SIZE as u64 - 1;

    for phdr in elf.program_headers().filter(|p| p.is_load()) {
        let seg_data = elf.segment_data(&phdr);
        let vaddr = phdr.p_vaddr + bias;
        let seg_start = vaddr & !page_mask;
        let seg_end = (vaddr + phdr.p_memsz + page_mask) & !page_mask;
        let page_count = ((seg_end - seg_start) / PAGE_SIZE as u64) as usize;

        let mut flags = MapFlags::USER;
        if phdr.writable() {
            flags |= MapFlags::WRITE;
        }
        if phdr.executable() {
            flags |= MapFlags::EXECUTE;
        }

        // Record the segment as an anonymous VMA so teardown frees the
        // frames.
        child.with_vmas(|vmas| {
            vmas.add(
                VirtAddr::new(seg_start),
                seg_end - seg_start,
                flags,
                None,
                0,
            )
        })?;

        for i in 0..page_count {
            let page_vaddr = seg_start + (i * PAGE_SIZE) as u64;
            let frame = pmm::alloc(1).ok_or(Error::ResourceExhausted)?;

            let window = hhdm::phys_to_virt(frame).as_mut_ptr::<u8>();
            // SAFETY: The frame is fresh and HHDM-covered.
            unsafe {
                core::ptr::write_bytes(window, 0, PAGE_SIZE);
            }

            // Copy the file bytes overlapping this page.
            let page_off = page_vaddr.saturating_sub(vaddr);
            if (page_off as usize) < seg_data.len() {
                let src_start = page_off as usize;
                let dst_off = vaddr.saturating_sub(page_vaddr) as usize;
                let n = (PAGE_SIZE - dst_off).min(seg_data.len() - src_start);
                // SAFETY: Both ranges were bounds-checked above.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        seg_data.as_ptr().add(src_start),
                        window.add(dst_off),
                        n,
                    );
                }
            }

            let ok = vmm::with_vmm(|vmm| {
                // SAFETY: The VMA reserved the range; the frame is fresh.
                unsafe {
                    vmm.map_range(root, VirtAddr::new(page_vaddr), frame, 1, flags)
                }
            });
            if !ok {
                pmm::free(frame, 1);
                return Err(Error::ResourceExhausted);
            }
        }
    }

    // AT_PHDR: the program header table as the process sees it, derived
    // from the first LOAD segment's file-to-memory delta.
    let phdr_addr = elf
        .program_headers()
        .find(delta_elf::ProgramHeader::is_load)
        .map(|first| first.p_vaddr + bias - first.p_offset + elf.phoff() as u64)
        .unwrap_or(0);

    Ok(LoadedImage {
        entry: elf.entry + bias,
        phdr_addr,
        phent: elf.phentsize() as u64,
        phnum: elf.phnum() as u64,
    })
}

/// Maps the two-page user stack, writes the initial image through the
/// direct map, and returns the initial stack pointer.
#[cfg(target_os = "none")]
fn setup_stack(
    child: &Arc<Process>,
    argv: &[&str],
    image: &LoadedImage,
    interp_base: Option<u64>,
) -> Result<u64, Error> {
    use crate::mm::mapper::MapFlags;
    use crate::mm::{hhdm, pmm, vmm};

    let stack_bytes = USER_STACK_PAGES * PAGE_SIZE;
    let stack_bottom = USER_STACK_TOP - stack_bytes as u64;
    let frames = pmm::alloc(USER_STACK_PAGES).ok_or(Error::ResourceExhausted)?;

    let flags = MapFlags::WRITE | MapFlags::USER;
    child.with_vmas(|vmas| {
        vmas.add(VirtAddr::new(stack_bottom), stack_bytes as u64, flags, None, 0)
    })?;

    let root = child.pagemap_root().ok_or(Error::BadState)?;
    let ok = vmm::with_vmm(|vmm| {
        // SAFETY: The VMA reserved the range; the frames are fresh.
        unsafe {
            vmm.map_range(
                root,
                VirtAddr::new(stack_bottom),
                frames,
                USER_STACK_PAGES,
                flags,
            )
        }
    });
    if !ok {
        pmm::free(frames, USER_STACK_PAGES);
        return Err(Error::ResourceExhausted);
    }

    // The user pagemap is not active yet; write through the direct map.
    let window_ptr = hhdm::phys_to_virt(frames).as_mut_ptr::<u8>();
    // SAFETY: The frames are a contiguous fresh run covered by the HHDM.
    let window = unsafe { core::slice::from_raw_parts_mut(window_ptr, stack_bytes) };
    window.fill(0);

    let aux = AuxInfo {
        phdr_addr: image.phdr_addr,
        phent: image.phent,
        phnum: image.phnum,
        entry: image.entry,
        interp_base,
    };
    Ok(build_user_stack(window, USER_STACK_TOP, argv, &aux))
}

/// Blocks until the child `pid` exits; returns its exit code.
#[cfg(target_os = "none")]
pub fn wait(pid: u64) -> Result<i64, Error> {
    let caller = crate::proc::current();
    let child = crate::proc::find(pid).ok_or(Error::NotFound)?;
    if child.parent_pid != caller.pid {
        return Err(Error::PermissionDenied);
    }
    let exited = || {
        matches!(
            child.state(),
            crate::proc::ProcessState::Zombie | crate::proc::ProcessState::Dead
        )
    };
    while !exited() {
        child.exit_wait.sleep_unless(&exited);
    }
    Ok(child.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_u64(window: &[u8], base: u64, addr: u64) -> u64 {
        let off = (addr - base) as usize;
        u64::from_le_bytes(window[off..off + 8].try_into().unwrap())
    }

    #[test]
    fn stack_layout_matches_abi() {
        let mut window = vec![0u8; 2 * PAGE_SIZE];
        let top = USER_STACK_TOP;
        let base = top - window.len() as u64;

        let aux = AuxInfo {
            phdr_addr: 0x40_0040,
            phent: 56,
            phnum: 3,
            entry: 0x40_1000,
            interp_base: None,
        };
        let sp = build_user_stack(&mut window, top, &["/bin/init", "-v"], &aux);

        // argc at the stack pointer.
        assert_eq!(read_u64(&window, base, sp), 2);

        // argv pointers in order, then a NULL sentinel.
        let argv0 = read_u64(&window, base, sp + 8);
        let argv1 = read_u64(&window, base, sp + 16);
        assert_eq!(read_u64(&window, base, sp + 24), 0);

        let str_at = |addr: u64| {
            let off = (addr - base) as usize;
            let nul = window[off..].iter().position(|&b| b == 0).unwrap();
            core::str::from_utf8(&window[off..off + nul]).unwrap().to_owned()
        };
        assert_eq!(str_at(argv0), "/bin/init");
        assert_eq!(str_at(argv1), "-v");

        // Empty environment: one NULL after the argv array.
        assert_eq!(read_u64(&window, base, sp + 32), 0);
    }

    #[test]
    fn aux_vector_is_null_terminated_and_complete() {
        let mut window = vec![0u8; 2 * PAGE_SIZE];
        let top = USER_STACK_TOP;
        let base = top - window.len() as u64;

        let aux = AuxInfo {
            phdr_addr: 0x1234,
            phent: 56,
            phnum: 7,
            entry: 0xABCD,
            interp_base: Some(INTERP_LOAD_BASE),
        };
        let sp = build_user_stack(&mut window, top, &["a"], &aux);

        // Walk past argc, argv (1 + NULL), envp NULL.
        let auxv_start = sp + 8 + 16 + 8;
        let mut seen = std::collections::HashMap::new();
        let mut addr = auxv_start;
        loop {
            let a_type = read_u64(&window, base, addr);
            let a_val = read_u64(&window, base, addr + 8);
            if a_type == AT_NULL {
                break;
            }
            seen.insert(a_type, a_val);
            addr += 16;
        }

        assert_eq!(seen[&AT_PAGESZ], PAGE_SIZE as u64);
        assert_eq!(seen[&AT_PHDR], 0x1234);
        assert_eq!(seen[&AT_PHENT], 56);
        assert_eq!(seen[&AT_PHNUM], 7);
        assert_eq!(seen[&AT_ENTRY], 0xABCD);
        assert_eq!(seen[&AT_BASE], INTERP_LOAD_BASE);
        // AT_RANDOM points at 16 in-stack bytes.
        let rand_addr = seen[&AT_RANDOM];
        assert!(rand_addr >= base && rand_addr + 16 <= top);
    }

    #[test]
    fn interpreterless_stack_has_no_at_base() {
        let mut window = vec![0u8; PAGE_SIZE];
        let top = USER_STACK_TOP;
        let base = top - window.len() as u64;

        let aux = AuxInfo {
            phdr_addr: 0,
            phent: 56,
            phnum: 1,
            entry: 0x40_0000,
            interp_base: None,
        };
        let sp = build_user_stack(&mut window, top, &[], &aux);

        // argc == 0, argv NULL immediately, envp NULL, then auxv.
        assert_eq!(read_u64(&window, base, sp), 0);
        let mut addr = sp + 8 + 8 + 8;
        loop {
            let a_type = read_u64(&window, base, addr);
            assert_ne!(a_type, AT_BASE, "AT_BASE present without interpreter");
            if a_type == AT_NULL {
                break;
            }
            addr += 16;
        }
    }
}
