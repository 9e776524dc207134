/*
 * ELF Loading and Initial User Stack
 *
 * Turns "prog arg1 arg2 ..." into a ready-to-run user context: validates
 * the ELF64 image, maps its PT_LOAD segments with the right writable
 * bits, builds the stack page, and lays out argc/argv per the SysV AMD64
 * ABI:
 *
 *   higher | argv strings (NUL-terminated, argv[argc-1] pushed first)
 *          | alignment pad
 *          | argv[argc] = 0
 *          | argv[argc-1] .. argv[0]
 *   rsp -> | fake return address (0)        rsp is 16-byte aligned
 *
 * On entry rdi = argc, rsi = &argv[0], rip = e_entry. The image file is
 * write-denied for as long as the returned handle stays open.
 */

use alloc::vec::Vec;

use crate::arch::x86_64::context::TrapFrame;
use crate::fs::{self, FileHandle};
use crate::memory::addrspace::{AddressSpace, USER_STACK, is_user_vaddr, page_round_down};
use crate::memory::palloc::{self, AllocFlags, PAGE_SIZE};

// ELF types, from the ELF specification.
const PT_NULL: u32 = 0;
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PT_NOTE: u32 = 4;
const PT_SHLIB: u32 = 5;
const PT_PHDR: u32 = 6;
const PT_STACK: u32 = 0x6474_e551;

const PF_W: u32 = 2;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

/// Executable header fields the loader cares about.
struct Ehdr {
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_phentsize: u16,
    e_phnum: u16,
}

/// One program header.
struct Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn u32_at(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn u64_at(b: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(bytes)
}

impl Ehdr {
    /// Parse and verify the executable header: little-endian ELF64,
    /// amd64 executable, sane program header table.
    fn parse(b: &[u8; EHDR_SIZE]) -> Result<Ehdr, &'static str> {
        if &b[..4] != b"\x7fELF" || b[4] != 2 || b[5] != 1 || b[6] != 1 {
            return Err("not a little-endian ELF64 image");
        }
        let hdr = Ehdr {
            e_type: u16_at(b, 16),
            e_machine: u16_at(b, 18),
            e_version: u32_at(b, 20),
            e_entry: u64_at(b, 24),
            e_phoff: u64_at(b, 32),
            e_phentsize: u16_at(b, 54),
            e_phnum: u16_at(b, 56),
        };
        if hdr.e_type != 2
            || hdr.e_machine != 0x3E
            || hdr.e_version != 1
            || hdr.e_phentsize as usize != PHDR_SIZE
            || hdr.e_phnum > 1024
        {
            return Err("unsupported ELF image");
        }
        Ok(hdr)
    }
}

impl Phdr {
    fn parse(b: &[u8; PHDR_SIZE]) -> Phdr {
        Phdr {
            p_type: u32_at(b, 0),
            p_flags: u32_at(b, 4),
            p_offset: u64_at(b, 8),
            p_vaddr: u64_at(b, 16),
            p_filesz: u64_at(b, 32),
            p_memsz: u64_at(b, 40),
        }
    }
}

/// A fully loaded user image, ready for iretq.
pub struct LoadedImage {
    pub space: AddressSpace,
    /// Open, write-denied handle on the executable.
    pub exec_file: FileHandle,
}

/// Load the executable named by `cmdline`'s first word and populate
/// `frame` with its entry point, stack and arguments.
pub fn load(cmdline: &str, frame: &mut TrapFrame) -> Result<LoadedImage, &'static str> {
    let prog = cmdline.split_whitespace().next().ok_or("empty command line")?;
    let mut file = fs::open(prog).ok_or("open failed")?;
    let mut space = AddressSpace::new().ok_or("page table allocation failed")?;

    let mut ehdr_buf = [0u8; EHDR_SIZE];
    if file.read(&mut ehdr_buf) != EHDR_SIZE {
        return Err("truncated executable header");
    }
    let ehdr = Ehdr::parse(&ehdr_buf)?;

    let file_len = file.len() as u64;
    let mut ofs = ehdr.e_phoff;
    for _ in 0..ehdr.e_phnum {
        if ofs > file_len {
            return Err("program header table out of range");
        }
        file.seek(ofs as usize);
        let mut phdr_buf = [0u8; PHDR_SIZE];
        if file.read(&mut phdr_buf) != PHDR_SIZE {
            return Err("truncated program header");
        }
        ofs += PHDR_SIZE as u64;

        let phdr = Phdr::parse(&phdr_buf);
        match phdr.p_type {
            PT_NULL | PT_NOTE | PT_PHDR | PT_STACK => {}
            PT_DYNAMIC | PT_INTERP | PT_SHLIB => return Err("unsupported segment type"),
            PT_LOAD => {
                if !validate_segment(&phdr, file_len) {
                    return Err("malformed loadable segment");
                }
                load_segment(&mut space, &mut file, &phdr)?;
            }
            _ => {}
        }
    }

    setup_stack(&mut space, frame)?;
    frame.rip = ehdr.e_entry;
    push_args(&mut space, frame, cmdline)?;

    file.deny_write();
    Ok(LoadedImage {
        space,
        exec_file: file,
    })
}

/// Checks whether `phdr` describes a valid, loadable segment.
fn validate_segment(phdr: &Phdr, file_len: u64) -> bool {
    let pgmask = PAGE_SIZE as u64 - 1;

    // File offset and VA must agree on their page offset.
    if (phdr.p_offset & pgmask) != (phdr.p_vaddr & pgmask) {
        return false;
    }
    // The segment must start inside the file and must not be empty.
    if phdr.p_offset > file_len || phdr.p_memsz == 0 || phdr.p_memsz < phdr.p_filesz {
        return false;
    }
    // The region must fit the user address space without wrapping.
    let end = match phdr.p_vaddr.checked_add(phdr.p_memsz) {
        Some(end) => end,
        None => return false,
    };
    if !is_user_vaddr(phdr.p_vaddr) || !is_user_vaddr(end) {
        return false;
    }
    // Page 0 stays unmapped so user NULL dereferences fault cleanly.
    if phdr.p_vaddr < PAGE_SIZE as u64 {
        return false;
    }
    true
}

/// Map one PT_LOAD segment: read p_filesz bytes (page-rounded at both
/// ends), zero-fill to p_memsz, writable iff the segment says so.
fn load_segment(
    space: &mut AddressSpace,
    file: &mut FileHandle,
    phdr: &Phdr,
) -> Result<(), &'static str> {
    let pgmask = PAGE_SIZE as u64 - 1;
    let writable = phdr.p_flags & PF_W != 0;
    let file_page = phdr.p_offset & !pgmask;
    let mut upage = phdr.p_vaddr & !pgmask;
    let page_offset = phdr.p_vaddr & pgmask;

    let mut read_bytes = if phdr.p_filesz > 0 {
        (page_offset + phdr.p_filesz) as usize
    } else {
        0
    };
    let total = (page_offset + phdr.p_memsz) as usize;
    let mut zero_bytes = total.next_multiple_of(PAGE_SIZE) - read_bytes;

    file.seek(file_page as usize);
    while read_bytes > 0 || zero_bytes > 0 {
        let page_read = read_bytes.min(PAGE_SIZE);
        let page_zero = PAGE_SIZE - page_read;

        let mut frame = palloc::alloc_page(AllocFlags::USER | AllocFlags::ZERO)
            .ok_or("out of user pages")?;
        if file.read(&mut frame.bytes_mut()[..page_read]) != page_read {
            return Err("segment read failed");
        }
        // The tail of the frame is already zero-filled.
        if !space.map(upage, frame, writable) {
            return Err("overlapping segment mapping");
        }

        read_bytes -= page_read;
        zero_bytes -= page_zero.min(zero_bytes);
        upage += PAGE_SIZE as u64;
    }
    Ok(())
}

/// Map a zeroed page just below USER_STACK and point rsp at the top.
fn setup_stack(space: &mut AddressSpace, frame: &mut TrapFrame) -> Result<(), &'static str> {
    let page = palloc::alloc_page(AllocFlags::USER | AllocFlags::ZERO).ok_or("out of user pages")?;
    if !space.map(USER_STACK - PAGE_SIZE as u64, page, true) {
        return Err("stack page collision");
    }
    frame.rsp = USER_STACK;
    Ok(())
}

/// Push `size` bytes onto the user stack (zeros when `bytes` is None),
/// mapping additional stack pages as the push crosses page boundaries.
/// Returns the new stack pointer.
fn push_stack(
    space: &mut AddressSpace,
    rsp: &mut u64,
    bytes: Option<&[u8]>,
    size: usize,
) -> Result<u64, &'static str> {
    if size == 0 {
        return Ok(*rsp);
    }
    let old = *rsp;
    let new = old.checked_sub(size as u64).ok_or("stack underflow")?;

    let mut base = page_round_down(new);
    while base < old {
        if !space.is_mapped(base) {
            let frame = palloc::alloc_page(AllocFlags::USER | AllocFlags::ZERO)
                .ok_or("out of user pages")?;
            if !space.map(base, frame, true) {
                return Err("stack page collision");
            }
        }
        base += PAGE_SIZE as u64;
    }

    let ok = match bytes {
        Some(data) => {
            debug_assert_eq!(data.len(), size);
            space.write_bytes(new, data)
        }
        None => (0..size).all(|i| space.write_byte(new + i as u64, 0)),
    };
    if !ok {
        return Err("stack write failed");
    }
    *rsp = new;
    Ok(new)
}

/// Build argc/argv on the stack from the whitespace-split command line.
fn push_args(
    space: &mut AddressSpace,
    frame: &mut TrapFrame,
    cmdline: &str,
) -> Result<(), &'static str> {
    let args: Vec<&str> = cmdline.split_whitespace().collect();
    if args.is_empty() {
        return Err("empty command line");
    }
    let argc = args.len();
    let mut rsp = frame.rsp;

    // Strings, last argument first, remembering where each one landed.
    let mut addrs = alloc::vec![0u64; argc];
    for i in (0..argc).rev() {
        let mut data = Vec::from(args[i].as_bytes());
        data.push(0);
        addrs[i] = push_stack(space, &mut rsp, Some(&data), data.len())?;
    }

    // Pad so the final rsp, after the sentinel, the argv pointers and
    // the fake return address, lands 16-byte aligned.
    let remaining = ((argc + 2) * 8) as u64;
    let pad = ((rsp - remaining) % 16) as usize;
    push_stack(space, &mut rsp, None, pad)?;

    // argv[argc] = NULL, then the pointers in reverse.
    push_stack(space, &mut rsp, None, 8)?;
    for i in (0..argc).rev() {
        push_stack(space, &mut rsp, Some(&addrs[i].to_le_bytes()), 8)?;
    }
    // Fake return address.
    push_stack(space, &mut rsp, None, 8)?;

    frame.rsp = rsp;
    frame.rdi = argc as u64;
    frame.rsi = rsp + 8;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_image {
    //! Minimal ELF64 image builder for loader tests.

    use super::*;

    pub struct Segment {
        pub vaddr: u64,
        pub data: Vec<u8>,
        pub memsz: u64,
        pub writable: bool,
    }

    /// Assemble an image with one page-aligned data area per segment.
    pub fn build(entry: u64, segments: &[Segment]) -> Vec<u8> {
        let phnum = segments.len();
        let mut image = alloc::vec![0u8; PAGE_SIZE * (1 + phnum)];

        // Executable header
        image[..4].copy_from_slice(b"\x7fELF");
        image[4] = 2; // 64-bit
        image[5] = 1; // little-endian
        image[6] = 1; // version
        image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        image[18..20].copy_from_slice(&0x3Eu16.to_le_bytes()); // EM_X86_64
        image[20..24].copy_from_slice(&1u32.to_le_bytes());
        image[24..32].copy_from_slice(&entry.to_le_bytes());
        image[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes()); // e_phoff
        image[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        image[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());

        for (i, seg) in segments.iter().enumerate() {
            let offset = (PAGE_SIZE * (1 + i)) as u64;
            let ph = EHDR_SIZE + i * PHDR_SIZE;
            image[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
            let flags = if seg.writable { 6u32 } else { 5u32 };
            image[ph + 4..ph + 8].copy_from_slice(&flags.to_le_bytes());
            image[ph + 8..ph + 16].copy_from_slice(&offset.to_le_bytes());
            image[ph + 16..ph + 24].copy_from_slice(&seg.vaddr.to_le_bytes());
            image[ph + 32..ph + 40].copy_from_slice(&(seg.data.len() as u64).to_le_bytes());
            image[ph + 40..ph + 48].copy_from_slice(&seg.memsz.to_le_bytes());

            image[offset as usize..offset as usize + seg.data.len()].copy_from_slice(&seg.data);
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::test_image::{Segment, build};
    use super::*;

    fn install_exec(path: &str, entry: u64, segments: &[Segment]) {
        assert!(fs::install(path, &build(entry, segments)));
    }

    fn text_segment() -> Segment {
        Segment {
            vaddr: 0x40_0000,
            data: b"\x90\x90\xc3 program text".to_vec(),
            memsz: 64,
            writable: false,
        }
    }

    #[test]
    fn test_load_maps_segments_and_sets_entry() {
        install_exec(
            "ld-basic",
            0x40_0000,
            &[
                text_segment(),
                Segment {
                    vaddr: 0x60_0000,
                    data: b"data".to_vec(),
                    memsz: 2 * PAGE_SIZE as u64, // bss tail
                    writable: true,
                },
            ],
        );

        let mut frame = TrapFrame::user_default();
        let image = load("ld-basic", &mut frame).unwrap();
        assert_eq!(frame.rip, 0x40_0000);
        assert_eq!(frame.rdi, 1);

        // Text is mapped read-only with the file contents.
        assert_eq!(image.space.read_byte(0x40_0000), Some(0x90));
        assert_eq!(image.space.is_writable(0x40_0000), Some(false));

        // Data is writable, bss zero-filled past p_filesz.
        assert_eq!(image.space.read_byte(0x60_0000), Some(b'd'));
        assert_eq!(image.space.is_writable(0x60_0000), Some(true));
        assert_eq!(image.space.read_byte(0x60_0000 + PAGE_SIZE as u64), Some(0));

        // The executable is write-denied while loaded.
        assert!(image.exec_file.is_deny_write());
        let mut other = fs::open("ld-basic").unwrap();
        assert_eq!(other.write(b"zap"), 0);
    }

    #[test]
    fn test_load_rejects_bad_headers() {
        assert!(fs::install("ld-noelf", b"#!/bin/sh\necho hi\n"));
        let mut frame = TrapFrame::user_default();
        assert!(load("ld-noelf", &mut frame).is_err());

        assert!(load("ld-missing", &mut frame).is_err());

        // Segment mapped at page 0 must be refused.
        install_exec(
            "ld-page0",
            0x0,
            &[Segment {
                vaddr: 0,
                data: b"x".to_vec(),
                memsz: 1,
                writable: false,
            }],
        );
        assert!(load("ld-page0", &mut frame).is_err());
    }

    #[test]
    fn test_validate_segment_rules() {
        let file_len = 0x10_000;
        let mut ph = Phdr {
            p_type: PT_LOAD,
            p_flags: 5,
            p_offset: 0x1000,
            p_vaddr: 0x40_0000,
            p_filesz: 0x100,
            p_memsz: 0x200,
        };
        assert!(validate_segment(&ph, file_len));

        ph.p_offset = 0x1004; // page offsets disagree
        assert!(!validate_segment(&ph, file_len));
        ph.p_offset = 0x1000;

        ph.p_memsz = 0;
        assert!(!validate_segment(&ph, file_len));
        ph.p_memsz = 0x80; // smaller than filesz
        assert!(!validate_segment(&ph, file_len));
        ph.p_memsz = 0x200;

        ph.p_offset = file_len + 1;
        assert!(!validate_segment(&ph, file_len));
        ph.p_offset = 0x1000;

        ph.p_vaddr = crate::memory::USER_LIMIT - 0x100; // end leaves user space
        assert!(!validate_segment(&ph, file_len));
        ph.p_vaddr = u64::MAX - 0x50; // wraps
        assert!(!validate_segment(&ph, file_len));
    }

    #[test]
    fn test_argv_layout_matches_sysv_abi() {
        install_exec("args-multiple", 0x40_0000, &[text_segment()]);
        let mut frame = TrapFrame::user_default();
        let image = load("args-multiple some arg for you", &mut frame).unwrap();
        let space = &image.space;

        // argc and alignment at entry
        assert_eq!(frame.rdi, 5);
        assert_eq!(frame.rsp % 16, 0);
        assert_eq!(frame.rsi, frame.rsp + 8);

        // Fake return address of 0 on top of the stack.
        let mut word = [0u8; 8];
        assert!(space.read_bytes(frame.rsp, &mut word));
        assert_eq!(u64::from_le_bytes(word), 0);

        // argv[0..5] point at the right strings, argv[5] is NULL.
        let expected = ["args-multiple", "some", "arg", "for", "you"];
        for (i, want) in expected.iter().enumerate() {
            assert!(space.read_bytes(frame.rsi + 8 * i as u64, &mut word));
            let ptr = u64::from_le_bytes(word);
            assert_eq!(space.read_cstr(ptr, 64).as_deref(), Some(*want));
        }
        assert!(space.read_bytes(frame.rsi + 8 * 5, &mut word));
        assert_eq!(u64::from_le_bytes(word), 0);

        // Strings live above the pointer array, below the stack top.
        assert!(frame.rsi + 8 * 6 <= USER_STACK);
    }

    #[test]
    fn test_single_argument_program() {
        install_exec("echo", 0x40_0000, &[text_segment()]);
        let mut frame = TrapFrame::user_default();
        let image = load("echo", &mut frame).unwrap();
        assert_eq!(frame.rdi, 1);
        assert_eq!(frame.rsp % 16, 0);

        let mut word = [0u8; 8];
        assert!(image.space.read_bytes(frame.rsi, &mut word));
        let argv0 = u64::from_le_bytes(word);
        assert_eq!(image.space.read_cstr(argv0, 16).as_deref(), Some("echo"));
    }
}
