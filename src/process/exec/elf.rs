//! ELF64 program loading.
//!
//! Validates the header (RISC-V, executable, sane program-header table),
//! maps each PT_LOAD segment with its requested permissions and copies
//! the file image in through the permissive user-copy path, since
//! segments are often mapped read-only.

use crate::error::{Errno, Result};
use crate::mm::address_space::MapPerms;
use crate::mm::AddressSpace;
use crate::vfs::file::VfsFile;
use alloc::sync::Arc;
use alloc::vec;

pub const ELF_MAGIC: u32 = 0x464c_457f;
pub const ELF_CLASS_64: u8 = 2;
pub const ELF_TYPE_EXEC: u16 = 2;
pub const ELF_MACHINE_RISCV: u16 = 0xf3;
pub const MAX_PHDRS: usize = 128;

pub const PT_LOAD: u32 = 1;
pub const PF_EXEC: u32 = 1;
pub const PF_WRITE: u32 = 2;
pub const PF_READ: u32 = 4;

pub const ELF_HEADER_SIZE: usize = 64;
pub const PROGRAM_HEADER_SIZE: usize = 56;

#[derive(Debug, Clone, Copy)]
pub struct ElfHeader {
    pub magic: u32,
    pub class: u8,
    pub obj_type: u16,
    pub machine: u16,
    pub entry: u64,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

impl ElfHeader {
    pub fn parse(bytes: &[u8]) -> ElfHeader {
        let u16_at = |off: usize| u16::from_le_bytes(bytes[off..off + 2].try_into().unwrap());
        let u32_at = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        let u64_at = |off: usize| u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
        ElfHeader {
            magic: u32_at(0),
            class: bytes[4],
            obj_type: u16_at(16),
            machine: u16_at(18),
            entry: u64_at(24),
            phoff: u64_at(32),
            phentsize: u16_at(54),
            phnum: u16_at(56),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != ELF_MAGIC || self.class != ELF_CLASS_64 {
            return Err(Errno::ENOEXEC);
        }
        if self.obj_type != ELF_TYPE_EXEC || self.machine != ELF_MACHINE_RISCV {
            return Err(Errno::ENOEXEC);
        }
        if self.phnum as usize > MAX_PHDRS || self.phentsize as usize != PROGRAM_HEADER_SIZE {
            return Err(Errno::ENOEXEC);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub seg_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

impl ProgramHeader {
    pub fn parse(bytes: &[u8]) -> ProgramHeader {
        let u32_at = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        let u64_at = |off: usize| u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
        ProgramHeader {
            seg_type: u32_at(0),
            flags: u32_at(4),
            offset: u64_at(8),
            vaddr: u64_at(16),
            filesz: u64_at(32),
            memsz: u64_at(40),
        }
    }

    fn perms(&self) -> MapPerms {
        let mut perms = MapPerms::empty();
        if self.flags & PF_READ != 0 {
            perms |= MapPerms::READ;
        }
        if self.flags & PF_WRITE != 0 {
            perms |= MapPerms::WRITE;
        }
        if self.flags & PF_EXEC != 0 {
            perms |= MapPerms::EXEC;
        }
        perms
    }
}

/// Map and fill every PT_LOAD segment of `file` into `space`; returns
/// the entry point.
pub fn load_program(space: &AddressSpace, file: &Arc<VfsFile>) -> Result<usize> {
    let mut header_bytes = [0u8; ELF_HEADER_SIZE];
    let read = file.read_at(&mut header_bytes, 0)?;
    if read != ELF_HEADER_SIZE {
        return Err(Errno::ENOEXEC);
    }
    let header = ElfHeader::parse(&header_bytes);
    header.validate()?;

    let table_size = header.phnum as usize * PROGRAM_HEADER_SIZE;
    let mut table = vec![0u8; table_size];
    let read = file.read_at(&mut table, header.phoff as usize)?;
    if read != table_size {
        return Err(Errno::EIO);
    }

    for index in 0..header.phnum as usize {
        let ph = ProgramHeader::parse(&table[index * PROGRAM_HEADER_SIZE..]);
        if ph.seg_type != PT_LOAD || ph.memsz == 0 {
            continue;
        }
        space.allocate_range(
            ph.vaddr as usize,
            ph.filesz as usize,
            ph.memsz as usize,
            ph.perms(),
        )?;
        // Copy the file image; the rest of memsz stays zero.
        let size = ph.filesz.min(ph.memsz) as usize;
        let mut copied = 0;
        let mut chunk = vec![0u8; 4096];
        while copied < size {
            let span = (size - copied).min(chunk.len());
            let read = file.read_at(&mut chunk[..span], ph.offset as usize + copied)?;
            if read != span {
                return Err(Errno::EIO);
            }
            crate::syscall::uaccess::copy_to_user_permissive(
                space,
                ph.vaddr as usize + copied,
                &chunk[..span],
            )?;
            copied += span;
        }
    }
    Ok(header.entry as usize)
}

#[cfg(test)]
pub(crate) mod testelf {
    use super::*;
    use alloc::vec::Vec;

    /// A minimal executable image: one PT_LOAD at `vaddr` with `body`.
    pub fn build(entry: u64, vaddr: u64, body: &[u8]) -> Vec<u8> {
        let mut image = vec![0u8; ELF_HEADER_SIZE + PROGRAM_HEADER_SIZE];
        image[0..4].copy_from_slice(&ELF_MAGIC.to_le_bytes());
        image[4] = ELF_CLASS_64;
        image[5] = 1; // little endian
        image[16..18].copy_from_slice(&ELF_TYPE_EXEC.to_le_bytes());
        image[18..20].copy_from_slice(&ELF_MACHINE_RISCV.to_le_bytes());
        image[24..32].copy_from_slice(&entry.to_le_bytes());
        image[32..40].copy_from_slice(&(ELF_HEADER_SIZE as u64).to_le_bytes());
        image[54..56].copy_from_slice(&(PROGRAM_HEADER_SIZE as u16).to_le_bytes());
        image[56..58].copy_from_slice(&1u16.to_le_bytes());

        let ph_base = ELF_HEADER_SIZE;
        let file_off = (ELF_HEADER_SIZE + PROGRAM_HEADER_SIZE) as u64;
        image[ph_base..ph_base + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        image[ph_base + 4..ph_base + 8]
            .copy_from_slice(&(PF_READ | PF_EXEC).to_le_bytes());
        image[ph_base + 8..ph_base + 16].copy_from_slice(&file_off.to_le_bytes());
        image[ph_base + 16..ph_base + 24].copy_from_slice(&vaddr.to_le_bytes());
        image[ph_base + 32..ph_base + 40].copy_from_slice(&(body.len() as u64).to_le_bytes());
        image[ph_base + 40..ph_base + 48].copy_from_slice(&(body.len() as u64 + 64).to_le_bytes());
        image.extend_from_slice(body);
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::ram::RamDisk;
    use crate::mm::test_support::ensure_page_pool;
    use crate::vfs::blkfile::anonymous_block_node;
    use crate::vfs::file::FileFlags;
    use alloc::string::String;

    fn file_with(image: &[u8]) -> Arc<VfsFile> {
        let disk = Arc::new(RamDisk::new(512, 64));
        let node = anonymous_block_node(disk);
        let file = VfsFile::new(node, String::new(), FileFlags::READ | FileFlags::WRITE);
        file.write_at(image, 0).unwrap();
        file
    }

    #[test]
    fn loads_a_minimal_executable() {
        ensure_page_pool();
        let body = b"\x13\x00\x00\x00actual segment bytes";
        let image = testelf::build(0x10000, 0x10000, body);
        let file = file_with(&image);
        let space = AddressSpace::new().unwrap();
        let entry = load_program(&space, &file).unwrap();
        assert_eq!(entry, 0x10000);
        // The segment is mapped read-only; check the bytes landed.
        let mut back = alloc::vec![0u8; body.len()];
        crate::syscall::uaccess::copy_from_user(&space, 0x10000, &mut back).unwrap();
        assert_eq!(back, body);
        // Read-only mapping: ordinary writes refuse.
        assert!(space.virt_to_phys(0x10000, true, false).is_none());
    }

    #[test]
    fn rejects_foreign_binaries() {
        ensure_page_pool();
        let mut image = testelf::build(0x10000, 0x10000, b"x");
        image[18] = 0x3e; // x86_64 machine id
        let file = file_with(&image);
        let space = AddressSpace::new().unwrap();
        assert_eq!(load_program(&space, &file), Err(Errno::ENOEXEC));
    }

    #[test]
    fn rejects_bad_magic() {
        ensure_page_pool();
        let mut image = testelf::build(0x10000, 0x10000, b"x");
        image[0] = 0;
        let file = file_with(&image);
        let space = AddressSpace::new().unwrap();
        assert_eq!(load_program(&space, &file), Err(Errno::ENOEXEC));
    }
}
