//! Orbis ELF file parser

use bytemuck::{Pod, Zeroable};
use ob_core::error::LoaderError;
use std::path::Path;
use tracing::debug;

/// ELF file header (64-bit)
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Elf64Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// ELF program header (64-bit)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Elf64Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

/// ELF symbol table entry (64-bit)
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Elf64Sym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

impl Elf64Sym {
    pub fn binding(&self) -> u8 {
        self.st_info >> 4
    }

    pub fn sym_type(&self) -> u8 {
        self.st_info & 0xF
    }
}

/// ELF relocation entry with addend (64-bit)
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Elf64Rela {
    pub r_offset: u64,
    pub r_info: u64,
    pub r_addend: i64,
}

impl Elf64Rela {
    pub fn sym(&self) -> u32 {
        (self.r_info >> 32) as u32
    }

    pub fn rel_type(&self) -> u32 {
        self.r_info as u32
    }
}

/// ELF dynamic entry (64-bit)
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Elf64Dyn {
    pub d_tag: i64,
    pub d_val: u64,
}

/// ELF magic bytes
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const EV_CURRENT: u8 = 1;
pub const EM_X86_64: u16 = 62;

/// Object file types
pub mod et {
    pub const EXEC: u16 = 2;
    pub const SCE_EXEC: u16 = 0xFE00;
    pub const SCE_DYNEXEC: u16 = 0xFE10;
    pub const SCE_DYNAMIC: u16 = 0xFE18;
}

/// Program header types
pub mod pt {
    pub const NULL: u32 = 0;
    pub const LOAD: u32 = 1;
    pub const DYNAMIC: u32 = 2;
    pub const INTERP: u32 = 3;
    pub const TLS: u32 = 7;
    pub const SCE_DYNLIBDATA: u32 = 0x6100_0000;
    pub const SCE_PROCPARAM: u32 = 0x6100_0001;
    pub const SCE_RELRO: u32 = 0x6100_0010;
    pub const GNU_EH_FRAME: u32 = 0x6474_E550;
    pub const SCE_COMMENT: u32 = 0x6FFF_FF00;
}

/// Program header flags
pub mod pf {
    pub const X: u32 = 1;
    pub const W: u32 = 2;
    pub const R: u32 = 4;
}

/// Relocation types for x86-64
pub mod r_x86_64 {
    pub const NONE: u32 = 0;
    pub const R64: u32 = 1;
    pub const PC32: u32 = 2;
    pub const COPY: u32 = 5;
    pub const GLOB_DAT: u32 = 6;
    pub const JUMP_SLOT: u32 = 7;
    pub const RELATIVE: u32 = 8;
    pub const DTPMOD64: u32 = 16;
    pub const DTPOFF64: u32 = 17;
    pub const TPOFF64: u32 = 18;
    pub const DTPOFF32: u32 = 21;
    pub const TPOFF32: u32 = 23;
}

/// Symbol binding
pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;

pub const STN_UNDEF: u32 = 0;

/// True for headers the loader maps into memory.
pub fn is_loadable(p_type: u32) -> bool {
    p_type == pt::LOAD || p_type == pt::SCE_RELRO
}

/// A validated Orbis ELF image held in memory.
pub struct ElfFile {
    pub header: Elf64Header,
    pub phdrs: Vec<Elf64Phdr>,
    data: Vec<u8>,
}

impl ElfFile {
    pub fn open(path: &Path) -> Result<Self, LoaderError> {
        let data = std::fs::read(path).map_err(|e| {
            LoaderError::InvalidElf(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(data)
    }

    pub fn parse(data: Vec<u8>) -> Result<Self, LoaderError> {
        let header = Self::parse_header(&data)?;
        let phdrs = Self::parse_phdrs(&data, &header)?;

        debug!(
            "ELF parsed: type=0x{:x}, entry=0x{:x}, phdrs={}",
            header.e_type,
            header.e_entry,
            phdrs.len()
        );

        Ok(Self {
            header,
            phdrs,
            data,
        })
    }

    fn parse_header(data: &[u8]) -> Result<Elf64Header, LoaderError> {
        let size = std::mem::size_of::<Elf64Header>();
        if data.len() < size {
            return Err(LoaderError::InvalidElf(format!(
                "File too small for an ELF header: {} bytes",
                data.len()
            )));
        }

        let header: Elf64Header = bytemuck::pod_read_unaligned(&data[..size]);

        if header.e_ident[0..4] != ELF_MAGIC {
            return Err(LoaderError::InvalidElf("Invalid ELF magic".to_string()));
        }
        if header.e_ident[4] != ELFCLASS64 {
            return Err(LoaderError::InvalidElf(format!(
                "Unsupported ELF class {}",
                header.e_ident[4]
            )));
        }
        if header.e_ident[5] != ELFDATA2LSB {
            return Err(LoaderError::InvalidElf(format!(
                "Unsupported data encoding {}",
                header.e_ident[5]
            )));
        }
        if header.e_ident[6] != EV_CURRENT || header.e_version != EV_CURRENT as u32 {
            return Err(LoaderError::InvalidElf(format!(
                "Unsupported ELF version {}",
                header.e_version
            )));
        }
        if header.e_machine != EM_X86_64 {
            return Err(LoaderError::InvalidElf(format!(
                "Unsupported machine {}",
                header.e_machine
            )));
        }
        if !matches!(
            header.e_type,
            et::EXEC | et::SCE_EXEC | et::SCE_DYNEXEC | et::SCE_DYNAMIC
        ) {
            return Err(LoaderError::InvalidElf(format!(
                "Unsupported object type 0x{:x}",
                header.e_type
            )));
        }

        Ok(header)
    }

    fn parse_phdrs(data: &[u8], header: &Elf64Header) -> Result<Vec<Elf64Phdr>, LoaderError> {
        let entry_size = std::mem::size_of::<Elf64Phdr>();
        if header.e_phnum > 0 && header.e_phentsize as usize != entry_size {
            return Err(LoaderError::InvalidElf(format!(
                "Unexpected program header size {}",
                header.e_phentsize
            )));
        }

        let start = header.e_phoff as usize;
        let end = start
            .checked_add(header.e_phnum as usize * entry_size)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                LoaderError::InvalidElf(format!(
                    "Program header table at 0x{:x} ({} entries) extends beyond file",
                    header.e_phoff, header.e_phnum
                ))
            })?;

        Ok(data[start..end]
            .chunks_exact(entry_size)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// File contents of a segment.
    pub fn segment_data(&self, phdr: &Elf64Phdr) -> Result<&[u8], LoaderError> {
        self.file_range(phdr.p_offset, phdr.p_filesz)
    }

    /// `size` bytes of the file starting at `offset`.
    pub fn file_range(&self, offset: u64, size: u64) -> Result<&[u8], LoaderError> {
        let start = offset as usize;
        start
            .checked_add(size as usize)
            .filter(|&end| end <= self.data.len())
            .map(|end| &self.data[start..end])
            .ok_or_else(|| {
                LoaderError::InvalidElf(format!(
                    "Range at offset 0x{:x} with size 0x{:x} extends beyond file ({} bytes)",
                    offset,
                    size,
                    self.data.len()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_header(e_type: u16) -> Vec<u8> {
        let mut header = Elf64Header::default();
        header.e_ident[0..4].copy_from_slice(&ELF_MAGIC);
        header.e_ident[4] = ELFCLASS64;
        header.e_ident[5] = ELFDATA2LSB;
        header.e_ident[6] = EV_CURRENT;
        header.e_type = e_type;
        header.e_machine = EM_X86_64;
        header.e_version = 1;
        header.e_phoff = 64;
        header.e_phentsize = 56;
        bytemuck::bytes_of(&header).to_vec()
    }

    #[test]
    fn test_elf_magic() {
        assert_eq!(ELF_MAGIC, [0x7F, b'E', b'L', b'F']);
        let err = ElfFile::parse(vec![0u8; 64]).err().unwrap();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_struct_sizes() {
        assert_eq!(std::mem::size_of::<Elf64Header>(), 64);
        assert_eq!(std::mem::size_of::<Elf64Phdr>(), 56);
        assert_eq!(std::mem::size_of::<Elf64Sym>(), 24);
        assert_eq!(std::mem::size_of::<Elf64Rela>(), 24);
        assert_eq!(std::mem::size_of::<Elf64Dyn>(), 16);
    }

    #[test]
    fn test_accepts_orbis_types() {
        for e_type in [et::EXEC, et::SCE_EXEC, et::SCE_DYNEXEC, et::SCE_DYNAMIC] {
            let file = ElfFile::parse(minimal_header(e_type)).unwrap();
            assert_eq!(file.header.e_type, e_type);
            assert!(file.phdrs.is_empty());
        }
    }

    #[test]
    fn test_rejects_foreign_machine() {
        let mut data = minimal_header(et::SCE_DYNEXEC);
        data[18] = 3; // EM_386
        assert!(ElfFile::parse(data).is_err());

        let data = minimal_header(3); // ET_DYN
        assert!(ElfFile::parse(data).is_err());
    }

    #[test]
    fn test_rela_info() {
        let rela = Elf64Rela {
            r_offset: 0,
            r_info: (5u64 << 32) | r_x86_64::GLOB_DAT as u64,
            r_addend: 0,
        };
        assert_eq!(rela.sym(), 5);
        assert_eq!(rela.rel_type(), r_x86_64::GLOB_DAT);
    }

    #[test]
    fn test_loadable() {
        assert!(is_loadable(pt::LOAD));
        assert!(is_loadable(pt::SCE_RELRO));
        assert!(!is_loadable(pt::DYNAMIC));
    }
}
