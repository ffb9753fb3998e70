//! Program-header summary

use crate::elf::{is_loadable, pt, Elf64Phdr};
use ob_core::error::LoaderError;
use ob_memory::{align_up, GUEST_PAGE_SIZE};

const ALIGN_MASK: u64 = GUEST_PAGE_SIZE - 1;

/// Layout facts gathered from the program headers.
#[derive(Debug, Clone, Default)]
pub struct ProgramInfo {
    pub load_start: u64,
    pub load_end: u64,

    pub has_dynamic: bool,
    pub dynamic_index: usize,
    pub dynamic_address: u64,
    pub dynamic_offset: u64,
    pub dynamic_file_size: u64,

    pub tls_address: u64,
    pub tls_file_size: u64,
    pub tls_memory_size: u64,
    pub tls_align: u64,

    pub sce_dynlibdata_offset: u64,
    pub sce_dynlibdata_size: u64,

    pub sce_proc_param_address: u64,
    pub sce_proc_param_size: u64,

    pub eh_frame_address: u64,
    pub eh_frame_memory_size: u64,

    pub sce_comment_offset: u64,
    pub sce_comment_size: u64,
}

impl ProgramInfo {
    pub fn parse(phdrs: &[Elf64Phdr]) -> Result<Self, LoaderError> {
        if phdrs.is_empty() {
            return Err(LoaderError::InvalidElf("No program headers".to_string()));
        }

        let mut info = Self::default();
        let mut load_start: Option<u64> = None;
        let mut load_end = 0u64;

        for (index, phdr) in phdrs.iter().enumerate() {
            let bad = |reason: &str| LoaderError::InvalidProgramHeader {
                index,
                reason: reason.to_string(),
            };

            match phdr.p_type {
                t if is_loadable(t) => {
                    if phdr.p_align & ALIGN_MASK != 0
                        || phdr.p_vaddr & ALIGN_MASK != 0
                        || phdr.p_offset & ALIGN_MASK != 0
                    {
                        return Err(bad("segment is not 16 KiB aligned"));
                    }
                    if phdr.p_filesz > phdr.p_memsz {
                        return Err(bad("file size exceeds memory size"));
                    }
                    load_start = Some(load_start.map_or(phdr.p_vaddr, |s| s.min(phdr.p_vaddr)));
                    load_end = load_end.max(align_up(phdr.p_vaddr + phdr.p_memsz, GUEST_PAGE_SIZE));
                }
                pt::DYNAMIC => {
                    if phdr.p_filesz > phdr.p_memsz {
                        return Err(bad("file size exceeds memory size"));
                    }
                    info.has_dynamic = true;
                    info.dynamic_index = index;
                    info.dynamic_address = phdr.p_vaddr;
                    info.dynamic_offset = phdr.p_offset;
                    info.dynamic_file_size = phdr.p_filesz;
                }
                pt::TLS => {
                    if phdr.p_filesz > phdr.p_memsz {
                        return Err(bad("file size exceeds memory size"));
                    }
                    if phdr.p_align > 32 {
                        return Err(bad("TLS alignment above 32"));
                    }
                    info.tls_address = phdr.p_vaddr;
                    info.tls_file_size = phdr.p_filesz;
                    info.tls_memory_size = phdr.p_memsz;
                    info.tls_align = phdr.p_align;
                }
                pt::SCE_DYNLIBDATA => {
                    if phdr.p_filesz == 0 {
                        return Err(bad("empty dynlibdata"));
                    }
                    info.sce_dynlibdata_offset = phdr.p_offset;
                    info.sce_dynlibdata_size = phdr.p_filesz;
                }
                pt::SCE_PROCPARAM => {
                    info.sce_proc_param_address = phdr.p_vaddr;
                    info.sce_proc_param_size = phdr.p_filesz;
                }
                pt::GNU_EH_FRAME => {
                    if phdr.p_filesz > phdr.p_memsz {
                        return Err(bad("file size exceeds memory size"));
                    }
                    info.eh_frame_address = phdr.p_vaddr;
                    info.eh_frame_memory_size = phdr.p_memsz;
                }
                pt::SCE_COMMENT => {
                    info.sce_comment_offset = phdr.p_offset;
                    info.sce_comment_size = phdr.p_filesz;
                }
                _ => {}
            }
        }

        info.load_start = load_start
            .ok_or_else(|| LoaderError::InvalidElf("No loadable program headers".to_string()))?;
        info.load_end = load_end;
        Ok(info)
    }

    pub fn load_size(&self) -> u64 {
        self.load_end - self.load_start
    }
}
