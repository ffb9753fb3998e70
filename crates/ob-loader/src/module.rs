//! Loaded modules
//!
//! A [`Module`] owns an 8 GiB host reservation. The image is mapped at the
//! first 4 GiB boundary inside it and the RIP zone is carved out of the
//! remaining space so that every trampoline is reachable with a rel32 jump.

use crate::codegen::FsBaseMode;
use crate::dynamic::{DynamicInfo, StringTable};
use crate::eh_frame::{self, EhFrameInfo};
use crate::elf::{et, is_loadable, pf, Elf64Dyn, Elf64Phdr, Elf64Rela, Elf64Sym, ElfFile, STB_GLOBAL, STB_LOCAL, STB_WEAK, STN_UNDEF};
use crate::patcher::{self, PatchStats, PatchTarget};
use crate::program::ProgramInfo;
use crate::relocate::{self, RelocationWrite};
use crate::rip_zone::{RipPointers, RipZone, FREE_ZONE_OFFSET, FREE_ZONE_SIZE, RIP_POINTERS_PAGE_SIZE, RIP_ZONE_SIZE};
use crate::symbol::{elf_hash, parse_symbol_name};
use crate::text;
use ob_core::error::{LinkError, LoaderError, OrbisError, PatchError};
use ob_memory::{align_up, PageFlags, Reservation, GUEST_PAGE_SIZE};
use std::collections::BTreeMap;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, trace, warn};

/// Host address space reserved per module.
pub const MODULE_RESERVATION_SIZE: u64 = 8 << 30;

/// Alignment of the image base inside the reservation.
pub const MODULE_BASE_ALIGN: u64 = 4 << 30;

/// Export every unresolved import falls back to. libkernel reports the
/// call when it is reached.
pub const UNRESOLVED_CALL_REPORTER: &str = "M0z6Dr6TNnM#libkernel#libkernel";

/// Global symbol lookup across all loaded modules.
pub trait SymbolResolver {
    /// Look `name` up in every module in load order, skipping `skip`.
    fn resolve_symbol(&self, skip: Option<&Module>, hash: u32, name: &str) -> Option<u64>;
}

/// Host-side values baked into a module while it is loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Opaque runtime pointer handed back to the syscall handler.
    pub runtime: u64,
    /// Address of the host syscall handler.
    pub syscall_handler: u64,
    pub tls_index: u16,
    pub fs_mode: FsBaseMode,
    pub host_has_bmi1: bool,
}

/// Absolute address range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Region {
    pub address: u64,
    pub size: u64,
}

impl Region {
    pub fn end(&self) -> u64 {
        self.address + self.size
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address < self.end()
    }
}

/// Choose where the RIP zone goes inside a reservation.
///
/// The zone prefers the gap in front of the image and falls back to the
/// space behind it. Either way its whole extent must stay within a signed
/// 32-bit displacement of the image.
pub fn place_rip_zone(reserved_start: u64, reserved_end: u64, base: u64, load_size: u64) -> Option<u64> {
    let page_mask = GUEST_PAGE_SIZE - 1;
    let reserved_aligned = align_up(reserved_start, GUEST_PAGE_SIZE);
    let image_end = base.checked_add(load_size)?;
    let before = base.checked_sub(reserved_aligned)?;
    let after = reserved_end.saturating_sub(image_end);

    if before >= RIP_ZONE_SIZE {
        let start = if before + load_size < i32::MAX as u64 {
            reserved_aligned
        } else {
            image_end.wrapping_sub(1 << 31) & !page_mask
        };
        if start < reserved_aligned || start + RIP_ZONE_SIZE > base {
            return None;
        }
        return Some(start);
    }

    if after >= RIP_ZONE_SIZE {
        let start = align_up(image_end, GUEST_PAGE_SIZE);
        if start + RIP_ZONE_SIZE > reserved_end {
            return None;
        }
        return Some(start);
    }

    None
}

/// Largest executable and largest non-executable segment.
fn text_and_data(headers: &[Elf64Phdr], base: u64) -> (Region, Region) {
    let largest = |exec: bool| {
        headers
            .iter()
            .filter(|p| (p.p_flags & pf::X != 0) == exec)
            .max_by_key(|p| p.p_memsz)
            .map(|p| Region {
                address: base + p.p_vaddr,
                size: p.p_memsz,
            })
            .unwrap_or_default()
    };
    (largest(true), largest(false))
}

/// An image mapped into host memory.
pub struct Module {
    path: PathBuf,
    name: String,
    order: AtomicU32,
    e_type: u16,
    entry_offset: u64,
    tls_index: u16,

    reservation: Reservation,
    base_address: u64,
    rip_zone_start: u64,
    rip_pointers: u64,
    rip_zone: RipZone,

    text: Region,
    data: Region,
    load_headers: Vec<Elf64Phdr>,
    program_info: ProgramInfo,
    dynamic_info: DynamicInfo,
    dynlibdata: Vec<u8>,

    eh_frame: Option<EhFrameInfo>,
    interrupts: BTreeMap<u64, u8>,
    patch_stats: PatchStats,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("base_address", &format_args!("0x{:x}", self.base_address))
            .field("order", &self.order())
            .finish()
    }
}

impl Module {
    /// Map, patch and protect the image at `path`. Relocation is a separate
    /// step since it needs every other module loaded.
    pub fn load(path: &Path, options: &LoadOptions) -> Result<Module, OrbisError> {
        let elf = ElfFile::open(path)?;
        Self::from_elf(path, &elf, options)
    }

    /// Like [`Module::load`] for an image already read into memory. `path`
    /// only provides the module's name.
    pub fn from_elf(path: &Path, elf: &ElfFile, options: &LoadOptions) -> Result<Module, OrbisError> {
        let program_info = ProgramInfo::parse(&elf.phdrs)?;
        let load_headers: Vec<Elf64Phdr> = elf
            .phdrs
            .iter()
            .filter(|p| is_loadable(p.p_type) && p.p_memsz != 0)
            .copied()
            .collect();

        if elf.header.e_type == et::SCE_DYNEXEC && !program_info.has_dynamic {
            return Err(LoaderError::InvalidElf("Dynamic executable without PT_DYNAMIC".to_string()).into());
        }

        let (dynamic, dynlibdata) = if program_info.has_dynamic {
            if program_info.dynamic_file_size == 0 || program_info.sce_dynlibdata_size == 0 {
                return Err(LoaderError::InvalidDynamic("missing dynamic or dynlibdata contents".to_string()).into());
            }
            let dynamic: Vec<Elf64Dyn> = elf
                .file_range(program_info.dynamic_offset, program_info.dynamic_file_size)?
                .chunks_exact(size_of::<Elf64Dyn>())
                .map(bytemuck::pod_read_unaligned)
                .collect();
            let dynlibdata = elf
                .file_range(program_info.sce_dynlibdata_offset, program_info.sce_dynlibdata_size)?
                .to_vec();
            (dynamic, dynlibdata)
        } else {
            (Vec::new(), Vec::new())
        };

        let load_size = program_info.load_size();
        if program_info.load_end > MODULE_BASE_ALIGN {
            return Err(LoaderError::InvalidElf(format!(
                "Image end 0x{:x} exceeds 4 GiB",
                program_info.load_end
            ))
            .into());
        }

        let reservation = Reservation::new(MODULE_RESERVATION_SIZE)?;
        let base_address = align_up(reservation.base(), MODULE_BASE_ALIGN);
        let rip_zone_start = place_rip_zone(reservation.base(), reservation.end(), base_address, load_size)
            .ok_or(LoaderError::RipZonePlacement)?;

        reservation.commit(rip_zone_start, RIP_POINTERS_PAGE_SIZE, PageFlags::RW)?;
        let rip_pointers = rip_zone_start;
        // Safety: the page was just committed read-write and is page aligned.
        unsafe {
            (rip_pointers as *mut RipPointers).write(RipPointers {
                runtime: options.runtime.into(),
                syscall_handler: options.syscall_handler.into(),
                ..Default::default()
            });
        }

        let free_zone = rip_zone_start + FREE_ZONE_OFFSET;
        reservation.commit(free_zone, FREE_ZONE_SIZE, PageFlags::RWX)?;
        // Safety: committed above and owned by `reservation`, which the
        // module keeps alive alongside the zone.
        let rip_zone = unsafe { RipZone::new(free_zone, FREE_ZONE_SIZE) };

        for phdr in &load_headers {
            let address = base_address + phdr.p_vaddr;
            reservation.commit(address, phdr.p_memsz, PageFlags::RW)?;
            let contents = elf.segment_data(phdr)?;
            // Safety: `[address, address + p_memsz)` was committed RW above
            // and p_filesz <= p_memsz was checked while parsing.
            unsafe {
                std::ptr::copy_nonoverlapping(contents.as_ptr(), address as *mut u8, contents.len());
                std::ptr::write_bytes(
                    (address + phdr.p_filesz) as *mut u8,
                    0,
                    (phdr.p_memsz - phdr.p_filesz) as usize,
                );
            }
        }

        let (text, data) = text_and_data(&load_headers, base_address);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut module = Module {
            path: path.to_path_buf(),
            name,
            order: AtomicU32::new(0),
            e_type: elf.header.e_type,
            entry_offset: elf.header.e_entry,
            tls_index: options.tls_index,
            reservation,
            base_address,
            rip_zone_start,
            rip_pointers,
            rip_zone,
            text,
            data,
            load_headers,
            program_info,
            dynamic_info: DynamicInfo::default(),
            dynlibdata,
            eh_frame: None,
            interrupts: BTreeMap::new(),
            patch_stats: PatchStats::default(),
        };

        module.eh_frame = module.process_eh_frame();
        if module.program_info.has_dynamic {
            module.dynamic_info = DynamicInfo::parse(&dynamic, &module.dynlibdata)?;
        }
        module.analyze_and_patch(options)?;
        module.protect()?;

        info!(
            "Loaded {} at 0x{:x} (text 0x{:x}+0x{:x}, data 0x{:x}+0x{:x})",
            module.name, module.base_address, module.text.address, module.text.size, module.data.address, module.data.size
        );
        Ok(module)
    }

    fn process_eh_frame(&self) -> Option<EhFrameInfo> {
        let header = self.program_info.eh_frame_address;
        if self.program_info.eh_frame_memory_size == 0 {
            return None;
        }
        let phdr = self
            .load_headers
            .iter()
            .find(|p| header >= p.p_vaddr && header < p.p_vaddr + p.p_memsz)?;
        // Safety: the segment is committed and readable for its whole memsz.
        let image = unsafe {
            std::slice::from_raw_parts((self.base_address + phdr.p_vaddr) as *const u8, phdr.p_memsz as usize)
        };
        let info = eh_frame::parse(image, phdr.p_vaddr, header, self.program_info.eh_frame_memory_size);
        if info.is_none() {
            debug!("{}: unusable .eh_frame_hdr at 0x{:x}", self.name, header);
        }
        info
    }

    fn analyze_and_patch(&mut self, options: &LoadOptions) -> Result<(), PatchError> {
        let Some(phdr) = self.load_headers.iter().find(|p| p.p_flags & pf::X != 0).copied() else {
            return Ok(());
        };

        let address = self.base_address + phdr.p_vaddr;
        // Safety: the segment is committed RW until `protect` runs.
        let buffer = unsafe { std::slice::from_raw_parts_mut(address as *mut u8, phdr.p_filesz as usize) };
        let region = text::find_text_region(buffer).ok_or(PatchError::TextRegionNotFound)?;
        debug!(
            "{}: text region 0x{:x}..0x{:x}",
            self.name,
            address + region.start as u64,
            address + region.end as u64
        );

        let mut target = PatchTarget {
            rip_pointers: self.rip_pointers,
            zone: &mut self.rip_zone,
            fs_mode: options.fs_mode,
            host_has_bmi1: options.host_has_bmi1,
            interrupts: &mut self.interrupts,
        };
        self.patch_stats = patcher::patch_text(buffer, address, region, &mut target)?;
        Ok(())
    }

    /// Apply each loadable segment's own protection. Not re-entrant with
    /// [`Module::unprotect`]; callers serialize.
    pub fn protect(&self) -> Result<(), OrbisError> {
        for phdr in &self.load_headers {
            self.reservation
                .protect(self.base_address + phdr.p_vaddr, phdr.p_memsz, PageFlags::from_elf(phdr.p_flags))?;
        }
        Ok(())
    }

    /// Make every loadable segment read-write.
    pub fn unprotect(&self) -> Result<(), OrbisError> {
        for phdr in &self.load_headers {
            self.reservation
                .protect(self.base_address + phdr.p_vaddr, phdr.p_memsz, PageFlags::RW)?;
        }
        Ok(())
    }

    fn symbol(&self, index: u32) -> Option<Elf64Sym> {
        let size = size_of::<Elf64Sym>() as u64;
        let offset = (index as u64).checked_mul(size)?;
        if offset + size > self.dynamic_info.symbol_table_size {
            return None;
        }
        let start = (self.dynamic_info.symbol_table_offset + offset) as usize;
        self.dynlibdata
            .get(start..start + size as usize)
            .map(bytemuck::pod_read_unaligned)
    }

    fn strings(&self) -> StringTable<'_> {
        let start = self.dynamic_info.string_table_offset as usize;
        let end = start + self.dynamic_info.string_table_size as usize;
        StringTable::new(self.dynlibdata.get(start..end).unwrap_or(&[]))
    }

    fn hash_word(&self, index: u64) -> Option<u32> {
        if (index + 1) * 4 > self.dynamic_info.hash_table_size {
            return None;
        }
        let start = (self.dynamic_info.hash_table_offset + index * 4) as usize;
        let bytes = self.dynlibdata.get(start..start + 4)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    fn relocations(&self, offset: u64, size: u64) -> impl Iterator<Item = Elf64Rela> + '_ {
        let start = offset as usize;
        let end = start.saturating_add(size as usize).min(self.dynlibdata.len());
        self.dynlibdata
            .get(start..end)
            .unwrap_or(&[])
            .chunks_exact(size_of::<Elf64Rela>())
            .map(bytemuck::pod_read_unaligned)
    }

    /// `sym#library#module` for a symbol this module exports, or `None` if
    /// it is not exported.
    fn exported_name(&self, symbol: &Elf64Sym) -> Option<String> {
        let local_name = self.strings().get(symbol.st_name as u64)?;
        let encoded = parse_symbol_name(&local_name)?;
        let module = self.dynamic_info.find_module(encoded.module_id)?;
        let library = self.dynamic_info.find_library(encoded.library_id)?;
        if !library.is_export {
            return None;
        }
        Some(format!("{}#{}#{}", encoded.name, library.name, module.name))
    }

    /// Look up an exported symbol by its fully qualified name.
    pub fn resolve_symbol(&self, hash: u32, name: &str) -> Option<u64> {
        let bucket_count = self.hash_word(0)? as u64;
        let chain_count = self.hash_word(1)?;
        if bucket_count == 0 {
            return None;
        }

        let mut index = self.hash_word(2 + hash as u64 % bucket_count)?;
        // A chain can visit each symbol at most once.
        for _ in 0..chain_count {
            if index == STN_UNDEF || index >= chain_count {
                return None;
            }
            let symbol = self.symbol(index)?;
            if self.exported_name(&symbol).as_deref() == Some(name) {
                return Some(self.base_address.wrapping_add(symbol.st_value));
            }
            index = self.hash_word(2 + bucket_count + index as u64)?;
        }
        None
    }

    /// Resolve an import given by its encoded `sym#L#M` name.
    pub fn resolve_external_symbol(&self, local_name: &str, resolver: &dyn SymbolResolver) -> Result<u64, LinkError> {
        let encoded = parse_symbol_name(local_name).ok_or_else(|| LinkError::BadSymbolName(local_name.to_string()))?;
        let module = self
            .dynamic_info
            .find_module(encoded.module_id)
            .ok_or(LinkError::UnknownModuleId(encoded.module_id))?;
        let library = self
            .dynamic_info
            .find_library(encoded.library_id)
            .ok_or(LinkError::UnknownLibraryId(encoded.library_id))?;

        let name = format!("{}#{}#{}", encoded.name, library.name, module.name);
        let hash = elf_hash(&name);
        let symbolic = self.dynamic_info.is_symbolic();

        if symbolic {
            if let Some(value) = self.resolve_symbol(hash, &name) {
                return Ok(value);
            }
        }

        let skip = if symbolic { Some(self) } else { None };
        if let Some(value) = resolver.resolve_symbol(skip, hash, &name) {
            return Ok(value);
        }

        warn!("{}: unresolved import {}", self.name, name);
        resolver
            .resolve_symbol(skip, elf_hash(UNRESOLVED_CALL_REPORTER), UNRESOLVED_CALL_REPORTER)
            .ok_or(LinkError::UnresolvedSymbol(name))
    }

    fn symbol_value(&self, index: u32, resolver: &dyn SymbolResolver) -> Result<u64, LinkError> {
        let symbol = self.symbol(index).ok_or(LinkError::SymbolOutOfRange(index))?;
        match symbol.binding() {
            STB_LOCAL => Ok(self.base_address.wrapping_add(symbol.st_value)),
            STB_GLOBAL | STB_WEAK => {
                let local_name = self
                    .strings()
                    .get(symbol.st_name as u64)
                    .ok_or_else(|| LinkError::BadSymbolName(format!("string offset 0x{:x}", symbol.st_name)))?;
                self.resolve_external_symbol(&local_name, resolver)
            }
            other => Err(LinkError::UnsupportedBinding(other)),
        }
    }

    fn apply(&self, target: u64, write: RelocationWrite) -> Result<(), LinkError> {
        if write == RelocationWrite::None {
            return Ok(());
        }
        if !self.reservation.contains(target, write.width()) {
            return Err(LinkError::TargetOutOfRange(target));
        }
        // Safety: the target lies inside the reservation and every loadable
        // segment is RW while relocating. Offsets into uncommitted pages
        // would fault, which no toolchain emits.
        unsafe { write.apply(target) };
        Ok(())
    }

    fn relocate_rela(&self, resolver: &dyn SymbolResolver) -> Result<usize, LinkError> {
        let mut count = 0;
        for rela in self.relocations(self.dynamic_info.rela_table_offset, self.dynamic_info.rela_table_size) {
            let rel_type = rela.rel_type();
            let symbol = if relocate::uses_symbol(rel_type) {
                self.symbol_value(rela.sym(), resolver)?
            } else {
                0
            };
            let target = self.base_address.wrapping_add(rela.r_offset);
            let write = relocate::rela_write(rel_type, symbol, rela.r_addend, self.base_address, target, self.tls_index)?;
            trace!("rela type {} at 0x{:x}: {:?}", rel_type, target, write);
            self.apply(target, write)?;
            count += 1;
        }
        Ok(count)
    }

    fn relocate_plt(&self, resolver: &dyn SymbolResolver) -> Result<usize, LinkError> {
        let mut count = 0;
        for rela in self.relocations(self.dynamic_info.pltrela_table_offset, self.dynamic_info.pltrela_table_size) {
            let rel_type = rela.rel_type();
            let symbol = if relocate::uses_symbol(rel_type) {
                self.symbol_value(rela.sym(), resolver)?
            } else {
                0
            };
            let target = self.base_address.wrapping_add(rela.r_offset);
            let write = relocate::plt_write(rel_type, symbol, rela.r_addend, self.base_address)?;
            self.apply(target, write)?;
            count += 1;
        }
        Ok(count)
    }

    /// Apply the RELA and PLT tables. Segment protection is restored even
    /// when an entry fails.
    pub fn relocate(&self, resolver: &dyn SymbolResolver) -> Result<(), OrbisError> {
        if !self.program_info.has_dynamic {
            return Ok(());
        }
        self.unprotect()?;
        let result = self
            .relocate_rela(resolver)
            .and_then(|rela| Ok((rela, self.relocate_plt(resolver)?)));
        self.protect()?;

        let (rela, plt) = result?;
        debug!("{}: applied {} rela and {} plt relocations", self.name, rela, plt);
        Ok(())
    }

    /// Publish the guest fs base read by this module's fs trampolines.
    pub fn set_fsbase(&self, value: u64) {
        self.rip_pointers_cell().fsbase.store(value, Ordering::Release);
    }

    pub fn fsbase(&self) -> u64 {
        self.rip_pointers_cell().fsbase.load(Ordering::Acquire)
    }

    fn rip_pointers_cell(&self) -> &RipPointers {
        // Safety: written during load and committed for the module's lifetime.
        unsafe { &*(self.rip_pointers as *const RipPointers) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn order(&self) -> u32 {
        self.order.load(Ordering::Relaxed)
    }

    pub fn set_order(&self, order: u32) {
        self.order.store(order, Ordering::Relaxed);
    }

    pub fn e_type(&self) -> u16 {
        self.e_type
    }

    pub fn is_executable(&self) -> bool {
        matches!(self.e_type, et::EXEC | et::SCE_EXEC | et::SCE_DYNEXEC)
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    pub fn entry_point(&self) -> u64 {
        self.base_address.wrapping_add(self.entry_offset)
    }

    pub fn tls_index(&self) -> u16 {
        self.tls_index
    }

    pub fn text(&self) -> Region {
        self.text
    }

    pub fn data(&self) -> Region {
        self.data
    }

    /// Host range reserved for the module, image and RIP zone included.
    pub fn reserved(&self) -> Region {
        Region {
            address: self.reservation.base(),
            size: self.reservation.size(),
        }
    }

    pub fn rip_zone(&self) -> Region {
        Region {
            address: self.rip_zone_start,
            size: RIP_ZONE_SIZE,
        }
    }

    pub fn rip_pointers(&self) -> u64 {
        self.rip_pointers
    }

    pub fn trampoline_bytes_used(&self) -> u64 {
        self.rip_zone.used()
    }

    pub fn program_info(&self) -> &ProgramInfo {
        &self.program_info
    }

    pub fn dynamic_info(&self) -> &DynamicInfo {
        &self.dynamic_info
    }

    pub fn eh_frame(&self) -> Option<&EhFrameInfo> {
        self.eh_frame.as_ref()
    }

    /// Absolute `(header, header_size, frame_data, frame_data_size)` of the
    /// unwind tables.
    pub fn eh_frame_ranges(&self) -> Option<(u64, u64, u64, u64)> {
        self.eh_frame.map(|eh| {
            (
                self.base_address + eh.header_offset,
                eh.header_size,
                self.base_address + eh.data_offset,
                eh.data_size(),
            )
        })
    }

    /// Absolute address and size of the process parameters.
    pub fn proc_param(&self) -> Option<Region> {
        (self.program_info.sce_proc_param_size != 0).then(|| Region {
            address: self.base_address + self.program_info.sce_proc_param_address,
            size: self.program_info.sce_proc_param_size,
        })
    }

    pub fn init_address(&self) -> Option<u64> {
        self.dynamic_info.init_offset.map(|o| self.base_address + o)
    }

    pub fn fini_address(&self) -> Option<u64> {
        self.dynamic_info.fini_offset.map(|o| self.base_address + o)
    }

    /// Patched `int n` sites.
    pub fn interrupts(&self) -> &BTreeMap<u64, u8> {
        &self.interrupts
    }

    pub fn patch_stats(&self) -> PatchStats {
        self.patch_stats
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address < self.base_address + self.program_info.load_end
    }
}
