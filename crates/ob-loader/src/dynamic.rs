//! Dynamic table decoder
//!
//! Orbis images keep their symbol, string, hash and relocation tables in the
//! `SCE_DYNLIBDATA` segment; the `PT_DYNAMIC` entries only carry offsets into
//! it, plus the module and library descriptors used by encoded symbol names.

use crate::elf::Elf64Dyn;
use bitflags::bitflags;
use ob_core::error::LoaderError;

/// Dynamic entry tags
pub mod dt {
    pub const NULL: i64 = 0;
    pub const NEEDED: i64 = 1;
    pub const PLTRELSZ: i64 = 2;
    pub const PLTGOT: i64 = 3;
    pub const RELA: i64 = 7;
    pub const RELASZ: i64 = 8;
    pub const RELAENT: i64 = 9;
    pub const STRSZ: i64 = 10;
    pub const SYMENT: i64 = 11;
    pub const INIT: i64 = 12;
    pub const FINI: i64 = 13;
    pub const SONAME: i64 = 14;
    pub const SYMBOLIC: i64 = 16;
    pub const PLTREL: i64 = 20;
    pub const DEBUG: i64 = 21;
    pub const TEXTREL: i64 = 22;
    pub const INIT_ARRAY: i64 = 25;
    pub const FINI_ARRAY: i64 = 26;
    pub const INIT_ARRAYSZ: i64 = 27;
    pub const FINI_ARRAYSZ: i64 = 28;
    pub const FLAGS: i64 = 30;
    pub const PREINIT_ARRAY: i64 = 32;
    pub const PREINIT_ARRAYSZ: i64 = 33;
    pub const UNKNOWN_60000005: i64 = 0x6000_0005;
    pub const RELACOUNT: i64 = 0x6fff_fff9;
    pub const FLAGS_1: i64 = 0x6fff_fffb;

    pub const SCE_FINGERPRINT: i64 = 0x6100_0007;
    pub const SCE_ORIGINAL_FILENAME: i64 = 0x6100_0009;
    pub const SCE_MODULE_INFO: i64 = 0x6100_000D;
    pub const SCE_NEEDED_MODULE: i64 = 0x6100_000F;
    pub const SCE_MODULE_ATTR: i64 = 0x6100_0011;
    pub const SCE_EXPORT_LIB: i64 = 0x6100_0013;
    pub const SCE_IMPORT_LIB: i64 = 0x6100_0015;
    pub const SCE_EXPORT_LIB_ATTR: i64 = 0x6100_0017;
    pub const SCE_IMPORT_LIB_ATTR: i64 = 0x6100_0019;
    pub const SCE_HASH: i64 = 0x6100_0025;
    pub const SCE_PLTGOT: i64 = 0x6100_0027;
    pub const SCE_JMPREL: i64 = 0x6100_0029;
    pub const SCE_PLTREL: i64 = 0x6100_002B;
    pub const SCE_PLTRELSZ: i64 = 0x6100_002D;
    pub const SCE_RELA: i64 = 0x6100_002F;
    pub const SCE_RELASZ: i64 = 0x6100_0031;
    pub const SCE_RELAENT: i64 = 0x6100_0033;
    pub const SCE_STRTAB: i64 = 0x6100_0035;
    pub const SCE_STRSZ: i64 = 0x6100_0037;
    pub const SCE_SYMTAB: i64 = 0x6100_0039;
    pub const SCE_SYMENT: i64 = 0x6100_003B;
    pub const SCE_HASHSZ: i64 = 0x6100_003D;
    pub const SCE_SYMTABSZ: i64 = 0x6100_003F;
}

const DF_SYMBOLIC: u64 = 0x2;
const DF_TEXTREL: u64 = 0x4;
const DF_BIND_NOW: u64 = 0x8;
const DF_1_NOW: u64 = 0x1;
const DF_1_NODELETE: u64 = 0x8;
const DF_1_LOADFLTR: u64 = 0x10;
const DF_1_NOOPEN: u64 = 0x40;

const RELA_SIZE: u64 = 24;
const SYM_SIZE: u64 = 24;

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DynamicFlags: u32 {
        const HAS_TEXT_RELOCATIONS = 1 << 3;
        const IS_SYMBOLIC = 1 << 4;
        const BIND_NOW = 1 << 5;
        const NO_DELETE = 1 << 11;
        const NO_OPEN = 1 << 12;
        const LOAD_FILTER = 1 << 13;
    }
}

/// Module descriptor (exported or imported).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub name_offset: u32,
    pub version_minor: u8,
    pub version_major: u8,
    pub id: u16,
    pub attributes: u16,
}

impl ModuleInfo {
    fn unpack(value: u64) -> Self {
        Self {
            name: String::new(),
            name_offset: value as u32,
            version_minor: (value >> 32) as u8,
            version_major: (value >> 40) as u8,
            id: (value >> 48) as u16,
            attributes: 0,
        }
    }
}

/// Library descriptor (exported or imported).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryInfo {
    pub name: String,
    pub name_offset: u32,
    pub version: u16,
    pub id: u16,
    pub attributes: u16,
    pub is_export: bool,
}

impl LibraryInfo {
    fn unpack(value: u64, is_export: bool) -> Self {
        Self {
            name: String::new(),
            name_offset: value as u32,
            version: (value >> 32) as u16,
            id: (value >> 48) as u16,
            attributes: 0,
            is_export,
        }
    }
}

/// NUL-terminated strings addressed by offset.
#[derive(Clone, Copy)]
pub struct StringTable<'a> {
    data: &'a [u8],
}

impl<'a> StringTable<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn get(&self, offset: u64) -> Option<String> {
        let tail = self.data.get(offset as usize..)?;
        if tail.is_empty() {
            return None;
        }
        let len = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Some(String::from_utf8_lossy(&tail[..len]).into_owned())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DynamicInfo {
    pub rela_table_offset: u64,
    pub rela_table_size: u64,
    pub pltrela_table_offset: u64,
    pub pltrela_table_size: u64,
    pub string_table_offset: u64,
    pub string_table_size: u64,
    pub symbol_table_offset: u64,
    pub symbol_table_size: u64,
    pub hash_table_offset: u64,
    pub hash_table_size: u64,

    pub flags: DynamicFlags,
    pub shared_object_names: Vec<String>,
    pub shared_object_name: String,
    pub modules: Vec<ModuleInfo>,
    pub libraries: Vec<LibraryInfo>,
    pub pltgot_offset: u64,
    pub init_offset: Option<u64>,
    pub fini_offset: Option<u64>,
    pub fingerprint: [u8; 20],
    pub output_image_name: String,
}

#[derive(Default)]
struct Required {
    fingerprint: bool,
    output_name: bool,
    export_module: bool,
    hash_offset: bool,
    hash_size: bool,
    pltgot: bool,
    pltrel: bool,
    pltrela_offset: bool,
    pltrela_size: bool,
    rela_offset: bool,
    rela_size: bool,
    rela_entry: bool,
    string_offset: bool,
    string_size: bool,
    symbol_offset: bool,
    symbol_size: bool,
    symbol_entry: bool,
}

impl Required {
    fn first_missing(&self) -> Option<&'static str> {
        [
            (self.fingerprint, "SCE_FINGERPRINT"),
            (self.output_name, "SCE_ORIGINAL_FILENAME"),
            (self.export_module, "SCE_MODULE_INFO"),
            (self.pltgot, "PLTGOT"),
            (self.pltrel, "PLTREL"),
            (self.pltrela_offset, "SCE_JMPREL"),
            (self.pltrela_size, "PLTRELSZ"),
            (self.rela_offset, "SCE_RELA"),
            (self.rela_size, "RELASZ"),
            (self.rela_entry, "RELAENT"),
            (self.string_offset, "SCE_STRTAB"),
            (self.string_size, "STRSZ"),
            (self.symbol_offset, "SCE_SYMTAB"),
            (self.symbol_size, "SCE_SYMTABSZ"),
            (self.symbol_entry, "SYMENT"),
            (self.hash_offset, "SCE_HASH"),
            (self.hash_size, "SCE_HASHSZ"),
        ]
        .iter()
        .find(|(present, _)| !present)
        .map(|(_, name)| *name)
    }
}

fn live_entries(entries: &[Elf64Dyn]) -> impl Iterator<Item = &Elf64Dyn> {
    entries.iter().take_while(|e| e.d_tag != dt::NULL)
}

impl DynamicInfo {
    /// Decode `entries` against the dynlibdata segment `data`.
    pub fn parse(entries: &[Elf64Dyn], data: &[u8]) -> Result<Self, LoaderError> {
        if entries.is_empty() {
            return Err(LoaderError::InvalidDynamic("empty dynamic table".to_string()));
        }

        let mut info = Self::default();
        info.prepare(entries)?;
        info.validate_tables(data.len() as u64)?;

        let strings = StringTable::new(
            &data[info.string_table_offset as usize
                ..(info.string_table_offset + info.string_table_size) as usize],
        );
        let string = |offset: u64, what: &str| {
            strings.get(offset).ok_or_else(|| {
                LoaderError::InvalidDynamic(format!("{} name offset 0x{:x} out of range", what, offset))
            })
        };

        for entry in live_entries(entries) {
            let value = entry.d_val;
            match entry.d_tag {
                dt::NEEDED => info.shared_object_names.push(string(value, "needed")?),
                dt::PLTGOT | dt::SCE_PLTGOT => info.pltgot_offset = value,
                dt::INIT => info.init_offset = Some(value),
                dt::FINI => info.fini_offset = Some(value),
                dt::SONAME => info.shared_object_name = strings.get(value).unwrap_or_default(),
                dt::SYMBOLIC => info.flags |= DynamicFlags::IS_SYMBOLIC,
                dt::TEXTREL => info.flags |= DynamicFlags::HAS_TEXT_RELOCATIONS,
                dt::FLAGS => {
                    if value & DF_SYMBOLIC != 0 {
                        info.flags |= DynamicFlags::IS_SYMBOLIC;
                    }
                    if value & DF_TEXTREL != 0 {
                        info.flags |= DynamicFlags::HAS_TEXT_RELOCATIONS;
                    }
                    if value & DF_BIND_NOW != 0 {
                        info.flags |= DynamicFlags::BIND_NOW;
                    }
                }
                dt::FLAGS_1 => {
                    if value & DF_1_NOW != 0 {
                        info.flags |= DynamicFlags::BIND_NOW;
                    }
                    if value & DF_1_NODELETE != 0 {
                        info.flags |= DynamicFlags::NO_DELETE;
                    }
                    if value & DF_1_LOADFLTR != 0 {
                        info.flags |= DynamicFlags::LOAD_FILTER;
                    }
                    if value & DF_1_NOOPEN != 0 {
                        info.flags |= DynamicFlags::NO_OPEN;
                    }
                }
                dt::SCE_FINGERPRINT => {
                    if let Some(bytes) = value
                        .checked_add(20)
                        .filter(|&end| end <= data.len() as u64)
                        .map(|end| &data[value as usize..end as usize])
                    {
                        info.fingerprint.copy_from_slice(bytes);
                    }
                }
                dt::SCE_ORIGINAL_FILENAME => {
                    info.output_image_name = string(value, "output image")?;
                }
                dt::SCE_MODULE_INFO | dt::SCE_NEEDED_MODULE => {
                    let mut module = ModuleInfo::unpack(value);
                    module.name = string(module.name_offset as u64, "module")?;
                    info.modules.push(module);
                }
                dt::SCE_MODULE_ATTR => {
                    let id = (value >> 48) as u16;
                    let module = info
                        .modules
                        .iter_mut()
                        .find(|m| m.id == id)
                        .ok_or_else(|| {
                            LoaderError::InvalidDynamic(format!("attributes for unknown module {}", id))
                        })?;
                    module.attributes = value as u16;
                }
                dt::SCE_EXPORT_LIB | dt::SCE_IMPORT_LIB => {
                    let mut library = LibraryInfo::unpack(value, entry.d_tag == dt::SCE_EXPORT_LIB);
                    library.name = string(library.name_offset as u64, "library")?;
                    info.libraries.push(library);
                }
                dt::SCE_EXPORT_LIB_ATTR | dt::SCE_IMPORT_LIB_ATTR => {
                    let id = (value >> 48) as u16;
                    let library = info
                        .libraries
                        .iter_mut()
                        .find(|l| l.id == id)
                        .ok_or_else(|| {
                            LoaderError::InvalidDynamic(format!("attributes for unknown library {}", id))
                        })?;
                    library.attributes = value as u16;
                }
                // Consumed by the first pass or carrying nothing we use.
                _ => {}
            }
        }

        Ok(info)
    }

    /// Record table offsets and sizes and check every required tag is present.
    fn prepare(&mut self, entries: &[Elf64Dyn]) -> Result<(), LoaderError> {
        let mut seen = Required::default();

        for entry in live_entries(entries) {
            let value = entry.d_val;
            match entry.d_tag {
                dt::NEEDED
                | dt::INIT
                | dt::FINI
                | dt::SONAME
                | dt::SYMBOLIC
                | dt::DEBUG
                | dt::TEXTREL
                | dt::INIT_ARRAY
                | dt::FINI_ARRAY
                | dt::INIT_ARRAYSZ
                | dt::FINI_ARRAYSZ
                | dt::FLAGS
                | dt::PREINIT_ARRAY
                | dt::PREINIT_ARRAYSZ
                | dt::UNKNOWN_60000005
                | dt::SCE_NEEDED_MODULE
                | dt::SCE_MODULE_ATTR
                | dt::SCE_EXPORT_LIB
                | dt::SCE_IMPORT_LIB
                | dt::SCE_EXPORT_LIB_ATTR
                | dt::SCE_IMPORT_LIB_ATTR
                | dt::RELACOUNT
                | dt::FLAGS_1 => {}
                dt::PLTRELSZ | dt::SCE_PLTRELSZ => {
                    self.pltrela_table_size = value;
                    seen.pltrela_size = true;
                }
                dt::RELASZ | dt::SCE_RELASZ => {
                    self.rela_table_size = value;
                    seen.rela_size = true;
                }
                dt::RELAENT | dt::SCE_RELAENT => {
                    if value != RELA_SIZE {
                        return Err(LoaderError::InvalidDynamic(format!(
                            "RELAENT is {}, expected {}",
                            value, RELA_SIZE
                        )));
                    }
                    seen.rela_entry = true;
                }
                dt::STRSZ | dt::SCE_STRSZ => {
                    self.string_table_size = value;
                    seen.string_size = true;
                }
                dt::SYMENT | dt::SCE_SYMENT => {
                    if value != SYM_SIZE {
                        return Err(LoaderError::InvalidDynamic(format!(
                            "SYMENT is {}, expected {}",
                            value, SYM_SIZE
                        )));
                    }
                    seen.symbol_entry = true;
                }
                dt::SCE_HASH => {
                    self.hash_table_offset = value;
                    seen.hash_offset = true;
                }
                dt::SCE_JMPREL => {
                    self.pltrela_table_offset = value;
                    seen.pltrela_offset = true;
                }
                dt::PLTREL | dt::SCE_PLTREL => {
                    if value != dt::RELA as u64 {
                        return Err(LoaderError::InvalidDynamic(format!(
                            "PLTREL is {}, only RELA is supported",
                            value
                        )));
                    }
                    seen.pltrel = true;
                }
                dt::SCE_RELA => {
                    self.rela_table_offset = value;
                    seen.rela_offset = true;
                }
                dt::SCE_STRTAB => {
                    self.string_table_offset = value;
                    seen.string_offset = true;
                }
                dt::SCE_SYMTAB => {
                    self.symbol_table_offset = value;
                    seen.symbol_offset = true;
                }
                dt::SCE_HASHSZ => {
                    self.hash_table_size = value;
                    seen.hash_size = true;
                }
                dt::SCE_SYMTABSZ => {
                    self.symbol_table_size = value;
                    seen.symbol_size = true;
                }
                dt::SCE_FINGERPRINT => seen.fingerprint = true,
                dt::SCE_ORIGINAL_FILENAME => seen.output_name = true,
                dt::SCE_MODULE_INFO => seen.export_module = true,
                dt::PLTGOT | dt::SCE_PLTGOT => seen.pltgot = true,
                tag => {
                    return Err(LoaderError::InvalidDynamic(format!(
                        "unknown dynamic tag 0x{:x}",
                        tag
                    )))
                }
            }
        }

        match seen.first_missing() {
            Some(tag) => Err(LoaderError::MissingDynamicTag(tag)),
            None => Ok(()),
        }
    }

    fn validate_tables(&self, data_size: u64) -> Result<(), LoaderError> {
        let tables = [
            ("string", self.string_table_offset, self.string_table_size),
            ("symbol", self.symbol_table_offset, self.symbol_table_size),
            ("hash", self.hash_table_offset, self.hash_table_size),
            ("rela", self.rela_table_offset, self.rela_table_size),
            ("pltrela", self.pltrela_table_offset, self.pltrela_table_size),
        ];
        for (name, offset, size) in tables {
            if offset.checked_add(size).map_or(true, |end| end > data_size) {
                return Err(LoaderError::InvalidDynamic(format!(
                    "{} table 0x{:x}+0x{:x} outside dynlibdata (0x{:x} bytes)",
                    name, offset, size, data_size
                )));
            }
        }
        Ok(())
    }

    pub fn find_module(&self, id: u16) -> Option<&ModuleInfo> {
        self.modules.iter().find(|m| m.id == id)
    }

    pub fn find_library(&self, id: u16) -> Option<&LibraryInfo> {
        self.libraries.iter().find(|l| l.id == id)
    }

    pub fn is_symbolic(&self) -> bool {
        self.flags.contains(DynamicFlags::IS_SYMBOLIC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(d_tag: i64, d_val: u64) -> Elf64Dyn {
        Elf64Dyn { d_tag, d_val }
    }

    /// Strings: 0 "", 1 "libkernel", 11 "libc.prx", 20 "out.elf"
    fn strings() -> Vec<u8> {
        b"\0libkernel\0libc.prx\0out.elf\0".to_vec()
    }

    fn required(strsz: u64) -> Vec<Elf64Dyn> {
        vec![
            entry(dt::SCE_FINGERPRINT, 0x40),
            entry(dt::SCE_ORIGINAL_FILENAME, 20),
            entry(dt::SCE_MODULE_INFO, 1 | (1u64 << 40) | (0u64 << 48)),
            entry(dt::SCE_PLTGOT, 0x1000),
            entry(dt::SCE_PLTREL, dt::RELA as u64),
            entry(dt::SCE_JMPREL, 0),
            entry(dt::SCE_PLTRELSZ, 0),
            entry(dt::SCE_RELA, 0),
            entry(dt::SCE_RELASZ, 0),
            entry(dt::SCE_RELAENT, 24),
            entry(dt::SCE_STRTAB, 0),
            entry(dt::SCE_STRSZ, strsz),
            entry(dt::SCE_SYMTAB, 0),
            entry(dt::SCE_SYMTABSZ, 0),
            entry(dt::SCE_SYMENT, 24),
            entry(dt::SCE_HASH, 0),
            entry(dt::SCE_HASHSZ, 0),
        ]
    }

    fn data() -> Vec<u8> {
        let mut data = strings();
        data.resize(0x40, 0);
        data.extend((0..20u8).collect::<Vec<_>>());
        data
    }

    #[test]
    fn test_minimal_table() {
        let strsz = strings().len() as u64;
        let mut entries = required(strsz);
        entries.push(entry(dt::NEEDED, 11));
        entries.push(entry(dt::SCE_EXPORT_LIB, 1 | (1u64 << 32) | (0u64 << 48)));
        entries.push(entry(dt::SCE_EXPORT_LIB_ATTR, 0x9 | (0u64 << 48)));
        entries.push(entry(dt::SCE_MODULE_ATTR, 0x1 | (0u64 << 48)));
        entries.push(entry(dt::SYMBOLIC, 0));
        entries.push(entry(dt::INIT, 0x200));
        entries.push(entry(dt::NULL, 0));
        entries.push(entry(0x7777_7777, 0)); // after DT_NULL, ignored

        let info = DynamicInfo::parse(&entries, &data()).unwrap();
        assert_eq!(info.shared_object_names, vec!["libc.prx".to_string()]);
        assert_eq!(info.output_image_name, "out.elf");
        assert_eq!(info.pltgot_offset, 0x1000);
        assert_eq!(info.init_offset, Some(0x200));
        assert_eq!(info.fini_offset, None);
        assert!(info.is_symbolic());

        let module = info.find_module(0).unwrap();
        assert_eq!(module.name, "libkernel");
        assert_eq!(module.version_major, 1);
        assert_eq!(module.attributes, 1);

        let library = info.find_library(0).unwrap();
        assert!(library.is_export);
        assert_eq!(library.version, 1);
        assert_eq!(library.attributes, 9);

        assert_eq!(info.fingerprint[0], 0);
        assert_eq!(info.fingerprint[19], 19);
    }

    #[test]
    fn test_missing_required_tag() {
        let mut entries = required(strings().len() as u64);
        entries.retain(|e| e.d_tag != dt::SCE_HASHSZ);
        let err = DynamicInfo::parse(&entries, &data()).unwrap_err();
        assert!(matches!(err, LoaderError::MissingDynamicTag("SCE_HASHSZ")));
    }

    #[test]
    fn test_rejects_bad_entry_sizes() {
        let mut entries = required(strings().len() as u64);
        entries.push(entry(dt::RELAENT, 16));
        assert!(DynamicInfo::parse(&entries, &data()).is_err());

        let mut entries = required(strings().len() as u64);
        entries.push(entry(dt::PLTREL, 17)); // DT_REL
        assert!(DynamicInfo::parse(&entries, &data()).is_err());
    }

    #[test]
    fn test_rejects_unknown_tag_and_attr() {
        let mut entries = required(strings().len() as u64);
        entries.push(entry(0x6100_0099, 0));
        assert!(DynamicInfo::parse(&entries, &data()).is_err());

        let mut entries = required(strings().len() as u64);
        entries.push(entry(dt::SCE_IMPORT_LIB_ATTR, 7u64 << 48));
        assert!(DynamicInfo::parse(&entries, &data()).is_err());
    }

    #[test]
    fn test_flags() {
        let mut entries = required(strings().len() as u64);
        entries.push(entry(dt::FLAGS, DF_TEXTREL | DF_BIND_NOW));
        entries.push(entry(dt::FLAGS_1, DF_1_NODELETE | DF_1_NOOPEN));
        let info = DynamicInfo::parse(&entries, &data()).unwrap();
        assert_eq!(
            info.flags,
            DynamicFlags::HAS_TEXT_RELOCATIONS
                | DynamicFlags::BIND_NOW
                | DynamicFlags::NO_DELETE
                | DynamicFlags::NO_OPEN
        );
        assert!(!info.is_symbolic());
    }

    #[test]
    fn test_string_table() {
        let bytes = strings();
        let table = StringTable::new(&bytes);
        assert_eq!(table.get(1).as_deref(), Some("libkernel"));
        assert_eq!(table.get(0).as_deref(), Some(""));
        assert_eq!(table.get(bytes.len() as u64), None);
    }
}
