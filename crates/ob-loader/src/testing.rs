//! Synthetic Orbis images for tests
//!
//! [`ImageBuilder`] lays out a minimal shared object or dynamic executable:
//! an RX segment holding the caller's code followed by the `.init` tail, PLT
//! and `.fini` head the text finder looks for, an RW data segment, and the
//! dynamic table with its dynlibdata.

use crate::dynamic::dt;
use crate::elf::{
    et, pf, pt, r_x86_64, Elf64Dyn, Elf64Header, Elf64Phdr, Elf64Rela, Elf64Sym, EM_X86_64, ELFCLASS64,
    ELFDATA2LSB, ELF_MAGIC, EV_CURRENT, STB_GLOBAL, STB_LOCAL,
};
use crate::symbol::{elf_hash, encode_symbol_name};
use crate::text::{pattern_bytes, plt_bytes, SO_FINI_PROLOGUE, SO_INIT_EPILOGUE};
use bytemuck::bytes_of;
use ob_memory::{align_up, GUEST_PAGE_SIZE};
use std::path::{Path, PathBuf};

const TEXT_FILE_OFFSET: u64 = GUEST_PAGE_SIZE;
const STT_FUNC: u8 = 2;
const STT_OBJECT: u8 = 1;

struct Import {
    module: String,
    library: String,
}

struct Symbol {
    name: String,
    /// Name the hash table is keyed on: `sym#library#module` for exports.
    hash_name: String,
    value: u64,
    binding: u8,
    sym_type: u8,
}

/// Builder for a loadable test image.
pub struct ImageBuilder {
    e_type: u16,
    module_name: String,
    entry: u64,
    code: Vec<u8>,
    data: Vec<u8>,
    bss: u64,
    symbolic: bool,
    plt_entries: usize,
    needed: Vec<String>,
    imports: Vec<Import>,
    /// Index 0 is the null symbol.
    symbols: Vec<Symbol>,
    relas: Vec<Elf64Rela>,
    plt_relas: Vec<Elf64Rela>,
}

impl ImageBuilder {
    /// Shared object exporting library `module_name` from module
    /// `module_name`, both with id 0.
    pub fn new(module_name: &str) -> Self {
        Self {
            e_type: et::SCE_DYNAMIC,
            module_name: module_name.to_string(),
            entry: 0,
            code: vec![0xC3],
            data: vec![0; 16],
            bss: 0,
            symbolic: false,
            plt_entries: 0,
            needed: Vec::new(),
            imports: Vec::new(),
            symbols: vec![Symbol {
                name: String::new(),
                hash_name: String::new(),
                value: 0,
                binding: STB_LOCAL,
                sym_type: 0,
            }],
            relas: Vec::new(),
            plt_relas: Vec::new(),
        }
    }

    pub fn executable(mut self) -> Self {
        self.e_type = et::SCE_DYNEXEC;
        self
    }

    /// Entry point as an offset into the code.
    pub fn entry(mut self, offset: u64) -> Self {
        self.entry = offset;
        self
    }

    /// Code placed at the very start of the executable segment.
    pub fn code(mut self, code: &[u8]) -> Self {
        self.code = code.to_vec();
        self
    }

    pub fn data(mut self, data: &[u8]) -> Self {
        self.data = data.to_vec();
        self
    }

    pub fn bss(mut self, size: u64) -> Self {
        self.bss = size;
        self
    }

    pub fn symbolic(mut self) -> Self {
        self.symbolic = true;
        self
    }

    pub fn plt_entries(mut self, count: usize) -> Self {
        self.plt_entries = count;
        self
    }

    /// Add a `DT_NEEDED` entry for another image file.
    pub fn needed(mut self, file_name: &str) -> Self {
        self.needed.push(file_name.to_string());
        self
    }

    /// Virtual address of the first byte of the data segment.
    pub fn data_vaddr(&self) -> u64 {
        align_up(self.text_contents().len() as u64, GUEST_PAGE_SIZE)
    }

    /// Export `name` from this module's library at image offset `value`.
    pub fn export(&mut self, name: &str, value: u64) -> u32 {
        let full_name = format!("{}#{}#{}", name, self.module_name, self.module_name);
        self.push_symbol(encode_symbol_name(name, 0, 0), full_name, value, STB_GLOBAL, STT_FUNC)
    }

    /// Import `name` from `library` of `module`.
    pub fn import(&mut self, name: &str, library: &str, module: &str) -> u32 {
        let id = match self
            .imports
            .iter()
            .position(|i| i.module == module && i.library == library)
        {
            Some(index) => index + 1,
            None => {
                self.imports.push(Import {
                    module: module.to_string(),
                    library: library.to_string(),
                });
                self.imports.len()
            }
        } as u16;
        let encoded = encode_symbol_name(name, id, id);
        self.push_symbol(encoded.clone(), encoded, 0, STB_GLOBAL, STT_FUNC)
    }

    /// Local symbol at image offset `value`.
    pub fn local(&mut self, value: u64) -> u32 {
        self.push_symbol(String::new(), String::new(), value, STB_LOCAL, STT_OBJECT)
    }

    /// Raw symbol with an arbitrary name.
    pub fn raw_symbol(&mut self, name: &str, value: u64, binding: u8) -> u32 {
        self.push_symbol(name.to_string(), name.to_string(), value, binding, STT_FUNC)
    }

    fn push_symbol(&mut self, name: String, hash_name: String, value: u64, binding: u8, sym_type: u8) -> u32 {
        self.symbols.push(Symbol {
            name,
            hash_name,
            value,
            binding,
            sym_type,
        });
        (self.symbols.len() - 1) as u32
    }

    pub fn rela(&mut self, offset: u64, rel_type: u32, symbol: u32, addend: i64) {
        self.relas.push(Elf64Rela {
            r_offset: offset,
            r_info: ((symbol as u64) << 32) | rel_type as u64,
            r_addend: addend,
        });
    }

    pub fn jump_slot(&mut self, offset: u64, symbol: u32) {
        self.plt_relas.push(Elf64Rela {
            r_offset: offset,
            r_info: ((symbol as u64) << 32) | r_x86_64::JUMP_SLOT as u64,
            r_addend: 0,
        });
    }

    fn text_contents(&self) -> Vec<u8> {
        let mut text = self.code.clone();
        text.extend(pattern_bytes(&SO_INIT_EPILOGUE));
        text.resize(align_up(text.len() as u64, 16) as usize, 0xCC);
        text.extend(plt_bytes(self.plt_entries));
        text.extend(pattern_bytes(&SO_FINI_PROLOGUE));
        text
    }

    /// Returns the dynlibdata bytes and the dynamic table describing them.
    fn dynamic_contents(&self) -> (Vec<u8>, Vec<Elf64Dyn>) {
        let mut data = Vec::new();
        let mut entries = Vec::new();
        let mut tag = |d_tag: i64, d_val: u64| entries.push(Elf64Dyn { d_tag, d_val });

        // Fingerprint first, at offset 0.
        data.extend_from_slice(&[0xAB; 20]);

        let string_offset = data.len() as u64;
        let mut strings = vec![0u8];
        let mut intern = |s: &str| {
            if s.is_empty() {
                return 0u64;
            }
            let offset = strings.len() as u64;
            strings.extend_from_slice(s.as_bytes());
            strings.push(0);
            offset
        };

        let filename = intern(&format!("{}.prx", self.module_name));
        let own_name = intern(&self.module_name);
        let needed_names: Vec<u64> = self.needed.iter().map(|n| intern(n)).collect();
        let import_names: Vec<(u64, u64)> = self
            .imports
            .iter()
            .map(|i| (intern(&i.module), intern(&i.library)))
            .collect();
        let symbol_names: Vec<u64> = self.symbols.iter().map(|s| intern(&s.name)).collect();
        data.extend_from_slice(&strings);

        let symbol_offset = align_up(data.len() as u64, 8);
        data.resize(symbol_offset as usize, 0);
        for (symbol, name) in self.symbols.iter().zip(&symbol_names) {
            let symbol = Elf64Sym {
                st_name: *name as u32,
                st_info: (symbol.binding << 4) | symbol.sym_type,
                st_other: 0,
                st_shndx: if symbol.value != 0 || symbol.binding == STB_LOCAL { 1 } else { 0 },
                st_value: symbol.value,
                st_size: 0,
            };
            data.extend_from_slice(bytes_of(&symbol));
        }
        let symbol_size = data.len() as u64 - symbol_offset;

        let hash_offset = data.len() as u64;
        let count = self.symbols.len() as u32;
        let bucket_count = count.max(1);
        let mut buckets = vec![0u32; bucket_count as usize];
        let mut chains = vec![0u32; count as usize];
        for index in (1..count).rev() {
            let name = &self.symbols[index as usize].hash_name;
            let bucket = (elf_hash(name) % bucket_count) as usize;
            chains[index as usize] = buckets[bucket];
            buckets[bucket] = index;
        }
        for word in [bucket_count, count].iter().chain(&buckets).chain(&chains) {
            data.extend_from_slice(&word.to_le_bytes());
        }
        let hash_size = data.len() as u64 - hash_offset;

        let rela_offset = align_up(data.len() as u64, 8);
        data.resize(rela_offset as usize, 0);
        for rela in &self.relas {
            data.extend_from_slice(bytes_of(rela));
        }
        let rela_size = data.len() as u64 - rela_offset;

        let plt_offset = data.len() as u64;
        for rela in &self.plt_relas {
            data.extend_from_slice(bytes_of(rela));
        }
        let plt_size = data.len() as u64 - plt_offset;

        for name in needed_names {
            tag(dt::NEEDED, name);
        }
        tag(dt::SCE_FINGERPRINT, 0);
        tag(dt::SCE_ORIGINAL_FILENAME, filename);
        tag(dt::SCE_MODULE_INFO, own_name | (1 << 40));
        tag(dt::SCE_EXPORT_LIB, own_name | (1 << 32));
        for (index, (module, library)) in import_names.iter().enumerate() {
            let id = (index as u64 + 1) << 48;
            tag(dt::SCE_NEEDED_MODULE, module | (1 << 40) | id);
            tag(dt::SCE_IMPORT_LIB, library | (1 << 32) | id);
        }
        if self.symbolic {
            tag(dt::SYMBOLIC, 0);
        }
        tag(dt::SCE_PLTGOT, 0);
        tag(dt::SCE_PLTREL, dt::RELA as u64);
        tag(dt::SCE_JMPREL, plt_offset);
        tag(dt::SCE_PLTRELSZ, plt_size);
        tag(dt::SCE_RELA, rela_offset);
        tag(dt::SCE_RELASZ, rela_size);
        tag(dt::SCE_RELAENT, 24);
        tag(dt::SCE_STRTAB, string_offset);
        tag(dt::SCE_STRSZ, strings.len() as u64);
        tag(dt::SCE_SYMTAB, symbol_offset);
        tag(dt::SCE_SYMTABSZ, symbol_size);
        tag(dt::SCE_SYMENT, 24);
        tag(dt::SCE_HASH, hash_offset);
        tag(dt::SCE_HASHSZ, hash_size);
        tag(dt::NULL, 0);

        (data, entries)
    }

    pub fn build(&self) -> Vec<u8> {
        let text = self.text_contents();
        let data_vaddr = self.data_vaddr();
        let data_file_offset = TEXT_FILE_OFFSET + data_vaddr;
        let (dynlibdata, dynamic) = self.dynamic_contents();
        let dynlibdata_offset = align_up(data_file_offset + self.data.len() as u64, 16);
        let dynamic_offset = align_up(dynlibdata_offset + dynlibdata.len() as u64, 16);
        let dynamic_size = (dynamic.len() * std::mem::size_of::<Elf64Dyn>()) as u64;

        let phdr = |p_type, p_flags, p_offset, p_vaddr, p_filesz, p_memsz, p_align| Elf64Phdr {
            p_type,
            p_flags,
            p_offset,
            p_vaddr,
            p_paddr: p_vaddr,
            p_filesz,
            p_memsz,
            p_align,
        };
        let text_size = text.len() as u64;
        let data_size = self.data.len() as u64;
        let phdrs = [
            phdr(pt::LOAD, pf::R | pf::X, TEXT_FILE_OFFSET, 0, text_size, text_size, GUEST_PAGE_SIZE),
            phdr(
                pt::LOAD,
                pf::R | pf::W,
                data_file_offset,
                data_vaddr,
                data_size,
                data_size + self.bss,
                GUEST_PAGE_SIZE,
            ),
            phdr(pt::DYNAMIC, pf::R | pf::W, dynamic_offset, 0, dynamic_size, dynamic_size, 8),
            phdr(pt::SCE_DYNLIBDATA, pf::R, dynlibdata_offset, 0, dynlibdata.len() as u64, 0, 16),
        ];

        let mut e_ident = [0u8; 16];
        e_ident[..4].copy_from_slice(&ELF_MAGIC);
        e_ident[4] = ELFCLASS64;
        e_ident[5] = ELFDATA2LSB;
        e_ident[6] = EV_CURRENT;
        let header = Elf64Header {
            e_ident,
            e_type: self.e_type,
            e_machine: EM_X86_64,
            e_version: EV_CURRENT as u32,
            e_entry: self.entry,
            e_phoff: std::mem::size_of::<Elf64Header>() as u64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: std::mem::size_of::<Elf64Header>() as u16,
            e_phentsize: std::mem::size_of::<Elf64Phdr>() as u16,
            e_phnum: phdrs.len() as u16,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        };

        let mut image = Vec::new();
        image.extend_from_slice(bytes_of(&header));
        for phdr in &phdrs {
            image.extend_from_slice(bytes_of(phdr));
        }
        let mut place = |offset: u64, bytes: &[u8]| {
            let offset = offset as usize;
            if image.len() < offset + bytes.len() {
                image.resize(offset + bytes.len(), 0);
            }
            image[offset..offset + bytes.len()].copy_from_slice(bytes);
        };
        place(TEXT_FILE_OFFSET, &text);
        place(data_file_offset, &self.data);
        place(dynlibdata_offset, &dynlibdata);
        for (index, entry) in dynamic.iter().enumerate() {
            place(dynamic_offset + (index * 16) as u64, bytes_of(entry));
        }
        image
    }

    /// Write the image to `dir/<module_name>.prx`.
    pub fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let path = dir.join(format!("{}.prx", self.module_name));
        std::fs::write(&path, self.build())?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamic::DynamicInfo;
    use crate::elf::ElfFile;
    use crate::program::ProgramInfo;
    use crate::text::find_text_region;

    #[test]
    fn test_built_image_parses() {
        let mut builder = ImageBuilder::new("libfoo").plt_entries(2);
        builder.export("bar", 0);
        builder.import("exit", "libc", "libc");
        let image = builder.needed("libc.prx").build();

        let elf = ElfFile::parse(image).unwrap();
        assert_eq!(elf.header.e_type, et::SCE_DYNAMIC);
        let info = ProgramInfo::parse(&elf.phdrs).unwrap();
        assert!(info.has_dynamic);

        let dynamic: Vec<Elf64Dyn> = elf
            .file_range(info.dynamic_offset, info.dynamic_file_size)
            .unwrap()
            .chunks_exact(16)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        let data = elf
            .file_range(info.sce_dynlibdata_offset, info.sce_dynlibdata_size)
            .unwrap();
        let dynamic_info = DynamicInfo::parse(&dynamic, data).unwrap();
        assert_eq!(dynamic_info.output_image_name, "libfoo.prx");
        assert_eq!(dynamic_info.shared_object_names, vec!["libc.prx".to_string()]);
        assert_eq!(dynamic_info.modules.len(), 2);
        assert_eq!(dynamic_info.find_library(1).unwrap().name, "libc");
        assert!(dynamic_info.find_library(0).unwrap().is_export);
    }

    #[test]
    fn test_text_region_found() {
        let builder = ImageBuilder::new("libfoo").code(&[0x90; 7]).plt_entries(1);
        let text = builder.text_contents();
        assert_eq!(find_text_region(&text), Some(0..text.len()));
    }
}
