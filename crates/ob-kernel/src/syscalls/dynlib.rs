//! Dynamic linker syscalls
//!
//! libkernel implements `dlopen`, `dlsym` and module queries on top of
//! these. Module handles are object table handles.

use super::handle_arg;
use crate::guest;
use crate::objects::{Object, ObjectType};
use crate::runtime::Runtime;
use crate::syscall::{SyscallError, SyscallResult};
use bytemuck::{Pod, Zeroable};
use ob_core::Errno;
use ob_loader::{elf_hash, Module};
use std::sync::Arc;

/// Segment flags reported for the text segment (R+X).
const TEXT_FLAGS: u32 = 1 | 4;
/// Segment flags reported for the data segment (R+W).
const DATA_FLAGS: u32 = 1 | 2;

const OBJ_MEMBER_INIT: u8 = 1;

/// libkernel asks for this by name; the export only exists under its
/// encoded NID.
const PRELOAD_FOR_LIBKERNEL: (&str, &str) = ("sceSysmodulePreloadModuleForLibkernel", "DOO+zuW1lrE");

/// Result of dynlib_get_info.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DynlibInfo {
    pub struct_size: u64,
    pub name: [u8; 256],
    pub text_address: u64,
    pub text_size: u32,
    pub text_flags: u32,
    pub data_address: u64,
    pub data_size: u32,
    pub data_flags: u32,
    pub unknown_128: [u8; 32],
    pub unknown_148: u32,
    pub fingerprint: [u8; 20],
}

/// Result of dynlib_get_info_ex.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DynlibInfoEx {
    pub struct_size: u64,
    pub name: [u8; 256],
    pub handle: u32,
    pub tls_index: u16,
    pub unknown_10e: u16,
    pub tls_address: u64,
    pub tls_file_size: u32,
    pub tls_memory_size: u32,
    pub tls_offset: u32,
    pub tls_align: u32,
    pub init_address: u64,
    pub fini_address: u64,
    pub unknown_138: u64,
    pub unknown_140: u64,
    pub eh_frame_header_address: u64,
    pub eh_frame_data_address: u64,
    pub eh_frame_header_size: u32,
    pub eh_frame_data_size: u32,
    pub text_address: u64,
    pub text_size: u32,
    pub text_flags: u32,
    pub data_address: u64,
    pub data_size: u32,
    pub data_flags: u32,
    pub unknown_180: [u8; 32],
    pub unknown_1a0: u32,
    pub ref_count: i32,
}

/// Module file name without its extension.
fn short_name(module: &Module) -> &str {
    let name = module.name();
    name.rsplit_once('.').map_or(name, |(stem, _)| stem)
}

fn lookup_module(runtime: &Runtime, handle: u32) -> Option<Arc<Object>> {
    runtime.object_table().lookup_typed(handle, ObjectType::Module)
}

/// Check the caller-provided `struct_size` of an info buffer.
unsafe fn check_struct_size<T>(info: u64) -> Result<(), Errno> {
    let struct_size: u64 = guest::read(info)?;
    if struct_size != std::mem::size_of::<T>() as u64 {
        return Err(Errno::EINVAL);
    }
    Ok(())
}

fn resolve_in_module(module: &Module, symbol: &str) -> Option<u64> {
    let module_name = short_name(module);
    let name = format!("{}#{}#{}", symbol, module_name, module_name);
    module.resolve_symbol(elf_hash(&name), &name)
}

/// dynlib_dlsym(handle, name, sym)
pub unsafe fn sys_dynlib_dlsym(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let object = lookup_module(runtime, handle_arg(args[0])).ok_or(SyscallError::FAILED)?;
    let module = object.as_module().ok_or(SyscallError::FAILED)?;
    let name = guest::read_cstr(args[1])?;

    let address = resolve_in_module(module, &name).or_else(|| {
        let (symbol, nid) = PRELOAD_FOR_LIBKERNEL;
        (name == symbol).then(|| resolve_in_module(module, nid)).flatten()
    });
    match address {
        Some(address) => {
            guest::write(args[2], address)?;
            Ok(0)
        }
        None => {
            tracing::debug!("dlsym: {} not found in {}", name, module.name());
            Err(SyscallError::FAILED)
        }
    }
}

/// dynlib_get_list(handles, max_count, count)
pub unsafe fn sys_dynlib_get_list(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let max_count = args[1] as usize;
    let handles: Vec<u32> = runtime
        .modules()
        .iter()
        .filter_map(|o| o.handle())
        .take(max_count)
        .collect();

    if !handles.is_empty() {
        guest::write_bytes(args[0], bytemuck::cast_slice(&handles))?;
    }
    guest::write(args[2], handles.len() as u64)?;
    Ok(0)
}

/// dynlib_get_info(handle, info)
pub unsafe fn sys_dynlib_get_info(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    check_struct_size::<DynlibInfo>(args[1])?;
    let object = lookup_module(runtime, handle_arg(args[0])).ok_or(Errno::ESRCH)?;
    let module = object.as_module().ok_or(Errno::ESRCH)?;

    let mut info = DynlibInfo::zeroed();
    info.struct_size = std::mem::size_of::<DynlibInfo>() as u64;
    guest::copy_name(&mut info.name, short_name(module));
    let (text, data) = (module.text(), module.data());
    info.text_address = text.address;
    info.text_size = text.size as u32;
    info.text_flags = TEXT_FLAGS;
    info.data_address = data.address;
    info.data_size = data.size as u32;
    info.data_flags = DATA_FLAGS;
    info.unknown_148 = 2;
    info.fingerprint = module.dynamic_info().fingerprint;

    guest::write(args[1], info)?;
    Ok(0)
}

/// dynlib_load_prx(path, flags, handle, arg4)
pub unsafe fn sys_dynlib_load_prx(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let path = guest::read_cstr(args[0])?;
    tracing::info!("dynlib_load_prx: {}", path);
    let file_name = path.rsplit('/').next().unwrap_or(&path);

    let mut candidates = vec![file_name.to_string()];
    if let Some(stem) = file_name.strip_suffix(".sprx") {
        candidates.push(format!("{}.prx", stem));
    }

    for candidate in &candidates {
        let object = match runtime.load_module(candidate) {
            Ok(object) => object,
            Err(e) => {
                tracing::debug!("dynlib_load_prx: {}: {}", candidate, e);
                continue;
            }
        };
        if let Some(module) = object.as_module() {
            if let Err(e) = module.relocate(runtime) {
                tracing::error!("Failed to relocate {}: {}", module.name(), e);
                return Err(SyscallError::FAILED);
            }
        }
        let handle = object.handle().ok_or(SyscallError::FAILED)?;
        guest::write(args[2], handle)?;
        return Ok(0);
    }

    tracing::warn!("dynlib_load_prx: could not load {}", path);
    Err(SyscallError::FAILED)
}

/// dynlib_do_copy_relocations()
pub unsafe fn sys_dynlib_do_copy_relocations(_runtime: &Runtime, _args: [u64; 6]) -> SyscallResult {
    Ok(0)
}

/// dynlib_get_proc_param(address, size)
pub unsafe fn sys_dynlib_get_proc_param(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let boot = runtime.boot_module().ok_or(Errno::ESRCH)?;
    let param = boot.as_module().and_then(Module::proc_param);
    let (address, size) = param.map_or((0, 0), |p| (p.address, p.size));
    guest::write(args[0], address)?;
    guest::write(args[1], size)?;
    Ok(0)
}

/// dynlib_process_needed_and_relocate()
pub unsafe fn sys_dynlib_process_needed_and_relocate(runtime: &Runtime, _args: [u64; 6]) -> SyscallResult {
    match runtime.process_needed_and_relocate() {
        Ok(()) => Ok(0),
        Err(e) => {
            tracing::error!("Linking failed: {}", e);
            Err(SyscallError::FAILED)
        }
    }
}

/// dynlib_get_info_ex(handle, flags, info)
pub unsafe fn sys_dynlib_get_info_ex(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    check_struct_size::<DynlibInfoEx>(args[2])?;
    let handle = handle_arg(args[0]);
    let object = lookup_module(runtime, handle).ok_or(Errno::ESRCH)?;
    let module = object.as_module().ok_or(Errno::ESRCH)?;
    let program = module.program_info();

    let mut info = DynlibInfoEx::zeroed();
    info.struct_size = std::mem::size_of::<DynlibInfoEx>() as u64;
    guest::copy_name(&mut info.name, short_name(module));
    info.handle = object.handle().unwrap_or(handle);
    info.tls_index = module.tls_index();
    if program.tls_memory_size != 0 {
        info.tls_address = module.base_address() + program.tls_address;
    }
    info.tls_file_size = program.tls_file_size as u32;
    info.tls_memory_size = program.tls_memory_size as u32;
    info.tls_align = program.tls_align as u32;
    info.init_address = module.init_address().unwrap_or(0);
    info.fini_address = module.fini_address().unwrap_or(0);
    if let Some((header, header_size, data, data_size)) = module.eh_frame_ranges() {
        info.eh_frame_header_address = header;
        info.eh_frame_header_size = header_size as u32;
        info.eh_frame_data_address = data;
        info.eh_frame_data_size = data_size as u32;
    }
    let (text, data) = (module.text(), module.data());
    info.text_address = text.address;
    info.text_size = text.size as u32;
    info.text_flags = TEXT_FLAGS;
    info.data_address = data.address;
    info.data_size = data.size as u32;
    info.data_flags = DATA_FLAGS;
    // Not counting the reference held by this call.
    info.ref_count = (object.ref_count() - 1) as i32;

    guest::write(args[2], info)?;
    Ok(0)
}

/// dynlib_get_obj_member(handle, index, value)
pub unsafe fn sys_dynlib_get_obj_member(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let object = lookup_module(runtime, handle_arg(args[0])).ok_or(Errno::ESRCH)?;
    let module = object.as_module().ok_or(Errno::ESRCH)?;
    match args[1] as u8 {
        OBJ_MEMBER_INIT => {
            guest::write(args[2], module.init_address().unwrap_or(0))?;
            Ok(0)
        }
        index => {
            tracing::warn!("dynlib_get_obj_member: unknown member {}", index);
            Err(Errno::EINVAL.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ob_core::Config;
    use ob_loader::testing::ImageBuilder;
    use std::ffi::CString;
    use std::mem::{offset_of, size_of};
    use std::path::Path;

    fn load(runtime: &Runtime, dir: &Path, builder: &ImageBuilder) -> (Arc<Object>, u64) {
        let path = builder.write_to(dir).unwrap();
        let object = runtime.load_module_from(&path).unwrap();
        let handle = object.handle().unwrap() as u64;
        (object, handle)
    }

    #[test]
    fn test_info_layouts() {
        assert_eq!(size_of::<DynlibInfo>(), 352);
        assert_eq!(offset_of!(DynlibInfo, text_address), 0x108);
        assert_eq!(offset_of!(DynlibInfo, unknown_148), 0x148);

        assert_eq!(size_of::<DynlibInfoEx>(), 424);
        assert_eq!(offset_of!(DynlibInfoEx, unknown_10e), 0x10E);
        assert_eq!(offset_of!(DynlibInfoEx, unknown_138), 0x138);
        assert_eq!(offset_of!(DynlibInfoEx, unknown_180), 0x180);
        assert_eq!(offset_of!(DynlibInfoEx, ref_count), 0x1A4);
    }

    #[test]
    fn test_dlsym() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::new(Config::default());
        let mut builder = ImageBuilder::new("libSceSysmodule");
        builder.export("sceSysmoduleLoadModule", 0x10);
        builder.export(PRELOAD_FOR_LIBKERNEL.1, 0x20);
        let (object, handle) = load(&runtime, dir.path(), &builder);
        let base = object.as_module().unwrap().base_address();

        let mut address = 0u64;
        let out = &mut address as *mut u64 as u64;
        let name = CString::new("sceSysmoduleLoadModule").unwrap();
        assert_eq!(unsafe { sys_dynlib_dlsym(&runtime, [handle, name.as_ptr() as u64, out, 0, 0, 0]) }, Ok(0));
        assert_eq!(address, base + 0x10);

        let name = CString::new(PRELOAD_FOR_LIBKERNEL.0).unwrap();
        assert_eq!(unsafe { sys_dynlib_dlsym(&runtime, [handle, name.as_ptr() as u64, out, 0, 0, 0]) }, Ok(0));
        assert_eq!(address, base + 0x20);

        let name = CString::new("missing").unwrap();
        let result = unsafe { sys_dynlib_dlsym(&runtime, [handle, name.as_ptr() as u64, out, 0, 0, 0]) };
        assert_eq!(result, Err(SyscallError::FAILED));
        let result = unsafe { sys_dynlib_dlsym(&runtime, [handle + 4, name.as_ptr() as u64, out, 0, 0, 0]) };
        assert_eq!(result, Err(SyscallError::FAILED));
    }

    #[test]
    fn test_get_list_and_info() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::new(Config::default());
        let (first, first_handle) = load(&runtime, dir.path(), &ImageBuilder::new("libfirst"));
        let (second, second_handle) = load(&runtime, dir.path(), &ImageBuilder::new("libsecond"));
        first.as_module().unwrap().set_order(2);
        second.as_module().unwrap().set_order(1);

        let mut handles = [0u32; 4];
        let mut count = 0u64;
        let args = [handles.as_mut_ptr() as u64, 4, &mut count as *mut u64 as u64, 0, 0, 0];
        assert_eq!(unsafe { sys_dynlib_get_list(&runtime, args) }, Ok(0));
        assert_eq!(count, 2);
        assert_eq!(&handles[..2], &[second_handle as u32, first_handle as u32]);

        let args = [handles.as_mut_ptr() as u64, 1, &mut count as *mut u64 as u64, 0, 0, 0];
        assert_eq!(unsafe { sys_dynlib_get_list(&runtime, args) }, Ok(0));
        assert_eq!(count, 1);

        let mut info = DynlibInfo::zeroed();
        let out = &mut info as *mut DynlibInfo as u64;
        assert_eq!(unsafe { sys_dynlib_get_info(&runtime, [first_handle, out, 0, 0, 0, 0]) }, Err(Errno::EINVAL.into()));

        info.struct_size = size_of::<DynlibInfo>() as u64;
        assert_eq!(unsafe { sys_dynlib_get_info(&runtime, [first_handle, out, 0, 0, 0, 0]) }, Ok(0));
        assert_eq!(&info.name[..9], b"libfirst\0");
        let module = first.as_module().unwrap();
        assert_eq!(info.text_address, module.text().address);
        assert_eq!((info.text_flags, info.data_flags, info.unknown_148), (5, 3, 2));
        assert_eq!(info.data_address, module.data().address);

        assert_eq!(unsafe { sys_dynlib_get_info(&runtime, [0x400, out, 0, 0, 0, 0]) }, Err(Errno::ESRCH.into()));
    }

    #[test]
    fn test_get_info_ex() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::new(Config::default());
        let (object, handle) = load(&runtime, dir.path(), &ImageBuilder::new("libfoo"));

        let mut info = DynlibInfoEx::zeroed();
        info.struct_size = size_of::<DynlibInfoEx>() as u64;
        let out = &mut info as *mut DynlibInfoEx as u64;
        assert_eq!(unsafe { sys_dynlib_get_info_ex(&runtime, [handle, 0, out, 0, 0, 0]) }, Ok(0));

        let module = object.as_module().unwrap();
        assert_eq!(&info.name[..7], b"libfoo\0");
        assert_eq!(info.handle as u64, handle);
        assert_eq!(info.tls_index, module.tls_index());
        assert_eq!(info.text_address, module.text().address);
        assert_eq!(info.init_address, module.init_address().unwrap_or(0));
        assert_eq!((info.text_flags, info.data_flags), (5, 3));
        // The table and this test hold the object.
        assert_eq!(info.ref_count, 2);
    }

    #[test]
    fn test_get_obj_member() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::new(Config::default());
        let (object, handle) = load(&runtime, dir.path(), &ImageBuilder::new("libfoo"));

        let mut value = u64::MAX;
        let out = &mut value as *mut u64 as u64;
        assert_eq!(unsafe { sys_dynlib_get_obj_member(&runtime, [handle, 1, out, 0, 0, 0]) }, Ok(0));
        assert_eq!(value, object.as_module().unwrap().init_address().unwrap_or(0));
        assert_eq!(unsafe { sys_dynlib_get_obj_member(&runtime, [handle, 2, out, 0, 0, 0]) }, Err(Errno::EINVAL.into()));
        assert_eq!(unsafe { sys_dynlib_get_obj_member(&runtime, [0x400, 1, out, 0, 0, 0]) }, Err(Errno::ESRCH.into()));
    }

    #[test]
    fn test_load_prx_falls_back_to_prx() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::new(Config::default());
        for name in ["libkernel", "libSceLibcInternal", "libfoo"] {
            ImageBuilder::new(name).write_to(dir.path()).unwrap();
        }
        let eboot = ImageBuilder::new("eboot").executable().write_to(dir.path()).unwrap();
        runtime.load_executable(&eboot).unwrap();

        let path = CString::new("/app0/sce_module/libfoo.sprx").unwrap();
        let mut handle = 0u32;
        let args = [path.as_ptr() as u64, 0, &mut handle as *mut u32 as u64, 0, 0, 0];
        assert_eq!(unsafe { sys_dynlib_load_prx(&runtime, args) }, Ok(0));
        let object = runtime.object_table().lookup(handle).unwrap();
        assert_eq!(object.as_module().map(Module::name), Some("libfoo.prx"));

        // Already loaded modules are handed out again.
        let mut again = 0u32;
        let args = [path.as_ptr() as u64, 0, &mut again as *mut u32 as u64, 0, 0, 0];
        assert_eq!(unsafe { sys_dynlib_load_prx(&runtime, args) }, Ok(0));
        assert_eq!(again, handle);

        let path = CString::new("/app0/sce_module/libmissing.sprx").unwrap();
        let args = [path.as_ptr() as u64, 0, &mut handle as *mut u32 as u64, 0, 0, 0];
        assert_eq!(unsafe { sys_dynlib_load_prx(&runtime, args) }, Err(SyscallError::FAILED));
    }

    #[test]
    fn test_proc_param_requires_boot_module() {
        let runtime = Runtime::new(Config::default());
        let (mut address, mut size) = (0u64, 0u64);
        let args = [&mut address as *mut u64 as u64, &mut size as *mut u64 as u64, 0, 0, 0, 0];
        assert_eq!(unsafe { sys_dynlib_get_proc_param(&runtime, args) }, Err(Errno::ESRCH.into()));
    }
}
