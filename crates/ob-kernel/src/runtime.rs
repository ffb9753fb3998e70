//! Process runtime
//!
//! The [`Runtime`] owns everything process-wide: the object table, the
//! syscall table, the boot module and the user stack. Loaded modules keep a
//! raw pointer to it in their RIP pointers, so it lives behind an `Arc` and
//! never moves.

use crate::object_table::ObjectTable;
use crate::objects::{Object, ObjectKind, ObjectType};
use crate::startup::StartupFrame;
use crate::syscall::{SyscallError, SyscallResult, SyscallTable};
use crate::syscall_numbers::SYS_WRITE;
use ob_core::error::{KernelError, LoaderError};
use ob_core::{Config, CpuFeatures, OrbisError};
use ob_loader::{FsBaseMode, LoadOptions, Module, SymbolResolver};
use ob_memory::{align_up, PageFlags, Reservation, GUEST_PAGE_SIZE};
use once_cell::sync::OnceCell;
use parking_lot::{ReentrantMutex, RwLock};
use std::cell::Cell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

static RUNTIME: OnceCell<Arc<Runtime>> = OnceCell::new();

thread_local! {
    static FSBASE: Cell<u64> = const { Cell::new(0) };
}

#[derive(Default)]
struct RuntimeState {
    base_path: PathBuf,
    progname: String,
    boot_module: Option<Arc<Object>>,
    entry_point: u64,
    user_stack: Option<Reservation>,
    eport: Option<Arc<Object>>,
}

pub struct Runtime {
    config: Config,
    cpu: CpuFeatures,
    fs_mode: FsBaseMode,
    object_table: ObjectTable,
    syscalls: SyscallTable,
    state: RwLock<RuntimeState>,
    next_tls_index: AtomicU16,
    next_namedobj_id: AtomicU32,
    /// Serializes module loading and linking.
    load_lock: ReentrantMutex<()>,
}

impl Runtime {
    pub fn new(config: Config) -> Arc<Self> {
        let fs_mode = if config.cpu.host_gs_fsbase && cfg!(all(target_os = "linux", target_arch = "x86_64")) {
            FsBaseMode::HostGs
        } else {
            FsBaseMode::RipPointers
        };

        Arc::new(Self {
            config,
            cpu: CpuFeatures::detect(),
            fs_mode,
            object_table: ObjectTable::new(),
            syscalls: SyscallTable::new(),
            state: RwLock::new(RuntimeState::default()),
            next_tls_index: AtomicU16::new(0),
            next_namedobj_id: AtomicU32::new(0),
            load_lock: ReentrantMutex::new(()),
        })
    }

    /// Create the process-wide runtime.
    pub fn install(config: Config) -> Result<Arc<Self>, KernelError> {
        let runtime = Self::new(config);
        RUNTIME
            .set(runtime.clone())
            .map_err(|_| KernelError::AlreadyInitialized)?;
        Ok(runtime)
    }

    /// The process-wide runtime, once installed.
    pub fn get() -> Option<&'static Arc<Runtime>> {
        RUNTIME.get()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cpu(&self) -> &CpuFeatures {
        &self.cpu
    }

    pub fn fs_mode(&self) -> FsBaseMode {
        self.fs_mode
    }

    pub fn object_table(&self) -> &ObjectTable {
        &self.object_table
    }

    pub fn syscalls(&self) -> &SyscallTable {
        &self.syscalls
    }

    pub fn base_path(&self) -> PathBuf {
        self.state.read().base_path.clone()
    }

    pub fn progname(&self) -> String {
        self.state.read().progname.clone()
    }

    pub fn boot_module(&self) -> Option<Arc<Object>> {
        self.state.read().boot_module.clone()
    }

    /// Address the entry trampoline calls into.
    pub fn entry_point(&self) -> u64 {
        self.state.read().entry_point
    }

    /// One past the top of the user stack, or 0 before it is reserved.
    pub fn user_stack_end(&self) -> u64 {
        self.state.read().user_stack.as_ref().map_or(0, Reservation::end)
    }

    pub fn eport(&self) -> Option<Arc<Object>> {
        self.state.read().eport.clone()
    }

    pub fn set_eport(&self, eport: Arc<Object>) {
        self.state.write().eport = Some(eport);
    }

    pub fn next_namedobj_id(&self) -> u32 {
        self.next_namedobj_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            runtime: self as *const Runtime as u64,
            syscall_handler: syscall_handler_address(),
            tls_index: self.next_tls_index.fetch_add(1, Ordering::Relaxed),
            fs_mode: self.fs_mode,
            host_has_bmi1: self.cpu.bmi1,
        }
    }

    /// Loaded modules sorted by load order.
    pub fn modules(&self) -> Vec<Arc<Object>> {
        let mut modules = self.object_table.objects_by_type(ObjectType::Module);
        modules.sort_by_key(|o| o.as_module().map_or(u32::MAX, Module::order));
        modules
    }

    /// A loaded module whose file name matches the file name of `path`.
    pub fn find_module_by_name(&self, path: &str) -> Option<Arc<Object>> {
        let name = file_name(path);
        self.object_table
            .objects_by_type(ObjectType::Module)
            .into_iter()
            .find(|o| o.as_module().is_some_and(|m| m.name() == name))
    }

    /// Map the image at `path` and register it in the object table.
    pub fn load_module_from(&self, path: &Path) -> Result<Arc<Object>, OrbisError> {
        let _guard = self.load_lock.lock();
        let module = Module::load(path, &self.load_options())?;
        module.set_fsbase(self.fsbase());
        info!(
            "Loaded {} at 0x{:x} (tls index {})",
            module.name(),
            module.base_address(),
            module.tls_index()
        );

        let object = Object::new(ObjectKind::Module(module));
        self.object_table
            .add(object.clone())
            .map_err(KernelError::ObjectTable)?;
        Ok(object)
    }

    /// Load a module by name, searching next to the boot module and then in
    /// the system module directory.
    pub fn load_module(&self, path: &str) -> Result<Arc<Object>, OrbisError> {
        let _guard = self.load_lock.lock();
        if self.boot_module().is_none() {
            return Err(KernelError::NoBootModule.into());
        }
        if let Some(module) = self.find_module_by_name(path) {
            return Ok(module);
        }

        let name = file_name(path);
        let base_path = self.base_path();
        let candidates = [
            base_path.join(path),
            base_path.join(&self.config.general.system_dir).join(path),
        ];

        let mut last_error = None;
        for candidate in candidates.iter().filter(|c| c.is_file()) {
            match self.load_module_from(candidate) {
                Ok(module) => return Ok(module),
                Err(e) => {
                    warn!("Failed to load {}: {}", candidate.display(), e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| LoaderError::MissingModule(name.to_string()).into()))
    }

    /// Load the boot module and, when it is dynamically linked, the system
    /// modules that provide the process entry point.
    pub fn load_executable(&self, path: &Path) -> Result<Arc<Object>, OrbisError> {
        let _guard = self.load_lock.lock();
        {
            let mut state = self.state.write();
            state.base_path = path.parent().map(Path::to_path_buf).unwrap_or_default();
            state.progname = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
        }

        let boot = match self.load_module_from(path) {
            Ok(boot) => boot,
            Err(e) => {
                self.object_table.purge();
                return Err(e);
            }
        };
        self.state.write().boot_module = Some(boot.clone());

        let (has_dynamic, boot_entry) = match boot.as_module() {
            Some(module) => (module.program_info().has_dynamic, module.entry_point()),
            None => (false, 0),
        };

        let mut entry_point = boot_entry;
        if has_dynamic {
            for (index, name) in self.config.general.preload.iter().enumerate() {
                let module = match self.load_module(name) {
                    Ok(module) => module,
                    Err(e) => {
                        tracing::error!("Could not preload {}: {}", name, e);
                        self.object_table.purge();
                        self.state.write().boot_module = None;
                        return Err(KernelError::MissingSystemModule(name.clone()).into());
                    }
                };
                if index == 0 {
                    entry_point = module.as_module().map_or(boot_entry, Module::entry_point);
                }
            }
        }

        self.state.write().entry_point = entry_point;
        Ok(boot)
    }

    /// Load every NEEDED module reachable from the loaded set. Missing
    /// modules are skipped.
    pub fn load_needed_modules(&self) {
        let _guard = self.load_lock.lock();
        info!("Loading needed modules");
        let mut queue: VecDeque<Arc<Object>> = self.object_table.objects_by_type(ObjectType::Module).into();

        while let Some(object) = queue.pop_front() {
            let Some(module) = object.as_module() else {
                continue;
            };
            for needed in &module.dynamic_info().shared_object_names {
                if self.find_module_by_name(needed).is_some() {
                    continue;
                }
                match self.load_module(needed) {
                    Ok(loaded) => queue.push_back(loaded),
                    Err(e) => warn!("Failed to load needed module {} of {}: {}", needed, module.name(), e),
                }
            }
        }
    }

    /// Assign load orders: the preloaded system modules first, then every
    /// other module after all of its loaded dependencies.
    pub fn sort_modules(&self) -> Result<(), KernelError> {
        let _guard = self.load_lock.lock();
        let preload = &self.config.general.preload;
        let modules = self.object_table.objects_by_type(ObjectType::Module);
        let mut order = 1;
        let mut sorted: Vec<String> = Vec::new();

        for name in preload {
            let found = modules
                .iter()
                .filter_map(|o| o.as_module())
                .find(|m| m.name() == name.as_str());
            if let Some(module) = found {
                module.set_order(order);
                order += 1;
                sorted.push(name.clone());
            }
        }

        let mut queue: VecDeque<&Module> = modules
            .iter()
            .filter_map(|o| o.as_module())
            .filter(|m| !preload.iter().any(|p| p.as_str() == m.name()))
            .collect();
        let names: Vec<String> = queue.iter().map(|m| m.name().to_string()).collect();

        let mut stalled = 0;
        while let Some(module) = queue.pop_front() {
            let blocked = module
                .dynamic_info()
                .shared_object_names
                .iter()
                .any(|needed| names.contains(needed) && !sorted.contains(needed));
            if blocked {
                queue.push_back(module);
                stalled += 1;
                if stalled > queue.len() {
                    let names: Vec<&str> = queue.iter().map(|m| m.name()).collect();
                    return Err(KernelError::SortStalled(names.join(", ")));
                }
                continue;
            }

            stalled = 0;
            module.set_order(order);
            debug!("{} has load order {}", module.name(), order);
            order += 1;
            sorted.push(module.name().to_string());
        }
        Ok(())
    }

    pub fn relocate_modules(&self) -> Result<(), OrbisError> {
        let _guard = self.load_lock.lock();
        info!("Relocating modules");
        for object in self.modules() {
            if let Some(module) = object.as_module() {
                module.relocate(self)?;
            }
        }
        Ok(())
    }

    pub fn process_needed_and_relocate(&self) -> Result<(), OrbisError> {
        let _guard = self.load_lock.lock();
        self.load_needed_modules();
        self.sort_modules()?;
        self.relocate_modules()
    }

    /// Run syscall `id`.
    pub fn handle_syscall(&self, id: u64, args: [u64; 6]) -> SyscallResult {
        let Some(entry) = self.syscalls.get(id) else {
            warn!("Unknown syscall {}", id);
            return Err(SyscallError::FAILED);
        };

        if self.config.debug.trace_syscalls {
            info!("SYSCALL({:03}): {} {:x?}", id, entry.name, args);
        } else if id != SYS_WRITE {
            debug!("SYSCALL({:03}): {}", id, entry.name);
        }

        // Safety: guest arguments are trusted like the guest's own code.
        let result = unsafe { (entry.handler)(self, args) };
        if let Err(e) = result {
            debug!("{} failed: {}", entry.name, e);
        }
        result
    }

    /// Guest fs base of the calling thread.
    pub fn fsbase(&self) -> u64 {
        FSBASE.with(Cell::get)
    }

    /// Record the calling thread's guest fs base and publish it to the
    /// modules' fs trampolines.
    pub fn set_fsbase(&self, value: u64) {
        FSBASE.with(|fsbase| fsbase.set(value));
        match self.fs_mode {
            FsBaseMode::HostGs => set_host_gs_base(value),
            FsBaseMode::RipPointers => {
                for object in self.object_table.objects_by_type(ObjectType::Module) {
                    if let Some(module) = object.as_module() {
                        module.set_fsbase(value);
                    }
                }
            }
        }
    }

    /// Reserve the user stack, once. Returns its bounds.
    pub fn prepare_user_stack(&self) -> Result<(u64, u64), OrbisError> {
        let mut state = self.state.write();
        if let Some(stack) = &state.user_stack {
            return Ok((stack.base(), stack.end()));
        }

        let size = align_up(self.config.memory.user_stack_size, GUEST_PAGE_SIZE);
        let stack = Reservation::new(size)?;
        stack.commit(stack.base(), size, PageFlags::RW)?;
        let bounds = (stack.base(), stack.end());
        info!("User stack: 0x{:x}-0x{:x}", bounds.0, bounds.1 - 1);
        state.user_stack = Some(stack);
        Ok(bounds)
    }

    /// Enter the guest through the boot entry point.
    #[cfg(target_arch = "x86_64")]
    pub fn run(&self, args: &[String]) -> Result<(), OrbisError> {
        let boot = self.boot_module().ok_or(KernelError::NoBootModule)?;
        let boot_entry = boot.as_module().map_or(0, Module::entry_point);
        self.prepare_user_stack()?;

        let frame = StartupFrame::new(&self.progname(), args, boot_entry)?;
        let code = ob_loader::entry_trampoline(self.entry_point());
        let size = align_up(code.len() as u64, GUEST_PAGE_SIZE);
        let trampoline = Reservation::new(size)?;
        trampoline.commit(trampoline.base(), size, PageFlags::RW)?;
        // Safety: the reservation is committed and at least `code.len()` long.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), trampoline.as_ptr(), code.len());
        }
        trampoline.protect(trampoline.base(), size, PageFlags::RX)?;

        info!("Entering guest at 0x{:x} ({} args)", self.entry_point(), args.len());
        // Safety: the trampoline follows the sysv64 convention and passes
        // the frame pointer to the guest entry untouched.
        unsafe {
            let enter: extern "sysv64" fn(*const u64) = std::mem::transmute(trampoline.as_ptr());
            enter(frame.as_ptr());
        }
        Ok(())
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn run(&self, _args: &[String]) -> Result<(), OrbisError> {
        Err(OrbisError::Unsupported("guest execution requires an x86-64 host".to_string()))
    }
}

impl SymbolResolver for Runtime {
    fn resolve_symbol(&self, skip: Option<&Module>, hash: u32, name: &str) -> Option<u64> {
        self.modules()
            .iter()
            .filter_map(|o| o.as_module())
            .filter(|m| !skip.is_some_and(|s| std::ptr::eq(*m, s)))
            .find_map(|m| m.resolve_symbol(hash, name))
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("fs_mode", &self.fs_mode)
            .field("objects", &self.object_table.all_objects().len())
            .finish()
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[cfg(target_arch = "x86_64")]
fn syscall_handler_address() -> u64 {
    crate::syscall::syscall_entry as usize as u64
}

#[cfg(not(target_arch = "x86_64"))]
fn syscall_handler_address() -> u64 {
    0
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn set_host_gs_base(value: u64) {
    const ARCH_SET_GS: libc::c_int = 0x1001;
    // Safety: only changes the calling thread's gs base, which the host
    // runtime does not use on x86-64 Linux.
    let result = unsafe { libc::syscall(libc::SYS_arch_prctl, ARCH_SET_GS, value) };
    if result != 0 {
        warn!("arch_prctl(ARCH_SET_GS, 0x{:x}) failed", value);
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn set_host_gs_base(_value: u64) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("libkernel.prx"), "libkernel.prx");
        assert_eq!(file_name("/app0/sce_module/libc.prx"), "libc.prx");
        assert_eq!(file_name("C:\\games\\eboot.bin"), "eboot.bin");
    }

    #[test]
    fn test_load_module_requires_boot() {
        let runtime = Runtime::new(Config::default());
        let err = runtime.load_module("libkernel.prx").unwrap_err();
        assert!(matches!(err, OrbisError::Kernel(KernelError::NoBootModule)));
    }

    #[test]
    fn test_unknown_syscall() {
        let runtime = Runtime::new(Config::default());
        assert_eq!(runtime.handle_syscall(601, [0; 6]), Err(SyscallError::FAILED));
        assert_eq!(runtime.handle_syscall(5000, [0; 6]), Err(SyscallError::FAILED));
        assert_eq!(runtime.handle_syscall(20, [0; 6]), Ok(123));
    }

    #[test]
    fn test_fsbase_is_per_thread() {
        let runtime = Runtime::new(Config::default());
        runtime.set_fsbase(0x1000);
        assert_eq!(runtime.fsbase(), 0x1000);

        let other = std::thread::scope(|s| s.spawn(|| runtime.fsbase()).join().unwrap());
        assert_eq!(other, 0);
    }

    #[test]
    fn test_user_stack_is_reserved_once() {
        let mut config = Config::default();
        config.memory.user_stack_size = 0x10000;
        let runtime = Runtime::new(config);
        assert_eq!(runtime.user_stack_end(), 0);

        let (start, end) = runtime.prepare_user_stack().unwrap();
        assert_eq!(end - start, 0x10000);
        assert_eq!(runtime.user_stack_end(), end);
        assert_eq!(runtime.prepare_user_stack().unwrap(), (start, end));
    }

    #[test]
    fn test_namedobj_ids_increment() {
        let runtime = Runtime::new(Config::default());
        assert_eq!(runtime.next_namedobj_id(), 1);
        assert_eq!(runtime.next_namedobj_id(), 2);
    }
}
