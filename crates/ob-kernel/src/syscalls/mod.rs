//! Syscall handlers
//!
//! Handlers take the raw guest registers. Anything the guest passes by
//! pointer is read and written in place through [`crate::guest`].

pub mod dynlib;
pub mod fs;
pub mod ipmi;
pub mod memory;
pub mod net;
pub mod process;
pub mod sync;
pub mod sysctl;
pub mod time;

use crate::object_table::Handle;
use crate::objects::{Object, ObjectType};
use crate::runtime::Runtime;
use crate::syscall::SyscallTable;
use crate::syscall_numbers::*;
use ob_core::Errno;
use std::sync::Arc;

/// Guest descriptors are 32-bit.
pub(crate) fn handle_arg(arg: u64) -> Handle {
    arg as u32
}

pub(crate) fn lookup(runtime: &Runtime, handle: Handle) -> Result<Arc<Object>, Errno> {
    runtime.object_table().lookup(handle).ok_or(Errno::EBADF)
}

pub(crate) fn lookup_typed(runtime: &Runtime, handle: Handle, object_type: ObjectType) -> Option<Arc<Object>> {
    runtime.object_table().lookup_typed(handle, object_type)
}

/// Fill `table` with every implemented syscall.
pub fn register_all(table: &mut SyscallTable) {
    // Process
    table.register(SYS_EXIT, "exit", process::sys_exit);
    table.register(SYS_GETPID, "getpid", process::sys_getpid);
    table.register(SYS_SYSARCH, "sysarch", process::sys_sysarch);
    table.register(SYS_SYSCTL, "sysctl", sysctl::sys_sysctl);
    table.register(SYS_REGMGR_CALL, "regmgr_call", process::sys_regmgr_call);
    table.register(SYS_GET_AUTHINFO, "get_authinfo", process::sys_get_authinfo);
    table.register(SYS_MNAME, "mname", process::sys_mname);
    table.register(SYS_MDBG_SERVICE, "mdbg_service", process::sys_mdbg_service);
    table.register(SYS_RANDOMIZED_PATH, "randomized_path", process::sys_randomized_path);
    table.register(SYS_GET_PROC_TYPE_INFO, "get_proc_type_info", process::sys_get_proc_type_info);
    table.register(SYS_WORKAROUND8849, "workaround8849", process::sys_workaround8849);

    // Signals and threads
    table.register(SYS_SIGPROCMASK, "sigprocmask", process::sys_sigprocmask);
    table.register(SYS_SIGACTION, "sigaction", process::sys_sigaction);
    table.register(SYS_THR_SELF, "thr_self", process::sys_thr_self);
    table.register(SYS_UMTX_OP, "_umtx_op", process::sys_umtx_op);
    table.register(SYS_THR_SET_NAME, "thr_set_name", process::sys_thr_set_name);
    table.register(SYS_RTPRIO_THREAD, "rtprio_thread", process::sys_rtprio_thread);
    table.register(SYS_CPUSET_GETAFFINITY, "cpuset_getaffinity", process::sys_cpuset_getaffinity);
    table.register(SYS_THR_GET_NAME, "thr_get_name", process::sys_thr_get_name);

    // Descriptors
    table.register(SYS_WRITE, "write", fs::sys_write);
    table.register(SYS_OPEN, "open", fs::sys_open);
    table.register(SYS_CLOSE, "close", fs::sys_close);
    table.register(SYS_IOCTL, "ioctl", fs::sys_ioctl);

    // Memory
    table.register(SYS_MUNMAP, "munmap", memory::sys_munmap);
    table.register(SYS_MPROTECT, "mprotect", memory::sys_mprotect);
    table.register(SYS_MMAP, "mmap", memory::sys_mmap);
    table.register(SYS_FTRUNCATE, "ftruncate", memory::sys_ftruncate);
    table.register(SYS_SHM_OPEN, "shm_open", memory::sys_shm_open);
    table.register(SYS_DMEM_CONTAINER, "dmem_container", memory::sys_dmem_container);

    // Network
    table.register(SYS_SOCKET, "socket", net::sys_socket);
    table.register(SYS_CONNECT, "connect", net::sys_connect);
    table.register(SYS_SOCKETEX, "socketex", net::sys_socketex);
    table.register(SYS_SOCKETCLOSE, "socketclose", net::sys_socketclose);
    table.register(SYS_NETCONTROL, "netcontrol", net::sys_netcontrol);

    // Time
    table.register(SYS_GETTIMEOFDAY, "gettimeofday", time::sys_gettimeofday);
    table.register(SYS_CLOCK_GETTIME, "clock_gettime", time::sys_clock_gettime);
    table.register(SYS_UTC_TO_LOCALTIME, "utc_to_localtime", time::sys_utc_to_localtime);

    // Synchronization
    table.register(SYS_KQUEUE, "kqueue", sync::sys_kqueue);
    table.register(SYS_EVF_CREATE, "evf_create", sync::sys_evf_create);
    table.register(SYS_EVF_DELETE, "evf_delete", sync::sys_evf_delete);
    table.register(SYS_EVF_OPEN, "evf_open", sync::sys_evf_open);
    table.register(SYS_OSEM_CREATE, "osem_create", sync::sys_osem_create);
    table.register(SYS_OSEM_DELETE, "osem_delete", sync::sys_osem_delete);
    table.register(SYS_OSEM_OPEN, "osem_open", sync::sys_osem_open);
    table.register(SYS_NAMEDOBJ_CREATE, "namedobj_create", sync::sys_namedobj_create);
    table.register(SYS_NAMEDOBJ_DELETE, "namedobj_delete", sync::sys_namedobj_delete);
    table.register(SYS_EPORT_CREATE, "eport_create", sync::sys_eport_create);

    // Dynamic linking
    table.register(SYS_DYNLIB_DLSYM, "dynlib_dlsym", dynlib::sys_dynlib_dlsym);
    table.register(SYS_DYNLIB_GET_LIST, "dynlib_get_list", dynlib::sys_dynlib_get_list);
    table.register(SYS_DYNLIB_GET_INFO, "dynlib_get_info", dynlib::sys_dynlib_get_info);
    table.register(SYS_DYNLIB_LOAD_PRX, "dynlib_load_prx", dynlib::sys_dynlib_load_prx);
    table.register(
        SYS_DYNLIB_DO_COPY_RELOCATIONS,
        "dynlib_do_copy_relocations",
        dynlib::sys_dynlib_do_copy_relocations,
    );
    table.register(SYS_DYNLIB_GET_PROC_PARAM, "dynlib_get_proc_param", dynlib::sys_dynlib_get_proc_param);
    table.register(
        SYS_DYNLIB_PROCESS_NEEDED_AND_RELOCATE,
        "dynlib_process_needed_and_relocate",
        dynlib::sys_dynlib_process_needed_and_relocate,
    );
    table.register(SYS_DYNLIB_GET_INFO_EX, "dynlib_get_info_ex", dynlib::sys_dynlib_get_info_ex);
    table.register(SYS_DYNLIB_GET_OBJ_MEMBER, "dynlib_get_obj_member", dynlib::sys_dynlib_get_obj_member);

    // IPMI
    table.register(SYS_IPMIMGR_CALL, "ipmimgr_call", ipmi::sys_ipmimgr_call);
}
