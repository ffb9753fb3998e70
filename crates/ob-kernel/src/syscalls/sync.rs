//! Synchronization object syscalls: kqueue, event flags, semaphores,
//! named objects and the event port

use super::process::PID;
use super::{handle_arg, lookup_typed};
use crate::guest;
use crate::objects::{Object, ObjectKind, ObjectOps, ObjectType};
use crate::runtime::Runtime;
use crate::sync::{event_flag, Eport, EventFlag, Queue, Semaphore};
use crate::syscall::SyscallResult;
use ob_core::Errno;

/// `pid` argument of eport_create meaning the calling process.
const CURRENT_PROCESS: u32 = 0xFFFF_FFFF;

/// Add `kind` to the table and map `name` to it. A name already taken is
/// logged and the object stays reachable through its handle.
fn create_named(runtime: &Runtime, name: &str, kind: ObjectKind) -> SyscallResult {
    let table = runtime.object_table();
    let handle = table.add(Object::new(kind)).map_err(|_| Errno::EAGAIN)?;
    if let Err(e) = table.add_name(name, handle) {
        tracing::warn!("Could not name object {}: {}", name, e);
    }
    Ok(handle as u64)
}

/// Take a handle reference on the object called `name`, which must be of
/// `object_type`.
fn open_named(runtime: &Runtime, name: &str, object_type: ObjectType) -> SyscallResult {
    let table = runtime.object_table();
    let handle = table.lookup_by_name(name).ok_or(Errno::ESRCH)?;
    if table.lookup_typed(handle, object_type).is_none() {
        table.release(handle)?;
        return Err(Errno::ESRCH.into());
    }
    Ok(handle as u64)
}

fn delete_typed(runtime: &Runtime, handle: u32, object_type: ObjectType) -> SyscallResult {
    let object = lookup_typed(runtime, handle, object_type).ok_or(Errno::EBADF)?;
    object.close()?;
    runtime.object_table().release(handle)?;
    Ok(0)
}

/// kqueue()
pub unsafe fn sys_kqueue(runtime: &Runtime, _args: [u64; 6]) -> SyscallResult {
    let queue = Object::new(ObjectKind::Queue(Queue::new()));
    let handle = runtime.object_table().add(queue).map_err(|_| Errno::EAGAIN)?;
    Ok(handle as u64)
}

/// evf_create(name, attributes, initial_pattern)
pub unsafe fn sys_evf_create(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let name = guest::read_cstr(args[0])?;
    let attributes = args[1] as u32;
    tracing::debug!("evf_create: {} {:x} {:x}", name, attributes, args[2]);

    event_flag::validate_attributes(attributes)?;
    create_named(runtime, &name, ObjectKind::EventFlag(EventFlag::new(attributes, args[2])))
}

/// evf_delete(handle)
pub unsafe fn sys_evf_delete(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    delete_typed(runtime, handle_arg(args[0]), ObjectType::EventFlag)
}

/// evf_open(name)
pub unsafe fn sys_evf_open(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let name = guest::read_cstr(args[0])?;
    tracing::debug!("evf_open: {}", name);
    open_named(runtime, &name, ObjectType::EventFlag)
}

/// osem_create(name, attributes, initial_count, max_count)
pub unsafe fn sys_osem_create(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let name = guest::read_cstr(args[0])?;
    let attributes = args[1] as u32;
    let initial = args[2] as u32 as i32;
    let max = args[3] as u32 as i32;
    tracing::debug!("osem_create: {} {:x} {} {}", name, attributes, initial, max);

    create_named(runtime, &name, ObjectKind::Semaphore(Semaphore::new(attributes, initial, max)))
}

/// osem_delete(handle)
pub unsafe fn sys_osem_delete(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    delete_typed(runtime, handle_arg(args[0]), ObjectType::Semaphore)
}

/// osem_open(name)
pub unsafe fn sys_osem_open(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let name = guest::read_cstr(args[0])?;
    tracing::debug!("osem_open: {}", name);
    open_named(runtime, &name, ObjectType::Semaphore)
}

/// namedobj_create(name, object, type)
pub unsafe fn sys_namedobj_create(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let name = guest::read_cstr(args[0]).unwrap_or_default();
    let id = runtime.next_namedobj_id();
    tracing::debug!("namedobj_create: {} 0x{:x} {:x} = {}", name, args[1], args[2] as u32, id);
    Ok(id as u64)
}

/// namedobj_delete(id)
pub unsafe fn sys_namedobj_delete(_runtime: &Runtime, _args: [u64; 6]) -> SyscallResult {
    Ok(0)
}

/// eport_create(pid)
pub unsafe fn sys_eport_create(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let pid = args[0] as u32;
    tracing::debug!("eport_create: {:x}", pid);
    if pid != CURRENT_PROCESS && pid as u64 != PID {
        return Err(Errno::ENOSYS.into());
    }

    let eport = Object::new(ObjectKind::Eport(Eport::new(pid)));
    runtime.object_table().add(eport.clone()).map_err(|_| Errno::EAGAIN)?;
    runtime.set_eport(eport);
    Ok(0)
}
