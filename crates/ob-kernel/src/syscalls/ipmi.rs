//! IPMI manager syscall

use super::{handle_arg, lookup_typed};
use crate::guest;
use crate::objects::{IpmiClient, Object, ObjectKind, ObjectType};
use crate::runtime::Runtime;
use crate::syscall::{SyscallError, SyscallResult};
use bytemuck::{Pod, Zeroable};
use ob_core::Errno;

const MAX_ARGS_SIZE: u64 = 64;
/// Written to the result slot when the argument block is too large.
const ERROR_ARGS_TOO_LARGE: u32 = 0x800E_0001;

mod op {
    pub const CREATE_CLIENT: u32 = 0x002;
    pub const DESTROY_CLIENT: u32 = 0x003;
    pub const TRACE: u32 = 0x010;
    pub const PREPARE_CONNECT: u32 = 0x211;
    pub const CONNECT: u32 = 0x213;
    pub const INVOKE_SYNC_METHOD: u32 = 0x231;
    pub const INVOKE_ASYNC_METHOD: u32 = 0x233;
}

/// Offset of the event flag count in the prepare-connect data block.
const EVENT_FLAG_COUNT_OFFSET: u64 = 0x38;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct CreateClientArgs {
    arg1: u64,
    name: u64,
    arg3: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PrepareConnectArgs {
    data: u64,
    arg2: u64,
    size: u64,
    arg4: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ConnectArgs {
    key: u64,
    unknown: u64,
    session_id: u64,
    result: u64,
}

/// ipmimgr_call(op, handle, result, args, args_size, cookie)
pub unsafe fn sys_ipmimgr_call(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let [op, handle, result, call_args, args_size, _cookie] = args;
    let op = op as u32;
    let handle = handle_arg(handle);

    if args_size > MAX_ARGS_SIZE {
        guest::write(result, ERROR_ARGS_TOO_LARGE)?;
        return Err(SyscallError::FAILED);
    }

    let value = match op {
        op::CREATE_CLIENT => create_client(runtime, call_args)?,
        op::DESTROY_CLIENT => {
            tracing::debug!("ipmimgr_call: destroy client {}", handle);
            0
        }
        op::TRACE => {
            if call_args == 0 || args_size < MAX_ARGS_SIZE {
                return Err(Errno::EINVAL.into());
            }
            let block: [u64; 8] = guest::read(call_args)?;
            tracing::debug!("ipmimgr_call: trace {:x?}", block);
            0
        }
        op::PREPARE_CONNECT | op::CONNECT | op::INVOKE_SYNC_METHOD | op::INVOKE_ASYNC_METHOD => {
            let object = lookup_typed(runtime, handle, ObjectType::IpmiClient).ok_or(Errno::ENOENT)?;
            let client = object.as_ipmi_client().ok_or(Errno::ENOENT)?;
            client_call(runtime, client, op, call_args)?;
            0
        }
        _ => {
            tracing::warn!("ipmimgr_call: unknown op 0x{:x}", op);
            return Err(SyscallError::FAILED);
        }
    };

    guest::write(result, value)?;
    Ok(0)
}

unsafe fn create_client(runtime: &Runtime, call_args: u64) -> Result<u32, SyscallError> {
    let args: CreateClientArgs = guest::read(call_args)?;
    let name = guest::read_cstr(args.name)?;
    tracing::debug!("ipmimgr_call: create client {}", name);

    let client = IpmiClient::new(args.arg1, &name, args.arg3);
    let handle = runtime
        .object_table()
        .add(Object::new(ObjectKind::IpmiClient(client)))
        .map_err(|_| Errno::EAGAIN)?;
    Ok(handle)
}

unsafe fn client_call(runtime: &Runtime, client: &IpmiClient, op: u32, call_args: u64) -> Result<(), SyscallError> {
    match op {
        op::PREPARE_CONNECT => {
            let args: PrepareConnectArgs = guest::read(call_args)?;
            let count: u32 = guest::read(args.data + EVENT_FLAG_COUNT_OFFSET)?;
            tracing::debug!("IPMI client {}: prepare connect, {} event flags", client.name(), count);
            client.prepare_connect(count);
        }
        op::CONNECT => {
            let args: ConnectArgs = guest::read(call_args)?;
            let session = client.connect(runtime.object_table())?;
            guest::write(args.key, session.key)?;
            guest::write(args.unknown, session.unknown)?;
            guest::write(args.session_id, session.id)?;
            guest::write(args.result, session.result)?;
        }
        _ => tracing::trace!("IPMI client {}: method call 0x{:x}", client.name(), op),
    }
    Ok(())
}
