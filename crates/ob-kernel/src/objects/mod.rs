//! Kernel objects
//!
//! An [`Object`] is a tagged variant over everything the guest can hold a
//! handle to. Each kind implements the subset of [`ObjectOps`] it supports;
//! the rest report `ENODEV`.

pub mod device;
pub mod file;
pub mod ipmi;
pub mod shared_memory;
pub mod socket;

pub use device::{Device, DeviceKind};
pub use file::File;
pub use ipmi::IpmiClient;
pub use shared_memory::SharedMemory;
pub use socket::Socket;

use crate::object_table::Handle;
use crate::sync::{Eport, EventFlag, Queue, Semaphore};
use ob_core::Errno;
use ob_loader::Module;
use parking_lot::Mutex;
use std::sync::Arc;

/// Kernel object types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Module,
    Device,
    File,
    SharedMemory,
    Socket,
    Queue,
    Semaphore,
    Eport,
    EventFlag,
    IpmiClient,
}

/// Arguments of an object-backed `mmap`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapRequest {
    pub addr: u64,
    pub len: u64,
    pub prot: u32,
    pub flags: u32,
    pub offset: u64,
}

/// Operations a guest can apply to a handle.
pub trait ObjectOps {
    fn close(&self) -> Result<(), Errno> {
        Err(Errno::ENODEV)
    }

    fn read(&self, _buffer: &mut [u8]) -> Result<usize, Errno> {
        Err(Errno::ENODEV)
    }

    fn write(&self, _data: &[u8]) -> Result<usize, Errno> {
        Err(Errno::ENODEV)
    }

    fn truncate(&self, _length: u64) -> Result<(), Errno> {
        Err(Errno::ENODEV)
    }

    /// # Safety
    ///
    /// `argp` must be valid for the access `request` implies.
    unsafe fn ioctl(&self, _request: u32, _argp: u64) -> Result<(), Errno> {
        Err(Errno::ENODEV)
    }

    fn mmap(&self, _request: &MapRequest) -> Result<u64, Errno> {
        Err(Errno::ENODEV)
    }
}

impl ObjectOps for Module {
    fn close(&self) -> Result<(), Errno> {
        Ok(())
    }
}

pub enum ObjectKind {
    Module(Module),
    Device(Device),
    File(File),
    SharedMemory(SharedMemory),
    Socket(Socket),
    Queue(Queue),
    Semaphore(Semaphore),
    Eport(Eport),
    EventFlag(EventFlag),
    IpmiClient(IpmiClient),
}

/// Reference-counted kernel object. The `Arc` strong count is the pointer
/// reference count; handles are tracked separately by the object table.
pub struct Object {
    kind: ObjectKind,
    handles: Mutex<Vec<Handle>>,
    name: Mutex<Option<String>>,
}

impl Object {
    pub fn new(kind: ObjectKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            handles: Mutex::new(Vec::new()),
            name: Mutex::new(None),
        })
    }

    pub fn object_type(&self) -> ObjectType {
        match &self.kind {
            ObjectKind::Module(_) => ObjectType::Module,
            ObjectKind::Device(_) => ObjectType::Device,
            ObjectKind::File(_) => ObjectType::File,
            ObjectKind::SharedMemory(_) => ObjectType::SharedMemory,
            ObjectKind::Socket(_) => ObjectType::Socket,
            ObjectKind::Queue(_) => ObjectType::Queue,
            ObjectKind::Semaphore(_) => ObjectType::Semaphore,
            ObjectKind::Eport(_) => ObjectType::Eport,
            ObjectKind::EventFlag(_) => ObjectType::EventFlag,
            ObjectKind::IpmiClient(_) => ObjectType::IpmiClient,
        }
    }

    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    /// First handle still referring to this object.
    pub fn handle(&self) -> Option<Handle> {
        self.handles.lock().first().copied()
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.handles.lock().clone()
    }

    pub(crate) fn push_handle(&self, handle: Handle) {
        self.handles.lock().push(handle);
    }

    /// Forget `handle`; returns the handles left.
    pub(crate) fn remove_handle(&self, handle: Handle) -> Vec<Handle> {
        let mut handles = self.handles.lock();
        handles.retain(|&h| h != handle);
        handles.clone()
    }

    pub(crate) fn clear_handles(&self) {
        self.handles.lock().clear();
    }

    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.lock() = Some(name.to_string());
    }

    /// Pointer references held on this object.
    pub fn ref_count(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    pub fn as_module(&self) -> Option<&Module> {
        match &self.kind {
            ObjectKind::Module(module) => Some(module),
            _ => None,
        }
    }

    pub fn as_shared_memory(&self) -> Option<&SharedMemory> {
        match &self.kind {
            ObjectKind::SharedMemory(shm) => Some(shm),
            _ => None,
        }
    }

    pub fn as_socket(&self) -> Option<&Socket> {
        match &self.kind {
            ObjectKind::Socket(socket) => Some(socket),
            _ => None,
        }
    }

    pub fn as_event_flag(&self) -> Option<&EventFlag> {
        match &self.kind {
            ObjectKind::EventFlag(evf) => Some(evf),
            _ => None,
        }
    }

    pub fn as_semaphore(&self) -> Option<&Semaphore> {
        match &self.kind {
            ObjectKind::Semaphore(sem) => Some(sem),
            _ => None,
        }
    }

    pub fn as_ipmi_client(&self) -> Option<&IpmiClient> {
        match &self.kind {
            ObjectKind::IpmiClient(client) => Some(client),
            _ => None,
        }
    }

    fn ops(&self) -> &dyn ObjectOps {
        match &self.kind {
            ObjectKind::Module(o) => o,
            ObjectKind::Device(o) => o,
            ObjectKind::File(o) => o,
            ObjectKind::SharedMemory(o) => o,
            ObjectKind::Socket(o) => o,
            ObjectKind::Queue(o) => o,
            ObjectKind::Semaphore(o) => o,
            ObjectKind::Eport(o) => o,
            ObjectKind::EventFlag(o) => o,
            ObjectKind::IpmiClient(o) => o,
        }
    }
}

impl ObjectOps for Object {
    fn close(&self) -> Result<(), Errno> {
        self.ops().close()
    }

    fn read(&self, buffer: &mut [u8]) -> Result<usize, Errno> {
        self.ops().read(buffer)
    }

    fn write(&self, data: &[u8]) -> Result<usize, Errno> {
        self.ops().write(data)
    }

    fn truncate(&self, length: u64) -> Result<(), Errno> {
        self.ops().truncate(length)
    }

    unsafe fn ioctl(&self, request: u32, argp: u64) -> Result<(), Errno> {
        self.ops().ioctl(request, argp)
    }

    fn mmap(&self, request: &MapRequest) -> Result<u64, Errno> {
        self.ops().mmap(request)
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("type", &self.object_type())
            .field("handles", &*self.handles.lock())
            .field("name", &*self.name.lock())
            .finish()
    }
}
