//! IPMI clients
//!
//! System libraries talk to system services over IPMI. Nothing answers on
//! the other side; a client only hands out a fixed session and creates the
//! event flags the library opens by name right after connecting.

use super::{Object, ObjectKind, ObjectOps};
use crate::object_table::ObjectTable;
use crate::sync::event_flag::{attr, EventFlag};
use ob_core::Errno;
use std::sync::atomic::{AtomicU32, Ordering};

pub const SESSION_KEY: u64 = 0xBEEF_BEEF_BEEF_BEEF;
pub const SESSION_UNKNOWN: u32 = 0xBEEF0;
pub const SESSION_ID: u32 = 1;

/// Longest event flag name, excluding the terminator.
const MAX_EVENT_FLAG_NAME: usize = 31;

/// Values a connect reports back to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub key: u64,
    pub unknown: u32,
    pub id: u32,
    pub result: u32,
}

#[derive(Debug)]
pub struct IpmiClient {
    name: String,
    arg1: u64,
    arg3: u64,
    event_flag_count: AtomicU32,
}

impl IpmiClient {
    pub fn new(arg1: u64, name: &str, arg3: u64) -> Self {
        Self {
            name: name.to_string(),
            arg1,
            arg3,
            event_flag_count: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> (u64, u64) {
        (self.arg1, self.arg3)
    }

    pub fn event_flag_count(&self) -> u32 {
        self.event_flag_count.load(Ordering::Acquire)
    }

    pub fn prepare_connect(&self, event_flag_count: u32) {
        self.event_flag_count.store(event_flag_count, Ordering::Release);
    }

    /// Name of the `index`th event flag of a session.
    pub fn event_flag_name(&self, session: &Session, index: u32) -> String {
        let (prefix, name) = match self.name.get(..3) {
            Some(prefix @ ("sce" | "Sce")) => (prefix, &self.name[3..]),
            _ => ("Sce", self.name.as_str()),
        };
        let mut full = format!(
            "{:.3}{:.12}{:05x}{:02x}{:x}{:08x}",
            prefix, name, session.unknown, session.id, index, session.key as u32
        );
        full.truncate(MAX_EVENT_FLAG_NAME);
        full
    }

    /// Open the session and register one event flag per prepared slot, plus
    /// one extra.
    pub fn connect(&self, table: &ObjectTable) -> Result<Session, Errno> {
        let session = Session {
            key: SESSION_KEY,
            unknown: SESSION_UNKNOWN,
            id: SESSION_ID,
            result: 0,
        };

        for index in 0..=self.event_flag_count() {
            let name = self.event_flag_name(&session, index);
            let evf = Object::new(ObjectKind::EventFlag(EventFlag::new(attr::MULTI_WAITER, 0)));
            let handle = table.add(evf)?;
            if let Err(e) = table.add_name(&name, handle) {
                tracing::warn!("IPMI client {}: event flag {} not registered: {}", self.name, name, e);
                table.release(handle)?;
                continue;
            }
            tracing::debug!("IPMI client {}: created event flag {} ({})", self.name, name, handle);
        }

        Ok(session)
    }
}

impl ObjectOps for IpmiClient {
    fn close(&self) -> Result<(), Errno> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::ObjectType;

    fn session() -> Session {
        Session {
            key: SESSION_KEY,
            unknown: SESSION_UNKNOWN,
            id: SESSION_ID,
            result: 0,
        }
    }

    #[test]
    fn test_event_flag_name_keeps_sce_prefix() {
        let client = IpmiClient::new(0, "SceSysCore", 0);
        assert_eq!(client.event_flag_name(&session(), 0), "SceSysCorebeef0010beefbeef");
    }

    #[test]
    fn test_event_flag_name_adds_prefix() {
        let client = IpmiClient::new(0, "NpManagerService", 0);
        let name = client.event_flag_name(&session(), 2);
        assert_eq!(name, "SceNpManagerSerbeef0012beefbeef");
        assert_eq!(name.len(), MAX_EVENT_FLAG_NAME);

        let client = IpmiClient::new(0, "Sc", 0);
        assert_eq!(client.event_flag_name(&session(), 0), "SceScbeef0010beefbeef");
    }

    #[test]
    fn test_connect_creates_event_flags() {
        let table = ObjectTable::new();
        let client = IpmiClient::new(1, "SceAppMessaging", 3);
        client.prepare_connect(2);

        let reply = client.connect(&table).unwrap();
        assert_eq!(reply, session());
        assert_eq!(table.objects_by_type(ObjectType::EventFlag).len(), 3);

        for index in 0..3 {
            let name = client.event_flag_name(&reply, index);
            let handle = table.lookup_by_name(&name).unwrap();
            let object = table.lookup(handle).unwrap();
            assert!(object.as_event_flag().is_some());
        }
    }
}
