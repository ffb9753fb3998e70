//! Event port; one per process.

use crate::objects::ObjectOps;
use ob_core::Errno;

#[derive(Debug)]
pub struct Eport {
    pid: u32,
}

impl Eport {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl ObjectOps for Eport {
    fn close(&self) -> Result<(), Errno> {
        Ok(())
    }
}
