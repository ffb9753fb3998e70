//! Semaphore (osem_*)

use crate::objects::ObjectOps;
use ob_core::Errno;
use parking_lot::Mutex;

#[derive(Debug)]
pub struct Semaphore {
    attributes: u32,
    max_count: i32,
    count: Mutex<i32>,
}

impl Semaphore {
    pub fn new(attributes: u32, initial_count: i32, max_count: i32) -> Self {
        Self {
            attributes,
            max_count,
            count: Mutex::new(initial_count),
        }
    }

    pub fn attributes(&self) -> u32 {
        self.attributes
    }

    pub fn max_count(&self) -> i32 {
        self.max_count
    }

    pub fn count(&self) -> i32 {
        *self.count.lock()
    }

    /// Add `n` to the count, refusing to exceed the maximum.
    pub fn signal(&self, n: i32) -> Result<(), Errno> {
        let mut count = self.count.lock();
        if n <= 0 || *count + n > self.max_count {
            return Err(Errno::EINVAL);
        }
        *count += n;
        Ok(())
    }

    /// Take `n` if available without blocking.
    pub fn try_wait(&self, n: i32) -> Result<(), Errno> {
        let mut count = self.count.lock();
        if n <= 0 || n > self.max_count {
            return Err(Errno::EINVAL);
        }
        if *count < n {
            return Err(Errno::EBUSY);
        }
        *count -= n;
        Ok(())
    }
}

impl ObjectOps for Semaphore {
    fn close(&self) -> Result<(), Errno> {
        Ok(())
    }
}
