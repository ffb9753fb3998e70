//! Host-backed regular files

use super::ObjectOps;
use ob_core::Errno;
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Open flags
pub mod flags {
    pub const O_RDONLY: u32 = 0x0000;
    pub const O_WRONLY: u32 = 0x0001;
    pub const O_RDWR: u32 = 0x0002;
    pub const O_ACCMODE: u32 = 0x0003;
    pub const O_APPEND: u32 = 0x0008;
    pub const O_CREAT: u32 = 0x0200;
    pub const O_TRUNC: u32 = 0x0400;
    pub const O_EXCL: u32 = 0x0800;
}

#[derive(Debug)]
pub struct File {
    path: PathBuf,
    flags: u32,
    file: Mutex<Option<std::fs::File>>,
}

impl File {
    pub fn open(path: &Path, open_flags: u32) -> Result<Self, Errno> {
        let mut options = std::fs::OpenOptions::new();
        match open_flags & flags::O_ACCMODE {
            flags::O_WRONLY => options.write(true),
            flags::O_RDWR => options.read(true).write(true),
            _ => options.read(true),
        };
        if open_flags & flags::O_APPEND != 0 {
            options.append(true);
        }
        if open_flags & flags::O_TRUNC != 0 {
            options.truncate(true);
        }
        if open_flags & flags::O_CREAT != 0 {
            if open_flags & flags::O_EXCL != 0 {
                options.create_new(true);
            } else {
                options.create(true);
            }
        }

        let file = options.open(path).map_err(|e| {
            tracing::debug!("Failed to open {}: {}", path.display(), e);
            match e.kind() {
                std::io::ErrorKind::NotFound => Errno::ENOENT,
                std::io::ErrorKind::PermissionDenied => Errno::EPERM,
                _ => Errno::EIO,
            }
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            flags: open_flags,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }
}

impl ObjectOps for File {
    fn close(&self) -> Result<(), Errno> {
        self.file.lock().take().map(drop).ok_or(Errno::EBADF)
    }

    fn read(&self, buffer: &mut [u8]) -> Result<usize, Errno> {
        let mut file = self.file.lock();
        let file = file.as_mut().ok_or(Errno::EBADF)?;
        file.read(buffer).map_err(|_| Errno::EIO)
    }

    fn write(&self, data: &[u8]) -> Result<usize, Errno> {
        let mut file = self.file.lock();
        let file = file.as_mut().ok_or(Errno::EBADF)?;
        file.write(data).map_err(|_| Errno::EIO)
    }

    fn truncate(&self, length: u64) -> Result<(), Errno> {
        let file = self.file.lock();
        let file = file.as_ref().ok_or(Errno::EBADF)?;
        file.set_len(length).map_err(|_| Errno::EIO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("save.dat");

        let file = File::open(&path, flags::O_WRONLY | flags::O_CREAT).unwrap();
        assert_eq!(file.write(b"orbis").unwrap(), 5);
        file.close().unwrap();
        assert_eq!(file.write(b"x"), Err(Errno::EBADF));
        assert_eq!(file.close(), Err(Errno::EBADF));

        let file = File::open(&path, flags::O_RDONLY).unwrap();
        let mut buffer = [0u8; 16];
        assert_eq!(file.read(&mut buffer).unwrap(), 5);
        assert_eq!(&buffer[..5], b"orbis");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = File::open(&dir.path().join("absent"), flags::O_RDONLY);
        assert!(matches!(result, Err(Errno::ENOENT)));
    }

    #[test]
    fn test_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.dat");
        let file = File::open(&path, flags::O_RDWR | flags::O_CREAT).unwrap();
        file.truncate(64).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64);
    }
}
