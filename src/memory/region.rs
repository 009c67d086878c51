//! Shared memory region creation and mapping

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use memmap2::{MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VermeerError};

/// Types of shared memory backing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackingType {
    /// File-backed shared memory; other processes open it by path
    FileBacked,
    /// Anonymous memory file descriptor (Linux-specific, single process)
    #[cfg(target_os = "linux")]
    MemFd,
}

/// Configuration for creating shared memory regions
#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Name of the region
    pub name: String,
    /// Total size in bytes
    pub size: usize,
    /// Backing type
    pub backing_type: BackingType,
    /// File path for file-backed regions
    pub file_path: Option<PathBuf>,
    /// Unix permissions for the backing file
    pub permissions: u32,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            size: 0,
            backing_type: BackingType::FileBacked,
            file_path: None,
            permissions: 0o600,
        }
    }
}

/// A mapped shared memory region
#[derive(Debug)]
pub struct SharedMemoryRegion {
    name: String,
    size: usize,
    mmap: MmapMut,
    file_path: Option<PathBuf>,
    owns_backing: bool,
    _file: Option<File>,
    fd: RawFd,
}

impl SharedMemoryRegion {
    /// Create a new region, truncating the backing to the requested size
    pub fn create(config: RegionConfig) -> Result<Self> {
        if config.name.is_empty() {
            return Err(VermeerError::invalid_parameter(
                "name",
                "Region name cannot be empty",
            ));
        }
        if config.size == 0 {
            return Err(VermeerError::invalid_parameter(
                "size",
                "Region size must be greater than 0",
            ));
        }

        let (file, fd, path) = match config.backing_type {
            BackingType::FileBacked => {
                let path = config
                    .file_path
                    .unwrap_or_else(|| PathBuf::from(format!("/dev/shm/{}", config.name)));
                // Truncate away any bytes a crashed owner left behind; the
                // segment must start zeroed.
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(config.permissions)
                    .open(&path)
                    .map_err(|e| VermeerError::from_io(e, "Failed to create backing file"))?;
                file.set_len(config.size as u64)
                    .map_err(|e| VermeerError::from_io(e, "Failed to set backing file size"))?;
                let fd = file.as_raw_fd();
                (Some(file), fd, Some(path))
            }
            #[cfg(target_os = "linux")]
            BackingType::MemFd => {
                let name_cstr = CString::new(config.name.clone()).map_err(|_| {
                    VermeerError::invalid_parameter("name", "Name contains null bytes")
                })?;
                let fd = unsafe { libc::memfd_create(name_cstr.as_ptr(), libc::MFD_CLOEXEC) };
                if fd == -1 {
                    return Err(VermeerError::platform("Failed to create memfd"));
                }
                if unsafe { libc::ftruncate(fd, config.size as i64) } == -1 {
                    unsafe {
                        libc::close(fd);
                    }
                    return Err(VermeerError::platform("Failed to set memfd size"));
                }
                (None, fd, None)
            }
        };

        let mmap = Self::map(fd, &file, config.size)?;

        Ok(Self {
            name: config.name,
            size: config.size,
            mmap,
            file_path: path,
            owns_backing: true,
            _file: file,
            fd,
        })
    }

    /// Map an existing file-backed region read/write
    pub fn open(name: impl Into<String>, path: PathBuf, size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| VermeerError::from_io(e, "Failed to open existing backing file"))?;
        let actual = file
            .metadata()
            .map_err(|e| VermeerError::from_io(e, "Failed to stat backing file"))?
            .len() as usize;
        if actual < size {
            return Err(VermeerError::memory(format!(
                "Backing file is {} bytes, expected at least {}",
                actual, size
            )));
        }
        let fd = file.as_raw_fd();
        let file = Some(file);
        let mmap = Self::map(fd, &file, size)?;

        Ok(Self {
            name: name.into(),
            size,
            mmap,
            file_path: Some(path),
            owns_backing: false,
            _file: file,
            fd,
        })
    }

    fn map(fd: RawFd, file: &Option<File>, size: usize) -> Result<MmapMut> {
        match file {
            Some(f) => unsafe {
                MmapOptions::new()
                    .len(size)
                    .map_mut(f)
                    .map_err(|e| VermeerError::from_io(e, "Failed to create memory mapping"))
            },
            None => {
                // memfd: borrow the fd through a temporary File without
                // letting it close on drop
                let temp_file = unsafe { File::from_raw_fd(fd) };
                let mmap = unsafe {
                    MmapOptions::new()
                        .len(size)
                        .map_mut(&temp_file)
                        .map_err(|e| VermeerError::from_io(e, "Failed to create memory mapping"))
                };
                std::mem::forget(temp_file);
                mmap
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn file_path(&self) -> Option<&PathBuf> {
        self.file_path.as_ref()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    /// Base address of the mapping
    pub fn base_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        // memfd regions close the fd we kept alive past the forgotten File
        if self._file.is_none() && self.fd != -1 {
            #[cfg(target_os = "linux")]
            unsafe {
                libc::close(self.fd);
            }
        }
        // The creator removes the backing file; late openers leave it alone.
        if self.owns_backing {
            if let Some(path) = &self.file_path {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

unsafe impl Send for SharedMemoryRegion {}
unsafe impl Sync for SharedMemoryRegion {}
