//! POSIX shared memory segments for co-located data transfers.
//!
//! The sender creates a segment named after an integer key, fills it and
//! announces it with an `H` line; the receiver maps it read-only and drops
//! the mapping on `Z`. Each side detaches exactly once, either explicitly or
//! on drop. The creator also unlinks the name.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;

use crate::error::{Error, Result};

/// A mapping owned by a [`SharedSegment`].
#[derive(Debug)]
struct Mapping {
    /// Start of the mapping.
    ptr: NonNull<c_void>,
    /// Mapped length in bytes.
    len: usize,
}

/// A mapped POSIX shared memory object.
#[derive(Debug)]
pub struct SharedSegment {
    /// Integer key naming the object.
    key: i32,
    /// Live mapping; `None` once detached.
    map: Option<Mapping>,
    /// Created (and writable) by this side.
    owner: bool,
}

/// Object name for `key`.
fn segment_name(key: i32) -> String {
    format!("/rts-{key}")
}

impl SharedSegment {
    /// Creates a zero-filled segment of `len` bytes, failing if the key is
    /// taken.
    pub fn create(key: i32, len: usize) -> Result<Self> {
        let size = NonZeroUsize::new(len).ok_or(Error::Errno(Errno::EINVAL))?;
        let name = segment_name(key);
        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        let file = File::from(fd);
        let mapped = file
            .set_len(len as u64)
            .map_err(Error::from)
            // SAFETY: fresh shared mapping of a file we just sized; the
            // pointer is only used through `Mapping` while it is alive.
            .and_then(|()| unsafe {
                mmap(
                    None,
                    size,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_SHARED,
                    &file,
                    0,
                )
                .map_err(Error::from)
            });
        match mapped {
            Ok(ptr) => {
                tracing::debug!(key, len, "created shared segment");
                Ok(Self {
                    key,
                    map: Some(Mapping { ptr, len }),
                    owner: true,
                })
            }
            Err(e) => {
                let _ = shm_unlink(name.as_str());
                Err(e)
            }
        }
    }

    /// Maps an existing segment read-only.
    pub fn attach(key: i32) -> Result<Self> {
        let fd = shm_open(segment_name(key).as_str(), OFlag::O_RDONLY, Mode::empty())?;
        let file = File::from(fd);
        let len = usize::try_from(file.metadata()?.len()).map_err(|_| Errno::EOVERFLOW)?;
        let size = NonZeroUsize::new(len).ok_or(Error::Errno(Errno::EINVAL))?;
        // SAFETY: read-only shared mapping of the whole object; the pointer is
        // only used through `Mapping` while it is alive.
        let ptr = unsafe { mmap(None, size, ProtFlags::PROT_READ, MapFlags::MAP_SHARED, &file, 0)? };
        tracing::debug!(key, len, "attached shared segment");
        Ok(Self {
            key,
            map: Some(Mapping { ptr, len }),
            owner: false,
        })
    }

    /// Integer key.
    pub const fn key(&self) -> i32 {
        self.key
    }

    /// Mapped length; 0 once detached.
    pub fn len(&self) -> usize {
        self.map.as_ref().map_or(0, |m| m.len)
    }

    /// `true` once detached.
    pub const fn is_empty(&self) -> bool {
        self.map.is_none()
    }

    /// `true` while mapped.
    pub const fn is_attached(&self) -> bool {
        self.map.is_some()
    }

    /// Mapped bytes.
    pub fn as_slice(&self) -> Result<&[u8]> {
        let map = self.map.as_ref().ok_or(Error::SharedDetached(self.key))?;
        // SAFETY: the mapping is live for `len` bytes while `self.map` holds it.
        Ok(unsafe { std::slice::from_raw_parts(map.ptr.as_ptr().cast::<u8>(), map.len) })
    }

    /// Copies `data` into the segment at `offset`. Only the creator writes.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let key = self.key;
        let owner = self.owner;
        let map = self.map.as_mut().ok_or(Error::SharedDetached(key))?;
        let end = offset.checked_add(data.len());
        if !owner {
            return Err(Error::Errno(Errno::EACCES));
        }
        if end.is_none_or(|end| end > map.len) {
            return Err(Error::SharedBounds { key, len: map.len });
        }
        // SAFETY: the writable mapping is live and `offset + data.len()` is
        // within its length.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                map.ptr.as_ptr().cast::<u8>().add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    /// Unmaps the segment; the creator also unlinks its name.
    ///
    /// A second call fails with [`Error::SharedDetached`].
    pub fn detach(&mut self) -> Result<()> {
        let map = self.map.take().ok_or(Error::SharedDetached(self.key))?;
        // SAFETY: `map` came from a successful mmap of `len` bytes and is
        // unmapped exactly once, here.
        unsafe { munmap(map.ptr, map.len)? };
        if self.owner {
            shm_unlink(segment_name(self.key).as_str())?;
        }
        tracing::debug!(key = self.key, "detached shared segment");
        Ok(())
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if self.map.is_some() {
            if let Err(e) = self.detach() {
                tracing::warn!(key = self.key, error = %e, "shared segment detach failed");
            }
        }
    }
}
