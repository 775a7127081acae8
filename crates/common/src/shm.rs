//! Anonymous shared memory regions for response bodies
//!
//! The fetcher allocates a region as a sealed memfd, copies the response body
//! into it and detaches the descriptor for transfer. The consumer maps the
//! received descriptor read-only and serves all reads from that mapping. No
//! write access is ever exposed on a mapped region, and the mapping is torn
//! down when the region is dropped.

use std::ffi::{CString, c_void};
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, SealFlag, fcntl};
use nix::sys::memfd::{MemFdCreateFlag, memfd_create};
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use nix::unistd::ftruncate;
use thiserror::Error;
use tracing::warn;

use crate::utils::generate_region_name;

/// Errors raised while creating, transferring or mapping a region
#[derive(Error, Debug)]
pub enum MapError {
    #[error("failed to create shared memory region: {0}")]
    Create(Errno),

    #[error("failed to size shared memory region: {0}")]
    Resize(Errno),

    #[error("failed to map shared memory region: {0}")]
    Map(Errno),

    #[error("failed to seal shared memory region: {0}")]
    Seal(Errno),

    #[error("failed to duplicate region descriptor: {0}")]
    Clone(io::Error),

    #[error("failed to inspect region descriptor: {0}")]
    Stat(io::Error),

    #[error("region holds {actual} byte(s), {declared} declared")]
    LengthMismatch { declared: u64, actual: u64 },

    #[error("region length {0} exceeds addressable memory")]
    TooLarge(u64),
}

/// Errors raised while copying bytes out of a mapped region
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CopyError {
    #[error("read of {len} byte(s) at offset {offset} exceeds mapped length {mapped}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        mapped: usize,
    },

    #[error("no region is mapped")]
    Unmapped,
}

/// Transferable ownership of a region descriptor
///
/// The handle is opaque: the byte length always travels next to it in the
/// protocol, never inside it.
#[derive(Debug)]
pub struct RegionHandle(OwnedFd);

impl RegionHandle {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self(fd)
    }

    pub fn into_fd(self) -> OwnedFd {
        self.0
    }

    /// Duplicate the descriptor into a second independent handle
    pub fn try_clone(&self) -> Result<Self, MapError> {
        self.0.try_clone().map(Self).map_err(MapError::Clone)
    }
}

impl AsFd for RegionHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// A mapped shared memory region
///
/// Created either by [`SharedRegion::allocate_from`] (fetcher side, before the
/// descriptor is handed off) or [`SharedRegion::map`] (consumer side, after it
/// arrives). Zero-length regions skip the mapping entirely.
#[derive(Debug)]
pub struct SharedRegion {
    ptr: NonNull<c_void>,
    len: usize,
    fd: OwnedFd,
}

// Safety: the mapping is uniquely owned by this value and the shared pages
// are never written through it after construction.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocate a new region holding a copy of `data`
    pub fn allocate_from(data: &[u8]) -> Result<Self, MapError> {
        let name =
            CString::new(generate_region_name()).map_err(|_| MapError::Create(Errno::EINVAL))?;
        let fd = memfd_create(
            name.as_c_str(),
            MemFdCreateFlag::MFD_CLOEXEC | MemFdCreateFlag::MFD_ALLOW_SEALING,
        )
        .map_err(MapError::Create)?;
        if !data.is_empty() {
            ftruncate(&fd, data.len() as i64).map_err(MapError::Resize)?;
        }

        let region = Self::map_fd(fd, data.len(), true)?;
        if !data.is_empty() {
            // Safety: the mapping was just created writable with exactly
            // data.len() bytes and nothing else references it yet.
            let dst = unsafe {
                std::slice::from_raw_parts_mut(region.ptr.as_ptr().cast::<u8>(), region.len)
            };
            dst.copy_from_slice(data);
        }
        Ok(region)
    }

    /// Map a received handle read-only, validating it against the declared length
    ///
    /// Fails if the descriptor cannot be mapped or the underlying object is
    /// smaller than `declared_len`.
    pub fn map(handle: RegionHandle, declared_len: u64) -> Result<Self, MapError> {
        let fd = handle.into_fd();
        let len = usize::try_from(declared_len).map_err(|_| MapError::TooLarge(declared_len))?;
        let actual = region_len(&fd)?;
        if actual < declared_len {
            return Err(MapError::LengthMismatch {
                declared: declared_len,
                actual,
            });
        }
        Self::map_fd(fd, len, false)
    }

    fn map_fd(fd: OwnedFd, len: usize, writable: bool) -> Result<Self, MapError> {
        let Some(size) = NonZeroUsize::new(len) else {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len: 0,
                fd,
            });
        };
        let prot = if writable {
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        } else {
            ProtFlags::PROT_READ
        };
        // Safety: mapping a fresh address chosen by the kernel; the pointer
        // and length are kept together until munmap in Drop.
        let ptr = unsafe { mmap(None, size, prot, MapFlags::MAP_SHARED, &fd, 0) }
            .map_err(MapError::Map)?;
        Ok(Self { ptr, len, fd })
    }

    /// Seal the region against resizing and detach a handle for transfer
    ///
    /// Consumes the region; the fetcher's own mapping is released here and the
    /// bytes live on in the kernel object the handle refers to.
    pub fn into_handle(self) -> Result<RegionHandle, MapError> {
        fcntl(
            self.fd.as_raw_fd(),
            FcntlArg::F_ADD_SEALS(SealFlag::F_SEAL_SHRINK | SealFlag::F_SEAL_GROW),
        )
        .map_err(MapError::Seal)?;
        let fd = self.fd.try_clone().map_err(MapError::Clone)?;
        Ok(RegionHandle(fd))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The full mapped contents
    pub fn bytes(&self) -> &[u8] {
        // Safety: ptr/len describe a live mapping (or are dangling with len 0,
        // which from_raw_parts permits for empty slices).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }

    /// A bounds-checked window into the mapped contents
    pub fn read_slice(&self, offset: usize, len: usize) -> Result<&[u8], CopyError> {
        let out_of_bounds = CopyError::OutOfBounds {
            offset,
            len,
            mapped: self.len,
        };
        let end = offset.checked_add(len).ok_or(out_of_bounds.clone())?;
        self.bytes().get(offset..end).ok_or(out_of_bounds)
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.len != 0 {
            // Safety: ptr/len came from a successful mmap and are unmapped
            // exactly once.
            if let Err(err) = unsafe { munmap(self.ptr, self.len) } {
                warn!(error = %err, "failed to unmap shared memory region");
            }
        }
    }
}

fn region_len(fd: &OwnedFd) -> Result<u64, MapError> {
    let dup = fd.try_clone().map_err(MapError::Clone)?;
    let meta = File::from(dup).metadata().map_err(MapError::Stat)?;
    Ok(meta.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_holds_copy() {
        let region = SharedRegion::allocate_from(b"response body bytes").unwrap();
        assert_eq!(region.len(), 19);
        assert_eq!(region.bytes(), b"response body bytes");
    }

    #[test]
    fn test_region_name_reaches_kernel_object() {
        let region = SharedRegion::allocate_from(b"x").unwrap();
        let link =
            std::fs::read_link(format!("/proc/self/fd/{}", region.fd.as_raw_fd())).unwrap();
        let target = link.to_string_lossy();
        assert!(
            target.contains("memfd:relay-body-"),
            "unexpected link target: {target}"
        );
    }

    #[test]
    fn test_empty_region_skips_mapping() {
        let region = SharedRegion::allocate_from(&[]).unwrap();
        assert!(region.is_empty());
        assert_eq!(region.bytes(), b"");

        let handle = region.into_handle().unwrap();
        let mapped = SharedRegion::map(handle, 0).unwrap();
        assert!(mapped.is_empty());
    }

    #[test]
    fn test_handle_transfer_roundtrip() {
        let region = SharedRegion::allocate_from(b"hello").unwrap();
        let handle = region.into_handle().unwrap();

        let mapped = SharedRegion::map(handle, 5).unwrap();
        assert_eq!(mapped.bytes(), b"hello");
    }

    #[test]
    fn test_handle_clone_maps_same_bytes() {
        let region = SharedRegion::allocate_from(b"shared").unwrap();
        let handle = region.into_handle().unwrap();
        let other = handle.try_clone().unwrap();

        let first = SharedRegion::map(handle, 6).unwrap();
        let second = SharedRegion::map(other, 6).unwrap();
        assert_eq!(first.bytes(), second.bytes());
    }

    #[test]
    fn test_map_rejects_undersized_region() {
        let region = SharedRegion::allocate_from(b"1234").unwrap();
        let handle = region.into_handle().unwrap();

        let err = SharedRegion::map(handle, 10).unwrap_err();
        assert!(matches!(
            err,
            MapError::LengthMismatch {
                declared: 10,
                actual: 4
            }
        ));
    }

    #[test]
    fn test_map_rejects_unmappable_descriptor() {
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        let handle = RegionHandle::from_fd(read_end);

        assert!(SharedRegion::map(handle, 16).is_err());
    }

    #[test]
    fn test_sealed_region_cannot_grow() {
        let region = SharedRegion::allocate_from(b"abc").unwrap();
        let handle = region.into_handle().unwrap();

        let err = ftruncate(&handle, 1024).unwrap_err();
        assert_eq!(err, Errno::EPERM);
    }

    #[test]
    fn test_read_slice_bounds() {
        let region = SharedRegion::allocate_from(b"0123456789").unwrap();

        assert_eq!(region.read_slice(3, 4).unwrap(), b"3456");
        assert_eq!(region.read_slice(10, 0).unwrap(), b"");
        assert!(matches!(
            region.read_slice(8, 4),
            Err(CopyError::OutOfBounds { .. })
        ));
        assert!(matches!(
            region.read_slice(usize::MAX, 2),
            Err(CopyError::OutOfBounds { .. })
        ));
    }
}
