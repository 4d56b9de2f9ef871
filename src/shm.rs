//! Shared memory mappings
//!
//! `ShmMapping` owns both the descriptor and the mapped region; dropping it
//! unmaps and closes exactly once. The server maps producer buffers
//! read-only, the producer maps its own memfd read-write.

use std::ffi::{CString, c_void};
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use tracing::warn;

/// An owned `MAP_SHARED` mapping of a whole-file region.
#[derive(Debug)]
pub struct ShmMapping {
    ptr: NonNull<c_void>,
    len: usize,
    writable: bool,
    fd: OwnedFd,
}

// SAFETY: the mapping is exclusively owned by this value and is only handed
// out through borrows of it.
unsafe impl Send for ShmMapping {}

impl ShmMapping {
    /// Map `len` bytes of `fd` read-only.
    ///
    /// Fails if the file is shorter than `len`, since touching pages past
    /// the end of a file raises `SIGBUS` instead of an error.
    pub fn map_readonly(fd: OwnedFd, len: usize) -> io::Result<Self> {
        Self::map(fd, len, false)
    }

    /// Map `len` bytes of `fd` read-write.
    pub fn map_readwrite(fd: OwnedFd, len: usize) -> io::Result<Self> {
        Self::map(fd, len, true)
    }

    fn map(fd: OwnedFd, len: usize, writable: bool) -> io::Result<Self> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero-length mapping"))?;

        let file = File::from(fd);
        let file_len = file.metadata()?.len();
        if file_len < len as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer is {} bytes, need {}", file_len, len),
            ));
        }
        let fd = OwnedFd::from(file);

        let prot = if writable {
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        } else {
            ProtFlags::PROT_READ
        };

        // SAFETY: fresh mapping chosen by the kernel; the length was checked
        // against the file size above.
        let ptr = unsafe { mmap(None, length, prot, MapFlags::MAP_SHARED, &fd, 0) }
            .map_err(io::Error::from)?;

        Ok(Self { ptr, len, writable, fd })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The descriptor backing this mapping
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// View the whole mapping.
    ///
    /// The peer can write to a shared mapping at any time. A producer that
    /// follows the double-buffer protocol never writes the committed half,
    /// but a misbehaving one can, and the bytes seen here are then torn.
    /// Copy out with `to_vec` for a stable snapshot.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) }
    }

    /// Mutable view, only for read-write mappings
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if !self.writable {
            return None;
        }
        // SAFETY: ptr/len describe a live writable mapping owned by self,
        // and &mut self rules out other borrows.
        Some(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.len) })
    }
}

impl Drop for ShmMapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            warn!("munmap of {} bytes failed: {}", self.len, e);
        }
        // fd closes when the OwnedFd field drops
    }
}

/// Create an anonymous memfd of `len` bytes that accepts seals.
pub fn create_memfd(name: &str, len: u64) -> io::Result<OwnedFd> {
    let name = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "memfd name contains NUL"))?;

    // SAFETY: name is a valid NUL-terminated string.
    let raw = unsafe {
        libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING)
    };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: memfd_create returned a fresh descriptor we now own.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let file = File::from(fd);
    file.set_len(len)?;
    Ok(OwnedFd::from(file))
}

/// Whether the file behind `fd` can no longer shrink.
///
/// Mapping a file that may later shrink risks `SIGBUS` on access, so peer
/// buffers must carry `F_SEAL_SHRINK`. Most non-shmem descriptors do not
/// support seals and report an error.
pub fn is_shrink_sealed(fd: BorrowedFd<'_>) -> io::Result<bool> {
    // SAFETY: plain fcntl on a borrowed, open descriptor.
    let seals = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GET_SEALS) };
    if seals < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(seals & libc::F_SEAL_SHRINK != 0)
}

/// Freeze the size of a memfd so the reader can never be handed a
/// shrinking buffer.
pub fn seal_size(fd: BorrowedFd<'_>) -> io::Result<()> {
    for seals in [libc::F_SEAL_SHRINK | libc::F_SEAL_GROW, libc::F_SEAL_SEAL] {
        // SAFETY: plain fcntl on a borrowed, open descriptor.
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_ADD_SEALS, seals) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_sees_writer_bytes() {
        let fd = create_memfd("shm-test", 4096).unwrap();
        let reader_fd = fd.try_clone().unwrap();

        let mut writer = ShmMapping::map_readwrite(fd, 4096).unwrap();
        let reader = ShmMapping::map_readonly(reader_fd, 4096).unwrap();

        writer.as_mut_slice().unwrap()[100..104].copy_from_slice(b"RGBA");
        assert_eq!(&reader.as_slice()[100..104], b"RGBA");
        assert_eq!(reader.len(), 4096);
    }

    #[test]
    fn test_readonly_has_no_mut_view() {
        let fd = create_memfd("shm-test", 16).unwrap();
        let mut mapping = ShmMapping::map_readonly(fd, 16).unwrap();
        assert!(mapping.as_mut_slice().is_none());
    }

    #[test]
    fn test_short_file_is_rejected() {
        let fd = create_memfd("shm-test", 1024).unwrap();
        let err = ShmMapping::map_readonly(fd, 2048).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_zero_length_is_rejected() {
        let fd = create_memfd("shm-test", 0).unwrap();
        assert!(ShmMapping::map_readonly(fd, 0).is_err());
    }

    #[test]
    fn test_shrink_seal_detection() {
        let fd = create_memfd("shm-test", 64).unwrap();
        assert!(!is_shrink_sealed(fd.as_fd()).unwrap());
        seal_size(fd.as_fd()).unwrap();
        assert!(is_shrink_sealed(fd.as_fd()).unwrap());

        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("plain")).unwrap();
        // EINVAL on most filesystems, unsealed on tmpfs
        assert!(!matches!(is_shrink_sealed(file.as_fd()), Ok(true)));
    }

    #[test]
    fn test_sealed_memfd_cannot_resize() {
        let fd = create_memfd("shm-test", 4096).unwrap();
        seal_size(fd.as_fd()).unwrap();
        let file = File::from(fd);
        assert!(file.set_len(8192).is_err());
        assert!(file.set_len(1024).is_err());
    }
}
