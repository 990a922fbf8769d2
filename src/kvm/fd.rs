//! Owned file descriptors.
//!
//! Every KVM object (the system handle, a VM, a vCPU, a device) is reached
//! through a file descriptor. [`Descriptor`] owns exactly one of them and
//! guarantees it is closed exactly once: either explicitly through
//! [`Descriptor::close`], which reports the close error, or implicitly when
//! the value is dropped.
//!
//! ```text
//!   open ──► Descriptor(Some(fd)) ──close()──► Descriptor(None)
//!                  │                                  │
//!                  └──────────── drop ───────────────►┘ (no-op)
//! ```
//!
//! Duplicates made with [`Descriptor::try_clone`] are independent owners of
//! the same kernel object; closing one leaves the other usable.

use super::{KvmError, Result};
use nix::fcntl::{fcntl, FcntlArg};
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

/// Exclusive owner of an open file descriptor.
pub struct Descriptor {
    fd: Option<OwnedFd>,
}

impl Descriptor {
    /// Take ownership of an already open descriptor.
    pub fn from_owned(fd: OwnedFd) -> Self {
        Self { fd: Some(fd) }
    }

    /// Wrap a raw descriptor returned by the kernel.
    ///
    /// # Safety
    ///
    /// `raw` must be open and not owned by anything else.
    pub(crate) unsafe fn from_raw(raw: RawFd) -> Self {
        Self::from_owned(unsafe { OwnedFd::from_raw_fd(raw) })
    }

    /// Whether the descriptor is still open.
    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Borrow the descriptor, if it is still open.
    pub fn as_borrowed(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(AsFd::as_fd)
    }

    /// Duplicate the descriptor.
    ///
    /// The duplicate refers to the same kernel object, is marked
    /// close-on-exec, and is closed independently of `self`.
    ///
    /// # Errors
    ///
    /// Fails with `EBADF` if `self` was already closed, or with whatever
    /// `fcntl(F_DUPFD_CLOEXEC)` reports (typically `EMFILE`).
    pub fn try_clone(&self) -> Result<Self> {
        let raw = fcntl(self.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(0))
            .map_err(|source| KvmError::Descriptor { op: "dup", source })?;
        // SAFETY: fcntl just returned a fresh descriptor that nothing else owns.
        Ok(unsafe { Self::from_raw(raw) })
    }

    /// Close the descriptor now and report the result.
    ///
    /// Closing an already closed descriptor is a no-op. The descriptor is
    /// considered released even when the kernel reports an error.
    pub fn close(&mut self) -> Result<()> {
        match self.fd.take() {
            Some(fd) => nix::unistd::close(fd.into_raw_fd())
                .map_err(|source| KvmError::Descriptor { op: "close", source }),
            None => Ok(()),
        }
    }

    /// Give up ownership without closing.
    pub fn into_owned(mut self) -> Option<OwnedFd> {
        self.fd.take()
    }
}

impl AsRawFd for Descriptor {
    /// Returns `-1` once the descriptor has been closed.
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }
}

impl From<OwnedFd> for Descriptor {
    fn from(fd: OwnedFd) -> Self {
        Self::from_owned(fd)
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Descriptor").field(&self.as_raw_fd()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use std::fs::File;

    fn dev_null() -> Descriptor {
        Descriptor::from_owned(File::open("/dev/null").unwrap().into())
    }

    fn is_valid(raw: RawFd) -> bool {
        fcntl(raw, FcntlArg::F_GETFD).is_ok()
    }

    #[test]
    fn test_close_once() {
        let mut fd = dev_null();
        let raw = fd.as_raw_fd();
        assert!(fd.is_open());
        assert!(is_valid(raw));

        fd.close().unwrap();
        assert!(!fd.is_open());
        assert_eq!(fd.as_raw_fd(), -1);

        // Second close and the drop that follows are both no-ops.
        fd.close().unwrap();
    }

    #[test]
    fn test_clone_outlives_original() {
        let mut original = dev_null();
        let copy = original.try_clone().unwrap();
        assert_ne!(original.as_raw_fd(), copy.as_raw_fd());

        original.close().unwrap();
        assert!(is_valid(copy.as_raw_fd()));
    }

    #[test]
    fn test_clone_is_cloexec() {
        let original = dev_null();
        let copy = original.try_clone().unwrap();
        let flags = fcntl(copy.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn test_clone_closed_fails() {
        let mut fd = dev_null();
        fd.close().unwrap();

        let err = fd.try_clone().unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EBADF));
    }

    #[test]
    fn test_into_owned_keeps_fd_open() {
        let fd = dev_null();
        let owned = fd.into_owned().unwrap();
        assert!(is_valid(owned.as_raw_fd()));
    }

    #[test]
    fn test_borrow_after_close() {
        let mut fd = dev_null();
        assert!(fd.as_borrowed().is_some());
        fd.close().unwrap();
        assert!(fd.as_borrowed().is_none());
        assert_eq!(fd.as_raw_fd(), -1);
    }
}
