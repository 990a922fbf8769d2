//! Kernel event counters.
//!
//! An [`EventFd`] wraps a Linux `eventfd`: a 64-bit counter that can be
//! signalled from one place and consumed from another. KVM uses them in two
//! directions:
//!
//! - **irqfd**: writing to the counter injects a guest interrupt.
//! - **ioeventfd**: a guest write to a registered address bumps the counter
//!   instead of causing a vCPU exit.

use super::fd::Descriptor;
use super::{KvmError, Result};
use nix::errno::Errno;
use std::mem::size_of;
use std::os::fd::{AsRawFd, RawFd};

/// Read returns 1 and decrements the counter, instead of draining it.
pub const EFD_SEMAPHORE: i32 = libc::EFD_SEMAPHORE;

/// Reads on an empty counter fail with `EAGAIN` instead of blocking.
pub const EFD_NONBLOCK: i32 = libc::EFD_NONBLOCK;

/// A counter-style event descriptor.
#[derive(Debug)]
pub struct EventFd {
    fd: Descriptor,
}

impl EventFd {
    /// Create a counter starting at zero.
    ///
    /// `flags` is any combination of [`EFD_NONBLOCK`] and [`EFD_SEMAPHORE`].
    /// The descriptor is always created close-on-exec.
    pub fn new(flags: i32) -> Result<Self> {
        // SAFETY: eventfd takes no pointers.
        let raw = Errno::result(unsafe { libc::eventfd(0, flags | libc::EFD_CLOEXEC) })
            .map_err(|source| KvmError::Descriptor { op: "eventfd", source })?;
        tracing::debug!(fd = raw, flags, "created eventfd");

        // SAFETY: eventfd just returned a fresh descriptor.
        Ok(Self { fd: unsafe { Descriptor::from_raw(raw) } })
    }

    /// Add `value` to the counter.
    pub fn write(&self, value: u64) -> Result<()> {
        let bytes = value.to_ne_bytes();
        // SAFETY: the buffer is valid for its full length.
        let ret = unsafe { libc::write(self.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
        Errno::result(ret).map_err(|source| KvmError::Descriptor { op: "eventfd write", source })?;
        Ok(())
    }

    /// Consume the counter.
    ///
    /// Returns the whole count and resets it to zero, or returns 1 and
    /// decrements it in semaphore mode.
    pub fn read(&self) -> Result<u64> {
        let mut bytes = [0u8; size_of::<u64>()];
        // SAFETY: the buffer is valid for its full length.
        let ret = unsafe { libc::read(self.as_raw_fd(), bytes.as_mut_ptr().cast(), bytes.len()) };
        Errno::result(ret).map_err(|source| KvmError::Descriptor { op: "eventfd read", source })?;
        Ok(u64::from_ne_bytes(bytes))
    }

    /// Duplicate the descriptor. Both copies share the same counter.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self { fd: self.fd.try_clone()? })
    }

    /// Close the descriptor now and report the result.
    pub fn close(&mut self) -> Result<()> {
        self.fd.close()
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let evt = EventFd::new(0).unwrap();
        evt.write(3).unwrap();
        evt.write(4).unwrap();
        assert_eq!(evt.read().unwrap(), 7);
    }

    #[test]
    fn test_nonblocking_empty_read() {
        let evt = EventFd::new(EFD_NONBLOCK).unwrap();
        let err = evt.read().unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EAGAIN));
    }

    #[test]
    fn test_semaphore_mode() {
        let evt = EventFd::new(EFD_SEMAPHORE | EFD_NONBLOCK).unwrap();
        evt.write(2).unwrap();
        assert_eq!(evt.read().unwrap(), 1);
        assert_eq!(evt.read().unwrap(), 1);
        assert!(evt.read().is_err());
    }

    #[test]
    fn test_clone_shares_counter() {
        let evt = EventFd::new(EFD_NONBLOCK).unwrap();
        let mut copy = evt.try_clone().unwrap();
        copy.write(5).unwrap();
        copy.close().unwrap();
        assert_eq!(evt.read().unwrap(), 5);
    }
}
