//! In-kernel device handles created with `KVM_CREATE_DEVICE`.

use super::fd::Descriptor;
use super::ioctls;
use super::{KvmError, Result};
use kvm_bindings::kvm_device_attr;
use std::os::fd::{AsRawFd, RawFd};
use tracing::debug;

/// Wrapper around an in-kernel device descriptor (VFIO bridge, GIC, ...).
///
/// Devices are configured through attributes: a `group`/`attr` pair naming
/// the setting and an `addr` pointing at the value in this process.
#[derive(Debug)]
pub struct DeviceFd {
    fd: Descriptor,
    device_type: u32,
    flags: u32,
}

impl DeviceFd {
    pub(super) fn new(fd: Descriptor, device_type: u32, flags: u32) -> Self {
        Self {
            fd,
            device_type,
            flags,
        }
    }

    /// The `KVM_DEV_TYPE_*` the device was created as.
    pub fn device_type(&self) -> u32 {
        self.device_type
    }

    /// Flags passed at creation.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Whether the device understands `attr.group`/`attr.attr`.
    ///
    /// Any kernel refusal reads as `false`: `ENXIO` for an unknown attribute,
    /// `EPERM` for a device type without attribute queries, `ENOTTY` for a
    /// descriptor that is not a device.
    pub fn has_device_attr(&self, attr: &kvm_device_attr) -> bool {
        // SAFETY: the kernel only reads the struct; `addr` is not dereferenced.
        match unsafe { ioctls::kvm_has_device_attr(self.as_raw_fd(), attr) } {
            Ok(_) => true,
            Err(errno) => {
                debug!(group = attr.group, attr = attr.attr, %errno, "device attribute absent");
                false
            }
        }
    }

    /// Set an attribute from the value at `attr.addr`.
    ///
    /// A bad `addr` is reported by the kernel as `EFAULT`.
    pub fn set_device_attr(&self, attr: &kvm_device_attr) -> Result<()> {
        // SAFETY: the kernel only reads from `addr`, through copy_from_user.
        unsafe { ioctls::kvm_set_device_attr(self.as_raw_fd(), attr) }
            .map_err(KvmError::ioctl("KVM_SET_DEVICE_ATTR"))?;
        Ok(())
    }

    /// Read an attribute into the buffer at `attr.addr`.
    ///
    /// # Safety
    ///
    /// `attr.addr` must point to writable memory large enough for the
    /// attribute's value.
    pub unsafe fn get_device_attr(&self, attr: &kvm_device_attr) -> Result<()> {
        // SAFETY: the caller vouches for the destination buffer.
        unsafe { ioctls::kvm_get_device_attr(self.as_raw_fd(), attr) }
            .map_err(KvmError::ioctl("KVM_GET_DEVICE_ATTR"))?;
        Ok(())
    }

    /// Duplicate the handle. Both copies refer to the same device.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone()?,
            device_type: self.device_type,
            flags: self.flags,
        })
    }

    /// Close the handle now and report the result.
    pub fn close(&mut self) -> Result<()> {
        self.fd.close()
    }
}

impl AsRawFd for DeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn test_attr_query_on_non_device_is_false() {
        // Any descriptor without device ioctls refuses the query.
        let null = File::open("/dev/null").unwrap();
        let mut device = DeviceFd::new(Descriptor::from_owned(null.into()), 0, 0);
        let attr = kvm_device_attr::default();
        assert!(!device.has_device_attr(&attr));

        device.close().unwrap();
        assert!(!device.has_device_attr(&attr));
        assert!(device.set_device_attr(&attr).is_err());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_vfio_device_attrs() {
        use crate::kvm::tests::kvm;
        use kvm_bindings::{
            kvm_device_type_KVM_DEV_TYPE_VFIO, KVM_DEV_VFIO_GROUP, KVM_DEV_VFIO_GROUP_ADD,
        };

        let Some(kvm) = kvm() else { return };
        let vm = kvm.create_vm().unwrap();
        if !vm.supports_device(kvm_device_type_KVM_DEV_TYPE_VFIO).unwrap() {
            eprintln!("skipping: no kvm-vfio device");
            return;
        }

        let mut device = vm.create_device(kvm_device_type_KVM_DEV_TYPE_VFIO, 0).unwrap();
        assert_eq!(device.device_type(), kvm_device_type_KVM_DEV_TYPE_VFIO);
        assert_eq!(device.flags(), 0);

        let known = kvm_device_attr {
            group: KVM_DEV_VFIO_GROUP,
            attr: u64::from(KVM_DEV_VFIO_GROUP_ADD),
            ..Default::default()
        };
        assert!(device.has_device_attr(&known));

        let unknown = kvm_device_attr {
            group: 0xff,
            ..Default::default()
        };
        assert!(!device.has_device_attr(&unknown));

        // Adding a group that is not a VFIO group fd fails in the kernel.
        let bogus: i32 = -1;
        let add = kvm_device_attr {
            addr: &bogus as *const i32 as u64,
            ..known
        };
        assert!(device.set_device_attr(&add).is_err());

        let clone = device.try_clone().unwrap();
        device.close().unwrap();
        assert!(clone.has_device_attr(&known));
    }
}
