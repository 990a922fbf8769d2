//! Virtual machine handles.
//!
//! A [`VmFd`] owns a VM descriptor and is the only way to create vCPUs and
//! in-kernel devices, register guest memory, and wire interrupts.
//!
//! # Memory Regions
//!
//! Guest memory is managed through "memory slots". Each slot maps a range of
//! guest physical addresses to host virtual addresses:
//!
//! ```text
//! Guest Physical          Host Virtual
//! ┌──────────────┐       ┌──────────────┐
//! │ guest_addr   │ ────► │ host_addr    │
//! │              │       │ (mmap'd)     │
//! │ + size - 1   │       │              │
//! └──────────────┘       └──────────────┘
//! ```
//!
//! # Interrupt wiring
//!
//! - **irqfd**: signalling an [`EventFd`] raises a GSI in the guest.
//! - **ioeventfd**: a guest write to a port or MMIO address signals an
//!   [`EventFd`] without exiting to userspace.
//! - **GSI routing**: maps GSIs to in-kernel irqchip pins or MSI messages.
//!
//! # x86 platform pieces
//!
//! Before an x86 VM runs, a VMM usually sets a TSS address (Intel VT-x needs
//! three pages it can own), creates the in-kernel PIC + IOAPIC with
//! [`VmFd::create_irq_chip`], and the 8254 PIT with [`VmFd::create_pit2`].

use super::eventfd::EventFd;
use super::exit::RunRegion;
use super::fd::Descriptor;
use super::ioctls::{self, ioctl_with_val};
use super::{check_extension, Cap, DeviceFd, IrqRouting, KvmError, Result, VcpuFd};
use kvm_bindings::{
    kvm_create_device, kvm_enable_cap, kvm_ioeventfd, kvm_irq_level, kvm_irqfd,
    kvm_userspace_memory_region, KVM_CREATE_DEVICE_TEST, KVM_IRQFD_FLAG_DEASSIGN,
};
use libc::c_ulong;
use nix::errno::Errno;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tracing::debug;
use vm_memory::{Address, GuestAddress};

#[cfg(target_arch = "x86_64")]
use kvm_bindings::{kvm_clock_data, kvm_irqchip, kvm_pit_config, kvm_pit_state2};

#[cfg(target_arch = "aarch64")]
use kvm_bindings::kvm_vcpu_init;

const IOEVENTFD_FLAG_DATAMATCH: u32 = 1 << 0;
const IOEVENTFD_FLAG_PIO: u32 = 1 << 1;
const IOEVENTFD_FLAG_DEASSIGN: u32 = 1 << 2;

/// One guest-physical to host-virtual mapping, installed in a memory slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserMemoryRegion {
    pub slot: u32,
    /// `KVM_MEM_LOG_DIRTY_PAGES`, `KVM_MEM_READONLY`.
    pub flags: u32,
    pub guest_addr: GuestAddress,
    /// Size in bytes. Zero deletes the slot.
    pub size: u64,
    /// Host virtual address backing the region.
    pub host_addr: u64,
}

impl UserMemoryRegion {
    pub fn new(slot: u32, guest_addr: GuestAddress, size: u64, host_addr: u64) -> Self {
        Self {
            slot,
            flags: 0,
            guest_addr,
            size,
            host_addr,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Last guest address covered, or `None` for an empty region or one that
    /// wraps the guest address space.
    pub fn last_addr(&self) -> Option<GuestAddress> {
        self.size.checked_sub(1).and_then(|len| self.guest_addr.checked_add(len))
    }
}

impl From<UserMemoryRegion> for kvm_userspace_memory_region {
    fn from(region: UserMemoryRegion) -> Self {
        kvm_userspace_memory_region {
            slot: region.slot,
            flags: region.flags,
            guest_phys_addr: region.guest_addr.raw_value(),
            memory_size: region.size,
            userspace_addr: region.host_addr,
        }
    }
}

/// Where an ioeventfd listens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoEventAddress {
    /// I/O port.
    Pio(u64),
    /// Guest-physical MMIO address.
    Mmio(u64),
}

/// Which guest writes trigger an ioeventfd.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Datamatch {
    /// Any write, of any length.
    Any,
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
}

impl Datamatch {
    /// Access length in bytes, match value, and whether matching is enabled.
    fn encode(self) -> (u32, u64, bool) {
        match self {
            Self::Any => (0, 0, false),
            Self::U8(value) => (1, value.into(), true),
            Self::U16(value) => (2, value.into(), true),
            Self::U32(value) => (4, value.into(), true),
            Self::U64(value) => (8, value, true),
        }
    }
}

fn ioeventfd_request(
    evt: &EventFd,
    addr: IoEventAddress,
    datamatch: Datamatch,
    deassign: bool,
) -> kvm_ioeventfd {
    let (len, value, matching) = datamatch.encode();
    let mut flags = 0;
    if matching {
        flags |= IOEVENTFD_FLAG_DATAMATCH;
    }
    if deassign {
        flags |= IOEVENTFD_FLAG_DEASSIGN;
    }
    let addr = match addr {
        IoEventAddress::Pio(port) => {
            flags |= IOEVENTFD_FLAG_PIO;
            port
        }
        IoEventAddress::Mmio(addr) => addr,
    };

    kvm_ioeventfd {
        datamatch: value,
        addr,
        len,
        fd: evt.as_raw_fd(),
        flags,
        ..Default::default()
    }
}

/// Wrapper around a KVM VM file descriptor.
///
/// The VM stays alive in the kernel for as long as this handle or any vCPU
/// or device created from it is open.
#[derive(Debug)]
pub struct VmFd {
    fd: Descriptor,

    /// Size of each vCPU's run region, from `KVM_GET_VCPU_MMAP_SIZE`.
    run_size: usize,
}

impl VmFd {
    pub(super) fn new(fd: Descriptor, run_size: usize) -> Self {
        Self { fd, run_size }
    }

    /// Size of the run region mapped for each vCPU.
    pub fn run_size(&self) -> usize {
        self.run_size
    }

    /// Query a capability on this VM. Some answers differ from the system
    /// handle's, depending on the machine type.
    pub fn check_extension(&self, cap: Cap) -> Result<u32> {
        check_extension(&self.fd, cap)
    }

    /// Enable an optional VM capability.
    pub fn enable_cap(&self, cap: &kvm_enable_cap) -> Result<()> {
        // SAFETY: the kernel only reads the struct.
        unsafe { ioctls::kvm_enable_cap(self.as_raw_fd(), cap) }
            .map_err(KvmError::ioctl("KVM_ENABLE_CAP"))?;
        Ok(())
    }

    /// Create a virtual CPU.
    ///
    /// The vCPU's run region is mapped before the handle is returned; if the
    /// mapping fails the new descriptor is closed and no handle escapes.
    ///
    /// # Arguments
    ///
    /// * `id` - vCPU ID (0 for the boot CPU). Passed to the kernel as is, so
    ///   a duplicate id fails with `EEXIST` and an out-of-range one with
    ///   `EINVAL`.
    pub fn create_vcpu(&self, id: u64) -> Result<VcpuFd> {
        // SAFETY: KVM_CREATE_VCPU takes the id by value.
        let raw =
            unsafe { ioctl_with_val(self.as_raw_fd(), ioctls::KVM_CREATE_VCPU, id as c_ulong) }
                .map_err(KvmError::ioctl("KVM_CREATE_VCPU"))?;

        // SAFETY: the kernel just returned a fresh vCPU descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let run = RunRegion::map(&fd, self.run_size)?;
        debug!(id, fd = raw, run_size = self.run_size, "created vcpu");

        Ok(VcpuFd::new(Descriptor::from_owned(fd), run, id))
    }

    /// Create an in-kernel device of `device_type`.
    ///
    /// `KVM_CREATE_DEVICE_TEST` is rejected with `EINVAL` because it creates
    /// no descriptor; use [`supports_device`](Self::supports_device) instead.
    pub fn create_device(&self, device_type: u32, flags: u32) -> Result<DeviceFd> {
        if flags & KVM_CREATE_DEVICE_TEST != 0 {
            return Err(KvmError::Ioctl {
                ioctl: "KVM_CREATE_DEVICE",
                source: Errno::EINVAL,
            });
        }

        let mut request = kvm_create_device {
            type_: device_type,
            fd: 0,
            flags,
        };
        // SAFETY: the kernel reads the request and writes back `fd`.
        unsafe { ioctls::kvm_create_device(self.as_raw_fd(), &mut request) }
            .map_err(KvmError::ioctl("KVM_CREATE_DEVICE"))?;
        debug!(device_type, fd = request.fd, "created device");

        // SAFETY: the kernel just returned a fresh device descriptor.
        let fd = unsafe { Descriptor::from_raw(request.fd as RawFd) };
        Ok(DeviceFd::new(fd, device_type, flags))
    }

    /// Whether this VM can create devices of `device_type`.
    pub fn supports_device(&self, device_type: u32) -> Result<bool> {
        let mut request = kvm_create_device {
            type_: device_type,
            fd: 0,
            flags: KVM_CREATE_DEVICE_TEST,
        };
        // SAFETY: with the test flag the kernel only validates the type.
        match unsafe { ioctls::kvm_create_device(self.as_raw_fd(), &mut request) } {
            Ok(_) => Ok(true),
            Err(Errno::ENODEV) => Ok(false),
            Err(source) => Err(KvmError::Ioctl {
                ioctl: "KVM_CREATE_DEVICE",
                source,
            }),
        }
    }

    /// Register a guest memory region with KVM.
    ///
    /// After registration, guest accesses to the region's physical addresses
    /// transparently access the host memory at `host_addr`. Re-registering a
    /// slot with size 0 deletes it.
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - The host memory remains mapped for as long as the slot is installed
    /// - Nothing in this process relies on the memory not changing under it,
    ///   since the guest can write to it at any time
    pub unsafe fn set_user_memory_region(&self, region: UserMemoryRegion) -> Result<()> {
        let raw: kvm_userspace_memory_region = region.into();
        // SAFETY: the kernel only reads the struct; the caller vouches for
        // the host mapping.
        unsafe { ioctls::kvm_set_user_memory_region(self.as_raw_fd(), &raw) }
            .map_err(KvmError::ioctl("KVM_SET_USER_MEMORY_REGION"))?;
        debug!(
            slot = region.slot,
            guest_addr = region.guest_addr.raw_value(),
            last_addr = ?region.last_addr(),
            host_addr = region.host_addr,
            "set user memory region"
        );
        Ok(())
    }

    /// Drive an interrupt line of the in-kernel irqchip.
    pub fn set_irq_line(&self, irq: u32, active: bool) -> Result<()> {
        let mut level = kvm_irq_level::default();
        level.__bindgen_anon_1.irq = irq;
        level.level = u32::from(active);
        // SAFETY: the kernel only reads the struct.
        unsafe { ioctls::kvm_irq_line(self.as_raw_fd(), &level) }
            .map_err(KvmError::ioctl("KVM_IRQ_LINE"))?;
        Ok(())
    }

    /// Replace the whole GSI routing table.
    pub fn set_gsi_routing(&self, routing: &IrqRouting) -> Result<()> {
        // SAFETY: the record is a well-formed kvm_irq_routing whose count is
        // within its allocation.
        unsafe { ioctls::kvm_set_gsi_routing(self.as_raw_fd(), routing.as_fam_struct_ptr()) }
            .map_err(KvmError::ioctl("KVM_SET_GSI_ROUTING"))?;
        Ok(())
    }

    /// Raise `gsi` whenever `evt` is signalled.
    pub fn register_irqfd(&self, evt: &EventFd, gsi: u32) -> Result<()> {
        self.irqfd(evt, gsi, 0)?;
        debug!(gsi, fd = evt.as_raw_fd(), "registered irqfd");
        Ok(())
    }

    /// Undo [`register_irqfd`](Self::register_irqfd).
    pub fn unregister_irqfd(&self, evt: &EventFd, gsi: u32) -> Result<()> {
        self.irqfd(evt, gsi, KVM_IRQFD_FLAG_DEASSIGN)
    }

    fn irqfd(&self, evt: &EventFd, gsi: u32, flags: u32) -> Result<()> {
        let request = kvm_irqfd {
            fd: evt.as_raw_fd() as u32,
            gsi,
            flags,
            ..Default::default()
        };
        // SAFETY: the kernel only reads the struct.
        unsafe { ioctls::kvm_irqfd(self.as_raw_fd(), &request) }
            .map_err(KvmError::ioctl("KVM_IRQFD"))?;
        Ok(())
    }

    /// Signal `evt` when the guest writes to `addr` instead of exiting.
    pub fn register_ioevent(
        &self,
        evt: &EventFd,
        addr: IoEventAddress,
        datamatch: Datamatch,
    ) -> Result<()> {
        let request = ioeventfd_request(evt, addr, datamatch, false);
        // SAFETY: the kernel only reads the struct.
        unsafe { ioctls::kvm_ioeventfd(self.as_raw_fd(), &request) }
            .map_err(KvmError::ioctl("KVM_IOEVENTFD"))?;
        debug!(?addr, ?datamatch, fd = evt.as_raw_fd(), "registered ioeventfd");
        Ok(())
    }

    /// Undo [`register_ioevent`](Self::register_ioevent). The address and
    /// datamatch must be the ones used at registration.
    pub fn unregister_ioevent(
        &self,
        evt: &EventFd,
        addr: IoEventAddress,
        datamatch: Datamatch,
    ) -> Result<()> {
        let request = ioeventfd_request(evt, addr, datamatch, true);
        // SAFETY: the kernel only reads the struct.
        unsafe { ioctls::kvm_ioeventfd(self.as_raw_fd(), &request) }
            .map_err(KvmError::ioctl("KVM_IOEVENTFD"))?;
        Ok(())
    }

    /// Duplicate the handle.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone()?,
            run_size: self.run_size,
        })
    }

    /// Close the handle now and report the result.
    pub fn close(&mut self) -> Result<()> {
        self.fd.close()
    }
}

#[cfg(target_arch = "x86_64")]
impl VmFd {
    /// Set the guest-physical address of the three-page TSS region Intel
    /// VT-x needs. Must be called before the first vCPU runs.
    pub fn set_tss_address(&self, addr: u64) -> Result<()> {
        // SAFETY: KVM_SET_TSS_ADDR takes the address by value.
        unsafe { ioctl_with_val(self.as_raw_fd(), ioctls::KVM_SET_TSS_ADDR, addr as c_ulong) }
            .map_err(KvmError::ioctl("KVM_SET_TSS_ADDR"))?;
        Ok(())
    }

    /// Set the guest-physical address of the one-page identity map used for
    /// real mode on Intel VT-x.
    pub fn set_identity_map_address(&self, addr: u64) -> Result<()> {
        // SAFETY: the kernel only reads the u64.
        unsafe { ioctls::kvm_set_identity_map_addr(self.as_raw_fd(), &addr) }
            .map_err(KvmError::ioctl("KVM_SET_IDENTITY_MAP_ADDR"))?;
        Ok(())
    }

    /// Create the in-kernel PIC and IOAPIC.
    pub fn create_irq_chip(&self) -> Result<()> {
        // SAFETY: KVM_CREATE_IRQCHIP takes no argument.
        unsafe { ioctl_with_val(self.as_raw_fd(), ioctls::KVM_CREATE_IRQCHIP, 0) }
            .map_err(KvmError::ioctl("KVM_CREATE_IRQCHIP"))?;
        debug!("created irqchip");
        Ok(())
    }

    /// Read the state of the chip selected by `irqchip.chip_id`.
    pub fn get_irqchip(&self, irqchip: &mut kvm_irqchip) -> Result<()> {
        // SAFETY: the kernel reads chip_id and fills the rest.
        unsafe { ioctls::kvm_get_irqchip(self.as_raw_fd(), irqchip) }
            .map_err(KvmError::ioctl("KVM_GET_IRQCHIP"))?;
        Ok(())
    }

    /// Restore the state of the chip selected by `irqchip.chip_id`.
    pub fn set_irqchip(&self, irqchip: &kvm_irqchip) -> Result<()> {
        // SAFETY: despite its _IOR encoding the kernel only reads the struct.
        unsafe {
            let ptr = irqchip as *const kvm_irqchip as *mut kvm_irqchip;
            ioctls::kvm_set_irqchip(self.as_raw_fd(), ptr)
        }
        .map_err(KvmError::ioctl("KVM_SET_IRQCHIP"))?;
        Ok(())
    }

    /// Create the in-kernel 8254 PIT.
    pub fn create_pit2(&self, config: kvm_pit_config) -> Result<()> {
        // SAFETY: the kernel only reads the struct.
        unsafe { ioctls::kvm_create_pit2(self.as_raw_fd(), &config) }
            .map_err(KvmError::ioctl("KVM_CREATE_PIT2"))?;
        debug!(flags = config.flags, "created pit");
        Ok(())
    }

    pub fn get_pit2(&self) -> Result<kvm_pit_state2> {
        let mut state = kvm_pit_state2::default();
        // SAFETY: the kernel fills the struct.
        unsafe { ioctls::kvm_get_pit2(self.as_raw_fd(), &mut state) }
            .map_err(KvmError::ioctl("KVM_GET_PIT2"))?;
        Ok(state)
    }

    pub fn set_pit2(&self, state: &kvm_pit_state2) -> Result<()> {
        // SAFETY: the kernel only reads the struct.
        unsafe { ioctls::kvm_set_pit2(self.as_raw_fd(), state) }
            .map_err(KvmError::ioctl("KVM_SET_PIT2"))?;
        Ok(())
    }

    /// Read the kvmclock value.
    pub fn get_clock(&self) -> Result<kvm_clock_data> {
        let mut clock = kvm_clock_data::default();
        // SAFETY: the kernel fills the struct.
        unsafe { ioctls::kvm_get_clock(self.as_raw_fd(), &mut clock) }
            .map_err(KvmError::ioctl("KVM_GET_CLOCK"))?;
        Ok(clock)
    }

    pub fn set_clock(&self, clock: &kvm_clock_data) -> Result<()> {
        // SAFETY: the kernel only reads the struct.
        unsafe { ioctls::kvm_set_clock(self.as_raw_fd(), clock) }
            .map_err(KvmError::ioctl("KVM_SET_CLOCK"))?;
        Ok(())
    }
}

#[cfg(target_arch = "aarch64")]
impl VmFd {
    /// The CPU target the host recommends for `KVM_ARM_VCPU_INIT`.
    pub fn get_preferred_target(&self, kvi: &mut kvm_vcpu_init) -> Result<()> {
        // SAFETY: the kernel fills the struct.
        unsafe { ioctls::kvm_arm_preferred_target(self.as_raw_fd(), kvi) }
            .map_err(KvmError::ioctl("KVM_ARM_PREFERRED_TARGET"))?;
        Ok(())
    }
}

impl AsRawFd for VmFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
