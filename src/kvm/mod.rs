//! Handles for the Linux KVM control plane.
//!
//! KVM is driven entirely through ioctls on a small hierarchy of file
//! descriptors. Each level of the hierarchy can only be created from the one
//! above it, so holding a handle is proof that its parent existed:
//!
//! ```text
//!                 /dev/kvm
//!                    │ open
//!                    ▼
//!               ┌─────────┐  KVM_CREATE_VM   ┌─────────┐
//!               │   Kvm   │─────────────────►│  VmFd   │
//!               └─────────┘                  └────┬────┘
//!                                                 │
//!                           KVM_CREATE_VCPU       │       KVM_CREATE_DEVICE
//!                        ┌────────────────────────┴───────────────────┐
//!                        ▼                                            ▼
//!                   ┌─────────┐                                 ┌──────────┐
//!                   │ VcpuFd  │ + shared run region (mmap)      │ DeviceFd │
//!                   └─────────┘                                 └──────────┘
//! ```
//!
//! Children do not borrow their parents. The kernel keeps a VM alive for as
//! long as any of its vCPU or device descriptors is open, so a `VcpuFd` may
//! outlive the `VmFd` and the `Kvm` it came from.
//!
//! # Execution model
//!
//! A vCPU runs in a loop:
//!
//! 1. The VMM calls [`VcpuFd::run`], entering the guest.
//! 2. The guest runs until something needs userspace (port I/O, MMIO, HLT...).
//! 3. `run` returns a [`VcpuExit`] that borrows the run region.
//! 4. The VMM services the exit, writing any reply into the borrowed buffer.
//! 5. Back to 1.
//!
//! # Errors
//!
//! Every failing kernel call surfaces as a [`KvmError`] naming the operation
//! and carrying the `errno`. Nothing is retried and nothing is logged at
//! error level; callers decide what to do.

mod device;
mod eventfd;
mod exit;
mod fd;
mod ioctls;
mod records;
mod vcpu;
mod vm;

pub use device::DeviceFd;
pub use eventfd::{EventFd, EFD_NONBLOCK, EFD_SEMAPHORE};
pub use exit::{ExitReason, HypercallExit, ImmediateExit, VcpuExit};
pub use fd::Descriptor;
pub use records::*;
pub use vcpu::{IoHandler, MmioHandler, VcpuFd};
pub use vm::{Datamatch, IoEventAddress, UserMemoryRegion, VmFd};

use crate::fam::FamError;
use ioctls::ioctl_with_val;
use kvm_bindings::{
    KVM_CAP_ADJUST_CLOCK, KVM_CAP_DEBUGREGS, KVM_CAP_DEVICE_CTRL, KVM_CAP_EXT_CPUID,
    KVM_CAP_GET_TSC_KHZ, KVM_CAP_HLT, KVM_CAP_IMMEDIATE_EXIT, KVM_CAP_IOEVENTFD,
    KVM_CAP_IRQCHIP, KVM_CAP_IRQFD, KVM_CAP_IRQ_ROUTING, KVM_CAP_MAX_VCPUS, KVM_CAP_MP_STATE,
    KVM_CAP_NR_MEMSLOTS, KVM_CAP_NR_VCPUS, KVM_CAP_ONE_REG, KVM_CAP_PIT, KVM_CAP_PIT2,
    KVM_CAP_SET_TSS_ADDR, KVM_CAP_SPLIT_IRQCHIP, KVM_CAP_TSC_CONTROL, KVM_CAP_USER_MEMORY,
    KVM_CAP_VCPU_EVENTS, KVM_CAP_XCRS,
};
use libc::c_ulong;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during KVM operations.
#[derive(Error, Debug)]
pub enum KvmError {
    /// Failed to open the KVM device node.
    ///
    /// This usually means:
    /// - KVM is not available (module not loaded, or not running on Linux)
    /// - Insufficient permissions (user not in the kvm group)
    /// - Running in a VM without nested virtualization enabled
    #[error("failed to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: Errno,
    },

    /// A KVM ioctl was rejected by the kernel.
    #[error("{ioctl} failed: {source}")]
    Ioctl {
        ioctl: &'static str,
        #[source]
        source: Errno,
    },

    /// A plain descriptor operation (dup, close, eventfd I/O) failed.
    #[error("descriptor {op} failed: {source}")]
    Descriptor {
        op: &'static str,
        #[source]
        source: Errno,
    },

    /// Failed to map the vCPU run region.
    #[error("failed to map the vCPU run region: {0}")]
    MapRunRegion(#[source] Errno),

    /// A variable-length record could not be built or filled.
    #[error(transparent)]
    Record(#[from] FamError),

    /// The kernel reported an exit reason this build does not know.
    #[error("vCPU exited with unknown reason {0}")]
    UnexpectedExitReason(u32),

    /// The exit payload is inconsistent with the run region.
    #[error("malformed {reason:?} exit: {detail}")]
    MalformedExit {
        reason: ExitReason,
        detail: &'static str,
    },
}

impl KvmError {
    /// Map an `Errno` into an ioctl error for `ioctl`.
    pub(crate) fn ioctl(ioctl: &'static str) -> impl FnOnce(Errno) -> KvmError {
        move |source| KvmError::Ioctl { ioctl, source }
    }

    /// The kernel error code behind this error, if any.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Open { source, .. }
            | Self::Ioctl { source, .. }
            | Self::Descriptor { source, .. }
            | Self::MapRunRegion(source) => Some(*source),
            Self::Record(_) | Self::UnexpectedExitReason(_) | Self::MalformedExit { .. } => None,
        }
    }

    /// The raw OS error number behind this error, if any.
    pub fn os_error(&self) -> Option<i32> {
        self.errno().map(|errno| errno as i32)
    }
}

pub type Result<T> = std::result::Result<T, KvmError>;

/// The only stable KVM API version.
pub const KVM_API_VERSION: i32 = 12;

/// vCPU count assumed when the kernel does not report `KVM_CAP_NR_VCPUS`.
pub const DEFAULT_VCPU_LIMIT: usize = 4;

/// Memory slot count assumed when the kernel does not report
/// `KVM_CAP_NR_MEMSLOTS`.
pub const DEFAULT_MEM_SLOT_LIMIT: usize = 32;

/// A KVM capability, as passed to `KVM_CHECK_EXTENSION`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Cap(pub u32);

impl Cap {
    pub const IRQCHIP: Cap = Cap(KVM_CAP_IRQCHIP);
    pub const HLT: Cap = Cap(KVM_CAP_HLT);
    pub const USER_MEMORY: Cap = Cap(KVM_CAP_USER_MEMORY);
    pub const SET_TSS_ADDR: Cap = Cap(KVM_CAP_SET_TSS_ADDR);
    pub const EXT_CPUID: Cap = Cap(KVM_CAP_EXT_CPUID);
    pub const NR_VCPUS: Cap = Cap(KVM_CAP_NR_VCPUS);
    pub const NR_MEMSLOTS: Cap = Cap(KVM_CAP_NR_MEMSLOTS);
    pub const PIT: Cap = Cap(KVM_CAP_PIT);
    pub const MP_STATE: Cap = Cap(KVM_CAP_MP_STATE);
    pub const IRQ_ROUTING: Cap = Cap(KVM_CAP_IRQ_ROUTING);
    pub const IOEVENTFD: Cap = Cap(KVM_CAP_IOEVENTFD);
    pub const IRQFD: Cap = Cap(KVM_CAP_IRQFD);
    pub const PIT2: Cap = Cap(KVM_CAP_PIT2);
    pub const ADJUST_CLOCK: Cap = Cap(KVM_CAP_ADJUST_CLOCK);
    pub const VCPU_EVENTS: Cap = Cap(KVM_CAP_VCPU_EVENTS);
    pub const DEBUGREGS: Cap = Cap(KVM_CAP_DEBUGREGS);
    pub const XCRS: Cap = Cap(KVM_CAP_XCRS);
    pub const TSC_CONTROL: Cap = Cap(KVM_CAP_TSC_CONTROL);
    pub const GET_TSC_KHZ: Cap = Cap(KVM_CAP_GET_TSC_KHZ);
    pub const MAX_VCPUS: Cap = Cap(KVM_CAP_MAX_VCPUS);
    pub const ONE_REG: Cap = Cap(KVM_CAP_ONE_REG);
    pub const DEVICE_CTRL: Cap = Cap(KVM_CAP_DEVICE_CTRL);
    pub const SPLIT_IRQCHIP: Cap = Cap(KVM_CAP_SPLIT_IRQCHIP);
    pub const IMMEDIATE_EXIT: Cap = Cap(KVM_CAP_IMMEDIATE_EXIT);
}

/// How to open the KVM system handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvmConfig {
    /// Device node to open.
    pub path: PathBuf,
    /// Open with `O_CLOEXEC`.
    pub cloexec: bool,
}

impl Default for KvmConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/kvm"),
            cloexec: true,
        }
    }
}

impl KvmConfig {
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_cloexec(mut self, cloexec: bool) -> Self {
        self.cloexec = cloexec;
        self
    }
}

/// Use the kernel's answer when it gave one, `fallback` otherwise.
fn limit_or(reported: u32, fallback: usize) -> usize {
    if reported > 0 {
        reported as usize
    } else {
        fallback
    }
}

/// The KVM system handle.
///
/// Answers system-wide capability queries and creates VMs.
#[derive(Debug)]
pub struct Kvm {
    fd: Descriptor,
}

impl Kvm {
    /// Open `/dev/kvm` read-write with close-on-exec.
    pub fn open() -> Result<Self> {
        Self::open_with(&KvmConfig::default())
    }

    /// Open the KVM device described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`KvmError::Open`] with the path and `errno` when the node
    /// cannot be opened.
    pub fn open_with(config: &KvmConfig) -> Result<Self> {
        let mut flags = OFlag::O_RDWR;
        if config.cloexec {
            flags |= OFlag::O_CLOEXEC;
        }

        let raw = nix::fcntl::open(config.path.as_path(), flags, Mode::empty()).map_err(|source| {
            KvmError::Open {
                path: config.path.clone(),
                source,
            }
        })?;
        debug!(path = %config.path.display(), fd = raw, "opened kvm");

        // SAFETY: open just returned a fresh descriptor.
        Ok(Self { fd: unsafe { Descriptor::from_raw(raw) } })
    }

    /// Adopt an already open KVM descriptor.
    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        Self { fd: Descriptor::from_owned(fd) }
    }

    /// Path of the default device node.
    pub fn default_path() -> &'static Path {
        Path::new("/dev/kvm")
    }

    /// The KVM API version; always [`KVM_API_VERSION`] on supported kernels.
    pub fn api_version(&self) -> Result<i32> {
        // SAFETY: KVM_GET_API_VERSION takes no argument.
        unsafe { ioctl_with_val(self.fd.as_raw_fd(), ioctls::KVM_GET_API_VERSION, 0) }
            .map_err(KvmError::ioctl("KVM_GET_API_VERSION"))
    }

    /// Query a capability. Zero means unsupported; some capabilities report
    /// a count or limit instead of a flag.
    pub fn check_extension(&self, cap: Cap) -> Result<u32> {
        check_extension(&self.fd, cap)
    }

    /// Whether a capability is supported at all.
    pub fn has_extension(&self, cap: Cap) -> Result<bool> {
        Ok(self.check_extension(cap)? > 0)
    }

    /// Size in bytes of the shared run region of every vCPU.
    pub fn vcpu_mmap_size(&self) -> Result<usize> {
        // SAFETY: KVM_GET_VCPU_MMAP_SIZE takes no argument.
        let size = unsafe { ioctl_with_val(self.fd.as_raw_fd(), ioctls::KVM_GET_VCPU_MMAP_SIZE, 0) }
            .map_err(KvmError::ioctl("KVM_GET_VCPU_MMAP_SIZE"))?;
        Ok(size as usize)
    }

    /// Recommended number of vCPUs per VM.
    pub fn vcpu_limit(&self) -> Result<usize> {
        Ok(limit_or(self.check_extension(Cap::NR_VCPUS)?, DEFAULT_VCPU_LIMIT))
    }

    /// Hard maximum of vCPUs per VM.
    pub fn max_vcpus(&self) -> Result<usize> {
        match self.check_extension(Cap::MAX_VCPUS)? {
            0 => self.vcpu_limit(),
            max => Ok(max as usize),
        }
    }

    /// Number of user memory slots per VM.
    pub fn mem_slot_limit(&self) -> Result<usize> {
        Ok(limit_or(self.check_extension(Cap::NR_MEMSLOTS)?, DEFAULT_MEM_SLOT_LIMIT))
    }

    /// Create a VM of the default machine type.
    pub fn create_vm(&self) -> Result<VmFd> {
        self.create_vm_with_type(0)
    }

    /// Create a VM of an architecture-specific machine type.
    ///
    /// The run region size is captured now so that vCPUs can be created
    /// from the VM alone.
    pub fn create_vm_with_type(&self, machine_type: u64) -> Result<VmFd> {
        let run_size = self.vcpu_mmap_size()?;

        // SAFETY: KVM_CREATE_VM takes the machine type by value.
        let raw = unsafe {
            ioctl_with_val(self.fd.as_raw_fd(), ioctls::KVM_CREATE_VM, machine_type as c_ulong)
        }
        .map_err(KvmError::ioctl("KVM_CREATE_VM"))?;
        debug!(machine_type, fd = raw, run_size, "created vm");

        // SAFETY: the kernel just returned a fresh VM descriptor.
        Ok(VmFd::new(unsafe { Descriptor::from_raw(raw) }, run_size))
    }

    /// Duplicate the handle.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self { fd: self.fd.try_clone()? })
    }

    /// Close the handle now and report the result.
    pub fn close(&mut self) -> Result<()> {
        self.fd.close()
    }

    /// CPUID leaves the host can expose to guests.
    #[cfg(target_arch = "x86_64")]
    pub fn supported_cpuid(&self, capacity: usize) -> Result<CpuId> {
        let mut cpuid = CpuId::new(capacity)?;
        cpuid.prepare_for_kernel();
        // SAFETY: the record advertises its own capacity, so the kernel
        // writes no more entries than were allocated.
        let ptr = cpuid.as_mut_fam_struct_ptr();
        unsafe { ioctls::kvm_get_supported_cpuid(self.fd.as_raw_fd(), ptr) }
            .map_err(KvmError::ioctl("KVM_GET_SUPPORTED_CPUID"))?;
        cpuid.accept_kernel_count()?;
        Ok(cpuid)
    }

    /// CPUID leaves KVM can emulate regardless of the host.
    #[cfg(target_arch = "x86_64")]
    pub fn emulated_cpuid(&self, capacity: usize) -> Result<CpuId> {
        let mut cpuid = CpuId::new(capacity)?;
        cpuid.prepare_for_kernel();
        // SAFETY: as in `supported_cpuid`.
        let ptr = cpuid.as_mut_fam_struct_ptr();
        unsafe { ioctls::kvm_get_emulated_cpuid(self.fd.as_raw_fd(), ptr) }
            .map_err(KvmError::ioctl("KVM_GET_EMULATED_CPUID"))?;
        cpuid.accept_kernel_count()?;
        Ok(cpuid)
    }

    /// Indices of the MSRs KVM saves and restores.
    #[cfg(target_arch = "x86_64")]
    pub fn msr_index_list(&self) -> Result<MsrList> {
        let mut list = MsrList::new(MAX_MSR_ENTRIES)?;
        list.prepare_for_kernel();
        // SAFETY: as in `supported_cpuid`.
        let ptr = list.as_mut_fam_struct_ptr();
        unsafe { ioctls::kvm_get_msr_index_list(self.fd.as_raw_fd(), ptr) }
            .map_err(KvmError::ioctl("KVM_GET_MSR_INDEX_LIST"))?;
        list.accept_kernel_count()?;
        Ok(list)
    }

    /// Indices of the MSRs that describe host feature support.
    #[cfg(target_arch = "x86_64")]
    pub fn msr_feature_index_list(&self) -> Result<MsrList> {
        let mut list = MsrList::new(MAX_MSR_ENTRIES)?;
        list.prepare_for_kernel();
        // SAFETY: as in `supported_cpuid`.
        let ptr = list.as_mut_fam_struct_ptr();
        unsafe { ioctls::kvm_get_msr_feature_index_list(self.fd.as_raw_fd(), ptr) }
            .map_err(KvmError::ioctl("KVM_GET_MSR_FEATURE_INDEX_LIST"))?;
        list.accept_kernel_count()?;
        Ok(list)
    }
}

impl AsRawFd for Kvm {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl FromRawFd for Kvm {
    /// # Safety
    ///
    /// `fd` must be an open KVM system descriptor owned by the caller.
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd: unsafe { Descriptor::from_raw(fd) } }
    }
}

/// `KVM_CHECK_EXTENSION` on a system or VM descriptor.
fn check_extension(fd: &Descriptor, cap: Cap) -> Result<u32> {
    // SAFETY: KVM_CHECK_EXTENSION takes the capability number by value.
    let value =
        unsafe { ioctl_with_val(fd.as_raw_fd(), ioctls::KVM_CHECK_EXTENSION, cap.0 as c_ulong) }
            .map_err(KvmError::ioctl("KVM_CHECK_EXTENSION"))?;
    Ok(value as u32)
}
