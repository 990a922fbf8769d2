//! Virtual CPU handles and execution.
//!
//! A [`VcpuFd`] owns a vCPU descriptor together with the run region mapped
//! from it. The region is unmapped before the descriptor is closed, unless
//! an [`ImmediateExit`] handle still holds it.
//!
//! # vCPU Execution Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      VMM (User Space)                   │
//! │  ┌─────────┐         ┌─────────────┐                    │
//! │  │  Loop   │◄────────│ Handle Exit │                    │
//! │  │  Start  │         │  (I/O, etc) │                    │
//! │  └────┬────┘         └──────▲──────┘                    │
//! │       │ vcpu.run()          │ VcpuExit<'_>              │
//! ├───────┼─────────────────────┼───────────────────────────┤
//! │       ▼      KVM (Kernel)   │                           │
//! │  ┌─────────┐          ┌─────┴─────┐                     │
//! │  │  Enter  │─────────►│  VM exit  │                     │
//! │  │  guest  │  Guest   │           │                     │
//! │  └─────────┘  runs    └───────────┘                     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The exit returned by [`VcpuFd::run`] borrows the vCPU mutably, so the
//! next `run` cannot start until the exit has been dealt with. Replies to
//! port and MMIO reads are written straight into the borrowed buffers.
//!
//! # Cancelling a run
//!
//! Setting [`VcpuFd::set_immediate_exit`] makes the next `KVM_RUN` return
//! [`VcpuExit::Intr`] without entering the guest. The flag stays set until
//! cleared.
//!
//! `run` holds the vCPU mutably, so other threads go through an
//! [`ImmediateExit`] handle from [`VcpuFd::immediate_exit_handle`]. To kick
//! a vCPU that is already inside `KVM_RUN`, set the flag through the handle
//! and then signal the vCPU thread. A signal landing before the thread
//! enters the guest is not lost, because the kernel checks the flag on entry:
//!
//! ```text
//! other thread                      vCPU thread
//! ────────────                      ───────────
//! handle.set(true)                  vcpu.run()
//! pthread_kill(vcpu_thread, SIG) ─► KVM_RUN returns EINTR → VcpuExit::Intr
//! ```

use super::exit::{ExitReason, ImmediateExit, RunRegion, VcpuExit};
use super::fd::Descriptor;
use super::ioctls::{self, ioctl_with_val};
use super::{KvmError, Result};
use kvm_bindings::{kvm_enable_cap, kvm_mp_state};
use nix::errno::Errno;
use std::os::fd::{AsRawFd, RawFd};

#[cfg(target_arch = "x86_64")]
use super::records::{CpuId, Msrs};
#[cfg(target_arch = "x86_64")]
use kvm_bindings::{
    kvm_debugregs, kvm_fpu, kvm_lapic_state, kvm_regs, kvm_sregs, kvm_vcpu_events, kvm_xcrs,
};
#[cfg(target_arch = "x86_64")]
use libc::c_ulong;

#[cfg(target_arch = "aarch64")]
use super::records::RegList;
#[cfg(target_arch = "aarch64")]
use kvm_bindings::{kvm_one_reg, kvm_vcpu_init};

/// Trait for handling I/O port operations.
///
/// When the guest executes IN or OUT instructions, KVM exits to the VMM.
/// The handler emulates the device behind the port.
pub trait IoHandler {
    /// Handle an I/O port read (IN instruction).
    ///
    /// # Arguments
    ///
    /// * `port` - I/O port number (0x0000-0xFFFF)
    /// * `data` - Buffer to fill with the response (`size * count` bytes)
    fn io_read(&mut self, port: u16, data: &mut [u8]);

    /// Handle an I/O port write (OUT instruction).
    fn io_write(&mut self, port: u16, data: &[u8]);
}

/// Trait for handling memory-mapped I/O (MMIO) operations.
///
/// When the guest accesses guest-physical memory that no slot backs, KVM
/// exits to the VMM with the address and access width.
pub trait MmioHandler {
    /// Handle an MMIO read. Fill `data` (1 to 8 bytes) with the response.
    fn mmio_read(&mut self, addr: u64, data: &mut [u8]);

    /// Handle an MMIO write.
    fn mmio_write(&mut self, addr: u64, data: &[u8]);
}

/// Wrapper around a KVM vCPU file descriptor and its run region.
///
/// `VcpuFd` is `Send` but not `Sync`: it may move to the thread that runs
/// it, but the run region is never shared between threads.
pub struct VcpuFd {
    // Declared first so the region is unmapped before the descriptor closes.
    run: RunRegion,
    fd: Descriptor,
    id: u64,
}

impl VcpuFd {
    pub(super) fn new(fd: Descriptor, run: RunRegion, id: u64) -> Self {
        Self { run, fd, id }
    }

    /// The id the vCPU was created with.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size of the mapped run region.
    pub fn run_size(&self) -> usize {
        self.run.size()
    }

    /// Run the vCPU until it exits.
    ///
    /// # Errors
    ///
    /// `EINTR` from `KVM_RUN` (a pending signal or `immediate_exit`) is not
    /// an error and yields [`VcpuExit::Intr`]. Any other failure is returned
    /// as [`KvmError::Ioctl`]; an exit reason outside the known set yields
    /// [`KvmError::UnexpectedExitReason`].
    pub fn run(&mut self) -> Result<VcpuExit<'_>> {
        // SAFETY: KVM_RUN takes no argument; the kernel communicates through
        // the run region, which stays mapped for the lifetime of `self`.
        match unsafe { ioctl_with_val(self.fd.as_raw_fd(), ioctls::KVM_RUN, 0) } {
            Ok(_) => self.run.exit(),
            Err(Errno::EINTR) => Ok(VcpuExit::Intr),
            Err(source) => Err(KvmError::Ioctl {
                ioctl: "KVM_RUN",
                source,
            }),
        }
    }

    /// Run the vCPU, servicing port and MMIO exits with `handler`.
    ///
    /// Returns `None` when the exit was an I/O or MMIO access the handler
    /// took care of, and the exit itself for everything else.
    pub fn run_with_io<H: IoHandler + MmioHandler>(
        &mut self,
        handler: &mut H,
    ) -> Result<Option<VcpuExit<'_>>> {
        match self.run()? {
            VcpuExit::IoIn(port, data) => handler.io_read(port, data),
            VcpuExit::IoOut(port, data) => handler.io_write(port, data),
            VcpuExit::MmioRead(addr, data) => handler.mmio_read(addr, data),
            VcpuExit::MmioWrite(addr, data) => handler.mmio_write(addr, data),
            other => return Ok(Some(other)),
        }
        Ok(None)
    }

    /// Reason of the last exit, read from the run region.
    pub fn exit_reason(&self) -> Result<ExitReason> {
        ExitReason::try_from(self.run.raw_exit_reason())
    }

    /// Whether the next `KVM_RUN` returns without entering the guest.
    pub fn immediate_exit(&self) -> bool {
        self.run.immediate_exit()
    }

    pub fn set_immediate_exit(&mut self, value: bool) {
        self.run.set_immediate_exit(value);
    }

    /// A `Send + Sync` handle to the `immediate_exit` flag, for threads and
    /// signal handlers that cannot borrow the vCPU.
    pub fn immediate_exit_handle(&self) -> ImmediateExit {
        self.run.immediate_exit_handle()
    }

    /// Whether KVM exits as soon as the guest can take an interrupt.
    pub fn request_interrupt_window(&self) -> bool {
        self.run.request_interrupt_window()
    }

    pub fn set_request_interrupt_window(&mut self, value: bool) {
        self.run.set_request_interrupt_window(value);
    }

    /// Whether an interrupt can be injected right now, as of the last exit.
    pub fn ready_for_interrupt_injection(&self) -> bool {
        self.run.ready_for_interrupt_injection()
    }

    /// The guest's interrupt flag, as of the last exit.
    pub fn if_flag(&self) -> bool {
        self.run.if_flag()
    }

    /// The guest's CR8 (task priority), as of the last exit.
    pub fn cr8(&self) -> u64 {
        self.run.cr8()
    }

    /// The guest's APIC base MSR, as of the last exit.
    pub fn apic_base(&self) -> u64 {
        self.run.apic_base()
    }

    /// Architecture-specific `KVM_RUN_*` flags, as of the last exit.
    pub fn run_flags(&self) -> u16 {
        self.run.flags()
    }

    pub fn get_mp_state(&self) -> Result<kvm_mp_state> {
        let mut state = kvm_mp_state::default();
        // SAFETY: the kernel fills the struct.
        unsafe { ioctls::kvm_get_mp_state(self.as_raw_fd(), &mut state) }
            .map_err(KvmError::ioctl("KVM_GET_MP_STATE"))?;
        Ok(state)
    }

    pub fn set_mp_state(&self, state: kvm_mp_state) -> Result<()> {
        // SAFETY: the kernel only reads the struct.
        unsafe { ioctls::kvm_set_mp_state(self.as_raw_fd(), &state) }
            .map_err(KvmError::ioctl("KVM_SET_MP_STATE"))?;
        Ok(())
    }

    /// Enable an optional vCPU capability.
    pub fn enable_cap(&self, cap: &kvm_enable_cap) -> Result<()> {
        // SAFETY: the kernel only reads the struct.
        unsafe { ioctls::kvm_enable_cap(self.as_raw_fd(), cap) }
            .map_err(KvmError::ioctl("KVM_ENABLE_CAP"))?;
        Ok(())
    }
}

#[cfg(target_arch = "x86_64")]
impl VcpuFd {
    /// Get the general-purpose registers.
    pub fn get_regs(&self) -> Result<kvm_regs> {
        let mut regs = kvm_regs::default();
        // SAFETY: the kernel fills the struct.
        unsafe { ioctls::kvm_get_regs(self.as_raw_fd(), &mut regs) }
            .map_err(KvmError::ioctl("KVM_GET_REGS"))?;
        Ok(regs)
    }

    /// Set the general-purpose registers.
    pub fn set_regs(&self, regs: &kvm_regs) -> Result<()> {
        // SAFETY: the kernel only reads the struct.
        unsafe { ioctls::kvm_set_regs(self.as_raw_fd(), regs) }
            .map_err(KvmError::ioctl("KVM_SET_REGS"))?;
        Ok(())
    }

    /// Get the special registers (segments, control registers, EFER).
    pub fn get_sregs(&self) -> Result<kvm_sregs> {
        let mut sregs = kvm_sregs::default();
        // SAFETY: the kernel fills the struct.
        unsafe { ioctls::kvm_get_sregs(self.as_raw_fd(), &mut sregs) }
            .map_err(KvmError::ioctl("KVM_GET_SREGS"))?;
        Ok(sregs)
    }

    /// Set the special registers.
    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<()> {
        // SAFETY: the kernel only reads the struct.
        unsafe { ioctls::kvm_set_sregs(self.as_raw_fd(), sregs) }
            .map_err(KvmError::ioctl("KVM_SET_SREGS"))?;
        Ok(())
    }

    /// Get the FPU/SSE state.
    pub fn get_fpu(&self) -> Result<kvm_fpu> {
        let mut fpu = kvm_fpu::default();
        // SAFETY: the kernel fills the struct.
        unsafe { ioctls::kvm_get_fpu(self.as_raw_fd(), &mut fpu) }
            .map_err(KvmError::ioctl("KVM_GET_FPU"))?;
        Ok(fpu)
    }

    /// Set the FPU/SSE state.
    pub fn set_fpu(&self, fpu: &kvm_fpu) -> Result<()> {
        // SAFETY: the kernel only reads the struct.
        unsafe { ioctls::kvm_set_fpu(self.as_raw_fd(), fpu) }
            .map_err(KvmError::ioctl("KVM_SET_FPU"))?;
        Ok(())
    }

    /// Get the local APIC registers. Needs the in-kernel irqchip.
    pub fn get_lapic(&self) -> Result<kvm_lapic_state> {
        let mut lapic = kvm_lapic_state::default();
        // SAFETY: the kernel fills the struct.
        unsafe { ioctls::kvm_get_lapic(self.as_raw_fd(), &mut lapic) }
            .map_err(KvmError::ioctl("KVM_GET_LAPIC"))?;
        Ok(lapic)
    }

    /// Set the local APIC registers. Needs the in-kernel irqchip.
    pub fn set_lapic(&self, lapic: &kvm_lapic_state) -> Result<()> {
        // SAFETY: the kernel only reads the struct.
        unsafe { ioctls::kvm_set_lapic(self.as_raw_fd(), lapic) }
            .map_err(KvmError::ioctl("KVM_SET_LAPIC"))?;
        Ok(())
    }

    /// Read the MSRs whose indices are listed in `msrs`, filling in their
    /// values. Returns how many were read; reading stops at the first MSR
    /// the kernel refuses.
    pub fn get_msrs(&self, msrs: &mut Msrs) -> Result<usize> {
        // SAFETY: the kernel reads `nmsrs` entries and writes their values
        // in place, all within the record's allocation.
        let count = unsafe { ioctls::kvm_get_msrs(self.as_raw_fd(), msrs.as_mut_fam_struct_ptr()) }
            .map_err(KvmError::ioctl("KVM_GET_MSRS"))?;
        Ok(count as usize)
    }

    /// Write the MSRs in `msrs`. Returns how many were written; writing
    /// stops at the first MSR the kernel refuses.
    pub fn set_msrs(&self, msrs: &Msrs) -> Result<usize> {
        // SAFETY: the kernel only reads `nmsrs` entries.
        let count = unsafe { ioctls::kvm_set_msrs(self.as_raw_fd(), msrs.as_fam_struct_ptr()) }
            .map_err(KvmError::ioctl("KVM_SET_MSRS"))?;
        Ok(count as usize)
    }

    /// Set the CPUID leaves the guest sees. Must be done before the first
    /// `run`.
    pub fn set_cpuid2(&self, cpuid: &CpuId) -> Result<()> {
        // SAFETY: the kernel only reads `nent` entries.
        unsafe { ioctls::kvm_set_cpuid2(self.as_raw_fd(), cpuid.as_fam_struct_ptr()) }
            .map_err(KvmError::ioctl("KVM_SET_CPUID2"))?;
        Ok(())
    }

    /// Read back the CPUID leaves installed on this vCPU.
    pub fn get_cpuid2(&self, capacity: usize) -> Result<CpuId> {
        let mut cpuid = CpuId::new(capacity)?;
        cpuid.prepare_for_kernel();
        let ptr = cpuid.as_mut_fam_struct_ptr();
        // SAFETY: the record advertises its own capacity.
        unsafe { ioctls::kvm_get_cpuid2(self.as_raw_fd(), ptr) }
            .map_err(KvmError::ioctl("KVM_GET_CPUID2"))?;
        cpuid.accept_kernel_count()?;
        Ok(cpuid)
    }

    /// Get pending exceptions, interrupts and NMIs.
    pub fn get_vcpu_events(&self) -> Result<kvm_vcpu_events> {
        let mut events = kvm_vcpu_events::default();
        // SAFETY: the kernel fills the struct.
        unsafe { ioctls::kvm_get_vcpu_events(self.as_raw_fd(), &mut events) }
            .map_err(KvmError::ioctl("KVM_GET_VCPU_EVENTS"))?;
        Ok(events)
    }

    pub fn set_vcpu_events(&self, events: &kvm_vcpu_events) -> Result<()> {
        // SAFETY: the kernel only reads the struct.
        unsafe { ioctls::kvm_set_vcpu_events(self.as_raw_fd(), events) }
            .map_err(KvmError::ioctl("KVM_SET_VCPU_EVENTS"))?;
        Ok(())
    }

    /// Get the extended control registers (XCR0).
    pub fn get_xcrs(&self) -> Result<kvm_xcrs> {
        let mut xcrs = kvm_xcrs::default();
        // SAFETY: the kernel fills the struct.
        unsafe { ioctls::kvm_get_xcrs(self.as_raw_fd(), &mut xcrs) }
            .map_err(KvmError::ioctl("KVM_GET_XCRS"))?;
        Ok(xcrs)
    }

    pub fn set_xcrs(&self, xcrs: &kvm_xcrs) -> Result<()> {
        // SAFETY: the kernel only reads the struct.
        unsafe { ioctls::kvm_set_xcrs(self.as_raw_fd(), xcrs) }
            .map_err(KvmError::ioctl("KVM_SET_XCRS"))?;
        Ok(())
    }

    pub fn get_debug_regs(&self) -> Result<kvm_debugregs> {
        let mut regs = kvm_debugregs::default();
        // SAFETY: the kernel fills the struct.
        unsafe { ioctls::kvm_get_debugregs(self.as_raw_fd(), &mut regs) }
            .map_err(KvmError::ioctl("KVM_GET_DEBUGREGS"))?;
        Ok(regs)
    }

    pub fn set_debug_regs(&self, regs: &kvm_debugregs) -> Result<()> {
        // SAFETY: the kernel only reads the struct.
        unsafe { ioctls::kvm_set_debugregs(self.as_raw_fd(), regs) }
            .map_err(KvmError::ioctl("KVM_SET_DEBUGREGS"))?;
        Ok(())
    }

    /// Guest TSC frequency in kHz.
    pub fn get_tsc_khz(&self) -> Result<u32> {
        // SAFETY: KVM_GET_TSC_KHZ takes no argument.
        let khz = unsafe { ioctl_with_val(self.as_raw_fd(), ioctls::KVM_GET_TSC_KHZ, 0) }
            .map_err(KvmError::ioctl("KVM_GET_TSC_KHZ"))?;
        Ok(khz as u32)
    }

    /// Set the guest TSC frequency in kHz.
    pub fn set_tsc_khz(&self, khz: u32) -> Result<()> {
        // SAFETY: KVM_SET_TSC_KHZ takes the frequency by value.
        unsafe { ioctl_with_val(self.as_raw_fd(), ioctls::KVM_SET_TSC_KHZ, khz as c_ulong) }
            .map_err(KvmError::ioctl("KVM_SET_TSC_KHZ"))?;
        Ok(())
    }
}

#[cfg(target_arch = "aarch64")]
const KVM_REG_SIZE_SHIFT: u64 = 52;
#[cfg(target_arch = "aarch64")]
const KVM_REG_SIZE_MASK: u64 = 0x00f0_0000_0000_0000;

/// Size in bytes of the register named by `reg_id`.
#[cfg(target_arch = "aarch64")]
fn reg_size(reg_id: u64) -> usize {
    1 << ((reg_id & KVM_REG_SIZE_MASK) >> KVM_REG_SIZE_SHIFT)
}

#[cfg(target_arch = "aarch64")]
impl VcpuFd {
    /// Initialize the vCPU for `kvi.target` with the requested features.
    /// Must be done before any other vCPU ioctl.
    pub fn vcpu_init(&self, kvi: &kvm_vcpu_init) -> Result<()> {
        // SAFETY: the kernel only reads the struct.
        unsafe { ioctls::kvm_arm_vcpu_init(self.as_raw_fd(), kvi) }
            .map_err(KvmError::ioctl("KVM_ARM_VCPU_INIT"))?;
        Ok(())
    }

    /// Read one register into `data`. Returns the register size.
    pub fn get_one_reg(&self, reg_id: u64, data: &mut [u8]) -> Result<usize> {
        let size = reg_size(reg_id);
        if data.len() < size {
            return Err(KvmError::Ioctl {
                ioctl: "KVM_GET_ONE_REG",
                source: Errno::EINVAL,
            });
        }
        let reg = kvm_one_reg {
            id: reg_id,
            addr: data.as_mut_ptr() as u64,
        };
        // SAFETY: `data` has room for the register, which is all the kernel writes.
        unsafe { ioctls::kvm_get_one_reg(self.as_raw_fd(), &reg) }
            .map_err(KvmError::ioctl("KVM_GET_ONE_REG"))?;
        Ok(size)
    }

    /// Write one register from `data`. Returns the register size.
    pub fn set_one_reg(&self, reg_id: u64, data: &[u8]) -> Result<usize> {
        let size = reg_size(reg_id);
        if data.len() < size {
            return Err(KvmError::Ioctl {
                ioctl: "KVM_SET_ONE_REG",
                source: Errno::EINVAL,
            });
        }
        let reg = kvm_one_reg {
            id: reg_id,
            addr: data.as_ptr() as u64,
        };
        // SAFETY: the kernel reads `size` bytes from `data`.
        unsafe { ioctls::kvm_set_one_reg(self.as_raw_fd(), &reg) }
            .map_err(KvmError::ioctl("KVM_SET_ONE_REG"))?;
        Ok(size)
    }

    /// Ids of every register reachable through the one-reg interface.
    pub fn get_reg_list(&self, capacity: usize) -> Result<RegList> {
        let mut list = RegList::new(capacity)?;
        list.prepare_for_kernel();
        let ptr = list.as_mut_fam_struct_ptr();
        // SAFETY: the record advertises its own capacity.
        unsafe { ioctls::kvm_get_reg_list(self.as_raw_fd(), ptr) }
            .map_err(KvmError::ioctl("KVM_GET_REG_LIST"))?;
        list.accept_kernel_count()?;
        Ok(list)
    }
}

impl AsRawFd for VcpuFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl std::fmt::Debug for VcpuFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcpuFd")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("run_size", &self.run.size())
            .finish()
    }
}
