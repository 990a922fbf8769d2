//! The shared run region and vCPU exit decoding.
//!
//! Each vCPU descriptor can be `mmap`ed to obtain a page shared with the
//! kernel. Userspace writes control bytes into it before `KVM_RUN`, and the
//! kernel writes the exit reason and its payload into it before returning:
//!
//! ```text
//! offset  0  request_interrupt_window : u8
//!         1  immediate_exit           : u8
//!         8  exit_reason              : u32
//!        12  ready_for_interrupt_injection, if_flag : u8, flags : u16
//!        16  cr8                      : u64
//!        24  apic_base                : u64
//!        32  exit payload (union, 256 bytes)
//!       ...  I/O data area, located by the I/O payload's data_offset
//! ```
//!
//! Only the header is described here; the region itself may be larger and
//! its size comes from `KVM_GET_VCPU_MMAP_SIZE`.

use super::{KvmError, Result};
use nix::errno::Errno;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::cell::Cell;
use std::ffi::c_void;
use std::marker::PhantomData;
use std::mem::{offset_of, size_of};
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Cause of a vCPU exit, as written by the kernel into `exit_reason`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ExitReason {
    Unknown = 0,
    Exception = 1,
    Io = 2,
    Hypercall = 3,
    Debug = 4,
    Hlt = 5,
    Mmio = 6,
    IrqWindowOpen = 7,
    Shutdown = 8,
    FailEntry = 9,
    Intr = 10,
    SetTpr = 11,
    TprAccess = 12,
    S390Sieic = 13,
    S390Reset = 14,
    Dcr = 15,
    Nmi = 16,
    InternalError = 17,
    Osi = 18,
    PaprHcall = 19,
    S390Ucontrol = 20,
    Watchdog = 21,
    S390Tsch = 22,
    Epr = 23,
    SystemEvent = 24,
    S390Stsi = 25,
    IoapicEoi = 26,
    Hyperv = 27,
    ArmNisv = 28,
    X86Rdmsr = 29,
    X86Wrmsr = 30,
    DirtyRingFull = 31,
    ApResetHold = 32,
    X86BusLock = 33,
    Xen = 34,
    RiscvSbi = 35,
    RiscvCsr = 36,
    Notify = 37,
    LoongarchIocsr = 38,
    MemoryFault = 39,
}

impl ExitReason {
    const ALL: [ExitReason; 40] = [
        Self::Unknown,
        Self::Exception,
        Self::Io,
        Self::Hypercall,
        Self::Debug,
        Self::Hlt,
        Self::Mmio,
        Self::IrqWindowOpen,
        Self::Shutdown,
        Self::FailEntry,
        Self::Intr,
        Self::SetTpr,
        Self::TprAccess,
        Self::S390Sieic,
        Self::S390Reset,
        Self::Dcr,
        Self::Nmi,
        Self::InternalError,
        Self::Osi,
        Self::PaprHcall,
        Self::S390Ucontrol,
        Self::Watchdog,
        Self::S390Tsch,
        Self::Epr,
        Self::SystemEvent,
        Self::S390Stsi,
        Self::IoapicEoi,
        Self::Hyperv,
        Self::ArmNisv,
        Self::X86Rdmsr,
        Self::X86Wrmsr,
        Self::DirtyRingFull,
        Self::ApResetHold,
        Self::X86BusLock,
        Self::Xen,
        Self::RiscvSbi,
        Self::RiscvCsr,
        Self::Notify,
        Self::LoongarchIocsr,
        Self::MemoryFault,
    ];

    /// Numeric value used by the kernel.
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for ExitReason {
    type Error = KvmError;

    fn try_from(code: u32) -> Result<Self> {
        Self::ALL
            .get(code as usize)
            .copied()
            .ok_or(KvmError::UnexpectedExitReason(code))
    }
}

/// Direction values of the I/O exit payload.
const IO_IN: u8 = 0;
const IO_OUT: u8 = 1;

/// Fixed header of the run region.
#[repr(C)]
struct RunHeader {
    request_interrupt_window: u8,
    immediate_exit: u8,
    _padding: [u8; 6],
    exit_reason: u32,
    ready_for_interrupt_injection: u8,
    if_flag: u8,
    flags: u16,
    cr8: u64,
    apic_base: u64,
    exit: [u64; 32],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct IoPayload {
    direction: u8,
    size: u8,
    port: u16,
    count: u32,
    data_offset: u64,
}

#[repr(C)]
struct MmioPayload {
    phys_addr: u64,
    data: [u8; 8],
    len: u32,
    is_write: u8,
}

#[repr(C)]
struct HypercallPayload {
    nr: u64,
    args: [u64; 6],
    ret: u64,
    // `longmode` on older kernels, `flags` on newer ones.
    flags: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct FailEntryPayload {
    hardware_entry_failure_reason: u64,
    cpu: u32,
}

#[repr(C)]
struct DataPayload {
    kind: u32,
    ndata: u32,
    data: [u64; 16],
}

const EXIT_OFFSET: usize = offset_of!(RunHeader, exit);
const IMMEDIATE_EXIT_OFFSET: usize = offset_of!(RunHeader, immediate_exit);

const _: () = {
    assert!(offset_of!(RunHeader, immediate_exit) == 1);
    assert!(offset_of!(RunHeader, exit_reason) == 8);
    assert!(offset_of!(RunHeader, cr8) == 16);
    assert!(offset_of!(RunHeader, apic_base) == 24);
    assert!(EXIT_OFFSET == 32);
    assert!(size_of::<RunHeader>() == 32 + 256);
    assert!(size_of::<IoPayload>() == 16);
    assert!(offset_of!(MmioPayload, len) == 16);
    assert!(size_of::<HypercallPayload>() == 72);
    assert!(size_of::<DataPayload>() <= 256);
};

/// Hypercall arguments, with a writable return value slot.
#[derive(Debug)]
pub struct HypercallExit<'a> {
    pub nr: u64,
    pub args: [u64; 6],
    pub flags: u64,
    pub ret: &'a mut u64,
}

/// A decoded vCPU exit, borrowing from the run region.
///
/// Payload buffers point into the shared page. Bytes written into the
/// buffers of [`IoIn`](Self::IoIn) and [`MmioRead`](Self::MmioRead) are what
/// the guest observes when the vCPU is next run.
#[derive(Debug)]
pub enum VcpuExit<'a> {
    /// Guest wrote to an I/O port.
    IoOut(u16, &'a [u8]),
    /// Guest read from an I/O port; fill the buffer.
    IoIn(u16, &'a mut [u8]),
    /// Guest read from unbacked guest-physical memory; fill the buffer.
    MmioRead(u64, &'a mut [u8]),
    /// Guest wrote to unbacked guest-physical memory.
    MmioWrite(u64, &'a [u8]),
    /// The hardware exit reason KVM could not map.
    Unknown(u64),
    Exception,
    Hypercall(HypercallExit<'a>),
    Debug,
    Hlt,
    IrqWindowOpen,
    Shutdown,
    /// VM entry failed: hardware failure reason and the host CPU.
    FailEntry(u64, u32),
    /// `KVM_RUN` returned before entering or while in the guest because of a
    /// pending signal or `immediate_exit`.
    Intr,
    SetTpr,
    TprAccess,
    S390Sieic,
    S390Reset,
    Dcr,
    Nmi,
    /// KVM hit an internal error: suberror code and its diagnostic words.
    InternalError(u32, &'a [u64]),
    Osi,
    PaprHcall,
    S390Ucontrol,
    Watchdog,
    S390Tsch,
    Epr,
    /// Guest requested a system-level event: event type and its data words.
    SystemEvent(u32, &'a [u64]),
    S390Stsi,
    IoapicEoi(u8),
    Hyperv,
    ArmNisv,
    X86Rdmsr,
    X86Wrmsr,
    DirtyRingFull,
    ApResetHold,
    X86BusLock,
    Xen,
    RiscvSbi,
    RiscvCsr,
    Notify,
    LoongarchIocsr,
    MemoryFault,
}

/// The `MAP_SHARED` mapping itself, shared by a [`RunRegion`] and every
/// [`ImmediateExit`] handle taken from it.
struct RunMapping {
    ptr: NonNull<c_void>,
    size: usize,
}

// SAFETY: plain shared memory. The only byte touched from more than one
// thread is `immediate_exit`, and it is only accessed atomically.
unsafe impl Send for RunMapping {}
unsafe impl Sync for RunMapping {}

impl RunMapping {
    fn immediate_exit(&self) -> &AtomicU8 {
        // SAFETY: the byte lies inside the mapping, which lives as long as
        // `self`, and no non-atomic access to it exists.
        unsafe { AtomicU8::from_ptr(self.ptr.as_ptr().cast::<u8>().add(IMMEDIATE_EXIT_OFFSET)) }
    }
}

impl Drop for RunMapping {
    fn drop(&mut self) {
        // SAFETY: the pointer and length come from the matching mmap, and no
        // borrow of the mapping can outlive `self`.
        if let Err(err) = unsafe { munmap(self.ptr, self.size) } {
            tracing::debug!(%err, "failed to unmap vcpu run region");
        }
    }
}

/// A vCPU's run region, as seen by the thread that runs the vCPU.
pub(crate) struct RunRegion {
    map: Arc<RunMapping>,
    // Send, not Sync: exits hand out views into the region.
    _not_sync: PhantomData<Cell<()>>,
}

impl RunRegion {
    /// Map `size` bytes of the vCPU descriptor `fd`.
    pub(crate) fn map<F: AsFd>(fd: F, size: usize) -> Result<Self> {
        if size < size_of::<RunHeader>() {
            return Err(KvmError::MapRunRegion(Errno::EINVAL));
        }
        let length = NonZeroUsize::new(size).ok_or(KvmError::MapRunRegion(Errno::EINVAL))?;

        // SAFETY: a fresh shared mapping of a vCPU descriptor aliases no Rust
        // object; it is only reached through this struct.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(KvmError::MapRunRegion)?;

        Ok(Self {
            map: Arc::new(RunMapping { ptr, size }),
            _not_sync: PhantomData,
        })
    }

    pub(crate) fn size(&self) -> usize {
        self.map.size
    }

    fn base(&self) -> *mut u8 {
        self.map.ptr.as_ptr().cast()
    }

    // Header fields are accessed through this pointer, never through a
    // reference, since `immediate_exit` may be written by other threads.
    fn header_ptr(&self) -> *mut RunHeader {
        self.base().cast()
    }

    pub(crate) fn raw_exit_reason(&self) -> u32 {
        // SAFETY: the mapping is page aligned and at least one header long.
        unsafe { (*self.header_ptr()).exit_reason }
    }

    pub(crate) fn immediate_exit(&self) -> bool {
        self.map.immediate_exit().load(Ordering::SeqCst) != 0
    }

    pub(crate) fn set_immediate_exit(&mut self, value: bool) {
        self.map.immediate_exit().store(u8::from(value), Ordering::SeqCst);
    }

    /// A handle to `immediate_exit` that other threads can keep.
    pub(crate) fn immediate_exit_handle(&self) -> ImmediateExit {
        ImmediateExit {
            map: Arc::clone(&self.map),
        }
    }

    pub(crate) fn request_interrupt_window(&self) -> bool {
        // SAFETY: as in `raw_exit_reason`.
        unsafe { (*self.header_ptr()).request_interrupt_window != 0 }
    }

    pub(crate) fn set_request_interrupt_window(&mut self, value: bool) {
        // SAFETY: as in `raw_exit_reason`; `&mut self` excludes other writers.
        unsafe { (*self.header_ptr()).request_interrupt_window = u8::from(value) };
    }

    pub(crate) fn ready_for_interrupt_injection(&self) -> bool {
        // SAFETY: as in `raw_exit_reason`.
        unsafe { (*self.header_ptr()).ready_for_interrupt_injection != 0 }
    }

    pub(crate) fn if_flag(&self) -> bool {
        // SAFETY: as in `raw_exit_reason`.
        unsafe { (*self.header_ptr()).if_flag != 0 }
    }

    pub(crate) fn cr8(&self) -> u64 {
        // SAFETY: as in `raw_exit_reason`.
        unsafe { (*self.header_ptr()).cr8 }
    }

    pub(crate) fn apic_base(&self) -> u64 {
        // SAFETY: as in `raw_exit_reason`.
        unsafe { (*self.header_ptr()).apic_base }
    }

    pub(crate) fn flags(&self) -> u16 {
        // SAFETY: as in `raw_exit_reason`.
        unsafe { (*self.header_ptr()).flags }
    }

    /// Pointer to the exit payload, typed as `T`.
    fn payload<T>(&self) -> *mut T {
        // SAFETY: the payload lies inside the mapped header.
        unsafe { self.base().add(EXIT_OFFSET).cast() }
    }

    /// Decode the exit the kernel last reported.
    pub(crate) fn exit(&mut self) -> Result<VcpuExit<'_>> {
        let reason = ExitReason::try_from(self.raw_exit_reason())?;

        // SAFETY (all arms): each payload is read as the variant the kernel
        // selected through `exit_reason`, lies inside the mapped header, and
        // the returned borrows are tied to `&mut self`.
        let exit = match reason {
            ExitReason::Io => return self.io_exit(),
            ExitReason::Mmio => {
                let mmio = unsafe { &mut *self.payload::<MmioPayload>() };
                let len = mmio.len as usize;
                if len > mmio.data.len() {
                    return Err(KvmError::MalformedExit {
                        reason,
                        detail: "mmio length exceeds 8 bytes",
                    });
                }
                let addr = mmio.phys_addr;
                if mmio.is_write != 0 {
                    VcpuExit::MmioWrite(addr, &mmio.data[..len])
                } else {
                    VcpuExit::MmioRead(addr, &mut mmio.data[..len])
                }
            }
            ExitReason::Hypercall => {
                let call = unsafe { &mut *self.payload::<HypercallPayload>() };
                VcpuExit::Hypercall(HypercallExit {
                    nr: call.nr,
                    args: call.args,
                    flags: call.flags,
                    ret: &mut call.ret,
                })
            }
            ExitReason::Unknown => VcpuExit::Unknown(unsafe { *self.payload::<u64>() }),
            ExitReason::FailEntry => {
                let fail = unsafe { *self.payload::<FailEntryPayload>() };
                VcpuExit::FailEntry(fail.hardware_entry_failure_reason, fail.cpu)
            }
            ExitReason::InternalError => {
                let (suberror, data) = self.data_payload(reason)?;
                VcpuExit::InternalError(suberror, data)
            }
            ExitReason::SystemEvent => {
                let (kind, data) = self.data_payload(reason)?;
                VcpuExit::SystemEvent(kind, data)
            }
            ExitReason::IoapicEoi => VcpuExit::IoapicEoi(unsafe { *self.payload::<u8>() }),
            ExitReason::Exception => VcpuExit::Exception,
            ExitReason::Debug => VcpuExit::Debug,
            ExitReason::Hlt => VcpuExit::Hlt,
            ExitReason::IrqWindowOpen => VcpuExit::IrqWindowOpen,
            ExitReason::Shutdown => VcpuExit::Shutdown,
            ExitReason::Intr => VcpuExit::Intr,
            ExitReason::SetTpr => VcpuExit::SetTpr,
            ExitReason::TprAccess => VcpuExit::TprAccess,
            ExitReason::S390Sieic => VcpuExit::S390Sieic,
            ExitReason::S390Reset => VcpuExit::S390Reset,
            ExitReason::Dcr => VcpuExit::Dcr,
            ExitReason::Nmi => VcpuExit::Nmi,
            ExitReason::Osi => VcpuExit::Osi,
            ExitReason::PaprHcall => VcpuExit::PaprHcall,
            ExitReason::S390Ucontrol => VcpuExit::S390Ucontrol,
            ExitReason::Watchdog => VcpuExit::Watchdog,
            ExitReason::S390Tsch => VcpuExit::S390Tsch,
            ExitReason::Epr => VcpuExit::Epr,
            ExitReason::S390Stsi => VcpuExit::S390Stsi,
            ExitReason::Hyperv => VcpuExit::Hyperv,
            ExitReason::ArmNisv => VcpuExit::ArmNisv,
            ExitReason::X86Rdmsr => VcpuExit::X86Rdmsr,
            ExitReason::X86Wrmsr => VcpuExit::X86Wrmsr,
            ExitReason::DirtyRingFull => VcpuExit::DirtyRingFull,
            ExitReason::ApResetHold => VcpuExit::ApResetHold,
            ExitReason::X86BusLock => VcpuExit::X86BusLock,
            ExitReason::Xen => VcpuExit::Xen,
            ExitReason::RiscvSbi => VcpuExit::RiscvSbi,
            ExitReason::RiscvCsr => VcpuExit::RiscvCsr,
            ExitReason::Notify => VcpuExit::Notify,
            ExitReason::LoongarchIocsr => VcpuExit::LoongarchIocsr,
            ExitReason::MemoryFault => VcpuExit::MemoryFault,
        };
        Ok(exit)
    }

    fn io_exit(&mut self) -> Result<VcpuExit<'_>> {
        let malformed = |detail| KvmError::MalformedExit { reason: ExitReason::Io, detail };

        // SAFETY: the kernel reported an I/O exit.
        let io = unsafe { *self.payload::<IoPayload>() };
        let len = usize::from(io.size) * io.count as usize;
        let offset = usize::try_from(io.data_offset)
            .map_err(|_| malformed("data offset overflows"))?;
        match offset.checked_add(len) {
            Some(end) if end <= self.size() => {}
            _ => return Err(malformed("data area lies outside the run region")),
        }

        // SAFETY: `offset..offset + len` was checked to lie inside the
        // mapping, and the borrow is tied to `&mut self`.
        let data = unsafe { slice::from_raw_parts_mut(self.base().add(offset), len) };
        match io.direction {
            IO_IN => Ok(VcpuExit::IoIn(io.port, data)),
            IO_OUT => Ok(VcpuExit::IoOut(io.port, data)),
            _ => Err(malformed("unknown I/O direction")),
        }
    }

    fn data_payload(&self, reason: ExitReason) -> Result<(u32, &[u64])> {
        // SAFETY: the caller matched `reason` to a payload with this layout.
        let payload = unsafe { &*self.payload::<DataPayload>() };
        let ndata = payload.ndata as usize;
        if ndata > payload.data.len() {
            return Err(KvmError::MalformedExit { reason, detail: "ndata exceeds 16 words" });
        }
        Ok((payload.kind, &payload.data[..ndata]))
    }
}

/// Shared handle to a vCPU's `immediate_exit` flag.
///
/// Unlike [`VcpuFd::set_immediate_exit`](super::VcpuFd::set_immediate_exit),
/// the handle can be used while another thread is inside `run`, including
/// from a signal handler: [`set`](Self::set) is a single atomic store. The
/// handle keeps the run region mapped for as long as it exists.
#[derive(Clone)]
pub struct ImmediateExit {
    map: Arc<RunMapping>,
}

impl ImmediateExit {
    pub fn set(&self, value: bool) {
        self.map.immediate_exit().store(u8::from(value), Ordering::SeqCst);
    }

    pub fn get(&self) -> bool {
        self.map.immediate_exit().load(Ordering::SeqCst) != 0
    }
}

impl std::fmt::Debug for ImmediateExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmediateExit").field("set", &self.get()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    /// A run region backed by an anonymous temporary file, filled in by the
    /// test the way the kernel would.
    struct FakeRun {
        _file: File,
        region: RunRegion,
    }

    impl FakeRun {
        fn new(size: usize) -> Self {
            let name = std::ffi::CString::new("fake-kvm-run").unwrap();
            let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
            assert!(raw >= 0);
            let file = unsafe { <File as std::os::fd::FromRawFd>::from_raw_fd(raw) };
            file.set_len(size as u64).unwrap();
            let region = RunRegion::map(file.as_fd(), size).unwrap();
            Self { _file: file, region }
        }

        fn set_reason(&mut self, reason: u32) {
            unsafe { (*self.region.header_ptr()).exit_reason = reason };
        }

        fn write_at(&mut self, offset: usize, bytes: &[u8]) {
            assert!(offset + bytes.len() <= self.region.size());
            unsafe {
                let dst = self.region.base().add(offset);
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            }
        }

        fn read_at(&self, offset: usize, len: usize) -> Vec<u8> {
            unsafe { slice::from_raw_parts(self.region.base().add(offset), len).to_vec() }
        }

        fn set_io(&mut self, direction: u8, size: u8, port: u16, count: u32, data_offset: u64) {
            let io = IoPayload { direction, size, port, count, data_offset };
            unsafe { *self.region.payload::<IoPayload>() = io };
            self.set_reason(ExitReason::Io.code());
        }
    }

    #[test]
    fn test_exit_reason_codes() {
        for (code, reason) in ExitReason::ALL.iter().enumerate() {
            assert_eq!(reason.code() as usize, code);
            assert_eq!(ExitReason::try_from(code as u32).unwrap(), *reason);
        }
        assert_eq!(ExitReason::try_from(2).unwrap(), ExitReason::Io);
        assert_eq!(ExitReason::try_from(5).unwrap(), ExitReason::Hlt);
        assert_eq!(ExitReason::try_from(39).unwrap(), ExitReason::MemoryFault);
    }

    #[test]
    fn test_unknown_exit_reason() {
        let err = ExitReason::try_from(40).unwrap_err();
        assert!(matches!(err, KvmError::UnexpectedExitReason(40)));

        let mut run = FakeRun::new(4096);
        run.set_reason(1000);
        assert!(matches!(run.region.exit(), Err(KvmError::UnexpectedExitReason(1000))));
    }

    #[test]
    fn test_io_out_exit() {
        let mut run = FakeRun::new(4096);
        run.write_at(0x100, &[0x42, 0x43]);
        run.set_io(IO_OUT, 1, 0x3f8, 2, 0x100);

        match run.region.exit().unwrap() {
            VcpuExit::IoOut(port, data) => {
                assert_eq!(port, 0x3f8);
                assert_eq!(data, &[0x42, 0x43]);
            }
            other => panic!("unexpected exit {other:?}"),
        }
    }

    #[test]
    fn test_io_in_writes_reach_region() {
        let mut run = FakeRun::new(4096);
        run.set_io(IO_IN, 4, 0xcfc, 1, 0x200);

        match run.region.exit().unwrap() {
            VcpuExit::IoIn(port, data) => {
                assert_eq!(port, 0xcfc);
                assert_eq!(data.len(), 4);
                data.copy_from_slice(&[1, 2, 3, 4]);
            }
            other => panic!("unexpected exit {other:?}"),
        }
        assert_eq!(run.read_at(0x200, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_io_data_outside_region() {
        let mut run = FakeRun::new(4096);
        run.set_io(IO_OUT, 4, 0x80, 2, 4092);
        assert!(matches!(
            run.region.exit(),
            Err(KvmError::MalformedExit { reason: ExitReason::Io, .. })
        ));
    }

    #[test]
    fn test_mmio_exits() {
        let mut run = FakeRun::new(4096);
        let write = MmioPayload {
            phys_addr: 0xd000_0000,
            data: [0xaa, 0xbb, 0, 0, 0, 0, 0, 0],
            len: 2,
            is_write: 1,
        };
        unsafe { *run.region.payload::<MmioPayload>() = write };
        run.set_reason(ExitReason::Mmio.code());
        match run.region.exit().unwrap() {
            VcpuExit::MmioWrite(addr, data) => {
                assert_eq!(addr, 0xd000_0000);
                assert_eq!(data, &[0xaa, 0xbb]);
            }
            other => panic!("unexpected exit {other:?}"),
        }

        let read = MmioPayload { phys_addr: 0xd000_0010, data: [0; 8], len: 4, is_write: 0 };
        unsafe { *run.region.payload::<MmioPayload>() = read };
        match run.region.exit().unwrap() {
            VcpuExit::MmioRead(addr, data) => {
                assert_eq!(addr, 0xd000_0010);
                data.copy_from_slice(&[9, 8, 7, 6]);
            }
            other => panic!("unexpected exit {other:?}"),
        }
        // data[] starts 8 bytes into the payload.
        assert_eq!(run.read_at(EXIT_OFFSET + 8, 4), vec![9, 8, 7, 6]);
    }

    #[test]
    fn test_mmio_length_checked() {
        let mut run = FakeRun::new(4096);
        let bad = MmioPayload { phys_addr: 0, data: [0; 8], len: 9, is_write: 1 };
        unsafe { *run.region.payload::<MmioPayload>() = bad };
        run.set_reason(ExitReason::Mmio.code());
        assert!(run.region.exit().is_err());
    }

    #[test]
    fn test_system_event_exit() {
        let mut run = FakeRun::new(4096);
        let mut event = DataPayload { kind: 1, ndata: 2, data: [0; 16] };
        event.data[0] = 7;
        event.data[1] = 8;
        unsafe { std::ptr::write(run.region.payload::<DataPayload>(), event) };
        run.set_reason(ExitReason::SystemEvent.code());

        match run.region.exit().unwrap() {
            VcpuExit::SystemEvent(kind, data) => {
                assert_eq!(kind, 1);
                assert_eq!(data, &[7, 8]);
            }
            other => panic!("unexpected exit {other:?}"),
        }
    }

    #[test]
    fn test_hypercall_return_slot() {
        let mut run = FakeRun::new(4096);
        let call = HypercallPayload { nr: 11, args: [1, 2, 3, 4, 5, 6], ret: 0, flags: 0 };
        unsafe { std::ptr::write(run.region.payload::<HypercallPayload>(), call) };
        run.set_reason(ExitReason::Hypercall.code());

        match run.region.exit().unwrap() {
            VcpuExit::Hypercall(call) => {
                assert_eq!(call.nr, 11);
                assert_eq!(call.args[5], 6);
                *call.ret = 0x99;
            }
            other => panic!("unexpected exit {other:?}"),
        }
        // ret follows nr and six arguments.
        assert_eq!(run.read_at(EXIT_OFFSET + 56, 8), 0x99u64.to_ne_bytes().to_vec());
    }

    #[test]
    fn test_simple_exits() {
        let mut run = FakeRun::new(4096);
        run.set_reason(ExitReason::Hlt.code());
        assert!(matches!(run.region.exit().unwrap(), VcpuExit::Hlt));
        run.set_reason(ExitReason::Shutdown.code());
        assert!(matches!(run.region.exit().unwrap(), VcpuExit::Shutdown));

        let fail = FailEntryPayload { hardware_entry_failure_reason: 0x21, cpu: 3 };
        unsafe { *run.region.payload::<FailEntryPayload>() = fail };
        run.set_reason(ExitReason::FailEntry.code());
        assert!(matches!(run.region.exit().unwrap(), VcpuExit::FailEntry(0x21, 3)));
    }

    #[test]
    fn test_control_bytes() {
        let mut run = FakeRun::new(4096);
        assert!(!run.region.immediate_exit());
        run.region.set_immediate_exit(true);
        assert!(run.region.immediate_exit());
        assert_eq!(run.read_at(1, 1), vec![1]);

        run.region.set_request_interrupt_window(true);
        assert!(run.region.request_interrupt_window());
        assert_eq!(run.read_at(0, 1), vec![1]);
        run.region.set_immediate_exit(false);
        assert_eq!(run.read_at(1, 1), vec![0]);
    }

    #[test]
    fn test_immediate_exit_from_another_thread() {
        let mut run = FakeRun::new(4096);
        let handle = run.region.immediate_exit_handle();

        std::thread::spawn(move || handle.set(true)).join().unwrap();
        assert!(run.region.immediate_exit());
        assert_eq!(run.read_at(1, 1), vec![1]);

        let handle = run.region.immediate_exit_handle();
        run.region.set_immediate_exit(false);
        assert!(!handle.get());
    }

    #[test]
    fn test_immediate_exit_handle_keeps_region_mapped() {
        let run = FakeRun::new(4096);
        let handle = run.region.immediate_exit_handle();
        drop(run);

        handle.set(true);
        assert!(handle.get());
    }

    #[test]
    fn test_immediate_exit_handle_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ImmediateExit>();
    }

    #[test]
    fn test_region_too_small() {
        let file = File::open("/dev/zero").unwrap();
        assert!(matches!(
            RunRegion::map(file.as_fd(), 64),
            Err(KvmError::MapRunRegion(Errno::EINVAL))
        ));
    }
}
