//! End-to-end run/exit protocol against a real-mode x86 guest.
//!
//! Each test skips (passes) when `/dev/kvm` cannot be opened.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use kvmcap::kvm::{IoHandler, Kvm, MmioHandler, UserMemoryRegion, VcpuExit, VcpuFd, VmFd};
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

const MEM_SIZE: usize = 0x4000;
const CODE_ADDR: u64 = 0x1000;

/// Real-mode program exercising every kind of userspace exit.
const PROGRAM: &[u8] = &[
    0xb0, 0x42, //       mov al, 0x42
    0xe6, 0x10, //       out 0x10, al
    0xe4, 0x20, //       in al, 0x20
    0xa2, 0x00, 0x80, // mov [0x8000], al
    0xa0, 0x00, 0x90, // mov al, [0x9000]
    0xe6, 0x11, //       out 0x11, al
    0xf4, //             hlt
];

// Fields drop in order, so memory outlives the VM that maps it.
struct Guest {
    vcpu: VcpuFd,
    _vm: VmFd,
    _mem: GuestMemoryMmap,
}

fn guest() -> Option<Guest> {
    let kvm = match Kvm::open() {
        Ok(kvm) => kvm,
        Err(err) => {
            eprintln!("skipping: {err}");
            return None;
        }
    };
    let vm = kvm.create_vm().unwrap();

    let mem: GuestMemoryMmap =
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), MEM_SIZE)]).unwrap();
    mem.write_slice(PROGRAM, GuestAddress(CODE_ADDR)).unwrap();
    let host_addr = mem.get_host_address(GuestAddress(0)).unwrap() as u64;
    let region = UserMemoryRegion::new(0, GuestAddress(0), MEM_SIZE as u64, host_addr);
    // SAFETY: `mem` lives in the returned `Guest` next to the VM.
    unsafe { vm.set_user_memory_region(region) }.unwrap();

    let vcpu = vm.create_vcpu(0).unwrap();
    let mut sregs = vcpu.get_sregs().unwrap();
    sregs.cs.base = 0;
    sregs.cs.selector = 0;
    sregs.ds.base = 0;
    sregs.ds.selector = 0;
    vcpu.set_sregs(&sregs).unwrap();

    let mut regs = vcpu.get_regs().unwrap();
    regs.rip = CODE_ADDR;
    regs.rflags = 0x2;
    vcpu.set_regs(&regs).unwrap();

    Some(Guest {
        vcpu,
        _vm: vm,
        _mem: mem,
    })
}

#[test]
fn test_exits_in_order() {
    let Some(mut guest) = guest() else { return };
    let mut events = Vec::new();

    loop {
        match guest.vcpu.run().unwrap() {
            VcpuExit::IoOut(port, data) => events.push(format!("out {port:#x} {data:?}")),
            VcpuExit::IoIn(port, data) => {
                assert_eq!(data.len(), 1);
                data[0] = 0x07;
                events.push(format!("in {port:#x}"));
            }
            VcpuExit::MmioWrite(addr, data) => events.push(format!("write {addr:#x} {data:?}")),
            VcpuExit::MmioRead(addr, data) => {
                assert_eq!(data.len(), 1);
                data[0] = 0x05;
                events.push(format!("read {addr:#x}"));
            }
            VcpuExit::Hlt => break,
            other => panic!("unexpected exit: {other:?}"),
        }
    }

    assert_eq!(
        events,
        [
            "out 0x10 [66]",
            "in 0x20",
            "write 0x8000 [7]",
            "read 0x9000",
            "out 0x11 [5]",
        ]
    );

    let regs = guest.vcpu.get_regs().unwrap();
    assert_eq!(regs.rax & 0xff, 0x05);
    assert_eq!(regs.rip, CODE_ADDR + PROGRAM.len() as u64);
}

#[derive(Default)]
struct Recorder {
    writes: Vec<(u16, Vec<u8>)>,
    mmio_writes: Vec<(u64, Vec<u8>)>,
}

impl IoHandler for Recorder {
    fn io_read(&mut self, _port: u16, data: &mut [u8]) {
        data.fill(0x07);
    }

    fn io_write(&mut self, port: u16, data: &[u8]) {
        self.writes.push((port, data.to_vec()));
    }
}

impl MmioHandler for Recorder {
    fn mmio_read(&mut self, _addr: u64, data: &mut [u8]) {
        data.fill(0x05);
    }

    fn mmio_write(&mut self, addr: u64, data: &[u8]) {
        self.mmio_writes.push((addr, data.to_vec()));
    }
}

#[test]
fn test_run_with_io_handler() {
    let Some(mut guest) = guest() else { return };
    let mut recorder = Recorder::default();

    loop {
        match guest.vcpu.run_with_io(&mut recorder).unwrap() {
            None => continue,
            Some(VcpuExit::Hlt) => break,
            Some(other) => panic!("unexpected exit: {other:?}"),
        }
    }

    assert_eq!(recorder.writes, [(0x10, vec![0x42]), (0x11, vec![0x05])]);
    assert_eq!(recorder.mmio_writes, [(0x8000, vec![0x07])]);
}

#[test]
fn test_immediate_exit_then_resume() {
    let Some(mut guest) = guest() else { return };

    guest.vcpu.set_immediate_exit(true);
    assert!(matches!(guest.vcpu.run().unwrap(), VcpuExit::Intr));
    // Nothing ran.
    assert_eq!(guest.vcpu.get_regs().unwrap().rip, CODE_ADDR);

    guest.vcpu.set_immediate_exit(false);
    match guest.vcpu.run().unwrap() {
        VcpuExit::IoOut(0x10, data) => assert_eq!(data, [0x42]),
        other => panic!("unexpected exit: {other:?}"),
    }
}
