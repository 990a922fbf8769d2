//! kvmcap - typed, ownership-respecting handles for the Linux KVM API.
//!
//! The crate has two halves:
//!
//! - [`fam`]: [`FamRecord`], an owned buffer for kernel structures that end
//!   in a flexible array member. Portable, no KVM required.
//! - `kvm`: the control plane itself (`Kvm`, `VmFd`, `VcpuFd`, `DeviceFd`),
//!   plus [`EventFd`](kvm::EventFd) and the vCPU run/exit protocol.
//!   Linux only.
//!
//! ```no_run
//! # #[cfg(target_os = "linux")]
//! # fn main() -> kvmcap::kvm::Result<()> {
//! use kvmcap::kvm::{Kvm, VcpuExit};
//!
//! let kvm = Kvm::open()?;
//! let vm = kvm.create_vm()?;
//! let mut vcpu = vm.create_vcpu(0)?;
//! // ... install memory and registers ...
//! loop {
//!     match vcpu.run()? {
//!         VcpuExit::IoOut(port, data) => println!("out {port:#x}: {data:?}"),
//!         VcpuExit::Hlt => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(target_os = "linux"))]
//! # fn main() {}
//! ```

pub mod fam;
#[cfg(target_os = "linux")]
pub mod kvm;

pub use fam::{FamError, FamLayout, FamRecord};
#[cfg(target_os = "linux")]
pub use kvm::{Kvm, KvmError};
