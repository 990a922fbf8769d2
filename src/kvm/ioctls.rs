//! KVM ioctl request table.
//!
//! Request numbers are encoded with nix's `_IO`/`_IOR`/`_IOW`/`_IOWR`
//! helpers from the `KVMIO` type byte, the command number and the size of
//! the argument struct from `kvm-bindings`, exactly as `<linux/kvm.h>` does.
//!
//! Requests that carry an immediate argument (or none) go through
//! [`ioctl_with_val`]; requests that pass a struct get a typed wrapper
//! generated by nix's `ioctl_*!` macros.

use kvm_bindings::*;
use libc::{c_int, c_ulong};
use nix::errno::Errno;
use nix::sys::ioctl::ioctl_num_type;
use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr, request_code_none};

pub const KVMIO: u8 = 0xAE;

// System requests.
pub const KVM_GET_API_VERSION: ioctl_num_type = request_code_none!(KVMIO, 0x00);
pub const KVM_CREATE_VM: ioctl_num_type = request_code_none!(KVMIO, 0x01);
pub const KVM_CHECK_EXTENSION: ioctl_num_type = request_code_none!(KVMIO, 0x03);
pub const KVM_GET_VCPU_MMAP_SIZE: ioctl_num_type = request_code_none!(KVMIO, 0x04);

// VM requests.
pub const KVM_CREATE_VCPU: ioctl_num_type = request_code_none!(KVMIO, 0x41);
#[cfg(target_arch = "x86_64")]
pub const KVM_SET_TSS_ADDR: ioctl_num_type = request_code_none!(KVMIO, 0x47);
#[cfg(target_arch = "x86_64")]
pub const KVM_CREATE_IRQCHIP: ioctl_num_type = request_code_none!(KVMIO, 0x60);

// vCPU requests.
pub const KVM_RUN: ioctl_num_type = request_code_none!(KVMIO, 0x80);
#[cfg(target_arch = "x86_64")]
pub const KVM_SET_TSC_KHZ: ioctl_num_type = request_code_none!(KVMIO, 0xa2);
#[cfg(target_arch = "x86_64")]
pub const KVM_GET_TSC_KHZ: ioctl_num_type = request_code_none!(KVMIO, 0xa3);

/// Issue a request whose argument is passed by value.
///
/// # Safety
///
/// `fd` must be a descriptor that understands `request`, and `request`
/// must not interpret `arg` as a pointer.
pub unsafe fn ioctl_with_val(
    fd: c_int,
    request: ioctl_num_type,
    arg: c_ulong,
) -> nix::Result<c_int> {
    Errno::result(unsafe { libc::ioctl(fd, request, arg) })
}

// System requests taking a FAM record.
#[cfg(target_arch = "x86_64")]
ioctl_readwrite!(kvm_get_msr_index_list, KVMIO, 0x02, kvm_msr_list);
#[cfg(target_arch = "x86_64")]
ioctl_readwrite!(kvm_get_supported_cpuid, KVMIO, 0x05, kvm_cpuid2);
#[cfg(target_arch = "x86_64")]
ioctl_readwrite!(kvm_get_emulated_cpuid, KVMIO, 0x09, kvm_cpuid2);
#[cfg(target_arch = "x86_64")]
ioctl_readwrite!(kvm_get_msr_feature_index_list, KVMIO, 0x0a, kvm_msr_list);

// VM requests.
ioctl_write_ptr!(kvm_set_user_memory_region, KVMIO, 0x46, kvm_userspace_memory_region);
ioctl_write_ptr!(kvm_irq_line, KVMIO, 0x61, kvm_irq_level);
ioctl_write_ptr!(kvm_set_gsi_routing, KVMIO, 0x6a, kvm_irq_routing);
ioctl_write_ptr!(kvm_irqfd, KVMIO, 0x76, kvm_irqfd);
ioctl_write_ptr!(kvm_ioeventfd, KVMIO, 0x79, kvm_ioeventfd);
ioctl_write_ptr!(kvm_enable_cap, KVMIO, 0xa3, kvm_enable_cap);
ioctl_readwrite!(kvm_create_device, KVMIO, 0xe0, kvm_create_device);

#[cfg(target_arch = "x86_64")]
ioctl_write_ptr!(kvm_set_identity_map_addr, KVMIO, 0x48, u64);
#[cfg(target_arch = "x86_64")]
ioctl_readwrite!(kvm_get_irqchip, KVMIO, 0x62, kvm_irqchip);
// Historically declared with _IOR even though userspace writes the chip.
#[cfg(target_arch = "x86_64")]
ioctl_read!(kvm_set_irqchip, KVMIO, 0x63, kvm_irqchip);
#[cfg(target_arch = "x86_64")]
ioctl_write_ptr!(kvm_create_pit2, KVMIO, 0x77, kvm_pit_config);
#[cfg(target_arch = "x86_64")]
ioctl_write_ptr!(kvm_set_clock, KVMIO, 0x7b, kvm_clock_data);
#[cfg(target_arch = "x86_64")]
ioctl_read!(kvm_get_clock, KVMIO, 0x7c, kvm_clock_data);
#[cfg(target_arch = "x86_64")]
ioctl_read!(kvm_get_pit2, KVMIO, 0x9f, kvm_pit_state2);
#[cfg(target_arch = "x86_64")]
ioctl_write_ptr!(kvm_set_pit2, KVMIO, 0xa0, kvm_pit_state2);

#[cfg(target_arch = "aarch64")]
ioctl_read!(kvm_arm_preferred_target, KVMIO, 0xaf, kvm_vcpu_init);

// Device requests.
ioctl_write_ptr!(kvm_set_device_attr, KVMIO, 0xe1, kvm_device_attr);
ioctl_write_ptr!(kvm_get_device_attr, KVMIO, 0xe2, kvm_device_attr);
ioctl_write_ptr!(kvm_has_device_attr, KVMIO, 0xe3, kvm_device_attr);

// vCPU requests.
ioctl_read!(kvm_get_mp_state, KVMIO, 0x98, kvm_mp_state);
ioctl_write_ptr!(kvm_set_mp_state, KVMIO, 0x99, kvm_mp_state);

#[cfg(target_arch = "x86_64")]
ioctl_read!(kvm_get_regs, KVMIO, 0x81, kvm_regs);
#[cfg(target_arch = "x86_64")]
ioctl_write_ptr!(kvm_set_regs, KVMIO, 0x82, kvm_regs);
#[cfg(target_arch = "x86_64")]
ioctl_read!(kvm_get_sregs, KVMIO, 0x83, kvm_sregs);
#[cfg(target_arch = "x86_64")]
ioctl_write_ptr!(kvm_set_sregs, KVMIO, 0x84, kvm_sregs);
#[cfg(target_arch = "x86_64")]
ioctl_readwrite!(kvm_get_msrs, KVMIO, 0x88, kvm_msrs);
#[cfg(target_arch = "x86_64")]
ioctl_write_ptr!(kvm_set_msrs, KVMIO, 0x89, kvm_msrs);
#[cfg(target_arch = "x86_64")]
ioctl_read!(kvm_get_fpu, KVMIO, 0x8c, kvm_fpu);
#[cfg(target_arch = "x86_64")]
ioctl_write_ptr!(kvm_set_fpu, KVMIO, 0x8d, kvm_fpu);
#[cfg(target_arch = "x86_64")]
ioctl_read!(kvm_get_lapic, KVMIO, 0x8e, kvm_lapic_state);
#[cfg(target_arch = "x86_64")]
ioctl_write_ptr!(kvm_set_lapic, KVMIO, 0x8f, kvm_lapic_state);
#[cfg(target_arch = "x86_64")]
ioctl_write_ptr!(kvm_set_cpuid2, KVMIO, 0x90, kvm_cpuid2);
#[cfg(target_arch = "x86_64")]
ioctl_readwrite!(kvm_get_cpuid2, KVMIO, 0x91, kvm_cpuid2);
#[cfg(target_arch = "x86_64")]
ioctl_read!(kvm_get_vcpu_events, KVMIO, 0x9f, kvm_vcpu_events);
#[cfg(target_arch = "x86_64")]
ioctl_write_ptr!(kvm_set_vcpu_events, KVMIO, 0xa0, kvm_vcpu_events);
#[cfg(target_arch = "x86_64")]
ioctl_read!(kvm_get_debugregs, KVMIO, 0xa1, kvm_debugregs);
#[cfg(target_arch = "x86_64")]
ioctl_write_ptr!(kvm_set_debugregs, KVMIO, 0xa2, kvm_debugregs);
#[cfg(target_arch = "x86_64")]
ioctl_read!(kvm_get_xcrs, KVMIO, 0xa6, kvm_xcrs);
#[cfg(target_arch = "x86_64")]
ioctl_write_ptr!(kvm_set_xcrs, KVMIO, 0xa7, kvm_xcrs);

#[cfg(target_arch = "aarch64")]
ioctl_write_ptr!(kvm_get_one_reg, KVMIO, 0xab, kvm_one_reg);
#[cfg(target_arch = "aarch64")]
ioctl_write_ptr!(kvm_set_one_reg, KVMIO, 0xac, kvm_one_reg);
#[cfg(target_arch = "aarch64")]
ioctl_write_ptr!(kvm_arm_vcpu_init, KVMIO, 0xae, kvm_vcpu_init);
#[cfg(target_arch = "aarch64")]
ioctl_readwrite!(kvm_get_reg_list, KVMIO, 0xb0, kvm_reg_list);

#[cfg(test)]
mod tests {
    use super::*;
    use nix::{request_code_read, request_code_readwrite, request_code_write};
    use std::mem::size_of;

    #[test]
    fn test_immediate_request_codes() {
        assert_eq!(KVM_GET_API_VERSION, 0xae00);
        assert_eq!(KVM_CREATE_VM, 0xae01);
        assert_eq!(KVM_CHECK_EXTENSION, 0xae03);
        assert_eq!(KVM_GET_VCPU_MMAP_SIZE, 0xae04);
        assert_eq!(KVM_CREATE_VCPU, 0xae41);
        assert_eq!(KVM_RUN, 0xae80);
    }

    #[test]
    fn test_struct_request_codes() {
        // _IOW(KVMIO, 0x46, struct kvm_userspace_memory_region), 32 bytes
        assert_eq!(
            request_code_write!(KVMIO, 0x46, size_of::<kvm_userspace_memory_region>()),
            0x4020_ae46
        );
        // _IOWR(KVMIO, 0xe0, struct kvm_create_device), 12 bytes
        assert_eq!(
            request_code_readwrite!(KVMIO, 0xe0, size_of::<kvm_create_device>()),
            0xc00c_aee0
        );
        // _IOR(KVMIO, 0x98, struct kvm_mp_state), 4 bytes
        assert_eq!(request_code_read!(KVMIO, 0x98, size_of::<kvm_mp_state>()), 0x8004_ae98);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_x86_request_codes() {
        assert_eq!(KVM_SET_TSS_ADDR, 0xae47);
        assert_eq!(KVM_CREATE_IRQCHIP, 0xae60);
        // _IOR(KVMIO, 0x81, struct kvm_regs), 144 bytes
        assert_eq!(request_code_read!(KVMIO, 0x81, size_of::<kvm_regs>()), 0x8090_ae81);
        // _IOWR(KVMIO, 0x05, struct kvm_cpuid2), header only
        assert_eq!(
            request_code_readwrite!(KVMIO, 0x05, size_of::<kvm_cpuid2>()),
            0xc008_ae05
        );
        // _IOW(KVMIO, 0x89, struct kvm_msrs), header only
        assert_eq!(request_code_write!(KVMIO, 0x89, size_of::<kvm_msrs>()), 0x4008_ae89);
    }
}
