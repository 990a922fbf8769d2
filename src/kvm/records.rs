//! Concrete FAM record shapes used by the KVM API.
//!
//! | Record        | Header              | Count field     | Entry                    |
//! |---------------|---------------------|-----------------|--------------------------|
//! | [`IrqRouting`]| `kvm_irq_routing`   | `nr: u32`       | `kvm_irq_routing_entry`  |
//! | [`CpuId`]     | `kvm_cpuid2`        | `nent: u32`     | `kvm_cpuid_entry2`       |
//! | [`Msrs`]      | `kvm_msrs`          | `nmsrs: u32`    | `kvm_msr_entry`          |
//! | [`MsrList`]   | `kvm_msr_list`      | `nmsrs: u32`    | `u32` (MSR index)        |
//! | [`RegList`]   | `kvm_reg_list`      | `n: u64`        | `u64` (register id)      |
//!
//! Entry offsets and strides come straight from the `kvm-bindings` structs
//! and are pinned by compile-time assertions against the kernel ABI.

use crate::fam::{FamLayout, FamRecord};
use kvm_bindings::*;
use std::mem::offset_of;

/// Largest number of CPUID leaves requested from the kernel by default.
pub const MAX_CPUID_ENTRIES: usize = 80;

/// Largest number of MSRs handled in one request by default.
pub const MAX_MSR_ENTRIES: usize = 256;

/// Largest routing table accepted by `KVM_SET_GSI_ROUTING`.
pub const MAX_IRQ_ROUTES: usize = 4096;

/// Default room for a register list query.
pub const DEFAULT_REG_LIST_CAPACITY: usize = 512;

/// Declare a [`FamLayout`] for a `kvm-bindings` struct.
macro_rules! fam_layout {
    (
        $(#[$attr:meta])*
        $name:ident: $header:ty, $count:ident: $count_ty:ty, $entries:ident: $entry:ty
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy)]
        pub enum $name {}

        // SAFETY: the header is a bindgen `#[repr(C)]` struct of integers,
        // and the offset, stride and count width are taken from it directly.
        unsafe impl FamLayout for $name {
            type Header = $header;
            type Entry = $entry;

            const ENTRY_OFFSET: usize = offset_of!($header, $entries);
            const ENTRY_STRIDE: usize = std::mem::size_of::<$entry>();
            const MAX_COUNT: usize = <$count_ty>::MAX as usize;

            fn count(header: &$header) -> usize {
                header.$count as usize
            }

            fn set_count(header: &mut $header, count: usize) {
                header.$count = count as $count_ty;
            }
        }
    };
}

fam_layout!(
    /// Shape of `kvm_irq_routing`.
    IrqRoutingLayout: kvm_irq_routing, nr: u32, entries: kvm_irq_routing_entry
);

/// GSI routing table for `KVM_SET_GSI_ROUTING`.
pub type IrqRouting = FamRecord<IrqRoutingLayout>;

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::*;

    fam_layout!(
        /// Shape of `kvm_cpuid2`.
        CpuIdLayout: kvm_cpuid2, nent: u32, entries: kvm_cpuid_entry2
    );

    fam_layout!(
        /// Shape of `kvm_msrs`.
        MsrsLayout: kvm_msrs, nmsrs: u32, entries: kvm_msr_entry
    );

    fam_layout!(
        /// Shape of `kvm_msr_list`.
        MsrListLayout: kvm_msr_list, nmsrs: u32, indices: u32
    );

    /// CPUID leaves, as reported by the kernel or installed on a vCPU.
    pub type CpuId = FamRecord<CpuIdLayout>;

    /// MSR index/value pairs for `KVM_GET_MSRS`/`KVM_SET_MSRS`.
    pub type Msrs = FamRecord<MsrsLayout>;

    /// Bare MSR indices, as reported by `KVM_GET_MSR_INDEX_LIST`.
    pub type MsrList = FamRecord<MsrListLayout>;

    // Kernel ABI, x86_64.
    const _: () = {
        assert!(std::mem::size_of::<kvm_cpuid2>() == 8);
        assert!(offset_of!(kvm_cpuid2, entries) == 8);
        assert!(std::mem::size_of::<kvm_cpuid_entry2>() == 40);
        assert!(std::mem::size_of::<kvm_msrs>() == 8);
        assert!(offset_of!(kvm_msrs, entries) == 8);
        assert!(std::mem::size_of::<kvm_msr_entry>() == 16);
        assert!(std::mem::size_of::<kvm_msr_list>() == 4);
        assert!(offset_of!(kvm_msr_list, indices) == 4);
    };
}

#[cfg(target_arch = "x86_64")]
pub use x86::*;

#[cfg(target_arch = "aarch64")]
mod arm {
    use super::*;

    fam_layout!(
        /// Shape of `kvm_reg_list`.
        RegListLayout: kvm_reg_list, n: u64, reg: u64
    );

    /// Register ids reported by `KVM_GET_REG_LIST`.
    pub type RegList = FamRecord<RegListLayout>;

    const _: () = {
        assert!(std::mem::size_of::<kvm_reg_list>() == 8);
        assert!(offset_of!(kvm_reg_list, reg) == 8);
    };
}

#[cfg(target_arch = "aarch64")]
pub use arm::*;

const _: () = {
    assert!(std::mem::size_of::<kvm_irq_routing>() == 8);
    assert!(offset_of!(kvm_irq_routing, entries) == 8);
    assert!(std::mem::size_of::<kvm_irq_routing_entry>() == 48);
};

/// Build an MSI routing entry for `gsi`.
pub fn msi_route(gsi: u32, address: u64, data: u32) -> kvm_irq_routing_entry {
    let mut entry = kvm_irq_routing_entry {
        gsi,
        type_: KVM_IRQ_ROUTING_MSI,
        ..Default::default()
    };
    entry.u.msi = kvm_irq_routing_msi {
        address_lo: address as u32,
        address_hi: (address >> 32) as u32,
        data,
        ..Default::default()
    };
    entry
}

/// Build a routing entry that sends `gsi` to `pin` of in-kernel chip `irqchip`.
pub fn irqchip_route(gsi: u32, irqchip: u32, pin: u32) -> kvm_irq_routing_entry {
    let mut entry = kvm_irq_routing_entry {
        gsi,
        type_: KVM_IRQ_ROUTING_IRQCHIP,
        ..Default::default()
    };
    entry.u.irqchip = kvm_irq_routing_irqchip { irqchip, pin };
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fam::FamError;

    fn raw_bytes<L: FamLayout>(record: &FamRecord<L>) -> &[u8] {
        // SAFETY: the record owns `byte_len()` initialized bytes.
        unsafe { std::slice::from_raw_parts(record.as_fam_struct_ptr().cast(), record.byte_len()) }
    }

    #[test]
    fn test_irq_routing_layout() {
        assert_eq!(IrqRoutingLayout::ENTRY_OFFSET, 8);
        assert_eq!(IrqRoutingLayout::ENTRY_STRIDE, 48);

        let mut routing = IrqRouting::new(3).unwrap();
        assert_eq!(routing.byte_len(), 8 + 3 * 48);

        routing.push(irqchip_route(4, 2, 4)).unwrap();
        routing.push(msi_route(24, 0xfee0_0000_1234_5000, 0x41)).unwrap();
        assert_eq!(routing.as_fam_struct_ref().nr, 2);
        assert_eq!(routing[0].gsi, 4);
        assert_eq!(routing[1].type_, KVM_IRQ_ROUTING_MSI);

        // SAFETY: entry 1 was built as an MSI route.
        let msi = unsafe { routing[1].u.msi };
        assert_eq!(msi.address_lo, 0x1234_5000);
        assert_eq!(msi.address_hi, 0xfee0_0000);
        assert_eq!(msi.data, 0x41);
    }

    #[test]
    fn test_irq_routing_capacity() {
        let entries = vec![irqchip_route(0, 0, 0); 5];
        let result = IrqRouting::from_entries(4, &entries);
        assert!(matches!(
            result,
            Err(FamError::CapacityExceeded { requested: 5, capacity: 4 })
        ));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_msrs_raw_layout() {
        let entries = [
            kvm_msr_entry { index: 0x174, data: 0x10, ..Default::default() },
            kvm_msr_entry { index: 0xc000_0080, data: 0x500, ..Default::default() },
        ];
        let msrs = Msrs::from_entries(MAX_MSR_ENTRIES, &entries).unwrap();
        assert_eq!(msrs.byte_len(), 8 + MAX_MSR_ENTRIES * 16);

        let bytes = raw_bytes(&msrs);
        assert_eq!(&bytes[0..4], &2u32.to_ne_bytes());
        // index at +0, data at +8 within each 16-byte entry.
        assert_eq!(&bytes[8..12], &0x174u32.to_ne_bytes());
        assert_eq!(&bytes[16..24], &0x10u64.to_ne_bytes());
        assert_eq!(&bytes[24..28], &0xc000_0080u32.to_ne_bytes());
        assert_eq!(&bytes[32..40], &0x500u64.to_ne_bytes());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_msr_list_layout() {
        let list = MsrList::from_entries(4, &[0x10, 0x1b, 0x174]).unwrap();
        assert_eq!(MsrListLayout::ENTRY_OFFSET, 4);
        assert_eq!(list.byte_len(), 4 + 4 * 4);

        let bytes = raw_bytes(&list);
        assert_eq!(&bytes[0..4], &3u32.to_ne_bytes());
        assert_eq!(&bytes[8..12], &0x1bu32.to_ne_bytes());
        assert_eq!(&bytes[16..20], &[0u8; 4]);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_cpuid_equality_and_filtering() {
        let leaf = |function| kvm_cpuid_entry2 { function, ..Default::default() };
        let leaves = [leaf(0), leaf(1), leaf(7)];
        let mut cpuid = CpuId::from_entries(MAX_CPUID_ENTRIES, &leaves).unwrap();
        let other = CpuId::from_entries(3, &leaves).unwrap();
        assert_eq!(cpuid, other);

        cpuid.retain(|entry| entry.function != 1);
        assert_eq!(cpuid.len(), 2);
        assert_eq!(cpuid.as_fam_struct_ref().nent, 2);
        assert_ne!(cpuid, other);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn test_reg_list_layout() {
        let list = RegList::from_entries(2, &[0x6030_0000_0010_0000]).unwrap();
        assert_eq!(RegListLayout::ENTRY_OFFSET, 8);
        assert_eq!(list.as_fam_struct_ref().n, 1);
        assert_eq!(list.byte_len(), 8 + 2 * 8);
    }
}
