//! Process-wide constants the nested-VMX core needs but never computes
//! itself (it has no MSR access of its own).

/// Size in bytes of a VVMCS page, an I/O bitmap page, and the shadow VMCS
/// backing store. All guest-memory frames this crate touches are this size.
pub const PAGE_SIZE: usize = 0x1000;

/// Sentinel meaning "no VVMCS is currently pointed to by L1".
pub const INVALID_GPA: u64 = u64::MAX;

/// Slot 0 of a VVMCS page never holds a real field after the VPID remap
/// (see [`crate::encoding`]), so it is reused as the LAUNCH_STATE slot: a
/// piece of bookkeeping data this core needs that has no real VMCS field
/// encoding of its own.
pub const LAUNCH_STATE_SLOT: usize = 0;

/// Runtime configuration supplied by the host at [`crate::state::NestedVcpuState::new`].
#[derive(Debug, Clone, Copy)]
pub struct NvmxConfig {
    /// The VMCS revision identifier the host CPU reports in `IA32_VMX_BASIC`.
    /// `nvmx` never reads this MSR itself; the host samples it once at boot
    /// and threads it through, mirroring how `hardware_vt::vmx::Vmx` reads
    /// it once and reuses it for every VMCS it initializes.
    pub vmcs_revision_id: u32,
}
