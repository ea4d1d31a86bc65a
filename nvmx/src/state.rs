//! vCPU nested-operation state (spec §3).

use alloc::boxed::Box;

use crate::collab::{GuestFrameRo, GuestFrameRw};
use crate::config::{NvmxConfig, INVALID_GPA};
use crate::error::AllocError;

/// Which I/O bitmap page a mapping slot refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoBitmapSlot {
    A,
    B,
}

/// Per-vCPU nested-VMX state. Exactly one writer (the vCPU thread
/// currently scheduled); see spec §5.
pub struct NestedVcpuState {
    /// Guest-physical address of the VMXON region, or 0 meaning "VMXON
    /// not executed".
    pub vmxon_region_pa: u64,

    /// Physical address of the host-owned, page-aligned shadow-VMCS
    /// buffer used as the backing store for the hardware VMCS while L2
    /// runs. Owned and allocated by the host; `nvmx` only ever VMCLEARs
    /// and snapshots into it.
    pub shadow_vmcs_pa: u64,

    /// Weak reference to the L0/L1-boundary VMCS used when L1 runs
    /// directly. Opaque to this core; never dereferenced.
    pub host_vmcs: Option<u64>,

    /// GPA of the VVMCS currently pointed to by L1, or `INVALID_GPA`.
    pub current_vvmcs_gpa: u64,

    /// Read/write mapping of `current_vvmcs_gpa`, present iff that GPA
    /// is valid.
    pub current_vvmcs_map: Option<Box<dyn GuestFrameRw>>,

    /// Read-only mappings of the guest pages named by `IO_BITMAP_A`/`_B`
    /// inside `current_vvmcs_map`.
    pub io_bitmap: [Option<Box<dyn GuestFrameRo>>; 2],

    /// Set by a successful VMLAUNCH/VMRESUME; tells the outer scheduler
    /// the next resume must perform a nested entry into L2.
    pub vm_entry_pending: bool,

    /// Process-wide tunables threaded through at construction (spec §9
    /// "Global mutable state").
    pub config: NvmxConfig,
}

impl NestedVcpuState {
    /// Constructs a fresh, `OFF`-state vCPU. `shadow_vmcs_pa` must name
    /// a page-aligned buffer the host has already allocated and owns
    /// for the lifetime of this vCPU.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if `shadow_vmcs_pa` is not page-aligned —
    /// the one allocation precondition this constructor can itself
    /// check without a collaborator call.
    pub fn new(shadow_vmcs_pa: u64, config: NvmxConfig) -> Result<Self, AllocError> {
        if shadow_vmcs_pa & 0xFFF != 0 {
            return Err(AllocError);
        }
        Ok(Self {
            vmxon_region_pa: 0,
            shadow_vmcs_pa,
            host_vmcs: None,
            current_vvmcs_gpa: INVALID_GPA,
            current_vvmcs_map: None,
            io_bitmap: [None, None],
            vm_entry_pending: false,
            config,
        })
    }

    /// `true` once VMXON has been executed and not yet followed by
    /// VMXOFF.
    #[must_use]
    pub const fn is_on(&self) -> bool {
        self.vmxon_region_pa != 0
    }

    #[must_use]
    pub const fn has_current_vvmcs(&self) -> bool {
        self.current_vvmcs_gpa != INVALID_GPA
    }

    /// The real hardware VMCS backing L1 while L0 hasn't taken it over to
    /// run L2, or `None` before VMXON / after VMXOFF. Opaque; callers must
    /// not dereference the address, only use it as a `vmptrld` target.
    #[must_use]
    pub const fn host_vmcs(&self) -> Option<u64> {
        self.host_vmcs
    }
}
