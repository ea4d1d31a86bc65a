//! External collaborator surfaces (spec §1, §9 "Cyclic/back-reference
//! state"). `nvmx` touches hardware and guest memory exclusively through
//! these traits; `hypervisor::nested_vmx` implements all of them against
//! the real `Vm`/`Vmx`.

use alloc::boxed::Box;

use crate::config::PAGE_SIZE;
use crate::error::Fault;

/// Read/write access to the guest's general-purpose registers and
/// RFLAGS for the vCPU currently being emulated.
pub trait GuestRegisters {
    fn gpr(&self, index: u8) -> u64;
    fn set_gpr(&mut self, index: u8, value: u64);
    fn rflags(&self) -> u64;
    fn set_rflags(&mut self, value: u64);
}

/// A borrowed, read-only view of one guest-physical page.
pub trait GuestFrameRo {
    fn bytes(&self) -> &[u8; PAGE_SIZE];
}

/// A borrowed, read/write view of one guest-physical page.
pub trait GuestFrameRw: GuestFrameRo {
    fn bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE];
}

/// Guest-physical and guest-virtual memory access.
pub trait GuestMemory {
    /// Maps `gpa` read-only. Used for the VVMCS-referenced I/O bitmaps.
    fn map_guest_frame_ro(&mut self, gpa: u64) -> Result<Box<dyn GuestFrameRo>, Fault>;

    /// Maps `gpa` read/write. Used for the currently-pointed VVMCS.
    fn map_guest_frame_rw(&mut self, gpa: u64) -> Result<Box<dyn GuestFrameRw>, Fault>;

    /// Reads `len` bytes (1, 2, 4, or 8) from guest-virtual `gva`,
    /// zero-extended into the returned value.
    fn copy_from_guest_virt(&mut self, gva: u64, len: u32) -> Result<u64, Fault>;

    /// Writes the low `len` bytes of `value` to guest-virtual `gva`.
    fn copy_to_guest_virt(&mut self, gva: u64, value: u64, len: u32) -> Result<(), Fault>;
}

/// Injects an architectural exception into the guest currently running.
pub trait ExceptionInjector {
    fn inject_exception(&mut self, vector: u8, error_code: u32);
}

/// The real, currently-loaded hardware VMCS (spec §5's "per-logical-CPU
/// resource").
pub trait HardwareVmcs {
    fn read_vmcs_field(&self, field: u32) -> u64;
    fn write_vmcs_field(&mut self, field: u32, value: u64);
    fn vmclear(&mut self, pa: u64);
    fn vmptrld(&mut self, pa: u64);

    /// Physical address of the VMCS presently loaded on this logical CPU.
    fn current_vmcs_pa(&self) -> u64;

    /// The bracketed VMXON snapshot dance (spec §4.5, §5): VMCLEAR the
    /// live VMCS, copy its raw contents into `shadow_pa`, VMPTRLD the
    /// live VMCS back. A single call so the suspension point cannot be
    /// torn by a caller forgetting the final VMPTRLD.
    fn snapshot_live_vmcs_into(&mut self, shadow_pa: u64);

    /// Software-tracked LAUNCH/RESUME state for the currently-loaded
    /// hardware VMCS (the teacher's `Vmx::launched` field, not a real
    /// VMREAD-able field).
    fn set_launched(&mut self, launched: bool);
}

/// Supplies the four precomputed shadow I/O bitmap pages used by
/// [`crate::control::update_exec_control`] (spec §4.5, SPEC_FULL §9).
pub trait ShadowIoBitmaps {
    /// Physical addresses of the `(A, B)` bitmap pages to program when
    /// L1 intercepts its own subset of I/O ports.
    fn select(&self, port80_intercepted: bool, port_ed_intercepted: bool) -> (u64, u64);

    /// Physical addresses of the `(A, B)` bitmap pages that intercept
    /// nothing L1 cares about, used when L1 intercepts no I/O at all.
    fn default_bitmap(&self) -> (u64, u64);
}

/// Convenience bound combining every collaborator a dispatcher handler
/// needs, mirroring the teacher's preference for one handle parameter
/// per call instead of four or five loose ones.
pub trait NvmxHost: GuestRegisters + GuestMemory + ExceptionInjector + HardwareVmcs {}

impl<T> NvmxHost for T where T: GuestRegisters + GuestMemory + ExceptionInjector + HardwareVmcs {}
