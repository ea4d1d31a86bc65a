//! Error taxonomy for the nested-VMX core.
//!
//! Every fallible collaborator call funnels into [`Fault`]; every
//! dispatcher method funnels its result into [`Outcome`]. There is no
//! third, "fatal to the host" channel: a malformed guest cannot crash L0.

/// Result of any `nvmx::dispatcher` handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// VMsucceed: EFLAGS cleared, RIP advances.
    Success,
    /// VMfailValid: ZF set, RIP advances.
    VmFailValid,
    /// VMfailInvalid: CF set, RIP advances.
    VmFailInvalid,
    /// An architectural fault was already injected; RIP must not advance.
    Exception,
}

/// An architectural fault the decoder or privilege gate wants injected.
///
/// Also doubles as the error type for guest-memory collaborator calls
/// (`EmulationError` in the spec's taxonomy): a failed guest-virtual copy
/// is surfaced the same way a `#UD`/`#GP` is, per §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    /// Interrupt/exception vector to inject.
    pub vector: u8,
    /// Error code pushed alongside the vector (0 for #UD).
    pub error_code: u32,
}

impl Fault {
    /// `#UD`.
    #[must_use]
    pub const fn ud() -> Self {
        Self { vector: 6, error_code: 0 }
    }

    /// `#GP(0)`.
    #[must_use]
    pub const fn gp0() -> Self {
        Self { vector: 13, error_code: 0 }
    }
}

/// vCPU-init-time allocation failure (see §7, "Allocation failures").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

/// Returned by the explicit VMCALL-passthrough stubs (`guest_cr3`,
/// `host_cr3`, `asid`) per Design Note 3: never invent semantics for
/// these, just say so.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotImplemented;
