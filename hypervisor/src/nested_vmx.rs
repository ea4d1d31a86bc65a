//! Wires `nvmx`, the hardware-independent nested-VMX core, to this
//! hypervisor's concrete [`Vm`]/[`Vmx`] types.
//!
//! `Vm` implements every `nvmx::collab` trait directly (rather than handing
//! out separate `&mut dyn Trait` borrows) so a single `&mut Vm` can be
//! passed to `nvmx::opcode::dispatch` as one `H: NvmxHost` type parameter.
//! This sidesteps Rust's restriction on holding two live trait-object views
//! of the same value, the same reason `nvmx`'s own dispatcher functions take
//! generic bounds instead of trait objects.

use crate::{
    hardware_vt::{vmx::ShadowVmcs, VmxGuestCpuSnapshot, VmxInstructionQualification},
    vm::Vm,
    Page,
};
use alloc::boxed::Box;
use log::trace;
use nvmx::{
    collab::{ExceptionInjector, GuestFrameRo, GuestFrameRw, GuestMemory, GuestRegisters, HardwareVmcs},
    config::{NvmxConfig, PAGE_SIZE},
    decoder::{ExitQualification, InstructionInfo, SegmentDescriptor, SegmentSnapshot},
    dispatcher::VmExitContext,
    error::Fault,
    opcode,
    privilege::GuestCpuSnapshot,
    state::NestedVcpuState,
};

/// The per-vCPU nested-VMX bookkeeping `hypervisor` owns on `nvmx`'s behalf:
/// its opaque state plus the private hardware VMCS region used to stash L1's
/// VMCS while L0 runs L2 directly.
pub(crate) struct NestedVmxPerCpu {
    pub(crate) state: NestedVcpuState,
    #[allow(dead_code)] // kept alive for `state.shadow_vmcs_pa`'s lifetime
    shadow_vmcs: Box<ShadowVmcs>,
}

impl NestedVmxPerCpu {
    /// `vmcs_revision_id` must come from `IA32_VMX_BASIC`, which only exists
    /// on Intel; on AMD, pass an arbitrary value, since nested-VMX state is
    /// never touched when the hardware backend is [`crate::hardware_vt::svm::Svm`]
    /// (it never produces a `VmExitReason::VmxInstruction`).
    pub(crate) fn new(vmcs_revision_id: u32) -> Self {
        let shadow_vmcs = ShadowVmcs::new();
        let config = NvmxConfig { vmcs_revision_id };
        let state = NestedVcpuState::new(shadow_vmcs.pa(), config)
            .expect("shadow VMCS is always page aligned");
        Self { state, shadow_vmcs }
    }
}

/// Builds the `nvmx::dispatcher` exit context from what the hardware layer
/// captured, filling in `vmxon_active` from `nvmx`'s own state (the one
/// piece of the Privilege Gate's input that isn't a hardware VMCS field).
pub(crate) fn build_exit_context(
    state: &NestedVcpuState,
    q: &VmxInstructionQualification,
) -> VmExitContext {
    let VmxGuestCpuSnapshot { cr0_pe, cr4_vmxe, eflags_vm, long_mode_enabled, cs_l, cpl, .. } = q.cpu;
    let cpu = GuestCpuSnapshot {
        cr0_pe,
        cr4_vmxe,
        eflags_vm,
        long_mode_enabled,
        cs_l,
        cpl,
        vmxon_active: state.is_on(),
    };
    let mut segs = SegmentSnapshot::default();
    for (i, (base, limit)) in q.segments.iter().enumerate() {
        segs.0[i] = SegmentDescriptor { base: *base, limit: *limit };
    }
    VmExitContext {
        cpu,
        segs,
        info: InstructionInfo(q.instruction_info),
        qualification: ExitQualification(q.exit_qualification),
    }
}

/// Dispatches a VMX-instruction VM exit to `nvmx` and applies its decision.
///
/// Entering L2 on a successful VMLAUNCH/VMRESUME (composing the hardware
/// VMCS from the synthesized controls and L1's guest-state fields) is not
/// performed here: full VM-entry/VM-exit state transfer between L0/L1/L2 is
/// explicitly out of scope for this core, which only emulates the nine VMX
/// instructions and maintains L1's virtual VMCSes. L1 always resumes and
/// observes the outcome through the VM-instruction status convention.
pub(crate) fn handle_vmx_instruction(vm: &mut Vm, q: &VmxInstructionQualification) {
    let ctx = build_exit_context(&vm.nested_vmx.state, q);
    let mut state = core::mem::replace(&mut vm.nested_vmx.state, placeholder_state());
    let _outcome = opcode::dispatch(q.opcode, &mut state, vm, &ctx);
    trace!("L0/L1-boundary VMCS after dispatch: {:x?}", state.host_vmcs());
    vm.nested_vmx.state = state;
}

/// A throwaway state used only to satisfy the borrow checker while the real
/// state is temporarily moved out for the duration of one dispatch call
/// (`nvmx::opcode::dispatch` needs `&mut NestedVcpuState` and `&mut Vm`
/// simultaneously, and `Vm` owns both).
fn placeholder_state() -> NestedVcpuState {
    NestedVcpuState::new(0x1000, NvmxConfig { vmcs_revision_id: 0 }).unwrap()
}

/// A guest physical page reached through the nested paging structures,
/// handed out to `nvmx` as an opaque frame handle.
struct GuestFrame(*mut Page);

impl GuestFrameRo for GuestFrame {
    fn bytes(&self) -> &[u8; PAGE_SIZE] {
        // Safety: `self.0` was produced by `Vm::translate_gpa`, which only
        // returns pointers into pages backed by real memory (snapshot,
        // input, or dirty pages), all of which outlive this handle.
        unsafe { &*self.0.cast::<[u8; PAGE_SIZE]>() }
    }
}

impl GuestFrameRw for GuestFrame {
    fn bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        // Safety: see `GuestFrameRo::bytes`.
        unsafe { &mut *self.0.cast::<[u8; PAGE_SIZE]>() }
    }
}

impl GuestRegisters for Vm {
    fn gpr(&self, index: u8) -> u64 {
        self.vt_ops().gpr(index)
    }

    fn set_gpr(&mut self, index: u8, value: u64) {
        self.vt_mut_ops().set_gpr(index, value);
    }

    fn rflags(&self) -> u64 {
        self.vt_ops().rflags()
    }

    fn set_rflags(&mut self, value: u64) {
        self.vt_mut_ops().set_rflags(value);
    }
}

impl GuestMemory for Vm {
    fn map_guest_frame_ro(&mut self, gpa: u64) -> Result<alloc::boxed::Box<dyn GuestFrameRo>, Fault> {
        let ptr = self.translate_gpa(gpa).ok_or_else(Fault::gp0)?.cast_mut();
        Ok(Box::new(GuestFrame(ptr)))
    }

    fn map_guest_frame_rw(&mut self, gpa: u64) -> Result<alloc::boxed::Box<dyn GuestFrameRw>, Fault> {
        let ptr = self.translate_gpa(gpa).ok_or_else(Fault::gp0)?.cast_mut();
        Ok(Box::new(GuestFrame(ptr)))
    }

    fn copy_from_guest_virt(&mut self, gva: u64, length: u32) -> Result<u64, Fault> {
        let gpa = self.translate_guest_virt(gva).ok_or_else(Fault::gp0)?;
        let ptr = self.translate_gpa(gpa).ok_or_else(Fault::gp0)?;
        let byte_offset = (gpa & 0xFFF) as usize;
        let bytes = unsafe { &*ptr.cast::<[u8; PAGE_SIZE]>() };
        let mut value = 0u64;
        for i in 0..length as usize {
            value |= u64::from(bytes[byte_offset + i]) << (8 * i);
        }
        Ok(value)
    }

    fn copy_to_guest_virt(&mut self, gva: u64, value: u64, length: u32) -> Result<(), Fault> {
        let gpa = self.translate_guest_virt(gva).ok_or_else(Fault::gp0)?;
        let ptr = self.translate_gpa(gpa).ok_or_else(Fault::gp0)?.cast_mut();
        let byte_offset = (gpa & 0xFFF) as usize;
        let bytes = unsafe { &mut *ptr.cast::<[u8; PAGE_SIZE]>() };
        for i in 0..length as usize {
            bytes[byte_offset + i] = (value >> (8 * i)) as u8;
        }
        Ok(())
    }
}

impl ExceptionInjector for Vm {
    fn inject_exception(&mut self, vector: u8, error_code: u32) {
        self.vt_mut_ops().inject_exception(vector, error_code);
    }
}

impl HardwareVmcs for Vm {
    fn read_vmcs_field(&self, field: u32) -> u64 {
        self.vt_ops().read_vmcs_field(field)
    }

    fn write_vmcs_field(&mut self, field: u32, value: u64) {
        self.vt_mut_ops().write_vmcs_field(field, value);
    }

    fn vmclear(&mut self, pa: u64) {
        self.vt_mut_ops().vmclear(pa);
    }

    fn vmptrld(&mut self, pa: u64) {
        self.vt_mut_ops().vmptrld(pa);
    }

    fn current_vmcs_pa(&self) -> u64 {
        self.vt_ops().current_vmcs_pa()
    }

    fn snapshot_live_vmcs_into(&mut self, shadow_pa: u64) {
        self.vt_mut_ops().snapshot_live_vmcs_into(shadow_pa);
    }

    fn set_launched(&mut self, launched: bool) {
        self.vt_mut_ops().set_launched(launched);
    }
}

// `nvmx::control::update_exec_control` (the composite-control synthesis
// named in module 5 of the design) is exercised by `nvmx`'s own test suite
// against a fake `ShadowIoBitmaps`. Wiring a real `ShadowIoBitmaps` here
// would only matter once this hypervisor actually composes a hardware VMCS
// for an L2 entry, which full VM-entry/VM-exit state transfer between
// L0/L1/L2 explicitly excludes (see DESIGN.md).
