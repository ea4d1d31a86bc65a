//! The closed VMX opcode table (spec §9 "Dynamic dispatch").

use crate::collab::NvmxHost;
use crate::dispatcher::{self, VmExitContext};
use crate::error::Outcome;
use crate::state::NestedVcpuState;

/// The nine VMX instructions this core emulates. Small and closed, so a
/// tagged variant with an exhaustive match is the whole dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxOpcode {
    On,
    Off,
    PtrLd,
    PtrSt,
    Clear,
    Read,
    Write,
    Launch,
    Resume,
}

/// Routes `op` to its handler in `nvmx::dispatcher`.
pub fn dispatch<H: NvmxHost + ?Sized>(
    op: VmxOpcode,
    state: &mut NestedVcpuState,
    host: &mut H,
    ctx: &VmExitContext,
) -> Outcome {
    match op {
        VmxOpcode::On => dispatcher::vmxon(state, host, ctx),
        VmxOpcode::Off => dispatcher::vmxoff(state, host, ctx),
        VmxOpcode::PtrLd => dispatcher::vmptrld(state, host, ctx),
        VmxOpcode::PtrSt => dispatcher::vmptrst(state, host, ctx),
        VmxOpcode::Clear => dispatcher::vmclear(state, host, ctx),
        VmxOpcode::Read => dispatcher::vmread(state, host, ctx),
        VmxOpcode::Write => dispatcher::vmwrite(state, host, ctx),
        VmxOpcode::Launch => dispatcher::vmlaunch(state, host, ctx),
        VmxOpcode::Resume => dispatcher::vmresume(state, host, ctx),
    }
}
