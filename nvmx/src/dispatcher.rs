//! VMX Instruction Dispatcher (spec §4.5): one handler per opcode, each
//! starting with the Privilege Gate and ending by writing a VM-instruction
//! status into guest EFLAGS.

use crate::codec;
use crate::collab::NvmxHost;
use crate::control::CpuBasedExecCtl;
use crate::decoder::{self, Decoded, ExitQualification, InstructionInfo, SegmentSnapshot};
use crate::encoding::FieldEncoding;
use crate::error::{Fault, Outcome};
use crate::fields;
use crate::lifecycle;
use crate::privilege::{self, GuestCpuSnapshot};
use crate::state::{IoBitmapSlot, NestedVcpuState};
use crate::status::{self, VmxStatus};

/// Everything a handler needs about the VM-exit that brought it here,
/// beyond the collaborator surfaces threaded through `host`.
#[derive(Debug, Clone, Copy)]
pub struct VmExitContext {
    pub cpu: GuestCpuSnapshot,
    pub segs: SegmentSnapshot,
    pub info: InstructionInfo,
    pub qualification: ExitQualification,
}

fn raise<H: NvmxHost + ?Sized>(host: &mut H, fault: Fault) -> Outcome {
    host.inject_exception(fault.vector, fault.error_code);
    Outcome::Exception
}

fn set_status<H: NvmxHost + ?Sized>(host: &mut H, s: VmxStatus) -> Outcome {
    let flags = host.rflags();
    host.set_rflags(status::apply(flags, s));
    match s {
        VmxStatus::Succeed => Outcome::Success,
        VmxStatus::FailValid => Outcome::VmFailValid,
        VmxStatus::FailInvalid => Outcome::VmFailInvalid,
    }
}

fn decode_operand<H: NvmxHost + ?Sized>(host: &H, ctx: &VmExitContext) -> Result<Decoded, Fault> {
    decoder::decode(host, &ctx.segs, ctx.info, ctx.qualification, ctx.cpu.long_mode_enabled)
}

/// Reads the 64-bit GPA stored at the decoded memory operand's
/// guest-virtual address (used by VMXON/VMPTRLD/VMCLEAR, whose operand
/// is itself a pointer to a GPA).
fn read_memory_gpa<H: NvmxHost + ?Sized>(decoded: Decoded, host: &mut H) -> Result<u64, Fault> {
    match decoded {
        Decoded::Memory { linear_addr, .. } => host.copy_from_guest_virt(linear_addr, 8),
        Decoded::Register { .. } => {
            unreachable!("VMXON/VMPTRLD/VMPTRST/VMCLEAR always decode a memory operand")
        }
    }
}

/// **VMXON.**
pub fn vmxon<H: NvmxHost + ?Sized>(state: &mut NestedVcpuState, host: &mut H, ctx: &VmExitContext) -> Outcome {
    log::trace!("VMXON");
    if let Err(f) = privilege::check(&ctx.cpu, true, host) {
        return raise(host, f);
    }
    let decoded = match decode_operand(host, ctx) {
        Ok(d) => d,
        Err(f) => return raise(host, f),
    };
    let gpa = match read_memory_gpa(decoded, host) {
        Ok(g) => g,
        Err(f) => return raise(host, f),
    };

    if state.vmxon_region_pa != 0 {
        log::warn!("VMXON re-executed while region {:#x} was already active", state.vmxon_region_pa);
    }
    state.vmxon_region_pa = gpa;

    let live_pa = host.current_vmcs_pa();
    host.vmclear(live_pa);
    host.snapshot_live_vmcs_into(state.shadow_vmcs_pa);
    host.vmptrld(live_pa);
    host.set_launched(false);

    // `live_pa` is the real hardware VMCS backing L1 while L0 hasn't taken it
    // over to run L2. Recorded opaquely; `nvmx` never dereferences it.
    state.host_vmcs = Some(live_pa);

    set_status(host, VmxStatus::Succeed)
}

/// **VMXOFF.**
pub fn vmxoff<H: NvmxHost + ?Sized>(state: &mut NestedVcpuState, host: &mut H, ctx: &VmExitContext) -> Outcome {
    log::trace!("VMXOFF");
    if let Err(f) = privilege::check(&ctx.cpu, false, host) {
        return raise(host, f);
    }
    lifecycle::purge(state, host);
    state.vmxon_region_pa = 0;
    state.host_vmcs = None;
    set_status(host, VmxStatus::Succeed)
}

/// **VMPTRLD.**
pub fn vmptrld<H: NvmxHost + ?Sized>(state: &mut NestedVcpuState, host: &mut H, ctx: &VmExitContext) -> Outcome {
    log::trace!("VMPTRLD");
    if let Err(f) = privilege::check(&ctx.cpu, false, host) {
        return raise(host, f);
    }
    let decoded = match decode_operand(host, ctx) {
        Ok(d) => d,
        Err(f) => return raise(host, f),
    };
    let gpa = match read_memory_gpa(decoded, host) {
        Ok(g) => g,
        Err(f) => return raise(host, f),
    };

    if gpa == state.vmxon_region_pa || gpa & 0xFFF != 0 {
        return set_status(host, VmxStatus::FailInvalid);
    }

    if gpa != state.current_vvmcs_gpa {
        lifecycle::purge(state, host);
    }
    if !state.has_current_vvmcs() {
        lifecycle::load_current_vvmcs(state, host, gpa);
    }

    set_status(host, VmxStatus::Succeed)
}

/// **VMPTRST.**
pub fn vmptrst<H: NvmxHost + ?Sized>(state: &mut NestedVcpuState, host: &mut H, ctx: &VmExitContext) -> Outcome {
    log::trace!("VMPTRST");
    if let Err(f) = privilege::check(&ctx.cpu, false, host) {
        return raise(host, f);
    }
    let decoded = match decode_operand(host, ctx) {
        Ok(d) => d,
        Err(f) => return raise(host, f),
    };
    let Decoded::Memory { linear_addr, length, .. } = decoded else {
        unreachable!("VMPTRST always decodes a memory operand")
    };
    if let Err(f) = host.copy_to_guest_virt(linear_addr, state.current_vvmcs_gpa, length) {
        return raise(host, f);
    }

    set_status(host, VmxStatus::Succeed)
}

/// **VMCLEAR.**
pub fn vmclear<H: NvmxHost + ?Sized>(state: &mut NestedVcpuState, host: &mut H, ctx: &VmExitContext) -> Outcome {
    log::trace!("VMCLEAR");
    if let Err(f) = privilege::check(&ctx.cpu, false, host) {
        return raise(host, f);
    }
    let decoded = match decode_operand(host, ctx) {
        Ok(d) => d,
        Err(f) => return raise(host, f),
    };
    let gpa = match read_memory_gpa(decoded, host) {
        Ok(g) => g,
        Err(f) => return raise(host, f),
    };

    if gpa & 0xFFF != 0 {
        return set_status(host, VmxStatus::FailInvalid);
    }

    if state.has_current_vvmcs() && gpa != state.current_vvmcs_gpa {
        log::debug!("VMCLEAR({gpa:#x}) targets a VVMCS other than the current one; no-op");
        return set_status(host, VmxStatus::Succeed);
    }

    if state.has_current_vvmcs() {
        let map = state.current_vvmcs_map.as_mut().unwrap();
        let page = codec::Vvmcs4k::view_mut(map.bytes_mut());
        codec::set_launch_state(page, false);
    }
    lifecycle::purge(state, host);

    set_status(host, VmxStatus::Succeed)
}

/// **VMREAD.**
pub fn vmread<H: NvmxHost + ?Sized>(state: &mut NestedVcpuState, host: &mut H, ctx: &VmExitContext) -> Outcome {
    log::trace!("VMREAD");
    if let Err(f) = privilege::check(&ctx.cpu, false, host) {
        return raise(host, f);
    }
    let Some(map) = &state.current_vvmcs_map else {
        return set_status(host, VmxStatus::FailInvalid);
    };
    let decoded = match decode_operand(host, ctx) {
        Ok(d) => d,
        Err(f) => return raise(host, f),
    };

    let reg2 = match decoded {
        Decoded::Register { reg2, .. } | Decoded::Memory { reg2, .. } => reg2,
    };
    let encoding = host.gpr(reg2) as u16;
    let page = codec::Vvmcs4k::view(map.bytes());
    let value = codec::read_vvmcs(page, FieldEncoding(encoding));

    let result = match decoded {
        Decoded::Register { reg1, .. } => {
            host.set_gpr(reg1, value);
            Ok(())
        }
        Decoded::Memory { linear_addr, length, .. } => host.copy_to_guest_virt(linear_addr, value, length),
    };
    if let Err(f) = result {
        return raise(host, f);
    }

    set_status(host, VmxStatus::Succeed)
}

/// **VMWRITE.**
pub fn vmwrite<H: NvmxHost + ?Sized>(state: &mut NestedVcpuState, host: &mut H, ctx: &VmExitContext) -> Outcome {
    log::trace!("VMWRITE");
    if let Err(f) = privilege::check(&ctx.cpu, false, host) {
        return raise(host, f);
    }
    if state.current_vvmcs_map.is_none() {
        return set_status(host, VmxStatus::FailInvalid);
    }
    let decoded = match decode_operand(host, ctx) {
        Ok(d) => d,
        Err(f) => return raise(host, f),
    };

    let reg2 = match decoded {
        Decoded::Register { reg2, .. } | Decoded::Memory { reg2, .. } => reg2,
    };
    let value = match decoded {
        Decoded::Register { reg1, .. } => Ok(host.gpr(reg1)),
        Decoded::Memory { linear_addr, length, .. } => host.copy_from_guest_virt(linear_addr, length),
    };
    let value = match value {
        Ok(v) => v,
        Err(f) => return raise(host, f),
    };

    let encoding = host.gpr(reg2) as u16;
    {
        let map = state.current_vvmcs_map.as_mut().unwrap();
        let page = codec::Vvmcs4k::view_mut(map.bytes_mut());
        codec::write_vvmcs(page, FieldEncoding(encoding), value);
    }

    match encoding {
        fields::IO_BITMAP_A | fields::IO_BITMAP_A_HIGH => lifecycle::remap_io_bitmap(state, host, IoBitmapSlot::A),
        fields::IO_BITMAP_B | fields::IO_BITMAP_B_HIGH => lifecycle::remap_io_bitmap(state, host, IoBitmapSlot::B),
        _ => {}
    }

    set_status(host, VmxStatus::Succeed)
}

fn vmlaunch_or_resume<H: NvmxHost + ?Sized>(
    state: &mut NestedVcpuState,
    host: &mut H,
    ctx: &VmExitContext,
    launch: bool,
) -> Outcome {
    log::trace!("{}", if launch { "VMLAUNCH" } else { "VMRESUME" });
    if let Err(f) = privilege::check(&ctx.cpu, false, host) {
        return raise(host, f);
    }

    let Some(map) = &state.current_vvmcs_map else {
        return set_status(host, VmxStatus::FailInvalid);
    };
    let page = codec::Vvmcs4k::view(map.bytes());
    let cpu_ctl = CpuBasedExecCtl::from_bits_truncate(
        codec::read_vvmcs(page, FieldEncoding(fields::CPU_BASED_VM_EXEC_CONTROL)) as u32,
    );
    if cpu_ctl.contains(CpuBasedExecCtl::ACTIVATE_IO_BITMAP)
        && (state.io_bitmap[0].is_none() || state.io_bitmap[1].is_none())
    {
        return set_status(host, VmxStatus::FailInvalid);
    }

    let launch_state = codec::launch_state(page);
    if launch && launch_state {
        return set_status(host, VmxStatus::FailValid);
    }
    if !launch && !launch_state {
        return set_status(host, VmxStatus::FailValid);
    }

    state.vm_entry_pending = true;
    if launch {
        let map = state.current_vvmcs_map.as_mut().unwrap();
        let page = codec::Vvmcs4k::view_mut(map.bytes_mut());
        codec::set_launch_state(page, true);
    }

    set_status(host, VmxStatus::Succeed)
}

/// **VMLAUNCH.**
pub fn vmlaunch<H: NvmxHost + ?Sized>(state: &mut NestedVcpuState, host: &mut H, ctx: &VmExitContext) -> Outcome {
    vmlaunch_or_resume(state, host, ctx, true)
}

/// **VMRESUME.**
pub fn vmresume<H: NvmxHost + ?Sized>(state: &mut NestedVcpuState, host: &mut H, ctx: &VmExitContext) -> Outcome {
    vmlaunch_or_resume(state, host, ctx, false)
}

/// The VMCALL-passthrough surface the original source stubs out
/// (`nvmx_vcpu_guestcr3`, `nvmx_vcpu_hostcr3`, `nvmx_vcpu_asid`). Per
/// Design Note 3, these are left as explicit "not yet implemented"
/// hooks rather than guessing at semantics.
#[derive(Debug, Clone, Copy)]
pub struct NestedVmxCore;

impl NestedVmxCore {
    /// # Errors
    ///
    /// Always returns [`crate::error::NotImplemented`].
    pub fn guest_cr3(_state: &NestedVcpuState) -> Result<u64, crate::error::NotImplemented> {
        Err(crate::error::NotImplemented)
    }

    /// # Errors
    ///
    /// Always returns [`crate::error::NotImplemented`].
    pub fn host_cr3(_state: &NestedVcpuState) -> Result<u64, crate::error::NotImplemented> {
        Err(crate::error::NotImplemented)
    }

    /// # Errors
    ///
    /// Always returns [`crate::error::NotImplemented`].
    pub fn asid(_state: &NestedVcpuState) -> Result<u16, crate::error::NotImplemented> {
        Err(crate::error::NotImplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{GuestMemory, GuestRegisters};
    use crate::config::NvmxConfig;
    use crate::test_support::FakeHost;

    fn baseline_cpu() -> GuestCpuSnapshot {
        GuestCpuSnapshot {
            cr0_pe: true,
            cr4_vmxe: true,
            eflags_vm: false,
            long_mode_enabled: true,
            cs_l: true,
            cpl: 0,
            vmxon_active: true,
        }
    }

    fn register_form_ctx(reg2: u8) -> VmExitContext {
        let raw = (1u32 << 10) | (u32::from(reg2) << 28); // mem_reg set, reg1=0
        VmExitContext {
            cpu: baseline_cpu(),
            segs: SegmentSnapshot::default(),
            info: InstructionInfo(raw),
            qualification: ExitQualification(0),
        }
    }

    fn new_state(host: &mut FakeHost) -> NestedVcpuState {
        host.vmcs_fields.clear();
        NestedVcpuState::new(0x1000, NvmxConfig { vmcs_revision_id: 1 }).unwrap()
    }

    #[test]
    fn vmptrld_alignment_and_vmxon_checks() {
        let mut host = FakeHost::new();
        let mut state = new_state(&mut host);
        state.vmxon_region_pa = 0x9000;
        host.current_vmcs_pa = 0x1;

        let mut ctx = register_form_ctx(1);
        host.set_gpr(1, 0x9000); // gpa == vmxon_region_pa

        let outcome = vmptrld(&mut state, &mut host, &ctx);
        assert_eq!(outcome, Outcome::VmFailInvalid);

        host.set_gpr(1, 0x1234_5001); // misaligned
        let outcome = vmptrld(&mut state, &mut host, &ctx);
        assert_eq!(outcome, Outcome::VmFailInvalid);

        host.set_gpr(1, 0x1234_5000);
        ctx.info = InstructionInfo((1u32 << 10) | (1u32 << 28));
        let outcome = vmptrld(&mut state, &mut host, &ctx);
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(state.current_vvmcs_gpa, 0x1234_5000);
    }

    #[test]
    fn vmlaunch_resume_state_machine() {
        let mut host = FakeHost::new();
        let mut state = new_state(&mut host);
        state.vmxon_region_pa = 0x9000;
        host.current_vmcs_pa = 0x1;
        host.put_guest_page(0x1234_5000, [0u8; crate::config::PAGE_SIZE]);

        let mut ctx = register_form_ctx(1);
        host.set_gpr(1, 0x1234_5000);
        ctx.info = InstructionInfo((1u32 << 10) | (1u32 << 28));
        assert_eq!(vmptrld(&mut state, &mut host, &ctx), Outcome::Success);

        assert_eq!(vmresume(&mut state, &mut host, &ctx), Outcome::VmFailValid);
        assert_eq!(vmlaunch(&mut state, &mut host, &ctx), Outcome::Success);
        assert!(state.vm_entry_pending);
        assert_eq!(vmlaunch(&mut state, &mut host, &ctx), Outcome::VmFailValid);
        assert_eq!(vmresume(&mut state, &mut host, &ctx), Outcome::Success);
    }

    #[test]
    fn vmwrite_io_bitmap_a_remaps_shadow_bitmap() {
        let mut host = FakeHost::new();
        let mut state = new_state(&mut host);
        state.vmxon_region_pa = 0x9000;
        host.current_vmcs_pa = 0x1;
        host.put_guest_page(0x1234_5000, [0u8; crate::config::PAGE_SIZE]);
        host.put_guest_page(0x7000, [0u8; crate::config::PAGE_SIZE]);

        let mut ctx = register_form_ctx(1);
        host.set_gpr(1, 0x1234_5000);
        ctx.info = InstructionInfo((1u32 << 10) | (1u32 << 28));
        assert_eq!(vmptrld(&mut state, &mut host, &ctx), Outcome::Success);
        assert!(state.io_bitmap[0].is_none());

        // VMWRITE(encoding=IO_BITMAP_A, value=0x7000): reg1 holds the
        // value, reg2 holds the field encoding.
        host.set_gpr(0, 0x7000);
        host.set_gpr(1, u64::from(fields::IO_BITMAP_A));
        ctx.info = InstructionInfo((1u32 << 10) | (1u32 << 28)); // reg1=0, reg2=1
        assert_eq!(vmwrite(&mut state, &mut host, &ctx), Outcome::Success);

        assert_eq!(state.io_bitmap[0].as_ref().unwrap().bytes(), &[0u8; crate::config::PAGE_SIZE]);
        let page = codec::Vvmcs4k::view(state.current_vvmcs_map.as_ref().unwrap().bytes());
        assert_eq!(codec::read_vvmcs(page, FieldEncoding(fields::IO_BITMAP_A)), 0x7000);
    }

    #[test]
    fn vmxon_records_host_vmcs_then_vmxoff_clears_it() {
        let mut host = FakeHost::new();
        let mut state = new_state(&mut host);
        host.current_vmcs_pa = 0x2000;

        // memory-form operand: base/index invalid, segment ES, displacement 0
        let raw = (1u32 << 22) | (1u32 << 18);
        let ctx = VmExitContext {
            cpu: baseline_cpu(),
            segs: SegmentSnapshot::default(),
            info: InstructionInfo(raw),
            qualification: ExitQualification(0),
        };
        host.copy_to_guest_virt(0, 0x9000, 8).unwrap();

        assert_eq!(state.host_vmcs(), None);
        assert_eq!(vmxon(&mut state, &mut host, &ctx), Outcome::Success);
        assert_eq!(state.vmxon_region_pa, 0x9000);
        assert_eq!(state.host_vmcs(), Some(0x2000));

        assert_eq!(vmxoff(&mut state, &mut host, &ctx), Outcome::Success);
        assert_eq!(state.host_vmcs(), None);
    }

    #[test]
    fn vmclear_resets_launch_state() {
        let mut host = FakeHost::new();
        let mut state = new_state(&mut host);
        state.vmxon_region_pa = 0x9000;
        host.current_vmcs_pa = 0x1;
        host.put_guest_page(0x1234_5000, [0u8; crate::config::PAGE_SIZE]);

        let mut ctx = register_form_ctx(1);
        host.set_gpr(1, 0x1234_5000);
        ctx.info = InstructionInfo((1u32 << 10) | (1u32 << 28));
        assert_eq!(vmptrld(&mut state, &mut host, &ctx), Outcome::Success);
        assert_eq!(vmlaunch(&mut state, &mut host, &ctx), Outcome::Success);

        // reload the same VVMCS so we can inspect LAUNCH_STATE after VMCLEAR
        assert_eq!(vmclear(&mut state, &mut host, &ctx), Outcome::Success);
        assert_eq!(vmptrld(&mut state, &mut host, &ctx), Outcome::Success);
        let page = codec::Vvmcs4k::view(state.current_vvmcs_map.as_ref().unwrap().bytes());
        assert!(!codec::launch_state(page));
    }
}
