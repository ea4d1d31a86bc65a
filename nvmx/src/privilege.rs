//! Privilege Gate (spec §4.3): the preconditions every VMX instruction
//! must satisfy before its architectural logic runs.

use crate::collab::ExceptionInjector;
use crate::error::Fault;

/// The slice of guest CPU state the gate needs to evaluate its checks.
#[derive(Debug, Clone, Copy)]
pub struct GuestCpuSnapshot {
    pub cr0_pe: bool,
    pub cr4_vmxe: bool,
    pub eflags_vm: bool,
    pub long_mode_enabled: bool,
    pub cs_l: bool,
    pub cpl: u8,
    /// `vmxon_region_pa != 0`, i.e. whether VMXON is currently active.
    pub vmxon_active: bool,
}

/// Runs the four preconditions from spec §4.3 in order, raising the
/// architected fault through `injector` on the first one that fails.
pub fn check(cpu: &GuestCpuSnapshot, privilege_for_vmxon: bool, injector: &mut dyn ExceptionInjector) -> Result<(), Fault> {
    if privilege_for_vmxon {
        if !(cpu.cr0_pe && cpu.cr4_vmxe) {
            return raise(injector, Fault::ud());
        }
    } else if !cpu.vmxon_active {
        return raise(injector, Fault::ud());
    }

    if cpu.eflags_vm || (cpu.long_mode_enabled && !cpu.cs_l) {
        return raise(injector, Fault::ud());
    }

    if cpu.cpl != 0 {
        return raise(injector, Fault::gp0());
    }

    Ok(())
}

fn raise(injector: &mut dyn ExceptionInjector, fault: Fault) -> Result<(), Fault> {
    injector.inject_exception(fault.vector, fault.error_code);
    Err(fault)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeHost;

    fn baseline() -> GuestCpuSnapshot {
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

    #[test]
    fn all_conditions_satisfied_succeeds() {
        let mut host = FakeHost::new();
        assert!(check(&baseline(), true, &mut host).is_ok());
        assert!(host.injected.is_empty());
    }

    #[test]
    fn cr0_pe_clear_is_ud() {
        let mut host = FakeHost::new();
        let mut cpu = baseline();
        cpu.cr0_pe = false;
        assert_eq!(check(&cpu, true, &mut host).unwrap_err(), Fault::ud());
        assert_eq!(host.injected, alloc::vec![(6, 0)]);
    }

    #[test]
    fn cr4_vmxe_clear_is_ud() {
        let mut host = FakeHost::new();
        let mut cpu = baseline();
        cpu.cr4_vmxe = false;
        assert_eq!(check(&cpu, true, &mut host).unwrap_err(), Fault::ud());
    }

    #[test]
    fn vmxon_not_active_is_ud_for_non_vmxon_instructions() {
        let mut host = FakeHost::new();
        let mut cpu = baseline();
        cpu.vmxon_active = false;
        assert_eq!(check(&cpu, false, &mut host).unwrap_err(), Fault::ud());
    }

    #[test]
    fn eflags_vm_set_is_ud() {
        let mut host = FakeHost::new();
        let mut cpu = baseline();
        cpu.eflags_vm = true;
        assert_eq!(check(&cpu, true, &mut host).unwrap_err(), Fault::ud());
    }

    #[test]
    fn long_mode_without_cs_l_is_ud() {
        let mut host = FakeHost::new();
        let mut cpu = baseline();
        cpu.cs_l = false;
        assert_eq!(check(&cpu, true, &mut host).unwrap_err(), Fault::ud());
    }

    #[test]
    fn cpl_nonzero_is_gp() {
        let mut host = FakeHost::new();
        let mut cpu = baseline();
        cpu.cpl = 3;
        assert_eq!(check(&cpu, true, &mut host).unwrap_err(), Fault::gp0());
        assert_eq!(host.injected, alloc::vec![(13, 0)]);
    }
}
