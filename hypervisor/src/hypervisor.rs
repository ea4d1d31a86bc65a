//! The module containing high-level execution flow of this project.
//!
//! Logic this module implements can be understood as implementation of a
//! hypervisor, the component responsible for configuring and running VMs. This
//! project creates and runs one VM per logical processor, ie, 4 VMs will run
//! concurrently if the system has 4 logical processors.
//!
//! Any code running in and from this module must not exceed 32KB (0x8000) for
//! total stack usage. Application processors run with this much of stack.
//! Overflow silently causes memory corruption. Thus, large structures should be
//! allocated on heap. This is usually not an issue with a single core system
//! because the boot strap processor (ie, the processor 0) runs with 128KB of
//! stack.

use crate::{
    config::GUEST_EXEC_TIMEOUT_IN_TSC,
    global_state::GlobalState,
    hardware_vt::{
        ExceptionQualification, GuestException, NestedPageFaultQualification, VmExitReason,
    },
    nested_vmx,
    snapshot::resolve_page_from_snapshot,
    stats::RunStats,
    vm::Vm,
    x86_instructions::rdtsc,
    Page,
};
use log::{error, info, trace, warn};
use x86::current::paging::BASE_PAGE_SHIFT;

/// Prepares a VM and enters the main virtualization loop.
///
/// This function activates hardware-assisted virtualization, configures the
/// hypervisor and VM, and runs the VM from its snapshot semi-indefinitely,
/// restarting it whenever it reaches one of the abort conditions.
pub(crate) fn start_hypervisor(global: &GlobalState) -> ! {
    info!("Starting the hypervisor");

    // Create an instance of a VM, enable hardware-assisted virtualization, and
    // set up the hypervisor.
    let mut vm = Vm::new();
    vm.vt.enable();
    let nested_pml4_addr = vm.nested_pml4_addr() as u64;
    vm.vt.initialize(nested_pml4_addr);

    loop {
        // Run the VM.
        let (stats, abort_reason) = start_vm(&mut vm, global);

        // The VM has aborted. Update overall stats, report them and the
        // reason of abort. There are two types of stats: stats about this
        // particular iteration (`stats`) and stats about all iterations run
        // so far, including ones run by other logical processors (`global`).
        let iter_count = global.update_stats(&stats);
        stats.report(global, vm.used_dirty_page_count(), iter_count);
        abort_reason.report();
    }
}

/// Runs the VM from its snapshot until it encounters one of the abort
/// conditions, and returns stats about that run and the reason for the abort.
fn start_vm(vm: &mut Vm, global: &GlobalState) -> (RunStats, AbortReason) {
    // Configure the VM based on the snapshot. Memory is paged-in from the
    // snapshot on nested page fault. `revert_dirty_memory` only reverts pages
    // that are already paged in AND modified by the guest in the previous run.
    vm.revert_dirty_memory();
    vm.vt.revert_registers(&global.snapshot());

    // Run the VM until it reaches one of abort conditions.
    let stats = &mut RunStats::new();
    loop {
        // Run the VM until VM exit happens.
        let exit_reason = vm.vt.run();

        // VM exit happened and execution of the VM is suspended. The hypervisor
        // needs to handle VM exit according to `exit_reason`.
        let host_start_tsc = rdtsc();
        let exit_handling_result = match exit_reason {
            VmExitReason::NestedPageFault(qualification) => {
                handle_nested_page_fault(vm, global, &qualification)
            }
            VmExitReason::Exception(qualification) => {
                handle_interrupt_or_exception(&qualification)
            }
            VmExitReason::ExternalInterruptOrPause => handle_external_interrupt_or_pause(stats),
            VmExitReason::TimerExpiration => handle_timer_expiration(stats),
            VmExitReason::Shutdown(exit_code) => VmExitResult::Panic(exit_code),
            VmExitReason::Unexpected(exit_code) => {
                error!("🐈 Unhandled VM exit {exit_code:#x}");
                VmExitResult::AbortVm(AbortReason::UnhandledVmExit)
            }
            VmExitReason::VmxInstruction(qualification) => {
                nested_vmx::handle_vmx_instruction(vm, &qualification);
                VmExitResult::ResumeVm
            }
        };
        stats.vmexit_count += 1;
        stats.host_spent_tsc += rdtsc() - host_start_tsc;

        // Either resume the VM, abort the VM, or panic the hypervisor according
        // to the result of VM exit handling.
        match exit_handling_result {
            VmExitResult::ResumeVm => continue,
            VmExitResult::AbortVm(reason) => {
                // An abort condition reached. Return the stats and reason.
                stats.total_tsc = rdtsc() - stats.start_tsc;
                return (stats.clone(), reason);
            }
            VmExitResult::Panic(exit_code) => {
                error!("{:#x?}", vm.vt);
                panic!("🐛 Non continuable VM exit {exit_code:#x}");
            }
        }
    }
}

/// Handles VM exit due to nested page fault.
///
/// This happens for three major reasons:
/// 1. The VM started without any memory being mapped. Any VM's attempt to
///    access memory fails due to missing GPA -> PA translation. This function
///    builds GPA -> PA address translation on the fly. Once translation is
///    built, that is used indefinitely and not cleared at the end of a run.
/// 2. VM's memory is mapped as read-only. Any newly mapped memory through (1)
///    is read-only, and any VM's attempt to write to it will fail due to
///    permission violation. This function performs copy-on-write and allows
///    further write access for the rest of this run. At the end of the run,
///    all "dirty" pages are discarded with [`Vm::revert_dirty_memory`].
/// 3. The VM accesses memory that is not captured in the snapshot. This is
///    possible and common because of MMIO. In this situation,
///    [`resolve_pa_for_gpa`] fails, and this function returns
///    [`VmExitResult::AbortVm`] to abort the VM.
fn handle_nested_page_fault(
    vm: &mut Vm,
    global: &GlobalState,
    qualification: &NestedPageFaultQualification,
) -> VmExitResult {
    trace!("{qualification:x?}");

    // Resolve a PA that maps or will map the GPA that the guest tried to access.
    let gpa = qualification.gpa as usize;
    let pa = match resolve_pa_for_gpa(gpa, global) {
        Ok(pa) => pa,
        Err(err) => return err,
    };

    // If this VM exit is due to missing GPA -> PA translation, build GPA -> PA
    // translation. Note that the PA resolved above is in the snapshot, whose
    // contents are shared across all VMs. VMs should never be able to modify
    // that, or changes made by one VM would be visible from other VMs. We
    // enforce this restriction via the copy-on-write mechanism below.
    if qualification.missing_translation {
        vm.build_translation(gpa, pa);
    }

    // If this is a write memory access, trigger copy-on-write. That is, with
    // `copy_on_write`, update GPA -> PA translation to map the GPA to one of
    // preallocated dirty pages instead of the snapshot page, `pa`. Then, copy
    // current contents of memory at `pa` to the new dirty page. This
    // effectively isolates the effect of memory write into this current guest.
    // Failure of copy-on-write (dirty page budget exhausted) warrants aborting
    // the VM.
    if qualification.write_access && !vm.copy_on_write(gpa, pa) {
        return VmExitResult::AbortVm(AbortReason::ExcessiveMemoryWrite);
    }

    // Since we changed nested paging structure entries, cache invalidation may be
    // required.
    vm.vt.invalidate_caches();
    VmExitResult::ResumeVm
}

/// Returns the physical address that backs the GPA specified by `gpa`.
///
/// This function checks if the GPA is within the snapshot. If so, returns a
/// PA within it. Otherwise, returns [`Err`].
fn resolve_pa_for_gpa(gpa: usize, global: &GlobalState) -> Result<*const Page, VmExitResult> {
    let pfn = gpa >> BASE_PAGE_SHIFT;

    if let Some(page) = resolve_page_from_snapshot(global, pfn) {
        Ok(page)
    } else if pfn == 0 {
        Err(VmExitResult::AbortVm(AbortReason::NullPageAccess))
    } else if pfn == 0xf_ffff_ffff_ffff {
        Err(VmExitResult::AbortVm(AbortReason::NegativePageAccess))
    } else {
        // Access to the outside of any guest physical memory ranges. This can
        // be normal due to MMIO.
        //
        // NOTE: We should detect if this is actually within MMIO regions or
        // random memory access as a result of a guest bug. We could do that by
        // capturing MMIO physical memory ranges within the snapshot, although
        // enumerating those ranges most likely requires platform specific API
        // calls.
        Err(VmExitResult::AbortVm(AbortReason::InvalidPageAccess))
    }
}

/// Handles VM exit due to exceptions happened in the VM.
///
/// None of these are expected with a well-formed guest; all of them abort the
/// VM so the next run starts from a clean snapshot.
fn handle_interrupt_or_exception(qualification: &ExceptionQualification) -> VmExitResult {
    VmExitResult::AbortVm(qualification.exception_code.into())
}

/// Handles VM exit due to external interrupt, such as timer interrupt, or
/// `PAUSE`.
///
/// This functions determines if the quantum given to the VM has expired.
fn handle_external_interrupt_or_pause(stats: &mut RunStats) -> VmExitResult {
    let total_elapsed_tsc = rdtsc() - stats.start_tsc;
    let guest_spent_tsc = total_elapsed_tsc - stats.host_spent_tsc;
    if guest_spent_tsc < GUEST_EXEC_TIMEOUT_IN_TSC {
        VmExitResult::ResumeVm
    } else {
        handle_timer_expiration(stats)
    }
}

/// Handles VM exit due to expiration of the quantum given to the VM.
fn handle_timer_expiration(stats: &mut RunStats) -> VmExitResult {
    stats.hang_count = 1;
    VmExitResult::AbortVm(AbortReason::Hang)
}

/// The result of handing VM exit.
enum VmExitResult {
    /// The VM should resume and retry the same instruction.
    ResumeVm,
    /// The VM should abort, and a new run should start.
    AbortVm(AbortReason),
    /// The current processor should panic.
    Panic(u64),
}

/// The detailed reason of [`VmExitResult::AbortVm`].
enum AbortReason {
    /// The VM caused VM exit that is not handled.
    /// Source: [`VmExitReason::Unexpected`].
    UnhandledVmExit,

    /// The VM attempted to access memory that is not backed by the snapshot.
    /// Source: [`VmExitReason::NestedPageFault`].
    InvalidPageAccess,

    /// The VM attempted to access the null page. An indicator of a bug.
    /// Source: [`VmExitReason::NestedPageFault`].
    NullPageAccess,

    /// The VM attempted to access address -1 (0xfffffff....). An indicator of a
    /// bug. Source: [`VmExitReason::NestedPageFault`].
    NegativePageAccess,

    /// The VM attempted to execute an invalid instruction. An indicator of a
    /// bug. Source: [`VmExitReason::Exception`].
    InvalidInstruction,

    /// The VM attempted to execute a breakpoint instruction. An indicator of a
    /// bug. Source: [`VmExitReason::Exception`].
    UnexpectedBreakpoint,

    /// The VM has modified too many pages. Maybe a bug.
    /// Source: [`VmExitReason::NestedPageFault`].
    ExcessiveMemoryWrite,

    /// The VM has used up its quantum. Maybe a bug.
    /// Source: [`VmExitReason::ExternalInterruptOrPause`] or
    /// [`VmExitReason::TimerExpiration`] .
    Hang,
}

impl AbortReason {
    /// Logs the reason of abort.
    fn report(&self) {
        match self {
            Self::UnhandledVmExit | Self::InvalidPageAccess => (),
            Self::NullPageAccess => warn!("NULL PAGE ACCESS"),
            Self::NegativePageAccess => warn!("NEGATIVE PAGE ACCESS"),
            Self::InvalidInstruction => warn!("INVALID INSTRUCTION"),
            Self::UnexpectedBreakpoint => warn!("UNEXPECTED BREAKPOINT"),
            Self::ExcessiveMemoryWrite => warn!("EXCESSIVE MEMORY WRITES"),
            Self::Hang => trace!("Hang detected"),
        }
    }
}

impl From<GuestException> for AbortReason {
    /// Converts [`GuestException`] to [`AbortReason`].
    fn from(value: GuestException) -> Self {
        match value {
            GuestException::BreakPoint => Self::UnexpectedBreakpoint,
            GuestException::InvalidOpcode => Self::InvalidInstruction,
            GuestException::PageFault => Self::InvalidPageAccess,
        }
    }
}
