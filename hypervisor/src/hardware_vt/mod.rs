//! The module containing vendor agnostic representation of HW VT
//! (hardware-assisted virtualization technology) related definitions.

pub(crate) mod svm;
pub(crate) mod vmx;

use crate::snapshot::Snapshot;
use bitfield::bitfield;
use core::fmt;
use x86::{
    current::paging::{BASE_PAGE_SHIFT, PAGE_SIZE_ENTRIES},
    irq,
};

/// This trait represents an interface to enable HW VT, setup and run a single
/// virtual machine instance on the current processor.
pub(crate) trait HardwareVt: fmt::Debug {
    /// Enables HW VT on the current processor. It has to be called exactly once
    /// before calling any other method.
    fn enable(&mut self);

    /// Configures HW VT such as enabling nested paging and exception
    /// interception.
    fn initialize(&mut self, nested_pml4_addr: u64);

    /// Configures the guest states based on the snapshot.
    fn revert_registers(&mut self, snapshot: &Snapshot);

    /// Executes the guest until it triggers VM exit.
    fn run(&mut self) -> VmExitReason;

    /// Invalidates caches of the nested paging structures.
    fn invalidate_caches(&mut self);

    /// Gets a flag value to be set to nested paging structure entries for the
    /// given entry types (eg, permissions).
    fn nps_entry_flags(
        &self,
        entry_type: NestedPagingStructureEntryType,
    ) -> NestedPagingStructureEntryFlags;

    /// Returns the vendor-specific surface needed to emulate nested VMX for
    /// the guest, or `None` on vendors (AMD) that cannot produce a
    /// [`VmExitReason::VmxInstruction`] in the first place.
    fn as_nested_vmx_ops(&mut self) -> Option<&mut dyn NestedVmxOps> {
        None
    }

    /// Read-only counterpart of [`Self::as_nested_vmx_ops`], for collaborator
    /// calls that only need to read a register or VMCS field.
    fn as_nested_vmx_ops_ref(&self) -> Option<&dyn NestedVmxOps> {
        None
    }
}

/// The operations `nvmx`'s collaborator traits need from the concrete
/// hardware backend, gathered into one object-safe trait so `Vm` can hold a
/// `&mut dyn HardwareVt` and still implement `nvmx::collab::NvmxHost` for
/// itself (see `crate::nested_vmx`).
pub(crate) trait NestedVmxOps {
    fn gpr(&self, index: u8) -> u64;
    fn set_gpr(&mut self, index: u8, value: u64);
    fn rflags(&self) -> u64;
    fn set_rflags(&mut self, value: u64);
    fn read_vmcs_field(&self, field: u32) -> u64;
    fn write_vmcs_field(&mut self, field: u32, value: u64);
    fn vmclear(&mut self, pa: u64);
    fn vmptrld(&mut self, pa: u64);
    fn current_vmcs_pa(&self) -> u64;
    fn snapshot_live_vmcs_into(&mut self, shadow_pa: u64);
    fn set_launched(&mut self, launched: bool);
    fn inject_exception(&mut self, vector: u8, error_code: u32);
}

/// Reasons of VM exit.
pub(crate) enum VmExitReason {
    /// An address translation failure with nested paging. Contains a guest
    /// physical address that failed translation and whether the access was
    /// write access.
    NestedPageFault(NestedPageFaultQualification),

    /// An exception happened. Contains an exception code.
    Exception(ExceptionQualification),

    /// An external interrupt occurred, or `PAUSE` was executed more than
    /// certain times.
    ExternalInterruptOrPause,

    /// The guest ran long enough to use up its time slice.
    TimerExpiration,

    /// The logical processor entered the shutdown state, eg, triple fault.
    Shutdown(u64),

    /// An unhandled VM exit happened. Contains a vendor specific VM exit code.
    Unexpected(u64),

    /// The guest (L1) executed a VMX instruction that this hypervisor
    /// emulates on its behalf so L1 can itself run a nested guest (L2).
    VmxInstruction(VmxInstructionQualification),
}

/// Everything `nvmx::dispatcher` needs about a VM exit caused by a VMX
/// instruction, captured at the moment of the exit.
pub(crate) struct VmxInstructionQualification {
    pub(crate) opcode: nvmx::opcode::VmxOpcode,
    pub(crate) instruction_info: u32,
    pub(crate) exit_qualification: u64,
    pub(crate) cpu: VmxGuestCpuSnapshot,
    pub(crate) segments: [(u64, u32); 6],
}

/// The subset of L1's CPU mode the Privilege Gate (`nvmx::privilege`) checks,
/// captured from the real hardware VMCS at exit time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VmxGuestCpuSnapshot {
    pub(crate) cr0_pe: bool,
    pub(crate) cr4_vmxe: bool,
    pub(crate) eflags_vm: bool,
    pub(crate) long_mode_enabled: bool,
    pub(crate) cs_l: bool,
    pub(crate) cpl: u8,
    pub(crate) vmxon_active: bool,
}

/// Details of the cause of nested page fault.
#[derive(Debug)]
pub(crate) struct NestedPageFaultQualification {
    #[allow(unused)]
    pub(crate) rip: u64,
    pub(crate) gpa: u64,
    pub(crate) missing_translation: bool,
    pub(crate) write_access: bool,
}

pub(crate) struct ExceptionQualification {
    pub(crate) rip: u64,
    pub(crate) exception_code: GuestException,
}

/// The cause of guest exception.
#[derive(Clone, Copy, PartialEq)]
pub(crate) enum GuestException {
    BreakPoint,
    InvalidOpcode,
    PageFault,
}

impl TryFrom<u8> for GuestException {
    type Error = &'static str;

    fn try_from(vector: u8) -> Result<Self, Self::Error> {
        match vector {
            irq::BREAKPOINT_VECTOR => Ok(GuestException::BreakPoint),
            irq::INVALID_OPCODE_VECTOR => Ok(GuestException::InvalidOpcode),
            irq::PAGE_FAULT_VECTOR => Ok(GuestException::PageFault),
            _ => Err("Vector of the exception that is not intercepted"),
        }
    }
}

/// Permissions and memory types to be specified for nested paging structure
/// entries.
pub(crate) enum NestedPagingStructureEntryType {
    /// Readable, writable, executable.
    Rwx,

    /// Readable, writable, executable, with the write-back memory type.
    RwxWriteBack,

    /// Readable, NON writable, executable, with the write-back memory type.
    RxWriteBack,
}

/// The values used to initialize [`NestedPagingStructureEntry`].
#[derive(Clone, Copy)]
pub(crate) struct NestedPagingStructureEntryFlags {
    pub(crate) permission: u8,
    pub(crate) memory_type: u8,
}

/// The collection of the guest general purpose register values.
#[derive(Debug, Default)]
#[repr(C)]
struct GuestRegisters {
    pub(crate) rax: u64,
    pub(crate) rbx: u64,
    pub(crate) rcx: u64,
    pub(crate) rdx: u64,
    pub(crate) rdi: u64,
    pub(crate) rsi: u64,
    pub(crate) rbp: u64,
    pub(crate) r8: u64,
    pub(crate) r9: u64,
    pub(crate) r10: u64,
    pub(crate) r11: u64,
    pub(crate) r12: u64,
    pub(crate) r13: u64,
    pub(crate) r14: u64,
    pub(crate) r15: u64,
    pub(crate) rip: u64,
    pub(crate) rsp: u64,
    pub(crate) rflags: u64,
}

/// A single nested paging structure.
///
/// This is a extended page table on Intel and a nested page table on AMD. The
/// details of the layout are not represented in this structure so that it may
/// be used for any the structures (PML4, PDPT, PD and PT) across platforms.
#[derive(Clone, Copy, Debug)]
#[repr(C, align(4096))]
pub(crate) struct NestedPagingStructure {
    /// An array of extended page table entry (8 bytes, 512 entries)
    pub(crate) entries: [NestedPagingStructureEntry; PAGE_SIZE_ENTRIES],
}
const _: () = assert!(size_of::<NestedPagingStructure>() == 0x1000);

bitfield! {
    /// Platform independent representation of a nested paging structure entry.
    ///
    /// Because it is platform independent, the layout is not exactly correct.
    /// For example, bit 5:3 `memory_type` exists only on Intel. On AMD, those are
    /// other bits and we set zeros.
    /*
         66665 5     1 110000 000 000
         32109 8.....2 109876 543 210
        +-----+-------+------+---+---+
        |xxxxx|  PFN  |xxxxxx| M | P |
        +-----+-------+------+---+---+
    */
    #[derive(Clone, Copy)]
    pub struct NestedPagingStructureEntry(u64);
    impl Debug;
    permission, set_permission: 2, 0;
    memory_type, set_memory_type: 5, 3;
    flags1, _: 11, 6;
    pub pfn, set_pfn: 58, 12;
    flags2, _: 63, 59;
}

impl NestedPagingStructureEntry {
    /// Returns the next nested paging structures.
    pub(crate) fn next_table_mut(&mut self) -> &mut NestedPagingStructure {
        let next_table_addr = self.pfn() << BASE_PAGE_SHIFT;
        assert!(next_table_addr != 0);
        let next_table_ptr = next_table_addr as *mut NestedPagingStructure;
        unsafe { next_table_ptr.as_mut() }.unwrap()
    }

    /// Read-only counterpart of [`Self::next_table_mut`], used to walk an
    /// existing translation without the ability to allocate missing tables.
    pub(crate) fn next_table(&self) -> &NestedPagingStructure {
        let next_table_addr = self.pfn() << BASE_PAGE_SHIFT;
        assert!(next_table_addr != 0);
        let next_table_ptr = next_table_addr as *const NestedPagingStructure;
        unsafe { next_table_ptr.as_ref() }.unwrap()
    }

    /// Sets the address to the next nested paging structure or final physical
    /// address with permissions specified by `flags`.
    pub(crate) fn set_translation(&mut self, pa: u64, flags: NestedPagingStructureEntryFlags) {
        self.set_pfn(pa >> BASE_PAGE_SHIFT);
        self.set_permission(u64::from(flags.permission));
        self.set_memory_type(u64::from(flags.memory_type));
    }
}

/// Returns the segment descriptor casted as a 64bit integer for the given
/// selector.
fn get_segment_descriptor_value(table_base: u64, selector: u16) -> u64 {
    let sel = x86::segmentation::SegmentSelector::from_raw(selector);
    let descriptor_addr = table_base + u64::from(sel.index() * 8);
    let ptr = descriptor_addr as *const u64;
    unsafe { *ptr }
}

/// Returns the limit of the given segment.
fn get_segment_limit(table_base: u64, selector: u16) -> u32 {
    let sel = x86::segmentation::SegmentSelector::from_raw(selector);
    if sel.index() == 0 && (sel.bits() >> 2) == 0 {
        return 0; // unusable
    }
    let descriptor_value = get_segment_descriptor_value(table_base, selector);
    let limit_low = descriptor_value & 0xffff;
    let limit_high = (descriptor_value >> (32 + 16)) & 0xF;
    let mut limit = limit_low | (limit_high << 16);
    if ((descriptor_value >> (32 + 23)) & 0x01) != 0 {
        limit = ((limit + 1) << BASE_PAGE_SHIFT) - 1;
    }
    limit as u32
}
