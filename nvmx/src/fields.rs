//! Real VMX field encodings this crate needs by name (Intel SDM Vol. 3D,
//! Appendix B). Values are wire-format constants, not derived.

/// Control field, 16-bit. The sole field whose natural offset is 0; see
/// [`crate::encoding::VPID_REMAPPED_OFFSET`].
pub const VPID: u16 = 0x0000;

pub const IO_BITMAP_A: u16 = 0x2000;
pub const IO_BITMAP_A_HIGH: u16 = 0x2001;
pub const IO_BITMAP_B: u16 = 0x2002;
pub const IO_BITMAP_B_HIGH: u16 = 0x2003;

pub const CPU_BASED_VM_EXEC_CONTROL: u16 = 0x4002;
pub const EXCEPTION_BITMAP: u16 = 0x4004;
pub const SECONDARY_VM_EXEC_CONTROL: u16 = 0x401E;

pub const GUEST_ES_SELECTOR: u16 = 0x0800;
pub const GUEST_CS_SELECTOR: u16 = 0x0802;
pub const HOST_ES_SELECTOR: u16 = 0x0C00;
pub const GUEST_RIP: u16 = 0x681E;
