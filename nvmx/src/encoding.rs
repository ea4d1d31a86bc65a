//! VVMCS field-encoding -> page-offset map (spec §3, §4.1).
//!
//! A field encoding is the 16-bit word the guest loads into a GPR before
//! `VMREAD`/`VMWRITE`. Bit 0 is `access_type`; bits 1-9 are a 9-bit real
//! index; bits 10-11 are `type`; bits 13-14 are `width`. The slot offset
//! only keeps the low 5 bits of the real index, which is what keeps the
//! whole field space inside a single 512-slot page.

/// The four field categories a VVMCS encoding can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Control,
    ReadOnlyData,
    GuestState,
    HostState,
}

/// The four field widths a VVMCS encoding can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWidth {
    Bit16,
    Bit64,
    Bit32,
    Natural,
}

/// A raw 16-bit VVMCS field encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldEncoding(pub u16);

/// Slot offset reserved for the VPID field after the remap below; also
/// doubles as the LAUNCH_STATE bookkeeping slot since nothing else can
/// ever hash to offset 0 once VPID has moved out of it.
pub const VPID_REMAPPED_OFFSET: usize = 0x3F;

impl FieldEncoding {
    /// `access_type`: for a 64-bit field, selects the high (`true`) or
    /// low (`false`) 32-bit half.
    #[must_use]
    pub const fn access_type_high(self) -> bool {
        self.0 & 1 != 0
    }

    /// The real 9-bit field index (bits 1-9 of the encoding).
    #[must_use]
    pub const fn index(self) -> u16 {
        (self.0 >> 1) & 0x1FF
    }

    #[must_use]
    pub const fn field_type(self) -> FieldType {
        match (self.0 >> 10) & 0x3 {
            0 => FieldType::Control,
            1 => FieldType::ReadOnlyData,
            2 => FieldType::GuestState,
            _ => FieldType::HostState,
        }
    }

    #[must_use]
    pub const fn width(self) -> FieldWidth {
        match (self.0 >> 13) & 0x3 {
            0 => FieldWidth::Bit16,
            1 => FieldWidth::Bit64,
            2 => FieldWidth::Bit32,
            _ => FieldWidth::Natural,
        }
    }

    /// The slot offset this encoding resolves to inside a VVMCS page,
    /// with the VPID-at-0 remap applied.
    #[must_use]
    pub fn slot_offset(self) -> usize {
        let type_bits = match self.field_type() {
            FieldType::Control => 0usize,
            FieldType::ReadOnlyData => 1,
            FieldType::GuestState => 2,
            FieldType::HostState => 3,
        };
        let width_bits = match self.width() {
            FieldWidth::Bit16 => 0usize,
            FieldWidth::Bit64 => 1,
            FieldWidth::Bit32 => 2,
            FieldWidth::Natural => 3,
        };
        let raw = (usize::from(self.index()) & 0x1F) | (type_bits << 5) | (width_bits << 7);
        if raw == 0 { VPID_REMAPPED_OFFSET } else { raw }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;

    #[test]
    fn vpid_aliasing_guard() {
        let vpid = FieldEncoding(fields::VPID);
        assert_eq!(vpid.slot_offset(), VPID_REMAPPED_OFFSET);

        // every other field we know about must not collide with 0
        for &encoding in &[
            fields::IO_BITMAP_A,
            fields::IO_BITMAP_A_HIGH,
            fields::IO_BITMAP_B,
            fields::IO_BITMAP_B_HIGH,
            fields::CPU_BASED_VM_EXEC_CONTROL,
            fields::EXCEPTION_BITMAP,
            fields::SECONDARY_VM_EXEC_CONTROL,
            fields::GUEST_RIP,
            fields::GUEST_CS_SELECTOR,
            fields::HOST_ES_SELECTOR,
        ] {
            assert_ne!(FieldEncoding(encoding).slot_offset(), 0);
        }
    }

    #[test]
    fn decodes_known_fields() {
        let rip = FieldEncoding(fields::GUEST_RIP);
        assert!(!rip.access_type_high());
        assert_eq!(rip.field_type(), FieldType::GuestState);
        assert_eq!(rip.width(), FieldWidth::Natural);

        let io_a = FieldEncoding(fields::IO_BITMAP_A);
        assert_eq!(io_a.field_type(), FieldType::Control);
        assert_eq!(io_a.width(), FieldWidth::Bit64);
        assert!(!io_a.access_type_high());

        let io_a_hi = FieldEncoding(fields::IO_BITMAP_A_HIGH);
        assert!(io_a_hi.access_type_high());
        assert_eq!(io_a_hi.slot_offset(), io_a.slot_offset());
    }
}
