//! VMX instruction operand decoder (spec §4.2).
//!
//! Consumes a captured guest register snapshot plus the two
//! hardware-populated VM-exit fields (`VMX_INSTRUCTION_INFO`,
//! `EXIT_QUALIFICATION`) and produces either a register-form or a
//! memory-form operand.

use bitfield::bitfield;

use crate::collab::GuestRegisters;
use crate::error::Fault;

bitfield! {
    /// `VMX_INSTRUCTION_INFO` (Intel SDM Vol. 3C, Table 24-23), the
    /// general memory/register-operand form shared by VMREAD/VMWRITE
    /// and the VMXON/VMPTRLD/VMPTRST/VMCLEAR memory-only family.
    #[derive(Clone, Copy)]
    pub struct InstructionInfo(u32);
    impl Debug;
    pub scaling, _: 1, 0;
    pub reg1, _: 6, 3;
    pub address_size, _: 9, 7;
    pub mem_reg, _: 10;
    pub segment, _: 14, 12;
    pub index_reg, _: 17, 15;
    pub index_reg_invalid, _: 18;
    pub base_reg, _: 21, 19;
    pub base_reg_invalid, _: 22;
    pub reg2, _: 31, 28;
}

/// `EXIT_QUALIFICATION` for a VMX-instruction exit: the raw
/// displacement used in the memory-operand address computation.
#[derive(Debug, Clone, Copy)]
pub struct ExitQualification(pub u64);

/// Base and limit of one segment, as the guest's segment descriptor
/// cache would report it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentDescriptor {
    pub base: u64,
    pub limit: u32,
}

/// The six segment descriptors addressable by `InstructionInfo::segment`
/// (SDM order: ES, CS, SS, DS, FS, GS).
#[derive(Debug, Clone, Copy)]
pub struct SegmentSnapshot(pub [SegmentDescriptor; 6]);

impl Default for SegmentSnapshot {
    fn default() -> Self {
        Self([SegmentDescriptor::default(); 6])
    }
}

const SEGMENT_GS: u32 = 5;

/// The decoded operand form of a VMX instruction.
#[derive(Debug, Clone, Copy)]
pub enum Decoded {
    Register { reg1: u8, reg2: u8 },
    Memory { linear_addr: u64, length: u32, reg2: u8 },
}

/// Decodes `info`/`qualification` into a [`Decoded`] operand.
///
/// # Errors
///
/// `#GP(0)` if `segment > 5`, or if the computed offset falls outside
/// the segment limit in non-long mode (or in long mode when the
/// segment is GS).
pub fn decode(
    regs: &dyn GuestRegisters,
    segs: &SegmentSnapshot,
    info: InstructionInfo,
    qualification: ExitQualification,
    long_mode_enabled: bool,
) -> Result<Decoded, Fault> {
    let segment = info.segment();
    if segment > 5 {
        return Err(Fault::gp0());
    }

    if info.mem_reg() {
        return Ok(Decoded::Register {
            reg1: info.reg1() as u8,
            reg2: info.reg2() as u8,
        });
    }

    let seg = segs.0[segment as usize];
    let base = if info.base_reg_invalid() {
        0
    } else {
        regs.gpr(info.base_reg() as u8)
    };
    let index = if info.index_reg_invalid() {
        0
    } else {
        regs.gpr(info.index_reg() as u8) << info.scaling()
    };
    let disp = qualification.0;
    let length = 1u32 << (info.address_size() + 1);
    let offset = seg
        .base
        .wrapping_add(base)
        .wrapping_add(index)
        .wrapping_add(disp);

    let enforce_limit = !long_mode_enabled || segment == SEGMENT_GS;
    if enforce_limit {
        let limit = u64::from(seg.limit);
        if offset > limit || offset + u64::from(length) > limit {
            return Err(Fault::gp0());
        }
    }

    Ok(Decoded::Memory {
        linear_addr: offset,
        length,
        reg2: info.reg2() as u8,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeHost;

    #[test]
    fn linear_address_formula() {
        let mut host = FakeHost::new();
        host.set_gpr(0, 0x1000); // RAX, base
        host.set_gpr(3, 0x10); // RBX, index

        let mut segs = SegmentSnapshot::default();
        segs.0[3] = SegmentDescriptor { base: 0x100000, limit: 0xFFFF_FFFF }; // DS

        // memreg=0 (memory form), segment=DS(3), base_reg=RAX(0), index_reg=RBX(3),
        // scaling=2 (x4), addr_size=1 (32-bit -> length 4).
        let raw = 2u32 // scaling bits1:0
            | (1u32 << 7) // address_size bits9:7 = 1
            | (3u32 << 12) // segment
            | (3u32 << 15) // index_reg
            | (0u32 << 19); // base_reg

        let qualification = ExitQualification(0x20);
        let decoded = decode(&host, &segs, InstructionInfo(raw), qualification, true).unwrap();
        match decoded {
            Decoded::Memory { linear_addr, length, .. } => {
                assert_eq!(linear_addr, 0x101060);
                assert_eq!(length, 4);
            }
            Decoded::Register { .. } => panic!("expected memory-form operand"),
        }
    }

    #[test]
    fn segment_out_of_range_faults() {
        let host = FakeHost::new();
        let segs = SegmentSnapshot::default();
        let raw = 6u32 << 12; // segment = 6, invalid
        let result = decode(&host, &segs, InstructionInfo(raw), ExitQualification(0), true);
        assert_eq!(result.unwrap_err(), Fault::gp0());
    }

    #[test]
    fn register_form_short_circuits_memory_decode() {
        let host = FakeHost::new();
        let segs = SegmentSnapshot::default();
        let raw = (1u32 << 10) | (2 << 3) | (5 << 28); // mem_reg set, reg1=2, reg2=5
        let decoded = decode(&host, &segs, InstructionInfo(raw), ExitQualification(0), true).unwrap();
        match decoded {
            Decoded::Register { reg1, reg2 } => {
                assert_eq!(reg1, 2);
                assert_eq!(reg2, 5);
            }
            Decoded::Memory { .. } => panic!("expected register-form operand"),
        }
    }

    #[test]
    fn limit_violation_faults_outside_long_mode() {
        let host = FakeHost::new();
        let mut segs = SegmentSnapshot::default();
        segs.0[3] = SegmentDescriptor { base: 0, limit: 0x10 };
        let raw = (1u32 << 19) | (1u32 << 22) | (1u32 << 18) | (3 << 12); // base_reg_invalid/index_reg_invalid set, segment=DS
        let result = decode(&host, &segs, InstructionInfo(raw), ExitQualification(0x20), false);
        assert_eq!(result.unwrap_err(), Fault::gp0());
    }
}
