//! Composite control computation (spec §4.5 "Composite control
//! computation" / "Shadow I/O bitmap derivation" / "Shadowed exception
//! bitmap and secondary-control bitmap").

use bitflags::bitflags;

use crate::codec;
use crate::collab::{HardwareVmcs, ShadowIoBitmaps};
use crate::encoding::FieldEncoding;
use crate::fields;
use crate::state::NestedVcpuState;

bitflags! {
    /// The subset of `CPU_BASED_VM_EXEC_CONTROL` bits this core cares
    /// about by name (Intel SDM Vol. 3C, Table 24-6). Named the way
    /// `casys-kaist-kev`'s `VmcsProcBasedVmexecCtl` names its bits.
    pub struct CpuBasedExecCtl: u32 {
        const TPR_SHADOW = 1 << 21;
        const UNCOND_IO_EXITING = 1 << 24;
        const ACTIVATE_IO_BITMAP = 1 << 25;
        const ACTIVATE_MSR_BITMAP = 1 << 28;
        const ACTIVATE_SECONDARY_CONTROLS = 1 << 31;
    }
}

/// The bits L0 never lets L1 control directly (spec §4.5 step 3).
fn l0_reserved_bits() -> CpuBasedExecCtl {
    CpuBasedExecCtl::TPR_SHADOW
        | CpuBasedExecCtl::ACTIVATE_MSR_BITMAP
        | CpuBasedExecCtl::ACTIVATE_SECONDARY_CONTROLS
        | CpuBasedExecCtl::ACTIVATE_IO_BITMAP
        | CpuBasedExecCtl::UNCOND_IO_EXITING
}

fn pio_mask() -> CpuBasedExecCtl {
    CpuBasedExecCtl::ACTIVATE_IO_BITMAP | CpuBasedExecCtl::UNCOND_IO_EXITING
}

/// Inspects port 0x80 (bit 0 of byte 0x10) and port 0xED (bit 5 of byte
/// 0x1D) of L1's `IO_BITMAP_A` page.
#[must_use]
pub fn intercepted_ports(bitmap_a: &[u8; crate::config::PAGE_SIZE]) -> (bool, bool) {
    let port80 = bitmap_a[0x10] & 0b1 != 0;
    let port_ed = bitmap_a[0x1D] & (1 << 5) != 0;
    (port80, port_ed)
}

/// Synthesizes the hardware `CPU_BASED_VM_EXEC_CONTROL` field for an L2
/// entry, combining L0's `host_cntrl` with L1's intent read out of the
/// current VVMCS, and programs the hardware I/O bitmap pair accordingly.
///
/// No-op (logged) if no VVMCS is currently loaded.
pub fn update_exec_control<H: HardwareVmcs + ?Sized>(
    state: &NestedVcpuState,
    host: &mut H,
    shadow: &dyn ShadowIoBitmaps,
    host_cntrl: CpuBasedExecCtl,
) {
    let Some(map) = &state.current_vvmcs_map else {
        log::warn!("update_exec_control called with no VVMCS loaded");
        return;
    };
    let page = codec::Vvmcs4k::view(map.bytes());
    let l1_ctl = CpuBasedExecCtl::from_bits_truncate(
        codec::read_vvmcs(page, FieldEncoding(fields::CPU_BASED_VM_EXEC_CONTROL)) as u32,
    );

    let pio_ctl = l1_ctl & pio_mask();
    let mut effective = (l1_ctl & !l0_reserved_bits()) | host_cntrl;

    if pio_ctl == CpuBasedExecCtl::UNCOND_IO_EXITING {
        effective |= CpuBasedExecCtl::UNCOND_IO_EXITING;
        effective.remove(CpuBasedExecCtl::ACTIVATE_IO_BITMAP);
    } else if pio_ctl.is_empty() {
        let (a, b) = shadow.default_bitmap();
        host.write_vmcs_field(vmcs_field_io_bitmap_a(), a);
        host.write_vmcs_field(vmcs_field_io_bitmap_b(), b);
    } else {
        let bitmap_a = state.io_bitmap[0].as_ref().map(|f| *f.bytes());
        let (port80, port_ed) = bitmap_a.map_or((false, false), |a| intercepted_ports(&a));
        let (a, b) = shadow.select(port80, port_ed);
        host.write_vmcs_field(vmcs_field_io_bitmap_a(), a);
        host.write_vmcs_field(vmcs_field_io_bitmap_b(), b);
    }

    host.write_vmcs_field(vmcs_field_cpu_based_exec_ctl(), u64::from(effective.bits()));
}

/// Computes `read_vvmcs(EXCEPTION_BITMAP) | host_value` and writes it to
/// the hardware VMCS.
pub fn update_exception_bitmap<H: HardwareVmcs + ?Sized>(state: &NestedVcpuState, host: &mut H, host_value: u32) {
    shadow_or(state, host, fields::EXCEPTION_BITMAP, vmcs_field_exception_bitmap(), host_value);
}

/// Computes `read_vvmcs(SECONDARY_VM_EXEC_CONTROL) | host_value` and
/// writes it to the hardware VMCS.
pub fn update_secondary_exec_control<H: HardwareVmcs + ?Sized>(state: &NestedVcpuState, host: &mut H, host_value: u32) {
    shadow_or(state, host, fields::SECONDARY_VM_EXEC_CONTROL, vmcs_field_secondary_exec_ctl(), host_value);
}

fn shadow_or<H: HardwareVmcs + ?Sized>(state: &NestedVcpuState, host: &mut H, vvmcs_field: u16, hw_field: u32, host_value: u32) {
    let Some(map) = &state.current_vvmcs_map else {
        log::warn!("shadow_or called with no VVMCS loaded");
        return;
    };
    let page = codec::Vvmcs4k::view(map.bytes());
    let l1_value = codec::read_vvmcs(page, FieldEncoding(vvmcs_field)) as u32;
    host.write_vmcs_field(hw_field, u64::from(l1_value | host_value));
}

// Real VMCS field encodings (not VVMCS encodings) for the handful of
// hardware fields this module writes through `HardwareVmcs`.
const fn vmcs_field_cpu_based_exec_ctl() -> u32 {
    0x4002
}
const fn vmcs_field_exception_bitmap() -> u32 {
    0x4004
}
const fn vmcs_field_secondary_exec_ctl() -> u32 {
    0x401E
}
const fn vmcs_field_io_bitmap_a() -> u32 {
    0x2000
}
const fn vmcs_field_io_bitmap_b() -> u32 {
    0x2002
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NvmxConfig, PAGE_SIZE};
    use crate::test_support::{FakeHost, FakeShadowBitmaps};

    fn state_with_l1_ctl(ctl: CpuBasedExecCtl) -> (NestedVcpuState, FakeHost) {
        let mut host = FakeHost::new();
        let mut page = codec::Vvmcs4k::default();
        codec::write_vvmcs(
            &mut page,
            FieldEncoding(fields::CPU_BASED_VM_EXEC_CONTROL),
            u64::from(ctl.bits()),
        );
        host.put_guest_page(0x6000, page.to_bytes());

        let mut state = NestedVcpuState::new(0x1000, NvmxConfig { vmcs_revision_id: 1 }).unwrap();
        crate::lifecycle::load_current_vvmcs(&mut state, &mut host, 0x6000);
        (state, host)
    }

    #[test]
    fn uncond_io_exiting_forces_uncond_clears_bitmap_activation() {
        let (state, mut host) = state_with_l1_ctl(CpuBasedExecCtl::UNCOND_IO_EXITING);
        update_exec_control(&state, &mut host, &FakeShadowBitmaps, CpuBasedExecCtl::empty());
        let written = CpuBasedExecCtl::from_bits_truncate(
            host.read_vmcs_field(vmcs_field_cpu_based_exec_ctl()) as u32
        );
        assert!(written.contains(CpuBasedExecCtl::UNCOND_IO_EXITING));
        assert!(!written.contains(CpuBasedExecCtl::ACTIVATE_IO_BITMAP));
    }

    #[test]
    fn no_io_intercept_uses_host_default_bitmap() {
        let (state, mut host) = state_with_l1_ctl(CpuBasedExecCtl::empty());
        update_exec_control(&state, &mut host, &FakeShadowBitmaps, CpuBasedExecCtl::empty());
        assert_eq!(host.read_vmcs_field(vmcs_field_io_bitmap_a()), 0x9000);
        assert_eq!(host.read_vmcs_field(vmcs_field_io_bitmap_b()), 0x9001);
    }

    #[test]
    fn l1_bitmap_uses_derived_shadow_bitmap() {
        let (mut state, mut host) = state_with_l1_ctl(CpuBasedExecCtl::ACTIVATE_IO_BITMAP);
        let mut bitmap_a = [0u8; PAGE_SIZE];
        bitmap_a[0x10] = 0b1; // port 0x80 intercepted
        host.put_guest_page(0x7000, bitmap_a);
        crate::lifecycle::remap_io_bitmap(&mut state, &mut host, crate::state::IoBitmapSlot::A);
        // remap reads the GPA from the VVMCS's IO_BITMAP_A field, which
        // we never wrote in this test; set it directly via the map.
        let map = state.current_vvmcs_map.as_mut().unwrap();
        let page = codec::Vvmcs4k::view_mut(map.bytes_mut());
        codec::write_vvmcs(page, FieldEncoding(fields::IO_BITMAP_A), 0x7000);
        crate::lifecycle::remap_io_bitmap(&mut state, &mut host, crate::state::IoBitmapSlot::A);

        update_exec_control(&state, &mut host, &FakeShadowBitmaps, CpuBasedExecCtl::empty());
        let (expected_a, expected_b) = FakeShadowBitmaps.select(true, false);
        assert_eq!(host.read_vmcs_field(vmcs_field_io_bitmap_a()), expected_a);
        assert_eq!(host.read_vmcs_field(vmcs_field_io_bitmap_b()), expected_b);
    }
}
