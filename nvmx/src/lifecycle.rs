//! VVMCS Lifecycle Manager (spec §4.4): owns the mappings backing the
//! VMXON region, the currently-pointed VVMCS, and the two I/O bitmap
//! pages.

use crate::codec;
use crate::collab::{GuestMemory, HardwareVmcs};
use crate::config::INVALID_GPA;
use crate::encoding::FieldEncoding;
use crate::fields;
use crate::state::{IoBitmapSlot, NestedVcpuState};

/// Issues VMCLEAR against the shadow VMCS so it is not cached on any
/// logical CPU.
pub fn clear_shadow(state: &NestedVcpuState, hw: &mut dyn HardwareVmcs) {
    hw.vmclear(state.shadow_vmcs_pa);
}

/// Records `current_vvmcs_gpa = gpa`, maps it read/write, and remaps
/// both I/O bitmaps out of it.
pub fn load_current_vvmcs<H: GuestMemory + ?Sized>(state: &mut NestedVcpuState, mem: &mut H, gpa: u64) {
    match mem.map_guest_frame_rw(gpa) {
        Ok(map) => {
            state.current_vvmcs_gpa = gpa;
            state.current_vvmcs_map = Some(map);
            remap_io_bitmap(state, mem, IoBitmapSlot::A);
            remap_io_bitmap(state, mem, IoBitmapSlot::B);
        }
        Err(fault) => {
            log::warn!("failed to map VVMCS at {gpa:#x}: {fault:?}");
        }
    }
}

/// Releases the current VVMCS mapping (if any), resets
/// `current_vvmcs_gpa` to `INVALID_GPA`, and releases both I/O bitmap
/// mappings.
pub fn unload_current_vvmcs(state: &mut NestedVcpuState) {
    state.current_vvmcs_map = None;
    state.current_vvmcs_gpa = INVALID_GPA;
    state.io_bitmap = [None, None];
}

/// Releases the existing mapping for `which`, then re-derives it from
/// the GPA currently stored at the matching `IO_BITMAP_A`/`_B` field, if
/// a VVMCS is loaded.
pub fn remap_io_bitmap<H: GuestMemory + ?Sized>(state: &mut NestedVcpuState, mem: &mut H, which: IoBitmapSlot) {
    let slot = which as usize;
    state.io_bitmap[slot] = None;

    let Some(map) = &state.current_vvmcs_map else {
        return;
    };
    let page = codec::Vvmcs4k::view(map.bytes());
    let encoding = match which {
        IoBitmapSlot::A => fields::IO_BITMAP_A,
        IoBitmapSlot::B => fields::IO_BITMAP_B,
    };
    let gpa = codec::read_vvmcs(page, FieldEncoding(encoding));

    match mem.map_guest_frame_ro(gpa) {
        Ok(frame) => state.io_bitmap[slot] = Some(frame),
        Err(fault) => log::warn!("failed to map I/O bitmap {which:?} at {gpa:#x}: {fault:?}"),
    }
}

/// The purge sequence: clear shadow, unload current VVMCS, release both
/// bitmaps. Invoked on VMXOFF, vCPU destruction, and any VMPTRLD whose
/// GPA differs from the one currently loaded.
pub fn purge<H: GuestMemory + HardwareVmcs + ?Sized>(state: &mut NestedVcpuState, host: &mut H) {
    clear_shadow(state, host);
    unload_current_vvmcs(state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::test_support::FakeHost;

    fn vvmcs_page_with_io_bitmaps(a_gpa: u64, b_gpa: u64) -> [u8; PAGE_SIZE] {
        let mut page = codec::Vvmcs4k::default();
        codec::write_vvmcs(&mut page, FieldEncoding(fields::IO_BITMAP_A), a_gpa);
        codec::write_vvmcs(&mut page, FieldEncoding(fields::IO_BITMAP_B), b_gpa);
        page.to_bytes()
    }

    #[test]
    fn load_current_vvmcs_remaps_both_bitmaps() {
        let mut host = FakeHost::new();
        host.put_guest_page(0x3000, [0xAB; PAGE_SIZE]);
        host.put_guest_page(0x4000, [0xCD; PAGE_SIZE]);
        host.put_guest_page(0x5000, vvmcs_page_with_io_bitmaps(0x3000, 0x4000));

        let mut state = NestedVcpuState::new(0x1000, crate::config::NvmxConfig { vmcs_revision_id: 1 }).unwrap();
        load_current_vvmcs(&mut state, &mut host, 0x5000);

        assert_eq!(state.current_vvmcs_gpa, 0x5000);
        assert!(state.io_bitmap[0].is_some());
        assert!(state.io_bitmap[1].is_some());
        assert_eq!(state.io_bitmap[0].as_ref().unwrap().bytes()[0], 0xAB);
        assert_eq!(state.io_bitmap[1].as_ref().unwrap().bytes()[0], 0xCD);
    }

    #[test]
    fn purge_clears_shadow_and_unloads() {
        let mut host = FakeHost::new();
        host.put_guest_page(0x5000, vvmcs_page_with_io_bitmaps(0x3000, 0x4000));

        let mut state = NestedVcpuState::new(0x1000, crate::config::NvmxConfig { vmcs_revision_id: 1 }).unwrap();
        load_current_vvmcs(&mut state, &mut host, 0x5000);
        purge(&mut state, &mut host);

        assert_eq!(state.current_vvmcs_gpa, INVALID_GPA);
        assert!(state.current_vvmcs_map.is_none());
        assert!(state.io_bitmap[0].is_none());
        assert!(state.io_bitmap[1].is_none());
        assert_eq!(host.cleared, alloc::vec![0x1000]);
    }
}
