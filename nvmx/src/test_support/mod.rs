//! Hand-written fake collaborators used only by `#[cfg(test)]` modules
//! throughout this crate (SPEC_FULL §8 "Test tooling").

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::collab::{
    ExceptionInjector, GuestFrameRo, GuestFrameRw, GuestMemory, GuestRegisters, HardwareVmcs,
    ShadowIoBitmaps,
};
use crate::config::PAGE_SIZE;
use crate::error::Fault;

/// An in-memory guest-physical frame, owned by [`FakeHost`]'s memory map
/// and handed out as a boxed trait object, same shape the real host
/// returns.
pub struct FakeFrame(pub [u8; PAGE_SIZE]);

impl GuestFrameRo for FakeFrame {
    fn bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.0
    }
}

impl GuestFrameRw for FakeFrame {
    fn bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.0
    }
}

/// A minimal fake satisfying every collaborator trait `nvmx` defines,
/// backed by a flat `Vec` standing in for guest-physical memory.
pub struct FakeHost {
    pub gprs: [u64; 16],
    pub rflags: u64,
    pub injected: Vec<(u8, u32)>,
    pub guest_phys: alloc::collections::BTreeMap<u64, [u8; PAGE_SIZE]>,
    pub guest_virt: alloc::collections::BTreeMap<u64, u8>,
    pub vmcs_fields: alloc::collections::BTreeMap<u32, u64>,
    pub cleared: Vec<u64>,
    pub loaded: Vec<u64>,
    pub current_vmcs_pa: u64,
    pub launched: bool,
    pub fail_next_guest_virt_copy: bool,
}

impl FakeHost {
    #[must_use]
    pub fn new() -> Self {
        Self {
            gprs: [0; 16],
            rflags: 0,
            injected: Vec::new(),
            guest_phys: alloc::collections::BTreeMap::new(),
            guest_virt: alloc::collections::BTreeMap::new(),
            vmcs_fields: alloc::collections::BTreeMap::new(),
            cleared: Vec::new(),
            loaded: Vec::new(),
            current_vmcs_pa: 0,
            launched: false,
            fail_next_guest_virt_copy: false,
        }
    }

    pub fn put_guest_page(&mut self, gpa: u64, page: [u8; PAGE_SIZE]) {
        let _ = self.guest_phys.insert(gpa & !0xFFF, page);
    }
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestRegisters for FakeHost {
    fn gpr(&self, index: u8) -> u64 {
        self.gprs[index as usize]
    }

    fn set_gpr(&mut self, index: u8, value: u64) {
        self.gprs[index as usize] = value;
    }

    fn rflags(&self) -> u64 {
        self.rflags
    }

    fn set_rflags(&mut self, value: u64) {
        self.rflags = value;
    }
}

impl GuestMemory for FakeHost {
    fn map_guest_frame_ro(&mut self, gpa: u64) -> Result<Box<dyn GuestFrameRo>, Fault> {
        let page = self.guest_phys.get(&(gpa & !0xFFF)).copied().ok_or(Fault::gp0())?;
        Ok(Box::new(FakeFrame(page)))
    }

    fn map_guest_frame_rw(&mut self, gpa: u64) -> Result<Box<dyn GuestFrameRw>, Fault> {
        let page = self.guest_phys.get(&(gpa & !0xFFF)).copied().unwrap_or([0; PAGE_SIZE]);
        let _ = self.guest_phys.insert(gpa & !0xFFF, page);
        Ok(Box::new(FakeFrame(page)))
    }

    fn copy_from_guest_virt(&mut self, gva: u64, len: u32) -> Result<u64, Fault> {
        if self.fail_next_guest_virt_copy {
            self.fail_next_guest_virt_copy = false;
            return Err(Fault::gp0());
        }
        let mut value = 0u64;
        for i in 0..len {
            let byte = *self.guest_virt.get(&(gva + u64::from(i))).unwrap_or(&0);
            value |= u64::from(byte) << (8 * i);
        }
        Ok(value)
    }

    fn copy_to_guest_virt(&mut self, gva: u64, value: u64, len: u32) -> Result<(), Fault> {
        if self.fail_next_guest_virt_copy {
            self.fail_next_guest_virt_copy = false;
            return Err(Fault::gp0());
        }
        for i in 0..len {
            let byte = ((value >> (8 * i)) & 0xFF) as u8;
            let _ = self.guest_virt.insert(gva + u64::from(i), byte);
        }
        Ok(())
    }
}

impl ExceptionInjector for FakeHost {
    fn inject_exception(&mut self, vector: u8, error_code: u32) {
        self.injected.push((vector, error_code));
    }
}

impl HardwareVmcs for FakeHost {
    fn read_vmcs_field(&self, field: u32) -> u64 {
        *self.vmcs_fields.get(&field).unwrap_or(&0)
    }

    fn write_vmcs_field(&mut self, field: u32, value: u64) {
        let _ = self.vmcs_fields.insert(field, value);
    }

    fn vmclear(&mut self, pa: u64) {
        self.cleared.push(pa);
    }

    fn vmptrld(&mut self, pa: u64) {
        self.loaded.push(pa);
        self.current_vmcs_pa = pa;
    }

    fn current_vmcs_pa(&self) -> u64 {
        self.current_vmcs_pa
    }

    fn snapshot_live_vmcs_into(&mut self, shadow_pa: u64) {
        let live = self.current_vmcs_pa;
        self.cleared.push(live);
        self.loaded.push(live);
        let snapshot = self.guest_phys.get(&live).copied().unwrap_or([0; PAGE_SIZE]);
        let _ = self.guest_phys.insert(shadow_pa, snapshot);
    }

    fn set_launched(&mut self, launched: bool) {
        self.launched = launched;
    }
}

/// Fixed four-way shadow-bitmap table for tests: `default_bitmap()` is
/// `(0x9000, 0x9001)`; `select` keys the remaining three combinations
/// off `0xA000 | (port80 as u64) << 0 | (port_ed as u64) << 1`.
pub struct FakeShadowBitmaps;

impl ShadowIoBitmaps for FakeShadowBitmaps {
    fn select(&self, port80_intercepted: bool, port_ed_intercepted: bool) -> (u64, u64) {
        let key = u64::from(port80_intercepted) | (u64::from(port_ed_intercepted) << 1);
        (0xA000 | (key << 4), 0xA001 | (key << 4))
    }

    fn default_bitmap(&self) -> (u64, u64) {
        (0x9000, 0x9001)
    }
}
