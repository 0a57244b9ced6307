use bitvec::{field::BitField, order::Lsb0, view::BitView};

use crate::paging::VmMode;

/// The slice of the `mstatus` register that address translation consumes.
///
/// > The mstatus register keeps track of and controls the hart's current
/// > operating state.
///
/// Only the fields the MMU reads are modeled: `MPRV` (modify privilege,
/// forcing data accesses through translation even in machine mode) and the
/// `VM` field selecting the address-translation mode. Both live at their
/// priv-1.9.1 positions.
#[derive(Debug, Clone)]
pub struct Status {
    mstatus: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

impl Status {
    pub fn new() -> Self {
        Self { mstatus: 0 }
    }

    /// Returns `true` if the MPRV (Modify PRiVilege) bit is set.
    pub fn mprv(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MPRV]
    }

    /// Sets the MPRV (Modify PRiVilege) bit to `value`.
    pub fn set_mprv(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MPRV, value);
    }

    /// Returns the address-translation mode encoded by the VM field.
    pub fn vm(&self) -> VmMode {
        let field = self.mstatus.view_bits::<Lsb0>()[idx::VM].load::<u8>();
        // The field is WARL and set_vm only stores supported encodings.
        VmMode::from_field(field).unwrap_or(VmMode::Mbare)
    }

    /// Sets the VM field. The field is **WARL**: writes of encodings this
    /// implementation does not support are ignored.
    pub fn set_vm(&mut self, field: u8) {
        if VmMode::from_field(field).is_some() {
            self.mstatus.view_bits_mut::<Lsb0>()[idx::VM].store(field);
        }
    }
}

/// Bit indices of the modeled fields within `mstatus`.
mod idx {
    use std::ops::Range;

    pub const MPRV: usize = 17;
    pub const VM: Range<usize> = 24..29;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mprv() {
        let mut status = Status::new();
        assert!(!status.mprv());
        status.set_mprv(true);
        assert!(status.mprv());
        status.set_mprv(false);
        assert!(!status.mprv());
    }

    #[test]
    fn test_vm_field() {
        let mut status = Status::new();
        assert_eq!(VmMode::Mbare, status.vm());
        status.set_vm(VmMode::Sv39.to_field());
        assert_eq!(VmMode::Sv39, status.vm());
        status.set_vm(VmMode::Sv32.to_field());
        assert_eq!(VmMode::Sv32, status.vm());
    }

    #[test]
    fn test_vm_field_is_warl() {
        let mut status = Status::new();
        status.set_vm(VmMode::Sv48.to_field());
        // Unsupported encodings leave the field unchanged.
        status.set_vm(7);
        assert_eq!(VmMode::Sv48, status.vm());
    }

    #[test]
    fn test_fields_do_not_alias() {
        let mut status = Status::new();
        status.set_vm(VmMode::Sv39.to_field());
        status.set_mprv(true);
        assert_eq!(VmMode::Sv39, status.vm());
        assert!(status.mprv());
    }
}
