//! Guard predicates checked before risky state changes.

use thiserror::Error;

/// A failed guard.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("CR3 {0:#x} is not 4 KiB aligned")]
    UnalignedCr3(u64),

    #[error("CR3 {cr3:#x} points outside guest memory ({memory_size:#x} bytes)")]
    Cr3OutOfRange { cr3: u64, memory_size: u64 },

    #[error("IRQ {irq} is outside 0..{max}")]
    IrqOutOfRange { irq: u32, max: u32 },

    #[error("Guest memory descriptor at {base:#x} has zero length")]
    EmptyMemory { base: u64 },

    #[error("Guest memory descriptor {base:#x}+{len:#x} overflows the address space")]
    MemoryOverflow { base: u64, len: u64 },
}

/// Stateless predicate checks.
pub struct StateValidator;

impl StateValidator {
    /// CR3 must be page-aligned (ignoring the PCD/PWT bits).
    pub fn validate_cr3(cr3: u64) -> Result<(), ValidationError> {
        if cr3 & 0xFE7 != 0 {
            return Err(ValidationError::UnalignedCr3(cr3));
        }
        Ok(())
    }

    /// CR3 alignment plus page-table root inside guest RAM.
    pub fn validate_cr3_in(cr3: u64, memory_size: u64) -> Result<(), ValidationError> {
        Self::validate_cr3(cr3)?;
        if cr3 & !0xFFF >= memory_size {
            return Err(ValidationError::Cr3OutOfRange { cr3, memory_size });
        }
        Ok(())
    }

    /// IRQ line must be below `max` (16 for the PIC, 24 for the IOAPIC).
    pub fn validate_irq(irq: u32, max: u32) -> Result<(), ValidationError> {
        if irq >= max {
            return Err(ValidationError::IrqOutOfRange { irq, max });
        }
        Ok(())
    }

    /// A guest memory descriptor must be non-empty and not wrap.
    pub fn validate_memory(base: u64, len: u64) -> Result<(), ValidationError> {
        if len == 0 {
            return Err(ValidationError::EmptyMemory { base });
        }
        if base.checked_add(len).is_none() {
            return Err(ValidationError::MemoryOverflow { base, len });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cr3_alignment() {
        assert!(StateValidator::validate_cr3(0x1000).is_ok());
        assert!(StateValidator::validate_cr3(0x1018).is_ok()); // PWT | PCD
        assert_eq!(
            StateValidator::validate_cr3(0x1001),
            Err(ValidationError::UnalignedCr3(0x1001))
        );
    }

    #[test]
    fn test_cr3_inside_memory() {
        assert!(StateValidator::validate_cr3_in(0x1000, 0x2000).is_ok());
        assert!(matches!(
            StateValidator::validate_cr3_in(0x2000, 0x2000),
            Err(ValidationError::Cr3OutOfRange { .. })
        ));
    }

    #[test]
    fn test_irq_range() {
        assert!(StateValidator::validate_irq(15, 16).is_ok());
        assert!(StateValidator::validate_irq(16, 16).is_err());
        assert!(StateValidator::validate_irq(23, 24).is_ok());
    }

    #[test]
    fn test_memory_descriptor() {
        assert!(StateValidator::validate_memory(0, 4096).is_ok());
        assert_eq!(
            StateValidator::validate_memory(0x1000, 0),
            Err(ValidationError::EmptyMemory { base: 0x1000 })
        );
        assert!(StateValidator::validate_memory(u64::MAX, 2).is_err());
    }
}
