//! Address-space regions of a profiled process, as reported by the
//! process-mapping scanner.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum NormalizeError {
    #[error("address {addr:#x} out of mapping range [{start:#x}, {limit:#x})")]
    AddressOutOfRange { addr: u64, start: u64, limit: u64 },
    #[error("base address cannot be calculated for {file}")]
    BaseAddressCannotCalculate { file: String },
}

/// One contiguous region of a process's address space, backed by a file or
/// pseudo-file (`[vdso]`, `[heap]`, `jit`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub limit: u64,
    pub offset: u64,
    pub file: String,
    pub build_id: String,
    /// Load bias resolved by the scanner from the backing object's program
    /// headers. `None` when the object gave no usable headers.
    pub base: Option<u64>,
}

impl Mapping {
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.limit
    }

    /// Converts a runtime virtual address into an address relative to the
    /// backing file.
    pub fn normalize(&self, addr: u64) -> Result<u64, NormalizeError> {
        if !self.contains(addr) {
            return Err(NormalizeError::AddressOutOfRange {
                addr,
                start: self.start,
                limit: self.limit,
            });
        }
        let base = self
            .base
            .ok_or_else(|| NormalizeError::BaseAddressCannotCalculate {
                file: self.file.clone(),
            })?;
        Ok(addr - base)
    }
}

pub type Mappings = Vec<Mapping>;

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> Mapping {
        Mapping {
            start: 0x400000,
            limit: 0x500000,
            offset: 0,
            file: "/usr/bin/app".into(),
            build_id: "abc".into(),
            base: Some(0x400000),
        }
    }

    #[test]
    fn start_is_inclusive_limit_is_exclusive() {
        let m = mapping();
        assert_eq!(m.normalize(0x400000), Ok(0));
        assert_eq!(
            m.normalize(0x500000),
            Err(NormalizeError::AddressOutOfRange {
                addr: 0x500000,
                start: 0x400000,
                limit: 0x500000,
            })
        );
    }

    #[test]
    fn missing_base_fails() {
        let m = Mapping {
            base: None,
            ..mapping()
        };
        assert!(matches!(
            m.normalize(0x401000),
            Err(NormalizeError::BaseAddressCannotCalculate { .. })
        ));
    }
}
