// Copyright 2026 the Stepstack Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Accessor for the packed executable image.
//!
//! An image is a read-only byte slice supplied by the embedder:
//!
//! ```text
//! offset 0: vm_version            u8
//! offset 1: size                  u16 le  (bytes after this field)
//! offset 3: functions_count       u8
//! offset 4: constants_count       u8
//! offset 5: main_variables_count  u8
//! then:     functions, 5 bytes each
//! then:     constants, one cell each
//! then:     code until end of image
//! ```
//!
//! `size` covers the three count bytes, the function table, the constant
//! pool, and the code. [`Image::parse`] validates the header and locates the
//! three regions; it never reinterprets memory.

use core::fmt;

use crate::cell::{CELL_BYTES, Cell};
use crate::format::Reader;

/// The VM version this crate executes. Images must match exactly.
pub const VM_VERSION: u8 = 1;

/// Bytes of one packed function record.
pub const FUNCTION_RECORD_BYTES: usize = 5;

/// Fixed header bytes preceding the region covered by the `size` field.
const HEADER_FIXED: usize = 3;

/// Count bytes included in the `size` field.
const COUNT_BYTES: usize = 3;

/// An image rejected by [`Image::parse`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageError {
    /// The `size` field disagrees with the byte count, or the declared
    /// tables do not fit inside it.
    WrongSize,
    /// The image requires a different VM version.
    WrongVersion,
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongSize => write!(f, "image size mismatch"),
            Self::WrongVersion => write!(f, "unsupported image version"),
        }
    }
}

impl core::error::Error for ImageError {}

/// A decoded function descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FunctionDesc {
    /// Code offset of the function body, or a builtin-table index when
    /// `is_built_in` is set.
    pub address: u16,
    /// Declared (non-variadic) argument count.
    pub arguments_count: u8,
    /// Local variable count, zero-initialized on entry.
    pub variables_count: u8,
    /// Return value count (6-bit field).
    pub returns_count: u8,
    /// Whether an extra argument count is popped at every call site.
    pub is_variadic: bool,
    /// Whether `address` indexes the host builtin table.
    pub is_built_in: bool,
}

impl FunctionDesc {
    fn decode(record: &[u8]) -> Self {
        let packed = record[4];
        Self {
            address: u16::from_le_bytes([record[0], record[1]]),
            arguments_count: record[2],
            variables_count: record[3],
            returns_count: packed & 0x3F,
            is_variadic: packed & 0x40 != 0,
            is_built_in: packed & 0x80 != 0,
        }
    }
}

/// A validated, borrowed view of a packed executable image.
#[derive(Clone, Copy, Debug)]
pub struct Image<'a> {
    functions_count: u8,
    constants_count: u8,
    main_variables_count: u8,
    functions: &'a [u8],
    constants: &'a [u8],
    code: &'a [u8],
}

impl<'a> Image<'a> {
    /// Parses and validates `bytes` as an executable image.
    ///
    /// The size check runs before the version check, so a truncated image
    /// reports [`ImageError::WrongSize`] regardless of its version byte.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ImageError> {
        let mut r = Reader::new(bytes);
        let version = r.read_u8().map_err(|_| ImageError::WrongSize)?;
        let size = r.read_u16_le().map_err(|_| ImageError::WrongSize)?;
        if usize::from(size) != bytes.len() - HEADER_FIXED {
            return Err(ImageError::WrongSize);
        }
        if version != VM_VERSION {
            return Err(ImageError::WrongVersion);
        }

        let functions_count = r.read_u8().map_err(|_| ImageError::WrongSize)?;
        let constants_count = r.read_u8().map_err(|_| ImageError::WrongSize)?;
        let main_variables_count = r.read_u8().map_err(|_| ImageError::WrongSize)?;

        let table_len = usize::from(functions_count) * FUNCTION_RECORD_BYTES;
        let pool_len = usize::from(constants_count) * CELL_BYTES;
        if usize::from(size) < COUNT_BYTES + table_len + pool_len {
            return Err(ImageError::WrongSize);
        }
        let functions = r.read_bytes(table_len).map_err(|_| ImageError::WrongSize)?;
        let constants = r.read_bytes(pool_len).map_err(|_| ImageError::WrongSize)?;
        let code = r.rest();

        Ok(Self {
            functions_count,
            constants_count,
            main_variables_count,
            functions,
            constants,
            code,
        })
    }

    /// Validates `bytes` without keeping the parsed view.
    pub fn check(bytes: &[u8]) -> Result<(), ImageError> {
        Image::parse(bytes).map(|_| ())
    }

    /// Number of entries in the function table.
    #[must_use]
    pub fn functions_count(&self) -> u8 {
        self.functions_count
    }

    /// Number of entries in the constant pool.
    #[must_use]
    pub fn constants_count(&self) -> u8 {
        self.constants_count
    }

    /// Locals reserved for the implicit main frame.
    #[must_use]
    pub fn main_variables_count(&self) -> u8 {
        self.main_variables_count
    }

    /// Returns the function descriptor at `index`, if in range.
    #[must_use]
    pub fn function(&self, index: u8) -> Option<FunctionDesc> {
        if index >= self.functions_count {
            return None;
        }
        let start = usize::from(index) * FUNCTION_RECORD_BYTES;
        self.functions
            .get(start..start + FUNCTION_RECORD_BYTES)
            .map(FunctionDesc::decode)
    }

    /// Returns the constant at `index`, if in range.
    #[must_use]
    pub fn constant(&self, index: u8) -> Option<Cell> {
        if index >= self.constants_count {
            return None;
        }
        let start = usize::from(index) * CELL_BYTES;
        let mut r = Reader::new(self.constants.get(start..start + CELL_BYTES)?);
        r.read_cell().ok()
    }

    /// The flat code section.
    #[must_use]
    pub fn code(&self) -> &'a [u8] {
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Writer;
    use alloc::vec::Vec;

    fn image_bytes(functions: &[[u8; 5]], constants: &[Cell], main_vars: u8, code: &[u8]) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u8(VM_VERSION);
        w.write_u16_le(0);
        w.write_u8(functions.len() as u8);
        w.write_u8(constants.len() as u8);
        w.write_u8(main_vars);
        for record in functions {
            w.write_bytes(record);
        }
        for &c in constants {
            w.write_cell(c);
        }
        w.write_bytes(code);
        let mut bytes = w.into_vec();
        let size = (bytes.len() - 3) as u16;
        bytes[1..3].copy_from_slice(&size.to_le_bytes());
        bytes
    }

    #[test]
    fn parse_locates_all_regions() {
        let bytes = image_bytes(
            &[[0x34, 0x12, 2, 3, 0x81]],
            &[-7, 9],
            4,
            &[0x00, 0x01, 0x02],
        );
        let image = Image::parse(&bytes).unwrap();
        assert_eq!(image.functions_count(), 1);
        assert_eq!(image.constants_count(), 2);
        assert_eq!(image.main_variables_count(), 4);
        assert_eq!(image.code(), &[0x00, 0x01, 0x02]);
        assert_eq!(image.constant(0), Some(-7));
        assert_eq!(image.constant(1), Some(9));
        assert_eq!(image.constant(2), None);
    }

    #[test]
    fn function_descriptor_unpacks_flag_byte() {
        let bytes = image_bytes(&[[0x05, 0x00, 2, 1, 0x40 | 0x80 | 3]], &[], 0, &[]);
        let image = Image::parse(&bytes).unwrap();
        let f = image.function(0).unwrap();
        assert_eq!(f.address, 5);
        assert_eq!(f.arguments_count, 2);
        assert_eq!(f.variables_count, 1);
        assert_eq!(f.returns_count, 3);
        assert!(f.is_variadic);
        assert!(f.is_built_in);
        assert_eq!(image.function(1), None);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let mut bytes = image_bytes(&[], &[], 0, &[0x00]);
        let size = u16::from_le_bytes([bytes[1], bytes[2]]);
        bytes[1..3].copy_from_slice(&(size + 1).to_le_bytes());
        assert!(matches!(Image::parse(&bytes), Err(ImageError::WrongSize)));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut bytes = image_bytes(&[], &[], 0, &[]);
        bytes[0] = VM_VERSION + 1;
        assert!(matches!(Image::parse(&bytes), Err(ImageError::WrongVersion)));
    }

    #[test]
    fn declared_tables_must_fit_in_size() {
        // One function declared but no record bytes present.
        let mut w = Writer::new();
        w.write_u8(VM_VERSION);
        w.write_u16_le(3);
        w.write_u8(1);
        w.write_u8(0);
        w.write_u8(0);
        assert!(matches!(
            Image::parse(w.as_slice()),
            Err(ImageError::WrongSize)
        ));
    }

    #[test]
    fn truncated_header_is_a_size_error() {
        assert!(matches!(Image::parse(&[VM_VERSION]), Err(ImageError::WrongSize)));
        assert!(matches!(Image::check(&[]), Err(ImageError::WrongSize)));
    }
}
