// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::indices::FuncIndex;
use crate::trap::Trap;

/// Errors caused by the contents of a module or by the code it runs.
///
/// Internal invariant violations (linking twice, data segments without a memory, etc.) are
/// not represented here, they panic.
#[derive(Debug)]
pub enum Error {
    /// A segment initializer does not fit the table or memory it targets.
    Range(RangeError),
    /// Compiled code trapped, e.g. while running the start function.
    Trap(Trap),
    /// A function was called with arguments or result slots not matching its signature.
    TypeMismatch(String),
    /// The instance owning a function has already been dropped.
    InstanceDropped {
        /// The index of the function that was called.
        func_index: FuncIndex,
    },
}

/// A segment initializer failed its bounds check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    /// An element segment writes past the end of the table.
    ElementOutOfBounds {
        /// The first table slot the segment writes.
        offset: u32,
        /// The number of functions in the segment.
        len: usize,
        /// The current size of the table.
        table_size: u32,
    },
    /// An element segment refers to an imported function, which is not supported yet.
    TableInitWithImport {
        /// The imported function.
        func_index: FuncIndex,
    },
    /// A data segment is larger than the whole memory.
    DataSegmentTooBig {
        memory_size: usize,
        segment_size: usize,
        offset: u32,
    },
    /// A data segment fits the memory but not at its offset.
    DataSegmentOutOfBounds {
        memory_size: usize,
        segment_size: usize,
        offset: u32,
    },
}

impl Error {
    /// Returns `true` if this is a range error, the kind embedders surface as a `RangeError`.
    pub fn is_range_error(&self) -> bool {
        matches!(self, Self::Range(_))
    }

    pub fn as_trap(&self) -> Option<Trap> {
        if let Self::Trap(trap) = self {
            Some(*trap)
        } else {
            None
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range(err) => fmt::Display::fmt(err, f),
            Self::Trap(trap) => f.write_fmt(format_args!("wasm trap: {trap}")),
            Self::TypeMismatch(message) => f.write_fmt(format_args!("type mismatch: {message}")),
            Self::InstanceDropped { func_index } => f.write_fmt(format_args!(
                "instance of function {func_index:?} has already been dropped"
            )),
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Range(err) => Some(err),
            Self::Trap(trap) => Some(trap),
            Self::TypeMismatch(_) | Self::InstanceDropped { .. } => None,
        }
    }
}

impl From<RangeError> for Error {
    fn from(err: RangeError) -> Self {
        Self::Range(err)
    }
}

impl From<Trap> for Error {
    fn from(trap: Trap) -> Self {
        Self::Trap(trap)
    }
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ElementOutOfBounds {
                offset,
                len,
                table_size,
            } => f.write_fmt(format_args!(
                "element segment writes an out-of-bounds table index: {len} elements at offset {offset}, table size {table_size}"
            )),
            Self::TableInitWithImport { func_index } => f.write_fmt(format_args!(
                "element segment initializes the table with imported function {func_index:?}, which is not supported"
            )),
            Self::DataSegmentTooBig {
                memory_size,
                segment_size,
                offset,
            } => f.write_fmt(format_args!(
                "invalid data segment initialization: segment of {segment_size} bytes, memory of {memory_size} bytes, at offset {offset}: segment is too big"
            )),
            Self::DataSegmentOutOfBounds {
                memory_size,
                segment_size,
                offset,
            } => f.write_fmt(format_args!(
                "invalid data segment initialization: segment of {segment_size} bytes, memory of {memory_size} bytes, at offset {offset}: segment writes outside of memory"
            )),
        }
    }
}

impl core::error::Error for RangeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_segment_message_names_all_sizes() {
        let err = Error::from(RangeError::DataSegmentOutOfBounds {
            memory_size: 10,
            segment_size: 5,
            offset: 6,
        });
        assert!(err.is_range_error());

        let message = err.to_string();
        assert!(message.contains("segment of 5 bytes"));
        assert!(message.contains("memory of 10 bytes"));
        assert!(message.contains("at offset 6"));
    }

    #[test]
    fn traps_are_not_range_errors() {
        let err = Error::from(Trap::UnreachableCodeReached);
        assert!(!err.is_range_error());
        assert_eq!(err.as_trap(), Some(Trap::UnreachableCodeReached));
        assert_eq!(err.to_string(), "wasm trap: unreachable code executed");
    }
}
