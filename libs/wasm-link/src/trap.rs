// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Why compiled code stopped running.
///
/// Code generators encode traps as small integer codes in their machine code, a
/// [`Trampoline`](crate::Trampoline) maps those back onto these kinds with
/// [`Trap::from_code`] before reporting them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Trap {
    UnreachableCodeReached = 1,
    StackOverflow = 2,
    MemoryOutOfBounds = 3,
    TableOutOfBounds = 4,
    /// `call_indirect` through a table slot that was never initialized.
    IndirectCallToNull = 5,
    /// `call_indirect` to a function of a different signature.
    BadSignature = 6,
    IntegerDivisionByZero = 7,
    /// `i32.div_s` / `i64.div_s` of the minimum value by `-1`.
    IntegerOverflow = 8,
    /// A float-to-int truncation of NaN or an out of range value.
    BadConversionToInteger = 9,
    /// A host function called by the module failed.
    HostError = 10,
}

impl Trap {
    const ALL: [Trap; 10] = [
        Trap::UnreachableCodeReached,
        Trap::StackOverflow,
        Trap::MemoryOutOfBounds,
        Trap::TableOutOfBounds,
        Trap::IndirectCallToNull,
        Trap::BadSignature,
        Trap::IntegerDivisionByZero,
        Trap::IntegerOverflow,
        Trap::BadConversionToInteger,
        Trap::HostError,
    ];

    /// Returns the trap encoded as `code`, or `None` if `code` is not a trap code.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|trap| trap.code() == code)
    }

    /// The code generated machine code uses for this trap.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Trap::UnreachableCodeReached => "unreachable code executed",
            Trap::StackOverflow => "call stack exhausted",
            Trap::MemoryOutOfBounds => "linear memory access out of bounds",
            Trap::TableOutOfBounds => "table access out of bounds",
            Trap::IndirectCallToNull => "indirect call to a null table slot",
            Trap::BadSignature => "indirect call with mismatched signature",
            Trap::IntegerDivisionByZero => "integer division by zero",
            Trap::IntegerOverflow => "integer overflow",
            Trap::BadConversionToInteger => "float to integer conversion out of range",
            Trap::HostError => "host function failed",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for Trap {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for trap in Trap::ALL {
            assert_eq!(Trap::from_code(trap.code()), Some(trap));
        }
        assert_eq!(Trap::from_code(0), None);
        assert_eq!(Trap::from_code(11), None);
    }
}
