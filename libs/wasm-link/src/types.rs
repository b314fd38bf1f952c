// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::sync::Arc;

use crate::WASM_PAGE_SIZE;

/// The type of a WebAssembly value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => f.write_str("i32"),
            ValType::I64 => f.write_str("i64"),
            ValType::F32 => f.write_str("f32"),
            ValType::F64 => f.write_str("f64"),
        }
    }
}

/// The signature of a function.
///
/// Cloning is cheap, params and results are shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncType {
    params: Arc<[ValType]>,
    results: Arc<[ValType]>,
}

impl FuncType {
    pub fn new(
        params: impl IntoIterator<Item = ValType>,
        results: impl IntoIterator<Item = ValType>,
    ) -> Self {
        Self {
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
        }
    }

    /// The `[] -> []` signature start functions must have.
    pub fn empty() -> Self {
        Self::new([], [])
    }

    #[inline]
    pub fn params(&self) -> &[ValType] {
        &self.params
    }

    #[inline]
    pub fn results(&self) -> &[ValType] {
        &self.results
    }
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(func")?;
        if !self.params.is_empty() {
            f.write_str(" (param")?;
            for param in self.params.iter() {
                write!(f, " {param}")?;
            }
            f.write_str(")")?;
        }
        if !self.results.is_empty() {
            f.write_str(" (result")?;
            for result in self.results.iter() {
                write!(f, " {result}")?;
            }
            f.write_str(")")?;
        }
        f.write_str(")")
    }
}

/// Whether a global can be written after initialization.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Mutability {
    Const,
    Var,
}

/// The value types a global can hold.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum GlobalValType {
    I32,
    F32,
    F64,
}

impl From<GlobalValType> for ValType {
    fn from(value: GlobalValType) -> Self {
        match value {
            GlobalValType::I32 => ValType::I32,
            GlobalValType::F32 => ValType::F32,
            GlobalValType::F64 => ValType::F64,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct GlobalType {
    pub content: GlobalValType,
    pub mutability: Mutability,
}

impl GlobalType {
    pub fn new(content: GlobalValType, mutability: Mutability) -> Self {
        Self {
            content,
            mutability,
        }
    }
}

/// The limits of a funcref table, in elements.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TableType {
    pub minimum: u32,
    pub maximum: Option<u32>,
}

impl TableType {
    pub fn new(minimum: u32, maximum: Option<u32>) -> Self {
        Self { minimum, maximum }
    }
}

/// The limits of a linear memory, in WebAssembly pages.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MemoryType {
    pub minimum: u32,
    pub maximum: Option<u32>,
}

impl MemoryType {
    pub fn new(minimum: u32, maximum: Option<u32>) -> Self {
        Self { minimum, maximum }
    }

    /// The initial size of the memory in bytes.
    ///
    /// # Panics
    ///
    /// Panics if the size does not fit the host address space.
    pub fn minimum_byte_size(&self) -> usize {
        usize::try_from(self.minimum)
            .ok()
            .and_then(|pages| pages.checked_mul(WASM_PAGE_SIZE))
            .expect("memory size overflows the host address space")
    }
}
