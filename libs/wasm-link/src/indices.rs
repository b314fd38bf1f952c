// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use cranelift_entity::entity_impl;

use crate::utils::enum_accessors;

/// Index into the module's type section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeIndex(u32);
entity_impl!(TypeIndex);

/// Index into the function index space, imported functions come first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncIndex(u32);
entity_impl!(FuncIndex);

/// Index of a function defined (not imported) by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefinedFuncIndex(u32);
entity_impl!(DefinedFuncIndex);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableIndex(u32);
entity_impl!(TableIndex);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryIndex(u32);
entity_impl!(MemoryIndex);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalIndex(u32);
entity_impl!(GlobalIndex);

/// An index into one of the module's index spaces, tagged with the space it refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityIndex {
    Function(FuncIndex),
    Table(TableIndex),
    Memory(MemoryIndex),
    Global(GlobalIndex),
}

impl EntityIndex {
    enum_accessors! {
        e
        (Function(FuncIndex) is_func get_func unwrap_func *e)
        (Table(TableIndex) is_table get_table unwrap_table *e)
        (Memory(MemoryIndex) is_memory get_memory unwrap_memory *e)
        (Global(GlobalIndex) is_global get_global unwrap_global *e)
    }
}

impl From<FuncIndex> for EntityIndex {
    fn from(value: FuncIndex) -> Self {
        Self::Function(value)
    }
}

impl From<TableIndex> for EntityIndex {
    fn from(value: TableIndex) -> Self {
        Self::Table(value)
    }
}

impl From<MemoryIndex> for EntityIndex {
    fn from(value: MemoryIndex) -> Self {
        Self::Memory(value)
    }
}

impl From<GlobalIndex> for EntityIndex {
    fn from(value: GlobalIndex) -> Self {
        Self::Global(value)
    }
}
