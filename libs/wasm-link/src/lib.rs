// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Linking and evaluation of compiled WebAssembly modules.
//!
//! A [`Module`] is the validated description of a module ([`ModuleInfo`]) together with its
//! machine code, published into executable memory from an [`exec_alloc::ExecutableAllocator`].
//! Instantiating it happens in three steps:
//!
//! 1. [`Instance::new`] allocates the table, memory and globals.
//! 2. [`ModuleRecord::link`] resolves every export into the record's [`ExportEnvironment`]
//!    and finds the start function, without running any code.
//! 3. [`ModuleRecord::evaluate`] applies element and data segments and runs the start
//!    function.
//!
//! Code is never entered directly, all calls go through the engine's [`Trampoline`].

mod code_object;
mod engine;
mod environment;
mod errors;
mod func;
mod indices;
mod instance;
mod memory;
mod module;
mod record;
mod table;
mod trap;
mod types;
mod utils;
mod values;

use std::sync::Arc;

pub use code_object::{CodeObject, FunctionLoc};
pub use engine::{Engine, Trampoline};
pub use environment::ExportEnvironment;
pub use errors::{Error, RangeError};
pub use func::{EntryPoint, Func};
pub use indices::{
    DefinedFuncIndex, EntityIndex, FuncIndex, GlobalIndex, MemoryIndex, TableIndex, TypeIndex,
};
pub use instance::Instance;
pub use memory::{Memory, MemoryAccessError};
pub use module::{DataSegment, ElementSegment, Export, Global, Import, Module, ModuleInfo};
pub use record::ModuleRecord;
pub use table::Table;
pub use trap::Trap;
pub use types::{
    FuncType, GlobalType, GlobalValType, MemoryType, Mutability, TableType, ValType,
};
pub use values::Val;

use crate::utils::{enum_accessors, owned_enum_accessors};

pub type Result<T> = anyhow::Result<T>;

/// The size of a WebAssembly page in bytes.
pub const WASM_PAGE_SIZE: usize = 0x10000;

/// A value exported from an instance.
#[derive(Debug, Clone)]
pub enum Extern {
    Func(Func),
    Table(Arc<Table>),
    Memory(Arc<Memory>),
    /// The value of an immutable global, captured at link time.
    Global(Val),
}

// ===== impl Extern =====

impl Extern {
    enum_accessors! {
        e
        (Func(&Func) is_func func unwrap_func e)
        (Table(&Arc<Table>) is_table table unwrap_table e)
        (Memory(&Arc<Memory>) is_memory memory unwrap_memory e)
        (Global(Val) is_global global unwrap_global *e)
    }

    owned_enum_accessors! {
        e
        (Func(Func) into_func e)
        (Table(Arc<Table>) into_table e)
        (Memory(Arc<Memory>) into_memory e)
        (Global(Val) into_global e)
    }
}

impl From<Func> for Extern {
    fn from(func: Func) -> Self {
        Self::Func(func)
    }
}

impl From<Arc<Table>> for Extern {
    fn from(table: Arc<Table>) -> Self {
        Self::Table(table)
    }
}

impl From<Arc<Memory>> for Extern {
    fn from(memory: Arc<Memory>) -> Self {
        Self::Memory(memory)
    }
}

impl From<Val> for Extern {
    fn from(val: Val) -> Self {
        Self::Global(val)
    }
}
