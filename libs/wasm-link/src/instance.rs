// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::sync::Arc;

use cranelift_entity::PrimaryMap;
use parking_lot::RwLock;

use crate::indices::GlobalIndex;
use crate::memory::Memory;
use crate::module::Module;
use crate::table::Table;
use crate::values::Val;

/// One instantiation of a [`Module`].
///
/// Tables and memories are sized per the module's declarations but not yet initialized,
/// that happens when the instance's [`ModuleRecord`](crate::ModuleRecord) is evaluated.
pub struct Instance {
    module: Module,
    table: Option<Arc<Table>>,
    memory: Option<Arc<Memory>>,
    globals: RwLock<PrimaryMap<GlobalIndex, Val>>,
}

// ===== impl Instance =====

impl Instance {
    /// Creates an instance of `module` with a fresh table and memory as declared, and
    /// globals set to their initial values.
    ///
    /// # Panics
    ///
    /// Panics if the declared memory does not fit the host address space.
    pub fn new(module: &Module) -> Arc<Self> {
        let info = module.info();
        let table = info.table.map(|ty| Arc::new(Table::new(ty)));
        let memory = info.memory.map(|ty| Arc::new(Memory::new(ty)));

        Self::from_parts(module, table, memory)
    }

    /// Creates an instance of `module` around an already constructed table and memory.
    pub fn from_parts(
        module: &Module,
        table: Option<Arc<Table>>,
        memory: Option<Arc<Memory>>,
    ) -> Arc<Self> {
        let globals = module
            .info()
            .globals
            .values()
            .map(|global| global.init)
            .collect();

        tracing::debug!(module = module.id(), ?table, ?memory, "created instance");

        Arc::new(Self {
            module: module.clone(),
            table,
            memory,
            globals: RwLock::new(globals),
        })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn table(&self) -> Option<&Arc<Table>> {
        self.table.as_ref()
    }

    pub fn memory(&self) -> Option<&Arc<Memory>> {
        self.memory.as_ref()
    }

    /// Returns the current value of the global at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn load_global(&self, index: GlobalIndex) -> Val {
        self.globals.read()[index]
    }

    /// Overwrites the global at `index`.
    ///
    /// Mutability is not checked here, it is a property of the code writing the global.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds or `val` has the wrong type.
    pub fn store_global(&self, index: GlobalIndex, val: Val) {
        let ty = self.module.info().globals[index].ty;
        assert!(
            val.matches_global_ty(ty.content),
            "cannot store {:?} into global {index:?} of type {:?}",
            val.ty(),
            ty.content
        );
        self.globals.write()[index] = val;
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("module", &self.module.id())
            .field("table", &self.table)
            .field("memory", &self.memory)
            .field("globals", &self.globals.read().len())
            .finish()
    }
}
