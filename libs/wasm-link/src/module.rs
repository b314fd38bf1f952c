// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use anyhow::{Context, ensure};
use cranelift_entity::{EntityRef, PrimaryMap};
use exec_alloc::{JitCompilationEffort, OwnerTag};

use crate::code_object::{CodeObject, FunctionLoc};
use crate::engine::Engine;
use crate::func::EntryPoint;
use crate::indices::{
    DefinedFuncIndex, EntityIndex, FuncIndex, GlobalIndex, MemoryIndex, TableIndex, TypeIndex,
};
use crate::types::{FuncType, GlobalType, MemoryType, TableType};
use crate::values::Val;

/// The validated description of a module.
///
/// The function index space starts with the imported functions, in import order, followed
/// by the functions the module defines. Only functions can be imported.
#[derive(Debug, Clone, Default)]
pub struct ModuleInfo {
    pub name: Option<String>,
    pub types: PrimaryMap<TypeIndex, FuncType>,
    pub imports: Vec<Import>,
    pub functions: PrimaryMap<FuncIndex, TypeIndex>,
    pub table: Option<TableType>,
    pub memory: Option<MemoryType>,
    pub globals: PrimaryMap<GlobalIndex, Global>,
    pub exports: Vec<Export>,
    pub start: Option<FuncIndex>,
    pub elements: Vec<ElementSegment>,
    pub data: Vec<DataSegment>,
}

/// An imported function.
#[derive(Debug, Clone)]
pub struct Import {
    pub module: String,
    pub field: String,
    pub ty: TypeIndex,
}

/// A global defined by the module together with its constant initial value.
#[derive(Debug, Clone, Copy)]
pub struct Global {
    pub ty: GlobalType,
    pub init: Val,
}

#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub index: EntityIndex,
}

/// An active element segment, writing `functions` into the table starting at `offset`.
#[derive(Debug, Clone)]
pub struct ElementSegment {
    pub table_index: TableIndex,
    pub offset: u32,
    pub functions: Box<[FuncIndex]>,
}

/// An active data segment, copying `data` into linear memory starting at `offset`.
#[derive(Debug, Clone)]
pub struct DataSegment {
    pub memory_index: MemoryIndex,
    pub offset: u32,
    pub data: Box<[u8]>,
}

// ===== impl ModuleInfo =====

impl ModuleInfo {
    pub fn push_type(&mut self, ty: FuncType) -> TypeIndex {
        self.types.push(ty)
    }

    /// Adds an imported function.
    ///
    /// # Panics
    ///
    /// Panics if the module already defines functions, imports must come first.
    pub fn push_import(
        &mut self,
        module: impl Into<String>,
        field: impl Into<String>,
        ty: TypeIndex,
    ) -> FuncIndex {
        assert_eq!(
            self.functions.len(),
            self.imports.len(),
            "imports must precede defined functions"
        );
        self.imports.push(Import {
            module: module.into(),
            field: field.into(),
            ty,
        });
        self.functions.push(ty)
    }

    /// Adds a function defined by this module.
    pub fn push_function(&mut self, ty: TypeIndex) -> FuncIndex {
        self.functions.push(ty)
    }

    pub fn push_global(&mut self, ty: GlobalType, init: Val) -> GlobalIndex {
        self.globals.push(Global { ty, init })
    }

    pub fn push_export(&mut self, name: impl Into<String>, index: impl Into<EntityIndex>) {
        self.exports.push(Export {
            name: name.into(),
            index: index.into(),
        });
    }

    /// The number of imported functions, which is also the first defined function's index.
    pub fn num_imported_functions(&self) -> usize {
        self.imports.len()
    }

    pub fn num_defined_functions(&self) -> usize {
        self.functions.len() - self.num_imported_functions()
    }

    #[inline]
    pub fn is_imported_function(&self, index: FuncIndex) -> bool {
        index.index() < self.num_imported_functions()
    }

    /// Converts a function index into a defined function index, or `None` for imports.
    pub fn defined_func_index(&self, index: FuncIndex) -> Option<DefinedFuncIndex> {
        index
            .index()
            .checked_sub(self.num_imported_functions())
            .map(DefinedFuncIndex::new)
    }

    pub fn func_index(&self, index: DefinedFuncIndex) -> FuncIndex {
        FuncIndex::new(self.num_imported_functions() + index.index())
    }

    /// Returns the signature of the function at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn func_type(&self, index: FuncIndex) -> &FuncType {
        &self.types[self.functions[index]]
    }
}

/// A module whose code has been published into executable memory.
///
/// Cloning is cheap, all clones refer to the same module.
#[derive(Debug, Clone)]
pub struct Module(Arc<ModuleInner>);

#[derive(Debug)]
struct ModuleInner {
    id: u64,
    engine: Engine,
    info: ModuleInfo,
    code: CodeObject,
    function_locs: PrimaryMap<DefinedFuncIndex, FunctionLoc>,
}

// ===== impl Module =====

impl Module {
    /// Publishes the compiled `text` of a module described by `info`.
    ///
    /// `function_locs` locates the machine code of every defined function within `text`.
    ///
    /// # Errors
    ///
    /// Returns an error if the function locations don't match the module's functions or
    /// the text, or if no executable memory is available.
    pub fn new(
        engine: &Engine,
        info: ModuleInfo,
        text: &[u8],
        function_locs: PrimaryMap<DefinedFuncIndex, FunctionLoc>,
    ) -> crate::Result<Self> {
        ensure!(
            function_locs.len() == info.num_defined_functions(),
            "module defines {} functions, but {} function locations were provided",
            info.num_defined_functions(),
            function_locs.len()
        );

        let id = engine.next_module_id();
        let code = CodeObject::new(
            engine.allocator(),
            text,
            OwnerTag(id),
            JitCompilationEffort::CanFail,
        )
        .context("failed to publish module code")?;

        for (index, loc) in &function_locs {
            ensure!(
                code.contains_loc(*loc),
                "function {index:?} at {loc:?} lies outside of the module's text ({} bytes)",
                text.len()
            );
        }

        tracing::debug!(
            id,
            name = ?info.name,
            functions = info.functions.len(),
            exports = info.exports.len(),
            "created module"
        );

        Ok(Self(Arc::new(ModuleInner {
            id,
            engine: engine.clone(),
            info,
            code,
            function_locs,
        })))
    }

    /// The module's id, unique per engine. Used as the owner of its executable memory.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn name(&self) -> Option<&str> {
        self.0.info.name.as_deref()
    }

    pub fn engine(&self) -> &Engine {
        &self.0.engine
    }

    pub fn info(&self) -> &ModuleInfo {
        &self.0.info
    }

    pub fn code(&self) -> &CodeObject {
        &self.0.code
    }

    pub fn function_loc(&self, index: DefinedFuncIndex) -> FunctionLoc {
        self.0.function_locs[index]
    }

    /// Returns the compiled entry point of the function at `index`, or `None` if the
    /// function is imported.
    pub fn entry_point(&self, index: FuncIndex) -> Option<EntryPoint> {
        let def_index = self.0.info.defined_func_index(index)?;
        let loc = self.function_loc(def_index);

        Some(EntryPoint {
            address: self.0.code.resolve_function_loc(loc),
            loc,
        })
    }

    /// Returns the signature of the function at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn signature(&self, index: FuncIndex) -> &FuncType {
        self.0.info.func_type(index)
    }

    pub fn ptr_eq(lhs: &Self, rhs: &Self) -> bool {
        Arc::ptr_eq(&lhs.0, &rhs.0)
    }
}
