// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::sync::Arc;

use cranelift_entity::EntityRef;
use hashbrown::HashMap;
use hashbrown::hash_map::Entry;
use smallvec::SmallVec;

use crate::Extern;
use crate::environment::ExportEnvironment;
use crate::errors::{Error, RangeError};
use crate::func::Func;
use crate::indices::{EntityIndex, FuncIndex};
use crate::instance::Instance;
use crate::memory::Memory;
use crate::module::{DataSegment, ElementSegment, Module};
use crate::types::{GlobalValType, Mutability};
use crate::values::Val;

/// The linker's state for one instance of a module.
///
/// A record goes through two phases. [`ModuleRecord::link`] binds the instance and resolves
/// every export without running any module code, [`ModuleRecord::evaluate`] then applies
/// the element and data segments and runs the start function.
pub struct ModuleRecord {
    key: Arc<str>,
    module: Module,
    export_entries: Box<[Arc<str>]>,
    environment: ExportEnvironment,
    instance: Option<Arc<Instance>>,
    start_function: Option<Func>,
    /// Wrappers created so far, so that every function index maps to exactly one `Func`.
    wrappers: HashMap<FuncIndex, Func>,
    evaluated: bool,
}

// ===== impl ModuleRecord =====

impl ModuleRecord {
    /// Creates an unlinked record for `module`, identified by `key` in the embedder's
    /// module map.
    pub fn new(key: impl Into<Arc<str>>, module: &Module) -> Self {
        let export_entries = module
            .info()
            .exports
            .iter()
            .map(|export| Arc::from(export.name.as_str()))
            .collect();

        Self {
            key: key.into(),
            module: module.clone(),
            export_entries,
            environment: ExportEnvironment::new(),
            instance: None,
            start_function: None,
            wrappers: HashMap::new(),
            evaluated: false,
        }
    }

    /// Binds `instance` to this record and resolves the module's exports.
    ///
    /// # Panics
    ///
    /// Panics if the record is already linked, if `instance` belongs to a different module,
    /// or if the module violates an invariant the validator guarantees, such as exporting a
    /// table it doesn't have. Re-exporting an imported function and an imported start
    /// function are not supported and panic as well.
    #[tracing::instrument(level = "debug", skip_all, fields(key = %self.key))]
    pub fn link(&mut self, instance: &Arc<Instance>) {
        assert!(self.instance.is_none(), "module `{}` already linked", self.key);
        assert!(
            Module::ptr_eq(instance.module(), &self.module),
            "instance of module {} cannot be linked into the record of module {}",
            instance.module().id(),
            self.module.id()
        );

        let module = self.module.clone();
        let info = module.info();
        let mut environment = ExportEnvironment::new();

        for export in &info.exports {
            let item = match export.index {
                EntityIndex::Function(index) => {
                    assert!(
                        !info.is_imported_function(index),
                        "re-exporting an import is not implemented (export `{}`)",
                        export.name
                    );

                    let func = self.wrapper(instance, index, Some(export.name.as_str()));
                    if info.start == Some(index) {
                        self.start_function = Some(func.clone());
                    }
                    Extern::Func(func)
                }
                EntityIndex::Table(index) => {
                    assert_eq!(index.index(), 0, "only a single table is supported");
                    let table = instance.table().unwrap_or_else(|| {
                        panic!("export `{}` refers to a missing table", export.name)
                    });
                    Extern::Table(table.clone())
                }
                EntityIndex::Memory(index) => {
                    assert_eq!(index.index(), 0, "only a single memory is supported");
                    let memory = instance.memory().unwrap_or_else(|| {
                        panic!("export `{}` refers to a missing memory", export.name)
                    });
                    Extern::Memory(memory.clone())
                }
                EntityIndex::Global(index) => {
                    let ty = info.globals[index].ty;
                    assert_eq!(
                        ty.mutability,
                        Mutability::Const,
                        "exporting mutable global `{}` is not supported",
                        export.name
                    );

                    let val = match (ty.content, instance.load_global(index)) {
                        (GlobalValType::I32, Val::I32(v)) => Val::I32(v),
                        (GlobalValType::F32, Val::F32(bits)) => Val::F32(bits),
                        (GlobalValType::F64, Val::F64(bits)) => Val::F64(bits),
                        (content, val) => {
                            panic!("global {index:?} of type {content:?} holds {val:?}")
                        }
                    };
                    Extern::Global(val)
                }
            };

            tracing::trace!(name = %export.name, ?item, "resolved export");

            if let Err(err) = environment.insert(Arc::from(export.name.as_str()), item) {
                panic!("failed to define export `{}`: {err}", export.name);
            }
        }

        if let Some(start) = info.start {
            assert!(
                !info.is_imported_function(start),
                "an imported start function is not supported"
            );
            if self.start_function.is_none() {
                self.start_function = Some(self.wrapper(instance, start, None));
            }
        }

        self.environment = environment;
        self.instance = Some(instance.clone());

        tracing::debug!(
            exports = self.environment.len(),
            has_start = self.start_function.is_some(),
            "linked module"
        );
    }

    /// Initializes the table and memory of the linked instance, then runs its start
    /// function.
    ///
    /// Segments are applied in order. If one fails its bounds check, the segments before it
    /// stay applied and nothing after it runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Range`] if a segment doesn't fit its table or memory, or if an
    /// element segment refers to an imported function. Returns [`Error::Trap`] if the start
    /// function traps.
    ///
    /// # Panics
    ///
    /// Panics if the record isn't linked yet or was already evaluated, and if the module
    /// has data segments but no memory.
    #[tracing::instrument(level = "debug", skip_all, fields(key = %self.key))]
    pub fn evaluate(&mut self) -> Result<(), Error> {
        let instance = self
            .instance
            .clone()
            .unwrap_or_else(|| panic!("module `{}` must be linked before evaluation", self.key));
        assert!(!self.evaluated, "module `{}` already evaluated", self.key);
        self.evaluated = true;

        let module = self.module.clone();
        let info = module.info();

        for segment in &info.elements {
            self.initialize_elements(&instance, segment)?;
        }

        if !info.data.is_empty() {
            let memory = instance
                .memory()
                .unwrap_or_else(|| panic!("module `{}` has data segments but no memory", self.key));
            for segment in &info.data {
                Self::initialize_data(memory, segment)?;
            }
        }

        if let Some(start) = &self.start_function {
            tracing::debug!(func = ?start, "running start function");
            start.call(&[], &mut [])?;
        }

        Ok(())
    }

    fn initialize_elements(
        &mut self,
        instance: &Arc<Instance>,
        segment: &ElementSegment,
    ) -> Result<(), Error> {
        if segment.functions.is_empty() {
            return Ok(());
        }

        assert_eq!(
            segment.table_index.index(),
            0,
            "only a single table is supported"
        );
        let table = instance
            .table()
            .unwrap_or_else(|| panic!("module `{}` has element segments but no table", self.key));

        let table_size = table.size();
        let fits = u32::try_from(segment.functions.len())
            .ok()
            .and_then(|len| segment.offset.checked_add(len))
            .is_some_and(|end| end <= table_size);
        if !fits {
            return Err(RangeError::ElementOutOfBounds {
                offset: segment.offset,
                len: segment.functions.len(),
                table_size,
            }
            .into());
        }

        let info = instance.module().info();
        if let Some(func_index) = segment
            .functions
            .iter()
            .copied()
            .find(|index| info.is_imported_function(*index))
        {
            return Err(RangeError::TableInitWithImport { func_index }.into());
        }

        let funcs: SmallVec<[Func; 8]> = segment
            .functions
            .iter()
            .map(|index| self.wrapper(instance, *index, None))
            .collect();

        tracing::trace!(
            offset = segment.offset,
            len = funcs.len(),
            "initializing table elements"
        );

        table.init_func(segment.offset, funcs.into_iter())?;
        Ok(())
    }

    fn initialize_data(memory: &Memory, segment: &DataSegment) -> Result<(), Error> {
        if segment.data.is_empty() {
            return Ok(());
        }

        assert_eq!(
            segment.memory_index.index(),
            0,
            "only a single memory is supported"
        );

        let memory_size = memory.size();
        let segment_size = segment.data.len();
        let offset = segment.offset;

        if segment_size > memory_size {
            return Err(RangeError::DataSegmentTooBig {
                memory_size,
                segment_size,
                offset,
            }
            .into());
        }

        let out_of_bounds = RangeError::DataSegmentOutOfBounds {
            memory_size,
            segment_size,
            offset,
        };
        let Some(start) = usize::try_from(offset)
            .ok()
            .filter(|start| *start <= memory_size - segment_size)
        else {
            return Err(out_of_bounds.into());
        };

        tracing::trace!(offset, len = segment_size, "initializing memory");

        memory
            .write(start, &segment.data)
            .map_err(|_| out_of_bounds)?;
        Ok(())
    }

    /// Returns the wrapper for the function at `index`, creating it on first use.
    ///
    /// The first caller decides the wrapper's name.
    fn wrapper(&mut self, instance: &Arc<Instance>, index: FuncIndex, name: Option<&str>) -> Func {
        match self.wrappers.entry(index) {
            Entry::Occupied(o) => o.get().clone(),
            Entry::Vacant(v) => v
                .insert(Func::for_defined(instance, index, name.map(Arc::from)))
                .clone(),
        }
    }

    /// The embedder's key for this module.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// The names the module exports, in declaration order. Available before linking.
    pub fn export_entries(&self) -> &[Arc<str>] {
        &self.export_entries
    }

    /// Returns the export named `name`, or `None` if there is no such export or the record
    /// is not linked yet.
    pub fn get_export(&self, name: &str) -> Option<&Extern> {
        self.environment.get(name)
    }

    pub fn exports(&self) -> &ExportEnvironment {
        &self.environment
    }

    /// The resolved start function. Always `Some` after linking a module that declares one.
    pub fn start_function(&self) -> Option<&Func> {
        self.start_function.as_ref()
    }

    pub fn instance(&self) -> Option<&Arc<Instance>> {
        self.instance.as_ref()
    }

    pub fn is_linked(&self) -> bool {
        self.instance.is_some()
    }

    pub fn is_evaluated(&self) -> bool {
        self.evaluated
    }
}

impl fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("key", &self.key)
            .field("module", &self.module.id())
            .field("export_entries", &self.export_entries)
            .field("environment", &self.environment)
            .field("instance", &self.instance)
            .field("start_function", &self.start_function)
            .field("wrappers", &self.wrappers.len())
            .field("evaluated", &self.evaluated)
            .finish()
    }
}
