// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::code_object::FunctionLoc;
use crate::errors::Error;
use crate::indices::FuncIndex;
use crate::instance::Instance;
use crate::types::FuncType;
use crate::values::Val;

/// Where a function's compiled code starts.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    /// The absolute address of the first instruction.
    pub address: usize,
    /// The function's location within its module's text.
    pub loc: FunctionLoc,
}

/// An externally callable wrapper around a function of an instance.
///
/// Cloning is cheap and preserves identity, see [`Func::ptr_eq`].
#[derive(Clone)]
pub struct Func(Arc<FuncData>);

struct FuncData {
    // Weak since the instance's table can hold this wrapper
    instance: Weak<Instance>,
    index: FuncIndex,
    entry: EntryPoint,
    ty: FuncType,
    name: Option<Arc<str>>,
}

// ===== impl Func =====

impl Func {
    /// Creates a wrapper calling the code at `entry` on behalf of `instance`.
    pub fn new(
        instance: &Arc<Instance>,
        index: FuncIndex,
        entry: EntryPoint,
        ty: FuncType,
        name: Option<Arc<str>>,
    ) -> Self {
        Self(Arc::new(FuncData {
            instance: Arc::downgrade(instance),
            index,
            entry,
            ty,
            name,
        }))
    }

    /// Creates a wrapper for a function defined by `instance`'s module.
    ///
    /// # Panics
    ///
    /// Panics if `index` refers to an imported function.
    pub(crate) fn for_defined(
        instance: &Arc<Instance>,
        index: FuncIndex,
        name: Option<Arc<str>>,
    ) -> Self {
        let module = instance.module();
        let entry = module
            .entry_point(index)
            .unwrap_or_else(|| panic!("function {index:?} is imported and has no entry point"));
        let ty = module.signature(index).clone();

        Self::new(instance, index, entry, ty, name)
    }

    /// Calls the function through the engine's trampoline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeMismatch`] if `params` or `results` don't match the function's
    /// signature, [`Error::InstanceDropped`] if the owning instance no longer exists and
    /// [`Error::Trap`] if the function trapped.
    pub fn call(&self, params: &[Val], results: &mut [Val]) -> Result<(), Error> {
        self.typecheck(params, results)?;

        let instance = self.instance().ok_or(Error::InstanceDropped {
            func_index: self.0.index,
        })?;

        tracing::trace!(func = ?self, "calling function");
        instance
            .module()
            .engine()
            .trampoline()
            .call(self, params, results)?;

        Ok(())
    }

    fn typecheck(&self, params: &[Val], results: &[Val]) -> Result<(), Error> {
        let ty = &self.0.ty;

        if params.len() != ty.params().len() {
            return Err(Error::TypeMismatch(format!(
                "expected {} arguments for {ty}, got {}",
                ty.params().len(),
                params.len()
            )));
        }
        if results.len() != ty.results().len() {
            return Err(Error::TypeMismatch(format!(
                "expected {} result slots for {ty}, got {}",
                ty.results().len(),
                results.len()
            )));
        }

        for (i, (param, expected)) in params.iter().zip(ty.params()).enumerate() {
            if param.ty() != *expected {
                return Err(Error::TypeMismatch(format!(
                    "argument {i} of {ty} must be {expected}, got {}",
                    param.ty()
                )));
            }
        }

        Ok(())
    }

    /// Returns the instance this function belongs to, if it is still alive.
    pub fn instance(&self) -> Option<Arc<Instance>> {
        self.0.instance.upgrade()
    }

    #[inline]
    pub fn index(&self) -> FuncIndex {
        self.0.index
    }

    #[inline]
    pub fn entry(&self) -> EntryPoint {
        self.0.entry
    }

    #[inline]
    pub fn ty(&self) -> &FuncType {
        &self.0.ty
    }

    /// The export name this wrapper was created for, `None` for internal wrappers.
    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn param_count(&self) -> usize {
        self.0.ty.params().len()
    }

    /// Returns `true` if both values are the same wrapper.
    pub fn ptr_eq(lhs: &Self, rhs: &Self) -> bool {
        Arc::ptr_eq(&lhs.0, &rhs.0)
    }
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Func")
            .field("index", &self.0.index)
            .field("name", &self.0.name)
            .field("entry", &format_args!("{:#x}", self.0.entry.address))
            .field("ty", &format_args!("{}", self.0.ty))
            .finish_non_exhaustive()
    }
}
