// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use exec_alloc::{AllocatorRegistry, ExecutableAllocator};

use crate::func::Func;
use crate::trap::Trap;
use crate::values::Val;

/// Transfers control into compiled code.
///
/// Implemented by the code generator's calling machinery. The linker only ever calls
/// functions through this trait, it never jumps into machine code itself.
pub trait Trampoline: Send + Sync + fmt::Debug {
    /// Runs `func` with `params` and writes its return values into `results`.
    ///
    /// Arguments and result slots have already been checked against the function's
    /// signature.
    ///
    /// # Errors
    ///
    /// Returns the trap that stopped execution of the function.
    fn call(&self, func: &Func, params: &[Val], results: &mut [Val]) -> Result<(), Trap>;
}

/// Process-level state shared by all modules compiled for the same runtime.
#[derive(Debug, Clone)]
pub struct Engine(Arc<EngineInner>);

#[derive(Debug)]
struct EngineInner {
    allocator: ExecutableAllocator,
    trampoline: Box<dyn Trampoline>,
    next_module_id: AtomicU64,
}

// ===== impl Engine =====

impl Engine {
    /// Creates an engine whose code is allocated from an allocator registered with
    /// `registry`.
    pub fn new(registry: &Arc<AllocatorRegistry>, trampoline: impl Trampoline + 'static) -> Engine {
        Engine(Arc::new(EngineInner {
            allocator: ExecutableAllocator::new(registry),
            trampoline: Box::new(trampoline),
            next_module_id: AtomicU64::new(0),
        }))
    }

    pub fn same(lhs: &Engine, rhs: &Engine) -> bool {
        Arc::ptr_eq(&lhs.0, &rhs.0)
    }

    /// Returns the allocator module code is published into.
    pub fn allocator(&self) -> &ExecutableAllocator {
        &self.0.allocator
    }

    pub fn trampoline(&self) -> &dyn Trampoline {
        self.0.trampoline.as_ref()
    }

    pub(crate) fn next_module_id(&self) -> u64 {
        self.0.next_module_id.fetch_add(1, Ordering::Relaxed)
    }
}
