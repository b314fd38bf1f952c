// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;

use parking_lot::RwLock;

use crate::func::Func;
use crate::trap::Trap;
use crate::types::TableType;

/// A funcref table used for indirect calls.
pub struct Table {
    ty: TableType,
    elements: RwLock<Vec<Option<Func>>>,
}

// ===== impl Table =====

impl Table {
    /// Creates a table with `ty.minimum` null elements.
    pub fn new(ty: TableType) -> Self {
        let size = usize::try_from(ty.minimum).unwrap_or(usize::MAX);
        Self {
            ty,
            elements: RwLock::new(vec![None; size]),
        }
    }

    pub fn ty(&self) -> TableType {
        self.ty
    }

    /// Returns the current number of elements.
    ///
    /// # Panics
    ///
    /// Panics if the table has more than `u32::MAX` elements, which cannot happen for tables
    /// created from a [`TableType`].
    pub fn size(&self) -> u32 {
        u32::try_from(self.elements.read().len()).expect("table size exceeds u32")
    }

    /// Returns the element at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Trap::TableOutOfBounds`] if `index` is out of bounds.
    pub fn get(&self, index: u32) -> Result<Option<Func>, Trap> {
        let index = usize::try_from(index).map_err(|_| Trap::TableOutOfBounds)?;
        self.elements
            .read()
            .get(index)
            .cloned()
            .ok_or(Trap::TableOutOfBounds)
    }

    /// Replaces the element at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Trap::TableOutOfBounds`] if `index` is out of bounds.
    pub fn set(&self, index: u32, func: Option<Func>) -> Result<(), Trap> {
        let index = usize::try_from(index).map_err(|_| Trap::TableOutOfBounds)?;
        let mut elements = self.elements.write();
        let slot = elements.get_mut(index).ok_or(Trap::TableOutOfBounds)?;
        *slot = func;
        Ok(())
    }

    /// Writes `items` into consecutive slots starting at `dst`.
    ///
    /// Either all items are written or, if they don't fit, none are.
    ///
    /// # Errors
    ///
    /// Returns [`Trap::TableOutOfBounds`] if the items don't fit.
    pub fn init_func(
        &self,
        dst: u32,
        items: impl ExactSizeIterator<Item = Func>,
    ) -> Result<(), Trap> {
        let dst = usize::try_from(dst).map_err(|_| Trap::TableOutOfBounds)?;
        let mut elements = self.elements.write();
        let slots = elements
            .get_mut(dst..)
            .and_then(|s| s.get_mut(..items.len()))
            .ok_or(Trap::TableOutOfBounds)?;

        for (item, slot) in items.zip(slots) {
            *slot = Some(item);
        }

        Ok(())
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elements = self.elements.read();
        f.debug_struct("Table")
            .field("ty", &self.ty)
            .field("size", &elements.len())
            .field(
                "initialized",
                &elements.iter().filter(|elem| elem.is_some()).count(),
            )
            .finish_non_exhaustive()
    }
}
