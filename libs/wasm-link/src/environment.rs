// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use anyhow::bail;
use hashbrown::HashMap;
use hashbrown::hash_map::Entry;

use crate::Extern;

/// The exports of a linked module, keyed by name.
#[derive(Debug, Default, Clone)]
pub struct ExportEnvironment {
    map: HashMap<Arc<str>, Extern>,
}

impl ExportEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines `name` as `item`.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is already defined.
    pub fn insert(&mut self, name: Arc<str>, item: Extern) -> crate::Result<()> {
        match self.map.entry(name) {
            Entry::Occupied(o) => {
                bail!("export `{}` is already defined", o.key());
            }
            Entry::Vacant(v) => {
                v.insert(item);
            }
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Extern> {
        self.map.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Extern)> {
        self.map.iter().map(|(name, item)| (name.as_ref(), item))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
