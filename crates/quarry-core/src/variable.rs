//! Query variables and the per-query registry that hands out their ids.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::id::{VariableId, VariableIdAllocator};

/// An immutable variable identity. Rules that want to rename a value create a
/// new variable and rewrite references instead of mutating this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Variable {
    pub id: VariableId,
    pub name: String,
    pub is_constant: bool,
}

impl Variable {
    /// Temporaries are introduced by the planner or by rules, never by the user.
    pub fn is_temporary(&self) -> bool {
        self.name.starts_with('#')
    }
}

/// Allocates variable ids for one query. Shared by every candidate plan of
/// that query, so an id is never reused within one optimization session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableRegistry {
    ids: VariableIdAllocator,
    vars: BTreeMap<VariableId, Variable>,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_variable(&mut self, name: impl Into<String>) -> Variable {
        self.register(name.into(), false)
    }

    pub fn create_constant(&mut self, name: impl Into<String>) -> Variable {
        self.register(name.into(), true)
    }

    pub fn create_temporary(&mut self) -> Variable {
        let name = format!("#{}", self.ids.peek().get());
        self.register(name, false)
    }

    fn register(&mut self, name: String, is_constant: bool) -> Variable {
        let var = Variable {
            id: self.ids.next(),
            name,
            is_constant,
        };
        self.vars.insert(var.id, var.clone());
        var
    }

    pub fn get(&self, id: VariableId) -> Option<&Variable> {
        self.vars.get(&id)
    }

    /// Display name for explain output; unknown ids render as `$<n>`.
    pub fn name_of(&self, id: VariableId) -> String {
        match self.vars.get(&id) {
            Some(v) => v.name.clone(),
            None => format!("${}", id.get()),
        }
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.vars.values()
    }
}
