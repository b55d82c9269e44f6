//! Qualified names for database objects. The hierarchy is
//! `warren` (root) → schema → entity → column/index; fully-qualified forms
//! are dot-separated and appear in every user-visible error.

use serde::{Deserialize, Serialize};
use std::fmt;

const ROOT: &str = "warren";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaName(pub String);

impl SchemaName {
    pub fn new(name: impl Into<String>) -> SchemaName {
        SchemaName(name.into().to_lowercase())
    }

    pub fn simple(&self) -> &str {
        &self.0
    }

    pub fn entity(&self, name: impl Into<String>) -> EntityName {
        EntityName {
            schema: self.clone(),
            name: name.into().to_lowercase(),
        }
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ROOT}.{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityName {
    pub schema: SchemaName,
    pub name: String,
}

impl EntityName {
    pub fn simple(&self) -> &str {
        &self.name
    }

    pub fn column(&self, name: impl Into<String>) -> ColumnName {
        ColumnName {
            entity: self.clone(),
            name: name.into().to_lowercase(),
        }
    }

    pub fn index(&self, name: impl Into<String>) -> IndexName {
        IndexName {
            entity: self.clone(),
            name: name.into().to_lowercase(),
        }
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnName {
    pub entity: EntityName,
    pub name: String,
}

impl ColumnName {
    pub fn simple(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ColumnName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexName {
    pub entity: EntityName,
    pub name: String,
}

impl IndexName {
    pub fn simple(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity, self.name)
    }
}
