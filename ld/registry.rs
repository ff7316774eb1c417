use ahash::AHashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Separator of the id and alias tables in the LD matrix footer.
pub const TABLE_SEPARATOR: char = '\t';

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("variant id {0:?} is empty or contains a tab, which cannot be stored in an id table")]
    InvalidId(String),
    #[error("alias {alias:?} of variant {id} contains a tab")]
    InvalidAlias { id: String, alias: String },
    #[error("variant registry is full ({0} ordinals)")]
    Full(usize),
}

#[derive(Debug, Default)]
struct RegistryTables {
    ordinals: AHashMap<String, u32>,
    ids: Vec<String>,
    aliases: Vec<String>,
}

/// Interns variant ids into the dense `u32` ordinal space of one LD matrix file.
///
/// Workers intern concurrently while computing; the writer snapshots the tables when it
/// writes the footer.
#[derive(Debug, Default)]
pub struct VariantRegistry {
    tables: Mutex<RegistryTables>,
}

impl VariantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryTables> {
        // The tables stay consistent even if a holder panicked: every insert is a single push.
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the ordinal of `id`, assigning the next one if the id is new. The first
    /// non-empty alias seen for an id is kept.
    pub fn ordinal(&self, id: &str, alias: Option<&str>) -> Result<u32, RegistryError> {
        if id.is_empty() || id.contains(TABLE_SEPARATOR) {
            return Err(RegistryError::InvalidId(id.to_string()));
        }
        let alias = alias.unwrap_or("");
        if alias.contains(TABLE_SEPARATOR) {
            return Err(RegistryError::InvalidAlias {
                id: id.to_string(),
                alias: alias.to_string(),
            });
        }

        let mut tables = self.lock();
        if let Some(&ordinal) = tables.ordinals.get(id) {
            let slot = &mut tables.aliases[ordinal as usize];
            if slot.is_empty() && !alias.is_empty() {
                *slot = alias.to_string();
            }
            return Ok(ordinal);
        }

        let next = tables.ids.len();
        let ordinal = u32::try_from(next).map_err(|_| RegistryError::Full(next))?;
        tables.ordinals.insert(id.to_string(), ordinal);
        tables.ids.push(id.to_string());
        tables.aliases.push(alias.to_string());
        Ok(ordinal)
    }

    pub fn get(&self, id: &str) -> Option<u32> {
        self.lock().ordinals.get(id).copied()
    }

    pub fn id(&self, ordinal: u32) -> Option<String> {
        self.lock().ids.get(ordinal as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids and aliases in ordinal order. Missing aliases are empty strings.
    pub fn snapshot(&self) -> (Vec<String>, Vec<String>) {
        let tables = self.lock();
        (tables.ids.clone(), tables.aliases.clone())
    }
}
