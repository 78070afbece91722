//! The canonical content store: one JSON document per language.
//!
//! Layout:
//!
//! ```json
//! {
//!   "inventory": {
//!     "title": "...",
//!     "items": {
//!       "weapons": [ { "id": "laser_pistol", "name": "LASER PISTOL", ... } ],
//!       "armor": []
//!     }
//!   },
//!   "meta": { "version": 3 }
//! }
//! ```
//!
//! Top-level objects with an `items` key are modules; each key of `items` is
//! a category. A module that does not parse fails the load. Everything else
//! is preserved untouched on persist.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use loreforge_artifacts::write_atomic;
use loreforge_shared::{CanonicalRecord, LoreforgeError, Result};

/// A module section of the store document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreModule {
    pub items: BTreeMap<String, Vec<CanonicalRecord>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum StoreEntry {
    Module(StoreModule),
    Other(serde_json::Value),
}

/// In-memory view of the canonical store file.
#[derive(Debug, Clone)]
pub struct CanonicalStore {
    path: PathBuf,
    entries: BTreeMap<String, StoreEntry>,
    /// category -> owning module
    category_index: HashMap<String, String>,
}

impl CanonicalStore {
    /// An empty store that will be written to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
            category_index: HashMap::new(),
        }
    }

    /// Load the store file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| LoreforgeError::io(path, e))?;
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(&content).map_err(|e| {
            LoreforgeError::Storage(format!("invalid canonical store {}: {e}", path.display()))
        })?;

        let mut entries = BTreeMap::new();
        for (name, value) in raw {
            let entry = if value.get("items").is_some() {
                let module: StoreModule = serde_json::from_value(value).map_err(|e| {
                    LoreforgeError::Storage(format!(
                        "invalid module '{name}' in canonical store {}: {e}",
                        path.display()
                    ))
                })?;
                StoreEntry::Module(module)
            } else {
                StoreEntry::Other(value)
            };
            entries.insert(name, entry);
        }

        let mut store = Self {
            path: path.to_path_buf(),
            entries,
            category_index: HashMap::new(),
        };
        store.reindex()?;
        debug!(
            path = %path.display(),
            categories = store.category_index.len(),
            records = store.record_count(),
            "loaded canonical store"
        );
        Ok(store)
    }

    fn reindex(&mut self) -> Result<()> {
        self.category_index.clear();
        for (module_name, entry) in &self.entries {
            let StoreEntry::Module(module) = entry else {
                continue;
            };
            for (category, records) in &module.items {
                if let Some(first) = self.category_index.get(category) {
                    return Err(LoreforgeError::Storage(format!(
                        "category '{category}' is defined in both '{first}' and '{module_name}'"
                    )));
                }
                check_unique(category, records)?;
                self.category_index.insert(category.clone(), module_name.clone());
            }
        }
        Ok(())
    }

    /// Write the whole document atomically (temp file + rename).
    pub fn persist(&self) -> Result<()> {
        let mut buf = serde_json::to_vec_pretty(&self.entries)
            .map_err(|e| LoreforgeError::Storage(format!("serialize canonical store: {e}")))?;
        buf.push(b'\n');
        write_atomic(&self.path, &buf)?;
        debug!(path = %self.path.display(), "persisted canonical store");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add an empty category under `module`, creating the module if needed.
    pub fn add_category(&mut self, module: &str, category: &str) -> Result<()> {
        if self.category_index.contains_key(category) {
            return Ok(());
        }
        let entry = self
            .entries
            .entry(module.to_string())
            .or_insert_with(|| StoreEntry::Module(StoreModule::default()));
        match entry {
            StoreEntry::Module(m) => {
                m.items.entry(category.to_string()).or_default();
            }
            StoreEntry::Other(_) => {
                return Err(LoreforgeError::Storage(format!(
                    "'{module}' is not a module section"
                )));
            }
        }
        self.category_index.insert(category.to_string(), module.to_string());
        Ok(())
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.category_index.contains_key(category)
    }

    /// Category names in sorted order.
    pub fn categories(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.category_index.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Records of a category in store order (empty if the category is unknown).
    pub fn records(&self, category: &str) -> &[CanonicalRecord] {
        self.items(category).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn find(&self, category: &str, id: &str) -> Option<&CanonicalRecord> {
        self.records(category).iter().find(|r| r.id == id)
    }

    pub fn contains_id(&self, category: &str, id: &str) -> bool {
        self.find(category, id).is_some()
    }

    /// Append a new record. Fails if the category is unknown or the id is taken.
    pub fn insert(&mut self, category: &str, record: CanonicalRecord) -> Result<()> {
        if self.contains_id(category, &record.id) {
            return Err(LoreforgeError::validation(format!(
                "identifier '{}' already exists in '{category}'",
                record.id
            )));
        }
        let items = self.items_mut(category)?;
        items.push(record);
        Ok(())
    }

    /// Replace the record with the same id, returning the previous value.
    pub fn replace(&mut self, category: &str, record: CanonicalRecord) -> Result<CanonicalRecord> {
        let items = self.items_mut(category)?;
        let slot = items.iter_mut().find(|r| r.id == record.id).ok_or_else(|| {
            LoreforgeError::validation(format!("no record '{}' in '{category}'", record.id))
        })?;
        Ok(std::mem::replace(slot, record))
    }

    /// Remove a record by id.
    pub fn remove(&mut self, category: &str, id: &str) -> Option<CanonicalRecord> {
        let items = self.items_mut(category).ok()?;
        let idx = items.iter().position(|r| r.id == id)?;
        Some(items.remove(idx))
    }

    pub fn record_count(&self) -> usize {
        self.category_index.keys().map(|c| self.records(c).len()).sum()
    }

    pub fn category_counts(&self) -> BTreeMap<String, usize> {
        self.category_index
            .keys()
            .map(|c| (c.clone(), self.records(c).len()))
            .collect()
    }

    fn items(&self, category: &str) -> Option<&Vec<CanonicalRecord>> {
        let module = self.category_index.get(category)?;
        match self.entries.get(module)? {
            StoreEntry::Module(m) => m.items.get(category),
            StoreEntry::Other(_) => None,
        }
    }

    fn items_mut(&mut self, category: &str) -> Result<&mut Vec<CanonicalRecord>> {
        let unknown = || LoreforgeError::validation(format!("unknown category '{category}'"));
        let module = self.category_index.get(category).ok_or_else(unknown)?;
        match self.entries.get_mut(module) {
            Some(StoreEntry::Module(m)) => m.items.get_mut(category).ok_or_else(unknown),
            _ => Err(unknown()),
        }
    }
}

fn check_unique(category: &str, records: &[CanonicalRecord]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for record in records {
        if !seen.insert(record.id.as_str()) {
            return Err(LoreforgeError::Storage(format!(
                "duplicate identifier '{}' in category '{category}'",
                record.id
            )));
        }
    }
    Ok(())
}
