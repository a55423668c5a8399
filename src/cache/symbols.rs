//! Cross-file symbol database.
//!
//! Holds the symbols and inheritance edges of every program the oracle has
//! introspected. The data is host-side, so it survives oracle restarts.
//! Bounded by an approximate byte budget; the oldest insertions go first.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::LOG_TARGET;
use crate::error::LockResultExt;

/// One named symbol as reported by the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Symbols and parents of one compiled program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramInfo {
    #[serde(default)]
    pub symbols: Vec<SymbolInfo>,
    #[serde(default)]
    pub inherits: Vec<String>,
}

impl ProgramInfo {
    /// Extract program metadata from an `introspect` result.
    ///
    /// Unknown fields are ignored and symbols without a name are skipped.
    pub fn from_introspect(result: &Value) -> Self {
        let symbols = result
            .get("symbols")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        let inherits = result
            .get("inherits")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(name) => Some(name.clone()),
                        other => other.get("name")?.as_str().map(str::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { symbols, inherits }
    }

    pub(crate) fn size_estimate(&self) -> usize {
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolStats {
    pub entries: usize,
    pub bytes: usize,
    pub budget: usize,
    pub evictions: u64,
}

struct Entry {
    info: Arc<ProgramInfo>,
    seq: u64,
    size_bytes: usize,
}

#[derive(Default)]
struct DatabaseState {
    entries: HashMap<Url, Entry>,
    /// Insertion order, oldest first.
    order: BTreeMap<u64, Url>,
    total_bytes: usize,
    next_seq: u64,
    evictions: u64,
}

impl DatabaseState {
    fn remove(&mut self, uri: &Url) -> Option<Entry> {
        let entry = self.entries.remove(uri)?;
        self.order.remove(&entry.seq);
        self.total_bytes -= entry.size_bytes;
        Some(entry)
    }
}

pub struct SymbolDatabase {
    budget_bytes: usize,
    state: Mutex<DatabaseState>,
}

impl SymbolDatabase {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            budget_bytes,
            state: Mutex::new(DatabaseState::default()),
        }
    }

    /// Index a program, replacing any previous entry for the uri.
    ///
    /// Returns false when the entry alone exceeds the budget and was not
    /// stored.
    pub fn insert(&self, uri: Url, info: ProgramInfo) -> bool {
        let size_bytes = uri.as_str().len() + info.size_estimate();
        let mut state = self.state.lock().recover_poison("SymbolDatabase::insert");
        state.remove(&uri);

        if size_bytes > self.budget_bytes {
            debug!(
                target: LOG_TARGET,
                "Not indexing {}: {} bytes exceeds symbol budget",
                uri,
                size_bytes
            );
            return false;
        }

        while state.total_bytes + size_bytes > self.budget_bytes {
            let Some((_, oldest)) = state.order.pop_first() else {
                break;
            };
            // `pop_first` already dropped the order entry.
            if let Some(entry) = state.entries.remove(&oldest) {
                state.total_bytes -= entry.size_bytes;
                state.evictions += 1;
                debug!(target: LOG_TARGET, "Evicted symbols of {}", oldest);
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.insert(seq, uri.clone());
        state.total_bytes += size_bytes;
        state.entries.insert(
            uri,
            Entry {
                info: Arc::new(info),
                seq,
                size_bytes,
            },
        );
        true
    }

    pub fn get(&self, uri: &Url) -> Option<Arc<ProgramInfo>> {
        self.state
            .lock()
            .recover_poison("SymbolDatabase::get")
            .entries
            .get(uri)
            .map(|entry| Arc::clone(&entry.info))
    }

    pub fn remove(&self, uri: &Url) -> bool {
        self.state
            .lock()
            .recover_poison("SymbolDatabase::remove")
            .remove(uri)
            .is_some()
    }

    /// Parents of an indexed program.
    pub fn inherited(&self, uri: &Url) -> Option<Vec<String>> {
        self.get(uri).map(|info| info.inherits.clone())
    }

    /// Every indexed definition of `name`, ordered by uri.
    pub fn find(&self, name: &str) -> Vec<(Url, SymbolInfo)> {
        let state = self.state.lock().recover_poison("SymbolDatabase::find");
        let mut found: Vec<(Url, SymbolInfo)> = state
            .entries
            .iter()
            .flat_map(|(uri, entry)| {
                entry
                    .info
                    .symbols
                    .iter()
                    .filter(|symbol| symbol.name == name)
                    .map(move |symbol| (uri.clone(), symbol.clone()))
            })
            .collect();
        found.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        found
    }

    pub fn stats(&self) -> SymbolStats {
        let state = self.state.lock().recover_poison("SymbolDatabase::stats");
        SymbolStats {
            entries: state.entries.len(),
            bytes: state.total_bytes,
            budget: self.budget_bytes,
            evictions: state.evictions,
        }
    }
}
