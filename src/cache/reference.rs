//! Lazily resolved reference library (standard modules).
//!
//! Modules are resolved through the oracle on first use and kept for the
//! whole session; library sources do not change underneath a running server.
//! Modules the oracle says do not exist go into a negative cache so repeated
//! lookups never reach the oracle again. Transport failures and timeouts are
//! not cached.
//!
//! The index is bounded by an approximate byte budget that covers negative
//! entries too. Under pressure the oldest negative entries go first, then the
//! least used modules are evicted whole.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::LOG_TARGET;
use super::symbols::SymbolInfo;
use crate::bridge::Oracle;
use crate::error::{LockResultExt, OracleError, OracleResult, error_chain};

pub const RESOLVE_METHOD: &str = "resolveStdlib";

/// Approximate bookkeeping cost of one negative entry beyond its name.
const NEGATIVE_ENTRY_OVERHEAD: usize = 64;

/// Symbols of one resolved module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSymbols {
    #[serde(default)]
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub symbols: Vec<SymbolInfo>,
    #[serde(default)]
    pub inherits: Vec<String>,
}

impl ModuleSymbols {
    /// Interpret a `resolveStdlib` result. `null` or `{"found": false}` means
    /// the module does not exist; any other shape that does not decode is a
    /// protocol error.
    fn from_result(module: &str, result: Value) -> OracleResult<Option<Self>> {
        if result.is_null() || result.get("found").and_then(Value::as_bool) == Some(false) {
            return Ok(None);
        }
        let mut symbols: ModuleSymbols =
            serde_json::from_value(result).map_err(|e| OracleError::Protocol {
                message: format!("undecodable `{}` result for {}: {}", RESOLVE_METHOD, module, e),
            })?;
        if symbols.module.is_empty() {
            symbols.module = module.to_string();
        }
        Ok(Some(symbols))
    }

    fn size_estimate(&self) -> usize {
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(Arc<ModuleSymbols>),
    NotFound,
    /// The module is already being resolved further up the current chain.
    InProgress,
}

impl Resolution {
    pub fn symbols(&self) -> Option<&Arc<ModuleSymbols>> {
        match self {
            Resolution::Found(symbols) => Some(symbols),
            _ => None,
        }
    }
}

/// Reentrancy guard for recursive resolution.
///
/// Tracks the keys being resolved on the current path; entering a key that is
/// already active means a cycle.
#[derive(Debug)]
pub struct ResolutionGuard<K> {
    active: HashSet<K>,
}

impl<K: Eq + Hash + Clone> ResolutionGuard<K> {
    pub fn new() -> Self {
        Self {
            active: HashSet::new(),
        }
    }

    /// Mark `key` as in progress. Returns false if it already was.
    pub fn enter(&mut self, key: &K) -> bool {
        self.active.insert(key.clone())
    }

    pub fn exit(&mut self, key: &K) {
        self.active.remove(key);
    }

    pub fn is_active(&self, key: &K) -> bool {
        self.active.contains(key)
    }
}

impl<K: Eq + Hash + Clone> Default for ResolutionGuard<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// One step of an inheritance walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    pub module: String,
    /// Distance from the module the walk started at.
    pub depth: usize,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceStats {
    pub entries: usize,
    pub negative_entries: usize,
    pub bytes: usize,
    pub budget: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Entry {
    symbols: Arc<ModuleSymbols>,
    last_access: u64,
    access_count: u64,
    size_bytes: usize,
}

#[derive(Default)]
struct IndexState {
    entries: HashMap<String, Entry>,
    /// Missing modules and the tick they were last looked up.
    negative: HashMap<String, u64>,
    /// Bytes of `entries` and `negative` together.
    total_bytes: usize,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

pub struct ReferenceLibraryIndex {
    budget_bytes: usize,
    state: Mutex<IndexState>,
}

impl ReferenceLibraryIndex {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            budget_bytes,
            state: Mutex::new(IndexState::default()),
        }
    }

    /// Resolve a module, asking the oracle only on a cache miss.
    pub async fn resolve<O: Oracle>(&self, oracle: &O, module: &str) -> OracleResult<Resolution> {
        if let Some(cached) = self.lookup(module) {
            return Ok(cached);
        }

        match oracle.call(RESOLVE_METHOD, json!({ "module": module })).await {
            Ok(result) => match ModuleSymbols::from_result(module, result)? {
                Some(symbols) => {
                    let symbols = Arc::new(symbols);
                    self.store(module, Arc::clone(&symbols));
                    Ok(Resolution::Found(symbols))
                }
                None => {
                    self.mark_missing(module);
                    Ok(Resolution::NotFound)
                }
            },
            Err(e) if e.is_oracle_reported() => {
                debug!(target: LOG_TARGET, "Module {} does not resolve: {}", module, e);
                self.mark_missing(module);
                Ok(Resolution::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve a module and, transitively, everything it inherits.
    ///
    /// Returns the walk in depth-first order. A module that inherits itself
    /// (directly or through a cycle) shows up as [`Resolution::InProgress`]
    /// at the point where the cycle closes.
    pub async fn resolve_with_inherited<O: Oracle>(
        &self,
        oracle: &O,
        module: &str,
    ) -> OracleResult<Vec<ResolvedModule>> {
        enum Step {
            Enter(String, usize),
            Exit(String),
        }

        let mut guard = ResolutionGuard::new();
        let mut walk = Vec::new();
        let mut stack = vec![Step::Enter(module.to_string(), 0)];

        while let Some(step) = stack.pop() {
            match step {
                Step::Exit(name) => guard.exit(&name),
                Step::Enter(name, depth) => {
                    if guard.is_active(&name) {
                        walk.push(ResolvedModule {
                            module: name,
                            depth,
                            resolution: Resolution::InProgress,
                        });
                        continue;
                    }

                    let resolution = self.resolve(oracle, &name).await?;
                    if let Resolution::Found(symbols) = &resolution {
                        guard.enter(&name);
                        stack.push(Step::Exit(name.clone()));
                        for parent in symbols.inherits.iter().rev() {
                            stack.push(Step::Enter(parent.clone(), depth + 1));
                        }
                    }
                    walk.push(ResolvedModule {
                        module: name,
                        depth,
                        resolution,
                    });
                }
            }
        }
        Ok(walk)
    }

    /// Resolve a list of modules ahead of time. Failures are only logged.
    pub async fn warm<O: Oracle>(&self, oracle: &O, modules: &[String]) {
        let mut loaded = 0usize;
        for module in modules {
            match self.resolve(oracle, module).await {
                Ok(Resolution::Found(_)) => loaded += 1,
                Ok(_) => debug!(target: LOG_TARGET, "Preload module {} not found", module),
                Err(e) => {
                    debug!(
                        target: LOG_TARGET,
                        "Preloading {} failed: {}",
                        module,
                        error_chain(&e)
                    );
                }
            }
        }
        info!(
            target: LOG_TARGET,
            "Preloaded {}/{} reference module(s)",
            loaded,
            modules.len()
        );
    }

    pub fn contains(&self, module: &str) -> bool {
        self.state
            .lock()
            .recover_poison("ReferenceLibraryIndex::contains")
            .entries
            .contains_key(module)
    }

    pub fn stats(&self) -> ReferenceStats {
        let state = self.state.lock().recover_poison("ReferenceLibraryIndex::stats");
        ReferenceStats {
            entries: state.entries.len(),
            negative_entries: state.negative.len(),
            bytes: state.total_bytes,
            budget: self.budget_bytes,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    fn lookup(&self, module: &str) -> Option<Resolution> {
        let mut state = self.state.lock().recover_poison("ReferenceLibraryIndex::lookup");
        state.tick += 1;
        let tick = state.tick;

        let found = state.entries.get_mut(module).map(|entry| {
            entry.last_access = tick;
            entry.access_count += 1;
            Arc::clone(&entry.symbols)
        });
        let resolution = match found {
            Some(symbols) => Some(Resolution::Found(symbols)),
            None => state.negative.get_mut(module).map(|last_access| {
                *last_access = tick;
                Resolution::NotFound
            }),
        };

        if resolution.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        resolution
    }

    fn mark_missing(&self, module: &str) {
        let size_bytes = negative_size(module);
        if size_bytes > self.budget_bytes {
            return;
        }

        let mut state = self
            .state
            .lock()
            .recover_poison("ReferenceLibraryIndex::mark_missing");
        if state.negative.contains_key(module) {
            return;
        }
        self.make_room(&mut state, size_bytes);

        state.tick += 1;
        let tick = state.tick;
        state.total_bytes += size_bytes;
        state.negative.insert(module.to_string(), tick);
    }

    /// Evict until `incoming` more bytes fit: oldest negative entries first,
    /// then the least used modules.
    fn make_room(&self, state: &mut IndexState, incoming: usize) {
        while state.total_bytes + incoming > self.budget_bytes {
            let negative = state
                .negative
                .iter()
                .min_by_key(|(_, last_access)| **last_access)
                .map(|(name, _)| name.clone());
            if let Some(name) = negative {
                state.negative.remove(&name);
                state.total_bytes -= negative_size(&name);
                state.evictions += 1;
                continue;
            }

            let victim = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| (entry.access_count, entry.last_access))
                .map(|(name, _)| name.clone());
            let Some(victim) = victim else { break };
            if let Some(entry) = state.entries.remove(&victim) {
                state.total_bytes -= entry.size_bytes;
                state.evictions += 1;
                debug!(target: LOG_TARGET, "Evicted reference module {}", victim);
            }
        }
    }

    fn store(&self, module: &str, symbols: Arc<ModuleSymbols>) {
        let size_bytes = module.len() + symbols.size_estimate();
        if size_bytes > self.budget_bytes {
            debug!(
                target: LOG_TARGET,
                "Module {} ({} bytes) exceeds the reference budget; not cached",
                module,
                size_bytes
            );
            return;
        }

        let mut state = self.state.lock().recover_poison("ReferenceLibraryIndex::store");
        if let Some(previous) = state.entries.remove(module) {
            state.total_bytes -= previous.size_bytes;
        }
        if state.negative.remove(module).is_some() {
            state.total_bytes -= negative_size(module);
        }
        self.make_room(&mut state, size_bytes);

        state.tick += 1;
        let tick = state.tick;
        state.total_bytes += size_bytes;
        state.entries.insert(
            module.to_string(),
            Entry {
                symbols,
                last_access: tick,
                access_count: 1,
                size_bytes,
            },
        );
    }
}

fn negative_size(module: &str) -> usize {
    module.len() + NEGATIVE_ENTRY_OVERHEAD
}
