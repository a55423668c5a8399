//! Host operations built from the bridge, the caches and the scheduler.
//!
//! [`Service`] is what a front end talks to. Queries go through the
//! compilation cache first and only ask the oracle for what is missing.
//! Edits go through the scheduler so rapid typing collapses into a single
//! oracle call for the latest revision.

pub mod facets;

use std::sync::{Arc, Mutex};

use log::{debug, info};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use url::Url;

pub use facets::{AnalyzeParams, AnalyzeResponse, Facet, FacetFailure};

use crate::bridge::Bridge;
use crate::cache::{
    Artifact, CacheKey, CacheStatsReport, CompilationCache, DocumentVersion, ProgramInfo,
    ReferenceLibraryIndex, Resolution, ResolvedModule, SymbolDatabase, SymbolInfo,
};
use crate::config::{CacheConfig, ResolvedConfig};
use crate::error::{LockResultExt, OracleResult};
use crate::health::HealthStatus;
use crate::scheduler::{Dispatcher, Priority, Scheduler, SchedulerConfig, SchedulerStats, Ticket};

const LOG_TARGET: &str = "oracle_ls::service";

pub const GET_INHERITED_METHOD: &str = "get_inherited";
pub const STARTUP_METRICS_METHOD: &str = "get_startup_metrics";
pub const ORACLE_CACHE_STATS_METHOD: &str = "get_cache_stats";

/// Outcome type of a scheduled analysis.
pub type AnalysisResult = OracleResult<AnalyzeResponse>;

/// Bridge plus caches: everything needed to answer a query.
struct Engine {
    bridge: Arc<Bridge>,
    compilation: Arc<CompilationCache>,
    reference: ReferenceLibraryIndex,
    symbols: SymbolDatabase,
}

impl Engine {
    async fn analyze(
        &self,
        params: AnalyzeParams,
        version: DocumentVersion,
        use_cache: bool,
    ) -> AnalysisResult {
        let requested = params.requested();
        let generation = self.bridge.generation();
        self.compilation.advance_generation(generation);

        let key = CacheKey::new(params.uri.clone(), version);
        let cached = if use_cache {
            self.compilation.get(&key)
        } else {
            None
        };

        let mut response = AnalyzeResponse::default();
        let mut missing = Vec::new();
        for facet in requested {
            match cached.as_ref().and_then(|artifact| artifact.facets.get(&facet)) {
                Some(value) => {
                    response.result.insert(facet, value.clone());
                }
                None => missing.push(facet),
            }
        }
        if missing.is_empty() {
            debug!(target: LOG_TARGET, "{} served from compilation cache", params.uri);
            return Ok(response);
        }

        let request = json!({
            "uri": params.uri,
            "text": params.text,
            "version": params.version,
            "include": missing,
        });
        let (fresh, handle) = match self.bridge.call(facets::ANALYZE_METHOD, request).await {
            Ok(raw) => {
                let handle = raw.get("handle").and_then(Value::as_str).map(str::to_string);
                (facets::normalize(&missing, &raw), handle)
            }
            Err(e) if e.is_oracle_reported() => (facets::fail_all(&missing, &e), None),
            Err(e) => return Err(e),
        };

        if let Some(introspect) = fresh.result.get(&Facet::Introspect) {
            self.symbols
                .insert(params.uri.clone(), ProgramInfo::from_introspect(introspect));
        }

        if !fresh.result.is_empty() {
            let mut artifact = cached
                .map(|artifact| Artifact::clone(&artifact))
                .unwrap_or_default();
            artifact.generation = generation;
            if handle.is_some() {
                artifact.handle = handle;
            }
            artifact
                .facets
                .extend(fresh.result.iter().map(|(facet, value)| (*facet, value.clone())));
            self.compilation.put(key, artifact);
        }

        response.merge(fresh);
        Ok(response)
    }
}

/// Runs debounced edits through the cache-aware analysis path.
pub struct AnalysisDispatcher {
    engine: Arc<Engine>,
}

impl Dispatcher for AnalysisDispatcher {
    type Request = AnalyzeParams;
    type Output = AnalysisResult;

    async fn dispatch(
        &self,
        document: &Url,
        revision: u64,
        request: AnalyzeParams,
    ) -> AnalysisResult {
        debug!(
            target: LOG_TARGET,
            "Analyzing {} revision {}",
            document,
            revision
        );
        let version = request.document_version();
        self.engine.analyze(request, version, true).await
    }
}

pub struct Service {
    engine: Arc<Engine>,
    scheduler: Scheduler<AnalysisDispatcher>,
    preload_modules: Vec<String>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    /// Build the service. Must be called from within a tokio runtime; the
    /// oracle is not started until [`Service::start`].
    pub fn new(config: ResolvedConfig) -> Arc<Self> {
        let bridge = Bridge::new(config.bridge);
        Self::with_bridge(bridge, config.scheduler, &config.cache)
    }

    pub fn with_bridge(
        bridge: Arc<Bridge>,
        scheduler: SchedulerConfig,
        cache: &CacheConfig,
    ) -> Arc<Self> {
        let engine = Arc::new(Engine {
            bridge,
            compilation: Arc::new(CompilationCache::new(cache.compilation_capacity)),
            reference: ReferenceLibraryIndex::new(cache.reference_budget_bytes),
            symbols: SymbolDatabase::new(cache.symbol_budget_bytes),
        });
        let dispatcher = Arc::new(AnalysisDispatcher {
            engine: Arc::clone(&engine),
        });
        Arc::new(Self {
            engine,
            scheduler: Scheduler::new(dispatcher, scheduler),
            preload_modules: cache.preload_modules.clone(),
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.engine.bridge
    }

    /// Start the oracle, then begin tracking restarts and warming the
    /// reference library in the background.
    pub async fn start(&self) -> OracleResult<()> {
        self.engine.bridge.start().await?;
        self.engine
            .compilation
            .advance_generation(self.engine.bridge.generation());

        let mut background = self.background.lock().recover_poison("Service::start");
        if !background.is_empty() {
            return Ok(());
        }
        background.push(self.spawn_generation_watch());
        if !self.preload_modules.is_empty() {
            let engine = Arc::clone(&self.engine);
            let modules = self.preload_modules.clone();
            background.push(tokio::spawn(async move {
                engine.reference.warm(&*engine.bridge, &modules).await;
            }));
        }
        Ok(())
    }

    fn spawn_generation_watch(&self) -> JoinHandle<()> {
        let mut generations = self.engine.bridge.subscribe_generation();
        let compilation = Arc::clone(&self.engine.compilation);
        tokio::spawn(async move {
            while generations.changed().await.is_ok() {
                let generation = *generations.borrow_and_update();
                if compilation.advance_generation(generation) {
                    info!(
                        target: LOG_TARGET,
                        "Oracle generation {} started; compilation cache reset",
                        generation
                    );
                }
            }
        })
    }

    /// Close every document, stop background work and the oracle.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        let handles: Vec<_> = self
            .background
            .lock()
            .recover_poison("Service::shutdown")
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }
        self.engine.bridge.stop().await;
    }

    /// One consolidated query, served from cache where possible.
    pub async fn analyze(&self, params: AnalyzeParams) -> AnalysisResult {
        let version = params.document_version();
        self.engine.analyze(params, version, true).await
    }

    /// Like [`Service::analyze`] with an explicit document version, e.g. a
    /// file fingerprint.
    pub async fn analyze_versioned(
        &self,
        params: AnalyzeParams,
        version: DocumentVersion,
    ) -> AnalysisResult {
        self.engine.analyze(params, version, true).await
    }

    /// Bypass the cache lookup and recompile.
    pub async fn analyze_uncached(&self, params: AnalyzeParams) -> AnalysisResult {
        let version = params.document_version();
        self.engine.analyze(params, version, false).await
    }

    /// Schedule analysis of an edited document. Only the latest revision's
    /// result is delivered.
    pub fn did_change(
        &self,
        params: AnalyzeParams,
        priority: Priority,
    ) -> Ticket<AnalysisResult> {
        let uri = params.uri.clone();
        self.scheduler.submit(uri, params, priority)
    }

    /// Forget an open document. Its indexed symbols stay available to other
    /// files.
    pub fn did_close(&self, uri: &Url) {
        self.scheduler.close(uri);
        self.engine.compilation.invalidate(uri);
    }

    /// Resolve a standard module through the reference library.
    pub async fn resolve_module(&self, module: &str) -> OracleResult<Resolution> {
        self.engine
            .reference
            .resolve(&*self.engine.bridge, module)
            .await
    }

    /// Resolve a module and everything it inherits.
    pub async fn resolve_module_tree(&self, module: &str) -> OracleResult<Vec<ResolvedModule>> {
        self.engine
            .reference
            .resolve_with_inherited(&*self.engine.bridge, module)
            .await
    }

    /// Parents of a program, from the symbol database when indexed.
    pub async fn get_inherited(&self, uri: &Url, text: Option<&str>) -> OracleResult<Vec<String>> {
        if let Some(inherits) = self.engine.symbols.inherited(uri) {
            return Ok(inherits);
        }

        let mut params = json!({ "uri": uri });
        if let Some(text) = text {
            params["text"] = Value::String(text.to_string());
        }
        let result = self
            .engine
            .bridge
            .call(GET_INHERITED_METHOD, params)
            .await?;
        let inherits = match &result {
            Value::Array(_) => {
                ProgramInfo::from_introspect(&json!({ "inherits": result })).inherits
            }
            other => ProgramInfo::from_introspect(other).inherits,
        };
        self.engine.symbols.insert(
            uri.clone(),
            ProgramInfo {
                symbols: Vec::new(),
                inherits: inherits.clone(),
            },
        );
        Ok(inherits)
    }

    /// Indexed definitions of `name` across files.
    pub fn find_symbol(&self, name: &str) -> Vec<(Url, SymbolInfo)> {
        self.engine.symbols.find(name)
    }

    pub fn health(&self) -> HealthStatus {
        self.engine.bridge.health()
    }

    pub fn cache_stats(&self) -> CacheStatsReport {
        CacheStatsReport {
            compilation: self.engine.compilation.stats(),
            reference: self.engine.reference.stats(),
            symbols: self.engine.symbols.stats(),
        }
    }

    pub async fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats().await
    }

    /// The oracle's own startup and cache diagnostics.
    pub async fn oracle_metrics(&self) -> OracleResult<Value> {
        let bridge = &self.engine.bridge;
        let startup = bridge.call(STARTUP_METRICS_METHOD, json!({})).await?;
        let cache = bridge.call(ORACLE_CACHE_STATS_METHOD, json!({})).await?;
        Ok(json!({ "startup": startup, "cache": cache }))
    }
}
