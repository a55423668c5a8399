//! Host-side caches in front of the oracle.
//!
//! - [`CompilationCache`]: compiled artifacts per document version (LRU,
//!   reset on oracle restart)
//! - [`ReferenceLibraryIndex`]: lazily resolved standard modules (byte budget,
//!   negative cache)
//! - [`SymbolDatabase`]: cross-file symbols and inheritance (byte budget,
//!   oldest first)

pub mod compilation;
pub mod reference;
pub mod symbols;

use serde::Serialize;

pub use compilation::{Artifact, CacheKey, CacheStats, CompilationCache, DocumentVersion};
pub use reference::{
    ModuleSymbols, ReferenceLibraryIndex, ReferenceStats, Resolution, ResolutionGuard,
    ResolvedModule,
};
pub use symbols::{ProgramInfo, SymbolDatabase, SymbolInfo, SymbolStats};

pub(crate) const LOG_TARGET: &str = "oracle_ls::cache";

/// Combined statistics of all caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStatsReport {
    pub compilation: CacheStats,
    pub reference: ReferenceStats,
    pub symbols: SymbolStats,
}
