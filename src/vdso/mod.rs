//! Symbol cache for the kernel's virtual dynamic shared object.
//!
//! VDSO addresses show up in virtually every user stack; indexing the dynamic
//! symbols once at startup makes the per-frame lookup a binary search with no
//! I/O.

use crate::metadata;
use crate::metrics::Counter;
use crate::objectfile::Pool;
use crate::process::{Mapping, NormalizeError};
use anyhow::{anyhow, bail};
use object::{Object, ObjectSymbol};
use std::path::PathBuf;
use std::sync::Arc;

/// Resolves a user-stack address inside a VDSO mapping to a function name.
pub trait VdsoSymbolizer: Send + Sync {
    fn resolve(&self, addr: u64, mapping: Option<&Mapping>) -> anyhow::Result<String>;
}

#[derive(Debug, Default)]
pub struct Metrics {
    pub lookup_success: Counter,
    pub lookup_error: Counter,
    pub error_not_found: Counter,
    pub error_mapping_nil: Counter,
    pub error_addr_out_of_range: Counter,
    pub error_base_calculation: Counter,
    pub error_unknown: Counter,
}

#[derive(Debug, Clone)]
struct Symbol {
    start: u64,
    size: u64,
    name: String,
}

/// Address-sorted symbol index; a hit is `addr` within `[start, start+size)`.
#[derive(Debug, Default)]
struct SymbolSearcher {
    symbols: Vec<Symbol>,
}

impl SymbolSearcher {
    fn new(mut symbols: Vec<Symbol>) -> Self {
        symbols.retain(|s| s.size > 0 && !s.name.is_empty());
        symbols.sort_by_key(|s| s.start);
        Self { symbols }
    }

    fn search(&self, addr: u64) -> Option<&str> {
        let idx = self.symbols.partition_point(|s| s.start <= addr);
        if idx == 0 {
            return None;
        }
        let sym = &self.symbols[idx - 1];
        (addr < sym.start + sym.size).then_some(sym.name.as_str())
    }
}

pub struct Cache {
    metrics: Arc<Metrics>,
    searcher: SymbolSearcher,
    path: PathBuf,
}

impl Cache {
    /// Probes the kernel module tree for a vdso image and indexes its dynamic
    /// symbols. The image is not present on all systems; construction fails
    /// when no candidate opens.
    pub fn new(pool: &Pool) -> anyhow::Result<Self> {
        let release = metadata::kernel_release()?;

        let mut last_err = None;
        for candidate in ["vdso.so", "vdso64.so"] {
            let path = PathBuf::from(format!("/usr/lib/modules/{release}/{candidate}"));
            match pool.open(&path) {
                Ok(obj) => {
                    let elf = obj.elf()?;
                    let symbols = dynamic_symbols(&elf);
                    return Ok(Self {
                        metrics: Arc::new(Metrics::default()),
                        searcher: SymbolSearcher::new(symbols),
                        path,
                    });
                }
                Err(err) => {
                    last_err = Some(
                        err.context(format!("failed to open vdso file {}", path.display())),
                    );
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no vdso candidates found")))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

fn dynamic_symbols(elf: &object::File<'_>) -> Vec<Symbol> {
    elf.dynamic_symbols()
        .filter_map(|sym| {
            let name = sym.name().ok()?;
            Some(Symbol {
                start: sym.address(),
                size: sym.size(),
                name: name.to_string(),
            })
        })
        .collect()
}

impl VdsoSymbolizer for Cache {
    fn resolve(&self, addr: u64, mapping: Option<&Mapping>) -> anyhow::Result<String> {
        let Some(mapping) = mapping else {
            self.metrics.lookup_error.inc();
            self.metrics.error_mapping_nil.inc();
            bail!("mapping is nil");
        };

        let addr = match mapping.normalize(addr).map_err(anyhow::Error::new) {
            Ok(addr) => addr,
            Err(err) => {
                self.metrics.lookup_error.inc();
                match err.downcast_ref::<NormalizeError>() {
                    Some(NormalizeError::AddressOutOfRange { .. }) => {
                        self.metrics.error_addr_out_of_range.inc()
                    }
                    Some(NormalizeError::BaseAddressCannotCalculate { .. }) => {
                        self.metrics.error_base_calculation.inc()
                    }
                    _ => self.metrics.error_unknown.inc(),
                }
                return Err(err.context("failed to normalize vdso address"));
            }
        };

        match self.searcher.search(addr) {
            Some(name) => {
                self.metrics.lookup_success.inc();
                Ok(name.to_string())
            }
            None => {
                self.metrics.lookup_error.inc();
                self.metrics.error_not_found.inc();
                bail!("no vdso symbol found for address {addr:#x}")
            }
        }
    }
}

/// Stand-in used when no vdso image could be indexed; resolves everything to
/// the empty string and never errors.
pub struct NoopCache;

impl VdsoSymbolizer for NoopCache {
    fn resolve(&self, _addr: u64, _mapping: Option<&Mapping>) -> anyhow::Result<String> {
        Ok(String::new())
    }
}

/// Builds the vdso symbolizer, degrading to [`NoopCache`] when the image is
/// unavailable.
pub fn new_symbolizer(pool: &Pool) -> Arc<dyn VdsoSymbolizer> {
    match Cache::new(pool) {
        Ok(cache) => Arc::new(cache),
        Err(err) => {
            log::debug!("vdso symbolization disabled: {err:#}");
            Arc::new(NoopCache)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(symbols: Vec<Symbol>) -> Cache {
        Cache {
            metrics: Arc::new(Metrics::default()),
            searcher: SymbolSearcher::new(symbols),
            path: PathBuf::from("/usr/lib/modules/test/vdso64.so"),
        }
    }

    fn clock_gettime_symbols() -> Vec<Symbol> {
        vec![
            Symbol {
                start: 0xc70,
                size: 734,
                name: "__vdso_gettimeofday".into(),
            },
            Symbol {
                start: 0x700,
                size: 1389,
                name: "__vdso_clock_gettime".into(),
            },
        ]
    }

    fn vdso_mapping() -> Mapping {
        Mapping {
            start: 0x7fff_f7fc_9000,
            limit: 0x7fff_f7fc_b000,
            offset: 0,
            file: "[vdso]".into(),
            build_id: String::new(),
            base: Some(0x7fff_f7fc_9000),
        }
    }

    #[test]
    fn searcher_bounds_are_half_open() {
        let searcher = SymbolSearcher::new(clock_gettime_symbols());
        assert_eq!(searcher.search(0x700), Some("__vdso_clock_gettime"));
        assert_eq!(searcher.search(0x700 + 1388), Some("__vdso_clock_gettime"));
        assert_eq!(searcher.search(0xc70), Some("__vdso_gettimeofday"));
        assert_eq!(searcher.search(0x6ff), None);
    }

    #[test]
    fn resolve_finds_enclosing_symbol() {
        let cache = cache(clock_gettime_symbols());
        let mapping = vdso_mapping();

        let name = cache.resolve(mapping.start + 0x700, Some(&mapping)).unwrap();
        assert_eq!(name, "__vdso_clock_gettime");
        assert_eq!(cache.metrics.lookup_success.get(), 1);
    }

    #[test]
    fn resolve_classifies_errors() {
        let cache = cache(clock_gettime_symbols());
        let mapping = vdso_mapping();

        assert!(cache.resolve(0x700, None).is_err());
        assert_eq!(cache.metrics.error_mapping_nil.get(), 1);

        assert!(cache.resolve(mapping.limit, Some(&mapping)).is_err());
        assert_eq!(cache.metrics.error_addr_out_of_range.get(), 1);

        let unbased = Mapping {
            base: None,
            ..vdso_mapping()
        };
        assert!(cache.resolve(unbased.start, Some(&unbased)).is_err());
        assert_eq!(cache.metrics.error_base_calculation.get(), 1);

        assert!(cache.resolve(mapping.start + 0x10, Some(&mapping)).is_err());
        assert_eq!(cache.metrics.error_not_found.get(), 1);

        assert_eq!(cache.metrics.lookup_error.get(), 4);
        assert_eq!(cache.metrics.lookup_success.get(), 0);
    }

    #[test]
    fn noop_cache_never_errors() {
        let resolved = NoopCache.resolve(0xdead, None).unwrap();
        assert_eq!(resolved, "");
    }
}
