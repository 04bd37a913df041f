//! Symbol tables for dynamically generated code, fed from the perf-map and
//! jitdump side channels a JIT runtime can emit.

use anyhow::bail;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub symbol: String,
}

/// An address-sorted JIT symbol table.
#[derive(Debug, Default)]
pub struct Map {
    entries: Vec<MapEntry>,
}

impl Map {
    pub fn new(mut entries: Vec<MapEntry>) -> Self {
        entries.sort_by_key(|e| e.start);
        Self { entries }
    }

    pub fn lookup(&self, addr: u64) -> anyhow::Result<&str> {
        let idx = self.entries.partition_point(|e| e.start <= addr);
        if idx > 0 {
            let entry = &self.entries[idx - 1];
            if addr < entry.end {
                return Ok(&entry.symbol);
            }
        }
        bail!("no symbol found for address {addr:#x}")
    }
}

/// Per-pid `/tmp/perf-<pid>.map` table provider. Retrieval stats the
/// underlying file, so callers memoize per conversion.
pub trait PerfMapCache: Send + Sync {
    fn perf_map_for_pid(&self, pid: i32) -> anyhow::Result<Arc<Map>>;
}

/// Per-pid jitdump table provider, keyed additionally by the dump file path.
pub trait JitdumpCache: Send + Sync {
    fn jitdump_for_pid(&self, pid: i32, path: &str) -> anyhow::Result<Arc<Map>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_respects_entry_bounds() {
        let map = Map::new(vec![
            MapEntry {
                start: 0x2000,
                end: 0x2080,
                symbol: "jitted_b".into(),
            },
            MapEntry {
                start: 0x1000,
                end: 0x1040,
                symbol: "jitted_a".into(),
            },
        ]);

        assert_eq!(map.lookup(0x1000).unwrap(), "jitted_a");
        assert_eq!(map.lookup(0x103f).unwrap(), "jitted_a");
        assert!(map.lookup(0x1040).is_err());
        assert_eq!(map.lookup(0x2000).unwrap(), "jitted_b");
        assert!(map.lookup(0xfff).is_err());
    }
}
