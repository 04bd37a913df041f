//! Converts batches of raw stack samples into pprof profiles.
//!
//! A [`Converter`] is built per `(pid, capture window)` and used exactly
//! once: mappings go in at construction, [`Converter::convert`] consumes the
//! converter and yields the finished profile. Frames are routed through one
//! of five symbolization paths (kernel, vdso, perf-map, jitdump, native
//! address) and deduplicated into the profile's location/function tables.

use crate::ksym::KernelSymbolizer;
use crate::metrics::Counter;
use crate::perf::{JitdumpCache, Map, PerfMapCache};
use crate::pprofpb;
use crate::process::Mapping;
use crate::vdso::VdsoSymbolizer;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const KERNEL_MAPPING_FILE: &str = "[kernel.kallsyms]";
const VDSO_MAPPING_FILE: &str = "[vdso]";
const PERF_MAP_MAPPING_FILE: &str = "jit";
// The suffix is only a convention; checking the jitdump magic number of the
// mapped file would be authoritative.
const JITDUMP_MAPPING_SUFFIX: &str = ".dump";

const SYMBOL_NOT_FOUND: &str = "not found";
const SYMBOL_UNKNOWN: &str = "unknown";

/// One stack captured by the sampler, leaf-first.
#[derive(Debug, Clone, Default)]
pub struct RawSample {
    pub value: u64,
    pub user_stack: Vec<u64>,
    pub kernel_stack: Vec<u64>,
}

/// Converts a runtime virtual address in a mapping to a file-relative one.
pub trait AddressNormalizer: Send + Sync {
    fn normalize(&self, mapping: &Mapping, addr: u64) -> anyhow::Result<u64>;
}

/// Normalizer that relies on the load bias recorded on the mapping itself.
pub struct MappingNormalizer;

impl AddressNormalizer for MappingNormalizer {
    fn normalize(&self, mapping: &Mapping, addr: u64) -> anyhow::Result<u64> {
        Ok(mapping.normalize(addr)?)
    }
}

#[derive(Debug, Default)]
pub struct ConverterMetrics {
    /// User frames dropped because no mapping covers their address.
    pub frame_drop_mapping_nil: Counter,
}

/// Interns strings into the profile's string table. Index 0 is the empty
/// string.
#[derive(Debug)]
struct StringTable {
    strings: Vec<String>,
    index: HashMap<String, i64>,
}

impl StringTable {
    fn new() -> Self {
        Self {
            strings: vec![String::new()],
            index: HashMap::from([(String::new(), 0)]),
        }
    }

    fn add(&mut self, s: &str) -> i64 {
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let idx = self.strings.len() as i64;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), idx);
        idx
    }

    fn finish(self) -> Vec<String> {
        self.strings
    }
}

pub struct Converter {
    normalizer: Arc<dyn AddressNormalizer>,
    ksym: Arc<dyn KernelSymbolizer>,
    vdso_symbolizer: Arc<dyn VdsoSymbolizer>,
    perf_map_cache: Arc<dyn PerfMapCache>,
    jitdump_cache: Arc<dyn JitdumpCache>,
    metrics: Arc<ConverterMetrics>,
    disable_jit_symbolization: bool,

    // The shared caches stat the backing file on every retrieval; these memos
    // limit that to once per (pid, path) per conversion, errors included.
    cached_perf_map: Option<Result<Arc<Map>, Arc<anyhow::Error>>>,
    cached_jitdump: HashMap<String, Result<Arc<Map>, Arc<anyhow::Error>>>,

    function_index: HashMap<String, u64>,
    addr_location_index: HashMap<u64, u64>,
    perfmap_location_index: HashMap<String, u64>,
    jitdump_location_index: HashMap<String, u64>,
    kernel_location_index: HashMap<String, u64>,
    vdso_location_index: HashMap<String, u64>,

    pid: i32,
    mappings: Vec<Mapping>,
    kernel_mapping_id: u64,
    capture_time: DateTime<Utc>,

    strings: StringTable,
    result: pprofpb::Profile,
}

impl Converter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        normalizer: Arc<dyn AddressNormalizer>,
        ksym: Arc<dyn KernelSymbolizer>,
        vdso_symbolizer: Arc<dyn VdsoSymbolizer>,
        perf_map_cache: Arc<dyn PerfMapCache>,
        jitdump_cache: Arc<dyn JitdumpCache>,
        metrics: Arc<ConverterMetrics>,
        disable_jit_symbolization: bool,
        pid: i32,
        mappings: Vec<Mapping>,
        capture_time: DateTime<Utc>,
        period_ns: i64,
    ) -> Self {
        let mut strings = StringTable::new();

        let mut pprof_mappings = Vec::with_capacity(mappings.len() + 1);
        for (i, mapping) in mappings.iter().enumerate() {
            pprof_mappings.push(pprofpb::Mapping {
                id: i as u64 + 1,
                memory_start: mapping.start,
                memory_limit: mapping.limit,
                file_offset: mapping.offset,
                filename: strings.add(&mapping.file),
                build_id: strings.add(&mapping.build_id),
                ..Default::default()
            });
        }
        // 1-based ids, so the synthetic kernel mapping lands at len + 1.
        let kernel_mapping_id = mappings.len() as u64 + 1;
        pprof_mappings.push(pprofpb::Mapping {
            id: kernel_mapping_id,
            filename: strings.add(KERNEL_MAPPING_FILE),
            ..Default::default()
        });

        let sample_type = vec![pprofpb::ValueType {
            r#type: strings.add("samples"),
            unit: strings.add("count"),
        }];
        // Sampling at 100Hz would be every 10 million nanoseconds.
        let period_type = Some(pprofpb::ValueType {
            r#type: strings.add("cpu"),
            unit: strings.add("nanoseconds"),
        });

        Self {
            normalizer,
            ksym,
            vdso_symbolizer,
            perf_map_cache,
            jitdump_cache,
            metrics,
            disable_jit_symbolization,

            cached_perf_map: None,
            cached_jitdump: HashMap::new(),

            function_index: HashMap::new(),
            addr_location_index: HashMap::new(),
            perfmap_location_index: HashMap::new(),
            jitdump_location_index: HashMap::new(),
            kernel_location_index: HashMap::new(),
            vdso_location_index: HashMap::new(),

            pid,
            mappings,
            kernel_mapping_id,
            capture_time,

            strings,
            result: pprofpb::Profile {
                time_nanos: capture_time.timestamp_nanos_opt().unwrap_or_default(),
                period: period_ns,
                sample_type,
                period_type,
                mapping: pprof_mappings,
                ..Default::default()
            },
        }
    }

    /// Converts the raw samples into the finished profile, consuming the
    /// converter.
    pub fn convert(mut self, raw_samples: &[RawSample]) -> pprofpb::Profile {
        let mut kernel_addresses = HashSet::new();
        for sample in raw_samples {
            kernel_addresses.extend(sample.kernel_stack.iter().copied());
        }

        let kernel_symbols = match self.ksym.resolve(&kernel_addresses) {
            Ok(symbols) => symbols,
            Err(err) => {
                log::debug!(
                    "failed to resolve kernel symbols for pid {}, continuing without: {err:#}",
                    self.pid
                );
                HashMap::new()
            }
        };

        for sample in raw_samples {
            let mut location_ids =
                Vec::with_capacity(sample.kernel_stack.len() + sample.user_stack.len());

            for addr in &sample.kernel_stack {
                location_ids.push(self.add_kernel_location(&kernel_symbols, *addr));
            }

            for addr in &sample.user_stack {
                let Some(mapping_index) = self.mapping_for_addr(*addr) else {
                    self.metrics.frame_drop_mapping_nil.inc();
                    // Normalization would fail anyway, skip the frame.
                    continue;
                };

                let process_mapping = self.mappings[mapping_index].clone();
                let location_id = if process_mapping.file == VDSO_MAPPING_FILE {
                    self.add_vdso_location(&process_mapping, mapping_index, *addr)
                } else if process_mapping.file == PERF_MAP_MAPPING_FILE {
                    self.add_perf_map_location(mapping_index, *addr)
                } else if process_mapping.file.ends_with(JITDUMP_MAPPING_SUFFIX) {
                    self.add_jitdump_location(mapping_index, *addr, &process_mapping.file)
                } else {
                    self.add_addr_location(&process_mapping, mapping_index, *addr)
                };
                location_ids.push(location_id);
            }

            self.result.sample.push(pprofpb::Sample {
                location_id: location_ids,
                value: vec![sample.value as i64],
                ..Default::default()
            });
        }

        self.result.duration_nanos = (Utc::now() - self.capture_time)
            .num_nanoseconds()
            .unwrap_or_default();
        self.result.string_table = self.strings.finish();
        self.result
    }

    fn mapping_for_addr(&self, addr: u64) -> Option<usize> {
        self.mappings.iter().position(|m| m.contains(addr))
    }

    fn add_kernel_location(&mut self, kernel_symbols: &HashMap<u64, String>, addr: u64) -> u64 {
        let symbol = kernel_symbols
            .get(&addr)
            .cloned()
            .unwrap_or_else(|| SYMBOL_NOT_FOUND.to_string());

        if let Some(&id) = self.kernel_location_index.get(&symbol) {
            return id;
        }

        let function_id = self.add_function(&symbol);
        let id = self.result.location.len() as u64 + 1;
        self.result.location.push(pprofpb::Location {
            id,
            mapping_id: self.kernel_mapping_id,
            line: vec![pprofpb::Line {
                function_id,
                ..Default::default()
            }],
            ..Default::default()
        });
        self.kernel_location_index.insert(symbol, id);
        id
    }

    fn add_vdso_location(
        &mut self,
        process_mapping: &Mapping,
        mapping_index: usize,
        addr: u64,
    ) -> u64 {
        let function_name = match self.vdso_symbolizer.resolve(addr, Some(process_mapping)) {
            Ok(name) => name,
            Err(err) => {
                log::debug!("failed to symbolize vdso address {addr:#x}: {err:#}");
                SYMBOL_UNKNOWN.to_string()
            }
        };

        if let Some(&id) = self.vdso_location_index.get(&function_name) {
            return id;
        }

        let function_id = self.add_function(&function_name);
        let id = self.result.location.len() as u64 + 1;
        self.result.location.push(pprofpb::Location {
            id,
            mapping_id: mapping_index as u64 + 1,
            line: vec![pprofpb::Line {
                function_id,
                ..Default::default()
            }],
            ..Default::default()
        });
        self.vdso_location_index.insert(function_name, id);
        id
    }

    fn add_addr_location(
        &mut self,
        process_mapping: &Mapping,
        mapping_index: usize,
        addr: u64,
    ) -> u64 {
        let normalized = match self.normalizer.normalize(process_mapping, addr) {
            Ok(normalized) => normalized,
            Err(err) => {
                log::debug!("failed to normalize address {addr:#x}: {err:#}");
                addr
            }
        };
        self.add_addr_location_no_normalization(mapping_index, normalized)
    }

    fn add_addr_location_no_normalization(&mut self, mapping_index: usize, addr: u64) -> u64 {
        if let Some(&id) = self.addr_location_index.get(&addr) {
            return id;
        }

        let id = self.result.location.len() as u64 + 1;
        self.result.location.push(pprofpb::Location {
            id,
            mapping_id: mapping_index as u64 + 1,
            address: addr,
            ..Default::default()
        });
        self.addr_location_index.insert(addr, id);
        id
    }

    fn add_perf_map_location(&mut self, mapping_index: usize, addr: u64) -> u64 {
        if self.disable_jit_symbolization {
            return self.add_addr_location_no_normalization(mapping_index, addr);
        }

        let perf_map = match self.perf_map() {
            Ok(map) => map,
            Err(err) => {
                log::debug!("failed to get perf map for pid {}: {err:#}", self.pid);
                return self.add_addr_location_no_normalization(mapping_index, addr);
            }
        };

        let symbol = match perf_map.lookup(addr) {
            Ok(symbol) => symbol.to_string(),
            Err(err) => {
                log::debug!("failed to look up perf map symbol for address {addr:#x}: {err:#}");
                return self.add_addr_location_no_normalization(mapping_index, addr);
            }
        };

        if let Some(&id) = self.perfmap_location_index.get(&symbol) {
            return id;
        }

        let function_id = self.add_function(&symbol);
        let id = self.result.location.len() as u64 + 1;
        self.result.location.push(pprofpb::Location {
            id,
            mapping_id: mapping_index as u64 + 1,
            line: vec![pprofpb::Line {
                function_id,
                ..Default::default()
            }],
            ..Default::default()
        });
        self.perfmap_location_index.insert(symbol, id);
        id
    }

    fn add_jitdump_location(&mut self, mapping_index: usize, addr: u64, path: &str) -> u64 {
        if self.disable_jit_symbolization {
            return self.add_addr_location_no_normalization(mapping_index, addr);
        }

        let jitdump = match self.jitdump(path) {
            Ok(map) => map,
            Err(err) => {
                log::debug!("failed to get jitdump {path} for pid {}: {err:#}", self.pid);
                return self.add_addr_location_no_normalization(mapping_index, addr);
            }
        };

        let symbol = match jitdump.lookup(addr) {
            Ok(symbol) => symbol.to_string(),
            Err(err) => {
                log::debug!("failed to look up jitdump symbol for address {addr:#x}: {err:#}");
                return self.add_addr_location_no_normalization(mapping_index, addr);
            }
        };

        if let Some(&id) = self.jitdump_location_index.get(&symbol) {
            return id;
        }

        let function_id = self.add_function(&symbol);
        let id = self.result.location.len() as u64 + 1;
        self.result.location.push(pprofpb::Location {
            id,
            mapping_id: mapping_index as u64 + 1,
            line: vec![pprofpb::Line {
                function_id,
                ..Default::default()
            }],
            ..Default::default()
        });
        self.jitdump_location_index.insert(symbol, id);
        id
    }

    fn perf_map(&mut self) -> Result<Arc<Map>, Arc<anyhow::Error>> {
        if self.cached_perf_map.is_none() {
            self.cached_perf_map = Some(
                self.perf_map_cache
                    .perf_map_for_pid(self.pid)
                    .map_err(Arc::new),
            );
        }
        self.cached_perf_map.clone().unwrap()
    }

    fn jitdump(&mut self, path: &str) -> Result<Arc<Map>, Arc<anyhow::Error>> {
        if let Some(cached) = self.cached_jitdump.get(path) {
            return cached.clone();
        }
        let result = self
            .jitdump_cache
            .jitdump_for_pid(self.pid, path)
            .map_err(Arc::new);
        self.cached_jitdump.insert(path.to_string(), result.clone());
        result
    }

    fn add_function(&mut self, name: &str) -> u64 {
        if let Some(&id) = self.function_index.get(name) {
            return id;
        }

        let id = self.result.function.len() as u64 + 1;
        let name_idx = self.strings.add(name);
        self.result.function.push(pprofpb::Function {
            id,
            name: name_idx,
            ..Default::default()
        });
        self.function_index.insert(name.to_string(), id);
        id
    }
}
