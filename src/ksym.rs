use std::collections::{HashMap, HashSet};

/// Resolves kernel virtual addresses to symbol names. The profile converter
/// batches all kernel-stack addresses of a capture window into one call.
pub trait KernelSymbolizer: Send + Sync {
    fn resolve(&self, addrs: &HashSet<u64>) -> anyhow::Result<HashMap<u64, String>>;
}
