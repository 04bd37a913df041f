//! Debuginfo upload lifecycle for discovered executables.
//!
//! For every executable the discovery loop hands over, the [`Manager`] asks
//! the backend whether an upload is wanted, locates or extracts the debuginfo
//! file, and uploads it under bounded parallelism. Extraction and upload are
//! each deduplicated per build id through a keyed single-flight group.

mod client;
mod metrics;
mod singleflight;
mod upload;

pub use client::DebuginfoClient;
pub use metrics::Metrics;

use crate::debuginfopb::ShouldInitiateUploadRequest;
use crate::objectfile::{ObjectFile, Pool};
use anyhow::Context;
use object::Object;
use std::fs;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

const HASH_CACHE_IDLE_DURATION: Duration = Duration::from_secs(5 * 60);
const CACHE_MAX_ENTRIES: u64 = 10_000;

/// Locates an installed sibling debuginfo file for an executable, typically
/// under `/usr/lib/debug`.
pub trait Finder: Send + Sync {
    fn find(&self, root: &Path, src: &ObjectFile) -> anyhow::Result<PathBuf>;
}

/// Strips the debug information of an executable into `dst`.
pub trait Extractor: Send + Sync {
    fn extract(&self, dst: &mut fs::File, src: &mut dyn Read) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct Config {
    pub upload_max_parallel: usize,
    pub upload_timeout: Duration,
    pub cache_disabled: bool,
    /// Write-TTL of the should-initiate cache.
    pub cache_ttl: Duration,
    pub strip_debuginfos: bool,
    pub temp_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upload_max_parallel: 25,
            upload_timeout: Duration::from_secs(2 * 60),
            cache_disabled: false,
            cache_ttl: Duration::from_secs(5 * 60),
            strip_debuginfos: true,
            temp_dir: std::env::temp_dir(),
        }
    }
}

pub struct Manager {
    metrics: Arc<Metrics>,
    obj_file_pool: Arc<Pool>,
    client: Arc<dyn DebuginfoClient>,
    finder: Arc<dyn Finder>,
    extractor: Arc<dyn Extractor>,
    http_client: reqwest::Client,

    strip_debuginfos: bool,
    temp_dir: PathBuf,

    // Build ids the server declined; no upload is initiated while cached.
    should_initiate_cache: Option<moka::sync::Cache<String, ()>>,
    hash_cache: Option<moka::sync::Cache<(String, i64), String>>,

    extract_singleflight: singleflight::Group<Arc<ObjectFile>>,
    upload_singleflight: singleflight::Group<()>,
    upload_timeout: Duration,
    upload_task_tokens: Semaphore,
}

impl Manager {
    pub fn new(
        obj_file_pool: Arc<Pool>,
        client: Arc<dyn DebuginfoClient>,
        finder: Arc<dyn Finder>,
        extractor: Arc<dyn Extractor>,
        config: Config,
    ) -> Self {
        let (should_initiate_cache, hash_cache) = if config.cache_disabled {
            (None, None)
        } else {
            (
                Some(
                    moka::sync::Cache::builder()
                        .max_capacity(CACHE_MAX_ENTRIES)
                        .time_to_live(config.cache_ttl)
                        .build(),
                ),
                Some(
                    moka::sync::Cache::builder()
                        .max_capacity(CACHE_MAX_ENTRIES)
                        .time_to_idle(HASH_CACHE_IDLE_DURATION)
                        .build(),
                ),
            )
        };

        Self {
            metrics: Arc::new(Metrics::default()),
            obj_file_pool,
            client,
            finder,
            extractor,
            http_client: reqwest::Client::new(),

            strip_debuginfos: config.strip_debuginfos,
            temp_dir: config.temp_dir,

            should_initiate_cache,
            hash_cache,

            extract_singleflight: singleflight::Group::new(),
            upload_singleflight: singleflight::Group::new(),
            upload_timeout: config.upload_timeout,
            upload_task_tokens: Semaphore::new(config.upload_max_parallel),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Makes sure the debuginfo associated with the executable has been
    /// uploaded to the backend, finding or extracting it first if needed.
    pub async fn ensure_uploaded(&self, root: &Path, src: Arc<ObjectFile>) -> anyhow::Result<()> {
        // All caches and references key off the source file's build id.
        if !self.should_initiate(src.build_id(), src.path()).await {
            self.metrics.ensure_uploaded_shared.inc();
            return Ok(());
        }

        let result = self.ensure_uploaded_inner(root, &src).await;
        match &result {
            Ok(()) => self.metrics.ensure_uploaded_success.inc(),
            Err(_) => self.metrics.ensure_uploaded_fail.inc(),
        }
        result
    }

    async fn ensure_uploaded_inner(&self, root: &Path, src: &Arc<ObjectFile>) -> anyhow::Result<()> {
        let dbg = match src.debug_file() {
            // An earlier cycle already found or extracted the debug file.
            Some(dbg) => dbg,
            None => {
                // Uploads run asynchronously, but short-lived processes may
                // exit long before their turn; find or extract synchronously
                // while the executable is still around.
                let dbg = match self.extract_or_find(root, src).await {
                    Ok(dbg) => dbg,
                    Err(err) => {
                        self.metrics.ensure_uploaded_errors_extract_or_find.inc();
                        return Err(err);
                    }
                };
                if !Arc::ptr_eq(&dbg, src) {
                    src.set_debug_file(dbg.clone());
                }
                dbg
            }
        };

        if let Err(err) = self.upload(dbg).await {
            self.metrics.ensure_uploaded_errors_upload.inc();
            return Err(err);
        }
        Ok(())
    }

    /// Whether an upload should be initiated for the build id. Backend errors
    /// fail open so the upload is attempted rather than silently dropped.
    async fn should_initiate(&self, build_id: &str, path: &Path) -> bool {
        if let Some(cache) = &self.should_initiate_cache {
            if cache.get(build_id).is_some() {
                self.metrics.should_initiate_cache_hit.inc();
                return false;
            }
        }
        self.metrics.should_initiate_cache_miss.inc();

        match self
            .client
            .should_initiate_upload(ShouldInitiateUploadRequest {
                build_id: build_id.to_string(),
            })
            .await
        {
            Ok(resp) => {
                if !resp.should_initiate_upload {
                    self.cache_should_skip(build_id);
                    return false;
                }
                true
            }
            Err(err) => {
                log::error!(
                    "failed to check whether build id {build_id} needs uploading (path {}): {err}",
                    path.display()
                );
                true
            }
        }
    }

    fn cache_should_skip(&self, build_id: &str) {
        if let Some(cache) = &self.should_initiate_cache {
            cache.insert(build_id.to_string(), ());
        }
    }

    /// Finds an installed debuginfo file for the executable, falling back to
    /// extracting one from the executable itself.
    pub async fn extract_or_find(
        &self,
        root: &Path,
        src: &Arc<ObjectFile>,
    ) -> anyhow::Result<Arc<ObjectFile>> {
        let start = Instant::now();
        match self.finder.find(root, src) {
            Ok(path) if !path.as_os_str().is_empty() => {
                self.metrics.found_success.inc();
                self.metrics.find_duration.observe(start.elapsed());
                match self.obj_file_pool.open(&path) {
                    Ok(dbg) => return Ok(dbg),
                    Err(err) => {
                        log::debug!("failed to open debuginfo file {}: {err:#}", path.display())
                    }
                }
            }
            _ => self.metrics.found_fail.inc(),
        }

        self.extract(src).await.context("failed to strip debuginfo")
    }

    /// Extracts the debug sections of the executable into a standalone file,
    /// deduplicated per build id across concurrent calls. Executables without
    /// a `.text` section are uploaded as they are.
    pub async fn extract(&self, src: &Arc<ObjectFile>) -> anyhow::Result<Arc<ObjectFile>> {
        let build_id = src.build_id().to_string();

        let binary_has_text_section = {
            let elf = src.elf()?;
            has_text_section(&elf)
        };

        if !(self.strip_debuginfos && binary_has_text_section) {
            return Ok(src.clone());
        }

        let (result, shared) = self
            .extract_singleflight
            .run(&build_id, || self.extract_inner(&build_id, src))
            .await;
        match result {
            Ok(dbg) => Ok(dbg),
            Err(err) => {
                if shared {
                    self.extract_singleflight.forget(&build_id);
                }
                Err(anyhow::anyhow!(err))
            }
        }
    }

    async fn extract_inner(
        &self,
        build_id: &str,
        src: &Arc<ObjectFile>,
    ) -> anyhow::Result<Arc<ObjectFile>> {
        let start = Instant::now();
        let result = self.strip(build_id, src);
        match &result {
            Ok(_) => {
                self.metrics.extracted_success.inc();
                self.metrics.extract_duration.observe(start.elapsed());
            }
            Err(_) => self.metrics.extracted_fail.inc(),
        }
        result
    }

    fn strip(&self, build_id: &str, src: &Arc<ObjectFile>) -> anyhow::Result<Arc<ObjectFile>> {
        fs::create_dir_all(&self.temp_dir).context("failed to create temp dir")?;
        let temp = tempfile::Builder::new()
            .prefix(build_id)
            .tempfile_in(&self.temp_dir)
            .context("failed to create temp file")?;
        let (mut file, temp_path) = temp.into_parts();
        let path = temp_path.to_path_buf();
        // Unlink right away; the descriptor keeps the contents alive.
        drop(temp_path);

        let mut reader = std::io::Cursor::new(src.data());
        self.extractor
            .extract(&mut file, &mut reader)
            .context("failed to extract debug information")?;
        file.rewind()
            .context("failed to seek to the beginning of the file")?;

        self.obj_file_pool
            .new_file(file, &path)
            .context("failed to open extracted debuginfo file")
    }
}

/// Whether the ELF file has a `.text` section.
fn has_text_section(elf: &object::File<'_>) -> bool {
    elf.section_by_name(".text").is_some()
}
