use super::Manager;
use crate::debuginfopb::{
    upload_request, InitiateUploadRequest, MarkUploadFinishedRequest, UploadInfo,
    UploadInstructions, UploadRequest, UploadStrategy,
};
use crate::objectfile::ObjectFile;
use anyhow::{anyhow, bail, Context};
use std::sync::Arc;
use std::time::Instant;
use tonic::Code;

const GRPC_UPLOAD_CHUNK_SIZE: usize = 1024 * 1024;
const DIAGNOSTIC_BODY_LIMIT: usize = 1024;

impl Manager {
    /// Uploads the debuginfo file to the backend, bounded by the global
    /// upload parallelism and deduplicated per build id.
    pub async fn upload(&self, dbg: Arc<ObjectFile>) -> anyhow::Result<()> {
        self.metrics.upload_requests.inc();

        match tokio::time::timeout(self.upload_timeout, self.upload_with_tokens(dbg)).await {
            Ok(result) => result,
            Err(_) => bail!("upload timed out after {:?}", self.upload_timeout),
        }
    }

    async fn upload_with_tokens(&self, dbg: Arc<ObjectFile>) -> anyhow::Result<()> {
        let build_id = dbg.build_id().to_string();

        let wait_start = Instant::now();
        let _permit = self
            .upload_task_tokens
            .acquire()
            .await
            .context("failed to acquire upload task token")?;
        let _inflight = self.metrics.upload_inflight.track();
        self.metrics
            .upload_request_wait_duration
            .observe(wait_start.elapsed());

        let upload_start = Instant::now();
        let (result, shared) = self
            .upload_singleflight
            .run(&build_id, || self.upload_inner(&dbg))
            .await;

        if shared {
            self.metrics.uploaded_shared.inc();
        } else if result.is_ok() {
            self.metrics.uploaded_success.inc();
            self.metrics.upload_duration.observe(upload_start.elapsed());
        } else {
            self.metrics.uploaded_fail.inc();
        }

        if let Err(err) = result {
            // Do not cache failed uploads.
            self.upload_singleflight.forget(&build_id);
            return Err(anyhow!(err));
        }
        Ok(())
    }

    async fn upload_inner(&self, dbg: &Arc<ObjectFile>) -> anyhow::Result<()> {
        let build_id = dbg.build_id();

        // The server may have accepted an upload since the first check.
        if !self.should_initiate(build_id, dbg.path()).await {
            return Ok(());
        }

        self.metrics.upload_attempts.inc();

        let hash = self.debuginfo_hash(dbg);
        let initiate_resp = match self
            .client
            .initiate_upload(InitiateUploadRequest {
                build_id: build_id.to_string(),
                hash,
                size: dbg.size() as i64,
            })
            .await
        {
            Ok(resp) => resp,
            Err(status) if status.code() == Code::AlreadyExists => {
                self.cache_should_skip(build_id);
                return Ok(());
            }
            Err(status) => return Err(status).context("failed to initiate upload"),
        };

        let instructions = initiate_resp
            .upload_instructions
            .ok_or_else(|| anyhow!("initiate upload response carried no upload instructions"))?;

        self.upload_file(&instructions, dbg)
            .await
            .context("failed to upload debuginfo")?;

        self.client
            .mark_upload_finished(MarkUploadFinishedRequest {
                build_id: build_id.to_string(),
                upload_id: instructions.upload_id.clone(),
            })
            .await
            .context("failed to mark upload finished")?;
        Ok(())
    }

    /// Content hash of the debuginfo file, memoized by (build id, modtime).
    fn debuginfo_hash(&self, dbg: &ObjectFile) -> String {
        let key = (dbg.build_id().to_string(), dbg.modtime().timestamp());
        if let Some(cache) = &self.hash_cache {
            if let Some(hash) = cache.get(&key) {
                self.metrics.hash_cache_hit.inc();
                return hash;
            }
        }
        self.metrics.hash_cache_miss.inc();
        let hash = sha256::digest(dbg.data());
        if let Some(cache) = &self.hash_cache {
            cache.insert(key, hash.clone());
        }
        hash
    }

    async fn upload_file(
        &self,
        instructions: &UploadInstructions,
        dbg: &Arc<ObjectFile>,
    ) -> anyhow::Result<()> {
        match UploadStrategy::try_from(instructions.upload_strategy) {
            Ok(UploadStrategy::Grpc) => {
                self.upload_via_grpc(instructions, dbg.data()).await?;
                Ok(())
            }
            Ok(UploadStrategy::SignedUrl) => {
                self.upload_via_signed_url(&instructions.signed_url, dbg)
                    .await
            }
            Ok(UploadStrategy::Unspecified) => {
                bail!("upload strategy unspecified, must be one of grpc or signed url")
            }
            Err(_) => bail!(
                "unknown upload strategy: {}",
                instructions.upload_strategy
            ),
        }
    }

    async fn upload_via_grpc(
        &self,
        instructions: &UploadInstructions,
        data: &[u8],
    ) -> anyhow::Result<u64> {
        let mut requests = Vec::with_capacity(data.len().div_ceil(GRPC_UPLOAD_CHUNK_SIZE) + 1);
        requests.push(UploadRequest {
            data: Some(upload_request::Data::Info(UploadInfo {
                build_id: instructions.build_id.clone(),
                upload_id: instructions.upload_id.clone(),
            })),
        });
        for chunk in data.chunks(GRPC_UPLOAD_CHUNK_SIZE) {
            requests.push(UploadRequest {
                data: Some(upload_request::Data::ChunkData(chunk.to_vec())),
            });
        }

        let response = self
            .client
            .upload(requests)
            .await
            .context("failed to upload over grpc")?;
        Ok(response.size)
    }

    async fn upload_via_signed_url(&self, url: &str, dbg: &Arc<ObjectFile>) -> anyhow::Result<()> {
        let url = url::Url::parse(url).context("failed to parse signed url")?;

        let response = self
            .http_client
            .put(url)
            .header(reqwest::header::CONTENT_LENGTH, dbg.size())
            .body(dbg.data().to_vec())
            .send()
            .await
            .context("failed to do upload request")?;

        let status = response.status();
        if !status.is_success() {
            let diagnostic = bounded_diagnostic_body(response).await;
            bail!("unexpected status code {status}: {diagnostic}");
        }
        Ok(())
    }
}

/// Reads at most `DIAGNOSTIC_BODY_LIMIT` bytes of the response body; the rest
/// of the stream is dropped unread.
async fn bounded_diagnostic_body(mut response: reqwest::Response) -> String {
    let mut body = Vec::new();
    while body.len() < DIAGNOSTIC_BODY_LIMIT {
        match response.chunk().await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            Ok(None) | Err(_) => break,
        }
    }
    body.truncate(DIAGNOSTIC_BODY_LIMIT);
    String::from_utf8_lossy(&body).into_owned()
}
