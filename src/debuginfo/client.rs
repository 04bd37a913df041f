use crate::debuginfopb::{
    InitiateUploadRequest, InitiateUploadResponse, MarkUploadFinishedRequest,
    MarkUploadFinishedResponse, ShouldInitiateUploadRequest, ShouldInitiateUploadResponse,
    UploadRequest, UploadResponse,
};
use tonic::{async_trait, Status};

/// Client surface of the remote debuginfo service. The embedding agent
/// implements this over its gRPC channel; the upload stream goes over the
/// same connection.
#[async_trait]
pub trait DebuginfoClient: Send + Sync {
    async fn should_initiate_upload(
        &self,
        request: ShouldInitiateUploadRequest,
    ) -> Result<ShouldInitiateUploadResponse, Status>;

    async fn initiate_upload(
        &self,
        request: InitiateUploadRequest,
    ) -> Result<InitiateUploadResponse, Status>;

    async fn mark_upload_finished(
        &self,
        request: MarkUploadFinishedRequest,
    ) -> Result<MarkUploadFinishedResponse, Status>;

    /// Client-streaming upload; the first message carries the upload info,
    /// the rest carry chunk data.
    async fn upload(&self, requests: Vec<UploadRequest>) -> Result<UploadResponse, Status>;
}
