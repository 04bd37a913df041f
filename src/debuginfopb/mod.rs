//! Wire messages of the remote debuginfo service.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShouldInitiateUploadRequest {
    #[prost(string, tag = "1")]
    pub build_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShouldInitiateUploadResponse {
    #[prost(bool, tag = "1")]
    pub should_initiate_upload: bool,
    #[prost(string, tag = "2")]
    pub reason: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitiateUploadRequest {
    #[prost(string, tag = "1")]
    pub build_id: String,
    #[prost(string, tag = "2")]
    pub hash: String,
    #[prost(int64, tag = "3")]
    pub size: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitiateUploadResponse {
    #[prost(message, optional, tag = "1")]
    pub upload_instructions: Option<UploadInstructions>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UploadInstructions {
    #[prost(string, tag = "1")]
    pub build_id: String,
    #[prost(string, tag = "2")]
    pub upload_id: String,
    #[prost(enumeration = "UploadStrategy", tag = "3")]
    pub upload_strategy: i32,
    #[prost(string, tag = "4")]
    pub signed_url: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum UploadStrategy {
    Unspecified = 0,
    Grpc = 1,
    SignedUrl = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MarkUploadFinishedRequest {
    #[prost(string, tag = "1")]
    pub build_id: String,
    #[prost(string, tag = "2")]
    pub upload_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MarkUploadFinishedResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UploadInfo {
    #[prost(string, tag = "1")]
    pub build_id: String,
    #[prost(string, tag = "2")]
    pub upload_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UploadRequest {
    #[prost(oneof = "upload_request::Data", tags = "1, 2")]
    pub data: Option<upload_request::Data>,
}

pub mod upload_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Data {
        #[prost(message, tag = "1")]
        Info(super::UploadInfo),
        #[prost(bytes, tag = "2")]
        ChunkData(Vec<u8>),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UploadResponse {
    #[prost(string, tag = "1")]
    pub build_id: String,
    #[prost(uint64, tag = "2")]
    pub size: u64,
}
