//! Error kinds shared by every stage of the payload reader and extraction
//! engine (source I/O, ZIP location, manifest parsing, operation execution,
//! scheduling).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open source {0:?}: {1}")]
    SourceOpenFailed(String, #[source] std::io::Error),

    #[error("HTTP request to {url} failed (attempt {attempt}): {message}")]
    HttpTransient {
        url: String,
        attempt: u32,
        message: String,
    },

    #[error("HTTP request to {url} failed permanently: {message}")]
    HttpFatal { url: String, message: String },

    #[error("malformed ZIP container: {0}")]
    ZipMalformed(String),

    #[error("`payload.bin` not found inside ZIP")]
    PayloadNotFoundInZip,

    #[error("unrecognized payload format: {0}")]
    PayloadUnknownFormat(String),

    #[error("corrupt or unparsable manifest: {0}")]
    ManifestCorrupt(String),

    #[error("partition {partition:?} operation {index} has unsupported type {op_type}")]
    UnsupportedOperation {
        partition: String,
        index: usize,
        op_type: i32,
    },

    #[error("failed to decompress operation data: {0}")]
    DecompressionFailed(String),

    #[error("failed to write partition image: {0}")]
    WriteFailed(#[from] std::io::Error),

    #[error("partition {0:?} not found in manifest")]
    PartitionNotFound(String),

    #[error("extraction cancelled")]
    Cancelled,
}
