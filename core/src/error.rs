use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid link: {0}")]
    InvalidLink(String),
    #[error("unsupported resource kind: {0}")]
    UnsupportedResourceKind(String),
    #[error("metadata fetch failed: {0}")]
    MetadataFetchFailed(String),
    #[error("no match found for query: {0}")]
    NoMatchFound(String),
    #[error("stream download failed: {0}")]
    StreamDownloadFailed(String),
    #[error("all qualities exhausted for {0}")]
    AllQualitiesExhausted(String),
    #[error("thumbnail fetch failed: {0}")]
    ThumbnailFetchFailed(String),
    #[error("settings io error: {0}")]
    SettingsIo(String),
    #[error("invalid setting: {0}")]
    InvalidSetting(String),
    #[error("a download is already running")]
    Busy,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("version control error: {0}")]
    Vcs(String),
}

impl CoreError {
    /// Only a failed metadata fetch aborts a whole batch; everything else is
    /// absorbed at the item boundary.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(self, CoreError::MetadataFetchFailed(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
