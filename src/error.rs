use std::fmt;
use thiserror::Error;

/// Coarse classification of every failure the client can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnknownCollection,
    InvalidSearchTerms,
    CredentialsMissing,
    AuthenticationFailed,
    TransientNetwork,
    DownloadFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnknownCollection => "unknown collection",
            Self::InvalidSearchTerms => "invalid search terms",
            Self::CredentialsMissing => "credentials missing",
            Self::AuthenticationFailed => "authentication failed",
            Self::TransientNetwork => "transient network error",
            Self::DownloadFailed => "download failed",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unable to find collection with name {0}")]
    UnknownCollection(String),

    #[error("Invalid search terms: {0}")]
    InvalidSearchTerms(String),

    #[error("No credentials found for {0}")]
    CredentialsMissing(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Xml(#[from] roxmltree::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Archive(#[from] zip::result::ZipError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps a transport-level failure, treating timeouts and broken connections as transient.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            Self::TransientNetwork(err.to_string())
        } else {
            Self::Http(err)
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownCollection(_) => ErrorKind::UnknownCollection,
            Self::InvalidSearchTerms(_) => ErrorKind::InvalidSearchTerms,
            Self::CredentialsMissing(_) => ErrorKind::CredentialsMissing,
            Self::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            Self::TransientNetwork(_) => ErrorKind::TransientNetwork,
            Self::Http(e) if e.is_timeout() || e.is_connect() => ErrorKind::TransientNetwork,
            Self::Http(_)
            | Self::Json(_)
            | Self::Xml(_)
            | Self::Url(_)
            | Self::Io(_)
            | Self::Archive(_)
            | Self::DownloadFailed(_) => ErrorKind::DownloadFailed,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientNetwork
    }
}
