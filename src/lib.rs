//! Client for the Copernicus Data Space Ecosystem catalogue: lazily paginated searches
//! and authenticated, concurrent bulk downloads of the matching products.
pub mod baseline;
pub mod collections;
pub mod config;
pub mod credentials;
pub mod download;
pub mod error;
pub mod feature;
pub mod geometry;
pub mod manifest;
pub mod monitor;
pub mod netrc;
pub mod pool;
pub mod query;
pub mod retry;

pub use config::Settings;
pub use credentials::{validate_credentials, Credentials};
pub use download::{download_feature, DownloadOptions, DownloadResult, Outcome};
pub use error::{Error, ErrorKind, Result};
pub use feature::Feature;
pub use monitor::{Event, LoggingMonitor, NoopMonitor, StatusMonitor};
pub use pool::{download_features, DownloadIter};
pub use query::{Catalogue, CollectionDescription, FeatureQuery, SearchTerms, SearchValue};
