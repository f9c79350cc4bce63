//! Downloading single features.
//!
//! Bytes always land in a uniquely named temporary file inside the destination
//! directory and are renamed into place once complete, so an interrupted transfer
//! never leaves a file under its final name.
use reqwest::blocking::{Client, Response};
use reqwest::header::LOCATION;
use reqwest::StatusCode;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;
use zip::ZipArchive;

use crate::config::Settings;
use crate::credentials::Credentials;
use crate::error::{Error, ErrorKind, Result};
use crate::feature::Feature;
use crate::manifest::{node_url, Manifest, ManifestKind};
use crate::monitor::{Event, NoopMonitor, StatusMonitor};

pub type OutputFilename = Arc<dyn Fn(&Feature) -> String + Send + Sync>;

pub fn default_output_filename(feature: &Feature) -> String {
    format!("{}.zip", feature.title())
}

#[derive(Clone)]
pub struct DownloadOptions {
    /// Resolved from the login file when absent.
    pub credentials: Option<Arc<Credentials>>,
    pub concurrency: usize,
    pub monitor: Arc<dyn StatusMonitor>,
    pub output_filename: OutputFilename,
    /// Unpack the archive and remove it once unpacked.
    pub extract: bool,
    pub overwrite_existing: bool,
    /// Fetch only the files of the product whose manifest path matches this glob.
    pub filter_pattern: Option<String>,
    pub settings: Settings,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            credentials: None,
            concurrency: 1,
            monitor: Arc::new(NoopMonitor),
            output_filename: Arc::new(default_output_filename),
            extract: false,
            overwrite_existing: false,
            filter_pattern: None,
            settings: Settings::default(),
        }
    }
}

impl fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("credentials", &self.credentials)
            .field("concurrency", &self.concurrency)
            .field("extract", &self.extract)
            .field("overwrite_existing", &self.overwrite_existing)
            .field("filter_pattern", &self.filter_pattern)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Downloaded(PathBuf),
    /// Already present from an earlier run.
    Skipped(PathBuf),
    Failed { kind: ErrorKind, message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadResult {
    pub feature_id: String,
    pub title: String,
    pub outcome: Outcome,
}

impl DownloadResult {
    fn new(feature: &Feature, outcome: Outcome) -> Self {
        Self {
            feature_id: feature.id.clone(),
            title: feature.title().to_string(),
            outcome,
        }
    }

    pub(crate) fn failed(feature: &Feature, err: &Error) -> Self {
        Self::new(
            feature,
            Outcome::Failed {
                kind: err.kind(),
                message: err.to_string(),
            },
        )
    }

    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, Outcome::Failed { .. })
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.outcome {
            Outcome::Downloaded(path) | Outcome::Skipped(path) => Some(path),
            Outcome::Failed { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            Outcome::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl fmt::Display for DownloadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Outcome::Downloaded(path) => {
                write!(f, "{} downloaded to {}", self.feature_id, path.display())
            }
            Outcome::Skipped(path) => {
                write!(f, "{} already present at {}", self.feature_id, path.display())
            }
            Outcome::Failed { kind, message } => {
                write!(f, "{} failed ({}): {}", self.feature_id, kind, message)
            }
        }
    }
}

/// Path that marks a feature as complete: the archive, the unpacked directory, or
/// the filtered product directory.
fn target_path(feature: &Feature, dest: &Path, options: &DownloadOptions) -> Result<PathBuf> {
    if feature.title().is_empty() {
        return Err(Error::DownloadFailed(format!(
            "Feature {} has no title",
            feature.id
        )));
    }
    if options.filter_pattern.is_some() {
        return Ok(dest.join(feature.title()));
    }
    let filename = (options.output_filename)(feature);
    if options.extract {
        let stem = Path::new(&filename)
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_else(|| filename.clone().into());
        return Ok(dest.join(stem));
    }
    Ok(dest.join(filename))
}

fn already_complete(target: &Path, options: &DownloadOptions) -> bool {
    !options.overwrite_existing && target.exists()
}

/// Downloads one feature into `dest`. Never panics or returns early with an error:
/// every failure is reported in the result.
pub fn download_feature(feature: &Feature, dest: &Path, options: &DownloadOptions) -> DownloadResult {
    if let Ok(target) = target_path(feature, dest, options) {
        if already_complete(&target, options) {
            debug!("{} already exists, skipping", target.display());
            options.monitor.notify(&feature.id, &Event::Done);
            return DownloadResult::new(feature, Outcome::Skipped(target));
        }
    }
    match Downloader::new(options.clone()) {
        Ok(downloader) => downloader.download(feature, dest),
        Err(e) => {
            options.monitor.notify(&feature.id, &Event::Failed(e.kind()));
            DownloadResult::failed(feature, &e)
        }
    }
}

enum Attempt {
    Unauthorized,
    Failed(Error),
}

impl From<Error> for Attempt {
    fn from(err: Error) -> Self {
        Self::Failed(err)
    }
}

impl From<io::Error> for Attempt {
    fn from(err: io::Error) -> Self {
        Self::Failed(Error::Io(err))
    }
}

impl From<url::ParseError> for Attempt {
    fn from(err: url::ParseError) -> Self {
        Self::Failed(Error::Url(err))
    }
}

/// Shared by every worker of one download run.
pub(crate) struct Downloader {
    credentials: Arc<Credentials>,
    client: Client,
    options: DownloadOptions,
}

impl Downloader {
    pub(crate) fn new(options: DownloadOptions) -> Result<Self> {
        let credentials = match &options.credentials {
            Some(credentials) => Arc::clone(credentials),
            None => Arc::new(Credentials::resolve(None, None, &options.settings)?),
        };
        let client = options.settings.http.transfer_client()?;
        Ok(Self {
            credentials,
            client,
            options,
        })
    }

    pub(crate) fn monitor(&self) -> &dyn StatusMonitor {
        self.options.monitor.as_ref()
    }

    pub(crate) fn download(&self, feature: &Feature, dest: &Path) -> DownloadResult {
        let monitor = self.monitor();
        monitor.notify(&feature.id, &Event::Started);

        match self.try_download(feature, dest) {
            Ok(outcome) => {
                monitor.notify(&feature.id, &Event::Done);
                DownloadResult::new(feature, outcome)
            }
            Err(e) => {
                error!("Failed to download {}: {}", feature.id, e);
                monitor.notify(&feature.id, &Event::Failed(e.kind()));
                DownloadResult::failed(feature, &e)
            }
        }
    }

    fn try_download(&self, feature: &Feature, dest: &Path) -> Result<Outcome> {
        let target = target_path(feature, dest, &self.options)?;
        if already_complete(&target, &self.options) {
            debug!("{} already exists, skipping", target.display());
            return Ok(Outcome::Skipped(target));
        }
        fs::create_dir_all(dest)?;

        if let Some(pattern) = &self.options.filter_pattern {
            self.download_filtered(feature, dest, pattern, &target)?;
            info!("Downloaded selected files of {}", feature.title());
            return Ok(Outcome::Downloaded(target));
        }

        let url = feature.product_url().ok_or_else(|| {
            Error::DownloadFailed(format!("Feature {} has no download link", feature.id))
        })?;
        let archive = dest.join((self.options.output_filename)(feature));
        self.fetch(&Url::parse(&url)?, &feature.id, &archive)?;

        if self.options.extract {
            unpack(&archive, dest, &target)?;
        }
        info!("Downloaded {}", target.display());
        Ok(Outcome::Downloaded(target))
    }

    fn download_filtered(
        &self,
        feature: &Feature,
        dest: &Path,
        pattern: &str,
        target: &Path,
    ) -> Result<()> {
        let title = feature.title();
        let collection = feature.properties.collection.as_deref().unwrap_or_default();
        let kind = ManifestKind::for_collection(collection).ok_or_else(|| {
            Error::DownloadFailed(format!(
                "Selecting files is not supported for collection {:?} ({})",
                collection, title
            ))
        })?;

        let staging = tempfile::Builder::new()
            .prefix(&format!(".{}.", title))
            .tempdir_in(dest)?;
        let product_dir = staging.path().join(title);
        fs::create_dir_all(&product_dir)?;

        let odata = &self.options.settings.download.odata_url;
        let manifest_path = product_dir.join(kind.filename());
        self.fetch(
            &node_url(odata, &feature.id, title, kind.filename())?,
            &feature.id,
            &manifest_path,
        )?;

        let manifest = Manifest::new(kind, fs::read_to_string(&manifest_path)?);
        let files = manifest.filter(pattern)?;
        debug!("{} files of {} match {}", files.len(), title, pattern);

        for file in files {
            let relative = Path::new(&file);
            if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
                return Err(Error::DownloadFailed(format!(
                    "Refusing manifest path outside the product: {}",
                    file
                )));
            }
            let output = product_dir.join(relative);
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent)?;
            }
            self.fetch(&node_url(odata, &feature.id, title, &file)?, &feature.id, &output)?;
        }

        replace(&product_dir, target)?;
        Ok(())
    }

    /// Transfers `url` to `path` with bounded retries. A 401 refreshes the token
    /// before the next attempt; other client errors fail at once.
    fn fetch(&self, url: &Url, feature_id: &str, path: &Path) -> Result<()> {
        let policy = &self.options.settings.retry;
        let mut token = self.credentials.token()?;
        let mut attempt = 1;
        loop {
            let (err, unauthorized) = match self.transfer(url, &token, feature_id, path) {
                Ok(()) => return Ok(()),
                Err(Attempt::Unauthorized) => (
                    Error::TransientNetwork(format!("{} rejected the access token", url)),
                    true,
                ),
                Err(Attempt::Failed(e)) if e.is_transient() => (e, false),
                Err(Attempt::Failed(e)) => return Err(e),
            };
            if attempt >= policy.max_attempts {
                return Err(Error::DownloadFailed(format!(
                    "Giving up on {} after {} attempts: {}",
                    url, attempt, err
                )));
            }
            warn!(
                "Attempt {}/{} for {} failed: {}, retrying",
                attempt, policy.max_attempts, feature_id, err
            );
            if unauthorized {
                token = self.credentials.refresh_rejected(&token)?;
            } else {
                policy.wait(attempt);
            }
            attempt += 1;
        }
    }

    fn transfer(
        &self,
        url: &Url,
        token: &str,
        feature_id: &str,
        path: &Path,
    ) -> std::result::Result<(), Attempt> {
        let mut response = self.follow(url, token)?;
        let total = response.content_length();

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut partial = tempfile::Builder::new()
            .prefix(&format!(".{}.", name))
            .suffix(".partial")
            .tempfile_in(dir)?;

        let monitor = self.monitor();
        let mut buffer = vec![0; self.options.settings.download.chunk_size.max(1)];
        let mut written: u64 = 0;
        loop {
            let n = response
                .read(&mut buffer)
                .map_err(|e| Error::TransientNetwork(format!("Reading {}: {}", url, e)))?;
            if n == 0 {
                break;
            }
            partial.write_all(&buffer[..n])?;
            written += n as u64;
            monitor.notify(feature_id, &Event::Progress { bytes: written, total });
        }

        if let Some(total) = total {
            if written < total {
                return Err(Error::TransientNetwork(format!(
                    "Connection closed after {} of {} bytes",
                    written, total
                ))
                .into());
            }
        }

        partial.as_file().sync_all()?;
        partial.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Follows redirects by hand so every hop carries the bearer token.
    fn follow(&self, url: &Url, token: &str) -> std::result::Result<Response, Attempt> {
        let mut url = url.clone();
        for _ in 0..=self.options.settings.download.max_redirects {
            let response = self
                .client
                .get(url.clone())
                .bearer_auth(token)
                .send()
                .map_err(Error::from_transport)?;

            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        Error::DownloadFailed(format!("{} redirected without a location", url))
                    })?;
                let next = url.join(location)?;
                debug!("{} redirected to {}", url, next);
                url = next;
                continue;
            }
            if status == StatusCode::UNAUTHORIZED {
                return Err(Attempt::Unauthorized);
            }
            if status.is_success() {
                return Ok(response);
            }
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                return Err(Error::TransientNetwork(format!("{} returned {}", url, status)).into());
            }
            return Err(Error::DownloadFailed(format!("{} returned {}", url, status)).into());
        }
        Err(Error::DownloadFailed(format!("Too many redirects for {}", url)).into())
    }
}

/// Moves `from` to `to`, removing whatever `to` held before.
fn replace(from: &Path, to: &Path) -> io::Result<()> {
    if to.is_dir() {
        fs::remove_dir_all(to)?;
    } else if to.exists() {
        fs::remove_file(to)?;
    }
    fs::rename(from, to)
}

/// Unpacks `archive` next to itself and removes it afterwards. Entries are staged in
/// a temporary directory and only moved into `dest` once the whole archive unpacked.
fn unpack(archive: &Path, dest: &Path, target: &Path) -> Result<()> {
    let staging = tempfile::Builder::new().prefix(".unpack.").tempdir_in(dest)?;

    let mut zip = ZipArchive::new(File::open(archive)?)?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let outpath = match entry.enclosed_name() {
            Some(path) => staging.path().join(path),
            None => continue,
        };
        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&outpath)?;
            io::copy(&mut entry, &mut outfile)?;
        }
    }

    // The unpacked directory marks the feature complete, so it has to be there.
    let expected = target.file_name().map(|name| staging.path().join(name));
    if !expected.is_some_and(|path| path.exists()) {
        return Err(Error::DownloadFailed(format!(
            "{} does not unpack to {}",
            archive.display(),
            target.display()
        )));
    }

    for entry in fs::read_dir(staging.path())? {
        let entry = entry?;
        replace(&entry.path(), &dest.join(entry.file_name()))?;
    }
    fs::remove_file(archive)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use mockito::Matcher;
    use std::io::Cursor;

    fn settings_for(server: &mockito::Server) -> Settings {
        let mut settings = Settings::default()
            .with_base_url(&Url::parse(&server.url()).unwrap())
            .unwrap();
        settings.retry = RetryPolicy::immediate(3);
        settings
    }

    fn token_mock(server: &mut mockito::Server, grant: &str, access: &str) -> mockito::Mock {
        server
            .mock("POST", "/auth/token")
            .match_body(Matcher::UrlEncoded("grant_type".into(), grant.into()))
            .with_body(
                serde_json::json!({
                    "access_token": access,
                    "expires_in": 600,
                    "refresh_token": "refresh-1",
                    "refresh_expires_in": 3600,
                })
                .to_string(),
            )
    }

    fn feature(server: &mockito::Server, id: &str, collection: &str) -> Feature {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "properties": {
                "title": format!("{}.SAFE", id.to_uppercase()),
                "collection": collection,
                "services": {
                    "download": {
                        "url": format!("{}/odata/v1/Products({})/$value", server.url(), id),
                        "mimeType": "application/zip",
                    }
                }
            }
        }))
        .unwrap()
    }

    fn options(settings: Settings) -> DownloadOptions {
        let credentials = Credentials::new("user", "pass", &settings).unwrap();
        DownloadOptions {
            credentials: Some(Arc::new(credentials)),
            settings,
            ..DownloadOptions::default()
        }
    }

    fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with('.'))
            .collect()
    }

    #[test]
    fn test_download_archive() {
        let mut server = mockito::Server::new();
        token_mock(&mut server, "password", "token-1").create();
        let asset = server
            .mock("GET", "/odata/v1/Products(a1)/$value")
            .match_header("authorization", "Bearer token-1")
            .with_body("archive-bytes")
            .expect(1)
            .create();

        let dest = tempfile::tempdir().unwrap();
        let result = download_feature(
            &feature(&server, "a1", "SENTINEL-2"),
            dest.path(),
            &options(settings_for(&server)),
        );

        let expected = dest.path().join("A1.SAFE.zip");
        assert_eq!(result.outcome, Outcome::Downloaded(expected.clone()));
        assert_eq!(fs::read_to_string(expected).unwrap(), "archive-bytes");
        assert!(leftovers(dest.path()).is_empty());
        asset.assert();
    }

    #[test]
    fn test_existing_file_is_skipped() {
        let mut server = mockito::Server::new();
        let any = server.mock("GET", Matcher::Any).expect(0).create();
        let token = server.mock("POST", Matcher::Any).expect(0).create();

        let dest = tempfile::tempdir().unwrap();
        fs::write(dest.path().join("A1.SAFE.zip"), "done").unwrap();
        let result = download_feature(
            &feature(&server, "a1", "SENTINEL-2"),
            dest.path(),
            &options(settings_for(&server)),
        );

        assert!(matches!(result.outcome, Outcome::Skipped(_)));
        any.assert();
        token.assert();
    }

    #[test]
    fn test_not_found_fails_without_retry() {
        let mut server = mockito::Server::new();
        token_mock(&mut server, "password", "token-1").create();
        let asset = server
            .mock("GET", "/odata/v1/Products(gone)/$value")
            .with_status(404)
            .expect(1)
            .create();

        let dest = tempfile::tempdir().unwrap();
        let result = download_feature(
            &feature(&server, "gone", "SENTINEL-2"),
            dest.path(),
            &options(settings_for(&server)),
        );

        assert_eq!(result.error_kind(), Some(ErrorKind::DownloadFailed));
        assert!(!dest.path().join("GONE.SAFE.zip").exists());
        asset.assert();
    }

    #[test]
    fn test_server_errors_exhaust_budget() {
        let mut server = mockito::Server::new();
        token_mock(&mut server, "password", "token-1").create();
        let asset = server
            .mock("GET", "/odata/v1/Products(flaky)/$value")
            .with_status(503)
            .expect(3)
            .create();

        let dest = tempfile::tempdir().unwrap();
        let result = download_feature(
            &feature(&server, "flaky", "SENTINEL-2"),
            dest.path(),
            &options(settings_for(&server)),
        );

        assert_eq!(result.error_kind(), Some(ErrorKind::DownloadFailed));
        assert!(leftovers(dest.path()).is_empty());
        asset.assert();
    }

    #[test]
    fn test_unauthorized_refreshes_token_once() {
        let mut server = mockito::Server::new();
        token_mock(&mut server, "password", "token-1").expect(1).create();
        let refresh = token_mock(&mut server, "refresh_token", "token-2")
            .expect(1)
            .create();
        server
            .mock("GET", "/odata/v1/Products(a1)/$value")
            .match_header("authorization", "Bearer token-1")
            .with_status(401)
            .expect(1)
            .create();
        server
            .mock("GET", "/odata/v1/Products(a1)/$value")
            .match_header("authorization", "Bearer token-2")
            .with_body("ok")
            .expect(1)
            .create();

        let settings = settings_for(&server);
        let options = options(settings);
        let dest = tempfile::tempdir().unwrap();
        let result = download_feature(&feature(&server, "a1", "SENTINEL-2"), dest.path(), &options);

        assert!(result.is_success());
        assert_eq!(options.credentials.unwrap().exchange_count(), 2);
        refresh.assert();
    }

    #[test]
    fn test_redirect_keeps_authorization() {
        let mut server = mockito::Server::new();
        token_mock(&mut server, "password", "token-1").create();
        server
            .mock("GET", "/odata/v1/Products(a1)/$value")
            .with_status(302)
            .with_header("location", "/zipper/a1")
            .create();
        let target = server
            .mock("GET", "/zipper/a1")
            .match_header("authorization", "Bearer token-1")
            .with_body("zipped")
            .expect(1)
            .create();

        let dest = tempfile::tempdir().unwrap();
        let result = download_feature(
            &feature(&server, "a1", "SENTINEL-2"),
            dest.path(),
            &options(settings_for(&server)),
        );

        assert!(result.is_success(), "{}", result);
        target.assert();
    }

    #[test]
    fn test_extract_replaces_archive() {
        let mut server = mockito::Server::new();
        token_mock(&mut server, "password", "token-1").create();
        server
            .mock("GET", "/odata/v1/Products(a1)/$value")
            .with_body(zip_bytes(&[
                ("A1.SAFE/manifest.safe", "<xml/>"),
                ("A1.SAFE/GRANULE/B02.jp2", "pixels"),
            ]))
            .create();

        let dest = tempfile::tempdir().unwrap();
        let options = DownloadOptions {
            extract: true,
            ..options(settings_for(&server))
        };
        let result = download_feature(&feature(&server, "a1", "SENTINEL-2"), dest.path(), &options);

        let unpacked = dest.path().join("A1.SAFE");
        assert_eq!(result.outcome, Outcome::Downloaded(unpacked.clone()));
        assert_eq!(
            fs::read_to_string(unpacked.join("GRANULE/B02.jp2")).unwrap(),
            "pixels"
        );
        assert!(!dest.path().join("A1.SAFE.zip").exists());
        assert!(leftovers(dest.path()).is_empty());
    }

    #[test]
    fn test_archive_without_product_directory_is_kept() {
        let mut server = mockito::Server::new();
        token_mock(&mut server, "password", "token-1").create();
        server
            .mock("GET", "/odata/v1/Products(a1)/$value")
            .with_body(zip_bytes(&[("OTHER_NAME/file.txt", "data")]))
            .create();

        let dest = tempfile::tempdir().unwrap();
        let options = DownloadOptions {
            extract: true,
            ..options(settings_for(&server))
        };
        let result = download_feature(&feature(&server, "a1", "SENTINEL-2"), dest.path(), &options);

        assert_eq!(result.error_kind(), Some(ErrorKind::DownloadFailed));
        assert!(dest.path().join("A1.SAFE.zip").exists());
        assert!(!dest.path().join("OTHER_NAME").exists());
        assert!(leftovers(dest.path()).is_empty());
    }

    #[test]
    fn test_server_error_then_success() {
        let mut server = mockito::Server::new();
        token_mock(&mut server, "password", "token-1").expect(1).create();
        // Served first until its single hit is used up
        let unavailable = server
            .mock("GET", "/odata/v1/Products(a1)/$value")
            .with_status(503)
            .expect(1)
            .create();
        let available = server
            .mock("GET", "/odata/v1/Products(a1)/$value")
            .with_body("archive-bytes")
            .expect(1)
            .create();

        let dest = tempfile::tempdir().unwrap();
        let result = download_feature(
            &feature(&server, "a1", "SENTINEL-2"),
            dest.path(),
            &options(settings_for(&server)),
        );

        let expected = dest.path().join("A1.SAFE.zip");
        assert_eq!(result.outcome, Outcome::Downloaded(expected.clone()));
        assert_eq!(fs::read_to_string(expected).unwrap(), "archive-bytes");
        assert!(leftovers(dest.path()).is_empty());
        unavailable.assert();
        available.assert();
    }

    #[test]
    fn test_corrupt_archive_is_kept() {
        let mut server = mockito::Server::new();
        token_mock(&mut server, "password", "token-1").create();
        server
            .mock("GET", "/odata/v1/Products(a1)/$value")
            .with_body("not a zip")
            .create();

        let dest = tempfile::tempdir().unwrap();
        let options = DownloadOptions {
            extract: true,
            ..options(settings_for(&server))
        };
        let result = download_feature(&feature(&server, "a1", "SENTINEL-2"), dest.path(), &options);

        assert_eq!(result.error_kind(), Some(ErrorKind::DownloadFailed));
        assert!(dest.path().join("A1.SAFE.zip").exists());
    }

    #[test]
    fn test_filter_pattern_fetches_matching_nodes() {
        let mut server = mockito::Server::new();
        token_mock(&mut server, "password", "token-1").create();
        let manifest = r#"<XFDU><dataObjectSection>
            <dataObject ID="B02"><byteStream size="6"><fileLocation href="./GRANULE/IMG/B02.jp2"/></byteStream></dataObject>
            <dataObject ID="B03"><byteStream size="6"><fileLocation href="./GRANULE/IMG/B03.jp2"/></byteStream></dataObject>
        </dataObjectSection></XFDU>"#;
        server
            .mock("GET", "/odata/v1/Products(a1)/Nodes(A1.SAFE)/Nodes(manifest.safe)/$value")
            .with_body(manifest)
            .expect(1)
            .create();
        let b02 = server
            .mock(
                "GET",
                "/odata/v1/Products(a1)/Nodes(A1.SAFE)/Nodes(GRANULE)/Nodes(IMG)/Nodes(B02.jp2)/$value",
            )
            .with_body("pixels")
            .expect(1)
            .create();
        let b03 = server
            .mock(
                "GET",
                "/odata/v1/Products(a1)/Nodes(A1.SAFE)/Nodes(GRANULE)/Nodes(IMG)/Nodes(B03.jp2)/$value",
            )
            .expect(0)
            .create();

        let dest = tempfile::tempdir().unwrap();
        let options = DownloadOptions {
            filter_pattern: Some("*B02.jp2".to_string()),
            ..options(settings_for(&server))
        };
        let result = download_feature(&feature(&server, "a1", "SENTINEL-2"), dest.path(), &options);

        let product = dest.path().join("A1.SAFE");
        assert_eq!(result.outcome, Outcome::Downloaded(product.clone()));
        assert!(product.join("manifest.safe").exists());
        assert_eq!(
            fs::read_to_string(product.join("GRANULE/IMG/B02.jp2")).unwrap(),
            "pixels"
        );
        b02.assert();
        b03.assert();
    }

    #[test]
    fn test_filter_pattern_unsupported_collection() {
        let server = mockito::Server::new();
        let dest = tempfile::tempdir().unwrap();
        let options = DownloadOptions {
            filter_pattern: Some("*".to_string()),
            ..options(settings_for(&server))
        };
        let result = download_feature(&feature(&server, "a1", "SENTINEL-5P"), dest.path(), &options);
        assert_eq!(result.error_kind(), Some(ErrorKind::DownloadFailed));
    }

    #[test]
    fn test_missing_link_fails() {
        let server = mockito::Server::new();
        let feature: Feature =
            serde_json::from_str(r#"{"id": "x", "properties": {"title": "X.SAFE"}}"#).unwrap();
        let dest = tempfile::tempdir().unwrap();
        let result = download_feature(&feature, dest.path(), &options(settings_for(&server)));
        assert_eq!(result.error_kind(), Some(ErrorKind::DownloadFailed));
        assert!(result.to_string().contains("no download link"));
    }
}
