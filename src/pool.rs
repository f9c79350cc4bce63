//! Downloading many features, sequentially or on a fixed pool of worker threads.
use flume::{Receiver, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

use crate::download::{DownloadOptions, DownloadResult, Downloader};
use crate::error::{Error, Result};
use crate::feature::Feature;
use crate::monitor::Event;

/// Starts downloading `features` into `dest` and yields one result per feature as soon
/// as it finishes. With `concurrency > 1` results arrive in completion order.
///
/// Credentials are resolved here, so a missing login surfaces before any transfer.
/// Features are pulled from the input only as workers free up; dropping the returned
/// iterator stops scheduling and waits for transfers already under way.
pub fn download_features<I>(
    features: I,
    dest: &Path,
    options: DownloadOptions,
) -> Result<DownloadIter<I::IntoIter>>
where
    I: IntoIterator<Item = Feature>,
{
    let concurrency = options.concurrency.max(1);
    let downloader = Arc::new(Downloader::new(options)?);
    let dest = dest.to_path_buf();

    let mode = if concurrency == 1 {
        Mode::Sequential { downloader, dest }
    } else {
        Mode::Pool(Pool::spawn(downloader, dest, concurrency)?)
    };

    Ok(DownloadIter {
        features: Some(features.into_iter()),
        mode,
    })
}

/// Runs one download, turning a panic (e.g. in a caller-supplied `output_filename`)
/// into a failed result so the feature is still accounted for.
fn download_isolated(downloader: &Downloader, feature: &Feature, dest: &Path) -> DownloadResult {
    match panic::catch_unwind(AssertUnwindSafe(|| downloader.download(feature, dest))) {
        Ok(result) => result,
        Err(payload) => {
            let err = Error::DownloadFailed(format!(
                "Panicked while downloading: {}",
                panic_message(payload.as_ref())
            ));
            error!("{}: {}", feature.id, err);
            downloader.monitor().notify(&feature.id, &Event::Failed(err.kind()));
            DownloadResult::failed(feature, &err)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

pub struct DownloadIter<I> {
    features: Option<I>,
    mode: Mode,
}

enum Mode {
    Sequential {
        downloader: Arc<Downloader>,
        dest: PathBuf,
    },
    Pool(Pool),
}

struct Pool {
    downloader: Arc<Downloader>,
    jobs: Option<Sender<Feature>>,
    results: Receiver<DownloadResult>,
    workers: Vec<JoinHandle<()>>,
    cancelled: Arc<AtomicBool>,
    in_flight: usize,
    // Features handed out ahead of completions, so idle workers never wait on the input
    target_in_flight: usize,
}

impl Pool {
    fn spawn(downloader: Arc<Downloader>, dest: PathBuf, size: usize) -> Result<Self> {
        let (job_tx, job_rx) = flume::unbounded::<Feature>();
        let (result_tx, result_rx) = flume::unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let downloader = Arc::clone(&downloader);
            let cancelled = Arc::clone(&cancelled);
            let dest = dest.clone();
            let handle = thread::Builder::new()
                .name(format!("download-{}", i))
                .spawn(move || {
                    while let Ok(feature) = jobs.recv() {
                        if cancelled.load(Ordering::SeqCst) {
                            continue;
                        }
                        let result = download_isolated(&downloader, &feature, &dest);
                        if results.send(result).is_err() {
                            break;
                        }
                    }
                })?;
            workers.push(handle);
        }
        debug!("Started {} download workers", size);

        Ok(Self {
            downloader,
            jobs: Some(job_tx),
            results: result_rx,
            workers,
            cancelled,
            in_flight: 0,
            target_in_flight: size + size / 2,
        })
    }

    fn next_result<I: Iterator<Item = Feature>>(
        &mut self,
        features: &mut Option<I>,
    ) -> Option<DownloadResult> {
        while self.in_flight < self.target_in_flight {
            let Some(feature) = features.as_mut().and_then(Iterator::next) else {
                // Input exhausted; idle workers exit once the queue drains
                *features = None;
                self.jobs = None;
                break;
            };
            let Some(jobs) = &self.jobs else { break };
            self.downloader.monitor().notify(&feature.id, &Event::Queued);
            if jobs.send(feature).is_err() {
                warn!("Download workers stopped unexpectedly");
                break;
            }
            self.in_flight += 1;
        }

        if self.in_flight == 0 {
            return None;
        }
        match self.results.recv() {
            Ok(result) => {
                self.in_flight -= 1;
                Some(result)
            }
            Err(_) => {
                warn!("Download workers stopped with {} features pending", self.in_flight);
                self.in_flight = 0;
                None
            }
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.jobs = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("A download worker panicked");
            }
        }
    }
}

impl<I: Iterator<Item = Feature>> Iterator for DownloadIter<I> {
    type Item = DownloadResult;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.mode {
            Mode::Sequential { downloader, dest } => {
                let feature = self.features.as_mut()?.next();
                let Some(feature) = feature else {
                    self.features = None;
                    return None;
                };
                downloader.monitor().notify(&feature.id, &Event::Queued);
                Some(download_isolated(downloader, &feature, dest))
            }
            Mode::Pool(pool) => pool.next_result(&mut self.features),
        }
    }
}
