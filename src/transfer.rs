use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::error::{AcquireError, Result};

const CHUNK_SIZE: usize = 32 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Resumable byte-range downloader. Performs no retries of its own; retry
/// policy belongs to the orchestrator.
pub struct TransferManager {
    client: Client,
}

impl TransferManager {
    pub fn new() -> Result<Self> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self { client })
    }

    /// Probe the remote archive size with a `HEAD` request.
    pub fn remote_size(&self, url: &str) -> Result<Option<u64>> {
        let response = self.client.head(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(AcquireError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        // A HEAD reply has no body, so the size comes from the header
        // rather than the body length.
        Ok(response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok()))
    }

    /// Stream `url` to `dest`, resuming from an existing partial file when
    /// `resume` is set. `progress` is invoked after every received chunk
    /// with `(downloaded_bytes, total_bytes)`.
    ///
    /// A `200` answer to a range request means the server ignored the
    /// range; the transfer then restarts from zero, truncating the
    /// destination. A `416` answer is retried once without the range, to
    /// the same effect. Existing bytes are never reconciled against a
    /// fresh stream.
    ///
    /// On cancellation the partial file is kept only when `resume` is set;
    /// on other terminal errors the same policy applies, since a resumed
    /// partial stays byte-consistent while a fresh one does not.
    pub fn fetch<F>(
        &self,
        url: &str,
        dest: &Path,
        resume: bool,
        mut progress: F,
        token: &CancellationToken,
    ) -> Result<()>
    where
        F: FnMut(u64, Option<u64>),
    {
        let mut existing = if resume {
            fs::metadata(dest).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };

        let mut request = self.client.get(url);
        if existing > 0 {
            request = request.header(RANGE, format!("bytes={existing}-"));
        }

        let mut response = request.send()?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE && existing > 0 {
            // 416 means the partial no longer lines up with the remote
            // file; the resume offset is abandoned.
            tracing::warn!("server rejected resume range for {url}, restarting from zero");
            existing = 0;
            response = self.client.get(url).send()?;
        }
        let status = response.status();
        if !status.is_success() && status != StatusCode::PARTIAL_CONTENT {
            return Err(AcquireError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let resumed = status == StatusCode::PARTIAL_CONTENT && existing > 0;
        if existing > 0 && !resumed {
            tracing::warn!("server ignored range request for {url}, restarting from zero");
        }

        let total = derive_total(&response, if resumed { existing } else { 0 });

        let mut file = if resumed {
            tracing::debug!("resuming {url} from byte {existing}");
            OpenOptions::new().append(true).open(dest)?
        } else {
            File::create(dest)?
        };

        let mut downloaded = if resumed { existing } else { 0 };
        let mut buffer = [0u8; CHUNK_SIZE];

        loop {
            if token.is_cancelled() {
                drop(file);
                discard_unless_resumable(dest, resume);
                return Err(AcquireError::Cancelled);
            }

            let read = match response.read(&mut buffer) {
                Ok(read) => read,
                Err(err) => {
                    drop(file);
                    discard_unless_resumable(dest, resume);
                    return Err(err.into());
                }
            };
            if read == 0 {
                break;
            }

            if let Err(err) = file.write_all(&buffer[..read]) {
                drop(file);
                discard_unless_resumable(dest, resume);
                return Err(err.into());
            }

            downloaded += read as u64;
            progress(downloaded, total);
        }

        file.flush()?;
        drop(file);

        if let Some(expected) = total {
            if downloaded != expected {
                discard_unless_resumable(dest, resume);
                return Err(AcquireError::ArchiveIncomplete {
                    expected,
                    actual: downloaded,
                });
            }
        }

        tracing::info!(
            "downloaded {} to {}",
            format_bytes(downloaded),
            dest.display()
        );
        Ok(())
    }
}

/// Total size, in priority order: `Content-Range` total, then
/// `Content-Length` adjusted by the resume offset, then unknown.
fn derive_total(response: &Response, offset: u64) -> Option<u64> {
    content_range_total(response)
        .or_else(|| response.content_length().map(|remaining| offset + remaining))
}

fn content_range_total(response: &Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    parse_content_range_total(value)
}

/// Parse the total out of `bytes <start>-<end>/<total>`. An unknown total
/// (`/*`) yields `None`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}

fn discard_unless_resumable(dest: &Path, resume: bool) {
    if !resume {
        let _ = fs::remove_file(dest);
    }
}

/// Format bytes as a human-readable string for log lines and progress
/// detail.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_totals_parse() {
        assert_eq!(
            parse_content_range_total("bytes 1000-4095/4096"),
            Some(4096)
        );
        assert_eq!(parse_content_range_total("bytes 0-0/1"), Some(1));
        assert_eq!(parse_content_range_total("bytes 0-99/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn format_bytes_rounds_to_two_decimals() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1_572_864), "1.50 MB");
        assert_eq!(format_bytes(1_073_741_824), "1.00 GB");
    }

    #[test]
    fn discard_policy_preserves_resumable_partials() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("model.tar.bz2");
        std::fs::write(&partial, b"partial").unwrap();

        discard_unless_resumable(&partial, true);
        assert!(partial.exists());

        discard_unless_resumable(&partial, false);
        assert!(!partial.exists());
    }
}
