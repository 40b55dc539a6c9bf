//! C1 — the uniform positioned-read interface over local files and HTTP
//! ranged requests.
//!
//! Every caller in the engine is stateless with respect to the source: the
//! only operation is `read_at(offset, len)`. The scheduler serializes calls
//! with a shared mutex (see [`crate::scheduler`]); a single [`Source`] is
//! constructed once per extraction and shared (non-owning) across workers.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, RANGE, USER_AGENT};
use reqwest::StatusCode;

use crate::error::{Error, Result};

const HTTP_MAX_RETRIES: u32 = 3;
const HTTP_TIMEOUT: Duration = Duration::from_secs(600);
const HTTP_MAX_REDIRECTS: usize = 10;
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// A positioned-read handle over a local file or a remote HTTP(S) resource.
pub enum Source {
    LocalFile { file: File, size: u64 },
    HttpRange(HttpRangeSource),
}

impl Source {
    pub fn open_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::SourceOpenFailed(path.display().to_string(), e))?;
        let size = file
            .metadata()
            .map_err(|e| Error::SourceOpenFailed(path.display().to_string(), e))?
            .len();
        Ok(Source::LocalFile { file, size })
    }

    pub fn open_http(url: &str, user_agent: Option<&str>) -> Result<Self> {
        Ok(Source::HttpRange(HttpRangeSource::new(url, user_agent)?))
    }

    pub fn size(&self) -> u64 {
        match self {
            Source::LocalFile { size, .. } => *size,
            Source::HttpRange(h) => h.content_length,
        }
    }

    pub fn supports_ranges(&self) -> bool {
        match self {
            Source::LocalFile { .. } => true,
            Source::HttpRange(h) => h.supports_ranges,
        }
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes actually read. Returns fewer bytes than requested
    /// only at end-of-stream.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            Source::LocalFile { file, size } => {
                if offset >= *size {
                    return Ok(0);
                }
                let remaining = (*size - offset) as usize;
                let to_read = buf.len().min(remaining);
                file.read_at(&mut buf[..to_read], offset)
                    .map_err(Error::WriteFailed)
            }
            Source::HttpRange(h) => h.read_at(offset, buf),
        }
    }

    /// Reads exactly `buf.len()` bytes starting at `offset`.
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.read_at(offset + total as u64, &mut buf[total..])?;
            if n == 0 {
                return Err(Error::WriteFailed(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "short read from source",
                )));
            }
            total += n;
        }
        Ok(())
    }

    pub fn read_vec_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }
}

pub struct HttpRangeSource {
    client: Client,
    url: String,
    user_agent: String,
    content_length: u64,
    supports_ranges: bool,
}

impl HttpRangeSource {
    fn new(url: &str, user_agent: Option<&str>) -> Result<Self> {
        let ua = user_agent.unwrap_or(DEFAULT_USER_AGENT).to_string();
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(HTTP_MAX_REDIRECTS))
            .user_agent(ua.clone())
            .build()
            .map_err(|e| Error::HttpFatal {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let content_length = Self::head_with_retry(&client, url)?;

        let supports_ranges = match Self::probe_range(&client, url) {
            Ok(supported) => supported,
            Err(_) => false,
        };
        if !supports_ranges {
            tracing::warn!(url, "server doesn't support range requests; extraction may fail");
        }

        Ok(Self {
            client,
            url: url.to_string(),
            user_agent: ua,
            content_length,
            supports_ranges,
        })
    }

    fn head_with_retry(client: &Client, url: &str) -> Result<u64> {
        let mut last_err = String::new();
        for attempt in 1..=HTTP_MAX_RETRIES {
            match client.head(url).send() {
                Ok(resp) => {
                    if let Some(len) = resp
                        .headers()
                        .get(CONTENT_LENGTH)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                    {
                        return Ok(len);
                    }
                    last_err = "no Content-Length header in HEAD response".to_string();
                }
                Err(e) => last_err = e.to_string(),
            }
            if attempt < HTTP_MAX_RETRIES {
                tracing::debug!(
                    "{}",
                    Error::HttpTransient {
                        url: url.to_string(),
                        attempt,
                        message: last_err.clone(),
                    }
                );
                std::thread::sleep(Duration::from_secs(2 * attempt as u64));
            }
        }
        Err(Error::HttpFatal {
            url: url.to_string(),
            message: format!("HEAD failed after {HTTP_MAX_RETRIES} attempts: {last_err}"),
        })
    }

    fn probe_range(client: &Client, url: &str) -> Result<bool> {
        let mut headers = HeaderMap::new();
        headers.insert(RANGE, HeaderValue::from_static("bytes=0-1023"));
        let resp = client
            .get(url)
            .headers(headers)
            .send()
            .map_err(|e| Error::HttpFatal {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(resp.status() == StatusCode::PARTIAL_CONTENT)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.content_length {
            return Ok(0);
        }
        let remaining = self.content_length - offset;
        let to_read = (buf.len() as u64).min(remaining) as usize;
        if to_read == 0 {
            return Ok(0);
        }

        let range = format!("bytes={}-{}", offset, offset + to_read as u64 - 1);
        let mut last_err = String::new();
        for attempt in 1..=HTTP_MAX_RETRIES {
            let mut headers = HeaderMap::new();
            headers.insert(RANGE, HeaderValue::from_str(&range).unwrap());
            headers.insert(
                USER_AGENT,
                HeaderValue::from_str(&self.user_agent).unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_USER_AGENT)),
            );

            match self.client.get(&self.url).headers(headers).send() {
                Ok(mut resp) => {
                    let status = resp.status();
                    if status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT {
                        let mut data = Vec::with_capacity(to_read);
                        if resp.read_to_end(&mut data).is_ok() {
                            let n = data.len().min(buf.len());
                            buf[..n].copy_from_slice(&data[..n]);
                            return Ok(n);
                        }
                        last_err = "failed to read response body".to_string();
                    } else {
                        last_err = format!("unexpected status {status}");
                    }
                }
                Err(e) => last_err = e.to_string(),
            }
            if attempt < HTTP_MAX_RETRIES {
                tracing::debug!(
                    "{}",
                    Error::HttpTransient {
                        url: self.url.clone(),
                        attempt,
                        message: last_err.clone(),
                    }
                );
                std::thread::sleep(Duration::from_secs(2 * attempt as u64));
            }
        }
        Err(Error::HttpFatal {
            url: self.url.clone(),
            message: format!("ranged GET failed after {HTTP_MAX_RETRIES} attempts: {last_err}"),
        })
    }
}
