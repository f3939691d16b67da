use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, HeaderMap};
use reqwest::{Client, RequestBuilder, Response};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, UpdateError};
use crate::logging::UpdateLogger;
use crate::util::{cancel_requested, format_speed, progress_percent};

const USER_AGENT: &str = concat!("delta-updater/", env!("CARGO_PKG_VERSION"));
const API_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Clone, Debug)]
pub struct ProgressUpdate {
    pub stage: &'static str,
    pub progress: f32,
    pub message: String,
    pub current_file: Option<String>,
    pub speed: Option<String>,
    pub downloaded: Option<u64>,
    pub total: Option<u64>,
}

pub type ProgressCallback<'a> = Option<&'a mut (dyn FnMut(ProgressUpdate) + Send)>;

pub fn emit_progress(cb: &mut ProgressCallback<'_>, update: ProgressUpdate) {
    if let Some(callback) = cb.as_deref_mut() {
        callback(update);
    }
}

/// Lend a progress callback to a nested call without giving it up.
pub fn reborrow_progress<'a>(cb: &'a mut ProgressCallback<'_>) -> ProgressCallback<'a> {
    match cb {
        Some(callback) => Some(&mut **callback),
        None => None,
    }
}

/// HTTP access to the release service, shared by the locator and the fetcher.
#[derive(Clone)]
pub struct NetworkClient {
    api: Client,
    download: Client,
    token: Option<String>,
    logger: UpdateLogger,
}

impl NetworkClient {
    pub fn new(token: Option<String>, logger: UpdateLogger) -> Self {
        let api = Client::builder()
            .timeout(API_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|err| {
                logger.warn(format!(
                    "falling back to default HTTP client configuration ({err})"
                ));
                Client::new()
            });
        let download = Client::builder()
            .connect_timeout(API_TIMEOUT)
            .timeout(DOWNLOAD_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|err| {
                logger.warn(format!(
                    "falling back to default download client configuration ({err})"
                ));
                Client::new()
            });
        let token = token.filter(|t| !t.trim().is_empty());
        Self {
            api,
            download,
            token,
            logger,
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// GET against the release API. Status handling is left to the caller.
    pub async fn api_get(&self, url: &str, accept: &str) -> Result<Response> {
        self.logger.debug(format!("GET {url}"));
        let request = self.authorize(self.api.get(url).header(ACCEPT, accept));
        request
            .send()
            .await
            .map_err(|e| UpdateError::Network(format!("request to {url} failed: {e}")))
    }

    /// GET a small asset (such as a manifest) and return its body.
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.api_get(url, "application/octet-stream").await?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), response.headers(), self.has_token(), url));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| UpdateError::Network(format!("reading {url} failed: {e}")))?;
        Ok(bytes.to_vec())
    }

    /// Stream `url` into `dest`, reporting progress and honoring cancellation.
    pub async fn download_to_path(
        &self,
        url: &str,
        dest: &Path,
        expected_size: Option<u64>,
        cancel: &Option<Arc<AtomicBool>>,
        mut progress: ProgressCallback<'_>,
    ) -> Result<u64> {
        self.logger.info(format!("downloading {url} to {}", dest.display()));
        let request = self.authorize(
            self.download
                .get(url)
                .header(ACCEPT, "application/octet-stream"),
        );
        let response = request
            .send()
            .await
            .map_err(|e| UpdateError::Network(format!("download request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), response.headers(), self.has_token(), url));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(dest).await?;

        let total = response.content_length().or(expected_size);
        let label = dest.file_name().map(|n| n.to_string_lossy().into_owned());
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_tick = Instant::now();
        let mut last_bytes = 0u64;

        while let Some(chunk) = stream.next().await {
            if cancel_requested(cancel) {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                self.logger.warn("download cancelled");
                return Err(UpdateError::Cancelled);
            }
            let chunk =
                chunk.map_err(|e| UpdateError::Network(format!("download stream error: {e}")))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            let since = last_tick.elapsed().as_secs_f32();
            if since > 0.2 {
                let speed = (downloaded - last_bytes) as f32 / since;
                emit_progress(
                    &mut progress,
                    ProgressUpdate {
                        stage: "download",
                        progress: progress_percent(downloaded, total),
                        message: "Downloading update package...".into(),
                        current_file: label.clone(),
                        speed: Some(format_speed(speed)),
                        downloaded: Some(downloaded),
                        total,
                    },
                );
                last_tick = Instant::now();
                last_bytes = downloaded;
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        // Final callback.
        emit_progress(
            &mut progress,
            ProgressUpdate {
                stage: "download",
                progress: 100.0,
                message: "Download complete".into(),
                current_file: label,
                speed: None,
                downloaded: Some(downloaded),
                total,
            },
        );

        if let Some(total) = total
            && downloaded < total
        {
            return Err(UpdateError::Network(format!(
                "download incomplete: received {downloaded} of {total} bytes"
            )));
        }

        Ok(downloaded)
    }
}

/// Map a non-success status from the release service onto an error kind.
pub fn classify_status(status: u16, headers: &HeaderMap, has_token: bool, url: &str) -> UpdateError {
    let rate_limited = headers
        .get("x-ratelimit-remaining")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        == Some(0);

    match status {
        429 => UpdateError::RateLimited(format!("{url} returned 429")),
        403 if rate_limited => UpdateError::RateLimited(format!("{url}: rate limit exhausted")),
        401 => UpdateError::Auth(format!("{url} rejected the access token (401)")),
        403 => UpdateError::Auth(format!("{url} denied access (403)")),
        404 if !has_token => UpdateError::Auth(format!(
            "{url} not found; private repositories require an access token"
        )),
        404 => UpdateError::Auth(format!(
            "{url} not found; the access token may lack access to this repository"
        )),
        other => UpdateError::Network(format!("{url} returned status {other}")),
    }
}
