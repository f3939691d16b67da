use serde::Deserialize;

use crate::error::{Result, UpdateError};
use crate::logging::UpdateLogger;
use crate::manifest::Manifest;
use crate::networking::{NetworkClient, classify_status};
use crate::storage::UpdateSettings;
use crate::version::Version;

const ARCHIVE_SUFFIXES: [&str; 3] = [".zip", ".tar.gz", ".tgz"];

#[derive(Debug, Clone, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Clone, Deserialize)]
struct GithubAsset {
    name: String,
    /// API endpoint of the asset; the only one that serves private releases.
    #[serde(default)]
    url: String,
    browser_download_url: String,
    #[serde(default)]
    size: u64,
}

/// Newest published release and the assets an update needs from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestRelease {
    pub version: Version,
    pub tag: String,
    pub archive_url: String,
    pub archive_size: Option<u64>,
    pub manifest_url: String,
    pub release_notes: String,
}

/// Repository coordinates and asset naming used to find releases.
#[derive(Debug, Clone)]
pub struct ReleaseSource {
    pub api_base_url: String,
    pub owner: String,
    pub repo: String,
    pub archive_asset_name: Option<String>,
    pub manifest_asset_name: String,
}

impl ReleaseSource {
    pub fn from_settings(settings: &UpdateSettings) -> Self {
        Self {
            api_base_url: settings.api_base_url().to_owned(),
            owner: settings.repository_owner.clone(),
            repo: settings.repository_name.clone(),
            archive_asset_name: settings.archive_asset_name.clone(),
            manifest_asset_name: settings.manifest_asset_name.clone(),
        }
    }

    fn releases_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/releases?per_page=100",
            self.api_base_url, self.owner, self.repo
        )
    }
}

pub struct ReleaseLocator {
    client: NetworkClient,
    source: ReleaseSource,
    logger: UpdateLogger,
}

impl ReleaseLocator {
    pub fn new(client: NetworkClient, source: ReleaseSource, logger: UpdateLogger) -> Self {
        Self {
            client,
            source,
            logger,
        }
    }

    /// Find the numerically newest release. `Ok(None)` means the repository has none.
    pub async fn latest(&self) -> Result<Option<LatestRelease>> {
        let url = self.source.releases_url();
        let response = self
            .client
            .api_get(&url, "application/vnd.github+json")
            .await?;

        if let Some(remaining) = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok())
            && remaining < 10
        {
            self.logger
                .warn(format!("release service rate limit low: {remaining} remaining"));
        }

        let status = response.status();
        if !status.is_success() {
            let err = classify_status(
                status.as_u16(),
                response.headers(),
                self.client.has_token(),
                &url,
            );
            match &err {
                UpdateError::Auth(_) => self.logger.error(format!(
                    "release query for {}/{} needs valid credentials: {err}",
                    self.source.owner, self.source.repo
                )),
                _ => self.logger.warn(format!("release query failed: {err}")),
            }
            return Err(err);
        }

        let releases: Vec<GithubRelease> = response
            .json()
            .await
            .map_err(|e| UpdateError::Network(format!("failed to parse release list: {e}")))?;
        self.select_latest(releases)
    }

    fn select_latest(&self, releases: Vec<GithubRelease>) -> Result<Option<LatestRelease>> {
        let total = releases.len();
        let newest = releases
            .into_iter()
            .filter(|release| !release.draft)
            .filter_map(|release| match Version::from_tag(&release.tag_name) {
                Ok(version) => Some((version, release)),
                Err(err) => {
                    self.logger
                        .debug(format!("skipping tag {}: {err}", release.tag_name));
                    None
                }
            })
            .max_by(|(a, _), (b, _)| a.cmp(b));

        let Some((version, release)) = newest else {
            self.logger.info(format!(
                "repository {}/{} has no releases ({} listed, none usable)",
                self.source.owner, self.source.repo, total
            ));
            return Ok(None);
        };

        let archive = release
            .assets
            .iter()
            .find(|asset| match &self.source.archive_asset_name {
                Some(name) => &asset.name == name,
                None => ARCHIVE_SUFFIXES
                    .iter()
                    .any(|suffix| asset.name.ends_with(suffix)),
            })
            .ok_or_else(|| {
                UpdateError::Release(format!("{} has no package archive asset", release.tag_name))
            })?;
        let manifest = release
            .assets
            .iter()
            .find(|asset| asset.name == self.source.manifest_asset_name)
            .ok_or_else(|| {
                UpdateError::Release(format!(
                    "{} has no {} asset",
                    release.tag_name, self.source.manifest_asset_name
                ))
            })?;

        self.logger.info(format!(
            "latest release {} ({} of {} listed)",
            release.tag_name, version, total
        ));
        Ok(Some(LatestRelease {
            version,
            tag: release.tag_name.clone(),
            archive_url: self.download_url(archive),
            archive_size: (archive.size > 0).then_some(archive.size),
            manifest_url: self.download_url(manifest),
            release_notes: release.body.clone().unwrap_or_default(),
        }))
    }

    /// With a token, assets are fetched through the API so private releases resolve.
    /// Both download paths already send `Accept: application/octet-stream`.
    fn download_url(&self, asset: &GithubAsset) -> String {
        if self.client.has_token() && !asset.url.is_empty() {
            asset.url.clone()
        } else {
            asset.browser_download_url.clone()
        }
    }

    /// Download and validate the manifest published with a release.
    pub async fn fetch_manifest(&self, url: &str) -> Result<Manifest> {
        let bytes = self.client.get_bytes(url).await?;
        let manifest = Manifest::from_json(&bytes)?;
        self.logger.info(format!(
            "remote manifest {}: {} files, {} bytes",
            manifest.version,
            manifest.files.len(),
            manifest.total_size
        ));
        Ok(manifest)
    }
}
