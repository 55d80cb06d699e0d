//! Windows installation media from Microsoft's software-download service.
//!
//! Resolving a download link takes four requests, each sent once and in
//! order: the product's locale page (sets cookies), a session registration,
//! the SKU lookup for a product edition, and the link lookup for one SKU.
//! The link response lists one option per architecture.

use crate::notifier::Notifier;
use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use reqwest::blocking::{Client, Response};
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Deserialize;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

const API_TIMEOUT: Duration = Duration::from_secs(60);
const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum WindowsVersion {
    Windows11,
    Windows10,
}

impl fmt::Display for WindowsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowsVersion::Windows11 => write!(f, "windows11"),
            WindowsVersion::Windows10 => write!(f, "windows10"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum WindowsEdition {
    Home,
    Pro,
    Enterprise,
    Education,
}

impl fmt::Display for WindowsEdition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WindowsEdition::Home => "home",
            WindowsEdition::Pro => "pro",
            WindowsEdition::Enterprise => "enterprise",
            WindowsEdition::Education => "education",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum Architecture {
    X64,
    X86,
    #[value(name = "ARM64", alias = "arm64")]
    Arm64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Architecture::X64 => "x64",
            Architecture::X86 => "x86",
            Architecture::Arm64 => "ARM64",
        };
        write!(f, "{}", name)
    }
}

/// Product edition id used when the caller does not pass one. Every edition
/// of a version ships on the same multi-edition media.
pub fn default_product_edition_id(version: WindowsVersion) -> &'static str {
    match version {
        WindowsVersion::Windows11 => "2618",
        WindowsVersion::Windows10 => "2935",
    }
}

/// Endpoints and identifiers of the download service.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub org_id: String,
    pub profile_id: String,
    pub session_endpoint: String,
    pub sku_endpoint: String,
    pub download_endpoint: String,
    /// Product page; `{version}` is replaced with the Windows version.
    pub locale_page: String,
    /// `Referer` sent with the link lookup; `{version}` is replaced too.
    pub referer: String,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            org_id: "y6jn8c31".to_string(),
            profile_id: "606624d44113".to_string(),
            session_endpoint: "https://vlscppe.microsoft.com/tags".to_string(),
            sku_endpoint: "https://www.microsoft.com/software-download-connector/api/getskuinformationbyproductedition".to_string(),
            download_endpoint: "https://www.microsoft.com/software-download-connector/api/GetProductDownloadLinksBySku".to_string(),
            locale_page: "https://www.microsoft.com/en-US/software-download/{version}".to_string(),
            referer: "https://www.microsoft.com/software-download/{version}".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub version: WindowsVersion,
    pub edition: WindowsEdition,
    pub arch: Architecture,
    pub language: String,
}

impl DownloadRequest {
    /// Default file name for the downloaded media.
    pub fn iso_file_name(&self) -> String {
        format!("windows_{}_{}_{}.iso", self.version, self.edition, self.arch)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SkuInfo {
    pub id: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub product_display_name: String,
    #[serde(default)]
    pub friendly_file_names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiError {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SkuResponse {
    #[serde(default)]
    skus: Option<Vec<SkuInfo>>,
    #[serde(default)]
    errors: Option<Vec<ApiError>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadOption {
    #[serde(default, alias = "Architecture")]
    pub architecture: Option<String>,
    #[serde(default, alias = "Name")]
    pub name: Option<String>,
    #[serde(alias = "Uri")]
    pub uri: String,
    #[serde(default, alias = "IsoSha256")]
    pub iso_sha256: Option<String>,
}

impl DownloadOption {
    fn matches(&self, arch: Architecture) -> bool {
        let wanted = arch.to_string();
        match &self.architecture {
            Some(architecture) => architecture.eq_ignore_ascii_case(&wanted),
            None => self
                .name
                .iter()
                .chain(std::iter::once(&self.uri))
                .any(|text| text.to_ascii_lowercase().contains(&wanted.to_ascii_lowercase())),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DownloadResponse {
    #[serde(default)]
    product_download_options: Option<Vec<DownloadOption>>,
    #[serde(default)]
    errors: Option<Vec<ApiError>>,
}

fn describe_errors(errors: &[ApiError]) -> String {
    errors
        .iter()
        .map(|e| {
            format!(
                "{}: {}",
                e.key.as_deref().unwrap_or("error"),
                e.value.as_deref().unwrap_or("no details")
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

pub(crate) fn parse_skus(body: &str) -> Result<Vec<SkuInfo>> {
    let response: SkuResponse =
        serde_json::from_str(body).context("Failed to parse SKU response")?;
    match response.errors {
        Some(errors) if !errors.is_empty() => {
            bail!("SKU lookup rejected: {}", describe_errors(&errors))
        }
        _ => Ok(response.skus.unwrap_or_default()),
    }
}

pub(crate) fn parse_download_options(body: &str) -> Result<Vec<DownloadOption>> {
    let response: DownloadResponse =
        serde_json::from_str(body).context("Failed to parse download link response")?;
    match response.errors {
        Some(errors) if !errors.is_empty() => {
            bail!("Download link lookup rejected: {}", describe_errors(&errors))
        }
        _ => Ok(response.product_download_options.unwrap_or_default()),
    }
}

/// The SKU whose language matches, otherwise the first one listed.
pub(crate) fn select_sku<'a>(skus: &'a [SkuInfo], language: &str) -> Option<&'a SkuInfo> {
    skus.iter()
        .find(|sku| sku.language.eq_ignore_ascii_case(language))
        .or_else(|| skus.first())
}

pub(crate) fn select_option(
    options: &[DownloadOption],
    arch: Architecture,
) -> Result<&DownloadOption> {
    options.iter().find(|option| option.matches(arch)).ok_or_else(|| {
        let available: Vec<String> = options
            .iter()
            .map(|o| o.architecture.clone().unwrap_or_else(|| "unknown".to_string()))
            .collect();
        anyhow!(
            "No download available for architecture {} (available: {})",
            arch,
            available.join(", ")
        )
    })
}

pub struct WindowsDownloader {
    client: Client,
    config: DownloadConfig,
    request: DownloadRequest,
    session_id: String,
}

impl WindowsDownloader {
    pub fn new(request: DownloadRequest, config: DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .user_agent(config.user_agent.clone())
            .default_headers(browser_headers())
            .timeout(API_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            config,
            request,
            session_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Runs the whole lookup and returns the media URL for the requested
    /// architecture.
    pub fn resolve_download_url(&self, product_edition_id: &str) -> Result<String> {
        self.validate_locale()
            .context("Failed to validate locale")?;
        self.register_session()
            .context("Failed to register session")?;

        let skus = self
            .sku_information(product_edition_id)
            .context("Failed to get SKU information")?;
        let sku = select_sku(&skus, &self.request.language)
            .ok_or_else(|| anyhow!("No SKUs found for product edition {}", product_edition_id))?;
        log::info!("Using SKU {} ({})", sku.id, sku.language);

        self.download_link(&sku.id)
            .context("Failed to get download link")
    }

    fn validate_locale(&self) -> Result<()> {
        let url = self.with_version(&self.config.locale_page);
        log::debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("Failed to fetch {}", url))?;
        expect_ok(&response, "locale validation")
    }

    fn register_session(&self) -> Result<()> {
        log::debug!("Registering session {}", self.session_id);
        let response = self
            .client
            .get(&self.config.session_endpoint)
            .query(&[
                ("org_id", self.config.org_id.as_str()),
                ("session_id", self.session_id.as_str()),
            ])
            .send()?;
        expect_ok(&response, "session registration")
    }

    fn sku_information(&self, product_edition_id: &str) -> Result<Vec<SkuInfo>> {
        let response = self
            .client
            .get(&self.config.sku_endpoint)
            .query(&[
                ("profile", self.config.profile_id.as_str()),
                ("productEditionId", product_edition_id),
                ("SKU", "undefined"),
                ("friendlyFileName", "undefined"),
                ("Locale", self.request.language.as_str()),
                ("sessionID", self.session_id.as_str()),
            ])
            .send()?;
        expect_ok(&response, "SKU request")?;

        let body = response.text().context("Failed to read SKU response")?;
        let skus = parse_skus(&body)?;
        log::debug!("{} SKU(s) returned", skus.len());
        Ok(skus)
    }

    fn download_link(&self, sku_id: &str) -> Result<String> {
        let response = self
            .client
            .get(&self.config.download_endpoint)
            .query(&[
                ("profile", self.config.profile_id.as_str()),
                ("productEditionId", "undefined"),
                ("SKU", sku_id),
                ("friendlyFileName", "undefined"),
                ("Locale", self.request.language.as_str()),
                ("sessionID", self.session_id.as_str()),
            ])
            .header(header::REFERER, self.with_version(&self.config.referer))
            .send()?;
        expect_ok(&response, "download link request")?;

        let body = response
            .text()
            .context("Failed to read download link response")?;
        let options = parse_download_options(&body)?;
        let option = select_option(&options, self.request.arch)?;
        if let Some(sha) = &option.iso_sha256 {
            log::info!("Published SHA-256: {}", sha);
        }
        Ok(option.uri.clone())
    }

    fn with_version(&self, template: &str) -> String {
        template.replace("{version}", &self.request.version.to_string())
    }
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static("application/json, text/plain, */*"),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    headers.insert(header::DNT, HeaderValue::from_static("1"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("Sec-Fetch-Dest", HeaderValue::from_static("empty"));
    headers.insert("Sec-Fetch-Mode", HeaderValue::from_static("cors"));
    headers.insert("Sec-Fetch-Site", HeaderValue::from_static("same-origin"));
    headers
}

fn expect_ok(response: &Response, what: &str) -> Result<()> {
    if response.status() != reqwest::StatusCode::OK {
        bail!("{} failed with status: {}", what, response.status());
    }
    Ok(())
}

/// Streams `url` into `path`, reporting progress through the notifier.
/// Returns the number of bytes written.
pub fn download_file(url: &str, path: &Path, notifier: &Notifier) -> Result<u64> {
    let client = Client::builder()
        .timeout(None::<Duration>)
        .build()
        .context("Failed to create HTTP client")?;

    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("Failed to download {}", url))?;
    if !response.status().is_success() {
        bail!("Bad status: {}", response.status());
    }

    let total = response.content_length().unwrap_or(0);
    let file = File::create(path)
        .with_context(|| format!("Failed to create output file: {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let progress_bar = notifier.create_progress_bar(total, "Downloading");
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let n = response
            .read(&mut buffer)
            .context("Failed to read download stream")?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buffer[..n])
            .with_context(|| format!("Failed to write file: {}", path.display()))?;
        written += n as u64;

        match &progress_bar {
            Some(pb) => pb.set_position(written),
            None => notifier.progress(written, total, "Downloading"),
        }
    }
    writer
        .flush()
        .with_context(|| format!("Failed to write file: {}", path.display()))?;

    if let Some(pb) = progress_bar {
        pb.finish_and_clear();
    }
    if total > 0 && written != total {
        bail!("Download ended after {} of {} bytes", written, total);
    }
    Ok(written)
}
