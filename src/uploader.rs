use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::blocking::multipart::{Form, Part};
use serde::Deserialize;

const DEFAULT_UPLOAD_API_URL: &str = "https://api.imgbb.com/1/upload";
const UPLOAD_URL_ENV: &str = "DEPOT_UPLOAD_URL";
const HTTP_USER_AGENT: &str = concat!("avatar-depot/", env!("CARGO_PKG_VERSION"));
const UPLOAD_FILE_NAME: &str = "avatar.png";
const UPLOAD_FAILED_MESSAGE: &str = "Upload failed";

/// Locations returned by the host for one uploaded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedImage {
    pub display_url: String,
    pub thumb_url: String,
    pub delete_url: String,
}

/// Remote image host. Failures carry a single human-readable message.
pub trait ImageHost {
    fn upload(&self, api_key: &str, png: &[u8]) -> Result<UploadedImage>;
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    success: bool,
    data: Option<UploadData>,
    error: Option<UploadError>,
}

#[derive(Debug, Deserialize)]
struct UploadData {
    display_url: String,
    thumb: Option<UploadThumb>,
    #[serde(default)]
    delete_url: String,
}

#[derive(Debug, Deserialize)]
struct UploadThumb {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadError {
    message: Option<String>,
}

/// imgbb upload endpoint over a blocking client. No timeout or retry is
/// layered on top of the transport defaults.
pub struct ImgbbClient {
    client: Client,
    endpoint: String,
}

impl ImgbbClient {
    pub fn new() -> Result<Self> {
        let endpoint = std::env::var(UPLOAD_URL_ENV)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_UPLOAD_API_URL.to_string());
        Self::with_endpoint(endpoint)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(HTTP_USER_AGENT)
            .build()
            .context("failed to create upload http client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

impl ImageHost for ImgbbClient {
    fn upload(&self, api_key: &str, png: &[u8]) -> Result<UploadedImage> {
        let image = Part::bytes(png.to_vec())
            .file_name(UPLOAD_FILE_NAME)
            .mime_str("image/png")
            .context("failed to build upload form")?;
        let form = Form::new().text("key", api_key.to_string()).part("image", image);

        crate::debug_log!("[upload] posting {} bytes to {}", png.len(), self.endpoint);
        let body = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .context("failed to reach image host")?
            .text()
            .context("failed to read upload response")?;

        parse_upload_response(&body)
    }
}

/// The host reports API errors in the body, often with a non-2xx status, so
/// the body is parsed regardless of status.
fn parse_upload_response(body: &str) -> Result<UploadedImage> {
    let Ok(response) = serde_json::from_str::<UploadResponse>(body) else {
        bail!(UPLOAD_FAILED_MESSAGE);
    };

    match response.data {
        Some(data) if response.success => {
            let thumb_url = data
                .thumb
                .and_then(|thumb| thumb.url)
                .filter(|url| !url.is_empty())
                .unwrap_or_else(|| data.display_url.clone());
            Ok(UploadedImage {
                display_url: data.display_url,
                thumb_url,
                delete_url: data.delete_url,
            })
        }
        _ => {
            let message = response
                .error
                .and_then(|error| error.message)
                .filter(|message| !message.trim().is_empty())
                .unwrap_or_else(|| UPLOAD_FAILED_MESSAGE.to_string());
            bail!(message)
        }
    }
}
