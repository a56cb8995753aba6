//! Turns a caller-supplied logo into the one canonical launcher icon: a
//! fixed-size square PNG.

use crate::config::LogoConfig;
use crate::error::BuildError;
use apkbrand_request::{DataUrl, LogoSource};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::ImageOutputFormat;
use image::imageops::FilterType;
use std::io::Cursor;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct LogoNormalizer {
    client: reqwest::Client,
    max_bytes: usize,
    size: u32,
}

impl LogoNormalizer {
    pub fn new(config: &LogoConfig) -> Result<Self, BuildError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .map_err(|err| BuildError::io("building http client", std::io::Error::other(err)))?;

        Ok(Self {
            client,
            max_bytes: config.max_bytes,
            size: config.size.max(1),
        })
    }

    /// Fetches or decodes `source`, then normalizes it.
    pub async fn load(&self, source: &LogoSource) -> Result<Vec<u8>, BuildError> {
        let raw = match source {
            LogoSource::Url(url) => self.fetch(url).await?,
            LogoSource::DataUrl(data) => self.decode_data_url(data)?,
        };

        self.normalize(raw).await
    }

    /// Streams the body, giving up as soon as it exceeds the size ceiling.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, BuildError> {
        info!("→ fetching logo {url}");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| BuildError::Validation(format!("could not fetch logo: {err}")))?;

        if !response.status().is_success() {
            return Err(BuildError::Validation(format!(
                "logo url answered {}",
                response.status()
            )));
        }

        if let Some(len) = response.content_length() {
            self.check_size(usize::try_from(len).unwrap_or(usize::MAX))?;
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|err| BuildError::Validation(format!("could not fetch logo: {err}")))?;
            body.extend_from_slice(&chunk);
            self.check_size(body.len())?;
        }

        Ok(body)
    }

    /// Decodes a `data:image/*;base64,...` logo. The encoded length is checked
    /// before anything is decoded.
    pub fn decode_data_url(&self, data: &str) -> Result<Vec<u8>, BuildError> {
        let parsed = DataUrl::parse(data)?;
        let payload: String = parsed.payload.chars().filter(|c| !c.is_whitespace()).collect();

        self.check_size(payload.len() / 4 * 3)?;

        let bytes = STANDARD
            .decode(payload.as_bytes())
            .map_err(|err| BuildError::Validation(format!("logo is not valid base64: {err}")))?;
        debug!(mime = parsed.mime, bytes = bytes.len(), "decoded inline logo");

        Ok(bytes)
    }

    pub async fn normalize(&self, raw: Vec<u8>) -> Result<Vec<u8>, BuildError> {
        if raw.is_empty() {
            return Err(BuildError::Validation("logo is empty".to_string()));
        }
        self.check_size(raw.len())?;

        let size = self.size;
        tokio::task::spawn_blocking(move || normalize_png(&raw, size))
            .await
            .map_err(|err| BuildError::io("normalizing logo", std::io::Error::other(err)))?
    }

    fn check_size(&self, len: usize) -> Result<(), BuildError> {
        if len > self.max_bytes {
            return Err(BuildError::Validation(format!(
                "logo too large ({len} bytes, limit {})",
                self.max_bytes
            )));
        }

        Ok(())
    }
}

/// Center-crops and resizes any supported image to `size`x`size` PNG.
pub fn normalize_png(raw: &[u8], size: u32) -> Result<Vec<u8>, BuildError> {
    let image = image::load_from_memory(raw)
        .map_err(|err| BuildError::Validation(format!("unsupported logo image: {err}")))?;

    let icon = image.resize_to_fill(size, size, FilterType::Lanczos3);

    let mut out = Cursor::new(Vec::new());
    icon.write_to(&mut out, ImageOutputFormat::Png)
        .map_err(|err| BuildError::io("encoding logo", std::io::Error::other(err)))?;

    Ok(out.into_inner())
}
