//! # Photo Library Client
//!
//! The photo source the update manager pulls candidates from, plus an HTTP
//! implementation for a Google-Photos-style library API.
//!
//! ## API Endpoints
//! ```text
//! POST {base}/mediaItems:search   {"albumId": ..., "pageSize": 100, "pageToken": ...}
//! GET  {base}/albums/{albumId}
//! GET  {baseUrl}=d                 (original bytes of a media item)
//! ```
//!
//! Requests carry `Authorization: Bearer <token>` when a token is configured.
//! Signing in is handled elsewhere; this client only consumes the token.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Environment variable holding the photo service access token.
pub const TOKEN_ENV: &str = "ALBUM_WALLPAPER_TOKEN";

/// Items requested per search page (the API maximum).
const PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum PhotoSourceError {
    #[error("{message}")]
    Network { status: Option<u16>, message: String },
    #[error("{0}")]
    Auth(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Failed to parse photo service response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for PhotoSourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::Decode(err.to_string());
        }
        Self::Network {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

/// A remote photo, as far as wallpaper selection is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub id: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Where the image bytes are fetched from.
    pub download_url: String,
    pub mime_type: Option<String>,
}

impl MediaItem {
    pub fn is_image(&self) -> bool {
        self.mime_type
            .as_deref()
            .map_or(true, |mime| mime.starts_with("image/"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Album {
    pub id: String,
    pub title: Option<String>,
    pub media_items_count: Option<u64>,
}

#[async_trait]
pub trait PhotoSource: Send + Sync {
    /// Every media item currently in the album.
    async fn list_candidates(&self, album_id: &str) -> Result<Vec<MediaItem>, PhotoSourceError>;

    /// Raw image bytes of `item`.
    async fn download_image(&self, item: &MediaItem) -> Result<Vec<u8>, PhotoSourceError>;

    /// Looks the album up; `Ok(None)` when the service says it doesn't exist.
    async fn find_album(&self, album_id: &str) -> Result<Option<Album>, PhotoSourceError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest<'a> {
    album_id: &'a str,
    page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<&'a str>,
}

/// One page of `mediaItems:search`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    media_items: Vec<ApiMediaItem>,
    next_page_token: Option<String>,
}

/// Raw media item. Dimensions arrive as decimal strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiMediaItem {
    id: String,
    base_url: String,
    mime_type: Option<String>,
    #[serde(default)]
    media_metadata: ApiMediaMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct ApiMediaMetadata {
    width: Option<String>,
    height: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiAlbum {
    id: String,
    title: Option<String>,
    media_items_count: Option<String>,
}

impl From<ApiMediaItem> for MediaItem {
    fn from(item: ApiMediaItem) -> Self {
        Self {
            id: item.id,
            width: item.media_metadata.width.and_then(|w| w.parse().ok()),
            height: item.media_metadata.height.and_then(|h| h.parse().ok()),
            download_url: format!("{}=d", item.base_url),
            mime_type: item.mime_type,
        }
    }
}

impl From<ApiAlbum> for Album {
    fn from(album: ApiAlbum) -> Self {
        Self {
            id: album.id,
            title: album.title,
            media_items_count: album.media_items_count.and_then(|c| c.parse().ok()),
        }
    }
}

/// Maps non-success responses onto the error taxonomy.
async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response, PhotoSourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        format!("{what}: {status}")
    } else {
        format!("{what}: {status}: {}", body.trim())
    };
    Err(match status.as_u16() {
        401 | 403 => PhotoSourceError::Auth(message),
        404 => PhotoSourceError::NotFound(message),
        code => PhotoSourceError::Network { status: Some(code), message },
    })
}

/// HTTP client for the photo library API.
#[derive(Debug, Clone)]
pub struct HttpPhotoSource {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpPhotoSource {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, PhotoSourceError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("album-wallpaper/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Reads the access token from [`TOKEN_ENV`].
    pub fn from_env(base_url: &str) -> Result<Self, PhotoSourceError> {
        let token = std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty());
        Self::new(base_url, token)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl PhotoSource for HttpPhotoSource {
    async fn list_candidates(&self, album_id: &str) -> Result<Vec<MediaItem>, PhotoSourceError> {
        let url = format!("{}/mediaItems:search", self.base_url);
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let body = SearchRequest {
                album_id,
                page_size: PAGE_SIZE,
                page_token: page_token.as_deref(),
            };
            let response = self.authorized(self.client.post(&url)).json(&body).send().await?;
            let page: SearchResponse = check_status(response, "Failed to list album").await?.json().await?;

            items.extend(page.media_items.into_iter().map(MediaItem::from).filter(MediaItem::is_image));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        debug!(album_id, count = items.len(), "Listed album");
        Ok(items)
    }

    async fn download_image(&self, item: &MediaItem) -> Result<Vec<u8>, PhotoSourceError> {
        let response = self.authorized(self.client.get(&item.download_url)).send().await?;
        let bytes = check_status(response, "Failed to download image").await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    async fn find_album(&self, album_id: &str) -> Result<Option<Album>, PhotoSourceError> {
        let url = format!("{}/albums/{}", self.base_url, album_id);
        let response = self.authorized(self.client.get(&url)).send().await?;
        match check_status(response, "Failed to look up album").await {
            Ok(response) => Ok(Some(response.json::<ApiAlbum>().await?.into())),
            Err(PhotoSourceError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
