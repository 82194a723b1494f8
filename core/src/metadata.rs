use std::io::Read;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::link::{LinkReference, ResourceKind};

const MAX_THUMBNAIL_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub title: String,
    pub artists: String,
    pub thumbnail_url: Option<String>,
}

impl ItemMetadata {
    pub fn new(title: impl Into<String>, artists: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artists: artists.into(),
            thumbnail_url: None,
        }
    }

    pub fn search_query(&self) -> String {
        format!("{} {}", self.title, self.artists)
    }

    pub fn display_name(&self) -> String {
        self.search_query()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub name: String,
    pub owner: Option<String>,
    pub thumbnail_url: Option<String>,
    pub items: Vec<ItemMetadata>,
}

impl CollectionMetadata {
    /// Albums land in `name`, playlists in `name - owner`.
    pub fn folder_name(&self) -> String {
        match &self.owner {
            Some(owner) if !owner.is_empty() => format!("{} - {}", self.name, owner),
            _ => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Metadata {
    Item(ItemMetadata),
    Collection(CollectionMetadata),
}

impl Metadata {
    pub fn thumbnail_url(&self) -> Option<&str> {
        match self {
            Metadata::Item(item) => item.thumbnail_url.as_deref(),
            Metadata::Collection(collection) => collection.thumbnail_url.as_deref(),
        }
    }
}

pub trait MetadataSource: Send + Sync {
    fn fetch(&self, link: &LinkReference) -> CoreResult<Metadata>;
    fn fetch_thumbnail(&self, url: &str) -> CoreResult<Vec<u8>>;
}

#[derive(Clone)]
pub struct HttpMetadataSource {
    client: Client,
    endpoint: String,
}

impl HttpMetadataSource {
    pub fn new(endpoint: &str, user_agent: &str, timeout: Duration) -> CoreResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

impl MetadataSource for HttpMetadataSource {
    fn fetch(&self, link: &LinkReference) -> CoreResult<Metadata> {
        debug!(kind = %link.kind(), id = link.id(), "fetching metadata");
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("type", link.kind().as_str()), ("id", link.id())])
            .send()
            .map_err(|err| CoreError::MetadataFetchFailed(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::MetadataFetchFailed(format!(
                "metadata service returned {}",
                status
            )));
        }
        let body = resp
            .text()
            .map_err(|err| CoreError::MetadataFetchFailed(err.to_string()))?;
        parse_metadata(link.kind(), &body)
    }

    fn fetch_thumbnail(&self, url: &str) -> CoreResult<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|err| CoreError::ThumbnailFetchFailed(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(CoreError::ThumbnailFetchFailed(format!(
                "{} returned {}",
                url,
                resp.status()
            )));
        }
        let mut buf = Vec::new();
        resp.take(MAX_THUMBNAIL_BYTES)
            .read_to_end(&mut buf)
            .map_err(|err| CoreError::ThumbnailFetchFailed(err.to_string()))?;
        Ok(buf)
    }
}

/// Decodes a metadata payload for `kind`. Any missing required field fails
/// the whole fetch.
pub fn parse_metadata(kind: ResourceKind, body: &str) -> CoreResult<Metadata> {
    let value: Value = serde_json::from_str(body)
        .map_err(|err| CoreError::MetadataFetchFailed(format!("malformed payload: {}", err)))?;

    match kind {
        ResourceKind::Track => parse_item(&value).map(Metadata::Item),
        ResourceKind::Album | ResourceKind::Playlist => {
            let name_key = if kind == ResourceKind::Album {
                "album_name"
            } else {
                "playlist_name"
            };
            let name = required_str(&value, name_key)?;
            let owner = match kind {
                ResourceKind::Playlist => Some(required_str(&value, "owner")?),
                _ => None,
            };
            let tracks = value
                .get("tracks")
                .and_then(Value::as_array)
                .ok_or_else(|| missing("tracks"))?;
            let items = tracks
                .iter()
                .map(parse_item)
                .collect::<CoreResult<Vec<_>>>()?;
            if items.is_empty() {
                return Err(CoreError::MetadataFetchFailed(format!(
                    "{} {} has no tracks",
                    kind, name
                )));
            }
            Ok(Metadata::Collection(CollectionMetadata {
                name,
                owner,
                thumbnail_url: first_image(&value),
                items,
            }))
        }
    }
}

fn parse_item(value: &Value) -> CoreResult<ItemMetadata> {
    let title = required_str(value, "track_name")?;
    let artists = match value.get("artists") {
        Some(Value::String(artists)) => artists.clone(),
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(|artist| match artist {
                Value::String(name) => Some(name.clone()),
                Value::Object(obj) => obj.get("name").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(", "),
        _ => return Err(missing("artists")),
    };
    Ok(ItemMetadata {
        title,
        artists,
        thumbnail_url: first_image(value),
    })
}

fn required_str(value: &Value, key: &str) -> CoreResult<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| missing(key))
}

fn missing(key: &str) -> CoreError {
    CoreError::MetadataFetchFailed(format!("missing field `{}`", key))
}

fn first_image(value: &Value) -> Option<String> {
    match value.get("images")? {
        Value::String(url) if !url.is_empty() => Some(url.clone()),
        Value::Array(images) => images.iter().find_map(|image| match image {
            Value::String(url) => Some(url.clone()),
            Value::Object(obj) => obj.get("url").and_then(Value::as_str).map(str::to_string),
            _ => None,
        }),
        _ => None,
    }
}
