use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Track,
    Album,
    Playlist,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Track => "track",
            ResourceKind::Album => "album",
            ResourceKind::Playlist => "playlist",
        }
    }

    /// Exact, case-sensitive match on the path segment.
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "track" => Some(ResourceKind::Track),
            "album" => Some(ResourceKind::Album),
            "playlist" => Some(ResourceKind::Playlist),
            _ => None,
        }
    }

    pub fn is_collection(&self) -> bool {
        !matches!(self, ResourceKind::Track)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkReference {
    kind: ResourceKind,
    id: String,
}

impl LinkReference {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for LinkReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone)]
pub struct LinkResolver {
    prefix: Url,
}

impl LinkResolver {
    pub fn new(prefix: &str) -> CoreResult<Self> {
        let prefix = Url::parse(prefix)
            .map_err(|err| CoreError::InvalidLink(format!("bad link prefix {}: {}", prefix, err)))?;
        if prefix.host_str().is_none() {
            return Err(CoreError::InvalidLink(format!(
                "link prefix has no host: {}",
                prefix
            )));
        }
        Ok(Self { prefix })
    }

    pub fn resolve(&self, uri: &str) -> CoreResult<LinkReference> {
        let uri = uri.trim();
        let parsed =
            Url::parse(uri).map_err(|_| CoreError::InvalidLink(uri.to_string()))?;
        if !self.matches_prefix(&parsed) {
            return Err(CoreError::InvalidLink(uri.to_string()));
        }

        let base = self.prefix.path().trim_end_matches('/');
        let rest = parsed
            .path()
            .strip_prefix(base)
            .ok_or_else(|| CoreError::InvalidLink(uri.to_string()))?;
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() < 2 {
            return Err(CoreError::InvalidLink(uri.to_string()));
        }

        let kind = segments[segments.len() - 2];
        let id = segments[segments.len() - 1];
        let kind = ResourceKind::from_str(kind)
            .ok_or_else(|| CoreError::UnsupportedResourceKind(kind.to_string()))?;

        Ok(LinkReference {
            kind,
            id: id.to_string(),
        })
    }

    fn matches_prefix(&self, url: &Url) -> bool {
        let host = match (url.host_str(), self.prefix.host_str()) {
            (Some(host), Some(expected)) => host.eq_ignore_ascii_case(expected),
            _ => false,
        };
        host && url.scheme() == self.prefix.scheme()
            && url.port_or_known_default() == self.prefix.port_or_known_default()
    }
}
