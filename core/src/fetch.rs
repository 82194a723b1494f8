//! Per-item pipeline: search, pick a stream off the quality ladder, download,
//! then normalize the container extension.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::metadata::ItemMetadata;
use crate::provider::MediaProvider;
use crate::quality::{BitrateTier, QualityLadder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ItemStage {
    Fetching,
    Matching,
    Downloading,
    Normalizing,
    Counted,
}

impl ItemStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStage::Fetching => "fetching",
            ItemStage::Matching => "matching",
            ItemStage::Downloading => "downloading",
            ItemStage::Normalizing => "normalizing",
            ItemStage::Counted => "counted",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    Stage(ItemStage),
    TierFailed { tier: BitrateTier, error: String },
    Bytes { downloaded: u64, total: Option<u64> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedItem {
    pub path: PathBuf,
    pub tier: BitrateTier,
}

pub struct ItemFetcher<'a> {
    provider: &'a dyn MediaProvider,
    canonical_extension: &'a str,
}

impl<'a> ItemFetcher<'a> {
    pub fn new(provider: &'a dyn MediaProvider, canonical_extension: &'a str) -> Self {
        Self {
            provider,
            canonical_extension,
        }
    }

    pub fn fetch(
        &self,
        item: &ItemMetadata,
        dest_dir: &Path,
        observer: &dyn Fn(FetchEvent),
    ) -> CoreResult<FetchedItem> {
        observer(FetchEvent::Stage(ItemStage::Matching));
        let query = item.search_query();
        let handle = self
            .provider
            .search(&query)?
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::NoMatchFound(query.clone()))?;
        debug!(query = %query, matched = %handle.title, "first search result taken");

        let ladder = QualityLadder::from_streams(self.provider.streams(&handle)?);
        fs::create_dir_all(dest_dir)
            .map_err(|err| CoreError::Io(format!("{}: {}", dest_dir.display(), err)))?;

        observer(FetchEvent::Stage(ItemStage::Downloading));
        let stem = sanitize_file_name(&item.title);
        let on_bytes = |downloaded: u64, total: Option<u64>| {
            observer(FetchEvent::Bytes { downloaded, total });
        };
        for candidate in ladder.candidates() {
            match self
                .provider
                .download(&handle, &candidate.stream, dest_dir, &stem, &on_bytes)
            {
                Ok(path) => {
                    info!(item = %item.title, tier = %candidate.tier, "stream downloaded");
                    observer(FetchEvent::Stage(ItemStage::Normalizing));
                    let path = normalize_extension(&path, self.canonical_extension)?;
                    return Ok(FetchedItem {
                        path,
                        tier: candidate.tier,
                    });
                }
                Err(err) => {
                    warn!(item = %item.title, tier = %candidate.tier, error = %err, "tier failed, falling back");
                    observer(FetchEvent::TierFailed {
                        tier: candidate.tier,
                        error: err.to_string(),
                    });
                }
            }
        }

        Err(CoreError::AllQualitiesExhausted(item.display_name()))
    }
}

/// Renames `path` to carry `extension`. The bytes are left as they are.
pub fn normalize_extension(path: &Path, extension: &str) -> CoreResult<PathBuf> {
    let extension = extension.trim_start_matches('.');
    let current = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    if current.eq_ignore_ascii_case(extension) {
        return Ok(path.to_path_buf());
    }
    let target = path.with_extension(extension);
    fs::rename(path, &target).map_err(|err| {
        CoreError::Io(format!(
            "rename {} -> {}: {}",
            path.display(),
            target.display(),
            err
        ))
    })?;
    Ok(target)
}

/// Strips characters that cannot appear in a file name on common platforms.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|ch| !matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .filter(|ch| !ch.is_control())
        .collect();
    let cleaned = cleaned.trim().trim_end_matches('.').trim();
    if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned.to_string()
    }
}
