use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::fetch::sanitize_file_name;
use crate::link::ResourceKind;
use crate::metadata::{ItemMetadata, Metadata};
use crate::quality::BitrateTier;

pub type JobId = Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ItemOutcome {
    Downloaded { path: PathBuf, tier: BitrateTier },
    Failed { error: String },
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Downloaded { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: JobId,
    pub kind: ResourceKind,
    pub items: Vec<ItemMetadata>,
    pub destination_root: PathBuf,
    pub destination_subfolder: Option<String>,
    pub created_at: u64,
    total_items: usize,
    processed_items: usize,
}

impl BatchJob {
    pub fn new(kind: ResourceKind, metadata: Metadata, destination_root: PathBuf) -> Self {
        let (items, subfolder) = match metadata {
            Metadata::Item(item) => (vec![item], None),
            Metadata::Collection(collection) => {
                let folder = sanitize_file_name(&collection.folder_name());
                (collection.items, Some(folder))
            }
        };
        Self {
            id: Uuid::new_v4(),
            kind,
            total_items: items.len(),
            items,
            destination_root,
            destination_subfolder: subfolder,
            created_at: now_epoch(),
            processed_items: 0,
        }
    }

    pub fn total_items(&self) -> usize {
        self.total_items
    }

    pub fn processed_items(&self) -> usize {
        self.processed_items
    }

    pub fn is_complete(&self) -> bool {
        self.processed_items == self.total_items
    }

    /// Counts one finished or abandoned item.
    pub fn mark_processed(&mut self) -> CoreResult<usize> {
        if self.processed_items >= self.total_items {
            return Err(CoreError::InvalidState(format!(
                "job {} already processed {} of {} items",
                self.id, self.processed_items, self.total_items
            )));
        }
        self.processed_items += 1;
        Ok(self.processed_items)
    }

    pub fn destination(&self) -> PathBuf {
        match &self.destination_subfolder {
            Some(folder) => self.destination_root.join(folder),
            None => self.destination_root.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub id: JobId,
    pub kind: ResourceKind,
    pub destination: PathBuf,
    pub outcomes: Vec<(ItemMetadata, ItemOutcome)>,
}

impl JobReport {
    pub fn new(job: &BatchJob) -> Self {
        Self {
            id: job.id,
            kind: job.kind,
            destination: job.destination(),
            outcomes: Vec::with_capacity(job.total_items()),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.outcomes.iter().filter_map(|(_, outcome)| match outcome {
            ItemOutcome::Downloaded { path, .. } => Some(path.as_path()),
            ItemOutcome::Failed { .. } => None,
        })
    }
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {} downloaded, {} failed -> {}",
            self.kind,
            self.id,
            self.succeeded(),
            self.failed(),
            self.destination.display()
        )
    }
}

pub(crate) fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::CollectionMetadata;

    #[test]
    fn single_track_writes_to_root() {
        let job = BatchJob::new(
            ResourceKind::Track,
            Metadata::Item(ItemMetadata::new("Song", "Artist")),
            PathBuf::from("/music"),
        );
        assert_eq!(job.total_items(), 1);
        assert_eq!(job.destination(), PathBuf::from("/music"));
    }

    #[test]
    fn playlist_gets_named_subfolder() {
        let job = BatchJob::new(
            ResourceKind::Playlist,
            Metadata::Collection(CollectionMetadata {
                name: "Road/Trip".to_string(),
                owner: Some("sam".to_string()),
                thumbnail_url: None,
                items: vec![ItemMetadata::new("a", "x"), ItemMetadata::new("b", "y")],
            }),
            PathBuf::from("/music"),
        );
        assert_eq!(job.destination(), PathBuf::from("/music/RoadTrip - sam"));
        assert_eq!(job.total_items(), 2);
    }

    #[test]
    fn processed_count_never_passes_total() {
        let mut job = BatchJob::new(
            ResourceKind::Track,
            Metadata::Item(ItemMetadata::new("Song", "Artist")),
            PathBuf::from("/music"),
        );
        assert!(!job.is_complete());
        assert_eq!(job.mark_processed().expect("first"), 1);
        assert!(job.is_complete());
        assert!(job.mark_processed().is_err());
        assert_eq!(job.processed_items(), 1);
    }
}
