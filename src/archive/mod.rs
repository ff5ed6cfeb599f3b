//! Archive of completed analyses, one sled tree keyed by tracking id.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{AnalysisResult, TrackingId};

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// One archived analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedResult {
    pub tracking_id: TrackingId,
    pub archived_at: DateTime<Utc>,
    pub result: AnalysisResult,
}

pub trait Archive: Send + Sync {
    /// Store (or overwrite) the result for `tracking_id`.
    fn store(&self, tracking_id: &TrackingId, result: &AnalysisResult) -> ArchiveResult<()>;

    fn get(&self, tracking_id: &TrackingId) -> ArchiveResult<Option<ArchivedResult>>;

    /// Every record, newest first.
    fn list(&self) -> ArchiveResult<Vec<ArchivedResult>>;
}

pub struct SledArchive {
    tree: sled::Tree,
}

impl SledArchive {
    /// Open or create the archive under `dir`.
    pub fn open(dir: &Path) -> ArchiveResult<Self> {
        let db = sled::open(dir)?;
        let tree = db.open_tree("results")?;
        Ok(Self { tree })
    }

    /// Throwaway archive that lives only as long as the process.
    pub fn temporary() -> ArchiveResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let tree = db.open_tree("results")?;
        Ok(Self { tree })
    }
}

impl Archive for SledArchive {
    fn store(&self, tracking_id: &TrackingId, result: &AnalysisResult) -> ArchiveResult<()> {
        let record = ArchivedResult {
            tracking_id: tracking_id.clone(),
            archived_at: Utc::now(),
            result: result.clone(),
        };
        let bytes = serde_json::to_vec(&record)?;
        self.tree.insert(tracking_id.as_str().as_bytes(), bytes)?;
        self.tree.flush()?;
        Ok(())
    }

    fn get(&self, tracking_id: &TrackingId) -> ArchiveResult<Option<ArchivedResult>> {
        match self.tree.get(tracking_id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list(&self) -> ArchiveResult<Vec<ArchivedResult>> {
        let mut records = Vec::new();
        for item in self.tree.iter() {
            let (_, bytes) = item?;
            records.push(serde_json::from_slice::<ArchivedResult>(&bytes)?);
        }
        records.sort_by(|a, b| b.archived_at.cmp(&a.archived_at));
        Ok(records)
    }
}
