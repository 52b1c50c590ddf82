use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use idhini_db::{Database, WorkflowService};
use tracing::debug;

use crate::config::Config;

pub struct DatabaseManager {
    db: Arc<Database>,
    service: WorkflowService<Database>,
    db_path: PathBuf,
    compact_after: usize,
}

impl DatabaseManager {
    pub fn load(config: &Config) -> Result<Self> {
        Self::load_from_path(&config.db_path, config.compact_after)
    }

    pub fn load_from_path<P: AsRef<Path>>(db_path: P, compact_after: usize) -> Result<Self> {
        let db_path = db_path.as_ref();

        if !db_path.exists() {
            bail!(
                "Database not found at: {}\nRun 'idhini init' first.",
                db_path.display()
            );
        }

        let db = Arc::new(Database::open(db_path).context("Failed to open database")?);
        let service = WorkflowService::new(db.clone(), db.clone());

        Ok(Self {
            db,
            service,
            db_path: db_path.to_path_buf(),
            compact_after,
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn service(&self) -> &WorkflowService<Database> {
        &self.service
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn compact(&self) -> Result<()> {
        self.db.compact().context("Failed to compact database")
    }

    /// Compacts once the WAL has grown past the configured frame count.
    pub fn finish(self) -> Result<()> {
        let frames = self.db.wal_frames().context("Failed to read WAL state")?;

        if self.compact_after > 0 && frames >= self.compact_after {
            debug!(frames, threshold = self.compact_after, "auto-compacting");
            self.compact()?;
        }

        Ok(())
    }
}
