use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use vramgate_journal::{Journal, JournalError};

use crate::config::SchedulerConfig;
use crate::scheduler::ResourceScheduler;

/// One scheduler per project directory, created on first use.
///
/// Built by the application's composition root and passed down; there is no
/// process-wide instance.
pub struct SchedulerRegistry {
    config: SchedulerConfig,
    journaled: bool,
    schedulers: Mutex<HashMap<PathBuf, ResourceScheduler>>,
}

impl SchedulerRegistry {
    /// Schedulers write their snapshot and event log under each project directory.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            journaled: true,
            schedulers: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory(config: SchedulerConfig) -> Self {
        Self {
            journaled: false,
            ..Self::new(config)
        }
    }

    pub fn get_or_create(&self, project_dir: impl AsRef<Path>) -> Result<ResourceScheduler, JournalError> {
        let key = project_dir.as_ref().to_path_buf();
        let mut schedulers = self
            .schedulers
            .lock()
            .map_err(|_| JournalError::Io("registry lock poisoned".into()))?;
        if let Some(existing) = schedulers.get(&key) {
            return Ok(existing.clone());
        }
        let scheduler = if self.journaled {
            ResourceScheduler::with_journal(self.config.clone(), Journal::for_project(&key)?)
        } else {
            ResourceScheduler::new(self.config.clone())
        };
        schedulers.insert(key, scheduler.clone());
        Ok(scheduler)
    }

    /// Forget a project's scheduler. Its task stops once every handle and lease is gone.
    pub fn remove(&self, project_dir: impl AsRef<Path>) -> Option<ResourceScheduler> {
        self.schedulers.lock().ok()?.remove(project_dir.as_ref())
    }

    pub fn len(&self) -> usize {
        self.schedulers.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vramgate_types::{ResourceRequest, TaskKind};

    #[tokio::test]
    async fn one_scheduler_per_project() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let registry = SchedulerRegistry::new(SchedulerConfig::default());

        let first = registry.get_or_create(a.path()).unwrap();
        let again = registry.get_or_create(a.path()).unwrap();
        let other = registry.get_or_create(b.path()).unwrap();
        assert_eq!(registry.len(), 2);

        let _lease = first
            .acquire(ResourceRequest::new(TaskKind::Generic).with_vram_mb(512))
            .await
            .unwrap();
        assert_eq!(again.snapshot().await.unwrap().used_vram_mb, 512);
        assert_eq!(other.snapshot().await.unwrap().used_vram_mb, 0);
        assert!(vramgate_journal::journal_dir(a.path())
            .join(vramgate_journal::SNAPSHOT_FILE)
            .exists());

        assert!(registry.remove(b.path()).is_some());
        assert_eq!(registry.len(), 1);
    }
}
