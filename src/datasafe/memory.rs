use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{DataSafe, DataSafeError};

/// In-memory backend used by session and registry tests.
#[derive(Default)]
pub struct MemoryDataSafe {
    entries: Mutex<HashMap<String, String>>,
    saves: AtomicUsize,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl MemoryDataSafe {
    pub fn with_entry(key: &str, data: &str) -> Self {
        let safe = Self::default();
        safe.entries.lock().unwrap().insert(key.to_string(), data.to_string());
        safe
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make every following call fail with `StorageUnavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), DataSafeError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DataSafeError::StorageUnavailable("memory: failing on purpose".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DataSafe for MemoryDataSafe {
    async fn save(&self, key: &str, data: &str) -> Result<(), DataSafeError> {
        self.check()?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().insert(key.to_string(), data.to_string());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<String, DataSafeError> {
        self.check()?;
        Ok(self.get(key).unwrap_or_default())
    }

    async fn configure(&self, _config: &str) -> Result<(), DataSafeError> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn flush_and_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
