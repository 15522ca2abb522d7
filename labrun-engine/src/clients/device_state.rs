use anyhow::Result;
use async_trait::async_trait;
use labrun_shared::dut::DeviceState;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::Mutex;

use super::DeviceStateStore;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoredState {
    pub state: DeviceState,
    pub updated_at: u64,
}

type StateIndex = HashMap<String, StoredState>;

/// Device-state store backed by a JSON file, for runs without a lab
/// state service.
pub struct FileDeviceStateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileDeviceStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<StateIndex> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let data = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[async_trait]
impl DeviceStateStore for FileDeviceStateStore {
    async fn get_state(&self, hostname: &str) -> Result<DeviceState> {
        let _guard = self.lock.lock().await;
        let index = self.load()?;
        Ok(index
            .get(hostname)
            .map(|s| s.state)
            .unwrap_or_default())
    }

    async fn set_state(&self, hostname: &str, state: DeviceState) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut index = self.load()?;
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        index.insert(
            hostname.to_string(),
            StoredState {
                state,
                updated_at: now,
            },
        );

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(&index)?;
        write_atomic(&self.path, &data)?;
        Ok(())
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(tmp, path)?;
    Ok(())
}
