//! Stable worker identity.
//!
//! A UUID is generated on first boot and persisted; the worker id is derived
//! from it, so a restarted agent updates its existing record instead of
//! leaving a ghost behind.

use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::error::{AgentError, AgentResult};

const ID_HEX_LEN: usize = 16;

/// Identity of this worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    uuid: Uuid,
    worker_id: String,
}

impl WorkerIdentity {
    /// Derives the identity for `uuid`.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        let digest = Sha256::digest(uuid.to_string().as_bytes());
        let hex = hex::encode(digest);
        Self {
            uuid,
            worker_id: format!("w-{}", &hex[..ID_HEX_LEN]),
        }
    }

    /// Reads the UUID at `path`, creating it (and missing parent
    /// directories) on first boot.
    pub async fn load_or_create(path: &Path) -> AgentResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let uuid = Uuid::parse_str(contents.trim()).map_err(|e| {
                    AgentError::identity(format!("{} is not a UUID: {e}", path.display()))
                })?;
                Ok(Self::from_uuid(uuid))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let uuid = Uuid::new_v4();
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                // Write then rename so a crash never leaves a truncated file.
                let staging = path.with_extension("tmp");
                tokio::fs::write(&staging, format!("{uuid}\n")).await?;
                tokio::fs::rename(&staging, path).await?;

                let identity = Self::from_uuid(uuid);
                info!(path = %path.display(), worker_id = %identity.worker_id, "created worker identity");
                Ok(identity)
            }
            Err(e) => Err(AgentError::identity(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}
