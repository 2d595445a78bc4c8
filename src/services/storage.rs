use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("The image must be less than 2MB.")]
    TooLarge,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub const MAX_IMAGE_BYTES: usize = 2 * 1024 * 1024;

/// Maps an upload's mime type to the stored extension. Anything outside
/// the allowlist is rejected.
pub fn extension_for(content_type: &mime::Mime) -> Option<&'static str> {
    if content_type.type_() != mime::IMAGE {
        return None;
    }

    match content_type.subtype().as_str() {
        "jpeg" | "jpg" => Some("jpg"),
        "png" => Some("png"),
        "webp" => Some("webp"),
        _ => None,
    }
}

/// Store-bytes-return-path image storage rooted at an injected directory.
#[derive(Debug, Clone)]
pub struct ImageStorage {
    root: PathBuf,
}

impl ImageStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Writes the bytes under a fresh name and returns the path recorded
    /// on the parcel.
    pub async fn store(&self, bytes: &[u8], extension: &str) -> Result<String, StorageError> {
        if bytes.len() > MAX_IMAGE_BYTES {
            return Err(StorageError::TooLarge);
        }

        let filename = format!(
            "{}_{}.{}",
            Utc::now().timestamp(),
            random_token(20),
            extension
        );

        tokio::fs::write(self.root.join(&filename), bytes).await?;

        Ok(format!("uploads/{}", filename))
    }

    /// Best-effort removal of a previously stored image. Only the basename
    /// of the recorded path is used, so stale or hostile paths cannot
    /// escape the root.
    pub async fn remove(&self, stored_path: &str) {
        let Some(filename) = Path::new(stored_path).file_name() else {
            return;
        };

        let full_path = self.root.join(filename);
        if let Err(e) = tokio::fs::remove_file(&full_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove stored image {:?}: {}", full_path, e);
            }
        }
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
