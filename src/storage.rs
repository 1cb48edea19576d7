//! Where label images go once they have been read.

use tokio::fs;
use uuid::Uuid;

use crate::prelude::*;

/// Interface to file storage.
#[async_trait]
pub trait FileSink: Send + Sync + 'static {
    /// Store `bytes` and return a URL or key for them.
    async fn store(&self, file_name: &str, bytes: &[u8], mime_type: &str) -> Result<String>;
}

/// Stores files in a local directory, returning `file://` URLs.
#[derive(Debug)]
pub struct LocalDirSink {
    dir: PathBuf,
}

impl LocalDirSink {
    /// Create a sink writing to `dir`. The directory is created on first use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

/// Keep only characters which are safe in a file name everywhere.
fn sanitize_file_name(file_name: &str) -> String {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or_default();
    let clean = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    let clean = clean.trim_start_matches('.');
    if clean.is_empty() {
        "image".to_owned()
    } else {
        clean.to_owned()
    }
}

#[async_trait]
impl FileSink for LocalDirSink {
    #[instrument(level = "debug", skip_all, fields(file_name = %file_name))]
    async fn store(&self, file_name: &str, bytes: &[u8], mime_type: &str) -> Result<String> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("could not create {}", self.dir.display()))?;
        let path = self
            .dir
            .join(format!("{}-{}", Uuid::new_v4(), sanitize_file_name(file_name)));
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("could not write {}", path.display()))?;
        let path = fs::canonicalize(&path)
            .await
            .with_context(|| format!("could not resolve {}", path.display()))?;
        debug!(%mime_type, path = %path.display(), "Stored image");
        Ok(format!("file://{}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize_file_name("../x/label 1.jpg"), "label_1.jpg");
        assert_eq!(sanitize_file_name("C:\\a\\b.png"), "b.png");
        assert_eq!(sanitize_file_name(".."), "image");
    }

    #[tokio::test]
    async fn stores_files_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalDirSink::new(dir.path().join("uploads"));
        let url = sink.store("label.png", b"png", "image/png").await.unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("-label.png"));
        let path = url.trim_start_matches("file://");
        assert_eq!(std::fs::read(path).unwrap(), b"png");
    }
}
