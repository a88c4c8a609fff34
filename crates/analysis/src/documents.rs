//! Local document storage.
//!
//! A [`FileRef`] is a path relative to the documents root. Absolute paths and
//! `..` components are rejected so a caller cannot reach outside the root.

use std::path::{Component, Path, PathBuf};

use docflow_core::FileRef;
use thiserror::Error;
use uuid::Uuid;

/// Directory (under the root) uploaded documents are written to.
pub const UPLOADS_DIR: &str = "uploads";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("invalid file reference '{0}'")]
    InvalidRef(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("document io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct LocalDocuments {
    root: PathBuf,
}

impl LocalDocuments {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, file_ref: &FileRef) -> Result<PathBuf, DocumentError> {
        let raw = file_ref.as_str().trim();
        if raw.is_empty() {
            return Err(DocumentError::InvalidRef(raw.to_string()));
        }
        let relative = Path::new(raw);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(DocumentError::InvalidRef(raw.to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// Resolve `file_ref` to an existing regular file under the root.
    pub async fn resolve(&self, file_ref: &FileRef) -> Result<PathBuf, DocumentError> {
        let path = self.path_of(file_ref)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(DocumentError::NotFound(file_ref.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DocumentError::NotFound(file_ref.to_string()))
            }
            Err(e) => Err(DocumentError::Io(e)),
        }
    }

    /// Read the document as text, replacing invalid UTF-8, keeping at most `max_chars`.
    pub async fn read_text(&self, file_ref: &FileRef, max_chars: usize) -> Result<String, DocumentError> {
        let path = self.resolve(file_ref).await?;
        let bytes = tokio::fs::read(&path).await?;
        Ok(String::from_utf8_lossy(&bytes).chars().take(max_chars).collect())
    }

    /// Store an uploaded document and return its reference.
    ///
    /// Every upload gets a fresh name; the original name only contributes its extension.
    pub async fn save_upload(&self, original_name: Option<&str>, bytes: &[u8]) -> Result<FileRef, DocumentError> {
        let extension = original_name
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_else(|| "pdf".to_string());

        let file_name = format!("financial_document_{}.{extension}", Uuid::now_v7().simple());
        let dir = self.root.join(UPLOADS_DIR);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(&file_name), bytes).await?;

        Ok(FileRef::new(format!("{UPLOADS_DIR}/{file_name}")))
    }

    /// Delete a stored document. Removing one that is already gone is not an error.
    pub async fn remove(&self, file_ref: &FileRef) -> Result<(), DocumentError> {
        let path = self.path_of(file_ref)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DocumentError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sample.pdf"), b"Q3 revenue").unwrap();
        let docs = LocalDocuments::new(dir.path());

        let path = docs.resolve(&FileRef::new("sample.pdf")).await.unwrap();
        assert_eq!(path, dir.path().join("sample.pdf"));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let docs = LocalDocuments::new(dir.path());
        let err = docs.resolve(&FileRef::new("nope.pdf")).await.unwrap_err();
        assert!(matches!(err, DocumentError::NotFound(_)));
    }

    #[tokio::test]
    async fn directories_are_not_documents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("folder")).unwrap();
        let docs = LocalDocuments::new(dir.path());
        let err = docs.resolve(&FileRef::new("folder")).await.unwrap_err();
        assert!(matches!(err, DocumentError::NotFound(_)));
    }

    #[tokio::test]
    async fn traversal_and_absolute_refs_are_rejected() {
        let docs = LocalDocuments::new("data");
        for bad in ["../etc/passwd", "a/../../b", "/etc/passwd", ""] {
            let err = docs.resolve(&FileRef::new(bad)).await.unwrap_err();
            assert!(matches!(err, DocumentError::InvalidRef(_)), "{bad} accepted");
        }
    }

    #[tokio::test]
    async fn read_text_is_lossy_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = b"abc".to_vec();
        bytes.push(0xff);
        bytes.extend_from_slice(b"defghij");
        std::fs::write(dir.path().join("doc.bin"), &bytes).unwrap();
        let docs = LocalDocuments::new(dir.path());

        let text = docs.read_text(&FileRef::new("doc.bin"), 6).await.unwrap();
        assert_eq!(text, "abc\u{fffd}de");
    }

    #[tokio::test]
    async fn uploads_get_unique_resolvable_refs() {
        let dir = tempfile::tempdir().unwrap();
        let docs = LocalDocuments::new(dir.path());

        let a = docs.save_upload(Some("report.PDF"), b"one").await.unwrap();
        let b = docs.save_upload(Some("report.pdf"), b"two").await.unwrap();

        assert_ne!(a, b);
        assert!(a.as_str().starts_with("uploads/financial_document_"));
        assert!(a.as_str().ends_with(".pdf"));
        assert_eq!(docs.read_text(&b, 100).await.unwrap(), "two");
    }

    #[tokio::test]
    async fn remove_deletes_once_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let docs = LocalDocuments::new(dir.path());
        let saved = docs.save_upload(Some("q3.txt"), b"revenue").await.unwrap();

        docs.remove(&saved).await.unwrap();
        assert!(matches!(docs.resolve(&saved).await, Err(DocumentError::NotFound(_))));
        docs.remove(&saved).await.unwrap();

        let err = docs.remove(&FileRef::new("../outside.txt")).await.unwrap_err();
        assert!(matches!(err, DocumentError::InvalidRef(_)));
    }
}
