//! The read-only set of known identities loaded at startup.

use crate::types::{Embedding, KnownIdentity};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("failed to read gallery {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed gallery file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("identity '{name}' has {actual}-dim embedding, expected {expected}")]
    Dimension {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("identity '{0}' appears more than once")]
    DuplicateName(String),
    #[error("identity name must not be empty")]
    EmptyName,
    #[error("identity '{0}' has a NaN or infinite embedding component")]
    NonFinite(String),
}

/// Ordered collection of known identities with a fixed embedding dimensionality.
///
/// Never mutated after construction; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Gallery {
    identities: Vec<KnownIdentity>,
    dim: usize,
}

impl Gallery {
    /// Validate and wrap a list of identities. Order is preserved.
    pub fn new(identities: Vec<KnownIdentity>, dim: usize) -> Result<Self, GalleryError> {
        let mut seen = HashSet::new();
        for identity in &identities {
            if identity.name.trim().is_empty() {
                return Err(GalleryError::EmptyName);
            }
            if identity.embedding.dim() != dim {
                return Err(GalleryError::Dimension {
                    name: identity.name.clone(),
                    expected: dim,
                    actual: identity.embedding.dim(),
                });
            }
            if !identity.embedding.is_finite() {
                return Err(GalleryError::NonFinite(identity.name.clone()));
            }
            if !seen.insert(identity.name.as_str()) {
                return Err(GalleryError::DuplicateName(identity.name.clone()));
            }
        }
        Ok(Self { identities, dim })
    }

    /// Load a JSON gallery: `[{"name": "bob", "embedding": [0.1, ...]}, ...]`.
    pub fn load_json(path: &Path, dim: usize) -> Result<Self, GalleryError> {
        let raw = std::fs::read_to_string(path).map_err(|source| GalleryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let identities: Vec<KnownIdentity> =
            serde_json::from_str(&raw).map_err(|source| GalleryError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        let gallery = Self::new(identities, dim)?;
        tracing::info!(path = %path.display(), identities = gallery.len(), "gallery loaded");
        Ok(gallery)
    }

    pub fn identities(&self) -> &[KnownIdentity] {
        &self.identities
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// True when `embedding` has the gallery's dimensionality and no NaN or
    /// infinite components.
    pub fn accepts(&self, embedding: &Embedding) -> bool {
        embedding.dim() == self.dim && embedding.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn identity(name: &str, values: &[f32]) -> KnownIdentity {
        KnownIdentity {
            name: name.into(),
            embedding: Embedding::new(values.to_vec()),
        }
    }

    #[test]
    fn test_preserves_order() {
        let gallery = Gallery::new(vec![identity("b", &[1.0]), identity("a", &[2.0])], 1).unwrap();
        let names: Vec<_> = gallery.identities().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_rejects_dimension_mismatch() {
        let err = Gallery::new(vec![identity("bob", &[1.0, 2.0])], 3).unwrap_err();
        assert!(matches!(err, GalleryError::Dimension { expected: 3, actual: 2, .. }));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let err = Gallery::new(vec![identity("bob", &[1.0]), identity("bob", &[2.0])], 1).unwrap_err();
        assert!(matches!(err, GalleryError::DuplicateName(name) if name == "bob"));
    }

    #[test]
    fn test_empty_gallery_is_valid() {
        let gallery = Gallery::new(vec![], 128).unwrap();
        assert!(gallery.is_empty());
        assert!(gallery.accepts(&Embedding::new(vec![0.0; 128])));
        assert!(!gallery.accepts(&Embedding::new(vec![0.0; 127])));
    }

    #[test]
    fn test_rejects_non_finite_embeddings() {
        let err = Gallery::new(vec![identity("bob", &[1.0, f32::NAN])], 2).unwrap_err();
        assert!(matches!(err, GalleryError::NonFinite(name) if name == "bob"));

        let gallery = Gallery::new(vec![identity("bob", &[1.0, 2.0])], 2).unwrap();
        assert!(!gallery.accepts(&Embedding::new(vec![f32::NAN, 0.0])));
        assert!(!gallery.accepts(&Embedding::new(vec![0.0, f32::NEG_INFINITY])));
        assert!(gallery.accepts(&Embedding::new(vec![0.0, 0.0])));
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, r#"[{{"name": "alice", "embedding": [0.1, 0.2]}}]"#).unwrap();

        let gallery = Gallery::load_json(&path, 2).unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.identities()[0].name, "alice");
    }

    #[test]
    fn test_load_json_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(Gallery::load_json(&path, 2), Err(GalleryError::Parse { .. })));
    }
}
