//! Reference videos addressed by an opaque identifier (their file name).

use crate::error::Error;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "mov", "avi", "gif"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceEntry {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ReferenceRegistry {
    dir: PathBuf,
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| {
            VIDEO_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

impl ReferenceRegistry {
    pub fn open<P>(dir: P) -> Result<Self, Error>
    where
        P: Into<PathBuf>,
    {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(Error::MissingInput(dir));
        }
        Ok(Self { dir })
    }

    /// Every video in the directory, sorted by id.
    pub fn list(&self) -> Result<Vec<ReferenceEntry>, Error> {
        let read_dir =
            std::fs::read_dir(&self.dir).map_err(|e| Error::ListReferences(e, self.dir.clone()))?;
        let mut entries = Vec::new();
        for entry in read_dir {
            let path = entry
                .map_err(|e| Error::ListReferences(e, self.dir.clone()))?
                .path();
            if !path.is_file() || !is_video(&path) {
                continue;
            }
            if let Some(id) = path.file_name().and_then(|n| n.to_str()) {
                entries.push(ReferenceEntry {
                    id: id.to_owned(),
                    path: path.clone(),
                });
            }
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    pub fn resolve(&self, id: &str) -> Result<PathBuf, Error> {
        if id.is_empty()
            || id.contains(|c| c == '/' || c == '\\')
            || id == "."
            || id == ".."
        {
            return Err(Error::InvalidReferenceId(id.to_owned()));
        }
        let path = self.dir.join(id);
        if path.is_file() && is_video(&path) {
            debug!(id, path = %path.display(), "resolved reference");
            Ok(path)
        } else {
            Err(Error::ReferenceNotFound(id.to_owned()))
        }
    }
}

/// Check an uploaded file before any job is started for it.
pub fn validate_upload(path: &Path) -> Result<(), Error> {
    if !is_video(path) {
        return Err(Error::UnsupportedFormat(path.to_owned()));
    }
    if !path.is_file() {
        return Err(Error::MissingInput(path.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{validate_upload, ReferenceRegistry};
    use crate::error::Error;

    fn registry() -> (tempfile::TempDir, ReferenceRegistry) {
        let dir = tempfile::tempdir().unwrap();
        for name in ["squat.mp4", "lunge.GIF", "notes.txt", "arms.mov"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.mp4")).unwrap();
        let registry = ReferenceRegistry::open(dir.path()).unwrap();
        (dir, registry)
    }

    #[test]
    fn lists_videos_sorted() {
        let (_dir, registry) = registry();
        let ids: Vec<_> = registry.list().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["arms.mov", "lunge.GIF", "squat.mp4"]);
    }

    #[test]
    fn resolves_known_and_rejects_unknown() {
        let (dir, registry) = registry();
        assert_eq!(
            registry.resolve("squat.mp4").unwrap(),
            dir.path().join("squat.mp4")
        );
        assert!(matches!(
            registry.resolve("missing.mp4"),
            Err(Error::ReferenceNotFound(_))
        ));
        assert!(matches!(
            registry.resolve("notes.txt"),
            Err(Error::ReferenceNotFound(_))
        ));
        assert!(matches!(
            registry.resolve("../squat.mp4"),
            Err(Error::InvalidReferenceId(_))
        ));
        assert!(matches!(
            registry.resolve(".."),
            Err(Error::InvalidReferenceId(_))
        ));
    }

    #[test]
    fn validates_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("clip.MOV");
        std::fs::write(&video, b"x").unwrap();
        assert!(validate_upload(&video).is_ok());
        assert!(matches!(
            validate_upload(&dir.path().join("clip.mkv")),
            Err(Error::UnsupportedFormat(_))
        ));
        assert!(matches!(
            validate_upload(&dir.path().join("gone.mp4")),
            Err(Error::MissingInput(_))
        ));
    }

    #[test]
    fn missing_directory_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ReferenceRegistry::open(dir.path().join("nope")).is_err());
    }
}
