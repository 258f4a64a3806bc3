//! Directory-backed media library
//!
//! Treats every image or video file under a root directory as a media item.
//! Item ids are the file's path relative to the root, joined with `/`, so
//! they stay stable across runs and platforms.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    media::{
        ContentSource, MediaContent, MediaCursor, MediaEntry, MediaId, MediaMetadata, MediaSource,
    },
};
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const MEDIA_TYPES: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("heic", "image/heic"),
    ("heif", "image/heif"),
    ("dng", "image/x-adobe-dng"),
    ("mp4", "video/mp4"),
    ("m4v", "video/x-m4v"),
    ("mov", "video/quicktime"),
    ("3gp", "video/3gpp"),
    ("webm", "video/webm"),
    ("mkv", "video/x-matroska"),
];

fn mime_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    MEDIA_TYPES
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, mime)| *mime)
}

fn relative_id(root: &Path, path: &Path) -> Option<MediaId> {
    let relative = path.strip_prefix(root).ok()?;
    let segments: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if segments.is_empty() {
        return None;
    }
    Some(MediaId::new(segments.join("/")))
}

/// Media library rooted at a directory.
#[derive(Debug, Clone)]
pub struct DirectoryMediaSource {
    root: PathBuf,
}

impl DirectoryMediaSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The user's pictures directory, if the platform defines one.
    pub fn default_root() -> Option<PathBuf> {
        dirs::picture_dir()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an id back to a path under the root, refusing anything that
    /// would escape it.
    fn resolve(&self, id: &MediaId) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in id.as_str().split('/') {
            let mut components = Path::new(segment).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(part)), None) => path.push(part),
                _ => {
                    return Err(BridgeError::NotFound(format!(
                        "media id {} does not name a file under the library root",
                        id
                    )))
                }
            }
        }
        Ok(path)
    }
}

#[async_trait]
impl MediaSource for DirectoryMediaSource {
    async fn enumerate(&self) -> Result<Box<dyn MediaCursor>> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            BridgeError::NotAvailable(format!(
                "media root {} is not readable: {}",
                self.root.display(),
                e
            ))
        })?;
        if !metadata.is_dir() {
            return Err(BridgeError::NotAvailable(format!(
                "media root {} is not a directory",
                self.root.display()
            )));
        }

        debug!(root = ?self.root, "Starting directory enumeration");
        Ok(Box::new(DirectoryCursor {
            root: self.root.clone(),
            pending_dirs: vec![self.root.clone()],
            current: None,
        }))
    }
}

#[async_trait]
impl ContentSource for DirectoryMediaSource {
    async fn open_stream(&self, id: &MediaId) -> Result<MediaContent> {
        let path = self.resolve(id)?;
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BridgeError::NotFound(format!("media item {} no longer exists", id)))
            }
            Err(e) => return Err(BridgeError::Io(e)),
        };
        let length = file.metadata().await.ok().map(|m| m.len());
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.to_string());
        let mime_type = mime_for(&path).unwrap_or("application/octet-stream");

        debug!(item_id = %id, ?length, "Opened media item for reading");
        Ok(MediaContent {
            reader: Box::new(file),
            file_name,
            mime_type: mime_type.to_string(),
            length,
        })
    }
}

/// Depth-first walk that reads one directory handle at a time.
struct DirectoryCursor {
    root: PathBuf,
    pending_dirs: Vec<PathBuf>,
    current: Option<fs::ReadDir>,
}

impl DirectoryCursor {
    fn entry_for(&self, path: &Path, metadata: &std::fs::Metadata) -> Option<MediaEntry> {
        let mime = mime_for(path)?;
        let id = relative_id(&self.root, path)?;
        let created_at = metadata
            .created()
            .or_else(|_| metadata.modified())
            .ok()
            .map(DateTime::<Utc>::from);

        Some(MediaEntry::new(id).with_metadata(MediaMetadata {
            display_name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
            mime_type: Some(mime.to_string()),
            size: Some(metadata.len()),
            created_at,
        }))
    }
}

#[async_trait]
impl MediaCursor for DirectoryCursor {
    async fn next(&mut self) -> Result<Option<MediaEntry>> {
        loop {
            let read_dir = match self.current.as_mut() {
                Some(read_dir) => read_dir,
                None => match self.pending_dirs.pop() {
                    Some(dir) => {
                        match fs::read_dir(&dir).await {
                            Ok(read_dir) => self.current = Some(read_dir),
                            Err(e) if dir == self.root => return Err(e.into()),
                            Err(e) => {
                                warn!(path = ?dir, error = %e, "Skipping unreadable directory");
                            }
                        }
                        continue;
                    }
                    None => return Ok(None),
                },
            };

            let entry = match read_dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.current = None;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Directory listing failed midway, skipping the rest");
                    self.current = None;
                    continue;
                }
            };

            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = ?path, error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            if metadata.is_dir() {
                self.pending_dirs.push(path);
            } else if metadata.is_file() {
                if let Some(media) = self.entry_for(&path, &metadata) {
                    return Ok(Some(media));
                }
            }
        }
    }
}
