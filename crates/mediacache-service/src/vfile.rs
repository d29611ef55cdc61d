//! Uniform access to files that live either on the local filesystem or behind an opaque content
//! locator.
//!
//! A [`VirtualFile`] hides which of the two backends is in play. Content locators are resolved
//! through a [`ContentAccess`] capability that is handed in by whoever owns the platform
//! specific resolver. That capability may be revoked at any time, after which every operation
//! on the content backend fails with [`io::ErrorKind::PermissionDenied`].

use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use percent_encoding::percent_decode_str;
use url::Url;

/// How a raw descriptor should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    /// Create or truncate.
    Write,
    /// Create or append.
    Append,
}

impl AccessMode {
    fn open_options(self) -> fs::OpenOptions {
        let mut options = fs::OpenOptions::new();
        match self {
            AccessMode::Read => options.read(true),
            AccessMode::Write => options.write(true).create(true).truncate(true),
            AccessMode::Append => options.append(true).create(true),
        };
        options
    }
}

/// A capability resolving opaque content locators to byte streams.
pub trait ContentAccess: Send + Sync + fmt::Debug {
    fn open_read(&self, locator: &str) -> io::Result<Box<dyn Read + Send>>;

    fn open_write(&self, locator: &str, append: bool) -> io::Result<Box<dyn Write + Send>>;

    fn open_descriptor(&self, locator: &str, mode: AccessMode) -> io::Result<fs::File>;

    fn delete(&self, locator: &str) -> io::Result<()>;

    /// Whether the capability can still be used.
    fn is_valid(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub enum VirtualFile {
    Path(PathBuf),
    Content {
        locator: String,
        access: Arc<dyn ContentAccess>,
    },
}

impl VirtualFile {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        VirtualFile::Path(path.into())
    }

    pub fn from_content(locator: impl Into<String>, access: Arc<dyn ContentAccess>) -> Self {
        VirtualFile::Content {
            locator: locator.into(),
            access,
        }
    }

    /// The local path, if this file lives on the filesystem.
    pub fn path(&self) -> Option<&Path> {
        match self {
            VirtualFile::Path(path) => Some(path),
            VirtualFile::Content { .. } => None,
        }
    }

    /// The canonical locator of this file.
    ///
    /// Paths are rendered as `file://` URLs, content locators are returned unchanged.
    pub fn locator(&self) -> String {
        match self {
            VirtualFile::Path(path) => {
                let absolute = std::path::absolute(path).unwrap_or_else(|_| path.clone());
                match Url::from_file_path(&absolute) {
                    Ok(url) => url.into(),
                    Err(()) => format!("file://{}", absolute.display()),
                }
            }
            VirtualFile::Content { locator, .. } => locator.clone(),
        }
    }

    pub fn open_read(&self) -> io::Result<Box<dyn Read + Send>> {
        match self {
            VirtualFile::Path(path) => Ok(Box::new(fs::File::open(path)?)),
            VirtualFile::Content { locator, access } => checked(access)?.open_read(locator),
        }
    }

    pub fn open_write(&self, append: bool) -> io::Result<Box<dyn Write + Send>> {
        match self {
            VirtualFile::Path(path) => {
                let mode = if append {
                    AccessMode::Append
                } else {
                    AccessMode::Write
                };
                Ok(Box::new(mode.open_options().open(path)?))
            }
            VirtualFile::Content { locator, access } => {
                checked(access)?.open_write(locator, append)
            }
        }
    }

    pub fn open_descriptor(&self, mode: AccessMode) -> io::Result<fs::File> {
        match self {
            VirtualFile::Path(path) => mode.open_options().open(path),
            VirtualFile::Content { locator, access } => {
                checked(access)?.open_descriptor(locator, mode)
            }
        }
    }

    /// Opens a reader, hands it to `f`, and closes it again.
    pub fn with_reader<T>(&self, f: impl FnOnce(&mut dyn Read) -> io::Result<T>) -> io::Result<T> {
        let mut reader = self.open_read()?;
        f(&mut reader)
    }

    /// Opens a writer, hands it to `f`, then flushes and closes it.
    pub fn with_writer<T>(
        &self,
        append: bool,
        f: impl FnOnce(&mut dyn Write) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut writer = self.open_write(append)?;
        let result = f(&mut writer)?;
        writer.flush()?;
        Ok(result)
    }

    pub fn delete(&self) -> io::Result<()> {
        match self {
            VirtualFile::Path(path) => fs::remove_file(path),
            VirtualFile::Content { locator, access } => checked(access)?.delete(locator),
        }
    }

    /// Deletes the file, reporting but never returning errors.
    ///
    /// Failures are logged at `debug` level when `silent` is set and at `error` level otherwise.
    pub fn safe_delete(&self, silent: bool) -> bool {
        match self.delete() {
            Ok(()) => true,
            Err(error) if silent => {
                tracing::debug!(
                    error = &error as &dyn std::error::Error,
                    file = ?self,
                    "failed to delete file"
                );
                false
            }
            Err(error) => {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    file = ?self,
                    "failed to delete file"
                );
                false
            }
        }
    }
}

fn checked(access: &Arc<dyn ContentAccess>) -> io::Result<&dyn ContentAccess> {
    if access.is_valid() {
        Ok(access.as_ref())
    } else {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "content access has been revoked",
        ))
    }
}

impl fmt::Debug for VirtualFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtualFile::Path(path) => f.debug_tuple("Path").field(path).finish(),
            VirtualFile::Content { locator, .. } => f.debug_tuple("Content").field(locator).finish(),
        }
    }
}

/// Resolves content locators to files below a root directory.
///
/// A locator `content://media/clip.mp4` maps to `<root>/media/clip.mp4`, ignoring the scheme.
/// Locators escaping the root are rejected. Access can be revoked, after which every operation
/// fails.
#[derive(Debug)]
pub struct DirectoryContentAccess {
    root: PathBuf,
    valid: AtomicBool,
}

impl DirectoryContentAccess {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            valid: AtomicBool::new(true),
        }
    }

    /// Invalidates this capability.
    pub fn revoke(&self) {
        self.valid.store(false, Ordering::Release);
    }

    fn resolve(&self, locator: &str) -> io::Result<PathBuf> {
        let url = Url::parse(locator)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut path = self.root.clone();
        let segments = url
            .host_str()
            .into_iter()
            .chain(url.path_segments().into_iter().flatten())
            .filter(|segment| !segment.is_empty());
        for segment in segments {
            let segment = percent_decode_str(segment)
                .decode_utf8()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            // decoded separators would smuggle in extra components
            let is_normal = !segment.contains(['/', '\\'])
                && Path::new(&*segment)
                    .components()
                    .all(|component| matches!(component, Component::Normal(_)));
            if !is_normal {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("`{locator}` escapes the content root"),
                ));
            }
            path.push(&*segment);
        }
        Ok(path)
    }
}

impl ContentAccess for DirectoryContentAccess {
    fn open_read(&self, locator: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(self.resolve(locator)?)?))
    }

    fn open_write(&self, locator: &str, append: bool) -> io::Result<Box<dyn Write + Send>> {
        let mode = if append {
            AccessMode::Append
        } else {
            AccessMode::Write
        };
        Ok(Box::new(self.open_descriptor(locator, mode)?))
    }

    fn open_descriptor(&self, locator: &str, mode: AccessMode) -> io::Result<fs::File> {
        mode.open_options().open(self.resolve(locator)?)
    }

    fn delete(&self, locator: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(locator)?)
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
}

impl From<PathBuf> for VirtualFile {
    fn from(path: PathBuf) -> Self {
        VirtualFile::Path(path)
    }
}
