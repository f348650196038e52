use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// File a user may drop at a volume's top level to pin its key across remounts.
pub const VOLUME_MARKER_FILE: &str = ".videovault.volume-id";

/// Identifies the storage volume holding a path. Only used to partition caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeKey(String);

impl VolumeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A path with separators unified, so textually different spellings of the
/// same entry compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CanonicalPath(String);

impl CanonicalPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_path_buf(&self) -> PathBuf {
        PathBuf::from(&self.0)
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn normalize(path: &Path) -> CanonicalPath {
    let raw = path.to_string_lossy().replace('\\', "/");
    let absolute = raw.starts_with('/');
    let segments: Vec<&str> = raw
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect();

    let mut out = String::with_capacity(raw.len());
    if absolute {
        out.push('/');
    }
    out.push_str(&segments.join("/"));
    if out.is_empty() {
        out.push('.');
    }
    CanonicalPath(out)
}

pub fn volume_key(path: &Path) -> Result<VolumeKey> {
    let md = fs::metadata(path).map_err(|e| Error::from_io(path, e))?;

    let marker_dir = if md.is_dir() {
        Some(path)
    } else {
        path.parent()
    };
    if let Some(dir) = marker_dir {
        if let Ok(data) = fs::read_to_string(dir.join(VOLUME_MARKER_FILE)) {
            let id = data.trim();
            if !id.is_empty() {
                return Ok(VolumeKey(format!("custom:{id}")));
            }
        }
    }

    system_volume_key(path, &md)
}

#[cfg(target_os = "linux")]
fn system_volume_key(path: &Path, md: &fs::Metadata) -> Result<VolumeKey> {
    use std::os::unix::fs::MetadataExt;

    match linux::filesystem_uuid(path) {
        Some(uuid) => Ok(VolumeKey(format!("uuid:{uuid}"))),
        None => {
            debug!(path = %path.display(), "no filesystem uuid, falling back to device id");
            Ok(VolumeKey(format!("unix:{}", md.dev())))
        }
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn system_volume_key(path: &Path, md: &fs::Metadata) -> Result<VolumeKey> {
    use std::os::unix::fs::MetadataExt;

    debug!(path = %path.display(), "using device id as volume key");
    Ok(VolumeKey(format!("unix:{}", md.dev())))
}

#[cfg(windows)]
fn system_volume_key(path: &Path, _md: &fs::Metadata) -> Result<VolumeKey> {
    use std::path::{Component, Prefix};

    let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    for comp in canonical.components() {
        if let Component::Prefix(prefix) = comp {
            return Ok(match prefix.kind() {
                Prefix::Disk(letter) | Prefix::VerbatimDisk(letter) => {
                    VolumeKey(format!("win:{}", letter.to_ascii_uppercase() as char))
                }
                _ => VolumeKey(format!(
                    "win:{}",
                    normalize(Path::new(prefix.as_os_str())).as_str().to_ascii_lowercase()
                )),
            });
        }
    }
    debug!(path = %path.display(), "no drive prefix found");
    Ok(VolumeKey("win:?".to_string()))
}

#[cfg(not(any(unix, windows)))]
fn system_volume_key(path: &Path, _md: &fs::Metadata) -> Result<VolumeKey> {
    debug!(path = %path.display(), "volume identity unsupported on this platform");
    Ok(VolumeKey("local".to_string()))
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs;
    use std::path::{Path, PathBuf};

    const MOUNT_TABLE: &str = "/proc/self/mountinfo";
    const UUID_LINKS: &str = "/dev/disk/by-uuid";

    /// UUID of the filesystem holding `path`, when it sits on a block device.
    pub fn filesystem_uuid(path: &Path) -> Option<String> {
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let table = fs::read_to_string(MOUNT_TABLE).ok()?;
        let device = backing_device(&table, &canonical)?;
        uuid_of_device(&device, Path::new(UUID_LINKS))
    }

    /// Block device behind the deepest mount containing `path`. Later entries
    /// for the same mount point shadow earlier ones.
    fn backing_device(table: &str, path: &Path) -> Option<PathBuf> {
        let (_, source) = table
            .lines()
            .filter_map(mount_entry)
            .filter(|(mount_point, _)| path.starts_with(mount_point))
            .max_by_key(|(mount_point, _)| mount_point.components().count())?;
        let source = source.filter(|s| s.starts_with("/dev"))?;
        Some(fs::canonicalize(&source).unwrap_or(source))
    }

    /// `(mount point, source)` of one mountinfo line: the mount point is the
    /// fifth field, the source follows the filesystem type after ` - `.
    fn mount_entry(line: &str) -> Option<(PathBuf, Option<PathBuf>)> {
        let (mount_fields, fs_fields) = line.split_once(" - ")?;
        let mount_point = mount_fields.split_whitespace().nth(4)?;
        let source = fs_fields
            .split_whitespace()
            .nth(1)
            .map(|s| PathBuf::from(decode_octal(s)));
        Some((PathBuf::from(decode_octal(mount_point)), source))
    }

    /// Mountinfo writes space, tab, newline and backslash as `\ooo`.
    fn decode_octal(field: &str) -> String {
        let mut out = String::with_capacity(field.len());
        let mut rest = field;
        while let Some(idx) = rest.find('\\') {
            out.push_str(&rest[..idx]);
            let code = rest
                .get(idx + 1..idx + 4)
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            match code {
                Some(byte) => {
                    out.push(char::from(byte));
                    rest = &rest[idx + 4..];
                }
                None => {
                    out.push('\\');
                    rest = &rest[idx + 1..];
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn uuid_of_device(device: &Path, links: &Path) -> Option<String> {
        fs::read_dir(links).ok()?.flatten().find_map(|entry| {
            let target = fs::canonicalize(entry.path()).ok()?;
            (target == device).then(|| entry.file_name().to_string_lossy().into_owned())
        })
    }

}
