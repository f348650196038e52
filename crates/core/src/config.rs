use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub video_extensions: Vec<String>,
    pub image_extensions: Vec<String>,
    /// Well-known cover file stems, in priority order.
    pub cover_names: Vec<String>,
    pub probe_timeout_ms: u64,
    pub probe_concurrency: usize,
    pub walk_concurrency: usize,
    pub ffprobe_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            video_extensions: ["mp4", "avi", "mkv", "mov", "wmv", "flv", "webm", "m4v", "3gp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            image_extensions: ["jpg", "jpeg", "png", "bmp", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            cover_names: ["cover", "folder", "poster"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            probe_timeout_ms: 8_000,
            probe_concurrency: 3,
            walk_concurrency: 4,
            ffprobe_path: PathBuf::from("ffprobe"),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| Error::from_io(path, e))?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }

    pub fn is_video(&self, path: &Path) -> bool {
        has_extension(path, &self.video_extensions)
    }

    pub fn is_image(&self, path: &Path) -> bool {
        has_extension(path, &self.image_extensions)
    }
}

fn has_extension(path: &Path, allowed: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| allowed.iter().any(|a| a.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_extensions_case_insensitively() {
        let config = EngineConfig::default();
        assert!(config.is_video(Path::new("movie.MKV")));
        assert!(config.is_video(Path::new("/a/b/clip.mp4")));
        assert!(!config.is_video(Path::new("cover.jpg")));
        assert!(!config.is_video(Path::new("no_extension")));
        assert!(config.is_image(Path::new("Poster.JPEG")));
        assert!(!config.is_image(Path::new("notes.txt")));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = EngineConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.probe_concurrency, 3);
        assert_eq!(config.probe_timeout(), Duration::from_secs(8));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "probe_concurrency = 2\nvideo_extensions = [\"mp4\"]\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.probe_concurrency, 2);
        assert_eq!(config.video_extensions, vec!["mp4".to_string()]);
        assert_eq!(config.walk_concurrency, 4);
        assert!(!config.is_video(Path::new("a.mkv")));
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "probe_concurrency = \"many\"").unwrap();

        assert!(matches!(EngineConfig::load(&path), Err(Error::Config(_))));
    }
}
