//! Locating the file a tool actually produced.
//!
//! Download tools pick their own file names, so after a fetch the output
//! directory is scanned for the most plausible media file. The same
//! helpers resolve bare names given to transcode and upload requests.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Media file extensions recognised as artifacts (case-insensitive matching).
pub const MEDIA_EXTENSIONS: &[&str] = &[
    ".mkv", ".mp4", ".avi", ".mov", ".wmv", ".flv", ".webm", ".m4v", ".ts", ".m2ts",
];

/// Name fragments marking a file the tool is still writing.
pub const PARTIAL_MARKERS: &[&str] = &[".aria2", ".part", ".downloading", ".tmp"];

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to scan {}: {source}", .dir.display())]
    Scan {
        dir: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Result of looking for a tool's output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(PathBuf),
    /// Nothing final yet, but these in-progress files exist
    Pending(Vec<PathBuf>),
    NotFound,
}

/// A file seen while scanning the output directory.
#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    size_bytes: u64,
    age: Duration,
}

/// Checks if a file has a media extension (case-insensitive).
pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            MEDIA_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Checks if aria2c still keeps a `<file>.aria2` control file next to `path`.
pub fn has_control_file(path: &Path) -> bool {
    let mut control = path.as_os_str().to_owned();
    control.push(".aria2");
    Path::new(&control).exists()
}

/// Checks if a file name carries an in-progress marker.
pub fn is_partial_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    PARTIAL_MARKERS.iter().any(|marker| name.contains(marker))
}

/// Heuristic search of a download directory
#[derive(Debug, Clone)]
pub struct ArtifactResolver {
    /// Only files modified within this window are considered
    pub recency_window: Duration,
    /// Fallback when no media file exists: any file at least this large...
    pub last_resort_min_bytes: u64,
    /// ...and at most this old
    pub last_resort_max_age: Duration,
}

impl Default for ArtifactResolver {
    fn default() -> Self {
        Self {
            recency_window: Duration::from_secs(3 * 3600),
            last_resort_min_bytes: 10 * 1024 * 1024,
            last_resort_max_age: Duration::from_secs(2 * 3600),
        }
    }
}

impl ArtifactResolver {
    pub fn with_recency_window(recency_window: Duration) -> Self {
        Self {
            recency_window,
            ..Self::default()
        }
    }

    /// Find the artifact in `dir`, renaming it to `desired_name` (keeping its
    /// extension) when one is given.
    ///
    /// In order:
    /// - the largest recent media file, ties broken by name; older media
    ///   files only when nothing recent exists
    /// - any in-progress file makes the result `Pending`
    /// - the largest recent file above the last-resort size
    pub fn resolve(&self, dir: &Path, desired_name: Option<&str>) -> Result<Resolution, ArtifactError> {
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "output directory does not exist");
            return Ok(Resolution::NotFound);
        }

        let now = SystemTime::now();
        let mut media = Vec::new();
        let mut stale = Vec::new();
        let mut partial = Vec::new();
        let mut others = Vec::new();

        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|source| ArtifactError::Scan {
                dir: dir.to_path_buf(),
                source,
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or(Duration::ZERO);
            let candidate = Candidate {
                path: entry.into_path(),
                size_bytes: metadata.len(),
                age,
            };

            if is_partial_file(&candidate.path) {
                partial.push(candidate.path);
            } else if has_control_file(&candidate.path) {
                // preallocated under its final name; the sidecar marks it pending
                continue;
            } else if is_media_file(&candidate.path) {
                if candidate.age <= self.recency_window {
                    media.push(candidate);
                } else {
                    stale.push(candidate);
                }
            } else {
                others.push(candidate);
            }
        }

        if let Some(best) = largest(media).or_else(|| largest(stale)) {
            debug!(path = %best.path.display(), size = best.size_bytes, "artifact found");
            return Ok(Resolution::Found(rename_to(&best.path, desired_name)));
        }

        if !partial.is_empty() {
            partial.sort();
            debug!(count = partial.len(), "only in-progress files present");
            return Ok(Resolution::Pending(partial));
        }

        let fallback = others.into_iter().filter(|c| {
            c.size_bytes > self.last_resort_min_bytes && c.age <= self.last_resort_max_age
        });
        if let Some(best) = largest(fallback) {
            warn!(path = %best.path.display(), "no media file found, using largest recent file");
            return Ok(Resolution::Found(rename_to(&best.path, desired_name)));
        }

        Ok(Resolution::NotFound)
    }
}

fn largest(candidates: impl IntoIterator<Item = Candidate>) -> Option<Candidate> {
    candidates.into_iter().max_by(|a, b| {
        a.size_bytes
            .cmp(&b.size_bytes)
            .then_with(|| b.path.cmp(&a.path))
    })
}

/// Rename `path` to `desired_name` plus its original extension.
///
/// An existing file at the destination is replaced. Any failure leaves the
/// file where it is and returns the original path.
pub fn rename_to(path: &Path, desired_name: Option<&str>) -> PathBuf {
    let Some(name) = desired_name.map(str::trim).filter(|n| !n.is_empty()) else {
        return path.to_path_buf();
    };
    if !is_plain_file_name(name) {
        warn!(name, "desired name is not a plain file name, keeping original name");
        return path.to_path_buf();
    }
    let file_name = match path.extension() {
        Some(ext) => format!("{}.{}", name, ext.to_string_lossy()),
        None => name.to_string(),
    };
    let target = path.with_file_name(file_name);
    if target == path {
        return target;
    }

    if target.exists() {
        if let Err(e) = fs::remove_file(&target) {
            warn!(target = %target.display(), error = %e, "could not replace existing file, keeping original name");
            return path.to_path_buf();
        }
    }
    match fs::rename(path, &target) {
        Ok(()) => {
            info!(from = %path.display(), to = %target.display(), "renamed artifact");
            target
        }
        Err(e) => {
            warn!(from = %path.display(), error = %e, "rename failed, keeping original name");
            path.to_path_buf()
        }
    }
}

/// A single path component: no separators, not `.` or `..`
fn is_plain_file_name(name: &str) -> bool {
    !name.contains(['/', '\\', '\0']) && name != "." && name != ".."
}

/// Resolve a transcode input given as a path or a bare name.
///
/// Tries the name as given, then each search directory with the name and
/// with every media extension appended.
pub fn locate_media(name: &str, search_dirs: &[PathBuf]) -> Option<PathBuf> {
    let direct = PathBuf::from(name);
    if direct.is_file() {
        return Some(direct);
    }
    for dir in search_dirs {
        let exact = dir.join(name);
        if exact.is_file() {
            return Some(exact);
        }
        for ext in MEDIA_EXTENSIONS {
            let candidate = dir.join(format!("{}{}", name, ext));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Resolve an upload source in `dir`.
///
/// An exact `name.ext` match wins; otherwise the smallest media file whose
/// name contains `name` is used.
pub fn find_upload_source(dir: &Path, name: &str) -> Option<PathBuf> {
    let direct = PathBuf::from(name);
    if direct.is_file() {
        return Some(direct);
    }
    let exact = dir.join(name);
    if exact.is_file() {
        return Some(exact);
    }
    for ext in MEDIA_EXTENSIONS {
        let candidate = dir.join(format!("{}{}", name, ext));
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    let needle = name.to_lowercase();
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| is_media_file(e.path()) && !is_partial_file(e.path()))
        .filter(|e| e.file_name().to_string_lossy().to_lowercase().contains(&needle))
        .filter_map(|e| {
            let size = e.metadata().ok()?.len();
            Some((size, e.into_path()))
        })
        .min()
        .map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, size: u64) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        file.set_len(size).unwrap();
        path
    }

    fn age_file(path: &Path, age: Duration) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn test_is_media_file() {
        assert!(is_media_file(Path::new("a/Episode.MKV")));
        assert!(is_media_file(Path::new("clip.webm")));
        assert!(!is_media_file(Path::new("notes.txt")));
        assert!(!is_media_file(Path::new("noext")));
    }

    #[test]
    fn test_largest_media_file_renamed() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "X.mp4", 50 * 1024 * 1024);
        write_file(tmp.path(), "Y.tmp.part", 10 * 1024 * 1024);
        write_file(tmp.path(), "small.mkv", 1024);

        let resolution = ArtifactResolver::default()
            .resolve(tmp.path(), Some("episode"))
            .unwrap();

        assert_eq!(resolution, Resolution::Found(tmp.path().join("episode.mp4")));
        assert!(!tmp.path().join("X.mp4").exists());
    }

    #[test]
    fn test_only_partial_files_is_pending() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "movie.mkv.aria2", 1024);
        write_file(tmp.path(), "movie.mkv.part", 5 * 1024 * 1024);

        let resolution = ArtifactResolver::default()
            .resolve(tmp.path(), Some("episode"))
            .unwrap();

        let Resolution::Pending(markers) = resolution else {
            panic!("expected pending, got {:?}", resolution);
        };
        assert_eq!(markers.len(), 2);
    }

    #[test]
    fn test_recent_media_beats_larger_old_file() {
        let tmp = TempDir::new().unwrap();
        let old = write_file(tmp.path(), "old.mkv", 8192);
        age_file(&old, Duration::from_secs(5 * 3600));
        let fresh = write_file(tmp.path(), "fresh.mp4", 4096);

        let resolution = ArtifactResolver::default().resolve(tmp.path(), None).unwrap();
        assert_eq!(resolution, Resolution::Found(fresh.clone()));

        std::fs::remove_file(&fresh).unwrap();
        let resolution = ArtifactResolver::default().resolve(tmp.path(), None).unwrap();
        assert_eq!(resolution, Resolution::Found(old));
    }

    #[test]
    fn test_last_resort_picks_large_unknown_file() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "download.bin", 20 * 1024 * 1024);
        write_file(tmp.path(), "readme.txt", 100);

        let resolution = ArtifactResolver::default().resolve(tmp.path(), None).unwrap();

        assert_eq!(resolution, Resolution::Found(tmp.path().join("download.bin")));
    }

    #[test]
    fn test_equal_sizes_pick_first_name() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "b.mkv", 2048);
        write_file(tmp.path(), "a.mkv", 2048);

        let resolution = ArtifactResolver::default().resolve(tmp.path(), None).unwrap();

        assert_eq!(resolution, Resolution::Found(tmp.path().join("a.mkv")));
    }

    #[test]
    fn test_missing_directory_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let resolution = ArtifactResolver::default()
            .resolve(&tmp.path().join("nope"), None)
            .unwrap();
        assert_eq!(resolution, Resolution::NotFound);
    }

    #[test]
    fn test_rename_replaces_existing_destination() {
        let tmp = TempDir::new().unwrap();
        let src = write_file(tmp.path(), "raw.mkv", 300);
        write_file(tmp.path(), "episode.mkv", 10);

        let renamed = rename_to(&src, Some("episode"));

        assert_eq!(renamed, tmp.path().join("episode.mkv"));
        assert_eq!(fs::metadata(&renamed).unwrap().len(), 300);
    }

    #[test]
    fn test_rename_refuses_names_leaving_the_directory() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        fs::create_dir(&out).unwrap();
        let src = write_file(&out, "raw.mkv", 300);
        let outside = write_file(tmp.path(), "keep.mkv", 10);

        assert_eq!(rename_to(&src, Some("../keep")), src);
        assert_eq!(rename_to(&src, Some("sub/name")), src);
        assert_eq!(rename_to(&src, Some("..")), src);
        assert_eq!(fs::metadata(&outside).unwrap().len(), 10);
        assert!(src.exists());
    }

    #[test]
    fn test_media_with_control_file_is_pending() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "movie.mkv", 8192);
        let control = write_file(tmp.path(), "movie.mkv.aria2", 64);

        let resolution = ArtifactResolver::default()
            .resolve(tmp.path(), Some("episode"))
            .unwrap();

        assert_eq!(resolution, Resolution::Pending(vec![control]));
        assert!(tmp.path().join("movie.mkv").exists());
    }

    #[test]
    fn test_rename_without_name_keeps_path() {
        let tmp = TempDir::new().unwrap();
        let src = write_file(tmp.path(), "raw.mkv", 300);
        assert_eq!(rename_to(&src, None), src);
        assert_eq!(rename_to(&src, Some("  ")), src);
    }

    #[test]
    fn test_locate_media_appends_extensions() {
        let tmp = TempDir::new().unwrap();
        let path = write_file(tmp.path(), "intro.mp4", 10);
        let dirs = vec![tmp.path().join("missing"), tmp.path().to_path_buf()];

        assert_eq!(locate_media("intro", &dirs), Some(path));
        assert_eq!(locate_media("outro", &dirs), None);
    }

    #[test]
    fn test_upload_source_prefers_exact_then_smallest_match() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "show_ep1_full.mp4", 5000);
        let small = write_file(tmp.path(), "show_ep1_lite.mp4", 100);

        assert_eq!(find_upload_source(tmp.path(), "ep1"), Some(small));

        let exact = write_file(tmp.path(), "ep1.mkv", 9000);
        assert_eq!(find_upload_source(tmp.path(), "ep1"), Some(exact));
        assert_eq!(find_upload_source(tmp.path(), "ep2"), None);
    }
}
