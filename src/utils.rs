//! Utility functions for path derivation, URL handling and display formatting

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Derive the display/file name from a download URL
///
/// Takes the last path segment and percent-decodes it, so
/// `.../Some%20Game%20(USA).zip` becomes `Some Game (USA).zip`.
///
/// # Errors
///
/// Returns a config error when the URL does not parse or has no usable
/// final path segment.
///
/// # Examples
///
/// ```
/// use myrient_dl::utils::file_name_from_url;
///
/// let name = file_name_from_url("https://example.com/files/Demo%20Disc.iso").unwrap();
/// assert_eq!(name, "Demo Disc.iso");
/// ```
pub fn file_name_from_url(url: &str) -> Result<String> {
    let parsed = url::Url::parse(url).map_err(|e| Error::Config {
        message: format!("invalid URL '{url}': {e}"),
        key: None,
    })?;

    let last = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back().map(str::to_string))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Config {
            message: format!("URL '{url}' has no file name in its path"),
            key: None,
        })?;

    let decoded = urlencoding::decode(&last).map_err(|e| Error::Config {
        message: format!("URL '{url}' has an undecodable file name: {e}"),
        key: None,
    })?;

    Ok(decoded.into_owned())
}

/// Join a plain file name onto a base URL, percent-encoding the name
///
/// Index entries carry human-readable names with spaces and parentheses;
/// mirrors expect them percent-encoded in the request path.
///
/// # Examples
///
/// ```
/// use myrient_dl::utils::join_encoded;
///
/// let url = join_encoded("https://example.com/ps3/", "Demo Disc (USA).iso").unwrap();
/// assert_eq!(url, "https://example.com/ps3/Demo%20Disc%20%28USA%29.iso");
/// ```
pub fn join_encoded(base: &str, file_name: &str) -> Result<String> {
    let base_url = url::Url::parse(base).map_err(|e| Error::Config {
        message: format!("invalid base URL '{base}': {e}"),
        key: None,
    })?;
    let encoded = urlencoding::encode(file_name);
    let joined = base_url.join(&encoded).map_err(|e| Error::Config {
        message: format!("cannot join '{file_name}' onto '{base}': {e}"),
        key: None,
    })?;
    Ok(joined.to_string())
}

/// In-progress download path for a destination: `movie.iso` -> `movie.iso.part`
#[must_use]
pub fn part_path(destination: &Path) -> PathBuf {
    append_extension(destination, "part")
}

/// Decrypt-stage output path for an input: `movie.iso` -> `movie.iso.dec`
#[must_use]
pub fn decrypted_path(input: &Path) -> PathBuf {
    append_extension(input, "dec")
}

/// Directory that receives the split-stage output parts for a job
#[must_use]
pub fn parts_dir(work_dir: &Path) -> PathBuf {
    work_dir.join("parts")
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}

/// Format a byte count for display: `1536` -> `"1.50 KiB"`
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Format a transfer rate for display: `2097152` -> `"2.00 MiB/s"`
#[must_use]
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_size(bytes_per_sec))
}

/// Estimate time remaining from bytes left and current speed
///
/// Returns `None` when the speed is zero or the total is unknown.
#[must_use]
pub fn eta(bytes_done: u64, bytes_total: Option<u64>, speed_bps: u64) -> Option<Duration> {
    let total = bytes_total?;
    if speed_bps == 0 || bytes_done >= total {
        return None;
    }
    let remaining = total - bytes_done;
    Some(Duration::from_secs(remaining / speed_bps.max(1)))
}

/// Format a duration as `hh:mm:ss` (or `mm:ss` under an hour)
#[must_use]
pub fn format_eta(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_from_url_decodes_percent_escapes() {
        let name =
            file_name_from_url("https://example.com/ps3/Game%20Title%20%28USA%29.iso").unwrap();
        assert_eq!(name, "Game Title (USA).iso");
    }

    #[test]
    fn file_name_from_url_rejects_trailing_slash() {
        assert!(
            file_name_from_url("https://example.com/ps3/").is_err(),
            "a directory URL has no file name"
        );
    }

    #[test]
    fn file_name_from_url_rejects_garbage() {
        assert!(file_name_from_url("not a url").is_err());
    }

    #[test]
    fn join_encoded_escapes_spaces_and_parens() {
        let url = join_encoded("https://example.com/psn/", "Pack 01 (EU).pkg").unwrap();
        assert_eq!(url, "https://example.com/psn/Pack%2001%20%28EU%29.pkg");
    }

    #[test]
    fn join_then_extract_round_trips_the_name() {
        let name = "Weird & Name (v1.02).iso";
        let url = join_encoded("https://example.com/dir/", name).unwrap();
        assert_eq!(file_name_from_url(&url).unwrap(), name);
    }

    #[test]
    fn derived_paths_append_not_replace_extensions() {
        let dest = Path::new("/downloads/job/movie.iso");
        assert_eq!(part_path(dest), Path::new("/downloads/job/movie.iso.part"));
        assert_eq!(
            decrypted_path(dest),
            Path::new("/downloads/job/movie.iso.dec"),
            "the original extension must survive so the input stays identifiable"
        );
    }

    #[test]
    fn parts_dir_is_under_the_work_dir() {
        assert_eq!(
            parts_dir(Path::new("/downloads/job")),
            Path::new("/downloads/job/parts")
        );
    }

    #[test]
    fn format_size_picks_sensible_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KiB");
        assert_eq!(format_size(2 * 1024 * 1024), "2.00 MiB");
        assert_eq!(format_size(5_368_709_120), "5.00 GiB");
    }

    #[test]
    fn format_speed_appends_per_second() {
        assert_eq!(format_speed(2 * 1024 * 1024), "2.00 MiB/s");
    }

    #[test]
    fn eta_requires_known_total_and_nonzero_speed() {
        assert_eq!(eta(0, None, 1000), None);
        assert_eq!(eta(0, Some(1000), 0), None);
        assert_eq!(eta(1000, Some(1000), 500), None, "done means no ETA");
        assert_eq!(eta(0, Some(1000), 500), Some(Duration::from_secs(2)));
    }

    #[test]
    fn format_eta_switches_layout_at_one_hour() {
        assert_eq!(format_eta(Duration::from_secs(90)), "01:30");
        assert_eq!(format_eta(Duration::from_secs(3700)), "01:01:40");
    }
}
