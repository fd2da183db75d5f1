use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub mod dates;

pub use dates::{parse_event_date, parse_event_date_with_year, parse_event_time};

/// Instagram media kinds, numbered the way the API reports them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    Photo,
    Video,
    Album,
}

impl MediaType {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(MediaType::Photo),
            2 => Some(MediaType::Video),
            8 => Some(MediaType::Album),
            _ => None,
        }
    }

    pub fn code(&self) -> u64 {
        match self {
            MediaType::Photo => 1,
            MediaType::Video => 2,
            MediaType::Album => 8,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MediaType::Photo => "photo",
            MediaType::Video => "video",
            MediaType::Album => "album",
        }
    }
}

/// File extensions recognised as downloaded photos
pub const PHOTO_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// A photo on disk, named `<username>_<media id>.<ext>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedPhoto {
    pub path: PathBuf,
}

impl DownloadedPhoto {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Whether `path` looks like a downloaded photo (by extension)
    pub fn is_photo(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                PHOTO_EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
    }

    /// Name of the photo without the trailing media id.
    ///
    /// Usernames may contain underscores, so only the last segment is dropped.
    pub fn name(&self) -> String {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match file_name.rsplit_once('_') {
            Some((name, _)) => name.to_string(),
            None => String::new(),
        }
    }

    /// Media id, taken from the file stem after the last underscore
    pub fn id(&self) -> String {
        let stem = self
            .path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match stem.rsplit_once('_') {
            Some((_, id)) => id.to_string(),
            None => stem,
        }
    }

    /// Path of the JSON metadata written next to the photo
    pub fn sidecar_path(&self) -> PathBuf {
        self.path.with_extension("json")
    }
}

/// Post metadata stored as a sidecar next to each downloaded photo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostMetadata {
    pub pk: String,
    pub username: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub taken_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// An event extracted from a post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Photo the event was read from
    pub source: PathBuf,
    /// Text handed to the language model
    pub original_text: String,
    pub title: Option<String>,
    /// Time of day as written by the model, e.g. "19:30" or "20 Uhr"
    pub time: Option<String>,
    pub location: Option<String>,
    pub date: Option<NaiveDateTime>,
}

impl Event {
    /// Event with nothing but its origin, used when extraction fails
    pub fn unresolved(source: impl Into<PathBuf>, original_text: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            original_text: original_text.into(),
            title: None,
            time: None,
            location: None,
            date: None,
        }
    }

    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or("(untitled)")
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_title())?;
        match self.date {
            Some(date) => write!(f, " on {}", date.format("%Y-%m-%d"))?,
            None => write!(f, " (no date)")?,
        }
        if let Some(time) = &self.time {
            write!(f, " at {}", time)?;
        }
        if let Some(location) = &self.location {
            write!(f, " @ {}", location)?;
        }
        write!(f, " [{}]", self.source.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_photo_name_and_id() {
        let photo = DownloadedPhoto::new("/tmp/new_photos/club_name_3141592653.jpg");
        assert_eq!(photo.name(), "club_name");
        assert_eq!(photo.id(), "3141592653");
    }

    #[test]
    fn test_photo_without_underscore() {
        let photo = DownloadedPhoto::new("/tmp/12345.jpg");
        assert_eq!(photo.name(), "");
        assert_eq!(photo.id(), "12345");
    }

    #[test]
    fn test_photo_sidecar_path() {
        let photo = DownloadedPhoto::new("/tmp/club_42.jpg");
        assert_eq!(photo.sidecar_path(), PathBuf::from("/tmp/club_42.json"));
    }

    #[test]
    fn test_is_photo() {
        assert!(DownloadedPhoto::is_photo(Path::new("a_1.jpg")));
        assert!(DownloadedPhoto::is_photo(Path::new("a_1.JPEG")));
        assert!(DownloadedPhoto::is_photo(Path::new("a_1.webp")));
        assert!(!DownloadedPhoto::is_photo(Path::new("a_1.json")));
        assert!(!DownloadedPhoto::is_photo(Path::new("a_1")));
    }

    #[test]
    fn test_media_type_codes() {
        assert_eq!(MediaType::from_code(1), Some(MediaType::Photo));
        assert_eq!(MediaType::from_code(8), Some(MediaType::Album));
        assert_eq!(MediaType::from_code(5), None);
        assert_eq!(MediaType::Video.code(), 2);
    }

    #[test]
    fn test_event_display() {
        let event = Event {
            source: PathBuf::from("club_1.jpg"),
            original_text: String::new(),
            title: Some("Sommerfest".to_string()),
            time: Some("18 Uhr".to_string()),
            location: Some("Marktplatz".to_string()),
            date: NaiveDate::from_ymd_opt(2026, 7, 4).and_then(|d| d.and_hms_opt(0, 0, 0)),
        };
        assert_eq!(
            event.to_string(),
            "Sommerfest on 2026-07-04 at 18 Uhr @ Marktplatz [club_1.jpg]"
        );

        let unresolved = Event::unresolved("club_2.jpg", "text");
        assert_eq!(unresolved.to_string(), "(untitled) (no date) [club_2.jpg]");
    }

    #[test]
    fn test_metadata_serde_defaults() {
        let json = r#"{"pk":"1","username":"club"}"#;
        let meta: PostMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.pk, "1");
        assert!(meta.caption.is_none());
        assert!(meta.taken_at.is_none());
    }
}
