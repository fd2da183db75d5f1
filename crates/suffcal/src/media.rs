//! On-disk store for downloaded photos.
//!
//! Layout under the download path:
//!
//! ```text
//! new_photos/        photos waiting for extraction
//! processed_photos/  photos already handed to the extractor
//! ```
//!
//! Each photo `<username>_<pk>.jpg` may carry a `<username>_<pk>.json` sidecar
//! with the post metadata (caption, timestamp).

use shared_types::{DownloadedPhoto, MediaType, PostMetadata};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::instagram::MediaSource;

pub const NEW_PHOTOS_DIR: &str = "new_photos";
pub const PROCESSED_PHOTOS_DIR: &str = "processed_photos";

pub struct MediaStore {
    new_photos_dir: PathBuf,
    processed_photos_dir: PathBuf,
}

impl MediaStore {
    /// Open the store, creating its directories when needed
    pub fn open(download_path: impl Into<PathBuf>) -> Result<Self> {
        let download_path = download_path.into();
        let new_photos_dir = download_path.join(NEW_PHOTOS_DIR);
        let processed_photos_dir = download_path.join(PROCESSED_PHOTOS_DIR);

        fs::create_dir_all(&new_photos_dir)?;
        fs::create_dir_all(&processed_photos_dir)?;

        Ok(Self {
            new_photos_dir,
            processed_photos_dir,
        })
    }

    pub fn new_photos_dir(&self) -> &Path {
        &self.new_photos_dir
    }

    pub fn processed_photos_dir(&self) -> &Path {
        &self.processed_photos_dir
    }

    /// Photos not yet handed to the extractor.
    ///
    /// Photos are not marked as processed by listing them.
    pub fn unprocessed_photos(&self) -> Result<Vec<DownloadedPhoto>> {
        list_photos(&self.new_photos_dir)
    }

    pub fn processed_photos(&self) -> Result<Vec<DownloadedPhoto>> {
        list_photos(&self.processed_photos_dir)
    }

    /// Ids of every photo on disk, processed or not
    pub fn known_ids(&self) -> Result<HashSet<String>> {
        let mut ids: HashSet<String> = self
            .unprocessed_photos()?
            .iter()
            .map(DownloadedPhoto::id)
            .collect();
        ids.extend(self.processed_photos()?.iter().map(DownloadedPhoto::id));
        Ok(ids)
    }

    /// Download new posts of the given type from a user.
    ///
    /// Looks at the `max_downloads` most recent posts and skips everything
    /// already on disk. Returns the number of downloaded photos.
    pub async fn update_posts(
        &self,
        source: &dyn MediaSource,
        user_id: &str,
        media_type: MediaType,
        max_downloads: usize,
    ) -> Result<usize> {
        let known = self.known_ids()?;
        let posts = source.user_medias(user_id, max_downloads).await?;

        tracing::debug!("Fetched {} posts, {} already known", posts.len(), known.len());

        let mut count = 0;
        for post in posts {
            if count >= max_downloads {
                break;
            }
            if known.contains(&post.pk) {
                tracing::trace!("  Skipped (already downloaded): {}", post.pk);
                continue;
            }
            if post.media_type != Some(media_type) {
                tracing::trace!("  Skipped (not a {}): {}", media_type.as_str(), post.pk);
                continue;
            }

            match source.download_photo(&post, &self.new_photos_dir).await {
                Ok(path) => {
                    let photo = DownloadedPhoto::new(path);
                    if let Err(e) = write_sidecar(&photo, &post.metadata()) {
                        tracing::warn!("Failed to write metadata for {}: {}", post.pk, e);
                    }
                    tracing::info!("  Downloaded: {}", photo.path.display());
                    count += 1;
                }
                Err(e) => {
                    tracing::warn!("  Failed to download post {}: {}", post.pk, e);
                }
            }
        }

        Ok(count)
    }

    /// Move a photo (and its sidecar) into the processed directory
    pub fn mark_photo_as_processed(&self, photo: &DownloadedPhoto) -> Result<DownloadedPhoto> {
        let file_name = match photo.path.file_name() {
            Some(name) => name.to_owned(),
            None => {
                return Err(crate::error::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("not a file: {}", photo.path.display()),
                )))
            }
        };

        let target = self.processed_photos_dir.join(file_name);
        fs::rename(&photo.path, &target)?;

        let sidecar = photo.sidecar_path();
        if sidecar.exists() {
            let moved = DownloadedPhoto::new(&target).sidecar_path();
            if let Err(e) = fs::rename(&sidecar, &moved) {
                tracing::warn!("Failed to move {}: {}", sidecar.display(), e);
            }
        }

        Ok(DownloadedPhoto::new(target))
    }

    /// Metadata written next to the photo at download time
    pub fn metadata(&self, photo: &DownloadedPhoto) -> Option<PostMetadata> {
        let content = fs::read_to_string(photo.sidecar_path()).ok()?;
        match serde_json::from_str(&content) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::warn!("Failed to parse metadata of {}: {}", photo.path.display(), e);
                None
            }
        }
    }

    /// Caption of the post a photo belongs to
    pub fn caption(&self, photo: &DownloadedPhoto) -> Option<String> {
        self.metadata(photo).and_then(|meta| meta.caption)
    }
}

fn list_photos(dir: &Path) -> Result<Vec<DownloadedPhoto>> {
    let mut photos: Vec<DownloadedPhoto> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && DownloadedPhoto::is_photo(p))
        .map(DownloadedPhoto::new)
        .collect();
    photos.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(photos)
}

fn write_sidecar(photo: &DownloadedPhoto, metadata: &PostMetadata) -> Result<()> {
    let json = serde_json::to_string_pretty(metadata)?;
    fs::write(photo.sidecar_path(), json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instagram::Post;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeSource {
        posts: Vec<Post>,
        downloads: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl FakeSource {
        fn new(posts: Vec<Post>) -> Self {
            Self {
                posts,
                downloads: Mutex::new(Vec::new()),
                fail_on: None,
            }
        }
    }

    #[async_trait]
    impl MediaSource for FakeSource {
        async fn user_medias(&self, _user_id: &str, amount: usize) -> Result<Vec<Post>> {
            Ok(self.posts.iter().take(amount).cloned().collect())
        }

        async fn download_photo(&self, post: &Post, folder: &Path) -> Result<PathBuf> {
            if self.fail_on.as_deref() == Some(post.pk.as_str()) {
                return Err(crate::error::Error::instagram("boom"));
            }
            self.downloads.lock().unwrap().push(post.pk.clone());
            let path = folder.join(format!("{}.jpg", post.file_stem()));
            fs::write(&path, b"jpeg")?;
            Ok(path)
        }
    }

    fn post(pk: &str, media_type: MediaType) -> Post {
        Post {
            pk: pk.to_string(),
            media_type: Some(media_type),
            taken_at: None,
            caption: Some(format!("caption {}", pk)),
            username: "club_name".to_string(),
            image_url: Some("http://cdn/x".to_string()),
        }
    }

    #[test]
    fn test_open_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::open(dir.path().join("insta")).unwrap();
        assert!(store.new_photos_dir().is_dir());
        assert!(store.processed_photos_dir().is_dir());

        // Opening twice is fine
        MediaStore::open(dir.path().join("insta")).unwrap();
    }

    #[tokio::test]
    async fn test_update_posts_downloads_new_photos_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::open(dir.path()).unwrap();
        fs::write(store.processed_photos_dir().join("club_name_3.jpg"), b"old").unwrap();

        let source = FakeSource::new(vec![
            post("5", MediaType::Photo),
            post("4", MediaType::Video),
            post("3", MediaType::Photo),
            post("2", MediaType::Photo),
        ]);

        let count = store
            .update_posts(&source, "1", MediaType::Photo, 20)
            .await
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(*source.downloads.lock().unwrap(), vec!["5", "2"]);

        let ids: Vec<String> = store
            .unprocessed_photos()
            .unwrap()
            .iter()
            .map(DownloadedPhoto::id)
            .collect();
        assert_eq!(ids, vec!["2", "5"]);
    }

    #[tokio::test]
    async fn test_update_posts_respects_max_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::open(dir.path()).unwrap();
        let source = FakeSource::new(vec![
            post("5", MediaType::Photo),
            post("4", MediaType::Photo),
            post("3", MediaType::Photo),
        ]);

        let count = store
            .update_posts(&source, "1", MediaType::Photo, 2)
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.unprocessed_photos().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_posts_survives_failed_download() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::open(dir.path()).unwrap();
        let mut source = FakeSource::new(vec![post("5", MediaType::Photo), post("4", MediaType::Photo)]);
        source.fail_on = Some("5".to_string());

        let count = store
            .update_posts(&source, "1", MediaType::Photo, 20)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_sidecar_and_mark_processed() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::open(dir.path()).unwrap();
        let source = FakeSource::new(vec![post("7", MediaType::Photo)]);
        store
            .update_posts(&source, "1", MediaType::Photo, 20)
            .await
            .unwrap();

        let photo = store.unprocessed_photos().unwrap().remove(0);
        assert_eq!(store.caption(&photo).as_deref(), Some("caption 7"));

        let moved = store.mark_photo_as_processed(&photo).unwrap();
        assert!(!photo.path.exists());
        assert!(!photo.sidecar_path().exists());
        assert!(moved.path.exists());
        assert!(moved.sidecar_path().exists());
        assert!(store.unprocessed_photos().unwrap().is_empty());
        assert_eq!(store.caption(&moved).as_deref(), Some("caption 7"));

        // A processed photo is never downloaded again
        let count = store
            .update_posts(&source, "1", MediaType::Photo, 20)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_listing_ignores_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::open(dir.path()).unwrap();
        fs::write(store.new_photos_dir().join("club_1.jpg"), b"x").unwrap();
        fs::write(store.new_photos_dir().join("club_1.json"), b"{}").unwrap();
        fs::write(store.new_photos_dir().join("notes.txt"), b"x").unwrap();

        let photos = store.unprocessed_photos().unwrap();
        assert_eq!(photos.len(), 1);
        assert!(store.caption(&photos[0]).is_none());
    }
}
