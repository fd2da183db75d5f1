//! The polling service: download new posts, extract events, write them to
//! the calendar.

use shared_types::{DownloadedPhoto, MediaType};
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::caldav::{AddOutcome, EventSink};
use crate::error::Result;
use crate::extractor::Extractor;
use crate::instagram::MediaSource;
use crate::media::MediaStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessingStats {
    pub photos: usize,
    pub added: usize,
    pub skipped_no_date: usize,
    pub skipped_past: usize,
    pub duplicates: usize,
    pub errors: usize,
}

impl ProcessingStats {
    fn record(&mut self, outcome: AddOutcome) {
        match outcome {
            AddOutcome::Added => self.added += 1,
            AddOutcome::NoDate => self.skipped_no_date += 1,
            AddOutcome::InPast => self.skipped_past += 1,
            AddOutcome::AlreadyExists => self.duplicates += 1,
        }
    }
}

/// Extract events from every photo waiting in the store.
///
/// Each photo is marked as processed afterwards, whether or not extraction
/// or upload succeeded, so a broken post is never retried.
pub async fn process_pending_photos(
    store: &MediaStore,
    extractor: &Extractor,
    sink: &dyn EventSink,
) -> Result<ProcessingStats> {
    let photos = store.unprocessed_photos()?;
    tracing::info!("Processing {} new photo(s)", photos.len());

    let mut stats = ProcessingStats::default();

    for photo in photos {
        stats.photos += 1;
        process_photo(store, extractor, sink, &photo, &mut stats).await;

        if let Err(e) = store.mark_photo_as_processed(&photo) {
            stats.errors += 1;
            tracing::error!("Failed to mark {} as processed: {}", photo.path.display(), e);
        }
    }

    Ok(stats)
}

async fn process_photo(
    store: &MediaStore,
    extractor: &Extractor,
    sink: &dyn EventSink,
    photo: &DownloadedPhoto,
    stats: &mut ProcessingStats,
) {
    tracing::info!("Extracting events from {}", photo.path.display());

    let caption = store.caption(photo);
    let events = match extractor.extract(&photo.path, caption.as_deref()).await {
        Ok(events) => events,
        Err(e) => {
            stats.errors += 1;
            tracing::error!("Failed to extract events from {}: {}", photo.path.display(), e);
            return;
        }
    };

    for (index, event) in events.iter().enumerate() {
        if event.date.is_none() {
            tracing::info!("Skipping event without date: {}", event);
            stats.record(AddOutcome::NoDate);
            continue;
        }

        match sink.add_event(event, index).await {
            Ok(outcome) => stats.record(outcome),
            Err(e) => {
                stats.errors += 1;
                tracing::error!("Failed to add event {}: {}", event, e);
            }
        }
    }
}

/// Everything one poll cycle needs
pub struct Service<'a> {
    pub source: &'a dyn MediaSource,
    pub user_id: String,
    pub store: &'a MediaStore,
    pub extractor: &'a Extractor,
    pub sink: &'a dyn EventSink,
    pub max_downloads: usize,
    pub update_interval: Duration,
}

impl Service<'_> {
    /// Download new photos, then process everything pending
    pub async fn run_cycle(&self) -> Result<ProcessingStats> {
        let downloaded = self
            .store
            .update_posts(self.source, &self.user_id, MediaType::Photo, self.max_downloads)
            .await?;
        tracing::info!("Downloaded {} new photo(s)", downloaded);

        process_pending_photos(self.store, self.extractor, self.sink).await
    }

    /// Poll until Ctrl+C
    pub async fn run(&self) {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Unable to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run one cycle now and then one per update interval until `shutdown`
    /// completes. A failed cycle is logged and polling continues.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            "Polling every {} minute(s)",
            self.update_interval.as_secs() / 60
        );

        let mut ticker = tokio::time::interval(self.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(stats) => tracing::info!(
                            "Cycle done: {} photo(s), {} added, {} without date, {} in the past, {} duplicate(s), {} error(s)",
                            stats.photos,
                            stats.added,
                            stats.skipped_no_date,
                            stats.skipped_past,
                            stats.duplicates,
                            stats.errors
                        ),
                        Err(e) => tracing::error!("Poll cycle failed: {}", e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::instagram::Post;
    use crate::llm::ChatModel;
    use crate::ocr::OcrEngine;
    use async_trait::async_trait;
    use shared_types::Event;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    struct FakeOcr;

    #[async_trait]
    impl OcrEngine for FakeOcr {
        async fn recognize(&self, image: &Path) -> Result<Vec<String>> {
            if image.to_string_lossy().contains("broken") {
                return Err(Error::Ocr("unreadable image".to_string()));
            }
            Ok(vec!["PROGRAMM".to_string()])
        }
    }

    struct FakeLlm(&'static str);

    #[async_trait]
    impl ChatModel for FakeLlm {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[derive(Default)]
    struct FakeSink {
        added: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl EventSink for FakeSink {
        async fn add_event(&self, event: &Event, index: usize) -> Result<AddOutcome> {
            let title = event.display_title().to_string();
            match title.as_str() {
                "Alt" => Ok(AddOutcome::InPast),
                "Doppelt" => Ok(AddOutcome::AlreadyExists),
                "Kaputt" => Err(Error::caldav("server error")),
                _ => {
                    self.added.lock().unwrap().push((title, index));
                    Ok(AddOutcome::Added)
                }
            }
        }
    }

    struct FakeSource;

    #[async_trait]
    impl MediaSource for FakeSource {
        async fn user_medias(&self, _user_id: &str, _amount: usize) -> Result<Vec<Post>> {
            Ok(vec![Post {
                pk: "99".to_string(),
                media_type: Some(MediaType::Photo),
                taken_at: None,
                caption: Some("Sommerprogramm".to_string()),
                username: "club".to_string(),
                image_url: None,
            }])
        }

        async fn download_photo(&self, post: &Post, folder: &Path) -> Result<PathBuf> {
            let path = folder.join(format!("{}.jpg", post.file_stem()));
            fs::write(&path, b"jpeg")?;
            Ok(path)
        }
    }

    const PROGRAM: &str = r#"[
        {"Titel": "Lesung", "Datum": "2099-03-01", "Uhrzeit": "19 Uhr", "Ort": "Bibliothek"},
        {"Titel": "Ohne Datum", "Datum": null},
        {"Titel": "Alt", "Datum": "2001-01-01"},
        {"Titel": "Doppelt", "Datum": "2099-03-02"},
        {"Titel": "Kaputt", "Datum": "2099-03-03"}
    ]"#;

    fn extractor(answer: &'static str) -> Extractor {
        Extractor::new(Box::new(FakeOcr), Box::new(FakeLlm(answer)))
    }

    #[tokio::test]
    async fn test_process_pending_photos_counts_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::open(dir.path()).unwrap();
        fs::write(store.new_photos_dir().join("club_1.jpg"), b"jpeg").unwrap();

        let sink = FakeSink::default();
        let stats = process_pending_photos(&store, &extractor(PROGRAM), &sink)
            .await
            .unwrap();

        assert_eq!(
            stats,
            ProcessingStats {
                photos: 1,
                added: 1,
                skipped_no_date: 1,
                skipped_past: 1,
                duplicates: 1,
                errors: 1,
            }
        );
        assert_eq!(*sink.added.lock().unwrap(), vec![("Lesung".to_string(), 0)]);
        assert!(store.unprocessed_photos().unwrap().is_empty());
        assert_eq!(store.processed_photos().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_extraction_still_marks_processed() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::open(dir.path()).unwrap();
        fs::write(store.new_photos_dir().join("broken_2.jpg"), b"jpeg").unwrap();
        fs::write(store.new_photos_dir().join("club_3.jpg"), b"jpeg").unwrap();

        let sink = FakeSink::default();
        let stats = process_pending_photos(&store, &extractor("kein JSON"), &sink)
            .await
            .unwrap();

        // broken_2 fails in OCR, club_3 yields a single event without date
        assert_eq!(stats.photos, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.skipped_no_date, 1);
        assert_eq!(stats.added, 0);
        assert!(store.unprocessed_photos().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_until_runs_first_cycle_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::open(dir.path()).unwrap();
        let extractor = extractor(r#"{"Titel": "Fest", "Datum": "2099-05-01"}"#);
        let sink = FakeSink::default();

        let service = Service {
            source: &FakeSource,
            user_id: "1".to_string(),
            store: &store,
            extractor: &extractor,
            sink: &sink,
            max_downloads: 20,
            update_interval: Duration::from_secs(3600),
        };

        service
            .run_until(tokio::time::sleep(Duration::from_millis(200)))
            .await;

        assert_eq!(*sink.added.lock().unwrap(), vec![("Fest".to_string(), 0)]);
        let processed = store.processed_photos().unwrap();
        assert_eq!(processed.len(), 1);
        assert_eq!(store.caption(&processed[0]).as_deref(), Some("Sommerprogramm"));
    }
}
