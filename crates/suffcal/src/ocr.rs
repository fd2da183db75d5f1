//! Text recognition on downloaded photos.
//!
//! The default engine drives Tesseract through `leptess` with a language
//! model from the local cache.

use async_trait::async_trait;
use leptess::LepTess;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::hub::{ModelHub, TESSDATA_URL};

#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Recognised text of an image, one entry per non-empty line
    async fn recognize(&self, image: &Path) -> Result<Vec<String>>;
}

pub struct TesseractOcr {
    lang: String,
    tessdata_dir: PathBuf,
}

impl TesseractOcr {
    pub fn new(lang: impl Into<String>, tessdata_dir: impl Into<PathBuf>) -> Self {
        Self {
            lang: lang.into(),
            tessdata_dir: tessdata_dir.into(),
        }
    }

    pub fn traineddata_path(&self) -> PathBuf {
        self.tessdata_dir.join(format!("{}.traineddata", self.lang))
    }

    /// Download the language model if it is not cached yet
    pub async fn prepare(&self, hub: &ModelHub) -> Result<()> {
        let url = format!("{}/{}.traineddata", TESSDATA_URL, self.lang);
        hub.ensure_url(&url, &self.traineddata_path()).await?;
        Ok(())
    }
}

/// Run Tesseract on one image file. Blocking.
fn recognize_file(tessdata_dir: &Path, lang: &str, image: &Path) -> Result<String> {
    let datapath = tessdata_dir.to_str().ok_or_else(|| {
        Error::Ocr(format!(
            "Tessdata path is not valid UTF-8: {}",
            tessdata_dir.display()
        ))
    })?;

    let mut lt = LepTess::new(Some(datapath), lang).map_err(|e| {
        Error::Ocr(format!(
            "Failed to initialize Tesseract with '{}' from {}: {}",
            lang, datapath, e
        ))
    })?;

    lt.set_image(image)
        .map_err(|e| Error::Ocr(format!("Failed to load {}: {}", image.display(), e)))?;

    lt.get_utf8_text()
        .map_err(|e| Error::Ocr(format!("Invalid OCR output for {}: {}", image.display(), e)))
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn recognize(&self, image: &Path) -> Result<Vec<String>> {
        tracing::debug!("Running OCR on {}", image.display());

        let tessdata_dir = self.tessdata_dir.clone();
        let lang = self.lang.clone();
        let image = image.to_path_buf();

        // LepTess is neither Send nor async
        let text = tokio::task::spawn_blocking(move || recognize_file(&tessdata_dir, &lang, &image))
            .await
            .map_err(|e| Error::Ocr(format!("OCR task failed: {}", e)))??;

        Ok(split_lines(&text))
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_lines_drops_blank_lines() {
        let text = "SOMMERFEST\n\n  24.07.  ab 18   Uhr \n\x0c";
        assert_eq!(split_lines(text), vec!["SOMMERFEST", "24.07. ab 18 Uhr"]);
    }

    #[test]
    fn test_traineddata_path() {
        let ocr = TesseractOcr::new("deu", "/models/tessdata");
        assert_eq!(
            ocr.traineddata_path(),
            PathBuf::from("/models/tessdata/deu.traineddata")
        );
    }

    #[tokio::test]
    async fn test_missing_language_model_is_ocr_error() {
        let dir = tempfile::tempdir().unwrap();
        let ocr = TesseractOcr::new("suffcal-no-such-lang", dir.path());
        let err = ocr.recognize(Path::new("x.jpg")).await.unwrap_err();
        assert!(matches!(err, Error::Ocr(_)));
    }
}
