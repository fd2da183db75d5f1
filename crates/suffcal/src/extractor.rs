//! Event extraction: OCR text of a photo plus its caption, handed to the
//! language model with a fixed German prompt.

use serde_json::Value;
use shared_types::{parse_event_date, Event};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ModelSettings;
use crate::error::Result;
use crate::hub::ModelHub;
use crate::llm::{ChatModel, LlamaServer, LlmClient};
use crate::ocr::{OcrEngine, TesseractOcr};
use crate::response::parse_ai_response;

pub const SYSTEM_PROMPT: &str =
    "Du bist ein hilfreicher Assistent, der relevante Informationen aus Texten extrahiert.";

const SCHEMA_EXAMPLE: &str = r#"{"Titel": null, "Datum": null, "Uhrzeit": null, "Ort": null}"#;

/// Port of the local llama-server started when no LLM URL is configured
pub const LLAMA_SERVER_PORT: u16 = 8089;

const LLAMA_SERVER_STARTUP: Duration = Duration::from_secs(300);

pub struct Extractor {
    ocr: Box<dyn OcrEngine>,
    llm: Box<dyn ChatModel>,
}

impl Extractor {
    pub fn new(ocr: Box<dyn OcrEngine>, llm: Box<dyn ChatModel>) -> Self {
        Self { ocr, llm }
    }

    /// Build the extractor from settings, downloading missing models.
    ///
    /// Without an LLM URL a local llama-server is started; it lives as long
    /// as the returned handle.
    pub async fn start(settings: &ModelSettings) -> Result<(Self, Option<LlamaServer>)> {
        let hub = ModelHub::new(&settings.hf_endpoint, settings.hf_token.clone())?;
        let ocr = TesseractOcr::new(&settings.ocr_lang, &settings.ocr_cache_path);
        ocr.prepare(&hub).await?;

        let (llm, server) = match &settings.llm_url {
            Some(url) => {
                tracing::info!("Using LLM server at {}", url);
                (LlmClient::new(url)?, None)
            }
            None => {
                let model_path = hub
                    .ensure_repo_file(&settings.llm_repo, &settings.llm_file, &settings.cache_path)
                    .await?;
                let server = LlamaServer::spawn(
                    &settings.llama_server_bin,
                    &model_path,
                    LLAMA_SERVER_PORT,
                    LLAMA_SERVER_STARTUP,
                )
                .await?;
                (LlmClient::new(server.url())?, Some(server))
            }
        };

        Ok((Self::new(Box::new(ocr), Box::new(llm)), server))
    }

    /// Extract all events from a photo.
    ///
    /// A model answer that cannot be parsed yields a single event without a
    /// date. OCR and LLM transport failures are returned as errors.
    pub async fn extract(&self, image: &Path, caption: Option<&str>) -> Result<Vec<Event>> {
        let words = self.ocr.recognize(image).await?;
        let text = source_text(&words, caption);
        tracing::debug!("Text of {}: {}", image.display(), text);

        let answer = self
            .llm
            .complete(SYSTEM_PROMPT, &build_prompt(&text))
            .await?;

        match parse_ai_response(&answer) {
            Ok(value) => Ok(events_from_value(image, &text, &value)),
            Err(e) => {
                tracing::warn!("Unable to parse text '{}' -> '{}': {}", text, answer, e);
                Ok(vec![Event::unresolved(image, text)])
            }
        }
    }
}

/// Download the OCR language model and the GGUF file if missing.
///
/// Returns the path of the GGUF model.
pub async fn prepare_models(settings: &ModelSettings) -> Result<PathBuf> {
    let hub = ModelHub::new(&settings.hf_endpoint, settings.hf_token.clone())?;

    TesseractOcr::new(&settings.ocr_lang, &settings.ocr_cache_path)
        .prepare(&hub)
        .await?;

    hub.ensure_repo_file(&settings.llm_repo, &settings.llm_file, &settings.cache_path)
        .await
}

fn source_text(words: &[String], caption: Option<&str>) -> String {
    let mut text = words.join(" ");
    if let Some(caption) = caption.map(str::trim).filter(|c| !c.is_empty()) {
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str(caption);
    }
    text
}

pub fn build_prompt(text: &str) -> String {
    format!(
        "
Extrahiere aus folgendem Text die wichtigsten Informationen zur Veranstaltung(en), insbesondere Titel, Datum, Uhrzeit und Ort.

Antwortformat (wichtig):
- Wenn eine Veranstaltung: gib ein einzelnes JSON-Objekt mit den Schlüsseln 'Titel', 'Datum', 'Uhrzeit', 'Ort'.
- Wenn mehrere: gib eine JSON-Liste von Objekten. Beispiel (Liste): [{example}]
- Fehlende Informationen -> null.
- Datum: ISO 8601 Format YYYY-MM-DD (oder null).
- Antworte ausschließlich mit gültigem JSON in einer einzigen Zeile, ohne erläuternden Text oder Zeilenumbrüche.
- Erfinde keine Informationen.

Text: {text}
",
        example = SCHEMA_EXAMPLE,
        text = text
    )
}

/// Events described by a parsed model answer (an object or a list of them)
pub fn events_from_value(source: &Path, text: &str, value: &Value) -> Vec<Event> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::Object(_) => Some(event_from_object(source, text, item)),
                other => {
                    tracing::warn!("Ignoring non-object entry in model answer: {}", other);
                    None
                }
            })
            .collect(),
        _ => vec![event_from_object(source, text, value)],
    }
}

fn event_from_object(source: &Path, text: &str, value: &Value) -> Event {
    Event {
        source: source.to_path_buf(),
        original_text: text.to_string(),
        title: field(value, "Titel"),
        time: field(value, "Uhrzeit"),
        location: field(value, "Ort"),
        date: match value.get("Datum") {
            Some(Value::String(raw)) => parse_event_date(raw),
            _ => None,
        },
    }
}

fn field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
