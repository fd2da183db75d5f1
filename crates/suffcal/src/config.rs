//! Command line definition and settings resolution.
//!
//! Every option can also come from the environment (or a `.env` file); an
//! explicit argument always wins. Options are global, so they may follow the
//! subcommand. Each subcommand resolves only the settings
//! it needs, and all missing required values are reported at once.

use chrono_tz::Tz;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default polling interval in minutes
pub const DEFAULT_UPDATE_INTERVAL_MINUTES: u64 = 240;

/// Default number of posts looked at per poll
pub const DEFAULT_MAX_DOWNLOADS: usize = 20;

pub const DEFAULT_LLM_REPO: &str = "TheBloke/CapybaraHermes-2.5-Mistral-7B-GGUF";
pub const DEFAULT_LLM_FILE: &str = "capybarahermes-2.5-mistral-7b.Q4_K_M.gguf";

#[derive(Parser, Debug)]
#[command(name = "suffcal")]
#[command(about = "Update your calendar by posted instagram events")]
#[command(
    long_about = "Watches an Instagram account, reads event posters with OCR and a local \
    language model, and writes the events it finds into a CalDAV calendar.\n\n\
    Every option can also be set through the environment variable shown in its help."
)]
pub struct Cli {
    /// Only download all needed model files, then exit.
    /// Mostly useful while preparing a container image. Same as `suffcal init`.
    #[arg(long)]
    pub init: bool,

    #[command(flatten)]
    pub instagram: InstagramArgs,

    #[command(flatten)]
    pub calendar: CalendarArgs,

    #[command(flatten)]
    pub models: ModelArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Poll Instagram forever and add new events to the calendar (default)
    Run,

    /// Run a single poll cycle, then exit
    Sync,

    /// Download the OCR and language model files, then exit
    Init,

    /// Run OCR and the language model on one image and print the events
    Extract {
        /// Image file to read
        #[arg(value_name = "IMAGE")]
        image: PathBuf,

        /// Caption text to add to the OCR output
        #[arg(long, value_name = "TEXT")]
        caption: Option<String>,
    },

    /// List the calendars available on the CalDAV server
    Calendars,
}

impl Cli {
    /// Subcommand to execute, honouring the legacy `--init` flag
    pub fn effective_command(&self) -> Command {
        if self.init {
            return Command::Init;
        }
        self.command.clone().unwrap_or(Command::Run)
    }
}

#[derive(Args, Debug, Clone)]
#[command(next_help_heading = "Instagram Settings")]
pub struct InstagramArgs {
    /// Target instagram user to scan posts from
    #[arg(long, global = true, env = "INSTA_TARGET_USER")]
    pub insta_target_user: Option<String>,

    /// Instagram login user
    #[arg(long, global = true, env = "INSTA_USER")]
    pub insta_user: Option<String>,

    /// Instagram login password
    #[arg(long, global = true, env = "INSTA_PASSWORD", hide_env_values = true)]
    pub insta_password: Option<String>,

    /// Interval in minutes between updates.
    /// Invalid values fall back to 240 minutes.
    #[arg(long, global = true, env = "INSTA_UPDATE_INTERVAL", value_name = "MINUTES")]
    pub update_interval: Option<String>,

    /// Number of most recent posts to look at per update
    #[arg(long, global = true, env = "INSTA_MAX_DOWNLOADS", default_value_t = DEFAULT_MAX_DOWNLOADS)]
    pub max_downloads: usize,

    /// Path to cache directory for instagram data
    #[arg(long, global = true, env = "INSTA_CACHE_PATH", default_value = "./downloads/instagram")]
    pub insta_cache_path: PathBuf,
}

#[derive(Args, Debug, Clone)]
#[command(next_help_heading = "Calendar Settings")]
pub struct CalendarArgs {
    /// Calendar username
    #[arg(long, global = true, env = "CALENDAR_USER")]
    pub calendar_user: Option<String>,

    /// Calendar password
    #[arg(long, global = true, env = "CALENDAR_PASSWORD", hide_env_values = true)]
    pub calendar_password: Option<String>,

    /// CalDAV server URL
    #[arg(long, global = true, env = "CALENDAR_URL")]
    pub calendar_url: Option<String>,

    /// Calendar name to update
    #[arg(long, global = true, env = "CALENDAR_NAME")]
    pub calendar_name: Option<String>,

    /// Timezone events on the posters are written in
    #[arg(long, global = true, env = "CALENDAR_TIMEZONE", default_value = "Europe/Berlin")]
    pub timezone: String,

    /// Length of events with a start time, in minutes
    #[arg(long, global = true, env = "CALENDAR_EVENT_DURATION", default_value_t = 120, value_name = "MINUTES")]
    pub event_duration: u64,
}

#[derive(Args, Debug, Clone)]
#[command(next_help_heading = "Cache Settings")]
pub struct ModelArgs {
    /// Path to cache directory for downloaded models
    #[arg(long, global = true, env = "MODEL_CACHE_PATH", default_value = "./downloads/models")]
    pub model_cache_path: PathBuf,

    /// Directory holding tesseract traineddata files.
    /// Defaults to `<model-cache-path>/tessdata`.
    #[arg(long, global = true, env = "OCR_CACHE_PATH")]
    pub ocr_cache_path: Option<PathBuf>,

    /// Tesseract language used for OCR
    #[arg(long, global = true, env = "OCR_LANG", default_value = "deu")]
    pub ocr_lang: String,

    /// Hugging Face repository holding the GGUF model
    #[arg(long, global = true, env = "LLM_REPO", default_value = DEFAULT_LLM_REPO)]
    pub llm_repo: String,

    /// GGUF file inside the repository
    #[arg(long, global = true, env = "LLM_FILE", default_value = DEFAULT_LLM_FILE)]
    pub llm_file: String,

    /// URL of an already running OpenAI-compatible server.
    /// When unset, a local llama-server is started with the cached model.
    #[arg(long, global = true, env = "LLM_URL")]
    pub llm_url: Option<String>,

    /// llama-server executable used when no --llm-url is given
    #[arg(long, global = true, env = "LLAMA_SERVER_BIN", default_value = "llama-server")]
    pub llama_server_bin: String,

    /// Hugging Face token for model downloads
    #[arg(long, global = true, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,

    /// Hugging Face endpoint
    #[arg(long, global = true, env = "HF_ENDPOINT", default_value = "https://huggingface.co")]
    pub hf_endpoint: String,
}

#[derive(Debug, Clone)]
pub struct InstagramSettings {
    pub target_user: String,
    pub user: String,
    pub password: String,
    pub update_interval: Duration,
    pub max_downloads: usize,
    pub cache_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CalendarSettings {
    pub url: String,
    pub user: String,
    pub password: String,
    pub name: String,
    pub timezone: Tz,
    pub event_duration: chrono::Duration,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub cache_path: PathBuf,
    pub ocr_cache_path: PathBuf,
    pub ocr_lang: String,
    pub llm_repo: String,
    pub llm_file: String,
    pub llm_url: Option<String>,
    pub llama_server_bin: String,
    pub hf_token: Option<String>,
    pub hf_endpoint: String,
}

/// Collects the names of missing required values
#[derive(Debug, Default)]
pub struct Required {
    missing: Vec<&'static str>,
}

impl Required {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&mut self, value: &Option<String>, name: &'static str) -> String {
        match value {
            Some(v) if !v.trim().is_empty() => v.clone(),
            _ => {
                self.missing.push(name);
                String::new()
            }
        }
    }

    pub fn finish(self) -> Result<()> {
        if self.missing.is_empty() {
            Ok(())
        } else {
            Err(Error::missing(&self.missing))
        }
    }
}

/// Parse the update interval in minutes, falling back to the default
pub fn parse_update_interval(raw: Option<&str>) -> Duration {
    let minutes = match raw {
        None => DEFAULT_UPDATE_INTERVAL_MINUTES,
        Some(value) => match value.trim().parse::<u64>() {
            Ok(minutes) if minutes > 0 => minutes,
            _ => {
                tracing::warn!(
                    "Invalid update interval '{}' provided; falling back to {} minutes",
                    value,
                    DEFAULT_UPDATE_INTERVAL_MINUTES
                );
                DEFAULT_UPDATE_INTERVAL_MINUTES
            }
        },
    };
    Duration::from_secs(minutes * 60)
}

impl InstagramArgs {
    pub fn resolve(&self, required: &mut Required) -> InstagramSettings {
        InstagramSettings {
            target_user: required.take(&self.insta_target_user, "insta_target_user"),
            user: required.take(&self.insta_user, "insta_user"),
            password: required.take(&self.insta_password, "insta_password"),
            update_interval: parse_update_interval(self.update_interval.as_deref()),
            max_downloads: self.max_downloads,
            cache_path: self.insta_cache_path.clone(),
        }
    }
}

impl CalendarArgs {
    pub fn resolve(&self, required: &mut Required) -> Result<CalendarSettings> {
        let timezone: Tz = self
            .timezone
            .parse()
            .map_err(|_| Error::Config(format!("Invalid timezone: {}", self.timezone)))?;

        Ok(CalendarSettings {
            url: required.take(&self.calendar_url, "calendar_url"),
            user: required.take(&self.calendar_user, "calendar_user"),
            password: required.take(&self.calendar_password, "calendar_password"),
            name: required.take(&self.calendar_name, "calendar_name"),
            timezone,
            event_duration: chrono::Duration::minutes(self.event_duration as i64),
        })
    }

    /// Connection settings only; the calendar name is not needed to list calendars
    pub fn resolve_connection(&self) -> Result<CalendarSettings> {
        let mut required = Required::new();
        let mut settings = self.resolve(&mut Required::new())?;
        settings.url = required.take(&self.calendar_url, "calendar_url");
        settings.user = required.take(&self.calendar_user, "calendar_user");
        settings.password = required.take(&self.calendar_password, "calendar_password");
        required.finish()?;
        Ok(settings)
    }
}

impl ModelArgs {
    pub fn resolve(&self) -> ModelSettings {
        let ocr_cache_path = self
            .ocr_cache_path
            .clone()
            .unwrap_or_else(|| self.model_cache_path.join("tessdata"));

        ModelSettings {
            cache_path: self.model_cache_path.clone(),
            ocr_cache_path,
            ocr_lang: self.ocr_lang.clone(),
            llm_repo: self.llm_repo.clone(),
            llm_file: self.llm_file.clone(),
            llm_url: self.llm_url.clone().filter(|url| !url.trim().is_empty()),
            llama_server_bin: self.llama_server_bin.clone(),
            hf_token: self.hf_token.clone().filter(|token| !token.trim().is_empty()),
            hf_endpoint: self.hf_endpoint.trim_end_matches('/').to_string(),
        }
    }
}

/// Everything the polling pipeline needs
#[derive(Debug, Clone)]
pub struct Settings {
    pub instagram: InstagramSettings,
    pub calendar: CalendarSettings,
    pub models: ModelSettings,
}

impl Settings {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut required = Required::new();
        let instagram = cli.instagram.resolve(&mut required);
        let calendar = cli.calendar.resolve(&mut required)?;
        let models = cli.models.resolve();
        required.finish()?;

        Ok(Self {
            instagram,
            calendar,
            models,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that touch process environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn full_args() -> Vec<&'static str> {
        vec![
            "suffcal",
            "--insta-target-user",
            "club",
            "--insta-user",
            "me",
            "--insta-password",
            "secret",
            "--calendar-user",
            "cal",
            "--calendar-password",
            "calpw",
            "--calendar-url",
            "https://dav.example.com/",
            "--calendar-name",
            "feste",
        ]
    }

    #[test]
    fn test_resolves_full_settings() {
        let cli = Cli::try_parse_from(full_args()).unwrap();
        let settings = Settings::from_cli(&cli).unwrap();

        assert_eq!(settings.instagram.target_user, "club");
        assert_eq!(settings.instagram.password, "secret");
        assert_eq!(settings.calendar.name, "feste");
        assert_eq!(settings.calendar.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(settings.calendar.event_duration, chrono::Duration::minutes(120));
        assert_eq!(settings.instagram.max_downloads, DEFAULT_MAX_DOWNLOADS);
        assert_eq!(
            settings.models.ocr_cache_path,
            PathBuf::from("./downloads/models").join("tessdata")
        );
        assert_eq!(settings.models.llm_file, DEFAULT_LLM_FILE);
    }

    #[test]
    fn test_reports_all_missing_parameters() {
        let cli = Cli::try_parse_from(["suffcal", "--insta-user", "me", "sync"]).unwrap();
        let err = Settings::from_cli(&cli).unwrap_err().to_string();

        for name in [
            "insta_target_user",
            "insta_password",
            "calendar_url",
            "calendar_user",
            "calendar_password",
            "calendar_name",
        ] {
            assert!(err.contains(name), "{} missing from: {}", name, err);
        }
        assert!(!err.contains("insta_user,"));
    }

    #[test]
    fn test_blank_values_count_as_missing() {
        let mut required = Required::new();
        assert_eq!(required.take(&Some("  ".to_string()), "insta_user"), "");
        assert!(required.finish().is_err());
    }

    #[test]
    fn test_update_interval_fallback() {
        assert_eq!(parse_update_interval(None), Duration::from_secs(240 * 60));
        assert_eq!(parse_update_interval(Some("15")), Duration::from_secs(15 * 60));
        assert_eq!(
            parse_update_interval(Some("soon")),
            Duration::from_secs(240 * 60)
        );
        assert_eq!(parse_update_interval(Some("0")), Duration::from_secs(240 * 60));
    }

    #[test]
    fn test_invalid_timezone() {
        let mut args = full_args();
        args.extend(["--timezone", "Mars/Olympus"]);
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(matches!(Settings::from_cli(&cli), Err(Error::Config(_))));
    }

    #[test]
    fn test_effective_command() {
        let cli = Cli::try_parse_from(["suffcal"]).unwrap();
        assert_eq!(cli.effective_command(), Command::Run);

        let cli = Cli::try_parse_from(["suffcal", "--init"]).unwrap();
        assert_eq!(cli.effective_command(), Command::Init);

        let cli = Cli::try_parse_from(["suffcal", "extract", "poster.jpg"]).unwrap();
        assert_eq!(
            cli.effective_command(),
            Command::Extract {
                image: PathBuf::from("poster.jpg"),
                caption: None
            }
        );
    }

    #[test]
    fn test_calendar_connection_ignores_name() {
        let cli = Cli::try_parse_from([
            "suffcal",
            "--calendar-user",
            "cal",
            "--calendar-password",
            "pw",
            "--calendar-url",
            "https://dav.example.com/",
            "calendars",
        ])
        .unwrap();
        let settings = cli.calendar.resolve_connection().unwrap();
        assert_eq!(settings.url, "https://dav.example.com/");
        assert!(settings.name.is_empty());
    }

    #[test]
    fn test_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "suffcal",
            "extract",
            "poster.jpg",
            "--llm-url",
            "http://localhost:8080",
            "--ocr-lang",
            "eng",
        ])
        .unwrap();
        let models = cli.models.resolve();
        assert_eq!(models.llm_url.as_deref(), Some("http://localhost:8080"));
        assert_eq!(models.ocr_lang, "eng");
    }

    #[test]
    fn test_argument_wins_over_environment() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("LLAMA_SERVER_BIN", "/opt/llama/from-env");

        let from_env = Cli::try_parse_from(["suffcal", "init"]).unwrap();
        let from_arg =
            Cli::try_parse_from(["suffcal", "--llama-server-bin", "/usr/bin/llama-server", "init"])
                .unwrap();
        std::env::remove_var("LLAMA_SERVER_BIN");

        assert_eq!(from_env.models.llama_server_bin, "/opt/llama/from-env");
        assert_eq!(from_arg.models.llama_server_bin, "/usr/bin/llama-server");
    }

    #[test]
    fn test_empty_llm_url_is_none() {
        let cli = Cli::try_parse_from(["suffcal", "--llm-url", ""]).unwrap();
        assert!(cli.models.resolve().llm_url.is_none());
    }
}
