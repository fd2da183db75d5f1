use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use suffcal::caldav::{CalDavClient, CalendarWriter};
use suffcal::config::{Cli, Command, Settings};
use suffcal::extractor::{prepare_models, Extractor};
use suffcal::instagram::InstagramClient;
use suffcal::media::MediaStore;
use suffcal::service::Service;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "suffcal=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.effective_command() {
        Command::Init => init(&cli).await,
        Command::Extract { image, caption } => extract(&cli, &image, caption.as_deref()).await,
        Command::Calendars => list_calendars(&cli).await,
        Command::Sync => poll(&cli, false).await,
        Command::Run => poll(&cli, true).await,
    }
}

async fn init(cli: &Cli) -> Result<()> {
    let models = cli.models.resolve();
    let model = prepare_models(&models)
        .await
        .context("Failed to download model files")?;

    tracing::info!(
        "Model files ready: {} and {}",
        model.display(),
        models.ocr_cache_path.display()
    );
    Ok(())
}

async fn extract(cli: &Cli, image: &Path, caption: Option<&str>) -> Result<()> {
    let models = cli.models.resolve();
    let (extractor, _server) = Extractor::start(&models)
        .await
        .context("Failed to start OCR and language model")?;

    let events = extractor
        .extract(image, caption)
        .await
        .with_context(|| format!("Failed to extract events from {}", image.display()))?;

    if events.is_empty() {
        println!("No events found");
    }
    for event in &events {
        println!("{}", event);
    }
    Ok(())
}

async fn list_calendars(cli: &Cli) -> Result<()> {
    let settings = cli.calendar.resolve_connection()?;
    let client = CalDavClient::connect(&settings.url, &settings.user, &settings.password)
        .await
        .context("Failed to connect to the calendar server")?;

    for calendar in client.calendars() {
        println!("{}\t{}", calendar.name, calendar.url);
    }
    Ok(())
}

async fn poll(cli: &Cli, forever: bool) -> Result<()> {
    let settings = Settings::from_cli(cli)?;

    tracing::info!(
        "Starting suffcal for @{} -> calendar '{}'",
        settings.instagram.target_user,
        settings.calendar.name
    );

    let store = MediaStore::open(&settings.instagram.cache_path).with_context(|| {
        format!(
            "Failed to open media cache {}",
            settings.instagram.cache_path.display()
        )
    })?;

    let caldav = CalDavClient::connect(
        &settings.calendar.url,
        &settings.calendar.user,
        &settings.calendar.password,
    )
    .await
    .context("Failed to connect to the calendar server")?;
    let calendar = CalendarWriter::new(
        caldav,
        &settings.calendar.name,
        settings.calendar.timezone,
        settings.calendar.event_duration,
    )?;

    let (extractor, _server) = Extractor::start(&settings.models)
        .await
        .context("Failed to start OCR and language model")?;

    let mut instagram = InstagramClient::new()?;
    instagram
        .login(&settings.instagram.user, &settings.instagram.password)
        .await
        .context("Failed to log in to Instagram")?;

    let result = async {
        let user_id = instagram
            .user_id_from_username(&settings.instagram.target_user)
            .await
            .with_context(|| {
                format!("Failed to look up @{}", settings.instagram.target_user)
            })?;

        let service = Service {
            source: &instagram,
            user_id,
            store: &store,
            extractor: &extractor,
            sink: &calendar,
            max_downloads: settings.instagram.max_downloads,
            update_interval: settings.instagram.update_interval,
        };

        if forever {
            service.run().await;
        } else {
            let stats = service.run_cycle().await?;
            tracing::info!("Sync done: {:?}", stats);
        }
        anyhow::Ok(())
    }
    .await;

    if let Err(e) = instagram.logout().await {
        tracing::warn!("Failed to log out of Instagram: {}", e);
    }

    result
}
