use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use clap::Parser;
use suffcal::caldav::{ical_entry, AddOutcome, CalDavClient, EventTiming};
use suffcal::config::CalendarArgs;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "add-event")]
#[command(about = "Add a calendar event from the command line")]
struct Cli {
    /// Event title/summary
    #[arg(short, long)]
    summary: String,

    /// Event description
    #[arg(short, long)]
    description: Option<String>,

    /// Start in format "YYYY-MM-DD HH:MM", or "YYYY-MM-DD" for an all-day event
    #[arg(long)]
    start: String,

    /// End in format "YYYY-MM-DD HH:MM" (default: start + event duration)
    #[arg(long)]
    end: Option<String>,

    /// Location
    #[arg(short, long)]
    location: Option<String>,

    #[command(flatten)]
    calendar: CalendarArgs,
}

fn parse_datetime(s: &str, tz: Tz) -> Result<DateTime<Tz>> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .with_context(|| format!("Invalid date/time: {}", s))?;

    tz.from_local_datetime(&naive)
        .single()
        .ok_or_else(|| anyhow::anyhow!("Ambiguous or invalid local time: {}", s))
}

fn parse_timing(cli: &Cli, tz: Tz, duration: chrono::Duration) -> Result<EventTiming> {
    if let Ok(date) = NaiveDate::parse_from_str(&cli.start, "%Y-%m-%d") {
        return Ok(EventTiming::AllDay(date));
    }

    let start = parse_datetime(&cli.start, tz)?;
    let end = match &cli.end {
        Some(end) => parse_datetime(end, tz)?,
        None => start + duration,
    };
    anyhow::ensure!(end > start, "End {} is not after start {}", end, start);

    Ok(EventTiming::Timed { start, end })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let mut required = suffcal::config::Required::new();
    let settings = cli.calendar.resolve(&mut required)?;
    required.finish()?;

    let timing = parse_timing(&cli, settings.timezone, settings.event_duration)?;

    let client = CalDavClient::connect(&settings.url, &settings.user, &settings.password)
        .await
        .context("Failed to connect to the calendar server")?;
    let calendar = client.calendar(&settings.name)?;

    println!("Adding event: {}", cli.summary);
    match &timing {
        EventTiming::AllDay(date) => println!("  All day: {}", date),
        EventTiming::Timed { start, end } => {
            println!("  Start: {}", start);
            println!("  End:   {}", end);
        }
    }

    let uid = Uuid::new_v4().to_string();
    let body = ical_entry(
        &uid,
        &cli.summary,
        cli.description.as_deref(),
        cli.location.as_deref(),
        &timing,
    );

    match client.put_event(calendar, &uid, body).await? {
        AddOutcome::Added => println!("Event added to '{}'", calendar.name),
        outcome => println!("Event not added: {:?}", outcome),
    }

    Ok(())
}
