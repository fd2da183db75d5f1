//! CalDAV calendar access.
//!
//! Discovery follows RFC 4791: the principal is read from the server URL,
//! the calendar home from the principal, and every collection in the home
//! whose resource type contains `calendar` is a calendar. Events are uploaded
//! as single-VEVENT iCalendar files with a deterministic UID, so uploading the
//! same event twice is answered with `412 Precondition Failed`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use icalendar::{Calendar, Component, EventLike};
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use reqwest::header::{CONTENT_TYPE, IF_NONE_MATCH};
use reqwest::{Client, Method, StatusCode, Url};
use shared_types::{parse_event_time, DownloadedPhoto, Event};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Summary used for events the model found no title for
pub const DEFAULT_SUMMARY: &str = "Unbenanntes Event";

const PRINCIPAL_QUERY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop><d:current-user-principal/></d:prop>
</d:propfind>"#;

const HOME_SET_QUERY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop><c:calendar-home-set/></d:prop>
</d:propfind>"#;

const CALENDARS_QUERY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop><d:resourcetype/><d:displayname/></d:prop>
</d:propfind>"#;

/// A calendar collection on the server
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarInfo {
    pub name: String,
    pub url: Url,
}

impl CalendarInfo {
    /// Last path segment of the collection URL
    pub fn slug(&self) -> String {
        last_segment(&self.url)
    }
}

/// Result of adding a single event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    NoDate,
    InPast,
    AlreadyExists,
}

/// When an event takes place, resolved against the calendar timezone
#[derive(Debug, Clone, PartialEq)]
pub enum EventTiming {
    AllDay(NaiveDate),
    Timed {
        start: DateTime<Tz>,
        end: DateTime<Tz>,
    },
}

impl EventTiming {
    pub fn is_past(&self, now: &DateTime<Tz>) -> bool {
        match self {
            EventTiming::AllDay(date) => *date < now.date_naive(),
            EventTiming::Timed { start, .. } => start < now,
        }
    }
}

/// Where extracted events end up
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Add the `index`-th event extracted from a photo
    async fn add_event(&self, event: &Event, index: usize) -> Result<AddOutcome>;
}

pub struct CalDavClient {
    http: Client,
    user: String,
    password: String,
    calendars: Vec<CalendarInfo>,
}

impl CalDavClient {
    /// Log in and discover the user's calendars
    pub async fn connect(url: &str, user: &str, password: &str) -> Result<Self> {
        let base = Url::parse(url)
            .map_err(|e| Error::Config(format!("Invalid calendar URL {}: {}", url, e)))?;

        let mut client = Self {
            http: Client::builder().build()?,
            user: user.to_string(),
            password: password.to_string(),
            calendars: Vec::new(),
        };

        let principal = match client
            .propfind(&base, 0, PRINCIPAL_QUERY)
            .await?
            .into_iter()
            .find_map(|r| r.principal)
        {
            Some(href) => resolve(&base, &href)?,
            None => base.clone(),
        };
        tracing::debug!("CalDAV principal: {}", principal);

        let home = match client
            .propfind(&principal, 0, HOME_SET_QUERY)
            .await?
            .into_iter()
            .find_map(|r| r.home_set)
        {
            Some(href) => resolve(&principal, &href)?,
            None => principal.clone(),
        };
        tracing::debug!("CalDAV calendar home: {}", home);

        let mut calendars = Vec::new();
        for response in client.propfind(&home, 1, CALENDARS_QUERY).await? {
            if !response.is_calendar {
                continue;
            }
            let url = collection_url(resolve(&home, &response.href)?);
            let name = response
                .display_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| last_segment(&url));
            calendars.push(CalendarInfo { name, url });
        }

        tracing::info!(
            "Found {} calendar(s): {}",
            calendars.len(),
            calendar_names(&calendars)
        );
        client.calendars = calendars;
        Ok(client)
    }

    pub fn calendars(&self) -> &[CalendarInfo] {
        &self.calendars
    }

    /// Find a calendar by display name, falling back to its URL segment
    pub fn calendar(&self, name: &str) -> Result<&CalendarInfo> {
        self.calendars
            .iter()
            .find(|c| c.name == name)
            .or_else(|| self.calendars.iter().find(|c| c.slug() == name))
            .ok_or_else(|| Error::CalendarNotFound {
                name: name.to_string(),
                available: calendar_names(&self.calendars),
            })
    }

    /// Upload an extracted event unless it has no date or lies in the past
    pub async fn add_event(
        &self,
        calendar: &CalendarInfo,
        event: &Event,
        index: usize,
        timezone: Tz,
        duration: Duration,
    ) -> Result<AddOutcome> {
        let Some(timing) = event_timing(event, timezone, duration) else {
            tracing::info!("Not adding event without date: {}", event);
            return Ok(AddOutcome::NoDate);
        };

        if timing.is_past(&Utc::now().with_timezone(&timezone)) {
            tracing::info!("Not adding event, it is in the past: {}", event);
            return Ok(AddOutcome::InPast);
        }

        let uid = event_uid(event, index);
        let body = ical_body(event, &uid, &timing);
        self.put_event(calendar, &uid, body).await
    }

    /// Store a raw iCalendar file, refusing to overwrite an existing one
    pub async fn put_event(
        &self,
        calendar: &CalendarInfo,
        uid: &str,
        body: String,
    ) -> Result<AddOutcome> {
        let url = resolve(&calendar.url, &format!("{}.ics", uid))?;

        let response = self
            .http
            .put(url.clone())
            .basic_auth(&self.user, Some(&self.password))
            .header(CONTENT_TYPE, "text/calendar; charset=utf-8")
            .header(IF_NONE_MATCH, "*")
            .body(body)
            .send()
            .await?;

        match response.status() {
            StatusCode::PRECONDITION_FAILED => {
                tracing::info!("Event {} already exists in '{}'", uid, calendar.name);
                Ok(AddOutcome::AlreadyExists)
            }
            status if status.is_success() => {
                tracing::info!("Added event {} to '{}'", uid, calendar.name);
                Ok(AddOutcome::Added)
            }
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(Error::caldav(format!(
                    "PUT {} returned {}: {}",
                    url,
                    status,
                    text.trim()
                )))
            }
        }
    }

    async fn propfind(&self, url: &Url, depth: u8, body: &'static str) -> Result<Vec<DavResponse>> {
        let method = Method::from_bytes(b"PROPFIND").map_err(|e| Error::caldav(e.to_string()))?;

        let response = self
            .http
            .request(method, url.clone())
            .basic_auth(&self.user, Some(&self.password))
            .header("Depth", depth.to_string())
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::caldav(format!("Authentication failed for {}", url)));
        }
        if !status.is_success() {
            return Err(Error::caldav(format!(
                "PROPFIND {} returned {}: {}",
                url,
                status,
                text.trim()
            )));
        }

        parse_multistatus(&text)
    }
}

/// A calendar together with the settings events are written with
pub struct CalendarWriter {
    client: CalDavClient,
    calendar: CalendarInfo,
    timezone: Tz,
    duration: Duration,
}

impl CalendarWriter {
    pub fn new(client: CalDavClient, name: &str, timezone: Tz, duration: Duration) -> Result<Self> {
        let calendar = client.calendar(name)?.clone();
        tracing::info!("Writing events to calendar '{}' ({})", calendar.name, calendar.url);
        Ok(Self {
            client,
            calendar,
            timezone,
            duration,
        })
    }
}

#[async_trait]
impl EventSink for CalendarWriter {
    async fn add_event(&self, event: &Event, index: usize) -> Result<AddOutcome> {
        self.client
            .add_event(&self.calendar, event, index, self.timezone, self.duration)
            .await
    }
}

/// Start and end of an event, or `None` when it has no date.
///
/// A date without a time of day becomes timed when the model's time text can
/// be read (`19:30`, `19.30`, `19 Uhr`), and all-day otherwise.
pub fn event_timing(event: &Event, timezone: Tz, duration: Duration) -> Option<EventTiming> {
    let date = event.date?;

    let time = if date.hour() != 0 || date.minute() != 0 || date.second() != 0 {
        Some(date.time())
    } else {
        event.time.as_deref().and_then(parse_event_time)
    };

    match time.and_then(|t| localize(timezone, date.date().and_time(t))) {
        Some(start) => Some(EventTiming::Timed {
            start,
            end: start + duration,
        }),
        None => Some(EventTiming::AllDay(date.date())),
    }
}

fn localize(timezone: Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    // Times inside a DST gap move forward by an hour
    timezone
        .from_local_datetime(&local)
        .earliest()
        .or_else(|| timezone.from_local_datetime(&(local + Duration::hours(1))).earliest())
}

/// Stable UID of the `index`-th event read from a photo
pub fn event_uid(event: &Event, index: usize) -> String {
    let photo_id = DownloadedPhoto::new(&event.source).id();
    let key = format!(
        "{}:{}:{}",
        photo_id,
        index,
        event.title.as_deref().unwrap_or_default()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

/// iCalendar file with a single VEVENT for an extracted event
pub fn ical_body(event: &Event, uid: &str, timing: &EventTiming) -> String {
    ical_entry(
        uid,
        event.title.as_deref().unwrap_or(DEFAULT_SUMMARY),
        Some(&format!("Original text: {}", event.original_text)),
        event.location.as_deref(),
        timing,
    )
}

/// iCalendar file with a single VEVENT
pub fn ical_entry(
    uid: &str,
    summary: &str,
    description: Option<&str>,
    location: Option<&str>,
    timing: &EventTiming,
) -> String {
    let mut entry = icalendar::Event::new();
    entry.uid(uid).summary(summary);

    if let Some(description) = description {
        entry.description(description);
    }
    if let Some(location) = location {
        entry.location(location);
    }

    match timing {
        EventTiming::AllDay(date) => {
            entry.all_day(*date);
        }
        EventTiming::Timed { start, end } => {
            entry
                .starts(start.with_timezone(&Utc))
                .ends(end.with_timezone(&Utc));
        }
    }

    Calendar::new().push(entry.done()).done().to_string()
}

fn resolve(base: &Url, href: &str) -> Result<Url> {
    base.join(href)
        .map_err(|e| Error::caldav(format!("Invalid href {}: {}", href, e)))
}

fn collection_url(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn last_segment(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| segment.to_string())
        })
        .unwrap_or_default()
}

fn calendar_names(calendars: &[CalendarInfo]) -> String {
    calendars
        .iter()
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// The properties suffcal reads from one `<response>` of a multistatus body
#[derive(Debug, Default, Clone, PartialEq)]
struct DavResponse {
    href: String,
    display_name: Option<String>,
    is_calendar: bool,
    principal: Option<String>,
    home_set: Option<String>,
}

fn parse_multistatus(xml: &str) -> Result<Vec<DavResponse>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut responses = Vec::new();
    let mut current: Option<DavResponse> = None;

    loop {
        match reader.read_event()? {
            XmlEvent::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                if name == b"response" {
                    current = Some(DavResponse::default());
                }
                mark_calendar(&stack, &name, current.as_mut());
                stack.push(name);
            }
            XmlEvent::Empty(e) => {
                mark_calendar(&stack, e.local_name().as_ref(), current.as_mut());
            }
            XmlEvent::Text(e) => {
                let text = e.unescape()?.trim().to_string();
                let (Some(response), Some(top)) = (current.as_mut(), stack.last()) else {
                    continue;
                };
                let parent = stack
                    .len()
                    .checked_sub(2)
                    .map(|i| stack[i].as_slice());

                match (top.as_slice(), parent) {
                    (b"href", Some(b"response")) => response.href = text,
                    (b"href", Some(b"current-user-principal")) => response.principal = Some(text),
                    (b"href", Some(b"calendar-home-set")) => response.home_set = Some(text),
                    (b"displayname", _) => response.display_name = Some(text),
                    _ => {}
                }
            }
            XmlEvent::End(e) => {
                stack.pop();
                if e.local_name().as_ref() == b"response" {
                    if let Some(response) = current.take() {
                        responses.push(response);
                    }
                }
            }
            XmlEvent::Eof => break,
            _ => {}
        }
    }

    Ok(responses)
}

fn mark_calendar(stack: &[Vec<u8>], name: &[u8], current: Option<&mut DavResponse>) {
    let in_resource_type = stack.last().is_some_and(|top| top == b"resourcetype");
    if let (true, b"calendar", Some(response)) = (in_resource_type, name, current) {
        response.is_calendar = true;
    }
}
