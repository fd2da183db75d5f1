//! Instagram mobile API client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::Value;
use shared_types::MediaType;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{MediaSource, Post};
use crate::error::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "https://i.instagram.com/api/v1";

const APP_USER_AGENT: &str = "Instagram 269.0.0.18.75 Android (26/8.0.0; 480dpi; 1080x1920; \
    OnePlus; 6T Dev; devitron; qcom; en_US; 314665256)";
const APP_ID: &str = "567067343352427";

/// Largest page the feed endpoint hands out
const FEED_PAGE_SIZE: usize = 33;

/// Client for interacting with the Instagram private API
pub struct InstagramClient {
    http: Client,
    base_url: String,
    authorization: Option<String>,
    device_id: String,
    phone_id: String,
    guid: String,
    logged_in_user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    logged_in_user: Option<LoggedInUser>,
}

#[derive(Debug, Deserialize)]
struct LoggedInUser {
    #[serde(deserialize_with = "deserialize_pk")]
    pk: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct FailureResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    two_factor_required: bool,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    user: UserInfo,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(deserialize_with = "deserialize_pk")]
    pk: String,
}

#[derive(Debug, Deserialize)]
struct FeedResponse {
    #[serde(default)]
    items: Vec<FeedItem>,
    #[serde(default)]
    more_available: bool,
    #[serde(default)]
    next_max_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeedItem {
    #[serde(deserialize_with = "deserialize_pk")]
    pk: String,
    media_type: u64,
    #[serde(default)]
    taken_at: Option<i64>,
    #[serde(default)]
    caption: Option<Caption>,
    #[serde(default)]
    user: Option<FeedUser>,
    #[serde(default)]
    image_versions2: Option<ImageVersions>,
}

#[derive(Debug, Deserialize)]
struct Caption {
    text: String,
}

#[derive(Debug, Deserialize)]
struct FeedUser {
    username: String,
}

#[derive(Debug, Deserialize)]
struct ImageVersions {
    #[serde(default)]
    candidates: Vec<ImageCandidate>,
}

#[derive(Debug, Deserialize)]
struct ImageCandidate {
    url: String,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
}

/// Media ids come as numbers or strings depending on the endpoint
fn deserialize_pk<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected pk as string or number, got {}",
            other
        ))),
    }
}

impl FeedItem {
    fn into_post(self) -> Post {
        let image_url = self.image_versions2.and_then(|versions| {
            versions
                .candidates
                .into_iter()
                .max_by_key(|c| u64::from(c.width) * u64::from(c.height))
                .map(|c| c.url)
        });

        Post {
            pk: self.pk,
            media_type: MediaType::from_code(self.media_type),
            taken_at: self
                .taken_at
                .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
            caption: self.caption.map(|c| c.text).filter(|t| !t.trim().is_empty()),
            username: self.user.map(|u| u.username).unwrap_or_default(),
            image_url,
        }
    }
}

impl InstagramClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(APP_USER_AGENT));
        headers.insert("X-IG-App-ID", HeaderValue::from_static(APP_ID));
        headers.insert("X-IG-Capabilities", HeaderValue::from_static("3brTvwE="));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US"));

        let http = Client::builder()
            .default_headers(headers)
            .cookie_store(true)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            authorization: None,
            device_id: format!("android-{}", &Uuid::new_v4().simple().to_string()[..16]),
            phone_id: Uuid::new_v4().to_string(),
            guid: Uuid::new_v4().to_string(),
            logged_in_user: None,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.authorization {
            Some(auth) => request.header(AUTHORIZATION, auth),
            None => request,
        }
    }

    /// Log in with username and password
    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let payload = serde_json::json!({
            "jazoest": jazoest(&self.phone_id),
            "country_codes": "[{\"country_code\":\"1\",\"source\":[\"default\"]}]",
            "phone_id": self.phone_id,
            "enc_password": format!("#PWD_INSTAGRAM:0:{}:{}", Utc::now().timestamp(), password),
            "username": username,
            "adid": Uuid::new_v4().to_string(),
            "guid": self.guid,
            "device_id": self.device_id,
            "google_tokens": "[]",
            "login_attempt_count": "0",
        });
        let signed_body = format!("SIGNATURE.{}", payload);

        let response = self
            .http
            .post(self.url("accounts/login/"))
            .form(&[("signed_body", signed_body)])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(login_failure(status, &body));
        }

        let authorization = response
            .headers()
            .get("ig-set-authorization")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string());

        let status = response.status();
        let body = response.text().await?;
        let user = serde_json::from_str::<LoginResponse>(&body)
            .ok()
            .and_then(|login| login.logged_in_user)
            .ok_or_else(|| login_failure(status, &body))?;

        tracing::info!("Logged in to Instagram as {} ({})", user.username, user.pk);
        self.authorization = authorization;
        self.logged_in_user = Some(user.pk);
        Ok(())
    }

    /// Resolve a username to its numeric user id
    pub async fn user_id_from_username(&self, username: &str) -> Result<String> {
        let path = format!("users/{}/usernameinfo/", urlencoding::encode(username));
        let response = self.authorize(self.http.get(self.url(&path))).send().await?;
        let response = check_status(response, &format!("look up user {}", username)).await?;

        let info: UserInfoResponse = response.json().await?;
        tracing::debug!("Instagram user {} has id {}", username, info.user.pk);
        Ok(info.user.pk)
    }

    /// End the session; failures only matter to the log
    pub async fn logout(&mut self) -> Result<()> {
        if self.logged_in_user.is_none() {
            return Ok(());
        }

        let response = self
            .authorize(self.http.post(self.url("accounts/logout/")))
            .form(&[("one_tap_app_login", "true")])
            .send()
            .await?;
        check_status(response, "log out").await?;

        self.authorization = None;
        self.logged_in_user = None;
        tracing::info!("Logged out of Instagram");
        Ok(())
    }
}

#[async_trait]
impl MediaSource for InstagramClient {
    async fn user_medias(&self, user_id: &str, amount: usize) -> Result<Vec<Post>> {
        let mut posts = Vec::new();
        let mut max_id: Option<String> = None;

        while posts.len() < amount {
            let count = (amount - posts.len()).min(FEED_PAGE_SIZE).to_string();
            let mut query = vec![("count", count)];
            if let Some(ref id) = max_id {
                query.push(("max_id", id.clone()));
            }

            let path = format!("feed/user/{}/", user_id);
            let response = self
                .authorize(self.http.get(self.url(&path)))
                .query(&query)
                .send()
                .await?;
            let response = check_status(response, "fetch user feed").await?;
            let feed: FeedResponse = response.json().await?;

            let page_len = feed.items.len();
            posts.extend(feed.items.into_iter().map(FeedItem::into_post));

            match feed.next_max_id {
                Some(next)
                    if feed.more_available
                        && page_len > 0
                        && max_id.as_deref() != Some(next.as_str()) =>
                {
                    max_id = Some(next)
                }
                _ => break,
            }
        }

        posts.truncate(amount);
        Ok(posts)
    }

    async fn download_photo(&self, post: &Post, folder: &Path) -> Result<PathBuf> {
        let url = post
            .image_url
            .as_deref()
            .ok_or_else(|| Error::instagram(format!("post {} has no image", post.pk)))?;

        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Download {
                url: url.to_string(),
                reason: format!("status {}", response.status()),
            });
        }
        let bytes = response.bytes().await?;

        let path = folder.join(format!("{}.jpg", post.file_stem()));
        tokio::fs::write(&path, &bytes).await?;
        Ok(path)
    }
}

async fn check_status(response: Response, action: &str) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<FailureResponse>(&body)
        .ok()
        .and_then(|f| f.message)
        .unwrap_or(body);
    Err(Error::instagram(format!(
        "Failed to {} ({}): {}",
        action, status, message
    )))
}

fn login_failure(status: reqwest::StatusCode, body: &str) -> Error {
    let failure = match serde_json::from_str::<FailureResponse>(body) {
        Ok(f) => f,
        Err(_) => return Error::InstagramLogin(format!("status {}: {}", status, body)),
    };

    if failure.two_factor_required {
        return Error::InstagramLogin("two factor authentication required".to_string());
    }

    let message = failure.message.unwrap_or_else(|| status.to_string());
    match failure.error_type.as_deref() {
        Some(kind) => Error::InstagramLogin(format!("{}: {}", kind, message)),
        None => Error::InstagramLogin(message),
    }
}

/// Checksum field Instagram expects next to the phone id
fn jazoest(phone_id: &str) -> String {
    let sum: u32 = phone_id.bytes().map(u32::from).sum();
    format!("2{}", sum)
}
