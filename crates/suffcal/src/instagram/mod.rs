//! Instagram access: the post model and the [`MediaSource`] seam the media
//! store downloads through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared_types::{MediaType, PostMetadata};
use std::path::{Path, PathBuf};

use crate::error::Result;

mod client;

pub use client::InstagramClient;

/// A post as listed in a user's feed
#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub pk: String,
    pub media_type: Option<MediaType>,
    pub taken_at: Option<DateTime<Utc>>,
    pub caption: Option<String>,
    pub username: String,
    /// Largest image candidate
    pub image_url: Option<String>,
}

impl Post {
    /// File stem used for the downloaded photo: `<username>_<pk>`
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.username, self.pk)
    }

    pub fn metadata(&self) -> PostMetadata {
        PostMetadata {
            pk: self.pk.clone(),
            username: self.username.clone(),
            caption: self.caption.clone(),
            taken_at: self.taken_at,
            image_url: self.image_url.clone(),
        }
    }
}

/// Where posts come from
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Most recent posts of a user, newest first
    async fn user_medias(&self, user_id: &str, amount: usize) -> Result<Vec<Post>>;

    /// Download the photo of a post into `folder`, returning the written file
    async fn download_photo(&self, post: &Post, folder: &Path) -> Result<PathBuf>;
}
