//! Issue report submission.
//!
//! The report body itself is marshalled elsewhere (protobuf); this module
//! owns the submission path through the rescue fabric and the attachment
//! size ceiling.

use bytes::Bytes;
use thiserror::Error;
use url::Url;

use crate::kindling::{self, Kindling, Request};
use crate::settings::{self, Settings};

pub const DEFAULT_MAX_ATTACHMENT_SIZE: u64 = 15 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("attachment {name} is {size} bytes, over the {limit} byte ceiling")]
    AttachmentTooLarge { name: String, size: u64, limit: u64 },
    #[error("transport error: {0}")]
    Transport(#[from] kindling::Error),
    #[error("backend rejected report: {0}")]
    Rejected(reqwest::StatusCode),
}

#[derive(Clone, Debug)]
pub struct Attachment {
    pub name: String,
    pub content: Bytes,
}

#[derive(Clone, Debug, Default)]
pub struct Report {
    pub issue_type: String,
    pub description: String,
    pub email: Option<String>,
    pub device: String,
    pub model: String,
    pub os_version: String,
    pub attachments: Vec<Attachment>,
}

/// The ceiling is a knob; deployments have shipped different values.
pub fn max_attachment_size(settings: &Settings) -> u64 {
    settings
        .get_int(settings::ISSUE_MAX_ATTACHMENT_SIZE)
        .and_then(|v| u64::try_from(v).ok())
        .unwrap_or(DEFAULT_MAX_ATTACHMENT_SIZE)
}

impl Report {
    pub fn validate(&self, limit: u64) -> Result<(), Error> {
        for attachment in &self.attachments {
            let size = attachment.content.len() as u64;
            if size > limit {
                return Err(Error::AttachmentTooLarge {
                    name: attachment.name.clone(),
                    size,
                    limit,
                });
            }
        }
        Ok(())
    }
}

/// Sends an already-marshalled report body through the racing client.
pub async fn submit_raw(kindling: &Kindling, url: Url, body: Bytes) -> Result<(), Error> {
    let mut req = Request::get(url);
    req.method = reqwest::Method::POST;
    req.headers.insert(
        reqwest::header::CONTENT_TYPE,
        reqwest::header::HeaderValue::from_static("application/x-protobuf"),
    );
    req.body = body;

    let resp = kindling.send(req).await?;
    if !resp.status.is_success() {
        return Err(Error::Rejected(resp.status));
    }
    Ok(())
}
