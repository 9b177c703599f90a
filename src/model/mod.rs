use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One file linked from a detail page, with whatever text we managed to pull
/// out of it. Extraction failures leave `text` empty rather than absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlItem {
    pub id: String,
    pub title: String,
    pub content: String,
    pub url: String,
    pub publish_time: DateTime<Utc>,
    pub source: String,
    pub attachments: Option<Vec<Attachment>>,
    pub extra_meta: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct CrawlRequest {
    pub source: String,
}

#[derive(Debug, Deserialize)]
pub struct WechatRequest {
    pub source: String,
}

#[derive(Debug, Deserialize)]
pub struct SingleRequest {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct CrawlResponse {
    pub code: String,
    pub data: Vec<CrawlItem>,
}

impl CrawlResponse {
    pub fn ok(data: Vec<CrawlItem>) -> Self {
        Self {
            code: "200".to_string(),
            data,
        }
    }
}
