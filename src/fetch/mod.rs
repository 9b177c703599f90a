use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chardetng::EncodingDetector;
use encoding_rs::Encoding;
use reqwest::{
    header::{HeaderMap, CONTENT_TYPE},
    Client, RequestBuilder,
};
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

/// Target sites run anti-bot heuristics, so every request presents a plain
/// desktop browser identity rather than a crawler one.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
#[error("failed to fetch {url} after {attempts} attempts")]
pub struct FetchError {
    pub url: String,
    pub attempts: u32,
}

/// Transport primitive used by the crawl pipeline. Implemented over reqwest
/// in production and by counting stubs in tests.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// GET a page and decode it to text, honoring the declared charset.
    async fn get_text(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<String, FetchError>;

    /// GET raw bytes, for attachments and images.
    async fn get_bytes(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Vec<u8>, FetchError>;

    /// POST a form payload to a JSON API. Every payload value is base64
    /// encoded first, which is what the upstream endpoints expect.
    async fn post_api(
        &self,
        url: &str,
        payload: &HashMap<String, String>,
        headers: &HashMap<String, String>,
    ) -> Result<Value, FetchError>;
}

pub struct HttpFetcher {
    client: Client,
    max_retries: u32,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64, max_retries: u32) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .cookie_store(true)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            client,
            max_retries: max_retries.max(1),
        })
    }

    /// Run one request up to `max_retries` times with linear backoff of
    /// `1 + attempt` seconds, returning response headers and body bytes.
    async fn request_bytes<F>(&self, url: &str, mut build: F) -> Result<(HeaderMap, Vec<u8>), FetchError>
    where
        F: FnMut() -> RequestBuilder,
    {
        for attempt in 0..self.max_retries {
            let outcome = async {
                let response = build().send().await?.error_for_status()?;
                let headers = response.headers().clone();
                let bytes = response.bytes().await?;
                Ok::<_, reqwest::Error>((headers, bytes.to_vec()))
            }
            .await;

            match outcome {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if attempt + 1 == self.max_retries {
                        break;
                    }
                    let wait_secs = 1 + u64::from(attempt);
                    warn!(
                        url,
                        attempt = attempt + 1,
                        error = %err,
                        "request failed, retrying in {wait_secs}s"
                    );
                    sleep(Duration::from_secs(wait_secs)).await;
                }
            }
        }

        Err(FetchError {
            url: url.to_string(),
            attempts: self.max_retries,
        })
    }

    fn apply_headers(builder: RequestBuilder, headers: &HashMap<String, String>) -> RequestBuilder {
        headers
            .iter()
            .fold(builder, |builder, (name, value)| builder.header(name, value))
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn get_text(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<String, FetchError> {
        let (response_headers, bytes) = self
            .request_bytes(url, || Self::apply_headers(self.client.get(url), headers))
            .await?;
        Ok(decode_body(&response_headers, &bytes))
    }

    async fn get_bytes(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Vec<u8>, FetchError> {
        let (_, bytes) = self
            .request_bytes(url, || Self::apply_headers(self.client.get(url), headers))
            .await?;
        Ok(bytes)
    }

    async fn post_api(
        &self,
        url: &str,
        payload: &HashMap<String, String>,
        headers: &HashMap<String, String>,
    ) -> Result<Value, FetchError> {
        let encoded: HashMap<&str, String> = payload
            .iter()
            .map(|(key, value)| (key.as_str(), BASE64.encode(value)))
            .collect();
        let has_content_type = headers
            .keys()
            .any(|name| name.eq_ignore_ascii_case("content-type"));

        let (_, bytes) = self
            .request_bytes(url, || {
                let mut builder = Self::apply_headers(self.client.post(url), headers);
                if !has_content_type {
                    builder = builder.header(
                        CONTENT_TYPE,
                        "application/x-www-form-urlencoded; charset=UTF-8",
                    );
                }
                builder.form(&encoded)
            })
            .await?;

        serde_json::from_slice(&bytes).map_err(|err| {
            warn!(url, error = %err, "API response was not valid JSON");
            FetchError {
                url: url.to_string(),
                attempts: self.max_retries,
            }
        })
    }
}

/// Decode a response body using the charset declared in Content-Type, or a
/// detector guess when the header is absent or unknown. Many of the target
/// sites still serve GBK.
fn decode_body(headers: &HeaderMap, bytes: &[u8]) -> String {
    let declared = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|content_type| {
            content_type
                .split(';')
                .find_map(|part| part.trim().strip_prefix("charset="))
        })
        .map(|charset| charset.trim_matches('"'));

    let encoding = declared
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or_else(|| {
            let mut detector = EncodingDetector::new();
            detector.feed(bytes, true);
            detector.guess(None, true)
        });

    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers_with_content_type(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn decodes_declared_gbk_charset() {
        let original = "通知公告：本科生院关于选课安排的说明";
        let (encoded, _, _) = encoding_rs::GBK.encode(original);
        let headers = headers_with_content_type("text/html; charset=GBK");
        assert_eq!(decode_body(&headers, &encoded), original);
    }

    #[test]
    fn sniffs_encoding_when_charset_missing() {
        let original = "教务处重要通知：关于本学期期末考试安排以及相关教学事项的详细说明文档";
        let (encoded, _, _) = encoding_rs::GBK.encode(original);
        let headers = HeaderMap::new();
        assert_eq!(decode_body(&headers, &encoded), original);
    }

    #[test]
    fn utf8_body_passes_through() {
        let headers = headers_with_content_type("text/html; charset=utf-8");
        assert_eq!(decode_body(&headers, "plain".as_bytes()), "plain");
    }
}
