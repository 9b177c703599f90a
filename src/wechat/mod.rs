pub mod article;
pub mod session;

use std::{collections::HashMap, sync::Arc};

use chrono::{TimeZone, Utc};
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::{
    crawler::CrawlError,
    fetch::Fetch,
    model::CrawlItem,
    repo::records,
    source::{CatalogHandle, WechatSourceConfig},
    util::hash::document_id,
};

use session::SessionStore;

const APPMSG_ENDPOINT: &str = "https://mp.weixin.qq.com/cgi-bin/appmsg";
const SINGLE_SOURCE_ID: &str = "wechat_single";
const SINGLE_SOURCE_NAME: &str = "微信文章";

/// Detail URLs on the MP host take the WeChat extractor instead of the
/// selector pipeline.
pub fn is_article_url(url: &str) -> bool {
    url.contains("mp.weixin.qq.com")
}

/// One row from the appmsg listing, or a bare configured URL.
struct ListedArticle {
    title: Option<String>,
    url: String,
    create_time: Option<i64>,
}

/// Crawls WeChat accounts through the MP platform using the stored
/// session, plus single-article and repair entry points.
#[derive(Clone)]
pub struct WechatCrawler {
    fetcher: Arc<dyn Fetch>,
    pool: SqlitePool,
    catalog: CatalogHandle,
    session: Arc<SessionStore>,
    concurrency: usize,
}

impl WechatCrawler {
    pub fn new(
        fetcher: Arc<dyn Fetch>,
        pool: SqlitePool,
        catalog: CatalogHandle,
        session: Arc<SessionStore>,
        concurrency: usize,
    ) -> Self {
        Self {
            fetcher,
            pool,
            catalog,
            session,
            concurrency: concurrency.max(1),
        }
    }

    /// Crawl one configured account, or every account for `"all"`. With
    /// `"all"`, per-account failures are logged and the rest continue.
    pub async fn crawl(&self, selector: &str) -> Result<Vec<CrawlItem>, CrawlError> {
        if !self.session.is_valid() {
            return Err(CrawlError::SessionInvalid(
                "token or cookies missing, update the session first".to_string(),
            ));
        }

        let catalog = self.catalog.current();
        if selector == "all" {
            let mut items = Vec::new();
            for source in &catalog.wechat_sources {
                match self.crawl_account(source).await {
                    Ok(batch) => items.extend(batch),
                    Err(err) => {
                        warn!(source = %source.id, error = %err, "wechat source crawl failed")
                    }
                }
            }
            return Ok(items);
        }

        let source = catalog
            .wechat_source(selector)
            .ok_or_else(|| CrawlError::UnknownSource(selector.to_string()))?;
        self.crawl_account(source).await
    }

    /// Crawl a single article URL and persist it under the standalone
    /// source id.
    pub async fn crawl_single(&self, url: &str) -> Result<CrawlItem, CrawlError> {
        self.crawl_single_as(url, SINGLE_SOURCE_ID, SINGLE_SOURCE_NAME)
            .await
    }

    /// Re-crawl previously failed WeChat rows. A success overwrites the row
    /// in place; a deleted-article signal removes it; anything else stays
    /// for the next cycle.
    pub async fn repair_failed(&self) {
        let failed = match records::failed_records(&self.pool, true).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "failed-record query failed");
                return;
            }
        };
        if failed.is_empty() {
            return;
        }

        info!("repairing {} failed wechat records", failed.len());
        for row in failed {
            let source_id = row
                .source_id
                .clone()
                .unwrap_or_else(|| SINGLE_SOURCE_ID.to_string());
            let source_name = row
                .source_name
                .clone()
                .unwrap_or_else(|| SINGLE_SOURCE_NAME.to_string());
            match self.crawl_single_as(&row.url, &source_id, &source_name).await {
                Ok(item) => info!(id = %item.id, "repaired wechat record"),
                Err(CrawlError::ArticleDeleted(reason)) => {
                    info!(id = %row.id, reason = %reason, "article gone, deleting stale record");
                    if let Err(err) = records::delete_record(&self.pool, &row.id).await {
                        warn!(id = %row.id, error = %err, "failed to delete stale record");
                    }
                }
                Err(err) => warn!(id = %row.id, error = %err, "repair attempt failed"),
            }
        }
    }

    async fn crawl_account(
        &self,
        source: &WechatSourceConfig,
    ) -> Result<Vec<CrawlItem>, CrawlError> {
        info!("crawling wechat source {} ({})", source.id, source.name);
        let listed = self.list_articles(source).await?;

        let mut jobs = Vec::new();
        for listing in listed {
            let doc_id = document_id(&listing.url);
            match records::record_exists(&self.pool, &doc_id, Some(&listing.url)).await {
                Ok(true) => {
                    debug!(url = %listing.url, "already stored, skipping");
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(url = %listing.url, error = %err, "dedup lookup failed, processing anyway")
                }
            }
            jobs.push((doc_id, listing));
        }

        let headers = self.session_headers();
        let items: Vec<CrawlItem> = stream::iter(jobs)
            .map(|(doc_id, listing)| {
                let headers = &headers;
                async move {
                    self.fetch_article(doc_id, listing, headers, &source.id, &source.name)
                        .await
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|item| async move { item })
            .collect()
            .await;

        if items.is_empty() {
            info!("{}: no new wechat items", source.id);
        } else {
            info!("[SUCCESS] {}: {} new wechat items", source.id, items.len());
        }
        Ok(items)
    }

    /// Recent articles for one account: explicitly configured URLs win,
    /// otherwise the MP appmsg listing is queried with the session token.
    async fn list_articles(
        &self,
        source: &WechatSourceConfig,
    ) -> Result<Vec<ListedArticle>, CrawlError> {
        if !source.article_urls.is_empty() {
            return Ok(source
                .article_urls
                .iter()
                .map(|url| ListedArticle {
                    title: None,
                    url: url.clone(),
                    create_time: None,
                })
                .collect());
        }

        let Some(biz) = source.biz.as_deref().filter(|biz| !biz.trim().is_empty()) else {
            warn!(source = %source.id, "wechat source has neither biz nor article urls");
            return Ok(Vec::new());
        };

        let session = self.session.current();
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("action", "list_ex")
            .append_pair("begin", "0")
            .append_pair("count", &source.count.to_string())
            .append_pair("fakeid", biz)
            .append_pair("type", "9")
            .append_pair("token", session.token.as_deref().unwrap_or(""))
            .append_pair("lang", "zh_CN")
            .append_pair("f", "json")
            .append_pair("ajax", "1")
            .finish();
        let listing_url = format!("{APPMSG_ENDPOINT}?{query}");

        let raw = self
            .fetcher
            .get_text(&listing_url, &self.session_headers())
            .await
            .map_err(|err| {
                warn!(source = %source.id, error = %err, "appmsg listing fetch failed");
                CrawlError::ListUnavailable {
                    source_id: source.id.clone(),
                }
            })?;
        let value: Value = serde_json::from_str(&raw).map_err(|err| {
            warn!(source = %source.id, error = %err, "appmsg listing is not json");
            CrawlError::ListUnavailable {
                source_id: source.id.clone(),
            }
        })?;

        let ret = value
            .pointer("/base_resp/ret")
            .and_then(Value::as_i64)
            .unwrap_or(-1);
        if ret != 0 {
            return Err(CrawlError::SessionInvalid(format!(
                "appmsg listing returned ret={ret}"
            )));
        }

        let Some(list) = value.get("app_msg_list").and_then(Value::as_array) else {
            return Ok(Vec::new());
        };
        Ok(list
            .iter()
            .filter_map(|entry| {
                let url = entry.get("link").and_then(Value::as_str)?.to_string();
                Some(ListedArticle {
                    title: entry
                        .get("title")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    url,
                    create_time: entry.get("create_time").and_then(Value::as_i64),
                })
            })
            .collect())
    }

    /// Fetch and store one listed article. Deleted articles and fetch
    /// failures are skipped without a row, so the next cycle retries them.
    async fn fetch_article(
        &self,
        doc_id: String,
        listing: ListedArticle,
        headers: &HashMap<String, String>,
        source_id: &str,
        source_name: &str,
    ) -> Option<CrawlItem> {
        let html = match self.fetcher.get_text(&listing.url, headers).await {
            Ok(html) => html,
            Err(err) => {
                warn!(url = %listing.url, error = %err, "wechat article fetch failed");
                return None;
            }
        };
        if let Some(marker) = article::deleted_marker(&html) {
            warn!(url = %listing.url, marker, "wechat article unavailable, skipping");
            return None;
        }

        let parsed = article::parse_article(&html);
        let title = listing
            .title
            .filter(|title| !title.trim().is_empty())
            .or(parsed.title)
            .unwrap_or_default();
        let publish_time = parsed
            .publish_time
            .or_else(|| {
                listing
                    .create_time
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            })
            .unwrap_or_else(Utc::now);

        let item = CrawlItem {
            id: doc_id,
            title,
            content: parsed.content,
            url: listing.url,
            publish_time,
            source: source_name.to_string(),
            attachments: None,
            extra_meta: Some(json!({
                "author": parsed.author,
                "raw_publish_time": parsed.raw_publish_time,
            })),
        };
        if let Err(err) = records::store_document(&self.pool, &item, source_id).await {
            warn!(id = %item.id, error = %err, "failed to persist wechat article");
        }
        Some(item)
    }

    async fn crawl_single_as(
        &self,
        url: &str,
        source_id: &str,
        source_name: &str,
    ) -> Result<CrawlItem, CrawlError> {
        let headers = self.session_headers();
        let html = self
            .fetcher
            .get_text(url, &headers)
            .await
            .map_err(|err| CrawlError::ArticleUnavailable(err.to_string()))?;
        if let Some(marker) = article::deleted_marker(&html) {
            return Err(CrawlError::ArticleDeleted(format!("{marker}: {url}")));
        }

        let parsed = article::parse_article(&html);
        let item = CrawlItem {
            id: document_id(url),
            title: parsed.title.unwrap_or_default(),
            content: parsed.content,
            url: url.to_string(),
            publish_time: parsed.publish_time.unwrap_or_else(Utc::now),
            source: source_name.to_string(),
            attachments: None,
            extra_meta: Some(json!({
                "author": parsed.author,
                "raw_publish_time": parsed.raw_publish_time,
            })),
        };
        if let Err(err) = records::store_document(&self.pool, &item, source_id).await {
            warn!(id = %item.id, error = %err, "failed to persist wechat article");
        }
        Ok(item)
    }

    /// Request headers carrying the stored cookies and user agent. Sent to
    /// both the MP API and article pages.
    fn session_headers(&self) -> HashMap<String, String> {
        let session = self.session.current();
        let mut headers = HashMap::new();
        if let Some(cookies) = session.cookies_str.filter(|value| !value.trim().is_empty()) {
            headers.insert("Cookie".to_string(), cookies);
        }
        if let Some(user_agent) = session.user_agent.filter(|value| !value.trim().is_empty()) {
            headers.insert("User-Agent".to_string(), user_agent);
        }
        headers.insert(
            "Referer".to_string(),
            "https://mp.weixin.qq.com/".to_string(),
        );
        headers
    }
}
