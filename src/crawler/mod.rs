pub mod list;
pub mod paginate;

use std::{collections::HashMap, sync::Arc};

use serde_json::json;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info, warn};

use crate::{
    extract::{self, ocr::OcrEngine},
    fetch::Fetch,
    model::CrawlItem,
    repo::records,
    source::{CatalogHandle, DetailSelectors, PaginationMode, SourceCatalog, SourceConfig},
    util::{hash::document_id, time::parse_publish_time},
    wechat,
};

use list::ListEntry;

/// Placeholder content persisted when a detail page cannot be fetched,
/// so the list-page metadata is kept and the record shows up as repairable.
pub(crate) const DETAIL_UNAVAILABLE: &str = "详情页不可访问";

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("unknown source: {0}")]
    UnknownSource(String),
    #[error("no list page reachable for source {source_id}")]
    ListUnavailable { source_id: String },
    #[error("wechat session invalid or missing: {0}")]
    SessionInvalid(String),
    #[error("article unavailable: {0}")]
    ArticleUnavailable(String),
    #[error("article deleted or blocked: {0}")]
    ArticleDeleted(String),
}

/// Drives one source end to end: pagination, list parsing, bounded
/// concurrent detail processing, dedup and persistence.
#[derive(Clone)]
pub struct Crawler {
    fetcher: Arc<dyn Fetch>,
    pool: SqlitePool,
    catalog: CatalogHandle,
    ocr: OcrEngine,
    concurrency: usize,
}

/// Everything one spawned detail task needs, owned so the task is 'static.
struct DetailJob {
    fetcher: Arc<dyn Fetch>,
    pool: SqlitePool,
    ocr: OcrEngine,
    headers: Arc<HashMap<String, String>>,
    base_url: String,
    source_id: String,
    source_name: String,
    detail: Option<DetailSelectors>,
    doc_id: String,
    url: String,
    title: String,
    date: Option<String>,
    category: Option<String>,
}

impl Crawler {
    pub fn new(
        fetcher: Arc<dyn Fetch>,
        pool: SqlitePool,
        catalog: CatalogHandle,
        ocr: OcrEngine,
        concurrency: usize,
    ) -> Self {
        Self {
            fetcher,
            pool,
            catalog,
            ocr,
            concurrency: concurrency.max(1),
        }
    }

    /// Crawl one configured source and return the newly stored items.
    pub async fn crawl_source(&self, source_id: &str) -> Result<Vec<CrawlItem>, CrawlError> {
        let catalog = self.catalog.current();
        let source = catalog
            .source(source_id)
            .ok_or_else(|| CrawlError::UnknownSource(source_id.to_string()))?
            .clone();

        info!("crawling source {} ({})", source.id, source.name);
        let entries = self.collect_entries(&source).await?;
        debug!(source = %source.id, entries = entries.len(), "list pages parsed");

        let (items, skipped) = self.process_entries(&catalog, &source, entries).await;
        let failed = items
            .iter()
            .filter(|item| item.content == DETAIL_UNAVAILABLE)
            .count();
        if items.is_empty() {
            info!(skipped, failed, "{}: no new items", source.id);
        } else {
            info!(
                skipped,
                failed,
                "[SUCCESS] {}: {} new items",
                source.id,
                items.len()
            );
        }
        Ok(items)
    }

    /// Walk every list page for the source's pagination mode and collect raw
    /// entries. Individual page failures are skipped; only total failure with
    /// nothing collected is an error.
    async fn collect_entries(&self, source: &SourceConfig) -> Result<Vec<ListEntry>, CrawlError> {
        let mut entries = Vec::new();
        let mut failed_pages = 0u32;

        match source.pagination_mode {
            PaginationMode::Forward => {
                let Some(list_url) = source.list_url.as_deref() else {
                    warn!(source = %source.id, "forward source has no list_url");
                    return Ok(entries);
                };
                for page_url in paginate::forward_page_urls(list_url, source.max_pages) {
                    match self.fetcher.get_text(&page_url, &source.headers).await {
                        Ok(html) => {
                            let page_entries =
                                list::parse_list_html(&html, &source.base_url, &source.selectors);
                            if page_entries.is_empty() {
                                info!(source = %source.id, url = %page_url, "empty list page, stopping pagination");
                                break;
                            }
                            entries.extend(page_entries);
                        }
                        Err(err) => {
                            warn!(source = %source.id, url = %page_url, error = %err, "list page fetch failed");
                            failed_pages += 1;
                        }
                    }
                }
            }
            PaginationMode::Reverse => {
                let Some(list_url) = source.list_url.as_deref() else {
                    warn!(source = %source.id, "reverse source has no list_url");
                    return Ok(entries);
                };
                let first = match self.fetcher.get_text(list_url, &source.headers).await {
                    Ok(html) => html,
                    Err(err) => {
                        warn!(source = %source.id, url = %list_url, error = %err, "first list page fetch failed");
                        return Err(CrawlError::ListUnavailable {
                            source_id: source.id.clone(),
                        });
                    }
                };
                entries.extend(list::parse_list_html(
                    &first,
                    &source.base_url,
                    &source.selectors,
                ));
                let max_page = paginate::max_page_index(&first, list_url).unwrap_or(1);
                for page_url in paginate::reverse_page_urls(list_url, max_page, source.max_pages) {
                    match self.fetcher.get_text(&page_url, &source.headers).await {
                        Ok(html) => entries.extend(list::parse_list_html(
                            &html,
                            &source.base_url,
                            &source.selectors,
                        )),
                        Err(err) => {
                            warn!(source = %source.id, url = %page_url, error = %err, "list page fetch failed");
                            failed_pages += 1;
                        }
                    }
                }
            }
            PaginationMode::Api => {
                let Some(api_url) = source.api_url.as_deref() else {
                    warn!(source = %source.id, "api source has no api_url");
                    return Ok(entries);
                };
                for page in 1..=source.max_pages.max(1) {
                    let mut payload = source.payload.clone();
                    payload.insert("pageno".to_string(), page.to_string());
                    payload.insert("hasPage".to_string(), "true".to_string());
                    match self.fetcher.post_api(api_url, &payload, &source.headers).await {
                        Ok(response) => {
                            let page_entries = list::parse_api_entries(
                                &response,
                                &source.base_url,
                                &source.selectors,
                            );
                            if page_entries.is_empty() {
                                info!(source = %source.id, page, "empty api page, stopping pagination");
                                break;
                            }
                            entries.extend(page_entries);
                        }
                        Err(err) => {
                            warn!(source = %source.id, page, error = %err, "api page fetch failed");
                            failed_pages += 1;
                        }
                    }
                }
            }
        }

        if entries.is_empty() && failed_pages > 0 {
            return Err(CrawlError::ListUnavailable {
                source_id: source.id.clone(),
            });
        }
        Ok(entries)
    }

    /// Fan detail work out over a JoinSet, each task holding a semaphore
    /// permit for its full lifetime so fetch, OCR and attachment parsing all
    /// count against the concurrency bound. Returns the new items plus the
    /// number of entries skipped as already stored.
    async fn process_entries(
        &self,
        catalog: &SourceCatalog,
        source: &SourceConfig,
        entries: Vec<ListEntry>,
    ) -> (Vec<CrawlItem>, usize) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let headers = Arc::new(source.headers.clone());
        let mut tasks: JoinSet<Option<CrawlItem>> = JoinSet::new();
        let mut skipped = 0usize;

        for entry in entries {
            let Some(url) = entry.url else {
                debug!(source = %source.id, title = %entry.title, "list entry without url, skipping");
                continue;
            };
            let doc_id = document_id(&url);
            match records::record_exists(&self.pool, &doc_id, Some(&url)).await {
                Ok(true) => {
                    debug!(url = %url, "already stored, skipping");
                    skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(url = %url, error = %err, "dedup lookup failed, processing anyway");
                }
            }

            let job = DetailJob {
                fetcher: Arc::clone(&self.fetcher),
                pool: self.pool.clone(),
                ocr: self.ocr.clone(),
                headers: Arc::clone(&headers),
                base_url: source.base_url.clone(),
                source_id: source.id.clone(),
                source_name: source.name.clone(),
                detail: catalog.detail_selectors_for(Some(source), &url).cloned(),
                doc_id,
                url,
                title: entry.title,
                date: entry.date,
                category: entry.category,
            };
            let permit_source = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let Ok(_permit) = permit_source.acquire_owned().await else {
                    return None;
                };
                Some(process_detail(job).await)
            });
        }

        let mut items = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "detail task aborted"),
            }
        }
        (items, skipped)
    }
}

/// Fetch and extract one detail page, then persist the result. A fetch
/// failure still yields an item carrying the placeholder content so the
/// entry is recorded and later repairable.
async fn process_detail(job: DetailJob) -> CrawlItem {
    let (content, attachments, parsed_title) =
        match job.fetcher.get_text(&job.url, &job.headers).await {
            Ok(html) => {
                if wechat::is_article_url(&job.url) {
                    let article = wechat::article::parse_article(&html);
                    (article.content, Vec::new(), article.title)
                } else {
                    let extraction = extract::extract_detail(
                        job.fetcher.as_ref(),
                        &job.ocr,
                        &html,
                        &job.url,
                        &job.base_url,
                        &job.headers,
                        job.detail.as_ref(),
                    )
                    .await;
                    (extraction.content, extraction.attachments, None)
                }
            }
            Err(err) => {
                warn!(url = %job.url, error = %err, "detail page fetch failed");
                (DETAIL_UNAVAILABLE.to_string(), Vec::new(), None)
            }
        };

    let title = if job.title.is_empty() {
        parsed_title.unwrap_or_default()
    } else {
        job.title
    };
    let item = CrawlItem {
        id: job.doc_id,
        title,
        content,
        url: job.url,
        publish_time: parse_publish_time(job.date.as_deref()).time,
        source: job.source_name,
        attachments: (!attachments.is_empty()).then_some(attachments),
        extra_meta: Some(json!({ "category": job.category })),
    };

    if let Err(err) = records::store_document(&job.pool, &item, &job.source_id).await {
        warn!(id = %item.id, error = %err, "failed to persist crawled record");
    }
    item
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fetch::FetchError, repo};
    use async_trait::async_trait;
    use std::{
        path::PathBuf,
        sync::atomic::{AtomicUsize, Ordering},
    };

    struct ScriptedFetch {
        pages: HashMap<String, String>,
        calls: AtomicUsize,
    }

    impl ScriptedFetch {
        fn new(pages: &[(&str, &str)]) -> Self {
            Self {
                pages: pages
                    .iter()
                    .map(|(url, body)| (url.to_string(), body.to_string()))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Fetch for ScriptedFetch {
        async fn get_text(
            &self,
            url: &str,
            _headers: &HashMap<String, String>,
        ) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.pages.get(url).cloned().ok_or_else(|| FetchError {
                url: url.to_string(),
                attempts: 1,
            })
        }

        async fn get_bytes(
            &self,
            url: &str,
            _headers: &HashMap<String, String>,
        ) -> Result<Vec<u8>, FetchError> {
            Err(FetchError {
                url: url.to_string(),
                attempts: 1,
            })
        }

        async fn post_api(
            &self,
            url: &str,
            payload: &HashMap<String, String>,
            _headers: &HashMap<String, String>,
        ) -> Result<serde_json::Value, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let key = format!("{}#{}", url, payload.get("pageno").cloned().unwrap_or_default());
            self.pages
                .get(&key)
                .and_then(|body| serde_json::from_str(body).ok())
                .ok_or_else(|| FetchError {
                    url: url.to_string(),
                    attempts: 1,
                })
        }
    }

    fn test_source(mode: PaginationMode) -> SourceConfig {
        SourceConfig {
            id: "campus".to_string(),
            name: "校园通知".to_string(),
            base_url: "https://a.b".to_string(),
            pagination_mode: mode,
            list_url: Some("https://a.b/list1.htm".to_string()),
            api_url: Some("https://a.b/api/list".to_string()),
            payload: HashMap::new(),
            max_pages: 2,
            headers: HashMap::new(),
            selectors: crate::source::ListSelectors {
                item_container: Some("li".to_string()),
                title: Some("a".to_string()),
                date: Some(".date".to_string()),
                url: Some("a".to_string()),
                category: None,
            },
            detail: Some(DetailSelectors {
                text: Some(crate::source::TextRule {
                    container: "#body".to_string(),
                    content: None,
                }),
                ..DetailSelectors::default()
            }),
        }
    }

    async fn crawler_with(fetch: Arc<dyn Fetch>, source: SourceConfig) -> Crawler {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        repo::migrations::ensure_schema(&pool).await.unwrap();
        let catalog = SourceCatalog {
            sources: vec![source],
            detail_selectors: Vec::new(),
            wechat_sources: Vec::new(),
        };
        Crawler::new(
            fetch,
            pool,
            CatalogHandle::new(PathBuf::from("unused"), catalog),
            OcrEngine::default(),
            2,
        )
    }

    #[tokio::test]
    async fn unknown_source_is_rejected() {
        let crawler = crawler_with(
            Arc::new(ScriptedFetch::new(&[])),
            test_source(PaginationMode::Forward),
        )
        .await;
        let err = crawler.crawl_source("nope").await.unwrap_err();
        assert!(matches!(err, CrawlError::UnknownSource(_)));
    }

    #[tokio::test]
    async fn forward_crawl_stores_and_returns_items() {
        let list_page = r#"<ul>
            <li><a href="/info/1.htm">第一条</a><span class="date">2024-03-05</span></li>
        </ul>"#;
        let fetch = Arc::new(ScriptedFetch::new(&[
            ("https://a.b/list1.htm", list_page),
            (
                "https://a.b/info/1.htm",
                r#"<div id="body">正文内容</div>"#,
            ),
        ]));
        let crawler = crawler_with(fetch, test_source(PaginationMode::Forward)).await;

        let items = crawler.crawl_source("campus").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content, "正文内容");
        assert_eq!(items[0].source, "校园通知");
        assert_eq!(items[0].id, document_id("https://a.b/info/1.htm"));

        let stored = records::record_exists(&crawler.pool, &items[0].id, None)
            .await
            .unwrap();
        assert!(stored);
    }

    #[tokio::test]
    async fn second_crawl_skips_already_stored_entries() {
        let list_page = r#"<ul>
            <li><a href="/info/1.htm">公告</a><span class="date">2024-03-05</span></li>
        </ul>"#;
        let fetch = Arc::new(ScriptedFetch::new(&[
            ("https://a.b/list1.htm", list_page),
            ("https://a.b/info/1.htm", r#"<div id="body">正文</div>"#),
        ]));
        let crawler = crawler_with(fetch, test_source(PaginationMode::Forward)).await;

        let first = crawler.crawl_source("campus").await.unwrap();
        assert_eq!(first.len(), 1);
        let second = crawler.crawl_source("campus").await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn unreachable_detail_page_keeps_placeholder_record() {
        let list_page = r#"<ul>
            <li><a href="/info/gone.htm">失联公告</a><span class="date">2024-03-05</span></li>
        </ul>"#;
        let fetch = Arc::new(ScriptedFetch::new(&[("https://a.b/list1.htm", list_page)]));
        let crawler = crawler_with(fetch, test_source(PaginationMode::Forward)).await;

        let items = crawler.crawl_source("campus").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content, DETAIL_UNAVAILABLE);
        assert_eq!(items[0].title, "失联公告");
    }

    #[tokio::test]
    async fn all_list_pages_failing_is_upstream_error() {
        let fetch = Arc::new(ScriptedFetch::new(&[]));
        let crawler = crawler_with(fetch, test_source(PaginationMode::Forward)).await;
        let err = crawler.crawl_source("campus").await.unwrap_err();
        assert!(matches!(err, CrawlError::ListUnavailable { .. }));
    }

    #[tokio::test]
    async fn api_pagination_stops_on_empty_page() {
        let mut source = test_source(PaginationMode::Api);
        source.max_pages = 5;
        let fetch = Arc::new(ScriptedFetch::new(&[
            (
                "https://a.b/api/list#1",
                r#"{"infolist": [{"title": "通知", "releasetime": "2024-03-05", "url": "/info/9.htm"}]}"#,
            ),
            ("https://a.b/api/list#2", r#"{"infolist": []}"#),
            (
                "https://a.b/info/9.htm",
                r#"<div id="body">正文</div>"#,
            ),
        ]));
        let probe = Arc::clone(&fetch);
        let crawler = crawler_with(fetch, source).await;

        let items = crawler.crawl_source("campus").await.unwrap();
        assert_eq!(items.len(), 1);
        // Two api pages plus one detail page; pages 3..5 never requested.
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    /// Serves one list page, then stalls every detail fetch long enough for
    /// the whole batch to queue up, recording the in-flight high-water mark.
    struct GatedFetch {
        list_page: String,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl Fetch for GatedFetch {
        async fn get_text(
            &self,
            url: &str,
            _headers: &HashMap<String, String>,
        ) -> Result<String, FetchError> {
            if url.ends_with("list1.htm") {
                return Ok(self.list_page.clone());
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(r#"<div id="body">正文</div>"#.to_string())
        }

        async fn get_bytes(
            &self,
            url: &str,
            _headers: &HashMap<String, String>,
        ) -> Result<Vec<u8>, FetchError> {
            Err(FetchError {
                url: url.to_string(),
                attempts: 1,
            })
        }

        async fn post_api(
            &self,
            url: &str,
            _payload: &HashMap<String, String>,
            _headers: &HashMap<String, String>,
        ) -> Result<serde_json::Value, FetchError> {
            Err(FetchError {
                url: url.to_string(),
                attempts: 1,
            })
        }
    }

    #[tokio::test]
    async fn detail_fetches_never_exceed_the_concurrency_limit() {
        let rows: String = (1..=8)
            .map(|n| {
                format!(
                    r#"<li><a href="/info/{n}.htm">第{n}条</a><span class="date">2024-03-05</span></li>"#
                )
            })
            .collect();
        let fetch = Arc::new(GatedFetch {
            list_page: format!("<ul>{rows}</ul>"),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let probe = Arc::clone(&fetch);
        let mut source = test_source(PaginationMode::Forward);
        source.max_pages = 1;
        let crawler = crawler_with(fetch, source).await;

        let items = crawler.crawl_source("campus").await.unwrap();
        assert_eq!(items.len(), 8);
        // The crawler was built with a limit of 2: saturated, never exceeded.
        assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reverse_crawl_walks_back_from_max_page() {
        let first_page = r#"<ul>
            <li><a href="/info/10.htm">第十条</a><span class="date">2024-03-05</span></li>
            </ul>
            <div class="page"><a href="list/3.htm">尾页</a></div>"#;
        let older_page = r#"<ul>
            <li><a href="/info/2.htm">第二条</a><span class="date">2024-03-01</span></li>
        </ul>"#;
        let mut source = test_source(PaginationMode::Reverse);
        source.list_url = Some("https://a.b/tzgg/list.htm".to_string());
        source.max_pages = 2;
        let fetch = Arc::new(ScriptedFetch::new(&[
            ("https://a.b/tzgg/list.htm", first_page),
            ("https://a.b/tzgg/list/2.htm", older_page),
            ("https://a.b/info/10.htm", r#"<div id="body">十</div>"#),
            ("https://a.b/info/2.htm", r#"<div id="body">二</div>"#),
        ]));
        let crawler = crawler_with(fetch, source).await;

        let mut items = crawler.crawl_source("campus").await.unwrap();
        items.sort_by(|a, b| a.url.cmp(&b.url));
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].url, "https://a.b/info/10.htm");
        assert_eq!(items[1].url, "https://a.b/info/2.htm");
    }
}
