use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    api,
    config::AppConfig,
    crawler::Crawler,
    extract::ocr::OcrEngine,
    fetch::{Fetch, HttpFetcher},
    repo,
    scheduler::Scheduler,
    source::{CatalogHandle, SourceCatalog},
    wechat::{session::SessionStore, WechatCrawler},
};

#[derive(Clone)]
pub struct AppState {
    pub crawler: Crawler,
    pub wechat: WechatCrawler,
    pub session: Arc<SessionStore>,
    pub scheduler: Arc<Scheduler>,
}

/// Assemble the full service: database, fetcher, catalogs, crawlers and
/// routes. The scheduler handle is returned alongside the router so the
/// caller owns its lifecycle.
pub async fn build_router(config: &AppConfig) -> anyhow::Result<(Router, Arc<Scheduler>)> {
    let pool = connect_db(&config.db.path, config.db.max_connections).await?;
    repo::migrations::ensure_schema(&pool).await?;

    let fetcher: Arc<dyn Fetch> = Arc::new(HttpFetcher::new(
        config.crawler.request_timeout_secs,
        config.crawler.max_retries,
    )?);
    let ocr = OcrEngine::new(
        &config.ocr.command,
        &config.ocr.tessdata_dir,
        &config.ocr.languages,
    );

    let sources_dir = PathBuf::from(&config.crawler.sources_dir);
    let catalog = CatalogHandle::new(sources_dir.clone(), SourceCatalog::load(&sources_dir));
    let session = Arc::new(SessionStore::load(PathBuf::from(
        &config.crawler.session_file,
    )));

    let crawler = Crawler::new(
        Arc::clone(&fetcher),
        pool.clone(),
        catalog.clone(),
        ocr,
        config.crawler.concurrency as usize,
    );
    let wechat = WechatCrawler::new(
        fetcher,
        pool,
        catalog.clone(),
        Arc::clone(&session),
        config.crawler.wechat_concurrency as usize,
    );

    let scheduler = Arc::new(Scheduler::new(
        crawler.clone(),
        wechat.clone(),
        catalog,
        Arc::clone(&session),
        config.crawler.interval_secs,
    ));
    if config.crawler.auto_crawl_enabled {
        scheduler.start();
    }

    let state = AppState {
        crawler,
        wechat,
        session,
        scheduler: Arc::clone(&scheduler),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let router = Router::new()
        .route("/healthz", get(api::health::health_check))
        .route("/api/crawl", post(api::crawl::crawl_source))
        .route("/api/wechat", post(api::wechat::crawl_accounts))
        .route("/api/wechat/single", post(api::wechat::crawl_single))
        .route("/api/session", post(api::session::update_session))
        .layer(middleware)
        .with_state(state);

    Ok((router, scheduler))
}

async fn connect_db(path: &str, max_connections: u32) -> anyhow::Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await?;
    Ok(pool)
}
