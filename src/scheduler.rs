use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{info, warn};

use crate::{
    crawler::Crawler, source::CatalogHandle, wechat::session::SessionStore, wechat::WechatCrawler,
};

/// Owns the periodic crawl loop. At most one loop runs at a time; `start`
/// refuses to spawn a second one and `stop` cancels the loop and waits for
/// it to wind down.
pub struct Scheduler {
    crawler: Crawler,
    wechat: WechatCrawler,
    catalog: CatalogHandle,
    session: Arc<SessionStore>,
    interval_secs: u64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        crawler: Crawler,
        wechat: WechatCrawler,
        catalog: CatalogHandle,
        session: Arc<SessionStore>,
        interval_secs: u64,
    ) -> Self {
        Self {
            crawler,
            wechat,
            catalog,
            session,
            interval_secs: interval_secs.max(1),
            task: Mutex::new(None),
        }
    }

    /// Spawn the loop. Returns false when a loop is already running.
    pub fn start(&self) -> bool {
        let Ok(mut slot) = self.task.lock() else {
            return false;
        };
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let crawler = self.crawler.clone();
        let wechat = self.wechat.clone();
        let catalog = self.catalog.clone();
        let session = Arc::clone(&self.session);
        let interval_secs = self.interval_secs;
        info!(interval_secs, "started periodic crawl loop");
        *slot = Some(tokio::spawn(run_loop(
            crawler,
            wechat,
            catalog,
            session,
            interval_secs,
        )));
        true
    }

    /// Cancel the loop and wait for it to finish. Returns false when no
    /// loop was running.
    pub async fn stop(&self) -> bool {
        let handle = match self.task.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(handle) = handle else {
            return false;
        };
        handle.abort();
        let _ = handle.await;
        info!("stopped periodic crawl loop");
        true
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }
}

async fn run_loop(
    crawler: Crawler,
    wechat: WechatCrawler,
    catalog: CatalogHandle,
    session: Arc<SessionStore>,
    interval_secs: u64,
) {
    let mut ticker = interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // The very first tick completes immediately, so the service crawls
        // once right after startup.
        ticker.tick().await;
        let started = Instant::now();
        run_cycle(&crawler, &wechat, &catalog, &session).await;
        info!(
            "crawl cycle finished in {:.2}s, next run in {}s",
            started.elapsed().as_secs_f64(),
            interval_secs
        );
    }
}

/// One full pass: every announcement source, then the WeChat accounts when
/// a usable session exists, then the repair sweep over failed rows. A
/// broken source never stops the rest of the cycle.
async fn run_cycle(
    crawler: &Crawler,
    wechat: &WechatCrawler,
    catalog: &CatalogHandle,
    session: &SessionStore,
) {
    // Re-read the config directory so source edits apply without a restart.
    catalog.reload();

    let snapshot = catalog.current();
    for source in &snapshot.sources {
        if let Err(err) = crawler.crawl_source(&source.id).await {
            warn!(source_id = %source.id, error = %err, "periodic crawl failed");
        }
    }

    if session.is_valid() {
        if let Err(err) = wechat.crawl("all").await {
            warn!(error = %err, "periodic wechat crawl failed");
        }
    } else {
        warn!("skipping wechat crawl, session missing or invalid, update it via POST /api/session");
    }

    wechat.repair_failed().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashMap, path::PathBuf};

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::{
        extract::ocr::OcrEngine,
        fetch::{Fetch, FetchError},
        repo,
        source::SourceCatalog,
    };

    struct IdleFetch;

    #[async_trait]
    impl Fetch for IdleFetch {
        async fn get_text(
            &self,
            url: &str,
            _headers: &HashMap<String, String>,
        ) -> Result<String, FetchError> {
            Err(FetchError {
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
            _payload: &HashMap<String, String>,
            _headers: &HashMap<String, String>,
        ) -> Result<Value, FetchError> {
            Err(FetchError {
                url: url.to_string(),
                attempts: 1,
            })
        }
    }

    async fn scheduler_with(dir: &tempfile::TempDir) -> Scheduler {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        repo::migrations::ensure_schema(&pool).await.unwrap();
        let fetcher: Arc<dyn Fetch> = Arc::new(IdleFetch);
        let catalog = CatalogHandle::new(PathBuf::from("unused"), SourceCatalog::default());
        let session = Arc::new(SessionStore::load(dir.path().join("session.json")));
        let crawler = Crawler::new(
            Arc::clone(&fetcher),
            pool.clone(),
            catalog.clone(),
            OcrEngine::default(),
            2,
        );
        let wechat = WechatCrawler::new(fetcher, pool, catalog.clone(), Arc::clone(&session), 2);
        Scheduler::new(crawler, wechat, catalog, session, 3600)
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_with(&dir).await;

        assert!(scheduler.start());
        assert!(scheduler.is_running());
        assert!(!scheduler.start());

        assert!(scheduler.stop().await);
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn stop_without_start_reports_idle() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_with(&dir).await;

        assert!(!scheduler.stop().await);
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn restart_after_stop_spawns_a_fresh_loop() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_with(&dir).await;

        assert!(scheduler.start());
        assert!(scheduler.stop().await);
        assert!(scheduler.start());
        assert!(scheduler.is_running());
        assert!(scheduler.stop().await);
    }
}
