use axum::{extract::State, Json};

use crate::{
    app::AppState,
    error::AppResult,
    model::{CrawlRequest, CrawlResponse},
};

pub async fn crawl_source(
    State(state): State<AppState>,
    Json(payload): Json<CrawlRequest>,
) -> AppResult<Json<CrawlResponse>> {
    let items = state.crawler.crawl_source(&payload.source).await?;
    Ok(Json(CrawlResponse::ok(items)))
}
