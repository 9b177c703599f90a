use axum::{extract::State, Json};

use crate::{
    app::AppState,
    error::{AppError, AppResult},
    model::{CrawlResponse, SingleRequest, WechatRequest},
    wechat,
};

/// Crawl one configured account, or all of them for `"all"`.
pub async fn crawl_accounts(
    State(state): State<AppState>,
    Json(payload): Json<WechatRequest>,
) -> AppResult<Json<CrawlResponse>> {
    let items = state.wechat.crawl(&payload.source).await?;
    Ok(Json(CrawlResponse::ok(items)))
}

/// Crawl a single article by URL, outside any configured account.
pub async fn crawl_single(
    State(state): State<AppState>,
    Json(payload): Json<SingleRequest>,
) -> AppResult<Json<CrawlResponse>> {
    if !wechat::is_article_url(&payload.url) {
        return Err(AppError::BadRequest(format!(
            "not a wechat article url: {}",
            payload.url
        )));
    }
    let item = state.wechat.crawl_single(&payload.url).await?;
    Ok(Json(CrawlResponse::ok(vec![item])))
}
