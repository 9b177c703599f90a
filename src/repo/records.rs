use sqlx::SqlitePool;

use crate::model::CrawlItem;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredRecord {
    pub id: String,
    pub title: String,
    pub url: String,
    pub publish_time: Option<String>,
    pub source_id: Option<String>,
    pub source_name: Option<String>,
    pub attachments: Option<String>,
    pub content: Option<String>,
}

/// A record only counts as existing when a matching row carries both a
/// non-empty title and non-empty content. Rows missing either stay
/// invisible here so the next crawl overwrites them.
pub async fn record_exists(
    pool: &SqlitePool,
    id: &str,
    url: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let count: i64 = match url {
        Some(url) => {
            sqlx::query_scalar(
                r#"
                SELECT COUNT(1)
                FROM crawled_records
                WHERE (id = ?1 OR url = ?2)
                  AND title <> ''
                  AND content IS NOT NULL AND content <> ''
                "#,
            )
            .bind(id)
            .bind(url)
            .fetch_one(pool)
            .await?
        }
        None => {
            sqlx::query_scalar(
                r#"
                SELECT COUNT(1)
                FROM crawled_records
                WHERE id = ?1
                  AND title <> ''
                  AND content IS NOT NULL AND content <> ''
                "#,
            )
            .bind(id)
            .fetch_one(pool)
            .await?
        }
    };
    Ok(count > 0)
}

/// Upsert with replace semantics: a repaired crawl overwrites the failed
/// row under the same id instead of piling up duplicates.
pub async fn store_document(
    pool: &SqlitePool,
    item: &CrawlItem,
    source_id: &str,
) -> Result<(), sqlx::Error> {
    let attachments = item
        .attachments
        .as_ref()
        .and_then(|list| serde_json::to_string(list).ok());

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO crawled_records
          (id, title, url, publish_time, source_id, source_name, attachments, content)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(&item.id)
    .bind(&item.title)
    .bind(&item.url)
    .bind(item.publish_time.to_rfc3339())
    .bind(source_id)
    .bind(&item.source)
    .bind(attachments)
    .bind(&item.content)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_record(pool: &SqlitePool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM crawled_records WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Rows with an empty title or empty content, optionally scoped to
/// WeChat-origin sources. Drives the repair pass.
pub async fn failed_records(
    pool: &SqlitePool,
    wechat_only: bool,
) -> Result<Vec<StoredRecord>, sqlx::Error> {
    let base = r#"
        SELECT id, title, url, publish_time, source_id, source_name, attachments, content
        FROM crawled_records
        WHERE (title = '' OR content IS NULL OR content = '')
    "#;
    if wechat_only {
        sqlx::query_as::<_, StoredRecord>(&format!("{base} AND source_id LIKE 'wechat_%'"))
            .fetch_all(pool)
            .await
    } else {
        sqlx::query_as::<_, StoredRecord>(base)
            .fetch_all(pool)
            .await
    }
}
