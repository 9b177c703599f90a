use sqlx::{Executor, SqlitePool};

pub async fn ensure_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    tx.execute(
        r#"
        CREATE TABLE IF NOT EXISTS crawled_records (
          id            TEXT PRIMARY KEY,
          title         TEXT NOT NULL,
          url           TEXT NOT NULL,
          publish_time  TEXT,
          source_id     TEXT,
          source_name   TEXT,
          attachments   TEXT,
          content       TEXT,
          created_at    TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )
    .await?;

    tx.execute(
        r#"
        CREATE INDEX IF NOT EXISTS idx_crawled_records_url ON crawled_records(url);
        "#,
    )
    .await?;

    tx.commit().await?;
    Ok(())
}
