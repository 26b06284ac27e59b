use sqlx::PgPool;
use tracing::info;

/// Run idempotent schema migrations. Safe to call on every startup.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    info!("Running schema migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            github_id             BIGINT PRIMARY KEY,
            login                 TEXT NOT NULL,
            kind                  TEXT NOT NULL DEFAULT 'user',
            name                  TEXT,
            location              TEXT,
            company               TEXT,
            bio                   TEXT,
            followers             BIGINT NOT NULL DEFAULT 0,
            following             BIGINT NOT NULL DEFAULT 0,
            public_repos          BIGINT NOT NULL DEFAULT 0,
            avatar_url            TEXT,
            profile_url           TEXT,
            upstream_created_at   TIMESTAMPTZ,
            private_sponsor_count BIGINT NOT NULL DEFAULT 0,
            min_tier_cents        BIGINT,
            last_scraped          TIMESTAMPTZ,
            is_enriched           BOOLEAN NOT NULL DEFAULT FALSE,
            tombstoned            BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_login ON entities (login)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS edges (
            source_id  BIGINT NOT NULL REFERENCES entities (github_id),
            target_id  BIGINT NOT NULL REFERENCES entities (github_id),
            direction  TEXT NOT NULL,
            first_seen TIMESTAMPTZ NOT NULL,
            last_seen  TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (source_id, target_id, direction)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entity_activity (
            github_id     BIGINT NOT NULL REFERENCES entities (github_id),
            year          INT NOT NULL,
            commits       BIGINT NOT NULL DEFAULT 0,
            pull_requests BIGINT NOT NULL DEFAULT 0,
            issues        BIGINT NOT NULL DEFAULT 0,
            reviews       BIGINT NOT NULL DEFAULT 0,
            last_updated  TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (github_id, year)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS crawl_jobs (
            id               UUID PRIMARY KEY,
            login            TEXT NOT NULL UNIQUE,
            github_id        BIGINT,
            depth            INT NOT NULL,
            priority         INT NOT NULL,
            state            TEXT NOT NULL DEFAULT 'pending',
            attempts         INT NOT NULL DEFAULT 0,
            next_eligible_at TIMESTAMPTZ NOT NULL,
            created_at       TIMESTAMPTZ NOT NULL,
            updated_at       TIMESTAMPTZ NOT NULL,
            last_error       TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Covers the dequeue ordering: depth, then priority, then FIFO.
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_crawl_jobs_dequeue
         ON crawl_jobs (state, depth, priority DESC, created_at)",
    )
    .execute(pool)
    .await?;

    info!("Schema migrations complete");
    Ok(())
}
