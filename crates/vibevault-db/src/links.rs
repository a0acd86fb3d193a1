//! Link store implementation.
//!
//! Only the slice of link persistence the enrichment pipeline touches lives
//! here: creation (raw fields), lookup, metadata write-back, and the re-import
//! reset. Listing and filtering belong to the web layer.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use vibevault_core::{
    extract_domain, new_v7, normalize_url, parse_link_url, CreateLinkRequest, EnrichmentStatus,
    Error, Job, JobKind, Link, LinkMetadataUpdate, LinkRepository, Result,
};

use crate::jobs::{PgJobRepository, JOB_COLUMNS};

const LINK_COLUMNS: &str = "id, user_id, url, normalized_url, domain, title, description, note, \
     image, favicon, site_name, published_time, enrichment_status, enrichment_error, \
     created_at, updated_at";

/// PostgreSQL implementation of LinkRepository.
#[derive(Clone)]
pub struct PgLinkRepository {
    pool: Pool<Postgres>,
}

impl PgLinkRepository {
    /// Create a new PgLinkRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_link_row(row: &PgRow) -> Result<Link> {
        let status: String = row.try_get("enrichment_status")?;
        Ok(Link {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            url: row.try_get("url")?,
            normalized_url: row.try_get("normalized_url")?,
            domain: row.try_get("domain")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            note: row.try_get("note")?,
            image: row.try_get("image")?,
            favicon: row.try_get("favicon")?,
            site_name: row.try_get("site_name")?,
            published_time: row.try_get("published_time")?,
            enrichment_status: status.parse::<EnrichmentStatus>()?,
            enrichment_error: row.try_get("enrichment_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn map_insert_error(e: sqlx::Error, normalized_url: &str) -> Error {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Conflict(format!("link already saved: {normalized_url}"))
            }
            _ => Error::Database(e),
        }
    }

    async fn insert_link<'e, E>(executor: E, req: &CreateLinkRequest) -> Result<Link>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let parsed = parse_link_url(&req.url)?;
        let normalized = normalize_url(parsed.as_str());
        let domain = extract_domain(parsed.as_str());
        let now = Utc::now();

        let query = format!(
            "INSERT INTO link
                 (id, user_id, url, normalized_url, domain, title, description, note,
                  enrichment_status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9, $9)
             RETURNING {LINK_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(new_v7())
            .bind(req.user_id)
            .bind(&req.url)
            .bind(&normalized)
            .bind(&domain)
            .bind(&req.title)
            .bind(&req.description)
            .bind(&req.note)
            .bind(now)
            .fetch_one(executor)
            .await
            .map_err(|e| Self::map_insert_error(e, &normalized))?;

        Self::parse_link_row(&row)
    }

    /// Create a link and its queued enrichment job in one transaction.
    ///
    /// Either both rows exist afterwards or neither does.
    pub async fn create_with_job(&self, req: CreateLinkRequest) -> Result<(Link, Job)> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let link = Self::insert_link(&mut *tx, &req).await?;

        let kind = JobKind::fetch_metadata(link.id, link.url.clone());
        let now = Utc::now();
        let query = format!(
            "INSERT INTO enrichment_job
                 (id, user_id, link_id, job_type, payload, status, attempts,
                  available_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, 'queued', 0, $6, $6, $6)
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(new_v7())
            .bind(link.user_id)
            .bind(link.id)
            .bind(kind.job_type().as_str())
            .bind(kind.payload_json()?)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::Database)?;
        let job = PgJobRepository::parse_job_row(&row)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok((link, job))
    }
}

#[async_trait]
impl LinkRepository for PgLinkRepository {
    async fn create(&self, req: CreateLinkRequest) -> Result<Link> {
        Self::insert_link(&self.pool, &req).await
    }

    async fn get(&self, link_id: Uuid) -> Result<Option<Link>> {
        let query = format!("SELECT {LINK_COLUMNS} FROM link WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(link_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_link_row).transpose()
    }

    async fn update_metadata(&self, link_id: Uuid, update: LinkMetadataUpdate) -> Result<()> {
        let meta = update.metadata.unwrap_or_default();

        // Absent fields keep the stored value.
        let result = sqlx::query(
            "UPDATE link
             SET title = COALESCE($2, title),
                 description = COALESCE($3, description),
                 site_name = COALESCE($4, site_name),
                 image = COALESCE($5, image),
                 favicon = COALESCE($6, favicon),
                 published_time = COALESCE($7, published_time),
                 enrichment_status = $8,
                 enrichment_error = $9,
                 updated_at = $10
             WHERE id = $1",
        )
        .bind(link_id)
        .bind(&meta.title)
        .bind(&meta.description)
        .bind(&meta.site_name)
        .bind(&meta.image)
        .bind(&meta.favicon)
        .bind(meta.published_time)
        .bind(update.enrichment_status.as_str())
        .bind(&update.enrichment_error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::LinkNotFound(link_id));
        }
        Ok(())
    }

    async fn mark_pending(&self, link_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE link
             SET enrichment_status = 'pending', enrichment_error = NULL, updated_at = $2
             WHERE id = $1",
        )
        .bind(link_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::LinkNotFound(link_id));
        }
        Ok(())
    }
}
