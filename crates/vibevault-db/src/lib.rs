//! # vibevault-db
//!
//! PostgreSQL persistence for the VibeVault enrichment pipeline.
//!
//! This crate provides:
//! - Connection pool management
//! - The link store slice the pipeline touches (create, lookup, write-back)
//! - The durable job store with exclusive, lease-based claims
//! - An in-memory store with the same semantics for tests and local runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use vibevault_db::{CreateLinkRequest, Database};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/vibevault").await?;
//!
//!     let (link, job) = db
//!         .links
//!         .create_with_job(CreateLinkRequest::new(user_id, "https://example.com/post"))
//!         .await?;
//!
//!     println!("Saved {} (job {})", link.id, job.id);
//!     Ok(())
//! }
//! ```
pub mod jobs;
pub mod links;
pub mod memory;
pub mod pool;

// Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use vibevault_core::*;

pub use jobs::PgJobRepository;
pub use links::PgLinkRepository;
pub use memory::MemoryStore;
pub use pool::{connect_pool, PoolConfig};

/// Combined database access with all repositories.
#[derive(Clone)]
pub struct Database {
    pool: sqlx::Pool<sqlx::Postgres>,
    pub links: PgLinkRepository,
    pub jobs: PgJobRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            links: PgLinkRepository::new(pool.clone()),
            jobs: PgJobRepository::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, PoolConfig::default()).await
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = connect_pool(url, &config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
