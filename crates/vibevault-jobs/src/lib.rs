//! # vibevault-jobs
//!
//! Metadata enrichment for saved links.
//!
//! This crate provides:
//! - HTML metadata extraction and an HTTP page fetcher
//! - A job producer that queues enrichment on link creation
//! - A poll runner scanning the job store on a fixed cadence
//! - A push runner consuming a message queue (in-memory or Redis)
//! - Named retry policies and a reconciler for expired leases
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vibevault_db::Database;
//! use vibevault_jobs::{HttpFetcher, MetadataHandler, RetryPolicy, WorkerBuilder, WorkerConfig};
//!
//! let db = Database::connect("postgres://...").await?;
//! let links = Arc::new(db.links.clone());
//! let jobs = Arc::new(db.jobs.clone());
//!
//! let handle = WorkerBuilder::new(jobs)
//!     .with_config(WorkerConfig::from_env())
//!     .with_policy(RetryPolicy::FailFast)
//!     .with_handler(MetadataHandler::new(links, Arc::new(HttpFetcher::from_env()?)))
//!     .build()
//!     .start();
//!
//! // Listen for events
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! ```

pub mod consumer;
pub mod executor;
pub mod extractor;
pub mod fetcher;
pub mod handler;
pub mod producer;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod worker;

// Re-export core types
pub use vibevault_core::*;

pub use consumer::{ConsumerBuilder, ConsumerConfig, QueueConsumer};
pub use executor::{JobExecutor, Outcome};
pub use extractor::extract;
pub use fetcher::{FetcherConfig, HttpFetcher, PageFetcher};
pub use handler::{HandlerRegistry, JobContext, JobHandler, JobResult, MetadataHandler};
pub use producer::JobProducer;
pub use queue::{Delivery, InMemoryQueue, MessageQueue, QueueMessage, RedisQueue};
pub use reconciler::{ReconcileReport, Reconciler, ReconcilerConfig};
pub use retry::{RetryDecision, RetryPolicy};
pub use worker::{JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
