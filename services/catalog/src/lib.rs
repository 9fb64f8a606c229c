//! Shutter Catalog Service
//!
//! Keeps a catalog of uploaded images in step with the object store. Object
//! change notifications are routed through the [`shutter_pipeline`] topic to
//! the workers below; every lifecycle event ends in one email.
//!
//! ## Features
//!
//! - **Upload Processing**: Extension allow-list, object confirmation and an
//!   idempotent upsert, with rejected uploads dead-lettered
//! - **Deletion and Caption Propagation**: Filtered direct subscriptions
//!   keep records in sync with the bucket and with caption edits
//! - **Change-Stream Notifications**: Deletions and caption changes are
//!   reported from the record table's own change stream
//! - **Pluggable Backends**: In-memory or PostgreSQL records, SES or
//!   log-only notifications
//!
//! ## Architecture
//!
//! ```text
//! Kafka / S3 events          Work Queues                Record Store
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Ingestion    │──────────▶│ image-process│─────────▶│ images       │
//! │ Gate         │           │   + DLQ      │          │ (pg_notify)  │
//! └──────────────┘           └──────────────┘          └──────────────┘
//!        │                          │                         │
//!        ▼                          ▼                         ▼
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Deletion /   │──────────▶│ Mail         │◀─────────│ Change-Stream│
//! │ Update       │           │ Dispatcher   │          │ Watcher      │
//! └──────────────┘           └──────────────┘          └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod mailer;
pub mod notifier;
pub mod objects;
pub mod pg_store;
pub mod record_store;
pub mod service;
pub mod watcher;
pub mod workers;

pub use api::{AppState, ErrorResponse};
pub use config::{Config, StoreBackend};
pub use mailer::{MailDispatcher, MailPath, MailQueueHandler};
pub use notifier::{LogNotifier, NotificationKind, NotificationMessage, Notifier, NotifyError, SesNotifier};
pub use objects::{ObjectError, ObjectInfo, ObjectStore, S3ObjectStore};
pub use pg_store::PgRecordStore;
pub use record_store::{ChangeFeed, MemoryRecordStore, Record, RecordChange, RecordField, RecordStore, StoreError};
pub use service::{Catalog, Clients};
pub use watcher::ChangeStreamWatcher;
pub use workers::{DeletionWorker, ProcessingWorker, UpdateWorker};
