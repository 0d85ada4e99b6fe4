//! Asynchronous email delivery library
//!
//! A durable queue of outbound messages, a retry/backoff state machine, a
//! Handlebars template engine with variable validation, and a pluggable
//! delivery provider abstraction, composed by a delivery service.
//!
//! ## Architecture
//!
//! ```text
//! caller
//!   ↓ (send / send_template / schedule)
//! DeliveryService
//!   ↓ (renders templates)          ↓ (enqueues)
//! TemplateEngine (Handlebars)    EmailQueue (Redis or in-memory)
//!                                  ↓ (process_queue tick: claim batch)
//!                                EmailProvider (SMTP / mock)
//!                                  ↓
//!                                mark_sent / mark_failed (retry + backoff)
//! ```
//!
//! `process_queue` is driven by an external periodic trigger (see the
//! `mailroom-worker` binary); the library spawns no timers of its own.

pub mod config;
pub mod error;
pub mod models;
pub mod provider;
pub mod queue;
pub mod service;
pub mod templates;

pub use config::{DeliveryConfig, ProviderKind};
pub use error::{DeliveryError, DeliveryResult};
pub use models::{
    Attachment, DeliveryState, EmailDeliveryStatus, EmailMessage, EmailResult, QueueStats,
};
pub use provider::{EmailProvider, MockProvider, SmtpConfig, SmtpProvider};
pub use queue::{backoff, EmailQueue, MemoryQueue, QueueStatus, QueuedEmail, RedisQueue};
pub use service::{DeliveryService, ProcessSummary};
pub use templates::{EmailTemplate, RenderedEmail, TemplateEngine};
