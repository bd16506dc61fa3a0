//! Service layer: external side effects behind supervised tasks.
//!
//! # Components
//!
//! - `webhooks` - best-effort callback forwarding with bounded retries and
//!   JWT re-signing

pub mod webhooks;

pub use webhooks::Webhooks;
