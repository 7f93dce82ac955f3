//! Webhook handling for GitHub events.
//!
//! - Signature verification for webhook payloads (HMAC-SHA256)
//! - Parsing of `deployment_protection_rule` and `workflow_dispatch` deliveries

pub mod parser;
pub mod signature;

pub use parser::{ParseError, WebhookEvent, parse_webhook, run_id_from_callback_url};
pub use signature::{InvalidSecret, WebhookSecret};
