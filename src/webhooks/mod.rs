//! Webhook subsystem: subscriptions, HMAC signing, and terminal-event
//! delivery with retries.

pub mod dispatcher;
pub mod signer;
pub mod subscription;

pub use dispatcher::{WebhookConfig, WebhookDispatcher};
pub use signer::{sign_payload, verify_signature};
pub use subscription::{SubscriptionStore, WebhookSubscription};
