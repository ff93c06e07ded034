mod engine;
mod webhook;

pub use engine::AlertEngine;
pub use webhook::WebhookNotifier;
