pub mod attempt;
pub mod browser;
pub mod captcha;
pub mod coordinator;
pub mod dispatch;
pub mod encryption;
pub mod executor;
pub mod extractor;
pub mod notify;
pub mod queue;
pub mod tracker;
