//! Outreach: batch generation, merge, and dispatch of personalized
//! outreach messages.

pub mod attachments;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod generation;
pub mod progress;
pub mod recipients;
pub mod session;
pub mod store;
