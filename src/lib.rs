//! Central event router for platform-normalized chat events.
//!
//! Collectors post events (twitch, discord, slack, kick) to the HTTP API;
//! each event is validated, enriched with language detection + translation
//! (cached, provider-pluggable), admitted or denied by a dual-backend
//! sliding-window rate limiter, and dispatched to the downstream action
//! handlers. Batches run as bounded concurrent pipelines with
//! order-preserving result aggregation.

pub mod cache;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod downstream;
pub mod error;
pub mod event;
pub mod ratelimit;
pub mod retry;
pub mod security;
pub mod server;
pub mod translation;
