//! Floodgate - Admission Control Engine
//!
//! This crate decides whether an operation for a caller-supplied key may
//! proceed right now. Counting state lives in a durable [`store`], shadowed by
//! an optional fast [`cache`]; three interchangeable strategies (fixed window,
//! sliding window, token bucket) turn that state into decisions. The
//! [`service::AdmissionService`] is the public entry point and fails open when
//! the store is unreachable. The [`gate`] module adapts it to inbound calls.

pub mod cache;
pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
pub mod service;
pub mod store;

pub use error::{FloodgateError, Result};
pub use gate::{Admission, Gate, GateDecision, GatePolicy, MaxRequests, RateLimitHeaders};
pub use ratelimit::{LimitOptions, LimitStatus, Strategy};
pub use service::{AdmissionService, CleanupWorker};
