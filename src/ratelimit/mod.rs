//! Rate limiting data model and counting algorithms.

mod clock;
mod descriptor;
mod options;
mod record;
mod rules;
mod status;
mod strategy;

pub use clock::{Clock, SystemClock};
pub use descriptor::KeyDescriptor;
pub use options::{DefaultsUpdate, LimitDefaults, LimitOptions, ResolvedLimit};
pub use record::{Scope, StoredRecord};
pub use rules::{PolicyConfig, PolicyRules, RateLimitRule, TimeUnit};
pub use status::LimitStatus;
pub use strategy::{Backends, Strategy, UnknownStrategy};

#[cfg(test)]
pub(crate) use clock::ManualClock;
