//! Cache-aware request handling for cairn stores.
//!
//! [`CacheHandler`] sits in front of a downstream [`Handler`] and decides, per
//! request, whether to:
//! - serve the cached document,
//! - fetch and write the response through the store,
//! - or serve the cached document while refreshing it in the background.
//!
//! Mutations always go downstream. Failed queries are cached as error
//! documents; rejected mutations are recorded on the resources they tried to
//! save.

mod error;
mod handler;
mod lifetimes;
mod types;

pub use error::{FetchError, RequestError};
pub use handler::{CacheHandler, Decision, Handler};
pub use lifetimes::{DEFAULT_HARD_TTL_SECS, DEFAULT_SOFT_TTL_SECS, Lifetimes, TtlLifetimes};
pub use types::{CacheOptions, RequestInfo, Response};
