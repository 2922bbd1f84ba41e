//! # Warden (Identity & Admission Control)
//!
//! `warden` is the identity and admission-control core shared by every service in
//! the system. It owns the few pieces with real invariants:
//!
//! - **Id allocation:** 64-bit time-ordered snowflake ids
//!   (`[41-bit ms offset][5-bit datacenter][5-bit machine][12-bit sequence]`),
//!   strictly increasing per allocator and unique across nodes.
//! - **Bearer tokens:** HS256 access/refresh pairs with revocation. Refresh tokens
//!   rotate on use; of several concurrent refreshes with the same token exactly one
//!   wins, decided by an atomic get-and-delete in the shared store.
//! - **Login throttling:** failed attempts are counted per `(username, client)` and
//!   lock the pair for a sliding lockout window.
//! - **Edge admission:** every request passes bearer validation and a sliding-window
//!   rate limiter before reaching a handler.
//!
//! ## Shared State
//!
//! Revocations, session mappings, login counters, and rate-limit windows live in a
//! [`store::RevocationStore`]: Redis in production, an in-process map for single
//! nodes and tests. Every store key carries a TTL; nothing is kept indefinitely.
//!
//! ## Failure Semantics
//!
//! Token validation fails closed when the store cannot answer. The rate limiter
//! fails closed by default and may be configured to fail open.

pub mod admission;
pub mod api;
pub mod audit;
pub mod cli;
pub mod clock;
pub mod directory;
pub mod guard;
pub mod snowflake;
pub mod store;
pub mod token;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
