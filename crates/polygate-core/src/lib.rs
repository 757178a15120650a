//! Core of the polygate multi-backend LLM gateway: protocol translation,
//! the thought-signature recovery/cache lifecycle, conversation state,
//! routing/fallback, and the IDE-compatibility sanitizer.
//!
//! `polygate-service` wires these modules into HTTP handlers; everything in
//! this crate is transport-agnostic.

pub mod backend;
pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod middleware;
pub mod model;
pub mod protocol;
pub mod proxy;
pub mod ratelimit;
pub mod sanitize;
pub mod signature;
pub mod stream;
pub mod tokens;
