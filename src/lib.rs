//! User-facing Rust SDK for the Thermolink thermostat backend.
//!
//! The crate is organized by transport surface:
//! - `rest_api`: HTTP client for login, device listing, and schedule CRUD.
//! - `stream`: realtime report stream client and session state helpers.
//! - `auth`: bearer-token lookup and in-memory credential storage.
//! - `retry`: shared retry and timeout utilities.

/// Bearer-token providers and credential storage.
pub mod auth;
/// REST API client and request/response types.
pub mod rest_api;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// Realtime report stream client, wire types, and session state helpers.
pub mod stream;
