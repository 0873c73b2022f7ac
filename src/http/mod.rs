//! Authenticated HTTP transport.
//!
//! [`Client`] attaches the current access token to every call, renews credentials once on
//! `401 Unauthorized` and re-issues the original call, and classifies every other failure through
//! [`crate::policy::decide`]. User-facing side effects are published as [`Notification`]s.

pub mod client;

pub use client::{Client, Config, Notification, RequestOptions};
