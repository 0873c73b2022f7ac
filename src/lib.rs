#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod auth;
pub mod bus;
pub mod error;
pub mod http;
pub mod policy;
pub(crate) mod serde_helpers;
#[cfg(feature = "ws")]
pub mod ws;

use serde::Serialize;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Trait for converting request types to URL query parameters.
///
/// Implemented for every [`Serialize`] type: structs with named fields, maps, and slices of
/// key/value pairs. Fields that serialize to `None` are omitted.
pub trait ToQueryParams: Serialize {
    /// URL-encoded `key=value` pairs joined by `&`, without a leading `?`.
    ///
    /// A value that cannot be expressed as a query string yields an empty string.
    fn query_string(&self) -> String {
        serde_html_form::to_string(self)
            .inspect_err(|e| {
                #[cfg(feature = "tracing")]
                tracing::error!("Unable to convert to URL-encoded string {e:?}");
                #[cfg(not(feature = "tracing"))]
                let _: &serde_html_form::ser::Error = e;
            })
            .unwrap_or_default()
    }
}

impl<T: Serialize> ToQueryParams for T {}
