//! Wire protocol and provider-side framework for groundwork resource
//! providers.
//!
//! A provider is a long-lived subprocess. On startup it writes a single
//! handshake line to stdout (see [`schema::handshake_line`]), then answers
//! JSON-lines requests until it receives [`schema::v1::RequestPayload::Stop`]
//! or its stdin closes. Logs go to stderr; stdout is reserved for protocol
//! messages.

pub mod framework;
pub mod schema;
