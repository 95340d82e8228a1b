//! Document database client for couch-sync
//!
//! Provides the request/response side of the CouchDB / Cloudant HTTP API:
//!
//! - [`Configuration`] - connection settings, validated before connecting
//! - [`HttpSession`] - authenticated, pooled HTTP access to one database
//! - [`Transport`] - the seam the document store is written against, with
//!   [`HttpSession`] and the in-process [`MemoryTransport`] as implementations
//! - [`DocumentStore`] - fetch and create-or-update with a single corrective
//!   retry on revision conflicts
//!
//! The streaming `_changes` readers live in `couch-changes-source`; they
//! reuse the URL builders and client construction exported here.

mod auth;
mod config;
pub mod duration;
mod error;
mod http;
mod memory;
mod store;
mod transport;
pub mod url;

pub use auth::{Credentials, TokenProvider};
pub use config::Configuration;
pub use error::{ConnectError, TransportError};
pub use http::{build_http_client, HttpSession};
pub use memory::{MemoryTransport, RecordedRequest};
pub use store::DocumentStore;
pub use transport::{HttpResponse, StatusClass, Transport};
pub use url::{ChangesQuery, FeedMode};
