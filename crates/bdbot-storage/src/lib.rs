//! Persistence backends + HTTP fetch utilities for bdbot.

mod http;
mod memory;
mod pg;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::{MemoryMatchStore, MemorySolicitationStore, MemoryUserDirectory};
pub use pg::{
    connect, migrate, server_version, PgMatchStore, PgSolicitationStore, PgUserDirectory,
};
