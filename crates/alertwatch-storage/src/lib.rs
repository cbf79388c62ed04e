//! HTTP transport, raw page archive and the JSON ledger store for alertwatch.

mod archive;
mod http;
mod ledger;

pub use archive::{ArchivedPage, PageArchive};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, PageTransport, RetryDisposition, SimpleTokenBucket,
    TokenBucketConfig,
};
pub use ledger::JsonLedgerStore;
pub use reqwest::{StatusCode, Url};

pub const CRATE_NAME: &str = "alertwatch-storage";
