//! Shared plumbing for the `order-fetcher` and `account-lister` binaries.

pub mod cli;
pub mod logging;
pub mod shutdown;
