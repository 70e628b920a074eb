//! orderfetch-core: historical order retrieval over a callback-driven
//! trading gateway.
//!
//! The gateway answers on its own thread; `bridge` turns those callbacks
//! into blocking waits, `pipeline` walks each account through its request
//! sequence, and `writer` keeps the JSON output parseable on every exit
//! path.

pub mod bridge;
pub mod commission;
pub mod config;
pub mod dates;
pub mod error;
pub mod gateway;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod rng;
pub mod sim;
pub mod state;
pub mod types;
pub mod validation;
pub mod writer;
