//! Library half of the proxy, split out from the `rpc-cache-proxy` binary the
//! way the teacher's `web3_proxy` library crate sits behind its own
//! `web3_proxy_cli` binary (`default-run = "web3_proxy_cli"` in the teacher's
//! `Cargo.toml`) rather than folding everything into `main.rs`. `main.rs` is
//! the thin startup wiring; everything that a test or another binary might
//! want to drive directly — the store, the upstream client, the pipeline,
//! the HTTP router — lives here.

pub mod canonical;
pub mod coalescer;
pub mod config;
pub mod frontend;
pub mod jsonrpc;
pub mod lock;
pub mod method_policy;
pub mod metrics;
pub mod pipeline;
pub mod upstream;
