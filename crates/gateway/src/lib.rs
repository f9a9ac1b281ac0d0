//! Studio Bridge gateway: the MITM sniffer, the single-worker pipeline, the
//! queue worker, and the multi-worker pool + front gateway, laid out as one
//! module per component named in the design (§2).

pub mod abort;
pub mod browser;
pub mod cancel;
pub mod cert;
pub mod config;
pub mod context;
pub mod decoder;
pub mod disconnect;
pub mod error;
pub mod gatewayproxy;
pub mod http;
pub mod mitm;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod ratelimit;
pub mod sse;
pub mod types;
pub mod upstream;
