//! # SerialFlow Core Library
//!
//! Request/response correlation over half-duplex serial links.
//!
//! This library provides:
//! - Connection lifecycle with automatic reconnection and backoff
//! - A send loop and a read loop sharing one device handle
//! - Correlation of incoming frames with outstanding requests
//!   (match rules, timeouts, resend budgets, multi-response expectations)
//! - Exclusive requests that hold the link until answered
//! - Interceptor pipelines for outgoing requests and incoming responses
//! - Pluggable framing (greedy, fixed-length, custom)
//! - Serial device discovery
//!
//! ## Example
//!
//! ```rust,ignore
//! use serialflow_core::prelude::*;
//!
//! let config = EngineConfig::builder()
//!     .device_path("/dev/ttyUSB0")
//!     .baud_rate(115200)
//!     .build()?;
//! let engine = SerialEngine::new(config);
//! engine.connect().await?;
//!
//! engine.submit(
//!     Request::new(vec![0xAA, 0x55, 0x02, 0x1E, 0x1F])
//!         .with_rule(rules::byte_at(3, 0x1E))
//!         .with_timeout(Duration::from_secs(1))
//!         .with_timeout_retry(2)
//!         .with_listener(listener(
//!             |resp| println!("RX {}", resp.to_hex()),
//!             |req, err| eprintln!("{} failed: {err}", req.id()),
//!         )),
//! )?;
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod framer;
pub mod interceptor;
pub mod request;
pub mod transport;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{EngineConfig, EngineSettings, Parity, PortSettings, QueueOrder};
    pub use crate::engine::{
        connect_listener, data_listener, ConnectListener, ConnectionState, DataListener,
        SerialEngine,
    };
    pub use crate::error::{ConfigError, InterceptorError, SerialError};
    pub use crate::framer::{FixedLengthFramer, Framer, Framing, GreedyFramer};
    pub use crate::interceptor::{Chain, Flow, Interceptor};
    pub use crate::request::{
        listener, rules, Request, RequestId, Response, ResponseCount, ResponseListener,
        ResponseRule,
    };
    pub use crate::transport::{list_ports, PortInfo, PortOpener, Transport};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
