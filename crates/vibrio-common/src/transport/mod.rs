//! Vibrio Transport Layer
//!
//! HTTP transport used to reach a local engine.
//!
//! # Components
//!
//! - **[`HttpTransport`]**: pooled client, one timeout per attempt
//! - **[`RetryConfig`]**: exponential backoff for connection failures and timeouts
//! - **[`TransportConfig`]**: request timeout plus retry policy
//!
//! # Example
//!
//! ```no_run
//! use vibrio_common::transport::{HttpTransport, TransportConfig};
//! use vibrio_common::EngineCall;
//!
//! # async fn run() -> vibrio_common::Result<()> {
//! let transport = HttpTransport::new(TransportConfig::default());
//! let response = transport.send("http://127.0.0.1:5000", &EngineCall::status()).await?;
//! println!("engine answered {}", response.status);
//! # Ok(())
//! # }
//! ```

pub mod http;

pub use http::{HttpTransport, RetryConfig, TransportConfig};
