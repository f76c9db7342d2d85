//! Vibrio Common Types and Transport
//!
//! Protocol definitions and the HTTP transport shared by the Vibrio session
//! layer and its command-line front end.
//!
//! # Overview
//!
//! Vibrio computes osu! difficulty and performance attributes by delegating to
//! a local calculation engine that speaks HTTP on a loopback port. This crate
//! holds everything that does not depend on a running engine:
//!
//! - **Protocol Layer**: requests, results, mods, the error taxonomy and the
//!   codec that turns requests into engine calls
//! - **Transport Layer**: a pooled HTTP client with per-attempt timeouts and
//!   bounded retry of connection failures
//!
//! # Components
//!
//! - [`protocol`] - Request/result types, [`EngineCodec`] and [`VibrioError`]
//! - [`transport`] - [`transport::HttpTransport`] and its retry policy
//!
//! # Example
//!
//! ```
//! use vibrio_common::{CalculationRequest, EngineCodec, OsuMod};
//!
//! let request = CalculationRequest::by_id(1001682).with_mods([OsuMod::Hidden]);
//! let call = EngineCodec::encode(&request).unwrap();
//! assert_eq!(call.path_and_query(), "/api/difficulty/1001682?mods=HD");
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
