//! grpc-web protocol translation for [tower] services.
//!
//! `grpc_web_bridge` wraps a gRPC server (any tower service speaking
//! gRPC-over-HTTP/2 semantics, such as a [`tonic`] router) and exposes it
//! through the [grpc-web] protocol, so that standard browser clients can
//! invoke RPCs over HTTP/1.1 or HTTP/2. The bridge rewrites incoming
//! grpc-web requests into the form the wrapped handler expects, re-encodes
//! responses with the gRPC trailers serialized as a trailing length-prefixed
//! frame in the body, answers the CORS preflights browsers send for
//! grpc-web calls, and can tunnel one RPC per socket over a
//! `grpc-websockets` WebSocket so that client- and bidirectional-streaming
//! calls work where grpc-web over HTTP cannot carry them.
//!
//! ## Wrapping a service
//!
//! The easiest way to get started is to call [`enable`] with your service:
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let addr = "[::1]:50051".parse().unwrap();
//!     let greeter = GreeterServer::new(MyGreeter::default());
//!
//!     Server::builder()
//!        .accept_http1(true)
//!        .add_service(grpc_web_bridge::enable(greeter))
//!        .serve(addr)
//!        .await?;
//!
//!    Ok(())
//! }
//! ```
//!
//! Behavior is tuned through [`Config`]:
//!
//! ```ignore
//! let bridge = grpc_web_bridge::config()
//!     .allow_origin(|origin| origin.ends_with(".example.com"))
//!     .enable_websockets(true)
//!     .enable(greeter);
//! ```
//!
//! ## Limitations
//!
//! * The bridge handles grpc-web traffic, the CORS preflights browsers send
//!   for it, and `grpc-websockets` upgrades. Everything else is forwarded to
//!   the wrapped service untouched.
//! * RPC message payloads are passed through, never inspected or transformed.
//!
//! [tower]: https://github.com/tower-rs/tower
//! [`tonic`]: https://github.com/hyperium/tonic
//! [grpc-web]: https://github.com/grpc/grpc-web
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]

pub use config::Config;
pub use layer::GrpcWebBridgeLayer;
pub use service::GrpcWebBridge;

mod codec;
mod config;
mod cors;
mod layer;
mod service;
mod websocket;

use bytes::Bytes;
use http_body::Body;
use http_body_util::{BodyExt, Empty};
use tonic::{body::BoxBody, Status};

/// Alias for a type-erased error type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Enable a service to handle grpc-web requests with the default
/// configuration.
///
/// Use [`config`] to customize origins, registered-endpoint gating, or the
/// websocket transport.
pub fn enable<S>(service: S) -> GrpcWebBridge<S> {
    Config::default().enable(service)
}

/// Returns a default [`Config`] to build a bridge from.
pub fn config() -> Config {
    Config::default()
}

pub(crate) fn box_body<B>(body: B) -> BoxBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(|e| Status::from_error(e.into())).boxed_unsync()
}

pub(crate) fn empty_body() -> BoxBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

pub(crate) mod util {
    pub(crate) mod base64 {
        use base64::{
            alphabet,
            engine::{
                general_purpose::{GeneralPurpose, GeneralPurposeConfig},
                DecodePaddingMode,
            },
        };

        pub(crate) const STANDARD: GeneralPurpose = GeneralPurpose::new(
            &alphabet::STANDARD,
            GeneralPurposeConfig::new()
                .with_encode_padding(true)
                .with_decode_padding_mode(DecodePaddingMode::Indifferent),
        );
    }
}
