use tower_layer::Layer;

use crate::{Config, GrpcWebBridge};

/// Layer applying the grpc-web bridge to a service.
#[derive(Debug, Clone, Default)]
pub struct GrpcWebBridgeLayer {
    config: Config,
}

impl GrpcWebBridgeLayer {
    /// Create a new bridge layer with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bridge layer from a configuration.
    pub fn with_config(config: Config) -> Self {
        GrpcWebBridgeLayer { config }
    }
}

impl<S> Layer<S> for GrpcWebBridgeLayer {
    type Service = GrpcWebBridge<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcWebBridge::new(inner, self.config.clone())
    }
}
