pub mod grpc;
pub mod http;
pub mod policy;
pub mod tcp;
pub mod tls;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use torii_core::transport::ProxyBody;

/// Whole-buffer body with the error type unified to the proxy's.
pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
