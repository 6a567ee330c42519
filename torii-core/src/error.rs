use http::StatusCode;
use thiserror::Error;

/// Errors surfaced by the data plane. Every variant maps onto an errno for
/// the JSON reject body, an HTTP status, and a gRPC status code.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    ServiceNotFound(String),
    #[error("{0}")]
    AccessDenied(String),
    #[error("{0}")]
    AuthFailed(String),
    #[error("{0}")]
    RateLimited(String),
    #[error("{0}")]
    QuotaExceeded(String),
    #[error("{0}")]
    NoUpstream(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Config(String),
}

impl GatewayError {
    pub fn errno(&self) -> i32 {
        match self {
            GatewayError::ServiceNotFound(_) => 1001,
            GatewayError::AuthFailed(_) => 2002,
            GatewayError::QuotaExceeded(_) => 2003,
            GatewayError::AccessDenied(_) => 3001,
            GatewayError::RateLimited(_) => 5002,
            GatewayError::Upstream(_) => 5020,
            GatewayError::NoUpstream(_) => 5030,
            GatewayError::Config(_) => 5000,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            GatewayError::ServiceNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::AccessDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited(_) | GatewayError::QuotaExceeded(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::NoUpstream(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Numeric gRPC status code for trailers-only rejections.
    pub fn grpc_status(&self) -> u32 {
        match self {
            GatewayError::ServiceNotFound(_) => 12, // UNIMPLEMENTED
            GatewayError::AccessDenied(_) => 7,     // PERMISSION_DENIED
            GatewayError::AuthFailed(_) => 16,      // UNAUTHENTICATED
            GatewayError::RateLimited(_) | GatewayError::QuotaExceeded(_) => 8, // RESOURCE_EXHAUSTED
            GatewayError::NoUpstream(_) | GatewayError::Upstream(_) => 14,      // UNAVAILABLE
            GatewayError::Config(_) => 13,          // INTERNAL
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let err = GatewayError::RateLimited("service flow limit 2".into());
        assert_eq!(err.http_status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.grpc_status(), 8);
        assert_eq!(err.errno(), 5002);

        let err = GatewayError::AccessDenied("1.2.3.4 in black ip list".into());
        assert_eq!(err.http_status(), StatusCode::FORBIDDEN);
        assert_eq!(err.grpc_status(), 7);
        assert_eq!(err.to_string(), "1.2.3.4 in black ip list");
    }
}
