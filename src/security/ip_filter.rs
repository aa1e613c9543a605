use super::{client_ip, is_allowed};
use crate::error::GatewayError;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::Request,
    response::{IntoResponse, Response},
};
use ipnetwork::IpNetwork;
use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::warn;

/// Rejects requests whose client address is outside the allowed networks
#[derive(Clone)]
pub struct IpFilterLayer {
    allowed_networks: Arc<Vec<IpNetwork>>,
}

impl IpFilterLayer {
    pub fn new(allowed_networks: Vec<IpNetwork>) -> Self {
        Self {
            allowed_networks: Arc::new(allowed_networks),
        }
    }
}

impl<S> Layer<S> for IpFilterLayer {
    type Service = IpFilterService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IpFilterService {
            inner,
            allowed_networks: self.allowed_networks.clone(),
        }
    }
}

#[derive(Clone)]
pub struct IpFilterService<S> {
    inner: S,
    allowed_networks: Arc<Vec<IpNetwork>>,
}

impl<S> Service<Request<Body>> for IpFilterService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip());

        let verdict = match client_ip(req.headers(), peer, &self.allowed_networks) {
            Some(ip) if is_allowed(&self.allowed_networks, ip) => Ok(()),
            Some(ip) => {
                warn!("Unauthorized access attempt from IP: {} ({})", ip, req.uri().path());
                Err(ip.to_string())
            }
            None => {
                // Deny when the address cannot be determined
                warn!("Unauthorized access: could not determine client IP");
                Err("unknown".to_string())
            }
        };

        // Take the service that was driven to readiness, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match verdict {
                Ok(()) => inner.call(req).await,
                Err(ip) => Ok(GatewayError::Unauthorized { ip }.into_response()),
            }
        })
    }
}
