use axum::http::Uri;
use axum::{middleware, Router};
use tms_core::errors::TmsError;
use tokio::net::{TcpListener, ToSocketAddrs};
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::middlewares::tenant_layer;
use crate::routes;
use crate::{TmsAxumError, TmsState};

async fn route_not_found(uri: Uri) -> TmsAxumError {
    TmsError::not_found(format!("No route for {}", uri.path())).into()
}

pub struct TmsApp {
    pub state: TmsState,
    pub router: Router<TmsState>,
}

impl Clone for TmsApp {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            router: self.router.clone(),
        }
    }
}

impl TmsApp {
    /// App with the built-in `/health` and `/auth` routes.
    pub fn new(state: TmsState) -> Self {
        Self {
            state,
            router: routes::router(),
        }
    }

    /// App with no routes at all.
    pub fn bare(state: TmsState) -> Self {
        Self {
            state,
            router: Router::new(),
        }
    }

    pub fn use_router(mut self, path: &str, router: Router<TmsState>) -> Self {
        self.router = self.router.nest(path, router);
        self
    }

    pub fn merge(mut self, router: Router<TmsState>) -> Self {
        self.router = self.router.merge(router);
        self
    }

    /// Attach the request-id, tracing and tenant layers, the 404 fallback and
    /// the shared state.
    ///
    /// Layer order, outermost first: request id assignment, HTTP trace,
    /// request id propagation to the response, tenant scoping.
    pub fn into_router(self) -> Router {
        let layers = ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(middleware::from_fn_with_state(self.state.clone(), tenant_layer));

        self.router
            .fallback(route_not_found)
            .layer(layers)
            .with_state(self.state)
    }

    pub async fn listen<A>(self, addr: A) -> anyhow::Result<()>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "listening");
        axum::serve(listener, self.into_router()).await?;
        Ok(())
    }
}
