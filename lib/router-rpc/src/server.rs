//! HTTP server for a router

use crate::handler::RouterHandler;
use crate::Result;
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::tokio::TokioIo;
use router_core::RegistryRouter;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// RouterServer accepts HTTP/1.1 connections and hands each request to a
/// `RouterHandler`
pub struct RouterServer {
    listener: TcpListener,
    handler: RouterHandler,
}

impl RouterServer {
    pub async fn bind(addr: SocketAddr, router: Arc<RegistryRouter>) -> Result<Self> {
        let listener = TcpListener::bind(&addr).await?;
        Ok(Self {
            listener,
            handler: RouterHandler::new(router),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` completes. Open watch streams
    /// are not waited for.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Router server listening on {}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Router server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Error accepting connection: {}", e);
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let handler = self.handler.clone();

                    tokio::task::spawn(async move {
                        let service = service_fn(move |req| {
                            let handler = handler.clone();
                            async move { Ok::<_, Infallible>(handler.handle(req).await) }
                        });

                        if let Err(e) = http1::Builder::new()
                            .serve_connection(io, service)
                            .await
                        {
                            debug!("Error serving connection from {}: {}", peer_addr, e);
                        }
                    });
                }
            }
        }
    }
}
