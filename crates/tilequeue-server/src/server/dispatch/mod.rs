//! The dispatcher: an HTTP front door that admits each client's requests
//! under a fixed budget and forwards them to the rendering backend.
//!
//! Per request:
//!
//! 1. fingerprint the client (cached for the connection) and classify the
//!    request into a type,
//! 2. submit it to the scheduler task and wait for a grant,
//! 3. forward it on a detached task; the slot is released as soon as
//!    response headers arrive or forwarding fails,
//! 4. stream the backend's response back.
//!
//! If the client goes away while its request is queued, hyper drops the
//! handler future and the request's [`Ticket`] reports the disconnect. A
//! request already sent to the backend runs to completion regardless.

mod actor;
mod proxy;
mod ticket;

use crate::server::config::DispatchConfig;
use crate::server::telemetry;
use actor::DispatcherHandle;
use anyhow::Context;
use core::convert::Infallible;
use core::time::Duration;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use proxy::{ProxyBody, error_response};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use ticket::{Outcome, Ticket};
use tilequeue::{
    Classifier, Error, Fingerprint, Scheduler, SequenceGenerator, TileClassifier, TypePriority,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Pause after a failed `accept`, so fd exhaustion does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub struct Dispatcher {
    config: DispatchConfig,
    classifier: Arc<dyn Classifier>,
}

/// State shared by every connection handler.
struct Proxy {
    dispatcher: DispatcherHandle,
    classifier: Arc<dyn Classifier>,
    types: TypePriority,
    backend: SocketAddr,
    ids: &'static SequenceGenerator,
}

impl Dispatcher {
    /// A dispatcher classifying requests with [`TileClassifier`].
    pub fn new(config: DispatchConfig) -> Self {
        Self::with_classifier(config, TileClassifier)
    }

    pub fn with_classifier(config: DispatchConfig, classifier: impl Classifier) -> Self {
        Self {
            config,
            classifier: Arc::new(classifier),
        }
    }

    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        TcpListener::bind(self.config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen_addr))
    }

    /// Serves `listener` until `shutdown` is cancelled, then drains open
    /// connections for up to the configured drain timeout.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        let Self { config, classifier } = self;

        tracing::info!(
            "Dispatching on {} to {} ({} requests per client, types [{}], {:?} order)",
            listener.local_addr()?,
            config.backend_addr,
            config.scheduler.requests_per_client,
            config.types.names().collect::<Vec<_>>().join(", "),
            config.scheduler.order,
        );

        let stop = CancellationToken::new();
        let scheduler = Scheduler::new(config.scheduler.clone(), config.types.clone());
        let (handle, actor) = actor::spawn(scheduler, config.sweep_interval, stop.clone());

        let proxy = Arc::new(Proxy {
            dispatcher: handle,
            classifier,
            types: config.types.clone(),
            backend: config.backend_addr,
            ids: SequenceGenerator::global(),
        });

        let http = http1::Builder::new();
        let graceful = GracefulShutdown::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("Accept failed: {e}");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);

                    let proxy = Arc::clone(&proxy);
                    let fingerprint = Arc::new(OnceLock::new());
                    let service = service_fn(move |req| {
                        let proxy = Arc::clone(&proxy);
                        let fingerprint = Arc::clone(&fingerprint);
                        async move {
                            Ok::<_, Infallible>(proxy.handle(req, remote, &fingerprint).await)
                        }
                    });

                    let conn = graceful.watch(http.serve_connection(TokioIo::new(stream), service));
                    tokio::spawn(async move {
                        if let Err(e) = conn.await {
                            tracing::debug!("Connection from {remote} ended: {e}");
                        }
                    });
                }
                () = shutdown.cancelled() => break,
            }
        }

        drop(listener);
        tracing::info!("Stopped accepting, draining open connections");
        match tokio::time::timeout(config.drain_timeout, graceful.shutdown()).await {
            Ok(()) => tracing::info!("All connections drained"),
            Err(_) => tracing::warn!(
                "Connections still open after {:?}, abandoning them",
                config.drain_timeout
            ),
        }

        stop.cancel();
        drop(proxy);
        actor.await.context("dispatcher task failed")?;
        tracing::info!("Dispatcher shut down");
        Ok(())
    }
}

impl Proxy {
    async fn handle(
        &self,
        req: Request<Incoming>,
        remote: SocketAddr,
        fingerprint: &OnceLock<Fingerprint>,
    ) -> Response<ProxyBody> {
        let fingerprint = fingerprint
            .get_or_init(|| Fingerprint::from_headers(req.headers(), Some(remote)))
            .clone();
        let id = self.ids.next_id();
        let (parts, body) = req.into_parts();
        let kind = self.types.index_of(self.classifier.classify(&parts));

        let span = tracing::info_span!(
            "dispatch",
            %id,
            %fingerprint,
            kind = self.types.name(kind),
        );

        async move {
            tracing::info!(uri = %parts.uri, "INCOMING");
            let ticket = match self.dispatcher.submit(fingerprint, id, kind) {
                Ok(ticket) => ticket,
                Err(e) => return error_response(&e),
            };
            self.forward(ticket, Request::from_parts(parts, body)).await
        }
        .instrument(span)
        .await
    }

    async fn forward(&self, mut ticket: Ticket, req: Request<Incoming>) -> Response<ProxyBody> {
        if let Err(e) = ticket.admitted().await {
            tracing::debug!("{} not admitted: {e}", ticket.id());
            return error_response(&e);
        }
        tracing::debug!("FORWARDING");

        // The exchange runs on its own task: a client that hangs up drops
        // only the join handle, never the backend request.
        let backend = self.backend;
        let exchange = tokio::spawn(
            async move {
                let result = proxy::forward(backend, req).await;
                match &result {
                    Ok(_) => ticket.complete(Outcome::Forwarded),
                    Err(e) => {
                        ticket.complete(Outcome::BackendError);
                        telemetry::increment_backend_errors();
                        tracing::warn!("{} failed: {e}", ticket.id());
                    }
                }
                result
            }
            .in_current_span(),
        );

        match exchange.await {
            Ok(Ok(resp)) => resp.map(BodyExt::boxed),
            Ok(Err(e)) => error_response(&e),
            Err(e) => {
                let err = Error::BackendReset {
                    context: format!("forwarding task failed: {e}"),
                };
                tracing::error!("{err}");
                error_response(&err)
            }
        }
    }
}
