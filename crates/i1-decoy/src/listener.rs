//! Listener pool: one passive TCP listener per decoy service.
//!
//! Every accepted connection is closed straight away; only the peer
//! address is kept. Each listener binds independently, so one bad port
//! does not stop the rest of the fleet.
//!
//! Recording (and any publish it triggers) runs in a task owned by the
//! accept loop. On shutdown the loop stops accepting and drains those
//! tasks before it returns.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::DecoyService;
use crate::engine::DecoyEngine;
use crate::DecoyError;

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A decoy service whose port could not be bound.
#[derive(Debug)]
pub struct ListenerFailure {
    pub service: DecoyService,
    pub error: DecoyError,
}

struct RunningListener {
    service: DecoyService,
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

/// Running decoy listeners.
pub struct ListenerPool {
    listeners: Vec<RunningListener>,
}

/// Bind one decoy port.
pub async fn bind(service: &DecoyService, address: IpAddr) -> crate::Result<TcpListener> {
    TcpListener::bind(SocketAddr::new(address, service.port))
        .await
        .map_err(|source| DecoyError::Bind {
            port: service.port,
            source,
        })
}

impl ListenerPool {
    /// Bind and start every service. Bind failures are logged and returned
    /// alongside the pool; they never abort the other listeners.
    pub async fn start(
        services: &[DecoyService],
        address: IpAddr,
        engine: &Arc<DecoyEngine>,
        shutdown: &watch::Receiver<bool>,
    ) -> (Self, Vec<ListenerFailure>) {
        let mut listeners = Vec::with_capacity(services.len());
        let mut failures = Vec::new();

        for service in services {
            let bound = match bind(service, address).await {
                Ok(listener) => listener.local_addr().map(|addr| (listener, addr)).map_err(
                    |source| DecoyError::Bind {
                        port: service.port,
                        source,
                    },
                ),
                Err(e) => Err(e),
            };

            match bound {
                Ok((listener, local_addr)) => {
                    info!(
                        service = %service.service_name,
                        port = local_addr.port(),
                        "decoy listener started"
                    );
                    let handle = tokio::spawn(accept_loop(
                        service.clone(),
                        listener,
                        Arc::clone(engine),
                        shutdown.clone(),
                    ));
                    listeners.push(RunningListener {
                        service: service.clone(),
                        local_addr,
                        handle,
                    });
                }
                Err(error) => {
                    error!(
                        service = %service.service_name,
                        port = service.port,
                        error = %error,
                        "decoy listener failed to bind"
                    );
                    failures.push(ListenerFailure {
                        service: service.clone(),
                        error,
                    });
                }
            }
        }

        (Self { listeners }, failures)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Services that are listening, with the address each one is bound to.
    pub fn bound(&self) -> Vec<(&DecoyService, SocketAddr)> {
        self.listeners
            .iter()
            .map(|l| (&l.service, l.local_addr))
            .collect()
    }

    /// Wait for every accept loop to exit (after shutdown is signalled).
    pub async fn join(self) {
        let handles = self.listeners.into_iter().map(|l| l.handle);
        for result in futures_util::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "decoy listener task ended abnormally");
            }
        }
    }
}

async fn accept_loop(
    service: DecoyService,
    listener: TcpListener,
    engine: Arc<DecoyEngine>,
    mut shutdown: watch::Receiver<bool>,
) {
    if *shutdown.borrow() {
        return;
    }

    let mut attempts = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    drop(stream);
                    let ip = peer.ip().to_canonical();
                    debug!(service = %service.service_name, port = service.port, ip = %ip, "connection closed");
                    let engine = Arc::clone(&engine);
                    attempts.spawn(async move {
                        engine.record_attempt(ip).await;
                    });
                }
                Err(e) => {
                    warn!(service = %service.service_name, port = service.port, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(finished) = attempts.join_next(), if !attempts.is_empty() => {
                log_attempt_task(&service, &finished);
            }
            _ = shutdown.changed() => break,
        }
    }

    drop(listener);
    if !attempts.is_empty() {
        debug!(service = %service.service_name, pending = attempts.len(), "draining in-flight attempts");
    }
    while let Some(finished) = attempts.join_next().await {
        log_attempt_task(&service, &finished);
    }

    debug!(service = %service.service_name, port = service.port, "decoy listener stopped");
}

fn log_attempt_task(service: &DecoyService, finished: &Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        warn!(service = %service.service_name, error = %e, "attempt task ended abnormally");
    }
}
