// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::future::Future;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::CoverMode;
use crate::coverage::{CoverageSnapshot, Registry};
use crate::http_utils::{create_text_response, log_and_create_http_response, HttpResponse};

pub const COVERAGE_ENDPOINT_PATH: &str = "/v1/cover/coverage";
pub const PROFILE_ENDPOINT_PATH: &str = "/v1/cover/profile";
pub const CLEAR_ENDPOINT_PATH: &str = "/v1/cover/clear";

const CLEAR_RESPONSE: &str = "clear call successfully\n";

/// How the HTTP server went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpShutdown {
    /// Every in-flight connection finished before the deadline.
    Graceful,
    /// The deadline passed and the remaining connections were dropped.
    Forced,
}

/// Fraction of blocks whose counter is non-zero, `0` when there are no blocks.
pub fn coverage_ratio(snapshot: &CoverageSnapshot) -> f64 {
    let total = snapshot.total_blocks();
    if total == 0 {
        return 0.0;
    }
    snapshot.covered_blocks() as f64 / total as f64
}

/// Body of the coverage endpoint: `0` without blocks, six decimals otherwise.
pub fn format_coverage(snapshot: &CoverageSnapshot) -> String {
    if snapshot.total_blocks() == 0 {
        return "0".to_string();
    }
    format!("{:.6}", coverage_ratio(snapshot))
}

/// Renders a cover profile: a `mode:` header, then one
/// `<file>:<line0>.<col0>,<line1>.<col1> <stmts> <count>` line per block.
pub fn render_profile(mode: CoverMode, snapshot: &CoverageSnapshot) -> String {
    let mut out = format!("mode: {mode}\n");
    for (name, counts) in &snapshot.counters {
        let Some(blocks) = snapshot.blocks.get(name) else {
            continue;
        };
        for (block, slot) in blocks.iter().zip(counts.iter()) {
            out.push_str(&format!(
                "{}:{}.{},{}.{} {} {}\n",
                name,
                block.line0,
                block.col0,
                block.line1,
                block.col1,
                block.stmts,
                slot.load(Ordering::Relaxed)
            ));
        }
    }
    out
}

#[derive(Clone)]
pub struct ProfileServer {
    registry: Arc<Registry>,
    mode: CoverMode,
}

impl ProfileServer {
    pub fn new(registry: Arc<Registry>, mode: CoverMode) -> Self {
        ProfileServer { registry, mode }
    }

    /// Serves until `shutdown` is cancelled, then drains in-flight connections
    /// for at most `shutdown_timeout`. An `Err` means the listener itself broke.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
        shutdown_timeout: Duration,
    ) -> io::Result<HttpShutdown> {
        let server = hyper::server::conn::http1::Builder::new();
        let graceful = GracefulShutdown::new();
        let mut joinset = JoinSet::new();

        let profile_server = self.clone();
        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
            let profile_server = profile_server.clone();
            async move { profile_server.endpoint_handler(&req) }
        });

        let mut accept_backoff: Option<Duration> = None;
        loop {
            let conn = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Shutdown requested, no longer accepting connections");
                    break;
                }
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) if is_resource_exhaustion(&e) => {
                        let delay = next_accept_backoff(accept_backoff);
                        accept_backoff = Some(delay);
                        warn!("Accept error: {e}; retrying in {delay:?}");
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                debug!("Shutdown requested, no longer accepting connections");
                                break;
                            }
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e);
                    }
                    Ok((conn, _)) => {
                        accept_backoff = None;
                        conn
                    }
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };
            let conn = server.serve_connection(TokioIo::new(conn), service.clone());
            let conn = graceful.watch(conn);
            joinset.spawn(async move {
                if let Err(e) = conn.await {
                    debug!("Connection error: {e}");
                }
            });
        }

        drop(listener);
        Ok(drain_connections(graceful.shutdown(), &mut joinset, shutdown_timeout).await)
    }

    pub fn endpoint_handler<B>(&self, req: &Request<B>) -> http::Result<HttpResponse> {
        match (req.method(), req.uri().path()) {
            (&Method::GET | &Method::HEAD, COVERAGE_ENDPOINT_PATH) => self.coverage_handler(),
            (&Method::GET | &Method::HEAD, PROFILE_ENDPOINT_PATH) => self.profile_handler(),
            (&Method::GET | &Method::POST, CLEAR_ENDPOINT_PATH) => self.clear_handler(),
            (_, COVERAGE_ENDPOINT_PATH | PROFILE_ENDPOINT_PATH | CLEAR_ENDPOINT_PATH) => {
                log_and_create_http_response(
                    &format!("Method {} not allowed on {}", req.method(), req.uri().path()),
                    StatusCode::METHOD_NOT_ALLOWED,
                )
            }
            _ => {
                let mut not_found = Response::default();
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                Ok(not_found)
            }
        }
    }

    fn coverage_handler(&self) -> http::Result<HttpResponse> {
        let snapshot = self.load_snapshot();
        create_text_response(format_coverage(&snapshot))
    }

    fn profile_handler(&self) -> http::Result<HttpResponse> {
        let snapshot = self.load_snapshot();
        create_text_response(render_profile(self.mode, &snapshot))
    }

    fn clear_handler(&self) -> http::Result<HttpResponse> {
        self.registry.clear();
        debug!("Coverage counters cleared");
        create_text_response(CLEAR_RESPONSE)
    }

    fn load_snapshot(&self) -> CoverageSnapshot {
        match self.registry.load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Corrupted coverage metadata, aborting: {e}");
                std::process::abort();
            }
        }
    }
}

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Out of file descriptors, buffers or memory. The listener is still usable
/// once the process frees some.
pub fn is_resource_exhaustion(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::OutOfMemory {
        return true;
    }
    #[cfg(unix)]
    if let Some(code) = e.raw_os_error() {
        return matches!(
            code,
            libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM
        );
    }
    false
}

/// 5ms, doubling on every consecutive failure, capped at one second.
pub fn next_accept_backoff(previous: Option<Duration>) -> Duration {
    match previous {
        None => MIN_ACCEPT_BACKOFF,
        Some(delay) => (delay * 2).min(MAX_ACCEPT_BACKOFF),
    }
}

/// Waits for `graceful` up to `deadline`; past it every connection task is
/// aborted, which closes its socket.
pub async fn drain_connections<F>(
    graceful: F,
    connections: &mut JoinSet<()>,
    deadline: Duration,
) -> HttpShutdown
where
    F: Future<Output = ()>,
{
    match tokio::time::timeout(deadline, graceful).await {
        Ok(()) => HttpShutdown::Graceful,
        Err(_) => {
            connections.abort_all();
            while connections.join_next().await.is_some() {}
            HttpShutdown::Forced
        }
    }
}
