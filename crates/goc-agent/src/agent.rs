// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of the embedded coverage agent.
//!
//! `Starting -> Serving -> Draining -> Stopped`. A broken HTTP server while
//! serving ends the agent with an error; a termination signal or
//! [`AgentHandle::shutdown`] drains it: heartbeat stop, deregistration, then a
//! deadline-bounded HTTP shutdown.

use std::future::Future;
use std::io;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{Config, ConfigError};
use crate::coverage::{CoverageError, Registry};
use crate::heartbeat::HeartbeatScheduler;
use crate::listener::{ListenerError, ListenerManager};
use crate::logger;
use crate::profile_server::{HttpShutdown, ProfileServer};
use crate::registration::{
    CoordinatorTransport, RegistrationClient, RegistrationError, ReqwestTransport,
};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Coverage(#[from] CoverageError),

    #[error("listen failed, err: {0}")]
    Listener(#[from] ListenerError),

    #[error("center client setup failed, err: {0}")]
    Registration(#[from] RegistrationError),

    #[error("goc agent failed to serve, {0}")]
    Serve(#[source] io::Error),

    #[error("failed to start the agent runtime: {0}")]
    Runtime(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AgentState {
    Starting,
    Serving,
    Draining,
    Stopped,
}

/// One step of the drain sequence, in the order it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStep {
    HeartbeatStopped,
    Deregistered { ok: bool },
    HttpShutdown { forced: bool },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub steps: Vec<DrainStep>,
}

/// Cloneable control surface of a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    shutdown_token: CancellationToken,
    state: watch::Receiver<AgentState>,
    port: Arc<OnceLock<u16>>,
}

impl AgentHandle {
    /// Requests the same drain sequence a termination signal triggers.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Port the agent is listening on, once bound.
    pub fn port(&self) -> Option<u16> {
        self.port.get().copied()
    }

    /// Waits until the agent leaves `Starting`. Returns the listen port if it
    /// reached `Serving`, `None` if startup failed.
    pub async fn wait_until_serving(&mut self) -> Option<u16> {
        let state = match self.state.wait_for(|s| *s != AgentState::Starting).await {
            Ok(state) => *state,
            Err(_) => AgentState::Stopped,
        };
        match state {
            AgentState::Serving => self.port(),
            _ => None,
        }
    }

    pub async fn wait_until_stopped(&mut self) {
        let _ = self.state.wait_for(|s| *s == AgentState::Stopped).await;
    }
}

pub struct CoverAgent {
    config: Config,
    registry: Arc<Registry>,
    transport: Option<Arc<dyn CoordinatorTransport>>,
    shutdown_token: CancellationToken,
    state_tx: watch::Sender<AgentState>,
    state_rx: watch::Receiver<AgentState>,
    port: Arc<OnceLock<u16>>,
}

impl CoverAgent {
    pub fn new(config: Config, registry: Registry) -> Self {
        let (state_tx, state_rx) = watch::channel(AgentState::Starting);
        CoverAgent {
            config,
            registry: Arc::new(registry),
            transport: None,
            shutdown_token: CancellationToken::new(),
            state_tx,
            state_rx,
            port: Arc::new(OnceLock::new()),
        }
    }

    /// Talks to the center through `transport` instead of a reqwest client.
    pub fn with_transport(mut self, transport: Arc<dyn CoordinatorTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            shutdown_token: self.shutdown_token.clone(),
            state: self.state_rx.clone(),
            port: self.port.clone(),
        }
    }

    /// Runs until SIGINT, SIGTERM or SIGQUIT (or a handle shutdown).
    pub async fn run(self) -> Result<ShutdownReport, AgentError> {
        self.run_until(wait_for_termination_signal()).await
    }

    /// Runs until `signal` resolves (or a handle shutdown), then drains.
    pub async fn run_until<F>(self, signal: F) -> Result<ShutdownReport, AgentError>
    where
        F: Future<Output = ()>,
    {
        let result = self.run_inner(signal).await;
        self.set_state(AgentState::Stopped);
        result
    }

    async fn run_inner<F>(&self, signal: F) -> Result<ShutdownReport, AgentError>
    where
        F: Future<Output = ()>,
    {
        let start_time = Instant::now();
        self.config.validate()?;

        let snapshot = self.registry.load()?;
        debug!(
            "Loaded coverage for {} files, {} blocks",
            snapshot.counters.len(),
            snapshot.total_blocks()
        );
        drop(snapshot);

        let bound = ListenerManager::new(&self.config).acquire().await?;
        let port = bound.port;
        let _ = self.port.set(port);

        let mut heartbeat = HeartbeatScheduler::new();
        let client = if self.config.singleton {
            None
        } else {
            let client = Arc::new(self.registration_client(port)?);
            match client.register_self().await {
                Ok(response) => info!(
                    "Registered {} with the center: {}",
                    client.service_name(),
                    String::from_utf8_lossy(&response)
                ),
                // the heartbeat keeps retrying; local coverage stays available
                Err(e) => {
                    error!("Register address failed, err: {e}");
                    if let Some(body) = e.response_body() {
                        error!("Center response: {}", String::from_utf8_lossy(body));
                    }
                }
            }
            heartbeat.start(self.config.heartbeat_interval, client.clone());
            Some(client)
        };

        let server = ProfileServer::new(self.registry.clone(), self.config.mode);
        let server_shutdown = CancellationToken::new();
        let server_token = server_shutdown.clone();
        let shutdown_timeout = self.config.shutdown_timeout;
        let mut server_task = tokio::spawn(async move {
            server
                .serve(bound.listener, server_token, shutdown_timeout)
                .await
        });

        self.set_state(AgentState::Serving);
        info!(
            "Coverage agent listening on port {port}, ready in {} ms",
            start_time.elapsed().as_millis()
        );

        tokio::pin!(signal);
        tokio::select! {
            served = &mut server_task => {
                heartbeat.stop().await;
                let e = match served {
                    Ok(Err(e)) => e,
                    Ok(Ok(_)) => io::Error::other("server stopped unexpectedly"),
                    Err(e) => io::Error::other(e.to_string()),
                };
                return Err(AgentError::Serve(e));
            }
            () = &mut signal => info!("goc agent is shutting down..."),
            () = self.shutdown_token.cancelled() => info!("goc agent is shutting down..."),
        }

        self.set_state(AgentState::Draining);
        let mut report = ShutdownReport::default();

        if heartbeat.is_running() {
            heartbeat.stop().await;
            report.steps.push(DrainStep::HeartbeatStopped);
        }

        if let Some(client) = client {
            let ok = match client.deregister_self().await {
                Ok(response) => {
                    info!("Deregistered: {}", String::from_utf8_lossy(&response));
                    true
                }
                Err(e) => {
                    error!("Deregister failed: {e}");
                    false
                }
            };
            report.steps.push(DrainStep::Deregistered { ok });
        }

        server_shutdown.cancel();
        let forced = match server_task.await {
            Ok(Ok(HttpShutdown::Graceful)) => {
                info!("goc agent already shutdown");
                false
            }
            Ok(Ok(HttpShutdown::Forced)) => {
                info!("goc agent already forced shutdown");
                true
            }
            Ok(Err(e)) => {
                error!("goc agent server failed while shutting down: {e}");
                true
            }
            Err(e) => {
                error!("goc agent server task failed: {e}");
                true
            }
        };
        report.steps.push(DrainStep::HttpShutdown { forced });

        Ok(report)
    }

    fn registration_client(&self, port: u16) -> Result<RegistrationClient, AgentError> {
        let center = self
            .config
            .center
            .as_deref()
            .ok_or(ConfigError::MissingCenter)?;
        let transport: Arc<dyn CoordinatorTransport> = match &self.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(ReqwestTransport::new(self.config.request_timeout).map_err(
                |source| RegistrationError::Transport {
                    action: "connect to",
                    source,
                },
            )?),
        };
        Ok(RegistrationClient::new(
            center,
            self.config.service_name.clone(),
            port,
            transport,
        )?)
    }

    fn set_state(&self, state: AgentState) {
        debug!("Agent state: {state:?}");
        self.state_tx.send_replace(state);
    }
}

/// Resolves on the first SIGINT, SIGTERM or SIGQUIT.
#[cfg(unix)]
pub async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let streams = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    );
    let (mut interrupt, mut terminate, mut quit) = match streams {
        (Ok(interrupt), Ok(terminate), Ok(quit)) => (interrupt, terminate, quit),
        _ => {
            error!("Failed to install signal handlers, falling back to Ctrl+C");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {e}");
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => debug!("Received SIGINT"),
        _ = terminate.recv() => debug!("Received SIGTERM"),
        _ = quit.recv() => debug!("Received SIGQUIT"),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_termination_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
}

/// Starts the agent on its own thread and runtime, next to the host program.
///
/// The process exits once the agent stops: status `0` after a signal-driven
/// drain, `1` after a fatal error.
pub fn start(config: Config, registry: Registry) -> Result<AgentHandle, AgentError> {
    logger::init("info");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(AgentError::Runtime)?;
    let agent = CoverAgent::new(config, registry);
    let handle = agent.handle();

    std::thread::Builder::new()
        .name("goc-agent".to_string())
        .spawn(move || {
            let exit_code = match runtime.block_on(agent.run()) {
                Ok(report) => {
                    debug!("Drain sequence: {:?}", report.steps);
                    0
                }
                Err(e) => {
                    error!("{e}");
                    1
                }
            };
            std::process::exit(exit_code);
        })
        .map_err(AgentError::Runtime)?;

    Ok(handle)
}
