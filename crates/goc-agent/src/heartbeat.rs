// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::registration::RegistrationClient;

/// Periodically re-registers the agent so a restarted center relearns it.
#[derive(Default)]
pub struct HeartbeatScheduler {
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Spawns the heartbeat loop. Calling it again while running is a no-op.
    pub fn start(&mut self, interval: Duration, client: Arc<RegistrationClient>) {
        if self.task.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick fires immediately; registration already happened at startup
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Heartbeat stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = token.cancelled() => {
                                debug!("Heartbeat stopped during registration");
                                return;
                            }
                            result = client.register_self() => match result {
                                Ok(_) => debug!("Heartbeat registration succeeded"),
                                Err(e) => error!("Heartbeat registration failed: {e}"),
                            },
                        }
                    }
                }
            }
        }));
        self.cancel = Some(cancel);
    }

    /// Stops the loop, abandoning an in-flight registration. Safe to call
    /// twice or without a prior `start`.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Heartbeat task failed: {e}");
            }
        }
    }
}
