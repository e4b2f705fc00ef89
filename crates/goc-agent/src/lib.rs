// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Embedded coverage agent.
//!
//! Linked into an instrumented service binary, the agent exposes the live
//! statement-coverage counters over HTTP, registers the instance with a goc
//! center so fleets can be aggregated centrally, keeps that registration fresh
//! with heartbeats and deregisters on termination.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod config;
pub mod coverage;
pub mod heartbeat;
pub mod http_utils;
pub mod listener;
pub mod logger;
pub mod profile_server;
pub mod registration;

pub use agent::{start, AgentError, AgentHandle, AgentState, CoverAgent, DrainStep, ShutdownReport};
pub use config::{Config, CoverMode};
pub use coverage::{CoverVar, PackageCover, Registry};
