// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log formatting for the embedded agent.
//!
//! The agent shares stdout/stderr with the host program, so every line it
//! emits carries a fixed prefix:
//!
//! ```text
//! GOC_AGENT | LEVEL | [span{fields}: ]message fields
//! ```

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

pub const LOG_PREFIX: &str = "GOC_AGENT";

/// Environment variable overriding the agent's log filter.
pub const LOG_LEVEL_ENV: &str = "GOC_LOG_LEVEL";

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "{LOG_PREFIX} | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Filter directive for the agent at `level`, keeping the HTTP stack quiet.
pub fn env_filter_directive(level: &str) -> String {
    format!("h2=off,hyper=off,hyper_util=off,reqwest=off,rustls=off,{level}")
}

/// Installs the agent's subscriber as the global default.
///
/// The host program may already own the global subscriber; in that case the
/// agent's events flow into it and this call does nothing.
pub fn init(level: &str) {
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| level.to_string());
    let filter = match EnvFilter::try_new(env_filter_directive(&level)) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("{LOG_PREFIX} | WARN | invalid log level {level}: {e}, using info");
            EnvFilter::new(env_filter_directive("info"))
        }
    };

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(Formatter)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        tracing::debug!("Logging subsystem enabled");
    }
}
