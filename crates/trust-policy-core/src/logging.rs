//! Log formatting for hosts embedding the policy engine.
//!
//! Every line is prefixed with `TRUST_POLICY` so policy decisions can be
//! filtered out of a host's combined output:
//!
//! ```text
//! TRUST_POLICY | INFO | policy verified policy_ref="refs/gittuf/policy" version=3 [verify_policy policy_ref="refs/gittuf/policy"]
//! TRUST_POLICY | WARN | key is not a root key key_id="ab12..." [mutation op="add_root_key" key_id="ab12..."]
//! ```

use std::fmt;

use thiserror::Error;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, PolicyEnv};

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid logging configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid log filter: {0}")]
    InvalidFilter(#[from] tracing_subscriber::filter::ParseError),
    #[error("a global subscriber is already installed: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Log formatter that prefixes messages with `TRUST_POLICY` and the level.
///
/// The event message and fields come first so lines stay greppable by
/// message. The operation context (active spans, outermost first) trails in
/// brackets, separated by ` > `.
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
        let metadata = event.metadata();
        write!(&mut writer, "TRUST_POLICY | {} | ", metadata.level())?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        if let Some(scope) = ctx.event_scope() {
            let mut separator = " [";
            for span in scope.from_root() {
                write!(writer, "{separator}{}", span.name())?;
                separator = " > ";
                let ext = span.extensions();
                match ext.get::<FormattedFields<N>>() {
                    Some(fields) if !fields.is_empty() => write!(writer, " {fields}")?,
                    _ => {}
                }
            }
            if separator == " > " {
                write!(writer, "]")?;
            }
        }
        writeln!(writer)
    }
}

/// Installs the global subscriber using the configured log level.
///
/// Calling this twice returns [`LoggingError::AlreadyInitialized`].
pub fn init(env: &PolicyEnv) -> Result<(), LoggingError> {
    env.validate()?;
    let filter = EnvFilter::try_new(&env.log_level)?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    tracing::debug!(level = %env.log_level, "logging initialized");
    Ok(())
}
