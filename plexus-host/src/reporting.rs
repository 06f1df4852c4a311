//! Process-wide diagnostics for the host: the stderr tracing subscriber and
//! an eyre hook that carries the spans active at report time, so a failed
//! offer or load names the class and connection it happened under.

use std::fmt;

use eyre::EyreHandler;
use tracing_error::{SpanTrace, SpanTraceStatus};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Installs the subscriber and the span-aware error hook.
///
/// The filter comes from `PLEXUS_HOST_LOG` and defaults to `info`. Must run
/// before the first report or span.
pub fn install() -> eyre::Result<()> {
    eyre::set_hook(Box::new(SpanAwareHandler::install))?;

    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .with_env_var("PLEXUS_HOST_LOG")
                    .from_env()?,
            )
            .with_writer(std::io::stderr)
            .compact()
            .finish()
            .with(tracing_error::ErrorLayer::default()),
    )?;

    Ok(())
}

/// Wraps the stock eyre handler and appends the captured span context to the
/// report's debug output.
struct SpanAwareHandler {
    stock: Box<dyn EyreHandler>,
    spans: SpanTrace,
}

impl SpanAwareHandler {
    fn install(error: &(dyn std::error::Error + 'static)) -> Box<dyn EyreHandler> {
        Box::new(Self {
            stock: eyre::DefaultHandler::default_with(error),
            spans: SpanTrace::capture(),
        })
    }
}

impl EyreHandler for SpanAwareHandler {
    fn debug(
        &self,
        error: &(dyn std::error::Error + 'static),
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        self.stock.debug(error, f)?;
        if self.spans.status() == SpanTraceStatus::CAPTURED {
            write!(f, "\n\nIn spans:\n{}", self.spans)?;
        }
        Ok(())
    }

    fn display(
        &self,
        error: &(dyn std::error::Error + 'static),
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        self.stock.display(error, f)
    }

    fn track_caller(&mut self, location: &'static std::panic::Location<'static>) {
        self.stock.track_caller(location);
    }
}
