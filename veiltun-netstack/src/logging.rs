use crate::error::{NetStackError, Result};
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

/// Initialize the tracing subscriber once. Safe to call repeatedly; only
/// the first call wins, later calls are no-ops.
pub fn init_logging(level: Level) -> Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = init_inner(level);
    });
    result
}

fn init_inner(level: Level) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive(directive(&format!("veiltun_netstack={}", level))?)
        .add_directive(directive(&format!("veiltun_protocol={}", level))?)
        .add_directive(directive("tokio=warn")?)
        .add_directive(directive("tungstenite=warn")?)
        .add_directive(directive("rustls=warn")?);

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .with_filter(filter);

    // another subscriber may already be installed by the host; fine
    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
    Ok(())
}

fn directive(expr: &str) -> Result<Directive> {
    expr.parse()
        .map_err(|e| NetStackError::Unsupported(format!("Invalid log directive '{}': {}", expr, e)))
}
