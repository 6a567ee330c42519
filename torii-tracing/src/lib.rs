use anyhow::Result;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::Registry;

/// Install the global subscriber.
///
/// `mode` is either an `EnvFilter` directive (`info`,
/// `torii_gateway=debug`, ...) or one of the formatted modes `json` /
/// `pretty`, which log at the `RUST_LOG` level or `info`.
pub fn init(mode: &str) -> Result<()> {
    let filter = match mode {
        "json" | "pretty" => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        directive => EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let fmt_layer: Box<dyn tracing_subscriber::Layer<Registry> + Send + Sync> = match mode {
        "json" => Box::new(
            fmt::layer()
                .json()
                .with_thread_ids(true)
                .with_filter(filter),
        ),
        "pretty" => Box::new(fmt::layer().pretty().with_filter(filter)),
        _ => Box::new(fmt::layer().with_filter(filter)),
    };

    let subscriber = Registry::default().with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
