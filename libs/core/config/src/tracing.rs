use crate::Environment;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::sync::OnceLock;
use tracing::{debug, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Install color-eyre with a project-standard configuration.
///
/// Safe to call multiple times; later calls are ignored.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Initialize tracing for a service with environment-aware formatting.
///
/// Layers installed on the registry:
/// - `fmt` layer: JSON in production, pretty output in development
/// - `ErrorLayer` so eyre reports carry span traces
/// - an OpenTelemetry layer, so every `tracing` span also has a W3C trace
///   context that can be injected into outgoing message headers
/// - `EnvFilter` from `RUST_LOG`, defaulting to `info` (production) or `debug`
///
/// The W3C `TraceContextPropagator` is registered as the global text-map
/// propagator. No span exporter is configured here; spans exist to carry
/// context across process boundaries.
///
/// Calling this more than once is harmless (common in tests).
pub fn init_tracing(environment: &Environment, service_name: &str) {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let provider = TRACER_PROVIDER.get_or_init(|| SdkTracerProvider::builder().build());
    let tracer = provider.tracer(service_name.to_string());

    let is_production = environment.is_production();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if is_production {
            EnvFilter::new("info,sea_orm=warn,sqlx=warn")
        } else {
            EnvFilter::new("debug,sqlx=info,h2=info,tower=info")
        }
    });

    let result = if is_production {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false)
                    .pretty(),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .with(filter)
            .try_init()
    };

    match result {
        Ok(_) => {
            info!(
                service = %service_name,
                "Tracing initialized with ErrorLayer and OpenTelemetry. Environment: {:?}",
                environment
            );
        }
        Err(_) => {
            debug!("Tracing already initialized, skipping re-initialization");
        }
    }
}

/// Flush and shut down the tracer provider installed by [`init_tracing`].
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            warn!(error = %e, "Tracer provider shutdown failed");
        }
    }
}
