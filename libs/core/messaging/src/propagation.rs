//! W3C trace-context propagation over message headers

use crate::message::Headers;
use opentelemetry::Context;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Write the current span's trace context (`traceparent`, `tracestate`) into `headers`.
pub fn inject_trace_context(headers: &mut Headers) {
    let cx = Span::current().context();
    TraceContextPropagator::new().inject_context(&cx, headers);
}

/// Read a trace context previously injected by a producer.
pub fn extract_trace_context(headers: &Headers) -> Context {
    TraceContextPropagator::new().extract(headers)
}

/// Make `span` a child of the producer's trace carried in `headers`.
pub fn set_parent_from_headers(span: &Span, headers: &Headers) {
    let parent = extract_trace_context(headers);
    span.set_parent(parent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{TraceContextExt, TracerProvider as _};
    use opentelemetry_sdk::trace::SdkTracerProvider;
    use tracing_subscriber::layer::SubscriberExt;

    const TRACEPARENT: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    #[test]
    fn test_extract_reads_traceparent() {
        let headers: Headers = [("traceparent", TRACEPARENT)].into_iter().collect();
        let cx = extract_trace_context(&headers);
        let span_context = cx.span().span_context().clone();

        assert!(span_context.is_valid());
        assert!(span_context.is_remote());
        assert_eq!(
            span_context.trace_id().to_string(),
            "0af7651916cd43dd8448eb211c80319c"
        );
    }

    #[test]
    fn test_extract_without_headers_is_empty() {
        let cx = extract_trace_context(&Headers::new());
        assert!(!cx.span().span_context().is_valid());
    }

    #[test]
    fn test_inject_continues_parent_trace() {
        let provider = SdkTracerProvider::builder().build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("test")));

        tracing::subscriber::with_default(subscriber, || {
            let incoming: Headers = [("traceparent", TRACEPARENT)].into_iter().collect();
            let span = tracing::info_span!("consume");
            set_parent_from_headers(&span, &incoming);
            let _guard = span.enter();

            let mut outgoing = Headers::new();
            inject_trace_context(&mut outgoing);

            let traceparent = outgoing.get("traceparent").unwrap();
            assert!(traceparent.contains("0af7651916cd43dd8448eb211c80319c"));
            assert_ne!(traceparent, TRACEPARENT);
        });
    }

    #[test]
    fn test_inject_without_active_trace_writes_nothing() {
        let mut headers = Headers::new();
        inject_trace_context(&mut headers);
        assert!(headers.get("traceparent").is_none());
    }
}
