use std::fmt;
use std::sync::Arc;

use labelscope_core::{ContextId, LabelValue};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::Subscriber;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use crate::hooks::{ContextHooks, HostCapabilities};
use crate::registry::Registry;

/// `tracing` layer that treats every span as an execution context.
///
/// A new span is created from its parent span's context, or from the
/// current context for root spans. Entering a span runs its context,
/// exiting stops it, and closing destroys it. Span fields named with
/// [`with_fields`](Self::with_fields) become labels of the new context.
pub struct LabelLayer {
    registry: Arc<Registry>,
    fields: Vec<&'static str>,
}

/// Span extension holding the span's context id.
struct SpanContext(ContextId);

impl LabelLayer {
    /// Build a layer driving `registry`. Binds full host capabilities if no
    /// host has been bound yet.
    pub fn new(registry: Arc<Registry>) -> Self {
        let _ = registry.bind_host_if_unbound(HostCapabilities::full());
        Self {
            registry,
            fields: Vec::new(),
        }
    }

    /// Lift these span fields into labels when a span is created.
    #[must_use]
    pub fn with_fields(mut self, fields: impl IntoIterator<Item = &'static str>) -> Self {
        self.fields.extend(fields);
        self
    }

    fn context_of<S>(id: &Id, ctx: &Context<'_, S>) -> Option<ContextId>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
    {
        let span = ctx.span(id)?;
        let extensions = span.extensions();
        extensions.get::<SpanContext>().map(|c| c.0)
    }
}

impl fmt::Debug for LabelLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabelLayer")
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for LabelLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let trigger = span
            .parent()
            .and_then(|parent| parent.extensions().get::<SpanContext>().map(|c| c.0))
            .unwrap_or_else(|| self.registry.current_context());

        let mut visitor = FieldVisitor {
            wanted: &self.fields,
            labels: Vec::new(),
        };
        if !self.fields.is_empty() {
            attrs.record(&mut visitor);
        }

        let child = self.registry.next_context_id();
        self.registry.on_create_with(child, trigger, visitor.labels);
        span.extensions_mut().insert(SpanContext(child));
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(child) = Self::context_of(id, &ctx) {
            self.registry.on_before_run(child);
        }
    }

    fn on_exit(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(child) = Self::context_of(id, &ctx) {
            self.registry.on_after_run(child);
        }
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        if let Some(child) = Self::context_of(&id, &ctx) {
            self.registry.on_destroy(child);
        }
    }
}

/// Collects allow-listed span fields as label values.
struct FieldVisitor<'a> {
    wanted: &'a [&'static str],
    labels: Vec<(&'static str, LabelValue)>,
}

impl FieldVisitor<'_> {
    fn push(&mut self, field: &Field, value: LabelValue) {
        if self.wanted.contains(&field.name()) {
            self.labels.push((field.name(), value));
        }
    }
}

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, LabelValue::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, LabelValue::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, LabelValue::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, LabelValue::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.push(field, LabelValue::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, LabelValue::from(format!("{value:?}")));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
