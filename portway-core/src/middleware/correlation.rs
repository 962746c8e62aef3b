//! Correlation middleware.
//!
//! The pipeline derives the correlation id before the chain runs and
//! echoes it on every response; this middleware guarantees the id is
//! non-empty for contexts built outside the pipeline (tests, plugin-added
//! routes driven directly) and publishes it as a typed state entry so
//! later middleware and handlers can read it without knowing the header
//! configuration.

use std::future::Future;
use std::pin::Pin;

use crate::context::{generate, Context};
use crate::error::PortwayError;

use super::Next;

/// The request's correlation id, stashed in [`Context::state`].
pub struct CorrelationTag(pub String);

pub struct CorrelationMiddleware;

impl super::Middleware for CorrelationMiddleware {
    fn name(&self) -> &str {
        "correlation"
    }

    fn around<'a>(
        &'a self,
        mut ctx: Context,
        next: Next,
    ) -> Pin<Box<dyn Future<Output = Result<(Context, serde_json::Value), PortwayError>> + Send + 'a>>
    {
        Box::pin(async move {
            if ctx.correlation_id.is_empty() {
                ctx.correlation_id = generate();
            }
            ctx.state.insert(CorrelationTag(ctx.correlation_id.clone()));
            next.run(ctx).await
        })
    }
}
