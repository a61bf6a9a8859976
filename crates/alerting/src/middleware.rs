//! Handler Composition

use alert_model::Handler;
use std::sync::Arc;

/// A pipeline stage: wraps the next handler and returns the stage's handler
pub type Middleware = Box<dyn FnOnce(Arc<dyn Handler>) -> Arc<dyn Handler> + Send>;

/// Compose stages so that the first one is outermost.
///
/// `chain(vec![a, b, c])(terminal)` yields a handler through which batches
/// flow `a → b → c → terminal`.
pub fn chain(middlewares: Vec<Middleware>) -> Middleware {
    Box::new(move |terminal| {
        middlewares
            .into_iter()
            .rev()
            .fold(terminal, |next, middleware| middleware(next))
    })
}
