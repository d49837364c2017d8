//! Shutdown hooks.
//!
//! Two ordered sequences of named callbacks, run before the servers are
//! asked to drain and after every drain attempt has finished. A failing (or
//! panicking) hook is recorded and the sequence carries on.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;

use crate::lifecycle::shutdown::ShutdownContext;
use crate::observability::metrics;

/// Boxed error returned by hook callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type HookFn = dyn Fn(ShutdownContext) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync;

/// When a hook runs relative to the server drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    BeforeShutdown,
    AfterShutdown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::BeforeShutdown => "before_shutdown",
            Phase::AfterShutdown => "after_shutdown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hook that returned an error or panicked.
#[derive(Debug, Error)]
#[error("{phase} hook {name:?} failed: {source}")]
pub struct HookError {
    pub phase: Phase,
    pub name: String,
    #[source]
    pub source: BoxError,
}

impl HookError {
    pub fn new(phase: Phase, name: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            phase,
            name: name.into(),
            source: source.into(),
        }
    }
}

/// A named shutdown callback.
#[derive(Clone)]
pub struct Hook {
    name: Arc<str>,
    func: Arc<HookFn>,
}

impl Hook {
    /// Wrap an async callback. The callback receives the shutdown context and
    /// should return early once the context is done.
    pub fn new<F, Fut, E>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(ShutdownContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let name: String = name.into();
        Self {
            name: name.into(),
            func: Arc::new(move |ctx| {
                let fut = func(ctx);
                async move { fut.await.map_err(Into::into) }.boxed()
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, phase: Phase, ctx: &ShutdownContext) -> Result<(), HookError> {
        let outcome = AssertUnwindSafe((self.func)(ctx.clone()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(HookError::new(phase, self.name(), source)),
            Err(_) => Err(HookError::new(phase, self.name(), "hook panicked")),
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook").field("name", &self.name).finish()
    }
}

/// The before/after hook sequences, in registration order.
#[derive(Debug, Clone, Default)]
pub struct Hooks {
    before: Vec<Hook>,
    after: Vec<Hook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, phase: Phase, hook: Hook) {
        match phase {
            Phase::BeforeShutdown => self.before.push(hook),
            Phase::AfterShutdown => self.after.push(hook),
        }
    }

    pub fn get(&self, phase: Phase) -> &[Hook] {
        match phase {
            Phase::BeforeShutdown => &self.before,
            Phase::AfterShutdown => &self.after,
        }
    }

    /// Run every hook of `phase` in order and collect the failures.
    pub async fn run(&self, phase: Phase, ctx: &ShutdownContext) -> Vec<HookError> {
        let mut errors = Vec::new();

        for hook in self.get(phase) {
            let started = Instant::now();
            tracing::debug!(phase = %phase, hook = hook.name(), "Running hook");

            match hook.run(phase, ctx).await {
                Ok(()) => {
                    metrics::record_hook(phase, true);
                    tracing::debug!(
                        phase = %phase,
                        hook = hook.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Hook finished"
                    );
                }
                Err(err) => {
                    metrics::record_hook(phase, false);
                    tracing::warn!(phase = %phase, hook = hook.name(), error = %err, "Hook failed");
                    errors.push(err);
                }
            }
        }

        errors
    }
}
