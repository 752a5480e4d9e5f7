//! Typed message processing pipelines.
//!
//! A [`Pipeline<T>`] runs, for each message:
//!
//! 1. its filters in insertion order; the first filter returning `false`
//!    drops the message quietly,
//! 2. the terminal [`Handler`],
//! 3. every transformer stage in registration order, each converting the
//!    message into a new type and feeding it into a chained `Pipeline<U>`.
//!
//! Transformers run after the handler: the handler sees every accepted
//! message, and transformers fan out derived variants of it.
//!
//! Errors and panics raised anywhere in the chain are caught by
//! [`Pipeline::process`], logged with the pipeline name, and the message is
//! dropped. Processing of one message is sequential; separate messages may
//! be processed concurrently.

use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Predicate deciding whether a message continues through the pipeline.
pub trait Filter<T>: Send + Sync {
    fn accept(&self, msg: &T) -> bool;
}

impl<T, F> Filter<T> for F
where
    F: Fn(&T) -> bool + Send + Sync,
{
    fn accept(&self, msg: &T) -> bool {
        self(msg)
    }
}

/// Terminal handler of a pipeline.
#[async_trait]
pub trait Handler<T>: Send + Sync {
    async fn handle(&self, msg: &T) -> anyhow::Result<()>;
}

/// Converts a message of one type into another.
#[async_trait]
pub trait Stage<In, Out>: Send + Sync {
    async fn transform(&self, input: &In) -> anyhow::Result<Out>;
}

/// Handler built from an async closure taking the message by value.
pub struct FnHandler<F>(F);

/// Wrap an async closure as a [`Handler`]. The message is cloned into the call.
///
/// # Example
///
/// ```
/// use giztoy_pubsub::{Pipeline, handler_fn};
///
/// let pipeline = Pipeline::new("numbers", handler_fn(|n: u32| async move {
///     println!("got {n}");
///     Ok(())
/// }));
/// # let _ = pipeline;
/// ```
pub fn handler_fn<T, F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<T, F, Fut> Handler<T> for FnHandler<F>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, msg: &T) -> anyhow::Result<()> {
        (self.0)(msg.clone()).await
    }
}

/// Stage built from a synchronous conversion closure.
pub struct FnStage<F, In, Out> {
    f: F,
    _types: PhantomData<fn(&In) -> Out>,
}

/// Wrap a conversion closure as a [`Stage`].
pub fn stage_fn<F, In, Out>(f: F) -> FnStage<F, In, Out>
where
    F: Fn(&In) -> anyhow::Result<Out> + Send + Sync,
{
    FnStage {
        f,
        _types: PhantomData,
    }
}

#[async_trait]
impl<F, In, Out> Stage<In, Out> for FnStage<F, In, Out>
where
    F: Fn(&In) -> anyhow::Result<Out> + Send + Sync,
    In: Send + Sync,
{
    async fn transform(&self, input: &In) -> anyhow::Result<Out> {
        (self.f)(input)
    }
}

/// What happened to a processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler (and all transformer stages) completed.
    Handled,
    /// A filter rejected the message.
    Filtered,
    /// Something failed; the message was dropped and the failure logged.
    Failed,
}

/// A transformer stage erased over its output type.
#[async_trait]
trait Downstream<T>: Send + Sync {
    async fn run(&self, input: &T) -> Result<Outcome>;
}

struct Link<In, Out> {
    stage: Box<dyn Stage<In, Out>>,
    next: Pipeline<Out>,
}

#[async_trait]
impl<In, Out> Downstream<In> for Link<In, Out>
where
    In: Send + Sync + 'static,
    Out: Send + Sync + 'static,
{
    async fn run(&self, input: &In) -> Result<Outcome> {
        let output = self
            .stage
            .transform(input)
            .await
            .map_err(|e| failure(&self.next.name, "transformer", e))?;
        self.next.run(&output).await
    }
}

fn failure(pipeline: &str, part: &str, e: anyhow::Error) -> Error {
    Error::Pipeline {
        pipeline: pipeline.to_string(),
        reason: format!("{part}: {e:#}"),
    }
}

/// Ordered filter/handler/transformer chain for messages of type `T`.
pub struct Pipeline<T> {
    name: String,
    filters: Vec<Box<dyn Filter<T>>>,
    handler: Box<dyn Handler<T>>,
    downstream: Vec<Box<dyn Downstream<T>>>,
}

impl<T: Send + Sync + 'static> Pipeline<T> {
    /// Create a pipeline ending in `handler`.
    pub fn new(name: impl Into<String>, handler: impl Handler<T> + 'static) -> Self {
        Self {
            name: name.into(),
            filters: Vec::new(),
            handler: Box::new(handler),
            downstream: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a filter.
    pub fn add_filter(&mut self, filter: impl Filter<T> + 'static) -> &mut Self {
        self.filters.push(Box::new(filter));
        self
    }

    /// Builder form of [`Pipeline::add_filter`].
    pub fn with_filter(mut self, filter: impl Filter<T> + 'static) -> Self {
        self.add_filter(filter);
        self
    }

    /// Chain `next` after this pipeline through `stage`.
    ///
    /// `next` carries its own handler, filters and further stages.
    pub fn add_transformer<U>(
        &mut self,
        stage: impl Stage<T, U> + 'static,
        next: Pipeline<U>,
    ) -> &mut Self
    where
        U: Send + Sync + 'static,
    {
        self.downstream.push(Box::new(Link {
            stage: Box::new(stage),
            next,
        }));
        self
    }

    /// Builder form of [`Pipeline::add_transformer`].
    pub fn with_transformer<U>(mut self, stage: impl Stage<T, U> + 'static, next: Pipeline<U>) -> Self
    where
        U: Send + Sync + 'static,
    {
        self.add_transformer(stage, next);
        self
    }

    /// Number of filters.
    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    /// Number of transformer stages.
    pub fn stage_count(&self) -> usize {
        self.downstream.len()
    }

    /// Process one message. Never fails: errors and panics are logged and
    /// reported as [`Outcome::Failed`].
    pub async fn process(&self, msg: &T) -> Outcome {
        match AssertUnwindSafe(self.run(msg)).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(pipeline = %self.name, error = %e, "pipeline: message dropped");
                Outcome::Failed
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(pipeline = %self.name, %reason, "pipeline: panicked, message dropped");
                Outcome::Failed
            }
        }
    }

    async fn run(&self, msg: &T) -> Result<Outcome> {
        for (i, filter) in self.filters.iter().enumerate() {
            if !filter.accept(msg) {
                debug!(pipeline = %self.name, filter = i, "pipeline: filtered");
                return Ok(Outcome::Filtered);
            }
        }

        self.handler
            .handle(msg)
            .await
            .map_err(|e| failure(&self.name, "handler", e))?;

        for stage in &self.downstream {
            stage.run(msg).await?;
        }
        Ok(Outcome::Handled)
    }
}

impl<T> std::fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("filters", &self.filters.len())
            .field("stages", &self.downstream.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler<T: Clone + Send + Sync + 'static>(
        counter: Arc<AtomicUsize>,
    ) -> impl Handler<T> {
        handler_fn(move |_msg: T| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_filter_false_skips_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new("p", counting_handler::<u32>(calls.clone()))
            .with_filter(|n: &u32| *n > 10);

        assert_eq!(pipeline.process(&3).await, Outcome::Filtered);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(pipeline.process(&30).await, Outcome::Handled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_filters_short_circuit_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (s1, s2, s3) = (seen.clone(), seen.clone(), seen.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let pipeline = Pipeline::new("p", counting_handler::<u32>(calls.clone()))
            .with_filter(move |_: &u32| {
                s1.lock().push(1);
                true
            })
            .with_filter(move |_: &u32| {
                s2.lock().push(2);
                false
            })
            .with_filter(move |_: &u32| {
                s3.lock().push(3);
                true
            });

        assert_eq!(pipeline.process(&1).await, Outcome::Filtered);
        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_is_swallowed() {
        let downstream_calls = Arc::new(AtomicUsize::new(0));
        let next = Pipeline::new("next", counting_handler::<String>(downstream_calls.clone()));

        let pipeline = Pipeline::new(
            "p",
            handler_fn(|_: u32| async { Err(anyhow::anyhow!("boom")) }),
        )
        .with_transformer(stage_fn(|n: &u32| Ok(n.to_string())), next);

        assert_eq!(pipeline.process(&1).await, Outcome::Failed);
        assert_eq!(downstream_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_panic_is_swallowed() {
        let pipeline = Pipeline::new(
            "p",
            handler_fn(|n: u32| async move {
                if n == 0 {
                    panic!("zero");
                }
                Ok(())
            }),
        );
        assert_eq!(pipeline.process(&0).await, Outcome::Failed);
        assert_eq!(pipeline.process(&1).await, Outcome::Handled);
    }

    #[tokio::test]
    async fn test_transformers_run_after_handler_in_order() {
        let order = Arc::new(Mutex::new(Vec::<String>::new()));

        let o = order.clone();
        let first = Pipeline::new(
            "as-string",
            handler_fn(move |s: String| {
                let o = o.clone();
                async move {
                    o.lock().push(format!("string:{s}"));
                    Ok(())
                }
            }),
        );
        let o = order.clone();
        let second = Pipeline::new(
            "doubled",
            handler_fn(move |n: u64| {
                let o = o.clone();
                async move {
                    o.lock().push(format!("doubled:{n}"));
                    Ok(())
                }
            }),
        )
        .with_filter(|n: &u64| *n < 100);

        let o = order.clone();
        let pipeline = Pipeline::new(
            "root",
            handler_fn(move |n: u32| {
                let o = o.clone();
                async move {
                    o.lock().push(format!("root:{n}"));
                    Ok(())
                }
            }),
        )
        .with_transformer(stage_fn(|n: &u32| Ok(n.to_string())), first)
        .with_transformer(stage_fn(|n: &u32| Ok(u64::from(*n) * 2)), second);

        assert_eq!(pipeline.stage_count(), 2);
        assert_eq!(pipeline.process(&21).await, Outcome::Handled);
        assert_eq!(
            *order.lock(),
            vec!["root:21", "string:21", "doubled:42"]
        );

        // The downstream filter only gates its own branch.
        order.lock().clear();
        assert_eq!(pipeline.process(&60).await, Outcome::Handled);
        assert_eq!(*order.lock(), vec!["root:60", "string:60"]);
    }

    #[tokio::test]
    async fn test_transformer_error_drops_message() {
        let calls = Arc::new(AtomicUsize::new(0));
        let next = Pipeline::new("next", counting_handler::<u32>(calls.clone()));
        let pipeline = Pipeline::new("p", handler_fn(|_: u32| async { Ok(()) })).with_transformer(
            stage_fn(|_: &u32| -> anyhow::Result<u32> { anyhow::bail!("cannot convert") }),
            next,
        );

        assert_eq!(pipeline.process(&5).await, Outcome::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
