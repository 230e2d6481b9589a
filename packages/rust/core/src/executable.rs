//! Executable adapter: one streaming contract over four callable shapes.
//!
//! A step is written in whichever shape suits it:
//!
//! | shape | signature |
//! |---|---|
//! | single | `Fn(Invocation) -> StepResult<Output>` |
//! | suspending | `Fn(Invocation) -> Future<Output = StepResult<Output>>` |
//! | lazy | `Fn(Invocation) -> IntoIterator<Item = StepResult<ProcessingUnit>>` |
//! | suspending lazy | `Fn(Invocation) -> Stream<Item = StepResult<ProcessingUnit>>` |
//!
//! [`Executable::drive`] turns any of them into a [`StepStream`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream, StreamExt};

use kbflow_shared::{DatasetId, Params, ProcessingUnit, RunId, StepError};

/// Result type returned by step implementations.
pub type StepResult<T> = std::result::Result<T, StepError>;

/// Stream of outputs produced by one invocation.
pub type StepStream = BoxStream<'static, StepResult<ProcessingUnit>>;

/// What a single-result step hands back.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    One(ProcessingUnit),
    Many(Vec<ProcessingUnit>),
    /// Remove the input from the flow.
    Drop,
}

impl From<ProcessingUnit> for Output {
    fn from(unit: ProcessingUnit) -> Self {
        Self::One(unit)
    }
}

impl From<Vec<ProcessingUnit>> for Output {
    fn from(units: Vec<ProcessingUnit>) -> Self {
        Self::Many(units)
    }
}

impl From<Option<ProcessingUnit>> for Output {
    fn from(unit: Option<ProcessingUnit>) -> Self {
        match unit {
            Some(unit) => Self::One(unit),
            None => Self::Drop,
        }
    }
}

/// Run context injected into every invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepContext {
    pub run_id: RunId,
    pub dataset_id: DatasetId,
    pub pipeline_name: String,
    pub task_name: String,
}

/// Arguments for one call of a step.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// One unit, or up to `batch_size` units for batched steps.
    pub units: Vec<ProcessingUnit>,
    /// Task defaults merged with run-level overrides.
    pub params: Params,
    pub context: StepContext,
}

impl Invocation {
    /// Take the first unit. Non-batched steps always receive exactly one.
    pub fn into_unit(self) -> Option<ProcessingUnit> {
        self.units.into_iter().next()
    }
}

type SingleFn = dyn Fn(Invocation) -> StepResult<Output> + Send + Sync;
type SuspendingFn = dyn Fn(Invocation) -> BoxFuture<'static, StepResult<Output>> + Send + Sync;
type LazyFn = dyn Fn(Invocation) -> Box<dyn Iterator<Item = StepResult<ProcessingUnit>> + Send>
    + Send
    + Sync;
type SuspendingLazyFn = dyn Fn(Invocation) -> StepStream + Send + Sync;

#[derive(Clone)]
enum Shape {
    Single(Arc<SingleFn>),
    Suspending(Arc<SuspendingFn>),
    Lazy(Arc<LazyFn>),
    SuspendingLazy(Arc<SuspendingLazyFn>),
}

/// A step callable, tagged with its execution shape.
#[derive(Clone)]
pub struct Executable {
    shape: Shape,
    accepts_batch: bool,
}

impl Executable {
    /// Wrap a plain function returning one result.
    pub fn single<F, O>(f: F) -> Self
    where
        F: Fn(Invocation) -> StepResult<O> + Send + Sync + 'static,
        O: Into<Output> + 'static,
    {
        Self::from_shape(Shape::Single(Arc::new(
            move |inv| -> StepResult<Output> { f(inv).map(<O as Into<Output>>::into) },
        )))
    }

    /// Wrap an async function returning one result.
    pub fn suspending<F, Fut, O>(f: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult<O>> + Send + 'static,
        O: Into<Output> + 'static,
    {
        Self::from_shape(Shape::Suspending(Arc::new(
            move |inv| -> BoxFuture<'static, StepResult<Output>> {
                let fut = f(inv);
                Box::pin(async move { fut.await.map(<O as Into<Output>>::into) })
            },
        )))
    }

    /// Wrap a function returning a lazily evaluated sequence of results.
    pub fn lazy<F, I>(f: F) -> Self
    where
        F: Fn(Invocation) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = StepResult<ProcessingUnit>> + 'static,
        I::IntoIter: Send + 'static,
    {
        Self::from_shape(Shape::Lazy(Arc::new(
            move |inv| -> Box<dyn Iterator<Item = StepResult<ProcessingUnit>> + Send> {
                Box::new(f(inv).into_iter())
            },
        )))
    }

    /// Wrap a function returning an async stream of results.
    pub fn suspending_lazy<F, S>(f: F) -> Self
    where
        F: Fn(Invocation) -> S + Send + Sync + 'static,
        S: Stream<Item = StepResult<ProcessingUnit>> + Send + 'static,
    {
        Self::from_shape(Shape::SuspendingLazy(Arc::new(move |inv| -> StepStream {
            f(inv).boxed()
        })))
    }

    fn from_shape(shape: Shape) -> Self {
        Self {
            shape,
            accepts_batch: false,
        }
    }

    /// Declare that the step accepts a batch of units per invocation.
    pub fn batched(mut self) -> Self {
        self.accepts_batch = true;
        self
    }

    pub fn accepts_batch(&self) -> bool {
        self.accepts_batch
    }

    pub fn shape_name(&self) -> &'static str {
        match self.shape {
            Shape::Single(_) => "single",
            Shape::Suspending(_) => "suspending",
            Shape::Lazy(_) => "lazy",
            Shape::SuspendingLazy(_) => "suspending_lazy",
        }
    }

    /// Invoke the step and expose its outputs as a stream.
    ///
    /// Errors are yielded unchanged; the stream ends after the last output.
    pub fn drive(&self, invocation: Invocation) -> StepStream {
        match &self.shape {
            Shape::Single(f) => stream::iter(flatten_output(f(invocation))).boxed(),
            Shape::Suspending(f) => {
                let fut = f(invocation);
                stream::once(fut)
                    .flat_map(|result| stream::iter(flatten_output(result)))
                    .boxed()
            }
            Shape::Lazy(f) => stream::iter(f(invocation)).boxed(),
            Shape::SuspendingLazy(f) => f(invocation),
        }
    }
}

impl fmt::Debug for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executable")
            .field("shape", &self.shape_name())
            .field("accepts_batch", &self.accepts_batch)
            .finish()
    }
}

fn flatten_output(result: StepResult<Output>) -> Vec<StepResult<ProcessingUnit>> {
    match result {
        Ok(Output::One(unit)) => vec![Ok(unit)],
        Ok(Output::Many(units)) => units.into_iter().map(Ok).collect(),
        Ok(Output::Drop) => Vec::new(),
        Err(e) => vec![Err(e)],
    }
}
