//! Compute functions: the AI transformations the resolver caches.
//!
//! A [`Computable`] receives the record id and its context object and hands
//! back a [`Computation`]: either a finished result or a boxed future that
//! still has to be awaited. The resolver treats both the same way through
//! [`Computation::resolve`].

pub mod mock;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::datasets::Dataset;
use crate::error::{ComputeError, DashError};

pub type ComputeResult = Result<Value, ComputeError>;

pub type ComputeFuture = Pin<Box<dyn Future<Output = ComputeResult> + Send + 'static>>;

/// Everything a compute function is given.
#[derive(Debug, Clone)]
pub struct ComputeInput {
    pub dataset: Dataset,
    pub id: String,
    pub context: Map<String, Value>,
}

/// Result of invoking a compute function.
pub enum Computation {
    Ready(ComputeResult),
    Pending(ComputeFuture),
}

impl Computation {
    pub fn ready(payload: Value) -> Self {
        Self::Ready(Ok(payload))
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Ready(Err(ComputeError::Failed(msg.into())))
    }

    pub fn pending<F>(fut: F) -> Self
    where
        F: Future<Output = ComputeResult> + Send + 'static,
    {
        Self::Pending(Box::pin(fut))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// Wait for the payload, suspending only if the computation is pending.
    pub async fn resolve(self) -> ComputeResult {
        match self {
            Self::Ready(result) => result,
            Self::Pending(fut) => fut.await,
        }
    }
}

impl fmt::Debug for Computation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Self::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

/// One AI function. Must not touch the cache; the resolver owns writes.
pub trait Computable: Send + Sync {
    fn compute(&self, input: ComputeInput) -> Computation;
}

impl<F> Computable for F
where
    F: Fn(ComputeInput) -> Computation + Send + Sync,
{
    fn compute(&self, input: ComputeInput) -> Computation {
        self(input)
    }
}

/// Compute functions keyed by `(dataset, function)`.
#[derive(Clone, Default)]
pub struct ComputeRegistry {
    functions: BTreeMap<(Dataset, String), Arc<dyn Computable>>,
}

impl fmt::Debug for ComputeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.functions.keys().map(|(d, func)| format!("{d}.{func}")))
            .finish()
    }
}

impl ComputeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `computable` for one dataset function. Fails if the
    /// dataset does not declare that function.
    pub fn register<C>(
        &mut self,
        dataset: Dataset,
        function: &str,
        computable: C,
    ) -> Result<&mut Self, DashError>
    where
        C: Computable + 'static,
    {
        self.register_arc(dataset, function, Arc::new(computable))
    }

    pub fn register_arc(
        &mut self,
        dataset: Dataset,
        function: &str,
        computable: Arc<dyn Computable>,
    ) -> Result<&mut Self, DashError> {
        dataset.require_function(function)?;
        self.functions
            .insert((dataset, function.to_string()), computable);
        Ok(self)
    }

    pub fn get(&self, dataset: Dataset, function: &str) -> Option<Arc<dyn Computable>> {
        self.functions
            .get(&(dataset, function.to_string()))
            .cloned()
    }

    /// Like [`get`](Self::get), but a missing function is an error.
    pub fn require(
        &self,
        dataset: Dataset,
        function: &str,
    ) -> Result<Arc<dyn Computable>, DashError> {
        dataset.require_function(function)?;
        self.get(dataset, function).ok_or_else(|| {
            DashError::invalid(format!(
                "No compute function registered for '{function}' on dataset '{dataset}'"
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
