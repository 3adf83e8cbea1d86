//! Interceptor pipeline
//!
//! An ordered chain of `T -> T` transformers. Each interceptor receives a
//! [`Chain`] holding the current value and must call [`Chain::proceed`] to
//! hand the (possibly modified) value to the next stage, or
//! [`Chain::complete`] to stop the pipeline early with a final value.
//!
//! The pipeline is driven by a plain loop over the stages, so chain length
//! never grows the stack.

use std::sync::Arc;

use crate::error::InterceptorError;

/// What an interceptor decided to do with the value
#[derive(Debug)]
pub enum Flow<T> {
    /// Pass the value on to the next interceptor
    Proceed(T),
    /// Stop here; the value is the pipeline result
    Complete(T),
}

/// Handle given to an interceptor for a single stage
#[derive(Debug)]
pub struct Chain<T> {
    value: T,
    index: usize,
    len: usize,
}

impl<T> Chain<T> {
    /// Current value
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    /// Position of this stage in the pipeline
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of stages after this one
    pub fn remaining(&self) -> usize {
        self.len - self.index - 1
    }

    /// Continue with `value`
    pub fn proceed(self, value: T) -> Flow<T> {
        Flow::Proceed(value)
    }

    /// Continue with the current value unchanged
    pub fn pass(self) -> Flow<T> {
        Flow::Proceed(self.value)
    }

    /// Short-circuit the pipeline with `value`
    pub fn complete(self, value: T) -> Flow<T> {
        Flow::Complete(value)
    }
}

/// A single pipeline stage
pub trait Interceptor<T>: Send + Sync {
    fn intercept(&self, chain: Chain<T>) -> Result<Flow<T>, InterceptorError>;
}

impl<T, F> Interceptor<T> for F
where
    F: Fn(Chain<T>) -> Result<Flow<T>, InterceptorError> + Send + Sync,
{
    fn intercept(&self, chain: Chain<T>) -> Result<Flow<T>, InterceptorError> {
        self(chain)
    }
}

/// Ordered list of interceptors for one direction
pub struct Pipeline<T> {
    stages: Vec<Arc<dyn Interceptor<T>>>,
}

impl<T> Default for Pipeline<T> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<T> Clone for Pipeline<T> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl<T> Pipeline<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor<T>>) {
        self.stages.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run `value` through every stage in registration order
    pub fn run(&self, value: T) -> Result<T, InterceptorError> {
        let len = self.stages.len();
        let mut current = value;
        for (index, stage) in self.stages.iter().enumerate() {
            let chain = Chain {
                value: current,
                index,
                len,
            };
            match stage.intercept(chain)? {
                Flow::Proceed(next) => current = next,
                Flow::Complete(done) => return Ok(done),
            }
        }
        Ok(current)
    }
}
