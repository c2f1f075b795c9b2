// src/core/batch.rs

use rayon::prelude::*;
use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("{0}")]
    Failed(String),
    #[error("work item panicked: {0}")]
    Panicked(String),
}

/// The outcome of one work item.
#[derive(Debug)]
pub struct BatchItem<I, T> {
    /// Position of the item in the input.
    pub index: usize,
    pub input: I,
    pub result: Result<T, BatchError>,
}

impl<I, T> BatchItem<I, T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs `work` over every item with at most `throttle` items in flight.
///
/// All items run to completion; a failing or panicking item only fails its
/// own entry. Results come back in input order. A throttle of zero is
/// treated as one.
pub fn run_batch<I, T, E, F>(items: Vec<I>, throttle: usize, work: F) -> Vec<BatchItem<I, T>>
where
    I: Send,
    T: Send,
    E: fmt::Display,
    F: Fn(&I) -> Result<T, E> + Send + Sync,
{
    let throttle = throttle.max(1);
    let run_one = |(index, input): (usize, I)| {
        let result = match panic::catch_unwind(AssertUnwindSafe(|| work(&input))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(BatchError::Failed(e.to_string())),
            Err(payload) => Err(BatchError::Panicked(panic_message(payload.as_ref()))),
        };
        if let Err(e) = &result {
            log::trace!("Batch item {} failed: {}", index, e);
        }
        BatchItem { index, input, result }
    };

    log::trace!("Running batch of {} item(s) with throttle {}.", items.len(), throttle);
    match rayon::ThreadPoolBuilder::new().num_threads(throttle).build() {
        Ok(pool) => pool.install(|| items.into_par_iter().enumerate().map(run_one).collect()),
        Err(e) => {
            log::warn!("Could not build a worker pool ({}); running the batch sequentially.", e);
            items.into_iter().enumerate().map(run_one).collect()
        }
    }
}

/// Counts of succeeded and failed items.
pub fn summarize<I, T>(items: &[BatchItem<I, T>]) -> (usize, usize) {
    let ok = items.iter().filter(|i| i.is_ok()).count();
    (ok, items.len() - ok)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
