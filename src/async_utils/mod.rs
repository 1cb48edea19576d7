//! Asynchronous utilities for use with Tokio.
//!
//! Some of this stuff is frankly Rust magic, but it enables everything else we
//! do. We try to keep it in one place.

use std::pin::Pin;

use futures::Stream;

pub mod io;

/// A type alias for a boxed stream. This is used to make it easier to work
/// streams that return complex types.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
///
/// Use this for in-process CPU-bound work like image decoding, so that it
/// doesn't block the executor.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => panic!("blocking task was cancelled: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_value_from_blocking_task() {
        assert_eq!(spawn_blocking_propagating_panics(|| 2 + 2).await, 4);
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn propagates_panics() {
        spawn_blocking_propagating_panics(|| panic!("boom")).await
    }
}
