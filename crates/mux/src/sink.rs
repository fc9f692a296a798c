use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The receiving side is gone; nothing will ever be delivered again.
    #[error("sink is closed")]
    Closed,
}

/// Delivery target of a [`Mux`](crate::Mux).
///
/// A sink is closed by dropping it. Wrappers built with [`SinkExt`] own the
/// sink they wrap, so dropping the wrapper closes the inner sink as well.
pub trait Sink<T>: Send + 'static {
    fn submit(&mut self, value: T) -> BoxFuture<'_, Result<(), SinkError>>;
}

pub type BoxSink<T> = Box<dyn Sink<T>>;

impl<T: 'static> Sink<T> for BoxSink<T> {
    fn submit(&mut self, value: T) -> BoxFuture<'_, Result<(), SinkError>> {
        (**self).submit(value)
    }
}

impl<T: Send + 'static> Sink<T> for mpsc::Sender<T> {
    fn submit(&mut self, value: T) -> BoxFuture<'_, Result<(), SinkError>> {
        async move { self.send(value).await.map_err(|_| SinkError::Closed) }.boxed()
    }
}

impl<T: Send + 'static> Sink<T> for mpsc::UnboundedSender<T> {
    fn submit(&mut self, value: T) -> BoxFuture<'_, Result<(), SinkError>> {
        futures::future::ready(self.send(value).map_err(|_| SinkError::Closed)).boxed()
    }
}

/// Sink that transforms values before forwarding them.
pub struct MapSink<S, F> {
    inner: S,
    f: F,
}

impl<S, F, T, U> Sink<U> for MapSink<S, F>
where
    S: Sink<T>,
    F: FnMut(U) -> T + Send + 'static,
{
    fn submit(&mut self, value: U) -> BoxFuture<'_, Result<(), SinkError>> {
        let mapped = (self.f)(value);
        self.inner.submit(mapped)
    }
}

/// Sink that only forwards values matching a predicate.
pub struct FilterSink<S, F> {
    inner: S,
    f: F,
}

impl<S, F, T> Sink<T> for FilterSink<S, F>
where
    S: Sink<T>,
    F: FnMut(&T) -> bool + Send + 'static,
{
    fn submit(&mut self, value: T) -> BoxFuture<'_, Result<(), SinkError>> {
        if (self.f)(&value) {
            self.inner.submit(value)
        } else {
            futures::future::ready(Ok(())).boxed()
        }
    }
}

pub trait SinkExt<T>: Sink<T> + Sized {
    /// Derives a sink accepting `U` by applying `f` to every value.
    fn map<U, F>(self, f: F) -> MapSink<Self, F>
    where
        F: FnMut(U) -> T + Send + 'static,
    {
        MapSink { inner: self, f }
    }

    /// Derives a sink that drops values for which `f` returns false.
    fn filter<F>(self, f: F) -> FilterSink<Self, F>
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        FilterSink { inner: self, f }
    }

    fn boxed(self) -> BoxSink<T> {
        Box::new(self)
    }
}

impl<T, S: Sink<T>> SinkExt<T> for S {}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[tokio::test]
    async fn map_and_filter_compose() {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut sink = tx
            .map(|n: u32| format!("#{n}"))
            .filter(|n: &u32| n % 2 == 0);

        for n in 0..5 {
            sink.submit(n).await.expect("should deliver");
        }
        drop(sink);

        let mut received = Vec::new();
        while let Some(value) = rx.recv().await {
            received.push(value);
        }
        assert_eq!(received, vec!["#0".to_string(), "#2".to_string(), "#4".to_string()]);
    }

    #[tokio::test]
    async fn closed_receiver_reports_error() {
        let (tx, rx) = mpsc::channel::<u8>(1);
        drop(rx);

        let mut sink = tx.boxed();
        assert_eq!(sink.submit(1).await, Err(SinkError::Closed));
    }

    #[tokio::test]
    async fn dropping_wrapper_closes_channel() {
        let (tx, mut rx) = mpsc::channel::<u8>(1);
        let sink = tx.filter(|_| true).boxed();
        drop(sink);

        assert_eq!(rx.recv().await, None);
    }
}
