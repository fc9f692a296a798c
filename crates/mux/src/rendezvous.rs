use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

/// Errors observed by the issuer of a rendezvous call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RendezvousError {
    /// The owning task no longer accepts requests.
    #[error("request channel is closed")]
    Closed,
    /// The owning task dropped the request without replying.
    #[error("request was dropped without a reply")]
    Dropped,
}

/// Single-use reply half of a [`Rendezvous`].
#[derive(Debug)]
pub struct Reply<U>(oneshot::Sender<U>);

impl<U> Reply<U> {
    /// Sends the reply, consuming the channel.
    ///
    /// The issuer may have given up waiting; in that case the value is dropped.
    pub fn send(self, value: U) {
        let _ = self.0.send(value);
    }

    /// Returns true when the issuer is no longer waiting for the reply.
    pub fn is_abandoned(&self) -> bool {
        self.0.is_closed()
    }
}

/// Issuer half of a [`Rendezvous`].
#[derive(Debug)]
pub struct Awaiting<U>(oneshot::Receiver<U>);

impl<U> Awaiting<U> {
    /// Waits for the owning task to reply.
    pub async fn wait(self) -> Result<U, RendezvousError> {
        self.0.await.map_err(|_| RendezvousError::Dropped)
    }
}

/// A value bundled with a single-use reply channel.
///
/// The issuer sends the bundle to the task owning some state and awaits the
/// reply; the owning task reads the value, does its work, and replies once.
#[derive(Debug)]
pub struct Rendezvous<T, U> {
    value: T,
    reply: Reply<U>,
}

impl<T, U> Rendezvous<T, U> {
    pub fn new(value: T) -> (Self, Awaiting<U>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                value,
                reply: Reply(tx),
            },
            Awaiting(rx),
        )
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_parts(self) -> (T, Reply<U>) {
        (self.value, self.reply)
    }

    /// Replies without looking at the value.
    pub fn reply(self, value: U) {
        self.reply.send(value);
    }
}

/// Rendezvous whose reply carries no data, only completion.
pub type AwaitDone<T> = Rendezvous<T, ()>;

impl<T> Rendezvous<T, ()> {
    pub fn done(self) {
        self.reply(());
    }
}

/// Sends `value` to the task behind `requests` and waits for its reply.
///
/// `wrap` lifts the rendezvous into the task's request type, usually an enum
/// variant constructor.
pub async fn call<R, T, U>(
    requests: &mpsc::Sender<R>,
    value: T,
    wrap: impl FnOnce(Rendezvous<T, U>) -> R,
) -> Result<U, RendezvousError> {
    let (request, awaiting) = Rendezvous::new(value);
    requests
        .send(wrap(request))
        .await
        .map_err(|_| RendezvousError::Closed)?;
    awaiting.wait().await
}
