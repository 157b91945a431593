use super::MessageReceiver;
use crate::amqp::Message;
use crate::common::{MessagingError, MessagingResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Resolves to the receiver once its first link has opened.
#[must_use = "the receiver is only available by awaiting the open future"]
pub struct OpenFuture {
    inner: OpenState,
}

enum OpenState {
    Failed(Option<MessagingError>),
    Opening {
        receiver: Option<Arc<MessageReceiver>>,
        completion: oneshot::Receiver<MessagingResult<()>>,
    },
}

impl OpenFuture {
    pub(crate) fn failed(error: MessagingError) -> Self {
        Self {
            inner: OpenState::Failed(Some(error)),
        }
    }

    pub(crate) fn opening(
        receiver: Arc<MessageReceiver>,
        completion: oneshot::Receiver<MessagingResult<()>>,
    ) -> Self {
        Self {
            inner: OpenState::Opening {
                receiver: Some(receiver),
                completion,
            },
        }
    }
}

fn polled_after_completion() -> MessagingError {
    MessagingError::InvalidOperation("future polled after completion".to_string())
}

impl Future for OpenFuture {
    type Output = MessagingResult<Arc<MessageReceiver>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            OpenState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or_else(polled_after_completion)))
            }
            OpenState::Opening {
                receiver,
                completion,
            } => match Pin::new(completion).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(Ok(()))) => {
                    Poll::Ready(receiver.take().ok_or_else(polled_after_completion))
                }
                Poll::Ready(Ok(Err(error))) => {
                    receiver.take();
                    Poll::Ready(Err(error))
                }
                Poll::Ready(Err(_)) => {
                    receiver.take();
                    Poll::Ready(Err(MessagingError::ClientClosed(
                        "receiver went away before its link opened".to_string(),
                    )))
                }
            },
        }
    }
}

/// Outcome of one `receive()` call: a batch, or `None` on timeout or close.
#[must_use = "futures do nothing unless awaited"]
pub struct ReceiveFuture {
    completion: oneshot::Receiver<MessagingResult<Option<Vec<Message>>>>,
}

impl ReceiveFuture {
    pub(crate) fn new(completion: oneshot::Receiver<MessagingResult<Option<Vec<Message>>>>) -> Self {
        Self { completion }
    }
}

impl Future for ReceiveFuture {
    type Output = MessagingResult<Option<Vec<Message>>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().completion).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(MessagingError::ClientClosed(
                "receiver went away before the receive completed".to_string(),
            ))),
        }
    }
}

pub struct CloseFuture {
    completion: oneshot::Receiver<MessagingResult<()>>,
}

impl CloseFuture {
    pub(crate) fn new(completion: oneshot::Receiver<MessagingResult<()>>) -> Self {
        Self { completion }
    }
}

impl Future for CloseFuture {
    type Output = MessagingResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().completion).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Ok(())),
        }
    }
}
