use std::{
	future::Future,
	ops::ControlFlow,
	pin::Pin,
	task::{Context, Poll},
};

use async_channel as chan;
use tokio::sync::oneshot;
use tracing::{error, trace};

use crate::{backend::message::Message, error::Error};

pub(crate) type Ack<T> = oneshot::Sender<Result<T, Error>>;

/// Answers an operation. Breaks when the outcome is fatal and the worker has
/// to stop right away.
pub(crate) fn reply<T>(ack: Ack<T>, res: Result<T, Error>) -> ControlFlow<()> {
	let fatal = res.as_ref().is_err_and(Error::is_fatal);

	if ack.send(res).is_err() {
		trace!("Completion dropped before its result arrived");
	}

	if fatal {
		ControlFlow::Break(())
	} else {
		ControlFlow::Continue(())
	}
}

pin_project_lite::pin_project! {
	/// The outcome of an operation accepted by the backend worker.
	///
	/// The operation is queued when the method returning the `Completion` is
	/// called, so dropping it without polling only discards the result: the
	/// operation still runs, in order with everything else queued for the
	/// same backend.
	///
	/// Invalid arguments are rejected right away, such a `Completion` resolves
	/// on first poll and nothing reaches the worker.
	#[must_use = "the operation runs regardless, but its result is lost if the `Completion` isn't polled"]
	pub struct Completion<T> {
		rejected: Option<Error>,
		#[pin]
		done_rx: Option<oneshot::Receiver<Result<T, Error>>>,
	}
}

impl<T> Completion<T> {
	pub(crate) const fn rejected(e: Error) -> Self {
		Self {
			rejected: Some(e),
			done_rx: None,
		}
	}

	/// Queues the message built by `make` on the worker, which answers through
	/// the ack it receives.
	pub(crate) fn send(tx: &chan::Sender<Message>, make: impl FnOnce(Ack<T>) -> Message) -> Self {
		let (ack, done_rx) = oneshot::channel();

		if tx.try_send(make(ack)).is_err() {
			return Self::rejected(Error::Shutdown);
		}

		Self {
			rejected: None,
			done_rx: Some(done_rx),
		}
	}
}

impl<T> Future for Completion<T> {
	type Output = Result<T, Error>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = self.project();

		if let Some(e) = this.rejected.take() {
			return Poll::Ready(Err(e));
		}

		this.done_rx.as_pin_mut().map_or_else(
			|| {
				error!("tried to poll an already completed Completion future");
				Poll::Pending
			},
			// The worker drops acks of backend level operations on teardown.
			|done_rx| done_rx.poll(cx).map(|res| res.unwrap_or_else(|_| Err(Error::Canceled))),
		)
	}
}
