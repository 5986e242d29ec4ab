use std::{
	ops::ControlFlow,
	sync::{atomic::AtomicU32, Arc},
};

use async_channel as chan;
use tokio::sync::oneshot;
use tracing::{error, info, trace, warn};

use crate::{
	addr::Addr,
	completion::reply,
	config::BackendConfig,
	error::Error,
	rankings::Rankings,
};

use super::{
	imp::BackendImpl,
	message::{EntryOp, Message},
	sparse_io::SparseKind,
};

/// Body of the worker thread: opens the directory, reports how that went
/// through `ready_tx` and then serves messages until shutdown.
pub(super) fn run(
	config: BackendConfig,
	rankings: Rankings,
	msgs_tx: chan::Sender<Message>,
	msgs_rx: chan::Receiver<Message>,
	entry_count: Arc<AtomicU32>,
	ready_tx: oneshot::Sender<Result<(), Error>>,
) {
	trace!("Disk cache worker starting...");

	let mut backend = match BackendImpl::init(&config, rankings, msgs_tx, entry_count) {
		Ok(backend) => backend,
		Err(e) => {
			msgs_rx.close();
			if ready_tx.send(Err(e)).is_err() {
				warn!("Backend open was abandoned before init failed");
			}
			return;
		}
	};

	if ready_tx.send(Ok(())).is_err() {
		warn!("Backend open was abandoned, closing the cache");
		msgs_rx.close();
		close(&mut backend);
		return;
	}

	while let Ok(msg) = msgs_rx.recv_blocking() {
		if let Message::ShutdownRequest(ack) = msg {
			trace!("Disk cache worker received shutdown signal and will exit...");
			msgs_rx.close();

			if drain(&mut backend, &msgs_rx).is_continue() {
				close(&mut backend);
			} else {
				abandon(&msgs_rx);
			}

			if let Some(ack) = ack {
				if ack.send(()).is_err() {
					warn!("Shutdown request channel closed before the worker finished");
				}
			}

			return;
		}

		if dispatch(&mut backend, msg).is_break() {
			abandon(&msgs_rx);
			return;
		}
	}
}

fn close(backend: &mut BackendImpl) {
	match backend.shutdown() {
		Ok(()) => info!("Disk cache worker gracefully shutdown"),
		Err(e) => error!(?e, "Disk cache failed to shutdown cleanly"),
	}
}

/// Stops right after a fatal error, leaving the directory exactly as it is.
/// Pending operations resolve as canceled.
fn abandon(msgs_rx: &chan::Receiver<Message>) {
	error!("Disk cache worker stopped after a fatal error");
	msgs_rx.close();

	while let Ok(msg) = msgs_rx.try_recv() {
		trace!(?msg, "Dropping message queued after a fatal error");
	}
}

/// Runs what entry handles queued before shutdown. Backend level requests
/// are dropped, their callers see them canceled.
fn drain(backend: &mut BackendImpl, msgs_rx: &chan::Receiver<Message>) -> ControlFlow<()> {
	loop {
		let msg = match msgs_rx.try_recv() {
			Ok(msg) => msg,
			Err(_) => match backend.deferred.pop_front() {
				Some(addr) => Message::ContinueSparse(addr),
				None => return ControlFlow::Continue(()),
			},
		};

		if msg.is_entry_level() {
			if dispatch(backend, msg).is_break() {
				return ControlFlow::Break(());
			}
		} else {
			trace!(?msg, "Dropping backend request queued after shutdown");
		}
	}
}

fn dispatch(backend: &mut BackendImpl, msg: Message) -> ControlFlow<()> {
	match msg {
		Message::CreateEntry { key, ack } => reply(ack, backend.create_entry(&key)),
		Message::OpenEntry { key, ack } => reply(ack, backend.open_entry(&key)),
		Message::DoomEntry { key, ack } => reply(ack, backend.doom_key(&key)),
		Message::DoomAllEntries(ack) => reply(ack, backend.doom_all()),
		Message::DoomEntriesBetween { initial, end, ack } => {
			reply(ack, backend.doom_between(initial, end))
		}
		Message::OpenNextEntry {
			iterator,
			direction,
			ack,
		} => reply(ack, backend.open_next(iterator, direction)),
		Message::EndEnumeration(iterator) => {
			backend.cursors.end(iterator);
			ControlFlow::Continue(())
		}
		Message::ExternalCacheHit(key) => match backend.external_hit(&key) {
			Err(e) if e.is_fatal() => ControlFlow::Break(()),
			Err(e) => {
				warn!(?e, "Failed to record external cache hit");
				ControlFlow::Continue(())
			}
			Ok(()) => ControlFlow::Continue(()),
		},
		Message::SetMaxSize { max_bytes, ack } => reply(ack, backend.set_max_size(max_bytes)),
		Message::Stats(ack) => reply(ack, Ok(backend.stats_report())),
		Message::SelfCheck(ack) => reply(ack, backend.self_check()),
		Message::Flush(ack) => reply(ack, backend.flush()),
		Message::Entry { addr, op } => dispatch_entry(backend, addr, op),
		Message::ContinueSparse(addr) => backend.step_sparse(addr),
		Message::ShutdownRequest(_) => {
			warn!("Shutdown request reached the dispatcher, ignoring it");
			ControlFlow::Continue(())
		}
	}
}

fn dispatch_entry(backend: &mut BackendImpl, addr: Addr, op: EntryOp) -> ControlFlow<()> {
	match op {
		EntryOp::ReadData {
			stream,
			offset,
			len,
			ack,
		} => reply(ack, backend.read_data(addr, stream, offset as usize, len)),
		EntryOp::WriteData {
			stream,
			offset,
			data,
			truncate,
			ack,
		} => reply(
			ack,
			backend.write_data(addr, stream, offset as usize, &data, truncate),
		),
		EntryOp::ReadSparse { offset, len, ack } => {
			backend.start_sparse(addr, offset, len, SparseKind::read(ack))
		}
		EntryOp::WriteSparse { offset, data, ack } => {
			let len = data.len();
			backend.start_sparse(addr, offset, len, SparseKind::write(data, ack))
		}
		EntryOp::AvailableRange { offset, len, ack } => {
			backend.start_sparse(addr, offset, len, SparseKind::range(offset, ack))
		}
		EntryOp::Doom(ack) => reply(ack, backend.doom_handle(addr)),
		EntryOp::CancelSparse => {
			backend.cancel_sparse(addr);
			ControlFlow::Continue(())
		}
		EntryOp::ReadyForSparse(ack) => backend.ready_for_sparse(addr, ack),
		EntryOp::Release { generation } => match backend.release(addr, generation) {
			Err(e) if e.is_fatal() => ControlFlow::Break(()),
			Err(e) => {
				error!(%addr, ?e, "Failed to close entry");
				ControlFlow::Continue(())
			}
			Ok(()) => ControlFlow::Continue(()),
		},
	}
}
