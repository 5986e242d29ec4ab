use std::{
	fmt::{self, Display},
	io,
	path::Path,
};

use thiserror::Error;

#[cfg(any(test, feature = "fault-injection"))]
use crate::fault::CrashLocation;

#[derive(Debug, Error)]
pub enum Error {
	#[error("invalid argument: {0}")]
	InvalidArgument(&'static str),
	#[error("operation not supported for this entry")]
	NotSupported,
	#[error("entry not found")]
	NotFound,
	#[error("an entry with this key already exists")]
	AlreadyExists,
	#[error("another sparse operation is still in flight for this entry")]
	SparseOperationInFlight,
	#[error("stream would grow to {size} bytes, the limit is {max} bytes")]
	EntryTooLarge { size: u64, max: u64 },
	#[error("cache structures are corrupted: {0}")]
	Corrupted(String),
	#[error("cache operation failed: {0}")]
	Failed(&'static str),
	#[error("cache backend is shut down")]
	Shutdown,
	#[error("operation canceled by backend teardown")]
	Canceled,

	#[cfg(any(test, feature = "fault-injection"))]
	#[error("injected crash at <location='{0:?}'>")]
	InjectedCrash(CrashLocation),

	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("failed to (de)serialize JSON: {0}")]
	Json(#[from] serde_json::Error),
}

impl Error {
	/// Errors after which the worker must stop touching the directory, the
	/// same as if the process died right there.
	#[allow(clippy::unused_self)]
	pub(crate) const fn is_fatal(&self) -> bool {
		#[cfg(any(test, feature = "fault-injection"))]
		{
			matches!(self, Self::InjectedCrash(_))
		}

		#[cfg(not(any(test, feature = "fault-injection")))]
		{
			false
		}
	}
}

/// File I/O error that includes the path that caused the error
#[derive(Error, Debug)]
pub struct FileIOError {
	pub path: Box<Path>,
	#[source]
	pub source: io::Error,
	pub maybe_context: Option<String>,
}

impl Display for FileIOError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"file I/O error{}: {}; path: '{}'",
			self.maybe_context
				.as_ref()
				.map(|ctx| format!(" ({ctx})"))
				.unwrap_or_default(),
			self.source,
			self.path.display()
		)
	}
}

impl<P: AsRef<Path>> From<(P, io::Error)> for FileIOError {
	fn from((path, source): (P, io::Error)) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			maybe_context: None,
		}
	}
}

impl<P: AsRef<Path>> From<(P, io::Error, &'static str)> for FileIOError {
	fn from((path, source, context): (P, io::Error, &'static str)) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			maybe_context: Some(context.into()),
		}
	}
}
