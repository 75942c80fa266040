use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by TFS operations.
#[derive(Debug, Error)]
pub enum Error {
	/// Mapping, flushing, or addressing the backing image failed.
	#[error("image i/o: {0}")]
	Io(#[from] std::io::Error),

	#[error("no such file or directory")]
	NotFound,

	#[error("file exists")]
	Exists,

	#[error("is a directory")]
	IsDirectory,

	#[error("not a directory")]
	NotDirectory,

	#[error("directory not empty")]
	NotEmpty,

	/// Out of free blocks or nodes. `done` reports the units committed
	/// before space ran out: bytes for `write`, blocks for `trim`.
	#[error("no space left on image ({done} committed)")]
	NoSpace { done: u64 },

	#[error("name too long")]
	NameTooLong,

	#[error("operation not supported")]
	Unsupported,
}

impl Error {
	pub(crate) const fn no_space() -> Self {
		Self::NoSpace { done: 0 }
	}

	/// Errno for the driver boundary.
	pub fn errno(&self) -> i32 {
		match self {
			Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
			Self::NotFound => libc::ENOENT,
			Self::Exists => libc::EEXIST,
			Self::IsDirectory => libc::EISDIR,
			Self::NotDirectory => libc::ENOTDIR,
			Self::NotEmpty => libc::ENOTEMPTY,
			Self::NoSpace { .. } => libc::ENOSPC,
			Self::NameTooLong => libc::ENAMETOOLONG,
			Self::Unsupported => libc::ENOTSUP,
		}
	}
}

/// (INTERNAL) Constructs an [`Error::Io`] for a corrupted or undersized image.
macro_rules! corrupt {
	($($tk:tt)+) => {
		$crate::error::Error::Io(std::io::Error::new(
			std::io::ErrorKind::InvalidData,
			format!($($tk)+),
		))
	};
}

pub(crate) use corrupt;
