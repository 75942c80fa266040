mod data;
mod error;
mod image;
mod tfs;

pub use crate::{
	data::{
		BlockNo, NodeAttr, NodeKind, NodeNo, BLOCK_SIZE, NAME_LIMIT, ROOT_NODE, S_IFDIR, S_IFMT,
		S_IFREG,
	},
	error::{Error, Result},
	tfs::{Info, Tfs},
};
