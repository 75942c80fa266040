use std::mem::size_of;

use super::{
	cache::{basename, dirname},
	cursor::{BlockCursor, Step},
	*,
};

const SLOT: u64 = size_of::<NodeNo>() as u64;

impl Tfs {
	/// Child node numbers of a directory, in slot order.
	fn child_slots(&mut self, dir: &mut Inode) -> Result<Vec<NodeNo>> {
		let mut buf = vec![0u8; dir.node_size() as usize];
		let n = self.node_read(dir, 0, &mut buf)?;
		debug_assert_eq!(n, buf.len());
		Ok(buf
			.chunks_exact(SLOT as usize)
			.map(|c| NodeNo::from_le_bytes(c.try_into().unwrap()))
			.collect())
	}

	pub(super) fn dir_entries(&mut self, nr: NodeNo) -> Result<Vec<(NodeNo, Inode)>> {
		let mut dir = self.read_node(nr)?;
		if !dir.is_dir() {
			return Err(Error::NotDirectory);
		}
		self.child_slots(&mut dir)?
			.into_iter()
			.map(|c| Ok((c, self.read_node(c)?)))
			.collect()
	}

	/// Children of a directory, resolved to their metadata.
	///
	/// Order is insertion order, except that removing a child moves the
	/// last one into the freed slot.
	#[doc(alias = "readdir")]
	pub fn children(&mut self, nr: NodeNo) -> Result<Vec<NodeAttr>> {
		log::trace!("children({nr});");
		Ok(self
			.dir_entries(nr)?
			.iter()
			.map(|(c, ino)| ino.as_attr(*c))
			.collect())
	}

	/// Create a file or directory at `path`. `mode` carries the type bit.
	#[doc(alias("mknod", "mkdir", "create"))]
	pub fn add_node(&mut self, path: &OsStr, mode: u32) -> Result<NodeNo> {
		log::trace!("add_node({path:?}, {mode:#o});");

		if self.lookup(path).is_some() {
			return Err(Error::Exists);
		}
		if !self.node_available()? {
			return Err(Error::no_space());
		}
		let name = basename(path);
		if name.len() + 1 > NAME_LIMIT {
			return Err(Error::NameTooLong);
		}
		let parent_nr = self.lookup(dirname(path)).ok_or(Error::NotFound)?;
		let mut parent = self.read_node(parent_nr)?;
		if !parent.is_dir() {
			return Err(Error::NotDirectory);
		}

		let nr = self.alloc_node()?;
		log::debug!("allocated node {nr} for {path:?}");
		let ino = Inode::new(name, mode);
		self.write_node(nr, &ino)?;

		// Link into the parent: one more slot, then the number goes into
		// the last data block.
		parent.set_nlink(parent.nlink() + 1);
		if let Err(e) = self.node_trim(&mut parent) {
			// trim clamped nlink back; keep any partially built index chain
			// but give the node itself up
			self.write_node(parent_nr, &parent)?;
			self.free_node(nr)?;
			return Err(e);
		}

		let mut cur = BlockCursor::new();
		let last = self.cursor_seek(&parent, &mut cur, parent.nblocks - 1)?;
		let slot = (parent.nlink() - 1) % BLOCK_MAX_CHILDREN as i64;
		self.image
			.encode_at(self.block_off(last) + slot as u64 * SLOT, &nr)?;
		parent.mtime = Timespec::now();
		self.write_node(parent_nr, &parent)?;

		self.cache_insert(path, nr);
		Ok(nr)
	}

	/// Remove the node at `path`, freeing its blocks and its number.
	///
	/// Any node kind is accepted; unlink/rmdir policy belongs to the
	/// driver. The parent link is repaired before the node is freed, and
	/// the cache entry goes last.
	#[doc(alias("unlink", "rmdir"))]
	pub fn remove_node(&mut self, path: &OsStr) -> Result<()> {
		log::trace!("remove_node({path:?});");

		if path == OsStr::new("/") {
			return Err(Error::Unsupported);
		}
		let nr = self.lookup(path).ok_or(Error::NotFound)?;
		let parent_nr = self.lookup(dirname(path)).ok_or(Error::Unsupported)?;
		let mut parent = self.read_node(parent_nr)?;

		// Unlink from the parent: the last child is swapped into the freed
		// slot, so directory blocks never need compacting.
		let mut cur = BlockCursor::new();
		let last_blk = self.cursor_seek(&parent, &mut cur, parent.nblocks - 1)?;
		let last_slot = (parent.nlink() - 1) % BLOCK_MAX_CHILDREN as i64;
		let last_child: NodeNo = self
			.image
			.decode_at(self.block_off(last_blk) + last_slot as u64 * SLOT)?;

		let mut remaining = parent.nlink();
		let mut block = self.cursor_seek(&parent, &mut cur, 0)?;
		'scan: while block != END && remaining > 0 {
			let off = self.block_off(block);
			for slot in 0..BLOCK_MAX_CHILDREN.min(remaining as usize) {
				let child: NodeNo = self.image.decode_at(off + slot as u64 * SLOT)?;
				if child == nr {
					self.image.encode_at(off + slot as u64 * SLOT, &last_child)?;
					break 'scan;
				}
			}
			remaining -= BLOCK_MAX_CHILDREN as i64;
			block = self.cursor_step(&mut parent, &mut cur, Step::Observe)?;
		}

		parent.set_nlink(parent.nlink() - 1);
		self.node_trim(&mut parent)?;
		parent.mtime = Timespec::now();
		self.write_node(parent_nr, &parent)?;

		// Free the node's data and index blocks, then the node itself.
		let mut ino = self.read_node(nr)?;
		if ino.is_dir() {
			ino.set_nlink(0);
		} else {
			ino.set_size(0);
		}
		self.node_trim(&mut ino)?;
		self.free_node(nr)?;

		self.cache_remove(path);
		Ok(())
	}
}
