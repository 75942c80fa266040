use std::time::SystemTime;

use super::{
	cursor::{BlockCursor, Step},
	*,
};

impl Tfs {
	pub(super) fn read_node(&self, nr: NodeNo) -> Result<Inode> {
		log::trace!("read_node({nr});");
		if !(0..self.nnodes).contains(&nr) {
			return Err(corrupt!("node {nr} outside the node table"));
		}
		let ino: Inode = self.image.decode_at(self.node_off(nr))?;
		if ino.mode & S_IFMT == 0 {
			log::warn!("read_node({nr}): record is not allocated");
			return Err(corrupt!("node {nr} is not allocated"));
		}
		Ok(ino)
	}

	pub(super) fn write_node(&mut self, nr: NodeNo, ino: &Inode) -> Result<()> {
		log::trace!("write_node({nr});");
		self.image.encode_at(self.node_off(nr), ino)
	}

	/// Metadata for a node by number.
	#[doc(alias("stat", "getattr"))]
	pub fn node_attr(&self, nr: NodeNo) -> Result<NodeAttr> {
		let ino = self.read_node(nr)?;
		Ok(ino.as_attr(nr))
	}

	/// Reconcile a node's allocated blocks with its size.
	///
	/// The only routine that changes `nblocks`. Growth allocates data
	/// blocks (and any missing index blocks) forward from the current end;
	/// shrinking walks the doomed tail and releases data and emptied index
	/// blocks as it goes. A grow that runs out of space keeps what it got,
	/// clamps the size to match, and reports the shortfall.
	pub(super) fn node_trim(&mut self, ino: &mut Inode) -> Result<()> {
		let required = ino.required_blocks();
		let before = ino.nblocks;
		let mut delta = required - before;
		log::trace!("node_trim(): nblocks={before}, required={required}");
		let mut cur = BlockCursor::new();

		if delta < 0 {
			self.cursor_seek(ino, &mut cur, required - 1)?;
			while delta != 0 && self.cursor_step(ino, &mut cur, Step::Free)? != END {
				delta += 1;
			}
			ino.nblocks = required;
		} else if delta > 0 {
			self.cursor_seek(ino, &mut cur, before - 1)?;
			while delta != 0 && self.cursor_step(ino, &mut cur, Step::Allocate)? != END {
				delta -= 1;
			}
			ino.nblocks = required - delta;
		}

		// After a failed grow the size has to shrink back to what the
		// blocks can hold.
		if ino.is_dir() {
			ino.set_nlink(ino.nlink().min(ino.nblocks * BLOCK_MAX_CHILDREN as i64));
		} else {
			ino.set_size(ino.size().min(ino.nblocks * BLOCK_SIZE as i64));
		}

		if delta > 0 {
			Err(Error::NoSpace {
				done: (ino.nblocks - before) as u64,
			})
		} else {
			Ok(())
		}
	}

	/// Reconcile a node after an external size change.
	pub fn trim(&mut self, nr: NodeNo) -> Result<()> {
		log::trace!("trim({nr});");
		let mut ino = self.read_node(nr)?;
		let res = self.node_trim(&mut ino);
		self.write_node(nr, &ino)?;
		res
	}

	/// Copy out of the node's blocks. No type check; directories read their
	/// child slots through this.
	pub(super) fn node_read(&mut self, ino: &mut Inode, offset: u64, buf: &mut [u8]) -> Result<usize> {
		let bs = BLOCK_SIZE as i64;
		let node_size = ino.node_size();
		let mut offset = offset as i64;
		let mut done = 0;

		let mut cur = BlockCursor::new();
		let mut block = self.cursor_seek(ino, &mut cur, offset / bs)?;

		while offset < node_size && done < buf.len() {
			let boff = (offset % bs) as usize;
			let n = (buf.len() - done)
				.min(BLOCK_SIZE - boff)
				.min((node_size - offset) as usize);
			let src = self.image.bytes(self.block_off(block) + boff as u64, n)?;
			buf[done..done + n].copy_from_slice(src);
			done += n;
			offset += n as i64;
			block = self.cursor_step(ino, &mut cur, Step::Observe)?;
		}

		Ok(done)
	}

	/// Copy into the node's blocks, which must already be allocated.
	pub(super) fn node_write(&mut self, ino: &mut Inode, offset: u64, buf: &[u8]) -> Result<usize> {
		let bs = BLOCK_SIZE as i64;
		let node_size = ino.node_size();
		let mut offset = offset as i64;
		let mut done = 0;

		let mut cur = BlockCursor::new();
		let mut block = self.cursor_seek(ino, &mut cur, offset / bs)?;

		while offset < node_size && done < buf.len() {
			let boff = (offset % bs) as usize;
			let n = (buf.len() - done)
				.min(BLOCK_SIZE - boff)
				.min((node_size - offset) as usize);
			let dst = self.image.bytes_mut(self.block_off(block) + boff as u64, n)?;
			dst.copy_from_slice(&buf[done..done + n]);
			done += n;
			offset += n as i64;
			block = self.cursor_step(ino, &mut cur, Step::Observe)?;
		}

		Ok(done)
	}

	/// Read from a regular file. Returns the bytes actually copied, which
	/// is short when the read crosses the end of the file.
	pub fn read(&mut self, nr: NodeNo, offset: u64, buf: &mut [u8]) -> Result<usize> {
		log::trace!("read({nr}, {offset}, {});", buf.len());
		let mut ino = self.read_node(nr)?;
		if ino.is_dir() {
			return Err(Error::IsDirectory);
		}
		let n = self.node_read(&mut ino, offset, buf)?;
		ino.atime = Timespec::now();
		self.write_node(nr, &ino)?;
		Ok(n)
	}

	/// Write to a regular file, extending it as needed.
	///
	/// On `NoSpace` the prefix that fit is still written and its length
	/// reported in the error, so callers can surface a short write.
	pub fn write(&mut self, nr: NodeNo, offset: u64, buf: &[u8]) -> Result<usize> {
		log::trace!("write({nr}, {offset}, {});", buf.len());
		let mut ino = self.read_node(nr)?;
		if ino.is_dir() {
			return Err(Error::IsDirectory);
		}

		ino.set_size(ino.size().max(offset as i64 + buf.len() as i64));
		let trimmed = self.node_trim(&mut ino);

		let n = self.node_write(&mut ino, offset, buf)?;
		ino.mtime = Timespec::now();
		self.write_node(nr, &ino)?;

		match trimmed {
			Ok(()) => Ok(n),
			Err(Error::NoSpace { .. }) => Err(Error::NoSpace { done: n as u64 }),
			Err(e) => Err(e),
		}
	}

	/// Set a file's size, allocating or freeing blocks to match.
	#[doc(alias = "ftruncate")]
	pub fn truncate(&mut self, nr: NodeNo, size: u64) -> Result<()> {
		log::trace!("truncate({nr}, {size});");
		let mut ino = self.read_node(nr)?;
		if ino.is_dir() {
			return Err(Error::IsDirectory);
		}
		ino.set_size(size as i64);
		let res = self.node_trim(&mut ino);
		self.write_node(nr, &ino)?;
		res
	}

	/// Set access and modification times.
	#[doc(alias = "utimens")]
	pub fn set_times(&mut self, nr: NodeNo, atime: SystemTime, mtime: SystemTime) -> Result<()> {
		log::trace!("set_times({nr});");
		let mut ino = self.read_node(nr)?;
		ino.atime = atime.into();
		ino.mtime = mtime.into();
		self.write_node(nr, &ino)
	}
}

#[cfg(test)]
mod t {
	use std::ffi::OsStr;

	use super::super::t::*;
	use super::*;

	const BS: usize = BLOCK_SIZE;

	fn pattern(len: usize) -> Vec<u8> {
		(0..len).map(|i| (i % 251) as u8).collect()
	}

	fn mkfile(tfs: &mut Tfs, path: &str) -> NodeNo {
		tfs.add_node(OsStr::new(path), S_IFREG | 0o644).unwrap()
	}

	#[test]
	fn small_write_then_read() {
		let (_f, mut tfs) = harness(4 * MIB);
		let nr = mkfile(&mut tfs, "/a");
		assert_eq!(tfs.write(nr, 0, b"hello").unwrap(), 5);

		let mut out = [0u8; 5];
		assert_eq!(tfs.read(nr, 0, &mut out).unwrap(), 5);
		assert_eq!(&out, b"hello");

		let attr = tfs.node_attr(nr).unwrap();
		assert_eq!(attr.size, 5);
		assert_eq!(attr.blocks, 1);
	}

	#[test]
	fn read_stops_at_the_end_of_the_file() {
		let (_f, mut tfs) = harness(4 * MIB);
		let nr = mkfile(&mut tfs, "/a");
		tfs.write(nr, 0, b"hello").unwrap();

		let mut out = [0u8; 64];
		assert_eq!(tfs.read(nr, 0, &mut out).unwrap(), 5);
		assert_eq!(tfs.read(nr, 3, &mut out).unwrap(), 2);
		assert_eq!(&out[..2], b"lo");
		assert_eq!(tfs.read(nr, 5, &mut out).unwrap(), 0);
		assert_eq!(tfs.read(nr, 100 * BS as u64, &mut out).unwrap(), 0);
	}

	#[test]
	fn directories_reject_file_io() {
		let (_f, mut tfs) = harness(4 * MIB);
		tfs.add_node(OsStr::new("/d"), S_IFDIR | 0o755).unwrap();
		let nr = tfs.get_node(OsStr::new("/d")).unwrap().nr;
		let mut buf = [0u8; 8];
		assert!(matches!(tfs.read(nr, 0, &mut buf), Err(Error::IsDirectory)));
		assert!(matches!(tfs.write(nr, 0, &buf), Err(Error::IsDirectory)));
		assert!(matches!(tfs.truncate(nr, 0), Err(Error::IsDirectory)));
	}

	#[test]
	fn crossing_into_the_single_indirect_tree() {
		let (_f, mut tfs) = harness(4 * MIB);
		let nr = mkfile(&mut tfs, "/b");
		let data = pattern(13 * BS);
		assert_eq!(tfs.write(nr, 0, &data).unwrap(), data.len());

		let mut ino = tfs.read_node(nr).unwrap();
		assert_eq!(ino.nblocks, 13);
		assert_ne!(ino.iblocks[0], END);

		// logical block 12 is the first pointer of the single-indirect root
		let mut cur = BlockCursor::new();
		let b = tfs.cursor_seek(&ino, &mut cur, 12).unwrap();
		assert_eq!(b, tfs.pointer_at(ino.iblocks[0], 0).unwrap());

		// and sequential stepping agrees with seeking
		let first = tfs.cursor_seek(&ino, &mut cur, 0).unwrap();
		assert_eq!(first, ino.blocks[0]);
		for i in 1..13 {
			let stepped = tfs.cursor_step(&mut ino, &mut cur, Step::Observe).unwrap();
			let mut cur2 = BlockCursor::new();
			assert_eq!(stepped, tfs.cursor_seek(&ino, &mut cur2, i).unwrap());
		}
		assert_eq!(
			tfs.cursor_step(&mut ino, &mut cur, Step::Observe).unwrap(),
			END
		);

		// block-aligned reads return the written pattern
		let mut out = vec![0u8; BS];
		for i in 0..13 {
			assert_eq!(tfs.read(nr, (i * BS) as u64, &mut out).unwrap(), BS);
			assert_eq!(out, data[i * BS..(i + 1) * BS]);
		}
	}

	#[test]
	fn deep_file_roundtrips_through_the_double_indirect_tree() {
		let (_f, mut tfs) = harness(4 * MIB);
		let nr = mkfile(&mut tfs, "/deep");
		let free0 = tfs.info().unwrap().bfree;
		let nblocks = DIRECT_BLOCKS + BLOCK_MAX_POINTERS + 3;
		let data = pattern(nblocks * BS);
		assert_eq!(tfs.write(nr, 0, &data).unwrap(), data.len());

		let ino = tfs.read_node(nr).unwrap();
		assert_eq!(ino.nblocks, nblocks as i64);
		assert_ne!(ino.iblocks[1], END);

		// 527 data blocks + single root + double root + one mid-level block
		assert_eq!(tfs.info().unwrap().bfree, free0 - nblocks as u64 - 3);

		let mut out = vec![0u8; BS];
		for i in [0, 11, 12, 523, 524, 525, 526] {
			assert_eq!(tfs.read(nr, (i * BS) as u64, &mut out).unwrap(), BS);
			assert_eq!(out, data[i * BS..(i + 1) * BS], "block {i}");
		}

		// shrinking to nothing returns every block, index blocks included
		tfs.truncate(nr, 0).unwrap();
		assert_eq!(tfs.read_node(nr).unwrap().nblocks, 0);
		assert_eq!(tfs.info().unwrap().bfree, free0);
	}

	#[test]
	fn truncate_frees_the_indirect_tree() {
		let (_f, mut tfs) = harness(4 * MIB);
		let nr = mkfile(&mut tfs, "/b");
		tfs.write(nr, 0, &pattern(13 * BS)).unwrap();
		let bfree = tfs.info().unwrap().bfree;

		tfs.truncate(nr, 0).unwrap();
		let attr = tfs.node_attr(nr).unwrap();
		assert_eq!(attr.size, 0);
		assert_eq!(attr.blocks, 0);
		// 13 data blocks and 1 index block come back
		assert_eq!(tfs.info().unwrap().bfree, bfree + 14);
	}

	#[test]
	fn trim_is_idempotent() {
		let (_f, mut tfs) = harness(4 * MIB);
		let nr = mkfile(&mut tfs, "/a");
		tfs.write(nr, 0, &pattern(5 * BS + 17)).unwrap();

		tfs.trim(nr).unwrap();
		let bfree = tfs.info().unwrap().bfree;
		let blocks = tfs.node_attr(nr).unwrap().blocks;
		tfs.trim(nr).unwrap();
		assert_eq!(tfs.info().unwrap().bfree, bfree);
		assert_eq!(tfs.node_attr(nr).unwrap().blocks, blocks);
	}

	#[test]
	fn overwrites_leave_other_bytes_alone() {
		let (_f, mut tfs) = harness(4 * MIB);
		let nr = mkfile(&mut tfs, "/a");
		let data = pattern(3 * BS);
		tfs.write(nr, 0, &data).unwrap();
		tfs.write(nr, (BS + 100) as u64, b"XYZ").unwrap();

		let mut out = vec![0u8; 3 * BS];
		assert_eq!(tfs.read(nr, 0, &mut out).unwrap(), out.len());
		assert_eq!(out[..BS + 100], data[..BS + 100]);
		assert_eq!(&out[BS + 100..BS + 103], b"XYZ");
		assert_eq!(out[BS + 103..], data[BS + 103..]);
	}

	#[test]
	fn writes_crossing_block_boundaries() {
		let (_f, mut tfs) = harness(4 * MIB);
		let nr = mkfile(&mut tfs, "/a");
		let data = pattern(2 * BS);
		tfs.write(nr, (BS - 7) as u64, &data).unwrap();

		let attr = tfs.node_attr(nr).unwrap();
		assert_eq!(attr.size, (BS - 7 + 2 * BS) as u64);
		assert_eq!(attr.blocks, 3);

		let mut out = vec![0u8; 2 * BS];
		assert_eq!(tfs.read(nr, (BS - 7) as u64, &mut out).unwrap(), 2 * BS);
		assert_eq!(out, data);
	}

	#[test]
	fn out_of_space_keeps_the_prefix() {
		// 20 blocks, 5 nodes
		let (_f, mut tfs) = harness(TINY);
		assert_eq!(tfs.info().unwrap().bfree, 20);

		// root's child array takes one block; burn 14 more in the direct
		// regions of two files, leaving exactly 5
		let a = mkfile(&mut tfs, "/a");
		tfs.write(a, 0, &pattern(12 * BS)).unwrap();
		let b = mkfile(&mut tfs, "/b");
		tfs.write(b, 0, &pattern(2 * BS)).unwrap();
		assert_eq!(tfs.info().unwrap().bfree, 5);

		let f = mkfile(&mut tfs, "/f");
		let data = pattern(10 * BS);
		match tfs.write(f, 0, &data) {
			Err(Error::NoSpace { done }) => assert_eq!(done, 5 * BS as u64),
			other => panic!("expected NoSpace, got {other:?}"),
		}

		let attr = tfs.node_attr(f).unwrap();
		assert_eq!(attr.size, 5 * BS as u64);
		assert_eq!(attr.blocks, 5);
		assert_eq!(tfs.info().unwrap().bfree, 0);

		// the committed prefix is intact
		let mut out = vec![0u8; 10 * BS];
		assert_eq!(tfs.read(f, 0, &mut out).unwrap(), 5 * BS);
		assert_eq!(out[..5 * BS], data[..5 * BS]);

		// and freeing /a makes room again
		tfs.remove_node(OsStr::new("/a")).unwrap();
		assert_eq!(tfs.info().unwrap().bfree, 12);
		assert_eq!(tfs.write(f, 5 * BS as u64, &pattern(BS)).unwrap(), BS);
	}

	#[test]
	fn truncate_up_allocates() {
		let (_f, mut tfs) = harness(4 * MIB);
		let nr = mkfile(&mut tfs, "/a");
		tfs.truncate(nr, (2 * BS) as u64).unwrap();
		let attr = tfs.node_attr(nr).unwrap();
		assert_eq!(attr.size, 2 * BS as u64);
		assert_eq!(attr.blocks, 2);
	}

	#[test]
	fn times_are_updated_and_settable() {
		use std::time::{Duration, SystemTime};

		let (_f, mut tfs) = harness(4 * MIB);
		let nr = mkfile(&mut tfs, "/a");

		let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
		tfs.set_times(nr, t, t).unwrap();
		let attr = tfs.node_attr(nr).unwrap();
		assert_eq!(attr.atime, t);
		assert_eq!(attr.mtime, t);

		tfs.write(nr, 0, b"x").unwrap();
		assert!(tfs.node_attr(nr).unwrap().mtime > t);
		let mut out = [0u8; 1];
		tfs.read(nr, 0, &mut out).unwrap();
		assert!(tfs.node_attr(nr).unwrap().atime > t);
	}
}
