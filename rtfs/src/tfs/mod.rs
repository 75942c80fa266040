use std::{
	collections::HashMap,
	ffi::{OsStr, OsString},
	path::Path,
};

mod alloc;
mod cache;
mod cursor;
mod dir;
mod node;

use crate::{
	data::*,
	error::{corrupt, Error, Result},
	image::Image,
};

/// Summary of image statistics.
#[derive(Debug, Clone)]
#[doc(alias = "Statfs")]
pub struct Info {
	/// Number of data blocks.
	pub blocks: u64,

	/// Number of free data blocks.
	pub bfree: u64,

	/// Number of nodes.
	pub files: u64,

	/// Number of free nodes.
	pub ffree: u64,

	/// Block size.
	pub bsize: u32,
}

/// A mounted TFS image.
///
/// One `Tfs` owns the mapping and the path cache for the lifetime of the
/// mount. The surrounding driver serializes all calls; no operation may run
/// concurrently with another on the same image.
pub struct Tfs {
	image:   Image,
	nblocks: i64,
	nnodes:  i64,
	cache:   HashMap<OsString, NodeNo>,
}

impl Tfs {
	/// Map an image file read/write at its full length.
	///
	/// The geometry is not read yet: call [`Tfs::format`] on a fresh image,
	/// or use [`Tfs::load`] for an existing one.
	pub fn open(path: &Path) -> Result<Self> {
		let image = Image::open(path)?;
		Ok(Self {
			image,
			nblocks: 0,
			nnodes: 0,
			cache: HashMap::new(),
		})
	}

	/// Open an image and build the path cache by walking the on-disk tree.
	#[doc(alias = "mount")]
	pub fn load(path: &Path) -> Result<Self> {
		let mut tfs = Self::open(path)?;
		tfs.init()?;
		tfs.cache_build()?;
		Ok(tfs)
	}

	/// Lay out a fresh filesystem on the mapped image.
	///
	/// Derives the geometry from the image length, writes the superblock,
	/// initializes the root directory, and threads both free lists.
	pub fn format(&mut self) -> Result<()> {
		let len = self.image.len() as i64;
		let nblocks = len / (BLOCK_SIZE + INODE_SIZE / BLOCKS_PER_NODE) as i64;
		let nnodes = nblocks / BLOCKS_PER_NODE as i64;
		if nnodes < 1 || Self::layout_end(nblocks, nnodes) > len {
			// the derived region layout must fit the file, superblock and
			// node table included; unlucky lengths with no slack do not
			return Err(corrupt!(
				"image of {len} bytes cannot hold its own layout"
			));
		}
		// Root takes node 0.
		let sb = Superblock {
			nblocks,
			free_block_head: 0,
			nnodes,
			free_node_head: if nnodes > 1 { 1 } else { END },
		};
		self.image.encode_at(0, &sb)?;
		self.init()?;

		// Root has no name.
		let root = Inode::new(OsStr::new(""), S_IFDIR | 0o644);
		self.write_node(ROOT_NODE, &root)?;

		// Thread the free lists: i -> i + 1, last -> END.
		for b in 0..self.nblocks {
			let next = if b + 1 < self.nblocks { b + 1 } else { END };
			self.image.encode_at(self.block_off(b), &next)?;
		}
		for n in 1..self.nnodes {
			let next = if n + 1 < self.nnodes { n + 1 } else { END };
			self.image.encode_at(self.node_off(n), &next)?;
		}

		Ok(())
	}

	/// Recompute the in-memory geometry from the superblock.
	fn init(&mut self) -> Result<()> {
		let sb: Superblock = self.image.decode_at(0)?;
		self.nblocks = sb.nblocks;
		self.nnodes = sb.nnodes;
		self.check(&sb)
	}

	/// Flush dirty pages without unmapping.
	pub fn sync(&self) -> Result<()> {
		self.image.flush()
	}

	/// Flush and unmap the image.
	pub fn destroy(self) -> Result<()> {
		self.image.flush()
	}

	fn check(&self, sb: &Superblock) -> Result<()> {
		log::debug!("superblock: {sb:?}");
		log::info!("image size: {}", self.image.len());
		log::info!("# blocks: {}", sb.nblocks);
		log::info!("# nodes: {}", sb.nnodes);
		log::info!("free block head: {}", sb.free_block_head);
		log::info!("free node head: {}", sb.free_node_head);

		macro_rules! sbassert {
			($e:expr) => {
				if !($e) {
					log::error!("superblock corrupted: {}", stringify!($e));
					return Err(corrupt!("superblock corrupted: {}", stringify!($e)));
				}
			};
		}

		let len = self.image.len() as i64;
		let nblocks = len / (BLOCK_SIZE + INODE_SIZE / BLOCKS_PER_NODE) as i64;
		sbassert!(sb.nblocks == nblocks);
		sbassert!(sb.nnodes == nblocks / BLOCKS_PER_NODE as i64);
		sbassert!(sb.nblocks >= 1 && sb.nnodes >= 1);
		sbassert!(Self::layout_end(sb.nblocks, sb.nnodes) <= len);
		sbassert!(sb.free_block_head >= END && sb.free_block_head < sb.nblocks);
		sbassert!(sb.free_node_head >= END && sb.free_node_head < sb.nnodes);

		Ok(())
	}

	/// First byte past the data region for a given geometry.
	fn layout_end(nblocks: i64, nnodes: i64) -> i64 {
		SUPERBLOCK_SIZE as i64 + nnodes * INODE_SIZE as i64 + nblocks * BLOCK_SIZE as i64
	}

	/// Look up a node by absolute path.
	pub fn get_node(&self, path: &OsStr) -> Result<NodeAttr> {
		log::trace!("get_node({path:?});");
		let nr = self.lookup(path).ok_or(Error::NotFound)?;
		let ino = self.read_node(nr)?;
		Ok(ino.as_attr(nr))
	}

	/// All cached (path, node) pairs. Drivers seed their own tables from
	/// this after [`Tfs::load`].
	pub fn paths(&self) -> impl Iterator<Item = (&OsStr, NodeNo)> + '_ {
		self.cache.iter().map(|(p, nr)| (p.as_os_str(), *nr))
	}

	/// Get image statistics by walking both free lists.
	#[doc(alias("statfs", "statvfs"))]
	pub fn info(&self) -> Result<Info> {
		let mut bfree: i64 = 0;
		let mut b: BlockNo = self.image.decode_at(sb_off::FREE_BLOCK_HEAD)?;
		while b != END {
			if !(0..self.nblocks).contains(&b) || bfree >= self.nblocks {
				return Err(corrupt!("free block list escapes the data region at {b}"));
			}
			bfree += 1;
			b = self.image.decode_at(self.block_off(b))?;
		}

		let mut ffree: i64 = 0;
		let mut n: NodeNo = self.image.decode_at(sb_off::FREE_NODE_HEAD)?;
		while n != END {
			if !(0..self.nnodes).contains(&n) || ffree >= self.nnodes {
				return Err(corrupt!("free node list escapes the node table at {n}"));
			}
			ffree += 1;
			n = self.image.decode_at(self.node_off(n))?;
		}

		Ok(Info {
			blocks: self.nblocks as u64,
			bfree:  bfree as u64,
			files:  self.nnodes as u64,
			ffree:  ffree as u64,
			bsize:  BLOCK_SIZE as u32,
		})
	}

	fn node_off(&self, nr: NodeNo) -> u64 {
		SUPERBLOCK_SIZE as u64 + nr as u64 * INODE_SIZE as u64
	}

	fn block_off(&self, b: BlockNo) -> u64 {
		debug_assert!((0..self.nblocks).contains(&b));
		SUPERBLOCK_SIZE as u64
			+ self.nnodes as u64 * INODE_SIZE as u64
			+ b as u64 * BLOCK_SIZE as u64
	}
}

#[cfg(test)]
pub(crate) mod t {
	use tempfile::NamedTempFile;

	use super::*;

	pub(crate) const MIB: u64 = 1 << 20;

	/// Geometry of a 4 MiB image.
	pub(crate) const SMALL_BLOCKS: u64 = 1008;
	pub(crate) const SMALL_NODES: u64 = 252;

	/// Just enough for 20 blocks and 5 nodes, superblock and node table
	/// included.
	pub(crate) const TINY: u64 = 20 * (BLOCK_SIZE as u64 + 64) + 2048;

	/// Format a fresh image of `size` bytes, then mount it.
	pub(crate) fn harness(size: u64) -> (NamedTempFile, Tfs) {
		let f = NamedTempFile::new().unwrap();
		f.as_file().set_len(size).unwrap();
		let mut tfs = Tfs::open(f.path()).unwrap();
		tfs.format().unwrap();
		tfs.destroy().unwrap();
		let tfs = Tfs::load(f.path()).unwrap();
		(f, tfs)
	}

	#[test]
	fn format_then_stat_root() {
		let (_f, tfs) = harness(4 * MIB);
		let root = tfs.get_node(OsStr::new("/")).unwrap();
		assert_eq!(root.kind, NodeKind::Directory);
		assert_eq!(root.nlink, 0);
		assert_eq!(root.blocks, 0);
		assert_eq!(root.size, 0);
		assert_eq!(root.nr, ROOT_NODE);
	}

	#[test]
	fn geometry_agrees_with_image_length() {
		let (_f, tfs) = harness(4 * MIB);
		let info = tfs.info().unwrap();
		assert_eq!(info.blocks, SMALL_BLOCKS);
		assert_eq!(info.files, SMALL_NODES);
		// everything is free except the root node
		assert_eq!(info.bfree, SMALL_BLOCKS);
		assert_eq!(info.ffree, SMALL_NODES - 1);
		assert_eq!(info.bsize, BLOCK_SIZE as u32);
	}

	#[test]
	fn format_is_idempotent() {
		let f = NamedTempFile::new().unwrap();
		f.as_file().set_len(4 * MIB).unwrap();
		for _ in 0..2 {
			let mut tfs = Tfs::open(f.path()).unwrap();
			tfs.format().unwrap();
			tfs.destroy().unwrap();
		}
		let tfs = Tfs::load(f.path()).unwrap();
		assert_eq!(tfs.info().unwrap().ffree, SMALL_NODES - 1);
	}

	#[test]
	fn too_small_an_image_is_rejected() {
		let f = NamedTempFile::new().unwrap();
		f.as_file().set_len(1024).unwrap();
		let mut tfs = Tfs::open(f.path()).unwrap();
		assert!(matches!(tfs.format(), Err(Error::Io(_))));
	}

	#[test]
	fn load_rejects_garbage() {
		let f = NamedTempFile::new().unwrap();
		f.as_file().set_len(4 * MIB).unwrap();
		// never formatted: the zeroed superblock disagrees with the length
		assert!(Tfs::load(f.path()).is_err());
	}

	#[test]
	fn missing_image_is_an_io_error() {
		assert!(matches!(
			Tfs::open(Path::new("/nonexistent/tfs.img")),
			Err(Error::Io(_))
		));
	}
}
