use std::{
	ffi::{OsStr, OsString},
	mem::size_of,
	os::unix::ffi::OsStrExt,
	time::{Duration, SystemTime},
};

use bincode::{Decode, Encode};

/// Size of a data block. Must be a power of two.
pub const BLOCK_SIZE: usize = 4096;

/// Data blocks per node when deriving geometry from the image size.
pub const BLOCKS_PER_NODE: usize = 4;

/// Direct block slots in a node.
pub const DIRECT_BLOCKS: usize = 12;

/// Indirect tree roots in a node (single, double, triple).
pub const ILEVELS: usize = 3;

/// Maximum length of a name, including the NUL terminator.
pub const NAME_LIMIT: usize = 64;

/// Size of an on-disk node record.
pub const INODE_SIZE: usize = 256;

/// Size of the on-disk superblock.
pub const SUPERBLOCK_SIZE: usize = 32;

/// Child slots per directory data block.
pub const BLOCK_MAX_CHILDREN: usize = BLOCK_SIZE / size_of::<NodeNo>();

/// Pointer slots per index block.
pub const BLOCK_MAX_POINTERS: usize = BLOCK_SIZE / size_of::<BlockNo>();

/// Terminates both free lists and marks "no such block/node".
pub const END: i64 = -1;

/// Image-relative number of a data block.
pub type BlockNo = i64;

/// Number of a node in the node table.
pub type NodeNo = i64;

/// The root directory. Always allocated, never freed.
pub const ROOT_NODE: NodeNo = 0;

/// type of file mask
pub const S_IFMT: u32 = 0o170000;

/// directory
pub const S_IFDIR: u32 = 0o040000;

/// regular
pub const S_IFREG: u32 = 0o100000;

/// Byte offsets of the free-list heads within the superblock.
pub(crate) mod sb_off {
	pub const FREE_BLOCK_HEAD: u64 = 8;
	pub const FREE_NODE_HEAD: u64 = 24;
}

/// TFS superblock: everything else is derived from these four words.
#[derive(Debug, Clone, Decode, Encode)]
pub(crate) struct Superblock {
	pub nblocks:         i64,
	pub free_block_head: BlockNo,
	pub nnodes:          i64,
	pub free_node_head:  NodeNo,
}

/// On-disk timestamp.
#[derive(Debug, Clone, Copy, Decode, Encode)]
pub(crate) struct Timespec {
	pub sec:  i64,
	pub nsec: u32,
}

impl Timespec {
	pub fn now() -> Self {
		SystemTime::now().into()
	}
}

impl From<SystemTime> for Timespec {
	fn from(t: SystemTime) -> Self {
		let d = t
			.duration_since(SystemTime::UNIX_EPOCH)
			.unwrap_or(Duration::ZERO);
		Self {
			sec:  d.as_secs() as i64,
			nsec: d.subsec_nanos(),
		}
	}
}

impl From<Timespec> for SystemTime {
	fn from(t: Timespec) -> Self {
		SystemTime::UNIX_EPOCH + Duration::new(t.sec.max(0) as u64, t.nsec)
	}
}

/// On-disk node record, allocated view.
///
/// A free node reuses the record's first word as its free-list link; see
/// `Tfs::free_node`. The `count` word holds the child count for directories
/// and the byte size for regular files, so only the accessor matching the
/// mode bit may touch it.
#[derive(Debug, Clone, Decode, Encode)]
pub(crate) struct Inode {
	pub mode:    u32,
	pub name:    [u8; NAME_LIMIT],
	pub blocks:  [BlockNo; DIRECT_BLOCKS],
	pub iblocks: [BlockNo; ILEVELS],
	pub nblocks: i64,
	count:       i64,
	pub atime:   Timespec,
	pub mtime:   Timespec,
}

impl Inode {
	pub fn new(name: &OsStr, mode: u32) -> Self {
		let now = Timespec::now();
		let mut ino = Self {
			mode,
			name: [0; NAME_LIMIT],
			blocks: [END; DIRECT_BLOCKS],
			iblocks: [END; ILEVELS],
			nblocks: 0,
			count: 0,
			atime: now,
			mtime: now,
		};
		ino.set_name(name);
		ino
	}

	pub fn is_dir(&self) -> bool {
		self.mode & S_IFDIR != 0
	}

	pub fn kind(&self) -> NodeKind {
		if self.is_dir() {
			NodeKind::Directory
		} else {
			NodeKind::RegularFile
		}
	}

	/// File size in bytes. Regular files only.
	pub fn size(&self) -> i64 {
		debug_assert!(!self.is_dir());
		self.count
	}

	pub fn set_size(&mut self, size: i64) {
		debug_assert!(!self.is_dir());
		self.count = size;
	}

	/// Number of children. Directories only.
	pub fn nlink(&self) -> i64 {
		debug_assert!(self.is_dir());
		self.count
	}

	pub fn set_nlink(&mut self, nlink: i64) {
		debug_assert!(self.is_dir());
		self.count = nlink;
	}

	/// Absolute size of the node's data in bytes.
	pub fn node_size(&self) -> i64 {
		if self.is_dir() {
			self.count * size_of::<NodeNo>() as i64
		} else {
			self.count
		}
	}

	/// Data blocks the node's size requires. Index blocks are not counted.
	pub fn required_blocks(&self) -> i64 {
		(BLOCK_SIZE as i64 + self.node_size() - 1) / BLOCK_SIZE as i64
	}

	pub fn name(&self) -> &OsStr {
		let len = self.name.iter().position(|b| *b == 0).unwrap_or(NAME_LIMIT);
		OsStr::from_bytes(&self.name[..len])
	}

	pub fn set_name(&mut self, name: &OsStr) {
		let b = name.as_bytes();
		debug_assert!(b.len() < NAME_LIMIT);
		self.name = [0; NAME_LIMIT];
		self.name[..b.len()].copy_from_slice(b);
	}

	pub fn as_attr(&self, nr: NodeNo) -> NodeAttr {
		NodeAttr {
			nr,
			kind: self.kind(),
			perm: self.mode & !S_IFMT,
			size: self.node_size() as u64,
			nlink: if self.is_dir() { self.count as u64 } else { 1 },
			blocks: self.nblocks as u64,
			name: self.name().to_os_string(),
			atime: self.atime.into(),
			mtime: self.mtime.into(),
		}
	}
}

/// Kind of a node, from its mode word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
	Directory,
	RegularFile,
}

/// Public metadata of a node.
#[doc(alias = "stat")]
#[derive(Debug, Clone)]
pub struct NodeAttr {
	pub nr:     NodeNo,
	pub kind:   NodeKind,
	/// Permission bits, without the type bits.
	pub perm:   u32,
	/// `size` for files, `nlink * sizeof(NodeNo)` for directories.
	pub size:   u64,
	/// Child count for directories, 1 for files.
	pub nlink:  u64,
	/// Allocated data blocks.
	pub blocks: u64,
	pub name:   OsString,
	pub atime:  SystemTime,
	pub mtime:  SystemTime,
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn node_size_of_a_directory_counts_slots() {
		let mut dir = Inode::new(OsStr::new("d"), S_IFDIR | 0o755);
		dir.set_nlink(3);
		assert_eq!(dir.node_size(), 24);
		assert_eq!(dir.required_blocks(), 1);
	}

	#[test]
	fn required_blocks_rounds_up() {
		let mut f = Inode::new(OsStr::new("f"), S_IFREG | 0o644);
		assert_eq!(f.required_blocks(), 0);
		f.set_size(1);
		assert_eq!(f.required_blocks(), 1);
		f.set_size(BLOCK_SIZE as i64);
		assert_eq!(f.required_blocks(), 1);
		f.set_size(BLOCK_SIZE as i64 + 1);
		assert_eq!(f.required_blocks(), 2);
	}

	#[test]
	fn names_are_nul_terminated() {
		let ino = Inode::new(OsStr::new("hello"), S_IFREG | 0o644);
		assert_eq!(ino.name(), OsStr::new("hello"));
		assert_eq!(ino.name[5], 0);
	}

	#[test]
	fn encoded_record_fits() {
		let cfg = bincode::config::standard()
			.with_fixed_int_encoding()
			.with_little_endian();
		let ino = Inode::new(OsStr::new("x"), S_IFREG | 0o644);
		let mut buf = [0u8; INODE_SIZE];
		let n = bincode::encode_into_slice(&ino, &mut buf, cfg).unwrap();
		assert!(n <= INODE_SIZE);
		let sb = Superblock {
			nblocks:         1,
			free_block_head: 0,
			nnodes:          1,
			free_node_head:  END,
		};
		let n = bincode::encode_into_slice(&sb, &mut buf, cfg).unwrap();
		assert_eq!(n, SUPERBLOCK_SIZE);
	}
}
