use std::{
	collections::HashMap,
	ffi::{c_int, OsStr, OsString},
	path::Path,
	time::{Duration, SystemTime},
};

use fuser::{
	FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory,
	ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use rtfs::{
	Error, NodeAttr, NodeKind, NodeNo, Result, Tfs, BLOCK_SIZE, NAME_LIMIT, S_IFDIR, S_IFMT,
	S_IFREG,
};

const TTL: Duration = Duration::ZERO;

/// The driver context: the mounted image plus a fuse-ino to path table.
///
/// The core resolves names through absolute paths, while the kernel talks
/// in inode numbers; the table bridges the two. It is seeded from the
/// mount-time namespace walk and maintained on create/remove.
pub struct Fs {
	tfs:   Tfs,
	paths: HashMap<u64, OsString>,
}

/// FUSE_ROOT_ID is 1; TFS numbers nodes from 0.
fn ino(nr: NodeNo) -> u64 {
	nr as u64 + 1
}

fn node(ino: u64) -> NodeNo {
	ino as NodeNo - 1
}

fn kind(k: NodeKind) -> FileType {
	match k {
		NodeKind::Directory => FileType::Directory,
		NodeKind::RegularFile => FileType::RegularFile,
	}
}

fn attr(na: &NodeAttr) -> FileAttr {
	FileAttr {
		ino: ino(na.nr),
		size: na.size,
		blocks: na.blocks * (BLOCK_SIZE as u64 / 512),
		atime: na.atime,
		mtime: na.mtime,
		ctime: na.mtime,
		crtime: na.mtime,
		kind: kind(na.kind),
		perm: na.perm as u16,
		nlink: match na.kind {
			// the self link; children's ".." entries are implied
			NodeKind::Directory => na.nlink as u32 + 1,
			NodeKind::RegularFile => 1,
		},
		uid: 0,
		gid: 0,
		rdev: 0,
		blksize: BLOCK_SIZE as u32,
		flags: 0,
	}
}

fn run<T>(f: impl FnOnce() -> Result<T>) -> std::result::Result<T, c_int> {
	f().map_err(|e| {
		log::error!("{e}");
		e.errno()
	})
}

impl Fs {
	pub fn open(image: &Path) -> Result<Self> {
		let tfs = Tfs::load(image)?;
		let paths = tfs
			.paths()
			.map(|(p, nr)| (ino(nr), p.to_os_string()))
			.collect();
		Ok(Self { tfs, paths })
	}

	fn path(&self, ino: u64) -> Result<&OsStr> {
		self.paths
			.get(&ino)
			.map(|p| p.as_os_str())
			.ok_or(Error::NotFound)
	}

	fn child_path(&self, parent: u64, name: &OsStr) -> Result<OsString> {
		let mut path = self.path(parent)?.to_os_string();
		if path.as_os_str() != OsStr::new("/") {
			path.push("/");
		}
		path.push(name);
		Ok(path)
	}
}

impl Filesystem for Fs {
	fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), c_int> {
		Ok(())
	}

	fn destroy(&mut self) {
		if let Err(e) = self.tfs.sync() {
			log::error!("flush on unmount: {e}");
		}
	}

	fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
		let f = || {
			let path = self.child_path(parent, name)?;
			let na = self.tfs.get_node(&path)?;
			Ok((path, na))
		};
		match f() {
			Ok((path, na)) => {
				self.paths.insert(ino(na.nr), path);
				reply.entry(&TTL, &attr(&na), 0);
			}
			Err(e) => {
				if !matches!(e, Error::NotFound) {
					log::error!("{e}");
				}
				reply.error(e.errno());
			}
		}
	}

	fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
		match run(|| self.tfs.node_attr(node(ino))) {
			Ok(na) => reply.attr(&TTL, &attr(&na)),
			Err(e) => reply.error(e),
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn setattr(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		_mode: Option<u32>,
		_uid: Option<u32>,
		_gid: Option<u32>,
		size: Option<u64>,
		atime: Option<TimeOrNow>,
		mtime: Option<TimeOrNow>,
		_ctime: Option<SystemTime>,
		_fh: Option<u64>,
		_crtime: Option<SystemTime>,
		_chgtime: Option<SystemTime>,
		_bkuptime: Option<SystemTime>,
		_flags: Option<u32>,
		reply: ReplyAttr,
	) {
		let nr = node(ino);
		let f = || {
			if let Some(size) = size {
				self.tfs.truncate(nr, size)?;
			}
			if atime.is_some() || mtime.is_some() {
				let now = SystemTime::now();
				let resolve = |t: Option<TimeOrNow>, current| match t {
					Some(TimeOrNow::SpecificTime(t)) => t,
					Some(TimeOrNow::Now) => now,
					None => current,
				};
				let na = self.tfs.node_attr(nr)?;
				self.tfs
					.set_times(nr, resolve(atime, na.atime), resolve(mtime, na.mtime))?;
			}
			self.tfs.node_attr(nr)
		};
		match run(f) {
			Ok(na) => reply.attr(&TTL, &attr(&na)),
			Err(e) => reply.error(e),
		}
	}

	fn mknod(
		&mut self,
		_req: &Request<'_>,
		parent: u64,
		name: &OsStr,
		mode: u32,
		_umask: u32,
		_rdev: u32,
		reply: ReplyEntry,
	) {
		let f = || {
			if mode & S_IFMT != S_IFREG {
				return Err(Error::Unsupported);
			}
			let path = self.child_path(parent, name)?;
			let nr = self.tfs.add_node(&path, mode)?;
			Ok((path, self.tfs.node_attr(nr)?))
		};
		match run(f) {
			Ok((path, na)) => {
				self.paths.insert(ino(na.nr), path);
				reply.entry(&TTL, &attr(&na), 0);
			}
			Err(e) => reply.error(e),
		}
	}

	fn mkdir(
		&mut self,
		_req: &Request<'_>,
		parent: u64,
		name: &OsStr,
		mode: u32,
		_umask: u32,
		reply: ReplyEntry,
	) {
		let f = || {
			let path = self.child_path(parent, name)?;
			// OR in the type bit, because the documentation says to
			let nr = self.tfs.add_node(&path, mode | S_IFDIR)?;
			Ok((path, self.tfs.node_attr(nr)?))
		};
		match run(f) {
			Ok((path, na)) => {
				self.paths.insert(ino(na.nr), path);
				reply.entry(&TTL, &attr(&na), 0);
			}
			Err(e) => reply.error(e),
		}
	}

	fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
		let f = || {
			let path = self.child_path(parent, name)?;
			let na = self.tfs.get_node(&path)?;
			if na.kind == NodeKind::Directory {
				return Err(Error::IsDirectory);
			}
			self.tfs.remove_node(&path)?;
			Ok(na.nr)
		};
		match run(f) {
			Ok(nr) => {
				self.paths.remove(&ino(nr));
				reply.ok();
			}
			Err(e) => reply.error(e),
		}
	}

	fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
		let f = || {
			let path = self.child_path(parent, name)?;
			let na = self.tfs.get_node(&path)?;
			if na.kind != NodeKind::Directory {
				return Err(Error::NotDirectory);
			}
			if na.nlink > 0 {
				return Err(Error::NotEmpty);
			}
			self.tfs.remove_node(&path)?;
			Ok(na.nr)
		};
		match run(f) {
			Ok(nr) => {
				self.paths.remove(&ino(nr));
				reply.ok();
			}
			Err(e) => reply.error(e),
		}
	}

	fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
		reply.opened(0, 0);
	}

	fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
		reply.opened(0, 0);
	}

	fn read(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		_fh: u64,
		offset: i64,
		size: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: ReplyData,
	) {
		let f = || {
			let mut buf = vec![0u8; size as usize];
			let n = self.tfs.read(node(ino), offset as u64, &mut buf)?;
			buf.truncate(n);
			Ok(buf)
		};
		match run(f) {
			Ok(buf) => reply.data(&buf),
			Err(e) => reply.error(e),
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn write(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		_fh: u64,
		offset: i64,
		data: &[u8],
		_write_flags: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: ReplyWrite,
	) {
		match self.tfs.write(node(ino), offset as u64, data) {
			Ok(n) => reply.written(n as u32),
			// POSIX short write: report the prefix that made it
			Err(Error::NoSpace { done }) if done > 0 => reply.written(done as u32),
			Err(e) => {
				log::error!("{e}");
				reply.error(e.errno());
			}
		}
	}

	fn readdir(
		&mut self,
		_req: &Request<'_>,
		ino_: u64,
		_fh: u64,
		offset: i64,
		mut reply: ReplyDirectory,
	) {
		let f = || {
			if offset != 0 {
				return Ok(());
			}
			let nr = node(ino_);
			let na = self.tfs.node_attr(nr)?;
			if na.kind != NodeKind::Directory {
				return Err(Error::NotDirectory);
			}

			let mut i = 0;
			for name in [".", ".."] {
				i += 1;
				if reply.add(ino_, i, FileType::Directory, name) {
					return Ok(());
				}
			}
			for child in self.tfs.children(nr)? {
				i += 1;
				if reply.add(ino(child.nr), i, kind(child.kind), &child.name) {
					break;
				}
			}
			Ok(())
		};
		match run(f) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
		match run(|| self.tfs.info()) {
			Ok(info) => reply.statfs(
				info.blocks,
				info.bfree,
				info.bfree,
				info.files,
				info.ffree,
				info.bsize,
				NAME_LIMIT as u32 - 1,
				info.bsize,
			),
			Err(e) => reply.error(e),
		}
	}

	fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
		reply.ok();
	}

	fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
		match run(|| self.tfs.sync()) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}
}

#[cfg(test)]
mod t {
	use tempfile::NamedTempFile;

	use super::*;

	fn image() -> NamedTempFile {
		let f = NamedTempFile::new().unwrap();
		f.as_file().set_len(4 << 20).unwrap();
		let mut tfs = Tfs::open(f.path()).unwrap();
		tfs.format().unwrap();
		tfs.destroy().unwrap();

		let mut tfs = Tfs::load(f.path()).unwrap();
		tfs.add_node(OsStr::new("/d"), S_IFDIR | 0o755).unwrap();
		tfs.add_node(OsStr::new("/d/a"), S_IFREG | 0o644).unwrap();
		tfs.destroy().unwrap();
		f
	}

	#[test]
	fn the_path_table_is_seeded_at_open() {
		let img = image();
		let fs = Fs::open(img.path()).unwrap();
		assert_eq!(fs.paths.len(), 3);
		assert_eq!(fs.path(fuser::FUSE_ROOT_ID).unwrap(), OsStr::new("/"));
	}

	#[test]
	fn child_paths_join_cleanly() {
		let img = image();
		let fs = Fs::open(img.path()).unwrap();
		let d = fs.child_path(fuser::FUSE_ROOT_ID, OsStr::new("d")).unwrap();
		assert_eq!(d, OsString::from("/d"));
		let d_ino = ino(fs.tfs.get_node(&d).unwrap().nr);
		assert_eq!(
			fs.child_path(d_ino, OsStr::new("a")).unwrap(),
			OsString::from("/d/a")
		);
	}

	#[test]
	fn attrs_translate() {
		let img = image();
		let fs = Fs::open(img.path()).unwrap();
		let na = fs.tfs.get_node(OsStr::new("/d")).unwrap();
		let a = attr(&na);
		assert_eq!(a.kind, FileType::Directory);
		assert_eq!(a.ino, ino(na.nr));
		assert_eq!(a.perm, 0o755);
		assert_eq!(a.nlink, 2);
		assert_eq!(a.blksize, BLOCK_SIZE as u32);
	}
}
