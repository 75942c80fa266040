use std::os::unix::ffi::OsStrExt;

use super::*;

/// Parent path of `path`; `"/"` for top-level entries and for the root
/// itself.
pub(super) fn dirname(path: &OsStr) -> &OsStr {
	let b = path.as_bytes();
	let end = b.iter().rposition(|c| *c == b'/').unwrap_or(0);
	OsStr::from_bytes(&b[..end.max(1)])
}

/// Final component of `path`.
pub(super) fn basename(path: &OsStr) -> &OsStr {
	let b = path.as_bytes();
	let beg = b.iter().rposition(|c| *c == b'/').map_or(0, |i| i + 1);
	OsStr::from_bytes(&b[beg..])
}

// The cache is the only name-resolution structure; there is no on-disk
// parent pointer. It is rebuilt from the tree on every mount and never
// persisted.
impl Tfs {
	pub(super) fn lookup(&self, path: &OsStr) -> Option<NodeNo> {
		self.cache.get(path).copied()
	}

	pub(super) fn cache_insert(&mut self, path: &OsStr, nr: NodeNo) {
		self.cache.insert(path.to_os_string(), nr);
	}

	pub(super) fn cache_remove(&mut self, path: &OsStr) {
		self.cache.remove(path);
	}

	/// Walk the whole namespace, keying every node by its absolute path.
	pub(super) fn cache_build(&mut self) -> Result<()> {
		self.cache = HashMap::with_capacity(self.nnodes as usize);
		self.cache.insert(OsString::from("/"), ROOT_NODE);
		self.walk(OsString::new(), ROOT_NODE)
	}

	fn walk(&mut self, prefix: OsString, nr: NodeNo) -> Result<()> {
		for (child_nr, child) in self.dir_entries(nr)? {
			let mut path = prefix.clone();
			path.push("/");
			path.push(child.name());
			log::debug!("found {path:?}");
			if child.is_dir() {
				self.walk(path.clone(), child_nr)?;
			}
			self.cache.insert(path, child_nr);
		}
		Ok(())
	}
}
