use std::{fs::File, path::Path};

use bincode::{
	config::{Configuration, Fixint, LittleEndian, NoLimit},
	Decode, Encode,
};
use memmap2::MmapMut;

use crate::error::{corrupt, Result};

/// On-disk codec: fixed-size little-endian integers, no length prefixes.
const CODEC: Configuration<LittleEndian, Fixint, NoLimit> = bincode::config::standard()
	.with_fixed_int_encoding()
	.with_little_endian();

/// A TFS image, memory-mapped read/write at its full length.
///
/// Every access is bounds-checked index math into the mapping; offsets are
/// image-relative bytes. The OS writes dirty pages back; `flush` forces it.
pub(crate) struct Image {
	map: MmapMut,
}

impl Image {
	pub fn open(path: &Path) -> Result<Self> {
		let file = File::options().read(true).write(true).open(path)?;
		// Safety: the image must not be resized or written behind our back
		// for the lifetime of the mapping.
		let map = unsafe { MmapMut::map_mut(&file)? };
		Ok(Self { map })
	}

	pub fn len(&self) -> u64 {
		self.map.len() as u64
	}

	pub fn bytes(&self, off: u64, len: usize) -> Result<&[u8]> {
		let off = off as usize;
		off.checked_add(len)
			.and_then(|end| self.map.get(off..end))
			.ok_or_else(|| corrupt!("read of {len} bytes at {off} escapes the image"))
	}

	pub fn bytes_mut(&mut self, off: u64, len: usize) -> Result<&mut [u8]> {
		let off = off as usize;
		off.checked_add(len)
			.and_then(|end| self.map.get_mut(off..end))
			.ok_or_else(|| corrupt!("write of {len} bytes at {off} escapes the image"))
	}

	pub fn decode_at<T: Decode>(&self, off: u64) -> Result<T> {
		let buf = self
			.map
			.get(off as usize..)
			.ok_or_else(|| corrupt!("decode at {off} escapes the image"))?;
		bincode::decode_from_slice(buf, CODEC)
			.map(|(v, _)| v)
			.map_err(|e| corrupt!("decode at {off}: {e}"))
	}

	pub fn encode_at<T: Encode>(&mut self, off: u64, v: &T) -> Result<()> {
		let buf = self
			.map
			.get_mut(off as usize..)
			.ok_or_else(|| corrupt!("encode at {off} escapes the image"))?;
		bincode::encode_into_slice(v, buf, CODEC)
			.map(|_| ())
			.map_err(|e| corrupt!("encode at {off}: {e}"))
	}

	pub fn flush(&self) -> Result<()> {
		self.map.flush()?;
		Ok(())
	}
}
