use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use rtfs::Tfs;

/// Format a file as a TFS image.
///
/// The file must already have its final size, e.g. from fallocate(1).
#[derive(Parser)]
#[command(version, about)]
struct Cli {
	/// Path to the image file
	image: PathBuf,

	#[command(flatten)]
	verbose: Verbosity<WarnLevel>,
}

fn main() -> Result<()> {
	let cli = Cli::parse();

	env_logger::builder()
		.filter_level(cli.verbose.log_level_filter())
		.init();

	let mut tfs = Tfs::open(&cli.image)?;
	tfs.format()?;
	tfs.destroy()?;

	Ok(())
}
