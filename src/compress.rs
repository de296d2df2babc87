//! Compression driver for the archive formats the composer moves around:
//! chroot tarballs, repo metadata payloads and single-file artifacts.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use color_eyre::{eyre::Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{debug, trace};
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use crate::error::ComposerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
	TarGz,
	TarXz,
	Gz,
	Xz,
	Zstd,
}

impl Format {
	/// Derive the format from a file name.
	pub fn from_path(path: &Path) -> Result<Self> {
		let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
		Self::from_name(name)
	}

	pub fn from_name(name: &str) -> Result<Self> {
		if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
			Ok(Self::TarGz)
		} else if name.ends_with(".tar.xz") {
			Ok(Self::TarXz)
		} else if name.ends_with(".gz") {
			Ok(Self::Gz)
		} else if name.ends_with(".xz") {
			Ok(Self::Xz)
		} else if name.ends_with(".zst") || name.ends_with(".zstd") {
			Ok(Self::Zstd)
		} else {
			Err(ComposerError::UnknownCompression(name.to_owned()).into())
		}
	}

	fn is_archive(self) -> bool {
		matches!(self, Self::TarGz | Self::TarXz)
	}
}

fn decoder(format: Format, input: File) -> Result<Box<dyn Read>> {
	Ok(match format {
		Format::TarGz | Format::Gz => Box::new(GzDecoder::new(input)),
		Format::TarXz | Format::Xz => Box::new(XzDecoder::new(input)),
		Format::Zstd => Box::new(zstd::stream::Decoder::new(input)?),
	})
}

/// Pack `dir` into the archive named by `out` (`.tar.gz` or `.tar.xz`).
pub fn compress_dir(dir: &Path, out: &Path) -> Result<()> {
	let format = Format::from_path(out)?;
	if !format.is_archive() {
		return Err(ComposerError::UnknownCompression(format!(
			"{} is not a directory archive format",
			out.display()
		))
		.into());
	}
	debug!(?dir, ?out, "compressing directory");
	if let Some(parent) = out.parent() {
		std::fs::create_dir_all(parent)?;
	}
	let file = File::create(out)?;
	let writer: Box<dyn Write> = match format {
		Format::TarGz => Box::new(GzEncoder::new(file, flate2::Compression::default())),
		Format::TarXz => Box::new(XzEncoder::new(file, 6)),
		_ => unreachable!(),
	};
	let mut builder = tar::Builder::new(writer);
	builder.follow_symlinks(false);
	builder.append_dir_all(".", dir).wrap_err_with(|| format!("archiving {}", dir.display()))?;
	let writer = builder.into_inner()?;
	drop(writer);
	Ok(())
}

/// Unpack the archive `src` into the directory `dest`.
pub fn decompress_dir(src: &Path, dest: &Path) -> Result<()> {
	let format = Format::from_path(src)?;
	if !format.is_archive() {
		return Err(ComposerError::UnknownCompression(format!(
			"{} is not a directory archive format",
			src.display()
		))
		.into());
	}
	debug!(?src, ?dest, "extracting archive");
	std::fs::create_dir_all(dest)?;
	let mut archive = tar::Archive::new(decoder(format, File::open(src)?)?);
	archive.set_preserve_permissions(true);
	archive.unpack(dest).wrap_err_with(|| format!("extracting {}", src.display()))?;
	Ok(())
}

/// Compress a single file; format is taken from the output name.
pub fn compress_file(src: &Path, out: &Path) -> Result<()> {
	let format = Format::from_path(out)?;
	trace!(?src, ?out, ?format, "compressing file");
	let mut input = File::open(src)?;
	let output = File::create(out)?;
	match format {
		Format::Gz => {
			let mut enc = GzEncoder::new(output, flate2::Compression::default());
			std::io::copy(&mut input, &mut enc)?;
			enc.finish()?;
		},
		Format::Xz => {
			let mut enc = XzEncoder::new(output, 6);
			std::io::copy(&mut input, &mut enc)?;
			enc.finish()?;
		},
		Format::Zstd => {
			let mut enc = zstd::stream::Encoder::new(output, 0)?;
			std::io::copy(&mut input, &mut enc)?;
			enc.finish()?;
		},
		_ => {
			return Err(ComposerError::UnknownCompression(format!(
				"{} names an archive, not a single file",
				out.display()
			))
			.into())
		},
	}
	Ok(())
}

/// Decompress a single file to `out`.
pub fn decompress_file(src: &Path, out: &Path) -> Result<()> {
	let format = Format::from_path(src)?;
	trace!(?src, ?out, ?format, "decompressing file");
	let mut reader = decoder(format, File::open(src)?)?;
	let mut output = File::create(out)?;
	std::io::copy(&mut reader, &mut output)?;
	Ok(())
}

/// Decompress an in-memory payload whose format is named by `hint`
/// (typically the remote file name). Used for repo metadata.
pub fn decompress_bytes(data: &[u8], hint: &str) -> Result<Vec<u8>> {
	let format = Format::from_name(hint)?;
	let mut out = Vec::new();
	match format {
		Format::Gz | Format::TarGz => GzDecoder::new(data).read_to_end(&mut out)?,
		Format::Xz | Format::TarXz => XzDecoder::new(data).read_to_end(&mut out)?,
		Format::Zstd => zstd::stream::Decoder::new(data)?.read_to_end(&mut out)?,
	};
	Ok(out)
}
