//! Small filesystem helpers shared across the build pipeline.

use std::path::{Component, Path, PathBuf};

use color_eyre::{eyre::Context, Result};
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::error::ComposerError;

/// Write `content` to `path`, creating parent directories as needed.
pub fn just_write(path: impl AsRef<Path>, content: impl AsRef<[u8]>) -> Result<()> {
	let path = path.as_ref();
	trace!(?path, "writing file");
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	std::fs::write(path, content)?;
	Ok(())
}

/// Copy a single file, creating the destination's parent directories.
pub fn copy_file(src: &Path, dest: &Path) -> Result<()> {
	if let Some(parent) = dest.parent() {
		std::fs::create_dir_all(parent)?;
	}
	std::fs::copy(src, dest)
		.wrap_err_with(|| format!("copying {} to {}", src.display(), dest.display()))?;
	Ok(())
}

/// Recursively copy `src` into `dest`, preserving symlinks.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
	std::fs::create_dir_all(dest)?;
	for entry in walkdir::WalkDir::new(src).min_depth(1) {
		let entry = entry?;
		let rel = entry.path().strip_prefix(src)?;
		let target = dest.join(rel);
		let ftype = entry.file_type();
		if ftype.is_dir() {
			std::fs::create_dir_all(&target)?;
		} else if ftype.is_symlink() {
			let link = std::fs::read_link(entry.path())?;
			if target.exists() {
				std::fs::remove_file(&target)?;
			}
			std::os::unix::fs::symlink(link, &target)?;
		} else {
			copy_file(entry.path(), &target)?;
		}
	}
	Ok(())
}

/// Lexically normalize `path`: resolve `.` and `..` without touching the
/// filesystem. `..` above the root is clamped.
fn normalize(path: &Path) -> PathBuf {
	let mut out = PathBuf::new();
	for comp in path.components() {
		match comp {
			Component::CurDir => {},
			Component::ParentDir => {
				out.pop();
			},
			other => out.push(other),
		}
	}
	out
}

/// Whether `path` lies within `base` after lexical normalization.
pub fn is_subpath(base: &Path, path: &Path) -> bool {
	normalize(path).starts_with(normalize(base))
}

/// Load a YAML document into `T`.
pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
	if !path.exists() {
		return Err(ComposerError::ConfigMissing(path.to_path_buf()).into());
	}
	let text = std::fs::read_to_string(path)?;
	serde_yaml::from_str(&text)
		.map_err(|e| ComposerError::ConfigInvalid(format!("{}: {e}", path.display())).into())
}

/// Render `{{ name }}` placeholders in `text` from the given bindings.
pub fn substitute(text: &str, bindings: &[(&str, &str)]) -> Result<String> {
	let mut ctx = tera::Context::new();
	for (key, value) in bindings {
		ctx.insert(*key, value);
	}
	Ok(tera::Tera::one_off(text, &ctx, false)?)
}

/// Create a sparse file of the given size, truncating any existing content.
pub fn create_sparse(path: &Path, size: u64) -> Result<()> {
	trace!(?path, size, "creating sparse file");
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	let file = std::fs::File::create(path)?;
	file.set_len(size)?;
	Ok(())
}
