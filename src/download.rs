//! Parallel package download into the content-addressed cache.
//!
//! Cache invariant: a file is present implies its digest matches the
//! metadata that produced it. Writes are atomic (temp file + rename), so a
//! crashed or cancelled build never leaves a bad digest behind.

use std::io::Read;
use std::path::Path;

use color_eyre::Result;
use md5::Md5;
use rayon::prelude::*;
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, info, trace};

use crate::error::ComposerError;
use crate::repo::fetch::Fetcher;
use crate::repo::{Checksum, ChecksumAlgo, PackageInfo};

const DEFAULT_POOL_SIZE: usize = 4;

pub fn digest_bytes(algo: ChecksumAlgo, data: &[u8]) -> String {
	match algo {
		ChecksumAlgo::Sha256 => hex::encode(Sha256::digest(data)),
		ChecksumAlgo::Sha512 => hex::encode(Sha512::digest(data)),
		ChecksumAlgo::Md5 => hex::encode(Md5::digest(data)),
	}
}

/// Streamed digest of a file on disk.
pub fn digest_file(algo: ChecksumAlgo, path: &Path) -> Result<String> {
	let mut file = std::fs::File::open(path)?;
	let mut buf = [0u8; 64 * 1024];

	fn stream<D: Digest>(file: &mut std::fs::File, buf: &mut [u8]) -> std::io::Result<String> {
		let mut hasher = D::new();
		loop {
			let n = file.read(buf)?;
			if n == 0 {
				break;
			}
			hasher.update(&buf[..n]);
		}
		Ok(hex::encode(hasher.finalize()))
	}

	Ok(match algo {
		ChecksumAlgo::Sha256 => stream::<Sha256>(&mut file, &mut buf)?,
		ChecksumAlgo::Sha512 => stream::<Sha512>(&mut file, &mut buf)?,
		ChecksumAlgo::Md5 => stream::<Md5>(&mut file, &mut buf)?,
	})
}

/// Whether the file at `path` matches `checksum`.
pub fn verify_file(path: &Path, checksum: &Checksum) -> Result<bool> {
	Ok(digest_file(checksum.algo, path)? == checksum.digest)
}

pub struct Downloader {
	fetcher: Fetcher,
	pool_size: usize,
}

impl Downloader {
	pub fn new(fetcher: Fetcher) -> Self {
		Self { fetcher, pool_size: DEFAULT_POOL_SIZE }
	}

	#[must_use]
	pub fn with_pool_size(mut self, pool_size: usize) -> Self {
		self.pool_size = pool_size.max(1);
		self
	}

	/// Fill the cache with every package in `packages`, skipping entries
	/// whose digest already matches.
	pub fn download_all(&self, packages: &[PackageInfo], cache_dir: &Path) -> Result<()> {
		std::fs::create_dir_all(cache_dir)?;
		info!(count = packages.len(), ?cache_dir, "downloading packages");

		let pool = rayon::ThreadPoolBuilder::new().num_threads(self.pool_size).build()?;
		pool.install(|| {
			packages.par_iter().try_for_each(|pkg| self.fetch_one(pkg, cache_dir))
		})
	}

	fn fetch_one(&self, pkg: &PackageInfo, cache_dir: &Path) -> Result<()> {
		let dest = cache_dir.join(&pkg.filename);
		if dest.exists() && verify_file(&dest, &pkg.checksum)? {
			trace!(file = pkg.filename.as_str(), "cache hit");
			return Ok(());
		}

		debug!(url = pkg.download_url.as_str(), "downloading");
		let temp = tempfile::NamedTempFile::new_in(cache_dir)?;
		self.fetcher.get_to_file(&pkg.download_url, temp.path())?;

		let actual = digest_file(pkg.checksum.algo, temp.path())?;
		if actual != pkg.checksum.digest {
			// temp file is dropped (and removed) before we return
			return Err(ComposerError::ChecksumMismatch {
				file: pkg.filename.clone(),
				expected: pkg.checksum.digest.clone(),
				actual,
			}
			.into());
		}
		temp.persist(&dest).map_err(|e| e.error)?;
		Ok(())
	}

	/// Parallel digest pass over already-cached files. Returns the filenames
	/// that are present but fail verification.
	pub fn verify_cache(
		&self, packages: &[PackageInfo], cache_dir: &Path,
	) -> Result<Vec<String>> {
		let pool = rayon::ThreadPoolBuilder::new().num_threads(self.pool_size).build()?;
		pool.install(|| {
			packages
				.par_iter()
				.filter_map(|pkg| {
					let path = cache_dir.join(&pkg.filename);
					if !path.exists() {
						return None;
					}
					match verify_file(&path, &pkg.checksum) {
						Ok(true) => None,
						Ok(false) => Some(Ok(pkg.filename.clone())),
						Err(e) => Some(Err(e)),
					}
				})
				.collect()
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::repo::test_package;

	#[test]
	fn digest_matches_known_vector() {
		// sha256 of the empty string
		assert_eq!(
			digest_bytes(ChecksumAlgo::Sha256, b""),
			"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
		);
	}

	#[test]
	fn file_and_byte_digests_agree() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("pkg.rpm");
		std::fs::write(&path, b"payload").unwrap();
		assert_eq!(
			digest_file(ChecksumAlgo::Sha256, &path).unwrap(),
			digest_bytes(ChecksumAlgo::Sha256, b"payload")
		);
		assert_eq!(
			digest_file(ChecksumAlgo::Md5, &path).unwrap(),
			digest_bytes(ChecksumAlgo::Md5, b"payload")
		);
	}

	#[test]
	fn matching_cache_entry_is_skipped() {
		let cache = tempfile::tempdir().unwrap();
		let mut pkg = test_package("bash", "5.2");
		std::fs::write(cache.path().join(&pkg.filename), b"cached-bytes").unwrap();
		pkg.checksum = Checksum::new(
			ChecksumAlgo::Sha256,
			digest_bytes(ChecksumAlgo::Sha256, b"cached-bytes"),
		);
		// the download URL is unreachable; a cache hit must not touch it
		pkg.download_url = "http://127.0.0.1:1/bash.rpm".to_owned();

		let dl = Downloader::new(Fetcher::with_retries(0).unwrap()).with_pool_size(2);
		dl.download_all(&[pkg], cache.path()).unwrap();
	}

	#[test]
	fn stale_cache_entry_forces_refetch() {
		let cache = tempfile::tempdir().unwrap();
		let mut pkg = test_package("bash", "5.2");
		std::fs::write(cache.path().join(&pkg.filename), b"corrupted").unwrap();
		pkg.download_url = "http://127.0.0.1:1/bash.rpm".to_owned();

		let dl = Downloader::new(Fetcher::with_retries(0).unwrap());
		// refetch is attempted and fails against the unreachable URL
		let err = dl.download_all(&[pkg], cache.path()).unwrap_err();
		assert!(matches!(
			err.downcast_ref::<ComposerError>(),
			Some(ComposerError::NetworkFetch { .. })
		));
	}

	#[test]
	fn verify_cache_reports_mismatches() {
		let cache = tempfile::tempdir().unwrap();
		let mut good = test_package("good", "1");
		std::fs::write(cache.path().join(&good.filename), b"good").unwrap();
		good.checksum =
			Checksum::new(ChecksumAlgo::Sha256, digest_bytes(ChecksumAlgo::Sha256, b"good"));

		let mut bad = test_package("bad", "1");
		std::fs::write(cache.path().join(&bad.filename), b"tampered").unwrap();

		let absent = test_package("absent", "1");

		let dl = Downloader::new(Fetcher::with_retries(0).unwrap());
		let mismatches = dl
			.verify_cache(&[good, bad.clone(), absent], cache.path())
			.unwrap();
		assert_eq!(mismatches, vec![bad.filename]);
	}
}
