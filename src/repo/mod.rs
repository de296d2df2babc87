//! Repository metadata model shared by the RPM and DEB pipelines.

pub mod deb;
pub mod fetch;
pub mod rpm;

use std::path::PathBuf;

use color_eyre::Result;
use indexmap::IndexMap;
use serde_derive::{Deserialize, Serialize};

use crate::error::ComposerError;

#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PkgType {
	Rpm,
	Deb,
}

fn _default_enabled() -> bool {
	true
}

/// One package repository a provider draws from. The provider owns an
/// ordered sequence of these; index 0 is the primary and wins resolver ties.
#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct RepoConfig {
	pub name: String,
	#[serde(default)]
	pub section: String,
	pub base_url: String,
	/// Metadata index location, when it differs from the convention.
	#[serde(default)]
	pub package_list_url: Option<String>,
	/// Download base for package payloads; defaults to `base_url`.
	#[serde(default)]
	pub package_prefix_url: Option<String>,
	#[serde(default)]
	pub gpg_key_url: Option<String>,
	#[serde(default)]
	pub release_urls: Vec<String>,
	#[serde(default)]
	pub arch: String,
	#[serde(default = "_default_enabled")]
	pub enabled: bool,
	#[serde(default)]
	pub build_path: Option<PathBuf>,
}

impl RepoConfig {
	pub fn prefix_url(&self) -> &str {
		self.package_prefix_url.as_deref().unwrap_or(&self.base_url)
	}

	/// Expand `$basearch`-style variables against the repo's arch.
	pub fn expand_url(&self, url: &str) -> String {
		url.replace("${basearch}", &self.arch).replace("$basearch", &self.arch)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgo {
	Sha256,
	Sha512,
	Md5,
}

impl ChecksumAlgo {
	pub fn parse(name: &str) -> Result<Self> {
		match name.to_ascii_lowercase().as_str() {
			"sha256" | "sha-256" => Ok(Self::Sha256),
			"sha512" | "sha-512" => Ok(Self::Sha512),
			"md5" | "md5sum" => Ok(Self::Md5),
			other => Err(ComposerError::ConfigInvalid(format!(
				"unsupported checksum algorithm: {other}"
			))
			.into()),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
	pub algo: ChecksumAlgo,
	pub digest: String,
}

impl Checksum {
	pub fn new(algo: ChecksumAlgo, digest: impl Into<String>) -> Self {
		Self { algo, digest: digest.into().to_ascii_lowercase() }
	}
}

/// One resolvable, downloadable package. Identity is the filename; the
/// checksum is authoritative for cache hits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageInfo {
	pub name: String,
	pub version: String,
	pub arch: String,
	pub filename: String,
	pub download_url: String,
	pub checksum: Checksum,
	/// Virtual names this package advertises.
	#[serde(default)]
	pub provides: Vec<String>,
	/// Dependency expressions (`name`, `name >= ver`, `a | b`).
	#[serde(default)]
	pub requires: Vec<String>,
	#[serde(default)]
	pub conflicts: Vec<String>,
	/// Position of the owning repo in the provider's ordered list.
	#[serde(default)]
	pub repo_index: usize,
}

/// The indexed union of every configured repository's package records.
#[derive(Debug, Default)]
pub struct Catalog {
	packages: Vec<PackageInfo>,
	by_name: IndexMap<String, Vec<usize>>,
	by_provide: IndexMap<String, Vec<usize>>,
}

impl Catalog {
	pub fn index(packages: Vec<PackageInfo>) -> Self {
		let mut catalog = Self { packages, ..Self::default() };
		for (idx, pkg) in catalog.packages.iter().enumerate() {
			catalog.by_name.entry(pkg.name.clone()).or_default().push(idx);
			for provide in &pkg.provides {
				catalog.by_provide.entry(provide.clone()).or_default().push(idx);
				// `libc = 2.38` and `libc.so.6(GLIBC_2.34)(64bit)` both index
				// under their bare name so dependency expressions can match.
				let base = provide
					.split_whitespace()
					.next()
					.and_then(|t| t.split('(').next())
					.unwrap_or_default();
				if !base.is_empty() && base != provide {
					catalog.by_provide.entry(base.to_owned()).or_default().push(idx);
				}
			}
		}
		catalog
	}

	pub fn len(&self) -> usize {
		self.packages.len()
	}

	pub fn is_empty(&self) -> bool {
		self.packages.is_empty()
	}

	pub fn get(&self, idx: usize) -> &PackageInfo {
		&self.packages[idx]
	}

	pub fn named(&self, name: &str) -> &[usize] {
		self.by_name.get(name).map_or(&[], Vec::as_slice)
	}

	pub fn providers_of(&self, name: &str) -> &[usize] {
		self.by_provide.get(name).map_or(&[], Vec::as_slice)
	}

	/// Names whose leading segment matches `prefix-` (versioned name
	/// families such as `libfoo-1`).
	pub fn named_with_prefix(&self, prefix: &str) -> Vec<usize> {
		let needle = format!("{prefix}-");
		self.by_name
			.iter()
			.filter(|(name, _)| {
				name.strip_prefix(&needle)
					.and_then(|rest| rest.chars().next())
					.is_some_and(|c| c.is_ascii_digit())
			})
			.flat_map(|(_, idxs)| idxs.iter().copied())
			.collect()
	}

	pub fn iter(&self) -> impl Iterator<Item = &PackageInfo> {
		self.packages.iter()
	}
}

#[cfg(test)]
pub(crate) fn test_package(name: &str, version: &str) -> PackageInfo {
	PackageInfo {
		name: name.to_owned(),
		version: version.to_owned(),
		arch: "x86_64".to_owned(),
		filename: format!("{name}-{version}.x86_64.rpm"),
		download_url: format!("https://repo.invalid/{name}-{version}.x86_64.rpm"),
		checksum: Checksum::new(ChecksumAlgo::Sha256, "0".repeat(64)),
		provides: vec![],
		requires: vec![],
		conflicts: vec![],
		repo_index: 0,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn catalog_indexes_names_and_provides() {
		let mut glibc = test_package("glibc", "2.38");
		glibc.provides = vec!["libc".to_owned(), "libc.so.6(GLIBC_2.34)(64bit)".to_owned()];
		let catalog = Catalog::index(vec![glibc, test_package("bash", "5.2")]);

		assert_eq!(catalog.named("bash").len(), 1);
		assert_eq!(catalog.providers_of("libc").len(), 1);
		assert_eq!(catalog.providers_of("libc.so.6").len(), 1);
	}

	#[test]
	fn prefix_lookup_requires_version_segment() {
		let catalog = Catalog::index(vec![
			test_package("libfoo-1", "1.9"),
			test_package("libfoo-devel", "1.9"),
		]);
		let hits = catalog.named_with_prefix("libfoo");
		assert_eq!(hits.len(), 1);
		assert_eq!(catalog.get(hits[0]).name, "libfoo-1");
	}

	#[test]
	fn repo_url_expansion() {
		let repo = RepoConfig {
			name: "base".to_owned(),
			section: String::new(),
			base_url: "https://repo.invalid/$basearch/base".to_owned(),
			package_list_url: None,
			package_prefix_url: None,
			gpg_key_url: None,
			release_urls: vec![],
			arch: "x86_64".to_owned(),
			enabled: true,
			build_path: None,
		};
		assert_eq!(repo.expand_url(&repo.base_url), "https://repo.invalid/x86_64/base");
	}
}
