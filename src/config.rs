//! Build configuration: the user-facing image template plus the per-target-OS
//! descriptors shipped in the provider config directory.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use bytesize::ByteSize;
use color_eyre::Result;
use indexmap::IndexMap;
use serde_derive::{Deserialize, Serialize};
use tracing::trace;

use crate::error::ComposerError;
use crate::repo::{PkgType, RepoConfig};
use crate::util::read_yaml;

pub const MIB: u64 = 1024 * 1024;

#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
	Raw,
	Img,
	Iso,
}

impl ImageType {
	pub fn extension(self) -> &'static str {
		match self {
			Self::Raw => "raw",
			Self::Img => "img",
			Self::Iso => "iso",
		}
	}
}

impl FromStr for ImageType {
	type Err = String;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"raw" => Ok(Self::Raw),
			"img" => Ok(Self::Img),
			"iso" => Ok(Self::Iso),
			_ => Err(format!("{s} is not a valid image type")),
		}
	}
}

/// The build target triple plus artifact kind.
#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct TargetSpec {
	pub os: String,
	pub dist: String,
	pub arch: String,
	pub image_type: ImageType,
}

impl TargetSpec {
	/// Identifier used in registry keys and on-disk paths.
	pub fn provider_id(&self) -> String {
		format!("{}-{}-{}", self.os, self.dist, self.arch)
	}
}

/// A host file to place into the image.
#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileMapping {
	pub local: String,
	pub image: String,
}

#[derive(Deserialize, Debug, Clone, Serialize, Default)]
pub struct SystemConfig {
	pub name: String,
	#[serde(default)]
	pub packages: Vec<String>,
	/// Sub-template describing the initramfs package set.
	#[serde(default)]
	pub initramfs_template: Option<PathBuf>,
	#[serde(default)]
	pub additional_files: Vec<FileMapping>,
}

/// GPT partition type, a subset of the discoverable partitions spec.
#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
	Root,
	Esp,
	Xbootldr,
	Swap,
	LinuxGeneric,
	#[serde(untagged)]
	Guid(uuid::Uuid),
}

impl PartitionType {
	/// GPT partition type GUID for the target architecture.
	pub fn uuid(&self, target_arch: &str) -> String {
		match self {
			Self::Root => match target_arch {
				"aarch64" => "b921b045-1df0-41c3-af44-4c6f280d3fae",
				_ => "4f68bce3-e8cd-4db1-96e7-fbcaf984b709",
			},
			Self::Esp => "c12a7328-f81f-11d2-ba4b-00a0c93ec93b",
			Self::Xbootldr => "bc13c2ff-59e6-4262-a352-b275fd6f7172",
			Self::Swap => "0657fd6d-a4ab-43c4-84e5-0933c84b4f4f",
			Self::LinuxGeneric => "0fc63daf-8483-4772-8e79-3d69d8477de4",
			Self::Guid(guid) => return guid.to_string(),
		}
		.to_owned()
	}
}

/// One partition of the raw-image layout. Offsets are stored in bytes;
/// conversion to MiB happens at the partitioning-tool boundary.
#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct PartitionInfo {
	pub id: String,
	pub name: String,
	pub fs_type: String,
	pub start: ByteSize,
	pub size: ByteSize,
	#[serde(rename = "type")]
	pub type_guid: PartitionType,
}

impl PartitionInfo {
	pub fn start_mib(&self) -> u64 {
		self.start.as_u64() / MIB
	}

	pub fn end_mib(&self) -> u64 {
		(self.start.as_u64() + self.size.as_u64()).div_ceil(MIB)
	}

	pub fn end_bytes(&self) -> u64 {
		self.start.as_u64() + self.size.as_u64()
	}
}

#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct PartitionTable {
	pub max_size: ByteSize,
	pub partitions: Vec<PartitionInfo>,
}

impl PartitionTable {
	/// Partitions must be non-overlapping and fit inside `max_size`.
	pub fn validate(&self) -> Result<()> {
		let mut sorted: Vec<_> = self.partitions.iter().collect();
		sorted.sort_by_key(|p| p.start.as_u64());
		let mut prev_end = 0u64;
		for part in sorted {
			if part.start.as_u64() < prev_end {
				return Err(ComposerError::ConfigInvalid(format!(
					"partition `{}` overlaps the previous partition",
					part.id
				))
				.into());
			}
			prev_end = part.end_bytes();
		}
		if prev_end > self.max_size.as_u64() {
			return Err(ComposerError::ConfigInvalid(format!(
				"partition layout ends at {prev_end} bytes, beyond the declared image size {}",
				self.max_size
			))
			.into());
		}
		Ok(())
	}

	/// Partition carrying the root filesystem.
	pub fn root(&self) -> Option<&PartitionInfo> {
		self.partitions.iter().find(|p| p.type_guid == PartitionType::Root || p.name == "root")
	}
}

/// The user-facing build descriptor.
#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct ImageTemplate {
	pub name: String,
	pub version: String,
	pub target: TargetSpec,
	pub system: SystemConfig,
	#[serde(default)]
	pub disk: Option<PartitionTable>,
	/// User-supplied repositories, appended after the provider's own.
	#[serde(default)]
	pub extra_repos: Vec<RepoConfig>,
}

impl ImageTemplate {
	pub fn load(path: &Path) -> Result<Self> {
		trace!(?path, "loading image template");
		let template: Self = read_yaml(path)?;
		if let Some(disk) = &template.disk {
			disk.validate()?;
		}
		Ok(template)
	}

	pub fn artifact_name(&self) -> String {
		format!("{}-{}.{}", self.name, self.version, self.target.image_type.extension())
	}
}

/// Per-architecture entry of a target OS descriptor (`config.yml`).
#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct OsArchConfig {
	pub pkg_type: PkgType,
	pub chrootenv_config_file: String,
	/// Distribution codenames this entry can build.
	#[serde(default)]
	pub dists: Vec<String>,
	#[serde(default)]
	pub repos: Vec<RepoConfig>,
}

/// Target OS descriptor: a map keyed by architecture.
#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct OsConfig {
	#[serde(flatten)]
	pub arches: IndexMap<String, OsArchConfig>,
}

impl OsConfig {
	pub fn load(config_dir: &Path) -> Result<Self> {
		read_yaml(&config_dir.join("config.yml"))
	}

	pub fn arch(&self, arch: &str) -> Result<&OsArchConfig> {
		self.arches.get(arch).ok_or_else(|| {
			ComposerError::ConfigInvalid(format!("no configuration for architecture {arch}"))
				.into()
		})
	}
}

/// Chroot bootstrap package lists (`chrootenvconfigs/chrootenv_{arch}.yml`).
#[derive(Deserialize, Debug, Clone, Serialize, Default)]
pub struct ChrootEnvConfig {
	/// Minimal set required for the chroot's own package manager to run.
	#[serde(default)]
	pub essential: Vec<String>,
	#[serde(default)]
	pub packages: Vec<String>,
}

impl ChrootEnvConfig {
	pub fn load(config_dir: &Path, file: &str) -> Result<Self> {
		read_yaml(&config_dir.join("chrootenvconfigs").join(file))
	}
}
