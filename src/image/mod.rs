//! Image makers: provider-specific flows that consume the chroot and the
//! package cache to emit the final artifact.

pub mod initrd;
pub mod iso;
pub mod raw;

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::Result;

use crate::chroot::ChrootEnv;
use crate::config::{ImageTemplate, ImageType};
use crate::executor::Executor;

/// Everything an image maker needs for one build.
pub struct BuildContext<'a> {
	pub template: &'a ImageTemplate,
	pub chroot: &'a ChrootEnv,
	pub exec: Arc<dyn Executor>,
	/// Per-build output directory (`imagebuild/{system}`).
	pub build_dir: PathBuf,
	/// Provider general config (boot scripts, shared assets).
	pub general_config_dir: PathBuf,
	/// Per-OS-version config directory.
	pub osv_config_dir: PathBuf,
	/// Resolved package names to install into the image.
	pub packages: Vec<String>,
}

impl BuildContext<'_> {
	pub fn artifact_path(&self) -> PathBuf {
		self.build_dir.join(self.template.artifact_name())
	}
}

pub trait ImageMaker {
	fn build(&self, ctx: &BuildContext<'_>) -> Result<()>;
}

pub fn maker_for(image_type: ImageType) -> Box<dyn ImageMaker> {
	match image_type {
		ImageType::Raw => Box::new(raw::RawImageMaker),
		ImageType::Img => Box::new(initrd::InitrdMaker),
		ImageType::Iso => Box::new(iso::IsoMaker),
	}
}
