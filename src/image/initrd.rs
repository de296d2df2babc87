//! Initrd maker: installs the initramfs package set into a scratch rootfs,
//! extracts the kernel, and packs the rootfs as a gzip-compressed newc cpio.
//!
//! Idempotent: an existing kernel + initrd pair in the build directory is
//! reused as-is.

use std::path::{Path, PathBuf};

use color_eyre::{eyre::bail, Result};
use serde_derive::Deserialize;
use tracing::{debug, info, warn};

use super::{BuildContext, ImageMaker};
use crate::config::SystemConfig;
use crate::executor::Invocation;
use crate::util::{copy_file, read_yaml};

const INITRD_ROOTFS: &str = "workspace/imagebuild/initrd-rootfs";

/// Outputs of one initrd build, consumed by the ISO maker.
#[derive(Debug, Clone)]
pub struct InitrdArtifacts {
	pub rootfs: PathBuf,
	pub kernel: PathBuf,
	pub initrd: PathBuf,
	pub version: String,
}

/// Sub-template carrying the initramfs package set.
#[derive(Deserialize, Debug)]
struct InitrdTemplate {
	system: SystemConfig,
}

pub struct InitrdMaker;

impl ImageMaker for InitrdMaker {
	fn build(&self, ctx: &BuildContext<'_>) -> Result<()> {
		self.make(ctx).map(|_| ())
	}
}

impl InitrdMaker {
	/// Version encoded in an existing `{image}-{version}.img` artifact.
	pub fn initrd_version(build_dir: &Path, image_name: &str) -> Option<String> {
		let prefix = format!("{image_name}-");
		let entries = std::fs::read_dir(build_dir).ok()?;
		entries
			.filter_map(std::result::Result::ok)
			.filter_map(|e| e.file_name().into_string().ok())
			.find_map(|name| {
				name.strip_prefix(&prefix)?.strip_suffix(".img").map(ToOwned::to_owned)
			})
	}

	fn existing_artifacts(&self, ctx: &BuildContext<'_>) -> Option<InitrdArtifacts> {
		let version = Self::initrd_version(&ctx.build_dir, &ctx.template.name)?;
		let kernel = ctx.build_dir.join(format!("vmlinuz-{version}"));
		if !kernel.exists() {
			return None;
		}
		Some(InitrdArtifacts {
			rootfs: ctx.chroot.host_path(INITRD_ROOTFS),
			kernel,
			initrd: ctx.build_dir.join(format!("{}-{version}.img", ctx.template.name)),
			version,
		})
	}

	pub fn make(&self, ctx: &BuildContext<'_>) -> Result<InitrdArtifacts> {
		if let Some(existing) = self.existing_artifacts(ctx) {
			info!(version = existing.version.as_str(), "initrd artifacts present, skipping rebuild");
			return Ok(existing);
		}

		std::fs::create_dir_all(&ctx.build_dir)?;
		let rootfs = ctx.chroot.host_path(INITRD_ROOTFS);
		std::fs::create_dir_all(&rootfs)?;

		let packages = self.initrd_packages(ctx)?;
		info!(count = packages.len(), "installing initramfs package set");
		ctx.chroot.install_packages_into(&packages, &Path::new("/").join(INITRD_ROOTFS))?;

		// kernel comes out of the rootfs, named by the image version
		let kernel_src = find_kernel(&rootfs)?;
		let version = ctx.template.version.clone();
		let kernel = ctx.build_dir.join(format!("vmlinuz-{version}"));
		copy_file(&kernel_src, &kernel)?;

		self.install_boot_script(ctx, &rootfs)?;

		// the package manager may have bind-mounted the cache repo inside
		// the install root; a plain directory detaches silently
		ctx.chroot.mounts().detach(&rootfs.join("cdrom/cache-repo"))?;

		let initrd = ctx.build_dir.join(format!("{}-{version}.img", ctx.template.name));
		info!(?initrd, "packing initrd (cpio newc + gzip)");
		ctx.exec.run(
			&Invocation::new(format!(
				"find . | cpio -o -H newc | gzip > {}",
				initrd.display()
			))
			.elevated()
			.workdir(&rootfs),
		)?;

		Ok(InitrdArtifacts { rootfs, kernel, initrd, version })
	}

	fn initrd_packages(&self, ctx: &BuildContext<'_>) -> Result<Vec<String>> {
		match &ctx.template.system.initramfs_template {
			Some(path) => {
				debug!(?path, "loading initramfs sub-template");
				let sub: InitrdTemplate = read_yaml(path)?;
				Ok(sub.system.packages)
			},
			None => Ok(ctx.packages.clone()),
		}
	}

	fn install_boot_script(&self, ctx: &BuildContext<'_>, rootfs: &Path) -> Result<()> {
		let rc_local = ctx.general_config_dir.join("rc.local");
		if rc_local.exists() {
			copy_file(&rc_local, &rootfs.join("etc/rc.d/rc.local"))?;
		} else {
			warn!(?rc_local, "no rc.local in general config, skipping boot script");
		}
		Ok(())
	}
}

/// Locate `boot/vmlinuz-*` inside a populated rootfs.
fn find_kernel(rootfs: &Path) -> Result<PathBuf> {
	let boot = rootfs.join("boot");
	for entry in std::fs::read_dir(&boot)? {
		let entry = entry?;
		let name = entry.file_name();
		let name = name.to_string_lossy();
		if name.starts_with("vmlinuz-") && !name.contains("-rescue-") {
			return Ok(entry.path());
		}
	}
	bail!("no vmlinuz-* in {}", boot.display())
}
