//! Raw disk image maker: sparse file → loop device → GPT → mkfs → package
//! install → post-install configuration → detach.

use std::path::{Path, PathBuf};

use color_eyre::{eyre::bail, Result};
use tracing::{debug, info, trace, warn};

use super::{BuildContext, ImageMaker};
use crate::config::{PartitionInfo, PartitionTable};
use crate::executor::Invocation;
use crate::util::{copy_file, create_sparse, just_write};

const INSTALL_ROOT: &str = "workspace/imagebuild/rootfs";
const LOOP_RELEASE_ATTEMPTS: u32 = 25;

/// Partition /dev name, accounting for mmcblk/nvme/loop `p` separators.
pub fn partition_name(disk: &str, partition: usize) -> String {
	format!(
		"{disk}{}{partition}",
		if disk.starts_with("/dev/mmcblk")
			|| disk.starts_with("/dev/nvme")
			|| disk.starts_with("/dev/loop")
		{
			"p"
		} else {
			""
		}
	)
}

/// Mountpoint convention for the raw layout, derived from partition names.
fn mountpoint_of(part: &PartitionInfo) -> String {
	match part.name.as_str() {
		"root" | "rootfs" => "/".to_owned(),
		"boot" => "/boot".to_owned(),
		"esp" | "efi" => "/boot/efi".to_owned(),
		other => format!("/{other}"),
	}
}

pub struct RawImageMaker;

impl ImageMaker for RawImageMaker {
	fn build(&self, ctx: &BuildContext<'_>) -> Result<()> {
		let Some(disk) = &ctx.template.disk else {
			bail!("raw image build requires a partition table in the template");
		};
		disk.validate()?;

		std::fs::create_dir_all(&ctx.build_dir)?;
		let artifact = ctx.artifact_path();
		info!(?artifact, "creating raw disk image");
		create_sparse(&artifact, disk.max_size.as_u64())?;

		let loopdev = attach_loop(ctx, &artifact)?;
		let result = build_on_loop(ctx, disk, &loopdev);

		// the loop device goes away on every path
		let detached = detach_loop(ctx, &loopdev);
		result.and(detached)?;

		just_write(
			format!("{}.version", artifact.display()),
			format!("{}\n", ctx.template.version),
		)?;
		Ok(())
	}
}

fn attach_loop(ctx: &BuildContext<'_>, artifact: &Path) -> Result<String> {
	let out = ctx
		.exec
		.run(&Invocation::new(format!("losetup --show -fP {}", artifact.display())).elevated())?;
	let loopdev = out.stdout.trim().to_owned();
	if loopdev.is_empty() {
		bail!("losetup returned no device for {}", artifact.display());
	}
	debug!(loopdev = loopdev.as_str(), "attached loop device");
	Ok(loopdev)
}

fn build_on_loop(ctx: &BuildContext<'_>, disk: &PartitionTable, loopdev: &str) -> Result<()> {
	partition(ctx, disk, loopdev)?;
	format_partitions(ctx, disk, loopdev)?;

	let install_root = ctx.chroot.host_path(INSTALL_ROOT);
	let mounted = mount_partitions(ctx, disk, loopdev, &install_root)?;
	let install = (|| -> Result<()> {
		let chroot_install_root = Path::new("/").join(INSTALL_ROOT);
		ctx.chroot.install_packages_into(&ctx.packages, &chroot_install_root)?;
		post_install(ctx, disk, loopdev, &install_root)
	})();

	// unmount in reverse regardless of install outcome
	for mountpoint in mounted.iter().rev() {
		if let Err(e) = ctx.chroot.mounts().detach(mountpoint) {
			warn!(?mountpoint, err = %e, "unmount failed during raw image teardown");
		}
	}
	install
}

fn partition(ctx: &BuildContext<'_>, disk: &PartitionTable, loopdev: &str) -> Result<()> {
	let arch = &ctx.template.target.arch;
	debug!(loopdev, "labelling disk GPT");
	ctx.exec.run(&Invocation::new(format!("parted -s {loopdev} mklabel gpt")).elevated())?;

	for (i, part) in disk.partitions.iter().enumerate() {
		let index = i + 1;
		// byte offsets convert to MiB at the partitioning-tool boundary
		let (start, end) = (part.start_mib(), part.end_mib());
		trace!(id = part.id.as_str(), start, end, "creating partition");
		ctx.exec.run(
			&Invocation::new(format!(
				"parted -s {loopdev} mkpart {} {start}MiB {end}MiB",
				part.name
			))
			.elevated(),
		)?;
		ctx.exec.run(
			&Invocation::new(format!(
				"sgdisk --typecode={index}:{} {loopdev}",
				part.type_guid.uuid(arch)
			))
			.elevated(),
		)?;
	}
	let _ = ctx.exec.run(&Invocation::new(format!("partprobe {loopdev}")).elevated());
	Ok(())
}

fn format_partitions(ctx: &BuildContext<'_>, disk: &PartitionTable, loopdev: &str) -> Result<()> {
	for (i, part) in disk.partitions.iter().enumerate() {
		let devname = partition_name(loopdev, i + 1);
		let cmdline = match part.fs_type.as_str() {
			"fat32" | "vfat" | "efi" => format!("mkfs.fat -F32 {devname}"),
			"swap" => format!("mkswap {devname}"),
			fs => format!("mkfs.{fs} {devname}"),
		};
		debug!(devname = devname.as_str(), fs = part.fs_type.as_str(), "formatting");
		ctx.exec.run(&Invocation::new(cmdline).elevated())?;
	}
	Ok(())
}

/// Mount partitions under the install root, least-nested mountpoint first.
/// Returns the mounted host paths in mount order.
fn mount_partitions(
	ctx: &BuildContext<'_>, disk: &PartitionTable, loopdev: &str, install_root: &Path,
) -> Result<Vec<PathBuf>> {
	let mut ordered: Vec<(usize, &PartitionInfo)> = disk.partitions.iter().enumerate().collect();
	ordered.sort_by_key(|(_, p)| {
		let mp = mountpoint_of(p);
		(mp.matches('/').count(), mp)
	});

	let mut mounted = Vec::new();
	for (i, part) in ordered {
		if part.fs_type == "swap" {
			continue;
		}
		let devname = partition_name(loopdev, i + 1);
		let mp = mountpoint_of(part);
		let target = install_root.join(mp.trim_start_matches('/'));
		ctx.chroot.mounts().attach(&devname, &target, &[])?;
		mounted.push(target);
	}
	Ok(mounted)
}

fn post_install(
	ctx: &BuildContext<'_>, disk: &PartitionTable, loopdev: &str, install_root: &Path,
) -> Result<()> {
	write_fstab(ctx, disk, loopdev, install_root)?;

	// identity files
	just_write(install_root.join("etc/hostname"), format!("{}\n", ctx.template.name))?;
	just_write(
		install_root.join("etc/image-release"),
		format!("IMAGE_NAME={}\nIMAGE_VERSION={}\n", ctx.template.name, ctx.template.version),
	)?;

	for mapping in &ctx.template.system.additional_files {
		let dest = install_root.join(mapping.image.trim_start_matches('/'));
		copy_file(Path::new(&mapping.local), &dest)?;
	}

	// bootloader stub; a non-zero exit here is survivable and common
	let install_root_chroot = ctx.chroot.chroot_path(install_root)?;
	let res = ctx.exec.run_stream(
		&Invocation::new(format!(
			"chroot {} grub2-mkconfig -o /boot/grub2/grub.cfg",
			install_root_chroot.display()
		))
		.elevated()
		.in_chroot(ctx.chroot.root()),
	);
	if let Err(e) = res {
		warn!(err = %e, "grub2-mkconfig failed, continuing");
	}
	Ok(())
}

fn write_fstab(
	ctx: &BuildContext<'_>, disk: &PartitionTable, loopdev: &str, install_root: &Path,
) -> Result<()> {
	let mut fstab = String::from("# /etc/fstab: static file system information.\n");
	for (i, part) in disk.partitions.iter().enumerate() {
		if part.fs_type == "swap" {
			continue;
		}
		let devname = partition_name(loopdev, i + 1);
		let uuid = ctx
			.exec
			.run(&Invocation::new(format!("blkid -s UUID -o value {devname}")).elevated())?
			.stdout
			.trim()
			.to_owned();
		let mp = mountpoint_of(part);
		let fsname = if part.fs_type == "efi" { "vfat" } else { &part.fs_type };
		let fsck = if mp == "/" { 1 } else { 2 };
		fstab.push_str(&format!("UUID={uuid}\t{mp}\t{fsname}\tdefaults\t0\t{fsck}\n"));
	}
	just_write(install_root.join("etc/fstab"), fstab)
}

fn detach_loop(ctx: &BuildContext<'_>, loopdev: &str) -> Result<()> {
	ctx.exec.run(&Invocation::new(format!("losetup -d {loopdev}")).elevated())?;
	// wait for the kernel to actually release the device
	for _ in 0..LOOP_RELEASE_ATTEMPTS {
		match ctx.exec.run(&Invocation::new(format!("losetup {loopdev}"))) {
			Err(_) => return Ok(()),
			Ok(out) if out.stdout.trim().is_empty() => return Ok(()),
			Ok(_) => std::thread::sleep(std::time::Duration::from_millis(200)),
		}
	}
	warn!(loopdev, "loop device still attached after detach wait");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn partition_device_names() {
		assert_eq!(partition_name("/dev/loop0", 2), "/dev/loop0p2");
		assert_eq!(partition_name("/dev/nvme0n1", 1), "/dev/nvme0n1p1");
		assert_eq!(partition_name("/dev/sda", 3), "/dev/sda3");
	}

	#[test]
	fn mountpoints_follow_name_convention() {
		use crate::config::{PartitionType, MIB};
		use bytesize::ByteSize;
		let part = |name: &str, fs: &str| PartitionInfo {
			id: name.to_owned(),
			name: name.to_owned(),
			fs_type: fs.to_owned(),
			start: ByteSize::b(MIB),
			size: ByteSize::b(MIB),
			type_guid: PartitionType::LinuxGeneric,
		};
		assert_eq!(mountpoint_of(&part("root", "ext4")), "/");
		assert_eq!(mountpoint_of(&part("esp", "efi")), "/boot/efi");
		assert_eq!(mountpoint_of(&part("home", "ext4")), "/home");
	}
}
