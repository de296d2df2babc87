//! ISO maker: lays out the boot tree, builds the EFI FAT image (and the BIOS
//! eltorito image on x86), and masters a hybrid or UEFI-only ISO with
//! xorriso.

use std::path::{Path, PathBuf};

use color_eyre::Result;
use tracing::{debug, info, trace, warn};

use super::initrd::InitrdMaker;
use super::{BuildContext, ImageMaker};
use crate::executor::Invocation;
use crate::util::{copy_file, copy_tree, create_sparse, just_write, substitute};

const VOLID: &str = "OIC_CDROM";
const EFI_IMG_REL: &str = "boot/grub/efi.img";
const ELTORITO_REL: &str = "boot/grub/i386-pc/eltorito.img";
const EFI_IMG_SIZE: u64 = 16 * 1024 * 1024;
const GRUB_EFI_MODULES: &str = "part_gpt part_msdos fat ext2 ntfs search iso9660";
const GRUB_BIOS_MODULES: &str = "biosdisk iso9660";

const GRUB_CFG_TEMPLATE: &str = include_str!("../../templates/grub.cfg.tera");

fn is_hybrid(arch: &str) -> bool {
	matches!(arch, "x86_64" | "i386" | "i686")
}

pub struct IsoMaker;

impl ImageMaker for IsoMaker {
	fn build(&self, ctx: &BuildContext<'_>) -> Result<()> {
		std::fs::create_dir_all(&ctx.build_dir)?;
		let install_root = ctx.build_dir.join("isoroot");
		if install_root.exists() {
			// ISO mastering is not idempotent; rebuild the tree from scratch
			std::fs::remove_dir_all(&install_root)?;
		}
		for dir in ["boot", "EFI/BOOT", "images"] {
			std::fs::create_dir_all(install_root.join(dir))?;
		}

		embed_raw_image(ctx, &install_root)?;

		let artifacts = InitrdMaker.make(ctx)?;
		info!(version = artifacts.version.as_str(), "laying out ISO tree");
		copy_file(&artifacts.kernel, &install_root.join("images/vmlinuz"))?;
		copy_file(&artifacts.initrd, &install_root.join("images/initrd.img"))?;

		copy_configs(ctx, &install_root)?;
		write_grub_config(ctx, &install_root)?;
		copy_grub_assets(&artifacts.rootfs, &install_root)?;

		build_efi_image(ctx, &install_root)?;
		let arch = ctx.template.target.arch.as_str();
		let mbr = if is_hybrid(arch) {
			build_bios_image(ctx, &install_root)?;
			Some(locate_hybrid_mbr(ctx, &artifacts.rootfs)?)
		} else {
			None
		};

		master_iso(ctx, &install_root, mbr.as_deref())?;

		std::fs::remove_dir_all(&install_root)?;
		Ok(())
	}
}

/// A raw image built earlier into the same imagebuild directory ships on the
/// medium under `images/`.
fn embed_raw_image(ctx: &BuildContext<'_>, install_root: &Path) -> Result<()> {
	for entry in std::fs::read_dir(&ctx.build_dir)? {
		let entry = entry?;
		let name = entry.file_name();
		let name = name.to_string_lossy();
		if name.ends_with(".raw") {
			debug!(file = name.as_ref(), "embedding raw image");
			copy_file(&entry.path(), &install_root.join("images").join(name.as_ref()))?;
		}
	}
	Ok(())
}

/// Copy the general and per-OS-version config trees onto the medium and dump
/// the template with host paths rewritten to ISO-relative ones, so the
/// installer on the booted medium can re-locate its resources.
fn copy_configs(ctx: &BuildContext<'_>, install_root: &Path) -> Result<()> {
	if ctx.general_config_dir.exists() {
		copy_tree(&ctx.general_config_dir, &install_root.join("config/general"))?;
	}
	let osv_dest = install_root
		.join("config/osv")
		.join(&ctx.template.target.os)
		.join(&ctx.template.target.dist);
	if ctx.osv_config_dir.exists() {
		copy_tree(&ctx.osv_config_dir, &osv_dest)?;
	} else {
		std::fs::create_dir_all(&osv_dest)?;
	}

	let mut dump = ctx.template.clone();
	for mapping in &mut dump.system.additional_files {
		let local = PathBuf::from(&mapping.local);
		let Some(basename) = local.file_name().map(|n| n.to_string_lossy().into_owned())
		else {
			continue;
		};
		let src = Path::new(&mapping.local);
		if src.exists() {
			copy_file(src, &install_root.join("additionalfiles").join(&basename))?;
		} else {
			warn!(local = mapping.local.as_str(), "additional file missing on host");
		}
		// rewritten before serialization so the installer resolves it
		// relative to the config directory on the medium
		mapping.local = format!("../additionalfiles/{basename}");
	}
	just_write(osv_dest.join("template-dump.yaml"), serde_yaml::to_string(&dump)?)?;
	Ok(())
}

fn write_grub_config(ctx: &BuildContext<'_>, install_root: &Path) -> Result<()> {
	let rendered = substitute(
		GRUB_CFG_TEMPLATE,
		&[
			("image_name", ctx.template.name.as_str()),
			("version", ctx.template.version.as_str()),
			("volid", VOLID),
		],
	)?;
	just_write(install_root.join("boot/grub/grub.cfg"), &rendered)?;
	just_write(install_root.join("EFI/BOOT/grub.cfg"), &rendered)?;
	Ok(())
}

/// GRUB locale catalogs and the unicode font, taken from the initrd rootfs
/// when it carries them.
fn copy_grub_assets(rootfs: &Path, install_root: &Path) -> Result<()> {
	let locale_dir = rootfs.join("usr/share/locale");
	if locale_dir.exists() {
		for entry in walkdir::WalkDir::new(&locale_dir)
			.into_iter()
			.filter_map(std::result::Result::ok)
		{
			if entry.file_name() != "grub.mo" {
				continue;
			}
			// …/locale/{lang}/LC_MESSAGES/grub.mo
			let Some(lang) = entry
				.path()
				.parent()
				.and_then(Path::parent)
				.and_then(Path::file_name)
			else {
				continue;
			};
			let dest = install_root
				.join("boot/grub/locale")
				.join(format!("{}.mo", lang.to_string_lossy()));
			copy_file(entry.path(), &dest)?;
		}
	}

	let font = rootfs.join("usr/share/grub/unicode.pf2");
	if font.exists() {
		copy_file(&font, &install_root.join("boot/grub/fonts/unicode.pf2"))?;
	}
	Ok(())
}

/// Build the FAT image UEFI firmware mounts to load the bootloader.
fn build_efi_image(ctx: &BuildContext<'_>, install_root: &Path) -> Result<()> {
	let efi_img = install_root.join(EFI_IMG_REL);
	create_sparse(&efi_img, EFI_IMG_SIZE)?;
	ctx.exec.run(&Invocation::new(format!("mformat -i {} ::", efi_img.display())))?;

	let (mkimage_target, efi_name) = match ctx.template.target.arch.as_str() {
		"aarch64" => ("arm64-efi", "BOOTAA64.EFI"),
		_ => ("x86_64-efi", "BOOTX64.EFI"),
	};
	let efi_binary = ctx.build_dir.join(efi_name);
	ctx.exec.run(&Invocation::new(format!(
		"grub-mkimage -O {mkimage_target} -o {} -p /EFI/BOOT {GRUB_EFI_MODULES}",
		efi_binary.display()
	)))?;

	ctx.exec
		.run(&Invocation::new(format!("mmd -i {} ::/EFI ::/EFI/BOOT", efi_img.display())))?;
	ctx.exec.run(&Invocation::new(format!(
		"mcopy -i {} {} ::/EFI/BOOT/{efi_name}",
		efi_img.display(),
		efi_binary.display()
	)))?;
	ctx.exec.run(&Invocation::new(format!(
		"mcopy -i {} {} ::/EFI/BOOT/grub.cfg",
		efi_img.display(),
		install_root.join("EFI/BOOT/grub.cfg").display()
	)))?;
	Ok(())
}

/// BIOS El Torito boot image, x86 only.
fn build_bios_image(ctx: &BuildContext<'_>, install_root: &Path) -> Result<()> {
	let eltorito = install_root.join(ELTORITO_REL);
	if let Some(parent) = eltorito.parent() {
		std::fs::create_dir_all(parent)?;
	}
	ctx.exec.run(&Invocation::new(format!(
		"grub-mkimage -O i386-pc-eltorito -o {} -p /boot/grub {GRUB_BIOS_MODULES}",
		eltorito.display()
	)))?;
	Ok(())
}

/// The MBR template xorriso embeds for BIOS hybrid boot.
fn locate_hybrid_mbr(ctx: &BuildContext<'_>, rootfs: &Path) -> Result<String> {
	let dest = ctx.build_dir.join("boot_hybrid.img");
	let src = rootfs.join("usr/lib/grub/i386-pc/boot_hybrid.img");
	if src.exists() {
		copy_file(&src, &dest)?;
	} else {
		warn!(?src, "boot_hybrid.img not found in rootfs");
	}
	Ok(dest.display().to_string())
}

fn master_iso(ctx: &BuildContext<'_>, install_root: &Path, mbr: Option<&str>) -> Result<()> {
	let iso_path = ctx.artifact_path();
	let efi_img_abs = install_root.join(EFI_IMG_REL);

	let mut cmdline = String::from("xorriso -as mkisofs -graft-points -r -J -l");
	match mbr {
		Some(mbr) => {
			// hybrid BIOS + UEFI
			cmdline.push_str(&format!(
				" -b {ELTORITO_REL} -no-emul-boot -boot-load-size 4 -boot-info-table \
				 --grub2-boot-info --grub2-mbr {mbr} \
				 -eltorito-alt-boot -e {EFI_IMG_REL} -no-emul-boot \
				 -append_partition 2 0xef {} -appended_part_as_gpt",
				efi_img_abs.display()
			));
		},
		None => {
			cmdline.push_str(&format!(
				" --efi-boot {EFI_IMG_REL} -efi-boot-part --efi-boot-image \
				 --protective-msdos-label"
			));
		},
	}
	cmdline.push_str(&format!(
		" -volid {VOLID} -o {} {}",
		iso_path.display(),
		install_root.display()
	));

	info!(?iso_path, hybrid = mbr.is_some(), "mastering ISO");
	trace!(cmdline = cmdline.as_str(), "xorriso invocation");
	ctx.exec.run_stream(&Invocation::new(cmdline).elevated())?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chroot::ChrootEnv;
	use crate::config::ImageTemplate;
	use crate::executor::{Executor, MockExecutor};
	use crate::util::just_write;
	use std::sync::Arc;

	struct Fixture {
		_dirs: Vec<tempfile::TempDir>,
		template: ImageTemplate,
		chroot: ChrootEnv,
		exec: Arc<MockExecutor>,
		build_dir: PathBuf,
		config_dir: PathBuf,
	}

	fn fixture(arch: &str) -> Fixture {
		let work = tempfile::tempdir().unwrap();
		let config = tempfile::tempdir().unwrap();
		let build_dir = work.path().join("imagebuild/standalone");
		std::fs::create_dir_all(&build_dir).unwrap();

		let template: ImageTemplate = serde_yaml::from_str(&format!(
			r#"
name: myimg
version: 1.2.3
target: {{ os: edge-microvisor-toolkit, dist: "3.0", arch: {arch}, image_type: iso }}
system: {{ name: standalone, packages: [systemd] }}
"#
		))
		.unwrap();

		// pre-built initrd artifacts make the initrd phase a no-op
		just_write(build_dir.join("myimg-1.2.3.img"), "gzip").unwrap();
		just_write(build_dir.join("vmlinuz-1.2.3"), "kernel").unwrap();

		let exec = Arc::new(MockExecutor::new());
		let chroot = ChrootEnv::new(
			work.path().join("chrootenv"),
			work.path().join("chrootbuild"),
			work.path().join("pkgcache"),
			config.path().to_path_buf(),
			crate::repo::PkgType::Rpm,
			"3.0".to_owned(),
			Arc::clone(&exec) as Arc<dyn Executor>,
		);
		Fixture {
			template,
			chroot,
			exec,
			build_dir,
			config_dir: config.path().to_path_buf(),
			_dirs: vec![work, config],
		}
	}

	fn ctx<'a>(f: &'a Fixture) -> BuildContext<'a> {
		BuildContext {
			template: &f.template,
			chroot: &f.chroot,
			exec: Arc::clone(&f.exec) as Arc<dyn Executor>,
			build_dir: f.build_dir.clone(),
			general_config_dir: f.config_dir.join("general"),
			osv_config_dir: f.config_dir.join("osv"),
			packages: vec!["systemd".to_owned()],
		}
	}

	fn xorriso_line(f: &Fixture) -> String {
		let calls = f.exec.calls_matching("xorriso");
		assert_eq!(calls.len(), 1, "expected exactly one xorriso invocation");
		calls[0].clone()
	}

	#[test]
	fn uefi_only_mastering_on_aarch64() {
		// S3: no eltorito, no MBR, --efi-boot present.
		let f = fixture("aarch64");
		IsoMaker.build(&ctx(&f)).unwrap();

		let line = xorriso_line(&f);
		assert!(line.contains("--efi-boot boot/grub/efi.img"));
		assert!(!line.contains("-b "));
		assert!(!line.contains("--grub2-mbr"));
		assert!(f.exec.calls_matching("i386-pc-eltorito").is_empty());
		assert_eq!(f.exec.calls_matching("grub-mkimage -O arm64-efi").len(), 1);
	}

	#[test]
	fn hybrid_mastering_on_x86_64() {
		// S4: both the BIOS eltorito entry and the EFI alternate boot.
		let f = fixture("x86_64");
		IsoMaker.build(&ctx(&f)).unwrap();

		let line = xorriso_line(&f);
		assert!(line.contains("-b boot/grub/i386-pc/eltorito.img"));
		assert!(line.contains("-eltorito-alt-boot -e boot/grub/efi.img"));
		assert!(line.contains("--grub2-mbr"));
		assert!(line.contains("-append_partition 2 0xef"));
		assert!(line.contains("-volid OIC_CDROM"));
		assert_eq!(f.exec.calls_matching("i386-pc-eltorito").len(), 1);
	}

	#[test]
	fn install_root_is_removed_after_mastering() {
		let f = fixture("x86_64");
		IsoMaker.build(&ctx(&f)).unwrap();
		assert!(!f.build_dir.join("isoroot").exists());
	}

	#[test]
	fn template_dump_rewrites_additional_files() {
		let f = fixture("x86_64");
		let seed = f.config_dir.join("seed.yaml");
		just_write(&seed, "answer: 42\n").unwrap();

		let mut template = f.template.clone();
		template.system.additional_files.push(crate::config::FileMapping {
			local: seed.display().to_string(),
			image: "/etc/seed.yaml".to_owned(),
		});
		let ctx = BuildContext { template: &template, ..ctx(&f) };

		// inspect the tree before mastering by running only the config step
		let install_root = f.build_dir.join("isoroot");
		std::fs::create_dir_all(&install_root).unwrap();
		copy_configs(&ctx, &install_root).unwrap();

		assert!(install_root.join("additionalfiles/seed.yaml").exists());
		let dump = std::fs::read_to_string(
			install_root.join("config/osv/edge-microvisor-toolkit/3.0/template-dump.yaml"),
		)
		.unwrap();
		assert!(dump.contains("../additionalfiles/seed.yaml"));
		assert!(!dump.contains(&seed.display().to_string()));
	}
}
