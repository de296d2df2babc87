//! Chroot sandbox lifecycle: build a minimal rootfs once, cache it as a
//! tarball, extract and wire it up per build, and tear every mount down on
//! any exit path.
//!
//! States per build: unborn → built (tarball cached) → active (extracted,
//! mounts attached) → cleaned (mounts gone, tarball retained for reuse).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use color_eyre::{eyre::Context, Result};
use itertools::Itertools;
use tracing::{debug, info, trace, warn};

use crate::compress;
use crate::error::ComposerError;
use crate::executor::{Executor, Invocation};
use crate::mount::MountManager;
use crate::repo::{PackageInfo, PkgType};
use crate::util::{copy_file, is_subpath, just_write};

const TARBALL_NAME: &str = "chrootenv.tar.gz";
/// Bind target for the package cache inside the chroot.
const CACHE_REPO_DIR: &str = "cdrom/cache-repo";
/// Scratch area the image makers use inside the chroot.
const WORKSPACE_DIR: &str = "workspace/imagebuild";

pub struct ChrootEnv {
	root: PathBuf,
	build_dir: PathBuf,
	cache_dir: PathBuf,
	config_dir: PathBuf,
	pkg_type: PkgType,
	dist: String,
	exec: Arc<dyn Executor>,
	mounts: MountManager,
}

impl ChrootEnv {
	pub fn new(
		root: PathBuf, build_dir: PathBuf, cache_dir: PathBuf, config_dir: PathBuf,
		pkg_type: PkgType, dist: String, exec: Arc<dyn Executor>,
	) -> Self {
		let mounts = MountManager::new(Arc::clone(&exec));
		Self { root, build_dir, cache_dir, config_dir, pkg_type, dist, exec, mounts }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn cache_dir(&self) -> &Path {
		&self.cache_dir
	}

	pub fn mounts(&self) -> &MountManager {
		&self.mounts
	}

	pub fn pkg_type(&self) -> PkgType {
		self.pkg_type
	}

	pub fn tarball_path(&self) -> PathBuf {
		self.build_dir.join(TARBALL_NAME)
	}

	/// Whether the cached rootfs tarball already exists.
	pub fn is_built(&self) -> bool {
		self.tarball_path().exists()
	}

	/// Translate a chroot-relative path to its host location.
	pub fn host_path(&self, chroot_path: impl AsRef<Path>) -> PathBuf {
		let p = chroot_path.as_ref();
		self.root.join(p.strip_prefix("/").unwrap_or(p))
	}

	/// Translate a host path back into the chroot's namespace. Anything
	/// outside the env root is a programmer error.
	pub fn chroot_path(&self, host: &Path) -> Result<PathBuf> {
		if !is_subpath(&self.root, host) {
			return Err(ComposerError::PathEscape {
				path: host.to_path_buf(),
				root: self.root.clone(),
			}
			.into());
		}
		let rel = host.strip_prefix(&self.root).unwrap_or(host);
		Ok(Path::new("/").join(rel))
	}

	/// Build the cached rootfs tarball from the resolved essential set.
	/// A present tarball makes this a no-op.
	pub fn build(&self, essentials: &[PackageInfo], key_path: Option<&Path>) -> Result<()> {
		let tarball = self.tarball_path();
		if tarball.exists() {
			info!(?tarball, "chroot tarball already cached, reusing");
			return Ok(());
		}

		let staging = self.build_dir.join("rootfs");
		std::fs::create_dir_all(&staging)?;
		info!(?staging, pkg_type = ?self.pkg_type, "bootstrapping chroot rootfs");

		match self.pkg_type {
			PkgType::Rpm => self.bootstrap_rpm(&staging, essentials, key_path)?,
			PkgType::Deb => self.bootstrap_deb(&staging, essentials)?,
		}

		compress::compress_dir(&staging, &tarball)?;
		std::fs::remove_dir_all(&staging)?;
		info!(?tarball, "chroot tarball cached");
		Ok(())
	}

	fn bootstrap_rpm(
		&self, staging: &Path, essentials: &[PackageInfo], key_path: Option<&Path>,
	) -> Result<()> {
		// install in dependency order so each package's scriptlets see
		// their prerequisites in place
		for pkg in essentials {
			let rpm_path = self.cache_dir.join(&pkg.filename);
			debug!(file = pkg.filename.as_str(), "installing into rootfs");
			self.exec.run(
				&Invocation::new(format!(
					"rpm -i --root={} {}",
					staging.display(),
					rpm_path.display()
				))
				.elevated(),
			)?;
		}

		self.reconcile_rpmdb(staging, essentials)?;

		if let Some(key) = key_path {
			self.exec.run(
				&Invocation::new(format!(
					"rpm --root={} --import {}",
					staging.display(),
					key.display()
				))
				.elevated(),
			)?;
		}
		Ok(())
	}

	/// The host rpm and the target rootfs may disagree on the rpmdb backend
	/// (bdb vs sqlite). When they do, wipe the database and re-register
	/// every package with `--justdb` so the in-chroot tooling can read it.
	fn reconcile_rpmdb(&self, staging: &Path, essentials: &[PackageInfo]) -> Result<()> {
		let host_backend = self
			.exec
			.run(&Invocation::new("rpm --eval %{_db_backend}".to_owned()))?
			.stdout
			.trim()
			.to_owned();
		let db_dir = staging.join("var/lib/rpm");
		let chroot_backend = if db_dir.join("rpmdb.sqlite").exists() {
			"sqlite"
		} else if db_dir.join("Packages").exists() {
			"bdb"
		} else {
			// nothing written yet, nothing to reconcile
			return Ok(());
		};

		if host_backend == chroot_backend {
			return Ok(());
		}
		warn!(host_backend = host_backend.as_str(), chroot_backend, "rpmdb backend mismatch, rebuilding database");
		std::fs::remove_dir_all(&db_dir)?;
		for pkg in essentials {
			let rpm_path = self.cache_dir.join(&pkg.filename);
			self.exec.run(
				&Invocation::new(format!(
					"rpm -i --justdb --nodeps --noscripts --root={} {}",
					staging.display(),
					rpm_path.display()
				))
				.elevated(),
			)?;
		}
		Ok(())
	}

	fn bootstrap_deb(&self, staging: &Path, essentials: &[PackageInfo]) -> Result<()> {
		let sources = self.config_dir.join("chrootenvconfigs").join("local.list");
		let include = essentials.iter().map(|p| p.name.as_str()).join(",");
		self.exec.run_stream(
			&Invocation::new(format!(
				"mmdebstrap --variant=custom --include={include} {} {} {}",
				self.dist,
				staging.display(),
				sources.display()
			))
			.elevated(),
		)?;
		Ok(())
	}

	/// Extract the tarball (first activation only) and wire the sandbox up:
	/// DNS, workspace, cache-repo bind, repo descriptor, fresh metadata.
	pub fn activate(&self) -> Result<()> {
		let extracted = self.root.exists()
			&& std::fs::read_dir(&self.root).map(|mut d| d.next().is_some()).unwrap_or(false);
		if extracted {
			debug!(root = ?self.root, "env root already populated, skipping extraction");
		} else {
			compress::decompress_dir(&self.tarball_path(), &self.root)
				.wrap_err("extracting chroot tarball")?;
		}

		// working DNS inside the sandbox
		let resolv = Path::new("/etc/resolv.conf");
		if resolv.exists() {
			copy_file(resolv, &self.host_path("etc/resolv.conf"))?;
		} else {
			warn!("host has no /etc/resolv.conf, leaving an empty one");
			just_write(self.host_path("etc/resolv.conf"), "")?;
		}

		std::fs::create_dir_all(self.host_path(WORKSPACE_DIR))?;

		self.mounts.attach(
			&self.cache_dir.display().to_string(),
			&self.host_path(CACHE_REPO_DIR),
			&["--bind"],
		)?;
		self.mounts.mount_sysfs(&self.root)?;

		self.install_repo_descriptor()?;
		self.refresh_metadata()?;
		Ok(())
	}

	fn install_repo_descriptor(&self) -> Result<()> {
		let (src, dest) = match self.pkg_type {
			PkgType::Rpm => ("local.repo", "etc/yum.repos.d/local.repo"),
			PkgType::Deb => ("local.list", "etc/apt/sources.list.d/local.list"),
		};
		let src = self.config_dir.join("chrootenvconfigs").join(src);
		if !src.exists() {
			return Err(ComposerError::ConfigMissing(src).into());
		}
		copy_file(&src, &self.host_path(dest))
	}

	fn refresh_metadata(&self) -> Result<()> {
		let cmdline = match self.pkg_type {
			PkgType::Rpm => "tdnf makecache",
			PkgType::Deb => "apt-get update",
		};
		info!(cmdline, "refreshing in-chroot package metadata");
		self.exec
			.run_stream(&Invocation::new(cmdline.to_owned()).elevated().in_chroot(&self.root))
	}

	/// Run the in-chroot package manager against a subdirectory of the
	/// sandbox, streaming its output.
	pub fn install_packages_into(
		&self, packages: &[String], install_root: &Path,
	) -> Result<()> {
		let list = packages.join(" ");
		let cmdline = match self.pkg_type {
			PkgType::Rpm => format!(
				"tdnf install -y --nogpgcheck --installroot={} {list}",
				install_root.display()
			),
			PkgType::Deb => {
				format!("apt-get install -y -o RootDir={} {list}", install_root.display())
			},
		};
		info!(install_root = %install_root.display(), "installing package set");
		self.exec.run_stream(&Invocation::new(cmdline).elevated().in_chroot(&self.root))
	}

	/// Detach every mount under the env root (children first) and stop the
	/// GPG helpers that keep files open in it. The tarball stays for the
	/// next build.
	pub fn cleanup(&self) -> Result<()> {
		info!(root = ?self.root, "cleaning up chroot environment");
		for component in ["gpg-agent", "keyboxd"] {
			let inv = Invocation::new(format!("gpgconf --kill {component}"))
				.elevated()
				.in_chroot(&self.root);
			if let Err(e) = self.exec.run(&inv) {
				trace!(component, err = %e, "gpgconf kill failed, ignoring");
			}
		}
		self.mounts.detach_tree(&self.root)?;
		Ok(())
	}

	/// Scope guard tying cleanup to drop, so no exit path leaves mounts
	/// behind.
	pub fn cleanup_guard(&self) -> CleanupGuard<'_> {
		CleanupGuard { env: self, disarmed: false }
	}
}

pub struct CleanupGuard<'a> {
	env: &'a ChrootEnv,
	disarmed: bool,
}

impl CleanupGuard<'_> {
	/// Disarm when cleanup has already run explicitly.
	pub fn disarm(mut self) {
		self.disarmed = true;
	}
}

impl Drop for CleanupGuard<'_> {
	fn drop(&mut self) {
		if self.disarmed {
			return;
		}
		if let Err(e) = self.env.cleanup() {
			warn!(err = %e, "chroot cleanup from guard failed");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::executor::{MockExecutor, MockResponse};
	use crate::repo::test_package;

	struct Fixture {
		_work: tempfile::TempDir,
		_config: tempfile::TempDir,
		env: ChrootEnv,
		exec: Arc<MockExecutor>,
	}

	fn fixture(pkg_type: PkgType, exec: MockExecutor) -> Fixture {
		let work = tempfile::tempdir().unwrap();
		let config = tempfile::tempdir().unwrap();
		just_write(config.path().join("chrootenvconfigs/local.repo"), "[local]\n").unwrap();
		just_write(config.path().join("chrootenvconfigs/local.list"), "deb [trusted=yes] file:///cdrom/cache-repo ./\n")
			.unwrap();
		let exec = Arc::new(exec);
		let env = ChrootEnv::new(
			work.path().join("chrootenv"),
			work.path().join("chrootbuild"),
			work.path().join("pkgcache"),
			config.path().to_path_buf(),
			pkg_type,
			"3.0".to_owned(),
			Arc::clone(&exec) as Arc<dyn Executor>,
		);
		std::fs::create_dir_all(work.path().join("pkgcache")).unwrap();
		Fixture { env, exec, _work: work, _config: config }
	}

	fn seed_tarball(env: &ChrootEnv) {
		let staging = tempfile::tempdir().unwrap();
		just_write(staging.path().join("etc/os-release"), "ID=edge\n").unwrap();
		just_write(staging.path().join("usr/bin/tdnf"), "").unwrap();
		compress::compress_dir(staging.path(), &env.tarball_path()).unwrap();
	}

	#[test]
	fn path_translation_roundtrip() {
		let f = fixture(PkgType::Rpm, MockExecutor::new());
		let host = f.env.host_path("/workspace/imagebuild/rootfs");
		let back = f.env.chroot_path(&host).unwrap();
		assert_eq!(back, Path::new("/workspace/imagebuild/rootfs"));
	}

	#[test]
	fn escaping_path_is_rejected() {
		let f = fixture(PkgType::Rpm, MockExecutor::new());
		let err = f.env.chroot_path(Path::new("/etc/passwd")).unwrap_err();
		assert!(matches!(
			err.downcast_ref::<ComposerError>(),
			Some(ComposerError::PathEscape { .. })
		));

		let sneaky = f.env.root().join("../outside");
		assert!(f.env.chroot_path(&sneaky).is_err());
	}

	#[test]
	fn cached_tarball_short_circuits_build() {
		// S1: with the tarball pre-populated, build makes no package
		// manager calls and activation extracts + wires DNS.
		let f = fixture(PkgType::Rpm, MockExecutor::new());
		seed_tarball(&f.env);

		f.env.build(&[test_package("bash", "5.2")], None).unwrap();
		assert!(f.exec.calls().is_empty(), "build must not invoke anything on a cache hit");

		f.env.activate().unwrap();
		assert!(f.env.host_path("etc/resolv.conf").exists());
		assert!(f.env.host_path("etc/os-release").exists());
		assert!(f.env.host_path("workspace/imagebuild").is_dir());
		assert!(f.exec.calls_matching("rpm -i").is_empty());
		assert_eq!(f.exec.calls_matching("tdnf makecache").len(), 1);
		assert!(f.env.host_path("etc/yum.repos.d/local.repo").exists());
	}

	#[test]
	fn rpm_bootstrap_installs_in_order() {
		let mock = MockExecutor::new();
		mock.stub("rpm --eval", MockResponse::ok("sqlite\n"));
		let f = fixture(PkgType::Rpm, mock);

		let pkgs = vec![test_package("filesystem", "1.1"), test_package("glibc", "2.38")];
		f.env.build(&pkgs, None).unwrap();

		let installs = f.exec.calls_matching("rpm -i");
		assert_eq!(installs.len(), 2);
		assert!(installs[0].contains("filesystem-1.1"));
		assert!(installs[1].contains("glibc-2.38"));
		assert!(f.env.tarball_path().exists());
	}

	#[test]
	fn deb_bootstrap_uses_mmdebstrap() {
		let f = fixture(PkgType::Deb, MockExecutor::new());
		let pkgs = vec![test_package("base-files", "13"), test_package("dpkg", "1.22")];
		f.env.build(&pkgs, None).unwrap();

		let calls = f.exec.calls_matching("mmdebstrap");
		assert_eq!(calls.len(), 1);
		assert!(calls[0].contains("--variant=custom"));
		assert!(calls[0].contains("--include=base-files,dpkg"));
		assert!(calls[0].contains("local.list"));
	}

	#[test]
	fn cleanup_leaves_no_mounts_under_root() {
		let f = fixture(PkgType::Rpm, MockExecutor::new());
		let root = f.env.root().display().to_string();
		let table = format!(
			"proc on {root}/proc type proc (rw)\ntmpfs on {root}/cdrom/cache-repo type tmpfs (rw)\n"
		);
		// first listing shows live mounts, later listings show none
		f.exec.expect("mount", MockResponse::ok(table.as_str()));
		f.exec.stub("umount -l", MockResponse::ok(""));
		f.exec.stub("mount", MockResponse::ok(""));

		f.env.cleanup().unwrap();
		assert_eq!(f.exec.calls_matching("umount -l").len(), 2);
		assert!(f.env.mounts().list_under(f.env.root()).unwrap().is_empty());
	}

	#[test]
	fn guard_runs_cleanup_on_drop() {
		let f = fixture(PkgType::Rpm, MockExecutor::new());
		{
			let _guard = f.env.cleanup_guard();
		}
		// the mount listing from detach_tree proves cleanup ran
		assert!(!f.exec.calls().is_empty());
	}
}
