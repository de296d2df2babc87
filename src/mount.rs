//! Kernel mount table management for the chroot sandbox.
//!
//! All mutation goes through the executor so teardown behavior is observable
//! under test. The invariant: after any operation here returns, the in-kernel
//! mount set contains exactly what the caller intended.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use color_eyre::Result;
use tracing::{debug, trace, warn};

use crate::error::ComposerError;
use crate::executor::{Executor, Invocation};

/// Pseudo-filesystems attached into a chroot, in mount order.
/// `/dev`, `/sys` and `/run` are marked rslave so propagation cannot escape.
const SYSFS_MOUNTS: &[(&str, &str, bool)] = &[
	("/dev", "bind", true),
	("/proc", "proc", false),
	("/sys", "sysfs", true),
	("/run", "bind", true),
	("/dev/pts", "devpts", false),
];

pub struct MountManager {
	exec: Arc<dyn Executor>,
}

impl MountManager {
	pub fn new(exec: Arc<dyn Executor>) -> Self {
		Self { exec }
	}

	/// Current mount targets, as reported by the platform `mount` command.
	pub fn list(&self) -> Result<Vec<PathBuf>> {
		let out = self.exec.run(&Invocation::new("mount"))?;
		Ok(out
			.stdout
			.lines()
			.filter_map(|line| {
				// "<source> on <target> type <fstype> (<options>)"
				let rest = line.split_once(" on ")?.1;
				let target = rest.split_once(" type ")?.0;
				Some(PathBuf::from(target))
			})
			.collect())
	}

	/// Mounts whose target lies under `root`.
	pub fn list_under(&self, root: &Path) -> Result<Vec<PathBuf>> {
		Ok(self.list()?.into_iter().filter(|p| p.starts_with(root)).collect())
	}

	pub fn is_mounted(&self, path: &Path) -> Result<bool> {
		Ok(self.list()?.iter().any(|p| p == path))
	}

	/// Mount `source` on `target`, creating the target directory first.
	/// Already-mounted targets are left alone.
	pub fn attach(&self, source: &str, target: &Path, options: &[&str]) -> Result<()> {
		std::fs::create_dir_all(target)?;
		if self.is_mounted(target)? {
			trace!(?target, "already mounted, skipping");
			return Ok(());
		}
		let opts = options.join(" ");
		debug!(source, ?target, opts = opts.as_str(), "mounting");
		let cmdline = if opts.is_empty() {
			format!("mount {source} {}", target.display())
		} else {
			format!("mount {opts} {source} {}", target.display())
		};
		self.exec.run(&Invocation::new(cmdline).elevated())?;
		Ok(())
	}

	/// Unmount `path`, escalating through lazy and force strategies.
	///
	/// A path that is not mounted succeeds silently. Exhausting every
	/// strategy is [`ComposerError::MountStuck`].
	pub fn detach(&self, path: &Path) -> Result<()> {
		for flags in ["", "-l", "-f", "-l -f"] {
			let cmdline = if flags.is_empty() {
				format!("umount {}", path.display())
			} else {
				format!("umount {flags} {}", path.display())
			};
			match self.exec.run(&Invocation::new(cmdline).elevated()) {
				Ok(_) => return Ok(()),
				Err(e) => {
					if let Some(ComposerError::SubprocessFailed { stderr, .. }) =
						e.downcast_ref::<ComposerError>()
					{
						if stderr.contains("not mounted") || stderr.contains("no mount point") {
							return Ok(());
						}
					}
					trace!(?path, flags, "umount attempt failed");
				},
			}
		}
		Err(ComposerError::MountStuck(path.to_path_buf()).into())
	}

	/// Detach everything mounted under `root`, children before parents.
	pub fn detach_tree(&self, root: &Path) -> Result<()> {
		let mut mounts = self.list_under(root)?;
		// Descending lexicographic order detaches nested mounts first.
		mounts.sort();
		mounts.reverse();
		for path in mounts {
			debug!(?path, "detaching");
			self.exec
				.run(&Invocation::new(format!("umount -l {}", path.display())).elevated())?;
		}
		Ok(())
	}

	/// Attach the pseudo-filesystem set a package manager needs inside `root`.
	pub fn mount_sysfs(&self, root: &Path) -> Result<()> {
		for (src, kind, rslave) in SYSFS_MOUNTS {
			let target = root.join(src.trim_start_matches('/'));
			match *kind {
				"bind" => self.attach(src, &target, &["--bind"])?,
				fstype => self.attach(fstype, &target, &["-t", fstype])?,
			}
			if *rslave {
				self.exec.run(
					&Invocation::new(format!("mount --make-rslave {}", target.display()))
						.elevated(),
				)?;
			}
		}
		Ok(())
	}

	/// Detach the pseudo-filesystem set in reverse order. Missing mounts are
	/// non-fatal; mountpoint directories are removed only once the kernel no
	/// longer lists them.
	pub fn unmount_sysfs(&self, root: &Path) -> Result<()> {
		for (src, _, _) in SYSFS_MOUNTS.iter().rev() {
			let target = root.join(src.trim_start_matches('/'));
			if let Err(e) = self.detach(&target) {
				warn!(?target, err = %e, "sysfs detach failed, continuing");
				continue;
			}
			if !self.is_mounted(&target)? {
				let _ = std::fs::remove_dir(&target);
			}
		}
		Ok(())
	}
}
