//! Provider registry and build orchestration.
//!
//! A provider is keyed by `{os}-{dist}-{arch}` and exposes the capability
//! set init / pre-process / build-image / post-process. The orchestrator
//! runs them in order and always runs post-process, even on failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use color_eyre::Result;
use tracing::{debug, info, warn};

use crate::chroot::ChrootEnv;
use crate::config::{ChrootEnvConfig, ImageTemplate, OsArchConfig, OsConfig};
use crate::download::Downloader;
use crate::error::ComposerError;
use crate::executor::{Executor, Invocation};
use crate::image::{maker_for, BuildContext};
use crate::repo::fetch::Fetcher;
use crate::repo::{deb, rpm, Catalog, PkgType, RepoConfig};
use crate::resolver::{write_dot, Resolver};
use crate::SkipPhases;

/// Host tools every build relies on, plus the per-format extras.
const HOST_TOOLS_COMMON: &[&str] = &[
	"tar",
	"gzip",
	"xz",
	"zstd",
	"cpio",
	"xorriso",
	"grub-mkimage",
	"mformat",
	"mcopy",
	"mkfs.fat",
	"qemu-img",
];
const HOST_TOOLS_RPM: &[&str] = &["rpm", "createrepo_c"];
const HOST_TOOLS_DEB: &[&str] = &["mmdebstrap", "dpkg-scanpackages", "apt-get"];

pub trait Provider {
	fn id(&self) -> String;
	/// Fetch repo metadata and index the catalog.
	fn init(&mut self) -> Result<()>;
	/// Host tool preflight, package download, chroot build + activation.
	fn pre_process(&mut self) -> Result<()>;
	/// Dispatch on the template's image type.
	fn build_image(&mut self) -> Result<()>;
	/// Chroot cleanup. Always invoked by the orchestrator.
	fn post_process(&mut self) -> Result<()>;
}

/// Scans the config root for buildable targets.
pub struct ProviderRegistry {
	config_root: PathBuf,
}

impl ProviderRegistry {
	pub fn new(config_root: PathBuf) -> Self {
		Self { config_root }
	}

	/// Every `{os}-{dist}-{arch}` this config root can build.
	pub fn available(&self) -> Vec<String> {
		let mut ids = Vec::new();
		let Ok(entries) = std::fs::read_dir(&self.config_root) else { return ids };
		for entry in entries.filter_map(std::result::Result::ok) {
			let os_dir = entry.path();
			if !os_dir.join("config.yml").exists() {
				continue;
			}
			let os = entry.file_name().to_string_lossy().into_owned();
			let Ok(config) = OsConfig::load(&os_dir) else { continue };
			for (arch, arch_cfg) in &config.arches {
				for dist in &arch_cfg.dists {
					ids.push(format!("{os}-{dist}-{arch}"));
				}
			}
		}
		ids.sort();
		ids
	}

	/// Build the provider for `template`'s target triple.
	pub fn lookup(
		&self, template: &ImageTemplate, work_dir: &Path, cache_dir: &Path,
		exec: Arc<dyn Executor>,
	) -> Result<TargetProvider> {
		let target = &template.target;
		let os_dir = self.config_root.join(&target.os);
		if !os_dir.join("config.yml").exists() {
			return Err(ComposerError::ProviderNotFound(target.provider_id()).into());
		}
		let os_config = OsConfig::load(&os_dir)?;
		let Some(arch_cfg) = os_config.arches.get(&target.arch) else {
			return Err(ComposerError::ProviderNotFound(target.provider_id()).into());
		};
		if !arch_cfg.dists.is_empty() && !arch_cfg.dists.contains(&target.dist) {
			return Err(ComposerError::ProviderNotFound(target.provider_id()).into());
		}

		TargetProvider::new(
			template.clone(),
			arch_cfg.clone(),
			self.config_root.clone(),
			work_dir.to_path_buf(),
			cache_dir.to_path_buf(),
			exec,
		)
	}
}

pub struct TargetProvider {
	template: ImageTemplate,
	pkg_type: PkgType,
	repos: Vec<RepoConfig>,
	chrootenv_config: ChrootEnvConfig,
	config_root: PathBuf,
	build_dir: PathBuf,
	cache_dir: PathBuf,
	exec: Arc<dyn Executor>,
	fetcher: Fetcher,
	chroot: ChrootEnv,
	catalog: Catalog,
}

impl std::fmt::Debug for TargetProvider {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TargetProvider")
			.field("template", &self.template)
			.field("pkg_type", &self.pkg_type)
			.field("repos", &self.repos)
			.field("chrootenv_config", &self.chrootenv_config)
			.field("config_root", &self.config_root)
			.field("build_dir", &self.build_dir)
			.field("cache_dir", &self.cache_dir)
			.finish_non_exhaustive()
	}
}

impl TargetProvider {
	fn new(
		template: ImageTemplate, arch_cfg: OsArchConfig, config_root: PathBuf,
		work_dir: PathBuf, cache_dir: PathBuf, exec: Arc<dyn Executor>,
	) -> Result<Self> {
		let provider_id = template.target.provider_id();
		let provider_work = work_dir.join(&provider_id);
		let cache_dir = cache_dir.join("pkgCache").join(&provider_id);
		let os_config_dir = config_root.join(&template.target.os);

		let chrootenv_config =
			ChrootEnvConfig::load(&os_config_dir, &arch_cfg.chrootenv_config_file)?;

		let mut repos = arch_cfg.repos;
		repos.extend(template.extra_repos.iter().cloned());
		repos.retain(|r| r.enabled);

		let chroot = ChrootEnv::new(
			provider_work.join("chrootenv"),
			provider_work.join("chrootbuild"),
			cache_dir.clone(),
			os_config_dir.clone(),
			arch_cfg.pkg_type,
			template.target.dist.clone(),
			Arc::clone(&exec),
		);

		let build_dir = provider_work.join("imagebuild").join(&template.system.name);

		Ok(Self {
			template,
			pkg_type: arch_cfg.pkg_type,
			repos,
			chrootenv_config,
			config_root,
			build_dir,
			cache_dir,
			exec,
			fetcher: Fetcher::new()?,
			chroot,
			catalog: Catalog::default(),
		})
	}

	pub fn chroot(&self) -> &ChrootEnv {
		&self.chroot
	}

	/// Check the §external-tools list and install anything missing with the
	/// host's package manager. Failures degrade to warnings; the build will
	/// fail later with a precise subprocess error if the tool really is
	/// needed.
	fn install_host_dependencies(&self) -> Result<()> {
		let extra = match self.pkg_type {
			PkgType::Rpm => HOST_TOOLS_RPM,
			PkgType::Deb => HOST_TOOLS_DEB,
		};
		let missing: Vec<&str> = HOST_TOOLS_COMMON
			.iter()
			.chain(extra)
			.copied()
			.filter(|tool| !self.exec.is_command_present(tool, None))
			.collect();
		if missing.is_empty() {
			return Ok(());
		}

		let host_pm = ["tdnf", "dnf", "apt-get"]
			.into_iter()
			.find(|pm| self.exec.is_command_present(pm, None));
		let Some(pm) = host_pm else {
			warn!(?missing, "host tools missing and no known package manager to install them");
			return Ok(());
		};
		info!(?missing, pm, "installing missing host dependencies");
		let res = self.exec.run_stream(
			&Invocation::new(format!("{pm} install -y {}", missing.join(" "))).elevated(),
		);
		if let Err(e) = res {
			warn!(err = %e, "host dependency installation failed, continuing");
		}
		Ok(())
	}

	/// Resolve `requests` against the catalog and fill the cache.
	fn resolve_and_download(&self, requests: &[String]) -> Result<Vec<crate::repo::PackageInfo>> {
		let resolver =
			Resolver::new(&self.catalog).with_baseline(&self.chrootenv_config.essential);
		let resolution = resolver.resolve(requests)?;
		write_dot(&resolution, &self.cache_dir.join("chrootpkgs.dot"))?;

		Downloader::new(Fetcher::new()?).download_all(&resolution.ordered, &self.cache_dir)?;
		Ok(resolution.ordered)
	}

	/// Regenerate the cache directory's repo metadata so the in-chroot
	/// package manager can consume it as a local repository.
	fn index_cache_repo(&self) -> Result<()> {
		match self.pkg_type {
			PkgType::Rpm => self.exec.run_stream(
				&Invocation::new(format!("createrepo_c {}", self.cache_dir.display()))
					.elevated(),
			),
			PkgType::Deb => self.exec.run(
				&Invocation::new("dpkg-scanpackages . /dev/null | gzip -9c > Packages.gz")
					.elevated()
					.workdir(&self.cache_dir),
			)
			.map(|_| ()),
		}
	}

	fn signing_key(&self) -> Result<Option<PathBuf>> {
		let Some(primary) = self.repos.first() else { return Ok(None) };
		let Some(key_url) = &primary.gpg_key_url else { return Ok(None) };
		let key_path = self.build_dir.join("signing.key");
		let key = self.fetcher.get_bytes(key_url)?;
		crate::util::just_write(&key_path, key)?;
		Ok(Some(key_path))
	}
}

impl Provider for TargetProvider {
	fn id(&self) -> String {
		self.template.target.provider_id()
	}

	fn init(&mut self) -> Result<()> {
		let mut packages = Vec::new();
		for (index, repo) in self.repos.iter().enumerate() {
			let mut batch = match self.pkg_type {
				PkgType::Rpm => rpm::fetch_catalog(&self.fetcher, repo, index)?,
				PkgType::Deb => deb::fetch_catalog(
					&self.fetcher,
					self.exec.as_ref(),
					repo,
					index,
					&self.build_dir,
				)?,
			};
			packages.append(&mut batch);
		}
		info!(count = packages.len(), repos = self.repos.len(), "indexed repo catalog");
		self.catalog = Catalog::index(packages);
		Ok(())
	}

	fn pre_process(&mut self) -> Result<()> {
		self.install_host_dependencies()?;
		std::fs::create_dir_all(&self.cache_dir)?;
		std::fs::create_dir_all(&self.build_dir)?;

		// essential set first: the chroot bootstrap consumes it in order
		if self.chroot.is_built() {
			debug!("chroot tarball cached, skipping essential resolution");
		} else {
			let essentials = {
				let resolver = Resolver::new(&self.catalog);
				let resolution = resolver.resolve(&self.chrootenv_config.essential)?;
				Downloader::new(Fetcher::new()?)
					.download_all(&resolution.ordered, &self.cache_dir)?;
				resolution.ordered
			};
			let key = self.signing_key()?;
			self.chroot.build(&essentials, key.as_deref())?;
		}

		// full system set for the image makers
		let mut requests = self.chrootenv_config.packages.clone();
		requests.extend(self.template.system.packages.iter().cloned());
		self.resolve_and_download(&requests)?;

		self.index_cache_repo()?;
		self.chroot.activate()
	}

	fn build_image(&mut self) -> Result<()> {
		let mut packages = self.chrootenv_config.packages.clone();
		packages.extend(self.template.system.packages.iter().cloned());

		let target = &self.template.target;
		let ctx = BuildContext {
			template: &self.template,
			chroot: &self.chroot,
			exec: Arc::clone(&self.exec),
			build_dir: self.build_dir.clone(),
			general_config_dir: self.config_root.join("general"),
			osv_config_dir: self
				.config_root
				.join("osv")
				.join(&target.os)
				.join(&target.dist),
			packages,
		};

		// mounts come down even if the maker panics; post_process re-runs
		// cleanup on the ordinary error path
		let guard = self.chroot.cleanup_guard();
		maker_for(self.template.target.image_type).build(&ctx)?;
		guard.disarm();
		Ok(())
	}

	fn post_process(&mut self) -> Result<()> {
		self.chroot.cleanup()
	}
}

pub struct Orchestrator;

impl Orchestrator {
	/// Run the pipeline. Post-process always executes; the earliest error
	/// wins.
	pub fn run(provider: &mut dyn Provider, skip: &SkipPhases) -> Result<()> {
		info!(provider = %provider.id(), "starting build pipeline");
		let result = Self::pipeline(provider, skip);

		let post = provider.post_process();
		match (result, post) {
			(Err(e), _) => Err(e),
			(Ok(()), Err(e)) => Err(e),
			(Ok(()), Ok(())) => Ok(()),
		}
	}

	fn pipeline(provider: &mut dyn Provider, skip: &SkipPhases) -> Result<()> {
		let mut phase = |name: &str| {
			if skip.contains(name) {
				warn!(phase = name, "phase skipped by request");
				false
			} else {
				info!(phase = name, "running phase");
				true
			}
		};
		if phase("init") {
			provider.init()?;
		}
		if phase("preprocess") {
			provider.pre_process()?;
		}
		if phase("build") {
			provider.build_image()?;
		}
		Ok(())
	}
}
