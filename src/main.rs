#![warn(clippy::complexity)]
#![warn(clippy::correctness)]
#![warn(clippy::perf)]
#![warn(clippy::style)]
#![warn(clippy::suspicious)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_errors_doc)]

mod chroot;
mod compress;
mod config;
mod download;
mod error;
mod executor;
mod image;
mod mount;
mod provider;
mod repo;
mod resolver;
mod util;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{value_parser, Parser};
use color_eyre::Result;
use serde_derive::{Deserialize, Serialize};
use tracing::{info, trace};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

use crate::executor::HostExecutor;
use crate::provider::{Orchestrator, Provider, ProviderRegistry};

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct SkipPhases(std::collections::HashSet<String>);

impl SkipPhases {
	pub fn contains(&self, phase: &str) -> bool {
		self.0.contains(phase)
	}
}

impl From<&str> for SkipPhases {
	fn from(value: &str) -> SkipPhases {
		SkipPhases(value.split(',').filter(|s| !s.is_empty()).map(ToOwned::to_owned).collect())
	}
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct OicCli {
	/// Image template location
	template: PathBuf,

	/// Scratch and output directory
	#[arg(long, default_value = "oic-work")]
	work_dir: PathBuf,

	/// Package cache directory, persists across builds
	#[arg(long, default_value = "oic-cache")]
	cache_dir: PathBuf,

	/// Provider configuration root
	#[arg(long, default_value = "config")]
	config_dir: PathBuf,

	#[arg(long)]
	/// Override architecture to build for
	arch: Option<String>,

	#[arg(short, long, env = "OIC_SKIP_PHASES", value_parser = value_parser!(SkipPhases), default_value = "")]
	skip_phases: SkipPhases,

	/// List buildable targets and exit
	#[arg(long)]
	list_targets: bool,
}

fn main() -> Result<()> {
	if let Err(e) = dotenvy::dotenv() {
		if !e.not_found() {
			return Err(e.into());
		}
	}

	color_eyre::install()?;
	// default to info level logging, override with OIC_LOG env var
	let filter = EnvFilter::try_from_env("OIC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
	let fmtlyr = fmt::layer().pretty().with_filter(filter);
	let subscriber = Registry::default().with(tracing_error::ErrorLayer::default()).with(fmtlyr);
	tracing::subscriber::set_global_default(subscriber)?;

	let cli = OicCli::parse();
	let registry = ProviderRegistry::new(cli.config_dir.clone());

	if cli.list_targets {
		for id in registry.available() {
			println!("{id}");
		}
		return Ok(());
	}

	if let Err(e) = sudo::escalate_if_needed() {
		return Err(color_eyre::eyre::eyre!("failed to escalate privileges: {e}"));
	}

	let mut template = config::ImageTemplate::load(&cli.template)?;
	if let Some(arch) = cli.arch {
		template.target.arch = arch;
	}
	trace!(?template, "loaded template");

	let exec = Arc::new(HostExecutor);
	let mut provider = registry.lookup(&template, &cli.work_dir, &cli.cache_dir, exec)?;

	info!(target = provider.id(), "building image");
	Orchestrator::run(&mut provider, &cli.skip_phases)?;
	info!("build finished");
	Ok(())
}
