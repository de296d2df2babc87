//! DEB repository metadata: `Release` verification and `Packages` parsing.

use std::path::Path;

use color_eyre::Result;
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use super::fetch::Fetcher;
use super::{Checksum, ChecksumAlgo, PackageInfo, RepoConfig};
use crate::compress;
use crate::error::ComposerError;
use crate::executor::{Executor, Invocation};
use crate::util::just_write;

/// Fetch one DEB repository's package index, verifying the `Release`
/// signature against the repo's pinned key first.
pub fn fetch_catalog(
	fetcher: &Fetcher, exec: &dyn Executor, repo: &RepoConfig, repo_index: usize,
	work_dir: &Path,
) -> Result<Vec<PackageInfo>> {
	let Some(list_url) = &repo.package_list_url else {
		return Err(ComposerError::ConfigInvalid(format!(
			"deb repo `{}` has no package-list URL",
			repo.name
		))
		.into());
	};

	let release_digests = match repo.release_urls.first() {
		Some(release_url) => {
			info!(repo = repo.name.as_str(), url = release_url.as_str(), "fetching Release");
			let release = fetcher.get_text(release_url)?;
			verify_release(fetcher, exec, repo, &release, release_url, work_dir)?;
			parse_release_digests(&release)
		},
		None => {
			warn!(repo = repo.name.as_str(), "no release URL configured, skipping signature check");
			IndexMap::new()
		},
	};

	debug!(url = list_url.as_str(), "fetching Packages index");
	let compressed = fetcher.get_bytes(list_url)?;
	verify_index_digest(list_url, &compressed, &release_digests)?;
	let text_bytes = compress::decompress_bytes(&compressed, list_url)?;
	let text = String::from_utf8_lossy(&text_bytes).into_owned();

	parse_packages(&text, repo, repo_index)
}

/// Check `Release.gpg` with `gpgv` against the repo's imported keyring.
fn verify_release(
	fetcher: &Fetcher, exec: &dyn Executor, repo: &RepoConfig, release: &str,
	release_url: &str, work_dir: &Path,
) -> Result<()> {
	let Some(key_url) = &repo.gpg_key_url else {
		warn!(repo = repo.name.as_str(), "no signing key configured, skipping signature check");
		return Ok(());
	};
	let sig_url = repo
		.release_urls
		.get(1)
		.cloned()
		.unwrap_or_else(|| format!("{release_url}.gpg"));
	let signature = fetcher.get_bytes(&sig_url)?;
	let key = fetcher.get_bytes(key_url)?;

	let release_path = work_dir.join("Release");
	let sig_path = work_dir.join("Release.gpg");
	let key_path = work_dir.join("signing.key");
	let keyring = work_dir.join("trusted.gpg");
	just_write(&release_path, release)?;
	just_write(&sig_path, signature)?;
	just_write(&key_path, key)?;

	exec.run(&Invocation::new(format!(
		"gpg --batch --no-default-keyring --keyring {} --import {}",
		keyring.display(),
		key_path.display()
	)))?;
	gpgv_check(exec, &keyring, &sig_path, &release_path, release_url)
}

/// Run `gpgv`; any failure is a fatal signature mismatch, never retried.
fn gpgv_check(
	exec: &dyn Executor, keyring: &Path, sig: &Path, release: &Path, release_url: &str,
) -> Result<()> {
	exec.run(&Invocation::new(format!(
		"gpgv --keyring {} {} {}",
		keyring.display(),
		sig.display(),
		release.display()
	)))
	.map(|_| ())
	.map_err(|_| ComposerError::SignatureMismatch(release_url.to_owned()).into())
}

/// `SHA256` section of a `Release` file: `digest size path` per line.
pub fn parse_release_digests(release: &str) -> IndexMap<String, Checksum> {
	let mut digests = IndexMap::new();
	let mut in_sha256 = false;
	for line in release.lines() {
		if !line.starts_with(' ') {
			in_sha256 = line.trim_end() == "SHA256:";
			continue;
		}
		if !in_sha256 {
			continue;
		}
		let mut fields = line.split_whitespace();
		if let (Some(digest), Some(_size), Some(path)) =
			(fields.next(), fields.next(), fields.next())
		{
			digests
				.insert(path.to_owned(), Checksum::new(ChecksumAlgo::Sha256, digest));
		}
	}
	digests
}

fn verify_index_digest(
	url: &str, data: &[u8], digests: &IndexMap<String, Checksum>,
) -> Result<()> {
	// Release lists paths relative to the dist root; match by suffix.
	let Some((_, expected)) = digests.iter().find(|(path, _)| url.ends_with(path.as_str()))
	else {
		return Ok(());
	};
	let actual = crate::download::digest_bytes(expected.algo, data);
	if actual == expected.digest {
		Ok(())
	} else {
		Err(ComposerError::ChecksumMismatch {
			file: url.to_owned(),
			expected: expected.digest.clone(),
			actual,
		}
		.into())
	}
}

/// Parse the stanza-format `Packages` index.
pub fn parse_packages(
	text: &str, repo: &RepoConfig, repo_index: usize,
) -> Result<Vec<PackageInfo>> {
	let prefix = repo.expand_url(repo.prefix_url());
	let prefix = prefix.trim_end_matches('/');
	let mut packages = Vec::new();

	for stanza in text.split("\n\n").filter(|s| !s.trim().is_empty()) {
		let fields = parse_stanza(stanza);
		let Some(name) = fields.get("Package") else { continue };
		let Some(filename_path) = fields.get("Filename") else {
			warn!(package = name.as_str(), "stanza has no Filename, skipping");
			continue;
		};

		let checksum = if let Some(digest) = fields.get("SHA256") {
			Checksum::new(ChecksumAlgo::Sha256, digest.as_str())
		} else if let Some(digest) = fields.get("MD5sum") {
			Checksum::new(ChecksumAlgo::Md5, digest.as_str())
		} else {
			warn!(package = name.as_str(), "stanza has no digest, skipping");
			continue;
		};

		let mut requires = split_dep_list(fields.get("Pre-Depends"));
		requires.extend(split_dep_list(fields.get("Depends")));

		packages.push(PackageInfo {
			name: name.clone(),
			version: fields.get("Version").cloned().unwrap_or_default(),
			arch: fields.get("Architecture").cloned().unwrap_or_default(),
			filename: filename_path.rsplit('/').next().unwrap_or(filename_path).to_owned(),
			download_url: format!("{prefix}/{filename_path}"),
			checksum,
			provides: split_dep_list(fields.get("Provides")),
			requires,
			conflicts: split_dep_list(fields.get("Conflicts")),
			repo_index,
		});
	}

	// Each virtual Provides becomes a synthetic record under the virtual
	// name, carrying the concrete provider's artifact identity and
	// dependencies. Resolving the virtual name then selects the real file.
	let mut synthetics = Vec::new();
	for pkg in &packages {
		for provide in &pkg.provides {
			let Some(virtual_name) = provide.split_whitespace().next() else { continue };
			if virtual_name == pkg.name {
				continue;
			}
			let mut alias = pkg.clone();
			alias.name = virtual_name.to_owned();
			alias.provides = Vec::new();
			synthetics.push(alias);
		}
	}
	packages.extend(synthetics);

	debug!(count = packages.len(), repo = repo.name.as_str(), "parsed Packages index");
	Ok(packages)
}

fn parse_stanza(stanza: &str) -> IndexMap<String, String> {
	let mut fields: IndexMap<String, String> = IndexMap::new();
	let mut last_key: Option<String> = None;
	for line in stanza.lines() {
		if line.starts_with(' ') || line.starts_with('\t') {
			if let Some(entry) = last_key.as_ref().and_then(|k| fields.get_mut(k)) {
				entry.push('\n');
				entry.push_str(line.trim());
			}
			continue;
		}
		if let Some((key, value)) = line.split_once(':') {
			fields.insert(key.trim().to_owned(), value.trim().to_owned());
			last_key = Some(key.trim().to_owned());
		}
	}
	fields
}

/// Split a comma-separated dependency list, keeping alternative groups
/// (`a | b`) together as one expression.
fn split_dep_list(value: Option<&String>) -> Vec<String> {
	value
		.map(|v| {
			v.split(',')
				.map(str::trim)
				.filter(|s| !s.is_empty())
				.map(ToOwned::to_owned)
				.collect()
		})
		.unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::executor::{MockExecutor, MockResponse};

	fn repo() -> RepoConfig {
		RepoConfig {
			name: "noble".to_owned(),
			section: "main".to_owned(),
			base_url: "https://deb.invalid/ubuntu".to_owned(),
			package_list_url: Some(
				"https://deb.invalid/ubuntu/dists/noble/main/binary-amd64/Packages.gz".to_owned(),
			),
			package_prefix_url: Some("https://deb.invalid/ubuntu".to_owned()),
			gpg_key_url: Some("https://deb.invalid/key.asc".to_owned()),
			release_urls: vec!["https://deb.invalid/ubuntu/dists/noble/Release".to_owned()],
			arch: "amd64".to_owned(),
			enabled: true,
			build_path: None,
		}
	}

	const PACKAGES: &str = "\
Package: bash\n\
Version: 5.2.21-2ubuntu4\n\
Architecture: amd64\n\
Pre-Depends: libc6 (>= 2.38)\n\
Depends: base-files (>= 2.1.12), debianutils (>= 5.6-0.1)\n\
Provides: sh\n\
Filename: pool/main/b/bash/bash_5.2.21-2ubuntu4_amd64.deb\n\
SHA256: 3333333333333333333333333333333333333333333333333333333333333333\n\
\n\
Package: dash\n\
Version: 0.5.12-6ubuntu5\n\
Architecture: amd64\n\
Depends: debianutils (>= 5.6-0.1) | busybox, libc6 (>= 2.38)\n\
Provides: sh\n\
Filename: pool/main/d/dash/dash_0.5.12-6ubuntu5_amd64.deb\n\
SHA256: 4444444444444444444444444444444444444444444444444444444444444444\n";

	#[test]
	fn parses_stanzas() {
		let pkgs = parse_packages(PACKAGES, &repo(), 1).unwrap();
		// two concrete packages plus one synthetic `sh` record for each
		assert_eq!(pkgs.len(), 4);

		let bash = &pkgs[0];
		assert_eq!(bash.name, "bash");
		assert_eq!(bash.filename, "bash_5.2.21-2ubuntu4_amd64.deb");
		assert_eq!(
			bash.download_url,
			"https://deb.invalid/ubuntu/pool/main/b/bash/bash_5.2.21-2ubuntu4_amd64.deb"
		);
		assert_eq!(bash.requires.len(), 3);
		assert_eq!(bash.requires[0], "libc6 (>= 2.38)");
		assert_eq!(bash.provides, vec!["sh"]);
		assert_eq!(bash.repo_index, 1);

		// alternative groups stay together
		assert_eq!(pkgs[1].requires[0], "debianutils (>= 5.6-0.1) | busybox");
	}

	#[test]
	fn virtual_provides_emit_synthetic_entries() {
		let pkgs = parse_packages(PACKAGES, &repo(), 0).unwrap();

		let aliases: Vec<_> = pkgs.iter().filter(|p| p.name == "sh").collect();
		assert_eq!(aliases.len(), 2);
		// each alias carries its concrete provider's artifact identity
		let alias_files: Vec<_> = aliases.iter().map(|p| p.filename.as_str()).collect();
		assert!(alias_files.contains(&"bash_5.2.21-2ubuntu4_amd64.deb"));
		assert!(alias_files.contains(&"dash_0.5.12-6ubuntu5_amd64.deb"));
		// and its dependencies, so selecting the alias pulls the same closure
		let bash_alias = aliases
			.iter()
			.find(|p| p.filename.starts_with("bash"))
			.unwrap();
		assert_eq!(bash_alias.requires[0], "libc6 (>= 2.38)");
		assert!(bash_alias.provides.is_empty());

		let catalog = super::super::Catalog::index(pkgs);
		// the virtual name is resolvable both by name and through provides
		assert_eq!(catalog.named("sh").len(), 2);
		assert_eq!(catalog.providers_of("sh").len(), 2);
	}

	#[test]
	fn release_digest_section_parsed() {
		let release = "\
Origin: Ubuntu\n\
Suite: noble\n\
MD5Sum:\n\
\x20aaaa 1234 main/binary-amd64/Packages\n\
SHA256:\n\
\x20bbbb 1234 main/binary-amd64/Packages\n\
\x20cccc 999 main/binary-amd64/Packages.gz\n";
		let digests = parse_release_digests(release);
		assert_eq!(digests.len(), 2);
		assert_eq!(digests["main/binary-amd64/Packages.gz"].digest, "cccc");
	}

	#[test]
	fn failed_gpgv_is_signature_mismatch() {
		let work = tempfile::tempdir().unwrap();
		let exec = MockExecutor::new();
		exec.stub("gpgv", MockResponse::fail(2, "BAD signature"));

		let err = gpgv_check(
			&exec,
			&work.path().join("trusted.gpg"),
			&work.path().join("Release.gpg"),
			&work.path().join("Release"),
			"https://deb.invalid/ubuntu/dists/noble/Release",
		)
		.unwrap_err();
		assert!(matches!(
			err.downcast_ref::<ComposerError>(),
			Some(ComposerError::SignatureMismatch(_))
		));
	}

	#[test]
	fn good_gpgv_passes() {
		let work = tempfile::tempdir().unwrap();
		let exec = MockExecutor::new();
		exec.stub("gpgv", MockResponse::ok("Good signature"));
		gpgv_check(
			&exec,
			&work.path().join("trusted.gpg"),
			&work.path().join("Release.gpg"),
			&work.path().join("Release"),
			"https://deb.invalid/ubuntu/dists/noble/Release",
		)
		.unwrap();
	}
}
