//! RPM repository metadata: `repomd.xml` discovery and `primary.xml` parsing.

use color_eyre::{eyre::bail, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, info, trace};

use super::fetch::Fetcher;
use super::{Checksum, ChecksumAlgo, PackageInfo, RepoConfig};
use crate::compress;

/// Fetch and parse one repository's primary metadata into package records.
pub fn fetch_catalog(
	fetcher: &Fetcher, repo: &RepoConfig, repo_index: usize,
) -> Result<Vec<PackageInfo>> {
	let base = repo.expand_url(&repo.base_url);
	let base = base.trim_end_matches('/');

	let repomd_url = format!("{base}/repodata/repomd.xml");
	info!(repo = repo.name.as_str(), url = repomd_url.as_str(), "fetching repo metadata");
	let repomd = fetcher.get_text(&repomd_url)?;
	let primary_href = find_primary_href(&repomd)?;

	let primary_url = format!("{base}/{primary_href}");
	debug!(url = primary_url.as_str(), "fetching primary metadata");
	let compressed = fetcher.get_bytes(&primary_url)?;
	let xml = decompress_primary(&compressed, &primary_href)?;

	parse_primary(&xml, repo, repo_index)
}

fn decompress_primary(data: &[u8], href: &str) -> Result<String> {
	let bytes = if href.ends_with(".xml") {
		data.to_vec()
	} else {
		compress::decompress_bytes(data, href)?
	};
	Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Strip namespace prefix: `rpm:requires` → `requires`.
fn local_name(name: quick_xml::name::QName<'_>) -> String {
	let raw = std::str::from_utf8(name.as_ref()).unwrap_or("");
	raw.rsplit_once(':').map_or(raw, |(_, local)| local).to_owned()
}

fn attr_value(e: &BytesStart<'_>, key: &str) -> Result<Option<String>> {
	for attr in e.attributes() {
		let attr = attr?;
		if attr.key.as_ref() == key.as_bytes() {
			return Ok(Some(std::str::from_utf8(&attr.value)?.to_owned()));
		}
	}
	Ok(None)
}

/// Locate the `location href` of the `<data type="primary">` element.
pub fn find_primary_href(repomd_xml: &str) -> Result<String> {
	let mut reader = Reader::from_str(repomd_xml);
	reader.config_mut().trim_text(true);

	let mut in_primary = false;
	loop {
		match reader.read_event()? {
			Event::Start(ref e) | Event::Empty(ref e) => {
				let local = local_name(e.name());
				if local == "data" {
					in_primary = attr_value(e, "type")?.as_deref() == Some("primary");
				}
				if in_primary && local == "location" {
					if let Some(href) = attr_value(e, "href")? {
						return Ok(href);
					}
				}
			},
			Event::End(ref e) => {
				if local_name(e.name()) == "data" {
					in_primary = false;
				}
			},
			Event::Eof => break,
			_ => {},
		}
	}
	bail!("no <data type=\"primary\"> entry in repomd.xml")
}

/// Render an `rpm:entry` dependency element as an expression string.
fn render_entry(e: &BytesStart<'_>) -> Result<Option<String>> {
	let Some(name) = attr_value(e, "name")? else { return Ok(None) };
	let flags = attr_value(e, "flags")?;
	let ver = attr_value(e, "ver")?;
	let rel = attr_value(e, "rel")?;
	Ok(Some(match (flags.as_deref(), ver) {
		(Some(flags), Some(ver)) => {
			let op = match flags {
				"EQ" => "=",
				"GE" => ">=",
				"LE" => "<=",
				"GT" => ">",
				"LT" => "<",
				other => other,
			};
			match rel {
				Some(rel) => format!("{name} {op} {ver}-{rel}"),
				None => format!("{name} {op} {ver}"),
			}
		},
		_ => name,
	}))
}

#[derive(Default)]
struct PackageBuilder {
	name: String,
	version: String,
	arch: String,
	checksum: Option<Checksum>,
	location: String,
	provides: Vec<String>,
	requires: Vec<String>,
	conflicts: Vec<String>,
}

impl PackageBuilder {
	fn finish(self, repo: &RepoConfig, repo_index: usize) -> Result<PackageInfo> {
		let Some(checksum) = self.checksum else {
			bail!("package {} has no checksum in primary.xml", self.name);
		};
		let filename = self
			.location
			.rsplit('/')
			.next()
			.unwrap_or(&self.location)
			.to_owned();
		let prefix = repo.expand_url(repo.prefix_url());
		let download_url = format!("{}/{}", prefix.trim_end_matches('/'), self.location);
		Ok(PackageInfo {
			name: self.name,
			version: self.version,
			arch: self.arch,
			filename,
			download_url,
			checksum,
			provides: self.provides,
			requires: self.requires,
			conflicts: self.conflicts,
			repo_index,
		})
	}
}

/// Parse `primary.xml` into package records, preserving the
/// provides/requires/conflicts expressions of the `<format>` block.
pub fn parse_primary(
	xml: &str, repo: &RepoConfig, repo_index: usize,
) -> Result<Vec<PackageInfo>> {
	let mut reader = Reader::from_str(xml);
	reader.config_mut().trim_text(true);

	let mut packages = Vec::new();
	let mut current: Option<PackageBuilder> = None;
	// which of provides/requires/conflicts we are inside, if any
	let mut dep_section: Option<&'static str> = None;
	let mut text_target: Option<&'static str> = None;
	let mut checksum_algo: Option<String> = None;

	loop {
		match reader.read_event()? {
			Event::Start(ref e) => {
				let local = local_name(e.name());
				match local.as_str() {
					"package" => current = Some(PackageBuilder::default()),
					"name" if current.is_some() => text_target = Some("name"),
					"arch" if current.is_some() => text_target = Some("arch"),
					"checksum" if current.is_some() => {
						checksum_algo = attr_value(e, "type")?;
						text_target = Some("checksum");
					},
					"provides" => dep_section = Some("provides"),
					"requires" => dep_section = Some("requires"),
					"conflicts" => dep_section = Some("conflicts"),
					_ => {},
				}
			},
			Event::Empty(ref e) => {
				let local = local_name(e.name());
				let Some(pkg) = current.as_mut() else { continue };
				match local.as_str() {
					"version" => {
						let ver = attr_value(e, "ver")?.unwrap_or_default();
						let rel = attr_value(e, "rel")?;
						pkg.version = match rel {
							Some(rel) => format!("{ver}-{rel}"),
							None => ver,
						};
					},
					"location" => {
						if let Some(href) = attr_value(e, "href")? {
							pkg.location = href;
						}
					},
					"entry" => {
						if let (Some(section), Some(expr)) = (dep_section, render_entry(e)?) {
							match section {
								"provides" => pkg.provides.push(expr),
								"requires" => pkg.requires.push(expr),
								"conflicts" => pkg.conflicts.push(expr),
								_ => {},
							}
						}
					},
					_ => {},
				}
			},
			Event::Text(ref e) => {
				if let (Some(target), Some(pkg)) = (text_target.take(), current.as_mut()) {
					let text = e.unescape()?.to_string();
					match target {
						"name" => pkg.name = text,
						"arch" => pkg.arch = text,
						"checksum" => {
							let algo = ChecksumAlgo::parse(
								checksum_algo.as_deref().unwrap_or("sha256"),
							)?;
							pkg.checksum = Some(Checksum::new(algo, text));
						},
						_ => {},
					}
				}
			},
			Event::End(ref e) => {
				let local = local_name(e.name());
				match local.as_str() {
					"package" => {
						if let Some(builder) = current.take() {
							packages.push(builder.finish(repo, repo_index)?);
						}
					},
					"provides" | "requires" | "conflicts" => dep_section = None,
					_ => {},
				}
			},
			Event::Eof => break,
			_ => {},
		}
	}

	trace!(count = packages.len(), repo = repo.name.as_str(), "parsed primary metadata");
	Ok(packages)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn repo() -> RepoConfig {
		RepoConfig {
			name: "base".to_owned(),
			section: String::new(),
			base_url: "https://repo.invalid/emt/3.0/$basearch".to_owned(),
			package_list_url: None,
			package_prefix_url: None,
			gpg_key_url: None,
			release_urls: vec![],
			arch: "x86_64".to_owned(),
			enabled: true,
			build_path: None,
		}
	}

	const REPOMD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<repomd xmlns="http://linux.duke.edu/metadata/repo">
  <data type="filelists">
    <location href="repodata/filelists.xml.gz"/>
  </data>
  <data type="primary">
    <checksum type="sha256">aabbcc</checksum>
    <location href="repodata/primary.xml.zst"/>
  </data>
</repomd>"#;

	const PRIMARY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<metadata xmlns="http://linux.duke.edu/metadata/common" xmlns:rpm="http://linux.duke.edu/metadata/rpm" packages="2">
  <package type="rpm">
    <name>bash</name>
    <arch>x86_64</arch>
    <version epoch="0" ver="5.2.15" rel="1.emt3"/>
    <checksum type="sha256" pkgid="YES">1111111111111111111111111111111111111111111111111111111111111111</checksum>
    <location href="x86_64/bash-5.2.15-1.emt3.x86_64.rpm"/>
    <format>
      <rpm:provides>
        <rpm:entry name="bash"/>
        <rpm:entry name="/bin/sh"/>
      </rpm:provides>
      <rpm:requires>
        <rpm:entry name="libc" flags="GE" ver="2"/>
        <rpm:entry name="libtinfo.so.6()(64bit)"/>
      </rpm:requires>
    </format>
  </package>
  <package type="rpm">
    <name>glibc</name>
    <arch>x86_64</arch>
    <version epoch="0" ver="2.38" rel="3.emt3"/>
    <checksum type="sha256" pkgid="YES">2222222222222222222222222222222222222222222222222222222222222222</checksum>
    <location href="x86_64/glibc-2.38-3.emt3.x86_64.rpm"/>
    <format>
      <rpm:provides>
        <rpm:entry name="glibc"/>
        <rpm:entry name="libc" flags="EQ" ver="2.38"/>
        <rpm:entry name="libc.so.6()(64bit)"/>
      </rpm:provides>
      <rpm:conflicts>
        <rpm:entry name="musl"/>
      </rpm:conflicts>
    </format>
  </package>
</metadata>"#;

	#[test]
	fn primary_href_located() {
		assert_eq!(find_primary_href(REPOMD).unwrap(), "repodata/primary.xml.zst");
	}

	#[test]
	fn primary_href_missing_is_error() {
		assert!(find_primary_href("<repomd></repomd>").is_err());
	}

	#[test]
	fn parses_packages_with_format_block() {
		let pkgs = parse_primary(PRIMARY, &repo(), 0).unwrap();
		assert_eq!(pkgs.len(), 2);

		let bash = &pkgs[0];
		assert_eq!(bash.name, "bash");
		assert_eq!(bash.version, "5.2.15-1.emt3");
		assert_eq!(bash.filename, "bash-5.2.15-1.emt3.x86_64.rpm");
		assert_eq!(
			bash.download_url,
			"https://repo.invalid/emt/3.0/x86_64/x86_64/bash-5.2.15-1.emt3.x86_64.rpm"
		);
		assert_eq!(bash.requires, vec!["libc >= 2", "libtinfo.so.6()(64bit)"]);
		assert!(bash.provides.contains(&"/bin/sh".to_owned()));

		let glibc = &pkgs[1];
		assert_eq!(glibc.provides[1], "libc = 2.38");
		assert_eq!(glibc.conflicts, vec!["musl"]);
		assert_eq!(glibc.checksum.digest, "2".repeat(64));
	}
}
