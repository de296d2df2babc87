//! Transitive dependency closure over the indexed repo catalog.
//!
//! Output order is deterministic: dependencies precede their dependents, and
//! every candidate choice is broken by (repo priority, highest version,
//! filename). Cycles are legal in package metadata and terminate through the
//! visited set.

use std::collections::HashSet;
use std::path::Path;

use color_eyre::Result;
use indexmap::IndexSet;
use petgraph::graph::DiGraph;
use petgraph::visit::EdgeRef;
use tracing::{debug, trace, warn};

use crate::error::ComposerError;
use crate::repo::{Catalog, PackageInfo};
use crate::util::just_write;

/// Result of a closure run: the install-ordered package list plus the
/// dependency edges traversed (for diagnostics).
#[derive(Debug, Default)]
pub struct Resolution {
	pub ordered: Vec<PackageInfo>,
	pub edges: IndexSet<(String, String)>,
}

pub struct Resolver<'a> {
	catalog: &'a Catalog,
	/// Names satisfied by the rootfs-essential baseline.
	baseline: HashSet<String>,
}

/// Leading name token of a dependency expression:
/// `libc6 (>= 2.38)` → `libc6`, `libtinfo.so.6()(64bit)` → `libtinfo.so.6`.
pub fn dep_name(expr: &str) -> &str {
	expr.split_whitespace()
		.next()
		.map(|t| {
			let paren = t.find('(');
			match paren {
				Some(0) => t, // file-like deps such as `(something)` stay whole
				Some(i) => &t[..i],
				None => t,
			}
		})
		.unwrap_or("")
}

/// Dependencies the package manager satisfies internally.
fn is_implicit(name: &str) -> bool {
	name.starts_with("rpmlib(") || name.starts_with("config(")
}

impl<'a> Resolver<'a> {
	pub fn new(catalog: &'a Catalog) -> Self {
		Self { catalog, baseline: HashSet::new() }
	}

	#[must_use]
	pub fn with_baseline(mut self, names: &[String]) -> Self {
		self.baseline.extend(names.iter().cloned());
		self
	}

	/// Best candidate for `name`: exact match, then virtual provides, then
	/// versioned-name prefix families. Ties break by repo index, then
	/// highest lexicographic version, then filename.
	fn pick_candidate(&self, name: &str) -> Option<usize> {
		let exact = self.catalog.named(name);
		let candidates: Vec<usize> = if !exact.is_empty() {
			exact.to_vec()
		} else {
			let virt = self.catalog.providers_of(name);
			if virt.is_empty() {
				self.catalog.named_with_prefix(name)
			} else {
				virt.to_vec()
			}
		};

		candidates.into_iter().min_by(|&a, &b| {
			let (pa, pb) = (self.catalog.get(a), self.catalog.get(b));
			pa.repo_index
				.cmp(&pb.repo_index)
				.then(pb.version.cmp(&pa.version))
				.then(pa.filename.cmp(&pb.filename))
		})
	}

	/// Close over the requested names. Requesting an unavailable package is
	/// a warning, not an error; an unsatisfiable dependency of a selected
	/// package is fatal.
	pub fn resolve(&self, requests: &[String]) -> Result<Resolution> {
		let mut state = ResolveState::default();
		for request in requests {
			let name = dep_name(request);
			match self.pick_candidate(name) {
				Some(idx) => self.visit(idx, &mut state)?,
				None => warn!(package = request.as_str(), "requested package not available, skipping"),
			}
		}
		debug!(requested = requests.len(), selected = state.order.len(), "resolution complete");
		Ok(Resolution {
			ordered: state.order.iter().map(|&i| self.catalog.get(i).clone()).collect(),
			edges: state.edges,
		})
	}

	fn visit(&self, idx: usize, state: &mut ResolveState) -> Result<()> {
		if state.selected.contains(&idx) || state.visiting.contains(&idx) {
			return Ok(());
		}
		let pkg = self.catalog.get(idx);
		// identity is the filename: a synthetic alias of an already-selected
		// artifact marks its names satisfied without re-adding the file
		if state.selected_files.contains(&pkg.filename) {
			state.selected.insert(idx);
			Self::mark_satisfied(pkg, state);
			return Ok(());
		}
		state.visiting.insert(idx);
		trace!(package = pkg.name.as_str(), "selecting");

		for expr in &pkg.requires {
			self.satisfy(pkg, expr, state)?;
		}

		state.visiting.remove(&idx);
		state.selected.insert(idx);
		state.selected_files.insert(pkg.filename.clone());
		state.order.push(idx);
		Self::mark_satisfied(pkg, state);
		Ok(())
	}

	fn mark_satisfied(pkg: &PackageInfo, state: &mut ResolveState) {
		state.satisfied.insert(pkg.name.clone());
		for provide in &pkg.provides {
			state.satisfied.insert(dep_name(provide).to_owned());
		}
	}

	fn satisfy(&self, pkg: &PackageInfo, expr: &str, state: &mut ResolveState) -> Result<()> {
		// alternative groups (`a | b`): first resolvable branch wins
		for alt in expr.split('|') {
			let name = dep_name(alt);
			if name.is_empty() || is_implicit(name) {
				return Ok(());
			}
			if self.baseline.contains(name) {
				return Ok(());
			}
			if state.satisfied.contains(name) {
				state.edges.insert((pkg.name.clone(), name.to_owned()));
				return Ok(());
			}
			if let Some(dep_idx) = self.pick_candidate(name) {
				state.edges.insert((pkg.name.clone(), name.to_owned()));
				// a dependency already being visited is a cycle; the edge is
				// recorded and the membership check above ends the walk
				return self.visit(dep_idx, state);
			}
		}
		Err(ComposerError::ResolverUnsatisfied(format!("{expr} (required by {})", pkg.name)).into())
	}
}

#[derive(Default)]
struct ResolveState {
	order: Vec<usize>,
	selected: IndexSet<usize>,
	selected_files: HashSet<String>,
	visiting: IndexSet<usize>,
	satisfied: HashSet<String>,
	edges: IndexSet<(String, String)>,
}

/// Write the traversed dependency edges as a DOT graph.
pub fn write_dot(resolution: &Resolution, path: &Path) -> Result<()> {
	let mut graph = DiGraph::<String, ()>::new();
	let mut nodes = indexmap::IndexMap::new();
	for (from, to) in &resolution.edges {
		let f = *nodes
			.entry(from.clone())
			.or_insert_with(|| graph.add_node(from.clone()));
		let t = *nodes.entry(to.clone()).or_insert_with(|| graph.add_node(to.clone()));
		graph.add_edge(f, t, ());
	}

	let mut out = String::from("digraph chrootpkgs {\n");
	for edge in graph.edge_references() {
		out.push_str(&format!(
			"    \"{}\" -> \"{}\";\n",
			graph[edge.source()],
			graph[edge.target()]
		));
	}
	out.push_str("}\n");
	just_write(path, out)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::repo::{test_package, Catalog};

	fn catalog_bash_glibc() -> Catalog {
		let mut bash = test_package("bash", "5.2");
		bash.requires = vec!["libc >= 2".to_owned()];
		let mut glibc = test_package("glibc", "2.38");
		glibc.provides = vec!["libc = 2.38".to_owned()];
		Catalog::index(vec![bash, glibc])
	}

	#[test]
	fn seed_bash_resolves_glibc_first() {
		let catalog = catalog_bash_glibc();
		let resolver = Resolver::new(&catalog);
		let res = resolver.resolve(&["bash".to_owned()]).unwrap();

		let names: Vec<_> = res.ordered.iter().map(|p| p.name.as_str()).collect();
		assert_eq!(names, vec!["glibc", "bash"]);
		assert!(res.edges.contains(&("bash".to_owned(), "libc".to_owned())));
	}

	#[test]
	fn dot_file_contains_traversed_edge() {
		let catalog = catalog_bash_glibc();
		let res = Resolver::new(&catalog).resolve(&["bash".to_owned()]).unwrap();

		let dir = tempfile::tempdir().unwrap();
		let dot = dir.path().join("chrootpkgs.dot");
		write_dot(&res, &dot).unwrap();
		let text = std::fs::read_to_string(&dot).unwrap();
		assert!(text.contains("\"bash\" -> \"libc\""));
	}

	#[test]
	fn resolution_is_deterministic() {
		let catalog = catalog_bash_glibc();
		let resolver = Resolver::new(&catalog);
		let a = resolver.resolve(&["bash".to_owned(), "glibc".to_owned()]).unwrap();
		let b = resolver.resolve(&["bash".to_owned(), "glibc".to_owned()]).unwrap();
		let names = |r: &Resolution| r.ordered.iter().map(|p| p.filename.clone()).collect::<Vec<_>>();
		assert_eq!(names(&a), names(&b));
	}

	#[test]
	fn closure_property_holds() {
		let mut a = test_package("a", "1");
		a.requires = vec!["b".to_owned(), "virt-c".to_owned()];
		let b = test_package("b", "1");
		let mut c = test_package("c", "1");
		c.provides = vec!["virt-c".to_owned()];
		let catalog = Catalog::index(vec![a, b, c]);

		let res = Resolver::new(&catalog).resolve(&["a".to_owned()]).unwrap();
		let satisfied: std::collections::HashSet<String> = res
			.ordered
			.iter()
			.flat_map(|p| {
				std::iter::once(p.name.clone()).chain(p.provides.iter().map(|s| dep_name(s).to_owned()))
			})
			.collect();
		for pkg in &res.ordered {
			for req in &pkg.requires {
				assert!(satisfied.contains(dep_name(req)), "unsatisfied: {req}");
			}
		}
	}

	#[test]
	fn unavailable_request_is_skipped() {
		let catalog = catalog_bash_glibc();
		let res = Resolver::new(&catalog)
			.resolve(&["bash".to_owned(), "no-such-package".to_owned()])
			.unwrap();
		assert_eq!(res.ordered.len(), 2);
	}

	#[test]
	fn unsatisfiable_dependency_is_fatal() {
		let mut broken = test_package("broken", "1");
		broken.requires = vec!["missing-lib".to_owned()];
		let catalog = Catalog::index(vec![broken]);
		let err = Resolver::new(&catalog).resolve(&["broken".to_owned()]).unwrap_err();
		assert!(matches!(
			err.downcast_ref::<ComposerError>(),
			Some(ComposerError::ResolverUnsatisfied(_))
		));
	}

	#[test]
	fn baseline_satisfies_without_selection() {
		let mut bash = test_package("bash", "5.2");
		bash.requires = vec!["libc >= 2".to_owned()];
		let catalog = Catalog::index(vec![bash]);
		let res = Resolver::new(&catalog)
			.with_baseline(&["libc".to_owned()])
			.resolve(&["bash".to_owned()])
			.unwrap();
		assert_eq!(res.ordered.len(), 1);
	}

	#[test]
	fn cycles_terminate() {
		let mut ping = test_package("ping", "1");
		ping.requires = vec!["pong".to_owned()];
		let mut pong = test_package("pong", "1");
		pong.requires = vec!["ping".to_owned()];
		let catalog = Catalog::index(vec![ping, pong]);

		let res = Resolver::new(&catalog).resolve(&["ping".to_owned()]).unwrap();
		assert_eq!(res.ordered.len(), 2);
	}

	#[test]
	fn alternatives_take_first_resolvable() {
		let mut tool = test_package("tool", "1");
		tool.requires = vec!["absent | fallback".to_owned()];
		let fallback = test_package("fallback", "1");
		let catalog = Catalog::index(vec![tool, fallback]);

		let res = Resolver::new(&catalog).resolve(&["tool".to_owned()]).unwrap();
		let names: Vec<_> = res.ordered.iter().map(|p| p.name.as_str()).collect();
		assert_eq!(names, vec!["fallback", "tool"]);
	}

	#[test]
	fn repo_priority_breaks_ties() {
		let mut from_primary = test_package("zlib", "1.2");
		from_primary.repo_index = 0;
		from_primary.filename = "zlib-1.2.primary.rpm".to_owned();
		let mut from_extra = test_package("zlib", "1.3");
		from_extra.repo_index = 1;
		from_extra.filename = "zlib-1.3.extra.rpm".to_owned();
		let catalog = Catalog::index(vec![from_extra, from_primary]);

		let res = Resolver::new(&catalog).resolve(&["zlib".to_owned()]).unwrap();
		assert_eq!(res.ordered[0].filename, "zlib-1.2.primary.rpm");
	}

	#[test]
	fn higher_version_wins_within_a_repo() {
		let old = test_package("kernel", "6.5");
		let new = test_package("kernel", "6.6");
		let catalog = Catalog::index(vec![old, new]);
		let res = Resolver::new(&catalog).resolve(&["kernel".to_owned()]).unwrap();
		assert_eq!(res.ordered[0].version, "6.6");
	}

	#[test]
	fn virtual_alias_never_duplicates_its_artifact() {
		// a synthetic `sh` record carrying bash's filename and requires,
		// the way the DEB parser emits virtual Provides
		let mut bash = test_package("bash", "5.2");
		bash.requires = vec!["libc >= 2".to_owned()];
		let mut sh = bash.clone();
		sh.name = "sh".to_owned();
		sh.provides = Vec::new();
		let mut glibc = test_package("glibc", "2.38");
		glibc.provides = vec!["libc".to_owned()];
		let catalog = Catalog::index(vec![bash.clone(), sh, glibc]);

		let res = Resolver::new(&catalog)
			.resolve(&["sh".to_owned(), "bash".to_owned()])
			.unwrap();
		let files: Vec<_> = res.ordered.iter().map(|p| p.filename.as_str()).collect();
		// the alias resolved bash's closure; requesting bash again adds nothing
		assert_eq!(files.len(), 2);
		assert_eq!(files.iter().filter(|f| **f == bash.filename).count(), 1);
	}

	#[test]
	fn versioned_name_prefix_match() {
		let lib = test_package("libfoo-1", "1.9");
		let catalog = Catalog::index(vec![lib]);
		let res = Resolver::new(&catalog).resolve(&["libfoo".to_owned()]).unwrap();
		assert_eq!(res.ordered.len(), 1);
		assert_eq!(res.ordered[0].name, "libfoo-1");
	}
}
