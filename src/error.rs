use std::path::PathBuf;

/// Typed failures surfaced by the composer core.
///
/// Everything else is reported through plain [`color_eyre::Report`]s; these
/// variants exist for the failures callers dispatch on (retry policy, cleanup
/// behavior) or that tests assert against.
#[derive(Debug, thiserror::Error)]
pub enum ComposerError {
	#[error("config file missing: {0}")]
	ConfigMissing(PathBuf),

	#[error("config invalid: {0}")]
	ConfigInvalid(String),

	#[error("no provider registered for target `{0}`")]
	ProviderNotFound(String),

	#[error("fetch failed for {url}: {reason}")]
	NetworkFetch { url: String, reason: String },

	#[error("signature verification failed for {0}")]
	SignatureMismatch(String),

	#[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
	ChecksumMismatch { file: String, expected: String, actual: String },

	#[error("dependency `{0}` has no provider in any configured repository")]
	ResolverUnsatisfied(String),

	#[error("command `{cmdline}` exited with {status}\nstderr: {stderr}")]
	SubprocessFailed { cmdline: String, status: i32, stdout: String, stderr: String },

	#[error("unmount of {0} failed after standard, lazy and force strategies")]
	MountStuck(PathBuf),

	#[error("path {path} escapes environment root {root}")]
	PathEscape { path: PathBuf, root: PathBuf },

	#[error("unknown compression format: {0}")]
	UnknownCompression(String),
}
