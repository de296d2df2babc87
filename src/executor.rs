//! The single seam through which every subprocess is run.
//!
//! The rest of the composer never touches [`std::process::Command`] directly;
//! it builds an [`Invocation`] and hands it to an [`Executor`]. The host
//! implementation shells out, the mock matches pattern lists and returns
//! canned output so the whole pipeline can run under test.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;

use color_eyre::Result;
use tracing::{debug, info, warn};

use crate::error::ComposerError;

/// Captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
	pub stdout: String,
	pub stderr: String,
}

/// A fully-described command line, shell-expanded via `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
	pub cmdline: String,
	pub elevated: bool,
	pub chroot: Option<PathBuf>,
	pub workdir: Option<PathBuf>,
	pub env: Vec<(String, String)>,
}

impl Invocation {
	pub fn new(cmdline: impl Into<String>) -> Self {
		Self { cmdline: cmdline.into(), ..Self::default() }
	}

	#[must_use]
	pub fn elevated(mut self) -> Self {
		self.elevated = true;
		self
	}

	/// Enter `root` with `chroot(2)` before running the command line.
	#[must_use]
	pub fn in_chroot(mut self, root: &Path) -> Self {
		self.chroot = Some(root.to_path_buf());
		self
	}

	#[must_use]
	pub fn workdir(mut self, dir: &Path) -> Self {
		self.workdir = Some(dir.to_path_buf());
		self
	}

	#[must_use]
	pub fn env(mut self, key: &str, value: &str) -> Self {
		self.env.push((key.to_owned(), value.to_owned()));
		self
	}

	/// Program + argument vector this invocation expands to.
	fn argv(&self) -> Vec<String> {
		let mut argv = Vec::new();
		if self.elevated {
			argv.push("sudo".to_owned());
			argv.push("-E".to_owned());
		}
		if let Some(root) = &self.chroot {
			argv.push("chroot".to_owned());
			argv.push(root.display().to_string());
		}
		argv.push("sh".to_owned());
		argv.push("-c".to_owned());
		argv.push(self.cmdline.clone());
		argv
	}
}

pub trait Executor: Send + Sync {
	/// Run with stdout/stderr captured. Non-zero exit is an error carrying
	/// the command line and both streams.
	fn run(&self, inv: &Invocation) -> Result<ExecOutput>;

	/// Same semantics as [`Executor::run`] but child output is forwarded to
	/// the logger line by line while the command executes.
	fn run_stream(&self, inv: &Invocation) -> Result<()>;

	/// Whether `name` resolves to an executable, on the host or under `root`.
	fn is_command_present(&self, name: &str, root: Option<&Path>) -> bool;
}

/// Executor backed by the host's `sh`.
#[derive(Debug, Default)]
pub struct HostExecutor;

impl HostExecutor {
	fn command(inv: &Invocation) -> Command {
		let argv = inv.argv();
		let mut cmd = Command::new(&argv[0]);
		cmd.args(&argv[1..]);
		if let Some(dir) = &inv.workdir {
			cmd.current_dir(dir);
		}
		for (k, v) in &inv.env {
			cmd.env(k, v);
		}
		cmd
	}
}

impl Executor for HostExecutor {
	fn run(&self, inv: &Invocation) -> Result<ExecOutput> {
		debug!(cmd = %inv.cmdline, elevated = inv.elevated, "exec");
		let out = Self::command(inv).output()?;
		let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
		let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
		if out.status.success() {
			Ok(ExecOutput { stdout, stderr })
		} else {
			Err(ComposerError::SubprocessFailed {
				cmdline: inv.cmdline.clone(),
				status: out.status.code().unwrap_or(-1),
				stdout,
				stderr,
			}
			.into())
		}
	}

	fn run_stream(&self, inv: &Invocation) -> Result<()> {
		debug!(cmd = %inv.cmdline, elevated = inv.elevated, "exec (streamed)");
		let mut child =
			Self::command(inv).stdout(Stdio::piped()).stderr(Stdio::piped()).spawn()?;

		// Drain both pipes concurrently so the child can't block on a full one.
		let stdout = child.stdout.take();
		let stderr = child.stderr.take();
		let err_thread = std::thread::spawn(move || {
			if let Some(stderr) = stderr {
				for line in BufReader::new(stderr).lines().map_while(std::io::Result::ok) {
					warn!(target: "subprocess", "{line}");
				}
			}
		});
		if let Some(stdout) = stdout {
			for line in BufReader::new(stdout).lines().map_while(std::io::Result::ok) {
				info!(target: "subprocess", "{line}");
			}
		}
		let _ = err_thread.join();

		let status = child.wait()?;
		if status.success() {
			Ok(())
		} else {
			Err(ComposerError::SubprocessFailed {
				cmdline: inv.cmdline.clone(),
				status: status.code().unwrap_or(-1),
				stdout: String::new(),
				stderr: String::new(),
			}
			.into())
		}
	}

	fn is_command_present(&self, name: &str, root: Option<&Path>) -> bool {
		match root {
			Some(root) => ["usr/bin", "usr/sbin", "bin", "sbin"]
				.iter()
				.any(|dir| root.join(dir).join(name).exists()),
			None => Command::new("sh")
				.args(["-c", &format!("command -v {name}")])
				.stdout(Stdio::null())
				.stderr(Stdio::null())
				.status()
				.map(|s| s.success())
				.unwrap_or(false),
		}
	}
}

/// Canned reply for one mock rule.
#[derive(Debug, Clone, Default)]
pub struct MockResponse {
	pub stdout: String,
	pub stderr: String,
	pub status: i32,
}

impl MockResponse {
	pub fn ok(stdout: impl Into<String>) -> Self {
		Self { stdout: stdout.into(), ..Self::default() }
	}

	pub fn fail(status: i32, stderr: impl Into<String>) -> Self {
		Self { stderr: stderr.into(), status, ..Self::default() }
	}
}

struct MockRule {
	pattern: String,
	response: MockResponse,
	reusable: bool,
	used: bool,
}

/// Pattern-matching executor for tests.
///
/// Rules are consulted in registration order; the first unconsumed rule whose
/// pattern is a substring of the command line wins. An unmatched command
/// succeeds with empty output unless the mock is strict.
#[derive(Default)]
pub struct MockExecutor {
	rules: Mutex<Vec<MockRule>>,
	calls: Mutex<Vec<Invocation>>,
	strict: bool,
	absent_commands: Vec<String>,
}

impl MockExecutor {
	pub fn new() -> Self {
		Self::default()
	}

	/// Fail any invocation that no rule matches.
	#[must_use]
	pub fn strict(mut self) -> Self {
		self.strict = true;
		self
	}

	#[must_use]
	pub fn without_command(mut self, name: &str) -> Self {
		self.absent_commands.push(name.to_owned());
		self
	}

	/// One-shot rule, consumed by its first match.
	pub fn expect(&self, pattern: &str, response: MockResponse) {
		self.rules.lock().unwrap().push(MockRule {
			pattern: pattern.to_owned(),
			response,
			reusable: false,
			used: false,
		});
	}

	/// Reusable rule, matched any number of times.
	pub fn stub(&self, pattern: &str, response: MockResponse) {
		self.rules.lock().unwrap().push(MockRule {
			pattern: pattern.to_owned(),
			response,
			reusable: true,
			used: false,
		});
	}

	/// Every command line seen so far, in order.
	pub fn calls(&self) -> Vec<String> {
		self.calls.lock().unwrap().iter().map(|i| i.cmdline.clone()).collect()
	}

	pub fn calls_matching(&self, pattern: &str) -> Vec<String> {
		self.calls().into_iter().filter(|c| c.contains(pattern)).collect()
	}

	fn respond(&self, inv: &Invocation) -> Result<ExecOutput> {
		self.calls.lock().unwrap().push(inv.clone());
		let mut rules = self.rules.lock().unwrap();
		let hit = rules
			.iter_mut()
			.find(|r| (!r.used || r.reusable) && inv.cmdline.contains(&r.pattern));
		let response = match hit {
			Some(rule) => {
				rule.used = true;
				rule.response.clone()
			},
			None if self.strict => {
				return Err(ComposerError::SubprocessFailed {
					cmdline: inv.cmdline.clone(),
					status: 127,
					stdout: String::new(),
					stderr: "no mock rule matched".to_owned(),
				}
				.into())
			},
			None => MockResponse::default(),
		};
		if response.status == 0 {
			Ok(ExecOutput { stdout: response.stdout, stderr: response.stderr })
		} else {
			Err(ComposerError::SubprocessFailed {
				cmdline: inv.cmdline.clone(),
				status: response.status,
				stdout: response.stdout,
				stderr: response.stderr,
			}
			.into())
		}
	}
}

impl Executor for MockExecutor {
	fn run(&self, inv: &Invocation) -> Result<ExecOutput> {
		self.respond(inv)
	}

	fn run_stream(&self, inv: &Invocation) -> Result<()> {
		self.respond(inv).map(|_| ())
	}

	fn is_command_present(&self, name: &str, _root: Option<&Path>) -> bool {
		!self.absent_commands.iter().any(|c| c == name)
	}
}
