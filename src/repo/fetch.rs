//! Blocking HTTP layer with bounded retry for transient failures.
//!
//! Integrity failures (checksums, signatures) are never retried here or
//! anywhere else; only the transport is.

use std::path::Path;
use std::time::Duration;

use color_eyre::Result;
use tracing::{debug, warn};

use crate::error::ComposerError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct Fetcher {
	client: reqwest::blocking::Client,
	retries: u32,
}

impl Fetcher {
	pub fn new() -> Result<Self> {
		Self::with_retries(3)
	}

	pub fn with_retries(retries: u32) -> Result<Self> {
		let client = reqwest::blocking::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
		Ok(Self { client, retries })
	}

	fn attempt<T>(
		&self, url: &str, op: impl Fn(&reqwest::blocking::Client) -> Result<T, String>,
	) -> Result<T> {
		let mut last_err = String::new();
		for attempt in 0..=self.retries {
			if attempt > 0 {
				warn!(url, attempt, "retrying fetch");
				std::thread::sleep(RETRY_DELAY);
			}
			match op(&self.client) {
				Ok(value) => return Ok(value),
				Err(e) => last_err = e,
			}
		}
		Err(ComposerError::NetworkFetch { url: url.to_owned(), reason: last_err }.into())
	}

	pub fn get_text(&self, url: &str) -> Result<String> {
		debug!(url, "fetching text");
		self.attempt(url, |c| {
			c.get(url)
				.send()
				.and_then(|r| r.error_for_status())
				.and_then(|r| r.text())
				.map_err(|e| e.to_string())
		})
	}

	pub fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
		debug!(url, "fetching bytes");
		self.attempt(url, |c| {
			c.get(url)
				.send()
				.and_then(|r| r.error_for_status())
				.and_then(|r| r.bytes())
				.map(|b| b.to_vec())
				.map_err(|e| e.to_string())
		})
	}

	/// Stream `url` into `dest`, returning the number of bytes written.
	pub fn get_to_file(&self, url: &str, dest: &Path) -> Result<u64> {
		debug!(url, ?dest, "fetching to file");
		self.attempt(url, |c| {
			let mut resp = c
				.get(url)
				.send()
				.and_then(reqwest::blocking::Response::error_for_status)
				.map_err(|e| e.to_string())?;
			let mut file = std::fs::File::create(dest).map_err(|e| e.to_string())?;
			resp.copy_to(&mut file).map_err(|e| e.to_string())
		})
	}
}
