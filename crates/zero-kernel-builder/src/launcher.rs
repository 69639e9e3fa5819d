use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use crate::error::{Error, Result};

/// Subprocess collaborator. The executor context implements it; tests
/// substitute a recorder.
pub trait Launcher {
    /// Run to completion; non-zero exit is an error.
    fn launch(&mut self, cmd: Command) -> Result<()>;
    /// Run to completion and return stdout.
    fn capture(&mut self, cmd: Command) -> Result<String>;
    fn log(&self, msg: &str);
}

/// Downloads a URL into a file.
pub trait Fetcher {
    fn fetch(&mut self, url: &str, dest: &Path) -> Result<()>;
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("zkb/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::resource(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&mut self, url: &str, dest: &Path) -> Result<()> {
        tracing::info!(%url, dest = %dest.display(), "download");
        let mut res = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::resource(format!("GET {url} failed: {e}")))?;
        if !res.status().is_success() {
            return Err(Error::resource(format!(
                "GET {url} failed with status {}",
                res.status()
            )));
        }

        // Stream into a sibling temp file so an interrupted download never leaves a
        // same-named archive behind.
        let dir = dest.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        res.copy_to(&mut tmp)
            .map_err(|e| Error::resource(format!("GET {url} failed while streaming: {e}")))?;
        tmp.persist(dest).map_err(|e| {
            Error::resource(format!("failed to persist {}: {}", dest.display(), e.error))
        })?;
        Ok(())
    }
}
