use std::ffi::OsStr;
use std::fmt;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, ScanError};

/// Launches headless browser processes.
#[async_trait]
pub trait BrowserDriver: Send + Sync + fmt::Debug {
    async fn launch(&self) -> Result<Box<dyn BrowserHandle>>;

    /// Whether handles from this driver can open scriptable pages.
    fn supports_pages(&self) -> bool {
        false
    }
}

/// One running browser process.
#[async_trait]
pub trait BrowserHandle: Send + Sync + fmt::Debug {
    /// Remote-debugging port the audit engine attaches to.
    fn port(&self) -> u16;

    async fn is_alive(&self) -> bool;

    async fn new_page(&self) -> Result<Box<dyn BrowserPage>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrowserPage: Send + Sync + fmt::Debug {
    async fn goto(&self, url: &str) -> Result<()>;

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;

    async fn close(&self) -> Result<()>;
}

/// Spawns Chrome/Chromium with `--headless` and a remote-debugging port.
///
/// Page scripting is left to the audit engine, so [`BrowserHandle::new_page`]
/// is unsupported here.
#[derive(Debug, Clone)]
pub struct ChromeProcessDriver {
    executable: PathBuf,
    extra_args: Vec<String>,
    launch_timeout: Duration,
}

const CHROME_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
];

/// First Chrome/Chromium executable found on `PATH`.
pub fn find_chrome() -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    let cwd = std::env::current_dir().ok()?;
    find_chrome_in(&paths, &cwd)
}

fn find_chrome_in(paths: &OsStr, cwd: &Path) -> Option<PathBuf> {
    CHROME_CANDIDATES
        .iter()
        .find_map(|name| which::which_in(name, Some(paths), cwd).ok())
}

impl ChromeProcessDriver {
    pub fn new(executable: Option<PathBuf>, extra_args: Vec<String>, launch_timeout: Duration) -> Self {
        let executable = executable
            .or_else(|| std::env::var_os("CHROME_PATH").map(PathBuf::from))
            .or_else(find_chrome)
            .unwrap_or_else(|| PathBuf::from(CHROME_CANDIDATES[0]));
        Self {
            executable,
            extra_args,
            launch_timeout,
        }
    }

    fn free_port() -> Result<u16> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        Ok(listener.local_addr()?.port())
    }

    async fn wait_for_port(&self, port: u16, child: &mut Child) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.launch_timeout;
        loop {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return Ok(());
            }
            if let Some(status) = child.try_wait()? {
                return Err(ScanError::BrowserCrash(format!(
                    "browser exited during launch with {status}"
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ScanError::BrowserCrash(format!(
                    "debugging port {port} not reachable after {:?}",
                    self.launch_timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[async_trait]
impl BrowserDriver for ChromeProcessDriver {
    async fn launch(&self) -> Result<Box<dyn BrowserHandle>> {
        let port = Self::free_port()?;
        let profile = tempfile::Builder::new().prefix("sitelens-chrome-").tempdir()?;

        let mut child = Command::new(&self.executable)
            .arg("--headless=new")
            .arg(format!("--remote-debugging-port={port}"))
            .arg(format!("--user-data-dir={}", profile.path().display()))
            .args(["--no-first-run", "--no-default-browser-check", "--disable-gpu"])
            .args(&self.extra_args)
            .arg("about:blank")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ScanError::BrowserCrash(format!(
                    "failed to spawn {}: {e}",
                    self.executable.display()
                ))
            })?;

        if let Err(err) = self.wait_for_port(port, &mut child).await {
            let _ = child.start_kill();
            return Err(err);
        }

        debug!(target: "scan::pool", port, pid = child.id(), "browser launched");
        Ok(Box::new(ChromeProcess {
            port,
            child: Mutex::new(Some(child)),
            _profile: profile,
        }))
    }
}

#[derive(Debug)]
struct ChromeProcess {
    port: u16,
    child: Mutex<Option<Child>>,
    _profile: tempfile::TempDir,
}

#[async_trait]
impl BrowserHandle for ChromeProcess {
    fn port(&self) -> u16 {
        self.port
    }

    async fn is_alive(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn new_page(&self) -> Result<Box<dyn BrowserPage>> {
        Err(ScanError::Unsupported(
            "chrome process driver does not script pages".into(),
        ))
    }

    async fn close(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        if let Err(err) = child.kill().await {
            warn!(target: "scan::pool", port = self.port, error = %err, "failed to kill browser");
            return Err(err.into());
        }
        Ok(())
    }
}
