use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel config not found: {0}")]
    ConfigMissing(PathBuf),
    #[error("failed to start tunnel client: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("tunnel client exited before the interface came up ({0})")]
    ExitedEarly(String),
    #[error("interface did not come up within {0:?}")]
    Timeout(Duration),
}

/// One tunnel at a time: `connect` brings it up, `disconnect` tears it down.
#[async_trait]
pub trait Tunnel: Send {
    async fn connect(&mut self, config: &Path) -> Result<(), TunnelError>;
    /// Must be safe to call when nothing is connected.
    async fn disconnect(&mut self);
}

/// OpenVPN client driven as a child process in its own process group.
pub struct OpenVpnTunnel {
    program: String,
    username: String,
    password: String,
    interface: String,
    connect_timeout: Duration,
    grace: Duration,
    child: Option<Child>,
}

impl OpenVpnTunnel {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            program: "openvpn".to_string(),
            username: username.into(),
            password: password.into(),
            interface: "tun0".to_string(),
            connect_timeout: Duration::from_secs(30),
            grace: Duration::from_secs(5),
            child: None,
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn interface(mut self, name: impl Into<String>) -> Self {
        self.interface = name.into();
        self
    }

    async fn interface_up(&self) -> bool {
        let path = Path::new("/sys/class/net").join(&self.interface);
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    fn write_credentials(&self) -> std::io::Result<NamedTempFile> {
        // NamedTempFile is created 0600 on unix.
        let mut f = tempfile::Builder::new().prefix("vpn_auth_").tempfile()?;
        writeln!(f, "{}", self.username)?;
        writeln!(f, "{}", self.password)?;
        f.flush()?;
        Ok(f)
    }
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;
    if let Some(pid) = child.id() {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
            debug!(pid, error = %e, "killpg failed");
        }
    }
}

#[async_trait]
impl Tunnel for OpenVpnTunnel {
    async fn connect(&mut self, config: &Path) -> Result<(), TunnelError> {
        if self.child.is_some() {
            warn!("tunnel already up, disconnecting first");
            self.disconnect().await;
        }
        if !config.exists() {
            return Err(TunnelError::ConfigMissing(config.to_path_buf()));
        }

        // Lives until connect returns; the client reads it at startup.
        let creds = self.write_credentials()?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("--config")
            .arg(config)
            .arg("--auth-user-pass")
            .arg(creds.path())
            .args(["--dev", "tun"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        self.child = Some(child);
        debug!(config = %config.display(), "tunnel client started");

        let deadline = Instant::now() + self.connect_timeout;
        while Instant::now() < deadline {
            time::sleep(Duration::from_secs(1)).await;
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    self.child = None;
                    return Err(TunnelError::ExitedEarly(status.to_string()));
                }
            }
            if self.interface_up().await {
                info!(interface = %self.interface, "tunnel up");
                return Ok(());
            }
        }
        self.disconnect().await;
        Err(TunnelError::Timeout(self.connect_timeout))
    }

    async fn disconnect(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        #[cfg(unix)]
        signal_group(&child, nix::sys::signal::Signal::SIGTERM);
        #[cfg(not(unix))]
        let _ = child.start_kill();

        match time::timeout(self.grace, child.wait()).await {
            Ok(_) => debug!("tunnel client exited"),
            Err(_) => {
                warn!("tunnel client ignored SIGTERM, killing");
                #[cfg(unix)]
                signal_group(&child, nix::sys::signal::Signal::SIGKILL);
                let _ = child.kill().await;
            }
        }
    }
}
