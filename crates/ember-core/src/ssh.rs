//! Interactive SSH sessions into a guest.
//!
//! One blocking loop owns both the local terminal and the remote channel,
//! alternating short non-blocking reads on each. The local terminal is put
//! in raw mode for the session and restored when the guard drops.

use crate::error::{CoreError, Result};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{self, SetArg, Termios};
use ssh2::Session;
use std::io::{self, Read, Stdin, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsFd, AsRawFd};
use std::path::PathBuf;
use std::time::Duration;

/// Interval for each side of the relay loop.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// User and private key for a guest login.
#[derive(Debug, Clone)]
pub struct SshCredentials {
    pub user: String,
    pub key_path: PathBuf,
}

/// Retry bounds for the initial TCP connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Call `connect` until it succeeds, retrying only refused connections.
pub fn retry_connect<T>(
    policy: RetryPolicy,
    mut connect: impl FnMut() -> io::Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match connect() {
            Ok(conn) => return Ok(conn),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused && attempt < policy.attempts => {
                tracing::debug!(attempt, error = %e, "SSH connection refused, retrying");
                std::thread::sleep(policy.delay);
            }
            Err(e) => {
                return Err(CoreError::Ssh(format!(
                    "unable to connect after {attempt} attempts: {e}"
                )))
            }
        }
    }
}

/// The remote half of a session.
pub trait RemoteChannel {
    /// Non-blocking read; `WouldBlock` when nothing is pending.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    /// Remote side has sent EOF or an exit status.
    fn is_closed(&self) -> bool;
}

/// The local input half of a session.
pub trait LocalInput {
    /// Wait up to `timeout` for input. `Ok(None)` if nothing arrived,
    /// `Ok(Some(0))` once the input is closed.
    fn poll_read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;
}

/// Why a relay loop finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    RemoteClosed,
    LocalClosed,
}

/// Pump data between `input`/`output` and `channel` until either side closes.
pub fn relay(
    channel: &mut dyn RemoteChannel,
    input: &mut dyn LocalInput,
    output: &mut dyn Write,
) -> io::Result<RelayEnd> {
    let mut buf = [0u8; 1024];
    loop {
        if channel.is_closed() {
            return Ok(RelayEnd::RemoteClosed);
        }

        match channel.read(&mut buf) {
            Ok(0) => {
                if channel.is_closed() {
                    return Ok(RelayEnd::RemoteClosed);
                }
            }
            Ok(n) => {
                output.write_all(&buf[..n])?;
                output.flush()?;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        match input.poll_read(&mut buf, POLL_INTERVAL)? {
            Some(0) => return Ok(RelayEnd::LocalClosed),
            Some(n) => channel.write_all(&buf[..n])?,
            None => {}
        }
    }
}

/// Raw mode on stdin, restored on drop.
pub struct RawTerminal {
    stdin: Stdin,
    original: Termios,
}

impl RawTerminal {
    /// `None` if stdin is not a terminal.
    pub fn enable() -> Option<Self> {
        let stdin = io::stdin();
        let original = termios::tcgetattr(&stdin).ok()?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&stdin, SetArg::TCSADRAIN, &raw).ok()?;
        Some(Self { stdin, original })
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        if let Err(e) = termios::tcsetattr(&self.stdin, SetArg::TCSADRAIN, &self.original) {
            tracing::warn!(error = %e, "Failed to restore terminal mode");
        }
    }
}

/// Stdin polled with `poll(2)`.
pub struct StdinInput {
    stdin: Stdin,
}

impl StdinInput {
    pub fn new() -> Self {
        Self { stdin: io::stdin() }
    }
}

impl Default for StdinInput {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalInput for StdinInput {
    fn poll_read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let ready = {
            let mut fds = [PollFd::new(self.stdin.as_fd(), PollFlags::POLLIN)];
            poll(&mut fds, PollTimeout::from(millis)).map_err(io::Error::from)?
        };
        if ready == 0 {
            return Ok(None);
        }
        let n = nix::unistd::read(self.stdin.as_raw_fd(), buf).map_err(io::Error::from)?;
        Ok(Some(n))
    }
}

/// An `ssh2` shell channel in non-blocking mode.
pub struct Ssh2Channel {
    session: Session,
    channel: ssh2::Channel,
}

impl std::fmt::Debug for Ssh2Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ssh2Channel").finish_non_exhaustive()
    }
}

impl RemoteChannel for Ssh2Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.read(buf)
    }

    fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            match self.channel.write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.channel.eof()
    }
}

impl Ssh2Channel {
    fn close(mut self) {
        self.session.set_blocking(true);
        if let Err(e) = self.channel.close() {
            tracing::debug!(error = %e, "Failed to close SSH channel");
        }
        if let Err(e) = self.session.disconnect(None, "session closed", None) {
            tracing::debug!(error = %e, "Failed to disconnect SSH session");
        }
    }
}

fn ssh_err(context: &str) -> impl FnOnce(ssh2::Error) -> CoreError + '_ {
    move |e| CoreError::Ssh(format!("{context}: {e}"))
}

/// Log in to `addr` and open an interactive shell channel.
pub fn open_shell(addr: SocketAddr, credentials: &SshCredentials, retry: RetryPolicy) -> Result<Ssh2Channel> {
    if !credentials.key_path.is_file() {
        return Err(CoreError::Ssh(format!(
            "SSH key file not found: {}",
            credentials.key_path.display()
        )));
    }

    let tcp = retry_connect(retry, || TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT))?;

    let mut session = Session::new().map_err(ssh_err("failed to create session"))?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(ssh_err("handshake failed"))?;
    session
        .userauth_pubkey_file(&credentials.user, None, &credentials.key_path, None)
        .map_err(ssh_err("authentication failed"))?;

    let mut channel = session
        .channel_session()
        .map_err(ssh_err("failed to open channel"))?;
    channel
        .request_pty("xterm", None, None)
        .map_err(ssh_err("failed to request pty"))?;
    channel.shell().map_err(ssh_err("failed to start shell"))?;

    session.set_blocking(false);
    tracing::info!(%addr, user = %credentials.user, "SSH shell opened");
    Ok(Ssh2Channel { session, channel })
}

/// Run an interactive shell on `addr` bound to this process's terminal.
///
/// Blocks until the remote shell exits or local input closes.
pub fn interactive_shell(addr: SocketAddr, credentials: &SshCredentials, retry: RetryPolicy) -> Result<RelayEnd> {
    let mut channel = open_shell(addr, credentials, retry)?;

    let outcome = {
        let _raw = RawTerminal::enable();
        let mut input = StdinInput::new();
        let mut stdout = io::stdout();
        relay(&mut channel, &mut input, &mut stdout)
    };

    channel.close();
    match outcome {
        Ok(end) => {
            tracing::debug!(?end, "SSH session ended");
            Ok(end)
        }
        Err(e) => Err(CoreError::Ssh(format!("session failed: {e}"))),
    }
}
