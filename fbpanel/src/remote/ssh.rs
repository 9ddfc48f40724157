//! SSH session
//!
//! `RemoteSession` over libssh2. Authentication is key based and
//! non-interactive, with a fixed remote user. The TCP connect and the
//! handshake/auth phase each get a short timeout; once authenticated the
//! session switches to the longer per-call command timeout.

use super::{Connector, RemoteCommand, RemoteError, RemoteExit, RemoteSession};
use ssh2::{Channel, ErrorCode, Session};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_USER: &str = "ubuntu";
pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

// libssh2 transport errors meaning the socket under the session is gone.
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

impl From<ssh2::Error> for RemoteError {
    fn from(err: ssh2::Error) -> RemoteError {
        match err.code() {
            ErrorCode::Session(
                LIBSSH2_ERROR_SOCKET_SEND | LIBSSH2_ERROR_SOCKET_DISCONNECT | LIBSSH2_ERROR_SOCKET_RECV,
            ) => RemoteError::SessionInvalid,
            _ => RemoteError::Ssh(err),
        }
    }
}

fn millis(d: Duration) -> u32 {
    d.as_millis().min(u32::MAX as u128) as u32
}

#[derive(Debug, Clone)]
pub struct SshConnector {
    pub user: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for SshConnector {
    fn default() -> Self {
        SshConnector {
            user: DEFAULT_USER.to_string(),
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl SshConnector {
    fn open_tcp(&self, host: &str) -> Result<TcpStream, RemoteError> {
        let connect_err = |source| RemoteError::Connect {
            host: host.to_string(),
            source,
        };
        let addrs = (host, self.port).to_socket_addrs().map_err(connect_err)?;
        let mut last = io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last = e,
            }
        }
        Err(connect_err(last))
    }

    fn authenticate(&self, session: &mut Session, key_path: &Path) -> Result<(), RemoteError> {
        session.set_timeout(millis(self.connect_timeout));
        session.handshake()?;
        session.userauth_pubkey_file(&self.user, None, key_path, None)?;
        if !session.authenticated() {
            return Err(RemoteError::Command(format!(
                "authentication as {} was rejected",
                self.user
            )));
        }
        session.set_timeout(millis(self.command_timeout));
        Ok(())
    }
}

impl Connector for SshConnector {
    type Session = SshSession;

    fn connect(&self, host: &str, key_path: &Path) -> Result<SshSession, RemoteError> {
        std::fs::metadata(key_path).map_err(|source| RemoteError::KeyFile {
            path: key_path.display().to_string(),
            source,
        })?;

        let tcp = self.open_tcp(host)?;
        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);

        if let Err(e) = self.authenticate(&mut session, key_path) {
            // Close the half-open session before the caller retries.
            if let Err(close_err) = session.disconnect(None, "connection setup failed", None) {
                debug!(error = %close_err, "closing partial session");
            }
            return Err(e);
        }
        debug!(host, user = %self.user, "session established");
        Ok(SshSession { session })
    }
}

pub struct SshSession {
    session: Session,
}

impl RemoteSession for SshSession {
    type Command = SshCommand;

    fn exec(&mut self, command: &str) -> Result<SshCommand, RemoteError> {
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;
        Ok(SshCommand {
            channel: Some(channel),
        })
    }

    fn disconnect(&mut self) -> Result<(), RemoteError> {
        self.session.disconnect(None, "bye", None)?;
        Ok(())
    }
}

pub struct SshCommand {
    channel: Option<Channel>,
}

impl SshCommand {
    fn channel(&mut self) -> Result<&mut Channel, RemoteError> {
        self.channel.as_mut().ok_or(RemoteError::SessionInvalid)
    }
}

impl RemoteCommand for SshCommand {
    fn write_input(&mut self, data: &[u8]) -> Result<(), RemoteError> {
        let channel = self.channel()?;
        channel.write_all(data)?;
        channel.flush()?;
        Ok(())
    }

    fn finish_input(&mut self) -> Result<(), RemoteError> {
        self.channel()?.send_eof()?;
        Ok(())
    }

    fn wait(&mut self) -> Result<RemoteExit, RemoteError> {
        let channel = self.channel()?;
        let mut stdout = Vec::new();
        channel.read_to_end(&mut stdout)?;
        let mut stderr = Vec::new();
        channel.stderr().read_to_end(&mut stderr)?;
        channel.wait_close()?;
        Ok(RemoteExit {
            status: channel.exit_status()?,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    fn close(&mut self) -> Result<(), RemoteError> {
        if let Some(mut channel) = self.channel.take() {
            channel.close()?;
        }
        Ok(())
    }
}

impl Drop for SshCommand {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "error closing ssh channel");
        }
    }
}
