//! The `ssh` child process carrying the SFTP byte stream.

use crate::{
    config::Config,
    error::{Error, Result},
    sftp::{BoxedReader, BoxedWriter},
    uri::Uri,
};
use futures::ready;
use std::{
    ffi::OsString,
    io,
    os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    pin::Pin,
    process::Stdio,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{
        unix::AsyncFd, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader, ReadBuf,
    },
    process::{Child, ChildStderr, Command},
    task::JoinHandle,
};

const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Flavor of the installed ssh client.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Vendor {
    OpenSsh,
    SshCom,
}

impl Vendor {
    /// Recognize the client from its `-V` banner.
    pub fn from_banner(banner: &str) -> Option<Self> {
        if banner.contains("OpenSSH") || banner.contains("Sun_SSH") {
            Some(Vendor::OpenSsh)
        } else if banner.contains("SSH Secure Shell") {
            Some(Vendor::SshCom)
        } else {
            None
        }
    }

    /// Run `ssh -V` and recognize the client.
    pub async fn detect(program: &OsString) -> Result<Self> {
        let output = Command::new(program)
            .arg("-V")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let mut banner = String::from_utf8_lossy(&output.stderr).into_owned();
        banner.push_str(&String::from_utf8_lossy(&output.stdout));

        Self::from_banner(&banner).ok_or_else(|| {
            tracing::warn!(banner = %banner.trim(), "unrecognized ssh client");
            Error::Generic(Some(format!(
                "unrecognized ssh client: {}",
                banner.lines().next().unwrap_or("").trim()
            )))
        })
    }
}

/// Command line arguments (without the program name) for reaching `uri`.
pub fn ssh_args(vendor: Vendor, uri: &Uri, user: &str, use_pty: bool) -> Vec<String> {
    let mut args: Vec<String> = vec![];

    match vendor {
        Vendor::OpenSsh => {
            args.extend(
                [
                    "-oForwardX11 no",
                    "-oForwardAgent no",
                    "-oClearAllForwardings yes",
                    "-oProtocol 2",
                    "-oNoHostAuthenticationForLocalhost yes",
                ]
                .iter()
                .map(|s| s.to_string()),
            );
            if !use_pty {
                args.push("-oBatchMode yes".into());
            }
        }
        Vendor::SshCom => args.push("-x".into()),
    }

    if let Some(port) = uri.port() {
        args.push("-p".into());
        args.push(port.to_string());
    }

    if !user.is_empty() {
        args.push("-l".into());
        args.push(user.into());
    }

    args.push("-s".into());
    match vendor {
        Vendor::OpenSsh => {
            args.push(uri.host().into());
            args.push("sftp".into());
        }
        Vendor::SshCom => {
            args.push("sftp".into());
            args.push(uri.host().into());
        }
    }

    args
}

/// Map a line the ssh client printed on its error stream to an error.
pub fn classify_error_line(line: &str) -> Option<Error> {
    let diagnostic = Some(line.trim().to_owned());
    if line.contains("Permission denied") {
        Some(Error::LoginFailed(diagnostic))
    } else if line.contains("Name or service not known") || line.contains("No route to host") {
        Some(Error::HostNotFound(diagnostic))
    } else if line.contains("Connection refused") || line.contains("Host key verification failed")
    {
        Some(Error::AccessDenied(diagnostic))
    } else {
        None
    }
}

/// Classify the text collected from the error stream of a client that
/// failed before the handshake completed.
///
/// The most recent recognizable line wins.
pub fn classify_error_output(text: &str) -> Option<Error> {
    text.lines().rev().find_map(classify_error_line)
}

/// The controlling terminal of the ssh client, parent side.
pub struct Pty {
    pub reader: PtyStream,
    pub writer: PtyStream,
}

/// Non-blocking access to a pty master registered with the reactor.
pub struct PtyStream {
    fd: AsyncFd<OwnedFd>,
}

impl PtyStream {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        set_fd_flag(fd.as_raw_fd(), libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK)?;
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }
}

fn syscall_len(n: libc::ssize_t) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

impl AsyncRead for PtyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            let res = guard.try_io(|fd| {
                syscall_len(unsafe {
                    libc::read(
                        fd.as_raw_fd(),
                        unfilled.as_mut_ptr().cast(),
                        unfilled.len(),
                    )
                })
            });
            match res {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                // the client side of the terminal is gone.
                Ok(Err(err)) if err.raw_os_error() == Some(libc::EIO) => {
                    return Poll::Ready(Ok(()))
                }
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for PtyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            let res = guard.try_io(|fd| {
                syscall_len(unsafe {
                    libc::write(fd.as_raw_fd(), data.as_ptr().cast(), data.len())
                })
            });
            match res {
                Ok(res) => return Poll::Ready(res),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn set_fd_flag(
    fd: RawFd,
    get: libc::c_int,
    set: libc::c_int,
    flag: libc::c_int,
) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, get);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, set, flags | flag) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn open_pty() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    let winsize = libc::winsize {
        ws_row: 24,
        ws_col: 300,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null(),
            &winsize,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    let (master, slave) = unsafe { (OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave)) };
    set_fd_flag(master.as_raw_fd(), libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;
    Ok((master, slave))
}

/// The running ssh client.
pub struct SshProcess {
    child: Child,
    vendor: Vendor,
    stderr: Option<ChildStderr>,
    pty: Option<Pty>,
}

impl std::fmt::Debug for SshProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshProcess")
            .field("pid", &self.child.id())
            .field("vendor", &self.vendor)
            .field("pty", &self.pty.is_some())
            .finish()
    }
}

impl SshProcess {
    /// Where login prompts are read from and answered to.
    ///
    /// OpenSSH prompts on its terminal; the SSH.com client prints them
    /// on its error stream. Without a terminal there is nothing to answer.
    pub fn prompt_io(
        &mut self,
    ) -> Option<(&mut (dyn AsyncRead + Send + Unpin), &mut PtyStream)> {
        let pty = self.pty.as_mut()?;
        match self.vendor {
            Vendor::OpenSsh => Some((&mut pty.reader, &mut pty.writer)),
            Vendor::SshCom => {
                let stderr = self.stderr.as_mut()?;
                Some((stderr, &mut pty.writer))
            }
        }
    }

    /// Hand the error stream over to a background reader.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Collect whatever the client still writes on its error stream,
    /// waiting at most `wait` for it to finish.
    pub async fn read_remaining_errors(&mut self, wait: Duration) -> String {
        let mut text = vec![];
        if let Some(stderr) = self.stderr.as_mut() {
            let _ = tokio::time::timeout(wait, stderr.read_to_end(&mut text)).await;
        }
        String::from_utf8_lossy(&text).into_owned()
    }

    /// Wait for the client to exit once its input is closed, killing it
    /// if it lingers.
    pub async fn shutdown(mut self) {
        match tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "ssh client exited"),
            Ok(Err(err)) => tracing::warn!(error = %err, "failed to reap ssh client"),
            Err(..) => {
                tracing::debug!("ssh client did not exit, killing it");
                if let Err(err) = self.child.kill().await {
                    tracing::warn!(error = %err, "failed to kill ssh client");
                }
            }
        }
    }
}

/// A bidirectional byte stream to an SFTP server.
pub struct Transport {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub process: Option<SshProcess>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("process", &self.process)
            .finish()
    }
}

impl Transport {
    /// A transport over arbitrary streams, without a child process.
    pub fn from_streams(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader,
            writer,
            process: None,
        }
    }

    /// Spawn the ssh client for `uri` logging in as `user`.
    ///
    /// The client gets a controlling pseudo-terminal when one can be
    /// allocated, so that it can ask for passwords and host key
    /// confirmation without touching the SFTP stream.
    pub fn spawn(config: &Config, vendor: Vendor, uri: &Uri, user: &str) -> Result<Self> {
        let pty = match open_pty() {
            Ok(pty) => Some(pty),
            Err(err) => {
                tracing::warn!(error = %err, "no pseudo-terminal, prompts are disabled");
                None
            }
        };

        let args = ssh_args(vendor, uri, user, pty.is_some());
        tracing::debug!(program = ?config.ssh_program, ?args, "spawning ssh client");

        let mut command = Command::new(&config.ssh_program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some((_, slave)) = &pty {
            let slave = slave.as_raw_fd();
            // SAFETY: only async-signal-safe calls happen between fork and exec.
            unsafe {
                command.pre_exec(move || {
                    if libc::setsid() < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::ioctl(slave, libc::TIOCSCTTY as _, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    libc::close(slave);
                    Ok(())
                });
            }
        }

        let mut child = command.spawn()?;

        let pty = match pty {
            Some((master, slave)) => {
                drop(slave);
                let writer = master.try_clone()?;
                Some(Pty {
                    reader: PtyStream::new(master)?,
                    writer: PtyStream::new(writer)?,
                })
            }
            None => None,
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "no stdout")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "no stdin")))?;
        let stderr = child.stderr.take();

        Ok(Self {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Some(SshProcess {
                child,
                vendor,
                stderr,
                pty,
            }),
        })
    }
}

/// The last line the ssh client reported on its error stream.
pub type DiagnosticSlot = Arc<Mutex<Option<String>>>;

/// Keep reading the error stream of a connected client so that it never
/// blocks on a full pipe, remembering its last line.
pub fn drain_errors<R>(stream: R, slot: DiagnosticSlot) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim().to_owned();
                    if line.is_empty() {
                        continue;
                    }
                    tracing::warn!(message = %line, "ssh client");
                    if let Ok(mut slot) = slot.lock() {
                        *slot = Some(line);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(error = %err, "error stream closed");
                    break;
                }
            }
        }
    })
}
