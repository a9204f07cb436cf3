//! Login negotiation: answering the prompts of the ssh client while
//! waiting for the server's `SSH_FXP_VERSION`.

use crate::{
    config::Config,
    connection::{Connector, Session},
    error::{Error, Result},
    sftp,
    transport::{self, Transport, Vendor},
    uri::Uri,
};
use futures::future::BoxFuture;
use std::{sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const PASSPHRASE_PROMPT: &str = "Enter passphrase for key";
const OPENSSH_HOST_KEY: &str = "The authenticity of host '";
const OPENSSH_FINGERPRINT: &str = " key fingerprint is ";
const SSHCOM_FINGERPRINT: &str = "Key fingerprint:";
const MAX_PROMPT_TEXT: usize = 8 * 1024;
const ERROR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub const CHOICE_LOG_IN: &str = "Log In Anyway";
pub const CHOICE_CANCEL: &str = "Cancel Login";

/// Description of a credential being asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct AuthRequest {
    /// Always `"sftp"`.
    pub protocol: &'static str,
    pub uri: String,
    /// The host, unless a key passphrase is asked for.
    pub server: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    /// The key file whose passphrase is asked for.
    pub object: Option<String>,
    /// `"publickey"` for passphrases, `"password"` otherwise.
    pub authtype: &'static str,
    /// No login name was part of the location.
    pub need_username: bool,
    pub previous_attempt_failed: bool,
}

/// Credentials supplied interactively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Login name; the local user when `None`.
    pub username: Option<String>,
    pub password: String,
    pub keyring: Option<String>,
    /// Remember the credentials once the login succeeded.
    pub save: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FullAuthReply {
    Credentials(Credentials),
    /// The user gave up.
    Aborted,
    /// Nobody answered.
    Unhandled,
}

/// A multiple-choice question for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub primary: String,
    pub secondary: String,
    pub choices: Vec<String>,
}

/// Policy provider consulted when the ssh client asks for something.
///
/// The methods may block; they are run on the blocking thread pool.
pub trait Authenticator: Send + Sync {
    /// Look up a stored password without bothering the user.
    fn fill_authentication(&self, request: &AuthRequest) -> Option<String> {
        let _ = request;
        None
    }

    /// Ask the user for credentials.
    fn full_authentication(&self, request: &AuthRequest) -> FullAuthReply {
        let _ = request;
        FullAuthReply::Unhandled
    }

    /// Store credentials that led to a successful login.
    fn save_authentication(&self, request: &AuthRequest, credentials: &Credentials) {
        let _ = (request, credentials);
    }

    /// Ask a question, returning the index of the chosen answer.
    fn question(&self, question: &Question) -> Option<usize> {
        let _ = question;
        None
    }
}

/// Answers nothing; every prompt fails the login.
#[derive(Debug, Default)]
pub struct NoAuthenticator;

impl Authenticator for NoAuthenticator {}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Prompt {
    Password {
        line: String,
    },
    HostKey {
        hostname: String,
        fingerprint: String,
    },
}

fn last_line(text: &str) -> &str {
    let line = text.rsplit('\n').next().unwrap_or(text);
    line.trim_start_matches('\r')
}

/// Recognize a complete prompt at the end of the text printed so far.
pub(crate) fn parse_prompt(text: &str, host: &str) -> Option<Prompt> {
    let line = last_line(text);
    if line.ends_with("password: ")
        || line.ends_with("Password: ")
        || line.ends_with("Password:")
        || (line.starts_with(PASSPHRASE_PROMPT) && line.trim_end().ends_with(':'))
    {
        return Some(Prompt::Password {
            line: line.to_owned(),
        });
    }

    // host key questions end with "(yes/no)? " or similar.
    if !line.trim_end().ends_with('?') {
        return None;
    }

    if let Some(start) = text.find(OPENSSH_HOST_KEY) {
        let rest = &text[start + OPENSSH_HOST_KEY.len()..];
        let end = rest.find('\'')?;
        let hostname = rest[..end].to_owned();
        let fp = rest[end..].find(OPENSSH_FINGERPRINT)? + end + OPENSSH_FINGERPRINT.len();
        let fp_end = rest[fp..].find('.')? + fp;
        return Some(Prompt::HostKey {
            hostname,
            fingerprint: rest[fp..fp_end].trim().to_owned(),
        });
    }

    if let Some(start) = text.find(SSHCOM_FINGERPRINT) {
        let rest = &text[start + SSHCOM_FINGERPRINT.len()..];
        let end = rest.find(|c| c == '\r' || c == '\n').unwrap_or(rest.len());
        return Some(Prompt::HostKey {
            hostname: host.to_owned(),
            fingerprint: rest[..end].trim().to_owned(),
        });
    }

    None
}

fn is_passphrase(line: &str) -> bool {
    line.starts_with(PASSPHRASE_PROMPT)
}

/// The login name embedded in a `user@host's password:` prompt.
fn user_from_prompt(line: &str) -> Option<String> {
    if is_passphrase(line) {
        return None;
    }
    line.find('@').map(|at| line[..at].to_owned())
}

/// The key file named by a passphrase prompt.
fn object_from_prompt(line: &str) -> Option<String> {
    if !is_passphrase(line) {
        return None;
    }
    let start = line.find('\'')? + 1;
    let rest = &line[start..];
    Some(match rest.find('\'') {
        Some(end) => rest[..end].to_owned(),
        None => rest.to_owned(),
    })
}

fn auth_request(uri: &Uri, line: &str, user: Option<&str>) -> AuthRequest {
    let passphrase = is_passphrase(line);
    AuthRequest {
        protocol: "sftp",
        uri: uri.to_string(),
        server: if passphrase {
            None
        } else {
            Some(uri.host().to_owned())
        },
        port: uri.port(),
        username: user_from_prompt(line).or_else(|| user.map(ToOwned::to_owned)),
        object: object_from_prompt(line),
        authtype: if passphrase { "publickey" } else { "password" },
        need_username: uri.user().is_none(),
        previous_attempt_failed: false,
    }
}

fn host_key_question(hostname: &str, fingerprint: &str) -> Question {
    Question {
        primary: format!(
            "The identity of the remote computer ({}) is unknown.",
            hostname
        ),
        secondary: format!(
            "This happens when you log in to a computer the first time.\n\n\
             The identity sent by the remote computer is {}. \
             If you want to be absolutely sure it is safe to continue, \
             contact the system administrator.",
            fingerprint
        ),
        choices: vec![CHOICE_LOG_IN.to_owned(), CHOICE_CANCEL.to_owned()],
    }
}

/// Mutable state of one login, kept across client restarts.
#[derive(Debug)]
pub(crate) struct AuthState {
    pub(crate) user: String,
    pub(crate) password: Option<String>,
    done_auth: bool,
    full_auth: bool,
    to_save: Option<(AuthRequest, Credentials)>,
}

impl AuthState {
    pub(crate) fn new(uri: &Uri) -> Self {
        Self {
            user: uri
                .user()
                .map(ToOwned::to_owned)
                .unwrap_or_else(whoami::username),
            password: uri.password().map(ToOwned::to_owned),
            done_auth: false,
            full_auth: false,
            to_save: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Version(u32),
    /// The user picked another login name; the client must be restarted.
    Restart,
}

async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| Error::Generic(Some(format!("authentication callback failed: {}", err))))
}

async fn answer<W>(tty: &mut W, text: &str) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    tty.write_all(text.as_bytes()).await?;
    tty.write_all(b"\n").await?;
    tty.flush().await?;
    Ok(())
}

struct Negotiation<'a> {
    uri: &'a Uri,
    authenticator: &'a Arc<dyn Authenticator>,
    state: &'a mut AuthState,
}

impl Negotiation<'_> {
    async fn password_prompt<W>(&mut self, line: &str, tty: &mut W) -> Result<Option<Outcome>>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let uri_password = self.uri.password().is_some();

        if !self.state.done_auth {
            if let Some(password) = &self.state.password {
                tracing::debug!("sending password from the location");
                answer(tty, password).await?;
                self.state.done_auth = true;
                return Ok(None);
            }
        }

        if !self.state.done_auth && !uri_password {
            let request = auth_request(self.uri, line, self.uri.user());
            let auth = self.authenticator.clone();
            if let Some(password) = blocking(move || auth.fill_authentication(&request)).await? {
                tracing::debug!("sending stored password");
                answer(tty, &password).await?;
                self.state.password = Some(password);
                self.state.done_auth = true;
                return Ok(None);
            }
        }

        if !uri_password {
            let mut request = auth_request(self.uri, line, Some(&self.state.user));
            request.previous_attempt_failed = self.state.done_auth;
            let auth = self.authenticator.clone();
            let req = request.clone();
            match blocking(move || auth.full_authentication(&req)).await? {
                FullAuthReply::Credentials(credentials) => {
                    let new_user = credentials
                        .username
                        .clone()
                        .filter(|u| !u.is_empty())
                        .unwrap_or_else(whoami::username);

                    if new_user != self.state.user {
                        tracing::debug!(user = %new_user, "login name changed, restarting ssh client");
                        self.state.user = new_user;
                        self.state.password = Some(credentials.password.clone());
                        self.state.done_auth = false;
                        return Ok(Some(Outcome::Restart));
                    }

                    answer(tty, &credentials.password).await?;
                    self.state.full_auth = true;
                    self.state.password = Some(credentials.password.clone());
                    self.state.to_save = if credentials.save {
                        Some((request, credentials))
                    } else {
                        None
                    };
                    self.state.done_auth = true;
                    return Ok(None);
                }
                FullAuthReply::Aborted => return Err(Error::Cancelled),
                FullAuthReply::Unhandled => {}
            }
        }

        Err(Error::AccessDenied(Some("authentication failed".into())))
    }

    async fn host_key_prompt<W>(
        &mut self,
        hostname: &str,
        fingerprint: &str,
        tty: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let question = host_key_question(hostname, fingerprint);
        let auth = self.authenticator.clone();
        let choice = blocking(move || auth.question(&question)).await?;

        if choice == Some(0) {
            tracing::debug!(%hostname, %fingerprint, "host key accepted");
            answer(tty, "yes").await
        } else {
            tracing::debug!(%hostname, %fingerprint, "host key rejected");
            answer(tty, "no").await?;
            Err(Error::AccessDenied(Some(format!(
                "host key of {} was not accepted",
                hostname
            ))))
        }
    }
}

/// Wait for `SSH_FXP_VERSION` on `reader`, answering what appears on
/// `prompts` meanwhile. `SSH_FXP_INIT` must already have been sent.
pub(crate) async fn negotiate<R, P, W>(
    reader: &mut R,
    mut prompts: Option<(&mut P, &mut W)>,
    uri: &Uri,
    authenticator: &Arc<dyn Authenticator>,
    state: &mut AuthState,
    prompt_timeout: Duration,
    transcript: &mut String,
) -> Result<Outcome>
where
    R: AsyncRead + Unpin + ?Sized,
    P: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut negotiation = Negotiation {
        uri,
        authenticator,
        state,
    };

    let version = sftp::read_version(reader);
    tokio::pin!(version);

    let mut chunk = [0u8; 1024];
    let mut prompts_open = prompts.is_some();

    loop {
        let read_prompt = async {
            match prompts.as_mut() {
                Some((p, _)) => p.read(&mut chunk).await,
                None => futures::future::pending().await,
            }
        };

        tokio::select! {
            res = &mut version => return res.map(Outcome::Version),

            res = read_prompt, if prompts_open => {
                let n = match res {
                    Ok(0) | Err(..) => {
                        prompts_open = false;
                        continue;
                    }
                    Ok(n) => n,
                };
                transcript.push_str(&String::from_utf8_lossy(&chunk[..n]));
                if transcript.len() > MAX_PROMPT_TEXT {
                    let mut cut = transcript.len() - MAX_PROMPT_TEXT;
                    while !transcript.is_char_boundary(cut) {
                        cut += 1;
                    }
                    transcript.drain(..cut);
                }

                let prompt = match parse_prompt(transcript, uri.host()) {
                    Some(prompt) => prompt,
                    None => continue,
                };
                transcript.clear();

                let tty = match prompts.as_mut() {
                    Some((_, tty)) => &mut **tty,
                    None => continue,
                };
                match prompt {
                    Prompt::Password { line } => {
                        if let Some(outcome) = negotiation.password_prompt(&line, tty).await? {
                            return Ok(outcome);
                        }
                    }
                    Prompt::HostKey { hostname, fingerprint } => {
                        negotiation.host_key_prompt(&hostname, &fingerprint, tty).await?;
                    }
                }
            }

            _ = tokio::time::sleep(prompt_timeout) => {
                tracing::debug!("no reply from the ssh client");
                return Err(Error::Timeout);
            }
        }
    }
}

/// Opens connections by running the ssh client.
pub struct SshConnector {
    config: Config,
    authenticator: Arc<dyn Authenticator>,
}

impl std::fmt::Debug for SshConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnector")
            .field("config", &self.config)
            .finish()
    }
}

impl SshConnector {
    pub fn new(config: Config, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            config,
            authenticator,
        }
    }

    async fn login(&self, uri: &Uri) -> Result<Session> {
        let vendor = Vendor::detect(&self.config.ssh_program).await?;
        tracing::debug!(?vendor, "detected ssh client");

        let mut state = AuthState::new(uri);
        loop {
            let mut transport = Transport::spawn(&self.config, vendor, uri, &state.user)?;

            match self.handshake(&mut transport, uri, &mut state).await? {
                Outcome::Version(version) => {
                    if state.full_auth {
                        if let Some((request, credentials)) = state.to_save.take() {
                            let auth = self.authenticator.clone();
                            blocking(move || auth.save_authentication(&request, &credentials))
                                .await?;
                        }
                    }
                    return Ok(Session { transport, version });
                }
                Outcome::Restart => {
                    if let Some(process) = transport.process.take() {
                        drop(transport);
                        process.shutdown().await;
                    }
                }
            }
        }
    }

    async fn handshake(
        &self,
        transport: &mut Transport,
        uri: &Uri,
        state: &mut AuthState,
    ) -> Result<Outcome> {
        sftp::send_init(&mut *transport.writer).await?;

        let Transport {
            reader, process, ..
        } = transport;

        let mut transcript = String::new();
        let res = match process.as_mut() {
            Some(process) => {
                let prompts = process.prompt_io();
                negotiate(
                    &mut **reader,
                    prompts,
                    uri,
                    &self.authenticator,
                    state,
                    self.config.prompt_timeout,
                    &mut transcript,
                )
                .await
            }
            None => negotiate::<_, tokio::io::Empty, tokio::io::Sink>(
                &mut **reader,
                None,
                uri,
                &self.authenticator,
                state,
                self.config.prompt_timeout,
                &mut transcript,
            )
            .await,
        };

        match res {
            Err(Error::Io(err)) => {
                // the client quit before the handshake; find out why.
                if let Some(process) = process.as_mut() {
                    transcript.push_str(&process.read_remaining_errors(ERROR_DRAIN_TIMEOUT).await);
                }
                tracing::debug!(output = %transcript.trim(), "ssh client failed");
                Err(transport::classify_error_output(&transcript).unwrap_or(Error::Io(err)))
            }
            res => res,
        }
    }
}

impl Connector for SshConnector {
    fn connect<'a>(&'a self, uri: &'a Uri) -> BoxFuture<'a, Result<Session>> {
        Box::pin(self.login(uri))
    }
}
