//! `sftp://` locations.

use crate::error::{Error, Result};
use std::fmt;

pub const SCHEME: &str = "sftp";

/// A parsed `sftp://[user[:password]@]host[:port]/path` location.
#[derive(Clone, PartialEq, Eq)]
pub struct Uri {
    user: Option<String>,
    password: Option<String>,
    host: String,
    port: Option<u16>,
    path: String,
}

impl Uri {
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidUri(s.to_owned());

        let (scheme, rest) = s.split_once("://").ok_or_else(invalid)?;
        if !scheme.eq_ignore_ascii_case(SCHEME) {
            return Err(invalid());
        }

        let (authority, path) = match rest.find('/') {
            Some(i) => rest.split_at(i),
            None => (rest, ""),
        };

        let (userinfo, hostport) = match authority.rfind('@') {
            Some(i) => (Some(&authority[..i]), &authority[i + 1..]),
            None => (None, authority),
        };

        let (user, password) = match userinfo {
            Some(info) => match info.split_once(':') {
                Some((user, password)) => (Some(unescape(user)?), Some(unescape(password)?)),
                None => (Some(unescape(info)?), None),
            },
            None => (None, None),
        };
        let user = user.filter(|u| !u.is_empty());

        let (host, port) = if let Some(bracketed) = hostport.strip_prefix('[') {
            // IPv6 literal
            let end = bracketed.find(']').ok_or_else(invalid)?;
            let host = &bracketed[..end];
            let port = match &bracketed[end + 1..] {
                "" => None,
                p => Some(p.strip_prefix(':').ok_or_else(invalid)?),
            };
            (host, port)
        } else {
            match hostport.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (hostport, None),
            }
        };

        if host.is_empty() {
            return Err(Error::HostNotFound(None));
        }

        let port = match port {
            None | Some("") => None,
            Some(p) => Some(p.parse::<u16>().map_err(|_| invalid())?),
        };

        let path = unescape(path)?;

        Ok(Self {
            user,
            password,
            host: unescape(host)?,
            port,
            path: normalize_path(&path),
        })
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The unescaped remote path, always absolute.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The registry key of this location: `user@host`, or `host` alone.
    pub fn identity(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// The same server with another path.
    pub fn with_path(&self, path: &str) -> Self {
        Self {
            path: normalize_path(path),
            ..self.clone()
        }
    }

    /// The same server with another login name.
    pub fn with_user(&self, user: &str) -> Self {
        Self {
            user: Some(user.to_owned()).filter(|u| !u.is_empty()),
            ..self.clone()
        }
    }

    /// Whether both locations are served by the same login on the same host.
    pub fn same_fs(&self, other: &Uri) -> bool {
        self.host == other.host && self.user().unwrap_or("") == other.user().unwrap_or("")
    }

    /// Last path component, `/` for the root.
    pub fn basename(&self) -> &str {
        basename(&self.path)
    }
}

impl fmt::Debug for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// The password is never printed.
impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", SCHEME)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        f.write_str(&self.path)
    }
}

fn unescape(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| Error::InvalidUri(s.to_owned()))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| Error::InvalidUri(s.to_owned()))
}

/// Collapse `.`, `..` and repeated separators of an absolute path.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = vec![];
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            comp => parts.push(comp),
        }
    }
    let mut out = String::with_capacity(path.len() + 1);
    for comp in &parts {
        out.push('/');
        out.push_str(comp);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Parent directory of an absolute path.
pub fn dirname(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &trimmed[..i],
    }
}

pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        _ if trimmed.is_empty() => "/",
        Some(i) => &trimmed[i + 1..],
        None => trimmed,
    }
}

/// Join `name` onto the directory `dir`.
pub fn join(dir: &str, name: &str) -> String {
    normalize_path(&format!("{}/{}", dir, name))
}

/// Where the link at `link_path` pointing to `target` leads.
///
/// Relative targets are taken relative to the link's directory.
pub fn resolve_symlink(link_path: &str, target: &str) -> String {
    if target.starts_with('/') {
        normalize_path(target)
    } else {
        join(dirname(link_path), target)
    }
}
