//! A virtual filesystem backend reaching remote files over SFTP, spoken
//! through the system's ssh client.

pub mod auth;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod mime;
pub mod pipeline;
pub mod sftp;
pub mod transport;
pub mod uri;
pub mod vfs;

#[cfg(test)]
mod mock;

pub use crate::{
    auth::{AuthRequest, Authenticator, Credentials, FullAuthReply, NoAuthenticator, Question},
    config::Config,
    error::{Error, Result},
    uri::Uri,
    vfs::{
        DirHandle, FileHandle, FileInfo, FileInfoFields, FileInfoOptions, FileType, OpenMode,
        SeekPosition, SetFileInfo, SftpVfs,
    },
};
pub use tokio_util::sync::CancellationToken;
