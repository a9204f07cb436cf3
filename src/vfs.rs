//! The filesystem verbs, expressed as SFTP exchanges.

use crate::{
    auth::{Authenticator, SshConnector},
    config::Config,
    connection::{ConnectionRef, Connector, Registry},
    error::{Error, Result},
    mime,
    pipeline::{self, Window},
    sftp::{self, Channel, DirEntry, FileAttr, OpenFlag, Reply},
    uri::{self, Uri},
};
use bytes::Bytes;
use std::{collections::VecDeque, fmt, io, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

pub(crate) const S_IFMT: u32 = 0o170000;
pub(crate) const S_IFSOCK: u32 = 0o140000;
pub(crate) const S_IFLNK: u32 = 0o120000;
pub(crate) const S_IFREG: u32 = 0o100000;
pub(crate) const S_IFBLK: u32 = 0o060000;
pub(crate) const S_IFDIR: u32 = 0o040000;
pub(crate) const S_IFCHR: u32 = 0o020000;
pub(crate) const S_IFIFO: u32 = 0o010000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileType {
    Unknown,
    Regular,
    Directory,
    SymbolicLink,
    CharacterDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileType {
    /// The type encoded in the `S_IFMT` bits of a mode.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFREG => FileType::Regular,
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::SymbolicLink,
            S_IFCHR => FileType::CharacterDevice,
            S_IFBLK => FileType::BlockDevice,
            S_IFIFO => FileType::Fifo,
            S_IFSOCK => FileType::Socket,
            _ => FileType::Unknown,
        }
    }
}

bitflags::bitflags! {
    /// Which fields of a [`FileInfo`] hold meaningful values.
    pub struct FileInfoFields: u32 {
        const TYPE = 1 << 0;
        const PERMISSIONS = 1 << 1;
        const FLAGS = 1 << 2;
        const SIZE = 1 << 3;
        const ATIME = 1 << 4;
        const MTIME = 1 << 5;
        const SYMLINK_NAME = 1 << 6;
        const MIME_TYPE = 1 << 7;
        const IO_BLOCK_SIZE = 1 << 8;
    }
}

bitflags::bitflags! {
    #[derive(Default)]
    pub struct FileInfoOptions: u32 {
        /// Report on the file at the end of a symlink chain.
        const FOLLOW_LINKS = 1 << 0;
    }
}

bitflags::bitflags! {
    pub struct OpenMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Writes land at arbitrary offsets; the file is not truncated.
        const RANDOM = 1 << 2;
        const TRUNCATE = 1 << 3;
    }
}

/// What is known about a remote file.
///
/// Only the fields named in `valid_fields` carry information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub valid_fields: FileInfoFields,
    pub file_type: FileType,
    /// Permission bits, without the file type.
    pub permissions: u32,
    pub is_symlink: bool,
    pub size: u64,
    pub atime: u32,
    pub mtime: u32,
    pub symlink_name: Option<String>,
    pub mime_type: Option<&'static str>,
    pub io_block_size: u64,
}

impl FileInfo {
    fn from_attr(attr: &FileAttr, io_block_size: u64) -> Self {
        let mut info = Self {
            name: String::new(),
            valid_fields: FileInfoFields::IO_BLOCK_SIZE,
            file_type: FileType::Unknown,
            permissions: 0,
            is_symlink: false,
            size: 0,
            atime: 0,
            mtime: 0,
            symlink_name: None,
            mime_type: None,
            io_block_size,
        };

        if let Some(size) = attr.size {
            info.size = size;
            info.valid_fields |= FileInfoFields::SIZE;
        }
        // ownership is not reported.
        if let Some(mode) = attr.permissions {
            info.file_type = FileType::from_mode(mode);
            info.permissions = mode & 0o7777;
            info.is_symlink = info.file_type == FileType::SymbolicLink;
            info.valid_fields |=
                FileInfoFields::TYPE | FileInfoFields::PERMISSIONS | FileInfoFields::FLAGS;
        }
        if let Some((atime, mtime)) = attr.ac_mod_time {
            info.atime = atime;
            info.mtime = mtime;
            info.valid_fields |= FileInfoFields::ATIME | FileInfoFields::MTIME;
        }

        info
    }

    fn has_type(&self, typ: FileType) -> bool {
        self.valid_fields.contains(FileInfoFields::TYPE) && self.file_type == typ
    }

    fn set_mime_type(&mut self, options: FileInfoOptions) {
        let followed_link = options.contains(FileInfoOptions::FOLLOW_LINKS)
            && self.valid_fields.contains(FileInfoFields::SYMLINK_NAME);

        let mime_type = if self.has_type(FileType::SymbolicLink) {
            mime::SYMLINK_MIME_TYPE
        } else if self.has_type(FileType::Regular) {
            match &self.symlink_name {
                Some(target) if followed_link => mime::from_name(uri::basename(target)),
                _ => mime::from_name(&self.name),
            }
        } else if self.valid_fields.contains(FileInfoFields::TYPE) {
            mime::from_file_type(self.file_type).unwrap_or(mime::DEFAULT_MIME_TYPE)
        } else {
            mime::DEFAULT_MIME_TYPE
        };

        self.mime_type = Some(mime_type);
        self.valid_fields |= FileInfoFields::MIME_TYPE;
    }
}

/// Attribute changes for [`SftpVfs::set_file_info`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetFileInfo {
    /// Rename the file within its directory.
    pub name: Option<String>,
    pub permissions: Option<u32>,
    /// `(uid, gid)`
    pub owner: Option<(u32, u32)>,
    /// `(atime, mtime)`
    pub times: Option<(u32, u32)>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SeekPosition {
    Start(u64),
    Current(i64),
    End(i64),
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Whether something is at `path`.
async fn exists(ch: &mut Channel, path: &str) -> Result<bool> {
    match ch.lstat(path).await {
        Ok(..) => Ok(true),
        Err(err) if err.is_fatal() => Err(err),
        Err(..) => Ok(false),
    }
}

/// A generic failure on a path that is there afterwards means it was
/// there before.
async fn exists_on_failure(ch: &mut Channel, path: &str, res: Result<()>) -> Result<()> {
    match res {
        Err(Error::Generic(msg)) => {
            if exists(ch, path).await? {
                Err(Error::FileExists)
            } else {
                Err(Error::Generic(msg))
            }
        }
        res => res,
    }
}

/// Stat `path`, walking the symlink chain by hand when asked to follow
/// links. Protocol version 3 has no stat that reports both ends.
async fn stat_path(
    ch: &mut Channel,
    path: &str,
    options: FileInfoOptions,
    config: &Config,
) -> Result<FileInfo> {
    let block_size = config.io_block_size();
    let mut info = FileInfo::from_attr(&ch.lstat(path).await?, block_size);

    if info.has_type(FileType::SymbolicLink) {
        if options.contains(FileInfoOptions::FOLLOW_LINKS) {
            let mut target_path: Option<String> = None;
            let mut last_valid: Option<FileInfo> = None;
            let mut hops = 0;

            loop {
                hops += 1;
                if hops > config.max_symlink_depth {
                    tracing::debug!(path, hops, "symlink chain too long");
                    return Err(Error::TooManyLinks);
                }

                let current = target_path.as_deref().unwrap_or(path);
                let link = match ch.readlink(current).await {
                    Ok(link) => link,
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(..) => break,
                };
                let next = uri::resolve_symlink(current, &link);
                let attr = ch.lstat(&next).await;
                target_path = Some(next);

                let target = match attr {
                    Ok(attr) => FileInfo::from_attr(&attr, block_size),
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(..) => break,
                };
                if !target.valid_fields.contains(FileInfoFields::TYPE) {
                    break;
                }
                let more = target.file_type == FileType::SymbolicLink;
                last_valid = Some(target);
                if !more {
                    break;
                }
            }

            if let Some(target) = last_valid {
                info = target;
            }
            info.is_symlink = true;
            info.symlink_name = target_path;
            info.valid_fields |= FileInfoFields::FLAGS;
            if info.symlink_name.is_some() {
                info.valid_fields |= FileInfoFields::SYMLINK_NAME;
            }
        } else {
            match ch.readlink(path).await {
                Ok(link) => {
                    info.symlink_name = Some(link);
                    info.valid_fields |= FileInfoFields::SYMLINK_NAME;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(..) => {}
            }
        }
    }

    info.name = uri::basename(path).to_owned();
    info.set_mime_type(options);
    Ok(info)
}

/// A server-side handle; closed in the background when dropped unclosed.
struct RemoteHandle {
    conn: ConnectionRef,
    handle: Bytes,
    open: bool,
}

impl RemoteHandle {
    async fn close(mut self) -> Result<()> {
        self.open = false;
        let res = async {
            let mut ch = self.conn.channel().await?;
            ch.close_handle(&self.handle).await
        }
        .await;
        self.conn.check(res)
    }
}

impl Drop for RemoteHandle {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(..) => {
                tracing::debug!(key = %self.conn.key(), "no runtime, handle is leaked");
                return;
            }
        };

        let conn = self.conn.clone();
        let handle = self.handle.clone();
        runtime.spawn(async move {
            let res = async {
                let mut ch = conn.channel().await?;
                ch.close_handle(&handle).await
            }
            .await;
            if let Err(err) = conn.check(res) {
                tracing::debug!(error = %err, "failed to close a dropped handle");
            }
        });
    }
}

/// An open remote file.
pub struct FileHandle {
    remote: RemoteHandle,
    path: String,
    offset: u64,
    config: Arc<Config>,
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("offset", &self.offset)
            .finish()
    }
}

impl FileHandle {
    fn window(&self) -> Window {
        Window {
            request_len: self.config.request_len,
            max_outstanding: self.config.max_outstanding,
        }
    }

    /// Read at the current position.
    ///
    /// Fails with [`Error::Eof`] when the position is at the end of file.
    pub async fn read(&mut self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize> {
        check_cancelled(cancel)?;
        let win = self.window();
        let conn = &self.remote.conn;
        let res = async {
            let mut ch = conn.channel().await?;
            pipeline::read(&mut ch, &self.remote.handle, self.offset, buf, win).await
        }
        .instrument(tracing::debug_span!("read", path = %self.path, offset = self.offset))
        .await;

        let n = conn.check(res)?;
        self.offset += n as u64;
        Ok(n)
    }

    /// Write at the current position.
    pub async fn write(&mut self, data: &[u8], cancel: &CancellationToken) -> Result<usize> {
        check_cancelled(cancel)?;
        let win = self.window();
        let conn = &self.remote.conn;
        let res = async {
            let mut ch = conn.channel().await?;
            pipeline::write(&mut ch, &self.remote.handle, self.offset, data, win).await
        }
        .instrument(tracing::debug_span!("write", path = %self.path, offset = self.offset))
        .await;

        let n = conn.check(res)?;
        self.offset += n as u64;
        Ok(n)
    }

    pub async fn seek(&mut self, pos: SeekPosition, cancel: &CancellationToken) -> Result<u64> {
        check_cancelled(cancel)?;
        let (base, delta) = match pos {
            SeekPosition::Start(offset) => {
                self.offset = offset;
                return Ok(offset);
            }
            SeekPosition::Current(delta) => (self.offset, delta),
            SeekPosition::End(delta) => {
                let info = self.stat(FileInfoOptions::empty()).await?;
                (info.size, delta)
            }
        };

        let offset = if delta < 0 {
            base.checked_sub(delta.unsigned_abs())
        } else {
            base.checked_add(delta as u64)
        }
        .ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            ))
        })?;
        self.offset = offset;
        Ok(offset)
    }

    pub fn tell(&self) -> u64 {
        self.offset
    }

    /// Stat the file this handle was opened for.
    ///
    /// FSTAT cannot tell a link from its target, so the path is used.
    pub async fn get_file_info(
        &self,
        options: FileInfoOptions,
        cancel: &CancellationToken,
    ) -> Result<FileInfo> {
        check_cancelled(cancel)?;
        self.stat(options).await
    }

    async fn stat(&self, options: FileInfoOptions) -> Result<FileInfo> {
        let conn = &self.remote.conn;
        if conn.version() == 0 {
            return Err(Error::NotSupported);
        }
        let res = async {
            let mut ch = conn.channel().await?;
            stat_path(&mut ch, &self.path, options, &self.config).await
        }
        .await;
        conn.check(res)
    }

    pub async fn close(self) -> Result<()> {
        tracing::debug!(path = %self.path, "close");
        self.remote.close().await
    }
}

/// An open remote directory.
pub struct DirHandle {
    remote: RemoteHandle,
    path: String,
    options: FileInfoOptions,
    pending: VecDeque<FileInfo>,
    exhausted: bool,
    config: Arc<Config>,
}

impl fmt::Debug for DirHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirHandle")
            .field("path", &self.path)
            .field("pending", &self.pending.len())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl DirHandle {
    /// The next entry, or `None` once the listing is complete.
    ///
    /// A round trip happens only when the buffered batch is used up.
    pub async fn read_next(&mut self, cancel: &CancellationToken) -> Result<Option<FileInfo>> {
        loop {
            if let Some(info) = self.pending.pop_front() {
                return Ok(Some(info));
            }
            if self.exhausted {
                return Ok(None);
            }
            check_cancelled(cancel)?;

            let conn = &self.remote.conn;
            let res = async {
                let mut ch = conn.channel().await?;
                let entries = match read_batch(&mut ch, &self.remote.handle).await? {
                    Some(entries) => entries,
                    None => return Ok(None),
                };
                let mut infos = Vec::with_capacity(entries.len());
                for entry in entries {
                    let info =
                        entry_info(&mut ch, &self.path, entry, self.options, &self.config).await?;
                    infos.push(info);
                }
                Ok(Some(infos))
            }
            .instrument(tracing::debug_span!("readdir", path = %self.path))
            .await;

            match conn.check(res)? {
                Some(infos) => {
                    tracing::trace!(count = infos.len(), "directory batch");
                    self.pending.extend(infos);
                }
                None => self.exhausted = true,
            }
        }
    }

    pub async fn close(self) -> Result<()> {
        tracing::debug!(path = %self.path, "closedir");
        self.remote.close().await
    }
}

async fn read_batch(ch: &mut Channel, handle: &[u8]) -> Result<Option<Vec<DirEntry>>> {
    match ch
        .request(sftp::SSH_FXP_READDIR, |buf| buf.put_block(handle))
        .await?
    {
        Reply::Name(entries) if entries.is_empty() => Ok(None),
        Reply::Name(entries) => Ok(Some(entries)),
        Reply::Status(st) => match st.into_result() {
            Err(Error::Eof) => Ok(None),
            Err(err) => Err(err),
            Ok(()) => Err(Error::protocol("got SSH_FX_OK in reply to READDIR")),
        },
        _ => Err(Error::protocol("unexpected reply to READDIR")),
    }
}

async fn entry_info(
    ch: &mut Channel,
    dir: &str,
    entry: DirEntry,
    options: FileInfoOptions,
    config: &Config,
) -> Result<FileInfo> {
    let mut info = FileInfo::from_attr(&entry.attrs, config.io_block_size());
    if info.has_type(FileType::SymbolicLink) {
        match stat_path(ch, &uri::join(dir, &entry.filename), options, config).await {
            Ok(mut resolved) => {
                resolved.name = entry.filename;
                return Ok(resolved);
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::debug!(name = %entry.filename, error = %err, "failed to stat a symlink entry");
            }
        }
    }
    info.name = entry.filename;
    info.set_mime_type(options);
    Ok(info)
}

/// A virtual filesystem backend reaching files over SFTP.
///
/// Connections are shared per login identity and outlive individual
/// operations until they have been idle for a while.
pub struct SftpVfs {
    config: Arc<Config>,
    registry: Registry,
}

impl fmt::Debug for SftpVfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpVfs")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}

impl SftpVfs {
    /// A backend that logs in by running the ssh client.
    pub fn new(config: Config, authenticator: Arc<dyn Authenticator>) -> Self {
        let connector = Arc::new(SshConnector::new(config.clone(), authenticator));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Self {
        let registry = Registry::new(connector, config.idle_timeout);
        Self {
            config: Arc::new(config),
            registry,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Close every connection.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }

    async fn connect(&self, uri: &Uri, cancel: &CancellationToken) -> Result<ConnectionRef> {
        check_cancelled(cancel)?;
        self.registry.acquire(uri).await
    }

    async fn open_file(
        &self,
        uri: &Uri,
        flags: OpenFlag,
        attrs: FileAttr,
        cancel: &CancellationToken,
    ) -> Result<FileHandle> {
        let conn = self.connect(uri, cancel).await?;
        let path = uri.path();
        let res = async {
            let mut ch = conn.channel().await?;
            ch.request_handle(sftp::SSH_FXP_OPEN, |buf| {
                buf.put_str(path);
                buf.put_u32(flags.bits());
                attrs.encode(buf);
            })
            .await
        }
        .instrument(tracing::debug_span!("open", %uri, ?flags))
        .await;
        let handle = conn.check(res)?;

        Ok(FileHandle {
            remote: RemoteHandle {
                conn,
                handle,
                open: true,
            },
            path: path.to_owned(),
            offset: 0,
            config: self.config.clone(),
        })
    }

    /// Open an existing file.
    ///
    /// Writing without [`OpenMode::RANDOM`] truncates the file.
    pub async fn open(
        &self,
        uri: &Uri,
        mode: OpenMode,
        cancel: &CancellationToken,
    ) -> Result<FileHandle> {
        let mut flags = OpenFlag::empty();
        if mode.contains(OpenMode::READ) {
            flags |= OpenFlag::READ;
        }
        if mode.contains(OpenMode::WRITE) {
            flags |= OpenFlag::WRITE;
        }
        if mode.contains(OpenMode::TRUNCATE)
            || (mode.contains(OpenMode::WRITE) && !mode.contains(OpenMode::RANDOM))
        {
            flags |= OpenFlag::TRUNC;
        }
        self.open_file(uri, flags, FileAttr::default(), cancel)
            .await
    }

    /// Create a file, replacing an existing one unless `exclusive` is set.
    pub async fn create(
        &self,
        uri: &Uri,
        mode: OpenMode,
        exclusive: bool,
        perm: u32,
        cancel: &CancellationToken,
    ) -> Result<FileHandle> {
        let mut flags = OpenFlag::CREAT;
        if mode.contains(OpenMode::READ) {
            flags |= OpenFlag::READ;
        }
        if mode.contains(OpenMode::WRITE) {
            flags |= OpenFlag::WRITE;
        }
        flags |= if exclusive {
            OpenFlag::EXCL
        } else {
            OpenFlag::TRUNC
        };

        let mut attrs = FileAttr::default();
        attrs.permissions = Some(perm);
        self.open_file(uri, flags, attrs, cancel).await
    }

    pub async fn get_file_info(
        &self,
        uri: &Uri,
        options: FileInfoOptions,
        cancel: &CancellationToken,
    ) -> Result<FileInfo> {
        let conn = self.connect(uri, cancel).await?;
        if conn.version() == 0 {
            return Err(Error::NotSupported);
        }
        let res = async {
            let mut ch = conn.channel().await?;
            stat_path(&mut ch, uri.path(), options, &self.config).await
        }
        .instrument(tracing::debug_span!("get_file_info", %uri, ?options))
        .await;
        conn.check(res)
    }

    pub async fn open_directory(
        &self,
        uri: &Uri,
        options: FileInfoOptions,
        cancel: &CancellationToken,
    ) -> Result<DirHandle> {
        let conn = self.connect(uri, cancel).await?;
        let path = uri.path();
        let res = async {
            let mut ch = conn.channel().await?;
            match ch
                .request_handle(sftp::SSH_FXP_OPENDIR, |buf| buf.put_str(path))
                .await
            {
                Err(Error::Eof) => Err(Error::NotFound),
                res => res,
            }
        }
        .instrument(tracing::debug_span!("open_directory", %uri))
        .await;
        let handle = conn.check(res)?;

        Ok(DirHandle {
            remote: RemoteHandle {
                conn,
                handle,
                open: true,
            },
            path: path.to_owned(),
            options,
            pending: VecDeque::new(),
            exhausted: false,
            config: self.config.clone(),
        })
    }

    pub async fn make_directory(
        &self,
        uri: &Uri,
        perm: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let conn = self.connect(uri, cancel).await?;
        let path = uri.path();
        let res = async {
            let mut ch = conn.channel().await?;
            let mut attrs = FileAttr::default();
            attrs.permissions = Some(perm & 0o7777);
            let res = ch
                .request_status(sftp::SSH_FXP_MKDIR, |buf| {
                    buf.put_str(path);
                    attrs.encode(buf);
                })
                .await;
            exists_on_failure(&mut ch, path, res).await
        }
        .instrument(tracing::debug_span!("make_directory", %uri, perm))
        .await;
        conn.check(res)
    }

    pub async fn remove_directory(&self, uri: &Uri, cancel: &CancellationToken) -> Result<()> {
        self.simple_path_request(uri, sftp::SSH_FXP_RMDIR, "remove_directory", cancel)
            .await
    }

    pub async fn unlink(&self, uri: &Uri, cancel: &CancellationToken) -> Result<()> {
        self.simple_path_request(uri, sftp::SSH_FXP_REMOVE, "unlink", cancel)
            .await
    }

    async fn simple_path_request(
        &self,
        uri: &Uri,
        packet_type: u8,
        op: &'static str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let conn = self.connect(uri, cancel).await?;
        let res = async {
            let mut ch = conn.channel().await?;
            ch.request_status(packet_type, |buf| buf.put_str(uri.path()))
                .await
        }
        .instrument(tracing::debug_span!("path_request", op, %uri))
        .await;
        conn.check(res)
    }

    /// Move a file within one server.
    ///
    /// With `force_replace` an existing destination is removed first; the
    /// destination is briefly absent in between.
    pub async fn move_file(
        &self,
        old: &Uri,
        new: &Uri,
        force_replace: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !old.same_fs(new) {
            return Err(Error::NotSameFilesystem);
        }
        let conn = self.connect(old, cancel).await?;
        let res = async {
            let mut ch = conn.channel().await?;
            if force_replace {
                match ch
                    .request_status(sftp::SSH_FXP_REMOVE, |buf| buf.put_str(new.path()))
                    .await
                {
                    Ok(()) | Err(Error::NotFound) => {}
                    Err(err) => return Err(err),
                }
            }
            ch.request_status(sftp::SSH_FXP_RENAME, |buf| {
                buf.put_str(old.path());
                buf.put_str(new.path());
            })
            .await
        }
        .instrument(tracing::debug_span!("move", %old, %new, force_replace))
        .await;
        conn.check(res)
    }

    /// Give the file at `uri` a new name in the same directory.
    pub async fn rename(
        &self,
        uri: &Uri,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let new = uri.with_path(&uri::join(uri::dirname(uri.path()), new_name));
        self.move_file(uri, &new, false, cancel).await
    }

    pub async fn set_file_info(
        &self,
        uri: &Uri,
        info: &SetFileInfo,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut attrs = FileAttr::default();
        attrs.permissions = info.permissions.map(|perm| perm & 0o777);
        attrs.uid_gid = info.owner;
        attrs.ac_mod_time = info.times;

        if attrs != FileAttr::default() {
            let conn = self.connect(uri, cancel).await?;
            let res = async {
                let mut ch = conn.channel().await?;
                ch.request_status(sftp::SSH_FXP_SETSTAT, |buf| {
                    buf.put_str(uri.path());
                    attrs.encode(buf);
                })
                .await
            }
            .instrument(tracing::debug_span!("set_file_info", %uri))
            .await;
            conn.check(res)?;
        }

        if let Some(name) = &info.name {
            self.rename(uri, name, cancel).await?;
        }
        Ok(())
    }

    /// Create a symlink at `uri` pointing to `target`.
    ///
    /// `target` is a path, or an sftp URI on the same server.
    pub async fn create_symlink(
        &self,
        uri: &Uri,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let conn = self.connect(uri, cancel).await?;
        if conn.version() < 3 {
            return Err(Error::NotSupported);
        }

        let target = match Uri::parse(target) {
            Ok(target_uri) => {
                if !target_uri.same_fs(uri) {
                    return Err(Error::NotSameFilesystem);
                }
                target_uri.path().to_owned()
            }
            Err(..) => target.to_owned(),
        };

        let link = uri.path();
        let (first, second) = if self.config.reverse_symlink_arguments {
            (target.as_str(), link)
        } else {
            (link, target.as_str())
        };
        let res = async {
            let mut ch = conn.channel().await?;
            let res = ch
                .request_status(sftp::SSH_FXP_SYMLINK, |buf| {
                    buf.put_str(first);
                    buf.put_str(second);
                })
                .await;
            exists_on_failure(&mut ch, link, res).await
        }
        .instrument(tracing::debug_span!("create_symlink", %uri, %target))
        .await;
        conn.check(res)
    }

    /// Canonical absolute form of the path of `uri`, as the server sees it.
    pub async fn real_path(&self, uri: &Uri, cancel: &CancellationToken) -> Result<Uri> {
        let conn = self.connect(uri, cancel).await?;
        let res = async {
            let mut ch = conn.channel().await?;
            ch.request_names(sftp::SSH_FXP_REALPATH, |buf| buf.put_str(uri.path()))
                .await
        }
        .instrument(tracing::debug_span!("real_path", %uri))
        .await;

        let mut entries = conn.check(res)?;
        match entries.len() {
            0 => Err(Error::NotFound),
            1 => Ok(uri.with_path(&entries.remove(0).filename)),
            n => Err(Error::protocol(format!(
                "unexpected filename count ({}, 1 expected)",
                n
            ))),
        }
    }

    /// Whether both locations can be moved between atomically.
    pub fn check_same_fs(&self, a: &Uri, b: &Uri) -> bool {
        a.same_fs(b)
    }

    pub fn is_local(&self, _: &Uri) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, MockFs};

    fn vfs_with(fs: &MockFs, config: Config) -> (SftpVfs, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::new(fs.clone()));
        (SftpVfs::with_connector(config, connector.clone()), connector)
    }

    fn vfs(fs: &MockFs) -> SftpVfs {
        vfs_with(fs, Config::default()).0
    }

    fn uri(path: &str) -> Uri {
        Uri::parse(&format!("sftp://alice@example.com{}", path)).unwrap()
    }

    fn follow() -> FileInfoOptions {
        FileInfoOptions::FOLLOW_LINKS
    }

    #[tokio::test]
    async fn write_tiles_the_range() {
        let fs = MockFs::new();
        let mut config = Config::default();
        config.request_len = 1000;
        let (vfs, connector) = vfs_with(&fs, config);
        let cancel = CancellationToken::new();

        let mut file = vfs
            .create(&uri("/tmp/x"), OpenMode::WRITE, false, 0o644, &cancel)
            .await
            .unwrap();
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(file.write(&data, &cancel).await.unwrap(), 4096);
        assert_eq!(file.tell(), 4096);
        file.close().await.unwrap();

        assert_eq!(connector.connects(), 1);
        assert_eq!(fs.contents("/tmp/x").unwrap(), data);
        assert_eq!(fs.open_handles(), 0);

        let log = fs.requests();
        let types: Vec<u8> = log.iter().map(|r| r.typ).collect();
        assert_eq!(types.first(), Some(&sftp::SSH_FXP_INIT));
        assert_eq!(types[1], sftp::SSH_FXP_OPEN);
        assert_eq!(types.last(), Some(&sftp::SSH_FXP_CLOSE));
        assert_eq!(
            types.iter().filter(|&&t| t == sftp::SSH_FXP_OPEN).count(),
            1
        );

        let mut ranges: Vec<(u64, u64)> = log
            .iter()
            .filter(|r| r.typ == sftp::SSH_FXP_WRITE)
            .map(|r| (r.offset.unwrap(), r.offset.unwrap() + u64::from(r.len.unwrap())))
            .collect();
        ranges.sort_unstable();
        assert_eq!(ranges.first().unwrap().0, 0);
        assert_eq!(ranges.last().unwrap().1, 4096);
        assert!(ranges.windows(2).all(|w| w[0].1 == w[1].0));
    }

    #[tokio::test]
    async fn read_survives_short_and_reordered_replies() {
        let fs = MockFs::new();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
        fs.add_file("/data.bin", data.clone());
        fs.configure(|knobs| {
            knobs.short_read = Some(700);
            knobs.reverse_replies = true;
        });
        let mut config = Config::default();
        config.request_len = 1024;
        config.max_outstanding = 4;
        let (vfs, _) = vfs_with(&fs, config);
        let cancel = CancellationToken::new();

        let mut file = vfs
            .open(&uri("/data.bin"), OpenMode::READ, &cancel)
            .await
            .unwrap();
        let mut out = vec![];
        let mut buf = vec![0; 4096];
        loop {
            match file.read(&mut buf, &cancel).await {
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(Error::Eof) => break,
                Err(err) => panic!("read failed: {}", err),
            }
        }
        assert_eq!(out, data);
        file.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_read_leaves_the_connection_usable() {
        let fs = MockFs::new();
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        fs.add_file("/data.bin", data.clone());
        fs.add_file("/other", b"other".to_vec());
        fs.configure(|knobs| {
            knobs.fail_reads_from = Some((2048, sftp::SSH_FX_PERMISSION_DENIED));
        });
        let mut config = Config::default();
        config.request_len = 1024;
        config.max_outstanding = 4;
        let (vfs, connector) = vfs_with(&fs, config);
        let cancel = CancellationToken::new();

        let mut file = vfs
            .open(&uri("/data.bin"), OpenMode::READ, &cancel)
            .await
            .unwrap();
        let mut buf = vec![0; 8192];
        assert!(matches!(
            file.read(&mut buf, &cancel).await,
            Err(Error::PermissionDenied)
        ));
        assert_eq!(file.tell(), 0);

        let info = vfs
            .get_file_info(&uri("/other"), FileInfoOptions::empty(), &cancel)
            .await
            .unwrap();
        assert_eq!(info.size, 5);

        let mut head = vec![0; 2048];
        assert_eq!(file.read(&mut head, &cancel).await.unwrap(), 2048);
        assert_eq!(head, &data[..2048]);
        file.close().await.unwrap();

        assert_eq!(connector.connects(), 1);
        assert_eq!(fs.open_handles(), 0);
    }

    #[tokio::test]
    async fn dropped_read_leaves_the_connection_usable() {
        let fs = MockFs::new();
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 241) as u8).collect();
        fs.add_file("/a", data.clone());
        fs.add_file("/b", b"bee".to_vec());
        let mut config = Config::default();
        config.request_len = 1024;
        config.max_outstanding = 4;
        let (vfs, connector) = vfs_with(&fs, config);
        let cancel = CancellationToken::new();

        let mut file = vfs.open(&uri("/a"), OpenMode::READ, &cancel).await.unwrap();
        let mut buf = vec![0; 8192];
        {
            let read = file.read(&mut buf, &cancel);
            futures::pin_mut!(read);
            assert!(futures::poll!(read.as_mut()).is_pending());
        }
        assert_eq!(file.tell(), 0);

        let info = vfs
            .get_file_info(&uri("/b"), FileInfoOptions::empty(), &cancel)
            .await
            .unwrap();
        assert_eq!(info.size, 3);

        assert_eq!(file.read(&mut buf, &cancel).await.unwrap(), 8192);
        assert_eq!(buf, data);
        file.close().await.unwrap();

        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn read_past_the_largest_offset_is_refused() {
        let fs = MockFs::new();
        fs.add_file("/a", b"0123456789".to_vec());
        let (vfs, connector) = vfs_with(&fs, Config::default());
        let cancel = CancellationToken::new();

        let mut file = vfs.open(&uri("/a"), OpenMode::READ, &cancel).await.unwrap();
        file.seek(SeekPosition::Start(u64::MAX - 10), &cancel)
            .await
            .unwrap();
        let mut buf = vec![0; 100_000];
        match file.read(&mut buf, &cancel).await {
            Err(Error::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::InvalidInput),
            res => panic!("unexpected result: {:?}", res),
        }
        assert!(file.write(b"xyz", &cancel).await.is_err());
        assert_eq!(file.tell(), u64::MAX - 10);

        // the connection is not given up over a rejected range.
        file.seek(SeekPosition::Start(4), &cancel).await.unwrap();
        let mut head = [0u8; 3];
        assert_eq!(file.read(&mut head, &cancel).await.unwrap(), 3);
        assert_eq!(&head, b"456");
        file.close().await.unwrap();
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn open_for_writing_truncates_unless_random() {
        let fs = MockFs::new();
        fs.add_file("/a", b"0123456789".to_vec());
        let vfs = vfs(&fs);
        let cancel = CancellationToken::new();

        let mut file = vfs
            .open(&uri("/a"), OpenMode::WRITE | OpenMode::RANDOM, &cancel)
            .await
            .unwrap();
        file.seek(SeekPosition::Start(2), &cancel).await.unwrap();
        file.write(b"xy", &cancel).await.unwrap();
        file.close().await.unwrap();
        assert_eq!(fs.contents("/a").unwrap(), b"01xy456789");

        let file = vfs
            .open(&uri("/a"), OpenMode::WRITE, &cancel)
            .await
            .unwrap();
        file.close().await.unwrap();
        assert_eq!(fs.contents("/a").unwrap(), b"");
    }

    #[tokio::test]
    async fn exclusive_create_fails_on_existing_file() {
        let fs = MockFs::new();
        fs.add_file("/a", b"keep".to_vec());
        let vfs = vfs(&fs);
        let cancel = CancellationToken::new();

        let res = vfs
            .create(&uri("/a"), OpenMode::WRITE, true, 0o600, &cancel)
            .await;
        assert!(matches!(res, Err(Error::Generic(..))));
        assert_eq!(fs.contents("/a").unwrap(), b"keep");

        let file = vfs
            .create(&uri("/b"), OpenMode::WRITE, true, 0o600, &cancel)
            .await
            .unwrap();
        file.close().await.unwrap();
        assert_eq!(fs.mode("/b"), Some(S_IFREG | 0o600));
    }

    #[tokio::test]
    async fn seek_from_end_uses_remote_size() {
        let fs = MockFs::new();
        fs.add_file("/a", vec![0; 100]);
        let vfs = vfs(&fs);
        let cancel = CancellationToken::new();

        let mut file = vfs.open(&uri("/a"), OpenMode::READ, &cancel).await.unwrap();
        assert_eq!(file.seek(SeekPosition::End(-10), &cancel).await.unwrap(), 90);
        assert_eq!(file.seek(SeekPosition::Current(5), &cancel).await.unwrap(), 95);
        assert!(file.seek(SeekPosition::Current(-200), &cancel).await.is_err());
        assert_eq!(file.tell(), 95);

        let mut buf = [0; 32];
        assert_eq!(file.read(&mut buf, &cancel).await.unwrap(), 5);
        assert!(matches!(file.read(&mut buf, &cancel).await, Err(Error::Eof)));
        file.close().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_handle_is_closed_in_background() {
        let fs = MockFs::new();
        fs.add_file("/a", b"x".to_vec());
        let vfs = vfs(&fs);
        let cancel = CancellationToken::new();

        let file = vfs.open(&uri("/a"), OpenMode::READ, &cancel).await.unwrap();
        assert_eq!(fs.open_handles(), 1);
        drop(file);

        for _ in 0..100 {
            if fs.open_handles() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(fs.open_handles(), 0);
    }

    #[tokio::test]
    async fn stat_regular_file() {
        let fs = MockFs::new();
        fs.add_dir("/docs");
        fs.add_file("/docs/report.pdf", vec![0; 42]);
        let vfs = vfs(&fs);

        let info = vfs
            .get_file_info(&uri("/docs/report.pdf"), follow(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(info.name, "report.pdf");
        assert_eq!(info.file_type, FileType::Regular);
        assert_eq!(info.size, 42);
        assert_eq!(info.permissions, 0o644);
        assert_eq!(info.mime_type, Some("application/pdf"));
        assert!(!info.is_symlink);
        assert!(!info.valid_fields.contains(FileInfoFields::SYMLINK_NAME));
        assert_eq!(info.io_block_size, vfs.config().io_block_size());
    }

    #[tokio::test]
    async fn stat_root_and_directory() {
        let fs = MockFs::new();
        fs.add_dir("/docs");
        let vfs = vfs(&fs);
        let cancel = CancellationToken::new();

        let root = vfs
            .get_file_info(&uri("/"), FileInfoOptions::empty(), &cancel)
            .await
            .unwrap();
        assert_eq!(root.name, "/");
        assert_eq!(root.mime_type, Some("x-directory/normal"));

        let dir = vfs
            .get_file_info(&uri("/docs"), FileInfoOptions::empty(), &cancel)
            .await
            .unwrap();
        assert_eq!(dir.name, "docs");
        assert_eq!(dir.file_type, FileType::Directory);
    }

    #[tokio::test]
    async fn stat_symlink_without_following() {
        let fs = MockFs::new();
        fs.add_file("/target.txt", b"hello".to_vec());
        fs.add_symlink("/link", "target.txt");
        let vfs = vfs(&fs);

        let info = vfs
            .get_file_info(&uri("/link"), FileInfoOptions::empty(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(info.name, "link");
        assert_eq!(info.file_type, FileType::SymbolicLink);
        assert!(info.is_symlink);
        assert_eq!(info.symlink_name.as_deref(), Some("target.txt"));
        assert_eq!(info.mime_type, Some(mime::SYMLINK_MIME_TYPE));
    }

    #[tokio::test]
    async fn stat_follows_link_chain() {
        let fs = MockFs::new();
        fs.add_dir("/a");
        fs.add_dir("/b");
        fs.add_file("/b/page.html", vec![0; 7]);
        fs.add_symlink("/a/second", "/b/page.html");
        fs.add_symlink("/first", "a/second");
        let vfs = vfs(&fs);

        let info = vfs
            .get_file_info(&uri("/first"), follow(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(info.name, "first");
        assert_eq!(info.file_type, FileType::Regular);
        assert_eq!(info.size, 7);
        assert!(info.is_symlink);
        assert_eq!(info.symlink_name.as_deref(), Some("/b/page.html"));
        assert_eq!(info.mime_type, Some("text/html"));
    }

    #[tokio::test]
    async fn broken_link_reports_the_link() {
        let fs = MockFs::new();
        fs.add_symlink("/dangling", "/nowhere.txt");
        let vfs = vfs(&fs);

        let info = vfs
            .get_file_info(&uri("/dangling"), follow(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(info.file_type, FileType::SymbolicLink);
        assert!(info.is_symlink);
        assert_eq!(info.symlink_name.as_deref(), Some("/nowhere.txt"));
        assert_eq!(info.mime_type, Some(mime::SYMLINK_MIME_TYPE));
    }

    #[tokio::test]
    async fn cyclic_links_are_bounded() {
        let fs = MockFs::new();
        fs.add_symlink("/ping", "pong");
        fs.add_symlink("/pong", "ping");
        let vfs = vfs(&fs);

        let res = vfs
            .get_file_info(&uri("/ping"), follow(), &CancellationToken::new())
            .await;
        assert!(matches!(res, Err(Error::TooManyLinks)));

        // the connection is still usable.
        let info = vfs
            .get_file_info(&uri("/ping"), FileInfoOptions::empty(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(info.symlink_name.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn stat_requires_protocol_version() {
        let fs = MockFs::new();
        fs.configure(|knobs| knobs.version = 0);
        let vfs = vfs(&fs);
        let cancel = CancellationToken::new();

        assert!(matches!(
            vfs.get_file_info(&uri("/"), follow(), &cancel).await,
            Err(Error::NotSupported)
        ));
        assert!(matches!(
            vfs.create_symlink(&uri("/l"), "/t", &cancel).await,
            Err(Error::NotSupported)
        ));
    }

    #[tokio::test]
    async fn missing_file() {
        let vfs = vfs(&MockFs::new());
        let res = vfs
            .get_file_info(&uri("/nope"), follow(), &CancellationToken::new())
            .await;
        assert!(matches!(res, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let fs = MockFs::new();
        let (vfs, connector) = vfs_with(&fs, Config::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let res = vfs.get_file_info(&uri("/"), follow(), &cancel).await;
        assert!(matches!(res, Err(Error::Cancelled)));
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test]
    async fn list_directory_in_batches() {
        let fs = MockFs::new();
        fs.add_dir("/d");
        for i in 0..7 {
            fs.add_file(&format!("/d/f{}.txt", i), vec![0; i]);
        }
        fs.add_dir("/d/sub");
        fs.add_file("/target.png", vec![0; 3]);
        fs.add_symlink("/d/pic", "/target.png");
        fs.configure(|knobs| knobs.readdir_batch = 3);
        let vfs = vfs(&fs);
        let cancel = CancellationToken::new();

        let mut dir = vfs
            .open_directory(&uri("/d"), follow(), &cancel)
            .await
            .unwrap();
        let mut entries = vec![];
        while let Some(info) = dir.read_next(&cancel).await.unwrap() {
            entries.push(info);
        }
        assert!(dir.read_next(&cancel).await.unwrap().is_none());
        dir.close().await.unwrap();

        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            [".", "..", "f0.txt", "f1.txt", "f2.txt", "f3.txt", "f4.txt", "f5.txt", "f6.txt", "pic", "sub"]
        );

        let f3 = &entries[5];
        assert_eq!(f3.size, 3);
        assert_eq!(f3.mime_type, Some("text/plain"));

        let pic = &entries[9];
        assert_eq!(pic.file_type, FileType::Regular);
        assert!(pic.is_symlink);
        assert_eq!(pic.symlink_name.as_deref(), Some("/target.png"));
        assert_eq!(pic.mime_type, Some("image/png"));

        assert_eq!(entries[10].mime_type, Some("x-directory/normal"));

        let readdirs = fs
            .requests()
            .iter()
            .filter(|r| r.typ == sftp::SSH_FXP_READDIR)
            .count();
        // four full batches and the terminating EOF.
        assert_eq!(readdirs, 5);
    }

    #[tokio::test]
    async fn listing_stops_when_cancelled() {
        let fs = MockFs::new();
        fs.add_dir("/d");
        for i in 0..4 {
            fs.add_file(&format!("/d/{}", i), vec![]);
        }
        fs.configure(|knobs| knobs.readdir_batch = 2);
        let vfs = vfs(&fs);
        let cancel = CancellationToken::new();

        let mut dir = vfs
            .open_directory(&uri("/d"), FileInfoOptions::empty(), &cancel)
            .await
            .unwrap();
        assert!(dir.read_next(&cancel).await.unwrap().is_some());
        cancel.cancel();
        // the buffered entry is still handed out.
        assert!(dir.read_next(&cancel).await.unwrap().is_some());
        assert!(matches!(dir.read_next(&cancel).await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn open_directory_on_missing_path() {
        let vfs = vfs(&MockFs::new());
        let res = vfs
            .open_directory(&uri("/nope"), FileInfoOptions::empty(), &CancellationToken::new())
            .await;
        assert!(matches!(res, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn make_and_remove_directory() {
        let fs = MockFs::new();
        let vfs = vfs(&fs);
        let cancel = CancellationToken::new();

        vfs.make_directory(&uri("/new"), 0o750, &cancel).await.unwrap();
        assert_eq!(fs.mode("/new"), Some(S_IFDIR | 0o750));
        assert!(matches!(
            vfs.make_directory(&uri("/new"), 0o750, &cancel).await,
            Err(Error::FileExists)
        ));
        assert!(matches!(
            vfs.make_directory(&uri("/missing/child"), 0o750, &cancel).await,
            Err(Error::NotFound)
        ));

        fs.add_file("/new/file", vec![]);
        assert!(matches!(
            vfs.remove_directory(&uri("/new"), &cancel).await,
            Err(Error::Generic(..))
        ));
        vfs.unlink(&uri("/new/file"), &cancel).await.unwrap();
        vfs.remove_directory(&uri("/new"), &cancel).await.unwrap();
        assert!(!fs.exists("/new"));
    }

    #[tokio::test]
    async fn move_with_and_without_replace() {
        let fs = MockFs::new();
        fs.add_file("/a", b"a".to_vec());
        fs.add_file("/b", b"b".to_vec());
        let vfs = vfs(&fs);
        let cancel = CancellationToken::new();

        assert!(vfs.move_file(&uri("/a"), &uri("/b"), false, &cancel).await.is_err());
        assert_eq!(fs.contents("/b").unwrap(), b"b");

        fs.clear_requests();
        vfs.move_file(&uri("/a"), &uri("/b"), true, &cancel)
            .await
            .unwrap();
        assert!(!fs.exists("/a"));
        assert_eq!(fs.contents("/b").unwrap(), b"a");
        let types: Vec<u8> = fs.requests().iter().map(|r| r.typ).collect();
        assert_eq!(types, [sftp::SSH_FXP_REMOVE, sftp::SSH_FXP_RENAME]);

        // nothing to replace is fine.
        vfs.move_file(&uri("/b"), &uri("/c"), true, &cancel)
            .await
            .unwrap();
        assert_eq!(fs.contents("/c").unwrap(), b"a");
    }

    #[tokio::test]
    async fn move_across_servers_is_refused() {
        let fs = MockFs::new();
        let (vfs, connector) = vfs_with(&fs, Config::default());
        let other = Uri::parse("sftp://bob@example.com/b").unwrap();

        let res = vfs
            .move_file(&uri("/a"), &other, false, &CancellationToken::new())
            .await;
        assert!(matches!(res, Err(Error::NotSameFilesystem)));
        assert_eq!(connector.connects(), 0);
        assert!(!vfs.check_same_fs(&uri("/a"), &other));
        assert!(vfs.check_same_fs(&uri("/a"), &uri("/x/y")));
        assert!(!vfs.is_local(&uri("/a")));
    }

    #[tokio::test]
    async fn set_file_info_then_rename() {
        let fs = MockFs::new();
        fs.add_dir("/d");
        fs.add_file("/d/old", vec![]);
        let vfs = vfs(&fs);
        let cancel = CancellationToken::new();

        let change = SetFileInfo {
            name: Some("new".into()),
            permissions: Some(0o4755),
            times: Some((100, 200)),
            ..SetFileInfo::default()
        };
        vfs.set_file_info(&uri("/d/old"), &change, &cancel)
            .await
            .unwrap();

        assert!(!fs.exists("/d/old"));
        assert_eq!(fs.mode("/d/new"), Some(S_IFREG | 0o755));
        assert_eq!(fs.times("/d/new"), Some((100, 200)));
        let setstats = fs
            .requests()
            .iter()
            .filter(|r| r.typ == sftp::SSH_FXP_SETSTAT)
            .count();
        assert_eq!(setstats, 1);
    }

    #[tokio::test]
    async fn symlink_argument_order() {
        let fs = MockFs::new();
        let vfs = vfs(&fs);
        let cancel = CancellationToken::new();

        vfs.create_symlink(&uri("/link"), "/target", &cancel)
            .await
            .unwrap();
        let info = vfs
            .get_file_info(&uri("/link"), FileInfoOptions::empty(), &cancel)
            .await
            .unwrap();
        assert_eq!(info.symlink_name.as_deref(), Some("/target"));

        let sent = fs
            .requests()
            .into_iter()
            .find(|r| r.typ == sftp::SSH_FXP_SYMLINK)
            .unwrap();
        assert_eq!(sent.path.as_deref(), Some("/target"));
        assert_eq!(sent.target.as_deref(), Some("/link"));

        assert!(matches!(
            vfs.create_symlink(&uri("/link"), "/elsewhere", &cancel).await,
            Err(Error::FileExists)
        ));
    }

    #[tokio::test]
    async fn symlink_in_draft_order() {
        let fs = MockFs::new();
        let mut config = Config::default();
        config.reverse_symlink_arguments = false;
        let (vfs, _) = vfs_with(&fs, config);

        // the mock server reads OpenSSH's order, so the roles swap.
        vfs.create_symlink(&uri("/link"), "/target", &CancellationToken::new())
            .await
            .unwrap();
        let sent = fs
            .requests()
            .into_iter()
            .find(|r| r.typ == sftp::SSH_FXP_SYMLINK)
            .unwrap();
        assert_eq!(sent.path.as_deref(), Some("/link"));
        assert_eq!(sent.target.as_deref(), Some("/target"));
    }

    #[tokio::test]
    async fn symlink_target_uri() {
        let fs = MockFs::new();
        let vfs = vfs(&fs);
        let cancel = CancellationToken::new();

        vfs.create_symlink(&uri("/link"), "sftp://alice@example.com/dir/t", &cancel)
            .await
            .unwrap();
        let info = vfs
            .get_file_info(&uri("/link"), FileInfoOptions::empty(), &cancel)
            .await
            .unwrap();
        assert_eq!(info.symlink_name.as_deref(), Some("/dir/t"));

        assert!(matches!(
            vfs.create_symlink(&uri("/l2"), "sftp://other.host/t", &cancel).await,
            Err(Error::NotSameFilesystem)
        ));
    }

    #[tokio::test]
    async fn real_path_canonicalizes() {
        let fs = MockFs::new();
        fs.add_dir("/home");
        let vfs = vfs(&fs);

        let real = vfs
            .real_path(&uri("/home/../home/./"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(real.path(), "/home");
        assert_eq!(real.host(), "example.com");
    }

    #[tokio::test]
    async fn operations_share_one_connection() {
        let fs = MockFs::new();
        fs.add_file("/a", vec![]);
        let (vfs, connector) = vfs_with(&fs, Config::default());
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            vfs.get_file_info(&uri("/a"), follow(), &cancel).await.unwrap();
        }
        assert_eq!(connector.connects(), 1);

        vfs.shutdown().await;
        vfs.get_file_info(&uri("/a"), follow(), &cancel).await.unwrap();
        assert_eq!(connector.connects(), 2);
    }
}
