//! SFTP v3 packet definitions and the request/reply engine of a connection.

// Refs:
// * https://tools.ietf.org/html/draft-ietf-secsh-filexfer-02
// * https://tools.ietf.org/html/rfc4251
// * https://cvsweb.openbsd.org/cgi-bin/cvsweb/src/usr.bin/ssh/sftp-server.c?rev=1.120&content-type=text/x-cvsweb-markup

use crate::{
    buffer::Buffer,
    error::{Error, Result},
};
use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

pub const SFTP_PROTOCOL_VERSION: u32 = 3;

// defined in https://tools.ietf.org/html/draft-ietf-secsh-filexfer-02#section-3
pub const SSH_FXP_INIT: u8 = 1;
pub const SSH_FXP_VERSION: u8 = 2;
pub const SSH_FXP_OPEN: u8 = 3;
pub const SSH_FXP_CLOSE: u8 = 4;
pub const SSH_FXP_READ: u8 = 5;
pub const SSH_FXP_WRITE: u8 = 6;
pub const SSH_FXP_LSTAT: u8 = 7;
pub const SSH_FXP_FSTAT: u8 = 8;
pub const SSH_FXP_SETSTAT: u8 = 9;
pub const SSH_FXP_OPENDIR: u8 = 11;
pub const SSH_FXP_READDIR: u8 = 12;
pub const SSH_FXP_REMOVE: u8 = 13;
pub const SSH_FXP_MKDIR: u8 = 14;
pub const SSH_FXP_RMDIR: u8 = 15;
pub const SSH_FXP_REALPATH: u8 = 16;
pub const SSH_FXP_RENAME: u8 = 18;
pub const SSH_FXP_READLINK: u8 = 19;
pub const SSH_FXP_SYMLINK: u8 = 20;
pub const SSH_FXP_STATUS: u8 = 101;
pub const SSH_FXP_HANDLE: u8 = 102;
pub const SSH_FXP_DATA: u8 = 103;
pub const SSH_FXP_NAME: u8 = 104;
pub const SSH_FXP_ATTRS: u8 = 105;

// defined in https://tools.ietf.org/html/draft-ietf-secsh-filexfer-02#section-5
pub const SSH_FILEXFER_ATTR_SIZE: u32 = 0x00000001;
pub const SSH_FILEXFER_ATTR_UIDGID: u32 = 0x00000002;
pub const SSH_FILEXFER_ATTR_PERMISSIONS: u32 = 0x00000004;
pub const SSH_FILEXFER_ATTR_ACMODTIME: u32 = 0x00000008;
pub const SSH_FILEXFER_ATTR_EXTENDED: u32 = 0x80000000;

// defined in https://tools.ietf.org/html/draft-ietf-secsh-filexfer-02#section-6.3
const SSH_FXF_READ: u32 = 0x00000001;
const SSH_FXF_WRITE: u32 = 0x00000002;
const SSH_FXF_APPEND: u32 = 0x00000004;
const SSH_FXF_CREAT: u32 = 0x00000008;
const SSH_FXF_TRUNC: u32 = 0x00000010;
const SSH_FXF_EXCL: u32 = 0x00000020;

// defined in https://tools.ietf.org/html/draft-ietf-secsh-filexfer-02#section-7
pub const SSH_FX_OK: u32 = 0;
pub const SSH_FX_EOF: u32 = 1;
pub const SSH_FX_NO_SUCH_FILE: u32 = 2;
pub const SSH_FX_PERMISSION_DENIED: u32 = 3;
pub const SSH_FX_FAILURE: u32 = 4;
pub const SSH_FX_BAD_MESSAGE: u32 = 5;
pub const SSH_FX_NO_CONNECTION: u32 = 6;
pub const SSH_FX_CONNECTION_LOST: u32 = 7;
pub const SSH_FX_OP_UNSUPPORTED: u32 = 8;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// described in https://tools.ietf.org/html/draft-ietf-secsh-filexfer-02#section-5
/// Attribute values as they travel on the wire.
///
/// A field is present only when the corresponding flag was set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct FileAttr {
    pub size: Option<u64>,
    pub uid_gid: Option<(u32, u32)>,
    pub permissions: Option<u32>,
    pub ac_mod_time: Option<(u32, u32)>,
    pub extended: Vec<(String, String)>,
}

impl FileAttr {
    pub fn atime(&self) -> Option<u32> {
        self.ac_mod_time.map(|(atime, _)| atime)
    }

    pub fn mtime(&self) -> Option<u32> {
        self.ac_mod_time.map(|(_, mtime)| mtime)
    }

    /// The flag word announcing which fields are present.
    pub fn flags(&self) -> u32 {
        #[inline(always)]
        fn flag(b: bool, flag: u32) -> u32 {
            if b {
                flag
            } else {
                0
            }
        }

        flag(self.size.is_some(), SSH_FILEXFER_ATTR_SIZE)
            | flag(self.uid_gid.is_some(), SSH_FILEXFER_ATTR_UIDGID)
            | flag(self.permissions.is_some(), SSH_FILEXFER_ATTR_PERMISSIONS)
            | flag(self.ac_mod_time.is_some(), SSH_FILEXFER_ATTR_ACMODTIME)
            | flag(!self.extended.is_empty(), SSH_FILEXFER_ATTR_EXTENDED)
    }

    pub fn encode(&self, b: &mut Buffer) {
        b.put_u32(self.flags());
        if let Some(size) = self.size {
            b.put_u64(size);
        }
        if let Some((uid, gid)) = self.uid_gid {
            b.put_u32(uid);
            b.put_u32(gid);
        }
        if let Some(perm) = self.permissions {
            b.put_u32(perm);
        }
        if let Some((atime, mtime)) = self.ac_mod_time {
            b.put_u32(atime);
            b.put_u32(mtime);
        }
        if !self.extended.is_empty() {
            b.put_u32(self.extended.len() as u32);
            for (typ, data) in &self.extended {
                b.put_str(typ);
                b.put_str(data);
            }
        }
    }

    pub fn decode(b: &mut Buffer) -> Result<Self> {
        let flags = b.get_u32()?;

        let size = if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            Some(b.get_u64()?)
        } else {
            None
        };

        let uid_gid = if flags & SSH_FILEXFER_ATTR_UIDGID != 0 {
            let uid = b.get_u32()?;
            let gid = b.get_u32()?;
            Some((uid, gid))
        } else {
            None
        };

        let permissions = if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            Some(b.get_u32()?)
        } else {
            None
        };

        let ac_mod_time = if flags & SSH_FILEXFER_ATTR_ACMODTIME != 0 {
            let atime = b.get_u32()?;
            let mtime = b.get_u32()?;
            Some((atime, mtime))
        } else {
            None
        };

        let mut extended = vec![];
        if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
            let count = b.get_u32()?;
            for _ in 0..count {
                let ex_type = b.get_string()?;
                let ex_data = b.get_string()?;
                extended.push((ex_type, ex_data));
            }
        }

        Ok(FileAttr {
            size,
            uid_gid,
            permissions,
            ac_mod_time,
            extended,
        })
    }
}

/// One record of a NAME reply.
#[derive(Debug)]
#[non_exhaustive]
pub struct DirEntry {
    pub filename: String,
    pub longname: String,
    pub attrs: FileAttr,
}

bitflags::bitflags! {
    /// Open file flags.
    #[repr(transparent)]
    pub struct OpenFlag: u32 {
        /// Open the file for reading.
        const READ = SSH_FXF_READ;

        /// Open the file for writing.
        const WRITE = SSH_FXF_WRITE;

        /// Force all writes to append data at the end of the file.
        const APPEND = SSH_FXF_APPEND;

        /// A new file will be created if one does not already exist.
        ///
        /// When [`TRUNC`](Self::TRUNC) is specified at the same time
        /// as this flag, the new file will be truncated to zero length
        /// if it previously exists.
        const CREAT = SSH_FXF_CREAT;

        /// Forces an existing file with the same name to be truncated
        /// to zero length when creating a file.
        const TRUNC = SSH_FXF_TRUNC;

        /// Causes the request to fail if the named file already exists.
        ///
        /// This flag MUST be specified with [`CREAT`](Self::CREAT) if
        /// it is used.
        const EXCL = SSH_FXF_EXCL;
    }
}

/// The kind of response values received from the server.
#[derive(Debug)]
pub enum Reply {
    /// The operation finished, successfully or not.
    Status(RemoteStatus),

    /// An opened file handle.
    Handle(Bytes),

    /// Received data.
    Data(Bytes),

    /// Retrieved attribute values.
    Attrs(FileAttr),

    /// Directory entries or resolved names.
    Name(Vec<DirEntry>),

    /// The response type is unknown or currently not supported.
    Unknown { typ: u8 },
}

#[derive(Debug)]
pub struct RemoteStatus {
    pub code: u32,
    pub message: String,
}

impl RemoteStatus {
    pub fn into_result(self) -> Result<()> {
        match Error::from_status(self.code, &self.message) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

impl Reply {
    fn decode(typ: u8, packet: &mut Buffer) -> Result<Self> {
        let reply = match typ {
            SSH_FXP_STATUS => {
                let code = packet.get_u32()?;
                // SFTP v3 servers may omit the message and language tag.
                let message = if packet.is_empty() {
                    String::new()
                } else {
                    packet.get_string()?
                };
                if !packet.is_empty() {
                    let _language_tag = packet.get_block()?;
                }
                Reply::Status(RemoteStatus { code, message })
            }

            SSH_FXP_HANDLE => Reply::Handle(packet.get_block()?),

            SSH_FXP_DATA => Reply::Data(packet.get_block()?),

            SSH_FXP_ATTRS => Reply::Attrs(FileAttr::decode(packet)?),

            SSH_FXP_NAME => {
                let count = packet.get_u32()?;
                let mut entries = Vec::with_capacity(std::cmp::min(count as usize, 1024));
                for _ in 0..count {
                    let filename = packet.get_string()?;
                    let longname = packet.get_string()?;
                    let attrs = FileAttr::decode(packet)?;
                    entries.push(DirEntry {
                        filename,
                        longname,
                        attrs,
                    });
                }
                Reply::Name(entries)
            }

            typ => {
                packet.clear();
                Reply::Unknown { typ }
            }
        };

        Ok(reply)
    }

    fn kind(&self) -> &'static str {
        match self {
            Reply::Status(..) => "STATUS",
            Reply::Handle(..) => "HANDLE",
            Reply::Data(..) => "DATA",
            Reply::Attrs(..) => "ATTRS",
            Reply::Name(..) => "NAME",
            Reply::Unknown { .. } => "unknown",
        }
    }
}

fn unexpected(reply: &Reply, expected: &str) -> Error {
    Error::protocol(format!(
        "expected SSH_FXP_{} or SSH_FXP_STATUS, got {}",
        expected,
        reply.kind()
    ))
}

/// Send `SSH_FXP_INIT` and wait for `SSH_FXP_VERSION`.
///
/// Returns the version announced by the server.
pub async fn init<R, W>(r: &mut R, w: &mut W) -> Result<u32>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    send_init(w).await?;
    read_version(r).await
}

pub async fn send_init<W>(w: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = Buffer::new();
    buf.put_u8(SSH_FXP_INIT);
    buf.put_u32(SFTP_PROTOCOL_VERSION);
    buf.send(w).await
}

pub async fn read_version<R>(r: &mut R) -> Result<u32>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Buffer::new();
    buf.recv(r).await?;

    let typ = buf.get_u8()?;
    if typ != SSH_FXP_VERSION {
        return Err(Error::protocol(format!(
            "incorrect message type during initialization: {}",
            typ
        )));
    }
    let version = buf.get_u32()?;
    // extension pairs, if any, are not used.
    buf.clear();

    Ok(version)
}

/// The exclusive side of a connection: its byte streams and id counter.
///
/// Only the holder of the connection lock owns a `&mut Channel`, so the
/// reply read by an operation always belongs to that operation.
pub struct Channel {
    reader: BoxedReader,
    writer: BoxedWriter,
    next_id: u32,
    // sent requests whose replies have not been read yet.
    in_flight: Vec<u32>,
    // ids of requests nobody waits for anymore; their replies are still
    // on the way and must be skipped.
    stale: Vec<u32>,
    // set while a frame is being written.
    torn: bool,
    inbox: BytesMut,
    buf: Buffer,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("next_id", &self.next_id)
            .field("in_flight", &self.in_flight)
            .field("stale", &self.stale)
            .finish()
    }
}

impl Channel {
    pub fn new(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader,
            writer,
            next_id: 1,
            in_flight: vec![],
            stale: vec![],
            torn: false,
            inbox: BytesMut::new(),
            buf: Buffer::new(),
        }
    }

    /// Return the current message id and advance the counter.
    pub fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        tracing::trace!(id, "message id");
        id
    }

    /// Remember ids whose replies will arrive but nobody waits for.
    pub fn abandon(&mut self, ids: impl IntoIterator<Item = u32>) {
        for id in ids {
            self.in_flight.retain(|&pending| pending != id);
            self.stale.push(id);
        }
    }

    /// Prepare the channel for a new exchange.
    ///
    /// Requests left unanswered by a previous holder that stopped waiting
    /// are abandoned. A frame interrupted halfway through leaves the
    /// stream unusable.
    pub fn begin(&mut self) -> Result<()> {
        if self.torn {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "a request was interrupted while being sent",
            )));
        }
        if !self.in_flight.is_empty() {
            tracing::debug!(
                ids = ?self.in_flight,
                "abandoning requests of an interrupted operation"
            );
            let ids = std::mem::take(&mut self.in_flight);
            self.stale.extend(ids);
        }
        Ok(())
    }

    /// Send a request with the given type and id.
    pub async fn send<F>(&mut self, packet_type: u8, id: u32, f: F) -> Result<()>
    where
        F: FnOnce(&mut Buffer),
    {
        self.buf.clear();
        self.buf.put_u8(packet_type);
        self.buf.put_u32(id);
        f(&mut self.buf);

        self.torn = true;
        self.buf.send(&mut *self.writer).await?;
        self.torn = false;
        self.in_flight.push(id);
        Ok(())
    }

    /// Receive the next reply that somebody is waiting for.
    pub async fn recv(&mut self) -> Result<(u32, Reply)> {
        loop {
            self.buf
                .recv_buffered(&mut *self.reader, &mut self.inbox)
                .await?;
            let typ = self.buf.get_u8()?;
            let id = self.buf.get_u32()?;

            if let Some(pos) = self.stale.iter().position(|&stale| stale == id) {
                tracing::debug!(id, typ, "drained reply of an abandoned request");
                self.stale.swap_remove(pos);
                continue;
            }
            self.in_flight.retain(|&pending| pending != id);

            let reply = Reply::decode(typ, &mut self.buf)?;
            return Ok((id, reply));
        }
    }

    /// Receive the reply correlated with `expected`.
    pub async fn recv_for(&mut self, expected: u32) -> Result<Reply> {
        let (id, reply) = self.recv().await?;
        if id != expected {
            return Err(Error::protocol(format!(
                "ID mismatch ({} != {})",
                id, expected
            )));
        }
        Ok(reply)
    }

    /// Send a request and wait for its reply.
    pub async fn request<F>(&mut self, packet_type: u8, f: F) -> Result<Reply>
    where
        F: FnOnce(&mut Buffer),
    {
        let id = self.next_id();
        self.send(packet_type, id, f).await?;
        self.recv_for(id).await
    }

    /// Issue a request answered by a bare status.
    pub async fn request_status<F>(&mut self, packet_type: u8, f: F) -> Result<()>
    where
        F: FnOnce(&mut Buffer),
    {
        match self.request(packet_type, f).await? {
            Reply::Status(st) => st.into_result(),
            reply => Err(unexpected(&reply, "STATUS")),
        }
    }

    /// Issue a request answered by a handle.
    pub async fn request_handle<F>(&mut self, packet_type: u8, f: F) -> Result<Bytes>
    where
        F: FnOnce(&mut Buffer),
    {
        match self.request(packet_type, f).await? {
            Reply::Handle(handle) => Ok(handle),
            Reply::Status(st) => Err(status_error(st)),
            reply => Err(unexpected(&reply, "HANDLE")),
        }
    }

    /// Issue a request answered by attribute values.
    pub async fn request_attrs<F>(&mut self, packet_type: u8, f: F) -> Result<FileAttr>
    where
        F: FnOnce(&mut Buffer),
    {
        match self.request(packet_type, f).await? {
            Reply::Attrs(attrs) => Ok(attrs),
            Reply::Status(st) => Err(status_error(st)),
            reply => Err(unexpected(&reply, "ATTRS")),
        }
    }

    /// Issue a request answered by a list of names.
    pub async fn request_names<F>(&mut self, packet_type: u8, f: F) -> Result<Vec<DirEntry>>
    where
        F: FnOnce(&mut Buffer),
    {
        match self.request(packet_type, f).await? {
            Reply::Name(entries) => Ok(entries),
            Reply::Status(st) => Err(status_error(st)),
            reply => Err(unexpected(&reply, "NAME")),
        }
    }

    pub async fn lstat(&mut self, path: &str) -> Result<FileAttr> {
        self.request_attrs(SSH_FXP_LSTAT, |buf| buf.put_str(path))
            .await
    }

    pub async fn readlink(&mut self, path: &str) -> Result<String> {
        let mut entries = self
            .request_names(SSH_FXP_READLINK, |buf| buf.put_str(path))
            .await?;
        if entries.len() != 1 {
            return Err(Error::protocol(format!(
                "unexpected filename count ({}, 1 expected)",
                entries.len()
            )));
        }
        Ok(entries.remove(0).filename)
    }

    pub async fn close_handle(&mut self, handle: &[u8]) -> Result<()> {
        self.request_status(SSH_FXP_CLOSE, |buf| buf.put_block(handle))
            .await
    }
}

/// A STATUS reply where a payload was expected.
///
/// `SSH_FX_OK` in that position is a server bug.
fn status_error(st: RemoteStatus) -> Error {
    match st.into_result() {
        Ok(()) => Error::protocol("got SSH_FX_OK where a payload was expected"),
        Err(err) => err,
    }
}
