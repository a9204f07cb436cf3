//! An in-memory SFTP v3 server for tests.

use crate::{
    buffer::Buffer,
    connection::{Connector, Session},
    error::Result,
    sftp::{self, FileAttr},
    transport::Transport,
    uri::{self, Uri},
    vfs::{S_IFDIR, S_IFLNK, S_IFMT, S_IFREG},
};
use bytes::BytesMut;
use futures::{future::BoxFuture, FutureExt as _};
use slab::Slab;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::io::{duplex, AsyncReadExt, DuplexStream};

const OPENSSH_FXF_READ: u32 = 0x01;
const OPENSSH_FXF_WRITE: u32 = 0x02;
const OPENSSH_FXF_CREAT: u32 = 0x08;
const OPENSSH_FXF_TRUNC: u32 = 0x10;
const OPENSSH_FXF_EXCL: u32 = 0x20;

/// Behaviour switches of the server.
#[derive(Debug)]
pub(crate) struct Knobs {
    pub version: u32,
    /// Cap on the bytes returned by one READ.
    pub short_read: Option<usize>,
    /// Answer the requests available at once in reverse order.
    pub reverse_replies: bool,
    /// Fail READs at or past the offset with the status code.
    pub fail_reads_from: Option<(u64, u32)>,
    /// Entries per READDIR reply.
    pub readdir_batch: usize,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            version: sftp::SFTP_PROTOCOL_VERSION,
            short_read: None,
            reverse_replies: false,
            fail_reads_from: None,
            readdir_batch: 100,
        }
    }
}

/// A request as the server saw it.
#[derive(Debug, Clone, Default)]
pub(crate) struct Request {
    pub typ: u8,
    pub path: Option<String>,
    /// Second path argument of RENAME and SYMLINK.
    pub target: Option<String>,
    pub offset: Option<u64>,
    pub len: Option<u32>,
}

#[derive(Debug, Clone)]
enum Content {
    File(Vec<u8>),
    Dir,
    Symlink(String),
}

#[derive(Debug, Clone)]
struct Node {
    content: Content,
    perm: u32,
    times: (u32, u32),
}

impl Node {
    fn new(content: Content, perm: u32) -> Self {
        Self {
            content,
            perm,
            times: (1_600_000_000, 1_600_000_000),
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self.content, Content::Dir)
    }

    fn mode(&self) -> u32 {
        let typ = match self.content {
            Content::File(..) => S_IFREG,
            Content::Dir => S_IFDIR,
            Content::Symlink(..) => S_IFLNK,
        };
        typ | self.perm
    }

    fn attr(&self) -> FileAttr {
        let size = match &self.content {
            Content::File(data) => data.len() as u64,
            Content::Dir => 4096,
            Content::Symlink(target) => target.len() as u64,
        };
        let mut attr = FileAttr::default();
        attr.size = Some(size);
        attr.uid_gid = Some((1000, 1000));
        attr.permissions = Some(self.mode());
        attr.ac_mod_time = Some(self.times);
        attr
    }
}

#[derive(Debug)]
enum OpenHandle {
    File { path: String },
    Dir { entries: Vec<(String, FileAttr)>, pos: usize },
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    handles: Slab<OpenHandle>,
    knobs: Knobs,
    log: Vec<Request>,
}

enum Response {
    Status(u32),
    Handle(usize),
    Data(Vec<u8>),
    Attrs(FileAttr),
    Name(Vec<(String, FileAttr)>),
}

/// Shared state of the server, inspected by tests.
#[derive(Debug, Clone)]
pub(crate) struct MockFs {
    state: Arc<Mutex<State>>,
}

impl MockFs {
    pub fn new() -> Self {
        let mut state = State::default();
        state
            .nodes
            .insert("/".into(), Node::new(Content::Dir, 0o755));
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_file(&self, path: &str, data: Vec<u8>) {
        self.lock()
            .nodes
            .insert(path.into(), Node::new(Content::File(data), 0o644));
    }

    pub fn add_dir(&self, path: &str) {
        self.lock()
            .nodes
            .insert(path.into(), Node::new(Content::Dir, 0o755));
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        self.lock()
            .nodes
            .insert(path.into(), Node::new(Content::Symlink(target.into()), 0o777));
    }

    pub fn configure(&self, f: impl FnOnce(&mut Knobs)) {
        f(&mut self.lock().knobs);
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match &self.lock().nodes.get(path)?.content {
            Content::File(data) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(path)
    }

    pub fn mode(&self, path: &str) -> Option<u32> {
        self.lock().nodes.get(path).map(Node::mode)
    }

    pub fn times(&self, path: &str) -> Option<(u32, u32)> {
        self.lock().nodes.get(path).map(|node| node.times)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.lock().log.clone()
    }

    pub fn clear_requests(&self) {
        self.lock().log.clear();
    }

    pub fn open_handles(&self) -> usize {
        self.lock().handles.len()
    }

    /// Serve one client until it goes away.
    async fn serve(self, mut stream: DuplexStream) {
        let mut pending = BytesMut::new();
        loop {
            let mut frames = vec![];
            take_frames(&mut pending, &mut frames);
            if frames.is_empty() {
                match stream.read_buf(&mut pending).await {
                    Ok(0) | Err(..) => return,
                    Ok(..) => continue,
                }
            }
            // pick up whatever else the client already sent.
            while let Some(Ok(n)) = stream.read_buf(&mut pending).now_or_never() {
                if n == 0 {
                    break;
                }
                take_frames(&mut pending, &mut frames);
            }

            let mut replies = vec![];
            for frame in frames {
                let mut buf = Buffer::new();
                if buf.recv(&mut &frame[..]).await.is_err() {
                    return;
                }
                match self.handle(&mut buf) {
                    Some(reply) => replies.push(reply),
                    None => return,
                }
            }
            if self.lock().knobs.reverse_replies {
                replies.reverse();
            }
            for mut reply in replies {
                if reply.send(&mut stream).await.is_err() {
                    return;
                }
            }
        }
    }

    fn handle(&self, req: &mut Buffer) -> Option<Buffer> {
        let typ = req.get_u8().ok()?;
        let mut state = self.lock();
        let mut reply = Buffer::new();

        if typ == sftp::SSH_FXP_INIT {
            state.log.push(Request {
                typ,
                ..Request::default()
            });
            reply.put_u8(sftp::SSH_FXP_VERSION);
            reply.put_u32(state.knobs.version);
            return Some(reply);
        }

        let id = req.get_u32().ok()?;
        let response = state.dispatch(typ, req).ok()?;
        match response {
            Response::Status(code) => {
                reply.put_u8(sftp::SSH_FXP_STATUS);
                reply.put_u32(id);
                reply.put_u32(code);
                reply.put_str(if code == sftp::SSH_FX_OK { "Success" } else { "Failure" });
                reply.put_str("");
            }
            Response::Handle(key) => {
                reply.put_u8(sftp::SSH_FXP_HANDLE);
                reply.put_u32(id);
                reply.put_str(&format!("h{}", key));
            }
            Response::Data(data) => {
                reply.put_u8(sftp::SSH_FXP_DATA);
                reply.put_u32(id);
                reply.put_block(&data);
            }
            Response::Attrs(attr) => {
                reply.put_u8(sftp::SSH_FXP_ATTRS);
                reply.put_u32(id);
                attr.encode(&mut reply);
            }
            Response::Name(entries) => {
                reply.put_u8(sftp::SSH_FXP_NAME);
                reply.put_u32(id);
                reply.put_u32(entries.len() as u32);
                for (name, attr) in entries {
                    reply.put_str(&name);
                    reply.put_str(&name);
                    attr.encode(&mut reply);
                }
            }
        }
        Some(reply)
    }
}

fn take_frames(pending: &mut BytesMut, frames: &mut Vec<BytesMut>) {
    while pending.len() >= 4 {
        let len = u32::from_be_bytes([pending[0], pending[1], pending[2], pending[3]]) as usize;
        if pending.len() < 4 + len {
            break;
        }
        frames.push(pending.split_to(4 + len));
    }
}

fn parse_handle(handle: &[u8]) -> Option<usize> {
    std::str::from_utf8(handle).ok()?.strip_prefix('h')?.parse().ok()
}

impl State {
    fn dispatch(&mut self, typ: u8, req: &mut Buffer) -> Result<Response> {
        use Response::Status;

        let mut logged = Request {
            typ,
            ..Request::default()
        };

        let response = match typ {
            sftp::SSH_FXP_OPEN => {
                let path = req.get_string()?;
                let pflags = req.get_u32()?;
                let attr = FileAttr::decode(req)?;
                logged.path = Some(path.clone());
                self.open(path, pflags, attr)
            }

            sftp::SSH_FXP_CLOSE => {
                let handle = req.get_block()?;
                match parse_handle(&handle).filter(|&key| self.handles.contains(key)) {
                    Some(key) => {
                        self.handles.remove(key);
                        Status(sftp::SSH_FX_OK)
                    }
                    None => Status(sftp::SSH_FX_FAILURE),
                }
            }

            sftp::SSH_FXP_READ => {
                let handle = req.get_block()?;
                let offset = req.get_u64()?;
                let len = req.get_u32()?;
                logged.offset = Some(offset);
                logged.len = Some(len);
                self.read(&handle, offset, len as usize)
            }

            sftp::SSH_FXP_WRITE => {
                let handle = req.get_block()?;
                let offset = req.get_u64()?;
                let data = req.get_block()?;
                logged.offset = Some(offset);
                logged.len = Some(data.len() as u32);
                self.write(&handle, offset as usize, &data)
            }

            sftp::SSH_FXP_LSTAT => {
                let path = req.get_string()?;
                logged.path = Some(path.clone());
                match self.nodes.get(&path) {
                    Some(node) => Response::Attrs(node.attr()),
                    None => Status(sftp::SSH_FX_NO_SUCH_FILE),
                }
            }

            sftp::SSH_FXP_SETSTAT => {
                let path = req.get_string()?;
                let attr = FileAttr::decode(req)?;
                logged.path = Some(path.clone());
                match self.nodes.get_mut(&path) {
                    Some(node) => {
                        if let Some(mode) = attr.permissions {
                            node.perm = mode & !S_IFMT;
                        }
                        if let Some(times) = attr.ac_mod_time {
                            node.times = times;
                        }
                        Status(sftp::SSH_FX_OK)
                    }
                    None => Status(sftp::SSH_FX_NO_SUCH_FILE),
                }
            }

            sftp::SSH_FXP_OPENDIR => {
                let path = req.get_string()?;
                logged.path = Some(path.clone());
                self.opendir(&path)
            }

            sftp::SSH_FXP_READDIR => {
                let handle = req.get_block()?;
                let batch = self.knobs.readdir_batch.max(1);
                match parse_handle(&handle).and_then(|key| self.handles.get_mut(key)) {
                    Some(OpenHandle::Dir { entries, pos }) => {
                        if *pos >= entries.len() {
                            Status(sftp::SSH_FX_EOF)
                        } else {
                            let end = std::cmp::min(*pos + batch, entries.len());
                            let chunk = entries[*pos..end].to_vec();
                            *pos = end;
                            Response::Name(chunk)
                        }
                    }
                    _ => Status(sftp::SSH_FX_FAILURE),
                }
            }

            sftp::SSH_FXP_REMOVE => {
                let path = req.get_string()?;
                logged.path = Some(path.clone());
                match self.nodes.get(&path).map(Node::is_dir) {
                    None => Status(sftp::SSH_FX_NO_SUCH_FILE),
                    Some(true) => Status(sftp::SSH_FX_FAILURE),
                    Some(false) => {
                        self.nodes.remove(&path);
                        Status(sftp::SSH_FX_OK)
                    }
                }
            }

            sftp::SSH_FXP_MKDIR => {
                let path = req.get_string()?;
                let attr = FileAttr::decode(req)?;
                logged.path = Some(path.clone());
                let perm = attr.permissions.map_or(0o755, |mode| mode & !S_IFMT);
                self.create(path, Node::new(Content::Dir, perm))
            }

            sftp::SSH_FXP_RMDIR => {
                let path = req.get_string()?;
                logged.path = Some(path.clone());
                match self.nodes.get(&path).map(Node::is_dir) {
                    None => Status(sftp::SSH_FX_NO_SUCH_FILE),
                    Some(true) if self.children(&path).is_empty() && path != "/" => {
                        self.nodes.remove(&path);
                        Status(sftp::SSH_FX_OK)
                    }
                    Some(..) => Status(sftp::SSH_FX_FAILURE),
                }
            }

            sftp::SSH_FXP_REALPATH => {
                let path = req.get_string()?;
                logged.path = Some(path.clone());
                let real = uri::normalize_path(&path);
                Response::Name(vec![(real, FileAttr::default())])
            }

            sftp::SSH_FXP_RENAME => {
                let old = req.get_string()?;
                let new = req.get_string()?;
                logged.path = Some(old.clone());
                logged.target = Some(new.clone());
                self.rename(&old, &new)
            }

            sftp::SSH_FXP_READLINK => {
                let path = req.get_string()?;
                logged.path = Some(path.clone());
                match self.nodes.get(&path).map(|node| &node.content) {
                    Some(Content::Symlink(target)) => {
                        Response::Name(vec![(target.clone(), FileAttr::default())])
                    }
                    Some(..) => Status(sftp::SSH_FX_FAILURE),
                    None => Status(sftp::SSH_FX_NO_SUCH_FILE),
                }
            }

            sftp::SSH_FXP_SYMLINK => {
                // OpenSSH's order: target first.
                let target = req.get_string()?;
                let link = req.get_string()?;
                logged.path = Some(target.clone());
                logged.target = Some(link.clone());
                self.create(link, Node::new(Content::Symlink(target), 0o777))
            }

            _ => Status(sftp::SSH_FX_OP_UNSUPPORTED),
        };

        self.log.push(logged);
        Ok(response)
    }

    fn children(&self, dir: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|path| path.as_str() != "/" && uri::dirname(path) == dir)
            .cloned()
            .collect()
    }

    fn create(&mut self, path: String, node: Node) -> Response {
        if self.nodes.contains_key(&path) {
            return Response::Status(sftp::SSH_FX_FAILURE);
        }
        match self.nodes.get(uri::dirname(&path)).map(|n| &n.content) {
            Some(Content::Dir) => {
                self.nodes.insert(path, node);
                Response::Status(sftp::SSH_FX_OK)
            }
            _ => Response::Status(sftp::SSH_FX_NO_SUCH_FILE),
        }
    }

    fn open(&mut self, path: String, pflags: u32, attr: FileAttr) -> Response {
        let exists = self.nodes.contains_key(&path);
        if pflags & OPENSSH_FXF_CREAT != 0 {
            if exists && pflags & OPENSSH_FXF_EXCL != 0 {
                return Response::Status(sftp::SSH_FX_FAILURE);
            }
            if !exists {
                let perm = attr.permissions.map_or(0o644, |mode| mode & !S_IFMT);
                match self.create(path.clone(), Node::new(Content::File(vec![]), perm)) {
                    Response::Status(sftp::SSH_FX_OK) => {}
                    failed => return failed,
                }
            }
        }

        match self.nodes.get_mut(&path).map(|node| &mut node.content) {
            None => Response::Status(sftp::SSH_FX_NO_SUCH_FILE),
            Some(Content::File(data)) => {
                if pflags & OPENSSH_FXF_TRUNC != 0 {
                    data.clear();
                }
                if pflags & (OPENSSH_FXF_READ | OPENSSH_FXF_WRITE) == 0 {
                    return Response::Status(sftp::SSH_FX_FAILURE);
                }
                Response::Handle(self.handles.insert(OpenHandle::File { path }))
            }
            Some(..) => Response::Status(sftp::SSH_FX_FAILURE),
        }
    }

    fn file_data(&mut self, handle: &[u8]) -> Option<&mut Vec<u8>> {
        let path = match parse_handle(handle).and_then(|key| self.handles.get(key))? {
            OpenHandle::File { path } => path.clone(),
            OpenHandle::Dir { .. } => return None,
        };
        match &mut self.nodes.get_mut(&path)?.content {
            Content::File(data) => Some(data),
            _ => None,
        }
    }

    fn read(&mut self, handle: &[u8], offset: u64, len: usize) -> Response {
        if let Some((from, code)) = self.knobs.fail_reads_from {
            if offset >= from {
                return Response::Status(code);
            }
        }
        let short_read = self.knobs.short_read;
        let data = match self.file_data(handle) {
            Some(data) => data,
            None => return Response::Status(sftp::SSH_FX_FAILURE),
        };
        if offset >= data.len() as u64 {
            return Response::Status(sftp::SSH_FX_EOF);
        }
        let start = offset as usize;
        let mut end = std::cmp::min(start + len, data.len());
        if let Some(max) = short_read {
            end = std::cmp::min(end, start + max);
        }
        Response::Data(data[start..end].to_vec())
    }

    fn write(&mut self, handle: &[u8], offset: usize, src: &[u8]) -> Response {
        let data = match self.file_data(handle) {
            Some(data) => data,
            None => return Response::Status(sftp::SSH_FX_FAILURE),
        };
        if data.len() < offset + src.len() {
            data.resize(offset + src.len(), 0);
        }
        data[offset..offset + src.len()].copy_from_slice(src);
        Response::Status(sftp::SSH_FX_OK)
    }

    fn opendir(&mut self, path: &str) -> Response {
        let dir = match self.nodes.get(path) {
            Some(node) => node,
            None => return Response::Status(sftp::SSH_FX_NO_SUCH_FILE),
        };
        if !matches!(dir.content, Content::Dir) {
            return Response::Status(sftp::SSH_FX_FAILURE);
        }

        let mut entries = vec![(".".to_owned(), dir.attr())];
        if let Some(parent) = self.nodes.get(uri::dirname(path)) {
            entries.push(("..".to_owned(), parent.attr()));
        }
        for child in self.children(path) {
            let attr = self.nodes[&child].attr();
            entries.push((uri::basename(&child).to_owned(), attr));
        }
        Response::Handle(self.handles.insert(OpenHandle::Dir { entries, pos: 0 }))
    }

    fn rename(&mut self, old: &str, new: &str) -> Response {
        if !self.nodes.contains_key(old) {
            return Response::Status(sftp::SSH_FX_NO_SUCH_FILE);
        }
        if self.nodes.contains_key(new) {
            return Response::Status(sftp::SSH_FX_FAILURE);
        }
        let prefix = format!("{}/", old);
        let moved: Vec<String> = self
            .nodes
            .keys()
            .filter(|path| path.as_str() == old || path.starts_with(&prefix))
            .cloned()
            .collect();
        for path in moved {
            if let Some(node) = self.nodes.remove(&path) {
                let renamed = format!("{}{}", new, &path[old.len()..]);
                self.nodes.insert(renamed, node);
            }
        }
        Response::Status(sftp::SSH_FX_OK)
    }
}

/// Connects to a fresh [`MockFs`] server task each time.
#[derive(Debug)]
pub(crate) struct MockConnector {
    fs: MockFs,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn new(fs: MockFs) -> Self {
        Self {
            fs,
            connects: AtomicUsize::new(0),
        }
    }

    /// Number of sessions opened so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn connect<'a>(&'a self, _: &'a Uri) -> BoxFuture<'a, Result<Session>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (client, server) = duplex(1024 * 1024);
            tokio::spawn(self.fs.clone().serve(server));

            let (mut reader, mut writer) = tokio::io::split(client);
            let version = sftp::init(&mut reader, &mut writer).await?;
            Ok(Session {
                transport: Transport::from_streams(Box::new(reader), Box::new(writer)),
                version,
            })
        })
    }
}
