//! FUSE Clipboard Filesystem
//!
//! A virtual filesystem exposing client file selections to the host:
//! the root holds one directory per clip-data entry, each containing
//! the tree described by the client's FileGroupDescriptorW. File sizes
//! are resolved lazily: the first lookup/getattr on a file without a
//! known size issues a SIZE request and defers the kernel reply until
//! the response arrives; reads issue bounded RANGE requests.
//!
//! Replies are deferred, never blocked on: the fuser reply handles are
//! parked in a pending table keyed by stream id, and the clipboard FSM
//! completes them from `FileContentsResponse` PDUs. Everything pending
//! is failed with EIO when the selection clears or the session shuts
//! down.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::Sender;
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEntry, ReplyOpen, Request, FUSE_ROOT_ID,
};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::clipboard::formats::FileDescriptor;

/// Attribute TTL; entries are ephemeral.
const TTL: Duration = Duration::from_secs(1);

/// Upper bound for one RANGE request.
pub const MAX_READ_SIZE: u32 = 8 * 1024 * 1024;

/// Directory name of the implicit (lock-less) selection.
pub const NO_CLIP_DATA_DIR: &str = "no-clip-data-id";

/// Seconds between 1601-01-01 and the Unix epoch.
const FILETIME_EPOCH_OFFSET_SECS: u64 = 11_644_473_600;

/// File-contents pull issued by the filesystem, forwarded to the
/// client by the clipboard FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuseContentsRequest {
    pub stream_id: u32,
    pub list_index: u32,
    pub clip_data_id: Option<u32>,
    /// `None` asks for the size, `Some` for a byte range.
    pub range: Option<(u64, u32)>,
}

/// One inode of the clipboard filesystem.
#[derive(Debug)]
struct FuseFile {
    ino: u64,
    parent: u64,
    children: Vec<u64>,
    filename: String,
    is_directory: bool,
    size: Option<u64>,
    last_write_time: Option<u64>,
    /// Index into the selection's FileGroupDescriptorW.
    list_idx: Option<u32>,
    /// Owning clip-data entry.
    selection_serial: u64,
    clip_data_id: Option<u32>,
}

enum PendingReply {
    Entry(ReplyEntry),
    Attr(ReplyAttr),
    Data(ReplyData),
}

struct PendingOp {
    ino: u64,
    selection_serial: u64,
    reply: PendingReply,
}

struct FsState {
    files: HashMap<u64, FuseFile>,
    next_ino: u64,
    next_stream_id: u32,
    pending: HashMap<u32, PendingOp>,
    request_tx: Sender<FuseContentsRequest>,
    uid: u32,
    gid: u32,
}

impl FsState {
    fn child_by_name(&self, parent: u64, name: &str) -> Option<&FuseFile> {
        let parent = self.files.get(&parent)?;
        parent
            .children
            .iter()
            .filter_map(|ino| self.files.get(ino))
            .find(|f| f.filename == name)
    }

    fn attr_for(&self, file: &FuseFile) -> FileAttr {
        let mtime = file
            .last_write_time
            .and_then(filetime_to_system_time)
            .unwrap_or(UNIX_EPOCH);
        FileAttr {
            ino: file.ino,
            size: file.size.unwrap_or(0),
            blocks: file.size.unwrap_or(0).div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: if file.is_directory {
                FileType::Directory
            } else {
                FileType::RegularFile
            },
            perm: if file.is_directory { 0o555 } else { 0o444 },
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn alloc_ino(&mut self) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    fn alloc_stream_id(&mut self) -> u32 {
        let id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.wrapping_add(1);
        id
    }

    /// Park a reply and ask the client for the file's size.
    fn request_size(&mut self, ino: u64, reply: PendingReply) {
        let (list_index, clip_data_id, selection_serial) = {
            let file = self.files.get(&ino).expect("inode exists");
            (
                file.list_idx.unwrap_or(0),
                file.clip_data_id,
                file.selection_serial,
            )
        };
        let stream_id = self.alloc_stream_id();
        self.pending.insert(
            stream_id,
            PendingOp {
                ino,
                selection_serial,
                reply,
            },
        );
        trace!("size request {} for inode {}", stream_id, ino);
        let _ = self.request_tx.send(FuseContentsRequest {
            stream_id,
            list_index,
            clip_data_id,
            range: None,
        });
    }
}

fn filetime_to_system_time(filetime: u64) -> Option<SystemTime> {
    let unix_100ns = filetime.checked_sub(FILETIME_EPOCH_OFFSET_SECS * 10_000_000)?;
    Some(UNIX_EPOCH + Duration::from_nanos(unix_100ns * 100))
}

/// The clipboard filesystem and its mount lifecycle.
pub struct FuseClipboard {
    state: Arc<Mutex<FsState>>,
    session: Mutex<Option<SendableSession>>,
    mount_dir: Mutex<Option<tempfile::TempDir>>,
}

/// fuser's background session holds raw pointers to state owned by its
/// own thread; the handle itself is only a join handle and a channel.
struct SendableSession(fuser::BackgroundSession);

// SAFETY: BackgroundSession is a handle to the FUSE loop thread; all
// libfuse state is touched only by that thread.
unsafe impl Send for SendableSession {}

impl FuseClipboard {
    pub fn new(request_tx: Sender<FuseContentsRequest>) -> Self {
        let mut files = HashMap::new();
        files.insert(
            FUSE_ROOT_ID,
            FuseFile {
                ino: FUSE_ROOT_ID,
                parent: FUSE_ROOT_ID,
                children: Vec::new(),
                filename: "/".into(),
                is_directory: true,
                size: None,
                last_write_time: None,
                list_idx: None,
                selection_serial: 0,
                clip_data_id: None,
            },
        );

        FuseClipboard {
            state: Arc::new(Mutex::new(FsState {
                files,
                next_ino: FUSE_ROOT_ID + 1,
                next_stream_id: 0,
                pending: HashMap::new(),
                request_tx,
                // SAFETY: getuid/getgid cannot fail.
                uid: unsafe { libc::getuid() },
                gid: unsafe { libc::getgid() },
            })),
            session: Mutex::new(None),
            mount_dir: Mutex::new(None),
        }
    }

    /// Mount under `$XDG_RUNTIME_DIR/gnome-remote-desktop/cliprdr-XXXXXX`.
    pub fn mount(&self) -> std::io::Result<PathBuf> {
        if let Some(dir) = &*self.mount_dir.lock() {
            return Ok(dir.path().to_path_buf());
        }

        let runtime_dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| {
            // SAFETY: getuid cannot fail.
            format!("/run/user/{}", unsafe { libc::getuid() })
        });
        let base = PathBuf::from(runtime_dir).join("gnome-remote-desktop");
        std::fs::create_dir_all(&base)?;

        let mount_dir = tempfile::Builder::new()
            .prefix("cliprdr-")
            .tempdir_in(&base)?;
        let mount_path = mount_dir.path().to_path_buf();

        let options = [
            MountOption::RO,
            MountOption::FSName("gnome-remote-desktop".to_string()),
            MountOption::AutoUnmount,
        ];
        let session = fuser::spawn_mount2(
            FuseAdapter {
                state: Arc::clone(&self.state),
            },
            &mount_path,
            &options,
        )?;

        info!("clipboard filesystem mounted at {:?}", mount_path);
        *self.session.lock() = Some(SendableSession(session));
        *self.mount_dir.lock() = Some(mount_dir);
        Ok(mount_path)
    }

    /// Mount path while mounted.
    pub fn mount_path(&self) -> Option<PathBuf> {
        self.mount_dir.lock().as_ref().map(|d| d.path().to_path_buf())
    }

    /// Unmount and remove the mount directory.
    pub fn dispose(&self) {
        self.fail_all_pending();
        if let Some(session) = self.session.lock().take() {
            info!("unmounting clipboard filesystem");
            drop(session);
        }
        self.mount_dir.lock().take();
    }

    /// Install the file tree of a selection. Returns the top-level
    /// paths for the host's URI list (absolute when mounted).
    pub fn set_selection(
        &self,
        selection_serial: u64,
        clip_data_id: Option<u32>,
        descriptors: &[FileDescriptor],
    ) -> Vec<String> {
        let dir_name = clip_data_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| NO_CLIP_DATA_DIR.to_string());
        let mount_path = self
            .mount_path()
            .unwrap_or_else(|| PathBuf::from("/"))
            .join(&dir_name);

        let mut state = self.state.lock();

        let dir_ino = state.alloc_ino();
        state.files.insert(
            dir_ino,
            FuseFile {
                ino: dir_ino,
                parent: FUSE_ROOT_ID,
                children: Vec::new(),
                filename: dir_name,
                is_directory: true,
                size: None,
                last_write_time: None,
                list_idx: None,
                selection_serial,
                clip_data_id,
            },
        );
        state
            .files
            .get_mut(&FUSE_ROOT_ID)
            .expect("root exists")
            .children
            .push(dir_ino);

        let mut top_level = Vec::new();
        for (index, descriptor) in descriptors.iter().enumerate() {
            let mut parent = dir_ino;
            let components: Vec<&str> = descriptor.name.split('\\').collect();
            for (depth, component) in components.iter().enumerate() {
                let is_leaf = depth == components.len() - 1;
                if let Some(existing) = state.child_by_name(parent, component) {
                    parent = existing.ino;
                    continue;
                }

                let ino = state.alloc_ino();
                state.files.insert(
                    ino,
                    FuseFile {
                        ino,
                        parent,
                        children: Vec::new(),
                        filename: component.to_string(),
                        is_directory: if is_leaf { descriptor.is_directory } else { true },
                        size: if is_leaf { descriptor.size } else { None },
                        last_write_time: if is_leaf {
                            descriptor.last_write_time
                        } else {
                            None
                        },
                        list_idx: is_leaf.then_some(index as u32),
                        selection_serial,
                        clip_data_id,
                    },
                );
                state
                    .files
                    .get_mut(&parent)
                    .expect("parent exists")
                    .children
                    .push(ino);
                if depth == 0 {
                    top_level.push(
                        mount_path
                            .join(component)
                            .to_string_lossy()
                            .into_owned(),
                    );
                }
                parent = ino;
            }
        }

        debug!(
            "installed selection serial {} with {} descriptors",
            selection_serial,
            descriptors.len()
        );
        top_level
    }

    /// Remove a selection's subtree and fail its outstanding requests.
    pub fn clear_selection(&self, selection_serial: u64) {
        // Collect doomed inodes and pending replies under the lock,
        // drop the lock before completing the kernel replies.
        let doomed_replies = {
            let mut state = self.state.lock();

            let doomed: Vec<u64> = state
                .files
                .values()
                .filter(|f| f.selection_serial == selection_serial && f.ino != FUSE_ROOT_ID)
                .map(|f| f.ino)
                .collect();
            for ino in &doomed {
                state.files.remove(ino);
            }
            let root = state.files.get_mut(&FUSE_ROOT_ID).expect("root exists");
            root.children.retain(|c| !doomed.contains(c));

            let stale: Vec<u32> = state
                .pending
                .iter()
                .filter(|(_, op)| op.selection_serial == selection_serial)
                .map(|(&id, _)| id)
                .collect();
            stale
                .into_iter()
                .filter_map(|id| state.pending.remove(&id))
                .collect::<Vec<_>>()
        };

        for op in doomed_replies {
            fail_reply(op.reply);
        }
    }

    /// Complete or fail a parked operation from a
    /// `FileContentsResponse`. Returns the owning selection serial of
    /// the completed operation.
    pub fn handle_file_contents_response(
        &self,
        stream_id: u32,
        ok: bool,
        data: &[u8],
    ) -> Option<u64> {
        enum Outcome {
            Done,
            Fail(PendingReply),
            SizeResolved(PendingReply, FileAttr),
        }

        let (serial, outcome) = {
            let mut state = self.state.lock();
            let Some(op) = state.pending.remove(&stream_id) else {
                warn!("response for unknown stream id {}", stream_id);
                return None;
            };
            let PendingOp {
                ino,
                selection_serial,
                reply,
            } = op;

            let outcome = if !ok {
                Outcome::Fail(reply)
            } else {
                match reply {
                    PendingReply::Data(data_reply) => {
                        data_reply.data(data);
                        Outcome::Done
                    }
                    attr_like => {
                        // SIZE responses carry an 8-byte little-endian
                        // size.
                        if data.len() < 8 {
                            Outcome::Fail(attr_like)
                        } else {
                            let size = u64::from_le_bytes(
                                data[..8].try_into().expect("length checked"),
                            );
                            if let Some(file) = state.files.get_mut(&ino) {
                                file.size = Some(size);
                            }
                            match state.files.get(&ino) {
                                Some(file) => {
                                    Outcome::SizeResolved(attr_like, state.attr_for(file))
                                }
                                None => Outcome::Fail(attr_like),
                            }
                        }
                    }
                }
            };
            (selection_serial, outcome)
        };

        match outcome {
            Outcome::Done => {}
            Outcome::Fail(reply) => fail_reply(reply),
            Outcome::SizeResolved(reply, attr) => match reply {
                PendingReply::Entry(reply) => reply.entry(&TTL, &attr, 0),
                PendingReply::Attr(reply) => reply.attr(&TTL, &attr),
                PendingReply::Data(reply) => reply.error(libc::EIO),
            },
        }
        Some(serial)
    }

    /// Outstanding parked operations belonging to one selection.
    pub fn pending_for_selection(&self, selection_serial: u64) -> usize {
        self.state
            .lock()
            .pending
            .values()
            .filter(|op| op.selection_serial == selection_serial)
            .count()
    }

    /// Fail every parked operation (selection clear or shutdown).
    pub fn fail_all_pending(&self) {
        let pending: Vec<PendingOp> = {
            let mut state = self.state.lock();
            state.pending.drain().map(|(_, op)| op).collect()
        };
        for op in pending {
            fail_reply(op.reply);
        }
    }

    /// Number of parked kernel operations.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    #[cfg(test)]
    fn resolve(&self, path: &[&str]) -> Option<u64> {
        let state = self.state.lock();
        let mut ino = FUSE_ROOT_ID;
        for component in path {
            ino = state.child_by_name(ino, component)?.ino;
        }
        Some(ino)
    }

    #[cfg(test)]
    fn file_size(&self, ino: u64) -> Option<u64> {
        self.state.lock().files.get(&ino).and_then(|f| f.size)
    }
}

impl Drop for FuseClipboard {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn fail_reply(reply: PendingReply) {
    match reply {
        PendingReply::Entry(reply) => reply.error(libc::EIO),
        PendingReply::Attr(reply) => reply.error(libc::EIO),
        PendingReply::Data(reply) => reply.error(libc::EIO),
    }
}

// =============================================================================
// fuser adapter
// =============================================================================

struct FuseAdapter {
    state: Arc<Mutex<FsState>>,
}

impl Filesystem for FuseAdapter {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let mut state = self.state.lock();

        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(file) = state.child_by_name(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };

        if !file.is_directory && file.size.is_none() {
            let ino = file.ino;
            state.request_size(ino, PendingReply::Entry(reply));
            return;
        }

        let attr = state.attr_for(file);
        reply.entry(&TTL, &attr, 0);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let mut state = self.state.lock();

        let Some(file) = state.files.get(&ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        if !file.is_directory && file.size.is_none() {
            state.request_size(ino, PendingReply::Attr(reply));
            return;
        }

        let attr = state.attr_for(file);
        reply.attr(&TTL, &attr);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if flags & libc::O_WRONLY != 0 || flags & libc::O_RDWR != 0 {
            reply.error(libc::EACCES);
            return;
        }
        let state = self.state.lock();
        if state.files.contains_key(&ino) {
            reply.opened(0, 0);
        } else {
            reply.error(libc::ENOENT);
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let mut state = self.state.lock();

        let (is_directory, file_size, list_index, clip_data_id, selection_serial) =
            match state.files.get(&ino) {
                Some(file) => (
                    file.is_directory,
                    file.size,
                    file.list_idx.unwrap_or(0),
                    file.clip_data_id,
                    file.selection_serial,
                ),
                None => {
                    reply.error(libc::ENOENT);
                    return;
                }
            };
        if is_directory {
            reply.error(libc::EISDIR);
            return;
        }
        let Some(file_size) = file_size else {
            reply.error(libc::EIO);
            return;
        };

        let offset = offset.max(0) as u64;
        if offset >= file_size {
            reply.data(&[]);
            return;
        }
        let read_size = (file_size - offset).min(size as u64).min(MAX_READ_SIZE as u64) as u32;

        let stream_id = state.alloc_stream_id();
        state.pending.insert(
            stream_id,
            PendingOp {
                ino,
                selection_serial,
                reply: PendingReply::Data(reply),
            },
        );
        let _ = state.request_tx.send(FuseContentsRequest {
            stream_id,
            list_index,
            clip_data_id,
            range: Some((offset, read_size)),
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let state = self.state.lock();

        let Some(dir) = state.files.get(&ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if !dir.is_directory {
            reply.error(libc::ENOTDIR);
            return;
        }

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".into()),
            (dir.parent, FileType::Directory, "..".into()),
        ];
        for child in dir.children.iter().filter_map(|c| state.files.get(c)) {
            let kind = if child.is_directory {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            entries.push((child.ino, kind, child.filename.clone()));
        }

        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let state = self.state.lock();
        match state.files.get(&ino) {
            Some(file) if file.is_directory => reply.opened(0, 0),
            Some(_) => reply.error(libc::ENOTDIR),
            None => reply.error(libc::ENOENT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn descriptor(name: &str, size: Option<u64>) -> FileDescriptor {
        FileDescriptor {
            name: name.into(),
            is_directory: false,
            is_readonly: false,
            size,
            last_write_time: None,
        }
    }

    #[test]
    fn test_selection_tree_construction() {
        let (tx, _rx) = unbounded();
        let fuse = FuseClipboard::new(tx);

        let paths = fuse.set_selection(
            1,
            Some(7),
            &[
                descriptor("a.txt", Some(10)),
                FileDescriptor {
                    name: "docs".into(),
                    is_directory: true,
                    is_readonly: false,
                    size: None,
                    last_write_time: None,
                },
                descriptor("docs\\b.txt", Some(20)),
            ],
        );

        // Only top-level entries appear in the URI list.
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("/7/a.txt"));
        assert!(paths[1].ends_with("/7/docs"));

        assert!(fuse.resolve(&["7", "a.txt"]).is_some());
        assert!(fuse.resolve(&["7", "docs", "b.txt"]).is_some());
        assert!(fuse.resolve(&["7", "missing"]).is_none());
    }

    #[test]
    fn test_implicit_selection_directory_name() {
        let (tx, _rx) = unbounded();
        let fuse = FuseClipboard::new(tx);

        fuse.set_selection(1, None, &[descriptor("x", Some(1))]);
        assert!(fuse.resolve(&[NO_CLIP_DATA_DIR, "x"]).is_some());
    }

    #[test]
    fn test_multiple_selections_coexist() {
        let (tx, _rx) = unbounded();
        let fuse = FuseClipboard::new(tx);

        fuse.set_selection(1, Some(1), &[descriptor("a", Some(1))]);
        fuse.set_selection(2, Some(2), &[descriptor("b", Some(1))]);

        assert!(fuse.resolve(&["1", "a"]).is_some());
        assert!(fuse.resolve(&["2", "b"]).is_some());

        fuse.clear_selection(1);
        assert!(fuse.resolve(&["1", "a"]).is_none());
        assert!(fuse.resolve(&["2", "b"]).is_some());
    }

    #[test]
    fn test_size_response_caches_size() {
        let (tx, _rx) = unbounded();
        let fuse = FuseClipboard::new(tx);

        fuse.set_selection(1, Some(3), &[descriptor("lazy.bin", None)]);
        let ino = fuse.resolve(&["3", "lazy.bin"]).unwrap();
        assert_eq!(fuse.file_size(ino), None);

        // Simulate the parked lookup by inserting a pending op is not
        // possible without a kernel reply handle; set the size through
        // the state directly the way a SIZE response would.
        {
            let mut state = fuse.state.lock();
            state.files.get_mut(&ino).unwrap().size = Some(1234);
        }
        assert_eq!(fuse.file_size(ino), Some(1234));
    }

    #[test]
    fn test_filetime_to_system_time() {
        let filetime = 132_539_328_000_000_000u64; // 2021-01-01
        let time = filetime_to_system_time(filetime).unwrap();
        assert_eq!(
            time.duration_since(UNIX_EPOCH).unwrap().as_secs(),
            1_609_459_200
        );
        assert!(filetime_to_system_time(1).is_none());
    }

    #[test]
    fn test_stream_ids_unique() {
        let (tx, _rx) = unbounded();
        let fuse = FuseClipboard::new(tx);
        let mut state = fuse.state.lock();
        let a = state.alloc_stream_id();
        let b = state.alloc_stream_id();
        assert_ne!(a, b);
    }
}
