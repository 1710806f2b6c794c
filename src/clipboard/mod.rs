//! CLIPRDR Clipboard State Machine
//!
//! Both clipboard directions run concurrently:
//!
//! **Server → client**: host mime-type lists are deduplicated, mapped
//! to RDP formats and advertised; a format list in flight blocks
//! further updates (the newest update waits in a single queued slot).
//! An OK response marks the advertised formats allowed for
//! client-issued data requests; a timeout or failure clears them.
//!
//! **Client → server**: a client format list waits until the host has
//! consumed the previous mime-type-list update, then dispatches on the
//! session main loop. At most one `FormatDataRequest` is outstanding
//! towards the client; further requests queue FIFO, each guarded by a
//! timeout. URI-list content resolves into FUSE paths rooted at the
//! session mount point and per-clip-data-id directory.
//!
//! All blocking waits observe `protocol_stopped` and exit promptly on
//! shutdown.

pub mod clip_data;
pub mod formats;
pub mod fuse;

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::host::RemoteDesktopHost;
use crate::peer::pdu::{
    ClipboardFormat, CliprdrClientPdu, CliprdrServerPdu, FileContentsOp, FileContentsRequestPdu,
};
use crate::peer::{OutputPdu, RdpPeer};
use crate::session::main_loop::MainLoopHandle;
use clip_data::{ClipDataLedger, CLIP_DATA_DROP_TIMEOUT};
use formats::FileDescriptor;
use fuse::{FuseClipboard, FuseContentsRequest};

/// Format-list response and format-data request timeout.
pub const FORMAT_TIMEOUT: Duration = Duration::from_secs(4);

/// Clipboard errors (channel-local; never fatal for the session).
#[derive(Debug, Error)]
pub enum ClipboardError {
    #[error("clipboard channel is stopped")]
    Stopped,

    #[error("format not available: {0}")]
    FormatUnavailable(String),
}

/// Result alias for clipboard operations.
pub type Result<T> = std::result::Result<T, ClipboardError>;

/// Negotiated client clipboard capabilities.
#[derive(Debug, Clone, Copy, Default)]
struct ClientClipCaps {
    can_lock_clip_data: bool,
    supports_file_transfer: bool,
}

struct PendingClientRequest {
    request_id: u32,
    format_id: u32,
    /// Host mime type the answer converts into.
    mime_type: String,
    timer: Option<u64>,
}

#[derive(Default)]
struct ClipState {
    protocol_stopped: bool,
    caps: ClientClipCaps,

    // Server → client direction.
    /// Formats advertised and awaiting a response: (format id, source
    /// host mime type).
    server_formats_in_flight: Option<Vec<(u32, String)>>,
    /// Formats the client accepted, by id.
    server_formats_allowed: HashMap<u32, String>,
    /// Replaced by every newer update while a list is in flight.
    queued_server_mimes: Option<Vec<String>>,
    format_list_timer: Option<u64>,
    /// Host paths backing the current FileGroupDescriptorW offer.
    server_file_list: Vec<PathBuf>,
    /// Host content requests in flight, request id → format id.
    pending_server_content: HashMap<u32, u32>,

    // Client → server direction.
    client_formats: Vec<ClipboardFormat>,
    /// The host consumed the last mime-type-list update.
    mime_list_consumed: bool,
    format_list_response_pending: bool,
    current_request: Option<PendingClientRequest>,
    queued_requests: VecDeque<PendingClientRequest>,
    next_request_id: u32,

    // Clip-data locking.
    ledger: ClipDataLedger,
    /// Descriptors of the current client file selection.
    current_descriptors: Option<Vec<FileDescriptor>>,
    /// Armed drop timers, selection serial → timer id.
    drop_timers: HashMap<u64, u64>,
}

struct ClipInner {
    peer: Arc<dyn RdpPeer>,
    host: Arc<dyn RemoteDesktopHost>,
    main_loop: MainLoopHandle,
    state: Mutex<ClipState>,
    /// Pairs with `state` for the mime-consumption and stop waits.
    completion: Condvar,
    fuse: FuseClipboard,
}

/// The per-session clipboard component.
pub struct ClipboardRdp {
    inner: Arc<ClipInner>,
    forwarder: Option<std::thread::JoinHandle<()>>,
}

impl ClipboardRdp {
    pub fn new(
        peer: Arc<dyn RdpPeer>,
        host: Arc<dyn RemoteDesktopHost>,
        main_loop: MainLoopHandle,
    ) -> Self {
        let (fuse_tx, fuse_rx) = unbounded();
        let inner = Arc::new(ClipInner {
            peer,
            host,
            main_loop,
            state: Mutex::new(ClipState {
                mime_list_consumed: true,
                ..ClipState::default()
            }),
            completion: Condvar::new(),
            fuse: FuseClipboard::new(fuse_tx),
        });

        let forwarder = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("cliprdr-fuse-fwd".into())
                .spawn(move || forward_fuse_requests(inner, fuse_rx))
                .expect("spawn fuse forwarder")
        };

        ClipboardRdp {
            inner,
            forwarder: Some(forwarder),
        }
    }

    /// Announce server capabilities and monitor-ready once the channel
    /// is joined.
    pub fn maybe_init(&self) {
        let _ = self
            .inner
            .peer
            .send(OutputPdu::Cliprdr(CliprdrServerPdu::Capabilities {
                can_lock_clip_data: true,
                supports_file_transfer: true,
            }));
        let _ = self
            .inner
            .peer
            .send(OutputPdu::Cliprdr(CliprdrServerPdu::MonitorReady));
    }

    /// Mount the clipboard filesystem. Failures disable file transfer
    /// but keep text/image clipboard working.
    pub fn mount_file_system(&self) {
        if let Err(e) = self.inner.fuse.mount() {
            warn!("clipboard filesystem mount failed: {e}");
        }
    }

    /// Stop every wait and fail outstanding work (session teardown).
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.protocol_stopped = true;
            for entry in state.ledger.clear() {
                self.inner.fuse.clear_selection(entry.serial);
            }
        }
        self.inner.completion.notify_all();
        self.inner.fuse.fail_all_pending();
    }

    // =========================================================================
    // Host-facing surface
    // =========================================================================

    /// The host clipboard offers changed; advertise to the client.
    pub fn update_server_mime_type_list(&self, mut mime_types: Vec<String>) {
        formats::dedup_mime_types(&mut mime_types);

        let send_now = {
            let mut state = self.inner.state.lock();
            if state.protocol_stopped {
                return;
            }
            if state.server_formats_in_flight.is_some() {
                debug!("format list in flight, queueing newer update");
                state.queued_server_mimes = Some(mime_types.clone());
                false
            } else {
                true
            }
        };

        if send_now {
            send_format_list(&self.inner, mime_types);
        }
    }

    /// The host wants client clipboard content; returns the request id
    /// that the answer will carry.
    pub fn request_client_content_for_mime_type(&self, mime_type: &str) -> Result<u32> {
        let mut state = self.inner.state.lock();
        if state.protocol_stopped {
            return Err(ClipboardError::Stopped);
        }

        let format = state
            .client_formats
            .iter()
            .find(|f| formats::mime_type_for_format(f) == Some(mime_type))
            .cloned()
            .ok_or_else(|| ClipboardError::FormatUnavailable(mime_type.to_string()))?;

        let request_id = state.next_request_id;
        state.next_request_id += 1;

        let request = PendingClientRequest {
            request_id,
            format_id: format.format_id,
            mime_type: mime_type.to_string(),
            timer: None,
        };
        self.enqueue_request(&mut state, request);
        Ok(request_id)
    }

    /// The host answers a server-content request issued through
    /// `request_server_content_for_mime_type`.
    pub fn submit_requested_server_content(&self, request_id: u32, content: Option<Vec<u8>>) {
        let format_id = {
            let mut state = self.inner.state.lock();
            let Some(format_id) = state.pending_server_content.remove(&request_id) else {
                warn!("server content for unknown request {}", request_id);
                return;
            };
            format_id
        };

        let response = content
            .and_then(|data| self.convert_server_content(format_id, data))
            .map(|data| CliprdrServerPdu::FormatDataResponse {
                ok: true,
                data: Bytes::from(data),
            })
            .unwrap_or(CliprdrServerPdu::FormatDataResponse {
                ok: false,
                data: Bytes::new(),
            });
        let _ = self.inner.peer.send(OutputPdu::Cliprdr(response));
    }

    // =========================================================================
    // Peer-facing surface (socket thread)
    // =========================================================================

    /// Dispatch one CLIPRDR PDU from the client.
    pub fn handle_client_pdu(&self, pdu: CliprdrClientPdu) {
        match pdu {
            CliprdrClientPdu::Capabilities {
                can_lock_clip_data,
                supports_file_transfer,
                ..
            } => {
                let mut state = self.inner.state.lock();
                state.caps = ClientClipCaps {
                    can_lock_clip_data,
                    supports_file_transfer,
                };
                info!(
                    "client clipboard caps: lock={} files={}",
                    can_lock_clip_data, supports_file_transfer
                );
            }
            CliprdrClientPdu::FormatList(formats) => self.handle_client_format_list(formats),
            CliprdrClientPdu::FormatListResponse { ok } => self.handle_format_list_response(ok),
            CliprdrClientPdu::FormatDataRequest { format_id } => {
                self.handle_format_data_request(format_id)
            }
            CliprdrClientPdu::FormatDataResponse { ok, data } => {
                self.handle_format_data_response(ok, data)
            }
            CliprdrClientPdu::LockClipboardData { clip_data_id } => self.handle_lock(clip_data_id),
            CliprdrClientPdu::UnlockClipboardData { clip_data_id } => {
                self.handle_unlock(clip_data_id)
            }
            CliprdrClientPdu::FileContentsRequest(request) => self.serve_file_contents(request),
            CliprdrClientPdu::FileContentsResponse {
                stream_id,
                ok,
                data,
            } => {
                let serial = self
                    .inner
                    .fuse
                    .handle_file_contents_response(stream_id, ok, &data);
                if let Some(serial) = serial {
                    self.reset_drop_timer(serial);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Client → server: format lists
    // -------------------------------------------------------------------------

    /// Blocks the socket thread until the previous mime-type-list
    /// update was consumed on the host main loop.
    fn handle_client_format_list(&self, client_formats: Vec<ClipboardFormat>) {
        let mime_types = {
            let mut state = self.inner.state.lock();
            if state.format_list_response_pending {
                debug!("ignoring format list, previous response still in flight");
                return;
            }
            state.format_list_response_pending = true;

            while !state.mime_list_consumed && !state.protocol_stopped {
                self.inner.completion.wait(&mut state);
            }
            if state.protocol_stopped {
                return;
            }
            state.mime_list_consumed = false;

            let mut mime_types: Vec<String> = client_formats
                .iter()
                .filter_map(formats::mime_type_for_format)
                .map(String::from)
                .collect();
            mime_types.dedup();

            state.client_formats = client_formats;
            mime_types
        };

        let inner = Arc::clone(&self.inner);
        self.inner.main_loop.invoke(move || {
            let done_inner = Arc::clone(&inner);
            inner.host.clipboard().update_client_mime_type_list(
                mime_types,
                Box::new(move || {
                    let mut state = done_inner.state.lock();
                    state.mime_list_consumed = true;
                    done_inner.completion.notify_all();
                }),
            );

            let _ = inner
                .peer
                .send(OutputPdu::Cliprdr(CliprdrServerPdu::FormatListResponse {
                    ok: true,
                }));
            inner.state.lock().format_list_response_pending = false;
        });
    }

    // -------------------------------------------------------------------------
    // Server → client: format lists
    // -------------------------------------------------------------------------

    fn handle_format_list_response(&self, ok: bool) {
        handle_format_list_outcome(&self.inner, ok);
        // A queued update (the newest one wins) goes out now.
        let queued = self.inner.state.lock().queued_server_mimes.take();
        if let Some(mime_types) = queued {
            send_format_list(&self.inner, mime_types);
        }
    }

    // -------------------------------------------------------------------------
    // Server → client: content
    // -------------------------------------------------------------------------

    /// The client wants server clipboard data.
    fn handle_format_data_request(&self, format_id: u32) {
        let mime_type = {
            let state = self.inner.state.lock();
            state.server_formats_allowed.get(&format_id).cloned()
        };

        let Some(mime_type) = mime_type else {
            debug!("data request for format {} not allowed", format_id);
            let _ = self
                .inner
                .peer
                .send(OutputPdu::Cliprdr(CliprdrServerPdu::FormatDataResponse {
                    ok: false,
                    data: Bytes::new(),
                }));
            return;
        };

        let request_id = {
            let mut state = self.inner.state.lock();
            let request_id = state.next_request_id;
            state.next_request_id += 1;
            state.pending_server_content.insert(request_id, format_id);
            request_id
        };
        self.inner
            .host
            .clipboard()
            .request_server_content_for_mime_type(mime_type, request_id);
    }

    /// Convert host content into the wire representation of a format.
    fn convert_server_content(&self, format_id: u32, data: Vec<u8>) -> Option<Vec<u8>> {
        match format_id {
            formats::CF_UNICODETEXT => {
                let text = String::from_utf8_lossy(&data);
                let mut out = Vec::with_capacity(data.len() * 2 + 2);
                for unit in text.encode_utf16() {
                    out.extend_from_slice(&unit.to_le_bytes());
                }
                out.extend_from_slice(&[0, 0]);
                Some(out)
            }
            formats::CF_TEXT => Some(formats::null_terminate(data)),
            formats::CF_DIB => formats::png_to_dib(&data).or(Some(data)),
            formats::CB_FORMAT_TEXTURILIST => {
                let paths = formats::parse_uri_list(&data);
                if paths.is_empty() {
                    return None;
                }

                let mut descriptors = Vec::with_capacity(paths.len());
                let mut path_list = Vec::with_capacity(paths.len());
                for path in paths {
                    let path = PathBuf::from(path);
                    let metadata = std::fs::metadata(&path).ok()?;
                    let name = path.file_name()?.to_str()?.to_string();
                    descriptors.push(FileDescriptor {
                        name,
                        is_directory: metadata.is_dir(),
                        is_readonly: metadata.permissions().readonly(),
                        size: (!metadata.is_dir()).then(|| metadata.len()),
                        last_write_time: metadata
                            .modified()
                            .ok()
                            .map(formats::system_time_to_filetime),
                    });
                    path_list.push(path);
                }

                self.inner.state.lock().server_file_list = path_list;
                Some(formats::serialize_file_list(&descriptors).to_vec())
            }
            _ => Some(data),
        }
    }

    /// Serve a client file-contents request against the host files
    /// backing the current FileGroupDescriptorW offer.
    fn serve_file_contents(&self, request: FileContentsRequestPdu) {
        let path = {
            let state = self.inner.state.lock();
            state
                .server_file_list
                .get(request.list_index as usize)
                .cloned()
        };

        let data = path.and_then(|path| match request.op {
            FileContentsOp::Size => std::fs::metadata(&path)
                .ok()
                .map(|m| m.len().to_le_bytes().to_vec()),
            FileContentsOp::Range => {
                let mut file = std::fs::File::open(&path).ok()?;
                file.seek(SeekFrom::Start(request.position)).ok()?;
                let mut buffer = vec![0u8; request.requested_size.min(fuse::MAX_READ_SIZE) as usize];
                let read = file.read(&mut buffer).ok()?;
                buffer.truncate(read);
                Some(buffer)
            }
        });

        let response = match data {
            Some(data) => CliprdrServerPdu::FileContentsResponse {
                stream_id: request.stream_id,
                ok: true,
                data: Bytes::from(data),
            },
            None => CliprdrServerPdu::FileContentsResponse {
                stream_id: request.stream_id,
                ok: false,
                data: Bytes::new(),
            },
        };
        let _ = self.inner.peer.send(OutputPdu::Cliprdr(response));
    }

    // -------------------------------------------------------------------------
    // Client → server: content
    // -------------------------------------------------------------------------

    /// Queue or dispatch a client data request; at most one may be
    /// outstanding.
    fn enqueue_request(&self, state: &mut ClipState, request: PendingClientRequest) {
        if state.current_request.is_some() {
            debug!("data request outstanding, queueing request {}", request.request_id);
            state.queued_requests.push_back(request);
            return;
        }
        self.dispatch_request(state, request);
    }

    fn dispatch_request(&self, state: &mut ClipState, mut request: PendingClientRequest) {
        let inner = Arc::clone(&self.inner);
        let request_id = request.request_id;
        request.timer = Some(self.inner.main_loop.add_timeout(FORMAT_TIMEOUT, move || {
            fail_current_request(&inner, request_id);
        }));

        let format_id = request.format_id;
        state.current_request = Some(request);
        let _ = self
            .inner
            .peer
            .send(OutputPdu::Cliprdr(CliprdrServerPdu::FormatDataRequest {
                format_id,
            }));
    }

    fn handle_format_data_response(&self, ok: bool, data: Bytes) {
        let (request, next) = {
            let mut state = self.inner.state.lock();
            let Some(request) = state.current_request.take() else {
                warn!("unsolicited format data response");
                return;
            };
            if let Some(timer) = request.timer {
                self.inner.main_loop.cancel_timeout(timer);
            }
            let next = state.queued_requests.pop_front();
            (request, next)
        };

        let content = ok
            .then(|| self.convert_client_content(&request.mime_type, &data))
            .flatten();
        self.inner
            .host
            .clipboard()
            .submit_client_content_for_mime_type(request.request_id, content);

        // Completion of the outstanding request dispatches exactly the
        // next queued one.
        if let Some(next) = next {
            let mut state = self.inner.state.lock();
            self.dispatch_request(&mut state, next);
        }
    }

    /// Convert client content into the host-native representation.
    fn convert_client_content(&self, mime_type: &str, data: &Bytes) -> Option<Vec<u8>> {
        match mime_type {
            formats::mime::UTF8_STRING | formats::mime::TEXT_PLAIN_UTF8 => {
                let units: Vec<u16> = data
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .take_while(|&u| u != 0)
                    .collect();
                let text = String::from_utf16(&units).ok()?;
                Some(formats::null_terminate(text.into_bytes()))
            }
            formats::mime::TEXT_PLAIN => Some(formats::null_terminate(data.to_vec())),
            formats::mime::IMAGE_PNG => formats::dib_to_png(data),
            formats::mime::IMAGE_BMP => formats::dib_to_bmp(data),
            formats::mime::TEXT_URI_LIST => {
                let paths = self.install_file_selection(data)?;
                Some(formats::build_uri_list(&paths).into_bytes())
            }
            _ => Some(data.to_vec()),
        }
    }

    /// Parse a FileGroupDescriptorW payload and install it as the
    /// implicit selection's FUSE subtree.
    fn install_file_selection(&self, data: &Bytes) -> Option<Vec<String>> {
        let descriptors = formats::parse_file_list(data.clone())?;

        let (serial, old) = {
            let mut state = self.inner.state.lock();
            if !state.caps.supports_file_transfer {
                debug!("client sent a file list without file transfer support");
                return None;
            }
            state.current_descriptors = Some(descriptors.clone());
            state.ledger.replace_implicit(true)
        };
        if let Some(old) = old {
            self.inner.fuse.clear_selection(old.serial);
        }

        Some(self.inner.fuse.set_selection(serial, None, &descriptors))
    }

    // -------------------------------------------------------------------------
    // Clip-data locking
    // -------------------------------------------------------------------------

    fn handle_lock(&self, clip_data_id: u32) {
        let (serial, replaced, descriptors) = {
            let mut state = self.inner.state.lock();
            if !state.caps.can_lock_clip_data {
                warn!("client locked clip data without announcing the capability");
            }
            let has_file_list = state.current_descriptors.is_some();
            let replaced = state.ledger.lock(clip_data_id, has_file_list);
            let serial = state
                .ledger
                .get(clip_data_id)
                .map(|e| e.serial)
                .expect("entry just locked");
            let descriptors = state.current_descriptors.clone();
            (serial, replaced, descriptors)
        };

        if let Some(replaced) = replaced {
            self.cancel_drop_timer(replaced.serial);
            self.inner.fuse.clear_selection(replaced.serial);
        }

        // The entry snapshots the current selection, so file requests
        // against this id keep resolving after re-advertisements.
        if let Some(descriptors) = descriptors {
            self.inner
                .fuse
                .set_selection(serial, Some(clip_data_id), &descriptors);
        }
        debug!("locked clip data id {} (serial {})", clip_data_id, serial);
    }

    fn handle_unlock(&self, clip_data_id: u32) {
        let entry = {
            let mut state = self.inner.state.lock();
            state.ledger.unlock(clip_data_id)
        };
        let Some(entry) = entry else {
            warn!("unlock for unknown clip data id {}", clip_data_id);
            return;
        };

        if self.inner.fuse.pending_for_selection(entry.serial) == 0 {
            self.inner.fuse.clear_selection(entry.serial);
            debug!("dropped clip data id {} immediately", clip_data_id);
        } else {
            self.arm_drop_timer(entry.serial);
        }
    }

    fn arm_drop_timer(&self, serial: u64) {
        let inner = Arc::clone(&self.inner);
        let timer = self
            .inner
            .main_loop
            .add_timeout(CLIP_DATA_DROP_TIMEOUT, move || {
                debug!("clip data serial {} drop timer fired", serial);
                inner.state.lock().drop_timers.remove(&serial);
                inner.fuse.clear_selection(serial);
            });
        self.inner.state.lock().drop_timers.insert(serial, timer);
    }

    fn cancel_drop_timer(&self, serial: u64) {
        if let Some(timer) = self.inner.state.lock().drop_timers.remove(&serial) {
            self.inner.main_loop.cancel_timeout(timer);
        }
    }

    /// A completed file-contents request extends its entry's lifetime.
    fn reset_drop_timer(&self, serial: u64) {
        let had_timer = {
            let mut state = self.inner.state.lock();
            match state.drop_timers.remove(&serial) {
                Some(timer) => {
                    self.inner.main_loop.cancel_timeout(timer);
                    true
                }
                None => false,
            }
        };
        if had_timer {
            self.arm_drop_timer(serial);
        }
    }

    /// Mount path of the clipboard filesystem, if mounted.
    pub fn mount_path(&self) -> Option<PathBuf> {
        self.inner.fuse.mount_path()
    }
}

impl Drop for ClipboardRdp {
    fn drop(&mut self) {
        self.stop();
        self.inner.fuse.dispose();
        if let Some(forwarder) = self.forwarder.take() {
            let _ = forwarder.join();
        }
    }
}

/// Advertise a host mime list as an RDP format list, arming the
/// response timeout.
fn send_format_list(inner: &Arc<ClipInner>, mime_types: Vec<String>) {
    let mut advertised = Vec::new();
    let mut wire_formats = Vec::new();
    for mime_type in &mime_types {
        if let Some(format) = formats::format_for_mime_type(mime_type) {
            advertised.push((format.format_id, mime_type.clone()));
            wire_formats.push(format);
        }
    }
    if wire_formats.is_empty() {
        return;
    }

    {
        let mut state = inner.state.lock();
        state.server_formats_in_flight = Some(advertised);

        let timeout_inner = Arc::clone(inner);
        let timer = inner.main_loop.add_timeout(FORMAT_TIMEOUT, move || {
            warn!("format list response timed out");
            handle_format_list_outcome(&timeout_inner, false);
            let queued = timeout_inner.state.lock().queued_server_mimes.take();
            if let Some(mime_types) = queued {
                send_format_list(&timeout_inner, mime_types);
            }
        });
        state.format_list_timer = Some(timer);
    }

    debug!("advertising {} formats", wire_formats.len());
    let _ = inner
        .peer
        .send(OutputPdu::Cliprdr(CliprdrServerPdu::FormatList(
            wire_formats,
        )));
}

/// Resolve a finished (or failed) server format list.
fn handle_format_list_outcome(inner: &Arc<ClipInner>, ok: bool) {
    let mut state = inner.state.lock();
    if let Some(timer) = state.format_list_timer.take() {
        inner.main_loop.cancel_timeout(timer);
    }
    let Some(advertised) = state.server_formats_in_flight.take() else {
        return;
    };

    if ok {
        state.server_formats_allowed = advertised.into_iter().collect();
        debug!(
            "client accepted {} formats",
            state.server_formats_allowed.len()
        );
    } else {
        state.server_formats_allowed.clear();
    }
}

/// Timeout path of an outstanding client data request.
fn fail_current_request(inner: &Arc<ClipInner>, request_id: u32) {
    let (request, next) = {
        let mut state = inner.state.lock();
        let is_current = state
            .current_request
            .as_ref()
            .map(|r| r.request_id == request_id)
            .unwrap_or(false);
        if !is_current {
            return;
        }
        let request = state.current_request.take().expect("checked above");
        (request, state.queued_requests.pop_front())
    };

    warn!("format data request {} timed out", request.request_id);
    inner
        .host
        .clipboard()
        .submit_client_content_for_mime_type(request.request_id, None);

    if let Some(mut next) = next {
        let inner2 = Arc::clone(inner);
        let next_id = next.request_id;
        next.timer = Some(inner.main_loop.add_timeout(FORMAT_TIMEOUT, move || {
            fail_current_request(&inner2, next_id);
        }));
        let format_id = next.format_id;
        inner.state.lock().current_request = Some(next);
        let _ = inner
            .peer
            .send(OutputPdu::Cliprdr(CliprdrServerPdu::FormatDataRequest {
                format_id,
            }));
    }
}

/// Forward FUSE pulls to the client, applying the clip-data gating.
/// Exits once the protocol stops.
fn forward_fuse_requests(inner: Arc<ClipInner>, requests: Receiver<FuseContentsRequest>) {
    loop {
        let request = match requests.recv_timeout(Duration::from_millis(500)) {
            Ok(request) => request,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if inner.state.lock().protocol_stopped {
                    return;
                }
                continue;
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        };
        if inner.state.lock().protocol_stopped {
            return;
        }

        let allowed = {
            let state = inner.state.lock();
            if state.protocol_stopped {
                false
            } else {
                match request.clip_data_id {
                    Some(id) => {
                        // Locked entries serve requests; dropped ones
                        // keep serving while their subtree survives.
                        state
                            .ledger
                            .get(id)
                            .map(|e| e.requests_allowed)
                            .unwrap_or(true)
                    }
                    // Lock-less requests need a live implicit selection.
                    None => state.ledger.implicit().is_some(),
                }
            }
        };

        if !allowed {
            debug!("discarding fuse request {}", request.stream_id);
            inner
                .fuse
                .handle_file_contents_response(request.stream_id, false, &[]);
            continue;
        }

        let (op, position, requested_size) = match request.range {
            None => (FileContentsOp::Size, 0, 8),
            Some((offset, size)) => (FileContentsOp::Range, offset, size),
        };
        let _ = inner
            .peer
            .send(OutputPdu::Cliprdr(CliprdrServerPdu::FileContentsRequest(
                FileContentsRequestPdu {
                    stream_id: request.stream_id,
                    list_index: request.list_index,
                    op,
                    position,
                    requested_size,
                    clip_data_id: request.clip_data_id,
                },
            )));
    }
}
