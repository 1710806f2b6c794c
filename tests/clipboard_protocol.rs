//! Clipboard protocol tests at the component level: the at-most-one
//! outstanding data request with FIFO dispatch, format-list flow in
//! both directions, and the mime-list consumption gate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use lamco_rdp_session::clipboard::formats::{CF_TEXT, CF_UNICODETEXT};
use lamco_rdp_session::clipboard::ClipboardRdp;
use lamco_rdp_session::peer::RdpPeer;
use lamco_rdp_session::host::RemoteDesktopHost;
use lamco_rdp_session::peer::pdu::{ClipboardFormat, CliprdrClientPdu, CliprdrServerPdu, OutputPdu};
use lamco_rdp_session::session::main_loop::MainLoop;
use lamco_rdp_session::testing::{HostCall, RecordingHost, RecordingPeer};

fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

fn clipboard_setup() -> (MainLoop, Arc<RecordingPeer>, Arc<RecordingHost>, ClipboardRdp) {
    let main_loop = MainLoop::new();
    let peer = Arc::new(RecordingPeer::default());
    let host = Arc::new(RecordingHost::new());
    let clipboard = ClipboardRdp::new(
        Arc::clone(&peer) as Arc<dyn RdpPeer>,
        Arc::clone(&host) as Arc<dyn RemoteDesktopHost>,
        main_loop.handle(),
    );
    (main_loop, peer, host, clipboard)
}

fn format(format_id: u32) -> ClipboardFormat {
    ClipboardFormat {
        format_id,
        format_name: None,
    }
}

fn sent_data_requests(peer: &RecordingPeer) -> Vec<u32> {
    peer.sent()
        .into_iter()
        .filter_map(|pdu| match pdu {
            OutputPdu::Cliprdr(CliprdrServerPdu::FormatDataRequest { format_id }) => {
                Some(format_id)
            }
            _ => None,
        })
        .collect()
}

#[test]
fn test_client_format_list_reaches_host() {
    let (_main_loop, peer, host, clipboard) = clipboard_setup();

    clipboard.handle_client_pdu(CliprdrClientPdu::FormatList(vec![
        format(CF_UNICODETEXT),
        format(CF_TEXT),
    ]));

    assert!(wait_until(Duration::from_secs(5), || {
        host.calls().iter().any(|c| {
            matches!(
                c,
                HostCall::UpdateClientMimeTypeList { mime_types }
                    if mime_types.contains(&"UTF8_STRING".to_string())
            )
        })
    }));

    // The response goes out after the host dispatch.
    assert!(wait_until(Duration::from_secs(5), || {
        peer.sent().iter().any(|pdu| {
            matches!(
                pdu,
                OutputPdu::Cliprdr(CliprdrServerPdu::FormatListResponse { ok: true })
            )
        })
    }));
}

#[test]
fn test_at_most_one_outstanding_request_fifo() {
    let (_main_loop, peer, host, clipboard) = clipboard_setup();

    clipboard.handle_client_pdu(CliprdrClientPdu::FormatList(vec![
        format(CF_UNICODETEXT),
        format(CF_TEXT),
    ]));
    assert!(wait_until(Duration::from_secs(5), || {
        !host.calls().is_empty()
    }));

    let first = clipboard
        .request_client_content_for_mime_type("UTF8_STRING")
        .unwrap();
    let second = clipboard
        .request_client_content_for_mime_type("text/plain")
        .unwrap();
    assert_ne!(first, second);

    // Only one request is on the wire while the first is outstanding.
    assert_eq!(sent_data_requests(&peer), vec![CF_UNICODETEXT]);

    // Completing it dispatches exactly the next queued request.
    let utf16: Vec<u8> = "hi\0"
        .encode_utf16()
        .flat_map(|u| u.to_le_bytes())
        .collect();
    clipboard.handle_client_pdu(CliprdrClientPdu::FormatDataResponse {
        ok: true,
        data: Bytes::from(utf16),
    });

    assert_eq!(sent_data_requests(&peer), vec![CF_UNICODETEXT, CF_TEXT]);
    assert!(wait_until(Duration::from_secs(5), || {
        host.calls().iter().any(|c| {
            matches!(
                c,
                HostCall::SubmitClientContent {
                    request_id,
                    content: Some(_)
                } if *request_id == first
            )
        })
    }));

    // Answer the second one too.
    clipboard.handle_client_pdu(CliprdrClientPdu::FormatDataResponse {
        ok: true,
        data: Bytes::from_static(b"plain\0"),
    });
    assert!(wait_until(Duration::from_secs(5), || {
        host.calls().iter().any(|c| {
            matches!(
                c,
                HostCall::SubmitClientContent { request_id, .. } if *request_id == second
            )
        })
    }));
}

#[test]
fn test_unknown_mime_type_rejected() {
    let (_main_loop, _peer, _host, clipboard) = clipboard_setup();
    assert!(clipboard
        .request_client_content_for_mime_type("application/x-unknown")
        .is_err());
}

#[test]
fn test_format_list_blocks_until_host_consumed() {
    let (_main_loop, peer, host, clipboard) = clipboard_setup();
    host.auto_consume_mime_lists
        .store(false, std::sync::atomic::Ordering::Release);
    let clipboard = Arc::new(clipboard);

    clipboard.handle_client_pdu(CliprdrClientPdu::FormatList(vec![format(CF_TEXT)]));
    assert!(wait_until(Duration::from_secs(5), || {
        !host.calls().is_empty()
    }));

    // A second list blocks the caller until the host consumed the
    // first mime-type-list update.
    let clipboard2 = Arc::clone(&clipboard);
    let blocked = std::thread::spawn(move || {
        clipboard2.handle_client_pdu(CliprdrClientPdu::FormatList(vec![format(CF_UNICODETEXT)]));
    });

    std::thread::sleep(Duration::from_millis(200));
    assert!(!blocked.is_finished());

    host.consume_pending_mime_lists();
    blocked.join().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        host.calls()
            .iter()
            .filter(|c| matches!(c, HostCall::UpdateClientMimeTypeList { .. }))
            .count()
            == 2
    }));
    // Both lists were answered.
    assert!(wait_until(Duration::from_secs(5), || {
        peer.sent()
            .iter()
            .filter(|pdu| {
                matches!(
                    pdu,
                    OutputPdu::Cliprdr(CliprdrServerPdu::FormatListResponse { ok: true })
                )
            })
            .count()
            == 2
    }));
}

#[test]
fn test_server_format_list_queues_newest_update() {
    let (_main_loop, peer, _host, clipboard) = clipboard_setup();

    clipboard.update_server_mime_type_list(vec!["text/plain".into()]);
    // Two further updates while the first list is in flight; only the
    // newest survives the queue slot.
    clipboard.update_server_mime_type_list(vec!["text/html".into()]);
    clipboard.update_server_mime_type_list(vec!["image/png".into()]);

    let format_lists = |peer: &RecordingPeer| -> Vec<Vec<u32>> {
        peer.sent()
            .into_iter()
            .filter_map(|pdu| match pdu {
                OutputPdu::Cliprdr(CliprdrServerPdu::FormatList(formats)) => {
                    Some(formats.into_iter().map(|f| f.format_id).collect())
                }
                _ => None,
            })
            .collect()
    };
    assert_eq!(format_lists(&peer).len(), 1);

    clipboard.handle_client_pdu(CliprdrClientPdu::FormatListResponse { ok: true });

    let lists = format_lists(&peer);
    assert_eq!(lists.len(), 2);
    assert_eq!(lists[1], vec![lamco_rdp_session::clipboard::formats::CB_FORMAT_PNG]);
}

#[test]
fn test_mime_dedup_before_advertising() {
    let (_main_loop, peer, _host, clipboard) = clipboard_setup();

    clipboard.update_server_mime_type_list(vec![
        "text/uri-list".into(),
        "x-special/gnome-copied-files".into(),
        "UTF8_STRING".into(),
        "text/plain;charset=utf-8".into(),
    ]);

    let formats = peer
        .sent()
        .into_iter()
        .find_map(|pdu| match pdu {
            OutputPdu::Cliprdr(CliprdrServerPdu::FormatList(formats)) => Some(formats),
            _ => None,
        })
        .unwrap();
    // gnome-copied-files and the utf-8 duplicate are dropped.
    assert_eq!(formats.len(), 2);
}
