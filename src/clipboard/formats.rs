//! Clipboard Format Table
//!
//! Mapping between host mime types and RDP clipboard format ids and
//! names, the server→client mime dedup rules, and the bit-exact
//! FILEDESCRIPTORW serialization used for file selections.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use tracing::debug;

use crate::peer::pdu::ClipboardFormat;

// =============================================================================
// Format ids
// =============================================================================

pub const CF_TEXT: u32 = 1;
pub const CF_TIFF: u32 = 6;
pub const CF_DIB: u32 = 8;
pub const CF_UNICODETEXT: u32 = 13;

/// Registered formats, ids as assigned by the server-side table.
pub const CB_FORMAT_HTML: u32 = 0xD010;
pub const CB_FORMAT_PNG: u32 = 0xD011;
pub const CB_FORMAT_JPEG: u32 = 0xD012;
pub const CB_FORMAT_GIF: u32 = 0xD013;
pub const CB_FORMAT_TEXTURILIST: u32 = 0xD014;

/// Format name announcing a file selection.
pub const FILE_GROUP_DESCRIPTOR_W: &str = "FileGroupDescriptorW";
/// Truncated variant used by short-format-name clients.
pub const FILE_GROUP_DESCRIPTOR_W_SHORT: &str = "FileGroupDescri";

// =============================================================================
// Mime table
// =============================================================================

/// Well-known mime types handled by the table.
pub mod mime {
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const TEXT_PLAIN_UTF8: &str = "text/plain;charset=utf-8";
    pub const UTF8_STRING: &str = "UTF8_STRING";
    pub const TEXT_HTML: &str = "text/html";
    pub const TEXT_URI_LIST: &str = "text/uri-list";
    pub const GNOME_COPIED_FILES: &str = "x-special/gnome-copied-files";
    pub const IMAGE_BMP: &str = "image/bmp";
    pub const IMAGE_TIFF: &str = "image/tiff";
    pub const IMAGE_GIF: &str = "image/gif";
    pub const IMAGE_JPEG: &str = "image/jpeg";
    pub const IMAGE_PNG: &str = "image/png";
}

/// Map a host mime type to the RDP format advertised for it.
pub fn format_for_mime_type(mime_type: &str) -> Option<ClipboardFormat> {
    let (format_id, format_name) = match mime_type {
        mime::TEXT_PLAIN => (CF_TEXT, None),
        mime::TEXT_PLAIN_UTF8 | mime::UTF8_STRING => (CF_UNICODETEXT, None),
        mime::IMAGE_BMP => (CF_DIB, None),
        mime::IMAGE_TIFF => (CF_TIFF, None),
        mime::IMAGE_GIF => (CB_FORMAT_GIF, None),
        mime::IMAGE_JPEG => (CB_FORMAT_JPEG, None),
        mime::IMAGE_PNG => (CB_FORMAT_PNG, None),
        mime::TEXT_HTML => (CB_FORMAT_HTML, None),
        mime::TEXT_URI_LIST => (
            CB_FORMAT_TEXTURILIST,
            Some(FILE_GROUP_DESCRIPTOR_W.to_string()),
        ),
        _ => return None,
    };
    Some(ClipboardFormat {
        format_id,
        format_name,
    })
}

/// Map a client format announcement back to the host mime type the
/// session requests content as.
pub fn mime_type_for_format(format: &ClipboardFormat) -> Option<&'static str> {
    if let Some(name) = &format.format_name {
        if name == FILE_GROUP_DESCRIPTOR_W || name == FILE_GROUP_DESCRIPTOR_W_SHORT {
            return Some(mime::TEXT_URI_LIST);
        }
    }
    match format.format_id {
        CF_TEXT => Some(mime::TEXT_PLAIN),
        CF_UNICODETEXT => Some(mime::UTF8_STRING),
        CF_DIB => Some(mime::IMAGE_BMP),
        CF_TIFF => Some(mime::IMAGE_TIFF),
        CB_FORMAT_GIF => Some(mime::IMAGE_GIF),
        CB_FORMAT_JPEG => Some(mime::IMAGE_JPEG),
        CB_FORMAT_PNG => Some(mime::IMAGE_PNG),
        CB_FORMAT_HTML => Some(mime::TEXT_HTML),
        _ => None,
    }
}

/// Whether a client format list announces a file selection.
pub fn has_file_list(formats: &[ClipboardFormat]) -> bool {
    formats.iter().any(|f| {
        f.format_name
            .as_deref()
            .map(|n| n == FILE_GROUP_DESCRIPTOR_W || n == FILE_GROUP_DESCRIPTOR_W_SHORT)
            .unwrap_or(false)
    })
}

/// Remove host mime duplicates before advertising:
/// `x-special/gnome-copied-files` falls to `text/uri-list`, and
/// `text/plain;charset=utf-8` falls to `UTF8_STRING`.
pub fn dedup_mime_types(mime_types: &mut Vec<String>) {
    let has_uri_list = mime_types.iter().any(|m| m == mime::TEXT_URI_LIST);
    let has_utf8_string = mime_types.iter().any(|m| m == mime::UTF8_STRING);

    mime_types.retain(|m| {
        if has_uri_list && m == mime::GNOME_COPIED_FILES {
            debug!("dropping duplicated mime type {}", m);
            return false;
        }
        if has_utf8_string && m == mime::TEXT_PLAIN_UTF8 {
            debug!("dropping duplicated mime type {}", m);
            return false;
        }
        true
    });
}

// =============================================================================
// FILEDESCRIPTORW serialization
// =============================================================================

/// Size of one serialized FILEDESCRIPTORW record.
pub const FILE_DESCRIPTOR_SIZE: usize = 592;

/// Maximum file name length in UTF-16 code units (including NUL).
pub const FILE_DESCRIPTOR_NAME_UNITS: usize = 260;

const FD_ATTRIBUTES: u32 = 0x0000_0004;
const FD_FILESIZE: u32 = 0x0000_0040;
const FD_WRITESTIME: u32 = 0x0000_0020;
const FD_PROGRESSUI: u32 = 0x0000_4000;

const FILE_ATTRIBUTE_READONLY: u32 = 0x0000_0001;
const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0000_0010;
const FILE_ATTRIBUTE_NORMAL: u32 = 0x0000_0080;

/// Seconds between 1601-01-01 and the Unix epoch.
const FILETIME_EPOCH_OFFSET_SECS: u64 = 11_644_473_600;

/// One file in a selection, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Name relative to the selection root; `\` separates components.
    pub name: String,
    pub is_directory: bool,
    pub is_readonly: bool,
    /// Unknown sizes are resolved lazily through SIZE requests.
    pub size: Option<u64>,
    /// Windows FILETIME of the last write.
    pub last_write_time: Option<u64>,
}

/// Convert a `SystemTime` into a Windows FILETIME value.
pub fn system_time_to_filetime(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since_epoch) => {
            (since_epoch.as_secs() + FILETIME_EPOCH_OFFSET_SECS) * 10_000_000
                + u64::from(since_epoch.subsec_nanos()) / 100
        }
        Err(_) => 0,
    }
}

/// Serialize a file list as the FileGroupDescriptorW format-data
/// payload: a u32 count followed by fixed 592-byte records.
pub fn serialize_file_list(descriptors: &[FileDescriptor]) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + descriptors.len() * FILE_DESCRIPTOR_SIZE);
    out.put_u32_le(descriptors.len() as u32);

    for descriptor in descriptors {
        let mut flags = FD_ATTRIBUTES | FD_PROGRESSUI;
        if descriptor.size.is_some() {
            flags |= FD_FILESIZE;
        }
        if descriptor.last_write_time.is_some() {
            flags |= FD_WRITESTIME;
        }

        let mut attributes = 0;
        if descriptor.is_directory {
            attributes |= FILE_ATTRIBUTE_DIRECTORY;
        }
        if descriptor.is_readonly {
            attributes |= FILE_ATTRIBUTE_READONLY;
        }
        if attributes == 0 {
            attributes = FILE_ATTRIBUTE_NORMAL;
        }

        out.put_u32_le(flags);
        out.put_bytes(0, 32); // reserved1
        out.put_u32_le(attributes);
        out.put_bytes(0, 16); // reserved2
        out.put_u64_le(descriptor.last_write_time.unwrap_or(0));
        let size = descriptor.size.unwrap_or(0);
        out.put_u32_le((size >> 32) as u32);
        out.put_u32_le(size as u32);

        let mut units = 0;
        for unit in descriptor.name.encode_utf16() {
            if units >= FILE_DESCRIPTOR_NAME_UNITS - 1 {
                break;
            }
            out.put_u16_le(unit);
            units += 1;
        }
        while units < FILE_DESCRIPTOR_NAME_UNITS {
            out.put_u16_le(0);
            units += 1;
        }
    }

    out.freeze()
}

/// Parse a FileGroupDescriptorW payload from the client. File-name
/// components must not contain `/` or NUL; offending selections are
/// rejected entirely.
pub fn parse_file_list(mut data: Bytes) -> Option<Vec<FileDescriptor>> {
    if data.len() < 4 {
        return None;
    }
    let count = data.get_u32_le() as usize;
    if data.len() < count * FILE_DESCRIPTOR_SIZE {
        return None;
    }

    let mut descriptors = Vec::with_capacity(count);
    for _ in 0..count {
        let flags = data.get_u32_le();
        data.advance(32);
        let attributes = data.get_u32_le();
        data.advance(16);
        let last_write_time = data.get_u64_le();
        let size_high = data.get_u32_le();
        let size_low = data.get_u32_le();

        let mut units = Vec::with_capacity(FILE_DESCRIPTOR_NAME_UNITS);
        for _ in 0..FILE_DESCRIPTOR_NAME_UNITS {
            units.push(data.get_u16_le());
        }
        let name_end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
        let name = String::from_utf16(&units[..name_end]).ok()?;

        if name.is_empty() || name.split('\\').any(|c| c.is_empty() || c.contains('/')) {
            debug!("rejecting file selection with invalid name {:?}", name);
            return None;
        }

        descriptors.push(FileDescriptor {
            name,
            is_directory: attributes & FILE_ATTRIBUTE_DIRECTORY != 0,
            is_readonly: attributes & FILE_ATTRIBUTE_READONLY != 0,
            size: (flags & FD_FILESIZE != 0)
                .then(|| (u64::from(size_high) << 32) | u64::from(size_low)),
            last_write_time: (flags & FD_WRITESTIME != 0).then_some(last_write_time),
        });
    }

    Some(descriptors)
}

// =============================================================================
// URI lists
// =============================================================================

/// Characters escaped in file-URI paths.
const URI_PATH_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'#')
    .add(b'%')
    .add(b'?')
    .add(b'{')
    .add(b'}');

/// Build a `text/uri-list` payload for paths under the FUSE mount.
pub fn build_uri_list(paths: &[String]) -> String {
    let mut out = String::new();
    for path in paths {
        out.push_str("file://");
        out.push_str(&utf8_percent_encode(path, URI_PATH_SET).to_string());
        out.push_str("\r\n");
    }
    out
}

/// Extract local file paths from a host `text/uri-list` payload.
pub fn parse_uri_list(data: &[u8]) -> Vec<String> {
    let Ok(text) = std::str::from_utf8(data) else {
        return Vec::new();
    };
    text.lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let path = line.trim_end().strip_prefix("file://")?;
            percent_decode_str(path)
                .decode_utf8()
                .ok()
                .map(|p| p.into_owned())
        })
        .collect()
}

// =============================================================================
// Payload conversion
// =============================================================================

/// Null-terminate a text payload before it reaches the host converter.
pub fn null_terminate(mut data: Vec<u8>) -> Vec<u8> {
    if data.last() != Some(&0) {
        data.push(0);
    }
    data
}

/// Convert a CF_DIB payload into a BMP file by prepending the file
/// header the DIB lacks.
pub fn dib_to_bmp(dib: &[u8]) -> Option<Vec<u8>> {
    if dib.len() < 40 {
        return None;
    }
    let header_size = u32::from_le_bytes(dib[0..4].try_into().ok()?);
    let bit_count = u16::from_le_bytes(dib[14..16].try_into().ok()?);
    let compression = u32::from_le_bytes(dib[16..20].try_into().ok()?);
    let clr_used = u32::from_le_bytes(dib[32..36].try_into().ok()?);

    // Palette follows the info header for indexed formats; bitfield
    // masks follow for BI_BITFIELDS (3).
    let palette_entries = if clr_used != 0 {
        clr_used
    } else if bit_count <= 8 {
        1 << bit_count
    } else {
        0
    };
    let mask_bytes = if compression == 3 { 12 } else { 0 };
    let pixel_offset = 14 + header_size + mask_bytes + palette_entries * 4;

    let mut bmp = Vec::with_capacity(14 + dib.len());
    bmp.extend_from_slice(b"BM");
    bmp.extend_from_slice(&((14 + dib.len()) as u32).to_le_bytes());
    bmp.extend_from_slice(&[0, 0, 0, 0]);
    bmp.extend_from_slice(&pixel_offset.to_le_bytes());
    bmp.extend_from_slice(dib);
    Some(bmp)
}

/// Strip the BMP file header, leaving a CF_DIB payload.
pub fn bmp_to_dib(bmp: &[u8]) -> Option<Vec<u8>> {
    if bmp.len() < 54 || &bmp[0..2] != b"BM" {
        return None;
    }
    Some(bmp[14..].to_vec())
}

/// Re-encode an image payload into PNG (client CF_DIB → host
/// `image/png`).
pub fn dib_to_png(dib: &[u8]) -> Option<Vec<u8>> {
    let bmp = dib_to_bmp(dib)?;
    let img = image::load_from_memory_with_format(&bmp, image::ImageFormat::Bmp).ok()?;
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).ok()?;
    Some(out.into_inner())
}

/// Re-encode a PNG payload as CF_DIB (host `image/png` → client).
pub fn png_to_dib(png: &[u8]) -> Option<Vec<u8>> {
    let img = image::load_from_memory_with_format(png, image::ImageFormat::Png).ok()?;
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Bmp).ok()?;
    bmp_to_dib(&out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_round_trip() {
        let format = format_for_mime_type(mime::TEXT_PLAIN).unwrap();
        assert_eq!(format.format_id, CF_TEXT);
        assert_eq!(mime_type_for_format(&format), Some(mime::TEXT_PLAIN));

        let format = format_for_mime_type(mime::IMAGE_PNG).unwrap();
        assert_eq!(format.format_id, CB_FORMAT_PNG);
        assert_eq!(mime_type_for_format(&format), Some(mime::IMAGE_PNG));
    }

    #[test]
    fn test_uri_list_format_carries_name() {
        let format = format_for_mime_type(mime::TEXT_URI_LIST).unwrap();
        assert_eq!(format.format_id, CB_FORMAT_TEXTURILIST);
        assert_eq!(format.format_name.as_deref(), Some(FILE_GROUP_DESCRIPTOR_W));
    }

    #[test]
    fn test_short_format_name_recognized() {
        let format = ClipboardFormat {
            format_id: 0xC123,
            format_name: Some(FILE_GROUP_DESCRIPTOR_W_SHORT.to_string()),
        };
        assert_eq!(mime_type_for_format(&format), Some(mime::TEXT_URI_LIST));
        assert!(has_file_list(&[format]));
    }

    #[test]
    fn test_dedup_gnome_copied_files() {
        let mut mimes = vec![
            mime::TEXT_URI_LIST.to_string(),
            mime::GNOME_COPIED_FILES.to_string(),
            mime::TEXT_PLAIN.to_string(),
        ];
        dedup_mime_types(&mut mimes);
        assert_eq!(mimes, vec![mime::TEXT_URI_LIST, mime::TEXT_PLAIN]);
    }

    #[test]
    fn test_dedup_utf8_text() {
        let mut mimes = vec![
            mime::UTF8_STRING.to_string(),
            mime::TEXT_PLAIN_UTF8.to_string(),
        ];
        dedup_mime_types(&mut mimes);
        assert_eq!(mimes, vec![mime::UTF8_STRING]);
    }

    #[test]
    fn test_dedup_keeps_singletons() {
        let mut mimes = vec![
            mime::GNOME_COPIED_FILES.to_string(),
            mime::TEXT_PLAIN_UTF8.to_string(),
        ];
        dedup_mime_types(&mut mimes);
        assert_eq!(mimes.len(), 2);
    }

    #[test]
    fn test_file_descriptor_record_size() {
        let descriptors = vec![FileDescriptor {
            name: "a.txt".into(),
            is_directory: false,
            is_readonly: false,
            size: Some(1234),
            last_write_time: None,
        }];
        let data = serialize_file_list(&descriptors);
        assert_eq!(data.len(), 4 + FILE_DESCRIPTOR_SIZE);
    }

    #[test]
    fn test_file_descriptor_round_trip() {
        let descriptors = vec![
            FileDescriptor {
                name: "docs".into(),
                is_directory: true,
                is_readonly: false,
                size: None,
                last_write_time: Some(132_000_000_000_000_000),
            },
            FileDescriptor {
                name: "docs\\a.txt".into(),
                is_directory: false,
                is_readonly: true,
                size: Some(0x1_0000_1234),
                last_write_time: None,
            },
        ];

        let parsed = parse_file_list(serialize_file_list(&descriptors)).unwrap();
        assert_eq!(parsed, descriptors);
    }

    #[test]
    fn test_file_name_with_slash_rejected() {
        let descriptors = vec![FileDescriptor {
            name: "evil/name".into(),
            is_directory: false,
            is_readonly: false,
            size: Some(1),
            last_write_time: None,
        }];
        assert!(parse_file_list(serialize_file_list(&descriptors)).is_none());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let data = serialize_file_list(&[FileDescriptor {
            name: "a".into(),
            is_directory: false,
            is_readonly: false,
            size: Some(1),
            last_write_time: None,
        }]);
        assert!(parse_file_list(data.slice(0..100)).is_none());
    }

    #[test]
    fn test_filetime_conversion() {
        // 2021-01-01 00:00:00 UTC.
        let time = UNIX_EPOCH + std::time::Duration::from_secs(1_609_459_200);
        assert_eq!(system_time_to_filetime(time), 132_539_328_000_000_000);
    }

    #[test]
    fn test_uri_list_round_trip() {
        let paths = vec!["/run/user/1000/clip/0/a file.txt".to_string()];
        let uri_list = build_uri_list(&paths);
        assert_eq!(uri_list, "file:///run/user/1000/clip/0/a%20file.txt\r\n");
        assert_eq!(parse_uri_list(uri_list.as_bytes()), paths);
    }

    #[test]
    fn test_parse_uri_list_skips_comments() {
        let data = b"# comment\r\nfile:///tmp/a.txt\r\n";
        assert_eq!(parse_uri_list(data), vec!["/tmp/a.txt".to_string()]);
    }

    #[test]
    fn test_null_terminate() {
        assert_eq!(null_terminate(b"abc".to_vec()), b"abc\0");
        assert_eq!(null_terminate(b"abc\0".to_vec()), b"abc\0");
    }

    #[test]
    fn test_dib_bmp_round_trip() {
        // Minimal 1×1 24-bit BMP via the image crate.
        let img = image::DynamicImage::new_rgb8(1, 1);
        let mut bmp = std::io::Cursor::new(Vec::new());
        img.write_to(&mut bmp, image::ImageFormat::Bmp).unwrap();
        let bmp = bmp.into_inner();

        let dib = bmp_to_dib(&bmp).unwrap();
        let rebuilt = dib_to_bmp(&dib).unwrap();
        let reparsed =
            image::load_from_memory_with_format(&rebuilt, image::ImageFormat::Bmp);
        assert!(reparsed.is_ok());
    }

    #[test]
    fn test_png_conversion() {
        let img = image::DynamicImage::new_rgb8(2, 2);
        let mut png = std::io::Cursor::new(Vec::new());
        img.write_to(&mut png, image::ImageFormat::Png).unwrap();

        let dib = png_to_dib(&png.into_inner()).unwrap();
        let png_again = dib_to_png(&dib).unwrap();
        assert!(image::load_from_memory_with_format(&png_again, image::ImageFormat::Png).is_ok());
    }
}
