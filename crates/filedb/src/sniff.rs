//! Media type sniffing from leading bytes, and suffix lookup.

/// How many leading bytes the sniffer looks at.
pub const SNIFF_LEN: usize = 512;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// (offset, magic, media type)
const SIGNATURES: &[(usize, &[u8], &str)] = &[
    (0, b"\x89PNG\r\n\x1a\n", "image/png"),
    (0, b"\xff\xd8\xff", "image/jpeg"),
    (0, b"GIF87a", "image/gif"),
    (0, b"GIF89a", "image/gif"),
    (0, b"%PDF-", "application/pdf"),
    (0, b"PK\x03\x04", "application/zip"),
    (0, b"\x1f\x8b", "application/gzip"),
    (0, b"BZh", "application/x-bzip2"),
    (0, b"\xfd7zXZ\x00", "application/x-xz"),
    (0, b"7z\xbc\xaf\x27\x1c", "application/x-7z-compressed"),
    (0, b"MThd", "audio/midi"),
    (0, b"OggS", "audio/ogg"),
    (0, b"fLaC", "audio/flac"),
    (0, b"ID3", "audio/mpeg"),
    (0, b"BM", "image/bmp"),
    (0, b"II*\x00", "image/tiff"),
    (0, b"MM\x00*", "image/tiff"),
    (0, b"\x00\x00\x01\x00", "image/x-icon"),
    (0, b"\x7fELF", "application/x-executable"),
    (0, b"SQLite format 3\x00", "application/vnd.sqlite3"),
    (4, b"ftypqt", "video/quicktime"),
    (4, b"ftyp", "video/mp4"),
];

/// Extensions preferred over the first entry mime_guess would give us.
const PREFERRED_SUFFIXES: &[(&str, &str)] = &[
    ("image/jpeg", ".jpg"),
    ("text/plain", ".txt"),
    ("text/html", ".html"),
    ("application/xml", ".xml"),
    ("application/json", ".json"),
    ("audio/mpeg", ".mp3"),
    ("audio/midi", ".mid"),
    ("video/mp4", ".mp4"),
    ("image/tiff", ".tif"),
    (OCTET_STREAM, ""),
];

/// Guess a media type from the first bytes of some content.
pub fn sniff_media_type(head: &[u8]) -> &'static str {
    let head = &head[..head.len().min(SNIFF_LEN)];

    if head.len() >= 12 && head.starts_with(b"RIFF") {
        match &head[8..12] {
            b"WAVE" => return "audio/wav",
            b"WEBP" => return "image/webp",
            b"AVI " => return "video/x-msvideo",
            _ => {}
        }
    }

    for (offset, magic, media_type) in SIGNATURES {
        if head.len() >= offset + magic.len() && &head[*offset..offset + magic.len()] == *magic {
            return media_type;
        }
    }

    sniff_text(head).unwrap_or(OCTET_STREAM)
}

fn sniff_text(head: &[u8]) -> Option<&'static str> {
    if head.contains(&0) {
        return None;
    }
    // A multi-byte sequence may be cut at the sniff boundary.
    let text = match std::str::from_utf8(head) {
        Ok(text) => text,
        Err(e) if e.error_len().is_none() => std::str::from_utf8(&head[..e.valid_up_to()]).ok()?,
        Err(_) => return None,
    };
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();

    let lower: String = trimmed.chars().take(16).collect::<String>().to_ascii_lowercase();
    if lower.starts_with("<!doctype html") || lower.starts_with("<html") {
        Some("text/html")
    } else if lower.starts_with("<?xml") {
        Some("application/xml")
    } else if lower.starts_with("<svg") {
        Some("image/svg+xml")
    } else if trimmed.starts_with('{') || trimmed.starts_with('[') {
        Some("application/json")
    } else {
        Some("text/plain")
    }
}

/// File suffix (with leading dot) for a media type, or "" when unknown.
pub fn suffix_for(media_type: &str) -> String {
    let essence = media_type
        .split(';')
        .next()
        .unwrap_or(media_type)
        .trim()
        .to_ascii_lowercase();

    if let Some((_, suffix)) = PREFERRED_SUFFIXES.iter().find(|(m, _)| *m == essence) {
        return suffix.to_string();
    }

    mime_guess::get_mime_extensions_str(&essence)
        .and_then(|exts| exts.first())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default()
}
