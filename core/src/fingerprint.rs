//! Banner-based service identification for response payloads.

pub const UNKNOWN: &str = "unknown";

pub trait Fingerprinter: Send + Sync {
    fn fingerprint(&self, payload: &[u8]) -> String;
}

type Signature = (&'static str, fn(&[u8]) -> bool);

static SIGNATURES: &[Signature] = &[
    ("http", is_http),
    ("tls", is_tls),
    ("ssh", is_ssh),
    ("ftp", is_ftp),
    ("smtp", is_smtp),
    ("pop3", is_pop3),
    ("imap", is_imap),
    ("redis", is_redis),
    ("mysql", is_mysql),
];

/// Matches the first bytes of a payload against well-known service greetings.
#[derive(Debug, Clone, Copy, Default)]
pub struct BannerFingerprinter;

impl Fingerprinter for BannerFingerprinter {
    fn fingerprint(&self, payload: &[u8]) -> String {
        SIGNATURES
            .iter()
            .find(|(_, matches)| matches(payload))
            .map_or(UNKNOWN, |(name, _)| *name)
            .to_string()
    }
}

fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle))
}

fn is_http(payload: &[u8]) -> bool {
    payload.starts_with(b"HTTP/")
}

fn is_tls(payload: &[u8]) -> bool {
    matches!(payload, [0x15 | 0x16, 0x03, ..])
}

fn is_ssh(payload: &[u8]) -> bool {
    payload.starts_with(b"SSH-")
}

fn is_ftp(payload: &[u8]) -> bool {
    payload.starts_with(b"220") && contains_ignore_case(payload, b"ftp")
}

fn is_smtp(payload: &[u8]) -> bool {
    payload.starts_with(b"220") && contains_ignore_case(payload, b"smtp")
}

fn is_pop3(payload: &[u8]) -> bool {
    payload.starts_with(b"+OK")
}

fn is_imap(payload: &[u8]) -> bool {
    payload.starts_with(b"* OK")
}

const REDIS_REPLIES: [&[u8]; 4] = [b"-ERR", b"+PONG", b"-NOAUTH", b"-DENIED"];

fn is_redis(payload: &[u8]) -> bool {
    REDIS_REPLIES
        .iter()
        .any(|prefix| payload.starts_with(prefix))
}

// Initial handshake packet: 3-byte length, sequence id 0, protocol version 10.
fn is_mysql(payload: &[u8]) -> bool {
    matches!(payload, [_, _, _, 0x00, 0x0a, ..])
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
