//! Asset reference classification and conversion.
//!
//! Image and video sources travel through the system as plain strings. A
//! reference is one of four kinds:
//!
//! ```text
//! data:image/png;base64,...            inline          (ephemeral, never persisted)
//! blob:https://app/4f1c...             local-ephemeral (revoked when unreferenced)
//! projects/p1/images/cat.png           storage-key     (persistable, portable)
//! https://cdn.example.com/cat.png      remote-url      (persistable)
//! ```
//!
//! The view layer may wrap storage keys and remote URLs behind a proxy
//! (`/api/assets/proxy?key=...`). Proxy forms are unwrapped before anything
//! else happens, so a reference is never proxied twice.
//!
//! Everything here is pure: no network, no clock, no global state.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::ResolverConfig;
use crate::error::{SyncError, SyncResult};

/// Maximum number of proxy layers unwrapped before giving up.
const MAX_PROXY_DEPTH: usize = 4;

/// The four kinds of asset reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssetKind {
    /// Embedded `data:` URL.
    Inline,
    /// Process-local `blob:` handle.
    LocalEphemeral,
    /// Relative key understood by backend storage.
    StorageKey,
    /// Absolute http(s) URL.
    RemoteUrl,
}

impl AssetKind {
    /// Whether references of this kind may be saved to the backend.
    #[must_use]
    pub const fn is_persistable(self) -> bool {
        matches!(self, Self::StorageKey | Self::RemoteUrl)
    }

    /// Preference rank, lower is better: storage-key, remote-url, then the rest.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::StorageKey => 0,
            Self::RemoteUrl => 1,
            Self::Inline | Self::LocalEphemeral => 2,
        }
    }

    /// Stable name used in logs and JSON.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::LocalEphemeral => "local-ephemeral",
            Self::StorageKey => "storage-key",
            Self::RemoteUrl => "remote-url",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified, normalized reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetReference {
    /// Reference kind.
    pub kind: AssetKind,
    /// Canonical value (proxy unwrapped, storage URLs reduced to keys).
    pub value: String,
}

/// Classifies and converts asset references according to a [`ResolverConfig`].
#[derive(Debug, Clone, Default)]
pub struct AssetResolver {
    config: ResolverConfig,
}

impl AssetResolver {
    /// Create a resolver.
    #[must_use]
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Strip every view-layer proxy wrapper from `reference`.
    #[must_use]
    pub fn unwrap_proxy<'a>(&self, reference: &'a str) -> Cow<'a, str> {
        let mut current = Cow::Borrowed(reference.trim());
        for _ in 0..MAX_PROXY_DEPTH {
            match self.unwrap_proxy_once(&current) {
                Some(inner) => current = Cow::Owned(inner),
                None => break,
            }
        }
        current
    }

    fn unwrap_proxy_once(&self, reference: &str) -> Option<String> {
        let proxy = self.config.proxy_path.as_str();
        if proxy.is_empty() {
            return None;
        }

        let query = if let Some(rest) = reference.strip_prefix(proxy) {
            rest.strip_prefix('?')?.to_string()
        } else {
            let url = Url::parse(reference).ok()?;
            if url.path() != proxy {
                return None;
            }
            url.query()?.to_string()
        };

        url::form_urlencoded::parse(query.as_bytes())
            .find(|(name, _)| name == "key" || name == "url")
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
    }

    /// Classify a reference. Returns `None` for unrecognized strings.
    #[must_use]
    pub fn classify(&self, reference: &str) -> Option<AssetKind> {
        let unwrapped = self.unwrap_proxy(reference);
        classify_unwrapped(&unwrapped)
    }

    /// Classify and normalize in one step.
    #[must_use]
    pub fn parse(&self, reference: &str) -> Option<AssetReference> {
        let unwrapped = self.unwrap_proxy(reference);
        let kind = classify_unwrapped(&unwrapped)?;
        let value = match kind {
            AssetKind::RemoteUrl => {
                let url = Url::parse(&unwrapped).ok()?;
                if let Some(key) = self.storage_key_for(&url) {
                    return Some(AssetReference {
                        kind: AssetKind::StorageKey,
                        value: key,
                    });
                }
                url.to_string()
            }
            AssetKind::StorageKey => unwrapped.trim_start_matches("./").to_string(),
            AssetKind::Inline | AssetKind::LocalEphemeral => unwrapped.into_owned(),
        };
        Some(AssetReference { kind, value })
    }

    /// Canonical key or URL for a reference, `None` if unrecognized.
    #[must_use]
    pub fn normalize(&self, reference: &str) -> Option<String> {
        self.parse(reference).map(|r| r.value)
    }

    /// A value the rendering substrate can display directly.
    ///
    /// Inline and local references pass through. Storage keys always go
    /// through the proxy; remote URLs do when `proxy_remote_urls` is set.
    /// Unrecognized input is returned unchanged.
    #[must_use]
    pub fn to_renderable(&self, reference: &str) -> String {
        let Some(parsed) = self.parse(reference) else {
            return reference.to_string();
        };
        match parsed.kind {
            AssetKind::Inline | AssetKind::LocalEphemeral => parsed.value,
            AssetKind::StorageKey => self.proxied("key", &parsed.value),
            AssetKind::RemoteUrl if self.config.proxy_remote_urls => {
                self.proxied("url", &parsed.value)
            }
            AssetKind::RemoteUrl => parsed.value,
        }
    }

    /// Whether the reference can be saved as-is.
    #[must_use]
    pub fn is_persistable(&self, reference: &str) -> bool {
        self.classify(reference)
            .is_some_and(AssetKind::is_persistable)
    }

    /// Pick the best candidate: storage-key, then remote-url, then inline/local.
    ///
    /// Ties keep the earliest candidate. Unrecognized candidates are ignored.
    pub fn prefer<'a, I>(&self, candidates: I) -> Option<AssetReference>
    where
        I: IntoIterator<Item = &'a str>,
    {
        candidates
            .into_iter()
            .filter_map(|c| self.parse(c))
            .enumerate()
            .min_by_key(|(i, r)| (r.kind.rank(), *i))
            .map(|(_, r)| r)
    }

    fn proxied(&self, param: &str, value: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(value.as_bytes()).collect();
        format!("{}?{param}={encoded}", self.config.proxy_path)
    }

    fn storage_key_for(&self, url: &Url) -> Option<String> {
        let origin = url.origin().ascii_serialization();
        let is_storage = self
            .config
            .storage_origins
            .iter()
            .any(|o| o.trim_end_matches('/').eq_ignore_ascii_case(&origin));
        if !is_storage {
            return None;
        }
        let key = url.path().trim_start_matches('/');
        (!key.is_empty()).then(|| key.to_string())
    }
}

fn classify_unwrapped(reference: &str) -> Option<AssetKind> {
    let reference = reference.trim();
    if reference.is_empty() {
        return None;
    }

    let lower_prefix: String = reference.chars().take(5).collect::<String>().to_lowercase();
    if lower_prefix == "data:" {
        return reference.contains(',').then_some(AssetKind::Inline);
    }
    if lower_prefix == "blob:" {
        return Some(AssetKind::LocalEphemeral);
    }

    match Url::parse(reference) {
        Ok(url) => match url.scheme() {
            "http" | "https" if url.host().is_some() => Some(AssetKind::RemoteUrl),
            _ => None,
        },
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            is_storage_key(reference).then_some(AssetKind::StorageKey)
        }
        Err(_) => None,
    }
}

/// Relative, no leading slash, no traversal, URL-safe characters only.
fn is_storage_key(reference: &str) -> bool {
    let reference = reference.trim_start_matches("./");
    !reference.is_empty()
        && !reference.starts_with('/')
        && !reference.split('/').any(|segment| segment == "..")
        && reference
            .chars()
            .all(|c| {
                c.is_ascii_alphanumeric()
                    || matches!(c, '/' | '-' | '_' | '.' | '~' | '%' | '+' | '=')
            })
}

/// Decoded contents of an inline (`data:`) reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineAsset {
    /// Declared MIME type (defaults to `text/plain` like browsers do).
    pub mime: String,
    /// Raw bytes.
    pub bytes: Vec<u8>,
}

/// Decode a `data:` URL.
///
/// # Errors
///
/// Returns [`SyncError::InvalidAsset`] if the URL is malformed.
pub fn decode_inline(reference: &str) -> SyncResult<InlineAsset> {
    let body = reference
        .trim()
        .strip_prefix("data:")
        .ok_or_else(|| SyncError::InvalidAsset("not a data URL".to_string()))?;
    let (metadata, payload) = body
        .split_once(',')
        .ok_or_else(|| SyncError::InvalidAsset("data URL missing comma".to_string()))?;

    let is_base64 = metadata.ends_with(";base64");
    let mime = metadata
        .split(';')
        .next()
        .filter(|m| !m.is_empty())
        .unwrap_or("text/plain")
        .to_string();

    let bytes = if is_base64 {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| SyncError::InvalidAsset(format!("bad base64 payload: {e}")))?
    } else {
        percent_decode(payload)?
    };

    Ok(InlineAsset { mime, bytes })
}

fn percent_decode(input: &str) -> SyncResult<Vec<u8>> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| SyncError::InvalidAsset("bad percent escape".to_string()))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

/// Container formats recognized from magic bytes or MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetFormat {
    /// PNG image.
    Png,
    /// JPEG image.
    Jpeg,
    /// WebP image.
    WebP,
    /// GIF image.
    Gif,
    /// MP4/QuickTime video.
    Mp4,
    /// WebM/Matroska video.
    WebM,
    /// Anything else.
    Unknown,
}

impl AssetFormat {
    /// Detect from leading bytes.
    #[must_use]
    pub fn sniff(data: &[u8]) -> Self {
        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
            Self::Png
        } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Self::Jpeg
        } else if data.starts_with(b"GIF8") {
            Self::Gif
        } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            Self::WebP
        } else if data.len() >= 8 && &data[4..8] == b"ftyp" {
            Self::Mp4
        } else if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
            Self::WebM
        } else {
            Self::Unknown
        }
    }

    /// Detect from a MIME type.
    #[must_use]
    pub fn from_mime(mime: &str) -> Self {
        match mime.to_ascii_lowercase().as_str() {
            "image/png" => Self::Png,
            "image/jpeg" | "image/jpg" => Self::Jpeg,
            "image/webp" => Self::WebP,
            "image/gif" => Self::Gif,
            "video/mp4" | "video/quicktime" => Self::Mp4,
            "video/webm" => Self::WebM,
            _ => Self::Unknown,
        }
    }

    /// Whether this is a video container.
    #[must_use]
    pub const fn is_video(self) -> bool {
        matches!(self, Self::Mp4 | Self::WebM)
    }

    /// Whether this is a still image.
    #[must_use]
    pub const fn is_image(self) -> bool {
        matches!(self, Self::Png | Self::Jpeg | Self::WebP | Self::Gif)
    }

    /// Detect from bytes, falling back to the declared MIME type.
    #[must_use]
    pub fn detect(data: &[u8], mime: &str) -> Self {
        match Self::sniff(data) {
            Self::Unknown => Self::from_mime(mime),
            format => format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> AssetResolver {
        AssetResolver::new(ResolverConfig {
            proxy_path: "/api/assets/proxy".to_string(),
            storage_origins: vec!["https://cdn.example.com".to_string()],
            proxy_remote_urls: true,
        })
    }

    #[test]
    fn test_classify_four_kinds() {
        let r = resolver();
        assert_eq!(
            r.classify("data:image/png;base64,iVBORw0KGgo="),
            Some(AssetKind::Inline)
        );
        assert_eq!(
            r.classify("blob:https://app.example.com/4f1c"),
            Some(AssetKind::LocalEphemeral)
        );
        assert_eq!(
            r.classify("projects/p1/images/cat.png"),
            Some(AssetKind::StorageKey)
        );
        assert_eq!(
            r.classify("https://images.example.org/cat.png"),
            Some(AssetKind::RemoteUrl)
        );
    }

    #[test]
    fn test_classify_unrecognized() {
        let r = resolver();
        assert_eq!(r.classify(""), None);
        assert_eq!(r.classify("   "), None);
        assert_eq!(r.classify("javascript:alert(1)"), None);
        assert_eq!(r.classify("/absolute/path.png"), None);
        assert_eq!(r.classify("../escape.png"), None);
        assert_eq!(r.classify("has spaces.png"), None);
        assert_eq!(r.classify("data:image/png;base64"), None);
    }

    #[test]
    fn test_unwrap_relative_proxy() {
        let r = resolver();
        let wrapped = "/api/assets/proxy?key=projects%2Fp1%2Fcat.png";
        assert_eq!(r.classify(wrapped), Some(AssetKind::StorageKey));
        assert_eq!(r.normalize(wrapped).as_deref(), Some("projects/p1/cat.png"));
    }

    #[test]
    fn test_unwrap_absolute_and_nested_proxy() {
        let r = resolver();
        let inner = "/api/assets/proxy?url=https%3A%2F%2Fimages.example.org%2Fcat.png";
        let outer = format!(
            "https://app.example.com/api/assets/proxy?url={}",
            url::form_urlencoded::byte_serialize(inner.as_bytes()).collect::<String>()
        );
        assert_eq!(
            r.normalize(&outer).as_deref(),
            Some("https://images.example.org/cat.png")
        );
    }

    #[test]
    fn test_storage_origin_normalizes_to_key() {
        let r = resolver();
        let parsed = r
            .parse("https://cdn.example.com/projects/p1/cat.png?v=3")
            .expect("recognized");
        assert_eq!(parsed.kind, AssetKind::StorageKey);
        assert_eq!(parsed.value, "projects/p1/cat.png");
    }

    #[test]
    fn test_to_renderable_never_double_proxies() {
        let r = resolver();
        let once = r.to_renderable("projects/p1/cat.png");
        assert_eq!(once, "/api/assets/proxy?key=projects%2Fp1%2Fcat.png");
        assert_eq!(r.to_renderable(&once), once);
    }

    #[test]
    fn test_to_renderable_passes_local_through() {
        let r = resolver();
        assert_eq!(r.to_renderable("blob:https://app/1"), "blob:https://app/1");
        assert_eq!(r.to_renderable("data:text/plain,hi"), "data:text/plain,hi");
        assert_eq!(r.to_renderable("garbage value"), "garbage value");
    }

    #[test]
    fn test_remote_without_proxy() {
        let r = AssetResolver::new(ResolverConfig {
            proxy_remote_urls: false,
            ..ResolverConfig::default()
        });
        assert_eq!(
            r.to_renderable("https://images.example.org/cat.png"),
            "https://images.example.org/cat.png"
        );
    }

    #[test]
    fn test_prefer_order() {
        let r = resolver();
        let best = r
            .prefer([
                "blob:https://app/1",
                "https://images.example.org/cat.png",
                "projects/p1/cat.png",
            ])
            .expect("some");
        assert_eq!(best.kind, AssetKind::StorageKey);

        let best = r
            .prefer(["data:text/plain,x", "https://images.example.org/a.png"])
            .expect("some");
        assert_eq!(best.kind, AssetKind::RemoteUrl);
        assert!(r.prefer(["", "not a ref"]).is_none());
    }

    #[test]
    fn test_is_persistable() {
        let r = resolver();
        assert!(r.is_persistable("projects/p1/cat.png"));
        assert!(r.is_persistable("https://images.example.org/cat.png"));
        assert!(!r.is_persistable("blob:https://app/1"));
        assert!(!r.is_persistable("data:text/plain,x"));
    }

    #[test]
    fn test_decode_inline() {
        let asset = decode_inline("data:image/png;base64,iVBORw0KGgo=").expect("decode");
        assert_eq!(asset.mime, "image/png");
        assert_eq!(AssetFormat::sniff(&asset.bytes), AssetFormat::Png);

        let text = decode_inline("data:,hello%20world").expect("decode");
        assert_eq!(text.mime, "text/plain");
        assert_eq!(text.bytes, b"hello world");

        assert!(decode_inline("data:image/png;base64,!!!").is_err());
        assert!(decode_inline("https://x").is_err());
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(AssetFormat::sniff(b"GIF89a...."), AssetFormat::Gif);
        assert_eq!(
            AssetFormat::sniff(&[0, 0, 0, 0x18, b'f', b't', b'y', b'p', b'm', b'p', b'4', b'2']),
            AssetFormat::Mp4
        );
        assert!(AssetFormat::from_mime("video/webm").is_video());
        assert_eq!(AssetFormat::from_mime("image/JPEG"), AssetFormat::Jpeg);
    }
}
