//! Message representation with inline, shared and external storage.
//!
//! Small payloads are stored inline to avoid allocation on the hot path.
//! Larger payloads ride on [`bytes::Bytes`] so clones are reference-counted
//! rather than copied, which is what lets one message fan out to many pipes.
//! External storage wraps a caller-owned buffer and runs a release callback
//! when the last clone is dropped.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Payloads up to this size are stored inside the message itself.
pub const INLINE_CAPACITY: usize = 32;

/// Frame flag: more frames of the same logical message follow.
///
/// This is the only flag that crosses the wire (bit 0 of the frame header).
pub const MORE: u8 = 0x01;

/// Caller-owned storage with an optional release callback.
struct External {
    data: Box<dyn AsRef<[u8]> + Send + Sync>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for External {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

enum Content {
    Inline { buf: [u8; INLINE_CAPACITY], len: u8 },
    Shared(Bytes),
    External(Arc<External>),
    /// Marks the end of a pipe during shutdown. Never delivered to callers
    /// and never written to the wire.
    Delimiter,
}

/// A single message frame.
///
/// Cloning is cheap: inline frames are copied by value, shared and external
/// frames bump a reference count.
pub struct Msg {
    content: Content,
    flags: u8,
}

impl Msg {
    /// Create an empty frame.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            content: Content::Inline {
                buf: [0; INLINE_CAPACITY],
                len: 0,
            },
            flags: 0,
        }
    }

    /// Create the pipe-termination marker.
    #[must_use]
    pub const fn delimiter() -> Self {
        Self {
            content: Content::Delimiter,
            flags: 0,
        }
    }

    /// Create a frame by copying `data`.
    ///
    /// Payloads up to [`INLINE_CAPACITY`] bytes are stored inline, larger
    /// ones are moved to a shared heap buffer.
    #[must_use]
    pub fn copy_from_slice(data: &[u8]) -> Self {
        if data.len() <= INLINE_CAPACITY {
            let mut buf = [0u8; INLINE_CAPACITY];
            buf[..data.len()].copy_from_slice(data);
            Self {
                content: Content::Inline {
                    buf,
                    len: data.len() as u8,
                },
                flags: 0,
            }
        } else {
            Self {
                content: Content::Shared(Bytes::copy_from_slice(data)),
                flags: 0,
            }
        }
    }

    /// Create a frame over caller-owned storage.
    ///
    /// `release` runs exactly once, when the last clone of the frame is
    /// dropped. The buffer must stay valid until then, which the box
    /// ownership guarantees.
    #[must_use]
    pub fn external(
        data: impl AsRef<[u8]> + Send + Sync + 'static,
        release: Option<Box<dyn FnOnce() + Send + Sync>>,
    ) -> Self {
        Self {
            content: Content::External(Arc::new(External {
                data: Box::new(data),
                release,
            })),
            flags: 0,
        }
    }

    /// Payload bytes. Empty for the delimiter.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match &self.content {
            Content::Inline { buf, len } => &buf[..*len as usize],
            Content::Shared(bytes) => bytes,
            Content::External(ext) => (*ext.data).as_ref(),
            Content::Delimiter => &[],
        }
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    #[must_use]
    pub const fn is_delimiter(&self) -> bool {
        matches!(self.content, Content::Delimiter)
    }

    #[must_use]
    pub const fn flags(&self) -> u8 {
        self.flags
    }

    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.flags & MORE != 0
    }

    pub fn set_more(&mut self, more: bool) {
        if more {
            self.flags |= MORE;
        } else {
            self.flags &= !MORE;
        }
    }

    /// Payload as a shared buffer, copying inline content out.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        match &self.content {
            Content::Shared(bytes) => bytes.clone(),
            Content::Delimiter => Bytes::new(),
            _ => Bytes::copy_from_slice(self.data()),
        }
    }
}

impl Default for Msg {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Msg {
    fn clone(&self) -> Self {
        let content = match &self.content {
            Content::Inline { buf, len } => Content::Inline {
                buf: *buf,
                len: *len,
            },
            Content::Shared(bytes) => Content::Shared(bytes.clone()),
            Content::External(ext) => Content::External(Arc::clone(ext)),
            Content::Delimiter => Content::Delimiter,
        };
        Self {
            content,
            flags: self.flags,
        }
    }
}

impl From<Bytes> for Msg {
    fn from(bytes: Bytes) -> Self {
        if bytes.len() <= INLINE_CAPACITY {
            Self::copy_from_slice(&bytes)
        } else {
            Self {
                content: Content::Shared(bytes),
                flags: 0,
            }
        }
    }
}

impl From<Vec<u8>> for Msg {
    fn from(data: Vec<u8>) -> Self {
        if data.len() <= INLINE_CAPACITY {
            Self::copy_from_slice(&data)
        } else {
            Self {
                content: Content::Shared(Bytes::from(data)),
                flags: 0,
            }
        }
    }
}

impl From<&[u8]> for Msg {
    fn from(data: &[u8]) -> Self {
        Self::copy_from_slice(data)
    }
}

impl From<&str> for Msg {
    fn from(s: &str) -> Self {
        Self::copy_from_slice(s.as_bytes())
    }
}

impl From<String> for Msg {
    fn from(s: String) -> Self {
        Self::from(s.into_bytes())
    }
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.content {
            Content::Inline { .. } => "inline",
            Content::Shared(_) => "shared",
            Content::External(_) => "external",
            Content::Delimiter => "delimiter",
        };
        f.debug_struct("Msg")
            .field("kind", &kind)
            .field("len", &self.size())
            .field("more", &self.has_more())
            .finish()
    }
}

impl PartialEq for Msg {
    fn eq(&self, other: &Self) -> bool {
        self.is_delimiter() == other.is_delimiter()
            && self.flags == other.flags
            && self.data() == other.data()
    }
}

impl Eq for Msg {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn small_payload_is_inline() {
        let msg = Msg::copy_from_slice(b"hello");
        assert_eq!(msg.data(), b"hello");
        assert_eq!(msg.size(), 5);
        assert!(matches!(msg.content, Content::Inline { .. }));
    }

    #[test]
    fn inline_boundary() {
        let payload = vec![0xAB; INLINE_CAPACITY];
        let msg = Msg::copy_from_slice(&payload);
        assert!(matches!(msg.content, Content::Inline { .. }));

        let payload = vec![0xAB; INLINE_CAPACITY + 1];
        let msg = Msg::copy_from_slice(&payload);
        assert!(matches!(msg.content, Content::Shared(_)));
        assert_eq!(msg.data(), &payload[..]);
    }

    #[test]
    fn shared_clone_points_at_same_buffer() {
        let bytes = Bytes::from(vec![7u8; 1024]);
        let msg = Msg::from(bytes.clone());
        let copy = msg.clone();
        assert_eq!(copy.data().as_ptr(), msg.data().as_ptr());
        assert_eq!(copy.data(), &vec![7u8; 1024][..]);
        drop(bytes);
    }

    #[test]
    fn more_flag_round_trip() {
        let mut msg = Msg::from("part");
        assert!(!msg.has_more());
        msg.set_more(true);
        assert!(msg.has_more());
        assert_eq!(msg.flags(), MORE);
        msg.set_more(false);
        assert!(!msg.has_more());
    }

    #[test]
    fn delimiter_has_no_payload() {
        let msg = Msg::delimiter();
        assert!(msg.is_delimiter());
        assert!(msg.is_empty());
        assert_eq!(msg.data(), b"");
        let copy = msg.clone();
        assert!(copy.is_delimiter());
    }

    #[test]
    fn external_release_runs_once_after_last_clone() {
        static RELEASED: AtomicUsize = AtomicUsize::new(0);
        let buffer = vec![1u8, 2, 3, 4];
        let msg = Msg::external(
            buffer,
            Some(Box::new(|| {
                RELEASED.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert_eq!(msg.data(), &[1, 2, 3, 4]);

        let copy = msg.clone();
        drop(msg);
        assert_eq!(RELEASED.load(Ordering::SeqCst), 0);
        drop(copy);
        assert_eq!(RELEASED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn equality_ignores_storage_mode() {
        let inline = Msg::copy_from_slice(b"same");
        let shared = Msg::from(Bytes::from_static(b"same"));
        assert_eq!(inline, shared);
        assert_ne!(inline, Msg::delimiter());
    }
}
