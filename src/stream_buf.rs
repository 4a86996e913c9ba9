use crc32fast::Hasher;

/// Reassembly buffer for push-fed parsing.
///
/// Bytes arrive via [`append`](StreamBuf::append) in arbitrarily sized
/// pieces (down to one byte at a time) and are taken out the front with
/// [`consume`](StreamBuf::consume) once a parser has a complete item.
/// [`peek`](StreamBuf::peek) lets the parser look at a prefix and bail out
/// without copying when data is still incomplete.
///
/// Storage grows geometrically; space freed at the front is reclaimed by
/// compaction once the consumed prefix outweighs both a fixed floor and the
/// unread remainder.
///
/// An optional CRC32 hasher observes every *consumed* byte, which is how the
/// readers accumulate the data-section CRC without a second pass.
#[derive(Default)]
pub(crate) struct StreamBuf {
    data: Vec<u8>,
    start: usize,
    end: usize,
    pub(crate) hasher: Option<Hasher>,
}

const COMPACT_FLOOR: usize = 4096;

impl StreamBuf {
    pub fn new(track_crc: bool) -> Self {
        Self {
            hasher: track_crc.then(Hasher::new),
            ..Default::default()
        }
    }

    /// The number of unread bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn append(&mut self, bytes: &[u8]) {
        if self.start > COMPACT_FLOOR && self.start > self.len() {
            self.data.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        let needed = self.end + bytes.len();
        if self.data.len() < needed {
            // Grow by at least half to keep byte-at-a-time feeds linear.
            let target = needed.max(self.data.len() + self.data.len() / 2);
            self.data.resize(target, 0);
        }
        self.data[self.end..needed].copy_from_slice(bytes);
        self.end = needed;
    }

    /// A view of the first `n` unread bytes, or `None` if fewer are buffered.
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        if self.len() < n {
            return None;
        }
        Some(&self.data[self.start..self.start + n])
    }

    /// Marks the first `n` unread bytes as read and returns them.
    ///
    /// Panics if fewer than `n` bytes are buffered; gate with
    /// [`peek`](Self::peek) or [`len`](Self::len) first.
    pub fn consume(&mut self, n: usize) -> &[u8] {
        assert!(self.len() >= n, "consumed past the end of the buffer");
        let start = self.start;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&self.data[start..start + n]);
        }
        self.start += n;
        &self.data[start..start + n]
    }
}
