use std::io::{self, prelude::*};

use crc32fast::Hasher;

/// A [`Write`] adapter that tracks its absolute position and optionally runs
/// a CRC32 over everything written through it.
///
/// The writer needs both: record and index offsets come from the running
/// byte count (the sink itself may not be seekable), and the data-section and
/// summary CRCs are accumulated as bytes go out.
pub(crate) struct CountingCrcWriter<W> {
    inner: W,
    hasher: Option<Hasher>,
    count: u64,
}

impl<W: Write> CountingCrcWriter<W> {
    pub fn new(inner: W, track_crc: bool) -> Self {
        Self {
            inner,
            hasher: track_crc.then(Hasher::new),
            count: 0,
        }
    }

    /// Resumes writing mid-file: `position` is the sink's current absolute
    /// offset and `crc`, when given, the CRC32 of everything that should
    /// count as already hashed (the amender continues a data-section CRC
    /// from the value stored in the old DataEnd record).
    pub fn resume(inner: W, crc: Option<u32>, position: u64) -> Self {
        Self {
            inner,
            hasher: crc.map(Hasher::new_with_initial),
            count: position,
        }
    }

    /// The absolute offset the next byte will be written at.
    pub fn position(&self) -> u64 {
        self.count
    }

    /// The CRC32 of the bytes hashed so far, without disturbing the
    /// accumulator. `None` if CRC tracking is off.
    pub fn current_crc(&self) -> Option<u32> {
        self.hasher.as_ref().map(|h| h.clone().finalize())
    }

    /// Restarts CRC accumulation from here (or stops it), leaving the
    /// position alone. Used at the summary-section boundary.
    pub fn restart_crc(&mut self, track_crc: bool) {
        self.hasher = track_crc.then(Hasher::new);
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingCrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = self.inner.write(buf)?;
        self.count += res as u64;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..res]);
        }
        Ok(res)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
