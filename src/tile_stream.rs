//! Per-tile byte source bridging the fetch loop and the demuxer.
//!
//! Two byte slots per tile; exactly one is active (being read). The
//! scheduler appends whole segments to the inactive slot, the decoder
//! reads the active one and blocks across segment boundaries until a
//! swap is possible. `swapped_size` keeps absolute byte offsets valid
//! across swaps.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::mpd::Srd;

/// `seek` whence values, matching the demuxer-facing C ABI.
pub const SEEK_SET: i32 = 0;
pub const SEEK_CUR: i32 = 1;
pub const SEEK_END: i32 = 2;
/// Sentinel whence: report the total size observed so far.
pub const SEEK_TOTAL_SIZE: i32 = 0x10000;

#[derive(Debug, Default)]
struct Slot {
    data: Vec<u8>,
    pos: usize,
}

impl Slot {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.remaining().min(dst.len());
        dst[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        n
    }
}

#[derive(Debug, Default)]
struct State {
    slots: [Slot; 2],
    active: usize,
    swap_ready: bool,
    done: bool,
    /// Bytes retired from earlier slots; monotone.
    swapped_size: u64,
    /// `(segment_start_time_s, quality)` in increasing time order.
    qualities: Vec<(f64, usize)>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

/// Reliable byte source for one tile: one writer (scheduler), one reader
/// (decoder thread). Cloning shares the underlying stream.
#[derive(Debug, Clone)]
pub struct TileStreamBuffer {
    srd: Srd,
    shared: Arc<Shared>,
}

impl TileStreamBuffer {
    pub fn new(srd: Srd) -> Self {
        Self {
            srd,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn srd(&self) -> Srd {
        self.srd
    }

    /// Prime the active slot with the initialization segment followed by
    /// the first media segment.
    pub fn init(&self, init_segment: &[u8], first_segment: &[u8]) {
        let mut state = self.shared.state.lock();
        let active = state.active;
        let slot = &mut state.slots[active];
        slot.data.clear();
        slot.data.reserve(init_segment.len() + first_segment.len());
        slot.data.extend_from_slice(init_segment);
        slot.data.extend_from_slice(first_segment);
        slot.pos = 0;
    }

    /// Append a segment to the inactive slot and wake the reader. The
    /// final segment also marks the stream done.
    pub fn append(&self, segment: &[u8], is_last: bool) {
        let mut state = self.shared.state.lock();
        let inactive = 1 - state.active;
        state.slots[inactive].data.extend_from_slice(segment);
        state.swap_ready = true;
        if is_last {
            state.done = true;
        }
        self.shared.cv.notify_all();
    }

    /// Mark the stream done with no further data (shutdown, or a tile
    /// whose fetch failed twice). Cascades to EOF in the decoder.
    pub fn mark_done(&self) {
        let mut state = self.shared.state.lock();
        state.done = true;
        self.shared.cv.notify_all();
    }

    /// Read from the active slot. At EOF of the active slot, block until
    /// a swap is possible and continue in the new active slot. Returns 0
    /// only when the stream is done and drained.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }
        let mut state = self.shared.state.lock();
        loop {
            let active = state.active;
            let n = state.slots[active].read(dst);
            if n > 0 {
                return n;
            }

            while !state.swap_ready && !state.done {
                self.shared.cv.wait(&mut state);
            }
            if !state.swap_ready {
                return 0; // done, nothing left to swap in
            }
            state.swap_ready = false;

            let inactive = 1 - state.active;
            if state.slots[inactive].remaining() == 0 {
                return 0;
            }

            // retire the drained slot and flip
            let retired = state.active;
            state.swapped_size += state.slots[retired].data.len() as u64;
            state.slots[retired] = Slot::default();
            state.active = inactive;
        }
    }

    /// Translate an absolute offset into the active slot (by subtracting
    /// `swapped_size`) and reposition. The sentinel whence
    /// [`SEEK_TOTAL_SIZE`] reports `active.size + swapped_size` instead.
    /// Returns the resulting absolute offset.
    pub fn seek(&self, offset: i64, whence: i32) -> i64 {
        let mut state = self.shared.state.lock();
        let active = state.active;
        let len = state.slots[active].data.len() as i64;
        let swapped = state.swapped_size as i64;

        if whence == SEEK_TOTAL_SIZE {
            return len + swapped;
        }

        let target = match whence {
            SEEK_SET => offset - swapped,
            SEEK_CUR => state.slots[active].pos as i64 + offset,
            SEEK_END => len + offset,
            _ => return -1,
        };
        let pos = target.clamp(0, len);
        state.slots[active].pos = pos as usize;
        pos + swapped
    }

    /// Total bytes observed so far across all slots.
    pub fn total_size(&self) -> u64 {
        let state = self.shared.state.lock();
        state.slots[state.active].data.len() as u64 + state.swapped_size
    }

    /// Record the quality a segment was fetched in, keyed by its start
    /// time. Writers call this before [`Self::append`].
    pub fn record_quality(&self, start_time_s: f64, quality: usize) {
        let mut state = self.shared.state.lock();
        state.qualities.push((start_time_s, quality));
    }

    /// Quality of the segment covering `time_s` (the last record whose
    /// start time is at or before it).
    pub fn quality_at(&self, time_s: f64) -> usize {
        let state = self.shared.state.lock();
        let qualities = &state.qualities;
        if qualities.is_empty() {
            return 0;
        }
        let idx = qualities.partition_point(|(t, _)| *t <= time_s);
        qualities[idx.saturating_sub(1)].1
    }
}

impl std::io::Read for TileStreamBuffer {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(TileStreamBuffer::read(self, buf))
    }
}

impl std::io::Seek for TileStreamBuffer {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        let result = match pos {
            std::io::SeekFrom::Start(offset) => {
                TileStreamBuffer::seek(self, offset as i64, SEEK_SET)
            }
            std::io::SeekFrom::Current(offset) => TileStreamBuffer::seek(self, offset, SEEK_CUR),
            std::io::SeekFrom::End(offset) => TileStreamBuffer::seek(self, offset, SEEK_END),
        };
        if result < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek out of range",
            ));
        }
        Ok(result as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn buffer() -> TileStreamBuffer {
        TileStreamBuffer::new(Srd::default())
    }

    fn read_exact_len(buf: &TileStreamBuffer, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut read = 0;
        while read < len {
            let n = buf.read(&mut out[read..]);
            assert!(n > 0, "unexpected EOF at {read}/{len}");
            read += n;
        }
        out
    }

    #[test]
    fn test_init_concatenates() {
        let buf = buffer();
        buf.init(b"init", b"segment0");

        let data = read_exact_len(&buf, 12);
        assert_eq!(&data, b"initsegment0");
    }

    #[test]
    fn test_segment_handoff_across_swap() {
        // the decoder drains init+seg0, blocks, and wakes on append
        let buf = buffer();
        buf.init(b"init", b"seg0");

        let reader = {
            let buf = buf.clone();
            thread::spawn(move || {
                let first = read_exact_len(&buf, 8);
                assert_eq!(&first, b"initseg0");

                // this read blocks until the writer appends
                let second = read_exact_len(&buf, 4);
                assert_eq!(&second, b"seg1");

                let mut probe = [0u8; 16];
                assert_eq!(buf.read(&mut probe), 0, "done stream must report EOF");
            })
        };

        thread::sleep(Duration::from_millis(50));
        buf.append(b"seg1", true);
        reader.join().unwrap();
    }

    #[test]
    fn test_swapped_size_accounting() {
        let buf = buffer();
        buf.init(b"init", b"seg0"); // 8 bytes in the first slot
        buf.append(b"seg1!", false); // 5 bytes in the second

        let mut sink = [0u8; 64];
        assert_eq!(buf.read(&mut sink), 8);
        // crossing the boundary retires the first slot
        assert_eq!(buf.read(&mut sink), 5);

        let state = buf.shared.state.lock();
        assert_eq!(state.swapped_size, 8);
        assert_eq!(
            state.swapped_size + state.slots[state.active].data.len() as u64,
            13
        );
    }

    #[test]
    fn test_multiple_appends_accumulate_before_swap() {
        let buf = buffer();
        buf.init(b"a", b"b");
        buf.append(b"cc", false);
        buf.append(b"dd", true);

        let mut sink = [0u8; 64];
        assert_eq!(buf.read(&mut sink), 2); // "ab"
        assert_eq!(buf.read(&mut sink), 4); // "ccdd" arrived as one slot
        assert_eq!(&sink[..4], b"ccdd");
        assert_eq!(buf.read(&mut sink), 0);
    }

    #[test]
    fn test_seek_total_size_sentinel() {
        let buf = buffer();
        buf.init(b"0123", b"4567");
        assert_eq!(buf.seek(0, SEEK_TOTAL_SIZE), 8);

        // drain and swap in another segment
        let mut sink = [0u8; 8];
        assert_eq!(buf.read(&mut sink), 8);
        buf.append(b"89", false);
        assert_eq!(buf.read(&mut sink[..1]), 1);

        // total size covers retired bytes plus the active slot
        assert_eq!(buf.seek(0, SEEK_TOTAL_SIZE), 10);
        assert_eq!(buf.total_size(), 10);
    }

    #[test]
    fn test_seek_absolute_across_swap() {
        let buf = buffer();
        buf.init(b"0123", b"4567");
        let mut sink = [0u8; 8];
        assert_eq!(buf.read(&mut sink), 8);
        buf.append(b"abcdef", false);
        assert_eq!(buf.read(&mut sink[..1]), 1); // forces the swap

        // absolute offset 10 is "c": 8 retired + 2 into the active slot
        assert_eq!(buf.seek(10, SEEK_SET), 10);
        assert_eq!(buf.read(&mut sink[..1]), 1);
        assert_eq!(sink[0], b'c');
    }

    #[test]
    fn test_seek_cur_and_end() {
        let buf = buffer();
        buf.init(b"01234567", b"");

        assert_eq!(buf.seek(4, SEEK_SET), 4);
        assert_eq!(buf.seek(2, SEEK_CUR), 6);
        assert_eq!(buf.seek(-3, SEEK_END), 5);
        let mut sink = [0u8; 1];
        buf.read(&mut sink);
        assert_eq!(sink[0], b'5');
        assert_eq!(buf.seek(0, 99), -1);
    }

    #[test]
    fn test_mark_done_unblocks_reader() {
        let buf = buffer();
        buf.init(b"", b"");

        let reader = {
            let buf = buf.clone();
            thread::spawn(move || {
                let mut sink = [0u8; 4];
                buf.read(&mut sink)
            })
        };
        thread::sleep(Duration::from_millis(50));
        buf.mark_done();
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn test_quality_records() {
        let buf = buffer();
        buf.record_quality(0.0, 2);
        buf.record_quality(1.5, 0);
        buf.record_quality(3.0, 3);

        assert_eq!(buf.quality_at(0.0), 2);
        assert_eq!(buf.quality_at(1.0), 2);
        assert_eq!(buf.quality_at(1.5), 0);
        assert_eq!(buf.quality_at(2.9), 0);
        assert_eq!(buf.quality_at(100.0), 3);
        // before the first record clamps to it
        assert_eq!(buf.quality_at(-1.0), 2);
    }

    #[test]
    fn test_io_read_seek_impls() {
        use std::io::{Read, Seek, SeekFrom};

        let mut buf = buffer();
        buf.init(b"hello", b"world");
        buf.mark_done();

        let mut out = Vec::new();
        buf.clone().read_to_end(&mut out).unwrap();
        assert_eq!(&out, b"helloworld");

        assert_eq!(Seek::seek(&mut buf, SeekFrom::Start(5)).unwrap(), 5);
        let mut rest = Vec::new();
        buf.read_to_end(&mut rest).unwrap();
        assert_eq!(&rest, b"world");
    }
}
