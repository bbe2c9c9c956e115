// PACKET DESCRIPTOR POOL
//
// Bounded sets of packet descriptors over a shared receive buffer. The
// tap reader fills one buffer per wakeup and records each frame as an
// (offset, length) pair; the demultiplexer and protocol handlers pass
// descriptor ranges around instead of copying frame data. All storage
// is fixed-size: a full pool is flushed to the handlers and reused.
//
//   PacketDesc - offset and length of one frame in the shared buffer
//   Pool - fixed-capacity array of descriptors
//   Pool.add(buf_len, offset, len) -> bool - append with bounds checks
//   Pool.get<'a>(&'a [u8], idx) -> Option<&'a [u8]> - checked access
//   POOL_FRAMES - pool capacity, also the batch limit per tap read

pub const POOL_FRAMES: usize = 128;

#[derive(Clone, Copy, Default, Debug, PartialEq)]
pub struct PacketDesc {
    pub offset: u32,
    pub len: u16,
}

pub struct Pool {
    count: usize,
    desc: [PacketDesc; POOL_FRAMES],
}

impl Default for Pool {
    fn default() -> Pool { Pool::new() }
}

impl Pool {
    pub fn new() -> Pool {
        Pool { count: 0, desc: [PacketDesc::default(); POOL_FRAMES] }
    }

    pub fn len(&self) -> usize { self.count }

    pub fn is_empty(&self) -> bool { self.count == 0 }

    pub fn is_full(&self) -> bool { self.count == POOL_FRAMES }

    pub fn clear(&mut self) { self.count = 0; }

    // Append a descriptor. Rejects frames that do not lie entirely
    // within the buffer, and frames larger than a descriptor can hold.
    pub fn add(&mut self, buf_len: usize, offset: usize, len: usize) -> bool {
        if self.is_full() || len > u16::MAX as usize { return false; }
        if offset > buf_len || len > buf_len - offset { return false; }
        self.desc[self.count] = PacketDesc {
            offset: offset as u32,
            len: len as u16,
        };
        self.count += 1;
        true
    }

    pub fn desc(&self, idx: usize) -> Option<PacketDesc> {
        if idx < self.count { Some(self.desc[idx]) } else { None }
    }

    pub fn get<'a>(&self, buf: &'a [u8], idx: usize) -> Option<&'a [u8]> {
        let d = self.desc(idx)?;
        buf.get(d.offset as usize..d.offset as usize + d.len as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = PacketDesc> + '_ {
        self.desc[..self.count].iter().copied()
    }
}

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn add_get() {
        let buf = [0u8, 1, 2, 3, 4, 5, 6, 7];
        let mut pool = Pool::new();
        assert!(pool.add(buf.len(), 2, 3));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get(&buf, 0), Some(&buf[2..5]));
        assert_eq!(pool.get(&buf, 1), None);
    }

    #[test]
    fn bounds() {
        let buf = [0u8; 16];
        let mut pool = Pool::new();
        assert!(!pool.add(buf.len(), 8, 9));
        assert!(!pool.add(buf.len(), 17, 0));
        assert!(pool.add(buf.len(), 16, 0));
        assert!(pool.add(buf.len(), 0, 16));
    }

    #[test]
    fn capacity() {
        let buf = [0u8; 4096];
        let mut pool = Pool::new();
        for i in 0..POOL_FRAMES {
            assert!(pool.add(buf.len(), i, 1), "frame {}", i);
        }
        assert!(pool.is_full());
        assert!(!pool.add(buf.len(), 0, 1));
        pool.clear();
        assert!(pool.is_empty());
        assert!(pool.add(buf.len(), 0, 1));
    }
}
