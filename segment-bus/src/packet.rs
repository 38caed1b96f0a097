use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u32);

impl PacketFlags {
    pub const KEY: PacketFlags = PacketFlags(0x0001);
    pub const CORRUPT: PacketFlags = PacketFlags(0x0002);
    pub const DISCARD: PacketFlags = PacketFlags(0x0004);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PacketFlags) {
        self.0 &= !other.0;
    }
}

/// Out-of-band data attached to a packet (libav packet side data).
#[derive(Debug, Clone, PartialEq)]
pub struct SideData {
    pub kind: i32,
    pub data: Bytes,
}

/// One unit of compressed media.
///
/// Packets are move-only: a source hands out `&Packet` for the duration of a
/// delivery callback and then reuses the same allocation for the next read.
/// Anything that must outlive the callback takes a [`Packet::copy`].
#[derive(Debug, PartialEq)]
pub struct Packet {
    pts: Option<i64>,
    dts: Option<i64>,
    duration: i64,
    position: i64,
    stream_index: usize,
    flags: PacketFlags,
    data: BytesMut,
    side_data: Vec<SideData>,
}

impl Default for Packet {
    fn default() -> Self {
        Self::empty()
    }
}

impl Packet {
    pub fn empty() -> Self {
        Self {
            pts: None,
            dts: None,
            duration: 0,
            position: -1,
            stream_index: 0,
            flags: PacketFlags::empty(),
            data: BytesMut::new(),
            side_data: Vec::new(),
        }
    }

    pub fn with_data(data: &[u8]) -> Self {
        let mut packet = Self::empty();
        packet.set_data(data);
        packet
    }

    /// Deep copy. The returned packet shares no memory with `self`.
    pub fn copy(&self) -> Self {
        Self {
            pts: self.pts,
            dts: self.dts,
            duration: self.duration,
            position: self.position,
            stream_index: self.stream_index,
            flags: self.flags,
            data: BytesMut::from(&self.data[..]),
            side_data: self
                .side_data
                .iter()
                .map(|side| SideData {
                    kind: side.kind,
                    data: Bytes::copy_from_slice(&side.data),
                })
                .collect(),
        }
    }

    /// Resets every field for reuse while keeping the payload allocation.
    pub fn clear(&mut self) {
        self.pts = None;
        self.dts = None;
        self.duration = 0;
        self.position = -1;
        self.stream_index = 0;
        self.flags = PacketFlags::empty();
        self.data.clear();
        self.side_data.clear();
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    pub fn set_pts(&mut self, pts: Option<i64>) {
        self.pts = pts;
    }

    pub fn dts(&self) -> Option<i64> {
        self.dts
    }

    pub fn set_dts(&mut self, dts: Option<i64>) {
        self.dts = dts;
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn set_duration(&mut self, duration: i64) {
        self.duration = duration;
    }

    /// Byte offset in the originating container, -1 when unknown.
    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn set_position(&mut self, position: i64) {
        self.position = position;
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub fn set_stream_index(&mut self, index: usize) {
        self.stream_index = index;
    }

    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: PacketFlags) {
        self.flags = flags;
    }

    pub fn is_key(&self) -> bool {
        self.flags.contains(PacketFlags::KEY)
    }

    pub fn set_key(&mut self, key: bool) {
        if key {
            self.flags.insert(PacketFlags::KEY);
        } else {
            self.flags.remove(PacketFlags::KEY);
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }

    /// Replaces the payload, reusing the existing allocation when it is large
    /// enough.
    pub fn set_data(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn side_data(&self) -> &[SideData] {
        &self.side_data
    }

    pub fn add_side_data(&mut self, kind: i32, data: Bytes) {
        self.side_data.push(SideData { kind, data });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_is_independent_of_recycled_original() {
        let mut working = Packet::with_data(b"first payload");
        working.set_pts(Some(10));
        working.set_dts(Some(9));
        working.set_key(true);
        working.add_side_data(3, Bytes::from_static(b"side"));

        let stored = working.copy();

        working.clear();
        working.set_data(b"second");
        working.set_pts(Some(20));

        assert_eq!(stored.data(), b"first payload");
        assert_eq!(stored.pts(), Some(10));
        assert_eq!(stored.dts(), Some(9));
        assert!(stored.is_key());
        assert_eq!(stored.side_data()[0].data.as_ref(), b"side");
        assert_eq!(working.data(), b"second");
        assert!(!working.is_key());
    }

    #[test]
    fn test_flags() {
        let mut packet = Packet::empty();
        assert!(!packet.is_key());
        packet.set_key(true);
        packet.flags.insert(PacketFlags::CORRUPT);
        assert!(packet.is_key());
        assert_eq!(packet.flags().bits(), 0x3);
        packet.set_key(false);
        assert_eq!(packet.flags(), PacketFlags::CORRUPT);
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut packet = Packet::with_data(&[0u8; 4096]);
        let capacity = packet.data_mut().capacity();
        packet.clear();
        assert_eq!(packet.size(), 0);
        assert_eq!(packet.position(), -1);
        assert!(packet.data_mut().capacity() >= capacity);
    }
}
