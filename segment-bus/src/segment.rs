use uuid::Uuid;

use crate::codec::{CodecParameters, Rational};
use crate::packet::Packet;

/// Identity of one logical stream of one job. Stable for the lifetime of the
/// stream; the join key between segmentation and reassembly.
pub type JobId = Uuid;

/// An ordered, self-contained batch of packets for one stream.
///
/// Packets held by a segment are always deep copies; a segment never
/// references a buffer owned by a source.
#[derive(Debug, PartialEq)]
pub struct Segment {
    job_id: JobId,
    pts: Option<i64>,
    dts: Option<i64>,
    time_base: Rational,
    parameters: CodecParameters,
    packets: Vec<Packet>,
}

impl Segment {
    pub fn new(job_id: JobId, parameters: CodecParameters, time_base: Rational) -> Self {
        Self {
            job_id,
            pts: None,
            dts: None,
            time_base,
            parameters,
            packets: Vec::new(),
        }
    }

    pub(crate) fn from_parts(
        job_id: JobId,
        pts: Option<i64>,
        dts: Option<i64>,
        time_base: Rational,
        parameters: CodecParameters,
        packets: Vec<Packet>,
    ) -> Self {
        Self {
            job_id,
            pts,
            dts,
            time_base,
            parameters,
            packets,
        }
    }

    /// Appends a copy of `packet`. The first packet fixes the segment's
    /// pts/dts.
    pub fn append(&mut self, packet: &Packet) {
        self.push(packet.copy());
    }

    pub(crate) fn push(&mut self, packet: Packet) {
        if self.packets.is_empty() {
            self.pts = packet.pts();
            self.dts = packet.dts();
        }
        self.packets.push(packet);
    }

    /// Empty follow-up segment with the same identity, parameters and time base.
    pub fn next(&self) -> Self {
        Self::new(self.job_id, self.parameters.clone(), self.time_base)
    }

    /// Deep copy.
    pub fn copy(&self) -> Self {
        Self {
            job_id: self.job_id,
            pts: self.pts,
            dts: self.dts,
            time_base: self.time_base,
            parameters: self.parameters.clone(),
            packets: self.packets.iter().map(Packet::copy).collect(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn set_job_id(&mut self, job_id: JobId) {
        self.job_id = job_id;
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    pub fn dts(&self) -> Option<i64> {
        self.dts
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn parameters(&self) -> &CodecParameters {
        &self.parameters
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// True for empty segments too.
    pub fn starts_on_keyframe(&self) -> bool {
        self.packets.first().is_none_or(Packet::is_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(dts: i64, key: bool, payload: &[u8]) -> Packet {
        let mut packet = Packet::with_data(payload);
        packet.set_pts(Some(dts + 1));
        packet.set_dts(Some(dts));
        packet.set_key(key);
        packet
    }

    #[test]
    fn test_first_packet_fixes_timestamps() {
        let mut segment = Segment::new(
            Uuid::new_v4(),
            CodecParameters::video(27, 640, 360),
            Rational::new(1, 90000),
        );
        assert!(segment.is_empty());
        assert_eq!(segment.dts(), None);

        segment.append(&packet(3000, true, b"a"));
        segment.append(&packet(6000, false, b"b"));
        assert_eq!(segment.len(), 2);
        assert_eq!(segment.pts(), Some(3001));
        assert_eq!(segment.dts(), Some(3000));
        assert!(segment.starts_on_keyframe());
    }

    #[test]
    fn test_next_inherits_identity() {
        let job_id = Uuid::new_v4();
        let mut segment = Segment::new(
            job_id,
            CodecParameters::audio(86018, 44100, 2),
            Rational::new(1, 44100),
        );
        segment.append(&packet(0, false, b"x"));

        let next = segment.next();
        assert!(next.is_empty());
        assert_eq!(next.job_id(), job_id);
        assert_eq!(next.parameters(), segment.parameters());
        assert_eq!(next.time_base(), Rational::new(1, 44100));
        assert_eq!(next.dts(), None);
    }

    #[test]
    fn test_append_stores_independent_copy() {
        let mut working = packet(0, true, b"original");
        let mut segment = Segment::new(Uuid::nil(), CodecParameters::default(), Rational::MICROS);
        segment.append(&working);

        working.set_data(b"recycled");
        working.set_dts(Some(99));

        assert_eq!(segment.packets()[0].data(), b"original");
        assert_eq!(segment.packets()[0].dts(), Some(0));
    }

    #[test]
    fn test_copy_is_deep_and_equal() {
        let mut segment = Segment::new(Uuid::new_v4(), CodecParameters::default(), Rational::MICROS);
        segment.append(&packet(10, false, b"payload"));
        let copy = segment.copy();
        assert_eq!(copy, segment);
        assert!(!copy.starts_on_keyframe());
    }
}
