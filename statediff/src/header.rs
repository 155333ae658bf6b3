use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Fixed diff header size on the wire.
pub const HEADER_BYTES: usize = 48;

/// `window_size` value marking a global-scope diff: references may chain
/// through every snapshot back to the baseline. Local-scope diffs (full,
/// basic) write 0.
pub const GLOBAL_WINDOW: u32 = u32::MAX;

/// The fixed little-endian header that opens every diff.
///
/// Layout, all fields little-endian:
///
/// ```text
/// offset  0  ref_id           u32
/// offset  4  chkpt_id         u32
/// offset  8  datalen          u64
/// offset 16  chunk_size       u32
/// offset 20  window_size      u32
/// offset 24  num_prior_chkpts u32
/// offset 28  distinct_size    u32
/// offset 32  curr_repeat_size u32
/// offset 36  prev_repeat_size u32
/// offset 40  reserved         u64
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffHeader {
    pub ref_id: u32,
    pub chkpt_id: u32,
    pub datalen: u64,
    pub chunk_size: u32,
    pub window_size: u32,
    pub num_prior_chkpts: u32,
    pub distinct_size: u32,
    pub curr_repeat_size: u32,
    pub prev_repeat_size: u32,
}

impl DiffHeader {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let mut buf = [0u8; HEADER_BYTES];
        LittleEndian::write_u32(&mut buf[0..4], self.ref_id);
        LittleEndian::write_u32(&mut buf[4..8], self.chkpt_id);
        LittleEndian::write_u64(&mut buf[8..16], self.datalen);
        LittleEndian::write_u32(&mut buf[16..20], self.chunk_size);
        LittleEndian::write_u32(&mut buf[20..24], self.window_size);
        LittleEndian::write_u32(&mut buf[24..28], self.num_prior_chkpts);
        LittleEndian::write_u32(&mut buf[28..32], self.distinct_size);
        LittleEndian::write_u32(&mut buf[32..36], self.curr_repeat_size);
        LittleEndian::write_u32(&mut buf[36..40], self.prev_repeat_size);
        // bytes 40..48 reserved, written as zero
        out.extend_from_slice(&buf);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_BYTES {
            return Err(Error::Format(format!(
                "diff of {} bytes is shorter than the {} byte header",
                buf.len(),
                HEADER_BYTES
            )));
        }
        let header = DiffHeader {
            ref_id: LittleEndian::read_u32(&buf[0..4]),
            chkpt_id: LittleEndian::read_u32(&buf[4..8]),
            datalen: LittleEndian::read_u64(&buf[8..16]),
            chunk_size: LittleEndian::read_u32(&buf[16..20]),
            window_size: LittleEndian::read_u32(&buf[20..24]),
            num_prior_chkpts: LittleEndian::read_u32(&buf[24..28]),
            distinct_size: LittleEndian::read_u32(&buf[28..32]),
            curr_repeat_size: LittleEndian::read_u32(&buf[32..36]),
            prev_repeat_size: LittleEndian::read_u32(&buf[36..40]),
        };
        if header.chunk_size == 0 && header.datalen > 0 {
            return Err(Error::Format("zero chunk size in header".into()));
        }
        if header.ref_id > header.chkpt_id {
            return Err(Error::Format(format!(
                "ref id {} is newer than checkpoint id {}",
                header.ref_id, header.chkpt_id
            )));
        }
        Ok(header)
    }

    /// Total repeat-table entry count.
    pub fn num_repeats(&self) -> u32 {
        self.curr_repeat_size + self.prev_repeat_size
    }

    /// Whether this diff is its own baseline.
    pub fn is_baseline(&self) -> bool {
        self.ref_id == self.chkpt_id
    }

    /// Byte offset of the distinct table.
    pub fn distinct_offset(&self) -> usize {
        HEADER_BYTES
    }

    /// Byte offset of the prior-checkpoint index.
    pub fn prior_offset(&self) -> usize {
        self.distinct_offset() + self.distinct_size as usize * 4
    }

    /// Byte offset of the repeat table.
    pub fn repeats_offset(&self) -> usize {
        self.prior_offset() + self.num_prior_chkpts as usize * 8
    }

    /// Byte offset of the data payload.
    pub fn payload_offset(&self) -> usize {
        self.repeats_offset() + self.num_repeats() as usize * 8
    }
}

/// Append one little-endian u32 to a staged diff.
pub(crate) fn push_u32(out: &mut Vec<u8>, value: u32) {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, value);
    out.extend_from_slice(&buf);
}

/// Read the `index`-th little-endian u32 of a table slice.
pub(crate) fn table_u32(table: &[u8], index: usize) -> u32 {
    LittleEndian::read_u32(&table[index * 4..index * 4 + 4])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DiffHeader {
        DiffHeader {
            ref_id: 0,
            chkpt_id: 3,
            datalen: 257,
            chunk_size: 16,
            window_size: GLOBAL_WINDOW,
            num_prior_chkpts: 2,
            distinct_size: 4,
            curr_repeat_size: 1,
            prev_repeat_size: 2,
        }
    }

    #[test]
    fn test_encode_layout() {
        let mut buf = Vec::new();
        sample().encode_into(&mut buf);
        assert_eq!(buf.len(), HEADER_BYTES);
        assert_eq!(&buf[0..4], &[0, 0, 0, 0]);
        assert_eq!(&buf[4..8], &[3, 0, 0, 0]);
        assert_eq!(&buf[8..16], &[1, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&buf[16..20], &[16, 0, 0, 0]);
        assert_eq!(&buf[20..24], &[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(&buf[24..28], &[2, 0, 0, 0]);
        assert_eq!(&buf[28..32], &[4, 0, 0, 0]);
        assert_eq!(&buf[32..36], &[1, 0, 0, 0]);
        assert_eq!(&buf[36..40], &[2, 0, 0, 0]);
        assert_eq!(&buf[40..48], &[0; 8]);
    }

    #[test]
    fn test_roundtrip() {
        let mut buf = Vec::new();
        sample().encode_into(&mut buf);
        assert_eq!(DiffHeader::decode(&buf).expect("decode"), sample());
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(DiffHeader::decode(&[0u8; 40]).is_err());
    }

    #[test]
    fn test_section_offsets() {
        let header = sample();
        assert_eq!(header.distinct_offset(), 48);
        assert_eq!(header.prior_offset(), 48 + 16);
        assert_eq!(header.repeats_offset(), 48 + 16 + 16);
        assert_eq!(header.payload_offset(), 48 + 16 + 16 + 24);
    }

    #[test]
    fn test_ref_newer_than_chkpt_rejected() {
        let mut buf = Vec::new();
        DiffHeader {
            ref_id: 4,
            chkpt_id: 3,
            ..sample()
        }
        .encode_into(&mut buf);
        assert!(DiffHeader::decode(&buf).is_err());
    }
}
