//! IPS patch parsing and application.
//!
//! Layout: `PATCH`, then records of `offset:u24be len:u16be payload`, then
//! `EOF`. A record with `len == 0` is a run: `count:u16be value:u8`.

use log::debug;

use crate::rom::Rom;
use crate::{EvermizerError, Result};

const HEADER: &[u8] = b"PATCH";
const FOOTER: &[u8] = b"EOF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpsPayload {
    Literal(Vec<u8>),
    Run { count: u16, value: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpsRecord {
    /// Position of the record header inside the patch stream.
    pub pos: usize,
    pub offset: usize,
    pub payload: IpsPayload,
}

impl IpsRecord {
    pub fn len(&self) -> usize {
        match &self.payload {
            IpsPayload::Literal(data) => data.len(),
            IpsPayload::Run { count, .. } => *count as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self, rom: &mut Rom) -> Result<()> {
        let res = match &self.payload {
            IpsPayload::Literal(data) => rom.write_n(self.offset, data),
            IpsPayload::Run { count, value } => rom.fill(self.offset, *count as usize, *value),
        };
        res.map_err(|source| EvermizerError::PatchRange {
            pos: self.pos,
            source,
        })
    }
}

struct IpsReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> IpsReader<'a> {
    fn new(data: &'a [u8], pos: usize) -> Self {
        IpsReader { data, pos }
    }

    fn read_n(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(EvermizerError::PatchParse {
                pos: self.pos,
                reason: format!("stream ends inside {what}"),
            });
        }
        let value = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(value)
    }

    fn read_u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.read_n(1, what)?[0])
    }

    fn read_u16(&mut self, what: &str) -> Result<u16> {
        let b = self.read_n(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpsPatch {
    records: Vec<IpsRecord>,
}

impl IpsPatch {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if !data.starts_with(HEADER) {
            return Err(EvermizerError::PatchFormat {
                pos: 0,
                reason: "missing PATCH header".to_string(),
            });
        }

        let mut reader = IpsReader::new(data, HEADER.len());
        let mut records = Vec::new();
        loop {
            let pos = reader.pos;
            let head = reader.read_n(3, "record offset (no EOF marker)")?;
            if head == FOOTER {
                break;
            }
            let offset = (head[0] as usize) << 16 | (head[1] as usize) << 8 | head[2] as usize;
            let len = reader.read_u16("record length")?;
            let payload = if len == 0 {
                let count = reader.read_u16("run length")?;
                let value = reader.read_u8("run value")?;
                if count == 0 {
                    return Err(EvermizerError::PatchFormat {
                        pos,
                        reason: "run record with zero length".to_string(),
                    });
                }
                IpsPayload::Run { count, value }
            } else {
                IpsPayload::Literal(reader.read_n(len as usize, "record payload")?.to_vec())
            };
            records.push(IpsRecord {
                pos,
                offset,
                payload,
            });
        }

        match data.len() - reader.pos {
            0 => {}
            3 => {
                return Err(EvermizerError::PatchFormat {
                    pos: reader.pos,
                    reason: "truncation extension would resize the image".to_string(),
                });
            }
            n => {
                return Err(EvermizerError::PatchParse {
                    pos: reader.pos,
                    reason: format!("{n} unexpected bytes after EOF marker"),
                });
            }
        }

        Ok(IpsPatch { records })
    }

    pub fn records(&self) -> &[IpsRecord] {
        &self.records
    }

    /// Applies every record in file order. All records are range-checked
    /// first, so a failing patch leaves `rom` untouched.
    ///
    /// Only defined for a single application to a stock image; applying the
    /// same patch again is allowed but is not guaranteed to be a no-op.
    pub fn apply(&self, rom: &mut Rom) -> Result<()> {
        for record in &self.records {
            rom.check_range(record.offset, record.len())
                .map_err(|source| EvermizerError::PatchRange {
                    pos: record.pos,
                    source,
                })?;
        }
        for record in &self.records {
            record.write(rom)?;
        }
        debug!("applied {} IPS records", self.records.len());
        Ok(())
    }
}

/// Parses `patch` and applies it to `rom`, returning the record count.
pub fn apply_ips(rom: &mut Rom, patch: &[u8]) -> Result<usize> {
    let patch = IpsPatch::parse(patch)?;
    patch.apply(rom)?;
    Ok(patch.records().len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literal(offset: usize, data: &[u8]) -> Vec<u8> {
        let mut out = offset.to_be_bytes()[5..8].to_vec();
        out.extend((data.len() as u16).to_be_bytes());
        out.extend(data);
        out
    }

    fn run(offset: usize, count: u16, value: u8) -> Vec<u8> {
        let mut out = offset.to_be_bytes()[5..8].to_vec();
        out.extend([0, 0]);
        out.extend(count.to_be_bytes());
        out.push(value);
        out
    }

    fn patch(records: &[Vec<u8>]) -> Vec<u8> {
        let mut out = b"PATCH".to_vec();
        for r in records {
            out.extend(r);
        }
        out.extend(b"EOF");
        out
    }

    #[test]
    fn single_record_on_64k_image() {
        let mut rom = Rom::new(vec![0; 0x10000]);
        let data = patch(&[literal(0x10, &[0xAA; 4])]);
        assert_eq!(apply_ips(&mut rom, &data).unwrap(), 1);

        assert_eq!(&rom.data()[0x10..0x14], &[0xAA; 4]);
        assert!(rom.data()[..0x10].iter().all(|&b| b == 0));
        assert!(rom.data()[0x14..].iter().all(|&b| b == 0));
        assert_eq!(rom.len(), 0x10000);
    }

    #[test]
    fn run_records_fill() {
        let mut rom = Rom::new(vec![0; 32]);
        apply_ips(&mut rom, &patch(&[run(4, 8, 0x5A)])).unwrap();
        assert_eq!(&rom.data()[4..12], &[0x5A; 8]);
        assert_eq!(rom.data()[12], 0);
    }

    #[test]
    fn later_records_overwrite_earlier_ones() {
        let mut rom = Rom::new(vec![0; 16]);
        let data = patch(&[run(0, 8, 0x11), literal(2, &[0x22, 0x33])]);
        apply_ips(&mut rom, &data).unwrap();
        assert_eq!(&rom.data()[..8], &[0x11, 0x11, 0x22, 0x33, 0x11, 0x11, 0x11, 0x11]);
    }

    #[test]
    fn missing_header_is_format_error() {
        let mut rom = Rom::new(vec![0; 16]);
        let err = apply_ips(&mut rom, b"PTCH\0\0\0\0\x01\xFFEOF").unwrap_err();
        assert!(matches!(err, EvermizerError::PatchFormat { pos: 0, .. }));
    }

    #[test]
    fn zero_length_run_is_format_error() {
        let err = IpsPatch::parse(&patch(&[run(0, 0, 0xFF)])).unwrap_err();
        assert!(matches!(err, EvermizerError::PatchFormat { pos: 5, .. }));
    }

    #[test]
    fn missing_eof_is_parse_error() {
        let mut data = b"PATCH".to_vec();
        data.extend(literal(0, &[1, 2]));
        let err = IpsPatch::parse(&data).unwrap_err();
        assert!(matches!(err, EvermizerError::PatchParse { .. }));
    }

    #[test]
    fn truncated_payload_is_parse_error() {
        let mut data = b"PATCH".to_vec();
        data.extend([0, 0, 0x10, 0, 4, 0xAA, 0xAA]);
        let err = IpsPatch::parse(&data).unwrap_err();
        assert!(matches!(err, EvermizerError::PatchParse { pos: 10, .. }));
    }

    #[test]
    fn truncation_extension_is_rejected() {
        let mut data = patch(&[literal(0, &[1])]);
        data.extend([0x00, 0x00, 0x08]);
        let err = IpsPatch::parse(&data).unwrap_err();
        assert!(matches!(err, EvermizerError::PatchFormat { .. }));
    }

    #[test]
    fn garbage_after_eof_is_parse_error() {
        let mut data = patch(&[]);
        data.push(0x00);
        let err = IpsPatch::parse(&data).unwrap_err();
        assert!(matches!(err, EvermizerError::PatchParse { .. }));
    }

    #[test]
    fn out_of_range_record_leaves_image_untouched() {
        let mut rom = Rom::new(vec![0; 0x100]);
        let data = patch(&[literal(0x00, &[0xAA]), literal(0xFE, &[1, 2, 3])]);
        let err = apply_ips(&mut rom, &data).unwrap_err();
        assert!(matches!(err, EvermizerError::PatchRange { pos: 11, .. }));
        assert!(rom.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn applying_twice_does_not_panic() {
        let mut rom = Rom::new(vec![0; 0x40]);
        let data = patch(&[run(0, 4, 0xEE), literal(8, &[1, 2, 3])]);
        apply_ips(&mut rom, &data).unwrap();
        apply_ips(&mut rom, &data).unwrap();
        assert_eq!(&rom.data()[8..11], &[1, 2, 3]);
    }
}
