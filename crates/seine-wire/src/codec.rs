use crate::{Result, WireError};

/// Hard cap on a single opaque field. Anything larger is a malformed message,
/// not a request to allocate.
pub const MAX_OPAQUE: usize = 64 * 1024 * 1024;

fn pad4(n: usize) -> usize {
    (4 - (n % 4)) % 4
}

pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Opaque data: `u32` byte length, the bytes, then zero padding up to the
    /// next multiple of 4. Encoded size is always `4 + roundup4(len)`.
    pub fn write_opaque(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        for _ in 0..pad4(bytes.len()) {
            self.buf.push(0);
        }
    }

    /// Strings are opaque data holding UTF-8.
    pub fn write_string(&mut self, s: &str) {
        self.write_opaque(s.as_bytes());
    }
}

impl Default for WireWriter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn require(&self, n: usize) -> Result<()> {
        let end = self.pos.checked_add(n);
        match end {
            Some(end) if end <= self.buf.len() => Ok(()),
            _ => Err(WireError::Malformed(format!(
                "buffer underflow: need {n} bytes at {}, have {}",
                self.pos,
                self.buf.len()
            ))),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.require(n)?;
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_opaque(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        if len > MAX_OPAQUE {
            return Err(WireError::Malformed(format!(
                "opaque field of {len} bytes exceeds maximum {MAX_OPAQUE}"
            )));
        }
        // Length plus its padding must both be present before we copy.
        self.require(len + pad4(len))?;
        let bytes = self.take(len)?.to_vec();
        self.pos += pad4(len);
        Ok(bytes)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_opaque()?;
        String::from_utf8(bytes)
            .map_err(|e| WireError::Malformed(format!("invalid utf-8 string: {e}")))
    }

    /// Read a count field, rejecting values above `max` before any element is
    /// decoded. Oversized counts are malformed messages, not allocations.
    pub fn read_count(&mut self, max: usize, what: &str) -> Result<usize> {
        let count = self.read_u32()? as usize;
        if count > max {
            return Err(WireError::Malformed(format!(
                "{what} count {count} exceeds maximum {max}"
            )));
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_round_trips_and_pads_to_four_bytes() {
        for n in 0..=9usize {
            let data: Vec<u8> = (0..n as u8).collect();
            let mut w = WireWriter::new();
            w.write_opaque(&data);
            let encoded = w.into_vec();
            assert_eq!(encoded.len(), 4 + n.div_ceil(4) * 4, "n = {n}");

            let mut r = WireReader::new(&encoded);
            assert_eq!(r.read_opaque().unwrap(), data);
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn primitives_round_trip() {
        let mut w = WireWriter::new();
        w.write_i32(-7);
        w.write_u32(0xdead_beef);
        w.write_i64(i64::MIN);
        w.write_f64(2.5);
        w.write_string("objectid");

        let buf = w.into_vec();
        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_i32().unwrap(), -7);
        assert_eq!(r.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.read_i64().unwrap(), i64::MIN);
        assert_eq!(r.read_f64().unwrap(), 2.5);
        assert_eq!(r.read_string().unwrap(), "objectid");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn underflow_is_malformed() {
        let mut r = WireReader::new(&[0, 0, 0]);
        assert!(matches!(r.read_u32(), Err(WireError::Malformed(_))));
    }

    #[test]
    fn truncated_opaque_is_malformed() {
        let mut w = WireWriter::new();
        w.write_opaque(b"hello");
        let mut encoded = w.into_vec();
        encoded.truncate(7);

        let mut r = WireReader::new(&encoded);
        assert!(matches!(r.read_opaque(), Err(WireError::Malformed(_))));
    }

    #[test]
    fn oversized_count_is_rejected_before_reading_elements() {
        let mut w = WireWriter::new();
        w.write_u32(1_000_000);
        let buf = w.into_vec();

        let mut r = WireReader::new(&buf);
        let err = r.read_count(64, "filter").unwrap_err();
        assert!(err.to_string().contains("filter count"));
    }

    #[test]
    fn non_utf8_string_is_malformed() {
        let mut w = WireWriter::new();
        w.write_opaque(&[0xff, 0xfe]);
        let buf = w.into_vec();

        let mut r = WireReader::new(&buf);
        assert!(matches!(r.read_string(), Err(WireError::Malformed(_))));
    }
}
