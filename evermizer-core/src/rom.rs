use thiserror::Error;

/// A byte range that does not fit inside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("range 0x{addr:06X}+0x{len:X} lies outside the 0x{size:06X}-byte image")]
pub struct OutOfBounds {
    pub addr: usize,
    pub len: usize,
    pub size: usize,
}

/// Fixed-size game image.
///
/// Every mutation in the pipeline goes through the bounds-checked methods
/// below; the image can never grow or shrink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rom {
    data: Vec<u8>,
}

impl Rom {
    pub fn new(data: Vec<u8>) -> Self {
        Rom { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn check_range(&self, addr: usize, len: usize) -> Result<(), OutOfBounds> {
        match addr.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(OutOfBounds {
                addr,
                len,
                size: self.data.len(),
            }),
        }
    }

    pub fn read_n(&self, addr: usize, n: usize) -> Result<&[u8], OutOfBounds> {
        self.check_range(addr, n)?;
        Ok(&self.data[addr..addr + n])
    }

    pub fn read_u16(&self, addr: usize) -> Result<u16, OutOfBounds> {
        let b = self.read_n(addr, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn write_n(&mut self, addr: usize, data: &[u8]) -> Result<(), OutOfBounds> {
        self.check_range(addr, data.len())?;
        self.data[addr..addr + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn write_u16(&mut self, addr: usize, value: u16) -> Result<(), OutOfBounds> {
        self.write_n(addr, &value.to_le_bytes())
    }

    pub fn fill(&mut self, addr: usize, len: usize, value: u8) -> Result<(), OutOfBounds> {
        self.check_range(addr, len)?;
        self.data[addr..addr + len].fill(value);
        Ok(())
    }

    /// Copies `len` bytes inside the image. Overlapping ranges behave like
    /// `memmove`.
    pub fn copy_within(&mut self, from: usize, to: usize, len: usize) -> Result<(), OutOfBounds> {
        self.check_range(from, len)?;
        self.check_range(to, len)?;
        self.data.copy_within(from..from + len, to);
        Ok(())
    }
}
