//! An owned, fixed-size block of bytes.

use crate::error::{Error, Result};
use std::{fmt, ops::Deref};

/// An owned block of bytes, used everywhere record and question data is carried.
///
/// The length always matches the allocation. A zero-length buffer owns no
/// allocation. Cloning produces an independent copy.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    /// Creates a zero-filled buffer of `length` bytes.
    pub fn empty(length: usize) -> Result<Self> {
        let mut data = Self::allocate(length)?;
        data.resize(length, 0);
        Ok(Self { data })
    }

    /// Creates a buffer holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut data = Self::allocate(bytes.len())?;
        data.extend_from_slice(bytes);
        Ok(Self { data })
    }

    /// Returns an independent copy of `self`.
    pub fn copy(&self) -> Result<Self> {
        Self::from_slice(&self.data)
    }

    /// Replaces the content with a copy of `bytes`.
    pub fn replace(&mut self, bytes: &[u8]) -> Result<()> {
        *self = Self::from_slice(bytes)?;
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Mutable access for the crate's own fill-in-place writers.
    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn allocate(length: usize) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        if length > 0 {
            data.try_reserve_exact(length).map_err(|e| {
                Error::GeneralFailure(format!("cannot allocate {} bytes: {}", length, e))
            })?;
        }
        Ok(data)
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer({} bytes: {:02x?})", self.data.len(), &self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::Buffer;
    use test_log::test;

    #[test]
    fn test_empty_is_zero_filled() {
        let buf = Buffer::empty(5).unwrap();
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.data(), &[0u8; 5]);
    }

    #[test]
    fn test_zero_length_owns_nothing() {
        let buf = Buffer::from_slice(&[]).unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.into_vec().capacity(), 0);
    }

    #[test]
    fn test_copy_is_independent() {
        let original = Buffer::from_slice(b"abc").unwrap();
        let mut copy = original.copy().unwrap();
        copy.data_mut()[0] = b'x';
        assert_eq!(original.data(), b"abc");
        assert_eq!(copy.data(), b"xbc");

        copy.replace(b"hello").unwrap();
        assert_eq!(copy.len(), 5);
        assert_eq!(original.len(), 3);
    }
}
