use canadensis_encoding::{
    DataType, Deserialize, DeserializeError, ReadCursor, Serialize, WriteCursor,
};
use heapless::Vec;

// Frame size minus the length prefix.
const CAPACITY: usize = 62;

/// A simple (de)serializable type for tests and examples
///
/// A variable-length byte string with a 16-bit length prefix, sized to fit a
/// single transport frame.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ByteArray {
    pub bytes: Vec<u8, CAPACITY>,
}

impl ByteArray {
    pub const CAPACITY: usize = CAPACITY;

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Vec::from_slice(bytes).ok().map(|bytes| Self { bytes })
    }
}

impl DataType for ByteArray {
    /// This type is sealed.
    const EXTENT_BYTES: Option<u32> = None;
}

impl Deserialize for ByteArray {
    fn deserialize(cursor: &mut ReadCursor<'_>) -> Result<Self, DeserializeError>
    where
        Self: Sized,
    {
        let length = usize::from(cursor.read_aligned_u16());
        if length <= Self::CAPACITY {
            let mut bytes = Vec::new();
            unwrap!(bytes.resize_default(length));
            cursor.read_bytes(&mut bytes);

            Ok(Self { bytes })
        } else {
            Err(DeserializeError::ArrayLength)
        }
    }
}

impl Serialize for ByteArray {
    fn size_bits(&self) -> usize {
        16 + self.bytes.len() * 8
    }

    fn serialize(&self, cursor: &mut WriteCursor<'_>) {
        cursor.write_aligned_u16(unwrap!(self.bytes.len().try_into()));
        cursor.write_aligned_bytes(&self.bytes);
    }
}
