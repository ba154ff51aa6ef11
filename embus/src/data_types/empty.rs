use canadensis_encoding::{
    DataType, Deserialize, DeserializeError, ReadCursor, Serialize, WriteCursor,
};

/// A zero-field request or response payload
///
/// Serializes to nothing; useful for services whose information content is the
/// call itself.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Empty {}

impl DataType for Empty {
    /// This type is sealed.
    const EXTENT_BYTES: Option<u32> = None;
}

impl Deserialize for Empty {
    fn deserialize(_cursor: &mut ReadCursor<'_>) -> Result<Self, DeserializeError>
    where
        Self: Sized,
    {
        Ok(Self {})
    }
}

impl Serialize for Empty {
    fn size_bits(&self) -> usize {
        0
    }

    fn serialize(&self, _cursor: &mut WriteCursor<'_>) {}
}
