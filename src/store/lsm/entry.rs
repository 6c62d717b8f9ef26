/// A key with either a value or a tombstone.
///
/// A tombstone (`value == None`) is a logical delete: it shadows older values
/// of the same key in lower layers and is never returned to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    key: Vec<u8>,
    value: Option<Vec<u8>>,
}

impl Entry {
    pub fn new(key: impl Into<Vec<u8>>, value: Option<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::new(key, Some(value.into()))
    }

    pub fn tombstone(key: impl Into<Vec<u8>>) -> Self {
        Self::new(key, None)
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Bytes charged against the flush threshold: key plus value, tombstones
    /// count their key only.
    pub fn approximate_size(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, |v| v.len())
    }

    pub fn into_parts(self) -> (Vec<u8>, Option<Vec<u8>>) {
        (self.key, self.value)
    }
}
