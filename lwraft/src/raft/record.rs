//! Length-prefixed records, the on-disk unit of log segments and the apply
//! journal: a `u64` little-endian body length followed by the body.

pub(crate) const LEN_BYTES: usize = 8;

/// Appends one record holding `body` to `buf`.
pub(crate) fn put(buf: &mut Vec<u8>, body: &[u8]) {
    buf.extend_from_slice(&(body.len() as u64).to_le_bytes());
    buf.extend_from_slice(body);
}

pub(crate) fn body_len(prefix: [u8; LEN_BYTES]) -> u64 {
    u64::from_le_bytes(prefix)
}

/// Iterates over the complete records at the front of a buffer. A torn
/// record at the end stops the iteration; `consumed` then tells where the
/// valid prefix ends.
pub(crate) struct Records<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Records<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Records { data, pos: 0 }
    }

    pub(crate) fn consumed(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let rest = &self.data[self.pos..];
        if rest.len() < LEN_BYTES {
            return None;
        }
        let mut prefix = [0u8; LEN_BYTES];
        prefix.copy_from_slice(&rest[..LEN_BYTES]);
        let len = usize::try_from(body_len(prefix)).ok()?;
        let end = LEN_BYTES.checked_add(len)?;
        if end > rest.len() {
            return None;
        }
        self.pos += end;
        Some(&rest[LEN_BYTES..end])
    }
}
