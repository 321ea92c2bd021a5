// Binary wire format: sequential codec over a growable buffer, plus
// topic-addressed envelopes for routing.
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use bytes::Bytes;

mod envelope;

pub use envelope::Envelope;

/// Subscription count meaning "no limit on deliveries".
pub const UNLIMITED: u32 = u32::MAX;

/// Initial buffer capacity for a fresh message.
pub const START_CAPACITY: usize = 64;

const WORD: usize = size_of::<u64>();

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("read of {requested} bytes at offset {offset} exceeds written size {written}")]
    ReadPastEnd {
        offset: usize,
        requested: usize,
        written: usize,
    },
    #[error("incomplete frame")]
    Incomplete,
    #[error("frame too large")]
    FrameTooLarge,
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
}

/// Growable binary buffer with sequential read and write cursors.
///
/// Writes append at the write cursor and grow capacity on demand; reads
/// consume sequentially from the read cursor and fail once they would pass
/// the write cursor. All multi-byte values are big-endian on the wire.
///
/// ```
/// use murmur_wire::WireBuffer;
///
/// let mut buf = WireBuffer::new();
/// buf.write_u32(7);
/// buf.write_string("orders").expect("write");
/// assert_eq!(buf.read_u32().expect("read"), 7);
/// assert_eq!(buf.read_string().expect("read"), "orders");
/// ```
#[derive(Clone)]
pub struct WireBuffer {
    // Backing storage; `data.len()` is the capacity, the written prefix is
    // `data[..write]`.
    data: Vec<u8>,
    write: usize,
    read: usize,
}

macro_rules! primitive_codec {
    ($read:ident, $write:ident, $ty:ty) => {
        pub fn $read(&mut self) -> Result<$ty> {
            const LEN: usize = size_of::<$ty>();
            let end = self.check_read(LEN)?;
            let mut raw = [0u8; LEN];
            raw.copy_from_slice(&self.data[self.read..end]);
            self.read = end;
            Ok(<$ty>::from_be_bytes(raw))
        }

        pub fn $write(&mut self, value: $ty) {
            const LEN: usize = size_of::<$ty>();
            let end = self.ensure(LEN);
            self.data[self.write..end].copy_from_slice(&value.to_be_bytes());
            self.write = end;
        }
    };
}

impl WireBuffer {
    pub fn new() -> Self {
        Self {
            data: vec![0; START_CAPACITY],
            write: 0,
            read: 0,
        }
    }

    // Wrap already-encoded bytes; the write cursor sits at the end.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            write: bytes.len(),
            read: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.write
    }

    pub fn is_empty(&self) -> bool {
        self.write == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written so far but not yet read.
    pub fn remaining(&self) -> usize {
        self.write - self.read
    }

    /// True once the read cursor has consumed everything written.
    pub fn at_end(&self) -> bool {
        self.read == self.write
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.write]
    }

    pub fn into_bytes(mut self) -> Bytes {
        self.data.truncate(self.write);
        Bytes::from(self.data)
    }

    /// Rewind the read cursor to the start of the written data.
    pub fn reset_read(&mut self) {
        self.read = 0;
    }

    /// Reallocate to exactly the used size.
    pub fn trim(&mut self) {
        self.data.truncate(self.write);
        self.data.shrink_to_fit();
    }

    // Capacity at least doubles, or grows by the exact deficit if larger.
    fn grow(&mut self, deficit: usize) {
        let current = self.data.len();
        let increment = deficit.max(current);
        self.data.resize(current + increment, 0);
    }

    fn ensure(&mut self, additional: usize) -> usize {
        let end = self.write + additional;
        if end > self.data.len() {
            self.grow(end - self.data.len());
        }
        end
    }

    fn check_read(&self, len: usize) -> Result<usize> {
        let end = self.read.checked_add(len).ok_or(Error::FrameTooLarge)?;
        if end > self.write {
            return Err(Error::ReadPastEnd {
                offset: self.read,
                requested: len,
                written: self.write,
            });
        }
        Ok(end)
    }

    primitive_codec!(read_u8, write_u8, u8);
    primitive_codec!(read_i8, write_i8, i8);
    primitive_codec!(read_u16, write_u16, u16);
    primitive_codec!(read_i16, write_i16, i16);
    primitive_codec!(read_u32, write_u32, u32);
    primitive_codec!(read_i32, write_i32, i32);
    primitive_codec!(read_u64, write_u64, u64);
    primitive_codec!(read_i64, write_i64, i64);
    primitive_codec!(read_u128, write_u128, u128);
    primitive_codec!(read_i128, write_i128, i128);
    primitive_codec!(read_f32, write_f32, f32);
    primitive_codec!(read_f64, write_f64, f64);

    // Booleans take a full byte on the wire; any nonzero byte reads as true.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(if value { 0xff } else { 0 });
    }

    /// Fixed-width length prefix preceding variable-length payloads.
    pub fn read_length(&mut self) -> Result<u32> {
        self.read_u32()
    }

    pub fn write_length(&mut self, value: u32) {
        self.write_u32(value);
    }

    /// Read a raw byte range without a length prefix.
    pub fn read_raw(&mut self, len: usize) -> Result<Vec<u8>> {
        let end = self.check_read(len)?;
        let value = self.data[self.read..end].to_vec();
        self.read = end;
        Ok(value)
    }

    pub fn write_raw(&mut self, value: &[u8]) {
        let end = self.ensure(value.len());
        self.data[self.write..end].copy_from_slice(value);
        self.write = end;
    }

    /// Read a length-prefixed byte range.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_length()? as usize;
        self.read_raw(len)
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        let len = u32::try_from(value.len()).map_err(|_| Error::FrameTooLarge)?;
        self.write_length(len);
        self.write_raw(value);
        Ok(())
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let raw = self.read_bytes()?;
        String::from_utf8(raw).map_err(|_| Error::InvalidUtf8)
    }

    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Nullable values carry a boolean discriminator byte before the payload.
    pub fn read_option<T, F>(&mut self, f: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        if self.read_bool()? {
            Ok(Some(f(self)?))
        } else {
            Ok(None)
        }
    }

    pub fn write_option<T, F>(&mut self, value: Option<&T>, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self, &T) -> Result<()>,
    {
        match value {
            Some(inner) => {
                self.write_bool(true);
                f(self, inner)
            }
            None => {
                self.write_bool(false);
                Ok(())
            }
        }
    }

    /// Order-preserving sequence: length prefix plus per-element decode.
    pub fn read_seq<T, F>(&mut self, mut f: F) -> Result<Vec<T>>
    where
        F: FnMut(&mut Self) -> Result<T>,
    {
        let len = self.read_length()? as usize;
        // The declared length is untrusted; cap the pre-allocation by what
        // is actually left to read.
        let mut items = Vec::with_capacity(len.min(self.remaining()));
        for _ in 0..len {
            items.push(f(self)?);
        }
        Ok(items)
    }

    pub fn write_seq<T, F>(&mut self, items: &[T], mut f: F) -> Result<()>
    where
        F: FnMut(&mut Self, &T) -> Result<()>,
    {
        let len = u32::try_from(items.len()).map_err(|_| Error::FrameTooLarge)?;
        self.write_length(len);
        for item in items {
            f(self, item)?;
        }
        Ok(())
    }

    /// Sets round-trip membership; iteration order is not preserved.
    pub fn read_set<K, F>(&mut self, mut f: F) -> Result<HashSet<K>>
    where
        K: Eq + Hash,
        F: FnMut(&mut Self) -> Result<K>,
    {
        let len = self.read_length()? as usize;
        let mut set = HashSet::with_capacity(len.min(self.remaining()));
        for _ in 0..len {
            set.insert(f(self)?);
        }
        Ok(set)
    }

    pub fn write_set<K, F>(&mut self, set: &HashSet<K>, mut f: F) -> Result<()>
    where
        K: Eq + Hash,
        F: FnMut(&mut Self, &K) -> Result<()>,
    {
        let len = u32::try_from(set.len()).map_err(|_| Error::FrameTooLarge)?;
        self.write_length(len);
        for key in set {
            f(self, key)?;
        }
        Ok(())
    }

    /// Maps round-trip membership; iteration order is not preserved.
    pub fn read_map<K, V, F>(&mut self, mut f: F) -> Result<HashMap<K, V>>
    where
        K: Eq + Hash,
        F: FnMut(&mut Self) -> Result<(K, V)>,
    {
        let len = self.read_length()? as usize;
        let mut map = HashMap::with_capacity(len.min(self.remaining()));
        for _ in 0..len {
            let (key, value) = f(self)?;
            map.insert(key, value);
        }
        Ok(map)
    }

    pub fn write_map<K, V, F>(&mut self, map: &HashMap<K, V>, mut f: F) -> Result<()>
    where
        K: Eq + Hash,
        F: FnMut(&mut Self, &K, &V) -> Result<()>,
    {
        let len = u32::try_from(map.len()).map_err(|_| Error::FrameTooLarge)?;
        self.write_length(len);
        for (key, value) in map {
            f(self, key, value)?;
        }
        Ok(())
    }
}

impl Default for WireBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for WireBuffer {
    fn eq(&self, other: &Self) -> bool {
        bytes_equal(self.as_slice(), other.as_slice())
    }
}

impl Eq for WireBuffer {}

impl fmt::Debug for WireBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.write)?;
        for byte in self.as_slice() {
            write!(f, " {byte:02x}")?;
        }
        Ok(())
    }
}

/// Byte-exact comparison, word-at-a-time with a scalar tail.
pub fn bytes_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a_words = a.chunks_exact(WORD);
    let mut b_words = b.chunks_exact(WORD);
    for (aw, bw) in (&mut a_words).zip(&mut b_words) {
        let mut ar = [0u8; WORD];
        let mut br = [0u8; WORD];
        ar.copy_from_slice(aw);
        br.copy_from_slice(bw);
        if u64::from_ne_bytes(ar) != u64::from_ne_bytes(br) {
            return false;
        }
    }
    a_words.remainder() == b_words.remainder()
}

/// Copy `min(dst.len(), src.len())` bytes, word-at-a-time with a scalar tail.
pub fn copy_bytes(dst: &mut [u8], src: &[u8]) {
    let len = dst.len().min(src.len());
    let head = len - len % WORD;
    for (d, s) in dst[..head]
        .chunks_exact_mut(WORD)
        .zip(src[..head].chunks_exact(WORD))
    {
        let mut raw = [0u8; WORD];
        raw.copy_from_slice(s);
        d.copy_from_slice(&u64::from_ne_bytes(raw).to_ne_bytes());
    }
    dst[head..len].copy_from_slice(&src[head..len]);
}
