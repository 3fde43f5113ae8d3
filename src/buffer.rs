//! ByteBuffer: growable network byte window with a reserved prepend area.
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |                   |     (CONTENT)    |                  |
//! +-------------------+------------------+------------------+
//! 0      <=      reader_index   <=   writer_index    <=   capacity
//! ```
//!
//! Integer accessors default to network byte order; the `*_with` variants take
//! an explicit [`byteorder::ByteOrder`].

use std::io::{self, Read};

use byteorder::{ByteOrder, NetworkEndian};
use thiserror::Error;

/// Bytes reserved in front of the readable region for cheap header prepends.
pub const CHEAP_PREPEND: usize = 8;
/// Initial writable size of a fresh buffer.
pub const INITIAL_SIZE: usize = 1024;

/// Minimum writable room guaranteed before each socket read.
const READ_RESERVE: usize = 16 * 1024;

const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("need {needed} readable bytes, only {available} available")]
    Underflow { needed: usize, available: usize },

    #[error("cannot prepend {needed} bytes, only {available} prependable")]
    PrependOverflow { needed: usize, available: usize },

    #[error("position is outside the readable region")]
    OutOfRange,
}

#[derive(Debug, Clone)]
pub struct ByteBuffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Self {
        Self {
            buf: vec![0; CHEAP_PREPEND + initial],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    pub fn writer_index(&self) -> usize {
        self.writer_index
    }

    /// Size of the backing storage, prepend area included.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn internal_capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// The readable region. Never mutates the buffer.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    pub fn swap(&mut self, other: &mut ByteBuffer) {
        std::mem::swap(self, other);
    }

    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(CRLF.len()).position(|w| w == CRLF)
    }

    pub fn find_eol(&self) -> Option<usize> {
        self.peek().iter().position(|&b| b == b'\n')
    }

    /// Advances the reader cursor by `len` bytes.
    pub fn retrieve(&mut self, len: usize) -> Result<(), BufferError> {
        let available = self.readable_bytes();
        if len > available {
            return Err(BufferError::Underflow {
                needed: len,
                available,
            });
        }
        if len < available {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
        Ok(())
    }

    /// Consumes everything before `pos`, an offset into [`peek`](Self::peek).
    pub fn retrieve_until(&mut self, pos: usize) -> Result<(), BufferError> {
        if pos > self.readable_bytes() {
            return Err(BufferError::OutOfRange);
        }
        self.retrieve(pos)
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    pub fn retrieve_as_bytes(&mut self, len: usize) -> Result<Vec<u8>, BufferError> {
        let available = self.readable_bytes();
        if len > available {
            return Err(BufferError::Underflow {
                needed: len,
                available,
            });
        }
        let out = self.peek()[..len].to_vec();
        self.retrieve(len)?;
        Ok(out)
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let out = self.peek().to_vec();
        self.retrieve_all();
        out
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        let start = self.writer_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Writable tail, for filling in place before [`has_written`](Self::has_written).
    pub fn begin_write(&mut self) -> &mut [u8] {
        let start = self.writer_index;
        &mut self.buf[start..]
    }

    pub fn has_written(&mut self, len: usize) -> Result<(), BufferError> {
        if len > self.writable_bytes() {
            return Err(BufferError::OutOfRange);
        }
        self.writer_index += len;
        Ok(())
    }

    /// Drops the last `len` readable bytes.
    pub fn unwrite(&mut self, len: usize) -> Result<(), BufferError> {
        let available = self.readable_bytes();
        if len > available {
            return Err(BufferError::Underflow {
                needed: len,
                available,
            });
        }
        self.writer_index -= len;
        Ok(())
    }

    /// Writes `data` into the reserved area in front of the readable region.
    pub fn prepend(&mut self, data: &[u8]) -> Result<(), BufferError> {
        let available = self.prependable_bytes();
        if data.len() > available {
            return Err(BufferError::PrependOverflow {
                needed: data.len(),
                available,
            });
        }
        self.reader_index -= data.len();
        let start = self.reader_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Reallocates to fit the readable bytes plus `reserve`.
    pub fn shrink(&mut self, reserve: usize) {
        let mut other = ByteBuffer::with_capacity(self.readable_bytes() + reserve);
        other.append(self.peek());
        self.swap(&mut other);
    }

    /// Reads once from `reader` into the writable region.
    ///
    /// Returns `Ok(0)` on end of stream.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        self.ensure_writable_bytes(READ_RESERVE);
        let n = reader.read(self.begin_write())?;
        self.writer_index += n;
        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }

    fn peek_array<const N: usize>(&self) -> Option<[u8; N]> {
        self.peek().get(..N).and_then(|s| s.try_into().ok())
    }
}

macro_rules! int_accessors {
    ($ty:ty, $size:expr, $b_read:ident, $b_write:ident,
     $append:ident, $append_with:ident,
     $peek:ident, $peek_with:ident,
     $read:ident, $read_with:ident,
     $prepend:ident, $prepend_with:ident) => {
        impl ByteBuffer {
            pub fn $append(&mut self, x: $ty) {
                self.$append_with::<NetworkEndian>(x)
            }

            pub fn $append_with<B: ByteOrder>(&mut self, x: $ty) {
                let mut raw = [0u8; $size];
                B::$b_write(&mut raw, x);
                self.append(&raw);
            }

            pub fn $peek(&self) -> Option<$ty> {
                self.$peek_with::<NetworkEndian>()
            }

            pub fn $peek_with<B: ByteOrder>(&self) -> Option<$ty> {
                self.peek_array::<$size>().map(|raw| B::$b_read(&raw))
            }

            pub fn $read(&mut self) -> Result<$ty, BufferError> {
                self.$read_with::<NetworkEndian>()
            }

            pub fn $read_with<B: ByteOrder>(&mut self) -> Result<$ty, BufferError> {
                let x = self.$peek_with::<B>().ok_or(BufferError::Underflow {
                    needed: $size,
                    available: self.readable_bytes(),
                })?;
                self.retrieve($size)?;
                Ok(x)
            }

            pub fn $prepend(&mut self, x: $ty) -> Result<(), BufferError> {
                self.$prepend_with::<NetworkEndian>(x)
            }

            pub fn $prepend_with<B: ByteOrder>(&mut self, x: $ty) -> Result<(), BufferError> {
                let mut raw = [0u8; $size];
                B::$b_write(&mut raw, x);
                self.prepend(&raw)
            }
        }
    };
}

int_accessors!(i16, 2, read_i16, write_i16,
    append_i16, append_i16_with, peek_i16, peek_i16_with,
    read_i16, read_i16_with, prepend_i16, prepend_i16_with);
int_accessors!(i32, 4, read_i32, write_i32,
    append_i32, append_i32_with, peek_i32, peek_i32_with,
    read_i32, read_i32_with, prepend_i32, prepend_i32_with);
int_accessors!(i64, 8, read_i64, write_i64,
    append_i64, append_i64_with, peek_i64, peek_i64_with,
    read_i64, read_i64_with, prepend_i64, prepend_i64_with);

impl ByteBuffer {
    pub fn append_i8(&mut self, x: i8) {
        self.append(&x.to_be_bytes());
    }

    pub fn peek_i8(&self) -> Option<i8> {
        self.peek_array::<1>().map(i8::from_be_bytes)
    }

    pub fn read_i8(&mut self) -> Result<i8, BufferError> {
        let x = self.peek_i8().ok_or(BufferError::Underflow {
            needed: 1,
            available: self.readable_bytes(),
        })?;
        self.retrieve(1)?;
        Ok(x)
    }

    pub fn prepend_i8(&mut self, x: i8) -> Result<(), BufferError> {
        self.prepend(&x.to_be_bytes())
    }
}
