use std::{
    convert::TryInto,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    mem::size_of,
    path::Path,
};

use crate::{error::DbError, types::DbResult};

/// A seekable read/write file with typed access through the
/// `Encodeable`/`Decodeable` traits. The write-ahead log lives in one
/// of these.
pub struct DbFile {
    file: File,
}

impl DbFile {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .open(file_path)
            .unwrap();

        Self { file }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) -> DbResult {
        match self.file.write_all(&obj.encode()) {
            Ok(_) => Ok(()),
            Err(e) => Err(DbError::new(&e.to_string())),
        }
    }

    pub fn read<T: Decodeable>(&mut self) -> Result<T, DbError> {
        Ok(T::decode_from(&mut self.file))
    }

    pub fn get_size(&self) -> Result<u64, DbError> {
        let metadata = self.file.metadata().or(Err(DbError::new("io error")))?;
        Ok(metadata.len())
    }

    pub fn get_current_position(&mut self) -> Result<u64, DbError> {
        self.file
            .seek(SeekFrom::Current(0))
            .or(Err(DbError::new("io error")))
    }

    pub fn set_len(&self, len: u64) -> DbResult {
        self.file.set_len(len).or(Err(DbError::new("io error")))?;
        Ok(())
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, DbError> {
        self.file.seek(pos).or(Err(DbError::new("io error")))
    }

    pub fn flush(&mut self) -> DbResult {
        self.file.flush().or(Err(DbError::new("io error")))?;
        self.file
            .sync_data()
            .or(Err(DbError::new("io error")))?;
        Ok(())
    }
}

impl Read for DbFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

pub fn read_into<T: Decodeable, R: std::io::Read>(reader: &mut R) -> T {
    T::decode_from(reader)
}

pub fn read_exact<R: std::io::Read>(reader: &mut R, bytes_count: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; bytes_count];
    reader
        .read_exact(&mut buffer)
        .unwrap_or_else(|_| panic!("io error, expect {} bytes", bytes_count));
    buffer
}

/// An append-only byte buffer used to assemble the body of a log
/// record before it hits the file.
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        self.buf.extend_from_slice(obj.encode().as_slice());
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }
}

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self;
}

/// # Format
///
/// - 1 byte (0 for false, 1 for true)
impl Encodeable for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Decodeable for bool {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        u8::decode_from(reader) == 1
    }
}

/// # Format
///
/// - 4 bytes: payload size
/// - n bytes: payload
impl Encodeable for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        // write size
        let len = self.len() as u32;
        buffer.extend_from_slice(&len.to_le_bytes());

        // write payload
        buffer.extend_from_slice(&self);

        buffer
    }
}

impl Decodeable for Vec<u8> {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        let size = u32::from_le_bytes(read_exact(reader, 4).try_into().unwrap());
        read_exact(reader, size as usize)
    }
}

macro_rules! impl_serialization {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }

            impl Decodeable for $t {
                fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
                    let bytes = read_exact(reader, size_of::<Self>());
                    Self::from_le_bytes(bytes.try_into().unwrap())
                }
            }
        )*
    }
}

impl_serialization!(for u8, u16, u32, u64, i8, i16, i32, i64);
