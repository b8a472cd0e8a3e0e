//! Binary array container
//!
//! A flat little-endian file of named, typed n-dimensional arrays. The file
//! starts with the magic `AMRARRAY` and an array count, followed by one table
//! entry per array (name, dtype, dims, absolute data offset) and then the
//! data blocks in table order. Offsets are absolute so a descriptor can point
//! straight into the file.

use crate::IoError;
use amrsurf_core::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const MAGIC: &[u8; 8] = b"AMRARRAY";

/// Element type of an array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    I32,
    F64,
}

impl DType {
    fn code(self) -> u8 {
        match self {
            DType::I32 => 0,
            DType::F64 => 1,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DType::I32),
            1 => Some(DType::F64),
            _ => None,
        }
    }

    /// Bytes per element
    pub fn size(self) -> u64 {
        match self {
            DType::I32 => 4,
            DType::F64 => 8,
        }
    }

    /// XDMF `NumberType` and `Precision`
    pub fn xdmf_type(self) -> (&'static str, u64) {
        match self {
            DType::I32 => ("Int", 4),
            DType::F64 => ("Float", 8),
        }
    }
}

/// One row of the container table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayEntry {
    pub name: String,
    pub dtype: DType,
    pub dims: Vec<u64>,
    /// Absolute byte offset of the first element
    pub offset: u64,
}

impl ArrayEntry {
    /// Number of elements
    pub fn len(&self) -> u64 {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn byte_len(&self) -> u64 {
        self.len() * self.dtype.size()
    }
}

/// Array payload
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    I32(Vec<i32>),
    F64(Vec<f64>),
}

impl ArrayData {
    fn dtype(&self) -> DType {
        match self {
            ArrayData::I32(_) => DType::I32,
            ArrayData::F64(_) => DType::F64,
        }
    }

    fn len(&self) -> usize {
        match self {
            ArrayData::I32(v) => v.len(),
            ArrayData::F64(v) => v.len(),
        }
    }
}

/// Collects arrays and writes them as one container
#[derive(Debug, Clone, Default)]
pub struct ArrayContainer {
    arrays: Vec<(String, Vec<u64>, ArrayData)>,
}

impl ArrayContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an `i32` array with the given shape
    pub fn push_i32(&mut self, name: &str, dims: &[u64], data: Vec<i32>) -> Result<&mut Self> {
        self.push(name, dims, ArrayData::I32(data))
    }

    /// Add an `f64` array with the given shape
    pub fn push_f64(&mut self, name: &str, dims: &[u64], data: Vec<f64>) -> Result<&mut Self> {
        self.push(name, dims, ArrayData::F64(data))
    }

    fn push(&mut self, name: &str, dims: &[u64], data: ArrayData) -> Result<&mut Self> {
        if name.is_empty() || name.len() > u16::MAX as usize {
            return Err(Error::InvalidData(format!(
                "Array name must be 1 to {} bytes, got {}",
                u16::MAX,
                name.len()
            )));
        }
        if dims.len() > u8::MAX as usize {
            return Err(Error::InvalidData(format!(
                "Array '{}' has rank {}",
                name,
                dims.len()
            )));
        }
        if self.arrays.iter().any(|(existing, _, _)| existing == name) {
            return Err(Error::InvalidData(format!("Duplicate array name '{}'", name)));
        }
        let expected: u64 = dims.iter().product();
        if expected != data.len() as u64 {
            return Err(Error::InvalidData(format!(
                "Array '{}' has {} elements but shape {:?} needs {}",
                name,
                data.len(),
                dims,
                expected
            )));
        }
        self.arrays.push((name.to_string(), dims.to_vec(), data));
        Ok(self)
    }

    /// Table entries with final offsets, without writing anything
    pub fn entries(&self) -> Vec<ArrayEntry> {
        let header_len: u64 = MAGIC.len() as u64
            + 4
            + self
                .arrays
                .iter()
                .map(|(name, dims, _)| 2 + name.len() as u64 + 2 + 8 * dims.len() as u64 + 8)
                .sum::<u64>();

        let mut offset = header_len;
        self.arrays
            .iter()
            .map(|(name, dims, data)| {
                let entry = ArrayEntry {
                    name: name.clone(),
                    dtype: data.dtype(),
                    dims: dims.clone(),
                    offset,
                };
                offset += entry.byte_len();
                entry
            })
            .collect()
    }

    /// Serialize to any writer and return the table
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<Vec<ArrayEntry>> {
        let entries = self.entries();

        writer.write_all(MAGIC)?;
        writer.write_u32::<LittleEndian>(entries.len() as u32)?;
        for entry in &entries {
            writer.write_u16::<LittleEndian>(entry.name.len() as u16)?;
            writer.write_all(entry.name.as_bytes())?;
            writer.write_u8(entry.dtype.code())?;
            writer.write_u8(entry.dims.len() as u8)?;
            for &d in &entry.dims {
                writer.write_u64::<LittleEndian>(d)?;
            }
            writer.write_u64::<LittleEndian>(entry.offset)?;
        }

        for (_, _, data) in &self.arrays {
            match data {
                ArrayData::I32(values) => {
                    for &v in values {
                        writer.write_i32::<LittleEndian>(v)?;
                    }
                }
                ArrayData::F64(values) => {
                    for &v in values {
                        writer.write_f64::<LittleEndian>(v)?;
                    }
                }
            }
        }
        writer.flush()?;
        Ok(entries)
    }

    /// Write the container to `path` and return the table
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<Vec<ArrayEntry>> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        let entries = self.write_to(&mut writer)?;
        log::debug!(
            "Wrote {} arrays to {}",
            entries.len(),
            path.as_ref().display()
        );
        Ok(entries)
    }
}

/// A container read back into memory
#[derive(Debug, Clone)]
pub struct ContainerFile {
    pub entries: Vec<ArrayEntry>,
    data: Vec<ArrayData>,
}

impl ContainerFile {
    /// Table entry for `name`
    pub fn entry(&self, name: &str) -> Option<&ArrayEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    fn data(&self, name: &str) -> Result<&ArrayData> {
        self.entries
            .iter()
            .position(|e| e.name == name)
            .map(|i| &self.data[i])
            .ok_or_else(|| Error::InvalidData(format!("Container has no array '{}'", name)))
    }

    /// Elements of an `i32` array
    pub fn i32_array(&self, name: &str) -> Result<&[i32]> {
        match self.data(name)? {
            ArrayData::I32(values) => Ok(values),
            ArrayData::F64(_) => Err(Error::InvalidData(format!("Array '{}' is not i32", name))),
        }
    }

    /// Elements of an `f64` array
    pub fn f64_array(&self, name: &str) -> Result<&[f64]> {
        match self.data(name)? {
            ArrayData::F64(values) => Ok(values),
            ArrayData::I32(_) => Err(Error::InvalidData(format!("Array '{}' is not f64", name))),
        }
    }
}

/// Read a container from any reader
pub fn read_container_from<R: Read>(reader: &mut R, label: &str) -> Result<ContainerFile> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(IoError::parse(label, "missing AMRARRAY magic").into());
    }

    let count = reader.read_u32::<LittleEndian>()?;
    let mut entries = Vec::with_capacity(count as usize);
    let mut position = MAGIC.len() as u64 + 4;
    for _ in 0..count {
        let name_len = reader.read_u16::<LittleEndian>()? as usize;
        let mut name = vec![0u8; name_len];
        reader.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| IoError::parse(label, "array name is not UTF-8"))?;
        let code = reader.read_u8()?;
        let dtype = DType::from_code(code)
            .ok_or_else(|| IoError::parse(label, format!("unknown dtype {} for '{}'", code, name)))?;
        let rank = reader.read_u8()? as usize;
        let dims = (0..rank)
            .map(|_| reader.read_u64::<LittleEndian>())
            .collect::<std::io::Result<Vec<u64>>>()?;
        let offset = reader.read_u64::<LittleEndian>()?;
        position += 2 + name_len as u64 + 2 + 8 * rank as u64 + 8;
        entries.push(ArrayEntry {
            name,
            dtype,
            dims,
            offset,
        });
    }

    let mut data = Vec::with_capacity(entries.len());
    for entry in &entries {
        if entry.offset != position {
            return Err(IoError::parse(
                label,
                format!(
                    "array '{}' starts at {} but data is at {}",
                    entry.name, entry.offset, position
                ),
            )
            .into());
        }
        let n = entry.len() as usize;
        let values = match entry.dtype {
            DType::I32 => {
                let mut v = vec![0i32; n];
                reader.read_i32_into::<LittleEndian>(&mut v)?;
                ArrayData::I32(v)
            }
            DType::F64 => {
                let mut v = vec![0f64; n];
                reader.read_f64_into::<LittleEndian>(&mut v)?;
                ArrayData::F64(v)
            }
        };
        position += entry.byte_len();
        data.push(values);
    }

    Ok(ContainerFile { entries, data })
}

/// Read a container file
pub fn read_container<P: AsRef<Path>>(path: P) -> Result<ContainerFile> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::from(IoError::FileNotFound {
            path: path.display().to_string(),
        }),
        _ => Error::Io(e),
    })?;
    read_container_from(&mut BufReader::new(file), &path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> ArrayContainer {
        let mut container = ArrayContainer::new();
        container
            .push_i32("Conn", &[2, 3], vec![0, 1, 2, 2, 1, 3])
            .unwrap()
            .push_f64("Coord", &[4, 3], (0..12).map(|v| v as f64 * 0.5).collect())
            .unwrap()
            .push_f64("temp", &[4], vec![300.0, 310.0, 320.0, 330.0])
            .unwrap();
        container
    }

    #[test]
    fn test_offsets_follow_table() {
        let entries = sample().entries();
        // magic + count + three table rows
        let table = 8 + 4 + (2 + 4 + 2 + 16 + 8) + (2 + 5 + 2 + 16 + 8) + (2 + 4 + 2 + 8 + 8);
        assert_eq!(entries[0].offset, table);
        assert_eq!(entries[1].offset, table + 6 * 4);
        assert_eq!(entries[2].offset, table + 6 * 4 + 12 * 8);
    }

    #[test]
    fn test_bytes_at_offsets() {
        let mut buffer = Vec::new();
        let entries = sample().write_to(&mut buffer).unwrap();
        assert_eq!(&buffer[..8], MAGIC);

        let temp = &entries[2];
        let start = temp.offset as usize;
        let first = f64::from_le_bytes(buffer[start..start + 8].try_into().unwrap());
        assert_eq!(first, 300.0);
        assert_eq!(buffer.len() as u64, temp.offset + 4 * 8);

        let read = read_container_from(&mut Cursor::new(buffer), "memory").unwrap();
        assert_eq!(read.entries, entries);
        assert_eq!(read.i32_array("Conn").unwrap(), &[0, 1, 2, 2, 1, 3]);
        assert_eq!(read.f64_array("temp").unwrap()[3], 330.0);
        assert!(read.f64_array("Conn").is_err());
        assert!(read.entry("missing").is_none());
    }

    #[test]
    fn test_rejects_bad_arrays() {
        let mut container = ArrayContainer::new();
        assert!(container.push_f64("x", &[2, 3], vec![0.0; 5]).is_err());
        assert!(container.push_f64("", &[1], vec![0.0]).is_err());
        container.push_f64("x", &[1], vec![0.0]).unwrap();
        assert!(container.push_i32("x", &[1], vec![0]).is_err());
    }

    #[test]
    fn test_empty_arrays() {
        let mut container = ArrayContainer::new();
        container.push_i32("Conn", &[0, 3], Vec::new()).unwrap();
        container.push_f64("Coord", &[0, 3], Vec::new()).unwrap();
        let mut buffer = Vec::new();
        let entries = container.write_to(&mut buffer).unwrap();
        assert_eq!(entries[0].offset, entries[1].offset);
        let read = read_container_from(&mut Cursor::new(buffer), "memory").unwrap();
        assert!(read.i32_array("Conn").unwrap().is_empty());
    }

    #[test]
    fn test_bad_magic() {
        let err = read_container_from(&mut Cursor::new(b"NOTARRAY\0\0\0\0".to_vec()), "memory");
        assert!(matches!(err, Err(Error::InvalidData(_))));
    }
}
