//! GGUF weight container - memory-mapped parse of the quantized model file.
//!
//! The container is opened once and stays mapped for the model's lifetime.
//! Metadata pairs are only skipped during the initial parse; lookups re-scan
//! the metadata region on demand, which is cheap because the pair count is
//! known and lookups are rare.

use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use memmap2::Mmap;

/// "GGUF" in little-endian byte order.
pub const GGUF_MAGIC: u32 = 0x4647_5547;

/// The tensor-data section starts at the next multiple of this after the
/// tensor-info table.
pub const GGUF_ALIGNMENT: usize = 32;

const HEADER_SIZE: usize = 4 + 4 + 8 + 8;
const MAX_TENSOR_DIMS: usize = 4;

/// Tensor element types understood by the loader.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GgmlType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q2_K,
    Q3_K,
    Q4_K,
    Q5_K,
    Q6_K,
    I8,
    I16,
    I32,
}

impl GgmlType {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::F32,
            1 => Self::F16,
            2 => Self::Q4_0,
            3 => Self::Q4_1,
            6 => Self::Q5_0,
            7 => Self::Q5_1,
            8 => Self::Q8_0,
            9 => Self::Q8_1,
            10 => Self::Q2_K,
            11 => Self::Q3_K,
            12 => Self::Q4_K,
            13 => Self::Q5_K,
            14 => Self::Q6_K,
            24 => Self::I8,
            25 => Self::I16,
            26 => Self::I32,
            _ => return None,
        })
    }

    /// Bytes occupied by one block of this type.
    pub fn block_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
            Self::Q4_0 => 18,
            Self::Q4_1 => 20,
            Self::Q5_0 => 22,
            Self::Q5_1 => 24,
            Self::Q8_0 => 34,
            Self::Q8_1 => 40,
            Self::Q2_K => 84,
            Self::Q3_K => 110,
            Self::Q4_K => 144,
            Self::Q5_K => 176,
            Self::Q6_K => 210,
            Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 => 4,
        }
    }

    /// Elements encoded per block. 1 for plain types, 32 for the row-quantized
    /// Q*_0/Q*_1 encodings, 256 for the K-quant encodings.
    pub fn block_elems(self) -> usize {
        match self {
            Self::F32 | Self::F16 | Self::I8 | Self::I16 | Self::I32 => 1,
            Self::Q4_0 | Self::Q4_1 | Self::Q5_0 | Self::Q5_1 | Self::Q8_0 | Self::Q8_1 => 32,
            Self::Q2_K | Self::Q3_K | Self::Q4_K | Self::Q5_K | Self::Q6_K => 256,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "F32",
            Self::F16 => "F16",
            Self::Q4_0 => "Q4_0",
            Self::Q4_1 => "Q4_1",
            Self::Q5_0 => "Q5_0",
            Self::Q5_1 => "Q5_1",
            Self::Q8_0 => "Q8_0",
            Self::Q8_1 => "Q8_1",
            Self::Q2_K => "Q2_K",
            Self::Q3_K => "Q3_K",
            Self::Q4_K => "Q4_K",
            Self::Q5_K => "Q5_K",
            Self::Q6_K => "Q6_K",
            Self::I8 => "I8",
            Self::I16 => "I16",
            Self::I32 => "I32",
        }
    }
}

/// Metadata value-type tags. The set is closed; unknown tags fail the parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    Bool,
    String,
    Array,
    U64,
    I64,
    F64,
}

impl MetaType {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::U8,
            1 => Self::I8,
            2 => Self::U16,
            3 => Self::I16,
            4 => Self::U32,
            5 => Self::I32,
            6 => Self::F32,
            7 => Self::Bool,
            8 => Self::String,
            9 => Self::Array,
            10 => Self::U64,
            11 => Self::I64,
            12 => Self::F64,
            _ => return None,
        })
    }
}

/// One row of the tensor table.
#[derive(Clone, Debug)]
pub struct TensorInfo {
    pub name: String,
    pub n_dims: u32,
    pub dims: [u64; 4],
    pub dtype: GgmlType,
    /// Byte offset into the aligned data section.
    pub offset: u64,
    /// Derived: ceil(elements / block_elems) * block_bytes.
    pub byte_size: usize,
}

impl TensorInfo {
    pub fn num_elements(&self) -> u64 {
        self.dims.iter().product()
    }
}

fn tensor_byte_size(dims: &[u64; 4], dtype: GgmlType) -> usize {
    let n_elements: u64 = dims.iter().product();
    let block_elems = dtype.block_elems() as u64;
    let n_blocks = n_elements.div_ceil(block_elems);
    (n_blocks as usize) * dtype.block_bytes()
}

/// The parsed, memory-mapped container.
#[derive(Debug)]
pub struct GgufFile {
    mmap: Mmap,
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_count: u64,
    pub tensors: Vec<TensorInfo>,
    /// Byte offset of the first tensor byte (32-byte aligned).
    data_start: usize,
}

fn read_gguf_string(cur: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cur.read_u64::<LittleEndian>().context("truncated string length")?;
    let pos = cur.position() as usize;
    let data = *cur.get_ref();
    let end = pos
        .checked_add(len as usize)
        .filter(|&e| e <= data.len())
        .context("string runs past end of file")?;
    cur.set_position(end as u64);
    // Byte-fallback vocab entries occasionally carry non-UTF-8 bytes; keep
    // them rather than failing the whole parse.
    Ok(String::from_utf8_lossy(&data[pos..end]).into_owned())
}

/// Advance the cursor past one metadata value of the given type.
fn skip_meta_value(cur: &mut Cursor<&[u8]>, vtype: MetaType) -> Result<()> {
    let fixed = match vtype {
        MetaType::U8 | MetaType::I8 | MetaType::Bool => 1u64,
        MetaType::U16 | MetaType::I16 => 2,
        MetaType::U32 | MetaType::I32 | MetaType::F32 => 4,
        MetaType::U64 | MetaType::I64 | MetaType::F64 => 8,
        MetaType::String => {
            read_gguf_string(cur)?;
            return Ok(());
        }
        MetaType::Array => {
            let elem_tag = cur.read_u32::<LittleEndian>().context("truncated array type")?;
            let elem_type = MetaType::from_u32(elem_tag)
                .with_context(|| format!("unknown metadata array element type {elem_tag}"))?;
            let arr_len = cur.read_u64::<LittleEndian>().context("truncated array length")?;
            for _ in 0..arr_len {
                skip_meta_value(cur, elem_type)?;
            }
            return Ok(());
        }
    };
    let pos = cur.position() as usize;
    let end = pos
        .checked_add(fixed as usize)
        .filter(|&e| e <= cur.get_ref().len())
        .context("metadata value runs past end of file")?;
    cur.set_position(end as u64);
    Ok(())
}

impl GgufFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("cannot open {path:?}"))?;
        let mmap = unsafe { Mmap::map(&file) }.with_context(|| format!("mmap failed for {path:?}"))?;
        Self::parse(mmap)
    }

    fn parse(mmap: Mmap) -> Result<Self> {
        let data: &[u8] = &mmap;
        if data.len() < HEADER_SIZE {
            bail!("file too small to be GGUF ({} bytes)", data.len());
        }

        let mut cur = Cursor::new(data);
        let magic = cur.read_u32::<LittleEndian>()?;
        if magic != GGUF_MAGIC {
            bail!("invalid GGUF magic 0x{magic:08X} (expected 0x{GGUF_MAGIC:08X})");
        }
        let version = cur.read_u32::<LittleEndian>()?;
        if !(2..=3).contains(&version) {
            bail!("unsupported GGUF version {version} (supported: 2-3)");
        }
        let tensor_count = cur.read_u64::<LittleEndian>()?;
        let metadata_count = cur.read_u64::<LittleEndian>()?;

        tracing::info!(version, tensor_count, metadata_count, "opened GGUF container");

        // Metadata is not materialized here; only walked past.
        for i in 0..metadata_count {
            let _key = read_gguf_string(&mut cur)
                .with_context(|| format!("failed to read metadata key {i}"))?;
            let tag = cur.read_u32::<LittleEndian>().context("truncated metadata value type")?;
            let vtype = MetaType::from_u32(tag)
                .with_context(|| format!("unknown metadata value type {tag}"))?;
            skip_meta_value(&mut cur, vtype)
                .with_context(|| format!("failed to skip metadata value {i}"))?;
        }

        let mut tensors = Vec::with_capacity(tensor_count.min(1 << 20) as usize);
        for i in 0..tensor_count {
            let name = read_gguf_string(&mut cur)
                .with_context(|| format!("failed to read tensor name {i}"))?;
            let n_dims = cur.read_u32::<LittleEndian>().context("truncated tensor n_dims")?;
            if n_dims as usize > MAX_TENSOR_DIMS {
                bail!("tensor '{name}' has {n_dims} dims (max {MAX_TENSOR_DIMS})");
            }
            let mut dims = [1u64; 4];
            for dim in dims.iter_mut().take(n_dims as usize) {
                *dim = cur.read_u64::<LittleEndian>().context("truncated tensor dims")?;
            }
            let type_tag = cur.read_u32::<LittleEndian>().context("truncated tensor type")?;
            let dtype = GgmlType::from_u32(type_tag)
                .with_context(|| format!("tensor '{name}' has unknown element type {type_tag}"))?;
            let offset = cur.read_u64::<LittleEndian>().context("truncated tensor offset")?;

            let byte_size = tensor_byte_size(&dims, dtype);
            tensors.push(TensorInfo { name, n_dims, dims, dtype, offset, byte_size });
        }

        let header_end = cur.position() as usize;
        let data_start = header_end.div_ceil(GGUF_ALIGNMENT) * GGUF_ALIGNMENT;
        if data_start >= data.len() {
            bail!("data section starts beyond end of file");
        }

        for t in &tensors {
            let end = (t.offset as usize)
                .checked_add(t.byte_size)
                .map(|e| data_start + e);
            match end {
                Some(e) if e <= data.len() => {}
                _ => bail!(
                    "tensor '{}' ({} bytes at offset {}) runs past end of file",
                    t.name,
                    t.byte_size,
                    t.offset
                ),
            }
        }

        tracing::debug!(header_bytes = header_end, data_offset = data_start, "GGUF layout");

        Ok(Self { mmap, version, tensor_count, metadata_count, tensors, data_start })
    }

    /// Exact, case-sensitive lookup. Linear scan over the tensor table.
    pub fn find_tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Raw bytes of a tensor. Valid for the container's lifetime.
    pub fn tensor_data(&self, tensor: &TensorInfo) -> &[u8] {
        let start = self.data_start + tensor.offset as usize;
        &self.mmap[start..start + tensor.byte_size]
    }

    /// Walk the metadata region looking for `key`; returns the value type and
    /// the byte offset of the value.
    fn find_meta(&self, key: &str) -> Option<(MetaType, usize)> {
        let data: &[u8] = &self.mmap;
        let mut cur = Cursor::new(data);
        cur.set_position(HEADER_SIZE as u64);

        for _ in 0..self.metadata_count {
            let pair_key = read_gguf_string(&mut cur).ok()?;
            let tag = cur.read_u32::<LittleEndian>().ok()?;
            let vtype = MetaType::from_u32(tag)?;
            if pair_key == key {
                return Some((vtype, cur.position() as usize));
            }
            skip_meta_value(&mut cur, vtype).ok()?;
        }
        None
    }

    /// Scalar unsigned integer lookup. Accepts u32 and i32 encodings.
    pub fn meta_u32(&self, key: &str) -> Option<u32> {
        let (vtype, at) = self.find_meta(key)?;
        if vtype != MetaType::U32 && vtype != MetaType::I32 {
            return None;
        }
        let mut cur = Cursor::new(&self.mmap[..]);
        cur.set_position(at as u64);
        cur.read_u32::<LittleEndian>().ok()
    }

    pub fn meta_string(&self, key: &str) -> Option<String> {
        let (vtype, at) = self.find_meta(key)?;
        if vtype != MetaType::String {
            return None;
        }
        let mut cur = Cursor::new(&self.mmap[..]);
        cur.set_position(at as u64);
        read_gguf_string(&mut cur).ok()
    }

    pub fn meta_string_array(&self, key: &str) -> Option<Vec<String>> {
        let (vtype, at) = self.find_meta(key)?;
        if vtype != MetaType::Array {
            return None;
        }
        let mut cur = Cursor::new(&self.mmap[..]);
        cur.set_position(at as u64);
        let elem_type = MetaType::from_u32(cur.read_u32::<LittleEndian>().ok()?)?;
        if elem_type != MetaType::String {
            return None;
        }
        let len = cur.read_u64::<LittleEndian>().ok()?;
        let mut out = Vec::with_capacity(len.min(1 << 24) as usize);
        for _ in 0..len {
            out.push(read_gguf_string(&mut cur).ok()?);
        }
        Some(out)
    }

    pub fn meta_f32_array(&self, key: &str) -> Option<Vec<f32>> {
        let (vtype, at) = self.find_meta(key)?;
        if vtype != MetaType::Array {
            return None;
        }
        let mut cur = Cursor::new(&self.mmap[..]);
        cur.set_position(at as u64);
        let elem_type = MetaType::from_u32(cur.read_u32::<LittleEndian>().ok()?)?;
        if elem_type != MetaType::F32 {
            return None;
        }
        let len = cur.read_u64::<LittleEndian>().ok()?;
        let mut out = Vec::with_capacity(len.min(1 << 24) as usize);
        for _ in 0..len {
            out.push(cur.read_f32::<LittleEndian>().ok()?);
        }
        Some(out)
    }

    /// Log the tensor table at debug level.
    pub fn log_tensor_table(&self) {
        let mut total = 0usize;
        for t in &self.tensors {
            let shape: Vec<u64> = t.dims[..t.n_dims.max(1) as usize].to_vec();
            tracing::debug!(
                name = %t.name,
                dtype = t.dtype.name(),
                ?shape,
                bytes = t.byte_size,
                "tensor"
            );
            total += t.byte_size;
        }
        tracing::info!(
            tensors = self.tensor_count,
            total_mb = format!("{:.2}", total as f64 / (1024.0 * 1024.0)),
            "tensor table"
        );
    }
}
