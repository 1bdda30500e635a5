//! Shared fixtures: author GGUF containers in memory and drop them into the
//! temp directory for parser and tokenizer tests.

use std::fs;
use std::path::PathBuf;

use byteorder::{LittleEndian, WriteBytesExt};

pub const GGUF_MAGIC: u32 = 0x4647_5547;
const ALIGNMENT: usize = 32;

fn push_string(buf: &mut Vec<u8>, s: &str) {
    buf.write_u64::<LittleEndian>(s.len() as u64).unwrap();
    buf.extend_from_slice(s.as_bytes());
}

/// Builds a syntactically valid container byte-by-byte.
pub struct ContainerBuilder {
    version: u32,
    meta: Vec<u8>,
    meta_count: u64,
    tensor_infos: Vec<u8>,
    tensor_count: u64,
    data: Vec<u8>,
}

impl ContainerBuilder {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            meta: Vec::new(),
            meta_count: 0,
            tensor_infos: Vec::new(),
            tensor_count: 0,
            data: Vec::new(),
        }
    }

    pub fn meta_u32(mut self, key: &str, value: u32) -> Self {
        push_string(&mut self.meta, key);
        self.meta.write_u32::<LittleEndian>(4).unwrap(); // u32 tag
        self.meta.write_u32::<LittleEndian>(value).unwrap();
        self.meta_count += 1;
        self
    }

    pub fn meta_string(mut self, key: &str, value: &str) -> Self {
        push_string(&mut self.meta, key);
        self.meta.write_u32::<LittleEndian>(8).unwrap(); // string tag
        push_string(&mut self.meta, value);
        self.meta_count += 1;
        self
    }

    pub fn meta_string_array(mut self, key: &str, values: &[&str]) -> Self {
        push_string(&mut self.meta, key);
        self.meta.write_u32::<LittleEndian>(9).unwrap(); // array tag
        self.meta.write_u32::<LittleEndian>(8).unwrap(); // string elements
        self.meta.write_u64::<LittleEndian>(values.len() as u64).unwrap();
        for v in values {
            push_string(&mut self.meta, v);
        }
        self.meta_count += 1;
        self
    }

    pub fn meta_f32_array(mut self, key: &str, values: &[f32]) -> Self {
        push_string(&mut self.meta, key);
        self.meta.write_u32::<LittleEndian>(9).unwrap();
        self.meta.write_u32::<LittleEndian>(6).unwrap(); // f32 elements
        self.meta.write_u64::<LittleEndian>(values.len() as u64).unwrap();
        for v in values {
            self.meta.write_f32::<LittleEndian>(*v).unwrap();
        }
        self.meta_count += 1;
        self
    }

    /// A metadata pair with an arbitrary (possibly bogus) value-type tag.
    pub fn meta_raw(mut self, key: &str, tag: u32, payload: &[u8]) -> Self {
        push_string(&mut self.meta, key);
        self.meta.write_u32::<LittleEndian>(tag).unwrap();
        self.meta.extend_from_slice(payload);
        self.meta_count += 1;
        self
    }

    /// Append a tensor whose payload is placed at the current end of the data
    /// section. `payload` must already have the type's exact byte size.
    pub fn tensor(mut self, name: &str, dims: &[u64], type_tag: u32, payload: &[u8]) -> Self {
        push_string(&mut self.tensor_infos, name);
        self.tensor_infos.write_u32::<LittleEndian>(dims.len() as u32).unwrap();
        for d in dims {
            self.tensor_infos.write_u64::<LittleEndian>(*d).unwrap();
        }
        self.tensor_infos.write_u32::<LittleEndian>(type_tag).unwrap();
        self.tensor_infos.write_u64::<LittleEndian>(self.data.len() as u64).unwrap();
        self.tensor_count += 1;
        self.data.extend_from_slice(payload);
        // Next tensor starts 32-aligned, like real writers emit.
        while self.data.len() % ALIGNMENT != 0 {
            self.data.push(0);
        }
        self
    }

    /// A tensor-info row with an explicit (possibly out-of-range) offset and
    /// no payload bytes behind it.
    pub fn tensor_info_only(mut self, name: &str, dims: &[u64], type_tag: u32, offset: u64) -> Self {
        push_string(&mut self.tensor_infos, name);
        self.tensor_infos.write_u32::<LittleEndian>(dims.len() as u32).unwrap();
        for d in dims {
            self.tensor_infos.write_u64::<LittleEndian>(*d).unwrap();
        }
        self.tensor_infos.write_u32::<LittleEndian>(type_tag).unwrap();
        self.tensor_infos.write_u64::<LittleEndian>(offset).unwrap();
        self.tensor_count += 1;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(GGUF_MAGIC).unwrap();
        buf.write_u32::<LittleEndian>(self.version).unwrap();
        buf.write_u64::<LittleEndian>(self.tensor_count).unwrap();
        buf.write_u64::<LittleEndian>(self.meta_count).unwrap();
        buf.extend_from_slice(&self.meta);
        buf.extend_from_slice(&self.tensor_infos);
        while buf.len() % ALIGNMENT != 0 {
            buf.push(0);
        }
        if self.data.is_empty() {
            // Keep a non-empty data section so the aligned start is in range.
            buf.extend_from_slice(&[0u8; ALIGNMENT]);
        } else {
            buf.extend_from_slice(&self.data);
        }
        buf
    }

    pub fn write(self, name: &str) -> PathBuf {
        write_temp(name, &self.build())
    }
}

/// Write bytes to a unique path under the system temp directory.
pub fn write_temp(name: &str, bytes: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("lumo_{}_{}", std::process::id(), name));
    fs::write(&path, bytes).unwrap();
    path
}

/// Half-float payload helper for F16 tensors.
#[allow(dead_code)]
pub fn f16_payload(values: &[f32]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|v| half::f16::from_f32(*v).to_bits().to_le_bytes())
        .collect()
}
