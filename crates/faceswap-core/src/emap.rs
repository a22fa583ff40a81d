//! Identity projection matrix ("emap") embedded in the inswapper ONNX file.
//!
//! The swapper expects its source latent as `embedding × emap`. The matrix is
//! stored as the last initializer of the model graph, so it is read straight
//! from the protobuf wire format:
//!
//! ```text
//! ModelProto.graph (7) → GraphProto.initializer (5, repeated) → TensorProto
//! TensorProto: dims (1), data_type (2), float_data (4), raw_data (9), data_location (14)
//! ```

use ndarray::Array2;
use std::path::Path;
use thiserror::Error;

const MODEL_GRAPH_FIELD: u32 = 7;
const GRAPH_INITIALIZER_FIELD: u32 = 5;
const TENSOR_DIMS_FIELD: u32 = 1;
const TENSOR_DATA_TYPE_FIELD: u32 = 2;
const TENSOR_FLOAT_DATA_FIELD: u32 = 4;
const TENSOR_RAW_DATA_FIELD: u32 = 9;
const TENSOR_DATA_LOCATION_FIELD: u32 = 14;

const ONNX_FLOAT: u64 = 1;
const DATA_LOCATION_EXTERNAL: u64 = 1;

#[derive(Error, Debug)]
pub enum EmapError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed protobuf: {0}")]
    Malformed(&'static str),
    #[error("model has no graph initializers")]
    NoInitializer,
    #[error("emap tensor is not a float32 matrix (data_type {data_type}, dims {dims:?})")]
    UnexpectedTensor { data_type: u64, dims: Vec<u64> },
    #[error("emap tensor stores its data externally")]
    ExternalData,
    #[error("emap tensor holds {actual} values, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Read the emap matrix from an inswapper ONNX file.
pub fn load_emap(model_path: &Path) -> Result<Array2<f32>, EmapError> {
    let bytes = std::fs::read(model_path).map_err(|source| EmapError::Io {
        path: model_path.display().to_string(),
        source,
    })?;
    let emap = parse_emap(&bytes)?;
    tracing::debug!(shape = ?emap.shape(), "emap matrix loaded");
    Ok(emap)
}

/// Extract the last graph initializer of a serialized `ModelProto` as a matrix.
pub fn parse_emap(model: &[u8]) -> Result<Array2<f32>, EmapError> {
    let mut graph = None;
    let mut reader = WireReader::new(model);
    while let Some((field, value)) = reader.next_field()? {
        if field == MODEL_GRAPH_FIELD {
            graph = Some(value.bytes()?);
        }
    }
    let graph = graph.ok_or(EmapError::Malformed("model has no graph"))?;

    let mut last_initializer = None;
    let mut reader = WireReader::new(graph);
    while let Some((field, value)) = reader.next_field()? {
        if field == GRAPH_INITIALIZER_FIELD {
            last_initializer = Some(value.bytes()?);
        }
    }

    parse_matrix(last_initializer.ok_or(EmapError::NoInitializer)?)
}

fn parse_matrix(tensor: &[u8]) -> Result<Array2<f32>, EmapError> {
    let mut dims = Vec::new();
    let mut data_type = 0;
    let mut raw: Option<&[u8]> = None;
    let mut floats = Vec::new();

    let mut reader = WireReader::new(tensor);
    while let Some((field, value)) = reader.next_field()? {
        match (field, value) {
            (TENSOR_DIMS_FIELD, Wire::Varint(d)) => dims.push(d),
            (TENSOR_DIMS_FIELD, Wire::Bytes(packed)) => {
                let mut r = WireReader::new(packed);
                while !r.is_empty() {
                    dims.push(r.varint()?);
                }
            }
            (TENSOR_DATA_TYPE_FIELD, Wire::Varint(t)) => data_type = t,
            (TENSOR_FLOAT_DATA_FIELD, Wire::Fixed32(bits)) => floats.push(f32::from_bits(bits)),
            (TENSOR_FLOAT_DATA_FIELD, Wire::Bytes(packed)) => {
                if packed.len() % 4 != 0 {
                    return Err(EmapError::Malformed("packed float_data not a multiple of 4 bytes"));
                }
                floats.extend(packed.chunks_exact(4).map(le_f32));
            }
            (TENSOR_RAW_DATA_FIELD, Wire::Bytes(bytes)) => raw = Some(bytes),
            (TENSOR_DATA_LOCATION_FIELD, Wire::Varint(DATA_LOCATION_EXTERNAL)) => {
                return Err(EmapError::ExternalData)
            }
            _ => {}
        }
    }

    if data_type != ONNX_FLOAT || dims.len() != 2 {
        return Err(EmapError::UnexpectedTensor { data_type, dims });
    }

    let (rows, cols) = (dims[0] as usize, dims[1] as usize);
    let values = match raw {
        Some(bytes) => {
            if bytes.len() % 4 != 0 {
                return Err(EmapError::Malformed("raw_data not a multiple of 4 bytes"));
            }
            bytes.chunks_exact(4).map(le_f32).collect()
        }
        None => floats,
    };

    let actual = values.len();
    Array2::from_shape_vec((rows, cols), values).map_err(|_| EmapError::LengthMismatch {
        expected: rows * cols,
        actual,
    })
}

fn le_f32(chunk: &[u8]) -> f32 {
    f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
}

/// One decoded protobuf field value.
#[derive(Debug, Clone, Copy)]
enum Wire<'a> {
    Varint(u64),
    Fixed64,
    Bytes(&'a [u8]),
    Fixed32(u32),
}

impl<'a> Wire<'a> {
    fn bytes(self) -> Result<&'a [u8], EmapError> {
        match self {
            Wire::Bytes(b) => Ok(b),
            _ => Err(EmapError::Malformed("expected a length-delimited field")),
        }
    }
}

/// Cursor over protobuf wire-format fields. Borrows; never copies payloads.
struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn varint(&mut self) -> Result<u64, EmapError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or(EmapError::Malformed("truncated varint"))?;
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(EmapError::Malformed("varint longer than 10 bytes"))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], EmapError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(EmapError::Malformed("field runs past end of buffer"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn next_field(&mut self) -> Result<Option<(u32, Wire<'a>)>, EmapError> {
        if self.is_empty() {
            return Ok(None);
        }
        let key = self.varint()?;
        let field = (key >> 3) as u32;
        let value = match key & 0x7 {
            0 => Wire::Varint(self.varint()?),
            1 => {
                self.take(8)?;
                Wire::Fixed64
            }
            2 => {
                let len = self.varint()? as usize;
                Wire::Bytes(self.take(len)?)
            }
            5 => {
                let b = self.take(4)?;
                Wire::Fixed32(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            }
            _ => return Err(EmapError::Malformed("unsupported wire type")),
        };
        Ok(Some((field, value)))
    }
}
