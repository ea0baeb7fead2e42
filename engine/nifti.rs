//! Compact NIfTI-1 reading and writing.
//!
//! Only the single-file format (`.nii` / `.nii.gz`, magic `n+1`) with the
//! 348-byte header is supported. Endianness is detected from `sizeof_hdr`;
//! integer and float datatypes are decoded to `f64` with `scl_slope` /
//! `scl_inter` applied. Output maps are written as little-endian f32 with
//! the caller's description text in `descrip` (truncated to its 80 bytes).

use crate::volume::{Series, Volume};
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use ndarray::{Array3, Array4};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

const HEADER_SIZE: usize = 348;
const VOX_OFFSET: usize = 352;

/// NIfTI-1 header field byte offsets.
mod offsets {
    pub const SIZEOF_HDR: usize = 0;
    pub const DIM: usize = 40;
    pub const DATATYPE: usize = 70;
    pub const BITPIX: usize = 72;
    pub const PIXDIM: usize = 76;
    pub const VOX_OFFSET: usize = 108;
    pub const SCL_SLOPE: usize = 112;
    pub const SCL_INTER: usize = 116;
    pub const DESCRIP: usize = 148;
    pub const MAGIC: usize = 344;
}

/// NIfTI-1 datatype codes this module decodes.
mod datatype {
    pub const UINT8: i16 = 2;
    pub const INT16: i16 = 4;
    pub const INT32: i16 = 8;
    pub const FLOAT32: i16 = 16;
    pub const FLOAT64: i16 = 64;
}

#[derive(Error, Debug)]
pub enum NiftiError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file is too short to hold a NIfTI-1 header ({0} bytes)")]
    Truncated(usize),
    #[error("unrecognized header size {0}; not a NIfTI-1 file")]
    BadHeaderSize(i32),
    #[error("bad magic {0:?}; only single-file NIfTI-1 (n+1) is supported")]
    BadMagic([u8; 4]),
    #[error("unsupported datatype code {0}")]
    UnsupportedDatatype(i16),
    #[error("dim[0] = {0}; expected between 1 and 4 dimensions")]
    BadDimCount(i16),
    #[error("voxel data ends at {expected} bytes but the file holds {actual}")]
    DataTooShort { expected: usize, actual: usize },
    #[error("dimension {0} does not fit the i16 dim field (NIfTI-1 caps each axis at 32767)")]
    DimTooLarge(usize),
}

/// A decoded image: up to four dims, voxels as f64 in x-fastest order.
#[derive(Clone, Debug)]
pub struct NiftiImage {
    pub dims: [usize; 4],
    pub voxels: Vec<f64>,
}

impl NiftiImage {
    /// Reinterprets the image as a 4D observation series. A 3D image
    /// becomes a series with one observation.
    pub fn into_series(self) -> Series {
        let [dx, dy, dz, dt] = self.dims;
        let mut data = Array4::zeros((dx, dy, dz, dt));
        for t in 0..dt {
            for z in 0..dz {
                for y in 0..dy {
                    for x in 0..dx {
                        data[[x, y, z, t]] = self.voxels[linear_index(self.dims, x, y, z, t)];
                    }
                }
            }
        }
        Series::new(data)
    }

    /// Reinterprets the image as a single 3D volume, discarding any
    /// trailing observations beyond the first.
    pub fn into_volume(self) -> Volume {
        let [dx, dy, dz, _] = self.dims;
        let mut data = Array3::zeros((dx, dy, dz));
        for z in 0..dz {
            for y in 0..dy {
                for x in 0..dx {
                    data[[x, y, z]] = self.voxels[linear_index(self.dims, x, y, z, 0)];
                }
            }
        }
        data
    }
}

/// NIfTI voxel order: x fastest, then y, z, t.
fn linear_index(dims: [usize; 4], x: usize, y: usize, z: usize, t: usize) -> usize {
    x + dims[0] * (y + dims[1] * (z + dims[2] * t))
}

fn is_gzipped(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "gz")
}

/// Reads a `.nii` or `.nii.gz` file into memory.
pub fn read(path: &Path) -> Result<NiftiImage, NiftiError> {
    let mut raw = Vec::new();
    let mut file = File::open(path)?;
    if is_gzipped(path) {
        MultiGzDecoder::new(file).read_to_end(&mut raw)?;
    } else {
        file.read_to_end(&mut raw)?;
    }
    decode(&raw)
}

fn decode(raw: &[u8]) -> Result<NiftiImage, NiftiError> {
    if raw.len() < HEADER_SIZE {
        return Err(NiftiError::Truncated(raw.len()));
    }
    let sizeof_le = LittleEndian::read_i32(&raw[offsets::SIZEOF_HDR..]);
    if sizeof_le == HEADER_SIZE as i32 {
        decode_with::<LittleEndian>(raw)
    } else if BigEndian::read_i32(&raw[offsets::SIZEOF_HDR..]) == HEADER_SIZE as i32 {
        decode_with::<BigEndian>(raw)
    } else {
        Err(NiftiError::BadHeaderSize(sizeof_le))
    }
}

fn decode_with<E: ByteOrder>(raw: &[u8]) -> Result<NiftiImage, NiftiError> {
    let magic: [u8; 4] = raw[offsets::MAGIC..offsets::MAGIC + 4].try_into().unwrap();
    if &magic != b"n+1\0" {
        return Err(NiftiError::BadMagic(magic));
    }
    let ndim = E::read_i16(&raw[offsets::DIM..]);
    if !(1..=4).contains(&ndim) {
        return Err(NiftiError::BadDimCount(ndim));
    }
    let mut dims = [1usize; 4];
    for (i, d) in dims.iter_mut().enumerate().take(ndim as usize) {
        let v = E::read_i16(&raw[offsets::DIM + 2 * (i + 1)..]);
        *d = v.max(1) as usize;
    }
    let code = E::read_i16(&raw[offsets::DATATYPE..]);
    let bytes_per = match code {
        datatype::UINT8 => 1,
        datatype::INT16 => 2,
        datatype::INT32 | datatype::FLOAT32 => 4,
        datatype::FLOAT64 => 8,
        other => return Err(NiftiError::UnsupportedDatatype(other)),
    };
    let n_voxels = dims.iter().product::<usize>();
    let vox_offset = E::read_f32(&raw[offsets::VOX_OFFSET..]) as usize;
    let vox_offset = vox_offset.max(HEADER_SIZE);
    let expected = vox_offset + n_voxels * bytes_per;
    if raw.len() < expected {
        return Err(NiftiError::DataTooShort { expected, actual: raw.len() });
    }
    let slope = E::read_f32(&raw[offsets::SCL_SLOPE..]) as f64;
    let inter = E::read_f32(&raw[offsets::SCL_INTER..]) as f64;
    let (slope, inter) = if slope == 0.0 || !slope.is_finite() {
        (1.0, 0.0)
    } else {
        (slope, if inter.is_finite() { inter } else { 0.0 })
    };
    let data = &raw[vox_offset..expected];
    let voxels = (0..n_voxels)
        .map(|i| {
            let v = match code {
                datatype::UINT8 => data[i] as f64,
                datatype::INT16 => E::read_i16(&data[2 * i..]) as f64,
                datatype::INT32 => E::read_i32(&data[4 * i..]) as f64,
                datatype::FLOAT32 => E::read_f32(&data[4 * i..]) as f64,
                _ => E::read_f64(&data[8 * i..]),
            };
            v * slope + inter
        })
        .collect();
    Ok(NiftiImage { dims, voxels })
}

/// Writes a 3D map as little-endian f32, single-file NIfTI-1.
///
/// `descrip` lands in the header's 80-byte description field, so only its
/// leading line fits; callers carrying a full threshold set put it in the
/// text/JSON sidecars and pass the first line here.
pub fn write_volume(path: &Path, volume: &Volume, descrip: &str) -> Result<(), NiftiError> {
    let s = volume.shape();
    let dims = [s[0], s[1], s[2], 1];
    let mut voxels = Vec::with_capacity(dims.iter().product());
    for z in 0..dims[2] {
        for y in 0..dims[1] {
            for x in 0..dims[0] {
                voxels.push(volume[[x, y, z]]);
            }
        }
    }
    write_raw(path, dims, 3, &voxels, descrip)
}

/// Writes a stack of 3D maps as one 4D file (used for the three
/// confidence-interval planes).
pub fn write_planes(
    path: &Path,
    planes: &[&Volume],
    descrip: &str,
) -> Result<(), NiftiError> {
    let s = planes[0].shape();
    let dims = [s[0], s[1], s[2], planes.len()];
    let mut voxels = Vec::with_capacity(dims.iter().product());
    for plane in planes {
        for z in 0..dims[2] {
            for y in 0..dims[1] {
                for x in 0..dims[0] {
                    voxels.push(plane[[x, y, z]]);
                }
            }
        }
    }
    write_raw(path, dims, 4, &voxels, descrip)
}

fn write_raw(
    path: &Path,
    dims: [usize; 4],
    ndim: i16,
    voxels: &[f64],
    descrip: &str,
) -> Result<(), NiftiError> {
    if let Some(&d) = dims.iter().find(|&&d| d > i16::MAX as usize) {
        return Err(NiftiError::DimTooLarge(d));
    }
    let mut header = vec![0u8; VOX_OFFSET];
    LittleEndian::write_i32(&mut header[offsets::SIZEOF_HDR..], HEADER_SIZE as i32);
    LittleEndian::write_i16(&mut header[offsets::DIM..], ndim);
    for (i, &d) in dims.iter().enumerate() {
        LittleEndian::write_i16(&mut header[offsets::DIM + 2 * (i + 1)..], d as i16);
    }
    for i in dims.len()..7 {
        LittleEndian::write_i16(&mut header[offsets::DIM + 2 * (i + 1)..], 1);
    }
    LittleEndian::write_i16(&mut header[offsets::DATATYPE..], datatype::FLOAT32);
    LittleEndian::write_i16(&mut header[offsets::BITPIX..], 32);
    for i in 0..8 {
        LittleEndian::write_f32(&mut header[offsets::PIXDIM + 4 * i..], 1.0);
    }
    LittleEndian::write_f32(&mut header[offsets::VOX_OFFSET..], VOX_OFFSET as f32);
    LittleEndian::write_f32(&mut header[offsets::SCL_SLOPE..], 1.0);
    LittleEndian::write_f32(&mut header[offsets::SCL_INTER..], 0.0);
    let descrip_bytes = descrip.as_bytes();
    let n = descrip_bytes.len().min(79);
    header[offsets::DESCRIP..offsets::DESCRIP + n].copy_from_slice(&descrip_bytes[..n]);
    header[offsets::MAGIC..offsets::MAGIC + 4].copy_from_slice(b"n+1\0");

    let mut body = Vec::with_capacity(voxels.len() * 4);
    for &v in voxels {
        body.write_f32::<LittleEndian>(v as f32)?;
    }

    let file = File::create(path)?;
    if is_gzipped(path) {
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&header)?;
        encoder.write_all(&body)?;
        encoder.finish()?;
    } else {
        let mut file = file;
        file.write_all(&header)?;
        file.write_all(&body)?;
    }
    Ok(())
}
