// Checkpoint — Save and load compiled circuits
//
// Binary checkpoint format (.pckt):
//
//   Header:
//     magic:   [u8; 4]  = b"PCKT"
//     version: u32 LE   = 1
//
//   Structure:
//     json_len: u64 LE
//     json:     [u8; json_len]   (CircuitDescription without parameters)
//
//   Parameters:
//     count: u32 LE              (number of tensors)
//     for each tensor:
//       key_len:  u32 LE
//       key:      [u8; key_len]  (UTF-8, "layer/<index>")
//       dtype:    u8             (0=F32, 1=F64, 5=F16, 6=BF16)
//       ndim:     u32 LE
//       dims:     [u32 LE; ndim] ([num_nodes, width])
//       data_len: u64 LE         (in bytes)
//       data:     [u8; data_len] (raw little-endian values)
//
// Loading rebuilds the circuit from the structure section, recompiles it
// (compilation is deterministic, so the layers come out identical) and then
// installs every parameter tensor after checking its shape and domain.
// Tensors stored below f64 are renormalised on load to absorb rounding.
// Saving refuses a dtype that cannot hold a layer's parameters (a gaussian
// mean past the f16 range, a variance that flushes to zero), so every file
// written can be read back.
//
// Usage:
//   checkpoint::save("model.pckt", &plan, &ctx)?;
//   let plan = checkpoint::load("model.pckt", &ctx)?;

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use log::info;

use circuitry_core::{Circuit, CircuitDescription, DType, Error, NodeDescription, Result};

use crate::compile::{compile, Layer};
use crate::context::ExecContext;
use crate::params::{check_layer, project_layer};
use crate::plan::CompiledPlan;

// Constants

const MAGIC: &[u8; 4] = b"PCKT";
const VERSION: u32 = 1;
const KEY_PREFIX: &str = "layer/";
const MAX_STRUCTURE_BYTES: u64 = 1 << 30;
const MAX_KEY_BYTES: u32 = 1 << 10;

// Value encoding

fn encode(data: &[f64], dtype: DType) -> Vec<u8> {
    match dtype {
        DType::F16 => data
            .iter()
            .flat_map(|&v| half::f16::from_f64(v).to_le_bytes())
            .collect(),
        DType::BF16 => data
            .iter()
            .flat_map(|&v| half::bf16::from_f64(v).to_le_bytes())
            .collect(),
        DType::F32 => data.iter().flat_map(|&v| (v as f32).to_le_bytes()).collect(),
        DType::F64 => data.iter().flat_map(|&v| v.to_le_bytes()).collect(),
    }
}

fn decode(bytes: &[u8], dtype: DType) -> Result<Vec<f64>> {
    if bytes.len() % dtype.size_in_bytes() != 0 {
        return Err(Error::Format(format!(
            "{} bytes is not a whole number of {dtype} values",
            bytes.len()
        )));
    }
    Ok(match dtype {
        DType::F16 => bytes
            .chunks_exact(2)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f64())
            .collect(),
        DType::BF16 => bytes
            .chunks_exact(2)
            .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f64())
            .collect(),
        DType::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
            .collect(),
        DType::F64 => bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect(),
    })
}

// Low-level IO helpers

fn write_u8(w: &mut impl Write, v: u8) -> Result<()> {
    Ok(w.write_all(&[v])?)
}

fn write_u32(w: &mut impl Write, v: u32) -> Result<()> {
    Ok(w.write_all(&v.to_le_bytes())?)
}

fn write_u64(w: &mut impl Write, v: u64) -> Result<()> {
    Ok(w.write_all(&v.to_le_bytes())?)
}

fn read_u8(r: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Read exactly `len` bytes. The buffer grows with what the reader actually
/// yields, so a corrupt length hits end-of-file instead of a huge allocation.
fn read_bytes(r: &mut impl Read, len: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.by_ref().take(len).read_to_end(&mut buf)?;
    if (buf.len() as u64) < len {
        return Err(std::io::Error::from(ErrorKind::UnexpectedEof).into());
    }
    Ok(buf)
}

/// Structure of `circuit` with every parameter left out.
fn structure_of(circuit: &Circuit) -> CircuitDescription {
    let mut desc = circuit.to_description();
    for node in &mut desc.nodes {
        match node {
            NodeDescription::Input { params, .. } => *params = None,
            NodeDescription::Sum { weights, .. } => *weights = None,
            NodeDescription::Product { .. } => {}
        }
    }
    desc
}

// Write checkpoint

/// Encode one layer's parameters as `dtype`, failing if what would be read
/// back is outside the parameter domain.
fn encode_layer(layer: &Layer, data: &[f64], dtype: DType) -> Result<Vec<u8>> {
    let bytes = encode(data, dtype);
    if dtype != DType::F64 {
        let mut back = decode(&bytes, dtype)?;
        project_layer(layer, &mut back);
        check_layer(layer, &back).map_err(|e| {
            Error::Format(format!("layer {} cannot be stored as {dtype}: {e}", layer.index))
        })?;
    }
    Ok(bytes)
}

/// Write `plan` to `writer`, storing parameters as `dtype`.
///
/// Nothing is written if some layer cannot be represented in `dtype`.
pub fn write_checkpoint(writer: &mut impl Write, plan: &CompiledPlan, dtype: DType) -> Result<()> {
    let tensors = plan
        .layers()
        .iter()
        .filter(|l| l.kind.has_params())
        .map(|l| encode_layer(l, plan.params().layer(l.index), dtype).map(|data| (l, data)))
        .collect::<Result<Vec<_>>>()?;

    writer.write_all(MAGIC)?;
    write_u32(writer, VERSION)?;

    let json = structure_of(plan.source()).to_json()?;
    write_u64(writer, json.len() as u64)?;
    writer.write_all(json.as_bytes())?;

    write_u32(writer, tensors.len() as u32)?;
    for (layer, data) in tensors {
        let key = format!("{KEY_PREFIX}{}", layer.index);
        write_u32(writer, key.len() as u32)?;
        writer.write_all(key.as_bytes())?;

        write_u8(writer, dtype.to_tag())?;
        let dims = [layer.num_nodes(), layer.kind.param_width()];
        write_u32(writer, dims.len() as u32)?;
        for d in dims {
            write_u32(writer, d as u32)?;
        }

        write_u64(writer, data.len() as u64)?;
        writer.write_all(&data)?;
    }
    Ok(())
}

// Read checkpoint

/// Read a checkpoint and rebuild the compiled plan under `ctx`.
pub fn read_checkpoint(reader: &mut impl Read, ctx: &ExecContext) -> Result<CompiledPlan> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::Format(format!(
            "invalid checkpoint: expected magic {MAGIC:?}, got {magic:?}"
        )));
    }
    let version = read_u32(reader)?;
    if version != VERSION {
        return Err(Error::Format(format!(
            "unsupported checkpoint version {version} (expected {VERSION})"
        )));
    }

    let json_len = read_u64(reader)?;
    if json_len > MAX_STRUCTURE_BYTES {
        return Err(Error::Format(format!(
            "structure section of {json_len} bytes exceeds the {MAX_STRUCTURE_BYTES} byte limit"
        )));
    }
    let json = String::from_utf8(read_bytes(reader, json_len)?)
        .map_err(|e| Error::Format(format!("structure section is not UTF-8: {e}")))?;
    let circuit = CircuitDescription::from_json(&json)?.build()?;
    let mut plan = compile(&circuit, ctx)?;

    let count = read_u32(reader)? as usize;
    let mut seen = vec![false; plan.num_layers()];
    for _ in 0..count {
        let key_len = read_u32(reader)?;
        if key_len > MAX_KEY_BYTES {
            return Err(Error::Format(format!("tensor key of {key_len} bytes is too long")));
        }
        let key = String::from_utf8(read_bytes(reader, u64::from(key_len))?)
            .map_err(|e| Error::Format(format!("invalid UTF-8 key: {e}")))?;
        let index: usize = key
            .strip_prefix(KEY_PREFIX)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Format(format!("unexpected tensor key {key:?}")))?;
        let layer = plan
            .layers()
            .get(index)
            .ok_or_else(|| Error::Format(format!("tensor {key:?} names a layer the plan does not have")))?;

        let dtype = DType::from_tag(read_u8(reader)?)?;
        let expected = [layer.num_nodes(), layer.kind.param_width()];
        let ndim = read_u32(reader)? as usize;
        if ndim != expected.len() {
            return Err(Error::Format(format!(
                "tensor {key:?} has {ndim} dimensions, layer {index} needs {}",
                expected.len()
            )));
        }
        let mut dims = [0usize; 2];
        for d in &mut dims {
            *d = read_u32(reader)? as usize;
        }
        if dims != expected {
            return Err(Error::Format(format!(
                "tensor {key:?} has shape {dims:?}, layer {index} needs {expected:?}"
            )));
        }

        let data_len = read_u64(reader)?;
        let expected_len = (expected[0] * expected[1] * dtype.size_in_bytes()) as u64;
        if data_len != expected_len {
            return Err(Error::Format(format!(
                "tensor {key:?} holds {data_len} bytes, {expected:?} of {dtype} needs {expected_len}"
            )));
        }
        let mut data = decode(&read_bytes(reader, data_len)?, dtype)?;
        if dtype != DType::F64 {
            project_layer(layer, &mut data);
        }
        plan.set_layer_params(index, data)?;
        seen[index] = true;
    }

    if let Some(layer) = plan
        .layers()
        .iter()
        .find(|l| l.kind.has_params() && !seen[l.index])
    {
        return Err(Error::Format(format!(
            "checkpoint has no parameters for layer {}",
            layer.index
        )));
    }
    plan.refresh_source()?;
    Ok(plan)
}

// High-level API

/// Save `plan` to a file, storing parameters at the context's precision.
///
/// The file is only created once every layer has been encoded.
pub fn save(path: impl AsRef<Path>, plan: &CompiledPlan, ctx: &ExecContext) -> Result<()> {
    let bytes = to_bytes(plan, ctx.precision())?;
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&bytes)?;
    writer.flush()?;
    info!(
        "saved checkpoint {} ({} layers, {})",
        path.as_ref().display(),
        plan.num_layers(),
        ctx.precision()
    );
    Ok(())
}

/// Load a plan saved with [`save`].
pub fn load(path: impl AsRef<Path>, ctx: &ExecContext) -> Result<CompiledPlan> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);
    read_checkpoint(&mut reader, ctx)
}

// In-memory checkpoint

pub fn to_bytes(plan: &CompiledPlan, dtype: DType) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_checkpoint(&mut buf, plan, dtype)?;
    Ok(buf)
}

pub fn from_bytes(data: &[u8], ctx: &ExecContext) -> Result<CompiledPlan> {
    let mut cursor = std::io::Cursor::new(data);
    read_checkpoint(&mut cursor, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use circuitry_core::{CircuitBuilder, NodeId};

    fn plan() -> CompiledPlan {
        let mut b = CircuitBuilder::new();
        let a0 = b.gaussian(0, -1.0, 0.5);
        let a1 = b.categorical(1, &[0.1, 0.2, 0.7]);
        let b0 = b.gaussian(0, 2.0, 1.5);
        let b1 = b.categorical(1, &[0.6, 0.3, 0.1]);
        let p0 = b.product(&[a0, a1]);
        let p1 = b.product(&[b0, b1]);
        let root = b.sum(&[p0, p1], &[0.35, 0.65]);
        compile(&b.build(root).unwrap(), &ExecContext::cpu()).unwrap()
    }

    #[test]
    fn test_f64_roundtrip_is_exact() {
        let plan = plan();
        let bytes = to_bytes(&plan, DType::F64).unwrap();
        let back = from_bytes(&bytes, &ExecContext::cpu()).unwrap();
        assert_eq!(back.params(), plan.params());
        assert_eq!(back.source(), &plan.to_circuit().unwrap());
        assert_eq!(back.num_layers(), plan.num_layers());
    }

    #[test]
    fn test_half_roundtrip_stays_normalised() {
        let plan = plan();
        let bytes = to_bytes(&plan, DType::F16).unwrap();
        let back = from_bytes(&bytes, &ExecContext::cpu()).unwrap();
        let w = back.params().layer(back.root_layer().index);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((w[0] - 0.35).abs() < 1e-3);
    }

    #[test]
    fn test_bad_magic_and_version() {
        let plan = plan();
        let mut bytes = to_bytes(&plan, DType::F32).unwrap();
        bytes[0] = b'X';
        assert!(matches!(from_bytes(&bytes, &ExecContext::cpu()), Err(Error::Format(_))));

        let mut bytes = to_bytes(&plan, DType::F32).unwrap();
        bytes[4] = 9;
        assert!(matches!(from_bytes(&bytes, &ExecContext::cpu()), Err(Error::Format(_))));
    }

    #[test]
    fn test_truncated_checkpoint() {
        let bytes = to_bytes(&plan(), DType::F32).unwrap();
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(from_bytes(cut, &ExecContext::cpu()), Err(Error::Io(_))));
    }

    #[test]
    fn test_corrupt_lengths_are_rejected_before_reading() {
        let plan = plan();
        let bytes = to_bytes(&plan, DType::F32).unwrap();

        let mut huge_json = bytes.clone();
        huge_json[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(from_bytes(&huge_json, &ExecContext::cpu()), Err(Error::Format(_))));

        // The root layer's tensor comes last: its data_len sits right before its data.
        let root = plan.root_layer();
        let data_bytes = root.num_nodes() * root.kind.param_width() * DType::F32.size_in_bytes();
        let at = bytes.len() - data_bytes - 8;
        let mut huge_data = bytes.clone();
        huge_data[at..at + 8].copy_from_slice(&(u64::MAX / 2).to_le_bytes());
        let err = from_bytes(&huge_data, &ExecContext::cpu()).unwrap_err();
        assert!(matches!(err, Error::Format(ref m) if m.contains("bytes")), "got {err}");
    }

    fn gaussian_pair(mean_a: f64, var_a: f64, mean_b: f64, var_b: f64) -> CompiledPlan {
        let mut b = CircuitBuilder::new();
        let x = b.gaussian(0, mean_a, var_a);
        let y = b.gaussian(0, mean_b, var_b);
        let root = b.sum(&[x, y], &[0.5, 0.5]);
        compile(&b.build(root).unwrap(), &ExecContext::cpu()).unwrap()
    }

    #[test]
    fn test_unrepresentable_gaussian_fails_the_save() {
        // 1e5 overflows f16; 1e-9 flushes to zero in f16.
        for plan in [gaussian_pair(1e5, 1.0, 0.0, 1.0), gaussian_pair(0.0, 1.0, 2.0, 1e-9)] {
            let leaves = plan.locate(NodeId(0)).unwrap().layer;
            match to_bytes(&plan, DType::F16).unwrap_err() {
                Error::Format(m) => assert!(m.contains(&format!("layer {leaves} ")), "{m}"),
                other => panic!("expected format error, got {other}"),
            }

            // Wider dtypes hold the same values and load back.
            for dtype in [DType::BF16, DType::F32] {
                let bytes = to_bytes(&plan, dtype).unwrap();
                assert!(from_bytes(&bytes, &ExecContext::cpu()).is_ok(), "{dtype}");
            }
        }

        let path = std::env::temp_dir().join("circuitry_checkpoint_f16_overflow.pckt");
        let _ = std::fs::remove_file(&path);
        let ctx = ExecContext::cpu().with_precision(DType::F16);
        assert!(save(&path, &gaussian_pair(1e5, 1.0, 0.0, 1.0), &ctx).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_file_roundtrip() {
        let plan = plan();
        let path = std::env::temp_dir().join("circuitry_checkpoint_test.pckt");
        let ctx = ExecContext::cpu().with_precision(DType::F64);
        save(&path, &plan, &ctx).unwrap();
        let back = load(&path, &ctx).unwrap();
        assert_eq!(back.params(), plan.params());
        let _ = std::fs::remove_file(&path);
    }
}
