//! Stateless byte-to-byte processing filters (`xor`, `rotate`, `zlib`), each
//! with a forward (`apply`, used while parsing) and inverse (`unapply`, used
//! while serializing) transform. A small registry maps directive names
//! (as found in a `process:` attribute) to the filter they construct.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::errors::{ErrorKind, KaitaiError, Result};

/// Which way `rotate`/`rol`/`ror` turn the bits of each byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateDirection {
    Left,
    Right,
}

/// A resolved, ready-to-run process filter.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessSpec {
    Xor(Vec<u8>),
    Rotate(u32, RotateDirection),
    Zlib,
}

impl ProcessSpec {
    /// Applies the forward transform (parser: stream bytes -> decoded bytes).
    pub fn apply(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            ProcessSpec::Xor(key) => Ok(xor(data, key)),
            ProcessSpec::Rotate(n, RotateDirection::Left) => Ok(rotate_left(data, *n)),
            ProcessSpec::Rotate(n, RotateDirection::Right) => Ok(rotate_right(data, *n)),
            ProcessSpec::Zlib => zlib_decompress(data),
        }
    }

    /// Applies the inverse transform (serializer: decoded bytes -> stream bytes).
    pub fn unapply(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            ProcessSpec::Xor(key) => Ok(xor(data, key)),
            ProcessSpec::Rotate(n, RotateDirection::Left) => Ok(rotate_right(data, *n)),
            ProcessSpec::Rotate(n, RotateDirection::Right) => Ok(rotate_left(data, *n)),
            ProcessSpec::Zlib => zlib_compress(data),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProcessSpec::Xor(_) => "xor",
            ProcessSpec::Rotate(_, RotateDirection::Left) => "rotate",
            ProcessSpec::Rotate(_, RotateDirection::Right) => "ror",
            ProcessSpec::Zlib => "zlib",
        }
    }
}

fn xor(data: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()])
        .collect()
}

fn rotate_left(data: &[u8], n: u32) -> Vec<u8> {
    let n = n % 8;
    data.iter().map(|b| b.rotate_left(n)).collect()
}

fn rotate_right(data: &[u8], n: u32) -> Vec<u8> {
    let n = n % 8;
    data.iter().map(|b| b.rotate_right(n)).collect()
}

fn zlib_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|e| {
        KaitaiError::new(ErrorKind::ProcessError {
            name: "zlib".to_string(),
            reason: e.to_string(),
        })
    })?;
    Ok(out)
}

fn zlib_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(|e| {
        KaitaiError::new(ErrorKind::ProcessError {
            name: "zlib".to_string(),
            reason: e.to_string(),
        })
    })?;
    encoder.finish().map_err(|e| {
        KaitaiError::new(ErrorKind::ProcessError {
            name: "zlib".to_string(),
            reason: e.to_string(),
        })
    })
}

/// The two pieces of a directive string: the filter name and the raw,
/// unparsed parameter expression text (if any), e.g. `"xor(key)"` ->
/// `("xor", Some("key"))`, `"zlib"` -> `("zlib", None)`.
pub fn split_directive(raw: &str) -> Result<(String, Option<String>)> {
    let raw = raw.trim();
    match raw.find('(') {
        None => Ok((raw.to_string(), None)),
        Some(open) => {
            if !raw.ends_with(')') {
                return Err(KaitaiError::new(ErrorKind::ProcessError {
                    name: raw.to_string(),
                    reason: "unbalanced parentheses in process directive".to_string(),
                }));
            }
            let name = raw[..open].trim().to_string();
            let param = raw[open + 1..raw.len() - 1].trim().to_string();
            Ok((name, Some(param)))
        }
    }
}

/// One evaluated parameter value, coerced from the expression evaluator's
/// generic `Value` into what a filter constructor needs.
pub enum ProcessParam {
    Bytes(Vec<u8>),
    Int(i64),
}

/// Builds a [`ProcessSpec`] from a directive name and its (already
/// evaluated) parameter, if any.
pub fn build(name: &str, param: Option<ProcessParam>) -> Result<ProcessSpec> {
    match name {
        "xor" => match param {
            Some(ProcessParam::Bytes(b)) => Ok(ProcessSpec::Xor(b)),
            Some(ProcessParam::Int(v)) => Ok(ProcessSpec::Xor(vec![v as u8])),
            None => Err(KaitaiError::new(ErrorKind::ProcessError {
                name: "xor".to_string(),
                reason: "missing key parameter".to_string(),
            })),
        },
        "rotate" | "rol" => match param {
            Some(ProcessParam::Int(v)) => Ok(ProcessSpec::Rotate(v.rem_euclid(8) as u32, RotateDirection::Left)),
            Some(ProcessParam::Bytes(_)) | None => Err(KaitaiError::new(ErrorKind::ProcessError {
                name: "rotate".to_string(),
                reason: "missing or invalid rotation amount".to_string(),
            })),
        },
        "ror" => match param {
            Some(ProcessParam::Int(v)) => Ok(ProcessSpec::Rotate(v.rem_euclid(8) as u32, RotateDirection::Right)),
            Some(ProcessParam::Bytes(_)) | None => Err(KaitaiError::new(ErrorKind::ProcessError {
                name: "ror".to_string(),
                reason: "missing or invalid rotation amount".to_string(),
            })),
        },
        "zlib" => Ok(ProcessSpec::Zlib),
        other => Err(KaitaiError::new(ErrorKind::ProcessError {
            name: other.to_string(),
            reason: "unknown process filter".to_string(),
        })),
    }
}

/// Splits a directive and resolves its parameter expression (if any) via
/// `eval_param`, then builds the corresponding [`ProcessSpec`]. Shared by
/// the parser (evaluates against the stream's current scope) and the
/// serializer (evaluates against the data being written) so neither has to
/// duplicate the directive-parsing rules.
pub fn resolve_spec(
    raw: &str,
    mut eval_param: impl FnMut(&str) -> Result<crate::value::Value>,
) -> Result<ProcessSpec> {
    let (name, param_src) = split_directive(raw)?;
    let param = match param_src {
        None => None,
        Some(src) => {
            let value = eval_param(&src)?;
            Some(match value {
                crate::value::Value::Bytes(b) => ProcessParam::Bytes(b),
                other => {
                    let n = other.as_i64().ok_or_else(|| {
                        KaitaiError::new(ErrorKind::ProcessError {
                            name: name.clone(),
                            reason: "process parameter is neither an integer nor a byte sequence"
                                .to_string(),
                        })
                    })?;
                    ProcessParam::Int(n)
                }
            })
        }
    };
    build(&name, param)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_self_inverse() {
        let spec = ProcessSpec::Xor(vec![0xAA]);
        let data = [0xBB, 0x02];
        let encoded = spec.apply(&data).unwrap();
        let decoded = spec.unapply(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn xor_key_sequence_wraps() {
        let spec = ProcessSpec::Xor(vec![0x01, 0x02]);
        let data = [0x00, 0x00, 0x00];
        assert_eq!(spec.apply(&data).unwrap(), vec![0x01, 0x02, 0x01]);
    }

    #[test]
    fn rotate_round_trips() {
        let spec = ProcessSpec::Rotate(3, RotateDirection::Left);
        let data = [0b1010_0001];
        let rotated = spec.apply(&data).unwrap();
        assert_eq!(rotated, vec![0b0000_1101]);
        let back = spec.unapply(&rotated).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn ror_directive_round_trips_through_resolve_spec() {
        let spec = resolve_spec("ror(3)", |_| Ok(crate::value::Value::signed(4, 3))).unwrap();
        assert_eq!(spec, ProcessSpec::Rotate(3, RotateDirection::Right));

        let data = [0b1010_0001];
        // ror(3): forward direction (parser) rotates right.
        let rotated = spec.apply(&data).unwrap();
        assert_eq!(rotated, vec![0b0011_0100]);
        let back = spec.unapply(&rotated).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn zlib_round_trips() {
        let spec = ProcessSpec::Zlib;
        let data = b"the quick brown fox jumps over the lazy dog".repeat(4);
        let compressed = spec.unapply(&data).unwrap();
        let decompressed = spec.apply(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn split_directive_with_and_without_param() {
        assert_eq!(
            split_directive("xor(key)").unwrap(),
            ("xor".to_string(), Some("key".to_string()))
        );
        assert_eq!(split_directive("zlib").unwrap(), ("zlib".to_string(), None));
    }

    #[test]
    fn split_directive_rejects_unbalanced() {
        assert!(split_directive("xor(key").is_err());
    }
}
