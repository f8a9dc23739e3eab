use std::collections::BTreeMap;

use anyhow::anyhow;

use crate::error::Result;

/// A decoded bencode value. Strings are kept as raw bytes since the
/// metainfo `pieces` field and compact tracker responses are binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bencode {
    Bytes(Vec<u8>),
    Int(i64),
    List(Vec<Bencode>),
    Dict(BTreeMap<String, Bencode>),
}

impl Bencode {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Bencode::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<String> {
        self.as_bytes()
            .map(|b| String::from_utf8_lossy(b).to_string())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Bencode::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Bencode]> {
        match self {
            Bencode::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Bencode>> {
        match self {
            Bencode::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Decodes the first bencode value in `bytes`, returning the number of
/// bytes consumed alongside the value.
pub fn decode(bytes: &[u8]) -> Result<(usize, Bencode)> {
    match bytes.first() {
        Some(b'i') => decode_int(bytes),
        Some(b'l') => decode_list(bytes),
        Some(b'd') => decode_dict(bytes),
        Some(b'0'..=b'9') => decode_bytes(bytes),
        Some(c) => Err(anyhow!("unexpected bencode prefix byte {:#x}", c)),
        None => Err(anyhow!("empty bencode input")),
    }
}

fn decode_int(bytes: &[u8]) -> Result<(usize, Bencode)> {
    let end = bytes
        .iter()
        .position(|b| *b == b'e')
        .ok_or_else(|| anyhow!("unterminated integer"))?;
    let digits = std::str::from_utf8(&bytes[1..end])?;
    let value: i64 = digits.parse()?;
    Ok((end + 1, Bencode::Int(value)))
}

fn decode_bytes(bytes: &[u8]) -> Result<(usize, Bencode)> {
    let colon = bytes
        .iter()
        .position(|b| *b == b':')
        .ok_or_else(|| anyhow!("string length without colon"))?;
    let len: usize = std::str::from_utf8(&bytes[..colon])?.parse()?;
    let start = colon + 1;
    if bytes.len() < start + len {
        return Err(anyhow!(
            "string claims {} bytes but only {} remain",
            len,
            bytes.len() - start
        ));
    }
    Ok((start + len, Bencode::Bytes(bytes[start..start + len].to_vec())))
}

fn decode_list(bytes: &[u8]) -> Result<(usize, Bencode)> {
    let mut idx = 1;
    let mut items = Vec::new();
    loop {
        match bytes.get(idx) {
            Some(b'e') => return Ok((idx + 1, Bencode::List(items))),
            Some(_) => {
                let (n, item) = decode(&bytes[idx..])?;
                items.push(item);
                idx += n;
            }
            None => return Err(anyhow!("unterminated list")),
        }
    }
}

fn decode_dict(bytes: &[u8]) -> Result<(usize, Bencode)> {
    let mut idx = 1;
    let mut entries = BTreeMap::new();
    loop {
        match bytes.get(idx) {
            Some(b'e') => return Ok((idx + 1, Bencode::Dict(entries))),
            Some(_) => {
                let (n, key) = decode(&bytes[idx..])?;
                let key = key
                    .as_str()
                    .ok_or_else(|| anyhow!("dictionary key is not a string"))?;
                idx += n;
                if bytes.get(idx).is_none() || bytes[idx] == b'e' {
                    return Err(anyhow!("dictionary entry {:?} is missing a value", key));
                }
                let (n, value) = decode(&bytes[idx..])?;
                entries.insert(key, value);
                idx += n;
            }
            None => return Err(anyhow!("unterminated dictionary")),
        }
    }
}

/// Locates the byte range of the value stored under the top-level `info`
/// key. The info-hash is the SHA-1 over exactly these bytes, so the span
/// must cover the encoded value verbatim.
pub fn info_span(bytes: &[u8]) -> Result<(usize, usize)> {
    if bytes.first() != Some(&b'd') {
        return Err(anyhow!("torrent root is not a dictionary"));
    }
    let mut idx = 1;
    loop {
        match bytes.get(idx) {
            Some(b'e') | None => return Err(anyhow!("no info key found")),
            Some(_) => {
                let (n, key) = decode(&bytes[idx..])?;
                let key = key
                    .as_str()
                    .ok_or_else(|| anyhow!("dictionary key is not a string"))?;
                idx += n;
                let (n, _) = decode(&bytes[idx..])?;
                if key == "info" {
                    return Ok((idx, idx + n));
                }
                idx += n;
            }
        }
    }
}
