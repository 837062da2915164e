//! Minimal AMF0 reader, just enough to pull values out of the
//! `@setDataFrame` / `onMetaData` script payload the framer hands us.

use std::collections::HashMap;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0a;
const MARKER_LONG_STRING: u8 = 0x0c;

#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(HashMap<String, AmfValue>),
    Null,
    Undefined,
}

/// Decode as many top-level values as the payload holds. Unknown markers
/// stop the scan; whatever decoded before them is returned.
pub fn decode_all(data: &[u8]) -> Vec<AmfValue> {
    let mut reader = Reader { data, pos: 0 };
    let mut values = Vec::new();
    while !reader.is_empty() {
        match reader.decode() {
            Some(value) => values.push(value),
            None => break,
        }
    }
    values
}

/// Find the object following an `"onMetaData"` string value.
pub fn find_metadata(values: &[AmfValue]) -> Option<&HashMap<String, AmfValue>> {
    let mut seen_marker = false;
    for value in values {
        match value {
            AmfValue::String(s) if s == "onMetaData" => seen_marker = true,
            AmfValue::Object(map) if seen_marker => return Some(map),
            _ => {}
        }
    }
    None
}

/// Read the first of `keys` present in the metadata as a number; strings
/// holding numbers count too (encoders disagree on the type of framerate).
pub fn metadata_number(meta: &HashMap<String, AmfValue>, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match meta.get(*key) {
            Some(AmfValue::Number(n)) => return Some(*n),
            Some(AmfValue::String(s)) => {
                if let Ok(n) = s.parse::<f64>() {
                    return Some(n);
                }
            }
            _ => {}
        }
    }
    None
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        if end > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn read_u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    fn read_u16(&mut self) -> Option<u16> {
        self.take(2).map(|s| u16::from_be_bytes([s[0], s[1]]))
    }

    fn read_u32(&mut self) -> Option<u32> {
        self.take(4).map(|s| u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
    }

    fn read_f64(&mut self) -> Option<f64> {
        self.take(8).map(|s| {
            f64::from_be_bytes([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]])
        })
    }

    fn read_short_string(&mut self) -> Option<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    fn decode(&mut self) -> Option<AmfValue> {
        let marker = self.read_u8()?;
        match marker {
            MARKER_NUMBER => self.read_f64().map(AmfValue::Number),
            MARKER_BOOLEAN => self.read_u8().map(|b| AmfValue::Boolean(b != 0)),
            MARKER_STRING => self.read_short_string().map(AmfValue::String),
            MARKER_LONG_STRING => {
                let len = self.read_u32()? as usize;
                let bytes = self.take(len)?;
                Some(AmfValue::String(String::from_utf8_lossy(bytes).into_owned()))
            }
            MARKER_OBJECT => self.read_pairs().map(AmfValue::Object),
            MARKER_ECMA_ARRAY => {
                self.read_u32()?; // declared length, not trusted
                self.read_pairs().map(AmfValue::Object)
            }
            MARKER_STRICT_ARRAY => {
                let count = self.read_u32()?;
                for _ in 0..count {
                    self.decode()?;
                }
                Some(AmfValue::Undefined)
            }
            MARKER_NULL => Some(AmfValue::Null),
            MARKER_UNDEFINED => Some(AmfValue::Undefined),
            _ => None,
        }
    }

    fn read_pairs(&mut self) -> Option<HashMap<String, AmfValue>> {
        let mut map = HashMap::new();
        loop {
            let key = self.read_short_string()?;
            if key.is_empty() {
                // object-end marker follows the empty key
                let marker = self.read_u8()?;
                if marker == MARKER_OBJECT_END {
                    return Some(map);
                }
                return None;
            }
            let value = self.decode()?;
            map.insert(key, value);
        }
    }
}
