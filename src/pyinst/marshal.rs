//! Reader for the subset of CPython's `marshal` format used by PYZ tables.
//!
//! Covers scalars, strings, containers and back-references. Code objects are
//! rejected; a PYZ table never contains them.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use anyhow::{Result, bail};

const FLAG_REF: u8 = 0x80;
const MAX_DEPTH: usize = 200;

/// A decoded marshal value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    None,
    Bool(bool),
    StopIteration,
    Ellipsis,
    Int(i64),
    Float(f64),
    Complex(f64, f64),
    Bytes(Vec<u8>),
    Str(String),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Elements of a tuple or list
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) | Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::StopIteration => "StopIteration",
            Value::Ellipsis => "Ellipsis",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Complex(..) => "complex",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
        }
    }
}

/// Decode one value from the start of `data`
pub fn loads(data: &[u8]) -> Result<Value> {
    let mut reader = Reader {
        cursor: Cursor::new(data),
        refs: Vec::new(),
        depth: 0,
    };
    let value = reader.read_object()?;
    log::debug!(
        "unmarshalled {} from {} of {} bytes",
        value.type_name(),
        reader.cursor.position(),
        data.len()
    );
    Ok(value)
}

struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
    refs: Vec<Option<Value>>,
    depth: usize,
}

impl Reader<'_> {
    fn read_object(&mut self) -> Result<Value> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            bail!("marshal data nested deeper than {}", MAX_DEPTH);
        }
        let result = self.read_object_inner();
        self.depth -= 1;
        result
    }

    fn read_object_inner(&mut self) -> Result<Value> {
        let code = self.cursor.read_u8()?;
        let flagged = code & FLAG_REF != 0;
        let kind = code & !FLAG_REF;

        // Containers reserve their slot before their children are read
        let slot = if flagged {
            self.refs.push(None);
            Some(self.refs.len() - 1)
        } else {
            None
        };

        let value = match kind {
            b'0' => Value::Null,
            b'N' => Value::None,
            b'F' => Value::Bool(false),
            b'T' => Value::Bool(true),
            b'S' => Value::StopIteration,
            b'.' => Value::Ellipsis,
            b'i' => Value::Int(self.cursor.read_i32::<LittleEndian>()? as i64),
            b'I' => Value::Int(self.cursor.read_i64::<LittleEndian>()?),
            b'l' => Value::Int(self.read_long()?),
            b'g' => Value::Float(self.cursor.read_f64::<LittleEndian>()?),
            b'f' => Value::Float(self.read_text_float()?),
            b'y' => {
                let re = self.cursor.read_f64::<LittleEndian>()?;
                let im = self.cursor.read_f64::<LittleEndian>()?;
                Value::Complex(re, im)
            }
            b's' => {
                let n = self.read_len()?;
                Value::Bytes(self.read_bytes(n)?)
            }
            b't' | b'u' | b'a' | b'A' => {
                let n = self.read_len()?;
                Value::Str(self.read_str(n)?)
            }
            b'z' | b'Z' => {
                let n = self.cursor.read_u8()? as usize;
                Value::Str(self.read_str(n)?)
            }
            b'(' => {
                let n = self.read_len()?;
                Value::Tuple(self.read_items(n)?)
            }
            b')' => {
                let n = self.cursor.read_u8()? as usize;
                Value::Tuple(self.read_items(n)?)
            }
            b'[' => {
                let n = self.read_len()?;
                Value::List(self.read_items(n)?)
            }
            b'<' | b'>' => {
                let n = self.read_len()?;
                Value::Set(self.read_items(n)?)
            }
            b'{' => {
                let mut pairs = Vec::new();
                loop {
                    let key = self.read_object()?;
                    if key == Value::Null {
                        break;
                    }
                    let value = self.read_object()?;
                    pairs.push((key, value));
                }
                Value::Dict(pairs)
            }
            b'r' => {
                let index = self.cursor.read_u32::<LittleEndian>()? as usize;
                match self.refs.get(index) {
                    Some(Some(v)) => v.clone(),
                    Some(None) => bail!("marshal reference {} points at an unfinished object", index),
                    None => bail!("marshal reference {} out of range", index),
                }
            }
            b'c' => bail!("code objects are not supported in a PYZ table"),
            other => bail!(
                "unknown marshal type code {:#04x} at offset {}",
                other,
                self.cursor.position() - 1
            ),
        };

        if let Some(slot) = slot {
            self.refs[slot] = Some(value.clone());
        }
        Ok(value)
    }

    fn read_len(&mut self) -> Result<usize> {
        let n = self.cursor.read_i32::<LittleEndian>()?;
        let remaining = self.cursor.get_ref().len() as u64 - self.cursor.position();
        match usize::try_from(n) {
            // Every element takes at least one byte
            Ok(n) if n as u64 <= remaining => Ok(n),
            _ => bail!("bad marshal length {}", n),
        }
    }

    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_str(&mut self, n: usize) -> Result<String> {
        let raw = self.read_bytes(n)?;
        Ok(String::from_utf8(raw)?)
    }

    fn read_items(&mut self, n: usize) -> Result<Vec<Value>> {
        (0..n).map(|_| self.read_object()).collect()
    }

    /// Arbitrary precision int stored as 15-bit digits, least significant first
    fn read_long(&mut self) -> Result<i64> {
        let n = self.cursor.read_i32::<LittleEndian>()?;
        let digits = n.unsigned_abs() as usize;
        let mut value: i128 = 0;
        for i in 0..digits {
            let digit = self.cursor.read_u16::<LittleEndian>()? as i128;
            if digit >= 1 << 15 {
                bail!("bad marshal long digit");
            }
            if i >= 5 {
                if digit != 0 {
                    bail!("marshal long does not fit in 64 bits");
                }
                continue;
            }
            value |= digit << (15 * i);
        }
        if n < 0 {
            value = -value;
        }
        i64::try_from(value).map_err(|_| anyhow::anyhow!("marshal long does not fit in 64 bits"))
    }

    fn read_text_float(&mut self) -> Result<f64> {
        let n = self.cursor.read_u8()? as usize;
        let text = self.read_str(n)?;
        Ok(text.trim().parse()?)
    }
}
