//! The class-file constant pool
//!
//! The pool is parsed verbatim and is append-only thereafter: raw attribute
//! blobs and untouched method bodies keep referring to their original
//! indices, and everything a rewrite needs is interned at the end,
//! deduplicated against what is already there.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use super::insn::Const;
use super::{ReadError, WriteError};

#[derive(Debug, Clone)]
pub enum CpEntry {
    /// Index 0 and the phantom slot after every long/double.
    Unusable,
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index: u16 },
    Str { string_index: u16 },
    FieldRef { class_index: u16, name_and_type_index: u16 },
    MethodRef { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodRef { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<CpEntry>,
}

impl ConstantPool {
    pub fn new() -> ConstantPool {
        ConstantPool {
            entries: vec![CpEntry::Unusable],
        }
    }

    pub fn read(cursor: &mut Cursor<&[u8]>) -> Result<ConstantPool, ReadError> {
        let count = cursor.read_u16::<BigEndian>()? as usize;
        let mut entries = Vec::with_capacity(count);
        entries.push(CpEntry::Unusable);

        let mut index = 1;
        while index < count {
            let tag = cursor.read_u8()?;
            let entry = match tag {
                1 => {
                    let len = cursor.read_u16::<BigEndian>()? as usize;
                    let mut bytes = vec![0u8; len];
                    std::io::Read::read_exact(cursor, &mut bytes)?;
                    CpEntry::Utf8(decode_modified_utf8(&bytes)?)
                }
                3 => CpEntry::Integer(cursor.read_i32::<BigEndian>()?),
                4 => CpEntry::Float(f32::from_bits(cursor.read_u32::<BigEndian>()?)),
                5 => CpEntry::Long(cursor.read_i64::<BigEndian>()?),
                6 => CpEntry::Double(f64::from_bits(cursor.read_u64::<BigEndian>()?)),
                7 => CpEntry::Class { name_index: cursor.read_u16::<BigEndian>()? },
                8 => CpEntry::Str { string_index: cursor.read_u16::<BigEndian>()? },
                9 => CpEntry::FieldRef {
                    class_index: cursor.read_u16::<BigEndian>()?,
                    name_and_type_index: cursor.read_u16::<BigEndian>()?,
                },
                10 => CpEntry::MethodRef {
                    class_index: cursor.read_u16::<BigEndian>()?,
                    name_and_type_index: cursor.read_u16::<BigEndian>()?,
                },
                11 => CpEntry::InterfaceMethodRef {
                    class_index: cursor.read_u16::<BigEndian>()?,
                    name_and_type_index: cursor.read_u16::<BigEndian>()?,
                },
                12 => CpEntry::NameAndType {
                    name_index: cursor.read_u16::<BigEndian>()?,
                    descriptor_index: cursor.read_u16::<BigEndian>()?,
                },
                15 => CpEntry::MethodHandle {
                    reference_kind: cursor.read_u8()?,
                    reference_index: cursor.read_u16::<BigEndian>()?,
                },
                16 => CpEntry::MethodType { descriptor_index: cursor.read_u16::<BigEndian>()? },
                17 => CpEntry::Dynamic {
                    bootstrap_method_attr_index: cursor.read_u16::<BigEndian>()?,
                    name_and_type_index: cursor.read_u16::<BigEndian>()?,
                },
                18 => CpEntry::InvokeDynamic {
                    bootstrap_method_attr_index: cursor.read_u16::<BigEndian>()?,
                    name_and_type_index: cursor.read_u16::<BigEndian>()?,
                },
                19 => CpEntry::Module { name_index: cursor.read_u16::<BigEndian>()? },
                20 => CpEntry::Package { name_index: cursor.read_u16::<BigEndian>()? },
                _ => return Err(ReadError::InvalidConstantPoolTag(tag)),
            };

            let two_slots = tag == 5 || tag == 6;
            entries.push(entry);
            if two_slots {
                entries.push(CpEntry::Unusable);
                index += 2;
            } else {
                index += 1;
            }
        }

        Ok(ConstantPool { entries })
    }

    pub fn write(&self, out: &mut Vec<u8>) -> Result<(), WriteError> {
        if self.entries.len() > u16::MAX as usize {
            return Err(WriteError::ConstantPoolOverflow);
        }
        out.write_u16::<BigEndian>(self.entries.len() as u16).unwrap();
        for entry in self.entries.iter().skip(1) {
            match entry {
                CpEntry::Unusable => {}
                CpEntry::Utf8(value) => {
                    let bytes = encode_modified_utf8(value);
                    out.push(1);
                    out.write_u16::<BigEndian>(bytes.len() as u16).unwrap();
                    out.extend_from_slice(&bytes);
                }
                CpEntry::Integer(value) => {
                    out.push(3);
                    out.write_i32::<BigEndian>(*value).unwrap();
                }
                CpEntry::Float(value) => {
                    out.push(4);
                    out.write_u32::<BigEndian>(value.to_bits()).unwrap();
                }
                CpEntry::Long(value) => {
                    out.push(5);
                    out.write_i64::<BigEndian>(*value).unwrap();
                }
                CpEntry::Double(value) => {
                    out.push(6);
                    out.write_u64::<BigEndian>(value.to_bits()).unwrap();
                }
                CpEntry::Class { name_index } => {
                    out.push(7);
                    out.write_u16::<BigEndian>(*name_index).unwrap();
                }
                CpEntry::Str { string_index } => {
                    out.push(8);
                    out.write_u16::<BigEndian>(*string_index).unwrap();
                }
                CpEntry::FieldRef { class_index, name_and_type_index } => {
                    out.push(9);
                    out.write_u16::<BigEndian>(*class_index).unwrap();
                    out.write_u16::<BigEndian>(*name_and_type_index).unwrap();
                }
                CpEntry::MethodRef { class_index, name_and_type_index } => {
                    out.push(10);
                    out.write_u16::<BigEndian>(*class_index).unwrap();
                    out.write_u16::<BigEndian>(*name_and_type_index).unwrap();
                }
                CpEntry::InterfaceMethodRef { class_index, name_and_type_index } => {
                    out.push(11);
                    out.write_u16::<BigEndian>(*class_index).unwrap();
                    out.write_u16::<BigEndian>(*name_and_type_index).unwrap();
                }
                CpEntry::NameAndType { name_index, descriptor_index } => {
                    out.push(12);
                    out.write_u16::<BigEndian>(*name_index).unwrap();
                    out.write_u16::<BigEndian>(*descriptor_index).unwrap();
                }
                CpEntry::MethodHandle { reference_kind, reference_index } => {
                    out.push(15);
                    out.push(*reference_kind);
                    out.write_u16::<BigEndian>(*reference_index).unwrap();
                }
                CpEntry::MethodType { descriptor_index } => {
                    out.push(16);
                    out.write_u16::<BigEndian>(*descriptor_index).unwrap();
                }
                CpEntry::Dynamic { bootstrap_method_attr_index, name_and_type_index } => {
                    out.push(17);
                    out.write_u16::<BigEndian>(*bootstrap_method_attr_index).unwrap();
                    out.write_u16::<BigEndian>(*name_and_type_index).unwrap();
                }
                CpEntry::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index } => {
                    out.push(18);
                    out.write_u16::<BigEndian>(*bootstrap_method_attr_index).unwrap();
                    out.write_u16::<BigEndian>(*name_and_type_index).unwrap();
                }
                CpEntry::Module { name_index } => {
                    out.push(19);
                    out.write_u16::<BigEndian>(*name_index).unwrap();
                }
                CpEntry::Package { name_index } => {
                    out.push(20);
                    out.write_u16::<BigEndian>(*name_index).unwrap();
                }
            }
        }
        Ok(())
    }

    pub fn entry(&self, index: u16) -> Result<&CpEntry, ReadError> {
        self.entries
            .get(index as usize)
            .ok_or(ReadError::InvalidConstantPoolIndex(index))
    }

    pub fn utf8(&self, index: u16) -> Result<&str, ReadError> {
        match self.entry(index)? {
            CpEntry::Utf8(value) => Ok(value),
            _ => Err(ReadError::InvalidConstantPoolIndex(index)),
        }
    }

    pub fn class_name(&self, index: u16) -> Result<&str, ReadError> {
        match self.entry(index)? {
            CpEntry::Class { name_index } => self.utf8(*name_index),
            _ => Err(ReadError::InvalidConstantPoolIndex(index)),
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str), ReadError> {
        match self.entry(index)? {
            CpEntry::NameAndType { name_index, descriptor_index } => {
                Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?))
            }
            _ => Err(ReadError::InvalidConstantPoolIndex(index)),
        }
    }

    pub fn field_ref(&self, index: u16) -> Result<(&str, &str, &str), ReadError> {
        match self.entry(index)? {
            CpEntry::FieldRef { class_index, name_and_type_index } => {
                let owner = self.class_name(*class_index)?;
                let (name, desc) = self.name_and_type(*name_and_type_index)?;
                Ok((owner, name, desc))
            }
            _ => Err(ReadError::InvalidConstantPoolIndex(index)),
        }
    }

    /// Owner, name, descriptor and whether the owner is an interface.
    pub fn method_ref(&self, index: u16) -> Result<(&str, &str, &str, bool), ReadError> {
        match self.entry(index)? {
            CpEntry::MethodRef { class_index, name_and_type_index } => {
                let owner = self.class_name(*class_index)?;
                let (name, desc) = self.name_and_type(*name_and_type_index)?;
                Ok((owner, name, desc, false))
            }
            CpEntry::InterfaceMethodRef { class_index, name_and_type_index } => {
                let owner = self.class_name(*class_index)?;
                let (name, desc) = self.name_and_type(*name_and_type_index)?;
                Ok((owner, name, desc, true))
            }
            _ => Err(ReadError::InvalidConstantPoolIndex(index)),
        }
    }

    pub fn invoke_dynamic_descriptor(&self, index: u16) -> Result<&str, ReadError> {
        match self.entry(index)? {
            CpEntry::InvokeDynamic { name_and_type_index, .. } => {
                Ok(self.name_and_type(*name_and_type_index)?.1)
            }
            _ => Err(ReadError::InvalidConstantPoolIndex(index)),
        }
    }

    /// The descriptor of a `CONSTANT_Dynamic` entry.
    pub fn dynamic_descriptor(&self, index: u16) -> Result<&str, ReadError> {
        match self.entry(index)? {
            CpEntry::Dynamic { name_and_type_index, .. } => {
                Ok(self.name_and_type(*name_and_type_index)?.1)
            }
            _ => Err(ReadError::InvalidConstantPoolIndex(index)),
        }
    }

    /// Resolves the operand of an `ldc`-family instruction to its symbolic
    /// form. Method handles and dynamic constants stay by-index; they only
    /// make sense inside this pool.
    pub fn loadable(&self, index: u16, wide: bool) -> Result<Const, ReadError> {
        let value = match self.entry(index)? {
            CpEntry::Integer(v) => Const::Int(*v),
            CpEntry::Float(v) => Const::Float(*v),
            CpEntry::Long(v) => Const::Long(*v),
            CpEntry::Double(v) => Const::Double(*v),
            CpEntry::Str { string_index } => Const::Str(self.utf8(*string_index)?.to_string()),
            CpEntry::Class { name_index } => Const::Class(self.utf8(*name_index)?.to_string()),
            CpEntry::MethodType { descriptor_index } => {
                Const::MethodType(self.utf8(*descriptor_index)?.to_string())
            }
            CpEntry::MethodHandle { .. } | CpEntry::Dynamic { .. } => {
                Const::Pooled { index, wide }
            }
            _ => return Err(ReadError::InvalidConstantPoolIndex(index)),
        };
        Ok(value)
    }

    fn push(&mut self, entry: CpEntry) -> Result<u16, WriteError> {
        let index = self.entries.len();
        let width = match entry {
            CpEntry::Long(_) | CpEntry::Double(_) => 2,
            _ => 1,
        };
        if index + width > u16::MAX as usize {
            return Err(WriteError::ConstantPoolOverflow);
        }
        self.entries.push(entry);
        if width == 2 {
            self.entries.push(CpEntry::Unusable);
        }
        Ok(index as u16)
    }

    pub fn ensure_utf8(&mut self, value: &str) -> Result<u16, WriteError> {
        for (i, entry) in self.entries.iter().enumerate() {
            if let CpEntry::Utf8(existing) = entry {
                if existing == value {
                    return Ok(i as u16);
                }
            }
        }
        self.push(CpEntry::Utf8(value.to_string()))
    }

    pub fn ensure_class(&mut self, name: &str) -> Result<u16, WriteError> {
        for (i, entry) in self.entries.iter().enumerate() {
            if let CpEntry::Class { name_index } = entry {
                if self.utf8(*name_index).map(|n| n == name).unwrap_or(false) {
                    return Ok(i as u16);
                }
            }
        }
        let name_index = self.ensure_utf8(name)?;
        self.push(CpEntry::Class { name_index })
    }

    pub fn ensure_string(&mut self, value: &str) -> Result<u16, WriteError> {
        for (i, entry) in self.entries.iter().enumerate() {
            if let CpEntry::Str { string_index } = entry {
                if self.utf8(*string_index).map(|s| s == value).unwrap_or(false) {
                    return Ok(i as u16);
                }
            }
        }
        let string_index = self.ensure_utf8(value)?;
        self.push(CpEntry::Str { string_index })
    }

    pub fn ensure_integer(&mut self, value: i32) -> Result<u16, WriteError> {
        for (i, entry) in self.entries.iter().enumerate() {
            if matches!(entry, CpEntry::Integer(v) if *v == value) {
                return Ok(i as u16);
            }
        }
        self.push(CpEntry::Integer(value))
    }

    pub fn ensure_float(&mut self, value: f32) -> Result<u16, WriteError> {
        for (i, entry) in self.entries.iter().enumerate() {
            if matches!(entry, CpEntry::Float(v) if v.to_bits() == value.to_bits()) {
                return Ok(i as u16);
            }
        }
        self.push(CpEntry::Float(value))
    }

    pub fn ensure_long(&mut self, value: i64) -> Result<u16, WriteError> {
        for (i, entry) in self.entries.iter().enumerate() {
            if matches!(entry, CpEntry::Long(v) if *v == value) {
                return Ok(i as u16);
            }
        }
        self.push(CpEntry::Long(value))
    }

    pub fn ensure_double(&mut self, value: f64) -> Result<u16, WriteError> {
        for (i, entry) in self.entries.iter().enumerate() {
            if matches!(entry, CpEntry::Double(v) if v.to_bits() == value.to_bits()) {
                return Ok(i as u16);
            }
        }
        self.push(CpEntry::Double(value))
    }

    pub fn ensure_method_type(&mut self, descriptor: &str) -> Result<u16, WriteError> {
        for (i, entry) in self.entries.iter().enumerate() {
            if let CpEntry::MethodType { descriptor_index } = entry {
                if self.utf8(*descriptor_index).map(|d| d == descriptor).unwrap_or(false) {
                    return Ok(i as u16);
                }
            }
        }
        let descriptor_index = self.ensure_utf8(descriptor)?;
        self.push(CpEntry::MethodType { descriptor_index })
    }

    pub fn ensure_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, WriteError> {
        for (i, entry) in self.entries.iter().enumerate() {
            if let CpEntry::NameAndType { name_index, descriptor_index } = entry {
                let hit = self.utf8(*name_index).map(|n| n == name).unwrap_or(false)
                    && self.utf8(*descriptor_index).map(|d| d == descriptor).unwrap_or(false);
                if hit {
                    return Ok(i as u16);
                }
            }
        }
        let name_index = self.ensure_utf8(name)?;
        let descriptor_index = self.ensure_utf8(descriptor)?;
        self.push(CpEntry::NameAndType { name_index, descriptor_index })
    }

    pub fn ensure_field_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, WriteError> {
        for (i, entry) in self.entries.iter().enumerate() {
            if let CpEntry::FieldRef { class_index, name_and_type_index } = entry {
                if self.member_matches(*class_index, *name_and_type_index, owner, name, descriptor) {
                    return Ok(i as u16);
                }
            }
        }
        let class_index = self.ensure_class(owner)?;
        let name_and_type_index = self.ensure_name_and_type(name, descriptor)?;
        self.push(CpEntry::FieldRef { class_index, name_and_type_index })
    }

    pub fn ensure_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        interface: bool,
    ) -> Result<u16, WriteError> {
        for (i, entry) in self.entries.iter().enumerate() {
            let (class_index, name_and_type_index) = match entry {
                CpEntry::MethodRef { class_index, name_and_type_index } if !interface => {
                    (*class_index, *name_and_type_index)
                }
                CpEntry::InterfaceMethodRef { class_index, name_and_type_index } if interface => {
                    (*class_index, *name_and_type_index)
                }
                _ => continue,
            };
            if self.member_matches(class_index, name_and_type_index, owner, name, descriptor) {
                return Ok(i as u16);
            }
        }
        let class_index = self.ensure_class(owner)?;
        let name_and_type_index = self.ensure_name_and_type(name, descriptor)?;
        let entry = if interface {
            CpEntry::InterfaceMethodRef { class_index, name_and_type_index }
        } else {
            CpEntry::MethodRef { class_index, name_and_type_index }
        };
        self.push(entry)
    }

    fn member_matches(
        &self,
        class_index: u16,
        name_and_type_index: u16,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> bool {
        self.class_name(class_index).map(|c| c == owner).unwrap_or(false)
            && self
                .name_and_type(name_and_type_index)
                .map(|(n, d)| n == name && d == descriptor)
                .unwrap_or(false)
    }
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

/// The JVM's modified UTF-8: no embedded NUL bytes, supplementary characters
/// as surrogate pairs of 3-byte sequences.
fn decode_modified_utf8(bytes: &[u8]) -> Result<String, ReadError> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b & 0x80 == 0 {
            units.push(b as u16);
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            let b2 = *bytes.get(i + 1).ok_or(ReadError::MalformedUtf8)?;
            if b2 & 0xC0 != 0x80 {
                return Err(ReadError::MalformedUtf8);
            }
            units.push((((b & 0x1F) as u16) << 6) | (b2 & 0x3F) as u16);
            i += 2;
        } else if b & 0xF0 == 0xE0 {
            let b2 = *bytes.get(i + 1).ok_or(ReadError::MalformedUtf8)?;
            let b3 = *bytes.get(i + 2).ok_or(ReadError::MalformedUtf8)?;
            if b2 & 0xC0 != 0x80 || b3 & 0xC0 != 0x80 {
                return Err(ReadError::MalformedUtf8);
            }
            units.push((((b & 0x0F) as u16) << 12) | (((b2 & 0x3F) as u16) << 6) | (b3 & 0x3F) as u16);
            i += 3;
        } else {
            return Err(ReadError::MalformedUtf8);
        }
    }
    String::from_utf16(&units).map_err(|_| ReadError::MalformedUtf8)
}

fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_deduplicates() {
        let mut pool = ConstantPool::new();
        let a = pool.ensure_utf8("hello").unwrap();
        let b = pool.ensure_utf8("hello").unwrap();
        assert_eq!(a, b);
        let c = pool.ensure_class("java/lang/Object").unwrap();
        let d = pool.ensure_class("java/lang/Object").unwrap();
        assert_eq!(c, d);
        let m1 = pool.ensure_method_ref("a/B", "m", "()V", false).unwrap();
        let m2 = pool.ensure_method_ref("a/B", "m", "()V", false).unwrap();
        let m3 = pool.ensure_method_ref("a/B", "m", "()V", true).unwrap();
        assert_eq!(m1, m2);
        assert_ne!(m1, m3);
    }

    #[test]
    fn longs_take_two_slots() {
        let mut pool = ConstantPool::new();
        let l = pool.ensure_long(42).unwrap();
        let next = pool.ensure_utf8("after").unwrap();
        assert_eq!(next, l + 2);
    }

    #[test]
    fn modified_utf8_round_trip() {
        for s in ["plain", "nul\u{0}inside", "caf\u{e9}", "\u{10348}"] {
            let encoded = encode_modified_utf8(s);
            assert_eq!(decode_modified_utf8(&encoded).unwrap(), s);
            // no embedded NUL bytes, ever
            assert!(!encoded.contains(&0));
        }
    }
}
