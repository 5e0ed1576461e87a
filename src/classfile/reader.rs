//! Class file parsing

use byteorder::{BigEndian, ReadBytesExt};
use std::collections::{BTreeSet, HashMap};
use std::io::{Cursor, Read};

use super::insn::{Body, Handler, Insn, Node};
use super::opcodes::*;
use super::{
    ClassUnit, ConstantPool, FieldUnit, MethodCode, MethodUnit, RawAttribute, RawCode, RawHandler,
    ReadError,
};

const MAGIC: u32 = 0xCAFE_BABE;

/// Parses a class file. Method bodies stay raw until a patch asks to edit
/// them; fields and unfamiliar attributes are carried as opaque blobs.
pub fn read_class(bytes: &[u8]) -> Result<ClassUnit, ReadError> {
    let mut cursor = Cursor::new(bytes);
    if cursor.read_u32::<BigEndian>()? != MAGIC {
        return Err(ReadError::BadMagic);
    }
    let minor_version = cursor.read_u16::<BigEndian>()?;
    let major_version = cursor.read_u16::<BigEndian>()?;
    let pool = ConstantPool::read(&mut cursor)?;
    let access_flags = cursor.read_u16::<BigEndian>()?;
    let this_class = cursor.read_u16::<BigEndian>()?;
    let super_class = cursor.read_u16::<BigEndian>()?;
    let name = pool.class_name(this_class)?.to_string();

    let interface_count = cursor.read_u16::<BigEndian>()? as usize;
    let mut interfaces = Vec::with_capacity(interface_count);
    for _ in 0..interface_count {
        interfaces.push(cursor.read_u16::<BigEndian>()?);
    }

    let field_count = cursor.read_u16::<BigEndian>()? as usize;
    let mut fields = Vec::with_capacity(field_count);
    for _ in 0..field_count {
        let access_flags = cursor.read_u16::<BigEndian>()?;
        let name = pool.utf8(cursor.read_u16::<BigEndian>()?)?.to_string();
        let descriptor = pool.utf8(cursor.read_u16::<BigEndian>()?)?.to_string();
        let (attributes, _) = read_attributes(&mut cursor, &pool, false)?;
        fields.push(FieldUnit {
            access_flags,
            name,
            descriptor,
            constant: None,
            attributes,
        });
    }

    let method_count = cursor.read_u16::<BigEndian>()? as usize;
    let mut methods = Vec::with_capacity(method_count);
    for _ in 0..method_count {
        let access_flags = cursor.read_u16::<BigEndian>()?;
        let name = pool.utf8(cursor.read_u16::<BigEndian>()?)?.to_string();
        let descriptor = pool.utf8(cursor.read_u16::<BigEndian>()?)?.to_string();
        let (attributes, code) = read_attributes(&mut cursor, &pool, true)?;
        methods.push(MethodUnit {
            access_flags,
            name,
            descriptor,
            code: code.map(MethodCode::Raw),
            attributes,
        });
    }

    let (attributes, _) = read_attributes(&mut cursor, &pool, false)?;

    Ok(ClassUnit {
        minor_version,
        major_version,
        pool,
        access_flags,
        this_class,
        super_class,
        name,
        interfaces,
        fields,
        methods,
        attributes,
    })
}

fn read_attributes(
    cursor: &mut Cursor<&[u8]>,
    pool: &ConstantPool,
    split_code: bool,
) -> Result<(Vec<RawAttribute>, Option<RawCode>), ReadError> {
    let count = cursor.read_u16::<BigEndian>()? as usize;
    let mut attributes = Vec::with_capacity(count);
    let mut code = None;
    for _ in 0..count {
        let name = pool.utf8(cursor.read_u16::<BigEndian>()?)?.to_string();
        let length = cursor.read_u32::<BigEndian>()? as usize;
        let mut info = vec![0u8; length];
        cursor.read_exact(&mut info)?;
        if split_code && name == "Code" && code.is_none() {
            code = Some(read_code(&info, pool)?);
        } else {
            attributes.push(RawAttribute { name, info });
        }
    }
    Ok((attributes, code))
}

fn read_code(info: &[u8], pool: &ConstantPool) -> Result<RawCode, ReadError> {
    let mut cursor = Cursor::new(info);
    let max_stack = cursor.read_u16::<BigEndian>()?;
    let max_locals = cursor.read_u16::<BigEndian>()?;
    let code_length = cursor.read_u32::<BigEndian>()? as usize;
    let mut code = vec![0u8; code_length];
    cursor.read_exact(&mut code)?;

    let handler_count = cursor.read_u16::<BigEndian>()? as usize;
    let mut exceptions = Vec::with_capacity(handler_count);
    for _ in 0..handler_count {
        exceptions.push(RawHandler {
            start_pc: cursor.read_u16::<BigEndian>()?,
            end_pc: cursor.read_u16::<BigEndian>()?,
            handler_pc: cursor.read_u16::<BigEndian>()?,
            catch_type: cursor.read_u16::<BigEndian>()?,
        });
    }

    let inner: &[u8] = &info[cursor.position() as usize..];
    let mut inner_cursor = Cursor::new(inner);
    let (attributes, _) = read_attributes(&mut inner_cursor, pool, false)?;

    Ok(RawCode {
        max_stack,
        max_locals,
        code,
        exceptions,
        attributes,
    })
}

/// Decodes a raw body into the symbolic node list.
pub(super) fn parse_code(raw: &RawCode, pool: &ConstantPool) -> Result<Body, ReadError> {
    let decoded = decode_instructions(&raw.code, pool)?;
    let offsets: BTreeSet<u32> = decoded.iter().map(|(off, _)| *off).collect();

    // every offset that needs a label
    let mut label_offsets = BTreeSet::new();
    let require = |off: u32| -> Result<u32, ReadError> {
        if offsets.contains(&off) || off == raw.code.len() as u32 {
            Ok(off)
        } else {
            Err(ReadError::BadBranchTarget(off))
        }
    };
    for (_, insn) in &decoded {
        match insn {
            Decoded::Jump { target, .. } => {
                label_offsets.insert(require(*target)?);
            }
            Decoded::TableSwitch { default, targets, .. } => {
                label_offsets.insert(require(*default)?);
                for t in targets {
                    label_offsets.insert(require(*t)?);
                }
            }
            Decoded::LookupSwitch { default, pairs } => {
                label_offsets.insert(require(*default)?);
                for (_, t) in pairs {
                    label_offsets.insert(require(*t)?);
                }
            }
            _ => {}
        }
    }
    for handler in &raw.exceptions {
        label_offsets.insert(require(handler.start_pc as u32)?);
        label_offsets.insert(require(handler.end_pc as u32)?);
        label_offsets.insert(require(handler.handler_pc as u32)?);
    }

    let label_of: HashMap<u32, u32> = label_offsets
        .iter()
        .enumerate()
        .map(|(i, off)| (*off, i as u32))
        .collect();
    let next_label = label_of.len() as u32;

    let lines = line_table(raw);

    let mut body = Body::with_labels(next_label);
    body.max_stack = raw.max_stack;
    body.max_locals = raw.max_locals;
    for (offset, insn) in decoded {
        if let Some(label) = label_of.get(&offset) {
            body.nodes.push(Node::Label(*label));
        }
        if let Some(line) = lines.get(&offset) {
            body.nodes.push(Node::Line(*line));
        }
        body.nodes.push(Node::Insn(finish_insn(insn, &label_of)));
    }
    if let Some(label) = label_of.get(&(raw.code.len() as u32)) {
        body.nodes.push(Node::Label(*label));
    }

    for handler in &raw.exceptions {
        let catch_type = if handler.catch_type == 0 {
            None
        } else {
            Some(pool.class_name(handler.catch_type)?.to_string())
        };
        body.handlers.push(Handler {
            start: label_of[&(handler.start_pc as u32)],
            end: label_of[&(handler.end_pc as u32)],
            handler: label_of[&(handler.handler_pc as u32)],
            catch_type,
        });
    }

    Ok(body)
}

fn line_table(raw: &RawCode) -> HashMap<u32, u16> {
    let mut lines = HashMap::new();
    for attr in &raw.attributes {
        if attr.name != "LineNumberTable" {
            continue;
        }
        let mut cursor = Cursor::new(attr.info.as_slice());
        let Ok(count) = cursor.read_u16::<BigEndian>() else { continue };
        for _ in 0..count {
            let (Ok(pc), Ok(line)) = (
                cursor.read_u16::<BigEndian>(),
                cursor.read_u16::<BigEndian>(),
            ) else {
                break;
            };
            lines.entry(pc as u32).or_insert(line);
        }
    }
    lines
}

/// Decoded instruction whose branch operands are still byte offsets.
enum Decoded {
    Done(Insn),
    Jump { opcode: u8, target: u32 },
    TableSwitch { default: u32, low: i32, high: i32, targets: Vec<u32> },
    LookupSwitch { default: u32, pairs: Vec<(i32, u32)> },
}

fn finish_insn(decoded: Decoded, label_of: &HashMap<u32, u32>) -> Insn {
    match decoded {
        Decoded::Done(insn) => insn,
        Decoded::Jump { opcode, target } => Insn::Jump {
            opcode,
            target: label_of[&target],
        },
        Decoded::TableSwitch { default, low, high, targets } => Insn::TableSwitch {
            default: label_of[&default],
            low,
            high,
            targets: targets.into_iter().map(|t| label_of[&t]).collect(),
        },
        Decoded::LookupSwitch { default, pairs } => Insn::LookupSwitch {
            default: label_of[&default],
            pairs: pairs.into_iter().map(|(k, t)| (k, label_of[&t])).collect(),
        },
    }
}

fn decode_instructions(code: &[u8], pool: &ConstantPool) -> Result<Vec<(u32, Decoded)>, ReadError> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < code.len() {
        let offset = pos as u32;
        let opcode = code[pos];
        pos += 1;
        let insn = match opcode {
            0x00..=0x0F => Decoded::Done(Insn::Simple(opcode)),
            BIPUSH => Decoded::Done(Insn::Push {
                opcode,
                operand: read_i8(code, &mut pos)? as i32,
            }),
            SIPUSH => Decoded::Done(Insn::Push {
                opcode,
                operand: read_i16(code, &mut pos)? as i32,
            }),
            LDC => {
                let index = read_u8(code, &mut pos)? as u16;
                Decoded::Done(Insn::Ldc(pool.loadable(index, false)?))
            }
            LDC_W => {
                let index = read_u16(code, &mut pos)?;
                Decoded::Done(Insn::Ldc(pool.loadable(index, false)?))
            }
            LDC2_W => {
                let index = read_u16(code, &mut pos)?;
                Decoded::Done(Insn::Ldc(pool.loadable(index, true)?))
            }
            ILOAD..=ALOAD => Decoded::Done(Insn::Var {
                opcode,
                index: read_u8(code, &mut pos)? as u16,
            }),
            // iload_0 .. aload_3
            0x1A..=0x2D => Decoded::Done(Insn::Var {
                opcode: ILOAD + (opcode - 0x1A) / 4,
                index: ((opcode - 0x1A) % 4) as u16,
            }),
            0x2E..=0x35 => Decoded::Done(Insn::Simple(opcode)),
            ISTORE..=ASTORE => Decoded::Done(Insn::Var {
                opcode,
                index: read_u8(code, &mut pos)? as u16,
            }),
            // istore_0 .. astore_3
            0x3B..=0x4E => Decoded::Done(Insn::Var {
                opcode: ISTORE + (opcode - 0x3B) / 4,
                index: ((opcode - 0x3B) % 4) as u16,
            }),
            0x4F..=0x83 => Decoded::Done(Insn::Simple(opcode)),
            IINC => Decoded::Done(Insn::Iinc {
                index: read_u8(code, &mut pos)? as u16,
                delta: read_i8(code, &mut pos)? as i16,
            }),
            0x85..=0x98 => Decoded::Done(Insn::Simple(opcode)),
            0x99..=0xA8 | IFNULL | IFNONNULL => {
                let delta = read_i16(code, &mut pos)? as i32;
                Decoded::Jump {
                    opcode,
                    target: (offset as i32 + delta) as u32,
                }
            }
            GOTO_W | JSR_W => {
                let delta = read_i32(code, &mut pos)?;
                Decoded::Jump {
                    opcode: if opcode == GOTO_W { GOTO } else { JSR },
                    target: (offset as i32 + delta) as u32,
                }
            }
            RET => Decoded::Done(Insn::Var {
                opcode,
                index: read_u8(code, &mut pos)? as u16,
            }),
            TABLESWITCH => {
                skip_padding(&mut pos);
                let default = (offset as i32 + read_i32(code, &mut pos)?) as u32;
                let low = read_i32(code, &mut pos)?;
                let high = read_i32(code, &mut pos)?;
                let count = if high < low { 0 } else { (high - low + 1) as usize };
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    targets.push((offset as i32 + read_i32(code, &mut pos)?) as u32);
                }
                Decoded::TableSwitch { default, low, high, targets }
            }
            LOOKUPSWITCH => {
                skip_padding(&mut pos);
                let default = (offset as i32 + read_i32(code, &mut pos)?) as u32;
                let npairs = read_i32(code, &mut pos)? as usize;
                let mut pairs = Vec::with_capacity(npairs);
                for _ in 0..npairs {
                    let key = read_i32(code, &mut pos)?;
                    let target = (offset as i32 + read_i32(code, &mut pos)?) as u32;
                    pairs.push((key, target));
                }
                Decoded::LookupSwitch { default, pairs }
            }
            0xAC..=0xB1 => Decoded::Done(Insn::Simple(opcode)),
            GETSTATIC..=PUTFIELD => {
                let index = read_u16(code, &mut pos)?;
                let (owner, name, descriptor) = pool.field_ref(index)?;
                Decoded::Done(Insn::Field {
                    opcode,
                    owner: owner.to_string(),
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                })
            }
            INVOKEVIRTUAL..=INVOKESTATIC => {
                let index = read_u16(code, &mut pos)?;
                let (owner, name, descriptor, interface) = pool.method_ref(index)?;
                Decoded::Done(Insn::Method {
                    opcode,
                    owner: owner.to_string(),
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                    interface,
                })
            }
            INVOKEINTERFACE => {
                let index = read_u16(code, &mut pos)?;
                let _count = read_u8(code, &mut pos)?;
                let _zero = read_u8(code, &mut pos)?;
                let (owner, name, descriptor, _) = pool.method_ref(index)?;
                Decoded::Done(Insn::Method {
                    opcode,
                    owner: owner.to_string(),
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                    interface: true,
                })
            }
            INVOKEDYNAMIC => {
                let index = read_u16(code, &mut pos)?;
                let _zero = read_u16(code, &mut pos)?;
                let descriptor = pool.invoke_dynamic_descriptor(index)?.to_string();
                Decoded::Done(Insn::InvokeDynamic { index, descriptor })
            }
            NEW | ANEWARRAY | CHECKCAST | 0xC1 => {
                let index = read_u16(code, &mut pos)?;
                Decoded::Done(Insn::Type {
                    opcode,
                    class_name: pool.class_name(index)?.to_string(),
                })
            }
            NEWARRAY => Decoded::Done(Insn::Push {
                opcode,
                operand: read_u8(code, &mut pos)? as i32,
            }),
            0xBE | 0xBF | 0xC2 | 0xC3 => Decoded::Done(Insn::Simple(opcode)),
            WIDE => {
                let wide_opcode = read_u8(code, &mut pos)?;
                match wide_opcode {
                    ILOAD..=ALOAD | ISTORE..=ASTORE | RET => Decoded::Done(Insn::Var {
                        opcode: wide_opcode,
                        index: read_u16(code, &mut pos)?,
                    }),
                    IINC => Decoded::Done(Insn::Iinc {
                        index: read_u16(code, &mut pos)?,
                        delta: read_i16(code, &mut pos)?,
                    }),
                    _ => {
                        return Err(ReadError::InvalidOpcode {
                            opcode: wide_opcode,
                            offset: pos - 1,
                        })
                    }
                }
            }
            MULTIANEWARRAY => {
                let index = read_u16(code, &mut pos)?;
                let dimensions = read_u8(code, &mut pos)?;
                Decoded::Done(Insn::MultiANewArray {
                    class_name: pool.class_name(index)?.to_string(),
                    dimensions,
                })
            }
            _ => {
                return Err(ReadError::InvalidOpcode {
                    opcode,
                    offset: offset as usize,
                })
            }
        };
        out.push((offset, insn));
    }
    Ok(out)
}

fn skip_padding(pos: &mut usize) {
    *pos += (4 - (*pos % 4)) % 4;
}

fn read_u8(code: &[u8], pos: &mut usize) -> Result<u8, ReadError> {
    let value = *code.get(*pos).ok_or(ReadError::Truncated)?;
    *pos += 1;
    Ok(value)
}

fn read_i8(code: &[u8], pos: &mut usize) -> Result<i8, ReadError> {
    Ok(read_u8(code, pos)? as i8)
}

fn read_u16(code: &[u8], pos: &mut usize) -> Result<u16, ReadError> {
    if *pos + 2 > code.len() {
        return Err(ReadError::Truncated);
    }
    let value = u16::from_be_bytes([code[*pos], code[*pos + 1]]);
    *pos += 2;
    Ok(value)
}

fn read_i16(code: &[u8], pos: &mut usize) -> Result<i16, ReadError> {
    Ok(read_u16(code, pos)? as i16)
}

fn read_i32(code: &[u8], pos: &mut usize) -> Result<i32, ReadError> {
    if *pos + 4 > code.len() {
        return Err(ReadError::Truncated);
    }
    let value = i32::from_be_bytes([
        code[*pos],
        code[*pos + 1],
        code[*pos + 2],
        code[*pos + 3],
    ]);
    *pos += 4;
    Ok(value)
}
