//! Verification-type data-flow analysis over an editable body
//!
//! A work-list pass propagates `(locals, stack)` states through the node
//! list, merging at join points. The writer uses the result three ways: the
//! running maxima become `max_stack`/`max_locals`, the states at jump
//! targets and handler entries become the `StackMapTable`, and nodes that
//! never receive a state are the dead code to squash.
//!
//! Joining two different object types asks a small built-in `java.lang`
//! hierarchy for the common superclass and otherwise answers
//! `java/lang/Object`; classes are never loaded to find out more.

use std::collections::{HashMap, VecDeque};

use super::insn::{Handler, Insn, LabelId, Node};
use super::opcodes::*;
use super::{ConstantPool, CpEntry, WriteError};
use crate::descriptor;

/// A verification type. `Uninitialized` carries the node index of the `new`
/// instruction that produced it; the writer turns that into a byte offset.
#[derive(Debug, Clone, PartialEq)]
pub enum VType {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    Object(String),
    Uninitialized(usize),
}

impl VType {
    pub fn is_category2(&self) -> bool {
        matches!(self, VType::Long | VType::Double)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    pub locals: Vec<VType>,
    pub stack: Vec<VType>,
}

impl Frame {
    fn stack_slots(&self) -> usize {
        self.stack
            .iter()
            .map(|v| if v.is_category2() { 2 } else { 1 })
            .sum()
    }
}

pub struct Analysis {
    /// The state on entry to each node; `None` means unreachable.
    pub entry: Vec<Option<Frame>>,
    pub max_stack: u16,
    pub max_locals: u16,
}

impl Analysis {
    pub fn reachable(&self, node: usize) -> bool {
        self.entry.get(node).map(|f| f.is_some()).unwrap_or(false)
    }
}

/// The initial frame of a method: receiver (or `UninitializedThis` in a
/// constructor), then the parameters with their two-slot fillers.
pub fn initial_frame(
    class_name: &str,
    method_name: &str,
    access_flags: u16,
    method_descriptor: &str,
) -> Result<Frame, WriteError> {
    let mut locals = Vec::new();
    if access_flags & access::ACC_STATIC == 0 {
        if method_name == "<init>" {
            locals.push(VType::UninitializedThis);
        } else {
            locals.push(VType::Object(class_name.to_string()));
        }
    }
    let specs = descriptor::decompose_full_desc(method_descriptor)
        .map_err(|e| WriteError::FrameComputation(e.to_string()))?;
    for spec in &specs[1..] {
        let vt = vtype_of_spec(spec)
            .ok_or_else(|| WriteError::FrameComputation(format!("void parameter in {}", method_descriptor)))?;
        let two = vt.is_category2();
        locals.push(vt);
        if two {
            locals.push(VType::Top);
        }
    }
    Ok(Frame { locals, stack: Vec::new() })
}

pub fn analyze(
    class_name: &str,
    method_name: &str,
    access_flags: u16,
    method_descriptor: &str,
    nodes: &[Node],
    handlers: &[Handler],
    pool: &ConstantPool,
) -> Result<Analysis, WriteError> {
    let mut entry: Vec<Option<Frame>> = vec![None; nodes.len()];
    if nodes.is_empty() {
        return Ok(Analysis { entry, max_stack: 0, max_locals: 0 });
    }

    let label_index: HashMap<LabelId, usize> = nodes
        .iter()
        .enumerate()
        .filter_map(|(i, n)| match n {
            Node::Label(l) => Some((*l, i)),
            _ => None,
        })
        .collect();
    let node_of = |label: LabelId| -> Result<usize, WriteError> {
        label_index.get(&label).copied().ok_or(WriteError::UnplacedLabel(label))
    };

    // class created by each `new`, for <init> resolution
    let new_class: HashMap<usize, String> = nodes
        .iter()
        .enumerate()
        .filter_map(|(i, n)| match n {
            Node::Insn(Insn::Type { opcode: NEW, class_name }) => Some((i, class_name.clone())),
            _ => None,
        })
        .collect();

    struct Span {
        start: usize,
        end: usize,
        handler: usize,
        catch: VType,
    }
    let mut spans = Vec::with_capacity(handlers.len());
    for h in handlers {
        spans.push(Span {
            start: node_of(h.start)?,
            end: node_of(h.end)?,
            handler: node_of(h.handler)?,
            catch: VType::Object(
                h.catch_type.clone().unwrap_or_else(|| String::from("java/lang/Throwable")),
            ),
        });
    }

    let initial = initial_frame(class_name, method_name, access_flags, method_descriptor)?;
    let mut max_stack = initial.stack_slots();
    let mut max_locals = initial.locals.len();

    let mut work = VecDeque::new();
    let mut queued = vec![false; nodes.len()];
    entry[0] = Some(initial);
    work.push_back(0usize);
    queued[0] = true;

    let mut fuel = nodes.len().saturating_mul(64).max(4096);
    while let Some(i) = work.pop_front() {
        queued[i] = false;
        fuel = fuel.checked_sub(1).ok_or_else(|| {
            WriteError::FrameComputation(format!("analysis of {} did not converge", method_name))
        })?;

        let frame = entry[i].clone().expect("queued node has a frame");
        if let Node::Insn(insn) = &nodes[i] {
            match insn {
                Insn::Var { opcode, index } => {
                    let two = matches!(*opcode, LLOAD | DLOAD | LSTORE | DSTORE);
                    max_locals = max_locals.max(*index as usize + if two { 2 } else { 1 });
                }
                Insn::Iinc { index, .. } => max_locals = max_locals.max(*index as usize + 1),
                _ => {}
            }
        }
        let visit = |target: usize,
                     frame: &Frame,
                     entry: &mut Vec<Option<Frame>>,
                     work: &mut VecDeque<usize>,
                     queued: &mut Vec<bool>| {
            if target >= entry.len() {
                return;
            }
            let merged = match &entry[target] {
                None => Some(frame.clone()),
                Some(existing) => {
                    let joined = join_frames(frame, existing);
                    if &joined == existing {
                        None
                    } else {
                        Some(joined)
                    }
                }
            };
            if let Some(next) = merged {
                entry[target] = Some(next);
                if !queued[target] {
                    queued[target] = true;
                    work.push_back(target);
                }
            }
        };

        match &nodes[i] {
            Node::Label(_) | Node::Line(_) => {
                visit(i + 1, &frame, &mut entry, &mut work, &mut queued);
            }
            Node::Insn(insn) => {
                // exception edges see the locals as of this instruction
                for span in spans.iter().filter(|s| s.start <= i && i < s.end) {
                    let handler_frame = Frame {
                        locals: frame.locals.clone(),
                        stack: vec![span.catch.clone()],
                    };
                    max_stack = max_stack.max(handler_frame.stack_slots());
                    visit(span.handler, &handler_frame, &mut entry, &mut work, &mut queued);
                }

                let out = step(insn, i, &frame, class_name, &new_class, pool, method_name)?;
                max_stack = max_stack.max(out.stack_slots());
                max_locals = max_locals.max(out.locals.len());

                match insn {
                    Insn::Jump { opcode, target } => {
                        visit(node_of(*target)?, &out, &mut entry, &mut work, &mut queued);
                        if *opcode != GOTO {
                            visit(i + 1, &out, &mut entry, &mut work, &mut queued);
                        }
                    }
                    Insn::TableSwitch { default, targets, .. } => {
                        visit(node_of(*default)?, &out, &mut entry, &mut work, &mut queued);
                        for t in targets {
                            visit(node_of(*t)?, &out, &mut entry, &mut work, &mut queued);
                        }
                    }
                    Insn::LookupSwitch { default, pairs } => {
                        visit(node_of(*default)?, &out, &mut entry, &mut work, &mut queued);
                        for (_, t) in pairs {
                            visit(node_of(*t)?, &out, &mut entry, &mut work, &mut queued);
                        }
                    }
                    insn if insn.ends_flow() => {}
                    _ => visit(i + 1, &out, &mut entry, &mut work, &mut queued),
                }
            }
        }
    }

    Ok(Analysis {
        entry,
        max_stack: max_stack.min(u16::MAX as usize) as u16,
        max_locals: max_locals.min(u16::MAX as usize) as u16,
    })
}

fn step(
    insn: &Insn,
    node_index: usize,
    frame: &Frame,
    class_name: &str,
    new_class: &HashMap<usize, String>,
    pool: &ConstantPool,
    method_name: &str,
) -> Result<Frame, WriteError> {
    let mut locals = frame.locals.clone();
    let mut stack = frame.stack.clone();
    let underflow =
        || WriteError::FrameComputation(format!("operand stack underflow in {}", method_name));

    macro_rules! pop {
        () => {
            stack.pop().ok_or_else(underflow)?
        };
    }

    match insn {
        Insn::Simple(op) => match *op {
            NOP => {}
            ACONST_NULL => stack.push(VType::Null),
            0x02..=0x08 => stack.push(VType::Integer),
            0x09 | 0x0A => stack.push(VType::Long),
            0x0B..=0x0D => stack.push(VType::Float),
            0x0E | 0x0F => stack.push(VType::Double),
            // array loads
            0x2E..=0x35 => {
                let _index = pop!();
                let array = pop!();
                let value = match *op {
                    0x2E | 0x33 | 0x34 | 0x35 => VType::Integer,
                    0x2F => VType::Long,
                    0x30 => VType::Float,
                    0x31 => VType::Double,
                    0x32 => element_type(&array)
                        .unwrap_or_else(|| VType::Object(String::from("java/lang/Object"))),
                    _ => VType::Top,
                };
                stack.push(value);
            }
            // array stores
            0x4F..=0x56 => {
                let _value = pop!();
                let _index = pop!();
                let _array = pop!();
            }
            POP => {
                let _ = pop!();
            }
            POP2 => {
                let v1 = pop!();
                if !v1.is_category2() {
                    let _ = pop!();
                }
            }
            DUP => {
                let v1 = pop!();
                stack.push(v1.clone());
                stack.push(v1);
            }
            0x5A => {
                let v1 = pop!();
                let v2 = pop!();
                stack.push(v1.clone());
                stack.push(v2);
                stack.push(v1);
            }
            0x5B => {
                let v1 = pop!();
                let v2 = pop!();
                if v2.is_category2() {
                    stack.push(v1.clone());
                    stack.push(v2);
                    stack.push(v1);
                } else {
                    let v3 = pop!();
                    stack.push(v1.clone());
                    stack.push(v3);
                    stack.push(v2);
                    stack.push(v1);
                }
            }
            DUP2 => {
                let v1 = pop!();
                if v1.is_category2() {
                    stack.push(v1.clone());
                    stack.push(v1);
                } else {
                    let v2 = pop!();
                    stack.push(v2.clone());
                    stack.push(v1.clone());
                    stack.push(v2);
                    stack.push(v1);
                }
            }
            0x5D => {
                let v1 = pop!();
                if v1.is_category2() {
                    let v2 = pop!();
                    stack.push(v1.clone());
                    stack.push(v2);
                    stack.push(v1);
                } else {
                    let v2 = pop!();
                    let v3 = pop!();
                    stack.push(v2.clone());
                    stack.push(v1.clone());
                    stack.push(v3);
                    stack.push(v2);
                    stack.push(v1);
                }
            }
            0x5E => {
                let v1 = pop!();
                if v1.is_category2() {
                    let v2 = pop!();
                    if v2.is_category2() {
                        stack.push(v1.clone());
                        stack.push(v2);
                        stack.push(v1);
                    } else {
                        let v3 = pop!();
                        stack.push(v1.clone());
                        stack.push(v3);
                        stack.push(v2);
                        stack.push(v1);
                    }
                } else {
                    let v2 = pop!();
                    let v3 = pop!();
                    if v3.is_category2() {
                        stack.push(v2.clone());
                        stack.push(v1.clone());
                        stack.push(v3);
                        stack.push(v2);
                        stack.push(v1);
                    } else {
                        let v4 = pop!();
                        stack.push(v2.clone());
                        stack.push(v1.clone());
                        stack.push(v4);
                        stack.push(v3);
                        stack.push(v2);
                        stack.push(v1);
                    }
                }
            }
            0x5F => {
                let v1 = pop!();
                let v2 = pop!();
                stack.push(v1);
                stack.push(v2);
            }
            // int arithmetic and bitwise
            0x60 | 0x64 | 0x68 | 0x6C | 0x70 | 0x78 | 0x7A | 0x7C | 0x7E | 0x80 | 0x82 => {
                let _ = pop!();
                let _ = pop!();
                stack.push(VType::Integer);
            }
            0x61 | 0x65 | 0x69 | 0x6D | 0x71 | 0x79 | 0x7B | 0x7D | 0x7F | 0x81 | 0x83 => {
                let _ = pop!();
                let _ = pop!();
                stack.push(VType::Long);
            }
            0x62 | 0x66 | 0x6A | 0x6E | 0x72 => {
                let _ = pop!();
                let _ = pop!();
                stack.push(VType::Float);
            }
            0x63 | 0x67 | 0x6B | 0x6F | 0x73 => {
                let _ = pop!();
                let _ = pop!();
                stack.push(VType::Double);
            }
            0x74 => {
                let _ = pop!();
                stack.push(VType::Integer);
            }
            0x75 => {
                let _ = pop!();
                stack.push(VType::Long);
            }
            0x76 => {
                let _ = pop!();
                stack.push(VType::Float);
            }
            0x77 => {
                let _ = pop!();
                stack.push(VType::Double);
            }
            // conversions
            0x85 | 0x8C | 0x8F => {
                let _ = pop!();
                stack.push(VType::Long);
            }
            0x86 | 0x89 | 0x90 => {
                let _ = pop!();
                stack.push(VType::Float);
            }
            0x87 | 0x8A | 0x8D => {
                let _ = pop!();
                stack.push(VType::Double);
            }
            0x88 | 0x8B | 0x8E | 0x91 | 0x92 | 0x93 => {
                let _ = pop!();
                stack.push(VType::Integer);
            }
            // comparisons
            0x94..=0x98 => {
                let _ = pop!();
                let _ = pop!();
                stack.push(VType::Integer);
            }
            IRETURN..=ARETURN => {
                let _ = pop!();
            }
            RETURN => {}
            0xBE => {
                let _ = pop!();
                stack.push(VType::Integer);
            }
            ATHROW => {
                let _ = pop!();
            }
            0xC2 | 0xC3 => {
                let _ = pop!();
            }
            other => {
                return Err(WriteError::FrameComputation(format!(
                    "unmodelled opcode 0x{:02x} in {}",
                    other, method_name
                )))
            }
        },
        Insn::Push { opcode, operand } => match *opcode {
            BIPUSH | SIPUSH => stack.push(VType::Integer),
            NEWARRAY => {
                let _count = pop!();
                stack.push(VType::Object(newarray_descriptor(*operand as u8)?));
            }
            other => {
                return Err(WriteError::FrameComputation(format!(
                    "unmodelled opcode 0x{:02x} in {}",
                    other, method_name
                )))
            }
        },
        Insn::Var { opcode, index } => match *opcode {
            ILOAD => stack.push(VType::Integer),
            LLOAD => stack.push(VType::Long),
            FLOAD => stack.push(VType::Float),
            DLOAD => stack.push(VType::Double),
            ALOAD => stack.push(locals.get(*index as usize).cloned().unwrap_or(VType::Top)),
            ISTORE..=ASTORE => {
                let value = pop!();
                store_local(&mut locals, *index as usize, value);
            }
            RET => {
                return Err(WriteError::FrameComputation(format!(
                    "jsr/ret bodies are not analysable ({})",
                    method_name
                )))
            }
            other => {
                return Err(WriteError::FrameComputation(format!(
                    "unmodelled opcode 0x{:02x} in {}",
                    other, method_name
                )))
            }
        },
        Insn::Iinc { .. } => {}
        Insn::Ldc(constant) => {
            use super::insn::Const;
            let value = match constant {
                Const::Int(_) => VType::Integer,
                Const::Float(_) => VType::Float,
                Const::Long(_) => VType::Long,
                Const::Double(_) => VType::Double,
                Const::Str(_) => VType::Object(String::from("java/lang/String")),
                Const::Class(_) => VType::Object(String::from("java/lang/Class")),
                Const::MethodType(_) => {
                    VType::Object(String::from("java/lang/invoke/MethodType"))
                }
                Const::Pooled { index, .. } => match pool.entry(*index).map_err(WriteError::Read)? {
                    CpEntry::MethodHandle { .. } => {
                        VType::Object(String::from("java/lang/invoke/MethodHandle"))
                    }
                    CpEntry::Dynamic { .. } => {
                        let desc = pool.dynamic_descriptor(*index).map_err(WriteError::Read)?;
                        vtype_of_spec(desc).unwrap_or(VType::Top)
                    }
                    _ => VType::Top,
                },
            };
            stack.push(value);
        }
        Insn::Type { opcode, class_name: type_name } => match *opcode {
            NEW => stack.push(VType::Uninitialized(node_index)),
            ANEWARRAY => {
                let _count = pop!();
                stack.push(VType::Object(array_of(type_name)));
            }
            CHECKCAST => {
                let _ = pop!();
                stack.push(VType::Object(type_name.clone()));
            }
            0xC1 => {
                let _ = pop!();
                stack.push(VType::Integer);
            }
            other => {
                return Err(WriteError::FrameComputation(format!(
                    "unmodelled opcode 0x{:02x} in {}",
                    other, method_name
                )))
            }
        },
        Insn::Field { opcode, descriptor, .. } => {
            let value = vtype_of_spec(descriptor)
                .ok_or_else(|| WriteError::FrameComputation(format!("void field in {}", method_name)))?;
            match *opcode {
                GETSTATIC => stack.push(value),
                PUTSTATIC => {
                    let _ = pop!();
                }
                GETFIELD => {
                    let _ = pop!();
                    stack.push(value);
                }
                PUTFIELD => {
                    let _ = pop!();
                    let _ = pop!();
                }
                other => {
                    return Err(WriteError::FrameComputation(format!(
                        "unmodelled opcode 0x{:02x} in {}",
                        other, method_name
                    )))
                }
            }
        }
        Insn::Method { opcode, name, descriptor, .. } => {
            let (args, ret) = method_types(descriptor)?;
            for _ in 0..args {
                let _ = pop!();
            }
            if *opcode != INVOKESTATIC {
                let receiver = pop!();
                if *opcode == INVOKESPECIAL && name == "<init>" {
                    let initialized = match &receiver {
                        VType::UninitializedThis => Some(VType::Object(class_name.to_string())),
                        VType::Uninitialized(site) => {
                            new_class.get(site).map(|c| VType::Object(c.clone()))
                        }
                        _ => None,
                    };
                    if let Some(cooked) = initialized {
                        for slot in locals.iter_mut().chain(stack.iter_mut()) {
                            if *slot == receiver {
                                *slot = cooked.clone();
                            }
                        }
                    }
                }
            }
            if let Some(value) = ret {
                stack.push(value);
            }
        }
        Insn::InvokeDynamic { descriptor, .. } => {
            let (args, ret) = method_types(descriptor)?;
            for _ in 0..args {
                let _ = pop!();
            }
            if let Some(value) = ret {
                stack.push(value);
            }
        }
        Insn::Jump { opcode, .. } => match *opcode {
            GOTO => {}
            0x99..=0x9E | IFNULL | IFNONNULL => {
                let _ = pop!();
            }
            0x9F..=0xA6 => {
                let _ = pop!();
                let _ = pop!();
            }
            JSR => {
                return Err(WriteError::FrameComputation(format!(
                    "jsr/ret bodies are not analysable ({})",
                    method_name
                )))
            }
            other => {
                return Err(WriteError::FrameComputation(format!(
                    "unmodelled opcode 0x{:02x} in {}",
                    other, method_name
                )))
            }
        },
        Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => {
            let _ = pop!();
        }
        Insn::MultiANewArray { class_name: type_name, dimensions } => {
            for _ in 0..*dimensions {
                let _ = pop!();
            }
            stack.push(VType::Object(type_name.clone()));
        }
    }

    Ok(Frame { locals, stack })
}

fn method_types(descriptor: &str) -> Result<(usize, Option<VType>), WriteError> {
    let specs = descriptor::decompose_full_desc(descriptor)
        .map_err(|e| WriteError::FrameComputation(e.to_string()))?;
    let ret = vtype_of_spec(&specs[0]);
    Ok((specs.len() - 1, ret))
}

/// `None` for `V`.
pub fn vtype_of_spec(spec: &str) -> Option<VType> {
    match spec.chars().next()? {
        'Z' | 'B' | 'C' | 'S' | 'I' => Some(VType::Integer),
        'F' => Some(VType::Float),
        'J' => Some(VType::Long),
        'D' => Some(VType::Double),
        'L' => Some(VType::Object(spec[1..spec.len() - 1].to_string())),
        '[' => Some(VType::Object(spec.to_string())),
        'V' => None,
        _ => None,
    }
}

fn array_of(class_name: &str) -> String {
    if class_name.starts_with('[') {
        format!("[{}", class_name)
    } else {
        format!("[L{};", class_name)
    }
}

fn element_type(array: &VType) -> Option<VType> {
    let VType::Object(desc) = array else { return None };
    let element = desc.strip_prefix('[')?;
    if element.starts_with('[') {
        return Some(VType::Object(element.to_string()));
    }
    vtype_of_spec(element)
}

fn newarray_descriptor(atype: u8) -> Result<String, WriteError> {
    let desc = match atype {
        4 => "[Z",
        5 => "[C",
        6 => "[F",
        7 => "[D",
        8 => "[B",
        9 => "[S",
        10 => "[I",
        11 => "[J",
        _ => return Err(WriteError::FrameComputation(format!("invalid newarray type {}", atype))),
    };
    Ok(desc.to_string())
}

fn store_local(locals: &mut Vec<VType>, index: usize, value: VType) {
    if locals.len() <= index {
        locals.resize(index + 1, VType::Top);
    }
    // a store into the high half of a two-slot value kills the whole value
    if index > 0 && locals[index - 1].is_category2() {
        locals[index - 1] = VType::Top;
    }
    let two = value.is_category2();
    locals[index] = value;
    if two {
        if locals.len() <= index + 1 {
            locals.resize(index + 2, VType::Top);
        }
        locals[index + 1] = VType::Top;
    }
}

fn join_frames(a: &Frame, b: &Frame) -> Frame {
    Frame {
        locals: join_slots(&a.locals, &b.locals),
        stack: join_slots(&a.stack, &b.stack),
    }
}

fn join_slots(a: &[VType], b: &[VType]) -> Vec<VType> {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let left = a.get(i).cloned().unwrap_or(VType::Top);
            let right = b.get(i).cloned().unwrap_or(VType::Top);
            join(&left, &right)
        })
        .collect()
}

fn join(a: &VType, b: &VType) -> VType {
    if a == b {
        return a.clone();
    }
    match (a, b) {
        (VType::Null, VType::Object(n)) | (VType::Object(n), VType::Null) => {
            VType::Object(n.clone())
        }
        (VType::Object(l), VType::Object(r)) => VType::Object(common_superclass(l, r)),
        _ => VType::Top,
    }
}

/// A handful of `java.lang` relationships; everything unknown joins at
/// `java/lang/Object`.
fn super_of(name: &str) -> Option<&'static str> {
    Some(match name {
        "java/lang/Exception" | "java/lang/Error" => "java/lang/Throwable",
        "java/lang/RuntimeException"
        | "java/lang/InterruptedException"
        | "java/lang/ReflectiveOperationException"
        | "java/io/IOException" => "java/lang/Exception",
        "java/lang/IllegalArgumentException"
        | "java/lang/IllegalStateException"
        | "java/lang/NullPointerException"
        | "java/lang/IndexOutOfBoundsException"
        | "java/lang/UnsupportedOperationException"
        | "java/lang/ArithmeticException"
        | "java/lang/ClassCastException"
        | "java/lang/SecurityException" => "java/lang/RuntimeException",
        "java/lang/Integer" | "java/lang/Long" | "java/lang/Float" | "java/lang/Double"
        | "java/lang/Short" | "java/lang/Byte" => "java/lang/Number",
        "java/lang/Throwable" | "java/lang/Number" | "java/lang/String"
        | "java/lang/StringBuilder" | "java/lang/StringBuffer" | "java/lang/Boolean"
        | "java/lang/Character" | "java/lang/Class" | "java/lang/Thread" => "java/lang/Object",
        _ => return None,
    })
}

fn common_superclass(left: &str, right: &str) -> String {
    if left == right {
        return left.to_string();
    }
    if left.starts_with('[') || right.starts_with('[') {
        return String::from("java/lang/Object");
    }
    let mut ancestors = vec![left];
    let mut cursor = left;
    while let Some(parent) = super_of(cursor) {
        ancestors.push(parent);
        cursor = parent;
    }
    let mut cursor = right;
    loop {
        if ancestors.contains(&cursor) {
            return cursor.to_string();
        }
        match super_of(cursor) {
            Some(parent) => cursor = parent,
            None => return String::from("java/lang/Object"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::insn::Body;

    #[test]
    fn initial_frames() {
        let f = initial_frame("a/B", "m", access::ACC_STATIC, "(JI)V").unwrap();
        assert_eq!(f.locals, vec![VType::Long, VType::Top, VType::Integer]);

        let f = initial_frame("a/B", "m", 0, "(Ljava/lang/String;)V").unwrap();
        assert_eq!(
            f.locals,
            vec![
                VType::Object(String::from("a/B")),
                VType::Object(String::from("java/lang/String"))
            ]
        );

        let f = initial_frame("a/B", "<init>", 0, "()V").unwrap();
        assert_eq!(f.locals, vec![VType::UninitializedThis]);
    }

    #[test]
    fn joins() {
        assert_eq!(
            join(&VType::Null, &VType::Object(String::from("a/B"))),
            VType::Object(String::from("a/B"))
        );
        assert_eq!(
            join(
                &VType::Object(String::from("java/lang/IllegalStateException")),
                &VType::Object(String::from("java/lang/NullPointerException"))
            ),
            VType::Object(String::from("java/lang/RuntimeException"))
        );
        assert_eq!(
            join(
                &VType::Object(String::from("a/B")),
                &VType::Object(String::from("c/D"))
            ),
            VType::Object(String::from("java/lang/Object"))
        );
        assert_eq!(join(&VType::Integer, &VType::Float), VType::Top);
    }

    #[test]
    fn straight_line_maxima() {
        // static int two() { return 1 + 1; }
        let mut body = Body::new();
        body.nodes.push(Node::Insn(Insn::Simple(0x04))); // iconst_1
        body.nodes.push(Node::Insn(Insn::Simple(0x04)));
        body.nodes.push(Node::Insn(Insn::Simple(0x60))); // iadd
        body.nodes.push(Node::Insn(Insn::Simple(IRETURN)));
        let pool = ConstantPool::new();
        let analysis = analyze("a/B", "two", access::ACC_STATIC, "()I", &body.nodes, &[], &pool).unwrap();
        assert_eq!(analysis.max_stack, 2);
        assert_eq!(analysis.max_locals, 0);
        assert!(analysis.reachable(3));
    }

    #[test]
    fn dead_code_is_unreachable() {
        let mut body = Body::new();
        body.nodes.push(Node::Insn(Insn::Simple(RETURN)));
        body.nodes.push(Node::Insn(Insn::Simple(NOP)));
        let pool = ConstantPool::new();
        let analysis = analyze("a/B", "m", access::ACC_STATIC, "()V", &body.nodes, &[], &pool).unwrap();
        assert!(analysis.reachable(0));
        assert!(!analysis.reachable(1));
    }
}
