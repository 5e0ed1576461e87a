//! Class file assembly
//!
//! Raw members are copied through untouched. Edited bodies are re-assembled:
//! constants re-interned, branch offsets resolved by fix-point layout
//! (switch padding and `goto_w` promotion feed back into instruction sizes),
//! stack/locals maxima recomputed, and stack-map frames emitted for class
//! files that require them. Code a rewrite made unreachable is squashed to
//! `nop`s ending in `athrow`, with a `[], [Throwable]` frame.

use byteorder::{BigEndian, WriteBytesExt};
use std::collections::{BTreeMap, HashMap, HashSet};

use super::frames::{self, Analysis, Frame, VType};
use super::insn::{Body, Const, Handler, Insn, LabelId, Node};
use super::opcodes::*;
use super::{
    ClassUnit, ConstantPool, FieldConstant, FieldUnit, MethodCode, MethodUnit, RawCode,
    WriteError, FRAMES_REQUIRED_MAJOR,
};
use crate::descriptor;

const MAGIC: u32 = 0xCAFE_BABE;

/// Serializes the class. Needs `&mut` because everything a rewrite
/// introduced is interned into the constant pool here.
pub fn write_class(unit: &mut ClassUnit) -> Result<Vec<u8>, WriteError> {
    let class_name = unit.name.clone();
    let major = unit.major_version;

    let ClassUnit { pool, fields, methods, attributes, .. } = unit;

    let mut field_outs = Vec::with_capacity(fields.len());
    for field in fields.iter() {
        field_outs.push(prepare_field(pool, field)?);
    }

    let mut method_outs = Vec::with_capacity(methods.len());
    for method in methods.iter() {
        method_outs.push(prepare_method(pool, &class_name, major, method)?);
    }

    let mut class_attr_outs = Vec::with_capacity(attributes.len());
    for attr in attributes.iter() {
        class_attr_outs.push((pool.ensure_utf8(&attr.name)?, attr.info.clone()));
    }

    let mut out = Vec::new();
    out.write_u32::<BigEndian>(MAGIC).unwrap();
    out.write_u16::<BigEndian>(unit.minor_version).unwrap();
    out.write_u16::<BigEndian>(unit.major_version).unwrap();
    unit.pool.write(&mut out)?;
    out.write_u16::<BigEndian>(unit.access_flags).unwrap();
    out.write_u16::<BigEndian>(unit.this_class).unwrap();
    out.write_u16::<BigEndian>(unit.super_class).unwrap();
    out.write_u16::<BigEndian>(unit.interfaces.len() as u16).unwrap();
    for interface in &unit.interfaces {
        out.write_u16::<BigEndian>(*interface).unwrap();
    }

    out.write_u16::<BigEndian>(field_outs.len() as u16).unwrap();
    for (access, name_idx, desc_idx, attrs) in field_outs {
        out.write_u16::<BigEndian>(access).unwrap();
        out.write_u16::<BigEndian>(name_idx).unwrap();
        out.write_u16::<BigEndian>(desc_idx).unwrap();
        write_attributes(&mut out, &attrs);
    }

    out.write_u16::<BigEndian>(method_outs.len() as u16).unwrap();
    for (access, name_idx, desc_idx, attrs) in method_outs {
        out.write_u16::<BigEndian>(access).unwrap();
        out.write_u16::<BigEndian>(name_idx).unwrap();
        out.write_u16::<BigEndian>(desc_idx).unwrap();
        write_attributes(&mut out, &attrs);
    }

    write_attributes(&mut out, &class_attr_outs);
    Ok(out)
}

type MemberOut = (u16, u16, u16, Vec<(u16, Vec<u8>)>);

fn write_attributes(out: &mut Vec<u8>, attrs: &[(u16, Vec<u8>)]) {
    out.write_u16::<BigEndian>(attrs.len() as u16).unwrap();
    for (name_idx, info) in attrs {
        out.write_u16::<BigEndian>(*name_idx).unwrap();
        out.write_u32::<BigEndian>(info.len() as u32).unwrap();
        out.extend_from_slice(info);
    }
}

fn prepare_field(pool: &mut ConstantPool, field: &FieldUnit) -> Result<MemberOut, WriteError> {
    let name_idx = pool.ensure_utf8(&field.name)?;
    let desc_idx = pool.ensure_utf8(&field.descriptor)?;
    let mut attrs = Vec::new();
    if let Some(constant) = &field.constant {
        let value_idx = match constant {
            FieldConstant::Int(v) => pool.ensure_integer(*v)?,
            FieldConstant::Float(v) => pool.ensure_float(*v)?,
            FieldConstant::Long(v) => pool.ensure_long(*v)?,
            FieldConstant::Double(v) => pool.ensure_double(*v)?,
            FieldConstant::Str(v) => pool.ensure_string(v)?,
        };
        let mut info = Vec::new();
        info.write_u16::<BigEndian>(value_idx).unwrap();
        attrs.push((pool.ensure_utf8("ConstantValue")?, info));
    }
    for attr in &field.attributes {
        attrs.push((pool.ensure_utf8(&attr.name)?, attr.info.clone()));
    }
    Ok((field.access_flags, name_idx, desc_idx, attrs))
}

fn prepare_method(
    pool: &mut ConstantPool,
    class_name: &str,
    major: u16,
    method: &MethodUnit,
) -> Result<MemberOut, WriteError> {
    let name_idx = pool.ensure_utf8(&method.name)?;
    let desc_idx = pool.ensure_utf8(&method.descriptor)?;
    let mut attrs = Vec::new();
    match &method.code {
        None => {}
        Some(MethodCode::Raw(raw)) => {
            attrs.push((pool.ensure_utf8("Code")?, raw_code_info(pool, raw)?));
        }
        Some(MethodCode::Edited(body)) => {
            let info = assemble(pool, class_name, major, method, body)?;
            attrs.push((pool.ensure_utf8("Code")?, info));
        }
    }
    for attr in &method.attributes {
        attrs.push((pool.ensure_utf8(&attr.name)?, attr.info.clone()));
    }
    Ok((method.access_flags, name_idx, desc_idx, attrs))
}

fn raw_code_info(pool: &mut ConstantPool, raw: &RawCode) -> Result<Vec<u8>, WriteError> {
    let mut info = Vec::new();
    info.write_u16::<BigEndian>(raw.max_stack).unwrap();
    info.write_u16::<BigEndian>(raw.max_locals).unwrap();
    info.write_u32::<BigEndian>(raw.code.len() as u32).unwrap();
    info.extend_from_slice(&raw.code);
    info.write_u16::<BigEndian>(raw.exceptions.len() as u16).unwrap();
    for handler in &raw.exceptions {
        info.write_u16::<BigEndian>(handler.start_pc).unwrap();
        info.write_u16::<BigEndian>(handler.end_pc).unwrap();
        info.write_u16::<BigEndian>(handler.handler_pc).unwrap();
        info.write_u16::<BigEndian>(handler.catch_type).unwrap();
    }
    let attrs: Vec<(u16, Vec<u8>)> = raw
        .attributes
        .iter()
        .map(|attr| Ok((pool.ensure_utf8(&attr.name)?, attr.info.clone())))
        .collect::<Result<_, WriteError>>()?;
    write_attributes(&mut info, &attrs);
    Ok(info)
}

fn assemble(
    pool: &mut ConstantPool,
    class_name: &str,
    major: u16,
    method: &MethodUnit,
    body: &Body,
) -> Result<Vec<u8>, WriteError> {
    let mut nodes = body.nodes.clone();
    let handlers = body.handlers.clone();
    let frames_required = major >= FRAMES_REQUIRED_MAJOR;

    let analysis = match frames::analyze(
        class_name,
        &method.name,
        method.access_flags,
        &method.descriptor,
        &nodes,
        &handlers,
        pool,
    ) {
        Ok(analysis) => Some(analysis),
        Err(e) if frames_required => return Err(e),
        Err(_) => None,
    };

    // squash unreachable instructions where frames will be emitted
    let mut dead_starts = Vec::new();
    if frames_required {
        let analysis = analysis.as_ref().expect("frames required implies analysis");
        let mut in_dead_run = false;
        let mut last_dead: Option<usize> = None;
        for i in 0..nodes.len() {
            if !matches!(nodes[i], Node::Insn(_)) {
                continue;
            }
            if analysis.reachable(i) {
                if let (true, Some(last)) = (in_dead_run, last_dead) {
                    nodes[last] = Node::Insn(Insn::Simple(ATHROW));
                }
                in_dead_run = false;
                last_dead = None;
            } else {
                if !in_dead_run {
                    dead_starts.push(i);
                }
                nodes[i] = Node::Insn(Insn::Simple(NOP));
                in_dead_run = true;
                last_dead = Some(i);
            }
        }
        if let (true, Some(last)) = (in_dead_run, last_dead) {
            nodes[last] = Node::Insn(Insn::Simple(ATHROW));
        }
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

    // intern operands up front; instruction sizes depend on the indices
    let mut plan: Vec<u16> = vec![0; nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        let Node::Insn(insn) = node else { continue };
        plan[i] = match insn {
            Insn::Ldc(c) => intern_const(pool, c)?,
            Insn::Type { class_name, .. } => pool.ensure_class(class_name)?,
            Insn::MultiANewArray { class_name, .. } => pool.ensure_class(class_name)?,
            Insn::Field { owner, name, descriptor, .. } => {
                pool.ensure_field_ref(owner, name, descriptor)?
            }
            // the interface flag follows the constant kind, not the opcode:
            // invokestatic on an interface owner uses InterfaceMethodref
            Insn::Method { owner, name, descriptor, interface, .. } => {
                pool.ensure_method_ref(owner, name, descriptor, *interface)?
            }
            Insn::InvokeDynamic { index, .. } => *index,
            _ => 0,
        };
    }

    // fix-point layout: switch padding and goto widths move offsets around
    let mut wide_jumps: HashSet<usize> = HashSet::new();
    let mut offsets: Vec<u32>;
    loop {
        offsets = vec![0; nodes.len() + 1];
        let mut off = 0u32;
        for (i, node) in nodes.iter().enumerate() {
            offsets[i] = off;
            if let Node::Insn(insn) = node {
                off += insn_size(insn, off, wide_jumps.contains(&i), plan[i]);
            }
        }
        offsets[nodes.len()] = off;

        let mut grew = false;
        for (i, node) in nodes.iter().enumerate() {
            if let Node::Insn(Insn::Jump { opcode, target }) = node {
                if (*opcode == GOTO || *opcode == JSR) && !wide_jumps.contains(&i) {
                    let disp = offsets[node_of(*target)?] as i64 - offsets[i] as i64;
                    if i16::try_from(disp).is_err() {
                        wide_jumps.insert(i);
                        grew = true;
                    }
                }
            }
        }
        if !grew {
            break;
        }
    }
    let code_len = offsets[nodes.len()];
    if code_len > 0xFFFF {
        return Err(WriteError::CodeOverflow);
    }

    // emit
    let mut code = Vec::with_capacity(code_len as usize);
    for (i, node) in nodes.iter().enumerate() {
        let Node::Insn(insn) = node else { continue };
        emit_insn(&mut code, insn, offsets[i], wide_jumps.contains(&i), plan[i], &|l| {
            node_of(l).map(|n| offsets[n])
        })?;
    }
    debug_assert_eq!(code.len() as u32, code_len);

    // exception table
    let mut exception_rows = Vec::with_capacity(handlers.len());
    for handler in &handlers {
        let catch_type = match &handler.catch_type {
            None => 0,
            Some(name) => pool.ensure_class(name)?,
        };
        exception_rows.push((
            offsets[node_of(handler.start)?] as u16,
            offsets[node_of(handler.end)?] as u16,
            offsets[node_of(handler.handler)?] as u16,
            catch_type,
        ));
    }

    let (max_stack, max_locals) = match &analysis {
        Some(a) => (a.max_stack, a.max_locals),
        None => (
            body.max_stack.saturating_add(body.extra_stack),
            body.max_locals,
        ),
    };

    let mut code_attrs: Vec<(u16, Vec<u8>)> = Vec::new();

    let lines: Vec<(u16, u16)> = nodes
        .iter()
        .enumerate()
        .filter_map(|(i, n)| match n {
            Node::Line(line) => Some((offsets[i] as u16, *line)),
            _ => None,
        })
        .collect();
    if !lines.is_empty() {
        let mut info = Vec::new();
        info.write_u16::<BigEndian>(lines.len() as u16).unwrap();
        for (pc, line) in lines {
            info.write_u16::<BigEndian>(pc).unwrap();
            info.write_u16::<BigEndian>(line).unwrap();
        }
        code_attrs.push((pool.ensure_utf8("LineNumberTable")?, info));
    }

    if frames_required {
        let analysis = analysis.as_ref().expect("frames required implies analysis");
        let table = stack_map_table(
            pool,
            class_name,
            method,
            &nodes,
            &handlers,
            analysis,
            &offsets,
            &dead_starts,
            &label_index,
        )?;
        if let Some(info) = table {
            code_attrs.push((pool.ensure_utf8("StackMapTable")?, info));
        }
    }

    let mut info = Vec::new();
    info.write_u16::<BigEndian>(max_stack).unwrap();
    info.write_u16::<BigEndian>(max_locals).unwrap();
    info.write_u32::<BigEndian>(code_len).unwrap();
    info.extend_from_slice(&code);
    info.write_u16::<BigEndian>(exception_rows.len() as u16).unwrap();
    for (start, end, handler, catch_type) in exception_rows {
        info.write_u16::<BigEndian>(start).unwrap();
        info.write_u16::<BigEndian>(end).unwrap();
        info.write_u16::<BigEndian>(handler).unwrap();
        info.write_u16::<BigEndian>(catch_type).unwrap();
    }
    write_attributes(&mut info, &code_attrs);
    Ok(info)
}

fn intern_const(pool: &mut ConstantPool, c: &Const) -> Result<u16, WriteError> {
    match c {
        Const::Int(v) => pool.ensure_integer(*v),
        Const::Float(v) => pool.ensure_float(*v),
        Const::Long(v) => pool.ensure_long(*v),
        Const::Double(v) => pool.ensure_double(*v),
        Const::Str(v) => pool.ensure_string(v),
        Const::Class(v) => pool.ensure_class(v),
        Const::MethodType(v) => pool.ensure_method_type(v),
        Const::Pooled { index, .. } => Ok(*index),
    }
}

fn switch_padding(opcode_offset: u32) -> u32 {
    (4 - ((opcode_offset + 1) % 4)) % 4
}

fn insn_size(insn: &Insn, offset: u32, wide_jump: bool, pool_index: u16) -> u32 {
    match insn {
        Insn::Simple(_) => 1,
        Insn::Push { opcode, .. } => {
            if *opcode == SIPUSH {
                3
            } else {
                2
            }
        }
        Insn::Var { opcode, index } => {
            if *opcode != RET && *index <= 3 {
                1
            } else if *index <= 0xFF {
                2
            } else {
                4
            }
        }
        Insn::Iinc { index, delta } => {
            if *index <= 0xFF && i8::try_from(*delta).is_ok() {
                3
            } else {
                6
            }
        }
        Insn::Ldc(c) => {
            if c.is_wide() || pool_index > 0xFF {
                3
            } else {
                2
            }
        }
        Insn::Type { .. } | Insn::Field { .. } => 3,
        Insn::Method { opcode, .. } => {
            if *opcode == INVOKEINTERFACE {
                5
            } else {
                3
            }
        }
        Insn::InvokeDynamic { .. } => 5,
        Insn::Jump { opcode, .. } => {
            if (*opcode == GOTO || *opcode == JSR) && wide_jump {
                5
            } else {
                3
            }
        }
        Insn::TableSwitch { targets, .. } => {
            1 + switch_padding(offset) + 12 + 4 * targets.len() as u32
        }
        Insn::LookupSwitch { pairs, .. } => {
            1 + switch_padding(offset) + 8 + 8 * pairs.len() as u32
        }
        Insn::MultiANewArray { .. } => 4,
    }
}

fn emit_insn(
    code: &mut Vec<u8>,
    insn: &Insn,
    offset: u32,
    wide_jump: bool,
    pool_index: u16,
    offset_of: &dyn Fn(LabelId) -> Result<u32, WriteError>,
) -> Result<(), WriteError> {
    match insn {
        Insn::Simple(op) => code.push(*op),
        Insn::Push { opcode, operand } => {
            code.push(*opcode);
            if *opcode == SIPUSH {
                code.write_i16::<BigEndian>(*operand as i16).unwrap();
            } else {
                code.push(*operand as u8);
            }
        }
        Insn::Var { opcode, index } => {
            if *opcode != RET && *index <= 3 {
                let base = if *opcode >= ISTORE { (0x3B, ISTORE) } else { (0x1A, ILOAD) };
                code.push(base.0 + (*opcode - base.1) * 4 + *index as u8);
            } else if *index <= 0xFF {
                code.push(*opcode);
                code.push(*index as u8);
            } else {
                code.push(WIDE);
                code.push(*opcode);
                code.write_u16::<BigEndian>(*index).unwrap();
            }
        }
        Insn::Iinc { index, delta } => {
            if *index <= 0xFF && i8::try_from(*delta).is_ok() {
                code.push(IINC);
                code.push(*index as u8);
                code.push(*delta as u8);
            } else {
                code.push(WIDE);
                code.push(IINC);
                code.write_u16::<BigEndian>(*index).unwrap();
                code.write_i16::<BigEndian>(*delta).unwrap();
            }
        }
        Insn::Ldc(c) => {
            if c.is_wide() {
                code.push(LDC2_W);
                code.write_u16::<BigEndian>(pool_index).unwrap();
            } else if pool_index > 0xFF {
                code.push(LDC_W);
                code.write_u16::<BigEndian>(pool_index).unwrap();
            } else {
                code.push(LDC);
                code.push(pool_index as u8);
            }
        }
        Insn::Type { opcode, .. } | Insn::Field { opcode, .. } => {
            code.push(*opcode);
            code.write_u16::<BigEndian>(pool_index).unwrap();
        }
        Insn::Method { opcode, descriptor, .. } => {
            code.push(*opcode);
            code.write_u16::<BigEndian>(pool_index).unwrap();
            if *opcode == INVOKEINTERFACE {
                let slots = descriptor::arg_slots(descriptor)
                    .map_err(|e| WriteError::FrameComputation(e.to_string()))?;
                code.push(1 + slots as u8);
                code.push(0);
            }
        }
        Insn::InvokeDynamic { .. } => {
            code.push(INVOKEDYNAMIC);
            code.write_u16::<BigEndian>(pool_index).unwrap();
            code.push(0);
            code.push(0);
        }
        Insn::Jump { opcode, target } => {
            let disp = offset_of(*target)? as i64 - offset as i64;
            if (*opcode == GOTO || *opcode == JSR) && wide_jump {
                code.push(if *opcode == GOTO { GOTO_W } else { JSR_W });
                code.write_i32::<BigEndian>(disp as i32).unwrap();
            } else {
                let disp = i16::try_from(disp).map_err(|_| WriteError::BranchOffsetOverflow)?;
                code.push(*opcode);
                code.write_i16::<BigEndian>(disp).unwrap();
            }
        }
        Insn::TableSwitch { default, low, high, targets } => {
            code.push(TABLESWITCH);
            for _ in 0..switch_padding(offset) {
                code.push(0);
            }
            let base = offset as i64;
            code.write_i32::<BigEndian>((offset_of(*default)? as i64 - base) as i32).unwrap();
            code.write_i32::<BigEndian>(*low).unwrap();
            code.write_i32::<BigEndian>(*high).unwrap();
            for target in targets {
                code.write_i32::<BigEndian>((offset_of(*target)? as i64 - base) as i32).unwrap();
            }
        }
        Insn::LookupSwitch { default, pairs } => {
            code.push(LOOKUPSWITCH);
            for _ in 0..switch_padding(offset) {
                code.push(0);
            }
            let base = offset as i64;
            code.write_i32::<BigEndian>((offset_of(*default)? as i64 - base) as i32).unwrap();
            code.write_i32::<BigEndian>(pairs.len() as i32).unwrap();
            for (key, target) in pairs {
                code.write_i32::<BigEndian>(*key).unwrap();
                code.write_i32::<BigEndian>((offset_of(*target)? as i64 - base) as i32).unwrap();
            }
        }
        Insn::MultiANewArray { dimensions, .. } => {
            code.push(MULTIANEWARRAY);
            code.write_u16::<BigEndian>(pool_index).unwrap();
            code.push(*dimensions);
        }
    }
    Ok(())
}

/// The offsets that need a frame: jump and switch targets, handler entries,
/// and the start of each squashed dead zone.
#[allow(clippy::too_many_arguments)]
fn stack_map_table(
    pool: &mut ConstantPool,
    class_name: &str,
    method: &MethodUnit,
    nodes: &[Node],
    handlers: &[Handler],
    analysis: &Analysis,
    offsets: &[u32],
    dead_starts: &[usize],
    label_index: &HashMap<LabelId, usize>,
) -> Result<Option<Vec<u8>>, WriteError> {
    let mut frame_nodes: HashSet<usize> = HashSet::new();
    for node in nodes {
        let Node::Insn(insn) = node else { continue };
        match insn {
            Insn::Jump { target, .. } => {
                frame_nodes.insert(label_index[target]);
            }
            Insn::TableSwitch { default, targets, .. } => {
                frame_nodes.insert(label_index[default]);
                for t in targets {
                    frame_nodes.insert(label_index[t]);
                }
            }
            Insn::LookupSwitch { default, pairs } => {
                frame_nodes.insert(label_index[default]);
                for (_, t) in pairs {
                    frame_nodes.insert(label_index[t]);
                }
            }
            _ => {}
        }
    }
    for handler in handlers {
        frame_nodes.insert(label_index[&handler.handler]);
    }
    frame_nodes.extend(dead_starts.iter().copied());

    if frame_nodes.is_empty() {
        return Ok(None);
    }

    let dead_frame = Frame {
        locals: Vec::new(),
        stack: vec![VType::Object(String::from("java/lang/Throwable"))],
    };

    // dedupe by offset; adjacent labels resolve to the same place
    let mut by_offset: BTreeMap<u32, Frame> = BTreeMap::new();
    for node in frame_nodes {
        let frame = analysis.entry[node].clone().unwrap_or_else(|| dead_frame.clone());
        by_offset.entry(offsets[node]).or_insert(frame);
    }

    let initial = frames::initial_frame(
        class_name,
        &method.name,
        method.access_flags,
        &method.descriptor,
    )?;
    let mut prev_locals = compact_locals(&initial.locals);
    let mut prev_offset: i64 = -1;

    let mut info = Vec::new();
    info.write_u16::<BigEndian>(by_offset.len() as u16).unwrap();
    for (offset, frame) in by_offset {
        let locals = compact_locals(&frame.locals);
        let stack = &frame.stack;
        let delta = (offset as i64 - prev_offset - 1) as u16;

        if locals == prev_locals && stack.is_empty() {
            if delta <= 63 {
                info.push(delta as u8);
            } else {
                info.push(251);
                info.write_u16::<BigEndian>(delta).unwrap();
            }
        } else if locals == prev_locals && stack.len() == 1 {
            if delta <= 63 {
                info.push(64 + delta as u8);
            } else {
                info.push(247);
                info.write_u16::<BigEndian>(delta).unwrap();
            }
            write_vtype(&mut info, pool, &stack[0], offsets)?;
        } else if stack.is_empty()
            && locals.len() < prev_locals.len()
            && prev_locals.len() - locals.len() <= 3
            && prev_locals[..locals.len()] == locals[..]
        {
            let chopped = (prev_locals.len() - locals.len()) as u8;
            info.push(251 - chopped);
            info.write_u16::<BigEndian>(delta).unwrap();
        } else if stack.is_empty()
            && locals.len() > prev_locals.len()
            && locals.len() - prev_locals.len() <= 3
            && locals[..prev_locals.len()] == prev_locals[..]
        {
            let appended = locals.len() - prev_locals.len();
            info.push(251 + appended as u8);
            info.write_u16::<BigEndian>(delta).unwrap();
            for vtype in &locals[prev_locals.len()..] {
                write_vtype(&mut info, pool, vtype, offsets)?;
            }
        } else {
            info.push(255);
            info.write_u16::<BigEndian>(delta).unwrap();
            info.write_u16::<BigEndian>(locals.len() as u16).unwrap();
            for vtype in &locals {
                write_vtype(&mut info, pool, vtype, offsets)?;
            }
            info.write_u16::<BigEndian>(stack.len() as u16).unwrap();
            for vtype in stack {
                write_vtype(&mut info, pool, vtype, offsets)?;
            }
        }

        prev_locals = locals;
        prev_offset = offset as i64;
    }
    Ok(Some(info))
}

/// Slot list to verification-type list: drop the high half of two-slot
/// values, trim trailing tops.
fn compact_locals(locals: &[VType]) -> Vec<VType> {
    let mut out = Vec::with_capacity(locals.len());
    let mut i = 0;
    while i < locals.len() {
        let value = locals[i].clone();
        if value.is_category2() {
            i += 1;
        }
        out.push(value);
        i += 1;
    }
    while matches!(out.last(), Some(VType::Top)) {
        out.pop();
    }
    out
}

fn write_vtype(
    out: &mut Vec<u8>,
    pool: &mut ConstantPool,
    vtype: &VType,
    offsets: &[u32],
) -> Result<(), WriteError> {
    match vtype {
        VType::Top => out.push(0),
        VType::Integer => out.push(1),
        VType::Float => out.push(2),
        VType::Double => out.push(3),
        VType::Long => out.push(4),
        VType::Null => out.push(5),
        VType::UninitializedThis => out.push(6),
        VType::Object(name) => {
            out.push(7);
            let index = pool.ensure_class(name)?;
            out.write_u16::<BigEndian>(index).unwrap();
        }
        VType::Uninitialized(node) => {
            out.push(8);
            out.write_u16::<BigEndian>(offsets[*node] as u16).unwrap();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{read_class, MethodCode, MethodUnit};

    fn branchy_method() -> MethodUnit {
        // public int foo(int x, String[] y) { if (x < 10) return 10; return 80; }
        let mut body = Body::new();
        let else_branch = body.fresh_label();
        body.nodes.extend([
            Node::Insn(Insn::Var { opcode: ILOAD, index: 1 }),
            Node::Insn(Insn::Push { opcode: BIPUSH, operand: 10 }),
            Node::Insn(Insn::Jump { opcode: IF_ICMPGE, target: else_branch }),
            Node::Insn(Insn::Push { opcode: BIPUSH, operand: 10 }),
            Node::Insn(Insn::Simple(IRETURN)),
            Node::Label(else_branch),
            Node::Insn(Insn::Push { opcode: BIPUSH, operand: 80 }),
            Node::Insn(Insn::Simple(IRETURN)),
        ]);
        MethodUnit {
            access_flags: access::ACC_PUBLIC,
            name: String::from("foo"),
            descriptor: String::from("(I[Ljava/lang/String;)I"),
            code: Some(MethodCode::Edited(body)),
            attributes: Vec::new(),
        }
    }

    #[test]
    fn round_trips_a_branchy_method() {
        let mut unit = ClassUnit::synthesize(52, "test/Foo", "java/lang/Object").unwrap();
        unit.methods.push(branchy_method());
        let bytes = write_class(&mut unit).unwrap();

        let mut reparsed = read_class(&bytes).unwrap();
        assert_eq!(reparsed.name, "test/Foo");
        assert_eq!(reparsed.major_version, 52);

        let raw = match &reparsed.methods[0].code {
            Some(MethodCode::Raw(raw)) => raw.clone(),
            other => panic!("unexpected code {:?}", other),
        };
        assert_eq!(raw.max_stack, 2);
        assert_eq!(raw.max_locals, 3);
        assert!(raw.attributes.iter().any(|a| a.name == "StackMapTable"));

        let pool = reparsed.pool.clone();
        let body = reparsed.methods[0].edit(&pool).unwrap();
        let returns = body.find_insns(|i| i.is_return());
        assert_eq!(returns.len(), 2);
        let jumps = body.find_insns(|i| matches!(i, Insn::Jump { .. }));
        assert_eq!(jumps.len(), 1);
    }

    #[test]
    fn dead_code_is_squashed() {
        // return; <dead: iconst_0; ireturn>
        let mut body = Body::new();
        body.nodes.extend([
            Node::Insn(Insn::Simple(RETURN)),
            Node::Insn(Insn::Simple(ICONST_0)),
            Node::Insn(Insn::Simple(IRETURN)),
        ]);
        let mut unit = ClassUnit::synthesize(52, "test/Dead", "java/lang/Object").unwrap();
        unit.methods.push(MethodUnit {
            access_flags: access::ACC_PUBLIC | access::ACC_STATIC,
            name: String::from("m"),
            descriptor: String::from("()V"),
            code: Some(MethodCode::Edited(body)),
            attributes: Vec::new(),
        });
        let bytes = write_class(&mut unit).unwrap();

        let mut reparsed = read_class(&bytes).unwrap();
        let pool = reparsed.pool.clone();
        let body = reparsed.methods[0].edit(&pool).unwrap();
        let insns: Vec<&Insn> = body
            .nodes
            .iter()
            .filter_map(|n| match n {
                Node::Insn(i) => Some(i),
                _ => None,
            })
            .collect();
        assert_eq!(insns, vec![&Insn::Simple(RETURN), &Insn::Simple(NOP), &Insn::Simple(ATHROW)]);
    }

    #[test]
    fn wide_variable_indices() {
        let mut body = Body::new();
        body.nodes.extend([
            Node::Insn(Insn::Var { opcode: ILOAD, index: 300 }),
            Node::Insn(Insn::Simple(IRETURN)),
        ]);
        body.max_locals = 301;
        let mut unit = ClassUnit::synthesize(52, "test/Wide", "java/lang/Object").unwrap();
        unit.methods.push(MethodUnit {
            access_flags: access::ACC_PUBLIC | access::ACC_STATIC,
            name: String::from("m"),
            descriptor: String::from("()I"),
            code: Some(MethodCode::Edited(body)),
            attributes: Vec::new(),
        });
        // iload 300 reads an undefined local; analysis tolerates it
        let bytes = write_class(&mut unit).unwrap();
        let mut reparsed = read_class(&bytes).unwrap();
        let pool = reparsed.pool.clone();
        let body = reparsed.methods[0].edit(&pool).unwrap();
        assert!(body
            .nodes
            .iter()
            .any(|n| matches!(n, Node::Insn(Insn::Var { opcode: ILOAD, index: 300 }))));
    }
}
