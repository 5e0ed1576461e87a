//! Shared fixtures for the unit tests: a small synthesized target class
//! and a hook class, built with the crate's own writer.

use crate::classfile::insn::{Body, Insn, Node};
use crate::classfile::opcodes::{access::*, *};
use crate::classfile::{read_class, write_class, ClassUnit, MethodCode, MethodUnit};

fn method(access_flags: u16, name: &str, descriptor: &str, body: Body) -> MethodUnit {
    MethodUnit {
        access_flags,
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        code: Some(MethodCode::Edited(body)),
        attributes: Vec::new(),
    }
}

fn empty_void_body() -> Body {
    let mut body = Body::new();
    body.nodes.push(Node::Insn(Insn::Simple(RETURN)));
    body
}

/// `if (x < 10) return 10; return 80;` for any `(I…)I` signature.
fn branchy_int_body() -> Body {
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
    body
}

/// A class `test/Sample` with:
/// - `void run(int, String)`: calls `this.first()` then `this.second()`
/// - `int answer(int)`: the two-way branch returning 10 or 80
/// - `int foo(int, String[])`: same branch shape
/// - `void first()`, `void second()`: empty
pub fn sample_class() -> Vec<u8> {
    let mut unit = ClassUnit::synthesize(52, "test/Sample", "java/lang/Object").unwrap();

    let mut run = Body::new();
    for callee in ["first", "second"] {
        run.nodes.push(Node::Insn(Insn::Var { opcode: ALOAD, index: 0 }));
        run.nodes.push(Node::Insn(Insn::Method {
            opcode: INVOKEVIRTUAL,
            owner: String::from("test/Sample"),
            name: callee.to_string(),
            descriptor: String::from("()V"),
            interface: false,
        }));
    }
    run.nodes.push(Node::Insn(Insn::Simple(RETURN)));

    unit.methods.extend([
        method(ACC_PUBLIC, "run", "(ILjava/lang/String;)V", run),
        method(ACC_PUBLIC, "answer", "(I)I", branchy_int_body()),
        method(ACC_PUBLIC, "foo", "(I[Ljava/lang/String;)I", branchy_int_body()),
        method(ACC_PUBLIC, "first", "()V", empty_void_body()),
        method(ACC_PUBLIC, "second", "()V", empty_void_body()),
    ]);
    write_class(&mut unit).unwrap()
}

/// A class `test/Hooks` with a few static hook methods of the shapes the
/// script tests use.
pub fn hooks_class() -> Vec<u8> {
    let mut unit = ClassUnit::synthesize(52, "test/Hooks", "java/lang/Object").unwrap();

    // static int doubled(int supposed, Object self, int p1, String[] p2) { return supposed * 2; }
    let mut doubled = Body::new();
    doubled.nodes.extend([
        Node::Insn(Insn::Var { opcode: ILOAD, index: 0 }),
        Node::Insn(Insn::Simple(0x05)), // iconst_2
        Node::Insn(Insn::Simple(0x68)), // imul
        Node::Insn(Insn::Simple(IRETURN)),
    ]);

    // static boolean shouldSkip(Object self, int p1) { return p1 < 10; }
    let mut should_skip = Body::new();
    let no = should_skip.fresh_label();
    should_skip.nodes.extend([
        Node::Insn(Insn::Var { opcode: ILOAD, index: 1 }),
        Node::Insn(Insn::Push { opcode: BIPUSH, operand: 10 }),
        Node::Insn(Insn::Jump { opcode: IF_ICMPGE, target: no }),
        Node::Insn(Insn::Simple(0x04)), // iconst_1
        Node::Insn(Insn::Simple(IRETURN)),
        Node::Label(no),
        Node::Insn(Insn::Simple(ICONST_0)),
        Node::Insn(Insn::Simple(IRETURN)),
    ]);

    // static int identity(int v) { return v; }
    let mut identity = Body::new();
    identity.nodes.extend([
        Node::Insn(Insn::Var { opcode: ILOAD, index: 0 }),
        Node::Insn(Insn::Simple(IRETURN)),
    ]);

    unit.methods.extend([
        method(
            ACC_PUBLIC | ACC_STATIC,
            "doubled",
            "(ILjava/lang/Object;I[Ljava/lang/String;)I",
            doubled,
        ),
        method(
            ACC_PUBLIC | ACC_STATIC,
            "shouldSkip",
            "(Ljava/lang/Object;I)Z",
            should_skip,
        ),
        method(ACC_PUBLIC | ACC_STATIC, "identity", "(I)I", identity),
    ]);
    write_class(&mut unit).unwrap()
}

/// The instruction stream of one method in a serialized class.
pub fn insns_of(bytes: &[u8], name: &str, descriptor: &str) -> Vec<Insn> {
    let mut unit = read_class(bytes).unwrap();
    let pool = unit.pool.clone();
    let position = unit
        .methods
        .iter()
        .position(|m| m.name == name && m.descriptor == descriptor)
        .unwrap_or_else(|| panic!("{}{} not in class", name, descriptor));
    let body = unit.methods[position].edit(&pool).unwrap();
    body.nodes
        .iter()
        .filter_map(|n| match n {
            Node::Insn(i) => Some(i.clone()),
            _ => None,
        })
        .collect()
}
