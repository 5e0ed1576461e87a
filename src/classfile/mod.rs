//! Reading, editing and writing JVM class files
//!
//! This is the crate's replacement for a class-visitor library: a class file
//! is parsed into a [`ClassUnit`] tree, method bodies are edited as symbolic
//! instruction lists, and the writer re-assembles the file with re-interned
//! constants, re-laid-out branches, recomputed stack/locals maxima and, for
//! class files of major version 50 and up, freshly computed stack-map
//! frames.
//!
//! Everything a patch does not touch round-trips byte for byte: untouched
//! method bodies, field attributes and class attributes are carried as raw
//! blobs, which stay valid because the constant pool only ever grows.

mod constant_pool;
pub mod frames;
pub mod insn;
pub mod opcodes;
mod reader;
mod writer;

pub use constant_pool::{ConstantPool, CpEntry};
pub use insn::{Body, Const, Handler, Insn, LabelId, Node};
pub use reader::read_class;
pub use writer::write_class;

use thiserror::Error;

/// Stack-map frames became mandatory with class file major version 50.
pub const FRAMES_REQUIRED_MAJOR: u16 = 50;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("not a class file (bad magic)")]
    BadMagic,
    #[error("truncated class file")]
    Truncated,
    #[error("invalid constant pool tag {0}")]
    InvalidConstantPoolTag(u8),
    #[error("invalid constant pool index {0}")]
    InvalidConstantPoolIndex(u16),
    #[error("invalid {0} attribute")]
    InvalidAttribute(&'static str),
    #[error("invalid opcode 0x{opcode:02x} at offset {offset}")]
    InvalidOpcode { opcode: u8, offset: usize },
    #[error("malformed modified UTF-8")]
    MalformedUtf8,
    #[error("branch to a non-instruction offset {0}")]
    BadBranchTarget(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("constant pool overflow")]
    ConstantPoolOverflow,
    #[error("method body exceeds the 65535 byte code limit")]
    CodeOverflow,
    #[error("conditional branch offset exceeds 16 bits")]
    BranchOffsetOverflow,
    #[error("unplaced label {0}")]
    UnplacedLabel(LabelId),
    #[error("frame computation failed: {0}")]
    FrameComputation(String),
    #[error(transparent)]
    Read(#[from] ReadError),
}

/// An attribute carried through without interpretation. The name is kept as
/// a string; its UTF-8 entry is re-interned at write time.
#[derive(Debug, Clone)]
pub struct RawAttribute {
    pub name: String,
    pub info: Vec<u8>,
}

/// Constant value of a field added by a patch.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldConstant {
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Str(String),
}

#[derive(Debug, Clone)]
pub struct FieldUnit {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
    /// Set only on fields a patch added; existing fields keep their
    /// `ConstantValue` inside `attributes`.
    pub constant: Option<FieldConstant>,
    pub attributes: Vec<RawAttribute>,
}

/// One exception-table row of an unparsed body, by byte offset.
#[derive(Debug, Clone)]
pub struct RawHandler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

/// A `Code` attribute that has not been parsed into instructions.
#[derive(Debug, Clone)]
pub struct RawCode {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exceptions: Vec<RawHandler>,
    pub attributes: Vec<RawAttribute>,
}

#[derive(Debug, Clone)]
pub enum MethodCode {
    /// Round-trips verbatim.
    Raw(RawCode),
    /// Re-assembled by the writer.
    Edited(Body),
}

#[derive(Debug, Clone)]
pub struct MethodUnit {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
    pub code: Option<MethodCode>,
    /// Method attributes other than `Code`.
    pub attributes: Vec<RawAttribute>,
}

impl MethodUnit {
    /// The editable form of this method's body, parsing it on first use.
    pub fn edit(&mut self, pool: &ConstantPool) -> Result<&mut Body, ReadError> {
        if let Some(MethodCode::Raw(raw)) = &self.code {
            let body = reader::parse_code(raw, pool)?;
            self.code = Some(MethodCode::Edited(body));
        }
        match &mut self.code {
            Some(MethodCode::Edited(body)) => Ok(body),
            _ => Err(ReadError::InvalidAttribute("Code")),
        }
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & opcodes::access::ACC_STATIC != 0
    }
}

#[derive(Debug, Clone)]
pub struct ClassUnit {
    pub minor_version: u16,
    pub major_version: u16,
    pub pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    /// The internal name of this class, resolved from `this_class`.
    pub name: String,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldUnit>,
    pub methods: Vec<MethodUnit>,
    pub attributes: Vec<RawAttribute>,
}

impl ClassUnit {
    /// A minimal class: public, extending the given superclass, no members.
    pub fn synthesize(major_version: u16, name: &str, super_name: &str) -> Result<ClassUnit, WriteError> {
        let mut pool = ConstantPool::new();
        let this_class = pool.ensure_class(name)?;
        let super_class = pool.ensure_class(super_name)?;
        Ok(ClassUnit {
            minor_version: 0,
            major_version,
            pool,
            access_flags: opcodes::access::ACC_PUBLIC | opcodes::access::ACC_SUPER,
            this_class,
            super_class,
            name: name.to_string(),
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        })
    }

    pub fn has_method(&self, name: &str, descriptor: &str) -> bool {
        self.methods
            .iter()
            .any(|m| m.name == name && m.descriptor == descriptor)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    pub fn method(&self, name: &str, descriptor: &str) -> Option<&MethodUnit> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }
}
