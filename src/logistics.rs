//! Per-method slot and opcode bookkeeping
//!
//! Rewrites constantly need to know where a parameter lives and which
//! opcode moves it. That is not trivial: `long` and `double` take two local
//! slots, instance methods shift everything by one for the receiver, and
//! every primitive has its own load and return opcodes. `MethodLogistics`
//! computes the table once per method and hands out ready-made instructions.

use crate::classfile::insn::Insn;
use crate::classfile::opcodes::{self, access};
use crate::descriptor;
use crate::error::Error;

#[derive(Debug, Clone)]
struct ParamSlot {
    index: u16,
    size: u8,
    load_opcode: u8,
}

#[derive(Debug, Clone)]
pub struct MethodLogistics {
    static_offset: u16,
    return_spec: String,
    return_opcode: u8,
    return_size: u8,
    params: Vec<ParamSlot>,
}

impl MethodLogistics {
    /// Builds the table from a method's access flags and descriptor, exactly
    /// as the class-file layer reports them.
    pub fn new(access_flags: u16, descriptor: &str) -> Result<MethodLogistics, Error> {
        let static_offset = if access_flags & access::ACC_STATIC != 0 { 0 } else { 1 };
        let specs = descriptor::decompose_full_desc(descriptor)?;
        let return_spec = specs[0].clone();
        let return_size = descriptor::size_of(&return_spec);
        let return_opcode = return_opcode_for(&return_spec)?;

        let mut params = Vec::with_capacity(specs.len() - 1);
        let mut index = static_offset;
        for spec in &specs[1..] {
            let size = descriptor::size_of(spec);
            params.push(ParamSlot {
                index,
                size,
                load_opcode: load_opcode_for(spec)?,
            });
            index += size as u16;
        }

        Ok(MethodLogistics {
            static_offset,
            return_spec,
            return_opcode,
            return_size,
            params,
        })
    }

    pub fn is_static(&self) -> bool {
        self.static_offset == 0
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn return_opcode(&self) -> u8 {
        self.return_opcode
    }

    pub fn return_size(&self) -> u8 {
        self.return_size
    }

    /// The return descriptor token (`V`, `I`, `Ljava/lang/String;`, …).
    pub fn return_spec(&self) -> &str {
        &self.return_spec
    }

    /// The first local slot past the receiver and parameters.
    pub fn first_open_slot(&self) -> u16 {
        self.static_offset + self.params.iter().map(|p| p.size as u16).sum::<u16>()
    }

    /// The instruction loading the i-th parameter (0-based).
    pub fn load_param(&self, index: usize) -> Result<Insn, Error> {
        let slot = self.params.get(index).ok_or_else(|| {
            Error::InvalidConfiguration(format!(
                "parameter {} requested but the method takes {}",
                index + 1,
                self.params.len()
            ))
        })?;
        Ok(Insn::Var {
            opcode: slot.load_opcode,
            index: slot.index,
        })
    }

    /// Loads the receiver, or `null` in a static method.
    pub fn load_this(&self) -> Insn {
        if self.is_static() {
            Insn::Simple(opcodes::ACONST_NULL)
        } else {
            Insn::Var {
                opcode: opcodes::ALOAD,
                index: 0,
            }
        }
    }

    /// The correctly typed return instruction for this method.
    pub fn return_insn(&self) -> Insn {
        Insn::Simple(self.return_opcode)
    }

    /// DUP or DUP2 sized for the return value; nothing for `void`.
    pub fn dup_for_return(&self) -> Option<Insn> {
        dup_for_size(self.return_size)
    }

    /// POP or POP2 sized for the return value; nothing for `void`.
    pub fn pop_for_return(&self) -> Option<Insn> {
        match self.return_size {
            0 => None,
            2 => Some(Insn::Simple(opcodes::POP2)),
            _ => Some(Insn::Simple(opcodes::POP)),
        }
    }

    /// DUP or DUP2 for a value of the given type descriptor.
    pub fn dup_for_type(spec: &str) -> Option<Insn> {
        dup_for_size(descriptor::size_of(spec))
    }
}

fn dup_for_size(size: u8) -> Option<Insn> {
    match size {
        0 => None,
        2 => Some(Insn::Simple(opcodes::DUP2)),
        _ => Some(Insn::Simple(opcodes::DUP)),
    }
}

fn load_opcode_for(spec: &str) -> Result<u8, Error> {
    match spec.chars().next() {
        Some('D') => Ok(opcodes::DLOAD),
        Some('J') => Ok(opcodes::LLOAD),
        Some('F') => Ok(opcodes::FLOAD),
        Some('I') | Some('S') | Some('B') | Some('Z') | Some('C') => Ok(opcodes::ILOAD),
        Some('L') | Some('[') => Ok(opcodes::ALOAD),
        _ => Err(Error::MalformedDescriptor(format!(
            "no load opcode for {}",
            spec
        ))),
    }
}

fn return_opcode_for(spec: &str) -> Result<u8, Error> {
    match spec.chars().next() {
        Some('D') => Ok(opcodes::DRETURN),
        Some('J') => Ok(opcodes::LRETURN),
        Some('F') => Ok(opcodes::FRETURN),
        Some('I') | Some('S') | Some('B') | Some('Z') | Some('C') => Ok(opcodes::IRETURN),
        Some('V') => Ok(opcodes::RETURN),
        Some('L') | Some('[') => Ok(opcodes::ARETURN),
        _ => Err(Error::MalformedDescriptor(format!(
            "no return opcode for {}",
            spec
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::opcodes::*;

    #[test]
    fn slots_account_for_wide_types_and_the_receiver() {
        // instance method (long, int, double, String)
        let logistics = MethodLogistics::new(0, "(JIDLjava/lang/String;)V").unwrap();
        assert!(!logistics.is_static());
        assert_eq!(logistics.load_param(0).unwrap(), Insn::Var { opcode: LLOAD, index: 1 });
        assert_eq!(logistics.load_param(1).unwrap(), Insn::Var { opcode: ILOAD, index: 3 });
        assert_eq!(logistics.load_param(2).unwrap(), Insn::Var { opcode: DLOAD, index: 4 });
        assert_eq!(logistics.load_param(3).unwrap(), Insn::Var { opcode: ALOAD, index: 6 });
        assert_eq!(logistics.first_open_slot(), 7);

        let logistics = MethodLogistics::new(access::ACC_STATIC, "(JI)V").unwrap();
        assert!(logistics.is_static());
        assert_eq!(logistics.load_param(0).unwrap(), Insn::Var { opcode: LLOAD, index: 0 });
        assert_eq!(logistics.load_param(1).unwrap(), Insn::Var { opcode: ILOAD, index: 2 });
        assert_eq!(logistics.first_open_slot(), 3);
    }

    #[test]
    fn return_opcodes_follow_the_type() {
        let cases = [
            ("()V", RETURN, 0),
            ("()I", IRETURN, 1),
            ("()Z", IRETURN, 1),
            ("()J", LRETURN, 2),
            ("()F", FRETURN, 1),
            ("()D", DRETURN, 2),
            ("()Ljava/lang/String;", ARETURN, 1),
            ("()[I", ARETURN, 1),
        ];
        for (desc, opcode, size) in cases {
            let logistics = MethodLogistics::new(access::ACC_STATIC, desc).unwrap();
            assert_eq!(logistics.return_opcode(), opcode, "{}", desc);
            assert_eq!(logistics.return_size(), size, "{}", desc);
        }
    }

    #[test]
    fn dup_and_pop_track_return_size() {
        let void = MethodLogistics::new(access::ACC_STATIC, "()V").unwrap();
        assert_eq!(void.dup_for_return(), None);
        assert_eq!(void.pop_for_return(), None);

        let long = MethodLogistics::new(access::ACC_STATIC, "()J").unwrap();
        assert_eq!(long.dup_for_return(), Some(Insn::Simple(DUP2)));
        assert_eq!(long.pop_for_return(), Some(Insn::Simple(POP2)));

        let int = MethodLogistics::new(access::ACC_STATIC, "()I").unwrap();
        assert_eq!(int.dup_for_return(), Some(Insn::Simple(DUP)));
        assert_eq!(int.pop_for_return(), Some(Insn::Simple(POP)));
    }

    #[test]
    fn this_is_null_in_static_methods() {
        let s = MethodLogistics::new(access::ACC_STATIC, "()V").unwrap();
        assert_eq!(s.load_this(), Insn::Simple(ACONST_NULL));
        let i = MethodLogistics::new(0, "()V").unwrap();
        assert_eq!(i.load_this(), Insn::Var { opcode: ALOAD, index: 0 });
    }
}
