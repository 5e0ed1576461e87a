//! ExitEarly: give a hook the chance to return before the method body runs

use std::collections::HashSet;

use super::{
    affected_union, class_matches, collect_requests, describe_matchers, finish,
    load_requested_args, patch_matched_methods, read_unit, transplant, HookDispatch, Matcher,
    PatchContext, StackRequest,
};
use crate::classfile::insn::{Insn, Node};
use crate::classfile::opcodes;
use crate::error::Error;
use crate::hook::Hook;
use crate::target::TargetMatcher;

/// Prepends a prologue to every matched method: the decision hook is asked
/// (with the requested arguments) whether to exit; if it says yes, the
/// value hook supplies the return value and the method returns without
/// running its body.
///
/// Special shapes:
/// - no decision hook: the method exits unconditionally (the body becomes
///   unreachable and is squashed away);
/// - a `void` decision hook: the call is inserted and the method always
///   continues — an entry callback, not an exit.
pub struct ExitEarlyScript {
    matchers: Vec<Matcher>,
    decision: Option<Hook>,
    value: Option<Hook>,
    transplant: bool,
    insert: bool,
    requests: HashSet<StackRequest>,
}

impl ExitEarlyScript {
    pub fn name(&self) -> String {
        format!("exit early from {}", describe_matchers(&self.matchers))
    }

    pub fn classes_to_reload(&self) -> Vec<String> {
        affected_union(&self.matchers)
    }

    fn insert_call_only(&self) -> bool {
        self.decision.as_ref().map(|h| h.returns_void()).unwrap_or(false)
    }

    pub fn patch(
        &self,
        class_name: &str,
        bytes: &[u8],
        ctx: &PatchContext,
    ) -> Result<Option<Vec<u8>>, Error> {
        if !class_matches(class_name, &self.classes_to_reload()) {
            return Ok(None);
        }
        let mut unit = read_unit(bytes)?;
        let version = unit.major_version;
        let class_spec = unit.name.clone();

        let decision = self
            .decision
            .clone()
            .map(|h| HookDispatch::prepare(h, self.transplant, self.insert, ctx, version))
            .transpose()?;
        let value = self
            .value
            .clone()
            .map(|h| HookDispatch::prepare(h, self.transplant, self.insert, ctx, version))
            .transpose()?;
        let insert_call_only = self.insert_call_only();

        let changed = patch_matched_methods(&mut unit, &self.matchers, |body, logistics, name, desc| {
            let returns_value = logistics.return_opcode() != opcodes::RETURN;
            if returns_value && value.is_none() && !insert_call_only {
                return Err(Error::InvalidConfiguration(format!(
                    "{}{} returns a value but no value hook was provided",
                    name, desc
                )));
            }

            let mut prologue = Vec::new();
            let mut slots = 0u16;

            if let Some(decision) = &decision {
                slots = load_requested_args(&mut prologue, logistics, &self.requests)?;
                decision.emit(&class_spec, body, &mut prologue);
                if insert_call_only {
                    body.note_extra_stack(slots + 2);
                    body.prepend(prologue);
                    return Ok(true);
                }
            }

            // the early return, guarded by the decision result when there is one
            let resume = body.fresh_label();
            if decision.is_some() {
                prologue.push(Node::Insn(Insn::Jump {
                    opcode: opcodes::IFEQ,
                    target: resume,
                }));
            }
            if returns_value {
                let value = value.as_ref().expect("checked above");
                slots = slots.max(load_requested_args(&mut prologue, logistics, &self.requests)?);
                value.emit(&class_spec, body, &mut prologue);
            }
            prologue.push(Node::Insn(logistics.return_insn()));
            if decision.is_some() {
                prologue.push(Node::Label(resume));
            }

            body.note_extra_stack(slots + 2 + logistics.return_size() as u16);
            body.prepend(prologue);
            Ok(true)
        })?;

        if changed {
            for dispatch in [&decision, &value].into_iter().flatten() {
                if let Some(hook) = dispatch.pending_transplant() {
                    transplant(&mut unit, hook, ctx)?;
                }
            }
        }
        finish(unit, changed)
    }
}

pub struct ExitEarlyBuilder {
    matchers: Vec<Matcher>,
    decision: Option<Hook>,
    value: Option<Hook>,
    transplant: bool,
    insert: bool,
    requests: Vec<StackRequest>,
}

impl ExitEarlyBuilder {
    pub(super) fn new() -> ExitEarlyBuilder {
        ExitEarlyBuilder {
            matchers: Vec::new(),
            decision: None,
            value: None,
            transplant: false,
            insert: false,
            requests: Vec::new(),
        }
    }

    /// A method to patch. May be called more than once.
    pub fn target(mut self, matcher: impl TargetMatcher + 'static) -> ExitEarlyBuilder {
        self.matchers.push(std::sync::Arc::new(matcher));
        self
    }

    /// Decides per call whether to exit early. Must return `boolean`, or
    /// `void` for the call-and-continue shape. Omitting it means
    /// "always exit".
    pub fn decision_method(mut self, hook: Hook) -> ExitEarlyBuilder {
        self.decision = Some(hook);
        self
    }

    /// Supplies the early return value. Required when the targeted methods
    /// return one; must return the same type.
    pub fn value_method(mut self, hook: Hook) -> ExitEarlyBuilder {
        self.value = Some(hook);
        self
    }

    /// Copy the hooks into the patched class. See the module docs.
    pub fn transplant(mut self) -> ExitEarlyBuilder {
        self.transplant = true;
        self.insert = false;
        self
    }

    /// Paste the hook bodies at the call site. See the module docs.
    pub fn insert(mut self) -> ExitEarlyBuilder {
        self.insert = true;
        self.transplant = false;
        self
    }

    /// The values the hooks receive, in canonical order.
    pub fn request(mut self, requests: &[StackRequest]) -> ExitEarlyBuilder {
        self.requests.extend_from_slice(requests);
        self
    }

    pub fn build(self) -> Result<super::PatchScript, Error> {
        if self.matchers.is_empty() {
            return Err(Error::InvalidConfiguration(
                "a target method matcher is required".into(),
            ));
        }
        let requests = collect_requests(&self.requests, false, "an exit-early script")?;
        if let Some(decision) = &self.decision {
            if decision.return_type() != "boolean" && !decision.returns_void() {
                return Err(Error::InvalidConfiguration(format!(
                    "the decision hook must return boolean or void, not {}",
                    decision.return_type()
                )));
            }
        }
        Ok(super::PatchScript::ExitEarly(ExitEarlyScript {
            matchers: self.matchers,
            decision: self.decision,
            value: self.value,
            transplant: self.transplant,
            insert: self.insert,
            requests,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::opcodes::*;
    use crate::manager::test_context;
    use crate::scripts::ScriptBuilder;
    use crate::target::MethodTarget;
    use crate::testutil::{insns_of, sample_class};

    #[test]
    fn guarded_prologue_shape() {
        let script = ScriptBuilder::exit_early()
            .target(MethodTarget::new("test.Sample", "run").unwrap())
            .decision_method(Hook::new(
                "test/Hooks",
                "shouldSkip",
                "boolean",
                &["java.lang.Object", "int"],
            ))
            .request(&[StackRequest::This, StackRequest::Param1])
            .build()
            .unwrap();

        let bytes = sample_class();
        let patched = script
            .patch("test/Sample", &bytes, &test_context())
            .unwrap()
            .expect("patched");

        let insns = insns_of(&patched, "run", "(ILjava/lang/String;)V");
        // this, param1, decision, ifeq, return, then the original body
        assert!(matches!(insns[0], Insn::Var { opcode: ALOAD, index: 0 }));
        assert!(matches!(insns[1], Insn::Var { opcode: ILOAD, index: 1 }));
        assert!(
            matches!(&insns[2], Insn::Method { opcode: INVOKESTATIC, owner, name, .. }
                if owner == "test/Hooks" && name == "shouldSkip")
        );
        assert!(matches!(insns[3], Insn::Jump { opcode: IFEQ, .. }));
        assert!(matches!(insns[4], Insn::Simple(RETURN)));
        assert!(insns.len() > 5);
    }

    #[test]
    fn value_hook_is_required_for_valued_returns() {
        let script = ScriptBuilder::exit_early()
            .target(MethodTarget::new("test.Sample", "answer").unwrap())
            .decision_method(Hook::new("test/Hooks", "decide", "boolean", &[]))
            .build()
            .unwrap();
        let err = script
            .patch("test/Sample", &sample_class(), &test_context())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn void_decision_hook_only_inserts_the_call() {
        let script = ScriptBuilder::exit_early()
            .target(MethodTarget::new("test.Sample", "answer").unwrap())
            .decision_method(Hook::new("test/Hooks", "observe", "void", &["int"]))
            .request(&[StackRequest::Param1])
            .build()
            .unwrap();
        let patched = script
            .patch("test/Sample", &sample_class(), &test_context())
            .unwrap()
            .expect("patched");
        let insns = insns_of(&patched, "answer", "(I)I");
        assert!(matches!(insns[0], Insn::Var { opcode: ILOAD, index: 1 }));
        assert!(
            matches!(&insns[1], Insn::Method { name, .. } if name == "observe")
        );
        // no branch, no early return: the body continues
        assert!(!insns.iter().any(|i| matches!(i, Insn::Jump { opcode: IFEQ, .. })));
    }

    #[test]
    fn unconditional_exit_squashes_the_body() {
        let script = ScriptBuilder::exit_early()
            .target(MethodTarget::new("test.Sample", "run").unwrap())
            .build()
            .unwrap();
        let patched = script
            .patch("test/Sample", &sample_class(), &test_context())
            .unwrap()
            .expect("patched");
        let insns = insns_of(&patched, "run", "(ILjava/lang/String;)V");
        assert!(matches!(insns[0], Insn::Simple(RETURN)));
        // the old body is nops ending in athrow
        assert!(matches!(insns.last(), Some(Insn::Simple(ATHROW))));
        assert!(insns[1..insns.len() - 1]
            .iter()
            .all(|i| matches!(i, Insn::Simple(NOP))));
    }

    #[test]
    fn rejects_bad_decision_return_type() {
        let err = ScriptBuilder::exit_early()
            .target(MethodTarget::new("a.B", "m").unwrap())
            .decision_method(Hook::new("a/H", "d", "int", &[]))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn rejects_return_value_request() {
        let err = ScriptBuilder::exit_early()
            .target(MethodTarget::new("a.B", "m").unwrap())
            .request(&[StackRequest::ReturnValue])
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }
}
