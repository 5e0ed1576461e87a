//! WrapReturnValues: run a hook right before every return

use std::collections::HashSet;

use super::{
    affected_union, class_matches, collect_requests, describe_matchers, finish,
    load_requested_args, patch_matched_methods, read_unit, transplant, HookDispatch, Matcher,
    PatchContext, StackRequest,
};
use crate::classfile::insn::{Insn, Node};
use crate::classfile::opcodes;
use crate::descriptor;
use crate::error::Error;
use crate::hook::Hook;
use crate::target::TargetMatcher;

/// Finds every return instruction of every matched method and inserts a
/// call to the wrapper in front of it.
///
/// The wrapper's own return type decides the data flow: a `void` wrapper
/// observes (the tentative value is duplicated for it when requested), a
/// non-void wrapper *hijacks* — it consumes the tentative value (or has it
/// popped when it never asked for it) and its result is returned instead.
pub struct WrapReturnValuesScript {
    matchers: Vec<Matcher>,
    wrapper: Hook,
    transplant: bool,
    insert: bool,
    cast: bool,
    requests: HashSet<StackRequest>,
}

impl WrapReturnValuesScript {
    pub fn name(&self) -> String {
        format!(
            "wrap returns of {} with {}",
            describe_matchers(&self.matchers),
            self.wrapper.method_name()
        )
    }

    pub fn classes_to_reload(&self) -> Vec<String> {
        affected_union(&self.matchers)
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
        let class_spec = unit.name.clone();
        let dispatch =
            HookDispatch::prepare(self.wrapper.clone(), self.transplant, self.insert, ctx, unit.major_version)?;
        let hijack = !self.wrapper.returns_void();
        let wants_value = self.requests.contains(&StackRequest::ReturnValue);

        let changed = patch_matched_methods(&mut unit, &self.matchers, |body, logistics, _, _| {
            let return_opcode = logistics.return_opcode();
            let sites = body.find_insns(|i| matches!(i, Insn::Simple(op) if *op == return_opcode));
            if sites.is_empty() {
                return Ok(false);
            }
            let cast_to = if self.cast {
                Some(descriptor::class_info_of(logistics.return_spec()).ok_or_else(|| {
                    Error::InvalidConfiguration(format!(
                        "cast requires a reference return type, found {}",
                        logistics.return_spec()
                    ))
                })?)
            } else {
                None
            };

            for &at in sites.iter().rev() {
                let mut seq = Vec::new();
                if wants_value {
                    // the wrapper reads the value; keep a copy on the stack
                    // unless the wrapper replaces it anyway
                    if !hijack {
                        seq.extend(logistics.dup_for_return().map(Node::Insn));
                    }
                } else if hijack {
                    // the wrapper ignores the tentative value and supplies
                    // its own; drop the original
                    seq.extend(logistics.pop_for_return().map(Node::Insn));
                }
                let slots = load_requested_args(&mut seq, logistics, &self.requests)?;
                dispatch.emit(&class_spec, body, &mut seq);
                if let Some(target) = &cast_to {
                    seq.push(Node::Insn(Insn::Type {
                        opcode: opcodes::CHECKCAST,
                        class_name: target.clone(),
                    }));
                }
                seq.push(Node::Insn(logistics.return_insn()));
                body.note_extra_stack(slots + 2 + logistics.return_size() as u16);
                body.splice(at, seq);
            }
            Ok(true)
        })?;

        if changed {
            if let Some(hook) = dispatch.pending_transplant() {
                transplant(&mut unit, hook, ctx)?;
            }
        }
        finish(unit, changed)
    }
}

pub struct WrapReturnValuesBuilder {
    matchers: Vec<Matcher>,
    wrapper: Option<Hook>,
    transplant: bool,
    insert: bool,
    cast: bool,
    requests: Vec<StackRequest>,
}

impl WrapReturnValuesBuilder {
    pub(super) fn new() -> WrapReturnValuesBuilder {
        WrapReturnValuesBuilder {
            matchers: Vec::new(),
            wrapper: None,
            transplant: false,
            insert: false,
            cast: false,
            requests: Vec::new(),
        }
    }

    pub fn target(mut self, matcher: impl TargetMatcher + 'static) -> WrapReturnValuesBuilder {
        self.matchers.push(std::sync::Arc::new(matcher));
        self
    }

    /// The hook invoked in front of each return. Must be static.
    pub fn wrap_method(mut self, hook: Hook) -> WrapReturnValuesBuilder {
        self.wrapper = Some(hook);
        self
    }

    pub fn transplant(mut self) -> WrapReturnValuesBuilder {
        self.transplant = true;
        self.insert = false;
        self
    }

    pub fn insert(mut self) -> WrapReturnValuesBuilder {
        self.insert = true;
        self.transplant = false;
        self
    }

    /// The wrapper returns `java.lang.Object`; checkcast its result to the
    /// patched method's return type.
    pub fn cast(mut self) -> WrapReturnValuesBuilder {
        self.cast = true;
        self
    }

    pub fn request(mut self, requests: &[StackRequest]) -> WrapReturnValuesBuilder {
        self.requests.extend_from_slice(requests);
        self
    }

    pub fn build(self) -> Result<super::PatchScript, Error> {
        if self.matchers.is_empty() {
            return Err(Error::InvalidConfiguration(
                "a target method matcher is required".into(),
            ));
        }
        let wrapper = self.wrapper.ok_or_else(|| {
            Error::InvalidConfiguration("a wrap method is required".into())
        })?;
        if self.cast && self.insert {
            return Err(Error::InvalidConfiguration(
                "cast and insert are mutually exclusive".into(),
            ));
        }
        let requests = collect_requests(&self.requests, true, "a wrap-return-values script")?;
        Ok(super::PatchScript::WrapReturnValues(WrapReturnValuesScript {
            matchers: self.matchers,
            wrapper,
            transplant: self.transplant,
            insert: self.insert,
            cast: self.cast,
            requests,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::opcodes::*;
    use crate::classfile::read_class;
    use crate::manager::test_context;
    use crate::resolve::{IdentityMapper, MemoryClasses};
    use crate::scripts::ScriptBuilder;
    use crate::target::MethodTarget;
    use crate::testutil::{hooks_class, insns_of, sample_class};

    fn wrap_foo_script(transplant: bool) -> super::super::PatchScript {
        let builder = ScriptBuilder::wrap_return_value()
            .target(
                MethodTarget::with_signature(
                    "test.Sample",
                    "foo",
                    "int",
                    &["int", "java.lang.String[]"],
                )
                .unwrap(),
            )
            .wrap_method(Hook::new(
                "test/Hooks",
                "doubled",
                "int",
                &["int", "java.lang.Object", "int", "java.lang.String[]"],
            ))
            .request(&[
                StackRequest::This,
                StackRequest::ReturnValue,
                StackRequest::Param1,
                StackRequest::Param2,
            ]);
        let builder = if transplant { builder.transplant() } else { builder };
        builder.build().unwrap()
    }

    #[test]
    fn every_return_goes_through_the_hook() {
        let script = wrap_foo_script(false);
        let patched = script
            .patch("test/Sample", &sample_class(), &test_context())
            .unwrap()
            .expect("patched");

        let insns = insns_of(&patched, "foo", "(I[Ljava/lang/String;)I");
        let returns: Vec<usize> = insns
            .iter()
            .enumerate()
            .filter(|(_, i)| matches!(i, Insn::Simple(IRETURN)))
            .map(|(at, _)| at)
            .collect();
        assert_eq!(returns.len(), 2);
        for at in returns {
            // ... invoke doubled; ireturn — and the value was consumed, not duplicated
            assert!(
                matches!(&insns[at - 1], Insn::Method { opcode: INVOKESTATIC, owner, name, .. }
                    if owner == "test/Hooks" && name == "doubled")
            );
            // hijacking wrapper asked for the value: no dup, the value is
            // consumed, with this/param1/param2 pushed after it
            assert!(matches!(insns[at - 4], Insn::Var { opcode: ALOAD, index: 0 }));
            assert!(matches!(insns[at - 3], Insn::Var { opcode: ILOAD, index: 1 }));
            assert!(matches!(insns[at - 2], Insn::Var { opcode: ALOAD, index: 2 }));
        }
        // untargeted methods keep their shape
        let answer = insns_of(&patched, "answer", "(I)I");
        assert!(!answer
            .iter()
            .any(|i| matches!(i, Insn::Method { name, .. } if name == "doubled")));
    }

    #[test]
    fn transplant_copies_the_hook_method_in() {
        let mut hooks = MemoryClasses::new();
        hooks.put("test/Hooks.class", hooks_class());
        let ctx = PatchContext { mapper: &IdentityMapper, hooks: &hooks };

        let script = wrap_foo_script(true);
        let patched = script
            .patch("test/Sample", &sample_class(), &ctx)
            .unwrap()
            .expect("patched");

        let unit = read_class(&patched).unwrap();
        assert!(unit.has_method("doubled", "(ILjava/lang/Object;I[Ljava/lang/String;)I"));
        // and the calls dispatch to the patched class itself
        let insns = insns_of(&patched, "foo", "(I[Ljava/lang/String;)I");
        assert!(insns.iter().any(
            |i| matches!(i, Insn::Method { opcode: INVOKESTATIC, owner, name, .. }
                if owner == "test/Sample" && name == "doubled")
        ));

        // a second application skips the transplant instead of doubling it
        let again = script.patch("test/Sample", &patched, &ctx).unwrap().expect("patched");
        let unit = read_class(&again).unwrap();
        let count = unit
            .methods
            .iter()
            .filter(|m| m.name == "doubled")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn transplant_without_a_source_is_unresolvable() {
        let script = wrap_foo_script(true);
        let err = script
            .patch("test/Sample", &sample_class(), &test_context())
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvableHook(_)));
    }

    #[test]
    fn void_observer_duplicates_the_value() {
        let script = ScriptBuilder::wrap_return_value()
            .target(MethodTarget::new("test.Sample", "answer").unwrap())
            .wrap_method(Hook::new("test/Hooks", "observe", "void", &["int"]))
            .request(&[StackRequest::ReturnValue])
            .build()
            .unwrap();
        let patched = script
            .patch("test/Sample", &sample_class(), &test_context())
            .unwrap()
            .expect("patched");
        let insns = insns_of(&patched, "answer", "(I)I");
        let returns: Vec<usize> = insns
            .iter()
            .enumerate()
            .filter(|(_, i)| matches!(i, Insn::Simple(IRETURN)))
            .map(|(at, _)| at)
            .collect();
        assert_eq!(returns.len(), 2);
        for at in returns {
            assert!(matches!(&insns[at - 1], Insn::Method { name, .. } if name == "observe"));
            assert!(matches!(insns[at - 2], Insn::Simple(DUP)));
        }
    }

    #[test]
    fn hijacker_that_ignores_the_value_pops_it() {
        let script = ScriptBuilder::wrap_return_value()
            .target(MethodTarget::new("test.Sample", "answer").unwrap())
            .wrap_method(Hook::new("test/Hooks", "supply", "int", &[]))
            .build()
            .unwrap();
        let patched = script
            .patch("test/Sample", &sample_class(), &test_context())
            .unwrap()
            .expect("patched");
        let insns = insns_of(&patched, "answer", "(I)I");
        let at = insns
            .iter()
            .position(|i| matches!(i, Insn::Simple(IRETURN)))
            .unwrap();
        assert!(matches!(&insns[at - 1], Insn::Method { name, .. } if name == "supply"));
        assert!(matches!(insns[at - 2], Insn::Simple(POP)));
    }

    #[test]
    fn cast_and_insert_exclude_each_other() {
        let err = ScriptBuilder::wrap_return_value()
            .target(MethodTarget::new("a.B", "m").unwrap())
            .wrap_method(Hook::new("a/H", "w", "java.lang.Object", &[]))
            .cast()
            .insert()
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }
}
