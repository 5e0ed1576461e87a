//! ReplaceMethodCall: reroute calls to a chosen method elsewhere

use std::collections::HashSet;

use super::{
    affected_union, class_matches, collect_requests, describe_matchers, finish,
    load_requested_args, patch_matched_methods, read_unit, transplant, HookDispatch, Matcher,
    PatchContext, StackRequest,
};
use crate::classfile::insn::Insn;
use crate::error::Error;
use crate::hook::Hook;
use crate::target::TargetMatcher;

/// Scans the matched methods for calls to one specific method and replaces
/// each such call with a call to a static replacement.
///
/// Compatibility is the caller's job: the replacement's leading parameters
/// must accept the receiver (for instance calls) and the original
/// arguments, its trailing parameters the requested extras, and its return
/// type whatever the original call returned.
pub struct ReplaceMethodCallScript {
    matchers: Vec<Matcher>,
    method_to_replace: Hook,
    replacement: Hook,
    transplant: bool,
    insert: bool,
    extra_requests: HashSet<StackRequest>,
}

impl ReplaceMethodCallScript {
    pub fn name(&self) -> String {
        format!(
            "replace {} with {} in {}",
            self.method_to_replace.method_name(),
            self.replacement.method_name(),
            describe_matchers(&self.matchers)
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
        let dispatch = HookDispatch::prepare(
            self.replacement.clone(),
            self.transplant,
            self.insert,
            ctx,
            unit.major_version,
        )?;

        let inner_owner = self.method_to_replace.class_spec();
        let inner_name = self.method_to_replace.method_name().to_string();
        let inner_desc = self.method_to_replace.method_descriptor();

        let changed = patch_matched_methods(&mut unit, &self.matchers, |body, logistics, _, _| {
            let sites = body.find_insns(|i| {
                matches!(i, Insn::Method { owner, name, descriptor, .. }
                    if *owner == inner_owner && *name == inner_name && *descriptor == inner_desc)
            });
            if sites.is_empty() {
                return Ok(false);
            }
            for &at in sites.iter().rev() {
                let mut seq = Vec::new();
                let slots = load_requested_args(&mut seq, logistics, &self.extra_requests)?;
                dispatch.emit(&class_spec, body, &mut seq);
                body.note_extra_stack(slots + 2);
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

pub struct ReplaceMethodCallBuilder {
    matchers: Vec<Matcher>,
    replacement_method: Option<Hook>,
    method_to_replace: Option<Hook>,
    transplant: bool,
    insert: bool,
    extra_requests: Vec<StackRequest>,
}

impl ReplaceMethodCallBuilder {
    pub(super) fn new() -> ReplaceMethodCallBuilder {
        ReplaceMethodCallBuilder {
            matchers: Vec::new(),
            replacement_method: None,
            method_to_replace: None,
            transplant: false,
            insert: false,
            extra_requests: Vec::new(),
        }
    }

    pub fn target(mut self, matcher: impl TargetMatcher + 'static) -> ReplaceMethodCallBuilder {
        self.matchers.push(std::sync::Arc::new(matcher));
        self
    }

    /// The static method the calls are rerouted to.
    pub fn replacement_method(mut self, hook: Hook) -> ReplaceMethodCallBuilder {
        self.replacement_method = Some(hook);
        self
    }

    /// The call site to look for inside the targeted methods.
    pub fn method_to_replace(mut self, hook: Hook) -> ReplaceMethodCallBuilder {
        self.method_to_replace = Some(hook);
        self
    }

    pub fn transplant(mut self) -> ReplaceMethodCallBuilder {
        self.transplant = true;
        self.insert = false;
        self
    }

    pub fn insert(mut self) -> ReplaceMethodCallBuilder {
        self.insert = true;
        self.transplant = false;
        self
    }

    pub fn request_extra(mut self, requests: &[StackRequest]) -> ReplaceMethodCallBuilder {
        self.extra_requests.extend_from_slice(requests);
        self
    }

    pub fn build(self) -> Result<super::PatchScript, Error> {
        if self.matchers.is_empty() {
            return Err(Error::InvalidConfiguration(
                "a target method matcher is required".into(),
            ));
        }
        let replacement = self.replacement_method.ok_or_else(|| {
            Error::InvalidConfiguration("a replacement method is required".into())
        })?;
        let method_to_replace = self.method_to_replace.ok_or_else(|| {
            Error::InvalidConfiguration("a method call to replace is required".into())
        })?;
        let extra_requests =
            collect_requests(&self.extra_requests, false, "a replace-method-call script")?;
        Ok(super::PatchScript::ReplaceMethodCall(ReplaceMethodCallScript {
            matchers: self.matchers,
            method_to_replace,
            replacement,
            transplant: self.transplant,
            insert: self.insert,
            extra_requests,
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
    fn the_call_is_gone_and_the_replacement_is_there() {
        let script = ScriptBuilder::replace_method_call()
            .target(MethodTarget::new("test.Sample", "run").unwrap())
            .method_to_replace(Hook::new("test.Sample", "first", "void", &[]))
            .replacement_method(Hook::new(
                "test/Hooks",
                "firstInstead",
                "void",
                &["test.Sample", "java.lang.Object"],
            ))
            .request_extra(&[StackRequest::This])
            .build()
            .unwrap();

        let patched = script
            .patch("test/Sample", &sample_class(), &test_context())
            .unwrap()
            .expect("patched");
        let insns = insns_of(&patched, "run", "(ILjava/lang/String;)V");

        assert!(!insns
            .iter()
            .any(|i| matches!(i, Insn::Method { name, opcode: INVOKEVIRTUAL, .. } if name == "first")));
        let at = insns
            .iter()
            .position(|i| matches!(i, Insn::Method { name, .. } if name == "firstInstead"))
            .unwrap();
        // the receiver the original call would have consumed is still on the
        // stack below the extra this
        assert!(matches!(insns[at - 1], Insn::Var { opcode: ALOAD, index: 0 }));
        assert!(
            matches!(&insns[at], Insn::Method { opcode: INVOKESTATIC, owner, .. } if owner == "test/Hooks")
        );
        // second() stays untouched
        assert!(insns
            .iter()
            .any(|i| matches!(i, Insn::Method { name, opcode: INVOKEVIRTUAL, .. } if name == "second")));
    }

    #[test]
    fn extras_never_include_the_return_value() {
        let err = ScriptBuilder::replace_method_call()
            .target(MethodTarget::new("a.B", "m").unwrap())
            .method_to_replace(Hook::new("a.C", "x", "void", &[]))
            .replacement_method(Hook::new("a/H", "y", "void", &[]))
            .request_extra(&[StackRequest::ReturnValue])
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }
}
