//! WrapMethodCall: run a hook right after calls to a chosen method

use std::collections::HashSet;

use super::{
    affected_union, class_matches, collect_requests, describe_matchers, finish,
    load_requested_args, patch_matched_methods, read_unit, transplant, HookDispatch, Matcher,
    PatchContext, StackRequest,
};
use crate::classfile::insn::{Insn, Node};
use crate::descriptor;
use crate::error::Error;
use crate::hook::Hook;
use crate::logistics::MethodLogistics;
use crate::target::TargetMatcher;

/// Scans the matched methods for calls to one specific method (owner, name
/// and descriptor all have to agree) and invokes the wrapper right after
/// each such call.
///
/// A `void` wrapper observes: the inner call's result is duplicated for it
/// and stays on the stack. A wrapper returning the inner call's type
/// replaces the result with its own. Extra outer-method values (`This`,
/// `ParamN`) are pushed after the tentative result.
pub struct WrapMethodCallScript {
    matchers: Vec<Matcher>,
    call_to_wrap: Hook,
    wrapper: Hook,
    transplant: bool,
    insert: bool,
    extra_requests: HashSet<StackRequest>,
}

impl WrapMethodCallScript {
    pub fn name(&self) -> String {
        format!(
            "wrap calls to {} with {} in {}",
            self.call_to_wrap.method_name(),
            self.wrapper.method_name(),
            describe_matchers(&self.matchers)
        )
    }

    pub fn classes_to_reload(&self) -> Vec<String> {
        affected_union(&self.matchers)
    }

    fn leave_return_value_intact(&self) -> bool {
        self.wrapper.returns_void() && !self.call_to_wrap.returns_void()
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

        let inner_owner = self.call_to_wrap.class_spec();
        let inner_name = self.call_to_wrap.method_name().to_string();
        let inner_desc = self.call_to_wrap.method_descriptor();
        let inner_return = descriptor::decompose_full_desc(&inner_desc)?[0].clone();
        let leave_intact = self.leave_return_value_intact();

        let changed = patch_matched_methods(&mut unit, &self.matchers, |body, logistics, _, _| {
            let sites = body.find_insns(|i| {
                matches!(i, Insn::Method { owner, name, descriptor, .. }
                    if *owner == inner_owner && *name == inner_name && *descriptor == inner_desc)
            });
            if sites.is_empty() {
                return Ok(false);
            }
            for &at in sites.iter().rev() {
                let Node::Insn(call) = body.nodes[at].clone() else { continue };
                let mut seq = vec![Node::Insn(call)];
                if leave_intact {
                    seq.extend(MethodLogistics::dup_for_type(&inner_return).map(Node::Insn));
                }
                let slots = load_requested_args(&mut seq, logistics, &self.extra_requests)?;
                dispatch.emit(&class_spec, body, &mut seq);
                body.note_extra_stack(slots + 4);
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

pub struct WrapMethodCallBuilder {
    matchers: Vec<Matcher>,
    wrap_method: Option<Hook>,
    method_to_wrap: Option<Hook>,
    transplant: bool,
    insert: bool,
    extra_requests: Vec<StackRequest>,
}

impl WrapMethodCallBuilder {
    pub(super) fn new() -> WrapMethodCallBuilder {
        WrapMethodCallBuilder {
            matchers: Vec::new(),
            wrap_method: None,
            method_to_wrap: None,
            transplant: false,
            insert: false,
            extra_requests: Vec::new(),
        }
    }

    pub fn target(mut self, matcher: impl TargetMatcher + 'static) -> WrapMethodCallBuilder {
        self.matchers.push(std::sync::Arc::new(matcher));
        self
    }

    /// The hook invoked after each wrapped call. If the wrapped call
    /// returns a value, the hook's first parameter must be compatible with
    /// it; further parameters follow the extra requests.
    pub fn wrap_method(mut self, hook: Hook) -> WrapMethodCallBuilder {
        self.wrap_method = Some(hook);
        self
    }

    /// The call site to look for inside the targeted methods.
    pub fn method_to_wrap(mut self, hook: Hook) -> WrapMethodCallBuilder {
        self.method_to_wrap = Some(hook);
        self
    }

    pub fn transplant(mut self) -> WrapMethodCallBuilder {
        self.transplant = true;
        self.insert = false;
        self
    }

    pub fn insert(mut self) -> WrapMethodCallBuilder {
        self.insert = true;
        self.transplant = false;
        self
    }

    /// Extra values of the *outer* method to pass along (never the wrapped
    /// call's own arguments).
    pub fn request_extra(mut self, requests: &[StackRequest]) -> WrapMethodCallBuilder {
        self.extra_requests.extend_from_slice(requests);
        self
    }

    pub fn build(self) -> Result<super::PatchScript, Error> {
        if self.matchers.is_empty() {
            return Err(Error::InvalidConfiguration(
                "a target method matcher is required".into(),
            ));
        }
        let wrapper = self.wrap_method.ok_or_else(|| {
            Error::InvalidConfiguration("a method to wrap with is required".into())
        })?;
        let call_to_wrap = self.method_to_wrap.ok_or_else(|| {
            Error::InvalidConfiguration("a method call to wrap is required".into())
        })?;
        let extra_requests =
            collect_requests(&self.extra_requests, false, "a wrap-method-call script")?;
        Ok(super::PatchScript::WrapMethodCall(WrapMethodCallScript {
            matchers: self.matchers,
            call_to_wrap,
            wrapper,
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
    fn observer_runs_after_the_matched_call_only() {
        let script = ScriptBuilder::wrap_method_call()
            .target(MethodTarget::new("test.Sample", "run").unwrap())
            .method_to_wrap(Hook::new("test.Sample", "second", "void", &[]))
            .wrap_method(Hook::new("test/Hooks", "afterSecond", "void", &["java.lang.Object"]))
            .request_extra(&[StackRequest::This])
            .build()
            .unwrap();

        let patched = script
            .patch("test/Sample", &sample_class(), &test_context())
            .unwrap()
            .expect("patched");
        let insns = insns_of(&patched, "run", "(ILjava/lang/String;)V");

        let second = insns
            .iter()
            .position(|i| matches!(i, Insn::Method { name, .. } if name == "second"))
            .unwrap();
        assert!(matches!(insns[second + 1], Insn::Var { opcode: ALOAD, index: 0 }));
        assert!(
            matches!(&insns[second + 2], Insn::Method { opcode: INVOKESTATIC, name, .. }
                if name == "afterSecond")
        );

        // the call to first() is not followed by the wrapper
        let first = insns
            .iter()
            .position(|i| matches!(i, Insn::Method { name, .. } if name == "first"))
            .unwrap();
        assert!(!matches!(&insns[first + 1], Insn::Method { name, .. } if name == "afterSecond"));
    }

    #[test]
    fn void_wrapper_around_valued_call_duplicates_the_result() {
        let script = ScriptBuilder::wrap_method_call()
            .target(MethodTarget::new("test.Sample", "caller").unwrap())
            .method_to_wrap(Hook::new("test.Sample", "answer", "int", &["int"]))
            .wrap_method(Hook::new("test/Hooks", "observe", "void", &["int"]))
            .build()
            .unwrap();

        // build a sample with a method calling answer(int)
        use crate::classfile::insn::{Body, Insn as I, Node};
        use crate::classfile::{read_class, write_class, MethodCode, MethodUnit};
        let mut unit = read_class(&sample_class()).unwrap();
        let mut body = Body::new();
        body.nodes.extend([
            Node::Insn(I::Var { opcode: ALOAD, index: 0 }),
            Node::Insn(I::Simple(0x04)), // iconst_1
            Node::Insn(I::Method {
                opcode: INVOKEVIRTUAL,
                owner: String::from("test/Sample"),
                name: String::from("answer"),
                descriptor: String::from("(I)I"),
                interface: false,
            }),
            Node::Insn(I::Simple(IRETURN)),
        ]);
        unit.methods.push(MethodUnit {
            access_flags: access::ACC_PUBLIC,
            name: String::from("caller"),
            descriptor: String::from("()I"),
            code: Some(MethodCode::Edited(body)),
            attributes: Vec::new(),
        });
        let bytes = write_class(&mut unit).unwrap();

        let patched = script
            .patch("test/Sample", &bytes, &test_context())
            .unwrap()
            .expect("patched");
        let insns = insns_of(&patched, "caller", "()I");
        let call = insns
            .iter()
            .position(|i| matches!(i, Insn::Method { name, .. } if name == "answer"))
            .unwrap();
        assert!(matches!(insns[call + 1], Insn::Simple(DUP)));
        assert!(matches!(&insns[call + 2], Insn::Method { name, .. } if name == "observe"));
        assert!(matches!(insns[call + 3], Insn::Simple(IRETURN)));
    }
}
