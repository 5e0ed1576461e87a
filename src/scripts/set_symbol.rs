//! SetSymbolDuringMethodCall: bracket a call with a thread-local symbol
//!
//! Each matched call site is rerouted through a synthetic static wrapper
//! generated into the patched class. The wrapper pushes the symbol, makes
//! the original call, and pops on both the normal and the exceptional exit,
//! so the symbol stack height is identical on every path through.

use super::{
    affected_union, class_matches, describe_matchers, finish, patch_matched_methods, read_unit,
    Matcher,
};
use crate::classfile::insn::{Body, Handler, Insn, Node};
use crate::classfile::opcodes::{access::*, *};
use crate::classfile::{MethodCode, MethodUnit};
use crate::error::Error;
use crate::hook::Hook;
use crate::logistics::MethodLogistics;
use crate::target::TargetMatcher;

/// The JVM-side helper the generated code calls. Ship a class of this name
/// (or configure another via the builder) exposing
/// `static void push(String)` and `static void pop()` mirroring the
/// [`symbols`](crate::symbols) operations.
pub const DEFAULT_SYMBOLS_CLASS: &str = "classpatch/rt/Symbols";

/// One synthetic wrapper per distinct call shape per class.
struct WrapperSpec {
    opcode: u8,
    owner: String,
    name: String,
    target_descriptor: String,
    wrapper_descriptor: String,
    interface: bool,
    wrapper_name: String,
}

pub struct SetSymbolDuringMethodCallScript {
    matchers: Vec<Matcher>,
    call_to_wrap: Hook,
    symbol: String,
    symbols_class: String,
}

impl SetSymbolDuringMethodCallScript {
    pub fn name(&self) -> String {
        format!(
            "set symbol {} around {} in {}",
            self.symbol,
            self.call_to_wrap.method_name(),
            describe_matchers(&self.matchers)
        )
    }

    pub fn classes_to_reload(&self) -> Vec<String> {
        affected_union(&self.matchers)
    }

    pub fn patch(&self, class_name: &str, bytes: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        if !class_matches(class_name, &self.classes_to_reload()) {
            return Ok(None);
        }
        let mut unit = read_unit(bytes)?;
        let class_spec = unit.name.clone();

        let inner_owner = self.call_to_wrap.class_spec();
        let inner_name = self.call_to_wrap.method_name().to_string();
        let inner_desc = self.call_to_wrap.method_descriptor();

        let mut wrappers: Vec<WrapperSpec> = Vec::new();
        let changed = patch_matched_methods(&mut unit, &self.matchers, |body, _, _, _| {
            let sites = body.find_insns(|i| {
                matches!(i, Insn::Method { opcode, owner, name, descriptor, .. }
                    if matches!(*opcode, INVOKEVIRTUAL | INVOKESTATIC | INVOKEINTERFACE)
                        && *owner == inner_owner && *name == inner_name && *descriptor == inner_desc)
            });
            if sites.is_empty() {
                return Ok(false);
            }
            for &at in sites.iter().rev() {
                let Node::Insn(Insn::Method { opcode, owner, name, descriptor, interface }) =
                    body.nodes[at].clone()
                else {
                    continue;
                };
                // instance calls fold the receiver into the wrapper signature
                let wrapper_descriptor = if opcode == INVOKESTATIC {
                    descriptor.clone()
                } else {
                    format!("(L{};{}", owner, &descriptor[1..])
                };

                let position = wrappers.iter().position(|w| {
                    w.opcode == opcode
                        && w.owner == owner
                        && w.name == name
                        && w.target_descriptor == descriptor
                        && w.interface == interface
                });
                let wrapper_name = match position {
                    Some(found) => wrappers[found].wrapper_name.clone(),
                    None => {
                        let wrapper_name =
                            format!("$wrapSymbol${}${}", wrappers.len(), name);
                        wrappers.push(WrapperSpec {
                            opcode,
                            owner: owner.clone(),
                            name: name.clone(),
                            target_descriptor: descriptor.clone(),
                            wrapper_descriptor: wrapper_descriptor.clone(),
                            interface,
                            wrapper_name: wrapper_name.clone(),
                        });
                        wrapper_name
                    }
                };

                body.splice(
                    at,
                    vec![Node::Insn(Insn::invoke_static(
                        &class_spec,
                        &wrapper_name,
                        &wrapper_descriptor,
                    ))],
                );
            }
            Ok(true)
        })?;

        for spec in &wrappers {
            if !unit.has_method(&spec.wrapper_name, &spec.wrapper_descriptor) {
                unit.methods.push(self.make_wrapper(spec)?);
            }
        }
        finish(unit, changed)
    }

    fn make_wrapper(&self, spec: &WrapperSpec) -> Result<MethodUnit, Error> {
        let logistics = MethodLogistics::new(ACC_STATIC, &spec.wrapper_descriptor)?;
        let mut body = Body::new();
        let start = body.fresh_label();
        let end = body.fresh_label();
        let handler = body.fresh_label();

        body.nodes.push(Node::Label(start));
        body.nodes.push(Node::Insn(Insn::load_string(&self.symbol)));
        body.nodes.push(Node::Insn(Insn::invoke_static(
            &self.symbols_class,
            "push",
            "(Ljava/lang/String;)V",
        )));
        for i in 0..logistics.param_count() {
            body.nodes.push(Node::Insn(logistics.load_param(i)?));
        }
        body.nodes.push(Node::Insn(Insn::Method {
            opcode: spec.opcode,
            owner: spec.owner.clone(),
            name: spec.name.clone(),
            descriptor: spec.target_descriptor.clone(),
            interface: spec.interface,
        }));
        body.nodes.push(Node::Label(end));
        body.nodes.push(Node::Insn(Insn::invoke_static(&self.symbols_class, "pop", "()V")));
        body.nodes.push(Node::Insn(logistics.return_insn()));
        body.nodes.push(Node::Label(handler));
        body.nodes.push(Node::Insn(Insn::invoke_static(&self.symbols_class, "pop", "()V")));
        body.nodes.push(Node::Insn(Insn::Simple(ATHROW)));
        body.handlers.push(Handler {
            start,
            end,
            handler,
            catch_type: None,
        });
        body.max_stack = logistics.first_open_slot().max(1) + 2;
        body.max_locals = logistics.first_open_slot();

        Ok(MethodUnit {
            access_flags: ACC_PRIVATE | ACC_STATIC | ACC_SYNTHETIC,
            name: spec.wrapper_name.clone(),
            descriptor: spec.wrapper_descriptor.clone(),
            code: Some(MethodCode::Edited(body)),
            attributes: Vec::new(),
        })
    }
}

pub struct SetSymbolBuilder {
    matchers: Vec<Matcher>,
    call_to_wrap: Option<Hook>,
    symbol: Option<String>,
    symbols_class: String,
}

impl SetSymbolBuilder {
    pub(super) fn new() -> SetSymbolBuilder {
        SetSymbolBuilder {
            matchers: Vec::new(),
            call_to_wrap: None,
            symbol: None,
            symbols_class: DEFAULT_SYMBOLS_CLASS.to_string(),
        }
    }

    pub fn target(mut self, matcher: impl TargetMatcher + 'static) -> SetSymbolBuilder {
        self.matchers.push(std::sync::Arc::new(matcher));
        self
    }

    /// The call to bracket with the symbol.
    pub fn call_to_wrap(mut self, hook: Hook) -> SetSymbolBuilder {
        self.call_to_wrap = Some(hook);
        self
    }

    pub fn symbol(mut self, symbol: &str) -> SetSymbolBuilder {
        self.symbol = Some(symbol.to_string());
        self
    }

    /// The internal name of the JVM-side symbols helper class.
    pub fn symbols_class(mut self, internal_name: &str) -> SetSymbolBuilder {
        self.symbols_class = internal_name.to_string();
        self
    }

    pub fn build(self) -> Result<super::PatchScript, Error> {
        if self.matchers.is_empty() {
            return Err(Error::InvalidConfiguration(
                "a target method matcher is required".into(),
            ));
        }
        let call_to_wrap = self.call_to_wrap.ok_or_else(|| {
            Error::InvalidConfiguration("a method call to wrap is required".into())
        })?;
        let symbol = self.symbol.ok_or_else(|| {
            Error::InvalidConfiguration("a symbol is required".into())
        })?;
        Ok(super::PatchScript::SetSymbolDuringMethodCall(
            SetSymbolDuringMethodCallScript {
                matchers: self.matchers,
                call_to_wrap,
                symbol,
                symbols_class: self.symbols_class,
            },
        ))
    }
}
