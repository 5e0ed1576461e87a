//! Patch scripts: the six primitive rewrites and their builders
//!
//! A script is built once, validated eagerly, and then applied class by
//! class. Applying never mutates the script; per-class state lives on the
//! stack of the transforming thread.
//!
//! ### Hook dispatch
//!
//! Every script that invokes a hook supports three integration modes:
//!
//! - **call** (the default): an `invokestatic` of the hook where it lives.
//!   The hook class must be loadable from the patched class's loader.
//! - **transplant**: the entire hook method is copied into the patched
//!   class on first use and called there. The hook must be self-contained;
//!   it cannot reference anything else from its original class.
//! - **insert**: the hook's body is pasted directly at the call site, minus
//!   every return instruction. Only suitable for trivially simple hooks.
//!
//! Transplant and insert are mutually exclusive and need a
//! [`HookSource`](crate::resolve::HookSource) to find the hook's class file.

mod add_field;
mod exit_early;
mod replace_method_call;
mod set_symbol;
mod wrap_method_call;
mod wrap_return_values;

pub use add_field::{AddFieldBuilder, AddFieldScript, FieldAccess};
pub use exit_early::{ExitEarlyBuilder, ExitEarlyScript};
pub use replace_method_call::{ReplaceMethodCallBuilder, ReplaceMethodCallScript};
pub use set_symbol::{SetSymbolBuilder, SetSymbolDuringMethodCallScript};
pub use wrap_method_call::{WrapMethodCallBuilder, WrapMethodCallScript};
pub use wrap_return_values::{WrapReturnValuesBuilder, WrapReturnValuesScript};

use std::collections::HashSet;
use std::sync::Arc;

use crate::classfile::insn::{Body, Insn, Node};
use crate::classfile::{self, ClassUnit, Const, MethodCode, MethodUnit};
use crate::descriptor;
use crate::error::Error;
use crate::hook::Hook;
use crate::logistics::MethodLogistics;
use crate::resolve::{HookSource, ResourceMapper};
use crate::target::TargetMatcher;

pub type Matcher = Arc<dyn TargetMatcher>;

/// Which values of the patched method a hook wants pushed as arguments.
///
/// The order of the hook's parameters is a fixed contract regardless of the
/// order requests were made in: the tentative return value first (where one
/// exists), then the receiver, then the requested parameters in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackRequest {
    ReturnValue,
    This,
    Param1,
    Param2,
    Param3,
    Param4,
    Param5,
    Param6,
}

impl StackRequest {
    pub const PARAMS_IN_ORDER: [StackRequest; 6] = [
        StackRequest::Param1,
        StackRequest::Param2,
        StackRequest::Param3,
        StackRequest::Param4,
        StackRequest::Param5,
        StackRequest::Param6,
    ];

    /// The 0-based parameter position, for the `ParamN` requests.
    pub fn param_pos(self) -> Option<usize> {
        match self {
            StackRequest::Param1 => Some(0),
            StackRequest::Param2 => Some(1),
            StackRequest::Param3 => Some(2),
            StackRequest::Param4 => Some(3),
            StackRequest::Param5 => Some(4),
            StackRequest::Param6 => Some(5),
            _ => None,
        }
    }
}

/// What a script needs from its surroundings while patching: the hook-class
/// locator and the resource-name mapper.
pub struct PatchContext<'a> {
    pub mapper: &'a dyn ResourceMapper,
    pub hooks: &'a dyn HookSource,
}

/// A user-supplied script kind beyond the six primitives.
pub trait CustomScript: Send + Sync {
    fn name(&self) -> String;
    fn classes_to_reload(&self) -> Vec<String>;
    fn would_patch(&self, class_name: &str) -> bool;
    fn patch(
        &self,
        class_name: &str,
        bytes: &[u8],
        ctx: &PatchContext,
    ) -> Result<Option<Vec<u8>>, Error>;
}

/// A patch script of one of the six primitive kinds, or a user extension.
pub enum PatchScript {
    AddField(AddFieldScript),
    ExitEarly(ExitEarlyScript),
    WrapReturnValues(WrapReturnValuesScript),
    WrapMethodCall(WrapMethodCallScript),
    ReplaceMethodCall(ReplaceMethodCallScript),
    SetSymbolDuringMethodCall(SetSymbolDuringMethodCallScript),
    Custom(Box<dyn CustomScript>),
}

impl std::fmt::Debug for PatchScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PatchScript").field(&self.name()).finish()
    }
}

impl PatchScript {
    /// The human name used when reporting failures.
    pub fn name(&self) -> String {
        match self {
            PatchScript::AddField(s) => s.name(),
            PatchScript::ExitEarly(s) => s.name(),
            PatchScript::WrapReturnValues(s) => s.name(),
            PatchScript::WrapMethodCall(s) => s.name(),
            PatchScript::ReplaceMethodCall(s) => s.name(),
            PatchScript::SetSymbolDuringMethodCall(s) => s.name(),
            PatchScript::Custom(s) => s.name(),
        }
    }

    /// Dotted names of the classes worth re-transforming once this script
    /// is active.
    pub fn classes_to_reload(&self) -> Vec<String> {
        match self {
            PatchScript::AddField(s) => s.classes_to_reload(),
            PatchScript::ExitEarly(s) => s.classes_to_reload(),
            PatchScript::WrapReturnValues(s) => s.classes_to_reload(),
            PatchScript::WrapMethodCall(s) => s.classes_to_reload(),
            PatchScript::ReplaceMethodCall(s) => s.classes_to_reload(),
            PatchScript::SetSymbolDuringMethodCall(s) => s.classes_to_reload(),
            PatchScript::Custom(s) => s.classes_to_reload(),
        }
    }

    /// Cheap check whether this script would look at a class at all.
    pub fn would_patch(&self, class_name: &str) -> bool {
        match self {
            PatchScript::Custom(s) => s.would_patch(class_name),
            other => {
                let affected = other.classes_to_reload();
                class_matches(class_name, &affected)
            }
        }
    }

    /// Applies the script. `None` means "no interest in this class"; the
    /// caller keeps the previous bytes.
    pub fn patch(
        &self,
        class_name: &str,
        bytes: &[u8],
        ctx: &PatchContext,
    ) -> Result<Option<Vec<u8>>, Error> {
        match self {
            PatchScript::AddField(s) => s.patch(class_name, bytes),
            PatchScript::ExitEarly(s) => s.patch(class_name, bytes, ctx),
            PatchScript::WrapReturnValues(s) => s.patch(class_name, bytes, ctx),
            PatchScript::WrapMethodCall(s) => s.patch(class_name, bytes, ctx),
            PatchScript::ReplaceMethodCall(s) => s.patch(class_name, bytes, ctx),
            PatchScript::SetSymbolDuringMethodCall(s) => s.patch(class_name, bytes),
            PatchScript::Custom(s) => s.patch(class_name, bytes, ctx),
        }
    }
}

/// Entry points for building the primitive scripts.
///
/// ```no_run
/// # use classpatch::scripts::ScriptBuilder;
/// # use classpatch::{Hook, MethodTarget, StackRequest};
/// # fn run() -> Result<(), classpatch::Error> {
/// let script = ScriptBuilder::exit_early()
///     .target(MethodTarget::new("com.example.Widget", "validate")?)
///     .decision_method(Hook::new("com/example/Hooks", "skipValidation",
///         "boolean", &["java.lang.Object"]))
///     .request(&[StackRequest::This])
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ScriptBuilder;

impl ScriptBuilder {
    /// Adds a field to one or more classes.
    pub fn add_field() -> AddFieldBuilder {
        AddFieldBuilder::new()
    }

    /// Lets a hook decide, per call, whether the patched method should
    /// return immediately and with which value.
    pub fn exit_early() -> ExitEarlyBuilder {
        ExitEarlyBuilder::new()
    }

    /// Replaces calls to a given method inside the targeted methods with
    /// calls to a static replacement of compatible shape.
    pub fn replace_method_call() -> ReplaceMethodCallBuilder {
        ReplaceMethodCallBuilder::new()
    }

    /// Inspects (and optionally replaces) the result of calls to a given
    /// method inside the targeted methods.
    pub fn wrap_method_call() -> WrapMethodCallBuilder {
        WrapMethodCallBuilder::new()
    }

    /// Inspects (and optionally replaces) every value the targeted methods
    /// are about to return.
    pub fn wrap_return_value() -> WrapReturnValuesBuilder {
        WrapReturnValuesBuilder::new()
    }

    /// Brackets calls to a given method with a thread-local symbol,
    /// push/pop balanced on every exit path.
    pub fn set_symbol_during_method_call() -> SetSymbolBuilder {
        SetSymbolBuilder::new()
    }
}

pub(crate) fn class_matches(class_name: &str, specs: &[String]) -> bool {
    specs
        .iter()
        .any(|spec| descriptor::type_matches(class_name, spec))
}

pub(crate) fn affected_union(matchers: &[Matcher]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for matcher in matchers {
        for class in matcher.affected_classes() {
            if seen.insert(class.clone()) {
                out.push(class);
            }
        }
    }
    out
}

pub(crate) fn describe_matchers(matchers: &[Matcher]) -> String {
    affected_union(matchers).join(", ")
}

pub(crate) fn read_unit(bytes: &[u8]) -> Result<ClassUnit, Error> {
    Ok(classfile::read_class(bytes)?)
}

pub(crate) fn finish(mut unit: ClassUnit, changed: bool) -> Result<Option<Vec<u8>>, Error> {
    if !changed {
        return Ok(None);
    }
    Ok(Some(classfile::write_class(&mut unit)?))
}

/// Runs `apply` over every method of `unit` that any matcher selects,
/// parsing the body on demand. Returns whether anything changed.
pub(crate) fn patch_matched_methods(
    unit: &mut ClassUnit,
    matchers: &[Matcher],
    mut apply: impl FnMut(&mut Body, &MethodLogistics, &str, &str) -> Result<bool, Error>,
) -> Result<bool, Error> {
    let class_spec = unit.name.clone();
    let ClassUnit { pool, methods, .. } = unit;
    let mut changed = false;
    for method in methods.iter_mut() {
        if method.code.is_none() {
            continue;
        }
        if !matchers
            .iter()
            .any(|m| m.matches(&class_spec, &method.name, &method.descriptor))
        {
            continue;
        }
        let logistics = MethodLogistics::new(method.access_flags, &method.descriptor)?;
        let name = method.name.clone();
        let descriptor = method.descriptor.clone();
        let body = method.edit(pool)?;
        if apply(body, &logistics, &name, &descriptor)? {
            changed = true;
        }
    }
    Ok(changed)
}

/// Loads the hook's method body from its defining class file, ready to be
/// carried into another class.
pub(crate) fn load_hook_method(
    hook: &Hook,
    ctx: &PatchContext,
    class_file_version: u16,
) -> Result<(u16, Body), Error> {
    let resource = format!("{}.class", hook.class_spec());
    let resource = ctx.mapper.map_resource_name(class_file_version, &resource);
    let bytes = ctx
        .hooks
        .class_bytes(&resource)
        .map_err(|e| Error::UnresolvableHook(format!("{}: {}", resource, e)))?;
    let mut unit = classfile::read_class(&bytes)
        .map_err(|e| Error::UnresolvableHook(format!("{}: {}", resource, e)))?;
    let descriptor = hook.method_descriptor();
    let pool = unit.pool.clone();
    let method = unit
        .methods
        .iter_mut()
        .find(|m| m.name == hook.method_name() && m.descriptor == descriptor)
        .ok_or_else(|| {
            Error::UnresolvableHook(format!(
                "{}::{}{} not found in its class file",
                hook.class_spec(),
                hook.method_name(),
                descriptor
            ))
        })?;
    let access = method.access_flags;
    let body = method.edit(&pool)?.clone();

    for node in &body.nodes {
        if let Node::Insn(insn) = node {
            if matches!(insn, Insn::Ldc(Const::Pooled { .. }) | Insn::InvokeDynamic { .. }) {
                return Err(Error::UnresolvableHook(format!(
                    "{}::{} uses invokedynamic or dynamic constants and cannot be copied",
                    hook.class_spec(),
                    hook.method_name()
                )));
            }
        }
    }
    Ok((access, body))
}

/// Copies the whole hook method into `unit`, keeping its name and
/// descriptor. Skipped when a method of that name and descriptor already
/// exists (a previous script got there first).
pub(crate) fn transplant(
    unit: &mut ClassUnit,
    hook: &Hook,
    ctx: &PatchContext,
) -> Result<bool, Error> {
    let descriptor = hook.method_descriptor();
    if unit.has_method(hook.method_name(), &descriptor) {
        return Ok(false);
    }
    let (access_flags, body) = load_hook_method(hook, ctx, unit.major_version)?;
    unit.methods.push(MethodUnit {
        access_flags,
        name: hook.method_name().to_string(),
        descriptor,
        code: Some(MethodCode::Edited(body)),
        attributes: Vec::new(),
    });
    Ok(true)
}

/// A hook body prepared for pasting at call sites: line markers gone and
/// every return instruction of any flavour dropped.
pub(crate) struct InsertableHook {
    body: Body,
}

impl InsertableHook {
    pub(crate) fn load(
        hook: &Hook,
        ctx: &PatchContext,
        class_file_version: u16,
    ) -> Result<InsertableHook, Error> {
        let (_, mut body) = load_hook_method(hook, ctx, class_file_version)?;
        body.nodes.retain(|node| {
            !matches!(node, Node::Line(_)) && !matches!(node, Node::Insn(i) if i.is_return())
        });
        Ok(InsertableHook { body })
    }

    /// Appends the body to `out`, with labels renumbered into `target` and
    /// the hook's exception ranges carried over.
    pub(crate) fn splice(&self, target: &mut Body, out: &mut Vec<Node>) {
        let (nodes, handlers) = target.adopt(&self.body);
        out.extend(nodes);
        target.handlers.extend(handlers);
        target.note_extra_stack(self.body.max_stack);
    }
}

/// How a script reaches its hook at a given site.
pub(crate) enum HookDispatch {
    /// `invokestatic` where the hook lives.
    Call(Hook),
    /// `invokestatic` on the patched class; the method body follows by
    /// transplant at the end of the class visit.
    Transplanted(Hook),
    /// The hook body itself, pasted in place.
    Inserted(Hook, InsertableHook),
}

impl HookDispatch {
    pub(crate) fn prepare(
        hook: Hook,
        do_transplant: bool,
        do_insert: bool,
        ctx: &PatchContext,
        class_file_version: u16,
    ) -> Result<HookDispatch, Error> {
        if do_insert {
            let insertable = InsertableHook::load(&hook, ctx, class_file_version)?;
            Ok(HookDispatch::Inserted(hook, insertable))
        } else if do_transplant {
            Ok(HookDispatch::Transplanted(hook))
        } else {
            Ok(HookDispatch::Call(hook))
        }
    }

    /// Emits the dispatch into `out`.
    pub(crate) fn emit(&self, own_class_spec: &str, target: &mut Body, out: &mut Vec<Node>) {
        match self {
            HookDispatch::Call(hook) => out.push(Node::Insn(Insn::invoke_static(
                &hook.class_spec(),
                hook.method_name(),
                &hook.method_descriptor(),
            ))),
            HookDispatch::Transplanted(hook) => out.push(Node::Insn(Insn::invoke_static(
                own_class_spec,
                hook.method_name(),
                &hook.method_descriptor(),
            ))),
            HookDispatch::Inserted(_, insertable) => insertable.splice(target, out),
        }
    }

    /// The hook to transplant at the end of the class visit, if any.
    pub(crate) fn pending_transplant(&self) -> Option<&Hook> {
        match self {
            HookDispatch::Transplanted(hook) => Some(hook),
            _ => None,
        }
    }
}

/// Pushes the receiver and requested parameters in canonical order and
/// returns an upper bound of the operand slots used.
pub(crate) fn load_requested_args(
    out: &mut Vec<Node>,
    logistics: &MethodLogistics,
    requests: &HashSet<StackRequest>,
) -> Result<u16, Error> {
    let mut slots = 0u16;
    if requests.contains(&StackRequest::This) {
        out.push(Node::Insn(logistics.load_this()));
        slots += 1;
    }
    for request in StackRequest::PARAMS_IN_ORDER {
        if !requests.contains(&request) {
            continue;
        }
        let pos = request.param_pos().expect("params have positions");
        out.push(Node::Insn(logistics.load_param(pos)?));
        slots += 2;
    }
    Ok(slots)
}

/// Collects requests, rejecting `ReturnValue` for the scripts where no
/// tentative return value exists.
pub(crate) fn collect_requests(
    requests: &[StackRequest],
    allow_return_value: bool,
    script: &str,
) -> Result<HashSet<StackRequest>, Error> {
    let mut out = HashSet::new();
    for request in requests {
        if *request == StackRequest::ReturnValue && !allow_return_value {
            return Err(Error::InvalidConfiguration(format!(
                "the tentative return value cannot be requested in {}",
                script
            )));
        }
        out.insert(*request);
    }
    Ok(out)
}
