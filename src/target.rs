//! Which methods a script applies to

use crate::descriptor;
use crate::error::Error;

/// Decides whether a method belongs to a script's target set.
///
/// Implemented by [`MethodTarget`] for the common cases; scripts accept any
/// implementation, so exotic selection logic can be plugged in.
pub trait TargetMatcher: Send + Sync {
    /// The dotted names of the classes this matcher may affect. The script
    /// manager uses the union of these to skip classes cheaply, and the
    /// reload machinery re-transforms them when asked.
    fn affected_classes(&self) -> Vec<String>;

    /// Tests an `(owner, method name, method descriptor)` triple the way the
    /// class-file layer reports it (`java/lang/Thread`, `sleep`, `(JI)V`).
    fn matches(&self, class_spec: &str, method_name: &str, descriptor: &str) -> bool;
}

/// A target method: owner class and method name, optionally pinned to one
/// overload by return and parameter types.
///
/// All types are written in the human form (`java.lang.String[]`, `int`).
/// Without a signature every overload of the name matches; with one, exactly
/// that signature matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodTarget {
    class_spec: String,
    method_name: String,
    return_spec: Option<String>,
    parameter_spec: Option<Vec<String>>,
}

impl MethodTarget {
    /// Targets every overload of `method_name` in `class_spec`.
    pub fn new(class_spec: &str, method_name: &str) -> Result<MethodTarget, Error> {
        Self::build(class_spec, method_name, None, None)
    }

    /// Targets the single overload with the given return and parameter types.
    pub fn with_signature(
        class_spec: &str,
        method_name: &str,
        return_spec: &str,
        parameter_specs: &[&str],
    ) -> Result<MethodTarget, Error> {
        Self::build(
            class_spec,
            method_name,
            Some(return_spec.to_string()),
            Some(parameter_specs.iter().map(|s| s.to_string()).collect()),
        )
    }

    fn build(
        class_spec: &str,
        method_name: &str,
        return_spec: Option<String>,
        parameter_spec: Option<Vec<String>>,
    ) -> Result<MethodTarget, Error> {
        if class_spec.contains('/') {
            return Err(Error::InvalidConfiguration(format!(
                "class spec {} contains a slash; method targets use dotted names",
                class_spec
            )));
        }
        if method_name.contains('[') || method_name.contains('.') {
            return Err(Error::InvalidConfiguration(format!(
                "method name {} contains dots or braces; did you swap return type and method name?",
                method_name
            )));
        }
        Ok(MethodTarget {
            class_spec: class_spec.to_string(),
            method_name: method_name.to_string(),
            return_spec,
            parameter_spec,
        })
    }

    pub fn class_spec(&self) -> &str {
        &self.class_spec
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// True if `class_spec` (internal form) names this target's class.
    pub fn class_matches(&self, class_spec: &str) -> bool {
        descriptor::type_matches(class_spec, &self.class_spec)
    }

    fn descriptor_match(&self, desc: &str) -> bool {
        let return_spec = match &self.return_spec {
            None => return true,
            Some(spec) => spec,
        };
        let params = self.parameter_spec.as_deref().unwrap_or(&[]);

        let specs = match descriptor::decompose_full_desc(desc) {
            Ok(specs) => specs,
            Err(_) => return false,
        };
        if !descriptor::type_spec_match(&specs[0], return_spec) {
            return false;
        }
        if specs.len() - 1 != params.len() {
            return false;
        }
        specs[1..]
            .iter()
            .zip(params)
            .all(|(spec, pattern)| descriptor::type_spec_match(spec, pattern))
    }
}

impl TargetMatcher for MethodTarget {
    fn affected_classes(&self) -> Vec<String> {
        vec![self.class_spec.clone()]
    }

    fn matches(&self, class_spec: &str, method_name: &str, descriptor: &str) -> bool {
        method_name == self.method_name
            && self.class_matches(class_spec)
            && self.descriptor_match(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_signature_pins_one_overload() {
        let target = MethodTarget::with_signature(
            "java.lang.Thread",
            "sleep",
            "void",
            &["long", "int"],
        )
        .unwrap();
        assert!(target.matches("java/lang/Thread", "sleep", "(JI)V"));
        assert!(!target.matches("java/lang/Thread", "sleep", "(J)V"));
        assert!(!target.matches("java/lang/Thread", "sleep", "(JIJ)V"));
        assert!(!target.matches("java/lang/Threax", "sleep", "(JI)V"));
    }

    #[test]
    fn nameless_signature_matches_all_overloads() {
        let target = MethodTarget::new("java.lang.Thread", "sleep").unwrap();
        assert!(target.matches("java/lang/Thread", "sleep", "(J)V"));
        assert!(target.matches("java/lang/Thread", "sleep", "(JI)V"));
        assert!(!target.matches("java/lang/Thread", "slee", "(JI)V"));
        assert!(!target.matches("java/lang/Thread", "sleep2", "(JI)V"));
    }

    #[test]
    fn zero_arg_signature() {
        let target = MethodTarget::with_signature(
            "java.lang.String",
            "toLowerCase",
            "java.lang.String",
            &[],
        )
        .unwrap();
        assert!(target.matches("java/lang/String", "toLowerCase", "()Ljava/lang/String;"));
        assert!(!target.matches("java/lang/String", "toLowerCase", "(Ljava/util/Locale;)Ljava/lang/String;"));
    }

    #[test]
    fn suspicious_method_names_are_rejected() {
        assert!(MethodTarget::new("a.B", "java.lang.String").is_err());
        assert!(MethodTarget::new("a.B", "int[]").is_err());
        assert!(MethodTarget::new("a/B", "foo").is_err());
        assert!(MethodTarget::new("a.B", "<init>").is_ok());
    }

    #[test]
    fn affected_classes_is_the_owner() {
        let target = MethodTarget::new("java.lang.Thread", "sleep").unwrap();
        assert_eq!(target.affected_classes(), vec!["java.lang.Thread"]);
    }
}
