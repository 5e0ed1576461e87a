//! Hooks: the helper methods a patch calls into

use crate::descriptor;

/// A method the library user wrote, to be invoked (or bodily copied) from
/// patched code. Normally static.
///
/// The owner may be spelled with dots or slashes; inner classes use `$`.
/// Return and parameter types are human names (`int`,
/// `java.lang.String[]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hook {
    class_name: String,
    method_name: String,
    return_type: String,
    parameter_types: Vec<String>,
}

impl Hook {
    pub fn new(
        class_name: &str,
        method_name: &str,
        return_type: &str,
        parameter_types: &[&str],
    ) -> Hook {
        Hook {
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
            return_type: return_type.to_string(),
            parameter_types: parameter_types.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn return_type(&self) -> &str {
        &self.return_type
    }

    pub fn parameter_types(&self) -> &[String] {
        &self.parameter_types
    }

    pub fn is_constructor(&self) -> bool {
        self.method_name == "<init>"
    }

    /// The owner in internal form (`com/example/Hooks`).
    pub fn class_spec(&self) -> String {
        descriptor::convert_type(&self.class_name)
    }

    /// The JVM method descriptor this hook projects to.
    pub fn method_descriptor(&self) -> String {
        let mut out = String::from("(");
        for param in &self.parameter_types {
            out.push_str(&descriptor::to_spec(param));
        }
        out.push(')');
        out.push_str(&descriptor::to_spec(&self.return_type));
        out
    }

    /// True when the hook returns `void`.
    pub fn returns_void(&self) -> bool {
        self.return_type == "void"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{decompose_full_desc, type_spec_match};

    #[test]
    fn descriptor_projection() {
        let hook = Hook::new(
            "com.example.Hooks",
            "onReturn",
            "int",
            &["int", "java.lang.Object", "java.lang.String[]"],
        );
        assert_eq!(hook.class_spec(), "com/example/Hooks");
        assert_eq!(
            hook.method_descriptor(),
            "(ILjava/lang/Object;[Ljava/lang/String;)I"
        );
        assert!(!hook.returns_void());
        assert!(!hook.is_constructor());
    }

    #[test]
    fn slashed_owners_are_accepted() {
        let hook = Hook::new("com/example/Hooks$Inner", "decide", "boolean", &[]);
        assert_eq!(hook.class_spec(), "com/example/Hooks$Inner");
        assert_eq!(hook.method_descriptor(), "()Z");
    }

    #[test]
    fn projected_descriptor_parses_back_to_the_same_types() {
        let hook = Hook::new(
            "a.B",
            "h",
            "java.lang.String",
            &["long", "java.util.Map$Entry[]", "boolean"],
        );
        let specs = decompose_full_desc(&hook.method_descriptor()).unwrap();
        assert!(type_spec_match(&specs[0], hook.return_type()));
        for (spec, human) in specs[1..].iter().zip(hook.parameter_types()) {
            let human = human.replace('$', ".");
            assert!(type_spec_match(spec, &human), "{} vs {}", spec, human);
        }
    }
}
