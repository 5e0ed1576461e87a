//! AddField: put a new field on a class

use bitflags::bitflags;

use super::{class_matches, finish, read_unit};
use crate::classfile::{FieldConstant, FieldUnit};
use crate::error::Error;

bitflags! {
    /// Access flags available for an added field. At most one of the scope
    /// bits survives into the class file.
    pub struct FieldAccess: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const VOLATILE = 0x0040;
        const TRANSIENT = 0x0080;
    }
}

const SCOPE_BITS: FieldAccess = FieldAccess::from_bits_truncate(
    FieldAccess::PUBLIC.bits() | FieldAccess::PRIVATE.bits() | FieldAccess::PROTECTED.bits(),
);

/// Adds one field to every class in its target list. If a field of that
/// name already exists (a previous patch, usually), nothing happens.
pub struct AddFieldScript {
    target_classes: Vec<String>,
    access_flags: u16,
    field_name: String,
    field_type: String,
    value: Option<FieldConstant>,
}

impl AddFieldScript {
    pub fn name(&self) -> String {
        format!(
            "add field {} {} to {}",
            self.field_type,
            self.field_name,
            self.target_classes.join(", ")
        )
    }

    pub fn classes_to_reload(&self) -> Vec<String> {
        self.target_classes.clone()
    }

    pub fn patch(&self, class_name: &str, bytes: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        if !class_matches(class_name, &self.target_classes) {
            return Ok(None);
        }
        let mut unit = read_unit(bytes)?;
        if unit.has_field(&self.field_name) {
            return Ok(None);
        }
        unit.fields.push(FieldUnit {
            access_flags: self.access_flags,
            name: self.field_name.clone(),
            descriptor: self.field_type.clone(),
            constant: self.value.clone(),
            attributes: Vec::new(),
        });
        finish(unit, true)
    }
}

pub struct AddFieldBuilder {
    target_classes: Vec<String>,
    access: FieldAccess,
    field_name: Option<String>,
    field_type: Option<String>,
    value: Option<FieldConstant>,
}

impl AddFieldBuilder {
    pub(super) fn new() -> AddFieldBuilder {
        AddFieldBuilder {
            target_classes: Vec::new(),
            access: FieldAccess::empty(),
            field_name: None,
            field_type: None,
            value: None,
        }
    }

    /// A class to add the field to, in dotted form (`java.lang.String`).
    /// May be called more than once.
    pub fn target_class(mut self, target_class: &str) -> AddFieldBuilder {
        self.target_classes.push(target_class.to_string());
        self
    }

    pub fn field_name(mut self, field_name: &str) -> AddFieldBuilder {
        self.field_name = Some(field_name.to_string());
        self
    }

    /// The field type as a JVM descriptor (`[I`, `Ljava/lang/String;`).
    pub fn field_type(mut self, field_type: &str) -> AddFieldBuilder {
        self.field_type = Some(field_type.to_string());
        self
    }

    /// A constant initial value. Implies `static final`.
    pub fn value(mut self, value: FieldConstant) -> AddFieldBuilder {
        self.value = Some(value);
        self
    }

    pub fn set_public(self) -> AddFieldBuilder {
        self.scope(FieldAccess::PUBLIC)
    }

    pub fn set_private(self) -> AddFieldBuilder {
        self.scope(FieldAccess::PRIVATE)
    }

    pub fn set_protected(self) -> AddFieldBuilder {
        self.scope(FieldAccess::PROTECTED)
    }

    pub fn set_package_access(self) -> AddFieldBuilder {
        self.scope(FieldAccess::empty())
    }

    fn scope(mut self, bit: FieldAccess) -> AddFieldBuilder {
        self.access.remove(SCOPE_BITS);
        self.access.insert(bit);
        self
    }

    pub fn set_static(mut self) -> AddFieldBuilder {
        self.access.insert(FieldAccess::STATIC);
        self
    }

    pub fn set_final(mut self) -> AddFieldBuilder {
        self.access.insert(FieldAccess::FINAL);
        self
    }

    pub fn set_volatile(mut self) -> AddFieldBuilder {
        self.access.insert(FieldAccess::VOLATILE);
        self
    }

    pub fn set_transient(mut self) -> AddFieldBuilder {
        self.access.insert(FieldAccess::TRANSIENT);
        self
    }

    pub fn build(mut self) -> Result<super::PatchScript, Error> {
        if self.target_classes.is_empty() {
            return Err(Error::InvalidConfiguration(
                "at least one target class is required".into(),
            ));
        }
        if let Some(bad) = self.target_classes.iter().find(|c| c.contains('/')) {
            return Err(Error::InvalidConfiguration(format!(
                "target class {} contains a slash; use dotted names",
                bad
            )));
        }
        let field_name = self.field_name.ok_or_else(|| {
            Error::InvalidConfiguration("a field name is required".into())
        })?;
        let field_type = self.field_type.ok_or_else(|| {
            Error::InvalidConfiguration("a field type is required".into())
        })?;
        if field_type.contains('.') {
            return Err(Error::InvalidConfiguration(format!(
                "field type {} contains a dot; use descriptor syntax (Lcom/foo/Bar;)",
                field_type
            )));
        }
        // a constant value only makes sense on a static final field
        if self.value.is_some() {
            self.access.insert(FieldAccess::STATIC | FieldAccess::FINAL);
        }
        Ok(super::PatchScript::AddField(AddFieldScript {
            target_classes: self.target_classes,
            access_flags: self.access.bits(),
            field_name,
            field_type,
            value: self.value,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::opcodes::access::*;
    use crate::classfile::{read_class, ClassUnit, write_class};
    use crate::scripts::{PatchScript, ScriptBuilder};

    fn empty_class(name: &str) -> Vec<u8> {
        let mut unit = ClassUnit::synthesize(52, name, "java/lang/Object").unwrap();
        write_class(&mut unit).unwrap()
    }

    #[test]
    fn adds_a_field_once() {
        let script = ScriptBuilder::add_field()
            .target_class("test.Widget")
            .field_name("$marker")
            .field_type("Z")
            .set_public()
            .build()
            .unwrap();

        let bytes = empty_class("test/Widget");
        let patched = script
            .patch("test/Widget", &bytes, &crate::manager::test_context())
            .unwrap()
            .expect("field added");
        let unit = read_class(&patched).unwrap();
        assert!(unit.has_field("$marker"));
        assert_eq!(unit.fields[0].access_flags, ACC_PUBLIC);

        // second application sees the field and leaves the class alone
        assert!(script
            .patch("test/Widget", &patched, &crate::manager::test_context())
            .unwrap()
            .is_none());
    }

    #[test]
    fn constant_values_force_static_final() {
        let script = ScriptBuilder::add_field()
            .target_class("test.Widget")
            .field_name("LEVEL")
            .field_type("I")
            .set_private()
            .value(FieldConstant::Int(7))
            .build()
            .unwrap();
        let patched = script
            .patch("test/Widget", &empty_class("test/Widget"), &crate::manager::test_context())
            .unwrap()
            .unwrap();
        let unit = read_class(&patched).unwrap();
        let field = &unit.fields[0];
        assert_eq!(
            field.access_flags,
            ACC_PRIVATE | ACC_STATIC | ACC_FINAL
        );
        assert!(field.attributes.iter().any(|a| a.name == "ConstantValue"));
    }

    #[test]
    fn other_classes_pass_through() {
        let script = ScriptBuilder::add_field()
            .target_class("test.Widget")
            .field_name("f")
            .field_type("I")
            .build()
            .unwrap();
        assert!(script
            .patch("test/Other", &empty_class("test/Other"), &crate::manager::test_context())
            .unwrap()
            .is_none());
        assert!(matches!(&script, PatchScript::AddField(s) if s.classes_to_reload() == ["test.Widget"]));
    }

    #[test]
    fn rejects_incomplete_configuration() {
        assert!(ScriptBuilder::add_field().field_name("f").field_type("I").build().is_err());
        assert!(ScriptBuilder::add_field().target_class("a.B").field_type("I").build().is_err());
        assert!(ScriptBuilder::add_field().target_class("a.B").field_name("f").build().is_err());
        assert!(ScriptBuilder::add_field()
            .target_class("a/B")
            .field_name("f")
            .field_type("I")
            .build()
            .is_err());
        assert!(ScriptBuilder::add_field()
            .target_class("a.B")
            .field_name("f")
            .field_type("com.foo.Bar")
            .build()
            .is_err());
    }
}
