//! The script manager: the piece the host runtime talks to
//!
//! Holds the ordered script list, decides which classes get transformed,
//! runs the scripts in registration order (each script's output feeding the
//! next), and keeps script failures away from the class-loading thread.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::Error;
use crate::resolve::{ClassPath, HookSource, IdentityMapper, ResourceMapper};
use crate::scripts::{PatchContext, PatchScript};

/// Environment variable naming a directory where patched classes (and
/// their originals) are dumped for inspection.
pub const DEBUG_DUMP_ENV: &str = "CLASSPATCH_DEBUG_DIR";

/// The outer veto over class transformation, consulted before any script
/// runs. The default transforms everything.
pub trait Filter: Send + Sync {
    fn should_transform(
        &self,
        loader: Option<&str>,
        class_name: &str,
        class_being_redefined: bool,
        class_bytes: &[u8],
    ) -> bool;
}

struct AlwaysTransform;

impl Filter for AlwaysTransform {
    fn should_transform(&self, _: Option<&str>, _: &str, _: bool, _: &[u8]) -> bool {
        true
    }
}

/// What the manager needs from the host runtime to re-transform classes
/// that were already loaded when the scripts arrived.
pub trait RuntimeHost {
    /// Dotted names of the currently loaded classes.
    fn loaded_classes(&self) -> Vec<String>;

    /// Asks the runtime to run the transformation pipeline again for a
    /// loaded class. An `Err` means the runtime cannot do that.
    fn retransform(&self, class_name: &str) -> Result<(), String>;
}

/// A deferred add or remove, waiting for witnessed class loads. Each group
/// must witness at least one load before the action fires; it fires at
/// most once.
struct WitnessAction {
    trigger_groups: Vec<Vec<String>>,
    triggered: bool,
    remove_on_witness: bool,
    script: Arc<PatchScript>,
}

pub struct ScriptManager {
    scripts: RwLock<Vec<Arc<PatchScript>>>,
    witness_actions: Mutex<HashMap<String, Vec<Arc<Mutex<WitnessAction>>>>>,
    filter: Box<dyn Filter>,
    mapper: Box<dyn ResourceMapper>,
    hooks: Box<dyn HookSource>,
    dump_dir: Option<PathBuf>,
}

impl ScriptManager {
    pub fn new() -> ScriptManager {
        ScriptManager {
            scripts: RwLock::new(Vec::new()),
            witness_actions: Mutex::new(HashMap::new()),
            filter: Box::new(AlwaysTransform),
            mapper: Box::new(IdentityMapper),
            hooks: Box::new(ClassPath::new()),
            dump_dir: std::env::var_os(DEBUG_DUMP_ENV).map(PathBuf::from),
        }
    }

    pub fn add_script(&mut self, script: PatchScript) {
        self.scripts.write().expect("script list lock").push(Arc::new(script));
    }

    /// Registers `script` but only activates it once any of the `witness`
    /// classes is seen loading.
    pub fn add_script_if_witness(&mut self, witness: &[&str], script: PatchScript) {
        self.register_witness(&[witness], false, Arc::new(script));
    }

    /// Registers `script` but only activates it once *every* group in
    /// `witness_groups` has seen at least one of its classes load.
    pub fn add_script_if_complex_witness(
        &mut self,
        witness_groups: &[&[&str]],
        script: PatchScript,
    ) {
        self.register_witness(witness_groups, false, Arc::new(script));
    }

    /// Activates `script` immediately, and deactivates it if any of the
    /// `witness` classes is ever seen loading.
    pub fn add_script_if_not_witness(&mut self, witness: &[&str], script: PatchScript) {
        let script = Arc::new(script);
        self.scripts.write().expect("script list lock").push(script.clone());
        self.register_witness(&[witness], true, script);
    }

    fn register_witness(
        &mut self,
        witness_groups: &[&[&str]],
        remove_on_witness: bool,
        script: Arc<PatchScript>,
    ) {
        let trigger_groups: Vec<Vec<String>> = witness_groups
            .iter()
            .map(|group| group.iter().map(|c| internal_name(c)).collect())
            .collect();
        let action = Arc::new(Mutex::new(WitnessAction {
            trigger_groups: trigger_groups.clone(),
            triggered: false,
            remove_on_witness,
            script,
        }));
        let mut map = self.witness_actions.lock().expect("witness map lock");
        let mut seen = HashSet::new();
        for class in trigger_groups.iter().flatten() {
            if seen.insert(class.clone()) {
                map.entry(class.clone()).or_default().push(action.clone());
            }
        }
    }

    pub fn set_filter(&mut self, filter: impl Filter + 'static) {
        self.filter = Box::new(filter);
    }

    /// The mapper consulted before hook class files are read for
    /// transplant or insert.
    pub fn set_transplant_mapper(&mut self, mapper: impl ResourceMapper + 'static) {
        self.mapper = Box::new(mapper);
    }

    /// Where hook class files are read from.
    pub fn set_hook_source(&mut self, hooks: impl HookSource + 'static) {
        self.hooks = Box::new(hooks);
    }

    /// Overrides (or disables) the debug dump directory taken from
    /// [`DEBUG_DUMP_ENV`].
    pub fn set_dump_dir(&mut self, dir: Option<PathBuf>) {
        self.dump_dir = dir;
    }

    /// The class-load callback. Hand in what the runtime gave you; the
    /// return value is the rewritten class, or `None` when nothing
    /// applied. Never panics and never lets a script error escape.
    ///
    /// A `None` class name (anonymous and hidden classes) is ignored.
    pub fn transform(
        &self,
        loader: Option<&str>,
        class_name: Option<&str>,
        class_being_redefined: bool,
        class_bytes: &[u8],
    ) -> Option<Vec<u8>> {
        let class_name = class_name?;
        self.process_witnesses(class_name);

        if !self
            .filter
            .should_transform(loader, class_name, class_being_redefined, class_bytes)
        {
            return None;
        }

        let scripts: Vec<Arc<PatchScript>> = match self.scripts.read() {
            Ok(scripts) => scripts.clone(),
            Err(_) => return None,
        };
        let ctx = PatchContext {
            mapper: self.mapper.as_ref(),
            hooks: self.hooks.as_ref(),
        };

        let mut patched: Option<Vec<u8>> = None;
        for script in scripts {
            let input: &[u8] = patched.as_deref().unwrap_or(class_bytes);
            match script.patch(class_name, input, &ctx) {
                Ok(Some(output)) => {
                    log::debug!("script {} transformed {}", script.name(), class_name);
                    patched = Some(output);
                }
                Ok(None) => {}
                Err(e) => {
                    // host runtimes swallow transformer exceptions; stderr
                    // is the one channel that reliably reaches a human
                    eprintln!("transformer {} failed on {}: {}", script.name(), class_name, e);
                    log::warn!("script {} failed on {}: {}", script.name(), class_name, e);
                }
            }
        }

        if let Some(output) = &patched {
            self.dump(class_name, output, class_bytes);
        }
        patched
    }

    fn process_witnesses(&self, class_name: &str) {
        let pending = {
            let Ok(map) = self.witness_actions.lock() else { return };
            match map.get(class_name) {
                Some(actions) => actions.clone(),
                None => return,
            }
        };
        for action in pending {
            let Ok(mut action) = action.lock() else { continue };
            if action.triggered {
                continue;
            }
            action
                .trigger_groups
                .retain(|group| !group.iter().any(|c| c == class_name));
            if !action.trigger_groups.is_empty() {
                continue;
            }
            action.triggered = true;
            let Ok(mut scripts) = self.scripts.write() else { continue };
            if action.remove_on_witness {
                scripts.retain(|s| !Arc::ptr_eq(s, &action.script));
                log::debug!(
                    "removed script {} after witnessing {}",
                    action.script.name(),
                    class_name
                );
            } else {
                scripts.push(action.script.clone());
                log::debug!(
                    "added script {} after witnessing {}",
                    action.script.name(),
                    class_name
                );
            }
        }
    }

    /// Asks the host runtime to re-transform every already-loaded class
    /// any active script wants to patch.
    pub fn reload_classes(&self, host: &dyn RuntimeHost) -> Result<(), Error> {
        let to_reload: HashSet<String> = match self.scripts.read() {
            Ok(scripts) => scripts
                .iter()
                .flat_map(|s| s.classes_to_reload())
                .collect(),
            Err(_) => return Ok(()),
        };
        for class in host.loaded_classes() {
            if to_reload.contains(&class) {
                host.retransform(&class)
                    .map_err(|reason| Error::ReloadUnsupported(format!("{} ({})", class, reason)))?;
            }
        }
        Ok(())
    }

    fn dump(&self, class_name: &str, patched: &[u8], original: &[u8]) {
        let Some(dir) = &self.dump_dir else { return };
        let write = |suffix: &str, bytes: &[u8]| -> std::io::Result<()> {
            let path = dir.join(format!("{}{}.class", class_name, suffix));
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, bytes)
        };
        if let Err(e) = write("", patched).and_then(|_| write("_OLD", original)) {
            eprintln!("cannot dump patch result for {}: {}", class_name, e);
        }
    }
}

impl Default for ScriptManager {
    fn default() -> Self {
        Self::new()
    }
}

fn internal_name(class_name: &str) -> String {
    class_name.replace('.', "/")
}

#[cfg(test)]
pub(crate) fn test_context() -> PatchContext<'static> {
    use crate::resolve::MemoryClasses;
    use std::sync::OnceLock;
    static MAPPER: IdentityMapper = IdentityMapper;
    static HOOKS: OnceLock<MemoryClasses> = OnceLock::new();
    PatchContext {
        mapper: &MAPPER,
        hooks: HOOKS.get_or_init(MemoryClasses::new),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::read_class;
    use crate::scripts::{CustomScript, ScriptBuilder};
    use crate::testutil::sample_class;

    fn add_field_script(class: &str, field: &str) -> PatchScript {
        ScriptBuilder::add_field()
            .target_class(class)
            .field_name(field)
            .field_type("I")
            .set_private()
            .build()
            .unwrap()
    }

    #[test]
    fn scripts_chain_in_registration_order() {
        /// Asserts its input already carries the field the earlier script
        /// added, proving each script sees its predecessor's output.
        struct ExpectsField;
        impl CustomScript for ExpectsField {
            fn name(&self) -> String {
                "expects field".into()
            }
            fn classes_to_reload(&self) -> Vec<String> {
                vec!["test.Sample".into()]
            }
            fn would_patch(&self, class_name: &str) -> bool {
                class_name == "test/Sample"
            }
            fn patch(
                &self,
                _class_name: &str,
                bytes: &[u8],
                _ctx: &PatchContext,
            ) -> Result<Option<Vec<u8>>, crate::Error> {
                let unit = read_class(bytes).unwrap();
                assert!(unit.has_field("$first"), "saw the first script's output");
                Ok(None)
            }
        }

        let mut manager = ScriptManager::new();
        manager.set_dump_dir(None);
        manager.add_script(add_field_script("test.Sample", "$first"));
        manager.add_script(PatchScript::Custom(Box::new(ExpectsField)));
        manager.add_script(add_field_script("test.Sample", "$second"));

        let out = manager
            .transform(None, Some("test/Sample"), false, &sample_class())
            .expect("transformed");
        let unit = read_class(&out).unwrap();
        assert!(unit.has_field("$first"));
        assert!(unit.has_field("$second"));
    }

    #[test]
    fn script_failures_do_not_kill_the_chain() {
        struct Explodes;
        impl CustomScript for Explodes {
            fn name(&self) -> String {
                "explodes".into()
            }
            fn classes_to_reload(&self) -> Vec<String> {
                vec!["test.Sample".into()]
            }
            fn would_patch(&self, _: &str) -> bool {
                true
            }
            fn patch(
                &self,
                class_name: &str,
                _: &[u8],
                _: &PatchContext,
            ) -> Result<Option<Vec<u8>>, crate::Error> {
                Err(crate::Error::TransformFailure {
                    script: self.name(),
                    class_name: class_name.into(),
                    message: "boom".into(),
                })
            }
        }

        let mut manager = ScriptManager::new();
        manager.set_dump_dir(None);
        manager.add_script(PatchScript::Custom(Box::new(Explodes)));
        manager.add_script(add_field_script("test.Sample", "$after"));

        let out = manager
            .transform(None, Some("test/Sample"), false, &sample_class())
            .expect("the second script still ran");
        assert!(read_class(&out).unwrap().has_field("$after"));
    }

    #[test]
    fn nameless_classes_are_ignored() {
        let mut manager = ScriptManager::new();
        manager.set_dump_dir(None);
        manager.add_script(add_field_script("test.Sample", "$f"));
        assert!(manager.transform(None, None, false, &sample_class()).is_none());
    }

    #[test]
    fn the_filter_vetoes() {
        struct Veto;
        impl Filter for Veto {
            fn should_transform(&self, _: Option<&str>, _: &str, _: bool, _: &[u8]) -> bool {
                false
            }
        }
        let mut manager = ScriptManager::new();
        manager.set_dump_dir(None);
        manager.add_script(add_field_script("test.Sample", "$f"));
        manager.set_filter(Veto);
        assert!(manager
            .transform(None, Some("test/Sample"), false, &sample_class())
            .is_none());
    }

    #[test]
    fn witnesses_activate_scripts() {
        let mut manager = ScriptManager::new();
        manager.set_dump_dir(None);
        manager.add_script_if_witness(&["test.Trigger"], add_field_script("test.Sample", "$f"));

        // dormant until the witness loads
        assert!(manager
            .transform(None, Some("test/Sample"), false, &sample_class())
            .is_none());

        let trigger = crate::classfile::write_class(
            &mut crate::classfile::ClassUnit::synthesize(52, "test/Trigger", "java/lang/Object")
                .unwrap(),
        )
        .unwrap();
        assert!(manager.transform(None, Some("test/Trigger"), false, &trigger).is_none());

        // now active
        let out = manager
            .transform(None, Some("test/Sample"), false, &sample_class())
            .expect("transformed");
        assert!(read_class(&out).unwrap().has_field("$f"));
    }

    #[test]
    fn complex_witnesses_need_every_group() {
        let mut manager = ScriptManager::new();
        manager.set_dump_dir(None);
        manager.add_script_if_complex_witness(
            &[&["test.A1", "test.A2"], &["test.B1"]],
            add_field_script("test.Sample", "$f"),
        );

        let synth = |name: &str| {
            crate::classfile::write_class(
                &mut crate::classfile::ClassUnit::synthesize(52, name, "java/lang/Object").unwrap(),
            )
            .unwrap()
        };

        manager.transform(None, Some("test/A2"), false, &synth("test/A2"));
        // one group satisfied, the other not: still dormant
        assert!(manager
            .transform(None, Some("test/Sample"), false, &sample_class())
            .is_none());

        manager.transform(None, Some("test/B1"), false, &synth("test/B1"));
        let out = manager
            .transform(None, Some("test/Sample"), false, &sample_class())
            .expect("transformed");
        assert!(read_class(&out).unwrap().has_field("$f"));
    }

    #[test]
    fn not_witness_scripts_deactivate() {
        let mut manager = ScriptManager::new();
        manager.set_dump_dir(None);
        manager.add_script_if_not_witness(&["test.Kill"], add_field_script("test.Sample", "$f"));

        assert!(manager
            .transform(None, Some("test/Sample"), false, &sample_class())
            .is_some());

        let kill = crate::classfile::write_class(
            &mut crate::classfile::ClassUnit::synthesize(52, "test/Kill", "java/lang/Object")
                .unwrap(),
        )
        .unwrap();
        manager.transform(None, Some("test/Kill"), false, &kill);

        assert!(manager
            .transform(None, Some("test/Sample"), false, &sample_class())
            .is_none());
    }

    #[test]
    fn reload_surfaces_unsupported_runtimes() {
        struct NoReload;
        impl RuntimeHost for NoReload {
            fn loaded_classes(&self) -> Vec<String> {
                vec!["test.Sample".into()]
            }
            fn retransform(&self, _: &str) -> Result<(), String> {
                Err("retransformation not available".into())
            }
        }
        let mut manager = ScriptManager::new();
        manager.add_script(add_field_script("test.Sample", "$f"));
        let err = manager.reload_classes(&NoReload).unwrap_err();
        assert!(matches!(err, Error::ReloadUnsupported(_)));

        struct NothingLoaded;
        impl RuntimeHost for NothingLoaded {
            fn loaded_classes(&self) -> Vec<String> {
                Vec::new()
            }
            fn retransform(&self, _: &str) -> Result<(), String> {
                panic!("nothing to retransform")
            }
        }
        assert!(manager.reload_classes(&NothingLoaded).is_ok());
    }
}
