use crate::engine::actions::{Action, NestedAction};
use crate::error::{CatalystError, ErrorCode};
use crate::playbook::types::Playbook;
use crate::playbook::yaml::{playbook_from_yaml_str, ShorthandRules};
use crate::shared::ids::validate_kebab_identifier;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// A source of playbook definitions. Loaders are tried in registration
/// order for every candidate identifier.
pub trait PlaybookLoader: Send + Sync {
    fn name(&self) -> &str;
    fn supports(&self, identifier: &str) -> bool;
    fn load(&self, identifier: &str) -> Result<Option<Playbook>, CatalystError>;
}

/// Built-in actions the step executor dispatches itself. They stay in the
/// catalog so metadata lookups and `create_action` treat them uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinAction {
    If,
    ForEach,
    Playbook,
    Var,
    Return,
    Checkpoint,
    Throw,
}

pub enum ActionConstructor {
    Builtin(BuiltinAction),
    Leaf(Arc<dyn Fn() -> Box<dyn Action> + Send + Sync>),
    Nested(Arc<dyn Fn() -> Box<dyn NestedAction> + Send + Sync>),
}

impl std::fmt::Debug for ActionConstructor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionConstructor::Builtin(builtin) => write!(f, "Builtin({builtin:?})"),
            ActionConstructor::Leaf(_) => write!(f, "Leaf(..)"),
            ActionConstructor::Nested(_) => write!(f, "Nested(..)"),
        }
    }
}

#[derive(Debug)]
pub struct ActionRegistration {
    pub action_type: String,
    pub primary_property: Option<String>,
    pub nested_step_properties: Vec<String>,
    pub needs_step_executor: bool,
    pub constructor: ActionConstructor,
}

impl ActionRegistration {
    pub fn leaf<F>(action_type: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Action> + Send + Sync + 'static,
    {
        Self {
            action_type: action_type.to_string(),
            primary_property: None,
            nested_step_properties: Vec::new(),
            needs_step_executor: false,
            constructor: ActionConstructor::Leaf(Arc::new(factory)),
        }
    }

    pub fn nested<F>(action_type: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn NestedAction> + Send + Sync + 'static,
    {
        Self {
            action_type: action_type.to_string(),
            primary_property: None,
            nested_step_properties: Vec::new(),
            needs_step_executor: true,
            constructor: ActionConstructor::Nested(Arc::new(factory)),
        }
    }

    fn builtin(
        action_type: &str,
        builtin: BuiltinAction,
        primary_property: Option<&str>,
        nested_step_properties: &[&str],
        needs_step_executor: bool,
    ) -> Self {
        Self {
            action_type: action_type.to_string(),
            primary_property: primary_property.map(str::to_string),
            nested_step_properties: nested_step_properties
                .iter()
                .map(|v| v.to_string())
                .collect(),
            needs_step_executor,
            constructor: ActionConstructor::Builtin(builtin),
        }
    }

    pub fn with_primary_property(mut self, property: &str) -> Self {
        self.primary_property = Some(property.to_string());
        self
    }

    pub fn with_nested_step_properties(mut self, properties: &[&str]) -> Self {
        self.nested_step_properties = properties.iter().map(|v| v.to_string()).collect();
        self
    }
}

pub enum ActionInstance {
    Builtin(BuiltinAction),
    Leaf(Box<dyn Action>),
    Nested(Box<dyn NestedAction>),
}

impl std::fmt::Debug for ActionInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionInstance::Builtin(b) => f.debug_tuple("Builtin").field(b).finish(),
            ActionInstance::Leaf(_) => f.debug_tuple("Leaf").finish(),
            ActionInstance::Nested(_) => f.debug_tuple("Nested").finish(),
        }
    }
}

/// Holds the loader chain, the action catalog, registered in-memory
/// playbooks, and the identifier cache.
#[derive(Debug)]
pub struct Registry {
    loaders: Vec<Box<dyn PlaybookLoader>>,
    actions: BTreeMap<String, ActionRegistration>,
    registered: Arc<Mutex<BTreeMap<String, Playbook>>>,
    cache: Mutex<HashMap<String, Playbook>>,
    search_paths: Vec<PathBuf>,
}

impl std::fmt::Debug for dyn PlaybookLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PlaybookLoader({})", self.name())
    }
}

impl Registry {
    /// A registry with the built-in action catalog, the in-memory playbook
    /// loader, and the yaml file loader.
    pub fn with_defaults(search_paths: Vec<PathBuf>) -> Self {
        let registered = Arc::new(Mutex::new(BTreeMap::new()));
        let mut registry = Self {
            loaders: Vec::new(),
            actions: BTreeMap::new(),
            registered: registered.clone(),
            cache: Mutex::new(HashMap::new()),
            search_paths,
        };

        for registration in builtin_actions() {
            registry
                .actions
                .insert(registration.action_type.clone(), registration);
        }
        registry.loaders.push(Box::new(MemoryLoader { registered }));
        registry
            .loaders
            .push(Box::new(YamlFileLoader::new(ShorthandRules::builtin())));
        registry
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    pub fn register_loader(&mut self, loader: Box<dyn PlaybookLoader>) -> Result<(), CatalystError> {
        if self.loaders.iter().any(|known| known.name() == loader.name()) {
            return Err(CatalystError::new(
                ErrorCode::DuplicateLoaderName,
                format!("a loader named `{}` is already registered", loader.name()),
            ));
        }
        self.loaders.push(loader);
        Ok(())
    }

    pub fn register_action(&mut self, registration: ActionRegistration) -> Result<(), CatalystError> {
        if let Err(defect) = validate_kebab_identifier("action type", &registration.action_type) {
            return Err(CatalystError::new(ErrorCode::InvalidActionName, defect));
        }
        if self.actions.contains_key(&registration.action_type) {
            return Err(CatalystError::new(
                ErrorCode::DuplicateAction,
                format!(
                    "action type `{}` is already registered",
                    registration.action_type
                ),
            ));
        }
        self.actions
            .insert(registration.action_type.clone(), registration);
        Ok(())
    }

    pub fn register_playbook(&self, playbook: Playbook) -> Result<(), CatalystError> {
        if let Err(defect) = validate_kebab_identifier("playbook name", &playbook.name) {
            return Err(CatalystError::new(ErrorCode::InvalidPlaybookName, defect));
        }
        let mut registered = lock(&self.registered);
        if registered.contains_key(&playbook.name) {
            return Err(CatalystError::new(
                ErrorCode::DuplicatePlaybook,
                format!("playbook `{}` is already registered", playbook.name),
            ));
        }
        registered.insert(playbook.name.clone(), playbook);
        Ok(())
    }

    pub fn action(&self, action_type: &str) -> Option<&ActionRegistration> {
        self.actions.get(action_type)
    }

    pub fn nested_step_properties(&self, action_type: &str) -> Vec<String> {
        self.actions
            .get(action_type)
            .map(|registration| registration.nested_step_properties.clone())
            .unwrap_or_default()
    }

    pub fn create_action(
        &self,
        action_type: &str,
        with_step_executor: bool,
    ) -> Result<ActionInstance, CatalystError> {
        let registration = self.actions.get(action_type).ok_or_else(|| {
            CatalystError::new(
                ErrorCode::ActionNotFound,
                format!("no action type `{action_type}` is registered"),
            )
            .with_guidance("register the action before running playbooks that use it")
        })?;
        if registration.needs_step_executor && !with_step_executor {
            return Err(CatalystError::new(
                ErrorCode::MissingStepExecutor,
                format!("action type `{action_type}` requires a step executor"),
            ));
        }
        Ok(match &registration.constructor {
            ActionConstructor::Builtin(builtin) => ActionInstance::Builtin(*builtin),
            ActionConstructor::Leaf(factory) => ActionInstance::Leaf(factory()),
            ActionConstructor::Nested(factory) => ActionInstance::Nested(factory()),
        })
    }

    pub fn load_playbook(&self, identifier: &str) -> Result<Playbook, CatalystError> {
        if let Some(hit) = lock(&self.cache).get(identifier) {
            return Ok(hit.clone());
        }

        let candidates = self.candidates(identifier);
        for candidate in &candidates {
            for loader in &self.loaders {
                if !loader.supports(candidate) {
                    continue;
                }
                if let Some(playbook) = loader.load(candidate)? {
                    lock(&self.cache).insert(identifier.to_string(), playbook.clone());
                    return Ok(playbook);
                }
            }
        }

        let loader_names: Vec<&str> = self.loaders.iter().map(|loader| loader.name()).collect();
        Err(CatalystError::new(
            ErrorCode::PlaybookNotFound,
            format!(
                "playbook `{identifier}` was not found; tried {candidates:?} with loaders {loader_names:?}"
            ),
        )
        .with_guidance("check the identifier, the search paths, and the registered loaders"))
    }

    pub fn clear_cache(&self) {
        lock(&self.cache).clear();
    }

    fn candidates(&self, identifier: &str) -> Vec<String> {
        let path = Path::new(identifier);
        if path.is_absolute() || identifier.starts_with("./") || identifier.starts_with("../") {
            return vec![identifier.to_string()];
        }

        let mut candidates = vec![
            identifier.to_string(),
            format!("{identifier}.yaml"),
            format!("{identifier}.yml"),
        ];
        for search_path in &self.search_paths {
            let base = search_path.join(identifier).to_string_lossy().to_string();
            candidates.push(format!("{base}.yaml"));
            candidates.push(format!("{base}.yml"));
            candidates.push(base);
        }
        candidates.dedup();
        candidates
    }
}

fn builtin_actions() -> Vec<ActionRegistration> {
    vec![
        ActionRegistration::builtin("if", BuiltinAction::If, Some("condition"), &["then", "else"], true),
        ActionRegistration::builtin("for-each", BuiltinAction::ForEach, Some("items"), &["steps"], true),
        ActionRegistration::builtin("playbook", BuiltinAction::Playbook, Some("name"), &[], true),
        ActionRegistration::builtin("var", BuiltinAction::Var, None, &[], false),
        ActionRegistration::builtin("return", BuiltinAction::Return, None, &[], false),
        ActionRegistration::builtin("checkpoint", BuiltinAction::Checkpoint, Some("message"), &[], false),
        ActionRegistration::builtin("throw", BuiltinAction::Throw, Some("code"), &[], false),
    ]
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct MemoryLoader {
    registered: Arc<Mutex<BTreeMap<String, Playbook>>>,
}

impl PlaybookLoader for MemoryLoader {
    fn name(&self) -> &str {
        "memory"
    }

    fn supports(&self, identifier: &str) -> bool {
        lock(&self.registered).contains_key(identifier)
    }

    fn load(&self, identifier: &str) -> Result<Option<Playbook>, CatalystError> {
        Ok(lock(&self.registered).get(identifier).cloned())
    }
}

pub struct YamlFileLoader {
    rules: ShorthandRules,
}

impl YamlFileLoader {
    pub fn new(rules: ShorthandRules) -> Self {
        Self { rules }
    }
}

impl PlaybookLoader for YamlFileLoader {
    fn name(&self) -> &str {
        "yaml-file"
    }

    fn supports(&self, identifier: &str) -> bool {
        let path = Path::new(identifier);
        let extension = path.extension().and_then(|ext| ext.to_str());
        matches!(extension, Some("yaml") | Some("yml")) && path.is_file()
    }

    fn load(&self, identifier: &str) -> Result<Option<Playbook>, CatalystError> {
        let raw = match fs::read_to_string(identifier) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(CatalystError::new(
                    ErrorCode::InvalidPlaybookConfig,
                    format!("could not read playbook file `{identifier}`"),
                )
                .caused_by_foreign(err))
            }
        };
        playbook_from_yaml_str(&raw, &self.rules).map(Some)
    }
}
