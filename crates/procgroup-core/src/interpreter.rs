//! Command stream interpreter.
//!
//! The process module only relies on the [`Interpreter`] trait. The
//! [`ObjectInterpreter`] provided here keeps an object table keyed by
//! [`ObjectId`], instantiates objects through registered class factories,
//! and can activate named extensions that contribute more classes.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::error::{ProcessError, Result};
use crate::objects::PointCloud;
use crate::stream::{Command, CommandStream, ObjectId, Value};

/// An object that commands can be invoked on.
pub trait ServerObject: Send + fmt::Debug {
    fn class_name(&self) -> &'static str;

    fn invoke(&mut self, method: &str, args: &[Value]) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Constructor for a [`ServerObject`] class.
pub type ClassFactory = fn() -> Box<dyn ServerObject>;

/// Executes command streams against local object state.
pub trait Interpreter: Send {
    /// Decode and run every record of `data`, stopping at the first failure.
    fn execute_stream(&mut self, data: &[u8]) -> Result<()>;

    /// Make the named extension available. Returns whether it loaded.
    fn load_extension(&mut self, name: &str) -> bool;

    /// Look up an object created by an earlier stream.
    fn object(&self, id: ObjectId) -> Option<&dyn ServerObject>;
}

/// Interpreter handle shared between the caller and the process module.
pub type SharedInterpreter = Arc<Mutex<dyn Interpreter>>;

/// Wrap an interpreter so it can be handed to a process module.
pub fn shared<I: Interpreter + 'static>(interpreter: I) -> SharedInterpreter {
    Arc::new(Mutex::new(interpreter))
}

/// A named bundle of classes that can be loaded at runtime.
#[derive(Debug, Clone)]
pub struct Extension {
    pub name: String,
    pub classes: Vec<(&'static str, ClassFactory)>,
}

impl Extension {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            classes: Vec::new(),
        }
    }

    pub fn with_class(mut self, class: &'static str, factory: ClassFactory) -> Self {
        self.classes.push((class, factory));
        self
    }
}

/// Reference interpreter with an object table and class registry.
pub struct ObjectInterpreter {
    classes: HashMap<String, ClassFactory>,
    available: HashMap<String, Extension>,
    loaded: BTreeSet<String>,
    objects: BTreeMap<ObjectId, Box<dyn ServerObject>>,
    executed: u64,
}

impl fmt::Debug for ObjectInterpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectInterpreter")
            .field("classes", &self.classes.keys().collect::<Vec<_>>())
            .field("loaded", &self.loaded)
            .field("objects", &self.objects.len())
            .field("executed", &self.executed)
            .finish()
    }
}

impl Default for ObjectInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectInterpreter {
    /// Create an interpreter that knows the built-in classes.
    pub fn new() -> Self {
        let mut interpreter = Self {
            classes: HashMap::new(),
            available: HashMap::new(),
            loaded: BTreeSet::new(),
            objects: BTreeMap::new(),
            executed: 0,
        };
        interpreter.register_class(PointCloud::CLASS_NAME, PointCloud::create);
        interpreter
    }

    pub fn register_class(&mut self, class: &str, factory: ClassFactory) {
        self.classes.insert(class.to_string(), factory);
    }

    /// Offer an extension to [`Interpreter::load_extension`].
    pub fn register_extension(&mut self, extension: Extension) {
        self.available.insert(extension.name.clone(), extension);
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains(name)
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    /// Number of records executed since creation.
    pub fn executed(&self) -> u64 {
        self.executed
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut (dyn ServerObject + 'static)> {
        self.objects.get_mut(&id).map(|o| o.as_mut())
    }

    /// Typed access to an object, for callers that know its class.
    pub fn downcast_mut<T: 'static>(&mut self, id: ObjectId) -> Option<&mut T> {
        self.objects
            .get_mut(&id)
            .and_then(|o| o.as_any_mut().downcast_mut::<T>())
    }

    fn execute(&mut self, command: Command) -> Result<()> {
        match command {
            Command::New { class, id } => {
                let factory = self.classes.get(&class).ok_or_else(|| {
                    ProcessError::interpreter(format!("unknown class '{}'", class))
                })?;
                if self.objects.insert(id, factory()).is_some() {
                    warn!("Object {} replaced by a new {}", id, class);
                }
            }
            Command::Invoke { id, method, args } => {
                let object = self.objects.get_mut(&id).ok_or_else(|| {
                    ProcessError::interpreter(format!("no object with id {} for {}", id, method))
                })?;
                object.invoke(&method, &args)?;
            }
            Command::Delete { id } => {
                if self.objects.remove(&id).is_none() {
                    return Err(ProcessError::interpreter(format!(
                        "cannot delete missing object {}",
                        id
                    )));
                }
            }
        }
        self.executed += 1;
        Ok(())
    }
}

impl Interpreter for ObjectInterpreter {
    fn execute_stream(&mut self, data: &[u8]) -> Result<()> {
        let commands = CommandStream::decode(data)?;
        debug!("Executing stream of {} records", commands.len());
        for command in commands {
            self.execute(command)?;
        }
        Ok(())
    }

    fn load_extension(&mut self, name: &str) -> bool {
        if self.loaded.contains(name) {
            return true;
        }

        let Some(extension) = self.available.get(name) else {
            warn!("Extension {} is not available on this process", name);
            return false;
        };

        for (class, factory) in &extension.classes {
            self.classes.insert(class.to_string(), *factory);
        }
        info!(
            "Loaded extension {} ({} classes)",
            name,
            extension.classes.len()
        );
        self.loaded.insert(name.to_string());
        true
    }

    fn object(&self, id: ObjectId) -> Option<&dyn ServerObject> {
        self.objects.get(&id).map(|o| o.as_ref())
    }
}
