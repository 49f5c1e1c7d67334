//! Added custom actions \
//! Lets a host application register native Rust behavior that a document invokes through a
//! custom executable-content element, without forking the interpreter.

#![allow(clippy::doc_lazy_continuation)]

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Mutex;

use crate::datamodel::GlobalDataArc;

pub struct ActionContext {
    pub global: GlobalDataArc,
}

/// Trait to inject custom actions into the datamodel.
pub trait Action: Debug + Send {
    /// Executes the action.\
    fn execute(&mut self, context: &mut ActionContext) -> Result<String, String>;
}

/// Registry of custom actions, keyed by the name a document uses to invoke them.
/// Actions are behind a `Mutex` because dispatch only has `&Fsm` (the static, shared document),
/// never `&mut Fsm`.
#[derive(Default)]
pub struct ActionWrapper {
    actions: HashMap<String, Mutex<Box<dyn Action>>>,
}

impl ActionWrapper {
    pub fn new() -> ActionWrapper {
        ActionWrapper {
            actions: HashMap::new(),
        }
    }

    pub fn add_action(&mut self, name: &str, action: Box<dyn Action>) {
        self.actions.insert(name.to_string(), Mutex::new(action));
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Looks up `name` and runs it, if registered.
    pub fn invoke(&self, name: &str, context: &mut ActionContext) -> Option<Result<String, String>> {
        let action = self.actions.get(name)?;
        Some(action.lock().unwrap().execute(context))
    }
}

impl Debug for ActionWrapper {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionWrapper")
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .finish()
    }
}
