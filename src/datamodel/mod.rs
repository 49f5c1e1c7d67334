//! Datamodel / scripting boundary.\
//! See [W3C:SCXML - Datamodel](https://www.w3.org/TR/scxml/#datamodel) and
//! [W3C:SCXML Appendix B.1 - The Null Datamodel](https://www.w3.org/TR/scxml/#NullDatamodel).

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};

use lazy_static::lazy_static;
use regex::Regex;

use crate::event_io_processor::EventIOProcessor;
use crate::fsm::{
    CommonContent, Event, Fsm, GlobalData, Parameter, StateId, ERROR_EXECUTION,
};

#[cfg(feature = "ECMAScriptModel")]
pub mod ecma_script;

pub const DATAMODEL_OPTION_PREFIX: &str = "datamodel.";

pub const NULL_DATAMODEL: &str = "NULL";
pub const NULL_DATAMODEL_LC: &str = "null";

pub const SCXML_INVOKE_TYPE: &str = "http://www.w3.org/TR/scxml/";
pub const SCXML_INVOKE_TYPE_SHORT: &str = "scxml";

pub const SCXML_EVENT_PROCESSOR: &str = "http://www.w3.org/TR/scxml/#SCXMLEventProcessor";

#[cfg(feature = "BasicHttpEventIOProcessor")]
pub const BASIC_HTTP_EVENT_PROCESSOR: &str = "http://www.w3.org/TR/scxml/#BasicHTTPEventProcessor";

/// #W3C says:
/// the Platform sets the variable 'session_id' to the id of the current SCXML session
pub const SESSION_ID_VARIABLE_NAME: &str = "_sessionid";
/// #W3C says:
/// the Platform sets the variable 'name' to the name of this SCXML document
pub const SESSION_NAME_VARIABLE_NAME: &str = "_name";
pub const EVENT_VARIABLE_NAME: &str = "_event";
pub const EVENT_VARIABLE_FIELD_NAME: &str = "name";
pub const EVENT_VARIABLE_FIELD_TYPE: &str = "type";
pub const EVENT_VARIABLE_FIELD_SENDID: &str = "sendid";
pub const EVENT_VARIABLE_FIELD_ORIGIN: &str = "origin";
pub const EVENT_VARIABLE_FIELD_ORIGIN_TYPE: &str = "origintype";
pub const EVENT_VARIABLE_FIELD_INVOKEID: &str = "invokeid";
pub const EVENT_VARIABLE_FIELD_DATA: &str = "data";

/// The lock-protected, per-session bag of runtime state shared between the `Fsm` worker thread
/// and anyone who needs to reach into a running session (the executor, I/O processors, other
/// sessions' datamodels sending events).
pub type GlobalDataArc = Arc<Mutex<GlobalData>>;
pub type GlobalDataLock<'a> = MutexGuard<'a, GlobalData>;

/// Downcasting helper for the trait objects kept in the `<send>`/processor registries
/// (`EventIOProcessor`, `ExecutableContent`), mirroring the blanket impl every `Box<dyn ...>`
/// collection in this crate relies on to get back a concrete type.
pub trait ToAny: 'static {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Debug + 'static> ToAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A value inside the datamodel. Kept as a small closed enum instead of a raw string so numeric
/// and boolean round-trips through `<assign>`/`<param>`/`In()` don't go through text formatting
/// and back.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    None(),
    String(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    Array(Vec<Data>),
    Error(String),
}

impl Default for Data {
    fn default() -> Self {
        Data::None()
    }
}

impl Display for Data {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Data::None() => write!(f, "null"),
            Data::String(s) => write!(f, "{}", s),
            Data::Integer(i) => write!(f, "{}", i),
            Data::Double(d) => write!(f, "{}", d),
            Data::Boolean(b) => write!(f, "{}", b),
            Data::Array(a) => write!(
                f,
                "[{}]",
                a.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",")
            ),
            Data::Error(e) => write!(f, "Error({})", e),
        }
    }
}

impl Data {
    pub fn as_str(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DataStore {
    values: HashMap<String, Data>,
}

impl DataStore {
    pub fn new() -> DataStore {
        DataStore {
            values: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Data> {
        self.values.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Data> {
        self.values.get_mut(name)
    }

    pub fn set(&mut self, name: &str, value: Data) {
        self.values.insert(name.to_string(), value);
    }

    /// Snapshot of the declared `<data>` entries, in the order they happen to sit in the
    /// backing map (callers that need document order re-sort by name against the owning
    /// state's `<data>` declarations upstream in the XML reader).
    pub fn iter_snapshot(&self) -> Vec<(String, Data)> {
        self.values.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// The scripting/datamodel boundary. One instance owns the single-threaded script engine (or,
/// for `datamodel="null"`, nothing at all) for exactly one session; all calls into it happen
/// from that session's own worker thread, so the trait itself does not need to be `Sync`.
pub trait Datamodel {
    /// Access to session-shared bookkeeping (configuration, queues, child sessions, ...).
    fn global(&self) -> &GlobalDataArc;

    fn global_s(&mut self) -> GlobalDataArc {
        self.global().clone()
    }

    fn get_name(&self) -> &'static str;

    /// Installs the system variables mandated by the spec regardless of datamodel
    /// (`_sessionid`, `_name`, `_ioprocessors`), and anything else every datamodel needs to set
    /// up before `initializeDataModel` is called on individual states.
    fn implement_mandatory_functionality(&mut self, fsm: &mut Fsm);

    /// #W3C says:
    /// Initializes the datamodel for the given state, processing <data> elements in document
    /// order the first time the state is entered (or, for binding="early", for every state up
    /// front before the machine starts).
    fn initializeDataModel(&mut self, fsm: &mut Fsm, state: StateId);

    /// Binds system/session variables that don't depend on any particular state.
    fn initialize_read_only(&mut self, name: &str, value: &str);

    fn set(&mut self, name: &str, value: Data);

    /// Updates the read-only `_event` system variable ahead of evaluating transitions/content
    /// against a newly dequeued event.
    fn set_event(&mut self, event: &Event);

    /// #W3C says: `<assign>` -- sets the location in the datamodel to the value of expr.
    fn assign(&mut self, location: &str, expr: &str) -> Result<(), String>;

    fn get_by_location(&mut self, location: &str) -> Result<Data, String>;

    /// Evaluates an ECMAScript (or other datamodel-native) expression that stands for a value,
    /// e.g. a `<param expr="...">` or `<data expr="...">`.
    fn get_expression_alternative_value(&mut self, expr: &str) -> Result<Data, String> {
        self.execute(expr)
    }

    fn get_io_processors(&self) -> Arc<Mutex<HashMap<String, Box<dyn EventIOProcessor>>>> {
        self.global().lock().unwrap().io_processors.clone()
    }

    /// Executes `script` and returns its value (for `<script>`, the value is discarded by the
    /// caller; for expressions, it is the result).
    fn execute(&mut self, script: &str) -> Result<Data, String>;

    /// Evaluates `cond` as a boolean per W3C's "error.execution on failure, condition is false"
    /// rule (3.13).
    fn execute_condition(&mut self, cond: &str) -> Result<bool, String>;

    /// #W3C says: `<foreach>` -- iterates array, binding item (and optionally index) for each
    /// iteration and running body for each.
    fn execute_for_each(
        &mut self,
        array_expr: &str,
        item: &str,
        index: &str,
        body: &mut dyn FnMut(&mut dyn Datamodel) -> bool,
    ) -> Result<(), String>;

    fn log(&mut self, label: &str, msg: &str);

    fn clear(&mut self);

    fn internal_error_execution_with_event(&mut self, event: &Event) {
        let ev = crate::fsm::Event::error_execution_with_event(event);
        self.global().lock().unwrap().enqueue_internal(ev);
    }

    fn internal_error_execution_for_event(&mut self, send_id: &Option<String>, invoke_id: &Option<String>) {
        let ev = crate::fsm::Event::error_execution(send_id, invoke_id);
        self.global().lock().unwrap().enqueue_internal(ev);
    }

    fn internal_error_execution(&mut self) {
        self.internal_error_execution_for_event(&None, &None)
    }

    fn internal_error_communication(&mut self, event: &Event) {
        let ev = crate::fsm::Event::error_communication(event);
        self.global().lock().unwrap().enqueue_internal(ev);
    }

    /// Dispatches through a named I/O processor (SCXML event processor, BasicHTTP, ...),
    /// falling back to the targetless "no processor matches" `error.execution`.
    fn send(&mut self, processor_type: &str, target: &str, event: Event) -> bool {
        let processors = self.get_io_processors();
        let mut guard = processors.lock().unwrap();
        match guard.get_mut(processor_type) {
            Some(p) => {
                let global = self.global().clone();
                p.send(&global, target, event)
            }
            None => {
                drop(guard);
                self.internal_error_execution_with_event(&event);
                false
            }
        }
    }

    /// #W3C says:
    /// <content> -- evaluates content's expr (if given) or uses the literal text child,
    /// raising error.execution if expr evaluation fails.
    fn evaluate_content(&mut self, content: &Option<CommonContent>) -> Option<Data> {
        match content {
            None => None,
            Some(c) => {
                if let Some(expr) = &c.content_expr {
                    match self.execute(expr) {
                        Ok(v) => Some(v),
                        Err(_) => {
                            self.internal_error_execution();
                            None
                        }
                    }
                } else {
                    c.content.clone().map(Data::String)
                }
            }
        }
    }

    /// #W3C says:
    /// <param> -- name is required, and exactly one of location or expr; error.execution if
    /// evaluating location/expr fails.
    fn evaluate_params(&mut self, params: &Option<Vec<Parameter>>, out: &mut Vec<crate::fsm::ParamPair>) {
        if let Some(params) = params {
            for p in params {
                let value = if !p.location.is_empty() {
                    self.get_by_location(&p.location)
                } else if !p.expr.is_empty() {
                    self.execute(&p.expr)
                } else {
                    Err(format!("<param name='{}'> has neither location nor expr", p.name))
                };
                match value {
                    Ok(v) => out.push(crate::fsm::ParamPair::new_moved(p.name.clone(), v)),
                    Err(msg) => {
                        log::error!("{}", msg);
                        self.internal_error_execution();
                    }
                }
            }
        }
    }
}

/// #W3C says (Appendix B.1):
/// B.1.1 The Data Model is empty; i.e., it has no accessible values... B.1.5 If the value
/// specified by 'expr' is not a valid expression in the specified language, the SCXML Processor
/// MUST place the error 'error.execution' on the internal event queue... B.1.7 The boolean
/// expression language consists of the single expression "In(id)".
pub struct NullDatamodel {
    global: GlobalDataArc,
}

lazy_static! {
    static ref IN_EXPR: Regex = Regex::new(r#"^\s*In\(\s*'?([^')\s]+)'?\s*\)\s*$"#).unwrap();
}

impl NullDatamodel {
    pub fn new(global: GlobalDataArc) -> NullDatamodel {
        NullDatamodel { global }
    }
}

impl Datamodel for NullDatamodel {
    fn global(&self) -> &GlobalDataArc {
        &self.global
    }

    fn get_name(&self) -> &'static str {
        NULL_DATAMODEL
    }

    fn implement_mandatory_functionality(&mut self, _fsm: &mut Fsm) {}

    /// #W3C says (B.1.2): `<data>` elements are not supported, and are simply ignored.
    fn initializeDataModel(&mut self, _fsm: &mut Fsm, _state: StateId) {}

    fn initialize_read_only(&mut self, _name: &str, _value: &str) {}

    fn set(&mut self, _name: &str, _value: Data) {}

    fn set_event(&mut self, _event: &Event) {}

    /// #W3C says (B.1.3): `<assign>` is not supported, and produces no error (it is simply
    /// inert in this datamodel, per the "unsupported elements are no-ops" reading).
    fn assign(&mut self, _location: &str, _expr: &str) -> Result<(), String> {
        Ok(())
    }

    fn get_by_location(&mut self, _location: &str) -> Result<Data, String> {
        Err("null datamodel has no accessible values".to_string())
    }

    fn execute(&mut self, _script: &str) -> Result<Data, String> {
        Ok(Data::None())
    }

    /// #W3C says (B.1.7): the only legal conditional expression is `In(id)`, testing whether
    /// `id` is a member of the current configuration.
    fn execute_condition(&mut self, cond: &str) -> Result<bool, String> {
        match IN_EXPR.captures(cond.trim()) {
            Some(caps) => {
                let id = caps.get(1).unwrap().as_str();
                Ok(self.global.lock().unwrap().is_in_state(id))
            }
            None => Err(format!(
                "'{}' is not a legal condition for the null datamodel ({})",
                cond, ERROR_EXECUTION
            )),
        }
    }

    fn execute_for_each(
        &mut self,
        _array_expr: &str,
        _item: &str,
        _index: &str,
        _body: &mut dyn FnMut(&mut dyn Datamodel) -> bool,
    ) -> Result<(), String> {
        // #W3C says (B.1.6): <foreach> is not supported; treated as inert.
        Ok(())
    }

    fn log(&mut self, label: &str, msg: &str) {
        log::info!("{}: {}", label, msg);
    }

    fn clear(&mut self) {}
}

/// Creates the datamodel implementation named by `<scxml datamodel="...">`.
pub fn create_datamodel(name: &str, global: GlobalDataArc) -> Box<dyn Datamodel> {
    #[cfg(feature = "ECMAScriptModel")]
    if name.eq_ignore_ascii_case(crate::fsm::ECMA_SCRIPT) || name.eq_ignore_ascii_case(crate::fsm::ECMA_SCRIPT_LC) {
        return Box::new(ecma_script::ECMAScriptDatamodel::new(global));
    }
    if name.eq_ignore_ascii_case(NULL_DATAMODEL) || name.is_empty() {
        return Box::new(NullDatamodel::new(global));
    }
    log::warn!("Unknown datamodel '{}', falling back to null datamodel", name);
    Box::new(NullDatamodel::new(global))
}
