//! Implementation of "executable content" elements.\
//! See [W3C:Executable Content](/doc/W3C_SCXML_2024_07_13/index.html#executable).

use std::collections::HashMap;
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::Ordering;

#[cfg(feature = "Debug")]
use crate::common::debug;
use crate::actions::ActionContext;
use crate::common::{error, warn};
use crate::datamodel::{Data, Datamodel, ToAny, SCXML_EVENT_PROCESSOR};
use crate::event_io_processor::scxml_event_io_processor::SCXML_TARGET_INTERNAL;
use crate::fsm::{
    vec_to_string, CommonContent, Event, EventType, ExecutableContentId, Fsm, ParamPair, Parameter,
    PLATFORM_ID_COUNTER,
};

pub const TARGET_SCXML_EVENT_PROCESSOR: &str = "http://www.w3.org/TR/scxml/#SCXMLEventProcessor";

pub const TYPE_IF: u8 = 0;
pub const TYPE_EXPRESSION: u8 = 1;
/// No longer used:
/// pub const TYPE_SCRIPT: u8 = 2;
pub const TYPE_LOG: u8 = 3;
pub const TYPE_FOREACH: u8 = 4;
pub const TYPE_SEND: u8 = 5;
pub const TYPE_RAISE: u8 = 6;
pub const TYPE_CANCEL: u8 = 7;
pub const TYPE_ASSIGN: u8 = 8;
pub const TYPE_CUSTOM_ACTION: u8 = 9;

/// `<send><content>` larger than this is rejected with `error.execution` instead of dispatched.
pub const MAX_SEND_CONTENT_SIZE: usize = 10 * 1024 * 1024;

pub const TYPE_NAMES: [&str; 10] = [
    "if",
    "expression",
    "unused",
    "log",
    "foreach",
    "send",
    "raise",
    "cancel",
    "assign",
    "custom",
];

/// Gets the global data store from datamodel.
macro_rules! get_global {
    ($x:expr) => {
        $x.global().lock().unwrap()
    };
}

pub trait ExecutableContent: ToAny + Debug + Send {
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool;
    fn get_type(&self) -> u8;

    fn get_trace(&self) -> HashMap<&str, Data>;
}

pub fn get_safe_executable_content_as<T: 'static>(ec: &mut dyn ExecutableContent) -> &mut T {
    let va = ec.as_any_mut();
    va.downcast_mut::<T>()
        .unwrap_or_else(|| panic!("Failed to cast executable content"))
}

pub fn get_executable_content_as<T: 'static>(ec: &mut dyn ExecutableContent) -> Option<&mut T> {
    let va = ec.as_any_mut();
    match va.downcast_mut::<T>() {
        Some(v) => Some(v),
        None => None,
    }
}

pub fn get_opt_executable_content_as<T: 'static>(
    ec_opt: Option<&mut dyn ExecutableContent>,
) -> Option<&mut T> {
    match ec_opt {
        Some(ec) => get_executable_content_as::<T>(ec),
        None => None,
    }
}

/// Resolves the W3C "literal-attribute-or-expr-attribute" pattern shared by `target`/`targetexpr`,
/// `event`/`eventexpr`, `type`/`typeexpr` etc.: the plain attribute is a literal string, the
/// `*expr` variant is evaluated by the datamodel.
fn literal_or_expr(
    datamodel: &mut dyn Datamodel,
    literal: &str,
    expr: &str,
) -> Result<Data, String> {
    if !literal.is_empty() {
        Ok(Data::String(literal.to_string()))
    } else {
        datamodel.get_expression_alternative_value(expr)
    }
}

#[derive(Debug, Default)]
pub struct Cancel {
    pub send_id: String,
    pub send_id_expr: String,
}

/// Holds all parameters of a \<send\> call.
#[derive(Debug, Default)]
pub struct SendParameters {
    /// SCXML \<send\> attribute 'idlocation'
    pub name_location: String,
    /// SCXML \<send\> attribute 'id'.
    pub name: String,
    /// In case the id is generated, the parent state of the send.
    pub parent_state_name: String,
    /// SCXML \<send\> attribute 'event'.
    pub event: String,
    /// SCXML \<send\> attribute 'eventexpr'.
    pub event_expr: String,
    /// SCXML \<send\> attribute 'target'.
    pub target: String,
    /// SCXML \<send\> attribute 'targetexpr'.
    pub target_expr: String,
    /// SCXML \<send\> attribute 'type'.
    pub type_value: String,
    /// SCXML \<send\> attribute 'typeexpr'.
    pub type_expr: String,
    /// SCXML \<send\> attribute 'delay' in milliseconds.
    pub delay_ms: u64,
    /// SCXML \<send\> attribute 'delayexpr'.
    pub delay_expr: String,
    /// SCXML \<send\> attribute 'namelist'. Must not be specified in conjunction with 'content'.
    pub name_list: Vec<String>,
    /// \<param\> children
    pub params: Option<Vec<Parameter>>,
    pub content: Option<CommonContent>,
}

impl SendParameters {
    pub fn new() -> SendParameters {
        SendParameters::default()
    }
}

impl Cancel {
    pub fn new() -> Cancel {
        Cancel::default()
    }
}

#[derive(Debug, Default)]
pub struct Expression {
    pub content: String,
}

#[derive(Debug, Default)]
pub struct Log {
    pub label: String,
    pub expression: String,
}

#[derive(Debug, Default)]
pub struct If {
    pub condition: String,
    pub content: ExecutableContentId,
    pub else_content: ExecutableContentId,
}

#[derive(Debug, Default)]
pub struct ForEach {
    pub array: String,
    pub item: String,
    pub index: String,
    pub content: ExecutableContentId,
}

#[derive(Debug, Default)]
pub struct Assign {
    pub location: String,
    pub expr: String,
}

impl Assign {
    pub fn new() -> Assign {
        Assign::default()
    }
}

/// A document-level hook into a host-registered [`crate::actions::Action`], looked up by name
/// from [`Fsm::custom_actions`] at execution time.
#[derive(Debug, Default)]
pub struct CustomAction {
    pub name: String,
}

impl CustomAction {
    pub fn new(name: &str) -> CustomAction {
        CustomAction {
            name: name.to_string(),
        }
    }
}

impl ExecutableContent for CustomAction {
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool {
        let mut context = ActionContext {
            global: datamodel.global().clone(),
        };
        match fsm.custom_actions.invoke(&self.name, &mut context) {
            Some(Ok(_)) => true,
            Some(Err(msg)) => {
                error!("custom action '{}' failed: {}", self.name, msg);
                false
            }
            None => {
                warn!("no custom action registered for '{}'", self.name);
                false
            }
        }
    }

    fn get_type(&self) -> u8 {
        TYPE_CUSTOM_ACTION
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("name", Data::String(self.name.clone()));
        d
    }
}

impl ExecutableContent for Assign {
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) -> bool {
        match datamodel.assign(&self.location, &self.expr) {
            Ok(()) => true,
            Err(msg) => {
                error!("assign to '{}' failed: {}", self.location, msg);
                datamodel.internal_error_execution();
                false
            }
        }
    }

    fn get_type(&self) -> u8 {
        TYPE_ASSIGN
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("location", Data::String(self.location.clone()));
        d.insert("expr", Data::String(self.expr.clone()));
        d
    }
}

/// *W3C says*:
/// The \<raise\> element raises an event in the current SCXML session.\
/// Note that the event will not be processed until the current block of executable content has completed
/// and all events that are already in the internal event queue have been processed. For example, suppose
/// the \<raise\> element occurs first in the \<onentry\> handler of state S followed by executable content
/// elements ec1 and ec2. If event e1 is already in the internal event queue when S is entered, the event
/// generated by \<raise\> will not be processed until ec1 and ec2 have finished execution and e1 has been
/// processed.
///
#[derive(Debug, Default)]
pub struct Raise {
    pub event: String,
}

impl Raise {
    pub fn new() -> Raise {
        Raise::default()
    }
}

impl ExecutableContent for Raise {
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) -> bool {
        let event = Event::new("", &self.event, None, None, EventType::internal);
        get_global!(datamodel).enqueue_internal(event);
        true
    }

    fn get_type(&self) -> u8 {
        TYPE_RAISE
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("event", Data::String(self.event.clone()));
        d
    }
}

impl Expression {
    pub fn new() -> Expression {
        Expression::default()
    }
}

impl ExecutableContent for Expression {
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) -> bool {
        match datamodel.execute(&self.content) {
            Ok(_) => true,
            Err(msg) => {
                error!("script execution failed: {}", msg);
                datamodel.internal_error_execution();
                false
            }
        }
    }

    fn get_type(&self) -> u8 {
        TYPE_EXPRESSION
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("content", Data::String(self.content.clone()));
        d
    }
}

impl Log {
    pub fn new(label: &Option<&String>, expression: &str) -> Log {
        Log {
            label: label.map(|s| s.clone()).unwrap_or_default(),
            expression: expression.to_string(),
        }
    }
}

impl ExecutableContent for Log {
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) -> bool {
        match datamodel.execute(&self.expression) {
            Ok(msg) => {
                datamodel.log(self.label.as_str(), msg.to_string().as_str());
                true
            }
            Err(msg) => {
                error!("log expression '{}' failed: {}", self.expression, msg);
                datamodel.internal_error_execution();
                false
            }
        }
    }

    fn get_type(&self) -> u8 {
        TYPE_LOG
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("expression", Data::String(self.expression.clone()));
        d
    }
}

impl If {
    pub fn new(condition: &str) -> If {
        If {
            condition: condition.to_string(),
            content: 0,
            else_content: 0,
        }
    }
}

impl ExecutableContent for If {
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool {
        let r = datamodel
            .execute_condition(&self.condition)
            .unwrap_or_else(|e| {
                warn!("Condition {} can't be evaluated. {}", self.condition, e);
                false
            });
        if r {
            fsm.executeContentVec(datamodel, self.content)
        } else {
            fsm.executeContentVec(datamodel, self.else_content)
        }
    }

    fn get_type(&self) -> u8 {
        TYPE_IF
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("condition", Data::String(self.condition.clone()));
        d.insert("then", Data::Integer(self.content as i64));
        d.insert("else", Data::Integer(self.else_content as i64));
        d
    }
}

pub const INDEX_TEMP: &str = "__$index";

impl ForEach {
    pub fn new() -> ForEach {
        ForEach::default()
    }
}

impl ExecutableContent for ForEach {
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool {
        let idx = if self.index.is_empty() {
            INDEX_TEMP.to_string()
        } else {
            self.index.clone()
        };
        datamodel
            .execute_for_each(&self.array, &self.item, &idx, &mut |datamodel| -> bool {
                fsm.executeContentVec(datamodel, self.content)
            })
            .is_ok()
    }

    fn get_type(&self) -> u8 {
        TYPE_FOREACH
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("array", Data::String(self.array.clone()));
        d.insert("item", Data::String(self.item.clone()));
        d.insert("index", Data::String(self.index.clone()));
        d
    }
}

impl Parameter {
    pub fn new() -> Parameter {
        Parameter::default()
    }
}

impl Display for Parameter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Parameter{{name:{} expr:{} location:{}}}",
            self.name, self.expr, self.location
        )
    }
}

impl ExecutableContent for Cancel {
    /// W3c says:\
    /// The \<cancel> element is used to cancel a delayed \<send> event.\
    /// The SCXML Processor MUST NOT allow \<cancel> to affect events that were not raised in the
    /// same session. The Processor SHOULD make its best attempt to cancel all delayed events with
    /// the specified id. Note, however, that it can not be guaranteed to succeed, for example if
    /// the event has already been delivered by the time the \<cancel> tag executes.
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) -> bool {
        if let Ok(send_id) = literal_or_expr(datamodel, &self.send_id, &self.send_id_expr) {
            get_global!(datamodel)
                .delayed_send
                .remove(&send_id.to_string());
        };
        true
    }

    fn get_type(&self) -> u8 {
        TYPE_CANCEL
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("sendid", Data::String(self.send_id.clone()));
        d.insert("sendidexpr", Data::String(self.send_id_expr.clone()));
        d
    }
}

/// Implements the execution of \<send\> element.
impl ExecutableContent for SendParameters {
    /// If unable to dispatch, place "error.communication" in internal queue
    /// If target is not supported, place "error.execution" in internal queue
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool {
        let target = match literal_or_expr(datamodel, &self.target, &self.target_expr) {
            Ok(value) => value,
            Err(_) => {
                // Error -> abort
                return false;
            }
        };

        let event_name = match literal_or_expr(datamodel, &self.event, &self.event_expr) {
            Ok(value) => value,
            Err(_) => {
                // Error -> abort
                return false;
            }
        };

        let send_id = if self.name_location.is_empty() {
            if self.name.is_empty() {
                None
            } else {
                Some(self.name.clone())
            }
        } else {
            // W3c says:
            // If 'idlocation' is present, the SCXML Processor MUST generate an id when the parent
            // <send> element is evaluated and store it in this location.
            // note that the automatically generated id for <invoke> has a special format.
            // See 6.4.1 Attribute Details for details.
            // The SCXML processor MAY generate all other ids in any format, as long as they are unique.
            //
            // Implementation: we do it the same as for invoke

            let generated_id = format!(
                "{}.{}",
                &self.parent_state_name,
                PLATFORM_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
            );

            datamodel.set(self.name_location.as_str(), Data::String(generated_id.clone()));
            Some(generated_id)
        };

        let mut data_vec = Vec::new();

        let mut content = None;

        // A conformant document MUST NOT specify "namelist" or <param> with <content>.
        if self.content.is_some() {
            content = datamodel.evaluate_content(&self.content);
            if let Some(ref c) = content {
                let size = c.to_string().len();
                if size > MAX_SEND_CONTENT_SIZE {
                    error!(
                        "Send: content size {} exceeds maximum of {} bytes",
                        size, MAX_SEND_CONTENT_SIZE
                    );
                    datamodel.internal_error_execution_for_event(&send_id, &fsm.caller_invoke_id);
                    return false;
                }
            }
        } else {
            datamodel.evaluate_params(&self.params, &mut data_vec);
            for name in self.name_list.as_slice() {
                match datamodel.get_by_location(name) {
                    Err(_msg) => {
                        // Error -> Abort
                        return false;
                    }
                    Ok(value) => {
                        data_vec.push(ParamPair::new(name.as_str(), &value));
                    }
                }
            }
        }

        let delay_ms = if !self.delay_expr.is_empty() {
            match datamodel.execute(&self.delay_expr) {
                Err(_msg) => {
                    // Error -> Abort
                    return false;
                }
                Ok(delay) => parse_duration_to_milliseconds(delay.to_string().as_str()),
            }
        } else {
            self.delay_ms as i64
        };

        if delay_ms < 0 {
            // Delay is invalid -> Abort
            error!("Send: delay {} is negative", self.delay_expr);
            datamodel.internal_error_execution_for_event(&send_id, &fsm.caller_invoke_id);
            return false;
        }

        if delay_ms > 0 && target.to_string().eq(SCXML_TARGET_INTERNAL) {
            // Can't send via internal queue
            error!("Send: illegal delay for target {}", target);
            datamodel.internal_error_execution_for_event(&send_id, &fsm.caller_invoke_id);
            return false;
        }

        let type_val = match literal_or_expr(datamodel, &self.type_value, &self.type_expr) {
            Ok(val) => val,
            Err(err) => {
                error!("Failed to evaluate send type: {}", err);
                datamodel.internal_error_execution_for_event(&send_id, &fsm.caller_invoke_id);
                return false;
            }
        };

        let type_val_string = if type_val.to_string().is_empty() {
            SCXML_EVENT_PROCESSOR.to_string()
        } else {
            type_val.to_string()
        };
        let type_val_str = type_val_string.as_str();

        let event = Event {
            name: event_name.to_string(),
            etype: EventType::external,
            sendid: send_id.clone(),
            origin: None,
            origin_type: None,
            invoke_id: fsm.caller_invoke_id.clone(),
            param_values: if data_vec.is_empty() {
                None
            } else {
                Some(data_vec.clone())
            },
            content,
        };

        let result = if delay_ms > 0 {
            let iop_opt = {
                let io_processors = datamodel.get_io_processors();
                let guard = io_processors.lock().unwrap();
                guard.get(type_val_str).map(|iop| iop.get_copy())
            };
            if let Some(mut iopc) = iop_opt {
                #[cfg(feature = "Debug")]
                debug!("schedule '{}' for {}", event, delay_ms);
                let global_clone = datamodel.global_s().clone();
                let send_id_clone = send_id.clone();
                let target_str = target.to_string();
                let tg = fsm.schedule(delay_ms, move || {
                    if let Some(sid) = &send_id_clone {
                        global_clone.lock().unwrap().delayed_send.remove(sid);
                    }
                    iopc.send(&global_clone, target_str.as_str(), event.clone());
                });
                if let Some(g) = tg {
                    if let Some(sid) = &send_id {
                        datamodel
                            .global()
                            .lock()
                            .unwrap()
                            .delayed_send
                            .insert(sid.clone(), g);
                    } else {
                        g.ignore();
                    }
                };
                true
            } else {
                error!("Unknown io-processor {}", type_val_str);
                false
            }
        } else {
            #[cfg(feature = "Debug")]
            debug!("send '{}' to '{}'", event, target);
            datamodel.send(type_val_str, target.to_string().as_str(), event.clone())
        };

        if !result {
            // W3C:  If the SCXML Processor does not support the type that is specified,
            // it must place the event error.execution on the internal event queue.
            datamodel.internal_error_execution_for_event(&send_id, &fsm.caller_invoke_id);
        };
        result
    }

    fn get_type(&self) -> u8 {
        TYPE_SEND
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("name_location", Data::String(self.name_location.clone()));
        d.insert("name", Data::String(self.name.clone()));
        d.insert(
            "parent_state_name",
            Data::String(self.parent_state_name.clone()),
        );
        d.insert("event", Data::String(self.event.clone()));
        d.insert("event_expr", Data::String(self.event_expr.clone()));
        d.insert("target", Data::String(self.target.clone()));
        d.insert("target_expr", Data::String(self.target_expr.clone()));
        d.insert("type_value", Data::String(self.type_value.clone()));
        d.insert("type_expr", Data::String(self.type_expr.clone()));
        d.insert("delay_ms", Data::Integer(self.delay_ms as i64));
        d.insert("delay_expr", Data::String(self.delay_expr.clone()));
        d.insert("name_list", Data::String(vec_to_string(&self.name_list)));
        d.insert(
            "params",
            match &self.params {
                Some(s) => Data::String(vec_to_string(s)),
                None => Data::None(),
            },
        );
        d.insert(
            "content",
            match &self.content {
                Some(s) => Data::String(format!("{:?}", s)),
                None => Data::None(),
            },
        );
        d
    }
}

#[cfg(test)]
mod tests {
    use crate::executable_content::parse_duration_to_milliseconds;

    #[test]
    fn delay_parse() {
        assert_eq!(parse_duration_to_milliseconds("6.7s"), 6700);
        assert_eq!(parse_duration_to_milliseconds("0.5d"), 12 * 60 * 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("1m"), 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("0.001s"), 1);
        assert_eq!(parse_duration_to_milliseconds("6.7S"), 6700);
        assert_eq!(parse_duration_to_milliseconds("0.5D"), 12 * 60 * 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("1M"), 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("0.001S"), 1);

        assert_eq!(parse_duration_to_milliseconds("x1S"), -1);
        assert_eq!(parse_duration_to_milliseconds("1Sx"), -1);
    }
}

/// Parses a W3C `<send delay="...">`/`<cancel>` duration, e.g. "6.7s" or "0.5d".
/// Unit must be one of "ms", "s", "m", "h", "d" (case-insensitive). Returns -1 on malformed input.
pub fn parse_duration_to_milliseconds(d: &str) -> i64 {
    if d.is_empty() {
        return 0;
    }
    let d = d.trim();
    let split_at = d
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(d.len());
    let (number_part, unit_part) = d.split_at(split_at);
    if number_part.is_empty() {
        return -1;
    }
    let Ok(mut v) = number_part.parse::<f64>() else {
        return -1;
    };
    match unit_part.to_ascii_lowercase().as_str() {
        "d" => v *= 24.0 * 60.0 * 60.0 * 1000.0,
        "h" => v *= 60.0 * 60.0 * 1000.0,
        "m" => v *= 60_000.0,
        "s" => v *= 1000.0,
        "ms" => {}
        _ => return -1,
    }
    v.round() as i64
}
