//! ECMAScript datamodel, backed by `boa_engine`.\
//! One `Context` per session; all calls happen on that session's own worker thread, so the
//! engine itself never needs to be `Sync`.

use boa_engine::object::builtins::JsArray;
use boa_engine::object::FunctionObjectBuilder;
use boa_engine::property::{Attribute, PropertyDescriptorBuilder};
use boa_engine::{js_string, Context, JsNativeError, JsValue, NativeFunction, Source};

use crate::datamodel::{
    Data, Datamodel, GlobalDataArc, EVENT_VARIABLE_FIELD_DATA, EVENT_VARIABLE_FIELD_INVOKEID,
    EVENT_VARIABLE_FIELD_NAME, EVENT_VARIABLE_FIELD_ORIGIN, EVENT_VARIABLE_FIELD_ORIGIN_TYPE,
    EVENT_VARIABLE_FIELD_SENDID, EVENT_VARIABLE_FIELD_TYPE, EVENT_VARIABLE_NAME,
    SESSION_ID_VARIABLE_NAME, SESSION_NAME_VARIABLE_NAME,
};
use crate::fsm::{Event, Fsm, StateId, ECMA_SCRIPT};

pub const ECMA_STRICT_ARGUMENT: &str = "ecma-strict";

fn data_to_js(ctx: &mut Context, v: &Data) -> JsValue {
    match v {
        Data::None() => JsValue::null(),
        Data::String(s) => {
            if let Ok(parsed) = ctx.eval(Source::from_bytes(s.as_bytes())) {
                parsed
            } else {
                JsValue::from(js_string!(s.clone()))
            }
        }
        Data::Integer(i) => JsValue::from(*i),
        Data::Double(d) => JsValue::from(*d),
        Data::Boolean(b) => JsValue::from(*b),
        Data::Array(items) => {
            let arr = JsArray::new(ctx);
            for item in items {
                let jv = data_to_js(ctx, item);
                let _ = arr.push(jv, ctx);
            }
            arr.into()
        }
        Data::Error(e) => JsValue::from(js_string!(e.clone())),
    }
}

fn js_to_data(ctx: &mut Context, v: &JsValue) -> Data {
    if v.is_null_or_undefined() {
        Data::None()
    } else if let Some(b) = v.as_boolean() {
        Data::Boolean(b)
    } else if v.is_number() {
        let n = v.as_number().unwrap_or(0.0);
        if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
            Data::Integer(n as i64)
        } else {
            Data::Double(n)
        }
    } else {
        match v.to_string(ctx) {
            Ok(s) => Data::String(s.to_std_string_escaped()),
            Err(_) => Data::None(),
        }
    }
}

/// ECMAScript's `In(id)` and `In('id')` predicate, queried against the session's configuration.
/// Closed over the `GlobalDataArc` rather than a raw state-name table so the lookup always sees
/// the live configuration, not a snapshot.
fn make_in_function(global: GlobalDataArc) -> NativeFunction {
    unsafe {
        NativeFunction::from_closure(move |_this, args, ctx| {
            let id = args
                .first()
                .map(|v| v.to_string(ctx))
                .transpose()
                .unwrap_or_default()
                .map(|s| s.to_std_string_escaped())
                .unwrap_or_default();
            let result = global.lock().unwrap().is_in_state(&id);
            Ok(JsValue::from(result))
        })
    }
}

fn make_log_function() -> NativeFunction {
    unsafe {
        NativeFunction::from_closure(|_this, args, ctx| {
            let msg = args
                .iter()
                .map(|a| a.to_string(ctx).map(|s| s.to_std_string_escaped()).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(" ");
            log::info!("[script] {}", msg);
            Ok(JsValue::undefined())
        })
    }
}

pub struct ECMAScriptDatamodel {
    global: GlobalDataArc,
    context: Context,
}

impl ECMAScriptDatamodel {
    pub fn new(global: GlobalDataArc) -> ECMAScriptDatamodel {
        let mut context = Context::default();

        let in_fn = FunctionObjectBuilder::new(context.realm(), make_in_function(global.clone()))
            .name("In")
            .length(1)
            .build();
        context
            .register_global_property(js_string!("In"), in_fn, Attribute::all())
            .expect("register In()");

        let log_fn = FunctionObjectBuilder::new(context.realm(), make_log_function())
            .name("log")
            .length(0)
            .build();
        context
            .register_global_property(js_string!("log"), log_fn, Attribute::all())
            .expect("register log()");

        ECMAScriptDatamodel { global, context }
    }

    fn define_readonly(&mut self, name: &str, value: JsValue) {
        let _ = self.context.global_object().define_property_or_throw(
            js_string!(name.to_string()),
            PropertyDescriptorBuilder::new()
                .value(value)
                .writable(false)
                .enumerable(true)
                .configurable(true)
                .build(),
            &mut self.context,
        );
    }

    /// Like [`Self::define_readonly`], but backed by an accessor instead of a data property: a
    /// plain non-writable data property is a silent no-op under assignment in non-strict script,
    /// which would leave `error.execution` unqueued on `_event = ...`. The setter here always
    /// throws (satisfying "attempted writes throw in script") and queues `error.execution` on
    /// the owning session before doing so.
    fn define_readonly_throwing(&mut self, name: &str, value: JsValue) {
        let getter = FunctionObjectBuilder::new(
            self.context.realm(),
            unsafe { NativeFunction::from_closure(move |_this, _args, _ctx| Ok(value.clone())) },
        )
        .name(format!("get {}", name))
        .length(0)
        .build();

        let global = self.global.clone();
        let name_owned = name.to_string();
        let setter = FunctionObjectBuilder::new(
            self.context.realm(),
            unsafe {
                NativeFunction::from_closure(move |_this, _args, _ctx| {
                    global
                        .lock()
                        .unwrap()
                        .enqueue_internal(Event::error_execution(&None, &None));
                    Err(JsNativeError::typ()
                        .with_message(format!("'{}' is read-only", name_owned))
                        .into())
                })
            },
        )
        .name(format!("set {}", name))
        .length(1)
        .build();

        let _ = self.context.global_object().define_property_or_throw(
            js_string!(name.to_string()),
            PropertyDescriptorBuilder::new()
                .get(getter)
                .set(setter)
                .enumerable(true)
                .configurable(true)
                .build(),
            &mut self.context,
        );
    }
}

impl Datamodel for ECMAScriptDatamodel {
    fn global(&self) -> &GlobalDataArc {
        &self.global
    }

    fn get_name(&self) -> &'static str {
        ECMA_SCRIPT
    }

    fn implement_mandatory_functionality(&mut self, fsm: &mut Fsm) {
        let session_id = self.global.lock().unwrap().session_id;
        self.define_readonly(SESSION_ID_VARIABLE_NAME, JsValue::from(js_string!(session_id.to_string())));
        self.define_readonly(SESSION_NAME_VARIABLE_NAME, JsValue::from(js_string!(fsm.name.clone())));
    }

    fn initializeDataModel(&mut self, fsm: &mut Fsm, state: StateId) {
        let entries: Vec<(String, crate::fsm::Data)> = match fsm.get_state_by_id(state) {
            Some(s) => s
                .data
                .iter_snapshot()
                .into_iter()
                .collect(),
            None => Vec::new(),
        };
        for (name, value) in entries {
            self.set(name.as_str(), value);
        }
    }

    fn initialize_read_only(&mut self, name: &str, value: &str) {
        self.define_readonly(name, JsValue::from(js_string!(value.to_string())));
    }

    fn set(&mut self, name: &str, value: Data) {
        let jv = data_to_js(&mut self.context, &value);
        let _ = self
            .context
            .global_object()
            .set(js_string!(name.to_string()), jv, false, &mut self.context);
    }

    /// #W3C says:
    /// the Platform sets the system variable '_event' before processing each event; setting
    /// `_event` from script MUST raise error.execution (enforced by the read-only property
    /// descriptor below).
    fn set_event(&mut self, event: &Event) {
        let obj = boa_engine::object::ObjectInitializer::new(&mut self.context)
            .property(js_string!(EVENT_VARIABLE_FIELD_NAME), js_string!(event.name.clone()), Attribute::all())
            .property(
                js_string!(EVENT_VARIABLE_FIELD_TYPE),
                js_string!(event.etype.to_string()),
                Attribute::all(),
            )
            .property(
                js_string!(EVENT_VARIABLE_FIELD_SENDID),
                event
                    .sendid
                    .clone()
                    .map(|s| JsValue::from(js_string!(s)))
                    .unwrap_or_else(JsValue::null),
                Attribute::all(),
            )
            .property(
                js_string!(EVENT_VARIABLE_FIELD_ORIGIN),
                event
                    .origin
                    .clone()
                    .map(|s| JsValue::from(js_string!(s)))
                    .unwrap_or_else(JsValue::null),
                Attribute::all(),
            )
            .property(
                js_string!(EVENT_VARIABLE_FIELD_ORIGIN_TYPE),
                event
                    .origin_type
                    .clone()
                    .map(|s| JsValue::from(js_string!(s)))
                    .unwrap_or_else(JsValue::null),
                Attribute::all(),
            )
            .property(
                js_string!(EVENT_VARIABLE_FIELD_INVOKEID),
                event
                    .invoke_id
                    .clone()
                    .map(|s| JsValue::from(js_string!(s)))
                    .unwrap_or_else(JsValue::null),
                Attribute::all(),
            )
            .build();

        if let Some(content) = &event.content {
            let data_js = data_to_js(&mut self.context, content);
            let _ = obj.set(js_string!(EVENT_VARIABLE_FIELD_DATA), data_js, false, &mut self.context);
        } else if let Some(params) = &event.param_values {
            let data_obj = boa_engine::object::ObjectInitializer::new(&mut self.context).build();
            for p in params {
                let jv = data_to_js(&mut self.context, &p.value);
                let _ = data_obj.set(js_string!(p.name.clone()), jv, false, &mut self.context);
            }
            let _ = obj.set(
                js_string!(EVENT_VARIABLE_FIELD_DATA),
                JsValue::from(data_obj),
                false,
                &mut self.context,
            );
        }

        self.define_readonly_throwing(EVENT_VARIABLE_NAME, JsValue::from(obj));
    }

    fn assign(&mut self, location: &str, expr: &str) -> Result<(), String> {
        let script = format!("{} = ({});", location, expr);
        self.context
            .eval(Source::from_bytes(script.as_bytes()))
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn get_by_location(&mut self, location: &str) -> Result<Data, String> {
        self.execute(location)
    }

    fn execute(&mut self, script: &str) -> Result<Data, String> {
        match self.context.eval(Source::from_bytes(script.as_bytes())) {
            Ok(v) => Ok(js_to_data(&mut self.context, &v)),
            Err(e) => Err(e.to_string()),
        }
    }

    fn execute_condition(&mut self, cond: &str) -> Result<bool, String> {
        match self.context.eval(Source::from_bytes(cond.as_bytes())) {
            Ok(v) => Ok(v.to_boolean()),
            Err(e) => Err(e.to_string()),
        }
    }

    fn execute_for_each(
        &mut self,
        array_expr: &str,
        item: &str,
        index: &str,
        body: &mut dyn FnMut(&mut dyn Datamodel) -> bool,
    ) -> Result<(), String> {
        let value = self
            .context
            .eval(Source::from_bytes(array_expr.as_bytes()))
            .map_err(|e| e.to_string())?;
        let array = JsArray::from_object(
            value
                .as_object()
                .cloned()
                .ok_or_else(|| "foreach array expression did not evaluate to an object".to_string())?,
        )
        .map_err(|_| "foreach array expression is not an array".to_string())?;
        let len = array.length(&mut self.context).map_err(|e| e.to_string())?;
        for i in 0..len {
            let element = array
                .get(i, &mut self.context)
                .map_err(|e| e.to_string())?;
            self.set(item, js_to_data(&mut self.context, &element));
            if !index.is_empty() {
                self.set(index, Data::Integer(i as i64));
            }
            if !body(self) {
                return Err("foreach body raised an error".to_string());
            }
        }
        Ok(())
    }

    fn log(&mut self, label: &str, msg: &str) {
        if label.is_empty() {
            log::info!("{}", msg);
        } else {
            log::info!("{}: {}", label, msg);
        }
    }

    fn clear(&mut self) {
        self.context = Context::default();
    }
}
