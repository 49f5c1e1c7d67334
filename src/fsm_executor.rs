//! Helper module to maintain FSM sessions.\

extern crate core;

use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::ops::Deref;
use std::path::PathBuf;
#[cfg(test)]
use std::println as info;
use std::sync::mpsc::{SendError, Sender};
use std::sync::{Arc, Mutex};

#[cfg(not(test))]
use log::info;

use crate::actions::ActionWrapper;
#[cfg(feature = "BasicHttpEventIOProcessor")]
use crate::event_io_processor::http_event_io_processor::BasicHTTPEventIOProcessor;
use crate::datamodel::Data;
use crate::event_io_processor::scxml_event_io_processor::ScxmlEventIOProcessor;
use crate::event_io_processor::EventIOProcessor;
use crate::fsm::{ChildSession, Event, ExecutorProxy, Fsm, InvokeId, ScxmlSession, SessionId};
#[cfg(feature = "Trace")]
use crate::tracer::TraceMode;
use crate::{fsm, scxml_reader, ArgOption};

/// Maps a processor's declared types (`get_types()`) to the shared, keyed lookup table that
/// `Datamodel::send`/`get_io_processors` uses to dispatch `<send type="...">`.
fn processors_by_type(
    processors: &[Box<dyn EventIOProcessor>],
) -> HashMap<String, Box<dyn EventIOProcessor>> {
    let mut map = HashMap::new();
    for p in processors {
        for t in p.get_types() {
            map.insert(t.to_string(), p.get_copy());
        }
    }
    map
}

pub struct ExecuteState {
    pub processors: Vec<Box<dyn EventIOProcessor>>,
    pub sessions: HashMap<SessionId, ScxmlSession>,
}

impl ExecuteState {
    pub fn new() -> ExecuteState {
        let e = ExecuteState {
            processors: Vec::new(),
            sessions: HashMap::new(),
        };
        e
    }
}

/// Shared handle to an [`ExecuteState`], managed as Rocket typed state by
/// [`BasicHTTPEventIOProcessor`] so request handlers can look up sessions by id.
#[derive(Clone)]
pub struct ExecutorStateArc {
    pub arc: Arc<Mutex<ExecuteState>>,
}

impl ExecutorStateArc {
    pub fn new(arc: Arc<Mutex<ExecuteState>>) -> ExecutorStateArc {
        ExecutorStateArc { arc }
    }
}

impl Deref for ExecutorStateArc {
    type Target = Arc<Mutex<ExecuteState>>;

    fn deref(&self) -> &Self::Target {
        &self.arc
    }
}

/// Executed FSM in separate threads.
/// This class maintains IO Processors used by the FSMs and running sessions.
#[derive(Clone)]
pub struct FsmExecutor {
    pub state: Arc<Mutex<ExecuteState>>,
    /// Type-keyed lookup shared with every session's datamodel (`Datamodel::get_io_processors`),
    /// built once and reused so that `add_fsm` registrations from all sessions accumulate into
    /// the same processor instances `shutdown` later broadcasts through.
    pub io_processors: Arc<Mutex<HashMap<String, Box<dyn EventIOProcessor>>>>,
    pub include_paths: Vec<PathBuf>,
}

pub static INCLUDE_PATH_ARGUMENT_OPTION: ArgOption = ArgOption {
    name: "includePaths",
    with_value: true,
    required: false,
};

pub fn include_path_from_arguments(
    named_arguments: &HashMap<&'static str, String>,
) -> Vec<PathBuf> {
    let mut include_paths = Vec::new();
    match named_arguments.get(INCLUDE_PATH_ARGUMENT_OPTION.name) {
        None => {}
        Some(paths) => {
            for pa in env::split_paths(&paths) {
                include_paths.push(pa.to_owned());
            }
        }
    }
    include_paths
}

impl FsmExecutor {
    pub fn add_processor(&mut self, processor: Box<dyn EventIOProcessor>) {
        let mut state = self.state.lock().unwrap();
        state.processors.push(processor);
        *self.io_processors.lock().unwrap() = processors_by_type(&state.processors);
    }

    pub fn new_without_io_processor() -> FsmExecutor {
        let mut e = FsmExecutor {
            state: Arc::new(Mutex::new(ExecuteState::new())),
            io_processors: Arc::new(Mutex::new(HashMap::new())),
            include_paths: Vec::new(),
        };
        e.add_processor(Box::new(ScxmlEventIOProcessor::new()));
        e
    }

    pub async fn new_with_io_processor() -> FsmExecutor {
        let mut e = FsmExecutor {
            state: Arc::new(Mutex::new(ExecuteState::new())),
            io_processors: Arc::new(Mutex::new(HashMap::new())),
            include_paths: Vec::new(),
        };
        #[cfg(feature = "BasicHttpEventIOProcessor")]
        {
            let w = Box::new(
                BasicHTTPEventIOProcessor::new(
                    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                    "localhost",
                    5555,
                    ExecutorStateArc::new(e.state.clone()),
                )
                .await,
            );
            e.add_processor(w);
        }
        e.add_processor(Box::new(ScxmlEventIOProcessor::new()));
        e
    }

    pub fn set_include_paths_from_arguments(
        &mut self,
        named_arguments: &HashMap<&'static str, String>,
    ) {
        self.set_include_paths(&include_path_from_arguments(named_arguments));
    }

    pub fn set_include_paths(&mut self, include_path: &Vec<PathBuf>) {
        for p in include_path {
            self.include_paths.push(p.clone());
        }
    }

    /// Shutdown of all FSMs and IO-Processors.
    ///
    /// `state.processors` holds the prototype instances `add_processor` was given; the ones
    /// sessions actually registered with (via `add_fsm`) are the `get_copy()`s kept in
    /// `io_processors`, so that's what needs to see the shutdown broadcast.
    pub fn shutdown(&mut self) {
        let mut guard = self.state.lock().unwrap();
        while !guard.processors.is_empty() {
            guard.processors.pop();
        }
        drop(guard);
        let mut io_processors = self.io_processors.lock().unwrap();
        for pp in io_processors.values_mut() {
            pp.shutdown();
        }
        io_processors.clear();
    }

    /// Loads and starts the specified FSM.
    pub fn execute(
        &mut self,
        uri: &str,
        actions: ActionWrapper,
        #[cfg(feature = "Trace")] trace: TraceMode,
    ) -> Result<ScxmlSession, String> {
        self.execute_with_data(
            uri,
            &HashMap::new(),
            None,
            &"".to_string(),
            actions,
            #[cfg(feature = "Trace")]
            trace,
        )
    }

    /// Loads and starts the specified FSM with some data set.
    pub fn execute_with_data(
        &mut self,
        uri: &str,
        data: &HashMap<String, Data>,
        parent: Option<SessionId>,
        invoke_id: &InvokeId,
        actions: ActionWrapper,
        #[cfg(feature = "Trace")] trace: TraceMode,
    ) -> Result<ScxmlSession, String> {
        info!("Loading FSM from {}", uri);

        // Use reader to parse the scxml file:
        let sm = scxml_reader::parse_from_uri(uri.to_string(), &self.include_paths);
        match sm {
            Ok(mut fsm) => {
                #[cfg(feature = "Trace")]
                fsm.tracer.enable_trace(trace);
                fsm.caller_invoke_id = Some(invoke_id.clone());
                fsm.parent_session_id = parent;
                fsm.custom_actions = actions;
                let session = fsm::start_fsm_with_data(
                    fsm,
                    Box::new(self.clone()),
                    data,
                    self.io_processors.clone(),
                );
                self.register_session(&session);
                Ok(session)
            }
            Err(message) => {
                return Err(message);
            }
        }
    }

    /// Loads and starts the specified FSM with some data set.
    pub fn execute_with_data_from_xml(
        &mut self,
        xml: &String,
        data: &HashMap<String, Data>,
        parent: Option<SessionId>,
        invoke_id: &InvokeId,
        actions: ActionWrapper,
        #[cfg(feature = "Trace")] trace: TraceMode,
    ) -> Result<ScxmlSession, String> {
        info!("Loading FSM from XML");

        // Use reader to parse the XML:
        let sm = scxml_reader::parse_from_xml_with_includes(xml.clone(), &self.include_paths);
        match sm {
            Ok(mut fsm) => {
                #[cfg(feature = "Trace")]
                fsm.tracer.enable_trace(trace);
                fsm.caller_invoke_id = Some(invoke_id.clone());
                fsm.parent_session_id = parent;
                fsm.custom_actions = actions;
                let session = fsm::start_fsm_with_data(
                    fsm,
                    Box::new(self.clone()),
                    data,
                    self.io_processors.clone(),
                );
                self.register_session(&session);
                Ok(session)
            }
            Err(message) => {
                return Err(message);
            }
        }
    }

    /// Keeps a lightweight lookup copy (`thread: None`) of a freshly started session in
    /// `state.sessions`, so it can be found by id (e.g. by the HTTP event processor or by
    /// `send_to_session`) while the caller retains the full session (with its joinable thread).
    fn register_session(&self, session: &ScxmlSession) {
        let lookup = ScxmlSession {
            session_id: session.session_id,
            sender: session.sender.clone(),
            global_data: session.global_data.clone(),
            thread: None,
        };
        self.state
            .lock()
            .unwrap()
            .sessions
            .insert(lookup.session_id, lookup);
    }

    pub fn remove_session(&mut self, session_id: SessionId) {
        self.state.lock().unwrap().sessions.remove(&session_id);
    }

    pub fn get_session_sender(&self, session_id: SessionId) -> Option<Sender<Box<Event>>> {
        Some(
            self.state
                .lock()
                .unwrap()
                .sessions
                .get(&session_id)?
                .sender
                .clone(),
        )
    }

    pub fn send_to_session(
        &self,
        session_id: SessionId,
        event: Event,
    ) -> Result<(), SendError<Box<Event>>> {
        match self.get_session_sender(session_id) {
            None => Err(SendError(Box::new(event))),
            Some(sender) => sender.send(Box::new(event)),
        }
    }
}

impl ExecutorProxy for FsmExecutor {
    fn send_to_session(&self, session_id: SessionId, event: Event) -> Result<(), String> {
        FsmExecutor::send_to_session(self, session_id, event)
            .map_err(|e| format!("session #{} is gone: {}", session_id, e))
    }

    fn start_child(
        &self,
        mut fsm: Box<Fsm>,
        data: HashMap<String, Data>,
        parent: SessionId,
        invoke_id: InvokeId,
    ) -> Result<ChildSession, String> {
        fsm.parent_session_id = Some(parent);
        fsm.caller_invoke_id = Some(invoke_id);
        let session = fsm::start_fsm_with_data(
            fsm,
            Box::new(self.clone()),
            &data,
            self.io_processors.clone(),
        );
        self.register_session(&session);
        Ok(ChildSession {
            session_id: session.session_id,
            sender: session.sender.clone(),
            global_data: session.global_data.clone(),
        })
    }

    fn remove_session(&self, session_id: SessionId) {
        self.state.lock().unwrap().sessions.remove(&session_id);
    }

    fn get_copy(&self) -> Box<dyn ExecutorProxy> {
        Box::new(self.clone())
    }
}
