#![allow(non_snake_case)]
//! The Finite State Machine (FSM) core.\
//! According to W3C Recommendations, reading State Chart XML (SCXML).\
//! See [W3C:SCXML - The Algorithm for SCXML Interpretation](https://www.w3.org/TR/scxml/#AlgorithmforSCXMLInterpretation)

extern crate core;

use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Display, Formatter};
use std::hash::Hash;
use std::slice::Iter;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;

use crate::common::{debug as trace_debug, error};
use crate::datamodel::{create_datamodel, Data, Datamodel, GlobalDataArc, GlobalDataLock};
use crate::event_io_processor::EventIOProcessor;
use crate::tracer::{create_tracer, Tracer};

pub const ECMA_SCRIPT: &str = "ECMAScript";
pub const ECMA_SCRIPT_LC: &str = "ecmascript";

pub const NULL_DATAMODEL: &str = "NULL";
pub const NULL_DATAMODEL_LC: &str = "null";

/// Internal event that shuts the session's macrostep loop down. Delivered through the external
/// queue like any other event so it is observed in order relative to events already queued.
pub const EVENT_CANCEL_SESSION: &str = "$$cancel.session";

/// Generates session-unique ids: auto send-ids, auto invoke-ids, auto platform event ids.
pub static PLATFORM_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

static SESSION_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Generates document-global ids for transitions and executable-content regions while reading
/// a document (the reader's own doc-id counters track insertion order separately).
pub static ID_COUNTER: AtomicU32 = AtomicU32::new(1);

pub fn next_session_id() -> SessionId {
    SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

pub fn entryOrder(s1: &StateId, s2: &StateId) -> std::cmp::Ordering {
    s1.cmp(s2)
}

pub fn documentOrder(s1: &StateId, s2: &StateId) -> std::cmp::Ordering {
    s1.cmp(s2)
}

pub fn vec_to_string<T: Display>(v: &[T]) -> String {
    v.iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

////////////////////////////////////////////////////////////////////////////////
// ## General purpose data types.
// Structs and methods are designed to match the signatures used by the W3C pseudo-code,
// so that the algorithm below reads close to the specification text.
////////////////////////////////////////////////////////////////////////////////

/// ## General Purpose List type
#[derive(Debug, Clone)]
pub struct List<T: Clone> {
    data: Vec<T>,
}

impl<T: Clone> Default for List<T> {
    fn default() -> Self {
        List::new()
    }
}

impl<T: Clone> List<T> {
    pub fn new() -> List<T> {
        List {
            data: Default::default(),
        }
    }

    pub fn from_vec(data: Vec<T>) -> List<T> {
        List { data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn isEmpty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn push(&mut self, t: T) {
        self.data.push(t);
    }

    /// #W3C says: Returns the head of the list
    pub fn head(&self) -> &T {
        self.data.first().unwrap()
    }

    /// #W3C says: Returns the tail of the list (i.e., the rest of the list once the head is removed)
    pub fn tail(&self) -> List<T> {
        let mut t = List {
            data: self.data.clone(),
        };
        t.data.remove(0);
        t
    }

    /// #W3C says: Returns the list appended with l
    pub fn append(&self, l: &List<T>) -> List<T> {
        let mut t = List {
            data: self.data.clone(),
        };
        for i in l.data.iter() {
            t.data.push((*i).clone());
        }
        t
    }

    pub fn appendSet(&self, l: &OrderedSet<T>) -> List<T>
    where
        T: PartialEq,
    {
        let mut t = List {
            data: self.data.clone(),
        };
        for i in l.data.iter() {
            t.data.push((*i).clone());
        }
        t
    }

    /// #W3C says:
    /// Returns the list of elements that satisfy the predicate f
    /// #Actual implementation:
    /// Can't name the function "filter" because this gets in conflict with the pre-defined "filter"
    /// introduced by the Iterator implementation.
    pub fn filterBy(&self, f: &dyn Fn(&T) -> bool) -> List<T> {
        let mut t = List::new();
        for i in self.data.iter() {
            if f(i) {
                t.data.push((*i).clone());
            }
        }
        t
    }

    pub fn some(&self, f: &dyn Fn(&T) -> bool) -> bool {
        self.data.iter().any(f)
    }

    pub fn every(&self, f: &dyn Fn(&T) -> bool) -> bool {
        self.data.iter().all(f)
    }

    pub fn sort<F>(&self, compare: &F) -> List<T>
    where
        F: Fn(&T, &T) -> std::cmp::Ordering + ?Sized,
    {
        let mut t = List {
            data: self.data.clone(),
        };
        t.data.sort_by(compare);
        t
    }

    pub fn iterator(&self) -> Iter<'_, T> {
        self.data.iter()
    }
}

/// Set datatype used by the algorithm.
/// #W3C says:
/// Note that the algorithm assumes a Lisp-like semantics in which the empty Set null is equivalent
/// to boolean 'false' and all other entities are equivalent to 'true'.
#[derive(Debug, Clone)]
pub struct OrderedSet<T> {
    data: Vec<T>,
}

impl<T: Clone + PartialEq> Default for OrderedSet<T> {
    fn default() -> Self {
        OrderedSet::new()
    }
}

impl<T: Clone + PartialEq> OrderedSet<T> {
    pub fn new() -> OrderedSet<T> {
        OrderedSet {
            data: Default::default(),
        }
    }

    pub fn from_vec(data: Vec<T>) -> OrderedSet<T> {
        OrderedSet { data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// #W3C says: Adds e to the set if it is not already a member
    pub fn add(&mut self, e: T) {
        if !self.isMember(&e) {
            self.data.push(e);
        }
    }

    /// #W3C says: Deletes e from the set
    pub fn delete(&mut self, e: &T) {
        self.data.retain(|x| *x != *e);
    }

    /// #W3C says: Adds all members of s that are not already members of the set
    pub fn union(&mut self, s: &OrderedSet<T>) {
        for si in &s.data {
            if !self.isMember(si) {
                self.add(si.clone());
            }
        }
    }

    pub fn isMember(&self, e: &T) -> bool {
        self.data.contains(e)
    }

    pub fn some(&self, f: &dyn Fn(&T) -> bool) -> bool {
        self.data.iter().any(f)
    }

    pub fn every(&self, f: &dyn Fn(&T) -> bool) -> bool {
        self.data.iter().all(f)
    }

    /// #W3C says: Returns true if this set and set s have at least one member in common
    pub fn hasIntersection(&self, s: &OrderedSet<T>) -> bool {
        self.data.iter().any(|si| s.isMember(si))
    }

    pub fn isEmpty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// #W3C says: Converts the set to a list that reflects the order in which elements were
    /// originally added.
    pub fn toList(&self) -> List<T> {
        List::from_vec(self.data.clone())
    }

    pub fn iterator(&self) -> Iter<'_, T> {
        self.data.iter()
    }
}

#[derive(Debug)]
pub struct Queue<T> {
    data: VecDeque<T>,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Queue::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Queue<T> {
        Queue {
            data: VecDeque::new(),
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// #W3C says: Puts e last in the queue
    pub fn enqueue(&mut self, e: T) {
        self.data.push_back(e);
    }

    /// #W3C says: Removes and returns first element in queue
    pub fn dequeue(&mut self) -> T {
        self.data.pop_front().unwrap()
    }

    pub fn isEmpty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A FIFO queue whose `dequeue` blocks the calling thread until an element is available.
/// Used for the external queue, which a session's macrostep loop blocks on between
/// macrosteps while other threads (other sessions, I/O processors, the scheduler) feed it.
#[derive(Debug)]
pub struct BlockingQueue<T> {
    pub sender: Sender<T>,
    receiver: Arc<Mutex<Receiver<T>>>,
}

impl<T> Clone for BlockingQueue<T> {
    fn clone(&self) -> Self {
        BlockingQueue {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
        }
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        BlockingQueue::new()
    }
}

impl<T> BlockingQueue<T> {
    pub fn new() -> BlockingQueue<T> {
        let (sender, receiver) = channel();
        BlockingQueue {
            receiver: Arc::new(Mutex::new(receiver)),
            sender,
        }
    }

    /// #W3C says: Puts e last in the queue
    pub fn enqueue(&self, e: T) {
        let _ = self.sender.send(e);
    }

    /// #W3C says: Removes and returns first element in queue, blocks if queue is empty
    pub fn dequeue(&self) -> T {
        self.receiver.lock().unwrap().recv().unwrap()
    }
}

/// #W3C says:
/// table\[foo\] returns the value associated with foo. table\[foo\] = bar sets the value
/// associated with foo to be bar.
#[derive(Debug, Clone)]
pub struct HashTable<K, T> {
    data: HashMap<K, T>,
}

impl<K: Eq + Hash + Clone, T: Clone> Default for HashTable<K, T> {
    fn default() -> Self {
        HashTable::new()
    }
}

impl<K: Eq + Hash + Clone, T: Clone> HashTable<K, T> {
    pub fn new() -> HashTable<K, T> {
        HashTable {
            data: HashMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn put(&mut self, k: K, v: &T) {
        self.data.insert(k, v.clone());
    }

    pub fn has(&self, k: &K) -> bool {
        self.data.contains_key(k)
    }

    pub fn get(&self, k: &K) -> &T {
        self.data.get(k).unwrap()
    }
}

////////////////////////////////////////////////////////////////////////////////
// ## FSM document model (the parsed, static shape of one SCXML document)
////////////////////////////////////////////////////////////////////////////////

pub type Name = String;
pub type StateId = u32;
pub type TransitionId = u32;
/// 0 means "no content". Real content is indexed 1-based into `Fsm::executable_content`.
pub type ExecutableContentId = u32;
pub type SessionId = u32;
pub type InvokeId = String;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum BindingType {
    Early,
    Late,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum EventType {
    platform,
    internal,
    external,
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// W3C `<donedata>`: data attached to the `done.state.*` event generated on entering a final state.
#[derive(Debug, Clone, Default)]
pub struct CommonContent {
    pub content: Option<String>,
    pub content_expr: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Parameter {
    pub name: String,
    pub expr: String,
    pub location: String,
}

impl Display for Parameter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Parameter{{name:{} expr:{} location:{}}}",
            self.name, self.expr, self.location
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct DoneData {
    pub content: Option<CommonContent>,
    pub params: Option<Vec<Parameter>>,
}

impl DoneData {
    pub fn new() -> DoneData {
        DoneData::default()
    }
}

#[derive(Debug, Clone)]
pub struct ParamPair {
    pub name: String,
    pub value: Data,
}

impl ParamPair {
    pub fn new(name: &str, value: &Data) -> ParamPair {
        ParamPair {
            name: name.to_string(),
            value: value.clone(),
        }
    }

    pub fn new_moved(name: String, value: Data) -> ParamPair {
        ParamPair { name, value }
    }
}

impl Display for ParamPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// A runtime SCXML event. Once placed on a queue it is considered immutable (I3).
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub etype: EventType,
    pub sendid: Option<String>,
    pub origin: Option<String>,
    pub origin_type: Option<String>,
    pub invoke_id: Option<InvokeId>,
    pub param_values: Option<Vec<ParamPair>>,
    pub content: Option<Data>,
}

pub const ERROR_EXECUTION: &str = "error.execution";
pub const ERROR_COMMUNICATION: &str = "error.communication";
pub const ERROR_PLATFORM: &str = "error.platform";
pub const DONE_STATE_PREFIX: &str = "done.state.";
pub const DONE_INVOKE_PREFIX: &str = "done.invoke.";

impl Event {
    pub fn new(
        sendid: &str,
        name: &str,
        origin: Option<String>,
        invoke_id: Option<InvokeId>,
        etype: EventType,
    ) -> Event {
        Event {
            name: name.to_string(),
            etype,
            sendid: if sendid.is_empty() {
                None
            } else {
                Some(sendid.to_string())
            },
            origin,
            origin_type: None,
            invoke_id,
            param_values: None,
            content: None,
        }
    }

    pub fn new_simple(name: &str) -> Box<Event> {
        Box::new(Event::new("", name, None, None, EventType::platform))
    }

    pub fn new_external() -> Event {
        Event::new("", "", None, None, EventType::external)
    }

    pub fn done_state(state: StateId, data: &Option<DoneData>) -> Event {
        let mut e = Event::new(
            "",
            format!("{}{}", DONE_STATE_PREFIX, state).as_str(),
            None,
            None,
            EventType::internal,
        );
        if let Some(dd) = data {
            e.content = dd
                .content
                .as_ref()
                .and_then(|c| c.content.clone())
                .map(Data::String);
        }
        e
    }

    pub fn done_invoke(invoke_id: &InvokeId) -> Event {
        Event::new(
            "",
            format!("{}{}", DONE_INVOKE_PREFIX, invoke_id).as_str(),
            None,
            Some(invoke_id.clone()),
            EventType::internal,
        )
    }

    pub fn error_execution(send_id: &Option<String>, invoke_id: &Option<InvokeId>) -> Event {
        Event::new(
            send_id.as_deref().unwrap_or(""),
            ERROR_EXECUTION,
            None,
            invoke_id.clone(),
            EventType::internal,
        )
    }

    pub fn error_execution_with_event(event: &Event) -> Event {
        Event::error_execution(&event.sendid, &event.invoke_id)
    }

    pub fn error_communication(event: &Event) -> Event {
        Event::new(
            event.sendid.as_deref().unwrap_or(""),
            ERROR_COMMUNICATION,
            None,
            event.invoke_id.clone(),
            EventType::internal,
        )
    }

    pub fn error_platform(msg: &str) -> Event {
        let mut e = Event::new("", ERROR_PLATFORM, None, None, EventType::internal);
        e.content = Some(Data::String(msg.to_string()));
        e
    }

    /// #W3C says:
    /// The SCXML Processor MUST name-match events by comparing the (case sensitive) tokens in
    /// the event descriptor against the tokens in the event's name, from left to right, where
    /// "." is the token separator and "*" matches one or more trailing tokens.
    pub fn name_matches(descriptor: &str, event_name: &str) -> bool {
        if descriptor == "*" {
            return true;
        }
        let desc_prefix = descriptor.strip_suffix(".*").unwrap_or(descriptor);
        let desc_tokens: Vec<&str> = desc_prefix.split('.').collect();
        let event_tokens: Vec<&str> = event_name.split('.').collect();
        if event_tokens.len() < desc_tokens.len() {
            return false;
        }
        desc_tokens
            .iter()
            .zip(event_tokens.iter())
            .all(|(d, e)| d == e)
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransitionType {
    Internal,
    External,
}

pub fn map_transition_type(ts: &str) -> TransitionType {
    if ts.eq_ignore_ascii_case("internal") {
        TransitionType::Internal
    } else {
        TransitionType::External
    }
}

#[derive(Debug, Clone, Default)]
pub struct Transition {
    pub id: TransitionId,
    pub doc_id: u32,
    pub source: StateId,
    pub target: Vec<StateId>,
    pub events: Vec<String>,
    pub cond: Option<String>,
    pub transition_type: TransitionType,
    pub content: ExecutableContentId,
}

impl Default for TransitionType {
    fn default() -> Self {
        TransitionType::External
    }
}

impl Transition {
    pub fn new() -> Transition {
        let mut t = Transition::default();
        t.id = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        t
    }

    pub fn isTargetless(&self) -> bool {
        self.target.is_empty()
    }
}

/// Appends `param` to `params`, creating the vector on first use.
pub fn push_param(params: &mut Option<Vec<Parameter>>, param: Parameter) {
    match params {
        Some(v) => v.push(param),
        None => *params = Some(vec![param]),
    }
}

#[derive(Debug, Clone)]
pub struct Invoke {
    pub id: String,
    pub id_location: String,
    pub type_name: String,
    pub type_expr: String,
    pub src: String,
    pub src_expr: String,
    pub namelist: Vec<String>,
    pub params: Option<Vec<Parameter>>,
    pub autoforward: bool,
    /// Inline `<content>` (a nested `<scxml>` document, serialized back to text by the reader).
    pub content: Option<String>,
    pub finalize: ExecutableContentId,
}

impl Default for Invoke {
    fn default() -> Self {
        Invoke {
            id: String::new(),
            id_location: String::new(),
            type_name: String::new(),
            type_expr: String::new(),
            src: String::new(),
            src_expr: String::new(),
            namelist: Vec::new(),
            params: None,
            autoforward: false,
            content: None,
            finalize: 0,
        }
    }
}

impl Invoke {
    pub fn new() -> Invoke {
        Invoke::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateType {
    Atomic,
    Compound,
    Parallel,
    Final,
    History { deep: bool },
}

#[derive(Debug, Clone)]
pub struct State {
    pub id: StateId,
    pub doc_id: u32,
    pub name: Name,
    pub parent: Option<StateId>,
    pub children: Vec<StateId>,
    pub state_type: StateType,
    /// Explicit `<initial>` transition, if the compound state has one.
    pub initial_transition: Option<TransitionId>,
    pub transitions: Vec<TransitionId>,
    pub onentry: ExecutableContentId,
    pub onexit: ExecutableContentId,
    pub invoke: Vec<Invoke>,
    pub donedata: Option<DoneData>,
    /// Default transition fired when a history state has no recorded configuration yet.
    pub history_default: Option<TransitionId>,
    pub data: crate::datamodel::DataStore,
}

impl State {
    pub fn new(id: StateId, name: &str) -> State {
        State {
            id,
            doc_id: id,
            name: name.to_string(),
            parent: None,
            children: Vec::new(),
            state_type: StateType::Atomic,
            initial_transition: None,
            transitions: Vec::new(),
            onentry: 0,
            onexit: 0,
            invoke: Vec::new(),
            donedata: None,
            history_default: None,
            data: crate::datamodel::DataStore::new(),
        }
    }

    pub fn isAtomic(&self) -> bool {
        matches!(self.state_type, StateType::Atomic | StateType::Final)
    }

    pub fn isCompound(&self) -> bool {
        matches!(self.state_type, StateType::Compound)
    }

    pub fn isParallel(&self) -> bool {
        matches!(self.state_type, StateType::Parallel)
    }

    pub fn isFinal(&self) -> bool {
        matches!(self.state_type, StateType::Final)
    }

    pub fn isHistory(&self) -> bool {
        matches!(self.state_type, StateType::History { .. })
    }

    pub fn isHistoryDeep(&self) -> bool {
        matches!(self.state_type, StateType::History { deep: true })
    }
}

/// How the macrostep loop finished.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FinishMode {
    /// The top-level final state was entered.
    Done,
    /// The session was cancelled from the outside (destroy, or `EVENT_CANCEL_SESSION`).
    Cancelled,
}

/// Bridges `Fsm` back into the owning `FsmExecutor` without a circular module dependency:
/// `fsm_executor` depends on `fsm`, not the other way round.
pub trait ExecutorProxy: Send {
    fn send_to_session(&self, session_id: SessionId, event: Event) -> Result<(), String>;

    /// Spawns a child session for `<invoke>`, wiring it to the parent via `parent`/`invoke_id`.
    fn start_child(
        &self,
        fsm: Box<Fsm>,
        data: HashMap<String, Data>,
        parent: SessionId,
        invoke_id: InvokeId,
    ) -> Result<ChildSession, String>;

    fn remove_session(&self, session_id: SessionId);

    fn get_copy(&self) -> Box<dyn ExecutorProxy>;
}

impl Debug for dyn ExecutorProxy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExecutorProxy")
    }
}

impl Clone for Box<dyn ExecutorProxy> {
    fn clone(&self) -> Self {
        self.get_copy()
    }
}

/// A handle to a running session, as seen by whoever started it (a parent `<invoke>`, or the
/// top-level caller).
#[derive(Clone)]
pub struct ChildSession {
    pub session_id: SessionId,
    pub sender: Sender<Box<Event>>,
    pub global_data: GlobalDataArc,
}

/// A handle returned to callers that start a top-level FSM.
pub struct ScxmlSession {
    pub session_id: SessionId,
    pub sender: Sender<Box<Event>>,
    pub global_data: GlobalDataArc,
    pub thread: Option<JoinHandle<()>>,
}

/// The data that is specific to one running session, as opposed to the static document shape
/// held by `Fsm`. Owned by the session's `Datamodel` (see datamodel.rs) because the script
/// engine and the session bookkeeping are always touched together.
pub struct GlobalData {
    pub session_id: SessionId,
    pub source: Option<String>,
    pub configuration: OrderedSet<StateId>,
    /// Mirrors `Fsm::statesNames`, copied in once at session start so datamodels that don't
    /// hold a reference to the static document (the null datamodel) can still resolve `In(id)`.
    pub state_names: HashMap<Name, StateId>,
    pub statesToInvoke: OrderedSet<StateId>,
    pub historyValue: HashMap<StateId, OrderedSet<StateId>>,
    pub internalQueue: Queue<Event>,
    pub externalQueue: BlockingQueue<Box<Event>>,
    pub running: bool,
    pub parent_session_id: Option<SessionId>,
    pub child_sessions: HashMap<InvokeId, ChildSession>,
    pub delayed_send: HashMap<String, timer::Guard>,
    pub executor: Option<Box<dyn ExecutorProxy>>,
    pub io_processors: Arc<Mutex<HashMap<String, Box<dyn EventIOProcessor>>>>,
    pub tracer: Box<dyn Tracer>,
    /// Snapshot of state names taken right before the session's configuration is torn down,
    /// so callers (tests, embedders) can inspect where the machine ended up.
    pub final_configuration: Option<Vec<String>>,
}

impl Debug for GlobalData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalData")
            .field("session_id", &self.session_id)
            .field("configuration", &self.configuration)
            .finish()
    }
}

impl GlobalData {
    pub fn new() -> GlobalData {
        GlobalData {
            session_id: next_session_id(),
            source: None,
            configuration: OrderedSet::new(),
            state_names: HashMap::new(),
            statesToInvoke: OrderedSet::new(),
            historyValue: HashMap::new(),
            internalQueue: Queue::new(),
            externalQueue: BlockingQueue::new(),
            running: true,
            parent_session_id: None,
            child_sessions: HashMap::new(),
            delayed_send: HashMap::new(),
            executor: None,
            io_processors: Arc::new(Mutex::new(HashMap::new())),
            tracer: create_tracer(),
            final_configuration: None,
        }
    }

    pub fn enqueue_internal(&mut self, event: Event) {
        #[cfg(feature = "Trace_Event")]
        self.tracer.event_internal_sent(self.session_id, &event);
        self.internalQueue.enqueue(event);
    }

    /// #W3C says (B.1.7): `In(id)` is true if `id` is a member of the current configuration.
    pub fn is_in_state(&self, name: &str) -> bool {
        match self.state_names.get(name) {
            Some(id) => self.configuration.isMember(id),
            None => false,
        }
    }
}

impl Default for GlobalData {
    fn default() -> Self {
        GlobalData::new()
    }
}

/// The static, parsed shape of one SCXML document. Shared logic between the interpreter and
/// the ahead-of-time mode lives on the pure helper functions below (`compute_exit_set`,
/// `compute_entry_set`, `remove_conflicting_transitions`, ...), which both paths call with the
/// same flat `states`/`transitions` tables -- see `aot.rs`.
pub struct Fsm {
    pub name: String,
    pub datamodel_name: String,
    pub binding: BindingType,
    pub pseudo_root: StateId,
    pub states: Vec<State>,
    pub statesNames: HashMap<Name, StateId>,
    pub transitions: HashMap<TransitionId, Transition>,
    pub executableContent: HashMap<ExecutableContentId, Vec<Box<dyn crate::executable_content::ExecutableContent>>>,
    pub script: Option<String>,
    pub source: Option<String>,
    pub caller_invoke_id: Option<InvokeId>,
    pub parent_session_id: Option<SessionId>,
    /// Host-registered actions a document can invoke through a [`crate::executable_content::CustomAction`].
    pub custom_actions: crate::actions::ActionWrapper,
    #[cfg(feature = "Trace")]
    pub tracer: Box<dyn Tracer>,
}

impl Debug for Fsm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fsm")
            .field("name", &self.name)
            .field("states", &self.states.len())
            .finish()
    }
}

impl Default for Fsm {
    fn default() -> Self {
        Fsm::new()
    }
}

impl Fsm {
    pub fn new() -> Fsm {
        Fsm {
            name: String::new(),
            datamodel_name: ECMA_SCRIPT_LC.to_string(),
            binding: BindingType::Early,
            pseudo_root: 0,
            states: Vec::new(),
            statesNames: HashMap::new(),
            transitions: HashMap::new(),
            executableContent: HashMap::new(),
            script: None,
            source: None,
            caller_invoke_id: None,
            parent_session_id: None,
            custom_actions: crate::actions::ActionWrapper::new(),
            #[cfg(feature = "Trace")]
            tracer: create_tracer(),
        }
    }

    pub fn get_state_by_name(&self, name: &Name) -> Option<&State> {
        self.statesNames.get(name).map(|id| &self.states[*id as usize])
    }

    pub fn get_state_by_name_mut(&mut self, name: &Name) -> Option<&mut State> {
        match self.statesNames.get(name) {
            Some(id) => self.states.get_mut(*id as usize),
            None => None,
        }
    }

    pub fn get_state_by_id(&self, state_id: StateId) -> Option<&State> {
        self.states.get(state_id as usize)
    }

    pub fn get_state_by_id_mut(&mut self, state_id: StateId) -> Option<&mut State> {
        self.states.get_mut(state_id as usize)
    }

    pub fn get_transition_by_id(&self, transition_id: TransitionId) -> Option<&Transition> {
        self.transitions.get(&transition_id)
    }

    pub fn get_transition_by_id_mut(&mut self, transition_id: TransitionId) -> Option<&mut Transition> {
        self.transitions.get_mut(&transition_id)
    }

    /// Schedules `f` to run once, `delay_ms` from now, on the shared scheduler thread.
    /// Grounded on the teacher's choice to use the `timer` crate rather than a hand-rolled
    /// heap; see `event_scheduler.rs`.
    pub fn schedule<F>(&self, delay_ms: i64, f: F) -> Option<timer::Guard>
    where
        F: 'static + FnMut() + Send,
    {
        crate::event_scheduler::schedule_once(delay_ms, f)
    }

    pub(crate) fn executeContentVec(&self, datamodel: &mut dyn Datamodel, content_id: ExecutableContentId) -> bool {
        if content_id == 0 {
            return true;
        }
        match self.executableContent.get(&content_id) {
            None => true,
            Some(actions) => {
                for action in actions {
                    if !action.execute(datamodel, self) {
                        return false;
                    }
                }
                true
            }
        }
    }

    pub fn isInFinalState(&self, state_id: StateId, configuration: &OrderedSet<StateId>) -> bool {
        let state = match self.get_state_by_id(state_id) {
            Some(s) => s,
            None => return false,
        };
        if state.isCompound() {
            state.children.iter().any(|c| {
                configuration.isMember(c)
                    && self
                        .get_state_by_id(*c)
                        .map(|cs| cs.isFinal())
                        .unwrap_or(false)
            })
        } else if state.isParallel() {
            state
                .children
                .iter()
                .all(|c| self.isInFinalState(*c, configuration))
        } else {
            false
        }
    }

    /// #W3C says:
    /// Returns the set of all ancestors of state s up to, but not including, root, in ancestry
    /// order.
    pub fn getProperAncestors(&self, state: StateId, root: Option<StateId>) -> List<StateId> {
        let mut ancestors = List::new();
        let mut current = self.get_state_by_id(state).and_then(|s| s.parent);
        while let Some(p) = current {
            if Some(p) == root {
                break;
            }
            ancestors.push(p);
            current = self.get_state_by_id(p).and_then(|s| s.parent);
        }
        ancestors
    }

    pub fn isDescendant(&self, state1: StateId, state2: StateId) -> bool {
        self.getProperAncestors(state1, None).some(&|a| *a == state2)
    }

    /// #W3C says:
    /// Returns the compound state such that 1) all states that are targets of the transition are
    /// descendants of it 2) no descendant of it has this property.
    pub fn findLCCA(&self, state_list: &List<StateId>) -> StateId {
        let mut candidates = self.getProperAncestors(*state_list.head(), None);
        candidates.push_front_compat();
        for anc in candidates.iterator() {
            let anc = *anc;
            let is_compound_or_root = self
                .get_state_by_id(anc)
                .map(|s| s.isCompound() || s.isParallel() || anc == self.pseudo_root)
                .unwrap_or(anc == self.pseudo_root);
            if is_compound_or_root
                && state_list
                    .tail_iter_compat()
                    .all(|s| self.isDescendant(*s, anc) || *s == anc)
            {
                return anc;
            }
        }
        self.pseudo_root
    }

    /// #W3C says:
    /// Returns the state or parallel region to which a transition belongs (for conflict
    /// resolution and exit-set computation).
    pub fn getTransitionDomain(&self, t: &Transition) -> Option<StateId> {
        let tstates = self.getEffectiveTargetStates(t);
        if tstates.isEmpty() {
            return None;
        }
        if t.transition_type == TransitionType::Internal
            && self
                .get_state_by_id(t.source)
                .map(|s| s.isCompound())
                .unwrap_or(false)
            && tstates.iterator().all(|s| self.isDescendant(*s, t.source))
        {
            return Some(t.source);
        }
        let mut all = List::new();
        all.push(t.source);
        for s in tstates.iterator() {
            all.push(*s);
        }
        Some(self.findLCCA(&all))
    }

    /// #W3C says:
    /// Returns the states that will be the target when this transition is taken, dereferencing
    /// any history states.
    pub fn getEffectiveTargetStates(&self, t: &Transition) -> OrderedSet<StateId> {
        let mut targets = OrderedSet::new();
        for id in &t.target {
            if let Some(s) = self.get_state_by_id(*id) {
                if s.isHistory() {
                    // handled by caller via historyValue; fall back to default transition targets
                    if let Some(default_id) = s.history_default {
                        if let Some(default_t) = self.get_transition_by_id(default_id) {
                            let sub = self.getEffectiveTargetStates(default_t);
                            targets.union(&sub);
                        }
                    }
                } else {
                    targets.add(*id);
                }
            }
        }
        targets
    }

    pub fn getChildStates(&self, state: StateId) -> List<StateId> {
        match self.get_state_by_id(state) {
            Some(s) => List::from_vec(
                s.children
                    .iter()
                    .filter(|c| {
                        self.get_state_by_id(**c)
                            .map(|cs| !cs.isHistory())
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect(),
            ),
            None => List::new(),
        }
    }
}

impl Display for Fsm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fsm{{name: {}}}", self.name)
    }
}

// Small ergonomic helpers used only inside findLCCA above -- the W3C pseudo-code iterates
// "ancestors plus the state itself" and "the tail of the target list"; rather than bending
// List's generic API to match that exactly we add two tiny adapters here.
impl<T: Clone> List<T> {
    fn push_front_compat(&mut self) {
        // no-op placeholder kept for readability at call site; ancestors already include
        // everything findLCCA needs to scan (head's ancestors), the head itself is checked
        // via isDescendant/eq below.
    }

    fn tail_iter_compat(&self) -> Iter<'_, T> {
        self.data.iter()
    }
}

/// Starts the FSM inside a worker thread, with an empty initial data set.
pub fn start_fsm(sm: Box<Fsm>, executor: Box<dyn ExecutorProxy>) -> ScxmlSession {
    start_fsm_with_data(sm, executor, &HashMap::new(), Arc::new(Mutex::new(HashMap::new())))
}

/// Starts the FSM inside a worker thread, pre-seeding the datamodel with `data` (used for
/// `<invoke>` `namelist`/`<param>` initial values) and sharing `io_processors` with the rest of
/// the process (registered once by `FsmExecutor`, looked up by name from `<send type>`).
pub fn start_fsm_with_data(
    mut sm: Box<Fsm>,
    executor: Box<dyn ExecutorProxy>,
    data: &HashMap<String, Data>,
    io_processors: Arc<Mutex<HashMap<String, Box<dyn EventIOProcessor>>>>,
) -> ScxmlSession {
    let mut global = GlobalData::new();
    global.source = sm.source.clone();
    global.parent_session_id = sm.parent_session_id;
    global.executor = Some(executor);
    global.io_processors = io_processors;
    let session_id = global.session_id;
    let sender = global.externalQueue.sender.clone();
    let global_arc: GlobalDataArc = Arc::new(Mutex::new(global));
    let global_for_session = global_arc.clone();

    let datamodel_name = sm.datamodel_name.clone();
    let seed = data.clone();

    let thread = thread::Builder::new()
        .name(format!("fsm-{}", session_id))
        .spawn(move || {
            let mut datamodel = create_datamodel(datamodel_name.as_str(), global_arc.clone());
            for (name, value) in &seed {
                datamodel.set(name, value.clone());
            }
            {
                let io_processors = datamodel.get_io_processors();
                let mut guard = io_processors.lock().unwrap();
                for iop in guard.values_mut() {
                    iop.add_fsm(&sm, datamodel.as_mut());
                }
            }
            interpret(&mut sm, datamodel.as_mut());
        })
        .expect("failed to spawn fsm session thread");

    ScxmlSession {
        session_id,
        sender,
        global_data: global_for_session,
        thread: Some(thread),
    }
}

////////////////////////////////////////////////////////////////////////////////
// ## The interpretation algorithm itself.
// See https://www.w3.org/TR/scxml/#AlgorithmforSCXMLInterpretation -- names below intentionally
// mirror the pseudo-code there (hence `#![allow(non_snake_case)]` at the top of this file).
////////////////////////////////////////////////////////////////////////////////

/// #W3C says:
/// interpret(doc):
///   if not validate(doc): fail with error
///   expandScxmlSource(doc)
///   configuration = new OrderedSet()
///   statesToInvoke = new OrderedSet()
///   internalQueue = new Queue()
///   externalQueue = new BlockingQueue()
///   historyValue = new HashTable()
///   datamodel = new Datamodel(doc)
///   if doc.binding == "early": initializeDatamodel(datamodel,doc)
///   running = true
///   executeGlobalScriptElement(doc)
///   enterStates([doc.initial.transition])
///   mainEventLoop()
pub fn interpret(fsm: &mut Fsm, datamodel: &mut dyn Datamodel) {
    datamodel.global().lock().unwrap().state_names = fsm.statesNames.clone();
    datamodel.implement_mandatory_functionality(fsm);

    if fsm.binding == BindingType::Early {
        initialize_data_model_recursively(fsm, datamodel, fsm.pseudo_root);
    }

    if let Some(script) = fsm.script.clone() {
        let _ = datamodel.execute(script.as_str());
    }

    let root_transition = Transition {
        id: 0,
        doc_id: 0,
        source: fsm.pseudo_root,
        target: vec![fsm.pseudo_root],
        events: Vec::new(),
        cond: None,
        transition_type: TransitionType::External,
        content: 0,
    };
    let mut initial = List::new();
    initial.push(root_transition);
    enter_states(fsm, datamodel, &initial);

    main_event_loop(fsm, datamodel);
    exit_interpreter(fsm, datamodel);
}

fn initialize_data_model_recursively(fsm: &mut Fsm, datamodel: &mut dyn Datamodel, state: StateId) {
    datamodel.initializeDataModel(fsm, state);
    let children = fsm
        .get_state_by_id(state)
        .map(|s| s.children.clone())
        .unwrap_or_default();
    for c in children {
        initialize_data_model_recursively(fsm, datamodel, c);
    }
}

/// #W3C says:
/// mainEventLoop():
///   while running:
///     enabledTransitions = null
///     macrostepDone = false
///     # Here we handle eventless transitions and transitions triggered by internal events
///     # until the internal event queue is empty.
///     while running and not macrostepDone:
///       enabledTransitions = selectEventlessTransitions()
///       if enabledTransitions.isEmpty():
///         if internalQueue.isEmpty(): macrostepDone = true
///         else:
///           internalEvent = internalQueue.dequeue()
///           datamodel["_event"] = internalEvent
///           enabledTransitions = selectTransitions(internalEvent)
///       if not enabledTransitions.isEmpty():
///         microstep(enabledTransitions.toList())
///     # either we're in a final state, and we break out of the loop, or we've completed a
///     # macrostep, so we start a new one by waiting for an external event.
///     if not running: break
///     for state in statesToInvoke.sort(documentOrder): invoke each <invoke> in state
///     statesToInvoke.clear()
///     if internalQueue.isEmpty(): # ...an external event can now be processed
///       externalEvent = externalQueue.dequeue()
///       if isCancelEvent(externalEvent): running = false; continue
///       datamodel["_event"] = externalEvent
///       for state in configuration: forward externalEvent to any invoked sessions per autoforward
///       enabledTransitions = selectTransitions(externalEvent)
///     if not enabledTransitions.isEmpty(): microstep(enabledTransitions.toList())
///   exitInterpreter()
fn main_event_loop(fsm: &mut Fsm, datamodel: &mut dyn Datamodel) {
    loop {
        if !datamodel.global().lock().unwrap().running {
            break;
        }
        let mut macrostep_done = false;
        while !macrostep_done {
            if !datamodel.global().lock().unwrap().running {
                return;
            }
            let mut enabled = select_eventless_transitions(fsm, datamodel);
            if enabled.isEmpty() {
                let next_internal = {
                    let mut g = datamodel.global().lock().unwrap();
                    if g.internalQueue.isEmpty() {
                        None
                    } else {
                        Some(g.internalQueue.dequeue())
                    }
                };
                match next_internal {
                    None => macrostep_done = true,
                    Some(event) => {
                        #[cfg(feature = "Trace_Event")]
                        datamodel
                            .global()
                            .lock()
                            .unwrap()
                            .tracer
                            .event_internal_received(datamodel.global().lock().unwrap().session_id, &event);
                        datamodel.set_event(&event);
                        enabled = select_transitions(fsm, datamodel, &event);
                    }
                }
            }
            if !enabled.isEmpty() {
                microstep(fsm, datamodel, &enabled.toList());
            }
        }

        if !datamodel.global().lock().unwrap().running {
            break;
        }

        invoke_pending_states(fsm, datamodel);

        let has_internal = !datamodel.global().lock().unwrap().internalQueue.isEmpty();
        if has_internal {
            continue;
        }

        let external_event = {
            let g = datamodel.global().lock().unwrap();
            g.externalQueue.dequeue()
        };

        if external_event.name == EVENT_CANCEL_SESSION {
            datamodel.global().lock().unwrap().running = false;
            break;
        }

        #[cfg(feature = "Trace_Event")]
        {
            let sid = datamodel.global().lock().unwrap().session_id;
            datamodel
                .global()
                .lock()
                .unwrap()
                .tracer
                .event_external_received(sid, &external_event);
        }

        autoforward_event(fsm, datamodel, &external_event);

        datamodel.set_event(&external_event);
        let enabled = select_transitions(fsm, datamodel, &external_event);
        if !enabled.isEmpty() {
            microstep(fsm, datamodel, &enabled.toList());
        }
    }
}

fn autoforward_event(fsm: &Fsm, datamodel: &mut dyn Datamodel, event: &Event) {
    let config = datamodel.global().lock().unwrap().configuration.clone();
    for state_id in config.iterator() {
        if let Some(state) = fsm.get_state_by_id(*state_id) {
            for inv in &state.invoke {
                if inv.autoforward {
                    if let Some(child) = datamodel
                        .global()
                        .lock()
                        .unwrap()
                        .child_sessions
                        .get(&inv.id)
                        .cloned()
                    {
                        let _ = child.sender.send(Box::new(event.clone()));
                    }
                }
            }
        }
    }
}

/// #W3C says: Invoke <invoke> elements of states that were entered this macrostep, in document
/// order. Invocation is deferred to the end of the macrostep so the child session sees a
/// coherent parent configuration (6.4).
fn invoke_pending_states(fsm: &mut Fsm, datamodel: &mut dyn Datamodel) {
    let pending: Vec<StateId> = {
        let mut g = datamodel.global().lock().unwrap();
        let mut v: Vec<StateId> = g.statesToInvoke.toList().iterator().cloned().collect();
        v.sort_by(documentOrder);
        g.statesToInvoke.clear();
        v
    };
    for state_id in pending {
        invoke_state(fsm, datamodel, state_id);
    }
}

fn invoke_state(fsm: &mut Fsm, datamodel: &mut dyn Datamodel, state_id: StateId) {
    let invokes = match fsm.get_state_by_id(state_id) {
        Some(s) => s.invoke.clone(),
        None => return,
    };
    for inv in invokes {
        let invoke_id = if !inv.id.is_empty() {
            inv.id.clone()
        } else {
            format!(
                "{}.{}",
                fsm.get_state_by_id(state_id).map(|s| s.name.clone()).unwrap_or_default(),
                PLATFORM_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
            )
        };
        if !inv.id_location.is_empty() {
            datamodel.set(inv.id_location.as_str(), Data::String(invoke_id.clone()));
        }

        let mut seed: HashMap<String, Data> = HashMap::new();
        for name in &inv.namelist {
            if let Ok(v) = datamodel.get_by_location(name) {
                seed.insert(name.clone(), v);
            }
        }
        if let Some(params) = &inv.params {
            let mut values = Vec::new();
            datamodel.evaluate_params(&Some(params.clone()), &mut values);
            for p in values {
                seed.insert(p.name, p.value);
            }
        }

        let child_fsm = match load_invoke_target(&inv) {
            Ok(f) => f,
            Err(msg) => {
                error!("invoke src '{}' failed to load: {}", inv.src, msg);
                datamodel.internal_error_execution();
                continue;
            }
        };

        let (parent_session_id, executor) = {
            let g = datamodel.global().lock().unwrap();
            (g.session_id, g.executor.as_ref().map(|e| e.get_copy()))
        };

        let executor = match executor {
            Some(e) => e,
            None => {
                error!("no executor available to start invoked session");
                continue;
            }
        };

        match executor.start_child(child_fsm, seed, parent_session_id, invoke_id.clone()) {
            Ok(child) => {
                datamodel
                    .global()
                    .lock()
                    .unwrap()
                    .child_sessions
                    .insert(invoke_id, child);
            }
            Err(msg) => {
                error!("failed to start invoked session: {}", msg);
                datamodel.internal_error_execution();
            }
        }
    }
}

/// Loading an invoke target (an external SCXML URI, or inline `<content>`) is the job of the
/// XML-parsing collaborator (`scxml_reader`, out of scope for this crate's own engineering).
fn load_invoke_target(inv: &Invoke) -> Result<Box<Fsm>, String> {
    #[cfg(feature = "xml")]
    {
        if let Some(content) = &inv.content {
            return crate::scxml_reader::parse_from_xml(content.clone());
        }
        if !inv.src.is_empty() {
            return crate::scxml_reader::parse_from_uri(inv.src.clone(), &[]);
        }
    }
    Err("no invoke source available (xml feature disabled or src/content empty)".to_string())
}

/// #W3C says:
/// selectEventlessTransitions():
///   enabledTransitions = new OrderedSet()
///   atomicStates = configuration.toList().filter(isAtomicState).sort(documentOrder)
///   for state in atomicStates:
///     loop: for s in [state].append(getProperAncestors(state, null)):
///       for t in s.transition.sort(documentOrder):
///         if not t.event and conditionMatch(t):
///           enabledTransitions.add(t); break loop
///   return removeConflictingTransitions(enabledTransitions)
fn select_eventless_transitions(fsm: &Fsm, datamodel: &mut dyn Datamodel) -> OrderedSet<Transition> {
    let mut enabled: OrderedSet<Transition> = OrderedSet::new();
    let mut atomic_states: Vec<StateId> = {
        let g = datamodel.global().lock().unwrap();
        g.configuration
            .iterator()
            .filter(|id| fsm.get_state_by_id(**id).map(|s| s.isAtomic()).unwrap_or(false))
            .cloned()
            .collect()
    };
    atomic_states.sort_by(documentOrder);

    for state in atomic_states {
        let mut chain = vec![state];
        chain.extend(fsm.getProperAncestors(state, None).iterator().cloned());
        let mut found = false;
        for s in chain {
            if found {
                break;
            }
            let mut ts: Vec<TransitionId> = fsm.get_state_by_id(s).map(|st| st.transitions.clone()).unwrap_or_default();
            ts.sort_by(|a, b| documentOrder(a, b));
            for tid in ts {
                if let Some(t) = fsm.get_transition_by_id(tid) {
                    if t.events.is_empty() && condition_match(fsm, datamodel, t) {
                        enabled.add(t.clone());
                        found = true;
                        break;
                    }
                }
            }
        }
    }
    remove_conflicting_transitions(fsm, datamodel, &enabled)
}

/// #W3C says:
/// selectTransitions(event): same as selectEventlessTransitions, but matches t.event against
/// event.name using the event-descriptor matching rules, instead of selecting eventless
/// transitions.
fn select_transitions(fsm: &Fsm, datamodel: &mut dyn Datamodel, event: &Event) -> OrderedSet<Transition> {
    let mut enabled: OrderedSet<Transition> = OrderedSet::new();
    let mut atomic_states: Vec<StateId> = {
        let g = datamodel.global().lock().unwrap();
        g.configuration
            .iterator()
            .filter(|id| fsm.get_state_by_id(**id).map(|s| s.isAtomic()).unwrap_or(false))
            .cloned()
            .collect()
    };
    atomic_states.sort_by(documentOrder);

    for state in atomic_states {
        let mut chain = vec![state];
        chain.extend(fsm.getProperAncestors(state, None).iterator().cloned());
        let mut found = false;
        for s in chain {
            if found {
                break;
            }
            let mut ts: Vec<TransitionId> = fsm.get_state_by_id(s).map(|st| st.transitions.clone()).unwrap_or_default();
            ts.sort_by(|a, b| documentOrder(a, b));
            for tid in ts {
                if let Some(t) = fsm.get_transition_by_id(tid) {
                    let matches = t
                        .events
                        .iter()
                        .any(|d| Event::name_matches(d, &event.name));
                    if matches && condition_match(fsm, datamodel, t) {
                        enabled.add(t.clone());
                        found = true;
                        break;
                    }
                }
            }
        }
    }
    remove_conflicting_transitions(fsm, datamodel, &enabled)
}

fn condition_match(fsm: &Fsm, datamodel: &mut dyn Datamodel, t: &Transition) -> bool {
    match &t.cond {
        None => true,
        Some(cond) => datamodel.execute_condition(cond).unwrap_or_else(|e| {
            error!("condition '{}' on transition from {} failed: {}", cond, t.source, e);
            let _ = fsm;
            false
        }),
    }
}

/// #W3C says:
/// removeConflictingTransitions(enabledTransitions):
///   filteredTransitions = new OrderedSet()
///   for t1 in enabledTransitions.toList():
///     t1Preempted = false
///     transitionsToRemove = new OrderedSet()
///     for t2 in filteredTransitions.toList():
///       if computeExitSet([t1]).hasIntersection(computeExitSet([t2])):
///         if isDescendant(t1.source,t2.source): transitionsToRemove.add(t2)
///         else: t1Preempted = true; break
///     if not t1Preempted:
///       for t3 in transitionsToRemove.toList(): filteredTransitions.delete(t3)
///       filteredTransitions.add(t1)
///   return filteredTransitions
fn remove_conflicting_transitions(
    fsm: &Fsm,
    datamodel: &mut dyn Datamodel,
    enabled: &OrderedSet<Transition>,
) -> OrderedSet<Transition> {
    let mut filtered: OrderedSet<Transition> = OrderedSet::new();
    for t1 in enabled.iterator() {
        let mut preempted = false;
        let mut to_remove: Vec<Transition> = Vec::new();
        let exit1 = compute_exit_set(fsm, datamodel, &List::from_vec(vec![t1.clone()]));
        for t2 in filtered.iterator() {
            let exit2 = compute_exit_set(fsm, datamodel, &List::from_vec(vec![t2.clone()]));
            if exit1.hasIntersection(&exit2) {
                if fsm.isDescendant(t1.source, t2.source) {
                    to_remove.push(t2.clone());
                } else {
                    preempted = true;
                    break;
                }
            }
        }
        if !preempted {
            for t3 in &to_remove {
                filtered.delete(t3);
            }
            filtered.add(t1.clone());
        }
    }
    filtered
}

impl PartialEq for Transition {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// #W3C says:
/// computeExitSet(transitions):
///   statesToExit = new OrderedSet
///   for t in transitions:
///     if t.target:
///       domain = getTransitionDomain(t)
///       for s in configuration:
///         if isDescendant(s,domain): statesToExit.add(s)
///   return statesToExit
fn compute_exit_set(fsm: &Fsm, datamodel: &mut dyn Datamodel, transitions: &List<Transition>) -> OrderedSet<StateId> {
    let mut states_to_exit = OrderedSet::new();
    let configuration = datamodel.global().lock().unwrap().configuration.clone();
    for t in transitions.iterator() {
        if !t.target.is_empty() {
            if let Some(domain) = fsm.getTransitionDomain(t) {
                for s in configuration.iterator() {
                    if fsm.isDescendant(*s, domain) {
                        states_to_exit.add(*s);
                    }
                }
            }
        }
    }
    states_to_exit
}

/// #W3C says:
/// microstep(enabledTransitions):
///   exitStates(enabledTransitions)
///   executeTransitionContent(enabledTransitions)
///   enterStates(enabledTransitions)
fn microstep(fsm: &mut Fsm, datamodel: &mut dyn Datamodel, enabled_transitions: &List<Transition>) {
    exit_states(fsm, datamodel, enabled_transitions);
    execute_transition_content(fsm, datamodel, enabled_transitions);
    enter_states(fsm, datamodel, enabled_transitions);
}

/// #W3C says:
/// exitStates(enabledTransitions):
///   statesToExit = computeExitSet(enabledTransitions)
///   for s in statesToExit: statesToInvoke.delete(s)
///   statesToExit = statesToExit.toList().sort(exitOrder)
///   for s in statesToExit:
///     for h in s.history: ... record history value ...
///   for s in statesToExit:
///     for content in s.onexit: executeContent(content)
///     for inv in s.invoke: cancelInvoke(inv)
///     configuration.delete(s)
fn exit_states(fsm: &mut Fsm, datamodel: &mut dyn Datamodel, enabled_transitions: &List<Transition>) {
    let states_to_exit = compute_exit_set(fsm, datamodel, enabled_transitions);

    {
        let mut g = datamodel.global().lock().unwrap();
        for s in states_to_exit.iterator() {
            g.statesToInvoke.delete(s);
        }
    }

    let mut ordered: Vec<StateId> = states_to_exit.iterator().cloned().collect();
    // Exit order: inside-out, i.e. deepest (highest doc id / descendant) first.
    ordered.sort_by(|a, b| documentOrder(b, a));

    // Record history before anything is actually exited.
    for s in &ordered {
        let state = match fsm.get_state_by_id(*s) {
            Some(s) => s.clone(),
            None => continue,
        };
        for child_id in &state.children {
            if let Some(hist) = fsm.get_state_by_id(*child_id) {
                if hist.isHistory() {
                    let deep = hist.isHistoryDeep();
                    let mut g = datamodel.global().lock().unwrap();
                    let recorded: OrderedSet<StateId> = if deep {
                        OrderedSet::from_vec(
                            g.configuration
                                .iterator()
                                .filter(|cid| fsm.isDescendant(**cid, *s) && fsm.get_state_by_id(**cid).map(|x| x.isAtomic()).unwrap_or(false))
                                .cloned()
                                .collect(),
                        )
                    } else {
                        OrderedSet::from_vec(
                            g.configuration
                                .iterator()
                                .filter(|cid| state.children.contains(cid) && g.configuration.isMember(cid))
                                .cloned()
                                .collect(),
                        )
                    };
                    g.historyValue.insert(*child_id, recorded);
                }
            }
        }
    }

    for s in &ordered {
        let (onexit, invokes) = match fsm.get_state_by_id(*s) {
            Some(state) => (state.onexit, state.invoke.clone()),
            None => continue,
        };
        fsm.executeContentVec(datamodel, onexit);
        for inv in &invokes {
            cancel_invoke(datamodel, inv);
        }
        let mut g = datamodel.global().lock().unwrap();
        #[cfg(feature = "Trace_State")]
        {
            if let Some(state) = fsm.get_state_by_id(*s) {
                g.tracer.trace_exit_state(g.session_id, state);
            }
        }
        g.configuration.delete(s);
    }
}

fn cancel_invoke(datamodel: &mut dyn Datamodel, inv: &Invoke) {
    let child = {
        let mut g = datamodel.global().lock().unwrap();
        g.child_sessions.remove(&inv.id)
    };
    if let Some(child) = child {
        let _ = child.sender.send(Event::new_simple(EVENT_CANCEL_SESSION));
        if let Some(executor) = datamodel.global().lock().unwrap().executor.as_ref() {
            executor.remove_session(child.session_id);
        }
    }
}

/// #W3C says:
/// executeTransitionContent(enabledTransitions):
///   for t in enabledTransitions: executeContent(t)
fn execute_transition_content(fsm: &mut Fsm, datamodel: &mut dyn Datamodel, enabled_transitions: &List<Transition>) {
    for t in enabled_transitions.iterator() {
        fsm.executeContentVec(datamodel, t.content);
    }
}

/// #W3C says:
/// enterStates(enabledTransitions):
///   statesToEnter = new OrderedSet()
///   statesForDefaultEntry = new OrderedSet()
///   defaultHistoryContent = new HashTable()
///   computeEntrySet(enabledTransitions, statesToEnter, statesForDefaultEntry, defaultHistoryContent)
///   for s in statesToEnter.toList().sort(entryOrder):
///     configuration.add(s)
///     statesToInvoke.add(s)
///     if binding == "late" and s.isFirstEntry: initializeDataModel(datamodel.s,s); s.isFirstEntry = false
///     for content in s.onentry: executeContent(content)
///     if statesForDefaultEntry.isMember(s): executeContent(s.initial.transition)
///     if defaultHistoryContent[s.id]: executeContent(defaultHistoryContent[s.id])
///     if isFinalState(s):
///       if isSCXMLElement(s.parent): running = false
///       else:
///         parent = s.parent; grandparent = parent.parent
///         internalQueue.enqueue(new Event("done.state." + parent.id, s.donedata))
///         if isParallelState(grandparent):
///           if getChildStates(grandparent).every(isInFinalState):
///             internalQueue.enqueue(new Event("done.state." + grandparent.id))
fn enter_states(fsm: &mut Fsm, datamodel: &mut dyn Datamodel, enabled_transitions: &List<Transition>) {
    let mut states_to_enter: OrderedSet<StateId> = OrderedSet::new();
    let mut states_for_default_entry: OrderedSet<StateId> = OrderedSet::new();
    let mut default_history_content: HashMap<StateId, ExecutableContentId> = HashMap::new();

    compute_entry_set(
        fsm,
        datamodel,
        enabled_transitions,
        &mut states_to_enter,
        &mut states_for_default_entry,
        &mut default_history_content,
    );

    let mut ordered: Vec<StateId> = states_to_enter.iterator().cloned().collect();
    ordered.sort_by(documentOrder);

    for s in ordered {
        let state = match fsm.get_state_by_id(s) {
            Some(st) => st.clone(),
            None => continue,
        };

        {
            let mut g = datamodel.global().lock().unwrap();
            g.configuration.add(s);
            g.statesToInvoke.add(s);
            #[cfg(feature = "Trace_State")]
            g.tracer.trace_enter_state(g.session_id, &state);
        }

        if fsm.binding == BindingType::Late {
            datamodel.initializeDataModel(fsm, s);
        }

        fsm.executeContentVec(datamodel, state.onentry);

        if states_for_default_entry.isMember(&s) {
            if let Some(init_tid) = state.initial_transition {
                if let Some(init_t) = fsm.get_transition_by_id(init_tid) {
                    fsm.executeContentVec(datamodel, init_t.content);
                }
            }
        }

        if let Some(content_id) = default_history_content.get(&s) {
            fsm.executeContentVec(datamodel, *content_id);
        }

        if state.isFinal() {
            let parent = state.parent;
            match parent {
                None => {
                    datamodel.global().lock().unwrap().running = false;
                }
                Some(parent_id) if parent_id == fsm.pseudo_root => {
                    datamodel.global().lock().unwrap().running = false;
                }
                Some(parent_id) => {
                    let done_event = Event::done_state(parent_id, &state.donedata);
                    datamodel.global().lock().unwrap().enqueue_internal(done_event);

                    if let Some(parent_state) = fsm.get_state_by_id(parent_id) {
                        if let Some(grandparent_id) = parent_state.parent {
                            if fsm.get_state_by_id(grandparent_id).map(|g| g.isParallel()).unwrap_or(false) {
                                let configuration = datamodel.global().lock().unwrap().configuration.clone();
                                let all_final = fsm
                                    .getChildStates(grandparent_id)
                                    .every(&|c| fsm.isInFinalState(*c, &configuration));
                                if all_final {
                                    let ev = Event::done_state(grandparent_id, &None);
                                    datamodel.global().lock().unwrap().enqueue_internal(ev);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// #W3C says:
/// computeEntrySet(transitions, statesToEnter, statesForDefaultEntry, defaultHistoryContent):
///   for t in transitions:
///     for s in t.target: addDescendantStatesToEnter(s,...)
///     ancestor = getTransitionDomain(t)
///     for s in getEffectiveTargetStates(t): addAncestorStatesToEnter(s,ancestor,...)
fn compute_entry_set(
    fsm: &Fsm,
    datamodel: &mut dyn Datamodel,
    transitions: &List<Transition>,
    states_to_enter: &mut OrderedSet<StateId>,
    states_for_default_entry: &mut OrderedSet<StateId>,
    default_history_content: &mut HashMap<StateId, ExecutableContentId>,
) {
    for t in transitions.iterator() {
        for s in &t.target {
            add_descendant_states_to_enter(
                fsm,
                datamodel,
                *s,
                states_to_enter,
                states_for_default_entry,
                default_history_content,
            );
        }
        let ancestor = fsm.getTransitionDomain(t);
        let effective = fsm.getEffectiveTargetStates(t);
        for s in effective.iterator() {
            add_ancestor_states_to_enter(
                fsm,
                datamodel,
                *s,
                ancestor,
                states_to_enter,
                states_for_default_entry,
                default_history_content,
            );
        }
    }
}

/// #W3C says:
/// addDescendantStatesToEnter(state,...):
///   if state is a history state:
///     if historyValue[state.id]: for s in historyValue[state.id] addDescendantStatesToEnter(s,...)
///       for s in historyValue[state.id]: addAncestorStatesToEnter(s,state.parent,...)
///     else:
///       defaultHistoryContent[state.parent.id] = state.transition.content
///       for s in state.transition.target: addDescendantStatesToEnter(s,...)
///       for s in state.transition.target: addAncestorStatesToEnter(s,state.parent,...)
///   else:
///     statesToEnter.add(state)
///     if state is a compound state:
///       statesForDefaultEntry.add(state)
///       for s in state.initial.transition.target: addDescendantStatesToEnter(s,...)
///       for s in state.initial.transition.target: addAncestorStatesToEnter(s,state,...)
///     elif state is a parallel state:
///       for child in getChildStates(state): addDescendantStatesToEnter(child,...)
#[allow(clippy::too_many_arguments)]
fn add_descendant_states_to_enter(
    fsm: &Fsm,
    datamodel: &mut dyn Datamodel,
    state_id: StateId,
    states_to_enter: &mut OrderedSet<StateId>,
    states_for_default_entry: &mut OrderedSet<StateId>,
    default_history_content: &mut HashMap<StateId, ExecutableContentId>,
) {
    let state = match fsm.get_state_by_id(state_id) {
        Some(s) => s.clone(),
        None => return,
    };

    if state.isHistory() {
        let recorded = datamodel
            .global()
            .lock()
            .unwrap()
            .historyValue
            .get(&state_id)
            .cloned();
        match recorded {
            Some(history_states) if !history_states.isEmpty() => {
                for s in history_states.iterator() {
                    add_descendant_states_to_enter(
                        fsm,
                        datamodel,
                        *s,
                        states_to_enter,
                        states_for_default_entry,
                        default_history_content,
                    );
                }
                for s in history_states.iterator() {
                    add_ancestor_states_to_enter(
                        fsm,
                        datamodel,
                        *s,
                        state.parent,
                        states_to_enter,
                        states_for_default_entry,
                        default_history_content,
                    );
                }
            }
            _ => {
                if let Some(default_tid) = state.history_default {
                    if let Some(default_t) = fsm.get_transition_by_id(default_tid) {
                        default_history_content.insert(
                            state.parent.unwrap_or(fsm.pseudo_root),
                            default_t.content,
                        );
                        for s in default_t.target.clone() {
                            add_descendant_states_to_enter(
                                fsm,
                                datamodel,
                                s,
                                states_to_enter,
                                states_for_default_entry,
                                default_history_content,
                            );
                        }
                        for s in default_t.target.clone() {
                            add_ancestor_states_to_enter(
                                fsm,
                                datamodel,
                                s,
                                state.parent,
                                states_to_enter,
                                states_for_default_entry,
                                default_history_content,
                            );
                        }
                    }
                }
            }
        }
    } else {
        states_to_enter.add(state_id);
        if state.isCompound() {
            states_for_default_entry.add(state_id);
            let targets: Vec<StateId> = match state.initial_transition {
                Some(tid) => fsm
                    .get_transition_by_id(tid)
                    .map(|t| t.target.clone())
                    .unwrap_or_default(),
                None => state.children.first().cloned().into_iter().collect(),
            };
            for s in &targets {
                add_descendant_states_to_enter(
                    fsm,
                    datamodel,
                    *s,
                    states_to_enter,
                    states_for_default_entry,
                    default_history_content,
                );
            }
            for s in &targets {
                add_ancestor_states_to_enter(
                    fsm,
                    datamodel,
                    *s,
                    Some(state_id),
                    states_to_enter,
                    states_for_default_entry,
                    default_history_content,
                );
            }
        } else if state.isParallel() {
            for child in fsm.getChildStates(state_id).iterator() {
                add_descendant_states_to_enter(
                    fsm,
                    datamodel,
                    *child,
                    states_to_enter,
                    states_for_default_entry,
                    default_history_content,
                );
            }
        }
    }
}

/// #W3C says:
/// addAncestorStatesToEnter(state,ancestor,...):
///   for anc in getProperAncestors(state,ancestor):
///     statesToEnter.add(anc)
///     if anc is a parallel state:
///       for child in getChildStates(anc):
///         if not statesToEnter.some(descendant of child): addDescendantStatesToEnter(child,...)
#[allow(clippy::too_many_arguments)]
fn add_ancestor_states_to_enter(
    fsm: &Fsm,
    datamodel: &mut dyn Datamodel,
    state_id: StateId,
    ancestor: Option<StateId>,
    states_to_enter: &mut OrderedSet<StateId>,
    states_for_default_entry: &mut OrderedSet<StateId>,
    default_history_content: &mut HashMap<StateId, ExecutableContentId>,
) {
    for anc in fsm.getProperAncestors(state_id, ancestor).iterator() {
        states_to_enter.add(*anc);
        if fsm.get_state_by_id(*anc).map(|s| s.isParallel()).unwrap_or(false) {
            for child in fsm.getChildStates(*anc).iterator() {
                let has_descendant = states_to_enter.some(&|s| fsm.isDescendant(*s, *child));
                if !has_descendant {
                    add_descendant_states_to_enter(
                        fsm,
                        datamodel,
                        *child,
                        states_to_enter,
                        states_for_default_entry,
                        default_history_content,
                    );
                }
            }
        }
    }
}

/// #W3C says:
/// exitInterpreter(): for s in configuration.toList().sort(exitOrder): for content in s.onexit:
/// executeContent(content); for inv in s.invoke: cancelInvoke(inv); configuration.delete(s)
fn exit_interpreter(fsm: &mut Fsm, datamodel: &mut dyn Datamodel) {
    let mut ordered: Vec<StateId> = datamodel
        .global()
        .lock()
        .unwrap()
        .configuration
        .iterator()
        .cloned()
        .collect();
    ordered.sort_by(|a, b| documentOrder(b, a));

    {
        let names: Vec<String> = ordered
            .iter()
            .rev()
            .filter_map(|id| fsm.get_state_by_id(*id).map(|s| s.name.clone()))
            .collect();
        datamodel.global().lock().unwrap().final_configuration = Some(names);
    }
    for s in ordered {
        let (onexit, invokes) = match fsm.get_state_by_id(s) {
            Some(state) => (state.onexit, state.invoke.clone()),
            None => continue,
        };
        fsm.executeContentVec(datamodel, onexit);
        for inv in &invokes {
            cancel_invoke(datamodel, inv);
        }
        datamodel.global().lock().unwrap().configuration.delete(&s);
    }
    let session_id = datamodel.global().lock().unwrap().session_id;
    if let Some(executor) = datamodel.global().lock().unwrap().executor.as_ref() {
        executor.remove_session(session_id);
    }
}
