//! Inline caches for property access
//!
//! Every `get_by_id`/`put_by_id` site owns a [`StructureStubInfo`] whose
//! [`StubState`] describes how the site is currently compiled:
//!
//! ```text
//! Unset --first hit S--> SelfSingle(S) --new S2--> SelfList([S, S2]) --...--> Generic
//!       --proto hit----> ProtoSingle / ChainSingle --another case--> ProtoList
//!       --replace on S-> ReplacePut(S)      \
//!       --S1 -> S2-----> TransitionPut(..)  -+--second case--> PutList --overflow--> Generic
//! ```
//!
//! State changes driven by observations only move forward: a site never goes
//! back to `Unset` by itself and `Generic` is final. The one way back is an
//! explicit [`reset`](StructureStubInfo::reset) when a cached structure dies.
//!
//! The transition function [`next_state`] is pure. Stub code generation and
//! repatching live in [`stub`].

pub mod stub;

use crate::config::JitOptions;
use crate::error::Result;
use crate::executable::{repatch_jump, CodePatcher};
use crate::structure::{JsObject, PropertyLookup, PutOutcome, Structure, StructureChain, Value};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

pub use stub::{attach_hot_path, compile_stub, process_observation, CompiledStub, StubClearingWatchpoint, StubContext};

/// Stable id of an inline-cache site within one code block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallSiteId(pub u32);

impl fmt::Display for CallSiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ic#{}", self.0)
    }
}

/// Which operation a site performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    GetById,
    PutById,
}

// ==================== Cases ====================

/// Own-property access on one structure
#[derive(Debug, Clone)]
pub struct SelfAccess {
    pub structure: Rc<Structure>,
    pub offset: u32,
}

/// Access to a property found on the prototype chain
#[derive(Debug, Clone)]
pub struct ProtoAccess {
    pub structure: Rc<Structure>,
    /// Structures from the receiver's prototype down to the holder
    pub chain: StructureChain,
    pub offset: u32,
}

impl ProtoAccess {
    pub fn depth(&self) -> usize {
        self.chain.len()
    }
}

/// Overwrite of an existing own property
#[derive(Debug, Clone)]
pub struct ReplaceAccess {
    pub structure: Rc<Structure>,
    pub offset: u32,
}

/// Add a property by moving the receiver from `old` to `new`
#[derive(Debug, Clone)]
pub struct TransitionAccess {
    pub old: Rc<Structure>,
    pub new: Rc<Structure>,
    /// Prototype chain of `old`; must not change for the transition to stay valid
    pub chain: StructureChain,
    pub offset: u32,
}

/// One case of a polymorphic get site
#[derive(Debug, Clone)]
pub enum GetCase {
    Own(SelfAccess),
    Proto(ProtoAccess),
}

impl GetCase {
    pub fn structure(&self) -> &Rc<Structure> {
        match self {
            GetCase::Own(a) => &a.structure,
            GetCase::Proto(a) => &a.structure,
        }
    }
}

/// One case of a polymorphic put site
#[derive(Debug, Clone)]
pub enum PutCase {
    Replace(ReplaceAccess),
    Transition(TransitionAccess),
}

impl PutCase {
    pub fn structure(&self) -> &Rc<Structure> {
        match self {
            PutCase::Replace(a) => &a.structure,
            PutCase::Transition(a) => &a.old,
        }
    }
}

/// What the slow path learned about one access
#[derive(Debug, Clone)]
pub enum AccessObservation {
    /// The access cannot be cached (missing property, uncacheable structure)
    Uncacheable,
    Own(SelfAccess),
    Proto(ProtoAccess),
    PutReplace(ReplaceAccess),
    PutTransition(TransitionAccess),
}

impl AccessObservation {
    /// Classify a get of `name` on `object`
    pub fn for_get(object: &JsObject, name: &str) -> AccessObservation {
        let structure = object.structure();
        if !structure.is_cacheable() {
            return AccessObservation::Uncacheable;
        }
        match object.lookup(name) {
            PropertyLookup::Own { offset } => AccessObservation::Own(SelfAccess { structure, offset }),
            PropertyLookup::Prototype { depth, offset, .. } => {
                let mut chain = structure.prototype_chain();
                chain.0.truncate(depth);
                if chain.iter().any(|s| !s.is_cacheable()) {
                    return AccessObservation::Uncacheable;
                }
                AccessObservation::Proto(ProtoAccess { structure, chain, offset })
            }
            PropertyLookup::Missing => AccessObservation::Uncacheable,
        }
    }

    /// Classify a put that the generic path already performed
    pub fn for_put(outcome: &PutOutcome) -> AccessObservation {
        match outcome {
            PutOutcome::Replace { structure, offset } if structure.is_cacheable() => {
                AccessObservation::PutReplace(ReplaceAccess { structure: structure.clone(), offset: *offset })
            }
            PutOutcome::Transition { old, new, offset }
                if old.is_cacheable() && new.is_cacheable() && !old.is_dictionary() =>
            {
                let chain = old.prototype_chain();
                if chain.iter().any(|s| !s.is_cacheable()) {
                    return AccessObservation::Uncacheable;
                }
                AccessObservation::PutTransition(TransitionAccess {
                    old: old.clone(),
                    new: new.clone(),
                    chain,
                    offset: *offset,
                })
            }
            _ => AccessObservation::Uncacheable,
        }
    }
}

// ==================== State ====================

/// How a site is currently compiled
#[derive(Debug, Clone, Default)]
pub enum StubState {
    /// Not cached yet; every access takes the slow path
    #[default]
    Unset,
    SelfSingle(SelfAccess),
    SelfList(Vec<SelfAccess>),
    /// Property on the immediate prototype
    ProtoSingle(ProtoAccess),
    /// Property further up the prototype chain
    ChainSingle(ProtoAccess),
    /// Mixed own/prototype cases
    ProtoList(Vec<GetCase>),
    TransitionPut(TransitionAccess),
    ReplacePut(ReplaceAccess),
    PutList(Vec<PutCase>),
    /// Fully dynamic; never specialized again
    Generic,
}

/// Fieldless summary of a [`StubState`] for logging and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StubKind {
    Unset,
    SelfSingle,
    SelfList,
    ProtoSingle,
    ChainSingle,
    ProtoList,
    TransitionPut,
    ReplacePut,
    PutList,
    Generic,
}

impl fmt::Display for StubKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl StubState {
    pub fn kind(&self) -> StubKind {
        match self {
            StubState::Unset => StubKind::Unset,
            StubState::SelfSingle(_) => StubKind::SelfSingle,
            StubState::SelfList(_) => StubKind::SelfList,
            StubState::ProtoSingle(_) => StubKind::ProtoSingle,
            StubState::ChainSingle(_) => StubKind::ChainSingle,
            StubState::ProtoList(_) => StubKind::ProtoList,
            StubState::TransitionPut(_) => StubKind::TransitionPut,
            StubState::ReplacePut(_) => StubKind::ReplacePut,
            StubState::PutList(_) => StubKind::PutList,
            StubState::Generic => StubKind::Generic,
        }
    }

    pub fn is_generic(&self) -> bool {
        matches!(self, StubState::Generic)
    }

    /// Number of cached cases
    pub fn case_count(&self) -> usize {
        match self {
            StubState::Unset | StubState::Generic => 0,
            StubState::SelfList(v) => v.len(),
            StubState::ProtoList(v) => v.len(),
            StubState::PutList(v) => v.len(),
            _ => 1,
        }
    }

    /// Receiver structures the stub checks against, in case order
    pub fn receiver_structures(&self) -> Vec<Rc<Structure>> {
        self.get_cases()
            .iter()
            .map(|c| c.structure().clone())
            .chain(self.put_cases().iter().map(|c| c.structure().clone()))
            .collect()
    }

    /// Every structure the stub relies on (receivers, chains, transition targets)
    pub fn referenced_structures(&self) -> Vec<Rc<Structure>> {
        let mut out: Vec<Rc<Structure>> = Vec::new();
        let mut push = |s: &Rc<Structure>| {
            if !out.iter().any(|o| Rc::ptr_eq(o, s)) {
                out.push(s.clone());
            }
        };
        for case in self.get_cases() {
            push(case.structure());
            if let GetCase::Proto(p) = &case {
                p.chain.iter().for_each(&mut push);
            }
        }
        for case in self.put_cases() {
            push(case.structure());
            if let PutCase::Transition(t) = &case {
                push(&t.new);
                t.chain.iter().for_each(&mut push);
            }
        }
        out
    }

    /// Get cases as a list, whatever the state shape
    pub fn get_cases(&self) -> Vec<GetCase> {
        match self {
            StubState::SelfSingle(a) => vec![GetCase::Own(a.clone())],
            StubState::SelfList(v) => v.iter().cloned().map(GetCase::Own).collect(),
            StubState::ProtoSingle(p) | StubState::ChainSingle(p) => vec![GetCase::Proto(p.clone())],
            StubState::ProtoList(v) => v.clone(),
            _ => Vec::new(),
        }
    }

    /// Put cases as a list, whatever the state shape
    pub fn put_cases(&self) -> Vec<PutCase> {
        match self {
            StubState::ReplacePut(r) => vec![PutCase::Replace(r.clone())],
            StubState::TransitionPut(t) => vec![PutCase::Transition(t.clone())],
            StubState::PutList(v) => v.clone(),
            _ => Vec::new(),
        }
    }

    /// Run the cached fast path for a get; `None` is a miss
    pub fn try_get(&self, object: &JsObject) -> Option<Value> {
        let receiver = object.structure();
        for case in self.get_cases() {
            if !Rc::ptr_eq(case.structure(), &receiver) {
                continue;
            }
            return match case {
                GetCase::Own(a) => object.slot(a.offset),
                GetCase::Proto(p) => holder_for(&receiver, &p.chain).and_then(|h| h.slot(p.offset)),
            };
        }
        None
    }

    /// Run the cached fast path for a put; `false` is a miss
    pub fn try_put(&self, object: &JsObject, value: Value) -> bool {
        let receiver = object.structure();
        for case in self.put_cases() {
            if !Rc::ptr_eq(case.structure(), &receiver) {
                continue;
            }
            match case {
                PutCase::Replace(r) => {
                    object.set_slot(r.offset, value);
                    return true;
                }
                PutCase::Transition(t) => {
                    if t.chain.is_still_valid(&t.old) && t.new.is_live() {
                        object.apply_transition(&t.new, t.offset, value);
                        return true;
                    }
                    return false;
                }
            }
        }
        false
    }
}

/// Walk `chain` from the receiver's prototype; the last object is the holder
fn holder_for(receiver: &Structure, chain: &StructureChain) -> Option<Rc<JsObject>> {
    let mut current = receiver.prototype().cloned();
    let mut holder = None;
    for expected in chain.iter() {
        let object = current?;
        let structure = object.structure();
        if !Rc::ptr_eq(&structure, expected) {
            return None;
        }
        current = structure.prototype().cloned();
        holder = Some(object);
    }
    holder
}

fn same_get_case(a: &GetCase, b: &GetCase) -> bool {
    match (a, b) {
        (GetCase::Own(x), GetCase::Own(y)) => Rc::ptr_eq(&x.structure, &y.structure) && x.offset == y.offset,
        (GetCase::Proto(x), GetCase::Proto(y)) => {
            Rc::ptr_eq(&x.structure, &y.structure)
                && x.offset == y.offset
                && x.chain.len() == y.chain.len()
                && x.chain.iter().zip(y.chain.iter()).all(|(p, q)| Rc::ptr_eq(p, q))
        }
        _ => false,
    }
}

fn same_put_case(a: &PutCase, b: &PutCase) -> bool {
    match (a, b) {
        (PutCase::Replace(x), PutCase::Replace(y)) => Rc::ptr_eq(&x.structure, &y.structure) && x.offset == y.offset,
        (PutCase::Transition(x), PutCase::Transition(y)) => {
            Rc::ptr_eq(&x.old, &y.old) && Rc::ptr_eq(&x.new, &y.new)
        }
        _ => false,
    }
}

impl PartialEq for StubState {
    fn eq(&self, other: &Self) -> bool {
        if self.kind() != other.kind() {
            return false;
        }
        let (a, b) = (self.get_cases(), other.get_cases());
        let (p, q) = (self.put_cases(), other.put_cases());
        a.len() == b.len()
            && p.len() == q.len()
            && a.iter().zip(b.iter()).all(|(x, y)| same_get_case(x, y))
            && p.iter().zip(q.iter()).all(|(x, y)| same_put_case(x, y))
    }
}

// ==================== Transition function ====================

fn single_get(case: GetCase) -> StubState {
    match case {
        GetCase::Own(a) => StubState::SelfSingle(a),
        GetCase::Proto(p) if p.depth() <= 1 => StubState::ProtoSingle(p),
        GetCase::Proto(p) => StubState::ChainSingle(p),
    }
}

fn single_put(case: PutCase) -> StubState {
    match case {
        PutCase::Replace(r) => StubState::ReplacePut(r),
        PutCase::Transition(t) => StubState::TransitionPut(t),
    }
}

/// Add `case` to a get list, replacing a stale case for the same receiver
fn grow_get_list(mut cases: Vec<GetCase>, case: GetCase, max: usize) -> StubState {
    if let Some(existing) = cases.iter_mut().find(|c| Rc::ptr_eq(c.structure(), case.structure())) {
        *existing = case;
    } else if cases.len() + 1 >= max {
        return StubState::Generic;
    } else {
        cases.push(case);
    }
    if cases.len() == 1 {
        return cases.pop().map(single_get).unwrap_or(StubState::Generic);
    }
    if cases.iter().all(|c| matches!(c, GetCase::Own(_))) {
        StubState::SelfList(
            cases
                .into_iter()
                .filter_map(|c| match c {
                    GetCase::Own(a) => Some(a),
                    GetCase::Proto(_) => None,
                })
                .collect(),
        )
    } else {
        StubState::ProtoList(cases)
    }
}

fn grow_put_list(mut cases: Vec<PutCase>, case: PutCase, max: usize) -> StubState {
    if let Some(existing) = cases.iter_mut().find(|c| Rc::ptr_eq(c.structure(), case.structure())) {
        *existing = case;
    } else if cases.len() + 1 >= max {
        return StubState::Generic;
    } else {
        cases.push(case);
    }
    if cases.len() == 1 {
        return cases.pop().map(single_put).unwrap_or(StubState::Generic);
    }
    StubState::PutList(cases)
}

/// The state a site moves to after its slow path saw `observation`
///
/// A list that would reach `max_cases` distinct cases becomes `Generic`.
/// Observations of the wrong access kind for the current state also make the
/// site generic.
pub fn next_state(state: &StubState, observation: &AccessObservation, max_cases: usize) -> StubState {
    let get_case = match observation {
        AccessObservation::Own(a) => Some(GetCase::Own(a.clone())),
        AccessObservation::Proto(p) => Some(GetCase::Proto(p.clone())),
        _ => None,
    };
    let put_case = match observation {
        AccessObservation::PutReplace(r) => Some(PutCase::Replace(r.clone())),
        AccessObservation::PutTransition(t) => Some(PutCase::Transition(t.clone())),
        _ => None,
    };

    match state {
        StubState::Generic => StubState::Generic,
        _ if matches!(observation, AccessObservation::Uncacheable) => StubState::Generic,
        StubState::Unset => match (get_case, put_case) {
            (Some(case), _) => single_get(case),
            (_, Some(case)) => single_put(case),
            _ => StubState::Generic,
        },
        StubState::SelfSingle(_)
        | StubState::SelfList(_)
        | StubState::ProtoSingle(_)
        | StubState::ChainSingle(_)
        | StubState::ProtoList(_) => match get_case {
            Some(case) => grow_get_list(state.get_cases(), case, max_cases),
            None => StubState::Generic,
        },
        StubState::TransitionPut(_) | StubState::ReplacePut(_) | StubState::PutList(_) => match put_case {
            Some(case) => grow_put_list(state.put_cases(), case, max_cases),
            None => StubState::Generic,
        },
    }
}

// ==================== StructureStubInfo ====================

/// Addresses of a site's patchable hot path in its code block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotPath {
    /// Region of the code block holding the addresses below
    pub region: u64,
    /// Absolute jump to the stub, the slow path or the generic path
    pub jump_site: usize,
    /// Calls the repatching miss operation
    pub slow_path: usize,
    /// Calls the generic operation without learning
    pub generic_path: usize,
    /// Continuation after the access
    pub done: usize,
}

/// Result of feeding one slow-path observation to a site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubTransition {
    pub from: StubKind,
    pub to: StubKind,
    pub changed: bool,
}

/// Per-site inline cache state
pub struct StructureStubInfo {
    site: CallSiteId,
    kind: AccessKind,
    bytecode_offset: u32,
    property: Arc<str>,
    state: StubState,
    slow_path_samples: u32,
    reset_count: u32,
    reset_by_gc: bool,
    epoch: u64,
    hot_path: Option<HotPath>,
    stub: Option<CompiledStub>,
    hits: u64,
    misses: u64,
}

impl StructureStubInfo {
    pub fn new(site: CallSiteId, kind: AccessKind, bytecode_offset: u32, property: Arc<str>) -> Self {
        Self {
            site,
            kind,
            bytecode_offset,
            property,
            state: StubState::Unset,
            slow_path_samples: 0,
            reset_count: 0,
            reset_by_gc: false,
            epoch: 0,
            hot_path: None,
            stub: None,
            hits: 0,
            misses: 0,
        }
    }

    pub fn site(&self) -> CallSiteId {
        self.site
    }

    pub fn access_kind(&self) -> AccessKind {
        self.kind
    }

    pub fn bytecode_offset(&self) -> u32 {
        self.bytecode_offset
    }

    pub fn property(&self) -> &Arc<str> {
        &self.property
    }

    pub fn state(&self) -> &StubState {
        &self.state
    }

    /// Whether the slow path ran at least once since the last reset
    pub fn seen_once(&self) -> bool {
        self.slow_path_samples > 0
    }

    pub fn reset_count(&self) -> u32 {
        self.reset_count
    }

    /// Whether the last reset came from a cached structure dying
    pub fn reset_by_gc(&self) -> bool {
        self.reset_by_gc
    }

    /// Bumped whenever the state changes; stale watchpoints compare against it
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn hot_path(&self) -> Option<HotPath> {
        self.hot_path
    }

    pub fn set_hot_path(&mut self, hot_path: HotPath) {
        self.hot_path = Some(hot_path);
    }

    /// Forget the hot path and stub of code that is being freed
    ///
    /// The cache state is kept; later resets no longer patch anything.
    pub fn detach_hot_path(&mut self) {
        self.hot_path = None;
        self.stub = None;
    }

    pub fn stub(&self) -> Option<&CompiledStub> {
        self.stub.as_ref()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Fast path for a get; counts the hit or miss
    pub fn try_get(&mut self, object: &JsObject) -> Option<Value> {
        let result = self.state.try_get(object);
        self.count(result.is_some());
        result
    }

    /// Fast path for a put; counts the hit or miss
    pub fn try_put(&mut self, object: &JsObject, value: Value) -> bool {
        let hit = self.state.try_put(object, value);
        self.count(hit);
        hit
    }

    fn count(&mut self, hit: bool) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
    }

    /// Decide what a slow-path observation should do to the site
    ///
    /// Returns `None` while warming up or when the state would not change.
    pub fn plan(&mut self, observation: &AccessObservation, options: &JitOptions) -> Option<StubState> {
        if matches!(self.state, StubState::Generic) {
            return None;
        }
        self.slow_path_samples = self.slow_path_samples.saturating_add(1);
        if matches!(self.state, StubState::Unset)
            && self.slow_path_samples < options.ic_warm_up_samples
            && !matches!(observation, AccessObservation::Uncacheable)
        {
            return None;
        }
        let next = next_state(&self.state, observation, options.polymorphic_list_cache_size);
        if next == self.state {
            None
        } else {
            Some(next)
        }
    }

    /// Make `next` the current state and point the hot path at its code
    pub fn install(
        &mut self,
        next: StubState,
        stub: Option<CompiledStub>,
        patcher: Option<&dyn CodePatcher>,
    ) -> Result<StubTransition> {
        let from = self.state.kind();
        let to = next.kind();
        let target = self.hot_path.map(|hot| match (&stub, &next) {
            (Some(stub), _) => stub.entry(),
            (None, StubState::Generic) => hot.generic_path,
            (None, _) => hot.slow_path,
        });
        if let (Some(hot), Some(target), Some(patcher)) = (self.hot_path, target, patcher) {
            repatch_jump(patcher, hot.region, hot.jump_site, target)?;
        }
        self.state = next;
        self.stub = stub;
        self.epoch += 1;
        tracing::debug!(site = %self.site, property = %self.property, %from, %to, "inline cache transition");
        Ok(StubTransition { from, to, changed: true })
    }

    /// Point a newly attached hot path at code for the current state
    ///
    /// State and epoch are unchanged, so watchpoints already registered for
    /// the cached structures stay valid.
    pub fn relink(&mut self, hot_path: HotPath, stub: Option<CompiledStub>, patcher: &dyn CodePatcher) -> Result<()> {
        let target = match (&stub, &self.state) {
            (Some(stub), _) => stub.entry(),
            (None, StubState::Generic) => hot_path.generic_path,
            (None, _) => hot_path.slow_path,
        };
        repatch_jump(patcher, hot_path.region, hot_path.jump_site, target)?;
        self.hot_path = Some(hot_path);
        self.stub = stub;
        tracing::trace!(site = %self.site, state = %self.state.kind(), "inline cache relinked");
        Ok(())
    }

    /// Drop the cached cases after a structure they rely on was invalidated
    ///
    /// After `max_resets` resets the site gives up and goes generic.
    pub fn reset(&mut self, max_resets: u32, by_gc: bool, patcher: Option<&dyn CodePatcher>) -> Result<StubTransition> {
        let from = self.state.kind();
        if matches!(self.state, StubState::Generic | StubState::Unset) {
            return Ok(StubTransition { from, to: from, changed: false });
        }
        self.reset_count += 1;
        self.reset_by_gc = by_gc;
        self.slow_path_samples = 0;
        let next = if self.reset_count >= max_resets {
            StubState::Generic
        } else {
            StubState::Unset
        };
        tracing::debug!(site = %self.site, resets = self.reset_count, by_gc, "inline cache reset");
        self.install(next, None, patcher)
    }
}

impl fmt::Debug for StructureStubInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructureStubInfo")
            .field("site", &self.site)
            .field("kind", &self.kind)
            .field("property", &self.property)
            .field("state", &self.state.kind())
            .field("cases", &self.state.case_count())
            .field("resets", &self.reset_count)
            .finish()
    }
}
