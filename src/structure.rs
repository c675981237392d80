//! Structures (object shapes) and the minimal object model around them
//!
//! A [`Structure`] describes the property layout shared by many objects.
//! Inline caches key on structure identity, walk prototype chains and follow
//! transitions, and watch a structure's [`WatchpointSet`] so they are reset
//! when the structure dies or stops being cacheable.
//!
//! ## Lifetimes
//!
//! Structures are `Rc`-shared between objects, transitions and caches. The
//! [`StructureTable`] plays the role of the heap: it hands out ids and, on
//! [`collect`](StructureTable::collect), kills every structure the caller
//! reports unreachable. Killing fires the structure's watchpoints first so no
//! cache keeps relying on it.

use crate::watchpoint::{Watchpoint, WatchpointSet};
use bitflags::bitflags;
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// Property value stored in object slots
pub type Value = i64;

/// Structure identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StructureId(pub u32);

impl fmt::Display for StructureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

bitflags! {
    /// Properties of a structure that affect caching
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StructureFlags: u8 {
        /// Layout is per-object; transitions are not shared
        const DICTIONARY = 0b0001;
        /// Dictionary whose layout changes in place
        const UNCACHEABLE_DICTIONARY = 0b0010;
        /// Lookups may not be cached at all (exotic objects)
        const PROHIBITS_PROPERTY_CACHING = 0b0100;
        /// Own-property lookup runs user code
        const HAS_IMPURE_GET_OWN_PROPERTY_SLOT = 0b1000;
    }
}

/// Property layout shared by objects
pub struct Structure {
    id: StructureId,
    properties: Vec<Rc<str>>,
    prototype: Option<Rc<JsObject>>,
    previous: Option<Rc<Structure>>,
    flags: StructureFlags,
    transitions: RefCell<FxHashMap<Rc<str>, Weak<Structure>>>,
    live: Cell<bool>,
    watchpoints: RefCell<WatchpointSet>,
}

impl Structure {
    pub fn id(&self) -> StructureId {
        self.id
    }

    pub fn flags(&self) -> StructureFlags {
        self.flags
    }

    pub fn prototype(&self) -> Option<&Rc<JsObject>> {
        self.prototype.as_ref()
    }

    /// Structure this one was transitioned from
    pub fn previous(&self) -> Option<&Rc<Structure>> {
        self.previous.as_ref()
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    /// Slot index of `name`, if the structure has it
    pub fn offset_of(&self, name: &str) -> Option<u32> {
        self.properties
            .iter()
            .position(|p| p.as_ref() == name)
            .map(|i| i as u32)
    }

    pub fn is_live(&self) -> bool {
        self.live.get()
    }

    pub fn is_dictionary(&self) -> bool {
        self.flags.contains(StructureFlags::DICTIONARY)
    }

    /// Whether lookups through this structure may be cached
    pub fn is_cacheable(&self) -> bool {
        self.live.get()
            && !self.flags.intersects(
                StructureFlags::UNCACHEABLE_DICTIONARY
                    | StructureFlags::PROHIBITS_PROPERTY_CACHING
                    | StructureFlags::HAS_IMPURE_GET_OWN_PROPERTY_SLOT,
            )
            && self.watchpoints.borrow().is_still_valid()
    }

    /// Watch for this structure dying or becoming uncacheable
    pub fn add_watchpoint(&self, watchpoint: Rc<dyn Watchpoint>) {
        self.watchpoints.borrow_mut().add(watchpoint);
    }

    /// Snapshot of the watchpoint set state
    pub fn watchpoints_fired(&self) -> bool {
        self.watchpoints.borrow().has_fired()
    }

    pub fn pending_watchpoints(&self) -> usize {
        self.watchpoints.borrow().len()
    }

    /// Start treating any invalidation as observable even with no watchers
    pub fn start_watching(&self) {
        self.watchpoints.borrow_mut().start_watching();
    }

    /// Assumptions about this structure no longer hold; fires its watchpoints
    pub fn invalidate(&self) -> usize {
        let fired = WatchpointSet::notify_write_shared(&self.watchpoints);
        tracing::debug!(structure = %self.id, fired, "structure invalidated");
        fired
    }

    /// The structure was collected
    pub(crate) fn kill(&self) -> usize {
        self.live.set(false);
        self.watchpoints.borrow_mut().start_watching();
        WatchpointSet::notify_write_shared(&self.watchpoints)
    }

    /// Structures of the prototype chain, nearest first
    pub fn prototype_chain(&self) -> StructureChain {
        let mut chain = Vec::new();
        let mut current = self.prototype.clone();
        while let Some(object) = current {
            let structure = object.structure();
            current = structure.prototype.clone();
            chain.push(structure);
        }
        StructureChain(chain)
    }
}

impl fmt::Debug for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Structure")
            .field("id", &self.id)
            .field("properties", &self.properties)
            .field("flags", &self.flags)
            .field("live", &self.live.get())
            .finish()
    }
}

/// Structures along a prototype chain
#[derive(Debug, Clone, Default)]
pub struct StructureChain(pub Vec<Rc<Structure>>);

impl StructureChain {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<Structure>> {
        self.0.iter()
    }

    pub fn ids(&self) -> Vec<StructureId> {
        self.0.iter().map(|s| s.id()).collect()
    }

    /// Whether every structure is still the current one of its prototype
    pub fn is_still_valid(&self, head: &Structure) -> bool {
        let current = head.prototype_chain();
        current.len() == self.len()
            && current
                .iter()
                .zip(self.iter())
                .all(|(a, b)| Rc::ptr_eq(a, b) && b.is_cacheable())
    }
}

// ==================== Objects ====================

/// An object: a structure plus one slot per property
pub struct JsObject {
    structure: RefCell<Rc<Structure>>,
    slots: RefCell<Vec<Value>>,
}

/// Where a property lookup found its answer
#[derive(Debug, Clone)]
pub enum PropertyLookup {
    /// On the receiver itself
    Own { offset: u32 },
    /// On an object `depth` steps up the prototype chain
    Prototype {
        holder: Rc<JsObject>,
        holder_structure: Rc<Structure>,
        depth: usize,
        offset: u32,
    },
    Missing,
}

/// What a put did to the receiver
#[derive(Debug, Clone)]
pub enum PutOutcome {
    /// Existing property overwritten in place
    Replace { structure: Rc<Structure>, offset: u32 },
    /// New property added through a structure transition
    Transition {
        old: Rc<Structure>,
        new: Rc<Structure>,
        offset: u32,
    },
}

impl JsObject {
    pub fn new(structure: Rc<Structure>) -> Rc<Self> {
        let slots = vec![0; structure.property_count()];
        Rc::new(Self {
            structure: RefCell::new(structure),
            slots: RefCell::new(slots),
        })
    }

    pub fn structure(&self) -> Rc<Structure> {
        self.structure.borrow().clone()
    }

    pub fn slot(&self, offset: u32) -> Option<Value> {
        self.slots.borrow().get(offset as usize).copied()
    }

    pub fn set_slot(&self, offset: u32, value: Value) {
        if let Some(slot) = self.slots.borrow_mut().get_mut(offset as usize) {
            *slot = value;
        }
    }

    /// Move to `new` after adding the property at `offset`
    pub(crate) fn apply_transition(&self, new: &Rc<Structure>, offset: u32, value: Value) {
        {
            let mut slots = self.slots.borrow_mut();
            let offset = offset as usize;
            if offset >= slots.len() {
                slots.resize(offset + 1, 0);
            }
            slots[offset] = value;
        }
        *self.structure.borrow_mut() = new.clone();
    }

    /// Full lookup through the prototype chain
    pub fn lookup(&self, name: &str) -> PropertyLookup {
        let structure = self.structure();
        if let Some(offset) = structure.offset_of(name) {
            return PropertyLookup::Own { offset };
        }
        let mut depth = 1;
        let mut current = structure.prototype().cloned();
        while let Some(holder) = current {
            let holder_structure = holder.structure();
            if let Some(offset) = holder_structure.offset_of(name) {
                return PropertyLookup::Prototype { holder, holder_structure, depth, offset };
            }
            current = holder_structure.prototype().cloned();
            depth += 1;
        }
        PropertyLookup::Missing
    }

    /// Generic get
    pub fn get(&self, name: &str) -> Option<Value> {
        match self.lookup(name) {
            PropertyLookup::Own { offset } => self.slot(offset),
            PropertyLookup::Prototype { holder, offset, .. } => holder.slot(offset),
            PropertyLookup::Missing => None,
        }
    }

    /// Generic put: replace an own property or add one via a transition
    pub fn put(&self, table: &mut StructureTable, name: &str, value: Value) -> PutOutcome {
        let structure = self.structure();
        if let Some(offset) = structure.offset_of(name) {
            self.set_slot(offset, value);
            return PutOutcome::Replace { structure, offset };
        }
        let new = table.add_property_transition(&structure, name);
        let offset = structure.property_count() as u32;
        self.slots.borrow_mut().push(value);
        *self.structure.borrow_mut() = new.clone();
        PutOutcome::Transition { old: structure, new, offset }
    }

    /// Move this object onto a fresh dictionary structure
    pub fn convert_to_dictionary(&self, table: &mut StructureTable, cacheable: bool) {
        let old = self.structure();
        let mut flags = old.flags | StructureFlags::DICTIONARY;
        if !cacheable {
            flags |= StructureFlags::UNCACHEABLE_DICTIONARY;
        }
        let new = table.create(
            old.properties.clone(),
            old.prototype.clone(),
            Some(old.clone()),
            flags,
        );
        *self.structure.borrow_mut() = new;
    }
}

impl fmt::Debug for JsObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsObject")
            .field("structure", &self.structure.borrow().id)
            .field("slots", &self.slots.borrow())
            .finish()
    }
}

// ==================== Structure table ====================

/// Allocates structures and simulates their collection
#[derive(Default)]
pub struct StructureTable {
    next_id: u32,
    structures: FxHashMap<StructureId, Rc<Structure>>,
    killed: u64,
}

impl StructureTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn create(
        &mut self,
        properties: Vec<Rc<str>>,
        prototype: Option<Rc<JsObject>>,
        previous: Option<Rc<Structure>>,
        flags: StructureFlags,
    ) -> Rc<Structure> {
        self.next_id += 1;
        let structure = Rc::new(Structure {
            id: StructureId(self.next_id),
            properties,
            prototype,
            previous,
            flags,
            transitions: RefCell::new(FxHashMap::default()),
            live: Cell::new(true),
            watchpoints: RefCell::new(WatchpointSet::new()),
        });
        self.structures.insert(structure.id, structure.clone());
        structure
    }

    /// A structure with no properties
    pub fn create_root(&mut self, prototype: Option<Rc<JsObject>>) -> Rc<Structure> {
        self.create(Vec::new(), prototype, None, StructureFlags::empty())
    }

    /// A root structure with extra flags (exotic objects)
    pub fn create_root_with_flags(
        &mut self,
        prototype: Option<Rc<JsObject>>,
        flags: StructureFlags,
    ) -> Rc<Structure> {
        self.create(Vec::new(), prototype, None, flags)
    }

    /// A root structure that already has `properties`
    pub fn create_with_properties(
        &mut self,
        prototype: Option<Rc<JsObject>>,
        properties: &[&str],
    ) -> Rc<Structure> {
        let properties = properties.iter().map(|p| Rc::from(*p)).collect();
        self.create(properties, prototype, None, StructureFlags::empty())
    }

    /// Structure reached from `from` by adding `name`; shared unless `from` is a dictionary
    pub fn add_property_transition(&mut self, from: &Rc<Structure>, name: &str) -> Rc<Structure> {
        if !from.is_dictionary() {
            if let Some(existing) = from.transitions.borrow().get(name).and_then(Weak::upgrade) {
                if existing.is_live() {
                    return existing;
                }
            }
        }
        let mut properties = from.properties.clone();
        let name: Rc<str> = Rc::from(name);
        properties.push(name.clone());
        let next = self.create(properties, from.prototype.clone(), Some(from.clone()), from.flags);
        if !from.is_dictionary() {
            from.transitions.borrow_mut().insert(name, Rc::downgrade(&next));
        }
        next
    }

    pub fn get(&self, id: StructureId) -> Option<Rc<Structure>> {
        self.structures.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.structures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.structures.is_empty()
    }

    /// Structures killed so far
    pub fn killed(&self) -> u64 {
        self.killed
    }

    /// Kill and drop every structure for which `is_reachable` is false
    ///
    /// Returns the number of watchpoints fired.
    pub fn collect(&mut self, mut is_reachable: impl FnMut(&Structure) -> bool) -> usize {
        let dead: Vec<StructureId> = self
            .structures
            .values()
            .filter(|s| !is_reachable(s))
            .map(|s| s.id)
            .collect();
        let mut fired = 0;
        for id in dead {
            if let Some(structure) = self.structures.remove(&id) {
                fired += structure.kill();
                self.killed += 1;
                tracing::trace!(structure = %id, "structure collected");
            }
        }
        fired
    }
}

impl fmt::Debug for StructureTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructureTable")
            .field("live", &self.structures.len())
            .field("killed", &self.killed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_shared() {
        let mut table = StructureTable::new();
        let root = table.create_root(None);
        let a = JsObject::new(root.clone());
        let b = JsObject::new(root.clone());
        a.put(&mut table, "x", 1);
        b.put(&mut table, "x", 2);
        assert!(Rc::ptr_eq(&a.structure(), &b.structure()));
        assert_eq!(a.structure().offset_of("x"), Some(0));
        assert!(Rc::ptr_eq(a.structure().previous().unwrap(), &root));
    }

    #[test]
    fn test_put_replace_vs_transition() {
        let mut table = StructureTable::new();
        let obj = JsObject::new(table.create_root(None));
        assert!(matches!(obj.put(&mut table, "x", 1), PutOutcome::Transition { offset: 0, .. }));
        assert!(matches!(obj.put(&mut table, "x", 5), PutOutcome::Replace { offset: 0, .. }));
        assert_eq!(obj.get("x"), Some(5));
    }

    #[test]
    fn test_prototype_lookup_depth() {
        let mut table = StructureTable::new();
        let grand = JsObject::new(table.create_with_properties(None, &["g"]));
        grand.set_slot(0, 7);
        let parent = JsObject::new(table.create_root(Some(grand.clone())));
        let child = JsObject::new(table.create_root(Some(parent.clone())));
        match child.lookup("g") {
            PropertyLookup::Prototype { depth, offset, holder, .. } => {
                assert_eq!(depth, 2);
                assert_eq!(offset, 0);
                assert!(Rc::ptr_eq(&holder, &grand));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(child.get("g"), Some(7));
        assert!(matches!(child.lookup("nope"), PropertyLookup::Missing));
        assert_eq!(child.structure().prototype_chain().len(), 2);
    }

    #[test]
    fn test_chain_validity_tracks_prototype_structure() {
        let mut table = StructureTable::new();
        let proto = JsObject::new(table.create_root(None));
        let s = table.create_root(Some(proto.clone()));
        let chain = s.prototype_chain();
        assert!(chain.is_still_valid(&s));
        proto.put(&mut table, "y", 1);
        assert!(!chain.is_still_valid(&s));
    }

    #[test]
    fn test_uncacheable_flags() {
        let mut table = StructureTable::new();
        let obj = JsObject::new(table.create_root(None));
        assert!(obj.structure().is_cacheable());
        obj.convert_to_dictionary(&mut table, true);
        assert!(obj.structure().is_cacheable());
        obj.convert_to_dictionary(&mut table, false);
        assert!(!obj.structure().is_cacheable());
        let exotic = table.create_root_with_flags(None, StructureFlags::PROHIBITS_PROPERTY_CACHING);
        assert!(!exotic.is_cacheable());
    }

    #[test]
    fn test_collect_kills_and_fires() {
        use std::cell::Cell;
        struct Flag(Cell<bool>);
        impl Watchpoint for Flag {
            fn fire(&self) {
                self.0.set(true);
            }
        }

        let mut table = StructureTable::new();
        let keep = table.create_root(None);
        let doomed = table.create_root(None);
        let flag = Rc::new(Flag(Cell::new(false)));
        doomed.add_watchpoint(flag.clone());
        let keep_id = keep.id();
        let fired = table.collect(|s| s.id() == keep_id);
        assert_eq!(fired, 1);
        assert!(flag.0.get());
        assert!(!doomed.is_live());
        assert!(!doomed.is_cacheable());
        assert_eq!(table.len(), 1);
        assert_eq!(table.killed(), 1);
    }
}
