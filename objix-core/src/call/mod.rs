//! Call chain construction and caching.
//!
//! A call chain is the ordered list of method implementations one dispatch
//! will run: a contiguous prefix of filters followed by the implementation
//! suffix. Chains are built by a depth first walk over the receiver's
//! per object overlay, its mixins, and the transitively reachable class
//! hierarchy, then cached in two tiers: attached to the method name value
//! itself, and in the receiver's class. Cached chains are revalidated
//! against the foundation epoch and the receiver's epochs on every probe;
//! invalidation never touches a chain in flight.

pub mod invoke;


use crate::{
    Foundation, Host, KNOWN_STATE, MFlag, MFlags, ObjId, SPECIAL,
    object::{Method, Object},
};
use arcstr::ArcStr;
use enumflags2::{BitFlags, make_bitflags};
use fxhash::{FxHashMap, FxHashSet};
use log::debug;
use objix_value::Val;
use smallvec::SmallVec;
use std::collections::hash_map::Entry;
use triomphe::Arc;

use self::invoke::CallFrame;

/// entries a chain holds before spilling to the heap
const CHAIN_INLINE: usize = 4;

/// One step of a call chain.
#[derive(Debug)]
pub struct ChainEntry<H: Host> {
    pub method: Arc<Method<H>>,
    pub is_filter: bool,
    /// the class whose filter declaration put this entry here; None for
    /// object declared filters and for implementation entries
    pub filter_declarer: Option<ObjId>,
}

impl<H: Host> Clone for ChainEntry<H> {
    fn clone(&self) -> Self {
        Self {
            method: self.method.clone(),
            is_filter: self.is_filter,
            filter_declarer: self.filter_declarer,
        }
    }
}

/// An immutable, shareable call chain. The entries hold strong references
/// to their method records, so deleting a method (or its whole class)
/// while the chain runs cannot invalidate the remaining steps.
#[derive(Debug)]
pub struct CallChain<H: Host> {
    /// the receiver the chain was built for
    pub oid: ObjId,
    /// foundation epoch observed at build time; -1 marks a chain that
    /// must never be reused
    pub epoch: i64,
    pub object_creation_epoch: u64,
    pub object_epoch: u64,
    pub flags: MFlags,
    /// entries below this index are filters, the rest implementations
    pub filter_length: usize,
    pub entries: SmallVec<[ChainEntry<H>; CHAIN_INLINE]>,
}

impl<H: Host> CallChain<H> {
    fn new(fnd: &Foundation<H>, o: &Object<H>, flags: MFlags) -> Self {
        const KEEP: MFlags = make_bitflags!(MFlag::{
            Public | Private | Constructor | Destructor | FilterHandling
        });
        CallChain {
            oid: o.id,
            epoch: fnd.epoch,
            object_creation_epoch: o.creation_epoch,
            object_epoch: o.epoch,
            flags: flags & KEEP,
            filter_length: 0,
            entries: SmallVec::new(),
        }
    }

    /// Can this chain stand in for a fresh build for the given receiver
    /// state and request flags? A chain built for a public request also
    /// satisfies a non public request for the same name, but never the
    /// other way around.
    fn reusable(
        &self,
        fnd_epoch: i64,
        creation_epoch: u64,
        object_epoch: u64,
        flags: MFlags,
    ) -> bool {
        let mask: MFlags = if flags.contains(MFlag::Public) {
            BitFlags::all()
        } else {
            !MFlags::from(MFlag::Public)
        };
        self.object_creation_epoch == creation_epoch
            && self.epoch == fnd_epoch
            && self.object_epoch == object_epoch
            && (self.flags & mask) == (flags & mask)
    }
}

/// the internal representation a method name value carries once a chain
/// has been stashed on it
struct StashedChain<H: Host>(Arc<CallChain<H>>);

/// Attach the frame's chain to the method name value, so the next
/// dispatch through that value skips both cache tiers. Populated lazily
/// by the host when the name value is used to dispatch.
pub fn stash_chain_on_name<H: Host>(name: &Val, frame: &CallFrame<H>) {
    name.set_intrep(StashedChain(frame.chain.clone()))
}

struct ChainBuilder<'a, H: Host> {
    fnd: &'a Foundation<H>,
    /// the receiver's self class, fixed for the whole build
    self_cls: ObjId,
    chain: CallChain<H>,
    /// entries below this are filters and are never scanned by the
    /// lateness rule; stays 0 while the filter prefix itself is built
    filter_length: usize,
}

impl<'a, H: Host> ChainBuilder<'a, H> {
    fn new(fnd: &'a Foundation<H>, o: &Object<H>, flags: MFlags) -> Self {
        ChainBuilder {
            fnd,
            self_cls: o.self_cls,
            chain: CallChain::new(fnd, o, flags),
            filter_length: 0,
        }
    }

    /// Append one method record, enforcing the marker, privacy and
    /// lateness rules.
    fn add_method(
        &mut self,
        m: Option<&Arc<Method<H>>>,
        is_filter: bool,
        filter_declarer: Option<ObjId>,
    ) {
        let Some(m) = m else { return };
        if m.body.is_none() {
            // a visibility marker, nothing to call
            return;
        }
        // private methods are visible only to instances of the declaring
        // class itself
        if !self.chain.flags.contains(MFlag::Private)
            && m.flags().contains(MFlag::Private)
            && m.declaring_cls.is_some()
            && m.declaring_cls != Some(self.self_cls)
        {
            return;
        }
        // Methods land as late in the chain as possible: a record already
        // present with the same filter polarity moves to the end instead
        // of duplicating, keeping its original declaration context.
        let seek = self.filter_length..self.chain.entries.len();
        let dup = seek.into_iter().find(|i| {
            let e = &self.chain.entries[*i];
            Arc::ptr_eq(&e.method, m) && e.is_filter == is_filter
        });
        if let Some(i) = dup {
            let e = self.chain.entries.remove(i);
            self.chain.entries.push(e);
            return;
        }
        self.chain.entries.push(ChainEntry {
            method: m.clone(),
            is_filter,
            filter_declarer,
        });
    }

    /// Collect the filters contributed by `cls` and everything above it,
    /// mixins first, deduplicated by filter name across the whole filter
    /// phase.
    fn add_class_filters(&mut self, oid: ObjId, mut cls: ObjId, done: &mut FxHashSet<Val>) {
        let fnd = self.fnd;
        loop {
            let Ok(c) = fnd.cls(cls) else { return };
            for m in c.mixins.iter() {
                self.add_class_filters(oid, *m, done);
            }
            for f in c.filters.iter() {
                if done.insert(f.clone()) {
                    self.add_simple_chain(oid, Some(f), MFlags::empty(), true, Some(cls));
                }
            }
            match c.superclasses.len() {
                0 => return,
                1 => cls = c.superclasses[0],
                _ => {
                    for s in c.superclasses.iter() {
                        self.add_class_filters(oid, *s, done);
                    }
                    return;
                }
            }
        }
    }

    /// Add the implementation chain for one name on one object: the per
    /// object overlay shadows everything (and can refuse a public
    /// request outright), then mixins, then the object's own entry, then
    /// the self class hierarchy.
    fn add_simple_chain(
        &mut self,
        oid: ObjId,
        name: Option<&Val>,
        mut flags: MFlags,
        is_filter: bool,
        filter_declarer: Option<ObjId>,
    ) {
        let fnd = self.fnd;
        let Some(o) = fnd.obj(oid) else { return };
        if !flags.intersects(KNOWN_STATE | SPECIAL) {
            if let Some(m) = name.and_then(|n| o.methods.get(n)) {
                if flags.contains(MFlag::Public) {
                    if !m.is_public() {
                        return;
                    }
                    flags |= MFlag::DefinitePublic;
                } else {
                    flags |= MFlag::DefiniteProtected;
                }
            }
        }
        if !flags.intersects(SPECIAL) {
            for m in o.mixins.iter() {
                self.add_simple_class_chain(*m, name, flags, is_filter, filter_declarer);
            }
            if let Some(m) = name.and_then(|n| o.methods.get(n)) {
                self.add_method(Some(m), is_filter, filter_declarer);
            }
        }
        self.add_simple_class_chain(o.self_cls, name, flags, is_filter, filter_declarer);
    }

    /// Walk one class hierarchy branch. Single parent chains are walked
    /// iteratively; visibility decisions stick for the rest of the
    /// branch once made.
    fn add_simple_class_chain(
        &mut self,
        mut cls: ObjId,
        name: Option<&Val>,
        mut flags: MFlags,
        is_filter: bool,
        filter_declarer: Option<ObjId>,
    ) {
        let fnd = self.fnd;
        loop {
            let Ok(c) = fnd.cls(cls) else { return };
            if flags.contains(MFlag::Constructor) {
                self.add_method(c.constructor.as_ref(), is_filter, filter_declarer);
            } else if flags.contains(MFlag::Destructor) {
                self.add_method(c.destructor.as_ref(), is_filter, filter_declarer);
            } else if let Some(m) = name.and_then(|n| c.methods.get(n)) {
                if !flags.intersects(KNOWN_STATE) {
                    if flags.contains(MFlag::Public) {
                        if !m.is_public() {
                            return;
                        }
                        flags |= MFlag::DefinitePublic;
                    } else {
                        flags |= MFlag::DefiniteProtected;
                    }
                }
                self.add_method(Some(m), is_filter, filter_declarer);
            }
            for m in c.mixins.iter() {
                self.add_simple_class_chain(*m, name, flags, is_filter, filter_declarer);
            }
            match c.superclasses.len() {
                0 => return,
                1 => cls = c.superclasses[0],
                _ => {
                    for s in c.superclasses.iter() {
                        self.add_simple_class_chain(*s, name, flags, is_filter, filter_declarer);
                    }
                    return;
                }
            }
        }
    }
}

impl<H: Host> Foundation<H> {
    /// Materialize the call frame for invoking `name` on `oid` (pass no
    /// name with a constructor or destructor flag to get a special
    /// chain). Returns None when nothing at all would run, including no
    /// unknown handler. The chain comes from the name value's stashed
    /// rep or the class cache when a cached chain is still valid;
    /// special, filter handling and forced unknown chains are neither
    /// probed nor stored.
    pub fn get_call_frame(
        &mut self,
        oid: ObjId,
        name: Option<&Val>,
        flags: MFlags,
    ) -> Option<CallFrame<H>> {
        let (self_cls, creation_epoch, object_epoch, obj_flags) = {
            let o = self.objects.get(&oid)?;
            (o.self_cls, o.creation_epoch, o.epoch, o.flags)
        };
        let force_unknown = flags.contains(MFlag::ForceUnknown);
        let do_filters = !flags.intersects(SPECIAL | MFlags::from(MFlag::FilterHandling))
            && !obj_flags.contains(MFlag::FilterHandling)
            && !force_unknown;
        if do_filters {
            let name = name?;
            if let Some(chain) =
                name.with_intrep::<StashedChain<H>, _, _>(|s| s.0.clone())
            {
                if chain.reusable(self.epoch, creation_epoch, object_epoch, flags) {
                    debug!("chain for {name} reused from the name value");
                    return Some(CallFrame::new(chain));
                }
                name.clear_intrep();
            }
            let stale = match self.objects.get(&self_cls).and_then(|c| c.cls.as_ref()) {
                None => false,
                Some(cr) => match cr.chain_cache.get(name) {
                    None => false,
                    Some(chain)
                        if chain.reusable(
                            self.epoch,
                            creation_epoch,
                            object_epoch,
                            flags,
                        ) =>
                    {
                        debug!("chain for {name} reused from the class cache");
                        return Some(CallFrame::new(chain.clone()));
                    }
                    Some(_) => true,
                },
            };
            if stale {
                if let Some(cr) =
                    self.objects.get_mut(&self_cls).and_then(|c| c.cls.as_mut())
                {
                    cr.chain_cache.remove(name);
                }
            }
        }
        let (chain, cacheable) = {
            let fnd = &*self;
            let o = fnd.objects.get(&oid)?;
            let mut b = ChainBuilder::new(fnd, o, flags);
            if force_unknown {
                b.add_simple_chain(
                    oid,
                    Some(&fnd.unknown_method),
                    MFlags::empty(),
                    false,
                    None,
                );
                if b.chain.entries.is_empty() {
                    return None;
                }
                b.chain.flags |= MFlag::UnknownMethod;
                b.chain.epoch = -1;
                (b.chain, false)
            } else {
                if do_filters {
                    let mut done: FxHashSet<Val> = FxHashSet::default();
                    for m in o.mixins.iter() {
                        b.add_class_filters(oid, *m, &mut done);
                    }
                    for f in o.filters.iter() {
                        b.add_simple_chain(oid, Some(f), MFlags::empty(), true, None);
                    }
                    b.add_class_filters(oid, o.self_cls, &mut done);
                }
                let count = b.chain.entries.len();
                b.chain.filter_length = count;
                b.filter_length = count;
                b.add_simple_chain(oid, name, flags, false, None);
                if b.chain.entries.len() == count {
                    // Nothing implements the name. Constructor and
                    // destructor lookups just come back empty; anything
                    // else falls through to the unknown handler.
                    if flags.intersects(SPECIAL) {
                        return None;
                    }
                    debug!("no implementation, dispatching the unknown handler");
                    b.add_simple_chain(
                        oid,
                        Some(&fnd.unknown_method),
                        MFlags::empty(),
                        false,
                        None,
                    );
                    b.chain.flags |= MFlag::UnknownMethod;
                    b.chain.epoch = -1;
                    if b.chain.entries.len() == count {
                        return None;
                    }
                    (b.chain, false)
                } else {
                    (b.chain, do_filters)
                }
            }
        };
        let chain = Arc::new(chain);
        if cacheable {
            if let Some(name) = name {
                if let Some(cr) =
                    self.objects.get_mut(&self_cls).and_then(|c| c.cls.as_mut())
                {
                    cr.chain_cache.insert(name.clone(), chain.clone());
                }
            }
        }
        Some(CallFrame::new(chain))
    }

    /// Enumerate the method names visible on `oid`, byte wise sorted and
    /// deduplicated. A public request filters to exported names; a
    /// private request additionally includes the self class's private
    /// names.
    pub fn sorted_method_list(&self, oid: ObjId, flags: MFlags) -> Vec<ArcStr> {
        #[derive(Clone, Copy)]
        struct Wanted {
            in_list: bool,
            no_impl: bool,
        }
        fn add_class_method_names<H: Host>(
            fnd: &Foundation<H>,
            mut cls: ObjId,
            public_only: bool,
            names: &mut FxHashMap<Val, Wanted>,
        ) {
            if let Ok(c) = fnd.cls(cls) {
                for m in c.mixins.iter() {
                    add_class_method_names(fnd, *m, public_only, names);
                }
            }
            let c = loop {
                let Ok(c) = fnd.cls(cls) else { return };
                for (name, m) in c.methods.iter() {
                    match names.entry(name.clone()) {
                        Entry::Vacant(e) => {
                            e.insert(Wanted {
                                in_list: !public_only || m.is_public(),
                                no_impl: false,
                            });
                        }
                        Entry::Occupied(mut e) => {
                            if e.get().no_impl && m.body.is_some() {
                                e.get_mut().no_impl = false;
                            }
                        }
                    }
                }
                if c.superclasses.len() != 1 {
                    break c;
                }
                cls = c.superclasses[0];
            };
            for s in c.superclasses.iter() {
                add_class_method_names(fnd, *s, public_only, names);
            }
        }
        let Some(o) = self.obj(oid) else { return vec![] };
        let public_only = flags.contains(MFlag::Public);
        let private = flags.contains(MFlag::Private);
        let mut names: FxHashMap<Val, Wanted> = FxHashMap::default();
        for (name, m) in o.methods.iter() {
            if m.flags().contains(MFlag::Private) && !private {
                continue;
            }
            names.entry(name.clone()).or_insert_with(|| Wanted {
                in_list: !public_only || m.is_public(),
                no_impl: m.body.is_none(),
            });
        }
        if private {
            if let Ok(c) = self.cls(o.self_cls) {
                for (name, m) in c.methods.iter() {
                    if !m.flags().contains(MFlag::Private) {
                        continue;
                    }
                    match names.entry(name.clone()) {
                        Entry::Vacant(e) => {
                            e.insert(Wanted { in_list: true, no_impl: m.body.is_none() });
                        }
                        Entry::Occupied(mut e) => {
                            if m.body.is_some() {
                                e.get_mut().no_impl = false;
                            }
                        }
                    }
                }
            }
        }
        add_class_method_names(self, o.self_cls, public_only, &mut names);
        for m in o.mixins.iter() {
            add_class_method_names(self, *m, public_only, &mut names);
        }
        let mut t: Vec<ArcStr> = names
            .iter()
            .filter_map(|(name, w)| {
                if (!public_only || w.in_list) && !w.no_impl {
                    Some(name.repr().clone())
                } else {
                    None
                }
            })
            .collect();
        t.sort_unstable();
        t.dedup();
        t
    }
}
