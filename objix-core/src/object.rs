use crate::{CallChain, CallFrame, Foundation, Host, MFlag, MFlags, ObjId};
use anyhow::Result;
use arcstr::ArcStr;
use fxhash::{FxHashMap, FxHashSet};
use objix_value::Val;
use std::{cell::Cell, fmt, sync};
use triomphe::Arc;

/// A native method implementation. The body receives the host, the
/// foundation, the live call frame, and the full argument vector (the
/// first `frame.skip` entries are framework arguments).
pub type NativeFn<H> = sync::Arc<
    dyn for<'a, 'b, 'c> Fn(
        &'a mut H,
        &'b mut Foundation<H>,
        &'c mut CallFrame<H>,
        &[Val],
    ) -> Result<Val>,
>;

/// A procedure method body: formal argument names plus an unevaluated
/// body value. The core never looks inside; the host evaluates it.
#[derive(Debug, Clone)]
pub struct ProcSpec {
    pub args: Arc<[ArcStr]>,
    pub body: Val,
}

/// The polymorphic call descriptor of a method record.
pub enum MethodBody<H: Host> {
    /// a scripted procedure, evaluated by the host
    Proc(Arc<ProcSpec>),
    /// dispatch is rewritten onto this command prefix
    Forward(Arc<[Val]>),
    /// a native implementation
    Native(NativeFn<H>),
}

impl<H: Host> Clone for MethodBody<H> {
    fn clone(&self) -> Self {
        match self {
            MethodBody::Proc(p) => MethodBody::Proc(p.clone()),
            MethodBody::Forward(p) => MethodBody::Forward(p.clone()),
            MethodBody::Native(f) => MethodBody::Native(f.clone()),
        }
    }
}

impl<H: Host> fmt::Debug for MethodBody<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodBody::Proc(p) => write!(f, "Proc({:?})", p.args),
            MethodBody::Forward(p) => write!(f, "Forward({p:?})"),
            MethodBody::Native(_) => write!(f, "Native(..)"),
        }
    }
}

/// A method record. A record with no body is a visibility marker only: it
/// flips the public bit of a name without providing an implementation,
/// and never appears in a built chain.
pub struct Method<H: Host> {
    /// the class that declared the record; None when declared directly on
    /// an object
    pub declaring_cls: Option<ObjId>,
    flags: Cell<MFlags>,
    pub body: Option<MethodBody<H>>,
}

impl<H: Host> fmt::Debug for Method<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Method {{ declaring_cls: {:?}, flags: {:?}, body: {:?} }}",
            self.declaring_cls,
            self.flags.get(),
            self.body
        )
    }
}

impl<H: Host> Method<H> {
    pub fn new(
        declaring_cls: Option<ObjId>,
        flags: MFlags,
        body: Option<MethodBody<H>>,
    ) -> Self {
        Method { declaring_cls, flags: Cell::new(flags), body }
    }

    /// a marker record carrying only a visibility decision
    pub(crate) fn marker(declaring_cls: Option<ObjId>, flags: MFlags) -> Self {
        Self::new(declaring_cls, flags, None)
    }

    pub fn flags(&self) -> MFlags {
        self.flags.get()
    }

    pub fn is_public(&self) -> bool {
        self.flags.get().contains(MFlag::Public)
    }

    /// Visibility is updated in place so that records already referenced
    /// by built chains observe the change on the next build.
    pub(crate) fn set_public(&self, public: bool) {
        let mut t = self.flags.get();
        if public {
            t.insert(MFlag::Public);
        } else {
            t.remove(MFlag::Public);
        }
        self.flags.set(t);
    }
}

/// The class record of an object that is a class. Owned by its
/// representative object; `subclasses`, `instances` and `mixin_subs` are
/// back links kept in lockstep with the forward edges they mirror.
#[derive(Debug)]
pub struct Class<H: Host> {
    pub methods: FxHashMap<Val, Arc<Method<H>>>,
    pub superclasses: Vec<ObjId>,
    pub subclasses: FxHashSet<ObjId>,
    pub instances: FxHashSet<ObjId>,
    pub mixins: Vec<ObjId>,
    pub mixin_subs: FxHashSet<ObjId>,
    pub filters: Vec<Val>,
    pub constructor: Option<Arc<Method<H>>>,
    pub destructor: Option<Arc<Method<H>>>,
    /// chains built for instances of this class, keyed by method name
    pub(crate) chain_cache: FxHashMap<Val, Arc<CallChain<H>>>,
}

impl<H: Host> Class<H> {
    pub(crate) fn new() -> Self {
        Class {
            methods: FxHashMap::default(),
            superclasses: Vec::new(),
            subclasses: FxHashSet::default(),
            instances: FxHashSet::default(),
            mixins: Vec::new(),
            mixin_subs: FxHashSet::default(),
            filters: Vec::new(),
            constructor: None,
            destructor: None,
            chain_cache: FxHashMap::default(),
        }
    }

    /// Drop every cached chain. The epoch machinery makes stale entries
    /// unreusable on its own; this just returns the memory.
    pub fn flush_chain_cache(&mut self) {
        self.chain_cache.clear();
    }
}

/// A live object. Every class is also an object; `cls` is the class
/// record for those that are.
#[derive(Debug)]
pub struct Object<H: Host> {
    pub id: ObjId,
    pub self_cls: ObjId,
    /// the per object method overlay
    pub methods: FxHashMap<Val, Arc<Method<H>>>,
    pub mixins: Vec<ObjId>,
    pub filters: Vec<Val>,
    pub cls: Option<Class<H>>,
    /// assigned at birth, never changes
    pub creation_epoch: u64,
    /// bumped by edits that invalidate only this object's chains
    pub epoch: u64,
    pub flags: MFlags,
}

impl<H: Host> Object<H> {
    pub(crate) fn new(id: ObjId, self_cls: ObjId, creation_epoch: u64) -> Self {
        Object {
            id,
            self_cls,
            methods: FxHashMap::default(),
            mixins: Vec::new(),
            filters: Vec::new(),
            cls: None,
            creation_epoch,
            epoch: 0,
            flags: MFlags::empty(),
        }
    }
}
