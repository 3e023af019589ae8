//! The method resolution core of the objix object system.
//!
//! The host embeds a [`Foundation`], the per interpreter root of the object
//! world: an arena of objects (some of which carry class records), the
//! global invalidation epoch, and the name interner. Method dispatch goes
//! through [`Foundation::get_call_frame`], which materializes (or reuses
//! from cache) the ordered chain of implementations to run for one
//! invocation, and [`call::invoke::invoke_frame`], which steps it.
//!
//! Everything here is single threaded and cooperative; re-entrance (a
//! method body redefining the very class being dispatched) is the expected
//! case and is safe because chains hold strong references to the method
//! records they were built from.

pub mod call;
pub mod define;
pub mod object;
pub mod registry;

use crate::object::{Class, Object};
use anyhow::{Result, bail};
use arcstr::ArcStr;
use derive_builder::Builder;
use enumflags2::{BitFlags, bitflags, make_bitflags};
use fxhash::FxHashMap;
use objix_value::{Interner, Val};
use std::fmt::Debug;

pub use crate::{
    call::invoke::{CallFrame, call_method, invoke_frame},
    call::{CallChain, ChainEntry, stash_chain_on_name},
    object::{Method, MethodBody, NativeFn, ProcSpec},
};

macro_rules! atomic_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// allocate a process unique id
            pub fn new() -> Self {
                use std::sync::atomic::{AtomicU64, Ordering};
                static NEXT: AtomicU64 = AtomicU64::new(0);
                Self(NEXT.fetch_add(1, Ordering::Relaxed))
            }

            pub fn inner(&self) -> u64 {
                self.0
            }
        }
    };
}

atomic_id!(ObjId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[bitflags]
#[repr(u16)]
pub enum MFlag {
    /// the method is callable from anywhere
    Public,
    /// the method is callable only from instances of its declaring class
    Private,
    /// dispatch the constructor slot instead of a named method
    Constructor,
    /// dispatch the destructor slot instead of a named method
    Destructor,
    /// the receiver is currently executing a filter, so filters must not
    /// be applied again
    FilterHandling,
    /// builder internal: visibility on this branch already checked public
    DefinitePublic,
    /// builder internal: visibility on this branch already checked
    /// protected
    DefiniteProtected,
    /// request dispatch of the unknown handler even when the named method
    /// exists
    ForceUnknown,
    /// the chain dispatches the unknown handler in place of the requested
    /// name; such chains are never reusable
    UnknownMethod,
}

pub type MFlags = BitFlags<MFlag>;

/// chains dispatched by slot, not by name
pub const SPECIAL: MFlags = make_bitflags!(MFlag::{Constructor | Destructor});
/// the builder already made a visibility decision on this branch
pub const KNOWN_STATE: MFlags = make_bitflags!(MFlag::{DefinitePublic | DefiniteProtected});

/// The interpreter the object system is embedded in. Procedure bodies and
/// forwarding prefixes mean nothing to the core; when a chain step reaches
/// one, it is handed to the host for evaluation. The host gets the
/// foundation and the live frame back so the body can re-enter the core
/// (invoke further methods, run definition commands, call
/// [`CallFrame::next`]).
pub trait Host: Debug + Sized + 'static {
    /// Evaluate a procedure method body. `argv` is the full argument
    /// vector as seen by the dispatch; the first `frame.skip` entries are
    /// framework arguments (the object command and the method name).
    fn eval_proc(
        &mut self,
        fnd: &mut Foundation<Self>,
        frame: &mut CallFrame<Self>,
        spec: &ProcSpec,
        argv: &[Val],
    ) -> Result<Val>;

    /// Evaluate a forwarding method: `prefix` replaces the framework
    /// arguments and the remaining `argv` entries are appended.
    fn eval_forward(
        &mut self,
        fnd: &mut Foundation<Self>,
        frame: &mut CallFrame<Self>,
        prefix: &[Val],
        argv: &[Val],
    ) -> Result<Val>;
}

/// A host that supports only native methods. Dispatching a procedure or
/// forwarding method through it is an error.
#[derive(Debug)]
pub struct NoHost;

impl Host for NoHost {
    fn eval_proc(
        &mut self,
        _fnd: &mut Foundation<Self>,
        _frame: &mut CallFrame<Self>,
        _spec: &ProcSpec,
        _argv: &[Val],
    ) -> Result<Val> {
        bail!("this host does not evaluate procedure methods")
    }

    fn eval_forward(
        &mut self,
        _fnd: &mut Foundation<Self>,
        _frame: &mut CallFrame<Self>,
        _prefix: &[Val],
        _argv: &[Val],
    ) -> Result<Val> {
        bail!("this host does not evaluate forwarding methods")
    }
}

#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct FoundationCfg {
    /// name of the fallback handler dispatched when method lookup fails
    #[builder(default = "ArcStr::from(\"unknown\")")]
    pub unknown_method: ArcStr,
    /// namespace in which class definition scripts execute
    #[builder(default = "ArcStr::from(\"::objix::define\")")]
    pub define_ns: ArcStr,
    /// namespace in which per object definition scripts execute
    #[builder(default = "ArcStr::from(\"::objix::objdefine\")")]
    pub objdef_ns: ArcStr,
}

impl FoundationCfg {
    pub fn builder() -> FoundationCfgBuilder {
        FoundationCfgBuilder::default()
    }
}

impl Default for FoundationCfg {
    fn default() -> Self {
        Self::builder().build().expect("all cfg fields have defaults")
    }
}

/// The per interpreter root of the object system.
#[derive(Debug)]
pub struct Foundation<H: Host> {
    pub(crate) objects: FxHashMap<ObjId, Object<H>>,
    pub(crate) epoch: i64,
    pub(crate) creations: u64,
    pub(crate) interner: Interner,
    /// the root class every object derives from
    pub object_cls: ObjId,
    /// the class of classes
    pub class_cls: ObjId,
    /// the pre interned name of the unknown handler
    pub unknown_method: Val,
    /// namespace in which class definition scripts execute
    pub define_ns: ArcStr,
    /// namespace in which per object definition scripts execute
    pub objdef_ns: ArcStr,
}

impl<H: Host> Foundation<H> {
    /// Build the foundation and bootstrap the two root classes: the object
    /// class (instance of the class of classes, no superclass) and the
    /// class of classes (instance of itself, subclass of the object
    /// class).
    pub fn new(cfg: FoundationCfg) -> Self {
        let mut interner = Interner::new();
        let unknown_method = interner.intern(&cfg.unknown_method);
        let object_cls = ObjId::new();
        let class_cls = ObjId::new();
        let mut t = Foundation {
            objects: FxHashMap::default(),
            epoch: 1,
            creations: 1,
            interner,
            object_cls,
            class_cls,
            unknown_method,
            define_ns: cfg.define_ns,
            objdef_ns: cfg.objdef_ns,
        };
        let mut root = Object::new(object_cls, class_cls, t.next_creation());
        root.cls = Some(Class::new());
        let mut meta = Object::new(class_cls, class_cls, t.next_creation());
        meta.cls = Some(Class::new());
        t.objects.insert(object_cls, root);
        t.objects.insert(class_cls, meta);
        {
            let meta = t.objects.get_mut(&class_cls).unwrap().cls.as_mut().unwrap();
            meta.superclasses.push(object_cls);
            meta.instances.insert(object_cls);
            meta.instances.insert(class_cls);
        }
        let root = t.objects.get_mut(&object_cls).unwrap().cls.as_mut().unwrap();
        root.subclasses.insert(class_cls);
        t
    }

    pub(crate) fn next_creation(&mut self) -> u64 {
        let c = self.creations;
        self.creations += 1;
        c
    }

    /// the current global invalidation epoch
    pub fn epoch(&self) -> i64 {
        self.epoch
    }

    /// Intern a method name. Names handed to the dispatcher must come from
    /// here (or be shared with values that did); tables are keyed by value
    /// identity, and the interner is what makes identity mean equality.
    pub fn intern(&mut self, name: &str) -> Val {
        self.interner.intern(name)
    }

    pub fn obj(&self, id: ObjId) -> Option<&Object<H>> {
        self.objects.get(&id)
    }

    pub(crate) fn obj_mut(&mut self, id: ObjId) -> Option<&mut Object<H>> {
        self.objects.get_mut(&id)
    }

    pub(crate) fn expect_obj(&self, id: ObjId) -> Result<&Object<H>> {
        match self.objects.get(&id) {
            Some(o) => Ok(o),
            None => bail!("{id:?} does not refer to a live object"),
        }
    }

    pub(crate) fn cls(&self, id: ObjId) -> Result<&Class<H>> {
        match self.expect_obj(id)?.cls.as_ref() {
            Some(c) => Ok(c),
            None => bail!("{id:?} does not refer to a class"),
        }
    }

    pub(crate) fn cls_mut(&mut self, id: ObjId) -> Result<&mut Class<H>> {
        match self.objects.get_mut(&id) {
            None => bail!("{id:?} does not refer to a live object"),
            Some(o) => match o.cls.as_mut() {
                Some(c) => Ok(c),
                None => bail!("{id:?} does not refer to a class"),
            },
        }
    }

    pub fn is_class(&self, id: ObjId) -> bool {
        self.objects.get(&id).map(|o| o.cls.is_some()).unwrap_or(false)
    }

    /// Create a plain object as an instance of `cls`.
    pub fn new_object(&mut self, cls: ObjId) -> Result<ObjId> {
        self.cls(cls)?;
        let id = ObjId::new();
        let creation = self.next_creation();
        self.objects.insert(id, Object::new(id, cls, creation));
        self.add_to_instances(id, cls);
        Ok(id)
    }

    /// Create a new class. With no explicit superclasses the new class
    /// derives from the root object class.
    pub fn new_class(&mut self, superclasses: &[ObjId]) -> Result<ObjId> {
        for s in superclasses {
            self.cls(*s)?;
        }
        let id = self.new_object(self.class_cls)?;
        self.obj_mut(id).unwrap().cls = Some(Class::new());
        let supers = if superclasses.is_empty() {
            vec![self.object_cls]
        } else {
            Vec::from(superclasses)
        };
        self.set_superclasses(id, &supers)?;
        Ok(id)
    }

    /// Tear an object down and unlink it from everything that references
    /// it. A class can only be destroyed once nothing depends on it; the
    /// wider teardown protocol (reparenting, destructor invocation) is the
    /// host's business.
    pub fn destroy_object(&mut self, id: ObjId) -> Result<()> {
        if id == self.object_cls || id == self.class_cls {
            bail!("may not destroy the root classes of the object system")
        }
        let o = self.expect_obj(id)?;
        if let Some(cls) = &o.cls {
            if !cls.subclasses.is_empty()
                || !cls.instances.is_empty()
                || !cls.mixin_subs.is_empty()
            {
                bail!("class still has subclasses, instances or mixin subclasses")
            }
        }
        let self_cls = o.self_cls;
        let mixins = o.mixins.clone();
        let (supers, cls_mixins) = match &o.cls {
            Some(c) => (c.superclasses.clone(), c.mixins.clone()),
            None => (vec![], vec![]),
        };
        self.remove_from_instances(id, self_cls);
        for m in mixins {
            if m != self_cls {
                self.remove_from_instances(id, m);
            }
        }
        for s in supers {
            self.remove_from_subclasses(id, s);
        }
        for m in cls_mixins {
            self.remove_from_mixin_subs(id, m);
        }
        self.objects.remove(&id);
        Ok(())
    }
}
