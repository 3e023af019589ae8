//! Mutation hooks for the definition layer. Each edit updates both sides
//! of every relationship it touches before returning, validates before
//! the first structural change (rejected edits leave the world exactly as
//! it was), and finishes by bumping whichever epoch invalidates the
//! cached chains the edit could have affected.

use crate::{
    Foundation, Host, MFlag, MFlags, ObjId,
    object::{Method, MethodBody},
};
use anyhow::{Result, bail};
use fxhash::FxHashMap;
use log::{debug, trace};
use objix_value::Val;
use triomphe::Arc;

impl<H: Host> Foundation<H> {
    /// Invalidate chains after an edit to `cls`. A class with no
    /// subclasses, no instances and no mixin subclasses appears in no
    /// cached chain except possibly its own representative object's, so
    /// the global epoch is left alone for it; the representative's epoch
    /// is touched when that object has mixins of its own.
    pub(crate) fn bump_global_epoch(&mut self, cls: Option<ObjId>) {
        if let Some(id) = cls {
            if let Some(o) = self.objects.get(&id) {
                if let Some(c) = &o.cls {
                    if c.subclasses.is_empty()
                        && c.instances.is_empty()
                        && c.mixin_subs.is_empty()
                    {
                        if !o.mixins.is_empty() {
                            self.objects.get_mut(&id).unwrap().epoch += 1;
                        }
                        return;
                    }
                }
            }
        }
        self.epoch += 1;
        trace!("global epoch is now {}", self.epoch);
    }

    /// Define (or redefine) a method on a class.
    pub fn define_method(
        &mut self,
        cls: ObjId,
        name: &Val,
        flags: MFlags,
        body: MethodBody<H>,
    ) -> Result<()> {
        let m = Arc::new(Method::new(Some(cls), flags, Some(body)));
        self.cls_mut(cls)?.methods.insert(name.clone(), m);
        debug!("defined method {name} on class {cls:?}");
        self.epoch += 1;
        Ok(())
    }

    /// Remove a method from a class. Removing a name with no record is a
    /// no-op. Chains already running the method keep their reference to
    /// it and finish normally.
    pub fn delete_method(&mut self, cls: ObjId, name: &Val) -> Result<()> {
        if self.cls_mut(cls)?.methods.remove(name).is_some() {
            self.epoch += 1;
        }
        Ok(())
    }

    /// Define (or redefine) a method on the object's own overlay.
    pub fn define_object_method(
        &mut self,
        oid: ObjId,
        name: &Val,
        flags: MFlags,
        body: MethodBody<H>,
    ) -> Result<()> {
        let m = Arc::new(Method::new(None, flags, Some(body)));
        match self.obj_mut(oid) {
            None => bail!("{oid:?} does not refer to a live object"),
            Some(o) => {
                o.methods.insert(name.clone(), m);
            }
        }
        debug!("defined method {name} on object {oid:?}");
        self.epoch += 1;
        Ok(())
    }

    pub fn delete_object_method(&mut self, oid: ObjId, name: &Val) -> Result<()> {
        let removed = match self.obj_mut(oid) {
            None => bail!("{oid:?} does not refer to a live object"),
            Some(o) => o.methods.remove(name).is_some(),
        };
        if removed {
            self.epoch += 1;
        }
        Ok(())
    }

    fn set_visibility(
        table: &mut FxHashMap<Val, Arc<Method<H>>>,
        declaring_cls: Option<ObjId>,
        name: &Val,
        public: bool,
    ) {
        match table.get(name) {
            Some(m) => m.set_public(public),
            None => {
                // no record yet: leave a bodyless marker carrying the
                // visibility decision so a later definition inherits it
                let flags = if public {
                    MFlags::from(MFlag::Public)
                } else {
                    MFlags::empty()
                };
                table.insert(name.clone(), Arc::new(Method::marker(declaring_cls, flags)));
            }
        }
    }

    pub fn export_class_methods(&mut self, cls: ObjId, names: &[Val]) -> Result<()> {
        let table = &mut self.cls_mut(cls)?.methods;
        for name in names {
            Self::set_visibility(table, Some(cls), name, true);
        }
        self.bump_global_epoch(Some(cls));
        Ok(())
    }

    pub fn unexport_class_methods(&mut self, cls: ObjId, names: &[Val]) -> Result<()> {
        let table = &mut self.cls_mut(cls)?.methods;
        for name in names {
            Self::set_visibility(table, Some(cls), name, false);
        }
        self.bump_global_epoch(Some(cls));
        Ok(())
    }

    pub fn export_object_methods(&mut self, oid: ObjId, names: &[Val]) -> Result<()> {
        match self.obj_mut(oid) {
            None => bail!("{oid:?} does not refer to a live object"),
            Some(o) => {
                for name in names {
                    Self::set_visibility(&mut o.methods, None, name, true);
                }
                o.epoch += 1;
            }
        }
        Ok(())
    }

    pub fn unexport_object_methods(&mut self, oid: ObjId, names: &[Val]) -> Result<()> {
        match self.obj_mut(oid) {
            None => bail!("{oid:?} does not refer to a live object"),
            Some(o) => {
                for name in names {
                    Self::set_visibility(&mut o.methods, None, name, false);
                }
                o.epoch += 1;
            }
        }
        Ok(())
    }

    /// Replace the object's filter list. Only this object's chains are
    /// affected.
    pub fn set_object_filters(&mut self, oid: ObjId, filters: Vec<Val>) -> Result<()> {
        match self.obj_mut(oid) {
            None => bail!("{oid:?} does not refer to a live object"),
            Some(o) => {
                o.filters = filters;
                o.epoch += 1;
            }
        }
        Ok(())
    }

    /// Replace a class's filter list. Many objects may be affected.
    pub fn set_class_filters(&mut self, cls: ObjId, filters: Vec<Val>) -> Result<()> {
        self.cls_mut(cls)?.filters = filters;
        self.bump_global_epoch(Some(cls));
        Ok(())
    }

    /// Replace the object's mixin list. The object registers as an
    /// instance of each mixed in class (unless the mixin is its own self
    /// class, which already tracks it).
    pub fn set_object_mixins(&mut self, oid: ObjId, mixins: &[ObjId]) -> Result<()> {
        self.expect_obj(oid)?;
        for m in mixins {
            if !self.is_class(*m) {
                bail!("may only mix in classes: {m:?} is not a class")
            }
        }
        let (self_cls, old) = {
            let o = self.obj(oid).unwrap();
            (o.self_cls, o.mixins.clone())
        };
        for m in old {
            if m != self_cls {
                self.remove_from_instances(oid, m);
            }
        }
        self.obj_mut(oid).unwrap().mixins = Vec::from(mixins);
        for m in mixins {
            if *m != self_cls {
                self.add_to_instances(oid, *m);
            }
        }
        self.obj_mut(oid).unwrap().epoch += 1;
        Ok(())
    }

    /// Replace a class's mixin list.
    pub fn set_class_mixins(&mut self, cls: ObjId, mixins: &[ObjId]) -> Result<()> {
        self.cls(cls)?;
        for m in mixins {
            if !self.is_class(*m) {
                bail!("may only mix in classes: {m:?} is not a class")
            }
            if self.is_reachable(*m, cls) {
                bail!("may not mix a class into itself")
            }
        }
        let old = self.cls(cls).unwrap().mixins.clone();
        for m in old {
            self.remove_from_mixin_subs(cls, m);
        }
        self.cls_mut(cls).unwrap().mixins = Vec::from(mixins);
        for m in mixins {
            self.add_to_mixin_subs(cls, *m);
        }
        self.bump_global_epoch(Some(cls));
        Ok(())
    }

    /// Replace a class's superclass list, splicing the class out of its
    /// old superclasses' subclass sets and into the new ones'.
    pub fn set_superclasses(&mut self, cls: ObjId, superclasses: &[ObjId]) -> Result<()> {
        if self.expect_obj(cls)?.cls.is_none() {
            bail!("only classes may have superclasses defined")
        }
        if cls == self.object_cls {
            bail!("may not modify the superclass of the root object")
        }
        for (i, s) in superclasses.iter().enumerate() {
            if !self.is_class(*s) {
                bail!("only a class can be a superclass")
            }
            if superclasses[..i].contains(s) {
                bail!("class should only be a direct superclass once")
            }
            if self.is_reachable(*s, cls) {
                bail!("attempt to form circular dependency graph")
            }
        }
        let old = self.cls(cls).unwrap().superclasses.clone();
        for s in old {
            self.remove_from_subclasses(cls, s);
        }
        self.cls_mut(cls).unwrap().superclasses = Vec::from(superclasses);
        for s in superclasses {
            self.add_to_subclasses(cls, *s);
        }
        self.bump_global_epoch(Some(cls));
        Ok(())
    }

    /// Change which class an object is an instance of. Classes and non
    /// classes are not interchangeable: an object may not move to a class
    /// that would change its nature.
    pub fn set_self_class(&mut self, oid: ObjId, cls: ObjId) -> Result<()> {
        if oid == self.object_cls {
            bail!("may not modify the class of the root object")
        }
        if oid == self.class_cls {
            bail!("may not modify the class of the class of classes")
        }
        if !self.is_class(cls) {
            bail!("the class of an object must be a class")
        }
        let is_class_obj = self.expect_obj(oid)?.cls.is_some();
        let makes_classes = self.is_reachable(cls, self.class_cls);
        if is_class_obj != makes_classes {
            if is_class_obj {
                bail!("may not change a class object into a non-class object")
            } else {
                bail!("may not change a non-class object into a class object")
            }
        }
        let old = self.obj(oid).unwrap().self_cls;
        if old != cls {
            self.remove_from_instances(oid, old);
            self.obj_mut(oid).unwrap().self_cls = cls;
            self.add_to_instances(oid, cls);
            if is_class_obj {
                self.bump_global_epoch(Some(oid));
            } else {
                self.obj_mut(oid).unwrap().epoch += 1;
            }
        }
        Ok(())
    }

    /// Install or clear a class's constructor. Constructor chains are
    /// never cached, so no epoch moves.
    pub fn set_constructor(&mut self, cls: ObjId, body: Option<MethodBody<H>>) -> Result<()> {
        let m = body.map(|b| Arc::new(Method::new(Some(cls), MFlag::Public.into(), Some(b))));
        self.cls_mut(cls)?.constructor = m;
        Ok(())
    }

    /// Install or clear a class's destructor. Destructor chains are never
    /// cached, so no epoch moves.
    pub fn set_destructor(&mut self, cls: ObjId, body: Option<MethodBody<H>>) -> Result<()> {
        let m = body.map(|b| Arc::new(Method::new(Some(cls), MFlag::Public.into(), Some(b))));
        self.cls_mut(cls)?.destructor = m;
        Ok(())
    }
}
