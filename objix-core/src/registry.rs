//! Maintenance of the bidirectional relationship links between classes,
//! their superclasses, their instances, and the classes they are mixed
//! into. Every forward edge (a superclass list, a mixin list, a self
//! class reference) is mirrored by a back link set on the other side;
//! both sides are always updated before an edit returns.

use crate::{Foundation, Host, ObjId};
use fxhash::FxHashSet;
use smallvec::SmallVec;

impl<H: Host> Foundation<H> {
    pub(crate) fn add_to_subclasses(&mut self, sub: ObjId, sup: ObjId) {
        if let Ok(c) = self.cls_mut(sup) {
            c.subclasses.insert(sub);
        }
    }

    pub(crate) fn remove_from_subclasses(&mut self, sub: ObjId, sup: ObjId) {
        if let Ok(c) = self.cls_mut(sup) {
            c.subclasses.remove(&sub);
        }
    }

    pub(crate) fn add_to_instances(&mut self, o: ObjId, cls: ObjId) {
        if let Ok(c) = self.cls_mut(cls) {
            c.instances.insert(o);
        }
    }

    pub(crate) fn remove_from_instances(&mut self, o: ObjId, cls: ObjId) {
        if let Ok(c) = self.cls_mut(cls) {
            c.instances.remove(&o);
        }
    }

    pub(crate) fn add_to_mixin_subs(&mut self, sub: ObjId, mixin: ObjId) {
        if let Ok(c) = self.cls_mut(mixin) {
            c.mixin_subs.insert(sub);
        }
    }

    pub(crate) fn remove_from_mixin_subs(&mut self, sub: ObjId, mixin: ObjId) {
        if let Ok(c) = self.cls_mut(mixin) {
            c.mixin_subs.remove(&sub);
        }
    }

    /// Is `target` reachable from the class `from` over superclass and
    /// mixin edges? Used to reject edits that would close a cycle; the
    /// visited set guarantees termination even while a (rejected) cycle
    /// is being proposed.
    pub fn is_reachable(&self, from: ObjId, target: ObjId) -> bool {
        let mut visited = FxHashSet::default();
        let mut stack: SmallVec<[ObjId; 8]> = SmallVec::new();
        stack.push(from);
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if let Ok(c) = self.cls(id) {
                stack.extend(c.superclasses.iter().copied());
                stack.extend(c.mixins.iter().copied());
            }
        }
        false
    }
}
