//! The host value layer of the objix object system.
//!
//! A [`Val`] is the host's reference counted polymorphic value: a string
//! representation plus at most one attachable typed internal representation.
//! Equality and hashing are by identity, not by content; the host interns
//! method names as shared values (see [`Interner`]), so two looks of the
//! same name resolve to the same `Val` and identity keyed tables behave as
//! name keyed tables. Attaching an intrep of a new type drops the previous
//! one, whatever its type.

use arcstr::ArcStr;
use fxhash::FxHashMap;
use std::{
    any::Any,
    cell::RefCell,
    fmt,
    hash::{Hash, Hasher},
};
use triomphe::Arc;

struct ValInner {
    repr: ArcStr,
    intrep: RefCell<Option<Box<dyn Any>>>,
}

/// A reference counted host value. Cloning is cheap and shares both the
/// string representation and the internal representation.
#[derive(Clone)]
pub struct Val(Arc<ValInner>);

impl Val {
    pub fn new<S: Into<ArcStr>>(s: S) -> Self {
        Val(Arc::new(ValInner { repr: s.into(), intrep: RefCell::new(None) }))
    }

    pub fn as_str(&self) -> &str {
        &self.0.repr
    }

    pub fn repr(&self) -> &ArcStr {
        &self.0.repr
    }

    /// the identity of this value. Two `Val`s are the same value iff their
    /// ids are equal; this is what `Eq` and `Hash` use.
    pub fn id(&self) -> usize {
        &*self.0 as *const ValInner as usize
    }

    /// Attach a typed internal representation, dropping any previous one.
    pub fn set_intrep<T: Any>(&self, rep: T) {
        *self.0.intrep.borrow_mut() = Some(Box::new(rep));
    }

    /// Drop the internal representation, whatever its type.
    pub fn clear_intrep(&self) {
        *self.0.intrep.borrow_mut() = None;
    }

    /// Run `f` on the internal representation if one of type `T` is
    /// attached. The intrep is borrowed for the duration of `f`; do not
    /// attach or clear from inside it.
    pub fn with_intrep<T: Any, R, F: FnOnce(&T) -> R>(&self, f: F) -> Option<R> {
        let rep = self.0.intrep.borrow();
        rep.as_deref().and_then(|r| r.downcast_ref::<T>()).map(f)
    }

    pub fn has_intrep<T: Any>(&self) -> bool {
        self.with_intrep::<T, _, _>(|_| ()).is_some()
    }
}

impl PartialEq for Val {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(&*self.0, &*other.0)
    }
}

impl Eq for Val {}

impl Hash for Val {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state)
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.repr)
    }
}

impl fmt::Debug for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Val({:?}@{:x})", self.0.repr, self.id())
    }
}

impl From<&str> for Val {
    fn from(s: &str) -> Self {
        Val::new(s)
    }
}

impl From<ArcStr> for Val {
    fn from(s: ArcStr) -> Self {
        Val::new(s)
    }
}

/// The name interner. Values handed out for equal strings are the same
/// value, so identity equality on interned names is name equality.
#[derive(Debug, Default)]
pub struct Interner(FxHashMap<ArcStr, Val>);

impl Interner {
    pub fn new() -> Self {
        Interner(FxHashMap::default())
    }

    pub fn intern(&mut self, s: &str) -> Val {
        match self.0.get(s) {
            Some(v) => v.clone(),
            None => {
                let s = ArcStr::from(s);
                let v = Val::new(s.clone());
                self.0.insert(s, v.clone());
                v
            }
        }
    }

    /// lookup without creating. Mostly useful for introspection.
    pub fn get(&self, s: &str) -> Option<Val> {
        self.0.get(s).cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identity_not_content() {
        let a = Val::new("m");
        let b = Val::new("m");
        assert_eq!(a.as_str(), b.as_str());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn interner_shares() {
        let mut i = Interner::new();
        let a = i.intern("destroy");
        let b = i.intern("destroy");
        assert_eq!(a, b);
        assert_ne!(a, i.intern("create"));
        assert_eq!(i.get("destroy"), Some(a));
        assert_eq!(i.get("missing"), None);
    }

    #[test]
    fn intrep_replace() {
        let v = Val::new("m");
        assert!(!v.has_intrep::<u32>());
        v.set_intrep(42u32);
        assert_eq!(v.with_intrep::<u32, _, _>(|n| *n), Some(42));
        v.set_intrep(String::from("other type"));
        assert!(!v.has_intrep::<u32>());
        assert_eq!(
            v.with_intrep::<String, _, _>(|s| s.clone()).as_deref(),
            Some("other type")
        );
        v.clear_intrep();
        assert!(!v.has_intrep::<String>());
    }

    #[test]
    fn clone_shares_intrep() {
        let v = Val::new("m");
        let w = v.clone();
        v.set_intrep(7u8);
        assert_eq!(w.with_intrep::<u8, _, _>(|n| *n), Some(7));
    }
}
