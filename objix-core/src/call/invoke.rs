//! Stepping a call chain. One invocation runs exactly one entry; the
//! entry's implementation continues to the rest of the chain (or not) by
//! calling [`CallFrame::next`]. Because chain entries own strong
//! references to their method records, a definition command executed from
//! inside a running body can delete methods and classes freely without
//! disturbing the steps still to come.

use crate::{
    CallChain, ChainEntry, Foundation, Host, MFlag, MFlags, ObjId, object::MethodBody,
};
use anyhow::{Result, bail};
use log::trace;
use objix_value::Val;
use triomphe::Arc;

/// A live dispatch: a shared chain plus the position being executed and
/// the count of leading framework arguments (normally the object command
/// and the method name).
#[derive(Debug)]
pub struct CallFrame<H: Host> {
    pub chain: Arc<CallChain<H>>,
    pub index: usize,
    pub skip: usize,
}

impl<H: Host> CallFrame<H> {
    pub(crate) fn new(chain: Arc<CallChain<H>>) -> Self {
        CallFrame { chain, index: 0, skip: 2 }
    }

    /// the object the chain was built for
    pub fn receiver(&self) -> ObjId {
        self.chain.oid
    }

    pub fn current(&self) -> &ChainEntry<H> {
        &self.chain.entries[self.index]
    }

    /// Continue the dispatch with the next implementation in the chain,
    /// as a method body does when it wants the result of what it
    /// overrides (or, for a filter, of what it wraps). Stepping past the
    /// last entry is defined and returns an empty result.
    pub fn next(&self, host: &mut H, fnd: &mut Foundation<H>, argv: &[Val]) -> Result<Val> {
        if self.index + 1 >= self.chain.entries.len() {
            return Ok(Val::new(""));
        }
        let mut child =
            CallFrame { chain: self.chain.clone(), index: self.index + 1, skip: self.skip };
        invoke_frame(host, fnd, &mut child, argv)
    }
}

fn set_filter_handling<H: Host>(fnd: &mut Foundation<H>, oid: ObjId, on: bool) {
    if let Some(o) = fnd.obj_mut(oid) {
        if on {
            o.flags.insert(MFlag::FilterHandling);
        } else {
            o.flags.remove(MFlag::FilterHandling);
        }
    }
}

/// Invoke the single step of the chain that `frame` points at and return
/// the implementation's result verbatim.
pub fn invoke_frame<H: Host>(
    host: &mut H,
    fnd: &mut Foundation<H>,
    frame: &mut CallFrame<H>,
    argv: &[Val],
) -> Result<Val> {
    let entry = frame.current().clone();
    if frame.index == 0 && frame.chain.flags.contains(MFlag::UnknownMethod) {
        // the requested name must be visible to the unknown handler as
        // its first argument
        frame.skip -= 1;
    }
    trace!(
        "invoking step {} of the chain for {:?} (filter: {})",
        frame.index, frame.chain.oid, entry.is_filter
    );
    // Record whether the receiver was already running a filter and mark
    // it for this step; the flag steers chain construction for any
    // dispatch the body performs on the receiver.
    let oid = frame.chain.oid;
    let was_filter = fnd
        .obj(oid)
        .map(|o| o.flags.contains(MFlag::FilterHandling));
    let now_filter = entry.is_filter || frame.chain.flags.contains(MFlag::FilterHandling);
    set_filter_handling(fnd, oid, now_filter);
    let result = match entry.method.body.as_ref() {
        Some(MethodBody::Native(f)) => f(host, fnd, frame, argv),
        Some(MethodBody::Proc(p)) => host.eval_proc(fnd, frame, p, argv),
        Some(MethodBody::Forward(prefix)) => host.eval_forward(fnd, frame, prefix, argv),
        None => bail!("attempt to invoke a method with no implementation"),
    };
    if let Some(was) = was_filter {
        set_filter_handling(fnd, oid, was);
    }
    result
}

/// Resolve and run a method call in one step.
pub fn call_method<H: Host>(
    host: &mut H,
    fnd: &mut Foundation<H>,
    oid: ObjId,
    name: &Val,
    flags: MFlags,
    argv: &[Val],
) -> Result<Val> {
    match fnd.get_call_frame(oid, Some(name), flags) {
        Some(mut frame) => invoke_frame(host, fnd, &mut frame, argv),
        None => bail!(
            "impossible to invoke method \"{name}\": no defined method or unknown method"
        ),
    }
}
