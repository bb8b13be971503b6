//! Transaction frames and the per-connection nesting stack.
//!
//! Every `transaction()` call that opens a boundary pushes one
//! [`TransactionFrame`]. The stack is strictly LIFO: a frame is only ever
//! settled once every frame above it has been settled, or, for frames left
//! behind by a cancelled body, unwound together with it.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::backend::IsolationLevel;

use super::cancel::CancellationBridge;

/// Identifier of a frame. Never reused on a coordinator.
pub type FrameId = u64;

/// Lifecycle state of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Innermost open frame; the only one statements may go through.
    Active,
    /// Open, but a child frame is running.
    Suspended,
    /// Committed (root) or released (savepoint).
    Committed,
    /// Rolled back because its body failed.
    RolledBack,
    /// Cancelled, or its closing statement failed. Accepts nothing further.
    Aborted,
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FrameState::Active => "active",
            FrameState::Suspended => "suspended",
            FrameState::Committed => "committed",
            FrameState::RolledBack => "rolled back",
            FrameState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// One level of the nesting stack.
#[derive(Debug, Clone)]
pub struct TransactionFrame {
    pub(crate) id: FrameId,
    pub(crate) depth: usize,
    pub(crate) savepoint: Option<String>,
    pub(crate) cancellation: Option<CancellationBridge>,
    pub(crate) state: FrameState,
    pub(crate) parent: Option<FrameId>,
    pub(crate) isolation: Option<IsolationLevel>,
    pub(crate) started_at: DateTime<Utc>,
}

impl TransactionFrame {
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// 0 for the root frame.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    /// Savepoint backing this frame, if it is a nested frame.
    pub fn savepoint(&self) -> Option<&str> {
        self.savepoint.as_deref()
    }

    pub fn has_cancellation(&self) -> bool {
        self.cancellation.is_some()
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn parent(&self) -> Option<FrameId> {
        self.parent
    }

    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Ordered frames of one logical connection.
#[derive(Debug, Default)]
pub struct TransactionStack {
    frames: Vec<TransactionFrame>,
    root_id: Option<String>,
    /// First nested frame whose closing statement failed under this root.
    poisoned_by: Option<FrameId>,
    next_id: FrameId,
}

impl TransactionStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of open frames; also the depth the next frame would get.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Id of the open root transaction.
    pub fn root_id(&self) -> Option<&str> {
        self.root_id.as_deref()
    }

    /// Innermost open frame.
    pub fn current(&self) -> Option<&TransactionFrame> {
        self.frames.last()
    }

    pub fn frames(&self) -> &[TransactionFrame] {
        &self.frames
    }

    /// The nested frame whose failed close left the root transaction
    /// holding work it can no longer separate out. Such a root must not
    /// commit.
    pub fn poisoned_by(&self) -> Option<FrameId> {
        self.poisoned_by
    }

    pub(crate) fn poison(&mut self, id: FrameId) {
        if !self.frames.is_empty() && self.poisoned_by.is_none() {
            self.poisoned_by = Some(id);
        }
    }

    /// Whether `id` is the innermost frame and is accepting work.
    pub fn is_current(&self, id: FrameId) -> bool {
        self.current()
            .is_some_and(|f| f.id == id && f.state == FrameState::Active)
    }

    pub(crate) fn push_root(
        &mut self,
        root_id: String,
        isolation: Option<IsolationLevel>,
        cancellation: Option<CancellationBridge>,
    ) -> FrameId {
        debug_assert!(self.frames.is_empty(), "root pushed onto a non-empty stack");
        self.root_id = Some(root_id);
        self.push(None, isolation, cancellation)
    }

    pub(crate) fn push_nested(
        &mut self,
        savepoint: Option<String>,
        cancellation: Option<CancellationBridge>,
    ) -> FrameId {
        let parent = self.frames.last_mut().map(|f| {
            f.state = FrameState::Suspended;
            f.id
        });
        let isolation = self.frames.first().and_then(|f| f.isolation);
        let id = self.push(parent, isolation, cancellation);
        if let Some(frame) = self.frames.last_mut() {
            frame.savepoint = savepoint;
        }
        id
    }

    fn push(
        &mut self,
        parent: Option<FrameId>,
        isolation: Option<IsolationLevel>,
        cancellation: Option<CancellationBridge>,
    ) -> FrameId {
        let id = self.next_id;
        self.next_id += 1;
        self.frames.push(TransactionFrame {
            id,
            depth: self.frames.len(),
            savepoint: None,
            cancellation,
            state: FrameState::Active,
            parent,
            isolation,
            started_at: Utc::now(),
        });
        id
    }

    /// Move frame `id` to its final `state` ahead of its closing statement.
    ///
    /// Frames still above it were left open by a detached body; they are
    /// marked aborted and dropped, since closing `id` discards their work.
    /// Returns the settled frame, or `None` if it was already unwound.
    pub(crate) fn settle(
        &mut self,
        id: FrameId,
        state: FrameState,
    ) -> Option<(TransactionFrame, Vec<TransactionFrame>)> {
        let index = self.frames.iter().position(|f| f.id == id)?;
        let mut orphans = self.frames.split_off(index + 1);
        for orphan in &mut orphans {
            orphan.state = FrameState::Aborted;
        }
        let frame = &mut self.frames[index];
        frame.state = state;
        Some((frame.clone(), orphans))
    }

    pub(crate) fn set_state(&mut self, id: FrameId, state: FrameState) {
        if let Some(frame) = self.frames.iter_mut().find(|f| f.id == id) {
            frame.state = state;
        }
    }

    /// Remove frame `id` if it is the innermost one and resume its parent.
    pub(crate) fn pop(&mut self, id: FrameId) -> Option<TransactionFrame> {
        if self.current().map(|f| f.id) != Some(id) {
            return None;
        }
        let frame = self.frames.pop();
        match self.frames.last_mut() {
            Some(parent) if parent.state == FrameState::Suspended => {
                parent.state = FrameState::Active;
            }
            Some(_) => {}
            None => {
                self.root_id = None;
                self.poisoned_by = None;
            }
        }
        frame
    }

    /// Check the stack discipline: depths match positions, every frame but
    /// the innermost is suspended, and the innermost is the only one that
    /// may be active.
    pub fn is_consistent(&self) -> bool {
        let depths_ok = self.frames.iter().enumerate().all(|(i, f)| f.depth == i);
        let parents_ok = self
            .frames
            .windows(2)
            .all(|w| w[1].parent == Some(w[0].id) && w[0].state == FrameState::Suspended);
        let active = self
            .frames
            .iter()
            .filter(|f| f.state == FrameState::Active)
            .count();
        let root_ok = self.frames.is_empty() == self.root_id.is_none();
        depths_ok && parents_ok && active <= 1 && root_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack_with(depth: usize) -> (TransactionStack, Vec<FrameId>) {
        let mut stack = TransactionStack::new();
        let mut ids = vec![stack.push_root("root".into(), None, None)];
        for d in 1..depth {
            ids.push(stack.push_nested(Some(format!("sp_root_{}", d)), None));
        }
        (stack, ids)
    }

    #[test]
    fn test_push_suspends_parent() {
        let (stack, ids) = stack_with(3);
        assert_eq!(stack.len(), 3);
        assert!(stack.is_consistent());
        assert!(stack.is_current(ids[2]));
        assert!(!stack.is_current(ids[1]));
        assert_eq!(stack.frames()[0].state(), FrameState::Suspended);
        assert_eq!(stack.current().unwrap().parent(), Some(ids[1]));
        assert_eq!(stack.current().unwrap().savepoint(), Some("sp_root_2"));
    }

    #[test]
    fn test_pop_resumes_parent() {
        let (mut stack, ids) = stack_with(2);
        stack.settle(ids[1], FrameState::Committed).unwrap();
        assert!(!stack.is_current(ids[1]));
        let popped = stack.pop(ids[1]).unwrap();
        assert_eq!(popped.state(), FrameState::Committed);
        assert!(stack.is_current(ids[0]));
        assert!(stack.is_consistent());

        stack.settle(ids[0], FrameState::Committed).unwrap();
        stack.pop(ids[0]).unwrap();
        assert!(stack.is_empty());
        assert_eq!(stack.root_id(), None);
    }

    #[test]
    fn test_pop_refuses_non_innermost() {
        let (mut stack, ids) = stack_with(2);
        assert!(stack.pop(ids[0]).is_none());
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn test_settle_unwinds_orphans() {
        let (mut stack, ids) = stack_with(4);
        let (frame, orphans) = stack.settle(ids[1], FrameState::Aborted).unwrap();
        assert_eq!(frame.depth(), 1);
        assert_eq!(orphans.len(), 2);
        assert!(orphans.iter().all(|f| f.state() == FrameState::Aborted));
        assert_eq!(stack.len(), 2);
        stack.pop(ids[1]).unwrap();
        assert!(stack.is_current(ids[0]));
        assert!(stack.settle(ids[3], FrameState::Aborted).is_none());
    }

    #[test]
    fn test_ids_are_never_reused() {
        let (mut stack, ids) = stack_with(1);
        stack.settle(ids[0], FrameState::RolledBack);
        stack.pop(ids[0]);
        let next = stack.push_root("again".into(), None, None);
        assert!(next > ids[0]);
    }

    #[test]
    fn test_poison_lasts_until_root_pops() {
        let (mut stack, ids) = stack_with(2);
        stack.settle(ids[1], FrameState::Aborted);
        stack.poison(ids[1]);
        stack.pop(ids[1]);
        stack.poison(ids[0]);
        assert_eq!(stack.poisoned_by(), Some(ids[1]));

        stack.settle(ids[0], FrameState::Aborted);
        stack.pop(ids[0]);
        assert_eq!(stack.poisoned_by(), None);
        stack.poison(ids[0]);
        assert_eq!(stack.poisoned_by(), None);
    }

    #[test]
    fn test_nested_frames_report_root_isolation() {
        let mut stack = TransactionStack::new();
        stack.push_root("r".into(), Some(IsolationLevel::Serializable), None);
        stack.push_nested(None, None);
        assert_eq!(
            stack.current().unwrap().isolation(),
            Some(IsolationLevel::Serializable)
        );
    }
}
