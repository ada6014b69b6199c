//! Outgoing commands and the per-connection command queue.
//!
//! Commands are serialized: at most one is on the wire per connection. The
//! head of the queue waits in the running slot until its BOP mask clears;
//! later commands never overtake it.

use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use rts_proto::{OK, ValueOp};

/// Result of a command as reported by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Outcome {
    /// `+000` reply.
    Ok,
    /// Negative reply code, or a local code when the connection dropped.
    Failed(i32),
}

impl Outcome {
    /// Maps a reply code.
    pub const fn from_code(code: i32) -> Self {
        if code == OK { Self::Ok } else { Self::Failed(code) }
    }

    /// Numeric reply code.
    pub const fn code(self) -> i32 {
        match self {
            Self::Ok => OK,
            Self::Failed(code) => code,
        }
    }

    /// `true` on success.
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Receives the completion of commands it queued.
pub trait Originator {
    /// Called once per command when its reply arrives or the connection drops.
    fn command_returned(&self, command: &Command, outcome: Outcome);
}

/// A command line plus the device states under which it must not be sent.
#[derive(Clone)]
pub struct Command {
    /// Line written to the peer.
    text: String,
    /// BOP bits that hold the command back.
    not_bop: u32,
    /// Notified on completion.
    originator: Option<Rc<dyn Originator>>,
    /// Sent regardless of BOP state.
    immediate: bool,
}

impl Command {
    /// Creates an ungated command.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            not_bop: 0,
            originator: None,
            immediate: false,
        }
    }

    /// `info` request.
    pub fn info() -> Self {
        Self::new("info")
    }

    /// `X` set-value request.
    pub fn set_value(name: &str, op: ValueOp, raw: &str) -> Self {
        Self::new(format!("X {name} {} {raw}", op.as_str()))
    }

    /// Holds the command while any of `mask` is set in the full BOP state.
    #[must_use]
    pub const fn with_not_bop(mut self, mask: u32) -> Self {
        self.not_bop = mask;
        self
    }

    /// Notifies `originator` on completion.
    #[must_use]
    pub fn with_originator(mut self, originator: Rc<dyn Originator>) -> Self {
        self.originator = Some(originator);
        self
    }

    /// Line written to the peer.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// BOP gating mask.
    pub const fn not_bop(&self) -> u32 {
        self.not_bop
    }

    /// Completion target.
    pub const fn originator(&self) -> Option<&Rc<dyn Originator>> {
        self.originator.as_ref()
    }

    /// `true` for commands that bypass BOP gating.
    pub const fn is_immediate(&self) -> bool {
        self.immediate
    }

    /// `true` when the command may be written under `full_bop`.
    pub const fn can_send(&self, full_bop: u32) -> bool {
        self.immediate || self.not_bop & full_bop == 0
    }

    /// `true` if `originator` queued this command.
    fn is_from(&self, originator: &Rc<dyn Originator>) -> bool {
        self.originator
            .as_ref()
            .is_some_and(|o| Rc::ptr_eq(o, originator))
    }

    /// Delivers the outcome to the originator, if any.
    pub(crate) fn notify(&self, outcome: Outcome) {
        if let Some(originator) = &self.originator {
            originator.command_returned(self, outcome);
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("text", &self.text)
            .field("not_bop", &format_args!("{:#x}", self.not_bop))
            .field("originator", &self.originator.is_some())
            .field("immediate", &self.immediate)
            .finish()
    }
}

/// Progress of the command in the running slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CommandStatus {
    /// Held back by BOP state or by the connection state.
    Waiting,
    /// Written, awaiting its reply.
    Sent,
    /// Reply received, originator being notified.
    Returning,
}

/// How a reply line relates to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplyMatch {
    /// Nothing was awaiting a reply.
    Unexpected,
    /// The reply belongs to a command dropped by [`CommandQueue::clear`].
    Orphan,
    /// The running command returned.
    Running(Outcome),
}

/// FIFO of commands with a single running slot.
#[derive(Debug, Default)]
pub struct CommandQueue {
    /// Commands behind the running one.
    queue: VecDeque<Command>,
    /// Head command and its status.
    running: Option<(Command, CommandStatus)>,
    /// A cleared command is still on the wire; its reply is swallowed.
    orphan: bool,
}

impl CommandQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a command.
    pub fn push(&mut self, command: Command) {
        self.queue.push_back(command);
    }

    /// Places a BOP-exempt command ahead of everything not yet written.
    pub fn push_immediate(&mut self, mut command: Command) {
        command.immediate = true;
        if let Some((waiting, _)) = self
            .running
            .take_if(|(_, s)| *s == CommandStatus::Waiting)
        {
            self.queue.push_front(waiting);
        }
        self.queue.push_front(command);
    }

    /// Promotes the next command and returns its text if it may be written
    /// now under `full_bop`. The command is then marked sent.
    pub fn dispatch(&mut self, full_bop: u32) -> Option<String> {
        if self.orphan {
            return None;
        }
        if self.running.is_none() {
            self.running = self
                .queue
                .pop_front()
                .map(|c| (c, CommandStatus::Waiting));
        }
        match &mut self.running {
            Some((command, status))
                if *status == CommandStatus::Waiting && command.can_send(full_bop) =>
            {
                *status = CommandStatus::Sent;
                Some(command.text.clone())
            }
            _ => None,
        }
    }

    /// Matches a reply code against the command on the wire.
    ///
    /// A matched command stays in the running slot as
    /// [`CommandStatus::Returning`] until [`finish`](Self::finish).
    pub fn reply(&mut self, code: i32) -> ReplyMatch {
        if self.orphan {
            self.orphan = false;
            return ReplyMatch::Orphan;
        }
        match &mut self.running {
            Some((_, status)) if *status == CommandStatus::Sent => {
                *status = CommandStatus::Returning;
                ReplyMatch::Running(Outcome::from_code(code))
            }
            _ => ReplyMatch::Unexpected,
        }
    }

    /// Removes the returning command.
    pub fn finish(&mut self) -> Option<Command> {
        self.running
            .take_if(|(_, s)| *s == CommandStatus::Returning)
            .map(|(c, _)| c)
    }

    /// Discards every queued command and a running command not yet written.
    ///
    /// A command already on the wire is detached; its reply will be ignored.
    /// Originators are not notified.
    pub fn clear(&mut self) {
        self.queue.clear();
        if let Some((_, status)) = self.running.take() {
            if status == CommandStatus::Sent {
                self.orphan = true;
            }
        }
    }

    /// Removes every command, running one first, for failure delivery.
    pub fn drain(&mut self) -> Vec<Command> {
        self.orphan = false;
        self.running
            .take()
            .map(|(c, _)| c)
            .into_iter()
            .chain(self.queue.drain(..))
            .collect()
    }

    /// `true` when nothing is queued and nothing awaits a reply.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
            && self
                .running
                .as_ref()
                .is_none_or(|(_, s)| *s == CommandStatus::Returning)
    }

    /// Number of commands including the running one.
    pub fn len(&self) -> usize {
        self.queue.len() + usize::from(self.running.is_some())
    }

    /// The running command and its status.
    pub fn running(&self) -> Option<(&Command, CommandStatus)> {
        self.running.as_ref().map(|(c, s)| (c, *s))
    }

    /// `true` while a written command awaits its reply.
    pub fn awaiting_reply(&self) -> bool {
        self.orphan
            || self
                .running
                .as_ref()
                .is_some_and(|(_, s)| *s == CommandStatus::Sent)
    }

    /// `true` when no queued or running command belongs to `originator`.
    pub fn is_empty_for(&self, originator: &Rc<dyn Originator>) -> bool {
        !self
            .running
            .iter()
            .map(|(c, _)| c)
            .chain(&self.queue)
            .any(|c| c.is_from(originator))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::RefCell;

    use rts_proto::status::{BOP_EXPOSURE, BOP_TEL_MOVE};

    use super::*;

    #[derive(Default)]
    struct Record(RefCell<Vec<(String, Outcome)>>);

    impl Originator for Record {
        fn command_returned(&self, command: &Command, outcome: Outcome) {
            self.0.borrow_mut().push((command.text().to_owned(), outcome));
        }
    }

    #[test]
    fn one_command_in_flight() {
        let mut q = CommandQueue::new();
        q.push(Command::new("a"));
        q.push(Command::new("b"));
        assert_eq!(q.dispatch(0).as_deref(), Some("a"));
        assert_eq!(q.dispatch(0), None);
        assert_eq!(q.reply(0), ReplyMatch::Running(Outcome::Ok));
        assert_eq!(q.running().unwrap().1, CommandStatus::Returning);
        assert_eq!(q.finish().unwrap().text(), "a");
        assert_eq!(q.dispatch(0).as_deref(), Some("b"));
        assert!(!q.is_empty());
        assert_eq!(q.reply(-3), ReplyMatch::Running(Outcome::Failed(-3)));
        assert!(q.is_empty());
        q.finish();
        assert!(q.is_empty());
        assert_eq!(q.reply(0), ReplyMatch::Unexpected);
    }

    #[test]
    fn head_of_line_waits_for_bop() {
        let mut q = CommandQueue::new();
        q.push(Command::new("move").with_not_bop(BOP_TEL_MOVE));
        q.push(Command::new("info"));
        assert_eq!(q.dispatch(BOP_TEL_MOVE), None);
        assert_eq!(q.running().unwrap().1, CommandStatus::Waiting);
        assert_eq!(q.dispatch(BOP_EXPOSURE).as_deref(), Some("move"));
    }

    #[test]
    fn immediate_overtakes_waiting_command() {
        let mut q = CommandQueue::new();
        q.push(Command::new("expose").with_not_bop(BOP_EXPOSURE));
        assert_eq!(q.dispatch(BOP_EXPOSURE), None);
        q.push_immediate(Command::new("stop").with_not_bop(BOP_EXPOSURE));
        assert_eq!(q.dispatch(BOP_EXPOSURE).as_deref(), Some("stop"));
        q.reply(0);
        q.finish();
        assert_eq!(q.dispatch(BOP_EXPOSURE), None);
        assert_eq!(q.running().unwrap().0.text(), "expose");
    }

    #[test]
    fn clear_leaves_queue_empty() {
        let record = Rc::new(Record::default());
        let origin: Rc<dyn Originator> = Rc::<Record>::clone(&record);
        let mut q = CommandQueue::new();
        q.push(Command::new("a").with_originator(Rc::clone(&origin)));
        q.push(Command::new("b").with_originator(Rc::clone(&origin)));
        assert_eq!(q.dispatch(0).as_deref(), Some("a"));
        assert!(!q.is_empty_for(&origin));
        q.clear();
        assert!(q.is_empty());
        assert!(q.is_empty_for(&origin));
        assert!(q.awaiting_reply());

        q.push(Command::new("c"));
        assert_eq!(q.dispatch(0), None);
        assert_eq!(q.reply(0), ReplyMatch::Orphan);
        assert_eq!(q.dispatch(0).as_deref(), Some("c"));
        assert!(record.0.borrow().is_empty());
    }

    #[test]
    fn drain_returns_running_first() {
        let mut q = CommandQueue::new();
        q.push(Command::new("a"));
        q.push(Command::new("b"));
        q.dispatch(0);
        let drained: Vec<_> = q.drain().iter().map(|c| c.text().to_owned()).collect();
        assert_eq!(drained, ["a", "b"]);
        assert!(q.is_empty());
    }

    #[test]
    fn set_value_text() {
        assert_eq!(
            Command::set_value("focus", ValueOp::Add, "10").text(),
            "X focus += 10"
        );
    }
}
