//! Event listeners.

use futures::Stream;
use pin_project::{pin_project, pinned_drop};
use std::{
    collections::HashSet,
    fmt,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    command::opcode_name, parse_command_complete, parse_command_status, Command, Error, ErrorKind, Event,
    EventCode, Result,
};

/// Ticket identifying a registered listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Observer of management events.
///
/// Listeners are called from the event dispatcher task for every received
/// event. Both methods must return quickly and must not wait on the connection.
pub trait Listener: Send + 'static {
    /// Returns whether the event should be passed to [handle](Self::handle).
    fn filter(&mut self, event: &Event) -> bool;

    /// Processes an accepted event.
    ///
    /// Returns `true` when the listener is finished and should be removed.
    fn handle(&mut self, event: &Event) -> bool;
}

enum CommandState {
    Pending(oneshot::Sender<Result<Vec<u8>>>),
    Resolved,
    TimedOut,
}

impl fmt::Debug for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(_) => write!(f, "Pending"),
            Self::Resolved => write!(f, "Resolved"),
            Self::TimedOut => write!(f, "TimedOut"),
        }
    }
}

/// Listener that waits for the result of one command.
///
/// Accepts command status and command complete events from the same
/// controller that echo the opcode of the command.
/// Since the kernel echoes only the opcode, results of concurrent commands with
/// the same opcode, for example issued by another process, cannot be told apart.
#[derive(Debug)]
pub struct CommandListener {
    opcode: u16,
    index: u16,
    state: CommandState,
}

impl CommandListener {
    /// Creates a listener for the result of the specified command.
    ///
    /// The result is delivered through the returned receiver.
    pub fn new(command: &Command) -> (Self, oneshot::Receiver<Result<Vec<u8>>>) {
        let (tx, rx) = oneshot::channel();
        (Self { opcode: command.opcode(), index: command.index(), state: CommandState::Pending(tx) }, rx)
    }

    fn is_pending(&mut self) -> bool {
        if let CommandState::Pending(tx) = &self.state {
            if tx.is_closed() {
                log::trace!("Waiter for {} on index {} is gone", opcode_name(self.opcode), self.index);
                self.state = CommandState::TimedOut;
            }
        }
        matches!(self.state, CommandState::Pending(_))
    }

    fn result(&self, event: &Event) -> Option<Result<Vec<u8>>> {
        match event.event_code()? {
            EventCode::CommandComplete => match parse_command_complete(event.payload()) {
                Ok(complete) if complete.opcode == self.opcode => Some(complete.result()),
                Ok(_) => None,
                Err(err) => {
                    log::debug!("Ignoring malformed command complete event: {}", &err);
                    None
                }
            },
            EventCode::CommandStatus => match parse_command_status(event.payload()) {
                Ok(status) if status.opcode == self.opcode => Some(status.result().map(|()| Vec::new())),
                Ok(_) => None,
                Err(err) => {
                    log::debug!("Ignoring malformed command status event: {}", &err);
                    None
                }
            },
            _ => None,
        }
    }
}

impl Listener for CommandListener {
    fn filter(&mut self, event: &Event) -> bool {
        if !self.is_pending() {
            return true;
        }
        event.index() == self.index && self.result(event).is_some()
    }

    fn handle(&mut self, event: &Event) -> bool {
        if !self.is_pending() {
            return true;
        }
        let Some(result) = self.result(event) else { return false };
        log::trace!("Result for {} on index {}: {:?}", opcode_name(self.opcode), self.index, &result);
        if let CommandState::Pending(tx) = std::mem::replace(&mut self.state, CommandState::Resolved) {
            let _ = tx.send(result);
        }
        true
    }
}

/// Result of a command that has been sent.
///
/// Use [wait](Self::wait) to obtain the result.
#[derive(Debug)]
pub struct PendingCommand {
    id: ListenerId,
    opcode: u16,
    index: u16,
    rx: oneshot::Receiver<Result<Vec<u8>>>,
    remove_tx: mpsc::UnboundedSender<ListenerId>,
}

impl PendingCommand {
    pub(crate) fn new(
        id: ListenerId, command: &Command, rx: oneshot::Receiver<Result<Vec<u8>>>,
        remove_tx: mpsc::UnboundedSender<ListenerId>,
    ) -> Self {
        Self { id, opcode: command.opcode(), index: command.index(), rx, remove_tx }
    }

    /// Id of the listener waiting for the result.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Waits for the command result.
    ///
    /// On timeout the listener is removed and [ErrorKind::Timeout] is returned.
    /// If the connection is closed while waiting, [ErrorKind::Closed] is returned.
    pub async fn wait(self, timeout: Duration) -> Result<Vec<u8>> {
        self.wait_until(Instant::now() + timeout).await
    }

    /// Waits for the command result until the specified deadline.
    ///
    /// Behaves like [wait](Self::wait).
    pub async fn wait_until(mut self, deadline: Instant) -> Result<Vec<u8>> {
        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::closed()),
            Err(_) => {
                self.rx.close();
                if let Ok(result) = self.rx.try_recv() {
                    log::trace!("Result for {} arrived at the deadline", opcode_name(self.opcode));
                    return result;
                }
                let _ = self.remove_tx.send(self.id);
                log::debug!("Command {} on index {} timed out", opcode_name(self.opcode), self.index);
                Err(timed_out(self.opcode))
            }
        }
    }
}

/// Error returned when no result for the opcode arrived in time.
pub(crate) fn timed_out(opcode: u16) -> Error {
    Error::with_message(ErrorKind::Timeout, format!("no result for {} in time", opcode_name(opcode)))
}

/// Selects which events an event subscription receives.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventFilter {
    codes: Option<HashSet<u16>>,
    index: Option<u16>,
}

impl EventFilter {
    /// Matches all events.
    pub fn all() -> Self {
        Self::default()
    }

    /// Additionally matches events with the specified code.
    ///
    /// Once a code has been added, events with other codes are no longer matched.
    pub fn code(mut self, code: impl Into<u16>) -> Self {
        self.codes.get_or_insert_with(HashSet::new).insert(code.into());
        self
    }

    /// Matches only events from the controller with the specified index.
    pub fn index(mut self, index: u16) -> Self {
        self.index = Some(index);
        self
    }

    /// Whether the event matches the filter.
    pub fn matches(&self, event: &Event) -> bool {
        let code_ok = match &self.codes {
            Some(codes) => codes.contains(&event.code()),
            None => true,
        };
        code_ok && self.index.map_or(true, |index| index == event.index())
    }
}

/// Listener that forwards matching events to a channel.
#[derive(Debug)]
pub struct EventSubscriber {
    filter: EventFilter,
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSubscriber {
    /// Creates a subscriber forwarding events matching the filter.
    pub fn new(filter: EventFilter) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { filter, tx }, rx)
    }
}

impl Listener for EventSubscriber {
    fn filter(&mut self, event: &Event) -> bool {
        self.tx.is_closed() || self.filter.matches(event)
    }

    fn handle(&mut self, event: &Event) -> bool {
        self.tx.send(event.clone()).is_err()
    }
}

/// Stream of management events.
///
/// The subscription is removed when the stream is dropped.
/// The stream ends when the connection is closed.
#[pin_project(PinnedDrop)]
pub struct EventStream {
    id: ListenerId,
    #[pin]
    events: UnboundedReceiverStream<Event>,
    remove_tx: mpsc::UnboundedSender<ListenerId>,
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventStream {{ id: {} }}", self.id)
    }
}

impl EventStream {
    pub(crate) fn new(
        id: ListenerId, events: mpsc::UnboundedReceiver<Event>, remove_tx: mpsc::UnboundedSender<ListenerId>,
    ) -> Self {
        Self { id, events: UnboundedReceiverStream::new(events), remove_tx }
    }

    /// Id of the subscription listener.
    pub fn id(&self) -> ListenerId {
        self.id
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Event>> {
        self.project().events.poll_next(cx)
    }
}

#[pinned_drop]
impl PinnedDrop for EventStream {
    fn drop(self: Pin<&mut Self>) {
        let _ = self.remove_tx.send(self.id);
    }
}
