use std::collections::HashMap;
use std::fmt;
use std::io;
use std::time::Duration;

use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Token};

/// A per-descriptor callback. Takes the loop itself (so a callback may
/// register, modify or remove any descriptor, including its own) and the
/// readiness event that triggered it.
///
/// The original design passed two untyped userdata pointers alongside the
/// callback function pointer; here those become ordinary closure captures —
/// a callback that needs shared worker state captures an `Rc<RefCell<_>>`.
pub type Callback = Box<dyn FnMut(&mut EventLoop, &Event)>;

#[derive(Debug)]
pub enum LoopError {
    AlreadyRegistered,
    NotRegistered,
    Io(io::Error),
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopError::AlreadyRegistered => write!(f, "descriptor already registered"),
            LoopError::NotRegistered => write!(f, "descriptor not registered"),
            LoopError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for LoopError {}

impl From<io::Error> for LoopError {
    fn from(e: io::Error) -> Self {
        LoopError::Io(e)
    }
}

struct Entry {
    callback: Option<Callback>,
}

/// A readiness-based event demultiplexer keyed by raw descriptor.
///
/// Registration keys are `mio::Token`s constructed directly from the raw
/// file descriptor (`Token(fd as usize)`), so there is exactly one id space
/// instead of the original C design's pointer-in-epoll-data indirection
/// backed by a `tsearch` tree. Safety of same-batch self-removal comes from
/// taking the callback out of the map before invoking it and only putting it
/// back if the entry (and thus its token) still exists afterwards — a
/// descriptor removed mid-dispatch, by itself or by an earlier callback in
/// the same batch, is simply absent from the map when its turn comes.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    entries: HashMap<Token, Entry>,
    running: bool,
}

impl EventLoop {
    /// `size_hint` caps how many readiness notifications a single wait call
    /// may return; it does not bound how many descriptors can be registered.
    pub fn create(size_hint: usize) -> io::Result<Self> {
        Ok(EventLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(size_hint),
            entries: HashMap::new(),
            running: false,
        })
    }

    pub fn add<S: Source>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
        callback: Callback,
    ) -> Result<(), LoopError> {
        if self.entries.contains_key(&token) {
            return Err(LoopError::AlreadyRegistered);
        }
        self.poll.registry().register(source, token, interest)?;
        self.entries.insert(token, Entry { callback: Some(callback) });
        Ok(())
    }

    pub fn modify_interest<S: Source>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), LoopError> {
        if !self.entries.contains_key(&token) {
            return Err(LoopError::NotRegistered);
        }
        self.poll.registry().reregister(source, token, interest)?;
        Ok(())
    }

    pub fn modify_callback(&mut self, token: Token, callback: Callback) -> Result<(), LoopError> {
        match self.entries.get_mut(&token) {
            Some(entry) => {
                entry.callback = Some(callback);
                Ok(())
            }
            None => Err(LoopError::NotRegistered),
        }
    }

    /// Safe to call from within a callback running on this or another
    /// token's dispatch. Detaches the descriptor from the kernel's
    /// readiness monitoring and drops its entry; any later event for this
    /// token within the current batch is a no-op because lookup fails.
    pub fn remove<S: Source>(&mut self, source: &mut S, token: Token) -> Result<(), LoopError> {
        self.poll.registry().deregister(source)?;
        self.entries.remove(&token);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Runs wait-dispatch iterations until `stop()` is called, or (when no
    /// tick callback is given) until a wait returns nothing.
    pub fn run(
        &mut self,
        timeout: Option<Duration>,
        mut tick: Option<&mut dyn FnMut(&mut EventLoop)>,
    ) -> io::Result<()> {
        self.running = true;

        while self.running {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            let batch: Vec<Event> = self.events.iter().cloned().collect();
            let batch_empty = batch.is_empty();

            for event in &batch {
                let token = event.token();

                let callback = match self.entries.get_mut(&token) {
                    Some(entry) => entry.callback.take(),
                    None => None,
                };

                if let Some(mut callback) = callback {
                    callback(self, event);

                    if let Some(entry) = self.entries.get_mut(&token) {
                        entry.callback = Some(callback);
                    }
                }
            }

            match tick.as_deref_mut() {
                Some(tick) => tick(self),
                None if batch_empty => self.running = false,
                None => {}
            }
        }

        Ok(())
    }
}
