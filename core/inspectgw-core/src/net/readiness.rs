//! Single-thread edge-triggered readiness loop (C4), merged with the
//! connection negotiator (C3): the Go source runs the SOCKS5 handshake off
//! a second, write-only epoll instance, but mio reports both "connect
//! completed" and "bytes available" as ordinary readiness events on the
//! same `Poll`, so one multiplexer and one thread cover both roles.
//!
//! Grounded on `neutronium::net::endpoint`'s triple-poll design, collapsed
//! here to a single poll since there's no separate handshake/live boundary
//! to enforce beyond the `Connector`'s own phase machine.

use crate::net::connector::{Connector, Progress};
use crate::worker_pool::WorkerPool;
use inspectgw_common::error::{FaultKind, GwError};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAKER_TOKEN: Token = Token(usize::MAX);
const READ_CHUNK: usize = 4096;

/// Callbacks the session layer (C6) implements to react to I/O events.
/// Kept deliberately thin: readiness only ever hands over raw bytes or a
/// terminal error, never decodes anything itself.
pub trait ConnectionEvents: Send + Sync {
    fn on_established(&self, bot_index: usize);
    fn on_data(&self, bot_index: usize, data: &[u8]);
    fn on_error(&self, bot_index: usize, err: GwError);
}

enum Slot {
    Connecting { bot_index: usize, connector: Connector },
    Established { bot_index: usize, stream: TcpStream },
}

struct PendingConnect {
    bot_index: usize,
    connector: Connector,
}

type PendingQueue = Arc<Mutex<Vec<PendingConnect>>>;
type OutboundQueue = Arc<Mutex<Vec<(usize, Vec<u8>)>>>;

/// Owns every bot socket, keyed by an internal `Token`. Safe to drive from
/// exactly one thread (`run`); other threads request new connection
/// attempts via `ReadinessHandle`, which wakes the loop.
pub struct ReadinessLoop {
    poll: Poll,
    pending: PendingQueue,
    outbound: OutboundQueue,
    slots: HashMap<Token, Slot>,
    token_of_bot: HashMap<usize, Token>,
    next_token: AtomicUsize,
}

/// The handle other threads use to enqueue new dial attempts and outbound
/// writes.
#[derive(Clone)]
pub struct ReadinessHandle {
    waker: Arc<Waker>,
    pending: PendingQueue,
    outbound: OutboundQueue,
}

impl ReadinessLoop {
    pub fn new() -> std::io::Result<(ReadinessLoop, ReadinessHandle)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let pending: PendingQueue = Arc::new(Mutex::new(Vec::new()));
        let outbound: OutboundQueue = Arc::new(Mutex::new(Vec::new()));

        let handle = ReadinessHandle {
            waker,
            pending: Arc::clone(&pending),
            outbound: Arc::clone(&outbound),
        };

        Ok((
            ReadinessLoop {
                poll,
                pending,
                outbound,
                slots: HashMap::new(),
                token_of_bot: HashMap::new(),
                next_token: AtomicUsize::new(0),
            },
            handle,
        ))
    }

    fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a new connection attempt for `bot_index`. Any existing
    /// slot for that bot is dropped first (a stale attempt superseded by a
    /// fresh reconnect).
    fn register_connect(&mut self, bot_index: usize, mut connector: Connector) {
        self.drop_bot_slot(bot_index);

        let token = self.next_token();
        let _ = self.poll.registry().register(
            &mut connector.stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        );
        self.slots.insert(token, Slot::Connecting { bot_index, connector });
        self.token_of_bot.insert(bot_index, token);
    }

    fn drop_bot_slot(&mut self, bot_index: usize) {
        if let Some(token) = self.token_of_bot.remove(&bot_index) {
            match self.slots.remove(&token) {
                Some(Slot::Connecting { mut connector, .. }) => {
                    let _ = self.poll.registry().deregister(&mut connector.stream);
                }
                Some(Slot::Established { mut stream, .. }) => {
                    let _ = self.poll.registry().deregister(&mut stream);
                }
                None => {}
            }
        }
    }

    /// Runs until `stop` (checked after every wake) returns true.
    /// `events_handler` is shared with the pool-offloaded `on_data` calls,
    /// so it must be cheap to clone (an `Arc` in practice).
    pub fn run<H>(&mut self, events_handler: Arc<H>, pool: &WorkerPool, mut stop: impl FnMut() -> bool)
    where
        H: ConnectionEvents + 'static,
    {
        let mut events = Events::with_capacity(256);
        while !stop() {
            if let Err(err) = self.poll.poll(&mut events, Some(Duration::from_millis(200))) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                break;
            }

            let tokens: Vec<Token> = events.iter().map(|e| e.token()).collect();
            for token in tokens {
                if token == WAKER_TOKEN {
                    self.drain_pending();
                    continue;
                }
                self.handle_event(token, &events_handler, pool);
            }
        }
    }

    fn handle_event<H>(&mut self, token: Token, events_handler: &Arc<H>, pool: &WorkerPool)
    where
        H: ConnectionEvents + 'static,
    {
        match self.slots.get_mut(&token) {
            Some(Slot::Connecting { bot_index, connector }) => {
                let bot_index = *bot_index;
                match connector.advance() {
                    Ok(Progress::Pending) => {}
                    Ok(Progress::Established) => {
                        if let Some(Slot::Connecting { connector, .. }) = self.slots.remove(&token) {
                            let mut stream = connector.stream;
                            let _ = self.poll.registry().reregister(&mut stream, token, Interest::READABLE);
                            self.slots.insert(token, Slot::Established { bot_index, stream });
                        }
                        events_handler.on_established(bot_index);
                    }
                    Err(err) => {
                        self.drop_bot_slot(bot_index);
                        events_handler.on_error(bot_index, err);
                    }
                }
            }
            Some(Slot::Established { bot_index, stream }) => {
                let bot_index = *bot_index;
                let mut buf = [0u8; READ_CHUNK];
                match stream.read(&mut buf) {
                    Ok(0) => {
                        self.drop_bot_slot(bot_index);
                        events_handler.on_error(
                            bot_index,
                            GwError::fatal(FaultKind::Protocol, "peer closed the connection"),
                        );
                    }
                    Ok(n) => {
                        // Exactly one bounded read per wake; decoding and
                        // dispatch happen off this thread.
                        let chunk = buf[..n].to_vec();
                        let handler = Arc::clone(events_handler);
                        pool.schedule(move || handler.on_data(bot_index, &chunk));
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                    Err(err) => {
                        self.drop_bot_slot(bot_index);
                        events_handler.on_error(bot_index, err.into());
                    }
                }
            }
            None => {}
        }
    }

    fn drain_pending(&mut self) {
        let pending: Vec<PendingConnect> = {
            let mut guard = self.pending.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for item in pending {
            self.register_connect(item.bot_index, item.connector);
        }

        let outbound: Vec<(usize, Vec<u8>)> = {
            let mut guard = self.outbound.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for (bot_index, bytes) in outbound {
            self.write_to_bot(bot_index, &bytes);
        }
    }

    /// Best-effort write of a small protocol message. Session-layer
    /// outbound frames (login, heartbeat, inspect request, ...) are a few
    /// hundred bytes at most, so a handful of immediate retries covers the
    /// transient `WouldBlock` case without needing a per-socket write
    /// queue.
    fn write_to_bot(&mut self, bot_index: usize, bytes: &[u8]) {
        let token = match self.token_of_bot.get(&bot_index) {
            Some(token) => *token,
            None => return,
        };
        let stream = match self.slots.get_mut(&token) {
            Some(Slot::Established { stream, .. }) => stream,
            _ => return,
        };

        let mut written = 0;
        let mut attempts = 0;
        while written < bytes.len() && attempts < 8 {
            match stream.write(&bytes[written..]) {
                Ok(n) => written += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => attempts += 1,
                Err(_) => return,
            }
        }
    }
}

impl ReadinessHandle {
    pub fn request_connect(&self, bot_index: usize, connector: Connector) {
        self.pending
            .lock()
            .unwrap()
            .push(PendingConnect { bot_index, connector });
        let _ = self.waker.wake();
    }

    pub fn send(&self, bot_index: usize, bytes: Vec<u8>) {
        self.outbound.lock().unwrap().push((bot_index, bytes));
        let _ = self.waker.wake();
    }
}
