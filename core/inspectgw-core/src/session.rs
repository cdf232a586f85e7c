//! Session protocol handler (C6). Grounded on `original_source/bot.go` and
//! `inspect_handler.go`'s `handlePacket` dispatch, plus the connect/error
//! flow in `connection.go`. This module is the glue: it owns the fleet,
//! drives logins and heartbeats, and bridges the readiness loop (C4) and
//! the inspect dispatcher (C7).

use crate::bot::{BotStatus, Credentials, Fleet};
use crate::collaborators::{DirectoryLookup, MetricsSink, TokenStore};
use crate::config::ProxyList;
use crate::dispatcher::{Dispatcher, FleetSink};
use crate::model::Item;
use crate::net::codec::{GcMessage, LoginFailure, SessionCodec, SessionMessage};
use crate::net::connector::{Connector, ProxyCredentials};
use crate::net::readiness::{ConnectionEvents, ReadinessHandle};
use crate::scheduler::{Scheduler, Task};
use crate::worker_pool::WorkerPool;
use inspectgw_auth::{AuthenticationHandler, Authenticator, GuardKind, TotpAuthenticator};
use inspectgw_common::error::GwError;
use inspectgw_common::logging::{debug, error, info, warn, Logger};
use inspectgw_common::time::timestamp_nanos;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

const RECONNECT_TRANSIENT_SECS: i64 = 5;
const RECONNECT_LOGIN_FAILURE_SECS: i64 = 60;
const MIN_RECONNECT_FLOOR_SECS: i64 = 5;
const FALLBACK_HEARTBEAT_INTERVAL_SECS: i32 = 9;
const DIRECTORY_REFRESH_INTERVAL_SECS: i64 = 3600;

/// Per-bot bookkeeping that lives alongside the `Fleet` entry: the codec
/// instance, the accumulation buffer for partial frames, the next
/// scheduled heartbeat key (for the compare-and-noop check in §4.8), and
/// the configured heartbeat cadence.
struct BotIo {
    codec: Box<dyn SessionCodec>,
    buffer: Vec<u8>,
    next_heartbeat_ns: i64,
    heartbeat_interval_secs: i32,
}

pub struct SessionConfig {
    pub proxy_list: ProxyList,
    pub ignore_proxy: bool,
    pub client_version: u32,
    pub token_store: Arc<dyn TokenStore>,
    pub metrics: Arc<dyn MetricsSink>,
    pub directory: Arc<dyn DirectoryLookup>,
    pub auth_handler: Option<Arc<dyn AuthenticationHandler>>,
}

pub struct Session {
    log: Logger,
    self_weak: OnceLock<Weak<Session>>,
    fleet: Mutex<Fleet>,
    io: Mutex<HashMap<usize, BotIo>>,
    codec_factory: Box<dyn Fn() -> Box<dyn SessionCodec> + Send + Sync>,
    scheduler: Arc<Scheduler>,
    pool: Arc<WorkerPool>,
    dispatcher: OnceLock<Arc<Dispatcher>>,
    readiness: ReadinessHandle,
    token_store: Arc<dyn TokenStore>,
    metrics: Arc<dyn MetricsSink>,
    directory: Arc<dyn DirectoryLookup>,
    auth_handler: Option<Arc<dyn AuthenticationHandler>>,
    proxy_list: ProxyList,
    ignore_proxy: bool,
    client_version: u32,
}

impl Session {
    pub fn new(
        log: Logger,
        scheduler: Arc<Scheduler>,
        pool: Arc<WorkerPool>,
        readiness: ReadinessHandle,
        codec_factory: Box<dyn Fn() -> Box<dyn SessionCodec> + Send + Sync>,
        config: SessionConfig,
    ) -> Arc<Session> {
        let session = Arc::new(Session {
            log,
            self_weak: OnceLock::new(),
            fleet: Mutex::new(Fleet::new()),
            io: Mutex::new(HashMap::new()),
            codec_factory,
            scheduler,
            pool,
            dispatcher: OnceLock::new(),
            readiness,
            token_store: config.token_store,
            metrics: config.metrics,
            directory: config.directory,
            auth_handler: config.auth_handler,
            proxy_list: config.proxy_list,
            ignore_proxy: config.ignore_proxy,
            client_version: config.client_version,
        });
        let _ = session.self_weak.set(Arc::downgrade(&session));
        session.schedule_directory_refresh();
        session
    }

    fn arc(&self) -> Arc<Session> {
        self.self_weak
            .get()
            .expect("self_weak is set immediately after construction")
            .upgrade()
            .expect("Session outlives its own weak handle")
    }

    /// Binds the dispatcher this session forwards inspection responses and
    /// timeouts to. Must be called exactly once, after both `self` and the
    /// dispatcher have been constructed (they're mutually referential).
    pub fn bind_dispatcher(&self, dispatcher: Arc<Dispatcher>) {
        let _ = self.dispatcher.set(dispatcher);
    }

    pub fn add_bot(&self, credentials: Credentials) -> usize {
        let index = self.fleet.lock().unwrap().add(credentials);
        self.io.lock().unwrap().insert(
            index,
            BotIo {
                codec: (self.codec_factory)(),
                buffer: Vec::new(),
                next_heartbeat_ns: 0,
                heartbeat_interval_secs: FALLBACK_HEARTBEAT_INTERVAL_SECS,
            },
        );
        let session = self.arc();
        self.scheduler.insert(
            timestamp_nanos(),
            Task::Deferred(Box::new(move || session.connect_bot(index))),
        );
        index
    }

    pub fn status_counts(&self) -> [usize; 5] {
        self.fleet.lock().unwrap().status_counts()
    }

    /// Refreshes the upstream directory now, then reschedules itself an
    /// hour out (§11: startup-plus-hourly refresh via a scheduler-driven
    /// recurring task, grounded on `inspect_handler.go`'s `NewHandler`
    /// timer).
    fn schedule_directory_refresh(&self) {
        self.directory.refresh();
        let session = self.arc();
        let fire_at = timestamp_nanos() + DIRECTORY_REFRESH_INTERVAL_SECS * 1_000_000_000;
        self.scheduler.insert(
            fire_at,
            Task::Deferred(Box::new(move || session.schedule_directory_refresh())),
        );
    }

    /// Dials bot `index`, either directly or through its assigned proxy
    /// (§4.3's policy: sized by `len(passwords)`, `ignoreProxy` decides the
    /// fallback for bots past that range).
    fn connect_bot(&self, index: usize) {
        self.directory.refresh();
        let destination: SocketAddr = match self.directory.pick().parse() {
            Ok(addr) => addr,
            Err(_) => {
                warn!(self.log, "directory returned no usable CM address"; "bot" => index as u64);
                self.schedule_reconnect(index, RECONNECT_TRANSIENT_SECS);
                return;
            }
        };

        let has_proxy = index < self.proxy_list.capacity();
        let connector = if has_proxy {
            let address: SocketAddr = match self.proxy_list.address_for(index).and_then(|a| a.parse().ok()) {
                Some(addr) => addr,
                None => {
                    warn!(self.log, "no proxy address available for bot"; "bot" => index as u64);
                    return;
                }
            };
            let username = self.proxy_list.username_for(index).unwrap_or_default().to_string();
            let password = self.proxy_list.password_for(index).unwrap_or_default().to_string();
            Connector::dial_via_proxy(
                ProxyCredentials { address, username, password },
                destination,
            )
        } else if self.ignore_proxy {
            Connector::dial_direct(destination)
        } else {
            warn!(self.log, "no proxy available for bot and ignore_proxy is unset"; "bot" => index as u64);
            return;
        };

        match connector {
            Ok(connector) => self.readiness.request_connect(index, connector),
            Err(err) => {
                error!(self.log, "failed dialing bot"; "bot" => index as u64, "err" => %err);
                self.schedule_reconnect(index, RECONNECT_TRANSIENT_SECS);
            }
        }
    }

    fn schedule_reconnect(&self, index: usize, delay_secs: i64) {
        let session = self.arc();
        let fire_at = timestamp_nanos() + delay_secs.max(0) * 1_000_000_000;
        self.scheduler.insert(
            fire_at,
            Task::Deferred(Box::new(move || session.connect_bot(index))),
        );
    }

    /// The error path (§4.5): cancel the heartbeat, tear the bot down to
    /// `Disconnected`, and schedule a reconnect after `delay_secs`.
    fn error_path(&self, index: usize, delay_secs: i64) {
        self.cancel_heartbeat(index);

        let mut fleet = self.fleet.lock().unwrap();
        if let Some(bot) = fleet.get_mut(index) {
            bot.reset();
        }
        drop(fleet);

        if let Some(io) = self.io.lock().unwrap().get_mut(&index) {
            io.buffer.clear();
        }

        self.schedule_reconnect(index, delay_secs);
    }

    fn cancel_heartbeat(&self, index: usize) {
        let mut io_table = self.io.lock().unwrap();
        if let Some(io) = io_table.get_mut(&index) {
            if io.next_heartbeat_ns != 0 {
                let key = io.next_heartbeat_ns;
                // Retried to tolerate a concurrent self-reschedule racing
                // this removal (§4.8).
                for _ in 0..3 {
                    if self.scheduler.remove(key) {
                        break;
                    }
                }
                io.next_heartbeat_ns = 0;
            }
        }
    }

    fn bot_name(&self, index: usize) -> String {
        self.fleet
            .lock()
            .unwrap()
            .get(index)
            .map(|bot| bot.name().to_string())
            .unwrap_or_default()
    }

    /// Dispatches one decoded message for `index` (§4.6).
    fn handle_message(&self, index: usize, message: SessionMessage) {
        match message {
            SessionMessage::EncryptionRequest { .. } => {
                let reply = self
                    .io
                    .lock()
                    .unwrap()
                    .get_mut(&index)
                    .map(|io| io.codec.encode_encryption_result());
                if let Some(reply) = reply {
                    self.readiness.send(index, reply);
                    self.login(index);
                }
            }
            SessionMessage::LoginOk { refresh_token, heartbeat_interval_secs } => {
                self.on_login_ok(index, refresh_token, heartbeat_interval_secs);
            }
            SessionMessage::LoginFailed(failure) => self.on_login_failed(index, failure),
            SessionMessage::FreeLicenseResponse => {
                let bytes = self
                    .io
                    .lock()
                    .unwrap()
                    .get_mut(&index)
                    .map(|io| io.codec.encode_set_games_played(0));
                if let Some(bytes) = bytes {
                    self.readiness.send(index, bytes);
                }
            }
            SessionMessage::GameConnectTokens => {
                let bytes = self
                    .io
                    .lock()
                    .unwrap()
                    .get_mut(&index)
                    .map(|io| io.codec.encode_client_hello(self.client_version));
                if let Some(bytes) = bytes {
                    self.readiness.send(index, bytes);
                }
            }
            SessionMessage::Batch(inner) => {
                for message in inner {
                    self.handle_message(index, message);
                }
            }
            SessionMessage::LoggedOff { min_reconnect_secs } => {
                self.cancel_heartbeat(index);
                let delay = min_reconnect_secs.max(4) as i64 + 1;
                self.schedule_reconnect(index, delay.max(MIN_RECONNECT_FLOOR_SECS));
            }
            SessionMessage::GcFrame(GcMessage::ClientWelcome) => {
                if let Some(bot) = self.fleet.lock().unwrap().get_mut(index) {
                    bot.status = BotStatus::InGame;
                }
                info!(self.log, "bot entered game"; "bot" => self.bot_name(index));
            }
            SessionMessage::GcFrame(GcMessage::InspectionResponse(result)) => {
                if let Some(dispatcher) = self.dispatcher.get() {
                    dispatcher.on_response(result.asset, result.wear, result.seed, result.stickers, result.keychain);
                }
            }
            SessionMessage::GcFrame(GcMessage::Other) | SessionMessage::Unknown => {
                debug!(self.log, "dropping unrecognized message"; "bot" => self.bot_name(index));
            }
        }
    }

    fn login(&self, index: usize) {
        let name = self.bot_name(index);
        let stored_token = self.token_store.get(&name);

        let (account_name, password, code) = if stored_token.is_some() {
            (name.clone(), String::new(), None)
        } else {
            let shared_secret = self
                .fleet
                .lock()
                .unwrap()
                .get(index)
                .and_then(|bot| bot.credentials.shared_secret.clone());

            let authenticator: Box<dyn Authenticator> = match shared_secret {
                Some(secret) => Box::new(TotpAuthenticator::new(secret)),
                None => match &self.auth_handler {
                    Some(handler) => handler.new_authenticator(&name),
                    None => {
                        error!(self.log, "bot has no shared secret and no authentication handler is configured"; "bot" => &name);
                        self.error_path(index, RECONNECT_LOGIN_FAILURE_SECS);
                        return;
                    }
                },
            };
            let code = authenticator.get_code(GuardKind::DeviceCode);
            let password = self
                .fleet
                .lock()
                .unwrap()
                .get(index)
                .map(|bot| bot.credentials.password.clone())
                .unwrap_or_default();
            (name.clone(), password, Some(code))
        };

        let bytes = self.io.lock().unwrap().get_mut(&index).map(|io| {
            io.codec
                .encode_login(&account_name, &password, code.as_deref(), stored_token.as_deref())
        });
        if let Some(bytes) = bytes {
            self.readiness.send(index, bytes);
        }
    }

    fn on_login_ok(&self, index: usize, refresh_token: Option<String>, heartbeat_interval_secs: i32) {
        let name = self.bot_name(index);
        self.token_store.set(&name, refresh_token);

        {
            let mut fleet = self.fleet.lock().unwrap();
            if let Some(bot) = fleet.get_mut(index) {
                bot.status = BotStatus::LoggedIn;
                bot.pending_authenticator = None;
                bot.credentials.password.clear();
            }
        }

        let interval = if heartbeat_interval_secs > 0 {
            heartbeat_interval_secs
        } else {
            FALLBACK_HEARTBEAT_INTERVAL_SECS
        };
        if let Some(io) = self.io.lock().unwrap().get_mut(&index) {
            io.heartbeat_interval_secs = interval;
        }
        self.schedule_first_heartbeat(index, interval);

        let bytes = self
            .io
            .lock()
            .unwrap()
            .get_mut(&index)
            .map(|io| io.codec.encode_free_license_request());
        if let Some(bytes) = bytes {
            self.readiness.send(index, bytes);
        }
    }

    fn on_login_failed(&self, index: usize, failure: LoginFailure) {
        let name = self.bot_name(index);
        match failure {
            LoginFailure::Expired => {
                self.token_store.set(&name, None);
                self.error_path(index, 0);
            }
            LoginFailure::TryAnotherCm => self.error_path(index, 0),
            LoginFailure::Other => self.error_path(index, RECONNECT_LOGIN_FAILURE_SECS),
        }
    }

    fn schedule_first_heartbeat(&self, index: usize, interval_secs: i32) {
        let fire_at = timestamp_nanos() + (interval_secs.max(1) as i64) * 1_000_000_000;
        let landed_at = self.scheduler.insert(fire_at, Task::Heartbeat(index));
        if let Some(io) = self.io.lock().unwrap().get_mut(&index) {
            io.next_heartbeat_ns = landed_at;
        }
    }

    /// Called by the scheduler router when a `Heartbeat(index)` task fires
    /// at `fired_at_ns` (§4.8). The actual encode-and-write is pool-
    /// dispatched so the scheduler thread is never blocked on it.
    pub fn on_heartbeat_fired(&self, index: usize, fired_at_ns: i64) {
        let session = self.arc();
        self.pool.schedule(move || session.run_heartbeat(index, fired_at_ns));
    }

    fn run_heartbeat(&self, index: usize, fired_at_ns: i64) {
        let (stale, interval_secs) = {
            let io_table = self.io.lock().unwrap();
            match io_table.get(&index) {
                Some(io) => (io.next_heartbeat_ns == 0 || io.next_heartbeat_ns > fired_at_ns, io.heartbeat_interval_secs),
                None => (true, FALLBACK_HEARTBEAT_INTERVAL_SECS),
            }
        };
        if stale {
            return;
        }

        let bytes = self.io.lock().unwrap().get_mut(&index).map(|io| io.codec.encode_heartbeat());
        if let Some(bytes) = bytes {
            self.readiness.send(index, bytes);
        }

        let next_fire_at = fired_at_ns + (interval_secs.max(1) as i64) * 1_000_000_000;
        let landed_at = self.scheduler.insert(next_fire_at, Task::Heartbeat(index));
        if let Some(io) = self.io.lock().unwrap().get_mut(&index) {
            io.next_heartbeat_ns = landed_at;
        }
    }
}

impl ConnectionEvents for Session {
    fn on_established(&self, bot_index: usize) {
        if let Some(bot) = self.fleet.lock().unwrap().get_mut(bot_index) {
            bot.status = BotStatus::Connected;
        }
        info!(self.log, "connection established"; "bot" => self.bot_name(bot_index));
    }

    fn on_data(&self, bot_index: usize, data: &[u8]) {
        if let Some(io) = self.io.lock().unwrap().get_mut(&bot_index) {
            io.buffer.extend_from_slice(data);
        }

        loop {
            let decoded = {
                let mut io_table = self.io.lock().unwrap();
                let io = match io_table.get_mut(&bot_index) {
                    Some(io) => io,
                    None => return,
                };
                match io.codec.decode(&io.buffer) {
                    Ok(Some((message, consumed))) => {
                        io.buffer.drain(..consumed);
                        Ok(Some(message))
                    }
                    Ok(None) => Ok(None),
                    Err(err) => Err(err),
                }
            };

            match decoded {
                Ok(Some(message)) => self.handle_message(bot_index, message),
                Ok(None) => return,
                Err(err) => {
                    warn!(self.log, "protocol decode error"; "bot" => self.bot_name(bot_index), "err" => %err);
                    self.error_path(bot_index, RECONNECT_TRANSIENT_SECS);
                    return;
                }
            }
        }
    }

    fn on_error(&self, bot_index: usize, err: GwError) {
        warn!(self.log, "connection error"; "bot" => self.bot_name(bot_index), "err" => %err);
        self.error_path(bot_index, RECONNECT_TRANSIENT_SECS);
    }
}

impl FleetSink for Session {
    fn len(&self) -> usize {
        self.fleet.lock().unwrap().len()
    }

    fn can_inspect(&self, index: usize) -> bool {
        self.fleet.lock().unwrap().get(index).map(|bot| bot.can_inspect()).unwrap_or(false)
    }

    fn last_inspect(&self, index: usize) -> Option<Instant> {
        self.fleet.lock().unwrap().get(index).and_then(|bot| bot.last_inspect)
    }

    fn mark_inspect_sent(&self, index: usize, when: Instant) {
        if let Some(bot) = self.fleet.lock().unwrap().get_mut(index) {
            bot.last_inspect = Some(when);
        }
    }

    fn send_inspect(&self, index: usize, items: &[Item]) -> Result<(), ()> {
        let bytes = self
            .io
            .lock()
            .unwrap()
            .get_mut(&index)
            .map(|io| io.codec.encode_inspect_request(items));
        match bytes {
            Some(bytes) => {
                self.readiness.send(index, bytes);
                Ok(())
            }
            None => Err(()),
        }
    }

    fn schedule_error(&self, index: usize) {
        let session = self.arc();
        self.pool.schedule(move || session.error_path(index, RECONNECT_TRANSIENT_SECS));
    }
}
