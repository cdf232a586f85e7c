//! Fleet-based inspection gateway core. Ties together the bot lifecycle
//! engine (C5), the session protocol handler (C6), the inspect dispatcher
//! (C7), the time-ordered scheduler (C1), the bounded worker pool (C2) and
//! the readiness loop (C3+C4) into one running `Gateway`.

pub mod bot;
pub mod collaborators;
pub mod config;
pub mod dispatcher;
pub mod model;
pub mod net;
pub mod scheduler;
pub mod session;
pub mod worker_pool;

use bot::Credentials;
use collaborators::{DirectoryLookup, MetricsSink, TokenStore};
use config::FleetConfig;
use dispatcher::Dispatcher;
use inspectgw_auth::AuthenticationHandler;
use inspectgw_common::logging::Logger;
use model::{InspectTask, Request};
use net::codec::SessionCodec;
use net::readiness::ReadinessLoop;
use scheduler::{Scheduler, Task};
use session::{Session, SessionConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use worker_pool::WorkerPool;

/// Everything a caller must supply beyond what lives in `FleetConfig`: the
/// wire codec constructor and the pluggable collaborators (§6, §10.5).
pub struct GatewayDeps {
    pub codec_factory: Box<dyn Fn() -> Box<dyn SessionCodec> + Send + Sync>,
    pub token_store: Arc<dyn TokenStore>,
    pub metrics: Arc<dyn MetricsSink>,
    pub directory: Arc<dyn DirectoryLookup>,
    pub auth_handler: Option<Arc<dyn AuthenticationHandler>>,
    pub client_version: u32,
}

/// The running gateway: a fleet of logged-in bots fanning out inspection
/// requests admitted through `inspect()`.
pub struct Gateway {
    session: Arc<Session>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
    worker_pool: Arc<WorkerPool>,
    stop: Arc<AtomicBool>,
    readiness_thread: Option<JoinHandle<()>>,
}

impl Gateway {
    pub fn start(log: Logger, config: FleetConfig, deps: GatewayDeps) -> Gateway {
        let worker_pool = Arc::new(WorkerPool::new(config.worker_pool_size, config.worker_pool_size * 64));

        let (readiness_loop, readiness_handle) =
            ReadinessLoop::new().expect("failed to construct the readiness multiplexer");

        // The scheduler's router needs to reach the session and dispatcher,
        // but both are constructed after the scheduler (each needs the
        // scheduler handle in turn). These cells close the loop: `spawn`
        // captures clones of them, and they're populated once construction
        // finishes below.
        let session_cell: Arc<OnceLock<Arc<Session>>> = Arc::new(OnceLock::new());
        let dispatcher_cell: Arc<OnceLock<Arc<Dispatcher>>> = Arc::new(OnceLock::new());

        let router_session = Arc::clone(&session_cell);
        let router_dispatcher = Arc::clone(&dispatcher_cell);
        let scheduler = Arc::new(Scheduler::spawn(move |fired_at, task| match task {
            Task::Heartbeat(index) => {
                if let Some(session) = router_session.get() {
                    session.on_heartbeat_fired(index, fired_at);
                }
            }
            Task::InspectTimeout(asset) => {
                if let Some(dispatcher) = router_dispatcher.get() {
                    dispatcher.on_timeout(asset);
                }
            }
            Task::Deferred(thunk) => thunk(),
        }));

        let session = Session::new(
            log.new(inspectgw_common::logging::o!("component" => "session")),
            Arc::clone(&scheduler),
            Arc::clone(&worker_pool),
            readiness_handle,
            deps.codec_factory,
            SessionConfig {
                proxy_list: config.proxy_list.clone(),
                ignore_proxy: config.ignore_proxy,
                client_version: deps.client_version,
                token_store: deps.token_store,
                metrics: deps.metrics,
                directory: deps.directory,
                auth_handler: deps.auth_handler,
            },
        );
        let _ = session_cell.set(Arc::clone(&session));

        let fleet_sink: Arc<dyn dispatcher::FleetSink> = Arc::clone(&session);
        let dispatcher = Dispatcher::new(config.inspect_capacity, fleet_sink, Arc::clone(&scheduler));
        let _ = dispatcher_cell.set(Arc::clone(&dispatcher));
        session.bind_dispatcher(Arc::clone(&dispatcher));

        for bot in config.bots {
            session.add_bot(Credentials {
                name: bot.name,
                password: bot.password,
                shared_secret: bot.shared_secret,
            });
        }

        let stop = Arc::new(AtomicBool::new(false));
        let readiness_thread = {
            let stop = Arc::clone(&stop);
            let events_handler = Arc::clone(&session);
            let pool = Arc::clone(&worker_pool);
            let mut readiness_loop = readiness_loop;
            Some(thread::spawn(move || {
                readiness_loop.run(events_handler, &pool, || stop.load(Ordering::Relaxed));
            }))
        };

        Gateway {
            session,
            dispatcher,
            scheduler,
            worker_pool,
            stop,
            readiness_thread,
        }
    }

    /// Submits an inspection request, returning the accepted item count and
    /// a receiver that fires once every accepted item has resolved or timed
    /// out (§4.7).
    pub fn inspect(&self, request: Request) -> (u32, Option<(Arc<InspectTask>, Receiver<()>)>) {
        self.dispatcher.inspect(request)
    }

    /// `[DISCONNECTED, CONNECTED, LOGGED_IN, INGAME, total]` (§6).
    pub fn bot_status(&self) -> [usize; 5] {
        self.session.status_counts()
    }

    pub fn add_bot(&self, credentials: Credentials) -> usize {
        self.session.add_bot(credentials)
    }

    /// Stops the readiness loop and joins its thread. The scheduler and
    /// worker pool stop themselves when their `Arc`s drop.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.readiness_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}
