//! Role routing for the boss / manager / worker process tree.
//!
//! [`Server::run_and_fork`] is called once, in the process that will become
//! the boss. Every fork point inside it decides which role the calling
//! process continues as, and every process eventually returns a
//! [`ServerState`] from the same call:
//!
//! ```text
//! boss ──fork──▶ manager ──fork × N──▶ worker
//!   │                │
//!   │  SIGUSR1       └─ fork failures ─▶ worker (demoted)
//!   └──fork──▶ next-generation manager
//! ```
//!
//! Hooks run per role:
//!
//! | Hook                           | Boss | Manager | Worker (forked) | Worker (demoted) |
//! |--------------------------------|------|---------|-----------------|------------------|
//! | `prepare_process`              |      | ✓       | inherited       | ✓                |
//! | `init_unforkable_resources`    |      | ✓       | inherited       | ✓                |
//! | `start_service` / `stop_service` |    |         | ✓               | ✓                |
//! | `cleanup_unforkable_resources` |      | ✓       |                 | ✓                |
//! | `finalize_process`             |      | ✓       | ✓               | ✓                |

use std::error::Error;
use std::io;
use std::sync::Arc;

use nix::unistd::{getpid, Pid};
use tracing::{debug, error, info, info_span, warn};

use crate::config::Config;
use crate::error::ServerState;
use crate::fcgi::{serve_connection, ListenAddr, Listener, Request, ServiceIo};
use crate::pool::{PoolSettings, ProcessPool, Supervision};
use crate::process::{ForkOutcome, ProcessOps, UnixProcess};
use crate::registry::ChildRegistry;
use crate::logging;
use crate::reload::{
    BossExit, BossSettings, FileStatusSink, GenerationEvent, NullSink, ReloadCoordinator,
    StatusSink,
};
use crate::shm::{Handshake, SharedFlag};
use crate::signals::{self, Flags, ProcessFlags};

/// Result of a lifecycle hook. Any error aborts the process with the
/// matching [`ServerState`].
pub type HookResult = Result<(), Box<dyn Error + Send + Sync>>;

/// The application served by every worker.
///
/// All hooks default to success. `query` is called once per request.
pub trait Service {
    /// First thing a new manager generation runs.
    fn prepare_process(&mut self) -> HookResult {
        Ok(())
    }

    /// Acquire resources that must exist before workers are forked and are
    /// inherited by them.
    fn init_unforkable_resources(&mut self) -> HookResult {
        Ok(())
    }

    fn start_service(&mut self) -> HookResult {
        Ok(())
    }

    fn stop_service(&mut self) -> HookResult {
        Ok(())
    }

    fn cleanup_unforkable_resources(&mut self) -> HookResult {
        Ok(())
    }

    fn finalize_process(&mut self) -> HookResult {
        Ok(())
    }

    /// Handle one request. Failures are reported to the client through `io`.
    fn query(&mut self, io: &mut dyn ServiceIo, request: &Request);
}

/// How a process came to be a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOrigin {
    /// Forked by its manager.
    Forked,
    /// A manager that stopped supervising after repeated fork failures.
    Demoted,
}

/// Role of the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Boss,
    Manager,
    Worker(WorkerOrigin),
}

impl Role {
    /// Only processes that ran `init_unforkable_resources` clean them up.
    pub fn runs_cleanup(self) -> bool {
        matches!(self, Self::Manager | Self::Worker(WorkerOrigin::Demoted))
    }

    pub fn runs_finalize(self) -> bool {
        self != Self::Boss
    }
}

/// Cloneable control handle for embedder threads.
#[derive(Clone)]
pub struct ServerHandle {
    flags: Arc<dyn Flags>,
    registry: Arc<ChildRegistry>,
}

impl ServerHandle {
    /// Ask the current process to leave its loop and shut down.
    pub fn exit(&self) {
        self.flags.request_exit();
    }

    /// Replace every worker of this generation on the next poll tick.
    /// Does nothing outside a manager.
    pub fn refork_all_children(&self) {
        self.registry.mark_all_for_reload();
    }
}

/// Config of the generation being started and of the last one that took
/// over successfully.
///
/// A new generation reads the config file again; if that fails it falls
/// back to `last_good`, never to a config whose generation did not confirm.
struct GenerationConfig {
    path: Option<String>,
    last_good: Config,
    candidate: Config,
}

impl GenerationConfig {
    fn new(path: Option<String>, boot: Config) -> Self {
        Self {
            path,
            last_good: boot.clone(),
            candidate: boot,
        }
    }

    fn handle(&mut self, event: GenerationEvent) {
        match event {
            GenerationEvent::Forking => {
                self.candidate = Config::load_or(self.path.as_deref(), &self.last_good);
            }
            GenerationEvent::Confirmed => self.last_good = self.candidate.clone(),
        }
    }
}

/// A pre-fork FastCGI server around `S`.
pub struct Server<S: Service> {
    service: S,
    config_path: Option<String>,
    listen: Option<ListenAddr>,
    ops: Arc<dyn ProcessOps>,
    flags: Arc<dyn Flags>,
    registry: Arc<ChildRegistry>,
}

impl<S: Service> Server<S> {
    pub fn new(service: S) -> Self {
        Self {
            service,
            config_path: None,
            listen: None,
            ops: Arc::new(UnixProcess),
            flags: Arc::new(ProcessFlags),
            registry: Arc::new(ChildRegistry::new()),
        }
    }

    /// Config file read by every new generation. Defaults to
    /// [`DEFAULT_CONFIG_FILE`](crate::config::DEFAULT_CONFIG_FILE).
    #[must_use]
    pub fn config_path(mut self, path: Option<String>) -> Self {
        self.config_path = path;
        self
    }

    /// Listen address overriding the config file.
    #[must_use]
    pub fn listen(mut self, addr: ListenAddr) -> Self {
        self.listen = Some(addr);
        self
    }

    #[must_use]
    pub fn with_process_ops(mut self, ops: Arc<dyn ProcessOps>) -> Self {
        self.ops = ops;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: Arc<dyn Flags>) -> Self {
        self.flags = flags;
        self
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            flags: Arc::clone(&self.flags),
            registry: Arc::clone(&self.registry),
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Become the boss, fork the first manager generation, and return once
    /// this process (whichever role it ends up in) is done.
    pub fn run_and_fork(&mut self) -> ServerState {
        let boot = Config::load_or(self.config_path.as_deref(), &Config::default());

        if let Err(e) = signals::install_exit_handler() {
            error!("failed to install exit handler: {e}");
            return ServerState::UnknownError;
        }
        if let Err(e) = signals::install_log_level_handler() {
            warn!("log level signals unavailable: {e}");
        }
        let handshake = match SharedFlag::new() {
            Ok(flag) => flag,
            Err(e) => {
                error!("failed to map handshake flag: {e}");
                return ServerState::MemoryError;
            }
        };
        let addr = match self.listen.clone() {
            Some(addr) => addr,
            None => match boot.server.listen.parse::<ListenAddr>() {
                Ok(addr) => addr,
                Err(e) => {
                    error!("invalid listen address: {e}");
                    return ServerState::ProtocolError;
                }
            },
        };
        let listener = match Listener::open(&addr) {
            Ok(listener) => listener,
            Err(e) => {
                error!("failed to listen on {addr}: {e}");
                return ServerState::ProtocolError;
            }
        };
        if let Some(path) = &boot.server.pid_file {
            if let Err(e) = std::fs::write(path, std::process::id().to_string()) {
                warn!("failed to write pid file {path}: {e}");
            }
        }
        let sink: Box<dyn StatusSink> = match &boot.server.status_file {
            Some(path) => Box::new(FileStatusSink::new(path)),
            None => Box::new(NullSink),
        };

        let mut generation = GenerationConfig::new(self.config_path.clone(), boot.clone());
        let first_manager = match self.ops.fork() {
            Ok(ForkOutcome::Child) => None,
            Ok(ForkOutcome::Parent(pid)) => Some(Some(pid)),
            Err(e) => {
                error!("failed to fork manager: {e}");
                Some(None)
            }
        };

        if let Some(manager) = first_manager {
            let exit = self.run_boss(manager, &boot, &handshake, sink.as_ref(), &mut generation);
            if exit == BossExit::Shutdown {
                if let Some(path) = &boot.server.pid_file {
                    if let Err(e) = std::fs::remove_file(path) {
                        warn!("failed to remove pid file {path}: {e}");
                    }
                }
                listener.cleanup();
                info!("boss exiting");
                return ServerState::Success;
            }
        }

        self.run_manager(&generation.candidate, &handshake, &listener)
    }

    fn run_boss(
        &self,
        manager: Option<Pid>,
        boot: &Config,
        handshake: &dyn Handshake,
        sink: &dyn StatusSink,
        generation: &mut GenerationConfig,
    ) -> BossExit {
        let span = info_span!("boss", pid = %getpid());
        let _enter = span.enter();

        if let Err(e) = signals::install_reload_handler() {
            warn!("reload handler unavailable, SIGUSR1 will not reload: {e}");
        }
        info!(manager = ?manager.map(Pid::as_raw), "supervising manager generations");

        let mut coordinator = ReloadCoordinator::new(
            Arc::clone(&self.ops),
            handshake,
            sink,
            self.flags.as_ref(),
            BossSettings::from(&boot.server),
            manager,
        )
        .on_generation(|event| generation.handle(event));
        coordinator.run()
    }

    fn run_manager(
        &mut self,
        config: &Config,
        handshake: &dyn Handshake,
        listener: &Listener,
    ) -> ServerState {
        if let Err(e) = signals::disable_reload_handler() {
            warn!("failed to ignore SIGUSR1: {e}");
        }

        let generation = info_span!("manager", pid = %getpid())
            .in_scope(|| self.start_generation(config, handshake));
        let (role, mut pool) = match generation {
            Ok(started) => started,
            Err(state) => return state,
        };

        if let Role::Worker(origin) = role {
            if origin == WorkerOrigin::Forked {
                pool.abandon_drains();
            }
            if let Err(e) = signals::install_worker_exit_handler() {
                warn!("failed to install worker exit handler: {e}");
            }
            let state = info_span!("worker", pid = %getpid(), ?origin)
                .in_scope(|| self.serve(listener));
            if !matches!(state, ServerState::Success | ServerState::ProtocolError) {
                return state;
            }
        }

        self.finish(role, &mut pool)
    }

    /// Run the generation's setup hooks, fork its workers and supervise them.
    ///
    /// Returns the role this process ends up in, along with the pool it
    /// came from.
    fn start_generation(
        &mut self,
        config: &Config,
        handshake: &dyn Handshake,
    ) -> Result<(Role, ProcessPool), ServerState> {
        info!(workers = config.server.worker_count, "manager starting");
        if let Err(e) = self.service.prepare_process() {
            error!("prepare_process failed: {e}");
            return Err(ServerState::PrepareProcessError);
        }
        if let Err(e) = self.service.init_unforkable_resources() {
            error!("init_unforkable_resources failed: {e}");
            return Err(ServerState::InitUnforkableResourcesError);
        }

        self.registry.reset(config.server.worker_count);
        let mut pool = ProcessPool::new(
            Arc::clone(&self.ops),
            Arc::clone(&self.registry),
            PoolSettings::from(&config.server),
        );

        let role = match pool.fork_children() {
            Supervision::BecameWorker => Role::Worker(WorkerOrigin::Forked),
            Supervision::Demoted => {
                warn!("cannot fork workers, serving requests from the manager");
                Role::Worker(WorkerOrigin::Demoted)
            }
            Supervision::Continue => {
                handshake.mark_finished();
                match pool.supervise(self.flags.as_ref()) {
                    Supervision::BecameWorker => Role::Worker(WorkerOrigin::Forked),
                    Supervision::Demoted => {
                        warn!("cannot replace workers, serving requests from the manager");
                        Role::Worker(WorkerOrigin::Demoted)
                    }
                    Supervision::Continue => {
                        pool.shutdown();
                        pool.join_drains();
                        Role::Manager
                    }
                }
            }
        };
        Ok((role, pool))
    }

    /// Accept and serve connections until exit is requested.
    fn serve(&mut self, listener: &Listener) -> ServerState {
        if let Err(e) = self.service.start_service() {
            error!("start_service failed: {e}");
            return ServerState::StartServiceError;
        }
        info!("worker serving on {}", listener.addr());

        let flags = Arc::clone(&self.flags);
        let stop = || flags.exit_requested() || flags.shutdown_pending();
        let service = &mut self.service;
        while !flags.exit_requested() {
            logging::apply_requested_level(flags.as_ref());
            match listener.accept() {
                Ok(mut conn) => {
                    let served =
                        serve_connection(&mut conn, &stop, |io, req| service.query(io, req));
                    if let Err(e) = served {
                        debug!("connection ended with error: {e}");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("accept failed: {e}");
                    break;
                }
            }
        }

        if let Err(e) = self.service.stop_service() {
            error!("stop_service failed: {e}");
            return ServerState::StopServiceError;
        }
        if self.flags.exit_requested() {
            ServerState::Success
        } else {
            ServerState::ProtocolError
        }
    }

    /// Teardown shared by every non-boss role.
    fn finish(&mut self, role: Role, pool: &mut ProcessPool) -> ServerState {
        if role == Role::Worker(WorkerOrigin::Demoted) {
            pool.shutdown();
            pool.join_drains();
        }
        if role.runs_cleanup() {
            if let Err(e) = self.service.cleanup_unforkable_resources() {
                error!("cleanup_unforkable_resources failed: {e}");
                return ServerState::CleanupUnforkableResourcesError;
            }
        }
        if role.runs_finalize() {
            if let Err(e) = self.service.finalize_process() {
                error!("finalize_process failed: {e}");
                return ServerState::FinalizeProcessError;
            }
        }
        info!(?role, "process exiting");
        if self.flags.exit_requested() {
            ServerState::Success
        } else {
            ServerState::ProtocolError
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcgi::record;
    use crate::signals::ManualFlags;
    use crate::testing::{FakeProcess, MemoryHandshake, SplitFlags};
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::Mutex;

    /// Records every hook call; fails the hooks listed in `failing`.
    #[derive(Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<&'static str>>>,
        failing: Vec<&'static str>,
        exit_after_query: Option<Arc<dyn Flags>>,
    }

    impl Recorder {
        fn hook(&mut self, name: &'static str) -> HookResult {
            self.calls.lock().unwrap().push(name);
            if self.failing.contains(&name) {
                return Err(format!("{name} refused").into());
            }
            Ok(())
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Service for Recorder {
        fn prepare_process(&mut self) -> HookResult {
            self.hook("prepare")
        }
        fn init_unforkable_resources(&mut self) -> HookResult {
            self.hook("init")
        }
        fn start_service(&mut self) -> HookResult {
            self.hook("start")
        }
        fn stop_service(&mut self) -> HookResult {
            self.hook("stop")
        }
        fn cleanup_unforkable_resources(&mut self) -> HookResult {
            self.hook("cleanup")
        }
        fn finalize_process(&mut self) -> HookResult {
            self.hook("finalize")
        }
        fn query(&mut self, io: &mut dyn ServiceIo, request: &Request) {
            self.calls.lock().unwrap().push("query");
            io.add_header_field("Content-type: text/plain");
            io.end_header_field();
            let name = request.parameter_for_name_with_default("name", "nobody");
            io.print(format_args!("hello {name}"));
            if let Some(flags) = &self.exit_after_query {
                flags.request_exit();
            }
        }
    }

    struct Fixture {
        server: Server<Recorder>,
        ops: Arc<FakeProcess>,
        flags: Arc<ManualFlags>,
        handshake: MemoryHandshake,
    }

    fn fixture(service: Recorder) -> Fixture {
        let ops = Arc::new(FakeProcess::new());
        let flags = Arc::new(ManualFlags::new());
        let server = Server::new(service)
            .with_process_ops(ops.clone())
            .with_flags(flags.clone());
        Fixture {
            server,
            ops,
            flags,
            handshake: MemoryHandshake::default(),
        }
    }

    fn config(workers: usize) -> Config {
        let mut config = Config::default();
        config.server.worker_count = workers;
        config.server.poll_interval_ms = 1;
        config.server.drain_grace_secs = 0;
        config
    }

    #[test]
    fn test_fallback_config_is_last_confirmed_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forkserve.yaml");
        let write = |workers: usize| {
            std::fs::write(&path, format!("server:\n  worker_count: {workers}\n")).unwrap();
        };
        let mut generation =
            GenerationConfig::new(path.to_str().map(String::from), Config::default());

        write(3);
        generation.handle(GenerationEvent::Forking);
        generation.handle(GenerationEvent::Confirmed);
        assert_eq!(generation.last_good.server.worker_count, 3);

        // This generation never confirms.
        write(5);
        generation.handle(GenerationEvent::Forking);
        assert_eq!(generation.candidate.server.worker_count, 5);
        assert_eq!(generation.last_good.server.worker_count, 3);

        write(0);
        generation.handle(GenerationEvent::Forking);
        assert_eq!(generation.candidate.server.worker_count, 3);
    }

    #[test]
    fn test_role_teardown_rules() {
        assert!(Role::Manager.runs_cleanup());
        assert!(Role::Worker(WorkerOrigin::Demoted).runs_cleanup());
        assert!(!Role::Worker(WorkerOrigin::Forked).runs_cleanup());
        assert!(!Role::Boss.runs_cleanup());
        assert!(Role::Worker(WorkerOrigin::Forked).runs_finalize());
        assert!(!Role::Boss.runs_finalize());
    }

    #[test]
    fn test_generation_forks_workers_and_confirms() {
        let mut fx = fixture(Recorder::default());
        fx.flags.request_exit();
        let (role, _pool) = fx
            .server
            .start_generation(&config(3), &fx.handshake)
            .unwrap();

        assert_eq!(role, Role::Manager);
        assert!(fx.handshake.is_finished());
        assert_eq!(fx.ops.forked().len(), 3);
        // Exit was already requested, so every worker is stopped again.
        assert_eq!(fx.ops.terminated(), fx.ops.forked());
        assert_eq!(fx.ops.alive_count(), 0);
        assert_eq!(fx.server.service().calls(), vec!["prepare", "init"]);
    }

    #[test]
    fn test_prepare_failure_stops_generation() {
        let mut fx = fixture(Recorder {
            failing: vec!["prepare"],
            ..Recorder::default()
        });
        let err = fx
            .server
            .start_generation(&config(2), &fx.handshake)
            .err();
        assert_eq!(err, Some(ServerState::PrepareProcessError));
        assert!(fx.ops.forked().is_empty());
        assert!(!fx.handshake.is_finished());
    }

    #[test]
    fn test_init_failure_stops_generation() {
        let mut fx = fixture(Recorder {
            failing: vec!["init"],
            ..Recorder::default()
        });
        let err = fx
            .server
            .start_generation(&config(2), &fx.handshake)
            .err();
        assert_eq!(err, Some(ServerState::InitUnforkableResourcesError));
        assert_eq!(fx.server.service().calls(), vec!["prepare", "init"]);
    }

    #[test]
    fn test_forked_child_becomes_worker() {
        let mut fx = fixture(Recorder::default());
        fx.ops.child_on_fork(2);
        let (role, _pool) = fx
            .server
            .start_generation(&config(3), &fx.handshake)
            .unwrap();
        assert_eq!(role, Role::Worker(WorkerOrigin::Forked));
        assert!(!fx.handshake.is_finished());
        assert_eq!(fx.ops.forked().len(), 1);
    }

    #[test]
    fn test_fork_failure_demotes_manager() {
        let mut fx = fixture(Recorder::default());
        fx.ops.fail_forks(1);
        let (role, mut pool) = fx
            .server
            .start_generation(&config(2), &fx.handshake)
            .unwrap();
        assert_eq!(role, Role::Worker(WorkerOrigin::Demoted));
        assert!(!fx.handshake.is_finished());

        fx.flags.request_exit();
        assert_eq!(fx.server.finish(role, &mut pool), ServerState::Success);
        assert_eq!(
            fx.server.service().calls(),
            vec!["prepare", "init", "cleanup", "finalize"]
        );
    }

    #[test]
    fn test_demoted_worker_reaps_children() {
        let mut fx = fixture(Recorder::default());
        // The first worker forks, the second fails.
        let hook_ops = fx.ops.clone();
        fx.ops.on_fork(move |_| hook_ops.fail_forks(1));
        let (role, mut pool) = fx
            .server
            .start_generation(&config(2), &fx.handshake)
            .unwrap();
        assert_eq!(role, Role::Worker(WorkerOrigin::Demoted));
        let child = fx.ops.forked()[0];
        assert!(fx.ops.is_alive(child));

        fx.flags.request_exit();
        fx.server.finish(role, &mut pool);
        assert!(!fx.ops.is_alive(child));
        assert!(fx.ops.reaped().contains(&child));
    }

    #[test]
    fn test_forked_worker_skips_cleanup() {
        let mut fx = fixture(Recorder::default());
        let mut pool = ProcessPool::new(
            fx.ops.clone(),
            Arc::new(ChildRegistry::new()),
            PoolSettings::default(),
        );
        fx.flags.request_exit();
        let state = fx
            .server
            .finish(Role::Worker(WorkerOrigin::Forked), &mut pool);
        assert_eq!(state, ServerState::Success);
        assert_eq!(fx.server.service().calls(), vec!["finalize"]);
    }

    #[test]
    fn test_teardown_failures() {
        let mut fx = fixture(Recorder {
            failing: vec!["cleanup"],
            ..Recorder::default()
        });
        let mut pool = ProcessPool::new(
            fx.ops.clone(),
            Arc::new(ChildRegistry::new()),
            PoolSettings::default(),
        );
        assert_eq!(
            fx.server.finish(Role::Manager, &mut pool),
            ServerState::CleanupUnforkableResourcesError
        );

        let mut fx = fixture(Recorder {
            failing: vec!["finalize"],
            ..Recorder::default()
        });
        assert_eq!(
            fx.server.finish(Role::Worker(WorkerOrigin::Forked), &mut pool),
            ServerState::FinalizeProcessError
        );
    }

    #[test]
    fn test_finish_without_exit_is_protocol_error() {
        let mut fx = fixture(Recorder::default());
        let mut pool = ProcessPool::new(
            fx.ops.clone(),
            Arc::new(ChildRegistry::new()),
            PoolSettings::default(),
        );
        assert_eq!(
            fx.server.finish(Role::Manager, &mut pool),
            ServerState::ProtocolError
        );
    }

    #[test]
    fn test_handle_reforks_and_exits() {
        let fx = fixture(Recorder::default());
        let handle = fx.server.handle();
        // Before a generation sizes the registry this is a no-op.
        handle.refork_all_children();

        fx.server.registry.reset(2);
        fx.server
            .registry
            .set_slot(0, Some(Pid::from_raw(5)), crate::registry::ChildState::Living);
        handle.refork_all_children();
        assert!(fx
            .server
            .registry
            .snapshot()
            .iter()
            .all(|s| s.state == crate::registry::ChildState::WaitingForReload));

        handle.exit();
        assert!(fx.flags.exit_requested());
    }

    #[test]
    fn test_worker_serves_until_exit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.sock");
        let listener = Listener::open(&ListenAddr::Unix(path.clone())).unwrap();

        let flags = Arc::new(ManualFlags::new());
        let service = Recorder {
            exit_after_query: Some(flags.clone()),
            ..Recorder::default()
        };
        let mut server = Server::new(service).with_flags(flags.clone());

        let client = std::thread::spawn(move || {
            let mut stream = UnixStream::connect(&path).unwrap();
            stream.write_all(&request_bytes("name=fcgi", false)).unwrap();

            let mut response = Vec::new();
            stream.read_to_end(&mut response).unwrap();
            let mut cursor = std::io::Cursor::new(response);
            let mut body = Vec::new();
            while let Some(rec) = record::read_record(&mut cursor).unwrap() {
                if rec.kind == record::STDOUT {
                    body.extend(rec.content);
                }
            }
            body
        });

        assert_eq!(server.serve(&listener), ServerState::Success);
        let body = client.join().unwrap();
        assert_eq!(body, b"Content-type: text/plain\r\n\r\nhello fcgi");
        assert_eq!(server.service().calls(), vec!["start", "query", "stop"]);
        listener.cleanup();
    }

    fn request_bytes(query: &str, keep_conn: bool) -> Vec<u8> {
        let mut bytes = Vec::new();
        let begin = [0, 1, u8::from(keep_conn), 0, 0, 0, 0, 0];
        record::write_record(&mut bytes, record::BEGIN_REQUEST, 1, &begin).unwrap();
        let params = record::encode_pairs([("QUERY_STRING", query)]);
        record::write_record(&mut bytes, record::PARAMS, 1, &params).unwrap();
        record::write_record(&mut bytes, record::PARAMS, 1, &[]).unwrap();
        record::write_record(&mut bytes, record::STDIN, 1, &[]).unwrap();
        bytes
    }

    #[test]
    fn test_exit_request_ends_keep_alive_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keepalive.sock");
        let listener = Listener::open(&ListenAddr::Unix(path.clone())).unwrap();

        // Exit is requested from inside the service; no shutdown signal.
        let flags = Arc::new(SplitFlags::default());
        let service = Recorder {
            exit_after_query: Some(flags.clone()),
            ..Recorder::default()
        };
        let mut server = Server::new(service).with_flags(flags.clone());

        let client = std::thread::spawn(move || {
            let mut stream = UnixStream::connect(&path).unwrap();
            let mut requests = request_bytes("name=first", true);
            requests.extend(request_bytes("name=second", true));
            stream.write_all(&requests).unwrap();
            stream.shutdown(std::net::Shutdown::Write).unwrap();

            let mut completed = 0;
            while let Ok(Some(rec)) = record::read_record(&mut stream) {
                if rec.kind == record::END_REQUEST {
                    completed += 1;
                }
            }
            completed
        });

        assert_eq!(server.serve(&listener), ServerState::Success);
        assert_eq!(client.join().unwrap(), 1);
        assert!(!flags.shutdown_pending());
        assert_eq!(server.service().calls(), vec!["start", "query", "stop"]);
        listener.cleanup();
    }

    #[test]
    fn test_start_service_failure() {
        let dir = tempfile::tempdir().unwrap();
        let listener =
            Listener::open(&ListenAddr::Unix(dir.path().join("w.sock"))).unwrap();
        let mut server = Server::new(Recorder {
            failing: vec!["start"],
            ..Recorder::default()
        })
        .with_flags(Arc::new(ManualFlags::new()));
        assert_eq!(server.serve(&listener), ServerState::StartServiceError);
    }
}
