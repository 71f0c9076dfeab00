// TCP server: listener, per-connection readers, worker pool, sweeper.
//
// Architecture: thread-per-reader feeding a fixed worker pool over a
// `crossbeam-channel`.
//
// - **Listener thread** (non-blocking `accept()` loop): accepts connections
//   and spawns a reader thread for each. Checks `keep_running` between
//   accepts.
// - **Reader threads** (one per connection): read one `RequestFrame` under
//   the idle deadline, post it as a `Job` to the pool, then wait for the
//   worker's `Flow` before reading the next frame. A connection therefore
//   has at most one frame in flight: idle -> reading -> (tunnel |
//   replying) -> idle, or closed.
// - **Workers** (`threads` of them): run `command::dispatch`, write the
//   reply under the socket deadline, and report back whether to keep
//   reading. A failed write returns drained deliveries to the mailbox.
//   Workers also drain the router's wake channel and push mailboxes out
//   over tunnels.
// - **Sweeper thread**: on every monitor tick, reaps idle sessions and
//   expired entries, drops tunnels whose session is gone, then re-probes
//   peer routers.
//
// Tunnels: after a `Tunnel` request is answered, the reader thread exits
// without closing the socket and the worker parks it in `Links::tunnels`.
// From then on the router writes to it: each push is a `ReplyFrame` of
// sealed deliveries, and the client answers with a status-only
// `ReplyFrame` as its ack. A tunnel is taken out of the table while a
// worker pushes over it, so pushes to one client never interleave. A client
// has at most one tunnel; parking a new one closes the old.
//
// Deadlines are native socket timeouts; expiry surfaces as a read or write
// error and closes the connection. Registry locks are never held across
// socket I/O.
//
// Shutdown: `RouterHandle::stop` clears `keep_running`, joins the listener
// and sweeper, shuts down every open socket (tunnels included) so readers
// drop their job senders, and joins the workers once the job channel
// drains.

use std::collections::HashMap;
use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use shade_protocol::{
    ClientId, Delivery, ReplyFrame, RequestFrame, Status, read_frame, write_frame,
};
use tracing::{debug, info, warn};

use crate::command::{self, Flow};
use crate::config::{RouterConfig, Timeouts};
use crate::error::Result;
use crate::registry::Router;
use crate::session::Session;

/// Poll interval of the non-blocking accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// One frame waiting for a worker.
struct Job {
    conn: u64,
    frame: RequestFrame,
    writer: Arc<TcpStream>,
    done: Sender<Flow>,
}

/// A parked connection the router pushes deliveries over.
struct Tunnel {
    conn: u64,
    stream: Arc<TcpStream>,
}

/// Open sockets by connection number, and each client's parked tunnel.
/// Lock order: `tunnels` before `connections`.
#[derive(Default)]
struct Links {
    connections: Mutex<HashMap<u64, Arc<TcpStream>>>,
    tunnels: Mutex<HashMap<ClientId, Tunnel>>,
}

impl Links {
    fn close(&self, conn: u64) {
        if let Some(stream) = self.connections.lock().remove(&conn) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Make `tunnel` the client's push channel, closing any older one.
    fn park(&self, client: ClientId, tunnel: Tunnel) {
        let old = self.tunnels.lock().insert(client, tunnel);
        if let Some(old) = old {
            self.close(old.conn);
        }
    }

    /// Hand a tunnel back after a push. If the client parked a newer one
    /// meanwhile, this one is closed instead.
    fn give_back(&self, client: &ClientId, tunnel: Tunnel) {
        let stale = {
            let mut tunnels = self.tunnels.lock();
            if tunnels.contains_key(client) {
                Some(tunnel.conn)
            } else {
                tunnels.insert(client.clone(), tunnel);
                None
            }
        };
        if let Some(conn) = stale {
            self.close(conn);
        }
    }

    fn take(&self, client: &ClientId) -> Option<Tunnel> {
        self.tunnels.lock().remove(client)
    }

    fn has_tunnel(&self, client: &ClientId) -> bool {
        self.tunnels.lock().contains_key(client)
    }

    fn shutdown_all(&self) {
        self.tunnels.lock().clear();
        for (_, stream) in self.connections.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Handle returned by `start_router` to control the running server.
pub struct RouterHandle {
    router: Arc<Router>,
    keep_running: Arc<AtomicBool>,
    shutdown: Option<Sender<()>>,
    links: Arc<Links>,
    listener: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl RouterHandle {
    /// The registries behind the running server.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Signal the router to stop and wait for its threads.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
        drop(self.shutdown.take());
        if let Some(sweeper) = self.sweeper.take() {
            let _ = sweeper.join();
        }
        self.links.shutdown_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        info!("router stopped");
    }

    /// Block until the listener exits.
    pub fn wait(mut self) {
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
    }
}

/// Start the router on background threads. Returns a handle for stopping
/// it and the bound address (useful when port 0 lets the OS pick).
pub fn start_router(mut config: RouterConfig) -> Result<(RouterHandle, SocketAddr)> {
    config.validate()?;
    let listener = TcpListener::bind((config.address.as_str(), config.port))?;
    let addr = listener.local_addr()?;
    // Advertise the port actually bound.
    config.port = addr.port();
    listener.set_nonblocking(true)?;

    let threads = config.threads;
    let router = Arc::new(Router::new(config));
    let keep_running = Arc::new(AtomicBool::new(true));
    let links = Arc::new(Links::default());
    let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

    let mut workers = Vec::with_capacity(threads);
    for i in 0..threads {
        let router = router.clone();
        let jobs = job_rx.clone();
        let links = links.clone();
        workers.push(
            thread::Builder::new()
                .name(format!("router-worker-{i}"))
                .spawn(move || worker_loop(&router, &jobs, &links))?,
        );
    }

    let sweeper = {
        let router = router.clone();
        let links = links.clone();
        thread::Builder::new()
            .name("router-sweeper".into())
            .spawn(move || sweeper_loop(&router, &links, &shutdown_rx))?
    };

    let listener_thread = {
        let router = router.clone();
        let keep_running = keep_running.clone();
        let links = links.clone();
        thread::Builder::new()
            .name("router-listener".into())
            .spawn(move || listener_loop(listener, router, job_tx, keep_running, links))?
    };

    info!(%addr, role = ?router.role(), threads, "router listening");
    Ok((
        RouterHandle {
            router,
            keep_running,
            shutdown: Some(shutdown_tx),
            links,
            listener: Some(listener_thread),
            sweeper: Some(sweeper),
            workers,
        },
        addr,
    ))
}

fn listener_loop(
    listener: TcpListener,
    router: Arc<Router>,
    jobs: Sender<Job>,
    keep_running: Arc<AtomicBool>,
    links: Arc<Links>,
) {
    let mut next_id: u64 = 0;
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                next_id += 1;
                let id = next_id;
                if let Err(e) = prepare(&stream, &router.config().timeouts) {
                    warn!(%peer, "cannot configure connection: {e}");
                    continue;
                }
                let stream = Arc::new(stream);
                links.connections.lock().insert(id, stream.clone());
                debug!(%peer, "connection accepted");

                let jobs = jobs.clone();
                let keep_running = keep_running.clone();
                let conn_links = links.clone();
                let spawned = thread::Builder::new()
                    .name(format!("router-conn-{id}"))
                    .spawn(move || {
                        if connection_loop(id, &stream, peer, &jobs, &keep_running) {
                            debug!(%peer, "connection parked as tunnel");
                            return;
                        }
                        conn_links.close(id);
                        debug!(%peer, "connection closed");
                    });
                if let Err(e) = spawned {
                    warn!(%peer, "cannot spawn reader: {e}");
                    links.close(id);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!("accept failed: {e}");
                break;
            }
        }
    }
}

/// Blocking mode plus the read and write deadlines.
fn prepare(stream: &TcpStream, timeouts: &Timeouts) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeouts.idle()))?;
    stream.set_write_timeout(Some(timeouts.socket()))?;
    Ok(())
}

/// Reader for one connection. Returns true if the connection was parked as
/// a tunnel, false when it should be closed.
fn connection_loop(
    conn: u64,
    stream: &Arc<TcpStream>,
    peer: SocketAddr,
    jobs: &Sender<Job>,
    keep_running: &AtomicBool,
) -> bool {
    let mut reader = BufReader::new(&**stream);
    let (done_tx, done_rx) = crossbeam_channel::bounded::<Flow>(1);

    while keep_running.load(Ordering::SeqCst) {
        let frame: RequestFrame = match read_frame(&mut reader) {
            Ok(frame) => frame,
            Err(e) if is_deadline(&e) => {
                warn!(%peer, "read deadline expired");
                return false;
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return false,
            Err(e) => {
                debug!(%peer, "read failed: {e}");
                return false;
            }
        };
        let job = Job {
            conn,
            frame,
            writer: stream.clone(),
            done: done_tx.clone(),
        };
        if jobs.send(job).is_err() {
            return false;
        }
        match done_rx.recv() {
            Ok(Flow::Read) => {}
            Ok(Flow::Tunnel) => return true,
            Ok(Flow::Close) | Err(_) => return false,
        }
    }
    false
}

fn is_deadline(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn worker_loop(router: &Router, jobs: &Receiver<Job>, links: &Links) {
    let wakeups = router.wakeups();
    loop {
        crossbeam_channel::select! {
            recv(jobs) -> job => match job {
                Ok(job) => run_job(router, links, job),
                Err(_) => break,
            },
            recv(wakeups) -> client => {
                if let Ok(client) = client {
                    push(router, links, &client);
                }
            }
        }
    }
}

fn run_job(router: &Router, links: &Links, job: Job) {
    let outcome = command::dispatch(router, job.frame);
    let mut writer: &TcpStream = &job.writer;
    if let Err(e) = write_frame(&mut writer, &outcome.reply) {
        if is_deadline(&e) {
            warn!("write deadline expired");
        } else {
            debug!("reply write failed: {e}");
        }
        outcome.restore_mailbox();
        let _ = job.done.send(Flow::Close);
        return;
    }

    let mut flow = outcome.flow;
    if flow == Flow::Tunnel {
        let parked = match outcome.session() {
            Some(session) => open_tunnel(router, links, session, job.conn, job.writer.clone()),
            None => Ok(false),
        };
        match parked {
            Ok(true) => {}
            Ok(false) => flow = Flow::Close,
            Err(e) => {
                debug!("cannot park tunnel: {e}");
                flow = Flow::Close;
            }
        }
    }
    let _ = job.done.send(flow);
}

/// Register `stream` as the session's tunnel. Acks are read under the
/// socket deadline rather than the idle one.
fn open_tunnel(
    router: &Router,
    links: &Links,
    session: &Session,
    conn: u64,
    stream: Arc<TcpStream>,
) -> io::Result<bool> {
    // A session torn down by this very frame has nothing to push to.
    if router.session_by_client(session.client_id()).is_none() {
        return Ok(false);
    }
    stream.set_read_timeout(Some(router.config().timeouts.socket()))?;
    links.park(session.client_id().clone(), Tunnel { conn, stream });
    session.set_tunneled(true);
    debug!(client = %session.client_id(), "tunnel open");
    // Anything queued while the tunnel reply was in flight.
    if session.mailbox_len() > 0 {
        router.wake(session.client_id());
    }
    Ok(true)
}

/// Write `client`'s queued deliveries to its tunnel and wait for the ack.
fn push(router: &Router, links: &Links, client: &ClientId) {
    // Absent when another worker is already pushing, or there is no tunnel.
    let Some(tunnel) = links.take(client) else {
        return;
    };
    let Some(session) = router.session_by_client(client) else {
        links.close(tunnel.conn);
        return;
    };
    let deliveries = session.drain_mailbox();
    if deliveries.is_empty() {
        links.give_back(client, tunnel);
        return;
    }

    match send_push(&session, &tunnel.stream, &deliveries) {
        Ok(()) => {
            session.touch();
            links.give_back(client, tunnel);
            // Deliveries that arrived while the tunnel was out of the table.
            if session.mailbox_len() > 0 {
                router.wake(client);
            }
        }
        Err(e) => {
            debug!(%client, "tunnel push failed: {e}");
            session.restore_mailbox(deliveries);
            links.close(tunnel.conn);
            session.set_tunneled(links.has_tunnel(client));
        }
    }
}

fn send_push(session: &Session, stream: &TcpStream, deliveries: &[Delivery]) -> Result<()> {
    let frame = ReplyFrame {
        status: Status::Ok,
        location: None,
        body: command::seal_push(session, deliveries)?,
    };
    let mut wire = stream;
    write_frame(&mut wire, &frame)?;
    let ack: ReplyFrame = read_frame(&mut wire)?;
    if !ack.status.is_success() {
        return Err(io::Error::other(format!("tunnel ack {:?}", ack.status)).into());
    }
    Ok(())
}

/// Close tunnels whose session no longer exists.
fn prune_tunnels(router: &Router, links: &Links) {
    let stale: Vec<u64> = {
        let mut tunnels = links.tunnels.lock();
        let gone: Vec<ClientId> = tunnels
            .keys()
            .filter(|client| router.session_by_client(client).is_none())
            .cloned()
            .collect();
        gone.iter()
            .filter_map(|client| tunnels.remove(client))
            .map(|tunnel| tunnel.conn)
            .collect()
    };
    for conn in stale {
        links.close(conn);
    }
}

fn sweeper_loop(router: &Router, links: &Links, shutdown: &Receiver<()>) {
    let timeouts = &router.config().timeouts;
    let ticker = crossbeam_channel::tick(timeouts.monitor());
    loop {
        crossbeam_channel::select! {
            recv(ticker) -> _ => {
                router.sweep(Instant::now());
                prune_tunnels(router, links);
                router.federation().probe(timeouts.probe());
            }
            recv(shutdown) -> _ => break,
        }
    }
}
