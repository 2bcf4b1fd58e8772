/*
 * Copyright (C) 2025 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::connection::{CommTask, TaskConfig};
use crate::dispatch::{Dispatcher, ResponseChannel, ResponseEvent, ResponseAddress};
use crate::listener::{Handoff, Listener};
use crate::stats::ServerStatistics;
use arrayvec::ArrayString;
use log::{debug, error, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use std::fmt::Write;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::rc::Rc;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Instant;

const WAKER_TOKEN: Token = Token(0);
const CONN_BASE: usize = 1;

const EVENTS_MAX: usize = 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub workers: usize,
    // per worker
    pub maxconn: usize,
    pub task: TaskConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            maxconn: 10_000,
            task: TaskConfig::default(),
        }
    }
}

fn gen_id(worker_id: usize, key: usize, generation: u32) -> ArrayString<32> {
    let mut s = ArrayString::new();

    write!(&mut s, "{}-{}-{:x}", worker_id, key, generation).unwrap();

    s
}

struct ConnEntry {
    task: CommTask<TcpStream>,
    interest: Option<Interest>,
    deadline: Option<Instant>,
    generation: u32,
}

// One event loop thread. Owns a poll, a slab of connections and the
// receive side of the response channel. Each connection is
// affinitized here for its whole life; all of its state is only ever
// touched on this thread.
struct Worker {
    thread: Option<thread::JoinHandle<()>>,
    stop: mpsc::Sender<()>,
    waker: Arc<Waker>,
    accept_tx: mpsc::Sender<(TcpStream, SocketAddr)>,
}

impl Worker {
    fn new(
        id: usize,
        config: &ServerConfig,
        dispatcher: Arc<dyn Dispatcher>,
        stats: Arc<ServerStatistics>,
    ) -> Result<Worker, io::Error> {
        debug!("worker {}: starting", id);

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let (accept_tx, accept_rx) = mpsc::channel();
        let (resp_tx, resp_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel();

        let channel = ResponseChannel::new(resp_tx, Arc::clone(&waker));

        let task_cfg = config.task.clone();
        let maxconn = config.maxconn;

        let thread = thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || {
                Self::run(
                    id, poll, channel, accept_rx, resp_rx, stop_rx, task_cfg, maxconn, dispatcher,
                    stats,
                );

                debug!("worker {}: stopped", id);
            })?;

        Ok(Self {
            thread: Some(thread),
            stop: stop_tx,
            waker,
            accept_tx,
        })
    }

    fn handoff(&self) -> Handoff {
        Handoff {
            tx: self.accept_tx.clone(),
            waker: Arc::clone(&self.waker),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        id: usize,
        mut poll: Poll,
        channel: ResponseChannel,
        accept_rx: mpsc::Receiver<(TcpStream, SocketAddr)>,
        resp_rx: mpsc::Receiver<(ResponseAddress, ResponseEvent)>,
        stop_rx: mpsc::Receiver<()>,
        task_cfg: TaskConfig,
        maxconn: usize,
        dispatcher: Arc<dyn Dispatcher>,
        stats: Arc<ServerStatistics>,
    ) {
        let cfg = Rc::new(task_cfg);

        let mut conns: Slab<ConnEntry> = Slab::with_capacity(maxconn);
        let mut next_generation: u32 = 0;

        let mut events = Events::with_capacity(EVENTS_MAX);
        let mut touched: Vec<usize> = Vec::new();

        loop {
            let now = Instant::now();

            let timeout = conns
                .iter()
                .filter_map(|(_, c)| c.deadline)
                .min()
                .map(|deadline| deadline.saturating_duration_since(now));

            if let Err(e) = poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }

                error!("worker {}: poll failed: {:?}", id, e);
                break;
            }

            let now = Instant::now();

            touched.clear();

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {}
                    token => {
                        let key = usize::from(token) - CONN_BASE;

                        if let Some(entry) = conns.get_mut(key) {
                            // error and hangup surface through the
                            // read path, where the task observes the
                            // failure or the EOF itself
                            if event.is_readable() || event.is_read_closed() || event.is_error() {
                                entry.task.on_read_ready(now);
                            }

                            if event.is_writable() {
                                entry.task.on_write_ready(now);
                            }

                            touched.push(key);
                        }
                    }
                }
            }

            if stop_rx.try_recv().is_ok() {
                break;
            }

            // sockets handed off by the listener
            while let Ok((stream, peer_addr)) = accept_rx.try_recv() {
                if conns.len() >= maxconn {
                    warn!(
                        "worker {}: connection limit reached, dropping {}",
                        id, peer_addr
                    );
                    continue;
                }

                let entry = conns.vacant_entry();
                let key = entry.key();

                let generation = next_generation;
                next_generation = next_generation.wrapping_add(1);

                let mut stream = stream;

                if let Err(e) = poll.registry().register(
                    &mut stream,
                    Token(key + CONN_BASE),
                    Interest::READABLE,
                ) {
                    error!("worker {}: register failed: {:?}", id, e);
                    continue;
                }

                stats.connection_opened();

                let mut task = CommTask::new(
                    stream,
                    peer_addr,
                    gen_id(id, key, generation),
                    key,
                    generation,
                    Rc::clone(&cfg),
                    Arc::clone(&dispatcher),
                    channel.clone(),
                    Arc::clone(&stats),
                );

                task.on_setup(now);

                // the socket may have been readable before it was
                // registered; catch up instead of waiting for an edge
                task.on_read_ready(now);

                entry.insert(ConnEntry {
                    task,
                    interest: Some(Interest::READABLE),
                    deadline: None,
                    generation,
                });

                touched.push(key);
            }

            // responses completed by handlers, possibly on other
            // threads. generation mismatches are responses addressed
            // to a connection that no longer exists
            while let Ok((addr, event)) = resp_rx.try_recv() {
                if let Some(entry) = conns.get_mut(addr.conn) {
                    if entry.generation == addr.generation {
                        entry.task.on_response(addr.seq, event, now);
                        touched.push(addr.conn);
                    }
                }
            }

            // keep-alive deadlines
            for (key, entry) in conns.iter_mut() {
                if let Some(deadline) = entry.deadline {
                    if deadline <= now {
                        entry.task.on_timeout(now);
                        touched.push(key);
                    }
                }
            }

            touched.sort_unstable();
            touched.dedup();

            for &key in touched.iter() {
                let mut remove = false;

                if let Some(entry) = conns.get_mut(key) {
                    if entry.task.is_closed() {
                        remove = true;
                    } else if let Err(e) = Self::reconcile(poll.registry(), key, entry) {
                        error!("worker {}: registration failed: {:?}", id, e);
                        remove = true;
                    }
                } else {
                    continue;
                }

                if remove {
                    let mut entry = conns.remove(key);

                    if entry.interest.is_some() {
                        let _ = poll.registry().deregister(entry.task.stream_mut());
                    }

                    let _ = entry.task.stream_mut().shutdown(Shutdown::Write);

                    stats.connection_closed();
                }
            }
        }
    }

    // align the poll registration with what the task wants next
    fn reconcile(registry: &Registry, key: usize, entry: &mut ConnEntry) -> Result<(), io::Error> {
        let want = entry.task.wants();

        entry.deadline = want.deadline;

        let desired = match (want.read, want.write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };

        if desired == entry.interest {
            return Ok(());
        }

        let token = Token(key + CONN_BASE);

        match (entry.interest, desired) {
            (Some(_), Some(interest)) => {
                registry.reregister(entry.task.stream_mut(), token, interest)?
            }
            (None, Some(interest)) => {
                registry.register(entry.task.stream_mut(), token, interest)?
            }
            (Some(_), None) => registry.deregister(entry.task.stream_mut())?,
            (None, None) => {}
        }

        entry.interest = desired;

        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        let _ = self.waker.wake();

        let thread = self.thread.take().unwrap();
        thread.join().unwrap();
    }
}

// Front object: binds, spawns the accept thread and the worker pool,
// and tears everything down on drop.
pub struct Server {
    addr: SocketAddr,
    stats: Arc<ServerStatistics>,
    listener: Option<Listener>,
    workers: Vec<Worker>,
}

impl Server {
    pub fn new(
        addr: SocketAddr,
        config: ServerConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Server, io::Error> {
        assert!(config.workers >= 1);

        let stats = Arc::new(ServerStatistics::new());

        let listener_sock = TcpListener::bind(addr)?;
        let local_addr = listener_sock.local_addr()?;

        let mut workers = Vec::with_capacity(config.workers);
        let mut handoffs = Vec::with_capacity(config.workers);

        for i in 0..config.workers {
            let worker = Worker::new(i, &config, Arc::clone(&dispatcher), Arc::clone(&stats))?;

            handoffs.push(worker.handoff());
            workers.push(worker);
        }

        let listener = Listener::new(vec![listener_sock], handoffs)?;

        info!("listening on {}", local_addr);

        Ok(Server {
            addr: local_addr,
            stats,
            listener: Some(listener),
            workers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stats(&self) -> &Arc<ServerStatistics> {
        &self.stats
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // stop accepting before tearing down the workers
        self.listener = None;
        self.workers.clear();
    }
}

// Single-worker server on an ephemeral port, for wire-level tests.
pub struct TestServer {
    server: Server,
}

impl TestServer {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self::with_config(
            ServerConfig {
                workers: 1,
                maxconn: 128,
                task: TaskConfig::default(),
            },
            dispatcher,
        )
    }

    pub fn with_config(config: ServerConfig, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let server = Server::new("127.0.0.1:0".parse().unwrap(), config, dispatcher).unwrap();

        Self { server }
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn stats(&self) -> &Arc<ServerStatistics> {
        self.server.stats()
    }
}
