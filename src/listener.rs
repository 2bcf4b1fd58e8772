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

use log::{debug, error};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

const STOP_TOKEN: Token = Token(0);
const LISTENER_BASE: usize = 1;

// route to one worker: the socket channel plus the waker that kicks
// the worker's poll
pub struct Handoff {
    pub tx: mpsc::Sender<(TcpStream, SocketAddr)>,
    pub waker: Arc<Waker>,
}

// Dedicated accept thread. Accepted sockets are distributed
// round-robin over the worker handoffs; a connection stays with its
// worker for life.
pub struct Listener {
    thread: Option<thread::JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Listener {
    pub fn new(listeners: Vec<TcpListener>, handoffs: Vec<Handoff>) -> Result<Listener, io::Error> {
        assert!(!listeners.is_empty() && !handoffs.is_empty());

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), STOP_TOKEN)?);
        let stop = Arc::new(AtomicBool::new(false));

        let mut listeners = listeners;

        for (i, l) in listeners.iter_mut().enumerate() {
            poll.registry()
                .register(l, Token(LISTENER_BASE + i), Interest::READABLE)?;
        }

        let thread = {
            let stop = Arc::clone(&stop);

            thread::Builder::new()
                .name(String::from("listener"))
                .spawn(move || {
                    Self::run(poll, listeners, handoffs, stop);
                })?
        };

        Ok(Self {
            thread: Some(thread),
            stop,
            waker,
        })
    }

    fn run(
        mut poll: Poll,
        listeners: Vec<TcpListener>,
        handoffs: Vec<Handoff>,
        stop: Arc<AtomicBool>,
    ) {
        let mut events = Events::with_capacity(1024);
        let mut next = 0;

        loop {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }

                error!("listener: poll failed: {:?}", e);
                break;
            }

            if stop.load(Ordering::Relaxed) {
                break;
            }

            for event in events.iter() {
                let t = usize::from(event.token());

                if t < LISTENER_BASE {
                    continue;
                }

                let listener = &listeners[t - LISTENER_BASE];

                loop {
                    match listener.accept() {
                        Ok((stream, peer_addr)) => {
                            debug!("accepted connection from {}", peer_addr);

                            if let Err(e) = stream.set_nodelay(true) {
                                error!("set nodelay failed: {:?}", e);
                            }

                            let handoff = &handoffs[next];
                            next = (next + 1) % handoffs.len();

                            match handoff.tx.send((stream, peer_addr)) {
                                Ok(()) => {
                                    let _ = handoff.waker.wake();
                                }
                                Err(_) => {
                                    // this could happen during shutdown
                                    debug!("worker disconnected, dropping connection");
                                }
                            }
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            error!("accept error: {:?}", e);
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.waker.wake();

        let thread = self.thread.take().unwrap();
        thread.join().unwrap();
    }
}
