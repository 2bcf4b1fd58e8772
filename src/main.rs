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

use clap::Parser;
use log::{error, info, LevelFilter, Log, Metadata, Record};
use portico::connection::{Limits, TaskConfig};
use portico::dispatch::{
    error_response, DispatchStatus, Dispatcher, ErrorCode, Request, ResponseSender,
};
use portico::http1::{CorsPolicy, Method, Response, StatusCode};
use portico::server::{Server, ServerConfig};
use std::error::Error;
use std::process;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

// safety values
const WORKERS_MAX: usize = 1024;
const CONNS_MAX: usize = 10_000_000;

// Stdout logger for the server binary. Filtering happens here rather
// than through log::set_max_level alone so the configured level also
// applies to any future dynamic reload. Lines are tagged with the
// emitting thread, which is what distinguishes output once several
// worker loops and the listener are running; the target would read
// the same for all of them.
struct Logger {
    level: LevelFilter,
    local_offset: UtcOffset,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let now = OffsetDateTime::now_utc().to_offset(self.local_offset);

        let format = format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        );

        let ts = now.format(&format).unwrap_or_default();

        let lname = match record.level() {
            log::Level::Error => "ERR",
            log::Level::Warn => "WARN",
            log::Level::Info => "INFO",
            log::Level::Debug => "DEBUG",
            log::Level::Trace => "TRACE",
        };

        let thread = thread::current();
        let name = thread.name().unwrap_or("main");

        println!("[{}] {} [{}] {}", lname, ts, name, record.args());
    }

    fn flush(&self) {}
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

fn init_logger(level: LevelFilter) {
    // the local offset must be read before the worker threads exist
    let logger = LOGGER.get_or_init(|| Logger {
        level,
        local_offset: UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC),
    });

    log::set_logger(logger).unwrap();
    log::set_max_level(level);
}

// Demonstration application: enough routes to exercise plain,
// echoed, and chunked responses through the connection layer.
struct DemoDispatcher;

impl Dispatcher for DemoDispatcher {
    fn dispatch(&self, req: Request, sender: ResponseSender) -> DispatchStatus {
        match (req.method, req.url.as_str()) {
            (Method::Get, "/version") => {
                let body = format!(
                    "{{\"server\":\"portico\",\"version\":\"{}\"}}",
                    env!("CARGO_PKG_VERSION")
                );

                DispatchStatus::Responded(Response::with_body(
                    StatusCode::Ok,
                    "application/json",
                    body.into_bytes(),
                ))
            }
            (Method::Post, "/echo") | (Method::Put, "/echo") => {
                let content_type = req
                    .headers
                    .get("content-type")
                    .unwrap_or("application/octet-stream")
                    .to_string();

                DispatchStatus::Responded(Response::with_body(
                    StatusCode::Ok,
                    &content_type,
                    req.body,
                ))
            }
            (Method::Get, "/stream") => {
                thread::spawn(move || {
                    sender.respond(Response::chunked(StatusCode::Ok));

                    for i in 0..5 {
                        if sender.is_cancelled() {
                            return;
                        }

                        sender.send_chunk(format!("tick {}\n", i).into_bytes());
                        thread::sleep(Duration::from_millis(250));
                    }

                    sender.finish();
                });

                DispatchStatus::Pending
            }
            _ => DispatchStatus::Responded(error_response(ErrorCode::NotFound, "unknown path")),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "portico", version, about = "HTTP/1.x front-end for a database server")]
struct Args {
    /// Address to listen on
    #[arg(long, value_name = "addr:port", default_value = "127.0.0.1:8080")]
    listen: String,

    /// Number of worker threads
    #[arg(long, value_name = "N", default_value_t = 2)]
    workers: usize,

    /// Maximum connections per worker
    #[arg(long, value_name = "N", default_value_t = 10_000)]
    maxconn: usize,

    /// Keep-alive timeout in seconds
    #[arg(long, value_name = "secs", default_value_t = 90)]
    timeout: u64,

    /// Trusted CORS origins, may be given multiple times
    #[arg(long, value_name = "origin")]
    trust_origin: Vec<String>,

    /// Log level (0=error, 1=warn, 2=info, 3=debug, 4=trace)
    #[arg(long, value_name = "N", default_value_t = 2)]
    log_level: u32,
}

fn process_args_and_run(args: Args) -> Result<(), Box<dyn Error>> {
    if args.workers == 0 || args.workers > WORKERS_MAX {
        return Err("failed to parse workers: value out of range".into());
    }

    if args.workers * args.maxconn > CONNS_MAX {
        return Err("total maxconn is too large".into());
    }

    let addr = match args.listen.parse() {
        Ok(addr) => addr,
        Err(e) => return Err(format!("failed to parse listen: {}", e).into()),
    };

    let config = ServerConfig {
        workers: args.workers,
        maxconn: args.maxconn,
        task: TaskConfig {
            limits: Limits {
                keep_alive_timeout: Duration::from_secs(args.timeout),
                ..Limits::default()
            },
            cors: CorsPolicy {
                trusted_origins: args.trust_origin,
                ..CorsPolicy::default()
            },
            ..TaskConfig::default()
        },
    };

    let _server = Server::new(addr, config, std::sync::Arc::new(DemoDispatcher))?;

    loop {
        thread::park();
    }
}

fn main() {
    let args = Args::parse();

    let level = match args.log_level {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    init_logger(level);

    info!("starting...");

    if let Err(e) = process_args_and_run(args) {
        error!("{}", e);
        process::exit(1);
    }
}
