// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Line-oriented RVE control surface
//!
//! One request per line, one response per line. Successful requests
//! answer `ok [payload]`, failed ones `err <errno> <message>`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _};
use log::{debug, info, warn};
use parking_lot::Mutex;

use rve::error::errno;
use rve::{
    CommandBuffer, ContextConfig, ContextId, EngineRegistry, Error, Fence, FenceFd, FenceStatus,
    OwnerId, SyncMode,
};

/// Parsed control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Open {
        owner: Option<OwnerId>,
    },
    Config {
        handle: ContextId,
        priority: i32,
        mode: SyncMode,
        in_fence: Option<FenceFd>,
        commands: Vec<Vec<u32>>,
    },
    Commit {
        handle: ContextId,
    },
    Cancel {
        handle: ContextId,
    },
    Retain {
        handle: ContextId,
    },
    Info {
        handle: ContextId,
    },
    Poll {
        fence: FenceFd,
    },
    Wait {
        fence: FenceFd,
        timeout: Duration,
    },
    Fence,
    Signal {
        fence: FenceFd,
    },
    Close {
        fence: FenceFd,
    },
    Exit {
        owner: OwnerId,
    },
    Version,
    HwVersion,
    Stats,
    Load,
}

impl Request {
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| anyhow!("empty request"))?;
        let args: Vec<&str> = words.collect();

        let request = match verb {
            "open" => Request::Open {
                owner: args.first().map(|s| number(s, "owner")).transpose()?,
            },
            "config" => parse_config(&args)?,
            "commit" => Request::Commit {
                handle: arg(&args, 0, "handle")?,
            },
            "cancel" => Request::Cancel {
                handle: arg(&args, 0, "handle")?,
            },
            "retain" => Request::Retain {
                handle: arg(&args, 0, "handle")?,
            },
            "info" => Request::Info {
                handle: arg(&args, 0, "handle")?,
            },
            "poll" => Request::Poll {
                fence: arg(&args, 0, "fence")?,
            },
            "wait" => Request::Wait {
                fence: arg(&args, 0, "fence")?,
                timeout: Duration::from_millis(arg(&args, 1, "timeout")?),
            },
            "fence" => Request::Fence,
            "signal" => Request::Signal {
                fence: arg(&args, 0, "fence")?,
            },
            "close" => Request::Close {
                fence: arg(&args, 0, "fence")?,
            },
            "exit" => Request::Exit {
                owner: arg(&args, 0, "owner")?,
            },
            "version" => Request::Version,
            "hwver" => Request::HwVersion,
            "stats" => Request::Stats,
            "load" => Request::Load,
            other => bail!("unknown request '{}'", other),
        };

        Ok(request)
    }
}

fn number<T: std::str::FromStr>(word: &str, what: &str) -> anyhow::Result<T> {
    word.parse()
        .map_err(|_| anyhow!("bad {} '{}'", what, word))
}

fn arg<T: std::str::FromStr>(args: &[&str], index: usize, what: &str) -> anyhow::Result<T> {
    let word = args
        .get(index)
        .ok_or_else(|| anyhow!("missing {}", what))?;
    number(word, what)
}

/// `config <handle> <priority> <sync|async> [in=<fence>] <cmd>...`
fn parse_config(args: &[&str]) -> anyhow::Result<Request> {
    let handle = arg(args, 0, "handle")?;
    let priority = arg(args, 1, "priority")?;
    let mode = match args.get(2).copied() {
        Some("sync") => SyncMode::Sync,
        Some("async") => SyncMode::Async,
        Some(other) => bail!("bad mode '{}'", other),
        None => bail!("missing mode"),
    };

    let mut rest = &args[3.min(args.len())..];
    let mut in_fence = None;
    if let Some(fd) = rest.first().and_then(|w| w.strip_prefix("in=")) {
        in_fence = Some(number(fd, "fence")?);
        rest = &rest[1..];
    }

    let commands = rest
        .iter()
        .map(|cmd| parse_command(cmd))
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Request::Config {
        handle,
        priority,
        mode,
        in_fence,
        commands,
    })
}

/// Comma-separated hex register words
fn parse_command(word: &str) -> anyhow::Result<Vec<u32>> {
    word.split(',')
        .map(|reg| {
            let digits = reg.trim_start_matches("0x");
            u32::from_str_radix(digits, 16).with_context(|| format!("bad register word '{}'", reg))
        })
        .collect()
}

/// Reply to one request
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok(String),
    Err(Error),
    /// Request did not parse
    Malformed(String),
}

impl From<Result<String, Error>> for Response {
    fn from(result: Result<String, Error>) -> Self {
        match result {
            Ok(payload) => Response::Ok(payload),
            Err(err) => Response::Err(err),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok(payload) if payload.is_empty() => write!(f, "ok"),
            Response::Ok(payload) => write!(f, "ok {}", payload),
            Response::Err(err) => write!(f, "err {} {}", err.errno(), err),
            Response::Malformed(msg) => write!(f, "err {} {}", errno::EINVAL, msg),
        }
    }
}

fn fence_status(status: FenceStatus) -> String {
    match status {
        FenceStatus::Unsignaled => "unsignaled".to_string(),
        FenceStatus::Signaled => "signaled".to_string(),
        FenceStatus::Error(err) => format!("error {}", err.errno()),
    }
}

/// RVE scheme implementation
pub struct RveScheme {
    registry: Arc<EngineRegistry>,
    /// Client-signaled fences, kept after their exported handle is consumed
    user_fences: Mutex<BTreeMap<FenceFd, Fence>>,
    default_owner: OwnerId,
}

impl RveScheme {
    pub fn new(registry: Arc<EngineRegistry>, default_owner: OwnerId) -> Self {
        Self {
            registry,
            user_fences: Mutex::new(BTreeMap::new()),
            default_owner,
        }
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    /// Parse and execute one request line
    pub fn handle_line(&self, line: &str) -> Response {
        match Request::parse(line) {
            Ok(request) => self.handle(request),
            Err(err) => {
                debug!("rve: malformed request '{}': {:#}", line, err);
                Response::Malformed(format!("{:#}", err))
            }
        }
    }

    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::Open { owner } => self.handle_open(owner).into(),
            Request::Config {
                handle,
                priority,
                mode,
                in_fence,
                commands,
            } => self
                .handle_config(handle, priority, mode, in_fence, &commands)
                .map(|()| String::new())
                .into(),
            Request::Commit { handle } => self.handle_commit(handle).into(),
            Request::Cancel { handle } => self.registry.cancel(handle).map(|()| String::new()).into(),
            Request::Retain { handle } => self.registry.retain(handle).map(|()| String::new()).into(),
            Request::Info { handle } => self.handle_info(handle).into(),
            Request::Poll { fence } => self.lookup_fence(fence).map(|f| fence_status(f.status())).into(),
            Request::Wait { fence, timeout } => self
                .lookup_fence(fence)
                .map(|f| fence_status(f.wait_timeout(timeout)))
                .into(),
            Request::Fence => self.handle_fence().into(),
            Request::Signal { fence } => self.handle_signal(fence).into(),
            Request::Close { fence } => self.handle_close(fence).into(),
            Request::Exit { owner } => {
                let released = self.registry.release_owner(owner);
                info!("rve: owner {} exited, released {} contexts", owner, released);
                Response::Ok(released.to_string())
            }
            Request::Version => Response::Ok(self.registry.driver_version().str),
            Request::HwVersion => Response::Ok(
                self.registry
                    .hw_versions()
                    .into_iter()
                    .map(|v| v.str)
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            Request::Stats => Response::Ok(self.format_stats()),
            Request::Load => Response::Ok(
                self.registry
                    .load()
                    .iter()
                    .enumerate()
                    .map(|(core, load)| format!("core{}={}%", core, load))
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
        }
    }

    fn handle_open(&self, owner: Option<OwnerId>) -> Result<String, Error> {
        let owner = owner.unwrap_or(self.default_owner);
        let handle = self.registry.open_context(owner)?;
        debug!("rve: opened context {} for owner {}", handle, owner);
        Ok(handle.to_string())
    }

    fn handle_config(
        &self,
        handle: ContextId,
        priority: i32,
        mode: SyncMode,
        in_fence: Option<FenceFd>,
        commands: &[Vec<u32>],
    ) -> Result<(), Error> {
        let commands = commands
            .iter()
            .map(|regs| CommandBuffer::new(regs))
            .collect::<Result<Vec<_>, Error>>()?;

        let mut config = ContextConfig::new(commands, mode).with_priority(priority);
        if let Some(fd) = in_fence {
            config = config.with_in_fence(fd);
        }

        self.registry.configure(handle, config)
    }

    fn handle_commit(&self, handle: ContextId) -> Result<String, Error> {
        let outcome = self.registry.commit(handle)?;
        Ok(outcome
            .out_fence
            .map(|fd| fd.to_string())
            .unwrap_or_default())
    }

    fn handle_info(&self, handle: ContextId) -> Result<String, Error> {
        let info = self.registry.context_info(handle)?;
        let mode = match info.sync_mode {
            SyncMode::Sync => "sync",
            SyncMode::Async => "async",
        };

        Ok(format!(
            "ctx={} owner={} prio={} mode={} running={} finished={}/{} refs={} \
             hw_last_us={} last_us={} hw_total_us={} hw_max_us={}",
            info.id,
            info.owner,
            info.priority,
            mode,
            info.is_running,
            info.finished,
            info.cmd_num,
            info.refcount,
            info.debug.last_job_hw_use_time.as_micros(),
            info.debug.last_job_use_time.as_micros(),
            info.debug.hw_time_total.as_micros(),
            info.debug.max_cost_time.as_micros(),
        ))
    }

    fn format_stats(&self) -> String {
        self.registry
            .engine_stats()
            .iter()
            .enumerate()
            .map(|(core, s)| {
                format!(
                    "core{} submitted={} completed={} failed={} timeouts={} cancelled={} \
                     resets={} stale_irqs={} avg_us={} p99_us={} max_depth={}",
                    core,
                    s.submitted,
                    s.completed,
                    s.failed,
                    s.timeouts,
                    s.cancelled,
                    s.resets,
                    s.stale_irqs,
                    s.avg_hw_time.as_micros(),
                    s.p99_hw_time.as_micros(),
                    s.max_queue_depth,
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    #[cfg(feature = "sync-file")]
    fn lookup_fence(&self, fd: FenceFd) -> Result<Fence, Error> {
        if let Some(fence) = self.user_fences.lock().get(&fd) {
            return Ok(fence.clone());
        }
        self.registry.fences().get(fd)
    }

    #[cfg(not(feature = "sync-file"))]
    fn lookup_fence(&self, _fd: FenceFd) -> Result<Fence, Error> {
        Err(Error::Unsupported)
    }

    #[cfg(feature = "sync-file")]
    fn handle_fence(&self) -> Result<String, Error> {
        let fence = Fence::new();
        let fd = self.registry.fences().export(&fence);
        self.user_fences.lock().insert(fd, fence);
        Ok(fd.to_string())
    }

    #[cfg(not(feature = "sync-file"))]
    fn handle_fence(&self) -> Result<String, Error> {
        Err(Error::Unsupported)
    }

    fn handle_signal(&self, fd: FenceFd) -> Result<String, Error> {
        let fence = self
            .user_fences
            .lock()
            .get(&fd)
            .cloned()
            .ok_or(Error::NotFound)?;

        if !fence.signal(Ok(())) {
            warn!("rve: fence {} already signaled", fd);
        }
        Ok(String::new())
    }

    #[cfg(feature = "sync-file")]
    fn handle_close(&self, fd: FenceFd) -> Result<String, Error> {
        let exported = self.registry.fences().close(fd);
        let user = self.user_fences.lock().remove(&fd);
        if exported || user.is_some() {
            Ok(String::new())
        } else {
            Err(Error::NotFound)
        }
    }

    #[cfg(not(feature = "sync-file"))]
    fn handle_close(&self, _fd: FenceFd) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
}
