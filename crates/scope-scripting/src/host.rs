//! Host-side execution of script requests.
//!
//! Immediate handlers complete synchronously; deferred handlers park the
//! calling task on a completion (frame arrival, timer, subprocess) and race
//! it against the plugin's cancellation flag. Deferred handlers never raise
//! into the script: their status travels in-band.

use crate::patterns::{self, PatternCache};
use crate::proto::{HostReply, HostRequest, MAX_RTT_READ, ReplyValue};
use crate::shell::{ShellError, ShellRegistry, ShellSession};
use scope_core::{Logger, LogLevel, RuntimeConfig, Transport, TransportKind};
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// An incoming frame republished for tasks parked in `recv`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: TransportKind,
    pub bytes: Arc<Vec<u8>>,
}

/// Shared collaborators every handler sees.
pub struct HostServices {
    pub transport: Arc<dyn Transport>,
    pub frames: broadcast::Sender<Frame>,
    /// Host-attributed lines (queue warnings, interface mismatches).
    pub logger: Logger,
    pub config: RuntimeConfig,
}

/// Broker state owned by one plugin, released on unload.
pub struct PluginResources {
    /// Plugin-attributed lines; `log.*` requests land here.
    pub logger: Logger,
    pub log_level: Cell<LogLevel>,
    pub patterns: RefCell<PatternCache>,
    pub shells: RefCell<ShellRegistry>,
}

impl PluginResources {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger,
            log_level: Cell::new(LogLevel::Info),
            patterns: RefCell::new(PatternCache::new()),
            shells: RefCell::new(ShellRegistry::default()),
        }
    }
}

/// Execute one request. `cancel` is the owning plugin's unload flag; pass a
/// receiver that never fires to run non-cancellable (lifecycle) sections.
pub async fn handle_request(
    req: HostRequest,
    services: &HostServices,
    resources: &PluginResources,
    cancel: &mut watch::Receiver<bool>,
) -> HostReply {
    match req {
        HostRequest::Log { level, message } => {
            if level <= resources.log_level.get() {
                resources.logger.write(level, message);
            }
            HostReply::ok()
        }

        HostRequest::SerialInfo => {
            let state = services.transport.state();
            if state.kind == TransportKind::Serial {
                HostReply::ok_with(vec![
                    ReplyValue::Str(state.port),
                    ReplyValue::Int(i64::from(state.baud)),
                ])
            } else {
                services.logger.warning(
                    "serial.info requested but the active interface is not serial; \
                     returning empty port and baud 0",
                );
                HostReply::ok_with(vec![ReplyValue::Str(String::new()), ReplyValue::Int(0)])
            }
        }

        HostRequest::SerialSend { message } => {
            send_frame(services, TransportKind::Serial, &message)
        }

        HostRequest::SerialRecv { timeout } => {
            recv_frame(services, TransportKind::Serial, timeout, cancel).await
        }

        HostRequest::SerialConnect { port, baud } => {
            match services.transport.connect(&port, baud) {
                Ok(()) => HostReply::ok(),
                Err(err) => HostReply::status_with(
                    err.status(),
                    vec![ReplyValue::Str(err.to_string())],
                ),
            }
        }

        HostRequest::SerialDisconnect => match services.transport.disconnect() {
            Ok(()) => HostReply::ok(),
            Err(err) => {
                HostReply::status_with(err.status(), vec![ReplyValue::Str(err.to_string())])
            }
        },

        HostRequest::RttInfo => {
            let state = services.transport.state();
            if state.kind == TransportKind::Rtt {
                HostReply::ok_with(vec![
                    ReplyValue::Str(state.target),
                    ReplyValue::Int(state.channel as i64),
                ])
            } else {
                services.logger.warning(
                    "rtt.info requested but the active interface is not RTT; \
                     returning empty target and channel 0",
                );
                HostReply::ok_with(vec![ReplyValue::Str(String::new()), ReplyValue::Int(0)])
            }
        }

        HostRequest::RttSend { message } => send_frame(services, TransportKind::Rtt, &message),

        HostRequest::RttRecv { timeout } => {
            recv_frame(services, TransportKind::Rtt, timeout, cancel).await
        }

        HostRequest::RttRead { address, size } => {
            rtt_read(services, address, size, cancel).await
        }

        HostRequest::SysSleep { duration } => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => HostReply::ok(),
                _ = wait_cancelled(cancel) => HostReply::cancelled(),
            }
        }

        HostRequest::ReMatch { text, pattern } => {
            let matched = resources.patterns.borrow_mut().is_match(&text, &pattern);
            HostReply::ok_with(vec![ReplyValue::Bool(matched)])
        }

        HostRequest::ReMatches { text, patterns } => {
            let chosen = resources.patterns.borrow_mut().first_match(&text, &patterns);
            HostReply::ok_with(vec![match chosen {
                Some(source) => ReplyValue::Str(source),
                None => ReplyValue::Nil,
            }])
        }

        HostRequest::ReLiteral { text } => {
            HostReply::ok_with(vec![ReplyValue::Str(patterns::literal(&text))])
        }

        HostRequest::ShellNew => {
            let created = resources.shells.borrow_mut().create().await;
            match created {
                Ok(id) => HostReply::ok_with(vec![ReplyValue::Int(id as i64)]),
                Err(err) => HostReply::status_with(
                    "io-error",
                    vec![ReplyValue::Str(format!("cannot spawn shell: {err}"))],
                ),
            }
        }

        HostRequest::ShellRun {
            session,
            command,
            timeout,
        } => {
            let timeout =
                timeout.unwrap_or(Duration::from_millis(services.config.shell_timeout_ms));
            let mut shells = resources.shells.borrow_mut();
            let Some(shell) = shells.get_mut(session) else {
                return HostReply::ok_with(vec![
                    ReplyValue::Str(String::new()),
                    ReplyValue::Str(format!("unknown shell session {session}")),
                ]);
            };

            tokio::select! {
                result = shell.run(&command, timeout) => match result {
                    Ok((stdout, stderr)) => HostReply::ok_with(vec![
                        ReplyValue::Str(stdout),
                        ReplyValue::Str(stderr),
                    ]),
                    Err(ShellError::Timeout) => HostReply::status_with(
                        "timeout",
                        vec![ReplyValue::Str(String::new()), ReplyValue::Str(String::new())],
                    ),
                    // I/O failures surface on stderr so the script may retry.
                    Err(ShellError::Io(err)) => HostReply::ok_with(vec![
                        ReplyValue::Str(String::new()),
                        ReplyValue::Str(err.to_string()),
                    ]),
                },
                _ = wait_cancelled(cancel) => HostReply::cancelled(),
            }
        }

        HostRequest::ShellExist { session: _, program } => {
            tokio::select! {
                found = ShellSession::exist(&program) => {
                    HostReply::ok_with(vec![ReplyValue::Bool(found)])
                }
                _ = wait_cancelled(cancel) => HostReply::cancelled(),
            }
        }
    }
}

fn send_frame(services: &HostServices, want: TransportKind, bytes: &[u8]) -> HostReply {
    if services.transport.state().kind != want {
        return HostReply::status("not-active");
    }
    match services.transport.send(bytes) {
        Ok(()) => HostReply::ok(),
        Err(err) => {
            HostReply::status_with(err.status(), vec![ReplyValue::Str(err.to_string())])
        }
    }
}

async fn recv_frame(
    services: &HostServices,
    want: TransportKind,
    timeout: Option<Duration>,
    cancel: &mut watch::Receiver<bool>,
) -> HostReply {
    let mut frames = services.frames.subscribe();
    let deadline = tokio::time::Instant::now() + capped_wait(timeout, &services.config);

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(frame) if frame.kind == want => {
                    return HostReply::ok_with(vec![ReplyValue::Bytes(frame.bytes.to_vec())]);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "recv waiter lagged behind the frame stream");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return HostReply::timeout(),
            },
            _ = wait_cancelled(cancel) => return HostReply::cancelled(),
            _ = tokio::time::sleep_until(deadline) => return HostReply::timeout(),
        }
    }
}

/// Deferred waits are bounded host-side: a script timeout is clamped to the
/// configured cap, and an omitted timeout waits the full cap, not forever.
fn capped_wait(requested: Option<Duration>, config: &RuntimeConfig) -> Duration {
    let cap = Duration::from_millis(config.recv_timeout_cap_ms);
    requested.map_or(cap, |requested| requested.min(cap))
}

async fn rtt_read(
    services: &HostServices,
    address: u64,
    size: usize,
    cancel: &mut watch::Receiver<bool>,
) -> HostReply {
    if size > MAX_RTT_READ {
        return HostReply::status_with(
            "invalid-argument",
            vec![ReplyValue::Str(format!(
                "rtt.read size {size} exceeds the maximum of {MAX_RTT_READ} bytes"
            ))],
        );
    }
    if services.transport.state().kind != TransportKind::Rtt {
        return HostReply::status("not-active");
    }

    let transport = Arc::clone(&services.transport);
    let read = tokio::task::spawn_blocking(move || transport.rtt_read(address, size));
    let deadline = tokio::time::Instant::now() + capped_wait(None, &services.config);

    tokio::select! {
        joined = read => match joined {
            Ok(Ok(bytes)) => HostReply::ok_with(vec![ReplyValue::Bytes(bytes)]),
            Ok(Err(err)) => {
                HostReply::status_with(err.status(), vec![ReplyValue::Str(err.to_string())])
            }
            Err(join_err) => HostReply::status_with(
                "io-error",
                vec![ReplyValue::Str(format!("rtt read worker failed: {join_err}"))],
            ),
        },
        _ = wait_cancelled(cancel) => HostReply::cancelled(),
        _ = tokio::time::sleep_until(deadline) => HostReply::timeout(),
    }
}

/// Resolve when the plugin's unload flag flips true; never resolves for a
/// receiver whose channel stays false.
pub async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scope_core::{LoopbackTransport, TransportState};

    fn services_with(state: TransportState) -> (HostServices, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new(state));
        let (frames, _) = broadcast::channel(16);
        // The receiver is dropped; Logger::write ignores a gone TUI.
        let (logger, _) = Logger::channel("host");
        (
            HostServices {
                transport: transport.clone(),
                frames,
                logger,
                config: RuntimeConfig::default(),
            },
            transport,
        )
    }

    // wait_cancelled never resolves once the sender is gone and the value
    // stayed false, which is exactly "not cancellable".
    fn idle_cancel() -> watch::Receiver<bool> {
        let (_, rx) = watch::channel(false);
        rx
    }

    fn resources() -> PluginResources {
        let (logger, _) = Logger::channel("plugin");
        PluginResources::new(logger)
    }

    #[tokio::test]
    async fn recv_times_out_without_frames() {
        let (services, _) = services_with(TransportState::serial("COM3", 9600));
        let resources = resources();
        let mut cancel = idle_cancel();

        let reply = handle_request(
            HostRequest::SerialRecv {
                timeout: Some(Duration::from_millis(30)),
            },
            &services,
            &resources,
            &mut cancel,
        )
        .await;
        assert_eq!(reply.status, "timeout");
    }

    #[tokio::test]
    async fn recv_without_a_timeout_is_bounded_by_the_cap() {
        let (mut services, _) = services_with(TransportState::serial("COM3", 9600));
        services.config.recv_timeout_cap_ms = 40;
        let resources = resources();
        let mut cancel = idle_cancel();

        let started = std::time::Instant::now();
        let reply = handle_request(
            HostRequest::SerialRecv { timeout: None },
            &services,
            &resources,
            &mut cancel,
        )
        .await;
        assert_eq!(reply.status, "timeout");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn recv_timeouts_are_clamped_to_the_cap() {
        let (mut services, _) = services_with(TransportState::rtt("nrf52840", 0));
        services.config.recv_timeout_cap_ms = 40;
        let resources = resources();
        let mut cancel = idle_cancel();

        let started = std::time::Instant::now();
        let reply = handle_request(
            HostRequest::RttRecv {
                timeout: Some(Duration::from_secs(120)),
            },
            &services,
            &resources,
            &mut cancel,
        )
        .await;
        assert_eq!(reply.status, "timeout");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn recv_sees_a_matching_frame() {
        let (services, _) = services_with(TransportState::serial("COM3", 9600));
        let resources = resources();
        let mut cancel = idle_cancel();
        let frames = services.frames.clone();

        let (reply, _) = tokio::join!(
            handle_request(
                HostRequest::SerialRecv {
                    timeout: Some(Duration::from_secs(5)),
                },
                &services,
                &resources,
                &mut cancel,
            ),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                // A non-matching frame first: it must be skipped.
                let _ = frames.send(Frame {
                    kind: TransportKind::Rtt,
                    bytes: Arc::new(vec![0xEE]),
                });
                let _ = frames.send(Frame {
                    kind: TransportKind::Serial,
                    bytes: Arc::new(vec![0x31, 0x0A]),
                });
            }
        );

        assert_eq!(reply.status, "ok");
        assert_eq!(reply.values, vec![ReplyValue::Bytes(vec![0x31, 0x0A])]);
    }

    #[tokio::test]
    async fn sleep_is_cancellable() {
        let (services, _) = services_with(TransportState::default());
        let resources = resources();
        let (cancel_tx, mut cancel) = watch::channel(false);

        let (reply, _) = tokio::join!(
            handle_request(
                HostRequest::SysSleep {
                    duration: Duration::from_secs(30),
                },
                &services,
                &resources,
                &mut cancel,
            ),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let _ = cancel_tx.send(true);
            }
        );

        assert!(reply.is_cancelled());
    }

    #[tokio::test]
    async fn rtt_read_guards_size_interface_and_range() {
        let (services, transport) = services_with(TransportState::serial("COM3", 9600));
        let resources = resources();
        let mut cancel = idle_cancel();

        let reply = handle_request(
            HostRequest::RttRead {
                address: 0x2000_0000,
                size: 2048,
            },
            &services,
            &resources,
            &mut cancel,
        )
        .await;
        assert_eq!(reply.status, "invalid-argument");

        let reply = handle_request(
            HostRequest::RttRead {
                address: 0x2000_0000,
                size: 48,
            },
            &services,
            &resources,
            &mut cancel,
        )
        .await;
        assert_eq!(reply.status, "not-active");

        transport.set_state(TransportState::rtt("nrf52840", 0));
        transport.set_memory(0x2000_0000, (0u8..=255).cycle().take(1024).collect());
        let reply = handle_request(
            HostRequest::RttRead {
                address: 0x2000_0000,
                size: 48,
            },
            &services,
            &resources,
            &mut cancel,
        )
        .await;
        assert_eq!(reply.status, "ok");
        assert_eq!(
            reply.values,
            vec![ReplyValue::Bytes((0u8..48).collect())]
        );
    }

    #[tokio::test]
    async fn sends_require_the_matching_interface() {
        let (services, transport) = services_with(TransportState::rtt("nrf52840", 0));
        let resources = resources();
        let mut cancel = idle_cancel();

        let reply = handle_request(
            HostRequest::SerialSend {
                message: b"AT\r".to_vec(),
            },
            &services,
            &resources,
            &mut cancel,
        )
        .await;
        assert_eq!(reply.status, "not-active");
        assert!(transport.sent().is_empty());

        let reply = handle_request(
            HostRequest::RttSend {
                message: b"ping".to_vec(),
            },
            &services,
            &resources,
            &mut cancel,
        )
        .await;
        assert_eq!(reply.status, "ok");
        assert_eq!(transport.sent(), vec![b"ping".to_vec()]);
    }

    #[tokio::test]
    async fn log_requests_respect_the_plugin_level() {
        let (services, _) = services_with(TransportState::default());
        let (logger, rx) = Logger::channel("echo");
        let resources = PluginResources::new(logger);
        let mut cancel = idle_cancel();

        handle_request(
            HostRequest::Log {
                level: LogLevel::Debug,
                message: "hidden".to_string(),
            },
            &services,
            &resources,
            &mut cancel,
        )
        .await;
        handle_request(
            HostRequest::Log {
                level: LogLevel::Info,
                message: "shown".to_string(),
            },
            &services,
            &resources,
            &mut cancel,
        )
        .await;

        let line = rx.try_recv().unwrap();
        assert_eq!(line.text, "shown");
        assert!(rx.try_recv().is_err());
    }
}
