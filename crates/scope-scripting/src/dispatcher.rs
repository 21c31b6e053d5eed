//! Event dispatcher and coroutine scheduler.
//!
//! One dedicated OS thread (the script thread) runs a current-thread tokio
//! runtime with a `LocalSet`; every Lua state lives and dies there. External
//! producers post [`EventKind`]s through the bounded queue; the dispatcher
//! fans each event out as tasks to the interested plugins.
//!
//! Scheduling: per plugin a FIFO task queue drained by one runner future, so
//! at most one task of a plugin is ever resumed; across plugins the
//! `LocalSet` round-robins the runners. A task that yields a deferred
//! request parks inside its handler and the runner with it, which is exactly
//! the per-plugin mutual exclusion the scripts rely on.

use crate::engine;
use crate::events::{Event, EventKind, EventQueue};
use crate::host::{self, Frame, HostServices, PluginResources};
use crate::invoke::{self, InvokeError};
use crate::plugin::{Plugin, PluginState, normalize_path};
use crate::proto::HostRequest;
use anyhow::Context;
use mlua::{Function, Lua, MultiValue, ThreadStatus, Value};
use scope_core::{LogLevel, Logger, RuntimeConfig, Transport, TransportKind};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::task::LocalSet;

/// Entry point: spawns the script thread.
pub struct PluginRuntime;

impl PluginRuntime {
    pub fn spawn(
        config: RuntimeConfig,
        transport: Arc<dyn Transport>,
        logger: Logger,
    ) -> anyhow::Result<RuntimeHandle> {
        let queue = Arc::new(EventQueue::new(config.event_queue_capacity));
        let thread_queue = Arc::clone(&queue);

        let thread = std::thread::Builder::new()
            .name("scope-plugins".to_string())
            .spawn(move || script_thread_main(thread_queue, config, transport, logger))
            .context("cannot spawn the plugin script thread")?;

        Ok(RuntimeHandle {
            queue,
            thread: Some(thread),
        })
    }
}

/// Cloneless, `Send` handle the Monitor drives the runtime with.
pub struct RuntimeHandle {
    queue: Arc<EventQueue>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl RuntimeHandle {
    /// Low-level event intake; the typed helpers below are sugar over this.
    pub fn post(&self, kind: EventKind) {
        self.queue.post(kind);
    }

    pub fn load_plugin(&self, path: impl Into<PathBuf>) {
        self.post(EventKind::Load { path: path.into() });
    }

    pub fn unload_plugin(&self, name: impl Into<String>) {
        self.post(EventKind::Unload { name: name.into() });
    }

    pub fn reload_plugin(&self, name: impl Into<String>) {
        self.post(EventKind::Reload { name: name.into() });
    }

    pub fn set_plugin_log_level(&self, plugin: impl Into<String>, level: LogLevel) {
        self.post(EventKind::SetLogLevel {
            plugin: plugin.into(),
            level,
        });
    }

    /// Queue a `!plugin command args…` line typed at the command bar.
    pub fn invoke(&self, line: &str) -> Result<(), InvokeError> {
        let invocation = invoke::parse_invocation(line)?;
        self.post(EventKind::Command {
            plugin: invocation.plugin,
            command: invocation.command,
            args: invocation.args,
        });
        Ok(())
    }

    pub fn run_command(
        &self,
        plugin: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) {
        self.post(EventKind::Command {
            plugin: plugin.into(),
            command: command.into(),
            args,
        });
    }

    pub fn serial_rx(&self, bytes: Vec<u8>) {
        self.post(EventKind::SerialRx(bytes));
    }

    pub fn serial_tx(&self, bytes: Vec<u8>) {
        self.post(EventKind::SerialTx(bytes));
    }

    pub fn rtt_rx(&self, bytes: Vec<u8>) {
        self.post(EventKind::RttRx(bytes));
    }

    pub fn rtt_tx(&self, bytes: Vec<u8>) {
        self.post(EventKind::RttTx(bytes));
    }

    pub fn serial_connected(&self, port: impl Into<String>, baud: u32) {
        self.post(EventKind::SerialConnected {
            port: port.into(),
            baud,
        });
    }

    pub fn serial_disconnected(&self, port: impl Into<String>, baud: u32) {
        self.post(EventKind::SerialDisconnected {
            port: port.into(),
            baud,
        });
    }

    pub fn rtt_connected(&self, target: impl Into<String>, channel: usize) {
        self.post(EventKind::RttConnected {
            target: target.into(),
            channel,
        });
    }

    pub fn rtt_disconnected(&self, target: impl Into<String>, channel: usize) {
        self.post(EventKind::RttDisconnected {
            target: target.into(),
            channel,
        });
    }

    /// Unload every plugin and stop the script thread.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.queue.post(EventKind::Shutdown);
            let _ = thread.join();
        }
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn script_thread_main(
    queue: Arc<EventQueue>,
    config: RuntimeConfig,
    transport: Arc<dyn Transport>,
    logger: Logger,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            logger.error(format!("plugin runtime failed to start: {err}"));
            return;
        }
    };

    let local = LocalSet::new();
    let (frames, _) = broadcast::channel(config.event_queue_capacity.max(16));
    let services = Rc::new(HostServices {
        transport,
        frames,
        logger: logger.clone(),
        config,
    });

    let dispatcher = Dispatcher::new(queue, services, logger);
    runtime.block_on(local.run_until(dispatcher.run()));
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Arguments an event callback is invoked with.
#[derive(Clone)]
enum TaskPayload {
    None,
    Bytes(Arc<Vec<u8>>),
    Peer(String, i64),
    Device(String),
    BleValue(String, String, Arc<Vec<u8>>),
    Args(Vec<String>),
}

impl TaskPayload {
    fn into_multi(self, lua: &Lua) -> mlua::Result<MultiValue> {
        let values = match self {
            Self::None => Vec::new(),
            Self::Bytes(bytes) => {
                vec![Value::Table(crate::proto::bytes_to_table(lua, &bytes)?)]
            }
            Self::Peer(name, number) => vec![
                Value::String(lua.create_string(&name)?),
                Value::Integer(number),
            ],
            Self::Device(device) => vec![Value::String(lua.create_string(&device)?)],
            Self::BleValue(service, characteristic, value) => vec![
                Value::String(lua.create_string(&service)?),
                Value::String(lua.create_string(&characteristic)?),
                Value::Table(crate::proto::bytes_to_table(lua, &value)?),
            ],
            Self::Args(args) => args
                .into_iter()
                .map(|arg| lua.create_string(&arg).map(Value::String))
                .collect::<mlua::Result<Vec<_>>>()?,
        };
        Ok(MultiValue::from_vec(values))
    }
}

enum TaskKind {
    OnLoad,
    Callback {
        name: &'static str,
        payload: TaskPayload,
    },
    Command {
        name: String,
        args: Vec<String>,
    },
    Unload {
        reload: bool,
    },
}

struct Task {
    kind: TaskKind,
}

/// Per-plugin FIFO of pending tasks, drainable by the dispatcher on unload.
struct TaskQueue {
    inner: RefCell<VecDeque<Task>>,
    notify: Notify,
}

impl TaskQueue {
    fn new() -> Self {
        Self {
            inner: RefCell::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, task: Task) {
        self.inner.borrow_mut().push_back(task);
        self.notify.notify_one();
    }

    async fn next(&self) -> Task {
        loop {
            if let Some(task) = self.inner.borrow_mut().pop_front() {
                return task;
            }
            self.notify.notified().await;
        }
    }

    /// Drop tasks that never started. Unload tasks are kept.
    fn clear_pending(&self) -> usize {
        let mut queue = self.inner.borrow_mut();
        let before = queue.len();
        queue.retain(|task| matches!(task.kind, TaskKind::Unload { .. }));
        before - queue.len()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct PluginShared {
    plugin: Plugin,
    state: Cell<PluginState>,
    resources: PluginResources,
}

struct PluginSlot {
    shared: Rc<PluginShared>,
    tasks: Rc<TaskQueue>,
    cancel: watch::Sender<bool>,
}

struct RunnerExit {
    name: String,
    reload: Option<PathBuf>,
}

struct Dispatcher {
    queue: Arc<EventQueue>,
    services: Rc<HostServices>,
    logger: Logger,
    plugins: HashMap<String, PluginSlot>,
    by_path: HashMap<PathBuf, String>,
    exits_tx: mpsc::UnboundedSender<RunnerExit>,
    exits_rx: mpsc::UnboundedReceiver<RunnerExit>,
    shutting_down: bool,
}

impl Dispatcher {
    fn new(queue: Arc<EventQueue>, services: Rc<HostServices>, logger: Logger) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            queue,
            services,
            logger,
            plugins: HashMap::new(),
            by_path: HashMap::new(),
            exits_tx,
            exits_rx,
            shutting_down: false,
        }
    }

    async fn run(mut self) {
        let queue = Arc::clone(&self.queue);
        let idle_latency = Duration::from_micros(self.services.config.idle_latency_us);
        loop {
            tokio::select! {
                event = queue.next() => self.handle_event(event),
                Some(exit) = self.exits_rx.recv() => self.finish_unload(exit),
            }

            if self.shutting_down && self.plugins.is_empty() {
                break;
            }

            // Runner tasks get the thread between drained events; a nonzero
            // latency additionally rate-limits the drain.
            if idle_latency.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(idle_latency).await;
            }
        }
        tracing::debug!("plugin runtime stopped");
    }

    fn handle_event(&mut self, event: Event) {
        match event.kind {
            EventKind::Load { path } => self.begin_load(path),
            EventKind::Unload { name } => self.begin_unload(&name, false),
            EventKind::Reload { name } => self.begin_unload(&name, true),
            EventKind::Shutdown => {
                self.shutting_down = true;
                let names: Vec<String> = self.plugins.keys().cloned().collect();
                for name in names {
                    self.begin_unload(&name, false);
                }
            }
            EventKind::SetLogLevel { plugin, level } => match self.plugins.get(&plugin) {
                Some(slot) => {
                    slot.shared.resources.log_level.set(level);
                    self.logger.success(format!(
                        "Log level set to {} on plugin \"{plugin}\"",
                        level.label()
                    ));
                }
                None => self.logger.error(format!("Plugin \"{plugin}\" not loaded")),
            },
            EventKind::Command {
                plugin,
                command,
                args,
            } => self.queue_command(&plugin, command, args),
            kind => self.fan_out(kind),
        }
    }

    fn begin_load(&mut self, path: PathBuf) {
        let normalized = match normalize_path(&path) {
            Ok(normalized) => normalized,
            Err(err) => {
                self.logger.error(err);
                return;
            }
        };

        if let Some(name) = self.by_path.get(&normalized) {
            // Loading an already-loaded path means reload.
            let name = name.clone();
            self.begin_unload(&name, true);
            return;
        }

        let plugin = match Plugin::load(&normalized) {
            Ok(plugin) => plugin,
            Err(err) => {
                self.logger
                    .error(format!("Cannot load \"{}\": {err}", normalized.display()));
                return;
            }
        };

        let name = plugin.name().as_str().to_string();
        if self.plugins.contains_key(&name) {
            self.logger.error(format!(
                "Another plugin named \"{name}\" is already loaded"
            ));
            return;
        }

        for unknown in &plugin.entries().unknown_callbacks {
            self.logger.warning(format!(
                "Plugin \"{name}\": \"{unknown}\" is not a known callback and will never fire"
            ));
        }

        let shared = Rc::new(PluginShared {
            resources: PluginResources::new(self.logger.with_source(name.clone())),
            state: Cell::new(PluginState::Loading),
            plugin,
        });
        let tasks = Rc::new(TaskQueue::new());
        let (cancel_tx, cancel_rx) = watch::channel(false);

        tasks.push(Task {
            kind: TaskKind::OnLoad,
        });
        tokio::task::spawn_local(runner(
            Rc::clone(&shared),
            Rc::clone(&tasks),
            Rc::clone(&self.services),
            cancel_rx,
            self.exits_tx.clone(),
        ));

        self.by_path.insert(normalized, name.clone());
        self.plugins.insert(
            name,
            PluginSlot {
                shared,
                tasks,
                cancel: cancel_tx,
            },
        );
    }

    fn begin_unload(&mut self, name: &str, reload: bool) {
        let Some(slot) = self.plugins.get(name) else {
            self.logger.error(format!("Plugin \"{name}\" not loaded"));
            return;
        };

        if matches!(
            slot.shared.state.get(),
            PluginState::Unloading | PluginState::Dead
        ) {
            return;
        }

        slot.shared.state.set(PluginState::Unloading);
        let dropped = slot.tasks.clear_pending();
        if dropped > 0 {
            tracing::debug!(plugin = name, dropped, "dropped unstarted tasks on unload");
        }
        let _ = slot.cancel.send(true);
        slot.tasks.push(Task {
            kind: TaskKind::Unload { reload },
        });
    }

    fn finish_unload(&mut self, exit: RunnerExit) {
        self.plugins.remove(&exit.name);
        self.by_path.retain(|_, name| name != &exit.name);

        match exit.reload {
            Some(path) if !self.shutting_down => self.begin_load(path),
            _ => self
                .logger
                .warning(format!("Plugin \"{}\" unloaded", exit.name)),
        }
    }

    fn queue_command(&mut self, plugin: &str, command: String, args: Vec<String>) {
        let Some(slot) = self.plugins.get(plugin) else {
            self.logger.error(format!("Plugin \"{plugin}\" not loaded"));
            return;
        };
        // Commands typed during load queue behind on_load; anything after
        // that point is a dead plugin.
        if !matches!(
            slot.shared.state.get(),
            PluginState::Loading | PluginState::Ready
        ) {
            self.logger
                .error(format!("Plugin \"{plugin}\" is not ready"));
            return;
        }
        if !slot.shared.plugin.entries().commands.contains(&command) {
            self.logger.error(format!(
                "Plugin \"{plugin}\" doesn't have a \"{command}\" command"
            ));
            return;
        }

        slot.tasks.push(Task {
            kind: TaskKind::Command {
                name: command,
                args,
            },
        });
    }

    /// Route a traffic or transition event to the interested plugins.
    fn fan_out(&mut self, kind: EventKind) {
        let active = self.services.transport.state().kind;
        let Some((callback, payload, frame)) = route_event(kind, active) else {
            return;
        };

        // A task parked in recv sees the same frame the callbacks get.
        if let Some(frame) = frame {
            let _ = self.services.frames.send(frame);
        }

        for slot in self.plugins.values() {
            // Loading plugins get the task too: the FIFO queue puts it
            // behind on_load, and the runner re-checks readiness.
            if matches!(
                slot.shared.state.get(),
                PluginState::Loading | PluginState::Ready
            ) && slot.shared.plugin.entries().callbacks.contains(callback)
            {
                slot.tasks.push(Task {
                    kind: TaskKind::Callback {
                        name: callback,
                        payload: payload.clone(),
                    },
                });
            }
        }
    }
}

/// Transport-kind routing: traffic is suppressed unless its interface is the
/// active one; connect/disconnect transitions always fire.
fn route_event(
    kind: EventKind,
    active: TransportKind,
) -> Option<(&'static str, TaskPayload, Option<Frame>)> {
    match kind {
        EventKind::SerialRx(bytes) if active == TransportKind::Serial => {
            let bytes = Arc::new(bytes);
            let frame = Frame {
                kind: TransportKind::Serial,
                bytes: Arc::clone(&bytes),
            };
            Some(("on_serial_recv", TaskPayload::Bytes(bytes), Some(frame)))
        }
        EventKind::SerialTx(bytes) if active == TransportKind::Serial => Some((
            "on_serial_send",
            TaskPayload::Bytes(Arc::new(bytes)),
            None,
        )),
        EventKind::RttRx(bytes) if active == TransportKind::Rtt => {
            let bytes = Arc::new(bytes);
            let frame = Frame {
                kind: TransportKind::Rtt,
                bytes: Arc::clone(&bytes),
            };
            Some(("on_rtt_recv", TaskPayload::Bytes(bytes), Some(frame)))
        }
        EventKind::RttTx(bytes) if active == TransportKind::Rtt => {
            Some(("on_rtt_send", TaskPayload::Bytes(Arc::new(bytes)), None))
        }
        EventKind::SerialConnected { port, baud } => Some((
            "on_serial_connect",
            TaskPayload::Peer(port, i64::from(baud)),
            None,
        )),
        EventKind::SerialDisconnected { port, baud } => Some((
            "on_serial_disconnect",
            TaskPayload::Peer(port, i64::from(baud)),
            None,
        )),
        EventKind::RttConnected { target, channel } => Some((
            "on_rtt_connect",
            TaskPayload::Peer(target, channel as i64),
            None,
        )),
        EventKind::RttDisconnected { target, channel } => Some((
            "on_rtt_disconnect",
            TaskPayload::Peer(target, channel as i64),
            None,
        )),
        EventKind::BleConnected { device } => {
            Some(("on_ble_connect", TaskPayload::Device(device), None))
        }
        EventKind::BleDisconnected { device } => {
            Some(("on_ble_disconnect", TaskPayload::Device(device), None))
        }
        EventKind::MtuChanged { device, mtu } => Some((
            "on_mtu_change",
            TaskPayload::Peer(device, i64::from(mtu)),
            None,
        )),
        EventKind::BleRead {
            service,
            characteristic,
            value,
        } if active == TransportKind::Ble => Some((
            "on_ble_read",
            TaskPayload::BleValue(service, characteristic, Arc::new(value)),
            None,
        )),
        EventKind::BleWrite {
            service,
            characteristic,
            value,
        } if active == TransportKind::Ble => Some((
            "on_ble_write",
            TaskPayload::BleValue(service, characteristic, Arc::new(value)),
            None,
        )),
        EventKind::BleWriteNowait {
            service,
            characteristic,
            value,
        } if active == TransportKind::Ble => Some((
            "on_ble_write_nowait",
            TaskPayload::BleValue(service, characteristic, Arc::new(value)),
            None,
        )),
        EventKind::BleNotify {
            service,
            characteristic,
            value,
        } if active == TransportKind::Ble => Some((
            "on_ble_notify",
            TaskPayload::BleValue(service, characteristic, Arc::new(value)),
            None,
        )),
        EventKind::BleIndicate {
            service,
            characteristic,
            value,
        } if active == TransportKind::Ble => Some((
            "on_ble_indicate",
            TaskPayload::BleValue(service, characteristic, Arc::new(value)),
            None,
        )),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Runner: drains one plugin's task queue, one coroutine at a time
// ---------------------------------------------------------------------------

enum TaskOutcome {
    Completed { returned_false: bool },
    Failed(String),
}

async fn runner(
    shared: Rc<PluginShared>,
    tasks: Rc<TaskQueue>,
    services: Rc<HostServices>,
    mut cancel: watch::Receiver<bool>,
    exits: mpsc::UnboundedSender<RunnerExit>,
) {
    let name = shared.plugin.name().as_str().to_string();

    loop {
        let task = tasks.next().await;
        match task.kind {
            TaskKind::OnLoad => {
                let outcome = if shared.plugin.entries().has_on_load {
                    run_coroutine(&shared, &services, "on_load", TaskPayload::None, &mut cancel)
                        .await
                } else {
                    TaskOutcome::Completed {
                        returned_false: false,
                    }
                };

                // An unload that raced on_load owns the state from here on.
                if shared.state.get() == PluginState::Loading {
                    match outcome {
                        TaskOutcome::Completed {
                            returned_false: false,
                        } => {
                            shared.state.set(PluginState::Ready);
                            services
                                .logger
                                .success(format!("Plugin \"{name}\" loaded"));
                        }
                        TaskOutcome::Completed {
                            returned_false: true,
                        } => {
                            shared.state.set(PluginState::Failed);
                            services.logger.error(format!(
                                "Plugin \"{name}\" failed to load: on_load returned false"
                            ));
                        }
                        TaskOutcome::Failed(message) => {
                            shared.state.set(PluginState::Failed);
                            services
                                .logger
                                .error(format!("Plugin \"{name}\" failed to load: {message}"));
                        }
                    }
                }
            }

            TaskKind::Callback { name: fn_name, payload } => {
                if shared.state.get() != PluginState::Ready {
                    continue;
                }
                let outcome =
                    run_coroutine(&shared, &services, fn_name, payload, &mut cancel).await;
                report_task_failure(&shared, fn_name, outcome, &cancel);
            }

            TaskKind::Command { name: fn_name, args } => {
                if shared.state.get() != PluginState::Ready {
                    continue;
                }
                let outcome = run_coroutine(
                    &shared,
                    &services,
                    &fn_name,
                    TaskPayload::Args(args),
                    &mut cancel,
                )
                .await;
                report_task_failure(&shared, &fn_name, outcome, &cancel);
            }

            TaskKind::Unload { reload } => {
                if shared.plugin.entries().has_on_unload {
                    // Cancellation is disabled for on_unload; a grace
                    // deadline keeps a stuck script from wedging shutdown.
                    let (no_cancel_tx, mut no_cancel) = watch::channel(false);
                    drop(no_cancel_tx);

                    let grace = Duration::from_millis(services.config.unload_grace_ms);
                    let unloaded = tokio::time::timeout(
                        grace,
                        run_coroutine(
                            &shared,
                            &services,
                            "on_unload",
                            TaskPayload::None,
                            &mut no_cancel,
                        ),
                    )
                    .await;

                    match unloaded {
                        Ok(TaskOutcome::Failed(message)) => shared
                            .resources
                            .logger
                            .with_context("on_unload")
                            .error(message),
                        Ok(TaskOutcome::Completed { .. }) => {}
                        Err(_) => shared.resources.logger.error(format!(
                            "on_unload did not finish within {}ms",
                            grace.as_millis()
                        )),
                    }
                }

                shared.resources.shells.borrow_mut().kill_all().await;
                shared.state.set(PluginState::Dead);

                let _ = exits.send(RunnerExit {
                    name,
                    reload: reload.then(|| shared.plugin.path().to_path_buf()),
                });
                return;
            }
        }
    }
}

fn report_task_failure(
    shared: &PluginShared,
    fn_name: &str,
    outcome: TaskOutcome,
    cancel: &watch::Receiver<bool>,
) {
    let TaskOutcome::Failed(message) = outcome else {
        return;
    };
    let logger = shared.resources.logger.with_context(fn_name);
    if *cancel.borrow() {
        // Unwinds of cancelled tasks are expected noise.
        logger.debug(message);
    } else {
        logger.error(message);
    }
}

/// Drive one callback invocation as a fresh coroutine: resume, interpret the
/// yielded request, execute a handler, resume with the reply, until the
/// coroutine returns or raises.
async fn run_coroutine(
    shared: &PluginShared,
    services: &HostServices,
    fn_name: &str,
    payload: TaskPayload,
    cancel: &mut watch::Receiver<bool>,
) -> TaskOutcome {
    let lua = shared.plugin.lua();

    let table = match engine::plugin_table(lua) {
        Ok(table) => table,
        Err(err) => return TaskOutcome::Failed(err.to_string()),
    };
    let Ok(function) = table.get::<_, Function>(fn_name) else {
        // Absent callback: nothing to run.
        return TaskOutcome::Completed {
            returned_false: false,
        };
    };
    let thread = match lua.create_thread(function) {
        Ok(thread) => thread,
        Err(err) => return TaskOutcome::Failed(err.to_string()),
    };
    let mut args = match payload.into_multi(lua) {
        Ok(args) => args,
        Err(err) => return TaskOutcome::Failed(err.to_string()),
    };

    loop {
        let resumed = match thread.resume::<_, MultiValue>(args) {
            Ok(values) => values,
            Err(err) => {
                return TaskOutcome::Failed(engine::clean_script_error(&err.to_string()));
            }
        };

        if thread.status() != ThreadStatus::Resumable {
            let returned_false =
                matches!(resumed.iter().next(), Some(Value::Boolean(false)));
            return TaskOutcome::Completed { returned_false };
        }

        let request = match HostRequest::from_yield(resumed) {
            Ok(request) => request,
            Err(err) => return TaskOutcome::Failed(err),
        };

        let reply = host::handle_request(request, services, &shared.resources, cancel).await;
        args = match reply.into_multi(lua) {
            Ok(args) => args,
            Err(err) => return TaskOutcome::Failed(err.to_string()),
        };
    }
}
