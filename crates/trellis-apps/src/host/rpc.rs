//! [`AppInterface`] over a JSON-lines connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use super::output::DrainMonitor;
use super::{AppInterface, HOST_TARGET};
use crate::client::ClientApi;
use crate::context::CallContext;
use crate::error::{ClientApiError, HostError};
use crate::protocol::{
    AppFrame, ClientCall, ExecutedCommand, ExecutedHook, HostCall, HostFrame, Manifest, Outcome,
    Reply, decode_frame, write_frame,
};
use crate::transport::{Connection, LineReader};

/// How long a call waits for its drain marker after the reply.
pub const DEFAULT_DRAIN_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct Channel {
    writer: Connection,
    reader: LineReader,
    next_id: u64,
    poisoned: bool,
    closed: bool,
}

#[derive(Debug)]
struct Drain {
    monitor: Arc<DrainMonitor>,
    wait: Duration,
    prefix: String,
    counter: AtomicU64,
}

/// Client side of one app connection.
///
/// Calls are serialised on the connection. A call interrupted by its
/// context leaves an unknown amount of the reply unread, so the client
/// refuses further calls after that.
#[derive(Debug)]
pub struct RpcAppClient {
    channel: Mutex<Channel>,
    control: Connection,
    endpoint: String,
    drain: Option<Drain>,
}

impl RpcAppClient {
    /// Wraps an established connection.
    ///
    /// # Errors
    ///
    /// Fails when the connection cannot be duplicated or configured.
    pub fn new(connection: Connection, endpoint: impl Into<String>) -> Result<Self, HostError> {
        let writer = connection.try_clone()?;
        let control = connection.try_clone()?;
        let reader = LineReader::new(connection)?;
        Ok(Self {
            channel: Mutex::new(Channel {
                writer,
                reader,
                next_id: 1,
                poisoned: false,
                closed: false,
            }),
            control,
            endpoint: endpoint.into(),
            drain: None,
        })
    }

    /// Sends drain tokens with output-producing calls and waits up to `wait`
    /// for `monitor` to see them. Only meaningful when this host forwards
    /// the app's stdout.
    #[must_use]
    pub fn with_drain(
        mut self,
        monitor: Arc<DrainMonitor>,
        prefix: impl Into<String>,
        wait: Duration,
    ) -> Self {
        self.drain = Some(Drain {
            monitor,
            wait,
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        });
        self
    }

    /// Requests the named service.
    ///
    /// # Errors
    ///
    /// Fails when the app does not serve `service`.
    pub fn dispense(&self, service: &str, ctx: &CallContext) -> Result<(), HostError> {
        let call = HostCall::Dispense {
            service: service.to_owned(),
        };
        expect_ack(self.call(ctx, call, None)?)
    }

    /// Asks the app to exit. The app acknowledges before stopping.
    ///
    /// # Errors
    ///
    /// Fails when the request cannot be delivered.
    pub fn shutdown(&self, ctx: &CallContext) -> Result<(), HostError> {
        expect_ack(self.call(ctx, HostCall::Shutdown, None)?)
    }

    /// Closes the connection and fails later calls with
    /// [`HostError::Closed`]. A call blocked on a read is woken.
    pub fn close(&self) {
        self.control.shutdown();
        if let Ok(mut channel) = self.channel.lock() {
            channel.closed = true;
        }
    }

    fn next_drain_token(&self) -> Option<String> {
        self.drain.as_ref().map(|drain| {
            let sequence = drain.counter.fetch_add(1, Ordering::SeqCst);
            format!("{}-{sequence}", drain.prefix)
        })
    }

    fn await_drain(&self, token: Option<&str>) {
        let (Some(drain), Some(token)) = (&self.drain, token) else {
            return;
        };
        if !drain.monitor.wait(token, drain.wait) {
            debug!(
                target: HOST_TARGET,
                endpoint = %self.endpoint,
                token,
                "app output not drained in time"
            );
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Channel>, HostError> {
        let channel = self.channel.lock().map_err(|_| HostError::Poisoned)?;
        if channel.closed {
            return Err(HostError::Closed);
        }
        if channel.poisoned {
            return Err(HostError::Poisoned);
        }
        Ok(channel)
    }

    fn call(
        &self,
        ctx: &CallContext,
        call: HostCall,
        api: Option<&dyn ClientApi>,
    ) -> Result<Reply, HostError> {
        ctx.check()?;
        let mut channel = self.lock()?;
        let result = exchange(&mut channel, ctx, call, api);
        if let Err(error) = &result
            && !matches!(error, HostError::Remote { .. })
        {
            channel.poisoned = true;
            warn!(
                target: HOST_TARGET,
                endpoint = %self.endpoint,
                error = %error,
                "app connection interrupted"
            );
        }
        result
    }

    fn call_with_drain<F>(
        &self,
        ctx: &CallContext,
        api: &dyn ClientApi,
        build: F,
    ) -> Result<(), HostError>
    where
        F: FnOnce(Option<String>) -> HostCall,
    {
        let token = self.next_drain_token();
        let call = build(token.clone());
        let reply = self.call(ctx, call, Some(api));
        if matches!(reply, Ok(_) | Err(HostError::Remote { .. })) {
            self.await_drain(token.as_deref());
        }
        expect_ack(reply?)
    }
}

fn exchange(
    channel: &mut Channel,
    ctx: &CallContext,
    call: HostCall,
    api: Option<&dyn ClientApi>,
) -> Result<Reply, HostError> {
    let id = channel.next_id;
    channel.next_id += 1;
    let timeout_ms = ctx
        .remaining()
        .map(|left| u64::try_from(left.as_millis()).unwrap_or(u64::MAX));
    write_frame(&mut channel.writer, &HostFrame::Call { id, timeout_ms, call })?;

    loop {
        let line = channel.reader.read_line(ctx)?;
        match decode_frame::<AppFrame>(&line)? {
            AppFrame::Reply { id: reply_id, outcome } if reply_id == id => {
                return outcome
                    .into_result()
                    .map_err(|message| HostError::Remote { message });
            }
            AppFrame::Reply { .. } => {
                return Err(HostError::UnexpectedReply {
                    expected: "reply to the current call",
                });
            }
            AppFrame::Callback {
                id: callback_id,
                call: ClientCall::ChainInfo,
            } => {
                let outcome: Outcome<_> = match api {
                    Some(client) => client.chain_info().into(),
                    None => Outcome::Err(ClientApiError::NoChain.to_string()),
                };
                write_frame(
                    &mut channel.writer,
                    &HostFrame::CallbackReply {
                        id: callback_id,
                        outcome,
                    },
                )?;
            }
        }
    }
}

fn expect_ack(reply: Reply) -> Result<(), HostError> {
    match reply {
        Reply::Ack => Ok(()),
        Reply::Manifest(_) => Err(HostError::UnexpectedReply { expected: "ack" }),
    }
}

impl AppInterface for RpcAppClient {
    fn manifest(&self, ctx: &CallContext) -> Result<Manifest, HostError> {
        match self.call(ctx, HostCall::Manifest, None)? {
            Reply::Manifest(manifest) => Ok(manifest),
            Reply::Ack => Err(HostError::UnexpectedReply {
                expected: "manifest",
            }),
        }
    }

    fn execute(
        &self,
        ctx: &CallContext,
        command: &ExecutedCommand,
        api: &dyn ClientApi,
    ) -> Result<(), HostError> {
        self.call_with_drain(ctx, api, |drain| HostCall::Execute {
            command: command.clone(),
            drain,
        })
    }

    fn execute_hook_pre(
        &self,
        ctx: &CallContext,
        hook: &ExecutedHook,
        api: &dyn ClientApi,
    ) -> Result<(), HostError> {
        self.call_with_drain(ctx, api, |drain| HostCall::HookPre {
            hook: hook.clone(),
            drain,
        })
    }

    fn execute_hook_post(
        &self,
        ctx: &CallContext,
        hook: &ExecutedHook,
        api: &dyn ClientApi,
    ) -> Result<(), HostError> {
        self.call_with_drain(ctx, api, |drain| HostCall::HookPost {
            hook: hook.clone(),
            drain,
        })
    }

    fn execute_hook_cleanup(
        &self,
        ctx: &CallContext,
        hook: &ExecutedHook,
        api: &dyn ClientApi,
    ) -> Result<(), HostError> {
        self.call_with_drain(ctx, api, |drain| HostCall::HookCleanup {
            hook: hook.clone(),
            drain,
        })
    }
}
