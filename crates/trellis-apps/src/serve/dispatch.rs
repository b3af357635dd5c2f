//! Per-connection request loop of the app runtime.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use super::{AppService, OutputSink, SERVE_TARGET, ShutdownLatch};
use crate::client::ClientApi;
use crate::context::CallContext;
use crate::error::{ClientApiError, HostError, ServiceError};
use crate::protocol::{
    AppFrame, ChainInfo, ClientCall, HostCall, HostFrame, Outcome, Reply, decode_frame,
    drain_marker, write_frame,
};
use crate::transport::{Connection, ConnectionHandler, LineReader};

/// Both halves of one host connection.
struct Wire {
    writer: Connection,
    reader: LineReader,
    next_callback: u64,
}

/// Answers host calls by delegating to the service.
pub(crate) struct Dispatcher {
    name: String,
    service: Arc<dyn AppService>,
    shutdown: Arc<ShutdownLatch>,
    output: OutputSink,
}

impl Dispatcher {
    pub(crate) fn new(
        name: impl Into<String>,
        service: Arc<dyn AppService>,
        shutdown: Arc<ShutdownLatch>,
        output: OutputSink,
    ) -> Self {
        Self {
            name: name.into(),
            service,
            shutdown,
            output,
        }
    }

    fn serve_connection(&self, connection: Connection) -> Result<(), HostError> {
        let writer = connection.try_clone()?;
        let wire = Mutex::new(Wire {
            writer,
            reader: LineReader::new(connection)?,
            next_callback: 1,
        });

        loop {
            let Some(line) = lock_wire(&wire)?.reader.next_line()? else {
                debug!(target: SERVE_TARGET, app = %self.name, "host disconnected");
                return Ok(());
            };
            let (id, timeout_ms, call) = match decode_frame::<HostFrame>(&line)? {
                HostFrame::Call {
                    id,
                    timeout_ms,
                    call,
                } => (id, timeout_ms, call),
                HostFrame::CallbackReply { id, .. } => {
                    warn!(target: SERVE_TARGET, id, "callback reply outside a call");
                    continue;
                }
            };
            let ctx = timeout_ms.map_or_else(CallContext::background, |ms| {
                CallContext::background().with_timeout(Duration::from_millis(ms))
            });
            debug!(target: SERVE_TARGET, app = %self.name, id, method = call.method(), "call received");

            let api = RemoteClientApi {
                wire: &wire,
                ctx: &ctx,
            };
            let outcome = self.answer(&call, &api);
            if let Some(token) = call.drain() {
                self.write_drain_marker(token);
            }
            write_frame(&mut lock_wire(&wire)?.writer, &AppFrame::Reply { id, outcome })?;

            if matches!(call, HostCall::Shutdown) {
                self.shutdown.release();
                return Ok(());
            }
        }
    }

    fn answer(&self, call: &HostCall, api: &dyn ClientApi) -> Outcome<Reply> {
        let result = match call {
            HostCall::Dispense { service } if *service == self.name => Ok(Reply::Ack),
            HostCall::Dispense { service } => Err(ServiceError::new(format!(
                "unknown service {service:?}, this app serves {:?}",
                self.name
            ))),
            HostCall::Manifest => self.service.manifest().map(Reply::Manifest),
            HostCall::Execute { command, .. } => {
                self.service.execute(command, api).map(|()| Reply::Ack)
            }
            HostCall::HookPre { hook, .. } => {
                self.service.execute_hook_pre(hook, api).map(|()| Reply::Ack)
            }
            HostCall::HookPost { hook, .. } => {
                self.service.execute_hook_post(hook, api).map(|()| Reply::Ack)
            }
            HostCall::HookCleanup { hook, .. } => self
                .service
                .execute_hook_cleanup(hook, api)
                .map(|()| Reply::Ack),
            HostCall::Shutdown => Ok(Reply::Ack),
        };
        if let Err(error) = &result {
            debug!(target: SERVE_TARGET, method = call.method(), error = %error, "call failed");
        }
        result.into()
    }

    /// Flushes whatever the service wrote, then marks the point the host
    /// waits for.
    fn write_drain_marker(&self, token: &str) {
        let Ok(mut output) = self.output.lock() else {
            return;
        };
        let written = output
            .write_all(drain_marker(token).as_bytes())
            .and_then(|()| output.flush());
        if let Err(error) = written {
            warn!(target: SERVE_TARGET, error = %error, "failed to write drain marker");
        }
    }
}

impl ConnectionHandler for Dispatcher {
    fn handle(&self, connection: Connection) {
        if let Err(error) = self.serve_connection(connection) {
            warn!(target: SERVE_TARGET, app = %self.name, error = %error, "host connection failed");
        }
    }
}

fn lock_wire(wire: &Mutex<Wire>) -> Result<MutexGuard<'_, Wire>, HostError> {
    wire.lock().map_err(|_| HostError::Poisoned)
}

/// Client API reached through callback frames on the calling connection.
struct RemoteClientApi<'a> {
    wire: &'a Mutex<Wire>,
    ctx: &'a CallContext,
}

impl ClientApi for RemoteClientApi<'_> {
    fn chain_info(&self) -> Result<ChainInfo, ClientApiError> {
        let transport = |error: HostError| ClientApiError::Transport(error.to_string());
        let mut wire = lock_wire(self.wire).map_err(transport)?;
        let id = wire.next_callback;
        wire.next_callback += 1;
        write_frame(
            &mut wire.writer,
            &AppFrame::Callback {
                id,
                call: ClientCall::ChainInfo,
            },
        )
        .map_err(transport)?;

        let line = wire.reader.read_line(self.ctx).map_err(transport)?;
        match decode_frame::<HostFrame>(&line).map_err(transport)? {
            HostFrame::CallbackReply {
                id: reply_id,
                outcome,
            } if reply_id == id => outcome.into_result().map_err(ClientApiError::Host),
            HostFrame::CallbackReply { .. } | HostFrame::Call { .. } => Err(
                ClientApiError::Transport("unexpected frame while awaiting callback reply".to_owned()),
            ),
        }
    }
}
