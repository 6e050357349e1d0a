//! The dispatch thread and its concurrency model: a single worker
//! drains an MPSC inbound queue, invoking the virtualizer for each
//! command and enqueuing its response to the outbound sink. The worker
//! is the sole writer to TPM state, which linearizes all TPM
//! interaction for free.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use tracing::debug;
use tracing::instrument;

use crate::access_broker::AccessBroker;
use crate::access_broker::SharedAccessBroker;
use crate::config::ResourceManagerConfig;
use crate::connection::Connection;
use crate::error::DynResult;
use crate::error::Error;
use crate::protocol::Tpm2Command;
use crate::protocol::Tpm2ResponseFactory;
use crate::sink::Sink;
use crate::sink::Source;
use crate::virtualizer::Virtualizer;

/// Control messages recognized by the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Triggers graceful shutdown: the worker returns once this message
    /// is dequeued, having already processed everything queued ahead of
    /// it.
    CheckCancel,
}

/// Anything the inbound queue can carry besides the null shutdown
/// sentinel.
pub enum DispatchMessage<C> {
    /// A command to virtualize and dispatch.
    Command(C),
    /// An out-of-band instruction to the worker.
    Control(ControlMessage),
}

type Inbound<C> = Option<DispatchMessage<C>>;

/// Registry of live connections, keyed by the opaque id threaded
/// through every command/response. Owned by the resource manager; the
/// dispatch worker only ever reads it.
type ConnectionRegistry = Mutex<HashMap<u64, Arc<Connection>>>;

/// Ties together the inbound queue, the virtualizer, and the outbound
/// sink, and owns the single dispatch thread that drains them.
///
/// `B` is the access broker implementation and `C` the concrete command
/// type; both are fixed for the lifetime of one resource manager
/// instance.
pub struct ResourceManager<B, C>
where
    B: AccessBroker + 'static,
    B::Response: Tpm2ResponseFactory + 'static,
    C: Tpm2Command + 'static,
{
    sender: mpsc::Sender<Inbound<C>>,
    connections: Arc<ConnectionRegistry>,
    config: ResourceManagerConfig,
    outbound: Arc<Mutex<Option<Box<dyn Sink<B::Response>>>>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<B, C> ResourceManager<B, C>
where
    B: AccessBroker + 'static,
    B::Response: Tpm2ResponseFactory + 'static,
    C: Tpm2Command + 'static,
{
    /// Construct a resource manager and spawn its dispatch thread. The
    /// thread blocks on the inbound queue immediately; no command is
    /// processed until one is enqueued.
    pub fn new(access_broker: SharedAccessBroker<B>, config: ResourceManagerConfig) -> ResourceManager<B, C> {
        let (sender, receiver) = mpsc::channel::<Inbound<C>>();
        let connections: Arc<ConnectionRegistry> = Arc::new(Mutex::new(HashMap::new()));
        let outbound: Arc<Mutex<Option<Box<dyn Sink<B::Response>>>>> = Arc::new(Mutex::new(None));

        let worker_connections = Arc::clone(&connections);
        let worker_outbound = Arc::clone(&outbound);
        let virtualizer = Virtualizer::new(access_broker);

        let join_handle = thread::Builder::new()
            .name("tpm-resourcemgr-dispatch".to_owned())
            .spawn(move || run(receiver, virtualizer, worker_connections, worker_outbound))
            .expect("failed to spawn dispatch thread");

        ResourceManager {
            sender,
            connections,
            config,
            outbound,
            join_handle: Mutex::new(Some(join_handle)),
        }
    }

    /// Register a new connection, handing back the handle it should be
    /// addressed by in subsequent commands.
    pub fn register_connection(&self, id: u64) -> Arc<Connection> {
        let connection = Arc::new(Connection::new(id, &self.config));
        self.connections
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&connection));
        connection
    }

    /// Tear down a connection: drop its handle map entries and remove
    /// it from the registry.
    pub fn unregister_connection(&self, id: u64) {
        if let Some(connection) = self.connections.lock().unwrap().remove(&id) {
            connection.close();
        }
    }

    /// The null-sentinel shutdown path: the worker exits as soon as it
    /// dequeues this, without processing anything enqueued after it.
    pub fn shutdown_now(&self) {
        // a closed channel means the worker already exited; nothing to do.
        let _ = self.sender.send(None);
    }

    /// Block until the dispatch thread has exited. Panics if called a
    /// second time: by the time finalize runs, the thread must already
    /// have been joined exactly once.
    pub fn join(&self) {
        let handle = self
            .join_handle
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| panic!("{}", Error::WorkerStillRunning));
        handle.join().expect("dispatch thread panicked");
    }
}

impl<B, C> Sink<DispatchMessage<C>> for ResourceManager<B, C>
where
    B: AccessBroker + 'static,
    B::Response: Tpm2ResponseFactory + 'static,
    C: Tpm2Command + 'static,
{
    /// The inbound queue contract: accepts either a command or a
    /// control message.
    fn enqueue(&self, item: DispatchMessage<C>) -> DynResult<()> {
        self.sender
            .send(Some(item))
            .map_err(|_| "dispatch worker has already exited".into())
    }
}

impl<B, C> Source<B::Response> for ResourceManager<B, C>
where
    B: AccessBroker + 'static,
    B::Response: Tpm2ResponseFactory + 'static,
    C: Tpm2Command + 'static,
{
    /// Set the downstream sink responses are enqueued to.
    fn add_sink(&mut self, sink: Box<dyn Sink<B::Response>>) {
        *self.outbound.lock().unwrap() = Some(sink);
    }
}

#[instrument(level = "trace", skip_all)]
fn run<B, C>(
    receiver: mpsc::Receiver<Inbound<C>>,
    virtualizer: Virtualizer<B>,
    connections: Arc<ConnectionRegistry>,
    outbound: Arc<Mutex<Option<Box<dyn Sink<B::Response>>>>>,
) where
    B: AccessBroker,
    B::Response: Tpm2ResponseFactory,
    C: Tpm2Command,
{
    debug!("dispatch thread starting");
    loop {
        let message = match receiver.recv() {
            Ok(message) => message,
            Err(_) => {
                debug!("inbound queue closed with no shutdown message; exiting");
                break;
            }
        };

        let message = match message {
            Some(message) => message,
            None => {
                debug!("null sentinel observed, exiting immediately");
                break;
            }
        };

        match message {
            DispatchMessage::Command(cmd) => {
                let connection_id = cmd.connection_id();
                let handle_map = connections
                    .lock()
                    .unwrap()
                    .get(&connection_id)
                    .map(|c| Arc::clone(c.transient_handle_map()));

                let Some(handle_map) = handle_map else {
                    // the connection closed between enqueuing this
                    // command and the worker getting to it; there's no
                    // one left to answer, so drop it rather than invent
                    // a handle map. The map is owned by its connection,
                    // and is gone once the connection is.
                    debug!(connection_id, "dropping command for unknown connection");
                    continue;
                };

                let response = virtualizer.process_command(cmd, &handle_map);
                send_response(&outbound, response);
            }
            DispatchMessage::Control(ControlMessage::CheckCancel) => {
                debug!("CHECK_CANCEL observed, shutting down gracefully");
                break;
            }
        }
    }
    debug!("dispatch thread exiting");
}

fn send_response<R: Send>(outbound: &Mutex<Option<Box<dyn Sink<R>>>>, response: R) {
    let guard = outbound.lock().unwrap();
    match guard.as_ref() {
        Some(sink) => {
            if let Err(e) = sink.enqueue(response) {
                tracing::warn!("failed to enqueue response: {}", e);
            }
        }
        None => {
            tracing::warn!("no outbound sink registered; dropping response");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::rc;
    use crate::testing::FakeAccessBroker;
    use crate::testing::FakeCommand;
    use crate::testing::VecSink;

    type TestManager = ResourceManager<FakeAccessBroker, FakeCommand>;

    fn setup() -> (TestManager, Arc<VecSink<crate::testing::FakeResponse>>) {
        let broker = Arc::new(FakeAccessBroker::default());
        let mut manager = ResourceManager::new(broker, ResourceManagerConfig::default());
        let sink = Arc::new(VecSink::default());
        manager.add_sink(Box::new(Arc::clone(&sink)));
        (manager, sink)
    }

    fn recv_one<T>(sink: &VecSink<T>) -> T {
        for _ in 0..200 {
            let mut drained = sink.drain();
            if let Some(item) = drained.pop() {
                return item;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for a response");
    }

    /// Scenario 6: orderly shutdown via CHECK_CANCEL.
    #[test]
    fn check_cancel_drains_then_exits() {
        let (manager, sink) = setup();
        manager.register_connection(1);

        manager
            .enqueue(DispatchMessage::Command(FakeCommand::new(1, 0x0000_0173)))
            .unwrap();
        manager
            .enqueue(DispatchMessage::Control(ControlMessage::CheckCancel))
            .unwrap();

        let response = recv_one(&sink);
        use crate::protocol::Tpm2Response;
        assert_eq!(response.rc(), 0);

        manager.join();
    }

    /// The null-sentinel shutdown path exits without requiring a
    /// CHECK_CANCEL control message.
    #[test]
    fn null_sentinel_shuts_down() {
        let (manager, _sink) = setup();
        manager.shutdown_now();
        manager.join();
    }

    /// Calling `join` a second time is a programmer error.
    #[test]
    #[should_panic(expected = "dispatch worker is still running")]
    fn double_join_panics() {
        let (manager, _sink) = setup();
        manager.shutdown_now();
        manager.join();
        manager.join();
    }

    /// A command addressed to an already-closed connection is dropped,
    /// not processed against a stale or missing handle map.
    #[test]
    fn command_for_unregistered_connection_is_dropped() {
        let (manager, sink) = setup();
        // no register_connection call for id 42
        manager
            .enqueue(DispatchMessage::Command(FakeCommand::new(
                42,
                rc::cc::CREATE_PRIMARY,
            )))
            .unwrap();
        manager
            .enqueue(DispatchMessage::Control(ControlMessage::CheckCancel))
            .unwrap();
        manager.join();
        assert!(sink.drain().is_empty());
    }
}
