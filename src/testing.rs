//! In-memory fakes for the access broker, sink, and command/response
//! parser collaborators, used by this crate's own tests and by
//! `test-harness`. Not behind a `#[cfg(test)]` gate since `test-harness`
//! is a separate crate and needs them as ordinary dependencies.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::access_broker::AccessBroker;
use crate::handle::Handle;
use crate::handle_map::ContextBlob;
use crate::protocol::Tpm2Command;
use crate::protocol::Tpm2Response;
use crate::protocol::Tpm2ResponseFactory;
use crate::sink::Sink;

/// A command with a fixed-size handle area (0-3 handles for commands),
/// good enough to exercise the virtualizer without a real TPM wire
/// parser.
#[derive(Debug, Clone)]
pub struct FakeCommand {
    connection_id: u64,
    command_code: u32,
    handles: Vec<Handle>,
    /// Only meaningful for `TPM_CC_FlushContext`.
    flush_target: Handle,
    attributes: u32,
}

impl FakeCommand {
    /// A command with no handles.
    pub fn new(connection_id: u64, command_code: u32) -> FakeCommand {
        FakeCommand {
            connection_id,
            command_code,
            handles: Vec::new(),
            flush_target: Handle::new(0),
            attributes: 0,
        }
    }

    /// Add a handle to the command's handle area (order matters: index
    /// 0 is pushed first).
    pub fn with_handle(mut self, handle: Handle) -> FakeCommand {
        self.handles.push(handle);
        self
    }

    /// A `TPM_CC_FlushContext` command targeting `target`.
    pub fn flush_context(connection_id: u64, target: Handle) -> FakeCommand {
        FakeCommand {
            connection_id,
            command_code: crate::rc::cc::FLUSH_CONTEXT,
            handles: Vec::new(),
            flush_target: target,
            attributes: 0,
        }
    }
}

impl Tpm2Command for FakeCommand {
    fn connection_id(&self) -> u64 {
        self.connection_id
    }

    fn command_code(&self) -> u32 {
        self.command_code
    }

    fn handle_count(&self) -> usize {
        self.handles.len()
    }

    fn handle_at(&self, index: usize) -> Handle {
        self.handles[index]
    }

    fn set_handle_at(&mut self, index: usize, handle: Handle) {
        self.handles[index] = handle;
    }

    fn flush_target(&self) -> Handle {
        self.flush_target
    }

    fn attributes(&self) -> u32 {
        self.attributes
    }

    fn set_attributes(&mut self, attributes: u32) {
        self.attributes = attributes;
    }

    fn raw(&self) -> &[u8] {
        &[]
    }
}

/// A response carrying at most one handle (responses carry 0 or 1).
#[derive(Debug, Clone)]
pub struct FakeResponse {
    connection_id: u64,
    rc: u32,
    handle: Option<Handle>,
    attributes: u32,
}

impl Tpm2Response for FakeResponse {
    fn connection_id(&self) -> u64 {
        self.connection_id
    }

    fn rc(&self) -> u32 {
        self.rc
    }

    fn handle(&self) -> Option<Handle> {
        self.handle
    }

    fn set_handle(&mut self, handle: Handle) {
        self.handle = Some(handle);
    }

    fn attributes(&self) -> u32 {
        self.attributes
    }

    fn set_attributes(&mut self, attributes: u32) {
        self.attributes = attributes;
    }

    fn raw(&self) -> &[u8] {
        &[]
    }
}

impl Tpm2ResponseFactory for FakeResponse {
    fn synthesize(connection_id: u64, rc: u32) -> FakeResponse {
        FakeResponse {
            connection_id,
            rc,
            handle: None,
            attributes: 0,
        }
    }
}

/// An in-memory stand-in for the TPM device + its driver. Commands
/// whose code is registered via [`FakeAccessBroker::creates_handle_for`]
/// produce a response carrying a freshly allocated phandle, simulating
/// a TPM command that creates a new transient object; every other
/// command succeeds with no handle.
pub struct FakeAccessBroker {
    next_phandle: AtomicU32,
    loads: Mutex<u32>,
    saveflushes: Mutex<u32>,
    fail_next_load: Mutex<bool>,
    fail_next_saveflush: Mutex<bool>,
    fail_next_send: Mutex<bool>,
    creating_command_codes: Mutex<Vec<u32>>,
}

impl Default for FakeAccessBroker {
    fn default() -> FakeAccessBroker {
        FakeAccessBroker {
            next_phandle: AtomicU32::new(0x8000_1000),
            loads: Mutex::new(0),
            saveflushes: Mutex::new(0),
            fail_next_load: Mutex::new(false),
            fail_next_saveflush: Mutex::new(false),
            fail_next_send: Mutex::new(false),
            creating_command_codes: Mutex::new(Vec::new()),
        }
    }
}

impl FakeAccessBroker {
    /// Register that `command_code`'s success response carries a fresh
    /// transient phandle.
    pub fn creates_handle_for(&self, command_code: u32) {
        self.creating_command_codes.lock().unwrap().push(command_code);
    }

    /// Make the next `context_load` call fail with `rc`.
    pub fn fail_next_load(&self) {
        *self.fail_next_load.lock().unwrap() = true;
    }

    /// Make the next `context_saveflush` call fail.
    pub fn fail_next_saveflush(&self) {
        *self.fail_next_saveflush.lock().unwrap() = true;
    }

    /// Make the next `send_command` call fail.
    pub fn fail_next_send(&self) {
        *self.fail_next_send.lock().unwrap() = true;
    }

    /// How many times `context_load` has succeeded.
    pub fn load_count(&self) -> u32 {
        *self.loads.lock().unwrap()
    }

    /// How many times `context_saveflush` has succeeded.
    pub fn saveflush_count(&self) -> u32 {
        *self.saveflushes.lock().unwrap()
    }

    fn alloc_phandle(&self) -> Handle {
        Handle::new(self.next_phandle.fetch_add(1, Ordering::Relaxed))
    }
}

const GENERIC_FAILURE_RC: u32 = 0x0001;

impl AccessBroker for FakeAccessBroker {
    type Response = FakeResponse;

    fn send_command(&self, cmd: &dyn Tpm2Command) -> Result<FakeResponse, u32> {
        if std::mem::take(&mut *self.fail_next_send.lock().unwrap()) {
            return Err(GENERIC_FAILURE_RC);
        }

        let handle = if self
            .creating_command_codes
            .lock()
            .unwrap()
            .contains(&cmd.command_code())
        {
            Some(self.alloc_phandle())
        } else {
            None
        };

        Ok(FakeResponse {
            connection_id: cmd.connection_id(),
            rc: 0,
            handle,
            attributes: 0,
        })
    }

    fn context_load(&self, _blob: &ContextBlob) -> Result<Handle, u32> {
        if std::mem::take(&mut *self.fail_next_load.lock().unwrap()) {
            return Err(GENERIC_FAILURE_RC);
        }
        *self.loads.lock().unwrap() += 1;
        Ok(self.alloc_phandle())
    }

    fn context_saveflush(&self, _phandle: Handle) -> Result<ContextBlob, u32> {
        if std::mem::take(&mut *self.fail_next_saveflush.lock().unwrap()) {
            return Err(GENERIC_FAILURE_RC);
        }
        *self.saveflushes.lock().unwrap() += 1;
        Ok(vec![0xab; 4])
    }
}

/// A sink that just appends every item to a `Vec`, for assertions in
/// tests and for the `test-harness` binary's "print what came back"
/// loop.
pub struct VecSink<T> {
    items: Mutex<Vec<T>>,
}

impl<T> Default for VecSink<T> {
    fn default() -> VecSink<T> {
        VecSink {
            items: Mutex::new(Vec::new()),
        }
    }
}

impl<T> VecSink<T> {
    /// Snapshot of everything enqueued so far, in order.
    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut self.items.lock().unwrap())
    }
}

impl<T: Send + Sync> Sink<T> for VecSink<T> {
    fn enqueue(&self, item: T) -> crate::error::DynResult<()> {
        self.items.lock().unwrap().push(item);
        Ok(())
    }
}

// So an `Arc<VecSink<T>>` can be handed to `add_sink` while the caller
// keeps its own clone around to `drain()` from.
impl<T: Send + Sync> Sink<T> for std::sync::Arc<VecSink<T>> {
    fn enqueue(&self, item: T) -> crate::error::DynResult<()> {
        VecSink::enqueue(self, item)
    }
}
