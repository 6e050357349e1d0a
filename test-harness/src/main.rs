// Copyright (C) Microsoft Corporation. All rights reserved.

//! Sample binary that drives a `tpm-resourcemgr` [`ResourceManager`]
//! against the crate's in-memory [`FakeAccessBroker`], registering a
//! connection and pushing a few commands through it to demonstrate
//! virtualize-on-create, reload-on-use, and flush end to end.

use std::sync::Arc;
use std::time::Duration;

use tpm_resourcemgr::protocol::Tpm2Response;
use tpm_resourcemgr::rc;
use tpm_resourcemgr::sink::Sink;
use tpm_resourcemgr::sink::Source;
use tpm_resourcemgr::testing::FakeAccessBroker;
use tpm_resourcemgr::testing::FakeCommand;
use tpm_resourcemgr::testing::FakeResponse;
use tpm_resourcemgr::testing::VecSink;
use tpm_resourcemgr::ControlMessage;
use tpm_resourcemgr::DispatchMessage;
use tpm_resourcemgr::DynResult;
use tpm_resourcemgr::ResourceManager;
use tpm_resourcemgr::ResourceManagerConfig;

type Manager = ResourceManager<FakeAccessBroker, FakeCommand>;

fn main() -> DynResult<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let broker = Arc::new(FakeAccessBroker::default());
    // CreatePrimary, as in a real TPM, is the command whose success
    // response carries a freshly minted transient handle.
    broker.creates_handle_for(rc::cc::CREATE_PRIMARY);

    let mut manager: Manager = ResourceManager::new(broker, ResourceManagerConfig::default());

    let sink = Arc::new(VecSink::default());
    manager.add_sink(Box::new(Arc::clone(&sink)));

    let connection = manager.register_connection(1);
    tracing::info!(connection_id = connection.id(), "registered connection");

    smoke_test(&manager, &sink)?;

    manager.unregister_connection(1);
    manager
        .enqueue(DispatchMessage::Control(ControlMessage::CheckCancel))
        .expect("dispatch worker unexpectedly gone");
    manager.join();

    Ok(())
}

/// Sends a `CreatePrimary`, reuses the vhandle it gets back, then
/// flushes it, exercising the create -> evict -> reload -> flush cycle
/// across three independent commands on the same connection.
fn smoke_test(manager: &Manager, sink: &VecSink<FakeResponse>) -> DynResult<()> {
    manager.enqueue(DispatchMessage::Command(FakeCommand::new(
        1,
        rc::cc::CREATE_PRIMARY,
    )))?;
    let created = recv_one(sink);
    eprintln!("CreatePrimary response: rc = {:#x}", created.rc());

    let vhandle = created
        .handle()
        .expect("CreatePrimary should have virtualized a fresh handle");
    eprintln!("created object at vhandle {}", vhandle);

    // a later command referencing the same vhandle triggers a
    // transparent context_load before dispatch.
    manager.enqueue(DispatchMessage::Command(
        FakeCommand::new(1, 0x0000_0173).with_handle(vhandle),
    ))?;
    let reused = recv_one(sink);
    eprintln!("reused object, rc = {:#x}", reused.rc());

    manager.enqueue(DispatchMessage::Command(FakeCommand::flush_context(
        1, vhandle,
    )))?;
    let flushed = recv_one(sink);
    eprintln!("flushed object, rc = {:#x}", flushed.rc());

    Ok(())
}

fn recv_one<T>(sink: &VecSink<T>) -> T {
    for _ in 0..200 {
        let mut drained = sink.drain();
        if let Some(item) = drained.pop() {
            return item;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for a response from the dispatch worker");
}
