use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;

use propbridge_core::config::ConfigBuilder;
use propbridge_devices::sim::{SimConnector, SimDevice};
use propbridge_engine::{Coordinator, Request, Response, Service, Session};

fn main() -> anyhow::Result<()> {
    // Defaults, then PROPBRIDGE__SECTION__KEY overrides
    let config = ConfigBuilder::new()
        .with_environment_prefix("PROPBRIDGE")
        .build()
        .context("loading configuration")?;
    propbridge_core::init_with_config(&config)?;

    // A simulated controller stands in for real hardware
    let connector = Arc::new(SimConnector::new());
    connector.plug(SimDevice::odrive_like("205A3370304B"));

    let coordinator = Arc::new(Coordinator::new(&config, connector));
    let mut events = coordinator.subscribe();
    let service = Service::new(coordinator.clone(), &config)?;
    let session = Arc::new(Session::new());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Response>();

    service.submit(&session, Request::FindDevices, tx.clone())?;
    while !coordinator.registry().is_online("odrive0") {
        thread::sleep(Duration::from_millis(20));
    }
    while let Ok(event) = events.try_recv() {
        println!("{}", serde_json::to_string(&Response::from(event))?);
    }

    let requests = [
        r#"{"event": "getProperty", "data": {"path": "odrive0.vbus_voltage"}}"#,
        r#"{"event": "setProperty", "data": {"path": "odrive0.axis0.controller.config.vel_limit", "val": "Infinity", "type": "string"}}"#,
        r#"{"event": "setProperty", "data": {"path": "odrive0.axis0.controller.input_pos", "val": 2.5, "type": "number"}}"#,
        r#"{"event": "sampledVarNames", "data": {"paths": ["odrive0.vbus_voltage", "odrive0.axis0.pos_estimate", "odrive0.vbus_voltage"]}}"#,
        r#"{"event": "enableSampling"}"#,
        r#"{"event": "startSampling"}"#,
    ];
    for request in requests {
        service.submit_json(&session, request, tx.clone())?;
        thread::sleep(Duration::from_millis(10));
    }

    // Print a handful of responses, then stop sampling
    let mut frames = 0;
    let mut stopping = false;
    while let Some(response) = rx.blocking_recv() {
        if let Response::SampledData { .. } = response {
            frames += 1;
            if frames > 3 {
                continue;
            }
        }
        println!("{}", serde_json::to_string(&response)?);
        if frames == 3 && !stopping {
            stopping = true;
            service.submit(&session, Request::StopSampling, tx.clone())?;
        }
        if response == Response::SamplingDisabled {
            break;
        }
    }

    service.shutdown();
    println!("{:?}", session.sampling().stats());
    Ok(())
}
