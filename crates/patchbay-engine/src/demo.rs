//! Offline demonstration: drives one session through a scripted patch
//! without any network client.

use std::time::Duration;

use patchbay_core::{EngineInitError, Message, SessionError};
use serde_json::json;

use crate::devices::DeviceServices;
use crate::engine::EngineFactory;
use crate::session::{Session, SessionConfig};

#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error(transparent)]
    Init(#[from] EngineInitError),
    #[error("demo step {step} failed: {source}")]
    Step { step: usize, source: SessionError },
}

/// The patch the demo plays: oscillator into gain into output, then a short
/// melody of frequency changes and a fade out.
pub fn script() -> Vec<Message> {
    let mut steps = vec![
        json!({"type": "add-node", "kind": "oscillator"}),
        json!({"type": "add-node", "kind": "gain"}),
        json!({"type": "add-node", "kind": "output"}),
        json!({"type": "connect", "from": "n1", "to": "n2"}),
        json!({"type": "connect", "from": "n2", "to": "n3"}),
        json!({"type": "set", "id": "n2", "param": "gain", "value": 0.5}),
    ];
    for freq in [220.0, 277.18, 329.63, 440.0] {
        steps.push(json!({"type": "set", "id": "n1", "param": "freq", "value": freq}));
    }
    steps.push(json!({"type": "set", "id": "n2", "param": "gain", "value": 0.0}));
    steps.push(json!({"type": "snapshot"}));

    steps
        .into_iter()
        .filter_map(|v| Message::try_from(v).ok())
        .collect()
}

/// Run the demo script and return every event the engine produced.
pub async fn run(
    factory: &dyn EngineFactory,
    services: &DeviceServices,
    step_delay: Duration,
) -> Result<Vec<Message>, DemoError> {
    let session = Session::create(factory, services, &SessionConfig::default())?;
    let Some(mut events) = session.events() else {
        return Err(DemoError::Init(EngineInitError::new("session has no event stream")));
    };
    tracing::info!(session_id = %session.id(), "demo started");

    let mut produced = Vec::new();
    for (step, command) in script().into_iter().enumerate() {
        if let Err(source) = session.handle(command).await {
            session.close();
            return Err(DemoError::Step { step, source });
        }
        while let Some(event) = events.try_next() {
            tracing::info!(event = %event.clone().into_value(), "demo event");
            produced.push(event);
        }
        if !step_delay.is_zero() {
            tokio::time::sleep(step_delay).await;
        }
    }

    session.close();
    tracing::info!(events = produced.len(), "demo finished");
    Ok(produced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceConfig;
    use crate::graph::GraphEngineFactory;
    use crate::mock::{MockEngineFactory, MockProbe};

    fn services() -> DeviceServices {
        DeviceServices::initialize(DeviceConfig::default()).unwrap()
    }

    #[test]
    fn script_is_all_typed_commands() {
        let script = script();
        assert_eq!(script.len(), 12);
        assert!(script.iter().all(|m| m.message_type().is_some()));
    }

    #[tokio::test]
    async fn demo_runs_on_graph_engine() {
        let events = run(&GraphEngineFactory, &services(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(events.len(), script().len());
        assert_eq!(events[0].message_type(), Some("node-added"));

        let graph = events.last().unwrap();
        assert_eq!(graph.message_type(), Some("graph"));
        assert_eq!(graph.get("nodes").unwrap().as_array().unwrap().len(), 3);
        assert_eq!(graph.get("edges").unwrap().as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn demo_reports_failing_step() {
        let probe = MockProbe::new();
        let factory = MockEngineFactory::echo(probe.clone()).rejecting("connect");
        let err = run(&factory, &services(), Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, DemoError::Step { step: 3, .. }));
        assert_eq!(probe.shutdowns(), 1);
    }

    #[tokio::test]
    async fn demo_reports_init_failure() {
        let factory = MockEngineFactory::failing("no device");
        let err = run(&factory, &services(), Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, DemoError::Init(_)));
    }
}
