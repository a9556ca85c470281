//! Control-plane patch graph.
//!
//! Tracks which nodes exist, how they are wired and what their parameters
//! are set to, and acknowledges every change with an event. Signal
//! processing lives outside this crate.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use patchbay_core::{CommandError, EngineInitError, Message};
use serde_json::{json, Map, Value};

use crate::devices::DeviceServices;
use crate::engine::{Engine, EngineFactory, EventSender};

const DEFAULT_INPUT: &str = "in";

#[derive(Debug)]
struct Node {
    kind: String,
    params: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Edge {
    from: String,
    to: String,
    input: String,
}

impl Edge {
    fn event(&self, kind: &str) -> Message {
        Message::typed(kind)
            .with("from", self.from.as_str())
            .with("to", self.to.as_str())
            .with("input", self.input.as_str())
    }

    fn touches(&self, id: &str) -> bool {
        self.from == id || self.to == id
    }
}

#[derive(Debug, Default)]
struct Graph {
    next_id: u64,
    nodes: BTreeMap<u64, Node>,
    edges: Vec<Edge>,
}

impl Graph {
    fn node_key(&self, id: &str) -> Result<u64, CommandError> {
        id.strip_prefix('n')
            .and_then(|n| n.parse::<u64>().ok())
            .filter(|key| self.nodes.contains_key(key))
            .ok_or_else(|| CommandError::UnknownNode(id.to_string()))
    }

    /// Apply one command, returning the events it produces in order.
    fn apply(&mut self, command: &Message) -> Result<Vec<Message>, CommandError> {
        let kind = command.message_type().ok_or(CommandError::MissingType)?;
        match kind {
            "add-node" => {
                let node_kind = required_str(command, kind, "kind")?;
                if node_kind.is_empty() {
                    return Err(CommandError::invalid_field("kind", "must not be empty"));
                }
                self.next_id += 1;
                let id = format!("n{}", self.next_id);
                self.nodes.insert(
                    self.next_id,
                    Node {
                        kind: node_kind.to_string(),
                        params: Map::new(),
                    },
                );
                Ok(vec![Message::typed("node-added")
                    .with("id", id)
                    .with("kind", node_kind)])
            }
            "remove-node" => {
                let id = required_str(command, kind, "id")?;
                let key = self.node_key(id)?;
                let (dropped, kept): (Vec<Edge>, Vec<Edge>) =
                    self.edges.drain(..).partition(|e| e.touches(id));
                self.edges = kept;
                self.nodes.remove(&key);

                let mut events: Vec<Message> =
                    dropped.iter().map(|e| e.event("disconnected")).collect();
                events.push(Message::typed("node-removed").with("id", id));
                Ok(events)
            }
            "connect" => {
                let edge = self.edge(command, kind)?;
                if edge.from == edge.to {
                    return Err(CommandError::invalid_field(
                        "to",
                        "cannot connect a node to itself",
                    ));
                }
                if self.edges.contains(&edge) {
                    return Err(CommandError::Rejected(format!(
                        "{} is already connected to {}.{}",
                        edge.from, edge.to, edge.input
                    )));
                }
                let event = edge.event("connected");
                self.edges.push(edge);
                Ok(vec![event])
            }
            "disconnect" => {
                let edge = self.edge(command, kind)?;
                let Some(pos) = self.edges.iter().position(|e| *e == edge) else {
                    return Err(CommandError::Rejected(format!(
                        "{} is not connected to {}.{}",
                        edge.from, edge.to, edge.input
                    )));
                };
                let edge = self.edges.remove(pos);
                Ok(vec![edge.event("disconnected")])
            }
            "set" => {
                let id = required_str(command, kind, "id")?;
                let param = required_str(command, kind, "param")?;
                let value = command
                    .get("value")
                    .cloned()
                    .ok_or_else(|| CommandError::missing_field(kind, "value"))?;
                let key = self.node_key(id)?;
                if let Some(node) = self.nodes.get_mut(&key) {
                    node.params.insert(param.to_string(), value.clone());
                }
                Ok(vec![Message::typed("value-changed")
                    .with("id", id)
                    .with("param", param)
                    .with("value", value)])
            }
            "snapshot" => Ok(vec![self.snapshot()]),
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }

    fn edge(&self, command: &Message, kind: &str) -> Result<Edge, CommandError> {
        let from = required_str(command, kind, "from")?;
        let to = required_str(command, kind, "to")?;
        let input = match command.get("input") {
            None | Some(Value::Null) => DEFAULT_INPUT,
            Some(Value::String(s)) => s.as_str(),
            Some(_) => return Err(CommandError::invalid_field("input", "must be a string")),
        };
        self.node_key(from)?;
        self.node_key(to)?;
        Ok(Edge {
            from: from.to_string(),
            to: to.to_string(),
            input: input.to_string(),
        })
    }

    fn snapshot(&self) -> Message {
        let nodes: Vec<Value> = self
            .nodes
            .iter()
            .map(|(key, node)| {
                json!({
                    "id": format!("n{key}"),
                    "kind": node.kind,
                    "params": node.params,
                })
            })
            .collect();
        let edges: Vec<Value> = self
            .edges
            .iter()
            .map(|e| json!({"from": e.from, "to": e.to, "input": e.input}))
            .collect();
        Message::typed("graph")
            .with("nodes", nodes)
            .with("edges", edges)
    }
}

fn required_str<'a>(
    command: &'a Message,
    kind: &str,
    field: &str,
) -> Result<&'a str, CommandError> {
    match command.get(field) {
        None | Some(Value::Null) => Err(CommandError::missing_field(kind, field)),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(CommandError::invalid_field(field, "must be a string")),
    }
}

/// Engine that keeps a per-session patch graph.
pub struct GraphEngine {
    graph: Mutex<Graph>,
    events: Mutex<Option<EventSender>>,
    sample_rate: u32,
}

impl GraphEngine {
    pub fn new(events: EventSender, sample_rate: u32) -> Self {
        Self {
            graph: Mutex::new(Graph::default()),
            events: Mutex::new(Some(events)),
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn node_count(&self) -> usize {
        self.graph.lock().nodes.len()
    }
}

#[async_trait]
impl Engine for GraphEngine {
    async fn handle(&self, command: Message) -> Result<(), CommandError> {
        let events = self.graph.lock().apply(&command)?;
        let Some(sender) = self.events.lock().clone() else {
            return Err(CommandError::Rejected("engine is shut down".into()));
        };
        for event in events {
            sender
                .emit(event)
                .await
                .map_err(|e| CommandError::Rejected(e.to_string()))?;
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.events.lock().take();
        let mut graph = self.graph.lock();
        tracing::debug!(
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "graph engine shut down"
        );
        *graph = Graph::default();
    }
}

/// Builds a `GraphEngine` per session.
#[derive(Clone, Debug, Default)]
pub struct GraphEngineFactory;

impl EngineFactory for GraphEngineFactory {
    fn create(
        &self,
        services: &DeviceServices,
        events: EventSender,
    ) -> Result<Box<dyn Engine>, EngineInitError> {
        if !services.is_running() {
            return Err(EngineInitError::new("device services are not running"));
        }
        Ok(Box::new(GraphEngine::new(events, services.sample_rate())))
    }
}
