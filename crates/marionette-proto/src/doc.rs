//! In-memory model of a format document.
//!
//! A format describes one traffic shape: a finite state machine whose
//! transitions reference named action blocks, plus the transport and port
//! the shape runs over. Both peers must load the same document; the
//! derived [`Document::uuid`] is exchanged inside every cell so a mismatch
//! is detected on the first message.
//!
//! Parsing the operator-facing text format is out of scope here. This
//! module holds the validated, immutable shape the engine consumes.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Party to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Party {
    /// The dialing side
    Client,
    /// The accepting side
    Server,
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::Client => write!(f, "client"),
            Party::Server => write!(f, "server"),
        }
    }
}

/// Party filter on an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionParty {
    /// Evaluated by the client only
    Client,
    /// Evaluated by the server only
    Server,
    /// Evaluated by both parties
    Any,
}

impl ActionParty {
    /// True when an action with this filter runs for `party`.
    #[must_use]
    pub fn matches(self, party: Party) -> bool {
        match self {
            ActionParty::Client => party == Party::Client,
            ActionParty::Server => party == Party::Server,
            ActionParty::Any => true,
        }
    }
}

/// Literal argument to an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Integer literal
    Int(i64),
    /// Floating point literal
    Float(f64),
    /// String literal
    Str(String),
}

impl Value {
    /// Returns the string form, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer form, if this is an integer.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

/// Transport a document runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Stream transport
    Tcp,
    /// Datagram transport
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// Document port: a fixed number, or a name resolved from session vars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    /// Fixed port number
    Number(u16),
    /// Named port looked up at runtime
    Named(String),
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Number(n) => write!(f, "{n}"),
            PortSpec::Named(name) => write!(f, "{name}"),
        }
    }
}

/// One edge of the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// State this transition leaves
    pub source: String,
    /// State this transition enters
    pub destination: String,
    /// Action block evaluated for this transition; `None` succeeds
    /// immediately
    pub action_block: Option<String>,
    /// Relative weight among non-error transitions sharing a source
    pub probability: f64,
    /// Error transitions are fallbacks tried after weighted selection
    pub is_error: bool,
}

/// One pluggable action inside an action block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Which party evaluates this action
    pub party: ActionParty,
    /// Plugin module, e.g. `fte`
    pub module: String,
    /// Plugin method, e.g. `send`
    pub method: String,
    /// Optional peek guard; the action is skipped unless the buffered
    /// bytes match
    pub regex: Option<String>,
    /// Literal arguments passed to the plugin
    pub args: Vec<Value>,
}

impl Action {
    /// Dotted plugin name used in lookups and diagnostics.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}.{}", self.module, self.method)
    }
}

/// A named group of actions referenced by transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionBlock {
    /// Name transitions refer to
    pub name: String,
    /// Actions tried in order until one matches
    pub actions: Vec<Action>,
}

/// An immutable format document shared by both peers.
#[derive(Debug, Clone)]
pub struct Document {
    uuid: u32,
    first_sender: Party,
    transport: Transport,
    port: PortSpec,
    transitions: Vec<Transition>,
    action_blocks: Vec<ActionBlock>,
}

impl Document {
    /// Builds a document, deriving its uuid and first sender from the
    /// content. Two peers constructing from equal parts get equal uuids.
    #[must_use]
    pub fn new(
        transport: Transport,
        port: PortSpec,
        transitions: Vec<Transition>,
        action_blocks: Vec<ActionBlock>,
    ) -> Self {
        let uuid = derive_uuid(transport, &port, &transitions, &action_blocks);
        let first_sender = derive_first_sender(&transitions, &action_blocks);
        Self { uuid, first_sender, transport, port, transitions, action_blocks }
    }

    /// Content-derived document identifier.
    #[must_use]
    pub fn uuid(&self) -> u32 {
        self.uuid
    }

    /// The party that speaks first and chooses the instance id.
    #[must_use]
    pub fn first_sender(&self) -> Party {
        self.first_sender
    }

    /// Transport the document runs over.
    #[must_use]
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Port the document runs on.
    #[must_use]
    pub fn port(&self) -> &PortSpec {
        &self.port
    }

    /// All transitions, in document order.
    #[must_use]
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Transitions leaving `source`, in document order.
    #[must_use]
    pub fn transitions_from(&self, source: &str) -> Vec<&Transition> {
        self.transitions.iter().filter(|t| t.source == source).collect()
    }

    /// Looks up an action block by name.
    #[must_use]
    pub fn action_block(&self, name: &str) -> Option<&ActionBlock> {
        self.action_blocks.iter().find(|b| b.name == name)
    }
}

fn derive_uuid(
    transport: Transport,
    port: &PortSpec,
    transitions: &[Transition],
    action_blocks: &[ActionBlock],
) -> u32 {
    let mut hasher = Sha256::new();
    let mut field = |bytes: &[u8]| {
        Digest::update(&mut hasher, bytes);
        Digest::update(&mut hasher, [0]);
    };

    field(transport.to_string().as_bytes());
    field(port.to_string().as_bytes());
    for t in transitions {
        field(t.source.as_bytes());
        field(t.destination.as_bytes());
        field(t.action_block.as_deref().unwrap_or("NULL").as_bytes());
        field(&t.probability.to_bits().to_be_bytes());
        field(&[u8::from(t.is_error)]);
    }
    for block in action_blocks {
        field(block.name.as_bytes());
        for action in &block.actions {
            field(format!("{:?}", action.party).as_bytes());
            field(action.module.as_bytes());
            field(action.method.as_bytes());
            field(action.regex.as_deref().unwrap_or_default().as_bytes());
            for arg in &action.args {
                field(arg.to_string().as_bytes());
            }
        }
    }

    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// The first sender is the party of the first transmitting action reached
/// by scanning transitions in document order. Documents with no
/// transmitting action default to the client.
fn derive_first_sender(transitions: &[Transition], action_blocks: &[ActionBlock]) -> Party {
    for transition in transitions {
        let Some(name) = &transition.action_block else { continue };
        let Some(block) = action_blocks.iter().find(|b| b.name == *name) else { continue };
        for action in &block.actions {
            let transmits = action.method.starts_with("send") || action.method == "puts";
            if !transmits {
                continue;
            }
            return match action.party {
                ActionParty::Server => Party::Server,
                _ => Party::Client,
            };
        }
    }
    Party::Client
}
