//! Canned format documents for tests.

use marionette_proto::{
    Action, ActionBlock, ActionParty, Document, PortSpec, Transition, Transport, Value,
};

/// Guard pattern matched by every stub ciphertext.
pub const CIPHER_REGEX: &str = "^[0-9a-fx]+";

fn null(source: &str, destination: &str, probability: f64) -> Transition {
    Transition {
        source: source.into(),
        destination: destination.into(),
        action_block: None,
        probability,
        is_error: false,
    }
}

fn acted(source: &str, destination: &str, block: &str) -> Transition {
    Transition {
        source: source.into(),
        destination: destination.into(),
        action_block: Some(block.into()),
        probability: 1.0,
        is_error: false,
    }
}

fn fte_action(party: ActionParty, method: &str, msg_len: i64) -> Action {
    Action {
        party,
        module: "fte".into(),
        method: method.into(),
        regex: None,
        args: vec![Value::Str(CIPHER_REGEX.into()), Value::Int(msg_len)],
    }
}

/// One cell crosses from client to server per cycle. The client is the
/// first sender.
#[must_use]
pub fn relay(port: u16, msg_len: i64) -> Document {
    Document::new(
        Transport::Tcp,
        PortSpec::Number(port),
        vec![null("start", "open", 1.0), acted("open", "dead", "traffic")],
        vec![ActionBlock {
            name: "traffic".into(),
            actions: vec![
                fte_action(ActionParty::Client, "send", msg_len),
                fte_action(ActionParty::Server, "recv", msg_len),
            ],
        }],
    )
}

/// Like [`relay`], but over UDP.
#[must_use]
pub fn relay_udp(port: u16, msg_len: i64) -> Document {
    Document::new(
        Transport::Udp,
        PortSpec::Number(port),
        vec![null("start", "open", 1.0), acted("open", "dead", "traffic")],
        vec![ActionBlock {
            name: "traffic".into(),
            actions: vec![
                fte_action(ActionParty::Client, "send", msg_len),
                fte_action(ActionParty::Server, "recv", msg_len),
            ],
        }],
    )
}

/// Plaintext banner exchange: the client puts a literal greeting and the
/// server expects it.
#[must_use]
pub fn greeting(port: u16, banner: &str) -> Document {
    Document::new(
        Transport::Tcp,
        PortSpec::Number(port),
        vec![acted("start", "greeted", "hello"), null("greeted", "dead", 1.0)],
        vec![ActionBlock {
            name: "hello".into(),
            actions: vec![
                Action {
                    party: ActionParty::Client,
                    module: "io".into(),
                    method: "puts".into(),
                    regex: None,
                    args: vec![Value::Str(banner.into())],
                },
                Action {
                    party: ActionParty::Server,
                    module: "io".into(),
                    method: "gets".into(),
                    regex: None,
                    args: vec![Value::Str(banner.into())],
                },
            ],
        }],
    )
}

/// Probabilistic walk with no actions, for exercising selection.
#[must_use]
pub fn branchy(port: u16) -> Document {
    Document::new(
        Transport::Tcp,
        PortSpec::Number(port),
        vec![
            null("start", "a", 0.6),
            null("start", "b", 0.4),
            null("a", "c", 0.5),
            null("a", "dead", 0.5),
            null("b", "c", 1.0),
            null("c", "dead", 0.7),
            null("c", "a", 0.3),
        ],
        Vec::new(),
    )
}
