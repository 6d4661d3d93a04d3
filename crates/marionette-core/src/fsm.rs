//! The state machine engine.
//!
//! One `Fsm` drives one side of a shaped session. Each step gathers the
//! transitions leaving the current state, orders the candidates (weighted
//! draw when the selection PRNG is seeded, document order when it is not,
//! error transitions always last), and evaluates each candidate's action
//! block until one matches. Matching commits the step: the state advances
//! and the step counter grows.
//!
//! # Instance-id handshake
//!
//! Both peers must make identical weighted draws, so they share a PRNG
//! seed: the first sender picks a random instance id at construction and
//! stamps it into every cell it encrypts. The receiver runs unseeded until
//! it decrypts the first cell, adopts the id, and asks for the step to be
//! retried. Seeding late means the receiver's PRNG is behind, so before
//! resuming it replays its own selection history from `start`, consuming
//! the same draws the peer consumed for those steps.
//!
//! # Lifecycle
//!
//! ```text
//! new() ── execute() ──> "dead"          one cycle
//!             │ reset()                  ciphers and listeners released,
//!             └─────────< driver loops   instance id and PRNG retained
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use marionette_proto::{ActionBlock, Document, Party, PortSpec, Transition, Value};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use regex::bytes::Regex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cipher::{Cipher, CipherCache, CipherSuite};
use crate::config::Config;
use crate::conn::{BufferedConn, Conn};
use crate::error::{Error, Result};
use crate::plugin::registry;
use crate::stream::StreamSet;

/// State every machine starts a cycle in.
pub const STATE_START: &str = "start";
/// Terminal state completing a cycle.
pub const STATE_DEAD: &str = "dead";

/// One party's state machine bound to one transport connection.
pub struct Fsm {
    doc: Arc<Document>,
    host: String,
    party: Party,
    config: Config,
    conn: BufferedConn,
    streams: Arc<StreamSet>,
    ciphers: CipherCache,
    listeners: Vec<JoinHandle<()>>,
    transitions: HashMap<String, Vec<Transition>>,
    state: String,
    step_n: u64,
    instance_id: u32,
    prng: Option<ChaCha20Rng>,
    vars: HashMap<String, Value>,
    guards: HashMap<String, Regex>,
    cancel: watch::Receiver<bool>,
}

impl Fsm {
    /// Builds a machine over `conn`. The first sender seeds its selection
    /// PRNG from a fresh random instance id; the other party starts
    /// unseeded and adopts the peer's id in-band.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        doc: Arc<Document>,
        host: impl Into<String>,
        party: Party,
        conn: Box<dyn Conn>,
        streams: Arc<StreamSet>,
        suite: Arc<dyn CipherSuite>,
        config: Config,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let conn = BufferedConn::new(conn, &config, cancel.clone());
        let mut transitions: HashMap<String, Vec<Transition>> = HashMap::new();
        for transition in doc.transitions() {
            transitions.entry(transition.source.clone()).or_default().push(transition.clone());
        }

        let mut fsm = Self {
            host: host.into(),
            party,
            config,
            conn,
            streams,
            ciphers: CipherCache::new(suite),
            listeners: Vec::new(),
            transitions,
            state: STATE_START.to_string(),
            step_n: 0,
            instance_id: 0,
            prng: None,
            vars: HashMap::new(),
            guards: HashMap::new(),
            cancel,
            doc,
        };
        if fsm.party == fsm.doc.first_sender() {
            let id = rand::rng().random_range(1..=i32::MAX as u32);
            fsm.instance_id = id;
            fsm.prng = Some(ChaCha20Rng::seed_from_u64(u64::from(id)));
        }
        fsm
    }

    /// Document identifier shared with the peer.
    #[must_use]
    pub fn uuid(&self) -> u32 {
        self.doc.uuid()
    }

    /// Session nonce seeding transition selection; 0 until learned.
    #[must_use]
    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    /// Installs a new instance id. The selection PRNG is dropped so the
    /// next step reseeds from the id and replays the selection history.
    pub fn set_instance_id(&mut self, id: u32) {
        self.instance_id = id;
        self.prng = None;
    }

    /// Which side of the session this machine plays.
    #[must_use]
    pub fn party(&self) -> Party {
        self.party
    }

    /// Host this machine was bound to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Resolves the document port, consulting session vars for named
    /// ports.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        match self.doc.port() {
            PortSpec::Number(port) => Some(*port),
            PortSpec::Named(name) => match self.vars.get(name) {
                Some(Value::Int(n)) => u16::try_from(*n).ok(),
                Some(Value::Str(s)) => s.parse().ok(),
                _ => None,
            },
        }
    }

    /// Current state name.
    #[must_use]
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Successful transitions since construction. Retained across resets
    /// so a late-seeded PRNG can replay the full selection history.
    #[must_use]
    pub fn step_n(&self) -> u64 {
        self.step_n
    }

    /// True once the cycle has completed.
    #[must_use]
    pub fn dead(&self) -> bool {
        self.state == STATE_DEAD
    }

    /// The buffered connection actions read from and write to.
    pub fn conn(&mut self) -> &mut BufferedConn {
        &mut self.conn
    }

    /// The stream set multiplexed over this machine.
    #[must_use]
    pub fn stream_set(&self) -> &StreamSet {
        &self.streams
    }

    /// Returns the cipher for `(regex, msg_len)`, opening it on first use.
    /// Cached ciphers live until [`Fsm::reset`].
    pub fn cipher(&mut self, regex: &str, msg_len: usize) -> Result<Arc<dyn Cipher>> {
        self.ciphers.get(regex, msg_len)
    }

    /// Reads a session var. Reserved keys expose machine identity.
    #[must_use]
    pub fn var(&self, key: &str) -> Option<Value> {
        match key {
            "model_instance_id" => Some(Value::Int(i64::from(self.instance_id))),
            "model_uuid" => Some(Value::Int(i64::from(self.uuid()))),
            "party" => Some(Value::Str(self.party.to_string())),
            _ => self.vars.get(key).cloned(),
        }
    }

    /// Stores a session var. Vars are cleared on reset.
    pub fn set_var(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    /// Runs the machine until it reaches the terminal state, pausing and
    /// retrying whenever no transition is currently available.
    ///
    /// # Errors
    ///
    /// Fatal errors, including cancellation, abort the cycle and surface
    /// to the driver.
    pub async fn execute(&mut self) -> Result<()> {
        self.reset();
        while !self.dead() {
            match self.next().await {
                Ok(()) => {},
                Err(Error::NoTransition) => {
                    tracing::debug!(state = %self.state, "no transition available, waiting");
                    let mut cancel = self.cancel.clone();
                    tokio::select! {
                        () = tokio::time::sleep(self.config.transition_retry) => {},
                        _ = cancel.changed() => return Err(Error::Cancelled),
                    }
                },
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    /// Attempts one step. On success the state advances and the step
    /// counter grows.
    ///
    /// # Errors
    ///
    /// `NoTransition` when every candidate failed to match; fatal errors
    /// otherwise. A retry request from the handshake is absorbed here by
    /// re-running the step with the freshly seeded PRNG.
    pub async fn next(&mut self) -> Result<()> {
        loop {
            self.init_prng().await?;
            match self.advance().await {
                Ok(Some(next_state)) => {
                    self.step_n += 1;
                    tracing::debug!(state = %next_state, step = self.step_n, "transition successful");
                    self.state = next_state;
                    return Ok(());
                },
                Ok(None) => return Err(Error::NoTransition),
                Err(Error::RetryTransition) => {
                    tracing::debug!(state = %self.state, "rerunning step after late seed");
                },
                Err(error) => return Err(error),
            }
        }
    }

    /// Restarts the machine for a new cycle: back to `start`, vars
    /// cleared, ciphers closed, listeners shut down. The instance id, step
    /// counter, and PRNG survive so both peers stay on the same draw
    /// stream across cycles.
    pub fn reset(&mut self) {
        self.state = STATE_START.to_string();
        self.vars.clear();
        self.ciphers.reset();
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
    }

    /// Releases cycle resources and shuts the connection down.
    pub async fn close(&mut self) -> Result<()> {
        self.reset();
        self.conn.close().await
    }

    /// Opens a TCP listener on the machine's host. Bytes read from
    /// accepted sub-connections surface through the connection's peek
    /// buffer. The listener closes on reset.
    ///
    /// # Errors
    ///
    /// Propagates bind failures.
    pub async fn listen(&mut self) -> Result<u16> {
        let listener = TcpListener::bind((self.host.as_str(), 0)).await?;
        let port = listener.local_addr()?.port();
        let ingress = self.conn.ingress_sender();
        tracing::debug!(port, "listener opened");

        self.listeners.push(tokio::spawn(async move {
            loop {
                let Ok((mut sub, _peer)) = listener.accept().await else {
                    return;
                };
                let ingress = ingress.clone();
                tokio::spawn(async move {
                    let mut chunk = vec![0u8; 4096];
                    loop {
                        match sub.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if ingress.send(chunk[..n].to_vec()).is_err() {
                                    return;
                                }
                            },
                        }
                    }
                });
            }
        }));
        Ok(port)
    }

    /// Seeds the selection PRNG once an instance id is known, then replays
    /// the selection history so the draw stream catches up to the current
    /// step. The step counter is not advanced by the replay.
    async fn init_prng(&mut self) -> Result<()> {
        if self.prng.is_some() || self.instance_id == 0 {
            return Ok(());
        }
        tracing::debug!(
            instance_id = self.instance_id,
            steps = self.step_n,
            "seeding selection prng"
        );
        self.prng = Some(ChaCha20Rng::seed_from_u64(u64::from(self.instance_id)));

        self.state = STATE_START.to_string();
        for _ in 0..self.step_n {
            match self.advance().await? {
                Some(next_state) => self.state = next_state,
                None => return Err(Error::NoTransition),
            }
        }
        Ok(())
    }

    /// Tries the ordered transition candidates for the current state.
    /// Returns the destination of the first whose action block matched, or
    /// `None` when none did.
    async fn advance(&mut self) -> Result<Option<String>> {
        let candidates = self.transitions.get(&self.state).cloned().unwrap_or_default();
        let (mut error_transitions, normal): (Vec<Transition>, Vec<Transition>) =
            candidates.into_iter().partition(|t| t.is_error);

        let mut attempts = match self.prng.as_mut() {
            Some(prng) if !normal.is_empty() => vec![weighted_choice(&normal, prng).clone()],
            _ => normal,
        };
        attempts.append(&mut error_transitions);
        tracing::debug!(state = %self.state, candidates = attempts.len(), "evaluating transitions");

        let doc = Arc::clone(&self.doc);
        for transition in &attempts {
            let Some(name) = &transition.action_block else {
                return Ok(Some(transition.destination.clone()));
            };
            let block = doc
                .action_block(name)
                .ok_or_else(|| Error::ActionBlockNotFound(name.clone()))?;
            if self.eval_block(block).await? {
                return Ok(Some(transition.destination.clone()));
            }
        }
        Ok(None)
    }

    /// Evaluates one action block. Actions for the other party are
    /// ignored; a block with no actions left matches trivially. Guarded
    /// actions are skipped unless the buffered bytes match their pattern.
    async fn eval_block(&mut self, block: &ActionBlock) -> Result<bool> {
        let mut evaluated = false;
        for action in &block.actions {
            if !action.party.matches(self.party) {
                continue;
            }
            evaluated = true;
            tracing::debug!(action = %action.name(), "evaluating action");

            if let Some(pattern) = &action.regex {
                let guard = self.guard(pattern)?;
                let buffered = self.conn.peek_any().await?;
                if !guard.is_match(&buffered) {
                    continue;
                }
            }

            let plugin = registry()
                .find(&action.module, &action.method)
                .ok_or_else(|| Error::ActionNotFound(action.name()))?;
            if plugin.eval(self, &action.args).await? {
                return Ok(true);
            }
        }
        Ok(!evaluated)
    }

    /// Compiles a guard pattern, caching it for the machine's lifetime.
    fn guard(&mut self, pattern: &str) -> Result<Regex> {
        if let Some(guard) = self.guards.get(pattern) {
            return Ok(guard.clone());
        }
        let guard = Regex::new(pattern)?;
        self.guards.insert(pattern.to_string(), guard.clone());
        Ok(guard)
    }
}

/// Weighted draw over the non-error candidates: `u ~ uniform(0, sum)`,
/// first transition whose cumulative weight reaches `u` wins, ties and a
/// zero total falling back to document order.
fn weighted_choice<'a>(candidates: &'a [Transition], prng: &mut ChaCha20Rng) -> &'a Transition {
    let total: f64 = candidates.iter().map(|t| t.probability).sum();
    if total <= 0.0 {
        return &candidates[0];
    }
    let draw = prng.random_range(0.0..total);
    let mut cumulative = 0.0;
    for transition in candidates {
        cumulative += transition.probability;
        if cumulative >= draw {
            return transition;
        }
    }
    &candidates[candidates.len() - 1]
}

#[cfg(test)]
mod tests {
    use marionette_proto::Transport;
    use tokio::sync::watch;

    use super::*;

    struct NoSuite;

    impl CipherSuite for NoSuite {
        fn open(&self, _regex: &str, _msg_len: usize) -> Result<Arc<dyn Cipher>> {
            Err(Error::Cipher("no cipher in this test".into()))
        }
    }

    fn null_transition(source: &str, destination: &str, probability: f64) -> Transition {
        Transition {
            source: source.into(),
            destination: destination.into(),
            action_block: None,
            probability,
            is_error: false,
        }
    }

    fn machine(doc: Document, party: Party) -> Fsm {
        let (conn, _peer) = tokio::io::duplex(1024);
        let (_tx, rx) = watch::channel(false);
        Fsm::new(
            Arc::new(doc),
            "127.0.0.1",
            party,
            Box::new(conn),
            Arc::new(StreamSet::new()),
            Arc::new(NoSuite),
            Config::default(),
            rx,
        )
    }

    fn branchy_doc() -> Document {
        Document::new(
            Transport::Tcp,
            PortSpec::Number(8081),
            vec![
                null_transition("start", "a", 0.6),
                null_transition("start", "b", 0.4),
                null_transition("a", "c", 0.5),
                null_transition("a", "dead", 0.5),
                null_transition("b", "c", 1.0),
                null_transition("c", "dead", 0.7),
                null_transition("c", "a", 0.3),
            ],
            Vec::new(),
        )
    }

    async fn walk_to_dead(fsm: &mut Fsm) -> Vec<String> {
        let mut path = Vec::new();
        for _ in 0..10_000 {
            if fsm.dead() {
                return path;
            }
            fsm.next().await.unwrap();
            path.push(fsm.state().to_string());
        }
        panic!("machine never reached dead");
    }

    #[tokio::test]
    async fn null_walk_reaches_dead() {
        let doc = Document::new(
            Transport::Tcp,
            PortSpec::Number(8081),
            vec![null_transition("start", "mid", 1.0), null_transition("mid", "dead", 1.0)],
            Vec::new(),
        );
        let mut fsm = machine(doc, Party::Client);

        fsm.next().await.unwrap();
        assert_eq!(fsm.state(), "mid");
        fsm.next().await.unwrap();
        assert!(fsm.dead());
        assert_eq!(fsm.step_n(), 2);
    }

    #[tokio::test]
    async fn identical_seeds_walk_identical_paths() {
        let mut first = machine(branchy_doc(), Party::Client);
        let mut second = machine(branchy_doc(), Party::Client);
        first.set_instance_id(7777);
        second.set_instance_id(7777);

        assert_eq!(walk_to_dead(&mut first).await, walk_to_dead(&mut second).await);
    }

    #[tokio::test]
    async fn late_seed_replays_history() {
        // Unseeded walk first, then adopt a seed mid-session the way a
        // receiver does after its first decrypted cell.
        let doc = Document::new(
            Transport::Tcp,
            PortSpec::Number(8081),
            vec![null_transition("start", "mid", 1.0), null_transition("mid", "dead", 1.0)],
            Vec::new(),
        );
        let mut fsm = machine(doc, Party::Server);
        assert_eq!(fsm.instance_id(), 0);

        fsm.next().await.unwrap();
        assert_eq!(fsm.state(), "mid");

        fsm.set_instance_id(4242);
        fsm.next().await.unwrap();
        assert!(fsm.dead());
        assert_eq!(fsm.step_n(), 2);
    }

    #[tokio::test]
    async fn dead_end_state_reports_no_transition() {
        let doc = Document::new(
            Transport::Tcp,
            PortSpec::Number(8081),
            vec![null_transition("start", "island", 1.0)],
            Vec::new(),
        );
        let mut fsm = machine(doc, Party::Client);
        fsm.next().await.unwrap();

        let result = fsm.next().await;
        assert!(matches!(result, Err(Error::NoTransition)));
    }

    #[tokio::test]
    async fn reset_preserves_handshake_state() {
        let mut fsm = machine(branchy_doc(), Party::Client);
        fsm.set_instance_id(99);
        fsm.next().await.unwrap();
        fsm.set_var("greeting", Value::Str("hi".into()));

        let steps = fsm.step_n();
        fsm.reset();
        assert_eq!(fsm.state(), STATE_START);
        assert_eq!(fsm.instance_id(), 99);
        assert_eq!(fsm.step_n(), steps);
        assert_eq!(fsm.var("greeting"), None);
    }

    #[tokio::test]
    async fn reserved_vars_expose_identity() {
        let mut fsm = machine(branchy_doc(), Party::Client);
        fsm.set_instance_id(55);

        assert_eq!(fsm.var("model_instance_id"), Some(Value::Int(55)));
        assert_eq!(fsm.var("model_uuid"), Some(Value::Int(i64::from(fsm.uuid()))));
        assert_eq!(fsm.var("party"), Some(Value::Str("client".into())));
    }

    #[tokio::test]
    async fn named_port_resolves_through_vars() {
        let doc = Document::new(
            Transport::Tcp,
            PortSpec::Named("ftp_port".into()),
            vec![null_transition("start", "dead", 1.0)],
            Vec::new(),
        );
        let mut fsm = machine(doc, Party::Client);
        assert_eq!(fsm.port(), None);

        fsm.set_var("ftp_port", Value::Int(2121));
        assert_eq!(fsm.port(), Some(2121));
    }

    #[test]
    fn weighted_choice_is_deterministic() {
        let candidates =
            vec![null_transition("s", "a", 0.25), null_transition("s", "b", 0.75)];
        let picks = |seed: u64| -> Vec<String> {
            let mut prng = ChaCha20Rng::seed_from_u64(seed);
            (0..32).map(|_| weighted_choice(&candidates, &mut prng).destination.clone()).collect()
        };

        assert_eq!(picks(1), picks(1));
        assert!(picks(1).iter().any(|d| d == "a") || picks(1).iter().any(|d| d == "b"));
    }

    #[test]
    fn zero_weights_fall_back_to_document_order() {
        let candidates = vec![null_transition("s", "a", 0.0), null_transition("s", "b", 0.0)];
        let mut prng = ChaCha20Rng::seed_from_u64(0);
        assert_eq!(weighted_choice(&candidates, &mut prng).destination, "a");
    }
}
