//! Server-side driver.
//!
//! The `Acceptor` listens on the document's transport port and drives one
//! machine per accepted connection, each on its own task. All machines
//! share the acceptor's [`StreamSet`], so remote-initiated streams from
//! any connection surface through [`StreamSet::accept`].

use std::net::SocketAddr;
use std::sync::Arc;

use marionette_proto::{Document, Party, PortSpec, Transport};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::cipher::CipherSuite;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fsm::Fsm;
use crate::stream::StreamSet;

/// Server-side connection driver.
pub struct Acceptor {
    doc: Arc<Document>,
    host: String,
    streams: Arc<StreamSet>,
    suite: Arc<dyn CipherSuite>,
    config: Config,
    listener: TcpListener,
    cancel: watch::Sender<bool>,
}

impl Acceptor {
    /// Binds the document's port on `host`.
    ///
    /// # Errors
    ///
    /// Rejects non-TCP documents and unresolved named ports; bind failures
    /// propagate unchanged.
    pub async fn bind(
        doc: Arc<Document>,
        host: impl Into<String>,
        streams: Arc<StreamSet>,
        suite: Arc<dyn CipherSuite>,
        config: Config,
    ) -> Result<Self> {
        if doc.transport() != Transport::Tcp {
            return Err(Error::InvalidDocument(format!(
                "cannot accept {} documents",
                doc.transport()
            )));
        }
        let port = match doc.port() {
            PortSpec::Number(port) => *port,
            PortSpec::Named(name) => {
                return Err(Error::InvalidDocument(format!("cannot bind named port {name:?}")));
            },
        };
        let host = host.into();
        let listener = TcpListener::bind((host.as_str(), port)).await?;
        let (cancel, _) = watch::channel(false);
        Ok(Self { doc, host, streams, suite, config, listener, cancel })
    }

    /// Address the acceptor is listening on.
    ///
    /// # Errors
    ///
    /// Propagates socket introspection failures.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until [`Acceptor::close`], driving one machine
    /// per connection.
    ///
    /// # Errors
    ///
    /// Returns accept failures; per-connection machine errors only end
    /// that connection's task.
    pub async fn serve(&self) -> Result<()> {
        let mut cancel = self.cancel.subscribe();
        if *cancel.borrow() {
            return Ok(());
        }
        loop {
            let accepted = tokio::select! {
                _ = cancel.changed() => return Ok(()),
                accepted = self.listener.accept() => accepted,
            };
            let (conn, peer) = accepted?;
            tracing::debug!(%peer, "accepted connection");

            let mut fsm = Fsm::new(
                Arc::clone(&self.doc),
                self.host.clone(),
                Party::Server,
                Box::new(conn),
                Arc::clone(&self.streams),
                Arc::clone(&self.suite),
                self.config.clone(),
                self.cancel.subscribe(),
            );
            tokio::spawn(async move {
                loop {
                    match fsm.execute().await {
                        Ok(()) => {},
                        Err(Error::StreamClosed) => continue,
                        Err(error) => {
                            tracing::debug!(%error, "acceptor: machine terminated");
                            break;
                        },
                    }
                }
                if let Err(error) = fsm.close().await {
                    tracing::debug!(%error, "acceptor: close failed");
                }
            });
        }
    }

    /// Signals shutdown to the accept loop and every machine it spawned.
    pub fn close(&self) {
        self.cancel.send_replace(true);
    }
}
