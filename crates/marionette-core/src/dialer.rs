//! Client-side driver.
//!
//! A `Dialer` owns one transport connection and the machine running over
//! it. A background driver task executes the machine to completion and
//! recycles it for the next cycle, so one long-lived connection can carry
//! any number of shaped cycles. Applications receive logical streams from
//! [`Dialer::dial`]; the shared [`StreamSet`] moves their bytes during the
//! driver's cycles.

use std::sync::{Arc, PoisonError, RwLock};

use marionette_proto::{Document, Party, PortSpec, Transport};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cipher::CipherSuite;
use crate::config::Config;
use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::fsm::Fsm;
use crate::net::UdpConn;
use crate::stream::{Stream, StreamSet};

/// Client-side connection driver.
pub struct Dialer {
    doc: Arc<Document>,
    addr: String,
    streams: Arc<StreamSet>,
    suite: Arc<dyn CipherSuite>,
    config: Config,
    closed: Arc<RwLock<bool>>,
    cancel: watch::Sender<bool>,
    driver: Option<JoinHandle<()>>,
}

impl Dialer {
    /// Creates a dialer for `doc` targeting `addr`. Nothing connects until
    /// [`Dialer::open`].
    pub fn new(
        doc: Arc<Document>,
        addr: impl Into<String>,
        streams: Arc<StreamSet>,
        suite: Arc<dyn CipherSuite>,
        config: Config,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            doc,
            addr: addr.into(),
            streams,
            suite,
            config,
            closed: Arc::new(RwLock::new(false)),
            cancel,
            driver: None,
        }
    }

    /// Opens the transport connection and starts the driver task.
    ///
    /// # Errors
    ///
    /// Propagates connect failures unchanged; rejects documents whose port
    /// cannot be resolved at dial time.
    pub async fn open(&mut self) -> Result<()> {
        let port = match self.doc.port() {
            PortSpec::Number(port) => *port,
            PortSpec::Named(name) => {
                return Err(Error::InvalidDocument(format!("cannot dial named port {name:?}")));
            },
        };
        let target = format!("{}:{}", self.addr, port);
        let conn: Box<dyn Conn> = match self.doc.transport() {
            Transport::Tcp => Box::new(TcpStream::connect(&target).await?),
            Transport::Udp => Box::new(UdpConn::connect(&target).await?),
        };

        let mut fsm = Fsm::new(
            Arc::clone(&self.doc),
            self.addr.clone(),
            Party::Client,
            conn,
            Arc::clone(&self.streams),
            Arc::clone(&self.suite),
            self.config.clone(),
            self.cancel.subscribe(),
        );
        let closed = Arc::clone(&self.closed);
        self.driver = Some(tokio::spawn(async move {
            loop {
                if *closed.read().unwrap_or_else(PoisonError::into_inner) {
                    break;
                }
                match fsm.execute().await {
                    Ok(()) => {},
                    Err(Error::StreamClosed) => continue,
                    Err(error) => {
                        tracing::debug!(%error, "dialer: machine terminated");
                        break;
                    },
                }
            }
            if let Err(error) = fsm.close().await {
                tracing::debug!(%error, "dialer: close failed");
            }
        }));
        Ok(())
    }

    /// True once [`Dialer::close`] has been called.
    #[must_use]
    pub fn closed(&self) -> bool {
        *self.closed.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands out a fresh logical stream riding on this dialer.
    ///
    /// # Errors
    ///
    /// Fails once the dialer has been closed.
    pub fn dial(&self) -> Result<Stream> {
        if self.closed() {
            return Err(Error::DialerClosed);
        }
        Ok(self.streams.create())
    }

    /// Marks the dialer closed, cancels the driver, and waits for it to
    /// release the connection.
    pub async fn close(&mut self) -> Result<()> {
        *self.closed.write().unwrap_or_else(PoisonError::into_inner) = true;
        self.cancel.send_replace(true);
        if let Some(driver) = self.driver.take() {
            if let Err(error) = driver.await {
                if !error.is_cancelled() {
                    tracing::debug!(%error, "dialer: driver join failed");
                }
            }
        }
        Ok(())
    }
}
