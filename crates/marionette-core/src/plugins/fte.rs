//! Cell transfer through the format-transforming channel.
//!
//! `fte.send` dequeues the next outbound cell across all streams, stamps
//! the machine's identity into it, and writes one encrypted message. With
//! no stream data pending it sends an empty control cell instead, so the
//! channel keeps its shape and the instance id always has a carrier.
//!
//! `fte.recv` peeks at buffered ciphertext and only consumes it after the
//! whole decrypt-unmarshal-deliver chain succeeds; an unmatched buffer
//! leaves the bytes for the next candidate transition.

use async_trait::async_trait;
use marionette_proto::{Cell, Value};

use crate::error::{Error, Result};
use crate::fsm::Fsm;
use crate::plugin::Plugin;

pub(crate) struct Send;

pub(crate) struct Recv {
    pub(crate) blocking: bool,
}

fn cipher_args(name: &str, args: &[Value]) -> Result<(String, usize)> {
    let regex = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidArguments(format!("{name}: regex argument missing")))?;
    let msg_len = args
        .get(1)
        .and_then(Value::as_int)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| Error::InvalidArguments(format!("{name}: msg_len argument missing")))?;
    Ok((regex.to_string(), msg_len))
}

#[async_trait]
impl Plugin for Send {
    async fn eval(&self, fsm: &mut Fsm, args: &[Value]) -> Result<bool> {
        let (regex, msg_len) = cipher_args("fte.send", args)?;
        let cipher = fsm.cipher(&regex, msg_len)?;
        let capacity = cipher.capacity();
        let max_payload = capacity.saturating_sub(Cell::HEADER_LEN);

        let mut cell = match fsm.stream_set().dequeue(max_payload) {
            Some(cell) => cell,
            None => Cell::new(0, 0, Vec::new()),
        };
        let end_of_stream = cell.is_end_of_stream();
        cell.uuid = fsm.uuid();
        cell.instance_id = fsm.instance_id();
        cell.len = cell.len.max(capacity);

        let plaintext = cell.marshal()?;
        let ciphertext = cipher.encrypt(&plaintext)?;
        fsm.conn().write_all(&ciphertext).await?;
        tracing::debug!(stream = cell.stream_id, n = cell.payload.len(), "cell sent");

        if end_of_stream {
            return Err(Error::StreamClosed);
        }
        Ok(true)
    }
}

#[async_trait]
impl Plugin for Recv {
    async fn eval(&self, fsm: &mut Fsm, args: &[Value]) -> Result<bool> {
        let (regex, msg_len) = cipher_args("fte.recv", args)?;
        let ciphertext = if self.blocking {
            fsm.conn().peek_any().await?
        } else {
            fsm.conn().peek_available().await?
        };
        if ciphertext.is_empty() {
            return Ok(false);
        }

        let cipher = fsm.cipher(&regex, msg_len)?;
        let Some((plaintext, consumed)) = cipher.decrypt(&ciphertext)? else {
            return Ok(false);
        };
        let cell = Cell::unmarshal(&plaintext)?;

        if cell.uuid != fsm.uuid() {
            return Err(Error::UuidMismatch { cell: cell.uuid, document: fsm.uuid() });
        }
        if fsm.instance_id() == 0 {
            tracing::debug!(instance_id = cell.instance_id, "instance id adopted");
            fsm.set_instance_id(cell.instance_id);
            // Nothing is consumed: the replayed step re-decrypts this cell
            // with selection now seeded.
            return Err(Error::RetryTransition);
        }
        if cell.instance_id != fsm.instance_id() {
            return Err(Error::InstanceIdMismatch { cell: cell.instance_id, fsm: fsm.instance_id() });
        }

        tracing::debug!(stream = cell.stream_id, n = cell.payload.len(), "cell received");
        if cell.stream_id != 0 {
            fsm.stream_set().enqueue(cell)?;
        }
        fsm.conn().seek_forward(consumed)?;
        Ok(true)
    }
}
