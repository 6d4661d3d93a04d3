//! Logical stream multiplexer riding on the machine channel.
//!
//! Applications see a [`Stream`] as an ordinary byte pipe. Underneath,
//! outbound bytes are chunked into cells sized to the active cipher's
//! capacity, and inbound cells are reassembled in sequence order: a cell
//! arriving ahead of a gap waits in a reorder table until the gap fills.
//!
//! Close is a protocol, not a truncation. Closing locally queues an
//! end-of-stream marker behind any pending data; the peer keeps reading
//! until the marker's sequence number is reached. A stream leaves the set
//! once both directions have closed.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Buf, BytesMut};
use marionette_proto::{Cell, ProtocolError};
use rand::Rng;
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Outbound bytes queued per stream before writers are made to wait.
const WRITE_HIGH_WATER: usize = 1 << 20;

#[derive(Default)]
struct State {
    read_buf: BytesMut,
    reorder: BTreeMap<u32, Vec<u8>>,
    next_seq_in: u32,
    next_seq_out: u32,
    write_queue: BytesMut,
    end_seq: Option<u32>,
    closed_local: bool,
    closed_remote: bool,
    end_sent: bool,
}

struct Shared {
    id: u32,
    state: Mutex<State>,
    readable: Notify,
    writable: Notify,
}

impl Shared {
    fn new(id: u32) -> Self {
        Self { id, state: Mutex::new(State::default()), readable: Notify::new(), writable: Notify::new() }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Application handle to one logical stream.
#[derive(Clone)]
pub struct Stream {
    shared: Arc<Shared>,
}

impl Stream {
    /// Stream identifier carried in every cell.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Reads available bytes into `buf`, blocking while the stream is open
    /// and empty. `Ok(0)` means the peer closed and everything has been
    /// drained.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            // Register before checking, so a notify between the check and
            // the await is not lost.
            notified.as_mut().enable();
            {
                let mut state = self.shared.lock();
                if !state.read_buf.is_empty() {
                    let n = buf.len().min(state.read_buf.len());
                    state.read_buf.copy_to_slice(&mut buf[..n]);
                    return Ok(n);
                }
                if state.closed_remote {
                    return Ok(0);
                }
            }
            notified.await;
        }
    }

    /// Queues bytes for cellization, waiting when the outbound queue is
    /// over its high-water mark.
    ///
    /// # Errors
    ///
    /// Fails once the stream has been locally closed.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        loop {
            let notified = self.shared.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.lock();
                if state.closed_local {
                    return Err(Error::StreamClosed);
                }
                if state.write_queue.len() < WRITE_HIGH_WATER {
                    state.write_queue.extend_from_slice(data);
                    return Ok(data.len());
                }
            }
            notified.await;
        }
    }

    /// Initiates close. Queued bytes and the end marker still drain to the
    /// peer, and remotely-sent bytes remain readable.
    pub fn close(&self) {
        {
            let mut state = self.shared.lock();
            state.closed_local = true;
        }
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
    }
}

struct SetInner {
    streams: HashMap<u32, Arc<Shared>>,
    order: VecDeque<u32>,
    pending: VecDeque<Arc<Shared>>,
}

/// Owner of all streams multiplexed over one machine channel.
pub struct StreamSet {
    inner: Mutex<SetInner>,
    incoming: Notify,
}

impl StreamSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SetInner {
                streams: HashMap::new(),
                order: VecDeque::new(),
                pending: VecDeque::new(),
            }),
            incoming: Notify::new(),
        }
    }

    /// Number of live streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().streams.len()
    }

    /// True when no stream is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Opens a locally-initiated stream under a fresh random nonzero id.
    pub fn create(&self) -> Stream {
        let mut inner = self.lock();
        let mut rng = rand::rng();
        let id = loop {
            let id: u32 = rng.random();
            if id != 0 && !inner.streams.contains_key(&id) {
                break id;
            }
        };
        let shared = Arc::new(Shared::new(id));
        inner.streams.insert(id, Arc::clone(&shared));
        inner.order.push_back(id);
        Stream { shared }
    }

    /// Waits for the next remote-initiated stream.
    pub async fn accept(&self) -> Stream {
        loop {
            let notified = self.incoming.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(shared) = self.lock().pending.pop_front() {
                return Stream { shared };
            }
            notified.await;
        }
    }

    /// Delivers an inbound cell into its stream's reorder table, draining
    /// any prefix now contiguous into the read buffer.
    ///
    /// # Errors
    ///
    /// Rejects cells addressed to the reserved stream id 0.
    pub fn enqueue(&self, cell: Cell) -> Result<()> {
        if cell.stream_id == 0 {
            return Err(Error::Protocol(ProtocolError::ReservedStreamId));
        }

        let (shared, announce) = {
            let mut inner = self.lock();
            match inner.streams.get(&cell.stream_id) {
                Some(shared) => (Arc::clone(shared), false),
                None => {
                    let shared = Arc::new(Shared::new(cell.stream_id));
                    inner.streams.insert(cell.stream_id, Arc::clone(&shared));
                    inner.order.push_back(cell.stream_id);
                    inner.pending.push_back(Arc::clone(&shared));
                    (shared, true)
                },
            }
        };
        if announce {
            self.incoming.notify_waiters();
        }

        let closed_remote = {
            let mut state = shared.lock();
            if cell.payload.is_empty() {
                state.end_seq = Some(cell.sequence_id);
            } else if cell.sequence_id >= state.next_seq_in {
                state.reorder.insert(cell.sequence_id, cell.payload);
            }
            loop {
                if state.end_seq == Some(state.next_seq_in) {
                    state.closed_remote = true;
                    break;
                }
                let next_seq_in = state.next_seq_in;
                match state.reorder.remove(&next_seq_in) {
                    Some(payload) => {
                        state.read_buf.extend_from_slice(&payload);
                        state.next_seq_in += 1;
                    },
                    None => break,
                }
            }
            state.closed_remote
        };

        shared.readable.notify_waiters();
        if closed_remote {
            self.remove_if_done(cell.stream_id);
        }
        Ok(())
    }

    /// Produces the next outbound cell, visiting streams round-robin so no
    /// stream starves the channel. Payloads are capped at `max_payload`.
    /// `None` means no stream has anything to send.
    pub fn dequeue(&self, max_payload: usize) -> Option<Cell> {
        let mut inner = self.lock();
        for _ in 0..inner.order.len() {
            let id = inner.order.pop_front()?;
            let Some(shared) = inner.streams.get(&id).map(Arc::clone) else {
                continue;
            };

            let mut state = shared.lock();
            if !state.write_queue.is_empty() && max_payload > 0 {
                let take = state.write_queue.len().min(max_payload);
                let payload = state.write_queue.split_to(take).to_vec();
                let seq = state.next_seq_out;
                state.next_seq_out += 1;
                drop(state);
                inner.order.push_back(id);
                shared.writable.notify_waiters();
                return Some(Cell::new(id, seq, payload));
            }
            if state.closed_local && !state.end_sent {
                state.end_sent = true;
                let seq = state.next_seq_out;
                state.next_seq_out += 1;
                let done = state.closed_remote;
                drop(state);
                if done {
                    inner.streams.remove(&id);
                } else {
                    inner.order.push_back(id);
                }
                return Some(Cell::new(id, seq, Vec::new()));
            }
            drop(state);
            inner.order.push_back(id);
        }
        None
    }

    fn remove_if_done(&self, id: u32) {
        let mut inner = self.lock();
        let done = inner
            .streams
            .get(&id)
            .is_some_and(|shared| {
                let state = shared.lock();
                state.end_sent && state.closed_remote
            });
        if done {
            inner.streams.remove(&id);
            inner.order.retain(|&other| other != id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SetInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for StreamSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_cell(stream_id: u32, seq: u32, payload: &[u8]) -> Cell {
        Cell::new(stream_id, seq, payload.to_vec())
    }

    #[tokio::test]
    async fn contiguous_cells_surface_in_order() {
        let set = StreamSet::new();
        set.enqueue(data_cell(9, 0, b"ab")).unwrap();
        set.enqueue(data_cell(9, 1, b"cd")).unwrap();

        let stream = set.accept().await;
        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
    }

    #[tokio::test]
    async fn out_of_order_cells_wait_for_the_gap() {
        let set = StreamSet::new();
        set.enqueue(data_cell(9, 2, b"c")).unwrap();
        set.enqueue(data_cell(9, 1, b"b")).unwrap();
        let stream = set.accept().await;
        {
            let state = stream.shared.lock();
            assert!(state.read_buf.is_empty());
        }

        set.enqueue(data_cell(9, 0, b"a")).unwrap();
        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");
    }

    #[tokio::test]
    async fn end_marker_closes_after_drain() {
        let set = StreamSet::new();
        set.enqueue(data_cell(9, 0, b"tail")).unwrap();
        set.enqueue(data_cell(9, 1, b"")).unwrap();

        let stream = set.accept().await;
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 4);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn early_end_marker_waits_for_data() {
        let set = StreamSet::new();
        set.enqueue(data_cell(9, 1, b"")).unwrap();
        set.enqueue(data_cell(9, 0, b"x")).unwrap();

        let stream = set.accept().await;
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 1);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[test]
    fn reserved_stream_id_is_rejected() {
        let set = StreamSet::new();
        let result = set.enqueue(data_cell(0, 0, b"x"));
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::ReservedStreamId))
        ));
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn dequeue_round_robins_across_streams() {
        let set = StreamSet::new();
        let a = set.create();
        let b = set.create();
        a.write(b"aaaa").await.unwrap();
        b.write(b"bbbb").await.unwrap();

        let first = set.dequeue(2).unwrap();
        let second = set.dequeue(2).unwrap();
        let third = set.dequeue(2).unwrap();
        let fourth = set.dequeue(2).unwrap();

        assert_ne!(first.stream_id, second.stream_id);
        assert_eq!(first.stream_id, third.stream_id);
        assert_eq!(second.stream_id, fourth.stream_id);
        assert!(set.dequeue(2).is_none());
    }

    #[tokio::test]
    async fn sequence_ids_are_dense_per_stream() {
        let set = StreamSet::new();
        let stream = set.create();
        stream.write(b"abcdef").await.unwrap();

        let first = set.dequeue(4).unwrap();
        let second = set.dequeue(4).unwrap();
        assert_eq!(first.sequence_id, 0);
        assert_eq!(second.sequence_id, 1);
        assert_eq!(first.payload, b"abcd");
        assert_eq!(second.payload, b"ef");
    }

    #[tokio::test]
    async fn close_queues_end_marker_behind_data() {
        let set = StreamSet::new();
        let stream = set.create();
        stream.write(b"last").await.unwrap();
        stream.close();

        let data = set.dequeue(64).unwrap();
        assert_eq!(data.payload, b"last");
        let marker = set.dequeue(64).unwrap();
        assert!(marker.is_end_of_stream());
        assert_eq!(marker.sequence_id, data.sequence_id + 1);
        assert!(set.dequeue(64).is_none());

        let result = stream.write(b"more").await;
        assert!(matches!(result, Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn fully_closed_stream_leaves_the_set() {
        let set = StreamSet::new();
        let stream = set.create();
        stream.close();

        assert!(set.dequeue(64).unwrap().is_end_of_stream());
        assert_eq!(set.len(), 1);

        set.enqueue(data_cell(stream.id(), 0, b"")).unwrap();
        assert!(set.is_empty());
    }
}
