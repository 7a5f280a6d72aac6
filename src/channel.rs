//! The bounded, poison-terminated queue pair connecting two adjacent nodes.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::buffer::Buffer;
use crate::error::{Error, Result};

enum Slot {
    Data(Buffer),
    Poison,
}

/// Connects one or more producers to a single consumer with a pair of
/// bounded queues: a `full` queue carrying filled buffers downstream and an
/// `empty` queue recycling drained buffers back upstream.
///
/// The producer side is `fetch_output`/`release_output`; the consumer side
/// is `fetch_input`/`release_input`. At setup the scheduler seeds the
/// `empty` queue directly with freshly allocated buffers via
/// [`Channel::insert`] so the first `fetch_output` has something to fill
/// without waiting on a consumer that hasn't produced anything yet.
///
/// Shutdown is cooperative and reference-counted: a channel expects exactly
/// one [`Channel::finish`] call per attached producer (one by default;
/// [`Channel::reference`] raises that count for a node with more than one
/// predecessor). Every `finish` pushes one poison marker; `fetch_input`
/// absorbs poison markers internally and only reports end-of-stream to its
/// caller once it has absorbed one from every producer.
pub struct Channel {
    full: (Sender<Slot>, Receiver<Slot>),
    empty: (Sender<Slot>, Receiver<Slot>),
    expected_producers: AtomicUsize,
    absorbed: AtomicUsize,
}

impl Channel {
    /// Creates a channel whose queues each hold up to `capacity` buffers.
    pub fn new(capacity: usize) -> Channel {
        Channel {
            full: bounded(capacity.max(1)),
            empty: bounded(capacity.max(1)),
            expected_producers: AtomicUsize::new(1),
            absorbed: AtomicUsize::new(0),
        }
    }

    /// Seeds the `empty` queue with a freshly allocated buffer. Called by
    /// the scheduler during setup, never by a worker.
    pub fn insert(&self, buf: Buffer) -> Result<()> {
        self.empty.0.send(Slot::Data(buf)).map_err(|_| Error::ChannelDisconnected)
    }

    /// Registers an additional producer. Called once per predecessor edge
    /// beyond the first when a node has more than one.
    pub fn reference(&self) {
        self.expected_producers.fetch_add(1, Ordering::SeqCst);
    }

    /// Producer side: blocks for a recycled buffer to fill.
    pub fn fetch_output(&self) -> Result<Buffer> {
        match self.empty.1.recv()? {
            Slot::Data(buf) => Ok(buf),
            Slot::Poison => Err(Error::ChannelDisconnected),
        }
    }

    /// Producer side: delivers a filled buffer downstream.
    pub fn release_output(&self, buf: Buffer) -> Result<()> {
        self.full.0.send(Slot::Data(buf)).map_err(|_| Error::ChannelDisconnected)
    }

    /// Consumer side: blocks for the next filled buffer, or `None` once
    /// every producer has finished.
    pub fn fetch_input(&self) -> Result<Option<Buffer>> {
        loop {
            match self.full.1.recv()? {
                Slot::Data(buf) => return Ok(Some(buf)),
                Slot::Poison => {
                    let absorbed = self.absorbed.fetch_add(1, Ordering::SeqCst) + 1;
                    if absorbed >= self.expected_producers.load(Ordering::SeqCst) {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Consumer side: returns a drained buffer to the producer's pool.
    pub fn release_input(&self, buf: Buffer) -> Result<()> {
        self.empty.0.send(Slot::Data(buf)).map_err(|_| Error::ChannelDisconnected)
    }

    /// Pushes one poison marker onto the `full` queue. Called exactly once
    /// by each producer after it has stopped generating data.
    pub fn finish(&self) -> Result<()> {
        self.full.0.send(Slot::Poison).map_err(|_| Error::ChannelDisconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requisition::Requisition;
    use crate::resources::DeviceContext;
    use std::sync::Arc;
    use ufo_extras::SoftwareResources;

    fn dummy_buffer(context: Arc<dyn DeviceContext>) -> Buffer {
        Buffer::new(Requisition::new(&[2]), context).unwrap()
    }

    #[test]
    fn fetch_output_returns_a_seeded_buffer() {
        let resources = SoftwareResources::new(1);
        let channel = Channel::new(2);
        channel.insert(dummy_buffer(resources.pool().context())).unwrap();
        assert!(channel.fetch_output().is_ok());
    }

    #[test]
    fn full_round_trip_delivers_data_downstream() {
        let resources = SoftwareResources::new(1);
        let channel = Channel::new(2);
        channel.insert(dummy_buffer(resources.pool().context())).unwrap();

        let mut buf = channel.fetch_output().unwrap();
        buf.get_host(None).unwrap()[0] = 42.0;
        channel.release_output(buf).unwrap();

        let mut received = channel.fetch_input().unwrap().expect("data, not poison");
        assert_eq!(received.get_host(None).unwrap()[0], 42.0);
        channel.release_input(received).unwrap();

        // the buffer is back in the empty pool for the producer to reuse
        assert!(channel.fetch_output().is_ok());
    }

    #[test]
    fn single_producer_finish_ends_the_stream_immediately() {
        let channel = Channel::new(2);
        channel.finish().unwrap();
        assert!(channel.fetch_input().unwrap().is_none());
    }

    #[test]
    fn join_channel_waits_for_every_referenced_producer() {
        let channel = Channel::new(2);
        channel.reference(); // two producers feed this channel now
        channel.finish().unwrap();
        channel.finish().unwrap();
        assert!(channel.fetch_input().unwrap().is_none());
    }
}
