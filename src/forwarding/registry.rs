//! Channel Registry
//!
//! The live (channel, socket) pairs of one tunnel. Removal is swap-with-last,
//! so pair order is not stable across removals. `high_water` is the largest
//! number of pairs held at once since the last [`ChannelRegistry::close_all`].

use std::io;

use bytes::Bytes;
use tracing::debug;

use super::local_socket::NonBlockingWrite;
use crate::ssh::ChannelLink;

/// Channel bytes not yet written to the local socket
#[derive(Debug)]
pub struct PendingBuffer {
    data: Bytes,
    offset: usize,
}

impl PendingBuffer {
    pub fn new(data: Bytes) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn advance(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.data.len());
    }
}

/// How a flush ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Everything written; the buffer is gone
    Drained,
    /// Socket full; the rest stays pending
    Blocked,
    /// Socket closed or failed
    Failed,
}

/// Write as much of `pending` as the socket takes.
pub fn flush_pending<S: NonBlockingWrite>(
    socket: &mut S,
    pending: &mut Option<PendingBuffer>,
) -> FlushOutcome {
    let Some(buffer) = pending.as_mut() else {
        return FlushOutcome::Drained;
    };

    while !buffer.is_empty() {
        match socket.try_write(buffer.remaining()) {
            Ok(0) => return FlushOutcome::Failed,
            Ok(n) => buffer.advance(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return FlushOutcome::Blocked,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return FlushOutcome::Failed,
        }
    }

    *pending = None;
    FlushOutcome::Drained
}

/// An SSH channel bound to one local socket
#[derive(Debug)]
pub struct Pair<S> {
    pub channel: ChannelLink,
    pub socket: S,
    pub pending: Option<PendingBuffer>,
}

impl<S> Pair<S> {
    pub fn new(channel: ChannelLink, socket: S) -> Self {
        Self {
            channel,
            socket,
            pending: None,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.as_ref().map_or(0, PendingBuffer::len)
    }
}

#[derive(Debug)]
pub struct ChannelRegistry<S> {
    pairs: Vec<Pair<S>>,
    high_water: usize,
}

impl<S> Default for ChannelRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ChannelRegistry<S> {
    pub fn new() -> Self {
        Self {
            pairs: Vec::new(),
            high_water: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn add(&mut self, channel: ChannelLink, socket: S) {
        self.pairs.push(Pair::new(channel, socket));
        self.high_water = self.high_water.max(self.pairs.len());
        debug!(
            "Registered channel pair ({} live, high water {})",
            self.pairs.len(),
            self.high_water
        );
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Pair<S>> {
        self.pairs.get_mut(index)
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Pair<S>> {
        self.pairs.iter_mut()
    }

    /// Close pair `index` and move the last pair into its slot.
    pub fn remove(&mut self, index: usize) {
        if index >= self.pairs.len() {
            return;
        }
        let pair = self.pairs.swap_remove(index);
        pair.channel.close();
        debug!(
            "Removed channel {} ({} pending bytes dropped, {} live)",
            pair.channel.id(),
            pair.pending_len(),
            self.pairs.len()
        );
    }

    /// Bytes read from channels and not yet delivered locally
    pub fn pending_bytes(&self) -> usize {
        self.pairs.iter().map(Pair::pending_len).sum()
    }

    /// Close every pair and reset the high-water mark.
    pub fn close_all(&mut self) {
        for pair in self.pairs.drain(..) {
            pair.channel.close();
        }
        self.high_water = 0;
    }
}
