//! FIFO point-to-point channels shared by every loopback worker.
//!
//! A channel is identified by the group it belongs to and both endpoints'
//! `(rank, local device)`. Sends never block; a receive waits until its
//! channel has a payload.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub group: String,
    pub src_rank: usize,
    pub src_device: usize,
    pub dst_rank: usize,
    pub dst_device: usize,
}

#[derive(Debug, Default)]
pub struct Fabric {
    channels: Mutex<HashMap<ChannelKey, VecDeque<Vec<u8>>>>,
    notify: Notify,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, key: ChannelKey, payload: Vec<u8>) {
        trace!(?key, bytes = payload.len(), "fabric send");
        self.lock().entry(key).or_default().push_back(payload);
        self.notify.notify_waiters();
    }

    pub fn try_recv(&self, key: &ChannelKey) -> Option<Vec<u8>> {
        self.lock().get_mut(key).and_then(VecDeque::pop_front)
    }

    pub async fn recv(&self, key: &ChannelKey) -> Vec<u8> {
        loop {
            // Registered before the check so a send in between is not missed.
            let notified = self.notify.notified();
            if let Some(payload) = self.try_recv(key) {
                trace!(?key, bytes = payload.len(), "fabric recv");
                return payload;
            }
            notified.await;
        }
    }

    /// Payloads sent but not yet received, over all channels.
    pub fn pending(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }

    /// Drop every undelivered payload of `group`.
    pub fn close_group(&self, group: &str) {
        self.lock().retain(|key, _| key.group != group);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelKey, VecDeque<Vec<u8>>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(src_device: usize) -> ChannelKey {
        ChannelKey { group: "g".into(), src_rank: 0, src_device, dst_rank: 1, dst_device: 0 }
    }

    #[tokio::test]
    async fn payloads_arrive_in_order() {
        let fabric = Fabric::new();
        fabric.send(key(0), vec![1]);
        fabric.send(key(0), vec![2]);
        assert_eq!(fabric.recv(&key(0)).await, vec![1]);
        assert_eq!(fabric.recv(&key(0)).await, vec![2]);
        assert_eq!(fabric.pending(), 0);
    }

    #[tokio::test]
    async fn channels_are_independent() {
        let fabric = Fabric::new();
        fabric.send(key(1), vec![9]);
        assert!(fabric.try_recv(&key(0)).is_none());
        assert_eq!(fabric.try_recv(&key(1)), Some(vec![9]));
    }

    #[tokio::test]
    async fn receiver_waits_for_late_sender() {
        let fabric = Arc::new(Fabric::new());
        let receiver = {
            let fabric = fabric.clone();
            tokio::spawn(async move { fabric.recv(&key(0)).await })
        };
        tokio::task::yield_now().await;
        fabric.send(key(0), vec![7, 7]);
        assert_eq!(receiver.await.unwrap(), vec![7, 7]);
    }

    #[test]
    fn closing_a_group_drops_its_payloads() {
        let fabric = Fabric::new();
        fabric.send(key(0), vec![1]);
        fabric.send(ChannelKey { group: "other".into(), ..key(0) }, vec![2]);
        fabric.close_group("g");
        assert_eq!(fabric.pending(), 1);
    }
}
