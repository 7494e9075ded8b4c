use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;

use crate::broker::job::{ClientId, JobHandle};

/// Events fanned out to clients listening on a job handle.
///
/// Emission order per handle matches delivery order: only the single
/// engine task emits, and only the worker holding the job can trigger
/// mid-run events, so there is no interleaving to defend against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// Progress report (numerator / denominator).
    Status {
        handle: JobHandle,
        numerator: u32,
        denominator: u32,
    },
    /// Intermediate result chunk from the worker.
    Data {
        handle: JobHandle,
        data: Vec<u8>,
    },
    Warning {
        handle: JobHandle,
        message: Vec<u8>,
    },
    /// Worker-side exception payload. Terminal on the worker's side is
    /// still reported separately via `Failed`.
    Exception {
        handle: JobHandle,
        payload: Vec<u8>,
    },
    Complete {
        handle: JobHandle,
        result: Vec<u8>,
    },
    Failed {
        handle: JobHandle,
        reason: String,
    },
}

impl JobEvent {
    pub fn handle(&self) -> &JobHandle {
        match self {
            JobEvent::Status { handle, .. }
            | JobEvent::Data { handle, .. }
            | JobEvent::Warning { handle, .. }
            | JobEvent::Exception { handle, .. }
            | JobEvent::Complete { handle, .. }
            | JobEvent::Failed { handle, .. } => handle,
        }
    }
}

/// Delivers job events to every client listening on a handle.
///
/// Senders are bounded; a client that has fallen `event_channel_capacity`
/// events behind loses the event rather than stalling dispatch for
/// everyone else. Removal of one listener never affects delivery to the
/// rest.
#[derive(Debug, Default)]
pub struct NotificationRouter {
    senders: HashMap<ClientId, mpsc::Sender<JobEvent>>,
    /// Reverse interest map for O(1)-amortized disconnect cleanup:
    /// which handles each client is listed on.
    interests: HashMap<ClientId, HashSet<JobHandle>>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client connection's event channel.
    pub fn attach(&mut self, client: ClientId, sender: mpsc::Sender<JobEvent>) {
        self.senders.insert(client, sender);
    }

    /// Drop a client. Returns the handles it was listening on so the
    /// caller can prune the jobs' listener sets.
    pub fn detach(&mut self, client: ClientId) -> HashSet<JobHandle> {
        self.senders.remove(&client);
        self.interests.remove(&client).unwrap_or_default()
    }

    /// Record that `client` listens on `handle`.
    pub fn register_interest(&mut self, client: ClientId, handle: &JobHandle) {
        self.interests
            .entry(client)
            .or_default()
            .insert(handle.clone());
    }

    /// Forget one handle for every given client (terminal event delivered,
    /// or client wait timed out).
    pub fn clear_interest<'a>(
        &mut self,
        clients: impl IntoIterator<Item = &'a ClientId>,
        handle: &JobHandle,
    ) {
        for client in clients {
            if let Some(handles) = self.interests.get_mut(client) {
                handles.remove(handle);
            }
        }
    }

    /// Fan an event out to the given listeners.
    pub fn notify<'a>(&self, listeners: impl IntoIterator<Item = &'a ClientId>, event: JobEvent) {
        for client in listeners {
            let Some(sender) = self.senders.get(client) else {
                continue;
            };
            if let Err(err) = sender.try_send(event.clone()) {
                tracing::warn!(
                    client = %client,
                    handle = %event.handle(),
                    error = %err,
                    "Dropping job event for lagging or closed client"
                );
            }
        }
    }

    pub fn is_attached(&self, client: ClientId) -> bool {
        self.senders.contains_key(&client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u64) -> JobHandle {
        JobHandle(format!("H:test:{}", n))
    }

    fn status(n: u64, numerator: u32) -> JobEvent {
        JobEvent::Status {
            handle: h(n),
            numerator,
            denominator: 100,
        }
    }

    #[test]
    fn notify_reaches_every_listener() {
        let mut router = NotificationRouter::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        router.attach(ClientId(1), tx1);
        router.attach(ClientId(2), tx2);

        let event = status(1, 50);
        router.notify(&[ClientId(1), ClientId(2)], event.clone());

        assert_eq!(rx1.try_recv().unwrap(), event);
        assert_eq!(rx2.try_recv().unwrap(), event);
    }

    #[test]
    fn detached_client_does_not_block_others() {
        let mut router = NotificationRouter::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        router.attach(ClientId(1), tx1);
        router.attach(ClientId(2), mpsc::channel(4).0);
        router.register_interest(ClientId(2), &h(1));
        router.detach(ClientId(2));

        router.notify(&[ClientId(1), ClientId(2)], status(1, 10));
        assert!(rx1.try_recv().is_ok());
    }

    #[test]
    fn full_channel_drops_event_without_error() {
        let mut router = NotificationRouter::new();
        let (tx, mut rx) = mpsc::channel(1);
        router.attach(ClientId(1), tx);

        router.notify(&[ClientId(1)], status(1, 10));
        router.notify(&[ClientId(1)], status(1, 20));

        assert_eq!(rx.try_recv().unwrap(), status(1, 10));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn detach_returns_interests() {
        let mut router = NotificationRouter::new();
        router.attach(ClientId(1), mpsc::channel(4).0);
        router.register_interest(ClientId(1), &h(1));
        router.register_interest(ClientId(1), &h(2));

        let handles = router.detach(ClientId(1));
        assert_eq!(handles.len(), 2);
        assert!(handles.contains(&h(1)));
    }
}
