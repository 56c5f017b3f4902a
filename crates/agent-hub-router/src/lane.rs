//! Per-session push ordering.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

/// Runs pushes to one session one at a time, in ticket order.
///
/// Tickets are taken under the hub lock in the order messages are
/// recorded; the pushes themselves run after the lock is released.
#[derive(Debug)]
pub struct PushLane {
    issued: AtomicU64,
    serving: watch::Sender<u64>,
}

impl Default for PushLane {
    fn default() -> Self {
        Self {
            issued: AtomicU64::new(0),
            serving: watch::Sender::new(0),
        }
    }
}

impl PushLane {
    /// Next place in line.
    pub fn ticket(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst)
    }

    /// Wait until every earlier ticket is done. Dropping the returned
    /// guard lets the next ticket through.
    pub async fn turn(&self, ticket: u64) -> Turn<'_> {
        let mut serving = self.serving.subscribe();
        // The sender lives in `self`, so this only returns once served.
        let _ = serving.wait_for(|now| *now >= ticket).await;
        Turn { lane: self }
    }
}

/// An active place in a [`PushLane`].
#[derive(Debug)]
pub struct Turn<'a> {
    lane: &'a PushLane,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        self.lane.serving.send_modify(|now| *now += 1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use super::*;

    #[tokio::test]
    async fn test_turns_follow_ticket_order() {
        let lane = Arc::new(PushLane::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let tickets: Vec<u64> = (0..3).map(|_| lane.ticket()).collect();
        assert_eq!(tickets, vec![0, 1, 2]);

        // Spawn in reverse so the scheduler would favour the wrong order.
        let mut tasks = Vec::new();
        for ticket in tickets.into_iter().rev() {
            let lane = Arc::clone(&lane);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _turn = lane.turn(ticket).await;
                tokio::task::yield_now().await;
                order.lock().await.push(ticket);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }
}
