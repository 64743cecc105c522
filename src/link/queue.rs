//! Pending outbound queue
//!
//! Holds events that could not be sent while the companion was unreachable.
//! Append-only until a flush drains it; insertion order is delivery-attempt order.

use std::collections::VecDeque;

use crate::link::message::LinkMessage;

#[derive(Debug, Default)]
pub struct PendingQueue {
    messages: VecDeque<LinkMessage>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: LinkMessage) {
        self.messages.push_back(message);
    }

    /// Take the oldest message for a delivery attempt
    pub fn pop_front(&mut self) -> Option<LinkMessage> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LinkMessage> {
        self.messages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::message::Params;

    #[test]
    fn test_preserves_insertion_order() {
        let mut queue = PendingQueue::new();
        for kind in ["metrics", "ended", "command"] {
            queue.push(LinkMessage::event(kind, Params::new()));
        }

        assert_eq!(queue.len(), 3);
        let kinds: Vec<&str> = queue.iter().map(LinkMessage::kind).collect();
        assert_eq!(kinds, vec!["metrics", "ended", "command"]);

        assert_eq!(queue.pop_front().unwrap().kind(), "metrics");
        assert_eq!(queue.len(), 2);
    }
}
