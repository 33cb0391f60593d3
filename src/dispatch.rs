use serde::Serialize;

use crate::models::{Ticket, TicketStatus};

/// Result of asking "what should be worked on next" for a repository.
///
/// `queue_position` is 1-based and always 1 when a head ticket exists;
/// an empty open-set yields `ticket: None` with position 0, which is a
/// valid "nothing to do" answer rather than an error.
#[derive(Debug, Clone, Serialize)]
pub struct Dispatch {
    pub ticket: Option<Ticket>,
    pub queue_position: usize,
    pub total_open_tickets: usize,
}

/// Select the next ticket to execute: open tickets only, ascending by
/// `order`. The sort must be stable so tickets sharing an `order` value
/// keep their relative input order.
pub fn next_ticket(tickets: &[Ticket]) -> Dispatch {
    let mut open: Vec<&Ticket> = tickets
        .iter()
        .filter(|t| t.status == TicketStatus::Open)
        .collect();
    open.sort_by_key(|t| t.order);

    let total_open_tickets = open.len();
    let ticket = open.first().map(|t| (*t).clone());
    let queue_position = usize::from(ticket.is_some());

    Dispatch {
        ticket,
        queue_position,
        total_open_tickets,
    }
}
