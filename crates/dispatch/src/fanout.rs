//! Delivery of server events to connected participants.
//!
//! Every participant has one outbound channel, owned by its transport
//! session. Ride-scoped events go through a [`RideGroup`] so that once a
//! ride is accepted only its passenger and driver hear about it. Delivery is
//! fire-and-forget: a closed channel just drops the event.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;

use taxi_protocol::ServerEvent;

use crate::presence::Participant;

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RideGroup {
    pub ride_id: String,
    pub passenger_id: String,
    pub driver_id: Option<String>,
}

impl RideGroup {
    pub fn members(&self) -> Vec<Participant> {
        let mut members = vec![Participant::Passenger(self.passenger_id.clone())];
        if let Some(driver_id) = &self.driver_id {
            members.push(Participant::Driver(driver_id.clone()));
        }
        members
    }

    pub fn contains(&self, participant: &Participant) -> bool {
        match participant {
            Participant::Passenger(id) => id == &self.passenger_id,
            Participant::Driver(id) => self.driver_id.as_deref() == Some(id.as_str()),
        }
    }
}

#[derive(Debug, Default)]
pub struct NotificationFanout {
    clients: HashMap<Participant, EventSender>,
    groups: HashMap<String, RideGroup>,
}

impl NotificationFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the participant to `tx`, replacing any older channel.
    pub fn attach(&mut self, participant: Participant, tx: EventSender) {
        self.clients.insert(participant, tx);
    }

    /// Unbinds the participant, but only if it is still bound to `tx`; a
    /// newer session that took over the identity keeps its channel.
    pub fn detach(&mut self, participant: &Participant, tx: &EventSender) -> bool {
        match self.clients.get(participant) {
            Some(current) if current.same_channel(tx) => {
                self.clients.remove(participant);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, participant: &Participant) {
        self.clients.remove(participant);
    }

    pub fn send_to(&self, participant: &Participant, event: ServerEvent) -> bool {
        match self.clients.get(participant) {
            Some(tx) => tx.send(event).is_ok(),
            None => {
                debug!(participant = participant.id(), "no channel for participant");
                false
            }
        }
    }

    pub fn send_to_driver(&self, driver_id: &str, event: ServerEvent) -> bool {
        self.send_to(&Participant::Driver(driver_id.to_string()), event)
    }

    pub fn send_to_passenger(&self, passenger_id: &str, event: ServerEvent) -> bool {
        self.send_to(&Participant::Passenger(passenger_id.to_string()), event)
    }

    /// Sends to every connected participant; returns how many took it.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        self.clients
            .values()
            .filter(|tx| tx.send(event.clone()).is_ok())
            .count()
    }

    pub fn open_group(&mut self, ride_id: &str, passenger_id: &str) {
        self.groups.insert(
            ride_id.to_string(),
            RideGroup {
                ride_id: ride_id.to_string(),
                passenger_id: passenger_id.to_string(),
                driver_id: None,
            },
        );
    }

    /// Adds the accepted driver; returns the new member count.
    pub fn join_driver(&mut self, ride_id: &str, driver_id: &str) -> Option<usize> {
        let group = self.groups.get_mut(ride_id)?;
        group.driver_id = Some(driver_id.to_string());
        Some(group.members().len())
    }

    pub fn send_to_ride(&self, ride_id: &str, event: ServerEvent) -> usize {
        let Some(group) = self.groups.get(ride_id) else {
            return 0;
        };
        group
            .members()
            .iter()
            .filter(|member| self.send_to(member, event.clone()))
            .count()
    }

    pub fn close_group(&mut self, ride_id: &str) -> Option<RideGroup> {
        self.groups.remove(ride_id)
    }

    pub fn group(&self, ride_id: &str) -> Option<&RideGroup> {
        self.groups.get(ride_id)
    }

    pub fn connected(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use taxi_protocol::{ServerError, StatusNotice};

    use super::*;

    fn ping() -> ServerEvent {
        ServerEvent::Error(ServerError {
            code: "ping".to_string(),
            message: String::new(),
        })
    }

    fn notice() -> ServerEvent {
        ServerEvent::DriverAvailableConfirmation(StatusNotice {
            status: "available".to_string(),
            message: String::new(),
            timestamp: chrono::Utc::now(),
        })
    }

    #[test]
    fn ride_group_reaches_only_members() {
        let mut fanout = NotificationFanout::new();
        let (p_tx, mut p_rx) = mpsc::unbounded_channel();
        let (d_tx, mut d_rx) = mpsc::unbounded_channel();
        let (other_tx, mut other_rx) = mpsc::unbounded_channel();
        fanout.attach(Participant::Passenger("p1".to_string()), p_tx);
        fanout.attach(Participant::Driver("d1".to_string()), d_tx);
        fanout.attach(Participant::Driver("d2".to_string()), other_tx);

        fanout.open_group("r1", "p1");
        assert_eq!(fanout.send_to_ride("r1", ping()), 1);
        assert_eq!(fanout.join_driver("r1", "d1"), Some(2));
        assert_eq!(fanout.send_to_ride("r1", notice()), 2);

        assert!(p_rx.try_recv().is_ok());
        assert!(p_rx.try_recv().is_ok());
        assert!(d_rx.try_recv().is_ok());
        assert!(other_rx.try_recv().is_err());

        fanout.close_group("r1");
        assert_eq!(fanout.send_to_ride("r1", ping()), 0);
    }

    #[test]
    fn stale_session_cannot_detach_newer_channel() {
        let mut fanout = NotificationFanout::new();
        let who = Participant::Driver("d1".to_string());
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        fanout.attach(who.clone(), old_tx.clone());
        fanout.attach(who.clone(), new_tx);

        assert!(!fanout.detach(&who, &old_tx));
        assert!(fanout.send_to(&who, ping()));
        assert!(new_rx.try_recv().is_ok());
    }

    #[test]
    fn closed_channels_are_skipped() {
        let mut fanout = NotificationFanout::new();
        let (tx, rx) = mpsc::unbounded_channel();
        fanout.attach(Participant::Passenger("p1".to_string()), tx);
        drop(rx);
        assert_eq!(fanout.broadcast(&ping()), 0);
        assert!(!fanout.send_to_passenger("p1", ping()));
    }
}
