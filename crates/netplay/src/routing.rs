//! Relay decisions for a star topology.
//!
//! Clients only have a connection to the host. Anything a client addresses
//! to someone other than the host is wrapped in a NET_SEND_TO_PLAYER request
//! and relayed by the host, which re-emits the inner envelope unchanged.

use crate::codec::{self, CodecError};
use crate::messages::{Destination, Envelope, NetMessageType, PlayerIndex, TrafficClass};

/// A routing inconsistency. The envelope is dropped and logged.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// The destination slot is empty or out of range.
    #[error("destination slot {0} is vacant")]
    VacantSlot(PlayerIndex),

    /// The claimed source does not match the connection it arrived on.
    #[error("player {connection} sent an envelope claiming to be from {claimed}")]
    SpoofedSource {
        /// Source field of the envelope.
        claimed: PlayerIndex,
        /// Player owning the connection.
        connection: PlayerIndex,
    },

    /// A client received an envelope not addressed to it.
    #[error("envelope for {0:?} delivered to the wrong player")]
    Misaddressed(Destination),

    /// A relay request could not be built or unpacked.
    #[error("bad relay request: {0}")]
    BadRelay(#[from] CodecError),
}

/// What to do with one envelope.
#[derive(Debug, Default)]
pub struct Route {
    /// Envelope to queue for local consumption.
    pub local: Option<Envelope>,
    /// Envelopes to transmit, keyed by the player whose connection carries them.
    pub forward: Vec<(PlayerIndex, Envelope)>,
    /// The host unpacked a relay request to produce this route.
    pub relayed: bool,
}

/// Routing role of the local machine.
#[derive(Debug, Clone, Copy)]
pub struct Multiplexer {
    local: PlayerIndex,
    is_host: bool,
}

impl Multiplexer {
    /// Router for the host.
    pub fn host() -> Self {
        Self {
            local: PlayerIndex::HOST,
            is_host: true,
        }
    }

    /// Router for a client occupying `local`.
    pub fn client(local: PlayerIndex) -> Self {
        Self {
            local,
            is_host: false,
        }
    }

    /// Slot of the local player.
    pub fn local(&self) -> PlayerIndex {
        self.local
    }

    /// Whether the local machine is the host.
    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Route an envelope produced locally. `active` lists occupied slots.
    ///
    /// Game-class broadcasts are looped back so the local simulation applies
    /// them in the same order as everyone else. Net-class broadcasts are not.
    pub fn route_outgoing(
        &self,
        envelope: Envelope,
        active: &[PlayerIndex],
    ) -> Result<Route, RoutingError> {
        let loopback = envelope.class() == TrafficClass::Game;
        match envelope.destination {
            Destination::Player(p) if p == self.local => Ok(Route {
                local: Some(envelope),
                ..Route::default()
            }),
            Destination::Player(p) if !active.contains(&p) => Err(RoutingError::VacantSlot(p)),
            Destination::Player(p) if self.is_host || p.is_host() => Ok(Route {
                forward: vec![(p, envelope)],
                ..Route::default()
            }),
            Destination::Player(_) => Ok(Route {
                forward: vec![(PlayerIndex::HOST, self.wrap(&envelope)?)],
                ..Route::default()
            }),
            Destination::All => {
                let forward = if self.is_host {
                    active
                        .iter()
                        .filter(|&&p| p != self.local)
                        .map(|&p| (p, envelope.clone()))
                        .collect()
                } else {
                    vec![(PlayerIndex::HOST, self.wrap(&envelope)?)]
                };
                Ok(Route {
                    local: loopback.then_some(envelope),
                    forward,
                    relayed: false,
                })
            }
        }
    }

    /// Route an envelope that arrived on the connection owned by `from`.
    pub fn route_incoming(
        &self,
        from: PlayerIndex,
        envelope: Envelope,
        active: &[PlayerIndex],
    ) -> Result<Route, RoutingError> {
        if !self.is_host {
            if envelope.net_type() == Some(NetMessageType::SendToPlayer) {
                return Err(RoutingError::Misaddressed(envelope.destination));
            }
            if !envelope.destination.includes(self.local) {
                return Err(RoutingError::Misaddressed(envelope.destination));
            }
            return Ok(Route {
                local: Some(envelope),
                ..Route::default()
            });
        }

        check_source(from, &envelope)?;
        if envelope.net_type() != Some(NetMessageType::SendToPlayer) {
            return self.relay(from, envelope, active, false);
        }
        let inner = codec::decode(&envelope.payload)?;
        check_source(from, &inner)?;
        tracing::trace!(
            "Relay request from {from}: {} to {:?}",
            inner.message_type,
            inner.destination
        );
        self.relay(from, inner, active, true)
    }

    fn relay(
        &self,
        from: PlayerIndex,
        envelope: Envelope,
        active: &[PlayerIndex],
        relayed: bool,
    ) -> Result<Route, RoutingError> {
        match envelope.destination {
            Destination::Player(p) if p == self.local => Ok(Route {
                local: Some(envelope),
                forward: Vec::new(),
                relayed,
            }),
            Destination::Player(p) if !active.contains(&p) => Err(RoutingError::VacantSlot(p)),
            Destination::Player(p) => Ok(Route {
                local: None,
                forward: vec![(p, envelope)],
                relayed,
            }),
            Destination::All => {
                let forward = active
                    .iter()
                    .filter(|&&p| p != self.local && p != from)
                    .map(|&p| (p, envelope.clone()))
                    .collect();
                Ok(Route {
                    local: Some(envelope),
                    forward,
                    relayed,
                })
            }
        }
    }

    fn wrap(&self, inner: &Envelope) -> Result<Envelope, RoutingError> {
        Ok(Envelope::net(
            NetMessageType::SendToPlayer,
            self.local,
            Destination::HOST_ONLY,
            codec::encode(inner)?,
        ))
    }
}

fn check_source(from: PlayerIndex, envelope: &Envelope) -> Result<(), RoutingError> {
    if envelope.source != from {
        return Err(RoutingError::SpoofedSource {
            claimed: envelope.source,
            connection: from,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{GameMessageType, MessageType};

    const ACTIVE: [PlayerIndex; 3] = [PlayerIndex(0), PlayerIndex(1), PlayerIndex(2)];

    fn text(src: u8, dst: Destination) -> Envelope {
        Envelope::net(NetMessageType::TextMsg, PlayerIndex(src), dst, b"gg".to_vec())
    }

    #[test]
    fn test_client_to_client_goes_through_host() {
        let a = Multiplexer::client(PlayerIndex(1));
        let host = Multiplexer::host();
        let b = Multiplexer::client(PlayerIndex(2));
        let original = text(1, Destination::Player(PlayerIndex(2)));

        let out = a.route_outgoing(original.clone(), &ACTIVE).unwrap();
        assert!(out.local.is_none());
        assert_eq!(out.forward.len(), 1);
        let (via, request) = out.forward.into_iter().next().unwrap();
        assert_eq!(via, PlayerIndex::HOST);
        assert_eq!(
            request.message_type,
            MessageType::Net(NetMessageType::SendToPlayer)
        );

        let hop = host.route_incoming(PlayerIndex(1), request, &ACTIVE).unwrap();
        assert!(hop.relayed);
        assert!(hop.local.is_none());
        let (to, relayed) = hop.forward.into_iter().next().unwrap();
        assert_eq!(to, PlayerIndex(2));
        assert_eq!(relayed, original);

        let arrived = b.route_incoming(PlayerIndex::HOST, relayed, &ACTIVE).unwrap();
        assert_eq!(arrived.local, Some(original));
    }

    #[test]
    fn test_host_broadcast_skips_itself() {
        let host = Multiplexer::host();
        let out = host.route_outgoing(text(0, Destination::All), &ACTIVE).unwrap();
        let targets: Vec<_> = out.forward.iter().map(|(p, _)| *p).collect();
        assert_eq!(targets, vec![PlayerIndex(1), PlayerIndex(2)]);
        assert!(out.local.is_none());
    }

    #[test]
    fn test_game_broadcast_loops_back() {
        let host = Multiplexer::host();
        let env = Envelope::game(
            GameMessageType::Build,
            PlayerIndex(0),
            Destination::All,
            40,
            vec![],
        );
        let out = host.route_outgoing(env.clone(), &ACTIVE).unwrap();
        assert_eq!(out.local, Some(env));
    }

    #[test]
    fn test_relayed_broadcast_excludes_origin() {
        let host = Multiplexer::host();
        let a = Multiplexer::client(PlayerIndex(1));
        let out = a.route_outgoing(text(1, Destination::All), &ACTIVE).unwrap();
        let (_, request) = out.forward.into_iter().next().unwrap();
        let hop = host.route_incoming(PlayerIndex(1), request, &ACTIVE).unwrap();
        assert!(hop.local.is_some());
        let targets: Vec<_> = hop.forward.iter().map(|(p, _)| *p).collect();
        assert_eq!(targets, vec![PlayerIndex(2)]);
    }

    #[test]
    fn test_client_to_host_is_direct() {
        let a = Multiplexer::client(PlayerIndex(1));
        let out = a.route_outgoing(text(1, Destination::HOST_ONLY), &ACTIVE).unwrap();
        let (via, env) = &out.forward[0];
        assert_eq!(*via, PlayerIndex::HOST);
        assert_eq!(env.message_type, MessageType::Net(NetMessageType::TextMsg));
    }

    #[test]
    fn test_vacant_destination_is_dropped() {
        let host = Multiplexer::host();
        let err = host
            .route_outgoing(text(0, Destination::Player(PlayerIndex(5))), &ACTIVE)
            .unwrap_err();
        assert!(matches!(err, RoutingError::VacantSlot(PlayerIndex(5))));

        let a = Multiplexer::client(PlayerIndex(1));
        let req = a
            .wrap(&text(1, Destination::Player(PlayerIndex(6))))
            .unwrap();
        let err = host.route_incoming(PlayerIndex(1), req, &ACTIVE).unwrap_err();
        assert!(matches!(err, RoutingError::VacantSlot(PlayerIndex(6))));
    }

    #[test]
    fn test_spoofed_relay_rejected() {
        let host = Multiplexer::host();
        let liar = Multiplexer::client(PlayerIndex(2));
        let forged = liar
            .wrap(&text(1, Destination::Player(PlayerIndex(1))))
            .unwrap();
        let err = host.route_incoming(PlayerIndex(2), forged, &ACTIVE).unwrap_err();
        assert!(matches!(err, RoutingError::SpoofedSource { .. }));
    }

    #[test]
    fn test_client_rejects_foreign_destination() {
        let b = Multiplexer::client(PlayerIndex(2));
        let err = b
            .route_incoming(
                PlayerIndex::HOST,
                text(0, Destination::Player(PlayerIndex(1))),
                &ACTIVE,
            )
            .unwrap_err();
        assert!(matches!(err, RoutingError::Misaddressed(_)));
    }

    #[test]
    fn test_host_never_relays_to_itself() {
        let host = Multiplexer::host();
        let a = Multiplexer::client(PlayerIndex(1));
        let req = a.wrap(&text(1, Destination::HOST_ONLY)).unwrap();
        let hop = host.route_incoming(PlayerIndex(1), req, &ACTIVE).unwrap();
        assert!(hop.local.is_some());
        assert!(hop.forward.is_empty());
    }
}
