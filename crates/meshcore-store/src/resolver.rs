//! Sender identity resolution.
//!
//! Packets name their sender in one of three ways: a full public key
//! (adverts, discovery responses), a one-byte short id (direct texts, path
//! reports) or only a display name (group texts, keyless adverts). The
//! resolver maps each onto a peer record:
//!
//! - a full key matches the peer holding that key; a provisional peer that
//!   the key explains (same short id, or same name and no short id yet) is
//!   promoted in place, or merged into the confirmed peer if one exists;
//! - a short id or name matches the most recently seen live peer, ties
//!   broken by stable id, with a warning when several match;
//! - anything unmatched becomes a new provisional peer.
//!
//! Resolving the same identifier twice yields the same peer.

use chrono::{DateTime, Utc};
use meshcore_types::{GeoPoint, NodeType, Peer, PublicKey, ShortId};
use rusqlite::Connection;
use uuid::Uuid;

use crate::peers::{self, NewPeer, PeerUpdate};
use crate::{messages, threads, StoreError};

/// How a packet identifies its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderIdentifier {
    PublicKey(PublicKey),
    ShortId(ShortId),
    Name(String),
}

impl std::fmt::Display for SenderIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PublicKey(k) => write!(f, "key:{}", &k.to_hex()[..16]),
            Self::ShortId(s) => write!(f, "short:{s}"),
            Self::Name(n) => write!(f, "name:{n}"),
        }
    }
}

/// Everything a packet tells us about its sender besides the identifier.
#[derive(Debug, Clone)]
pub struct Evidence {
    pub seen_at: DateTime<Utc>,
    pub public_key: Option<PublicKey>,
    pub display_name: Option<String>,
    pub node_type: Option<NodeType>,
    pub rssi: Option<i16>,
    pub snr: Option<f32>,
    pub location: Option<GeoPoint>,
    pub path: Vec<ShortId>,
}

impl Evidence {
    pub fn seen(seen_at: DateTime<Utc>) -> Self {
        Self {
            seen_at,
            public_key: None,
            display_name: None,
            node_type: None,
            rssi: None,
            snr: None,
            location: None,
            path: Vec::new(),
        }
    }

    fn to_update(&self) -> PeerUpdate {
        PeerUpdate {
            display_name: self.display_name.clone(),
            node_type: self.node_type,
            rssi: self.rssi,
            snr: self.snr,
            location: self.location,
            last_path: Some(self.path.iter().map(ShortId::to_string).collect()),
            seen_at: Some(self.seen_at),
        }
    }
}

/// Several live peers matched one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionConflict {
    pub identifier: String,
    pub chosen: String,
    pub candidates: Vec<String>,
}

/// Outcome of one resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub peer: Peer,
    pub created: bool,
    pub promoted: bool,
    /// Provisional peer folded into `peer` by this resolution.
    pub merged_from: Option<String>,
    pub conflict: Option<ResolutionConflict>,
}

impl Resolution {
    fn found(peer: Peer, conflict: Option<ResolutionConflict>) -> Self {
        Self {
            peer,
            created: false,
            promoted: false,
            merged_from: None,
            conflict,
        }
    }
}

/// Resolves senders against the peer table on one connection (usually the
/// open transaction of the event being reconciled).
pub struct NodeResolver<'c> {
    conn: &'c Connection,
}

impl<'c> NodeResolver<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn resolve(
        &self,
        id: &SenderIdentifier,
        evidence: &Evidence,
    ) -> Result<Resolution, StoreError> {
        if let Some(key) = evidence.public_key {
            return self.resolve_key(key, evidence);
        }
        match id {
            SenderIdentifier::PublicKey(key) => self.resolve_key(*key, evidence),
            SenderIdentifier::ShortId(short) => {
                let short = short.to_string();
                let candidates = peers::candidates_by_short_id(self.conn, &short)?;
                self.pick_or_create(id, candidates, evidence, || NewPeer {
                    stable_id: Uuid::new_v4().to_string(),
                    public_key: None,
                    short_id: Some(short.clone()),
                    display_name: evidence
                        .display_name
                        .clone()
                        .unwrap_or_else(|| format!("node-{short}")),
                    node_type: evidence.node_type.unwrap_or_default(),
                    seen_at: evidence.seen_at,
                })
            }
            SenderIdentifier::Name(name) => {
                let candidates = peers::candidates_by_name(self.conn, name)?;
                self.pick_or_create(id, candidates, evidence, || NewPeer {
                    stable_id: Uuid::new_v4().to_string(),
                    public_key: None,
                    short_id: None,
                    display_name: name.clone(),
                    node_type: evidence.node_type.unwrap_or_default(),
                    seen_at: evidence.seen_at,
                })
            }
        }
    }

    /// Looks up a live peer without creating anything.
    pub fn lookup(&self, id: &SenderIdentifier) -> Result<Option<Peer>, StoreError> {
        let candidates = match id {
            SenderIdentifier::PublicKey(key) => {
                return Ok(peers::find_by_public_key(self.conn, key)?
                    .filter(|p| p.merged_into.is_none()))
            }
            SenderIdentifier::ShortId(short) => {
                peers::candidates_by_short_id(self.conn, &short.to_string())?
            }
            SenderIdentifier::Name(name) => peers::candidates_by_name(self.conn, name)?,
        };
        Ok(candidates.into_iter().next())
    }

    fn pick_or_create(
        &self,
        id: &SenderIdentifier,
        candidates: Vec<Peer>,
        evidence: &Evidence,
        new_peer: impl FnOnce() -> NewPeer,
    ) -> Result<Resolution, StoreError> {
        let conflict = conflict_for(id, &candidates);
        match candidates.into_iter().next() {
            Some(peer) => {
                // Name evidence must not rename a peer matched by short id.
                let mut update = evidence.to_update();
                if !matches!(id, SenderIdentifier::Name(_)) && !peer.is_provisional {
                    update.display_name = None;
                }
                let peer = peers::apply_update(self.conn, &peer.stable_id, &update)?;
                Ok(Resolution::found(peer, conflict))
            }
            None => {
                let created = peers::insert_peer(self.conn, &new_peer())?;
                let peer = peers::apply_update(self.conn, &created.stable_id, &evidence.to_update())?;
                tracing::debug!(
                    stable_id = %peer.stable_id,
                    identifier = %id,
                    "created provisional peer"
                );
                Ok(Resolution {
                    peer,
                    created: true,
                    promoted: false,
                    merged_from: None,
                    conflict: None,
                })
            }
        }
    }

    fn resolve_key(&self, key: PublicKey, evidence: &Evidence) -> Result<Resolution, StoreError> {
        let short = key.short_id().to_string();
        let confirmed = peers::find_by_public_key(self.conn, &key)?;
        let provisional = self.provisional_for_key(&short, evidence.display_name.as_deref())?;
        let update = evidence.to_update();

        match (confirmed, provisional) {
            (Some(peer), Some(prov)) => {
                self.merge(&prov, &peer)?;
                let peer = peers::apply_update(self.conn, &peer.stable_id, &update)?;
                Ok(Resolution {
                    peer,
                    created: false,
                    promoted: false,
                    merged_from: Some(prov.stable_id),
                    conflict: None,
                })
            }
            (Some(peer), None) => {
                let peer = peers::apply_update(self.conn, &peer.stable_id, &update)?;
                Ok(Resolution::found(peer, None))
            }
            (None, Some(prov)) => {
                peers::promote(self.conn, &prov.stable_id, &key)?;
                let peer = peers::apply_update(self.conn, &prov.stable_id, &update)?;
                tracing::info!(
                    stable_id = %peer.stable_id,
                    short_id = %short,
                    "promoted provisional peer"
                );
                Ok(Resolution {
                    peer,
                    created: false,
                    promoted: true,
                    merged_from: None,
                    conflict: None,
                })
            }
            (None, None) => {
                let hex = key.to_hex();
                let created = peers::insert_peer(
                    self.conn,
                    &NewPeer {
                        stable_id: hex.clone(),
                        public_key: Some(key),
                        short_id: Some(short),
                        display_name: evidence
                            .display_name
                            .clone()
                            .unwrap_or_else(|| format!("node-{}", &hex[..8])),
                        node_type: evidence.node_type.unwrap_or_default(),
                        seen_at: evidence.seen_at,
                    },
                )?;
                let peer = peers::apply_update(self.conn, &created.stable_id, &update)?;
                Ok(Resolution {
                    peer,
                    created: true,
                    promoted: false,
                    merged_from: None,
                    conflict: None,
                })
            }
        }
    }

    /// The provisional peer a newly seen key most plausibly belongs to.
    /// A record matching both short id and name beats one matching either.
    fn provisional_for_key(
        &self,
        short: &str,
        name: Option<&str>,
    ) -> Result<Option<Peer>, StoreError> {
        let mut candidates = peers::provisional_candidates(self.conn, short, name)?;
        // Stable sort keeps the recency/stable-id order within a score.
        candidates.sort_by_key(|p| {
            let by_short = p.short_id.as_deref() == Some(short);
            let by_name = name == Some(p.display_name.as_str());
            std::cmp::Reverse(u8::from(by_short) + u8::from(by_name))
        });
        if candidates.len() > 1 {
            tracing::warn!(
                short_id = %short,
                candidates = candidates.len(),
                chosen = %candidates[0].stable_id,
                "several provisional peers match a new key"
            );
        }
        Ok(candidates.into_iter().next())
    }

    /// Folds `prov` into `into`: sender references, the direct thread (or its
    /// messages, when `into` already has one), the favorite pin and the
    /// merge marker.
    fn merge(&self, prov: &Peer, into: &Peer) -> Result<(), StoreError> {
        let moved_senders = messages::reassign_sender(self.conn, &prov.stable_id, &into.stable_id)?;
        match (
            threads::thread_for_peer(self.conn, &prov.stable_id)?,
            threads::thread_for_peer(self.conn, &into.stable_id)?,
        ) {
            (Some(from), Some(to)) => {
                messages::move_thread_messages(self.conn, from.id, to.id)?;
                threads::add_unread(self.conn, to.id, from.unread_count)?;
                threads::delete_empty_thread(self.conn, from.id)?;
            }
            (Some(from), None) => threads::reassign_peer(self.conn, from.id, &into.stable_id)?,
            (None, _) => {}
        }
        if prov.is_favorite && !into.is_favorite {
            peers::set_favorite(self.conn, &into.stable_id, true)?;
        }
        peers::mark_merged(self.conn, &prov.stable_id, &into.stable_id)?;
        tracing::info!(
            from = %prov.stable_id,
            into = %into.stable_id,
            moved_senders,
            "merged provisional peer"
        );
        Ok(())
    }
}

fn conflict_for(id: &SenderIdentifier, candidates: &[Peer]) -> Option<ResolutionConflict> {
    if candidates.len() < 2 {
        return None;
    }
    let conflict = ResolutionConflict {
        identifier: id.to_string(),
        chosen: candidates[0].stable_id.clone(),
        candidates: candidates.iter().map(|p| p.stable_id.clone()).collect(),
    };
    tracing::warn!(
        identifier = %conflict.identifier,
        chosen = %conflict.chosen,
        candidates = conflict.candidates.len(),
        "ambiguous sender, most recently seen peer wins"
    );
    Some(conflict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{insert_message, list_thread_messages, NewMessage};
    use crate::test_support::setup_db;
    use chrono::Duration;
    use meshcore_types::{DeliveryStatus, Direction};

    fn key(first: u8) -> PublicKey {
        let mut bytes = [0x42; 32];
        bytes[0] = first;
        PublicKey::from_bytes(bytes)
    }

    fn dm(conn: &Connection, peer: &Peer, id: &str) {
        let thread = threads::ensure_direct_thread(conn, &peer.stable_id, Utc::now()).expect("thread");
        insert_message(
            conn,
            &NewMessage {
                message_id: id.to_string(),
                thread_id: thread.id,
                direction: Direction::Inbound,
                sender_peer_id: Some(peer.stable_id.clone()),
                sender_name: None,
                body: id.to_string(),
                delivery_status: DeliveryStatus::Received,
                ack_code: None,
                path_hops: Vec::new(),
                snr: None,
                rssi: None,
                created_at: Utc::now(),
            },
        )
        .expect("insert message");
        threads::add_unread(conn, thread.id, 1).expect("unread");
    }

    fn advert_evidence(k: PublicKey, name: &str) -> Evidence {
        Evidence {
            public_key: Some(k),
            display_name: Some(name.to_string()),
            node_type: Some(NodeType::Chat),
            ..Evidence::seen(Utc::now())
        }
    }

    #[test]
    fn unknown_short_id_creates_provisional_peer_once() {
        let conn = setup_db();
        let resolver = NodeResolver::new(&conn);
        let id = SenderIdentifier::ShortId(ShortId(0xa3));

        let first = resolver.resolve(&id, &Evidence::seen(Utc::now())).expect("resolve");
        assert!(first.created);
        assert!(first.peer.is_provisional);
        assert_eq!(first.peer.display_name, "node-a3");

        let second = resolver.resolve(&id, &Evidence::seen(Utc::now())).expect("resolve");
        assert!(!second.created);
        assert_eq!(second.peer.stable_id, first.peer.stable_id);
    }

    #[test]
    fn full_key_creates_confirmed_peer_keyed_by_hex() {
        let conn = setup_db();
        let resolver = NodeResolver::new(&conn);
        let k = key(0x10);
        let res = resolver
            .resolve(&SenderIdentifier::PublicKey(k), &advert_evidence(k, "Alice"))
            .expect("resolve");
        assert!(res.created);
        assert!(!res.peer.is_provisional);
        assert_eq!(res.peer.stable_id, k.to_hex());
        assert_eq!(res.peer.display_name, "Alice");

        let again = resolver
            .resolve(&SenderIdentifier::PublicKey(k), &advert_evidence(k, "Alice"))
            .expect("resolve");
        assert_eq!(again.peer.stable_id, res.peer.stable_id);
        assert!(!again.created);
    }

    #[test]
    fn key_promotes_provisional_peer_in_place() {
        let conn = setup_db();
        let resolver = NodeResolver::new(&conn);
        let prov = resolver
            .resolve(&SenderIdentifier::ShortId(ShortId(0x10)), &Evidence::seen(Utc::now()))
            .expect("resolve")
            .peer;
        dm(&conn, &prov, "m1");

        let k = key(0x10);
        let res = resolver
            .resolve(&SenderIdentifier::PublicKey(k), &advert_evidence(k, "Alice"))
            .expect("resolve");

        assert!(res.promoted);
        assert_eq!(res.peer.stable_id, prov.stable_id, "stable id survives promotion");
        assert!(!res.peer.is_provisional);
        assert_eq!(res.peer.public_key, Some(k));
        assert_eq!(res.peer.display_name, "Alice");

        let thread = threads::thread_for_peer(&conn, &prov.stable_id)
            .expect("query")
            .expect("thread kept");
        assert_eq!(list_thread_messages(&conn, thread.id, 10).expect("list").len(), 1);
    }

    #[test]
    fn key_merges_provisional_into_existing_confirmed_peer() {
        let conn = setup_db();
        let resolver = NodeResolver::new(&conn);
        let k = key(0x20);

        let confirmed = resolver
            .resolve(&SenderIdentifier::PublicKey(k), &advert_evidence(k, "Bob"))
            .expect("resolve")
            .peer;
        dm(&conn, &confirmed, "m-confirmed");

        // Provisional record created under the same name before the key was
        // linked to it (e.g. from a group text signature).
        let prov = peers::insert_peer(
            &conn,
            &NewPeer {
                stable_id: "prov-bob".into(),
                public_key: None,
                short_id: None,
                display_name: "Bob".into(),
                node_type: NodeType::Unknown,
                seen_at: Utc::now() - Duration::minutes(1),
            },
        )
        .expect("insert");
        dm(&conn, &prov, "m-prov");
        peers::set_favorite(&conn, "prov-bob", true).expect("pin");

        let res = resolver
            .resolve(&SenderIdentifier::PublicKey(k), &advert_evidence(k, "Bob"))
            .expect("resolve");
        assert_eq!(res.merged_from.as_deref(), Some("prov-bob"));
        assert_eq!(res.peer.stable_id, confirmed.stable_id);
        assert!(res.peer.is_favorite, "the pin follows the merge");

        let merged = peers::get_peer(&conn, "prov-bob").expect("get");
        assert_eq!(merged.merged_into.as_deref(), Some(confirmed.stable_id.as_str()));
        assert!(threads::thread_for_peer(&conn, "prov-bob").expect("query").is_none());

        let thread = threads::thread_for_peer(&conn, &confirmed.stable_id)
            .expect("query")
            .expect("thread");
        let messages = list_thread_messages(&conn, thread.id, 10).expect("list");
        let ids: Vec<&str> = messages.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m-confirmed", "m-prov"]);
        assert!(messages
            .iter()
            .all(|m| m.sender_peer_id.as_deref() == Some(confirmed.stable_id.as_str())));
        assert_eq!(thread.unread_count, 2);

        // Merged record never matches again.
        let by_name = resolver
            .resolve(&SenderIdentifier::Name("Bob".into()), &Evidence::seen(Utc::now()))
            .expect("resolve");
        assert_eq!(by_name.peer.stable_id, confirmed.stable_id);
    }

    #[test]
    fn short_id_collision_prefers_most_recent_then_stable_id() {
        let conn = setup_db();
        let now = Utc::now();
        for (id, seen) in [("b", now), ("a", now), ("c", now - Duration::hours(1))] {
            peers::insert_peer(
                &conn,
                &NewPeer {
                    stable_id: id.into(),
                    public_key: None,
                    short_id: Some("77".into()),
                    display_name: id.into(),
                    node_type: NodeType::Chat,
                    seen_at: seen,
                },
            )
            .expect("insert");
        }

        let resolver = NodeResolver::new(&conn);
        let res = resolver
            .resolve(&SenderIdentifier::ShortId(ShortId(0x77)), &Evidence::seen(now - Duration::hours(2)))
            .expect("resolve");
        assert_eq!(res.peer.stable_id, "a");
        let conflict = res.conflict.expect("conflict reported");
        assert_eq!(conflict.candidates, vec!["a", "b", "c"]);

        // Old evidence does not reorder candidates, so the choice is stable.
        let again = resolver
            .resolve(&SenderIdentifier::ShortId(ShortId(0x77)), &Evidence::seen(now - Duration::hours(2)))
            .expect("resolve");
        assert_eq!(again.peer.stable_id, "a");
    }

    #[test]
    fn keyless_advert_resolves_by_name() {
        let conn = setup_db();
        let resolver = NodeResolver::new(&conn);
        let evidence = Evidence {
            display_name: Some("Relay-7".into()),
            node_type: Some(NodeType::Repeater),
            rssi: Some(-60),
            ..Evidence::seen(Utc::now())
        };
        let id = SenderIdentifier::Name("Relay-7".into());
        let first = resolver.resolve(&id, &evidence).expect("resolve");
        assert!(first.peer.is_provisional);
        assert!(first.peer.is_repeater());
        assert_eq!(first.peer.signal_quality, Some(75));

        let second = resolver.resolve(&id, &evidence).expect("resolve");
        assert_eq!(second.peer.stable_id, first.peer.stable_id);
        assert_eq!(peers::list_peers(&conn, false).expect("list").len(), 1);
    }

    #[test]
    fn lookup_never_creates() {
        let conn = setup_db();
        let resolver = NodeResolver::new(&conn);
        assert!(resolver
            .lookup(&SenderIdentifier::Name("ghost".into()))
            .expect("lookup")
            .is_none());
        assert!(peers::list_peers(&conn, true).expect("list").is_empty());
    }
}
