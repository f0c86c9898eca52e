//! Property tests for sender resolution.

use chrono::Utc;
use meshcore_store::{peers, Evidence, NodeResolver, SenderIdentifier, Store};
use meshcore_types::{PublicKey, ShortId};
use proptest::prelude::*;

const NAMES: [&str; 4] = ["Alice", "Bob", "Relay-7", "Diana"];

/// One sighting of a sender, drawn from small pools so keys, short ids and
/// names collide and exercise promotion and merging.
#[derive(Debug, Clone)]
enum Sighting {
    Key(u8),
    Short(u8),
    Name(u8),
}

fn arb_sighting() -> impl Strategy<Value = Sighting> {
    prop_oneof![
        (0u8..4).prop_map(Sighting::Key),
        (0u8..4).prop_map(Sighting::Short),
        (0u8..4).prop_map(Sighting::Name),
    ]
}

fn identify(sighting: &Sighting) -> (SenderIdentifier, Evidence) {
    let seen = Evidence::seen(Utc::now());
    match *sighting {
        Sighting::Key(n) => {
            let key = PublicKey::from_bytes([n + 1; 32]);
            (
                SenderIdentifier::PublicKey(key),
                Evidence {
                    public_key: Some(key),
                    display_name: Some(NAMES[usize::from(n)].to_string()),
                    ..seen
                },
            )
        }
        Sighting::Short(n) => (SenderIdentifier::ShortId(ShortId(n + 1)), seen),
        Sighting::Name(n) => {
            let name = NAMES[usize::from(n)].to_string();
            (
                SenderIdentifier::Name(name.clone()),
                Evidence {
                    display_name: Some(name),
                    ..seen
                },
            )
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever came before, resolving the same sighting twice lands on the
    /// same peer and the second time creates nothing. (It may still fold in
    /// a second provisional record the key explains.)
    #[test]
    fn resolving_twice_is_idempotent(
        history in prop::collection::vec(arb_sighting(), 0..12),
        last in arb_sighting(),
    ) {
        let store = Store::in_memory().expect("store");
        let (first, second, before, after) = store
            .transaction(|conn| {
                let resolver = NodeResolver::new(conn);
                for sighting in &history {
                    let (id, evidence) = identify(sighting);
                    resolver.resolve(&id, &evidence)?;
                }
                let (id, evidence) = identify(&last);
                let first = resolver.resolve(&id, &evidence)?;
                let before = peers::list_peers(conn, false)?.len();
                let second = resolver.resolve(&id, &evidence)?;
                let after = peers::list_peers(conn, false)?.len();
                Ok((first, second, before, after))
            })
            .expect("resolution");

        prop_assert_eq!(&first.peer.stable_id, &second.peer.stable_id);
        prop_assert!(!second.created);
        prop_assert!(!second.promoted);
        prop_assert!(after <= before, "live peers grew from {} to {}", before, after);
    }
}
