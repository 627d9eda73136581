//! End-to-end scenarios: two peers on a duplex stream, each with its own
//! copy of the fixture tree.

use std::time::Duration;

use arbor_protocol::{DynamicLink, Priority, CURRENT_REVISION};

use crate::harness::{Chest, Event, Inventory, Player, TestPair};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_ping_and_echo() -> anyhow::Result<()> {
    let pair = TestPair::new();
    let ping = pair.a.fx.ping;
    let echo = pair.a.fx.echo;

    pair.a
        .handle
        .execute(move |s| {
            s.signal(&ping, ())?;
            s.send(&echo, (), |enc, _| {
                Ok(enc.write_str("hello tree", CURRENT_REVISION.max_string_bytes)?)
            })
        })
        .await??;

    let events = pair.b.fx.wait_events(2, WAIT).await?;
    assert_eq!(events, vec![Event::Ping, Event::Echo("hello tree".into())]);

    let (a, b) = pair.shutdown().await?;
    assert_eq!(a.messages_sent, 4);
    assert_eq!(b.paths_registered, 2);
    assert_eq!(b.messages_delivered, 2);
    assert_eq!(b.messages_dropped, 0);
    Ok(())
}

#[tokio::test]
async fn test_both_directions() -> anyhow::Result<()> {
    let pair = TestPair::new();
    let a_ping = pair.a.fx.ping;
    let b_ping = pair.b.fx.ping;

    pair.a.handle.execute(move |s| s.signal(&a_ping, ())).await??;
    pair.b.handle.execute(move |s| s.signal(&b_ping, ())).await??;

    assert_eq!(pair.a.fx.wait_events(1, WAIT).await?, vec![Event::Ping]);
    assert_eq!(pair.b.fx.wait_events(1, WAIT).await?, vec![Event::Ping]);

    // Each side allocates its own ids independently.
    let a_ids = pair.a.handle.execute(|s| s.connection().ids().outgoing_len()).await?;
    let b_ids = pair.b.handle.execute(|s| s.connection().ids().outgoing_len()).await?;
    assert_eq!((a_ids, b_ids), (1, 1));

    pair.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_keyed_message_and_missing_key() -> anyhow::Result<()> {
    let pair = TestPair::new();
    pair.b.fx.world.chests.lock().unwrap().insert(9);
    let open = pair.a.fx.open;

    pair.a
        .handle
        .execute(move |s| {
            s.signal(&open, Chest(9))?;
            // Chest 5 exists only on the sending side.
            s.signal(&open, Chest(5))
        })
        .await??;

    let events = pair.b.fx.wait_events(2, WAIT).await?;
    assert_eq!(
        events,
        vec![
            Event::Open(9),
            Event::Missing {
                path: "chest.open".into(),
                keys: vec!["chest".into()],
            },
        ]
    );

    let stats = pair.b.stats().await?;
    assert_eq!(stats.messages_missing, 1);
    assert_eq!(stats.messages_delivered, 1);
    // Both sends share one path.
    assert_eq!(stats.paths_registered, 1);

    pair.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_dynamic_node_under_both_owners() -> anyhow::Result<()> {
    let pair = TestPair::new();
    pair.b.fx.world.chests.lock().unwrap().insert(4);
    let slot = pair.a.fx.slot;
    let chest_inv = pair.a.fx.chest_inv;
    let player_inv = pair.a.fx.player_inv;

    pair.a
        .handle
        .execute(move |s| {
            s.send_linked(
                &slot,
                Inventory {
                    owner: "chest 4".into(),
                },
                DynamicLink::new(chest_inv, Chest(4)),
                Priority::Normal,
                |enc, _| {
                    enc.write_u8(1);
                    Ok(())
                },
            )?;
            s.send_linked(
                &slot,
                Inventory {
                    owner: "player alex".into(),
                },
                DynamicLink::new(player_inv, Player("alex".into())),
                Priority::Normal,
                |enc, _| {
                    enc.write_u8(2);
                    Ok(())
                },
            )
        })
        .await??;

    let events = pair.b.fx.wait_events(2, WAIT).await?;
    assert_eq!(
        events,
        vec![
            Event::Slot {
                path: "chest.inv.slot".into(),
                owner: "chest 4".into(),
                index: 1,
            },
            Event::Slot {
                path: "player.inv.slot".into(),
                owner: "player alex".into(),
                index: 2,
            },
        ]
    );
    assert_eq!(pair.b.stats().await?.paths_registered, 2);

    pair.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_unresolved_dynamic_send_fails_locally() -> anyhow::Result<()> {
    let pair = TestPair::new();
    let slot = pair.a.fx.slot;

    let result = pair
        .a
        .handle
        .execute(move |s| {
            s.send(
                &slot,
                Inventory {
                    owner: "nobody".into(),
                },
                |enc, _| {
                    enc.write_u8(0);
                    Ok(())
                },
            )
        })
        .await?;
    assert!(result.is_err());
    assert_eq!(pair.a.handle.execute(|s| s.pending()).await?, 0);

    pair.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_cached_names() -> anyhow::Result<()> {
    let pair = TestPair::new();
    let names = pair.a.fx.names.clone();
    let greet = pair.a.fx.greet;

    let ids = pair
        .a
        .handle
        .execute(move |s| {
            let mut ids = Vec::new();
            for name in ["alex", "sam", "alex"] {
                let id = s.with_connection(|conn| names.get_or_assign_id(conn, &name.to_string()))?;
                s.send(&greet, (), |enc, _| {
                    enc.write_var_u32(id);
                    Ok(())
                })?;
                ids.push(id);
            }
            Ok::<_, arbor_session::SessionError>(ids)
        })
        .await??;
    assert_eq!(ids[0], ids[2]);
    assert_ne!(ids[0], ids[1]);

    let events = pair.b.fx.wait_events(3, WAIT).await?;
    assert_eq!(
        events,
        vec![
            Event::Greet("alex".into()),
            Event::Greet("sam".into()),
            Event::Greet("alex".into()),
        ]
    );

    let names = pair.b.fx.names.clone();
    let stored = pair
        .b
        .handle
        .execute(move |s| names.incoming_len(s.connection().caches()))
        .await?;
    assert_eq!(stored, 2);

    pair.shutdown().await?;
    Ok(())
}
