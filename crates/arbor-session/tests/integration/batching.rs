//! Batching, frame limits, bandwidth negotiation and file config over a real
//! stream.

use std::time::Duration;

use arbor_protocol::CURRENT_REVISION;
use arbor_session::{SessionConfig, SessionHandle};

use crate::harness::{Event, TestPair};

const WAIT: Duration = Duration::from_secs(5);

/// Polls until the peer's bandwidth advert has been applied.
async fn peer_advert(handle: &SessionHandle) -> anyhow::Result<(u32, u32)> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let (peer, effective) = handle
            .execute(|s| (s.bandwidth().peer(), s.bandwidth().effective()))
            .await?;
        if let Some(peer) = peer {
            return Ok((peer, effective));
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("no bandwidth advert received");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_small_messages_share_frames() -> anyhow::Result<()> {
    let pair = TestPair::new();
    let echo = pair.a.fx.echo;

    pair.a
        .handle
        .execute(move |s| {
            for i in 0..50 {
                s.send(&echo, (), |enc, _| {
                    Ok(enc.write_str(&format!("msg {i}"), CURRENT_REVISION.max_string_bytes)?)
                })?;
            }
            Ok::<_, arbor_session::SessionError>(())
        })
        .await??;

    let events = pair.b.fx.wait_events(50, WAIT).await?;
    assert_eq!(events[0], Event::Echo("msg 0".into()));
    assert_eq!(events[49], Event::Echo("msg 49".into()));

    let (a, b) = pair.shutdown().await?;
    assert_eq!(a.messages_sent, 51);
    assert!(
        a.frames_sent < a.messages_sent,
        "{} frames for {} messages",
        a.frames_sent,
        a.messages_sent
    );
    assert_eq!(b.messages_delivered, 50);
    Ok(())
}

#[tokio::test]
async fn test_oversized_message_still_delivered() -> anyhow::Result<()> {
    let mut config = SessionConfig::default();
    config.session.max_frame_bytes = 256;
    let pair = TestPair::with_config(&config);
    let echo = pair.a.fx.echo;
    let long = "x".repeat(1_000);
    let text = long.clone();

    pair.a
        .handle
        .execute(move |s| {
            s.send(&echo, (), |enc, _| {
                Ok(enc.write_str(&text, CURRENT_REVISION.max_string_bytes)?)
            })
        })
        .await??;

    let events = pair.b.fx.wait_events(1, WAIT).await?;
    assert_eq!(events, vec![Event::Echo(long)]);

    let (a, _) = pair.shutdown().await?;
    // Advert, flushed announce, then the message on its own.
    assert!(a.frames_sent >= 3);
    Ok(())
}

#[tokio::test]
async fn test_shutdown_flushes_queued_messages() -> anyhow::Result<()> {
    let mut config = SessionConfig::default();
    // No tick fires during the test; only the final flush can send.
    config.session.tick_interval_ms = 3_600_000;
    let pair = TestPair::with_config(&config);
    let echo = pair.a.fx.echo;

    let pending = pair
        .a
        .handle
        .execute(move |s| {
            s.send(&echo, (), |enc, _| {
                Ok(enc.write_str("last words", CURRENT_REVISION.max_string_bytes)?)
            })?;
            Ok::<_, arbor_session::SessionError>(s.pending())
        })
        .await??;
    assert_eq!(pending, 2);

    pair.stop_a();
    let events = pair.b.fx.wait_events(1, WAIT).await?;
    assert_eq!(events, vec![Event::Echo("last words".into())]);

    let (a, b) = pair.shutdown().await?;
    // Bandwidth advert, then the final flush.
    assert_eq!(a.frames_sent, 2);
    assert_eq!(b.messages_delivered, 1);
    Ok(())
}

#[tokio::test]
async fn test_bandwidth_negotiation() -> anyhow::Result<()> {
    let mut small = SessionConfig::default();
    small.bandwidth.local_cap = 40_000;
    let pair = TestPair::with_configs(&small, &SessionConfig::default());

    let (peer, effective) = peer_advert(&pair.b.handle).await?;
    assert_eq!(peer, 40_000);
    assert_eq!(effective, 40_000);

    let (peer, effective) = peer_advert(&pair.a.handle).await?;
    assert_eq!(peer, CURRENT_REVISION.bandwidth_default_cap);
    assert_eq!(effective, 40_000);

    pair.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_bandwidth_floor_applies() -> anyhow::Result<()> {
    let mut tiny = SessionConfig::default();
    tiny.bandwidth.local_cap = 4_096;
    tiny.bandwidth.floor = 1_024;
    let pair = TestPair::with_configs(&tiny, &SessionConfig::default());

    // The receiving side never drops below its own floor.
    let (peer, effective) = peer_advert(&pair.b.handle).await?;
    assert_eq!(peer, 4_096);
    assert_eq!(effective, CURRENT_REVISION.bandwidth_floor);

    pair.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_session_from_config_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("arbor.toml");
    std::fs::write(
        &path,
        r#"
[session]
tick_interval_ms = 10

[bandwidth]
local_cap = 65536
"#,
    )?;

    let config = SessionConfig::load_or_default(&path)?;
    assert_eq!(config.session.tick_interval_ms, 10);
    assert_eq!(config.session.max_frame_bytes, CURRENT_REVISION.max_frame_bytes);
    assert_eq!(config.bandwidth.local_cap, 65_536);
    assert_eq!(config.bandwidth.floor, CURRENT_REVISION.bandwidth_floor);

    let pair = TestPair::with_config(&config);
    let ping = pair.a.fx.ping;
    pair.a.handle.execute(move |s| s.signal(&ping, ())).await??;
    assert_eq!(pair.b.fx.wait_events(1, WAIT).await?, vec![Event::Ping]);
    let (peer, _) = peer_advert(&pair.b.handle).await?;
    assert_eq!(peer, 65_536);

    pair.shutdown().await?;

    let missing = SessionConfig::load_or_default(&dir.path().join("absent.toml"))?;
    assert_eq!(missing.session.tick_interval_ms, CURRENT_REVISION.tick_interval_ms);

    std::fs::write(&path, "[bandwidth]\nlocal_cap = 100\nfloor = 200\n")?;
    assert!(SessionConfig::load_or_default(&path).is_err());
    Ok(())
}
