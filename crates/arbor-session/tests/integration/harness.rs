//! Test harness for in-process arbor session tests.
//!
//! Provides Fixture (a small game-like endpoint tree that records what it
//! receives), TestPeer (one side of a stream session) and TestPair (two peers
//! joined by an in-memory duplex stream).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arbor_codec::{BitDecoder, BitEncoder};
use arbor_protocol::{
    ContextKey, EndpointRef, LengthHint, LinkRef, MessageContext, MissingKeys, NaturalEquivalence,
    ObjectCache, Tree, TreeBuilder,
};
use arbor_session::{spawn_stream_session, SessionConfig, SessionHandle, SessionStats};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Ping,
    Echo(String),
    Open(u32),
    Slot { path: String, owner: String, index: u8 },
    Missing { path: String, keys: Vec<String> },
    Greet(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chest(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub struct Player(pub String);

#[derive(Debug, Clone, PartialEq)]
pub struct Inventory {
    pub owner: String,
}

/// Chests that exist on this side.
#[derive(Debug, Default)]
pub struct World {
    pub chests: Mutex<HashSet<u32>>,
}

struct ChestKey {
    world: Arc<World>,
}

impl ContextKey<(), Chest> for ChestKey {
    fn length(&self) -> LengthHint {
        LengthHint::Fixed(4)
    }

    fn parent_of(&self, _value: &Chest) {}

    fn write(&self, enc: &mut BitEncoder, value: &Chest) -> arbor_protocol::Result<()> {
        enc.write_u32(value.0);
        Ok(())
    }

    fn read(&self, dec: &mut BitDecoder, _parent: &()) -> arbor_protocol::Result<Option<Chest>> {
        let id = dec.read_u32()?;
        let exists = self.world.chests.lock().unwrap().contains(&id);
        Ok(exists.then_some(Chest(id)))
    }
}

struct PlayerKey;

impl ContextKey<(), Player> for PlayerKey {
    fn parent_of(&self, _value: &Player) {}

    fn write(&self, enc: &mut BitEncoder, value: &Player) -> arbor_protocol::Result<()> {
        Ok(enc.write_str(&value.0, 32)?)
    }

    fn read(&self, dec: &mut BitDecoder, _parent: &()) -> arbor_protocol::Result<Option<Player>> {
        Ok(Some(Player(dec.read_str(32)?)))
    }
}

pub struct Fixture {
    pub tree: Arc<Tree>,
    pub ping: EndpointRef<()>,
    pub echo: EndpointRef<()>,
    pub open: EndpointRef<Chest>,
    pub slot: EndpointRef<Inventory>,
    pub chest_inv: LinkRef<Chest, Inventory>,
    pub player_inv: LinkRef<Player, Inventory>,
    pub greet: EndpointRef<()>,
    pub names: ObjectCache<String, NaturalEquivalence>,
    pub events: Arc<Mutex<Vec<Event>>>,
    pub world: Arc<World>,
}

impl Fixture {
    pub fn build() -> Self {
        let events: Arc<Mutex<Vec<Event>>> = Arc::default();
        let world = Arc::new(World::default());
        let mut b = TreeBuilder::new();
        let root = b.root();

        let g = b.group(root, "g").unwrap();
        let log = Arc::clone(&events);
        let ping = b
            .signal(g, "ping", move |_: &(), _: &mut MessageContext<'_>| {
                log.lock().unwrap().push(Event::Ping);
                Ok(())
            })
            .unwrap();
        let log = Arc::clone(&events);
        let echo = b
            .endpoint(g, "echo", move |_: &(), dec: &mut BitDecoder, _: &mut MessageContext<'_>| {
                let text = dec.read_str(arbor_protocol::CURRENT_REVISION.max_string_bytes)?;
                log.lock().unwrap().push(Event::Echo(text));
                Ok(())
            })
            .unwrap();

        let chest = b
            .key(
                root,
                "chest",
                ChestKey {
                    world: Arc::clone(&world),
                },
            )
            .unwrap();
        let log = Arc::clone(&events);
        let open = b
            .signal(chest, "open", move |c: &Chest, _: &mut MessageContext<'_>| {
                log.lock().unwrap().push(Event::Open(c.0));
                Ok(())
            })
            .unwrap();
        let log = Arc::clone(&events);
        b.on_missing(open, move |missing: &MissingKeys, ctx: &MessageContext<'_>| {
            log.lock().unwrap().push(Event::Missing {
                path: ctx.path_name(),
                keys: missing.names.clone(),
            });
            Ok(())
        })
        .unwrap();

        let player = b.key(root, "player", PlayerKey).unwrap();
        let inventory = b.dynamic::<Inventory>("inventory").unwrap();
        let chest_inv = b
            .link(chest, inventory, "inv", |c: &Chest| {
                Some(Inventory {
                    owner: format!("chest {}", c.0),
                })
            })
            .unwrap();
        let player_inv = b
            .link(player, inventory, "inv", |p: &Player| {
                Some(Inventory {
                    owner: format!("player {}", p.0),
                })
            })
            .unwrap();
        let log = Arc::clone(&events);
        let slot = b
            .endpoint(
                inventory,
                "slot",
                move |inv: &Inventory, dec: &mut BitDecoder, ctx: &mut MessageContext<'_>| {
                    let index = dec.read_u8()?;
                    log.lock().unwrap().push(Event::Slot {
                        path: ctx.path_name(),
                        owner: inv.owner.clone(),
                        index,
                    });
                    Ok(())
                },
            )
            .unwrap();

        let names = b
            .cache(
                "names",
                NaturalEquivalence,
                |enc: &mut BitEncoder, s: &String| Ok(enc.write_str(s, 32)?),
                |dec: &mut BitDecoder| Ok(dec.read_str(32)?),
            )
            .unwrap();
        let lookup = names.clone();
        let log = Arc::clone(&events);
        let greet = b
            .endpoint(g, "greet", move |_: &(), dec: &mut BitDecoder, ctx: &mut MessageContext<'_>| {
                let id = dec.read_var_u32()?;
                let name = lookup.resolve(ctx.caches(), id)?;
                log.lock().unwrap().push(Event::Greet(name.to_string()));
                Ok(())
            })
            .unwrap();

        Self {
            tree: b.build(),
            ping,
            echo,
            open,
            slot,
            chest_inv,
            player_inv,
            greet,
            names,
            events,
            world,
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Poll the event log until it holds `n` events, or timeout.
    pub async fn wait_events(&self, n: usize, timeout: Duration) -> anyhow::Result<Vec<Event>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let events = self.events();
            if events.len() >= n {
                return Ok(events);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for {n} events (have {}): {events:?}", events.len());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// One side of a stream session, with its own copy of the tree.
pub struct TestPeer {
    pub fx: Fixture,
    pub handle: SessionHandle,
    session: JoinHandle<SessionStats>,
    io: JoinHandle<Result<(), arbor_session::TransportError>>,
}

impl TestPeer {
    pub async fn stats(&self) -> anyhow::Result<SessionStats> {
        Ok(self.handle.execute(|s| s.stats().clone()).await?)
    }
}

pub struct TestPair {
    pub a: TestPeer,
    pub b: TestPeer,
    a_shutdown: broadcast::Sender<()>,
    b_shutdown: broadcast::Sender<()>,
}

impl TestPair {
    pub fn new() -> Self {
        Self::with_config(&SessionConfig::default())
    }

    pub fn with_config(config: &SessionConfig) -> Self {
        Self::with_configs(config, config)
    }

    /// Peers with different settings, e.g. different bandwidth caps.
    pub fn with_configs(a_config: &SessionConfig, b_config: &SessionConfig) -> Self {
        init_tracing();
        let (a_shutdown, _) = broadcast::channel(4);
        let (b_shutdown, _) = broadcast::channel(4);
        let (left, right) = tokio::io::duplex(256 * 1024);
        let a_fx = Fixture::build();
        let b_fx = Fixture::build();
        let a = spawn_stream_session(left, a_fx.tree.clone(), "a", a_config, &a_shutdown);
        let b = spawn_stream_session(right, b_fx.tree.clone(), "b", b_config, &b_shutdown);
        Self {
            a: TestPeer {
                fx: a_fx,
                handle: a.handle,
                session: a.session,
                io: a.io,
            },
            b: TestPeer {
                fx: b_fx,
                handle: b.handle,
                session: b.session,
                io: b.io,
            },
            a_shutdown,
            b_shutdown,
        }
    }

    /// Signals shutdown to `a` only; `b` keeps reading until the stream ends.
    pub fn stop_a(&self) {
        let _ = self.a_shutdown.send(());
    }

    /// Stops both peers and returns their final stats.
    pub async fn shutdown(self) -> anyhow::Result<(SessionStats, SessionStats)> {
        let _ = self.a_shutdown.send(());
        let _ = self.b_shutdown.send(());
        let a = self.a.session.await?;
        let b = self.b.session.await?;
        // The second io task may find its peer already gone; only the
        // sessions' own results matter here.
        let _ = self.a.io.await?;
        let _ = self.b.io.await?;
        Ok((a, b))
    }
}
