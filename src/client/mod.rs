//! Client sessions
//!
//! A `Client` keeps one session alive against an ensemble, moving between
//! read-write and read-only servers as quorum comes and goes:
//!
//! - `state`: session lifecycle and identity
//! - `session`: the task that owns the connection
//! - `prober`: background search for a read-write server while read-only
//! - `watcher`: ordered delivery of state events
//!
//! ```ignore
//! let roster = Arc::new(ServerRoster::parse("node1:2181,node2:2181,node3:2181")?);
//! let config = ClientConfig::default().with_allow_read_only(true);
//! let client = Client::connect(roster, config, Arc::new(TcpConnector::new()), None)?;
//! client.wait_until_connected(Duration::from_secs(5)).await?;
//! let (data, stat) = client.get_data("/config").await?;
//! ```

mod config;
mod errors;
mod handle;
mod pending;
mod prober;
mod session;
mod state;
mod watcher;

pub use config::ClientConfig;
pub use errors::{ClientError, ClientResult};
pub use handle::Client;
pub use prober::{MajorityProber, ProberHandle};
pub use state::{HandshakeEffect, KeeperState, Session, SessionState, SessionStatus};
pub use watcher::{ChannelWatcher, FnWatcher, WatchedEvent, Watcher, WatcherDispatcher, WatcherId};
