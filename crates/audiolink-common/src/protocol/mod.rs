//! Wire messages exchanged with a node.
//!
//! A node pushes JSON messages over its WebSocket, discriminated by an `op`
//! field. The pool only acts on `ready` and `stats`; everything else is
//! carried as [`IncomingMessage::Unknown`] and ignored. The REST payloads
//! used for node discovery (`GET /v4/info`) live here as well.

use serde::Deserialize;

/// A message pushed by a node over its WebSocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    /// Sent once per connection after the handshake completes.
    Ready(ReadyPayload),
    /// Periodic load report; feeds the penalty model.
    Stats(StatsPayload),
    /// Any op this version does not act on.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyPayload {
    /// Whether the node resumed a previous session.
    #[serde(default)]
    pub resumed: bool,
    pub session_id: String,
}

/// Periodic load report from a node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsPayload {
    /// Total players attached to the node, idle ones included.
    pub players: u32,
    pub playing_players: u32,
    /// Node uptime in milliseconds.
    pub uptime: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    /// Absent until the node has played for a full stats window.
    #[serde(default)]
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub process_load: f64,
}

/// Audio frame counters over the last stats window.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

impl StatsPayload {
    /// Load score used for node selection; lower is preferred.
    ///
    /// Sums the playing-player count with exponential CPU and frame-loss
    /// penalties. Nulled frames weigh double: a node that sends silence is
    /// worse than one that is merely behind.
    pub fn penalty(&self) -> f64 {
        let player_penalty = f64::from(self.playing_players);
        let cpu_penalty = 1.05f64.powf(100.0 * self.cpu.system_load) * 10.0 - 10.0;

        let (null_penalty, deficit_penalty) = match &self.frame_stats {
            Some(frames) => (
                (1.03f64.powf(500.0 * frames.nulled as f64 / 3000.0) * 600.0 - 600.0) * 2.0,
                1.03f64.powf(500.0 * frames.deficit as f64 / 3000.0) * 600.0 - 600.0,
            ),
            None => (0.0, 0.0),
        };

        player_penalty + cpu_penalty + null_penalty + deficit_penalty
    }
}

/// Response of a node's `GET /v4/info`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub version: NodeVersion,
    /// Content sources the node can resolve and play.
    #[serde(default)]
    pub source_managers: Vec<String>,
    #[serde(default)]
    pub plugins: Vec<PluginInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeVersion {
    pub semver: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
}
