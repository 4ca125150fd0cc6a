//! # Game Stats Replies
//!
//! [`GameStats`] is the snapshot a game server keeps up to date; [`StatsReplyBuilder`]
//! turns it into `S2A_INFO`, `S2A_RULES`, `S2A_PLAYER` and `S2A_PLAYER_EX` frames.
//!
//! The snapshot is shared as `Arc<RwLock<GameStats>>`. Replies take the read lock only
//! while copying the values out, and may be served from a [`ReplyCache`].

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::SystemTime;

use tracing::debug;

use crate::config::QueryConfig;
use crate::core::field::fields;
use crate::core::message::{
    A2sInfo, Message, PlayerExRecord, PlayerRecord, Rule, S2aInfo, S2aPlayer, S2aPlayerEx,
    S2aRules,
};
use crate::core::packet::DEFAULT_FRAGMENT_SIZE;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::frame::Frame;
use crate::protocol::server::CommandHandler;
use crate::transport::reply_cache::{ReplyCache, ReplyKind};
use crate::utils::time::elapsed_since;

/// Prefix added to spectator names in `S2A_PLAYER`
pub const SPECTATOR_PREFIX: &str = "[SPEC] ";

/// Lifecycle state reported in the `ServerState` rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    WaitingPlayers,
    GameStarted,
    ShuttingDown,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::WaitingPlayers => "WaitingPlayers",
            ServerState::GameStarted => "GameStarted",
            ServerState::ShuttingDown => "ShuttingDown",
        };
        f.write_str(name)
    }
}

/// Host operating system reported as the info environment byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
    Unknown,
}

impl Platform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "windows" => Platform::Windows,
            "macos" => Platform::MacOs,
            "linux" => Platform::Linux,
            _ => Platform::Unknown,
        }
    }

    pub fn environment_byte(self) -> u8 {
        match self {
            Platform::Windows => b'w',
            Platform::MacOs => b'm',
            Platform::Linux => b'l',
            Platform::Unknown => b'u',
        }
    }
}

/// Per-player values
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerStats {
    pub index: i32,
    pub name: String,
    pub faction: String,
    /// Team number, zero or negative when unassigned
    pub team: i32,
    pub is_admin: bool,
    pub is_bot: bool,
    pub is_spectating: bool,
    pub experience: i32,
    pub army_value: i32,
    pub assets_value: i32,
    pub buildings_dead: i32,
    pub buildings_killed: i32,
    pub earned: i32,
    pub units_dead: i32,
    pub units_killed: i32,
    pub remote_endpoint: String,
    /// Milliseconds
    pub last_latency: i32,
}

impl Default for PlayerStats {
    fn default() -> Self {
        Self {
            index: 0,
            name: String::new(),
            faction: String::new(),
            team: -1,
            is_admin: false,
            is_bot: false,
            is_spectating: false,
            experience: -1,
            army_value: -1,
            assets_value: -1,
            buildings_dead: -1,
            buildings_killed: -1,
            earned: -1,
            units_dead: -1,
            units_killed: -1,
            remote_endpoint: String::new(),
            last_latency: -1,
        }
    }
}

/// Server-wide values
#[derive(Debug, Clone, PartialEq)]
pub struct GameStats {
    pub server_name: String,
    pub map: String,
    pub map_id: String,
    /// Reported as the info `game` field
    pub mod_id: String,
    pub version: String,
    pub listen_port: u16,
    pub max_players: u8,
    pub players: Vec<PlayerStats>,
    /// Extra rules appended after the built-in ones
    pub other_rules: Vec<Rule>,
    pub start_time: SystemTime,
    pub server_state: Option<ServerState>,
    pub dedicated: bool,
    pub advertise_online: bool,
    pub password_protected: bool,
    pub require_authentication: bool,
    pub enable_vote_kick: bool,
    pub allow_spectators: bool,
    pub game_speed: String,
    pub explore_map_enabled: bool,
    pub fog_enabled: bool,
    pub platform: Platform,
}

impl Default for GameStats {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            map: String::new(),
            map_id: String::new(),
            mod_id: String::new(),
            version: String::new(),
            listen_port: 0,
            max_players: 0,
            players: Vec::new(),
            other_rules: Vec::new(),
            start_time: SystemTime::now(),
            server_state: None,
            dedicated: true,
            advertise_online: true,
            password_protected: false,
            require_authentication: false,
            enable_vote_kick: false,
            allow_spectators: false,
            game_speed: String::new(),
            explore_map_enabled: false,
            fog_enabled: false,
            platform: Platform::current(),
        }
    }
}

fn flag(value: bool) -> String {
    let text = if value { "True" } else { "False" };
    text.to_string()
}

fn saturate_u8(value: usize) -> u8 {
    u8::try_from(value).unwrap_or(u8::MAX)
}

/// Default [`CommandHandler`] answering from a shared [`GameStats`]
pub struct StatsReplyBuilder {
    stats: Arc<RwLock<GameStats>>,
    cache: Option<Arc<ReplyCache>>,
    max_fragment_size: usize,
}

impl fmt::Debug for StatsReplyBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsReplyBuilder")
            .field("cached", &self.cache.is_some())
            .field("max_fragment_size", &self.max_fragment_size)
            .finish()
    }
}

impl StatsReplyBuilder {
    pub fn new(stats: Arc<RwLock<GameStats>>) -> Self {
        Self {
            stats,
            cache: None,
            max_fragment_size: DEFAULT_FRAGMENT_SIZE,
        }
    }

    /// Builder honouring the `[cache]` and `[session]` sections of `config`
    pub fn from_config(stats: Arc<RwLock<GameStats>>, config: &QueryConfig) -> Self {
        let builder =
            Self::new(stats).with_max_fragment_size(config.session.max_fragment_size);
        if config.cache.enabled {
            builder.with_cache(Arc::new(ReplyCache::new(config.cache.reply_ttl)))
        } else {
            builder
        }
    }

    pub fn with_cache(mut self, cache: Arc<ReplyCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_max_fragment_size(mut self, max_fragment_size: usize) -> Self {
        self.max_fragment_size = max_fragment_size;
        self
    }

    pub fn stats(&self) -> &Arc<RwLock<GameStats>> {
        &self.stats
    }

    pub fn cache(&self) -> Option<&Arc<ReplyCache>> {
        self.cache.as_ref()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, GameStats>> {
        self.stats
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_STATS_LOCK.to_string()))
    }

    fn reply<F>(&self, kind: ReplyKind, build: F) -> Result<Frame>
    where
        F: FnOnce() -> Result<Message>,
    {
        let make = || {
            let message = build()?;
            debug!(?kind, "Built reply");
            Frame::from_message(message, self.max_fragment_size)
        };
        match &self.cache {
            Some(cache) => cache.get_or_build(kind, make),
            None => make(),
        }
    }

    pub fn build_info(&self) -> Result<Message> {
        let stats = self.read()?;
        Ok(Message::S2aInfo(S2aInfo {
            name: stats.server_name.clone(),
            map: stats.map.clone(),
            folder: String::new(),
            game: stats.mod_id.clone(),
            id: 0,
            players: saturate_u8(stats.players.len()),
            max_players: stats.max_players,
            bots: saturate_u8(stats.players.iter().filter(|p| p.is_bot).count()),
            server_type: if stats.dedicated { b'd' } else { b'i' },
            environment: stats.platform.environment_byte(),
            visibility: u8::from(!stats.advertise_online),
            vac: 0,
            version: stats.version.clone(),
            // The wire field is signed; ports above 32767 keep their bit pattern
            port: Some(stats.listen_port as i16),
            ..S2aInfo::default()
        }))
    }

    pub fn build_rules(&self) -> Result<Message> {
        let stats = self.read()?;
        let duration = elapsed_since(stats.start_time).as_secs_f64();
        let spectators = stats.players.iter().filter(|p| p.is_spectating).count();

        let mut rules = vec![
            Rule::new(
                "ServerState",
                stats.server_state.map(|s| s.to_string()).unwrap_or_default(),
            ),
            Rule::new("RequireAuthentication", flag(stats.require_authentication)),
            Rule::new("PasswordProtected", flag(stats.password_protected)),
            Rule::new("EnableVoteKick", flag(stats.enable_vote_kick)),
            Rule::new("MapID", stats.map_id.clone()),
            Rule::new("Duration", duration.to_string()),
            Rule::new("GameSpeed", stats.game_speed.clone()),
            Rule::new("ExploreMapEnabled", flag(stats.explore_map_enabled)),
            Rule::new("FogEnabled", flag(stats.fog_enabled)),
            Rule::new("NumSpectators", spectators.to_string()),
            Rule::new("AllowSpectators", flag(stats.allow_spectators)),
        ];
        rules.extend(stats.other_rules.iter().cloned());
        Ok(Message::S2aRules(S2aRules { rules }))
    }

    pub fn build_players(&self) -> Result<Message> {
        let stats = self.read()?;
        let duration = elapsed_since(stats.start_time).as_secs_f32();
        let players = stats
            .players
            .iter()
            .map(|player| PlayerRecord {
                index: u8::try_from(player.index).unwrap_or(u8::MAX),
                name: if player.is_spectating {
                    format!("{SPECTATOR_PREFIX}{}", player.name)
                } else {
                    player.name.clone()
                },
                score: player.experience,
                duration,
            })
            .collect();
        Ok(Message::S2aPlayer(S2aPlayer { players }))
    }

    pub fn build_players_ex(&self) -> Result<Message> {
        let stats = self.read()?;
        let connection_time = elapsed_since(stats.start_time).as_secs_f32();
        let players = stats
            .players
            .iter()
            .map(|player| PlayerExRecord {
                index: player.index,
                fields: vec![
                    fields::IS_IN_TEAM.with(u8::from(player.team > 0)),
                    fields::TEAM_ID.with(u8::try_from(player.team).unwrap_or(0)),
                    fields::NAME.with(player.name.as_str()),
                    fields::SCORE.with(player.experience),
                    fields::CONNECTION_TIME.with(connection_time),
                    fields::FACTION.with(player.faction.as_str()),
                    fields::IS_ADMIN.with(u8::from(player.is_admin)),
                    fields::IS_BOT.with(u8::from(player.is_bot)),
                    fields::IS_SPECTATING.with(u8::from(player.is_spectating)),
                    fields::ARMY_VALUE.with(player.army_value),
                    fields::ASSETS_VALUE.with(player.assets_value),
                    fields::BUILDINGS_DEAD.with(player.buildings_dead),
                    fields::BUILDINGS_KILLED.with(player.buildings_killed),
                    fields::EARNED.with(player.earned),
                    fields::UNITS_DEAD.with(player.units_dead),
                    fields::UNITS_KILLED.with(player.units_killed),
                    fields::IP.with(player.remote_endpoint.as_str()),
                    fields::PING.with(i16::try_from(player.last_latency).unwrap_or(i16::MAX)),
                ],
            })
            .collect();
        Ok(Message::S2aPlayerEx(S2aPlayerEx { players }))
    }
}

impl CommandHandler for StatsReplyBuilder {
    fn info(&self, _request: &A2sInfo) -> Result<Frame> {
        self.reply(ReplyKind::Info, || self.build_info())
    }

    fn rules(&self) -> Result<Frame> {
        self.reply(ReplyKind::Rules, || self.build_rules())
    }

    fn players(&self) -> Result<Frame> {
        self.reply(ReplyKind::Players, || self.build_players())
    }

    fn custom(&self, request: &Message) -> Option<Result<Frame>> {
        match request {
            Message::A2sPlayerEx(_) => Some(self.reply(ReplyKind::PlayersEx, || self.build_players_ex())),
            _ => None,
        }
    }
}
