//! The AOO rendezvous server.
//!
//! A stateful TCP session manager brokering peer introductions: clients
//! log in, join named groups and learn the public endpoints of their
//! peers; an optional UDP relay forwards media for hosts that cannot
//! reach each other directly.
//!
//! The TCP loop is single threaded (see [`Server::run`]); all state
//! mutation happens under one writer lock, lookups take a reader lock.
//! Hosts may intercept requests through a [`RequestHandler`] and complete
//! them later from any thread via [`Server::handle_request`].

pub mod entity;
pub mod ping;
mod tcp;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use aoo_wire::endpoint::{ipv4_mapped, is_ipv4_mapped, unmapped};
use aoo_wire::osc::{OscMessage, OscWriter};
use aoo_wire::pattern::{
    MSG_GROUP_CHANGED, MSG_GROUP_EJECT, MSG_GROUP_JOIN, MSG_GROUP_LEAVE, MSG_GROUP_UPDATE,
    MSG_LOGIN, MSG_MESSAGE, MSG_PEER_CHANGED, MSG_PEER_JOIN, MSG_PEER_LEAVE, MSG_PING, MSG_PONG,
    MSG_QUERY, MSG_REQUEST, MSG_USER_CHANGED, MSG_USER_UPDATE,
};
use aoo_wire::{binmsg, parse_pattern, Data, Id, IpHost, MsgType, WireError, ID_INVALID};

use entity::{encrypt, ClientEndpoint, Group, GroupUser, User};
use ping::{PingSettings, PingState};

/// Server protocol version; the major number must match the client's.
pub const VERSION: &str = "2.0.0";

/// Wire error codes of the session protocol.
pub mod error_code {
    pub const OK: i32 = 0;
    pub const BAD_FORMAT: i32 = 1;
    pub const BAD_ARGUMENT: i32 = 2;
    pub const WRONG_PASSWORD: i32 = 3;
    pub const NOT_PERMITTED: i32 = 4;
    pub const UNHANDLED_REQUEST: i32 = 5;
    pub const CANNOT_CREATE_GROUP: i32 = 6;
    pub const CANNOT_CREATE_USER: i32 = 7;
    pub const USER_ALREADY_EXISTS: i32 = 8;
    pub const GROUP_DOES_NOT_EXIST: i32 = 9;
    pub const NOT_GROUP_MEMBER: i32 = 10;
    pub const VERSION_MISMATCH: i32 = 11;
    pub const NOT_RESPONDING: i32 = 12;
    pub const NOT_IMPLEMENTED: i32 = 13;
}

/// Errors returned by the in-process server API.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid argument: {0}")]
    BadArgument(&'static str),
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Socket(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;

//----------------------------- requests ------------------------------//

#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub version: String,
    pub password: String,
    pub metadata: Option<Data>,
}

#[derive(Debug, Clone)]
pub struct GroupJoinRequest {
    pub group_name: String,
    pub group_password: String,
    pub group_metadata: Option<Data>,
    pub user_name: String,
    pub user_password: String,
    pub user_metadata: Option<Data>,
    pub relay: Option<IpHost>,
}

/// A client request, yielded to the [`RequestHandler`] before the server
/// acts on it.
#[derive(Debug, Clone)]
pub enum Request {
    Login(LoginRequest),
    GroupJoin(GroupJoinRequest),
    GroupLeave { group: Id },
    GroupUpdate { group: Id, metadata: Data },
    UserUpdate { group: Id, metadata: Data },
    Custom { data: Data, flags: i32 },
}

/// The server's answer to an accepted request. Metadata fields override
/// what the request proposed.
#[derive(Debug, Clone)]
pub enum Response {
    Login {
        metadata: Option<Data>,
    },
    GroupJoin {
        group_metadata: Option<Data>,
        user_metadata: Option<Data>,
        private_metadata: Option<Data>,
        relay: Option<IpHost>,
    },
    GroupLeave,
    GroupUpdate {
        metadata: Data,
    },
    UserUpdate {
        metadata: Data,
    },
    Custom {
        data: Data,
        flags: i32,
    },
}

impl Response {
    /// The default response the server uses when a request is not
    /// intercepted.
    pub fn default_for(request: &Request) -> Self {
        match request {
            Request::Login(_) => Response::Login { metadata: None },
            Request::GroupJoin(_) => Response::GroupJoin {
                group_metadata: None,
                user_metadata: None,
                private_metadata: None,
                relay: None,
            },
            Request::GroupLeave { .. } => Response::GroupLeave,
            Request::GroupUpdate { metadata, .. } => Response::GroupUpdate {
                metadata: metadata.clone(),
            },
            Request::UserUpdate { metadata, .. } => Response::UserUpdate {
                metadata: metadata.clone(),
            },
            Request::Custom { data, flags } => Response::Custom {
                data: data.clone(),
                flags: *flags,
            },
        }
    }
}

/// Host hook for asynchronous request handling. Return `true` to take
/// ownership of the request; the host must then complete it with
/// [`Server::handle_request`] (possibly from another thread).
pub trait RequestHandler: Send + Sync {
    fn handle(&self, client: Id, token: Id, request: &Request) -> bool;
}

//------------------------------ events -------------------------------//

#[derive(Debug)]
pub enum ServerEvent {
    ClientLogin {
        client: Id,
        error: i32,
        metadata: Option<Data>,
    },
    ClientLogout {
        client: Id,
        error: i32,
        message: String,
    },
    GroupAdd {
        group: Id,
        name: String,
    },
    GroupRemove {
        group: Id,
        name: String,
    },
    GroupJoin {
        group: Id,
        user: Id,
        user_name: String,
    },
    GroupLeave {
        group: Id,
        user: Id,
        user_name: String,
    },
    GroupUpdate {
        group: Id,
        user: Id,
    },
    UserUpdate {
        group: Id,
        user: Id,
    },
}

/// A queued push notification.
struct Notification {
    group: Id,
    user: Id,
    data: Data,
}

//----------------------------- the server ----------------------------//

/// Address families the UDP socket serves; used by the relay to mediate
/// between IPv4 and IPv6 peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
    DualStack,
}

struct UdpConfig {
    family: AddressFamily,
    ipv4_mapped: bool,
}

pub(crate) struct ServerState {
    pub clients: HashMap<Id, ClientEndpoint>,
    pub groups: HashMap<Id, Group>,
    next_client_id: Id,
    next_group_id: Id,
}

pub struct Server {
    state: RwLock<ServerState>,
    events: (Sender<ServerEvent>, Receiver<ServerEvent>),
    notifications: (Sender<Notification>, Receiver<Notification>),
    request_handler: Mutex<Option<Box<dyn RequestHandler>>>,
    /// hashed global password, if any
    password: Mutex<Option<String>>,
    relay_addr: Mutex<Option<IpHost>>,
    allow_relay: AtomicBool,
    group_auto_create: AtomicBool,
    ping_settings: Mutex<PingSettings>,
    udp_config: Mutex<UdpConfig>,
    pub(crate) quit_flag: AtomicBool,
    pub(crate) waker: Mutex<Option<std::sync::Arc<mio::Waker>>>,
    /// clients whose TCP connection the session loop must close
    pub(crate) closed: Mutex<Vec<Id>>,
    epoch: Instant,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ServerState {
                clients: HashMap::new(),
                groups: HashMap::new(),
                next_client_id: 0,
                next_group_id: 0,
            }),
            events: unbounded(),
            notifications: unbounded(),
            request_handler: Mutex::new(None),
            password: Mutex::new(None),
            relay_addr: Mutex::new(None),
            allow_relay: AtomicBool::new(false),
            group_auto_create: AtomicBool::new(true),
            ping_settings: Mutex::new(PingSettings::default()),
            udp_config: Mutex::new(UdpConfig {
                family: AddressFamily::DualStack,
                ipv4_mapped: false,
            }),
            quit_flag: AtomicBool::new(false),
            waker: Mutex::new(None),
            closed: Mutex::new(Vec::new()),
            epoch: Instant::now(),
        }
    }

    pub(crate) fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    //--------------------------- configuration -----------------------//

    /// Global login password; `None` disables the check.
    pub fn set_password(&self, password: Option<&str>) {
        *self.password.lock() = password.map(encrypt);
    }

    /// Dedicated relay announced to joining clients.
    pub fn set_relay_host(&self, relay: Option<IpHost>) {
        *self.relay_addr.lock() = relay;
    }

    /// Allow relaying peer traffic through this server.
    pub fn set_server_relay(&self, allowed: bool) {
        self.allow_relay.store(allowed, Ordering::Relaxed);
    }

    pub fn server_relay(&self) -> bool {
        self.allow_relay.load(Ordering::Relaxed)
    }

    pub fn set_group_auto_create(&self, allowed: bool) {
        self.group_auto_create.store(allowed, Ordering::Relaxed);
    }

    pub fn group_auto_create(&self) -> bool {
        self.group_auto_create.load(Ordering::Relaxed)
    }

    pub fn set_ping_settings(&self, settings: PingSettings) {
        *self.ping_settings.lock() = settings;
    }

    pub fn set_udp_family(&self, family: AddressFamily, ipv4_mapped: bool) {
        *self.udp_config.lock() = UdpConfig {
            family,
            ipv4_mapped,
        };
    }

    pub fn set_request_handler(&self, handler: Option<Box<dyn RequestHandler>>) {
        *self.request_handler.lock() = handler;
    }

    //--------------------------- admin API ---------------------------//

    /// Pre-provision a persistent group.
    pub fn add_group(
        &self,
        name: &str,
        password: Option<&str>,
        metadata: Option<Data>,
        relay: Option<IpHost>,
    ) -> ServerResult<Id> {
        let mut state = self.state.write();
        if state.groups.values().any(|g| g.name() == name) {
            return Err(ServerError::AlreadyExists);
        }
        let id = Self::next_group_id(&mut state);
        state
            .groups
            .insert(id, Group::new(name, password, id, metadata, relay, true));
        Ok(id)
    }

    /// Remove a group, notifying and ejecting its members.
    pub fn remove_group(&self, group: Id) -> ServerResult<()> {
        let mut state = self.state.write();
        let state = &mut *state;
        let grp = state.groups.get(&group).ok_or(ServerError::NotFound)?;
        let members: Vec<(Id, Id)> = grp.users().map(|u| (u.id(), u.client())).collect();
        for (user, client_id) in members {
            if client_id == ID_INVALID {
                continue;
            }
            Self::notify_peer_leave(state, group, user);
            if let Some(client) = state.clients.get_mut(&client_id) {
                let mut w = client_message(MSG_GROUP_EJECT);
                w.int32(group);
                client.send_message(&w.to_bytes());
                client.on_group_leave(group, user);
            }
        }
        let grp = state.groups.remove(&group).unwrap();
        self.push_event(ServerEvent::GroupRemove {
            group,
            name: grp.name().to_string(),
        });
        self.wake();
        Ok(())
    }

    pub fn find_group(&self, name: &str) -> Option<Id> {
        self.state
            .read()
            .groups
            .values()
            .find(|g| g.name() == name)
            .map(|g| g.id())
    }

    /// Pre-provision a persistent user inside a group.
    pub fn add_user_to_group(
        &self,
        group: Id,
        name: &str,
        password: Option<&str>,
        metadata: Option<Data>,
    ) -> ServerResult<Id> {
        let mut state = self.state.write();
        let grp = state.groups.get_mut(&group).ok_or(ServerError::NotFound)?;
        if grp.find_user_by_name(name).is_some() {
            return Err(ServerError::AlreadyExists);
        }
        let id = grp.get_next_user_id();
        let user = User::new(name, password, id, group, ID_INVALID, metadata, None, true, false);
        grp.add_user(user).ok_or(ServerError::AlreadyExists)?;
        Ok(id)
    }

    /// Allow or forbid joining clients to create new users in a group.
    pub fn set_group_user_auto_create(&self, group: Id, allowed: bool) -> ServerResult<()> {
        let mut state = self.state.write();
        let grp = state.groups.get_mut(&group).ok_or(ServerError::NotFound)?;
        grp.set_user_auto_create(allowed);
        Ok(())
    }

    pub fn find_user_in_group(&self, group: Id, name: &str) -> Option<Id> {
        self.state
            .read()
            .groups
            .get(&group)
            .and_then(|g| g.find_user_by_name(name))
            .map(|u| u.id())
    }

    /// Kick a user out of a group.
    pub fn remove_user_from_group(&self, group: Id, user: Id) -> ServerResult<()> {
        let mut state = self.state.write();
        let state = &mut *state;
        let grp = state.groups.get_mut(&group).ok_or(ServerError::NotFound)?;
        let usr = grp.find_user(user).ok_or(ServerError::NotFound)?;
        let client_id = usr.client();
        let user_name = usr.name().to_string();
        if client_id != ID_INVALID {
            Self::notify_peer_leave(state, group, user);
            if let Some(client) = state.clients.get_mut(&client_id) {
                let mut w = client_message(MSG_GROUP_EJECT);
                w.int32(group);
                client.send_message(&w.to_bytes());
                client.on_group_leave(group, user);
            }
            self.push_event(ServerEvent::GroupLeave {
                group,
                user,
                user_name,
            });
        }
        self.do_remove_user_from_group(state, group, user);
        self.wake();
        Ok(())
    }

    /// Update group metadata and notify all members.
    pub fn update_group_metadata(&self, group: Id, metadata: Data) -> ServerResult<()> {
        let mut state = self.state.write();
        let state = &mut *state;
        let grp = state.groups.get_mut(&group).ok_or(ServerError::NotFound)?;
        grp.metadata = Some(metadata.clone());
        for user in grp.users() {
            if let Some(client) = state.clients.get(&user.client()) {
                let mut w = client_message(MSG_GROUP_CHANGED);
                // updated on the server, not by a member
                w.int32(group).int32(ID_INVALID).metadata(Some(&metadata));
                client.send_message(&w.to_bytes());
            }
        }
        self.wake();
        Ok(())
    }

    /// Update user metadata and notify the group.
    pub fn update_user_metadata(&self, group: Id, user: Id, metadata: Data) -> ServerResult<()> {
        let mut state = self.state.write();
        let state = &mut *state;
        let grp = state.groups.get_mut(&group).ok_or(ServerError::NotFound)?;
        let usr = grp.find_user_mut(user).ok_or(ServerError::NotFound)?;
        usr.metadata = Some(metadata.clone());
        for member in grp.users() {
            let pattern = if member.id() == user {
                MSG_USER_CHANGED
            } else {
                MSG_PEER_CHANGED
            };
            if let Some(client) = state.clients.get(&member.client()) {
                let mut w = client_message(pattern);
                w.int32(group).int32(user).metadata(Some(&metadata));
                client.send_message(&w.to_bytes());
            }
        }
        self.wake();
        Ok(())
    }

    //--------------------------- notifications -----------------------//

    /// Push a message to one client, dispatched on the next server tick.
    pub fn notify_client(&self, client: Id, data: Data) -> ServerResult<()> {
        if !self.state.read().clients.contains_key(&client) {
            return Err(ServerError::NotFound);
        }
        let _ = self.notifications.0.send(Notification {
            group: ID_INVALID,
            user: client,
            data,
        });
        self.wake();
        Ok(())
    }

    /// Push a message to one user (or all with `ID_ALL`) of a group.
    pub fn notify_group(&self, group: Id, user: Id, data: Data) -> ServerResult<()> {
        {
            let state = self.state.read();
            let grp = state.groups.get(&group).ok_or(ServerError::NotFound)?;
            if user != aoo_wire::ID_ALL && grp.find_user(user).is_none() {
                return Err(ServerError::NotFound);
            }
        }
        let _ = self.notifications.0.send(Notification { group, user, data });
        self.wake();
        Ok(())
    }

    pub(crate) fn dispatch_notifications(&self) {
        let state = self.state.read();
        while let Ok(n) = self.notifications.1.try_recv() {
            let send = |client: &ClientEndpoint| {
                let mut w = client_message(MSG_MESSAGE);
                w.int32(n.data.kind).blob(&n.data.content);
                client.send_message(&w.to_bytes());
            };
            if n.group == ID_INVALID {
                match state.clients.get(&n.user) {
                    Some(c) => send(c),
                    None => log::warn!("notify: client {} is gone", n.user),
                }
            } else if let Some(grp) = state.groups.get(&n.group) {
                for user in grp.users() {
                    if n.user == aoo_wire::ID_ALL || n.user == user.id() {
                        if let Some(c) = state.clients.get(&user.client()) {
                            send(c);
                        }
                    }
                }
            } else {
                log::warn!("notify: group {} is gone", n.group);
            }
        }
    }

    //--------------------------- events ------------------------------//

    fn push_event(&self, event: ServerEvent) {
        let _ = self.events.0.send(event);
    }

    pub fn events_available(&self) -> bool {
        !self.events.1.is_empty()
    }

    pub fn poll_events<F: FnMut(ServerEvent)>(&self, mut f: F) {
        while let Ok(e) = self.events.1.try_recv() {
            f(e);
        }
    }

    //--------------------------- client sessions ---------------------//

    /// Register a new session (called on TCP accept).
    pub(crate) fn add_client(&self, reply: Sender<Vec<u8>>) -> Id {
        let mut state = self.state.write();
        let id = state.next_client_id;
        state.next_client_id += 1;
        let now = self.now();
        state.clients.insert(id, ClientEndpoint::new(id, reply, now));
        log::debug!("server: added client {}", id);
        id
    }

    pub(crate) fn client_count(&self) -> usize {
        self.state.read().clients.len()
    }

    pub(crate) fn group_count(&self) -> usize {
        self.state.read().groups.len()
    }

    /// The client's TCP connection went away.
    pub(crate) fn on_client_disconnect(&self, client: Id, error: i32, message: &str) {
        let mut state = self.state.write();
        self.remove_client(&mut state, client, error, message);
    }

    fn remove_client(&self, state: &mut ServerState, client: Id, error: i32, message: &str) {
        let endpoint = match state.clients.remove(&client) {
            Some(c) => c,
            None => return,
        };
        // leave all groups (by id pairs; entities never own each other)
        for GroupUser { group, user } in endpoint.memberships.iter().copied() {
            let user_name = state
                .groups
                .get(&group)
                .and_then(|g| g.find_user(user))
                .map(|u| u.name().to_string())
                .unwrap_or_default();
            Self::notify_peer_leave(state, group, user);
            self.do_remove_user_from_group(state, group, user);
            self.push_event(ServerEvent::GroupLeave {
                group,
                user,
                user_name,
            });
        }
        if endpoint.active {
            self.push_event(ServerEvent::ClientLogout {
                client,
                error,
                message: message.to_string(),
            });
        }
        self.closed.lock().push(client);
        self.wake();
        log::debug!("server: removed client {}", client);
    }

    /// Advance all ping timers; returns the next deadline in seconds.
    pub(crate) fn update_ping_timers(&self) -> f64 {
        let settings = *self.ping_settings.lock();
        let now = self.now();
        let mut next = f64::MAX;
        let mut timeouts = Vec::new();
        {
            let mut state = self.state.write();
            for (id, client) in state.clients.iter_mut() {
                let result = client.ping.update(now, &settings);
                if result.send_ping {
                    let w = client_message(MSG_PING);
                    client.send_message(&w.to_bytes());
                }
                if result.state == PingState::Inactive {
                    timeouts.push(*id);
                } else if result.wait < next {
                    next = result.wait;
                }
            }
            for id in &timeouts {
                log::debug!("server: client {} is not responding", id);
                self.remove_client(
                    &mut state,
                    *id,
                    error_code::NOT_RESPONDING,
                    "client is not responding",
                );
            }
        }
        next
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.lock().as_ref() {
            let _ = waker.wake();
        }
    }

    /// Stop the session loop; `run()` returns.
    pub fn quit(&self) {
        self.quit_flag.store(true, Ordering::Release);
        self.wake();
    }

    //--------------------------- TCP dispatch ------------------------//

    /// Handle one framed message from a client session. An error closes
    /// the session.
    pub(crate) fn handle_client_message(
        &self,
        client: Id,
        data: &[u8],
    ) -> Result<(), (i32, String)> {
        let msg = OscMessage::parse(data)
            .map_err(|e| (error_code::BAD_FORMAT, e.to_string()))?;
        let (msg_type, _, offset) =
            parse_pattern(msg.address()).map_err(|e| (error_code::BAD_FORMAT, e.to_string()))?;
        if msg_type != MsgType::Server {
            return Err((
                error_code::BAD_FORMAT,
                format!("unexpected message {}", msg.address()),
            ));
        }
        let pattern = &msg.address()[offset..];
        log::debug!("server: client {} message {}", client, pattern);
        if pattern == MSG_LOGIN {
            return self
                .handle_login(client, &msg)
                .map_err(|e| (error_code::BAD_FORMAT, e.to_string()));
        }
        // everything else requires a login first
        let active = self
            .state
            .read()
            .clients
            .get(&client)
            .map(|c| c.active)
            .unwrap_or(false);
        if !active {
            return Err((error_code::NOT_PERMITTED, "not logged in".to_string()));
        }
        let result = match pattern {
            MSG_PING => {
                self.with_client(client, |c| c.send_message(&client_message(MSG_PONG).to_bytes()));
                Ok(())
            }
            MSG_PONG => {
                let now = self.now();
                let mut state = self.state.write();
                if let Some(c) = state.clients.get_mut(&client) {
                    c.ping.pong(now);
                }
                Ok(())
            }
            MSG_GROUP_JOIN => self.handle_group_join(client, &msg),
            MSG_GROUP_LEAVE => self.handle_group_leave(client, &msg),
            MSG_GROUP_UPDATE => self.handle_group_update(client, &msg),
            MSG_USER_UPDATE => self.handle_user_update(client, &msg),
            MSG_REQUEST => self.handle_custom_request(client, &msg),
            _ => {
                return Err((
                    error_code::NOT_IMPLEMENTED,
                    format!("unknown server message {}", pattern),
                ))
            }
        };
        result.map_err(|e| (error_code::BAD_FORMAT, e.to_string()))
    }

    fn with_client<F: FnOnce(&ClientEndpoint)>(&self, client: Id, f: F) {
        if let Some(c) = self.state.read().clients.get(&client) {
            f(c);
        }
    }

    fn send_error(&self, client: Id, token: Id, request: &Request, code: i32, message: &str) {
        let pattern = match request {
            Request::Login(_) => MSG_LOGIN,
            Request::GroupJoin(_) => MSG_GROUP_JOIN,
            Request::GroupLeave { .. } => MSG_GROUP_LEAVE,
            Request::GroupUpdate { .. } => MSG_GROUP_UPDATE,
            Request::UserUpdate { .. } => MSG_USER_UPDATE,
            Request::Custom { .. } => MSG_REQUEST,
        };
        self.with_client(client, |c| {
            let mut w = client_message(pattern);
            w.int32(token).int32(code).string(message);
            c.send_message(&w.to_bytes());
        });
        if let Request::Login(request) = request {
            self.push_event(ServerEvent::ClientLogin {
                client,
                error: code,
                metadata: request.metadata.clone(),
            });
        }
    }

    fn intercept(&self, client: Id, token: Id, request: &Request) -> bool {
        let guard = self.request_handler.lock();
        match guard.as_ref() {
            Some(handler) => handler.handle(client, token, request),
            None => false,
        }
    }

    /// Complete a request that a [`RequestHandler`] deferred. `Err`
    /// produces an error response.
    pub fn handle_request(
        &self,
        client: Id,
        token: Id,
        request: &Request,
        result: Result<&Response, (i32, &str)>,
    ) -> ServerResult<()> {
        if !self.state.read().clients.contains_key(&client) {
            return Err(ServerError::NotFound);
        }
        match result {
            Ok(response) => match (request, response) {
                (Request::Login(req), Response::Login { metadata }) => {
                    self.do_login(client, token, req, metadata.clone())
                }
                (Request::GroupJoin(req), Response::GroupJoin { .. }) => {
                    self.do_group_join(client, token, req, response)
                }
                (Request::GroupLeave { group }, Response::GroupLeave) => {
                    self.do_group_leave(client, token, *group)
                }
                (Request::GroupUpdate { group, .. }, Response::GroupUpdate { metadata }) => {
                    self.do_group_update(client, token, *group, metadata.clone())
                }
                (Request::UserUpdate { group, .. }, Response::UserUpdate { metadata }) => {
                    self.do_user_update(client, token, *group, metadata.clone())
                }
                (Request::Custom { .. }, Response::Custom { data, flags }) => {
                    self.do_custom_request(client, token, data.clone(), *flags)
                }
                _ => Err(ServerError::BadArgument("response does not match request")),
            },
            Err((code, message)) => {
                self.send_error(client, token, request, code, message);
                self.wake();
                Ok(())
            }
        }?;
        self.wake();
        Ok(())
    }

    //--------------------------- login -------------------------------//

    fn handle_login(&self, client: Id, msg: &OscMessage) -> Result<(), WireError> {
        let mut args = msg.args();
        let token = args.int32()?;
        let version = args.string()?.to_string();
        let password = args.string()?.to_string();
        let metadata = args.metadata()?;
        let count = args.int32()?;
        let mut addresses = Vec::new();
        for _ in 0..count {
            let host = args.string()?;
            let port = args.int32()?;
            if let Ok(ip) = host.parse::<IpAddr>() {
                if port > 0 && port <= u16::MAX as i32 {
                    addresses.push(SocketAddr::new(ip, port as u16));
                }
            }
        }
        {
            let mut state = self.state.write();
            if let Some(c) = state.clients.get_mut(&client) {
                c.public_addresses = addresses;
            }
        }

        let request = Request::Login(LoginRequest {
            version: version.clone(),
            password: password.clone(),
            metadata,
        });

        // version handshake: the major number must match
        if !version_compatible(&version) {
            log::debug!("server: client {}: version mismatch", client);
            self.send_error(
                client,
                token,
                &request,
                error_code::VERSION_MISMATCH,
                "incompatible version",
            );
            return Ok(());
        }
        let password_ok = match self.password.lock().as_ref() {
            Some(hash) => *hash == encrypt(&password),
            None => true,
        };
        if !password_ok {
            log::debug!("server: client {}: wrong password", client);
            self.send_error(
                client,
                token,
                &request,
                error_code::WRONG_PASSWORD,
                "wrong password",
            );
            return Ok(());
        }

        if self.intercept(client, token, &request) {
            return Ok(());
        }
        let login = match &request {
            Request::Login(r) => r,
            _ => unreachable!(),
        };
        let _ = self.do_login(client, token, login, None);
        Ok(())
    }

    fn do_login(
        &self,
        client: Id,
        token: Id,
        request: &LoginRequest,
        metadata: Option<Data>,
    ) -> ServerResult<()> {
        let mut state = self.state.write();
        let c = state.clients.get_mut(&client).ok_or(ServerError::NotFound)?;
        c.active = true;
        c.version = request.version.clone();

        let mut flags = 0;
        if self.allow_relay.load(Ordering::Relaxed) {
            flags |= 1; // server relay available
        }
        let mut w = client_message(MSG_LOGIN);
        w.int32(token)
            .int32(error_code::OK)
            .string(VERSION)
            .int32(client)
            .int32(flags)
            .metadata(metadata.as_ref());
        c.send_message(&w.to_bytes());

        self.push_event(ServerEvent::ClientLogin {
            client,
            error: error_code::OK,
            metadata: request.metadata.clone(),
        });
        Ok(())
    }

    //--------------------------- group join --------------------------//

    fn handle_group_join(&self, client: Id, msg: &OscMessage) -> Result<(), WireError> {
        let mut args = msg.args();
        let token = args.int32()?;
        let request = Request::GroupJoin(GroupJoinRequest {
            group_name: args.string()?.to_string(),
            group_password: args.string()?.to_string(),
            group_metadata: args.metadata()?,
            user_name: args.string()?.to_string(),
            user_password: args.string()?.to_string(),
            user_metadata: args.metadata()?,
            relay: args.host()?,
        });
        let req = match &request {
            Request::GroupJoin(r) => r,
            _ => unreachable!(),
        };

        // validate against the current state; the auto-create flags are
        // sampled here, so toggling them mid-join does not affect requests
        // already past validation
        let error = {
            let state = self.state.read();
            match state.groups.values().find(|g| g.name() == req.group_name) {
                Some(grp) => {
                    if !grp.check_password(&req.group_password) {
                        Some((error_code::WRONG_PASSWORD, "wrong group password"))
                    } else {
                        match grp.find_user_by_name(&req.user_name) {
                            Some(usr) => {
                                if usr.active() {
                                    Some((
                                        error_code::USER_ALREADY_EXISTS,
                                        "user already logged in",
                                    ))
                                } else if !usr.check_password(&req.user_password) {
                                    Some((error_code::WRONG_PASSWORD, "wrong user password"))
                                } else {
                                    None
                                }
                            }
                            None => {
                                if grp.user_auto_create() {
                                    None
                                } else {
                                    Some((
                                        error_code::CANNOT_CREATE_USER,
                                        "user auto creation disabled",
                                    ))
                                }
                            }
                        }
                    }
                }
                None => {
                    if self.group_auto_create.load(Ordering::Relaxed) {
                        None
                    } else {
                        Some((
                            error_code::CANNOT_CREATE_GROUP,
                            "group auto creation disabled",
                        ))
                    }
                }
            }
        };
        if let Some((code, message)) = error {
            self.send_error(client, token, &request, code, message);
            return Ok(());
        }

        if self.intercept(client, token, &request) {
            return Ok(());
        }
        let response = Response::default_for(&request);
        let _ = self.do_group_join(client, token, req, &response);
        Ok(())
    }

    fn do_group_join(
        &self,
        client: Id,
        token: Id,
        req: &GroupJoinRequest,
        response: &Response,
    ) -> ServerResult<()> {
        let (resp_group_md, resp_user_md, private_md, resp_relay) = match response {
            Response::GroupJoin {
                group_metadata,
                user_metadata,
                private_metadata,
                relay,
            } => (group_metadata, user_metadata, private_metadata, relay),
            _ => return Err(ServerError::BadArgument("response does not match request")),
        };

        let mut guard = self.state.write();
        let state = &mut *guard;

        // find or create the group
        let mut did_create_group = false;
        let group_id = match state.groups.values().find(|g| g.name() == req.group_name) {
            Some(g) => g.id(),
            None => {
                let id = Self::next_group_id(state);
                // the effective metadata is whatever the response carries,
                // falling back to the request
                let metadata = resp_group_md.clone().or_else(|| req.group_metadata.clone());
                let relay = resp_relay.clone();
                let password = if req.group_password.is_empty() {
                    None
                } else {
                    Some(req.group_password.as_str())
                };
                state
                    .groups
                    .insert(id, Group::new(&req.group_name, password, id, metadata, relay, false));
                did_create_group = true;
                self.push_event(ServerEvent::GroupAdd {
                    group: id,
                    name: req.group_name.clone(),
                });
                id
            }
        };
        let grp = state.groups.get_mut(&group_id).unwrap();

        // find or create the user
        let user_id = match grp.find_user_by_name_mut(&req.user_name) {
            Some(usr) => {
                if usr.active() {
                    drop(guard);
                    let request = Request::GroupJoin(req.clone());
                    self.send_error(
                        client,
                        token,
                        &request,
                        error_code::USER_ALREADY_EXISTS,
                        "user already logged in",
                    );
                    return Ok(());
                }
                usr.set_client(client);
                usr.relay = req.relay.clone();
                usr.id()
            }
            None => {
                let id = grp.get_next_user_id();
                let metadata = resp_user_md.clone().or_else(|| req.user_metadata.clone());
                let password = if req.user_password.is_empty() {
                    None
                } else {
                    Some(req.user_password.as_str())
                };
                let user = User::new(
                    &req.user_name,
                    password,
                    id,
                    group_id,
                    client,
                    metadata,
                    req.relay.clone(),
                    false,
                    did_create_group,
                );
                grp.add_user(user);
                id
            }
        };

        let grp = state.groups.get(&group_id).unwrap();
        let usr = grp.find_user(user_id).unwrap();
        let group_metadata = grp.metadata.clone();
        let user_metadata = usr.metadata.clone();
        let user_name = usr.name().to_string();
        let user_flags = user_flags(usr);

        // prefer the group relay over the global one; both may be unset
        let relay = grp
            .relay
            .clone()
            .or_else(|| self.relay_addr.lock().clone());

        if let Some(c) = state.clients.get_mut(&client) {
            c.on_group_join(group_id, user_id);

            let mut w = client_message(MSG_GROUP_JOIN);
            w.int32(token)
                .int32(error_code::OK)
                .int32(group_id)
                .int32(group_flags(grp))
                .metadata(group_metadata.as_ref())
                .int32(user_id)
                .int32(user_flags)
                .metadata(user_metadata.as_ref())
                .metadata(private_md.as_ref())
                .host(relay.as_ref());
            c.send_message(&w.to_bytes());
        }

        // after the reply: introduce the new member and its peers to each
        // other
        Self::notify_peer_join(state, group_id, user_id, client);

        self.push_event(ServerEvent::GroupJoin {
            group: group_id,
            user: user_id,
            user_name,
        });
        Ok(())
    }

    /// Send `peer/join` both ways between the joiner and every active
    /// member.
    fn notify_peer_join(state: &ServerState, group: Id, user: Id, client: Id) {
        let grp = match state.groups.get(&group) {
            Some(g) => g,
            None => return,
        };
        let usr = match grp.find_user(user) {
            Some(u) => u,
            None => return,
        };
        let joiner = match state.clients.get(&client) {
            Some(c) => c,
            None => return,
        };
        for peer in grp.users() {
            if peer.id() == user || !peer.active() {
                continue;
            }
            if let Some(other) = state.clients.get(&peer.client()) {
                // tell the new member about the existing peer
                joiner.send_message(&peer_join_message(grp, peer, other).to_bytes());
                // tell the existing peer about the new member
                other.send_message(&peer_join_message(grp, usr, joiner).to_bytes());
            } else {
                log::error!("server: no client for user {}", peer.name());
            }
        }
    }

    /// Send `peer/leave` to every other member of the group.
    fn notify_peer_leave(state: &ServerState, group: Id, user: Id) {
        let grp = match state.groups.get(&group) {
            Some(g) => g,
            None => return,
        };
        for peer in grp.users() {
            if peer.id() == user || !peer.active() {
                continue;
            }
            if let Some(other) = state.clients.get(&peer.client()) {
                let mut w = client_message(MSG_PEER_LEAVE);
                w.int32(group).int32(user);
                other.send_message(&w.to_bytes());
            }
        }
    }

    /// Detach a user from its group; persistent users are retained as
    /// inactive, empty non-persistent groups disappear.
    fn do_remove_user_from_group(&self, state: &mut ServerState, group: Id, user: Id) {
        let grp = match state.groups.get_mut(&group) {
            Some(g) => g,
            None => return,
        };
        if let Some(usr) = grp.find_user_mut(user) {
            if usr.persistent() {
                usr.unset();
            } else {
                grp.remove_user(user);
            }
        }
        if !grp.persistent() && grp.user_count() == 0 {
            let name = grp.name().to_string();
            state.groups.remove(&group);
            self.push_event(ServerEvent::GroupRemove { group, name });
        }
    }

    //--------------------------- group leave -------------------------//

    fn handle_group_leave(&self, client: Id, msg: &OscMessage) -> Result<(), WireError> {
        let mut args = msg.args();
        let token = args.int32()?;
        let group = args.int32()?;
        let request = Request::GroupLeave { group };
        if self.intercept(client, token, &request) {
            return Ok(());
        }
        let _ = self.do_group_leave(client, token, group);
        Ok(())
    }

    fn do_group_leave(&self, client: Id, token: Id, group: Id) -> ServerResult<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let request = Request::GroupLeave { group };

        let user = match state.groups.get(&group) {
            Some(grp) => match grp.find_user_for_client(client) {
                Some(u) => (u.id(), u.name().to_string()),
                None => {
                    drop(guard);
                    self.send_error(
                        client,
                        token,
                        &request,
                        error_code::NOT_GROUP_MEMBER,
                        "not a group member",
                    );
                    return Ok(());
                }
            },
            None => {
                drop(guard);
                self.send_error(
                    client,
                    token,
                    &request,
                    error_code::GROUP_DOES_NOT_EXIST,
                    "group does not exist",
                );
                return Ok(());
            }
        };
        let (user_id, user_name) = user;

        Self::notify_peer_leave(state, group, user_id);
        if let Some(c) = state.clients.get_mut(&client) {
            c.on_group_leave(group, user_id);
            let mut w = client_message(MSG_GROUP_LEAVE);
            w.int32(token).int32(error_code::OK);
            c.send_message(&w.to_bytes());
        }
        self.do_remove_user_from_group(state, group, user_id);

        self.push_event(ServerEvent::GroupLeave {
            group,
            user: user_id,
            user_name,
        });
        Ok(())
    }

    //--------------------------- updates -----------------------------//

    fn handle_group_update(&self, client: Id, msg: &OscMessage) -> Result<(), WireError> {
        let mut args = msg.args();
        let token = args.int32()?;
        let group = args.int32()?;
        let metadata = args
            .metadata()?
            .ok_or(WireError::Malformed("missing metadata"))?;
        let request = Request::GroupUpdate {
            group,
            metadata: metadata.clone(),
        };
        if let Some((code, message)) = self.check_membership(client, group) {
            self.send_error(client, token, &request, code, message);
            return Ok(());
        }
        if self.intercept(client, token, &request) {
            return Ok(());
        }
        let _ = self.do_group_update(client, token, group, metadata);
        Ok(())
    }

    fn check_membership(&self, client: Id, group: Id) -> Option<(i32, &'static str)> {
        let state = self.state.read();
        match state.groups.get(&group) {
            Some(grp) => {
                if grp.find_user_for_client(client).is_none() {
                    Some((error_code::NOT_PERMITTED, "not a group member"))
                } else {
                    None
                }
            }
            None => Some((error_code::GROUP_DOES_NOT_EXIST, "group does not exist")),
        }
    }

    fn do_group_update(&self, client: Id, token: Id, group: Id, metadata: Data) -> ServerResult<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let grp = state.groups.get_mut(&group).ok_or(ServerError::NotFound)?;
        let usr = grp
            .find_user_for_client(client)
            .ok_or(ServerError::NotFound)?;
        let user_id = usr.id();
        grp.metadata = Some(metadata.clone());

        for member in grp.users() {
            if member.client() == client {
                continue;
            }
            if let Some(c) = state.clients.get(&member.client()) {
                let mut w = client_message(MSG_GROUP_CHANGED);
                w.int32(group).int32(user_id).metadata(Some(&metadata));
                c.send_message(&w.to_bytes());
            }
        }
        if let Some(c) = state.clients.get(&client) {
            let mut w = client_message(MSG_GROUP_UPDATE);
            w.int32(token)
                .int32(error_code::OK)
                .metadata(Some(&metadata));
            c.send_message(&w.to_bytes());
        }
        self.push_event(ServerEvent::GroupUpdate {
            group,
            user: user_id,
        });
        Ok(())
    }

    fn handle_user_update(&self, client: Id, msg: &OscMessage) -> Result<(), WireError> {
        let mut args = msg.args();
        let token = args.int32()?;
        let group = args.int32()?;
        let metadata = args
            .metadata()?
            .ok_or(WireError::Malformed("missing metadata"))?;
        let request = Request::UserUpdate {
            group,
            metadata: metadata.clone(),
        };
        if let Some((code, message)) = self.check_membership(client, group) {
            self.send_error(client, token, &request, code, message);
            return Ok(());
        }
        if self.intercept(client, token, &request) {
            return Ok(());
        }
        let _ = self.do_user_update(client, token, group, metadata);
        Ok(())
    }

    fn do_user_update(&self, client: Id, token: Id, group: Id, metadata: Data) -> ServerResult<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let grp = state.groups.get_mut(&group).ok_or(ServerError::NotFound)?;
        let usr = grp
            .find_user_for_client_mut(client)
            .ok_or(ServerError::NotFound)?;
        let user_id = usr.id();
        usr.metadata = Some(metadata.clone());

        for member in grp.users() {
            if member.client() == client {
                continue;
            }
            if let Some(c) = state.clients.get(&member.client()) {
                let mut w = client_message(MSG_PEER_CHANGED);
                w.int32(group).int32(user_id).metadata(Some(&metadata));
                c.send_message(&w.to_bytes());
            }
        }
        if let Some(c) = state.clients.get(&client) {
            let mut w = client_message(MSG_USER_UPDATE);
            w.int32(token)
                .int32(error_code::OK)
                .metadata(Some(&metadata));
            c.send_message(&w.to_bytes());
        }
        self.push_event(ServerEvent::UserUpdate {
            group,
            user: user_id,
        });
        Ok(())
    }

    //--------------------------- custom requests ---------------------//

    fn handle_custom_request(&self, client: Id, msg: &OscMessage) -> Result<(), WireError> {
        let mut args = msg.args();
        let token = args.int32()?;
        let flags = args.int32()?;
        let data = args
            .metadata()?
            .ok_or(WireError::Malformed("missing data"))?;
        let request = Request::Custom { data, flags };
        if self.intercept(client, token, &request) {
            return Ok(());
        }
        // custom requests must be handled by the host
        self.send_error(
            client,
            token,
            &request,
            error_code::UNHANDLED_REQUEST,
            "request not handled",
        );
        Ok(())
    }

    fn do_custom_request(&self, client: Id, token: Id, data: Data, flags: i32) -> ServerResult<()> {
        self.with_client(client, |c| {
            let mut w = client_message(MSG_REQUEST);
            w.int32(token)
                .int32(error_code::OK)
                .int32(flags)
                .metadata(Some(&data));
            c.send_message(&w.to_bytes());
        });
        Ok(())
    }

    fn next_group_id(state: &mut ServerState) -> Id {
        let id = state.next_group_id;
        state.next_group_id += 1;
        id
    }

    //--------------------------- UDP surface -------------------------//

    /// Handle one UDP datagram: `/ping`, `/query` or a relay envelope.
    pub fn handle_udp_packet<F: FnMut(&[u8], SocketAddr)>(
        &self,
        data: &[u8],
        from: SocketAddr,
        mut send_fn: F,
    ) {
        if binmsg::is_binary(data) {
            if binmsg::message_type(data) == Some(MsgType::Relay) {
                self.handle_relay_binary(data, from, &mut send_fn);
            } else {
                log::warn!("server: unsupported binary message");
            }
            return;
        }
        let msg = match OscMessage::parse(data) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("server: malformed UDP packet: {}", e);
                return;
            }
        };
        let (msg_type, _, offset) = match parse_pattern(msg.address()) {
            Ok(p) => p,
            Err(_) => {
                log::warn!("server: not an AOO message");
                return;
            }
        };
        match msg_type {
            MsgType::Server => {
                let pattern = &msg.address()[offset..];
                match pattern {
                    MSG_PING => {
                        let w = client_message(MSG_PONG);
                        send_fn(&w.to_bytes(), from);
                    }
                    MSG_QUERY => {
                        // return the unmapped(!) public address
                        let public = unmapped(from);
                        let mut w = client_message(MSG_QUERY);
                        w.string(&public.ip().to_string()).int32(public.port() as i32);
                        send_fn(&w.to_bytes(), from);
                    }
                    _ => log::warn!("server: unknown UDP message {}", pattern),
                }
            }
            MsgType::Relay => self.handle_relay_osc(&msg, from, &mut send_fn),
            _ => log::warn!("server: unexpected UDP message {}", msg.address()),
        }
    }

    /// Mediate the destination address across families; `None` means the
    /// packet cannot be relayed.
    fn check_relay_addr(&self, mut addr: SocketAddr) -> Option<SocketAddr> {
        if is_ipv4_mapped(&addr) {
            log::debug!("server: relay destination must not be IPv4-mapped");
            return None;
        }
        let config = self.udp_config.lock();
        match (config.family, addr.is_ipv4()) {
            (AddressFamily::Ipv6, true) => {
                if config.ipv4_mapped {
                    addr = ipv4_mapped(addr);
                } else {
                    log::debug!("server: cannot relay to IPv4 address {}", addr);
                    return None;
                }
            }
            (AddressFamily::Ipv4, false) => {
                log::debug!("server: cannot relay to IPv6 address {}", addr);
                return None;
            }
            _ => {}
        }
        Some(addr)
    }

    fn handle_relay_binary<F: FnMut(&[u8], SocketAddr)>(
        &self,
        data: &[u8],
        from: SocketAddr,
        send_fn: &mut F,
    ) {
        if !self.allow_relay.load(Ordering::Relaxed) {
            log::debug!("server: ignore relay message from {}", from);
            return;
        }
        let (dst, payload) = match binmsg::read_relay(data) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("server: bad relay message: {}", e);
                return;
            }
        };
        let dst = match self.check_relay_addr(dst) {
            Some(a) => a,
            None => return,
        };
        // rewrite the envelope so the destination sees the true origin
        // while the datagram itself comes from the relay
        let src = unmapped(from);
        let mut buf = Vec::with_capacity(binmsg::RELAY_HEADER_SIZE + payload.len());
        binmsg::write_relay(&mut buf, src, payload);
        send_fn(&buf, dst);
    }

    fn handle_relay_osc<F: FnMut(&[u8], SocketAddr)>(
        &self,
        msg: &OscMessage,
        from: SocketAddr,
        send_fn: &mut F,
    ) {
        if !self.allow_relay.load(Ordering::Relaxed) {
            log::debug!("server: ignore relay message from {}", from);
            return;
        }
        let mut parse = || -> Result<(SocketAddr, Vec<u8>), WireError> {
            let mut args = msg.args();
            let host = args.string()?;
            let port = args.int32()?;
            let payload = args.blob()?.to_vec();
            let ip: IpAddr = host
                .parse()
                .map_err(|_| WireError::Malformed("bad relay address"))?;
            if port <= 0 || port > u16::MAX as i32 {
                return Err(WireError::Malformed("bad relay port"));
            }
            Ok((SocketAddr::new(ip, port as u16), payload))
        };
        let (dst, payload) = match parse() {
            Ok(r) => r,
            Err(e) => {
                log::warn!("server: bad relay message: {}", e);
                return;
            }
        };
        let dst = match self.check_relay_addr(dst) {
            Some(a) => a,
            None => return,
        };
        let src = unmapped(from);
        let mut w = OscWriter::new(format!("{}{}", aoo_wire::MSG_DOMAIN, "/relay"));
        w.string(&src.ip().to_string())
            .int32(src.port() as i32)
            .blob(&payload);
        send_fn(&w.to_bytes(), dst);
    }
}

//----------------------------- helpers -------------------------------//

fn client_message(pattern: &str) -> OscWriter {
    OscWriter::new(format!("{}/client{}", aoo_wire::MSG_DOMAIN, pattern))
}

fn version_compatible(version: &str) -> bool {
    let major = |v: &str| v.split('.').next().map(|s| s.to_string());
    major(version) == major(VERSION)
}

fn group_flags(group: &Group) -> i32 {
    let mut flags = 0;
    if group.persistent() {
        flags |= 1;
    }
    flags
}

fn user_flags(user: &User) -> i32 {
    let mut flags = 0;
    if user.group_creator() {
        flags |= 1;
    }
    if user.persistent() {
        flags |= 2;
    }
    flags
}

fn peer_join_message(group: &Group, user: &User, client: &ClientEndpoint) -> OscWriter {
    let mut w = client_message(MSG_PEER_JOIN);
    w.string(group.name())
        .int32(group.id())
        .string(user.name())
        .int32(user.id())
        .string(&client.version)
        .int32(user_flags(user))
        .metadata(user.metadata.as_ref())
        .host(user.relay.as_ref());
    w.int32(client.public_addresses.len() as i32);
    for addr in &client.public_addresses {
        w.string(&addr.ip().to_string()).int32(addr.port() as i32);
    }
    w
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login_message(token: Id, user_version: &str, password: &str) -> Vec<u8> {
        let mut w = OscWriter::new("/aoo/server/login");
        w.int32(token)
            .string(user_version)
            .string(password)
            .metadata(None)
            .int32(1)
            .string("192.168.1.10")
            .int32(9998);
        w.to_bytes()
    }

    fn join_message(token: Id, group: &str, user: &str) -> Vec<u8> {
        let mut w = OscWriter::new("/aoo/server/group/join");
        w.int32(token)
            .string(group)
            .string("")
            .metadata(None)
            .string(user)
            .string("")
            .metadata(None)
            .host(None);
        w.to_bytes()
    }

    fn leave_message(token: Id, group: Id) -> Vec<u8> {
        let mut w = OscWriter::new("/aoo/server/group/leave");
        w.int32(token).int32(group);
        w.to_bytes()
    }

    /// Drain a client's reply channel into unframed OSC messages.
    fn drain(rx: &Receiver<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Ok(framed) = rx.try_recv() {
            assert!(framed.len() >= 4);
            let size = i32::from_be_bytes(framed[..4].try_into().unwrap()) as usize;
            assert_eq!(size + 4, framed.len());
            out.push(framed[4..].to_vec());
        }
        out
    }

    fn addresses(msgs: &[Vec<u8>]) -> Vec<String> {
        msgs.iter()
            .map(|m| OscMessage::parse(m).unwrap().address().to_string())
            .collect()
    }

    fn login(server: &Server) -> (Id, Receiver<Vec<u8>>) {
        let (tx, rx) = unbounded();
        let id = server.add_client(tx);
        server
            .handle_client_message(id, &login_message(1, VERSION, ""))
            .unwrap();
        let replies = drain(&rx);
        assert_eq!(addresses(&replies), vec!["/aoo/client/login"]);
        let msg = OscMessage::parse(&replies[0]).unwrap();
        let mut args = msg.args();
        assert_eq!(args.int32().unwrap(), 1); // token
        assert_eq!(args.int32().unwrap(), error_code::OK);
        (id, rx)
    }

    #[test]
    fn test_login_requires_matching_version() {
        let server = Server::new();
        let (tx, rx) = unbounded();
        let id = server.add_client(tx);
        server
            .handle_client_message(id, &login_message(7, "1.0.0", ""))
            .unwrap();
        let replies = drain(&rx);
        let msg = OscMessage::parse(&replies[0]).unwrap();
        let mut args = msg.args();
        assert_eq!(args.int32().unwrap(), 7);
        assert_eq!(args.int32().unwrap(), error_code::VERSION_MISMATCH);

        let mut login_errors = 0;
        server.poll_events(|e| {
            if let ServerEvent::ClientLogin { error, .. } = e {
                assert_eq!(error, error_code::VERSION_MISMATCH);
                login_errors += 1;
            }
        });
        assert_eq!(login_errors, 1);
    }

    #[test]
    fn test_wrong_password_rejected() {
        let server = Server::new();
        server.set_password(Some("sesame"));
        let (tx, rx) = unbounded();
        let id = server.add_client(tx);
        server
            .handle_client_message(id, &login_message(2, VERSION, "wrong"))
            .unwrap();
        let replies = drain(&rx);
        let msg = OscMessage::parse(&replies[0]).unwrap();
        let mut args = msg.args();
        assert_eq!(args.int32().unwrap(), 2);
        assert_eq!(args.int32().unwrap(), error_code::WRONG_PASSWORD);

        // a correct password passes
        server
            .handle_client_message(id, &login_message(3, VERSION, "sesame"))
            .unwrap();
        let replies = drain(&rx);
        let mut args = OscMessage::parse(&replies[0]).unwrap().args();
        assert_eq!(args.int32().unwrap(), 3);
        assert_eq!(args.int32().unwrap(), error_code::OK);
    }

    #[test]
    fn test_messages_before_login_not_permitted() {
        let server = Server::new();
        let (tx, _rx) = unbounded();
        let id = server.add_client(tx);
        let err = server
            .handle_client_message(id, &join_message(1, "g", "u"))
            .unwrap_err();
        assert_eq!(err.0, error_code::NOT_PERMITTED);
    }

    #[test]
    fn test_group_join_symmetry() {
        let server = Server::new();
        let (a, rx_a) = login(&server);
        let (b, rx_b) = login(&server);
        assert_eq!(server.client_count(), 2);

        server
            .handle_client_message(a, &join_message(10, "band", "alice"))
            .unwrap();
        let replies = drain(&rx_a);
        // only the join reply: nobody else in the group yet
        assert_eq!(addresses(&replies), vec!["/aoo/client/group/join"]);
        let mut args = OscMessage::parse(&replies[0]).unwrap().args();
        assert_eq!(args.int32().unwrap(), 10);
        assert_eq!(args.int32().unwrap(), error_code::OK);
        let group_id = args.int32().unwrap();

        server
            .handle_client_message(b, &join_message(11, "band", "bob"))
            .unwrap();
        // B gets the reply plus peer_join(alice)
        let replies_b = drain(&rx_b);
        assert_eq!(
            addresses(&replies_b),
            vec!["/aoo/client/group/join", "/aoo/client/peer/join"]
        );
        // A gets peer_join(bob)
        let replies_a = drain(&rx_a);
        assert_eq!(addresses(&replies_a), vec!["/aoo/client/peer/join"]);
        let mut args = OscMessage::parse(&replies_a[0]).unwrap().args();
        assert_eq!(args.string().unwrap(), "band");
        assert_eq!(args.int32().unwrap(), group_id);
        assert_eq!(args.string().unwrap(), "bob");

        // events: 2 logins, 1 group add, 2 joins
        let mut logins = 0;
        let mut adds = 0;
        let mut joins = 0;
        server.poll_events(|e| match e {
            ServerEvent::ClientLogin { error, .. } => {
                assert_eq!(error, error_code::OK);
                logins += 1;
            }
            ServerEvent::GroupAdd { name, .. } => {
                assert_eq!(name, "band");
                adds += 1;
            }
            ServerEvent::GroupJoin { .. } => joins += 1,
            _ => {}
        });
        assert_eq!((logins, adds, joins), (2, 1, 2));

        // disconnect A: B sees exactly one peer_leave
        server.on_client_disconnect(a, error_code::OK, "");
        let replies_b = drain(&rx_b);
        assert_eq!(addresses(&replies_b), vec!["/aoo/client/peer/leave"]);
    }

    #[test]
    fn test_duplicate_active_user_rejected() {
        let server = Server::new();
        let (a, _rx_a) = login(&server);
        let (b, rx_b) = login(&server);
        server
            .handle_client_message(a, &join_message(1, "g", "alice"))
            .unwrap();
        server
            .handle_client_message(b, &join_message(2, "g", "alice"))
            .unwrap();
        let replies = drain(&rx_b);
        let mut args = OscMessage::parse(&replies[0]).unwrap().args();
        assert_eq!(args.int32().unwrap(), 2);
        assert_eq!(args.int32().unwrap(), error_code::USER_ALREADY_EXISTS);
    }

    #[test]
    fn test_group_auto_create_toggle() {
        let server = Server::new();
        server.set_group_auto_create(false);
        let (a, rx_a) = login(&server);
        server
            .handle_client_message(a, &join_message(5, "nope", "alice"))
            .unwrap();
        let replies = drain(&rx_a);
        let mut args = OscMessage::parse(&replies[0]).unwrap().args();
        assert_eq!(args.int32().unwrap(), 5);
        assert_eq!(args.int32().unwrap(), error_code::CANNOT_CREATE_GROUP);

        // pre-provisioned groups can still be joined
        let gid = server.add_group("fixed", None, None, None).unwrap();
        server
            .handle_client_message(a, &join_message(6, "fixed", "alice"))
            .unwrap();
        let replies = drain(&rx_a);
        let mut args = OscMessage::parse(&replies[0]).unwrap().args();
        assert_eq!(args.int32().unwrap(), 6);
        assert_eq!(args.int32().unwrap(), error_code::OK);
        assert_eq!(args.int32().unwrap(), gid);
    }

    #[test]
    fn test_user_auto_create_disabled() {
        let server = Server::new();
        let gid = server.add_group("members-only", None, None, None).unwrap();
        server.add_user_to_group(gid, "insider", None, None).unwrap();
        server.set_group_user_auto_create(gid, false).unwrap();

        let (a, rx_a) = login(&server);
        server
            .handle_client_message(a, &join_message(1, "members-only", "outsider"))
            .unwrap();
        let replies = drain(&rx_a);
        let mut args = OscMessage::parse(&replies[0]).unwrap().args();
        assert_eq!(args.int32().unwrap(), 1);
        assert_eq!(args.int32().unwrap(), error_code::CANNOT_CREATE_USER);

        // provisioned users still get in
        server
            .handle_client_message(a, &join_message(2, "members-only", "insider"))
            .unwrap();
        let replies = drain(&rx_a);
        let mut args = OscMessage::parse(&replies[0]).unwrap().args();
        assert_eq!(args.int32().unwrap(), 2);
        assert_eq!(args.int32().unwrap(), error_code::OK);
    }

    #[test]
    fn test_group_lifecycle() {
        let server = Server::new();
        let (a, rx_a) = login(&server);
        server
            .handle_client_message(a, &join_message(1, "g", "alice"))
            .unwrap();
        assert_eq!(server.group_count(), 1);
        let gid = server.find_group("g").unwrap();

        server
            .handle_client_message(a, &leave_message(2, gid))
            .unwrap();
        let replies = drain(&rx_a);
        assert_eq!(addresses(&replies), vec![
            "/aoo/client/group/join",
            "/aoo/client/group/leave"
        ]);
        // the empty non-persistent group disappears
        assert_eq!(server.group_count(), 0);
        let mut removed = 0;
        server.poll_events(|e| {
            if let ServerEvent::GroupRemove { name, .. } = e {
                assert_eq!(name, "g");
                removed += 1;
            }
        });
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_persistent_entities_survive() {
        let server = Server::new();
        let gid = server.add_group("studio", Some("pwd"), None, None).unwrap();
        let uid = server
            .add_user_to_group(gid, "engineer", None, None)
            .unwrap();

        let (a, rx_a) = login(&server);
        let mut w = OscWriter::new("/aoo/server/group/join");
        w.int32(1)
            .string("studio")
            .string("pwd")
            .metadata(None)
            .string("engineer")
            .string("")
            .metadata(None)
            .host(None);
        server.handle_client_message(a, &w.to_bytes()).unwrap();
        let replies = drain(&rx_a);
        let mut args = OscMessage::parse(&replies[0]).unwrap().args();
        assert_eq!(args.int32().unwrap(), 1);
        assert_eq!(args.int32().unwrap(), error_code::OK);
        assert_eq!(args.int32().unwrap(), gid);
        args.int32().unwrap(); // group flags
        args.metadata().unwrap();
        assert_eq!(args.int32().unwrap(), uid);

        // leaving deactivates but keeps both group and user
        server
            .handle_client_message(a, &leave_message(2, gid))
            .unwrap();
        assert_eq!(server.group_count(), 1);
        assert_eq!(server.find_user_in_group(gid, "engineer"), Some(uid));
    }

    #[test]
    fn test_custom_request_unhandled() {
        let server = Server::new();
        let (a, rx_a) = login(&server);
        let mut w = OscWriter::new("/aoo/server/request");
        w.int32(9).int32(0).metadata(Some(&Data::new(1, vec![1, 2])));
        server.handle_client_message(a, &w.to_bytes()).unwrap();
        let replies = drain(&rx_a);
        let mut args = OscMessage::parse(&replies[0]).unwrap().args();
        assert_eq!(args.int32().unwrap(), 9);
        assert_eq!(args.int32().unwrap(), error_code::UNHANDLED_REQUEST);
    }

    #[test]
    fn test_deferred_request_completion() {
        struct Defer;
        impl RequestHandler for Defer {
            fn handle(&self, _client: Id, _token: Id, request: &Request) -> bool {
                matches!(request, Request::Custom { .. })
            }
        }
        let server = Server::new();
        server.set_request_handler(Some(Box::new(Defer)));
        let (a, rx_a) = login(&server);
        let mut w = OscWriter::new("/aoo/server/request");
        w.int32(4).int32(0).metadata(Some(&Data::new(1, vec![5])));
        server.handle_client_message(a, &w.to_bytes()).unwrap();
        // deferred: no reply yet
        assert!(drain(&rx_a).is_empty());

        // the host completes the request later
        let request = Request::Custom {
            data: Data::new(1, vec![5]),
            flags: 0,
        };
        let response = Response::Custom {
            data: Data::new(2, vec![6, 7]),
            flags: 0,
        };
        server
            .handle_request(a, 4, &request, Ok(&response))
            .unwrap();
        let replies = drain(&rx_a);
        let mut args = OscMessage::parse(&replies[0]).unwrap().args();
        assert_eq!(args.int32().unwrap(), 4);
        assert_eq!(args.int32().unwrap(), error_code::OK);
        assert_eq!(args.int32().unwrap(), 0); // flags
        assert_eq!(args.metadata().unwrap(), Some(Data::new(2, vec![6, 7])));
    }

    #[test]
    fn test_notifications() {
        let server = Server::new();
        let (a, rx_a) = login(&server);
        let (_b, rx_b) = login(&server);
        server
            .handle_client_message(a, &join_message(1, "g", "alice"))
            .unwrap();
        drain(&rx_a);
        let gid = server.find_group("g").unwrap();

        server.notify_client(a, Data::new(1, vec![1])).unwrap();
        server
            .notify_group(gid, aoo_wire::ID_ALL, Data::new(2, vec![2]))
            .unwrap();
        server.dispatch_notifications();

        let replies = drain(&rx_a);
        assert_eq!(
            addresses(&replies),
            vec!["/aoo/client/message", "/aoo/client/message"]
        );
        // B is not in the group and gets nothing
        assert!(drain(&rx_b).is_empty());
    }

    #[test]
    fn test_udp_ping_and_query() {
        let server = Server::new();
        let from: SocketAddr = "[::ffff:10.1.2.3]:7777".parse().unwrap();
        let mut sent: Vec<(Vec<u8>, SocketAddr)> = Vec::new();

        let ping = OscWriter::new("/aoo/server/ping").to_bytes();
        server.handle_udp_packet(&ping, from, |d, a| sent.push((d.to_vec(), a)));
        let query = OscWriter::new("/aoo/server/query").to_bytes();
        server.handle_udp_packet(&query, from, |d, a| sent.push((d.to_vec(), a)));

        assert_eq!(sent.len(), 2);
        let pong = OscMessage::parse(&sent[0].0).unwrap();
        assert_eq!(pong.address(), "/aoo/client/pong");
        let reply = OscMessage::parse(&sent[1].0).unwrap();
        assert_eq!(reply.address(), "/aoo/client/query");
        let mut args = reply.args();
        // the reported address is unmapped
        assert_eq!(args.string().unwrap(), "10.1.2.3");
        assert_eq!(args.int32().unwrap(), 7777);
    }

    #[test]
    fn test_relay_rewrites_source() {
        let server = Server::new();
        let a: SocketAddr = "10.0.0.1:5001".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:5002".parse().unwrap();
        let inner = b"media datagram";

        let mut envelope = Vec::new();
        binmsg::write_relay(&mut envelope, b, inner);

        // relaying is off by default
        let mut sent: Vec<(Vec<u8>, SocketAddr)> = Vec::new();
        server.handle_udp_packet(&envelope, a, |d, addr| sent.push((d.to_vec(), addr)));
        assert!(sent.is_empty());

        server.set_server_relay(true);
        server.handle_udp_packet(&envelope, a, |d, addr| sent.push((d.to_vec(), addr)));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, b);
        let (src, payload) = binmsg::read_relay(&sent[0].0).unwrap();
        assert_eq!(src, a);
        assert_eq!(payload, inner);
    }

    #[test]
    fn test_relay_family_mediation() {
        let server = Server::new();
        server.set_server_relay(true);
        server.set_udp_family(AddressFamily::Ipv6, true);
        let a: SocketAddr = "[2001:db8::1]:6001".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:6002".parse().unwrap();

        let mut envelope = Vec::new();
        binmsg::write_relay(&mut envelope, b, b"x");
        let mut sent: Vec<(Vec<u8>, SocketAddr)> = Vec::new();
        server.handle_udp_packet(&envelope, a, |d, addr| sent.push((d.to_vec(), addr)));
        // IPv4 destination mapped into IPv6
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.is_ipv6());
        assert_eq!(unmapped(sent[0].1), b);

        // without the mapping the packet is dropped
        server.set_udp_family(AddressFamily::Ipv6, false);
        sent.clear();
        server.handle_udp_packet(&envelope, a, |d, addr| sent.push((d.to_vec(), addr)));
        assert!(sent.is_empty());
    }

    #[test]
    fn test_remove_group_ejects_members() {
        let server = Server::new();
        let (a, rx_a) = login(&server);
        server
            .handle_client_message(a, &join_message(1, "g", "alice"))
            .unwrap();
        drain(&rx_a);
        let gid = server.find_group("g").unwrap();
        server.remove_group(gid).unwrap();
        let replies = drain(&rx_a);
        assert_eq!(addresses(&replies), vec!["/aoo/client/group/eject"]);
        assert_eq!(server.group_count(), 0);
    }
}
