//! Server-side entities: groups, users and client sessions.
//!
//! Ownership is strictly hierarchical: the server owns groups and client
//! endpoints, groups own their users. Users reference their client by id
//! and clients track their memberships as id pairs, so there is no cyclic
//! ownership anywhere.

use std::net::SocketAddr;

use crossbeam_channel::Sender;
use sha2::{Digest, Sha256};

use aoo_wire::framing::write_frame;
use aoo_wire::{Data, Id, IpHost, ID_INVALID};

use crate::ping::PingTimer;

/// Hash a password for storage/comparison. Passwords never live in memory
/// as plain text beyond the request scope.
pub(crate) fn encrypt(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GroupUser {
    pub group: Id,
    pub user: Id,
}

//------------------------------- user --------------------------------//

#[derive(Debug)]
pub struct User {
    id: Id,
    name: String,
    pwd_hash: Option<String>,
    group: Id,
    /// owning client, `ID_INVALID` while inactive
    client: Id,
    pub(crate) metadata: Option<Data>,
    pub(crate) relay: Option<IpHost>,
    persistent: bool,
    group_creator: bool,
}

impl User {
    pub(crate) fn new(
        name: impl Into<String>,
        password: Option<&str>,
        id: Id,
        group: Id,
        client: Id,
        metadata: Option<Data>,
        relay: Option<IpHost>,
        persistent: bool,
        group_creator: bool,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            pwd_hash: password.map(encrypt),
            group,
            client,
            metadata,
            relay,
            persistent,
            group_creator,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> Id {
        self.group
    }

    pub fn client(&self) -> Id {
        self.client
    }

    pub fn active(&self) -> bool {
        self.client != ID_INVALID
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn group_creator(&self) -> bool {
        self.group_creator
    }

    pub(crate) fn set_client(&mut self, client: Id) {
        self.client = client;
    }

    /// Deactivate a persistent user on leave/disconnect.
    pub(crate) fn unset(&mut self) {
        self.client = ID_INVALID;
        self.relay = None;
    }

    pub(crate) fn check_password(&self, password: &str) -> bool {
        match &self.pwd_hash {
            Some(hash) => *hash == encrypt(password),
            None => true,
        }
    }
}

//------------------------------- group -------------------------------//

#[derive(Debug)]
pub struct Group {
    id: Id,
    name: String,
    pwd_hash: Option<String>,
    /// insertion order is the join order
    users: Vec<User>,
    pub(crate) metadata: Option<Data>,
    pub(crate) relay: Option<IpHost>,
    persistent: bool,
    user_auto_create: bool,
    next_user_id: Id,
}

impl Group {
    pub(crate) fn new(
        name: impl Into<String>,
        password: Option<&str>,
        id: Id,
        metadata: Option<Data>,
        relay: Option<IpHost>,
        persistent: bool,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            pwd_hash: password.map(encrypt),
            users: Vec::new(),
            metadata,
            relay,
            persistent,
            user_auto_create: true,
            next_user_id: 0,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn user_auto_create(&self) -> bool {
        self.user_auto_create
    }

    pub(crate) fn set_user_auto_create(&mut self, allowed: bool) {
        self.user_auto_create = allowed;
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub(crate) fn users(&self) -> impl Iterator<Item = &User> {
        self.users.iter()
    }

    pub(crate) fn check_password(&self, password: &str) -> bool {
        match &self.pwd_hash {
            Some(hash) => *hash == encrypt(password),
            None => true,
        }
    }

    pub(crate) fn add_user(&mut self, user: User) -> Option<&mut User> {
        if self.find_user_by_name(&user.name).is_some() {
            return None;
        }
        self.users.push(user);
        self.users.last_mut()
    }

    pub(crate) fn find_user(&self, id: Id) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    pub(crate) fn find_user_mut(&mut self, id: Id) -> Option<&mut User> {
        self.users.iter_mut().find(|u| u.id == id)
    }

    pub(crate) fn find_user_by_name(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.name == name)
    }

    pub(crate) fn find_user_by_name_mut(&mut self, name: &str) -> Option<&mut User> {
        self.users.iter_mut().find(|u| u.name == name)
    }

    pub(crate) fn find_user_for_client(&self, client: Id) -> Option<&User> {
        self.users.iter().find(|u| u.client == client)
    }

    pub(crate) fn find_user_for_client_mut(&mut self, client: Id) -> Option<&mut User> {
        self.users.iter_mut().find(|u| u.client == client)
    }

    pub(crate) fn remove_user(&mut self, id: Id) -> bool {
        let before = self.users.len();
        self.users.retain(|u| u.id != id);
        self.users.len() != before
    }

    /// Reclaim the lowest free user id before minting a new one.
    pub(crate) fn get_next_user_id(&mut self) -> Id {
        for id in 0..self.next_user_id {
            if self.find_user(id).is_none() {
                return id;
            }
        }
        let id = self.next_user_id;
        self.next_user_id += 1;
        id
    }
}

//--------------------------- client session --------------------------//

pub(crate) struct ClientEndpoint {
    id: Id,
    /// outgoing TCP bytes, drained by the session loop
    reply: Sender<Vec<u8>>,
    pub(crate) public_addresses: Vec<SocketAddr>,
    pub(crate) version: String,
    /// logged in
    pub(crate) active: bool,
    pub(crate) memberships: Vec<GroupUser>,
    pub(crate) ping: PingTimer,
}

impl ClientEndpoint {
    pub fn new(id: Id, reply: Sender<Vec<u8>>, now: f64) -> Self {
        Self {
            id,
            reply,
            public_addresses: Vec::new(),
            version: String::new(),
            active: false,
            memberships: Vec::new(),
            ping: PingTimer::new(now),
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// Queue one OSC message, framed with the length prefix.
    pub fn send_message(&self, msg: &[u8]) {
        let mut framed = Vec::with_capacity(msg.len() + 4);
        write_frame(&mut framed, msg);
        if self.reply.send(framed).is_err() {
            log::warn!("client {}: reply channel closed", self.id);
        }
    }

    pub fn on_group_join(&mut self, group: Id, user: Id) {
        let gu = GroupUser { group, user };
        if !self.memberships.contains(&gu) {
            self.memberships.push(gu);
        }
    }

    pub fn on_group_leave(&mut self, group: Id, user: Id) {
        self.memberships
            .retain(|gu| !(gu.group == group && gu.user == user));
    }
}
