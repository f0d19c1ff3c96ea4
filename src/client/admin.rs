//! Admin protocol: login, session authentication, users and roles
//!
//! Messages are proto type 2 with a 16-byte admin header (command at byte 2,
//! field count at byte 3) followed by `[len+1][id][data]` fields. Passwords
//! are bcrypt-hashed with a fixed salt before they leave the client.

use std::time::{Duration, Instant};

use base64::alphabet;
use base64::engine::{general_purpose, DecodePaddingMode, Engine, GeneralPurpose};
use tracing::debug;

use super::connection::Connection;
use crate::command::buffer::{proto_header, AS_ADMIN_MESSAGE_TYPE, PROTO_HEADER_SIZE};
use crate::command::parser::MessageReader;
use crate::config::{AuthMode, ClientPolicy};
use crate::utils::{ConnectionError, Error, Result, ResultCode};

const ADMIN_HEADER_SIZE: usize = 16;

// Commands
const AUTHENTICATE: u8 = 0;
const CREATE_USER: u8 = 1;
const DROP_USER: u8 = 2;
const SET_PASSWORD: u8 = 3;
const CHANGE_PASSWORD: u8 = 4;
const GRANT_ROLES: u8 = 5;
const REVOKE_ROLES: u8 = 6;
const QUERY_USERS: u8 = 9;
const CREATE_ROLE: u8 = 10;
const DROP_ROLE: u8 = 11;
const GRANT_PRIVILEGES: u8 = 12;
const REVOKE_PRIVILEGES: u8 = 13;
const SET_WHITELIST: u8 = 14;
const SET_QUOTAS: u8 = 15;
const QUERY_ROLES: u8 = 16;
const LOGIN: u8 = 20;

// Field ids
const USER: u8 = 0;
const PASSWORD: u8 = 1;
const OLD_PASSWORD: u8 = 2;
const CREDENTIAL: u8 = 3;
const CLEAR_PASSWORD: u8 = 4;
const SESSION_TOKEN: u8 = 5;
const SESSION_TTL: u8 = 6;
const ROLES: u8 = 10;
const ROLE: u8 = 11;
const PRIVILEGES: u8 = 12;
const WHITELIST: u8 = 13;
const READ_QUOTA: u8 = 14;
const WRITE_QUOTA: u8 = 15;
const READ_INFO: u8 = 16;
const WRITE_INFO: u8 = 17;
const CONNECTIONS: u8 = 18;

/// Result code that ends a multi-message query reply.
const QUERY_END: u8 = 50;

const BCRYPT_SALT: &str = "7EqJtq98hPqEX7fNZaFWoO";
const BCRYPT_COST: u32 = 10;

/// Hash a password the way the server stores it.
pub fn hash_password(password: &str) -> Result<String> {
    let engine = GeneralPurpose::new(
        &alphabet::BCRYPT,
        general_purpose::NO_PAD
            .with_decode_allow_trailing_bits(true)
            .with_decode_padding_mode(DecodePaddingMode::Indifferent),
    );
    let decoded = engine
        .decode(BCRYPT_SALT)
        .map_err(|e| Error::parameter(format!("invalid bcrypt salt: {}", e)))?;
    let mut salt = [0u8; 16];
    if decoded.len() < salt.len() {
        return Err(Error::parameter("invalid bcrypt salt length"));
    }
    salt.copy_from_slice(&decoded[..16]);
    let parts = bcrypt::hash_with_salt(password, BCRYPT_COST, salt)
        .map_err(|e| Error::parameter(format!("password hash failed: {}", e)))?;
    Ok(parts.format_for_version(bcrypt::Version::TwoA))
}

/// Session token issued by a login
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub token: Vec<u8>,
    /// When the token must be refreshed; `None` for tokens without a TTL
    pub expiration: Option<Instant>,
}

impl SessionToken {
    /// Whether the token expires before `now + margin`.
    pub fn expires_within(&self, margin: Duration) -> bool {
        match self.expiration {
            Some(exp) => Instant::now() + margin >= exp,
            None => false,
        }
    }
}

/// Privilege kind; codes below 10 are global only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrivilegeCode {
    UserAdmin = 0,
    SysAdmin = 1,
    DataAdmin = 2,
    UdfAdmin = 3,
    SIndexAdmin = 4,
    Read = 10,
    ReadWrite = 11,
    ReadWriteUdf = 12,
    Write = 13,
    Truncate = 14,
}

impl PrivilegeCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use PrivilegeCode::*;
        Some(match v {
            0 => UserAdmin,
            1 => SysAdmin,
            2 => DataAdmin,
            3 => UdfAdmin,
            4 => SIndexAdmin,
            10 => Read,
            11 => ReadWrite,
            12 => ReadWriteUdf,
            13 => Write,
            14 => Truncate,
            _ => return None,
        })
    }

    /// Whether the privilege may be scoped to a namespace and set.
    pub fn can_scope(&self) -> bool {
        (*self as u8) >= 10
    }
}

/// A privilege, optionally scoped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Privilege {
    pub code: PrivilegeCode,
    pub namespace: String,
    pub set_name: String,
}

impl Privilege {
    pub fn new(code: PrivilegeCode) -> Self {
        Self {
            code,
            namespace: String::new(),
            set_name: String::new(),
        }
    }

    pub fn scoped(code: PrivilegeCode, namespace: impl Into<String>, set_name: impl Into<String>) -> Self {
        Self {
            code,
            namespace: namespace.into(),
            set_name: set_name.into(),
        }
    }
}

/// User as reported by the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub user: String,
    pub roles: Vec<String>,
    pub read_info: Vec<u32>,
    pub write_info: Vec<u32>,
    pub conns_in_use: u32,
}

/// Role as reported by the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    pub privileges: Vec<Privilege>,
    pub whitelist: Vec<String>,
    pub read_quota: u32,
    pub write_quota: u32,
}

/// Admin message under construction
struct AdminMessage {
    data: Vec<u8>,
}

impl AdminMessage {
    fn new(command: u8, field_count: u8) -> Self {
        let mut data = vec![0u8; PROTO_HEADER_SIZE + ADMIN_HEADER_SIZE];
        data[PROTO_HEADER_SIZE + 2] = command;
        data[PROTO_HEADER_SIZE + 3] = field_count;
        Self { data }
    }

    fn field_header(&mut self, id: u8, size: usize) {
        self.data.extend_from_slice(&((size + 1) as u32).to_be_bytes());
        self.data.push(id);
    }

    fn field_str(&mut self, id: u8, s: &str) {
        self.field_bytes(id, s.as_bytes());
    }

    fn field_bytes(&mut self, id: u8, b: &[u8]) {
        self.field_header(id, b.len());
        self.data.extend_from_slice(b);
    }

    fn field_u32(&mut self, id: u8, v: u32) {
        self.field_header(id, 4);
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    fn field_roles(&mut self, roles: &[&str]) {
        let size = 1 + roles.iter().map(|r| r.len() + 1).sum::<usize>();
        self.field_header(ROLES, size);
        self.data.push(roles.len() as u8);
        for role in roles {
            self.data.push(role.len() as u8);
            self.data.extend_from_slice(role.as_bytes());
        }
    }

    fn field_privileges(&mut self, privileges: &[Privilege]) -> Result<()> {
        validate_privileges(privileges)?;
        let mut body = vec![privileges.len() as u8];
        for p in privileges {
            body.push(p.code as u8);
            if p.code.can_scope() {
                body.push(p.namespace.len() as u8);
                body.extend_from_slice(p.namespace.as_bytes());
                body.push(p.set_name.len() as u8);
                body.extend_from_slice(p.set_name.as_bytes());
            }
        }
        self.field_bytes(PRIVILEGES, &body);
        Ok(())
    }

    fn finish(mut self) -> Vec<u8> {
        let size = self.data.len() - PROTO_HEADER_SIZE;
        self.data[..PROTO_HEADER_SIZE].copy_from_slice(&proto_header(size, AS_ADMIN_MESSAGE_TYPE));
        self.data
    }
}

/// Reject scopes the server would refuse: global privileges with a
/// namespace or set, and a set without a namespace.
pub fn validate_privileges(privileges: &[Privilege]) -> Result<()> {
    for p in privileges {
        if p.code.can_scope() {
            if !p.set_name.is_empty() && p.namespace.is_empty() {
                return Err(Error::parameter(format!(
                    "privilege {:?} has a set scope `{}` without a namespace",
                    p.code, p.set_name
                )));
            }
        } else if !p.namespace.is_empty() || !p.set_name.is_empty() {
            return Err(Error::parameter(format!(
                "privilege {:?} is global and cannot be scoped to a namespace or set",
                p.code
            )));
        }
    }
    Ok(())
}

/// Send a message and return the result code of the single-message reply.
fn execute(conn: &mut Connection, msg: AdminMessage, timeout: Duration) -> Result<()> {
    conn.set_timeout(deadline_after(timeout), timeout);
    conn.write(&msg.finish())?;
    let (_, len) = conn.read_message()?;
    let body = conn.body(len);
    if body.len() < ADMIN_HEADER_SIZE {
        conn.close();
        return Err(Error::parse("truncated admin reply"));
    }
    match body[1] {
        0 => Ok(()),
        code => Err(Error::server(ResultCode::from_code(code as i32))),
    }
}

fn deadline_after(timeout: Duration) -> Option<Instant> {
    (!timeout.is_zero()).then(|| Instant::now() + timeout)
}

/// Log in and obtain a session token.
///
/// Returns `None` when the server has security disabled.
pub fn login(conn: &mut Connection, policy: &ClientPolicy, hashed_password: &str) -> Result<Option<SessionToken>> {
    let user = policy.user.as_deref().unwrap_or("");
    let msg = match policy.auth_mode {
        AuthMode::Internal => {
            let mut m = AdminMessage::new(LOGIN, 2);
            m.field_str(USER, user);
            m.field_str(CREDENTIAL, hashed_password);
            m
        }
        AuthMode::External => {
            let mut m = AdminMessage::new(LOGIN, 3);
            m.field_str(USER, user);
            m.field_str(CREDENTIAL, hashed_password);
            m.field_str(CLEAR_PASSWORD, policy.password.as_deref().unwrap_or(""));
            m
        }
        AuthMode::Pki => AdminMessage::new(LOGIN, 0),
    };

    conn.set_timeout(deadline_after(policy.login_timeout), policy.login_timeout);
    conn.write(&msg.finish())?;
    let (_, len) = conn.read_message()?;
    let body = conn.body(len).to_vec();
    if body.len() < ADMIN_HEADER_SIZE {
        conn.close();
        return Err(Error::parse("truncated login reply"));
    }

    let code = ResultCode::from_code(body[1] as i32);
    if code == ResultCode::SecurityNotEnabled {
        debug!("security not enabled on {}", conn.addr());
        return Ok(None);
    }
    if code != ResultCode::Ok {
        conn.close();
        return Err(ConnectionError::AuthFailed(code.to_string()).into());
    }

    let field_count = body[3];
    let mut reader = MessageReader::new(&body[ADMIN_HEADER_SIZE..]);
    let mut token = None;
    let mut ttl = 0u32;
    for _ in 0..field_count {
        let len = reader.read_u32()? as usize;
        if len == 0 {
            return Err(Error::parse("empty admin field"));
        }
        let id = reader.read_u8()?;
        let data = reader.read_bytes(len - 1)?;
        match id {
            SESSION_TOKEN => token = Some(data.to_vec()),
            SESSION_TTL if data.len() == 4 => {
                ttl = u32::from_be_bytes([data[0], data[1], data[2], data[3]])
            }
            _ => {}
        }
    }

    let token = token.ok_or_else(|| {
        Error::from(ConnectionError::AuthFailed("login reply has no session token".into()))
    })?;
    Ok(Some(SessionToken {
        token,
        expiration: token_expiration(ttl),
    }))
}

/// Expire the client copy a minute before the server's.
fn token_expiration(ttl_secs: u32) -> Option<Instant> {
    if ttl_secs == 0 {
        return None;
    }
    let secs = (ttl_secs as i64 - 60).max(1) as u64;
    Some(Instant::now() + Duration::from_secs(secs))
}

/// Authenticate a new connection with an existing session token.
pub fn authenticate(conn: &mut Connection, user: &str, token: &[u8], timeout: Duration) -> Result<()> {
    let mut m = AdminMessage::new(AUTHENTICATE, 2);
    m.field_str(USER, user);
    m.field_bytes(SESSION_TOKEN, token);
    execute(conn, m, timeout).map_err(|e| {
        conn.close();
        match e.result_code() {
            ResultCode::SecurityNotEnabled => e,
            code => ConnectionError::AuthFailed(code.to_string()).into(),
        }
    })
}

pub fn create_user(conn: &mut Connection, timeout: Duration, user: &str, password: &str, roles: &[&str]) -> Result<()> {
    let hash = hash_password(password)?;
    let mut m = AdminMessage::new(CREATE_USER, 3);
    m.field_str(USER, user);
    m.field_str(PASSWORD, &hash);
    m.field_roles(roles);
    execute(conn, m, timeout)
}

pub fn drop_user(conn: &mut Connection, timeout: Duration, user: &str) -> Result<()> {
    let mut m = AdminMessage::new(DROP_USER, 1);
    m.field_str(USER, user);
    execute(conn, m, timeout)
}

/// Change a password. Changing one's own password proves the old one.
pub fn change_password(
    conn: &mut Connection,
    timeout: Duration,
    current_user: Option<(&str, &str)>,
    user: &str,
    password: &str,
) -> Result<()> {
    let hash = hash_password(password)?;
    let m = match current_user {
        Some((me, old_hash)) if me == user => {
            let mut m = AdminMessage::new(CHANGE_PASSWORD, 3);
            m.field_str(USER, user);
            m.field_str(OLD_PASSWORD, old_hash);
            m.field_str(PASSWORD, &hash);
            m
        }
        _ => {
            let mut m = AdminMessage::new(SET_PASSWORD, 2);
            m.field_str(USER, user);
            m.field_str(PASSWORD, &hash);
            m
        }
    };
    execute(conn, m, timeout)
}

pub fn grant_roles(conn: &mut Connection, timeout: Duration, user: &str, roles: &[&str]) -> Result<()> {
    let mut m = AdminMessage::new(GRANT_ROLES, 2);
    m.field_str(USER, user);
    m.field_roles(roles);
    execute(conn, m, timeout)
}

pub fn revoke_roles(conn: &mut Connection, timeout: Duration, user: &str, roles: &[&str]) -> Result<()> {
    let mut m = AdminMessage::new(REVOKE_ROLES, 2);
    m.field_str(USER, user);
    m.field_roles(roles);
    execute(conn, m, timeout)
}

pub fn create_role(
    conn: &mut Connection,
    timeout: Duration,
    role: &str,
    privileges: &[Privilege],
    whitelist: &[&str],
    read_quota: u32,
    write_quota: u32,
) -> Result<()> {
    let mut field_count = 1;
    if !privileges.is_empty() {
        field_count += 1;
    }
    if !whitelist.is_empty() {
        field_count += 1;
    }
    if read_quota > 0 {
        field_count += 1;
    }
    if write_quota > 0 {
        field_count += 1;
    }
    let mut m = AdminMessage::new(CREATE_ROLE, field_count);
    m.field_str(ROLE, role);
    if !privileges.is_empty() {
        m.field_privileges(privileges)?;
    }
    if !whitelist.is_empty() {
        m.field_str(WHITELIST, &whitelist.join(","));
    }
    if read_quota > 0 {
        m.field_u32(READ_QUOTA, read_quota);
    }
    if write_quota > 0 {
        m.field_u32(WRITE_QUOTA, write_quota);
    }
    execute(conn, m, timeout)
}

pub fn drop_role(conn: &mut Connection, timeout: Duration, role: &str) -> Result<()> {
    let mut m = AdminMessage::new(DROP_ROLE, 1);
    m.field_str(ROLE, role);
    execute(conn, m, timeout)
}

pub fn grant_privileges(conn: &mut Connection, timeout: Duration, role: &str, privileges: &[Privilege]) -> Result<()> {
    let mut m = AdminMessage::new(GRANT_PRIVILEGES, 2);
    m.field_str(ROLE, role);
    m.field_privileges(privileges)?;
    execute(conn, m, timeout)
}

pub fn revoke_privileges(conn: &mut Connection, timeout: Duration, role: &str, privileges: &[Privilege]) -> Result<()> {
    let mut m = AdminMessage::new(REVOKE_PRIVILEGES, 2);
    m.field_str(ROLE, role);
    m.field_privileges(privileges)?;
    execute(conn, m, timeout)
}

/// Replace the role's client address whitelist; an empty list removes it.
pub fn set_whitelist(conn: &mut Connection, timeout: Duration, role: &str, whitelist: &[&str]) -> Result<()> {
    let mut m = AdminMessage::new(SET_WHITELIST, if whitelist.is_empty() { 1 } else { 2 });
    m.field_str(ROLE, role);
    if !whitelist.is_empty() {
        m.field_str(WHITELIST, &whitelist.join(","));
    }
    execute(conn, m, timeout)
}

pub fn set_quotas(conn: &mut Connection, timeout: Duration, role: &str, read_quota: u32, write_quota: u32) -> Result<()> {
    let mut m = AdminMessage::new(SET_QUOTAS, 3);
    m.field_str(ROLE, role);
    m.field_u32(READ_QUOTA, read_quota);
    m.field_u32(WRITE_QUOTA, write_quota);
    execute(conn, m, timeout)
}

/// Query one user, or all users when `user` is `None`.
pub fn query_users(conn: &mut Connection, timeout: Duration, user: Option<&str>) -> Result<Vec<User>> {
    let mut m = AdminMessage::new(QUERY_USERS, u8::from(user.is_some()));
    if let Some(u) = user {
        m.field_str(USER, u);
    }
    let records = execute_query(conn, m, timeout)?;
    let mut users = Vec::with_capacity(records.len());
    for fields in records {
        let mut u = User::default();
        for (id, data) in fields {
            let mut r = MessageReader::new(&data);
            match id {
                USER => u.user = String::from_utf8_lossy(&data).into_owned(),
                ROLES => u.roles = read_strings(&mut r)?,
                READ_INFO => u.read_info = read_u32s(&mut r)?,
                WRITE_INFO => u.write_info = read_u32s(&mut r)?,
                CONNECTIONS => u.conns_in_use = r.read_u32()?,
                _ => {}
            }
        }
        if !u.user.is_empty() {
            users.push(u);
        }
    }
    Ok(users)
}

/// Query one role, or all roles when `role` is `None`.
pub fn query_roles(conn: &mut Connection, timeout: Duration, role: Option<&str>) -> Result<Vec<Role>> {
    let mut m = AdminMessage::new(QUERY_ROLES, u8::from(role.is_some()));
    if let Some(r) = role {
        m.field_str(ROLE, r);
    }
    let records = execute_query(conn, m, timeout)?;
    let mut roles = Vec::with_capacity(records.len());
    for fields in records {
        let mut role = Role::default();
        for (id, data) in fields {
            let mut r = MessageReader::new(&data);
            match id {
                ROLE => role.name = String::from_utf8_lossy(&data).into_owned(),
                PRIVILEGES => role.privileges = read_privileges(&mut r)?,
                WHITELIST => {
                    role.whitelist = String::from_utf8_lossy(&data)
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                READ_QUOTA => role.read_quota = r.read_u32()?,
                WRITE_QUOTA => role.write_quota = r.read_u32()?,
                _ => {}
            }
        }
        if !role.name.is_empty() {
            roles.push(role);
        }
    }
    Ok(roles)
}

type AdminFields = Vec<(u8, Vec<u8>)>;

/// Send a query and collect the fields of every returned record.
fn execute_query(conn: &mut Connection, msg: AdminMessage, timeout: Duration) -> Result<Vec<AdminFields>> {
    conn.set_timeout(deadline_after(timeout), timeout);
    conn.write(&msg.finish())?;
    let mut out = Vec::new();
    loop {
        let (_, len) = conn.read_message()?;
        let body = conn.body(len).to_vec();
        let mut reader = MessageReader::new(&body);
        while !reader.is_empty() {
            let header = reader.read_bytes(ADMIN_HEADER_SIZE)?;
            let code = header[1];
            if code == QUERY_END {
                return Ok(out);
            }
            if code != 0 {
                return Err(Error::server(ResultCode::from_code(code as i32)));
            }
            let field_count = header[3];
            let mut fields = Vec::with_capacity(field_count as usize);
            for _ in 0..field_count {
                let flen = reader.read_u32()? as usize;
                if flen == 0 {
                    return Err(Error::parse("empty admin field"));
                }
                let id = reader.read_u8()?;
                fields.push((id, reader.read_bytes(flen - 1)?.to_vec()));
            }
            out.push(fields);
        }
    }
}

fn read_strings(r: &mut MessageReader<'_>) -> Result<Vec<String>> {
    let count = r.read_u8()?;
    (0..count)
        .map(|_| {
            let len = r.read_u8()? as usize;
            Ok(String::from_utf8_lossy(r.read_bytes(len)?).into_owned())
        })
        .collect()
}

fn read_u32s(r: &mut MessageReader<'_>) -> Result<Vec<u32>> {
    let count = r.read_u8()?;
    (0..count).map(|_| r.read_u32()).collect()
}

fn read_privileges(r: &mut MessageReader<'_>) -> Result<Vec<Privilege>> {
    let count = r.read_u8()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let raw = r.read_u8()?;
        let code = PrivilegeCode::from_u8(raw)
            .ok_or_else(|| Error::parse(format!("unknown privilege code {}", raw)))?;
        let mut p = Privilege::new(code);
        if code.can_scope() {
            let ns_len = r.read_u8()? as usize;
            p.namespace = String::from_utf8_lossy(r.read_bytes(ns_len)?).into_owned();
            let set_len = r.read_u8()? as usize;
            p.set_name = String::from_utf8_lossy(r.read_bytes(set_len)?).into_owned();
        }
        out.push(p);
    }
    Ok(out)
}
