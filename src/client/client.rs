//! Public client API
//!
//! A [`Client`] owns one tended [`Cluster`] and exposes record, batch,
//! scan, query, info and security operations on it. Every call blocks the
//! caller's thread; fan-out work runs on scoped worker threads.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, info};

use super::admin::{self, hash_password, validate_privileges, Privilege, Role, User};
use super::connection::Connection;
use super::tasks::{info_failure, IndexTask, UdfTask};
use crate::cluster::{Cluster, Host, Node};
use crate::command::batch::{
    execute_batch, execute_batch_complex, exists_from, BatchReadRecord,
};
use crate::command::executor::execute;
use crate::command::query::{start_query, start_query_node};
use crate::command::scan::{start_partitions, StreamRequest};
use crate::command::{
    BatchRead, BatchResults, Bin, IndexCollectionType, IndexType, Key, Operation, OperationType,
    PartitionFilter, Record, Recordset, SingleCommand, SingleOp, Statement,
};
use crate::config::{
    AdminPolicy, BasePolicy, BatchPolicy, ClientPolicy, InfoPolicy, QueryPolicy, ScanPolicy,
    WritePolicy,
};
use crate::metrics::ClusterStats;
use crate::utils::{Error, Result, ResultCode};

/// UDF source language
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdfLanguage {
    Lua,
}

impl UdfLanguage {
    fn as_str(&self) -> &'static str {
        match self {
            UdfLanguage::Lua => "LUA",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        s.eq_ignore_ascii_case("lua").then_some(UdfLanguage::Lua)
    }
}

/// A UDF package registered on the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdfMeta {
    pub filename: String,
    pub hash: String,
    pub language: UdfLanguage,
}

/// Handle to a cluster
pub struct Client {
    cluster: Arc<Cluster>,
}

impl Client {
    /// Connect through the seed hosts and start tending the cluster.
    pub fn new(policy: ClientPolicy, hosts: Vec<Host>) -> Result<Self> {
        let cluster = Cluster::connect(policy, hosts)?;
        Ok(Self { cluster })
    }

    /// Wrap a cluster that is already connected.
    pub fn from_cluster(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn is_connected(&self) -> bool {
        self.cluster.is_connected()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.cluster.nodes().iter().cloned().collect()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.cluster.node_names()
    }

    pub fn get_node(&self, name: &str) -> Result<Arc<Node>> {
        self.cluster.get_node_by_name(name)
    }

    /// Fill every node's pool with up to `count` connections; returns how
    /// many were opened.
    pub fn warm_up(&self, count: usize) -> Result<usize> {
        self.cluster.warm_up(count)
    }

    pub fn stats(&self) -> ClusterStats {
        self.cluster.stats()
    }

    /// Stop tending and close every connection.
    pub fn close(&self) {
        if !self.cluster.is_closed() {
            info!("Closing client");
            self.cluster.close();
        }
    }

    // ===== Single record =====

    /// Write bins, creating the record if needed.
    pub fn put(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> Result<()> {
        self.put_with(policy, key, bins, OperationType::Write)
    }

    /// Append string or blob values to existing bins.
    pub fn append(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> Result<()> {
        self.put_with(policy, key, bins, OperationType::Append)
    }

    pub fn prepend(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> Result<()> {
        self.put_with(policy, key, bins, OperationType::Prepend)
    }

    /// Add integer values to existing bins.
    pub fn add(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> Result<()> {
        self.put_with(policy, key, bins, OperationType::Add)
    }

    fn put_with(&self, policy: &WritePolicy, key: &Key, bins: &[Bin], op_type: OperationType) -> Result<()> {
        if bins.is_empty() {
            return Err(Error::parameter("no bins to write"));
        }
        let op = SingleOp::Put(bins.to_vec(), op_type);
        let mut cmd = SingleCommand::write(&self.cluster, policy, key, op)?;
        execute(&self.cluster, &mut cmd)
    }

    /// Read a record; all bins when `bins` is `None`.
    pub fn get(&self, policy: &BasePolicy, key: &Key, bins: Option<&[&str]>) -> Result<Record> {
        let names = bins.map(|b| b.iter().map(|s| s.to_string()).collect());
        self.read_record(policy, key, SingleOp::Get(names))
    }

    /// Read generation and expiration only.
    pub fn get_header(&self, policy: &BasePolicy, key: &Key) -> Result<Record> {
        self.read_record(policy, key, SingleOp::GetHeader)
    }

    fn read_record(&self, policy: &BasePolicy, key: &Key, op: SingleOp) -> Result<Record> {
        let mut cmd = SingleCommand::read(&self.cluster, policy, key, op)?;
        execute(&self.cluster, &mut cmd)?;
        cmd.record
            .take()
            .ok_or_else(|| Error::parse("successful read returned no record"))
    }

    pub fn exists(&self, policy: &BasePolicy, key: &Key) -> Result<bool> {
        let mut cmd = SingleCommand::read(&self.cluster, policy, key, SingleOp::Exists)?;
        execute(&self.cluster, &mut cmd)?;
        Ok(cmd.existed)
    }

    /// Delete a record; returns whether it existed.
    pub fn delete(&self, policy: &WritePolicy, key: &Key) -> Result<bool> {
        let mut cmd = SingleCommand::write(&self.cluster, policy, key, SingleOp::Delete)?;
        execute(&self.cluster, &mut cmd)?;
        Ok(cmd.existed)
    }

    /// Reset the record's expiration and bump its generation.
    pub fn touch(&self, policy: &WritePolicy, key: &Key) -> Result<()> {
        let mut cmd = SingleCommand::write(&self.cluster, policy, key, SingleOp::Touch)?;
        execute(&self.cluster, &mut cmd)
    }

    /// Apply several operations to one record atomically. Results of
    /// operations on the same bin come back as a list.
    pub fn operate(&self, policy: &WritePolicy, key: &Key, ops: &[Operation]) -> Result<Record> {
        if ops.is_empty() {
            return Err(Error::parameter("no operations"));
        }
        let mut cmd = SingleCommand::write(&self.cluster, policy, key, SingleOp::Operate(ops.to_vec()))?;
        execute(&self.cluster, &mut cmd)?;
        Ok(cmd
            .record
            .take()
            .unwrap_or_else(|| Record::new(Some(key.clone()), Default::default(), 0, 0)))
    }

    // ===== Batch =====

    /// Read many records; missing ones are `None`, in key order.
    pub fn batch_get(
        &self,
        policy: &BatchPolicy,
        keys: &[Key],
        bins: Option<&[&str]>,
    ) -> Result<BatchResults<Option<Record>>> {
        let names = bins.map(|b| b.iter().map(|s| s.to_string()).collect());
        execute_batch(&self.cluster, policy, keys, &BatchRead::Get(names))
    }

    pub fn batch_get_header(&self, policy: &BatchPolicy, keys: &[Key]) -> Result<BatchResults<Option<Record>>> {
        execute_batch(&self.cluster, policy, keys, &BatchRead::Header)
    }

    pub fn batch_exists(&self, policy: &BatchPolicy, keys: &[Key]) -> Result<BatchResults<bool>> {
        execute_batch(&self.cluster, policy, keys, &BatchRead::Exists).map(exists_from)
    }

    /// Read many records, each with its own bin selection. Results are
    /// stored in the records; with partial results allowed, the chained
    /// node errors are returned.
    pub fn batch_get_complex(
        &self,
        policy: &BatchPolicy,
        records: &mut [BatchReadRecord],
    ) -> Result<Option<Error>> {
        execute_batch_complex(&self.cluster, policy, records)
    }

    // ===== Scan and query =====

    /// Scan a namespace, or one set of it when `set_name` is not empty.
    pub fn scan_all(
        &self,
        policy: &ScanPolicy,
        namespace: &str,
        set_name: &str,
        bins: &[&str],
    ) -> Result<Recordset> {
        self.scan_partitions(policy, PartitionFilter::all(), namespace, set_name, bins)
    }

    /// Scan the partitions of `filter`. The filter keeps its progress, so
    /// passing it again resumes after the last record returned.
    pub fn scan_partitions(
        &self,
        policy: &ScanPolicy,
        filter: PartitionFilter,
        namespace: &str,
        set_name: &str,
        bins: &[&str],
    ) -> Result<Recordset> {
        let request = StreamRequest::scan(namespace, set_name, &owned(bins));
        start_partitions(Arc::clone(&self.cluster), policy.clone(), request, filter, None)
    }

    /// Scan only the partitions mastered by one node.
    pub fn scan_node(
        &self,
        policy: &ScanPolicy,
        node: &str,
        namespace: &str,
        set_name: &str,
        bins: &[&str],
    ) -> Result<Recordset> {
        let node = self.cluster.get_node_by_name(node)?;
        let request = StreamRequest::scan(namespace, set_name, &owned(bins));
        start_partitions(
            Arc::clone(&self.cluster),
            policy.clone(),
            request,
            PartitionFilter::all(),
            Some(node),
        )
    }

    pub fn query(&self, policy: &QueryPolicy, statement: &Statement) -> Result<Recordset> {
        start_query(Arc::clone(&self.cluster), policy, statement, None)
    }

    /// Query one node. Without an index filter only the partitions the node
    /// masters are read.
    pub fn query_node(
        &self,
        policy: &QueryPolicy,
        node: &Arc<Node>,
        statement: &Statement,
    ) -> Result<Recordset> {
        start_query_node(Arc::clone(&self.cluster), policy, statement, Arc::clone(node))
    }

    /// Query by partition; resumable like [`Client::scan_partitions`].
    pub fn query_partitions(
        &self,
        policy: &QueryPolicy,
        statement: &Statement,
        filter: PartitionFilter,
    ) -> Result<Recordset> {
        start_query(Arc::clone(&self.cluster), policy, statement, Some(filter))
    }

    // ===== Info =====

    /// Run info commands on one node.
    pub fn request_info(
        &self,
        policy: &InfoPolicy,
        node: &Node,
        names: &[&str],
    ) -> Result<std::collections::HashMap<String, String>> {
        node.request_info(names, policy.timeout)
    }

    /// Run one info command on a random node and return its answer.
    fn info_command(&self, policy: &InfoPolicy, command: &str) -> Result<String> {
        let node = self.cluster.random_node()?;
        debug!("info `{}` on node {}", command, node.name());
        let mut info = node.request_info(&[command], policy.timeout)?;
        Ok(info.remove(command).unwrap_or_default())
    }

    /// Remove all records of a namespace or set. With `before`, only
    /// records last updated before that time are removed.
    pub fn truncate(
        &self,
        policy: &InfoPolicy,
        namespace: &str,
        set_name: &str,
        before: Option<SystemTime>,
    ) -> Result<()> {
        let command = truncate_command(namespace, set_name, before)?;
        let response = self.info_command(policy, &command)?;
        if response.trim().eq_ignore_ascii_case("ok") {
            return Ok(());
        }
        Err(info_failure(&response)
            .unwrap_or_else(|| Error::server_msg(ResultCode::ServerError, response)))
    }

    /// Create a secondary index on a bin.
    pub fn create_index(
        &self,
        policy: &InfoPolicy,
        namespace: &str,
        set_name: &str,
        index_name: &str,
        bin_name: &str,
        index_type: IndexType,
    ) -> Result<IndexTask> {
        self.create_complex_index(
            policy,
            namespace,
            set_name,
            index_name,
            bin_name,
            index_type,
            IndexCollectionType::Default,
        )
    }

    /// Create a secondary index on list elements or map keys or values.
    #[allow(clippy::too_many_arguments)]
    pub fn create_complex_index(
        &self,
        policy: &InfoPolicy,
        namespace: &str,
        set_name: &str,
        index_name: &str,
        bin_name: &str,
        index_type: IndexType,
        collection_type: IndexCollectionType,
    ) -> Result<IndexTask> {
        let command = create_index_command(namespace, set_name, index_name, bin_name, index_type, collection_type);
        let response = self.info_command(policy, &command)?;
        if response.trim().eq_ignore_ascii_case("ok") {
            return Ok(IndexTask::new(Arc::clone(&self.cluster), namespace, index_name));
        }
        Err(info_failure(&response)
            .unwrap_or_else(|| Error::server_msg(ResultCode::IndexGeneric, response)))
    }

    /// Drop a secondary index; dropping an unknown index succeeds.
    pub fn drop_index(&self, policy: &InfoPolicy, namespace: &str, set_name: &str, index_name: &str) -> Result<()> {
        let mut command = format!("sindex-delete:ns={}", namespace);
        if !set_name.is_empty() {
            command.push_str(&format!(";set={}", set_name));
        }
        command.push_str(&format!(";indexname={}", index_name));
        let response = self.info_command(policy, &command)?;
        if response.trim().eq_ignore_ascii_case("ok") {
            return Ok(());
        }
        match info_failure(&response) {
            Some(e) if e.result_code() == ResultCode::IndexNotFound => Ok(()),
            Some(e) => Err(e),
            None => Err(Error::server_msg(ResultCode::IndexGeneric, response)),
        }
    }

    /// Upload a UDF package under `server_path`.
    pub fn register_udf(
        &self,
        policy: &InfoPolicy,
        content: &[u8],
        server_path: &str,
        language: UdfLanguage,
    ) -> Result<UdfTask> {
        let encoded = STANDARD.encode(content);
        let command = format!(
            "udf-put:filename={};content={};content-len={};udf-type={};",
            server_path,
            encoded,
            encoded.len(),
            language.as_str()
        );
        let response = self.info_command(policy, &command)?;
        if let Some(e) = udf_error(&response) {
            return Err(e);
        }
        Ok(UdfTask::new(Arc::clone(&self.cluster), server_path))
    }

    /// Packages registered on a random node.
    pub fn list_udf(&self, policy: &InfoPolicy) -> Result<Vec<UdfMeta>> {
        let response = self.info_command(policy, "udf-list")?;
        parse_udf_list(&response)
    }

    pub fn remove_udf(&self, policy: &InfoPolicy, server_path: &str) -> Result<()> {
        let command = format!("udf-remove:filename={};", server_path);
        let response = self.info_command(policy, &command)?;
        if response.trim().eq_ignore_ascii_case("ok") {
            return Ok(());
        }
        Err(udf_error(&response)
            .or_else(|| info_failure(&response))
            .unwrap_or_else(|| Error::server_msg(ResultCode::UdfBadResponse, response)))
    }

    // ===== Users and roles =====

    /// Run an admin command on a fresh connection that is closed afterwards.
    fn admin<T>(&self, policy: &AdminPolicy, f: impl FnOnce(&mut Connection, Duration) -> Result<T>) -> Result<T> {
        let node = self.cluster.random_node()?;
        let deadline = (!policy.timeout.is_zero()).then(|| Instant::now() + policy.timeout);
        let mut conn = node.get_connection(deadline, policy.timeout)?;
        let result = f(&mut conn, policy.timeout);
        node.invalidate_connection(conn);
        result.map_err(|e| e.with_node(node.name().to_string()))
    }

    pub fn create_user(&self, policy: &AdminPolicy, user: &str, password: &str, roles: &[&str]) -> Result<()> {
        self.admin(policy, |conn, t| admin::create_user(conn, t, user, password, roles))
    }

    pub fn drop_user(&self, policy: &AdminPolicy, user: &str) -> Result<()> {
        self.admin(policy, |conn, t| admin::drop_user(conn, t, user))
    }

    /// Change a user's password. For the user this client logs in as, the
    /// stored credential is updated so new connections keep working.
    pub fn change_password(&self, policy: &AdminPolicy, user: &str, password: &str) -> Result<()> {
        let ctx = Arc::clone(self.cluster.context());
        let own = self.cluster.policy().user.as_deref() == Some(user);
        let old_hash = ctx.password_hash();
        let current = own.then_some((user, old_hash.as_str()));
        self.admin(policy, |conn, t| admin::change_password(conn, t, current, user, password))?;
        if own {
            ctx.set_password_hash(hash_password(password)?);
        }
        Ok(())
    }

    pub fn grant_roles(&self, policy: &AdminPolicy, user: &str, roles: &[&str]) -> Result<()> {
        self.admin(policy, |conn, t| admin::grant_roles(conn, t, user, roles))
    }

    pub fn revoke_roles(&self, policy: &AdminPolicy, user: &str, roles: &[&str]) -> Result<()> {
        self.admin(policy, |conn, t| admin::revoke_roles(conn, t, user, roles))
    }

    pub fn query_user(&self, policy: &AdminPolicy, user: &str) -> Result<Option<User>> {
        let users = self.admin(policy, |conn, t| admin::query_users(conn, t, Some(user)))?;
        Ok(users.into_iter().next())
    }

    pub fn query_users(&self, policy: &AdminPolicy) -> Result<Vec<User>> {
        self.admin(policy, |conn, t| admin::query_users(conn, t, None))
    }

    pub fn create_role(
        &self,
        policy: &AdminPolicy,
        role: &str,
        privileges: &[Privilege],
        whitelist: &[&str],
        read_quota: u32,
        write_quota: u32,
    ) -> Result<()> {
        validate_privileges(privileges)?;
        self.admin(policy, |conn, t| {
            admin::create_role(conn, t, role, privileges, whitelist, read_quota, write_quota)
        })
    }

    pub fn drop_role(&self, policy: &AdminPolicy, role: &str) -> Result<()> {
        self.admin(policy, |conn, t| admin::drop_role(conn, t, role))
    }

    pub fn grant_privileges(&self, policy: &AdminPolicy, role: &str, privileges: &[Privilege]) -> Result<()> {
        validate_privileges(privileges)?;
        self.admin(policy, |conn, t| admin::grant_privileges(conn, t, role, privileges))
    }

    pub fn revoke_privileges(&self, policy: &AdminPolicy, role: &str, privileges: &[Privilege]) -> Result<()> {
        validate_privileges(privileges)?;
        self.admin(policy, |conn, t| admin::revoke_privileges(conn, t, role, privileges))
    }

    pub fn set_whitelist(&self, policy: &AdminPolicy, role: &str, whitelist: &[&str]) -> Result<()> {
        self.admin(policy, |conn, t| admin::set_whitelist(conn, t, role, whitelist))
    }

    pub fn set_quotas(&self, policy: &AdminPolicy, role: &str, read_quota: u32, write_quota: u32) -> Result<()> {
        self.admin(policy, |conn, t| admin::set_quotas(conn, t, role, read_quota, write_quota))
    }

    pub fn query_role(&self, policy: &AdminPolicy, role: &str) -> Result<Option<Role>> {
        let roles = self.admin(policy, |conn, t| admin::query_roles(conn, t, Some(role)))?;
        Ok(roles.into_iter().next())
    }

    pub fn query_roles(&self, policy: &AdminPolicy) -> Result<Vec<Role>> {
        self.admin(policy, |conn, t| admin::query_roles(conn, t, None))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

fn owned(bins: &[&str]) -> Vec<String> {
    bins.iter().map(|s| s.to_string()).collect()
}

fn truncate_command(namespace: &str, set_name: &str, before: Option<SystemTime>) -> Result<String> {
    if namespace.is_empty() {
        return Err(Error::parameter("truncate needs a namespace"));
    }
    let mut command = if set_name.is_empty() {
        format!("truncate-namespace:namespace={}", namespace)
    } else {
        format!("truncate:namespace={};set={}", namespace, set_name)
    };
    if let Some(t) = before {
        let nanos = t
            .duration_since(UNIX_EPOCH)
            .map_err(|_| Error::parameter("truncate time is before the unix epoch"))?
            .as_nanos();
        command.push_str(&format!(";lut={}", nanos));
    }
    Ok(command)
}

fn create_index_command(
    namespace: &str,
    set_name: &str,
    index_name: &str,
    bin_name: &str,
    index_type: IndexType,
    collection_type: IndexCollectionType,
) -> String {
    let mut command = format!("sindex-create:ns={}", namespace);
    if !set_name.is_empty() {
        command.push_str(&format!(";set={}", set_name));
    }
    command.push_str(&format!(";indexname={};numbins=1", index_name));
    if collection_type != IndexCollectionType::Default {
        command.push_str(&format!(";indextype={}", collection_type.as_str()));
    }
    command.push_str(&format!(
        ";indexdata={},{};priority=normal",
        bin_name,
        index_type.as_str()
    ));
    command
}

/// `udf-list` answers `filename=<f>,hash=<h>,type=<lang>;` per package.
fn parse_udf_list(response: &str) -> Result<Vec<UdfMeta>> {
    let mut udfs = Vec::new();
    for entry in response.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (mut filename, mut hash, mut language) = (None, None, None);
        for kv in entry.split(',') {
            match kv.split_once('=') {
                Some(("filename", v)) => filename = Some(v.to_string()),
                Some(("hash", v)) => hash = Some(v.to_string()),
                Some(("type", v)) => language = UdfLanguage::parse(v),
                _ => {}
            }
        }
        match (filename, hash, language) {
            (Some(filename), Some(hash), Some(language)) => udfs.push(UdfMeta {
                filename,
                hash,
                language,
            }),
            _ => {
                return Err(Error::server_msg(
                    ResultCode::ParseError,
                    format!("invalid udf-list entry `{}`", entry),
                ))
            }
        }
    }
    Ok(udfs)
}

/// A failed `udf-put` answers `error=<code>;file=..;line=..;message=<base64>`.
fn udf_error(response: &str) -> Option<Error> {
    if !response.contains("error=") {
        return None;
    }
    let mut message = response.to_string();
    for kv in response.split(';') {
        if let Some(encoded) = kv.strip_prefix("message=") {
            if let Ok(decoded) = STANDARD.decode(encoded.trim()) {
                message = String::from_utf8_lossy(&decoded).into_owned();
            }
        }
    }
    Some(Error::server_msg(ResultCode::UdfBadResponse, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::admin::PrivilegeCode;
    use crate::cluster::PartitionMap;

    #[test]
    fn test_truncate_command() {
        assert_eq!(
            truncate_command("test", "", None).unwrap(),
            "truncate-namespace:namespace=test"
        );
        let at = UNIX_EPOCH + Duration::from_secs(2);
        assert_eq!(
            truncate_command("test", "demo", Some(at)).unwrap(),
            "truncate:namespace=test;set=demo;lut=2000000000"
        );
        assert!(truncate_command("", "demo", None).is_err());
    }

    #[test]
    fn test_create_index_command() {
        let cmd = create_index_command("test", "demo", "age_idx", "age", IndexType::Numeric, IndexCollectionType::Default);
        assert_eq!(
            cmd,
            "sindex-create:ns=test;set=demo;indexname=age_idx;numbins=1;indexdata=age,NUMERIC;priority=normal"
        );
        let cmd = create_index_command("test", "", "tags_idx", "tags", IndexType::String, IndexCollectionType::List);
        assert_eq!(
            cmd,
            "sindex-create:ns=test;indexname=tags_idx;numbins=1;indextype=LIST;indexdata=tags,STRING;priority=normal"
        );
    }

    #[test]
    fn test_udf_error_decodes_message() {
        let encoded = STANDARD.encode("syntax error near 'end'");
        let reply = format!("error=1;file=bad.lua;line=3;message={}", encoded);
        let e = udf_error(&reply).unwrap();
        assert_eq!(e.result_code(), ResultCode::UdfBadResponse);
        assert!(e.to_string().contains("syntax error"));
        assert!(udf_error("").is_none());
    }

    #[test]
    fn test_parse_udf_list() {
        let reply = "filename=a.lua,hash=00ff,type=LUA;filename=b.lua,hash=11,type=LUA;";
        let udfs = parse_udf_list(reply).unwrap();
        assert_eq!(udfs.len(), 2);
        assert_eq!(
            udfs[0],
            UdfMeta {
                filename: "a.lua".into(),
                hash: "00ff".into(),
                language: UdfLanguage::Lua,
            }
        );
        assert_eq!(udfs[1].filename, "b.lua");
        assert!(parse_udf_list("").unwrap().is_empty());

        let err = parse_udf_list("filename=a.lua,type=LUA;").unwrap_err();
        assert_eq!(err.result_code(), ResultCode::ParseError);
    }

    #[test]
    fn test_scoped_global_privilege_fails_before_io() {
        // no nodes: anything that reached the network would fail with a cluster error
        let cluster = Arc::new(Cluster::for_test(ClientPolicy::default(), Vec::new(), PartitionMap::new()));
        let client = Client::from_cluster(cluster);
        let bad = [Privilege::scoped(PrivilegeCode::SysAdmin, "test", "")];
        let err = client
            .create_role(&AdminPolicy::default(), "ops", &bad, &[], 0, 0)
            .unwrap_err();
        assert_eq!(err.result_code(), ResultCode::ParameterError);
        let err = client.drop_role(&AdminPolicy::default(), "ops").unwrap_err();
        assert_ne!(err.result_code(), ResultCode::ParameterError);
    }

    #[test]
    fn test_put_without_bins_is_rejected() {
        let cluster = Arc::new(Cluster::for_test(ClientPolicy::default(), Vec::new(), PartitionMap::new()));
        let client = Client::from_cluster(cluster);
        let key = Key::new("test", "demo", 1i64).unwrap();
        let err = client.put(&WritePolicy::default(), &key, &[]).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::ParameterError);
    }
}
