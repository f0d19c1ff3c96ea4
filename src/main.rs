//! shardline - command line client for a partitioned key-value cluster
//!
//! Connects to the cluster from one or more seed hosts and runs a single
//! command: info, node listing, record get/put/delete or a scan.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::{json, Map};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use shardline::config::{CliArgs, Command};
use shardline::{
    BasePolicy, Bin, Client, ClientPolicy, InfoPolicy, Key, Record, ScanPolicy, Value,
    WritePolicy,
};

fn setup_logging(verbose: bool, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Integer keys and values are detected; everything else is a string.
fn parse_value(text: &str) -> Value {
    text.parse::<i64>()
        .map(Value::Int)
        .unwrap_or_else(|_| Value::String(text.to_string()))
}

fn parse_bins(specs: &[String]) -> Result<Vec<Bin>> {
    specs
        .iter()
        .map(|spec| match spec.split_once('=') {
            Some((name, value)) if !name.is_empty() => Ok(Bin::new(name, parse_value(value))),
            _ => bail!("bin `{}` is not of the form name=value", spec),
        })
        .collect()
}

fn value_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::String(s) | Value::GeoJson(s) => json!(s),
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_json).collect()),
        other => json!(other.to_string()),
    }
}

fn record_json(record: &Record) -> serde_json::Value {
    let bins: Map<String, serde_json::Value> = record
        .bins
        .iter()
        .map(|(name, value)| (name.clone(), value_json(value)))
        .collect();
    json!({
        "generation": record.generation,
        "ttl": record.expiration,
        "bins": bins,
    })
}

fn run() -> Result<()> {
    let args = CliArgs::parse();
    setup_logging(args.verbose, args.quiet);

    let (policy, hosts): (ClientPolicy, _) =
        ClientPolicy::from_cli(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let base = BasePolicy {
        total_timeout: Duration::from_millis(args.total_timeout_ms),
        replica: args.replica,
        ..Default::default()
    };

    let client = Client::new(policy, hosts).context("cannot connect to the cluster")?;
    info!("Connected to nodes {:?}", client.node_names());

    match &args.command {
        Command::Info { names } => {
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut out = BTreeMap::new();
            for node in client.nodes() {
                let answers = client.request_info(&InfoPolicy::default(), &node, &names)?;
                out.insert(node.name().to_string(), answers.into_iter().collect::<BTreeMap<_, _>>());
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Nodes => {
            println!("{}", serde_json::to_string_pretty(&client.stats())?);
        }
        Command::Get {
            namespace,
            set,
            key,
            bins,
        } => {
            let key = Key::new(namespace.as_str(), set.as_str(), parse_value(key))?;
            let names: Vec<&str> = bins.iter().map(String::as_str).collect();
            let wanted = (!names.is_empty()).then_some(names.as_slice());
            match client.get(&base, &key, wanted) {
                Ok(record) => println!("{}", serde_json::to_string_pretty(&record_json(&record))?),
                Err(e) if e.is_key_not_found() => bail!("record not found"),
                Err(e) => return Err(e.into()),
            }
        }
        Command::Put {
            namespace,
            set,
            key,
            bins,
            ttl,
        } => {
            let key = Key::new(namespace.as_str(), set.as_str(), parse_value(key))?;
            let write = WritePolicy {
                base: base.clone(),
                expiration: ttl.unwrap_or_default(),
                ..Default::default()
            };
            client.put(&write, &key, &parse_bins(bins)?)?;
            info!("Stored {} bin(s)", bins.len());
        }
        Command::Delete {
            namespace,
            set,
            key,
        } => {
            let key = Key::new(namespace.as_str(), set.as_str(), parse_value(key))?;
            let write = WritePolicy {
                base: base.clone(),
                ..Default::default()
            };
            let existed = client.delete(&write, &key)?;
            println!("{}", json!({ "deleted": existed }));
        }
        Command::Scan {
            namespace,
            set,
            max_records,
        } => {
            let scan = ScanPolicy {
                max_records: *max_records,
                ..Default::default()
            };
            let set = set.as_deref().unwrap_or("");
            let mut count = 0u64;
            for record in client.scan_all(&scan, namespace, set, &[])? {
                println!("{}", record_json(&record?));
                count += 1;
            }
            info!("Scanned {} record(s)", count);
        }
    }

    client.close();
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
