use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

use crate::StoreError;

/*
 * The configuration is a plain text file of `key: value` lines.
 * Unknown keys are ignored; `#` starts a comment.
 *
 *   node_id: 2
 *   pmem_file: /mnt/pmem0/ridge
 *   total_pm: 17179869184
 *   available_pm: 8589934592
 *   addr: 10.0.0.2:7000
 *   monitor: 10.0.0.1:6000
 */

/// Engine-side configuration.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// 1..=63; 0 is the monitor, 0xff clients
    pub node_id: u8,
    /// unset means DRAM-backed (anonymous mapping)
    pub pmem_file: Option<PathBuf>,
    pub total_pm: u64,
    pub available_pm: u64,
    pub addr: SocketAddrV4,
    pub monitor: SocketAddrV4,
    pub erpc_port: Option<u16>,
    pub erpc_listen_port: Option<u16>,
    pub rpc_uri: Option<String>,
    pub dev_name: Option<String>,
    pub ib_port: Option<u32>,
    pub gid_idx: Option<u32>,
}

impl NodeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path).map_err(StoreError::Open)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, StoreError> {
        let node_id = required_int::<u64>(content, "node_id")?;
        if !(1..=63).contains(&node_id) {
            return Err(StoreError::ConfigInvalid(format!(
                "node_id {node_id} outside [1, 63]"
            )));
        }

        Ok(Self {
            node_id: node_id as u8,
            pmem_file: field(content, "pmem_file").map(PathBuf::from),
            total_pm: required_int(content, "total_pm")?,
            available_pm: required_int(content, "available_pm")?,
            addr: required_sockaddr(content, "addr")?,
            monitor: required_sockaddr(content, "monitor")?,
            erpc_port: optional_int(content, "erpc_port")?,
            erpc_listen_port: optional_int(content, "erpc_listen_port")?,
            rpc_uri: field(content, "rpc_uri"),
            dev_name: field(content, "dev_name"),
            ib_port: optional_int(content, "ib_port")?,
            gid_idx: optional_int(content, "gid_idx")?,
        })
    }
}

/// Monitor-side range configuration: a node count and one `range:`
/// line per partition, `range: <start key>,<node id>`.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub node_num: usize,
    pub ranges: Vec<(Vec<u8>, u8)>,
}

impl MonitorConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path).map_err(StoreError::Open)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, StoreError> {
        let node_num = required_int::<usize>(content, "node_num")?;

        let mut ranges = Vec::new();
        for (key, value) in entries(content) {
            if key != "range" {
                continue;
            }
            let (start, node) = value.split_once(',').ok_or_else(|| {
                StoreError::ConfigInvalid(format!("range entry '{value}' is not 'key,node_id'"))
            })?;
            let node: u8 = node.trim().parse().map_err(|_| {
                StoreError::ConfigInvalid(format!("range node id '{}' is not a number", node.trim()))
            })?;
            if !(1..=63).contains(&node) {
                return Err(StoreError::ConfigInvalid(format!(
                    "range node id {node} outside [1, 63]"
                )));
            }
            ranges.push((start.trim().as_bytes().to_vec(), node));
        }
        if ranges.is_empty() {
            return Err(StoreError::ConfigInvalid(
                "no range entries configured".into(),
            ));
        }
        Ok(Self { node_num, ranges })
    }
}

fn entries(content: &str) -> impl Iterator<Item = (&str, &str)> {
    content.lines().filter_map(|line| {
        let line = line.split('#').next().unwrap_or("").trim();
        let (key, value) = line.split_once(':')?;
        Some((key.trim(), value.trim()))
    })
}

fn field(content: &str, name: &str) -> Option<String> {
    entries(content)
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

fn required<'a>(content: &'a str, name: &str) -> Result<&'a str, StoreError> {
    entries(content)
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .ok_or_else(|| StoreError::ConfigInvalid(format!("missing field '{name}'")))
}

fn required_int<T: std::str::FromStr>(content: &str, name: &str) -> Result<T, StoreError> {
    let value = required(content, name)?;
    value
        .parse()
        .map_err(|_| StoreError::ConfigInvalid(format!("field '{name}' value '{value}' is not a number")))
}

fn optional_int<T: std::str::FromStr>(content: &str, name: &str) -> Result<Option<T>, StoreError> {
    match field(content, name) {
        None => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| {
            StoreError::ConfigInvalid(format!("field '{name}' value '{value}' is not a number"))
        }),
    }
}

fn required_sockaddr(content: &str, name: &str) -> Result<SocketAddrV4, StoreError> {
    let value = required(content, name)?;
    if let Ok(addr) = value.parse::<SocketAddrV4>() {
        return Ok(addr);
    }
    // a bare IP is accepted with port 0
    value
        .parse::<Ipv4Addr>()
        .map(|ip| SocketAddrV4::new(ip, 0))
        .map_err(|_| {
            StoreError::ConfigInvalid(format!("field '{name}' value '{value}' is not ip[:port]"))
        })
}
